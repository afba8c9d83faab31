//! Distance helpers on the WGS84 sphere.

use crate::model::Location;

/// Mean Earth radius in meters.
const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Great-circle distance between two locations in meters (haversine).
pub fn haversine_m(a: Location, b: Location) -> f64 {
    let lat1 = a.lat.to_radians();
    let lat2 = b.lat.to_radians();
    let d_lat = (b.lat - a.lat).to_radians();
    let d_lng = (b.lng - a.lng).to_radians();

    let h = (d_lat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (d_lng / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * h.sqrt().atan2((1.0 - h).sqrt())
}

/// Shortest distance in meters from `p` to the segment `a -> b`.
///
/// Uses an equirectangular projection centered on the segment, which is
/// accurate enough for corridor checks over city-scale journeys.
pub fn distance_to_segment_m(p: Location, a: Location, b: Location) -> f64 {
    let mean_lat = ((a.lat + b.lat + p.lat) / 3.0).to_radians();
    let project = |loc: Location| {
        (
            (loc.lng - a.lng).to_radians() * mean_lat.cos() * EARTH_RADIUS_M,
            (loc.lat - a.lat).to_radians() * EARTH_RADIUS_M,
        )
    };

    let (px, py) = project(p);
    let (bx, by) = project(b);
    let len_sq = bx * bx + by * by;

    if len_sq == 0.0 {
        return (px * px + py * py).sqrt();
    }

    let t = ((px * bx + py * by) / len_sq).clamp(0.0, 1.0);
    let (dx, dy) = (px - t * bx, py - t * by);
    (dx * dx + dy * dy).sqrt()
}

/// Total length in meters of a path visiting `points` in order.
pub fn path_length_m<I>(points: I) -> f64
where
    I: IntoIterator<Item = Location>,
{
    let mut total = 0.0;
    let mut previous: Option<Location> = None;
    for point in points {
        if let Some(prev) = previous {
            total += haversine_m(prev, point);
        }
        previous = Some(point);
    }
    total
}
