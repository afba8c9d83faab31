//! Risk factor evaluators.
//!
//! Each factor inspects one slice of the current tick (the point, the recent
//! window, the journey) and returns a [`Verdict`]. Factors are pure and know
//! nothing about weights; calibration lives in the aggregator's weight table.
//!
//! ## Default factors
//!
//! 1. **night_time** - local hour inside the configured band
//! 2. **isolated_area** - far from known-safe zones, or inside an unsafe one
//! 3. **route_deviation** - outside the start→destination corridor
//! 4. **speed_anomaly** - speed implausible for the declared movement state
//! 5. **low_battery** - battery below the critical threshold
//!
//! New factors implement [`RiskFactor`] and are added with
//! [`FactorRegistry::register`]; the aggregator only needs a weight entry.

use chrono::Timelike;

use crate::config::{FactorConfig, IsolationConfig, SpeedConfig, Zone};
use crate::geo;
use crate::model::{Journey, Location, MovementState, TelemetryPoint};

pub const NIGHT_TIME: &str = "night_time";
pub const ISOLATED_AREA: &str = "isolated_area";
pub const ROUTE_DEVIATION: &str = "route_deviation";
pub const SPEED_ANOMALY: &str = "speed_anomaly";
pub const LOW_BATTERY: &str = "low_battery";

/// Everything a factor may look at for one tick.
pub struct FactorContext<'a> {
    pub journey: &'a Journey,
    pub point: &'a TelemetryPoint,
    /// Non-stale window points recorded before `point`, oldest first.
    pub recent: Vec<&'a TelemetryPoint>,
}

/// Outcome of one factor for one tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Verdict {
    Absent,
    /// Strength in `(0, 1]`.
    Present { strength: f64 },
}

impl Verdict {
    pub fn present(strength: f64) -> Self {
        Verdict::Present { strength }
    }

    pub fn strength(&self) -> Option<f64> {
        match self {
            Verdict::Absent => None,
            Verdict::Present { strength } => Some(*strength),
        }
    }
}

/// A factor that fired, ready for aggregation.
#[derive(Debug, Clone, PartialEq)]
pub struct ActiveFactor {
    pub name: String,
    pub strength: f64,
}

impl ActiveFactor {
    pub fn new(name: impl Into<String>, strength: f64) -> Self {
        Self {
            name: name.into(),
            strength,
        }
    }
}

/// A deterministic, side-effect-free risk rule.
pub trait RiskFactor: Send + Sync {
    /// Name used as the key into the weight table.
    fn name(&self) -> &str;

    fn evaluate(&self, ctx: &FactorContext<'_>) -> Verdict;
}

/// Ordered set of factors evaluated on every tick.
#[derive(Default)]
pub struct FactorRegistry {
    factors: Vec<Box<dyn RiskFactor>>,
}

impl FactorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The five default factors configured from `config`.
    pub fn with_defaults(config: &FactorConfig) -> Self {
        let mut registry = Self::new();
        registry
            .register(Box::new(NightTimeFactor::new(
                config.night.start_hour,
                config.night.end_hour,
            )))
            .register(Box::new(IsolatedAreaFactor::new(Box::new(
                SafeZoneIsolation::from_config(&config.isolation),
            ))))
            .register(Box::new(RouteDeviationFactor::new(
                config.route.min_corridor_m,
                config.route.corridor_ratio,
            )))
            .register(Box::new(SpeedAnomalyFactor::new(config.speed.clone())))
            .register(Box::new(LowBatteryFactor::new(
                config.battery.low_battery_percent,
            )));
        registry
    }

    pub fn register(&mut self, factor: Box<dyn RiskFactor>) -> &mut Self {
        self.factors.push(factor);
        self
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.factors.iter().map(|f| f.name())
    }

    pub fn len(&self) -> usize {
        self.factors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factors.is_empty()
    }

    /// Run every factor over the same context and keep the ones that fired.
    pub fn evaluate(&self, ctx: &FactorContext<'_>) -> Vec<ActiveFactor> {
        self.factors
            .iter()
            .filter_map(|factor| {
                factor
                    .evaluate(ctx)
                    .strength()
                    .map(|strength| ActiveFactor::new(factor.name(), strength))
            })
            .collect()
    }
}

// ============================================================================
// night_time
// ============================================================================

pub struct NightTimeFactor {
    start_hour: u32,
    end_hour: u32,
}

impl NightTimeFactor {
    pub fn new(start_hour: u32, end_hour: u32) -> Self {
        Self {
            start_hour,
            end_hour,
        }
    }

    fn in_band(&self, hour: u32) -> bool {
        if self.start_hour < self.end_hour {
            (self.start_hour..self.end_hour).contains(&hour)
        } else if self.start_hour > self.end_hour {
            hour >= self.start_hour || hour < self.end_hour
        } else {
            false
        }
    }
}

impl RiskFactor for NightTimeFactor {
    fn name(&self) -> &str {
        NIGHT_TIME
    }

    fn evaluate(&self, ctx: &FactorContext<'_>) -> Verdict {
        // The timestamp carries the device's offset, so this is local time.
        if self.in_band(ctx.point.timestamp.hour()) {
            Verdict::present(1.0)
        } else {
            Verdict::Absent
        }
    }
}

// ============================================================================
// isolated_area
// ============================================================================

/// Scores how isolated a location is, from 0.0 (not isolated) to 1.0.
///
/// Must be deterministic and monotonic: a more isolated location never scores
/// lower than a less isolated one.
pub trait IsolationModel: Send + Sync {
    fn isolation(&self, location: Location) -> f64;
}

/// Isolation from a static list of safe and unsafe zones.
///
/// Inside an unsafe zone scores 1.0. Otherwise the distance to the nearest
/// safe zone's edge is compared with the isolation radius: within it scores 0,
/// beyond it scores `min(1, d / 2r)`. With no safe zones configured nothing is
/// known to be safe or isolated, and only unsafe zones can fire.
pub struct SafeZoneIsolation {
    isolation_radius_m: f64,
    safe_zones: Vec<Zone>,
    unsafe_zones: Vec<Zone>,
}

impl SafeZoneIsolation {
    pub fn from_config(config: &IsolationConfig) -> Self {
        Self {
            isolation_radius_m: config.isolation_radius_m,
            safe_zones: config.safe_zones.clone(),
            unsafe_zones: config.unsafe_zones.clone(),
        }
    }
}

fn zone_center(zone: &Zone) -> Location {
    Location::new(zone.lat, zone.lng)
}

impl IsolationModel for SafeZoneIsolation {
    fn isolation(&self, location: Location) -> f64 {
        let in_unsafe = self
            .unsafe_zones
            .iter()
            .any(|zone| geo::haversine_m(location, zone_center(zone)) <= zone.radius_m);
        if in_unsafe {
            return 1.0;
        }

        let nearest_edge = self
            .safe_zones
            .iter()
            .map(|zone| (geo::haversine_m(location, zone_center(zone)) - zone.radius_m).max(0.0))
            .fold(f64::INFINITY, f64::min);

        if !nearest_edge.is_finite() || nearest_edge <= self.isolation_radius_m {
            0.0
        } else {
            (nearest_edge / (2.0 * self.isolation_radius_m)).min(1.0)
        }
    }
}

pub struct IsolatedAreaFactor {
    model: Box<dyn IsolationModel>,
}

impl IsolatedAreaFactor {
    pub fn new(model: Box<dyn IsolationModel>) -> Self {
        Self { model }
    }
}

impl RiskFactor for IsolatedAreaFactor {
    fn name(&self) -> &str {
        ISOLATED_AREA
    }

    fn evaluate(&self, ctx: &FactorContext<'_>) -> Verdict {
        let score = self.model.isolation(ctx.point.location);
        if score > 0.0 {
            Verdict::present(score.min(1.0))
        } else {
            Verdict::Absent
        }
    }
}

// ============================================================================
// route_deviation
// ============================================================================

/// Fires when the point leaves the corridor around the straight line from the
/// journey's start to its destination. The corridor widens with the distance
/// traveled, so long winding trips are not flagged for ordinary detours.
pub struct RouteDeviationFactor {
    min_corridor_m: f64,
    corridor_ratio: f64,
}

impl RouteDeviationFactor {
    pub fn new(min_corridor_m: f64, corridor_ratio: f64) -> Self {
        Self {
            min_corridor_m,
            corridor_ratio,
        }
    }
}

impl RiskFactor for RouteDeviationFactor {
    fn name(&self) -> &str {
        ROUTE_DEVIATION
    }

    fn evaluate(&self, ctx: &FactorContext<'_>) -> Verdict {
        let Some(destination) = ctx.journey.destination else {
            return Verdict::Absent;
        };
        let start = ctx.journey.start_location;

        let path = std::iter::once(start)
            .chain(ctx.recent.iter().map(|p| p.location))
            .chain(std::iter::once(ctx.point.location));
        let traveled = geo::path_length_m(path);
        let threshold = self.min_corridor_m.max(self.corridor_ratio * traveled);

        let deviation = geo::distance_to_segment_m(ctx.point.location, start, destination);
        if deviation > threshold {
            Verdict::present((deviation / (2.0 * threshold)).min(1.0))
        } else {
            Verdict::Absent
        }
    }
}

// ============================================================================
// speed_anomaly
// ============================================================================

/// Fires when the speed does not fit the declared movement state: either above
/// the state's plausible limit, or a vehicle stalled for a sustained span.
pub struct SpeedAnomalyFactor {
    config: SpeedConfig,
}

impl SpeedAnomalyFactor {
    pub fn new(config: SpeedConfig) -> Self {
        Self { config }
    }

    fn limit(&self, state: MovementState) -> f64 {
        match state {
            MovementState::Walking => self.config.walking_max_mps,
            MovementState::Running => self.config.running_max_mps,
            MovementState::Cycling => self.config.cycling_max_mps,
            MovementState::Driving => self.config.driving_max_mps,
            MovementState::Stationary => self.config.stationary_max_mps,
        }
    }

    fn is_stalled(&self, point: &TelemetryPoint) -> bool {
        matches!(
            point.movement_state,
            MovementState::Driving | MovementState::Cycling
        ) && point.speed < self.config.stall_speed_mps
    }

    fn sustained_stall(&self, ctx: &FactorContext<'_>) -> bool {
        if !self.is_stalled(ctx.point) {
            return false;
        }

        let mut earliest = ctx.point.key();
        for previous in ctx.recent.iter().rev() {
            if !self.is_stalled(previous) {
                break;
            }
            earliest = previous.key();
        }

        (ctx.point.key() - earliest).num_seconds() >= self.config.stall_span_secs
    }
}

impl RiskFactor for SpeedAnomalyFactor {
    fn name(&self) -> &str {
        SPEED_ANOMALY
    }

    fn evaluate(&self, ctx: &FactorContext<'_>) -> Verdict {
        let ceiling = self.limit(ctx.point.movement_state) * self.config.tolerance;
        if ctx.point.speed > ceiling {
            let overshoot = ctx.point.speed / ceiling - 1.0;
            return Verdict::present((0.5 + overshoot).min(1.0));
        }

        if self.sustained_stall(ctx) {
            return Verdict::present(0.75);
        }

        Verdict::Absent
    }
}

// ============================================================================
// low_battery
// ============================================================================

pub struct LowBatteryFactor {
    threshold_percent: u8,
}

impl LowBatteryFactor {
    pub fn new(threshold_percent: u8) -> Self {
        Self { threshold_percent }
    }
}

impl RiskFactor for LowBatteryFactor {
    fn name(&self) -> &str {
        LOW_BATTERY
    }

    fn evaluate(&self, ctx: &FactorContext<'_>) -> Verdict {
        if ctx.point.battery_level < self.threshold_percent {
            Verdict::present(1.0)
        } else {
            Verdict::Absent
        }
    }
}
