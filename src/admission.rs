//! Telemetry admission: field validation and replay classification.

use tracing::debug;

use crate::error::{EngineError, EngineResult};
use crate::model::{MovementState, TelemetryPoint, TelemetryRequest, TickOutcome};
use crate::session::RollingWindow;
use crate::storage::JourneyStore;

/// How an incoming point relates to what the journey has already seen.
#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    /// Same `(journey_id, timestamp)` was admitted before; carries the stored
    /// outcome to return verbatim.
    Replay(TickOutcome),
    /// New point inside the retention horizon.
    Fresh,
    /// New point older than the horizon. Stored, but it neither feeds the
    /// recent context of later points nor advances the episode state.
    Stale,
    /// The point is in storage but was never committed to the session, e.g.
    /// its request timed out after the write. Carries the stored outcome; the
    /// tick still has to be committed.
    Uncommitted(TickOutcome),
}

/// Turn a wire request into a point, naming the first offending field.
pub fn validate(request: &TelemetryRequest) -> EngineResult<TelemetryPoint> {
    if request.journey_id.trim().is_empty() {
        return Err(invalid("journey_id is required"));
    }

    let timestamp = request
        .timestamp
        .ok_or_else(|| invalid("timestamp is required"))?;
    // Points are keyed by nanoseconds since the epoch.
    if timestamp.timestamp_nanos_opt().is_none() {
        return Err(invalid(format!(
            "timestamp {timestamp} is out of range: must fall between 1677 and 2262"
        )));
    }

    let location = request
        .location
        .ok_or_else(|| invalid("location is required"))?;
    if !location.is_valid() {
        return Err(invalid(format!(
            "location ({}, {}) is out of range: lat must be within [-90, 90], lng within [-180, 180]",
            location.lat, location.lng
        )));
    }

    let speed = request.speed.ok_or_else(|| invalid("speed is required"))?;
    if !speed.is_finite() || speed < 0.0 {
        return Err(invalid(format!("speed must be a non-negative number, got {speed}")));
    }

    let movement_state = request
        .movement_state
        .as_deref()
        .ok_or_else(|| invalid("movement_state is required"))?
        .parse::<MovementState>()
        .map_err(EngineError::Validation)?;

    let battery = request
        .battery_level
        .ok_or_else(|| invalid("battery_level is required"))?;
    let battery_level = u8::try_from(battery)
        .ok()
        .filter(|b| *b <= 100)
        .ok_or_else(|| invalid(format!("battery_level must be within [0, 100], got {battery}")))?;

    if let Some(altitude) = request.altitude {
        if !altitude.is_finite() {
            return Err(invalid("altitude must be a finite number"));
        }
    }
    if let Some(accuracy) = request.accuracy {
        if !accuracy.is_finite() || accuracy < 0.0 {
            return Err(invalid("accuracy must be a non-negative number"));
        }
    }

    Ok(TelemetryPoint {
        timestamp,
        location,
        speed,
        movement_state,
        battery_level,
        altitude: request.altitude,
        accuracy: request.accuracy,
    })
}

fn invalid(message: impl Into<String>) -> EngineError {
    EngineError::Validation(message.into())
}

/// Classify a validated point against the journey's window.
///
/// Points older than everything in the window may have been evicted already,
/// so for those the stored outcome is looked up as well. A window below its
/// bound has never evicted anything, so a stored point older than its oldest
/// entry was never committed.
pub async fn classify(
    window: &RollingWindow,
    store: &dyn JourneyStore,
    journey_id: &str,
    point: &TelemetryPoint,
) -> EngineResult<Admission> {
    let key = point.key();

    if let Some(entry) = window.get(&key) {
        debug!(journey_id, timestamp = %point.timestamp, "Replay found in window");
        return Ok(Admission::Replay(entry.outcome.clone()));
    }

    if window.oldest().is_some_and(|oldest| key < oldest) {
        if let Some(outcome) = store.get_outcome(journey_id, key).await? {
            if !window.is_full() {
                debug!(journey_id, timestamp = %point.timestamp, "Stored point was never committed");
                return Ok(Admission::Uncommitted(outcome));
            }
            debug!(journey_id, timestamp = %point.timestamp, "Replay found in storage");
            return Ok(Admission::Replay(outcome));
        }
    }

    if window.is_stale(key) {
        Ok(Admission::Stale)
    } else {
        Ok(Admission::Fresh)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Location;
    use chrono::DateTime;

    fn request() -> TelemetryRequest {
        TelemetryRequest {
            journey_id: "j-1".to_string(),
            timestamp: Some(DateTime::parse_from_rfc3339("2025-03-01T23:30:00+05:30").unwrap()),
            location: Some(Location::new(23.02, 72.57)),
            speed: Some(1.2),
            movement_state: Some("walking".to_string()),
            battery_level: Some(8),
            altitude: None,
            accuracy: Some(5.0),
        }
    }

    fn expect_invalid(req: TelemetryRequest, field: &str) {
        match validate(&req) {
            Err(EngineError::Validation(msg)) => assert!(msg.contains(field), "{msg}"),
            other => panic!("expected validation error for {field}, got {other:?}"),
        }
    }

    #[test]
    fn test_valid_request() {
        let point = validate(&request()).unwrap();
        assert_eq!(point.movement_state, MovementState::Walking);
        assert_eq!(point.battery_level, 8);
        assert_eq!(point.accuracy, Some(5.0));
    }

    #[test]
    fn test_missing_fields_are_named() {
        expect_invalid(TelemetryRequest { timestamp: None, ..request() }, "timestamp");
        expect_invalid(TelemetryRequest { location: None, ..request() }, "location");
        expect_invalid(TelemetryRequest { speed: None, ..request() }, "speed");
        expect_invalid(
            TelemetryRequest {
                movement_state: None,
                ..request()
            },
            "movement_state",
        );
        expect_invalid(
            TelemetryRequest {
                battery_level: None,
                ..request()
            },
            "battery_level",
        );
        expect_invalid(
            TelemetryRequest {
                journey_id: " ".to_string(),
                ..request()
            },
            "journey_id",
        );
    }

    #[test]
    fn test_out_of_range_values() {
        expect_invalid(
            TelemetryRequest {
                location: Some(Location::new(91.0, 0.0)),
                ..request()
            },
            "location",
        );
        expect_invalid(TelemetryRequest { speed: Some(-1.0), ..request() }, "speed");
        expect_invalid(
            TelemetryRequest {
                speed: Some(f64::NAN),
                ..request()
            },
            "speed",
        );
        expect_invalid(
            TelemetryRequest {
                battery_level: Some(101),
                ..request()
            },
            "battery_level",
        );
        expect_invalid(
            TelemetryRequest {
                battery_level: Some(-3),
                ..request()
            },
            "battery_level",
        );
        expect_invalid(
            TelemetryRequest {
                movement_state: Some("teleporting".to_string()),
                ..request()
            },
            "movement_state",
        );
        expect_invalid(
            TelemetryRequest {
                accuracy: Some(-2.0),
                ..request()
            },
            "accuracy",
        );
        expect_invalid(
            TelemetryRequest {
                timestamp: Some(DateTime::parse_from_rfc3339("2300-01-01T00:00:00Z").unwrap()),
                ..request()
            },
            "timestamp",
        );
    }

    #[test]
    fn test_sub_microsecond_timestamps_stay_distinct() {
        let first = TelemetryRequest {
            timestamp: Some(DateTime::parse_from_rfc3339("2025-03-01T12:00:00.0000001Z").unwrap()),
            ..request()
        };
        let second = TelemetryRequest {
            timestamp: Some(DateTime::parse_from_rfc3339("2025-03-01T12:00:00.0000002Z").unwrap()),
            ..request()
        };
        assert_ne!(validate(&first).unwrap().key(), validate(&second).unwrap().key());
    }

    #[test]
    fn test_battery_bounds_inclusive() {
        for level in [0, 100] {
            let req = TelemetryRequest {
                battery_level: Some(level),
                ..request()
            };
            assert!(validate(&req).is_ok(), "{level}");
        }
    }

    #[tokio::test]
    async fn test_stored_point_behind_a_partial_window_is_uncommitted() {
        use crate::config::WindowConfig;
        use crate::storage::Storage;

        let store = Storage::new("sqlite::memory:").await.unwrap();
        let at = |ts: &str| DateTime::parse_from_rfc3339(ts).unwrap();
        let early = validate(&TelemetryRequest {
            timestamp: Some(at("2025-03-01T23:30:00+05:30")),
            ..request()
        })
        .unwrap();
        let late = validate(&TelemetryRequest {
            timestamp: Some(at("2025-03-01T23:40:00+05:30")),
            ..request()
        })
        .unwrap();
        let outcome = |point: &TelemetryPoint| TickOutcome {
            assessment: crate::model::RiskAssessment {
                risk_level: crate::model::RiskLevel::Low,
                confidence: 0.0,
                score: 0.0,
                factors: vec![],
                timestamp: point.timestamp,
            },
            decision: crate::model::Decision {
                action: crate::model::DecisionAction::SilentMonitoring,
                parallel_actions: vec![],
                message: String::new(),
                timestamp: point.timestamp,
                episode: None,
            },
        };
        store.insert_telemetry("j-1", &early, &outcome(&early)).await.unwrap();

        let config = |max_points| WindowConfig {
            max_points,
            retention_horizon_secs: 1800,
        };
        let mut partial = RollingWindow::new(&config(4));
        partial.insert(late.clone(), outcome(&late));
        let admission = classify(&partial, &store, "j-1", &early).await.unwrap();
        assert_eq!(admission, Admission::Uncommitted(outcome(&early)));

        let mut full = RollingWindow::new(&config(1));
        full.insert(late.clone(), outcome(&late));
        let admission = classify(&full, &store, "j-1", &early).await.unwrap();
        assert_eq!(admission, Admission::Replay(outcome(&early)));

        let admission = classify(&partial, &store, "j-2", &early).await.unwrap();
        assert_eq!(admission, Admission::Fresh);
    }
}
