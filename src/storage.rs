//! Persistence for journeys, telemetry, alerts and the audit trail.
//!
//! The engine talks to storage only through [`JourneyStore`]; [`Storage`] is
//! the SQLite implementation.
//!
//! # Schema
//!
//! - `journeys`: one row per journey, client timestamps kept as RFC 3339 text
//!   so the reported offset survives
//! - `telemetry`: one row per admitted point, keyed by `(journey_id, ts)` with
//!   `ts` in UTC nanoseconds, the same resolution the session window keys
//!   points by; the point and its computed outcome are stored as JSON so
//!   replays return exactly the original outcome
//! - `alerts`: `episode_key` is UNIQUE, which makes automated alerts
//!   idempotent per escalation episode
//! - `audit_log`: append-only record of lifecycle, assessment and alert events

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, Utc};
use sqlx::Row;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};

use crate::error::StorageError;
use crate::model::{
    Alert, AlertPriority, AlertStatus, AlertType, AuditAction, AuditEntry, DashboardStats,
    HistoryEntry, Journey, JourneyStatus, Location, TelemetryPoint, TickOutcome,
};

/// Storage backend used by the engine.
///
/// Implementations must be thread-safe; one store is shared by every journey.
#[async_trait]
pub trait JourneyStore: Send + Sync {
    async fn insert_journey(&self, journey: &Journey) -> Result<(), StorageError>;

    /// Overwrite the mutable fields of an existing journey.
    async fn update_journey(&self, journey: &Journey) -> Result<(), StorageError>;

    /// Mark a journey paused unless it has been completed meanwhile. Returns
    /// `false` when the journey is completed (or gone) and nothing changed.
    async fn pause_journey(
        &self,
        id: &str,
        last_updated: DateTime<Utc>,
    ) -> Result<bool, StorageError>;

    async fn get_journey(&self, id: &str) -> Result<Option<Journey>, StorageError>;

    /// Most recently started journeys of an owner first.
    async fn list_journeys_for_owner(
        &self,
        owner_id: &str,
        limit: u32,
    ) -> Result<Vec<Journey>, StorageError>;

    /// Every journey that has not been completed.
    async fn list_open_journeys(&self) -> Result<Vec<Journey>, StorageError>;

    /// Store an admitted point with its outcome. Returns `false` when a point
    /// with the same key was already stored (nothing is overwritten).
    async fn insert_telemetry(
        &self,
        journey_id: &str,
        point: &TelemetryPoint,
        outcome: &TickOutcome,
    ) -> Result<bool, StorageError>;

    async fn get_outcome(
        &self,
        journey_id: &str,
        ts: DateTime<Utc>,
    ) -> Result<Option<TickOutcome>, StorageError>;

    /// Newest points first.
    async fn recent_history(
        &self,
        journey_id: &str,
        limit: u32,
    ) -> Result<Vec<HistoryEntry>, StorageError>;

    /// Fails with [`StorageError::Conflict`] when the episode key is taken.
    async fn insert_alert(&self, alert: &Alert) -> Result<(), StorageError>;

    async fn get_alert(&self, id: &str) -> Result<Option<Alert>, StorageError>;

    async fn find_alert_by_episode(&self, episode_key: &str)
    -> Result<Option<Alert>, StorageError>;

    /// Newest alerts first.
    async fn list_alerts_for_journey(
        &self,
        journey_id: &str,
        limit: u32,
    ) -> Result<Vec<Alert>, StorageError>;

    /// Unresolved high and critical alerts, most urgent first.
    async fn list_dashboard_alerts(&self, limit: u32) -> Result<Vec<Alert>, StorageError>;

    /// Mark an alert resolved. Resolving twice keeps the first resolution time.
    async fn resolve_alert(
        &self,
        id: &str,
        resolved_at: DateTime<Utc>,
    ) -> Result<Option<Alert>, StorageError>;

    /// The newest unresolved automated alert of a journey, if any.
    async fn active_episode_alert(&self, journey_id: &str) -> Result<Option<Alert>, StorageError>;

    /// Alert counters, plus journeys updated and alerts resolved at or after
    /// `since`.
    async fn dashboard_stats(&self, since: DateTime<Utc>) -> Result<DashboardStats, StorageError>;

    async fn insert_audit(&self, entry: &AuditEntry) -> Result<(), StorageError>;

    /// A journey's audit trail, newest first.
    async fn list_audit_for_journey(
        &self,
        journey_id: &str,
        limit: u32,
    ) -> Result<Vec<AuditEntry>, StorageError>;
}

/// SQLite-backed store.
#[derive(Clone)]
pub struct Storage {
    pool: SqlitePool,
}

impl Storage {
    /// Connect and create the schema.
    ///
    /// `database_url` is a SQLite connection string, e.g.
    /// `"sqlite:safepath.db?mode=rwc"` or `"sqlite::memory:"`.
    pub async fn new(database_url: &str) -> Result<Self, StorageError> {
        // Every connection to an in-memory URL opens a separate database.
        let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;

        let storage = Self { pool };
        storage.initialize_schema().await?;

        Ok(storage)
    }

    async fn initialize_schema(&self) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS journeys (
                id TEXT PRIMARY KEY,
                owner_id TEXT NOT NULL,
                status TEXT NOT NULL,
                start_lat REAL NOT NULL,
                start_lng REAL NOT NULL,
                start_time TEXT NOT NULL,
                start_ts INTEGER NOT NULL,
                dest_lat REAL,
                dest_lng REAL,
                expected_duration_minutes INTEGER,
                end_lat REAL,
                end_lng REAL,
                end_time TEXT,
                resumed_at TEXT,
                last_updated INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_journeys_owner_start
            ON journeys(owner_id, start_ts)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS telemetry (
                journey_id TEXT NOT NULL,
                ts INTEGER NOT NULL,
                point TEXT NOT NULL,
                outcome TEXT NOT NULL,
                PRIMARY KEY (journey_id, ts)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS alerts (
                id TEXT PRIMARY KEY,
                journey_id TEXT NOT NULL,
                owner_id TEXT NOT NULL,
                alert_type TEXT NOT NULL,
                message TEXT NOT NULL,
                lat REAL NOT NULL,
                lng REAL NOT NULL,
                priority TEXT NOT NULL,
                priority_rank INTEGER NOT NULL,
                status TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                resolved_at INTEGER,
                episode_key TEXT UNIQUE
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_alerts_journey_created
            ON alerts(journey_id, created_at)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS audit_log (
                id TEXT PRIMARY KEY,
                owner_id TEXT NOT NULL,
                journey_id TEXT NOT NULL,
                action TEXT NOT NULL,
                resource_id TEXT NOT NULL,
                details TEXT NOT NULL,
                created_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_audit_journey_created
            ON audit_log(journey_id, created_at)
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

fn parse_time(column: &str, value: &str) -> Result<DateTime<FixedOffset>, StorageError> {
    DateTime::parse_from_rfc3339(value)
        .map_err(|e| StorageError::Corrupt(format!("{column} '{value}': {e}")))
}

fn from_micros(column: &str, value: i64) -> Result<DateTime<Utc>, StorageError> {
    DateTime::from_timestamp_micros(value)
        .ok_or_else(|| StorageError::Corrupt(format!("{column} {value} is out of range")))
}

/// Telemetry key column value.
fn point_key(ts: DateTime<Utc>) -> Result<i64, StorageError> {
    ts.timestamp_nanos_opt()
        .ok_or_else(|| StorageError::Corrupt(format!("timestamp {ts} cannot be keyed in nanoseconds")))
}

fn optional_location(lat: Option<f64>, lng: Option<f64>) -> Option<Location> {
    match (lat, lng) {
        (Some(lat), Some(lng)) => Some(Location::new(lat, lng)),
        _ => None,
    }
}

fn priority_rank(priority: AlertPriority) -> i64 {
    match priority {
        AlertPriority::Low => 0,
        AlertPriority::Medium => 1,
        AlertPriority::High => 2,
        AlertPriority::Critical => 3,
    }
}

fn journey_from_row(row: &SqliteRow) -> Result<Journey, StorageError> {
    let status: String = row.try_get("status")?;
    let start_time: String = row.try_get("start_time")?;
    let end_time: Option<String> = row.try_get("end_time")?;
    let resumed_at: Option<String> = row.try_get("resumed_at")?;

    Ok(Journey {
        id: row.try_get("id")?,
        owner_id: row.try_get("owner_id")?,
        status: status.parse::<JourneyStatus>().map_err(StorageError::Corrupt)?,
        start_location: Location::new(row.try_get("start_lat")?, row.try_get("start_lng")?),
        start_time: parse_time("start_time", &start_time)?,
        destination: optional_location(row.try_get("dest_lat")?, row.try_get("dest_lng")?),
        expected_duration_minutes: row.try_get("expected_duration_minutes")?,
        end_location: optional_location(row.try_get("end_lat")?, row.try_get("end_lng")?),
        end_time: end_time
            .as_deref()
            .map(|t| parse_time("end_time", t))
            .transpose()?,
        resumed_at: resumed_at
            .as_deref()
            .map(|t| parse_time("resumed_at", t))
            .transpose()?,
        last_updated: from_micros("last_updated", row.try_get("last_updated")?)?,
    })
}

fn alert_from_row(row: &SqliteRow) -> Result<Alert, StorageError> {
    let alert_type: String = row.try_get("alert_type")?;
    let priority: String = row.try_get("priority")?;
    let status: String = row.try_get("status")?;
    let resolved_at: Option<i64> = row.try_get("resolved_at")?;

    Ok(Alert {
        id: row.try_get("id")?,
        journey_id: row.try_get("journey_id")?,
        owner_id: row.try_get("owner_id")?,
        alert_type: alert_type.parse::<AlertType>().map_err(StorageError::Corrupt)?,
        message: row.try_get("message")?,
        location: Location::new(row.try_get("lat")?, row.try_get("lng")?),
        priority: priority.parse::<AlertPriority>().map_err(StorageError::Corrupt)?,
        status: status.parse::<AlertStatus>().map_err(StorageError::Corrupt)?,
        created_at: from_micros("created_at", row.try_get("created_at")?)?,
        resolved_at: resolved_at
            .map(|v| from_micros("resolved_at", v))
            .transpose()?,
        episode_key: row.try_get("episode_key")?,
    })
}

fn audit_from_row(row: &SqliteRow) -> Result<AuditEntry, StorageError> {
    let action: String = row.try_get("action")?;
    let details: String = row.try_get("details")?;

    Ok(AuditEntry {
        id: row.try_get("id")?,
        owner_id: row.try_get("owner_id")?,
        journey_id: row.try_get("journey_id")?,
        action: action.parse::<AuditAction>().map_err(StorageError::Corrupt)?,
        resource_id: row.try_get("resource_id")?,
        details: serde_json::from_str(&details)?,
        created_at: from_micros("created_at", row.try_get("created_at")?)?,
    })
}

fn history_from_row(row: &SqliteRow) -> Result<HistoryEntry, StorageError> {
    let point: String = row.try_get("point")?;
    let outcome: String = row.try_get("outcome")?;
    let point: TelemetryPoint = serde_json::from_str(&point)?;
    let outcome: TickOutcome = serde_json::from_str(&outcome)?;

    Ok(HistoryEntry {
        point,
        assessment: outcome.assessment,
        decision: outcome.decision,
    })
}

#[async_trait]
impl JourneyStore for Storage {
    async fn insert_journey(&self, journey: &Journey) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO journeys (
                id, owner_id, status, start_lat, start_lng, start_time, start_ts,
                dest_lat, dest_lng, expected_duration_minutes,
                end_lat, end_lng, end_time, resumed_at, last_updated
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&journey.id)
        .bind(&journey.owner_id)
        .bind(journey.status.as_str())
        .bind(journey.start_location.lat)
        .bind(journey.start_location.lng)
        .bind(journey.start_time.to_rfc3339())
        .bind(journey.start_time.timestamp_micros())
        .bind(journey.destination.map(|d| d.lat))
        .bind(journey.destination.map(|d| d.lng))
        .bind(journey.expected_duration_minutes)
        .bind(journey.end_location.map(|l| l.lat))
        .bind(journey.end_location.map(|l| l.lng))
        .bind(journey.end_time.map(|t| t.to_rfc3339()))
        .bind(journey.resumed_at.map(|t| t.to_rfc3339()))
        .bind(journey.last_updated.timestamp_micros())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn update_journey(&self, journey: &Journey) -> Result<(), StorageError> {
        let result = sqlx::query(
            r#"
            UPDATE journeys
            SET status = ?, end_lat = ?, end_lng = ?, end_time = ?,
                resumed_at = ?, last_updated = ?
            WHERE id = ?
            "#,
        )
        .bind(journey.status.as_str())
        .bind(journey.end_location.map(|l| l.lat))
        .bind(journey.end_location.map(|l| l.lng))
        .bind(journey.end_time.map(|t| t.to_rfc3339()))
        .bind(journey.resumed_at.map(|t| t.to_rfc3339()))
        .bind(journey.last_updated.timestamp_micros())
        .bind(&journey.id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::Corrupt(format!(
                "journey {} vanished from storage",
                journey.id
            )));
        }
        Ok(())
    }

    async fn pause_journey(
        &self,
        id: &str,
        last_updated: DateTime<Utc>,
    ) -> Result<bool, StorageError> {
        let result = sqlx::query(
            r#"
            UPDATE journeys
            SET status = 'paused', last_updated = ?
            WHERE id = ? AND status != 'completed'
            "#,
        )
        .bind(last_updated.timestamp_micros())
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn get_journey(&self, id: &str) -> Result<Option<Journey>, StorageError> {
        let row = sqlx::query("SELECT * FROM journeys WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(journey_from_row).transpose()
    }

    async fn list_journeys_for_owner(
        &self,
        owner_id: &str,
        limit: u32,
    ) -> Result<Vec<Journey>, StorageError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM journeys
            WHERE owner_id = ?
            ORDER BY start_ts DESC
            LIMIT ?
            "#,
        )
        .bind(owner_id)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(journey_from_row).collect()
    }

    async fn list_open_journeys(&self) -> Result<Vec<Journey>, StorageError> {
        let rows = sqlx::query("SELECT * FROM journeys WHERE status != 'completed'")
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(journey_from_row).collect()
    }

    async fn insert_telemetry(
        &self,
        journey_id: &str,
        point: &TelemetryPoint,
        outcome: &TickOutcome,
    ) -> Result<bool, StorageError> {
        let result = sqlx::query(
            r#"
            INSERT INTO telemetry (journey_id, ts, point, outcome)
            VALUES (?, ?, ?, ?)
            ON CONFLICT (journey_id, ts) DO NOTHING
            "#,
        )
        .bind(journey_id)
        .bind(point_key(point.key())?)
        .bind(serde_json::to_string(point)?)
        .bind(serde_json::to_string(outcome)?)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn get_outcome(
        &self,
        journey_id: &str,
        ts: DateTime<Utc>,
    ) -> Result<Option<TickOutcome>, StorageError> {
        let row = sqlx::query("SELECT outcome FROM telemetry WHERE journey_id = ? AND ts = ?")
            .bind(journey_id)
            .bind(point_key(ts)?)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let outcome: String = row.try_get("outcome")?;
                Ok(Some(serde_json::from_str(&outcome)?))
            }
            None => Ok(None),
        }
    }

    async fn recent_history(
        &self,
        journey_id: &str,
        limit: u32,
    ) -> Result<Vec<HistoryEntry>, StorageError> {
        let rows = sqlx::query(
            r#"
            SELECT point, outcome FROM telemetry
            WHERE journey_id = ?
            ORDER BY ts DESC
            LIMIT ?
            "#,
        )
        .bind(journey_id)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(history_from_row).collect()
    }

    async fn insert_alert(&self, alert: &Alert) -> Result<(), StorageError> {
        let result = sqlx::query(
            r#"
            INSERT INTO alerts (
                id, journey_id, owner_id, alert_type, message, lat, lng,
                priority, priority_rank, status, created_at, resolved_at, episode_key
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&alert.id)
        .bind(&alert.journey_id)
        .bind(&alert.owner_id)
        .bind(alert.alert_type.as_str())
        .bind(&alert.message)
        .bind(alert.location.lat)
        .bind(alert.location.lng)
        .bind(alert.priority.as_str())
        .bind(priority_rank(alert.priority))
        .bind(alert.status.as_str())
        .bind(alert.created_at.timestamp_micros())
        .bind(alert.resolved_at.map(|t| t.timestamp_micros()))
        .bind(alert.episode_key.as_deref())
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(StorageError::Conflict(format!(
                    "alert for episode {} already exists",
                    alert.episode_key.as_deref().unwrap_or("-")
                )))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get_alert(&self, id: &str) -> Result<Option<Alert>, StorageError> {
        let row = sqlx::query("SELECT * FROM alerts WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(alert_from_row).transpose()
    }

    async fn find_alert_by_episode(
        &self,
        episode_key: &str,
    ) -> Result<Option<Alert>, StorageError> {
        let row = sqlx::query("SELECT * FROM alerts WHERE episode_key = ?")
            .bind(episode_key)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(alert_from_row).transpose()
    }

    async fn list_alerts_for_journey(
        &self,
        journey_id: &str,
        limit: u32,
    ) -> Result<Vec<Alert>, StorageError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM alerts
            WHERE journey_id = ?
            ORDER BY created_at DESC
            LIMIT ?
            "#,
        )
        .bind(journey_id)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(alert_from_row).collect()
    }

    async fn list_dashboard_alerts(&self, limit: u32) -> Result<Vec<Alert>, StorageError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM alerts
            WHERE status = 'active' AND priority_rank >= ?
            ORDER BY priority_rank DESC, created_at DESC
            LIMIT ?
            "#,
        )
        .bind(priority_rank(AlertPriority::High))
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(alert_from_row).collect()
    }

    async fn resolve_alert(
        &self,
        id: &str,
        resolved_at: DateTime<Utc>,
    ) -> Result<Option<Alert>, StorageError> {
        sqlx::query(
            r#"
            UPDATE alerts
            SET status = 'resolved', resolved_at = ?
            WHERE id = ? AND status = 'active'
            "#,
        )
        .bind(resolved_at.timestamp_micros())
        .bind(id)
        .execute(&self.pool)
        .await?;

        self.get_alert(id).await
    }

    async fn active_episode_alert(&self, journey_id: &str) -> Result<Option<Alert>, StorageError> {
        let row = sqlx::query(
            r#"
            SELECT * FROM alerts
            WHERE journey_id = ? AND alert_type = 'automated_alert'
              AND status = 'active' AND episode_key IS NOT NULL
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(journey_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(alert_from_row).transpose()
    }

    async fn dashboard_stats(&self, since: DateTime<Utc>) -> Result<DashboardStats, StorageError> {
        let since = since.timestamp_micros();
        let row = sqlx::query(
            r#"
            SELECT
                (SELECT COUNT(*) FROM alerts WHERE status = 'active') AS total_active_alerts,
                (SELECT COUNT(*) FROM alerts
                 WHERE status = 'active' AND priority = 'critical') AS critical_alerts,
                (SELECT COUNT(*) FROM alerts
                 WHERE status = 'active' AND priority = 'high') AS high_alerts,
                (SELECT COUNT(*) FROM journeys WHERE last_updated >= ?) AS active_journeys,
                (SELECT COUNT(*) FROM alerts
                 WHERE status = 'resolved' AND resolved_at >= ?) AS resolved_alerts_24h
            "#,
        )
        .bind(since)
        .bind(since)
        .fetch_one(&self.pool)
        .await?;

        Ok(DashboardStats {
            total_active_alerts: row.try_get("total_active_alerts")?,
            critical_alerts: row.try_get("critical_alerts")?,
            high_alerts: row.try_get("high_alerts")?,
            active_journeys: row.try_get("active_journeys")?,
            resolved_alerts_24h: row.try_get("resolved_alerts_24h")?,
        })
    }

    async fn insert_audit(&self, entry: &AuditEntry) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO audit_log (
                id, owner_id, journey_id, action, resource_id, details, created_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&entry.id)
        .bind(&entry.owner_id)
        .bind(&entry.journey_id)
        .bind(entry.action.as_str())
        .bind(&entry.resource_id)
        .bind(serde_json::to_string(&entry.details)?)
        .bind(entry.created_at.timestamp_micros())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_audit_for_journey(
        &self,
        journey_id: &str,
        limit: u32,
    ) -> Result<Vec<AuditEntry>, StorageError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM audit_log
            WHERE journey_id = ?
            ORDER BY created_at DESC, rowid DESC
            LIMIT ?
            "#,
        )
        .bind(journey_id)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(audit_from_row).collect()
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Decision, DecisionAction, MovementState, RiskAssessment, RiskLevel};

    async fn setup_test_storage() -> Storage {
        Storage::new("sqlite::memory:").await.unwrap()
    }

    fn at(s: &str) -> DateTime<FixedOffset> {
        DateTime::parse_from_rfc3339(s).unwrap()
    }

    fn journey(id: &str, owner: &str, start: &str) -> Journey {
        Journey {
            id: id.to_string(),
            owner_id: owner.to_string(),
            status: JourneyStatus::Active,
            start_location: Location::new(23.02, 72.57),
            start_time: at(start),
            destination: Some(Location::new(23.05, 72.60)),
            expected_duration_minutes: Some(30),
            end_location: None,
            end_time: None,
            resumed_at: None,
            last_updated: Utc::now(),
        }
    }

    fn alert(id: &str, priority: AlertPriority, episode_key: Option<&str>) -> Alert {
        Alert {
            id: id.to_string(),
            journey_id: "j-1".to_string(),
            owner_id: "owner".to_string(),
            alert_type: if episode_key.is_some() {
                AlertType::AutomatedAlert
            } else {
                AlertType::Sos
            },
            message: "help".to_string(),
            location: Location::new(23.02, 72.57),
            priority,
            status: AlertStatus::Active,
            created_at: Utc::now(),
            resolved_at: None,
            episode_key: episode_key.map(str::to_string),
        }
    }

    fn tick(ts: &str) -> (TelemetryPoint, TickOutcome) {
        let timestamp = at(ts);
        let point = TelemetryPoint {
            timestamp,
            location: Location::new(23.02, 72.57),
            speed: 1.0,
            movement_state: MovementState::Walking,
            battery_level: 50,
            altitude: Some(53.0),
            accuracy: None,
        };
        let outcome = TickOutcome {
            assessment: RiskAssessment {
                risk_level: RiskLevel::Medium,
                confidence: 0.64,
                score: 0.45,
                factors: vec!["night_time".into(), "low_battery".into()],
                timestamp,
            },
            decision: Decision {
                action: DecisionAction::WarningNotification,
                parallel_actions: vec![],
                message: "warn".to_string(),
                timestamp,
                episode: None,
            },
        };
        (point, outcome)
    }

    #[tokio::test]
    async fn test_journey_round_trip_keeps_offset() {
        let storage = setup_test_storage().await;
        let mut j = journey("j-1", "owner", "2025-03-01T23:30:00+05:30");
        storage.insert_journey(&j).await.unwrap();

        let loaded = storage.get_journey("j-1").await.unwrap().unwrap();
        assert_eq!(loaded.start_time.offset().local_minus_utc(), 5 * 3600 + 1800);
        assert_eq!(loaded.destination, j.destination);

        j.status = JourneyStatus::Completed;
        j.end_time = Some(at("2025-03-02T00:10:00+05:30"));
        j.end_location = Some(Location::new(23.05, 72.60));
        storage.update_journey(&j).await.unwrap();

        let loaded = storage.get_journey("j-1").await.unwrap().unwrap();
        assert_eq!(loaded.status, JourneyStatus::Completed);
        assert_eq!(loaded.end_time, j.end_time);
        assert!(storage.list_open_journeys().await.unwrap().is_empty());
        assert!(storage.get_journey("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_owner_listing_newest_first() {
        let storage = setup_test_storage().await;
        storage
            .insert_journey(&journey("a", "owner", "2025-03-01T08:00:00Z"))
            .await
            .unwrap();
        storage
            .insert_journey(&journey("b", "owner", "2025-03-02T08:00:00Z"))
            .await
            .unwrap();
        storage
            .insert_journey(&journey("c", "someone-else", "2025-03-03T08:00:00Z"))
            .await
            .unwrap();

        let listed = storage.list_journeys_for_owner("owner", 10).await.unwrap();
        let ids: Vec<_> = listed.iter().map(|j| j.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a"]);

        let limited = storage.list_journeys_for_owner("owner", 1).await.unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[tokio::test]
    async fn test_telemetry_insert_is_idempotent() {
        let storage = setup_test_storage().await;
        let (point, outcome) = tick("2025-03-01T23:30:00+05:30");

        assert!(storage.insert_telemetry("j-1", &point, &outcome).await.unwrap());
        assert!(!storage.insert_telemetry("j-1", &point, &outcome).await.unwrap());

        let stored = storage.get_outcome("j-1", point.key()).await.unwrap();
        assert_eq!(stored, Some(outcome));
        assert!(storage.get_outcome("j-2", point.key()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_history_newest_first() {
        let storage = setup_test_storage().await;
        for ts in [
            "2025-03-01T12:01:00Z",
            "2025-03-01T12:00:00Z",
            "2025-03-01T12:02:00Z",
        ] {
            let (point, outcome) = tick(ts);
            storage.insert_telemetry("j-1", &point, &outcome).await.unwrap();
        }

        let history = storage.recent_history("j-1", 2).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].point.timestamp, at("2025-03-01T12:02:00Z"));
        assert_eq!(history[1].point.timestamp, at("2025-03-01T12:01:00Z"));
        assert_eq!(history[0].point.altitude, Some(53.0));
    }

    #[tokio::test]
    async fn test_episode_key_is_unique() {
        let storage = setup_test_storage().await;
        storage
            .insert_alert(&alert("a-1", AlertPriority::High, Some("j-1@t")))
            .await
            .unwrap();

        let err = storage
            .insert_alert(&alert("a-2", AlertPriority::High, Some("j-1@t")))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Conflict(_)));

        // Manual alerts carry no key and never collide.
        storage
            .insert_alert(&alert("sos-1", AlertPriority::Critical, None))
            .await
            .unwrap();
        storage
            .insert_alert(&alert("sos-2", AlertPriority::Critical, None))
            .await
            .unwrap();

        let found = storage.find_alert_by_episode("j-1@t").await.unwrap().unwrap();
        assert_eq!(found.id, "a-1");
        assert_eq!(
            storage.list_alerts_for_journey("j-1", 10).await.unwrap().len(),
            3
        );
    }

    #[tokio::test]
    async fn test_dashboard_and_resolution() {
        let storage = setup_test_storage().await;
        storage
            .insert_alert(&alert("low", AlertPriority::Medium, None))
            .await
            .unwrap();
        storage
            .insert_alert(&alert("high", AlertPriority::High, Some("j-1@a")))
            .await
            .unwrap();
        storage
            .insert_alert(&alert("crit", AlertPriority::Critical, None))
            .await
            .unwrap();

        let dashboard = storage.list_dashboard_alerts(10).await.unwrap();
        let ids: Vec<_> = dashboard.iter().map(|a| a.id.as_str()).collect();
        assert_eq!(ids, vec!["crit", "high"]);

        let active = storage.active_episode_alert("j-1").await.unwrap().unwrap();
        assert_eq!(active.id, "high");

        let first = Utc::now();
        let resolved = storage.resolve_alert("high", first).await.unwrap().unwrap();
        assert_eq!(resolved.status, AlertStatus::Resolved);
        assert!(storage.active_episode_alert("j-1").await.unwrap().is_none());

        let again = storage
            .resolve_alert("high", first + chrono::Duration::seconds(30))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(again.resolved_at, resolved.resolved_at);

        assert!(storage.resolve_alert("nope", first).await.unwrap().is_none());
        assert_eq!(storage.list_dashboard_alerts(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_sub_microsecond_points_do_not_collide() {
        let storage = setup_test_storage().await;
        let (first, mut first_outcome) = tick("2025-03-01T12:00:00.0000001Z");
        let (second, mut second_outcome) = tick("2025-03-01T12:00:00.0000002Z");
        first_outcome.assessment.risk_level = RiskLevel::Low;
        second_outcome.assessment.risk_level = RiskLevel::High;

        assert!(storage.insert_telemetry("j-1", &first, &first_outcome).await.unwrap());
        assert!(storage.insert_telemetry("j-1", &second, &second_outcome).await.unwrap());

        let stored = storage.get_outcome("j-1", second.key()).await.unwrap().unwrap();
        assert_eq!(stored.assessment.risk_level, RiskLevel::High);
        assert_eq!(storage.recent_history("j-1", 10).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_pause_never_reopens_a_completed_journey() {
        let storage = setup_test_storage().await;
        let mut j = journey("j-1", "owner", "2025-03-01T23:30:00+05:30");
        storage.insert_journey(&j).await.unwrap();

        assert!(storage.pause_journey("j-1", Utc::now()).await.unwrap());
        let loaded = storage.get_journey("j-1").await.unwrap().unwrap();
        assert_eq!(loaded.status, JourneyStatus::Paused);

        j.status = JourneyStatus::Completed;
        j.end_time = Some(at("2025-03-02T00:10:00+05:30"));
        storage.update_journey(&j).await.unwrap();

        assert!(!storage.pause_journey("j-1", Utc::now()).await.unwrap());
        assert!(!storage.pause_journey("missing", Utc::now()).await.unwrap());
        let loaded = storage.get_journey("j-1").await.unwrap().unwrap();
        assert_eq!(loaded.status, JourneyStatus::Completed);
    }

    #[tokio::test]
    async fn test_dashboard_stats_counts() {
        let storage = setup_test_storage().await;
        let now = Utc::now();
        let since = now - chrono::Duration::hours(24);

        let mut stale = journey("old", "owner", "2025-03-01T08:00:00Z");
        stale.last_updated = now - chrono::Duration::hours(30);
        storage.insert_journey(&stale).await.unwrap();
        storage
            .insert_journey(&journey("fresh", "owner", "2025-03-02T08:00:00Z"))
            .await
            .unwrap();

        for (id, priority) in [
            ("c-1", AlertPriority::Critical),
            ("c-2", AlertPriority::Critical),
            ("h-1", AlertPriority::High),
            ("m-1", AlertPriority::Medium),
            ("done", AlertPriority::High),
            ("long-done", AlertPriority::High),
        ] {
            storage.insert_alert(&alert(id, priority, None)).await.unwrap();
        }
        storage.resolve_alert("done", now).await.unwrap();
        storage
            .resolve_alert("long-done", now - chrono::Duration::hours(48))
            .await
            .unwrap();

        let stats = storage.dashboard_stats(since).await.unwrap();
        assert_eq!(
            stats,
            DashboardStats {
                total_active_alerts: 4,
                critical_alerts: 2,
                high_alerts: 1,
                active_journeys: 1,
                resolved_alerts_24h: 1,
            }
        );
    }

    #[tokio::test]
    async fn test_audit_trail_newest_first() {
        let storage = setup_test_storage().await;
        let base = Utc::now();
        let actions = [
            AuditAction::JourneyStart,
            AuditAction::RiskAssessment,
            AuditAction::JourneyEnd,
        ];
        for (i, action) in actions.into_iter().enumerate() {
            storage
                .insert_audit(&AuditEntry {
                    id: format!("a-{i}"),
                    owner_id: "owner".to_string(),
                    journey_id: "j-1".to_string(),
                    action,
                    resource_id: "j-1".to_string(),
                    details: serde_json::json!({"step": i}),
                    created_at: base + chrono::Duration::seconds(i as i64),
                })
                .await
                .unwrap();
        }

        let trail = storage.list_audit_for_journey("j-1", 2).await.unwrap();
        let actions: Vec<_> = trail.iter().map(|e| e.action).collect();
        assert_eq!(actions, vec![AuditAction::JourneyEnd, AuditAction::RiskAssessment]);
        assert_eq!(trail[0].details["step"], 2);
        assert!(storage.list_audit_for_journey("j-2", 10).await.unwrap().is_empty());
    }
}
