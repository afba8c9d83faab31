//! Data models for Safepath.
//!
//! # Timestamps
//!
//! Client-supplied instants (telemetry, journey start/end, resume) are kept as
//! `DateTime<FixedOffset>` so the offset the device reported survives. That
//! offset is what "local hour of day" means for the night-time factor. Instants
//! the server stamps itself (alert creation, `last_updated`) are UTC.
//!
//! Everything here serializes to the JSON shapes exposed by the HTTP API.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Serialize};

/// A WGS84 coordinate pair in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub lat: f64,
    pub lng: f64,
}

impl Location {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    /// True when both coordinates are finite and inside their declared ranges.
    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lng.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lng)
    }
}

/// Declared movement mode of the device holder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MovementState {
    Walking,
    Running,
    Driving,
    Cycling,
    Stationary,
}

impl MovementState {
    pub fn as_str(&self) -> &'static str {
        match self {
            MovementState::Walking => "walking",
            MovementState::Running => "running",
            MovementState::Driving => "driving",
            MovementState::Cycling => "cycling",
            MovementState::Stationary => "stationary",
        }
    }
}

impl FromStr for MovementState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "walking" => Ok(MovementState::Walking),
            "running" => Ok(MovementState::Running),
            "driving" => Ok(MovementState::Driving),
            "cycling" => Ok(MovementState::Cycling),
            "stationary" => Ok(MovementState::Stationary),
            other => Err(format!(
                "movement_state '{other}' is not one of walking, running, driving, cycling, stationary"
            )),
        }
    }
}

/// Lifecycle status of a journey.
///
/// Transitions are monotonic except `Active <-> Paused`. `Completed` is
/// terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JourneyStatus {
    Active,
    Paused,
    Completed,
}

impl JourneyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JourneyStatus::Active => "active",
            JourneyStatus::Paused => "paused",
            JourneyStatus::Completed => "completed",
        }
    }

    /// Telemetry is admitted for any journey that has not been completed.
    pub fn accepts_telemetry(&self) -> bool {
        !matches!(self, JourneyStatus::Completed)
    }
}

impl FromStr for JourneyStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(JourneyStatus::Active),
            "paused" => Ok(JourneyStatus::Paused),
            "completed" => Ok(JourneyStatus::Completed),
            other => Err(format!("unknown journey status '{other}'")),
        }
    }
}

/// One tracked trip from start to completion.
///
/// Journeys are never deleted; completed journeys stay in storage as history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Journey {
    /// Opaque unique identifier (uuid v4).
    pub id: String,

    /// The user who owns the journey. Identity itself is managed elsewhere.
    pub owner_id: String,

    pub status: JourneyStatus,

    pub start_location: Location,

    pub start_time: DateTime<FixedOffset>,

    /// Planned destination, used by the route-deviation factor.
    pub destination: Option<Location>,

    /// Expected duration in minutes.
    pub expected_duration_minutes: Option<i64>,

    pub end_location: Option<Location>,

    pub end_time: Option<DateTime<FixedOffset>>,

    /// Client time of the most recent resume, if any.
    pub resumed_at: Option<DateTime<FixedOffset>>,

    /// Server time of the last lifecycle change.
    pub last_updated: DateTime<Utc>,
}

/// A single timestamped sensor/location reading.
///
/// The natural key is `(journey_id, timestamp)`. Re-submitting the same key is
/// an idempotent replay, never an error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryPoint {
    pub timestamp: DateTime<FixedOffset>,
    pub location: Location,
    /// Meters per second.
    pub speed: f64,
    pub movement_state: MovementState,
    /// Percentage, 0-100.
    pub battery_level: u8,
    pub altitude: Option<f64>,
    pub accuracy: Option<f64>,
}

impl TelemetryPoint {
    /// The instant this point was recorded, used for ordering and dedup.
    pub fn key(&self) -> DateTime<Utc> {
        self.timestamp.with_timezone(&Utc)
    }
}

/// Overall risk level of one assessment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "LOW",
            RiskLevel::Medium => "MEDIUM",
            RiskLevel::High => "HIGH",
            RiskLevel::Critical => "CRITICAL",
        }
    }

    /// Alert priority matching this level.
    pub fn priority(&self) -> AlertPriority {
        match self {
            RiskLevel::Low => AlertPriority::Low,
            RiskLevel::Medium => AlertPriority::Medium,
            RiskLevel::High => AlertPriority::High,
            RiskLevel::Critical => AlertPriority::Critical,
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Risk verdict for one admitted telemetry point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub risk_level: RiskLevel,

    /// Normalized strength of the assessment in `[0, 1]`.
    pub confidence: f64,

    /// Weighted sum of active factor contributions.
    pub score: f64,

    /// Names of the factors that were active, in evaluation order.
    pub factors: Vec<String>,

    /// The telemetry timestamp this assessment belongs to.
    pub timestamp: DateTime<FixedOffset>,
}

/// The response chosen for one telemetry tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionAction {
    SilentMonitoring,
    WarningNotification,
    SafeRouteSuggestion,
    AlertEscalation,
    PoliceDashboardEvent,
}

impl DecisionAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionAction::SilentMonitoring => "silent_monitoring",
            DecisionAction::WarningNotification => "warning_notification",
            DecisionAction::SafeRouteSuggestion => "safe_route_suggestion",
            DecisionAction::AlertEscalation => "alert_escalation",
            DecisionAction::PoliceDashboardEvent => "police_dashboard_event",
        }
    }
}

impl fmt::Display for DecisionAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a tick sits within an escalation episode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EpisodeTransition {
    /// This tick opened the episode.
    Opened,
    /// The episode was already open and risk is still escalation-worthy.
    Continued,
    /// Risk has dropped but the cooldown span has not elapsed yet.
    CoolingDown,
}

/// Reference to the escalation episode a decision belongs to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpisodeRef {
    /// `"{journey_id}@{started_at}"`, the dedup key for automated alerts.
    pub key: String,
    pub started_at: DateTime<FixedOffset>,
    /// Highest effective level seen in the episode so far.
    pub peak_level: RiskLevel,
    pub transition: EpisodeTransition,
}

/// The decision for one tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub action: DecisionAction,

    /// Additional audiences or remediations issued alongside `action`.
    #[serde(default)]
    pub parallel_actions: Vec<DecisionAction>,

    pub message: String,

    pub timestamp: DateTime<FixedOffset>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub episode: Option<EpisodeRef>,
}

/// Assessment plus decision computed for one point. Stored alongside the point
/// so replays return exactly what the first submission returned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickOutcome {
    pub assessment: RiskAssessment,
    pub decision: Decision,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    Sos,
    AutomatedAlert,
    ManualAlert,
}

impl AlertType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertType::Sos => "sos",
            AlertType::AutomatedAlert => "automated_alert",
            AlertType::ManualAlert => "manual_alert",
        }
    }
}

impl FromStr for AlertType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sos" => Ok(AlertType::Sos),
            "automated_alert" => Ok(AlertType::AutomatedAlert),
            "manual_alert" => Ok(AlertType::ManualAlert),
            other => Err(format!("unknown alert type '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertPriority {
    Low,
    Medium,
    High,
    Critical,
}

impl AlertPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertPriority::Low => "low",
            AlertPriority::Medium => "medium",
            AlertPriority::High => "high",
            AlertPriority::Critical => "critical",
        }
    }

    /// High and critical alerts are also shown on the police dashboard.
    pub fn reaches_dashboard(&self) -> bool {
        matches!(self, AlertPriority::High | AlertPriority::Critical)
    }
}

impl FromStr for AlertPriority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(AlertPriority::Low),
            "medium" => Ok(AlertPriority::Medium),
            "high" => Ok(AlertPriority::High),
            "critical" => Ok(AlertPriority::Critical),
            other => Err(format!("unknown alert priority '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertStatus {
    Active,
    Resolved,
}

impl AlertStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertStatus::Active => "active",
            AlertStatus::Resolved => "resolved",
        }
    }
}

impl FromStr for AlertStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(AlertStatus::Active),
            "resolved" => Ok(AlertStatus::Resolved),
            other => Err(format!("unknown alert status '{other}'")),
        }
    }
}

/// An alert raised for a journey, either by the escalation executor or by a
/// manual SOS.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,
    pub journey_id: String,
    pub owner_id: String,
    pub alert_type: AlertType,
    pub message: String,
    pub location: Location,
    pub priority: AlertPriority,
    pub status: AlertStatus,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,

    /// Escalation episode key. Set only on automated alerts, unique per episode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub episode_key: Option<String>,
}

/// Structured error attached to an action result that could not be executed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionError {
    pub code: String,
    pub message: String,
    pub retryable: bool,
}

/// What happened when the decided action was carried out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionResult {
    pub action: DecisionAction,
    pub executed: bool,
    pub alert_id: Option<String>,
    /// True when an existing alert for the open episode was returned.
    pub duplicate: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ActionError>,
}

/// Response payload for a telemetry submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryOutcome {
    pub telemetry_added: bool,
    /// True when this submission replayed an already admitted point.
    pub duplicate: bool,
    pub risk_assessment: RiskAssessment,
    pub decision: Decision,
    pub action_result: Option<ActionResult>,
}

/// One archived tick of a journey's history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub point: TelemetryPoint,
    pub assessment: RiskAssessment,
    pub decision: Decision,
}

/// Kind of event recorded in the audit trail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    JourneyStart,
    JourneyResume,
    JourneyEnd,
    RiskAssessment,
    AlertCreated,
    AlertResolved,
    SosTriggered,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::JourneyStart => "journey_start",
            AuditAction::JourneyResume => "journey_resume",
            AuditAction::JourneyEnd => "journey_end",
            AuditAction::RiskAssessment => "risk_assessment",
            AuditAction::AlertCreated => "alert_created",
            AuditAction::AlertResolved => "alert_resolved",
            AuditAction::SosTriggered => "sos_triggered",
        }
    }
}

impl FromStr for AuditAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "journey_start" => Ok(AuditAction::JourneyStart),
            "journey_resume" => Ok(AuditAction::JourneyResume),
            "journey_end" => Ok(AuditAction::JourneyEnd),
            "risk_assessment" => Ok(AuditAction::RiskAssessment),
            "alert_created" => Ok(AuditAction::AlertCreated),
            "alert_resolved" => Ok(AuditAction::AlertResolved),
            "sos_triggered" => Ok(AuditAction::SosTriggered),
            other => Err(format!("unknown audit action '{other}'")),
        }
    }
}

/// One persisted audit record. `resource_id` is the journey or alert the
/// action touched; `details` carries action specific fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: String,
    pub owner_id: String,
    pub journey_id: String,
    pub action: AuditAction,
    pub resource_id: String,
    pub details: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Alert and journey counters for the monitoring dashboard.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DashboardStats {
    pub total_active_alerts: i64,
    pub critical_alerts: i64,
    pub high_alerts: i64,
    /// Journeys updated within the last 24 hours.
    pub active_journeys: i64,
    pub resolved_alerts_24h: i64,
}

/// Acknowledgement for resume/end.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JourneyAck {
    pub journey_id: String,
    pub message: String,
}

/// Request body for `POST /journeys/start`.
#[derive(Debug, Clone, Deserialize)]
pub struct StartJourneyRequest {
    pub owner_id: String,
    pub start_location: Option<Location>,
    /// Defaults to the current server time.
    pub start_time: Option<DateTime<FixedOffset>>,
    pub destination: Option<Location>,
    /// Minutes.
    pub expected_duration: Option<i64>,
}

/// Request body for `POST /journeys/resume`.
#[derive(Debug, Clone, Deserialize)]
pub struct ResumeJourneyRequest {
    pub journey_id: String,
    pub resume_time: DateTime<FixedOffset>,
    pub current_location: Option<Location>,
}

/// Request body for `POST /journeys/end`.
#[derive(Debug, Clone, Deserialize)]
pub struct EndJourneyRequest {
    pub journey_id: String,
    pub end_time: DateTime<FixedOffset>,
    pub end_location: Option<Location>,
}

/// Request body for `POST /journeys/telemetry` and `/journeys/analyze-risk`.
///
/// Every reading field is optional at the wire level so that missing fields are
/// reported by the admission pipeline as validation errors naming the field.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TelemetryRequest {
    pub journey_id: String,
    pub timestamp: Option<DateTime<FixedOffset>>,
    pub location: Option<Location>,
    pub speed: Option<f64>,
    pub movement_state: Option<String>,
    pub battery_level: Option<i64>,
    pub altitude: Option<f64>,
    pub accuracy: Option<f64>,
}

/// Request body for `POST /alerts`.
#[derive(Debug, Clone, Deserialize)]
pub struct ManualAlertRequest {
    pub journey_id: String,
    pub alert_type: AlertType,
    pub message: String,
    pub location: Option<Location>,
    #[serde(default = "default_manual_priority")]
    pub priority: AlertPriority,
}

fn default_manual_priority() -> AlertPriority {
    AlertPriority::Medium
}

/// Query parameters for `GET /journeys`.
#[derive(Debug, Deserialize)]
pub struct JourneysQuery {
    pub owner_id: String,
    #[serde(default = "default_journey_limit")]
    pub limit: u32,
}

fn default_journey_limit() -> u32 {
    10
}

/// Query parameters for list endpoints that only take a limit.
#[derive(Debug, Deserialize)]
pub struct LimitQuery {
    #[serde(default = "default_list_limit")]
    pub limit: u32,
}

/// Query parameters for `GET /alerts`.
#[derive(Debug, Deserialize)]
pub struct AlertsQuery {
    pub journey_id: String,
    #[serde(default = "default_list_limit")]
    pub limit: u32,
}

fn default_list_limit() -> u32 {
    50
}
