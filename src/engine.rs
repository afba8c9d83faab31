//! The journey risk engine.
//!
//! Owns the journey lifecycle and runs the per-tick pipeline:
//!
//! 1. validate the reading (no lock needed)
//! 2. take the journey's session lock
//! 3. classify as replay / fresh / stale
//! 4. evaluate factors over the window snapshot, aggregate, decide
//! 5. persist the point with its outcome
//! 6. commit window and episode state
//! 7. run the escalation executor if the decision escalates
//!
//! Every mutating operation runs under the configured request timeout. A
//! timed-out operation is dropped as a whole, which releases the session lock.
//! State is committed only after the write in step 5. When a timeout lands
//! between the write and the commit, the retry finds the stored point outside
//! the window and finishes steps 6 and 7 for it.

use std::future::Future;
use std::sync::Arc;

use chrono::{Duration, Utc};
use serde_json::json;
use tokio::sync::broadcast;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::admission::{self, Admission};
use crate::aggregation::RiskAggregator;
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::escalation::{EscalationExecutor, NotificationIntent};
use crate::factors::{FactorContext, FactorRegistry};
use crate::model::{
    ActionError, ActionResult, Alert, AlertStatus, AlertType, AuditAction, AuditEntry,
    DashboardStats, DecisionAction, EndJourneyRequest, HistoryEntry, Journey, JourneyAck, JourneyStatus, ManualAlertRequest, ResumeJourneyRequest,
    RiskAssessment, StartJourneyRequest, TelemetryOutcome, TelemetryPoint, TelemetryRequest,
    TickOutcome,
};
use crate::policy::{self, DecisionPolicy, Episode, EpisodeState, PolicyOutcome};
use crate::session::{JourneySession, SessionStore, SharedSession};
use crate::storage::JourneyStore;

/// Capacity of the notification broadcast buffer.
const NOTIFICATION_BUFFER: usize = 256;

/// Look-back of the time-bounded dashboard counters.
const STATS_WINDOW_HOURS: i64 = 24;

/// Where a journey's state currently lives.
enum Lookup {
    Live(SharedSession),
    Completed(Journey),
}

pub struct Engine {
    config: EngineConfig,
    store: Arc<dyn JourneyStore>,
    sessions: SessionStore,
    factors: FactorRegistry,
    aggregator: RiskAggregator,
    policy: DecisionPolicy,
    executor: EscalationExecutor,
    notifications: broadcast::Sender<NotificationIntent>,
}

impl Engine {
    /// Engine with the default factor set.
    pub fn new(config: EngineConfig, store: Arc<dyn JourneyStore>) -> Self {
        let factors = FactorRegistry::with_defaults(&config.factors);
        Self::with_factors(config, store, factors)
    }

    pub fn with_factors(
        config: EngineConfig,
        store: Arc<dyn JourneyStore>,
        factors: FactorRegistry,
    ) -> Self {
        let (notifications, _) = broadcast::channel(NOTIFICATION_BUFFER);
        Self {
            aggregator: RiskAggregator::new(config.weights.clone()),
            policy: DecisionPolicy::new(config.policy.clone()),
            executor: EscalationExecutor::new(Arc::clone(&store), notifications.clone()),
            sessions: SessionStore::new(),
            factors,
            store,
            notifications,
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Receive a [`NotificationIntent`] for every newly raised alert.
    pub fn subscribe(&self) -> broadcast::Receiver<NotificationIntent> {
        self.notifications.subscribe()
    }

    /// Number of journeys with live in-memory state.
    pub fn live_sessions(&self) -> usize {
        self.sessions.len()
    }

    async fn bounded<T, F>(&self, operation: &'static str, fut: F) -> EngineResult<T>
    where
        F: Future<Output = EngineResult<T>>,
    {
        let limit = self.config.server.request_timeout();
        match tokio::time::timeout(limit, fut).await {
            Ok(result) => result,
            Err(_) => {
                warn!(operation, timeout_ms = limit.as_millis() as u64, "Operation timed out");
                Err(EngineError::Timeout(limit))
            }
        }
    }

    /// Append to the persisted audit trail. A failed write is logged and does
    /// not fail the operation being audited.
    async fn record_audit(
        &self,
        owner_id: &str,
        journey_id: &str,
        action: AuditAction,
        resource_id: &str,
        details: serde_json::Value,
    ) {
        let entry = AuditEntry {
            id: Uuid::new_v4().to_string(),
            owner_id: owner_id.to_string(),
            journey_id: journey_id.to_string(),
            action,
            resource_id: resource_id.to_string(),
            details,
            created_at: Utc::now(),
        };
        if let Err(e) = self.store.insert_audit(&entry).await {
            warn!(journey_id, action = action.as_str(), error = %e, "Audit entry not persisted");
        }
    }

    // ------------------------------------------------------------------
    // Session lookup and hydration
    // ------------------------------------------------------------------

    async fn lookup(&self, journey_id: &str) -> EngineResult<Lookup> {
        if let Some(session) = self.sessions.get(journey_id) {
            return Ok(Lookup::Live(session));
        }

        let journey = self
            .store
            .get_journey(journey_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("journey {journey_id}")))?;

        if journey.status == JourneyStatus::Completed {
            return Ok(Lookup::Completed(journey));
        }

        self.hydrate(journey).await
    }

    /// Rebuild a live session for a journey that has none, e.g. after a
    /// restart. A journey left Active is marked Paused, because the engine
    /// cannot know what happened during the gap. A journey completed since it
    /// was read stays completed and gets no session.
    async fn hydrate(&self, mut journey: Journey) -> EngineResult<Lookup> {
        if journey.status == JourneyStatus::Active {
            let now = Utc::now();
            if !self.store.pause_journey(&journey.id, now).await? {
                let current = self
                    .store
                    .get_journey(&journey.id)
                    .await?
                    .ok_or_else(|| EngineError::NotFound(format!("journey {}", journey.id)))?;
                debug!(journey_id = %journey.id, "Journey completed while hydrating");
                return Ok(Lookup::Completed(current));
            }
            journey.status = JourneyStatus::Paused;
            journey.last_updated = now;
            info!(journey_id = %journey.id, "Journey had no live session, marked paused");
        }

        let limit = u32::try_from(self.config.window.max_points).unwrap_or(u32::MAX);
        let history = self.store.recent_history(&journey.id, limit).await?;

        let mut session = JourneySession::new(journey, &self.config.window);
        for entry in history.into_iter().rev() {
            session.window.insert(
                entry.point,
                TickOutcome {
                    assessment: entry.assessment,
                    decision: entry.decision,
                },
            );
        }
        if let Some(newest) = session.window.entries().last() {
            session.last_level = Some(newest.outcome.assessment.risk_level);
            session.last_action = Some(newest.outcome.decision.action);
        }

        if let Some(alert) = self.store.active_episode_alert(&session.journey.id).await? {
            let restored = alert.episode_key.as_deref().and_then(|key| {
                policy::parse_episode_key(key).map(|started_at| Episode {
                    key: key.to_string(),
                    started_at,
                    peak_level: policy::level_for_priority(alert.priority),
                    alert_id: Some(alert.id.clone()),
                })
            });
            match restored {
                Some(episode) => session.episode = EpisodeState::Escalated { episode },
                None => warn!(alert_id = %alert.id, "Active automated alert has an unreadable episode key"),
            }
        }

        debug!(
            journey_id = %session.journey.id,
            points = session.window.len(),
            episode_open = session.episode.is_open(),
            "Session hydrated"
        );
        Ok(Lookup::Live(self.sessions.insert_if_absent(session)))
    }

    /// Hydrate every open journey from storage. Returns how many sessions
    /// were rebuilt.
    pub async fn recover(&self) -> EngineResult<usize> {
        let open = self.store.list_open_journeys().await?;
        let mut recovered = 0;
        for journey in open {
            if self.sessions.get(&journey.id).is_none()
                && matches!(self.hydrate(journey).await?, Lookup::Live(_))
            {
                recovered += 1;
            }
        }
        info!(recovered, "Recovered open journeys");
        Ok(recovered)
    }

    async fn live_session(&self, journey_id: &str) -> EngineResult<SharedSession> {
        match self.lookup(journey_id).await? {
            Lookup::Live(session) => Ok(session),
            Lookup::Completed(_) => Err(completed(journey_id)),
        }
    }

    // ------------------------------------------------------------------
    // Journey lifecycle
    // ------------------------------------------------------------------

    #[instrument(skip(self, request), fields(owner_id = %request.owner_id))]
    pub async fn start_journey(&self, request: StartJourneyRequest) -> EngineResult<Journey> {
        if request.owner_id.trim().is_empty() {
            return Err(EngineError::Validation("owner_id is required".into()));
        }
        let start_location = request
            .start_location
            .ok_or_else(|| EngineError::Validation("start_location is required".into()))?;
        if !start_location.is_valid() {
            return Err(EngineError::Validation("start_location is out of range".into()));
        }
        if request.destination.is_some_and(|d| !d.is_valid()) {
            return Err(EngineError::Validation("destination is out of range".into()));
        }
        if request.expected_duration.is_some_and(|m| m <= 0) {
            return Err(EngineError::Validation(
                "expected_duration must be a positive number of minutes".into(),
            ));
        }

        let journey = Journey {
            id: Uuid::new_v4().to_string(),
            owner_id: request.owner_id,
            status: JourneyStatus::Active,
            start_location,
            start_time: request
                .start_time
                .unwrap_or_else(|| Utc::now().fixed_offset()),
            destination: request.destination,
            expected_duration_minutes: request.expected_duration,
            end_location: None,
            end_time: None,
            resumed_at: None,
            last_updated: Utc::now(),
        };

        self.bounded("start_journey", async {
            self.store.insert_journey(&journey).await?;
            self.sessions
                .insert_if_absent(JourneySession::new(journey.clone(), &self.config.window));
            info!(journey_id = %journey.id, "Journey started");
            self.record_audit(
                &journey.owner_id,
                &journey.id,
                AuditAction::JourneyStart,
                &journey.id,
                json!({
                    "start_location": journey.start_location,
                    "start_time": journey.start_time,
                    "destination": journey.destination,
                    "expected_duration": journey.expected_duration_minutes,
                }),
            )
            .await;
            Ok(journey.clone())
        })
        .await
    }

    #[instrument(skip(self, request), fields(journey_id = %request.journey_id))]
    pub async fn resume_journey(&self, request: ResumeJourneyRequest) -> EngineResult<JourneyAck> {
        if request.current_location.is_some_and(|l| !l.is_valid()) {
            return Err(EngineError::Validation("current_location is out of range".into()));
        }

        self.bounded("resume_journey", async {
            let shared = self.live_session(&request.journey_id).await?;
            let mut session = shared.lock().await;
            if session.journey.status == JourneyStatus::Completed {
                return Err(completed(&request.journey_id));
            }

            let mut updated = session.journey.clone();
            updated.status = JourneyStatus::Active;
            updated.resumed_at = Some(request.resume_time);
            updated.last_updated = Utc::now();
            self.store.update_journey(&updated).await?;
            session.journey = updated;

            info!("Journey resumed");
            self.record_audit(
                &session.journey.owner_id,
                &session.journey.id,
                AuditAction::JourneyResume,
                &session.journey.id,
                json!({
                    "resume_time": request.resume_time,
                    "current_location": request.current_location,
                }),
            )
            .await;
            Ok(JourneyAck {
                journey_id: request.journey_id.clone(),
                message: "Journey resumed successfully".to_string(),
            })
        })
        .await
    }

    #[instrument(skip(self, request), fields(journey_id = %request.journey_id))]
    pub async fn end_journey(&self, request: EndJourneyRequest) -> EngineResult<JourneyAck> {
        if request.end_location.is_some_and(|l| !l.is_valid()) {
            return Err(EngineError::Validation("end_location is out of range".into()));
        }

        self.bounded("end_journey", async {
            let shared = self.live_session(&request.journey_id).await?;
            {
                let mut session = shared.lock().await;
                if session.journey.status == JourneyStatus::Completed {
                    return Err(completed(&request.journey_id));
                }
                if request.end_time < session.journey.start_time {
                    return Err(EngineError::Validation(
                        "end_time is before the journey's start_time".into(),
                    ));
                }

                let mut updated = session.journey.clone();
                updated.status = JourneyStatus::Completed;
                updated.end_time = Some(request.end_time);
                updated.end_location = request.end_location;
                updated.last_updated = Utc::now();
                self.store.update_journey(&updated).await?;
                session.journey = updated;
                self.record_audit(
                    &session.journey.owner_id,
                    &session.journey.id,
                    AuditAction::JourneyEnd,
                    &session.journey.id,
                    json!({
                        "end_time": request.end_time,
                        "end_location": request.end_location,
                    }),
                )
                .await;
            }
            self.sessions.remove(&request.journey_id);

            info!("Journey ended");
            Ok(JourneyAck {
                journey_id: request.journey_id.clone(),
                message: "Journey ended successfully".to_string(),
            })
        })
        .await
    }

    // ------------------------------------------------------------------
    // Telemetry
    // ------------------------------------------------------------------

    /// Score one point against the session without touching it.
    fn evaluate(
        &self,
        session: &JourneySession,
        point: &TelemetryPoint,
        advance: bool,
    ) -> EngineResult<(RiskAssessment, PolicyOutcome)> {
        let ctx = FactorContext {
            journey: &session.journey,
            point,
            recent: session.window.recent_before(point.key()),
        };
        let active = self.factors.evaluate(&ctx);
        let aggregate = self.aggregator.aggregate(&active)?;

        let assessment = RiskAssessment {
            risk_level: aggregate.level,
            confidence: aggregate.confidence,
            score: aggregate.score,
            factors: active.into_iter().map(|f| f.name).collect(),
            timestamp: point.timestamp,
        };
        let outcome = self.policy.decide(
            &session.journey.id,
            &session.episode,
            &assessment,
            aggregate.dominant.as_deref(),
            advance,
        );
        Ok((assessment, outcome))
    }

    #[instrument(skip(self, request), fields(journey_id = %request.journey_id))]
    pub async fn submit_telemetry(&self, request: TelemetryRequest) -> EngineResult<TelemetryOutcome> {
        let point = admission::validate(&request)?;
        let journey_id = request.journey_id.as_str();

        self.bounded("submit_telemetry", async {
            let shared = self.live_session(journey_id).await?;
            let mut session = shared.lock().await;
            if !session.journey.status.accepts_telemetry() {
                return Err(completed(journey_id));
            }

            let (advance, mut recorded) = match admission::classify(
                &session.window,
                self.store.as_ref(),
                journey_id,
                &point,
            )
            .await?
            {
                Admission::Replay(outcome) => return Ok(replay(outcome)),
                Admission::Fresh => (true, None),
                Admission::Stale => {
                    debug!(timestamp = %point.timestamp, "Point is older than the retention horizon");
                    (false, None)
                }
                Admission::Uncommitted(outcome) => {
                    (!session.window.is_stale(point.key()), Some(outcome))
                }
            };

            let (assessment, policy_outcome) = self.evaluate(&session, &point, advance)?;

            if recorded.is_none()
                && !self
                    .store
                    .insert_telemetry(
                        journey_id,
                        &point,
                        &TickOutcome {
                            assessment: assessment.clone(),
                            decision: policy_outcome.decision.clone(),
                        },
                    )
                    .await?
            {
                recorded = self.store.get_outcome(journey_id, point.key()).await?;
            }

            // A point stored by an attempt that never committed keeps the
            // outcome it was stored with; the state it implies is committed now.
            let outcome = match recorded {
                Some(stored) => {
                    warn!(timestamp = %point.timestamp, "Committing a point stored by an earlier attempt");
                    stored
                }
                None => TickOutcome {
                    assessment,
                    decision: policy_outcome.decision.clone(),
                },
            };
            let assessment = outcome.assessment.clone();
            let decision = outcome.decision.clone();

            if session.last_level != Some(assessment.risk_level) {
                info!(
                    risk_level = assessment.risk_level.as_str(),
                    previous = session.last_level.map(|l| l.as_str()),
                    "Risk level changed"
                );
            }
            let evicted = session.window.insert(point.clone(), outcome);
            session.episode = policy_outcome.next.clone();
            session.last_level = Some(assessment.risk_level);
            session.last_action = Some(decision.action);

            info!(
                target: "safepath::audit",
                journey_id,
                risk_level = assessment.risk_level.as_str(),
                confidence = assessment.confidence,
                action = decision.action.as_str(),
                evicted,
                "Decision made"
            );
            self.record_audit(
                &session.journey.owner_id,
                journey_id,
                AuditAction::RiskAssessment,
                journey_id,
                json!({
                    "timestamp": point.timestamp,
                    "risk_level": assessment.risk_level,
                    "confidence": assessment.confidence,
                    "factors": assessment.factors,
                    "action": decision.action,
                    "episode": decision.episode,
                }),
            )
            .await;

            let action_result = match policy_outcome.escalating_episode() {
                Some(episode) => Some(
                    self.execute_escalation(&mut session, &point, &assessment, &policy_outcome, episode)
                        .await,
                ),
                None => None,
            };

            Ok(TelemetryOutcome {
                telemetry_added: true,
                duplicate: false,
                risk_assessment: assessment,
                decision,
                action_result,
            })
        })
        .await
    }

    async fn execute_escalation(
        &self,
        session: &mut JourneySession,
        point: &TelemetryPoint,
        assessment: &RiskAssessment,
        outcome: &PolicyOutcome,
        episode: &Episode,
    ) -> ActionResult {
        let escalated = self
            .executor
            .escalate(
                &session.journey,
                point.location,
                assessment,
                &outcome.decision,
                episode,
            )
            .await;

        match escalated {
            Ok(done) => {
                session.episode.record_alert(&episode.key, &done.alert_id);
                if done.created {
                    self.record_audit(
                        &session.journey.owner_id,
                        &session.journey.id,
                        AuditAction::AlertCreated,
                        &done.alert_id,
                        json!({
                            "alert_type": AlertType::AutomatedAlert,
                            "episode_key": episode.key,
                            "risk_level": assessment.risk_level,
                        }),
                    )
                    .await;
                }
                ActionResult {
                    action: DecisionAction::AlertEscalation,
                    executed: true,
                    alert_id: Some(done.alert_id),
                    duplicate: !done.created,
                    error: None,
                }
            }
            Err(e) => {
                error!(episode_key = %episode.key, error = %e, "Escalation failed");
                ActionResult {
                    action: DecisionAction::AlertEscalation,
                    executed: false,
                    alert_id: None,
                    duplicate: false,
                    error: Some(ActionError {
                        code: e.code().to_string(),
                        message: e.to_string(),
                        retryable: e.is_retryable(),
                    }),
                }
            }
        }
    }

    /// Assess a reading against the journey's current state without storing
    /// it or moving any state.
    #[instrument(skip(self, request), fields(journey_id = %request.journey_id))]
    pub async fn preview_risk(&self, request: TelemetryRequest) -> EngineResult<RiskAssessment> {
        let point = admission::validate(&request)?;

        self.bounded("preview_risk", async {
            match self.lookup(&request.journey_id).await? {
                Lookup::Live(shared) => {
                    let session = shared.lock().await;
                    let (assessment, _) = self.evaluate(&session, &point, false)?;
                    Ok(assessment)
                }
                Lookup::Completed(journey) => {
                    let session = JourneySession::new(journey, &self.config.window);
                    let (assessment, _) = self.evaluate(&session, &point, false)?;
                    Ok(assessment)
                }
            }
        })
        .await
    }

    #[instrument(skip(self))]
    pub async fn journey_history(
        &self,
        journey_id: &str,
        limit: u32,
    ) -> EngineResult<Vec<HistoryEntry>> {
        self.get_journey(journey_id).await?;
        Ok(self.store.recent_history(journey_id, limit).await?)
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Current journey state; live session state wins over storage.
    pub async fn get_journey(&self, journey_id: &str) -> EngineResult<Journey> {
        if let Some(shared) = self.sessions.get(journey_id) {
            return Ok(shared.lock().await.journey.clone());
        }
        self.store
            .get_journey(journey_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("journey {journey_id}")))
    }

    pub async fn list_journeys(&self, owner_id: &str, limit: u32) -> EngineResult<Vec<Journey>> {
        if owner_id.trim().is_empty() {
            return Err(EngineError::Validation("owner_id is required".into()));
        }
        Ok(self.store.list_journeys_for_owner(owner_id, limit).await?)
    }

    // ------------------------------------------------------------------
    // Alerts
    // ------------------------------------------------------------------

    /// Raise an SOS or manual alert. These never carry an episode key, so they
    /// coexist with automated alerts.
    #[instrument(skip(self, request), fields(journey_id = %request.journey_id))]
    pub async fn create_manual_alert(&self, request: ManualAlertRequest) -> EngineResult<Alert> {
        if request.alert_type == AlertType::AutomatedAlert {
            return Err(EngineError::Validation(
                "automated alerts are raised by the engine, use sos or manual_alert".into(),
            ));
        }
        if request.message.trim().is_empty() {
            return Err(EngineError::Validation("message is required".into()));
        }
        if request.location.is_some_and(|l| !l.is_valid()) {
            return Err(EngineError::Validation("location is out of range".into()));
        }

        self.bounded("create_manual_alert", async {
            let (journey, last_seen) = match self.lookup(&request.journey_id).await? {
                Lookup::Live(shared) => {
                    let session = shared.lock().await;
                    let last_seen = session
                        .window
                        .entries()
                        .last()
                        .map(|entry| entry.point.location);
                    (session.journey.clone(), last_seen)
                }
                Lookup::Completed(_) => return Err(completed(&request.journey_id)),
            };

            let alert = Alert {
                id: Uuid::new_v4().to_string(),
                journey_id: journey.id.clone(),
                owner_id: journey.owner_id.clone(),
                alert_type: request.alert_type,
                message: request.message.clone(),
                location: request
                    .location
                    .or(last_seen)
                    .unwrap_or(journey.start_location),
                priority: request.priority,
                status: AlertStatus::Active,
                created_at: Utc::now(),
                resolved_at: None,
                episode_key: None,
            };
            self.store.insert_alert(&alert).await?;

            info!(
                target: "safepath::audit",
                journey_id = %alert.journey_id,
                alert_id = %alert.id,
                alert_type = alert.alert_type.as_str(),
                priority = alert.priority.as_str(),
                "Manual alert created"
            );
            let action = match alert.alert_type {
                AlertType::Sos => AuditAction::SosTriggered,
                _ => AuditAction::AlertCreated,
            };
            self.record_audit(
                &alert.owner_id,
                &alert.journey_id,
                action,
                &alert.id,
                json!({
                    "alert_type": alert.alert_type,
                    "priority": alert.priority,
                    "message": alert.message,
                }),
            )
            .await;
            let _ = self.notifications.send(NotificationIntent::for_alert(&alert));
            Ok(alert)
        })
        .await
    }

    pub async fn get_alert(&self, alert_id: &str) -> EngineResult<Alert> {
        self.store
            .get_alert(alert_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("alert {alert_id}")))
    }

    pub async fn list_alerts(&self, journey_id: &str, limit: u32) -> EngineResult<Vec<Alert>> {
        self.get_journey(journey_id).await?;
        Ok(self.store.list_alerts_for_journey(journey_id, limit).await?)
    }

    pub async fn dashboard_alerts(&self, limit: u32) -> EngineResult<Vec<Alert>> {
        Ok(self.store.list_dashboard_alerts(limit).await?)
    }

    /// Alert counters for the dashboard. Journey activity and resolutions are
    /// counted over the last 24 hours.
    pub async fn dashboard_stats(&self) -> EngineResult<DashboardStats> {
        let since = Utc::now() - Duration::hours(STATS_WINDOW_HOURS);
        Ok(self.store.dashboard_stats(since).await?)
    }

    /// A journey's persisted audit trail, newest first.
    pub async fn audit_trail(&self, journey_id: &str, limit: u32) -> EngineResult<Vec<AuditEntry>> {
        self.get_journey(journey_id).await?;
        Ok(self.store.list_audit_for_journey(journey_id, limit).await?)
    }

    /// Resolve an alert. Resolving an automated alert closes its episode, so
    /// the next qualifying run of risk opens a fresh one.
    #[instrument(skip(self))]
    pub async fn resolve_alert(&self, alert_id: &str) -> EngineResult<Alert> {
        self.bounded("resolve_alert", async {
            let alert = self
                .store
                .resolve_alert(alert_id, Utc::now())
                .await?
                .ok_or_else(|| EngineError::NotFound(format!("alert {alert_id}")))?;

            if let (Some(key), Some(shared)) =
                (alert.episode_key.as_deref(), self.sessions.get(&alert.journey_id))
            {
                if shared.lock().await.episode.close_episode(key) {
                    info!(journey_id = %alert.journey_id, episode_key = key, "Episode closed by resolution");
                }
            }

            info!(target: "safepath::audit", alert_id, "Alert resolved");
            self.record_audit(
                &alert.owner_id,
                &alert.journey_id,
                AuditAction::AlertResolved,
                &alert.id,
                json!({ "resolved_at": alert.resolved_at }),
            )
            .await;
            Ok(alert)
        })
        .await
    }
}

fn completed(journey_id: &str) -> EngineError {
    EngineError::State(format!("journey {journey_id} is completed"))
}

fn replay(outcome: TickOutcome) -> TelemetryOutcome {
    TelemetryOutcome {
        telemetry_added: false,
        duplicate: true,
        risk_assessment: outcome.assessment,
        decision: outcome.decision,
        action_result: None,
    }
}
