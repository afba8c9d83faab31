//! Escalation executor: turns an escalation decision into exactly one
//! automated alert per episode, and announces newly created alerts to
//! delivery collaborators.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{EngineError, StorageError};
use crate::model::{
    Alert, AlertPriority, AlertStatus, AlertType, Decision, Journey, Location, RiskAssessment,
};
use crate::policy::Episode;
use crate::storage::JourneyStore;

/// Who a notification should reach. Delivery itself happens elsewhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Audience {
    User,
    EmergencyContacts,
    PoliceDashboard,
}

/// Payload handed to notification delivery for a newly raised alert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationIntent {
    pub alert_id: String,
    pub journey_id: String,
    pub owner_id: String,
    pub priority: AlertPriority,
    pub audiences: Vec<Audience>,
    pub message: String,
    pub location: Location,
}

impl NotificationIntent {
    pub fn for_alert(alert: &Alert) -> Self {
        let mut audiences = vec![Audience::User, Audience::EmergencyContacts];
        if alert.priority.reaches_dashboard() {
            audiences.push(Audience::PoliceDashboard);
        }

        Self {
            alert_id: alert.id.clone(),
            journey_id: alert.journey_id.clone(),
            owner_id: alert.owner_id.clone(),
            priority: alert.priority,
            audiences,
            message: alert.message.clone(),
            location: alert.location,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EscalationOutcome {
    pub alert_id: String,
    /// False when the episode already had its alert.
    pub created: bool,
}

pub struct EscalationExecutor {
    store: Arc<dyn JourneyStore>,
    notifications: broadcast::Sender<NotificationIntent>,
}

impl EscalationExecutor {
    pub fn new(
        store: Arc<dyn JourneyStore>,
        notifications: broadcast::Sender<NotificationIntent>,
    ) -> Self {
        Self {
            store,
            notifications,
        }
    }

    /// Make sure the episode has its automated alert.
    ///
    /// Idempotent per episode key: the cached alert id is trusted first, then
    /// storage is checked, and only then is a new alert inserted. A failed
    /// insert is retried once; if the retry collides on the episode key the
    /// alert written by the first attempt is returned.
    pub async fn escalate(
        &self,
        journey: &Journey,
        location: Location,
        assessment: &RiskAssessment,
        decision: &Decision,
        episode: &Episode,
    ) -> Result<EscalationOutcome, EngineError> {
        if let Some(alert_id) = &episode.alert_id {
            return Ok(EscalationOutcome {
                alert_id: alert_id.clone(),
                created: false,
            });
        }

        if let Some(existing) = self.store.find_alert_by_episode(&episode.key).await? {
            return Ok(EscalationOutcome {
                alert_id: existing.id,
                created: false,
            });
        }

        let factors = if assessment.factors.is_empty() {
            "none".to_string()
        } else {
            assessment.factors.join(", ")
        };
        let alert = Alert {
            id: Uuid::new_v4().to_string(),
            journey_id: journey.id.clone(),
            owner_id: journey.owner_id.clone(),
            alert_type: AlertType::AutomatedAlert,
            message: format!("{} Triggering factors: {factors}.", decision.message),
            location,
            priority: episode.peak_level.priority(),
            status: AlertStatus::Active,
            created_at: Utc::now(),
            resolved_at: None,
            episode_key: Some(episode.key.clone()),
        };

        let created = match self.insert_with_retry(&alert).await? {
            Some(existing_id) => EscalationOutcome {
                alert_id: existing_id,
                created: false,
            },
            None => {
                info!(
                    target: "safepath::audit",
                    journey_id = %alert.journey_id,
                    alert_id = %alert.id,
                    episode_key = %episode.key,
                    priority = alert.priority.as_str(),
                    "Automated alert created"
                );
                // No receivers is fine: delivery may not be attached.
                let _ = self.notifications.send(NotificationIntent::for_alert(&alert));
                EscalationOutcome {
                    alert_id: alert.id,
                    created: true,
                }
            }
        };

        Ok(created)
    }

    /// Insert the alert, retrying once. Returns the id of an alert that
    /// already held the episode key, if the insert collided.
    async fn insert_with_retry(&self, alert: &Alert) -> Result<Option<String>, EngineError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.store.insert_alert(alert).await {
                Ok(()) => return Ok(None),
                Err(StorageError::Conflict(_)) => {
                    let key = alert.episode_key.as_deref().unwrap_or_default();
                    return match self.store.find_alert_by_episode(key).await? {
                        Some(existing) => Ok(Some(existing.id)),
                        None => Err(EngineError::Persistence(StorageError::Conflict(format!(
                            "episode key {key} conflicted but no alert holds it"
                        )))),
                    };
                }
                Err(e) if attempt < 2 => {
                    warn!(
                        journey_id = %alert.journey_id,
                        error = %e,
                        "Alert insert failed, retrying once"
                    );
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}
