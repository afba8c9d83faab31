//! Decision policy: maps each assessment to an action, debounced through a
//! per-journey escalation episode state machine.
//!
//! ```text
//! Normal   --HIGH-------------------------------> Elevated{1}
//! Elevated --HIGH (n reaches sustained span)----> Escalated   (opened)
//! Normal / Elevated --confident CRITICAL--------> Escalated   (opened)
//! Normal / Elevated --LOW or MEDIUM-------------> Normal
//! Escalated / Cooldown --HIGH or CRITICAL-------> Escalated   (continued)
//! Escalated / Cooldown --LOW or MEDIUM----------> Cooldown    (cooling_down)
//! Cooldown --calm span reached------------------> Normal
//! ```
//!
//! The policy itself is pure: [`DecisionPolicy::decide`] returns the decision
//! together with the next state, and the caller commits that state only once
//! the tick has been persisted.

use chrono::{DateTime, FixedOffset};

use crate::config::PolicyConfig;
use crate::factors::ROUTE_DEVIATION;
use crate::model::{
    AlertPriority, Decision, DecisionAction, EpisodeRef, EpisodeTransition, RiskAssessment,
    RiskLevel,
};

/// One escalation episode: a maximal run of escalation-worthy ticks.
#[derive(Debug, Clone, PartialEq)]
pub struct Episode {
    pub key: String,
    pub started_at: DateTime<FixedOffset>,
    pub peak_level: RiskLevel,
    /// Id of the automated alert raised for this episode, once it exists.
    pub alert_id: Option<String>,
}

impl Episode {
    pub fn open(journey_id: &str, started_at: DateTime<FixedOffset>, level: RiskLevel) -> Self {
        Self {
            key: episode_key(journey_id, started_at),
            started_at,
            peak_level: level,
            alert_id: None,
        }
    }

    fn reference(&self, transition: EpisodeTransition) -> EpisodeRef {
        EpisodeRef {
            key: self.key.clone(),
            started_at: self.started_at,
            peak_level: self.peak_level,
            transition,
        }
    }
}

/// Dedup key for the automated alert of an episode.
pub fn episode_key(journey_id: &str, started_at: DateTime<FixedOffset>) -> String {
    format!("{journey_id}@{}", started_at.to_rfc3339())
}

/// Recover the start instant from an episode key.
pub fn parse_episode_key(key: &str) -> Option<DateTime<FixedOffset>> {
    let (_, started_at) = key.rsplit_once('@')?;
    DateTime::parse_from_rfc3339(started_at).ok()
}

/// Risk level an alert priority stands for.
pub fn level_for_priority(priority: AlertPriority) -> RiskLevel {
    match priority {
        AlertPriority::Low => RiskLevel::Low,
        AlertPriority::Medium => RiskLevel::Medium,
        AlertPriority::High => RiskLevel::High,
        AlertPriority::Critical => RiskLevel::Critical,
    }
}

/// Escalation state of one journey.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum EpisodeState {
    #[default]
    Normal,
    /// Consecutive HIGH ticks seen so far, below the sustain span.
    Elevated { high_ticks: u32 },
    Escalated { episode: Episode },
    /// Open episode with `calm_ticks` consecutive LOW/MEDIUM ticks.
    Cooldown { episode: Episode, calm_ticks: u32 },
}

impl EpisodeState {
    pub fn episode(&self) -> Option<&Episode> {
        match self {
            EpisodeState::Escalated { episode } | EpisodeState::Cooldown { episode, .. } => {
                Some(episode)
            }
            _ => None,
        }
    }

    fn episode_mut(&mut self) -> Option<&mut Episode> {
        match self {
            EpisodeState::Escalated { episode } | EpisodeState::Cooldown { episode, .. } => {
                Some(episode)
            }
            _ => None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.episode().is_some()
    }

    /// Remember the alert raised for the open episode with key `key`.
    pub fn record_alert(&mut self, key: &str, alert_id: &str) {
        if let Some(episode) = self.episode_mut() {
            if episode.key == key {
                episode.alert_id = Some(alert_id.to_string());
            }
        }
    }

    /// Close the open episode if its key is `key`. Returns whether it closed.
    pub fn close_episode(&mut self, key: &str) -> bool {
        if self.episode().is_some_and(|e| e.key == key) {
            *self = EpisodeState::Normal;
            true
        } else {
            false
        }
    }
}

/// Decision plus the state to commit once the tick is persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct PolicyOutcome {
    pub decision: Decision,
    pub next: EpisodeState,
}

impl PolicyOutcome {
    /// The episode this tick escalates for, if the decision is an escalation.
    pub fn escalating_episode(&self) -> Option<&Episode> {
        if self.decision.action == DecisionAction::AlertEscalation {
            self.next.episode()
        } else {
            None
        }
    }
}

/// Maps assessments to actions.
#[derive(Debug, Clone)]
pub struct DecisionPolicy {
    config: PolicyConfig,
}

impl DecisionPolicy {
    pub fn new(config: PolicyConfig) -> Self {
        Self { config }
    }

    /// CRITICAL below the confidence threshold is handled as HIGH.
    pub fn effective_level(&self, assessment: &RiskAssessment) -> RiskLevel {
        match assessment.risk_level {
            RiskLevel::Critical if assessment.confidence < self.config.critical_confidence => {
                RiskLevel::High
            }
            level => level,
        }
    }

    fn base_action(&self, level: RiskLevel, confidence: f64) -> DecisionAction {
        match level {
            RiskLevel::Low => DecisionAction::SilentMonitoring,
            RiskLevel::Medium if confidence >= self.config.medium_confidence => {
                DecisionAction::WarningNotification
            }
            RiskLevel::Medium => DecisionAction::SilentMonitoring,
            RiskLevel::High | RiskLevel::Critical => DecisionAction::WarningNotification,
        }
    }

    /// Decide the action for one tick.
    ///
    /// With `advance = false` (a point older than the retention horizon) the
    /// decision reflects the current state but the state does not move: a late
    /// point can neither open nor close an episode.
    pub fn decide(
        &self,
        journey_id: &str,
        state: &EpisodeState,
        assessment: &RiskAssessment,
        dominant: Option<&str>,
        advance: bool,
    ) -> PolicyOutcome {
        let level = self.effective_level(assessment);
        let elevated = matches!(level, RiskLevel::High | RiskLevel::Critical);
        let ts = assessment.timestamp;

        if !advance {
            let escalation = state.episode().map(|episode| {
                let transition = match state {
                    EpisodeState::Cooldown { .. } => EpisodeTransition::CoolingDown,
                    _ => EpisodeTransition::Continued,
                };
                (episode.clone(), transition)
            });
            let decision = self.build(assessment, level, dominant, escalation.as_ref());
            return PolicyOutcome {
                decision,
                next: state.clone(),
            };
        }

        let (next, transition) = match state {
            EpisodeState::Normal | EpisodeState::Elevated { .. } => {
                let high_ticks = match state {
                    EpisodeState::Elevated { high_ticks } => *high_ticks,
                    _ => 0,
                };
                match level {
                    RiskLevel::Critical => (
                        EpisodeState::Escalated {
                            episode: Episode::open(journey_id, ts, level),
                        },
                        Some(EpisodeTransition::Opened),
                    ),
                    RiskLevel::High if high_ticks + 1 >= self.config.sustained_high_ticks => (
                        EpisodeState::Escalated {
                            episode: Episode::open(journey_id, ts, level),
                        },
                        Some(EpisodeTransition::Opened),
                    ),
                    RiskLevel::High => (
                        EpisodeState::Elevated {
                            high_ticks: high_ticks + 1,
                        },
                        None,
                    ),
                    _ => (EpisodeState::Normal, None),
                }
            }
            EpisodeState::Escalated { episode } | EpisodeState::Cooldown { episode, .. }
                if elevated =>
            {
                let mut episode = episode.clone();
                episode.peak_level = episode.peak_level.max(level);
                (
                    EpisodeState::Escalated { episode },
                    Some(EpisodeTransition::Continued),
                )
            }
            EpisodeState::Escalated { episode } | EpisodeState::Cooldown { episode, .. } => {
                let calm_ticks = match state {
                    EpisodeState::Cooldown { calm_ticks, .. } => calm_ticks + 1,
                    _ => 1,
                };
                if calm_ticks >= self.config.cooldown_ticks {
                    (EpisodeState::Normal, None)
                } else {
                    (
                        EpisodeState::Cooldown {
                            episode: episode.clone(),
                            calm_ticks,
                        },
                        Some(EpisodeTransition::CoolingDown),
                    )
                }
            }
        };

        let escalation = transition.and_then(|t| next.episode().map(|e| (e.clone(), t)));
        let decision = self.build(assessment, level, dominant, escalation.as_ref());
        PolicyOutcome { decision, next }
    }

    fn build(
        &self,
        assessment: &RiskAssessment,
        level: RiskLevel,
        dominant: Option<&str>,
        escalation: Option<&(Episode, EpisodeTransition)>,
    ) -> Decision {
        let route_dominant = dominant == Some(ROUTE_DEVIATION);
        let factors = if assessment.factors.is_empty() {
            "none".to_string()
        } else {
            assessment.factors.join(", ")
        };

        match escalation {
            Some((episode, transition)) => {
                let mut parallel_actions = Vec::new();
                if level.max(episode.peak_level).priority().reaches_dashboard() {
                    parallel_actions.push(DecisionAction::PoliceDashboardEvent);
                }
                if route_dominant {
                    parallel_actions.push(DecisionAction::SafeRouteSuggestion);
                }

                let message = match transition {
                    EpisodeTransition::Opened => format!(
                        "{level} risk detected with factors: {factors}. Immediate assistance requested."
                    ),
                    EpisodeTransition::Continued => format!(
                        "Escalation in progress ({level}, peak {}) with factors: {factors}.",
                        episode.peak_level
                    ),
                    EpisodeTransition::CoolingDown => format!(
                        "Risk easing ({level}); escalation stays open until conditions remain calm."
                    ),
                };

                Decision {
                    action: DecisionAction::AlertEscalation,
                    parallel_actions,
                    message,
                    timestamp: assessment.timestamp,
                    episode: Some(episode.reference(*transition)),
                }
            }
            None => {
                let mut action = self.base_action(level, assessment.confidence);
                if route_dominant {
                    action = DecisionAction::SafeRouteSuggestion;
                }

                let message = match action {
                    DecisionAction::SafeRouteSuggestion => format!(
                        "{level} risk with the journey off its planned route. Safe route suggested to user."
                    ),
                    DecisionAction::WarningNotification => format!(
                        "Elevated risk ({level}) detected with factors: {factors}. User notified."
                    ),
                    _ => format!("Normal monitoring continuing. Current risk level: {level}."),
                };

                Decision {
                    action,
                    parallel_actions: Vec::new(),
                    message,
                    timestamp: assessment.timestamp,
                    episode: None,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factors::{LOW_BATTERY, NIGHT_TIME};

    fn ts(minute: u32) -> DateTime<FixedOffset> {
        DateTime::parse_from_rfc3339(&format!("2025-03-01T22:{minute:02}:00+05:30")).unwrap()
    }

    fn assessment(level: RiskLevel, confidence: f64, minute: u32) -> RiskAssessment {
        RiskAssessment {
            risk_level: level,
            confidence,
            score: 0.0,
            factors: vec![NIGHT_TIME.to_string(), LOW_BATTERY.to_string()],
            timestamp: ts(minute),
        }
    }

    fn run(
        policy: &DecisionPolicy,
        levels: &[(RiskLevel, f64)],
    ) -> (Vec<Decision>, EpisodeState) {
        let mut state = EpisodeState::Normal;
        let mut decisions = Vec::new();
        for (i, (level, confidence)) in levels.iter().enumerate() {
            let outcome = policy.decide(
                "j-1",
                &state,
                &assessment(*level, *confidence, i as u32),
                None,
                true,
            );
            decisions.push(outcome.decision);
            state = outcome.next;
        }
        (decisions, state)
    }

    fn policy() -> DecisionPolicy {
        DecisionPolicy::new(PolicyConfig::default())
    }

    fn transitions(decisions: &[Decision]) -> Vec<Option<EpisodeTransition>> {
        decisions
            .iter()
            .map(|d| d.episode.as_ref().map(|e| e.transition))
            .collect()
    }

    #[test]
    fn test_per_level_actions() {
        let (decisions, state) = run(
            &policy(),
            &[
                (RiskLevel::Low, 0.1),
                (RiskLevel::Medium, 0.3),
                (RiskLevel::Medium, 0.6),
                (RiskLevel::High, 0.9),
            ],
        );
        let actions: Vec<_> = decisions.iter().map(|d| d.action).collect();
        assert_eq!(
            actions,
            vec![
                DecisionAction::SilentMonitoring,
                DecisionAction::SilentMonitoring,
                DecisionAction::WarningNotification,
                DecisionAction::WarningNotification,
            ]
        );
        assert_eq!(state, EpisodeState::Elevated { high_ticks: 1 });
    }

    #[test]
    fn test_sustained_high_opens_exactly_once() {
        let (decisions, state) = run(&policy(), &[(RiskLevel::High, 0.9); 6]);

        let opened = transitions(&decisions)
            .into_iter()
            .filter(|t| *t == Some(EpisodeTransition::Opened))
            .count();
        assert_eq!(opened, 1);
        assert_eq!(decisions[1].action, DecisionAction::WarningNotification);
        assert_eq!(decisions[2].action, DecisionAction::AlertEscalation);
        assert_eq!(
            decisions[2].parallel_actions,
            vec![DecisionAction::PoliceDashboardEvent]
        );
        assert!(state.is_open());

        let key = &decisions[2].episode.as_ref().unwrap().key;
        assert!(decisions[3..]
            .iter()
            .all(|d| d.episode.as_ref().map(|e| &e.key) == Some(key)));
    }

    #[test]
    fn test_medium_resets_high_run() {
        let (decisions, state) = run(
            &policy(),
            &[
                (RiskLevel::High, 0.9),
                (RiskLevel::High, 0.9),
                (RiskLevel::Medium, 0.6),
                (RiskLevel::High, 0.9),
                (RiskLevel::High, 0.9),
            ],
        );
        assert!(decisions
            .iter()
            .all(|d| d.action != DecisionAction::AlertEscalation));
        assert_eq!(state, EpisodeState::Elevated { high_ticks: 2 });
    }

    #[test]
    fn test_confident_critical_escalates_immediately() {
        let (decisions, state) = run(&policy(), &[(RiskLevel::Critical, 0.9)]);
        assert_eq!(decisions[0].action, DecisionAction::AlertEscalation);
        assert_eq!(
            decisions[0].episode.as_ref().unwrap().transition,
            EpisodeTransition::Opened
        );
        assert_eq!(state.episode().unwrap().peak_level, RiskLevel::Critical);
    }

    #[test]
    fn test_unconfident_critical_is_high() {
        let (decisions, state) = run(&policy(), &[(RiskLevel::Critical, 0.6)]);
        assert_eq!(decisions[0].action, DecisionAction::WarningNotification);
        assert_eq!(state, EpisodeState::Elevated { high_ticks: 1 });
    }

    #[test]
    fn test_cooldown_closes_after_calm_span() {
        let (decisions, state) = run(
            &policy(),
            &[
                (RiskLevel::Critical, 0.95),
                (RiskLevel::Medium, 0.6),
                (RiskLevel::Low, 0.1),
                (RiskLevel::Low, 0.1),
            ],
        );
        assert_eq!(
            transitions(&decisions),
            vec![
                Some(EpisodeTransition::Opened),
                Some(EpisodeTransition::CoolingDown),
                Some(EpisodeTransition::CoolingDown),
                None,
            ]
        );
        assert_eq!(decisions[3].action, DecisionAction::SilentMonitoring);
        assert_eq!(state, EpisodeState::Normal);
    }

    #[test]
    fn test_configured_spans_open_and_close_once_per_run() {
        for sustained in [1usize, 2, 5] {
            for cooldown in [1usize, 4] {
                let p = DecisionPolicy::new(PolicyConfig {
                    sustained_high_ticks: sustained as u32,
                    cooldown_ticks: cooldown as u32,
                    ..PolicyConfig::default()
                });
                let first_run = sustained + 2;
                let mut levels = vec![(RiskLevel::High, 0.9); first_run];
                levels.extend(vec![(RiskLevel::Low, 0.1); cooldown]);
                levels.extend(vec![(RiskLevel::High, 0.9); sustained]);

                let (decisions, state) = run(&p, &levels);
                let seen = transitions(&decisions);
                let label = format!("sustained={sustained} cooldown={cooldown}");

                let opened: Vec<usize> = seen
                    .iter()
                    .enumerate()
                    .filter(|(_, t)| **t == Some(EpisodeTransition::Opened))
                    .map(|(i, _)| i)
                    .collect();
                assert_eq!(
                    opened,
                    vec![sustained - 1, first_run + cooldown + sustained - 1],
                    "{label}"
                );

                let calm = &seen[first_run..first_run + cooldown];
                assert!(
                    calm[..cooldown - 1]
                        .iter()
                        .all(|t| *t == Some(EpisodeTransition::CoolingDown)),
                    "{label}"
                );
                assert_eq!(calm[cooldown - 1], None, "{label}");

                let key = |i: usize| decisions[i].episode.as_ref().unwrap().key.clone();
                assert_ne!(key(opened[0]), key(opened[1]), "{label}");
                assert!(state.is_open(), "{label}");
            }
        }
    }

    #[test]
    fn test_relapse_during_cooldown_keeps_episode() {
        let (decisions, state) = run(
            &policy(),
            &[
                (RiskLevel::Critical, 0.95),
                (RiskLevel::Low, 0.1),
                (RiskLevel::High, 0.9),
            ],
        );
        assert_eq!(
            decisions[2].episode.as_ref().unwrap().transition,
            EpisodeTransition::Continued
        );
        assert_eq!(
            decisions[0].episode.as_ref().unwrap().key,
            decisions[2].episode.as_ref().unwrap().key
        );
        assert!(matches!(state, EpisodeState::Escalated { .. }));
    }

    #[test]
    fn test_route_dominance() {
        let p = policy();
        let a = assessment(RiskLevel::Medium, 0.6, 0);
        let outcome = p.decide("j-1", &EpisodeState::Normal, &a, Some(ROUTE_DEVIATION), true);
        assert_eq!(outcome.decision.action, DecisionAction::SafeRouteSuggestion);

        let crit = assessment(RiskLevel::Critical, 0.95, 0);
        let outcome = p.decide("j-1", &EpisodeState::Normal, &crit, Some(ROUTE_DEVIATION), true);
        assert_eq!(outcome.decision.action, DecisionAction::AlertEscalation);
        assert_eq!(
            outcome.decision.parallel_actions,
            vec![
                DecisionAction::PoliceDashboardEvent,
                DecisionAction::SafeRouteSuggestion
            ]
        );
    }

    #[test]
    fn test_stale_tick_does_not_advance() {
        let p = policy();
        let crit = assessment(RiskLevel::Critical, 0.95, 0);
        let outcome = p.decide("j-1", &EpisodeState::Normal, &crit, None, false);
        assert_eq!(outcome.next, EpisodeState::Normal);
        assert_eq!(outcome.decision.action, DecisionAction::WarningNotification);
        assert!(outcome.escalating_episode().is_none());

        let open = p
            .decide("j-1", &EpisodeState::Normal, &crit, None, true)
            .next;
        let low = assessment(RiskLevel::Low, 0.0, 1);
        let stale = p.decide("j-1", &open, &low, None, false);
        assert_eq!(stale.next, open);
        assert_eq!(stale.decision.action, DecisionAction::AlertEscalation);
    }

    #[test]
    fn test_episode_key_round_trip_and_close() {
        let key = episode_key("j-1", ts(5));
        assert_eq!(parse_episode_key(&key), Some(ts(5)));

        let mut state = EpisodeState::Escalated {
            episode: Episode::open("j-1", ts(5), RiskLevel::High),
        };
        state.record_alert(&key, "alert-1");
        assert_eq!(
            state.episode().unwrap().alert_id.as_deref(),
            Some("alert-1")
        );
        assert!(!state.close_episode("other"));
        assert!(state.close_episode(&key));
        assert_eq!(state, EpisodeState::Normal);
    }
}
