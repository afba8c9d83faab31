//! In-memory per-journey state.
//!
//! Each live journey has one [`JourneySession`] behind its own
//! `tokio::sync::Mutex`. The map of sessions is a sharded [`DashMap`], so
//! unrelated journeys never contend on a shared lock; a map shard is only held
//! long enough to clone the session's `Arc`.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use tokio::sync::Mutex;

use crate::config::WindowConfig;
use crate::model::{DecisionAction, Journey, RiskLevel, TelemetryPoint, TickOutcome};
use crate::policy::EpisodeState;

/// An admitted point with the outcome computed for it.
#[derive(Debug, Clone, PartialEq)]
pub struct WindowEntry {
    pub point: TelemetryPoint,
    pub outcome: TickOutcome,
}

/// Bounded, timestamp-ordered buffer of a journey's most recent points.
///
/// Ordering is by the point's own timestamp, never by arrival, so late points
/// from an offline queue land where they belong.
#[derive(Debug, Clone)]
pub struct RollingWindow {
    entries: BTreeMap<DateTime<Utc>, WindowEntry>,
    max_points: usize,
    horizon: Duration,
}

impl RollingWindow {
    pub fn new(config: &WindowConfig) -> Self {
        Self {
            entries: BTreeMap::new(),
            max_points: config.max_points.max(1),
            horizon: Duration::seconds(config.retention_horizon_secs),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// True once the bound has been reached. Until then nothing has been
    /// evicted.
    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.max_points
    }

    pub fn get(&self, key: &DateTime<Utc>) -> Option<&WindowEntry> {
        self.entries.get(key)
    }

    pub fn newest(&self) -> Option<DateTime<Utc>> {
        self.entries.keys().next_back().copied()
    }

    pub fn oldest(&self) -> Option<DateTime<Utc>> {
        self.entries.keys().next().copied()
    }

    /// A point is stale when it is older than the horizon measured back from
    /// the newest point already in the window.
    pub fn is_stale(&self, key: DateTime<Utc>) -> bool {
        self.newest().is_some_and(|newest| key < newest - self.horizon)
    }

    /// Points recorded before `key` that are still inside the horizon, oldest
    /// first.
    pub fn recent_before(&self, key: DateTime<Utc>) -> Vec<&TelemetryPoint> {
        let reference = self.newest().map_or(key, |newest| newest.max(key));
        let cutoff = reference - self.horizon;
        if key <= cutoff {
            return Vec::new();
        }
        self.entries
            .range(cutoff..key)
            .map(|(_, entry)| &entry.point)
            .collect()
    }

    /// Insert in timestamp order, evicting the oldest entries beyond the bound.
    /// Returns how many entries were evicted.
    pub fn insert(&mut self, point: TelemetryPoint, outcome: TickOutcome) -> usize {
        self.entries
            .insert(point.key(), WindowEntry { point, outcome });

        let mut evicted = 0;
        while self.entries.len() > self.max_points {
            self.entries.pop_first();
            evicted += 1;
        }
        evicted
    }

    pub fn entries(&self) -> impl Iterator<Item = &WindowEntry> {
        self.entries.values()
    }
}

/// Live state of one journey.
#[derive(Debug, Clone)]
pub struct JourneySession {
    pub journey: Journey,
    pub window: RollingWindow,
    pub episode: EpisodeState,
    pub last_level: Option<RiskLevel>,
    pub last_action: Option<DecisionAction>,
}

impl JourneySession {
    pub fn new(journey: Journey, window: &WindowConfig) -> Self {
        Self {
            journey,
            window: RollingWindow::new(window),
            episode: EpisodeState::Normal,
            last_level: None,
            last_action: None,
        }
    }
}

pub type SharedSession = Arc<Mutex<JourneySession>>;

/// Sharded map of live sessions keyed by journey id.
#[derive(Default)]
pub struct SessionStore {
    sessions: DashMap<String, SharedSession>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, journey_id: &str) -> Option<SharedSession> {
        self.sessions.get(journey_id).map(|s| Arc::clone(s.value()))
    }

    /// Insert `session` unless one already exists; either way return the
    /// session that is now in the map. Concurrent hydrations of the same
    /// journey therefore converge on a single session.
    pub fn insert_if_absent(&self, session: JourneySession) -> SharedSession {
        let id = session.journey.id.clone();
        let entry = self
            .sessions
            .entry(id)
            .or_insert_with(|| Arc::new(Mutex::new(session)));
        Arc::clone(entry.value())
    }

    pub fn remove(&self, journey_id: &str) -> Option<SharedSession> {
        self.sessions.remove(journey_id).map(|(_, s)| s)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
