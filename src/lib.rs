//! safepath - a telemetry-driven journey risk engine.
//!
//! # Overview
//!
//! A traveller's device streams periodic telemetry (location, speed, movement
//! state, battery) while a journey is in progress. Each reading is scored by a
//! set of risk factors, the weighted factors are aggregated into a risk level
//! with a confidence, and a decision policy maps the result to an action. A
//! sustained or confident run of high risk opens an escalation episode, which
//! raises exactly one automated alert however many readings it spans.
//!
//! Readings are idempotent on `(journey_id, timestamp)` and ordered by their
//! own timestamp, so resubmissions and offline backlogs are safe.
//!
//! # Modules
//!
//! - [`model`]: Journeys, telemetry, assessments, decisions and alerts
//! - [`config`]: TOML and environment configuration
//! - [`factors`]: Pluggable risk factor evaluators
//! - [`aggregation`]: Weighted scoring into a level and confidence
//! - [`policy`]: Decision policy and the escalation episode state machine
//! - [`session`]: Live per-journey state and the rolling window
//! - [`admission`]: Reading validation, replay and staleness classification
//! - [`escalation`]: One alert per episode, plus notification intents
//! - [`engine`]: The per-tick pipeline and journey lifecycle
//! - [`storage`]: SQLite storage layer
//! - [`api`]: HTTP API handlers

pub mod admission;
pub mod aggregation;
pub mod api;
pub mod config;
pub mod engine;
pub mod error;
pub mod escalation;
pub mod factors;
pub mod geo;
pub mod model;
pub mod policy;
pub mod session;
pub mod storage;
