//! Risk aggregation: combining active factors into one level and confidence.
//!
//! # Calibration
//!
//! All weights and level thresholds live in the [`WeightTable`] and nowhere
//! else. Factors report *whether* and *how strongly* they fired; the table
//! decides what that is worth.
//!
//! * `score = Σ weight(name) × strength`, summed in factor-name order so that
//!   the result does not depend on evaluation order
//! * `level` is the highest threshold the score reaches
//! * `confidence = clamp((score / normalizer) × min(1, n / corroborating), 0, 1)`
//!
//! The corroboration term means a single factor is at most half as confident
//! as the same score backed by two independent factors.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::error;

use crate::error::EngineError;
use crate::factors::{
    ActiveFactor, ISOLATED_AREA, LOW_BATTERY, NIGHT_TIME, ROUTE_DEVIATION, SPEED_ANOMALY,
};
use crate::model::RiskLevel;

/// Score thresholds for each non-LOW level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LevelThresholds {
    pub medium: f64,
    pub high: f64,
    pub critical: f64,
}

impl Default for LevelThresholds {
    fn default() -> Self {
        Self {
            medium: 0.30,
            high: 0.50,
            critical: 0.70,
        }
    }
}

impl LevelThresholds {
    pub fn level_for(&self, score: f64) -> RiskLevel {
        if score >= self.critical {
            RiskLevel::Critical
        } else if score >= self.high {
            RiskLevel::High
        } else if score >= self.medium {
            RiskLevel::Medium
        } else {
            RiskLevel::Low
        }
    }
}

/// Factor weights and level thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WeightTable {
    /// Weight per factor name.
    pub factors: BTreeMap<String, f64>,
    pub thresholds: LevelThresholds,
    /// Score at which confidence saturates.
    pub confidence_normalizer: f64,
    /// Number of active factors needed for full confidence.
    pub corroborating_factors: u32,
}

impl Default for WeightTable {
    fn default() -> Self {
        let factors = [
            (NIGHT_TIME, 0.30),
            (ISOLATED_AREA, 0.20),
            (ROUTE_DEVIATION, 0.20),
            (SPEED_ANOMALY, 0.20),
            (LOW_BATTERY, 0.15),
        ]
        .into_iter()
        .map(|(name, weight)| (name.to_string(), weight))
        .collect();

        Self {
            factors,
            thresholds: LevelThresholds::default(),
            confidence_normalizer: 0.70,
            corroborating_factors: 2,
        }
    }
}

impl WeightTable {
    pub fn weight(&self, factor: &str) -> Option<f64> {
        self.factors.get(factor).copied()
    }

    /// Every inconsistency in the table, formatted for config validation.
    pub fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();

        for (name, weight) in &self.factors {
            if !weight.is_finite() || *weight < 0.0 {
                problems.push(format!("weights.factors.{name} must be a non-negative number"));
            }
        }

        let t = &self.thresholds;
        let ascending = t.medium > 0.0 && t.medium < t.high && t.high < t.critical;
        if !ascending || !t.critical.is_finite() {
            problems.push(format!(
                "weights.thresholds must be ascending and positive (medium={}, high={}, critical={})",
                t.medium, t.high, t.critical
            ));
        }
        if !(self.confidence_normalizer.is_finite() && self.confidence_normalizer > 0.0) {
            problems.push("weights.confidence_normalizer must be > 0".to_string());
        }
        if self.corroborating_factors == 0 {
            problems.push("weights.corroborating_factors must be >= 1".to_string());
        }

        problems
    }
}

/// Output of one aggregation.
#[derive(Debug, Clone, PartialEq)]
pub struct Aggregate {
    pub level: RiskLevel,
    pub confidence: f64,
    pub score: f64,
    /// Factor with the largest contribution. Ties go to `route_deviation`,
    /// then to the first name in order.
    pub dominant: Option<String>,
}

impl Aggregate {
    pub fn empty() -> Self {
        Self {
            level: RiskLevel::Low,
            confidence: 0.0,
            score: 0.0,
            dominant: None,
        }
    }
}

/// Turns a set of active factors into a level and confidence.
#[derive(Debug, Clone)]
pub struct RiskAggregator {
    table: WeightTable,
}

impl RiskAggregator {
    pub fn new(table: WeightTable) -> Self {
        Self { table }
    }

    pub fn table(&self) -> &WeightTable {
        &self.table
    }

    /// Aggregate one tick's active factors.
    ///
    /// A factor with no weight entry or a strength outside `(0, 1]` is a
    /// policy error; it is never silently scored as LOW.
    pub fn aggregate(&self, active: &[ActiveFactor]) -> Result<Aggregate, EngineError> {
        if active.is_empty() {
            return Ok(Aggregate::empty());
        }

        let mut contributions: Vec<(&str, f64)> = Vec::with_capacity(active.len());
        for factor in active {
            let weight = self.table.weight(&factor.name).ok_or_else(|| {
                error!(factor = %factor.name, "Active factor has no weight entry");
                EngineError::Policy(format!("factor '{}' has no weight entry", factor.name))
            })?;

            if !factor.strength.is_finite() || factor.strength <= 0.0 || factor.strength > 1.0 {
                error!(factor = %factor.name, strength = factor.strength, "Factor strength out of range");
                return Err(EngineError::Policy(format!(
                    "factor '{}' reported strength {} outside (0, 1]",
                    factor.name, factor.strength
                )));
            }

            contributions.push((factor.name.as_str(), weight * factor.strength));
        }
        contributions.sort_by(|a, b| a.0.cmp(b.0));

        let score: f64 = contributions.iter().map(|(_, c)| c).sum();
        let level = self.table.thresholds.level_for(score);

        let n = contributions.len() as f64;
        let corroboration = (n / f64::from(self.table.corroborating_factors)).min(1.0);
        let confidence =
            ((score / self.table.confidence_normalizer) * corroboration).clamp(0.0, 1.0);

        let dominant = contributions
            .iter()
            .fold(None::<(&str, f64)>, |best, &(name, c)| match best {
                None => Some((name, c)),
                Some((_, bc)) if c > bc => Some((name, c)),
                Some((_, bc)) if c == bc && name == ROUTE_DEVIATION => Some((name, c)),
                keep => keep,
            })
            .map(|(name, _)| name.to_string());

        Ok(Aggregate {
            level,
            confidence,
            score,
            dominant,
        })
    }
}
