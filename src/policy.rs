//! Numeric policy: component weights, decision bands, averaging and ranking
//! modes. One `Policy` value feeds both the compile path and the
//! single-student preview so the two can never drift apart.

use serde::Deserialize;

use crate::error::{EngineError, Result};
use crate::models::Decision;

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct Weights {
    pub continuous: f64,
    pub practical: f64,
    pub exam: f64,
}

impl Default for Weights {
    fn default() -> Self {
        Self {
            continuous: 0.2,
            practical: 0.2,
            exam: 0.6,
        }
    }
}

impl Weights {
    pub fn validate(&self) -> Result<()> {
        for (name, weight) in [
            ("continuous", self.continuous),
            ("practical", self.practical),
            ("exam", self.exam),
        ] {
            if !weight.is_finite() || weight < 0.0 {
                return Err(EngineError::invalid(format!(
                    "{name} weight must be a non-negative number, got {weight}"
                )));
            }
        }
        Ok(())
    }
}

/// A student falls in the first band whose average and credit ratio floors
/// they both meet.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct DecisionBand {
    pub decision: Decision,
    pub min_average: f64,
    pub min_credit_ratio: f64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DecisionBands {
    pub bands: Vec<DecisionBand>,
    pub fallback: Decision,
}

impl Default for DecisionBands {
    fn default() -> Self {
        Self {
            bands: vec![
                DecisionBand {
                    decision: Decision::Admitted,
                    min_average: 10.0,
                    min_credit_ratio: 1.0,
                },
                DecisionBand {
                    decision: Decision::AdmittedWithDebt,
                    min_average: 10.0,
                    min_credit_ratio: 0.75,
                },
                DecisionBand {
                    decision: Decision::Deferred,
                    min_average: 8.0,
                    min_credit_ratio: 0.5,
                },
            ],
            fallback: Decision::Refused,
        }
    }
}

impl DecisionBands {
    /// Bands must run strictest first and may not hand out `Blocked`, which
    /// only the administrative block produces.
    pub fn validate(&self) -> Result<()> {
        if self.fallback == Decision::Blocked {
            return Err(EngineError::invalid("fallback decision cannot be BLOCKED"));
        }
        for pair in self.bands.windows(2) {
            if pair[1].min_average > pair[0].min_average
                || (pair[1].min_average == pair[0].min_average
                    && pair[1].min_credit_ratio > pair[0].min_credit_ratio)
            {
                return Err(EngineError::invalid(format!(
                    "decision band {} is stricter than the band before it",
                    pair[1].decision
                )));
            }
        }
        for band in &self.bands {
            if band.decision == Decision::Blocked {
                return Err(EngineError::invalid("decision bands cannot produce BLOCKED"));
            }
            if !(0.0..=20.0).contains(&band.min_average)
                || !(0.0..=1.0).contains(&band.min_credit_ratio)
            {
                return Err(EngineError::invalid(format!(
                    "decision band {} has an out-of-range floor",
                    band.decision
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AverageMode {
    #[default]
    Simple,
    CreditWeighted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RankingMode {
    /// 1..n in sort order; ties broken by student id.
    #[default]
    Sequential,
    /// Equal averages share a rank and the next distinct average gets +1.
    SharedTies,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(default)]
pub struct Policy {
    pub weights: Weights,
    pub decision_bands: DecisionBands,
    pub average_mode: AverageMode,
    pub ranking_mode: RankingMode,
}

impl Policy {
    pub fn validate(&self) -> Result<()> {
        self.weights.validate()?;
        self.decision_bands.validate()
    }
}
