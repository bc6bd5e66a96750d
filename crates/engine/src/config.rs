use matchbook_core::{MatchError, Money};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error(transparent)]
    Invalid(#[from] MatchError),
}

/// Relative weight of each signal in the composite confidence. Must sum to 1.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoreWeights {
    pub amount: f64,
    pub date: f64,
    pub vendor: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            amount: 0.40,
            date: 0.20,
            vendor: 0.40,
        }
    }
}

/// Tunables for candidate generation, scoring and auto-proposal. Passed
/// explicitly so scoring stays a pure function of inputs and configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchingConfig {
    /// Candidates must be dated within this many days of the receipt.
    pub date_window_days: i64,
    /// Fixed amount slack, in cents.
    pub amount_tolerance_cents: i64,
    /// Proportional amount slack (tips, tax, rounding), as a fraction.
    pub amount_tolerance_pct: f64,
    pub weights: ScoreWeights,
    /// Vendor score floor when one vendor pattern appears inside the other text.
    pub substring_floor: f64,
    /// Vendor score floor when both sides resolve to the same learned alias.
    pub alias_floor: f64,
    /// Vendor similarity at or above this counts as "similar vendor".
    pub similar_vendor_threshold: f64,
    /// Minimum confidence for the auto-matcher to propose a pair.
    pub auto_propose_threshold: f64,
    /// Top-two confidence gap below which a run outcome is ambiguous.
    pub ambiguity_epsilon: f64,
    /// Never auto-propose a (receipt, target) pair that was rejected before.
    pub suppress_rejected_pairs: bool,
    pub default_candidate_limit: usize,
    pub max_candidate_limit: usize,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            date_window_days: 3,
            amount_tolerance_cents: 500,
            amount_tolerance_pct: 0.20,
            weights: ScoreWeights::default(),
            substring_floor: 85.0,
            alias_floor: 95.0,
            similar_vendor_threshold: 60.0,
            auto_propose_threshold: 70.0,
            ambiguity_epsilon: 1.0,
            suppress_rejected_pairs: true,
            default_candidate_limit: 10,
            max_candidate_limit: 50,
        }
    }
}

/// Widest accepted `date_window_days`.
pub const MAX_DATE_WINDOW_DAYS: i64 = 366;

fn check_score(name: &str, value: f64) -> Result<(), MatchError> {
    if (0.0..=100.0).contains(&value) {
        Ok(())
    } else {
        Err(MatchError::Validation(format!(
            "{name} must be between 0 and 100, got {value}"
        )))
    }
}

impl MatchingConfig {
    pub fn from_toml(toml_content: &str) -> Result<Self, ConfigError> {
        let config: MatchingConfig = toml::from_str(toml_content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), MatchError> {
        let w = &self.weights;
        if [w.amount, w.date, w.vendor].iter().any(|x| *x < 0.0) {
            return Err(MatchError::Validation("score weights must not be negative".into()));
        }
        let sum = w.amount + w.date + w.vendor;
        if (sum - 1.0).abs() > 1e-6 {
            return Err(MatchError::Validation(format!(
                "score weights must sum to 1, got {sum}"
            )));
        }
        if !(0..=MAX_DATE_WINDOW_DAYS).contains(&self.date_window_days) {
            return Err(MatchError::Validation(format!(
                "date_window_days must be between 0 and {MAX_DATE_WINDOW_DAYS}, got {}",
                self.date_window_days
            )));
        }
        if self.amount_tolerance_cents < 0 || self.amount_tolerance_pct < 0.0 {
            return Err(MatchError::Validation("amount tolerances must not be negative".into()));
        }
        check_score("substring_floor", self.substring_floor)?;
        check_score("alias_floor", self.alias_floor)?;
        check_score("similar_vendor_threshold", self.similar_vendor_threshold)?;
        check_score("auto_propose_threshold", self.auto_propose_threshold)?;
        if !(0.0..=100.0).contains(&self.ambiguity_epsilon) {
            return Err(MatchError::Validation("ambiguity_epsilon must be within 0..=100".into()));
        }
        if self.default_candidate_limit == 0
            || self.default_candidate_limit > self.max_candidate_limit
        {
            return Err(MatchError::Validation(
                "default_candidate_limit must be between 1 and max_candidate_limit".into(),
            ));
        }
        Ok(())
    }

    /// Largest acceptable amount difference for a receipt, in cents.
    pub fn amount_tolerance_for(&self, receipt_amount: Money) -> i64 {
        let proportional =
            (receipt_amount.abs().to_cents() as f64 * self.amount_tolerance_pct).round() as i64;
        self.amount_tolerance_cents.max(proportional)
    }

    /// Resolves a caller-requested candidate limit: default when absent,
    /// capped at the maximum, zero rejected.
    pub fn candidate_limit(&self, requested: Option<usize>) -> Result<usize, MatchError> {
        match requested {
            None => Ok(self.default_candidate_limit),
            Some(0) => Err(MatchError::Validation("limit must be at least 1".into())),
            Some(n) => Ok(n.min(self.max_candidate_limit)),
        }
    }
}
