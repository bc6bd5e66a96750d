use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::UserId;

/// A learned mapping from normalised vendor text to a canonical name and the
/// accounting defaults last used for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VendorAlias {
    pub user_id: UserId,
    /// Normalised vendor pattern, e.g. `"starbucks"`.
    pub pattern: String,
    pub display_name: String,
    pub category: Option<String>,
    pub default_gl_code: Option<String>,
    pub default_department: Option<String>,
    /// Mean confidence of the confirmed matches that taught this alias.
    pub confidence: f64,
    pub match_count: i64,
    pub updated_at: Option<DateTime<Utc>>,
}

impl VendorAlias {
    /// Folds one more confirmed match into the running confidence.
    pub fn reinforce(&mut self, match_confidence: f64) {
        let total = self.confidence * self.match_count as f64 + match_confidence;
        self.match_count += 1;
        self.confidence = total / self.match_count as f64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reinforce_keeps_running_mean() {
        let mut alias = VendorAlias {
            user_id: UserId(1),
            pattern: "starbucks".into(),
            display_name: "Starbucks".into(),
            category: None,
            default_gl_code: None,
            default_department: None,
            confidence: 90.0,
            match_count: 1,
            updated_at: None,
        };
        alias.reinforce(80.0);
        assert_eq!(alias.match_count, 2);
        assert!((alias.confidence - 85.0).abs() < 1e-9);
    }
}
