use std::cmp::Ordering;

use matchbook_core::period::days_between;
use matchbook_core::{MatchError, Money, Receipt, ScoreBreakdown};
use serde::Serialize;

use crate::candidate::MatchCandidate;
use crate::config::MatchingConfig;
use crate::util::clamp_score;
use crate::vendor::{compare_vendors, vendor_pattern, AliasIndex, VendorMatch};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredCandidate {
    #[serde(flatten)]
    pub candidate: MatchCandidate,
    pub score: ScoreBreakdown,
}

/// Computes the amount, date and vendor sub-scores and the weighted composite.
/// Scoring is a pure function of the receipt, the candidate, the aliases and
/// the configuration.
pub struct ConfidenceScorer<'a> {
    config: &'a MatchingConfig,
    aliases: &'a AliasIndex,
}

impl<'a> ConfidenceScorer<'a> {
    pub fn new(config: &'a MatchingConfig, aliases: &'a AliasIndex) -> Self {
        Self { config, aliases }
    }

    /// Returns the score and the amount difference in cents.
    pub fn amount_score(&self, receipt_amount: Money, candidate_amount: Money) -> (f64, i64) {
        let diff = receipt_amount.magnitude_diff_cents(candidate_amount);
        if diff == 0 {
            return (100.0, 0);
        }
        let tolerance = self.config.amount_tolerance_for(receipt_amount);
        if tolerance == 0 || diff > tolerance {
            return (0.0, diff);
        }
        (clamp_score(100.0 * (1.0 - diff as f64 / tolerance as f64)), diff)
    }

    pub fn date_score(&self, days_apart: i64) -> f64 {
        if days_apart == 0 {
            return 100.0;
        }
        let window = self.config.date_window_days;
        if days_apart >= window {
            return 0.0;
        }
        clamp_score(100.0 * (1.0 - days_apart as f64 / window as f64))
    }

    /// `None` when the receipt carries no usable vendor text; the vendor
    /// signal then drops out of the composite.
    pub fn vendor_match(
        &self,
        receipt: &Receipt,
        candidate: &MatchCandidate,
    ) -> Option<VendorMatch> {
        let vendor = receipt.vendor_text()?;
        if vendor_pattern(vendor).is_empty() {
            return None;
        }
        let mut result =
            compare_vendors(vendor, &candidate.vendor_texts(), self.aliases, self.config);
        result.score = clamp_score(result.score);
        Some(result)
    }

    pub fn score(
        &self,
        receipt: &Receipt,
        candidate: &MatchCandidate,
    ) -> Result<ScoreBreakdown, MatchError> {
        let (date, amount) = receipt.matchable_fields()?;
        let (amount_score, diff_cents) = self.amount_score(amount, candidate.amount);
        let days_apart = days_between(date, candidate.date);
        let date_score = self.date_score(days_apart);
        let vendor = self.vendor_match(receipt, candidate);

        let w = &self.config.weights;
        let mut weighted = w.amount * amount_score + w.date * date_score;
        let mut total_weight = w.amount + w.date;
        if let Some(v) = vendor {
            weighted += w.vendor * v.score;
            total_weight += w.vendor;
        }
        let confidence = if total_weight > 0.0 {
            clamp_score(weighted / total_weight)
        } else {
            0.0
        };

        let tolerance = self.config.amount_tolerance_for(amount);
        let reason = [
            amount_phrase(diff_cents, tolerance),
            date_phrase(days_apart),
            vendor.map_or("no vendor on receipt", |v| v.kind.describe()).to_string(),
        ]
        .join(", ");

        Ok(ScoreBreakdown {
            confidence,
            amount_score,
            date_score,
            vendor_score: vendor.map_or(0.0, |v| v.score),
            reason,
        })
    }

    /// Scores every candidate and returns them best first.
    pub fn score_all(
        &self,
        receipt: &Receipt,
        candidates: Vec<MatchCandidate>,
    ) -> Result<Vec<ScoredCandidate>, MatchError> {
        let mut scored = candidates
            .into_iter()
            .map(|candidate| {
                let score = self.score(receipt, &candidate)?;
                Ok(ScoredCandidate { candidate, score })
            })
            .collect::<Result<Vec<_>, MatchError>>()?;
        rank(&mut scored);
        Ok(scored)
    }
}

/// Confidence descending, vendor score descending, then transactions before
/// groups and lower ids first.
pub fn rank(scored: &mut [ScoredCandidate]) {
    scored.sort_by(compare_ranked);
}

fn compare_ranked(a: &ScoredCandidate, b: &ScoredCandidate) -> Ordering {
    b.score
        .confidence
        .total_cmp(&a.score.confidence)
        .then_with(|| b.score.vendor_score.total_cmp(&a.score.vendor_score))
        .then_with(|| a.candidate.target.cmp(&b.candidate.target))
}

fn amount_phrase(diff_cents: i64, tolerance_cents: i64) -> String {
    let diff = Money::from_cents(diff_cents);
    match diff_cents {
        0 => "exact amount".to_string(),
        d if d <= tolerance_cents => format!("amount within {diff}"),
        _ => format!("amount off by {diff}"),
    }
}

fn date_phrase(days: i64) -> String {
    match days {
        0 => "same date".to_string(),
        1 => "1 day apart".to_string(),
        n => format!("{n} days apart"),
    }
}
