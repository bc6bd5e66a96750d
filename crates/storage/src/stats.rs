use matchbook_core::UserId;
use serde::Serialize;

use crate::db::DbPool;
use crate::error::StoreError;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MatchStats {
    pub matched_count: i64,
    pub proposed_count: i64,
    pub unmatched_receipts_count: i64,
    pub unmatched_transactions_count: i64,
    /// Share of confirmed matches that came from auto proposals, 0–100.
    pub auto_match_rate: f64,
    /// Mean confidence of confirmed matches.
    pub average_confidence: f64,
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

pub async fn match_stats(pool: &DbPool, user_id: UserId) -> Result<MatchStats, StoreError> {
    let (matched, auto, avg): (i64, i64, Option<f64>) = sqlx::query_as(
        r#"
        SELECT COUNT(*), COALESCE(SUM(origin = 'auto'), 0), AVG(confidence_score)
        FROM receipt_matches
        WHERE user_id = ? AND status = 'confirmed'
        "#,
    )
    .bind(user_id.0)
    .fetch_one(pool)
    .await?;

    let (proposed,): (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM receipt_matches WHERE user_id = ? AND status = 'proposed'",
    )
    .bind(user_id.0)
    .fetch_one(pool)
    .await?;

    let (unmatched_receipts,): (i64,) = sqlx::query_as(
        r#"
        SELECT COUNT(*) FROM receipts r
        WHERE r.user_id = ?
          AND NOT EXISTS (
              SELECT 1 FROM receipt_matches m
              WHERE m.receipt_id = r.id AND m.status = 'confirmed'
          )
        "#,
    )
    .bind(user_id.0)
    .fetch_one(pool)
    .await?;

    // A grouped transaction counts as matched when its group is.
    let (unmatched_transactions,): (i64,) = sqlx::query_as(
        r#"
        SELECT COUNT(*) FROM transactions t
        WHERE t.user_id = ?
          AND NOT EXISTS (
              SELECT 1 FROM receipt_matches m
              WHERE m.status = 'confirmed'
                AND (m.transaction_id = t.id
                     OR (t.group_id IS NOT NULL AND m.transaction_group_id = t.group_id))
          )
        "#,
    )
    .bind(user_id.0)
    .fetch_one(pool)
    .await?;

    let auto_match_rate = if matched > 0 {
        round2(auto as f64 / matched as f64 * 100.0)
    } else {
        0.0
    };

    Ok(MatchStats {
        matched_count: matched,
        proposed_count: proposed,
        unmatched_receipts_count: unmatched_receipts,
        unmatched_transactions_count: unmatched_transactions,
        auto_match_rate,
        average_confidence: avg.map(round2).unwrap_or(0.0),
    })
}
