use chrono::{DateTime, Utc};
use matchbook_core::{
    MatchAction, MatchId, MatchOrigin, MatchStatus, MatchTarget, ReceiptId,
    ReceiptTransactionMatch, ScoreBreakdown, UserId,
};
use sqlx::SqliteConnection;
use tracing::info;

use crate::aliases::{learn_alias, AliasLearning};
use crate::db::DbPool;
use crate::error::{conflict_on_unique, invalid_row, StoreError};
use crate::page::{Page, PageRequest};
use crate::receipts::apply_receipt_defaults;

const MATCH_COLUMNS: &str = "id, user_id, receipt_id, transaction_id, transaction_group_id, \
     status, origin, confidence_score, amount_score, date_score, vendor_score, match_reason, \
     created_at, confirmed_at, status_changed_at";

/// A match row about to be written.
#[derive(Debug, Clone, PartialEq)]
pub struct NewMatch {
    pub user_id: UserId,
    pub receipt_id: ReceiptId,
    pub target: MatchTarget,
    pub origin: MatchOrigin,
    pub scores: ScoreBreakdown,
}

#[derive(sqlx::FromRow)]
struct MatchRow {
    id: i64,
    user_id: i64,
    receipt_id: i64,
    transaction_id: Option<i64>,
    transaction_group_id: Option<i64>,
    status: String,
    origin: String,
    confidence_score: f64,
    amount_score: f64,
    date_score: f64,
    vendor_score: f64,
    match_reason: String,
    created_at: DateTime<Utc>,
    confirmed_at: Option<DateTime<Utc>>,
    status_changed_at: Option<DateTime<Utc>>,
}

impl TryFrom<MatchRow> for ReceiptTransactionMatch {
    type Error = StoreError;

    fn try_from(r: MatchRow) -> Result<Self, Self::Error> {
        Ok(ReceiptTransactionMatch {
            id: MatchId(r.id),
            user_id: UserId(r.user_id),
            receipt_id: ReceiptId(r.receipt_id),
            target: MatchTarget::from_columns(r.transaction_id, r.transaction_group_id)
                .map_err(|e| invalid_row("receipt_matches", e))?,
            status: r.status.parse().map_err(|e| invalid_row("receipt_matches", e))?,
            origin: r.origin.parse().map_err(|e| invalid_row("receipt_matches", e))?,
            confidence_score: r.confidence_score,
            amount_score: r.amount_score,
            date_score: r.date_score,
            vendor_score: r.vendor_score,
            match_reason: r.match_reason,
            created_at: r.created_at,
            confirmed_at: r.confirmed_at,
            status_changed_at: r.status_changed_at,
        })
    }
}

fn rows_to_matches(rows: Vec<MatchRow>) -> Result<Vec<ReceiptTransactionMatch>, StoreError> {
    rows.into_iter().map(ReceiptTransactionMatch::try_from).collect()
}

/// Inserts a proposed row unless the receipt or the target already has a
/// confirmed match, or the same pair already has an open proposal. Both
/// cases are a `Conflict`.
pub async fn insert_proposal(
    pool: &DbPool,
    new: &NewMatch,
) -> Result<ReceiptTransactionMatch, StoreError> {
    let row = sqlx::query_as::<_, MatchRow>(&format!(
        r#"
        INSERT INTO receipt_matches (
            user_id, receipt_id, transaction_id, transaction_group_id, status, origin,
            confidence_score, amount_score, date_score, vendor_score, match_reason, created_at
        )
        SELECT ?, ?, ?, ?, 'proposed', ?, ?, ?, ?, ?, ?, ?
        WHERE NOT EXISTS (
            SELECT 1 FROM receipt_matches
            WHERE status = 'confirmed'
              AND (receipt_id = ? OR transaction_id = ? OR transaction_group_id = ?)
        )
        RETURNING {MATCH_COLUMNS}
        "#
    ))
    .bind(new.user_id.0)
    .bind(new.receipt_id.0)
    .bind(new.target.transaction_id().map(|id| id.0))
    .bind(new.target.group_id().map(|id| id.0))
    .bind(new.origin.as_str())
    .bind(new.scores.confidence)
    .bind(new.scores.amount_score)
    .bind(new.scores.date_score)
    .bind(new.scores.vendor_score)
    .bind(&new.scores.reason)
    .bind(Utc::now())
    .bind(new.receipt_id.0)
    .bind(new.target.transaction_id().map(|id| id.0))
    .bind(new.target.group_id().map(|id| id.0))
    .fetch_optional(pool)
    .await
    .map_err(|e| {
        conflict_on_unique(
            e,
            &format!("receipt {} already has an open proposal for {}", new.receipt_id, new.target),
        )
    })?;

    match row {
        Some(row) => row.try_into(),
        None => Err(StoreError::Conflict(format!(
            "receipt {} or {} is already matched",
            new.receipt_id, new.target
        ))),
    }
}

/// Inserts an already-confirmed row (a manual match) and applies the
/// confirmation side effects in the same transaction.
pub async fn insert_confirmed_match(
    pool: &DbPool,
    new: &NewMatch,
    learning: Option<&AliasLearning>,
) -> Result<ReceiptTransactionMatch, StoreError> {
    let mut tx = pool.begin().await?;
    let now = Utc::now();

    let row = sqlx::query_as::<_, MatchRow>(&format!(
        r#"
        INSERT INTO receipt_matches (
            user_id, receipt_id, transaction_id, transaction_group_id, status, origin,
            confidence_score, amount_score, date_score, vendor_score, match_reason,
            created_at, confirmed_at, status_changed_at
        )
        VALUES (?, ?, ?, ?, 'confirmed', ?, ?, ?, ?, ?, ?, ?, ?, ?)
        RETURNING {MATCH_COLUMNS}
        "#
    ))
    .bind(new.user_id.0)
    .bind(new.receipt_id.0)
    .bind(new.target.transaction_id().map(|id| id.0))
    .bind(new.target.group_id().map(|id| id.0))
    .bind(new.origin.as_str())
    .bind(new.scores.confidence)
    .bind(new.scores.amount_score)
    .bind(new.scores.date_score)
    .bind(new.scores.vendor_score)
    .bind(&new.scores.reason)
    .bind(now)
    .bind(now)
    .bind(now)
    .fetch_one(&mut *tx)
    .await
    .map_err(|e| {
        conflict_on_unique(
            e,
            &format!("receipt {} or {} is already matched", new.receipt_id, new.target),
        )
    })?;
    let confirmed = ReceiptTransactionMatch::try_from(row)?;

    apply_confirm_effects(&mut tx, &confirmed, learning).await?;
    tx.commit().await?;

    info!(
        user_id = %confirmed.user_id,
        match_id = %confirmed.id,
        receipt_id = %confirmed.receipt_id,
        match_target = %confirmed.target,
        "manual match confirmed"
    );
    Ok(confirmed)
}

/// Proposed → Confirmed, then alias learning and receipt defaults, all in
/// one transaction.
pub async fn confirm_match(
    pool: &DbPool,
    user_id: UserId,
    id: MatchId,
    learning: Option<&AliasLearning>,
) -> Result<ReceiptTransactionMatch, StoreError> {
    let mut tx = pool.begin().await?;
    let confirmed = transition_on(&mut tx, user_id, id, MatchAction::Confirm).await?;
    apply_confirm_effects(&mut tx, &confirmed, learning).await?;
    tx.commit().await?;
    Ok(confirmed)
}

/// Reject or unmatch. Confirm goes through [`confirm_match`] so its side
/// effects are never skipped.
pub async fn transition_match(
    pool: &DbPool,
    user_id: UserId,
    id: MatchId,
    action: MatchAction,
) -> Result<ReceiptTransactionMatch, StoreError> {
    if action == MatchAction::Confirm {
        return confirm_match(pool, user_id, id, None).await;
    }
    let mut conn = pool.acquire().await?;
    transition_on(&mut conn, user_id, id, action).await
}

async fn apply_confirm_effects(
    conn: &mut SqliteConnection,
    confirmed: &ReceiptTransactionMatch,
    learning: Option<&AliasLearning>,
) -> Result<(), StoreError> {
    if let Some(learning) = learning {
        let alias = learn_alias(conn, learning, confirmed.confidence_score).await?;
        apply_receipt_defaults(
            conn,
            confirmed.receipt_id,
            alias.default_gl_code.as_deref(),
            alias.default_department.as_deref(),
        )
        .await?;
    }
    Ok(())
}

/// Compare-and-swap on the status column. When nothing changes the current
/// row decides between `NotFound` and `Conflict`.
async fn transition_on(
    conn: &mut SqliteConnection,
    user_id: UserId,
    id: MatchId,
    action: MatchAction,
) -> Result<ReceiptTransactionMatch, StoreError> {
    let now = Utc::now();
    let to = action.target();
    let confirmed_at = (to == MatchStatus::Confirmed).then_some(now);

    let row = sqlx::query_as::<_, MatchRow>(&format!(
        r#"
        UPDATE receipt_matches
        SET status = ?, status_changed_at = ?, confirmed_at = COALESCE(?, confirmed_at)
        WHERE id = ? AND user_id = ? AND status = ?
        RETURNING {MATCH_COLUMNS}
        "#
    ))
    .bind(to.as_str())
    .bind(now)
    .bind(confirmed_at)
    .bind(id.0)
    .bind(user_id.0)
    .bind(action.source().as_str())
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| {
        conflict_on_unique(e, &format!("match {id}: receipt or target is already confirmed"))
    })?;

    match row {
        Some(row) => {
            let updated = ReceiptTransactionMatch::try_from(row)?;
            info!(
                user_id = %user_id,
                match_id = %id,
                action = %action,
                status = %updated.status,
                "match transitioned"
            );
            Ok(updated)
        }
        None => {
            let current = fetch_match(conn, user_id, id)
                .await?
                .ok_or_else(|| StoreError::NotFound(format!("match {id}")))?;
            current.status.apply(action)?;
            Err(StoreError::Conflict(format!("match {id} changed concurrently")))
        }
    }
}

async fn fetch_match(
    conn: &mut SqliteConnection,
    user_id: UserId,
    id: MatchId,
) -> Result<Option<ReceiptTransactionMatch>, StoreError> {
    let row = sqlx::query_as::<_, MatchRow>(&format!(
        "SELECT {MATCH_COLUMNS} FROM receipt_matches WHERE id = ? AND user_id = ?"
    ))
    .bind(id.0)
    .bind(user_id.0)
    .fetch_optional(conn)
    .await?;
    row.map(ReceiptTransactionMatch::try_from).transpose()
}

pub async fn get_match(
    pool: &DbPool,
    user_id: UserId,
    id: MatchId,
) -> Result<Option<ReceiptTransactionMatch>, StoreError> {
    let mut conn = pool.acquire().await?;
    fetch_match(&mut conn, user_id, id).await
}

pub async fn open_proposals(
    pool: &DbPool,
    user_id: UserId,
) -> Result<Vec<ReceiptTransactionMatch>, StoreError> {
    let rows = sqlx::query_as::<_, MatchRow>(&format!(
        r#"
        SELECT {MATCH_COLUMNS} FROM receipt_matches
        WHERE user_id = ? AND status = 'proposed'
        ORDER BY id
        "#
    ))
    .bind(user_id.0)
    .fetch_all(pool)
    .await?;
    rows_to_matches(rows)
}

/// Every (receipt, target) pair a reviewer has rejected.
pub async fn rejected_pairs(
    pool: &DbPool,
    user_id: UserId,
) -> Result<Vec<(ReceiptId, MatchTarget)>, StoreError> {
    let rows = sqlx::query_as::<_, (i64, Option<i64>, Option<i64>)>(
        r#"
        SELECT DISTINCT receipt_id, transaction_id, transaction_group_id
        FROM receipt_matches
        WHERE user_id = ? AND status = 'rejected'
        "#,
    )
    .bind(user_id.0)
    .fetch_all(pool)
    .await?;

    rows.into_iter()
        .map(|(receipt, tx, group)| {
            let target = MatchTarget::from_columns(tx, group)
                .map_err(|e| invalid_row("receipt_matches", e))?;
            Ok((ReceiptId(receipt), target))
        })
        .collect()
}

/// Open proposals, highest confidence first.
pub async fn list_proposals(
    pool: &DbPool,
    user_id: UserId,
    request: PageRequest,
) -> Result<Page<ReceiptTransactionMatch>, StoreError> {
    let (total,): (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM receipt_matches WHERE user_id = ? AND status = 'proposed'",
    )
    .bind(user_id.0)
    .fetch_one(pool)
    .await?;

    let rows = sqlx::query_as::<_, MatchRow>(&format!(
        r#"
        SELECT {MATCH_COLUMNS} FROM receipt_matches
        WHERE user_id = ? AND status = 'proposed'
        ORDER BY confidence_score DESC, id ASC
        LIMIT ? OFFSET ?
        "#
    ))
    .bind(user_id.0)
    .bind(request.limit())
    .bind(request.offset())
    .fetch_all(pool)
    .await?;

    Ok(Page::new(rows_to_matches(rows)?, request, total))
}

/// Ids of open proposals at or above `min_confidence`, best first.
pub async fn proposal_ids_at_or_above(
    pool: &DbPool,
    user_id: UserId,
    min_confidence: f64,
) -> Result<Vec<MatchId>, StoreError> {
    let rows = sqlx::query_as::<_, (i64,)>(
        r#"
        SELECT id FROM receipt_matches
        WHERE user_id = ? AND status = 'proposed' AND confidence_score >= ?
        ORDER BY confidence_score DESC, id ASC
        "#,
    )
    .bind(user_id.0)
    .bind(min_confidence)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(|(id,)| MatchId(id)).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aliases::{find_alias, AliasOverrides};
    use crate::db::create_memory_db;
    use crate::receipts::{get_receipt, insert_receipt, NewReceipt};
    use crate::transactions::{insert_transaction, NewTransaction};
    use chrono::NaiveDate;
    use matchbook_core::{Money, TransactionId};

    const USER: UserId = UserId(1);

    async fn seed(pool: &DbPool) -> (ReceiptId, ReceiptId, TransactionId, TransactionId) {
        let date = NaiveDate::from_ymd_opt(2024, 3, 15);
        let mut receipts = Vec::new();
        for vendor in ["STARBUCKS", "PEETS"] {
            let r = insert_receipt(
                pool,
                &NewReceipt {
                    user_id: USER,
                    vendor: Some(vendor.into()),
                    date,
                    amount: Some(Money::from_cents(4500)),
                    currency: "USD".into(),
                    gl_code: None,
                    department: None,
                },
            )
            .await
            .unwrap();
            receipts.push(r.id);
        }
        let mut txs = Vec::new();
        for desc in ["STARBUCKS #123", "PEETS 0042"] {
            let t = insert_transaction(
                pool,
                &NewTransaction {
                    user_id: USER,
                    date: date.unwrap(),
                    amount: Money::from_cents(-4500),
                    description: desc.into(),
                    merchant_name: None,
                },
            )
            .await
            .unwrap();
            txs.push(t.id);
        }
        (receipts[0], receipts[1], txs[0], txs[1])
    }

    fn new_match(receipt: ReceiptId, tx: TransactionId, confidence: f64) -> NewMatch {
        NewMatch {
            user_id: USER,
            receipt_id: receipt,
            target: MatchTarget::Transaction(tx),
            origin: MatchOrigin::Auto,
            scores: ScoreBreakdown {
                confidence,
                amount_score: 100.0,
                date_score: 100.0,
                vendor_score: 100.0,
                reason: "exact amount, same date, exact vendor match".into(),
            },
        }
    }

    fn learning(pattern: &str) -> AliasLearning {
        AliasLearning {
            user_id: USER,
            pattern: pattern.into(),
            display_name: "Starbucks".into(),
            overrides: AliasOverrides::default(),
        }
    }

    #[tokio::test]
    async fn duplicate_open_proposal_is_a_conflict() {
        let pool = create_memory_db().await.unwrap();
        let (r1, _, t1, _) = seed(&pool).await;
        let first = insert_proposal(&pool, &new_match(r1, t1, 95.0)).await.unwrap();
        assert_eq!(first.status, MatchStatus::Proposed);
        assert_eq!(first.origin, MatchOrigin::Auto);

        let err = insert_proposal(&pool, &new_match(r1, t1, 95.0)).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn confirm_locks_receipt_and_target() {
        let pool = create_memory_db().await.unwrap();
        let (r1, r2, t1, t2) = seed(&pool).await;
        let m = insert_proposal(&pool, &new_match(r1, t1, 95.0)).await.unwrap();
        let rival = insert_proposal(&pool, &new_match(r2, t1, 80.0)).await.unwrap();

        let confirmed = confirm_match(&pool, USER, m.id, Some(&learning("starbucks")))
            .await
            .unwrap();
        assert_eq!(confirmed.status, MatchStatus::Confirmed);
        assert!(confirmed.confirmed_at.is_some());

        // The target is taken: confirming the rival fails, as does proposing it again.
        let err = confirm_match(&pool, USER, rival.id, None).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
        let err = insert_proposal(&pool, &new_match(r2, t1, 80.0)).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
        // The receipt is taken too.
        let err = insert_proposal(&pool, &new_match(r1, t2, 60.0)).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));

        let rival = get_match(&pool, USER, rival.id).await.unwrap().unwrap();
        assert_eq!(rival.status, MatchStatus::Proposed);
    }

    #[tokio::test]
    async fn confirm_teaches_alias_and_carries_defaults() {
        let pool = create_memory_db().await.unwrap();
        let (r1, _, t1, _) = seed(&pool).await;
        let m = insert_proposal(&pool, &new_match(r1, t1, 95.0)).await.unwrap();
        let mut learn = learning("starbucks");
        learn.overrides.default_gl_code = Some("6400".into());

        confirm_match(&pool, USER, m.id, Some(&learn)).await.unwrap();

        let alias = find_alias(&pool, USER, "starbucks").await.unwrap().unwrap();
        assert_eq!(alias.match_count, 1);
        let receipt = get_receipt(&pool, USER, r1).await.unwrap().unwrap();
        assert_eq!(receipt.gl_code.as_deref(), Some("6400"));
    }

    #[tokio::test]
    async fn illegal_transitions_conflict_and_unknown_ids_are_not_found() {
        let pool = create_memory_db().await.unwrap();
        let (r1, _, t1, _) = seed(&pool).await;
        let m = insert_proposal(&pool, &new_match(r1, t1, 95.0)).await.unwrap();

        let err = transition_match(&pool, USER, m.id, MatchAction::Unmatch).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));

        let rejected = transition_match(&pool, USER, m.id, MatchAction::Reject).await.unwrap();
        assert_eq!(rejected.status, MatchStatus::Rejected);
        assert!(rejected.status_changed_at.is_some());

        let err = transition_match(&pool, USER, m.id, MatchAction::Reject).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));

        let err = transition_match(&pool, UserId(2), m.id, MatchAction::Reject).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
        let err = transition_match(&pool, USER, MatchId(999), MatchAction::Reject)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));

        let pairs = rejected_pairs(&pool, USER).await.unwrap();
        assert_eq!(pairs, vec![(r1, MatchTarget::Transaction(t1))]);
    }

    #[tokio::test]
    async fn unmatch_frees_both_sides() {
        let pool = create_memory_db().await.unwrap();
        let (r1, _, t1, _) = seed(&pool).await;
        let m = insert_proposal(&pool, &new_match(r1, t1, 95.0)).await.unwrap();
        confirm_match(&pool, USER, m.id, None).await.unwrap();
        let undone = transition_match(&pool, USER, m.id, MatchAction::Unmatch).await.unwrap();
        assert_eq!(undone.status, MatchStatus::Unmatched);

        let again = insert_proposal(&pool, &new_match(r1, t1, 95.0)).await.unwrap();
        assert_ne!(again.id, m.id);
    }

    #[tokio::test]
    async fn manual_match_is_confirmed_immediately() {
        let pool = create_memory_db().await.unwrap();
        let (r1, _, t1, _) = seed(&pool).await;
        let mut new = new_match(r1, t1, 40.0);
        new.origin = MatchOrigin::Manual;
        let m = insert_confirmed_match(&pool, &new, Some(&learning("starbucks")))
            .await
            .unwrap();
        assert_eq!(m.status, MatchStatus::Confirmed);
        assert_eq!(m.origin, MatchOrigin::Manual);

        let err = insert_confirmed_match(&pool, &new, None).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn proposals_page_by_confidence() {
        let pool = create_memory_db().await.unwrap();
        let (r1, r2, t1, t2) = seed(&pool).await;
        let low = insert_proposal(&pool, &new_match(r1, t1, 75.0)).await.unwrap();
        let high = insert_proposal(&pool, &new_match(r2, t2, 92.0)).await.unwrap();
        let mid = insert_proposal(&pool, &new_match(r1, t2, 80.0)).await.unwrap();

        let page = list_proposals(&pool, USER, PageRequest::new(1, 2).unwrap())
            .await
            .unwrap();
        assert_eq!(page.total, 3);
        assert_eq!(page.total_pages, 2);
        let ids: Vec<MatchId> = page.items.iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![high.id, mid.id]);

        let page2 = list_proposals(&pool, USER, PageRequest::new(2, 2).unwrap())
            .await
            .unwrap();
        assert_eq!(page2.items[0].id, low.id);

        let selected = proposal_ids_at_or_above(&pool, USER, 80.0).await.unwrap();
        assert_eq!(selected, vec![high.id, mid.id]);
    }
}
