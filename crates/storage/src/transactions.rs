use std::collections::HashSet;

use chrono::NaiveDate;
use matchbook_core::{
    DateRange, GroupId, Money, Transaction, TransactionGroup, TransactionId, UserId,
};
use serde::Deserialize;
use tracing::info;

use crate::db::DbPool;
use crate::error::StoreError;

const TRANSACTION_COLUMNS: &str =
    "t.id, t.user_id, t.date, t.amount_cents, t.description, t.merchant_name, t.group_id";

const GROUP_COLUMNS: &str = "g.id, g.user_id, g.name, g.amount_cents, g.display_date, \
     (SELECT COUNT(*) FROM transactions m WHERE m.group_id = g.id) AS member_count";

#[derive(Debug, Clone, Deserialize)]
pub struct NewTransaction {
    pub user_id: UserId,
    pub date: NaiveDate,
    pub amount: Money,
    pub description: String,
    #[serde(default)]
    pub merchant_name: Option<String>,
}

#[derive(sqlx::FromRow)]
struct TransactionRow {
    id: i64,
    user_id: i64,
    date: NaiveDate,
    amount_cents: i64,
    description: String,
    merchant_name: Option<String>,
    group_id: Option<i64>,
}

impl From<TransactionRow> for Transaction {
    fn from(r: TransactionRow) -> Self {
        Transaction {
            id: TransactionId(r.id),
            user_id: UserId(r.user_id),
            date: r.date,
            amount: Money::from_cents(r.amount_cents),
            description: r.description,
            merchant_name: r.merchant_name,
            group_id: r.group_id.map(GroupId),
        }
    }
}

#[derive(sqlx::FromRow)]
struct GroupRow {
    id: i64,
    user_id: i64,
    name: String,
    amount_cents: i64,
    display_date: NaiveDate,
    member_count: i64,
}

impl From<GroupRow> for TransactionGroup {
    fn from(r: GroupRow) -> Self {
        TransactionGroup {
            id: GroupId(r.id),
            user_id: UserId(r.user_id),
            name: r.name,
            amount: Money::from_cents(r.amount_cents),
            display_date: r.display_date,
            member_count: u32::try_from(r.member_count).unwrap_or(u32::MAX),
        }
    }
}

pub async fn insert_transaction(
    pool: &DbPool,
    tx: &NewTransaction,
) -> Result<Transaction, StoreError> {
    let row = sqlx::query_as::<_, TransactionRow>(
        r#"
        INSERT INTO transactions (user_id, date, amount_cents, description, merchant_name)
        VALUES (?, ?, ?, ?, ?)
        RETURNING id, user_id, date, amount_cents, description, merchant_name, group_id
        "#,
    )
    .bind(tx.user_id.0)
    .bind(tx.date)
    .bind(tx.amount.to_cents())
    .bind(&tx.description)
    .bind(&tx.merchant_name)
    .fetch_one(pool)
    .await?;
    Ok(row.into())
}

pub async fn get_transaction(
    pool: &DbPool,
    user_id: UserId,
    id: TransactionId,
) -> Result<Option<Transaction>, StoreError> {
    let row = sqlx::query_as::<_, TransactionRow>(&format!(
        "SELECT {TRANSACTION_COLUMNS} FROM transactions t WHERE t.id = ? AND t.user_id = ?"
    ))
    .bind(id.0)
    .bind(user_id.0)
    .fetch_optional(pool)
    .await?;
    Ok(row.map(Transaction::from))
}

pub async fn get_group(
    pool: &DbPool,
    user_id: UserId,
    id: GroupId,
) -> Result<Option<TransactionGroup>, StoreError> {
    let row = sqlx::query_as::<_, GroupRow>(&format!(
        "SELECT {GROUP_COLUMNS} FROM transaction_groups g WHERE g.id = ? AND g.user_id = ?"
    ))
    .bind(id.0)
    .bind(user_id.0)
    .fetch_optional(pool)
    .await?;
    Ok(row.map(TransactionGroup::from))
}

pub async fn group_members(
    pool: &DbPool,
    user_id: UserId,
    id: GroupId,
) -> Result<Vec<Transaction>, StoreError> {
    let rows = sqlx::query_as::<_, TransactionRow>(&format!(
        r#"
        SELECT {TRANSACTION_COLUMNS} FROM transactions t
        WHERE t.group_id = ? AND t.user_id = ?
        ORDER BY t.date, t.id
        "#
    ))
    .bind(id.0)
    .bind(user_id.0)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(Transaction::from).collect())
}

/// Combines ungrouped, unmatched transactions into one matchable group. The
/// group takes the summed amount and the earliest member date. Repeated ids
/// count once.
pub async fn create_group(
    pool: &DbPool,
    user_id: UserId,
    name: &str,
    members: &[TransactionId],
) -> Result<TransactionGroup, StoreError> {
    let mut seen = HashSet::new();
    let members: Vec<TransactionId> = members
        .iter()
        .copied()
        .filter(|id| seen.insert(*id))
        .collect();
    if members.len() < 2 {
        return Err(StoreError::Invalid(
            "a group needs at least two distinct transactions".into(),
        ));
    }

    let mut tx = pool.begin().await?;

    let mut total_cents = 0i64;
    let mut display_date: Option<NaiveDate> = None;
    for id in &members {
        let row = sqlx::query_as::<_, TransactionRow>(&format!(
            "SELECT {TRANSACTION_COLUMNS} FROM transactions t WHERE t.id = ? AND t.user_id = ?"
        ))
        .bind(id.0)
        .bind(user_id.0)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("transaction {id}")))?;
        if let Some(existing) = row.group_id {
            return Err(StoreError::Conflict(format!(
                "transaction {id} already belongs to group {existing}"
            )));
        }
        let confirmed: Option<(i64, i64)> = sqlx::query_as(
            r#"
            SELECT id, receipt_id FROM receipt_matches
            WHERE transaction_id = ? AND status = 'confirmed'
            "#,
        )
        .bind(id.0)
        .fetch_optional(&mut *tx)
        .await?;
        if let Some((match_id, receipt_id)) = confirmed {
            return Err(StoreError::Conflict(format!(
                "transaction {id} is confirmed to receipt {receipt_id} by match {match_id}"
            )));
        }
        total_cents += row.amount_cents;
        display_date = Some(display_date.map_or(row.date, |d| d.min(row.date)));
    }
    let display_date = display_date.ok_or_else(|| StoreError::Invalid("empty group".into()))?;

    let (group_id,): (i64,) = sqlx::query_as(
        r#"
        INSERT INTO transaction_groups (user_id, name, amount_cents, display_date)
        VALUES (?, ?, ?, ?)
        RETURNING id
        "#,
    )
    .bind(user_id.0)
    .bind(name)
    .bind(total_cents)
    .bind(display_date)
    .fetch_one(&mut *tx)
    .await?;

    for id in &members {
        sqlx::query("UPDATE transactions SET group_id = ? WHERE id = ?")
            .bind(group_id)
            .bind(id.0)
            .execute(&mut *tx)
            .await?;
    }

    tx.commit().await?;
    info!(user_id = %user_id, group_id, members = members.len(), "transaction group created");

    get_group(pool, user_id, GroupId(group_id))
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("group {group_id}")))
}

/// Ungrouped transactions in `range` not held by a confirmed match.
pub async fn list_unclaimed_transactions(
    pool: &DbPool,
    user_id: UserId,
    range: DateRange,
) -> Result<Vec<Transaction>, StoreError> {
    let rows = sqlx::query_as::<_, TransactionRow>(&format!(
        r#"
        SELECT {TRANSACTION_COLUMNS} FROM transactions t
        WHERE t.user_id = ? AND t.group_id IS NULL AND t.date BETWEEN ? AND ?
          AND NOT EXISTS (
              SELECT 1 FROM receipt_matches m
              WHERE m.transaction_id = t.id AND m.status = 'confirmed'
          )
        ORDER BY t.id
        "#
    ))
    .bind(user_id.0)
    .bind(range.start)
    .bind(range.end)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(Transaction::from).collect())
}

/// Groups dated in `range` not held by a confirmed match.
pub async fn list_unclaimed_groups(
    pool: &DbPool,
    user_id: UserId,
    range: DateRange,
) -> Result<Vec<TransactionGroup>, StoreError> {
    let rows = sqlx::query_as::<_, GroupRow>(&format!(
        r#"
        SELECT {GROUP_COLUMNS} FROM transaction_groups g
        WHERE g.user_id = ? AND g.display_date BETWEEN ? AND ?
          AND NOT EXISTS (
              SELECT 1 FROM receipt_matches m
              WHERE m.transaction_group_id = g.id AND m.status = 'confirmed'
          )
        ORDER BY g.id
        "#
    ))
    .bind(user_id.0)
    .bind(range.start)
    .bind(range.end)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(TransactionGroup::from).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::create_memory_db;
    use crate::matches::{insert_confirmed_match, NewMatch};
    use crate::receipts::{insert_receipt, NewReceipt};
    use matchbook_core::{MatchOrigin, MatchTarget, ScoreBreakdown};

    fn date(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, d).unwrap()
    }

    async fn add(pool: &DbPool, d: u32, cents: i64, desc: &str) -> Transaction {
        insert_transaction(
            pool,
            &NewTransaction {
                user_id: UserId(1),
                date: date(d),
                amount: Money::from_cents(cents),
                description: desc.into(),
                merchant_name: None,
            },
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn insert_and_get() {
        let pool = create_memory_db().await.unwrap();
        let t = add(&pool, 15, -4500, "STARBUCKS #123").await;
        assert_eq!(t.amount, Money::from_cents(-4500));
        let fetched = get_transaction(&pool, UserId(1), t.id).await.unwrap().unwrap();
        assert_eq!(fetched, t);
        assert!(get_transaction(&pool, UserId(2), t.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn grouping_hides_members_and_sums_amounts() {
        let pool = create_memory_db().await.unwrap();
        let a = add(&pool, 16, -2000, "HOTEL ROOM").await;
        let b = add(&pool, 14, -1500, "HOTEL TAX").await;
        let c = add(&pool, 15, -900, "PARKING").await;

        let group = create_group(&pool, UserId(1), "Hotel stay", &[a.id, b.id])
            .await
            .unwrap();
        assert_eq!(group.amount, Money::from_cents(-3500));
        assert_eq!(group.display_date, date(14));
        assert_eq!(group.member_count, 2);

        let range = DateRange::new(date(1), date(31));
        let loose = list_unclaimed_transactions(&pool, UserId(1), range).await.unwrap();
        assert_eq!(loose.iter().map(|t| t.id).collect::<Vec<_>>(), vec![c.id]);

        let groups = list_unclaimed_groups(&pool, UserId(1), range).await.unwrap();
        assert_eq!(groups, vec![group.clone()]);

        let members = group_members(&pool, UserId(1), group.id).await.unwrap();
        assert_eq!(members.len(), 2);
    }

    #[tokio::test]
    async fn a_transaction_joins_one_group_only() {
        let pool = create_memory_db().await.unwrap();
        let a = add(&pool, 15, -100, "A").await;
        let b = add(&pool, 15, -100, "B").await;
        let c = add(&pool, 15, -100, "C").await;
        create_group(&pool, UserId(1), "first", &[a.id, b.id]).await.unwrap();
        let err = create_group(&pool, UserId(1), "second", &[b.id, c.id])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn repeated_ids_count_once() {
        let pool = create_memory_db().await.unwrap();
        let a = add(&pool, 15, -2000, "A").await;
        let b = add(&pool, 15, -500, "B").await;

        let err = create_group(&pool, UserId(1), "dup", &[a.id, a.id])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Invalid(_)));
        assert!(get_transaction(&pool, UserId(1), a.id)
            .await
            .unwrap()
            .unwrap()
            .group_id
            .is_none());

        let group = create_group(&pool, UserId(1), "pair", &[a.id, b.id, a.id])
            .await
            .unwrap();
        assert_eq!(group.amount, Money::from_cents(-2500));
        assert_eq!(group.member_count, 2);
    }

    #[tokio::test]
    async fn confirmed_transactions_cannot_be_grouped() {
        let pool = create_memory_db().await.unwrap();
        let a = add(&pool, 15, -2000, "A").await;
        let b = add(&pool, 15, -500, "B").await;
        let receipt = insert_receipt(
            &pool,
            &NewReceipt {
                user_id: UserId(1),
                vendor: Some("A".into()),
                date: Some(date(15)),
                amount: Some(Money::from_cents(2000)),
                currency: "USD".into(),
                gl_code: None,
                department: None,
            },
        )
        .await
        .unwrap();
        let new = NewMatch {
            user_id: UserId(1),
            receipt_id: receipt.id,
            target: MatchTarget::Transaction(a.id),
            origin: MatchOrigin::Manual,
            scores: ScoreBreakdown {
                confidence: 100.0,
                amount_score: 100.0,
                date_score: 100.0,
                vendor_score: 100.0,
                reason: "manual match".into(),
            },
        };
        insert_confirmed_match(&pool, &new, None).await.unwrap();

        let err = create_group(&pool, UserId(1), "late", &[a.id, b.id])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));

        // Nothing was written.
        let range = DateRange::new(date(1), date(31));
        assert!(list_unclaimed_groups(&pool, UserId(1), range).await.unwrap().is_empty());
        let b = get_transaction(&pool, UserId(1), b.id).await.unwrap().unwrap();
        assert!(b.group_id.is_none());
    }

    #[tokio::test]
    async fn unclaimed_respects_date_range() {
        let pool = create_memory_db().await.unwrap();
        add(&pool, 1, -100, "EARLY").await;
        let mid = add(&pool, 15, -100, "MID").await;
        let range = DateRange::around(date(15), 3);
        let found = list_unclaimed_transactions(&pool, UserId(1), range).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, mid.id);
    }
}
