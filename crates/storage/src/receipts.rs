use chrono::NaiveDate;
use matchbook_core::{Money, Receipt, ReceiptId, UserId};
use serde::Deserialize;
use sqlx::{QueryBuilder, Sqlite, SqliteConnection};

use crate::db::DbPool;
use crate::error::{invalid_row, StoreError};

const RECEIPT_COLUMNS: &str =
    "id, user_id, vendor, date, amount_cents, currency, status, gl_code, department";

#[derive(Debug, Clone, Deserialize)]
pub struct NewReceipt {
    pub user_id: UserId,
    pub vendor: Option<String>,
    pub date: Option<NaiveDate>,
    pub amount: Option<Money>,
    #[serde(default = "default_currency")]
    pub currency: String,
    #[serde(default)]
    pub gl_code: Option<String>,
    #[serde(default)]
    pub department: Option<String>,
}

fn default_currency() -> String {
    "USD".to_string()
}

#[derive(sqlx::FromRow)]
struct ReceiptRow {
    id: i64,
    user_id: i64,
    vendor: Option<String>,
    date: Option<NaiveDate>,
    amount_cents: Option<i64>,
    currency: String,
    status: String,
    gl_code: Option<String>,
    department: Option<String>,
}

impl TryFrom<ReceiptRow> for Receipt {
    type Error = StoreError;

    fn try_from(r: ReceiptRow) -> Result<Self, Self::Error> {
        Ok(Receipt {
            id: ReceiptId(r.id),
            user_id: UserId(r.user_id),
            vendor: r.vendor,
            date: r.date,
            amount: r.amount_cents.map(Money::from_cents),
            currency: r.currency,
            status: r.status.parse().map_err(|e| invalid_row("receipts", e))?,
            gl_code: r.gl_code,
            department: r.department,
        })
    }
}

pub async fn insert_receipt(pool: &DbPool, receipt: &NewReceipt) -> Result<Receipt, StoreError> {
    let row = sqlx::query_as::<_, ReceiptRow>(&format!(
        r#"
        INSERT INTO receipts (user_id, vendor, date, amount_cents, currency, gl_code, department)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        RETURNING {RECEIPT_COLUMNS}
        "#
    ))
    .bind(receipt.user_id.0)
    .bind(&receipt.vendor)
    .bind(receipt.date)
    .bind(receipt.amount.map(Money::to_cents))
    .bind(&receipt.currency)
    .bind(&receipt.gl_code)
    .bind(&receipt.department)
    .fetch_one(pool)
    .await?;
    row.try_into()
}

pub async fn get_receipt(
    pool: &DbPool,
    user_id: UserId,
    id: ReceiptId,
) -> Result<Option<Receipt>, StoreError> {
    let row = sqlx::query_as::<_, ReceiptRow>(&format!(
        "SELECT {RECEIPT_COLUMNS} FROM receipts WHERE id = ? AND user_id = ?"
    ))
    .bind(id.0)
    .bind(user_id.0)
    .fetch_optional(pool)
    .await?;
    row.map(Receipt::try_from).transpose()
}

/// Receipts with no confirmed match, optionally narrowed to `ids`.
pub async fn list_unmatched_receipts(
    pool: &DbPool,
    user_id: UserId,
    ids: Option<&[ReceiptId]>,
) -> Result<Vec<Receipt>, StoreError> {
    let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
        "SELECT {RECEIPT_COLUMNS} FROM receipts r WHERE r.user_id = "
    ));
    qb.push_bind(user_id.0);
    qb.push(
        r#"
        AND NOT EXISTS (
            SELECT 1 FROM receipt_matches m
            WHERE m.receipt_id = r.id AND m.status = 'confirmed'
        )"#,
    );
    if let Some(ids) = ids {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        qb.push(" AND r.id IN (");
        let mut separated = qb.separated(", ");
        for id in ids {
            separated.push_bind(id.0);
        }
        separated.push_unseparated(")");
    }
    qb.push(" ORDER BY r.id");

    let rows = qb.build_query_as::<ReceiptRow>().fetch_all(pool).await?;
    rows.into_iter().map(Receipt::try_from).collect()
}

/// Fills accounting codes the receipt does not already carry.
pub(crate) async fn apply_receipt_defaults(
    conn: &mut SqliteConnection,
    receipt_id: ReceiptId,
    gl_code: Option<&str>,
    department: Option<&str>,
) -> Result<(), StoreError> {
    if gl_code.is_none() && department.is_none() {
        return Ok(());
    }
    sqlx::query(
        r#"
        UPDATE receipts
        SET gl_code = COALESCE(gl_code, ?), department = COALESCE(department, ?)
        WHERE id = ?
        "#,
    )
    .bind(gl_code)
    .bind(department)
    .bind(receipt_id.0)
    .execute(conn)
    .await?;
    Ok(())
}
