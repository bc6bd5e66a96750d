use sqlx::{sqlite::SqlitePoolOptions, Pool, Sqlite};
use std::path::Path;

pub type DbPool = Pool<Sqlite>;

pub async fn create_db(path: &Path) -> Result<DbPool, sqlx::Error> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect(&format!("sqlite:{}?mode=rwc", path.display()))
        .await?;

    sqlx::query("PRAGMA journal_mode = WAL")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA foreign_keys = ON")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA synchronous = NORMAL")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA busy_timeout = 5000")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA cache_size = -32000")
        .execute(&pool)
        .await?;

    run_migrations(&pool).await?;

    Ok(pool)
}

/// A private in-memory database. The single connection is never recycled,
/// since dropping it would drop the data.
pub async fn create_memory_db() -> Result<DbPool, sqlx::Error> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await?;

    sqlx::query("PRAGMA foreign_keys = ON")
        .execute(&pool)
        .await?;

    run_migrations(&pool).await?;

    Ok(pool)
}

const MIGRATIONS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS receipts (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id INTEGER NOT NULL,
        vendor TEXT,
        date TEXT,
        amount_cents INTEGER,
        currency TEXT NOT NULL DEFAULT 'USD',
        status TEXT NOT NULL DEFAULT 'pending_review',
        gl_code TEXT,
        department TEXT,
        created_at TEXT NOT NULL DEFAULT (datetime('now'))
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS transaction_groups (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id INTEGER NOT NULL,
        name TEXT NOT NULL,
        amount_cents INTEGER NOT NULL,
        display_date TEXT NOT NULL,
        created_at TEXT NOT NULL DEFAULT (datetime('now'))
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS transactions (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id INTEGER NOT NULL,
        date TEXT NOT NULL,
        amount_cents INTEGER NOT NULL,
        description TEXT NOT NULL,
        merchant_name TEXT,
        group_id INTEGER,
        created_at TEXT NOT NULL DEFAULT (datetime('now')),
        FOREIGN KEY (group_id) REFERENCES transaction_groups(id)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_transactions_user_date ON transactions (user_id, date)",
    r#"
    CREATE TABLE IF NOT EXISTS receipt_matches (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id INTEGER NOT NULL,
        receipt_id INTEGER NOT NULL,
        transaction_id INTEGER,
        transaction_group_id INTEGER,
        status TEXT NOT NULL,
        origin TEXT NOT NULL,
        confidence_score REAL NOT NULL CHECK (confidence_score BETWEEN 0 AND 100),
        amount_score REAL NOT NULL CHECK (amount_score BETWEEN 0 AND 100),
        date_score REAL NOT NULL CHECK (date_score BETWEEN 0 AND 100),
        vendor_score REAL NOT NULL CHECK (vendor_score BETWEEN 0 AND 100),
        match_reason TEXT NOT NULL,
        created_at TEXT NOT NULL,
        confirmed_at TEXT,
        status_changed_at TEXT,
        CHECK ((transaction_id IS NULL) <> (transaction_group_id IS NULL)),
        FOREIGN KEY (receipt_id) REFERENCES receipts(id),
        FOREIGN KEY (transaction_id) REFERENCES transactions(id),
        FOREIGN KEY (transaction_group_id) REFERENCES transaction_groups(id)
    )
    "#,
    // At most one confirmed match per receipt, transaction and group.
    r#"
    CREATE UNIQUE INDEX IF NOT EXISTS ux_matches_confirmed_receipt
        ON receipt_matches (receipt_id) WHERE status = 'confirmed'
    "#,
    r#"
    CREATE UNIQUE INDEX IF NOT EXISTS ux_matches_confirmed_transaction
        ON receipt_matches (transaction_id)
        WHERE status = 'confirmed' AND transaction_id IS NOT NULL
    "#,
    r#"
    CREATE UNIQUE INDEX IF NOT EXISTS ux_matches_confirmed_group
        ON receipt_matches (transaction_group_id)
        WHERE status = 'confirmed' AND transaction_group_id IS NOT NULL
    "#,
    // One open proposal per (receipt, target) pair.
    r#"
    CREATE UNIQUE INDEX IF NOT EXISTS ux_matches_open_transaction_pair
        ON receipt_matches (receipt_id, transaction_id)
        WHERE status = 'proposed' AND transaction_id IS NOT NULL
    "#,
    r#"
    CREATE UNIQUE INDEX IF NOT EXISTS ux_matches_open_group_pair
        ON receipt_matches (receipt_id, transaction_group_id)
        WHERE status = 'proposed' AND transaction_group_id IS NOT NULL
    "#,
    "CREATE INDEX IF NOT EXISTS idx_matches_user_status ON receipt_matches (user_id, status)",
    r#"
    CREATE TABLE IF NOT EXISTS vendor_aliases (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id INTEGER NOT NULL,
        pattern TEXT NOT NULL,
        display_name TEXT NOT NULL,
        category TEXT,
        default_gl_code TEXT,
        default_department TEXT,
        confidence REAL NOT NULL DEFAULT 0,
        match_count INTEGER NOT NULL DEFAULT 0,
        updated_at TEXT,
        UNIQUE (user_id, pattern)
    )
    "#,
];

async fn run_migrations(pool: &DbPool) -> Result<(), sqlx::Error> {
    for statement in MIGRATIONS {
        sqlx::query(*statement).execute(pool).await?;
    }
    Ok(())
}
