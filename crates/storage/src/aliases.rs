use chrono::{DateTime, Utc};
use matchbook_core::{UserId, VendorAlias};
use serde::{Deserialize, Serialize};
use sqlx::SqliteConnection;
use tracing::debug;

use crate::db::DbPool;
use crate::error::StoreError;

const ALIAS_COLUMNS: &str = "user_id, pattern, display_name, category, default_gl_code, \
     default_department, confidence, match_count, updated_at";

/// Values a reviewer may set when confirming; each one replaces the stored value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AliasOverrides {
    pub display_name: Option<String>,
    pub default_gl_code: Option<String>,
    pub default_department: Option<String>,
}

/// What a confirmed match teaches the alias table.
#[derive(Debug, Clone, PartialEq)]
pub struct AliasLearning {
    pub user_id: UserId,
    pub pattern: String,
    /// Used for a new alias when no override is given.
    pub display_name: String,
    pub overrides: AliasOverrides,
}

/// One entry of an alias seed file.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AliasSeed {
    pub pattern: String,
    pub display_name: String,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub default_gl_code: Option<String>,
    #[serde(default)]
    pub default_department: Option<String>,
}

#[derive(Deserialize)]
struct SeedFile {
    #[serde(default, rename = "alias")]
    aliases: Vec<AliasSeed>,
}

/// Parses `[[alias]]` tables.
pub fn parse_alias_seeds(toml_content: &str) -> Result<Vec<AliasSeed>, StoreError> {
    let file: SeedFile = toml::from_str(toml_content)?;
    Ok(file.aliases)
}

#[derive(sqlx::FromRow)]
struct AliasRow {
    user_id: i64,
    pattern: String,
    display_name: String,
    category: Option<String>,
    default_gl_code: Option<String>,
    default_department: Option<String>,
    confidence: f64,
    match_count: i64,
    updated_at: Option<DateTime<Utc>>,
}

impl From<AliasRow> for VendorAlias {
    fn from(r: AliasRow) -> Self {
        VendorAlias {
            user_id: UserId(r.user_id),
            pattern: r.pattern,
            display_name: r.display_name,
            category: r.category,
            default_gl_code: r.default_gl_code,
            default_department: r.default_department,
            confidence: r.confidence,
            match_count: r.match_count,
            updated_at: r.updated_at,
        }
    }
}

pub async fn list_aliases(pool: &DbPool, user_id: UserId) -> Result<Vec<VendorAlias>, StoreError> {
    let rows = sqlx::query_as::<_, AliasRow>(&format!(
        "SELECT {ALIAS_COLUMNS} FROM vendor_aliases WHERE user_id = ? ORDER BY pattern"
    ))
    .bind(user_id.0)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(VendorAlias::from).collect())
}

pub async fn find_alias(
    pool: &DbPool,
    user_id: UserId,
    pattern: &str,
) -> Result<Option<VendorAlias>, StoreError> {
    let mut conn = pool.acquire().await?;
    find_alias_on(&mut conn, user_id, pattern).await
}

async fn find_alias_on(
    conn: &mut SqliteConnection,
    user_id: UserId,
    pattern: &str,
) -> Result<Option<VendorAlias>, StoreError> {
    let row = sqlx::query_as::<_, AliasRow>(&format!(
        "SELECT {ALIAS_COLUMNS} FROM vendor_aliases WHERE user_id = ? AND pattern = ?"
    ))
    .bind(user_id.0)
    .bind(pattern)
    .fetch_optional(conn)
    .await?;
    Ok(row.map(VendorAlias::from))
}

/// Creates the alias or folds one more confirmed match into it. Runs on the
/// caller's connection so it commits together with the confirmation.
pub(crate) async fn learn_alias(
    conn: &mut SqliteConnection,
    learning: &AliasLearning,
    match_confidence: f64,
) -> Result<VendorAlias, StoreError> {
    let now = Utc::now();
    let overrides = &learning.overrides;

    let alias = match find_alias_on(conn, learning.user_id, &learning.pattern).await? {
        Some(mut alias) => {
            alias.reinforce(match_confidence);
            if let Some(name) = &overrides.display_name {
                alias.display_name = name.clone();
            }
            if let Some(gl) = &overrides.default_gl_code {
                alias.default_gl_code = Some(gl.clone());
            }
            if let Some(dept) = &overrides.default_department {
                alias.default_department = Some(dept.clone());
            }
            alias.updated_at = Some(now);
            sqlx::query(
                r#"
                UPDATE vendor_aliases
                SET display_name = ?, default_gl_code = ?, default_department = ?,
                    confidence = ?, match_count = ?, updated_at = ?
                WHERE user_id = ? AND pattern = ?
                "#,
            )
            .bind(&alias.display_name)
            .bind(&alias.default_gl_code)
            .bind(&alias.default_department)
            .bind(alias.confidence)
            .bind(alias.match_count)
            .bind(now)
            .bind(learning.user_id.0)
            .bind(&learning.pattern)
            .execute(&mut *conn)
            .await?;
            alias
        }
        None => {
            let alias = VendorAlias {
                user_id: learning.user_id,
                pattern: learning.pattern.clone(),
                display_name: overrides
                    .display_name
                    .clone()
                    .unwrap_or_else(|| learning.display_name.clone()),
                category: None,
                default_gl_code: overrides.default_gl_code.clone(),
                default_department: overrides.default_department.clone(),
                confidence: match_confidence,
                match_count: 1,
                updated_at: Some(now),
            };
            sqlx::query(
                r#"
                INSERT INTO vendor_aliases (
                    user_id, pattern, display_name, default_gl_code, default_department,
                    confidence, match_count, updated_at
                )
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(alias.user_id.0)
            .bind(&alias.pattern)
            .bind(&alias.display_name)
            .bind(&alias.default_gl_code)
            .bind(&alias.default_department)
            .bind(alias.confidence)
            .bind(alias.match_count)
            .bind(now)
            .execute(&mut *conn)
            .await?;
            alias
        }
    };

    debug!(
        user_id = %alias.user_id,
        pattern = %alias.pattern,
        match_count = alias.match_count,
        "vendor alias learned"
    );
    Ok(alias)
}

/// Inserts seed aliases that are not already known. Learned rows are left
/// untouched. Returns the number of aliases added.
pub async fn seed_aliases(
    pool: &DbPool,
    user_id: UserId,
    seeds: &[AliasSeed],
) -> Result<usize, StoreError> {
    let mut tx = pool.begin().await?;
    let mut added = 0;
    for seed in seeds {
        if seed.pattern.trim().is_empty() {
            return Err(StoreError::Invalid(format!(
                "alias '{}' has an empty pattern",
                seed.display_name
            )));
        }
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO vendor_aliases (
                user_id, pattern, display_name, category, default_gl_code,
                default_department, confidence, match_count, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, 0, 0, ?)
            "#,
        )
        .bind(user_id.0)
        .bind(&seed.pattern)
        .bind(&seed.display_name)
        .bind(&seed.category)
        .bind(&seed.default_gl_code)
        .bind(&seed.default_department)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;
        added += result.rows_affected() as usize;
    }
    tx.commit().await?;
    Ok(added)
}
