//! SQLite durable store.
//!
//! One table, `cache_records`. JSON columns (`content`, `metadata`, `tags`)
//! are stored as text and decoded on read; a row that fails to decode is
//! reported as corrupt rather than failing the whole query. Timestamps are
//! fixed-width RFC 3339 (`...T12:00:00.000000Z`) so they compare correctly
//! as text.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Value};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous};
use sqlx::{Row, SqlitePool};
use storyloom_core::store::metadata_contains;
use storyloom_core::{CacheRecord, ContentType, DurableStore, RecordQuery, RecordScan, StoreError};
use tracing::{debug, info, warn};

/// A SQLite-backed durable store.
pub struct SqliteStore {
    pool: SqlitePool,
}

fn ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(id: &str, column: &str, raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt {
            id: id.to_string(),
            reason: format!("{column}: {e}"),
        })
}

fn corrupt(id: &str, column: &str, e: impl std::fmt::Display) -> StoreError {
    StoreError::Corrupt {
        id: id.to_string(),
        reason: format!("{column}: {e}"),
    }
}

impl SqliteStore {
    /// Open (or create) a store at `path`.
    ///
    /// Pass `"sqlite::memory:"` for an ephemeral database.
    pub async fn new(path: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(path)
            .map_err(|e| StoreError::Storage(format!("Invalid SQLite path: {e}")))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(|e| StoreError::Storage(format!("Failed to open SQLite: {e}")))?;

        let store = Self { pool };
        store.run_migrations().await?;
        info!("SQLite durable store initialized at {path}");
        Ok(store)
    }

    /// Create from an existing pool.
    pub async fn from_pool(pool: SqlitePool) -> Result<Self, StoreError> {
        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    async fn run_migrations(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS cache_records (
                id                     TEXT PRIMARY KEY NOT NULL,
                content_type           TEXT NOT NULL,
                owner_id               TEXT NOT NULL,
                content                TEXT NOT NULL,
                metadata               TEXT NOT NULL DEFAULT '{}',
                tags                   TEXT NOT NULL DEFAULT '[]',
                fingerprint            TEXT NOT NULL,
                dependency_fingerprint TEXT,
                similarity_hash        TEXT NOT NULL,
                reuse_score            REAL NOT NULL DEFAULT 0.0,
                hit_count              INTEGER NOT NULL DEFAULT 0,
                cost                   REAL NOT NULL DEFAULT 0.0,
                created_at             TEXT NOT NULL,
                last_accessed          TEXT NOT NULL,
                expires_at             TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::MigrationFailed(format!("cache_records table: {e}")))?;

        let indexes = [
            ("idx_cache_type_owner", "CREATE INDEX IF NOT EXISTS idx_cache_type_owner ON cache_records(content_type, owner_id)"),
            ("idx_cache_fingerprint", "CREATE INDEX IF NOT EXISTS idx_cache_fingerprint ON cache_records(fingerprint)"),
            ("idx_cache_dependency", "CREATE INDEX IF NOT EXISTS idx_cache_dependency ON cache_records(dependency_fingerprint)"),
            ("idx_cache_expires", "CREATE INDEX IF NOT EXISTS idx_cache_expires ON cache_records(expires_at)"),
        ];
        for (name, sql) in indexes {
            sqlx::query(sql)
                .execute(&self.pool)
                .await
                .map_err(|e| StoreError::MigrationFailed(format!("{name}: {e}")))?;
        }

        debug!("SQLite migrations complete");
        Ok(())
    }

    /// Decode a row. Fails with [`StoreError::Corrupt`] when a stored value
    /// cannot be decoded.
    fn row_to_record(row: &SqliteRow) -> Result<CacheRecord, StoreError> {
        let id: String = row
            .try_get("id")
            .map_err(|e| StoreError::QueryFailed(format!("id column: {e}")))?;
        let get_text = |column: &str| -> Result<String, StoreError> {
            row.try_get::<String, _>(column)
                .map_err(|e| corrupt(&id, column, e))
        };

        let content_type_tag = get_text("content_type")?;
        let content_type = ContentType::parse(&content_type_tag)
            .ok_or_else(|| corrupt(&id, "content_type", format!("unknown tag {content_type_tag:?}")))?;
        let content: Value =
            serde_json::from_str(&get_text("content")?).map_err(|e| corrupt(&id, "content", e))?;
        let metadata: Map<String, Value> =
            serde_json::from_str(&get_text("metadata")?).map_err(|e| corrupt(&id, "metadata", e))?;
        let tags: Vec<String> =
            serde_json::from_str(&get_text("tags")?).map_err(|e| corrupt(&id, "tags", e))?;
        let dependency_fingerprint: Option<String> = row
            .try_get("dependency_fingerprint")
            .map_err(|e| corrupt(&id, "dependency_fingerprint", e))?;
        let reuse_score: f64 = row.try_get("reuse_score").map_err(|e| corrupt(&id, "reuse_score", e))?;
        let hit_count: i64 = row.try_get("hit_count").map_err(|e| corrupt(&id, "hit_count", e))?;
        let cost: f64 = row.try_get("cost").map_err(|e| corrupt(&id, "cost", e))?;

        Ok(CacheRecord {
            owner_id: get_text("owner_id")?,
            fingerprint: get_text("fingerprint")?,
            similarity_hash: get_text("similarity_hash")?,
            created_at: parse_ts(&id, "created_at", &get_text("created_at")?)?,
            last_accessed: parse_ts(&id, "last_accessed", &get_text("last_accessed")?)?,
            expires_at: parse_ts(&id, "expires_at", &get_text("expires_at")?)?,
            content_type,
            content,
            metadata,
            tags,
            dependency_fingerprint,
            reuse_score: reuse_score as f32,
            hit_count: hit_count.max(0) as u64,
            cost,
            id,
        })
    }

    /// Decode every row, separating corrupt ones.
    fn scan_rows(rows: &[SqliteRow]) -> RecordScan {
        let mut scan = RecordScan::default();
        for row in rows {
            match Self::row_to_record(row) {
                Ok(record) => scan.records.push(record),
                Err(StoreError::Corrupt { id, reason }) => {
                    warn!(id = %id, %reason, "Corrupt durable cache record");
                    scan.corrupt.push(id);
                }
                Err(e) => warn!(error = %e, "Skipping unreadable durable cache row"),
            }
        }
        scan
    }

    async fn fetch_where(&self, column: &str, value: &str) -> Result<Vec<CacheRecord>, StoreError> {
        // column names come from this module only
        let sql = format!("SELECT * FROM cache_records WHERE {column} = ?1 ORDER BY id");
        let rows = sqlx::query(&sql)
            .bind(value)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::QueryFailed(format!("{column} lookup: {e}")))?;
        Ok(Self::scan_rows(&rows).records)
    }

    /// Overwrite a record's payload with undecodable text.
    #[cfg(test)]
    pub(crate) async fn corrupt_for_test(&self, id: &str) {
        sqlx::query("UPDATE cache_records SET content = 'not json{' WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await
            .unwrap();
    }
}

#[async_trait]
impl DurableStore for SqliteStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn insert(&self, record: CacheRecord) -> Result<bool, StoreError> {
        let content = serde_json::to_string(&record.content)
            .map_err(|e| StoreError::Storage(format!("Content serialization: {e}")))?;
        let metadata = serde_json::to_string(&record.metadata)
            .map_err(|e| StoreError::Storage(format!("Metadata serialization: {e}")))?;
        let tags = serde_json::to_string(&record.tags)
            .map_err(|e| StoreError::Storage(format!("Tags serialization: {e}")))?;

        let result = sqlx::query(
            r#"
            INSERT INTO cache_records (
                id, content_type, owner_id, content, metadata, tags, fingerprint,
                dependency_fingerprint, similarity_hash, reuse_score, hit_count, cost,
                created_at, last_accessed, expires_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
            ON CONFLICT(id) DO NOTHING
            "#,
        )
        .bind(&record.id)
        .bind(record.content_type.as_str())
        .bind(&record.owner_id)
        .bind(&content)
        .bind(&metadata)
        .bind(&tags)
        .bind(&record.fingerprint)
        .bind(&record.dependency_fingerprint)
        .bind(&record.similarity_hash)
        .bind(f64::from(record.reuse_score))
        .bind(i64::try_from(record.hit_count).unwrap_or(i64::MAX))
        .bind(record.cost)
        .bind(ts(record.created_at))
        .bind(ts(record.last_accessed))
        .bind(ts(record.expires_at))
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Storage(format!("INSERT failed: {e}")))?;

        let inserted = result.rows_affected() == 1;
        if inserted {
            debug!(id = %record.id, content_type = %record.content_type, "Stored durable record");
        }
        Ok(inserted)
    }

    async fn get(&self, id: &str) -> Result<Option<CacheRecord>, StoreError> {
        let row = sqlx::query("SELECT * FROM cache_records WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::QueryFailed(format!("GET failed: {e}")))?;

        row.as_ref().map(Self::row_to_record).transpose()
    }

    async fn find(&self, query: &RecordQuery) -> Result<RecordScan, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM cache_records
            WHERE content_type = ?1
              AND (?2 IS NULL OR owner_id = ?2)
              AND expires_at >= ?3
            ORDER BY id
            "#,
        )
        .bind(query.content_type.as_str())
        .bind(query.owner_id.as_deref())
        .bind(ts(query.now))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::QueryFailed(format!("find failed: {e}")))?;

        let mut scan = Self::scan_rows(&rows);
        scan.records
            .retain(|r| metadata_contains(&r.metadata, &query.metadata));
        Ok(scan)
    }

    async fn dependents(&self, fingerprint: &str) -> Result<Vec<CacheRecord>, StoreError> {
        self.fetch_where("dependency_fingerprint", fingerprint).await
    }

    async fn by_fingerprint(&self, fingerprint: &str) -> Result<Vec<CacheRecord>, StoreError> {
        self.fetch_where("fingerprint", fingerprint).await
    }

    async fn record_hit(&self, id: &str, at: DateTime<Utc>) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE cache_records SET hit_count = hit_count + 1, last_accessed = ?2 WHERE id = ?1",
        )
        .bind(id)
        .bind(ts(at))
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Storage(format!("hit update failed: {e}")))?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete(&self, id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM cache_records WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Storage(format!("DELETE failed: {e}")))?;
        Ok(result.rows_affected() > 0)
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let result = sqlx::query("DELETE FROM cache_records WHERE expires_at < ?1")
            .bind(ts(now))
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Storage(format!("purge failed: {e}")))?;
        Ok(result.rows_affected() as usize)
    }

    async fn evict_least_valuable(&self, count: usize) -> Result<usize, StoreError> {
        let result = sqlx::query(
            r#"
            DELETE FROM cache_records WHERE id IN (
                SELECT id FROM cache_records
                ORDER BY (reuse_score + hit_count) ASC, last_accessed ASC, id ASC
                LIMIT ?1
            )
            "#,
        )
        .bind(i64::try_from(count).unwrap_or(i64::MAX))
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Storage(format!("eviction failed: {e}")))?;
        Ok(result.rows_affected() as usize)
    }

    async fn count(&self) -> Result<usize, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) as cnt FROM cache_records")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| StoreError::QueryFailed(format!("COUNT failed: {e}")))?;
        let count: i64 = row
            .try_get("cnt")
            .map_err(|e| StoreError::QueryFailed(format!("count column: {e}")))?;
        Ok(count.max(0) as usize)
    }

    async fn clear(&self) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM cache_records")
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Storage(format!("clear failed: {e}")))?;
        Ok(())
    }
}
