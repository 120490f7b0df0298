//! PostgreSQL binding for the queryable tier.
//!
//! Connection pooling uses deadpool-postgres. The schema is two tables:
//!
//! - `cache_store`: one row per cache key, indexed on `category` and
//!   `expires_at`
//! - `cache_tags`: `(tag, cache_key)` pairs backing the durable tag index

use std::time::Duration;

use async_trait::async_trait;
use blaze_core::Timestamp;
use deadpool_postgres::{Config, ManagerConfig, Pool, PoolConfig, RecyclingMethod, Runtime};
use tokio_postgres::{NoTls, Row};

use super::queryable::{CacheRow, CacheTable};
use super::BindingError;

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS cache_store (
    cache_key   TEXT COLLATE "C" PRIMARY KEY,
    payload     BYTEA NOT NULL,
    category    TEXT,
    tags        TEXT[] NOT NULL DEFAULT '{}',
    expires_at  TIMESTAMPTZ,
    created_at  TIMESTAMPTZ NOT NULL DEFAULT now(),
    updated_at  TIMESTAMPTZ NOT NULL DEFAULT now()
);
CREATE INDEX IF NOT EXISTS idx_cache_store_category ON cache_store (category);
CREATE INDEX IF NOT EXISTS idx_cache_store_expires_at ON cache_store (expires_at);

CREATE TABLE IF NOT EXISTS cache_tags (
    tag        TEXT NOT NULL,
    cache_key  TEXT COLLATE "C" NOT NULL,
    PRIMARY KEY (tag, cache_key)
);
"#;

const SELECT_ROW: &str = "SELECT cache_key, payload, category, tags, expires_at, created_at, updated_at \
     FROM cache_store WHERE cache_key = $1";

const UPSERT_ROW: &str = "INSERT INTO cache_store \
     (cache_key, payload, category, tags, expires_at, created_at, updated_at) \
     VALUES ($1, $2, $3, $4, $5, $6, $7) \
     ON CONFLICT (cache_key) DO UPDATE SET \
     payload = EXCLUDED.payload, category = EXCLUDED.category, tags = EXCLUDED.tags, \
     expires_at = EXCLUDED.expires_at, updated_at = EXCLUDED.updated_at";

const LIST_KEYS: &str = "SELECT cache_key FROM cache_store \
     WHERE starts_with(cache_key, $1) AND cache_key > $2 \
     ORDER BY cache_key LIMIT $3";

const DELETE_EXPIRED: &str =
    "DELETE FROM cache_store WHERE expires_at IS NOT NULL AND expires_at <= $1";

const DELETE_ORPHAN_TAGS: &str = "DELETE FROM cache_tags t WHERE NOT EXISTS \
     (SELECT 1 FROM cache_store s WHERE s.cache_key = t.cache_key)";

// ============================================================================
// CONNECTION POOL CONFIGURATION
// ============================================================================

/// Database connection pool configuration.
#[derive(Debug, Clone)]
pub struct PostgresConfig {
    /// PostgreSQL host
    pub host: String,
    /// PostgreSQL port
    pub port: u16,
    /// Database name
    pub dbname: String,
    /// Database user
    pub user: String,
    /// Database password
    pub password: String,
    /// Maximum pool size
    pub max_size: usize,
    /// Connection timeout
    pub timeout: Duration,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            dbname: "blaze".to_string(),
            user: "postgres".to_string(),
            password: "".to_string(),
            max_size: 16,
            timeout: Duration::from_secs(5),
        }
    }
}

impl PostgresConfig {
    /// Create a new database configuration from environment variables.
    ///
    /// # Environment Variables
    /// - `BLAZE_PG_HOST` (default: localhost)
    /// - `BLAZE_PG_PORT` (default: 5432)
    /// - `BLAZE_PG_DATABASE` (default: blaze)
    /// - `BLAZE_PG_USER` (default: postgres)
    /// - `BLAZE_PG_PASSWORD` (default: empty)
    /// - `BLAZE_PG_POOL_SIZE` (default: 16)
    /// - `BLAZE_PG_CONNECT_TIMEOUT_SECS` (default: 5)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            host: std::env::var("BLAZE_PG_HOST").unwrap_or(defaults.host),
            port: std::env::var("BLAZE_PG_PORT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.port),
            dbname: std::env::var("BLAZE_PG_DATABASE").unwrap_or(defaults.dbname),
            user: std::env::var("BLAZE_PG_USER").unwrap_or(defaults.user),
            password: std::env::var("BLAZE_PG_PASSWORD").unwrap_or_default(),
            max_size: std::env::var("BLAZE_PG_POOL_SIZE")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.max_size),
            timeout: std::env::var("BLAZE_PG_CONNECT_TIMEOUT_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.timeout),
        }
    }

    /// Create a connection pool from this configuration.
    pub fn create_pool(&self) -> Result<Pool, BindingError> {
        let mut cfg = Config::new();
        cfg.host = Some(self.host.clone());
        cfg.port = Some(self.port);
        cfg.dbname = Some(self.dbname.clone());
        cfg.user = Some(self.user.clone());
        cfg.password = Some(self.password.clone());
        cfg.connect_timeout = Some(self.timeout);
        cfg.pool = Some(PoolConfig::new(self.max_size));

        cfg.manager = Some(ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        });

        cfg.create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| BindingError::Unavailable(format!("Failed to create pool: {}", e)))
    }
}

// ============================================================================
// CACHE TABLE
// ============================================================================

/// `cache_store` / `cache_tags` over a deadpool-postgres pool.
#[derive(Clone)]
pub struct PgCacheTable {
    pool: Pool,
}

impl PgCacheTable {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub fn from_config(config: &PostgresConfig) -> Result<Self, BindingError> {
        Ok(Self::new(config.create_pool()?))
    }

    /// Create the cache tables and indexes if they do not exist.
    pub async fn ensure_schema(&self) -> Result<(), BindingError> {
        let conn = self.get_conn().await?;
        conn.batch_execute(SCHEMA_SQL).await?;
        tracing::info!("Cache schema ensured");
        Ok(())
    }

    /// Get the current pool size for observability.
    pub fn pool_size(&self) -> usize {
        self.pool.status().size
    }

    async fn get_conn(&self) -> Result<deadpool_postgres::Object, BindingError> {
        self.pool.get().await.map_err(BindingError::from)
    }

    fn parse_row(row: &Row) -> Result<CacheRow, BindingError> {
        Ok(CacheRow {
            cache_key: row.try_get("cache_key")?,
            payload: row.try_get("payload")?,
            category: row.try_get("category")?,
            tags: row.try_get("tags")?,
            expires_at: row.try_get("expires_at")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl std::fmt::Debug for PgCacheTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgCacheTable")
            .field("pool_size", &self.pool_size())
            .finish()
    }
}

#[async_trait]
impl CacheTable for PgCacheTable {
    async fn select(&self, key: &str) -> Result<Option<CacheRow>, BindingError> {
        let conn = self.get_conn().await?;
        let row = conn.query_opt(SELECT_ROW, &[&key]).await?;
        row.as_ref().map(Self::parse_row).transpose()
    }

    async fn upsert(&self, row: &CacheRow) -> Result<(), BindingError> {
        let conn = self.get_conn().await?;
        conn.execute(
            UPSERT_ROW,
            &[
                &row.cache_key,
                &row.payload,
                &row.category,
                &row.tags,
                &row.expires_at,
                &row.created_at,
                &row.updated_at,
            ],
        )
        .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, BindingError> {
        let conn = self.get_conn().await?;
        let deleted = conn
            .execute("DELETE FROM cache_store WHERE cache_key = $1", &[&key])
            .await?;
        Ok(deleted > 0)
    }

    async fn list_keys(
        &self,
        prefix: &str,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<String>, BindingError> {
        let conn = self.get_conn().await?;
        let after = after.unwrap_or("");
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = conn.query(LIST_KEYS, &[&prefix, &after, &limit]).await?;
        rows.iter()
            .map(|row| row.try_get::<_, String>(0).map_err(BindingError::from))
            .collect()
    }

    async fn delete_expired(&self, now: Timestamp) -> Result<u64, BindingError> {
        let conn = self.get_conn().await?;
        let purged = conn.execute(DELETE_EXPIRED, &[&now]).await?;
        let orphans = conn.execute(DELETE_ORPHAN_TAGS, &[]).await?;
        tracing::debug!(purged, orphan_tags = orphans, "Purged expired cache rows");
        Ok(purged)
    }

    async fn insert_tag(&self, tag: &str, key: &str) -> Result<(), BindingError> {
        let conn = self.get_conn().await?;
        conn.execute(
            "INSERT INTO cache_tags (tag, cache_key) VALUES ($1, $2) ON CONFLICT DO NOTHING",
            &[&tag, &key],
        )
        .await?;
        Ok(())
    }

    async fn keys_for_tag(&self, tag: &str) -> Result<Vec<String>, BindingError> {
        let conn = self.get_conn().await?;
        let rows = conn
            .query(
                "SELECT cache_key FROM cache_tags WHERE tag = $1 ORDER BY cache_key",
                &[&tag],
            )
            .await?;
        rows.iter()
            .map(|row| row.try_get::<_, String>(0).map_err(BindingError::from))
            .collect()
    }

    async fn delete_tag(&self, tag: &str) -> Result<u64, BindingError> {
        let conn = self.get_conn().await?;
        Ok(conn
            .execute("DELETE FROM cache_tags WHERE tag = $1", &[&tag])
            .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = PostgresConfig::default();
        assert_eq!(config.port, 5432);
        assert_eq!(config.dbname, "blaze");
        assert_eq!(config.max_size, 16);
    }

    #[test]
    fn test_schema_declares_indexes() {
        assert!(SCHEMA_SQL.contains("ON cache_store (category)"));
        assert!(SCHEMA_SQL.contains("ON cache_store (expires_at)"));
        assert!(SCHEMA_SQL.contains("PRIMARY KEY (tag, cache_key)"));
    }

    #[tokio::test]
    async fn test_create_pool_is_lazy() {
        // Pool creation does not connect, so it succeeds without a server.
        let config = PostgresConfig {
            port: 1,
            ..PostgresConfig::default()
        };
        let table = PgCacheTable::from_config(&config).expect("pool creation");
        assert_eq!(table.pool_size(), 0);
    }
}
