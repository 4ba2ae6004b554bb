//! SQLite-backed session store.
//!
//! Two relations: `messages` holds the JSON-serialised message payloads in
//! insertion order, `usage` holds one accumulating row per session. An
//! embedded `SessionCache` serves reads for active conversations; the
//! database stays the source of truth because the cache is only updated
//! after a successful commit.

use std::path::Path;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use tandem_core::error::StoreError;
use tandem_core::message::Msg;
use tandem_core::response::Usage;
use tandem_core::store::Store;

use crate::cache::SessionCache;

/// A durable session store with a write-through in-memory cache.
pub struct SqliteStore {
    pool: SqlitePool,
    cache: RwLock<SessionCache>,
}

impl SqliteStore {
    /// Open (or create) the database at `path`. Pass `":memory:"` for an
    /// in-process ephemeral database.
    pub async fn open(path: &str) -> Result<Self, StoreError> {
        let options = if path == ":memory:" {
            SqliteConnectOptions::new().in_memory(true)
        } else {
            if let Some(dir) = Path::new(path).parent() {
                if !dir.as_os_str().is_empty() {
                    std::fs::create_dir_all(dir).map_err(|e| {
                        StoreError::Storage(format!("failed to create directory: {e}"))
                    })?;
                }
            }
            SqliteConnectOptions::new()
                .filename(path)
                .create_if_missing(true)
        }
        .journal_mode(SqliteJournalMode::Wal);

        // One connection: access is serialised by the cache lock anyway,
        // and a pool would hand each connection its own `:memory:` database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| StoreError::Storage(format!("failed to open database: {e}")))?;

        let store = Self {
            pool,
            cache: RwLock::new(SessionCache::new()),
        };
        store.init_schema().await?;
        debug!(path, "sqlite session store ready");
        Ok(store)
    }

    /// Close the backing pool. Flushes nothing; pending state is already
    /// committed.
    pub async fn close(&self) -> Result<(), StoreError> {
        self.pool.close().await;
        Ok(())
    }

    async fn init_schema(&self) -> Result<(), StoreError> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT NOT NULL,
                payload BLOB NOT NULL,
                created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
            )
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS idx_messages_session_id_id
                ON messages(session_id, id)
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS usage (
                session_id TEXT PRIMARY KEY,
                input_tokens INTEGER NOT NULL DEFAULT 0,
                cached_tokens INTEGER NOT NULL DEFAULT 0,
                output_tokens INTEGER NOT NULL DEFAULT 0,
                reasoning_tokens INTEGER NOT NULL DEFAULT 0,
                cost INTEGER NOT NULL DEFAULT 0,
                created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        ];

        for statement in statements {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| StoreError::Storage(format!("failed to create schema: {e}")))?;
        }

        Ok(())
    }

    async fn load_messages(&self, session: &str) -> Result<Vec<Msg>, StoreError> {
        let rows = sqlx::query("SELECT payload FROM messages WHERE session_id = ?1 ORDER BY id ASC")
            .bind(session)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::Storage(format!("failed to query messages: {e}")))?;

        let mut msgs = Vec::with_capacity(rows.len());
        for row in &rows {
            let payload: Vec<u8> = row
                .try_get("payload")
                .map_err(|e| StoreError::Storage(format!("payload column: {e}")))?;
            msgs.push(serde_json::from_slice(&payload)?);
        }
        Ok(msgs)
    }

    async fn load_usage(&self, session: &str) -> Result<Usage, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT input_tokens, cached_tokens, output_tokens, reasoning_tokens, cost
            FROM usage
            WHERE session_id = ?1
            "#,
        )
        .bind(session)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Storage(format!("failed to query usage: {e}")))?;

        let Some(row) = row else {
            return Ok(Usage::default());
        };

        let mut usage = Usage {
            input: row.try_get(0).unwrap_or(0),
            cached: row.try_get(1).unwrap_or(0),
            output: row.try_get(2).unwrap_or(0),
            reasoning: row.try_get(3).unwrap_or(0),
            total: 0,
            cost: row.try_get(4).unwrap_or(0),
        };
        // The total is never persisted; recompute it on every load.
        usage.total = usage.input + usage.cached + usage.output;

        Ok(usage)
    }
}

#[async_trait]
impl Store for SqliteStore {
    /// Returns the session history, serving repeat reads from the cache.
    async fn messages(&self, session: &str) -> Vec<Msg> {
        {
            let cache = self.cache.read().await;
            let msgs = cache.messages(session);
            if !msgs.is_empty() {
                return msgs;
            }
        }

        let mut cache = self.cache.write().await;

        // Double-check after acquiring the write lock.
        let msgs = cache.messages(session);
        if !msgs.is_empty() {
            return msgs;
        }

        let msgs = match self.load_messages(session).await {
            Ok(msgs) => msgs,
            Err(e) => {
                warn!(session, error = %e, "failed to load messages");
                return Vec::new();
            }
        };
        if msgs.is_empty() {
            return Vec::new();
        }

        // The cache must be populated with messages and usage together;
        // if the usage load fails we drop the messages too rather than
        // leave a session cached with wrong accounting.
        let usage = match self.load_usage(session).await {
            Ok(usage) => usage,
            Err(e) => {
                warn!(session, error = %e, "failed to load usage; dropping loaded messages");
                return Vec::new();
            }
        };

        cache.extend(session, &msgs, usage);
        msgs
    }

    /// Returns the accumulated usage. A cache miss reads the database but
    /// intentionally does NOT populate the cache: only `messages` and
    /// `extend` insert sessions, so the cache never holds usage without
    /// its messages.
    async fn usage(&self, session: &str) -> Usage {
        {
            let cache = self.cache.read().await;
            let usage = cache.usage(session);
            // Any session with recorded usage has either input tokens or
            // accumulated cost.
            if usage.input != 0 || usage.cost != 0 {
                return usage;
            }
        }

        match self.load_usage(session).await {
            Ok(usage) => usage,
            Err(e) => {
                warn!(session, error = %e, "failed to load usage");
                Usage::default()
            }
        }
    }

    async fn extend(&self, session: &str, msgs: &[Msg], usage: Usage) -> Result<(), StoreError> {
        let mut cache = self.cache.write().await;

        // Persist first so the database stays the source of truth.
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::Storage(format!("failed to begin transaction: {e}")))?;

        for msg in msgs {
            let payload = serde_json::to_vec(msg)?;
            sqlx::query("INSERT INTO messages (session_id, payload) VALUES (?1, ?2)")
                .bind(session)
                .bind(payload)
                .execute(&mut *tx)
                .await
                .map_err(|e| StoreError::Storage(format!("failed to insert message: {e}")))?;
        }

        sqlx::query(
            r#"
            INSERT INTO usage (session_id, input_tokens, cached_tokens, output_tokens, reasoning_tokens, cost)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(session_id) DO UPDATE SET
                input_tokens = usage.input_tokens + excluded.input_tokens,
                cached_tokens = usage.cached_tokens + excluded.cached_tokens,
                output_tokens = usage.output_tokens + excluded.output_tokens,
                reasoning_tokens = usage.reasoning_tokens + excluded.reasoning_tokens,
                cost = usage.cost + excluded.cost
            "#,
        )
        .bind(session)
        .bind(usage.input)
        .bind(usage.cached)
        .bind(usage.output)
        .bind(usage.reasoning)
        .bind(usage.cost)
        .execute(&mut *tx)
        .await
        .map_err(|e| StoreError::Storage(format!("failed to upsert usage: {e}")))?;

        tx.commit()
            .await
            .map_err(|e| StoreError::Storage(format!("failed to commit transaction: {e}")))?;

        // Only now is the cache allowed to see the new state.
        cache.extend(session, msgs, usage);

        Ok(())
    }
}
