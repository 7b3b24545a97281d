use anyhow::{Context, Result};
use async_trait::async_trait;
use shared::{domain::MAX_AMOUNT, error::ErrorCode};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, Sqlite,
};
use std::{
    fs,
    future::Future,
    path::{Path, PathBuf},
    str::FromStr,
    sync::Arc,
    time::Duration,
};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::warn;

/// Name of the single persisted slot.
pub const COUNT_SLOT: &str = "count";

pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage unavailable: {0}")]
    Unavailable(#[from] sqlx::Error),
    #[error("storage did not answer within {0:?}")]
    Timeout(Duration),
    #[error("persisted count {0} is not a valid occupancy")]
    Corrupt(i64),
}

impl StoreError {
    pub fn code(&self) -> ErrorCode {
        match self {
            StoreError::Unavailable(_) | StoreError::Timeout(_) => ErrorCode::StorageUnavailable,
            StoreError::Corrupt(_) => ErrorCode::Unknown,
        }
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Owner of the occupancy count.
///
/// Every mutation is a single atomic read-modify-write with respect to the
/// others and returns the value it produced. A failed call leaves the
/// previous value in place.
#[async_trait]
pub trait CounterStore: Send + Sync {
    async fn get(&self) -> StoreResult<u64>;

    /// Adds `delta`, saturating at [`MAX_AMOUNT`] instead of overflowing.
    async fn increment(&self, delta: u64) -> StoreResult<u64>;

    /// Subtracts `delta`, clamped at zero.
    async fn decrement(&self, delta: u64) -> StoreResult<u64>;

    /// Always yields zero.
    async fn reset(&self) -> StoreResult<u64>;

    async fn health_check(&self) -> StoreResult<()> {
        self.get().await.map(|_| ())
    }
}

/// Process-local store. Lost on restart.
#[derive(Clone, Default)]
pub struct MemoryStore {
    count: Arc<Mutex<u64>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_count(count: u64) -> Self {
        Self {
            count: Arc::new(Mutex::new(count)),
        }
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn get(&self) -> StoreResult<u64> {
        Ok(*self.count.lock().await)
    }

    async fn increment(&self, delta: u64) -> StoreResult<u64> {
        let mut guard = self.count.lock().await;
        *guard = guard.saturating_add(delta).min(MAX_AMOUNT);
        Ok(*guard)
    }

    async fn decrement(&self, delta: u64) -> StoreResult<u64> {
        let mut guard = self.count.lock().await;
        *guard = guard.saturating_sub(delta);
        Ok(*guard)
    }

    async fn reset(&self) -> StoreResult<u64> {
        let mut guard = self.count.lock().await;
        *guard = 0;
        Ok(0)
    }
}

/// SQLite-backed store. The arithmetic runs inside one upsert statement so
/// concurrent writers (including other processes) never lose updates.
#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
    timeout: Duration,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        Self::with_timeout(database_url, DEFAULT_STORE_TIMEOUT).await
    }

    pub async fn with_timeout(database_url: &str, timeout: Duration) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .busy_timeout(timeout);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .acquire_timeout(timeout)
            .connect_with(connect_options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool, timeout })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn bounded<T, F>(&self, operation: &'static str, query: F) -> StoreResult<T>
    where
        F: Future<Output = std::result::Result<T, sqlx::Error>> + Send,
    {
        match tokio::time::timeout(self.timeout, query).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(error)) => {
                warn!(operation, %error, "sqlite counter operation failed");
                Err(StoreError::Unavailable(error))
            }
            Err(_) => {
                warn!(operation, timeout = ?self.timeout, "sqlite counter operation timed out");
                Err(StoreError::Timeout(self.timeout))
            }
        }
    }
}

#[async_trait]
impl CounterStore for Storage {
    async fn get(&self) -> StoreResult<u64> {
        let value: Option<i64> = self
            .bounded(
                "get",
                sqlx::query_scalar::<_, i64>("SELECT value FROM counters WHERE name = ?1")
                    .bind(COUNT_SLOT)
                    .fetch_optional(&self.pool),
            )
            .await?;
        value.map_or(Ok(0), to_count)
    }

    async fn increment(&self, delta: u64) -> StoreResult<u64> {
        let value: i64 = self
            .bounded(
                "increment",
                sqlx::query_scalar::<_, i64>(
                    "INSERT INTO counters (name, value) VALUES (?1, ?2)
                     ON CONFLICT(name) DO UPDATE
                     SET value = MIN(counters.value, 9223372036854775807 - ?2) + ?2,
                         updated_at = CURRENT_TIMESTAMP
                     RETURNING value",
                )
                .bind(COUNT_SLOT)
                .bind(to_delta(delta))
                .fetch_one(&self.pool),
            )
            .await?;
        to_count(value)
    }

    async fn decrement(&self, delta: u64) -> StoreResult<u64> {
        let value: i64 = self
            .bounded(
                "decrement",
                sqlx::query_scalar::<_, i64>(
                    "INSERT INTO counters (name, value) VALUES (?1, 0)
                     ON CONFLICT(name) DO UPDATE
                     SET value = MAX(0, counters.value - ?2),
                         updated_at = CURRENT_TIMESTAMP
                     RETURNING value",
                )
                .bind(COUNT_SLOT)
                .bind(to_delta(delta))
                .fetch_one(&self.pool),
            )
            .await?;
        to_count(value)
    }

    async fn reset(&self) -> StoreResult<u64> {
        let value: i64 = self
            .bounded(
                "reset",
                sqlx::query_scalar::<_, i64>(
                    "INSERT INTO counters (name, value) VALUES (?1, 0)
                     ON CONFLICT(name) DO UPDATE
                     SET value = 0, updated_at = CURRENT_TIMESTAMP
                     RETURNING value",
                )
                .bind(COUNT_SLOT)
                .fetch_one(&self.pool),
            )
            .await?;
        to_count(value)
    }

    async fn health_check(&self) -> StoreResult<()> {
        let _: i64 = self
            .bounded(
                "health_check",
                sqlx::query_scalar::<_, i64>("SELECT 1").fetch_one(&self.pool),
            )
            .await?;
        Ok(())
    }
}

fn to_count(value: i64) -> StoreResult<u64> {
    u64::try_from(value).map_err(|_| StoreError::Corrupt(value))
}

fn to_delta(delta: u64) -> i64 {
    i64::try_from(delta).unwrap_or(i64::MAX)
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url == "sqlite::memory:" || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
