use std::{
    str::FromStr,
    sync::{Arc, PoisonError, RwLock},
    time::Duration,
};

use sqlx::{
    SqlitePool,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
};
use tracing::info;

pub mod models;

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

/// Pooled SQLite connection that can be torn down and re-established in place.
#[derive(Clone)]
pub struct DBService {
    inner: Arc<DBInner>,
}

struct DBInner {
    options: SqliteConnectOptions,
    max_connections: u32,
    acquire_timeout: Duration,
    pool: RwLock<SqlitePool>,
}

impl DBService {
    /// Open (creating if needed) the database at `database_url` and apply migrations.
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self, sqlx::Error> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        Self::open(options, max_connections).await
    }

    /// Single-connection in-memory database, used by tests and ephemeral runs.
    pub async fn new_in_memory() -> Result<Self, sqlx::Error> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        Self::open(options, 1).await
    }

    async fn open(options: SqliteConnectOptions, max_connections: u32) -> Result<Self, sqlx::Error> {
        let acquire_timeout = Duration::from_secs(30);
        let pool = connect_pool(&options, max_connections, acquire_timeout).await?;
        MIGRATOR.run(&pool).await?;

        info!(max_connections, "Database connection pool ready");

        Ok(Self {
            inner: Arc::new(DBInner {
                options,
                max_connections,
                acquire_timeout,
                pool: RwLock::new(pool),
            }),
        })
    }

    /// Handle to the current pool. Cheap to clone.
    pub fn pool(&self) -> SqlitePool {
        self.inner
            .pool
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Close every connection of the current pool.
    pub async fn disconnect(&self) {
        self.pool().close().await;
    }

    /// Replace the pool with a freshly connected one.
    pub async fn connect(&self) -> Result<(), sqlx::Error> {
        let pool = connect_pool(
            &self.inner.options,
            self.inner.max_connections,
            self.inner.acquire_timeout,
        )
        .await?;
        MIGRATOR.run(&pool).await?;

        let previous = {
            let mut guard = self.inner.pool.write().unwrap_or_else(PoisonError::into_inner);
            std::mem::replace(&mut *guard, pool)
        };
        previous.close().await;

        info!("Database reconnected");
        Ok(())
    }
}

async fn connect_pool(
    options: &SqliteConnectOptions,
    max_connections: u32,
    acquire_timeout: Duration,
) -> Result<SqlitePool, sqlx::Error> {
    SqlitePoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(acquire_timeout)
        // An in-memory database lives only as long as its connection.
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options.clone())
        .await
}
