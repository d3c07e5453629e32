//! Resilient access to the relational store.
//!
//! Writes are retried with capped exponential backoff and a per-attempt
//! timeout; reads pass straight through. Every attempt is observed and turned
//! into [`DbEvent`]s which a [`DatabaseEventHandler`] forwards to the error
//! logger, reconnecting the pool on connection-class failures.

use std::{
    fmt::Display,
    future::Future,
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use db::{DBService, models::error_log::ErrorCategory};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use strum_macros::{Display as StrumDisplay, EnumString};
use thiserror::Error;
use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::Instant,
};
use tracing::{debug, error, info, warn};
use ts_rs::TS;

use super::{
    config::DatabaseConfig,
    error_logger::{ErrorLogger, LogEntry, ReportedError},
};

static GLOBAL: OnceCell<Arc<Database>> = OnceCell::new();

#[derive(Debug, Error)]
pub enum RetryError<E> {
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Failed(E),
}

#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("database operation timed out after {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

impl From<RetryError<sqlx::Error>> for DatabaseError {
    fn from(err: RetryError<sqlx::Error>) -> Self {
        match err {
            RetryError::Timeout(after) => Self::Timeout(after),
            RetryError::Failed(e) => Self::Sqlx(e),
        }
    }
}

fn backoff(config: &DatabaseConfig, retries: usize) -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(config.base_delay_ms))
        .with_max_delay(Duration::from_millis(config.max_delay_ms))
        .with_factor(2.0)
        .with_max_times(retries)
}

/// Race every attempt of `operation` against the query timeout and retry
/// failures (timeouts included) up to `retries` times with capped exponential
/// backoff. Once the budget is spent the last error is returned.
pub async fn with_retry<T, E, F, Fut>(
    operation: F,
    retries: usize,
    config: &DatabaseConfig,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    retry_notifying(operation, retries, config, |_| {}).await
}

async fn retry_notifying<T, E, F, Fut>(
    mut operation: F,
    retries: usize,
    config: &DatabaseConfig,
    mut on_retry: impl FnMut(&RetryError<E>),
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let timeout = config.query_timeout();

    (|| {
        let attempt = operation();
        async move {
            match tokio::time::timeout(timeout, attempt).await {
                Ok(result) => result.map_err(RetryError::Failed),
                Err(_) => Err(RetryError::Timeout(timeout)),
            }
        }
    })
    .retry(backoff(config, retries))
    .notify(|e: &RetryError<E>, dur: Duration| {
        warn!(
            "Database operation failed, retrying after {:.2}s: {}",
            dur.as_secs_f64(),
            e
        );
        on_retry(e);
    })
    .await
}

/// Operation kinds routed through [`Database::run`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS, EnumString, StrumDisplay)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum DbAction {
    FindUnique,
    FindFirst,
    FindMany,
    Count,
    Aggregate,
    Create,
    Update,
    Upsert,
    Delete,
}

impl DbAction {
    pub fn is_write(self) -> bool {
        matches!(self, Self::Create | Self::Update | Self::Upsert | Self::Delete)
    }
}

/// Driver-level observations
#[derive(Debug, Clone, PartialEq)]
pub enum DbEvent {
    Query { query: String, duration: Duration },
    Warn { message: String },
    Error { message: String },
}

/// `PoolClosed` is left out: the reconnect itself closes the old pool, and
/// queries still holding it must not trigger another cycle.
fn is_connection_error(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Io(_) | sqlx::Error::Tls(_) | sqlx::Error::PoolTimedOut | sqlx::Error::WorkerCrashed
    )
}

pub struct Database {
    db: DBService,
    config: DatabaseConfig,
    logger: Arc<ErrorLogger>,
    events: Option<mpsc::UnboundedSender<DbEvent>>,
}

impl Database {
    pub fn new(db: DBService, config: DatabaseConfig, logger: Arc<ErrorLogger>) -> Self {
        Self {
            db,
            config,
            logger,
            events: None,
        }
    }

    pub fn with_events(mut self, events: mpsc::UnboundedSender<DbEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Wrap `db` and spawn the handler that turns its events into log entries.
    pub fn start(
        db: DBService,
        config: DatabaseConfig,
        logger: Arc<ErrorLogger>,
    ) -> (Arc<Self>, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handler = DatabaseEventHandler::new(logger.clone(), Arc::new(db.clone())).spawn(rx);
        (Arc::new(Self::new(db, config, logger).with_events(tx)), handler)
    }

    /// Store `database` in the process-wide slot. If one is already installed
    /// that instance is kept and returned.
    pub fn install(database: Arc<Self>) -> Arc<Self> {
        let installed = GLOBAL.get_or_init(|| database.clone());
        if !Arc::ptr_eq(installed, &database) {
            debug!("Database already installed; reusing existing instance");
        }
        installed.clone()
    }

    fn emit(&self, event: DbEvent) {
        if let Some(events) = &self.events {
            // A closed channel only means the handler has shut down.
            let _ = events.send(event);
        }
    }

    fn observe(&self, query: &str, elapsed: Duration, failure: Option<&sqlx::Error>) {
        if self.config.log_queries {
            self.emit(DbEvent::Query {
                query: query.to_string(),
                duration: elapsed,
            });
        }
        if elapsed > self.config.slow_query_threshold() {
            self.emit(DbEvent::Warn {
                message: format!("Slow query: {query} took {}ms", elapsed.as_millis()),
            });
        }
        if let Some(err) = failure.filter(|e| is_connection_error(e)) {
            self.emit(DbEvent::Error {
                message: err.to_string(),
            });
        }
    }

    /// Run `op` against the current pool. Writes are retried; reads run once.
    pub async fn run<T, F, Fut>(
        &self,
        model: &str,
        action: DbAction,
        mut op: F,
    ) -> Result<T, DatabaseError>
    where
        F: FnMut(SqlitePool) -> Fut,
        Fut: Future<Output = Result<T, sqlx::Error>>,
    {
        let query = format!("{model}.{action}");
        let mut attempt = || {
            let pending = op(self.db.pool());
            let query = query.as_str();
            async move {
                let started = Instant::now();
                let result = pending.await;
                self.observe(query, started.elapsed(), result.as_ref().err());
                result
            }
        };

        if !action.is_write() {
            return attempt().await.map_err(DatabaseError::from);
        }

        let result = retry_notifying(attempt, self.config.max_retries, &self.config, |e| {
            if let RetryError::Timeout(after) = e {
                self.emit(DbEvent::Warn {
                    message: format!("{query} timed out after {after:?}"),
                });
            }
        })
        .await;

        match result {
            Ok(value) => Ok(value),
            Err(e) => {
                let e = DatabaseError::from(e);
                if let DatabaseError::Timeout(after) = &e {
                    self.emit(DbEvent::Warn {
                        message: format!("{query} timed out after {after:?}"),
                    });
                }
                self.logger
                    .log_error(
                        LogEntry::error(ErrorCategory::Database, format!("Transaction failed: {e}"))
                            .with_error(ReportedError::from_error(&e))
                            .with_metadata("action", action.to_string())
                            .with_metadata("model", model),
                    )
                    .await;
                Err(e)
            }
        }
    }
}

/// Re-establishing a connection after a driver error
#[async_trait]
pub trait Reconnect: Send + Sync {
    async fn disconnect(&self);
    async fn connect(&self) -> Result<(), sqlx::Error>;
}

#[async_trait]
impl Reconnect for DBService {
    async fn disconnect(&self) {
        DBService::disconnect(self).await
    }

    async fn connect(&self) -> Result<(), sqlx::Error> {
        DBService::connect(self).await
    }
}

pub struct DatabaseEventHandler {
    logger: Arc<ErrorLogger>,
    connection: Arc<dyn Reconnect>,
}

impl DatabaseEventHandler {
    pub fn new(logger: Arc<ErrorLogger>, connection: Arc<dyn Reconnect>) -> Self {
        Self { logger, connection }
    }

    pub fn spawn(self, mut events: mpsc::UnboundedReceiver<DbEvent>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                self.handle(event).await;
            }
            debug!("Database event stream closed");
        })
    }

    pub async fn handle(&self, event: DbEvent) {
        match event {
            DbEvent::Query { query, duration } => {
                self.logger
                    .log_error(
                        LogEntry::info(ErrorCategory::Database, format!("Query executed: {query}"))
                            .with_metadata("query", query)
                            .with_metadata("duration", duration.as_millis() as u64),
                    )
                    .await;
            }
            DbEvent::Warn { message } => {
                self.logger
                    .log_error(LogEntry::warning(
                        ErrorCategory::Database,
                        format!("Database warning: {message}"),
                    ))
                    .await;
            }
            DbEvent::Error { message } => {
                self.logger
                    .log_error(
                        LogEntry::error(ErrorCategory::Database, format!("Database error: {message}"))
                            .with_error(ReportedError::named("DatabaseError", message)),
                    )
                    .await;
                self.reconnect().await;
            }
        }
    }

    /// One disconnect/connect cycle. A failure here is only logged.
    async fn reconnect(&self) {
        self.connection.disconnect().await;
        match self.connection.connect().await {
            Ok(()) => info!("Database connection re-established"),
            Err(e) => {
                error!(error = %e, "Failed to reconnect to database");
                self.logger
                    .log_error(
                        LogEntry::critical(ErrorCategory::Database, "Failed to reconnect to database")
                            .with_error(ReportedError::from_error(&e)),
                    )
                    .await;
            }
        }
    }
}
