//! Central funnel for non-fatal error and warning reporting.
//!
//! Every report passes through the same policy: known-benign errors are
//! ignored, each category is rate limited, repeats of the same error inside
//! the dedup window are only counted, and whatever remains is persisted and
//! (for ERROR/CRITICAL) shown to the user. Reporting never fails the caller.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use db::{
    DBService,
    models::error_log::{
        CreateErrorLog, ErrorCategory, ErrorLog, ErrorLogCount, ErrorLogFilter, ErrorSeverity,
    },
};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use strum::IntoEnumIterator;
use tokio::{
    sync::broadcast,
    task::JoinHandle,
    time::{Instant, interval_at},
};
use tracing::{debug, error, info};
use uuid::Uuid;

use super::{
    config::LoggerConfig,
    i18n::Translator,
    notification::{Notifier, Toast, ToastDuration},
};

/// Number of leading stack lines that identify "the same error"
const DEDUP_STACK_LINES: usize = 3;

/// Persistence capability the logger needs from the store
#[async_trait]
pub trait ErrorLogStore: Send + Sync {
    async fn create(&self, data: &CreateErrorLog) -> Result<ErrorLog, sqlx::Error>;

    async fn find_many(
        &self,
        filter: &ErrorLogFilter,
        limit: i64,
    ) -> Result<Vec<ErrorLog>, sqlx::Error>;

    async fn count_by_category_and_severity(
        &self,
        filter: &ErrorLogFilter,
    ) -> Result<Vec<ErrorLogCount>, sqlx::Error>;

    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, sqlx::Error>;
}

#[async_trait]
impl ErrorLogStore for DBService {
    async fn create(&self, data: &CreateErrorLog) -> Result<ErrorLog, sqlx::Error> {
        ErrorLog::create(&self.pool(), data).await
    }

    async fn find_many(
        &self,
        filter: &ErrorLogFilter,
        limit: i64,
    ) -> Result<Vec<ErrorLog>, sqlx::Error> {
        ErrorLog::find_many(&self.pool(), filter, limit).await
    }

    async fn count_by_category_and_severity(
        &self,
        filter: &ErrorLogFilter,
    ) -> Result<Vec<ErrorLogCount>, sqlx::Error> {
        ErrorLog::count_by_category_and_severity(&self.pool(), filter).await
    }

    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, sqlx::Error> {
        ErrorLog::delete_older_than(&self.pool(), cutoff).await
    }
}

/// The error attached to a report: its display message and, when known, a
/// stack of frames or causes (one per line).
#[derive(Debug, Clone, PartialEq)]
pub struct ReportedError {
    pub name: String,
    pub message: String,
    pub stack: Option<String>,
}

impl ReportedError {
    pub fn new(message: impl Into<String>) -> Self {
        Self::named("Error", message)
    }

    pub fn named(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            stack: None,
        }
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }

    /// Capture an error and its `source()` chain.
    pub fn from_error<E: std::error::Error + ?Sized>(error: &E) -> Self {
        let name = short_type_name::<E>();
        let message = error.to_string();
        let mut lines = vec![format!("{name}: {message}")];
        let mut source = error.source();
        while let Some(cause) = source {
            lines.push(format!("caused by: {cause}"));
            source = cause.source();
        }
        Self {
            stack: (lines.len() > 1).then(|| lines.join("\n")),
            name,
            message,
        }
    }

    /// Capture an `anyhow` error, its context chain and any captured backtrace.
    pub fn from_anyhow(error: &anyhow::Error) -> Self {
        let message = error.to_string();
        let mut lines = vec![format!("Error: {message}")];
        lines.extend(error.chain().skip(1).map(|cause| format!("caused by: {cause}")));

        let backtrace = error.backtrace();
        if backtrace.status() == std::backtrace::BacktraceStatus::Captured {
            lines.extend(backtrace.to_string().lines().map(str::to_string));
        }

        Self {
            name: "Error".to_string(),
            stack: (lines.len() > 1).then(|| lines.join("\n")),
            message,
        }
    }

    fn mentions(&self, pattern: &str) -> bool {
        self.message.contains(pattern)
            || self
                .stack
                .as_deref()
                .is_some_and(|stack| stack.contains(pattern))
    }

    /// Leading stack lines, or the message when there is no stack.
    fn fingerprint(&self) -> Option<String> {
        match self.stack.as_deref() {
            Some(stack) if !stack.trim().is_empty() => Some(
                stack
                    .lines()
                    .take(DEDUP_STACK_LINES)
                    .collect::<Vec<_>>()
                    .join(""),
            ),
            _ if !self.message.is_empty() => Some(self.message.clone()),
            _ => None,
        }
    }
}

pub(crate) fn short_type_name<T: ?Sized>() -> String {
    let full = std::any::type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base).to_string()
}

/// A single report submitted to [`ErrorLogger::log_error`]
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub severity: ErrorSeverity,
    pub category: ErrorCategory,
    pub message: String,
    pub error: Option<ReportedError>,
    pub metadata: Map<String, Value>,
}

impl LogEntry {
    pub fn new(severity: ErrorSeverity, category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            severity,
            category,
            message: message.into(),
            error: None,
            metadata: Map::new(),
        }
    }

    pub fn info(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self::new(ErrorSeverity::Info, category, message)
    }

    pub fn warning(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self::new(ErrorSeverity::Warning, category, message)
    }

    pub fn error(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self::new(ErrorSeverity::Error, category, message)
    }

    pub fn critical(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self::new(ErrorSeverity::Critical, category, message)
    }

    pub fn with_error(mut self, error: ReportedError) -> Self {
        self.error = Some(error);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_metadata_map(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata.extend(metadata);
        self
    }

    fn dedup_hash(&self) -> String {
        let source = self
            .error
            .as_ref()
            .and_then(ReportedError::fingerprint)
            .unwrap_or_else(|| self.message.clone());
        format!("{:x}", Sha256::digest(source.as_bytes()))
    }
}

/// Which path of the logging policy a report took
#[derive(Debug, Clone)]
pub enum LogOutcome {
    Ignored,
    RateLimited,
    Deduplicated { occurrences: u32 },
    Persisted(ErrorLog),
    PersistFailed,
}

impl LogOutcome {
    pub fn is_persisted(&self) -> bool {
        matches!(self, Self::Persisted(_))
    }
}

/// category -> severity -> count, with every pair present
pub type ErrorAggregation = BTreeMap<ErrorCategory, BTreeMap<ErrorSeverity, i64>>;

pub fn empty_aggregation() -> ErrorAggregation {
    ErrorCategory::iter()
        .map(|category| {
            (
                category,
                ErrorSeverity::iter().map(|severity| (severity, 0)).collect(),
            )
        })
        .collect()
}

#[derive(Debug)]
struct DedupEntry {
    count: u32,
    last_logged: Instant,
}

#[derive(Debug)]
struct RateLimitEntry {
    count: u32,
    reset_at: Instant,
}

#[derive(Debug, Default)]
struct LoggerState {
    dedup: HashMap<String, DedupEntry>,
    rate_limits: HashMap<ErrorCategory, RateLimitEntry>,
}

impl LoggerState {
    /// Count the event against its category window; false once the cap is reached.
    fn admit(&mut self, category: ErrorCategory, now: Instant, config: &LoggerConfig) -> bool {
        match self.rate_limits.get_mut(&category) {
            Some(limit) if now < limit.reset_at => {
                if limit.count >= config.rate_limit_max_events {
                    return false;
                }
                limit.count += 1;
                true
            }
            _ => {
                self.rate_limits.insert(
                    category,
                    RateLimitEntry {
                        count: 1,
                        reset_at: now + config.rate_limit_window(),
                    },
                );
                true
            }
        }
    }

    fn prune_dedup(&mut self, now: Instant, config: &LoggerConfig) {
        let window = config.dedup_window();
        self.dedup
            .retain(|_, entry| now.duration_since(entry.last_logged) < window);

        while self.dedup.len() > config.max_dedup_entries {
            let Some(oldest) = self
                .dedup
                .iter()
                .min_by_key(|(_, entry)| entry.last_logged)
                .map(|(hash, _)| hash.clone())
            else {
                break;
            };
            self.dedup.remove(&oldest);
        }
    }
}

enum Admission {
    RateLimited,
    Duplicate(u32),
    Fresh { displaced: Option<DedupEntry> },
}

pub struct ErrorLogger {
    store: Arc<dyn ErrorLogStore>,
    notifier: Arc<dyn Notifier>,
    translator: Arc<dyn Translator>,
    config: LoggerConfig,
    state: Mutex<LoggerState>,
    events: broadcast::Sender<ErrorLog>,
}

impl ErrorLogger {
    pub fn new(
        store: Arc<dyn ErrorLogStore>,
        notifier: Arc<dyn Notifier>,
        translator: Arc<dyn Translator>,
        config: LoggerConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            store,
            notifier,
            translator,
            config,
            state: Mutex::new(LoggerState::default()),
            events,
        }
    }

    /// Construct the shared logger and start its retention cleanup task.
    pub fn start(
        store: Arc<dyn ErrorLogStore>,
        notifier: Arc<dyn Notifier>,
        translator: Arc<dyn Translator>,
        config: LoggerConfig,
    ) -> Arc<Self> {
        let logger = Arc::new(Self::new(store, notifier, translator, config));
        logger.spawn_cleanup();
        logger
    }

    /// Persisted ERROR and CRITICAL events, as they are written.
    pub fn subscribe(&self) -> broadcast::Receiver<ErrorLog> {
        self.events.subscribe()
    }

    fn state(&self) -> MutexGuard<'_, LoggerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_ignorable(&self, error: &ReportedError) -> bool {
        self.config
            .ignored_patterns
            .iter()
            .any(|pattern| error.mentions(pattern))
    }

    /// Rate limit and dedup check in one critical section. A fresh event
    /// reserves its dedup entry here, so concurrent repeats see it as a duplicate
    /// while the first one is still being persisted.
    fn admit(&self, category: ErrorCategory, hash: &str, now: Instant) -> Admission {
        let mut state = self.state();
        if !state.admit(category, now, &self.config) {
            return Admission::RateLimited;
        }
        if let Some(entry) = state.dedup.get_mut(hash) {
            if now.duration_since(entry.last_logged) < self.config.dedup_window() {
                entry.count += 1;
                return Admission::Duplicate(entry.count);
            }
        }

        let displaced = state.dedup.insert(
            hash.to_string(),
            DedupEntry {
                count: 1,
                last_logged: now,
            },
        );
        if state.dedup.len() > self.config.max_dedup_entries {
            state.prune_dedup(now, &self.config);
        }
        Admission::Fresh { displaced }
    }

    /// Undo a reservation whose event never reached the store.
    fn release(&self, hash: &str, displaced: Option<DedupEntry>) {
        let mut state = self.state();
        match displaced {
            Some(entry) => {
                state.dedup.insert(hash.to_string(), entry);
            }
            None => {
                state.dedup.remove(hash);
            }
        }
    }

    pub async fn log_error(&self, entry: LogEntry) -> LogOutcome {
        if let Some(error) = &entry.error {
            if self.is_ignorable(error) {
                debug!(message = %error.message, "Ignoring benign error");
                return LogOutcome::Ignored;
            }
        }

        let now = Instant::now();
        let hash = entry.dedup_hash();

        let displaced = match self.admit(entry.category, &hash, now) {
            Admission::RateLimited => {
                debug!(category = %entry.category, "Error log rate limited");
                return LogOutcome::RateLimited;
            }
            Admission::Duplicate(occurrences) => {
                debug!(category = %entry.category, occurrences, "Duplicate error suppressed");
                return LogOutcome::Deduplicated { occurrences };
            }
            Admission::Fresh { displaced } => displaced,
        };
        let previous = displaced.as_ref().map(|entry| entry.count);

        let LogEntry {
            severity,
            category,
            message,
            error,
            mut metadata,
        } = entry;

        metadata.insert("occurrences".to_string(), previous.unwrap_or(1).into());
        metadata.insert("errorHash".to_string(), hash.clone().into());

        let record = CreateErrorLog {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            severity,
            category,
            message: match previous {
                Some(count) => format!("{message} (occurred {count} times)"),
                None => message.clone(),
            },
            stack: error.and_then(|e| e.stack),
            metadata: Value::Object(metadata),
        };

        let stored = match self.store.create(&record).await {
            Ok(stored) => stored,
            Err(e) => {
                error!(error = %e, category = %category, "Failed to log error");
                self.release(&hash, displaced);
                self.notifier.show(
                    Toast::error(self.translator.t("error.logger.persistFailed"))
                        .with_description(self.translator.t("error.logger.persistFailedDescription")),
                );
                return LogOutcome::PersistFailed;
            }
        };

        if severity.is_user_visible() {
            self.notify(&stored, &message, previous);
            // Lagging or absent subscribers are not the logger's concern.
            let _ = self.events.send(stored.clone());
        }

        LogOutcome::Persisted(stored)
    }

    fn notify(&self, stored: &ErrorLog, message: &str, previous: Option<u32>) {
        let title = self.translator.translate(
            "error.logger.title",
            &[("category", stored.category.to_string().to_uppercase())],
        );
        let description = match previous {
            Some(count) => self.translator.translate(
                "error.logger.repeated",
                &[("message", message.to_string()), ("count", count.to_string())],
            ),
            None => message.to_string(),
        };
        let duration = match stored.severity {
            ErrorSeverity::Critical => ToastDuration::Persistent,
            _ => ToastDuration::Seconds(self.config.notification_secs),
        };

        self.notifier.show(
            Toast::error(title)
                .with_description(description)
                .with_duration(duration),
        );
    }

    /// Newest first. Returns an empty list (after notifying) when the store fails.
    pub async fn get_error_logs(&self, filter: &ErrorLogFilter, limit: Option<i64>) -> Vec<ErrorLog> {
        match self.store.find_many(filter, limit.unwrap_or(100)).await {
            Ok(logs) => logs,
            Err(e) => {
                error!(error = %e, "Failed to retrieve error logs");
                self.notifier.show(
                    Toast::error(self.translator.t("error.logger.retrievalFailed"))
                        .with_description(self.translator.t("error.logger.retrievalFailedDescription")),
                );
                Vec::new()
            }
        }
    }

    /// Per-category, per-severity counts with every combination present. An
    /// empty map (after notifying) when the store fails.
    pub async fn get_error_aggregation(
        &self,
        start_date: Option<DateTime<Utc>>,
        end_date: Option<DateTime<Utc>>,
    ) -> ErrorAggregation {
        let filter = ErrorLogFilter::between(start_date, end_date);
        match self.store.count_by_category_and_severity(&filter).await {
            Ok(counts) => {
                let mut aggregation = empty_aggregation();
                for ErrorLogCount {
                    category,
                    severity,
                    count,
                } in counts
                {
                    *aggregation
                        .entry(category)
                        .or_default()
                        .entry(severity)
                        .or_default() += count;
                }
                aggregation
            }
            Err(e) => {
                error!(error = %e, "Failed to aggregate error logs");
                self.notifier.show(
                    Toast::error(self.translator.t("error.logger.aggregationFailed"))
                        .with_description(self.translator.t("error.logger.aggregationFailedDescription")),
                );
                ErrorAggregation::new()
            }
        }
    }

    /// Delete persisted events past retention and drop stale dedup entries.
    pub async fn cleanup_old_logs(&self) -> Result<u64, sqlx::Error> {
        self.state().prune_dedup(Instant::now(), &self.config);

        let cutoff = Utc::now() - chrono::Duration::days(self.config.retention_days);
        self.store.delete_older_than(cutoff).await
    }

    fn spawn_cleanup(self: &Arc<Self>) -> JoinHandle<()> {
        let period = self.config.cleanup_interval();
        let logger: Weak<Self> = Arc::downgrade(self);

        info!("Starting error log cleanup every {:?}", period);

        tokio::spawn(async move {
            let mut interval = interval_at(Instant::now() + period, period);
            loop {
                interval.tick().await;
                let Some(logger) = logger.upgrade() else {
                    break;
                };
                // Trace log only; never back through the logger.
                match logger.cleanup_old_logs().await {
                    Ok(deleted) => info!(deleted, "Cleaned up old error logs"),
                    Err(e) => error!(error = %e, "Failed to cleanup old logs"),
                }
            }
        })
    }

    #[cfg(test)]
    fn dedup_len(&self) -> usize {
        self.state().dedup.len()
    }

    #[cfg(test)]
    fn rate_limited_categories(&self) -> usize {
        self.state().rate_limits.len()
    }
}
