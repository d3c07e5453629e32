//! In-memory collaborators shared by the service tests.

use std::sync::{
    Arc, Mutex,
    atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use db::models::error_log::{
    CreateErrorLog, ErrorCategory, ErrorLog, ErrorLogCount, ErrorLogFilter, ErrorSeverity,
};
use serde_json::json;
use sqlx::types::Json;
use tokio::time::Instant;
use uuid::Uuid;

use super::{
    config::LoggerConfig,
    crash_reporter::{CrashReport, CrashReporter},
    error_logger::{ErrorLogStore, ErrorLogger},
    i18n::Catalog,
    notification::{Notifier, Toast},
    system_reload::{DesignSystem, QueryInvalidator},
};

#[derive(Default)]
pub struct MemoryErrorLogStore {
    logs: Mutex<Vec<ErrorLog>>,
    failing: AtomicBool,
}

impl MemoryErrorLogStore {
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn logs(&self) -> Vec<ErrorLog> {
        self.logs.lock().unwrap().clone()
    }

    pub fn insert_at(
        &self,
        timestamp: DateTime<Utc>,
        severity: ErrorSeverity,
        category: ErrorCategory,
        message: &str,
    ) {
        self.logs.lock().unwrap().push(ErrorLog {
            id: Uuid::new_v4(),
            timestamp,
            severity,
            category,
            message: message.to_string(),
            stack: None,
            metadata: Json(json!({})),
        });
    }

    fn check(&self) -> Result<(), sqlx::Error> {
        if self.failing.load(Ordering::SeqCst) {
            Err(sqlx::Error::PoolClosed)
        } else {
            Ok(())
        }
    }

    fn matching(&self, filter: &ErrorLogFilter) -> Vec<ErrorLog> {
        self.logs
            .lock()
            .unwrap()
            .iter()
            .filter(|log| filter.severity.is_none_or(|s| log.severity == s))
            .filter(|log| filter.category.is_none_or(|c| log.category == c))
            .filter(|log| filter.start_date.is_none_or(|d| log.timestamp >= d))
            .filter(|log| filter.end_date.is_none_or(|d| log.timestamp <= d))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl ErrorLogStore for MemoryErrorLogStore {
    async fn create(&self, data: &CreateErrorLog) -> Result<ErrorLog, sqlx::Error> {
        self.check()?;
        let log = ErrorLog {
            id: data.id,
            timestamp: data.timestamp,
            severity: data.severity,
            category: data.category,
            message: data.message.clone(),
            stack: data.stack.clone(),
            metadata: Json(data.metadata.clone()),
        };
        self.logs.lock().unwrap().push(log.clone());
        Ok(log)
    }

    async fn find_many(
        &self,
        filter: &ErrorLogFilter,
        limit: i64,
    ) -> Result<Vec<ErrorLog>, sqlx::Error> {
        self.check()?;
        // Newest insert first, then a stable sort so equal timestamps keep that order.
        let mut logs: Vec<_> = self.matching(filter).into_iter().rev().collect();
        logs.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        logs.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(logs)
    }

    async fn count_by_category_and_severity(
        &self,
        filter: &ErrorLogFilter,
    ) -> Result<Vec<ErrorLogCount>, sqlx::Error> {
        self.check()?;
        let mut counts: Vec<ErrorLogCount> = Vec::new();
        for log in self.matching(filter) {
            match counts
                .iter_mut()
                .find(|c| c.category == log.category && c.severity == log.severity)
            {
                Some(count) => count.count += 1,
                None => counts.push(ErrorLogCount {
                    category: log.category,
                    severity: log.severity,
                    count: 1,
                }),
            }
        }
        Ok(counts)
    }

    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, sqlx::Error> {
        self.check()?;
        let mut logs = self.logs.lock().unwrap();
        let before = logs.len();
        logs.retain(|log| log.timestamp >= cutoff);
        Ok((before - logs.len()) as u64)
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    toasts: Mutex<Vec<Toast>>,
    dismissals: AtomicUsize,
}

impl RecordingNotifier {
    pub fn toasts(&self) -> Vec<Toast> {
        self.toasts.lock().unwrap().clone()
    }

    pub fn titles(&self) -> Vec<String> {
        self.toasts().into_iter().map(|t| t.title).collect()
    }

    pub fn dismissals(&self) -> usize {
        self.dismissals.load(Ordering::SeqCst)
    }
}

impl Notifier for RecordingNotifier {
    fn show(&self, toast: Toast) {
        self.toasts.lock().unwrap().push(toast);
    }

    fn dismiss_all(&self) {
        self.dismissals.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct RecordingCrashReporter {
    reports: Mutex<Vec<CrashReport>>,
}

impl RecordingCrashReporter {
    pub fn reports(&self) -> Vec<CrashReport> {
        self.reports.lock().unwrap().clone()
    }
}

impl CrashReporter for RecordingCrashReporter {
    fn capture(&self, report: CrashReport) {
        self.reports.lock().unwrap().push(report);
    }
}

/// Fails the first `failures` reloads, then succeeds.
pub struct ScriptedDesignSystem {
    failures_left: AtomicU32,
    calls: Mutex<Vec<Instant>>,
}

impl ScriptedDesignSystem {
    pub fn failing(failures: u32) -> Self {
        Self {
            failures_left: AtomicU32::new(failures),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<Instant> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl DesignSystem for ScriptedDesignSystem {
    async fn force_reload(&self) -> anyhow::Result<()> {
        self.calls.lock().unwrap().push(Instant::now());
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            anyhow::bail!("theme provider unavailable");
        }
        Ok(())
    }

    fn is_reloading(&self) -> bool {
        false
    }
}

#[derive(Default)]
pub struct RecordingInvalidator {
    calls: AtomicUsize,
}

impl RecordingInvalidator {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl QueryInvalidator for RecordingInvalidator {
    async fn invalidate_queries(&self) -> anyhow::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Logger over an in-memory store, without the background cleanup task.
pub fn logger_with(
    config: LoggerConfig,
) -> (
    Arc<ErrorLogger>,
    Arc<MemoryErrorLogStore>,
    Arc<RecordingNotifier>,
) {
    let store = Arc::new(MemoryErrorLogStore::default());
    let notifier = Arc::new(RecordingNotifier::default());
    let logger = Arc::new(ErrorLogger::new(
        store.clone(),
        notifier.clone(),
        Arc::new(Catalog::english()),
        config,
    ));
    (logger, store, notifier)
}
