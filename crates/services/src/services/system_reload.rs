//! Soft reload of client-side state with escalating retries.
//!
//! A reload asks the design system to drop its cached render context and the
//! query cache to invalidate everything. Failed attempts are retried after
//! `base * 2^n`; once the budget is spent a persistent error is shown and the
//! chain stops. Only one chain runs at a time.

use std::sync::{
    Arc,
    atomic::{AtomicU32, Ordering},
};

use async_trait::async_trait;
use db::models::error_log::ErrorCategory;
use serde::Serialize;
use tokio::{
    sync::{broadcast::error::RecvError, watch},
    task::JoinHandle,
    time::{Instant, interval_at},
};
use tracing::{debug, info, warn};
use ts_rs::TS;

use super::{
    config::ReloadConfig,
    error_logger::{ErrorLogger, LogEntry, ReportedError},
    i18n::Translator,
    notification::{Notifier, Toast},
    scheduler::TaskSlot,
};

/// Shared render context that can be rebuilt in place
#[async_trait]
pub trait DesignSystem: Send + Sync {
    async fn force_reload(&self) -> anyhow::Result<()>;

    fn is_reloading(&self) -> bool;
}

#[async_trait]
pub trait QueryInvalidator: Send + Sync {
    async fn invalidate_queries(&self) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, TS)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum ReloadPhase {
    Idle,
    Attempting { retry_count: u32 },
    Backoff { retry_count: u32, delay_ms: u64 },
    Succeeded { retry_count: u32 },
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReloadOutcome {
    Succeeded { retry_count: u32 },
    Exhausted { error: String },
}

pub struct ReloadServices {
    pub design_system: Arc<dyn DesignSystem>,
    pub invalidator: Arc<dyn QueryInvalidator>,
    pub logger: Arc<ErrorLogger>,
    pub notifier: Arc<dyn Notifier>,
    pub translator: Arc<dyn Translator>,
}

struct Chain {
    services: ReloadServices,
    config: ReloadConfig,
    phase: watch::Sender<ReloadPhase>,
}

impl Chain {
    async fn attempt(&self) -> anyhow::Result<()> {
        self.services.design_system.force_reload().await?;
        self.services.invalidator.invalidate_queries().await
    }

    async fn run(&self, mut retry_count: u32) -> ReloadOutcome {
        let max_retries = self.config.max_retries;
        let logger = &self.services.logger;
        let t = &self.services.translator;

        loop {
            self.phase.send_replace(ReloadPhase::Attempting { retry_count });
            logger
                .log_error(
                    LogEntry::info(
                        ErrorCategory::Ui,
                        format!("System reload attempt {}/{}", retry_count + 1, max_retries + 1),
                    )
                    .with_metadata("retryCount", retry_count),
                )
                .await;

            let err = match self.attempt().await {
                Ok(()) => {
                    logger
                        .log_error(
                            LogEntry::info(ErrorCategory::Ui, "System reload successful")
                                .with_metadata("retryCount", retry_count),
                        )
                        .await;
                    self.services.notifier.show(
                        Toast::success(t.t("system.reload.success")).with_description(t.translate(
                            "system.reload.successDescription",
                            &[("retryCount", retry_count.to_string())],
                        )),
                    );
                    self.phase.send_replace(ReloadPhase::Succeeded { retry_count });
                    info!(retry_count, "System reload succeeded");
                    return ReloadOutcome::Succeeded { retry_count };
                }
                Err(err) => err,
            };

            logger
                .log_error(
                    LogEntry::error(ErrorCategory::Ui, "System reload failed")
                        .with_error(ReportedError::from_anyhow(&err))
                        .with_metadata("retryCount", retry_count),
                )
                .await;

            if retry_count >= max_retries {
                self.services.notifier.show(
                    Toast::error(t.t("system.reload.error"))
                        .with_description(t.translate(
                            "system.reload.errorDescription",
                            &[
                                ("maxRetries", max_retries.to_string()),
                                ("error", err.to_string()),
                            ],
                        ))
                        .persistent(),
                );
                self.phase.send_replace(ReloadPhase::Failed);
                warn!(error = %err, "System reload gave up after {} retries", max_retries);
                return ReloadOutcome::Exhausted {
                    error: err.to_string(),
                };
            }

            let delay = self.config.delay_for(retry_count);
            self.services.notifier.show(
                Toast::warning(t.t("system.reload.retryWarning")).with_description(t.translate(
                    "system.reload.retryDescription",
                    &[
                        ("seconds", delay.as_secs_f64().to_string()),
                        ("attempt", (retry_count + 1).to_string()),
                        ("maxRetries", max_retries.to_string()),
                    ],
                )),
            );
            self.phase.send_replace(ReloadPhase::Backoff {
                retry_count: retry_count + 1,
                delay_ms: delay.as_millis() as u64,
            });

            tokio::time::sleep(delay).await;
            retry_count += 1;
        }
    }
}

pub struct SystemReloader {
    chain: Arc<Chain>,
    task: TaskSlot,
    error_count: AtomicU32,
}

impl SystemReloader {
    pub fn new(services: ReloadServices, config: ReloadConfig) -> Self {
        let (phase, _) = watch::channel(ReloadPhase::Idle);
        Self {
            chain: Arc::new(Chain {
                services,
                config,
                phase,
            }),
            task: TaskSlot::new(),
            error_count: AtomicU32::new(0),
        }
    }

    /// Start a reload chain at `retry_count`, replacing any chain in flight.
    pub fn reload_systems(&self, retry_count: u32) -> JoinHandle<ReloadOutcome> {
        let chain = self.chain.clone();
        self.task.replace(async move { chain.run(retry_count).await })
    }

    pub fn phase(&self) -> watch::Receiver<ReloadPhase> {
        self.chain.phase.subscribe()
    }

    pub fn is_reloading(&self) -> bool {
        self.task.is_pending() || self.chain.services.design_system.is_reloading()
    }

    pub fn error_count(&self) -> u32 {
        self.error_count.load(Ordering::SeqCst)
    }

    /// Reload button text, with the recent error count once there is one.
    pub fn button_label(&self) -> String {
        let label = self.chain.services.translator.t("system.reload.button");
        match self.error_count() {
            0 => label,
            n => format!("{label} ({n})"),
        }
    }

    /// Stop any chain in flight.
    pub fn cancel(&self) {
        self.task.cancel();
    }

    fn record_errors(&self, n: u32) {
        let count = self.error_count.fetch_add(n, Ordering::SeqCst) + n;
        if count <= self.chain.config.error_threshold {
            return;
        }
        if self.task.is_pending() {
            debug!(count, "Error threshold exceeded; reload already in flight");
            return;
        }
        info!(count, "Error threshold exceeded; reloading systems");
        self.reload_systems(0);
    }

    /// Count persisted errors and reload once more than the threshold arrive
    /// within one counting window.
    pub fn watch_errors(self: &Arc<Self>) -> JoinHandle<()> {
        let mut events = self.chain.services.logger.subscribe();
        let reloader = self.clone();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(_) => reloader.record_errors(1),
                    Err(RecvError::Lagged(skipped)) => {
                        reloader.record_errors(u32::try_from(skipped).unwrap_or(u32::MAX))
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }

    /// Zero the error counter every window, whether or not a reload fired.
    pub fn spawn_counter_reset(self: &Arc<Self>) -> JoinHandle<()> {
        let period = self.chain.config.error_window();
        let reloader = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut interval = interval_at(Instant::now() + period, period);
            loop {
                interval.tick().await;
                let Some(reloader) = reloader.upgrade() else {
                    break;
                };
                reloader.error_count.store(0, Ordering::SeqCst);
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use db::models::error_log::ErrorSeverity;

    use super::*;
    use crate::services::{
        config::LoggerConfig,
        i18n::Catalog,
        notification::ToastLevel,
        test_support::{
            MemoryErrorLogStore, RecordingInvalidator, RecordingNotifier, ScriptedDesignSystem,
            logger_with,
        },
    };

    struct Harness {
        reloader: Arc<SystemReloader>,
        design_system: Arc<ScriptedDesignSystem>,
        invalidator: Arc<RecordingInvalidator>,
        notifier: Arc<RecordingNotifier>,
        logger: Arc<ErrorLogger>,
        store: Arc<MemoryErrorLogStore>,
    }

    fn harness(failures: u32) -> Harness {
        let (logger, store, _) = logger_with(LoggerConfig {
            rate_limit_max_events: 100,
            ..LoggerConfig::default()
        });
        let design_system = Arc::new(ScriptedDesignSystem::failing(failures));
        let invalidator = Arc::new(RecordingInvalidator::default());
        let notifier = Arc::new(RecordingNotifier::default());
        let reloader = Arc::new(SystemReloader::new(
            ReloadServices {
                design_system: design_system.clone(),
                invalidator: invalidator.clone(),
                logger: logger.clone(),
                notifier: notifier.clone(),
                translator: Arc::new(Catalog::english()),
            },
            ReloadConfig::default(),
        ));
        Harness {
            reloader,
            design_system,
            invalidator,
            notifier,
            logger,
            store,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn successful_reload_invalidates_and_notifies() {
        let h = harness(0);

        let outcome = h.reloader.reload_systems(0).await.unwrap();

        assert_eq!(outcome, ReloadOutcome::Succeeded { retry_count: 0 });
        assert_eq!(h.invalidator.calls(), 1);
        assert_eq!(h.notifier.titles(), vec!["Systems reloaded"]);
        let messages: Vec<_> = h.store.logs().into_iter().map(|l| l.message).collect();
        assert_eq!(messages, vec!["System reload attempt 1/4", "System reload successful"]);
        assert_eq!(*h.reloader.phase().borrow(), ReloadPhase::Succeeded { retry_count: 0 });
    }

    #[tokio::test(start_paused = true)]
    async fn failing_reload_escalates_then_gives_up() {
        let h = harness(u32::MAX);

        let outcome = h.reloader.reload_systems(0).await.unwrap();

        assert!(matches!(outcome, ReloadOutcome::Exhausted { .. }));
        let calls = h.design_system.calls();
        assert_eq!(calls.len(), 4);
        let gaps: Vec<_> = calls.windows(2).map(|w| w[1] - w[0]).collect();
        assert_eq!(
            gaps,
            vec![
                Duration::from_millis(1000),
                Duration::from_millis(2000),
                Duration::from_millis(4000)
            ]
        );

        let toasts = h.notifier.toasts();
        let warnings: Vec<_> = toasts
            .iter()
            .filter(|t| t.level == ToastLevel::Warning)
            .map(|t| t.description.clone().unwrap())
            .collect();
        assert_eq!(
            warnings,
            vec![
                "Retrying in 1s (attempt 1 of 3)",
                "Retrying in 2s (attempt 2 of 3)",
                "Retrying in 4s (attempt 3 of 3)",
            ]
        );
        let last = toasts.last().unwrap();
        assert_eq!(last.title, "System reload failed");
        assert!(last.is_persistent());
        assert_eq!(h.invalidator.calls(), 0);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(h.design_system.calls().len(), 4);
        assert_eq!(*h.reloader.phase().borrow(), ReloadPhase::Failed);
        assert!(!h.reloader.is_reloading());
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_on_a_later_attempt() {
        let h = harness(1);

        let outcome = h.reloader.reload_systems(0).await.unwrap();

        assert_eq!(outcome, ReloadOutcome::Succeeded { retry_count: 1 });
        let toasts = h.notifier.toasts();
        assert_eq!(
            toasts.last().unwrap().description.as_deref(),
            Some("All systems were reloaded after 1 retries.")
        );
        let failed = h
            .store
            .logs()
            .into_iter()
            .find(|l| l.severity == ErrorSeverity::Error)
            .unwrap();
        assert_eq!(failed.message, "System reload failed");
        assert_eq!(failed.metadata.0["retryCount"], 0);
    }

    #[tokio::test(start_paused = true)]
    async fn new_chain_replaces_the_old_one() {
        let h = harness(u32::MAX);

        let first = h.reloader.reload_systems(0);
        tokio::time::sleep(Duration::from_millis(500)).await;
        let second = h.reloader.reload_systems(3);

        assert!(first.await.unwrap_err().is_cancelled());
        assert!(matches!(second.await.unwrap(), ReloadOutcome::Exhausted { .. }));
        assert_eq!(h.design_system.calls().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn error_burst_triggers_a_single_reload() {
        let h = harness(0);
        let watcher = h.reloader.watch_errors();

        for n in 0..6 {
            h.logger
                .log_error(LogEntry::error(ErrorCategory::Api, format!("request {n} failed")))
                .await;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(h.reloader.error_count(), 6);
        assert_eq!(h.design_system.calls().len(), 1);
        assert_eq!(h.reloader.button_label(), "Reload systems (6)");
        watcher.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn counter_resets_every_window() {
        let h = harness(0);
        let watcher = h.reloader.watch_errors();
        let reset = h.reloader.spawn_counter_reset();

        for n in 0..3 {
            h.logger
                .log_error(LogEntry::error(ErrorCategory::Auth, format!("denied {n}")))
                .await;
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(h.reloader.error_count(), 3);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(h.reloader.error_count(), 0);
        assert_eq!(h.reloader.button_label(), "Reload systems");
        assert!(h.design_system.calls().is_empty());

        watcher.abort();
        reset.abort();
    }
}
