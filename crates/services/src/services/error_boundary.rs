//! Fault isolation for a rendered subtree.
//!
//! A boundary renders its child until the child fails (an error or a panic).
//! From then on it shows a fallback or an [`ErrorPanel`] and offers a bounded
//! retry loop driven by the caller's reset callback, plus escape hatches that
//! bypass the loop entirely.

use std::{
    any::Any,
    future::Future,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use db::models::error_log::ErrorCategory;
use futures::future::BoxFuture;
use serde::Serialize;
use serde_json::{Map, Value};
use strum_macros::Display;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use ts_rs::TS;

use super::{
    config::BoundaryConfig,
    crash_reporter::{CrashReport, CrashReporter},
    error_logger::{ErrorLogger, LogEntry, ReportedError},
    i18n::Translator,
    notification::{Notifier, Toast, ToastDuration},
    scheduler::TaskSlot,
};

/// A renderable subtree
pub trait Component: Send + Sync {
    type Output;

    fn name(&self) -> &str;

    fn render(&self) -> anyhow::Result<Self::Output>;
}

pub type ResetCallback = Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

pub fn reset_callback<F, Fut>(f: F) -> ResetCallback
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move || Box::pin(f()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum BoundaryState {
    Healthy,
    Resetting,
    Failed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CaughtError {
    pub error: ReportedError,
    pub component_stack: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, TS)]
#[serde(rename_all = "lowercase")]
pub enum PanelActionKind {
    Retry,
    Reload,
    Home,
    Back,
}

#[derive(Debug, Clone, PartialEq, Serialize, TS)]
pub struct PanelAction {
    pub kind: PanelActionKind,
    pub label: String,
}

/// Development-only diagnostics
#[derive(Debug, Clone, PartialEq, Serialize, TS)]
pub struct ErrorDetails {
    pub heading: String,
    pub message: String,
    pub stack_heading: String,
    pub stack: Option<String>,
    pub component_stack_heading: String,
    pub component_stack: String,
}

/// Built-in result view shown while failed
#[derive(Debug, Clone, PartialEq, Serialize, TS)]
pub struct ErrorPanel {
    pub title: String,
    pub subtitle: String,
    pub actions: Vec<PanelAction>,
    pub details: Option<ErrorDetails>,
}

impl ErrorPanel {
    pub fn offers(&self, kind: PanelActionKind) -> bool {
        self.actions.iter().any(|action| action.kind == kind)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum View<T> {
    Content(T),
    /// A reset is in progress
    Loading,
    Fallback(T),
    Panel(ErrorPanel),
}

/// Navigation requested by an escape hatch, performed by the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Navigation {
    Reload,
    Home(String),
    Back,
    /// Client-side route change
    To(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetOutcome {
    Recovered,
    Exhausted,
}

/// Collaborators shared by every boundary in an application
#[derive(Clone)]
pub struct BoundaryServices {
    pub notifier: Arc<dyn Notifier>,
    pub translator: Arc<dyn Translator>,
    pub crash_reporter: Arc<dyn CrashReporter>,
    /// When set, caught failures are also recorded as UI errors.
    pub logger: Option<Arc<ErrorLogger>>,
    pub config: BoundaryConfig,
    pub development: bool,
}

#[derive(Debug)]
struct Status {
    state: BoundaryState,
    failure: Option<CaughtError>,
    remaining_retries: u32,
}

struct Shared {
    services: BoundaryServices,
    status: Mutex<Status>,
}

impl Shared {
    fn status(&self) -> MutexGuard<'_, Status> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn reset_loop(&self, on_reset: Option<ResetCallback>) -> ResetOutcome {
        let max_retries = self.services.config.max_retries;
        let t = &self.services.translator;

        loop {
            let result = match &on_reset {
                Some(callback) => callback().await,
                None => Ok(()),
            };

            let err = match result {
                Ok(()) => {
                    {
                        let mut status = self.status();
                        status.state = BoundaryState::Healthy;
                        status.failure = None;
                        status.remaining_retries = max_retries;
                    }
                    info!("Error boundary recovered");
                    self.services.notifier.show(
                        Toast::success(t.t("error.boundary.resetSuccess"))
                            .with_description(t.t("error.boundary.componentRestored")),
                    );
                    return ResetOutcome::Recovered;
                }
                Err(err) => err,
            };

            let remaining = {
                let mut status = self.status();
                status.remaining_retries = status.remaining_retries.saturating_sub(1);
                if status.remaining_retries == 0 {
                    status.state = BoundaryState::Failed;
                }
                status.remaining_retries
            };

            if remaining == 0 {
                error!(error = %err, "Max retry attempts reached");
                let reported = ReportedError::from_anyhow(&err);
                self.services.crash_reporter.capture(
                    CrashReport::new(reported.message, reported.name)
                        .tag("action", "reset")
                        .extra("remainingRetries", 0),
                );
                self.services.notifier.show(
                    Toast::error(t.t("error.boundary.resetFailed"))
                        .with_description(t.t("error.boundary.maxRetries")),
                );
                return ResetOutcome::Exhausted;
            }

            warn!(
                error = %err,
                "Retry attempt {} failed",
                max_retries.saturating_sub(remaining)
            );
            tokio::time::sleep(self.services.config.retry_delay()).await;
        }
    }
}

pub struct ErrorBoundary<C: Component> {
    child: C,
    fallback: Option<C::Output>,
    on_reset: Option<ResetCallback>,
    shared: Arc<Shared>,
    retry_task: TaskSlot,
}

impl<C: Component> ErrorBoundary<C> {
    pub fn new(child: C, services: BoundaryServices) -> Self {
        let remaining_retries = services.config.max_retries;
        Self {
            child,
            fallback: None,
            on_reset: None,
            shared: Arc::new(Shared {
                services,
                status: Mutex::new(Status {
                    state: BoundaryState::Healthy,
                    failure: None,
                    remaining_retries,
                }),
            }),
            retry_task: TaskSlot::new(),
        }
    }

    /// Render this instead of the built-in panel once failed.
    pub fn with_fallback(mut self, fallback: C::Output) -> Self {
        self.fallback = Some(fallback);
        self
    }

    pub fn with_reset(mut self, on_reset: ResetCallback) -> Self {
        self.on_reset = Some(on_reset);
        self
    }

    pub fn state(&self) -> BoundaryState {
        self.shared.status().state
    }

    pub fn is_resetting(&self) -> bool {
        self.state() == BoundaryState::Resetting
    }

    pub fn remaining_retries(&self) -> u32 {
        self.shared.status().remaining_retries
    }

    pub fn failure(&self) -> Option<CaughtError> {
        self.shared.status().failure.clone()
    }

    fn component_stack(&self) -> String {
        format!("at {}\nat ErrorBoundary", self.child.name())
    }

    async fn capture(&self, error: ReportedError) {
        let services = &self.shared.services;
        let caught = CaughtError {
            error,
            component_stack: self.component_stack(),
        };

        {
            let mut status = self.shared.status();
            status.state = BoundaryState::Failed;
            status.failure = Some(caught.clone());
        }

        if services.development {
            error!(
                component = self.child.name(),
                error = %caught.error.message,
                "Error caught by ErrorBoundary"
            );
        }

        let mut context = Map::new();
        context.insert(
            "stack".to_string(),
            caught.error.stack.clone().map_or(Value::Null, Value::String),
        );
        context.insert(
            "componentStack".to_string(),
            Value::String(caught.component_stack.clone()),
        );
        services.crash_reporter.capture(
            CrashReport::new(caught.error.message.clone(), caught.error.name.clone())
                .tag("component", "ErrorBoundary")
                .extra("componentStack", caught.component_stack.clone())
                .context("error", context),
        );

        let t = &services.translator;
        services.notifier.show(
            Toast::error(t.t("error.boundary.title"))
                .with_description(t.translate(
                    "error.boundary.description",
                    &[("error", caught.error.message.clone())],
                ))
                .with_duration(ToastDuration::Seconds(services.config.notification_secs)),
        );

        if let Some(logger) = &services.logger {
            logger
                .log_error(
                    LogEntry::error(ErrorCategory::Ui, "Layout error boundary caught error")
                        .with_error(caught.error)
                        .with_metadata("componentStack", caught.component_stack),
                )
                .await;
        }
    }

    fn panel(&self, failure: Option<&CaughtError>, remaining_retries: u32) -> ErrorPanel {
        let services = &self.shared.services;
        let t = &services.translator;
        let action = |kind, key: &str| PanelAction {
            kind,
            label: t.t(key),
        };

        let mut actions = Vec::with_capacity(4);
        if remaining_retries > 0 {
            actions.push(action(PanelActionKind::Retry, "error.boundary.retry"));
        }
        actions.push(action(PanelActionKind::Reload, "error.boundary.reload"));
        actions.push(action(PanelActionKind::Home, "error.boundary.home"));
        actions.push(action(PanelActionKind::Back, "error.boundary.back"));

        let details = failure
            .filter(|_| services.development)
            .map(|caught| ErrorDetails {
                heading: t.t("error.boundary.errorDetails"),
                message: caught.error.message.clone(),
                stack_heading: t.t("error.boundary.stackTrace"),
                stack: caught.error.stack.clone(),
                component_stack_heading: t.t("error.boundary.componentStack"),
                component_stack: caught.component_stack.clone(),
            });

        ErrorPanel {
            title: t.t("error.boundary.title"),
            subtitle: t.t("error.boundary.subtitle"),
            actions,
            details,
        }
    }

    /// Start the bounded reset loop. Returns `None` (and does nothing) unless
    /// the boundary is failed with retry budget left.
    pub fn handle_reset(&self) -> Option<JoinHandle<ResetOutcome>> {
        {
            let mut status = self.shared.status();
            if status.state != BoundaryState::Failed || status.remaining_retries == 0 {
                debug!(state = %status.state, "Ignoring reset request");
                return None;
            }
            status.state = BoundaryState::Resetting;
        }

        let shared = self.shared.clone();
        let on_reset = self.on_reset.clone();
        Some(
            self.retry_task
                .replace(async move { shared.reset_loop(on_reset).await }),
        )
    }

    pub fn reload(&self) -> Navigation {
        Navigation::Reload
    }

    pub fn go_home(&self) -> Navigation {
        Navigation::Home("/".to_string())
    }

    pub fn go_back(&self) -> Navigation {
        Navigation::Back
    }

    /// Cancel any pending retry and clear every notification on screen.
    pub fn unmount(self) {
        drop(self);
    }
}

impl<C> ErrorBoundary<C>
where
    C: Component,
    C::Output: Clone,
{
    pub async fn render(&self) -> View<C::Output> {
        let (state, failure, remaining) = {
            let status = self.shared.status();
            (status.state, status.failure.clone(), status.remaining_retries)
        };

        match state {
            BoundaryState::Resetting => View::Loading,
            BoundaryState::Failed => self.failed_view(failure.as_ref(), remaining),
            BoundaryState::Healthy => {
                let caught = match catch_unwind(AssertUnwindSafe(|| self.child.render())) {
                    Ok(Ok(output)) => return View::Content(output),
                    Ok(Err(e)) => ReportedError::from_anyhow(&e),
                    Err(payload) => ReportedError::named("Panic", panic_message(payload.as_ref())),
                };
                self.capture(caught).await;
                let failure = self.failure();
                self.failed_view(failure.as_ref(), self.remaining_retries())
            }
        }
    }

    fn failed_view(&self, failure: Option<&CaughtError>, remaining: u32) -> View<C::Output> {
        match &self.fallback {
            Some(fallback) => View::Fallback(fallback.clone()),
            None => View::Panel(self.panel(failure, remaining)),
        }
    }
}

impl<C: Component> Drop for ErrorBoundary<C> {
    fn drop(&mut self) {
        self.retry_task.cancel();
        self.shared.services.notifier.dismiss_all();
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "component panicked".to_string()
    }
}
