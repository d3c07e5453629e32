//! Top-level application shell: owns the global registrations (keyboard
//! shortcuts, error-stream counting, route-error handling) and tears them down
//! in reverse order on unmount.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use db::models::error_log::ErrorCategory;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::{
    error_boundary::Navigation,
    error_logger::{ErrorLogger, LogEntry, ReportedError},
    notification::Notifier,
    scheduler::Subscriptions,
    system_reload::{ReloadOutcome, SystemReloader},
};

pub const ERROR_ROUTE: &str = "/error";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyEvent {
    pub key: String,
    pub ctrl: bool,
    pub shift: bool,
    pub alt: bool,
}

impl KeyEvent {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            ctrl: false,
            shift: false,
            alt: false,
        }
    }

    pub fn with_ctrl(mut self) -> Self {
        self.ctrl = true;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShortcutAction {
    SoftReload,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Shortcut {
    key: &'static str,
    ctrl: bool,
    action: ShortcutAction,
}

impl Shortcut {
    fn matches(&self, event: &KeyEvent) -> bool {
        event.key == self.key && event.ctrl == self.ctrl
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyHandling {
    /// The shell acted on the key; the host's default action must not run.
    PreventDefault(ShortcutAction),
    Ignored,
}

pub struct AppShell {
    reloader: Arc<SystemReloader>,
    logger: Arc<ErrorLogger>,
    shortcuts: Vec<Shortcut>,
    shortcuts_active: Arc<AtomicBool>,
    route_errors_active: Arc<AtomicBool>,
    subscriptions: Subscriptions,
}

impl AppShell {
    /// Register every global handler. Teardown runs in reverse of this order.
    pub fn mount(
        reloader: Arc<SystemReloader>,
        logger: Arc<ErrorLogger>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let mut subscriptions = Subscriptions::new();
        let shortcuts_active = Arc::new(AtomicBool::new(true));
        let route_errors_active = Arc::new(AtomicBool::new(true));

        subscriptions.register("notifications", move || notifier.dismiss_all());
        {
            let reloader = reloader.clone();
            subscriptions.register("reload-chain", move || reloader.cancel());
        }
        {
            let active = shortcuts_active.clone();
            subscriptions.register("keyboard-shortcuts", move || active.store(false, Ordering::SeqCst));
        }
        subscriptions.register_task("error-counter-reset", reloader.spawn_counter_reset());
        subscriptions.register_task("error-stream", reloader.watch_errors());
        {
            let active = route_errors_active.clone();
            subscriptions.register("unhandled-rejection", move || active.store(false, Ordering::SeqCst));
        }

        info!(registrations = subscriptions.len(), "Application shell mounted");

        Self {
            reloader,
            logger,
            shortcuts: vec![Shortcut {
                key: "r",
                ctrl: true,
                action: ShortcutAction::SoftReload,
            }],
            shortcuts_active,
            route_errors_active,
            subscriptions,
        }
    }

    pub fn registrations(&self) -> Vec<&'static str> {
        self.subscriptions.names()
    }

    pub fn reloader(&self) -> &Arc<SystemReloader> {
        &self.reloader
    }

    pub fn handle_key(&self, event: &KeyEvent) -> KeyHandling {
        if !self.shortcuts_active.load(Ordering::SeqCst) {
            return KeyHandling::Ignored;
        }
        let Some(shortcut) = self.shortcuts.iter().find(|s| s.matches(event)) else {
            return KeyHandling::Ignored;
        };

        match shortcut.action {
            ShortcutAction::SoftReload => {
                debug!("Reload shortcut pressed");
                self.reloader.reload_systems(0);
            }
        }
        KeyHandling::PreventDefault(shortcut.action)
    }

    /// The reload button.
    pub fn reload(&self) -> JoinHandle<ReloadOutcome> {
        self.reloader.reload_systems(0)
    }

    pub fn reload_button_label(&self) -> String {
        self.reloader.button_label()
    }

    /// Record an unhandled async failure on `path` and send the user to the
    /// error route. `None` once the shell has been unmounted.
    pub async fn handle_unhandled_rejection(
        &self,
        error: ReportedError,
        path: &str,
    ) -> Option<Navigation> {
        if !self.route_errors_active.load(Ordering::SeqCst) {
            return None;
        }
        self.logger
            .log_error(
                LogEntry::error(ErrorCategory::Ui, "Route transition failed")
                    .with_error(error)
                    .with_metadata("path", path),
            )
            .await;
        Some(Navigation::To(ERROR_ROUTE.to_string()))
    }

    /// Remove every registration; the shell stops reacting to keys and errors.
    pub fn teardown(&mut self) {
        if self.subscriptions.is_empty() {
            return;
        }
        self.subscriptions.teardown_all();
        info!("Application shell unmounted");
    }

    pub fn unmount(mut self) {
        self.teardown();
    }
}
