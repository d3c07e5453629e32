//! User-facing toast notifications.

use serde::{Deserialize, Serialize};
use strum_macros::Display;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use ts_rs::TS;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, TS, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ToastLevel {
    Success,
    Info,
    Warning,
    Error,
}

/// How long a toast stays on screen
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, TS)]
#[serde(tag = "kind", content = "seconds", rename_all = "lowercase")]
pub enum ToastDuration {
    Seconds(f32),
    /// Stays until dismissed by the user
    Persistent,
}

impl ToastDuration {
    pub const DEFAULT: Self = Self::Seconds(4.5);
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, TS)]
pub struct Toast {
    pub level: ToastLevel,
    pub title: String,
    pub description: Option<String>,
    pub duration: ToastDuration,
}

impl Toast {
    pub fn new(level: ToastLevel, title: impl Into<String>) -> Self {
        Self {
            level,
            title: title.into(),
            description: None,
            duration: ToastDuration::DEFAULT,
        }
    }

    pub fn success(title: impl Into<String>) -> Self {
        Self::new(ToastLevel::Success, title)
    }

    pub fn warning(title: impl Into<String>) -> Self {
        Self::new(ToastLevel::Warning, title)
    }

    pub fn error(title: impl Into<String>) -> Self {
        Self::new(ToastLevel::Error, title)
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_duration(mut self, duration: ToastDuration) -> Self {
        self.duration = duration;
        self
    }

    pub fn persistent(self) -> Self {
        self.with_duration(ToastDuration::Persistent)
    }

    pub fn is_persistent(&self) -> bool {
        self.duration == ToastDuration::Persistent
    }
}

/// Presentation-only sink for toasts
pub trait Notifier: Send + Sync {
    fn show(&self, toast: Toast);

    /// Remove every toast currently on screen.
    fn dismiss_all(&self);
}

/// What connected front ends receive
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, TS)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NotificationEvent {
    Show(Toast),
    DismissAll,
}

/// Fans toasts out to every subscriber and mirrors them into the trace log
#[derive(Debug, Clone)]
pub struct NotificationService {
    sender: broadcast::Sender<NotificationEvent>,
}

impl Default for NotificationService {
    fn default() -> Self {
        Self::new(256)
    }
}

impl NotificationService {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NotificationEvent> {
        self.sender.subscribe()
    }

    fn publish(&self, event: NotificationEvent) {
        // No subscribers just means nobody is looking.
        if self.sender.send(event).is_err() {
            debug!("Notification dropped: no subscribers");
        }
    }
}

impl Notifier for NotificationService {
    fn show(&self, toast: Toast) {
        let description = toast.description.as_deref().unwrap_or("");
        match toast.level {
            ToastLevel::Error => error!(title = %toast.title, description, "Notification"),
            ToastLevel::Warning => warn!(title = %toast.title, description, "Notification"),
            ToastLevel::Success | ToastLevel::Info => {
                info!(title = %toast.title, description, "Notification")
            }
        }
        self.publish(NotificationEvent::Show(toast));
    }

    fn dismiss_all(&self) {
        self.publish(NotificationEvent::DismissAll);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscribers_receive_toasts_and_dismissals() {
        let service = NotificationService::default();
        let mut rx = service.subscribe();

        service.show(Toast::error("API Error").with_description("boom").persistent());
        service.dismiss_all();

        match rx.try_recv().unwrap() {
            NotificationEvent::Show(toast) => {
                assert_eq!(toast.level, ToastLevel::Error);
                assert!(toast.is_persistent());
                assert_eq!(toast.description.as_deref(), Some("boom"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(rx.try_recv().unwrap(), NotificationEvent::DismissAll);
    }

    #[test]
    fn publishing_without_subscribers_is_harmless() {
        let service = NotificationService::default();
        service.show(Toast::success("done"));
        service.dismiss_all();
    }
}
