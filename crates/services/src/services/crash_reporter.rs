//! Crash reporting seam. Production uses Sentry; reporting is fire-and-forget.

use serde_json::{Map, Value};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CrashReport {
    pub message: String,
    pub error_type: String,
    pub tags: Vec<(String, String)>,
    pub extras: Map<String, Value>,
    pub context: Option<(String, Map<String, Value>)>,
}

impl CrashReport {
    pub fn new(message: impl Into<String>, error_type: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            error_type: error_type.into(),
            ..Default::default()
        }
    }

    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.push((key.into(), value.into()));
        self
    }

    pub fn extra(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extras.insert(key.into(), value.into());
        self
    }

    pub fn context(mut self, name: impl Into<String>, values: Map<String, Value>) -> Self {
        self.context = Some((name.into(), values));
        self
    }

    pub fn tag_value(&self, key: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

pub trait CrashReporter: Send + Sync {
    fn capture(&self, report: CrashReport);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SentryCrashReporter;

impl CrashReporter for SentryCrashReporter {
    fn capture(&self, report: CrashReport) {
        let CrashReport {
            message,
            error_type,
            tags,
            extras,
            context,
        } = report;

        sentry::with_scope(
            |scope| {
                scope.set_level(Some(sentry::Level::Error));
                scope.set_tag("errorType", &error_type);
                for (key, value) in &tags {
                    scope.set_tag(key, value);
                }
                for (key, value) in extras {
                    scope.set_extra(&key, value);
                }
                if let Some((name, values)) = context {
                    scope.set_context(&name, sentry::protocol::Context::Other(values.into_iter().collect()));
                }
            },
            || sentry::capture_message(&message, sentry::Level::Error),
        );
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn builder_collects_tags_and_extras() {
        let report = CrashReport::new("boom", "RenderError")
            .tag("component", "ErrorBoundary")
            .extra("remainingRetries", 0)
            .context("error", Map::from_iter([("stack".to_string(), json!("at x"))]));

        assert_eq!(report.tag_value("component"), Some("ErrorBoundary"));
        assert_eq!(report.extras["remainingRetries"], 0);
        assert_eq!(report.context.unwrap().0, "error");
    }

    #[test]
    fn sentry_capture_without_client_is_a_no_op() {
        SentryCrashReporter.capture(CrashReport::new("boom", "Test").tag("action", "reset"));
    }
}
