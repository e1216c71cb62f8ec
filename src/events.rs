/// Structured action events.
///
/// Every plan mutation, capability invocation and worker dispatch produces
/// one `ActionEvent`. The event log fans it out to `tracing`, the renderer
/// and the telemetry stream.
use std::sync::Arc;

use serde::Serialize;
use serde_json::{Value, json};

use crate::render::{LOG_PREFIX, Renderer, format_params};
use crate::telemetry::TelemetrySink;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventOutcome {
    Success,
    Denied,
    Error,
    Exhausted,
}

impl EventOutcome {
    pub fn label(self) -> &'static str {
        match self {
            EventOutcome::Success => "success",
            EventOutcome::Denied => "denied",
            EventOutcome::Error => "error",
            EventOutcome::Exhausted => "exhausted",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ActionEvent {
    pub action: String,
    pub outcome: EventOutcome,
    pub params: Value,
    pub detail: Option<String>,
}

impl ActionEvent {
    pub fn new(action: impl Into<String>, outcome: EventOutcome, params: Value) -> Self {
        Self {
            action: action.into(),
            outcome,
            params,
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// Human-readable block shown on the console.
    pub fn format_display(&self) -> String {
        let mut blocks = vec![format!(
            "{LOG_PREFIX}[{}] {}",
            self.action,
            self.outcome.label().to_ascii_uppercase()
        )];
        if let Some(detail) = self.detail.as_deref().filter(|d| !d.is_empty()) {
            blocks.push(detail.to_string());
        }
        blocks.push(format!("params: {}", format_params(&self.params)));
        blocks.join("\n")
    }
}

#[derive(Clone)]
pub struct EventLog {
    renderer: Arc<dyn Renderer>,
    telemetry: TelemetrySink,
}

impl EventLog {
    pub fn new(renderer: Arc<dyn Renderer>, telemetry: TelemetrySink) -> Self {
        Self {
            renderer,
            telemetry,
        }
    }

    pub fn renderer(&self) -> &Arc<dyn Renderer> {
        &self.renderer
    }

    pub fn render(&self, text: &str) {
        self.renderer.render(text);
    }

    pub fn record(&self, event: &ActionEvent) {
        let detail = event.detail.as_deref().unwrap_or_default();
        match event.outcome {
            EventOutcome::Error => tracing::warn!(
                action = %event.action,
                outcome = event.outcome.label(),
                detail = detail,
                "action failed"
            ),
            _ => tracing::info!(
                action = %event.action,
                outcome = event.outcome.label(),
                detail = detail,
                "action completed"
            ),
        }

        self.renderer.render(&event.format_display());
        self.telemetry.emit(
            "action",
            json!({
                "action": event.action,
                "outcome": event.outcome,
                "params": event.params,
                "detail": event.detail,
            }),
        );
    }
}
