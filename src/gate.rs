/// Permission gate for side-effecting capabilities.
///
/// Every side-effecting call is confirmed interactively before it runs. Any
/// failure to get an answer is a denial.
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use serde_json::Value;

use crate::capability::{Capability, Outcome, Params};
use crate::events::{ActionEvent, EventLog};
use crate::render::{ConfirmAnswer, LOG_PREFIX, Renderer};

/// Reported in place of an answer when the user could not be asked.
pub const NO_ANSWER: &str = "no answer (input closed)";

pub struct PermissionGate {
    events: EventLog,
    trusted: Mutex<HashSet<String>>,
    prompt_lock: tokio::sync::Mutex<()>,
}

impl PermissionGate {
    pub fn new(events: EventLog) -> Self {
        Self {
            events,
            trusted: Mutex::new(HashSet::new()),
            prompt_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn events(&self) -> &EventLog {
        &self.events
    }

    pub fn is_trusted(&self, capability: &str) -> bool {
        self.trusted
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(capability)
    }

    fn trust(&self, capability: &str) {
        self.trusted
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(capability.to_string());
    }

    /// Ask the interactive collaborator. Prompts are serialized so concurrent
    /// workers never interleave dialogs.
    async fn ask(&self, description: &str) -> Option<ConfirmAnswer> {
        let _guard = self.prompt_lock.lock().await;
        let renderer: Arc<dyn Renderer> = Arc::clone(self.events.renderer());
        let description = description.to_string();
        match tokio::task::spawn_blocking(move || renderer.confirm(&description)).await {
            Ok(answer) => answer,
            Err(err) => {
                tracing::warn!(error = %err, "confirmation prompt task failed");
                None
            }
        }
    }

    /// Free-form question to the user. Shares the prompt lock with
    /// confirmations. `None` means no answer could be read.
    pub async fn ask_user(&self, question: &str) -> Option<String> {
        let _guard = self.prompt_lock.lock().await;
        let renderer: Arc<dyn Renderer> = Arc::clone(self.events.renderer());
        let question = question.to_string();
        match tokio::task::spawn_blocking(move || renderer.ask_user(&question)).await {
            Ok(answer) => answer,
            Err(err) => {
                tracing::warn!(error = %err, "user prompt task failed");
                None
            }
        }
    }

    /// Yes/no confirmation. No answer means no.
    pub async fn confirm(&self, description: &str) -> bool {
        let allowed = self
            .ask(description)
            .await
            .is_some_and(ConfirmAnswer::allows);
        tracing::debug!(allowed, "permission gate answered");
        allowed
    }

    /// Run a capability, confirming first when it is side-effecting.
    pub async fn invoke(&self, capability: &dyn Capability, params: &Params) -> Outcome {
        let name = capability.name();

        if capability.side_effecting() {
            if self.is_trusted(name) {
                self.events.render(&format!(
                    "{LOG_PREFIX} {name} is trusted for this run; skipping confirmation."
                ));
            } else {
                if let Some(preview) = capability.preview(params) {
                    self.events.render(&preview);
                }
                let description = capability.describe_action(params);
                match self.ask(&description).await {
                    Some(ConfirmAnswer::Trust) => self.trust(name),
                    Some(ConfirmAnswer::Yes) => {}
                    Some(ConfirmAnswer::No) | None => {
                        let outcome = Outcome::Denied(format!(
                            "write permission denied for '{name}'; the action did not run."
                        ));
                        self.record(name, params, &outcome, "write permission denied");
                        return outcome;
                    }
                }
            }
        }

        let outcome = match capability.invoke(params).await {
            Ok(output) => Outcome::Success(output),
            Err(err) => Outcome::Error(format!("[{}] {}", err.code, err.message)),
        };
        let detail = match &outcome {
            Outcome::Success(_) => format!("{name} completed successfully"),
            other => other.text().to_string(),
        };
        self.record(name, params, &outcome, &detail);
        outcome
    }

    fn record(&self, name: &str, params: &Params, outcome: &Outcome, detail: &str) {
        self.events.record(
            &ActionEvent::new(
                name,
                outcome.event_outcome(),
                Value::Object(params.clone()),
            )
            .with_detail(detail),
        );
    }
}
