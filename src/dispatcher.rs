/// Sub-worker dispatch.
///
/// A worker is an engine-driven loop bound to a resolved `CapabilitySet` and
/// a turn budget. It never sees the plan and cannot reach capabilities
/// outside its set.
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::capability::{CapabilityRegistry, CapabilitySet, InvocationRecord, Outcome};
use crate::engine::{Decision, DecisionEngine, DecisionRequest, TranscriptEntry};
use crate::error::{KernelError, KernelResult};
use crate::events::{ActionEvent, EventLog, EventOutcome};
use crate::gate::PermissionGate;
use crate::render::LOG_PREFIX;

pub const SPAWN_ACTION: &str = "spawn_worker";

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkerSpec {
    pub name: String,
    pub instructions: String,
    pub capabilities: Vec<String>,
    /// Signed so that zero and negative budgets can be rejected with a
    /// validation error instead of failing to parse.
    pub turn_budget: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Completion {
    Finished,
    BudgetExhausted,
}

impl Completion {
    pub fn label(self) -> &'static str {
        match self {
            Completion::Finished => "finished",
            Completion::BudgetExhausted => "budget_exhausted",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerReport {
    pub name: String,
    pub output: String,
    pub completion: Completion,
    pub turns_used: u32,
    pub invocations: Vec<InvocationRecord>,
}

impl WorkerReport {
    /// Text folded back into the orchestrator's context.
    pub fn summary(&self) -> String {
        let output = if self.output.trim().is_empty() {
            "(no output)"
        } else {
            self.output.as_str()
        };
        match self.completion {
            Completion::Finished => format!(
                "worker '{}' finished in {} turn(s):\n{}",
                self.name, self.turns_used, output
            ),
            Completion::BudgetExhausted => format!(
                "worker '{}' exhausted its budget of {} turn(s); partial output:\n{}",
                self.name, self.turns_used, output
            ),
        }
    }
}

/// Transcript text for one invocation outcome.
pub fn outcome_transcript(outcome: &Outcome) -> String {
    match outcome {
        Outcome::Success(text) => text.clone(),
        Outcome::Denied(text) => format!("DENIED: {text}"),
        Outcome::Error(text) => format!("ERROR: {text}"),
    }
}

/// Shared, read-only dispatch state. Cloning is cheap, so concurrent
/// dispatches each hold their own handle.
#[derive(Clone)]
pub struct WorkerDispatcher {
    registry: Arc<CapabilityRegistry>,
    engine: Arc<dyn DecisionEngine>,
    gate: Arc<PermissionGate>,
    events: EventLog,
}

impl WorkerDispatcher {
    pub fn new(
        registry: Arc<CapabilityRegistry>,
        engine: Arc<dyn DecisionEngine>,
        gate: Arc<PermissionGate>,
    ) -> Self {
        let events = gate.events().clone();
        Self {
            registry,
            engine,
            gate,
            events,
        }
    }

    pub fn registry(&self) -> &CapabilityRegistry {
        &self.registry
    }

    pub fn engine(&self) -> &Arc<dyn DecisionEngine> {
        &self.engine
    }

    pub fn gate(&self) -> &Arc<PermissionGate> {
        &self.gate
    }

    pub async fn spawn(&self, spec: WorkerSpec, task: &str) -> KernelResult<WorkerReport> {
        let event_params = json!({
            "name": spec.name,
            "capabilities": spec.capabilities,
            "turn_budget": spec.turn_budget,
        });

        let budget = match u32::try_from(spec.turn_budget) {
            Ok(budget) if budget > 0 => budget,
            _ => {
                let err = KernelError::validation(format!(
                    "turn_budget must be a positive integer, got {}",
                    spec.turn_budget
                ));
                self.record(event_params, EventOutcome::Error, err.to_string());
                return Err(err);
            }
        };

        let capabilities = match self.registry.resolve(&spec.capabilities) {
            Ok(set) => set,
            Err(err) => {
                self.record(event_params, EventOutcome::Error, err.to_string());
                return Err(err);
            }
        };

        self.events.render(&format!(
            "{LOG_PREFIX} spawning worker '{}' with capabilities: {} (budget {budget} turn(s))",
            spec.name,
            if capabilities.is_empty() {
                "none".to_string()
            } else {
                capabilities.names().join(", ")
            }
        ));
        tracing::info!(worker = %spec.name, budget, "worker spawned");

        let result = self.run_worker(&spec, &capabilities, task, budget).await;
        match &result {
            Ok(report) => {
                let (outcome, detail) = match report.completion {
                    Completion::Finished => (
                        EventOutcome::Success,
                        format!(
                            "worker '{}' finished in {} turn(s)",
                            report.name, report.turns_used
                        ),
                    ),
                    Completion::BudgetExhausted => (
                        EventOutcome::Exhausted,
                        format!(
                            "worker '{}' exhausted its turn budget of {budget}; returning partial output",
                            report.name
                        ),
                    ),
                };
                self.record(event_params, outcome, detail);
            }
            Err(err) => self.record(event_params, EventOutcome::Error, err.to_string()),
        }
        result
    }

    async fn run_worker(
        &self,
        spec: &WorkerSpec,
        capabilities: &CapabilitySet,
        task: &str,
        budget: u32,
    ) -> KernelResult<WorkerReport> {
        let mut transcript = Vec::<TranscriptEntry>::new();
        let mut partial = Vec::<String>::new();
        let mut invocations = Vec::<InvocationRecord>::new();

        for turn in 1..=budget {
            let request = DecisionRequest {
                agent: spec.name.clone(),
                instructions: spec.instructions.clone(),
                task: task.to_string(),
                transcript: transcript.clone(),
                allowed_capabilities: capabilities.names(),
                turn,
                turn_budget: budget,
            };
            let decision = self
                .engine
                .decide(&request)
                .await
                .map_err(|err| KernelError::Engine(err.message))?;

            match decision {
                Decision::Final { text } => {
                    return Ok(WorkerReport {
                        name: spec.name.clone(),
                        output: text,
                        completion: Completion::Finished,
                        turns_used: turn,
                        invocations,
                    });
                }
                Decision::Invoke {
                    capability,
                    parameters,
                    message,
                } => {
                    if let Some(message) = message.filter(|m| !m.trim().is_empty()) {
                        transcript.push(TranscriptEntry::assistant(message.clone()));
                        partial.push(message);
                    }
                    let record = capabilities.invoke(&capability, parameters, &self.gate).await;
                    transcript.push(TranscriptEntry::capability(
                        capability,
                        outcome_transcript(&record.outcome),
                    ));
                    invocations.push(record);
                }
            }
        }

        Ok(WorkerReport {
            name: spec.name.clone(),
            output: partial.join("\n"),
            completion: Completion::BudgetExhausted,
            turns_used: budget,
            invocations,
        })
    }

    fn record(&self, params: serde_json::Value, outcome: EventOutcome, detail: String) {
        self.events
            .record(&ActionEvent::new(SPAWN_ACTION, outcome, params).with_detail(detail));
    }
}
