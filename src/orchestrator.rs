/// Top-level control loop.
///
/// The orchestrator owns the plan, asks the decision engine for one
/// directive per turn and folds every result, success or failure, back into
/// the transcript for the next decision.
use std::collections::HashSet;

use serde::Serialize;
use serde_json::{Value, json};
use tokio::task::JoinSet;

use crate::capability::Params;
use crate::dispatcher::{Completion, SPAWN_ACTION, WorkerDispatcher, WorkerReport, WorkerSpec};
use crate::engine::{Decision, DecisionRequest, TranscriptEntry};
use crate::error::{KernelError, KernelResult};
use crate::events::{ActionEvent, EventLog, EventOutcome};
use crate::gate::NO_ANSWER;
use crate::plan::{PLAN_ACTION, PlanTracker};

pub const ORCHESTRATOR_AGENT: &str = "orchestrator";
pub const ASK_USER_DIRECTIVE: &str = "ask_user";
pub const SPAWN_MANY_DIRECTIVE: &str = "spawn_workers";
pub const DIRECTIVE_NAMES: &[&str] = &[
    ASK_USER_DIRECTIVE,
    PLAN_ACTION,
    SPAWN_ACTION,
    SPAWN_MANY_DIRECTIVE,
];

/// One worker dispatch as requested by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnRequest {
    pub spec: WorkerSpec,
    pub task: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Directive {
    /// Raw `plan_manager` parameters; parsed by the tracker so that parse
    /// failures are logged as plan events.
    Plan(Value),
    Spawn(SpawnRequest),
    SpawnMany(Vec<SpawnRequest>),
    AskUser { question: String },
}

fn string_field(params: &Params, key: &str) -> Option<String> {
    params
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

fn capability_names(params: &Params) -> KernelResult<Vec<String>> {
    let raw = params.get("capabilities").or_else(|| params.get("tools"));
    match raw {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| {
                item.as_str()
                    .map(|name| name.trim().to_string())
                    .ok_or_else(|| KernelError::validation("capability names must be strings"))
            })
            .collect(),
        Some(Value::String(list)) => Ok(list
            .split(|c: char| c == ',' || c.is_whitespace())
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .collect()),
        Some(_) => Err(KernelError::validation(
            "capabilities must be a list of capability names",
        )),
    }
}

fn turn_budget(params: &Params) -> KernelResult<i64> {
    let raw = params.get("max_turns").or_else(|| params.get("turn_budget"));
    match raw {
        None | Some(Value::Null) => Err(KernelError::validation(
            "max_turns is required for spawn_worker",
        )),
        Some(Value::Number(number)) => number
            .as_i64()
            .ok_or_else(|| KernelError::validation("max_turns must be an integer")),
        Some(Value::String(text)) => text
            .trim()
            .parse::<i64>()
            .map_err(|_| KernelError::validation("max_turns must be an integer")),
        Some(_) => Err(KernelError::validation("max_turns must be an integer")),
    }
}

impl SpawnRequest {
    /// Parse `{name, instructions, task, capabilities|tools, max_turns}`.
    pub fn from_params(params: &Params) -> KernelResult<Self> {
        let name = string_field(params, "name")
            .ok_or_else(|| KernelError::validation("spawn_worker requires a non-empty 'name'"))?;
        let task = string_field(params, "task")
            .ok_or_else(|| KernelError::validation("spawn_worker requires a non-empty 'task'"))?;
        Ok(Self {
            spec: WorkerSpec {
                name,
                instructions: string_field(params, "instructions").unwrap_or_default(),
                capabilities: capability_names(params)?,
                turn_budget: turn_budget(params)?,
            },
            task,
        })
    }
}

impl Directive {
    pub fn parse(name: &str, params: Params) -> KernelResult<Self> {
        match name {
            PLAN_ACTION => Ok(Directive::Plan(Value::Object(params))),
            SPAWN_ACTION => SpawnRequest::from_params(&params).map(Directive::Spawn),
            SPAWN_MANY_DIRECTIVE => {
                let Some(workers) = params.get("workers").and_then(Value::as_array) else {
                    return Err(KernelError::validation(
                        "spawn_workers requires a 'workers' list",
                    ));
                };
                if workers.is_empty() {
                    return Err(KernelError::validation(
                        "spawn_workers requires at least one worker",
                    ));
                }
                workers
                    .iter()
                    .enumerate()
                    .map(|(index, worker)| {
                        let fields = worker.as_object().ok_or_else(|| {
                            KernelError::validation(format!("workers[{index}] must be an object"))
                        })?;
                        SpawnRequest::from_params(fields).map_err(|err| {
                            KernelError::validation(format!("workers[{index}]: {err}"))
                        })
                    })
                    .collect::<KernelResult<Vec<SpawnRequest>>>()
                    .map(Directive::SpawnMany)
            }
            ASK_USER_DIRECTIVE => string_field(&params, "question")
                .map(|question| Directive::AskUser { question })
                .ok_or_else(|| KernelError::validation("ask_user requires a non-empty 'question'")),
            other => Err(KernelError::validation(format!(
                "unknown directive '{other}'. Available directives: {}",
                DIRECTIVE_NAMES.join(", ")
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub final_text: String,
    pub completion: Completion,
    pub turns_used: u32,
    pub plan: String,
}

pub fn default_instructions(capabilities: &[String]) -> String {
    [
        "You are the orchestrator for a team of capability-restricted workers.".to_string(),
        "- Understand the goal, gather context, and structure the work before delegating.".to_string(),
        "- Keep a plan with `plan_manager` (add, update with a reason, remove, reset, show).".to_string(),
        "- Delegate focused sub-tasks with `spawn_worker` (name, instructions, task, capabilities, max_turns), or `spawn_workers` for independent sub-tasks.".to_string(),
        format!(
            "- Grant each worker only the capabilities it needs. Available capabilities: {}.",
            capabilities.join(", ")
        ),
        "- Use `ask_user` when information is missing.".to_string(),
        "- Finish with a final answer that integrates worker results and names open risks.".to_string(),
    ]
    .join("\n")
}

pub struct Orchestrator {
    plan: PlanTracker,
    dispatcher: WorkerDispatcher,
    events: EventLog,
    instructions: String,
    max_turns: u32,
    rejected: HashSet<WorkerSpec>,
}

impl Orchestrator {
    pub fn new(dispatcher: WorkerDispatcher, max_turns: u32) -> Self {
        let events = dispatcher.gate().events().clone();
        let instructions = default_instructions(&dispatcher.registry().names());
        Self {
            plan: PlanTracker::new(events.clone()),
            dispatcher,
            events,
            instructions,
            max_turns,
            rejected: HashSet::new(),
        }
    }

    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = instructions.into();
        self
    }

    pub fn plan(&self) -> &PlanTracker {
        &self.plan
    }

    pub async fn run(&mut self, task: &str) -> KernelResult<RunReport> {
        if self.max_turns == 0 {
            return Err(KernelError::validation(
                "max_turns must be a positive integer",
            ));
        }

        let mut transcript = Vec::<TranscriptEntry>::new();
        let mut partial = Vec::<String>::new();
        let allowed = DIRECTIVE_NAMES
            .iter()
            .map(|name| name.to_string())
            .collect::<Vec<String>>();

        for turn in 1..=self.max_turns {
            let request = DecisionRequest {
                agent: ORCHESTRATOR_AGENT.to_string(),
                instructions: self.instructions.clone(),
                task: task.to_string(),
                transcript: transcript.clone(),
                allowed_capabilities: allowed.clone(),
                turn,
                turn_budget: self.max_turns,
            };
            tracing::debug!(turn, "orchestrator deciding");
            let decision = match self.dispatcher.engine().decide(&request).await {
                Ok(decision) => decision,
                Err(err) => {
                    let err = KernelError::Engine(err.message);
                    self.record(EventOutcome::Error, json!({"turn": turn}), err.to_string());
                    return Err(err);
                }
            };

            match decision {
                Decision::Final { text } => {
                    self.record(
                        EventOutcome::Success,
                        json!({"turn": turn}),
                        format!("run finished in {turn} turn(s)"),
                    );
                    return Ok(RunReport {
                        final_text: text,
                        completion: Completion::Finished,
                        turns_used: turn,
                        plan: self.plan.render(),
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
                    let entry = self.execute(&capability, parameters).await;
                    transcript.push(entry);
                }
            }
        }

        self.record(
            EventOutcome::Exhausted,
            json!({"max_turns": self.max_turns}),
            format!(
                "orchestrator exhausted its budget of {} turn(s); returning partial output",
                self.max_turns
            ),
        );
        Ok(RunReport {
            final_text: partial.join("\n"),
            completion: Completion::BudgetExhausted,
            turns_used: self.max_turns,
            plan: self.plan.render(),
        })
    }

    /// Run one directive. Failures come back as text for the next decision;
    /// a user's answer comes back as a user entry.
    async fn execute(&mut self, name: &str, params: Params) -> TranscriptEntry {
        let raw = Value::Object(params.clone());
        let directive = match Directive::parse(name, params) {
            Ok(directive) => directive,
            Err(err) => {
                tracing::warn!(
                    directive = name,
                    kind = err.kind(),
                    error = %err,
                    "directive rejected"
                );
                // Plan parse failures are logged by the tracker itself.
                if name != PLAN_ACTION {
                    self.events.record(
                        &ActionEvent::new(name, EventOutcome::Error, raw)
                            .with_detail(err.to_string()),
                    );
                }
                return TranscriptEntry::capability(name, format!("ERROR: {err}"));
            }
        };

        let text = match directive {
            Directive::Plan(params) => match self.plan.apply_params(&params) {
                Ok(text) => text,
                Err(err) => format!("ERROR: {err}"),
            },
            Directive::Spawn(request) => self.spawn_one(request).await,
            Directive::SpawnMany(requests) => self.spawn_many(requests).await,
            Directive::AskUser { question } => return self.ask_user(&question, raw).await,
        };
        TranscriptEntry::capability(name, text)
    }

    async fn ask_user(&self, question: &str, raw: Value) -> TranscriptEntry {
        let answer = self.dispatcher.gate().ask_user(question).await;
        let detail = if answer.is_some() {
            "user answered"
        } else {
            "no answer available"
        };
        self.events.record(
            &ActionEvent::new(ASK_USER_DIRECTIVE, EventOutcome::Success, raw).with_detail(detail),
        );
        match answer {
            Some(answer) => TranscriptEntry::user(answer),
            None => TranscriptEntry::capability(ASK_USER_DIRECTIVE, NO_ANSWER),
        }
    }

    fn refusal(&self, spec: &WorkerSpec) -> Option<String> {
        if !self.rejected.contains(spec) {
            return None;
        }
        let text = format!(
            "ERROR: refusing to dispatch worker '{}' again: an identical request was already rejected for unknown capabilities. Available capabilities: {}",
            spec.name,
            self.dispatcher.registry().names().join(", ")
        );
        self.events.record(
            &ActionEvent::new(
                SPAWN_ACTION,
                EventOutcome::Error,
                json!({"name": spec.name, "capabilities": spec.capabilities}),
            )
            .with_detail("identical request already rejected"),
        );
        Some(text)
    }

    fn fold(&mut self, spec: WorkerSpec, result: KernelResult<WorkerReport>) -> String {
        match result {
            Ok(report) => report.summary(),
            Err(err) => {
                tracing::warn!(
                    worker = %spec.name,
                    kind = err.kind(),
                    error = %err,
                    "worker dispatch failed"
                );
                if matches!(err, KernelError::UnknownCapability { .. }) {
                    self.rejected.insert(spec);
                }
                format!("ERROR: {err}")
            }
        }
    }

    async fn spawn_one(&mut self, request: SpawnRequest) -> String {
        if let Some(refusal) = self.refusal(&request.spec) {
            return refusal;
        }
        let result = self
            .dispatcher
            .spawn(request.spec.clone(), &request.task)
            .await;
        self.fold(request.spec, result)
    }

    /// Dispatch independent workers concurrently; results are folded back in
    /// declaration order.
    async fn spawn_many(&mut self, requests: Vec<SpawnRequest>) -> String {
        let mut slots: Vec<Option<String>> = vec![None; requests.len()];
        let mut specs: Vec<Option<WorkerSpec>> = vec![None; requests.len()];
        let mut running = JoinSet::new();

        for (index, request) in requests.into_iter().enumerate() {
            if let Some(refusal) = self.refusal(&request.spec) {
                slots[index] = Some(refusal);
                continue;
            }
            // Later duplicates in this batch must see the rejection too.
            if request.spec.turn_budget > 0
                && self
                    .dispatcher
                    .registry()
                    .resolve(&request.spec.capabilities)
                    .is_err()
            {
                self.rejected.insert(request.spec.clone());
            }
            specs[index] = Some(request.spec.clone());
            let dispatcher = self.dispatcher.clone();
            running.spawn(async move {
                let result = dispatcher.spawn(request.spec, &request.task).await;
                (index, result)
            });
        }

        while let Some(joined) = running.join_next().await {
            match joined {
                Ok((index, result)) => {
                    if let Some(spec) = specs[index].take() {
                        slots[index] = Some(self.fold(spec, result));
                    }
                }
                Err(err) => tracing::error!(error = %err, "worker task failed to complete"),
            }
        }

        slots
            .into_iter()
            .enumerate()
            .map(|(index, slot)| {
                let text = slot.unwrap_or_else(|| "ERROR: worker task failed to complete".to_string());
                format!("[{}] {text}", index + 1)
            })
            .collect::<Vec<String>>()
            .join("\n\n")
    }

    fn record(&self, outcome: EventOutcome, params: Value, detail: String) {
        self.events
            .record(&ActionEvent::new(ORCHESTRATOR_AGENT, outcome, params).with_detail(detail));
    }
}
