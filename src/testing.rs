//! Test doubles shared by the unit test modules.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::capability::{Capability, CapabilityError, Params};
use crate::engine::{Decision, DecisionEngine, DecisionRequest, EngineError, ScriptedEngine};
use crate::events::EventLog;
use crate::render::{ConfirmAnswer, Renderer};
use crate::telemetry::TelemetrySink;

pub fn event_log(renderer: Arc<RecordingRenderer>) -> EventLog {
    EventLog::new(renderer, TelemetrySink::disabled())
}

pub fn params(pairs: &[(&str, &str)]) -> Params {
    pairs
        .iter()
        .map(|(key, value)| (key.to_string(), json!(value)))
        .collect()
}

pub fn object(value: Value) -> Params {
    value.as_object().cloned().unwrap_or_default()
}

/// Captures rendered text and answers prompts from queues. An empty queue
/// behaves like a closed stdin.
#[derive(Default)]
pub struct RecordingRenderer {
    rendered: Mutex<Vec<String>>,
    confirmations: Mutex<VecDeque<Option<ConfirmAnswer>>>,
    answers: Mutex<VecDeque<Option<String>>>,
    confirm_calls: AtomicUsize,
}

impl RecordingRenderer {
    pub fn with_confirmations(answers: Vec<Option<ConfirmAnswer>>) -> Self {
        Self {
            confirmations: Mutex::new(answers.into()),
            ..Self::default()
        }
    }

    pub fn with_answers(self, answers: Vec<Option<String>>) -> Self {
        *self.answers.lock().unwrap() = answers.into();
        self
    }

    pub fn rendered(&self) -> Vec<String> {
        self.rendered.lock().unwrap().clone()
    }

    pub fn confirm_calls(&self) -> usize {
        self.confirm_calls.load(Ordering::SeqCst)
    }
}

impl Renderer for RecordingRenderer {
    fn render(&self, text: &str) {
        self.rendered.lock().unwrap().push(text.to_string());
    }

    fn confirm(&self, description: &str) -> Option<ConfirmAnswer> {
        self.confirm_calls.fetch_add(1, Ordering::SeqCst);
        self.render(&format!("confirm: {description}"));
        self.confirmations.lock().unwrap().pop_front().flatten()
    }

    fn ask_user(&self, question: &str) -> Option<String> {
        self.render(&format!("ask: {question}"));
        self.answers.lock().unwrap().pop_front().flatten()
    }
}

/// Capability that counts calls and returns a fixed result.
pub struct StubCapability {
    name: String,
    side_effecting: bool,
    failure: Option<String>,
    calls: Arc<AtomicUsize>,
}

impl StubCapability {
    pub fn read_only(name: &str) -> Self {
        Self {
            name: name.to_string(),
            side_effecting: false,
            failure: None,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn side_effecting(name: &str) -> Self {
        Self {
            side_effecting: true,
            ..Self::read_only(name)
        }
    }

    pub fn failing(mut self, message: &str) -> Self {
        self.failure = Some(message.to_string());
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.calls)
    }

    pub fn into_handle(self) -> Arc<dyn Capability> {
        Arc::new(self)
    }
}

#[async_trait]
impl Capability for StubCapability {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "stub capability for testing"
    }

    fn side_effecting(&self) -> bool {
        self.side_effecting
    }

    async fn invoke(&self, _params: &Params) -> Result<String, CapabilityError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.failure {
            Some(message) => Err(CapabilityError::new("command_failed", message.clone())),
            None => Ok(format!("{} ok", self.name)),
        }
    }
}

/// Engine that never finishes: every turn it asks for the same capability
/// and narrates the turn number.
pub struct LoopingEngine {
    pub capability: String,
    pub calls: AtomicUsize,
}

impl LoopingEngine {
    pub fn new(capability: &str) -> Self {
        Self {
            capability: capability.to_string(),
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl DecisionEngine for LoopingEngine {
    async fn decide(&self, request: &DecisionRequest) -> Result<Decision, EngineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Decision::Invoke {
            capability: self.capability.clone(),
            parameters: Params::new(),
            message: Some(format!("progress at turn {}", request.turn)),
        })
    }
}

/// Engine that always fails.
pub struct BrokenEngine;

#[async_trait]
impl DecisionEngine for BrokenEngine {
    async fn decide(&self, _request: &DecisionRequest) -> Result<Decision, EngineError> {
        Err(EngineError::new("upstream unavailable"))
    }
}

/// Scripted engine that also keeps every request it was asked to decide.
pub struct RecordingEngine {
    inner: ScriptedEngine,
    requests: Mutex<Vec<DecisionRequest>>,
}

impl RecordingEngine {
    pub fn new<I, S>(scripts: I) -> Self
    where
        I: IntoIterator<Item = (S, Vec<Decision>)>,
        S: Into<String>,
    {
        Self {
            inner: ScriptedEngine::new(scripts),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests_for(&self, agent: &str) -> Vec<DecisionRequest> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|request| request.agent == agent)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl DecisionEngine for RecordingEngine {
    async fn decide(&self, request: &DecisionRequest) -> Result<Decision, EngineError> {
        self.requests.lock().unwrap().push(request.clone());
        self.inner.decide(request).await
    }
}

pub fn invoke(capability: &str, parameters: Value) -> Decision {
    Decision::Invoke {
        capability: capability.to_string(),
        parameters: object(parameters),
        message: None,
    }
}

pub fn finish(text: &str) -> Decision {
    Decision::Final {
        text: text.to_string(),
    }
}
