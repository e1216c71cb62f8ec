/// Decision-engine contract and the two engines shipped with the CLI.
///
/// An engine answers "what happens next" for one agent: either a final
/// text or a request to invoke one capability. The kernel never looks past
/// this contract.
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::AsyncWriteExt;

use crate::capability::Params;
use crate::config::RuntimeConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TranscriptRole {
    Assistant,
    Capability,
    User,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub role: TranscriptRole,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capability: Option<String>,
    pub content: String,
}

impl TranscriptEntry {
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: TranscriptRole::Assistant,
            capability: None,
            content: content.into(),
        }
    }

    pub fn capability(name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: TranscriptRole::Capability,
            capability: Some(name.into()),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: TranscriptRole::User,
            capability: None,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DecisionRequest {
    pub agent: String,
    pub instructions: String,
    pub task: String,
    pub transcript: Vec<TranscriptEntry>,
    pub allowed_capabilities: Vec<String>,
    /// 1-based index of the turn being decided.
    pub turn: u32,
    pub turn_budget: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Decision {
    Final {
        text: String,
    },
    Invoke {
        capability: String,
        #[serde(default)]
        parameters: Params,
        /// Narration emitted alongside the call; kept as partial output.
        #[serde(default)]
        message: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct EngineError {
    pub message: String,
}

impl EngineError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[async_trait]
pub trait DecisionEngine: Send + Sync {
    async fn decide(&self, request: &DecisionRequest) -> Result<Decision, EngineError>;
}

// ---------------------------------------------------------------------------
// Scripted engine
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScriptFile {
    #[serde(default)]
    pub agents: HashMap<String, Vec<Decision>>,
}

/// Replays decisions per agent name, in order.
pub struct ScriptedEngine {
    queues: Mutex<HashMap<String, VecDeque<Decision>>>,
}

impl ScriptedEngine {
    pub fn new<I, S>(scripts: I) -> Self
    where
        I: IntoIterator<Item = (S, Vec<Decision>)>,
        S: Into<String>,
    {
        Self {
            queues: Mutex::new(
                scripts
                    .into_iter()
                    .map(|(agent, decisions)| (agent.into(), decisions.into()))
                    .collect(),
            ),
        }
    }

    /// Load a `.toml` or `.json` script file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read decision script '{}'", path.display()))?;
        let parsed = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str::<ScriptFile>(&content).with_context(|| {
                format!("invalid JSON decision script '{}'", path.display())
            })?,
            _ => toml::from_str::<ScriptFile>(&content).with_context(|| {
                format!("invalid TOML decision script '{}'", path.display())
            })?,
        };
        Ok(Self::new(parsed.agents))
    }

    pub fn remaining(&self, agent: &str) -> usize {
        self.queues
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(agent)
            .map_or(0, VecDeque::len)
    }
}

#[async_trait]
impl DecisionEngine for ScriptedEngine {
    async fn decide(&self, request: &DecisionRequest) -> Result<Decision, EngineError> {
        self.queues
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get_mut(&request.agent)
            .and_then(VecDeque::pop_front)
            .ok_or_else(|| {
                EngineError::new(format!(
                    "decision script has no more decisions for agent '{}'",
                    request.agent
                ))
            })
    }
}

// ---------------------------------------------------------------------------
// External command engine
// ---------------------------------------------------------------------------

/// Runs an external oracle per decision: request JSON on stdin, one
/// decision JSON on stdout.
#[derive(Debug, Clone)]
pub struct CommandEngine {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandEngine {
    pub fn from_command_line(command: &str, timeout: Duration) -> Result<Self> {
        let mut words = shlex::split(command.trim())
            .filter(|words| !words.is_empty())
            .ok_or_else(|| anyhow::anyhow!("decision command '{command}' could not be parsed"))?;
        let program = words.remove(0);
        Ok(Self {
            program,
            args: words,
            timeout,
        })
    }

    async fn run_once(&self, payload: Vec<u8>) -> Result<std::process::Output, EngineError> {
        let mut child = tokio::process::Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| {
                EngineError::new(format!(
                    "failed to launch decision command '{}': {err}",
                    self.program
                ))
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(&payload).await.map_err(|err| {
                EngineError::new(format!("failed to write decision request: {err}"))
            })?;
        }

        match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(result) => result.map_err(|err| {
                EngineError::new(format!("failed to collect decision command output: {err}"))
            }),
            Err(_) => Err(EngineError::new(format!(
                "decision command timed out after {}s",
                self.timeout.as_secs()
            ))),
        }
    }
}

pub fn parse_decision_output(stdout: &str) -> Result<Decision, EngineError> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Err(EngineError::new("decision command produced no output"));
    }
    serde_json::from_str::<Decision>(trimmed)
        .map_err(|err| EngineError::new(format!("decision command returned invalid JSON: {err}")))
}

#[async_trait]
impl DecisionEngine for CommandEngine {
    async fn decide(&self, request: &DecisionRequest) -> Result<Decision, EngineError> {
        let payload = serde_json::to_vec(request)
            .map_err(|err| EngineError::new(format!("failed to encode decision request: {err}")))?;
        let output = self.run_once(payload).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(EngineError::new(format!(
                "decision command exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }
        parse_decision_output(&String::from_utf8_lossy(&output.stdout))
    }
}

/// Pick the engine the runtime configuration asks for. A script wins over
/// a command when both are set.
pub fn build_decision_engine(cfg: &RuntimeConfig) -> Result<Arc<dyn DecisionEngine>> {
    if let Some(script) = cfg.script_path.as_deref() {
        tracing::info!(script = script, "using scripted decision engine");
        return Ok(Arc::new(ScriptedEngine::load(Path::new(script))?));
    }
    if let Some(command) = cfg.decision_command.as_deref() {
        tracing::info!(command = command, "using external decision command");
        return Ok(Arc::new(CommandEngine::from_command_line(
            command,
            Duration::from_secs(cfg.decision_timeout_secs),
        )?));
    }
    Err(anyhow::anyhow!(
        "no decision engine configured. Set --script or --decision-command."
    ))
}
