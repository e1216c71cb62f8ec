/// Capability interface and the closed registry workers resolve against.
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Value, json};
use thiserror::Error;

use crate::error::{KernelError, KernelResult};
use crate::events::{ActionEvent, EventOutcome};
use crate::gate::PermissionGate;
use crate::render::format_params;

/// Ordered argument-name to value mapping passed to a capability.
pub type Params = serde_json::Map<String, Value>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct CapabilityError {
    pub code: &'static str,
    pub message: String,
}

impl CapabilityError {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn invalid_args(message: impl Into<String>) -> Self {
        Self::new("invalid_args", message)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "text", rename_all = "snake_case")]
pub enum Outcome {
    Success(String),
    Denied(String),
    Error(String),
}

impl Outcome {
    pub fn text(&self) -> &str {
        match self {
            Outcome::Success(text) | Outcome::Denied(text) | Outcome::Error(text) => text,
        }
    }

    pub fn event_outcome(&self) -> EventOutcome {
        match self {
            Outcome::Success(_) => EventOutcome::Success,
            Outcome::Denied(_) => EventOutcome::Denied,
            Outcome::Error(_) => EventOutcome::Error,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success(_))
    }
}

#[async_trait]
pub trait Capability: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// Fixed per capability: side-effecting capabilities always pass the
    /// permission gate before running.
    fn side_effecting(&self) -> bool;

    /// Text shown to the user when asking permission to run this call.
    fn describe_action(&self, params: &Params) -> String {
        format!(
            "{} will run with {}.",
            self.name(),
            format_params(&Value::Object(params.clone()))
        )
    }

    /// Optional preview shown ahead of the confirmation prompt, such as a
    /// diff of the pending edit.
    fn preview(&self, _params: &Params) -> Option<String> {
        None
    }

    async fn invoke(&self, params: &Params) -> Result<String, CapabilityError>;
}

/// One gated call and what came of it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InvocationRecord {
    pub capability: String,
    pub parameters: Params,
    pub side_effecting: bool,
    pub outcome: Outcome,
}

/// Static name-to-handle mapping built once at startup.
pub struct CapabilityRegistry {
    handles: BTreeMap<String, Arc<dyn Capability>>,
}

impl CapabilityRegistry {
    pub fn new(capabilities: Vec<Arc<dyn Capability>>) -> KernelResult<Self> {
        let mut handles = BTreeMap::new();
        for capability in capabilities {
            let name = capability.name().trim().to_string();
            if name.is_empty() {
                return Err(KernelError::validation("capability name cannot be empty"));
            }
            if handles.insert(name.clone(), capability).is_some() {
                return Err(KernelError::validation(format!(
                    "capability '{name}' is registered more than once"
                )));
            }
        }
        Ok(Self { handles })
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        self.handles.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn catalog(&self) -> Vec<Value> {
        self.handles
            .values()
            .map(|capability| {
                json!({
                    "name": capability.name(),
                    "description": capability.description(),
                    "side_effecting": capability.side_effecting(),
                })
            })
            .collect()
    }

    /// Resolve every requested name or report all unknown names at once.
    pub fn resolve<I, S>(&self, names: I) -> KernelResult<CapabilitySet>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut resolved = BTreeMap::new();
        let mut unknown = Vec::<String>::new();
        let mut seen_unknown = BTreeSet::<String>::new();

        for name in names {
            let name = name.as_ref().trim();
            match self.handles.get(name) {
                Some(handle) => {
                    resolved.insert(name.to_string(), Arc::clone(handle));
                }
                None => {
                    if seen_unknown.insert(name.to_string()) {
                        unknown.push(name.to_string());
                    }
                }
            }
        }

        if !unknown.is_empty() {
            return Err(KernelError::UnknownCapability {
                unknown,
                available: self.names(),
            });
        }

        Ok(CapabilitySet { handles: resolved })
    }
}

/// The resolved subset a worker is bound to. Only the registry can build one.
pub struct CapabilitySet {
    handles: BTreeMap<String, Arc<dyn Capability>>,
}

impl CapabilitySet {
    pub fn names(&self) -> Vec<String> {
        self.handles.keys().cloned().collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handles.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Run `name` through the gate. Names outside the set produce an
    /// `Error` outcome and nothing runs.
    pub async fn invoke(
        &self,
        name: &str,
        params: Params,
        gate: &PermissionGate,
    ) -> InvocationRecord {
        let Some(capability) = self.handles.get(name) else {
            let outcome = Outcome::Error(format!(
                "capability '{name}' is not available to this worker. Allowed capabilities: {}",
                if self.handles.is_empty() {
                    "none".to_string()
                } else {
                    self.names().join(", ")
                }
            ));
            gate.events().record(
                &ActionEvent::new(name, EventOutcome::Error, Value::Object(params.clone()))
                    .with_detail(outcome.text()),
            );
            return InvocationRecord {
                capability: name.to_string(),
                parameters: params,
                side_effecting: false,
                outcome,
            };
        };

        let outcome = gate.invoke(capability.as_ref(), &params).await;
        InvocationRecord {
            capability: name.to_string(),
            side_effecting: capability.side_effecting(),
            parameters: params,
            outcome,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::StubCapability;

    fn registry() -> CapabilityRegistry {
        CapabilityRegistry::new(vec![
            StubCapability::read_only("read_slice").into_handle(),
            StubCapability::side_effecting("git_command").into_handle(),
            StubCapability::read_only("list_dir").into_handle(),
        ])
        .unwrap()
    }

    #[test]
    fn names_are_sorted() {
        assert_eq!(
            registry().names(),
            vec!["git_command", "list_dir", "read_slice"]
        );
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let result = CapabilityRegistry::new(vec![
            StubCapability::read_only("list_dir").into_handle(),
            StubCapability::read_only("list_dir").into_handle(),
        ]);
        assert!(matches!(result, Err(KernelError::Validation(_))));
    }

    #[test]
    fn resolve_reports_every_unknown_name_with_valid_alternatives() {
        let Err(err) = registry().resolve(["list_dir", "nope", "also_missing", "nope"]) else {
            panic!("resolution should fail");
        };
        assert_eq!(
            err,
            KernelError::UnknownCapability {
                unknown: vec!["nope".to_string(), "also_missing".to_string()],
                available: vec![
                    "git_command".to_string(),
                    "list_dir".to_string(),
                    "read_slice".to_string()
                ],
            }
        );
        assert_eq!(
            err.to_string(),
            "unknown capability(s): nope, also_missing. Available capabilities: git_command, list_dir, read_slice"
        );
    }

    #[test]
    fn resolve_returns_only_requested_subset() {
        let set = registry().resolve(["read_slice"]).unwrap();
        assert_eq!(set.names(), vec!["read_slice"]);
        assert!(!set.contains("git_command"));

        let empty = registry().resolve(Vec::<String>::new()).unwrap();
        assert!(empty.is_empty());
    }
}
