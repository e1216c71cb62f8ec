//! Built-in capabilities: filesystem reads, guarded edits, git, shell and
//! the external code tools (ast-grep, ruff), plus a question channel to the
//! user. All paths resolve against one workspace root.

mod ask_user;
mod fs;
mod process;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::Value;

use crate::capability::{Capability, CapabilityError, Params};
use crate::config::RuntimeConfig;
use crate::gate::PermissionGate;

pub use ask_user::AskUser;
pub use fs::{FileEdit, FileTail, ListDir, ReadSlice};
pub use process::{CodeRewrite, CodeSearch, GitCommand, LintCheck, LintFormat, ShellRun};

pub const DENIED_SEGMENTS: &[&str] = &[".git", ".conductor"];
pub const DENIED_FILE_NAMES: &[&str] =
    &[".env", ".env.local", ".env.development", ".env.production"];

/// Workspace root plus the limits shared by every built-in.
#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
    command_timeout: Duration,
    max_output_chars: usize,
}

impl Workspace {
    pub fn new(root: &Path, command_timeout: Duration, max_output_chars: usize) -> Result<Self> {
        let root = root.canonicalize().with_context(|| {
            format!("workspace root '{}' could not be resolved", root.display())
        })?;
        Ok(Self {
            root,
            command_timeout,
            max_output_chars,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn command_timeout(&self) -> Duration {
        self.command_timeout
    }

    pub fn max_output_chars(&self) -> usize {
        self.max_output_chars
    }

    /// Resolve an existing path inside the workspace.
    ///
    /// Paths escaping the root, or touching `.git`, `.conductor` or dotenv
    /// files, are rejected.
    pub fn resolve(&self, requested: &str) -> Result<PathBuf, CapabilityError> {
        let candidate = PathBuf::from(requested);
        let absolute = if candidate.is_absolute() {
            candidate
        } else {
            self.root.join(candidate)
        };
        if !absolute.exists() {
            return Err(CapabilityError::new(
                "invalid_path",
                format!("path '{requested}' does not exist"),
            ));
        }
        let resolved = absolute.canonicalize().map_err(|_| {
            CapabilityError::new(
                "invalid_path",
                format!("path '{requested}' could not be resolved"),
            )
        })?;

        if !resolved.starts_with(&self.root) {
            return Err(CapabilityError::new(
                "denied_path",
                format!(
                    "path '{requested}' is outside workspace root '{}'",
                    self.root.display()
                ),
            ));
        }
        let relative = resolved.strip_prefix(&self.root).unwrap_or(resolved.as_path());
        for component in relative.components() {
            let segment = component.as_os_str().to_string_lossy();
            if DENIED_SEGMENTS
                .iter()
                .any(|denied| segment.eq_ignore_ascii_case(denied))
            {
                return Err(CapabilityError::new(
                    "denied_path",
                    format!("path '{requested}': segment '{segment}' is blocked by policy"),
                ));
            }
        }
        if let Some(name) = resolved.file_name().and_then(|value| value.to_str())
            && DENIED_FILE_NAMES
                .iter()
                .any(|denied| name.eq_ignore_ascii_case(denied))
        {
            return Err(CapabilityError::new(
                "denied_path",
                format!("path '{requested}': filename '{name}' is blocked by policy"),
            ));
        }
        Ok(resolved)
    }

    pub fn display_path(&self, path: &Path) -> String {
        path.strip_prefix(&self.root)
            .map(|relative| {
                if relative.as_os_str().is_empty() {
                    ".".to_string()
                } else {
                    format!("./{}", relative.display())
                }
            })
            .unwrap_or_else(|_| path.display().to_string())
    }
}

pub fn required_str<'a>(
    params: &'a Params,
    key: &str,
    capability: &str,
) -> Result<&'a str, CapabilityError> {
    params
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| {
            CapabilityError::invalid_args(format!("'{key}' is required for {capability}"))
        })
}

/// Like `required_str`, but keeps surrounding whitespace. Used for edit
/// text where indentation matters.
pub fn required_raw_str<'a>(
    params: &'a Params,
    key: &str,
    capability: &str,
) -> Result<&'a str, CapabilityError> {
    params
        .get(key)
        .and_then(Value::as_str)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| {
            CapabilityError::invalid_args(format!("'{key}' is required for {capability}"))
        })
}

pub fn optional_str<'a>(params: &'a Params, key: &str) -> Option<&'a str> {
    params
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

pub fn bool_arg(params: &Params, key: &str) -> Result<bool, CapabilityError> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(false),
        Some(Value::Bool(value)) => Ok(*value),
        Some(_) => Err(CapabilityError::invalid_args(format!(
            "'{key}' must be true or false"
        ))),
    }
}

pub fn usize_arg(
    params: &Params,
    key: &str,
    default: usize,
    min: usize,
    max: usize,
) -> Result<usize, CapabilityError> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(default),
        Some(raw) => {
            let value = raw.as_u64().ok_or_else(|| {
                CapabilityError::invalid_args(format!("'{key}' must be a positive integer"))
            })?;
            let parsed = usize::try_from(value).map_err(|_| {
                CapabilityError::invalid_args(format!("'{key}' is too large for this platform"))
            })?;
            if parsed < min || parsed > max {
                return Err(CapabilityError::invalid_args(format!(
                    "'{key}' must be between {min} and {max}"
                )));
            }
            Ok(parsed)
        }
    }
}

/// A list argument given either as an array of strings or one string.
pub fn string_list(params: &Params, key: &str) -> Result<Vec<String>, CapabilityError> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::String(value)) => Ok(shlex::split(value).unwrap_or_else(|| vec![value.clone()])),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| {
                item.as_str().map(str::to_string).ok_or_else(|| {
                    CapabilityError::invalid_args(format!("'{key}' must contain only strings"))
                })
            })
            .collect(),
        Some(_) => Err(CapabilityError::invalid_args(format!(
            "'{key}' must be a string or a list of strings"
        ))),
    }
}

pub fn truncate_text(text: &str, max_chars: usize) -> (String, bool) {
    let mut iter = text.chars();
    let truncated = iter.by_ref().take(max_chars).collect::<String>();
    if iter.next().is_some() {
        (truncated, true)
    } else {
        (text.to_string(), false)
    }
}

/// Cap `text` at the workspace output limit, noting when it was cut.
pub fn capped(text: &str, max_chars: usize) -> String {
    match truncate_text(text, max_chars) {
        (text, false) => text,
        (mut text, true) => {
            text.push_str(&format!("\n... (output truncated at {max_chars} characters)"));
            text
        }
    }
}

/// The capability set registered at startup.
pub fn build_builtin_capabilities(
    cfg: &RuntimeConfig,
    gate: Arc<PermissionGate>,
) -> Result<Vec<Arc<dyn Capability>>> {
    let workspace = Arc::new(Workspace::new(
        &cfg.workspace_root,
        Duration::from_secs(cfg.command_timeout_secs),
        cfg.max_output_chars,
    )?);
    tracing::debug!(root = %workspace.root().display(), "workspace resolved");

    Ok(vec![
        Arc::new(ListDir::new(Arc::clone(&workspace))),
        Arc::new(ReadSlice::new(Arc::clone(&workspace))),
        Arc::new(FileTail::new(Arc::clone(&workspace))),
        Arc::new(FileEdit::new(Arc::clone(&workspace))),
        Arc::new(GitCommand::new(Arc::clone(&workspace))),
        Arc::new(ShellRun::new(Arc::clone(&workspace))),
        Arc::new(CodeSearch::new(Arc::clone(&workspace))),
        Arc::new(CodeRewrite::new(Arc::clone(&workspace))),
        Arc::new(LintCheck::new(Arc::clone(&workspace))),
        Arc::new(LintFormat::new(workspace)),
        Arc::new(AskUser::new(gate)),
    ])
}
