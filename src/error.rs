use thiserror::Error;

/// Failures surfaced by the orchestration kernel. Permission denials are not
/// errors; they travel as `Outcome::Denied`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KernelError {
    #[error("{0}")]
    Validation(String),

    #[error("plan item #{0} not found")]
    NotFound(u64),

    #[error(
        "unknown capability(s): {}. Available capabilities: {}",
        .unknown.join(", "),
        .available.join(", ")
    )]
    UnknownCapability {
        unknown: Vec<String>,
        available: Vec<String>,
    },

    #[error("decision engine failed: {0}")]
    Engine(String),
}

impl KernelError {
    pub fn validation(message: impl Into<String>) -> Self {
        KernelError::Validation(message.into())
    }

    pub fn kind(&self) -> &'static str {
        match self {
            KernelError::Validation(_) => "validation_error",
            KernelError::NotFound(_) => "not_found",
            KernelError::UnknownCapability { .. } => "unknown_capability",
            KernelError::Engine(_) => "engine_error",
        }
    }
}

pub type KernelResult<T> = std::result::Result<T, KernelError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Config,
    Engine,
    Input,
    Internal,
}

impl ErrorCategory {
    pub fn code(self) -> &'static str {
        match self {
            ErrorCategory::Config => "CONFIG",
            ErrorCategory::Engine => "ENGINE",
            ErrorCategory::Input => "INPUT",
            ErrorCategory::Internal => "INTERNAL",
        }
    }

    pub fn hint(self) -> &'static str {
        match self {
            ErrorCategory::Config => {
                "Check --config-path/--profile and the field names in your profile table."
            }
            ErrorCategory::Engine => {
                "Pass --script <file> or --decision-command <cmd> (or set decision_command in the profile)."
            }
            ErrorCategory::Input => "Run conductor --help and correct command arguments.",
            ErrorCategory::Internal => {
                "Retry with RUST_LOG=debug. If it persists, capture logs and open an issue."
            }
        }
    }
}

pub fn categorize_error(err: &anyhow::Error) -> ErrorCategory {
    if let Some(kernel) = err.downcast_ref::<KernelError>() {
        return match kernel {
            KernelError::Engine(_) => ErrorCategory::Engine,
            _ => ErrorCategory::Input,
        };
    }

    let msg = format!("{err:#}").to_ascii_lowercase();

    if msg.contains("decision engine")
        || msg.contains("decision command")
        || msg.contains("script")
    {
        return ErrorCategory::Engine;
    }

    if msg.contains("profile") || msg.contains("config") || msg.contains("workspace root") {
        return ErrorCategory::Config;
    }

    if msg.contains("invalid value")
        || msg.contains("failed to read task")
        || msg.contains("task cannot be empty")
    {
        return ErrorCategory::Input;
    }

    ErrorCategory::Internal
}

pub fn format_cli_error(err: &anyhow::Error) -> String {
    let category = categorize_error(err);
    format!("[{}] {:#}\nHint: {}", category.code(), err, category.hint())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kernel_error_kinds_are_stable_labels() {
        assert_eq!(KernelError::validation("bad").kind(), "validation_error");
        assert_eq!(KernelError::NotFound(3).kind(), "not_found");
        assert_eq!(
            KernelError::UnknownCapability {
                unknown: vec!["nope".to_string()],
                available: vec!["list_dir".to_string()],
            }
            .kind(),
            "unknown_capability"
        );
        assert_eq!(KernelError::Engine("down".to_string()).kind(), "engine_error");
    }
}
