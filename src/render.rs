/// Console rendering and interactive prompts.
///
/// The kernel only talks to the terminal through the `Renderer` trait, so the
/// orchestrator, dispatcher and gate can run unchanged against a scripted
/// renderer in tests.
use std::io::{self, BufRead, Write};

use crossterm::style::Stylize;
use serde_json::Value;

pub const LOG_PREFIX: &str = "[conductor]";

/// Answer to a yes/no confirmation prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmAnswer {
    Yes,
    No,
    /// Allow now and skip future prompts for the same capability this run.
    Trust,
}

impl ConfirmAnswer {
    pub fn parse(input: &str) -> Self {
        match input.trim().to_ascii_lowercase().as_str() {
            "y" | "yes" => ConfirmAnswer::Yes,
            "t" | "trust" => ConfirmAnswer::Trust,
            _ => ConfirmAnswer::No,
        }
    }

    pub fn allows(self) -> bool {
        matches!(self, ConfirmAnswer::Yes | ConfirmAnswer::Trust)
    }
}

pub trait Renderer: Send + Sync {
    /// Show a block of text to the user.
    fn render(&self, text: &str);

    /// Ask for a yes/no decision. `None` means no response could be obtained.
    fn confirm(&self, description: &str) -> Option<ConfirmAnswer>;

    /// Ask a free-form question. `None` means end of input.
    fn ask_user(&self, question: &str) -> Option<String>;
}

/// Renders to stderr and reads answers from stdin.
#[derive(Debug, Clone)]
pub struct ConsoleRenderer {
    interactive: bool,
}

impl ConsoleRenderer {
    pub fn new(interactive: bool) -> Self {
        Self { interactive }
    }

    fn read_line(&self) -> Option<String> {
        if !self.interactive {
            return None;
        }
        let mut buf = String::new();
        match io::stdin().lock().read_line(&mut buf) {
            Ok(0) => None,
            Ok(_) => Some(buf.trim_end_matches(['\r', '\n']).to_string()),
            Err(err) => {
                tracing::warn!(error = %err, "failed to read interactive input");
                None
            }
        }
    }
}

impl Renderer for ConsoleRenderer {
    fn render(&self, text: &str) {
        let mut stderr = io::stderr().lock();
        let _ = writeln!(stderr, "{text}\n");
    }

    fn confirm(&self, description: &str) -> Option<ConfirmAnswer> {
        if !self.interactive {
            self.render(&format!(
                "{} unable to prompt for confirmation (non-interactive). Denying by default.",
                LOG_PREFIX.bold()
            ));
            return None;
        }

        eprintln!("{} {}", LOG_PREFIX.bold().cyan(), description);
        eprint!(
            "{} ",
            "Proceed? Use 't' to trust this capability for the run. [y/N/t]:".dim()
        );
        let _ = io::stderr().flush();

        let Some(line) = self.read_line() else {
            self.render(&format!(
                "{} unable to prompt for confirmation (EOF). Denying by default.",
                LOG_PREFIX.bold()
            ));
            return None;
        };

        let answer = ConfirmAnswer::parse(&line);
        if answer.allows() {
            eprintln!("{}", "  permission granted.".green());
        } else {
            eprintln!("{}", "  permission denied.".red());
        }
        Some(answer)
    }

    fn ask_user(&self, question: &str) -> Option<String> {
        eprintln!("{} {}", LOG_PREFIX.bold().cyan(), question);
        eprint!("{} ", ">".bold());
        let _ = io::stderr().flush();
        self.read_line()
    }
}

/// Render a JSON value compactly for log lines: strings in backticks,
/// arrays and objects recursively.
pub fn format_value(value: &Value) -> String {
    match value {
        Value::String(text) if text.is_empty() => "`''`".to_string(),
        Value::String(text) => format!("`{text}`"),
        Value::Array(items) => format!(
            "[{}]",
            items.iter().map(format_value).collect::<Vec<_>>().join(", ")
        ),
        Value::Object(map) => format!(
            "{{{}}}",
            map.iter()
                .map(|(key, val)| format!("`{key}`: {}", format_value(val)))
                .collect::<Vec<_>>()
                .join(", ")
        ),
        other => format!("`{other}`"),
    }
}

/// Format a parameter object as `key=value` pairs, or `none`.
pub fn format_params(params: &Value) -> String {
    match params {
        Value::Null => "none".to_string(),
        Value::Object(map) if map.is_empty() => "none".to_string(),
        Value::Object(map) => map
            .iter()
            .map(|(key, val)| format!("{key}={}", format_value(val)))
            .collect::<Vec<_>>()
            .join(", "),
        other => format_value(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn confirm_answer_accepts_yes_and_trust_only() {
        assert_eq!(ConfirmAnswer::parse(" Y "), ConfirmAnswer::Yes);
        assert_eq!(ConfirmAnswer::parse("yes"), ConfirmAnswer::Yes);
        assert_eq!(ConfirmAnswer::parse("t"), ConfirmAnswer::Trust);
        assert_eq!(ConfirmAnswer::parse(""), ConfirmAnswer::No);
        assert_eq!(ConfirmAnswer::parse("yep"), ConfirmAnswer::No);
        assert!(!ConfirmAnswer::No.allows());
    }

    #[test]
    fn format_params_renders_nested_values() {
        let params = json!({"action": "add", "title": "", "tools": ["a", "b"], "max_turns": 3});
        assert_eq!(
            format_params(&params),
            "action=`add`, title=`''`, tools=[`a`, `b`], max_turns=`3`"
        );
        assert_eq!(format_params(&json!({})), "none");
        assert_eq!(format_params(&Value::Null), "none");
    }

    #[test]
    fn non_interactive_console_never_answers() {
        let renderer = ConsoleRenderer::new(false);
        assert_eq!(renderer.confirm("write file"), None);
        assert_eq!(renderer.read_line(), None);
    }
}
