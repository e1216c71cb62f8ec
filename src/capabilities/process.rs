use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;

use super::{Workspace, capped, optional_str, required_str, string_list, usize_arg};
use crate::capability::{Capability, CapabilityError, Params};

/// Run `program args...` in `cwd` without a shell, bounded by the
/// workspace timeout. Non-zero exits are errors carrying the output.
pub async fn run_command(
    workspace: &Workspace,
    program: &str,
    args: &[String],
    cwd: &Path,
) -> Result<String, CapabilityError> {
    tracing::debug!(program, ?args, cwd = %cwd.display(), "running external command");
    let child = tokio::process::Command::new(program)
        .args(args)
        .current_dir(cwd)
        .env("NO_COLOR", "1")
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output();

    let timeout = workspace.command_timeout();
    let output = match tokio::time::timeout(timeout, child).await {
        Ok(Ok(output)) => output,
        Ok(Err(err)) => {
            return Err(CapabilityError::new(
                "io_error",
                format!("failed to launch '{program}': {err}"),
            ));
        }
        Err(_) => {
            return Err(CapabilityError::new(
                "timeout",
                format!("'{program}' timed out after {}s", timeout.as_secs()),
            ));
        }
    };

    let mut sections = Vec::new();
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    if !stdout.trim_end().is_empty() {
        sections.push(stdout.trim_end().to_string());
    }
    if !stderr.trim_end().is_empty() {
        sections.push(stderr.trim_end().to_string());
    }
    let combined = capped(&sections.join("\n"), workspace.max_output_chars());

    if output.status.success() {
        if combined.is_empty() {
            return Ok(format!("{program} completed with no output"));
        }
        return Ok(combined);
    }
    Err(CapabilityError::new(
        "command_failed",
        if combined.is_empty() {
            format!("{program} exited with {}", output.status)
        } else {
            format!("{program} exited with {}\n{combined}", output.status)
        },
    ))
}

/// Optional `cwd` argument, resolved inside the workspace.
fn working_dir(workspace: &Workspace, params: &Params) -> Result<PathBuf, CapabilityError> {
    match optional_str(params, "cwd") {
        Some(cwd) => {
            let resolved = workspace.resolve(cwd)?;
            if !resolved.is_dir() {
                return Err(CapabilityError::new(
                    "unsupported_path",
                    format!("cwd '{cwd}' is not a directory"),
                ));
            }
            Ok(resolved)
        }
        None => Ok(workspace.root().to_path_buf()),
    }
}

/// Path arguments default to the workspace root and must resolve inside it.
fn target_paths(
    workspace: &Workspace,
    params: &Params,
    key: &str,
) -> Result<Vec<String>, CapabilityError> {
    let requested = string_list(params, key)?;
    if requested.is_empty() {
        return Ok(vec![".".to_string()]);
    }
    for path in &requested {
        workspace.resolve(path)?;
    }
    Ok(requested)
}

pub struct GitCommand {
    workspace: Arc<Workspace>,
}

impl GitCommand {
    pub fn new(workspace: Arc<Workspace>) -> Self {
        Self { workspace }
    }
}

#[async_trait]
impl Capability for GitCommand {
    fn name(&self) -> &str {
        "git_command"
    }

    fn description(&self) -> &str {
        "Run git with the given args (the text after `git`), optionally in cwd."
    }

    fn side_effecting(&self) -> bool {
        true
    }

    fn describe_action(&self, params: &Params) -> String {
        let args = optional_str(params, "args").unwrap_or_default();
        format!("git_command will execute 'git {args}'.")
    }

    async fn invoke(&self, params: &Params) -> Result<String, CapabilityError> {
        let raw = required_str(params, "args", "git_command")?;
        let args = shlex::split(raw).ok_or_else(|| {
            CapabilityError::invalid_args(format!("unable to parse git arguments '{raw}'"))
        })?;
        let cwd = working_dir(&self.workspace, params)?;
        run_command(&self.workspace, "git", &args, &cwd).await
    }
}

pub struct ShellRun {
    workspace: Arc<Workspace>,
}

impl ShellRun {
    pub fn new(workspace: Arc<Workspace>) -> Self {
        Self { workspace }
    }
}

#[async_trait]
impl Capability for ShellRun {
    fn name(&self) -> &str {
        "shell_run"
    }

    fn description(&self) -> &str {
        "Run a shell command (command, cwd) with a timeout and capped output."
    }

    fn side_effecting(&self) -> bool {
        true
    }

    fn describe_action(&self, params: &Params) -> String {
        let command = optional_str(params, "command").unwrap_or_default();
        format!("shell_run will execute `{command}` with sh.")
    }

    async fn invoke(&self, params: &Params) -> Result<String, CapabilityError> {
        let command = required_str(params, "command", "shell_run")?;
        let cwd = working_dir(&self.workspace, params)?;
        let args = vec!["-c".to_string(), command.to_string()];
        run_command(&self.workspace, "sh", &args, &cwd).await
    }
}

pub struct CodeSearch {
    workspace: Arc<Workspace>,
}

impl CodeSearch {
    pub fn new(workspace: Arc<Workspace>) -> Self {
        Self { workspace }
    }
}

#[async_trait]
impl Capability for CodeSearch {
    fn name(&self) -> &str {
        "code_search"
    }

    fn description(&self) -> &str {
        "Structural code search with ast-grep (pattern, lang, paths, globs, context)."
    }

    fn side_effecting(&self) -> bool {
        false
    }

    async fn invoke(&self, params: &Params) -> Result<String, CapabilityError> {
        let pattern = required_str(params, "pattern", "code_search")?;
        let mut args = vec!["run".to_string(), "--pattern".to_string(), pattern.to_string()];
        if let Some(lang) = optional_str(params, "lang") {
            args.extend(["--lang".to_string(), lang.to_string()]);
        }
        let context = usize_arg(params, "context", 0, 0, 50)?;
        if context > 0 {
            args.extend(["--context".to_string(), context.to_string()]);
        }
        for glob in string_list(params, "globs")? {
            args.extend(["--globs".to_string(), glob]);
        }
        args.extend(target_paths(&self.workspace, params, "paths")?);
        run_command(&self.workspace, "ast-grep", &args, self.workspace.root()).await
    }
}

pub struct CodeRewrite {
    workspace: Arc<Workspace>,
}

impl CodeRewrite {
    pub fn new(workspace: Arc<Workspace>) -> Self {
        Self { workspace }
    }
}

#[async_trait]
impl Capability for CodeRewrite {
    fn name(&self) -> &str {
        "code_rewrite"
    }

    fn description(&self) -> &str {
        "Structural rewrite with ast-grep (pattern, rewrite, lang, paths). Modifies files in place."
    }

    fn side_effecting(&self) -> bool {
        true
    }

    fn describe_action(&self, params: &Params) -> String {
        format!(
            "code_rewrite will modify files in place: '{}' -> '{}'.",
            optional_str(params, "pattern").unwrap_or_default(),
            optional_str(params, "rewrite").unwrap_or_default()
        )
    }

    async fn invoke(&self, params: &Params) -> Result<String, CapabilityError> {
        let pattern = required_str(params, "pattern", "code_rewrite")?;
        let rewrite = required_str(params, "rewrite", "code_rewrite")?;
        let mut args = vec![
            "run".to_string(),
            "--pattern".to_string(),
            pattern.to_string(),
            "--rewrite".to_string(),
            rewrite.to_string(),
            "--update-all".to_string(),
        ];
        if let Some(lang) = optional_str(params, "lang") {
            args.extend(["--lang".to_string(), lang.to_string()]);
        }
        args.extend(target_paths(&self.workspace, params, "paths")?);
        run_command(&self.workspace, "ast-grep", &args, self.workspace.root()).await
    }
}

pub struct LintCheck {
    workspace: Arc<Workspace>,
}

impl LintCheck {
    pub fn new(workspace: Arc<Workspace>) -> Self {
        Self { workspace }
    }
}

#[async_trait]
impl Capability for LintCheck {
    fn name(&self) -> &str {
        "lint_check"
    }

    fn description(&self) -> &str {
        "Run `ruff check` on targets (default: the workspace root)."
    }

    fn side_effecting(&self) -> bool {
        false
    }

    async fn invoke(&self, params: &Params) -> Result<String, CapabilityError> {
        let mut args = vec!["check".to_string()];
        args.extend(target_paths(&self.workspace, params, "targets")?);
        run_command(&self.workspace, "ruff", &args, self.workspace.root()).await
    }
}

pub struct LintFormat {
    workspace: Arc<Workspace>,
}

impl LintFormat {
    pub fn new(workspace: Arc<Workspace>) -> Self {
        Self { workspace }
    }
}

#[async_trait]
impl Capability for LintFormat {
    fn name(&self) -> &str {
        "lint_format"
    }

    fn description(&self) -> &str {
        "Run `ruff format` on targets. Rewrites files in place."
    }

    fn side_effecting(&self) -> bool {
        true
    }

    fn describe_action(&self, params: &Params) -> String {
        let targets = string_list(params, "targets")
            .ok()
            .filter(|targets| !targets.is_empty())
            .map(|targets| targets.join(" "))
            .unwrap_or_else(|| ".".to_string());
        format!("lint_format will run 'ruff format {targets}' and rewrite files.")
    }

    async fn invoke(&self, params: &Params) -> Result<String, CapabilityError> {
        let mut args = vec!["format".to_string()];
        args.extend(target_paths(&self.workspace, params, "targets")?);
        run_command(&self.workspace, "ruff", &args, self.workspace.root()).await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::testing::object;

    fn workspace(dir: &Path, timeout_secs: u64) -> Arc<Workspace> {
        Arc::new(Workspace::new(dir, Duration::from_secs(timeout_secs), 500).unwrap())
    }

    #[tokio::test]
    async fn shell_run_captures_output_in_workspace_root() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("marker.txt"), "").unwrap();
        let shell = ShellRun::new(workspace(dir.path(), 10));
        let out = shell
            .invoke(&object(json!({"command": "ls && echo done"})))
            .await
            .unwrap();
        assert_eq!(out, "marker.txt\ndone");
    }

    #[tokio::test]
    async fn shell_run_reports_failures_and_timeouts() {
        let dir = tempfile::tempdir().unwrap();
        let shell = ShellRun::new(workspace(dir.path(), 1));

        let failed = shell
            .invoke(&object(json!({"command": "echo broken >&2; exit 3"})))
            .await
            .unwrap_err();
        assert_eq!(failed.code, "command_failed");
        assert!(failed.message.contains("broken"));

        let slow = shell
            .invoke(&object(json!({"command": "sleep 5"})))
            .await
            .unwrap_err();
        assert_eq!(slow.code, "timeout");
    }

    #[tokio::test]
    async fn shell_run_output_is_capped() {
        let dir = tempfile::tempdir().unwrap();
        let shell = ShellRun::new(workspace(dir.path(), 10));
        let out = shell
            .invoke(&object(json!({"command": "head -c 2000 /dev/zero | tr '\\0' 'a'"})))
            .await
            .unwrap();
        assert!(out.contains("output truncated at 500 characters"));
    }

    #[tokio::test]
    async fn git_command_rejects_cwd_outside_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let git = GitCommand::new(workspace(dir.path(), 10));
        let err = git
            .invoke(&object(json!({"args": "status", "cwd": ".."})))
            .await
            .unwrap_err();
        assert_eq!(err.code, "denied_path");

        let unparsable = git
            .invoke(&object(json!({"args": "log 'unterminated"})))
            .await
            .unwrap_err();
        assert_eq!(unparsable.code, "invalid_args");
    }

    #[tokio::test]
    async fn missing_binaries_surface_as_io_errors() {
        let dir = tempfile::tempdir().unwrap();
        let ws = workspace(dir.path(), 5);
        let err = run_command(&ws, "conductor-no-such-binary", &[], ws.root())
            .await
            .unwrap_err();
        assert_eq!(err.code, "io_error");
    }

    #[test]
    fn describe_action_names_the_pending_command() {
        let dir = tempfile::tempdir().unwrap();
        let git = GitCommand::new(workspace(dir.path(), 5));
        assert_eq!(
            git.describe_action(&object(json!({"args": "push origin main"}))),
            "git_command will execute 'git push origin main'."
        );
        let format = LintFormat::new(workspace(dir.path(), 5));
        assert_eq!(
            format.describe_action(&Params::new()),
            "lint_format will run 'ruff format .' and rewrite files."
        );
    }
}
