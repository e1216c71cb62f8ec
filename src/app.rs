use std::io::{BufRead, IsTerminal, Read, Write};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::json;
use tracing::level_filters::LevelFilter;

use crate::capabilities::build_builtin_capabilities;
use crate::capability::CapabilityRegistry;
use crate::cli::Cli;
use crate::config::{RuntimeConfig, load_profiles, resolve_runtime_config};
use crate::dispatcher::WorkerDispatcher;
use crate::engine::{DecisionEngine, build_decision_engine};
use crate::events::EventLog;
use crate::gate::PermissionGate;
use crate::orchestrator::{Orchestrator, RunReport};
use crate::render::{ConsoleRenderer, Renderer};
use crate::telemetry::TelemetrySink;

pub const TASK_PROMPT: &str = "What should the orchestrator work on? ";

pub fn init_tracing(log_filter: &str) -> Result<()> {
    let level = log_filter
        .parse::<LevelFilter>()
        .unwrap_or(LevelFilter::ERROR);
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_env_filter(log_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing subscriber: {e}"))
}

/// Task from the positional argument, else from `input`. An interactive
/// reader gets a one-line prompt; a piped one is read to the end.
pub fn resolve_task<R: BufRead>(
    arg: Option<&str>,
    mut input: R,
    interactive: bool,
) -> Result<String> {
    if let Some(task) = arg.map(str::trim).filter(|task| !task.is_empty()) {
        return Ok(task.to_string());
    }

    let mut task = String::new();
    if interactive {
        eprint!("{TASK_PROMPT}");
        let _ = std::io::stderr().flush();
        input
            .read_line(&mut task)
            .context("failed to read task from stdin")?;
    } else {
        input
            .read_to_string(&mut task)
            .context("failed to read task from stdin")?;
    }

    let task = task.trim();
    if task.is_empty() {
        return Err(anyhow::anyhow!(
            "task cannot be empty. Pass it as an argument or pipe it on stdin."
        ));
    }
    Ok(task.to_string())
}

/// Wire the kernel together for one run.
pub fn build_orchestrator(
    cfg: &RuntimeConfig,
    renderer: Arc<dyn Renderer>,
    engine: Arc<dyn DecisionEngine>,
    telemetry: TelemetrySink,
) -> Result<Orchestrator> {
    let events = EventLog::new(renderer, telemetry);
    let gate = Arc::new(PermissionGate::new(events));
    let capabilities = build_builtin_capabilities(cfg, Arc::clone(&gate))?;
    let registry = CapabilityRegistry::new(capabilities)
        .context("failed to build the capability registry")?;
    tracing::info!(
        capabilities = registry.len(),
        max_turns = cfg.max_turns,
        "kernel ready"
    );

    let dispatcher = WorkerDispatcher::new(Arc::new(registry), engine, gate);
    let orchestrator = Orchestrator::new(dispatcher, cfg.max_turns);
    Ok(match cfg.orchestrator_instructions.as_deref() {
        Some(instructions) => orchestrator.with_instructions(instructions),
        None => orchestrator,
    })
}

pub async fn run_task(
    cfg: &RuntimeConfig,
    renderer: Arc<dyn Renderer>,
    engine: Arc<dyn DecisionEngine>,
    telemetry: TelemetrySink,
    task: &str,
) -> Result<RunReport> {
    telemetry.emit(
        "run_started",
        json!({ "max_turns": cfg.max_turns, "task_chars": task.chars().count() }),
    );
    let mut orchestrator = build_orchestrator(cfg, renderer, engine, telemetry.clone())?;
    let result = orchestrator.run(task).await;
    match &result {
        Ok(report) => telemetry.emit(
            "run_finished",
            json!({ "completion": report.completion, "turns_used": report.turns_used }),
        ),
        Err(err) => telemetry.emit("run_failed", json!({ "error": err.to_string() })),
    }
    result.map_err(anyhow::Error::from)
}

pub async fn run_cli(cli: Cli) -> Result<()> {
    init_tracing(&cli.log_filter)?;
    let profiles = load_profiles(&cli.config_path)?;
    let cfg = resolve_runtime_config(&cli, &profiles)?;
    if !cfg.workspace_root.is_dir() {
        return Err(anyhow::anyhow!(
            "workspace root '{}' is not a directory",
            cfg.workspace_root.display()
        ));
    }

    let engine = build_decision_engine(&cfg)?;
    let stdin = std::io::stdin();
    let interactive = stdin.is_terminal();
    let task = resolve_task(cli.task.as_deref(), stdin.lock(), interactive)?;

    let renderer: Arc<dyn Renderer> = Arc::new(ConsoleRenderer::new(!cfg.non_interactive));
    let telemetry = TelemetrySink::new(&cfg);
    let report = run_task(&cfg, renderer, engine, telemetry, &task).await?;

    tracing::info!(
        completion = report.completion.label(),
        turns = report.turns_used,
        "run complete"
    );
    println!("{}", report.final_text);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn argument_task_wins_over_stdin() {
        let task = resolve_task(Some("  fix the build "), "ignored".as_bytes(), false).unwrap();
        assert_eq!(task, "fix the build");
    }

    #[test]
    fn piped_stdin_is_read_to_the_end() {
        let task = resolve_task(None, "line one\nline two\n".as_bytes(), false).unwrap();
        assert_eq!(task, "line one\nline two");
    }

    #[test]
    fn interactive_stdin_reads_one_line() {
        let task = resolve_task(None, "first\nsecond\n".as_bytes(), true).unwrap();
        assert_eq!(task, "first");
    }

    #[test]
    fn empty_task_is_an_input_error() {
        let err = resolve_task(Some("   "), "\n".as_bytes(), false).unwrap_err();
        assert!(err.to_string().contains("task cannot be empty"));
        assert_eq!(
            crate::error::categorize_error(&err),
            crate::error::ErrorCategory::Input
        );
    }
}
