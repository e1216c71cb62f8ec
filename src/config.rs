use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::cli::{Cli, DEFAULT_MAX_TURNS};

pub const DEFAULT_DECISION_TIMEOUT_SECS: u64 = 120;
pub const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_MAX_OUTPUT_CHARS: usize = 8000;
pub const MAX_OUTPUT_CHARS_LIMIT: usize = 20000;
pub const DEFAULT_TELEMETRY_PATH: &str = ".conductor/telemetry/events.jsonl";

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub profile: String,
    pub config_path: String,
    pub max_turns: u32,
    pub script_path: Option<String>,
    pub decision_command: Option<String>,
    pub decision_timeout_secs: u64,
    pub orchestrator_instructions: Option<String>,
    pub workspace_root: PathBuf,
    pub command_timeout_secs: u64,
    pub max_output_chars: usize,
    pub non_interactive: bool,
    pub telemetry_enabled: bool,
    pub telemetry_path: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProfilesFile {
    #[serde(default)]
    pub profiles: HashMap<String, ProfileConfig>,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProfileConfig {
    pub max_turns: Option<u32>,
    pub script_path: Option<String>,
    pub decision_command: Option<String>,
    pub decision_timeout_secs: Option<u64>,
    pub orchestrator_instructions: Option<String>,
    pub workspace_root: Option<String>,
    pub command_timeout_secs: Option<u64>,
    pub max_output_chars: Option<usize>,
    pub non_interactive: Option<bool>,
    pub telemetry_enabled: Option<bool>,
    pub telemetry_path: Option<String>,
}

pub fn load_profiles(config_path: &str) -> Result<ProfilesFile> {
    let path = Path::new(config_path);
    if !path.exists() {
        return Ok(ProfilesFile::default());
    }

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read profile config file at '{}'", path.display()))?;
    toml::from_str::<ProfilesFile>(&content).with_context(|| {
        format!(
            "invalid profile configuration in '{}'. Check field names and value types.",
            path.display()
        )
    })
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

pub fn resolve_runtime_config(cli: &Cli, profiles: &ProfilesFile) -> Result<RuntimeConfig> {
    let selected = cli.profile.trim();
    if selected.is_empty() {
        return Err(anyhow::anyhow!(
            "profile name cannot be empty. Set --profile <name>."
        ));
    }

    let profile = if selected == "default" && !profiles.profiles.contains_key("default") {
        ProfileConfig::default()
    } else {
        profiles.profiles.get(selected).cloned().ok_or_else(|| {
            let mut names = profiles.profiles.keys().cloned().collect::<Vec<String>>();
            names.sort();
            if names.is_empty() {
                anyhow::anyhow!(
                    "profile '{}' not found in '{}'. No profiles are defined yet.",
                    selected,
                    cli.config_path
                )
            } else {
                anyhow::anyhow!(
                    "profile '{}' not found in '{}'. Available profiles: {}",
                    selected,
                    cli.config_path,
                    names.join(", ")
                )
            }
        })?
    };

    let max_turns = cli
        .max_turns
        .or(profile.max_turns)
        .unwrap_or(DEFAULT_MAX_TURNS);
    if max_turns == 0 {
        return Err(anyhow::anyhow!(
            "invalid value for max_turns: the turn budget must be at least 1"
        ));
    }

    let workspace_root = non_blank(cli.workspace.clone())
        .or(non_blank(profile.workspace_root.clone()))
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));

    Ok(RuntimeConfig {
        profile: selected.to_string(),
        config_path: cli.config_path.clone(),
        max_turns,
        script_path: non_blank(cli.script.clone()).or(non_blank(profile.script_path)),
        decision_command: non_blank(cli.decision_command.clone())
            .or(non_blank(profile.decision_command)),
        decision_timeout_secs: cli
            .decision_timeout_secs
            .or(profile.decision_timeout_secs)
            .unwrap_or(DEFAULT_DECISION_TIMEOUT_SECS)
            .max(1),
        orchestrator_instructions: non_blank(profile.orchestrator_instructions),
        workspace_root,
        command_timeout_secs: cli
            .command_timeout_secs
            .or(profile.command_timeout_secs)
            .unwrap_or(DEFAULT_COMMAND_TIMEOUT_SECS)
            .max(1),
        max_output_chars: cli
            .max_output_chars
            .or(profile.max_output_chars)
            .unwrap_or(DEFAULT_MAX_OUTPUT_CHARS)
            .clamp(128, MAX_OUTPUT_CHARS_LIMIT),
        non_interactive: cli.non_interactive || profile.non_interactive.unwrap_or(false),
        telemetry_enabled: cli
            .telemetry_enabled
            .or(profile.telemetry_enabled)
            .unwrap_or(true),
        telemetry_path: non_blank(cli.telemetry_path.clone())
            .or(non_blank(profile.telemetry_path))
            .unwrap_or_else(|| DEFAULT_TELEMETRY_PATH.to_string()),
    })
}
