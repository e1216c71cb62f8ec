use clap::Parser;

pub const DEFAULT_MAX_TURNS: u32 = 30;

const CLI_EXAMPLES: &str = "Examples:\n\
  conductor \"Add input validation to the parser and cover it with tests\"\n\
  echo \"Summarize the open TODOs\" | conductor --max-turns 10\n\
  conductor --script .conductor/replay.toml \"Refactor the loader\"\n\
  conductor --decision-command \"python3 oracle.py\" --non-interactive \"Audit the repo\"\n\
  conductor --profile ci --telemetry-path /tmp/events.jsonl \"Run lint and report\"\n\
\n\
Decision engines:\n\
  - --script replays decisions per agent from a TOML/JSON file.\n\
  - --decision-command runs an external oracle per turn (request JSON on stdin,\n\
    one decision JSON on stdout).\n\
\n\
Permission gate:\n\
  - Side-effecting capabilities ask [y/N/t] before running; 't' trusts the\n\
    capability for the rest of the run.\n\
  - With --non-interactive or a closed stdin every side-effecting call is denied.";

#[derive(Debug, Parser)]
#[command(name = "conductor")]
#[command(about = "Task-orchestration kernel: plans work, delegates to restricted workers, gates writes")]
#[command(after_long_help = CLI_EXAMPLES)]
pub struct Cli {
    /// Task for the orchestrator. Read from stdin when omitted.
    pub task: Option<String>,

    /// Top-level turn budget for the orchestrator (default: 30).
    #[arg(long, env = "CONDUCTOR_MAX_TURNS")]
    pub max_turns: Option<u32>,

    #[arg(long, env = "CONDUCTOR_PROFILE", default_value = "default")]
    pub profile: String,

    #[arg(long, env = "CONDUCTOR_CONFIG", default_value = ".conductor/config.toml")]
    pub config_path: String,

    /// Replay decisions from a TOML/JSON script.
    #[arg(long, env = "CONDUCTOR_SCRIPT")]
    pub script: Option<String>,

    /// External oracle command consulted once per turn.
    #[arg(long, env = "CONDUCTOR_DECISION_COMMAND")]
    pub decision_command: Option<String>,

    #[arg(long, env = "CONDUCTOR_DECISION_TIMEOUT_SECS")]
    pub decision_timeout_secs: Option<u64>,

    /// Root directory capabilities resolve paths against.
    #[arg(long, env = "CONDUCTOR_WORKSPACE")]
    pub workspace: Option<String>,

    #[arg(long, env = "CONDUCTOR_COMMAND_TIMEOUT_SECS")]
    pub command_timeout_secs: Option<u64>,

    #[arg(long, env = "CONDUCTOR_MAX_OUTPUT_CHARS")]
    pub max_output_chars: Option<usize>,

    /// Never prompt; every side-effecting call is denied.
    #[arg(long, env = "CONDUCTOR_NON_INTERACTIVE", default_value_t = false)]
    pub non_interactive: bool,

    #[arg(long, env = "CONDUCTOR_TELEMETRY_ENABLED", action = clap::ArgAction::Set)]
    pub telemetry_enabled: Option<bool>,

    #[arg(long, env = "CONDUCTOR_TELEMETRY_PATH")]
    pub telemetry_path: Option<String>,

    #[arg(long, env = "RUST_LOG", default_value = "error")]
    pub log_filter: String,
}
