//! CLI entry point for the pulse daemon.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use miette::IntoDiagnostic;

use pulse::config::Config;
use pulse::daemon::Daemon;
use pulse::paths::StateDirLayout;

#[derive(Parser)]
#[command(name = "pulsed", version, about = "Agent-side initiative daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the daemon in the foreground.
    Run {
        /// Path to a TOML config file. Defaults to `<state-dir>/pulse.toml` if present.
        #[arg(long)]
        config: Option<PathBuf>,
        /// Directory for state, audit log, and mutation queue. Defaults to
        /// `$XDG_STATE_HOME/pulse` (or `~/.local/state/pulse`).
        #[arg(long)]
        state_dir: Option<PathBuf>,
    },
    /// Print the current state of a running daemon and exit.
    Status {
        #[arg(long)]
        state_dir: Option<PathBuf>,
    },
}

fn main() -> miette::Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Run { config, state_dir } => run(config, state_dir),
        Command::Status { state_dir } => status(state_dir),
    }
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_env("PULSE_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn resolve_state_dir(explicit: Option<PathBuf>) -> miette::Result<StateDirLayout> {
    match explicit {
        Some(path) => Ok(StateDirLayout::at(path)),
        None => StateDirLayout::resolve().into_diagnostic(),
    }
}

fn run(config_path: Option<PathBuf>, state_dir: Option<PathBuf>) -> miette::Result<()> {
    let layout = resolve_state_dir(state_dir)?;
    layout.ensure_dirs().into_diagnostic()?;

    let config_path = config_path.or_else(|| layout.config_file().exists().then(|| layout.config_file()));
    let config = Config::load(config_path.as_deref()).into_diagnostic()?;

    let daemon = Daemon::new(config, layout.root.clone());
    daemon.run().into_diagnostic()
}

fn status(state_dir: Option<PathBuf>) -> miette::Result<()> {
    let layout = resolve_state_dir(state_dir)?;
    let state_path = layout.state_file();

    if !state_path.exists() {
        println!("no state file found at {}", state_path.display());
        return Ok(());
    }

    let text = std::fs::read_to_string(&state_path).into_diagnostic()?;
    let snapshot: pulse::state::StateSnapshot = serde_json::from_str(&text).into_diagnostic()?;

    println!("drives:");
    for drive in &snapshot.drives.drives {
        println!(
            "  {:<16} pressure={:<8.3} weight={:<6.2} protected={}",
            drive.name, drive.pressure, drive.weight, drive.protected
        );
    }
    println!("total_triggers: {}", snapshot.drives.total_triggers);
    println!(
        "last_trigger: {} ({})",
        snapshot.last_trigger.reason, snapshot.last_trigger.timestamp
    );
    println!("saved_at_unix: {}", snapshot.saved_at_unix);

    Ok(())
}
