use anyhow::Context;
use capture_rig::utils::{logging, SessionLog};
use capture_rig::{RecorderKind, RigConfig};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;

/// Button-triggered video, IMU and GPS capture.
#[derive(Parser, Debug)]
#[command(name = "capture-rig")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to a TOML configuration file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Wait for the control input and record sessions (default).
    Run,

    /// Run a single recorder for an existing session.
    #[command(hide = true)]
    Record {
        #[arg(long, value_enum)]
        kind: RecorderKind,

        /// Session directory created by the orchestrator.
        #[arg(long)]
        session: PathBuf,
    },
}

fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    let session_log = SessionLog::new();
    logging::init(&session_log);

    let config = RigConfig::load_or_default(cli.config.as_deref())?;

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => {
            tracing::info!("Starting capture-rig v{}", env!("CARGO_PKG_VERSION"));

            let config_path = cli
                .config
                .map(|path| path.canonicalize().unwrap_or(path));
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .context("failed to start async runtime")?;
            runtime.block_on(capture_rig::run(config, config_path, session_log))?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Record { kind, session } => Ok(capture_rig::run_recorder(&config, kind, &session, &session_log)),
    }
}
