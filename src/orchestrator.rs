//! Top-level run loops
//!
//! [`run`] is the long-lived orchestrator: it owns the supervisor and the
//! control binding and waits for operator events or a shutdown signal.
//! [`run_recorder`] is the body of one process-isolated recorder.

use crate::capture::HardwareFactory;
use crate::config::{Isolation, RigConfig};
use crate::control::{self, ControlBinding};
use crate::recorder::{
    Launcher, ProcessLauncher, RecorderFactory, RecorderKind, StopFlag, Supervisor, TaskOutcome, ThreadLauncher,
};
use crate::session::{Session, LOG_FILE};
use crate::utils::{AppResult, SessionLog};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};

/// Build the launcher for the configured isolation unit
fn launcher(config: &RigConfig, config_path: Option<PathBuf>) -> AppResult<Arc<dyn Launcher>> {
    let launcher: Arc<dyn Launcher> = match config.isolation {
        Isolation::Process => Arc::new(ProcessLauncher::current_exe(config_path)?),
        Isolation::Thread => Arc::new(ThreadLauncher::new(Arc::new(HardwareFactory::new(config.clone())))),
    };
    Ok(launcher)
}

/// Wait for operator events until the control source ends or a shutdown
/// signal arrives, then stop whatever is still recording
pub async fn run(config: RigConfig, config_path: Option<PathBuf>, session_log: SessionLog) -> AppResult<()> {
    tracing::info!(
        "Recording into {:?} with {:?} isolation, recorders {:?}",
        config.output_dir,
        config.isolation,
        config.recorders
    );

    let supervisor = Supervisor::new(launcher(&config, config_path)?, config.stop_timeout());
    let mut binding = ControlBinding::new(supervisor, config.output_dir.clone(), config.recorders.clone())
        .with_session_log(session_log);
    let mut source = control::open_source(&config.control)?;

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    loop {
        tokio::select! {
            event = source.next_event() => match event {
                Some(event) => binding.handle(event).await,
                None => {
                    tracing::info!("Control source closed");
                    break;
                }
            },
            _ = sigint.recv() => {
                tracing::info!("Received SIGINT");
                break;
            }
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM");
                break;
            }
        }
    }

    binding.shutdown().await;
    tracing::info!("Orchestrator stopped");
    Ok(())
}

/// Run one recorder inside an isolated child process
///
/// The parent closes our stdin to ask for a stop. The outcome is printed as
/// one JSON line on stdout so the parent can record the cause; exit status 0
/// means the recorder finished cleanly.
pub fn run_recorder(config: &RigConfig, kind: RecorderKind, session_dir: &Path, session_log: &SessionLog) -> ExitCode {
    let outcome = record_in_session(config, kind, session_dir, session_log);
    if let Err(e) = report_outcome(&outcome) {
        tracing::error!("[{}] Failed to report recorder outcome: {}", e.code(), e);
    }
    session_log.detach();

    match outcome {
        TaskOutcome::Completed => ExitCode::SUCCESS,
        _ => ExitCode::FAILURE,
    }
}

fn record_in_session(config: &RigConfig, kind: RecorderKind, session_dir: &Path, session_log: &SessionLog) -> TaskOutcome {
    let session = match Session::attach(session_dir) {
        Ok(session) => session,
        Err(e) => {
            tracing::error!("Cannot attach to session {:?}: {}", session_dir, e);
            return TaskOutcome::SpawnFailed {
                reason: format!("cannot attach to session: {e}"),
            };
        }
    };
    if let Err(e) = session_log.attach(&session.path_for(LOG_FILE)) {
        tracing::warn!("Failed to open {}: {}", LOG_FILE, e);
    }

    let span = tracing::info_span!("recorder", session = %session.id(), kind = %kind, pid = std::process::id());
    let _entered = span.enter();

    let mut recorder = match HardwareFactory::new(config.clone()).open(kind, &session) {
        Ok(recorder) => recorder,
        Err(e) => {
            tracing::error!("Failed to open recorder: {}", e);
            return TaskOutcome::SpawnFailed { reason: e.to_string() };
        }
    };

    let stop = StopFlag::new();
    if let Err(e) = watch_stdin(stop.clone()) {
        tracing::error!("Failed to watch for stop requests: {}", e);
        return TaskOutcome::SpawnFailed { reason: e.to_string() };
    }

    tracing::info!("Recording {}", recorder.kind());
    let outcome = match recorder.record(&stop) {
        Ok(()) => {
            tracing::info!("Recorder finished");
            TaskOutcome::Completed
        }
        Err(e) => {
            tracing::error!("Recorder failed: {}", e);
            TaskOutcome::Failed { reason: e.to_string() }
        }
    };

    // Release the device before reporting the exit
    drop(recorder);
    outcome
}

fn report_outcome(outcome: &TaskOutcome) -> AppResult<()> {
    let line = serde_json::to_string(outcome)?;
    let mut stdout = io::stdout().lock();
    writeln!(stdout, "{line}")?;
    stdout.flush()?;
    Ok(())
}

/// Request a stop once stdin reaches end of file
fn watch_stdin(stop: StopFlag) -> io::Result<()> {
    std::thread::Builder::new()
        .name("stop-watch".to_string())
        .spawn(move || {
            let _ = io::copy(&mut io::stdin().lock(), &mut io::sink());
            tracing::info!("Stop requested");
            stop.request();
        })?;
    Ok(())
}
