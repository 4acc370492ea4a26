//! Execution contexts for recorders
//!
//! Each recorder runs in its own isolation unit so that a crash, a hung
//! device or a driver error stays contained:
//! - [`ProcessLauncher`] re-executes the binary as a child process. Closing
//!   the child's stdin asks it to finish; killing it is the fallback.
//! - [`ThreadLauncher`] runs the recorder on a dedicated OS thread behind a
//!   panic boundary. Threads cannot be killed, only detached.
//!
//! Both report the recorder's exit through a oneshot channel so the
//! supervisor can reap tasks without polling.

use super::channel::{RecorderError, RecorderFactory, RecorderKind, RecorderResult, StopFlag};
use super::state::{TaskExit, TaskOutcome};
use crate::session::Session;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::oneshot;
use tracing::Instrument;

/// How long to wait for a recorder's outcome line after it exited
const REPORT_GRACE: Duration = Duration::from_secs(1);

/// Handle on the isolation unit hosting one recorder
pub trait ExecutionContext: Send {
    /// Ask the recorder to finish and release its device
    fn request_stop(&mut self);

    /// Stop the recorder without waiting for its cleanup
    fn kill(&mut self);
}

/// A launched recorder
pub struct Spawned {
    pub context: Box<dyn ExecutionContext>,

    /// Resolves once the recorder has exited
    pub exit: oneshot::Receiver<TaskExit>,
}

/// Starts recorders in isolated execution contexts
pub trait Launcher: Send + Sync {
    /// Start the recorder for `kind`
    ///
    /// Returns once the execution context exists; never waits for the
    /// recorder to finish.
    fn launch(&self, kind: RecorderKind, session: &Session) -> RecorderResult<Spawned>;
}

/// Runs recorders on dedicated threads
pub struct ThreadLauncher {
    factory: Arc<dyn RecorderFactory>,
}

impl ThreadLauncher {
    pub fn new(factory: Arc<dyn RecorderFactory>) -> Self {
        Self { factory }
    }
}

impl Launcher for ThreadLauncher {
    fn launch(&self, kind: RecorderKind, session: &Session) -> RecorderResult<Spawned> {
        // Opening happens on the caller so a missing device fails the launch
        let mut recorder = panic::catch_unwind(AssertUnwindSafe(|| self.factory.open(kind, session)))
            .map_err(|payload| RecorderError::Panicked(panic_message(payload.as_ref())))??;
        if recorder.kind() != kind {
            return Err(RecorderError::ConfigurationError(format!(
                "asked for a {kind} recorder, got {}",
                recorder.kind()
            )));
        }

        let stop = StopFlag::new();
        let thread_stop = stop.clone();
        let (exit_tx, exit_rx) = oneshot::channel();
        let span = tracing::info_span!("recorder", session = %session.id(), kind = %kind);

        let handle = std::thread::Builder::new()
            .name(format!("recorder-{kind}"))
            .spawn(move || {
                let _entered = span.enter();
                let result = panic::catch_unwind(AssertUnwindSafe(|| recorder.record(&thread_stop)));
                let exit = match result {
                    Ok(Ok(())) => {
                        tracing::info!("Recorder finished");
                        TaskExit::Clean
                    }
                    Ok(Err(e)) => {
                        tracing::error!("Recorder failed: {}", e);
                        TaskExit::Failed(e.to_string())
                    }
                    Err(payload) => {
                        let message = panic_message(payload.as_ref());
                        tracing::error!("Recorder panicked: {}", message);
                        TaskExit::Failed(format!("panicked: {message}"))
                    }
                };
                let _ = exit_tx.send(exit);
            })?;

        Ok(Spawned {
            context: Box::new(ThreadContext {
                kind,
                stop,
                handle: Some(handle),
            }),
            exit: exit_rx,
        })
    }
}

struct ThreadContext {
    kind: RecorderKind,
    stop: StopFlag,
    handle: Option<JoinHandle<()>>,
}

impl ExecutionContext for ThreadContext {
    fn request_stop(&mut self) {
        self.stop.request();
    }

    fn kill(&mut self) {
        self.stop.request();
        if self.handle.take().is_some() {
            tracing::warn!(
                "{} recorder thread did not stop in time, detaching it",
                self.kind
            );
        }
    }
}

impl Drop for ThreadContext {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.is_finished() {
                let _ = handle.join();
            }
        }
    }
}

/// Runs each recorder as a child process of this binary
pub struct ProcessLauncher {
    program: PathBuf,
    config_path: Option<PathBuf>,
}

impl ProcessLauncher {
    pub fn new(program: PathBuf, config_path: Option<PathBuf>) -> Self {
        Self {
            program,
            config_path,
        }
    }

    /// Launcher re-executing the running binary
    pub fn current_exe(config_path: Option<PathBuf>) -> std::io::Result<Self> {
        Ok(Self::new(std::env::current_exe()?, config_path))
    }

    fn command(&self, kind: RecorderKind, session: &Session) -> Command {
        let mut cmd = Command::new(&self.program);
        if let Some(config) = &self.config_path {
            cmd.arg("--config").arg(config);
        }
        cmd.arg("record")
            .arg("--kind")
            .arg(kind.as_str())
            .arg("--session")
            .arg(session.dir())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        // Keep terminal signals (Ctrl-C) away from recorders; the
        // orchestrator stops them itself so encoders get finalized.
        #[cfg(unix)]
        cmd.process_group(0);

        cmd
    }
}

impl Launcher for ProcessLauncher {
    fn launch(&self, kind: RecorderKind, session: &Session) -> RecorderResult<Spawned> {
        let child = self.command(kind, session).spawn()?;
        tracing::info!("Spawned {} recorder process (pid {:?})", kind, child.id());
        Ok(watch_child(kind, session.id(), child))
    }
}

/// Track a recorder child process; must be called inside a tokio runtime
fn watch_child(kind: RecorderKind, session_id: &str, mut child: Child) -> Spawned {
    let stdin = child.stdin.take();
    let report = tokio::spawn(read_report(child.stdout.take()));
    let (exit_tx, exit_rx) = oneshot::channel();
    let (kill_tx, kill_rx) = oneshot::channel::<()>();
    let span = tracing::info_span!("recorder", session = %session_id, kind = %kind);

    tokio::spawn(
        async move {
            let waited = tokio::select! {
                status = child.wait() => Some(status),
                Ok(()) = kill_rx => None,
            };
            let status = match waited {
                Some(status) => status,
                None => {
                    if let Err(e) = child.start_kill() {
                        tracing::warn!("Failed to kill recorder process: {}", e);
                    }
                    child.wait().await
                }
            };

            let report = match tokio::time::timeout(REPORT_GRACE, report).await {
                Ok(Ok(report)) => report,
                _ => None,
            };
            let exit = match (status, report) {
                (Ok(status), _) if status.success() => TaskExit::Clean,
                (_, Some(reported)) => reported,
                (Ok(status), None) => TaskExit::Failed(format!("recorder process {status}")),
                (Err(e), None) => TaskExit::Failed(format!("failed to wait for recorder process: {e}")),
            };
            tracing::debug!("Recorder process exited: {:?}", exit);
            let _ = exit_tx.send(exit);
        }
        .instrument(span),
    );

    Spawned {
        context: Box::new(ProcessContext {
            stdin,
            kill: Some(kill_tx),
        }),
        exit: exit_rx,
    }
}

/// Last outcome line printed by a recorder process
async fn read_report(stdout: Option<ChildStdout>) -> Option<TaskExit> {
    let mut lines = BufReader::new(stdout?).lines();
    let mut reported = None;
    while let Ok(Some(line)) = lines.next_line().await {
        match serde_json::from_str::<TaskOutcome>(&line) {
            Ok(outcome) => reported = Some(TaskExit::from(outcome)),
            Err(_) => tracing::debug!("Ignoring recorder output: {}", line),
        }
    }
    reported
}

struct ProcessContext {
    stdin: Option<ChildStdin>,
    kill: Option<oneshot::Sender<()>>,
}

impl ExecutionContext for ProcessContext {
    fn request_stop(&mut self) {
        // EOF on stdin is the child's stop signal
        drop(self.stdin.take());
    }

    fn kill(&mut self) {
        drop(self.stdin.take());
        if let Some(kill) = self.kill.take() {
            let _ = kill.send(());
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recorder::testing::{Behavior, FakeFactory};
    use std::time::Duration;
    use tempfile::tempdir;

    fn launcher(factory: FakeFactory) -> ThreadLauncher {
        ThreadLauncher::new(Arc::new(factory))
    }

    #[tokio::test]
    async fn test_thread_recorder_stops_on_request() {
        let root = tempdir().unwrap();
        let session = Session::create(root.path()).unwrap();
        let mut spawned = launcher(FakeFactory::new())
            .launch(RecorderKind::Imu, &session)
            .unwrap();

        spawned.context.request_stop();
        let exit = tokio::time::timeout(Duration::from_secs(5), spawned.exit)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(exit, TaskExit::Clean);
    }

    #[tokio::test]
    async fn test_thread_open_failure_fails_launch() {
        let root = tempdir().unwrap();
        let session = Session::create(root.path()).unwrap();
        let factory = FakeFactory::new()
            .with(RecorderKind::Gps, Behavior::FailOpen("no /dev/serial0".to_string()))
            .with(RecorderKind::Camera, Behavior::PanicOnOpen);
        let launcher = launcher(factory);

        assert!(matches!(
            launcher.launch(RecorderKind::Gps, &session),
            Err(RecorderError::DeviceUnavailable(_))
        ));
        assert!(matches!(
            launcher.launch(RecorderKind::Camera, &session),
            Err(RecorderError::Panicked(_))
        ));
    }

    #[tokio::test]
    async fn test_thread_panic_is_contained() {
        let root = tempdir().unwrap();
        let session = Session::create(root.path()).unwrap();
        let spawned = launcher(FakeFactory::new().with(RecorderKind::Imu, Behavior::PanicOnRecord))
            .launch(RecorderKind::Imu, &session)
            .unwrap();

        let exit = tokio::time::timeout(Duration::from_secs(5), spawned.exit)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(exit, TaskExit::Failed(reason) if reason.contains("panicked")));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_child_stops_when_stdin_closes() {
        let child = Command::new("cat")
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .spawn()
            .unwrap();
        let mut spawned = watch_child(RecorderKind::Gps, "test", child);

        spawned.context.request_stop();
        let exit = tokio::time::timeout(Duration::from_secs(5), spawned.exit)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(exit, TaskExit::Clean);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_child_is_killed() {
        let child = Command::new("sleep")
            .arg("30")
            .stdin(Stdio::piped())
            .spawn()
            .unwrap();
        let mut spawned = watch_child(RecorderKind::Camera, "test", child);

        spawned.context.request_stop();
        spawned.context.kill();
        let exit = tokio::time::timeout(Duration::from_secs(5), spawned.exit)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(exit, TaskExit::Failed(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_child_reports_open_failure() {
        let child = Command::new("sh")
            .arg("-c")
            .arg(r#"echo 'opening'; echo '{"type":"spawnFailed","reason":"Device unavailable: no camera"}'; exit 1"#)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()
            .unwrap();
        let spawned = watch_child(RecorderKind::Camera, "test", child);

        let exit = tokio::time::timeout(Duration::from_secs(5), spawned.exit)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(exit, TaskExit::OpenFailed("Device unavailable: no camera".to_string()));
        assert_eq!(
            TaskOutcome::from(exit),
            TaskOutcome::SpawnFailed {
                reason: "Device unavailable: no camera".to_string()
            }
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_child_reports_recording_failure() {
        let child = Command::new("sh")
            .arg("-c")
            .arg(r#"echo '{"type":"failed","reason":"Sensor read failed: remote I/O error"}'; exit 1"#)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()
            .unwrap();
        let spawned = watch_child(RecorderKind::Imu, "test", child);

        let exit = tokio::time::timeout(Duration::from_secs(5), spawned.exit)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(exit, TaskExit::Failed("Sensor read failed: remote I/O error".to_string()));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_silent_child_failure_keeps_exit_status() {
        let child = Command::new("sh")
            .arg("-c")
            .arg("exit 3")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()
            .unwrap();
        let spawned = watch_child(RecorderKind::Gps, "test", child);

        let exit = tokio::time::timeout(Duration::from_secs(5), spawned.exit)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(exit, TaskExit::Failed(reason) if reason.contains("exit status: 3")));
    }
}
