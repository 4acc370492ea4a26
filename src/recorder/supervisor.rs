//! Recording supervisor
//!
//! Owns the task table for the active session: starts one isolated recorder
//! per data source, reaps the ones that exit on their own, and tears the rest
//! down with a bounded wait.

use super::channel::RecorderKind;
use super::launcher::{ExecutionContext, Launcher};
use super::state::{SupervisorState, TaskExit, TaskOutcome, TaskReport, TaskState};
use crate::session::Session;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot::{self, error::TryRecvError};
use tokio::time::Instant;

/// Extra time allowed for a killed recorder to be reaped
const KILL_GRACE: Duration = Duration::from_secs(2);

/// Supervisor errors
#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("session {session} is already active")]
    AlreadyActive { session: String },
}

/// Bookkeeping for one recorder
struct RecordingTask {
    kind: RecorderKind,
    state: TaskState,
    context: Option<Box<dyn ExecutionContext>>,
    exit: Option<oneshot::Receiver<TaskExit>>,
    started_at: Option<DateTime<Utc>>,
    stopped_at: Option<DateTime<Utc>>,
    outcome: Option<TaskOutcome>,
}

impl RecordingTask {
    fn new(kind: RecorderKind) -> Self {
        Self {
            kind,
            state: TaskState::NotStarted,
            context: None,
            exit: None,
            started_at: None,
            stopped_at: None,
            outcome: None,
        }
    }

    fn mark_stopped(&mut self, outcome: TaskOutcome) {
        self.state = TaskState::Stopped;
        self.context = None;
        self.exit = None;
        self.stopped_at = Some(Utc::now());
        self.outcome = Some(outcome);
    }

    fn report(&self) -> TaskReport {
        TaskReport {
            kind: self.kind,
            state: self.state,
            started_at: self.started_at,
            stopped_at: self.stopped_at,
            outcome: self.outcome.clone(),
        }
    }
}

/// Lifecycle owner for the recorders of one session at a time
pub struct Supervisor {
    launcher: Arc<dyn Launcher>,

    /// Tasks of the current (or last) session
    tasks: Vec<RecordingTask>,

    /// Id of the session the tasks belong to
    session_id: Option<String>,

    /// Grace period for a stop request
    stop_timeout: Duration,
}

impl Supervisor {
    pub fn new(launcher: Arc<dyn Launcher>, stop_timeout: Duration) -> Self {
        Self {
            launcher,
            tasks: Vec::new(),
            session_id: None,
            stop_timeout,
        }
    }

    /// Start one recorder per kind for `session`
    ///
    /// A recorder that fails to start is marked stopped with the reason; its
    /// siblings are started regardless.
    pub fn start_all(&mut self, session: &Session, kinds: &[RecorderKind]) -> Result<(), SupervisorError> {
        self.reap();
        if let Some(active) = self.active_session() {
            return Err(SupervisorError::AlreadyActive {
                session: active.to_string(),
            });
        }

        tracing::info!("Starting recorders {:?} for session {}", kinds, session.id());

        self.tasks.clear();
        self.session_id = Some(session.id().to_string());

        for &kind in kinds {
            if self.tasks.iter().any(|t| t.kind == kind) {
                tracing::warn!("Recorder {} requested twice, ignoring duplicate", kind);
                continue;
            }

            let mut task = RecordingTask::new(kind);
            match self.launcher.launch(kind, session) {
                Ok(spawned) => {
                    task.state = TaskState::Running;
                    task.context = Some(spawned.context);
                    task.exit = Some(spawned.exit);
                    task.started_at = Some(Utc::now());
                    tracing::info!("Recorder {} running for session {}", kind, session.id());
                }
                Err(e) => {
                    tracing::error!(
                        "Recorder {} failed to start for session {}: {}",
                        kind,
                        session.id(),
                        e
                    );
                    task.mark_stopped(TaskOutcome::SpawnFailed {
                        reason: e.to_string(),
                    });
                }
            }
            self.tasks.push(task);
        }

        if !self.is_active() {
            tracing::warn!("No recorder is running for session {}", session.id());
        }
        Ok(())
    }

    /// Stop every running recorder and return the task reports
    ///
    /// Tasks that never started or already stopped are left untouched, so
    /// calling this on an idle supervisor, or twice, is a no-op.
    pub async fn terminate_all(&mut self) -> Vec<TaskReport> {
        self.reap();

        let running: Vec<usize> = self
            .tasks
            .iter()
            .enumerate()
            .filter(|(_, t)| t.state == TaskState::Running)
            .map(|(i, _)| i)
            .collect();

        if running.is_empty() {
            tracing::debug!("terminate_all: nothing running");
            return self.tasks();
        }

        let session = self.session_id.clone().unwrap_or_default();
        tracing::info!("Stopping {} recorder(s) for session {}", running.len(), session);

        // Ask everyone first so they wind down in parallel
        for &i in &running {
            if let Some(context) = self.tasks[i].context.as_mut() {
                context.request_stop();
            }
        }

        let deadline = Instant::now() + self.stop_timeout;
        for &i in &running {
            let task = &mut self.tasks[i];
            let Some(mut exit) = task.exit.take() else {
                task.mark_stopped(TaskOutcome::Failed {
                    reason: "exit channel missing".to_string(),
                });
                continue;
            };

            let outcome = match tokio::time::timeout_at(deadline, &mut exit).await {
                Ok(Ok(exit)) => TaskOutcome::from(exit),
                Ok(Err(_)) => TaskOutcome::Failed {
                    reason: "execution context vanished".to_string(),
                },
                Err(_) => {
                    tracing::warn!(
                        "Recorder {} did not stop within {:?}, killing it",
                        task.kind,
                        self.stop_timeout
                    );
                    if let Some(context) = task.context.as_mut() {
                        context.kill();
                    }
                    if tokio::time::timeout(KILL_GRACE, &mut exit).await.is_err() {
                        tracing::warn!("Recorder {} still not reaped after kill", task.kind);
                    }
                    TaskOutcome::Killed
                }
            };

            log_outcome(&session, task.kind, &outcome);
            task.mark_stopped(outcome);
        }

        tracing::info!("All recorders stopped for session {}", session);
        self.tasks()
    }

    /// Whether any recorder is running
    pub fn is_active(&mut self) -> bool {
        self.reap();
        self.tasks.iter().any(|t| t.state == TaskState::Running)
    }

    /// Supervisor-level state
    pub fn state(&mut self) -> SupervisorState {
        if self.is_active() {
            SupervisorState::Active
        } else {
            SupervisorState::Idle
        }
    }

    /// Reports for the tasks of the current (or last) session
    pub fn tasks(&self) -> Vec<TaskReport> {
        self.tasks.iter().map(RecordingTask::report).collect()
    }

    /// Id of the session with running recorders, if any
    fn active_session(&self) -> Option<&str> {
        if self.tasks.iter().any(|t| t.state == TaskState::Running) {
            self.session_id.as_deref()
        } else {
            None
        }
    }

    /// Move tasks whose recorder already exited to `Stopped`
    fn reap(&mut self) {
        let session = self.session_id.as_deref().unwrap_or_default();
        for task in self.tasks.iter_mut().filter(|t| t.state == TaskState::Running) {
            let Some(exit) = task.exit.as_mut() else {
                continue;
            };
            let outcome = match exit.try_recv() {
                Ok(exit) => TaskOutcome::from(exit),
                Err(TryRecvError::Closed) => TaskOutcome::Failed {
                    reason: "execution context vanished".to_string(),
                },
                Err(TryRecvError::Empty) => continue,
            };
            log_outcome(session, task.kind, &outcome);
            task.mark_stopped(outcome);
        }
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        for task in &mut self.tasks {
            if let Some(context) = task.context.as_mut() {
                context.request_stop();
            }
        }
    }
}

fn log_outcome(session: &str, kind: RecorderKind, outcome: &TaskOutcome) {
    match outcome {
        TaskOutcome::Completed => tracing::info!("Recorder {} stopped (session {})", kind, session),
        TaskOutcome::Killed => tracing::warn!("Recorder {} was killed (session {})", kind, session),
        TaskOutcome::Failed { reason } | TaskOutcome::SpawnFailed { reason } => {
            tracing::error!("Recorder {} failed (session {}): {}", kind, session, reason)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recorder::launcher::ThreadLauncher;
    use crate::recorder::testing::{Behavior, FakeFactory};
    use tempfile::tempdir;

    fn supervisor(factory: FakeFactory, timeout: Duration) -> Supervisor {
        Supervisor::new(Arc::new(ThreadLauncher::new(Arc::new(factory))), timeout)
    }

    fn state_of(supervisor: &Supervisor, kind: RecorderKind) -> TaskState {
        supervisor
            .tasks()
            .into_iter()
            .find(|t| t.kind == kind)
            .map(|t| t.state)
            .unwrap_or_default()
    }

    #[tokio::test]
    async fn test_terminate_on_idle_supervisor_is_noop() {
        let mut supervisor = supervisor(FakeFactory::new(), Duration::from_secs(1));
        assert_eq!(supervisor.state(), SupervisorState::Idle);

        let reports = supervisor.terminate_all().await;
        assert!(reports.is_empty());
        assert_eq!(supervisor.state(), SupervisorState::Idle);
    }

    #[tokio::test]
    async fn test_start_then_terminate_twice() {
        let root = tempdir().unwrap();
        let session = Session::create(root.path()).unwrap();
        let mut supervisor = supervisor(FakeFactory::new(), Duration::from_secs(5));

        supervisor.start_all(&session, &RecorderKind::ALL).unwrap();
        assert!(supervisor.is_active());
        for kind in RecorderKind::ALL {
            assert_eq!(state_of(&supervisor, kind), TaskState::Running);
        }

        let first = supervisor.terminate_all().await;
        assert_eq!(first.len(), 3);
        assert!(first
            .iter()
            .all(|r| r.state == TaskState::Stopped && r.outcome == Some(TaskOutcome::Completed)));
        assert_eq!(supervisor.state(), SupervisorState::Idle);

        let second = supervisor.terminate_all().await;
        assert_eq!(first, second);

        // Recorders saw the stop request and closed their output
        let marker = std::fs::read_to_string(session.path_for("imu.out")).unwrap();
        assert_eq!(marker, "started\nstopped\n");
    }

    #[tokio::test]
    async fn test_gps_open_failure_is_isolated() {
        let root = tempdir().unwrap();
        let session = Session::create(root.path()).unwrap();
        let factory =
            FakeFactory::new().with(RecorderKind::Gps, Behavior::FailOpen("/dev/serial0 missing".to_string()));
        let mut supervisor = supervisor(factory, Duration::from_secs(5));

        supervisor.start_all(&session, &RecorderKind::ALL).unwrap();

        assert_eq!(state_of(&supervisor, RecorderKind::Camera), TaskState::Running);
        assert_eq!(state_of(&supervisor, RecorderKind::Imu), TaskState::Running);
        assert_eq!(state_of(&supervisor, RecorderKind::Gps), TaskState::Stopped);
        assert!(session.path_for("camera.out").exists());
        assert!(session.path_for("imu.out").exists());
        assert!(!session.path_for("gps.out").exists());

        let gps = supervisor
            .tasks()
            .into_iter()
            .find(|t| t.kind == RecorderKind::Gps)
            .unwrap();
        assert!(matches!(gps.outcome, Some(TaskOutcome::SpawnFailed { ref reason }) if reason.contains("serial0")));
        assert!(gps.started_at.is_none());

        supervisor.terminate_all().await;
        assert!(!supervisor.is_active());
    }

    #[tokio::test]
    async fn test_recorder_failure_is_reaped() {
        let root = tempdir().unwrap();
        let session = Session::create(root.path()).unwrap();
        let factory = FakeFactory::new().with(
            RecorderKind::Imu,
            Behavior::FailAfter(Duration::from_millis(20), "bus error".to_string()),
        );
        let mut supervisor = supervisor(factory, Duration::from_secs(5));
        supervisor.start_all(&session, &RecorderKind::ALL).unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while state_of(&supervisor, RecorderKind::Imu) != TaskState::Stopped {
            assert!(std::time::Instant::now() < deadline, "imu task never stopped");
            tokio::time::sleep(Duration::from_millis(10)).await;
            supervisor.is_active();
        }

        assert!(supervisor.is_active());
        assert_eq!(state_of(&supervisor, RecorderKind::Camera), TaskState::Running);
        assert_eq!(state_of(&supervisor, RecorderKind::Gps), TaskState::Running);

        let reports = supervisor.terminate_all().await;
        let imu = reports.iter().find(|r| r.kind == RecorderKind::Imu).unwrap();
        assert!(matches!(imu.outcome, Some(TaskOutcome::Failed { ref reason }) if reason.contains("bus error")));
    }

    #[tokio::test]
    async fn test_second_start_while_active_is_rejected() {
        let root = tempdir().unwrap();
        let first = Session::create(root.path()).unwrap();
        let second = Session::create(root.path()).unwrap();
        let mut supervisor = supervisor(FakeFactory::new(), Duration::from_secs(5));

        supervisor.start_all(&first, &[RecorderKind::Imu]).unwrap();
        let err = supervisor.start_all(&second, &[RecorderKind::Imu]).unwrap_err();
        assert!(matches!(err, SupervisorError::AlreadyActive { ref session } if session == first.id()));

        supervisor.terminate_all().await;
        supervisor.start_all(&second, &[RecorderKind::Imu, RecorderKind::Imu]).unwrap();
        assert_eq!(supervisor.tasks().len(), 1);
        supervisor.terminate_all().await;
    }

    #[tokio::test]
    async fn test_hung_recorder_is_killed_after_timeout() {
        let root = tempdir().unwrap();
        let session = Session::create(root.path()).unwrap();
        let factory = FakeFactory::new().with(RecorderKind::Camera, Behavior::IgnoreStop);
        let mut supervisor = supervisor(factory, Duration::from_millis(100));
        supervisor.start_all(&session, &RecorderKind::ALL).unwrap();

        let started = std::time::Instant::now();
        let reports = supervisor.terminate_all().await;
        assert!(started.elapsed() < Duration::from_secs(5));

        let camera = reports.iter().find(|r| r.kind == RecorderKind::Camera).unwrap();
        assert_eq!(camera.outcome, Some(TaskOutcome::Killed));
        assert!(reports
            .iter()
            .filter(|r| r.kind != RecorderKind::Camera)
            .all(|r| r.outcome == Some(TaskOutcome::Completed)));
        assert_eq!(supervisor.state(), SupervisorState::Idle);
    }
}
