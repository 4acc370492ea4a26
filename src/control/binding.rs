//! Control binding
//!
//! Maps operator events onto the supervisor. Events are handled one at a
//! time by the single task that owns the binding, so the check-then-act in
//! `on_held`/`on_released` can never interleave.

use super::ControlEvent;
use crate::recorder::{RecorderKind, Supervisor, TaskReport};
use crate::session::{write_manifest, Session, SessionError, SessionManifest, LOG_FILE};
use crate::utils::{AppResult, SessionLog};
use std::path::PathBuf;

pub struct ControlBinding {
    supervisor: Supervisor,
    output_root: PathBuf,
    recorders: Vec<RecorderKind>,

    /// Session started by the last hold, until it is finalized
    session: Option<(Session, SessionManifest)>,

    session_log: Option<SessionLog>,
}

impl ControlBinding {
    pub fn new(supervisor: Supervisor, output_root: PathBuf, recorders: Vec<RecorderKind>) -> Self {
        Self {
            supervisor,
            output_root,
            recorders,
            session: None,
            session_log: None,
        }
    }

    /// Mirror the run log into each session's `exec.log`
    pub fn with_session_log(mut self, session_log: SessionLog) -> Self {
        self.session_log = Some(session_log);
        self
    }

    /// Session currently being recorded, if any
    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref().map(|(session, _)| session)
    }

    pub fn supervisor(&mut self) -> &mut Supervisor {
        &mut self.supervisor
    }

    /// Dispatch one event; failures are logged, never propagated
    pub async fn handle(&mut self, event: ControlEvent) {
        tracing::debug!("Control event: {:?}", event);
        match event {
            ControlEvent::Held => {
                if let Err(e) = self.on_held().await {
                    tracing::error!("[{}] Failed to start session: {}", e.code(), e);
                }
            }
            ControlEvent::Released => {
                self.on_released().await;
            }
        }
    }

    /// Start a new session unless one is already recording
    pub async fn on_held(&mut self) -> AppResult<Option<Session>> {
        if self.supervisor.is_active() {
            tracing::info!("Hold ignored: session already active");
            return Ok(None);
        }

        // Every recorder of the previous session died on its own
        if self.session.is_some() {
            self.finalize().await;
        }

        let session = Session::create(&self.output_root)?;
        self.start_session(session).map(Some)
    }

    /// Publish the manifest, then start the recorders
    ///
    /// Isolated recorders learn the session from its manifest, so a session
    /// whose manifest cannot be written is abandoned before anything starts.
    fn start_session(&mut self, session: Session) -> AppResult<Session> {
        self.attach_log(&session);

        let manifest = SessionManifest::new(&session, &self.recorders);
        if let Err(e) = write_manifest(session.dir(), &manifest) {
            tracing::error!("Failed to write manifest for session {}: {}", session.id(), e);
            if let Some(log) = &self.session_log {
                log.detach();
            }
            return Err(SessionError::from(e).into());
        }

        let started = self.supervisor.start_all(&session, &self.recorders);
        self.session = Some((session.clone(), manifest));
        started?;

        Ok(session)
    }

    /// Stop the current session; ignored when nothing is recording
    pub async fn on_released(&mut self) -> Option<Vec<TaskReport>> {
        if self.session.is_none() && !self.supervisor.is_active() {
            tracing::info!("Release ignored: no active session");
            return None;
        }
        Some(self.finalize().await)
    }

    /// Stop everything before exit
    pub async fn shutdown(&mut self) {
        if self.session.is_some() || self.supervisor.is_active() {
            tracing::info!("Shutting down active session");
            self.finalize().await;
        }
    }

    async fn finalize(&mut self) -> Vec<TaskReport> {
        let reports = self.supervisor.terminate_all().await;

        if let Some((session, mut manifest)) = self.session.take() {
            manifest.finish(reports.clone());
            if let Err(e) = write_manifest(session.dir(), &manifest) {
                tracing::warn!("Failed to finalize manifest for session {}: {}", session.id(), e);
            }
            tracing::info!("Session {} finished", session.id());
        }

        if let Some(log) = &self.session_log {
            log.detach();
        }
        reports
    }

    fn attach_log(&self, session: &Session) {
        if let Some(log) = &self.session_log {
            if let Err(e) = log.attach(&session.path_for(LOG_FILE)) {
                tracing::warn!("Failed to open {} for session {}: {}", LOG_FILE, session.id(), e);
            }
        }
    }
}
