//! Session manifest read/write
//!
//! `session.json` is written when a session starts and rewritten with the
//! task outcomes when it ends. Isolated recorders read it to learn the
//! session identity instead of deriving their own.

use super::{Session, MANIFEST_FILE};
use crate::recorder::{RecorderKind, TaskReport};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

/// Manifest format tag
const FORMAT: &str = "capture-rig-v1";

/// Manifest-related errors
#[derive(Error, Debug)]
pub enum ManifestError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Missing required file: {0}")]
    MissingFile(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionManifest {
    pub version: String,
    pub format: String,
    pub id: String,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub stopped_at: Option<DateTime<Utc>>,
    pub recorders: Vec<RecorderKind>,
    #[serde(default)]
    pub tasks: Vec<TaskReport>,
}

impl SessionManifest {
    /// Manifest for a session that is about to start `recorders`
    pub fn new(session: &Session, recorders: &[RecorderKind]) -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            format: FORMAT.to_string(),
            id: session.id().to_string(),
            started_at: session.started_at(),
            stopped_at: None,
            recorders: recorders.to_vec(),
            tasks: Vec::new(),
        }
    }

    /// Record the end of the session
    pub fn finish(&mut self, tasks: Vec<TaskReport>) {
        self.stopped_at = Some(Utc::now());
        self.tasks = tasks;
    }
}

/// Read the manifest of a session directory
pub fn read_manifest(session_dir: &Path) -> Result<SessionManifest, ManifestError> {
    let path = session_dir.join(MANIFEST_FILE);
    if !path.exists() {
        return Err(ManifestError::MissingFile(MANIFEST_FILE.to_string()));
    }

    let content = fs::read_to_string(&path)?;
    Ok(serde_json::from_str(&content)?)
}

/// Write the manifest, replacing the previous one atomically
pub fn write_manifest(session_dir: &Path, manifest: &SessionManifest) -> Result<(), ManifestError> {
    let content = serde_json::to_string_pretty(manifest)?;
    let tmp = session_dir.join(format!("{MANIFEST_FILE}.tmp"));
    fs::write(&tmp, content)?;
    fs::rename(&tmp, session_dir.join(MANIFEST_FILE))?;

    tracing::debug!("Wrote manifest for session {}", manifest.id);
    Ok(())
}
