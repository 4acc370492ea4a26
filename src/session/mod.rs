//! Capture sessions
//!
//! A session is one capture run: a unique id derived from its start time and
//! the directory every recorder writes into. The directory layout is:
//! - `video.h264`: encoded camera stream
//! - `video_timestamp.txt`: per-frame capture times
//! - `mpu.csv`: inertial samples
//! - `gps.csv`: navigation fixes
//! - `exec.log`: run log
//! - `session.json`: manifest with task outcomes

pub mod manifest;

pub use manifest::{read_manifest, write_manifest, ManifestError, SessionManifest};

use chrono::{DateTime, Utc};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use thiserror::Error;

pub const VIDEO_FILE: &str = "video.h264";
pub const VIDEO_TIMESTAMP_FILE: &str = "video_timestamp.txt";
pub const IMU_FILE: &str = "mpu.csv";
pub const GPS_FILE: &str = "gps.csv";
pub const LOG_FILE: &str = "exec.log";
pub const MANIFEST_FILE: &str = "session.json";

/// Session id format: UTC, microsecond resolution, no `:` so it is safe on
/// every filesystem the output may be copied to.
const ID_FORMAT: &str = "%Y-%m-%dT%H-%M-%S%.6fZ";

/// Start time (µs since the epoch) of the last session created by this process
static LAST_START_MICROS: AtomicI64 = AtomicI64::new(i64::MIN);

/// Session-related errors
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("failed to create session directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("system clock is out of range")]
    Clock,

    #[error("manifest error: {0}")]
    Manifest(#[from] ManifestError),
}

/// Identity and output location of one capture run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    id: String,
    started_at: DateTime<Utc>,
    dir: PathBuf,
}

impl Session {
    /// Create a new session directory under `root`
    ///
    /// Ids are strictly increasing within the process even if two sessions
    /// start in the same microsecond or the wall clock steps backwards.
    pub fn create(root: &Path) -> Result<Self, SessionError> {
        let started_at = next_start_time()?;
        let id = started_at.format(ID_FORMAT).to_string();
        let dir = root.join(&id);

        fs::create_dir_all(root).map_err(|source| SessionError::CreateDir {
            path: root.to_path_buf(),
            source,
        })?;
        fs::create_dir(&dir).map_err(|source| SessionError::CreateDir {
            path: dir.clone(),
            source,
        })?;

        tracing::info!("Created session {} at {:?}", id, dir);

        Ok(Self {
            id,
            started_at,
            dir,
        })
    }

    /// Re-open a session that another process created
    pub fn attach(dir: &Path) -> Result<Self, SessionError> {
        let manifest = read_manifest(dir)?;
        Ok(Self {
            id: manifest.id,
            started_at: manifest.started_at,
            dir: dir.to_path_buf(),
        })
    }

    /// Unique session id
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Wall-clock start time shared by every recorder
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Session directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of an artifact inside the session directory
    pub fn path_for(&self, artifact: &str) -> PathBuf {
        self.dir.join(artifact)
    }
}

fn next_start_time() -> Result<DateTime<Utc>, SessionError> {
    let now = Utc::now().timestamp_micros();
    let mut last = LAST_START_MICROS.load(Ordering::Relaxed);
    let micros = loop {
        let next = if now > last { now } else { last + 1 };
        match LAST_START_MICROS.compare_exchange_weak(last, next, Ordering::SeqCst, Ordering::Relaxed) {
            Ok(_) => break next,
            Err(actual) => last = actual,
        }
    };

    let secs = micros.div_euclid(1_000_000);
    let nanos = (micros.rem_euclid(1_000_000) * 1_000) as u32;
    DateTime::from_timestamp(secs, nanos).ok_or(SessionError::Clock)
}
