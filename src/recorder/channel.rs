//! Recorder contract
//!
//! A recorder wraps one data source and writes into the session directory
//! until it is asked to stop. Recorders are blocking: they run on their own
//! execution context and never share mutable state with siblings.

use crate::session::Session;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Data source kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum RecorderKind {
    Camera,
    Imu,
    Gps,
}

impl RecorderKind {
    /// Every kind, in start order
    pub const ALL: [RecorderKind; 3] = [RecorderKind::Camera, RecorderKind::Imu, RecorderKind::Gps];

    pub fn as_str(&self) -> &'static str {
        match self {
            RecorderKind::Camera => "camera",
            RecorderKind::Imu => "imu",
            RecorderKind::Gps => "gps",
        }
    }
}

impl fmt::Display for RecorderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Recorder errors
#[derive(Error, Debug)]
pub enum RecorderError {
    #[error("Device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Sensor read failed: {0}")]
    SensorRead(String),

    #[error("Encoder error: {0}")]
    Encoder(String),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Recorder panicked: {0}")]
    Panicked(String),
}

pub type RecorderResult<T> = Result<T, RecorderError>;

/// Cooperative stop request shared between a recorder and its supervisor
#[derive(Debug, Clone, Default)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the recorder to finish
    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// One running data source
pub trait Recorder: Send {
    fn kind(&self) -> RecorderKind;

    /// Capture until `stop` is requested or the source fails
    ///
    /// Output must be flushed and closed before returning, on both the
    /// success and the error path.
    fn record(&mut self, stop: &StopFlag) -> RecorderResult<()>;
}

/// Opens recorders against real or simulated hardware
pub trait RecorderFactory: Send + Sync {
    /// Open the device for `kind` and prepare its output in `session`
    ///
    /// Failing here means the device is missing or busy; nothing has been
    /// recorded yet.
    fn open(&self, kind: RecorderKind, session: &Session) -> RecorderResult<Box<dyn Recorder>>;
}
