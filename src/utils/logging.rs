//! Logging setup
//!
//! Console output goes to stderr. While a session is attached, every event is
//! also appended to that session's `exec.log`.

use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::sync::Arc;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Default filter when `RUST_LOG` is not set
const DEFAULT_FILTER: &str = "capture_rig=debug,info";

/// Log sink that follows the active session
///
/// Clones share the same target, so the handle given to the subscriber and
/// the one kept by the control binding switch together.
#[derive(Clone, Default)]
pub struct SessionLog {
    file: Arc<Mutex<Option<File>>>,
}

impl SessionLog {
    /// Create a detached session log
    pub fn new() -> Self {
        Self::default()
    }

    /// Start appending to `path`, replacing any previous target
    pub fn attach(&self, path: &Path) -> io::Result<()> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        *self.file.lock() = Some(file);
        Ok(())
    }

    /// Stop writing to the current target
    pub fn detach(&self) {
        if let Some(mut file) = self.file.lock().take() {
            let _ = file.flush();
        }
    }

    /// Whether a target is attached
    pub fn is_attached(&self) -> bool {
        self.file.lock().is_some()
    }
}

/// Writer handed out per event by [`SessionLog`]
pub struct SessionLogWriter {
    file: Arc<Mutex<Option<File>>>,
}

impl Write for SessionLogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if let Some(file) = self.file.lock().as_mut() {
            file.write_all(buf)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.file.lock().as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}

impl<'a> MakeWriter<'a> for SessionLog {
    type Writer = SessionLogWriter;

    fn make_writer(&'a self) -> Self::Writer {
        SessionLogWriter {
            file: self.file.clone(),
        }
    }
}

/// Install the global subscriber
pub fn init(session_log: &SessionLog) {
    let result = tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER)),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(session_log.clone()),
        )
        .try_init();

    if let Err(e) = result {
        eprintln!("logging already initialized: {e}");
    }
}
