//! Recording system module
//!
//! This module implements the per-source recording architecture:
//! - Recorder trait for the different data sources
//! - Launchers that isolate each recorder in its own execution context
//! - Supervisor that owns the task table of the active session

pub mod channel;
pub mod launcher;
pub mod state;
pub mod supervisor;

pub use channel::{Recorder, RecorderError, RecorderFactory, RecorderKind, RecorderResult, StopFlag};
pub use launcher::{ExecutionContext, Launcher, ProcessLauncher, Spawned, ThreadLauncher};
pub use state::{SupervisorState, TaskExit, TaskOutcome, TaskReport, TaskState};
pub use supervisor::{Supervisor, SupervisorError};
