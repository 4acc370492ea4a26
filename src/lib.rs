//! capture-rig - button-triggered multi-source capture for single-board computers.
//!
//! A hold on the control input starts a session: one directory, one isolated
//! recorder each for the camera, the IMU and the GPS receiver. Releasing the
//! input stops them all. Each recorder fails on its own without taking its
//! siblings down.

pub mod capture;
pub mod config;
pub mod control;
pub mod orchestrator;
pub mod recorder;
pub mod session;
pub mod utils;

pub use config::RigConfig;
pub use orchestrator::{run, run_recorder};
pub use recorder::{RecorderKind, Supervisor};
pub use session::Session;
