//! Shared utilities: errors and logging

pub mod error;
pub mod logging;

pub use error::{AppError, AppResult};
pub use logging::SessionLog;
