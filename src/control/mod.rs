//! Operator control
//!
//! Turns a physical (or simulated) input into `Held`/`Released` events and
//! binds them to the recording supervisor.

pub mod binding;
pub mod gpio;
pub mod stdin;

pub use binding::ControlBinding;
pub use gpio::{GpioButton, HoldDetector};
pub use stdin::StdinControl;

use crate::config::{ControlConfig, ControlSourceKind};
use crate::utils::AppResult;
use async_trait::async_trait;

/// Logical operator event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlEvent {
    /// Input held for the configured duration: start a session
    Held,
    /// Input released after a hold: stop the session
    Released,
}

/// Source of operator events
#[async_trait]
pub trait ControlSource: Send {
    /// Wait for the next event; `None` once the source is exhausted
    async fn next_event(&mut self) -> Option<ControlEvent>;
}

/// Emits one `Held` at startup and nothing afterwards
///
/// Records unconditionally from boot; meant for bench debugging.
#[derive(Debug, Default)]
pub struct AlwaysOn {
    fired: bool,
}

#[async_trait]
impl ControlSource for AlwaysOn {
    async fn next_event(&mut self) -> Option<ControlEvent> {
        if !self.fired {
            self.fired = true;
            return Some(ControlEvent::Held);
        }
        std::future::pending().await
    }
}

/// Open the configured control source
pub fn open_source(config: &ControlConfig) -> AppResult<Box<dyn ControlSource>> {
    let source: Box<dyn ControlSource> = match config.source {
        ControlSourceKind::Gpio => Box::new(GpioButton::open(config)?),
        ControlSourceKind::Stdin => Box::new(StdinControl::new()),
        ControlSourceKind::AlwaysOn => {
            tracing::warn!("Control source is always_on: recording starts immediately");
            Box::new(AlwaysOn::default())
        }
    };
    tracing::info!("Control source: {:?}", config.source);
    Ok(source)
}
