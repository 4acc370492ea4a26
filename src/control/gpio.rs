//! Push button on a sysfs GPIO line
//!
//! The line is configured with `edge = both` and watched from its own thread,
//! which blocks in `poll(2)` until the kernel flags a level change. Lines
//! without edge interrupts (and plain files in tests) are sampled every
//! `poll_ms` instead. A press only counts once it has been held for
//! `hold_ms`, which also debounces contact bounce.

use super::{ControlEvent, ControlSource};
use crate::config::ControlConfig;
use crate::utils::{AppError, AppResult};
use async_trait::async_trait;
use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom};
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

const SYSFS_GPIO: &str = "/sys/class/gpio";

/// Consecutive failed reads before the button is given up on
const MAX_READ_ERRORS: u32 = 50;

/// Upper bound on one `poll(2)` wait, so the watcher notices a dropped button
const EDGE_WAIT_MS: libc::c_int = 1000;

/// `statfs` magic of sysfs, the only filesystem whose `value` signals edges
const SYSFS_MAGIC: i64 = 0x6265_6572;

/// udev may take a moment to hand over a freshly exported line
const EXPORT_RETRIES: u32 = 10;
const EXPORT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Turns level changes into hold/release events
#[derive(Debug)]
pub struct HoldDetector {
    hold: Duration,
    pressed_since: Option<Instant>,
    held_emitted: bool,
}

impl HoldDetector {
    pub fn new(hold: Duration) -> Self {
        Self {
            hold,
            pressed_since: None,
            held_emitted: false,
        }
    }

    /// Feed the level observed at `now`
    pub fn update(&mut self, pressed: bool, now: Instant) -> Option<ControlEvent> {
        if pressed {
            let since = *self.pressed_since.get_or_insert(now);
            if !self.held_emitted && now.duration_since(since) >= self.hold {
                self.held_emitted = true;
                return Some(ControlEvent::Held);
            }
            return None;
        }

        self.pressed_since = None;
        if std::mem::take(&mut self.held_emitted) {
            Some(ControlEvent::Released)
        } else {
            None
        }
    }

    /// When an unchanged press becomes a hold, if one is pending
    pub fn hold_deadline(&self) -> Option<Instant> {
        match self.pressed_since {
            Some(since) if !self.held_emitted => Some(since + self.hold),
            _ => None,
        }
    }
}

pub struct GpioButton {
    levels: UnboundedReceiver<bool>,
    detector: HoldDetector,
}

impl GpioButton {
    pub fn open(config: &ControlConfig) -> AppResult<Self> {
        Self::open_at(Path::new(SYSFS_GPIO), config)
    }

    /// Export `config.gpio_pin` under a sysfs GPIO root, configure it as an
    /// input and start watching it
    pub fn open_at(root: &Path, config: &ControlConfig) -> AppResult<Self> {
        let pin = config.gpio_pin;
        let line = root.join(format!("gpio{pin}"));

        if !line.exists() {
            fs::write(root.join("export"), pin.to_string())
                .map_err(|e| AppError::Control(format!("Failed to export GPIO {pin}: {e}")))?;
        }

        let mut attempt = 0;
        loop {
            match fs::write(line.join("direction"), "in") {
                Ok(()) => break,
                Err(e) if attempt < EXPORT_RETRIES && e.kind() == io::ErrorKind::PermissionDenied => {
                    attempt += 1;
                    std::thread::sleep(EXPORT_RETRY_DELAY);
                }
                Err(e) => {
                    return Err(AppError::Control(format!(
                        "Failed to configure GPIO {pin} as input: {e}"
                    )))
                }
            }
        }

        let value = File::open(line.join("value"))
            .map_err(|e| AppError::Control(format!("Failed to open GPIO {pin} value: {e}")))?;

        let edge = match fs::write(line.join("edge"), "both") {
            Ok(()) if on_sysfs(&value) => true,
            Ok(()) => {
                tracing::info!("GPIO {} is not on sysfs, sampling every {}ms", pin, config.poll_ms);
                false
            }
            Err(e) => {
                tracing::warn!("GPIO {} has no edge interrupt ({}), sampling every {}ms", pin, e, config.poll_ms);
                false
            }
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let watcher = LineWatcher {
            value,
            active_low: config.active_low,
            edge,
            poll: Duration::from_millis(config.poll_ms.max(1)),
            levels: tx,
        };
        std::thread::Builder::new()
            .name("gpio-button".to_string())
            .spawn(move || watcher.run())
            .map_err(|e| AppError::Control(format!("Failed to start GPIO {pin} watcher: {e}")))?;

        tracing::info!(
            "GPIO {} ready (active {}, hold {}ms)",
            pin,
            if config.active_low { "low" } else { "high" },
            config.hold_ms
        );

        Ok(Self::with_levels(rx, Duration::from_millis(config.hold_ms)))
    }

    /// Button fed by an existing stream of pressed/released levels
    fn with_levels(levels: UnboundedReceiver<bool>, hold: Duration) -> Self {
        Self {
            levels,
            detector: HoldDetector::new(hold),
        }
    }
}

#[async_trait]
impl ControlSource for GpioButton {
    async fn next_event(&mut self) -> Option<ControlEvent> {
        loop {
            let deadline = self.detector.hold_deadline();
            let pressed = tokio::select! {
                level = self.levels.recv() => level?,
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now).into()), if deadline.is_some() => true,
            };

            if let Some(event) = self.detector.update(pressed, Instant::now()) {
                tracing::debug!("GPIO button event: {:?}", event);
                return Some(event);
            }
        }
    }
}

/// Reads the line level on every edge and forwards changes
struct LineWatcher {
    value: File,
    active_low: bool,
    edge: bool,
    poll: Duration,
    levels: UnboundedSender<bool>,
}

impl LineWatcher {
    fn run(mut self) {
        let mut last = None;
        let mut errors = 0;

        loop {
            match read_level(&mut self.value) {
                Ok(high) => {
                    errors = 0;
                    let pressed = high != self.active_low;
                    if last != Some(pressed) {
                        last = Some(pressed);
                        if self.levels.send(pressed).is_err() {
                            return;
                        }
                    }
                }
                Err(e) => {
                    errors += 1;
                    if errors >= MAX_READ_ERRORS {
                        tracing::error!("Giving up on GPIO button after {} read errors: {}", errors, e);
                        return;
                    }
                    tracing::debug!("Failed to read GPIO button: {}", e);
                }
            }

            if self.levels.is_closed() {
                return;
            }

            if self.edge {
                match wait_for_edge(&self.value) {
                    Ok(()) => continue,
                    Err(e) => {
                        tracing::warn!("Failed to wait for GPIO edge ({}), sampling every {:?}", e, self.poll);
                        self.edge = false;
                    }
                }
            }
            std::thread::sleep(self.poll);
        }
    }
}

/// Read `value` from the start; true when the line is high
fn read_level(value: &mut File) -> io::Result<bool> {
    let mut buf = [0u8; 8];
    value.seek(SeekFrom::Start(0))?;
    let n = value.read(&mut buf)?;
    match buf[..n].first() {
        Some(b'1') => Ok(true),
        Some(b'0') => Ok(false),
        _ => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unexpected GPIO value {:?}", String::from_utf8_lossy(&buf[..n])),
        )),
    }
}

/// Block until the kernel flags an edge or the wait times out
fn wait_for_edge(value: &File) -> io::Result<()> {
    let mut fd = libc::pollfd {
        fd: value.as_raw_fd(),
        events: libc::POLLPRI | libc::POLLERR,
        revents: 0,
    };
    // SAFETY: `fd` points at one valid pollfd for the duration of the call.
    let rc = unsafe { libc::poll(&mut fd, 1, EDGE_WAIT_MS) };
    if rc < 0 {
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
    Ok(())
}

fn on_sysfs(file: &File) -> bool {
    // SAFETY: statfs is plain data and fstatfs fills it before it is read.
    let mut stat: libc::statfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::fstatfs(file.as_raw_fd(), &mut stat) };
    rc == 0 && stat.f_type as i64 == SYSFS_MAGIC
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_short_press_is_ignored() {
        let mut detector = HoldDetector::new(Duration::from_millis(1000));
        let t0 = Instant::now();

        assert_eq!(detector.update(true, t0), None);
        assert_eq!(detector.update(true, t0 + Duration::from_millis(400)), None);
        assert_eq!(detector.update(false, t0 + Duration::from_millis(500)), None);
        assert_eq!(detector.update(true, t0 + Duration::from_millis(600)), None);
        assert_eq!(detector.update(true, t0 + Duration::from_millis(1500)), None);
    }

    #[test]
    fn test_hold_then_release() {
        let mut detector = HoldDetector::new(Duration::from_millis(1000));
        let t0 = Instant::now();

        assert_eq!(detector.update(true, t0), None);
        assert_eq!(
            detector.update(true, t0 + Duration::from_millis(1000)),
            Some(ControlEvent::Held)
        );
        // Holding longer does not repeat the event
        assert_eq!(detector.update(true, t0 + Duration::from_millis(5000)), None);
        assert_eq!(
            detector.update(false, t0 + Duration::from_millis(5010)),
            Some(ControlEvent::Released)
        );
        assert_eq!(detector.update(false, t0 + Duration::from_millis(5020)), None);
    }

    #[test]
    fn test_hold_deadline_only_while_pending() {
        let hold = Duration::from_millis(1000);
        let mut detector = HoldDetector::new(hold);
        let t0 = Instant::now();
        assert_eq!(detector.hold_deadline(), None);

        detector.update(true, t0);
        assert_eq!(detector.hold_deadline(), Some(t0 + hold));

        detector.update(true, t0 + hold);
        assert_eq!(detector.hold_deadline(), None);

        detector.update(false, t0 + hold * 2);
        assert_eq!(detector.hold_deadline(), None);
    }

    #[tokio::test]
    async fn test_steady_press_becomes_hold_without_new_levels() {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut button = GpioButton::with_levels(rx, Duration::from_millis(30));

        // One edge only; the hold must come from the deadline
        tx.send(true).unwrap();
        let held = tokio::time::timeout(Duration::from_secs(2), button.next_event()).await;
        assert_eq!(held.unwrap(), Some(ControlEvent::Held));

        tx.send(false).unwrap();
        let released = tokio::time::timeout(Duration::from_secs(2), button.next_event()).await;
        assert_eq!(released.unwrap(), Some(ControlEvent::Released));

        drop(tx);
        assert_eq!(button.next_event().await, None);
    }

    #[tokio::test]
    async fn test_bounce_shorter_than_hold_is_ignored() {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut button = GpioButton::with_levels(rx, Duration::from_millis(200));

        tx.send(true).unwrap();
        tx.send(false).unwrap();
        tx.send(true).unwrap();
        tx.send(false).unwrap();

        let event = tokio::time::timeout(Duration::from_millis(400), button.next_event()).await;
        assert!(event.is_err());
    }

    fn config() -> ControlConfig {
        ControlConfig {
            gpio_pin: 5,
            active_low: true,
            hold_ms: 30,
            poll_ms: 2,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_button_on_fake_sysfs() {
        let root = tempdir().unwrap();
        let line = root.path().join("gpio5");
        fs::create_dir(&line).unwrap();
        fs::write(line.join("value"), "1\n").unwrap();

        let mut button = GpioButton::open_at(root.path(), &config()).unwrap();
        assert_eq!(fs::read_to_string(line.join("direction")).unwrap(), "in");
        assert_eq!(fs::read_to_string(line.join("edge")).unwrap(), "both");

        // Active low: 0 is pressed
        fs::write(line.join("value"), "0\n").unwrap();
        let held = tokio::time::timeout(Duration::from_secs(2), button.next_event()).await;
        assert_eq!(held.unwrap(), Some(ControlEvent::Held));

        fs::write(line.join("value"), "1\n").unwrap();
        let released = tokio::time::timeout(Duration::from_secs(2), button.next_event()).await;
        assert_eq!(released.unwrap(), Some(ControlEvent::Released));
    }

    #[tokio::test]
    async fn test_unreadable_line_ends_source() {
        let root = tempdir().unwrap();
        let line = root.path().join("gpio5");
        fs::create_dir(&line).unwrap();
        fs::write(line.join("value"), "x\n").unwrap();

        let mut button = GpioButton::open_at(root.path(), &config()).unwrap();
        let event = tokio::time::timeout(Duration::from_secs(5), button.next_event()).await;
        assert_eq!(event.unwrap(), None);
    }

    #[test]
    fn test_missing_value_is_reported() {
        let root = tempdir().unwrap();
        fs::create_dir(root.path().join("gpio5")).unwrap();

        let err = GpioButton::open_at(root.path(), &config()).err().unwrap();
        assert_eq!(err.code(), "CONTROL_ERROR");
    }

    #[test]
    fn test_export_failure_is_reported() {
        let err = GpioButton::open_at(Path::new("/nonexistent/gpio"), &config())
            .err()
            .unwrap();
        assert_eq!(err.code(), "CONTROL_ERROR");
    }
}
