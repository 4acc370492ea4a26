//! Rig configuration
//!
//! Every field has a default matching the reference hardware (Raspberry Pi
//! camera on V4L2, MPU-6050 on I2C bus 1, serial GPS on the UART), so the
//! TOML file only needs to list what differs.

use crate::recorder::RecorderKind;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Configuration loading errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

/// How each recorder is isolated from the orchestrator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Isolation {
    /// One child process per recorder
    Process,
    /// One OS thread per recorder, behind a panic boundary
    Thread,
}

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RigConfig {
    /// Directory that receives one sub-directory per session
    pub output_dir: PathBuf,

    /// Isolation unit for recorders
    pub isolation: Isolation,

    /// Grace period for recorders to finish after a stop request
    pub stop_timeout_ms: u64,

    /// Recorders started for every session
    pub recorders: Vec<RecorderKind>,

    pub control: ControlConfig,
    pub camera: CameraConfig,
    pub imu: ImuConfig,
    pub gps: GpsConfig,
}

impl Default for RigConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("recordings"),
            isolation: Isolation::Process,
            stop_timeout_ms: 5000,
            recorders: RecorderKind::ALL.to_vec(),
            control: ControlConfig::default(),
            camera: CameraConfig::default(),
            imu: ImuConfig::default(),
            gps: GpsConfig::default(),
        }
    }
}

impl RigConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: RigConfig = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        tracing::debug!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    /// Load from `path` when given, defaults otherwise
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    /// Grace period as a [`Duration`]
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}

/// Where control events come from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlSourceKind {
    /// Push button on a GPIO line
    Gpio,
    /// `start` / `stop` lines on standard input
    Stdin,
    /// Start one session immediately and keep it until shutdown
    AlwaysOn,
}

/// Physical control settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    pub source: ControlSourceKind,

    /// BCM GPIO number of the button
    pub gpio_pin: u32,

    /// Button pulls the line low when pressed
    pub active_low: bool,

    /// How long the button must stay pressed to count as held
    pub hold_ms: u64,

    /// Sampling period for a GPIO line that cannot signal edges
    pub poll_ms: u64,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            source: ControlSourceKind::Gpio,
            gpio_pin: 17,
            active_low: true,
            hold_ms: 1000,
            poll_ms: 10,
        }
    }
}

/// Frame source implementation for the camera
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CameraBackend {
    /// FFmpeg reading the V4L2 device
    Ffmpeg,
    /// nokhwa (requires the `webcam` feature)
    Nokhwa,
}

/// Camera settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    pub backend: CameraBackend,
    pub device: String,
    pub width: u32,
    pub height: u32,
    pub fps: u32,

    /// Target H.264 bitrate in bits per second
    pub bitrate: u32,

    /// Burn the wall-clock time into every frame
    pub overlay_timestamp: bool,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            backend: CameraBackend::Ffmpeg,
            device: "/dev/video0".to_string(),
            width: 1280,
            height: 720,
            fps: 30,
            bitrate: 10_000_000,
            overlay_timestamp: true,
        }
    }
}

/// Inertial sensor settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImuConfig {
    /// i2c-dev character device
    pub bus: PathBuf,

    /// 7-bit slave address
    pub address: u16,
}

impl Default for ImuConfig {
    fn default() -> Self {
        Self {
            bus: PathBuf::from("/dev/i2c-1"),
            address: 0x68,
        }
    }
}

/// GPS receiver settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GpsConfig {
    pub device: PathBuf,
    pub baud: u32,
}

impl Default for GpsConfig {
    fn default() -> Self {
        Self {
            device: PathBuf::from("/dev/serial0"),
            baud: 9600,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults_match_reference_rig() {
        let config = RigConfig::default();
        assert_eq!(config.isolation, Isolation::Process);
        assert_eq!(config.recorders, RecorderKind::ALL.to_vec());
        assert_eq!(config.imu.address, 0x68);
        assert_eq!(config.camera.width, 1280);
        assert_eq!(config.camera.height, 720);
        assert_eq!(config.stop_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("rig.toml");
        std::fs::write(
            &path,
            r#"
output_dir = "/data/rides"
isolation = "thread"
recorders = ["imu", "gps"]

[control]
source = "stdin"

[gps]
baud = 38400
"#,
        )
        .unwrap();

        let config = RigConfig::load(&path).unwrap();
        assert_eq!(config.output_dir, PathBuf::from("/data/rides"));
        assert_eq!(config.isolation, Isolation::Thread);
        assert_eq!(config.recorders, vec![RecorderKind::Imu, RecorderKind::Gps]);
        assert_eq!(config.control.source, ControlSourceKind::Stdin);
        assert_eq!(config.control.hold_ms, 1000);
        assert_eq!(config.gps.baud, 38400);
        assert_eq!(config.gps.device, PathBuf::from("/dev/serial0"));
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let dir = tempdir().unwrap();
        let err = RigConfig::load_or_default(Some(&dir.path().join("absent.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
        assert!(RigConfig::load_or_default(None).is_ok());
    }

    #[test]
    fn test_bad_toml_is_reported() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("rig.toml");
        std::fs::write(&path, "isolation = \"fork\"").unwrap();
        assert!(matches!(RigConfig::load(&path), Err(ConfigError::Parse { .. })));
    }
}
