//! Sensor capture
//!
//! Drivers for the three data sources and the recorders that stream them
//! into a session directory.

pub mod camera;
pub mod csv;
pub mod gps;
pub mod imu;
pub mod nmea;
pub mod serial;
pub mod traits;

#[cfg(feature = "webcam")]
pub mod webcam;

pub use traits::{FrameSource, ImuSample, InertialSensor, NavMessage, NavSource, VideoFormat, VideoSink};

use crate::config::{CameraBackend, RigConfig};
use crate::recorder::{Recorder, RecorderError, RecorderFactory, RecorderKind, RecorderResult};
use crate::session::Session;
use camera::{CameraRecorder, V4l2Source};
use gps::GpsRecorder;
use imu::{ImuRecorder, Mpu6050};

/// Opens the real devices named in the configuration
///
/// Devices are opened before any output file is created, so a missing
/// device leaves nothing behind in the session directory.
pub struct HardwareFactory {
    config: RigConfig,
}

impl HardwareFactory {
    pub fn new(config: RigConfig) -> Self {
        Self { config }
    }

    fn open_camera(&self, session: &Session) -> RecorderResult<Box<dyn Recorder>> {
        let camera = &self.config.camera;
        let source: Box<dyn FrameSource> = match camera.backend {
            CameraBackend::Ffmpeg => Box::new(V4l2Source::open(camera)?),
            #[cfg(feature = "webcam")]
            CameraBackend::Nokhwa => Box::new(webcam::NokhwaSource::open(camera)?),
            #[cfg(not(feature = "webcam"))]
            CameraBackend::Nokhwa => {
                return Err(RecorderError::ConfigurationError(
                    "camera backend \"nokhwa\" requires the `webcam` feature".to_string(),
                ))
            }
        };
        Ok(Box::new(CameraRecorder::open(source, camera, session)?))
    }

    fn open_imu(&self, session: &Session) -> RecorderResult<Box<dyn Recorder>> {
        let imu = &self.config.imu;
        let sensor = Mpu6050::open(&imu.bus, imu.address).map_err(|e| {
            RecorderError::DeviceUnavailable(format!("MPU-6050 on {:?}: {e}", imu.bus))
        })?;
        Ok(Box::new(ImuRecorder::new(sensor, session)?))
    }

    fn open_gps(&self, session: &Session) -> RecorderResult<Box<dyn Recorder>> {
        let gps = &self.config.gps;
        let receiver = gps::open_receiver(&gps.device, gps.baud).map_err(|e| {
            RecorderError::DeviceUnavailable(format!("GPS receiver on {:?}: {e}", gps.device))
        })?;
        Ok(Box::new(GpsRecorder::new(receiver, session)?))
    }
}

impl RecorderFactory for HardwareFactory {
    fn open(&self, kind: RecorderKind, session: &Session) -> RecorderResult<Box<dyn Recorder>> {
        tracing::debug!("Opening {} for session {}", kind, session.id());
        match kind {
            RecorderKind::Camera => self.open_camera(session),
            RecorderKind::Imu => self.open_imu(session),
            RecorderKind::Gps => self.open_gps(session),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{GPS_FILE, IMU_FILE, VIDEO_TIMESTAMP_FILE};
    use tempfile::tempdir;

    fn missing_devices() -> RigConfig {
        let mut config = RigConfig::default();
        config.camera.device = "/dev/no-such-camera".to_string();
        config.imu.bus = "/dev/no-such-i2c".into();
        config.gps.device = "/dev/no-such-serial".into();
        config
    }

    #[test]
    fn test_missing_devices_leave_no_output() {
        let root = tempdir().unwrap();
        let session = Session::create(root.path()).unwrap();
        let factory = HardwareFactory::new(missing_devices());

        for kind in RecorderKind::ALL {
            let err = factory.open(kind, &session).err().unwrap();
            assert!(matches!(err, RecorderError::DeviceUnavailable(_)), "{kind}: {err}");
        }

        for file in [GPS_FILE, IMU_FILE, VIDEO_TIMESTAMP_FILE] {
            assert!(!session.path_for(file).exists(), "{file} created");
        }
    }

    #[cfg(not(feature = "webcam"))]
    #[test]
    fn test_nokhwa_backend_requires_feature() {
        let root = tempdir().unwrap();
        let session = Session::create(root.path()).unwrap();
        let mut config = missing_devices();
        config.camera.backend = CameraBackend::Nokhwa;

        let err = HardwareFactory::new(config)
            .open(RecorderKind::Camera, &session)
            .err()
            .unwrap();
        assert!(matches!(err, RecorderError::ConfigurationError(_)));
    }
}
