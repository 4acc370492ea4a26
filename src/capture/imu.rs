//! Inertial capture
//!
//! MPU-6050 driver over Linux i2c-dev and the recorder that streams its
//! samples to `mpu.csv`.

use super::csv::CsvWriter;
use super::traits::{ImuSample, InertialSensor, SensorError, Vector3};
use crate::recorder::{Recorder, RecorderError, RecorderKind, RecorderResult, StopFlag};
use crate::session::{Session, IMU_FILE};
use chrono::{SecondsFormat, Utc};
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::unix::io::AsRawFd;
use std::path::Path;

pub const IMU_COLUMNS: [&str; 8] = [
    "timestamp", "temp", "accel_x", "accel_y", "accel_z", "gyro_x", "gyro_y", "gyro_z",
];

/// `I2C_SLAVE` from linux/i2c-dev.h
const I2C_SLAVE: u64 = 0x0703;

const REG_PWR_MGMT_1: u8 = 0x6B;
const REG_GYRO_CONFIG: u8 = 0x1B;
const REG_ACCEL_CONFIG: u8 = 0x1C;
const REG_ACCEL_XOUT_H: u8 = 0x3B;

/// LSB per g at ±2 g
const ACCEL_SCALE: f64 = 16384.0;
/// LSB per °/s at ±250 °/s
const GYRO_SCALE: f64 = 131.0;
const STANDARD_GRAVITY: f64 = 9.80665;

/// InvenSense MPU-6050 on an i2c-dev bus
pub struct Mpu6050 {
    bus: File,
}

impl Mpu6050 {
    /// Open the bus, select the device and wake it up
    pub fn open(bus: &Path, address: u16) -> io::Result<Self> {
        let bus = OpenOptions::new().read(true).write(true).open(bus)?;

        // SAFETY: fd is valid for the lifetime of `bus`; I2C_SLAVE takes the
        // address by value.
        let rc = unsafe { libc::ioctl(bus.as_raw_fd(), I2C_SLAVE as _, address as libc::c_ulong) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }

        let mut sensor = Self { bus };
        sensor.write_register(REG_PWR_MGMT_1, 0x00)?;
        sensor.write_register(REG_ACCEL_CONFIG, 0x00)?;
        sensor.write_register(REG_GYRO_CONFIG, 0x00)?;

        tracing::info!("MPU-6050 ready at address {:#04x}", address);
        Ok(sensor)
    }

    fn write_register(&mut self, register: u8, value: u8) -> io::Result<()> {
        self.bus.write_all(&[register, value])
    }

    fn read_block(&mut self) -> io::Result<[u8; 14]> {
        self.bus.write_all(&[REG_ACCEL_XOUT_H])?;
        let mut block = [0u8; 14];
        self.bus.read_exact(&mut block)?;
        Ok(block)
    }
}

impl InertialSensor for Mpu6050 {
    fn read(&mut self) -> Result<ImuSample, SensorError> {
        match self.read_block() {
            Ok(block) => Ok(decode_block(&block)),
            Err(e) if matches!(e.kind(), io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock) => {
                Err(SensorError::Transient(e.to_string()))
            }
            Err(e) => Err(SensorError::Bus(e)),
        }
    }
}

/// Decode the 14-byte burst starting at ACCEL_XOUT_H
fn decode_block(block: &[u8; 14]) -> ImuSample {
    let word = |i: usize| i16::from_be_bytes([block[i], block[i + 1]]) as f64;
    let accel = |i: usize| word(i) / ACCEL_SCALE * STANDARD_GRAVITY;
    let gyro = |i: usize| word(i) / GYRO_SCALE;

    ImuSample {
        accel: Vector3 {
            x: accel(0),
            y: accel(2),
            z: accel(4),
        },
        temp: word(6) / 340.0 + 36.53,
        gyro: Vector3 {
            x: gyro(8),
            y: gyro(10),
            z: gyro(12),
        },
    }
}

/// Streams inertial samples to `mpu.csv`
pub struct ImuRecorder<S> {
    sensor: S,
    csv: CsvWriter,
    skipped: u64,
}

impl<S: InertialSensor> ImuRecorder<S> {
    /// Create `mpu.csv` in the session and write its header
    pub fn new(sensor: S, session: &Session) -> RecorderResult<Self> {
        let csv = CsvWriter::create(&session.path_for(IMU_FILE), &IMU_COLUMNS)?;
        Ok(Self {
            sensor,
            csv,
            skipped: 0,
        })
    }

    fn write_sample(&mut self, sample: &ImuSample) -> std::io::Result<()> {
        let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true);
        self.csv.write_row(&[
            timestamp,
            sample.temp.to_string(),
            sample.accel.x.to_string(),
            sample.accel.y.to_string(),
            sample.accel.z.to_string(),
            sample.gyro.x.to_string(),
            sample.gyro.y.to_string(),
            sample.gyro.z.to_string(),
        ])
    }
}

impl<S: InertialSensor> Recorder for ImuRecorder<S> {
    fn kind(&self) -> RecorderKind {
        RecorderKind::Imu
    }

    fn record(&mut self, stop: &StopFlag) -> RecorderResult<()> {
        tracing::info!("IMU recording started");

        let result = loop {
            if stop.is_requested() {
                break Ok(());
            }
            match self.sensor.read() {
                Ok(sample) => {
                    if let Err(e) = self.write_sample(&sample) {
                        break Err(RecorderError::Io(e));
                    }
                }
                Err(SensorError::Transient(reason)) => {
                    self.skipped += 1;
                    tracing::debug!("Skipping IMU sample: {}", reason);
                }
                Err(SensorError::Bus(e)) => {
                    break Err(RecorderError::SensorRead(e.to_string()));
                }
            }
        };

        self.csv.flush()?;
        tracing::info!(
            "IMU recording ended: {} samples, {} skipped",
            self.csv.rows(),
            self.skipped
        );
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use tempfile::tempdir;

    /// Replays scripted reads, then requests a stop
    struct ScriptedSensor {
        reads: VecDeque<Result<ImuSample, SensorError>>,
        stop: StopFlag,
    }

    impl InertialSensor for ScriptedSensor {
        fn read(&mut self) -> Result<ImuSample, SensorError> {
            let next = self.reads.pop_front();
            if self.reads.is_empty() {
                self.stop.request();
            }
            next.unwrap_or_else(|| Err(SensorError::Transient("script exhausted".to_string())))
        }
    }

    fn sample(n: f64) -> ImuSample {
        ImuSample {
            accel: Vector3 { x: n, y: n + 0.5, z: -n },
            gyro: Vector3 { x: 0.1, y: 0.2, z: 0.3 },
            temp: 25.0,
        }
    }

    fn data_rows(session: &Session) -> Vec<Vec<String>> {
        let content = std::fs::read_to_string(session.path_for(IMU_FILE)).unwrap();
        let mut lines = content.lines();
        assert_eq!(lines.next().unwrap(), IMU_COLUMNS.join(","));
        lines.map(|l| l.split(',').map(str::to_string).collect()).collect()
    }

    #[test]
    fn test_read_error_on_fifth_sample_stops_recorder() {
        let root = tempdir().unwrap();
        let session = Session::create(root.path()).unwrap();
        let stop = StopFlag::new();
        let mut reads: VecDeque<_> = (1..=4).map(|n| Ok(sample(n as f64))).collect();
        reads.push_back(Err(SensorError::Bus(io::Error::new(io::ErrorKind::Other, "remote I/O error"))));
        reads.push_back(Ok(sample(6.0)));

        let sensor = ScriptedSensor {
            reads,
            stop: stop.clone(),
        };
        let mut recorder = ImuRecorder::new(sensor, &session).unwrap();
        let err = recorder.record(&stop).unwrap_err();

        assert!(matches!(err, RecorderError::SensorRead(ref m) if m.contains("remote I/O")));
        let rows = data_rows(&session);
        assert_eq!(rows.len(), 4);
        assert!(rows.iter().all(|r| r.len() == 8));
        assert_eq!(rows[0][2], "1");
        assert_eq!(rows[0][3], "1.5");
    }

    #[test]
    fn test_transient_errors_are_skipped() {
        let root = tempdir().unwrap();
        let session = Session::create(root.path()).unwrap();
        let stop = StopFlag::new();
        let reads = VecDeque::from(vec![
            Ok(sample(1.0)),
            Err(SensorError::Transient("EINTR".to_string())),
            Ok(sample(2.0)),
            Ok(sample(3.0)),
        ]);

        let mut recorder = ImuRecorder::new(ScriptedSensor { reads, stop: stop.clone() }, &session).unwrap();
        recorder.record(&stop).unwrap();

        assert_eq!(data_rows(&session).len(), 3);
        assert_eq!(recorder.skipped, 1);
    }

    #[test]
    fn test_decode_block_scales_units() {
        let mut block = [0u8; 14];
        block[4..6].copy_from_slice(&16384i16.to_be_bytes());
        block[6..8].copy_from_slice(&0i16.to_be_bytes());
        block[8..10].copy_from_slice(&(-131i16).to_be_bytes());

        let sample = decode_block(&block);
        assert!((sample.accel.z - STANDARD_GRAVITY).abs() < 1e-9);
        assert_eq!(sample.accel.x, 0.0);
        assert!((sample.temp - 36.53).abs() < 1e-9);
        assert!((sample.gyro.x + 1.0).abs() < 1e-9);
    }
}
