//! Capture trait definitions
//!
//! Hardware-agnostic contracts for the three data sources. Recorders are
//! written against these so drivers can be swapped (or faked in tests).

use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Three-axis reading
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Vector3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

/// One inertial sample
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ImuSample {
    /// Acceleration in m/s²
    pub accel: Vector3,

    /// Angular rate in °/s
    pub gyro: Vector3,

    /// Die temperature in °C
    pub temp: f64,
}

/// Inertial sensor errors
#[derive(Error, Debug)]
pub enum SensorError {
    /// The sample could not be read this time; the next one may succeed
    #[error("transient read failure: {0}")]
    Transient(String),

    #[error("sensor bus error: {0}")]
    Bus(#[from] std::io::Error),
}

/// Inertial sensor driver
pub trait InertialSensor: Send {
    /// Read one sample, blocking until it is available
    fn read(&mut self) -> Result<ImuSample, SensorError>;
}

/// A decoded navigation message
///
/// Field names follow the NMEA attribute names used in `gps.csv`. Any field
/// the sentence type does not carry is `None`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NavMessage {
    /// Talker id, e.g. `GP`, `GN`
    pub talker: String,

    /// Talker plus sentence type, e.g. `GNGGA`
    pub identity: String,

    pub time: Option<NaiveTime>,
    pub date: Option<NaiveDate>,

    /// Decimal degrees, negative south
    pub lat: Option<f64>,

    /// Decimal degrees, negative west
    pub lon: Option<f64>,

    /// Altitude above mean sea level
    pub alt: Option<f64>,
    pub alt_unit: Option<String>,

    /// Geoid separation
    pub sep: Option<f64>,
    pub sep_unit: Option<String>,

    pub nav_status: Option<String>,
    pub pos_mode: Option<String>,

    /// Speed over ground in knots
    pub spd: Option<f64>,

    /// Data validity (`A` valid, `V` void)
    pub status: Option<String>,

    /// Satellites used
    pub num_sv: Option<u32>,
}

impl NavMessage {
    /// Whether the message carries a position fix worth recording
    pub fn has_fix(&self) -> bool {
        self.time.is_some() && self.lat.is_some() && self.lon.is_some()
    }
}

/// Errors from a navigation message source
#[derive(Error, Debug)]
pub enum NavError {
    /// One sentence could not be decoded; the stream continues
    #[error("malformed message: {0}")]
    Malformed(String),

    /// The underlying stream ended
    #[error("navigation stream closed")]
    Closed,

    #[error("navigation stream I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// GPS receiver driver: a lazy stream of decoded messages
pub trait NavSource: Send {
    /// Next message, or `Ok(None)` if nothing complete arrived within the
    /// read timeout
    fn next_message(&mut self) -> Result<Option<NavMessage>, NavError>;
}

/// Pixel layout of frames handed to the encoder
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PixelEncoding {
    /// Uncompressed frames in the named FFmpeg pixel format
    Raw(String),
    /// Motion JPEG
    Mjpeg,
}

/// Negotiated capture format
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoFormat {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub encoding: PixelEncoding,
}

/// Camera driver
pub trait FrameSource: Send {
    fn format(&self) -> &VideoFormat;

    /// Block for the next frame; `Ok(None)` if none arrived in time
    fn next_frame(&mut self) -> std::io::Result<Option<Vec<u8>>>;
}

/// Video encoder
pub trait VideoSink: Send {
    fn write_frame(&mut self, frame: &[u8]) -> std::io::Result<()>;

    /// Flush and finalize the output; called exactly once
    fn finish(&mut self) -> std::io::Result<()>;
}
