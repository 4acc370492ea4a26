//! NMEA 0183 decoding
//!
//! Decodes the sentence types a consumer GNSS receiver emits by default
//! (GGA, RMC, GLL, GNS, VTG) into [`NavMessage`]. Anything else, and any
//! sentence with a bad checksum, is reported as an error so the caller can
//! skip it.

use super::traits::{NavError, NavMessage, NavSource};
use chrono::{NaiveDate, NaiveTime};
use std::io::{self, BufRead};
use thiserror::Error;

/// Sentence decoding errors
#[derive(Error, Debug, PartialEq, Eq)]
pub enum NmeaError {
    #[error("not an NMEA sentence")]
    NotNmea,

    #[error("checksum mismatch (expected {expected:02X}, computed {computed:02X})")]
    Checksum { expected: u8, computed: u8 },

    #[error("unsupported sentence {0}")]
    Unsupported(String),

    #[error("invalid {field} field: {value:?}")]
    InvalidField { field: &'static str, value: String },
}

/// Decode one sentence, e.g. `$GPGGA,...*47`
pub fn parse_sentence(line: &str) -> Result<NavMessage, NmeaError> {
    let line = line.trim();
    let body = line.strip_prefix('$').ok_or(NmeaError::NotNmea)?;

    let body = match body.rsplit_once('*') {
        Some((data, checksum)) => {
            let expected = u8::from_str_radix(checksum.trim(), 16).map_err(|_| NmeaError::InvalidField {
                field: "checksum",
                value: checksum.to_string(),
            })?;
            let computed = data.bytes().fold(0u8, |acc, b| acc ^ b);
            if expected != computed {
                return Err(NmeaError::Checksum { expected, computed });
            }
            data
        }
        None => body,
    };

    let fields: Vec<&str> = body.split(',').collect();
    let address = fields[0];
    if address.len() != 5 || !address.is_ascii() || address.starts_with('P') {
        return Err(NmeaError::Unsupported(address.to_string()));
    }
    let (talker, sentence) = address.split_at(2);

    let mut message = NavMessage {
        talker: talker.to_string(),
        identity: address.to_string(),
        ..Default::default()
    };
    let f = Fields(&fields[1..]);

    match sentence {
        "GGA" => {
            message.time = f.time(0)?;
            message.lat = f.coordinate(1, 2, "lat")?;
            message.lon = f.coordinate(3, 4, "lon")?;
            message.num_sv = f.number::<u32>(6, "numSV")?;
            message.alt = f.number(8, "alt")?;
            message.alt_unit = f.text(9);
            message.sep = f.number(10, "sep")?;
            message.sep_unit = f.text(11);
        }
        "RMC" => {
            message.time = f.time(0)?;
            message.status = f.text(1);
            message.lat = f.coordinate(2, 3, "lat")?;
            message.lon = f.coordinate(4, 5, "lon")?;
            message.spd = f.number(6, "spd")?;
            message.date = f.date(8)?;
            message.pos_mode = f.text(11);
            message.nav_status = f.text(12);
        }
        "GLL" => {
            message.lat = f.coordinate(0, 1, "lat")?;
            message.lon = f.coordinate(2, 3, "lon")?;
            message.time = f.time(4)?;
            message.status = f.text(5);
            message.pos_mode = f.text(6);
        }
        "GNS" => {
            message.time = f.time(0)?;
            message.lat = f.coordinate(1, 2, "lat")?;
            message.lon = f.coordinate(3, 4, "lon")?;
            message.pos_mode = f.text(5);
            message.num_sv = f.number::<u32>(6, "numSV")?;
            message.alt = f.number(8, "alt")?;
            message.sep = f.number(9, "sep")?;
            message.nav_status = f.text(12);
        }
        "VTG" => {
            message.spd = f.number(4, "spd")?;
            message.pos_mode = f.text(8);
        }
        _ => return Err(NmeaError::Unsupported(address.to_string())),
    }

    Ok(message)
}

/// Positional field accessor; missing and empty fields read as `None`
struct Fields<'a>(&'a [&'a str]);

impl<'a> Fields<'a> {
    fn raw(&self, index: usize) -> Option<&'a str> {
        self.0.get(index).copied().filter(|s| !s.is_empty())
    }

    fn text(&self, index: usize) -> Option<String> {
        self.raw(index).map(str::to_string)
    }

    /// Plain decimal only; `nan`, `inf` and exponents are rejected
    fn number<T: std::str::FromStr>(&self, index: usize, field: &'static str) -> Result<Option<T>, NmeaError> {
        self.raw(index)
            .map(|value| {
                let invalid = || NmeaError::InvalidField {
                    field,
                    value: value.to_string(),
                };
                if !is_decimal(value) {
                    return Err(invalid());
                }
                value.parse().map_err(|_| invalid())
            })
            .transpose()
    }

    /// `hhmmss[.sss]`
    fn time(&self, index: usize) -> Result<Option<NaiveTime>, NmeaError> {
        let Some(value) = self.raw(index) else {
            return Ok(None);
        };
        let invalid = || NmeaError::InvalidField {
            field: "time",
            value: value.to_string(),
        };

        let (whole, fraction) = value.split_once('.').unwrap_or((value, ""));
        if whole.len() != 6 || !whole.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }
        let part = |range: std::ops::Range<usize>| whole[range].parse::<u32>().map_err(|_| invalid());
        let nanos = if fraction.is_empty() {
            0
        } else {
            let digits: String = fraction.chars().take(9).collect();
            let scale = 10u32.pow(9 - digits.len() as u32);
            digits.parse::<u32>().map_err(|_| invalid())? * scale
        };

        NaiveTime::from_hms_nano_opt(part(0..2)?, part(2..4)?, part(4..6)?, nanos)
            .map(Some)
            .ok_or_else(invalid)
    }

    /// `ddmmyy`
    fn date(&self, index: usize) -> Result<Option<NaiveDate>, NmeaError> {
        let Some(value) = self.raw(index) else {
            return Ok(None);
        };
        let invalid = || NmeaError::InvalidField {
            field: "date",
            value: value.to_string(),
        };
        if value.len() != 6 || !value.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }
        let part = |range: std::ops::Range<usize>| value[range].parse::<u32>().map_err(|_| invalid());
        NaiveDate::from_ymd_opt(2000 + part(4..6)? as i32, part(2..4)?, part(0..2)?)
            .map(Some)
            .ok_or_else(invalid)
    }

    /// `(d)ddmm.mmmm` plus hemisphere, as signed decimal degrees
    fn coordinate(&self, index: usize, hemisphere: usize, field: &'static str) -> Result<Option<f64>, NmeaError> {
        let Some(value) = self.raw(index) else {
            return Ok(None);
        };
        let invalid = || NmeaError::InvalidField {
            field,
            value: value.to_string(),
        };

        if !is_decimal(value) {
            return Err(invalid());
        }
        let raw: f64 = value.parse().map_err(|_| invalid())?;
        if !raw.is_finite() {
            return Err(invalid());
        }
        let degrees = (raw / 100.0).trunc();
        let minutes = raw - degrees * 100.0;
        if minutes >= 60.0 || raw < 0.0 {
            return Err(invalid());
        }
        let decimal = degrees + minutes / 60.0;

        match self.raw(hemisphere) {
            Some("N") | Some("E") => Ok(Some(decimal)),
            Some("S") | Some("W") => Ok(Some(-decimal)),
            _ => Err(invalid()),
        }
    }
}

fn is_decimal(value: &str) -> bool {
    let digits = value.strip_prefix('-').unwrap_or(value);
    !digits.is_empty()
        && digits.bytes().any(|b| b.is_ascii_digit())
        && digits.bytes().all(|b| b.is_ascii_digit() || b == b'.')
}

/// Lazily decodes sentences from a byte stream
pub struct NmeaReader<R> {
    reader: R,
    buffer: Vec<u8>,

    /// A zero-length read means "no data yet" (serial read timeout) rather
    /// than end of stream
    idle_on_empty_read: bool,
}

impl<R: BufRead> NmeaReader<R> {
    /// Reader over a finite stream (file, pipe)
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buffer: Vec::new(),
            idle_on_empty_read: false,
        }
    }

    /// Reader over a serial port configured with a read timeout
    pub fn serial(reader: R) -> Self {
        Self {
            idle_on_empty_read: true,
            ..Self::new(reader)
        }
    }

    fn decode_buffered(&mut self) -> Option<Result<NavMessage, NavError>> {
        let line = String::from_utf8_lossy(&self.buffer).trim().to_string();
        self.buffer.clear();
        if line.is_empty() {
            return None;
        }
        Some(parse_sentence(&line).map_err(|e| NavError::Malformed(format!("{e}: {line}"))))
    }
}

impl<R: BufRead + Send> NavSource for NmeaReader<R> {
    fn next_message(&mut self) -> Result<Option<NavMessage>, NavError> {
        loop {
            let read = match self.reader.read_until(b'\n', &mut self.buffer) {
                Ok(read) => read,
                Err(e) if matches!(e.kind(), io::ErrorKind::Interrupted | io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock) => {
                    return Ok(None);
                }
                Err(e) => return Err(NavError::Io(e)),
            };

            if self.buffer.ends_with(b"\n") {
                match self.decode_buffered() {
                    Some(result) => return result.map(Some),
                    None => continue,
                }
            }

            if read == 0 || self.idle_on_empty_read {
                if self.idle_on_empty_read {
                    // Partial line stays buffered until the rest arrives
                    return Ok(None);
                }
                return match self.decode_buffered() {
                    Some(result) => result.map(Some),
                    None => Err(NavError::Closed),
                };
            }
        }
    }
}
