//! GPS capture
//!
//! Streams every navigation message that carries a fix to `gps.csv`. Rows
//! always have the full column set; fields a sentence type does not carry
//! are left empty.

use super::csv::CsvWriter;
use super::nmea::NmeaReader;
use super::serial::open_serial;
use super::traits::{NavError, NavMessage, NavSource};
use crate::recorder::{Recorder, RecorderError, RecorderKind, RecorderResult, StopFlag};
use crate::session::{Session, GPS_FILE};
use std::fs::File;
use std::io::{self, BufReader};
use std::path::Path;

pub const GPS_COLUMNS: [&str; 15] = [
    "time", "date", "lat", "lon", "alt", "altUnit", "sep", "sepUnit", "identity", "navStatus", "posMode",
    "spd", "status", "talker", "numSV",
];

/// Open the receiver's serial port as a message stream
pub fn open_receiver(device: &Path, baud: u32) -> io::Result<NmeaReader<BufReader<File>>> {
    Ok(NmeaReader::serial(BufReader::new(open_serial(device, baud)?)))
}

/// Streams GPS fixes to `gps.csv`
pub struct GpsRecorder<S> {
    source: S,
    csv: CsvWriter,
    malformed: u64,
    without_fix: u64,
}

impl<S: NavSource> GpsRecorder<S> {
    /// Create `gps.csv` in the session and write its header
    pub fn new(source: S, session: &Session) -> RecorderResult<Self> {
        let csv = CsvWriter::create(&session.path_for(GPS_FILE), &GPS_COLUMNS)?;
        Ok(Self {
            source,
            csv,
            malformed: 0,
            without_fix: 0,
        })
    }
}

fn opt<T: ToString>(value: &Option<T>) -> String {
    value.as_ref().map(ToString::to_string).unwrap_or_default()
}

/// Row in [`GPS_COLUMNS`] order
fn row(message: &NavMessage) -> [String; 15] {
    [
        message
            .time
            .map(|t| t.format("%H:%M:%S%.f").to_string())
            .unwrap_or_default(),
        message
            .date
            .map(|d| d.format("%Y-%m-%d").to_string())
            .unwrap_or_default(),
        opt(&message.lat),
        opt(&message.lon),
        opt(&message.alt),
        opt(&message.alt_unit),
        opt(&message.sep),
        opt(&message.sep_unit),
        message.identity.clone(),
        opt(&message.nav_status),
        opt(&message.pos_mode),
        opt(&message.spd),
        opt(&message.status),
        message.talker.clone(),
        opt(&message.num_sv),
    ]
}

impl<S: NavSource> Recorder for GpsRecorder<S> {
    fn kind(&self) -> RecorderKind {
        RecorderKind::Gps
    }

    fn record(&mut self, stop: &StopFlag) -> RecorderResult<()> {
        tracing::info!("GPS recording started");

        let result = loop {
            if stop.is_requested() {
                break Ok(());
            }
            match self.source.next_message() {
                Ok(Some(message)) if message.has_fix() => {
                    if let Err(e) = self.csv.write_row(&row(&message)) {
                        break Err(RecorderError::Io(e));
                    }
                }
                Ok(Some(_)) => self.without_fix += 1,
                Ok(None) => {}
                Err(NavError::Malformed(reason)) => {
                    self.malformed += 1;
                    tracing::debug!("Skipping GPS message: {}", reason);
                }
                Err(NavError::Closed) => {
                    tracing::info!("GPS stream ended");
                    break Ok(());
                }
                Err(NavError::Io(e)) => break Err(RecorderError::Io(e)),
            }
        };

        self.csv.flush()?;
        tracing::info!(
            "GPS recording ended: {} fixes, {} without fix, {} malformed",
            self.csv.rows(),
            self.without_fix,
            self.malformed
        );
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tempfile::tempdir;

    fn rows(session: &Session) -> Vec<Vec<String>> {
        let content = std::fs::read_to_string(session.path_for(GPS_FILE)).unwrap();
        let mut lines = content.lines();
        assert_eq!(lines.next().unwrap(), GPS_COLUMNS.join(","));
        lines.map(|l| l.split(',').map(str::to_string).collect()).collect()
    }

    #[test]
    fn test_records_fixes_with_aligned_columns() {
        let root = tempdir().unwrap();
        let session = Session::create(root.path()).unwrap();
        let stream = [
            "$GPGGA,092750.000,5321.6802,N,00630.3372,W,1,8,1.03,61.7,M,55.2,M,,*76",
            "$GNRMC,,V,,,,,,,,,,N,V*37",
            "$GPGSV,3,1,11,03,03,111,00",
            "$GPRMC,092750.000,A,5321.6802,N,00630.3372,W,0.02,31.66,280511,,,A*43",
            "$GPGLL,5321.6802,N,00630.3372,W,092751.500,A,A",
        ]
        .join("\r\n");

        let source = NmeaReader::new(Cursor::new(stream.into_bytes()));
        let mut recorder = GpsRecorder::new(source, &session).unwrap();
        recorder.record(&StopFlag::new()).unwrap();

        let rows = rows(&session);
        assert_eq!(rows.len(), 3);
        assert!(rows.iter().all(|r| r.len() == 15));

        let gga = &rows[0];
        assert_eq!(gga[0], "09:27:50");
        assert_eq!(gga[1], "");
        assert_eq!(gga[4], "61.7");
        assert_eq!(gga[5], "M");
        assert_eq!(gga[8], "GPGGA");
        assert_eq!(gga[12], "");
        assert_eq!(gga[13], "GP");
        assert_eq!(gga[14], "8");

        let rmc = &rows[1];
        assert_eq!(rmc[1], "2011-05-28");
        assert_eq!(rmc[4], "");
        assert_eq!(rmc[11], "0.02");
        assert_eq!(rmc[12], "A");

        assert_eq!(rows[2][0], "09:27:51.500");
        assert_eq!(rows[2][8], "GPGLL");

        assert_eq!(recorder.without_fix, 1);
        assert_eq!(recorder.malformed, 1);
    }

    struct FailingSource;

    impl NavSource for FailingSource {
        fn next_message(&mut self) -> Result<Option<NavMessage>, NavError> {
            Err(NavError::Io(io::Error::new(io::ErrorKind::BrokenPipe, "receiver unplugged")))
        }
    }

    #[test]
    fn test_stream_error_is_fatal() {
        let root = tempdir().unwrap();
        let session = Session::create(root.path()).unwrap();
        let mut recorder = GpsRecorder::new(FailingSource, &session).unwrap();

        assert!(matches!(recorder.record(&StopFlag::new()), Err(RecorderError::Io(_))));
        assert!(rows(&session).is_empty());
    }

    #[test]
    fn test_stops_on_request() {
        let root = tempdir().unwrap();
        let session = Session::create(root.path()).unwrap();
        let stop = StopFlag::new();
        stop.request();

        let source = NmeaReader::serial(Cursor::new(Vec::new()));
        let mut recorder = GpsRecorder::new(source, &session).unwrap();
        recorder.record(&stop).unwrap();
        assert!(rows(&session).is_empty());
    }
}
