//! Line-buffered CSV output
//!
//! Every row reaches the file as soon as it is written, so an abrupt stop
//! loses at most the row in flight.

use std::fs::File;
use std::io::{self, LineWriter, Write};
use std::path::Path;

pub struct CsvWriter {
    out: LineWriter<File>,
    columns: usize,
    rows: u64,
}

impl CsvWriter {
    /// Create `path` and write the header row
    pub fn create(path: &Path, header: &[&str]) -> io::Result<Self> {
        let mut writer = Self {
            out: LineWriter::new(File::create(path)?),
            columns: header.len(),
            rows: 0,
        };
        writer.write_line(header)?;
        Ok(writer)
    }

    /// Append one data row; the field count must match the header
    pub fn write_row<S: AsRef<str>>(&mut self, fields: &[S]) -> io::Result<()> {
        if fields.len() != self.columns {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("expected {} fields, got {}", self.columns, fields.len()),
            ));
        }
        self.write_line(fields)?;
        self.rows += 1;
        Ok(())
    }

    /// Data rows written so far
    pub fn rows(&self) -> u64 {
        self.rows
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.out.flush()
    }

    fn write_line<S: AsRef<str>>(&mut self, fields: &[S]) -> io::Result<()> {
        let mut line = String::new();
        for (i, field) in fields.iter().enumerate() {
            if i > 0 {
                line.push(',');
            }
            push_field(&mut line, field.as_ref());
        }
        line.push('\n');
        self.out.write_all(line.as_bytes())
    }
}

fn push_field(line: &mut String, field: &str) {
    if field.contains([',', '"', '\n', '\r']) {
        line.push('"');
        line.push_str(&field.replace('"', "\"\""));
        line.push('"');
    } else {
        line.push_str(field);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_rows_are_visible_without_flush() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out.csv");
        let mut writer = CsvWriter::create(&path, &["a", "b"]).unwrap();
        writer.write_row(&["1", "2"]).unwrap();

        // Still open: the line writer already pushed the row out
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "a,b\n1,2\n");
        assert_eq!(writer.rows(), 1);
    }

    #[test]
    fn test_quoting_and_empty_fields() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out.csv");
        let mut writer = CsvWriter::create(&path, &["a", "b", "c"]).unwrap();
        writer.write_row(&["x,y", "", "say \"hi\""]).unwrap();
        drop(writer);

        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "a,b,c\n\"x,y\",,\"say \"\"hi\"\"\"\n"
        );
    }

    #[test]
    fn test_field_count_is_enforced() {
        let dir = tempdir().unwrap();
        let mut writer = CsvWriter::create(&dir.path().join("out.csv"), &["a", "b"]).unwrap();
        let err = writer.write_row(&["only one"]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
        assert_eq!(writer.rows(), 0);
    }
}
