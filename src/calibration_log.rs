/// Calibration log - one snapshot PNG per calibration point and one `log.txt`
/// line pairing the file name with its step coordinates

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::camera::Frame;

pub const LOG_FILE: &str = "log.txt";

#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationEntry {
    pub filename: String,
    pub coordinates: Vec<i64>,
}

#[derive(Debug, Clone)]
pub struct CalibrationLog {
    dir: PathBuf,
    app_name: String,
}

/// `(12, -40)` for two axes.
pub fn format_coordinates(coordinates: &[i64]) -> String {
    let parts: Vec<String> = coordinates.iter().map(|c| c.to_string()).collect();
    format!("({})", parts.join(", "))
}

impl CalibrationLog {
    pub fn new(dir: impl Into<PathBuf>, app_name: &str) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).with_context(|| format!("Failed to create calibration directory {:?}", dir))?;
        Ok(Self { dir, app_name: app_name.to_string() })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn log_path(&self) -> PathBuf {
        self.dir.join(LOG_FILE)
    }

    fn stamp(&self) -> String {
        format!("{}_{}", self.app_name, Utc::now().timestamp_millis())
    }

    /// Archive a calibration point. The PNG is written only when a frame is
    /// available; the log line is written either way. Returns the file name.
    pub fn record(&self, frame: Option<&Frame>, coordinates: &[i64]) -> Result<String> {
        let coords: Vec<String> = coordinates.iter().map(|c| c.to_string()).collect();
        let filename = format!("{}_{}.png", self.stamp(), coords.join("_"));
        match frame {
            Some(frame) => frame.save_png(&self.dir.join(&filename))?,
            None => log::warn!(target: "platescanner::calibration_log", "no frame for {}, logging coordinates only", filename),
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_path())
            .with_context(|| format!("Failed to open {:?}", self.log_path()))?;
        writeln!(file, "{}, {},", filename, format_coordinates(coordinates))
            .with_context(|| format!("Failed to append to {:?}", self.log_path()))?;

        log::info!(target: "platescanner::calibration_log", "{} at {}", filename, format_coordinates(coordinates));
        Ok(filename)
    }

    /// Operator snapshot outside calibration; not entered in the log.
    pub fn save_snapshot(&self, frame: &Frame) -> Result<PathBuf> {
        let path = self.dir.join(format!("{}.png", self.stamp()));
        frame.save_png(&path)?;
        log::info!(target: "platescanner::calibration_log", "snapshot saved to {:?}", path);
        Ok(path)
    }

    pub fn entries(&self) -> Result<Vec<CalibrationEntry>> {
        read_entries(&self.log_path())
    }
}

fn parse_line(line: &str) -> Result<CalibrationEntry> {
    let (filename, rest) = line
        .split_once(", (")
        .ok_or_else(|| anyhow!("Malformed calibration log line '{}'", line))?;
    let inner = rest
        .trim_end()
        .trim_end_matches(',')
        .strip_suffix(')')
        .ok_or_else(|| anyhow!("Malformed coordinates in '{}'", line))?;
    let coordinates = inner
        .split(',')
        .map(|c| c.trim())
        .filter(|c| !c.is_empty())
        .map(|c| c.parse::<i64>().with_context(|| format!("Bad coordinate '{}' in '{}'", c, line)))
        .collect::<Result<Vec<i64>>>()?;
    Ok(CalibrationEntry { filename: filename.to_string(), coordinates })
}

pub fn read_entries(path: &Path) -> Result<Vec<CalibrationEntry>> {
    let text = fs::read_to_string(path).with_context(|| format!("Failed to read {:?}", path))?;
    text.lines()
        .map(|l| l.trim_matches('\r'))
        .filter(|l| !l.trim().is_empty())
        .map(parse_line)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    #[test]
    fn record_appends_lines_and_writes_png() {
        let dir = tempfile::tempdir().unwrap();
        let log = CalibrationLog::new(dir.path().join("calibration_data"), "platescanner").unwrap();
        let frame = Frame::new(Array2::from_elem((8, 8), 128u8), 0);

        let first = log.record(Some(&frame), &[0, 0]).unwrap();
        let second = log.record(None, &[1500, -20]).unwrap();

        assert!(first.starts_with("platescanner_") && first.ends_with("_0_0.png"));
        assert!(second.ends_with("_1500_-20.png"));
        assert!(dir.path().join("calibration_data").join(&first).exists());
        assert!(!dir.path().join("calibration_data").join(&second).exists());

        let text = fs::read_to_string(log.log_path()).unwrap();
        assert_eq!(text.lines().count(), 2);
        assert!(text.starts_with(&format!("{}, (0, 0),", first)));

        let entries = log.entries().unwrap();
        assert_eq!(entries[1], CalibrationEntry { filename: second, coordinates: vec![1500, -20] });
    }

    #[test]
    fn legacy_crlf_lines_parse() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(LOG_FILE);
        fs::write(&path, "a.png, (1, 2),\n\rb.png, (3, 4, 5),\n\r").unwrap();
        let entries = read_entries(&path).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].coordinates, vec![3, 4, 5]);
    }

    #[test]
    fn malformed_lines_are_errors() {
        assert!(parse_line("no coordinates here").is_err());
        assert!(parse_line("x.png, (1, two),").is_err());
    }

    #[test]
    fn snapshots_stay_out_of_the_log() {
        let dir = tempfile::tempdir().unwrap();
        let log = CalibrationLog::new(dir.path(), "snap").unwrap();
        let path = log.save_snapshot(&Frame::new(Array2::zeros((3, 3)), 1)).unwrap();
        assert!(path.exists());
        assert!(!log.log_path().exists());
    }

    #[test]
    fn coordinates_format_like_tuples() {
        assert_eq!(format_coordinates(&[12, -40]), "(12, -40)");
        assert_eq!(format_coordinates(&[]), "()");
    }
}
