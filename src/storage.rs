//! CSV export of acquired samples.
//!
//! Columns: `Time (s),Current (A),Voltage (V),Timestamp`, where `Timestamp`
//! is the run start in UNIX seconds plus the sample's elapsed time.
//! Requires the `storage_csv` feature.

use crate::config::StorageConfig;
use crate::error::{AppResult, DaqError};
use crate::measurement::Sample;
use chrono::{DateTime, Local, Utc};
use std::path::{Path, PathBuf};

/// Header row of exported files.
pub const CSV_HEADER: [&str; 4] = ["Time (s)", "Current (A)", "Voltage (V)", "Timestamp"];

/// Writes sample sets to CSV files under a configured directory.
#[derive(Debug, Clone)]
pub struct CsvExporter {
    output_dir: PathBuf,
}

impl CsvExporter {
    pub fn new(config: &StorageConfig) -> Self {
        Self {
            output_dir: config.output_dir.clone(),
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// `keithley_data_YYYYMMDD_HHMMSS.csv`
    pub fn default_file_name(now: DateTime<Local>) -> String {
        format!("keithley_data_{}.csv", now.format("%Y%m%d_%H%M%S"))
    }

    /// Export to `path`, or to a timestamped file in the output directory.
    ///
    /// Returns the path written. Zero samples is an error.
    pub fn export(
        &self,
        samples: &[Sample],
        started_at: DateTime<Utc>,
        path: Option<&Path>,
    ) -> AppResult<PathBuf> {
        if samples.is_empty() {
            return Err(DaqError::Storage("No data to export".to_string()));
        }
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => {
                std::fs::create_dir_all(&self.output_dir)
                    .map_err(|e| DaqError::Storage(e.to_string()))?;
                self.output_dir.join(Self::default_file_name(Local::now()))
            }
        };
        write_csv(&path, samples, started_at)?;
        tracing::info!(path = %path.display(), samples = samples.len(), "Exported samples to CSV");
        Ok(path)
    }
}

#[cfg(feature = "storage_csv")]
fn write_csv(path: &Path, samples: &[Sample], started_at: DateTime<Utc>) -> AppResult<()> {
    let start = started_at.timestamp_micros() as f64 / 1e6;
    let mut writer = csv::Writer::from_path(path)
        .map_err(|e| DaqError::Storage(format!("Failed to create CSV file: {}", e)))?;
    writer
        .write_record(CSV_HEADER)
        .map_err(|e| DaqError::Storage(e.to_string()))?;
    for sample in samples {
        writer
            .write_record([
                sample.elapsed_s.to_string(),
                sample.current_a.to_string(),
                sample.voltage_v.to_string(),
                (start + sample.elapsed_s).to_string(),
            ])
            .map_err(|e| DaqError::Storage(e.to_string()))?;
    }
    writer
        .flush()
        .map_err(|e| DaqError::Storage(e.to_string()))
}

#[cfg(not(feature = "storage_csv"))]
fn write_csv(_path: &Path, _samples: &[Sample], _started_at: DateTime<Utc>) -> AppResult<()> {
    Err(DaqError::FeatureNotEnabled("storage_csv".to_string()))
}

#[cfg(all(test, feature = "storage_csv"))]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn writes_header_and_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.csv");
        let exporter = CsvExporter::new(&StorageConfig {
            output_dir: dir.path().to_path_buf(),
        });
        let start = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let samples = [Sample::new(0.0, 2.5e-9, 0.0), Sample::new(0.5, 2.6e-9, 1500.0)];

        let written = exporter.export(&samples, start, Some(&path)).unwrap();

        assert_eq!(written, path);
        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "Time (s),Current (A),Voltage (V),Timestamp");
        assert_eq!(lines[1], "0,0.0000000025,0,1700000000");
        assert_eq!(lines[2], "0.5,0.0000000026,1500,1700000000.5");
    }

    #[test]
    fn empty_export_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let exporter = CsvExporter::new(&StorageConfig {
            output_dir: dir.path().to_path_buf(),
        });
        assert!(matches!(
            exporter.export(&[], Utc::now(), None),
            Err(DaqError::Storage(_))
        ));
    }

    #[test]
    fn default_name_goes_in_output_dir() {
        let dir = tempfile::tempdir().unwrap();
        let exporter = CsvExporter::new(&StorageConfig {
            output_dir: dir.path().join("data"),
        });
        let path = exporter
            .export(&[Sample::new(0.0, 1e-9, 0.0)], Utc::now(), None)
            .unwrap();
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("keithley_data_"));
        assert!(name.ends_with(".csv"));
        assert_eq!(name.len(), "keithley_data_20240101_120000.csv".len());
        assert!(path.starts_with(dir.path().join("data")));
    }
}
