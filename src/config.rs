//! Configuration System using Figment
//!
//! This module provides strongly-typed configuration loading. Configuration is
//! loaded from:
//! 1. `config/keithley_daq.toml` (base configuration)
//! 2. Environment variables (prefixed with `KEITHLEY_DAQ_`, nested keys split on `__`)
//!
//! Every field has a default, so a missing or empty file yields the bench
//! defaults: power supply at GPIB 14, picoammeter at GPIB 22, 2 Hz sampling.
//!
//! # Example
//! ```no_run
//! use keithley_daq::config::AppConfig;
//!
//! let config = AppConfig::load()?;
//! println!("Power supply at {}", config.instruments.power_supply_resource());
//! # Ok::<(), keithley_daq::error::DaqError>(())
//! ```

use crate::error::{AppResult, DaqError};
use crate::validation;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default location of the configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "config/keithley_daq.toml";

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// GPIB addressing and identity checks
    pub instruments: InstrumentsConfig,
    /// Connect-time safety limits for the power supply
    pub safety: SafetyLimits,
    /// Acquisition loop settings
    pub acquisition: AcquisitionSettings,
    /// Safe disconnect sequence timings
    pub disconnect: DisconnectTimings,
    /// Export settings
    pub storage: StorageConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Also write `keithley_controller.YYYY-MM-DD.log` files
    pub log_to_file: bool,
    /// Directory for the log files, created on startup
    pub log_dir: PathBuf,
    /// Oldest log files beyond this count are deleted
    pub max_log_files: usize,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "Keithley Dual Controller".to_string(),
            log_level: "info".to_string(),
            log_to_file: true,
            log_dir: PathBuf::from("logs"),
            max_log_files: 5,
        }
    }
}

/// Instrument addressing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstrumentsConfig {
    /// GPIB board index used in resource strings (`GPIB<board>::<addr>::INSTR`)
    pub gpib_board: u8,
    pub power_supply_address: u8,
    pub picoammeter_address: u8,
    /// I/O timeout for normal operation
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// I/O timeout used while probing resources during a scan
    #[serde(with = "humantime_serde")]
    pub scan_timeout: Duration,
    /// Substring expected in the power supply's `*IDN?` response
    pub power_supply_model: String,
    /// Substring expected in the picoammeter's `*IDN?` response
    pub picoammeter_model: String,
}

impl Default for InstrumentsConfig {
    fn default() -> Self {
        Self {
            gpib_board: 0,
            power_supply_address: 14,
            picoammeter_address: 22,
            timeout: Duration::from_millis(5000),
            scan_timeout: Duration::from_millis(2000),
            power_supply_model: "2290-5".to_string(),
            picoammeter_model: "6485".to_string(),
        }
    }
}

impl InstrumentsConfig {
    /// VISA resource string for a GPIB address on the configured board.
    pub fn resource_for(&self, address: u8) -> String {
        format!("GPIB{}::{}::INSTR", self.gpib_board, address)
    }

    pub fn power_supply_resource(&self) -> String {
        self.resource_for(self.power_supply_address)
    }

    pub fn picoammeter_resource(&self) -> String {
        self.resource_for(self.picoammeter_address)
    }
}

/// Limits written to the power supply on every connect.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyLimits {
    pub voltage_limit_v: f64,
    pub current_limit_ma: f64,
}

impl Default for SafetyLimits {
    fn default() -> Self {
        Self {
            voltage_limit_v: 5000.0,
            current_limit_ma: 5.25,
        }
    }
}

/// Acquisition loop configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcquisitionSettings {
    /// Default sampling rate in Hz (0.1 to 10.0)
    pub sampling_rate_hz: f64,
    /// Consecutive failed reads before the loop gives up
    pub max_consecutive_errors: u32,
    /// Pause after a failed read, instead of the sampling interval
    #[serde(with = "humantime_serde")]
    pub error_backoff: Duration,
    /// How long `stop` waits before aborting the loop task
    #[serde(with = "humantime_serde")]
    pub stop_grace: Duration,
    /// Per-subscriber event buffer size
    pub event_capacity: usize,
}

impl Default for AcquisitionSettings {
    fn default() -> Self {
        Self {
            sampling_rate_hz: 2.0,
            max_consecutive_errors: 5,
            error_backoff: Duration::from_secs(1),
            stop_grace: Duration::from_secs(2),
            event_capacity: 1024,
        }
    }
}

/// Waits and retry counts of the safe disconnect sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DisconnectTimings {
    /// Pause after `*CLS` before draining the error queue
    #[serde(with = "humantime_serde")]
    pub clear_settle: Duration,
    /// Maximum `SYST:ERR?` reads per drain
    pub max_error_reads: u32,
    /// Wait after `HVOF` for the output to discharge
    #[serde(with = "humantime_serde")]
    pub discharge_wait: Duration,
    /// Wait after `ABOR` on the picoammeter
    #[serde(with = "humantime_serde")]
    pub abort_settle: Duration,
    /// Budget for the `*OPC?` ready poll
    #[serde(with = "humantime_serde")]
    pub ready_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub ready_poll: Duration,
    /// `SYST:LOC` attempts before giving up
    pub local_attempts: u32,
    #[serde(with = "humantime_serde")]
    pub local_settle: Duration,
}

impl Default for DisconnectTimings {
    fn default() -> Self {
        Self {
            clear_settle: Duration::from_millis(100),
            max_error_reads: 10,
            discharge_wait: Duration::from_secs(1),
            abort_settle: Duration::from_millis(200),
            ready_timeout: Duration::from_secs(3),
            ready_poll: Duration::from_millis(100),
            local_attempts: 3,
            local_settle: Duration::from_millis(500),
        }
    }
}

/// Export configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Output directory for exported CSV files
    pub output_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("data"),
        }
    }
}

impl AppConfig {
    /// Load configuration from `config/keithley_daq.toml` and environment variables
    ///
    /// Environment variables override the file with prefix `KEITHLEY_DAQ_`.
    /// Example: `KEITHLEY_DAQ_ACQUISITION__SAMPLING_RATE_HZ=5`
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    ///
    /// A missing file is not an error; defaults and environment still apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let config: Self = Self::figment(path.as_ref()).extract()?;
        config.validate()?;
        Ok(config)
    }

    fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("KEITHLEY_DAQ_").split("__"))
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(DaqError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }
        if self.application.log_to_file && self.application.max_log_files == 0 {
            return Err(DaqError::Configuration(
                "max_log_files must be at least 1".to_string(),
            ));
        }

        for (name, address) in [
            ("power_supply_address", self.instruments.power_supply_address),
            ("picoammeter_address", self.instruments.picoammeter_address),
        ] {
            validation::is_valid_gpib_address(address)
                .map_err(|e| DaqError::Configuration(format!("{}: {}", name, e)))?;
        }
        if self.instruments.power_supply_address == self.instruments.picoammeter_address {
            return Err(DaqError::Configuration(format!(
                "Power supply and picoammeter share GPIB address {}",
                self.instruments.power_supply_address
            )));
        }
        for (name, model) in [
            ("power_supply_model", &self.instruments.power_supply_model),
            ("picoammeter_model", &self.instruments.picoammeter_model),
        ] {
            validation::is_not_empty(model)
                .map_err(|e| DaqError::Configuration(format!("{}: {}", name, e)))?;
        }

        validation::is_valid_sampling_rate(self.acquisition.sampling_rate_hz)
            .map_err(|e| DaqError::Configuration(e.to_string()))?;
        if self.acquisition.max_consecutive_errors == 0 {
            return Err(DaqError::Configuration(
                "max_consecutive_errors must be at least 1".to_string(),
            ));
        }

        validation::is_positive_limit(self.safety.voltage_limit_v)
            .map_err(|e| DaqError::Configuration(format!("voltage_limit_v: {}", e)))?;
        validation::is_positive_limit(self.safety.current_limit_ma)
            .map_err(|e| DaqError::Configuration(format!("current_limit_ma: {}", e)))?;

        if self.disconnect.local_attempts == 0 {
            return Err(DaqError::Configuration(
                "local_attempts must be at least 1".to_string(),
            ));
        }

        Ok(())
    }

    /// Render the effective configuration as TOML.
    pub fn to_toml_string(&self) -> AppResult<String> {
        toml::to_string_pretty(self).map_err(|e| DaqError::Configuration(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_bench_setup() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.instruments.power_supply_resource(), "GPIB0::14::INSTR");
        assert_eq!(config.instruments.picoammeter_resource(), "GPIB0::22::INSTR");
        assert_eq!(config.safety.voltage_limit_v, 5000.0);
        assert_eq!(config.safety.current_limit_ma, 5.25);
        assert_eq!(config.acquisition.sampling_rate_hz, 2.0);
    }

    #[test]
    fn load_partial_file_keeps_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
            [instruments]
            power_supply_address = 5
            timeout = "3s"

            [acquisition]
            sampling_rate_hz = 5.0
            error_backoff = "250ms"
            "#
        )
        .unwrap();

        let config = AppConfig::load_from(file.path()).unwrap();
        assert_eq!(config.instruments.power_supply_address, 5);
        assert_eq!(config.instruments.picoammeter_address, 22);
        assert_eq!(config.instruments.timeout, Duration::from_secs(3));
        assert_eq!(config.acquisition.sampling_rate_hz, 5.0);
        assert_eq!(config.acquisition.error_backoff, Duration::from_millis(250));
        assert_eq!(config.acquisition.max_consecutive_errors, 5);
    }

    #[test]
    fn missing_file_yields_defaults() {
        let config = AppConfig::load_from("does/not/exist.toml").unwrap();
        assert_eq!(config.instruments.power_supply_address, 14);
    }

    #[test]
    fn rejects_out_of_range_sampling_rate() {
        let mut config = AppConfig::default();
        config.acquisition.sampling_rate_hz = 25.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_shared_address() {
        let mut config = AppConfig::default();
        config.instruments.picoammeter_address = 14;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_invalid_log_level() {
        let mut config = AppConfig::default();
        config.application.log_level = "verbose".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn log_files_are_configurable() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
            [application]
            log_dir = "/tmp/keithley-logs"
            max_log_files = 2
            "#
        )
        .unwrap();

        let mut config = AppConfig::load_from(file.path()).unwrap();
        assert!(config.application.log_to_file);
        assert_eq!(config.application.log_dir, PathBuf::from("/tmp/keithley-logs"));
        assert_eq!(config.application.max_log_files, 2);

        config.application.max_log_files = 0;
        assert!(config.validate().is_err());
        config.application.log_to_file = false;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn toml_output_round_trips() {
        let config = AppConfig::default();
        let rendered = config.to_toml_string().unwrap();
        assert!(rendered.contains("power_supply_address = 14"));
        let parsed: AppConfig = toml::from_str(&rendered).unwrap();
        assert_eq!(parsed, config);
    }
}
