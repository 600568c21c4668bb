//! Logging setup.
//!
//! Two outputs share one `tracing` registry:
//! - the console, in pretty, compact or JSON form
//! - unless disabled, a plain-text log file under `application.log_dir`,
//!   one file per day (`keithley_controller.YYYY-MM-DD.log`), keeping at most
//!   `application.max_log_files` of them
//!
//! `RUST_LOG` overrides the configured level for both.
//!
//! # Example
//! ```no_run
//! use keithley_daq::{config::AppConfig, tracing_setup};
//! use tracing::info;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = AppConfig::load()?;
//! tracing_setup::init_from_config(&config)?;
//! info!("Application started");
//! # Ok(())
//! # }
//! ```

use crate::config::AppConfig;
use std::path::PathBuf;
use std::str::FromStr;
use tracing::{Level, Subscriber};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    fmt, layer::SubscriberExt, registry::LookupSpan, util::SubscriberInitExt, EnvFilter, Layer,
    Registry,
};

/// File name prefix of the daily log files.
pub const LOG_FILE_PREFIX: &str = "keithley_controller";

type BoxedLayer<S> = Box<dyn Layer<S> + Send + Sync>;

/// Console output format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Multi-line, colored
    Pretty,
    /// One line per event, no colors
    Compact,
    /// One JSON object per event
    Json,
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(OutputFormat::Pretty),
            "compact" => Ok(OutputFormat::Compact),
            "json" => Ok(OutputFormat::Json),
            other => Err(format!(
                "Invalid log format '{}'. Must be one of: pretty, compact, json",
                other
            )),
        }
    }
}

/// Where and how many daily log files to keep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileLogging {
    pub dir: PathBuf,
    pub max_files: usize,
}

#[derive(Debug, Clone)]
pub struct TracingConfig {
    pub level: Level,
    pub format: OutputFormat,
    /// `None` logs to the console only.
    pub file: Option<FileLogging>,
}

impl TracingConfig {
    pub fn from_app_config(config: &AppConfig) -> Result<Self, String> {
        let app = &config.application;
        let level = Level::from_str(&app.log_level).map_err(|_| {
            format!(
                "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
                app.log_level
            )
        })?;
        let file = app.log_to_file.then(|| FileLogging {
            dir: app.log_dir.clone(),
            max_files: app.max_log_files,
        });
        Ok(Self {
            level,
            format: OutputFormat::Compact,
            file,
        })
    }

    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.format = format;
        self
    }
}

fn level_filter(level: Level) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_str().to_lowercase()))
}

fn console_layer<S>(format: OutputFormat, level: Level) -> BoxedLayer<S>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    let filter = level_filter(level);
    match format {
        OutputFormat::Pretty => fmt::layer().pretty().with_filter(filter).boxed(),
        OutputFormat::Compact => fmt::layer()
            .compact()
            .with_ansi(false)
            .with_filter(filter)
            .boxed(),
        OutputFormat::Json => fmt::layer().json().with_filter(filter).boxed(),
    }
}

/// Plain-text layer writing to the daily log file in `file.dir`.
///
/// Creates the directory if needed.
pub fn file_layer<S>(file: &FileLogging, level: Level) -> Result<BoxedLayer<S>, String>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    let appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(LOG_FILE_PREFIX)
        .filename_suffix("log")
        .max_log_files(file.max_files)
        .build(&file.dir)
        .map_err(|e| format!("Failed to open log directory {}: {}", file.dir.display(), e))?;
    Ok(fmt::layer()
        .with_writer(appender)
        .with_ansi(false)
        .with_filter(level_filter(level))
        .boxed())
}

/// Initialize tracing from the application configuration
pub fn init_from_config(config: &AppConfig) -> Result<(), String> {
    init(TracingConfig::from_app_config(config)?)
}

/// Install the global subscriber.
///
/// A no-op when one is already installed, e.g. by a test harness.
pub fn init(config: TracingConfig) -> Result<(), String> {
    if tracing::dispatcher::has_been_set() {
        return Ok(());
    }
    let mut layers: Vec<BoxedLayer<Registry>> = vec![console_layer(config.format, config.level)];
    if let Some(file) = &config.file {
        layers.push(file_layer(file, config.level)?);
    }
    tracing_subscriber::registry()
        .with(layers)
        .try_init()
        .map_err(|e| format!("Failed to initialize tracing: {}", e))?;
    if let Some(file) = &config.file {
        tracing::info!(dir = %file.dir.display(), "File logging enabled");
    }
    Ok(())
}
