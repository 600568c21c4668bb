//! CLI Entry Point for keithley_daq
//!
//! Provides command-line access to the instrument controller:
//! - Scanning the GPIB bus for instruments
//! - Running an acquisition and exporting it to CSV
//! - Printing the effective configuration
//!
//! # Usage
//!
//! ```bash
//! keithley_daq scan --simulate
//! keithley_daq acquire --rate 2 --duration 30 --voltage 500 --output run.csv
//! keithley_daq --config lab.toml config
//! ```
//!
//! Instruments are always disconnected through the safe sequence on exit,
//! including on Ctrl-C.

use anyhow::{bail, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use keithley_daq::config::AppConfig;
use keithley_daq::controller::InstrumentController;
use keithley_daq::events::{ControllerEvent, EventPublisher, LogBuffer, LogLevel};
use keithley_daq::measurement::{format_current, format_voltage, CurrentStatistics, Sample};
use keithley_daq::storage::CsvExporter;
use keithley_daq::tracing_setup::{self, OutputFormat, TracingConfig};
use keithley_daq::transport::{ResourceManager, SimResourceManager};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};

#[derive(Parser)]
#[command(name = "keithley_daq")]
#[command(about = "Keithley 2290-5 / 6485 control and data acquisition", long_about = None)]
struct Cli {
    /// Configuration file (default: config/keithley_daq.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log output format: pretty, compact or json
    #[arg(long, global = true, default_value = "compact")]
    log_format: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List instruments on the GPIB bus
    Scan {
        /// Use simulated instruments
        #[arg(long)]
        simulate: bool,
    },

    /// Connect both instruments and stream readings
    Acquire {
        /// Sampling rate in Hz (0.1 to 10)
        #[arg(long)]
        rate: Option<f64>,

        /// Stop after this many seconds (default: until Ctrl-C)
        #[arg(long)]
        duration: Option<f64>,

        /// Program and enable HV at this voltage before sampling
        #[arg(long)]
        voltage: Option<f64>,

        /// CSV output file (default: timestamped file in the output directory)
        #[arg(long)]
        output: Option<PathBuf>,

        /// Use simulated instruments
        #[arg(long)]
        simulate: bool,
    },

    /// Print the effective configuration as TOML
    Config,
}

struct AcquireArgs {
    rate: Option<f64>,
    duration: Option<Duration>,
    voltage: Option<f64>,
    output: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => AppConfig::load_from(path)?,
        None => AppConfig::load()?,
    };
    let tracing_config = TracingConfig::from_app_config(&config)
        .map_err(anyhow::Error::msg)?
        .with_format(cli.log_format);
    tracing_setup::init(tracing_config).map_err(anyhow::Error::msg)?;

    match cli.command {
        Commands::Scan { simulate } => scan(config, simulate).await,
        Commands::Acquire {
            rate,
            duration,
            voltage,
            output,
            simulate,
        } => {
            let duration = duration.map(parse_duration).transpose()?;
            let args = AcquireArgs {
                rate,
                duration,
                voltage,
                output,
            };
            acquire(config, simulate, args).await
        }
        Commands::Config => {
            print!("{}", config.to_toml_string()?);
            Ok(())
        }
    }
}

/// Seconds from the command line; rejects zero, negative, NaN and overflow.
fn parse_duration(secs: f64) -> Result<Duration> {
    match Duration::try_from_secs_f64(secs) {
        Ok(duration) if !duration.is_zero() => Ok(duration),
        _ => bail!("Invalid duration: {} s", secs),
    }
}

fn resource_manager(config: &AppConfig, simulate: bool) -> Result<Arc<dyn ResourceManager>> {
    if simulate {
        println!("🔧 Using simulated instruments");
        return Ok(Arc::new(SimResourceManager::bench(
            &config.instruments.power_supply_resource(),
            &config.instruments.picoammeter_resource(),
        )));
    }
    hardware_resource_manager()
}

#[cfg(feature = "instrument_visa")]
fn hardware_resource_manager() -> Result<Arc<dyn ResourceManager>> {
    use keithley_daq::transport::visa::VisaResourceManager;
    Ok(Arc::new(VisaResourceManager::new()?))
}

#[cfg(not(feature = "instrument_visa"))]
fn hardware_resource_manager() -> Result<Arc<dyn ResourceManager>> {
    Err(keithley_daq::error::DaqError::FeatureNotEnabled("instrument_visa".to_string()).into())
}

async fn scan(config: AppConfig, simulate: bool) -> Result<()> {
    let manager = resource_manager(&config, simulate)?;
    let events = EventPublisher::new(config.acquisition.event_capacity);
    let controller = InstrumentController::new(manager, config, events);

    println!("🔍 Scanning for instruments...");
    let found = controller.scan_for_instruments().await;
    if found.is_empty() {
        println!("   No GPIB instruments found");
    }
    for (address, identity) in &found {
        println!("   GPIB {:>2}: {}", address, identity);
    }
    Ok(())
}

async fn acquire(config: AppConfig, simulate: bool, args: AcquireArgs) -> Result<()> {
    let manager = resource_manager(&config, simulate)?;
    let events = EventPublisher::new(config.acquisition.event_capacity);
    let log_buffer = LogBuffer::new();
    let _log_task = log_buffer.attach(&events);
    let mut rx = events.subscribe();
    let exporter = CsvExporter::new(&config.storage);
    let mut controller = InstrumentController::new(manager, config, events);

    let started_at = Utc::now();
    let mut samples = Vec::new();
    acquire_until(
        &mut controller,
        &mut rx,
        &args,
        &mut samples,
        tokio::signal::ctrl_c(),
    )
    .await?;

    let problems = log_buffer
        .read()
        .iter()
        .filter(|entry| entry.level >= LogLevel::Warning && entry.level != LogLevel::System)
        .count();
    if problems > 0 {
        println!("⚠️  {} warnings/errors logged during the run", problems);
    }

    if let Some(stats) = CurrentStatistics::from_samples(&samples) {
        println!();
        println!("📊 {} samples", stats.count);
        println!(
            "   Current: mean {}, min {}, max {}, σ {}",
            format_current(stats.mean),
            format_current(stats.min),
            format_current(stats.max),
            format_current(stats.std_dev)
        );
        match exporter.export(&samples, started_at, args.output.as_deref()) {
            Ok(path) => println!("💾 Saved {}", path.display()),
            Err(e) => eprintln!("❌ Export failed: {}", e),
        }
    } else {
        println!("No samples acquired");
    }
    Ok(())
}

/// Run an acquisition until it finishes or `interrupt` resolves, whichever
/// comes first, then shut the controller down. The interrupt covers every
/// phase: connecting, HV programming and sampling.
async fn acquire_until<F: Future>(
    controller: &mut InstrumentController,
    rx: &mut broadcast::Receiver<ControllerEvent>,
    args: &AcquireArgs,
    samples: &mut Vec<Sample>,
    interrupt: F,
) -> Result<()> {
    let result = tokio::select! {
        result = run_acquisition(controller, rx, args, samples) => result,
        _ = interrupt => {
            println!("\n🛑 Interrupted");
            Ok(())
        }
    };

    // Always leave HV off and the instruments in local mode.
    controller.shutdown().await;
    result
}

async fn run_acquisition(
    controller: &mut InstrumentController,
    rx: &mut broadcast::Receiver<ControllerEvent>,
    args: &AcquireArgs,
    samples: &mut Vec<Sample>,
) -> Result<()> {
    let pico_address = controller.config().instruments.picoammeter_address;
    let ps_address = controller.config().instruments.power_supply_address;
    let rate = args
        .rate
        .unwrap_or(controller.config().acquisition.sampling_rate_hz);

    let identity = controller.connect_picoammeter(pico_address).await?;
    println!("✅ Picoammeter: {}", identity);
    match controller.connect_power_supply(ps_address).await {
        Ok(identity) => println!("✅ Power supply: {}", identity),
        Err(e) if args.voltage.is_some() => return Err(e.into()),
        Err(e) => println!("⚠️  Power supply unavailable, recording 0 V: {}", e),
    }

    if let Some(volts) = args.voltage {
        if !controller.set_voltage(volts).await || !controller.enable_output().await {
            bail!("Could not program HV output to {}", format_voltage(volts));
        }
        println!("⚡ HV output on at {}", format_voltage(volts));
    }

    if !controller.start_acquisition(rate).await {
        bail!("Could not start acquisition at {} Hz", rate);
    }
    println!("▶️  Acquiring at {} Hz - Press Ctrl+C to stop", rate);

    let deadline = async {
        match args.duration {
            Some(duration) => tokio::time::sleep(duration).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = &mut deadline => break,
            event = rx.recv() => match event {
                Ok(ControllerEvent::Sample(sample)) => {
                    println!(
                        "{:>9.3} s  {:>12}  {:>10}",
                        sample.elapsed_s,
                        format_current(sample.current_a),
                        format_voltage(sample.voltage_v)
                    );
                    samples.push(sample);
                }
                Ok(ControllerEvent::AcquisitionFatal { reason }) => {
                    eprintln!("❌ {}", reason);
                    break;
                }
                Ok(ControllerEvent::SafetyAlert { kind, message }) => {
                    eprintln!("🚨 {}: {}", kind, message);
                }
                Ok(_) => {}
                Err(RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "Event receiver lagged, samples dropped from display");
                }
                Err(RecvError::Closed) => break,
            }
        }
    }

    controller.stop_acquisition().await;
    if args.voltage.is_some() {
        controller.disable_output().await;
    }
    Ok(())
}
