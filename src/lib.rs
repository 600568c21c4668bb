//! # Keithley DAQ Core Library
//!
//! Instrument control and data acquisition for a Keithley 2290-5 high-voltage
//! power supply and a Keithley 6485 picoammeter on a GPIB bus. The library
//! is headless: front ends (the bundled CLI, or a GUI) drive an
//! [`InstrumentController`] and consume the [`ControllerEvent`]s it publishes.
//!
//! ## Crate Structure
//!
//! - **`config`**: `AppConfig`, layered from defaults, a TOML file and
//!   `KEITHLEY_DAQ_*` environment variables.
//! - **`error`**: the `DaqError` enum used across the crate.
//! - **`events`**: typed controller events, the broadcast publisher and the
//!   `LogBuffer` collaborator.
//! - **`transport`**: resource manager/transport traits with a simulated
//!   backend and a VISA backend (feature `instrument_visa`).
//! - **`instrument`**: instrument sessions (connect, safe disconnect) and the
//!   power supply and picoammeter command mappings.
//! - **`acquisition`**: the background sampling loop.
//! - **`controller`**: the facade tying it all together.
//! - **`hv_timer`**: the HV auto-off timer.
//! - **`measurement`**: samples, display formatting and statistics.
//! - **`storage`**: CSV export (feature `storage_csv`).
//! - **`tracing_setup`**: `tracing-subscriber` initialization.
//! - **`validation`**: shared range checks.
//!
//! [`InstrumentController`]: controller::InstrumentController
//! [`ControllerEvent`]: events::ControllerEvent

pub mod acquisition;
pub mod config;
pub mod controller;
pub mod error;
pub mod events;
pub mod hv_timer;
pub mod instrument;
pub mod measurement;
pub mod storage;
pub mod tracing_setup;
pub mod transport;
pub mod validation;
