//! Resource transport abstractions.
//!
//! A [`ResourceManager`] opens named resources (`GPIB0::14::INSTR`) and lists
//! what is on the bus; each opened resource is a [`ResourceTransport`] with
//! plain text `write`/`query`/`close`. Transports do no retrying of their own;
//! retry policy lives in the instrument and acquisition layers above.
//!
//! Backends:
//! - [`sim`]: in-process instrument models for tests and `--simulate`
//! - [`visa`]: real hardware through the system VISA library
//!   (feature `instrument_visa`)

use anyhow::Result;
use async_trait::async_trait;
use std::time::Duration;

pub mod sim;
#[cfg(feature = "instrument_visa")]
pub mod visa;

pub use sim::{SimInstrument, SimResourceManager};

/// An open connection to one instrument.
///
/// # Contract
/// - Commands are sent without terminator; the backend appends its own
/// - `query` returns the response with surrounding whitespace trimmed
/// - Calls are synchronous from the instrument's point of view: one command
///   in flight at a time. Callers serialize access (the session mutex does).
#[async_trait]
pub trait ResourceTransport: Send + Sync {
    /// Send a command without reading a response.
    async fn write(&mut self, command: &str) -> Result<()>;

    /// Send a command and read one response line.
    async fn query(&mut self, command: &str) -> Result<String>;

    /// Release the underlying resource.
    async fn close(&mut self) -> Result<()>;

    /// Resource string this transport was opened on.
    fn resource(&self) -> &str;
}

/// Opens transports and enumerates resources.
#[async_trait]
pub trait ResourceManager: Send + Sync {
    /// Open `resource` with the given per-operation I/O timeout.
    async fn open(&self, resource: &str, timeout: Duration)
        -> Result<Box<dyn ResourceTransport>>;

    /// List the resource strings currently visible.
    async fn list_resources(&self) -> Result<Vec<String>>;
}

/// Extract the primary address from a GPIB resource string.
///
/// `GPIB0::14::INSTR` yields `Some("14")`; non-GPIB resources yield `None`.
pub fn gpib_address(resource: &str) -> Option<&str> {
    if !resource.contains("GPIB") {
        return None;
    }
    resource.split("::").nth(1).filter(|part| !part.is_empty())
}
