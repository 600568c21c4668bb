//! Instrument sessions and per-model command mapping.
//!
//! - [`session`]: connection lifecycle shared by both instruments
//! - [`power_supply`]: Keithley 2290-5 high-voltage supply
//! - [`picoammeter`]: Keithley 6485 picoammeter
//!
//! The public control methods on the instrument handles never return
//! errors: SCPI failures are logged through the [`EventPublisher`] and
//! reported as `false` / `None`. The `fetch_*` methods keep the `AppResult`
//! for callers that run their own retry policy (the acquisition loop).

use crate::error::DaqError;
use crate::events::EventPublisher;
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;
use tokio::sync::Mutex;

pub mod picoammeter;
pub mod power_supply;
pub mod session;

pub use picoammeter::{CurrentRange, Picoammeter};
pub use power_supply::PowerSupply;
pub use session::{InstrumentProfile, InstrumentSession, Teardown};

/// A session shared between foreground calls and the acquisition loop.
///
/// The mutex serializes all I/O on one connection.
pub type SharedSession = Arc<Mutex<InstrumentSession>>;

static ERROR_ENTRY: Lazy<Result<Regex, regex::Error>> =
    Lazy::new(|| Regex::new(r#"^\s*([+-]?\d+)\s*,\s*"?([^"]*)"?\s*$"#));

/// One entry read from an instrument's `SYST:ERR?` queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorQueueEntry {
    pub code: i32,
    pub message: String,
}

impl ErrorQueueEntry {
    /// Parse `-113,"Undefined header"` style responses.
    ///
    /// Unparseable text is kept verbatim with code `i32::MIN`, unless it
    /// says "No error".
    pub fn parse(response: &str) -> Self {
        let captures = ERROR_ENTRY
            .as_ref()
            .ok()
            .and_then(|re| re.captures(response));
        if let Some(caps) = captures {
            if let Ok(code) = caps[1].parse::<i32>() {
                return Self {
                    code,
                    message: caps[2].trim().to_string(),
                };
            }
        }
        let code = if response.contains("No error") { 0 } else { i32::MIN };
        Self {
            code,
            message: response.trim().to_string(),
        }
    }

    pub fn is_no_error(&self) -> bool {
        self.code == 0
    }
}

/// Parse a numeric SCPI response.
pub fn parse_f64_response(command: &str, response: &str) -> Result<f64, DaqError> {
    response
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|value| value.is_finite())
        .ok_or_else(|| DaqError::Parse {
            command: command.to_string(),
            response: response.to_string(),
        })
}

/// Send `commands` in order on `session`, logging the outcome.
///
/// Fails without I/O if the session is absent; stops at the first failed
/// write.
pub(crate) async fn send_logged(
    session: &SharedSession,
    events: &EventPublisher,
    operation: &str,
    commands: &[String],
    success: &str,
) -> bool {
    let mut session = session.lock().await;
    if !session.is_connected() {
        events.warn(format!("Cannot {}: {} not connected", operation, session.kind()));
        return false;
    }
    for command in commands {
        if let Err(e) = session.write(command).await {
            events.error(format!("Error {}: {}", operation, e));
            return false;
        }
    }
    events.info(success);
    true
}
