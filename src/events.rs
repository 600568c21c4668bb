//! Typed controller events and the log collaborator.
//!
//! The controller never talks to a UI directly. Everything a front end needs
//! (connection state, samples, log lines, acquisition failures, safety alerts)
//! is published as a [`ControllerEvent`] on a broadcast channel owned by an
//! [`EventPublisher`]. Front ends subscribe and drain the receiver on their own
//! schedule; a slow or absent subscriber never blocks the instruments.
//!
//! [`LogBuffer`] is the logging collaborator a log view reads from. It is
//! constructed by the application entry point and fed from a subscription, so
//! there is no hidden global logger.

use crate::measurement::Sample;
use chrono::{DateTime, Local};
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

const MAX_LOG_ENTRIES: usize = 1000;

/// Which physical instrument an event refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InstrumentKind {
    /// Keithley 2290-5 high-voltage power supply
    PowerSupply,
    /// Keithley 6485 picoammeter
    Picoammeter,
}

impl fmt::Display for InstrumentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstrumentKind::PowerSupply => write!(f, "Power supply"),
            InstrumentKind::Picoammeter => write!(f, "Picoammeter"),
        }
    }
}

/// Severity of a log event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
    /// Application lifecycle messages (startup, shutdown)
    System,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warning => "WARNING",
            LogLevel::Error => "ERROR",
            LogLevel::System => "SYSTEM",
        };
        f.write_str(label)
    }
}

/// Everything the controller reports to its collaborators.
#[derive(Debug, Clone, PartialEq)]
pub enum ControllerEvent {
    /// Emitted on every successful connect and every disconnect, including
    /// the cleanup after a failed connect.
    ConnectionChanged {
        kind: InstrumentKind,
        connected: bool,
        identity: String,
    },
    /// A completed acquisition iteration.
    Sample(Sample),
    /// A human-readable diagnostic.
    Log { level: LogLevel, message: String },
    /// The acquisition loop gave up and returned to idle.
    AcquisitionFatal { reason: String },
    /// The acquisition loop started or stopped.
    AcquisitionStateChanged { running: bool },
    /// Something a human must look at: HV may still be on, or the instrument
    /// state after disconnect is uncertain.
    SafetyAlert { kind: InstrumentKind, message: String },
    /// The HV auto-off timer was armed.
    HvTimerStarted { duration: Duration },
    /// The HV auto-off timer was disarmed; the output is left as it was.
    HvTimerStopped,
    /// The HV auto-off timer ran out and sent `HVOF`.
    HvTimerExpired { output_disabled: bool },
}

/// Publishing half of the event channel.
///
/// Cheap to clone; every clone feeds the same subscribers. Log events are
/// mirrored to `tracing` so file/console logging sees them too.
#[derive(Clone)]
pub struct EventPublisher {
    tx: broadcast::Sender<ControllerEvent>,
}

impl EventPublisher {
    /// Create a publisher whose channel buffers up to `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Subscribe to all events published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ControllerEvent> {
        self.tx.subscribe()
    }

    /// Publish an event. With no subscribers the event is dropped.
    pub fn publish(&self, event: ControllerEvent) {
        let _ = self.tx.send(event);
    }

    /// Publish a log event and mirror it to `tracing`.
    pub fn log(&self, level: LogLevel, message: impl Into<String>) {
        let message = message.into();
        match level {
            LogLevel::Debug => tracing::debug!("{}", message),
            LogLevel::Info | LogLevel::System => tracing::info!("{}", message),
            LogLevel::Warning => tracing::warn!("{}", message),
            LogLevel::Error => tracing::error!("{}", message),
        }
        self.publish(ControllerEvent::Log { level, message });
    }

    pub fn info(&self, message: impl Into<String>) {
        self.log(LogLevel::Info, message);
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.log(LogLevel::Warning, message);
    }

    pub fn error(&self, message: impl Into<String>) {
        self.log(LogLevel::Error, message);
    }

    pub fn debug(&self, message: impl Into<String>) {
        self.log(LogLevel::Debug, message);
    }

    /// Flag a safety-relevant condition. Also logged as an error.
    pub fn safety_alert(&self, kind: InstrumentKind, message: impl Into<String>) {
        let message = message.into();
        tracing::error!(instrument = %kind, "SAFETY: {}", message);
        self.publish(ControllerEvent::Log {
            level: LogLevel::Error,
            message: format!("SAFETY: {}: {}", kind, message),
        });
        self.publish(ControllerEvent::SafetyAlert { kind, message });
    }

    pub fn connection_changed(&self, kind: InstrumentKind, connected: bool, identity: &str) {
        self.publish(ControllerEvent::ConnectionChanged {
            kind,
            connected,
            identity: identity.to_string(),
        });
    }
}

impl Default for EventPublisher {
    fn default() -> Self {
        Self::new(1024)
    }
}

/// Represents a single log entry.
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub timestamp: DateTime<Local>,
    pub level: LogLevel,
    pub message: String,
}

impl fmt::Display for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} - {} - {}",
            self.timestamp.format("%Y-%m-%d %H:%M:%S"),
            self.level,
            self.message
        )
    }
}

/// A thread-safe, fixed-capacity log buffer.
#[derive(Clone)]
pub struct LogBuffer(Arc<Mutex<VecDeque<LogEntry>>>);

impl Default for LogBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl LogBuffer {
    pub fn new() -> Self {
        Self(Arc::new(Mutex::new(VecDeque::with_capacity(
            MAX_LOG_ENTRIES,
        ))))
    }

    /// Lock the buffer for reading. A poisoned lock still yields the entries.
    pub fn read(&self) -> MutexGuard<'_, VecDeque<LogEntry>> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn clear(&self) {
        self.read().clear();
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Append an entry, evicting the oldest once full.
    pub fn push(&self, level: LogLevel, message: impl Into<String>) {
        let mut buffer = self.read();
        if buffer.len() >= MAX_LOG_ENTRIES {
            buffer.pop_front();
        }
        buffer.push_back(LogEntry {
            timestamp: Local::now(),
            level,
            message: message.into(),
        });
    }

    /// Collect log events from `publisher` until the channel closes.
    ///
    /// Samples are ignored; fatal acquisition errors and safety alerts are
    /// recorded as errors so they show up even if nobody logged them.
    pub fn attach(&self, publisher: &EventPublisher) -> JoinHandle<()> {
        let mut rx = publisher.subscribe();
        let buffer = self.clone();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(ControllerEvent::Log { level, message }) => buffer.push(level, message),
                    Ok(ControllerEvent::AcquisitionFatal { reason }) => {
                        buffer.push(LogLevel::Error, format!("Acquisition stopped: {}", reason))
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => buffer.push(
                        LogLevel::Warning,
                        format!("Log view fell behind, {} events skipped", skipped),
                    ),
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}
