//! Background acquisition loop.
//!
//! One tokio task per run reads the picoammeter (and the power supply's
//! output voltage, when attached) once per interval and publishes a
//! [`Sample`] for each completed iteration. The power supply is read from
//! inside the iteration so each instrument only ever has one writer.
//!
//! State machine: `Idle -> Running -> (Stopping) -> Idle`.
//!
//! Read failures back off for `error_backoff` instead of the interval; after
//! `max_consecutive_errors` failures in a row the loop publishes a single
//! [`ControllerEvent::AcquisitionFatal`] and returns to idle. Stopping wakes
//! the loop from its sleep; if it does not exit within `stop_grace` the task
//! is aborted.

use crate::config::AcquisitionSettings;
use crate::error::{AppResult, DaqError};
use crate::events::{ControllerEvent, EventPublisher};
use crate::instrument::{Picoammeter, PowerSupply};
use crate::measurement::Sample;
use crate::validation;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Sampling interval for a rate in Hz within the supported range.
pub fn interval_for_rate(rate_hz: f64) -> AppResult<Duration> {
    validation::is_valid_sampling_rate(rate_hz)
        .map_err(|_| DaqError::InvalidSamplingRate(rate_hz))?;
    Ok(Duration::from_secs_f64(1.0 / rate_hz))
}

/// Run state shared between the loop task and its owner.
#[derive(Debug)]
pub struct AcquisitionState {
    running: AtomicBool,
    /// Interval in seconds, stored as `f64` bits
    interval: AtomicU64,
    consecutive_errors: AtomicU32,
}

impl AcquisitionState {
    fn new(interval: Duration) -> Self {
        Self {
            running: AtomicBool::new(false),
            interval: AtomicU64::new(interval.as_secs_f64().to_bits()),
            consecutive_errors: AtomicU32::new(0),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs_f64(f64::from_bits(self.interval.load(Ordering::SeqCst)))
    }

    /// Takes effect on the loop's next sleep.
    pub fn set_interval(&self, interval: Duration) {
        self.interval
            .store(interval.as_secs_f64().to_bits(), Ordering::SeqCst);
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.consecutive_errors.load(Ordering::SeqCst)
    }
}

/// How a stop request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// Nothing was running.
    NotRunning,
    /// The loop exited on its own within the grace period.
    Graceful,
    /// The loop was aborted after the grace period.
    Forced,
}

/// Owner of the acquisition task.
pub struct Acquisition {
    state: Arc<AcquisitionState>,
    settings: AcquisitionSettings,
    events: EventPublisher,
    task: Option<JoinHandle<()>>,
    stop_tx: Option<watch::Sender<bool>>,
}

impl Acquisition {
    pub fn new(settings: AcquisitionSettings, events: EventPublisher) -> Self {
        let interval =
            interval_for_rate(settings.sampling_rate_hz).unwrap_or(Duration::from_millis(500));
        Self {
            state: Arc::new(AcquisitionState::new(interval)),
            settings,
            events,
            task: None,
            stop_tx: None,
        }
    }

    pub fn state(&self) -> Arc<AcquisitionState> {
        Arc::clone(&self.state)
    }

    pub fn is_running(&self) -> bool {
        self.state.is_running()
    }

    /// Start the loop. Fails if a run is already active.
    pub fn start(
        &mut self,
        interval: Duration,
        picoammeter: Picoammeter,
        power_supply: Option<PowerSupply>,
    ) -> AppResult<()> {
        if self.state.is_running() {
            return Err(DaqError::AcquisitionAlreadyRunning);
        }
        // A previous run that ended on its own leaves a finished handle behind.
        self.task = None;

        let (stop_tx, stop_rx) = watch::channel(false);
        self.state.set_interval(interval);
        self.state.consecutive_errors.store(0, Ordering::SeqCst);
        self.state.running.store(true, Ordering::SeqCst);

        let worker = Worker {
            state: Arc::clone(&self.state),
            settings: self.settings.clone(),
            events: self.events.clone(),
            picoammeter,
            power_supply,
            stop_rx,
        };
        self.events
            .publish(ControllerEvent::AcquisitionStateChanged { running: true });
        self.task = Some(tokio::spawn(worker.run()));
        self.stop_tx = Some(stop_tx);
        Ok(())
    }

    pub fn set_interval(&self, interval: Duration) {
        self.state.set_interval(interval);
    }

    /// Signal the loop to stop and wait up to `stop_grace` for it.
    pub async fn stop(&mut self) -> StopOutcome {
        let Some(mut task) = self.task.take() else {
            return StopOutcome::NotRunning;
        };
        let stop_tx = self.stop_tx.take();
        if task.is_finished() {
            return StopOutcome::NotRunning;
        }
        if let Some(tx) = &stop_tx {
            let _ = tx.send(true);
        }

        match tokio::time::timeout(self.settings.stop_grace, &mut task).await {
            Ok(_) => StopOutcome::Graceful,
            Err(_) => {
                task.abort();
                // Wait for the abort so any held session lock is released.
                let _ = task.await;
                self.state.running.store(false, Ordering::SeqCst);
                self.events.warn(format!(
                    "Acquisition did not stop within {:?}, forced termination",
                    self.settings.stop_grace
                ));
                self.events
                    .publish(ControllerEvent::AcquisitionStateChanged { running: false });
                StopOutcome::Forced
            }
        }
    }

    /// Abort without waiting. Used on drop paths that cannot await.
    pub fn abort(&mut self) {
        self.stop_tx = None;
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.state.running.store(false, Ordering::SeqCst);
    }
}

impl Drop for Acquisition {
    fn drop(&mut self) {
        self.abort();
    }
}

struct Worker {
    state: Arc<AcquisitionState>,
    settings: AcquisitionSettings,
    events: EventPublisher,
    picoammeter: Picoammeter,
    power_supply: Option<PowerSupply>,
    stop_rx: watch::Receiver<bool>,
}

impl Worker {
    async fn run(mut self) {
        let started = Instant::now();
        self.events.info(format!(
            "Data acquisition started with {:.3}s interval",
            self.state.interval().as_secs_f64()
        ));

        loop {
            if *self.stop_rx.borrow() {
                break;
            }
            let pause = match self.iteration(started).await {
                Ok(()) => self.state.interval(),
                Err(DaqError::NotConnected(kind)) => {
                    self.fatal(format!("{} disconnected during acquisition", kind));
                    break;
                }
                Err(e) => {
                    let count = self.state.consecutive_errors.fetch_add(1, Ordering::SeqCst) + 1;
                    self.events.error(format!("Data acquisition error: {}", e));
                    if count >= self.settings.max_consecutive_errors {
                        self.fatal(format!(
                            "Too many consecutive errors ({}), stopping acquisition",
                            count
                        ));
                        break;
                    }
                    self.settings.error_backoff
                }
            };

            let woke = tokio::select! {
                _ = tokio::time::sleep(pause) => None,
                changed = self.stop_rx.changed() => Some(changed.is_ok()),
            };
            // Sender dropped: the owner is gone.
            if woke == Some(false) {
                break;
            }
        }

        self.state.running.store(false, Ordering::SeqCst);
        self.events
            .publish(ControllerEvent::AcquisitionStateChanged { running: false });
        self.events.info("Data acquisition stopped");
    }

    async fn iteration(&self, started: Instant) -> AppResult<()> {
        let current = self.picoammeter.fetch_current().await?;
        let voltage = match &self.power_supply {
            Some(ps) => match ps.fetch_voltage().await {
                Ok(volts) => volts,
                Err(DaqError::NotConnected(_)) => 0.0,
                Err(e) => {
                    self.events
                        .warn(format!("Voltage read failed, recording 0.0 V: {}", e));
                    0.0
                }
            },
            None => 0.0,
        };

        let sample = Sample::new(started.elapsed().as_secs_f64(), current, voltage);
        self.events.publish(ControllerEvent::Sample(sample));
        self.state.consecutive_errors.store(0, Ordering::SeqCst);
        Ok(())
    }

    fn fatal(&self, reason: String) {
        self.events.error(reason.clone());
        self.events
            .publish(ControllerEvent::AcquisitionFatal { reason });
    }
}
