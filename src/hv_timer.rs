//! Auto-off timer for the HV output.
//!
//! [`HvTimer`] arms a background task that sends `HVOF` through the power
//! supply's shared session when the time runs out. Only one timer is armed
//! at a time; arming again replaces the previous deadline.

use crate::events::{ControllerEvent, EventPublisher};
use crate::instrument::PowerSupply;
use crate::measurement::format_duration;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

struct Armed {
    deadline: Instant,
    task: JoinHandle<()>,
}

/// Owner of the auto-off task.
pub struct HvTimer {
    armed: Mutex<Option<Armed>>,
    events: EventPublisher,
}

impl HvTimer {
    pub fn new(events: EventPublisher) -> Self {
        Self {
            armed: Mutex::new(None),
            events,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<Armed>> {
        self.armed.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Arm the timer to switch `power_supply` off after `duration`.
    pub fn start(&self, duration: Duration, power_supply: PowerSupply) {
        let deadline = Instant::now() + duration;
        let events = self.events.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            // A failed HVOF raises its own safety alert.
            let output_disabled = power_supply.disable_output().await;
            if output_disabled {
                events.info("HV timer expired - output automatically disabled");
            } else {
                events.error("HV timer expired but the output could not be disabled");
            }
            events.publish(ControllerEvent::HvTimerExpired { output_disabled });
        });

        if let Some(previous) = self.lock().replace(Armed { deadline, task }) {
            previous.task.abort();
        }
        self.events
            .info(format!("HV timer started: {}", format_duration(duration)));
        self.events
            .publish(ControllerEvent::HvTimerStarted { duration });
    }

    /// Disarm without touching the output. Returns `false` if nothing was armed.
    pub fn stop(&self) -> bool {
        match self.lock().take() {
            Some(armed) if !armed.task.is_finished() => {
                armed.task.abort();
                self.events.info("HV timer stopped");
                self.events.publish(ControllerEvent::HvTimerStopped);
                true
            }
            _ => false,
        }
    }

    /// Time left before HV is switched off, `None` when not armed.
    pub fn remaining(&self) -> Option<Duration> {
        self.lock()
            .as_ref()
            .filter(|armed| !armed.task.is_finished())
            .map(|armed| armed.deadline.saturating_duration_since(Instant::now()))
    }

    pub fn is_active(&self) -> bool {
        self.remaining().is_some()
    }
}

impl Drop for HvTimer {
    fn drop(&mut self) {
        if let Some(armed) = self.lock().take() {
            armed.task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;

    #[tokio::test(start_paused = true)]
    async fn expiry_without_session_reports_failure() {
        let events = EventPublisher::new(64);
        let mut rx = events.subscribe();
        let timer = HvTimer::new(events.clone());
        let power_supply = PowerSupply::new(&AppConfig::default(), events);

        timer.start(Duration::from_secs(3), power_supply);
        assert!(timer.is_active());
        tokio::time::sleep(Duration::from_secs(1)).await;
        let remaining = timer.remaining().unwrap();
        assert!(remaining > Duration::from_millis(1900) && remaining <= Duration::from_secs(2));
        tokio::time::sleep(Duration::from_secs(3)).await;

        assert!(!timer.is_active());
        assert!(!timer.stop());
        let mut expired = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let ControllerEvent::HvTimerExpired { output_disabled } = event {
                expired.push(output_disabled);
            }
        }
        assert_eq!(expired, vec![false]);
    }

    #[tokio::test(start_paused = true)]
    async fn rearming_replaces_the_deadline() {
        let events = EventPublisher::new(64);
        let timer = HvTimer::new(events.clone());
        let power_supply = PowerSupply::new(&AppConfig::default(), events);

        timer.start(Duration::from_secs(10), power_supply.clone());
        tokio::time::sleep(Duration::from_secs(4)).await;
        timer.start(Duration::from_secs(10), power_supply);

        assert_eq!(timer.remaining(), Some(Duration::from_secs(10)));
    }
}
