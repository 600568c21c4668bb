//! Keithley 6485 picoammeter.
//!
//! Connect-time defaults: zero check off, auto range on, 1 PLC integration,
//! readings only (`FORM:ELEM READ`) so `READ?` answers a bare number.

use super::session::{InstrumentProfile, InstrumentSession, Teardown};
use super::{send_logged, SharedSession};
use crate::config::AppConfig;
use crate::error::{AppResult, DaqError};
use crate::events::{EventPublisher, InstrumentKind};
use crate::transport::ResourceManager;
use async_trait::async_trait;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

struct PicoammeterProfile {
    model: String,
}

#[async_trait]
impl InstrumentProfile for PicoammeterProfile {
    fn kind(&self) -> InstrumentKind {
        InstrumentKind::Picoammeter
    }

    fn expected_model(&self) -> &str {
        &self.model
    }

    fn setup_commands(&self) -> Vec<String> {
        ["SYST:ZCH OFF", "CURR:RANG:AUTO ON", "CURR:NPLC 1", "FORM:ELEM READ"]
            .iter()
            .map(|c| c.to_string())
            .collect()
    }

    async fn safe_stop(&self, teardown: &mut Teardown<'_>) {
        match teardown.write("ABOR").await {
            Ok(()) => {
                tokio::time::sleep(teardown.timings().abort_settle).await;
                teardown.events().debug("Picoammeter measurement aborted");
            }
            Err(e) => teardown
                .events()
                .warn(format!("Error aborting picoammeter measurement: {}", e)),
        }
    }
}

/// Measurement range selection.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CurrentRange {
    Auto,
    /// Fixed upper range in amperes
    Fixed(f64),
}

impl FromStr for CurrentRange {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().eq_ignore_ascii_case("auto") {
            return Ok(CurrentRange::Auto);
        }
        s.trim()
            .parse::<f64>()
            .ok()
            .filter(|v| v.is_finite() && *v > 0.0)
            .map(CurrentRange::Fixed)
            .ok_or_else(|| format!("Invalid current range '{}': expected AUTO or amperes", s))
    }
}

impl fmt::Display for CurrentRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CurrentRange::Auto => f.write_str("AUTO"),
            CurrentRange::Fixed(amps) => write!(f, "{:E}", amps),
        }
    }
}

impl CurrentRange {
    fn commands(&self) -> Vec<String> {
        match self {
            CurrentRange::Auto => vec!["CURR:RANG:AUTO ON".to_string()],
            CurrentRange::Fixed(amps) => vec![
                "CURR:RANG:AUTO OFF".to_string(),
                format!("CURR:RANG {:E}", amps),
            ],
        }
    }
}

/// Handle to the picoammeter. Clones share one session.
#[derive(Clone)]
pub struct Picoammeter {
    session: SharedSession,
    events: EventPublisher,
}

impl Picoammeter {
    pub fn new(config: &AppConfig, events: EventPublisher) -> Self {
        let profile = PicoammeterProfile {
            model: config.instruments.picoammeter_model.clone(),
        };
        let session = InstrumentSession::new(
            Box::new(profile),
            config.disconnect.clone(),
            events.clone(),
        );
        Self {
            session: Arc::new(Mutex::new(session)),
            events,
        }
    }

    pub fn session(&self) -> SharedSession {
        Arc::clone(&self.session)
    }

    pub async fn connect(
        &self,
        manager: &dyn ResourceManager,
        resource: &str,
        timeout: Duration,
    ) -> AppResult<String> {
        self.session.lock().await.connect(manager, resource, timeout).await
    }

    pub async fn disconnect(&self) {
        self.session.lock().await.disconnect().await;
    }

    pub async fn is_connected(&self) -> bool {
        self.session.lock().await.is_connected()
    }

    pub async fn identity(&self) -> Option<String> {
        self.session.lock().await.identity().map(str::to_string)
    }

    /// One reading in amperes, or `None` when absent or on I/O failure.
    pub async fn read_current(&self) -> Option<f64> {
        match self.fetch_current().await {
            Ok(amps) => Some(amps),
            Err(DaqError::NotConnected(_)) => None,
            Err(e) => {
                self.events.error(format!("Error reading current: {}", e));
                None
            }
        }
    }

    /// One reading with the error kept, for the acquisition loop.
    pub async fn fetch_current(&self) -> AppResult<f64> {
        self.session.lock().await.query_f64("READ?").await
    }

    pub async fn set_current_range(&self, range: CurrentRange) -> bool {
        send_logged(
            &self.session,
            &self.events,
            "setting current range",
            &range.commands(),
            &format!("Current range set to {}", range),
        )
        .await
    }

    /// Integration time in power-line cycles.
    pub async fn set_integration_time(&self, nplc: f64) -> bool {
        if !(nplc.is_finite() && nplc > 0.0) {
            self.events
                .error(format!("Invalid integration time: {} NPLC", nplc));
            return false;
        }
        send_logged(
            &self.session,
            &self.events,
            "setting integration time",
            &[format!("CURR:NPLC {}", nplc)],
            &format!("Integration time set to {} NPLC", nplc),
        )
        .await
    }

    /// Zero check on, one measurement, acquire correction, zero check off.
    pub async fn perform_zero_check(&self) -> bool {
        let commands: Vec<String> = ["SYST:ZCH ON", "INIT", "SYST:ZCOR:ACQ", "SYST:ZCH OFF"]
            .iter()
            .map(|c| c.to_string())
            .collect();
        send_logged(
            &self.session,
            &self.events,
            "performing zero check",
            &commands,
            "Zero check completed",
        )
        .await
    }

    pub async fn set_auto_zero(&self, enabled: bool) -> bool {
        let state = if enabled { "ON" } else { "OFF" };
        send_logged(
            &self.session,
            &self.events,
            "setting auto zero",
            &[format!("SYST:AZER {}", state)],
            &format!("Auto zero {}", if enabled { "enabled" } else { "disabled" }),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{SimInstrument, SimResourceManager};

    const RES: &str = "GPIB0::22::INSTR";

    async fn connected() -> (Picoammeter, SimInstrument) {
        let manager = SimResourceManager::new();
        let sim = SimInstrument::keithley_6485();
        manager.attach(RES, sim.clone());
        let pico = Picoammeter::new(&AppConfig::default(), EventPublisher::new(256));
        pico.connect(&manager, RES, Duration::from_secs(5))
            .await
            .unwrap();
        sim.clear_commands();
        (pico, sim)
    }

    #[test]
    fn parses_range_selection() {
        assert_eq!("AUTO".parse::<CurrentRange>(), Ok(CurrentRange::Auto));
        assert_eq!("auto".parse::<CurrentRange>(), Ok(CurrentRange::Auto));
        assert_eq!("2e-9".parse::<CurrentRange>(), Ok(CurrentRange::Fixed(2e-9)));
        assert!("-1".parse::<CurrentRange>().is_err());
        assert!("big".parse::<CurrentRange>().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn connect_applies_measurement_defaults() {
        let manager = SimResourceManager::new();
        let sim = SimInstrument::keithley_6485();
        manager.attach(RES, sim.clone());
        let pico = Picoammeter::new(&AppConfig::default(), EventPublisher::new(256));

        pico.connect(&manager, RES, Duration::from_secs(5))
            .await
            .unwrap();

        assert!(!sim.zero_check());
        assert!(sim.auto_range());
        assert_eq!(sim.nplc(), 1.0);
        assert!(sim.commands().contains(&"FORM:ELEM READ".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn reads_current() {
        let (pico, sim) = connected().await;
        sim.set_current(2.5e-9, 0.0);
        assert_eq!(pico.read_current().await, Some(2.5e-9));
    }

    #[tokio::test(start_paused = true)]
    async fn range_and_integration_commands() {
        let (pico, sim) = connected().await;

        assert!(pico.set_current_range(CurrentRange::Fixed(2e-9)).await);
        assert!(!sim.auto_range());
        assert_eq!(sim.range(), Some(2e-9));
        assert!(pico.set_current_range(CurrentRange::Auto).await);
        assert!(sim.auto_range());

        assert!(pico.set_integration_time(10.0).await);
        assert_eq!(sim.nplc(), 10.0);
        assert!(!pico.set_integration_time(0.0).await);

        assert!(pico.set_auto_zero(false).await);
        assert!(!sim.auto_zero());
    }

    #[tokio::test(start_paused = true)]
    async fn zero_check_sequence() {
        let (pico, sim) = connected().await;

        assert!(pico.perform_zero_check().await);

        assert_eq!(
            sim.commands(),
            vec!["SYST:ZCH ON", "INIT", "SYST:ZCOR:ACQ", "SYST:ZCH OFF"]
        );
        assert!(sim.zero_corrected());
        assert!(!sim.zero_check());
    }

    #[tokio::test(start_paused = true)]
    async fn read_failure_yields_none() {
        let (pico, sim) = connected().await;
        sim.fail_on("READ?");
        assert_eq!(pico.read_current().await, None);
        assert!(matches!(
            pico.fetch_current().await,
            Err(DaqError::Transport { .. })
        ));
    }
}
