//! Controller facade.
//!
//! [`InstrumentController`] owns the power supply, the picoammeter and the
//! acquisition loop, and is the single entry point front ends call into.
//! It holds no UI state: everything observable goes out as
//! [`ControllerEvent`]s on the publisher passed in at construction.

use crate::acquisition::{interval_for_rate, Acquisition, AcquisitionState, StopOutcome};
use crate::config::AppConfig;
use crate::error::{AppResult, DaqError};
use crate::events::{ControllerEvent, EventPublisher, InstrumentKind, LogLevel};
use crate::hv_timer::HvTimer;
use crate::instrument::{CurrentRange, Picoammeter, PowerSupply};
use crate::transport::{gpib_address, ResourceManager};
use crate::validation;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// Identity recorded for resources that open but do not answer `*IDN?`.
pub const UNKNOWN_INSTRUMENT: &str = "Unknown instrument";

/// Facade over both instruments and the acquisition loop.
pub struct InstrumentController {
    manager: Arc<dyn ResourceManager>,
    config: AppConfig,
    events: EventPublisher,
    power_supply: PowerSupply,
    picoammeter: Picoammeter,
    acquisition: Acquisition,
    hv_timer: HvTimer,
}

impl InstrumentController {
    pub fn new(manager: Arc<dyn ResourceManager>, config: AppConfig, events: EventPublisher) -> Self {
        let power_supply = PowerSupply::new(&config, events.clone());
        let picoammeter = Picoammeter::new(&config, events.clone());
        let acquisition = Acquisition::new(config.acquisition.clone(), events.clone());
        let hv_timer = HvTimer::new(events.clone());
        Self {
            manager,
            config,
            events,
            power_supply,
            picoammeter,
            acquisition,
            hv_timer,
        }
    }

    pub fn events(&self) -> &EventPublisher {
        &self.events
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ControllerEvent> {
        self.events.subscribe()
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn power_supply(&self) -> &PowerSupply {
        &self.power_supply
    }

    pub fn picoammeter(&self) -> &Picoammeter {
        &self.picoammeter
    }

    // ---- connection ----

    pub async fn connect_power_supply(&self, address: u8) -> AppResult<String> {
        let resource = self.resource_for(address)?;
        self.power_supply
            .connect(self.manager.as_ref(), &resource, self.config.instruments.timeout)
            .await
    }

    pub async fn connect_picoammeter(&self, address: u8) -> AppResult<String> {
        let resource = self.resource_for(address)?;
        self.picoammeter
            .connect(self.manager.as_ref(), &resource, self.config.instruments.timeout)
            .await
    }

    fn resource_for(&self, address: u8) -> AppResult<String> {
        validation::is_valid_gpib_address(address).map_err(|_| DaqError::InvalidAddress(address))?;
        Ok(self.config.instruments.resource_for(address))
    }

    pub async fn disconnect_power_supply(&self) {
        self.hv_timer.stop();
        self.power_supply.disconnect().await;
    }

    /// Stops a running acquisition first; the loop reads this instrument.
    pub async fn disconnect_picoammeter(&mut self) {
        if self.acquisition.is_running() {
            self.stop_acquisition().await;
        }
        self.picoammeter.disconnect().await;
    }

    /// Stop acquisition, then disconnect each instrument independently.
    pub async fn disconnect_all_instruments(&mut self) {
        if self.acquisition.is_running() {
            self.stop_acquisition().await;
        }
        self.disconnect_power_supply().await;
        self.picoammeter.disconnect().await;
    }

    pub async fn is_power_supply_connected(&self) -> bool {
        self.power_supply.is_connected().await
    }

    pub async fn is_picoammeter_connected(&self) -> bool {
        self.picoammeter.is_connected().await
    }

    /// Query `*IDN?` on every GPIB resource the manager lists.
    ///
    /// Keys are primary addresses. Resources that open but do not identify
    /// are recorded as [`UNKNOWN_INSTRUMENT`]; resources that fail to open
    /// are logged and skipped.
    pub async fn scan_for_instruments(&self) -> BTreeMap<u8, String> {
        let mut found = BTreeMap::new();
        let resources = match self.manager.list_resources().await {
            Ok(resources) => resources,
            Err(e) => {
                self.events
                    .error(format!("Error scanning for instruments: {:#}", e));
                return found;
            }
        };

        for resource in resources {
            let Some(address) = gpib_address(&resource).and_then(|a| a.parse::<u8>().ok()) else {
                continue;
            };
            let mut transport = match self
                .manager
                .open(&resource, self.config.instruments.scan_timeout)
                .await
            {
                Ok(transport) => transport,
                Err(e) => {
                    self.events
                        .warn(format!("Error scanning {}: {:#}", resource, e));
                    continue;
                }
            };
            let identity = match transport.query("*IDN?").await {
                Ok(idn) => idn.trim().to_string(),
                Err(_) => UNKNOWN_INSTRUMENT.to_string(),
            };
            if let Err(e) = transport.close().await {
                self.events
                    .debug(format!("Error closing {} after scan: {}", resource, e));
            }
            self.events
                .info(format!("Found at GPIB address {}: {}", address, identity));
            found.insert(address, identity);
        }
        found
    }

    // ---- power supply ----

    pub async fn set_voltage(&self, volts: f64) -> bool {
        self.power_supply.set_voltage(volts).await
    }

    pub async fn set_voltage_limit(&self, volts: f64) -> bool {
        self.power_supply.set_voltage_limit(volts).await
    }

    pub async fn set_current_limit(&self, milliamps: f64) -> bool {
        self.power_supply.set_current_limit(milliamps).await
    }

    pub async fn enable_output(&self) -> bool {
        self.power_supply.enable_output().await
    }

    /// Also disarms the HV timer.
    pub async fn disable_output(&self) -> bool {
        self.hv_timer.stop();
        self.power_supply.disable_output().await
    }

    /// Enable HV and switch it off again after `duration`.
    ///
    /// A zero duration is rejected without I/O. The timer is only armed if
    /// the output was enabled.
    pub async fn enable_output_with_timer(&self, duration: Duration) -> bool {
        if duration.is_zero() {
            self.events
                .error("HV timer duration must be greater than 0");
            return false;
        }
        if !self.power_supply.enable_output().await {
            return false;
        }
        self.hv_timer.start(duration, self.power_supply.clone());
        true
    }

    /// Disarm the HV timer, leaving the output on. `false` if none was armed.
    pub fn stop_hv_timer(&self) -> bool {
        self.hv_timer.stop()
    }

    pub fn hv_timer_remaining(&self) -> Option<Duration> {
        self.hv_timer.remaining()
    }

    pub async fn read_voltage(&self) -> Option<f64> {
        self.power_supply.read_voltage().await
    }

    // ---- picoammeter ----

    pub async fn read_current(&self) -> Option<f64> {
        self.picoammeter.read_current().await
    }

    pub async fn set_current_range(&self, range: CurrentRange) -> bool {
        self.picoammeter.set_current_range(range).await
    }

    pub async fn set_integration_time(&self, nplc: f64) -> bool {
        self.picoammeter.set_integration_time(nplc).await
    }

    pub async fn perform_zero_check(&self) -> bool {
        self.picoammeter.perform_zero_check().await
    }

    pub async fn set_auto_zero(&self, enabled: bool) -> bool {
        self.picoammeter.set_auto_zero(enabled).await
    }

    // ---- acquisition ----

    /// Start sampling at `rate_hz`. Needs a connected picoammeter; the power
    /// supply voltage is recorded when it is connected, 0.0 otherwise.
    pub async fn start_acquisition(&mut self, rate_hz: f64) -> bool {
        let interval = match interval_for_rate(rate_hz) {
            Ok(interval) => interval,
            Err(e) => {
                self.events.error(format!("Cannot start acquisition: {}", e));
                return false;
            }
        };
        if !self.picoammeter.is_connected().await {
            self.events.error(format!(
                "Cannot start acquisition: {}",
                DaqError::NotConnected(InstrumentKind::Picoammeter)
            ));
            return false;
        }
        match self.acquisition.start(
            interval,
            self.picoammeter.clone(),
            Some(self.power_supply.clone()),
        ) {
            Ok(()) => true,
            Err(e) => {
                self.events.warn(e.to_string());
                false
            }
        }
    }

    /// Returns `false` when nothing was running.
    pub async fn stop_acquisition(&mut self) -> bool {
        match self.acquisition.stop().await {
            StopOutcome::NotRunning => false,
            StopOutcome::Graceful => true,
            StopOutcome::Forced => {
                self.events.warn("Had to force terminate data acquisition");
                true
            }
        }
    }

    /// Validate `rate_hz` and apply it to the running loop, if any.
    pub fn set_sampling_rate(&self, rate_hz: f64) -> bool {
        match interval_for_rate(rate_hz) {
            Ok(interval) => {
                self.acquisition.set_interval(interval);
                self.events
                    .info(format!("Sampling rate set to {} Hz", rate_hz));
                true
            }
            Err(e) => {
                self.events.error(e.to_string());
                false
            }
        }
    }

    pub fn is_acquiring(&self) -> bool {
        self.acquisition.is_running()
    }

    pub fn acquisition_state(&self) -> Arc<AcquisitionState> {
        self.acquisition.state()
    }

    // ---- lifecycle ----

    /// Stop acquisition and switch HV off right away, without the disconnect
    /// sequence. Always raises a safety alert.
    pub async fn emergency_stop(&mut self) -> bool {
        self.events.log(LogLevel::System, "EMERGENCY STOP");
        if self.acquisition.is_running() {
            self.stop_acquisition().await;
        }
        let disabled = self.disable_output().await;
        let message = if disabled {
            "emergency stop: HV output disabled"
        } else {
            "emergency stop: could not confirm HV output disabled"
        };
        self.events
            .safety_alert(InstrumentKind::PowerSupply, message);
        disabled
    }

    /// Disconnect everything safely. Call before dropping the controller.
    pub async fn shutdown(&mut self) {
        self.events.log(LogLevel::System, "Shutting down instrument controller");
        self.disconnect_all_instruments().await;
        self.events.log(LogLevel::System, "Instrument controller shut down");
    }
}

impl Drop for InstrumentController {
    fn drop(&mut self) {
        self.acquisition.abort();

        let sessions = [self.power_supply.session(), self.picoammeter.session()];
        let open = sessions
            .iter()
            .any(|s| s.try_lock().map(|s| s.is_connected()).unwrap_or(true));
        if !open {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                tracing::warn!("Controller dropped with open sessions, disconnecting in background");
                handle.spawn(async move {
                    for session in sessions {
                        session.lock().await.disconnect().await;
                    }
                });
            }
            Err(_) => {
                tracing::error!("Controller dropped with open sessions and no runtime; instruments left as-is");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::SimResourceManager;

    fn controller() -> (InstrumentController, SimResourceManager) {
        let manager = SimResourceManager::bench("GPIB0::14::INSTR", "GPIB0::22::INSTR");
        let controller = InstrumentController::new(
            Arc::new(manager.clone()),
            AppConfig::default(),
            EventPublisher::new(4096),
        );
        (controller, manager)
    }

    #[tokio::test(start_paused = true)]
    async fn rejects_out_of_range_address() {
        let (controller, _) = controller();
        assert!(matches!(
            controller.connect_power_supply(31).await,
            Err(DaqError::InvalidAddress(31))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn acquisition_needs_picoammeter() {
        let (mut controller, _) = controller();
        assert!(!controller.start_acquisition(2.0).await);
        assert!(!controller.is_acquiring());
    }

    #[tokio::test(start_paused = true)]
    async fn rejects_bad_sampling_rate() {
        let (mut controller, _) = controller();
        controller.connect_picoammeter(22).await.unwrap();
        assert!(!controller.start_acquisition(50.0).await);
        assert!(!controller.set_sampling_rate(0.01));
        assert!(controller.set_sampling_rate(5.0));
        controller.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_disconnects_both() {
        let (mut controller, _) = controller();
        controller.connect_power_supply(14).await.unwrap();
        controller.connect_picoammeter(22).await.unwrap();
        assert!(controller.start_acquisition(2.0).await);

        controller.shutdown().await;

        assert!(!controller.is_acquiring());
        assert!(!controller.is_power_supply_connected().await);
        assert!(!controller.is_picoammeter_connected().await);
    }
}
