//! Keithley 2290-5 high-voltage power supply.
//!
//! SCPI mapping:
//!
//! | Operation | Command |
//! |-----------|---------|
//! | voltage setpoint | `VSET <V>` |
//! | voltage limit | `VLIM <V>` |
//! | current limit | `ILIM <A>` |
//! | HV on / off | `HVON` / `HVOF` |
//! | output voltage | `VOUT?` |
//! | output state | `OUTP?` |
//!
//! Current limits are given in milliamperes and sent in amperes.

use super::session::{InstrumentProfile, InstrumentSession, Teardown};
use super::{send_logged, SharedSession};
use crate::config::{AppConfig, SafetyLimits};
use crate::error::{AppResult, DaqError};
use crate::events::{EventPublisher, InstrumentKind};
use crate::transport::ResourceManager;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

struct PowerSupplyProfile {
    model: String,
    limits: SafetyLimits,
}

#[async_trait]
impl InstrumentProfile for PowerSupplyProfile {
    fn kind(&self) -> InstrumentKind {
        InstrumentKind::PowerSupply
    }

    fn expected_model(&self) -> &str {
        &self.model
    }

    fn setup_commands(&self) -> Vec<String> {
        vec![
            "*RCL 0".to_string(),
            format!("VLIM {}", self.limits.voltage_limit_v),
            ilim_command(self.limits.current_limit_ma),
        ]
    }

    async fn safe_stop(&self, teardown: &mut Teardown<'_>) {
        if let Err(e) = teardown.write("HVOF").await {
            teardown
                .events()
                .safety_alert(teardown.kind(), format!("HV disable failed during disconnect: {}", e));
            return;
        }
        tokio::time::sleep(teardown.timings().discharge_wait).await;

        match teardown.query("OUTP?").await {
            Ok(state) if state.trim() == "0" => {
                teardown.events().info("High voltage output disabled");
            }
            Ok(state) => teardown.events().safety_alert(
                teardown.kind(),
                format!("output may still be enabled after HVOF (OUTP? = {})", state.trim()),
            ),
            Err(e) => teardown
                .events()
                .warn(format!("Could not verify HV output state: {}", e)),
        }
    }
}

fn ilim_command(limit_ma: f64) -> String {
    format!("ILIM {}", limit_ma / 1000.0)
}

/// Handle to the high-voltage supply. Clones share one session.
#[derive(Clone)]
pub struct PowerSupply {
    session: SharedSession,
    events: EventPublisher,
}

impl PowerSupply {
    pub fn new(config: &AppConfig, events: EventPublisher) -> Self {
        let profile = PowerSupplyProfile {
            model: config.instruments.power_supply_model.clone(),
            limits: config.safety,
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

    pub async fn set_voltage(&self, volts: f64) -> bool {
        send_logged(
            &self.session,
            &self.events,
            "setting voltage",
            &[format!("VSET {}", volts)],
            &format!("Voltage set to {}V", volts),
        )
        .await
    }

    pub async fn set_voltage_limit(&self, volts: f64) -> bool {
        send_logged(
            &self.session,
            &self.events,
            "setting voltage limit",
            &[format!("VLIM {}", volts)],
            &format!("Voltage limit set to {}V", volts),
        )
        .await
    }

    /// Program the current limit, given in milliamperes.
    pub async fn set_current_limit(&self, milliamps: f64) -> bool {
        send_logged(
            &self.session,
            &self.events,
            "setting current limit",
            &[ilim_command(milliamps)],
            &format!("Current limit set to {}mA", milliamps),
        )
        .await
    }

    pub async fn enable_output(&self) -> bool {
        send_logged(
            &self.session,
            &self.events,
            "enabling output",
            &["HVON".to_string()],
            "High voltage output enabled",
        )
        .await
    }

    /// Turn HV off. A failure here is raised as a safety alert.
    pub async fn disable_output(&self) -> bool {
        let ok = send_logged(
            &self.session,
            &self.events,
            "disabling output",
            &["HVOF".to_string()],
            "High voltage output disabled",
        )
        .await;
        if !ok && self.is_connected().await {
            self.events.safety_alert(
                InstrumentKind::PowerSupply,
                "HV disable command failed; output may still be on",
            );
        }
        ok
    }

    /// Output voltage, or `None` when absent or on I/O failure.
    pub async fn read_voltage(&self) -> Option<f64> {
        match self.fetch_voltage().await {
            Ok(volts) => Some(volts),
            Err(DaqError::NotConnected(_)) => None,
            Err(e) => {
                self.events.error(format!("Error reading voltage: {}", e));
                None
            }
        }
    }

    /// Output voltage with the error kept, for callers with their own policy.
    pub async fn fetch_voltage(&self) -> AppResult<f64> {
        self.session.lock().await.query_f64("VOUT?").await
    }
}
