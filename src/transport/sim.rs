//! Simulated Instruments
//!
//! In-process models of the Keithley 2290-5 power supply and 6485 picoammeter
//! speaking the same SCPI subset as the real hardware. Used by the test suite
//! and by the CLI `--simulate` mode.
//!
//! # Behaviour
//!
//! - Writes of unknown headers are accepted and queue `-113,"Undefined header"`,
//!   the way the real instruments do
//! - Unknown queries time out
//! - After `SYST:LOC` the instrument stops answering queries until it is
//!   addressed with a write again (front-panel control)
//! - `READ?` returns the configured current plus optional uniform noise
//!
//! # Fault Injection
//!
//! Any command prefix can be made to fail ([`SimInstrument::fail_on`]), query
//! responses can be scripted one at a time ([`SimInstrument::push_response`]),
//! and `open`/`close` can be made to fail. Every command is recorded for
//! inspection.
//!
//! All delays use `tokio::time::sleep`, so tests can run on a paused clock.

use super::{ResourceManager, ResourceTransport};
use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use rand::Rng;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Identity reported by the simulated power supply.
pub const SIM_2290_IDN: &str = "KEITHLEY INSTRUMENTS INC.,2290-5,12345,1.234";
/// Identity reported by the simulated picoammeter.
pub const SIM_6485_IDN: &str = "KEITHLEY INSTRUMENTS INC.,MODEL 6485,1234567,B04";

const NO_ERROR: &str = "0,\"No error\"";

#[derive(Debug)]
struct SimState {
    identity: String,
    // power supply
    hv_on: bool,
    voltage_set: f64,
    voltage_limit: f64,
    current_limit: f64,
    // picoammeter
    current_a: f64,
    noise_a: f64,
    zero_check: bool,
    auto_range: bool,
    range_a: Option<f64>,
    nplc: f64,
    auto_zero: bool,
    zero_corrected: bool,
    // shared
    local: bool,
    error_queue: VecDeque<String>,
    // fault injection
    failures: Vec<String>,
    scripted: HashMap<String, VecDeque<Result<String, String>>>,
    fail_open: bool,
    fail_close: bool,
    latency: Duration,
    // inspection
    log: Vec<String>,
    open_count: usize,
    close_count: usize,
    last_timeout: Option<Duration>,
}

impl SimState {
    fn new(identity: &str) -> Self {
        Self {
            identity: identity.to_string(),
            hv_on: false,
            voltage_set: 0.0,
            voltage_limit: 5000.0,
            current_limit: 5.25e-3,
            current_a: 0.0,
            noise_a: 0.0,
            zero_check: true,
            auto_range: false,
            range_a: None,
            nplc: 6.0,
            auto_zero: true,
            zero_corrected: false,
            local: false,
            error_queue: VecDeque::new(),
            failures: Vec::new(),
            scripted: HashMap::new(),
            fail_open: false,
            fail_close: false,
            latency: Duration::ZERO,
            log: Vec::new(),
            open_count: 0,
            close_count: 0,
            last_timeout: None,
        }
    }

    fn reset(&mut self) {
        self.hv_on = false;
        self.voltage_set = 0.0;
        self.zero_check = true;
        self.auto_range = false;
        self.range_a = None;
        self.nplc = 6.0;
        self.auto_zero = true;
    }

    fn injected_failure(&self, command: &str) -> Option<String> {
        self.failures
            .iter()
            .find(|prefix| command.starts_with(prefix.as_str()))
            .map(|prefix| format!("injected failure on '{}'", prefix))
    }

    fn apply_write(&mut self, command: &str) {
        self.local = false;
        let (header, arg) = split_command(command);
        let number = arg.and_then(|a| a.parse::<f64>().ok());
        match (header, arg, number) {
            ("*RST", _, _) => self.reset(),
            ("*CLS", _, _) => self.error_queue.clear(),
            ("*RCL", _, _) | ("FORM:ELEM", _, _) | ("INIT", _, _) | ("ABOR", _, _) => {}
            ("VLIM", _, Some(volts)) => self.voltage_limit = volts,
            ("ILIM", _, Some(amps)) => self.current_limit = amps,
            ("VSET", _, Some(volts)) if volts.abs() <= self.voltage_limit => {
                self.voltage_set = volts
            }
            ("VSET", _, _) => self.push_error("-222,\"Data out of range\""),
            ("HVON", None, _) => self.hv_on = true,
            ("HVOF", None, _) => self.hv_on = false,
            ("SYST:ZCH", Some(state), _) => self.zero_check = state == "ON",
            ("CURR:RANG:AUTO", Some(state), _) => self.auto_range = state == "ON",
            ("CURR:RANG", _, Some(amps)) => self.range_a = Some(amps),
            ("CURR:NPLC", _, Some(nplc)) => self.nplc = nplc,
            ("SYST:AZER", Some(state), _) => self.auto_zero = state == "ON",
            ("SYST:ZCOR:ACQ", None, _) => self.zero_corrected = true,
            ("SYST:LOC", None, _) => self.local = true,
            _ => self.push_error("-113,\"Undefined header\""),
        }
    }

    fn answer(&mut self, command: &str) -> Result<String> {
        if self.local {
            bail!("VI_ERROR_TMO: timeout expired before operation completed");
        }
        match command {
            "*IDN?" => Ok(self.identity.clone()),
            "*OPC?" => Ok("1".to_string()),
            "SYST:ERR?" => Ok(self
                .error_queue
                .pop_front()
                .unwrap_or_else(|| NO_ERROR.to_string())),
            "VOUT?" => {
                let volts = if self.hv_on { self.voltage_set } else { 0.0 };
                Ok(format!("{:.1}", volts))
            }
            "OUTP?" => Ok(if self.hv_on { "1" } else { "0" }.to_string()),
            "READ?" => {
                let noise = if self.noise_a > 0.0 {
                    rand::thread_rng().gen_range(-self.noise_a..=self.noise_a)
                } else {
                    0.0
                };
                let reading = if self.zero_check { 0.0 } else { self.current_a + noise };
                Ok(format!("{:.6E}", reading))
            }
            _ => {
                self.push_error("-113,\"Undefined header\"");
                bail!("VI_ERROR_TMO: no response to '{}'", command)
            }
        }
    }

    fn push_error(&mut self, error: &str) {
        self.error_queue.push_back(error.to_string());
    }
}

fn split_command(command: &str) -> (&str, Option<&str>) {
    match command.split_once(' ') {
        Some((header, arg)) => (header, Some(arg.trim())),
        None => (command, None),
    }
}

/// Handle to one simulated instrument.
///
/// Clones share state, so a test can keep a handle for inspection while the
/// resource manager hands out transports to the code under test.
#[derive(Debug, Clone)]
pub struct SimInstrument {
    state: Arc<Mutex<SimState>>,
}

impl SimInstrument {
    /// An instrument answering `*IDN?` with `identity`.
    pub fn new(identity: &str) -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState::new(identity))),
        }
    }

    /// Keithley 2290-5 high-voltage supply.
    pub fn keithley_2290() -> Self {
        Self::new(SIM_2290_IDN)
    }

    /// Keithley 6485 picoammeter reading a few nanoamperes of leakage.
    pub fn keithley_6485() -> Self {
        let instrument = Self::new(SIM_6485_IDN);
        instrument.set_current(2.5e-9, 0.1e-9);
        instrument
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make every write/query starting with `prefix` fail.
    pub fn fail_on(&self, prefix: &str) {
        self.lock().failures.push(prefix.to_string());
    }

    pub fn clear_failures(&self) {
        self.lock().failures.clear();
    }

    /// Queue a one-shot response for the next `command` query.
    ///
    /// `Err` entries fail that query with the given message.
    pub fn push_response(&self, command: &str, response: Result<&str, &str>) {
        self.lock()
            .scripted
            .entry(command.to_string())
            .or_default()
            .push_back(response.map(str::to_string).map_err(str::to_string));
    }

    /// Queue an entry in the instrument error queue.
    pub fn push_error(&self, error: &str) {
        self.lock().push_error(error);
    }

    pub fn set_fail_open(&self, fail: bool) {
        self.lock().fail_open = fail;
    }

    pub fn set_fail_close(&self, fail: bool) {
        self.lock().fail_close = fail;
    }

    /// Delay applied to every write, query and close.
    pub fn set_latency(&self, latency: Duration) {
        self.lock().latency = latency;
    }

    /// Picoammeter reading in amperes and uniform noise amplitude.
    pub fn set_current(&self, current_a: f64, noise_a: f64) {
        let mut state = self.lock();
        state.current_a = current_a;
        state.noise_a = noise_a;
    }

    /// Every command received, failed ones included, in order.
    pub fn commands(&self) -> Vec<String> {
        self.lock().log.clone()
    }

    pub fn clear_commands(&self) {
        self.lock().log.clear();
    }

    pub fn hv_enabled(&self) -> bool {
        self.lock().hv_on
    }

    pub fn voltage_setpoint(&self) -> f64 {
        self.lock().voltage_set
    }

    pub fn voltage_limit(&self) -> f64 {
        self.lock().voltage_limit
    }

    /// Current limit in amperes, as last programmed with `ILIM`.
    pub fn current_limit(&self) -> f64 {
        self.lock().current_limit
    }

    pub fn zero_check(&self) -> bool {
        self.lock().zero_check
    }

    pub fn zero_corrected(&self) -> bool {
        self.lock().zero_corrected
    }

    pub fn auto_range(&self) -> bool {
        self.lock().auto_range
    }

    /// Fixed range in amperes, `None` until `CURR:RANG` is sent.
    pub fn range(&self) -> Option<f64> {
        self.lock().range_a
    }

    pub fn nplc(&self) -> f64 {
        self.lock().nplc
    }

    pub fn auto_zero(&self) -> bool {
        self.lock().auto_zero
    }

    pub fn in_local_mode(&self) -> bool {
        self.lock().local
    }

    pub fn open_count(&self) -> usize {
        self.lock().open_count
    }

    pub fn close_count(&self) -> usize {
        self.lock().close_count
    }

    /// I/O timeout requested by the most recent `open`.
    pub fn last_timeout(&self) -> Option<Duration> {
        self.lock().last_timeout
    }

    fn latency(&self) -> Duration {
        self.lock().latency
    }

    async fn write(&self, command: &str) -> Result<()> {
        sleep_for(self.latency()).await;
        let mut state = self.lock();
        state.log.push(command.to_string());
        if let Some(reason) = state.injected_failure(command) {
            bail!(reason);
        }
        state.apply_write(command);
        Ok(())
    }

    async fn query(&self, command: &str) -> Result<String> {
        sleep_for(self.latency()).await;
        let mut state = self.lock();
        state.log.push(command.to_string());
        if let Some(reason) = state.injected_failure(command) {
            bail!(reason);
        }
        if let Some(scripted) = state
            .scripted
            .get_mut(command)
            .and_then(|queue| queue.pop_front())
        {
            return scripted.map_err(|e| anyhow!(e));
        }
        state.answer(command)
    }

    async fn close(&self) -> Result<()> {
        sleep_for(self.latency()).await;
        let mut state = self.lock();
        state.close_count += 1;
        if state.fail_close {
            bail!("injected failure on close");
        }
        Ok(())
    }

    fn open(&self, timeout: Duration) -> Result<()> {
        let mut state = self.lock();
        if state.fail_open {
            bail!("VI_ERROR_RSRC_BUSY: resource is locked");
        }
        state.open_count += 1;
        state.local = false;
        state.last_timeout = Some(timeout);
        Ok(())
    }
}

async fn sleep_for(latency: Duration) {
    if !latency.is_zero() {
        tokio::time::sleep(latency).await;
    }
}

/// Transport over a [`SimInstrument`].
pub struct SimTransport {
    resource: String,
    instrument: SimInstrument,
    closed: bool,
}

impl SimTransport {
    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            bail!("resource {} is closed", self.resource);
        }
        Ok(())
    }
}

#[async_trait]
impl ResourceTransport for SimTransport {
    async fn write(&mut self, command: &str) -> Result<()> {
        self.ensure_open()?;
        self.instrument.write(command).await
    }

    async fn query(&mut self, command: &str) -> Result<String> {
        self.ensure_open()?;
        self.instrument.query(command).await.map(|r| r.trim().to_string())
    }

    async fn close(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.closed = true;
        self.instrument.close().await
    }

    fn resource(&self) -> &str {
        &self.resource
    }
}

/// Resource manager over a set of simulated instruments.
#[derive(Clone, Default)]
pub struct SimResourceManager {
    instruments: Arc<Mutex<BTreeMap<String, SimInstrument>>>,
    extra_resources: Arc<Mutex<Vec<String>>>,
}

impl SimResourceManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// A 2290-5 and a 6485 at the given resource strings.
    pub fn bench(power_supply: &str, picoammeter: &str) -> Self {
        let manager = Self::new();
        manager.attach(power_supply, SimInstrument::keithley_2290());
        manager.attach(picoammeter, SimInstrument::keithley_6485());
        manager
    }

    /// Place `instrument` at `resource`, replacing whatever was there.
    pub fn attach(&self, resource: &str, instrument: SimInstrument) {
        self.instruments
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(resource.to_string(), instrument);
    }

    /// List a resource that cannot be opened (a serial port, say).
    pub fn add_unopenable_resource(&self, resource: &str) {
        self.extra_resources
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(resource.to_string());
    }

    /// Handle to the instrument at `resource`, for inspection.
    pub fn instrument(&self, resource: &str) -> Option<SimInstrument> {
        self.instruments
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(resource)
            .cloned()
    }
}

#[async_trait]
impl ResourceManager for SimResourceManager {
    async fn open(
        &self,
        resource: &str,
        timeout: Duration,
    ) -> Result<Box<dyn ResourceTransport>> {
        let instrument = self
            .instrument(resource)
            .ok_or_else(|| anyhow!("VI_ERROR_RSRC_NFOUND: {} not found", resource))?;
        instrument.open(timeout)?;
        Ok(Box::new(SimTransport {
            resource: resource.to_string(),
            instrument,
            closed: false,
        }))
    }

    async fn list_resources(&self) -> Result<Vec<String>> {
        let mut resources: Vec<String> = self
            .instruments
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        resources.extend(
            self.extra_resources
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .iter()
                .cloned(),
        );
        Ok(resources)
    }
}
