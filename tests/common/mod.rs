//! Shared fixtures for the integration tests: a simulated bench with a
//! 2290-5 at GPIB address 14 and a 6485 at address 22.
#![allow(dead_code)]

use keithley_daq::config::AppConfig;
use keithley_daq::controller::InstrumentController;
use keithley_daq::events::{ControllerEvent, EventPublisher};
use keithley_daq::measurement::Sample;
use keithley_daq::transport::{SimInstrument, SimResourceManager};
use std::sync::Arc;
use tokio::sync::broadcast::{error::TryRecvError, Receiver};

pub const PS_ADDRESS: u8 = 14;
pub const PICO_ADDRESS: u8 = 22;
pub const PS_RES: &str = "GPIB0::14::INSTR";
pub const PICO_RES: &str = "GPIB0::22::INSTR";

pub struct Bench {
    pub controller: InstrumentController,
    pub manager: SimResourceManager,
    pub ps: SimInstrument,
    pub pico: SimInstrument,
    pub rx: Receiver<ControllerEvent>,
}

pub fn bench() -> Bench {
    bench_with(AppConfig::default())
}

pub fn bench_with(config: AppConfig) -> Bench {
    let manager = SimResourceManager::bench(PS_RES, PICO_RES);
    let ps = manager.instrument(PS_RES).unwrap();
    let pico = manager.instrument(PICO_RES).unwrap();
    // Keep readings deterministic.
    pico.set_current(2.5e-9, 0.0);
    let events = EventPublisher::new(65_536);
    let rx = events.subscribe();
    let controller = InstrumentController::new(Arc::new(manager.clone()), config, events);
    Bench {
        controller,
        manager,
        ps,
        pico,
        rx,
    }
}

/// Everything published so far.
pub fn drain(rx: &mut Receiver<ControllerEvent>) -> Vec<ControllerEvent> {
    let mut events = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(event) => events.push(event),
            Err(TryRecvError::Lagged(_)) => continue,
            Err(_) => return events,
        }
    }
}

pub fn samples(events: &[ControllerEvent]) -> Vec<Sample> {
    events
        .iter()
        .filter_map(|e| match e {
            ControllerEvent::Sample(s) => Some(*s),
            _ => None,
        })
        .collect()
}

pub fn fatal_count(events: &[ControllerEvent]) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, ControllerEvent::AcquisitionFatal { .. }))
        .count()
}

pub fn log_messages(events: &[ControllerEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|e| match e {
            ControllerEvent::Log { message, .. } => Some(message.clone()),
            _ => None,
        })
        .collect()
}

pub fn is_strictly_increasing(samples: &[Sample]) -> bool {
    samples.windows(2).all(|w| w[0].elapsed_s < w[1].elapsed_s)
}
