//! Connect and safe-disconnect behavior through the controller facade.

mod common;

use common::*;
use keithley_daq::error::DaqError;
use keithley_daq::events::{ControllerEvent, InstrumentKind, LogLevel};
use keithley_daq::transport::sim::{SIM_2290_IDN, SIM_6485_IDN};
use std::time::Duration;

#[tokio::test(start_paused = true)]
async fn test_connect_reports_identity_verbatim() {
    let mut b = bench();

    let identity = b.controller.connect_power_supply(PS_ADDRESS).await.unwrap();

    assert_eq!(identity, SIM_2290_IDN);
    let events = drain(&mut b.rx);
    assert!(events.contains(&ControllerEvent::ConnectionChanged {
        kind: InstrumentKind::PowerSupply,
        connected: true,
        identity: SIM_2290_IDN.to_string(),
    }));
    assert_eq!(b.ps.last_timeout(), Some(Duration::from_secs(5)));

    b.controller.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_connect_sends_defaults_before_identify() {
    let mut b = bench();

    b.controller.connect_picoammeter(PICO_ADDRESS).await.unwrap();

    assert_eq!(
        b.pico.commands(),
        vec![
            "*RST",
            "*CLS",
            "SYST:ZCH OFF",
            "CURR:RANG:AUTO ON",
            "CURR:NPLC 1",
            "FORM:ELEM READ",
            "*IDN?",
        ]
    );
    assert_eq!(
        b.controller.picoammeter().identity().await.as_deref(),
        Some(SIM_6485_IDN)
    );

    b.controller.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_identify_failure_closes_handle() {
    let mut b = bench();
    b.ps.fail_on("*IDN?");

    let result = b.controller.connect_power_supply(PS_ADDRESS).await;

    assert!(matches!(result, Err(DaqError::Transport { .. })));
    assert!(!b.controller.is_power_supply_connected().await);
    assert_eq!(b.ps.open_count(), 1);
    assert_eq!(b.ps.close_count(), 1);

    let events = drain(&mut b.rx);
    assert!(events.contains(&ControllerEvent::ConnectionChanged {
        kind: InstrumentKind::PowerSupply,
        connected: false,
        identity: String::new(),
    }));
    assert!(log_messages(&events)
        .iter()
        .any(|m| m.contains("Error connecting") && m.contains("*IDN?")));
}

#[tokio::test(start_paused = true)]
async fn test_failed_close_after_failed_connect_is_ignored() {
    let mut b = bench();
    b.pico.fail_on("CURR:NPLC");
    b.pico.set_fail_close(true);

    let result = b.controller.connect_picoammeter(PICO_ADDRESS).await;

    assert!(result.is_err());
    assert!(!b.controller.is_picoammeter_connected().await);
    assert_eq!(b.pico.close_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_open_failure_is_a_connect_error() {
    let b = bench();
    b.ps.set_fail_open(true);

    let result = b.controller.connect_power_supply(PS_ADDRESS).await;

    assert!(matches!(result, Err(DaqError::ResourceOpen { .. })));
    assert!(!b.controller.is_power_supply_connected().await);
    assert_eq!(b.ps.close_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_missing_instrument_is_a_connect_error() {
    let b = bench();
    assert!(b.controller.connect_picoammeter(9).await.is_err());
    assert!(!b.controller.is_picoammeter_connected().await);
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_disconnects_safely_first() {
    let mut b = bench();
    b.controller.connect_power_supply(PS_ADDRESS).await.unwrap();
    assert!(b.controller.set_voltage(800.0).await);
    assert!(b.controller.enable_output().await);
    assert!(b.ps.hv_enabled());

    b.controller.connect_power_supply(PS_ADDRESS).await.unwrap();

    assert!(b.controller.is_power_supply_connected().await);
    assert!(!b.ps.hv_enabled());
    assert_eq!(b.ps.open_count(), 2);
    assert_eq!(b.ps.close_count(), 1);
    assert!(b.ps.commands().contains(&"HVOF".to_string()));

    b.controller.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_power_supply_disconnect_sequence() {
    let mut b = bench();
    b.controller.connect_power_supply(PS_ADDRESS).await.unwrap();
    b.controller.enable_output().await;
    b.ps.clear_commands();

    b.controller.disconnect_power_supply().await;

    assert_eq!(
        b.ps.commands(),
        vec![
            "*CLS",
            "SYST:ERR?",
            "HVOF",
            "OUTP?",
            "*OPC?",
            "*CLS",
            "SYST:ERR?",
            "SYST:LOC",
            "*IDN?",
        ]
    );
    assert!(!b.ps.hv_enabled());
    assert!(b.ps.in_local_mode());
    assert_eq!(b.ps.close_count(), 1);
    assert!(!b.controller.is_power_supply_connected().await);
    assert!(drain(&mut b.rx).contains(&ControllerEvent::ConnectionChanged {
        kind: InstrumentKind::PowerSupply,
        connected: false,
        identity: String::new(),
    }));
}

#[tokio::test(start_paused = true)]
async fn test_error_queue_is_drained_on_disconnect() {
    let b = bench();
    b.controller.connect_power_supply(PS_ADDRESS).await.unwrap();
    // Scripted entries survive *CLS, like errors raised while it settles.
    for _ in 0..3 {
        b.ps.push_response("SYST:ERR?", Ok("-222,\"Data out of range\""));
    }
    b.ps.clear_commands();

    b.controller.disconnect_power_supply().await;

    let reads = b
        .ps
        .commands()
        .iter()
        .filter(|c| c.as_str() == "SYST:ERR?")
        .count();
    // Three errors plus the terminating "no error" in the first drain, one
    // read in the second.
    assert_eq!(reads, 5);
}

#[tokio::test(start_paused = true)]
async fn test_cleared_errors_are_logged_as_warnings() {
    let mut b = bench();
    b.controller.connect_power_supply(PS_ADDRESS).await.unwrap();
    b.ps.push_response("SYST:ERR?", Ok("-222,\"Data out of range\""));
    b.ps.push_response("SYST:ERR?", Ok("-113,\"Undefined header\""));
    drain(&mut b.rx);

    b.controller.disconnect_power_supply().await;

    let warnings: Vec<String> = drain(&mut b.rx)
        .into_iter()
        .filter_map(|e| match e {
            ControllerEvent::Log {
                level: LogLevel::Warning,
                message,
            } => Some(message),
            _ => None,
        })
        .collect();
    assert!(warnings
        .iter()
        .any(|m| m.contains("-222,\"Data out of range\"")));
    assert!(warnings.iter().any(|m| m.contains("-113")));
    assert!(warnings
        .iter()
        .any(|m| m.contains("had 2 error(s) that were cleared")));
}

#[tokio::test(start_paused = true)]
async fn test_error_queue_drain_is_bounded() {
    let b = bench();
    b.controller.connect_picoammeter(PICO_ADDRESS).await.unwrap();
    for _ in 0..25 {
        b.pico.push_response("SYST:ERR?", Ok("-113,\"Undefined header\""));
    }
    b.pico.clear_commands();

    b.controller.picoammeter().disconnect().await;

    let reads = b
        .pico
        .commands()
        .iter()
        .filter(|c| c.as_str() == "SYST:ERR?")
        .count();
    assert_eq!(reads, 20);
    assert!(!b.controller.is_picoammeter_connected().await);
}

/// Every command the teardown sends, plus close, fails in turn; the session
/// must still end up released.
#[tokio::test(start_paused = true)]
async fn test_disconnect_survives_failure_at_every_step() {
    let steps = [
        "*CLS",
        "SYST:ERR?",
        "HVOF",
        "OUTP?",
        "*OPC?",
        "SYST:LOC",
        "*IDN?",
        "close",
    ];

    for step in steps {
        let mut b = bench();
        b.controller.connect_power_supply(PS_ADDRESS).await.unwrap();
        if step == "close" {
            b.ps.set_fail_close(true);
        } else {
            b.ps.fail_on(step);
        }

        b.controller.disconnect_power_supply().await;

        assert!(
            !b.controller.is_power_supply_connected().await,
            "session left open when '{}' failed",
            step
        );
        assert_eq!(b.ps.close_count(), 1, "close not attempted when '{}' failed", step);
        assert!(drain(&mut b.rx).contains(&ControllerEvent::ConnectionChanged {
            kind: InstrumentKind::PowerSupply,
            connected: false,
            identity: String::new(),
        }));
    }
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_survives_total_failure() {
    let b = bench();
    b.controller.connect_picoammeter(PICO_ADDRESS).await.unwrap();
    for prefix in ["*CLS", "SYST:ERR?", "ABOR", "*OPC?", "SYST:LOC", "*IDN?"] {
        b.pico.fail_on(prefix);
    }
    b.pico.set_fail_close(true);

    b.controller.picoammeter().disconnect().await;

    assert!(!b.controller.is_picoammeter_connected().await);
    assert_eq!(b.pico.close_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_hv_disable_failure_raises_safety_alert() {
    let mut b = bench();
    b.controller.connect_power_supply(PS_ADDRESS).await.unwrap();
    b.controller.enable_output().await;
    b.ps.fail_on("HVOF");

    b.controller.disconnect_power_supply().await;

    let events = drain(&mut b.rx);
    assert!(events.iter().any(|e| matches!(
        e,
        ControllerEvent::SafetyAlert {
            kind: InstrumentKind::PowerSupply,
            ..
        }
    )));
    assert!(!b.controller.is_power_supply_connected().await);
}

#[tokio::test(start_paused = true)]
async fn test_local_mode_uncertainty_is_flagged() {
    let mut b = bench();
    b.controller.connect_picoammeter(PICO_ADDRESS).await.unwrap();
    // Firmware that keeps answering *IDN? after SYST:LOC.
    for _ in 0..3 {
        b.pico.push_response("*IDN?", Ok(SIM_6485_IDN));
    }
    b.pico.clear_commands();

    b.controller.picoammeter().disconnect().await;

    let locals = b
        .pico
        .commands()
        .iter()
        .filter(|c| c.as_str() == "SYST:LOC")
        .count();
    assert_eq!(locals, 3);
    let events = drain(&mut b.rx);
    assert!(events.iter().any(|e| matches!(
        e,
        ControllerEvent::SafetyAlert {
            kind: InstrumentKind::Picoammeter,
            ..
        }
    )));
    assert!(!b.controller.is_picoammeter_connected().await);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_all_is_independent() {
    let mut b = bench();
    b.controller.connect_power_supply(PS_ADDRESS).await.unwrap();
    b.controller.connect_picoammeter(PICO_ADDRESS).await.unwrap();
    for prefix in ["*CLS", "SYST", "HVOF", "OUTP?", "*OPC?", "*IDN?"] {
        b.ps.fail_on(prefix);
    }
    b.ps.set_fail_close(true);

    b.controller.disconnect_all_instruments().await;

    assert!(!b.controller.is_power_supply_connected().await);
    assert!(!b.controller.is_picoammeter_connected().await);
    assert_eq!(b.pico.close_count(), 1);
    assert!(b.pico.in_local_mode());
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_is_repeatable() {
    let mut b = bench();
    b.controller.connect_power_supply(PS_ADDRESS).await.unwrap();

    b.controller.shutdown().await;
    b.controller.shutdown().await;

    assert_eq!(b.ps.close_count(), 1);
}
