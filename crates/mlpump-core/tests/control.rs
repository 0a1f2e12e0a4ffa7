//! Control facade tests: settings, background movements, reconnect

use mlpump_core::config::{PumpConfig, PumpPrefs};
use mlpump_core::control::PumpControl;
use mlpump_core::protocol::ErrorKind;
use mlpump_core::pump::PumpDriver;
use mlpump_core::sim::SimulatedPump;
use mlpump_core::worker::Completion;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn test_config() -> PumpConfig {
    PumpConfig {
        name: "test".to_string(),
        response_retries: 3,
        poll_interval_ms: 1,
        ..PumpConfig::default()
    }
}

fn control_for(sim: &SimulatedPump) -> PumpControl {
    let handle = sim.clone();
    let mut control = PumpControl::with_connector(
        test_config(),
        Box::new(move |config| {
            handle.reopen();
            PumpDriver::with_options(
                Box::new(handle.clone()),
                config.address,
                &config.name,
                config.timing(),
            )
        }),
    );
    control.connect().unwrap();
    control
}

#[test]
fn test_apply_prefs() {
    let sim = SimulatedPump::new(0);
    let control = control_for(&sim);

    control.apply_prefs(true).unwrap();
    assert_eq!(sim.diameter(), 4.61);
    assert_eq!(sim.rates(), (120.0, 120.0));
    assert_eq!(sim.commands()[1], "00STP");
}

#[test]
fn test_slow_mode_switches_rate() {
    let sim = SimulatedPump::new(0);
    let mut control = control_for(&sim);
    control.apply_prefs(false).unwrap();

    control.set_slow(true).unwrap();
    assert!(control.is_slow());
    assert_eq!(sim.rates(), (3.0, 3.0));

    control.set_slow(false).unwrap();
    assert_eq!(sim.rates(), (120.0, 120.0));
}

#[test]
fn test_set_prefs_applies_new_values() {
    let sim = SimulatedPump::new(0);
    let mut control = control_for(&sim);

    control
        .set_prefs(PumpPrefs {
            diameter: 2.0,
            flowrate: 50.0,
            slow_flowrate: 5.0,
        })
        .unwrap();
    assert_eq!(sim.diameter(), 2.0);
    assert_eq!(sim.rates(), (50.0, 50.0));
    assert_eq!(control.prefs().slow_flowrate, 5.0);
}

#[test]
fn test_background_infuse_reports_completion() {
    let sim = SimulatedPump::new(0).with_polls_to_target(3);
    let mut control = control_for(&sim);
    let finished = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&finished);
    control.on_movement_finished(Arc::new(move |completion: &Completion<()>| {
        assert!(completion.outcome.is_ok());
        counter.fetch_add(1, Ordering::SeqCst);
    }));

    control.apply_prefs(false).unwrap();
    control.infuse(100.0).unwrap();
    let completion = control.wait_for_movement().unwrap();

    assert!(completion.outcome.is_ok());
    assert_eq!(finished.load(Ordering::SeqCst), 1);
    assert_eq!(sim.displaced().0, 100.0);
    assert!(!control.is_moving());
}

#[test]
fn test_fill_draws_full_stroke() {
    let sim = SimulatedPump::new(0).with_polls_to_target(2);
    let mut control = control_for(&sim);

    control.fill().unwrap();
    assert_eq!(sim.targets(), (Some(1000.0), Some(1000.0)));
    control.wait_for_movement().unwrap().outcome.unwrap();
    assert_eq!(sim.displaced().1, 1000.0);

    control.empty().unwrap();
    control.wait_for_movement().unwrap().outcome.unwrap();
    assert_eq!(sim.displaced().0, 1000.0);
}

#[test]
fn test_second_movement_refused_while_busy() {
    let sim = SimulatedPump::new(0).with_polls_to_target(1_000_000);
    let mut control = control_for(&sim);

    control.infuse(10.0).unwrap();
    let err = control.withdraw(10.0).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Protocol);
    assert!(err.to_string().contains("not ready"));

    let deadline = Instant::now() + Duration::from_secs(5);
    while !(control.is_moving() && sim.commands().iter().any(|c| c.ends_with("VOL"))) {
        assert!(Instant::now() < deadline);
        std::thread::sleep(Duration::from_millis(1));
    }
    control.stop().unwrap();
    control.wait_for_movement().unwrap().outcome.unwrap();
    assert!(!sim.is_moving());
}

#[test]
fn test_reconnect_reapplies_prefs() {
    let sim = SimulatedPump::new(0);
    let mut control = control_for(&sim);
    sim.clear_commands();

    control.reconnect().unwrap();
    assert!(control.is_connected());
    let commands = sim.commands();
    assert_eq!(commands[0], "00VER");
    assert_eq!(commands[1], "00STP");
    assert!(commands.contains(&"00MMD 4.61".to_string()));
    assert_eq!(sim.rates(), (120.0, 120.0));
}
