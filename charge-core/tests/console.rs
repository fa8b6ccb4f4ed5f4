mod support;

use core::time::Duration;

use charge_core::console::{CommandExecutor, CommandOutcome};
use charge_core::hv::{Afc, HvState};
use charge_core::port::{AttachedDeviceFact, Attachment, PortEvent, PortIrq};
use charge_core::schedule::WorkKind;
use charge_core::water::{ThresholdKey, WaterState};

use support::{Bench, Charger, drain};

#[test]
fn afc_policy_toggles_gate_a_live_negotiation() {
    let bench = Bench::new(Charger::Afc);
    let port = bench.port(Afc);
    let mut console = CommandExecutor::new(&port);

    console.execute("afc disable").expect("afc disable");
    port.on_charger_ready();
    port.on_port_event(PortEvent::Attached(Attachment::sink(true)));
    bench.run_for(&port, Duration::from_secs(2));

    assert_eq!(port.negotiator().state(), HvState::Idle);
    assert!(port.status().hv.afc_disabled);
    assert_eq!(bench.chip.bus_mv(), 5_000);

    console.execute("afc enable").expect("afc enable");
    bench.service(&port);
    port.on_irq(PortIrq::PingReady);
    bench.service(&port);
    port.on_irq(PortIrq::PingReady);
    bench.run_for(&port, Duration::from_millis(500));

    assert_eq!(port.negotiator().state(), HvState::Afc9V);
    assert_eq!(bench.chip.bus_mv(), 9_000);
}

#[test]
fn factory_water_test_from_the_console_drops_the_bus_and_shows_in_status() {
    let bench = Bench::new(Charger::Afc);
    let port = bench.port(Afc);

    port.on_charger_ready();
    port.on_port_event(PortEvent::Attached(Attachment::sink(true)));
    bench.service(&port);
    port.on_irq(PortIrq::PingReady);
    bench.service(&port);
    port.on_irq(PortIrq::PingReady);
    bench.run_for(&port, Duration::from_millis(500));
    assert_eq!(port.negotiator().state(), HvState::Afc9V);
    drain(&port);

    let mut console = CommandExecutor::new(&port);
    assert_eq!(
        console.execute("water wet"),
        Ok(CommandOutcome::FactoryWaterTest)
    );
    bench.service(&port);
    assert_eq!(port.detector().state(), WaterState::DryIdle);

    // Dry for the first two attempts, then the jig floods the connector.
    bench.advance(Duration::from_millis(500));
    bench.service(&port);
    bench.advance(Duration::from_millis(500));
    bench.service(&port);
    assert_eq!(port.detector().state(), WaterState::DryIdle);
    assert_eq!(port.negotiator().state(), HvState::Afc9V);

    bench.chip.set_wet(true);
    bench.advance(Duration::from_millis(500));
    bench.service(&port);

    assert_eq!(port.detector().state(), WaterState::Water1Idle);
    assert_eq!(port.negotiator().state(), HvState::Idle);
    assert_eq!(port.published_fact(), AttachedDeviceFact::WaterDetected);
    assert_eq!(bench.chip.bus_mv(), 5_000);
    assert!(port.deadline(WorkKind::FactoryWaterCheck).is_none());

    let status = console.execute("status").expect("status").to_string();
    let port_line = status.lines().next().expect("port line");
    assert!(port_line.starts_with("port sink dcp"), "{port_line}");
    assert!(port_line.contains("fact=water-detected"), "{port_line}");
    assert!(port_line.contains("hiccup=on"), "{port_line}");
}

#[test]
fn factory_water_test_reports_nothing_on_a_dry_connector() {
    let bench = Bench::new(Charger::Plain);
    let port = bench.port(Afc);
    let mut console = CommandExecutor::new(&port);

    console.execute("water wet").expect("water wet");
    bench.run_for(&port, Duration::from_millis(500));
    let reads_per_check = bench.chip.sense_reads();
    assert!(reads_per_check > 0);
    bench.run_for(&port, Duration::from_secs(30));

    assert_eq!(bench.chip.sense_reads(), 14 * reads_per_check);
    assert_eq!(port.detector().state(), WaterState::DryIdle);
    assert!(port.deadline(WorkKind::FactoryWaterCheck).is_none());
    assert!(drain(&port).is_empty());
    assert!(!port.wake_lock().is_held());
}

#[test]
fn rejected_thresholds_leave_the_live_config_alone() {
    let bench = Bench::new(Charger::Plain);
    let port = bench.port(Afc);
    let before = port.detector().config();
    let mut console = CommandExecutor::new(&port);

    let err = console
        .execute("threshold dry-kohm-min=100")
        .expect_err("dry floor below the wet band");
    assert!(err.to_string().starts_with("error:"));
    assert_eq!(port.detector().config(), before);

    console
        .execute("threshold monitor-ms=20000")
        .expect("monitor interval accepted");
    assert_eq!(
        port.detector()
            .config()
            .threshold_value(ThresholdKey::LongMonitorIntervalMs),
        20_000
    );
}
