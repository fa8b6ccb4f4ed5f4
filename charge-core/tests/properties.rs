mod support;

use core::time::Duration;

use charge_core::hv::{
    Afc, AnyProtocol, HvNegotiator, HvPlan, HvProtocol, HvState, NegotiatorConfig, ProtocolKind,
    Qc, Voltage, transition_allowed,
};
use charge_core::port::{Attachment, Notification, PortEvent};
use charge_core::sampler::{self, AdcMode, AnalogSampler, CancelToken, SharedSampler};
use charge_core::schedule::WorkKind;
use charge_core::telemetry::TelemetryEventKind;
use charge_core::transport::registers;
use charge_core::water::{CheckOutcome, DetectorConfig, WaterDetector, WaterSensitivity, WaterState};
use embassy_futures::block_on;
use embassy_futures::join::join;
use embassy_sync::blocking_mutex::raw::NoopRawMutex;
use portable_atomic::{AtomicBool, AtomicU32};

use support::{Bench, Charger, DRY_KOHM, DRY_MV, WET_KOHM, WET_MV, drain};

/// Small deterministic generator for event walks.
struct Lcg(u64);

impl Lcg {
    fn next(&mut self) -> u32 {
        self.0 = self
            .0
            .wrapping_mul(6_364_136_223_846_793_005)
            .wrapping_add(1_442_695_040_888_963_407);
        u32::try_from(self.0 >> 33).expect("31 bits")
    }

    fn below(&mut self, bound: u32) -> u32 {
        self.next() % bound
    }
}

fn pattern(mask: u32, hit: i64, miss: i64) -> [i64; 5] {
    core::array::from_fn(|bit| if mask & (1 << bit) != 0 { hit } else { miss })
}

#[test]
fn water_latch_needs_threshold_on_both_bursts_at_every_sensitivity() {
    for level in WaterSensitivity::ALL {
        let config = DetectorConfig {
            sensitivity: level,
            ..DetectorConfig::DEFAULT
        };
        let threshold = u32::from(config.threshold());

        for resistance_mask in 0u32..32 {
            for voltage_mask in 0u32..32 {
                let bench = Bench::new(Charger::Plain);
                bench
                    .chip
                    .script_resistances(&pattern(resistance_mask, WET_KOHM, DRY_KOHM));
                bench
                    .chip
                    .script_voltages(&pattern(voltage_mask, WET_MV, DRY_MV));

                let detector = WaterDetector::<NoopRawMutex>::new(config);
                let shared: SharedSampler<NoopRawMutex, _> = sampler::shared(&bench.chip);
                let epoch = AtomicU32::new(0);
                let power = AtomicBool::new(false);
                let clock = bench.clock();
                let mut delay = bench.delay();
                let report = block_on(detector.check_water(
                    &shared,
                    &clock,
                    &mut delay,
                    CancelToken::new(&epoch, &power),
                ));

                let expect_wet = resistance_mask.count_ones() >= threshold
                    && voltage_mask.count_ones() >= threshold;
                assert_eq!(
                    report.to == WaterState::Water1Idle,
                    expect_wet,
                    "{level:?} resistance {resistance_mask:05b} voltage {voltage_mask:05b}"
                );
                if !expect_wet {
                    assert_eq!(report.outcome, CheckOutcome::Dry);
                    assert_eq!(detector.state(), WaterState::DryIdle);
                }
            }
        }
    }
}

#[test]
fn detach_at_any_point_of_a_check_is_inconclusive() {
    // Five resistance samples then five voltage samples on a wet pin.
    for detach_after in 1..=9u32 {
        let bench = Bench::new(Charger::Plain);
        bench.chip.set_wet(true);
        let port = bench.port(Afc);
        port.on_port_event(PortEvent::Attached(Attachment::sink(false)));

        let mut delay = bench.delay();
        block_on(join(port.service(&mut delay), async {
            while bench.chip.sense_reads() < detach_after {
                embassy_futures::yield_now().await;
            }
            port.on_port_event(PortEvent::Detached);
        }));

        assert_eq!(
            port.detector().state(),
            WaterState::DryIdle,
            "detach after {detach_after} samples"
        );
        assert!(!port.status().hiccup);
        assert!(!drain(&port).contains(&Notification::Hiccup(true)));
        port.with_telemetry(|telemetry| {
            assert!(
                telemetry
                    .oldest_first()
                    .any(|record| matches!(record.event, TelemetryEventKind::CheckInconclusive(_)))
            );
            assert!(
                !telemetry
                    .oldest_first()
                    .any(|record| matches!(record.event, TelemetryEventKind::WaterTransition { .. }))
            );
        });
    }
}

fn random_step<P: HvProtocol>(
    negotiator: &HvNegotiator<NoopRawMutex, P>,
    rng: &mut Lcg,
) -> HvPlan {
    const READINGS: [i32; 6] = [0, 4_900, 5_600, 6_000, 7_900, 9_100];
    match rng.below(11) {
        0 => negotiator.on_dcp_detected(),
        1 => negotiator.on_charger_ready(),
        2 | 3 => negotiator.on_ping_ready(),
        4 => negotiator.on_ping_timeout(),
        5 | 6 => {
            let index = usize::try_from(rng.below(6)).expect("small index");
            negotiator.on_bus_voltage(READINGS[index])
        }
        7 => negotiator.on_bus_unavailable(),
        8 => negotiator.request_voltage(if rng.below(2) == 0 {
            Voltage::V5
        } else {
            Voltage::V9
        }),
        9 => negotiator.set_afc_disabled(rng.below(4) == 0),
        _ => {
            if rng.below(3) == 0 {
                negotiator.reset()
            } else {
                negotiator.abort()
            }
        }
    }
}

fn walk<P: HvProtocol>(protocol: P, seed: u64) {
    let negotiator = HvNegotiator::<NoopRawMutex, P>::new(protocol, NegotiatorConfig::DEFAULT);
    let mut rng = Lcg(seed);

    for step in 0..2_000 {
        let before = negotiator.state();
        let plan = random_step(&negotiator, &mut rng);

        let mut current = before;
        for (from, to) in plan.transitions.iter().copied() {
            assert_eq!(from, current, "seed {seed} step {step}: broken chain");
            assert!(transition_allowed(from, to), "seed {seed} step {step}");
            if matches!(to, HvState::Afc9V | HvState::Qc9V) {
                assert!(
                    matches!(from, HvState::FastChargeAdaptor | HvState::Prepare),
                    "seed {seed} step {step}: {from:?} -> {to:?}"
                );
            }
            current = to;
        }
        assert_eq!(negotiator.state(), current, "seed {seed} step {step}");

        if negotiator.state() == HvState::Idle {
            let counters = negotiator.counters();
            assert_eq!(counters.ping_count, 0, "seed {seed} step {step}");
            assert_eq!(counters.qc_retry_count, 0, "seed {seed} step {step}");
            assert_eq!(counters.qc_wait_count, 0, "seed {seed} step {step}");
        }
    }
}

#[test]
fn negotiator_never_skips_a_waypoint_and_idle_means_zeroed_counters() {
    for seed in 1..=16 {
        walk(Afc, seed);
        walk(Qc, seed * 7_919);
        walk(AnyProtocol::new(ProtocolKind::Qc), seed * 104_729);
    }
}

#[test]
fn repeated_mode_selection_writes_once() {
    let modes = [AdcMode::None, AdcMode::ResistanceMode, AdcMode::VoltageMode];
    for first in modes {
        for second in modes {
            let bench = Bench::new(Charger::Plain);
            let mut sampler = AnalogSampler::new(&bench.chip);

            let wrote_first = block_on(sampler.set_mode(first)).expect("write");
            let wrote_again = block_on(sampler.set_mode(first)).expect("write");
            assert_eq!(wrote_first, first != AdcMode::None);
            assert!(!wrote_again);

            let wrote_second = block_on(sampler.set_mode(second)).expect("write");
            assert_eq!(wrote_second, second != first);

            let expected = usize::from(first != AdcMode::None) + usize::from(second != first);
            assert_eq!(bench.chip.writes_to(registers::ADC_CTRL).len(), expected);
            assert_eq!(usize::try_from(sampler.config_writes()), Ok(expected));
        }
    }
}

#[test]
fn wet_monitoring_keeps_a_fixed_interval() {
    let bench = Bench::new(Charger::Plain);
    bench.chip.set_wet(true);
    let port = bench.port(Afc);
    port.request_water_check();
    bench.service(&port);
    bench.advance(Duration::from_secs(30));
    bench.service(&port);
    assert_eq!(port.detector().state(), WaterState::Water2Idle);

    let interval = DetectorConfig::DEFAULT.long_monitor_interval;
    for round in 1..=5u32 {
        let scheduled = port
            .deadline(WorkKind::DryCheck)
            .expect("dry check armed");
        let expected = bench.now() + interval;
        assert_eq!(scheduled, expected, "round {round}");
        bench.jump_to(scheduled);
        bench.service(&port);
        assert_eq!(port.detector().state(), WaterState::Water2Idle);
        assert_eq!(port.detector().snapshot().dry_checks, round);
    }
}
