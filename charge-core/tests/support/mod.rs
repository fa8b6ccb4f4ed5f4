//! Bench rig for the integration tests: a port chip with a crude liquid and
//! charger model, a virtual clock, and a delay that advances it.

#![allow(dead_code)]

use core::cell::{Cell, RefCell};
use core::ops::Add;
use core::time::Duration;

use charge_core::hv::{HvProtocol, NegotiatorConfig};
use charge_core::port::{Notification, PortCoordinator};
use charge_core::sampler::{AdcMode, BUS_FULL_SCALE_MV, PULL_UP_KOHM, SENSE_FULL_SCALE_MV};
use charge_core::schedule::Clock;
use charge_core::transport::registers::{self, FULL_SCALE, Reg};
use charge_core::transport::{RegisterTransport, TransportError};
use charge_core::water::DetectorConfig;
use embassy_futures::block_on;
use embassy_sync::blocking_mutex::raw::NoopRawMutex;
use embedded_hal_async::delay::DelayNs;
use heapless::{Deque, Vec as HeaplessVec};

pub const WET_KOHM: i64 = 150;
pub const DRY_KOHM: i64 = 2_000;
pub const WET_MV: i64 = 300;
pub const DRY_MV: i64 = 1_500;

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct BenchInstant(pub u64);

impl BenchInstant {
    pub fn as_millis(self) -> u64 {
        self.0 / 1_000
    }
}

fn micros(duration: Duration) -> u64 {
    u64::try_from(duration.as_micros()).expect("bench durations fit in u64")
}

impl Add<Duration> for BenchInstant {
    type Output = Self;

    fn add(self, rhs: Duration) -> Self::Output {
        Self(self.0 + micros(rhs))
    }
}

pub struct BenchClock<'a> {
    ticks: &'a Cell<u64>,
}

impl Clock for BenchClock<'_> {
    type Instant = BenchInstant;

    fn now(&self) -> BenchInstant {
        BenchInstant(self.ticks.get())
    }
}

pub struct BenchDelay<'a> {
    ticks: &'a Cell<u64>,
}

impl DelayNs for BenchDelay<'_> {
    async fn delay_ns(&mut self, ns: u32) {
        self.ticks.set(self.ticks.get() + u64::from(ns) / 1_000);
        embassy_futures::yield_now().await;
    }

    async fn delay_ms(&mut self, ms: u32) {
        self.ticks.set(self.ticks.get() + u64::from(ms) * 1_000);
        embassy_futures::yield_now().await;
    }
}

fn kohm_code(kohm: i64) -> u16 {
    u16::try_from(kohm * i64::from(FULL_SCALE) / (PULL_UP_KOHM + kohm))
        .expect("kohm code fits the converter")
}

fn linear_code(millivolts: i64, full_scale_mv: i64) -> u16 {
    let code = (millivolts * i64::from(FULL_SCALE) + full_scale_mv - 1) / full_scale_mv;
    u16::try_from(code.clamp(0, i64::from(FULL_SCALE))).expect("clamped to full scale")
}

/// How the charger on the far end reacts to data-line requests.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Charger {
    /// Ignores every request; the bus stays at 5 V.
    Plain,
    /// Moves the bus to the selected AFC voltage.
    Afc,
    /// Moves the bus to `millivolts` when asked for 9 V over QC.
    Qc { millivolts: i64 },
}

struct BenchState {
    mode: AdcMode,
    wet: bool,
    resistances: Deque<i64, 64>,
    voltages: Deque<i64, 64>,
    charger: Charger,
    bus_mv: i64,
    latched: u16,
    sense_reads: u32,
    writes: HeaplessVec<(Reg, u8), 1024>,
}

/// Port chip model.
///
/// Sense readings follow the `wet` flag unless a per-sample script is
/// queued. Bus readings follow the charger model.
pub struct BenchChip {
    state: RefCell<BenchState>,
}

impl BenchChip {
    pub fn new(charger: Charger) -> Self {
        Self {
            state: RefCell::new(BenchState {
                mode: AdcMode::None,
                wet: false,
                resistances: Deque::new(),
                voltages: Deque::new(),
                charger,
                bus_mv: 5_000,
                latched: 0,
                sense_reads: 0,
                writes: HeaplessVec::new(),
            }),
        }
    }

    pub fn set_wet(&self, wet: bool) {
        self.state.borrow_mut().wet = wet;
    }

    pub fn script_resistances(&self, kohms: &[i64]) {
        let mut state = self.state.borrow_mut();
        for kohm in kohms {
            state.resistances.push_back(*kohm).expect("resistance script full");
        }
    }

    pub fn script_voltages(&self, millivolts: &[i64]) {
        let mut state = self.state.borrow_mut();
        for mv in millivolts {
            state.voltages.push_back(*mv).expect("voltage script full");
        }
    }

    pub fn bus_mv(&self) -> i64 {
        self.state.borrow().bus_mv
    }

    pub fn sense_reads(&self) -> u32 {
        self.state.borrow().sense_reads
    }

    pub fn writes_to(&self, reg: Reg) -> HeaplessVec<u8, 1024> {
        self.state
            .borrow()
            .writes
            .iter()
            .filter(|(target, _)| *target == reg)
            .map(|(_, value)| *value)
            .collect()
    }

    pub fn clear_writes(&self) {
        self.state.borrow_mut().writes.clear();
    }
}

impl RegisterTransport for &BenchChip {
    async fn read(&mut self, reg: Reg) -> Result<u8, TransportError> {
        let mut state = self.state.borrow_mut();
        let code = match reg {
            registers::SENSE_RESULT_H => {
                state.sense_reads += 1;
                match state.mode {
                    AdcMode::ResistanceMode => {
                        let fallback = if state.wet { WET_KOHM } else { DRY_KOHM };
                        kohm_code(state.resistances.pop_front().unwrap_or(fallback))
                    }
                    AdcMode::VoltageMode => {
                        let fallback = if state.wet { WET_MV } else { DRY_MV };
                        linear_code(
                            state.voltages.pop_front().unwrap_or(fallback),
                            SENSE_FULL_SCALE_MV,
                        )
                    }
                    AdcMode::None => 0,
                }
            }
            registers::VBUS_RESULT_H => linear_code(state.bus_mv, BUS_FULL_SCALE_MV),
            registers::SENSE_RESULT_L | registers::VBUS_RESULT_L => {
                return Ok(state.latched.to_be_bytes()[1]);
            }
            _ => return Ok(0),
        };
        state.latched = code;
        Ok(code.to_be_bytes()[0])
    }

    async fn write(&mut self, reg: Reg, value: u8) -> Result<(), TransportError> {
        let mut state = self.state.borrow_mut();
        match (reg, value, state.charger) {
            (registers::ADC_CTRL, registers::ADC_MODE_RESISTANCE, _) => {
                state.mode = AdcMode::ResistanceMode;
            }
            (registers::ADC_CTRL, registers::ADC_MODE_VOLTAGE, _) => {
                state.mode = AdcMode::VoltageMode;
            }
            (registers::ADC_CTRL, _, _) => state.mode = AdcMode::None,
            (registers::AFC_TX, registers::AFC_TX_9V, Charger::Afc) => state.bus_mv = 9_000,
            (registers::AFC_TX, registers::AFC_TX_5V, Charger::Afc) => state.bus_mv = 5_000,
            (registers::QC_CTRL, registers::QC_LEVEL_9V, Charger::Qc { millivolts }) => {
                state.bus_mv = millivolts;
            }
            (registers::QC_CTRL, _, _) | (registers::AFC_CTRL, registers::AFC_CTRL_RESET, _) => {
                state.bus_mv = 5_000;
            }
            _ => {}
        }
        state.writes.push((reg, value)).expect("write log full");
        Ok(())
    }
}

pub type BenchPort<'a, P> = PortCoordinator<NoopRawMutex, &'a BenchChip, P, BenchClock<'a>>;

/// Chip, virtual time and the port built over them.
pub struct Bench {
    pub chip: BenchChip,
    pub ticks: Cell<u64>,
}

impl Bench {
    pub fn new(charger: Charger) -> Self {
        Self {
            chip: BenchChip::new(charger),
            ticks: Cell::new(0),
        }
    }

    pub fn port<P: HvProtocol>(&self, protocol: P) -> BenchPort<'_, P> {
        self.port_with(protocol, DetectorConfig::DEFAULT, NegotiatorConfig::DEFAULT)
    }

    pub fn port_with<P: HvProtocol>(
        &self,
        protocol: P,
        detector: DetectorConfig,
        negotiator: NegotiatorConfig,
    ) -> BenchPort<'_, P> {
        PortCoordinator::new(
            &self.chip,
            protocol,
            self.clock(),
            detector,
            negotiator,
        )
        .expect("bench config is valid")
    }

    pub fn clock(&self) -> BenchClock<'_> {
        BenchClock { ticks: &self.ticks }
    }

    pub fn delay(&self) -> BenchDelay<'_> {
        BenchDelay { ticks: &self.ticks }
    }

    pub fn now(&self) -> BenchInstant {
        BenchInstant(self.ticks.get())
    }

    pub fn advance(&self, duration: Duration) {
        self.ticks.set(self.ticks.get() + micros(duration));
    }

    /// Moves virtual time forward to `instant`; never backwards.
    pub fn jump_to(&self, instant: BenchInstant) {
        if instant.0 > self.ticks.get() {
            self.ticks.set(instant.0);
        }
    }

    /// Runs one service pass and returns the next deadline.
    pub fn service<P: HvProtocol>(&self, port: &BenchPort<'_, P>) -> Option<BenchInstant> {
        let mut delay = self.delay();
        block_on(port.service(&mut delay))
    }

    /// Services the port, jumping virtual time to each deadline until none
    /// falls within `horizon`.
    pub fn run_for<P: HvProtocol>(&self, port: &BenchPort<'_, P>, horizon: Duration) {
        let end = self.now() + horizon;
        while let Some(deadline) = self.service(port) {
            if deadline > end {
                break;
            }
            if deadline > self.now() {
                self.ticks.set(deadline.0);
            }
        }
        if self.now() < end {
            self.ticks.set(end.0);
        }
    }
}

pub fn drain<P: HvProtocol>(port: &BenchPort<'_, P>) -> HeaplessVec<Notification, 32> {
    let mut drained = HeaplessVec::new();
    while let Some(notification) = port.next_notification() {
        drained.push(notification).expect("notification log full");
    }
    drained
}
