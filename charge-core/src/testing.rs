//! Shared fakes for unit tests: a virtual clock, a delay that advances it, and
//! a scripted port chip.

use core::cell::{Cell, RefCell};
use core::ops::Add;
use core::time::Duration;

use embedded_hal_async::delay::DelayNs;
use heapless::{Deque, Vec};

use crate::sampler::{AdcMode, BUS_FULL_SCALE_MV, PULL_UP_KOHM, SENSE_FULL_SCALE_MV};
use crate::schedule::Clock;
use crate::transport::registers::{self, FULL_SCALE, Reg};
use crate::transport::{RegisterTransport, TransportError};

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MockInstant(pub u64);

impl MockInstant {
    pub fn millis(value: u64) -> Self {
        Self(value * 1_000)
    }
}

fn micros(duration: Duration) -> u64 {
    u64::try_from(duration.as_micros()).expect("test durations fit in u64")
}

impl Add<Duration> for MockInstant {
    type Output = Self;

    fn add(self, rhs: Duration) -> Self::Output {
        Self(self.0 + micros(rhs))
    }
}

pub struct MockClock<'a> {
    ticks: &'a Cell<u64>,
}

impl<'a> MockClock<'a> {
    pub fn new(ticks: &'a Cell<u64>) -> Self {
        Self { ticks }
    }

    pub fn advance(&self, duration: Duration) {
        self.ticks.set(self.ticks.get() + micros(duration));
    }

    pub fn set(&self, instant: MockInstant) {
        self.ticks.set(instant.0);
    }
}

impl Clock for MockClock<'_> {
    type Instant = MockInstant;

    fn now(&self) -> MockInstant {
        MockInstant(self.ticks.get())
    }
}

/// Advances the shared tick counter and yields once so joined futures
/// interleave at every sleep.
pub struct MockDelay<'a> {
    ticks: &'a Cell<u64>,
}

impl<'a> MockDelay<'a> {
    pub fn new(ticks: &'a Cell<u64>) -> Self {
        Self { ticks }
    }
}

impl DelayNs for MockDelay<'_> {
    async fn delay_ns(&mut self, ns: u32) {
        self.ticks.set(self.ticks.get() + u64::from(ns) / 1_000);
        embassy_futures::yield_now().await;
    }

    async fn delay_ms(&mut self, ms: u32) {
        self.ticks.set(self.ticks.get() + u64::from(ms) * 1_000);
        embassy_futures::yield_now().await;
    }
}

pub fn code_for_kohm(kohm: i64) -> u16 {
    let code = kohm * i64::from(FULL_SCALE) / (PULL_UP_KOHM + kohm);
    u16::try_from(code).expect("kohm code fits the converter")
}

fn ceil_code(millivolts: i64, full_scale_mv: i64) -> u16 {
    let code = (millivolts * i64::from(FULL_SCALE) + full_scale_mv - 1) / full_scale_mv;
    u16::try_from(code.clamp(0, i64::from(FULL_SCALE))).expect("clamped to full scale")
}

pub fn code_for_sense_mv(millivolts: i64) -> u16 {
    ceil_code(millivolts, SENSE_FULL_SCALE_MV)
}

pub fn code_for_bus_mv(millivolts: i64) -> u16 {
    ceil_code(millivolts, BUS_FULL_SCALE_MV)
}

struct ChipState {
    mode: AdcMode,
    resistance_codes: Deque<u16, 32>,
    voltage_codes: Deque<u16, 32>,
    bus_codes: Deque<u16, 32>,
    default_resistance: u16,
    default_voltage: u16,
    default_bus: u16,
    latched: u16,
    writes: Vec<(Reg, u8), 512>,
    fail_reads: bool,
    sense_reads: u32,
}

/// Port chip fake serving queued conversion codes per channel.
///
/// When a queue runs dry the chip keeps answering with a dry-port default.
pub struct ScriptedChip {
    state: RefCell<ChipState>,
}

impl ScriptedChip {
    pub fn new() -> Self {
        Self {
            state: RefCell::new(ChipState {
                mode: AdcMode::None,
                resistance_codes: Deque::new(),
                voltage_codes: Deque::new(),
                bus_codes: Deque::new(),
                default_resistance: code_for_kohm(2_000),
                default_voltage: code_for_sense_mv(1_500),
                default_bus: code_for_bus_mv(5_000),
                latched: 0,
                writes: Vec::new(),
                fail_reads: false,
                sense_reads: 0,
            }),
        }
    }

    pub fn push_sense_code(&self, code: u16) {
        let _ = self.state.borrow_mut().resistance_codes.push_back(code);
    }

    pub fn push_resistances(&self, kohms: &[i64]) {
        for kohm in kohms {
            self.push_sense_code(code_for_kohm(*kohm));
        }
    }

    pub fn push_sense_voltages(&self, millivolts: &[i64]) {
        let mut state = self.state.borrow_mut();
        for mv in millivolts {
            let _ = state.voltage_codes.push_back(code_for_sense_mv(*mv));
        }
    }

    pub fn push_bus_voltages(&self, millivolts: &[i64]) {
        let mut state = self.state.borrow_mut();
        for mv in millivolts {
            let _ = state.bus_codes.push_back(code_for_bus_mv(*mv));
        }
    }

    pub fn set_default_bus(&self, millivolts: i64) {
        self.state.borrow_mut().default_bus = code_for_bus_mv(millivolts);
    }

    pub fn set_wet_defaults(&self) {
        let mut state = self.state.borrow_mut();
        state.default_resistance = code_for_kohm(150);
        state.default_voltage = code_for_sense_mv(300);
    }

    pub fn set_dry_defaults(&self) {
        let mut state = self.state.borrow_mut();
        state.default_resistance = code_for_kohm(2_000);
        state.default_voltage = code_for_sense_mv(1_500);
    }

    pub fn fail_reads(&self, fail: bool) {
        self.state.borrow_mut().fail_reads = fail;
    }

    pub fn sense_reads(&self) -> u32 {
        self.state.borrow().sense_reads
    }

    pub fn writes_to(&self, reg: Reg) -> usize {
        self.state
            .borrow()
            .writes
            .iter()
            .filter(|(target, _)| *target == reg)
            .count()
    }

    pub fn values_written(&self, reg: Reg) -> Vec<u8, 512> {
        self.state
            .borrow()
            .writes
            .iter()
            .filter(|(target, _)| *target == reg)
            .map(|(_, value)| *value)
            .collect()
    }

    pub fn total_writes(&self) -> usize {
        self.state.borrow().writes.len()
    }
}

impl RegisterTransport for &ScriptedChip {
    async fn read(&mut self, reg: Reg) -> Result<u8, TransportError> {
        let mut state = self.state.borrow_mut();
        if state.fail_reads {
            return Err(TransportError::Bus);
        }

        let code = match reg {
            registers::SENSE_RESULT_H => {
                state.sense_reads += 1;
                match state.mode {
                    AdcMode::ResistanceMode => {
                        let fallback = state.default_resistance;
                        state.resistance_codes.pop_front().unwrap_or(fallback)
                    }
                    AdcMode::VoltageMode => {
                        let fallback = state.default_voltage;
                        state.voltage_codes.pop_front().unwrap_or(fallback)
                    }
                    AdcMode::None => 0,
                }
            }
            registers::VBUS_RESULT_H => {
                let fallback = state.default_bus;
                state.bus_codes.pop_front().unwrap_or(fallback)
            }
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
        if reg == registers::ADC_CTRL {
            state.mode = match value {
                registers::ADC_MODE_RESISTANCE => AdcMode::ResistanceMode,
                registers::ADC_MODE_VOLTAGE => AdcMode::VoltageMode,
                _ => AdcMode::None,
            };
        }
        let _ = state.writes.push((reg, value));
        Ok(())
    }
}
