//! Simulated port chip and virtual time.
//!
//! The chip answers the logical register map with a crude model of the sense
//! pin and of the charger on the far end of the cable. Time only moves when
//! the session advances it or when the core sleeps through [`SimDelay`].

use std::cell::{Cell, RefCell};
use std::fmt;
use std::ops::Add;
use std::rc::Rc;
use std::time::Duration;

use charge_core::sampler::{AdcMode, BUS_FULL_SCALE_MV, PULL_UP_KOHM, SENSE_FULL_SCALE_MV};
use charge_core::schedule::Clock;
use charge_core::transport::registers::{self, FULL_SCALE, Reg};
use charge_core::transport::{RegisterTransport, TransportError};
use embedded_hal_async::delay::DelayNs;

/// Sense-pin resistance of a wet connector.
pub const WET_KOHM: i64 = 150;
/// Sense-pin resistance of a dry connector.
pub const DRY_KOHM: i64 = 2_000;
pub const WET_MV: i64 = 300;
pub const DRY_MV: i64 = 1_500;
/// Bus voltage a QC adapter settles at when it only half honours 9 V.
pub const QC_STUCK_MV: i64 = 6_000;

/// Microseconds since the session started.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct SimInstant(u64);

impl SimInstant {
    pub fn as_millis(self) -> u64 {
        self.0 / 1_000
    }

    pub fn saturating_duration_since(self, earlier: SimInstant) -> Duration {
        Duration::from_micros(self.0.saturating_sub(earlier.0))
    }
}

impl Add<Duration> for SimInstant {
    type Output = Self;

    fn add(self, rhs: Duration) -> Self::Output {
        let micros = u64::try_from(rhs.as_micros()).unwrap_or(u64::MAX);
        Self(self.0.saturating_add(micros))
    }
}

impl fmt::Display for SimInstant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "+{}ms", self.as_millis())
    }
}

/// Shared virtual clock. Clones observe the same time.
#[derive(Clone, Default)]
pub struct SimClock {
    ticks: Rc<Cell<u64>>,
}

impl SimClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, duration: Duration) {
        self.jump_to(self.now() + duration);
    }

    /// Moves time forward to `instant`; never backwards.
    pub fn jump_to(&self, instant: SimInstant) {
        if instant.0 > self.ticks.get() {
            self.ticks.set(instant.0);
        }
    }

    pub fn delay(&self) -> SimDelay {
        SimDelay {
            clock: self.clone(),
        }
    }
}

impl Clock for SimClock {
    type Instant = SimInstant;

    fn now(&self) -> SimInstant {
        SimInstant(self.ticks.get())
    }
}

/// Sleeps by moving the virtual clock, then yields once.
pub struct SimDelay {
    clock: SimClock,
}

impl DelayNs for SimDelay {
    async fn delay_ns(&mut self, ns: u32) {
        self.clock.advance(Duration::from_nanos(u64::from(ns)));
        embassy_futures::yield_now().await;
    }

    async fn delay_ms(&mut self, ms: u32) {
        self.clock.advance(Duration::from_millis(u64::from(ms)));
        embassy_futures::yield_now().await;
    }
}

/// What sits on the far end of the cable.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Adapter {
    /// 5 V only; ignores every data-line request.
    Plain,
    /// Answers mpings and honours AFC voltage selection.
    Afc,
    /// Honours QC 9 V requests.
    Qc,
    /// Acknowledges QC 9 V but never gets past [`QC_STUCK_MV`].
    QcStuck,
}

impl Adapter {
    pub const ALL: [Adapter; 4] = [Adapter::Plain, Adapter::Afc, Adapter::Qc, Adapter::QcStuck];

    pub const fn name(self) -> &'static str {
        match self {
            Adapter::Plain => "plain",
            Adapter::Afc => "afc",
            Adapter::Qc => "qc",
            Adapter::QcStuck => "qc-stuck",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|adapter| adapter.name().eq_ignore_ascii_case(name))
    }
}

impl fmt::Display for Adapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

struct ChipState {
    mode: AdcMode,
    wet: bool,
    adapter: Adapter,
    bus_mv: i64,
    latched: u16,
    ping_answered: bool,
    fail_bus: bool,
    register_writes: u32,
}

fn kohm_code(kohm: i64) -> u16 {
    u16::try_from(kohm * i64::from(FULL_SCALE) / (PULL_UP_KOHM + kohm)).unwrap_or(FULL_SCALE)
}

fn linear_code(millivolts: i64, full_scale_mv: i64) -> u16 {
    let code = (millivolts * i64::from(FULL_SCALE) + full_scale_mv - 1) / full_scale_mv;
    u16::try_from(code.clamp(0, i64::from(FULL_SCALE))).unwrap_or(FULL_SCALE)
}

/// Port chip model shared between the session and the coordinator.
#[derive(Clone)]
pub struct SimChip {
    state: Rc<RefCell<ChipState>>,
}

impl SimChip {
    pub fn new(adapter: Adapter) -> Self {
        Self {
            state: Rc::new(RefCell::new(ChipState {
                mode: AdcMode::None,
                wet: false,
                adapter,
                bus_mv: 0,
                latched: 0,
                ping_answered: false,
                fail_bus: false,
                register_writes: 0,
            })),
        }
    }

    pub fn set_wet(&self, wet: bool) {
        self.state.borrow_mut().wet = wet;
    }

    pub fn is_wet(&self) -> bool {
        self.state.borrow().wet
    }

    pub fn adapter(&self) -> Adapter {
        self.state.borrow().adapter
    }

    /// Swapping adapters drops the bus back to 5 V while powered.
    pub fn set_adapter(&self, adapter: Adapter) {
        let mut state = self.state.borrow_mut();
        state.adapter = adapter;
        if state.bus_mv != 0 {
            state.bus_mv = 5_000;
        }
    }

    pub fn set_powered(&self, powered: bool) {
        self.state.borrow_mut().bus_mv = if powered { 5_000 } else { 0 };
    }

    /// Makes every bus-voltage read fail until cleared.
    pub fn set_bus_fault(&self, fault: bool) {
        self.state.borrow_mut().fail_bus = fault;
    }

    pub fn bus_mv(&self) -> i64 {
        self.state.borrow().bus_mv
    }

    pub fn register_writes(&self) -> u32 {
        self.state.borrow().register_writes
    }

    /// Returns `true` once per mping the adapter answered.
    pub fn take_ping_answer(&self) -> bool {
        core::mem::take(&mut self.state.borrow_mut().ping_answered)
    }
}

impl RegisterTransport for SimChip {
    async fn read(&mut self, reg: Reg) -> Result<u8, TransportError> {
        let mut state = self.state.borrow_mut();
        let code = match reg {
            registers::SENSE_RESULT_H => match state.mode {
                AdcMode::ResistanceMode => kohm_code(if state.wet { WET_KOHM } else { DRY_KOHM }),
                AdcMode::VoltageMode => linear_code(
                    if state.wet { WET_MV } else { DRY_MV },
                    SENSE_FULL_SCALE_MV,
                ),
                AdcMode::None => 0,
            },
            registers::VBUS_RESULT_H if state.fail_bus => return Err(TransportError::Bus),
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
        state.register_writes += 1;
        let powered = state.bus_mv != 0;
        match (reg, value, state.adapter) {
            (registers::ADC_CTRL, registers::ADC_MODE_RESISTANCE, _) => {
                state.mode = AdcMode::ResistanceMode;
            }
            (registers::ADC_CTRL, registers::ADC_MODE_VOLTAGE, _) => {
                state.mode = AdcMode::VoltageMode;
            }
            (registers::ADC_CTRL, _, _) => state.mode = AdcMode::None,
            (registers::AFC_CTRL, registers::AFC_CTRL_PING, Adapter::Afc) if powered => {
                state.ping_answered = true;
            }
            (registers::AFC_TX, registers::AFC_TX_9V, Adapter::Afc) if powered => {
                state.bus_mv = 9_000;
            }
            (registers::AFC_TX, registers::AFC_TX_5V, Adapter::Afc) if powered => {
                state.bus_mv = 5_000;
            }
            (registers::QC_CTRL, registers::QC_LEVEL_9V, Adapter::Qc) if powered => {
                state.bus_mv = 9_000;
            }
            (registers::QC_CTRL, registers::QC_LEVEL_9V, Adapter::QcStuck) if powered => {
                state.bus_mv = QC_STUCK_MV;
            }
            (registers::QC_CTRL, _, _) | (registers::AFC_CTRL, registers::AFC_CTRL_RESET, _)
                if powered =>
            {
                state.bus_mv = 5_000;
            }
            _ => {}
        }
        Ok(())
    }
}
