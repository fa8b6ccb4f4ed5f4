//! Telemetry event catalog and the in-memory history ring.
//!
//! Events carry compact numeric codes so they can cross a diagnostics link
//! without pulling a serializer into the firmware. Payloads hold the burst
//! tallies and retry counters that explain a transition.

use core::fmt;

use heapless::{HistoryBuf, OldestOrdered};

use crate::hv::{HvState, RetryCounters};
use crate::port::AttachedDeviceFact;
use crate::sampler::BurstTally;
use crate::water::WaterState;

/// Monotonic telemetry identifier.
pub type EventId = u32;

/// Discriminated telemetry events.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TelemetryEventKind {
    Attached,
    Detached,
    WaterTransition { from: WaterState, to: WaterState },
    CheckInconclusive(WaterState),
    HvTransition { from: HvState, to: HvState },
    NegotiationFailed,
    FactPublished(FactCode),
    Custom(u16),
}

/// Fact discriminant without payload.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FactCode {
    None,
    UsbCharger,
    ActiveFastCharger,
    WaterDetected,
    FactoryJig,
}

impl From<AttachedDeviceFact> for FactCode {
    fn from(fact: AttachedDeviceFact) -> Self {
        match fact {
            AttachedDeviceFact::None => FactCode::None,
            AttachedDeviceFact::UsbCharger => FactCode::UsbCharger,
            AttachedDeviceFact::ActiveFastCharger { .. } => FactCode::ActiveFastCharger,
            AttachedDeviceFact::WaterDetected => FactCode::WaterDetected,
            AttachedDeviceFact::FactoryJig(_) => FactCode::FactoryJig,
        }
    }
}

impl fmt::Display for TelemetryEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TelemetryEventKind::Attached => f.write_str("attached"),
            TelemetryEventKind::Detached => f.write_str("detached"),
            TelemetryEventKind::WaterTransition { from, to } => write!(f, "water {from} -> {to}"),
            TelemetryEventKind::CheckInconclusive(state) => {
                write!(f, "check-inconclusive in {state}")
            }
            TelemetryEventKind::HvTransition { from, to } => write!(f, "hv {from} -> {to}"),
            TelemetryEventKind::NegotiationFailed => f.write_str("negotiation-failed"),
            TelemetryEventKind::FactPublished(code) => write!(f, "fact {code:?}"),
            TelemetryEventKind::Custom(code) => write!(f, "custom({code})"),
        }
    }
}

const WATER_STATES: [WaterState; 5] = [
    WaterState::DryIdle,
    WaterState::DryDetecting,
    WaterState::Water1Idle,
    WaterState::Water2Idle,
    WaterState::WaterDetecting,
];

const FACT_CODES: [FactCode; 5] = [
    FactCode::None,
    FactCode::UsbCharger,
    FactCode::ActiveFastCharger,
    FactCode::WaterDetected,
    FactCode::FactoryJig,
];

impl TelemetryEventKind {
    const ATTACHED_CODE: u16 = 0x0001;
    const DETACHED_CODE: u16 = 0x0002;
    const NEGOTIATION_FAILED_CODE: u16 = 0x0003;
    const INCONCLUSIVE_BASE: u16 = 0x0010;
    const FACT_BASE: u16 = 0x0020;
    const WATER_BASE: u16 = 0x0100;
    const HV_BASE: u16 = 0x0200;

    /// Encodes the event into a compact transport-friendly discriminant.
    #[must_use]
    pub fn to_raw(self) -> u16 {
        match self {
            TelemetryEventKind::Attached => Self::ATTACHED_CODE,
            TelemetryEventKind::Detached => Self::DETACHED_CODE,
            TelemetryEventKind::NegotiationFailed => Self::NEGOTIATION_FAILED_CODE,
            TelemetryEventKind::CheckInconclusive(state) => {
                Self::INCONCLUSIVE_BASE + water_index(state)
            }
            TelemetryEventKind::FactPublished(code) => Self::FACT_BASE + fact_index(code),
            TelemetryEventKind::WaterTransition { from, to } => {
                Self::WATER_BASE + (water_index(from) << 3) + water_index(to)
            }
            TelemetryEventKind::HvTransition { from, to } => {
                Self::HV_BASE + (hv_index(from) << 3) + hv_index(to)
            }
            TelemetryEventKind::Custom(code) => code,
        }
    }

    /// Decodes a raw discriminant, falling back to [`TelemetryEventKind::Custom`].
    #[must_use]
    pub fn from_raw(code: u16) -> Self {
        let decoded = match code {
            Self::ATTACHED_CODE => Some(TelemetryEventKind::Attached),
            Self::DETACHED_CODE => Some(TelemetryEventKind::Detached),
            Self::NEGOTIATION_FAILED_CODE => Some(TelemetryEventKind::NegotiationFailed),
            value if (Self::INCONCLUSIVE_BASE..Self::FACT_BASE).contains(&value) => {
                water_from_index(value - Self::INCONCLUSIVE_BASE)
                    .map(TelemetryEventKind::CheckInconclusive)
            }
            value if (Self::FACT_BASE..Self::WATER_BASE).contains(&value) => {
                fact_from_index(value - Self::FACT_BASE).map(TelemetryEventKind::FactPublished)
            }
            value if (Self::WATER_BASE..Self::HV_BASE).contains(&value) => {
                let offset = value - Self::WATER_BASE;
                water_from_index(offset >> 3)
                    .zip(water_from_index(offset & 0x7))
                    .map(|(from, to)| TelemetryEventKind::WaterTransition { from, to })
            }
            value if (Self::HV_BASE..Self::HV_BASE + 0x40).contains(&value) => {
                let offset = value - Self::HV_BASE;
                hv_from_index(offset >> 3)
                    .zip(hv_from_index(offset & 0x7))
                    .map(|(from, to)| TelemetryEventKind::HvTransition { from, to })
            }
            _ => None,
        };
        decoded.unwrap_or(TelemetryEventKind::Custom(code))
    }
}

/// Position of `item` in `table` as a raw-code offset.
fn index_of<T: PartialEq>(table: &[T], item: T) -> u16 {
    table
        .iter()
        .position(|candidate| *candidate == item)
        .and_then(|index| u16::try_from(index).ok())
        .unwrap_or(0)
}

fn water_index(state: WaterState) -> u16 {
    index_of(&WATER_STATES, state)
}

fn water_from_index(index: u16) -> Option<WaterState> {
    WATER_STATES.get(usize::from(index)).copied()
}

fn fact_index(code: FactCode) -> u16 {
    index_of(&FACT_CODES, code)
}

fn fact_from_index(index: u16) -> Option<FactCode> {
    FACT_CODES.get(usize::from(index)).copied()
}

fn hv_index(state: HvState) -> u16 {
    index_of(&HvState::ALL, state)
}

fn hv_from_index(index: u16) -> Option<HvState> {
    HvState::ALL.get(usize::from(index)).copied()
}

/// Extra data stored with an event.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub enum TelemetryPayload {
    #[default]
    None,
    /// Burst tallies behind a water decision.
    Water {
        resistance: Option<BurstTally>,
        voltage: Option<BurstTally>,
    },
    /// Retry counters at the time of an HV transition.
    Counters(RetryCounters),
}

/// Total number of telemetry entries retained in memory.
pub const TELEMETRY_RING_CAPACITY: usize = 64;

/// Telemetry record stored in the ring buffer.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TelemetryRecord<Instant: Copy> {
    pub id: EventId,
    pub timestamp: Instant,
    pub event: TelemetryEventKind,
    pub details: TelemetryPayload,
}

/// Records telemetry events into a fixed-size ring buffer.
pub struct TelemetryRecorder<Instant: Copy, const CAPACITY: usize = TELEMETRY_RING_CAPACITY> {
    ring: HistoryBuf<TelemetryRecord<Instant>, CAPACITY>,
    next_event_id: EventId,
}

impl<Instant: Copy, const CAPACITY: usize> TelemetryRecorder<Instant, CAPACITY> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            ring: HistoryBuf::new(),
            next_event_id: 0,
        }
    }

    /// Records in chronological order.
    #[must_use]
    pub fn oldest_first(&self) -> OldestOrdered<'_, TelemetryRecord<Instant>> {
        self.ring.oldest_ordered()
    }

    #[must_use]
    pub fn latest(&self) -> Option<&TelemetryRecord<Instant>> {
        self.ring.recent()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.ring.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    /// Total events recorded, including those rotated out of the ring.
    #[must_use]
    pub fn total(&self) -> EventId {
        self.next_event_id
    }

    pub fn record(
        &mut self,
        event: TelemetryEventKind,
        details: TelemetryPayload,
        timestamp: Instant,
    ) -> EventId {
        let id = self.next_event_id;
        self.next_event_id = self.next_event_id.wrapping_add(1);
        self.ring.write(TelemetryRecord {
            id,
            timestamp,
            event,
            details,
        });
        id
    }

    /// Records a water state change with the tallies behind it.
    pub fn record_water(
        &mut self,
        from: WaterState,
        to: WaterState,
        resistance: Option<BurstTally>,
        voltage: Option<BurstTally>,
        timestamp: Instant,
    ) -> EventId {
        self.record(
            TelemetryEventKind::WaterTransition { from, to },
            TelemetryPayload::Water {
                resistance,
                voltage,
            },
            timestamp,
        )
    }

    pub fn record_hv(
        &mut self,
        from: HvState,
        to: HvState,
        counters: RetryCounters,
        timestamp: Instant,
    ) -> EventId {
        self.record(
            TelemetryEventKind::HvTransition { from, to },
            TelemetryPayload::Counters(counters),
            timestamp,
        )
    }

    pub fn record_fact(&mut self, fact: AttachedDeviceFact, timestamp: Instant) -> EventId {
        self.record(
            TelemetryEventKind::FactPublished(fact.into()),
            TelemetryPayload::None,
            timestamp,
        )
    }
}

impl<Instant: Copy, const CAPACITY: usize> Default for TelemetryRecorder<Instant, CAPACITY> {
    fn default() -> Self {
        Self::new()
    }
}
