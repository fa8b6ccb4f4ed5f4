use core::{fmt, mem};

use heapless::Deque;

use crate::hv::{ChargeTier, ProtocolKind};

/// RID values (kΩ) fitted to factory and service jigs.
pub const FACTORY_JIG_KOHMS: [u16; 4] = [255, 301, 523, 619];

/// Resistance read on the ID line at attach.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ResistanceId {
    pub kohm: u16,
}

impl ResistanceId {
    #[must_use]
    pub const fn new(kohm: u16) -> Self {
        Self { kohm }
    }

    /// `true` for the fixed resistors fitted to factory jigs.
    #[must_use]
    pub fn is_factory_jig(self) -> bool {
        FACTORY_JIG_KOHMS.contains(&self.kohm)
    }
}

/// What the rest of the system should believe is plugged in.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AttachedDeviceFact {
    #[default]
    None,
    /// Plain 5 V charger or host port.
    UsbCharger,
    ActiveFastCharger {
        protocol: ProtocolKind,
        millivolts: u16,
    },
    WaterDetected,
    FactoryJig(ResistanceId),
}

impl fmt::Display for AttachedDeviceFact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttachedDeviceFact::None => f.write_str("none"),
            AttachedDeviceFact::UsbCharger => f.write_str("usb-charger"),
            AttachedDeviceFact::ActiveFastCharger {
                protocol,
                millivolts,
            } => write!(f, "fast-charger {} {}mV", protocol.name(), millivolts),
            AttachedDeviceFact::WaterDetected => f.write_str("water-detected"),
            AttachedDeviceFact::FactoryJig(rid) => write!(f, "factory-jig {}k", rid.kohm),
        }
    }
}

/// Message for the charger and path-switch collaborators.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Notification {
    Fact(AttachedDeviceFact),
    /// Block (`true`) or release (`false`) the charge path.
    Hiccup(bool),
    ChargeTier(ChargeTier),
}

impl Notification {
    fn same_kind(&self, other: &Self) -> bool {
        mem::discriminant(self) == mem::discriminant(other)
    }
}

impl fmt::Display for Notification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Notification::Fact(fact) => write!(f, "fact {fact}"),
            Notification::Hiccup(true) => f.write_str("hiccup on"),
            Notification::Hiccup(false) => f.write_str("hiccup off"),
            Notification::ChargeTier(ChargeTier::TwoLevel) => f.write_str("tier 2-level"),
            Notification::ChargeTier(ChargeTier::ThreeLevel) => f.write_str("tier 3-level"),
        }
    }
}

/// Default outbox depth.
pub const OUTBOX_CAPACITY: usize = 16;

/// Bounded notification queue.
///
/// When full, the oldest entry that a later entry of the same kind supersedes
/// is discarded, so the newest fact, hiccup and tier always survive. Only
/// with no superseded entry left does the plain oldest entry go.
pub struct Outbox<const N: usize = OUTBOX_CAPACITY> {
    queue: Deque<Notification, N>,
    dropped: u32,
}

impl<const N: usize> Outbox<N> {
    pub const fn new() -> Self {
        Self {
            queue: Deque::new(),
            dropped: 0,
        }
    }

    pub fn push(&mut self, notification: Notification) {
        if self.queue.is_full() {
            self.evict_superseded(notification);
        }
        let _ = self.queue.push_back(notification);
    }

    fn evict_superseded(&mut self, incoming: Notification) {
        let victim = self
            .queue
            .iter()
            .enumerate()
            .position(|(index, entry)| {
                entry.same_kind(&incoming)
                    || self
                        .queue
                        .iter()
                        .skip(index + 1)
                        .any(|later| later.same_kind(entry))
            })
            .unwrap_or(0);

        let old = mem::replace(&mut self.queue, Deque::new());
        for (index, entry) in old.iter().copied().enumerate() {
            if index == victim {
                warn!("port: outbox full, dropped superseded {:?}", entry);
            } else {
                let _ = self.queue.push_back(entry);
            }
        }
        self.dropped = self.dropped.wrapping_add(1);
    }

    pub fn pop(&mut self) -> Option<Notification> {
        self.queue.pop_front()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Notifications discarded because the queue was full.
    #[must_use]
    pub fn dropped(&self) -> u32 {
        self.dropped
    }
}

impl<const N: usize> Default for Outbox<N> {
    fn default() -> Self {
        Self::new()
    }
}
