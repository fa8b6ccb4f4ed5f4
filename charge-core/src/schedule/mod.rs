//! Deferred work bookkeeping.
//!
//! Every logical check owns exactly one slot in a [`WorkQueue`]. Scheduling a
//! kind that is already pending replaces the old deadline, so stale
//! evaluations never run against newer state and duplicates never pile up.
//! Each pending slot pins a [`WakeLock`] hold; the hold transfers to a
//! [`WakeGuard`] when the item is taken and is released when that guard drops,
//! whether the work finished or bailed out early.

use core::ops::Add;
use core::time::Duration;

use portable_atomic::{AtomicU32, Ordering};

/// Monotonic time source used by the worker.
pub trait Clock {
    type Instant: Copy + Ord + Add<Duration, Output = Self::Instant>;

    /// Returns the current instant.
    fn now(&self) -> Self::Instant;
}

impl<C: Clock> Clock for &C {
    type Instant = C::Instant;

    fn now(&self) -> Self::Instant {
        (**self).now()
    }
}

/// Converts a duration into the millisecond argument `DelayNs` expects.
#[must_use]
pub fn duration_to_millis(duration: Duration) -> u32 {
    u32::try_from(duration.as_millis()).unwrap_or(u32::MAX)
}

/// Identifies a single-shot deferred work item.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum WorkKind {
    /// Wet check (also used for inconclusive rechecks).
    WaterCheck,
    /// Water1 hold expiry; promotes the port to long-term monitoring.
    WaterPromote,
    /// Periodic dry check while wet.
    DryCheck,
    /// One attempt of a factory water test.
    FactoryWaterCheck,
    /// AFC handshake ping went unanswered.
    PingTimeout,
    /// Bus-voltage poll (AFC verification, QC settling).
    BusPoll,
}

/// Number of distinct [`WorkKind`] values.
pub const WORK_KIND_COUNT: usize = 6;

impl WorkKind {
    /// All work kinds in slot order.
    pub const ALL: [WorkKind; WORK_KIND_COUNT] = [
        WorkKind::WaterCheck,
        WorkKind::WaterPromote,
        WorkKind::DryCheck,
        WorkKind::FactoryWaterCheck,
        WorkKind::PingTimeout,
        WorkKind::BusPoll,
    ];

    const fn index(self) -> usize {
        match self {
            WorkKind::WaterCheck => 0,
            WorkKind::WaterPromote => 1,
            WorkKind::DryCheck => 2,
            WorkKind::FactoryWaterCheck => 3,
            WorkKind::PingTimeout => 4,
            WorkKind::BusPoll => 5,
        }
    }
}

/// Counts outstanding reasons to keep the system awake.
pub struct WakeLock {
    holds: AtomicU32,
}

impl WakeLock {
    pub const fn new() -> Self {
        Self {
            holds: AtomicU32::new(0),
        }
    }

    /// Returns `true` while any hold is outstanding.
    #[must_use]
    pub fn is_held(&self) -> bool {
        self.holds.load(Ordering::Acquire) > 0
    }

    /// Number of outstanding holds.
    #[must_use]
    pub fn holds(&self) -> u32 {
        self.holds.load(Ordering::Acquire)
    }

    fn acquire(&self) {
        self.holds.fetch_add(1, Ordering::AcqRel);
    }

    fn release(&self) {
        // Saturate instead of wrapping if a release ever races a reset.
        let _ = self
            .holds
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |value| {
                Some(value.saturating_sub(1))
            });
    }
}

impl Default for WakeLock {
    fn default() -> Self {
        Self::new()
    }
}

/// Keeps one wake hold alive for the duration of a work item.
#[must_use = "dropping the guard releases the wake hold"]
pub struct WakeGuard<'a> {
    lock: &'a WakeLock,
}

impl<'a> WakeGuard<'a> {
    /// Adopts a hold that was taken when the work was scheduled.
    fn adopt(lock: &'a WakeLock) -> Self {
        Self { lock }
    }
}

impl Drop for WakeGuard<'_> {
    fn drop(&mut self) {
        self.lock.release();
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
struct Slot<Instant> {
    deadline: Instant,
}

/// Single-shot, cancel-before-reschedule work slots keyed by [`WorkKind`].
pub struct WorkQueue<Instant> {
    slots: [Option<Slot<Instant>>; WORK_KIND_COUNT],
}

impl<Instant> WorkQueue<Instant>
where
    Instant: Copy + Ord,
{
    pub const fn new() -> Self {
        Self {
            slots: [None; WORK_KIND_COUNT],
        }
    }

    /// Schedules `kind` at `deadline`, replacing any pending instance.
    ///
    /// Returns `true` when a pending instance was cancelled.
    pub fn schedule(&mut self, kind: WorkKind, deadline: Instant, wake: &WakeLock) -> bool {
        let slot = &mut self.slots[kind.index()];
        let replaced = slot.is_some();
        if !replaced {
            wake.acquire();
        }
        *slot = Some(Slot { deadline });
        replaced
    }

    /// Cancels `kind`, returning `true` if it was pending.
    pub fn cancel(&mut self, kind: WorkKind, wake: &WakeLock) -> bool {
        if self.slots[kind.index()].take().is_some() {
            wake.release();
            true
        } else {
            false
        }
    }

    /// Cancels every pending item.
    pub fn cancel_all(&mut self, wake: &WakeLock) -> usize {
        let mut cancelled = 0;
        for kind in WorkKind::ALL {
            if self.cancel(kind, wake) {
                cancelled += 1;
            }
        }
        cancelled
    }

    /// Returns the deadline of `kind`, if pending.
    #[must_use]
    pub fn deadline(&self, kind: WorkKind) -> Option<Instant> {
        self.slots[kind.index()].map(|slot| slot.deadline)
    }

    /// Number of pending items.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    /// Returns `true` when nothing is pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Earliest pending deadline.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        self.slots.iter().flatten().map(|slot| slot.deadline).min()
    }

    /// Removes the earliest item whose deadline has passed.
    ///
    /// Ties resolve in [`WorkKind::ALL`] order, which puts water work first.
    pub fn take_due<'w>(
        &mut self,
        now: Instant,
        wake: &'w WakeLock,
    ) -> Option<(WorkKind, WakeGuard<'w>)> {
        let mut best: Option<(WorkKind, Instant)> = None;
        for kind in WorkKind::ALL {
            if let Some(slot) = self.slots[kind.index()]
                && slot.deadline <= now
                && best.is_none_or(|(_, deadline)| slot.deadline < deadline)
            {
                best = Some((kind, slot.deadline));
            }
        }

        let (kind, _) = best?;
        self.slots[kind.index()] = None;
        Some((kind, WakeGuard::adopt(wake)))
    }
}

impl<Instant> Default for WorkQueue<Instant>
where
    Instant: Copy + Ord,
{
    fn default() -> Self {
        Self::new()
    }
}
