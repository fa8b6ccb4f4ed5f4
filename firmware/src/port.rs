//! Binds the charge-core port coordinator to embassy time and the board.

use core::ops::Add;

use charge_core::port::Notification;
use charge_core::schedule::Clock;
#[cfg(not(target_os = "none"))]
use embassy_sync::blocking_mutex::raw::NoopRawMutex;
#[cfg(target_os = "none")]
use embassy_sync::blocking_mutex::raw::ThreadModeRawMutex;
use embassy_sync::channel::{Channel, Receiver, Sender};
use embassy_time::{Duration, Instant};

/// Depth of the queue between the port task and the charger task.
pub const NOTIFICATION_QUEUE_DEPTH: usize = 8;

#[cfg(target_os = "none")]
pub type PortMutex = ThreadModeRawMutex;
#[cfg(not(target_os = "none"))]
pub type PortMutex = NoopRawMutex;

/// Notifications drained from the port outbox.
pub type NotificationQueue = Channel<PortMutex, Notification, NOTIFICATION_QUEUE_DEPTH>;
pub type NotificationSender<'a> = Sender<'a, PortMutex, Notification, NOTIFICATION_QUEUE_DEPTH>;
pub type NotificationReceiver<'a> =
    Receiver<'a, PortMutex, Notification, NOTIFICATION_QUEUE_DEPTH>;

/// Embassy instant that accepts `core::time::Duration` offsets.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct FirmwareInstant(Instant);

impl FirmwareInstant {
    pub const fn into_embassy(self) -> Instant {
        self.0
    }

    pub fn as_micros(self) -> u64 {
        self.0.as_micros()
    }
}

impl From<Instant> for FirmwareInstant {
    fn from(instant: Instant) -> Self {
        Self(instant)
    }
}

fn core_duration_to_embassy(duration: core::time::Duration) -> Duration {
    let micros = u64::try_from(duration.as_micros()).unwrap_or(u64::MAX);
    Duration::from_micros(micros)
}

impl Add<core::time::Duration> for FirmwareInstant {
    type Output = Self;

    fn add(self, rhs: core::time::Duration) -> Self::Output {
        Self(
            self.0
                .checked_add(core_duration_to_embassy(rhs))
                .unwrap_or(Instant::MAX),
        )
    }
}

/// Monotonic clock backed by the embassy time driver.
#[derive(Copy, Clone, Debug, Default)]
pub struct FirmwareClock;

impl Clock for FirmwareClock {
    type Instant = FirmwareInstant;

    fn now(&self) -> FirmwareInstant {
        FirmwareInstant(Instant::now())
    }
}

#[cfg(target_os = "none")]
pub type FirmwarePort = charge_core::port::PortCoordinator<
    PortMutex,
    charge_core::transport::I2cTransport<embassy_stm32::i2c::I2c<'static, embassy_stm32::mode::Async>>,
    charge_core::hv::AnyProtocol,
    FirmwareClock,
>;
