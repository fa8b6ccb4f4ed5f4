use embassy_futures::select::select;
use embassy_time::{Delay, Timer};

use crate::port::{FirmwarePort, NotificationSender};
use crate::telemetry::{TelemetryCursor, log_dropped, log_record};

/// Services due port work, then sleeps until the next deadline or an
/// inbound event, whichever comes first.
#[embassy_executor::task]
pub async fn run(port: &'static FirmwarePort, outbox: NotificationSender<'static>) -> ! {
    let mut delay = Delay;
    let mut cursor = TelemetryCursor::new();

    loop {
        let deadline = port.service(&mut delay).await;

        while let Some(notification) = port.next_notification() {
            if outbox.try_send(notification).is_err() {
                defmt::warn!("port: notification queue full, dropping {}", notification);
            }
        }

        let dropped = port.with_telemetry(|recorder| cursor.drain(recorder, log_record));
        if dropped > 0 {
            log_dropped(dropped);
        }

        match deadline {
            Some(at) => {
                select(port.wait_for_event(), Timer::at(at.into_embassy())).await;
            }
            None => port.wait_for_event().await,
        }
    }
}
