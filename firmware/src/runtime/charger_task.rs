use crate::port::NotificationReceiver;
use crate::telemetry::log_notification;

// The charger IC has no host driver on this board yet; notifications are
// logged so the bring-up trace shows what it would have been told.
#[embassy_executor::task]
pub async fn run(inbox: NotificationReceiver<'static>) -> ! {
    loop {
        log_notification(inbox.receive().await);
    }
}
