//! Mirrors port telemetry and notifications to defmt (target) or stdout
//! (host) so bring-up logs show what the coordinator decided.

use charge_core::port::Notification;
use charge_core::telemetry::{EventId, TelemetryRecord, TelemetryRecorder};

use crate::port::FirmwareInstant;

/// Remembers how much of the telemetry ring has already been logged.
#[derive(Debug, Default)]
pub struct TelemetryCursor {
    next: EventId,
}

impl TelemetryCursor {
    pub const fn new() -> Self {
        Self { next: 0 }
    }

    /// Hands every record not seen yet to `emit`, oldest first. Returns how
    /// many records rotated out of the ring before they could be emitted.
    pub fn drain<I: Copy, const N: usize>(
        &mut self,
        recorder: &TelemetryRecorder<I, N>,
        mut emit: impl FnMut(&TelemetryRecord<I>),
    ) -> u32 {
        let total = recorder.total();
        let pending = total.wrapping_sub(self.next);
        let retained = u32::try_from(recorder.len()).unwrap_or(u32::MAX);
        let skip = usize::try_from(retained.saturating_sub(pending)).unwrap_or(usize::MAX);

        for record in recorder.oldest_first().skip(skip) {
            emit(record);
        }
        self.next = total;
        pending.saturating_sub(retained)
    }
}

#[cfg(target_os = "none")]
pub fn log_record(record: &TelemetryRecord<FirmwareInstant>) {
    defmt::info!(
        "telemetry #{} t={}us {}",
        record.id,
        record.timestamp.as_micros(),
        record.event
    );
}

#[cfg(not(target_os = "none"))]
pub fn log_record(record: &TelemetryRecord<FirmwareInstant>) {
    println!(
        "telemetry #{} t={}us {}",
        record.id,
        record.timestamp.as_micros(),
        record.event
    );
}

pub fn log_dropped(count: u32) {
    #[cfg(target_os = "none")]
    defmt::warn!("telemetry: {} records rotated out unlogged", count);
    #[cfg(not(target_os = "none"))]
    println!("telemetry: {count} records rotated out unlogged");
}

#[cfg(target_os = "none")]
pub fn log_notification(notification: Notification) {
    defmt::info!("notify: {}", notification);
}

#[cfg(not(target_os = "none"))]
pub fn log_notification(notification: Notification) {
    println!("notify: {notification}");
}

#[cfg(test)]
mod tests {
    use super::*;
    use charge_core::telemetry::{TelemetryEventKind, TelemetryPayload};

    fn record_n(recorder: &mut TelemetryRecorder<u64, 4>, count: u64) {
        for at in 0..count {
            recorder.record(
                TelemetryEventKind::Custom(u16::try_from(at).expect("small")),
                TelemetryPayload::None,
                at,
            );
        }
    }

    fn drained(
        cursor: &mut TelemetryCursor,
        recorder: &TelemetryRecorder<u64, 4>,
    ) -> (u32, [Option<EventId>; 4]) {
        let mut seen = [None; 4];
        let mut slot = 0;
        let dropped = cursor.drain(recorder, |record| {
            seen[slot] = Some(record.id);
            slot += 1;
        });
        (dropped, seen)
    }

    #[test]
    fn emits_each_record_once() {
        let mut recorder = TelemetryRecorder::<u64, 4>::new();
        let mut cursor = TelemetryCursor::new();

        record_n(&mut recorder, 2);
        assert_eq!(drained(&mut cursor, &recorder), (0, [Some(0), Some(1), None, None]));
        assert_eq!(drained(&mut cursor, &recorder), (0, [None; 4]));

        record_n(&mut recorder, 1);
        assert_eq!(drained(&mut cursor, &recorder), (0, [Some(2), None, None, None]));
    }

    #[test]
    fn reports_records_lost_to_ring_rotation() {
        let mut recorder = TelemetryRecorder::<u64, 4>::new();
        let mut cursor = TelemetryCursor::new();

        record_n(&mut recorder, 6);
        assert_eq!(
            drained(&mut cursor, &recorder),
            (2, [Some(2), Some(3), Some(4), Some(5)])
        );
    }
}
