use core::time::Duration;

use embassy_sync::blocking_mutex::raw::RawMutex;
use embedded_hal_async::delay::DelayNs;
use portable_atomic::{AtomicBool, AtomicU32, Ordering};

use super::{
    AdcMode, InconclusiveReason, MeasurementSample, SampleChannel, SampleError, SharedSampler,
};
use crate::schedule::{Clock, duration_to_millis};
use crate::transport::RegisterTransport;

/// Shape of one sampling burst.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BurstPlan {
    pub channel: SampleChannel,
    /// Number of samples to take.
    pub count: u8,
    /// Wait after an actual mode change before the first read.
    pub settle: Duration,
    /// Wait between consecutive reads.
    pub inter_sample: Duration,
    /// How many times the burst re-establishes its mode after another user
    /// switched it before giving up as inconclusive.
    pub resettle_limit: u8,
}

/// Snapshot of the "still the same attach cycle, still powered" condition.
///
/// A burst checks it after every sample and aborts as soon as either changes.
#[derive(Copy, Clone, Debug)]
pub struct CancelToken<'a> {
    epoch: &'a AtomicU32,
    expected: u32,
    power_removed: &'a AtomicBool,
}

impl<'a> CancelToken<'a> {
    /// Captures the current attach epoch.
    pub fn new(epoch: &'a AtomicU32, power_removed: &'a AtomicBool) -> Self {
        Self {
            epoch,
            expected: epoch.load(Ordering::Acquire),
            power_removed,
        }
    }

    /// Attach epoch the token was taken in.
    #[must_use]
    pub fn epoch(&self) -> u32 {
        self.expected
    }

    /// Fails once power removal is flagged or the attach epoch moved on.
    ///
    /// # Errors
    ///
    /// Returns the reason the burst has to stop.
    pub fn check(&self) -> Result<(), InconclusiveReason> {
        if self.power_removed.load(Ordering::Acquire) {
            return Err(InconclusiveReason::PowerLost);
        }
        if self.epoch.load(Ordering::Acquire) != self.expected {
            return Err(InconclusiveReason::Detached);
        }
        Ok(())
    }
}

/// Result of draining a burst through a predicate.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct BurstTally {
    /// Samples taken.
    pub samples: u8,
    /// Samples the predicate accepted.
    pub qualifying: u8,
    /// Value of the last sample.
    pub last_value: Option<i32>,
}

/// Lazy, finite, non-restartable sampling sequence.
///
/// Nothing touches the chip until the first [`Burst::next_sample`]. The
/// sampler lock is held for one sample at a time; between samples the drive
/// is toggled through [`AdcMode::None`] because continuous conversion drifts.
/// After an error, or once `count` samples were produced, the burst only
/// yields `None`.
pub struct Burst<'a, M, T, C, D>
where
    M: RawMutex,
    C: Clock,
{
    sampler: &'a SharedSampler<M, T>,
    clock: &'a C,
    delay: &'a mut D,
    token: CancelToken<'a>,
    plan: BurstPlan,
    taken: u8,
    primed: bool,
    finished: bool,
}

impl<'a, M, T, C, D> Burst<'a, M, T, C, D>
where
    M: RawMutex,
    T: RegisterTransport,
    C: Clock,
    D: DelayNs,
{
    pub fn new(
        sampler: &'a SharedSampler<M, T>,
        plan: BurstPlan,
        clock: &'a C,
        delay: &'a mut D,
        token: CancelToken<'a>,
    ) -> Self {
        Self {
            sampler,
            clock,
            delay,
            token,
            plan,
            taken: 0,
            primed: false,
            finished: false,
        }
    }

    /// Samples still to come, assuming no abort.
    #[must_use]
    pub fn remaining(&self) -> u8 {
        if self.finished {
            0
        } else {
            self.plan.count.saturating_sub(self.taken)
        }
    }

    /// Produces the next sample, or `None` once the burst is exhausted.
    pub async fn next_sample(
        &mut self,
    ) -> Option<Result<MeasurementSample<C::Instant>, SampleError>> {
        if self.finished || self.taken >= self.plan.count {
            self.finished = true;
            return None;
        }

        let result = self.take_one().await;
        if result.is_err() {
            self.finished = true;
        }
        Some(result)
    }

    /// Consumes the whole burst, counting samples `accept` likes.
    ///
    /// # Errors
    ///
    /// Stops at the first failed sample and returns its error.
    pub async fn tally<F>(mut self, accept: F) -> Result<BurstTally, SampleError>
    where
        F: Fn(i32) -> bool,
    {
        let mut tally = BurstTally::default();
        while let Some(sample) = self.next_sample().await {
            let sample = sample?;
            tally.samples += 1;
            if accept(sample.value) {
                tally.qualifying += 1;
            }
            tally.last_value = Some(sample.value);
        }
        Ok(tally)
    }

    async fn take_one(&mut self) -> Result<MeasurementSample<C::Instant>, SampleError> {
        self.token.check()?;
        if self.taken > 0 {
            self.delay
                .delay_ms(duration_to_millis(self.plan.inter_sample))
                .await;
        }

        let mode = self.plan.channel.mode();
        let mut resettles = 0u8;
        loop {
            self.token.check()?;
            let mut sampler = self.sampler.lock().await;
            let current = sampler.config().mode;

            if !self.primed || (current != mode && current != AdcMode::None) {
                if self.primed {
                    resettles += 1;
                    if resettles > self.plan.resettle_limit {
                        warn!("sampler: gave up re-establishing {:?}", mode);
                        return Err(SampleError::Inconclusive(
                            InconclusiveReason::ModeContention,
                        ));
                    }
                    debug!("sampler: mode changed underneath burst, resettling");
                }

                let changed = sampler.set_mode(mode).await?;
                drop(sampler);
                if changed {
                    self.delay
                        .delay_ms(duration_to_millis(self.plan.settle))
                        .await;
                }
                self.primed = true;
                continue;
            }

            if self.taken > 0 || current == AdcMode::None {
                sampler.set_mode(AdcMode::None).await?;
                sampler.set_mode(mode).await?;
            }

            let sample = sampler.sample(self.plan.channel, self.clock.now()).await?;
            drop(sampler);

            self.token.check()?;
            self.taken += 1;
            return Ok(sample);
        }
    }
}
