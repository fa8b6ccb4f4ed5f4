//! Liquid-intrusion detection on the sense pin.
//!
//! The detector is a debounced two-phase latch. A wet verdict lands in
//! `Water1Idle` and is promoted to `Water2Idle` after a hold period; from
//! `Water2Idle` periodic dry checks decide when the port may charge again.
//!
//! The state lives under a blocking mutex that is only held while a decision
//! is read or committed. A check first moves the state into
//! `WaterDetecting`/`DryDetecting`, releases the lock, runs its bursts and
//! then re-takes the lock to commit, so a second trigger arriving meanwhile
//! sees the check in progress and is dropped. The detector never schedules
//! anything itself; each report carries the follow-up the caller should
//! arm.

mod config;

pub use config::{
    ConfigError, DebounceCounts, DetectorConfig, MAX_INTERVAL, MAX_LOOPS, ThresholdKey,
    WaterSensitivity,
};

use core::cell::RefCell;
use core::fmt;
use core::time::Duration;

use embassy_sync::blocking_mutex::Mutex as BlockingMutex;
use embassy_sync::blocking_mutex::raw::RawMutex;
use embedded_hal_async::delay::DelayNs;

use crate::sampler::{
    Burst, BurstPlan, BurstTally, CancelToken, HysteresisLevel, InconclusiveReason,
    SampleChannel, SampleError, SharedSampler,
};
use crate::schedule::{Clock, duration_to_millis};
use crate::transport::RegisterTransport;

/// Liquid detection state.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum WaterState {
    #[default]
    DryIdle,
    DryDetecting,
    /// Wet, waiting out the confirmation window.
    Water1Idle,
    /// Wet, long-term monitoring.
    Water2Idle,
    WaterDetecting,
}

impl WaterState {
    /// `true` for the latched wet states.
    #[must_use]
    pub const fn is_wet(self) -> bool {
        matches!(self, WaterState::Water1Idle | WaterState::Water2Idle)
    }

    /// `true` while a check owns the state.
    #[must_use]
    pub const fn is_checking(self) -> bool {
        matches!(self, WaterState::WaterDetecting | WaterState::DryDetecting)
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            WaterState::DryIdle => "dry-idle",
            WaterState::DryDetecting => "dry-detecting",
            WaterState::Water1Idle => "water1-idle",
            WaterState::Water2Idle => "water2-idle",
            WaterState::WaterDetecting => "water-detecting",
        }
    }
}

impl fmt::Display for WaterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Timer the caller should arm after a report.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FollowUp {
    /// Re-run the wet check.
    Recheck(Duration),
    /// Promote `Water1Idle` to `Water2Idle`.
    PromoteAfter(Duration),
    /// Run the next dry check.
    DryCheckAfter(Duration),
}

/// How a check or request ended.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CheckOutcome {
    /// Both bursts crossed the wet thresholds.
    Wet,
    /// The port is (or became) dry.
    Dry,
    /// A dry check did not confirm dryness.
    StillWet,
    /// Sampling could not produce a verdict.
    Inconclusive(SampleError),
    /// Another check already owns the state, or the state does not take this
    /// kind of check.
    Skipped,
}

/// Result of one detector operation.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct CheckReport {
    pub outcome: CheckOutcome,
    pub from: WaterState,
    pub to: WaterState,
    pub follow_up: Option<FollowUp>,
    pub resistance: Option<BurstTally>,
    pub voltage: Option<BurstTally>,
}

impl CheckReport {
    fn unchanged(state: WaterState, outcome: CheckOutcome) -> Self {
        Self {
            outcome,
            from: state,
            to: state,
            follow_up: None,
            resistance: None,
            voltage: None,
        }
    }

    /// `true` when the report moved the port into a wet state.
    #[must_use]
    pub fn became_wet(&self) -> bool {
        !self.from.is_wet() && self.to.is_wet()
    }

    /// `true` when the report cleared a wet latch.
    #[must_use]
    pub fn became_dry(&self) -> bool {
        self.from.is_wet() && self.to == WaterState::DryIdle
    }
}

/// Telemetry view of the detector.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DetectorSnapshot {
    pub state: WaterState,
    pub sensitivity: WaterSensitivity,
    pub threshold: u8,
    /// Dry checks started since construction.
    pub dry_checks: u32,
    pub last_resistance: Option<BurstTally>,
    pub last_voltage: Option<BurstTally>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Phase {
    Wet,
    Dry,
}

enum Verdict {
    Positive,
    Negative,
}

struct DetectorCore {
    state: WaterState,
    config: DetectorConfig,
    dry_checks: u32,
    last_resistance: Option<BurstTally>,
    last_voltage: Option<BurstTally>,
}

/// Debounced wet/dry decision engine.
pub struct WaterDetector<M: RawMutex> {
    core: BlockingMutex<M, RefCell<DetectorCore>>,
}

impl<M: RawMutex> WaterDetector<M> {
    /// Creates a detector in `DryIdle`.
    ///
    /// `config` is trusted; run [`DetectorConfig::validate`] first when it
    /// comes from outside.
    pub const fn new(config: DetectorConfig) -> Self {
        Self {
            core: BlockingMutex::new(RefCell::new(DetectorCore {
                state: WaterState::DryIdle,
                config,
                dry_checks: 0,
                last_resistance: None,
                last_voltage: None,
            })),
        }
    }

    #[must_use]
    pub fn state(&self) -> WaterState {
        self.core.lock(|core| core.borrow().state)
    }

    #[must_use]
    pub fn config(&self) -> DetectorConfig {
        self.core.lock(|core| core.borrow().config)
    }

    #[must_use]
    pub fn snapshot(&self) -> DetectorSnapshot {
        self.core.lock(|core| {
            let core = core.borrow();
            DetectorSnapshot {
                state: core.state,
                sensitivity: core.config.sensitivity,
                threshold: core.config.threshold(),
                dry_checks: core.dry_checks,
                last_resistance: core.last_resistance,
                last_voltage: core.last_voltage,
            }
        })
    }

    pub fn set_sensitivity(&self, level: WaterSensitivity) {
        self.core.lock(|core| {
            core.borrow_mut().config.sensitivity = level;
        });
        info!("water: sensitivity {:?}", level);
    }

    /// Replaces the debounce count of `level`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidConfiguration`] when `count` is zero or
    /// exceeds the loop count.
    pub fn set_debounce(&self, level: WaterSensitivity, count: u8) -> Result<(), ConfigError> {
        self.update_config(|config| config.with_debounce(level, count))
    }

    /// Sets one threshold by key. Out-of-range values leave the config as is.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidConfiguration`] for an out-of-range value
    /// or a band the new value would invert.
    pub fn set_threshold(&self, key: ThresholdKey, value: u32) -> Result<(), ConfigError> {
        let result = self.update_config(|config| config.with_threshold(key, value));
        if result.is_err() {
            warn!("water: rejected {:?} = {}", key, value);
        }
        result
    }

    /// Replaces the whole configuration after validating it.
    ///
    /// # Errors
    ///
    /// Returns the first invariant `config` violates.
    pub fn set_config(&self, config: DetectorConfig) -> Result<(), ConfigError> {
        config.validate()?;
        self.core.lock(|core| core.borrow_mut().config = config);
        Ok(())
    }

    fn update_config<F>(&self, update: F) -> Result<(), ConfigError>
    where
        F: FnOnce(&DetectorConfig) -> Result<DetectorConfig, ConfigError>,
    {
        self.core.lock(|core| {
            let mut core = core.borrow_mut();
            let next = update(&core.config)?;
            core.config = next;
            Ok(())
        })
    }

    /// Moves `Water1Idle` to `Water2Idle` once the hold period expired.
    #[must_use]
    pub fn promote(&self) -> CheckReport {
        self.core.lock(|core| {
            let mut core = core.borrow_mut();
            let from = core.state;
            if from != WaterState::Water1Idle {
                return CheckReport::unchanged(from, CheckOutcome::Skipped);
            }
            core.state = WaterState::Water2Idle;
            info!("water: {:?} -> {:?}", from, core.state);
            CheckReport {
                outcome: CheckOutcome::StillWet,
                from,
                to: WaterState::Water2Idle,
                follow_up: Some(FollowUp::DryCheckAfter(core.config.long_monitor_interval)),
                resistance: None,
                voltage: None,
            }
        })
    }

    /// Follow-up that keeps the current state monitored, used when a new
    /// attach cycle starts while the port is already wet.
    #[must_use]
    pub fn monitoring_follow_up(&self) -> Option<FollowUp> {
        self.core.lock(|core| {
            let core = core.borrow();
            match core.state {
                WaterState::Water1Idle => Some(FollowUp::PromoteAfter(core.config.water1_hold)),
                WaterState::Water2Idle => {
                    Some(FollowUp::DryCheckAfter(core.config.long_monitor_interval))
                }
                _ => None,
            }
        })
    }

    /// Runs a wet check from `DryIdle`.
    pub async fn check_water<SM, T, C, D>(
        &self,
        sampler: &SharedSampler<SM, T>,
        clock: &C,
        delay: &mut D,
        token: CancelToken<'_>,
    ) -> CheckReport
    where
        SM: RawMutex,
        T: RegisterTransport,
        C: Clock,
        D: DelayNs,
    {
        self.run_check(Phase::Wet, sampler, clock, delay, token).await
    }

    /// Runs a dry check from `Water1Idle` or `Water2Idle`.
    pub async fn check_dry<SM, T, C, D>(
        &self,
        sampler: &SharedSampler<SM, T>,
        clock: &C,
        delay: &mut D,
        token: CancelToken<'_>,
    ) -> CheckReport
    where
        SM: RawMutex,
        T: RegisterTransport,
        C: Clock,
        D: DelayNs,
    {
        self.run_check(Phase::Dry, sampler, clock, delay, token).await
    }

    fn begin(&self, phase: Phase) -> Result<(WaterState, DetectorConfig), WaterState> {
        self.core.lock(|core| {
            let mut core = core.borrow_mut();
            let from = core.state;
            let next = match (phase, from) {
                (Phase::Wet, WaterState::DryIdle) => WaterState::WaterDetecting,
                (Phase::Dry, WaterState::Water1Idle | WaterState::Water2Idle) => {
                    core.dry_checks = core.dry_checks.wrapping_add(1);
                    WaterState::DryDetecting
                }
                _ => return Err(from),
            };
            core.state = next;
            debug!("water: {:?} -> {:?}", from, next);
            Ok((from, core.config))
        })
    }

    async fn run_check<SM, T, C, D>(
        &self,
        phase: Phase,
        sampler: &SharedSampler<SM, T>,
        clock: &C,
        delay: &mut D,
        token: CancelToken<'_>,
    ) -> CheckReport
    where
        SM: RawMutex,
        T: RegisterTransport,
        C: Clock,
        D: DelayNs,
    {
        let (prior, config) = match self.begin(phase) {
            Ok(started) => started,
            Err(state) => {
                debug!("water: check skipped in {:?}", state);
                return CheckReport::unchanged(state, CheckOutcome::Skipped);
            }
        };

        let mut resistance = None;
        let mut voltage = None;
        let result = decide(
            phase,
            &config,
            sampler,
            clock,
            delay,
            token,
            &mut resistance,
            &mut voltage,
        )
        .await;

        if let Err(err) = sampler
            .lock()
            .await
            .set_hysteresis(HysteresisLevel::NARROW)
            .await
        {
            warn!("water: failed to restore hysteresis: {:?}", err);
        }

        self.commit(phase, prior, result, resistance, voltage)
    }

    fn commit(
        &self,
        phase: Phase,
        prior: WaterState,
        result: Result<Verdict, SampleError>,
        resistance: Option<BurstTally>,
        voltage: Option<BurstTally>,
    ) -> CheckReport {
        self.core.lock(|core| {
            let mut core = core.borrow_mut();
            let checking = match phase {
                Phase::Wet => WaterState::WaterDetecting,
                Phase::Dry => WaterState::DryDetecting,
            };
            // Only the check that moved the state out of idle commits.
            debug_assert_eq!(core.state, checking);
            core.last_resistance = resistance;
            core.last_voltage = voltage;

            let config = core.config;
            let (to, outcome, follow_up) = match (phase, result) {
                (Phase::Wet, Ok(Verdict::Positive)) => (
                    WaterState::Water1Idle,
                    CheckOutcome::Wet,
                    Some(FollowUp::PromoteAfter(config.water1_hold)),
                ),
                (Phase::Wet, Ok(Verdict::Negative)) => (WaterState::DryIdle, CheckOutcome::Dry, None),
                (Phase::Dry, Ok(Verdict::Positive)) => (WaterState::DryIdle, CheckOutcome::Dry, None),
                (Phase::Dry, Ok(Verdict::Negative)) => (
                    prior,
                    CheckOutcome::StillWet,
                    rearm_dry_check(prior, &config),
                ),
                (_, Err(err)) => {
                    let outcome = CheckOutcome::Inconclusive(err);
                    match err.reason() {
                        Some(InconclusiveReason::PowerLost) => (
                            WaterState::Water1Idle,
                            outcome,
                            Some(FollowUp::PromoteAfter(config.water1_hold)),
                        ),
                        // The next attach re-arms whatever monitoring applies.
                        Some(InconclusiveReason::Detached) => (prior, outcome, None),
                        _ => {
                            let follow_up = match phase {
                                Phase::Wet => FollowUp::Recheck(config.recheck_delay),
                                Phase::Dry => FollowUp::DryCheckAfter(config.recheck_delay),
                            };
                            (prior, outcome, Some(follow_up))
                        }
                    }
                }
            };

            core.state = to;
            if to != prior {
                info!("water: {:?} -> {:?}", prior, to);
            }
            CheckReport {
                outcome,
                from: prior,
                to,
                follow_up,
                resistance,
                voltage,
            }
        })
    }
}

#[allow(clippy::too_many_arguments)]
async fn decide<SM, T, C, D>(
    phase: Phase,
    config: &DetectorConfig,
    sampler: &SharedSampler<SM, T>,
    clock: &C,
    delay: &mut D,
    token: CancelToken<'_>,
    resistance: &mut Option<BurstTally>,
    voltage: &mut Option<BurstTally>,
) -> Result<Verdict, SampleError>
where
    SM: RawMutex,
    T: RegisterTransport,
    C: Clock,
    D: DelayNs,
{
    sampler
        .lock()
        .await
        .set_hysteresis(HysteresisLevel::WIDE)
        .await?;

    let threshold = config.threshold();
    let tally = sample_with_retry(
        sampler,
        config,
        resistance_plan(config),
        clock,
        delay,
        token,
        |kohm| match phase {
            Phase::Wet => config.is_wet_resistance(kohm),
            Phase::Dry => config.is_dry_resistance(kohm),
        },
    )
    .await?;
    *resistance = Some(tally);
    if tally.qualifying < threshold {
        return Ok(Verdict::Negative);
    }

    let tally = sample_with_retry(
        sampler,
        config,
        voltage_plan(config),
        clock,
        delay,
        token,
        |mv| match phase {
            Phase::Wet => config.is_wet_voltage(mv),
            Phase::Dry => config.is_dry_voltage(mv),
        },
    )
    .await?;
    *voltage = Some(tally);
    Ok(if tally.qualifying >= threshold {
        Verdict::Positive
    } else {
        Verdict::Negative
    })
}

fn rearm_dry_check(prior: WaterState, config: &DetectorConfig) -> Option<FollowUp> {
    // Water1Idle still has its promotion timer pending.
    (prior == WaterState::Water2Idle)
        .then_some(FollowUp::DryCheckAfter(config.long_monitor_interval))
}

fn resistance_plan(config: &DetectorConfig) -> BurstPlan {
    BurstPlan {
        channel: SampleChannel::SenseResistance,
        count: config.loops,
        settle: config.resistance_settle,
        inter_sample: config.inter_sample,
        resettle_limit: config.resettle_limit,
    }
}

fn voltage_plan(config: &DetectorConfig) -> BurstPlan {
    BurstPlan {
        channel: SampleChannel::SenseVoltage,
        count: config.loops,
        settle: config.voltage_settle,
        inter_sample: config.inter_sample,
        resettle_limit: config.resettle_limit,
    }
}

/// Errors worth another burst. Detach and power loss end the check at once.
fn retryable(err: SampleError) -> bool {
    match err {
        SampleError::Transport(_) => true,
        SampleError::Inconclusive(reason) => matches!(
            reason,
            InconclusiveReason::InvalidCode | InconclusiveReason::ModeContention
        ),
    }
}

async fn sample_with_retry<SM, T, C, D, F>(
    sampler: &SharedSampler<SM, T>,
    config: &DetectorConfig,
    plan: BurstPlan,
    clock: &C,
    delay: &mut D,
    token: CancelToken<'_>,
    accept: F,
) -> Result<BurstTally, SampleError>
where
    SM: RawMutex,
    T: RegisterTransport,
    C: Clock,
    D: DelayNs,
    F: Fn(i32) -> bool,
{
    let mut attempt = 0u8;
    loop {
        let burst = Burst::new(sampler, plan, clock, delay, token);
        match burst.tally(&accept).await {
            Ok(tally) => return Ok(tally),
            Err(err) if retryable(err) && attempt < config.burst_retry_limit => {
                attempt += 1;
                debug!("water: burst failed ({:?}), retry {}", err, attempt);
                delay
                    .delay_ms(duration_to_millis(config.burst_retry_delay))
                    .await;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sampler::{self, AdcMode};
    use crate::testing::{MockClock, MockDelay, ScriptedChip};
    use crate::transport::TransportError;
    use core::cell::Cell;
    use embassy_futures::block_on;
    use embassy_futures::join::join;
    use embassy_sync::blocking_mutex::raw::NoopRawMutex;
    use portable_atomic::{AtomicBool, AtomicU32, Ordering};

    const WET_KOHM: i64 = 150;
    const DRY_KOHM: i64 = 2_000;
    const WET_MV: i64 = 300;
    const DRY_MV: i64 = 1_500;

    struct Rig {
        chip: ScriptedChip,
        ticks: Cell<u64>,
        epoch: AtomicU32,
        power: AtomicBool,
    }

    impl Rig {
        fn new() -> Self {
            Self {
                chip: ScriptedChip::new(),
                ticks: Cell::new(0),
                epoch: AtomicU32::new(0),
                power: AtomicBool::new(false),
            }
        }

        fn token(&self) -> CancelToken<'_> {
            CancelToken::new(&self.epoch, &self.power)
        }
    }

    fn check_water(rig: &Rig, detector: &WaterDetector<NoopRawMutex>) -> CheckReport {
        let shared: SharedSampler<NoopRawMutex, _> = sampler::shared(&rig.chip);
        let clock = MockClock::new(&rig.ticks);
        let mut delay = MockDelay::new(&rig.ticks);
        block_on(detector.check_water(&shared, &clock, &mut delay, rig.token()))
    }

    fn check_dry(rig: &Rig, detector: &WaterDetector<NoopRawMutex>) -> CheckReport {
        let shared: SharedSampler<NoopRawMutex, _> = sampler::shared(&rig.chip);
        let clock = MockClock::new(&rig.ticks);
        let mut delay = MockDelay::new(&rig.ticks);
        block_on(detector.check_dry(&shared, &clock, &mut delay, rig.token()))
    }

    fn latched_water2(rig: &Rig) -> WaterDetector<NoopRawMutex> {
        let detector = WaterDetector::new(DetectorConfig::DEFAULT);
        rig.chip.push_resistances(&[WET_KOHM; 5]);
        rig.chip.push_sense_voltages(&[WET_MV; 5]);
        assert_eq!(check_water(rig, &detector).outcome, CheckOutcome::Wet);
        let _ = detector.promote();
        detector
    }

    #[test]
    fn three_of_five_wet_at_middle_latches_water1() {
        let rig = Rig::new();
        rig.chip
            .push_resistances(&[WET_KOHM, DRY_KOHM, WET_KOHM, DRY_KOHM, WET_KOHM]);
        rig.chip.push_sense_voltages(&[WET_MV; 5]);
        let detector = WaterDetector::new(DetectorConfig::DEFAULT);

        let report = check_water(&rig, &detector);

        assert_eq!(report.outcome, CheckOutcome::Wet);
        assert_eq!(report.from, WaterState::DryIdle);
        assert_eq!(report.to, WaterState::Water1Idle);
        assert!(report.became_wet());
        assert_eq!(
            report.follow_up,
            Some(FollowUp::PromoteAfter(Duration::from_secs(30)))
        );
        assert_eq!(report.resistance.map(|tally| tally.qualifying), Some(3));
        assert_eq!(detector.state(), WaterState::Water1Idle);
    }

    #[test]
    fn too_few_wet_samples_skip_the_voltage_burst() {
        let rig = Rig::new();
        rig.chip
            .push_resistances(&[WET_KOHM, DRY_KOHM, DRY_KOHM, WET_KOHM, DRY_KOHM]);
        let detector = WaterDetector::new(DetectorConfig::DEFAULT);

        let report = check_water(&rig, &detector);

        assert_eq!(report.outcome, CheckOutcome::Dry);
        assert_eq!(report.to, WaterState::DryIdle);
        assert!(report.voltage.is_none());
        assert_eq!(rig.chip.sense_reads(), 5);
    }

    #[test]
    fn failed_voltage_confirmation_reverts_to_dry() {
        let rig = Rig::new();
        rig.chip.push_resistances(&[WET_KOHM; 5]);
        rig.chip
            .push_sense_voltages(&[WET_MV, DRY_MV, WET_MV, DRY_MV, DRY_MV]);
        let detector = WaterDetector::new(DetectorConfig::DEFAULT);

        let report = check_water(&rig, &detector);

        assert_eq!(report.outcome, CheckOutcome::Dry);
        assert_eq!(report.voltage.map(|tally| tally.qualifying), Some(2));
        assert_eq!(detector.state(), WaterState::DryIdle);
    }

    #[test]
    fn wet_latch_requires_threshold_on_both_bursts() {
        let threshold = u32::from(DetectorConfig::DEFAULT.threshold());
        for mask in 0u32..32 {
            let rig = Rig::new();
            for bit in 0..5 {
                let kohm = if mask & (1 << bit) != 0 { WET_KOHM } else { DRY_KOHM };
                rig.chip.push_resistances(&[kohm]);
            }
            rig.chip.push_sense_voltages(&[WET_MV; 5]);
            let detector = WaterDetector::new(DetectorConfig::DEFAULT);

            let report = check_water(&rig, &detector);
            let expect_wet = mask.count_ones() >= threshold;
            assert_eq!(
                report.to == WaterState::Water1Idle,
                expect_wet,
                "mask {mask:05b}"
            );
        }
    }

    #[test]
    fn high_sensitivity_needs_fewer_samples() {
        let rig = Rig::new();
        rig.chip
            .push_resistances(&[WET_KOHM, DRY_KOHM, DRY_KOHM, WET_KOHM, DRY_KOHM]);
        rig.chip.push_sense_voltages(&[WET_MV; 5]);
        let detector = WaterDetector::new(DetectorConfig::DEFAULT);
        detector.set_sensitivity(WaterSensitivity::High);

        let report = check_water(&rig, &detector);
        assert_eq!(report.to, WaterState::Water1Idle);
    }

    #[test]
    fn invalid_code_retries_the_burst() {
        let rig = Rig::new();
        rig.chip.push_sense_code(1);
        rig.chip.push_resistances(&[WET_KOHM; 5]);
        rig.chip.push_sense_voltages(&[WET_MV; 5]);
        let detector = WaterDetector::new(DetectorConfig::DEFAULT);

        let report = check_water(&rig, &detector);

        assert_eq!(report.outcome, CheckOutcome::Wet);
        // Aborted first read, five resistance reads, five voltage reads.
        assert_eq!(rig.chip.sense_reads(), 11);
    }

    #[test]
    fn persistent_transport_failure_restores_state_and_rechecks() {
        let rig = Rig::new();
        rig.chip.fail_reads(true);
        let detector = WaterDetector::new(DetectorConfig::DEFAULT);

        let report = check_water(&rig, &detector);

        assert_eq!(
            report.outcome,
            CheckOutcome::Inconclusive(SampleError::Transport(TransportError::Bus))
        );
        assert_eq!(report.to, WaterState::DryIdle);
        assert_eq!(
            report.follow_up,
            Some(FollowUp::Recheck(Duration::from_secs(1)))
        );
        assert_eq!(detector.state(), WaterState::DryIdle);
    }

    #[test]
    fn power_loss_mid_check_latches_water1() {
        let rig = Rig::new();
        rig.power.store(true, Ordering::Release);
        let detector = WaterDetector::new(DetectorConfig::DEFAULT);

        let report = check_water(&rig, &detector);

        assert_eq!(
            report.outcome,
            CheckOutcome::Inconclusive(SampleError::Inconclusive(InconclusiveReason::PowerLost))
        );
        assert_eq!(report.to, WaterState::Water1Idle);
        assert_eq!(rig.chip.sense_reads(), 0);
    }

    #[test]
    fn detach_mid_burst_is_inconclusive() {
        let rig = Rig::new();
        rig.chip.set_wet_defaults();
        let detector = WaterDetector::<NoopRawMutex>::new(DetectorConfig::DEFAULT);
        let shared: SharedSampler<NoopRawMutex, _> = sampler::shared(&rig.chip);
        let clock = MockClock::new(&rig.ticks);
        let mut delay = MockDelay::new(&rig.ticks);

        let detach = async {
            embassy_futures::yield_now().await;
            rig.epoch.fetch_add(1, Ordering::AcqRel);
        };
        let (report, ()) = block_on(join(
            detector.check_water(&shared, &clock, &mut delay, rig.token()),
            detach,
        ));

        assert_eq!(
            report.outcome,
            CheckOutcome::Inconclusive(SampleError::Inconclusive(InconclusiveReason::Detached))
        );
        assert_eq!(report.to, WaterState::DryIdle);
        assert_eq!(report.follow_up, None);
        assert!(rig.chip.sense_reads() < 5);
    }

    #[test]
    fn concurrent_trigger_is_dropped_while_checking() {
        let rig = Rig::new();
        let detector = WaterDetector::<NoopRawMutex>::new(DetectorConfig::DEFAULT);
        let shared: SharedSampler<NoopRawMutex, _> = sampler::shared(&rig.chip);
        let clock = MockClock::new(&rig.ticks);
        let mut first_delay = MockDelay::new(&rig.ticks);
        let mut second_delay = MockDelay::new(&rig.ticks);

        let (first, second) = block_on(join(
            detector.check_water(&shared, &clock, &mut first_delay, rig.token()),
            detector.check_water(&shared, &clock, &mut second_delay, rig.token()),
        ));

        assert_eq!(first.outcome, CheckOutcome::Dry);
        assert_eq!(second.outcome, CheckOutcome::Skipped);
        assert_eq!(second.from, WaterState::WaterDetecting);
    }

    #[test]
    fn check_leaves_hysteresis_narrow() {
        let rig = Rig::new();
        let detector = WaterDetector::<NoopRawMutex>::new(DetectorConfig::DEFAULT);
        let shared: SharedSampler<NoopRawMutex, _> = sampler::shared(&rig.chip);
        let clock = MockClock::new(&rig.ticks);
        let mut delay = MockDelay::new(&rig.ticks);

        block_on(detector.check_water(&shared, &clock, &mut delay, rig.token()));

        let config = block_on(shared.lock()).config();
        assert_eq!(config.hysteresis_level, HysteresisLevel::NARROW);
        assert_eq!(config.mode, AdcMode::ResistanceMode);
    }

    #[test]
    fn dry_check_clears_long_term_latch() {
        let rig = Rig::new();
        let detector = latched_water2(&rig);
        assert_eq!(detector.state(), WaterState::Water2Idle);

        let report = check_dry(&rig, &detector);

        assert_eq!(report.outcome, CheckOutcome::Dry);
        assert!(report.became_dry());
        assert_eq!(detector.snapshot().dry_checks, 1);
    }

    #[test]
    fn failed_dry_check_rearms_fixed_interval() {
        let rig = Rig::new();
        rig.chip.set_wet_defaults();
        let detector = latched_water2(&rig);

        for round in 1..=3 {
            let report = check_dry(&rig, &detector);
            assert_eq!(report.outcome, CheckOutcome::StillWet);
            assert_eq!(report.to, WaterState::Water2Idle);
            assert_eq!(
                report.follow_up,
                Some(FollowUp::DryCheckAfter(Duration::from_secs(10)))
            );
            assert_eq!(detector.snapshot().dry_checks, round);
        }
    }

    #[test]
    fn dry_check_from_dry_idle_is_skipped() {
        let rig = Rig::new();
        let detector = WaterDetector::new(DetectorConfig::DEFAULT);

        let report = check_dry(&rig, &detector);
        assert_eq!(report.outcome, CheckOutcome::Skipped);
        assert_eq!(rig.chip.sense_reads(), 0);
    }

    #[test]
    fn promote_only_moves_water1() {
        let rig = Rig::new();
        let detector = WaterDetector::<NoopRawMutex>::new(DetectorConfig::DEFAULT);
        assert_eq!(detector.promote().outcome, CheckOutcome::Skipped);

        rig.chip.set_wet_defaults();
        assert_eq!(check_water(&rig, &detector).outcome, CheckOutcome::Wet);
        let report = detector.promote();
        assert_eq!(report.to, WaterState::Water2Idle);
        assert_eq!(
            report.follow_up,
            Some(FollowUp::DryCheckAfter(Duration::from_secs(10)))
        );
    }

    #[test]
    fn rejected_threshold_keeps_previous_config() {
        let detector = WaterDetector::<NoopRawMutex>::new(DetectorConfig::DEFAULT);
        assert!(
            detector
                .set_threshold(ThresholdKey::DryResistanceMin, 100)
                .is_err()
        );
        assert_eq!(detector.config(), DetectorConfig::DEFAULT);

        detector
            .set_threshold(ThresholdKey::DryResistanceMin, 900)
            .expect("valid threshold");
        assert_eq!(detector.config().dry_resistance_min_kohm, 900);
    }
}
