//! Port coordinator.
//!
//! Sequences the water detector and the HV negotiator around attach, detach
//! and interrupt events and turns their results into [`Notification`]s.
//!
//! Entry points called from interrupt handlers or other tasks never sample
//! and never block: they record a request bit and raise a signal. Everything
//! that touches the ADC or the data lines runs inside
//! [`PortCoordinator::service`], which the owner calls from deferred context
//! whenever the signal fires or the returned deadline passes.

mod notify;

pub use notify::{
    AttachedDeviceFact, FACTORY_JIG_KOHMS, Notification, OUTBOX_CAPACITY, Outbox, ResistanceId,
};

use core::cell::RefCell;
use core::time::Duration;

use embassy_sync::blocking_mutex::Mutex as BlockingMutex;
use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::signal::Signal;
use embedded_hal_async::delay::DelayNs;
use portable_atomic::{AtomicBool, AtomicU16, AtomicU32, Ordering};

use crate::hv::{
    ChargeTier, HvAction, HvNegotiator, HvPlan, HvProtocol, HvSnapshot, NegotiatorConfig, Voltage,
};
use crate::sampler::{
    self, Burst, BurstPlan, CancelToken, InconclusiveReason, SampleChannel, SharedSampler,
};
use crate::schedule::{Clock, WakeLock, WorkKind, WorkQueue};
use crate::telemetry::{TelemetryEventKind, TelemetryPayload, TelemetryRecorder};
use crate::transport::RegisterTransport;
use crate::transport::registers::{self, Reg};
use crate::water::{
    CheckOutcome, CheckReport, ConfigError, DetectorConfig, DetectorSnapshot, FollowUp,
    ThresholdKey, WaterDetector, WaterSensitivity, WaterState,
};

/// Power role negotiated on the CC lines.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PortRole {
    /// We supply VBUS (OTG).
    Source,
    /// We draw from the partner.
    Sink,
}

/// What the CC and BC1.2 logic saw at attach.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Attachment {
    pub role: PortRole,
    pub rid: Option<ResistanceId>,
    /// Dedicated charge port detected on the data lines.
    pub dcp: bool,
}

impl Attachment {
    #[must_use]
    pub const fn sink(dcp: bool) -> Self {
        Self {
            role: PortRole::Sink,
            rid: None,
            dcp,
        }
    }

    #[must_use]
    pub const fn source() -> Self {
        Self {
            role: PortRole::Source,
            rid: None,
            dcp: false,
        }
    }

    fn jig(&self) -> Option<ResistanceId> {
        self.rid.filter(|rid| rid.is_factory_jig())
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PortEvent {
    Attached(Attachment),
    Detached,
}

/// Interrupts forwarded from the chip.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PortIrq {
    /// GPADC threshold crossed on the sense pin.
    Gpadc,
    /// The AFC adapter answered an mping.
    PingReady,
}

/// Water verdict for the current attach cycle.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum WaterVerdict {
    #[default]
    Unknown,
    /// A check on this cycle found the port dry.
    Dry,
    /// Attach-time checking is disabled; treated as dry.
    KnownDry,
    Wet,
    /// Factory jig; both state machines bypassed.
    Jig,
}

impl WaterVerdict {
    /// `true` when HV negotiation may run.
    #[must_use]
    pub const fn allows_hv(self) -> bool {
        matches!(self, WaterVerdict::Dry | WaterVerdict::KnownDry)
    }
}

/// Point-in-time view of the whole port.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PortStatus {
    pub attachment: Option<Attachment>,
    pub verdict: WaterVerdict,
    pub fact: AttachedDeviceFact,
    pub hiccup: bool,
    pub tier: ChargeTier,
    pub water: DetectorSnapshot,
    pub hv: HvSnapshot,
    pub vbus_present: bool,
    pub pending_work: usize,
    pub wake_holds: u32,
    pub dropped_notifications: u32,
}

const REQ_GPADC: u16 = 1 << 0;
const REQ_PING_READY: u16 = 1 << 1;
const REQ_CHARGER_READY: u16 = 1 << 2;
const REQ_AFC_ENABLE: u16 = 1 << 3;
const REQ_AFC_DISABLE: u16 = 1 << 4;
const REQ_VOLTAGE_5: u16 = 1 << 5;
const REQ_VOLTAGE_9: u16 = 1 << 6;
const REQ_WATER_CHECK: u16 = 1 << 7;
const REQ_FACTORY_CHECK: u16 = 1 << 8;
const REQ_HV_START: u16 = 1 << 9;

/// Requests scoped to one attach cycle.
const CYCLE_REQUESTS: u16 =
    REQ_GPADC | REQ_PING_READY | REQ_CHARGER_READY | REQ_HV_START | REQ_WATER_CHECK;

struct PortState<I: Copy> {
    attachment: Option<Attachment>,
    verdict: WaterVerdict,
    queue: WorkQueue<I>,
    outbox: Outbox,
    published: AttachedDeviceFact,
    hiccup: bool,
    tier: ChargeTier,
    telemetry: TelemetryRecorder<I>,
    /// Wet checks run by the current factory water test.
    factory_attempts: u8,
}

impl<I: Copy + Ord> PortState<I> {
    const fn new() -> Self {
        Self {
            attachment: None,
            verdict: WaterVerdict::Unknown,
            queue: WorkQueue::new(),
            outbox: Outbox::new(),
            published: AttachedDeviceFact::None,
            hiccup: false,
            tier: ChargeTier::TwoLevel,
            telemetry: TelemetryRecorder::new(),
            factory_attempts: 0,
        }
    }

    fn publish(&mut self, fact: AttachedDeviceFact, now: I) {
        if self.published == fact {
            return;
        }
        info!("port: publish {:?}", fact);
        self.published = fact;
        self.outbox.push(Notification::Fact(fact));
        self.telemetry.record_fact(fact, now);
    }

    fn set_hiccup(&mut self, blocked: bool) {
        if self.hiccup != blocked {
            self.hiccup = blocked;
            self.outbox.push(Notification::Hiccup(blocked));
        }
    }

    fn set_tier(&mut self, tier: ChargeTier) {
        if self.tier != tier {
            self.tier = tier;
            self.outbox.push(Notification::ChargeTier(tier));
        }
    }
}

impl<I> PortState<I>
where
    I: Copy + Ord + core::ops::Add<Duration, Output = I>,
{
    fn arm(&mut self, follow_up: FollowUp, now: I, wake: &WakeLock) {
        let (kind, after) = match follow_up {
            FollowUp::Recheck(after) => (WorkKind::WaterCheck, after),
            FollowUp::PromoteAfter(after) => (WorkKind::WaterPromote, after),
            FollowUp::DryCheckAfter(after) => (WorkKind::DryCheck, after),
        };
        self.queue.schedule(kind, now + after, wake);
    }
}

/// Wet or about to be re-latched wet by a dry check in flight.
fn latched_wet(state: WaterState) -> bool {
    state.is_wet() || state == WaterState::DryDetecting
}

/// Register writes behind one HV action.
fn register_writes(action: HvAction) -> &'static [(Reg, u8)] {
    match action {
        HvAction::SendPing => &[(registers::AFC_CTRL, registers::AFC_CTRL_PING)],
        HvAction::SelectVoltage(Voltage::V5) => &[(registers::AFC_TX, registers::AFC_TX_5V)],
        HvAction::SelectVoltage(Voltage::V9) => &[(registers::AFC_TX, registers::AFC_TX_9V)],
        HvAction::SetQcLevels(Voltage::V5) => &[(registers::QC_CTRL, registers::QC_LEVEL_5V)],
        HvAction::SetQcLevels(Voltage::V9) => &[(registers::QC_CTRL, registers::QC_LEVEL_9V)],
        HvAction::ResetDataLines => &[
            (registers::AFC_CTRL, registers::AFC_CTRL_RESET),
            (registers::QC_CTRL, registers::QC_LEVEL_DCP),
        ],
        HvAction::Schedule(..)
        | HvAction::Cancel(_)
        | HvAction::Publish(_)
        | HvAction::ChargeTier(_) => &[],
    }
}

/// Ties the sampler, water detector and HV negotiator of one port together.
pub struct PortCoordinator<M, T, P, C>
where
    M: RawMutex,
    P: HvProtocol,
    C: Clock,
{
    sampler: SharedSampler<M, T>,
    detector: WaterDetector<M>,
    negotiator: HvNegotiator<M, P>,
    clock: C,
    wake: WakeLock,
    requests: AtomicU16,
    signal: Signal<M, ()>,
    attach_epoch: AtomicU32,
    power_removed: AtomicBool,
    vbus_present: AtomicBool,
    state: BlockingMutex<M, RefCell<PortState<C::Instant>>>,
}

impl<M, T, P, C> PortCoordinator<M, T, P, C>
where
    M: RawMutex,
    T: RegisterTransport,
    P: HvProtocol,
    C: Clock,
{
    /// Builds a detached port. The detector configuration is validated.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidConfiguration`] when `detector` fails
    /// [`DetectorConfig::validate`].
    pub fn new(
        transport: T,
        protocol: P,
        clock: C,
        detector: DetectorConfig,
        negotiator: NegotiatorConfig,
    ) -> Result<Self, ConfigError> {
        detector.validate()?;
        Ok(Self {
            sampler: sampler::shared(transport),
            detector: WaterDetector::new(detector),
            negotiator: HvNegotiator::new(protocol, negotiator),
            clock,
            wake: WakeLock::new(),
            requests: AtomicU16::new(0),
            signal: Signal::new(),
            attach_epoch: AtomicU32::new(0),
            power_removed: AtomicBool::new(false),
            vbus_present: AtomicBool::new(false),
            state: BlockingMutex::new(RefCell::new(PortState::new())),
        })
    }

    #[must_use]
    pub fn detector(&self) -> &WaterDetector<M> {
        &self.detector
    }

    #[must_use]
    pub fn negotiator(&self) -> &HvNegotiator<M, P> {
        &self.negotiator
    }

    #[must_use]
    pub fn clock(&self) -> &C {
        &self.clock
    }

    /// Outstanding reasons to stay awake.
    #[must_use]
    pub fn wake_lock(&self) -> &WakeLock {
        &self.wake
    }

    fn with_state<R>(&self, body: impl FnOnce(&mut PortState<C::Instant>) -> R) -> R {
        self.state.lock(|state| body(&mut state.borrow_mut()))
    }

    fn request(&self, bits: u16) {
        self.requests.fetch_or(bits, Ordering::AcqRel);
        self.signal.signal(());
    }

    /// Sets one of two mutually exclusive request bits.
    fn request_exclusive(&self, set: u16, clear: u16) {
        self.requests.fetch_and(!clear, Ordering::AcqRel);
        self.request(set);
    }

    /// Interrupt entry point. Never blocks.
    pub fn on_irq(&self, irq: PortIrq) {
        self.request(match irq {
            PortIrq::Gpadc => REQ_GPADC,
            PortIrq::PingReady => REQ_PING_READY,
        });
    }

    pub fn on_vbus(&self, present: bool) {
        self.vbus_present.store(present, Ordering::Release);
    }

    /// Power is going away; any check in flight latches wet.
    ///
    /// The flag stays set, so every later check also latches wet without
    /// sampling until [`Self::on_power_restored`] clears it.
    pub fn on_power_removal(&self) {
        warn!("port: power removal");
        self.power_removed.store(true, Ordering::Release);
        self.signal.signal(());
    }

    pub fn on_power_restored(&self) {
        self.power_removed.store(false, Ordering::Release);
    }

    /// The charger can accept a voltage bump.
    pub fn on_charger_ready(&self) {
        self.request(REQ_CHARGER_READY);
    }

    pub fn set_afc_disabled(&self, disabled: bool) {
        if disabled {
            self.request_exclusive(REQ_AFC_DISABLE, REQ_AFC_ENABLE);
        } else {
            self.request_exclusive(REQ_AFC_ENABLE, REQ_AFC_DISABLE);
        }
    }

    pub fn request_voltage(&self, voltage: Voltage) {
        match voltage {
            Voltage::V5 => self.request_exclusive(REQ_VOLTAGE_5, REQ_VOLTAGE_9),
            Voltage::V9 => self.request_exclusive(REQ_VOLTAGE_9, REQ_VOLTAGE_5),
        }
    }

    /// Explicit check request from the path-switch layer.
    pub fn request_water_check(&self) {
        self.request(REQ_WATER_CHECK);
    }

    /// Starts a factory water test: wet checks spaced by
    /// `factory_check_interval`, stopping at the first wet verdict or after
    /// `factory_check_limit` attempts. A test already running restarts.
    pub fn request_factory_water_check(&self) {
        self.request(REQ_FACTORY_CHECK);
    }

    pub fn set_sensitivity(&self, level: WaterSensitivity) {
        self.detector.set_sensitivity(level);
    }

    /// Updates one detector threshold on the live port.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidConfiguration`] for an out-of-range value
    /// or a band the new value would invert.
    pub fn set_threshold(&self, key: ThresholdKey, value: u32) -> Result<(), ConfigError> {
        self.detector.set_threshold(key, value)
    }

    /// Updates the debounce count of one sensitivity level.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidConfiguration`] when `count` is zero or
    /// exceeds the loop count.
    pub fn set_debounce(&self, level: WaterSensitivity, count: u8) -> Result<(), ConfigError> {
        self.detector.set_debounce(level, count)
    }

    /// Attach or detach. Bumps the attach epoch so any burst in flight aborts.
    pub fn on_port_event(&self, event: PortEvent) {
        self.attach_epoch.fetch_add(1, Ordering::AcqRel);
        let now = self.clock.now();
        match event {
            PortEvent::Attached(attachment) => self.attach(attachment, now),
            PortEvent::Detached => self.detach(now),
        }
        self.signal.signal(());
    }

    fn attach(&self, attachment: Attachment, now: C::Instant) {
        info!("port: attached {:?}", attachment);
        let water = self.detector.state();
        let config = self.detector.config();
        let follow_up = self.detector.monitoring_follow_up();

        let start_hv = self.with_state(|state| {
            state.attachment = Some(attachment);
            state.verdict = WaterVerdict::Unknown;
            state
                .telemetry
                .record(TelemetryEventKind::Attached, TelemetryPayload::None, now);

            if let Some(rid) = attachment.jig() {
                info!("port: factory jig {}k, skipping checks", rid.kohm);
                state.verdict = WaterVerdict::Jig;
                state.publish(AttachedDeviceFact::FactoryJig(rid), now);
                return false;
            }

            if latched_wet(water) {
                state.verdict = WaterVerdict::Wet;
                state.set_hiccup(true);
                state.publish(AttachedDeviceFact::WaterDetected, now);
                if let Some(follow_up) = follow_up {
                    state.arm(follow_up, now, &self.wake);
                }
                return false;
            }

            if config.check_on_attach {
                state.queue.schedule(WorkKind::WaterCheck, now, &self.wake);
                false
            } else {
                state.verdict = WaterVerdict::KnownDry;
                Self::proceed_after_dry(state, now)
            }
        });
        if start_hv {
            self.request(REQ_HV_START);
        }
    }

    fn detach(&self, now: C::Instant) {
        info!("port: detached");
        // Interrupts raised for the old attach cycle die with it.
        let stale = self.requests.fetch_and(!CYCLE_REQUESTS, Ordering::AcqRel) & CYCLE_REQUESTS;
        if stale != 0 {
            debug!("port: dropped stale requests {:x}", stale);
        }
        let plan = self.negotiator.reset();
        let counters = self.negotiator.counters();
        let water = self.detector.state();
        let follow_up = self.detector.monitoring_follow_up();

        self.with_state(|state| {
            state.queue.cancel_all(&self.wake);
            self.book(state, &plan, now);
            state.attachment = None;
            state.verdict = WaterVerdict::Unknown;

            if latched_wet(water) {
                // The wet latch outlives the attach cycle.
                if let Some(follow_up) = follow_up {
                    state.arm(follow_up, now, &self.wake);
                }
                state.publish(AttachedDeviceFact::WaterDetected, now);
            } else {
                state.publish(AttachedDeviceFact::None, now);
            }
            state.telemetry.record(
                TelemetryEventKind::Detached,
                TelemetryPayload::Counters(counters),
                now,
            );
        });
    }

    /// Publishes what a dry port carries. Returns `true` when HV negotiation
    /// should start.
    fn proceed_after_dry(state: &mut PortState<C::Instant>, now: C::Instant) -> bool {
        let Some(attachment) = state.attachment else {
            return false;
        };
        if let Some(rid) = attachment.jig() {
            state.verdict = WaterVerdict::Jig;
            state.publish(AttachedDeviceFact::FactoryJig(rid), now);
            return false;
        }
        match attachment.role {
            PortRole::Sink => {
                state.publish(AttachedDeviceFact::UsbCharger, now);
                attachment.dcp
            }
            PortRole::Source => {
                state.publish(AttachedDeviceFact::None, now);
                false
            }
        }
    }

    /// Runs pending requests and due work, then returns the next deadline.
    pub async fn service<D: DelayNs>(&self, delay: &mut D) -> Option<C::Instant> {
        loop {
            let requests = self.requests.swap(0, Ordering::AcqRel);
            if requests != 0 {
                self.handle_requests(requests).await;
                continue;
            }

            let now = self.clock.now();
            let Some((kind, _guard)) =
                self.with_state(|state| state.queue.take_due(now, &self.wake))
            else {
                break;
            };
            trace!("port: running {:?}", kind);
            self.run(kind, delay).await;
        }
        self.with_state(|state| state.queue.next_deadline())
    }

    /// Waits until an entry point has recorded new work.
    pub async fn wait_for_event(&self) {
        self.signal.wait().await;
    }

    async fn handle_requests(&self, requests: u16) {
        trace!("port: requests {:x}", requests);
        let has = |bit: u16| requests & bit != 0;

        if has(REQ_FACTORY_CHECK) {
            let interval = self.detector.config().factory_check_interval;
            let now = self.clock.now();
            self.with_state(|state| {
                state.factory_attempts = 0;
                state
                    .queue
                    .schedule(WorkKind::FactoryWaterCheck, now + interval, &self.wake);
            });
            info!("port: factory water test started");
        }
        if has(REQ_WATER_CHECK) {
            self.schedule_check();
        } else if has(REQ_GPADC) {
            if self.vbus_present.load(Ordering::Acquire) {
                debug!("port: gpadc ignored with vbus present");
            } else {
                self.schedule_check();
            }
        }

        if has(REQ_AFC_DISABLE) {
            self.execute(self.negotiator.set_afc_disabled(true)).await;
        } else if has(REQ_AFC_ENABLE) {
            self.execute(self.negotiator.set_afc_disabled(false)).await;
        }
        if has(REQ_CHARGER_READY) {
            self.execute(self.negotiator.on_charger_ready()).await;
        }
        if has(REQ_HV_START) {
            let eligible = self.with_state(|state| {
                state.verdict.allows_hv()
                    && state
                        .attachment
                        .is_some_and(|a| a.role == PortRole::Sink && a.dcp)
            });
            if eligible {
                self.execute(self.negotiator.on_dcp_detected()).await;
            }
        }
        if has(REQ_VOLTAGE_5) {
            self.execute(self.negotiator.request_voltage(Voltage::V5))
                .await;
        } else if has(REQ_VOLTAGE_9) {
            self.execute(self.negotiator.request_voltage(Voltage::V9))
                .await;
        }
        if has(REQ_PING_READY) {
            self.execute(self.negotiator.on_ping_ready()).await;
        }
    }

    /// Queues whichever check the current water state takes.
    fn schedule_check(&self) {
        let kind = if latched_wet(self.detector.state()) {
            WorkKind::DryCheck
        } else {
            WorkKind::WaterCheck
        };
        let now = self.clock.now();
        self.with_state(|state| state.queue.schedule(kind, now, &self.wake));
    }

    fn token(&self) -> CancelToken<'_> {
        CancelToken::new(&self.attach_epoch, &self.power_removed)
    }

    async fn run<D: DelayNs>(&self, kind: WorkKind, delay: &mut D) {
        match kind {
            WorkKind::WaterCheck => {
                let token = self.token();
                let report = self
                    .detector
                    .check_water(&self.sampler, &self.clock, delay, token)
                    .await;
                self.apply_report(report, token.epoch()).await;
            }
            WorkKind::DryCheck => {
                let token = self.token();
                let report = self
                    .detector
                    .check_dry(&self.sampler, &self.clock, delay, token)
                    .await;
                self.apply_report(report, token.epoch()).await;
            }
            WorkKind::FactoryWaterCheck => self.factory_water_check(delay).await,
            WorkKind::WaterPromote => {
                let report = self.detector.promote();
                self.apply_report(report, self.attach_epoch.load(Ordering::Acquire))
                    .await;
            }
            WorkKind::PingTimeout => {
                self.execute(self.negotiator.on_ping_timeout()).await;
            }
            WorkKind::BusPoll => self.poll_bus(delay).await,
        }
    }

    async fn factory_water_check<D: DelayNs>(&self, delay: &mut D) {
        let token = self.token();
        let report = self
            .detector
            .check_water(&self.sampler, &self.clock, delay, token)
            .await;
        let wet = report.to.is_wet();
        self.apply_report(report, token.epoch()).await;

        let config = self.detector.config();
        let now = self.clock.now();
        self.with_state(|state| {
            state.factory_attempts = state.factory_attempts.saturating_add(1);
            let attempts = state.factory_attempts;
            if wet {
                info!("port: factory water test wet after {} checks", attempts);
            } else if attempts >= config.factory_check_limit {
                info!("port: factory water test found no water");
            } else {
                state.queue.schedule(
                    WorkKind::FactoryWaterCheck,
                    now + config.factory_check_interval,
                    &self.wake,
                );
            }
        });
    }

    async fn poll_bus<D: DelayNs>(&self, delay: &mut D) {
        let config = self.detector.config();
        let plan = BurstPlan {
            channel: SampleChannel::BusVoltage,
            count: 1,
            settle: config.voltage_settle,
            inter_sample: Duration::ZERO,
            resettle_limit: config.resettle_limit,
        };
        let burst = Burst::new(&self.sampler, plan, &self.clock, delay, self.token());

        let plan = match burst.tally(|_| true).await {
            Ok(tally) => match tally.last_value {
                Some(millivolts) => {
                    debug!("port: bus at {} mV", millivolts);
                    self.negotiator.on_bus_voltage(millivolts)
                }
                None => self.negotiator.on_bus_unavailable(),
            },
            Err(err) => match err.reason() {
                Some(InconclusiveReason::Detached | InconclusiveReason::PowerLost) => {
                    debug!("port: bus poll dropped: {:?}", err);
                    return;
                }
                _ => {
                    warn!("port: bus poll failed: {:?}", err);
                    self.negotiator.on_bus_unavailable()
                }
            },
        };
        self.execute(plan).await;
    }

    /// Folds a detector report into the port: timers, hiccup, facts and HV.
    async fn apply_report(&self, report: CheckReport, epoch: u32) {
        let now = self.clock.now();
        let same_cycle = self.attach_epoch.load(Ordering::Acquire) == epoch;
        let detached_mid_check = matches!(
            report.outcome,
            CheckOutcome::Inconclusive(err) if err.reason() == Some(InconclusiveReason::Detached)
        );
        // A check cut short by an attach-cycle change leaves no timer behind.
        let monitoring = if detached_mid_check && report.to.is_wet() {
            self.detector.monitoring_follow_up()
        } else {
            None
        };

        let (abort_hv, start_hv) = self.with_state(|state| {
            if let Some(follow_up) = report.follow_up.or(monitoring) {
                state.arm(follow_up, now, &self.wake);
            }
            if report.from != report.to {
                state.telemetry.record_water(
                    report.from,
                    report.to,
                    report.resistance,
                    report.voltage,
                    now,
                );
            }
            if let CheckOutcome::Inconclusive(_) = report.outcome {
                state.telemetry.record(
                    TelemetryEventKind::CheckInconclusive(report.from),
                    TelemetryPayload::Water {
                        resistance: report.resistance,
                        voltage: report.voltage,
                    },
                    now,
                );
            }

            if report.became_wet() {
                warn!("port: water detected");
                state.set_hiccup(true);
                state.publish(AttachedDeviceFact::WaterDetected, now);
                if state.attachment.is_some() {
                    state.verdict = WaterVerdict::Wet;
                }
                return (true, false);
            }

            if report.became_dry() {
                info!("port: dry again");
                state.set_hiccup(false);
                if state.attachment.is_some() && same_cycle {
                    state.verdict = WaterVerdict::Dry;
                    return (false, Self::proceed_after_dry(state, now));
                }
                if state.attachment.is_none() {
                    state.publish(AttachedDeviceFact::None, now);
                }
                return (false, false);
            }

            let settled_dry = report.outcome == CheckOutcome::Dry
                && same_cycle
                && state.attachment.is_some()
                && state.verdict == WaterVerdict::Unknown;
            if settled_dry {
                state.verdict = WaterVerdict::Dry;
                return (false, Self::proceed_after_dry(state, now));
            }
            (false, false)
        });

        if abort_hv {
            self.execute(self.negotiator.abort()).await;
        }
        if start_hv {
            self.request(REQ_HV_START);
        }
    }

    /// Applies a plan: bookkeeping under the state lock, then register writes.
    async fn execute(&self, plan: HvPlan) {
        if plan.is_empty() {
            return;
        }
        let now = self.clock.now();
        self.with_state(|state| self.book(state, &plan, now));
        self.drive(&plan).await;
    }

    fn book(&self, state: &mut PortState<C::Instant>, plan: &HvPlan, now: C::Instant) {
        let counters = self.negotiator.counters();
        for (from, to) in &plan.transitions {
            state.telemetry.record_hv(*from, *to, counters, now);
        }
        if let Some(err) = plan.failure {
            warn!("port: negotiation failed: {:?}", err);
            state.telemetry.record(
                TelemetryEventKind::NegotiationFailed,
                TelemetryPayload::Counters(counters),
                now,
            );
        }

        for action in &plan.actions {
            match *action {
                HvAction::Schedule(kind, after) => {
                    state.queue.schedule(kind, now + after, &self.wake);
                }
                HvAction::Cancel(kind) => {
                    state.queue.cancel(kind, &self.wake);
                }
                HvAction::Publish(fact) => {
                    if state.attachment.is_some() && state.verdict.allows_hv() {
                        state.publish(fact, now);
                    } else {
                        debug!("port: dropped hv fact {:?}", fact);
                    }
                }
                HvAction::ChargeTier(tier) => state.set_tier(tier),
                HvAction::SendPing
                | HvAction::SelectVoltage(_)
                | HvAction::SetQcLevels(_)
                | HvAction::ResetDataLines => {}
            }
        }
    }

    async fn drive(&self, plan: &HvPlan) {
        for action in &plan.actions {
            let writes = register_writes(*action);
            if writes.is_empty() {
                continue;
            }
            let mut sampler = self.sampler.lock().await;
            for (reg, value) in writes {
                if let Err(err) = sampler.transport_mut().write(*reg, *value).await {
                    warn!("port: write {:x} failed: {:?}", reg.to_u8(), err);
                }
            }
        }
    }

    /// Pops the oldest undelivered notification.
    #[must_use]
    pub fn next_notification(&self) -> Option<Notification> {
        self.with_state(|state| state.outbox.pop())
    }

    #[must_use]
    pub fn published_fact(&self) -> AttachedDeviceFact {
        self.with_state(|state| state.published)
    }

    #[must_use]
    pub fn status(&self) -> PortStatus {
        let water = self.detector.snapshot();
        let hv = self.negotiator.snapshot();
        let vbus_present = self.vbus_present.load(Ordering::Acquire);
        let wake_holds = self.wake.holds();
        self.with_state(|state| PortStatus {
            attachment: state.attachment,
            verdict: state.verdict,
            fact: state.published,
            hiccup: state.hiccup,
            tier: state.tier,
            water,
            hv,
            vbus_present,
            pending_work: state.queue.len(),
            wake_holds,
            dropped_notifications: state.outbox.dropped(),
        })
    }

    /// Runs `body` against the telemetry history.
    pub fn with_telemetry<R>(&self, body: impl FnOnce(&TelemetryRecorder<C::Instant>) -> R) -> R {
        self.with_state(|state| body(&state.telemetry))
    }

    /// Deadline of a pending work item.
    #[must_use]
    pub fn deadline(&self, kind: WorkKind) -> Option<C::Instant> {
        self.with_state(|state| state.queue.deadline(kind))
    }
}
