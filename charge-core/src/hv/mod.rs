//! High-voltage charge negotiation.
//!
//! [`HvNegotiator`] is a decision core without I/O. Every entry point takes
//! the negotiator lock, updates the state and counters, and returns an
//! [`HvPlan`] listing the register writes, timers and publications the caller
//! executes after the lock is released. The wire protocol is picked once at
//! construction through [`HvProtocol`].

mod afc;
mod qc;

pub use afc::Afc;
pub use qc::Qc;

use core::cell::RefCell;
use core::fmt;
use core::time::Duration;

use embassy_sync::blocking_mutex::Mutex as BlockingMutex;
use embassy_sync::blocking_mutex::raw::RawMutex;
use heapless::Vec;

use crate::port::AttachedDeviceFact;
use crate::schedule::WorkKind;

/// Negotiation state.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum HvState {
    #[default]
    Idle,
    DcpDetected,
    FastChargeAdaptor,
    Afc5V,
    Afc9V,
    Qc5V,
    Qc9V,
    /// QC waypoint while the data-line levels settle.
    Prepare,
}

impl HvState {
    pub const ALL: [HvState; 8] = [
        HvState::Idle,
        HvState::DcpDetected,
        HvState::FastChargeAdaptor,
        HvState::Afc5V,
        HvState::Afc9V,
        HvState::Qc5V,
        HvState::Qc9V,
        HvState::Prepare,
    ];

    /// Bus voltage level the state implies.
    #[must_use]
    pub const fn bus_voltage(self) -> Voltage {
        match self {
            HvState::Afc9V | HvState::Qc9V => Voltage::V9,
            _ => Voltage::V5,
        }
    }

    /// `true` for the negotiated end states.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            HvState::Afc5V | HvState::Afc9V | HvState::Qc5V | HvState::Qc9V
        )
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            HvState::Idle => "idle",
            HvState::DcpDetected => "dcp-detected",
            HvState::FastChargeAdaptor => "fast-charge-adaptor",
            HvState::Afc5V => "afc-5v",
            HvState::Afc9V => "afc-9v",
            HvState::Qc5V => "qc-5v",
            HvState::Qc9V => "qc-9v",
            HvState::Prepare => "prepare",
        }
    }
}

impl fmt::Display for HvState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Returns `true` when `from -> to` is a legal transition.
///
/// High-voltage end states are only entered from `FastChargeAdaptor` or
/// `Prepare`; stepping between voltages goes back through those waypoints.
#[must_use]
pub const fn transition_allowed(from: HvState, to: HvState) -> bool {
    use HvState::{
        Afc5V, Afc9V, DcpDetected, FastChargeAdaptor, Idle, Prepare, Qc5V, Qc9V,
    };

    if matches!(to, Idle) || from as u8 == to as u8 {
        return true;
    }
    matches!(
        (from, to),
        (Idle, DcpDetected)
            | (DcpDetected, FastChargeAdaptor)
            | (FastChargeAdaptor, Afc5V | Afc9V | Prepare | Qc5V)
            | (Prepare, Qc5V | Qc9V)
            | (Afc5V | Afc9V, FastChargeAdaptor)
            | (Qc5V | Qc9V, Prepare)
    )
}

/// Requested bus voltage.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Voltage {
    V5,
    #[default]
    V9,
}

impl Voltage {
    #[must_use]
    pub const fn millivolts(self) -> u16 {
        match self {
            Voltage::V5 => 5_000,
            Voltage::V9 => 9_000,
        }
    }

    #[must_use]
    pub const fn from_volts(volts: u8) -> Option<Self> {
        match volts {
            5 => Some(Voltage::V5),
            9 => Some(Voltage::V9),
            _ => None,
        }
    }
}

/// Negotiation protocol.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ProtocolKind {
    Afc,
    Qc,
}

impl ProtocolKind {
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            ProtocolKind::Afc => "afc",
            ProtocolKind::Qc => "qc",
        }
    }
}

/// Charge current tier requested from the charger.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ChargeTier {
    /// 5 V profile.
    TwoLevel,
    /// 9 V profile.
    ThreeLevel,
}

impl ChargeTier {
    #[must_use]
    pub const fn for_voltage(voltage: Voltage) -> Self {
        match voltage {
            Voltage::V5 => ChargeTier::TwoLevel,
            Voltage::V9 => ChargeTier::ThreeLevel,
        }
    }
}

/// Negotiation failure. Always resolved to a safe published fact.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum NegotiationError {
    RetryLimitExceeded,
    IllegalTransition { from: HvState, to: HvState },
}

impl fmt::Display for NegotiationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NegotiationError::RetryLimitExceeded => f.write_str("retry limit exceeded"),
            NegotiationError::IllegalTransition { from, to } => {
                write!(f, "illegal transition {from} -> {to}")
            }
        }
    }
}

/// Retry bookkeeping. Counts are zeroed on every `Idle` entry.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct RetryCounters {
    pub ping_count: u8,
    pub ping_retry_limit: u8,
    pub qc_retry_count: u8,
    pub qc_retry_limit: u8,
    pub qc_wait_count: u8,
    pub qc_wait_limit: u8,
}

impl RetryCounters {
    /// Fresh counters with the limits from `config`.
    #[must_use]
    pub const fn from_config(config: &NegotiatorConfig) -> Self {
        Self {
            ping_count: 0,
            ping_retry_limit: config.ping_retry_limit,
            qc_retry_count: 0,
            qc_retry_limit: config.qc_retry_limit,
            qc_wait_count: 0,
            qc_wait_limit: config.qc_wait_limit,
        }
    }

    fn reset(&mut self) {
        self.ping_count = 0;
        self.qc_retry_count = 0;
        self.qc_wait_count = 0;
    }
}

/// Negotiator tuning.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct NegotiatorConfig {
    pub ping_retry_limit: u8,
    /// Wait for a ping-ready interrupt before pinging again.
    pub ping_timeout: Duration,
    /// Line settle time between the final ready and the bus check.
    pub afc_verify_delay: Duration,
    /// Bus voltage that confirms an AFC 9 V step.
    pub afc_9v_min_mv: i32,
    pub qc_retry_limit: u8,
    pub qc_wait_limit: u8,
    pub qc_poll_interval: Duration,
    /// Bus voltage that confirms a QC 9 V step.
    pub qc_success_mv: i32,
    /// Lower edge of the QC settling band.
    pub qc_settling_mv: i32,
    /// Delay before re-reading the bus after a failed measurement.
    pub bus_retry_delay: Duration,
    pub default_target: Voltage,
}

impl NegotiatorConfig {
    pub const DEFAULT: NegotiatorConfig = NegotiatorConfig {
        ping_retry_limit: 20,
        ping_timeout: Duration::from_millis(100),
        afc_verify_delay: Duration::from_millis(60),
        afc_9v_min_mv: 7_500,
        qc_retry_limit: 3,
        qc_wait_limit: 10,
        qc_poll_interval: Duration::from_millis(150),
        qc_success_mv: 8_000,
        qc_settling_mv: 5_500,
        bus_retry_delay: Duration::from_millis(150),
        default_target: Voltage::V9,
    };
}

impl Default for NegotiatorConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Side effect requested by the negotiator.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum HvAction {
    /// Send one AFC mping.
    SendPing,
    /// Load the AFC voltage-select code.
    SelectVoltage(Voltage),
    /// Drive the QC data-line levels for `Voltage`.
    SetQcLevels(Voltage),
    /// Return the data lines to plain DCP at 5 V.
    ResetDataLines,
    Schedule(WorkKind, Duration),
    Cancel(WorkKind),
    Publish(AttachedDeviceFact),
    ChargeTier(ChargeTier),
}

const MAX_ACTIONS: usize = 8;
const MAX_TRANSITIONS: usize = 4;

/// Work produced by one negotiator call, executed outside the lock.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[must_use = "a plan does nothing until its actions are executed"]
pub struct HvPlan {
    pub actions: Vec<HvAction, MAX_ACTIONS>,
    pub transitions: Vec<(HvState, HvState), MAX_TRANSITIONS>,
    pub failure: Option<NegotiationError>,
}

impl HvPlan {
    fn push(&mut self, action: HvAction) {
        if self.actions.push(action).is_err() {
            error!("hv: plan overflow");
        }
    }

    fn fail(&mut self, error: NegotiationError) {
        self.failure = Some(error);
    }

    /// Returns `true` when the plan does nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty() && self.transitions.is_empty() && self.failure.is_none()
    }

    /// Last state the plan moved into, if any.
    #[must_use]
    pub fn final_state(&self) -> Option<HvState> {
        self.transitions.last().map(|(_, to)| *to)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum AfcPhase {
    /// Waiting for the adapter to answer the first mping.
    AwaitReady,
    /// Voltage code sent, waiting for the confirming ready.
    AwaitConfirm,
    /// Bus voltage check pending.
    Verifying,
}

/// Negotiator state guarded by the negotiator lock.
///
/// Protocols drive it through the crate-internal helpers; outside the crate it
/// is only observable through [`HvNegotiator::snapshot`].
pub struct Negotiation {
    state: HvState,
    counters: RetryCounters,
    config: NegotiatorConfig,
    target: Voltage,
    afc_disabled: bool,
    charger_ready: bool,
    dcp_present: bool,
    locked_out: bool,
    afc_phase: AfcPhase,
}

impl Negotiation {
    const fn new(config: NegotiatorConfig) -> Self {
        Self {
            state: HvState::Idle,
            counters: RetryCounters::from_config(&config),
            config,
            target: config.default_target,
            afc_disabled: false,
            charger_ready: false,
            dcp_present: false,
            locked_out: false,
            afc_phase: AfcPhase::AwaitReady,
        }
    }

    /// Moves to `to`, handling counter resets and charge-tier changes.
    ///
    /// Returns `false` and records a failure when the move is illegal.
    fn transition(&mut self, to: HvState, plan: &mut HvPlan) -> bool {
        let from = self.state;
        if !transition_allowed(from, to) {
            error!("hv: refused {:?} -> {:?}", from, to);
            plan.fail(NegotiationError::IllegalTransition { from, to });
            return false;
        }
        if from == to {
            return true;
        }

        self.state = to;
        if plan.transitions.push((from, to)).is_err() {
            warn!("hv: transition log full");
        }
        info!("hv: {:?} -> {:?}", from, to);

        if to == HvState::Idle {
            self.counters.reset();
            self.afc_phase = AfcPhase::AwaitReady;
            plan.push(HvAction::Cancel(WorkKind::PingTimeout));
            plan.push(HvAction::Cancel(WorkKind::BusPoll));
        }
        if from.bus_voltage() != to.bus_voltage() {
            plan.push(HvAction::ChargeTier(ChargeTier::for_voltage(
                to.bus_voltage(),
            )));
        }
        true
    }

    fn enter_adaptor<P: HvProtocol + ?Sized>(&mut self, protocol: &P, plan: &mut HvPlan) {
        if self.transition(HvState::FastChargeAdaptor, plan) {
            protocol.begin(self, plan);
        }
    }

    /// Gives up for this attach cycle: back to `Idle` at 5 V as a plain
    /// charger.
    fn fall_back(&mut self, plan: &mut HvPlan) {
        warn!("hv: negotiation exhausted in {:?}", self.state);
        self.transition(HvState::Idle, plan);
        self.locked_out = true;
        plan.push(HvAction::ResetDataLines);
        plan.push(HvAction::Publish(AttachedDeviceFact::UsbCharger));
        plan.fail(NegotiationError::RetryLimitExceeded);
    }

    fn publish_negotiated(&self, protocol: ProtocolKind, plan: &mut HvPlan) {
        plan.push(HvAction::Publish(AttachedDeviceFact::ActiveFastCharger {
            protocol,
            millivolts: self.state.bus_voltage().millivolts(),
        }));
    }
}

/// Wire protocol used to request a higher bus voltage.
pub trait HvProtocol {
    fn kind(&self) -> ProtocolKind;

    /// Starts the handshake right after `FastChargeAdaptor` was entered.
    fn begin(&self, negotiation: &mut Negotiation, plan: &mut HvPlan);

    /// Re-negotiates from an end state after the target voltage changed.
    fn step(&self, negotiation: &mut Negotiation, plan: &mut HvPlan);

    /// The adapter answered an mping.
    fn ping_ready(&self, negotiation: &mut Negotiation, plan: &mut HvPlan) {
        let _ = (negotiation, plan);
    }

    /// An mping went unanswered.
    fn ping_timeout(&self, negotiation: &mut Negotiation, plan: &mut HvPlan) {
        let _ = (negotiation, plan);
    }

    /// A scheduled bus poll produced a reading.
    fn bus_voltage(&self, negotiation: &mut Negotiation, millivolts: i32, plan: &mut HvPlan);
}

/// Protocol chosen at runtime, for hosts that switch adapters.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AnyProtocol {
    Afc(Afc),
    Qc(Qc),
}

impl AnyProtocol {
    #[must_use]
    pub const fn new(kind: ProtocolKind) -> Self {
        match kind {
            ProtocolKind::Afc => AnyProtocol::Afc(Afc),
            ProtocolKind::Qc => AnyProtocol::Qc(Qc),
        }
    }
}

impl HvProtocol for AnyProtocol {
    fn kind(&self) -> ProtocolKind {
        match self {
            AnyProtocol::Afc(inner) => inner.kind(),
            AnyProtocol::Qc(inner) => inner.kind(),
        }
    }

    fn begin(&self, negotiation: &mut Negotiation, plan: &mut HvPlan) {
        match self {
            AnyProtocol::Afc(inner) => inner.begin(negotiation, plan),
            AnyProtocol::Qc(inner) => inner.begin(negotiation, plan),
        }
    }

    fn step(&self, negotiation: &mut Negotiation, plan: &mut HvPlan) {
        match self {
            AnyProtocol::Afc(inner) => inner.step(negotiation, plan),
            AnyProtocol::Qc(inner) => inner.step(negotiation, plan),
        }
    }

    fn ping_ready(&self, negotiation: &mut Negotiation, plan: &mut HvPlan) {
        match self {
            AnyProtocol::Afc(inner) => inner.ping_ready(negotiation, plan),
            AnyProtocol::Qc(inner) => inner.ping_ready(negotiation, plan),
        }
    }

    fn ping_timeout(&self, negotiation: &mut Negotiation, plan: &mut HvPlan) {
        match self {
            AnyProtocol::Afc(inner) => inner.ping_timeout(negotiation, plan),
            AnyProtocol::Qc(inner) => inner.ping_timeout(negotiation, plan),
        }
    }

    fn bus_voltage(&self, negotiation: &mut Negotiation, millivolts: i32, plan: &mut HvPlan) {
        match self {
            AnyProtocol::Afc(inner) => inner.bus_voltage(negotiation, millivolts, plan),
            AnyProtocol::Qc(inner) => inner.bus_voltage(negotiation, millivolts, plan),
        }
    }
}

/// Read-only view of the negotiator.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct HvSnapshot {
    pub protocol: ProtocolKind,
    pub state: HvState,
    pub counters: RetryCounters,
    pub target: Voltage,
    pub afc_disabled: bool,
    pub charger_ready: bool,
    /// Negotiation gave up for the current attach cycle.
    pub locked_out: bool,
}

/// HV charge negotiator over protocol `P`.
pub struct HvNegotiator<M: RawMutex, P: HvProtocol> {
    protocol: P,
    inner: BlockingMutex<M, RefCell<Negotiation>>,
}

impl<M: RawMutex, P: HvProtocol> HvNegotiator<M, P> {
    pub const fn new(protocol: P, config: NegotiatorConfig) -> Self {
        Self {
            protocol,
            inner: BlockingMutex::new(RefCell::new(Negotiation::new(config))),
        }
    }

    #[must_use]
    pub fn state(&self) -> HvState {
        self.inner.lock(|inner| inner.borrow().state)
    }

    #[must_use]
    pub fn counters(&self) -> RetryCounters {
        self.inner.lock(|inner| inner.borrow().counters)
    }

    #[must_use]
    pub fn snapshot(&self) -> HvSnapshot {
        self.inner.lock(|inner| {
            let inner = inner.borrow();
            HvSnapshot {
                protocol: self.protocol.kind(),
                state: inner.state,
                counters: inner.counters,
                target: inner.target,
                afc_disabled: inner.afc_disabled,
                charger_ready: inner.charger_ready,
                locked_out: inner.locked_out,
            }
        })
    }

    fn with<F>(&self, body: F) -> HvPlan
    where
        F: FnOnce(&P, &mut Negotiation, &mut HvPlan),
    {
        self.inner.lock(|inner| {
            let mut plan = HvPlan::default();
            body(&self.protocol, &mut inner.borrow_mut(), &mut plan);
            plan
        })
    }

    /// A dry DCP was confirmed on this attach cycle.
    pub fn on_dcp_detected(&self) -> HvPlan {
        self.with(|protocol, n, plan| {
            n.dcp_present = true;
            if n.state != HvState::Idle || n.afc_disabled || n.locked_out {
                debug!("hv: dcp ignored in {:?}", n.state);
                return;
            }
            n.transition(HvState::DcpDetected, plan);
            if n.charger_ready {
                n.enter_adaptor(protocol, plan);
            }
        })
    }

    /// The charger can accept a voltage bump.
    pub fn on_charger_ready(&self) -> HvPlan {
        self.with(|protocol, n, plan| {
            n.charger_ready = true;
            if n.state == HvState::DcpDetected {
                n.enter_adaptor(protocol, plan);
            }
        })
    }

    pub fn on_ping_ready(&self) -> HvPlan {
        self.with(|protocol, n, plan| protocol.ping_ready(n, plan))
    }

    pub fn on_ping_timeout(&self) -> HvPlan {
        self.with(|protocol, n, plan| protocol.ping_timeout(n, plan))
    }

    /// Feeds a bus voltage reading taken for a scheduled bus poll.
    pub fn on_bus_voltage(&self, millivolts: i32) -> HvPlan {
        self.with(|protocol, n, plan| protocol.bus_voltage(n, millivolts, plan))
    }

    /// A scheduled bus poll could not read the bus; poll again later.
    pub fn on_bus_unavailable(&self) -> HvPlan {
        self.with(|_, n, plan| {
            let waiting = match n.state {
                HvState::FastChargeAdaptor => n.afc_phase == AfcPhase::Verifying,
                HvState::Prepare => true,
                _ => false,
            };
            if waiting {
                plan.push(HvAction::Schedule(
                    WorkKind::BusPoll,
                    n.config.bus_retry_delay,
                ));
            }
        })
    }

    /// Changes the target voltage, stepping an established session.
    ///
    /// A request arriving mid-handshake only updates the target used by the
    /// next step.
    pub fn request_voltage(&self, voltage: Voltage) -> HvPlan {
        self.with(|protocol, n, plan| {
            n.target = voltage;
            if n.state.is_terminal() && n.state.bus_voltage() != voltage {
                if n.locked_out || n.afc_disabled {
                    debug!("hv: step to {:?} refused", voltage);
                    return;
                }
                protocol.step(n, plan);
            }
        })
    }

    /// Applies the HV policy flag. Disabling drops any session to plain 5 V.
    pub fn set_afc_disabled(&self, disabled: bool) -> HvPlan {
        self.with(|protocol, n, plan| {
            if n.afc_disabled == disabled {
                return;
            }
            n.afc_disabled = disabled;
            info!("hv: afc disabled = {}", disabled);

            if disabled {
                if n.state != HvState::Idle {
                    n.transition(HvState::Idle, plan);
                    plan.push(HvAction::ResetDataLines);
                    if n.dcp_present {
                        plan.push(HvAction::Publish(AttachedDeviceFact::UsbCharger));
                    }
                }
            } else if n.state == HvState::Idle && n.dcp_present && !n.locked_out {
                n.transition(HvState::DcpDetected, plan);
                if n.charger_ready {
                    n.enter_adaptor(protocol, plan);
                }
            }
        })
    }

    /// Water took priority: back to `Idle` with the data lines released.
    ///
    /// The attach cycle continues, so charger readiness and any lockout are
    /// kept. A later dry verdict restarts negotiation through
    /// [`HvNegotiator::on_dcp_detected`].
    pub fn abort(&self) -> HvPlan {
        self.with(|_, n, plan| {
            n.dcp_present = false;
            if n.state == HvState::Idle {
                return;
            }
            n.transition(HvState::Idle, plan);
            plan.push(HvAction::ResetDataLines);
        })
    }

    /// Detach: back to `Idle` with zeroed counters and a clean cycle.
    pub fn reset(&self) -> HvPlan {
        self.with(|_, n, plan| {
            n.transition(HvState::Idle, plan);
            n.counters.reset();
            n.afc_phase = AfcPhase::AwaitReady;
            n.dcp_present = false;
            n.charger_ready = false;
            n.locked_out = false;
            plan.push(HvAction::Cancel(WorkKind::PingTimeout));
            plan.push(HvAction::Cancel(WorkKind::BusPoll));
        })
    }
}
