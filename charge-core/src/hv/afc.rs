use super::{AfcPhase, HvAction, HvPlan, HvProtocol, HvState, Negotiation, ProtocolKind};
use crate::port::AttachedDeviceFact;
use crate::schedule::WorkKind;

/// Adaptive Fast Charging: an mping handshake over the data lines.
///
/// The first ready answer loads the voltage code and pings again; the second
/// ready is followed by a bus check that decides between `Afc9V` and
/// `Afc5V`. Running out of pings settles on `Afc5V` as a plain charger and
/// stops pinging for the rest of the attach cycle.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Afc;

impl Afc {
    fn send_ping(negotiation: &mut Negotiation, plan: &mut HvPlan) {
        let counters = &mut negotiation.counters;
        if counters.ping_count >= counters.ping_retry_limit {
            warn!("afc: no answer after {} pings", counters.ping_count);
            plan.push(HvAction::Cancel(WorkKind::PingTimeout));
            if negotiation.transition(HvState::Afc5V, plan) {
                negotiation.locked_out = true;
                plan.push(HvAction::Publish(AttachedDeviceFact::UsbCharger));
                plan.fail(super::NegotiationError::RetryLimitExceeded);
            }
            return;
        }

        counters.ping_count += 1;
        plan.push(HvAction::SendPing);
        plan.push(HvAction::Schedule(
            WorkKind::PingTimeout,
            negotiation.config.ping_timeout,
        ));
    }

    fn handshaking(negotiation: &Negotiation) -> bool {
        negotiation.state == HvState::FastChargeAdaptor
            && negotiation.afc_phase != AfcPhase::Verifying
    }
}

impl HvProtocol for Afc {
    fn kind(&self) -> ProtocolKind {
        ProtocolKind::Afc
    }

    fn begin(&self, negotiation: &mut Negotiation, plan: &mut HvPlan) {
        negotiation.afc_phase = AfcPhase::AwaitReady;
        negotiation.counters.ping_count = 0;
        Self::send_ping(negotiation, plan);
    }

    fn step(&self, negotiation: &mut Negotiation, plan: &mut HvPlan) {
        debug!("afc: stepping to {:?}", negotiation.target);
        negotiation.enter_adaptor(self, plan);
    }

    fn ping_ready(&self, negotiation: &mut Negotiation, plan: &mut HvPlan) {
        if negotiation.state != HvState::FastChargeAdaptor {
            debug!("afc: stray ready in {:?}", negotiation.state);
            return;
        }

        plan.push(HvAction::Cancel(WorkKind::PingTimeout));
        match negotiation.afc_phase {
            AfcPhase::AwaitReady => {
                plan.push(HvAction::SelectVoltage(negotiation.target));
                negotiation.afc_phase = AfcPhase::AwaitConfirm;
                Self::send_ping(negotiation, plan);
            }
            AfcPhase::AwaitConfirm => {
                negotiation.afc_phase = AfcPhase::Verifying;
                plan.push(HvAction::Schedule(
                    WorkKind::BusPoll,
                    negotiation.config.afc_verify_delay,
                ));
            }
            AfcPhase::Verifying => {}
        }
    }

    fn ping_timeout(&self, negotiation: &mut Negotiation, plan: &mut HvPlan) {
        if Self::handshaking(negotiation) {
            Self::send_ping(negotiation, plan);
        }
    }

    fn bus_voltage(&self, negotiation: &mut Negotiation, millivolts: i32, plan: &mut HvPlan) {
        if negotiation.state != HvState::FastChargeAdaptor
            || negotiation.afc_phase != AfcPhase::Verifying
        {
            return;
        }

        negotiation.afc_phase = AfcPhase::AwaitReady;
        let to = if millivolts >= negotiation.config.afc_9v_min_mv {
            HvState::Afc9V
        } else {
            HvState::Afc5V
        };
        if negotiation.transition(to, plan) {
            negotiation.publish_negotiated(ProtocolKind::Afc, plan);
        }
    }
}
