use super::{HvAction, HvPlan, HvProtocol, HvState, Negotiation, ProtocolKind, Voltage};
use crate::schedule::WorkKind;

/// Quick Charge: data-line levels select the voltage and a timed bus poll
/// confirms it.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Qc;

impl Qc {
    /// Drives the levels for the current target and arms the first poll.
    fn toggle(negotiation: &mut Negotiation, plan: &mut HvPlan) {
        negotiation.counters.qc_wait_count = 0;
        plan.push(HvAction::SetQcLevels(Voltage::V5));
        if negotiation.target == Voltage::V9 {
            plan.push(HvAction::SetQcLevels(Voltage::V9));
        }
        Self::poll_later(negotiation, plan);
    }

    fn poll_later(negotiation: &Negotiation, plan: &mut HvPlan) {
        plan.push(HvAction::Schedule(
            WorkKind::BusPoll,
            negotiation.config.qc_poll_interval,
        ));
    }

    fn retry(negotiation: &mut Negotiation, plan: &mut HvPlan) {
        let counters = &mut negotiation.counters;
        if counters.qc_retry_count >= counters.qc_retry_limit {
            negotiation.fall_back(plan);
            return;
        }
        counters.qc_retry_count += 1;
        debug!("qc: re-toggle {}", counters.qc_retry_count);
        Self::toggle(negotiation, plan);
    }
}

impl HvProtocol for Qc {
    fn kind(&self) -> ProtocolKind {
        ProtocolKind::Qc
    }

    fn begin(&self, negotiation: &mut Negotiation, plan: &mut HvPlan) {
        if negotiation.transition(HvState::Prepare, plan) {
            Self::toggle(negotiation, plan);
        }
    }

    fn step(&self, negotiation: &mut Negotiation, plan: &mut HvPlan) {
        debug!("qc: stepping to {:?}", negotiation.target);
        self.begin(negotiation, plan);
    }

    fn bus_voltage(&self, negotiation: &mut Negotiation, millivolts: i32, plan: &mut HvPlan) {
        if negotiation.state != HvState::Prepare {
            return;
        }

        let config = negotiation.config;
        let (reached, settling) = match negotiation.target {
            Voltage::V9 => (
                millivolts >= config.qc_success_mv,
                millivolts >= config.qc_settling_mv,
            ),
            Voltage::V5 => (millivolts < config.qc_settling_mv, true),
        };

        if reached {
            let to = match negotiation.target {
                Voltage::V9 => HvState::Qc9V,
                Voltage::V5 => HvState::Qc5V,
            };
            if negotiation.transition(to, plan) {
                negotiation.publish_negotiated(ProtocolKind::Qc, plan);
            }
            return;
        }

        if !settling {
            debug!("qc: bus at {} mV, below settling band", millivolts);
            Self::retry(negotiation, plan);
            return;
        }

        let counters = &mut negotiation.counters;
        counters.qc_wait_count += 1;
        if counters.qc_wait_count > counters.qc_wait_limit {
            debug!("qc: still settling after {} polls", counters.qc_wait_count);
            Self::retry(negotiation, plan);
        } else {
            Self::poll_later(negotiation, plan);
        }
    }
}
