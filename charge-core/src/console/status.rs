//! Text rendering of [`PortStatus`] for the `status` command.
//!
//! The firmware and emulator print the same lines so transcripts from either
//! target read alike.

use core::fmt;

use crate::hv::ChargeTier;
use crate::port::{PortRole, PortStatus};
use crate::sampler::BurstTally;

/// Renders a [`PortStatus`] into human-readable lines.
#[derive(Clone, Copy, Debug)]
pub struct StatusFormatter<'a> {
    status: &'a PortStatus,
}

impl<'a> StatusFormatter<'a> {
    #[must_use]
    pub const fn new(status: &'a PortStatus) -> Self {
        Self { status }
    }

    /// Writes every status line, each terminated by `\n`.
    pub fn write_all<W: fmt::Write>(&self, writer: &mut W) -> fmt::Result {
        self.write_port_line(writer)?;
        writer.write_char('\n')?;
        self.write_water_line(writer)?;
        writer.write_char('\n')?;
        self.write_hv_line(writer)?;
        writer.write_char('\n')
    }

    /// Writes the port line (e.g. `port sink dcp verdict=dry fact=usb-charger hiccup=off vbus=on`).
    pub fn write_port_line<W: fmt::Write>(&self, writer: &mut W) -> fmt::Result {
        writer.write_str("port ")?;
        match self.status.attachment {
            None => writer.write_str("detached")?,
            Some(attachment) => {
                writer.write_str(match attachment.role {
                    PortRole::Sink => "sink",
                    PortRole::Source => "source",
                })?;
                if attachment.dcp {
                    writer.write_str(" dcp")?;
                }
                if let Some(rid) = attachment.rid {
                    write!(writer, " rid={}k", rid.kohm)?;
                }
            }
        }

        write!(
            writer,
            " verdict={} fact={} hiccup={} vbus={} work={} wake={}",
            verdict_name(self.status.verdict),
            self.status.fact,
            on_off(self.status.hiccup),
            on_off(self.status.vbus_present),
            self.status.pending_work,
            self.status.wake_holds,
        )?;

        if self.status.dropped_notifications > 0 {
            write!(writer, " dropped={}", self.status.dropped_notifications)?;
        }
        Ok(())
    }

    /// Writes the water line (e.g. `water state=dry-idle sensitivity=middle threshold=3 dry-checks=0 r=n/a v=n/a`).
    pub fn write_water_line<W: fmt::Write>(&self, writer: &mut W) -> fmt::Result {
        let water = &self.status.water;
        write!(
            writer,
            "water state={} sensitivity={} threshold={} dry-checks={}",
            water.state, water.sensitivity, water.threshold, water.dry_checks,
        )?;
        writer.write_str(" r=")?;
        write_tally(writer, water.last_resistance, "k")?;
        writer.write_str(" v=")?;
        write_tally(writer, water.last_voltage, "mV")
    }

    /// Writes the HV line (e.g. `hv afc state=afc-9v target=9V tier=3-level ping=1/8 qc=0/3 wait=0/3`).
    pub fn write_hv_line<W: fmt::Write>(&self, writer: &mut W) -> fmt::Result {
        let hv = &self.status.hv;
        write!(
            writer,
            "hv {} state={} target={}V tier={} ping={}/{} qc={}/{} wait={}/{}",
            hv.protocol.name(),
            hv.state,
            hv.target.millivolts() / 1_000,
            match self.status.tier {
                ChargeTier::TwoLevel => "2-level",
                ChargeTier::ThreeLevel => "3-level",
            },
            hv.counters.ping_count,
            hv.counters.ping_retry_limit,
            hv.counters.qc_retry_count,
            hv.counters.qc_retry_limit,
            hv.counters.qc_wait_count,
            hv.counters.qc_wait_limit,
        )?;
        if hv.afc_disabled {
            writer.write_str(" afc-disabled")?;
        }
        if hv.charger_ready {
            writer.write_str(" charger-ready")?;
        }
        if hv.locked_out {
            writer.write_str(" locked-out")?;
        }
        Ok(())
    }
}

fn verdict_name(verdict: crate::port::WaterVerdict) -> &'static str {
    use crate::port::WaterVerdict;
    match verdict {
        WaterVerdict::Unknown => "unknown",
        WaterVerdict::Dry => "dry",
        WaterVerdict::KnownDry => "known-dry",
        WaterVerdict::Wet => "wet",
        WaterVerdict::Jig => "jig",
    }
}

const fn on_off(value: bool) -> &'static str {
    if value { "on" } else { "off" }
}

fn write_tally<W: fmt::Write>(
    writer: &mut W,
    tally: Option<BurstTally>,
    unit: &str,
) -> fmt::Result {
    match tally {
        None => writer.write_str("n/a"),
        Some(tally) => {
            write!(writer, "{}/{}", tally.qualifying, tally.samples)?;
            if let Some(value) = tally.last_value {
                write!(writer, "@{value}{unit}")?;
            }
            Ok(())
        }
    }
}
