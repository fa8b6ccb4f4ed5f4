use std::io;
use std::time::Duration;

use charge_core::console::CommandExecutor;
use charge_core::hv::{AnyProtocol, NegotiatorConfig, ProtocolKind};
use charge_core::port::{Attachment, PortCoordinator, PortEvent, PortIrq, PortRole, ResistanceId};
use charge_core::schedule::Clock;
use charge_core::water::{ConfigError, DetectorConfig};
use embassy_futures::block_on;
use embassy_sync::blocking_mutex::raw::NoopRawMutex;
use log::{debug, info};

use crate::sim::{Adapter, SimChip, SimClock, SimInstant};
use crate::transcript::{TranscriptLogger, TranscriptRole};

/// RID fitted to the default service jig.
pub const DEFAULT_JIG_KOHM: u16 = 301;

pub type EmulatedPort = PortCoordinator<NoopRawMutex, SimChip, AnyProtocol, SimClock>;

/// Commands that drive the simulated world rather than the port.
pub const SIM_COMMANDS: &[(&str, &str)] = &[
    ("attach", "attach dcp|sdp|otg|jig [kohm]  - plug something in"),
    ("detach", "detach                         - unplug"),
    ("wet", "wet                            - flood the connector"),
    ("dry", "dry                            - dry the connector"),
    ("adapter", "adapter [plain|afc|qc|qc-stuck] - show or swap the charger"),
    ("advance", "advance <ms>                   - run virtual time forward"),
    ("power", "power off|on                   - signal power removal or restore"),
    ("bus-fault", "bus-fault on|off               - fail bus-voltage reads"),
];

/// One emulator session: a simulated chip, a port over it and an optional
/// transcript of everything typed and printed.
pub struct Session {
    clock: SimClock,
    chip: SimChip,
    port: EmulatedPort,
    transcript: Option<TranscriptLogger>,
}

impl Session {
    pub fn new(protocol: ProtocolKind, adapter: Adapter) -> Result<Self, ConfigError> {
        let clock = SimClock::new();
        let chip = SimChip::new(adapter);
        let port = PortCoordinator::new(
            chip.clone(),
            AnyProtocol::new(protocol),
            clock.clone(),
            DetectorConfig::DEFAULT,
            NegotiatorConfig::DEFAULT,
        )?;
        info!(
            "emulator: {} negotiator, {} adapter",
            protocol.name(),
            adapter
        );
        Ok(Self {
            clock,
            chip,
            port,
            transcript: None,
        })
    }

    #[must_use]
    pub fn with_transcript(mut self, transcript: TranscriptLogger) -> Self {
        self.transcript = Some(transcript);
        self
    }

    pub fn port(&self) -> &EmulatedPort {
        &self.port
    }

    pub fn chip(&self) -> &SimChip {
        &self.chip
    }

    pub fn now(&self) -> SimInstant {
        self.clock.now()
    }

    /// Runs one line and returns what to print. Port notifications raised
    /// while servicing follow the command's own output.
    pub fn handle_command(&mut self, line: &str) -> io::Result<Vec<String>> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return Ok(Vec::new());
        }
        self.record(TranscriptRole::Host, trimmed)?;

        let mut words = trimmed.split_whitespace();
        let head = words.next().unwrap_or_default().to_ascii_lowercase();
        let args: Vec<&str> = words.collect();

        let mut output = match head.as_str() {
            "attach" => self.attach(&args),
            "detach" => {
                self.chip.set_powered(false);
                self.port.on_vbus(false);
                self.port.on_port_event(PortEvent::Detached);
                vec!["detached".to_string()]
            }
            "wet" | "dry" => {
                let wet = head == "wet";
                self.chip.set_wet(wet);
                self.port.on_irq(PortIrq::Gpadc);
                vec![format!("connector {head}")]
            }
            "adapter" => self.adapter(&args),
            "advance" => match args.as_slice() {
                [ms] => match ms.parse::<u64>() {
                    Ok(ms) => {
                        let mut lines = Vec::new();
                        self.run_for(Duration::from_millis(ms), &mut lines);
                        lines.push(format!("now {}", self.clock.now()));
                        lines
                    }
                    Err(_) => vec![format!("error: `{ms}` is not a millisecond count")],
                },
                _ => vec!["error: usage: advance <ms>".to_string()],
            },
            "power" => match args.as_slice() {
                ["off"] => {
                    self.port.on_power_removal();
                    vec!["power removal signalled".to_string()]
                }
                ["on"] => {
                    self.port.on_power_restored();
                    vec!["power restored".to_string()]
                }
                _ => vec!["error: usage: power off|on".to_string()],
            },
            "bus-fault" => match args.as_slice() {
                [state @ ("on" | "off")] => {
                    self.chip.set_bus_fault(*state == "on");
                    vec![format!("bus fault {state}")]
                }
                _ => vec!["error: usage: bus-fault on|off".to_string()],
            },
            _ => self.console(trimmed),
        };

        self.pump(&mut output);
        for line in &output {
            let role = if line.starts_with("notify ") {
                TranscriptRole::Notify
            } else {
                TranscriptRole::Emulator
            };
            self.record(role, line)?;
        }
        Ok(output)
    }

    fn console(&self, line: &str) -> Vec<String> {
        let mut executor = CommandExecutor::new(&self.port);
        let mut output: Vec<String> = match executor.execute(line) {
            Ok(outcome) => outcome.to_string().lines().map(str::to_owned).collect(),
            Err(err) => vec![err.to_string()],
        };
        if line.eq_ignore_ascii_case("help") {
            output.push("simulator:".to_string());
            output.extend(SIM_COMMANDS.iter().map(|(_, usage)| format!("  {usage}")));
        }
        output
    }

    fn attach(&self, args: &[&str]) -> Vec<String> {
        let attachment = match args {
            ["dcp"] => Attachment::sink(true),
            ["sdp"] => Attachment::sink(false),
            ["otg"] => Attachment::source(),
            ["jig"] => jig(DEFAULT_JIG_KOHM),
            ["jig", kohm] => match kohm.parse::<u16>() {
                Ok(kohm) => jig(kohm),
                Err(_) => return vec![format!("error: `{kohm}` is not a resistance in kΩ")],
            },
            _ => return vec!["error: usage: attach dcp|sdp|otg|jig [kohm]".to_string()],
        };

        if attachment.role == PortRole::Sink {
            self.chip.set_powered(true);
            self.port.on_vbus(true);
            if attachment.dcp {
                self.port.on_charger_ready();
            }
        }
        self.port.on_port_event(PortEvent::Attached(attachment));
        vec![format!("attached {}", args.join(" "))]
    }

    fn adapter(&self, args: &[&str]) -> Vec<String> {
        match args {
            [] => vec![format!("adapter {}", self.chip.adapter())],
            [name] => match Adapter::from_name(name) {
                Some(adapter) => {
                    self.chip.set_adapter(adapter);
                    vec![format!("adapter {adapter}")]
                }
                None => vec![format!("error: unknown adapter `{name}`")],
            },
            _ => vec!["error: usage: adapter [plain|afc|qc|qc-stuck]".to_string()],
        }
    }

    /// Services the port until nothing is runnable at the current instant
    /// and forwards answered pings as interrupts.
    fn pump(&mut self, output: &mut Vec<String>) -> Option<SimInstant> {
        loop {
            let mut delay = self.clock.delay();
            let deadline = block_on(self.port.service(&mut delay));
            while let Some(notification) = self.port.next_notification() {
                info!("emulator: {}", notification);
                output.push(format!("notify {notification}"));
            }
            if self.chip.take_ping_answer() {
                debug!("emulator: adapter answered mping");
                self.port.on_irq(PortIrq::PingReady);
                continue;
            }
            return deadline;
        }
    }

    /// Jumps virtual time from deadline to deadline until `duration` has
    /// elapsed.
    fn run_for(&mut self, duration: Duration, output: &mut Vec<String>) {
        let end = self.clock.now() + duration;
        while let Some(deadline) = self.pump(output) {
            if deadline > end {
                break;
            }
            self.clock.jump_to(deadline);
        }
        self.clock.jump_to(end);
    }

    fn record(&mut self, role: TranscriptRole, line: &str) -> io::Result<()> {
        let now = self.clock.now();
        match self.transcript.as_mut() {
            Some(transcript) => transcript.append_line(now, role, line),
            None => Ok(()),
        }
    }
}

fn jig(kohm: u16) -> Attachment {
    Attachment {
        role: PortRole::Sink,
        rid: Some(ResistanceId::new(kohm)),
        dcp: false,
    }
}
