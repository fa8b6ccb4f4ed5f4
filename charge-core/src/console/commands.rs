//! Console command dispatcher.
//!
//! Turns parsed [`Command`]s into calls on a [`PortControl`] target. The
//! coordinator entry points only latch requests, so every command returns
//! immediately and the work happens on the next service pass.

use core::fmt;

use crate::hv::{HvProtocol, Voltage};
use crate::port::{PortCoordinator, PortStatus};
use crate::schedule::Clock;
use crate::transport::RegisterTransport;
use crate::water::{ConfigError, ThresholdKey, WaterSensitivity};

use super::catalog::{self, COMMANDS, CommandSpec};
use super::grammar::{self, Command, WaterCommand};
use super::status::StatusFormatter;

use embassy_sync::blocking_mutex::raw::RawMutex;

/// Operations the console may perform on a port.
pub trait PortControl {
    fn status(&self) -> PortStatus;
    fn request_water_check(&self);
    fn request_factory_water_check(&self);
    fn set_sensitivity(&self, level: WaterSensitivity);
    /// # Errors
    ///
    /// Returns the [`ConfigError`] of a rejected value.
    fn set_threshold(&self, key: ThresholdKey, value: u32) -> Result<(), ConfigError>;
    fn set_afc_disabled(&self, disabled: bool);
    fn request_voltage(&self, voltage: Voltage);
}

impl<M, T, P, C> PortControl for PortCoordinator<M, T, P, C>
where
    M: RawMutex,
    T: RegisterTransport,
    P: HvProtocol,
    C: Clock,
{
    fn status(&self) -> PortStatus {
        PortCoordinator::status(self)
    }

    fn request_water_check(&self) {
        PortCoordinator::request_water_check(self);
    }

    fn request_factory_water_check(&self) {
        PortCoordinator::request_factory_water_check(self);
    }

    fn set_sensitivity(&self, level: WaterSensitivity) {
        PortCoordinator::set_sensitivity(self, level);
    }

    fn set_threshold(&self, key: ThresholdKey, value: u32) -> Result<(), ConfigError> {
        PortCoordinator::set_threshold(self, key, value)
    }

    fn set_afc_disabled(&self, disabled: bool) {
        PortCoordinator::set_afc_disabled(self, disabled);
    }

    fn request_voltage(&self, voltage: Voltage) {
        PortCoordinator::request_voltage(self, voltage);
    }
}

impl<T: PortControl + ?Sized> PortControl for &T {
    fn status(&self) -> PortStatus {
        (**self).status()
    }

    fn request_water_check(&self) {
        (**self).request_water_check();
    }

    fn request_factory_water_check(&self) {
        (**self).request_factory_water_check();
    }

    fn set_sensitivity(&self, level: WaterSensitivity) {
        (**self).set_sensitivity(level);
    }

    fn set_threshold(&self, key: ThresholdKey, value: u32) -> Result<(), ConfigError> {
        (**self).set_threshold(key, value)
    }

    fn set_afc_disabled(&self, disabled: bool) {
        (**self).set_afc_disabled(disabled);
    }

    fn request_voltage(&self, voltage: Voltage) {
        (**self).request_voltage(voltage);
    }
}

/// What `help` should print.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HelpReply {
    /// Summary of every command.
    Commands,
    /// Usage of one command.
    Command(&'static CommandSpec),
}

/// Command execution successes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommandOutcome {
    Status(PortStatus),
    Help(HelpReply),
    WaterCheckQueued,
    FactoryWaterTest,
    Sensitivity(WaterSensitivity),
    Threshold { key: ThresholdKey, value: u32 },
    Afc { enabled: bool },
    Voltage(Voltage),
}

impl fmt::Display for CommandOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandOutcome::Status(status) => StatusFormatter::new(status).write_all(f),
            CommandOutcome::Help(HelpReply::Commands) => {
                for spec in COMMANDS {
                    writeln!(f, "{:<10} {}", spec.name, spec.summary)?;
                }
                Ok(())
            }
            CommandOutcome::Help(HelpReply::Command(spec)) => {
                writeln!(f, "usage: {}", spec.usage)?;
                writeln!(f, "{}", spec.summary)
            }
            CommandOutcome::WaterCheckQueued => writeln!(f, "water check queued"),
            CommandOutcome::FactoryWaterTest => writeln!(f, "factory water test started"),
            CommandOutcome::Sensitivity(level) => writeln!(f, "water sensitivity {level}"),
            CommandOutcome::Threshold { key, value } => writeln!(f, "threshold {key}={value}"),
            CommandOutcome::Afc { enabled: true } => writeln!(f, "afc enabled"),
            CommandOutcome::Afc { enabled: false } => writeln!(f, "afc disabled"),
            CommandOutcome::Voltage(voltage) => {
                writeln!(f, "voltage {}mV requested", voltage.millivolts())
            }
        }
    }
}

/// Errors surfaced while executing a command.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CommandError<'a> {
    Parse(grammar::ParseError<'a>),
    Config(ConfigError),
    UnknownTopic(&'a str),
}

impl<'a> From<grammar::ParseError<'a>> for CommandError<'a> {
    fn from(error: grammar::ParseError<'a>) -> Self {
        Self::Parse(error)
    }
}

impl From<ConfigError> for CommandError<'_> {
    fn from(error: ConfigError) -> Self {
        Self::Config(error)
    }
}

impl fmt::Display for CommandError<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandError::Parse(err) => write!(f, "error: {err}"),
            CommandError::Config(err) => write!(f, "error: {err}"),
            CommandError::UnknownTopic(topic) => write!(f, "error: no help for `{topic}`"),
        }
    }
}

/// Dispatches console commands onto a port.
pub struct CommandExecutor<T> {
    port: T,
}

impl<T> CommandExecutor<T> {
    pub const fn new(port: T) -> Self {
        Self { port }
    }

    #[must_use]
    pub fn port(&self) -> &T {
        &self.port
    }

    #[must_use]
    pub fn into_inner(self) -> T {
        self.port
    }
}

impl<T: PortControl> CommandExecutor<T> {
    /// Parses and executes one console line.
    ///
    /// # Errors
    ///
    /// Returns a [`CommandError`] for lex and parse failures, unknown help
    /// topics and rejected thresholds.
    pub fn execute<'a>(&mut self, line: &'a str) -> Result<CommandOutcome, CommandError<'a>> {
        let command = grammar::parse(line)?;
        self.dispatch(command)
    }

    fn dispatch<'a>(&mut self, command: Command<'a>) -> Result<CommandOutcome, CommandError<'a>> {
        match command {
            Command::Status => Ok(CommandOutcome::Status(self.port.status())),
            Command::Help { topic: None } => Ok(CommandOutcome::Help(HelpReply::Commands)),
            Command::Help { topic: Some(topic) } => catalog::find(topic)
                .map(|spec| CommandOutcome::Help(HelpReply::Command(spec)))
                .ok_or(CommandError::UnknownTopic(topic)),
            Command::Water(WaterCommand::Check) => {
                self.port.request_water_check();
                Ok(CommandOutcome::WaterCheckQueued)
            }
            Command::Water(WaterCommand::Wet) => {
                self.port.request_factory_water_check();
                Ok(CommandOutcome::FactoryWaterTest)
            }
            Command::Water(WaterCommand::Sensitivity(level)) => {
                self.port.set_sensitivity(level);
                Ok(CommandOutcome::Sensitivity(level))
            }
            Command::Threshold { key, value } => {
                self.port.set_threshold(key, value)?;
                info!("console: threshold {} set to {}", key.name(), value);
                Ok(CommandOutcome::Threshold { key, value })
            }
            Command::Afc { enabled } => {
                self.port.set_afc_disabled(!enabled);
                Ok(CommandOutcome::Afc { enabled })
            }
            Command::Voltage(voltage) => {
                self.port.request_voltage(voltage);
                Ok(CommandOutcome::Voltage(voltage))
            }
        }
    }
}
