//! Diagnostic console shared by the firmware and the emulator.
//!
//! Lines are tokenized and parsed by [`grammar`], dispatched onto a port by
//! [`commands`], and `status` output is rendered by [`status`].

pub mod catalog;
pub mod commands;
pub mod grammar;
pub mod status;

pub use commands::{CommandError, CommandExecutor, CommandOutcome, HelpReply, PortControl};
pub use grammar::{Command, WaterCommand, parse};
pub use status::StatusFormatter;
