//! Line discipline for the diagnostic UART console.
//!
//! Bytes arrive one at a time from the UART; [`LineAssembler`] turns them into
//! complete lines and [`respond`] runs a line through the shared command
//! executor into a fixed-size reply buffer.

use core::fmt::Write as _;
use core::str;

use charge_core::console::{CommandExecutor, PortControl};
use heapless::{String, Vec};

/// Maximum number of bytes accepted on a single console line.
pub const MAX_LINE_LEN: usize = 96;

/// Room for the longest reply (`help` or `status`).
pub const REPLY_CAPACITY: usize = 768;

pub const PROMPT: &str = "> ";

/// Console input errors.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(target_os = "none", derive(defmt::Format))]
pub enum ConsoleError {
    /// The line outgrew [`MAX_LINE_LEN`] and was discarded.
    LineOverflow,
    InvalidUtf8,
}

/// Accumulates console bytes into lines.
#[derive(Default)]
pub struct LineAssembler {
    buffer: Vec<u8, MAX_LINE_LEN>,
    overflowed: bool,
    complete: bool,
}

impl LineAssembler {
    pub const fn new() -> Self {
        Self {
            buffer: Vec::new(),
            overflowed: false,
            complete: false,
        }
    }

    /// Feeds one byte. Returns the finished line on CR or LF; empty lines
    /// are swallowed.
    pub fn push(&mut self, byte: u8) -> Result<Option<&str>, ConsoleError> {
        if core::mem::take(&mut self.complete) {
            self.buffer.clear();
        }

        match byte {
            b'\r' | b'\n' => {
                if core::mem::take(&mut self.overflowed) {
                    self.buffer.clear();
                    return Err(ConsoleError::LineOverflow);
                }
                if self.buffer.is_empty() {
                    return Ok(None);
                }
                self.complete = true;
                str::from_utf8(&self.buffer)
                    .map(Some)
                    .map_err(|_| ConsoleError::InvalidUtf8)
            }
            0x08 | 0x7f => {
                self.buffer.pop();
                Ok(None)
            }
            value => {
                if self.buffer.push(value).is_err() {
                    self.overflowed = true;
                }
                Ok(None)
            }
        }
    }
}

/// Executes `line` and renders the outcome (or error) into `reply`.
pub fn respond<P: PortControl>(
    executor: &mut CommandExecutor<P>,
    line: &str,
    reply: &mut String<REPLY_CAPACITY>,
) {
    reply.clear();
    let rendered = match executor.execute(line) {
        Ok(outcome) => write!(reply, "{outcome}"),
        Err(err) => writeln!(reply, "{err}"),
    };
    if rendered.is_err() {
        reply.clear();
        let _ = reply.push_str("error: reply truncated\n");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use charge_core::hv::{AnyProtocol, NegotiatorConfig, ProtocolKind};
    use charge_core::port::PortCoordinator;
    use charge_core::schedule::Clock;
    use charge_core::transport::{Reg, RegisterTransport, TransportError};
    use charge_core::water::DetectorConfig;
    use embassy_sync::blocking_mutex::raw::NoopRawMutex;
    use embassy_time::Instant;

    use crate::port::FirmwareInstant;

    struct NullChip;

    impl RegisterTransport for NullChip {
        async fn read(&mut self, _reg: Reg) -> Result<u8, TransportError> {
            Ok(0)
        }

        async fn write(&mut self, _reg: Reg, _value: u8) -> Result<(), TransportError> {
            Ok(())
        }
    }

    struct FrozenClock;

    impl Clock for FrozenClock {
        type Instant = FirmwareInstant;

        fn now(&self) -> FirmwareInstant {
            FirmwareInstant::from(Instant::from_micros(0))
        }
    }

    type TestPort = PortCoordinator<NoopRawMutex, NullChip, AnyProtocol, FrozenClock>;

    fn port() -> TestPort {
        PortCoordinator::new(
            NullChip,
            AnyProtocol::new(ProtocolKind::Afc),
            FrozenClock,
            DetectorConfig::DEFAULT,
            NegotiatorConfig::DEFAULT,
        )
        .expect("default config is valid")
    }

    fn feed<'a>(assembler: &'a mut LineAssembler, bytes: &[u8]) -> Option<&'a str> {
        let (last, head) = bytes.split_last().expect("at least one byte");
        for byte in head {
            assert_eq!(assembler.push(*byte), Ok(None));
        }
        assembler.push(*last).expect("line accepted")
    }

    #[test]
    fn assembles_lines_and_honours_backspace() {
        let mut assembler = LineAssembler::new();
        assert_eq!(feed(&mut assembler, b"statuz\x08s\r"), Some("status"));
        assert_eq!(assembler.push(b'\n'), Ok(None));
        assert_eq!(feed(&mut assembler, b"afc disable\n"), Some("afc disable"));
    }

    #[test]
    fn overflowing_line_is_discarded_whole() {
        let mut assembler = LineAssembler::new();
        for _ in 0..=MAX_LINE_LEN {
            assert_eq!(assembler.push(b'a'), Ok(None));
        }
        assert_eq!(assembler.push(b'\r'), Err(ConsoleError::LineOverflow));
        assert_eq!(feed(&mut assembler, b"help\r"), Some("help"));
    }

    #[test]
    fn invalid_utf8_is_reported() {
        let mut assembler = LineAssembler::new();
        assert_eq!(assembler.push(0xff), Ok(None));
        assert_eq!(assembler.push(b'\n'), Err(ConsoleError::InvalidUtf8));
        assert_eq!(feed(&mut assembler, b"status\n"), Some("status"));
    }

    #[test]
    fn replies_render_outcomes_and_errors() {
        let port = port();
        let mut executor = CommandExecutor::new(&port);
        let mut reply = String::new();

        respond(&mut executor, "status", &mut reply);
        assert!(reply.starts_with("port detached"));
        assert_eq!(reply.lines().count(), 3);

        respond(&mut executor, "afc disable", &mut reply);
        assert_eq!(reply.as_str(), "afc disabled\n");

        respond(&mut executor, "voltage 12", &mut reply);
        assert!(reply.starts_with("error:"));

        respond(&mut executor, "help", &mut reply);
        assert!(reply.contains("threshold"));
    }
}
