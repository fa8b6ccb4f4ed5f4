use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::Path;

use crate::sim::SimInstant;

/// Who produced a transcript line.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TranscriptRole {
    Host,
    Emulator,
    /// Outbox traffic from the port coordinator.
    Notify,
}

impl TranscriptRole {
    fn prefix(self) -> &'static str {
        match self {
            TranscriptRole::Host => "HOST>",
            TranscriptRole::Emulator => "EMU <",
            TranscriptRole::Notify => "NTF <",
        }
    }
}

/// Writes a session to a file, stamped with virtual time.
pub struct TranscriptLogger {
    writer: BufWriter<File>,
}

impl TranscriptLogger {
    pub fn create(path: &Path, header: &str) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;

        let mut logger = Self {
            writer: BufWriter::new(file),
        };
        writeln!(logger.writer, "# {header}")?;
        writeln!(logger.writer, "# Timestamps are virtual milliseconds since session start")?;
        writeln!(logger.writer)?;
        logger.writer.flush()?;
        Ok(logger)
    }

    pub fn append_line(
        &mut self,
        at: SimInstant,
        role: TranscriptRole,
        line: &str,
    ) -> io::Result<()> {
        writeln!(
            self.writer,
            "[+{:>7} ms] {} {}",
            at.as_millis(),
            role.prefix(),
            line
        )?;
        self.writer.flush()
    }
}
