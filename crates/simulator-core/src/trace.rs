//! Guest-visible tracing: facility selection and line-oriented transcripts.

use std::fmt;
use std::io::{self, Write};
use std::sync::Arc;

use bitflags::bitflags;
use parking_lot::Mutex;

bitflags! {
    /// Categories of events the engine can trace.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    #[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
    pub struct TraceFacility: u8 {
        /// Every executed instruction.
        const INSN = 1 << 0;
        /// Syscall entry and return.
        const SYSCALL = 1 << 1;
        /// Signal arrival and delivery.
        const SIGNAL = 1 << 2;
        /// Thread creation and exit.
        const THREAD = 1 << 3;
        /// Memory map changes.
        const MMAP = 1 << 4;
        /// Lifecycle events and tool messages.
        const MISC = 1 << 5;
    }
}

impl TraceFacility {
    /// Parses a facility name as used on the command line.
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "insn" => Some(Self::INSN),
            "syscall" => Some(Self::SYSCALL),
            "signal" => Some(Self::SIGNAL),
            "thread" => Some(Self::THREAD),
            "mmap" => Some(Self::MMAP),
            "misc" => Some(Self::MISC),
            "all" => Some(Self::all()),
            _ => None,
        }
    }
}

enum Sink {
    Stderr,
    Stdout,
    Writer(Box<dyn Write + Send>),
    Memory(Vec<String>),
}

impl fmt::Debug for Sink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stderr => f.write_str("Stderr"),
            Self::Stdout => f.write_str("Stdout"),
            Self::Writer(_) => f.write_str("Writer"),
            Self::Memory(lines) => write!(f, "Memory({} lines)", lines.len()),
        }
    }
}

/// Shared line sink. Clones write to the same destination; each clone may
/// carry its own line prefix.
#[derive(Debug, Clone)]
pub struct Transcript {
    sink: Arc<Mutex<Sink>>,
    prefix: Arc<str>,
}

impl Transcript {
    fn with_sink(sink: Sink) -> Self {
        Self {
            sink: Arc::new(Mutex::new(sink)),
            prefix: Arc::from(""),
        }
    }

    /// Writes to standard error.
    #[must_use]
    pub fn stderr() -> Self {
        Self::with_sink(Sink::Stderr)
    }

    /// Writes to standard output.
    #[must_use]
    pub fn stdout() -> Self {
        Self::with_sink(Sink::Stdout)
    }

    /// Writes to an arbitrary writer such as a trace file.
    #[must_use]
    pub fn writer(writer: Box<dyn Write + Send>) -> Self {
        Self::with_sink(Sink::Writer(writer))
    }

    /// Keeps lines in memory; see [`Transcript::lines`].
    #[must_use]
    pub fn memory() -> Self {
        Self::with_sink(Sink::Memory(Vec::new()))
    }

    /// Same sink, different line prefix.
    #[must_use]
    pub fn with_prefix(&self, prefix: &str) -> Self {
        Self {
            sink: Arc::clone(&self.sink),
            prefix: Arc::from(prefix),
        }
    }

    /// Current line prefix.
    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Emits one line. Write failures are logged and otherwise ignored.
    pub fn line(&self, text: &str) {
        let line = format!("{}{text}", self.prefix);
        let mut sink = self.sink.lock();
        let result = match &mut *sink {
            Sink::Stderr => writeln!(io::stderr().lock(), "{line}"),
            Sink::Stdout => writeln!(io::stdout().lock(), "{line}"),
            Sink::Writer(writer) => writeln!(writer, "{line}"),
            Sink::Memory(lines) => {
                lines.push(line);
                Ok(())
            }
        };
        if let Err(err) = result {
            log::warn!("transcript write failed: {err}");
        }
    }

    /// Emits every line of a multi-line block.
    pub fn block(&self, text: &str) {
        for line in text.lines() {
            self.line(line);
        }
    }

    /// Lines captured by an in-memory transcript; empty for other sinks.
    #[must_use]
    pub fn lines(&self) -> Vec<String> {
        match &*self.sink.lock() {
            Sink::Memory(lines) => lines.clone(),
            _ => Vec::new(),
        }
    }
}

/// Facility filter in front of a transcript.
#[derive(Debug, Clone)]
pub struct Tracer {
    enabled: TraceFacility,
    transcript: Transcript,
}

impl Tracer {
    /// Creates a tracer emitting `enabled` facilities to `transcript`.
    #[must_use]
    pub const fn new(enabled: TraceFacility, transcript: Transcript) -> Self {
        Self {
            enabled,
            transcript,
        }
    }

    /// Whether `facility` is being traced.
    #[must_use]
    pub const fn enabled(&self, facility: TraceFacility) -> bool {
        self.enabled.intersects(facility)
    }

    /// Underlying transcript, regardless of facility selection.
    #[must_use]
    pub const fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    /// Emits `message()` when `facility` is enabled.
    pub fn emit(&self, facility: TraceFacility, message: impl FnOnce() -> String) {
        if self.enabled(facility) {
            self.transcript.line(&message());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{TraceFacility, Tracer, Transcript};

    #[test]
    fn prefixed_clones_share_one_sink() {
        let transcript = Transcript::memory();
        let tool = transcript.with_prefix("NoNetwork: ");
        transcript.line("plain");
        tool.line("blocked socketcall");
        assert_eq!(
            transcript.lines(),
            vec!["plain".to_string(), "NoNetwork: blocked socketcall".to_string()]
        );
    }

    #[test]
    fn tracer_filters_by_facility() {
        let transcript = Transcript::memory();
        let tracer = Tracer::new(TraceFacility::SYSCALL, transcript.clone());
        tracer.emit(TraceFacility::INSN, || "insn".to_string());
        tracer.emit(TraceFacility::SYSCALL, || "write(1) = 3".to_string());
        assert_eq!(transcript.lines(), vec!["write(1) = 3".to_string()]);
    }

    #[test]
    fn facility_names_parse() {
        assert_eq!(TraceFacility::parse("mmap"), Some(TraceFacility::MMAP));
        assert_eq!(TraceFacility::parse("all"), Some(TraceFacility::all()));
        assert_eq!(TraceFacility::parse("bogus"), None);
        // Flag names from the bitflags table are upper case; the command line is not.
        assert_eq!(TraceFacility::parse("MMAP"), None);
        assert_eq!(TraceFacility::from_name("MMAP"), Some(TraceFacility::MMAP));
    }

    #[test]
    fn block_splits_lines() {
        let transcript = Transcript::memory();
        transcript.block("a\nb\n");
        assert_eq!(transcript.lines().len(), 2);
    }
}
