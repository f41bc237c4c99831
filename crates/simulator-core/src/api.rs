//! Host-facing configuration and error types.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::loader::LoadError;
use crate::memory::{is_page_aligned, MapError, MemoryFault};
use crate::signal::Signal;
use crate::trace::TraceFacility;

/// Default top of the guest stack (exclusive).
pub const DEFAULT_STACK_TOP: u32 = 0xC000_0000;
/// Default guest stack size.
pub const DEFAULT_STACK_SIZE: u32 = 0x0010_0000;
/// Default lowest address considered for `mmap` placement.
pub const DEFAULT_MMAP_BASE: u32 = 0x4000_0000;
/// Default number of instructions a thread runs per scheduling turn.
pub const DEFAULT_QUANTUM: u32 = 1000;

/// Host signals that cannot be intercepted while the simulator is active.
const FORBIDDEN_HOST_SIGNALS: [Signal; 6] = [
    Signal::SIGKILL,
    Signal::SIGSTOP,
    Signal::SIGILL,
    Signal::SIGFPE,
    Signal::SIGSEGV,
    Signal::SIGBUS,
];

/// Destination of the guest-visible trace.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub enum TraceOutput {
    /// Standard error.
    #[default]
    Stderr,
    /// Standard output.
    Stdout,
    /// A file, truncated on creation.
    File(PathBuf),
    /// In-memory lines, readable through the simulator transcript.
    Memory,
}

/// Top-level configuration for a simulator instance.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct SimulatorConfig {
    /// Exclusive upper end of the initial stack segment.
    pub stack_top: u32,
    /// Size of the initial stack segment.
    pub stack_size: u32,
    /// Lowest address tried when placing non-fixed mappings.
    pub mmap_base: u32,
    /// Instructions per scheduling turn.
    pub quantum: u32,
    /// Guest environment strings (`KEY=value`).
    pub envp: Vec<String>,
    /// Host signals forwarded to the guest while activated.
    pub host_signals: Vec<Signal>,
    /// Traced facilities.
    pub trace: TraceFacility,
    /// Where trace lines go.
    pub trace_output: TraceOutput,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            stack_top: DEFAULT_STACK_TOP,
            stack_size: DEFAULT_STACK_SIZE,
            mmap_base: DEFAULT_MMAP_BASE,
            quantum: DEFAULT_QUANTUM,
            envp: Vec::new(),
            host_signals: vec![
                Signal::SIGHUP,
                Signal::SIGINT,
                Signal::SIGQUIT,
                Signal::SIGTERM,
                Signal::SIGUSR1,
                Signal::SIGUSR2,
            ],
            trace: TraceFacility::empty(),
            trace_output: TraceOutput::Stderr,
        }
    }
}

impl SimulatorConfig {
    /// Checks the configuration before any guest code runs.
    ///
    /// # Errors
    ///
    /// Returns the first inconsistency found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.stack_size == 0 || !is_page_aligned(self.stack_size) {
            return Err(ConfigError::StackSize(self.stack_size));
        }
        if !is_page_aligned(self.stack_top) {
            return Err(ConfigError::Unaligned {
                field: "stack_top",
                value: self.stack_top,
            });
        }
        if !is_page_aligned(self.mmap_base) {
            return Err(ConfigError::Unaligned {
                field: "mmap_base",
                value: self.mmap_base,
            });
        }
        if self.stack_size > self.stack_top {
            return Err(ConfigError::StackOutOfRange {
                top: self.stack_top,
                size: self.stack_size,
            });
        }
        if self.quantum == 0 {
            return Err(ConfigError::ZeroQuantum);
        }
        if let Some(signal) = self
            .host_signals
            .iter()
            .find(|signal| FORBIDDEN_HOST_SIGNALS.contains(signal))
        {
            return Err(ConfigError::HostSignal(*signal));
        }
        Ok(())
    }

    /// Lowest address of the initial stack segment.
    #[must_use]
    pub const fn stack_base(&self) -> u32 {
        self.stack_top.saturating_sub(self.stack_size)
    }
}

/// Invalid [`SimulatorConfig`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// Stack size is zero or not page aligned.
    #[error("stack size 0x{0:x} must be a non-zero multiple of the page size")]
    StackSize(u32),
    /// An address field is not page aligned.
    #[error("{field} 0x{value:08x} is not page aligned")]
    Unaligned {
        /// Offending field.
        field: &'static str,
        /// Its value.
        value: u32,
    },
    /// Stack would extend below address zero.
    #[error("stack of 0x{size:x} bytes does not fit below 0x{top:08x}")]
    StackOutOfRange {
        /// Configured top.
        top: u32,
        /// Configured size.
        size: u32,
    },
    /// Quantum of zero would never run anything.
    #[error("scheduling quantum must be at least one instruction")]
    ZeroQuantum,
    /// Host signal that cannot be intercepted.
    #[error("host signal {0} cannot be forwarded to the guest")]
    HostSignal(Signal),
}

/// Errors surfaced by the simulator facade.
#[derive(Debug, Error)]
pub enum SimError {
    /// Rejected configuration.
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    /// Loader failure.
    #[error("cannot load image: {0}")]
    Load(#[from] LoadError),
    /// Image segments could not be mapped.
    #[error("cannot map image: {0}")]
    Map(#[from] MapError),
    /// Initial stack could not be written.
    #[error("cannot build initial stack: {0}")]
    Stack(#[from] MemoryFault),
    /// Trace file could not be created.
    #[error("cannot open trace output {path}: {source}")]
    TraceOutput {
        /// Requested path.
        path: PathBuf,
        /// Underlying error.
        source: io::Error,
    },
    /// Host signal handlers could not be installed.
    #[error("cannot install host signal handler: {0}")]
    Activation(io::Error),
    /// Operation requires an executed image.
    #[error("no process has been executed")]
    NoProcess,
}
