/// Per-thread register file.
pub mod registers;

pub use registers::{
    Register, RegisterFile, FLAGS_ACTIVE_MASK, FLAGS_C, FLAGS_N, FLAGS_V, FLAGS_Z,
    GENERAL_REGISTER_COUNT,
};

/// Scheduling state of a guest thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub enum ThreadState {
    /// Eligible for the next scheduling turn.
    #[default]
    Runnable,
    /// Inside syscall dispatch.
    InSyscall,
    /// Stopped by a signal until `SIGCONT`.
    Stopped,
    /// Exited or killed; never runs again.
    Terminated,
}

impl ThreadState {
    /// Whether the thread has not yet terminated.
    #[must_use]
    pub const fn is_live(self) -> bool {
        !matches!(self, Self::Terminated)
    }
}
