//! Guest signal numbers, signal sets and per-process dispositions.
//!
//! Numbering follows Linux: `1..=31` are the classic signals and `32..=64`
//! are real-time signals. Sets are 64-bit masks where bit `n - 1` stands for
//! signal `n`.

use std::fmt;

/// Highest guest signal number.
pub const SIGNAL_COUNT: u8 = 64;

/// `sa_flags` bit: the handler returns through `sa_restorer`.
pub const SA_RESTORER: u32 = 0x0400_0000;
/// `sa_flags` bit: do not block the signal while its handler runs.
pub const SA_NODEFER: u32 = 0x4000_0000;
/// `sa_flags` bit: reset the disposition to default on delivery.
pub const SA_RESETHAND: u32 = 0x8000_0000;

/// A guest signal number in `1..=64`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct Signal(u8);

#[allow(missing_docs)]
impl Signal {
    pub const SIGHUP: Self = Self(1);
    pub const SIGINT: Self = Self(2);
    pub const SIGQUIT: Self = Self(3);
    pub const SIGILL: Self = Self(4);
    pub const SIGTRAP: Self = Self(5);
    pub const SIGABRT: Self = Self(6);
    pub const SIGBUS: Self = Self(7);
    pub const SIGFPE: Self = Self(8);
    pub const SIGKILL: Self = Self(9);
    pub const SIGUSR1: Self = Self(10);
    pub const SIGSEGV: Self = Self(11);
    pub const SIGUSR2: Self = Self(12);
    pub const SIGPIPE: Self = Self(13);
    pub const SIGALRM: Self = Self(14);
    pub const SIGTERM: Self = Self(15);
    pub const SIGSTKFLT: Self = Self(16);
    pub const SIGCHLD: Self = Self(17);
    pub const SIGCONT: Self = Self(18);
    pub const SIGSTOP: Self = Self(19);
    pub const SIGTSTP: Self = Self(20);
    pub const SIGTTIN: Self = Self(21);
    pub const SIGTTOU: Self = Self(22);
    pub const SIGURG: Self = Self(23);
    pub const SIGXCPU: Self = Self(24);
    pub const SIGXFSZ: Self = Self(25);
    pub const SIGVTALRM: Self = Self(26);
    pub const SIGPROF: Self = Self(27);
    pub const SIGWINCH: Self = Self(28);
    pub const SIGIO: Self = Self(29);
    pub const SIGPWR: Self = Self(30);
    pub const SIGSYS: Self = Self(31);
}

impl Signal {
    /// Validates a raw signal number.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn new(signo: u32) -> Option<Self> {
        if signo >= 1 && signo <= SIGNAL_COUNT as u32 {
            Some(Self(signo as u8))
        } else {
            None
        }
    }

    /// Raw signal number.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self.0
    }

    /// Raw signal number as the host C type.
    #[must_use]
    pub const fn as_raw(self) -> i32 {
        self.0 as i32
    }

    /// Signals that can be neither caught, blocked nor ignored.
    #[must_use]
    pub const fn is_uncatchable(self) -> bool {
        self.0 == Self::SIGKILL.0 || self.0 == Self::SIGSTOP.0
    }

    /// Symbolic name, `SIGRT<n>` for real-time signals.
    #[must_use]
    pub fn name(self) -> String {
        nix::sys::signal::Signal::try_from(self.as_raw()).map_or_else(
            |_| format!("SIGRT{}", self.0.saturating_sub(32)),
            |host| host.as_str().to_string(),
        )
    }

    /// Action taken when the disposition is `SIG_DFL`.
    #[must_use]
    pub const fn default_action(self) -> DefaultAction {
        match self.0 {
            3..=8 | 11 | 24 | 25 | 31 => DefaultAction::CoreDump,
            17 | 23 | 28 => DefaultAction::Ignore,
            18 => DefaultAction::Continue,
            19..=22 => DefaultAction::Stop,
            _ => DefaultAction::Terminate,
        }
    }
}

impl fmt::Debug for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name(), self.0)
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

/// What happens to a process when a signal with default disposition is delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DefaultAction {
    /// Kill the process.
    Terminate,
    /// Fire the coredump event, then kill the process.
    CoreDump,
    /// Discard the signal.
    Ignore,
    /// Stop every thread of the process.
    Stop,
    /// Resume a stopped process.
    Continue,
}

/// A set of guest signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct SigSet(u64);

impl SigSet {
    /// The empty set.
    pub const EMPTY: Self = Self(0);

    /// Builds a set from its guest mask representation.
    #[must_use]
    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    /// Guest mask representation.
    #[must_use]
    pub const fn bits(self) -> u64 {
        self.0
    }

    const fn bit(signal: Signal) -> u64 {
        1u64 << (signal.0 - 1)
    }

    /// Whether `signal` is a member.
    #[must_use]
    pub const fn contains(self, signal: Signal) -> bool {
        self.0 & Self::bit(signal) != 0
    }

    /// Adds `signal`.
    pub const fn insert(&mut self, signal: Signal) {
        self.0 |= Self::bit(signal);
    }

    /// Removes `signal`.
    pub const fn remove(&mut self, signal: Signal) {
        self.0 &= !Self::bit(signal);
    }

    /// Set union.
    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Members of `self` that are not in `other`.
    #[must_use]
    pub const fn difference(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }

    /// Whether the set is empty.
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Lowest-numbered member.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn lowest(self) -> Option<Signal> {
        if self.0 == 0 {
            None
        } else {
            Some(Signal(self.0.trailing_zeros() as u8 + 1))
        }
    }

    /// Drops the signals that can never be blocked.
    #[must_use]
    pub const fn without_uncatchable(self) -> Self {
        Self(self.0 & !(Self::bit(Signal::SIGKILL) | Self::bit(Signal::SIGSTOP)))
    }
}

/// Disposition chosen by the guest for one signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SigHandler {
    /// `SIG_DFL`.
    #[default]
    Default,
    /// `SIG_IGN`.
    Ignore,
    /// Guest function address.
    Handler(u32),
}

impl SigHandler {
    /// Decodes the guest `sa_handler` word.
    #[must_use]
    pub const fn from_raw(raw: u32) -> Self {
        match raw {
            0 => Self::Default,
            1 => Self::Ignore,
            addr => Self::Handler(addr),
        }
    }

    /// Encodes back into the guest `sa_handler` word.
    #[must_use]
    pub const fn to_raw(self) -> u32 {
        match self {
            Self::Default => 0,
            Self::Ignore => 1,
            Self::Handler(addr) => addr,
        }
    }
}

/// Guest `sigaction` record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SigAction {
    /// Disposition.
    pub handler: SigHandler,
    /// `SA_*` flags.
    pub flags: u32,
    /// Return trampoline, meaningful with [`SA_RESTORER`].
    pub restorer: u32,
    /// Signals blocked while the handler runs.
    pub mask: SigSet,
}

/// Per-process signal dispositions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalActions {
    actions: [SigAction; SIGNAL_COUNT as usize],
}

impl Default for SignalActions {
    fn default() -> Self {
        Self {
            actions: [SigAction::default(); SIGNAL_COUNT as usize],
        }
    }
}

impl SignalActions {
    /// Current disposition of `signal`.
    #[must_use]
    pub const fn get(&self, signal: Signal) -> SigAction {
        self.actions[(signal.0 - 1) as usize]
    }

    /// Replaces the disposition of `signal`, returning the previous one.
    pub const fn set(&mut self, signal: Signal, action: SigAction) -> SigAction {
        let slot = &mut self.actions[(signal.0 - 1) as usize];
        let previous = *slot;
        *slot = action;
        previous
    }

    /// Whether delivering `signal` right now would have no effect.
    #[must_use]
    pub const fn is_ignored(&self, signal: Signal) -> bool {
        match self.get(signal).handler {
            SigHandler::Ignore => true,
            SigHandler::Default => matches!(signal.default_action(), DefaultAction::Ignore),
            SigHandler::Handler(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::{DefaultAction, SigAction, SigHandler, SigSet, Signal, SignalActions};

    #[rstest]
    #[case(Signal::SIGSEGV, DefaultAction::CoreDump)]
    #[case(Signal::SIGILL, DefaultAction::CoreDump)]
    #[case(Signal::SIGFPE, DefaultAction::CoreDump)]
    #[case(Signal::SIGTERM, DefaultAction::Terminate)]
    #[case(Signal::SIGKILL, DefaultAction::Terminate)]
    #[case(Signal::SIGCHLD, DefaultAction::Ignore)]
    #[case(Signal::SIGWINCH, DefaultAction::Ignore)]
    #[case(Signal::SIGSTOP, DefaultAction::Stop)]
    #[case(Signal::SIGTSTP, DefaultAction::Stop)]
    #[case(Signal::SIGCONT, DefaultAction::Continue)]
    fn default_actions_follow_linux(#[case] signal: Signal, #[case] action: DefaultAction) {
        assert_eq!(signal.default_action(), action);
    }

    #[test]
    fn real_time_signals_terminate_by_default() {
        let rt = Signal::new(40).expect("valid rt signal");
        assert_eq!(rt.default_action(), DefaultAction::Terminate);
        assert_eq!(rt.name(), "SIGRT8");
    }

    #[test]
    fn signal_range_is_checked() {
        assert!(Signal::new(0).is_none());
        assert!(Signal::new(65).is_none());
        assert_eq!(Signal::new(11), Some(Signal::SIGSEGV));
        assert_eq!(Signal::SIGSEGV.name(), "SIGSEGV");
    }

    #[test]
    fn sigset_lowest_and_membership() {
        let mut set = SigSet::EMPTY;
        set.insert(Signal::SIGTERM);
        set.insert(Signal::SIGINT);
        assert!(set.contains(Signal::SIGINT));
        assert_eq!(set.lowest(), Some(Signal::SIGINT));
        set.remove(Signal::SIGINT);
        assert_eq!(set.lowest(), Some(Signal::SIGTERM));
        assert_eq!(set.bits(), 1 << 14);
        let highest = Signal::new(64).expect("valid");
        let mut top = SigSet::EMPTY;
        top.insert(highest);
        assert_eq!(top.lowest(), Some(highest));
    }

    #[test]
    fn uncatchable_signals_are_stripped_from_masks() {
        let all = SigSet::from_bits(u64::MAX).without_uncatchable();
        assert!(!all.contains(Signal::SIGKILL));
        assert!(!all.contains(Signal::SIGSTOP));
        assert!(all.contains(Signal::SIGTERM));
    }

    #[test]
    fn ignored_reflects_explicit_and_default_dispositions() {
        let mut actions = SignalActions::default();
        assert!(actions.is_ignored(Signal::SIGCHLD));
        assert!(!actions.is_ignored(Signal::SIGTERM));
        let previous = actions.set(
            Signal::SIGTERM,
            SigAction {
                handler: SigHandler::Ignore,
                ..SigAction::default()
            },
        );
        assert_eq!(previous.handler, SigHandler::Default);
        assert!(actions.is_ignored(Signal::SIGTERM));
        assert_eq!(SigHandler::from_raw(0x0804_8000).to_raw(), 0x0804_8000);
    }
}
