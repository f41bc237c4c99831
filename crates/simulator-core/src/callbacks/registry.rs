use std::sync::Arc;

use super::{
    Callback, CallbackChain, CallbackId, InsnArgs, ProcessArgs, SignalArgs, SyscallArgs,
    ThreadArgs, When,
};

/// Before and after chains of one event category.
#[derive(Debug)]
pub struct ChainPair<A> {
    /// Runs ahead of the default action.
    pub before: CallbackChain<A>,
    /// Runs after the default action, or after it was suppressed.
    pub after: CallbackChain<A>,
}

impl<A> Default for ChainPair<A> {
    fn default() -> Self {
        Self {
            before: CallbackChain::new(),
            after: CallbackChain::new(),
        }
    }
}

impl<A> ChainPair<A> {
    /// Chain at `when`.
    #[must_use]
    pub const fn chain(&self, when: When) -> &CallbackChain<A> {
        match when {
            When::Before => &self.before,
            When::After => &self.after,
        }
    }

    /// Chain at `when`, mutably.
    pub const fn chain_mut(&mut self, when: When) -> &mut CallbackChain<A> {
        match when {
            When::Before => &mut self.before,
            When::After => &mut self.after,
        }
    }

    fn duplicate(&self) -> Self {
        Self {
            before: self.before.duplicate(),
            after: self.after.duplicate(),
        }
    }
}

/// Event argument shapes that own a chain pair in [`Callbacks`].
pub trait EventArgs: Sized + 'static {
    /// Chain pair for this shape.
    fn pair(callbacks: &Callbacks) -> &ChainPair<Self>;
    /// Chain pair for this shape, mutably.
    fn pair_mut(callbacks: &mut Callbacks) -> &mut ChainPair<Self>;
}

macro_rules! event_args {
    ($($args:ty => $field:ident),* $(,)?) => {
        $(
            impl EventArgs for $args {
                fn pair(callbacks: &Callbacks) -> &ChainPair<Self> {
                    &callbacks.$field
                }

                fn pair_mut(callbacks: &mut Callbacks) -> &mut ChainPair<Self> {
                    &mut callbacks.$field
                }
            }
        )*
    };
}

event_args! {
    InsnArgs => insn,
    SyscallArgs => syscall,
    SignalArgs => signal,
    ThreadArgs => thread,
    ProcessArgs => process,
}

/// Every callback chain attached to one target (simulator, process or thread).
#[derive(Debug, Default)]
pub struct Callbacks {
    insn: ChainPair<InsnArgs>,
    syscall: ChainPair<SyscallArgs>,
    signal: ChainPair<SignalArgs>,
    thread: ChainPair<ThreadArgs>,
    process: ChainPair<ProcessArgs>,
    unhandled_insn: CallbackChain<InsnArgs>,
}

impl Callbacks {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Chain for argument shape `A` at `when`.
    #[must_use]
    pub fn chain<A: EventArgs>(&self, when: When) -> &CallbackChain<A> {
        A::pair(self).chain(when)
    }

    /// Chain for argument shape `A` at `when`, mutably.
    pub fn chain_mut<A: EventArgs>(&mut self, when: When) -> &mut CallbackChain<A> {
        A::pair_mut(self).chain_mut(when)
    }

    /// Appends a callback.
    pub fn add<A: EventArgs>(&mut self, when: When, callback: Arc<dyn Callback<A>>) {
        self.chain_mut::<A>(when).append(callback);
    }

    /// Removes a callback from one position.
    pub fn remove<A: EventArgs>(&mut self, when: When, id: CallbackId) -> bool {
        self.chain_mut::<A>(when).remove(id)
    }

    /// Removes a callback from both positions; true if it was found anywhere.
    pub fn remove_everywhere<A: EventArgs>(&mut self, id: CallbackId) -> bool {
        let before = self.remove::<A>(When::Before, id);
        let after = self.remove::<A>(When::After, id);
        before || after
    }

    /// Appends an instruction callback.
    pub fn add_insn_callback(&mut self, when: When, callback: Arc<dyn Callback<InsnArgs>>) {
        self.add(when, callback);
    }

    /// Appends a syscall callback.
    pub fn add_syscall_callback(&mut self, when: When, callback: Arc<dyn Callback<SyscallArgs>>) {
        self.add(when, callback);
    }

    /// Appends a signal callback.
    pub fn add_signal_callback(&mut self, when: When, callback: Arc<dyn Callback<SignalArgs>>) {
        self.add(when, callback);
    }

    /// Appends a thread life-cycle callback.
    pub fn add_thread_callback(&mut self, when: When, callback: Arc<dyn Callback<ThreadArgs>>) {
        self.add(when, callback);
    }

    /// Appends a process life-cycle callback.
    pub fn add_process_callback(&mut self, when: When, callback: Arc<dyn Callback<ProcessArgs>>) {
        self.add(when, callback);
    }

    /// Chain consulted for unsupported opcodes; seeded `false`, a `true`
    /// result means a callback emulated the instruction.
    #[must_use]
    pub const fn unhandled_insn(&self) -> &CallbackChain<InsnArgs> {
        &self.unhandled_insn
    }

    /// Unhandled-instruction chain, mutably.
    pub const fn unhandled_insn_mut(&mut self) -> &mut CallbackChain<InsnArgs> {
        &mut self.unhandled_insn
    }

    /// Copy for a new target, duplicating every callback.
    #[must_use]
    pub fn duplicate(&self) -> Self {
        Self {
            insn: self.insn.duplicate(),
            syscall: self.syscall.duplicate(),
            signal: self.signal.duplicate(),
            thread: self.thread.duplicate(),
            process: self.process.duplicate(),
            unhandled_insn: self.unhandled_insn.duplicate(),
        }
    }

    /// Total number of registrations across all chains.
    #[must_use]
    pub fn len(&self) -> usize {
        fn pair<A>(pair: &ChainPair<A>) -> usize {
            pair.before.len() + pair.after.len()
        }
        pair(&self.insn)
            + pair(&self.syscall)
            + pair(&self.signal)
            + pair(&self.thread)
            + pair(&self.process)
            + self.unhandled_insn.len()
    }

    /// Whether nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
