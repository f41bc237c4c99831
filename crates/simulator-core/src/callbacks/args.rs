use crate::decoder::Instruction;
use crate::process::Pid;
use crate::signal::Signal;
use crate::thread::Tid;

/// Arguments of instruction callbacks and of the unhandled-instruction chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InsnArgs {
    /// Executing thread.
    pub tid: Tid,
    /// Instruction about to execute (before) or just executed (after).
    pub insn: Instruction,
}

/// Arguments of syscall callbacks and syscall bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyscallArgs {
    /// Calling thread.
    pub tid: Tid,
    /// Syscall number from `r0`.
    pub callno: u32,
    /// Arguments from `r1..r6`.
    pub args: [u32; 6],
}

impl SyscallArgs {
    /// Argument `n` (zero based); out-of-range indices read as zero.
    #[must_use]
    pub fn arg(&self, n: usize) -> u32 {
        self.args.get(n).copied().unwrap_or_default()
    }
}

/// Where a signal is in its life cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalReason {
    /// Posted to a thread; vetoing discards it.
    Arrival,
    /// About to act on a thread; vetoing skips the action.
    Delivery,
}

/// Arguments of signal callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignalArgs {
    /// Receiving thread.
    pub tid: Tid,
    /// Signal number.
    pub signal: Signal,
    /// Arrival or delivery.
    pub reason: SignalReason,
}

/// Thread life-cycle events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ThreadReason {
    /// Thread created and about to run its first instruction.
    Start,
    /// Thread terminated.
    Exit,
}

/// Arguments of thread callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadArgs {
    /// Thread concerned.
    pub tid: Tid,
    /// Event.
    pub reason: ThreadReason,
}

/// Process life-cycle events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcessReason {
    /// Simulator activated around the process.
    Attach,
    /// Guest asked for a new process.
    Fork,
    /// Image loaded (initial exec) or guest `execve`.
    Exec,
    /// Process-directed signal posted.
    Signal,
    /// Core-producing default action is about to run.
    Coredump,
    /// Final status decided; resources still alive.
    Terminate,
}

/// Arguments of process callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessArgs {
    /// Process concerned.
    pub pid: Pid,
    /// Event.
    pub reason: ProcessReason,
    /// Signal involved in `Signal`, `Coredump` and signal-caused `Terminate` events.
    pub signal: Option<Signal>,
}
