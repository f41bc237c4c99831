//! Guest threads and the single-step execution engine.

use crate::callbacks::{invoke, Callbacks, Context, InsnArgs, SyscallArgs, When};
use crate::decoder::{Decoder, Instruction};
use crate::execute::{execute_instruction, ExecuteOutcome};
use crate::process::Process;
use crate::signal::{SigSet, Signal};
use crate::state::{Register, RegisterFile, ThreadState};
use crate::syscall;
use crate::trace::TraceFacility;

/// Guest thread identifier. The main thread's id equals the process id.
pub type Tid = u32;

/// Registers and mask saved when a guest signal handler is entered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignalFrame {
    /// Registers at the point of interruption.
    pub regs: RegisterFile,
    /// Signal mask to restore.
    pub mask: SigSet,
}

/// One guest thread.
#[derive(Debug)]
pub struct Thread {
    tid: Tid,
    regs: RegisterFile,
    state: ThreadState,
    sigmask: SigSet,
    pending: SigSet,
    frames: Vec<SignalFrame>,
    callbacks: Callbacks,
    insn_count: u64,
    exit_code: Option<u8>,
    yielded: bool,
}

impl Thread {
    /// Creates a runnable thread.
    #[must_use]
    pub const fn new(tid: Tid, regs: RegisterFile, callbacks: Callbacks) -> Self {
        Self {
            tid,
            regs,
            state: ThreadState::Runnable,
            sigmask: SigSet::EMPTY,
            pending: SigSet::EMPTY,
            frames: Vec::new(),
            callbacks,
            insn_count: 0,
            exit_code: None,
            yielded: false,
        }
    }

    /// Thread id.
    #[must_use]
    pub const fn tid(&self) -> Tid {
        self.tid
    }

    /// Register file.
    #[must_use]
    pub const fn regs(&self) -> &RegisterFile {
        &self.regs
    }

    /// Register file, mutably.
    pub const fn regs_mut(&mut self) -> &mut RegisterFile {
        &mut self.regs
    }

    /// Scheduling state.
    #[must_use]
    pub const fn state(&self) -> ThreadState {
        self.state
    }

    pub(crate) const fn set_state(&mut self, state: ThreadState) {
        self.state = state;
    }

    /// Whether the thread has not terminated.
    #[must_use]
    pub const fn is_live(&self) -> bool {
        self.state.is_live()
    }

    /// Blocked signals.
    #[must_use]
    pub const fn sigmask(&self) -> SigSet {
        self.sigmask
    }

    /// Replaces the blocked set. `SIGKILL` and `SIGSTOP` can never be blocked.
    pub const fn set_sigmask(&mut self, mask: SigSet) {
        self.sigmask = mask.without_uncatchable();
    }

    /// Posted but undelivered signals.
    #[must_use]
    pub const fn pending(&self) -> SigSet {
        self.pending
    }

    pub(crate) const fn pending_mut(&mut self) -> &mut SigSet {
        &mut self.pending
    }

    /// Lowest pending signal that is not blocked.
    #[must_use]
    pub const fn next_deliverable(&self) -> Option<Signal> {
        self.pending.difference(self.sigmask).lowest()
    }

    pub(crate) fn push_frame(&mut self, frame: SignalFrame) {
        self.frames.push(frame);
    }

    pub(crate) fn pop_frame(&mut self) -> Option<SignalFrame> {
        self.frames.pop()
    }

    /// Depth of nested signal handlers.
    #[must_use]
    pub fn frame_depth(&self) -> usize {
        self.frames.len()
    }

    /// Callbacks attached to this thread.
    #[must_use]
    pub const fn callbacks(&self) -> &Callbacks {
        &self.callbacks
    }

    /// Callbacks attached to this thread, mutably.
    pub const fn callbacks_mut(&mut self) -> &mut Callbacks {
        &mut self.callbacks
    }

    /// Instructions fetched so far.
    #[must_use]
    pub const fn insn_count(&self) -> u64 {
        self.insn_count
    }

    /// Exit code, once the thread exited voluntarily.
    #[must_use]
    pub const fn exit_code(&self) -> Option<u8> {
        self.exit_code
    }

    pub(crate) const fn set_exit_code(&mut self, code: u8) {
        self.exit_code = Some(code);
    }

    pub(crate) const fn request_yield(&mut self) {
        self.yielded = true;
    }

    /// Clears and returns the yield request made by `sched_yield`.
    pub(crate) const fn take_yield(&mut self) -> bool {
        let yielded = self.yielded;
        self.yielded = false;
        yielded
    }

    /// Syscall number and arguments as the guest passed them.
    #[must_use]
    pub const fn syscall_args(&self) -> SyscallArgs {
        let regs = &self.regs;
        SyscallArgs {
            tid: self.tid,
            callno: regs.get(Register::R0),
            args: [
                regs.get(Register::R1),
                regs.get(Register::R2),
                regs.get(Register::R3),
                regs.get(Register::R4),
                regs.get(Register::R5),
                regs.get(Register::R6),
            ],
        }
    }

    /// Writes a syscall result to `r0`.
    pub const fn set_syscall_return(&mut self, value: u32) {
        self.regs.set(Register::R0, value);
    }
}

/// Runs one instruction of `tid`: fetch, before chain, execution, after
/// chain, signal delivery and lifecycle settlement. Threads that are not
/// runnable are left alone.
pub fn step(process: &mut Process, tid: Tid) {
    let ip = match process.thread(tid) {
        Some(thread) if thread.state() == ThreadState::Runnable => thread.regs().ip(),
        _ => return,
    };

    match Decoder::fetch(process.memory(), ip) {
        Ok(insn) => run_instruction(process, tid, insn),
        Err(fault) => {
            log::debug!("thread {tid}: fetch fault at 0x{ip:08x}: {:?}", fault.code);
            process.force_signal(tid, fault.code.signal());
        }
    }

    process.deliver_pending(tid);
    process.settle();
}

fn run_instruction(process: &mut Process, tid: Tid, insn: Instruction) {
    if let Some(thread) = process.thread_mut(tid) {
        thread.insn_count += 1;
    }
    process
        .tracer()
        .emit(TraceFacility::INSN, || format!("[{tid}] 0x{:08x}: {insn}", insn.address));

    let args = InsnArgs { tid, insn };
    let enabled = process.run_thread_chain(tid, When::Before, true, &args);
    if enabled {
        execute(process, tid, &args);
    }
    process.run_thread_chain(tid, When::After, enabled, &args);
}

fn execute(process: &mut Process, tid: Tid, args: &InsnArgs) {
    let outcome = match process.thread_and_memory(tid) {
        Some((thread, memory)) => execute_instruction(&args.insn, thread.regs_mut(), memory),
        None => return,
    };
    match outcome {
        ExecuteOutcome::Retired => {}
        ExecuteOutcome::Syscall => syscall::dispatch(process, tid),
        ExecuteOutcome::Fault(fault) => {
            process.tracer().emit(TraceFacility::SIGNAL, || {
                format!(
                    "[{tid}] fault {:?} at 0x{:08x} (insn 0x{:08x})",
                    fault.code, fault.addr, args.insn.address
                )
            });
            process.force_signal(tid, fault.code.signal());
        }
        ExecuteOutcome::Unsupported { opcode } => {
            let chain = match process.thread(tid) {
                Some(thread) => thread.callbacks().unhandled_insn().snapshot(),
                None => return,
            };
            let handled = invoke(&chain, false, args, &mut Context::new(process, Some(tid)));
            if !handled {
                log::debug!("thread {tid}: unhandled opcode 0x{opcode:02x}");
                process.force_signal(tid, Signal::SIGILL);
            }
        }
    }
}
