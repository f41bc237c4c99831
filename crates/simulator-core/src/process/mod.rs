//! Guest process: address space, descriptors, threads and lifecycle.

mod signals;
/// Initial stack layout.
pub mod stack;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::api::{SimError, SimulatorConfig};
use crate::callbacks::{
    invoke, Callbacks, Context, EventArgs, ProcessArgs, ProcessReason, ThreadArgs, ThreadReason,
    When,
};
use crate::disasm::{render_listing, Disassembler, DisassemblyRow};
use crate::loader::LoadedImage;
use crate::memory::{page_ceil, MemoryMap, Permissions, Segment};
use crate::signal::{SigAction, Signal, SignalActions};
use crate::state::{RegisterFile, ThreadState};
use crate::syscall::{FdTable, SyscallTable};
use crate::thread::{self, Thread, Tid};
use crate::trace::{TraceFacility, Tracer};

/// Guest process identifier; the simulator reuses the host pid.
pub type Pid = u32;

/// Run or termination status of a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub enum ProcessStatus {
    /// At least one thread can run.
    Running,
    /// Stopped by a signal until `SIGCONT`.
    Stopped(Signal),
    /// Last thread exited or `exit_group` was called.
    Exited(u8),
    /// Killed by a signal.
    Killed {
        /// Fatal signal.
        signal: Signal,
        /// Whether the coredump action ran.
        core_dumped: bool,
    },
}

impl ProcessStatus {
    /// Whether the process can never run again.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Exited(_) | Self::Killed { .. })
    }

    /// Host exit status: the exit code, or 128 plus the signal number.
    #[must_use]
    pub fn exit_code(self) -> i32 {
        match self {
            Self::Running | Self::Stopped(_) => 0,
            Self::Exited(code) => i32::from(code),
            Self::Killed { signal, .. } => 128 + signal.as_raw(),
        }
    }

    /// Fatal signal of a killed process.
    #[must_use]
    pub const fn signal(self) -> Option<Signal> {
        match self {
            Self::Killed { signal, .. } => Some(signal),
            _ => None,
        }
    }
}

impl fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => f.write_str("running"),
            Self::Stopped(signal) => write!(f, "stopped by {signal}"),
            Self::Exited(code) => write!(f, "exited with status {code}"),
            Self::Killed {
                signal,
                core_dumped: true,
            } => write!(f, "killed by {signal} (core dumped)"),
            Self::Killed { signal, .. } => write!(f, "killed by {signal}"),
        }
    }
}

/// Program break bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Brk {
    start: u32,
    current: u32,
}

/// Collaborators a process shares with its simulator.
#[derive(Clone)]
pub(crate) struct Services {
    pub(crate) syscalls: Arc<SyscallTable>,
    pub(crate) tracer: Tracer,
    pub(crate) disassembler: Arc<dyn Disassembler>,
}

/// A guest process.
pub struct Process {
    pid: Pid,
    argv: Vec<String>,
    entry: u32,
    memory: MemoryMap,
    fds: FdTable,
    threads: BTreeMap<Tid, Thread>,
    next_tid: Tid,
    status: ProcessStatus,
    callbacks: Callbacks,
    sigactions: SignalActions,
    brk: Brk,
    mmap_base: u32,
    stack_floor: u32,
    services: Services,
    terminated: bool,
    core_dumped: bool,
}

impl fmt::Debug for Process {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Process")
            .field("pid", &self.pid)
            .field("status", &self.status)
            .field("threads", &self.threads.keys().collect::<Vec<_>>())
            .field("segments", &self.memory.len())
            .finish_non_exhaustive()
    }
}

impl Process {
    /// Maps `image`, builds the stack if needed, creates the main thread and
    /// fires `Exec` followed by the main thread's `Start`.
    pub(crate) fn exec(
        image: LoadedImage,
        argv: &[String],
        config: &SimulatorConfig,
        callbacks: Callbacks,
        services: Services,
    ) -> Result<Self, SimError> {
        let mut memory = MemoryMap::new();
        let mut image_end = 0u64;
        for segment in image.segments {
            if segment.len == 0 {
                log::debug!("skipping empty segment {} at 0x{:08x}", segment.name, segment.base);
                continue;
            }
            let segment = segment.into_segment();
            image_end = image_end.max(segment.end());
            memory.map(segment)?;
        }

        let stack_floor = match image.initial_sp {
            Some(_) => u32::MAX,
            None => config.stack_base(),
        };
        let sp = match image.initial_sp {
            Some(sp) => sp,
            None => {
                memory.map(Segment::zeroed(
                    config.stack_base(),
                    config.stack_size,
                    Permissions::RW,
                    "[stack]",
                ))?;
                stack::build_initial_stack(
                    &mut memory,
                    config.stack_top,
                    argv,
                    &config.envp,
                    image.entry,
                )?
            }
        };

        let brk_start = u32::try_from(image_end)
            .ok()
            .and_then(page_ceil)
            .unwrap_or(u32::MAX);
        let pid = std::process::id();
        let mut process = Self {
            pid,
            argv: argv.to_vec(),
            entry: image.entry,
            memory,
            fds: FdTable::with_stdio(),
            threads: BTreeMap::new(),
            next_tid: pid.wrapping_add(1),
            status: ProcessStatus::Running,
            callbacks,
            sigactions: SignalActions::default(),
            brk: Brk {
                start: brk_start,
                current: brk_start,
            },
            mmap_base: config.mmap_base,
            stack_floor,
            services,
            terminated: false,
            core_dumped: false,
        };

        let main = Thread::new(
            pid,
            RegisterFile::at_entry(image.entry, sp),
            process.callbacks.duplicate(),
        );
        process.threads.insert(pid, main);
        log::debug!(
            "exec {:?}: entry 0x{:08x}, sp 0x{sp:08x}, brk 0x{brk_start:08x}",
            process.argv,
            image.entry
        );
        process.tracer().emit(TraceFacility::MISC, || {
            format!("exec {} entry=0x{:08x}", process.argv.join(" "), image.entry)
        });
        process.fire_process_event(ProcessReason::Exec, None);
        process.thread_event(pid, ThreadReason::Start);
        Ok(process)
    }

    /// Process id.
    #[must_use]
    pub const fn pid(&self) -> Pid {
        self.pid
    }

    /// Argument vector the process was started with.
    #[must_use]
    pub fn argv(&self) -> &[String] {
        &self.argv
    }

    /// Entry point of the loaded image.
    #[must_use]
    pub const fn entry(&self) -> u32 {
        self.entry
    }

    /// Address space.
    #[must_use]
    pub const fn memory(&self) -> &MemoryMap {
        &self.memory
    }

    /// Address space, mutably.
    pub const fn memory_mut(&mut self) -> &mut MemoryMap {
        &mut self.memory
    }

    /// Descriptor table.
    #[must_use]
    pub const fn fds(&self) -> &FdTable {
        &self.fds
    }

    /// Descriptor table, mutably.
    pub const fn fds_mut(&mut self) -> &mut FdTable {
        &mut self.fds
    }

    /// Current status.
    #[must_use]
    pub const fn status(&self) -> ProcessStatus {
        self.status
    }

    /// Whether the process reached `Exited` or `Killed`.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Whether `Terminate` already fired.
    #[must_use]
    pub const fn is_terminated(&self) -> bool {
        self.terminated
    }

    /// Process-level callbacks; new threads start with a duplicate.
    #[must_use]
    pub const fn callbacks(&self) -> &Callbacks {
        &self.callbacks
    }

    /// Process-level callbacks, mutably.
    pub const fn callbacks_mut(&mut self) -> &mut Callbacks {
        &mut self.callbacks
    }

    /// Shared syscall table.
    #[must_use]
    pub const fn syscall_table(&self) -> &Arc<SyscallTable> {
        &self.services.syscalls
    }

    /// Guest trace.
    #[must_use]
    pub const fn tracer(&self) -> &Tracer {
        &self.services.tracer
    }

    /// Thread `tid`.
    #[must_use]
    pub fn thread(&self, tid: Tid) -> Option<&Thread> {
        self.threads.get(&tid)
    }

    /// Thread `tid`, mutably.
    pub fn thread_mut(&mut self, tid: Tid) -> Option<&mut Thread> {
        self.threads.get_mut(&tid)
    }

    pub(crate) fn thread_and_memory(&mut self, tid: Tid) -> Option<(&mut Thread, &mut MemoryMap)> {
        let thread = self.threads.get_mut(&tid)?;
        Some((thread, &mut self.memory))
    }

    /// Every thread, terminated ones included, in creation order.
    pub fn threads(&self) -> impl Iterator<Item = &Thread> {
        self.threads.values()
    }

    /// Every thread, mutably.
    pub fn threads_mut(&mut self) -> impl Iterator<Item = &mut Thread> {
        self.threads.values_mut()
    }

    /// Ids of all threads in creation order.
    #[must_use]
    pub fn tids(&self) -> Vec<Tid> {
        self.threads.keys().copied().collect()
    }

    /// Ids of threads that have not terminated.
    #[must_use]
    pub fn live_tids(&self) -> Vec<Tid> {
        self.threads
            .values()
            .filter(|thread| thread.is_live())
            .map(Thread::tid)
            .collect()
    }

    /// Lowest `mmap` placement address.
    #[must_use]
    pub const fn mmap_base(&self) -> u32 {
        self.mmap_base
    }

    /// Upper bound for non-fixed mappings.
    #[must_use]
    pub const fn stack_floor(&self) -> u32 {
        self.stack_floor
    }

    /// Disposition of `signal`.
    #[must_use]
    pub const fn sigaction(&self, signal: Signal) -> SigAction {
        self.sigactions.get(signal)
    }

    /// Replaces the disposition of `signal`, returning the old one.
    pub const fn set_sigaction(&mut self, signal: Signal, action: SigAction) -> SigAction {
        self.sigactions.set(signal, action)
    }

    /// Current program break.
    #[must_use]
    pub const fn brk(&self) -> u32 {
        self.brk.current
    }

    /// Moves the program break to `request`, mapping or unmapping heap pages.
    /// Returns the resulting break; on failure it is left unchanged.
    pub fn set_brk(&mut self, request: u32) -> u32 {
        if request < self.brk.start {
            return self.brk.current;
        }
        let (Some(old_end), Some(new_end)) = (page_ceil(self.brk.current), page_ceil(request))
        else {
            return self.brk.current;
        };
        if new_end > old_end {
            let heap = Segment::zeroed(old_end, new_end - old_end, Permissions::RW, "[heap]");
            if self.memory.map(heap).is_err() {
                log::debug!("brk 0x{request:08x} collides with an existing mapping");
                return self.brk.current;
            }
        } else if new_end < old_end {
            self.memory.unmap(new_end, old_end - new_end);
        }
        self.brk.current = request;
        self.tracer()
            .emit(TraceFacility::MMAP, || format!("brk 0x{request:08x}"));
        request
    }

    /// Creates a runnable thread with `regs`, duplicating the process
    /// callbacks into it, and fires its `Start` event.
    pub fn spawn_thread(&mut self, regs: RegisterFile) -> Tid {
        let tid = self.next_tid;
        self.next_tid = self.next_tid.wrapping_add(1);
        let thread = Thread::new(tid, regs, self.callbacks.duplicate());
        self.threads.insert(tid, thread);
        self.tracer()
            .emit(TraceFacility::THREAD, || format!("[{tid}] created"));
        self.thread_event(tid, ThreadReason::Start);
        tid
    }

    /// Terminates one thread. When it was the last live thread the process
    /// becomes `Exited(code)`.
    pub fn exit_thread(&mut self, tid: Tid, code: u8) {
        let Some(thread) = self.threads.get_mut(&tid) else {
            return;
        };
        if !thread.is_live() {
            return;
        }
        thread.set_state(ThreadState::Terminated);
        thread.set_exit_code(code);
        self.tracer()
            .emit(TraceFacility::THREAD, || format!("[{tid}] exited with {code}"));
        self.thread_event(tid, ThreadReason::Exit);
        if self.live_tids().is_empty() && !self.status.is_terminal() {
            self.status = ProcessStatus::Exited(code);
        }
    }

    /// Terminates every thread and marks the process `Exited(code)`.
    pub fn exit_group(&mut self, code: u8) {
        self.set_terminal(ProcessStatus::Exited(code));
    }

    /// Records a terminal status and terminates every live thread. The
    /// first terminal status wins.
    pub(crate) fn set_terminal(&mut self, status: ProcessStatus) {
        if self.status.is_terminal() {
            return;
        }
        self.status = status;
        for tid in self.live_tids() {
            if let Some(thread) = self.threads.get_mut(&tid) {
                thread.set_state(ThreadState::Terminated);
            }
            self.thread_event(tid, ThreadReason::Exit);
        }
    }

    /// Runs the process before chain, `default` when still enabled, then the
    /// after chain. Returns whether the default action ran.
    pub(crate) fn process_event(
        &mut self,
        reason: ProcessReason,
        signal: Option<Signal>,
        default: impl FnOnce(&mut Self),
    ) -> bool {
        let args = ProcessArgs {
            pid: self.pid,
            reason,
            signal,
        };
        let before = self.callbacks.chain::<ProcessArgs>(When::Before).snapshot();
        let enabled = invoke(&before, true, &args, &mut Context::new(self, None));
        if enabled {
            default(self);
        }
        let after = self.callbacks.chain::<ProcessArgs>(When::After).snapshot();
        invoke(&after, enabled, &args, &mut Context::new(self, None));
        enabled
    }

    /// Fires a process lifecycle event without a default action. Returns the
    /// before chain's verdict.
    pub fn fire_process_event(&mut self, reason: ProcessReason, signal: Option<Signal>) -> bool {
        self.process_event(reason, signal, |_| {})
    }

    fn thread_event(&mut self, tid: Tid, reason: ThreadReason) {
        let args = ThreadArgs { tid, reason };
        let enabled = self.run_thread_chain(tid, When::Before, true, &args);
        self.run_thread_chain(tid, When::After, enabled, &args);
    }

    /// Runs the chain of `tid` for argument shape `A` at `when`.
    pub(crate) fn run_thread_chain<A: EventArgs>(
        &mut self,
        tid: Tid,
        when: When,
        seed: bool,
        args: &A,
    ) -> bool {
        let Some(thread) = self.threads.get(&tid) else {
            return seed;
        };
        let chain = thread.callbacks().chain::<A>(when).snapshot();
        invoke(&chain, seed, args, &mut Context::new(self, Some(tid)))
    }

    /// Executes one instruction on `tid`.
    pub fn step(&mut self, tid: Tid) {
        thread::step(self, tid);
    }

    /// Fires `Terminate` once the status is terminal, then releases the
    /// descriptor table. Idempotent.
    pub fn settle(&mut self) {
        if !self.status.is_terminal() || self.terminated {
            return;
        }
        self.terminated = true;
        let status = self.status;
        self.tracer()
            .emit(TraceFacility::MISC, || format!("process {}: {status}", self.pid));
        self.fire_process_event(ProcessReason::Terminate, status.signal());
        self.fds.release_all();
    }

    /// Whether the coredump default action ran for the fatal signal.
    #[must_use]
    pub const fn core_dumped(&self) -> bool {
        self.core_dumped
    }

    /// Memory-map listing.
    #[must_use]
    pub fn render_map(&self, title: &str, prefix: &str) -> String {
        self.memory.render(title, prefix)
    }

    /// Disassembles `[start, end)` through the configured service.
    #[must_use]
    pub fn disassemble(&self, start: u32, end: u32) -> Vec<DisassemblyRow> {
        self.services
            .disassembler
            .disassemble(&self.memory, start, end)
    }

    /// Disassembly listing of `[start, end)`.
    #[must_use]
    pub fn render_disassembly(&self, start: u32, end: u32, prefix: &str) -> String {
        render_listing(&self.disassemble(start, end), prefix)
    }
}
