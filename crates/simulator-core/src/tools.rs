//! Ready-made analysis callbacks: disassembly triggers, coredump reports and
//! emulation of the extension instructions.

use std::collections::BTreeSet;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::callbacks::{Callback, CallbackId, Context, InsnArgs, ProcessArgs, ProcessReason};
use crate::decoder::Operation;
use crate::encoding::{OP_CPUID, OP_RDTSC};
use crate::memory::Permissions;
use crate::process::Process;
use crate::state::Register;
use crate::trace::Transcript;

/// Instructions listed when an armed address is reached.
const LISTING_ROWS: u32 = 32;

/// Vendor word returned by `cpuid` in `r1`.
pub const CPUID_VENDOR: u32 = u32::from_le_bytes(*b"GX32");
/// Feature word returned by `cpuid` in `r2`.
pub const CPUID_FEATURES: u32 = 1;

/// Result of [`TriggerRegistry::take_hit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TriggerHit {
    /// The address was armed and has now been disarmed.
    pub hit: bool,
    /// No armed address remains.
    pub exhausted: bool,
}

/// Set of armed addresses shared between a tool and its configuration.
#[derive(Debug, Default)]
pub struct TriggerRegistry {
    armed: Mutex<BTreeSet<u32>>,
}

impl TriggerRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Arms `addr`; returns false if it already was.
    pub fn arm(&self, addr: u32) -> bool {
        self.armed.lock().insert(addr)
    }

    /// Disarms `addr`; returns false if it was not armed.
    pub fn disarm(&self, addr: u32) -> bool {
        self.armed.lock().remove(&addr)
    }

    /// Whether `addr` is armed.
    #[must_use]
    pub fn is_armed(&self, addr: u32) -> bool {
        self.armed.lock().contains(&addr)
    }

    /// Armed addresses in ascending order.
    #[must_use]
    pub fn armed(&self) -> Vec<u32> {
        self.armed.lock().iter().copied().collect()
    }

    /// Disarms `addr` if armed and reports whether anything is left, in one
    /// critical section.
    pub fn take_hit(&self, addr: u32) -> TriggerHit {
        let mut armed = self.armed.lock();
        let hit = armed.remove(&addr);
        TriggerHit {
            hit,
            exhausted: armed.is_empty(),
        }
    }
}

fn executable_ranges(process: &Process) -> Vec<(u32, u32, String)> {
    process
        .memory()
        .entries()
        .into_iter()
        .filter(|entry| entry.perms.contains(Permissions::EXEC))
        .map(|entry| (entry.start, entry.start.saturating_add(entry.len), entry.name))
        .collect()
}

/// Instruction before-callback that lists code the first time execution
/// reaches each armed address. Removes itself from the process and all its
/// threads once nothing is armed.
#[derive(Debug)]
pub struct DisassembleAtAddress {
    triggers: Arc<TriggerRegistry>,
    transcript: Transcript,
}

impl DisassembleAtAddress {
    /// Tool reporting to `transcript`.
    #[must_use]
    pub fn new(triggers: Arc<TriggerRegistry>, transcript: Transcript) -> Arc<Self> {
        Arc::new(Self {
            triggers,
            transcript,
        })
    }

    /// Shared trigger set.
    #[must_use]
    pub fn triggers(&self) -> &Arc<TriggerRegistry> {
        &self.triggers
    }

    fn report(&self, process: &Process, addr: u32) {
        self.transcript.line(&format!(
            "DisassembleAtAddress triggered at 0x{addr:08x} for process {}",
            process.pid()
        ));
        let end = process
            .memory()
            .segment_containing(addr)
            .map_or(addr, |segment| {
                let limit = u64::from(addr) + u64::from(LISTING_ROWS * 8);
                u32::try_from(segment.end().min(limit)).unwrap_or(u32::MAX)
            });
        self.transcript
            .block(&process.render_disassembly(addr, end, "  "));
    }

    fn uninstall(&self, process: &mut Process) {
        let id = CallbackId::of(self);
        process.callbacks_mut().remove_everywhere::<InsnArgs>(id);
        for thread in process.threads_mut() {
            thread.callbacks_mut().remove_everywhere::<InsnArgs>(id);
        }
        log::debug!("disassemble-at-address triggers exhausted; callback removed");
    }
}

impl Callback<InsnArgs> for DisassembleAtAddress {
    fn call(&self, enabled: bool, args: &InsnArgs, cx: &mut Context<'_>) -> bool {
        let TriggerHit { hit, exhausted } = self.triggers.take_hit(args.insn.address);
        if hit {
            self.report(cx.process(), args.insn.address);
        }
        if exhausted {
            self.uninstall(cx.process_mut());
        }
        enabled
    }

    fn duplicate(self: Arc<Self>) -> Arc<dyn Callback<InsnArgs>> {
        self
    }
}

/// Process before-callback listing every executable segment when the
/// process is about to dump core.
#[derive(Debug)]
pub struct DisassembleAtCoreDump {
    transcript: Transcript,
}

impl DisassembleAtCoreDump {
    /// Tool reporting to `transcript`.
    #[must_use]
    pub fn new(transcript: Transcript) -> Arc<Self> {
        Arc::new(Self { transcript })
    }
}

impl Callback<ProcessArgs> for DisassembleAtCoreDump {
    fn call(&self, enabled: bool, args: &ProcessArgs, cx: &mut Context<'_>) -> bool {
        if args.reason != ProcessReason::Coredump {
            return enabled;
        }
        let process = cx.process();
        self.transcript.line(&format!(
            "DisassembleAtCoreDump triggered for process {}",
            args.pid
        ));
        for (base, end, name) in executable_ranges(process) {
            self.transcript.line(&format!("{name}:"));
            self.transcript
                .block(&process.render_disassembly(base, end, "  "));
        }
        enabled
    }

    fn duplicate(self: Arc<Self>) -> Arc<dyn Callback<ProcessArgs>> {
        self
    }
}

/// Process before-callback printing the memory map when the process is
/// about to dump core.
#[derive(Debug)]
pub struct ShowMapAtCoreDump {
    transcript: Transcript,
}

impl ShowMapAtCoreDump {
    /// Tool reporting to `transcript`.
    #[must_use]
    pub fn new(transcript: Transcript) -> Arc<Self> {
        Arc::new(Self { transcript })
    }
}

impl Callback<ProcessArgs> for ShowMapAtCoreDump {
    fn call(&self, enabled: bool, args: &ProcessArgs, cx: &mut Context<'_>) -> bool {
        if args.reason == ProcessReason::Coredump {
            let title = format!("ShowMapAtCoreDump triggered for process {}", args.pid);
            self.transcript
                .block(&cx.process().render_map(&title, "  "));
        }
        enabled
    }

    fn duplicate(self: Arc<Self>) -> Arc<dyn Callback<ProcessArgs>> {
        self
    }
}

/// Unhandled-instruction callback implementing `cpuid` and `rdtsc`.
///
/// `cpuid` loads `r0 = 0`, `r1 = CPUID_VENDOR`, `r2 = CPUID_FEATURES`.
/// `rdtsc` loads the thread's retired-instruction count into `r0` (low) and
/// `r1` (high). Both advance `ip` past the instruction.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnhandledInstruction;

impl UnhandledInstruction {
    /// Shared instance.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self)
    }
}

impl Callback<InsnArgs> for UnhandledInstruction {
    #[allow(clippy::cast_possible_truncation)]
    fn call(&self, enabled: bool, args: &InsnArgs, cx: &mut Context<'_>) -> bool {
        if enabled {
            return true;
        }
        let Operation::Unsupported { opcode } = args.insn.operation else {
            return false;
        };
        let Some(thread) = cx.thread_mut() else {
            return false;
        };
        let count = thread.insn_count();
        let regs = thread.regs_mut();
        match opcode {
            OP_CPUID => {
                regs.set(Register::R0, 0);
                regs.set(Register::R1, CPUID_VENDOR);
                regs.set(Register::R2, CPUID_FEATURES);
            }
            OP_RDTSC => {
                regs.set(Register::R0, count as u32);
                regs.set(Register::R1, (count >> 32) as u32);
            }
            _ => return false,
        }
        regs.set_ip(args.insn.next_address());
        true
    }

    fn duplicate(self: Arc<Self>) -> Arc<dyn Callback<InsnArgs>> {
        self
    }
}
