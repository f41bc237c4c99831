//! Instruction-level user-mode process simulator with callback
//! instrumentation.

/// Guest address space primitives.
pub mod memory;
pub use memory::{
    is_page_aligned, page_ceil, page_floor, AccessKind, MapEntry, MapError, MemoryFault,
    MemoryFaultKind, MemoryMap, Permissions, Segment, PAGE_SIZE,
};

/// Architectural register state.
pub mod state;
pub use state::{Register, RegisterFile, ThreadState, GENERAL_REGISTER_COUNT};

/// Opcode and encoding classification tables.
pub mod encoding;
pub use encoding::{classify_opcode, Format, Opcode, OP_CPUID, OP_RDTSC};

/// Instruction decoder.
pub mod decoder;
pub use decoder::{assemble, AluOp, Condition, DecodeError, Decoder, Instruction, Operation, Width};

/// Execution pipeline: compute effects, then commit.
pub mod execute;
pub use execute::{execute_instruction, ExecuteOutcome};

/// Guest-visible fault taxonomy.
pub mod fault;
pub use fault::{FaultClass, FaultCode, GuestFault};

/// Signal numbers, sets and dispositions.
pub mod signal;
pub use signal::{DefaultAction, SigAction, SigHandler, SigSet, Signal, SignalActions};

/// Guest trace facilities and transcripts.
pub mod trace;
pub use trace::{TraceFacility, Tracer, Transcript};

/// Disassembly service.
pub mod disasm;
pub use disasm::{render_listing, Disassembler, DisassemblyRow, LinearSweep};

/// Callback chains and the registry attached to simulators, processes and threads.
pub mod callbacks;
pub use callbacks::{
    from_fn, Callback, CallbackChain, CallbackId, Callbacks, Context, InsnArgs, ProcessArgs,
    ProcessReason, SignalArgs, SignalReason, SyscallArgs, ThreadArgs, ThreadReason, When,
};

/// Syscall dispatch table, descriptor table and default bodies.
pub mod syscall;
pub use syscall::{
    builtin, Descriptor, FdTable, MemoryFile, SyscallFn, SyscallReturn, SyscallTable,
};

/// Guest threads and the single-step engine.
pub mod thread;
pub use thread::{Thread, Tid};

/// Guest processes.
pub mod process;
pub use process::{Pid, Process, ProcessStatus};

/// Image loaders.
pub mod loader;
pub use loader::{
    FlatImageLoader, LoadError, LoadedImage, Loader, SegmentImage, StaticImageLoader,
};

/// Host-facing configuration and error types.
pub mod api;
pub use api::{ConfigError, SimError, SimulatorConfig, TraceOutput};

/// Reusable callback bundles.
pub mod adapter;
pub use adapter::{Adapter, AdapterTarget, DisablerMode, SyscallDisabler, TraceFileIo};

/// Ready-made analysis callbacks.
pub mod tools;
pub use tools::{
    DisassembleAtAddress, DisassembleAtCoreDump, ShowMapAtCoreDump, TriggerRegistry,
    UnhandledInstruction,
};

/// Host signal interception.
pub mod activation;
pub use activation::ActivationGuard;

/// Simulator facade.
pub mod simulator;
pub use simulator::Simulator;

#[cfg(test)]
use proptest as _;
#[cfg(test)]
use rstest as _;
