//! System call dispatch, the shared syscall table and the default bodies.
//!
//! The guest passes the syscall number in `r0` and up to six arguments in
//! `r1..r6`; the result comes back in `r0`, negative errno on failure.

mod fd;
mod file;
mod mman;
mod proc;
mod signal;
mod table;

use std::io;
use std::sync::Arc;

use nix::errno::Errno;

pub use fd::{Descriptor, FdTable, MemoryFile};
pub use table::SyscallTable;

use crate::callbacks::{invoke, Callback, Context, SyscallArgs, When};
use crate::process::Process;
use crate::state::{Register, ThreadState};
use crate::thread::Tid;
use crate::trace::TraceFacility;

/// i386 Linux syscall numbers.
#[allow(missing_docs)]
pub mod nr {
    pub const EXIT: u32 = 1;
    pub const FORK: u32 = 2;
    pub const READ: u32 = 3;
    pub const WRITE: u32 = 4;
    pub const OPEN: u32 = 5;
    pub const CLOSE: u32 = 6;
    pub const EXECVE: u32 = 11;
    pub const TIME: u32 = 13;
    pub const LSEEK: u32 = 19;
    pub const GETPID: u32 = 20;
    pub const GETUID: u32 = 24;
    pub const KILL: u32 = 37;
    pub const DUP: u32 = 41;
    pub const BRK: u32 = 45;
    pub const GETGID: u32 = 47;
    pub const GETEUID: u32 = 49;
    pub const GETEGID: u32 = 50;
    pub const IOCTL: u32 = 54;
    pub const DUP2: u32 = 63;
    pub const GETPPID: u32 = 64;
    pub const GETTIMEOFDAY: u32 = 78;
    pub const MMAP: u32 = 90;
    pub const MUNMAP: u32 = 91;
    pub const SIGRETURN: u32 = 119;
    pub const CLONE: u32 = 120;
    pub const UNAME: u32 = 122;
    pub const MPROTECT: u32 = 125;
    pub const SCHED_YIELD: u32 = 158;
    pub const NANOSLEEP: u32 = 162;
    pub const RT_SIGRETURN: u32 = 173;
    pub const RT_SIGACTION: u32 = 174;
    pub const RT_SIGPROCMASK: u32 = 175;
    pub const RT_SIGPENDING: u32 = 176;
    pub const VFORK: u32 = 190;
    pub const MMAP2: u32 = 192;
    pub const GETUID32: u32 = 199;
    pub const GETGID32: u32 = 200;
    pub const GETEUID32: u32 = 201;
    pub const GETEGID32: u32 = 202;
    pub const GETTID: u32 = 224;
    pub const TKILL: u32 = 238;
    pub const EXIT_GROUP: u32 = 252;
}

/// What a builtin body wants written to `r0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyscallReturn {
    /// Store this value.
    Value(u32),
    /// Leave the registers alone (exit, sigreturn).
    Untouched,
}

/// Signature of a builtin syscall body.
pub type SyscallFn = fn(&SyscallArgs, &mut Context<'_>) -> Result<SyscallReturn, Errno>;

/// Encodes `errno` the way the guest expects it in `r0`.
#[must_use]
pub const fn errno_return(errno: Errno) -> u32 {
    0u32.wrapping_sub(errno as u32)
}

/// Decodes an `r0` value into a result, treating `-4095..=-1` as errors.
#[must_use]
#[allow(clippy::cast_possible_wrap)]
pub fn decode_return(value: u32) -> Result<u32, Errno> {
    if value > 0u32.wrapping_sub(4096) {
        Err(Errno::from_raw(0u32.wrapping_sub(value) as i32))
    } else {
        Ok(value)
    }
}

pub(crate) fn io_errno(err: &io::Error) -> Errno {
    err.raw_os_error().map_or(Errno::EIO, Errno::from_raw)
}

struct Builtin {
    body: SyscallFn,
}

impl Callback<SyscallArgs> for Builtin {
    fn call(&self, enabled: bool, args: &SyscallArgs, cx: &mut Context<'_>) -> bool {
        if !enabled {
            return false;
        }
        let value = match (self.body)(args, cx) {
            Ok(SyscallReturn::Value(value)) => value,
            Ok(SyscallReturn::Untouched) => return true,
            Err(errno) => errno_return(errno),
        };
        if let Some(thread) = cx.thread_mut() {
            thread.set_syscall_return(value);
        }
        true
    }

    fn duplicate(self: Arc<Self>) -> Arc<dyn Callback<SyscallArgs>> {
        self
    }
}

/// Wraps a plain function as a stateless syscall body. The body only runs
/// while the chain is still enabled.
#[must_use]
pub fn builtin(body: SyscallFn) -> Arc<dyn Callback<SyscallArgs>> {
    Arc::new(Builtin { body })
}

const DEFAULT_BODIES: &[(u32, &str, SyscallFn)] = &[
    (nr::EXIT, "exit", proc::sys_exit),
    (nr::FORK, "fork", proc::sys_fork),
    (nr::READ, "read", file::sys_read),
    (nr::WRITE, "write", file::sys_write),
    (nr::OPEN, "open", file::sys_open),
    (nr::CLOSE, "close", file::sys_close),
    (nr::EXECVE, "execve", proc::sys_execve),
    (nr::TIME, "time", proc::sys_time),
    (nr::LSEEK, "lseek", file::sys_lseek),
    (nr::GETPID, "getpid", proc::sys_getpid),
    (nr::GETUID, "getuid", proc::sys_getuid),
    (nr::KILL, "kill", signal::sys_kill),
    (nr::DUP, "dup", file::sys_dup),
    (nr::BRK, "brk", mman::sys_brk),
    (nr::GETGID, "getgid", proc::sys_getgid),
    (nr::GETEUID, "geteuid", proc::sys_geteuid),
    (nr::GETEGID, "getegid", proc::sys_getegid),
    (nr::IOCTL, "ioctl", file::sys_ioctl),
    (nr::DUP2, "dup2", file::sys_dup2),
    (nr::GETPPID, "getppid", proc::sys_getppid),
    (nr::GETTIMEOFDAY, "gettimeofday", proc::sys_gettimeofday),
    (nr::MMAP, "mmap", mman::sys_mmap),
    (nr::MUNMAP, "munmap", mman::sys_munmap),
    (nr::SIGRETURN, "sigreturn", signal::sys_sigreturn),
    (nr::CLONE, "clone", proc::sys_clone),
    (nr::UNAME, "uname", proc::sys_uname),
    (nr::MPROTECT, "mprotect", mman::sys_mprotect),
    (nr::SCHED_YIELD, "sched_yield", proc::sys_sched_yield),
    (nr::NANOSLEEP, "nanosleep", proc::sys_nanosleep),
    (nr::RT_SIGRETURN, "rt_sigreturn", signal::sys_sigreturn),
    (nr::RT_SIGACTION, "rt_sigaction", signal::sys_rt_sigaction),
    (nr::RT_SIGPROCMASK, "rt_sigprocmask", signal::sys_rt_sigprocmask),
    (nr::RT_SIGPENDING, "rt_sigpending", signal::sys_rt_sigpending),
    (nr::VFORK, "vfork", proc::sys_fork),
    (nr::MMAP2, "mmap2", mman::sys_mmap2),
    (nr::GETUID32, "getuid32", proc::sys_getuid),
    (nr::GETGID32, "getgid32", proc::sys_getgid),
    (nr::GETEUID32, "geteuid32", proc::sys_geteuid),
    (nr::GETEGID32, "getegid32", proc::sys_getegid),
    (nr::GETTID, "gettid", proc::sys_gettid),
    (nr::TKILL, "tkill", signal::sys_tkill),
    (nr::EXIT_GROUP, "exit_group", proc::sys_exit_group),
];

impl SyscallTable {
    /// Table populated with the default Linux bodies.
    #[must_use]
    pub fn linux() -> Self {
        let table = Self::new();
        for &(number, name, body) in DEFAULT_BODIES {
            table.define(number, name, builtin(body));
        }
        table
    }
}

/// Handles a `syscall` instruction that just retired on `tid`.
pub(crate) fn dispatch(process: &mut Process, tid: Tid) {
    let args = match process.thread_mut(tid) {
        Some(thread) => {
            thread.set_state(ThreadState::InSyscall);
            thread.syscall_args()
        }
        None => return,
    };
    let table = Arc::clone(process.syscall_table());

    let enabled = process.run_thread_chain(tid, When::Before, true, &args);
    if enabled {
        match table.snapshot(args.callno) {
            Some(body) if !body.is_empty() => {
                invoke(&body, true, &args, &mut Context::new(process, Some(tid)));
            }
            _ => {
                log::debug!("thread {tid}: unknown syscall {}", args.callno);
                if let Some(thread) = process.thread_mut(tid) {
                    thread.set_syscall_return(errno_return(Errno::ENOSYS));
                }
            }
        }
    }
    process.run_thread_chain(tid, When::After, enabled, &args);

    let result = process.thread_mut(tid).map(|thread| {
        if thread.state() == ThreadState::InSyscall {
            thread.set_state(ThreadState::Runnable);
        }
        thread.regs().get(Register::R0)
    });
    if process.tracer().enabled(TraceFacility::SYSCALL) {
        let name = table
            .name(args.callno)
            .unwrap_or_else(|| format!("syscall_{}", args.callno));
        let shown = if enabled {
            result.map_or_else(|| "?".to_string(), |value| format!("{value:#x}"))
        } else {
            "<suppressed>".to_string()
        };
        process.tracer().emit(TraceFacility::SYSCALL, || {
            format!(
                "[{tid}] {name}({:#x}, {:#x}, {:#x}) = {shown}",
                args.args[0], args.args[1], args.args[2]
            )
        });
    }
}
