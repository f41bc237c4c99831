//! Signal syscalls.

use nix::errno::Errno;

use super::SyscallReturn;
use crate::callbacks::{Context, SyscallArgs};
use crate::memory::MemoryMap;
use crate::signal::{SigAction, SigHandler, SigSet, Signal};

/// Size of the guest `sigset_t` the kernel-facing calls accept.
const SIGSET_SIZE: u32 = 8;

const SIG_BLOCK: u32 = 0;
const SIG_UNBLOCK: u32 = 1;
const SIG_SETMASK: u32 = 2;

fn read_sigset(memory: &MemoryMap, addr: u32) -> Result<SigSet, Errno> {
    let low = memory.read_u32(addr)?;
    let high = memory.read_u32(addr.wrapping_add(4))?;
    Ok(SigSet::from_bits((u64::from(high) << 32) | u64::from(low)))
}

fn write_sigset(memory: &mut MemoryMap, addr: u32, set: SigSet) -> Result<(), Errno> {
    memory.write(addr, &set.bits().to_le_bytes())?;
    Ok(())
}

fn signal_arg(raw: u32) -> Result<Option<Signal>, Errno> {
    if raw == 0 {
        Ok(None)
    } else {
        Signal::new(raw).map(Some).ok_or(Errno::EINVAL)
    }
}

pub(super) fn sys_kill(args: &SyscallArgs, cx: &mut Context<'_>) -> Result<SyscallReturn, Errno> {
    let [pid, signo, ..] = args.args;
    let process = cx.process_mut();
    // 0 and -1 address the caller's own process group and every process.
    if pid != process.pid() && pid != 0 && pid != u32::MAX {
        return Err(Errno::ESRCH);
    }
    if let Some(signal) = signal_arg(signo)? {
        process.post_signal(signal);
    }
    Ok(SyscallReturn::Value(0))
}

pub(super) fn sys_tkill(args: &SyscallArgs, cx: &mut Context<'_>) -> Result<SyscallReturn, Errno> {
    let [tid, signo, ..] = args.args;
    let signal = signal_arg(signo)?;
    let process = cx.process_mut();
    if !process.thread(tid).is_some_and(|thread| thread.is_live()) {
        return Err(Errno::ESRCH);
    }
    if let Some(signal) = signal {
        process.post_thread_signal(tid, signal);
    }
    Ok(SyscallReturn::Value(0))
}

pub(super) fn sys_sigreturn(
    args: &SyscallArgs,
    cx: &mut Context<'_>,
) -> Result<SyscallReturn, Errno> {
    let process = cx.process_mut();
    if !process.sigreturn(args.tid) {
        process.force_signal(args.tid, Signal::SIGSEGV);
    }
    Ok(SyscallReturn::Untouched)
}

pub(super) fn sys_rt_sigaction(
    args: &SyscallArgs,
    cx: &mut Context<'_>,
) -> Result<SyscallReturn, Errno> {
    let [signo, act, oldact, size, ..] = args.args;
    if size != SIGSET_SIZE {
        return Err(Errno::EINVAL);
    }
    let signal = Signal::new(signo).ok_or(Errno::EINVAL)?;
    let process = cx.process_mut();

    let new = if act == 0 {
        None
    } else {
        if signal.is_uncatchable() {
            return Err(Errno::EINVAL);
        }
        let memory = process.memory();
        Some(SigAction {
            handler: SigHandler::from_raw(memory.read_u32(act)?),
            flags: memory.read_u32(act.wrapping_add(4))?,
            restorer: memory.read_u32(act.wrapping_add(8))?,
            mask: read_sigset(memory, act.wrapping_add(12))?.without_uncatchable(),
        })
    };

    if oldact != 0 {
        let old = process.sigaction(signal);
        let memory = process.memory_mut();
        memory.write_u32(oldact, old.handler.to_raw())?;
        memory.write_u32(oldact.wrapping_add(4), old.flags)?;
        memory.write_u32(oldact.wrapping_add(8), old.restorer)?;
        write_sigset(memory, oldact.wrapping_add(12), old.mask)?;
    }
    if let Some(action) = new {
        process.set_sigaction(signal, action);
    }
    Ok(SyscallReturn::Value(0))
}

pub(super) fn sys_rt_sigprocmask(
    args: &SyscallArgs,
    cx: &mut Context<'_>,
) -> Result<SyscallReturn, Errno> {
    let [how, set, oldset, size, ..] = args.args;
    if size != SIGSET_SIZE {
        return Err(Errno::EINVAL);
    }
    let process = cx.process_mut();
    let current = process.thread(args.tid).ok_or(Errno::ESRCH)?.sigmask();
    let requested = if set == 0 {
        None
    } else {
        Some(read_sigset(process.memory(), set)?)
    };
    if oldset != 0 {
        write_sigset(process.memory_mut(), oldset, current)?;
    }
    if let Some(requested) = requested {
        let mask = match how {
            SIG_BLOCK => current.union(requested),
            SIG_UNBLOCK => current.difference(requested),
            SIG_SETMASK => requested,
            _ => return Err(Errno::EINVAL),
        };
        if let Some(thread) = process.thread_mut(args.tid) {
            thread.set_sigmask(mask);
        }
    }
    Ok(SyscallReturn::Value(0))
}

pub(super) fn sys_rt_sigpending(
    args: &SyscallArgs,
    cx: &mut Context<'_>,
) -> Result<SyscallReturn, Errno> {
    let [set, size, ..] = args.args;
    if size != SIGSET_SIZE {
        return Err(Errno::EINVAL);
    }
    let process = cx.process_mut();
    let pending = process.thread(args.tid).ok_or(Errno::ESRCH)?.pending();
    write_sigset(process.memory_mut(), set, pending)?;
    Ok(SyscallReturn::Value(0))
}
