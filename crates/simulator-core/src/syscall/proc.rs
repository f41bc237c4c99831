//! Process, thread and time syscalls.

use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use nix::errno::Errno;
use nix::unistd;

use super::SyscallReturn;
use crate::callbacks::{Context, ProcessReason, SyscallArgs};
use crate::state::Register;

const CLONE_VM: u32 = 0x0000_0100;
const CLONE_THREAD: u32 = 0x0001_0000;

/// Length of each `struct utsname` field.
const UTS_FIELD: usize = 65;
const UTS_FIELDS: [&str; 6] = ["Linux", "gx32", "4.19.0-usersim", "#1", "gx32", "(none)"];

#[allow(clippy::cast_possible_truncation)]
pub(super) fn sys_exit(args: &SyscallArgs, cx: &mut Context<'_>) -> Result<SyscallReturn, Errno> {
    cx.process_mut().exit_thread(args.tid, args.arg(0) as u8);
    Ok(SyscallReturn::Untouched)
}

#[allow(clippy::cast_possible_truncation)]
pub(super) fn sys_exit_group(
    args: &SyscallArgs,
    cx: &mut Context<'_>,
) -> Result<SyscallReturn, Errno> {
    cx.process_mut().exit_group(args.arg(0) as u8);
    Ok(SyscallReturn::Untouched)
}

pub(super) fn sys_fork(_args: &SyscallArgs, cx: &mut Context<'_>) -> Result<SyscallReturn, Errno> {
    cx.process_mut()
        .fire_process_event(ProcessReason::Fork, None);
    Err(Errno::ENOSYS)
}

pub(super) fn sys_execve(
    _args: &SyscallArgs,
    cx: &mut Context<'_>,
) -> Result<SyscallReturn, Errno> {
    cx.process_mut()
        .fire_process_event(ProcessReason::Exec, None);
    Err(Errno::ENOSYS)
}

pub(super) fn sys_clone(args: &SyscallArgs, cx: &mut Context<'_>) -> Result<SyscallReturn, Errno> {
    let [flags, child_stack, ..] = args.args;
    if flags & (CLONE_VM | CLONE_THREAD) != (CLONE_VM | CLONE_THREAD) {
        cx.process_mut()
            .fire_process_event(ProcessReason::Fork, None);
        return Err(Errno::ENOSYS);
    }
    let process = cx.process_mut();
    let mut regs = *process.thread(args.tid).ok_or(Errno::ESRCH)?.regs();
    regs.set(Register::R0, 0);
    if child_stack != 0 {
        regs.set_sp(child_stack);
    }
    let tid = process.spawn_thread(regs);
    Ok(SyscallReturn::Value(tid))
}

pub(super) fn sys_getpid(
    _args: &SyscallArgs,
    cx: &mut Context<'_>,
) -> Result<SyscallReturn, Errno> {
    Ok(SyscallReturn::Value(cx.process().pid()))
}

#[allow(clippy::cast_sign_loss)]
pub(super) fn sys_getppid(
    _args: &SyscallArgs,
    _cx: &mut Context<'_>,
) -> Result<SyscallReturn, Errno> {
    Ok(SyscallReturn::Value(unistd::getppid().as_raw() as u32))
}

pub(super) fn sys_gettid(
    args: &SyscallArgs,
    _cx: &mut Context<'_>,
) -> Result<SyscallReturn, Errno> {
    Ok(SyscallReturn::Value(args.tid))
}

pub(super) fn sys_getuid(
    _args: &SyscallArgs,
    _cx: &mut Context<'_>,
) -> Result<SyscallReturn, Errno> {
    Ok(SyscallReturn::Value(unistd::getuid().as_raw()))
}

pub(super) fn sys_getgid(
    _args: &SyscallArgs,
    _cx: &mut Context<'_>,
) -> Result<SyscallReturn, Errno> {
    Ok(SyscallReturn::Value(unistd::getgid().as_raw()))
}

pub(super) fn sys_geteuid(
    _args: &SyscallArgs,
    _cx: &mut Context<'_>,
) -> Result<SyscallReturn, Errno> {
    Ok(SyscallReturn::Value(unistd::geteuid().as_raw()))
}

pub(super) fn sys_getegid(
    _args: &SyscallArgs,
    _cx: &mut Context<'_>,
) -> Result<SyscallReturn, Errno> {
    Ok(SyscallReturn::Value(unistd::getegid().as_raw()))
}

pub(super) fn sys_sched_yield(
    args: &SyscallArgs,
    cx: &mut Context<'_>,
) -> Result<SyscallReturn, Errno> {
    if let Some(thread) = cx.process_mut().thread_mut(args.tid) {
        thread.request_yield();
    }
    Ok(SyscallReturn::Value(0))
}

pub(super) fn sys_nanosleep(
    args: &SyscallArgs,
    cx: &mut Context<'_>,
) -> Result<SyscallReturn, Errno> {
    let [request, remaining, ..] = args.args;
    let memory = cx.process().memory();
    let secs = memory.read_u32(request)?;
    let nanos = memory.read_u32(request.wrapping_add(4))?;
    if nanos >= 1_000_000_000 {
        return Err(Errno::EINVAL);
    }
    thread::sleep(Duration::new(u64::from(secs), nanos));
    if remaining != 0 {
        let memory = cx.process_mut().memory_mut();
        memory.write_u32(remaining, 0)?;
        memory.write_u32(remaining.wrapping_add(4), 0)?;
    }
    Ok(SyscallReturn::Value(0))
}

fn now() -> Duration {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
}

#[allow(clippy::cast_possible_truncation)]
pub(super) fn sys_time(args: &SyscallArgs, cx: &mut Context<'_>) -> Result<SyscallReturn, Errno> {
    let secs = now().as_secs() as u32;
    let out = args.arg(0);
    if out != 0 {
        cx.process_mut().memory_mut().write_u32(out, secs)?;
    }
    Ok(SyscallReturn::Value(secs))
}

#[allow(clippy::cast_possible_truncation)]
pub(super) fn sys_gettimeofday(
    args: &SyscallArgs,
    cx: &mut Context<'_>,
) -> Result<SyscallReturn, Errno> {
    let [tv, tz, ..] = args.args;
    let elapsed = now();
    let memory = cx.process_mut().memory_mut();
    if tv != 0 {
        memory.write_u32(tv, elapsed.as_secs() as u32)?;
        memory.write_u32(tv.wrapping_add(4), elapsed.subsec_micros())?;
    }
    if tz != 0 {
        memory.write(tz, &[0u8; 8])?;
    }
    Ok(SyscallReturn::Value(0))
}

pub(super) fn sys_uname(args: &SyscallArgs, cx: &mut Context<'_>) -> Result<SyscallReturn, Errno> {
    let mut buf = vec![0u8; UTS_FIELD * UTS_FIELDS.len()];
    for (slot, value) in buf.chunks_mut(UTS_FIELD).zip(UTS_FIELDS) {
        slot[..value.len()].copy_from_slice(value.as_bytes());
    }
    cx.process_mut().memory_mut().write(args.arg(0), &buf)?;
    Ok(SyscallReturn::Value(0))
}
