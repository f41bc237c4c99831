//! File descriptor syscalls.

use std::fs::OpenOptions;
use std::io::SeekFrom;
use std::os::unix::fs::OpenOptionsExt;

use nix::errno::Errno;

use super::fd::Descriptor;
use super::{io_errno, SyscallReturn};
use crate::callbacks::{Context, SyscallArgs};

/// Largest transfer a single `read` or `write` performs.
const MAX_TRANSFER: u32 = 1 << 20;
/// Longest accepted path.
const PATH_MAX: usize = 4096;

const O_ACCMODE: u32 = 0o3;
const O_WRONLY: u32 = 0o1;
const O_RDWR: u32 = 0o2;
const O_CREAT: u32 = 0o100;
const O_EXCL: u32 = 0o200;
const O_TRUNC: u32 = 0o1000;
const O_APPEND: u32 = 0o2000;

const SEEK_SET: u32 = 0;
const SEEK_CUR: u32 = 1;
const SEEK_END: u32 = 2;

pub(super) fn sys_read(args: &SyscallArgs, cx: &mut Context<'_>) -> Result<SyscallReturn, Errno> {
    let [fd, buf, count, ..] = args.args;
    let count = count.min(MAX_TRANSFER);
    let process = cx.process_mut();
    process.memory().check_writable(buf, count)?;
    let descriptor = process.fds_mut().get_mut(fd).ok_or(Errno::EBADF)?;
    let mut data = vec![0u8; count as usize];
    let n = descriptor.read(&mut data).map_err(|err| io_errno(&err))?;
    process.memory_mut().write(buf, &data[..n])?;
    Ok(SyscallReturn::Value(len_u32(n)))
}

pub(super) fn sys_write(args: &SyscallArgs, cx: &mut Context<'_>) -> Result<SyscallReturn, Errno> {
    let [fd, buf, count, ..] = args.args;
    let count = count.min(MAX_TRANSFER);
    let process = cx.process_mut();
    let data = process.memory().read_vec(buf, count as usize)?;
    let descriptor = process.fds_mut().get_mut(fd).ok_or(Errno::EBADF)?;
    let n = descriptor.write(&data).map_err(|err| io_errno(&err))?;
    Ok(SyscallReturn::Value(len_u32(n)))
}

pub(super) fn sys_open(args: &SyscallArgs, cx: &mut Context<'_>) -> Result<SyscallReturn, Errno> {
    let [path_addr, flags, mode, ..] = args.args;
    let process = cx.process_mut();
    let raw = process.memory().read_cstring(path_addr, PATH_MAX)?;
    let path = String::from_utf8(raw).map_err(|_| Errno::EINVAL)?;
    if path.is_empty() {
        return Err(Errno::ENOENT);
    }

    let mut options = OpenOptions::new();
    match flags & O_ACCMODE {
        O_WRONLY => options.write(true),
        O_RDWR => options.read(true).write(true),
        _ => options.read(true),
    };
    if flags & O_APPEND != 0 {
        options.append(true);
    }
    if flags & O_TRUNC != 0 {
        options.truncate(true);
    }
    if flags & O_CREAT != 0 {
        if flags & O_EXCL != 0 {
            options.create_new(true);
        } else {
            options.create(true);
        }
    }
    options.mode(mode & 0o7777);

    let file = options.open(&path).map_err(|err| io_errno(&err))?;
    log::debug!("guest opened {path}");
    let fd = process.fds_mut().add(Descriptor::File { file, path });
    Ok(SyscallReturn::Value(fd))
}

pub(super) fn sys_close(args: &SyscallArgs, cx: &mut Context<'_>) -> Result<SyscallReturn, Errno> {
    match cx.process_mut().fds_mut().remove(args.arg(0)) {
        Some(_) => Ok(SyscallReturn::Value(0)),
        None => Err(Errno::EBADF),
    }
}

#[allow(clippy::cast_possible_wrap)]
pub(super) fn sys_lseek(args: &SyscallArgs, cx: &mut Context<'_>) -> Result<SyscallReturn, Errno> {
    let [fd, offset, whence, ..] = args.args;
    let offset = i64::from(offset as i32);
    let pos = match whence {
        SEEK_SET => SeekFrom::Start(u64::try_from(offset).map_err(|_| Errno::EINVAL)?),
        SEEK_CUR => SeekFrom::Current(offset),
        SEEK_END => SeekFrom::End(offset),
        _ => return Err(Errno::EINVAL),
    };
    let descriptor = cx
        .process_mut()
        .fds_mut()
        .get_mut(fd)
        .ok_or(Errno::EBADF)?;
    let new = descriptor.seek(pos).map_err(|err| io_errno(&err))?;
    u32::try_from(new)
        .map(SyscallReturn::Value)
        .map_err(|_| Errno::EOVERFLOW)
}

pub(super) fn sys_dup(args: &SyscallArgs, cx: &mut Context<'_>) -> Result<SyscallReturn, Errno> {
    let fds = cx.process_mut().fds_mut();
    let copy = fds
        .get(args.arg(0))
        .ok_or(Errno::EBADF)?
        .try_clone()
        .map_err(|err| io_errno(&err))?;
    Ok(SyscallReturn::Value(fds.add(copy)))
}

pub(super) fn sys_dup2(args: &SyscallArgs, cx: &mut Context<'_>) -> Result<SyscallReturn, Errno> {
    let [old, new, ..] = args.args;
    let fds = cx.process_mut().fds_mut();
    let descriptor = fds.get(old).ok_or(Errno::EBADF)?;
    if old == new {
        return Ok(SyscallReturn::Value(new));
    }
    let copy = descriptor.try_clone().map_err(|err| io_errno(&err))?;
    fds.set(new, copy);
    Ok(SyscallReturn::Value(new))
}

pub(super) fn sys_ioctl(args: &SyscallArgs, cx: &mut Context<'_>) -> Result<SyscallReturn, Errno> {
    if cx.process().fds().get(args.arg(0)).is_none() {
        return Err(Errno::EBADF);
    }
    Err(Errno::ENOTTY)
}

fn len_u32(n: usize) -> u32 {
    u32::try_from(n).unwrap_or(u32::MAX)
}
