//! Address-space syscalls: `brk`, `mmap`, `mmap2`, `munmap`, `mprotect`.

use nix::errno::Errno;

use super::{io_errno, SyscallReturn};
use crate::callbacks::{Context, SyscallArgs};
use crate::memory::{is_page_aligned, page_ceil, Permissions, Segment, PAGE_SIZE};
use crate::process::Process;
use crate::trace::TraceFacility;

const MAP_SHARED: u32 = 0x01;
const MAP_PRIVATE: u32 = 0x02;
const MAP_FIXED: u32 = 0x10;
const MAP_ANONYMOUS: u32 = 0x20;

pub(super) fn sys_brk(args: &SyscallArgs, cx: &mut Context<'_>) -> Result<SyscallReturn, Errno> {
    Ok(SyscallReturn::Value(cx.process_mut().set_brk(args.arg(0))))
}

pub(super) fn sys_mmap(args: &SyscallArgs, cx: &mut Context<'_>) -> Result<SyscallReturn, Errno> {
    let block = args.arg(0);
    let memory = cx.process().memory();
    let mut fields = [0u32; 6];
    for (index, field) in (0u32..).zip(fields.iter_mut()) {
        *field = memory.read_u32(block.wrapping_add(index * 4))?;
    }
    let [addr, len, prot, flags, fd, offset] = fields;
    if !is_page_aligned(offset) {
        return Err(Errno::EINVAL);
    }
    map_region(
        cx.process_mut(),
        MapRequest {
            addr,
            len,
            prot,
            flags,
            fd,
            offset: u64::from(offset),
        },
    )
}

pub(super) fn sys_mmap2(args: &SyscallArgs, cx: &mut Context<'_>) -> Result<SyscallReturn, Errno> {
    let [addr, len, prot, flags, fd, pgoff] = args.args;
    map_region(
        cx.process_mut(),
        MapRequest {
            addr,
            len,
            prot,
            flags,
            fd,
            offset: u64::from(pgoff) * u64::from(PAGE_SIZE),
        },
    )
}

struct MapRequest {
    addr: u32,
    len: u32,
    prot: u32,
    flags: u32,
    fd: u32,
    offset: u64,
}

/// Top of the range mappings may occupy: the stack floor, or the whole
/// 32-bit space when the image brought its own stack.
fn mapping_ceiling(process: &Process) -> u64 {
    match process.stack_floor() {
        u32::MAX => 1 << 32,
        floor => u64::from(floor),
    }
}

fn map_region(process: &mut Process, request: MapRequest) -> Result<SyscallReturn, Errno> {
    if request.len == 0 || request.flags & (MAP_SHARED | MAP_PRIVATE) == 0 {
        return Err(Errno::EINVAL);
    }
    let len = page_ceil(request.len).ok_or(Errno::ENOMEM)?;
    let perms = Permissions::from_prot(request.prot);

    // The range is placed before any host memory is committed to it.
    let ceiling = mapping_ceiling(process);
    let fixed = request.flags & MAP_FIXED != 0;
    let addr = if fixed {
        if !is_page_aligned(request.addr) {
            return Err(Errno::EINVAL);
        }
        if u64::from(request.addr) + u64::from(len) > ceiling {
            return Err(Errno::ENOMEM);
        }
        request.addr
    } else {
        let hint = if request.addr == 0 {
            process.mmap_base()
        } else {
            request.addr
        };
        process
            .memory()
            .find_free(len, hint, ceiling)
            .or_else(|| process.memory().find_free(len, process.mmap_base(), ceiling))
            .ok_or(Errno::ENOMEM)?
    };

    let (mut data, name) = if request.flags & MAP_ANONYMOUS != 0 {
        (Vec::new(), "[anon]".to_string())
    } else {
        let descriptor = process.fds().get(request.fd).ok_or(Errno::EBADF)?;
        let data = descriptor
            .read_at(request.offset, len as usize)
            .map_err(|err| io_errno(&err))?;
        (data, descriptor.describe())
    };
    data.resize(len as usize, 0);

    let segment = Segment::new(addr, data, perms, name);
    let result = if fixed {
        process.memory_mut().map_replace(segment)
    } else {
        process.memory_mut().map(segment)
    };
    result.map_err(|_| Errno::ENOMEM)?;
    process.tracer().emit(TraceFacility::MMAP, || {
        format!("mmap 0x{addr:08x} + 0x{len:x} {perms}")
    });
    Ok(SyscallReturn::Value(addr))
}

pub(super) fn sys_munmap(args: &SyscallArgs, cx: &mut Context<'_>) -> Result<SyscallReturn, Errno> {
    let [addr, len, ..] = args.args;
    if !is_page_aligned(addr) || len == 0 {
        return Err(Errno::EINVAL);
    }
    let len = page_ceil(len).ok_or(Errno::EINVAL)?;
    let process = cx.process_mut();
    process.memory_mut().unmap(addr, len);
    process
        .tracer()
        .emit(TraceFacility::MMAP, || format!("munmap 0x{addr:08x} + 0x{len:x}"));
    Ok(SyscallReturn::Value(0))
}

pub(super) fn sys_mprotect(
    args: &SyscallArgs,
    cx: &mut Context<'_>,
) -> Result<SyscallReturn, Errno> {
    let [addr, len, prot, ..] = args.args;
    if !is_page_aligned(addr) {
        return Err(Errno::EINVAL);
    }
    let len = page_ceil(len).ok_or(Errno::EINVAL)?;
    if len == 0 {
        return Ok(SyscallReturn::Value(0));
    }
    let perms = Permissions::from_prot(prot);
    let process = cx.process_mut();
    process
        .memory_mut()
        .protect(addr, len, perms)
        .map_err(|_| Errno::ENOMEM)?;
    process.tracer().emit(TraceFacility::MMAP, || {
        format!("mprotect 0x{addr:08x} + 0x{len:x} {perms}")
    });
    Ok(SyscallReturn::Value(0))
}
