//! System-call dispatch. Register ABI: a7 carries the number, a0..a6 the
//! arguments, a0 the return value; errors are the negative integers of
//! `KernelError`. The trap path has already stepped sepc past the ecall.

use alloc::string::{String, ToString};
use alloc::vec::Vec;

use crate::arch::{ContextFrame, ContextFrameTrait};
use crate::io::{Io, IoCtl, IoRef};
use crate::kernel::error::sysret;
use crate::kernel::process::{
    current_process, process_exec, process_exit, process_fork, Process, PROCESS_IOMAX,
};
use crate::kernel::thread::thread_join;
use crate::kernel::{alarm, KernelError, KernelResult};
use crate::mm::{validate_vptr, validate_vstr, PteFlags};

pub const SYS_EXIT: usize = 0;
pub const SYS_EXEC: usize = 1;
pub const SYS_FORK: usize = 2;
pub const SYS_WAIT: usize = 3;
pub const SYS_PRINT: usize = 4;
pub const SYS_USLEEP: usize = 5;
pub const SYS_DEVOPEN: usize = 6;
pub const SYS_FSOPEN: usize = 7;
pub const SYS_FSCREATE: usize = 8;
pub const SYS_FSDELETE: usize = 9;
pub const SYS_CLOSE: usize = 10;
pub const SYS_READ: usize = 11;
pub const SYS_WRITE: usize = 12;
pub const SYS_IOCTL: usize = 13;
pub const SYS_PIPE: usize = 14;
pub const SYS_IODUP: usize = 15;

const FD_ANY: usize = usize::MAX;

pub fn syscall_handler(ctx: &mut ContextFrame) {
    let num = ctx.syscall_number();
    let result = match num {
        SYS_EXIT => process_exit(),
        SYS_EXEC => sys_exec(ctx),
        SYS_FORK => process_fork(ctx),
        SYS_WAIT => thread_join(ctx.syscall_arg(0)),
        SYS_PRINT => sys_print(ctx.syscall_arg(0)),
        SYS_USLEEP => sys_usleep(ctx.syscall_arg(0)),
        SYS_DEVOPEN => sys_devopen(ctx.syscall_arg(0), ctx.syscall_arg(1), ctx.syscall_arg(2)),
        SYS_FSOPEN => sys_fsopen(ctx.syscall_arg(0), ctx.syscall_arg(1)),
        SYS_FSCREATE => sys_fscreate(ctx.syscall_arg(0)),
        SYS_FSDELETE => sys_fsdelete(ctx.syscall_arg(0)),
        SYS_CLOSE => sys_close(ctx.syscall_arg(0)),
        SYS_READ => sys_read(ctx.syscall_arg(0), ctx.syscall_arg(1), ctx.syscall_arg(2)),
        SYS_WRITE => sys_write(ctx.syscall_arg(0), ctx.syscall_arg(1), ctx.syscall_arg(2)),
        SYS_IOCTL => sys_ioctl(ctx.syscall_arg(0), ctx.syscall_arg(1), ctx.syscall_arg(2)),
        SYS_PIPE => sys_pipe(ctx.syscall_arg(0), ctx.syscall_arg(1)),
        SYS_IODUP => sys_iodup(ctx.syscall_arg(0), ctx.syscall_arg(1)),
        _ => Err(KernelError::NotSupported),
    };
    ctx.set_syscall_ret(sysret(result));
}

// user-memory accessors; every dereference is preceded by a page-table walk

fn user_str(vp: usize) -> KernelResult<&'static str> {
    let len = validate_vstr(vp, PteFlags::USER | PteFlags::READ)?;
    let bytes = unsafe { core::slice::from_raw_parts(vp as *const u8, len) };
    core::str::from_utf8(bytes).map_err(|_| KernelError::InvalidArg)
}

fn user_slice<'a>(vp: usize, len: usize) -> KernelResult<&'a [u8]> {
    if (len as isize) < 0 {
        return Err(KernelError::InvalidArg);
    }
    validate_vptr(vp, len, PteFlags::USER | PteFlags::READ)?;
    Ok(unsafe { core::slice::from_raw_parts(vp as *const u8, len) })
}

fn user_slice_mut<'a>(vp: usize, len: usize) -> KernelResult<&'a mut [u8]> {
    if (len as isize) < 0 {
        return Err(KernelError::InvalidArg);
    }
    validate_vptr(vp, len, PteFlags::USER | PteFlags::WRITE)?;
    Ok(unsafe { core::slice::from_raw_parts_mut(vp as *mut u8, len) })
}

fn user_read_u64(vp: usize) -> KernelResult<u64> {
    validate_vptr(vp, 8, PteFlags::USER | PteFlags::READ)?;
    Ok(unsafe { (vp as *const u64).read_unaligned() })
}

fn user_write_u64(vp: usize, val: u64) -> KernelResult {
    validate_vptr(vp, 8, PteFlags::USER | PteFlags::WRITE)?;
    unsafe { (vp as *mut u64).write_unaligned(val) };
    Ok(())
}

// fd-table plumbing

fn fd_get(proc: &Process, fd: usize) -> KernelResult<IoRef> {
    proc.iotab
        .get(fd)
        .and_then(|slot| slot.clone())
        .ok_or(KernelError::BadFd)
}

/// Install `io` at `fd`, or at the lowest free slot when `fd` is -1.
fn fd_claim(proc: &mut Process, fd: usize, io: IoRef) -> KernelResult<usize> {
    let fd = if fd == FD_ANY {
        proc.iotab
            .iter()
            .position(|slot| slot.is_none())
            .ok_or(KernelError::TooManyFiles)?
    } else {
        if fd >= PROCESS_IOMAX {
            return Err(KernelError::BadFd);
        }
        if proc.iotab[fd].is_some() {
            return Err(KernelError::Busy);
        }
        fd
    };
    proc.iotab[fd] = Some(io);
    Ok(fd)
}

fn sys_exec(ctx: &mut ContextFrame) -> KernelResult<usize> {
    let proc = current_process()?;
    let exe = fd_get(proc, ctx.syscall_arg(0))?;
    let argc = ctx.syscall_arg(1);
    let argv_ptr = ctx.syscall_arg(2);
    if argc > 64 {
        return Err(KernelError::InvalidArg);
    }

    // copy the argument strings out before the address space is rebuilt
    let mut argv: Vec<String> = Vec::with_capacity(argc);
    validate_vptr(argv_ptr, argc * 8, PteFlags::USER | PteFlags::READ)?;
    for i in 0..argc {
        let str_ptr = unsafe { ((argv_ptr as *const u64).add(i)).read_unaligned() } as usize;
        argv.push(user_str(str_ptr)?.to_string());
    }

    process_exec(exe, &argv)?;
    unreachable!("process_exec returned without error");
}

fn sys_print(msg: usize) -> KernelResult<usize> {
    let msg = user_str(msg)?;
    print!("{}", msg);
    Ok(0)
}

fn sys_usleep(us: usize) -> KernelResult<usize> {
    let mut alarm = alarm::Alarm::new("usleep");
    alarm.sleep_us(us as u64);
    Ok(0)
}

fn sys_devopen(fd: usize, name: usize, instno: usize) -> KernelResult<usize> {
    let name = user_str(name)?;
    let io = crate::device::open_device(name, instno)?;
    fd_claim(current_process()?, fd, io)
}

fn sys_fsopen(fd: usize, name: usize) -> KernelResult<usize> {
    let name = user_str(name)?;
    let io = crate::fs::ktfs::fs_open(name)?;
    fd_claim(current_process()?, fd, io)
}

fn sys_fscreate(name: usize) -> KernelResult<usize> {
    crate::fs::ktfs::fs_create(user_str(name)?).map(|_| 0)
}

fn sys_fsdelete(name: usize) -> KernelResult<usize> {
    crate::fs::ktfs::fs_delete(user_str(name)?).map(|_| 0)
}

fn sys_close(fd: usize) -> KernelResult<usize> {
    let proc = current_process()?;
    if fd >= PROCESS_IOMAX {
        return Err(KernelError::BadFd);
    }
    match proc.iotab[fd].take() {
        Some(io) => {
            drop(io);
            Ok(0)
        }
        None => Err(KernelError::BadFd),
    }
}

fn sys_read(fd: usize, buf: usize, len: usize) -> KernelResult<usize> {
    let io = fd_get(current_process()?, fd)?;
    let buf = user_slice_mut(buf, len)?;
    io.read(buf)
}

fn sys_write(fd: usize, buf: usize, len: usize) -> KernelResult<usize> {
    let io = fd_get(current_process()?, fd)?;
    let buf = user_slice(buf, len)?;
    io.write(buf)
}

fn sys_ioctl(fd: usize, cmd: usize, arg: usize) -> KernelResult<usize> {
    let io = fd_get(current_process()?, fd)?;
    match cmd {
        IoCtl::CMD_GETBLKSZ => user_write_u64(arg, io.cntl(IoCtl::GetBlkSz)?),
        IoCtl::CMD_GETPOS => user_write_u64(arg, io.cntl(IoCtl::GetPos)?),
        IoCtl::CMD_SETPOS => io.cntl(IoCtl::SetPos(user_read_u64(arg)?)).map(|_| ()),
        IoCtl::CMD_GETEND => user_write_u64(arg, io.cntl(IoCtl::GetEnd)?),
        IoCtl::CMD_SETEND => io.cntl(IoCtl::SetEnd(user_read_u64(arg)?)).map(|_| ()),
        _ => Err(KernelError::NotSupported),
    }
    .map(|_| 0)
}

fn sys_pipe(wfd_ptr: usize, rfd_ptr: usize) -> KernelResult<usize> {
    let want_w = user_read_u64(wfd_ptr)? as i64;
    let want_r = user_read_u64(rfd_ptr)? as i64;
    if want_w >= 0 && want_w == want_r {
        return Err(KernelError::InvalidArg);
    }

    let proc = current_process()?;
    let (writer, reader) = crate::io::pipe_new()?;
    let wfd = fd_claim(proc, want_w as usize, writer)?;
    let rfd = match fd_claim(proc, want_r as usize, reader) {
        Ok(rfd) => rfd,
        Err(err) => {
            proc.iotab[wfd] = None;
            return Err(err);
        }
    };
    user_write_u64(wfd_ptr, wfd as u64)?;
    user_write_u64(rfd_ptr, rfd as u64)?;
    Ok(0)
}

fn sys_iodup(oldfd: usize, newfd: usize) -> KernelResult<usize> {
    let proc = current_process()?;
    let io = fd_get(proc, oldfd)?;
    let newfd = if newfd == FD_ANY {
        proc.iotab
            .iter()
            .position(|slot| slot.is_none())
            .ok_or(KernelError::TooManyFiles)?
    } else {
        if newfd >= PROCESS_IOMAX {
            return Err(KernelError::BadFd);
        }
        // an occupied target closes first
        proc.iotab[newfd] = None;
        newfd
    };
    proc.iotab[newfd] = Some(io);
    Ok(newfd)
}
