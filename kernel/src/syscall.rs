//! Syscall dispatch and user-memory validation.
//!
//! The trap handler lands here for every `ecall` from U-mode. The syscall
//! number travels in `a7`, up to three arguments in `a0..a2`, and the result
//! goes back in `a0` as a non-negative value or a negative error code. Every
//! user pointer is checked against the active page table before it is
//! dereferenced.

use alloc::string::String;
use alloc::vec::Vec;

use crate::arch::trap::TrapFrame;
use crate::config::MAX_PRINT_LEN;
use crate::error::{to_ret, Error, Result};
use crate::io::{self, Control};
use crate::mm::{self, page::EntryFlags};
use crate::{drivers, fs, proc, thread, timer};

/// Syscall numbers, in `a7`.
pub mod scnum {
    #![allow(missing_docs)]

    pub const SYSCALL_EXIT: u64 = 0;
    pub const SYSCALL_EXEC: u64 = 1;
    pub const SYSCALL_FORK: u64 = 2;
    pub const SYSCALL_WAIT: u64 = 3;
    pub const SYSCALL_PRINT: u64 = 4;
    pub const SYSCALL_USLEEP: u64 = 5;
    pub const SYSCALL_DEVOPEN: u64 = 6;
    pub const SYSCALL_FSOPEN: u64 = 7;
    pub const SYSCALL_CLOSE: u64 = 8;
    pub const SYSCALL_READ: u64 = 9;
    pub const SYSCALL_WRITE: u64 = 10;
    pub const SYSCALL_IOCTL: u64 = 11;
    pub const SYSCALL_PIPE: u64 = 12;
    pub const SYSCALL_FSCREATE: u64 = 13;
    pub const SYSCALL_FSDELETE: u64 = 14;
}

/// I/O control command numbers, in the `cmd` argument of IOCTL.
pub mod ioctl {
    #![allow(missing_docs)]

    pub const IOCTL_GETBLKSZ: i64 = 0;
    pub const IOCTL_GETPOS: i64 = 1;
    pub const IOCTL_SETPOS: i64 = 2;
    pub const IOCTL_GETEND: i64 = 3;
    pub const IOCTL_SETEND: i64 = 4;
}

// Each RISC-V instruction is 4 bytes wide; resuming after the ecall means
// skipping exactly one.
const NEXT_INSTRUCTION: u64 = 4;

/// Dispatches the syscall in `tf`, stores the result in `a0` and advances
/// the saved program counter past the `ecall`.
pub fn handle_syscall(tf: &mut TrapFrame) {
    let result = dispatch(tf);
    tf.a0 = to_ret(result) as u64;
    tf.sepc += NEXT_INSTRUCTION;
}

fn dispatch(tf: &TrapFrame) -> Result<i64> {
    use scnum::*;

    match tf.a7 {
        SYSCALL_EXIT => sys_exit(),
        SYSCALL_EXEC => sys_exec(tf.a0 as i64, tf.a1 as i64, tf.a2 as usize),
        SYSCALL_FORK => sys_fork(tf),
        SYSCALL_WAIT => sys_wait(tf.a0 as usize),
        SYSCALL_PRINT => sys_print(tf.a0 as usize),
        SYSCALL_USLEEP => sys_usleep(tf.a0),
        SYSCALL_DEVOPEN => sys_devopen(tf.a0 as i64, tf.a1 as usize, tf.a2 as usize),
        SYSCALL_FSOPEN => sys_fsopen(tf.a0 as i64, tf.a1 as usize),
        SYSCALL_CLOSE => sys_close(tf.a0 as i64),
        SYSCALL_READ => sys_read(tf.a0 as i64, tf.a1 as usize, tf.a2 as usize),
        SYSCALL_WRITE => sys_write(tf.a0 as i64, tf.a1 as usize, tf.a2 as usize),
        SYSCALL_IOCTL => sys_ioctl(tf.a0 as i64, tf.a1 as i64, tf.a2 as usize),
        SYSCALL_PIPE => sys_pipe(tf.a0 as usize, tf.a1 as usize),
        SYSCALL_FSCREATE => sys_fscreate(tf.a0 as usize),
        SYSCALL_FSDELETE => sys_fsdelete(tf.a0 as usize),
        _ => Err(Error::NotSup),
    }
}

// User-memory access helpers. Validation against the active page table
// happens first; SUM is enabled, so validated pointers may be dereferenced.

fn user_bytes<'a>(ptr: usize, len: usize) -> Result<&'a [u8]> {
    mm::validate_vptr(ptr, len, EntryFlags::READ)?;
    // SAFETY: every covered page was just validated readable
    Ok(unsafe { core::slice::from_raw_parts(ptr as *const u8, len) })
}

fn user_bytes_mut<'a>(ptr: usize, len: usize) -> Result<&'a mut [u8]> {
    mm::validate_vptr(ptr, len, EntryFlags::RW)?;
    // SAFETY: every covered page was just validated writable
    Ok(unsafe { core::slice::from_raw_parts_mut(ptr as *mut u8, len) })
}

fn user_str(ptr: usize) -> Result<String> {
    let len = mm::validate_vstr(ptr, MAX_PRINT_LEN, EntryFlags::READ)?;
    // SAFETY: validate_vstr checked every page covering the string
    let bytes = unsafe { core::slice::from_raw_parts(ptr as *const u8, len) };
    core::str::from_utf8(bytes)
        .map(String::from)
        .map_err(|_| Error::Invalid)
}

fn read_user_u64(ptr: usize) -> Result<u64> {
    mm::validate_vptr(ptr, 8, EntryFlags::READ)?;
    // SAFETY: validated readable; may be unaligned
    Ok(unsafe { core::ptr::read_unaligned(ptr as *const u64) })
}

fn write_user_u64(ptr: usize, v: u64) -> Result<()> {
    mm::validate_vptr(ptr, 8, EntryFlags::RW)?;
    // SAFETY: validated writable; may be unaligned
    unsafe { core::ptr::write_unaligned(ptr as *mut u64, v) };
    Ok(())
}

fn write_user_i32(ptr: usize, v: i32) -> Result<()> {
    mm::validate_vptr(ptr, 4, EntryFlags::RW)?;
    // SAFETY: validated writable; may be unaligned
    unsafe { core::ptr::write_unaligned(ptr as *mut i32, v) };
    Ok(())
}

// Handlers.

fn sys_exit() -> Result<i64> {
    proc::exit();
}

fn sys_exec(fd: i64, argc: i64, argv: usize) -> Result<i64> {
    let exe = proc::get_io(fd).map_err(|_| Error::BadFd)?;

    let argc = usize::try_from(argc).map_err(|_| Error::Invalid)?;
    mm::validate_vptr(argv, argc * 8, EntryFlags::READ)?;

    let mut args = Vec::with_capacity(argc);
    for i in 0..argc {
        let p = read_user_u64(argv + i * 8)? as usize;
        args.push(user_str(p)?);
    }

    proc::exec(exe, &args);
}

fn sys_fork(tf: &TrapFrame) -> Result<i64> {
    proc::fork(tf).map(|tid| tid as i64)
}

fn sys_wait(tid: usize) -> Result<i64> {
    thread::join(tid).map(|tid| tid as i64)
}

fn sys_print(msg: usize) -> Result<i64> {
    let msg = user_str(msg)?;
    kprintln!(
        "<{}:{}> {}",
        thread::running_thread_name(),
        thread::running_thread(),
        msg
    );
    Ok(0)
}

fn sys_usleep(us: u64) -> Result<i64> {
    timer::sleep_us(us);
    Ok(0)
}

fn sys_devopen(fd: i64, name: usize, instno: usize) -> Result<i64> {
    let name = user_str(name)?;
    let io = drivers::open_device(&name, instno)?;
    proc::allocate_fd(fd, io)
}

fn sys_fsopen(fd: i64, name: usize) -> Result<i64> {
    let name = user_str(name)?;
    let io = fs::open(&name)?;
    proc::allocate_fd(fd, io)
}

fn sys_close(fd: i64) -> Result<i64> {
    // Dropping the process's reference closes the endpoint once the last
    // reference is gone.
    drop(proc::take_io(fd)?);
    Ok(0)
}

fn sys_read(fd: i64, buf: usize, bufsz: usize) -> Result<i64> {
    let io = proc::get_io(fd)?;
    let buf = user_bytes_mut(buf, bufsz)?;
    io.read(buf).map(|n| n as i64)
}

fn sys_write(fd: i64, buf: usize, len: usize) -> Result<i64> {
    let io = proc::get_io(fd)?;
    let buf = user_bytes(buf, len)?;

    // Writes smaller than the endpoint's block size would be rejected by
    // strict block-granular writers; route them through a positioned write
    // at the cursor and advance it by hand.
    let blksz = io::block_size(io.as_ref());
    if blksz > 1 && (len as u64) < blksz {
        let pos = io.control(Control::GetPos)?;
        let n = io.write_at(pos, buf)?;
        // The data is already out; a cursor that cannot represent the new
        // position is not worth failing the write over.
        let _ = io.control(Control::SetPos(pos + n as u64));
        return Ok(n as i64);
    }

    io.write(buf).map(|n| n as i64)
}

fn sys_ioctl(fd: i64, cmd: i64, arg: usize) -> Result<i64> {
    use ioctl::*;

    let io = proc::get_io(fd)?;

    match cmd {
        IOCTL_GETBLKSZ => io.control(Control::GetBlockSize).map(|v| v as i64),
        IOCTL_GETPOS => {
            let v = io.control(Control::GetPos)?;
            write_user_u64(arg, v)?;
            Ok(0)
        }
        IOCTL_SETPOS => {
            let v = read_user_u64(arg)?;
            io.control(Control::SetPos(v))?;
            Ok(0)
        }
        IOCTL_GETEND => {
            let v = io.control(Control::GetEnd)?;
            write_user_u64(arg, v)?;
            Ok(0)
        }
        IOCTL_SETEND => {
            let v = read_user_u64(arg)?;
            io.control(Control::SetEnd(v))?;
            Ok(0)
        }
        _ => Err(Error::NotSup),
    }
}

fn sys_pipe(wfdptr: usize, rfdptr: usize) -> Result<i64> {
    // Check both result slots before allocating anything.
    mm::validate_vptr(wfdptr, 4, EntryFlags::RW)?;
    mm::validate_vptr(rfdptr, 4, EntryFlags::RW)?;

    let (wio, rio) = io::create_pipe();

    let wfd = proc::allocate_fd(-1, wio)?;
    let rfd = match proc::allocate_fd(-1, rio) {
        Ok(fd) => fd,
        Err(e) => {
            let _ = proc::take_io(wfd);
            return Err(e);
        }
    };

    write_user_i32(wfdptr, wfd as i32)?;
    write_user_i32(rfdptr, rfd as i32)?;
    Ok(0)
}

fn sys_fscreate(name: usize) -> Result<i64> {
    let name = user_str(name)?;
    fs::create(&name)?;
    Ok(0)
}

fn sys_fsdelete(name: usize) -> Result<i64> {
    let name = user_str(name)?;
    fs::delete(&name)?;
    Ok(0)
}
