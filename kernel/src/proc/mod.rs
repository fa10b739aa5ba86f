//! User processes.
//!
//! A process is a thread with an address space and a table of open I/O
//! objects. Slot 0 is the static main process, bound to the kernel address
//! space; every other slot is created by fork. Each non-empty I/O slot holds
//! exactly one reference owned by the process.

use core::sync::atomic::{AtomicBool, Ordering};

use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::Arc;

use crate::arch::trap::{trap_frame_jump, TrapFrame};
use crate::arch::{disable_interrupts, restore_interrupts, IntrCell};
use crate::config::{NPROC, PAGE_SIZE, PROCESS_IOMAX, UMEM_END_VMA};
use crate::error::{Error, Result};
use crate::io::IoRef;
use crate::mm::{self, page::EntryFlags, MsTag};
use crate::fs;
use crate::thread::{self, Condition, Tid};

mod elf;

// idx, tid and mtag are bookkeeping for debugger inspection; the fd table is
// the part the kernel reaches into.
#[allow(dead_code)]
struct Process {
    idx: usize,
    tid: Tid,
    mtag: MsTag,
    iotab: [Option<IoRef>; PROCESS_IOMAX],
}

static PROCTAB: IntrCell<[Option<Box<Process>>; NPROC]> =
    IntrCell::new([const { None }; NPROC]);

static PROCMGR_INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Initializes the process manager: binds the main process to the running
/// thread and the kernel address space.
pub fn procmgr_init() {
    assert!(crate::mm::memory_initialized());
    assert!(thread::thrmgr_initialized());
    assert!(!PROCMGR_INITIALIZED.load(Ordering::Relaxed));

    let tid = thread::running_thread();
    PROCTAB.with(|t| {
        t[0] = Some(Box::new(Process {
            idx: 0,
            tid,
            mtag: mm::active_mspace(),
            iotab: [const { None }; PROCESS_IOMAX],
        }));
    });
    thread::set_thread_process(tid, 0);

    PROCMGR_INITIALIZED.store(true, Ordering::Relaxed);
}

/// Runs `f` on the current process. `f` executes with interrupts disabled
/// and must not block.
fn with_current<R>(f: impl FnOnce(&mut Process) -> R) -> Result<R> {
    let idx = thread::running_thread_process().ok_or(Error::Invalid)?;
    PROCTAB.with(|t| t[idx].as_mut().map(|p| f(p)).ok_or(Error::Invalid))
}

/// Returns a new reference to the I/O object in descriptor slot `fd`.
pub fn get_io(fd: i64) -> Result<IoRef> {
    let fd = usize::try_from(fd).map_err(|_| Error::BadFd)?;
    if fd >= PROCESS_IOMAX {
        return Err(Error::BadFd);
    }
    with_current(|p| p.iotab[fd].clone())?.ok_or(Error::BadFd)
}

/// Removes and returns the I/O object in descriptor slot `fd`.
pub fn take_io(fd: i64) -> Result<IoRef> {
    let fd = usize::try_from(fd).map_err(|_| Error::BadFd)?;
    if fd >= PROCESS_IOMAX {
        return Err(Error::BadFd);
    }
    with_current(|p| p.iotab[fd].take())?.ok_or(Error::BadFd)
}

/// Installs `io` in a descriptor slot of the current process.
///
/// A request of `-1` picks the lowest free slot; otherwise the named slot
/// must be free. Returns the slot used.
pub fn allocate_fd(fd: i64, io: IoRef) -> Result<i64> {
    with_current(|p| {
        if fd == -1 {
            for (i, slot) in p.iotab.iter_mut().enumerate() {
                if slot.is_none() {
                    *slot = Some(io);
                    return Ok(i as i64);
                }
            }
            return Err(Error::MFile);
        }

        let i = usize::try_from(fd).map_err(|_| Error::BadFd)?;
        if i >= PROCESS_IOMAX || p.iotab[i].is_some() {
            return Err(Error::BadFd);
        }
        p.iotab[i] = Some(io);
        Ok(fd)
    })?
}

/// Places `io` in an exact descriptor slot; used during boot to seed the
/// main process's table.
pub fn install_io(fd: i64, io: IoRef) -> Result<i64> {
    allocate_fd(fd, io)
}

/// Replaces the current process image with the executable in `exe`.
///
/// The current user mappings are dropped, the ELF is loaded, a fresh user
/// stack page is mapped at the top of user memory and seeded with the
/// argument vector, and control transfers to the new image's entry point in
/// U-mode. On any failure the thread exits; this function never returns.
pub fn exec(exe: IoRef, args: &[String]) -> ! {
    mm::reset_active_mspace();

    let entry = match elf::elf_load(&exe) {
        Ok(entry) => entry,
        Err(e) => {
            kprintln!("exec: loading failed: {}", e);
            thread::exit();
        }
    };

    // One page of user stack at the very top of user memory.
    let stack_page = mm::alloc_phys_page_zeroed();
    mm::map_page(
        UMEM_END_VMA - PAGE_SIZE,
        stack_page,
        EntryFlags::RW | EntryFlags::USER,
    );

    // SAFETY: the page was just allocated and is identity-mapped
    let page = unsafe { core::slice::from_raw_parts_mut(stack_page, PAGE_SIZE) };
    let stksz = match build_stack(page, args) {
        Ok(stksz) => stksz,
        Err(e) => {
            kprintln!("exec: building the user stack failed: {}", e);
            thread::exit();
        }
    };

    // The argument vector sits at the stack top; sp points right at it.
    let sp = (UMEM_END_VMA - stksz) as u64;
    let tf = TrapFrame::new_user(entry as u64, sp, args.len() as u64, sp);

    drop(exe);

    // SAFETY: the address space was fully rebuilt above and the frame enters
    // U-mode at the image's entry point
    unsafe { trap_frame_jump(&tf, thread::running_thread_kstack_top()) }
}

/// Lays out `argv[]` and the argument strings at the top of the user stack
/// page. Returns the total stack size used, a multiple of 16.
///
/// The page will be mapped at `UMEM_END_VMA - PAGE_SIZE`, so every pointer
/// written here is a user-visible address in that page.
fn build_stack(page: &mut [u8], args: &[String]) -> Result<usize> {
    const PTR_SIZE: usize = core::mem::size_of::<u64>();

    let argc = args.len();

    // argv[] holds argc+1 pointers (the last one NULL) and must fit on the
    // page together with the strings it points to.
    if PAGE_SIZE / PTR_SIZE - 1 < argc {
        return Err(Error::NoMem);
    }

    let mut stksz = (argc + 1) * PTR_SIZE;
    for arg in args {
        let argsz = arg.len() + 1;
        if PAGE_SIZE - stksz < argsz {
            return Err(Error::NoMem);
        }
        stksz += argsz;
    }

    // Round up to a multiple of 16 (RISC-V ABI requirement).
    stksz = (stksz + 15) & !15;
    assert!(stksz <= PAGE_SIZE);

    let argv_off = PAGE_SIZE - stksz;
    let mut str_off = argv_off + (argc + 1) * PTR_SIZE;

    for (i, arg) in args.iter().enumerate() {
        let uva = (UMEM_END_VMA - PAGE_SIZE + str_off) as u64;
        page[argv_off + i * PTR_SIZE..argv_off + (i + 1) * PTR_SIZE]
            .copy_from_slice(&uva.to_le_bytes());

        page[str_off..str_off + arg.len()].copy_from_slice(arg.as_bytes());
        page[str_off + arg.len()] = 0;
        str_off += arg.len() + 1;
    }

    page[argv_off + argc * PTR_SIZE..argv_off + (argc + 1) * PTR_SIZE]
        .copy_from_slice(&0u64.to_le_bytes());

    Ok(stksz)
}

/// Forks the current process.
///
/// The child gets a reference to every open I/O object, a deep copy of the
/// user address space, and a thread that resumes from a copy of the parent's
/// trap frame with `a0 = 0`. Returns the child's thread id in the parent.
pub fn fork(tf: &TrapFrame) -> Result<Tid> {
    let parent_idx = thread::running_thread_process().ok_or(Error::Invalid)?;

    let (slot, iotab) = PROCTAB.with(|t| {
        let slot = (1..NPROC)
            .find(|&i| t[i].is_none())
            .ok_or(Error::NoChild)?;
        let iotab = t[parent_idx]
            .as_ref()
            .expect("current process has a slot")
            .iotab
            .clone();
        Ok::<_, Error>((slot, iotab))
    })?;

    let child_mtag = mm::clone_active_mspace();

    // The child resumes after the ecall with a zero return value.
    let mut child_tf = Box::new(tf.clone());
    child_tf.a0 = 0;
    child_tf.sepc += 4;

    let done = Arc::new(Condition::new("fork.done"));
    let child_done = done.clone();

    // Interrupts stay disabled from the spawn to the wait, so the child
    // cannot broadcast before the parent is on the wait list.
    let pie = disable_interrupts();

    let spawned = thread::spawn("fork", move || {
        let tf = *child_tf;
        mm::switch_mspace(child_mtag);
        child_done.broadcast();
        // SAFETY: the cloned space mirrors the parent's user mappings and
        // the frame re-enters U-mode where the parent trapped
        unsafe { trap_frame_jump(&tf, thread::running_thread_kstack_top()) }
    });

    let tid = match spawned {
        Ok(tid) => tid,
        Err(e) => {
            restore_interrupts(pie);
            // Unwind the clone: adopt it briefly and tear it down.
            let parent_mtag = mm::switch_mspace(child_mtag);
            mm::discard_active_mspace();
            mm::switch_mspace(parent_mtag);
            return Err(e);
        }
    };

    PROCTAB.with(|t| {
        t[slot] = Some(Box::new(Process {
            idx: slot,
            tid,
            mtag: child_mtag,
            iotab,
        }));
    });
    thread::set_thread_process(tid, slot);

    done.wait();
    restore_interrupts(pie);

    Ok(tid)
}

/// Terminates the current process: flushes the filesystem, closes every open
/// I/O object, discards the address space and exits the thread.
pub fn exit() -> ! {
    if let Err(e) = fs::flush() {
        kprintln!("exit: filesystem flush failed: {}", e);
    }

    if let Some(idx) = thread::running_thread_process() {
        if idx == 0 {
            panic!("main process exited");
        }

        // Pull the table out under the interrupt guard, drop it outside:
        // closing an endpoint may block.
        let iotab = PROCTAB.with(|t| {
            t[idx]
                .as_mut()
                .map(|p| core::mem::replace(&mut p.iotab, [const { None }; PROCESS_IOMAX]))
        });
        drop(iotab);

        mm::discard_active_mspace();

        PROCTAB.with(|t| t[idx] = None);
    }

    thread::exit();
}

#[cfg(test)]
mod tests {
    use alloc::string::ToString;

    use super::*;

    fn read_ptr(page: &[u8], off: usize) -> u64 {
        let mut b = [0u8; 8];
        b.copy_from_slice(&page[off..off + 8]);
        u64::from_le_bytes(b)
    }

    #[test]
    fn stack_layout_places_argv_then_strings() {
        let mut page = vec![0u8; PAGE_SIZE];
        let args = vec!["init".to_string(), "-x".to_string()];

        let stksz = build_stack(&mut page, &args).unwrap();
        assert_eq!(stksz % 16, 0);

        let argv_off = PAGE_SIZE - stksz;
        let page_uva = (UMEM_END_VMA - PAGE_SIZE) as u64;

        // argv[0] and argv[1] point past the 3-element pointer array.
        let argv0 = read_ptr(&page, argv_off);
        let argv1 = read_ptr(&page, argv_off + 8);
        assert_eq!(argv0, page_uva + (argv_off + 3 * 8) as u64);
        assert_eq!(argv1, argv0 + "init".len() as u64 + 1);
        // argv[argc] is the NULL terminator.
        assert_eq!(read_ptr(&page, argv_off + 16), 0);

        // Strings are NUL-terminated and in order.
        let s0 = (argv0 - page_uva) as usize;
        assert_eq!(&page[s0..s0 + 5], b"init\0");
        let s1 = (argv1 - page_uva) as usize;
        assert_eq!(&page[s1..s1 + 3], b"-x\0");
    }

    #[test]
    fn empty_argv_still_gets_a_null_terminator() {
        let mut page = vec![0u8; PAGE_SIZE];
        let stksz = build_stack(&mut page, &[]).unwrap();

        assert_eq!(stksz, 16);
        assert_eq!(read_ptr(&page, PAGE_SIZE - stksz), 0);
    }

    #[test]
    fn oversized_arguments_are_rejected() {
        let mut page = vec![0u8; PAGE_SIZE];

        let big = "x".repeat(PAGE_SIZE);
        assert_eq!(
            build_stack(&mut page, &[big]),
            Err(Error::NoMem)
        );
    }
}
