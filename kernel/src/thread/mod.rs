//! Kernel threads and the scheduler.
//!
//! A single hart runs one thread at a time cooperatively, with preemption
//! supplied by the timer interrupt translating into a yield at a safe point.
//! The ready list is FIFO. The idle thread occupies the last table slot, is
//! always eligible to run, and executes a wait-for-interrupt loop when no
//! other thread is ready.

use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::string::String;
use alloc::vec::Vec;

use riscv::instructions::wfi;

use crate::arch::entry::{_boot_stack_top, _thread_startup, _thread_switch};
use crate::arch::{disable_interrupts, enable_interrupts, restore_interrupts, IntrCell};
use crate::config::{NTHR, STACK_SIZE};
use crate::error::{Error, Result};

mod sync;

pub use sync::{Condition, GuardRef, Guarded, Lock};

/// Thread identifier: an index into the thread table.
pub type Tid = usize;

/// Slot of the main thread.
pub const MAIN_TID: Tid = 0;
/// Slot of the idle thread, always the last one.
pub const IDLE_TID: Tid = NTHR - 1;

/// Callee-saved register state of a suspended thread.
///
/// Note: the field order **must** match the offsets used by
/// `_thread_switch` and `_thread_startup`.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Context {
    ra: u64,
    sp: u64,
    s: [u64; 12],
}

impl Context {
    const fn zeroed() -> Self {
        Self {
            ra: 0,
            sp: 0,
            s: [0; 12],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ThreadState {
    Ready,
    Running,
    Waiting,
    Exited,
}

struct Thread {
    id: Tid,
    name: String,
    state: ThreadState,
    ctx: Context,
    // Kept alive until the thread is reclaimed; the main thread runs on the
    // boot stack instead.
    #[allow(dead_code)]
    stack: Option<Box<[u8]>>,
    kstack_top: u64,
    parent: Tid,
    proc: Option<usize>,
    child_exit: Condition,
    held_locks: Vec<NonNull<Lock>>,
    // What the thread is waiting on, for debugger inspection.
    #[allow(dead_code)]
    wait_name: &'static str,
}

// SAFETY: held-lock pointers reference locks that outlive their holders
unsafe impl Send for Thread {}

struct ThreadTable {
    slots: [Option<Box<Thread>>; NTHR],
}

static THREADS: IntrCell<ThreadTable> = IntrCell::new(ThreadTable {
    slots: [const { None }; NTHR],
});

static READY: IntrCell<VecDeque<Tid>> = IntrCell::new(VecDeque::new());

static CURRENT: AtomicUsize = AtomicUsize::new(MAIN_TID);

static THRMGR_INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Returns the id of the running thread.
pub fn running_thread() -> Tid {
    CURRENT.load(Ordering::Relaxed)
}

/// Returns the name of the running thread.
pub fn running_thread_name() -> String {
    thread_name(running_thread())
}

/// Returns the name of thread `tid`.
pub fn thread_name(tid: Tid) -> String {
    THREADS.with(|t| {
        t.slots[tid]
            .as_ref()
            .map(|thr| thr.name.clone())
            .unwrap_or_else(|| String::from("?"))
    })
}

/// Initializes the thread manager: installs the main thread in slot 0 and
/// spawns the idle thread into the last slot.
pub fn thrmgr_init() {
    assert!(crate::mm::memory_initialized());
    assert!(!THRMGR_INITIALIZED.load(Ordering::Relaxed));

    let main = Box::new(Thread {
        id: MAIN_TID,
        name: String::from("main"),
        state: ThreadState::Running,
        ctx: Context::zeroed(),
        stack: None,
        // SAFETY: label defined in the boot assembly
        kstack_top: unsafe { &_boot_stack_top as *const _ as u64 },
        parent: MAIN_TID,
        proc: None,
        child_exit: Condition::new("main.child_exit"),
        held_locks: Vec::new(),
        wait_name: "",
    });

    THREADS.with(|t| t.slots[MAIN_TID] = Some(main));

    // The ready list never outgrows the thread table, so pushes from ISRs
    // never allocate.
    READY.with(|r| r.reserve(NTHR));

    spawn_inner("idle", Box::new(idle_thread_func), Some(IDLE_TID))
        .expect("idle slot is free at init");

    THRMGR_INITIALIZED.store(true, Ordering::Relaxed);
}

/// Returns whether [`thrmgr_init`] has completed.
pub fn thrmgr_initialized() -> bool {
    THRMGR_INITIALIZED.load(Ordering::Relaxed)
}

/// Creates a thread running `f` and inserts it into the ready list.
/// Fails with [`Error::MThread`] when no table slot is free.
pub fn spawn<F>(name: &str, f: F) -> Result<Tid>
where
    F: FnOnce() + Send + 'static,
{
    spawn_inner(name, Box::new(f), None)
}

fn spawn_inner(
    name: &str,
    f: Box<dyn FnOnce() + Send>,
    fixed_slot: Option<Tid>,
) -> Result<Tid> {
    let stack = vec![0u8; STACK_SIZE].into_boxed_slice();
    let top = ((stack.as_ptr() as usize + STACK_SIZE) & !15) as u64;

    // The entry closure rides into the first activation through s0; see
    // `_thread_startup`.
    let raw = Box::into_raw(Box::new(f));

    let mut ctx = Context::zeroed();
    ctx.ra = _thread_startup as usize as u64;
    ctx.sp = top;
    ctx.s[0] = raw as u64;

    let parent = running_thread();
    let name = String::from(name);

    let tid = THREADS.with(|t| {
        let slot = match fixed_slot {
            Some(s) if t.slots[s].is_none() => s,
            Some(_) => return Err(Error::MThread),
            None => {
                let mut found = None;
                for (i, s) in t.slots.iter().enumerate().take(NTHR - 1).skip(1) {
                    if s.is_none() {
                        found = Some(i);
                        break;
                    }
                }
                found.ok_or(Error::MThread)?
            }
        };

        t.slots[slot] = Some(Box::new(Thread {
            id: slot,
            name,
            state: ThreadState::Ready,
            ctx,
            kstack_top: top,
            stack: Some(stack),
            parent,
            proc: None,
            child_exit: Condition::new("child_exit"),
            held_locks: Vec::new(),
            wait_name: "",
        }));
        Ok(slot)
    });

    let tid = match tid {
        Ok(tid) => tid,
        Err(e) => {
            // SAFETY: raw was produced by Box::into_raw above and not consumed
            drop(unsafe { Box::from_raw(raw) });
            return Err(e);
        }
    };

    READY.with(|r| r.push_back(tid));
    Ok(tid)
}

/// Entered from `_thread_startup` on a thread's first activation.
#[no_mangle]
extern "C" fn thread_run(raw: *mut Box<dyn FnOnce() + Send>) -> ! {
    // The switch into a first activation leaves interrupts masked.
    enable_interrupts();

    // SAFETY: raw was leaked by spawn_inner for exactly this call
    let f = unsafe { Box::from_raw(raw) };
    f();
    exit();
}

/// Terminates the calling thread.
///
/// Every lock on the held-locks list is released, the parent is notified,
/// and the processor moves on to the next ready thread. The main thread
/// exiting halts the system.
pub fn exit() -> ! {
    let me = running_thread();

    if me == MAIN_TID {
        kprintln!("main thread exited; shutting down");
        let _ = sbi::SystemReset::shutdown();
        crate::arch::halt();
    }

    // Release everything we still hold, head first.
    loop {
        let next = THREADS.with(|t| {
            t.slots[me]
                .as_mut()
                .and_then(|thr| thr.held_locks.pop())
        });
        match next {
            // SAFETY: locks outlive their holders
            Some(lock) => unsafe { lock.as_ref() }.release(),
            None => break,
        }
    }

    disable_interrupts();

    let parent = THREADS.with(|t| {
        let thr = t.slots[me].as_mut().expect("running thread has a slot");
        thr.state = ThreadState::Exited;
        thr.parent
    });

    child_exit_condition(parent).broadcast();

    suspend();
    unreachable!("exited thread was rescheduled");
}

/// Suspends the caller, re-enqueuing it at the tail of the ready list.
pub fn yield_now() {
    suspend();
}

/// Yields if another thread is ready to run. Called by the trap handler
/// after a timer interrupt; this is the preemption point.
pub fn preempt() {
    if !thrmgr_initialized() {
        return;
    }
    if READY.with(|r| !r.is_empty()) {
        yield_now();
    }
}

/// Waits for a child to exit and reclaims it.
///
/// With `tid == 0` any exited child is joined; otherwise the named child
/// must exist and be a child of the caller. Returns the joined thread's id.
pub fn join(tid: Tid) -> Result<Tid> {
    if tid >= NTHR {
        return Err(Error::Invalid);
    }

    let me = running_thread();

    loop {
        let pie = disable_interrupts();

        enum Scan {
            NoChild,
            Live,
            Exited(Tid),
        }

        let scan = THREADS.with(|t| {
            let mut result = Scan::NoChild;
            for slot in t.slots.iter().flatten() {
                let matches = slot.parent == me
                    && slot.id != me
                    && (tid == 0 || slot.id == tid);
                if !matches {
                    continue;
                }
                if slot.state == ThreadState::Exited {
                    return Scan::Exited(slot.id);
                }
                result = Scan::Live;
            }
            result
        });

        match scan {
            Scan::Exited(ctid) => {
                reclaim(ctid);
                restore_interrupts(pie);
                return Ok(ctid);
            }
            Scan::Live => {
                // Interrupts are still disabled, so the child cannot exit
                // between the scan and the wait below.
                child_exit_condition(me).wait();
                restore_interrupts(pie);
            }
            Scan::NoChild => {
                restore_interrupts(pie);
                return Err(Error::Invalid);
            }
        }
    }
}

/// Reclaims an exited thread: reparents its children and frees its slot.
fn reclaim(tid: Tid) {
    assert!(tid != MAIN_TID && tid < NTHR);

    THREADS.with(|t| {
        let parent = {
            let thr = t.slots[tid].as_ref().expect("reclaiming a live slot");
            assert!(thr.state == ThreadState::Exited);
            thr.parent
        };

        for slot in t.slots.iter_mut().flatten() {
            if slot.parent == tid {
                slot.parent = parent;
            }
        }

        t.slots[tid] = None;
    });
}

/// Binds thread `tid` to process-table slot `idx`.
pub fn set_thread_process(tid: Tid, idx: usize) {
    THREADS.with(|t| {
        if let Some(thr) = t.slots[tid].as_mut() {
            thr.proc = Some(idx);
        }
    });
}

/// Returns the process-table slot bound to the running thread.
pub fn running_thread_process() -> Option<usize> {
    THREADS.with(|t| t.slots[running_thread()].as_ref().and_then(|thr| thr.proc))
}

/// Returns the top of the running thread's kernel stack, used as the trap
/// stack while the thread executes in U-mode.
pub fn running_thread_kstack_top() -> u64 {
    THREADS.with(|t| {
        t.slots[running_thread()]
            .as_ref()
            .expect("running thread has a slot")
            .kstack_top
    })
}

// Scheduler internals shared with the sync primitives.

/// Marks the running thread as waiting. Called with interrupts disabled,
/// immediately before [`suspend`].
pub(crate) fn mark_current_waiting(on: &'static str) {
    THREADS.with(|t| {
        let thr = t.slots[running_thread()]
            .as_mut()
            .expect("running thread has a slot");
        debug_assert!(thr.state == ThreadState::Running);
        thr.state = ThreadState::Waiting;
        thr.wait_name = on;
    });
}

/// Moves a waiting thread to the ready list. ISR-safe: never allocates.
pub(crate) fn make_ready(tid: Tid) {
    let became_ready = THREADS.with(|t| match t.slots[tid].as_mut() {
        Some(thr) if thr.state == ThreadState::Waiting => {
            thr.state = ThreadState::Ready;
            thr.wait_name = "";
            true
        }
        _ => false,
    });

    if became_ready {
        READY.with(|r| r.push_back(tid));
    }
}

/// Records `lock` on the running thread's held-locks list.
pub(crate) fn push_held_lock(lock: NonNull<Lock>) {
    THREADS.with(|t| {
        if let Some(thr) = t.slots[running_thread()].as_mut() {
            thr.held_locks.push(lock);
        }
    });
}

/// Drops `lock` from the running thread's held-locks list.
pub(crate) fn remove_held_lock(lock: *const Lock) {
    THREADS.with(|t| {
        if let Some(thr) = t.slots[running_thread()].as_mut() {
            thr.held_locks.retain(|l| l.as_ptr() as *const Lock != lock);
        }
    });
}

/// Suspends the running thread and resumes the next thread on the ready
/// list. Returns when the caller is next scheduled.
///
/// The caller's state decides its fate: a `Running` thread is re-enqueued,
/// a `Waiting` or `Exited` thread is left where its bookkeeping put it.
pub(crate) fn suspend() {
    let pie = disable_interrupts();

    let me = running_thread();
    let next = READY
        .with(|r| r.pop_front())
        .expect("ready list empty: no idle thread?");

    let (old_ctx, new_ctx) = THREADS.with(|t| {
        {
            let thr = t.slots[me].as_mut().expect("running thread has a slot");
            if thr.state == ThreadState::Running {
                thr.state = ThreadState::Ready;
            }
        }
        {
            let thr = t.slots[next].as_mut().expect("ready thread has a slot");
            debug_assert!(thr.state == ThreadState::Ready);
            thr.state = ThreadState::Running;
        }

        let old = &mut t.slots[me].as_mut().unwrap().ctx as *mut Context;
        let new = &t.slots[next].as_ref().unwrap().ctx as *const Context;
        (old, new)
    });

    if THREADS.with(|t| t.slots[me].as_ref().unwrap().state == ThreadState::Ready) {
        READY.with(|r| r.push_back(me));
    }

    CURRENT.store(next, Ordering::Relaxed);

    // Interrupts stay masked across the switch: an interrupt here would
    // preempt with the scheduler bookkeeping ahead of the actual register
    // state. The incoming thread restores its own interrupt state, and
    // first activations enable interrupts in thread_run.
    // SAFETY: both contexts live in table slots that are not reclaimed while
    // their threads are scheduled or suspended
    unsafe { _thread_switch(old_ctx, new_ctx) };

    restore_interrupts(pie);
}

fn child_exit_condition(tid: Tid) -> &'static Condition {
    let cond = THREADS.with(|t| {
        NonNull::from(
            &t.slots[tid]
                .as_ref()
                .expect("thread with children has a slot")
                .child_exit,
        )
    });
    // SAFETY: thread slots are stable while the thread has live children or
    // waiters, which is exactly when this condition is used
    unsafe { cond.as_ref() }
}

/// The idle thread sleeps using wfi when the ready list is empty. Interrupts
/// are disabled around the final emptiness check to avoid a race where an
/// ISR readies a thread between the check and the wfi.
fn idle_thread_func() {
    loop {
        while READY.with(|r| !r.is_empty()) {
            yield_now();
        }

        let pie = disable_interrupts();
        if READY.with(|r| r.is_empty()) {
            wfi();
        }
        restore_interrupts(pie);
    }
}
