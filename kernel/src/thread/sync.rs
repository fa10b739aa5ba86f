//! Condition variables, reentrant locks and lock-guarded cells.
//!
//! Short list manipulations run with interrupts disabled; actual waiting
//! always goes through [`Condition::wait`], which atomically enqueues the
//! caller and suspends it, so wakeups cannot be lost.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::ptr::NonNull;

use alloc::collections::VecDeque;

use crate::arch::{disable_interrupts, restore_interrupts, IntrCell};
use crate::thread::{self, Tid};

/// A condition variable with a FIFO of waiting threads.
pub struct Condition {
    name: &'static str,
    waiters: IntrCell<VecDeque<Tid>>,
}

impl Condition {
    /// Creates a condition variable.
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            waiters: IntrCell::new(VecDeque::new()),
        }
    }

    /// Name given at creation, for diagnostics.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Suspends the calling thread until the next [`Condition::broadcast`].
    ///
    /// Enqueueing and suspension are atomic with respect to interrupts: a
    /// broadcast from an ISR either sees the caller on the list or runs
    /// before the caller started waiting.
    pub fn wait(&self) {
        let pie = disable_interrupts();

        self.waiters.with(|w| w.push_back(thread::running_thread()));
        thread::mark_current_waiting(self.name);
        thread::suspend();

        restore_interrupts(pie);
    }

    /// Drains every current waiter to the ready list.
    ///
    /// Safe to call from an ISR; never blocks and never allocates.
    pub fn broadcast(&self) {
        let pie = disable_interrupts();

        while let Some(tid) = self.waiters.with(|w| w.pop_front()) {
            thread::make_ready(tid);
        }

        restore_interrupts(pie);
    }
}

struct LockState {
    owner: Option<Tid>,
    count: usize,
}

/// A blocking, reentrant mutual-exclusion lock.
///
/// Acquiring an already-owned lock increments a recursion count; releases
/// must match acquires. Every lock a thread holds is tracked on the thread's
/// held-locks list and released if the thread exits.
pub struct Lock {
    name: &'static str,
    state: IntrCell<LockState>,
    released: Condition,
}

impl Lock {
    /// Creates an unowned lock.
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            state: IntrCell::new(LockState {
                owner: None,
                count: 0,
            }),
            released: Condition::new(name),
        }
    }

    /// Acquires the lock, suspending while another thread owns it.
    pub fn acquire(&self) {
        let pie = disable_interrupts();
        let me = thread::running_thread();

        let reentered = self.state.with(|s| {
            if s.owner == Some(me) {
                s.count += 1;
                true
            } else {
                false
            }
        });
        if reentered {
            restore_interrupts(pie);
            return;
        }

        loop {
            let taken = self.state.with(|s| {
                if s.owner.is_none() {
                    s.owner = Some(me);
                    s.count = 1;
                    true
                } else {
                    false
                }
            });
            if taken {
                break;
            }
            self.released.wait();
        }

        thread::push_held_lock(NonNull::from(self));
        restore_interrupts(pie);
    }

    /// Releases the lock.
    ///
    /// # Panics
    ///
    /// Panics if the caller does not own the lock.
    pub fn release(&self) {
        let pie = disable_interrupts();
        let me = thread::running_thread();

        let still_held = self.state.with(|s| {
            assert_eq!(s.owner, Some(me), "releasing a lock owned by another thread");
            if s.count > 1 {
                s.count -= 1;
                true
            } else {
                s.owner = None;
                s.count = 0;
                false
            }
        });

        if !still_held {
            thread::remove_held_lock(self as *const Lock);
            self.released.broadcast();
        }

        restore_interrupts(pie);
    }

    /// Returns the current recursion count, for diagnostics.
    pub fn count(&self) -> usize {
        self.state.with(|s| s.count)
    }

    /// Returns the owning thread, if any.
    pub fn owner(&self) -> Option<Tid> {
        self.state.with(|s| s.owner)
    }
}

/// A value protected by a [`Lock`].
///
/// Unlike a spin mutex, the holder may suspend (eg. block on device I/O)
/// while the value is borrowed. The same thread must not lock the same cell
/// twice: reentrancy is a property of [`Lock`], not of the borrow.
pub struct Guarded<T> {
    lock: Lock,
    value: UnsafeCell<T>,
}

// SAFETY: access to the value is serialized by the lock
unsafe impl<T: Send> Sync for Guarded<T> {}

impl<T> Guarded<T> {
    /// Creates a guarded cell.
    pub const fn new(name: &'static str, value: T) -> Self {
        Self {
            lock: Lock::new(name),
            value: UnsafeCell::new(value),
        }
    }

    /// Acquires the lock and borrows the value until the guard drops.
    pub fn lock(&self) -> GuardRef<'_, T> {
        self.lock.acquire();
        GuardRef { cell: self }
    }
}

/// Exclusive borrow of a [`Guarded`] value; releases the lock on drop.
pub struct GuardRef<'a, T> {
    cell: &'a Guarded<T>,
}

impl<T> Deref for GuardRef<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the lock is held for the guard's lifetime
        unsafe { &*self.cell.value.get() }
    }
}

impl<T> DerefMut for GuardRef<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the lock is held for the guard's lifetime
        unsafe { &mut *self.cell.value.get() }
    }
}

impl<T> Drop for GuardRef<'_, T> {
    fn drop(&mut self) {
        self.cell.lock.release();
    }
}
