//! Timer and alarms.
//!
//! Sleeping threads park on [`Alarm`]s kept in a list sorted by wake time.
//! The hardware timer compare is always programmed to the head's wake time
//! (or effectively infinity when the list is empty); the timer ISR drains
//! every expired alarm and wakes its waiters.

use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, Ordering};

use riscv::registers::{SiFlags, Sie, Time};

use crate::arch::{disable_interrupts, restore_interrupts, IntrCell};
use crate::config::TIMER_FREQ;
use crate::thread::Condition;

static TIMER_INITIALIZED: AtomicBool = AtomicBool::new(false);

struct SleepList {
    head: Option<NonNull<Alarm>>,
}

// SAFETY: alarms stay linked only while their owning frames are parked
unsafe impl Send for SleepList {}

static SLEEPING: IntrCell<SleepList> = IntrCell::new(SleepList { head: None });

/// Returns the monotonic tick count, `TIMER_FREQ` ticks per second.
pub fn ticks() -> u64 {
    Time::read()
}

/// Programs the hardware timer compare.
fn set_stcmp(t: u64) {
    let _ = sbi::Timer::set_timer(t);
}

/// Initializes the timer subsystem with no event pending.
pub fn timer_init() {
    set_stcmp(u64::MAX);
    TIMER_INITIALIZED.store(true, Ordering::Relaxed);
}

/// A one-shot wakeup tied to a condition variable.
pub struct Alarm {
    twake: u64,
    cond: Condition,
    next: Option<NonNull<Alarm>>,
}

impl Alarm {
    /// Creates an alarm whose sleeps are measured from now.
    pub fn new(name: &'static str) -> Self {
        Self {
            twake: ticks(),
            cond: Condition::new(name),
            next: None,
        }
    }

    /// Resets the alarm so that the next sleep increment is relative to the
    /// time of the call.
    pub fn reset(&mut self) {
        self.twake = ticks();
    }

    /// Sleeps until `tcnt` ticks past the previous wake time.
    ///
    /// A wake time that has already passed returns immediately; one that
    /// overflows saturates.
    pub fn sleep(&mut self, tcnt: u64) {
        self.twake = self.twake.saturating_add(tcnt);

        if self.twake < ticks() {
            return;
        }

        let pie = disable_interrupts();

        // Insert sorted by wake time and reprogram the compare if this
        // alarm became the new head.
        let twake = self.twake;
        let me = NonNull::from(&mut *self);
        let new_head = SLEEPING.with(|list| {
            let mut prev: Option<NonNull<Alarm>> = None;
            let mut curr = list.head;
            // SAFETY: queued alarms are live; see SleepList
            while let Some(al) = curr {
                if unsafe { al.as_ref().twake } > twake {
                    break;
                }
                prev = curr;
                curr = unsafe { al.as_ref().next };
            }

            self.next = curr;
            match prev {
                // SAFETY: prev is a live queued alarm
                Some(mut p) => unsafe { p.as_mut().next = Some(me) },
                None => list.head = Some(me),
            }
            prev.is_none()
        });

        if new_head {
            set_stcmp(twake);
        }
        Sie::set(SiFlags::STIE);

        self.cond.wait();

        restore_interrupts(pie);
    }

    /// Sleeps for `sec` seconds.
    pub fn sleep_sec(&mut self, sec: u64) {
        self.sleep(sec * TIMER_FREQ);
    }

    /// Sleeps for `ms` milliseconds.
    pub fn sleep_ms(&mut self, ms: u64) {
        self.sleep(ms * (TIMER_FREQ / 1000));
    }

    /// Sleeps for `us` microseconds.
    pub fn sleep_us(&mut self, us: u64) {
        self.sleep(us * (TIMER_FREQ / 1_000_000));
    }
}

/// Sleeps the calling thread for `us` microseconds.
pub fn sleep_us(us: u64) {
    let mut al = Alarm::new("sleep");
    al.sleep_us(us);
}

/// Sleeps the calling thread for `ms` milliseconds.
pub fn sleep_ms(ms: u64) {
    sleep_us(1000 * ms);
}

/// Timer ISR: wakes every expired alarm and reprograms the compare to the
/// next wake time, or disables the timer interrupt when nothing is pending.
pub fn handle_timer_interrupt() {
    let now = ticks();
    let pie = disable_interrupts();

    loop {
        let expired = SLEEPING.with(|list| {
            // SAFETY: queued alarms are live; see SleepList
            match list.head {
                Some(head) if unsafe { head.as_ref().twake } <= now => {
                    list.head = unsafe { head.as_ref().next };
                    Some(head)
                }
                _ => None,
            }
        });

        match expired {
            Some(mut al) => {
                // SAFETY: the alarm was unlinked above and its waiter is
                // still parked on the condition
                unsafe {
                    al.as_mut().next = None;
                    al.as_ref().cond.broadcast();
                }
            }
            None => break,
        }
    }

    let next = SLEEPING.with(|list| list.head.map(|h| unsafe { h.as_ref().twake }));
    match next {
        Some(t) => set_stcmp(t),
        None => {
            Sie::clear(SiFlags::STIE);
            set_stcmp(u64::MAX);
        }
    }

    restore_interrupts(pie);
}
