//! Architecture-specific glue for RV64.

use core::cell::UnsafeCell;

use riscv::instructions::wfi;
use riscv::registers::{SiFlags, Sie, Sip, Sstatus, SstatusFlags};

pub mod entry;
pub mod trap;

/// Halts execution on the current hart forever.
pub fn halt() -> ! {
    // SAFETY: we are halting, if something goes wrong, we don't care
    unsafe { Sstatus::clear(SstatusFlags::SIE) };
    Sie::clear(SiFlags::SSIE | SiFlags::STIE | SiFlags::SEIE);
    Sip::clear(SiFlags::SSIE | SiFlags::STIE | SiFlags::SEIE);

    loop {
        wfi();
    }
}

/// Disables interrupts on this hart, returning whether they were enabled.
///
/// The returned value is passed back to [`restore_interrupts`] so that
/// critical sections nest correctly.
#[inline]
pub fn disable_interrupts() -> bool {
    let was_enabled = Sstatus::read().contains(SstatusFlags::SIE);
    // SAFETY: masking interrupts cannot break memory safety
    unsafe { Sstatus::clear(SstatusFlags::SIE) };
    was_enabled
}

/// Enables interrupts on this hart.
#[inline]
pub fn enable_interrupts() {
    // SAFETY: the trap vector is configured before any interrupt source is
    unsafe { Sstatus::set(SstatusFlags::SIE) };
}

/// Restores the interrupt state saved by [`disable_interrupts`].
#[inline]
pub fn restore_interrupts(was_enabled: bool) {
    if was_enabled {
        enable_interrupts();
    }
}

/// A cell whose contents are protected by masking interrupts on the single
/// hart. The closure passed to [`IntrCell::with`] runs with interrupts
/// disabled and exclusive access to the value.
///
/// Closures must not re-enter the same cell; distinct cells may nest.
pub struct IntrCell<T>(UnsafeCell<T>);

// SAFETY: exclusive access is enforced by masking interrupts on the only hart
unsafe impl<T: Send> Sync for IntrCell<T> {}

impl<T> IntrCell<T> {
    /// Creates a new cell holding `value`.
    pub const fn new(value: T) -> Self {
        Self(UnsafeCell::new(value))
    }

    /// Runs `f` with interrupts disabled and a mutable reference to the value.
    #[inline]
    pub fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let pie = disable_interrupts();
        // SAFETY: interrupts are masked and there is a single hart, so no
        // other execution context can observe the value
        let r = f(unsafe { &mut *self.0.get() });
        restore_interrupts(pie);
        r
    }
}
