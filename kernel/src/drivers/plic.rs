//! SiFive-style PLIC driver.
//!
//! Sources are enabled together with an ISR; the external-interrupt handler
//! claims pending sources, dispatches their ISRs and completes them.

use crate::arch::IntrCell;
use crate::config::{PLIC_MMIO_BASE, PLIC_SRC_MAX};

// Register map, for the S-mode context of hart 0 (context 1).
const PRIORITY_BASE: usize = PLIC_MMIO_BASE;
const ENABLE_BASE: usize = PLIC_MMIO_BASE + 0x2000 + 0x80;
const THRESHOLD: usize = PLIC_MMIO_BASE + 0x20_0000 + 0x1000;
const CLAIM: usize = THRESHOLD + 4;

/// An interrupt service routine with its registration argument.
type Isr = (fn(usize), usize);

static HANDLERS: IntrCell<[Option<Isr>; PLIC_SRC_MAX as usize + 1]> =
    IntrCell::new([None; PLIC_SRC_MAX as usize + 1]);

fn mmio_write(addr: usize, v: u32) {
    // SAFETY: addr lies in the PLIC register block
    unsafe { (addr as *mut u32).write_volatile(v) };
}

fn mmio_read(addr: usize) -> u32 {
    // SAFETY: addr lies in the PLIC register block
    unsafe { (addr as *const u32).read_volatile() }
}

/// Lets every enabled source through to this hart.
pub fn init() {
    mmio_write(THRESHOLD, 0);
}

/// Enables interrupt source `src` and installs `isr` for it. The ISR runs in
/// interrupt context and must not block.
pub fn enable_source(src: u32, isr: fn(usize), arg: usize) {
    assert!(src > 0 && src <= PLIC_SRC_MAX);

    HANDLERS.with(|h| h[src as usize] = Some((isr, arg)));

    mmio_write(PRIORITY_BASE + 4 * src as usize, 1);

    let enable = ENABLE_BASE + 4 * (src as usize / 32);
    mmio_write(enable, mmio_read(enable) | (1 << (src % 32)));
}

/// Claims and dispatches every pending external interrupt.
pub fn handle_external_interrupt() {
    loop {
        let src = mmio_read(CLAIM);
        if src == 0 {
            break;
        }

        let isr = HANDLERS.with(|h| h.get(src as usize).copied().flatten());
        match isr {
            Some((isr, arg)) => isr(arg),
            None => kprintln!("plic: spurious interrupt from source {}", src),
        }

        mmio_write(CLAIM, src);
    }
}
