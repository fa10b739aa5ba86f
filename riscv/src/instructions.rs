//! Special RISC-V instructions.

/// Halts the hart until the next interrupt arrives.
#[inline]
pub fn wfi() {
    #[cfg(target_arch = "riscv64")]
    unsafe {
        core::arch::asm!("wfi", options(nostack, nomem));
    }
}

/// Flushes the TLB for the whole address space of the running hart.
#[inline]
pub fn sfence_vma() {
    #[cfg(target_arch = "riscv64")]
    unsafe {
        core::arch::asm!("sfence.vma zero, zero", options(nostack, nomem));
    }
}

/// Synchronizes the instruction stream with preceding stores.
///
/// Required after writing code to memory, eg. when loading an executable.
#[inline]
pub fn fence_i() {
    #[cfg(target_arch = "riscv64")]
    unsafe {
        core::arch::asm!("fence.i", options(nostack, nomem));
    }
}
