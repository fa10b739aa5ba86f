//! Access to various system registers.

use bitflags::bitflags;

bitflags! {
    /// Flags for the `sstatus` register.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SstatusFlags: u64 {
        /// S-Mode interrupt enable.
        const SIE = 1 << 1;
        /// S-Mode previous interrupt enable.
        const SPIE = 1 << 5;
        /// U-Mode big endian memory access.
        const UBE = 1 << 6;
        /// S-Mode previous privilege level.
        const SPP = 1 << 8;
        /// Floating point unit state.
        const FS = 3 << 13;
        /// Permit S-Mode user memory access.
        const SUM = 1 << 18;
        /// Make executable readable.
        const MXR = 1 << 19;
        /// Dirty state presence.
        const SD = 1 << 63;
    }
}

/// The `sstatus` register keeps track of the processor's current operating state.
#[derive(Debug)]
pub struct Sstatus;

impl Sstatus {
    /// Reads the content of `sstatus`.
    #[inline]
    pub fn read() -> SstatusFlags {
        SstatusFlags::from_bits_truncate(Self::read_raw())
    }

    /// Reads the raw content of `sstatus`.
    #[inline]
    pub fn read_raw() -> u64 {
        csr_read!("sstatus")
    }

    /// Sets the specified flags in `sstatus`.
    ///
    /// # Safety
    ///
    /// It's possible to violate memory safety through this function.
    #[inline]
    pub unsafe fn set(flags: SstatusFlags) {
        csr_set!("sstatus", flags.bits());
    }

    /// Clears the specified flags from `sstatus`.
    ///
    /// # Safety
    ///
    /// It's possible to violate memory safety through this function.
    #[inline]
    pub unsafe fn clear(flags: SstatusFlags) {
        csr_clear!("sstatus", flags.bits());
    }
}

bitflags! {
    /// Flags for the `sie`/`sip` registers.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SiFlags: u64 {
        /// S-Mode software interrupt enable.
        const SSIE = 1 << 1;
        /// S-Mode timer interrupt enable.
        const STIE = 1 << 5;
        /// S-Mode external interrupt enable.
        const SEIE = 1 << 9;
    }
}

/// The `sie` register contains interrupt enable bits.
#[derive(Debug)]
pub struct Sie;

impl Sie {
    /// Reads the content of `sie`.
    #[inline]
    pub fn read() -> SiFlags {
        SiFlags::from_bits_truncate(csr_read!("sie"))
    }

    /// Sets the specified flags in `sie`.
    #[inline]
    pub fn set(flags: SiFlags) {
        csr_set!("sie", flags.bits());
    }

    /// Clears the specified flags from `sie`.
    #[inline]
    pub fn clear(flags: SiFlags) {
        csr_clear!("sie", flags.bits());
    }
}

/// The `sip` register contains interrupt pending bits.
#[derive(Debug)]
pub struct Sip;

impl Sip {
    /// Reads the content of `sip`.
    #[inline]
    pub fn read() -> SiFlags {
        SiFlags::from_bits_truncate(csr_read!("sip"))
    }

    /// Clears the specified flags from `sip`.
    #[inline]
    pub fn clear(flags: SiFlags) {
        csr_clear!("sip", flags.bits());
    }
}

/// The `stvec` register holds the trap vector configuration.
#[derive(Debug)]
pub struct Stvec;

impl Stvec {
    /// Writes to `stvec`.
    #[inline]
    pub fn write(v: u64) {
        csr_write!("stvec", v);
    }
}

/// The `sepc` register holds the PC of the instruction that trapped.
#[derive(Debug)]
pub struct Sepc;

impl Sepc {
    /// Reads the content of `sepc`.
    #[inline]
    pub fn read() -> u64 {
        csr_read!("sepc")
    }

    /// Writes to `sepc`.
    #[inline]
    pub fn write(v: u64) {
        csr_write!("sepc", v);
    }
}

/// The `scause` register identifies the cause of the last trap.
#[derive(Debug)]
pub struct Scause;

impl Scause {
    /// Reads the content of `scause`.
    #[inline]
    pub fn read() -> u64 {
        csr_read!("scause")
    }
}

/// The `stval` register holds exception-specific information to assist software
/// in handling a trap.
#[derive(Debug)]
pub struct Stval;

impl Stval {
    /// Reads the content of `stval`.
    #[inline]
    pub fn read() -> u64 {
        csr_read!("stval")
    }
}

/// The `sscratch` register holds a word of state for the trap handler, by
/// convention the kernel stack pointer of the running thread while in U-mode.
#[derive(Debug)]
pub struct Sscratch;

impl Sscratch {
    /// Reads the content of `sscratch`.
    #[inline]
    pub fn read() -> u64 {
        csr_read!("sscratch")
    }

    /// Writes to `sscratch`.
    #[inline]
    pub fn write(v: u64) {
        csr_write!("sscratch", v);
    }
}

/// The `time` CSR exposes the real-time counter.
#[derive(Debug)]
pub struct Time;

impl Time {
    /// Reads the current value of the real-time counter.
    #[inline]
    pub fn read() -> u64 {
        csr_read!("time")
    }
}

/// Virtual addressing modes supported by the RISC-V architecture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SatpMode {
    /// `Bare` translation mode (`virt` == `phys`).
    Bare = 0,
    /// `Sv39` translation scheme (3-level page table).
    Sv39 = 8,
    /// `Sv48` translation scheme (4-level page table).
    Sv48 = 9,
}

/// The `satp` register controls S-Mode address translation and protection.
#[derive(Debug)]
pub struct Satp;

impl Satp {
    /// Reads the raw content of `satp`.
    #[inline]
    pub fn read_raw() -> u64 {
        csr_read!("satp")
    }

    /// Writes raw bits to `satp`.
    ///
    /// # Safety
    ///
    /// It's possible to violate memory safety through this function.
    #[inline]
    pub unsafe fn write_raw(v: u64) {
        csr_write!("satp", v);
    }

    /// Atomically swaps the content of `satp`, returning the previous value.
    ///
    /// # Safety
    ///
    /// It's possible to violate memory safety through this function.
    #[inline]
    pub unsafe fn swap_raw(v: u64) -> u64 {
        csr_swap!("satp", v)
    }
}
