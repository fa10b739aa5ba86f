//! Access to RISC-V system registers and privileged instructions.
//!
//! Only the S-mode subset used by the kernel is implemented. On targets other
//! than `riscv64` every accessor panics, which lets host builds (and host test
//! runs of dependent crates) typecheck without touching hardware.

#![no_std]
#![warn(missing_docs)]

#[macro_use]
mod csr;

pub mod instructions;
pub mod registers;
