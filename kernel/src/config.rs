//! Compile-time configuration for the QEMU `virt` platform.

#![allow(unused)]

/// Size of one physical page.
pub const PAGE_SIZE: usize = 4096;
/// log2 of the page size.
pub const PAGE_ORDER: usize = 12;

/// First physical address of RAM.
pub const RAM_START_PMA: usize = 0x8000_0000;
/// Size of physical RAM.
pub const RAM_SIZE: usize = 128 * 1024 * 1024;
/// One past the last physical address of RAM.
pub const RAM_END_PMA: usize = RAM_START_PMA + RAM_SIZE;

/// Size of the kernel heap region, carved out right after the kernel image.
pub const HEAP_SIZE: usize = 1024 * 1024;

/// First virtual address of user memory.
pub const UMEM_START_VMA: usize = 0xC000_0000;
/// One past the last virtual address of user memory.
pub const UMEM_END_VMA: usize = 0x1_0000_0000;

/// Maximum number of threads, including the main and idle threads.
pub const NTHR: usize = 16;
/// Maximum number of processes.
pub const NPROC: usize = 16;
/// Number of I/O slots in a process's descriptor table.
pub const PROCESS_IOMAX: usize = 16;
/// Size of a kernel thread stack.
pub const STACK_SIZE: usize = 16 * 1024;

/// Frequency of the real-time counter, in ticks per second.
pub const TIMER_FREQ: u64 = 10_000_000;

/// Longest string accepted from user space (PRINT, names).
pub const MAX_PRINT_LEN: usize = 512;

/// MMIO base of the first NS16550 UART.
pub const UART0_MMIO_BASE: usize = 0x1000_0000;
/// Distance between consecutive UART register blocks.
pub const UART_MMIO_STEP: usize = 0x100;
/// PLIC source number of the first UART.
pub const UART0_INTR_SRCNO: u32 = 10;
/// Number of UART instances on the platform.
pub const UART_COUNT: usize = 1;

/// MMIO base of the first virtio-mmio transport.
pub const VIRTIO0_MMIO_BASE: usize = 0x1000_1000;
/// Distance between consecutive virtio-mmio transports.
pub const VIRTIO_MMIO_STEP: usize = 0x1000;
/// PLIC source number of the first virtio-mmio transport.
pub const VIRTIO0_INTR_SRCNO: u32 = 1;
/// Number of virtio-mmio transports on the platform.
pub const VIRTIO_COUNT: usize = 8;

/// MMIO base of the PLIC.
pub const PLIC_MMIO_BASE: usize = 0x0C00_0000;
/// Highest interrupt source number served by the PLIC.
pub const PLIC_SRC_MAX: u32 = 95;
