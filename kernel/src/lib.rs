//! ktos is an educational, Unix-like kernel for 64-bit RISC-V machines with
//! the Sv39 paging extension, booting under a standard SBI firmware on a
//! virtualized platform (QEMU `virt`). It provides preemptive kernel threads,
//! isolated user processes, a unified I/O abstraction, the KTFS disk
//! filesystem behind a write-back block cache, and a small syscall interface.

#![no_std]
#![warn(missing_docs)]

#[macro_use]
extern crate alloc;

/// Utility macros.
#[macro_use]
pub mod macros;

/// Architecture-specific glue: traps, context switching, interrupt control.
pub mod arch;

/// Compile-time platform configuration.
pub mod config;

/// Device and peripheral drivers.
pub mod drivers;

/// Kernel error taxonomy.
pub mod error;

/// Filesystem front end over the KTFS core.
pub mod fs;

/// The unified I/O object.
pub mod io;

/// Memory management: page frames, kernel heap, address spaces.
pub mod mm;

/// Panic support.
pub mod panic;

/// User processes.
pub mod proc;

/// Syscall dispatch and user-memory validation.
pub mod syscall;

/// Threads, scheduling and synchronization.
pub mod thread;

/// Timer and alarms.
pub mod timer;

use alloc::string::String;

/// Kernel entry point, called from the boot assembly with a valid stack.
#[no_mangle]
pub extern "C" fn start_kernel() -> ! {
    drivers::uart::console_init();

    kprintln!();
    kprintln!("ktos starting");

    mm::memory_init();
    drivers::devmgr_init();
    arch::trap::init();
    drivers::plic::init();
    timer::timer_init();
    thread::thrmgr_init();
    proc::procmgr_init();

    drivers::attach_platform_devices();

    let blkio = match drivers::open_device("vioblk", 0) {
        Ok(io) => io,
        Err(e) => panic!("failed to open vioblk: {}", e),
    };

    if let Err(e) = fs::mount(blkio) {
        panic!("failed to mount filesystem: {}", e);
    }
    kprintln!("root filesystem mounted");

    // Give the initial process a serial port on fd 2.
    if let Ok(serial) = drivers::open_device("uart", 0) {
        proc::install_io(2, serial).expect("fd 2 is free at boot");
    }

    let init = match fs::open("init") {
        Ok(io) => io,
        Err(e) => panic!("failed to open init: {}", e),
    };

    proc::exec(init, &[String::from("init")]);
}
