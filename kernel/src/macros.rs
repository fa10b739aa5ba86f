//! Utility macros.

use core::fmt;

/// Prints to the kernel console (UART0).
///
/// Equivalent to the [`kprintln!`] macro except that a newline is not printed
/// at the end of the message.
#[macro_export]
macro_rules! kprint {
    () => ($crate::macros::_print_timestamp());
    ($($arg:tt)*) => ({
        $crate::macros::_print_timestamp();
        $crate::macros::_print(format_args!($($arg)*));
    });
}

/// Prints to the kernel console (UART0) with a newline (`\n`).
#[macro_export]
macro_rules! kprintln {
    () => ($crate::kprint!("\n"));
    ($($arg:tt)+) => ($crate::kprint!("{}\n", format_args!($($arg)*)));
}

#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    use fmt::Write;

    // An ISR printing while a thread holds the console would spin forever,
    // so the console lock is only ever taken with interrupts masked.
    let pie = crate::arch::disable_interrupts();
    let _ = crate::drivers::uart::console().write_fmt(args);
    crate::arch::restore_interrupts(pie);
}

#[doc(hidden)]
pub fn _print_timestamp() {
    use crate::config::TIMER_FREQ;
    use crate::timer;

    let cy = timer::ticks();
    let sec = cy / TIMER_FREQ;
    let subsec = (cy % TIMER_FREQ) / 10;

    _print(format_args!("[{sec:5}.{subsec:06}] "));
}
