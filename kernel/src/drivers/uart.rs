//! NS16550 UART driver.
//!
//! The first UART doubles as the kernel console, written with polled I/O.
//! Each UART is also registered as a character device: writes poll the
//! transmitter, reads block on a receive ring filled by the interrupt
//! handler.

use core::fmt;

use alloc::sync::Arc;
use alloc::vec::Vec;
use lazy_static::lazy_static;
use spin::{Mutex, MutexGuard};

use crate::arch::{disable_interrupts, restore_interrupts, IntrCell};
use crate::config::UART0_MMIO_BASE;
use crate::drivers::{plic, register_device};
use crate::error::Result;
use crate::io::Io;
use crate::thread::{Condition, Lock};

// Register offsets.
const RBR_THR: usize = 0; // receive buffer / transmit holding
const IER: usize = 1; // interrupt enable
const FCR: usize = 2; // FIFO control
const LCR: usize = 3; // line control
const LSR: usize = 5; // line status

const IER_DRIE: u8 = 0x01; // data-ready interrupt enable
const LCR_8N1: u8 = 0x03;
const LSR_DR: u8 = 0x01; // data ready
const LSR_THRE: u8 = 0x20; // transmit holding register empty

/// Device driver of the 16550 UART IC.
pub struct Ns16550 {
    base: usize,
}

// SAFETY: register access is volatile MMIO
unsafe impl Send for Ns16550 {}
unsafe impl Sync for Ns16550 {}

impl Ns16550 {
    /// Creates a new 16550 UART mapping to the given address.
    pub const fn new(base: usize) -> Self {
        Self { base }
    }

    fn reg_read(&self, off: usize) -> u8 {
        // SAFETY: off selects a register within the device's block
        unsafe { ((self.base + off) as *const u8).read_volatile() }
    }

    fn reg_write(&self, off: usize, v: u8) {
        // SAFETY: off selects a register within the device's block
        unsafe { ((self.base + off) as *mut u8).write_volatile(v) };
    }

    /// Programs 8N1 framing and enables the FIFOs.
    pub fn hw_init(&self) {
        self.reg_write(LCR, LCR_8N1);
        self.reg_write(FCR, 0x01);
        self.reg_write(IER, 0);
    }

    /// Writes a single byte, polling until the transmitter has room.
    pub fn put(&self, val: u8) {
        while self.reg_read(LSR) & LSR_THRE == 0 {}
        self.reg_write(RBR_THR, val);
    }

    /// Returns the next received byte, or `None` if the Rx queue is empty.
    pub fn get(&self) -> Option<u8> {
        if self.reg_read(LSR) & LSR_DR != 0 {
            Some(self.reg_read(RBR_THR))
        } else {
            None
        }
    }
}

impl fmt::Write for Ns16550 {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for b in s.bytes() {
            if b == b'\n' {
                self.put(b'\r');
            }
            self.put(b);
        }
        Ok(())
    }
}

lazy_static! {
    /// The kernel console: UART0 with polled output.
    static ref CONSOLE: Mutex<Ns16550> = Mutex::new(Ns16550::new(UART0_MMIO_BASE));
}

/// Initializes the kernel console.
pub fn console_init() {
    CONSOLE.lock().hw_init();
}

/// Borrows the kernel console for formatted output.
pub fn console() -> MutexGuard<'static, Ns16550> {
    CONSOLE.lock()
}

const RX_RING_SIZE: usize = 64;

struct RxRing {
    buf: [u8; RX_RING_SIZE],
    head: usize,
    count: usize,
}

/// A UART exposed as a character device.
struct UartDev {
    hw: Ns16550,
    // Writers are serialized by a blocking lock; the transmitter is polled.
    tx_lock: Lock,
    // The receive ring is filled by the ISR and drained by readers.
    rx: IntrCell<RxRing>,
    rx_avail: Condition,
}

impl Io for UartDev {
    fn read(&self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        let pie = disable_interrupts();

        let n = loop {
            let n = self.rx.with(|ring| {
                let n = buf.len().min(ring.count);
                for slot in buf.iter_mut().take(n) {
                    *slot = ring.buf[ring.head];
                    ring.head = (ring.head + 1) % RX_RING_SIZE;
                    ring.count -= 1;
                }
                n
            });

            if n > 0 {
                break n;
            }
            // Interrupts stay disabled, so the ISR cannot broadcast between
            // the emptiness check and the wait.
            self.rx_avail.wait();
        };

        restore_interrupts(pie);
        Ok(n)
    }

    fn write(&self, buf: &[u8]) -> Result<usize> {
        self.tx_lock.acquire();
        for &b in buf {
            self.hw.put(b);
        }
        self.tx_lock.release();
        Ok(buf.len())
    }
}

/// Receive ISR: drains the hardware FIFO into the ring and wakes readers.
/// Bytes overflowing the ring are dropped.
fn uart_isr(arg: usize) {
    let dev = attached(arg);

    dev.rx.with(|ring| {
        while let Some(b) = dev.hw.get() {
            if ring.count < RX_RING_SIZE {
                let tail = (ring.head + ring.count) % RX_RING_SIZE;
                ring.buf[tail] = b;
                ring.count += 1;
            }
        }
    });

    dev.rx_avail.broadcast();
}

static ATTACHED: Mutex<Vec<Arc<UartDev>>> = Mutex::new(Vec::new());

fn attached(idx: usize) -> Arc<UartDev> {
    ATTACHED.lock()[idx].clone()
}

/// Attaches the UART at `base` as the next "uart" device instance and wires
/// up its receive interrupt.
pub fn uart_attach(base: usize, irq: u32) {
    let dev = Arc::new(UartDev {
        hw: Ns16550::new(base),
        tx_lock: Lock::new("uart.tx"),
        rx: IntrCell::new(RxRing {
            buf: [0; RX_RING_SIZE],
            head: 0,
            count: 0,
        }),
        rx_avail: Condition::new("uart.rx"),
    });

    dev.hw.hw_init();
    dev.hw.reg_write(IER, IER_DRIE);

    // The ISR takes this lock too, so it must never observe it held.
    let pie = disable_interrupts();
    let idx = {
        let mut attached = ATTACHED.lock();
        attached.push(dev.clone());
        attached.len() - 1
    };
    restore_interrupts(pie);

    plic::enable_source(irq, uart_isr, idx);
    register_device("uart", dev);
}
