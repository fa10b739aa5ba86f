//! Device and peripheral drivers.
//!
//! Drivers register named device instances with the device manager; the
//! DEVOPEN syscall and the boot code open them by `(name, instance)`.

use core::sync::atomic::{AtomicBool, Ordering};

use alloc::vec::Vec;
use spin::Mutex;

use crate::config::{
    UART0_INTR_SRCNO, UART0_MMIO_BASE, UART_COUNT, UART_MMIO_STEP, VIRTIO0_MMIO_BASE,
    VIRTIO_COUNT, VIRTIO_MMIO_STEP,
};
use crate::error::{Error, Result};
use crate::io::IoRef;

pub mod plic;
pub mod uart;
pub mod virtio;

struct DeviceEntry {
    name: &'static str,
    instno: usize,
    io: IoRef,
}

static DEVICES: Mutex<Vec<DeviceEntry>> = Mutex::new(Vec::new());

static DEVMGR_INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Initializes the device manager.
pub fn devmgr_init() {
    assert!(!DEVMGR_INITIALIZED.load(Ordering::Relaxed));
    DEVMGR_INITIALIZED.store(true, Ordering::Relaxed);
}

/// Registers a device instance under `name`, returning its instance number.
pub fn register_device(name: &'static str, io: IoRef) -> usize {
    let mut devices = DEVICES.lock();
    let instno = devices.iter().filter(|d| d.name == name).count();
    devices.push(DeviceEntry { name, instno, io });
    instno
}

/// Opens device instance `instno` of `name`, taking a new reference on its
/// I/O object.
pub fn open_device(name: &str, instno: usize) -> Result<IoRef> {
    DEVICES
        .lock()
        .iter()
        .find(|d| d.name == name && d.instno == instno)
        .map(|d| d.io.clone())
        .ok_or(Error::NotFound)
}

/// Probes and attaches every device of the fixed platform layout.
pub fn attach_platform_devices() {
    for i in 0..UART_COUNT {
        uart::uart_attach(
            UART0_MMIO_BASE + i * UART_MMIO_STEP,
            UART0_INTR_SRCNO + i as u32,
        );
    }

    for i in 0..VIRTIO_COUNT {
        virtio::virtio_attach(VIRTIO0_MMIO_BASE + i * VIRTIO_MMIO_STEP);
    }
}
