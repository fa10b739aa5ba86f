//! Legacy virtio-mmio block device driver.
//!
//! A single 8-entry virtqueue serves one request at a time; completion is
//! polled. The device is exposed as a block-granular I/O endpoint: positions
//! must be sector-aligned and lengths whole multiples of the sector size.

use core::sync::atomic::{fence, Ordering};

use alloc::sync::Arc;
use bitflags::bitflags;

use crate::config::PAGE_SIZE;
use crate::drivers::register_device;
use crate::error::{Error, Result};
use crate::io::{Control, Io};
use crate::mm::alloc_phys_pages;
use crate::thread::Guarded;

/// Sector size mandated by the virtio block spec.
pub const SECTOR_SIZE: usize = 512;

// virtio-mmio register offsets.
const REG_MAGIC: usize = 0x00;
const REG_VERSION: usize = 0x04;
const REG_DEVICE_ID: usize = 0x08;
const REG_DEVICE_FEATURES: usize = 0x10;
const REG_DRIVER_FEATURES: usize = 0x20;
const REG_GUEST_PAGE_SIZE: usize = 0x28;
const REG_QUEUE_SEL: usize = 0x30;
const REG_QUEUE_NUM_MAX: usize = 0x34;
const REG_QUEUE_NUM: usize = 0x38;
const REG_QUEUE_ALIGN: usize = 0x3C;
const REG_QUEUE_PFN: usize = 0x40;
const REG_QUEUE_NOTIFY: usize = 0x50;
const REG_INTERRUPT_STATUS: usize = 0x60;
const REG_INTERRUPT_ACK: usize = 0x64;
const REG_STATUS: usize = 0x70;
const REG_CONFIG: usize = 0x100;

const VIRTIO_MAGIC: u32 = 0x74726976; // "virt"
const DEVICE_ID_BLOCK: u32 = 2;

bitflags! {
    /// Device status bits.
    #[derive(Debug, Clone, Copy)]
    struct Status: u32 {
        const ACKNOWLEDGE = 1;
        const DRIVER = 2;
        const DRIVER_OK = 4;
        const FAILED = 128;
    }
}

// Block request types.
const VIRTIO_BLK_T_IN: u32 = 0;
const VIRTIO_BLK_T_OUT: u32 = 1;

const VIRTQ_DESC_F_NEXT: u16 = 1;
const VIRTQ_DESC_F_WRITE: u16 = 2;

const QUEUE_SIZE: usize = 8;

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct VirtqDesc {
    addr: u64,
    len: u32,
    flags: u16,
    next: u16,
}

#[repr(C)]
struct VirtqAvail {
    flags: u16,
    idx: u16,
    ring: [u16; QUEUE_SIZE],
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct VirtqUsedElem {
    id: u32,
    len: u32,
}

#[repr(C)]
struct VirtqUsed {
    flags: u16,
    idx: u16,
    ring: [VirtqUsedElem; QUEUE_SIZE],
}

/// Request header handed to the device, followed on the wire by the data
/// buffer and a status byte.
#[repr(C)]
struct VirtioBlkReq {
    kind: u32,
    rsvd: u32,
    sector: u64,
}

/// A single legacy virtqueue in two physically contiguous pages: descriptor
/// table and available ring in the first, used ring in the second.
struct Virtq {
    desc: *mut VirtqDesc,
    avail: *mut VirtqAvail,
    used: *mut VirtqUsed,
    last_used: u16,
}

// SAFETY: the queue memory is owned by the device for its lifetime
unsafe impl Send for Virtq {}

/// A virtio block device.
pub struct VirtioBlkDev {
    base: usize,
    capacity: u64, // in sectors
    virtq: Guarded<Virtq>,
}

impl VirtioBlkDev {
    fn reg_read(&self, off: usize) -> u32 {
        reg_read(self.base, off)
    }

    fn reg_write(&self, off: usize, v: u32) {
        reg_write(self.base, off, v);
    }

    /// Submits one request and polls the used ring for its completion.
    fn transfer(&self, kind: u32, sector: u64, data: &[u8], device_writes: bool) -> Result<()> {
        let mut vq = self.virtq.lock();

        let req = VirtioBlkReq {
            kind,
            rsvd: 0,
            sector,
        };
        let mut status: u8 = 0xFF;

        // Kernel memory is identity-mapped, so virtual addresses double as
        // physical ones for the device.
        // SAFETY: the queue pages belong to this device
        unsafe {
            vq.desc.write_volatile(VirtqDesc {
                addr: &req as *const _ as u64,
                len: core::mem::size_of::<VirtioBlkReq>() as u32,
                flags: VIRTQ_DESC_F_NEXT,
                next: 1,
            });
            vq.desc.add(1).write_volatile(VirtqDesc {
                addr: data.as_ptr() as u64,
                len: data.len() as u32,
                flags: VIRTQ_DESC_F_NEXT | if device_writes { VIRTQ_DESC_F_WRITE } else { 0 },
                next: 2,
            });
            vq.desc.add(2).write_volatile(VirtqDesc {
                addr: &mut status as *mut _ as u64,
                len: 1,
                flags: VIRTQ_DESC_F_WRITE,
                next: 0,
            });

            let idx = (*vq.avail).idx;
            (*vq.avail).ring[idx as usize % QUEUE_SIZE] = 0;
            fence(Ordering::SeqCst);
            (*vq.avail).idx = idx.wrapping_add(1);
        }
        fence(Ordering::SeqCst);

        self.reg_write(REG_QUEUE_NOTIFY, 0);

        // Poll for completion.
        // SAFETY: the used ring lives in the queue pages
        while unsafe { core::ptr::addr_of!((*vq.used).idx).read_volatile() } == vq.last_used {
            core::hint::spin_loop();
        }
        vq.last_used = vq.last_used.wrapping_add(1);
        fence(Ordering::SeqCst);

        let pending = self.reg_read(REG_INTERRUPT_STATUS);
        if pending != 0 {
            self.reg_write(REG_INTERRUPT_ACK, pending);
        }

        // The device stored the outcome behind the compiler's back.
        // SAFETY: status is live for the whole request
        if unsafe { core::ptr::read_volatile(&status) } != 0 {
            return Err(Error::Io);
        }
        Ok(())
    }

    fn check_request(&self, pos: u64, len: usize) -> Result<usize> {
        if pos % SECTOR_SIZE as u64 != 0 || len % SECTOR_SIZE != 0 {
            return Err(Error::Invalid);
        }
        let end = self.capacity * SECTOR_SIZE as u64;
        if pos >= end {
            return Ok(0);
        }
        Ok(len.min((end - pos) as usize))
    }
}

impl Io for VirtioBlkDev {
    fn read_at(&self, pos: u64, buf: &mut [u8]) -> Result<usize> {
        let n = self.check_request(pos, buf.len())?;
        if n > 0 {
            self.transfer(VIRTIO_BLK_T_IN, pos / SECTOR_SIZE as u64, &buf[..n], true)?;
        }
        Ok(n)
    }

    fn write_at(&self, pos: u64, buf: &[u8]) -> Result<usize> {
        let n = self.check_request(pos, buf.len())?;
        if n > 0 {
            self.transfer(VIRTIO_BLK_T_OUT, pos / SECTOR_SIZE as u64, &buf[..n], false)?;
        }
        Ok(n)
    }

    fn control(&self, cmd: Control) -> Result<u64> {
        match cmd {
            Control::GetBlockSize => Ok(SECTOR_SIZE as u64),
            Control::GetEnd => Ok(self.capacity * SECTOR_SIZE as u64),
            _ => Err(Error::NotSup),
        }
    }
}

fn reg_read(base: usize, off: usize) -> u32 {
    // SAFETY: off selects a register within the transport's block
    unsafe { ((base + off) as *const u32).read_volatile() }
}

fn reg_write(base: usize, off: usize, v: u32) {
    // SAFETY: off selects a register within the transport's block
    unsafe { ((base + off) as *mut u32).write_volatile(v) };
}

/// Probes the virtio-mmio transport at `base` and registers it as the next
/// "vioblk" instance if it hosts a block device.
pub fn virtio_attach(base: usize) {
    if reg_read(base, REG_MAGIC) != VIRTIO_MAGIC
        || reg_read(base, REG_VERSION) != 1
        || reg_read(base, REG_DEVICE_ID) != DEVICE_ID_BLOCK
    {
        return;
    }

    // Recognize the device.
    reg_write(base, REG_STATUS, Status::ACKNOWLEDGE.bits());
    reg_write(
        base,
        REG_STATUS,
        (Status::ACKNOWLEDGE | Status::DRIVER).bits(),
    );

    // No optional features are needed.
    let _ = reg_read(base, REG_DEVICE_FEATURES);
    reg_write(base, REG_DRIVER_FEATURES, 0);

    reg_write(base, REG_GUEST_PAGE_SIZE, PAGE_SIZE as u32);

    // Configure virtqueue 0.
    reg_write(base, REG_QUEUE_SEL, 0);
    if (reg_read(base, REG_QUEUE_NUM_MAX) as usize) < QUEUE_SIZE {
        reg_write(base, REG_STATUS, Status::FAILED.bits());
        return;
    }
    reg_write(base, REG_QUEUE_NUM, QUEUE_SIZE as u32);
    reg_write(base, REG_QUEUE_ALIGN, PAGE_SIZE as u32);

    // Two zeroed, physically contiguous pages: legacy layout wants the used
    // ring on its own page boundary.
    let queue_mem = alloc_phys_pages(2);
    // SAFETY: freshly allocated pages
    unsafe { core::ptr::write_bytes(queue_mem, 0, 2 * PAGE_SIZE) };

    reg_write(base, REG_QUEUE_PFN, (queue_mem as usize / PAGE_SIZE) as u32);

    let virtq = Virtq {
        desc: queue_mem as *mut VirtqDesc,
        // SAFETY: offsets within the two queue pages
        avail: unsafe { queue_mem.add(QUEUE_SIZE * core::mem::size_of::<VirtqDesc>()) }
            as *mut VirtqAvail,
        used: unsafe { queue_mem.add(PAGE_SIZE) } as *mut VirtqUsed,
        last_used: 0,
    };

    // Device is now live.
    reg_write(
        base,
        REG_STATUS,
        (Status::ACKNOWLEDGE | Status::DRIVER | Status::DRIVER_OK).bits(),
    );

    // Capacity in sectors, from device config space.
    let capacity =
        reg_read(base, REG_CONFIG) as u64 | ((reg_read(base, REG_CONFIG + 4) as u64) << 32);

    let dev = Arc::new(VirtioBlkDev {
        base,
        capacity,
        virtq: Guarded::new("vioblk", virtq),
    });

    let instno = register_device("vioblk", dev);
    kprintln!(
        "vioblk{}: {} sectors ({} MiB)",
        instno,
        capacity,
        capacity * SECTOR_SIZE as u64 / (1 << 20)
    );
}
