//! Memory management facilities.
//!
//! Physical pages are tracked as a linked list of free chunks, where each
//! chunk consists of several consecutive pages. Initially all free pages form
//! a single large chunk; allocation carves pages off the first chunk that is
//! big enough.

use core::cell::UnsafeCell;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, Ordering};

use riscv::instructions::sfence_vma;
use riscv::registers::{Sstatus, SstatusFlags};

use crate::arch::IntrCell;
use crate::config::{HEAP_SIZE, PAGE_SIZE, RAM_END_PMA, RAM_START_PMA};
use crate::mm::page::{vpn, Entry, EntryFlags, PageTable};

pub mod heap;
pub mod mspace;
pub mod page;

pub use mspace::{
    active_mspace, alloc_and_map_range, clone_active_mspace, discard_active_mspace,
    handle_umode_page_fault, main_mspace, map_page, map_range, reset_active_mspace,
    set_range_flags, switch_mspace, unmap_and_free_range, validate_vptr, validate_vstr, MsTag,
};

// Megapage size: 512 4K pages.
const MEGA_SIZE: usize = (1 << 9) * PAGE_SIZE;
// Gigapage size: 512 megapages.
const GIGA_SIZE: usize = (1 << 9) * MEGA_SIZE;

// Defined in kernel.ld
#[allow(non_upper_case_globals)]
extern "C" {
    static _kimg_start: u8;
    static _stext: u8;
    static _etext: u8;
    static _srodata: u8;
    static _erodata: u8;
    static _sdata: u8;
    static _kimg_end: u8;
}

/// Host stand-ins for the linker-provided symbols, so the library links
/// off-target.
#[cfg(not(target_arch = "riscv64"))]
#[allow(non_upper_case_globals)]
mod host_syms {
    #[no_mangle]
    static _kimg_start: u8 = 0;
    #[no_mangle]
    static _stext: u8 = 0;
    #[no_mangle]
    static _etext: u8 = 0;
    #[no_mangle]
    static _srodata: u8 = 0;
    #[no_mangle]
    static _erodata: u8 = 0;
    #[no_mangle]
    static _sdata: u8 = 0;
    #[no_mangle]
    static _kimg_end: u8 = 0;
}

static MEMORY_INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Section of consecutive free physical pages. The header lives in the first
/// bytes of the chunk's first page.
struct PageChunk {
    next: Option<NonNull<PageChunk>>,
    pagecnt: usize,
}

struct FreeList {
    head: Option<NonNull<PageChunk>>,
}

// SAFETY: chunk pointers reference identity-mapped RAM owned by the list
unsafe impl Send for FreeList {}

static FREE_LIST: IntrCell<FreeList> = IntrCell::new(FreeList { head: None });

/// Statically allocated boot page tables.
#[repr(transparent)]
struct BootTable(UnsafeCell<PageTable>);

// SAFETY: only touched single-threaded during memory_init, read-only after
unsafe impl Sync for BootTable {}

impl BootTable {
    const fn new() -> Self {
        Self(UnsafeCell::new(PageTable::new()))
    }

    fn paddr(&self) -> usize {
        self.0.get() as usize
    }
}

static MAIN_PT2: BootTable = BootTable::new();
static MAIN_PT1: BootTable = BootTable::new();
static MAIN_PT0: BootTable = BootTable::new();

/// Returns whether [`memory_init`] has completed.
pub fn memory_initialized() -> bool {
    MEMORY_INITIALIZED.load(Ordering::Relaxed)
}

/// Sets up the boot page table, enables paging, and hands the remaining RAM
/// to the kernel heap and the page-frame pool.
///
/// The direct mapping installed here covers all of physical RAM and the MMIO
/// region with global entries:
///
/// - `0` to `RAM_START`: RW gigapages (MMIO region)
/// - kernel image: RX/R/RW pages based on section
/// - image end to second megapage boundary: RW pages (heap)
/// - remaining RAM: RW megapages (free page pool)
pub fn memory_init() {
    // SAFETY: populated by the linker script
    let (kimg_start, text_start, text_end, rodata_start, rodata_end, data_start, kimg_end) = unsafe {
        (
            &_kimg_start as *const _ as usize,
            &_stext as *const _ as usize,
            &_etext as *const _ as usize,
            &_srodata as *const _ as usize,
            &_erodata as *const _ as usize,
            &_sdata as *const _ as usize,
            &_kimg_end as *const _ as usize,
        )
    };

    kprintln!(
        "           RAM: [{:#x},{:#x}): {} MB",
        RAM_START_PMA,
        RAM_END_PMA,
        (RAM_END_PMA - RAM_START_PMA) / 1024 / 1024
    );
    kprintln!("  Kernel image: [{:#x},{:#x})", kimg_start, kimg_end);

    // The per-page mapped region (image + heap) must fit the megapage that
    // the image is loaded into.
    let kimg_mega = kimg_start & !(MEGA_SIZE - 1);
    if kimg_end + HEAP_SIZE > kimg_mega + MEGA_SIZE {
        panic!("kernel image and heap do not fit in one megapage");
    }

    // SAFETY: single-threaded at boot, paging still off
    let pt2 = unsafe { &mut *MAIN_PT2.0.get() };
    let pt1 = unsafe { &mut *MAIN_PT1.0.get() };
    let pt0 = unsafe { &mut *MAIN_PT0.0.get() };

    // Identity mapping of the MMIO region as gigapages.
    let mut pma = 0;
    while pma < RAM_START_PMA {
        *pt2.entry_mut(vpn(2, pma)) = Entry::leaf(
            (pma >> 12) as u64,
            EntryFlags::RW | EntryFlags::GLOBAL,
        );
        pma += GIGA_SIZE;
    }

    // The gigarange holding RAM gets a second-level subtable, and the
    // megarange holding the kernel image a third-level one.
    *pt2.entry_mut(vpn(2, RAM_START_PMA)) = Entry::table(
        (MAIN_PT1.paddr() >> 12) as u64,
        EntryFlags::GLOBAL,
    );
    *pt1.entry_mut(vpn(1, kimg_mega)) = Entry::table(
        (MAIN_PT0.paddr() >> 12) as u64,
        EntryFlags::GLOBAL,
    );

    // Kernel image mapped as individual pages with section permissions.
    let mut pp = text_start;
    while pp < text_end {
        *pt0.entry_mut(vpn(0, pp)) =
            Entry::leaf((pp >> 12) as u64, EntryFlags::RX | EntryFlags::GLOBAL);
        pp += PAGE_SIZE;
    }
    let mut pp = rodata_start;
    while pp < rodata_end {
        *pt0.entry_mut(vpn(0, pp)) =
            Entry::leaf((pp >> 12) as u64, EntryFlags::READ | EntryFlags::GLOBAL);
        pp += PAGE_SIZE;
    }
    let mut pp = data_start;
    while pp < kimg_mega + MEGA_SIZE {
        *pt0.entry_mut(vpn(0, pp)) =
            Entry::leaf((pp >> 12) as u64, EntryFlags::RW | EntryFlags::GLOBAL);
        pp += PAGE_SIZE;
    }

    // Remaining RAM mapped as RW megapages.
    let mut pp = kimg_mega + MEGA_SIZE;
    while pp < RAM_END_PMA {
        *pt1.entry_mut(vpn(1, pp)) =
            Entry::leaf((pp >> 12) as u64, EntryFlags::RW | EntryFlags::GLOBAL);
        pp += MEGA_SIZE;
    }

    // Enable paging; this part always makes me nervous.
    mspace::init_main_mspace(MAIN_PT2.paddr());

    // Heap gets the pages right after the image; everything beyond the heap
    // up to the end of RAM becomes the free page pool.
    let heap_start = kimg_end;
    let heap_end = heap_start + HEAP_SIZE;
    heap::heap_init(heap_start, heap_end);

    kprintln!(
        "Heap allocator: [{:#x},{:#x}): {} KB free",
        heap_start,
        heap_end,
        (heap_end - heap_start) / 1024
    );

    let free_pages = (RAM_END_PMA - heap_end) / PAGE_SIZE;
    FREE_LIST.with(|list| {
        // SAFETY: the pool region is unused RAM covered by the direct map
        let chunk = unsafe {
            let p = heap_end as *mut PageChunk;
            p.write(PageChunk {
                next: None,
                pagecnt: free_pages,
            });
            NonNull::new_unchecked(p)
        };
        list.head = Some(chunk);
    });

    kprintln!("Free page pool: {} pages", free_pages);

    // Allow supervisor access to user memory. Validation happens against the
    // page tables before any user pointer is dereferenced.
    // SAFETY: expands permissions only
    unsafe { Sstatus::set(SstatusFlags::SUM) };

    MEMORY_INITIALIZED.store(true, Ordering::Relaxed);
}

/// Allocates `cnt` contiguous physical pages from the first chunk that can
/// satisfy the request.
///
/// # Panics
///
/// Panics when no chunk is large enough; there is no backing store to evict
/// to.
pub fn alloc_phys_pages(cnt: usize) -> *mut u8 {
    assert!(cnt > 0);

    FREE_LIST.with(|list| {
        let mut prev: Option<NonNull<PageChunk>> = None;
        let mut curr = list.head;

        while let Some(chunk) = curr {
            // SAFETY: chunk headers live in free pages owned by the list
            let (next, pagecnt) = unsafe { (chunk.as_ref().next, chunk.as_ref().pagecnt) };

            if pagecnt >= cnt {
                let replacement = if pagecnt == cnt {
                    next
                } else {
                    // Carve off the prefix and rewrite the header behind it.
                    // SAFETY: the remainder lies within the same free chunk
                    let rest = unsafe {
                        let p = (chunk.as_ptr() as *mut u8).add(cnt * PAGE_SIZE) as *mut PageChunk;
                        p.write(PageChunk {
                            next,
                            pagecnt: pagecnt - cnt,
                        });
                        NonNull::new_unchecked(p)
                    };
                    Some(rest)
                };

                match prev {
                    // SAFETY: prev is a live chunk header
                    Some(mut p) => unsafe { p.as_mut().next = replacement },
                    None => list.head = replacement,
                }

                return chunk.as_ptr() as *mut u8;
            }

            prev = curr;
            curr = next;
        }

        panic!("out of physical memory");
    })
}

/// Returns `cnt` pages starting at `pp` to the allocator.
pub fn free_phys_pages(pp: *mut u8, cnt: usize) {
    assert!(!pp.is_null() && pp as usize % PAGE_SIZE == 0);
    assert!(cnt > 0);

    FREE_LIST.with(|list| {
        // SAFETY: the caller hands back pages it owns; the header is written
        // into the first page of the chunk
        let chunk = unsafe {
            let p = pp as *mut PageChunk;
            p.write(PageChunk {
                next: list.head,
                pagecnt: cnt,
            });
            NonNull::new_unchecked(p)
        };
        list.head = Some(chunk);
    });
}

/// Allocates a single physical page.
pub fn alloc_phys_page() -> *mut u8 {
    alloc_phys_pages(1)
}

/// Allocates a single zero-filled physical page.
pub fn alloc_phys_page_zeroed() -> *mut u8 {
    let pp = alloc_phys_pages(1);
    // SAFETY: freshly allocated page
    unsafe { core::ptr::write_bytes(pp, 0, PAGE_SIZE) };
    pp
}

/// Returns a single page starting at `pp` to the allocator.
pub fn free_phys_page(pp: *mut u8) {
    free_phys_pages(pp, 1);
}

/// Sums the page counts of every free chunk.
pub fn free_phys_page_count() -> usize {
    FREE_LIST.with(|list| {
        let mut count = 0;
        let mut curr = list.head;
        while let Some(chunk) = curr {
            // SAFETY: chunk headers live in free pages owned by the list
            unsafe {
                count += chunk.as_ref().pagecnt;
                curr = chunk.as_ref().next;
            }
        }
        count
    })
}

/// Flushes the TLB after a mapping change.
pub(crate) fn flush_tlb() {
    sfence_vma();
}
