//! Address spaces.
//!
//! An address space is identified by an opaque [`MsTag`] encoding the paging
//! mode, an address-space id and the physical page number of the root table,
//! which is exactly what the hardware wants in `satp`. The kernel half of
//! every space is inherited from the boot table through global entries; the
//! user half lies between `UMEM_START_VMA` and `UMEM_END_VMA` and is private
//! to each space.

use core::sync::atomic::{AtomicU64, Ordering};

use riscv::registers::{Satp, SatpMode, Scause};

use crate::arch::trap::TrapFrame;
use crate::config::{PAGE_ORDER, PAGE_SIZE, UMEM_END_VMA, UMEM_START_VMA};
use crate::error::{Error, Result};
use crate::mm::page::{vpn, Entry, EntryFlags, PageTable, PAGE_LEVELS, PTE_CNT};
use crate::mm::{alloc_phys_page_zeroed, flush_tlb, free_phys_page};

const SATP_MODE_SHIFT: u64 = 60;
const SATP_ASID_SHIFT: u64 = 44;

const SCAUSE_INSTR_PAGE_FAULT: u64 = 12;
const SCAUSE_STORE_PAGE_FAULT: u64 = 15;

/// An opaque address-space tag: paging mode, asid and root-table PPN, in
/// `satp` layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsTag(u64);

impl MsTag {
    fn new(root_pa: usize, asid: u16) -> Self {
        MsTag(
            ((SatpMode::Sv39 as u64) << SATP_MODE_SHIFT)
                | ((asid as u64) << SATP_ASID_SHIFT)
                | ((root_pa >> PAGE_ORDER) as u64),
        )
    }

    /// Address-space id carried by this tag.
    pub fn asid(&self) -> u16 {
        ((self.0 >> SATP_ASID_SHIFT) & 0xffff) as u16
    }

    /// Physical address of the root page table.
    fn root_pa(&self) -> usize {
        ((self.0 & 0xfff_ffff_ffff) as usize) << PAGE_ORDER
    }

    fn root_ptab(&self) -> *mut PageTable {
        self.root_pa() as *mut PageTable
    }
}

static MAIN_MTAG: AtomicU64 = AtomicU64::new(0);

// Rolling asid counter; 0 is reserved for the kernel space.
static NEXT_ASID: AtomicU64 = AtomicU64::new(0);

pub(super) fn init_main_mspace(root_pa: usize) {
    let mtag = MsTag::new(root_pa, 0);
    MAIN_MTAG.store(mtag.0, Ordering::Relaxed);

    // SAFETY: the boot table direct-maps all of RAM and MMIO
    unsafe { Satp::write_raw(mtag.0) };
    flush_tlb();
}

/// Returns the tag of the kernel (boot) address space.
pub fn main_mspace() -> MsTag {
    MsTag(MAIN_MTAG.load(Ordering::Relaxed))
}

/// Returns the tag of the currently active address space.
pub fn active_mspace() -> MsTag {
    MsTag(Satp::read_raw())
}

/// Installs `mtag` as the active address space and flushes the TLB.
/// Returns the previously active tag.
pub fn switch_mspace(mtag: MsTag) -> MsTag {
    // SAFETY: tags are only ever built around valid root tables
    let prev = unsafe { Satp::swap_raw(mtag.0) };
    flush_tlb();
    MsTag(prev)
}

fn active_ptab() -> *mut PageTable {
    active_mspace().root_ptab()
}

fn fresh_asid() -> u16 {
    // Wraps past 1; 0 is reserved for the kernel space.
    (NEXT_ASID.fetch_add(1, Ordering::Relaxed) % 0xffff + 1) as u16
}

/// Allocates a zeroed page holding a fresh page table.
fn alloc_ptab() -> *mut PageTable {
    alloc_phys_page_zeroed() as *mut PageTable
}

// Root-table indices covering the user region.
fn user_root_range() -> core::ops::Range<usize> {
    vpn(2, UMEM_START_VMA)..vpn(2, UMEM_END_VMA - 1) + 1
}

/// Virtual address bits 63:38 must be all 0 or all 1.
fn wellformed(vma: usize) -> bool {
    let bits = (vma as isize) >> 38;
    bits == 0 || bits == -1
}

/// Performs a deep copy of the user portion of the active space and returns
/// a tag for the copy with a fresh asid.
///
/// Global entries are reproduced verbatim so the kernel half stays shared;
/// 4 KiB user leaves get private copies of their data pages; large-page user
/// leaves are shared directly.
pub fn clone_active_mspace() -> MsTag {
    let new_root = alloc_ptab();

    // SAFETY: the active root table is valid and identity-mapped
    let root = unsafe { &*active_ptab() };
    // SAFETY: freshly allocated, zeroed table
    let new = unsafe { &mut *new_root };

    for i in 0..PTE_CNT {
        let entry = *root.entry(i);
        if !entry.is_valid() {
            continue;
        }

        *new.entry_mut(i) = if entry.is_global() {
            entry
        } else {
            clone_entry(entry, PAGE_LEVELS - 1)
        };
    }

    MsTag::new(new_root as usize, fresh_asid())
}

fn clone_entry(entry: Entry, level: usize) -> Entry {
    if entry.is_leaf() {
        // Megapage and gigapage leaves are shared, 4 KiB leaves are copied.
        if level > 0 {
            return entry;
        }

        let copy = alloc_phys_page_zeroed();
        // SAFETY: both pages are identity-mapped and PAGE_SIZE long
        unsafe {
            core::ptr::copy_nonoverlapping(entry.paddr() as *const u8, copy, PAGE_SIZE);
        }
        return Entry::leaf((copy as usize >> PAGE_ORDER) as u64, entry.flags());
    }

    // SAFETY: non-leaf entries point to valid child tables
    let child = unsafe { &*(entry.paddr() as *const PageTable) };
    let new_child = alloc_ptab();
    // SAFETY: freshly allocated, zeroed table
    let new = unsafe { &mut *new_child };

    for j in 0..PTE_CNT {
        let e = *child.entry(j);
        if e.is_valid() {
            *new.entry_mut(j) = if e.is_global() {
                e
            } else {
                clone_entry(e, level - 1)
            };
        }
    }

    Entry::table((new_child as usize >> PAGE_ORDER) as u64, entry.flags())
}

/// Frees every non-global user data page and intermediate table of the
/// active space, leaving the kernel half intact.
pub fn reset_active_mspace() {
    // SAFETY: the active root table is valid and identity-mapped
    let root = unsafe { &mut *active_ptab() };

    for i in user_root_range() {
        let entry = root.entry_mut(i);
        if !entry.is_valid() || entry.is_global() {
            continue;
        }

        if entry.is_leaf() {
            // Shared large-page leaves are dropped without freeing.
            entry.clear();
            continue;
        }

        free_subtree(entry.paddr() as *mut PageTable, PAGE_LEVELS - 2);
        entry.clear();
    }

    flush_tlb();
}

/// Frees the data pages and tables below `ptab`, then `ptab` itself.
fn free_subtree(ptab: *mut PageTable, level: usize) {
    // SAFETY: the table was allocated by map_page or clone_entry
    let table = unsafe { &mut *ptab };

    for j in 0..PTE_CNT {
        let entry = *table.entry(j);
        if !entry.is_valid() || entry.is_global() {
            continue;
        }

        if entry.is_leaf() {
            if level == 0 {
                free_phys_page(entry.paddr() as *mut u8);
            }
        } else {
            free_subtree(entry.paddr() as *mut PageTable, level - 1);
        }
    }

    free_phys_page(ptab as *mut u8);
}

/// Resets the active space, switches back to the kernel space, and frees the
/// root table. Returns the kernel space tag.
pub fn discard_active_mspace() -> MsTag {
    reset_active_mspace();

    let main = main_mspace();
    let old = switch_mspace(main);
    if old.root_pa() != main.root_pa() {
        free_phys_page(old.root_pa() as *mut u8);
    }

    main
}

/// Maps the page at physical address `pp` at `vma` in the active space,
/// allocating intermediate tables as needed.
pub fn map_page(vma: usize, pp: *mut u8, flags: EntryFlags) {
    assert!(vma % PAGE_SIZE == 0);
    assert!(wellformed(vma));

    // SAFETY: the active root table is valid and identity-mapped
    let mut table = unsafe { &mut *active_ptab() };

    for lvl in (1..PAGE_LEVELS).rev() {
        let entry = table.entry_mut(vpn(lvl, vma));
        if !entry.is_valid() {
            let child = alloc_ptab();
            *entry = Entry::table((child as usize >> PAGE_ORDER) as u64, EntryFlags::empty());
        }
        assert!(!entry.is_leaf(), "mapping into a large page");
        // SAFETY: the entry points to a valid child table
        table = unsafe { &mut *(entry.paddr() as *mut PageTable) };
    }

    *table.entry_mut(vpn(0, vma)) = Entry::leaf((pp as usize >> PAGE_ORDER) as u64, flags);
    flush_tlb();
}

/// Maps the physical range starting at `pp` over `[vma, vma+size)`.
pub fn map_range(vma: usize, size: usize, pp: *mut u8, flags: EntryFlags) {
    let size = round_up(size);
    let mut off = 0;
    while off < size {
        // SAFETY: offsetting within the caller's physical range
        map_page(vma + off, unsafe { pp.add(off) }, flags);
        off += PAGE_SIZE;
    }
}

/// Allocates fresh zeroed pages and maps them over `[vma, vma+size)`.
pub fn alloc_and_map_range(vma: usize, size: usize, flags: EntryFlags) {
    let size = round_up(size);
    let mut off = 0;
    while off < size {
        map_page(vma + off, alloc_phys_page_zeroed(), flags);
        off += PAGE_SIZE;
    }
}

/// Rewrites only the permission bits of the leaves covering the range.
pub fn set_range_flags(vma: usize, size: usize, flags: EntryFlags) {
    let size = round_up(size);
    let mut off = 0;
    while off < size {
        let entry = walk_leaf(vma + off).expect("range is mapped");
        // SAFETY: walk_leaf returns a live level-0 entry of the active space
        unsafe { (*entry).set_permissions(flags) };
        off += PAGE_SIZE;
    }
    flush_tlb();
}

/// Removes the leaves covering the range and frees their data pages.
pub fn unmap_and_free_range(vma: usize, size: usize) {
    let size = round_up(size);
    let mut off = 0;
    while off < size {
        let entry = walk_leaf(vma + off).expect("range is mapped");
        // SAFETY: walk_leaf returns a live level-0 entry of the active space
        unsafe {
            free_phys_page((*entry).paddr() as *mut u8);
            (*entry).clear();
        }
        off += PAGE_SIZE;
    }
    flush_tlb();
}

/// Finds the level-0 entry mapping `vma` in the active space.
fn walk_leaf(vma: usize) -> Option<*mut Entry> {
    // SAFETY: the active root table is valid and identity-mapped
    let mut table = unsafe { &mut *active_ptab() };

    for lvl in (1..PAGE_LEVELS).rev() {
        let entry = table.entry_mut(vpn(lvl, vma));
        if !entry.is_valid() || entry.is_leaf() {
            return None;
        }
        // SAFETY: the entry points to a valid child table
        table = unsafe { &mut *(entry.paddr() as *mut PageTable) };
    }

    let entry = table.entry_mut(vpn(0, vma));
    entry.is_valid().then(|| entry as *mut Entry)
}

/// Translates `vma` through the active page table, returning the mapping
/// leaf at whatever level translation terminates.
fn translate(vma: usize) -> Option<Entry> {
    // SAFETY: the active root table is valid and identity-mapped
    let mut table = unsafe { &*active_ptab() };

    for lvl in (0..PAGE_LEVELS).rev() {
        let entry = *table.entry(vpn(lvl, vma));
        if !entry.is_valid() {
            return None;
        }
        if entry.is_leaf() {
            return Some(entry);
        }
        if lvl == 0 {
            return None;
        }
        // SAFETY: the entry points to a valid child table
        table = unsafe { &*(entry.paddr() as *const PageTable) };
    }

    None
}

/// Handles a page fault taken in U-mode at `vma`.
///
/// Faults inside the user region demand-allocate a zeroed page mapped U|R,
/// plus W for store faults and X for instruction-fetch faults. Returns
/// whether the fault was handled.
pub fn handle_umode_page_fault(_tf: &TrapFrame, vma: usize) -> bool {
    if !(UMEM_START_VMA..UMEM_END_VMA).contains(&vma) {
        return false;
    }

    let vma = vma & !(PAGE_SIZE - 1);

    let mut flags = EntryFlags::READ | EntryFlags::USER;
    match Scause::read() {
        SCAUSE_STORE_PAGE_FAULT => flags |= EntryFlags::WRITE,
        SCAUSE_INSTR_PAGE_FAULT => flags |= EntryFlags::EXEC,
        _ => (),
    }

    map_page(vma, alloc_phys_page_zeroed(), flags);
    true
}

/// Checks that every page covered by `[ptr, ptr+len)` is mapped in the
/// active space with at least the requested permission bits plus U.
pub fn validate_vptr(ptr: usize, len: usize, flags: EntryFlags) -> Result<()> {
    if len == 0 {
        return Ok(());
    }

    let end = ptr.checked_add(len).ok_or(Error::Invalid)?;
    if !wellformed(ptr) || !wellformed(end - 1) {
        return Err(Error::Invalid);
    }

    let need = (flags & EntryFlags::RWXUG) | EntryFlags::USER;

    let mut page = ptr & !(PAGE_SIZE - 1);
    while page < end {
        match translate(page) {
            Some(e) if e.flags().contains(need) => (),
            _ => return Err(Error::Access),
        }
        page += PAGE_SIZE;
    }

    Ok(())
}

/// Validates a NUL-terminated user string page by page, dereferencing each
/// page only after it has been checked. Returns the string length, not
/// counting the NUL.
pub fn validate_vstr(ptr: usize, maxlen: usize, flags: EntryFlags) -> Result<usize> {
    let mut len = 0;

    while len < maxlen {
        let addr = ptr.checked_add(len).ok_or(Error::Invalid)?;
        validate_vptr(addr, 1, flags)?;

        let page_end = (addr & !(PAGE_SIZE - 1)) + PAGE_SIZE;
        let span = (page_end - addr).min(maxlen - len);

        // SAFETY: the page holding [addr, addr+span) was just validated
        let bytes = unsafe { core::slice::from_raw_parts(addr as *const u8, span) };
        if let Some(nul) = bytes.iter().position(|&b| b == 0) {
            return Ok(len + nul);
        }
        len += span;
    }

    Err(Error::Access)
}

fn round_up(size: usize) -> usize {
    (size + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}
