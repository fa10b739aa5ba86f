//! Sv39 page tables and their entries.
//!
//! All three levels are homogeneous 512-entry tables of 8-byte entries. An
//! entry with any of R/W/X set is a leaf and terminates translation.

use core::fmt;

use bitflags::bitflags;

use crate::config::PAGE_ORDER;

const PTE_PPN_MASK: u64 = 0xfff_ffff_ffff;
const PTE_PPN_OFFSET: u64 = 10;

/// Number of entries in one page table.
pub const PTE_CNT: usize = 512;

/// Number of page-table levels in Sv39.
pub const PAGE_LEVELS: usize = 3;

bitflags! {
    /// Bitfields of a page table entry.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    #[repr(transparent)]
    pub struct EntryFlags: u64 {
        /// If set, this entry represents a valid mapping.
        const VALID = 1 << 0;
        /// If set, this page contains readable memory.
        const READ = 1 << 1;
        /// If set, this page contains writable memory.
        const WRITE = 1 << 2;
        /// If set, this page contains executable memory.
        const EXEC = 1 << 3;
        /// If set, this page can be accessed in U-mode.
        const USER = 1 << 4;
        /// If set, this mapping is global and survives address-space resets.
        const GLOBAL = 1 << 5;
        /// If set, this page has been accessed by the CPU.
        const ACCESS = 1 << 6;
        /// If set, this page has been written by the CPU.
        const DIRTY = 1 << 7;

        /// If set, this page contains read-write memory.
        const RW = Self::READ.bits() | Self::WRITE.bits();
        /// If set, this page contains read-exec memory.
        const RX = Self::READ.bits() | Self::EXEC.bits();
        /// Mask of the permission bits a caller may request.
        const RWXUG = Self::READ.bits()
            | Self::WRITE.bits()
            | Self::EXEC.bits()
            | Self::USER.bits()
            | Self::GLOBAL.bits();
    }
}

/// An entry in a [`PageTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct Entry(u64);

impl Entry {
    /// Creates a new empty, non-valid page entry.
    pub const fn empty() -> Entry {
        Entry(0)
    }

    /// Creates a leaf entry mapping the page at `ppn` with `V|A|D` plus the
    /// requested permission flags.
    pub fn leaf(ppn: u64, flags: EntryFlags) -> Entry {
        let flags = (flags & EntryFlags::RWXUG)
            | EntryFlags::VALID
            | EntryFlags::ACCESS
            | EntryFlags::DIRTY;
        Entry(((ppn & PTE_PPN_MASK) << PTE_PPN_OFFSET) | flags.bits())
    }

    /// Creates a non-leaf entry pointing to the table at `ppn`.
    pub fn table(ppn: u64, flags: EntryFlags) -> Entry {
        let flags = (flags & EntryFlags::GLOBAL) | EntryFlags::VALID;
        Entry(((ppn & PTE_PPN_MASK) << PTE_PPN_OFFSET) | flags.bits())
    }

    /// Returns whether the mapping contained in this entry is valid.
    pub fn is_valid(&self) -> bool {
        self.flags().contains(EntryFlags::VALID)
    }

    /// Returns whether this entry is a leaf rather than a pointer to another
    /// page table.
    pub fn is_leaf(&self) -> bool {
        self.flags()
            .intersects(EntryFlags::READ | EntryFlags::WRITE | EntryFlags::EXEC)
    }

    /// Returns whether the mapping in this entry is global.
    pub fn is_global(&self) -> bool {
        self.flags().contains(EntryFlags::GLOBAL)
    }

    /// Returns whether the page pointed to by this entry is U-mode accessible.
    pub fn is_user(&self) -> bool {
        self.flags().contains(EntryFlags::USER)
    }

    /// Returns the flags currently set on this entry.
    pub fn flags(&self) -> EntryFlags {
        EntryFlags::from_bits_truncate(self.0)
    }

    /// Returns the PPN portion of this entry.
    pub fn ppn(&self) -> u64 {
        (self.0 >> PTE_PPN_OFFSET) & PTE_PPN_MASK
    }

    /// Returns the physical address of the page or table this entry maps.
    pub fn paddr(&self) -> usize {
        (self.ppn() as usize) << PAGE_ORDER
    }

    /// Resets the bits of this entry to zero.
    pub fn clear(&mut self) {
        self.0 = 0;
    }

    /// Rewrites only the permission bits, keeping the PPN and V|A|D intact.
    pub fn set_permissions(&mut self, flags: EntryFlags) {
        *self = Entry::leaf(self.ppn(), flags);
    }
}

impl fmt::Display for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let fl = self.flags();
        write!(f, "phy: 0x{:016x} ", self.paddr())?;
        write!(
            f,
            "{}{}{}{}{}",
            if fl.contains(EntryFlags::READ) { 'r' } else { '-' },
            if fl.contains(EntryFlags::WRITE) { 'w' } else { '-' },
            if fl.contains(EntryFlags::EXEC) { 'x' } else { '-' },
            if fl.contains(EntryFlags::USER) { 'u' } else { '-' },
            if fl.contains(EntryFlags::GLOBAL) { 'g' } else { '-' },
        )
    }
}

/// A page table for virtual address translation.
#[derive(Clone, Copy)]
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [Entry; PTE_CNT],
}

impl PageTable {
    /// Creates a new page table with cleared entries.
    pub const fn new() -> Self {
        Self {
            entries: [Entry::empty(); PTE_CNT],
        }
    }

    /// Returns a reference to an entry in this page table.
    pub fn entry(&self, i: usize) -> &Entry {
        &self.entries[i]
    }

    /// Returns a mutable reference to an entry in this page table.
    pub fn entry_mut(&mut self, i: usize) -> &mut Entry {
        &mut self.entries[i]
    }

    /// Returns an iterator over the entries in this page table.
    pub fn iter(&self) -> core::slice::Iter<'_, Entry> {
        self.entries.iter()
    }

    /// Returns a mutable iterator over the entries in this page table.
    pub fn iter_mut(&mut self) -> core::slice::IterMut<'_, Entry> {
        self.entries.iter_mut()
    }

    /// Resets all the entries of this page table to zero.
    pub fn clear(&mut self) {
        for entry in &mut self.entries {
            entry.clear();
        }
    }
}

impl Default for PageTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Index into the level-`lvl` page table for virtual address `vma`.
pub fn vpn(lvl: usize, vma: usize) -> usize {
    (vma >> (PAGE_ORDER + 9 * lvl)) & (PTE_CNT - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leaf_entries_carry_permissions_and_ppn() {
        let e = Entry::leaf(0x80201, EntryFlags::READ | EntryFlags::USER);

        assert!(e.is_valid());
        assert!(e.is_leaf());
        assert!(e.is_user());
        assert!(!e.is_global());
        assert_eq!(e.ppn(), 0x80201);
        assert_eq!(e.paddr(), 0x80201 << PAGE_ORDER);
    }

    #[test]
    fn table_entries_are_not_leaves() {
        let e = Entry::table(0x80300, EntryFlags::GLOBAL);

        assert!(e.is_valid());
        assert!(!e.is_leaf());
        assert!(e.is_global());
    }

    #[test]
    fn permission_rewrite_keeps_ppn() {
        let mut e = Entry::leaf(0x1234, EntryFlags::RW | EntryFlags::USER);
        e.set_permissions(EntryFlags::READ | EntryFlags::USER);

        assert_eq!(e.ppn(), 0x1234);
        assert!(!e.flags().contains(EntryFlags::WRITE));
        assert!(e.is_user());
    }

    #[test]
    fn vpn_selects_nine_bit_groups() {
        let vma = 0xC000_0000usize + (3 << 21) + (5 << 12) + 7;
        assert_eq!(vpn(2, vma), 3);
        assert_eq!(vpn(1, vma), 3);
        assert_eq!(vpn(0, vma), 5);
    }
}
