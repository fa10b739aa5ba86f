//! ELF loading into the active address space.
//!
//! Accepts 64-bit little-endian `ET_EXEC` images for RISC-V whose loadable
//! segments fall inside the user region. Segments are mapped writable for
//! copying, then re-protected to their requested permissions.

use elf::{abi, Elf64Header, Elf64Phdr, ElfError};
use riscv::instructions::fence_i;

use crate::config::{UMEM_END_VMA, UMEM_START_VMA};
use crate::error::{Error, Result};
use crate::io::IoRef;
use crate::mm::{self, page::EntryFlags};

/// Loads the executable in `exe` into the active address space and returns
/// its entry point.
pub fn elf_load(exe: &IoRef) -> Result<usize> {
    let mut hdr_buf = [0u8; abi::EHDR_SIZE];
    if exe.read_at(0, &mut hdr_buf)? != hdr_buf.len() {
        return Err(Error::Io);
    }

    let hdr = Elf64Header::parse(&hdr_buf).map_err(map_elf_error)?;
    hdr.check_exec_for(abi::EM_RISCV).map_err(map_elf_error)?;

    for i in 0..hdr.e_phnum as usize {
        let mut ph_buf = [0u8; abi::PHDR_SIZE];
        if exe.read_at(hdr.phdr_offset(i), &mut ph_buf)? != ph_buf.len() {
            return Err(Error::Io);
        }

        let ph = Elf64Phdr::parse(&ph_buf).map_err(map_elf_error)?;
        if !ph.is_load() {
            continue;
        }

        load_segment(exe, &ph)?;
    }

    // The instruction stream changed under the CPU's feet.
    fence_i();

    Ok(hdr.e_entry as usize)
}

fn load_segment(exe: &IoRef, ph: &Elf64Phdr) -> Result<()> {
    if ph.p_filesz > ph.p_memsz {
        return Err(Error::Invalid);
    }
    if ph.p_memsz == 0 {
        return Ok(());
    }

    let vaddr = ph.p_vaddr as usize;
    let memsz = ph.p_memsz as usize;
    let end = vaddr.checked_add(memsz).ok_or(Error::Invalid)?;

    if vaddr < UMEM_START_VMA || end > UMEM_END_VMA {
        return Err(Error::Invalid);
    }

    let flags = segment_flags(ph);

    // Map the covering page range writable so the copy below can land, then
    // drop down to the requested permissions.
    let map_start = vaddr & !(crate::config::PAGE_SIZE - 1);
    let map_len = end - map_start;
    mm::alloc_and_map_range(map_start, map_len, flags | EntryFlags::WRITE);

    // SAFETY: the range was just mapped writable in the active space, and
    // SUM permits supervisor stores to user pages
    let dst = unsafe { core::slice::from_raw_parts_mut(vaddr as *mut u8, ph.p_filesz as usize) };
    if exe.read_at(ph.p_offset, dst)? != dst.len() {
        return Err(Error::Io);
    }

    // Zero the BSS tail. Fresh pages are already zeroed, so this only
    // matters when file data and BSS share a page.
    if ph.p_filesz < ph.p_memsz {
        // SAFETY: within the mapped segment range
        unsafe {
            core::ptr::write_bytes(
                (vaddr + ph.p_filesz as usize) as *mut u8,
                0,
                (ph.p_memsz - ph.p_filesz) as usize,
            );
        }
    }

    if !flags.contains(EntryFlags::WRITE) {
        mm::set_range_flags(map_start, map_len, flags);
    }

    Ok(())
}

fn segment_flags(ph: &Elf64Phdr) -> EntryFlags {
    let mut flags = EntryFlags::USER;
    if ph.is_readable() {
        flags |= EntryFlags::READ;
    }
    if ph.is_writable() {
        flags |= EntryFlags::WRITE;
    }
    if ph.is_executable() {
        flags |= EntryFlags::EXEC;
    }
    flags
}

fn map_elf_error(e: ElfError) -> Error {
    match e {
        ElfError::BadMagic => Error::BadFmt,
        _ => Error::Invalid,
    }
}
