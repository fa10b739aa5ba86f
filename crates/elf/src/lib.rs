//! Minimal ELF64 little-endian parser.
//! Supports reading the ELF header and decoding program headers from raw bytes,
//! so callers can stream the file instead of holding it in memory.
//!
//! Safety model:
//! - Uses bounds-checked slicing + manual LE decoding.
//! - No unsafe required.

#![no_std]

pub mod abi;

/// Errors produced while parsing or validating an ELF image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElfError {
    /// The provided buffer is too small for the structure being decoded.
    TooSmall,
    /// The file does not start with the `\x7FELF` magic.
    BadMagic,
    /// The file is not a 64-bit ELF.
    NotElf64,
    /// The file is not little-endian.
    NotLittleEndian,
    /// The file does not use the current ELF version.
    BadVersion,
    /// The file is not an `ET_EXEC` executable.
    NotExecutable,
    /// The file targets a different machine than the running one.
    WrongMachine,
    /// The program header entry size does not match ELF64.
    BadPhEntSize,
}

/// Decoded ELF64 file header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Elf64Header {
    /// Object file type.
    pub e_type: u16,
    /// Target machine.
    pub e_machine: u16,
    /// Object file version.
    pub e_version: u32,
    /// Entry point virtual address.
    pub e_entry: u64,
    /// File offset of the program header table.
    pub e_phoff: u64,
    /// Size of one program header table entry.
    pub e_phentsize: u16,
    /// Number of program header table entries.
    pub e_phnum: u16,
}

impl Elf64Header {
    /// Decodes and validates the identification prefix of an ELF64 header.
    ///
    /// The magic, class, endianness and version checks of the `e_ident` array
    /// happen here; file type and machine checks are separate (see
    /// [`Elf64Header::check_exec_for`]) so callers can distinguish a non-ELF
    /// file from an ELF file they cannot run.
    pub fn parse(data: &[u8]) -> Result<Self, ElfError> {
        if data.len() < abi::EHDR_SIZE {
            return Err(ElfError::TooSmall);
        }

        if data[0..4] != abi::ELFMAG {
            return Err(ElfError::BadMagic);
        }
        if data[abi::EI_CLASS] != abi::ELFCLASS64 {
            return Err(ElfError::NotElf64);
        }
        if data[abi::EI_DATA] != abi::ELFDATA2LSB {
            return Err(ElfError::NotLittleEndian);
        }
        if data[abi::EI_VERSION] != abi::EV_CURRENT {
            return Err(ElfError::BadVersion);
        }

        // Fixed offsets of the ELF64 header fields (System V gABI):
        // 0x00 e_ident[16], 0x10 e_type, 0x12 e_machine, 0x14 e_version,
        // 0x18 e_entry, 0x20 e_phoff, 0x36 e_phentsize, 0x38 e_phnum.
        let hdr = Self {
            e_type: read_u16_le(data, 0x10),
            e_machine: read_u16_le(data, 0x12),
            e_version: read_u32_le(data, 0x14),
            e_entry: read_u64_le(data, 0x18),
            e_phoff: read_u64_le(data, 0x20),
            e_phentsize: read_u16_le(data, 0x36),
            e_phnum: read_u16_le(data, 0x38),
        };

        if hdr.e_phnum != 0 && hdr.e_phentsize as usize != abi::PHDR_SIZE {
            return Err(ElfError::BadPhEntSize);
        }

        Ok(hdr)
    }

    /// Checks that this image is an executable for the given machine.
    pub fn check_exec_for(&self, machine: u16) -> Result<(), ElfError> {
        if self.e_version != abi::EV_CURRENT as u32 {
            return Err(ElfError::BadVersion);
        }
        if self.e_machine != machine {
            return Err(ElfError::WrongMachine);
        }
        if self.e_type != abi::ET_EXEC {
            return Err(ElfError::NotExecutable);
        }
        Ok(())
    }

    /// Returns the file offset of the `i`-th program header.
    pub fn phdr_offset(&self, i: usize) -> u64 {
        self.e_phoff + (i as u64) * self.e_phentsize as u64
    }
}

/// Decoded ELF64 program header.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Elf64Phdr {
    /// Segment type.
    pub p_type: u32,
    /// Segment permission flags.
    pub p_flags: u32,
    /// File offset of the segment contents.
    pub p_offset: u64,
    /// Virtual address of the segment.
    pub p_vaddr: u64,
    /// Size of the segment contents in the file.
    pub p_filesz: u64,
    /// Size of the segment in memory.
    pub p_memsz: u64,
    /// Alignment constraint.
    pub p_align: u64,
}

impl Elf64Phdr {
    /// Decodes one program header from raw bytes.
    pub fn parse(data: &[u8]) -> Result<Self, ElfError> {
        if data.len() < abi::PHDR_SIZE {
            return Err(ElfError::TooSmall);
        }

        Ok(Self {
            p_type: read_u32_le(data, 0x00),
            p_flags: read_u32_le(data, 0x04),
            p_offset: read_u64_le(data, 0x08),
            p_vaddr: read_u64_le(data, 0x10),
            p_filesz: read_u64_le(data, 0x20),
            p_memsz: read_u64_le(data, 0x28),
            p_align: read_u64_le(data, 0x30),
        })
    }

    /// Returns whether this segment must be loaded into memory.
    pub fn is_load(&self) -> bool {
        self.p_type == abi::PT_LOAD
    }

    /// Returns whether this segment is readable.
    pub fn is_readable(&self) -> bool {
        (self.p_flags & abi::PF_R) != 0
    }

    /// Returns whether this segment is writable.
    pub fn is_writable(&self) -> bool {
        (self.p_flags & abi::PF_W) != 0
    }

    /// Returns whether this segment contains executable code.
    pub fn is_executable(&self) -> bool {
        (self.p_flags & abi::PF_X) != 0
    }
}

fn read_u16_le(data: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([data[off], data[off + 1]])
}

fn read_u32_le(data: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([data[off], data[off + 1], data[off + 2], data[off + 3]])
}

fn read_u64_le(data: &[u8], off: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&data[off..off + 8]);
    u64::from_le_bytes(b)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header() -> [u8; abi::EHDR_SIZE] {
        let mut h = [0u8; abi::EHDR_SIZE];
        h[0..4].copy_from_slice(&abi::ELFMAG);
        h[abi::EI_CLASS] = abi::ELFCLASS64;
        h[abi::EI_DATA] = abi::ELFDATA2LSB;
        h[abi::EI_VERSION] = abi::EV_CURRENT;
        h[0x10..0x12].copy_from_slice(&abi::ET_EXEC.to_le_bytes());
        h[0x12..0x14].copy_from_slice(&abi::EM_RISCV.to_le_bytes());
        h[0x14..0x18].copy_from_slice(&1u32.to_le_bytes());
        h[0x18..0x20].copy_from_slice(&0xC000_1000u64.to_le_bytes());
        h[0x20..0x28].copy_from_slice(&64u64.to_le_bytes());
        h[0x36..0x38].copy_from_slice(&(abi::PHDR_SIZE as u16).to_le_bytes());
        h[0x38..0x3A].copy_from_slice(&2u16.to_le_bytes());
        h
    }

    #[test]
    fn parses_valid_header() {
        let hdr = Elf64Header::parse(&sample_header()).unwrap();

        assert_eq!(hdr.e_entry, 0xC000_1000);
        assert_eq!(hdr.e_phoff, 64);
        assert_eq!(hdr.e_phnum, 2);
        assert!(hdr.check_exec_for(abi::EM_RISCV).is_ok());
    }

    #[test]
    fn rejects_bad_magic() {
        let mut h = sample_header();
        h[0] = 0x7E;
        assert_eq!(Elf64Header::parse(&h), Err(ElfError::BadMagic));
    }

    #[test]
    fn rejects_truncated_header() {
        let h = sample_header();
        assert_eq!(Elf64Header::parse(&h[..32]), Err(ElfError::TooSmall));
    }

    #[test]
    fn rejects_wrong_class_and_endianness() {
        let mut h = sample_header();
        h[abi::EI_CLASS] = 1; // ELFCLASS32
        assert_eq!(Elf64Header::parse(&h), Err(ElfError::NotElf64));

        let mut h = sample_header();
        h[abi::EI_DATA] = 2; // ELFDATA2MSB
        assert_eq!(Elf64Header::parse(&h), Err(ElfError::NotLittleEndian));
    }

    #[test]
    fn rejects_foreign_machine_and_type() {
        let mut h = sample_header();
        h[0x12..0x14].copy_from_slice(&62u16.to_le_bytes()); // EM_X86_64
        let hdr = Elf64Header::parse(&h).unwrap();
        assert_eq!(hdr.check_exec_for(abi::EM_RISCV), Err(ElfError::WrongMachine));

        let mut h = sample_header();
        h[0x10..0x12].copy_from_slice(&3u16.to_le_bytes()); // ET_DYN
        let hdr = Elf64Header::parse(&h).unwrap();
        assert_eq!(
            hdr.check_exec_for(abi::EM_RISCV),
            Err(ElfError::NotExecutable)
        );
    }

    #[test]
    fn rejects_bad_phentsize() {
        let mut h = sample_header();
        h[0x36..0x38].copy_from_slice(&32u16.to_le_bytes());
        assert_eq!(Elf64Header::parse(&h), Err(ElfError::BadPhEntSize));
    }

    #[test]
    fn parses_program_header() {
        let mut p = [0u8; abi::PHDR_SIZE];
        p[0x00..0x04].copy_from_slice(&abi::PT_LOAD.to_le_bytes());
        p[0x04..0x08].copy_from_slice(&(abi::PF_R | abi::PF_X).to_le_bytes());
        p[0x08..0x10].copy_from_slice(&0x1000u64.to_le_bytes());
        p[0x10..0x18].copy_from_slice(&0xC000_0000u64.to_le_bytes());
        p[0x20..0x28].copy_from_slice(&0x800u64.to_le_bytes());
        p[0x28..0x30].copy_from_slice(&0x1000u64.to_le_bytes());
        p[0x30..0x38].copy_from_slice(&0x1000u64.to_le_bytes());

        let ph = Elf64Phdr::parse(&p).unwrap();
        assert!(ph.is_load());
        assert!(ph.is_readable());
        assert!(!ph.is_writable());
        assert!(ph.is_executable());
        assert_eq!(ph.p_vaddr, 0xC000_0000);
        assert_eq!(ph.p_filesz, 0x800);
        assert_eq!(ph.p_memsz, 0x1000);
    }

    #[test]
    fn phdr_offsets_step_by_entsize() {
        let hdr = Elf64Header::parse(&sample_header()).unwrap();
        assert_eq!(hdr.phdr_offset(0), 64);
        assert_eq!(hdr.phdr_offset(1), 64 + abi::PHDR_SIZE as u64);
    }
}
