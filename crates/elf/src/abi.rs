//! ELF ABI constants (System V gABI subset).

/// Size of the `e_ident` array.
pub const EI_NIDENT: usize = 16;
/// Index of the file class byte in `e_ident`.
pub const EI_CLASS: usize = 4;
/// Index of the data encoding byte in `e_ident`.
pub const EI_DATA: usize = 5;
/// Index of the file version byte in `e_ident`.
pub const EI_VERSION: usize = 6;

/// ELF magic bytes.
pub const ELFMAG: [u8; 4] = [0x7F, b'E', b'L', b'F'];
/// 64-bit object file class.
pub const ELFCLASS64: u8 = 2;
/// Two's complement little-endian data encoding.
pub const ELFDATA2LSB: u8 = 1;
/// Current ELF version.
pub const EV_CURRENT: u8 = 1;

/// Executable file type.
pub const ET_EXEC: u16 = 2;

/// Loadable program segment.
pub const PT_LOAD: u32 = 1;

/// Executable segment flag.
pub const PF_X: u32 = 0x1;
/// Writable segment flag.
pub const PF_W: u32 = 0x2;
/// Readable segment flag.
pub const PF_R: u32 = 0x4;

/// RISC-V machine type.
pub const EM_RISCV: u16 = 243;

/// Size in bytes of the ELF64 file header.
pub const EHDR_SIZE: usize = 64;
/// Size in bytes of one ELF64 program header.
pub const PHDR_SIZE: usize = 56;
