//! KTFS on-disk structures.
//!
//! All integers are little-endian and unsigned. Structures are decoded and
//! encoded field by field rather than transmuted, so the in-memory types stay
//! free of packing concerns.

use crate::FsError;

/// Filesystem block size in bytes.
pub const KTFS_BLKSZ: usize = 512;
/// Size of one inode on disk.
pub const KTFS_INOSZ: usize = 32;
/// Size of one directory entry on disk.
pub const KTFS_DENSZ: usize = 32;
/// Maximum length of a file name, excluding the terminating NUL.
pub const KTFS_MAX_FILENAME_LEN: usize = 29;
/// Number of direct block pointers in an inode.
pub const KTFS_NUM_DIRECT_DATA_BLOCKS: usize = 4;
/// Number of double-indirect block pointers in an inode.
pub const KTFS_NUM_DINDIRECT_BLOCKS: usize = 1;

/// Size of one on-disk block pointer.
pub const POINTER_BYTESIZE: usize = 4;
/// Number of block pointers held by one indirect block.
pub const PTRS_PER_BLOCK: usize = KTFS_BLKSZ / POINTER_BYTESIZE;
/// Number of inodes held by one inode-table block.
pub const INODES_PER_BLOCK: usize = KTFS_BLKSZ / KTFS_INOSZ;
/// Number of directory entries held by one directory block.
pub const DENTRIES_PER_BLOCK: usize = KTFS_BLKSZ / KTFS_DENSZ;

/// Inode flags value marking the inode as in use.
pub const KTFS_FILE_IN_USE: u32 = 1;

const NAME_BYTES: usize = KTFS_MAX_FILENAME_LEN + 1;

/// The superblock, stored in block 0.
///
/// Layout of the volume: block 0 is the superblock; the next
/// `bitmap_block_count` blocks hold the allocation bitmap (bit i corresponds
/// to block i); the next `inode_block_count` blocks hold the inode table;
/// everything after is the data area.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SuperBlock {
    /// Total number of blocks on the volume.
    pub block_count: u32,
    /// Number of blocks covered by the allocation bitmap.
    pub bitmap_block_count: u32,
    /// Number of blocks holding the inode table.
    pub inode_block_count: u32,
    /// Inode number of the root directory.
    pub root_directory_inode: u32,
}

impl SuperBlock {
    /// Decodes the superblock from the first bytes of block 0.
    pub fn from_bytes(b: &[u8]) -> Result<Self, FsError> {
        if b.len() < 16 {
            return Err(FsError::Invalid);
        }
        Ok(Self {
            block_count: read_u32(b, 0),
            bitmap_block_count: read_u32(b, 4),
            inode_block_count: read_u32(b, 8),
            root_directory_inode: read_u32(b, 12),
        })
    }

    /// Encodes the superblock into the first bytes of a block buffer.
    pub fn to_bytes(&self, b: &mut [u8]) {
        write_u32(b, 0, self.block_count);
        write_u32(b, 4, self.bitmap_block_count);
        write_u32(b, 8, self.inode_block_count);
        write_u32(b, 12, self.root_directory_inode);
    }

    /// Global block index of the first inode-table block.
    pub fn inode_table_start(&self) -> u32 {
        1 + self.bitmap_block_count
    }

    /// Global block index of the first data block.
    pub fn data_start(&self) -> u32 {
        1 + self.bitmap_block_count + self.inode_block_count
    }

    /// Total number of inodes on the volume.
    pub fn inode_count(&self) -> u32 {
        self.inode_block_count * INODES_PER_BLOCK as u32
    }

    /// Global block index holding inode `inum`.
    pub fn inode_block(&self, inum: u16) -> u32 {
        self.inode_table_start() + inum as u32 / INODES_PER_BLOCK as u32
    }

    /// Byte offset of inode `inum` within its block.
    pub fn inode_offset(&self, inum: u16) -> usize {
        (inum as usize % INODES_PER_BLOCK) * KTFS_INOSZ
    }
}

/// One 32-byte inode.
///
/// Block indices are data-area-relative; 0 means "no block".
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Inode {
    /// File size in bytes.
    pub size: u32,
    /// In-use flag; 0 marks a free inode.
    pub flags: u32,
    /// Direct data block pointers.
    pub block: [u32; KTFS_NUM_DIRECT_DATA_BLOCKS],
    /// Single-indirect block pointer.
    pub indirect: u32,
    /// Double-indirect block pointers.
    pub dindirect: [u32; KTFS_NUM_DINDIRECT_BLOCKS],
}

impl Inode {
    /// Decodes an inode from a 32-byte slice.
    pub fn from_bytes(b: &[u8]) -> Self {
        let mut ino = Inode {
            size: read_u32(b, 0),
            flags: read_u32(b, 4),
            ..Default::default()
        };
        for (i, blk) in ino.block.iter_mut().enumerate() {
            *blk = read_u32(b, 8 + i * 4);
        }
        ino.indirect = read_u32(b, 8 + KTFS_NUM_DIRECT_DATA_BLOCKS * 4);
        for (i, blk) in ino.dindirect.iter_mut().enumerate() {
            *blk = read_u32(b, 12 + KTFS_NUM_DIRECT_DATA_BLOCKS * 4 + i * 4);
        }
        ino
    }

    /// Encodes this inode into a 32-byte slice.
    pub fn to_bytes(&self, b: &mut [u8]) {
        write_u32(b, 0, self.size);
        write_u32(b, 4, self.flags);
        for (i, blk) in self.block.iter().enumerate() {
            write_u32(b, 8 + i * 4, *blk);
        }
        write_u32(b, 8 + KTFS_NUM_DIRECT_DATA_BLOCKS * 4, self.indirect);
        for (i, blk) in self.dindirect.iter().enumerate() {
            write_u32(b, 12 + KTFS_NUM_DIRECT_DATA_BLOCKS * 4 + i * 4, *blk);
        }
    }

    /// Returns whether this inode is in use.
    pub fn in_use(&self) -> bool {
        self.flags != 0
    }
}

/// One 32-byte directory entry: a NUL-padded name and an inode number.
/// Inode 0 marks an empty slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirEntry {
    /// File name, NUL-padded.
    pub name: [u8; NAME_BYTES],
    /// Inode number; 0 marks an empty slot.
    pub inode: u16,
}

impl Default for DirEntry {
    fn default() -> Self {
        Self {
            name: [0; NAME_BYTES],
            inode: 0,
        }
    }
}

impl DirEntry {
    /// Creates an entry for `name`, which must fit the fixed name field.
    pub fn new(name: &str, inode: u16) -> Result<Self, FsError> {
        if name.is_empty() || name.len() > KTFS_MAX_FILENAME_LEN {
            return Err(FsError::Invalid);
        }
        let mut e = DirEntry {
            inode,
            ..Default::default()
        };
        e.name[..name.len()].copy_from_slice(name.as_bytes());
        Ok(e)
    }

    /// Decodes an entry from a 32-byte slice.
    pub fn from_bytes(b: &[u8]) -> Self {
        let mut e = DirEntry::default();
        e.name.copy_from_slice(&b[..NAME_BYTES]);
        e.inode = u16::from_le_bytes([b[NAME_BYTES], b[NAME_BYTES + 1]]);
        e
    }

    /// Encodes this entry into a 32-byte slice.
    pub fn to_bytes(&self, b: &mut [u8]) {
        b[..NAME_BYTES].copy_from_slice(&self.name);
        b[NAME_BYTES..KTFS_DENSZ].copy_from_slice(&self.inode.to_le_bytes());
    }

    /// Returns whether this slot holds a file.
    pub fn is_used(&self) -> bool {
        self.inode != 0
    }

    /// Compares the stored name against `name`.
    pub fn name_matches(&self, name: &str) -> bool {
        let stored = &self.name[..self.name_len()];
        stored == name.as_bytes()
    }

    fn name_len(&self) -> usize {
        self.name.iter().position(|&c| c == 0).unwrap_or(NAME_BYTES)
    }
}

fn read_u32(b: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([b[off], b[off + 1], b[off + 2], b[off + 3]])
}

fn write_u32(b: &mut [u8], off: usize, v: u32) {
    b[off..off + 4].copy_from_slice(&v.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inode_fills_exactly_32_bytes() {
        // 4 (size) + 4 (flags) + 4 direct + 1 indirect + 1 dindirect pointers
        let ptrs = KTFS_NUM_DIRECT_DATA_BLOCKS + 1 + KTFS_NUM_DINDIRECT_BLOCKS;
        assert_eq!(8 + ptrs * POINTER_BYTESIZE, KTFS_INOSZ);
    }

    #[test]
    fn inode_roundtrip() {
        let ino = Inode {
            size: 1234,
            flags: KTFS_FILE_IN_USE,
            block: [7, 0, 9, 0],
            indirect: 42,
            dindirect: [99],
        };

        let mut buf = [0u8; KTFS_INOSZ];
        ino.to_bytes(&mut buf);
        assert_eq!(Inode::from_bytes(&buf), ino);
    }

    #[test]
    fn superblock_roundtrip() {
        let sb = SuperBlock {
            block_count: 4096,
            bitmap_block_count: 1,
            inode_block_count: 2,
            root_directory_inode: 0,
        };

        let mut buf = [0u8; KTFS_BLKSZ];
        sb.to_bytes(&mut buf);
        assert_eq!(SuperBlock::from_bytes(&buf).unwrap(), sb);

        assert_eq!(sb.inode_table_start(), 2);
        assert_eq!(sb.data_start(), 4);
        assert_eq!(sb.inode_count(), 32);
        assert_eq!(sb.inode_block(0), 2);
        assert_eq!(sb.inode_block(16), 3);
        assert_eq!(sb.inode_offset(3), 96);
    }

    #[test]
    fn dentry_roundtrip_and_name_matching() {
        let e = DirEntry::new("hello", 5).unwrap();

        let mut buf = [0u8; KTFS_DENSZ];
        e.to_bytes(&mut buf);
        let back = DirEntry::from_bytes(&buf);

        assert!(back.is_used());
        assert_eq!(back.inode, 5);
        assert!(back.name_matches("hello"));
        assert!(!back.name_matches("hello2"));
        assert!(!back.name_matches("hell"));
    }

    #[test]
    fn dentry_name_length_limit() {
        let max = "x".repeat(KTFS_MAX_FILENAME_LEN);
        assert!(DirEntry::new(&max, 1).is_ok());

        let long = "x".repeat(KTFS_MAX_FILENAME_LEN + 1);
        assert_eq!(DirEntry::new(&long, 1), Err(FsError::Invalid));
        assert_eq!(DirEntry::new("", 1), Err(FsError::Invalid));
    }
}
