//! KTFS filesystem core.
//!
//! KTFS is a small disk filesystem with a single root directory, fixed-size
//! inodes with direct/indirect/double-indirect block pointers and a
//! bitmap-backed block allocator. This crate implements the on-disk layout,
//! a bounded write-back block cache, and the filesystem logic itself,
//! generic over a [`BlockIo`] backing device so it can be exercised on the
//! host against an in-memory disk.
//!
//! Locking is the caller's responsibility: all operations take `&mut self`
//! and the kernel serializes them behind a single filesystem lock.

#![no_std]

extern crate alloc;

mod cache;
mod error;
mod fs;
mod layout;

pub use crate::cache::{BlockCache, CACHE_BLKSZ, CACHE_CAPACITY};
pub use crate::error::FsError;
pub use crate::fs::{format, FileHandle, Ktfs};
pub use crate::layout::{
    DirEntry, Inode, SuperBlock, KTFS_BLKSZ, KTFS_DENSZ, KTFS_INOSZ, KTFS_MAX_FILENAME_LEN,
    KTFS_NUM_DINDIRECT_BLOCKS, KTFS_NUM_DIRECT_DATA_BLOCKS,
};

/// A positioned block device backing the filesystem.
///
/// Positions are byte offsets; callers always pass block-aligned positions
/// and whole-block buffers.
pub trait BlockIo {
    /// Reads exactly `buf.len()` bytes at byte offset `pos`.
    fn read_at(&mut self, pos: u64, buf: &mut [u8]) -> Result<(), FsError>;

    /// Writes exactly `buf.len()` bytes at byte offset `pos`.
    fn write_at(&mut self, pos: u64, buf: &[u8]) -> Result<(), FsError>;
}
