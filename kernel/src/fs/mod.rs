//! Filesystem front end.
//!
//! The KTFS core lives in the `ktfs` crate, generic over a block device; this
//! module binds it to a block-device I/O object, serializes every public
//! operation behind a single filesystem lock, and exposes open files as
//! seekable I/O objects.

use alloc::sync::Arc;

use ktfs::{FileHandle, FsError, Ktfs};
use spin::Mutex;

use crate::error::{Error, Result};
use crate::io::{self, Control, Io, IoRef};
use crate::thread::Guarded;

/// Adapts an I/O object to the filesystem's block-device interface.
struct FsDevice {
    io: IoRef,
}

impl ktfs::BlockIo for FsDevice {
    fn read_at(&mut self, pos: u64, buf: &mut [u8]) -> core::result::Result<(), FsError> {
        match self.io.read_at(pos, buf) {
            Ok(n) if n == buf.len() => Ok(()),
            _ => Err(FsError::Io),
        }
    }

    fn write_at(&mut self, pos: u64, buf: &[u8]) -> core::result::Result<(), FsError> {
        match self.io.write_at(pos, buf) {
            Ok(n) if n == buf.len() => Ok(()),
            _ => Err(FsError::Io),
        }
    }
}

/// The mounted root filesystem. Every public operation acquires this lock
/// for its entire body; the block cache is only ever used from inside it.
static FS: Guarded<Option<Ktfs<FsDevice>>> = Guarded::new("ktfs", None);

/// Mounts the root filesystem from a block device, taking a reference on it.
pub fn mount(bdev: IoRef) -> Result<()> {
    let mut fs = FS.lock();
    if fs.is_some() {
        return Err(Error::Invalid);
    }

    *fs = Some(Ktfs::mount(FsDevice { io: bdev })?);
    Ok(())
}

/// Opens the file named `name`, wrapping it in a seekable I/O object.
pub fn open(name: &str) -> Result<IoRef> {
    let handle = {
        let mut fs = FS.lock();
        let fs = fs.as_mut().ok_or(Error::Invalid)?;
        fs.lookup(name)?
    };

    let file: IoRef = Arc::new(KtfsFile {
        handle: Mutex::new(handle),
    });
    io::create_seekable_io(file)
}

/// Creates an empty file named `name`.
pub fn create(name: &str) -> Result<()> {
    let mut fs = FS.lock();
    let fs = fs.as_mut().ok_or(Error::Invalid)?;
    Ok(fs.create(name)?)
}

/// Deletes the file named `name`, returning its blocks to the allocator.
pub fn delete(name: &str) -> Result<()> {
    let mut fs = FS.lock();
    let fs = fs.as_mut().ok_or(Error::Invalid)?;
    Ok(fs.remove(name)?)
}

/// Writes every dirty cached block back to the device.
pub fn flush() -> Result<()> {
    let mut fs = FS.lock();
    match fs.as_mut() {
        Some(fs) => Ok(fs.flush()?),
        // Nothing mounted, nothing to flush.
        None => Ok(()),
    }
}

/// An open KTFS file behind the unified I/O interface.
///
/// Files are byte-addressable: the block size reported here is 1, and the
/// seekable wrapper created on every open keeps its cursor in bytes.
struct KtfsFile {
    handle: Mutex<FileHandle>,
}

impl Io for KtfsFile {
    fn read_at(&self, pos: u64, buf: &mut [u8]) -> Result<usize> {
        let mut fs = FS.lock();
        let fs = fs.as_mut().ok_or(Error::Invalid)?;
        let handle = self.handle.lock();
        Ok(fs.read_at(&handle, pos, buf)?)
    }

    fn write_at(&self, pos: u64, buf: &[u8]) -> Result<usize> {
        let mut fs = FS.lock();
        let fs = fs.as_mut().ok_or(Error::Invalid)?;
        let mut handle = self.handle.lock();
        Ok(fs.write_at(&mut handle, pos, buf)?)
    }

    fn control(&self, cmd: Control) -> Result<u64> {
        match cmd {
            Control::GetBlockSize => Ok(1),
            Control::GetEnd => Ok(self.handle.lock().size as u64),
            Control::SetEnd(end) => {
                let mut fs = FS.lock();
                let fs = fs.as_mut().ok_or(Error::Invalid)?;
                let mut handle = self.handle.lock();
                fs.set_end(&mut handle, end)?;
                Ok(0)
            }
            _ => Err(Error::NotSup),
        }
    }
}
