//! The unified I/O object.
//!
//! Every endpoint in the kernel — device driver instances, filesystem files,
//! memory buffers, pipes — is an [`Io`] trait object held through an
//! [`IoRef`]. Cloning the `Arc` takes a reference; dropping the last one
//! closes the endpoint through its `Drop` impl. Operations an endpoint does
//! not support report [`Error::NotSup`] through the trait's defaults.

use alloc::boxed::Box;
use alloc::sync::Arc;

use spin::Mutex;

use crate::error::{Error, Result};
use crate::thread::Guarded;

mod pipe;

pub use pipe::create_pipe;

/// A reference-counted handle to an I/O endpoint.
pub type IoRef = Arc<dyn Io>;

/// Control operations understood by [`Io::control`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    /// Returns the endpoint's block size.
    GetBlockSize,
    /// Returns the current cursor position (seekable endpoints only).
    GetPos,
    /// Moves the cursor (seekable endpoints only).
    SetPos(u64),
    /// Returns the end position.
    GetEnd,
    /// Moves the end position, growing the endpoint.
    SetEnd(u64),
}

/// An I/O endpoint.
///
/// The slot set is closed: sequential read/write, positioned read/write and
/// control. Implementations override what they support; the rest reports
/// [`Error::NotSup`]. All methods take `&self`: endpoints guard their own
/// mutable state, since one endpoint may be shared by several descriptors.
pub trait Io: Send + Sync {
    /// Reads up to `buf.len()` bytes at the endpoint's cursor.
    fn read(&self, _buf: &mut [u8]) -> Result<usize> {
        Err(Error::NotSup)
    }

    /// Writes up to `buf.len()` bytes at the endpoint's cursor.
    fn write(&self, _buf: &[u8]) -> Result<usize> {
        Err(Error::NotSup)
    }

    /// Reads at an explicit byte offset.
    fn read_at(&self, _pos: u64, _buf: &mut [u8]) -> Result<usize> {
        Err(Error::NotSup)
    }

    /// Writes at an explicit byte offset.
    fn write_at(&self, _pos: u64, _buf: &[u8]) -> Result<usize> {
        Err(Error::NotSup)
    }

    /// Endpoint control. The default knows only the default block size, 1.
    fn control(&self, cmd: Control) -> Result<u64> {
        match cmd {
            Control::GetBlockSize => Ok(1),
            _ => Err(Error::NotSup),
        }
    }
}

/// Returns the endpoint's block size; endpoints without a control handler
/// report 1.
pub fn block_size(io: &dyn Io) -> u64 {
    io.control(Control::GetBlockSize).unwrap_or(1)
}

/// Moves a seekable endpoint's cursor to `pos`.
pub fn seek(io: &dyn Io, pos: u64) -> Result<()> {
    io.control(Control::SetPos(pos)).map(|_| ())
}

/// Reads until `buf` is full or the endpoint runs out of data. Returns the
/// number of bytes placed in `buf`.
pub fn fill(io: &dyn Io, buf: &mut [u8]) -> Result<usize> {
    let mut pos = 0;
    while pos < buf.len() {
        let n = io.read(&mut buf[pos..])?;
        if n == 0 {
            break;
        }
        pos += n;
    }
    Ok(pos)
}

struct SeekState {
    pos: u64,
    end: u64,
}

/// A seekable wrapper layering a byte cursor over an at-addressable
/// endpoint with a block granularity.
pub struct SeekIo {
    inner: IoRef,
    blksz: u64,
    state: Guarded<SeekState>,
}

/// Wraps an at-addressable endpoint, adding cursor semantics.
///
/// The backing block size must be a nonzero power of two, and the backing
/// endpoint must report its end position.
pub fn create_seekable_io(inner: IoRef) -> Result<IoRef> {
    let blksz = inner.control(Control::GetBlockSize)?;
    assert!(blksz > 0 && blksz & (blksz - 1) == 0);

    let end = inner.control(Control::GetEnd)?;

    Ok(Arc::new(SeekIo {
        inner,
        blksz,
        state: Guarded::new("seekio", SeekState { pos: 0, end }),
    }))
}

impl Io for SeekIo {
    fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let mut st = self.state.lock();

        // Cannot read past end.
        let mut len = buf.len().min((st.end - st.pos) as usize);
        if len == 0 {
            return Ok(0);
        }

        // Requests must cover at least one block and transfer whole blocks.
        if (len as u64) < self.blksz {
            return Err(Error::Invalid);
        }
        len &= !(self.blksz as usize - 1);

        let n = self.inner.read_at(st.pos, &mut buf[..len])?;
        st.pos += n as u64;
        Ok(n)
    }

    fn write(&self, buf: &[u8]) -> Result<usize> {
        let mut st = self.state.lock();

        if buf.is_empty() {
            return Ok(0);
        }
        if (buf.len() as u64) < self.blksz {
            return Err(Error::Invalid);
        }
        let len = buf.len() & !(self.blksz as usize - 1);

        // A write past the end moves the end first.
        if st.end - st.pos < len as u64 {
            let new_end = st.pos.checked_add(len as u64).ok_or(Error::Invalid)?;
            self.inner.control(Control::SetEnd(new_end))?;
            st.end = new_end;
        }

        let n = self.inner.write_at(st.pos, &buf[..len])?;
        st.pos += n as u64;
        Ok(n)
    }

    fn read_at(&self, pos: u64, buf: &mut [u8]) -> Result<usize> {
        self.inner.read_at(pos, buf)
    }

    fn write_at(&self, pos: u64, buf: &[u8]) -> Result<usize> {
        self.inner.write_at(pos, buf)
    }

    fn control(&self, cmd: Control) -> Result<u64> {
        match cmd {
            Control::GetBlockSize => Ok(self.blksz),
            Control::GetPos => Ok(self.state.lock().pos),
            Control::SetPos(pos) => {
                let mut st = self.state.lock();
                // New position must be block-aligned and not past end.
                if pos & (self.blksz - 1) != 0 || pos > st.end {
                    return Err(Error::Invalid);
                }
                st.pos = pos;
                Ok(0)
            }
            Control::GetEnd => Ok(self.state.lock().end),
            Control::SetEnd(end) => {
                let mut st = self.state.lock();
                self.inner.control(Control::SetEnd(end))?;
                st.end = end;
                Ok(0)
            }
        }
    }
}

/// A fixed memory buffer exposed as an at-addressable endpoint.
pub struct MemIo {
    data: Mutex<Box<[u8]>>,
}

/// Exposes `data` as an at-addressable endpoint.
pub fn create_memory_io(data: Box<[u8]>) -> IoRef {
    Arc::new(MemIo {
        data: Mutex::new(data),
    })
}

impl Io for MemIo {
    fn read_at(&self, pos: u64, buf: &mut [u8]) -> Result<usize> {
        let data = self.data.lock();

        if pos >= data.len() as u64 {
            return Ok(0);
        }
        let pos = pos as usize;
        let n = buf.len().min(data.len() - pos);
        buf[..n].copy_from_slice(&data[pos..pos + n]);
        Ok(n)
    }

    fn write_at(&self, pos: u64, buf: &[u8]) -> Result<usize> {
        let mut data = self.data.lock();

        if pos >= data.len() as u64 {
            return Ok(0);
        }
        let pos = pos as usize;
        let n = buf.len().min(data.len() - pos);
        data[pos..pos + n].copy_from_slice(&buf[..n]);
        Ok(n)
    }

    fn control(&self, cmd: Control) -> Result<u64> {
        match cmd {
            Control::GetBlockSize => Ok(1),
            Control::GetEnd => Ok(self.data.lock().len() as u64),
            _ => Err(Error::NotSup),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_io_reads_and_writes_at_offsets() {
        let io = create_memory_io(vec![0u8; 16].into_boxed_slice());

        assert_eq!(io.write_at(4, b"abcd").unwrap(), 4);

        let mut buf = [0u8; 4];
        assert_eq!(io.read_at(4, &mut buf).unwrap(), 4);
        assert_eq!(&buf, b"abcd");

        // Reads and writes are capped at the end of the buffer.
        let mut big = [0u8; 32];
        assert_eq!(io.read_at(0, &mut big).unwrap(), 16);
        assert_eq!(io.read_at(16, &mut buf).unwrap(), 0);
        assert_eq!(io.write_at(14, b"zzzz").unwrap(), 2);

        assert_eq!(io.control(Control::GetEnd).unwrap(), 16);
        assert_eq!(io.control(Control::GetBlockSize).unwrap(), 1);
        assert_eq!(io.control(Control::SetEnd(32)), Err(Error::NotSup));
    }

    #[test]
    fn sequential_read_and_write_are_unsupported_by_default() {
        let io = create_memory_io(vec![0u8; 8].into_boxed_slice());

        let mut buf = [0u8; 4];
        assert_eq!(io.read(&mut buf), Err(Error::NotSup));
        assert_eq!(io.write(&buf), Err(Error::NotSup));
    }

    #[test]
    fn fill_loops_over_short_reads() {
        /// Source handing out at most two bytes per read.
        struct Trickle {
            data: Mutex<alloc::vec::Vec<u8>>,
        }

        impl Io for Trickle {
            fn read(&self, buf: &mut [u8]) -> Result<usize> {
                let mut data = self.data.lock();
                let n = buf.len().min(2).min(data.len());
                for b in buf.iter_mut().take(n) {
                    *b = data.remove(0);
                }
                Ok(n)
            }
        }

        let src = Trickle {
            data: Mutex::new(vec![1, 2, 3, 4, 5]),
        };

        let mut buf = [0u8; 4];
        assert_eq!(fill(&src, &mut buf).unwrap(), 4);
        assert_eq!(buf, [1, 2, 3, 4]);

        // The source runs dry before the buffer fills.
        let mut buf = [0u8; 4];
        assert_eq!(fill(&src, &mut buf).unwrap(), 1);
        assert_eq!(buf[0], 5);
    }
}
