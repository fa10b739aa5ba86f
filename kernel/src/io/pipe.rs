//! Unidirectional pipes.
//!
//! A pipe is a bounded ring buffer shared by a write endpoint and a read
//! endpoint. Readers block while the pipe is empty and a writer remains;
//! writers block while the pipe is full and a reader remains. Closing the
//! last endpoint of either side wakes the other.

use alloc::sync::Arc;

use crate::arch::{disable_interrupts, restore_interrupts, IntrCell};
use crate::config::PAGE_SIZE;
use crate::error::{Error, Result};
use crate::io::{Io, IoRef};
use crate::thread::Condition;

const PIPE_BUFSZ: usize = PAGE_SIZE;

struct PipeRing {
    buf: [u8; PIPE_BUFSZ],
    head: usize,
    count: usize,
    writer_gone: bool,
    reader_gone: bool,
}

struct PipeShared {
    ring: IntrCell<PipeRing>,
    not_empty: Condition,
    not_full: Condition,
}

/// Creates a pipe and returns its `(write, read)` endpoints.
pub fn create_pipe() -> (IoRef, IoRef) {
    let shared = Arc::new(PipeShared {
        ring: IntrCell::new(PipeRing {
            buf: [0; PIPE_BUFSZ],
            head: 0,
            count: 0,
            writer_gone: false,
            reader_gone: false,
        }),
        not_empty: Condition::new("pipe.not_empty"),
        not_full: Condition::new("pipe.not_full"),
    });

    (
        Arc::new(PipeWriter {
            shared: shared.clone(),
        }),
        Arc::new(PipeReader { shared }),
    )
}

struct PipeReader {
    shared: Arc<PipeShared>,
}

struct PipeWriter {
    shared: Arc<PipeShared>,
}

impl Io for PipeReader {
    fn read(&self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        let pie = disable_interrupts();

        let n = loop {
            let got = self.shared.ring.with(|r| {
                if r.count == 0 {
                    return if r.writer_gone { Some(0) } else { None };
                }

                let n = buf.len().min(r.count);
                for slot in buf.iter_mut().take(n) {
                    *slot = r.buf[r.head];
                    r.head = (r.head + 1) % PIPE_BUFSZ;
                    r.count -= 1;
                }
                Some(n)
            });

            match got {
                Some(n) => break n,
                // Interrupts stay disabled, so the writer cannot slip a
                // broadcast in between the check and the wait.
                None => self.shared.not_empty.wait(),
            }
        };

        self.shared.not_full.broadcast();
        restore_interrupts(pie);
        Ok(n)
    }
}

impl Drop for PipeReader {
    fn drop(&mut self) {
        self.shared.ring.with(|r| r.reader_gone = true);
        self.shared.not_full.broadcast();
    }
}

impl Io for PipeWriter {
    fn write(&self, buf: &[u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        let pie = disable_interrupts();

        let mut written = 0;
        let res = loop {
            let state = self.shared.ring.with(|r| {
                if r.reader_gone {
                    return Err(Error::Io);
                }
                if r.count == PIPE_BUFSZ {
                    return Ok(0);
                }

                let n = (buf.len() - written).min(PIPE_BUFSZ - r.count);
                for &b in buf[written..written + n].iter() {
                    r.buf[(r.head + r.count) % PIPE_BUFSZ] = b;
                    r.count += 1;
                }
                Ok(n)
            });

            match state {
                Err(e) => break Err(e),
                Ok(n) => {
                    written += n;
                    if n > 0 {
                        self.shared.not_empty.broadcast();
                    }
                    if written == buf.len() {
                        break Ok(written);
                    }
                    self.shared.not_full.wait();
                }
            }
        };

        restore_interrupts(pie);
        res
    }
}

impl Drop for PipeWriter {
    fn drop(&mut self) {
        self.shared.ring.with(|r| r.writer_gone = true);
        self.shared.not_empty.broadcast();
    }
}
