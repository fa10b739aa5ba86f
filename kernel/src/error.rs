//! Kernel-wide error taxonomy.
//!
//! Functions return [`Error`] to their callers; the syscall dispatcher encodes
//! it as a negative integer in `a0`. Invariant violations panic instead.

use core::fmt;

use ktfs::FsError;

/// Kernel error kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Argument out of range or malformed.
    Invalid,
    /// User pointer not mapped with the required permissions.
    Access,
    /// File descriptor not allocated or out of bounds.
    BadFd,
    /// Binary format rejected.
    BadFmt,
    /// Device error or short read/write.
    Io,
    /// Out of kernel heap or user stack space.
    NoMem,
    /// Name, file or block not found.
    NotFound,
    /// Operation not supported by the endpoint.
    NotSup,
    /// No free process-table slot.
    NoChild,
    /// No free file descriptor slot.
    MFile,
    /// No free thread slot.
    MThread,
    /// Data-block bitmap exhausted.
    NoDataBlocks,
    /// Inode table exhausted.
    NoInodeBlocks,
}

/// Result type used throughout the kernel.
pub type Result<T> = core::result::Result<T, Error>;

impl Error {
    /// Encodes this error as a negative syscall return value.
    pub fn code(self) -> i64 {
        -(match self {
            Error::Invalid => 1,
            Error::Access => 2,
            Error::BadFd => 3,
            Error::BadFmt => 4,
            Error::Io => 5,
            Error::NoMem => 6,
            Error::NotFound => 7,
            Error::NotSup => 8,
            Error::NoChild => 9,
            Error::MFile => 10,
            Error::MThread => 11,
            Error::NoDataBlocks => 12,
            Error::NoInodeBlocks => 13,
        })
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Error::Invalid => "invalid argument",
            Error::Access => "bad user pointer",
            Error::BadFd => "bad file descriptor",
            Error::BadFmt => "bad binary format",
            Error::Io => "I/O error",
            Error::NoMem => "out of memory",
            Error::NotFound => "not found",
            Error::NotSup => "not supported",
            Error::NoChild => "no free process slot",
            Error::MFile => "no free file descriptor",
            Error::MThread => "no free thread slot",
            Error::NoDataBlocks => "out of data blocks",
            Error::NoInodeBlocks => "out of inodes",
        };
        f.write_str(s)
    }
}

impl From<FsError> for Error {
    fn from(e: FsError) -> Self {
        match e {
            FsError::Io => Error::Io,
            FsError::Invalid => Error::Invalid,
            FsError::NotFound => Error::NotFound,
            FsError::Exists => Error::Invalid,
            FsError::NotSup => Error::NotSup,
            FsError::NoDataBlocks => Error::NoDataBlocks,
            FsError::NoInodeBlocks => Error::NoInodeBlocks,
        }
    }
}

/// Converts a syscall handler result into a raw return value.
pub fn to_ret(res: Result<i64>) -> i64 {
    match res {
        Ok(v) => v,
        Err(e) => e.code(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_negative_and_distinct() {
        let all = [
            Error::Invalid,
            Error::Access,
            Error::BadFd,
            Error::BadFmt,
            Error::Io,
            Error::NoMem,
            Error::NotFound,
            Error::NotSup,
            Error::NoChild,
            Error::MFile,
            Error::MThread,
            Error::NoDataBlocks,
            Error::NoInodeBlocks,
        ];

        for (i, a) in all.iter().enumerate() {
            assert!(a.code() < 0);
            for b in &all[i + 1..] {
                assert_ne!(a.code(), b.code());
            }
        }
    }

    #[test]
    fn to_ret_passes_values_through() {
        assert_eq!(to_ret(Ok(42)), 42);
        assert_eq!(to_ret(Err(Error::BadFd)), Error::BadFd.code());
    }
}
