use std::fmt;

/// Error taxonomy shared by the storage interface, the block cache, the
/// KTFS reader and the VirtIO driver.
///
/// Every fallible operation in this crate returns one of these instead of
/// a signed integer code; the variant names track the source's symbolic
/// names (`-EINVAL`, `-EBUSY`, ...) one-to-one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    /// Invalid argument or misaligned position.
    Inval,
    /// Operation not supported by this vtable/trait object.
    NotSup,
    /// Resource currently pinned or otherwise busy.
    Busy,
    /// Allocation failed.
    NoMem,
    /// Not found: unallocated block pointer, missing directory entry.
    NotFound,
    /// Malformed on-disk data (bad superblock, bad image).
    BadFmt,
    /// Backing device reported failure.
    Io,
    /// Thread resource exhausted. Outside this crate's core; carried for
    /// callers that match on the full taxonomy.
    ThreadExhausted,
}

impl KernelError {
    pub fn as_str(&self) -> &'static str {
        match self {
            KernelError::Inval => "invalid argument",
            KernelError::NotSup => "not supported",
            KernelError::Busy => "busy",
            KernelError::NoMem => "out of memory",
            KernelError::NotFound => "not found",
            KernelError::BadFmt => "malformed on-disk format",
            KernelError::Io => "device error",
            KernelError::ThreadExhausted => "thread resource exhausted",
        }
    }
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::error::Error for KernelError {}

pub type Result<T> = std::result::Result<T, KernelError>;
