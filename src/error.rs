//! The [`Error`] type shared by every fallible operation in this crate.

use thiserror::Error;

/// The `Error` type.
#[derive(Debug, Error)]
pub enum Error {
    /// The host could not reserve or map the requested address-space window.
    #[error("failed to allocate host memory: {0}")]
    AllocationFailure(String),
    /// Two static regions claim overlapping physical-address windows.
    #[error("region [{0:#x}, {1:#x}) overlaps an existing region")]
    RegionOverlap(u32, u32),
    /// A mount or mirror entry's start or size is not a multiple of the page size.
    #[error("map entry at {0:#x} (size {1:#x}) is not page-aligned")]
    MapMisalignment(u32, u32),
    /// The backend's code buffer is exhausted; the cache should be flushed and the
    /// compile retried exactly once.
    #[error("backend code buffer exhausted")]
    BufferOverflow,
    /// The SH4 decoder did not recognize an opcode; the block ends naturally here.
    #[error("unrecognized SH4 opcode {0:#06x} at {1:#010x}")]
    DecodeFailure(u16, u32),
    /// The fastmem fault decoder could not parse the faulting `mov` instruction.
    #[error("fastmem fault at host ip {0:#x}: unsupported mov encoding")]
    UnsupportedMovEncoding(usize),
    /// An internal invariant was violated; this indicates a bug in the optimizer
    /// or code generator rather than a recoverable runtime condition.
    #[error("internal invariant violated: {0}")]
    Bug(String),
    /// Wraps [`std::io::Error`].
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// Wraps an error originating from calls into `nix`.
    #[cfg(unix)]
    #[error(transparent)]
    Nix(#[from] nix::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
