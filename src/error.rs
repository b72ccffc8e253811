//! Crate-wide error taxonomy.
//!
//! Structural errors carry the name of the on-disk structure that failed its
//! signature, checksum or length check, so a mount failure names the layer
//! that rejected the image (boot sector, MBR, GPT, VHD footer, ...).
//!
//! Read paths treat benign anomalies (an out-of-range FAT index, a read of a
//! slot past the end of a table) as end-of-data and log them instead of
//! failing; write paths always refuse.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Underlying read/write failure.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// An on-disk structure failed its signature/checksum/length checks.
    #[error("invalid {structure}: {reason}")]
    InvalidFormat {
        structure: &'static str,
        reason: String,
    },

    /// The image uses a feature this implementation does not handle.
    #[error("unsupported feature: {0}")]
    Unsupported(String),

    /// The allocator is exhausted.
    #[error("no space left on volume")]
    NoSpace,

    /// Path lookup miss.
    #[error("not found: {0}")]
    NotFound(String),

    /// Name collision on create/rename.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Erase of a directory that still has entries besides `.` and `..`.
    #[error("directory not empty: {0}")]
    NotEmpty(String),

    /// Pathname over 260 chars, long name over 255, or an illegal 8.3 name.
    #[error("bad file name: {0}")]
    BadName(String),

    /// Mutation attempted on a read-only device or volume.
    #[error("volume is read-only")]
    ReadOnly,

    /// A FAT chain carried an invalid link during traversal.
    #[error("cluster chain corrupt at cluster {0:#x}")]
    ChainCorruption(u32),

    /// A differencing image's parent cannot be located or its IDs mismatch.
    #[error("parent image link broken: {0}")]
    ParentLink(String),
}

impl Error {
    pub(crate) fn invalid(structure: &'static str, reason: impl Into<String>) -> Self {
        Error::InvalidFormat {
            structure,
            reason: reason.into(),
        }
    }

    /// Seek or read past the end of a backend that cannot extend.
    pub(crate) fn out_of_range(offset: u64, size: u64) -> Self {
        Error::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            format!("access at {offset:#x} beyond device end {size:#x}"),
        ))
    }
}

pub type Result<T> = core::result::Result<T, Error>;
