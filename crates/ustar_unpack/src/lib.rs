#![deny(missing_docs)]

//! This crate extracts ustar archives, optionally wrapped in a gzip envelope, from an in-memory
//! buffer onto the filesystem and reports the name of the archive's top-level directory.
//!
//! The work is split over three layers:
//!
//! - [`envelope`]: a pull-style gzip decoder over a borrowed buffer.
//! - [`header`] and [`extractor`]: a resumable, block-oriented ustar parser that can be fed the
//!   decompressed stream in arbitrary block-aligned chunks.
//! - [`read`] and [`fs`]: the orchestration that ties the two together for a buffer or a file on
//!   disk.
//!
//! ```rust,no_run
//! # use std::path::Path;
//! let root = ustar_unpack::fs::extract(Path::new("source.tar.gz"), Path::new("/tmp/out")).unwrap();
//! println!("extracted {root}");
//! ```

use std::fmt;
use std::path::PathBuf;

pub mod envelope;
pub mod extractor;
pub mod fs;
pub mod header;
pub mod read;

pub use extractor::Extractor;
pub use header::EntryKind;
pub use read::{extract, extract_with_options, ExtractOptions};

/// An error that can occur when extracting an archive.
#[derive(thiserror::Error, Debug)]
#[allow(missing_docs)]
pub enum ExtractError {
    #[error("the compressed buffer is {len} bytes, which exceeds the 4 GiB the decoder can address")]
    EnvelopeTooLarge { len: usize },

    #[error("could not initialize the gzip decoder: {0}")]
    EnvelopeInitFailed(String),

    #[error("unable to inflate")]
    InflateError(#[source] std::io::Error),

    #[error("chunks must be a positive multiple of 512 bytes, got {0} bytes")]
    ChunkNotBlockAligned(usize),

    #[error("invalid tar header at offset {offset}")]
    InvalidHeader { offset: u64 },

    #[error("the {field} field of the header for {} is not an octal number", path.display())]
    InvalidNumericField { field: &'static str, path: PathBuf },

    #[error("unknown entry type {type_flag:#04x} for {}", path.display())]
    UnknownEntryType { type_flag: u8, path: PathBuf },

    #[error("unsupported entry type {kind} for {}", path.display())]
    UnsupportedEntryKind { kind: EntryKind, path: PathBuf },

    #[error("unable to {op} {}", path.display())]
    FilesystemOpFailed {
        op: FsOp,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("path traversal attempt in archive: {}", .0.display())]
    PathTraversal(PathBuf),

    #[error("the archive stream ends in a partial block ({len} trailing bytes)")]
    TruncatedArchive { len: usize },

    #[error("the archive ends {missing} bytes before the end of {}", path.display())]
    TruncatedEntry { path: PathBuf, missing: u64 },

    #[error("the archive does not start with a directory entry")]
    NoDirectoryFound,

    #[error("the system clock is unavailable")]
    ClockUnavailable(#[source] std::time::SystemTimeError),

    #[error("could not open the archive")]
    CouldNotOpenArchive(#[source] std::io::Error),

    #[error("could not memory map {}", path.display())]
    CouldNotMapArchive {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// The filesystem operation that failed, reported as part of
/// [`ExtractError::FilesystemOpFailed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum FsOp {
    CreateDirectory,
    CreateFile,
    Truncate,
    Write,
    SetTimes,
    CreateSymlink,
    Remove,
}

impl fmt::Display for FsOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FsOp::CreateDirectory => "create directory",
            FsOp::CreateFile => "create file",
            FsOp::Truncate => "truncate",
            FsOp::Write => "write to",
            FsOp::SetTimes => "set the timestamps of",
            FsOp::CreateSymlink => "create symlink",
            FsOp::Remove => "remove",
        })
    }
}

impl ExtractError {
    pub(crate) fn fs(op: FsOp, path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> Self {
        let path = path.into();
        move |source| ExtractError::FilesystemOpFailed { op, path, source }
    }
}
