//! Disk-backed cache of raw query results.
//!
//! A [`CachedSearchResult`] spills the rows a storage scan produces into a pair of files: an
//! append-only data file holding every row's samples back to back, and an index file holding one
//! [`RowDescriptor`] per row. Rows are replayed lazily through [`CachedRow`] readers which share
//! the data file handle; the handle is closed once the last reader is closed.
//!
//! Cache files live under a [`CacheDirectory`], which is rotated periodically to bound the disk
//! space used by abandoned cache files.

mod codec;
mod descriptor;
mod directory;
mod search_result;

pub use descriptor::{DEFAULT_MAX_READ_BUFFER_SIZE, RowDescriptor, read_buffer_size};
pub use directory::{CacheDirectory, RotationHandle};
pub use search_result::{CachedRow, CachedSearchResult, RowWriter};

use std::path::PathBuf;

use tsq_types::DataType;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("cache io error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("cannot add a {actual} sample to a row of type {expected}")]
    TypeMismatch { expected: DataType, actual: DataType },

    #[error("{what} of {len} bytes exceeds the cache limit of {max} bytes")]
    StringTooLong {
        what: &'static str,
        len: usize,
        max: usize,
    },

    #[error("cache handle is already closed")]
    Closed,
}

impl Error {
    fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
