//! The index file: one [`RowDescriptor`] per cached row.
//!
//! Layout, all integers big-endian:
//!
//! ```text
//! i32 row_count
//! row_count x {
//!     i64 start_offset
//!     i64 end_offset
//!     i32 sample_count
//!     str data_type
//!     i32 tag_count
//!     tag_count x { str key, str value }
//! }
//! ```
//!
//! where `str` is an `i32` byte length followed by UTF-8 bytes.

use std::io::{self, Read, Write};

use byteorder::{BigEndian, ReadBytesExt};
use tsq_types::{DataType, TagMap};

use crate::codec::{StringPool, read_string, write_string};

/// Read buffer size used while the index holds few rows.
pub const DEFAULT_MAX_READ_BUFFER_SIZE: usize = 8 * 1024;

/// Location and metadata of one row inside the data file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowDescriptor {
    pub start_offset: u64,
    /// Set once every sample of the row has been flushed. Zero means the row was never
    /// completed.
    pub end_offset: u64,
    pub sample_count: u32,
    pub data_type: DataType,
    pub tags: TagMap,
}

impl RowDescriptor {
    pub fn byte_len(&self) -> u64 {
        self.end_offset.saturating_sub(self.start_offset)
    }
}

/// Size of the read buffer for one row of `row_byte_len` bytes when the cache holds
/// `row_count` rows.
///
/// Wide fan-out queries can have a reader per row open at once, so the per-row buffer shrinks
/// as the row count grows.
pub fn read_buffer_size(row_count: usize, row_byte_len: u64) -> usize {
    let max = if row_count > 100_000 {
        1024
    } else if row_count > 75_000 {
        3 * 1024
    } else if row_count > 50_000 {
        5 * 1024
    } else {
        DEFAULT_MAX_READ_BUFFER_SIZE
    };
    usize::try_from(row_byte_len).map_or(max, |len| len.clamp(1, max))
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum IndexError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("unknown data type: {0}")]
    UnknownDataType(#[from] tsq_types::UnknownDataType),

    #[error("corrupt row descriptor {row}: {reason}")]
    Corrupt { row: usize, reason: String },
}

pub(crate) fn write_index<W: Write>(writer: &mut W, descriptors: &[RowDescriptor]) -> io::Result<()> {
    let mut buf = Vec::with_capacity(64 * descriptors.len() + 4);
    buf.extend_from_slice(&(descriptors.len() as i32).to_be_bytes());
    for descriptor in descriptors {
        buf.extend_from_slice(&(descriptor.start_offset as i64).to_be_bytes());
        buf.extend_from_slice(&(descriptor.end_offset as i64).to_be_bytes());
        buf.extend_from_slice(&(descriptor.sample_count as i32).to_be_bytes());
        write_string(&mut buf, descriptor.data_type.as_str())?;
        buf.extend_from_slice(&(descriptor.tags.len() as i32).to_be_bytes());
        for (key, value) in &descriptor.tags {
            write_string(&mut buf, key)?;
            write_string(&mut buf, value)?;
        }
    }
    writer.write_all(&buf)?;
    writer.flush()
}

/// Decode an index and validate every descriptor against the length of its data file.
pub(crate) fn read_index<R: Read>(
    reader: &mut R,
    data_len: u64,
) -> Result<Vec<RowDescriptor>, IndexError> {
    let mut pool = StringPool::default();

    let row_count = read_count(reader, 0, "row count")?;
    // the count is untrusted, so cap the up-front allocation
    let mut descriptors = Vec::with_capacity(row_count.min(1024));
    for row in 0..row_count {
        let start_offset = read_offset(reader, row, "start offset")?;
        let end_offset = read_offset(reader, row, "end offset")?;
        let sample_count = read_count(reader, row, "sample count")? as u32;
        let data_type = read_string(reader, &mut pool)?.parse::<DataType>()?;
        let tag_count = read_count(reader, row, "tag count")?;
        let mut tags = TagMap::new();
        for _ in 0..tag_count {
            let key = read_string(reader, &mut pool)?;
            let value = read_string(reader, &mut pool)?;
            tags.insert(key, value);
        }

        let corrupt = |reason: String| IndexError::Corrupt { row, reason };
        if end_offset == 0 {
            return Err(corrupt("row was never completed".to_string()));
        }
        if end_offset <= start_offset {
            return Err(corrupt(format!(
                "empty byte range {start_offset}..{end_offset}"
            )));
        }
        if end_offset > data_len {
            return Err(corrupt(format!(
                "byte range ends at {end_offset} past the end of the data file ({data_len})"
            )));
        }

        descriptors.push(RowDescriptor {
            start_offset,
            end_offset,
            sample_count,
            data_type,
            tags,
        });
    }
    Ok(descriptors)
}

fn read_offset<R: Read>(reader: &mut R, row: usize, what: &str) -> Result<u64, IndexError> {
    let value = reader.read_i64::<BigEndian>()?;
    u64::try_from(value).map_err(|_| IndexError::Corrupt {
        row,
        reason: format!("negative {what} {value}"),
    })
}

fn read_count<R: Read>(reader: &mut R, row: usize, what: &str) -> Result<usize, IndexError> {
    let value = reader.read_i32::<BigEndian>()?;
    usize::try_from(value).map_err(|_| IndexError::Corrupt {
        row,
        reason: format!("negative {what} {value}"),
    })
}
