//! Big-endian encoding of strings and samples shared by the index and data files.

use std::collections::HashSet;
use std::io::{self, Read};
use std::sync::Arc;

use byteorder::{BigEndian, ReadBytesExt};
use tsq_types::{DataType, Sample, SampleValue};

/// Upper bound on a single encoded string. The writer refuses anything larger and the reader
/// treats it as corruption.
pub(crate) const MAX_STRING_LEN: usize = 64 * 1024 * 1024;

/// Interns strings decoded from one index file. Tag keys and values repeat across thousands of
/// rows, so each distinct string is allocated once.
#[derive(Debug, Default)]
pub(crate) struct StringPool {
    strings: HashSet<Arc<str>>,
}

impl StringPool {
    pub(crate) fn intern(&mut self, s: &str) -> Arc<str> {
        if let Some(existing) = self.strings.get(s) {
            return Arc::clone(existing);
        }
        let interned: Arc<str> = Arc::from(s);
        self.strings.insert(Arc::clone(&interned));
        interned
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.strings.len()
    }
}

/// Length prefix for `s`, or `None` when it is longer than [`MAX_STRING_LEN`].
pub(crate) fn string_len_prefix(s: &str) -> Option<i32> {
    i32::try_from(s.len())
        .ok()
        .filter(|_| s.len() <= MAX_STRING_LEN)
}

pub(crate) fn write_string(buf: &mut Vec<u8>, s: &str) -> io::Result<()> {
    let len = string_len_prefix(s).ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("string of {} bytes is too long to encode", s.len()),
        )
    })?;
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(s.as_bytes());
    Ok(())
}

fn read_string_bytes<R: Read>(reader: &mut R) -> io::Result<String> {
    let len = reader.read_i32::<BigEndian>()?;
    let len = usize::try_from(len)
        .ok()
        .filter(|len| *len <= MAX_STRING_LEN)
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("invalid string length {len}"),
            )
        })?;
    let mut bytes = vec![0; len];
    reader.read_exact(&mut bytes)?;
    String::from_utf8(bytes).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

pub(crate) fn read_string<R: Read>(reader: &mut R, pool: &mut StringPool) -> io::Result<Arc<str>> {
    read_string_bytes(reader).map(|s| pool.intern(&s))
}

/// Append `(timestamp, value)` for one sample. The value encoding is selected by the row's
/// declared type, so the type itself is not written.
pub(crate) fn encode_sample(buf: &mut Vec<u8>, sample: &Sample) -> io::Result<()> {
    buf.extend_from_slice(&sample.timestamp.to_be_bytes());
    match &sample.value {
        SampleValue::Long(v) => buf.extend_from_slice(&v.to_be_bytes()),
        SampleValue::Double(v) => buf.extend_from_slice(&v.to_bits().to_be_bytes()),
        SampleValue::Text(v) => write_string(buf, v)?,
    }
    Ok(())
}

pub(crate) fn decode_sample<R: Read>(reader: &mut R, data_type: DataType) -> io::Result<Sample> {
    let timestamp = reader.read_i64::<BigEndian>()?;
    let value = match data_type {
        DataType::Long => SampleValue::Long(reader.read_i64::<BigEndian>()?),
        DataType::Double => SampleValue::Double(f64::from_bits(reader.read_u64::<BigEndian>()?)),
        DataType::Text => SampleValue::Text(Arc::from(read_string_bytes(reader)?)),
    };
    Ok(Sample { timestamp, value })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn samples_decode_by_declared_type() {
        let mut buf = Vec::new();
        encode_sample(&mut buf, &Sample::new(7, 42i64)).unwrap();
        encode_sample(&mut buf, &Sample::new(8, -1.25)).unwrap();
        encode_sample(&mut buf, &Sample::new(9, "héllo")).unwrap();

        let mut cursor = Cursor::new(buf);
        assert_eq!(
            decode_sample(&mut cursor, DataType::Long).unwrap(),
            Sample::new(7, 42i64)
        );
        assert_eq!(
            decode_sample(&mut cursor, DataType::Double).unwrap(),
            Sample::new(8, -1.25)
        );
        assert_eq!(
            decode_sample(&mut cursor, DataType::Text).unwrap(),
            Sample::new(9, "héllo")
        );
        assert_eq!(
            decode_sample(&mut cursor, DataType::Long)
                .unwrap_err()
                .kind(),
            io::ErrorKind::UnexpectedEof
        );
    }

    #[test]
    fn negative_string_length_is_invalid() {
        let mut cursor = Cursor::new((-4i32).to_be_bytes().to_vec());
        let err = read_string(&mut cursor, &mut StringPool::default()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn oversized_string_is_not_encoded() {
        let limit = "x".repeat(MAX_STRING_LEN);
        assert_eq!(string_len_prefix(&limit), Some(MAX_STRING_LEN as i32));

        let too_long = "x".repeat(MAX_STRING_LEN + 1);
        assert_eq!(string_len_prefix(&too_long), None);
        let mut buf = Vec::new();
        let err = write_string(&mut buf, &too_long).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
        assert!(buf.is_empty());
    }

    #[test]
    fn pool_reuses_allocations() {
        let mut pool = StringPool::default();
        let a = pool.intern("host");
        let b = pool.intern("host");
        assert!(Arc::ptr_eq(&a, &b));
        pool.intern("dc");
        assert_eq!(pool.len(), 2);
    }
}
