use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;
use tracing::{debug, warn};
use tsq_types::{DataType, Sample, SampleError, SampleIterator, SampleValue, TagMap};

use crate::codec::{MAX_STRING_LEN, decode_sample, encode_sample, string_len_prefix};
use crate::descriptor::{RowDescriptor, read_buffer_size, read_index, write_index};
use crate::{Error, Result};

const DATA_FILE_EXTENSION: &str = "data";
const INDEX_FILE_EXTENSION: &str = "index";

/// State shared between a [`CachedSearchResult`] and every [`CachedRow`] read from it.
///
/// The handle and each emitted row hold one lease. When the last lease is released the data
/// file is closed and the cache files are either kept (index written) or deleted.
#[derive(Debug)]
struct CacheFiles {
    metric_name: Arc<str>,
    data_path: PathBuf,
    index_path: PathBuf,
    keep_cache_files: bool,
    loaded_from_index: bool,
    discard: AtomicBool,
    leases: AtomicUsize,
    state: Mutex<WriteState>,
}

/// Everything guarded by the write lock.
#[derive(Debug, Default)]
struct WriteState {
    file: Option<Arc<File>>,
    offset: u64,
    descriptors: Vec<RowDescriptor>,
    closed: bool,
}

impl CacheFiles {
    fn acquire_lease(&self) {
        self.leases.fetch_add(1, Ordering::AcqRel);
    }

    fn release_lease(&self) {
        if self.leases.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.finalize();
        }
    }

    fn finalize(&self) {
        let (file, descriptors) = {
            let mut state = self.state.lock();
            state.closed = true;
            (state.file.take(), std::mem::take(&mut state.descriptors))
        };
        let has_data_file = file.is_some();
        drop(file);

        let keep = self.keep_cache_files && !self.discard.load(Ordering::Acquire);
        if keep {
            if !self.loaded_from_index {
                if let Err(error) = self.save_index(has_data_file, &descriptors) {
                    warn!(%error, path = ?self.index_path, "failed to save query cache index");
                }
            }
        } else {
            remove_if_exists(&self.data_path);
            remove_if_exists(&self.index_path);
        }
        debug!(
            metric = %self.metric_name,
            rows = descriptors.len(),
            kept = keep,
            "closed query cache"
        );
    }

    /// Write the index beside the data file. The index is written to a temporary file first so
    /// a concurrent `open` never sees a partial index.
    ///
    /// A result without rows never opened its data file; an empty one is created so the result
    /// can still be reused.
    fn save_index(&self, has_data_file: bool, descriptors: &[RowDescriptor]) -> io::Result<()> {
        if !has_data_file {
            File::create(&self.data_path)?;
        }
        let tmp_path = self.index_path.with_extension("index.tmp");
        let mut writer = BufWriter::new(File::create(&tmp_path)?);
        write_index(&mut writer, descriptors)?;
        drop(writer);
        fs::rename(&tmp_path, &self.index_path)
    }
}

fn remove_if_exists(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(error) => warn!(%error, ?path, "failed to remove query cache file"),
    }
}

fn check_string_len(what: &'static str, s: &str) -> Result<()> {
    match string_len_prefix(s) {
        Some(_) => Ok(()),
        None => Err(Error::StringTooLong {
            what,
            len: s.len(),
            max: MAX_STRING_LEN,
        }),
    }
}

fn cache_paths(base: &Path) -> (PathBuf, PathBuf) {
    (
        base.with_extension(DATA_FILE_EXTENSION),
        base.with_extension(INDEX_FILE_EXTENSION),
    )
}

/// Handle on the cached rows of one query.
///
/// Created empty with [`create`](Self::create) and populated through [`RowWriter`]s, or loaded
/// from a previous query with [`open`](Self::open). Closing the handle only gives up the
/// handle's own lease; the files stay open until every row from [`get_rows`](Self::get_rows)
/// is closed too.
#[derive(Debug)]
pub struct CachedSearchResult {
    files: Arc<CacheFiles>,
    released: bool,
}

impl CachedSearchResult {
    /// Create an empty cache at `base`, removing any files left there by an earlier query.
    pub fn create(
        metric_name: &str,
        base: impl AsRef<Path>,
        keep_cache_files: bool,
    ) -> Result<Self> {
        let (data_path, index_path) = cache_paths(base.as_ref());
        for path in [&data_path, &index_path] {
            match fs::remove_file(path) {
                Ok(()) => debug!(?path, "removed stale query cache file"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(Error::io(path, e)),
            }
        }

        Ok(Self::new(
            CacheFiles {
                metric_name: Arc::from(metric_name),
                data_path,
                index_path,
                keep_cache_files,
                loaded_from_index: false,
                discard: AtomicBool::new(false),
                leases: AtomicUsize::new(1),
                state: Mutex::new(WriteState::default()),
            },
        ))
    }

    /// Open the cache at `base` if both of its files exist and the data file was modified less
    /// than `max_age` ago.
    ///
    /// Any problem reading the existing files is a cache miss, never an error.
    pub fn open(
        metric_name: &str,
        base: impl AsRef<Path>,
        max_age: Duration,
        keep_cache_files: bool,
    ) -> Option<Self> {
        let (data_path, index_path) = cache_paths(base.as_ref());

        let data_meta = fs::metadata(&data_path).ok()?;
        if !index_path.exists() {
            return None;
        }
        let modified = data_meta.modified().ok()?;
        let age = SystemTime::now()
            .duration_since(modified)
            .unwrap_or(Duration::ZERO);
        if age >= max_age {
            debug!(?data_path, ?age, ?max_age, "query cache is stale");
            return None;
        }

        let descriptors = match File::open(&index_path)
            .map_err(Into::into)
            .and_then(|f| read_index(&mut BufReader::new(f), data_meta.len()))
        {
            Ok(descriptors) => descriptors,
            Err(error) => {
                warn!(%error, path = ?index_path, "ignoring unreadable query cache index");
                return None;
            }
        };
        let file = match File::open(&data_path) {
            Ok(file) => Arc::new(file),
            Err(error) => {
                warn!(%error, path = ?data_path, "ignoring unreadable query cache data");
                return None;
            }
        };

        debug!(rows = descriptors.len(), path = ?data_path, "opened query cache");
        Some(Self::new(CacheFiles {
            metric_name: Arc::from(metric_name),
            data_path,
            index_path,
            keep_cache_files,
            loaded_from_index: true,
            discard: AtomicBool::new(false),
            leases: AtomicUsize::new(1),
            state: Mutex::new(WriteState {
                file: Some(file),
                offset: data_meta.len(),
                descriptors,
                closed: false,
            }),
        }))
    }

    fn new(files: CacheFiles) -> Self {
        Self {
            files: Arc::new(files),
            released: false,
        }
    }

    pub fn metric_name(&self) -> &str {
        &self.files.metric_name
    }

    /// Whether this handle was loaded from an existing index rather than freshly created.
    pub fn is_from_cache(&self) -> bool {
        self.files.loaded_from_index
    }

    pub fn data_path(&self) -> &Path {
        &self.files.data_path
    }

    pub fn index_path(&self) -> &Path {
        &self.files.index_path
    }

    pub fn row_count(&self) -> usize {
        self.files.state.lock().descriptors.len()
    }

    /// Begin a new row. Samples are buffered by the writer until [`RowWriter::close`].
    pub fn start_row(&self, data_type: DataType, tags: TagMap) -> RowWriter {
        RowWriter {
            files: Arc::clone(&self.files),
            data_type,
            tags,
            buf: Vec::new(),
            sample_count: 0,
        }
    }

    /// One lazily reading row per descriptor, in index order.
    pub fn get_rows(&self) -> Result<Vec<CachedRow>> {
        let state = self.files.state.lock();
        if state.closed {
            return Err(Error::Closed);
        }
        let Some(file) = state.file.as_ref() else {
            return Ok(Vec::new());
        };

        let row_count = state.descriptors.len();
        Ok(state
            .descriptors
            .iter()
            .map(|descriptor| {
                self.files.acquire_lease();
                CachedRow {
                    files: Some(Arc::clone(&self.files)),
                    file: Some(Arc::clone(file)),
                    buffer_size: read_buffer_size(row_count, descriptor.byte_len()),
                    remaining: descriptor.sample_count,
                    descriptor: descriptor.clone(),
                    reader: None,
                }
            })
            .collect())
    }

    /// Mark the cache files for deletion when the last lease is released, regardless of the
    /// keep policy. Used when the rows written so far are incomplete.
    pub fn discard(&self) {
        self.files.discard.store(true, Ordering::Release);
    }

    /// Give up the handle's own lease.
    pub fn close(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.files.release_lease();
        }
    }
}

impl Drop for CachedSearchResult {
    fn drop(&mut self) {
        self.release();
    }
}

/// Buffers the samples of one row until it is closed.
///
/// A writer dropped without calling [`close`](Self::close) discards its samples.
#[derive(Debug)]
pub struct RowWriter {
    files: Arc<CacheFiles>,
    data_type: DataType,
    tags: TagMap,
    buf: Vec<u8>,
    sample_count: u32,
}

impl RowWriter {
    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    pub fn sample_count(&self) -> u32 {
        self.sample_count
    }

    pub fn add_sample(&mut self, timestamp: i64, value: SampleValue) -> Result<()> {
        let actual = value.data_type();
        if actual != self.data_type {
            return Err(Error::TypeMismatch {
                expected: self.data_type,
                actual,
            });
        }
        if let SampleValue::Text(text) = &value {
            check_string_len("text value", text)?;
        }
        encode_sample(&mut self.buf, &Sample { timestamp, value })
            .map_err(|e| Error::io(&self.files.data_path, e))?;
        self.sample_count += 1;
        Ok(())
    }

    /// Append the buffered samples to the data file and index the row.
    ///
    /// Rows without samples are not indexed.
    pub fn close(self) -> Result<()> {
        if self.sample_count == 0 {
            debug!(tags = ?self.tags, "skipping empty row");
            return Ok(());
        }
        for (key, value) in &self.tags {
            check_string_len("tag key", key)?;
            check_string_len("tag value", value)?;
        }

        let files = &self.files;
        let mut state = files.state.lock();
        if state.closed {
            return Err(Error::Closed);
        }

        let file = match &state.file {
            Some(file) => Arc::clone(file),
            None => {
                let file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .open(&files.data_path)
                    .map_err(|e| Error::io(&files.data_path, e))?;
                let file = Arc::new(file);
                state.file = Some(Arc::clone(&file));
                file
            }
        };

        let start_offset = state.offset;
        write_all_at(&file, &self.buf, start_offset).map_err(|e| Error::io(&files.data_path, e))?;
        let end_offset = start_offset + self.buf.len() as u64;
        state.offset = end_offset;
        state.descriptors.push(RowDescriptor {
            start_offset,
            end_offset,
            sample_count: self.sample_count,
            data_type: self.data_type,
            tags: self.tags,
        });
        Ok(())
    }
}

/// A row replayed from the cache data file.
///
/// The read buffer is only allocated on the first call to `next`, so holding many unread rows
/// is cheap.
#[derive(Debug)]
pub struct CachedRow {
    files: Option<Arc<CacheFiles>>,
    file: Option<Arc<File>>,
    descriptor: RowDescriptor,
    buffer_size: usize,
    remaining: u32,
    reader: Option<BufReader<RangeReader>>,
}

impl CachedRow {
    pub fn metric_name(&self) -> &str {
        self.files.as_ref().map_or("", |files| &files.metric_name)
    }

    pub fn data_type(&self) -> DataType {
        self.descriptor.data_type
    }

    pub fn tags(&self) -> &TagMap {
        &self.descriptor.tags
    }

    pub fn sample_count(&self) -> usize {
        self.descriptor.sample_count as usize
    }

    pub fn descriptor(&self) -> &RowDescriptor {
        &self.descriptor
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }
}

impl Iterator for CachedRow {
    type Item = Result<Sample, SampleError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        if self.reader.is_none() {
            let file = Arc::clone(self.file.as_ref()?);
            self.reader = Some(BufReader::with_capacity(
                self.buffer_size,
                RangeReader {
                    file,
                    position: self.descriptor.start_offset,
                    end: self.descriptor.end_offset,
                },
            ));
        }
        let reader = self.reader.as_mut()?;

        match decode_sample(reader, self.descriptor.data_type) {
            Ok(sample) => {
                self.remaining -= 1;
                Some(Ok(sample))
            }
            Err(e) => {
                let unread = std::mem::take(&mut self.remaining);
                Some(Err(if e.kind() == io::ErrorKind::UnexpectedEof {
                    SampleError::Corrupt(format!("row ended early with {unread} samples unread"))
                } else {
                    SampleError::Io(e)
                }))
            }
        }
    }
}

impl SampleIterator for CachedRow {
    fn close(&mut self) {
        self.reader = None;
        self.file = None;
        if let Some(files) = self.files.take() {
            files.release_lease();
        }
    }
}

impl Drop for CachedRow {
    fn drop(&mut self) {
        self.close();
    }
}

/// Reads one byte range of the data file with positional reads, so readers never contend
/// with each other or with writers appending past the range.
#[derive(Debug)]
struct RangeReader {
    file: Arc<File>,
    position: u64,
    end: u64,
}

impl Read for RangeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let remaining = self.end.saturating_sub(self.position);
        if remaining == 0 || buf.is_empty() {
            return Ok(0);
        }
        let len = buf.len().min(usize::try_from(remaining).unwrap_or(usize::MAX));
        let read = read_at(&self.file, &mut buf[..len], self.position)?;
        self.position += read as u64;
        Ok(read)
    }
}

#[cfg(unix)]
fn read_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    std::os::unix::fs::FileExt::read_at(file, buf, offset)
}

#[cfg(unix)]
fn write_all_at(file: &File, buf: &[u8], offset: u64) -> io::Result<()> {
    std::os::unix::fs::FileExt::write_all_at(file, buf, offset)
}

#[cfg(windows)]
fn read_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    std::os::windows::fs::FileExt::seek_read(file, buf, offset)
}

#[cfg(windows)]
fn write_all_at(file: &File, mut buf: &[u8], mut offset: u64) -> io::Result<()> {
    while !buf.is_empty() {
        match std::os::windows::fs::FileExt::seek_write(file, buf, offset) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => {
                buf = &buf[n..];
                offset += n as u64;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
