//! Append-only byte log abstractions.
//!
//! Two implementations of the [`Appendable`] contract are provided:
//!
//! - [`AppendFile`]: a single append-only file with a bounded in-memory
//!   buffer and optional per-chunk compression. Offsets handed out by
//!   [`Appendable::append`] are *logical* (pre-compression) offsets.
//! - [`MultiAppend`]: an unbounded logical stream striped over fixed-size
//!   chunk files within a directory, keeping at most a bounded number of
//!   file handles open.
//!
//! All mutators are serialized through an internal mutex, so appendables can
//! be shared between threads behind an `Arc`. Reads take the same mutex:
//! readers of committed data only ever touch flushed ranges, which keeps the
//! simple scheme fast enough.

use std::path::PathBuf;

mod compression;
mod error;
pub mod file;
pub mod multi;

pub use compression::{CompressionFormat, CompressionLevel};
pub use error::Error;
pub use file::AppendFile;
pub use multi::MultiAppend;

pub type Result<T> = std::result::Result<T, Error>;

/// Default capacity of the in-memory append buffer. For compressed
/// appendables this is also the chunk granularity.
pub const DEFAULT_BUFFER_SIZE: usize = 4096;

/// Default logical capacity of a single chunk file of a [`MultiAppend`].
pub const DEFAULT_FILE_SIZE: u64 = 512 << 20;

/// Default bound on concurrently open chunk-file handles of a [`MultiAppend`].
pub const DEFAULT_MAX_OPENED_FILES: usize = 10;

/// Default POSIX mode for newly created files and directories.
pub const DEFAULT_FILE_MODE: u32 = 0o755;

/// An append-only byte log.
///
/// Offsets are logical: with compression enabled the bytes on disk are
/// chunk-framed and smaller, but callers only ever see the offsets they were
/// handed by [`Appendable::append`].
pub trait Appendable: Send + Sync {
    /// The metadata blob recorded when the log was first created, verbatim.
    fn metadata(&self) -> Result<Vec<u8>>;

    /// Logical size of the log in bytes, buffered bytes included.
    fn size(&self) -> Result<u64>;

    /// The logical offset the next [`Appendable::append`] will claim.
    fn offset(&self) -> Result<u64>;

    /// Truncate the logical stream to `off`, discarding any buffered or
    /// written bytes past it.
    fn set_offset(&self, off: u64) -> Result<()>;

    /// Append `bytes`, returning the claimed logical offset and the number
    /// of bytes written.
    fn append(&self, bytes: &[u8]) -> Result<(u64, usize)>;

    /// Drain the in-memory buffer to the underlying file(s). With
    /// compression enabled a partially filled buffer becomes a short chunk.
    fn flush(&self) -> Result<()>;

    /// [`Appendable::flush`], then an OS durable write. Calling `sync` twice
    /// without intervening appends performs no additional I/O.
    fn sync(&self) -> Result<()>;

    /// Read as many bytes as available into `dst` starting at logical
    /// offset `off`, returning the number of bytes read. Reading at or past
    /// the logical end yields an `UnexpectedEof` I/O error.
    fn read_at(&self, dst: &mut [u8], off: u64) -> Result<usize>;

    /// Flush and release resources. Every subsequent operation fails with
    /// [`Error::AlreadyClosed`].
    fn close(&self) -> Result<()>;
}

/// Read exactly `dst.len()` bytes at `off`, failing with `UnexpectedEof` if
/// the log ends early.
pub fn read_exact_at(app: &dyn Appendable, dst: &mut [u8], off: u64) -> Result<()> {
    let mut read = 0;
    while read < dst.len() {
        let n = app.read_at(&mut dst[read..], off + read as u64)?;
        if n == 0 {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "appendable ended mid-read",
            )));
        }
        read += n;
    }
    Ok(())
}

/// Options for opening an [`AppendFile`] or a [`MultiAppend`].
#[derive(Clone, Debug)]
pub struct Options {
    pub read_only: bool,
    /// POSIX mode for newly created files and directories. Ignored on
    /// non-unix platforms.
    pub file_mode: u32,
    /// Capacity of the in-memory append buffer, and the chunk granularity
    /// for compressed logs.
    pub buffer_size: usize,
    pub compression: CompressionFormat,
    pub compression_level: CompressionLevel,
    /// Opaque metadata persisted at creation and returned verbatim by
    /// [`Appendable::metadata`]. Ignored when the log already exists.
    pub metadata: Vec<u8>,
    /// Logical bytes per chunk file. Only meaningful for [`MultiAppend`].
    pub file_size: u64,
    /// Bound on concurrently open chunk-file handles. Only meaningful for
    /// [`MultiAppend`].
    pub max_opened_files: usize,
    /// Extension of chunk files, without the leading dot.
    pub file_ext: String,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            read_only: false,
            file_mode: DEFAULT_FILE_MODE,
            buffer_size: DEFAULT_BUFFER_SIZE,
            compression: CompressionFormat::default(),
            compression_level: CompressionLevel::default(),
            metadata: Vec::new(),
            file_size: DEFAULT_FILE_SIZE,
            max_opened_files: DEFAULT_MAX_OPENED_FILES,
            file_ext: "aof".to_owned(),
        }
    }
}

impl Options {
    pub fn validate(&self) -> Result<()> {
        if self.buffer_size == 0 {
            return Err(Error::IllegalArguments("buffer_size"));
        }
        if self.file_size == 0 {
            return Err(Error::IllegalArguments("file_size"));
        }
        if self.max_opened_files == 0 {
            return Err(Error::IllegalArguments("max_opened_files"));
        }
        if self.file_ext.is_empty() {
            return Err(Error::IllegalArguments("file_ext"));
        }
        Ok(())
    }
}

/// Name of a chunk file within a [`MultiAppend`] directory.
pub(crate) fn chunk_file_name(ordinal: u64, ext: &str) -> String {
    format!("{ordinal:0>20}.{ext}")
}

/// Parse a chunk-file name back into its ordinal.
pub(crate) fn parse_chunk_file_name(name: &str, ext: &str) -> Option<u64> {
    let stem = name.strip_suffix(ext)?.strip_suffix('.')?;
    if stem.len() != 20 {
        return None;
    }
    stem.parse().ok()
}

pub(crate) fn chunk_file_path(dir: &std::path::Path, ordinal: u64, ext: &str) -> PathBuf {
    dir.join(chunk_file_name(ordinal, ext))
}
