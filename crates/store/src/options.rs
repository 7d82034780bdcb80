use ledgerkv_appendable::{CompressionFormat, CompressionLevel};

use crate::{Error, Result};

pub const DEFAULT_FILE_SIZE: u64 = 512 << 20;
pub const DEFAULT_MAX_TX_ENTRIES: u32 = 1024;
pub const DEFAULT_MAX_KEY_LEN: u32 = 1024;
pub const DEFAULT_MAX_VALUE_LEN: u32 = 4096;
pub const DEFAULT_MAX_CONCURRENCY: usize = 100;
pub const DEFAULT_MAX_IO_CONCURRENCY: usize = 1;
pub const DEFAULT_MAX_LINEAR_PROOF_LEN: u64 = 1000;
pub const DEFAULT_MAX_OPENED_FILES: usize = 10;
pub const DEFAULT_FLUSH_EVERY: u64 = 512;

/// Store options. The defaults match a durable single-writer deployment;
/// `synced = false` trades the per-commit fsync for throughput, leaving
/// durability to explicit [`crate::Store::sync`] calls.
#[derive(Clone, Debug)]
pub struct Options {
    /// fsync all three logs inside every commit.
    pub synced: bool,
    pub read_only: bool,
    /// POSIX mode for newly created files and directories.
    pub file_mode: u32,
    /// Logical bytes per chunk file of each multi-appendable.
    pub file_size: u64,
    pub max_tx_entries: u32,
    pub max_key_len: u32,
    pub max_value_len: u32,
    /// Ceiling on in-flight commits.
    pub max_concurrency: usize,
    /// Number of parallel value logs, each with its own I/O worker.
    pub max_io_concurrency: usize,
    /// Longest span `linear_proof` (or the linear tail of `dual_proof`)
    /// will materialize.
    pub max_linear_proof_len: u64,
    pub compression_format: CompressionFormat,
    pub compression_level: CompressionLevel,
    /// Bound on open chunk-file handles per multi-appendable.
    pub max_opened_files: usize,
    /// Indexer checkpoint cadence, in transactions.
    pub flush_every: u64,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            synced: true,
            read_only: false,
            file_mode: 0o755,
            file_size: DEFAULT_FILE_SIZE,
            max_tx_entries: DEFAULT_MAX_TX_ENTRIES,
            max_key_len: DEFAULT_MAX_KEY_LEN,
            max_value_len: DEFAULT_MAX_VALUE_LEN,
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            max_io_concurrency: DEFAULT_MAX_IO_CONCURRENCY,
            max_linear_proof_len: DEFAULT_MAX_LINEAR_PROOF_LEN,
            compression_format: CompressionFormat::None,
            compression_level: CompressionLevel::default(),
            max_opened_files: DEFAULT_MAX_OPENED_FILES,
            flush_every: DEFAULT_FLUSH_EVERY,
        }
    }
}

impl Options {
    pub fn validate(&self) -> Result<()> {
        if self.file_size == 0 {
            return Err(Error::IllegalArguments("file_size"));
        }
        if self.max_tx_entries == 0 {
            return Err(Error::IllegalArguments("max_tx_entries"));
        }
        if self.max_key_len == 0 {
            return Err(Error::IllegalArguments("max_key_len"));
        }
        if self.max_concurrency == 0 {
            return Err(Error::IllegalArguments("max_concurrency"));
        }
        if self.max_io_concurrency == 0 || self.max_io_concurrency > u8::MAX as usize {
            return Err(Error::IllegalArguments("max_io_concurrency"));
        }
        if self.max_linear_proof_len == 0 {
            return Err(Error::IllegalArguments("max_linear_proof_len"));
        }
        if self.max_opened_files == 0 {
            return Err(Error::IllegalArguments("max_opened_files"));
        }
        if self.flush_every == 0 {
            return Err(Error::IllegalArguments("flush_every"));
        }
        Ok(())
    }
}
