//! Single-file append-only log.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use log::{debug, warn};
use parking_lot::Mutex;

use crate::compression::{self, CompressionFormat, CompressionLevel};
use crate::{Appendable, Error, Options, Result};

pub const MAGIC: [u8; 4] = *b"LKVA";
pub const FORMAT_VERSION: u8 = 1;

/// magic + format_version + compression_format + compression_level +
/// reserved + metadata_len.
const HEADER_LEN: usize = MAGIC.len() + 4 + 4;

/// stored_len + raw_len, prepended to every compressed chunk.
const CHUNK_FRAMING_LEN: u64 = 8;

/// Boundaries of one compressed chunk. Only tracked when the compression
/// format is not `None`; uncompressed logs are addressed directly.
#[derive(Clone, Copy, Debug)]
struct Chunk {
    logical_off: u64,
    raw_len: u32,
    phys_off: u64,
    stored_len: u32,
}

impl Chunk {
    fn logical_end(&self) -> u64 {
        self.logical_off + self.raw_len as u64
    }
}

/// An append-only file with a bounded in-memory buffer and optional
/// per-chunk compression. See the [`Appendable`] contract.
#[derive(Debug)]
pub struct AppendFile {
    inner: Mutex<Inner>,
}

#[derive(Debug)]
struct Inner {
    file: File,
    path: PathBuf,
    read_only: bool,
    closed: bool,

    compression: CompressionFormat,
    level: CompressionLevel,
    metadata: Vec<u8>,

    /// Physical offset where data begins (right after header + metadata).
    base: u64,
    /// Physical offset of the next chunk/byte write.
    phys_end: u64,

    buf: Vec<u8>,
    buf_cap: usize,
    /// Logical offset of `buf[0]`.
    buf_start: u64,

    /// Chunk boundary index, ascending by `logical_off`. Empty for
    /// uncompressed logs.
    chunks: Vec<Chunk>,
    /// Most recently decompressed chunk, keyed by its logical offset.
    chunk_cache: Option<(u64, Vec<u8>)>,

    /// Nothing has been appended since the last successful `sync`.
    clean_sync: bool,
}

impl AppendFile {
    /// Open or create the append-only file at `path`.
    ///
    /// When the file already exists its header wins over `opts` for the
    /// compression format, level and metadata. Compressed files have their
    /// chunk boundary index rebuilt by walking the chunk frames; a torn
    /// trailing chunk is discarded (truncated away unless read-only).
    pub fn open(path: impl AsRef<Path>, opts: Options) -> Result<Self> {
        opts.validate()?;
        let path = path.as_ref().to_path_buf();
        if path.is_dir() {
            return Err(Error::IllegalArguments("path"));
        }

        let mut open_opts = OpenOptions::new();
        open_opts.read(true);
        if !opts.read_only {
            open_opts.write(true).create(true);
            #[cfg(unix)]
            {
                use std::os::unix::fs::OpenOptionsExt as _;
                open_opts.mode(opts.file_mode);
            }
        }
        let file = open_opts.open(&path)?;
        let file_len = file.metadata()?.len();

        let inner = if file_len == 0 {
            if opts.read_only {
                return Err(Error::Corrupted(format!(
                    "empty appendable: {}",
                    path.display()
                )));
            }
            Inner::create(file, path, &opts)?
        } else {
            Inner::load(file, path, file_len, &opts)?
        };

        Ok(Self {
            inner: Mutex::new(inner),
        })
    }
}

impl Inner {
    fn create(mut file: File, path: PathBuf, opts: &Options) -> Result<Self> {
        if opts.metadata.len() > u32::MAX as usize {
            return Err(Error::IllegalArguments("metadata"));
        }

        let mut header = Vec::with_capacity(HEADER_LEN + opts.metadata.len());
        header.extend_from_slice(&MAGIC);
        header.push(FORMAT_VERSION);
        header.push(opts.compression.to_byte());
        header.push(opts.compression_level.to_byte());
        header.push(0);
        header.extend_from_slice(&(opts.metadata.len() as u32).to_be_bytes());
        header.extend_from_slice(&opts.metadata);
        file.write_all(&header)?;
        file.sync_data()?;

        let base = header.len() as u64;
        Ok(Self {
            file,
            path,
            read_only: false,
            closed: false,
            compression: opts.compression,
            level: opts.compression_level,
            metadata: opts.metadata.clone(),
            base,
            phys_end: base,
            buf: Vec::new(),
            buf_cap: opts.buffer_size,
            buf_start: 0,
            chunks: Vec::new(),
            chunk_cache: None,
            clean_sync: true,
        })
    }

    fn load(mut file: File, path: PathBuf, file_len: u64, opts: &Options) -> Result<Self> {
        let corrupted = |msg: &str| Error::Corrupted(format!("{msg}: {}", path.display()));

        if file_len < HEADER_LEN as u64 {
            return Err(corrupted("truncated header"));
        }
        let mut header = [0u8; HEADER_LEN];
        file.read_exact(&mut header)?;
        if header[..MAGIC.len()] != MAGIC {
            return Err(corrupted("bad magic"));
        }
        let version = header[MAGIC.len()];
        if version > FORMAT_VERSION {
            return Err(corrupted("unsupported format version"));
        }
        let compression = CompressionFormat::from_byte(header[MAGIC.len() + 1])?;
        let level = CompressionLevel::from_byte(header[MAGIC.len() + 2])?;
        let metadata_len = u32::from_be_bytes(header[HEADER_LEN - 4..].try_into().unwrap()) as u64;
        if file_len < HEADER_LEN as u64 + metadata_len {
            return Err(corrupted("truncated metadata"));
        }
        let mut metadata = vec![0u8; metadata_len as usize];
        file.read_exact(&mut metadata)?;

        if compression != opts.compression {
            debug!(
                "appendable {}: stored compression {:?} overrides requested {:?}",
                path.display(),
                compression,
                opts.compression
            );
        }

        let base = HEADER_LEN as u64 + metadata_len;
        let mut inner = Self {
            file,
            path,
            read_only: opts.read_only,
            closed: false,
            compression,
            level,
            metadata,
            base,
            phys_end: base,
            buf: Vec::new(),
            buf_cap: opts.buffer_size,
            buf_start: 0,
            chunks: Vec::new(),
            chunk_cache: None,
            clean_sync: true,
        };

        if compression == CompressionFormat::None {
            inner.phys_end = file_len;
            inner.buf_start = file_len - base;
        } else {
            inner.rebuild_chunk_index(file_len)?;
        }

        Ok(inner)
    }

    /// Walk chunk frames to rebuild the boundary index. A torn trailing
    /// frame is discarded.
    fn rebuild_chunk_index(&mut self, file_len: u64) -> Result<()> {
        let mut phys = self.base;
        let mut logical = 0u64;
        self.file.seek(SeekFrom::Start(phys))?;

        while phys + CHUNK_FRAMING_LEN <= file_len {
            let mut framing = [0u8; CHUNK_FRAMING_LEN as usize];
            self.file.read_exact(&mut framing)?;
            let stored_len = u32::from_be_bytes(framing[..4].try_into().unwrap());
            let raw_len = u32::from_be_bytes(framing[4..].try_into().unwrap());
            if raw_len == 0 || phys + CHUNK_FRAMING_LEN + stored_len as u64 > file_len {
                break;
            }
            self.chunks.push(Chunk {
                logical_off: logical,
                raw_len,
                phys_off: phys,
                stored_len,
            });
            logical += raw_len as u64;
            phys += CHUNK_FRAMING_LEN + stored_len as u64;
            self.file.seek(SeekFrom::Start(phys))?;
        }

        if phys < file_len {
            if self.read_only {
                debug!(
                    "appendable {}: ignoring {} torn trailing bytes",
                    self.path.display(),
                    file_len - phys
                );
            } else {
                warn!(
                    "appendable {}: discarding {} torn trailing bytes",
                    self.path.display(),
                    file_len - phys
                );
                self.file.set_len(phys)?;
            }
        }

        self.phys_end = phys;
        self.buf_start = logical;
        Ok(())
    }

    fn check_open(&self) -> Result<()> {
        if self.closed {
            return Err(Error::AlreadyClosed);
        }
        Ok(())
    }

    fn check_writable(&self) -> Result<()> {
        self.check_open()?;
        if self.read_only {
            return Err(Error::ReadOnly);
        }
        Ok(())
    }

    /// Logical end of the stream, buffered bytes included.
    fn logical_end(&self) -> u64 {
        self.buf_start + self.buf.len() as u64
    }

    fn append(&mut self, bytes: &[u8]) -> Result<(u64, usize)> {
        self.check_writable()?;
        if bytes.is_empty() {
            return Err(Error::IllegalArguments("bytes"));
        }

        let off = self.logical_end();
        let mut rest = bytes;
        while !rest.is_empty() {
            let room = self.buf_cap - self.buf.len();
            let take = room.min(rest.len());
            self.buf.extend_from_slice(&rest[..take]);
            rest = &rest[take..];
            if self.buf.len() == self.buf_cap {
                self.seal_buffer()?;
            }
        }
        self.clean_sync = false;
        Ok((off, bytes.len()))
    }

    /// Write the buffered bytes out as one chunk (or raw bytes when
    /// uncompressed) and advance the flushed watermark.
    fn seal_buffer(&mut self) -> Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }

        self.file.seek(SeekFrom::Start(self.phys_end))?;
        match self.compression {
            CompressionFormat::None => {
                self.file.write_all(&self.buf)?;
                self.phys_end += self.buf.len() as u64;
            }
            format => {
                let stored = compression::compress(format, self.level, &self.buf)?;
                let mut frame = Vec::with_capacity(CHUNK_FRAMING_LEN as usize + stored.len());
                frame.extend_from_slice(&(stored.len() as u32).to_be_bytes());
                frame.extend_from_slice(&(self.buf.len() as u32).to_be_bytes());
                frame.extend_from_slice(&stored);
                self.file.write_all(&frame)?;
                self.chunks.push(Chunk {
                    logical_off: self.buf_start,
                    raw_len: self.buf.len() as u32,
                    phys_off: self.phys_end,
                    stored_len: stored.len() as u32,
                });
                self.phys_end += frame.len() as u64;
            }
        }
        self.buf_start += self.buf.len() as u64;
        self.buf.clear();
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.check_writable()?;
        self.seal_buffer()
    }

    fn sync(&mut self) -> Result<()> {
        self.check_writable()?;
        if self.clean_sync {
            return Ok(());
        }
        self.seal_buffer()?;
        self.file.sync_data()?;
        self.clean_sync = true;
        Ok(())
    }

    fn read_at(&mut self, dst: &mut [u8], off: u64) -> Result<usize> {
        self.check_open()?;
        let end = self.logical_end();
        if off >= end {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "read past end of appendable",
            )));
        }

        let n = dst.len().min((end - off) as usize);
        let mut filled = 0usize;

        // Flushed region first, then the in-memory buffer.
        if off < self.buf_start {
            let flushed_n = n.min((self.buf_start - off) as usize);
            match self.compression {
                CompressionFormat::None => {
                    self.file.seek(SeekFrom::Start(self.base + off))?;
                    self.file.read_exact(&mut dst[..flushed_n])?;
                }
                _ => self.read_chunked(&mut dst[..flushed_n], off)?,
            }
            filled = flushed_n;
        }

        if filled < n {
            let boff = (off + filled as u64 - self.buf_start) as usize;
            dst[filled..n].copy_from_slice(&self.buf[boff..boff + (n - filled)]);
        }

        Ok(n)
    }

    /// Read `dst.len()` bytes at logical `off` out of the compressed chunk
    /// sequence. `off..off + dst.len()` must lie within the flushed region.
    fn read_chunked(&mut self, dst: &mut [u8], mut off: u64) -> Result<()> {
        let mut filled = 0usize;
        while filled < dst.len() {
            // Last chunk with logical_off <= off.
            let idx = self.chunks.partition_point(|c| c.logical_off <= off) - 1;
            let chunk = self.chunks[idx];

            let cached = matches!(&self.chunk_cache, Some((c_off, _)) if *c_off == chunk.logical_off);
            if !cached {
                let mut stored = vec![0u8; chunk.stored_len as usize];
                self.file
                    .seek(SeekFrom::Start(chunk.phys_off + CHUNK_FRAMING_LEN))?;
                self.file.read_exact(&mut stored)?;
                let raw = compression::decompress(self.compression, &stored, chunk.raw_len as usize)?;
                self.chunk_cache = Some((chunk.logical_off, raw));
            }
            let raw = &self.chunk_cache.as_ref().unwrap().1;

            let start = (off - chunk.logical_off) as usize;
            let take = (dst.len() - filled).min(raw.len() - start);
            dst[filled..filled + take].copy_from_slice(&raw[start..start + take]);
            filled += take;
            off += take as u64;
        }
        Ok(())
    }

    fn set_offset(&mut self, off: u64) -> Result<()> {
        self.check_writable()?;
        let end = self.logical_end();
        if off > end {
            return Err(Error::IllegalArguments("offset"));
        }
        if off == end {
            return Ok(());
        }

        if off >= self.buf_start {
            self.buf.truncate((off - self.buf_start) as usize);
        } else {
            match self.compression {
                CompressionFormat::None => {
                    self.file.set_len(self.base + off)?;
                    self.phys_end = self.base + off;
                    self.buf.clear();
                    self.buf_start = off;
                }
                format => {
                    // Chunk containing `off` (or the boundary right at it).
                    let idx = self.chunks.partition_point(|c| c.logical_end() <= off);
                    let chunk = self.chunks[idx];
                    debug_assert!(chunk.logical_off <= off);

                    self.buf.clear();
                    if off > chunk.logical_off {
                        // Re-buffer the surviving prefix of the split chunk.
                        let mut stored = vec![0u8; chunk.stored_len as usize];
                        self.file
                            .seek(SeekFrom::Start(chunk.phys_off + CHUNK_FRAMING_LEN))?;
                        self.file.read_exact(&mut stored)?;
                        let raw = compression::decompress(format, &stored, chunk.raw_len as usize)?;
                        self.buf
                            .extend_from_slice(&raw[..(off - chunk.logical_off) as usize]);
                    }
                    self.buf_start = chunk.logical_off;
                    self.file.set_len(chunk.phys_off)?;
                    self.phys_end = chunk.phys_off;
                    self.chunks.truncate(idx);
                }
            }
            self.chunk_cache = None;
        }
        self.clean_sync = false;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Err(Error::AlreadyClosed);
        }
        if !self.read_only {
            self.seal_buffer()?;
            self.file.sync_data()?;
        }
        self.closed = true;
        Ok(())
    }
}

impl Appendable for AppendFile {
    fn metadata(&self) -> Result<Vec<u8>> {
        let inner = self.inner.lock();
        inner.check_open()?;
        Ok(inner.metadata.clone())
    }

    fn size(&self) -> Result<u64> {
        let inner = self.inner.lock();
        inner.check_open()?;
        Ok(inner.logical_end())
    }

    fn offset(&self) -> Result<u64> {
        self.size()
    }

    fn set_offset(&self, off: u64) -> Result<()> {
        self.inner.lock().set_offset(off)
    }

    fn append(&self, bytes: &[u8]) -> Result<(u64, usize)> {
        self.inner.lock().append(bytes)
    }

    fn flush(&self) -> Result<()> {
        self.inner.lock().flush()
    }

    fn sync(&self) -> Result<()> {
        self.inner.lock().sync()
    }

    fn read_at(&self, dst: &mut [u8], off: u64) -> Result<usize> {
        self.inner.lock().read_at(dst, off)
    }

    fn close(&self) -> Result<()> {
        self.inner.lock().close()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    use super::*;
    use crate::read_exact_at;

    fn small_buf_opts() -> Options {
        Options {
            buffer_size: 16,
            ..Options::default()
        }
    }

    #[test]
    fn append_read_roundtrip_across_buffer_boundary() {
        let dir = tempdir().unwrap();
        let app = AppendFile::open(dir.path().join("a.aof"), small_buf_opts()).unwrap();

        let payload: Vec<u8> = (0..100u8).collect();
        let (off, n) = app.append(&payload).unwrap();
        assert_eq!((off, n), (0, 100));
        let (off, _) = app.append(b"tail").unwrap();
        assert_eq!(off, 100);
        assert_eq!(app.size().unwrap(), 104);

        let mut dst = vec![0u8; 104];
        read_exact_at(&app, &mut dst, 0).unwrap();
        assert_eq!(&dst[..100], &payload[..]);
        assert_eq!(&dst[100..], b"tail");

        // Unflushed bytes are readable too.
        let mut dst = [0u8; 4];
        read_exact_at(&app, &mut dst, 100).unwrap();
        assert_eq!(&dst, b"tail");
    }

    #[test]
    fn reopen_preserves_contents_and_metadata() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.aof");

        let opts = Options {
            metadata: b"hello-meta".to_vec(),
            ..small_buf_opts()
        };
        let app = AppendFile::open(&path, opts).unwrap();
        app.append(&[7u8; 50]).unwrap();
        app.close().unwrap();

        let app = AppendFile::open(&path, small_buf_opts()).unwrap();
        assert_eq!(app.metadata().unwrap(), b"hello-meta");
        assert_eq!(app.size().unwrap(), 50);
        let mut dst = [0u8; 50];
        read_exact_at(&app, &mut dst, 0).unwrap();
        assert_eq!(dst, [7u8; 50]);

        let (off, _) = app.append(b"x").unwrap();
        assert_eq!(off, 50);
    }

    #[test]
    fn compressed_chunks_roundtrip_and_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.aof");
        let opts = Options {
            buffer_size: 32,
            compression: CompressionFormat::Gzip,
            ..Options::default()
        };

        let payload: Vec<u8> = (0..200u32).flat_map(|i| (i as u8).to_be_bytes()).collect();
        let app = AppendFile::open(&path, opts.clone()).unwrap();
        app.append(&payload).unwrap();
        app.flush().unwrap();
        app.append(b"after-flush").unwrap();
        app.close().unwrap();

        let app = AppendFile::open(&path, opts).unwrap();
        assert_eq!(app.size().unwrap(), payload.len() as u64 + 11);
        let mut dst = vec![0u8; payload.len() + 11];
        read_exact_at(&app, &mut dst, 0).unwrap();
        assert_eq!(&dst[..payload.len()], &payload[..]);
        assert_eq!(&dst[payload.len()..], b"after-flush");

        // A read spanning several chunks.
        let mut dst = vec![0u8; 100];
        read_exact_at(&app, &mut dst, 10).unwrap();
        assert_eq!(&dst[..], &payload[10..110]);
    }

    #[test]
    fn set_offset_truncates() {
        let dir = tempdir().unwrap();
        let app = AppendFile::open(dir.path().join("a.aof"), small_buf_opts()).unwrap();

        app.append(&[1u8; 40]).unwrap();
        Appendable::set_offset(&app, 24).unwrap();
        assert_eq!(app.size().unwrap(), 24);

        let (off, _) = app.append(&[2u8; 8]).unwrap();
        assert_eq!(off, 24);
        let mut dst = [0u8; 32];
        read_exact_at(&app, &mut dst, 0).unwrap();
        assert_eq!(&dst[..24], &[1u8; 24]);
        assert_eq!(&dst[24..], &[2u8; 8]);

        assert!(matches!(
            Appendable::set_offset(&app, 1000),
            Err(Error::IllegalArguments("offset"))
        ));
    }

    #[test]
    fn set_offset_splits_compressed_chunk() {
        let dir = tempdir().unwrap();
        let opts = Options {
            buffer_size: 16,
            compression: CompressionFormat::Zlib,
            ..Options::default()
        };
        let app = AppendFile::open(dir.path().join("a.aof"), opts).unwrap();

        let payload: Vec<u8> = (0..64u8).collect();
        app.append(&payload).unwrap();
        // 24 lands mid-chunk (chunks are 16 logical bytes).
        Appendable::set_offset(&app, 24).unwrap();
        assert_eq!(app.size().unwrap(), 24);

        app.append(&[0xff; 4]).unwrap();
        let mut dst = [0u8; 28];
        read_exact_at(&app, &mut dst, 0).unwrap();
        assert_eq!(&dst[..24], &payload[..24]);
        assert_eq!(&dst[24..], &[0xff; 4]);
    }

    #[test]
    fn torn_compressed_tail_is_discarded_on_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.aof");
        let opts = Options {
            buffer_size: 16,
            compression: CompressionFormat::Flate,
            ..Options::default()
        };

        let app = AppendFile::open(&path, opts.clone()).unwrap();
        app.append(&[9u8; 32]).unwrap();
        app.sync().unwrap();
        app.close().unwrap();

        // Simulate a torn chunk write.
        let mut f = OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(&[0x00, 0x00, 0x01, 0x00]).unwrap();
        drop(f);

        let app = AppendFile::open(&path, opts).unwrap();
        assert_eq!(app.size().unwrap(), 32);
        let (off, _) = app.append(b"z").unwrap();
        assert_eq!(off, 32);
    }

    #[test]
    fn read_only_rejects_mutators() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.aof");
        let app = AppendFile::open(&path, Options::default()).unwrap();
        app.append(b"data").unwrap();
        app.close().unwrap();

        let ro = AppendFile::open(
            &path,
            Options {
                read_only: true,
                ..Options::default()
            },
        )
        .unwrap();
        assert!(matches!(ro.append(b"x"), Err(Error::ReadOnly)));
        assert!(matches!(Appendable::set_offset(&ro, 0), Err(Error::ReadOnly)));
        assert!(matches!(ro.sync(), Err(Error::ReadOnly)));

        let mut dst = [0u8; 4];
        read_exact_at(&ro, &mut dst, 0).unwrap();
        assert_eq!(&dst, b"data");
    }

    #[test]
    fn closed_rejects_everything() {
        let dir = tempdir().unwrap();
        let app = AppendFile::open(dir.path().join("a.aof"), Options::default()).unwrap();
        app.append(b"x").unwrap();
        app.close().unwrap();

        assert!(matches!(app.append(b"y"), Err(Error::AlreadyClosed)));
        assert!(matches!(app.size(), Err(Error::AlreadyClosed)));
        assert!(matches!(app.read_at(&mut [0u8; 1], 0), Err(Error::AlreadyClosed)));
        assert!(matches!(app.close(), Err(Error::AlreadyClosed)));
    }

    #[test]
    fn sync_is_idempotent() {
        let dir = tempdir().unwrap();
        let app = AppendFile::open(dir.path().join("a.aof"), Options::default()).unwrap();
        app.append(b"payload").unwrap();
        app.sync().unwrap();
        app.sync().unwrap();
        assert_eq!(app.size().unwrap(), 7);
    }

    #[test]
    fn empty_append_is_rejected() {
        let dir = tempdir().unwrap();
        let app = AppendFile::open(dir.path().join("a.aof"), Options::default()).unwrap();
        assert!(matches!(app.append(&[]), Err(Error::IllegalArguments("bytes"))));
    }
}
