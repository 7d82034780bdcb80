//! A single logical append-only stream striped over fixed-size chunk files.

use std::fs;
use std::io;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};

use log::{debug, warn};
use lru::LruCache;
use parking_lot::Mutex;

use crate::file::AppendFile;
use crate::{chunk_file_path, parse_chunk_file_name, Appendable, Error, Options, Result};

/// An unbounded append-only stream over a directory of chunk files
/// `00000000000000000000.<ext>`, `00000000000000000001.<ext>`, …
///
/// Every chunk file holds exactly `file_size` *logical* bytes once complete;
/// the highest ordinal is the write head. Completed files are reopened
/// read-only on demand, with at most `max_opened_files` handles alive.
#[derive(Debug)]
pub struct MultiAppend {
    inner: Mutex<MultiInner>,
}

#[derive(Debug)]
struct MultiInner {
    dir: PathBuf,
    opts: Options,
    read_only: bool,
    closed: bool,

    file_size: u64,
    metadata: Vec<u8>,

    head_ordinal: u64,
    head: AppendFile,
    /// Read-only handles for completed chunk files, by ordinal.
    cache: LruCache<u64, AppendFile>,
}

/// The per-file metadata blob carries the stream geometry in front of the
/// caller's metadata, so reopening does not depend on options agreeing with
/// what is on disk.
fn encode_stream_meta(file_size: u64, user: &[u8]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(8 + user.len());
    blob.extend_from_slice(&file_size.to_be_bytes());
    blob.extend_from_slice(user);
    blob
}

fn decode_stream_meta(blob: &[u8]) -> Result<(u64, Vec<u8>)> {
    if blob.len() < 8 {
        return Err(Error::Corrupted("truncated multi-appendable metadata".into()));
    }
    let file_size = u64::from_be_bytes(blob[..8].try_into().unwrap());
    if file_size == 0 {
        return Err(Error::Corrupted("zero file_size in multi-appendable metadata".into()));
    }
    Ok((file_size, blob[8..].to_vec()))
}

impl MultiAppend {
    /// Open or create the striped stream rooted at `dir`.
    pub fn open(dir: impl AsRef<Path>, opts: Options) -> Result<Self> {
        opts.validate()?;
        let dir = dir.as_ref().to_path_buf();

        if dir.exists() {
            if !dir.is_dir() {
                return Err(Error::PathIsNotADirectory(dir));
            }
        } else if opts.read_only {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no such multi-appendable: {}", dir.display()),
            )));
        } else {
            create_dir_with_mode(&dir, opts.file_mode)?;
        }

        let mut ordinals = existing_ordinals(&dir, &opts.file_ext)?;

        let mut file_opts = opts.clone();
        let (head_ordinal, head, file_size, metadata) = match ordinals.pop() {
            None => {
                if opts.read_only {
                    return Err(Error::Corrupted(format!(
                        "empty multi-appendable: {}",
                        dir.display()
                    )));
                }
                file_opts.metadata = encode_stream_meta(opts.file_size, &opts.metadata);
                let head = AppendFile::open(chunk_file_path(&dir, 0, &opts.file_ext), file_opts)?;
                (0, head, opts.file_size, opts.metadata.clone())
            }
            Some(last) => {
                debug!("multi-appendable {}: resuming at file {last}", dir.display());
                let head = AppendFile::open(chunk_file_path(&dir, last, &opts.file_ext), file_opts)?;
                let blob = if last == 0 {
                    head.metadata()?
                } else {
                    let first = AppendFile::open(
                        chunk_file_path(&dir, 0, &opts.file_ext),
                        read_only_opts(&opts),
                    )?;
                    let blob = first.metadata()?;
                    first.close()?;
                    blob
                };
                let (file_size, metadata) = decode_stream_meta(&blob)?;
                if file_size != opts.file_size {
                    debug!(
                        "multi-appendable {}: stored file_size {file_size} overrides requested {}",
                        dir.display(),
                        opts.file_size
                    );
                }
                (last, head, file_size, metadata)
            }
        };

        let cache_cap = NonZeroUsize::new(opts.max_opened_files)
            .ok_or(Error::IllegalArguments("max_opened_files"))?;

        Ok(Self {
            inner: Mutex::new(MultiInner {
                dir,
                read_only: opts.read_only,
                closed: false,
                opts,
                file_size,
                metadata,
                head_ordinal,
                head,
                cache: LruCache::new(cache_cap),
            }),
        })
    }
}

fn read_only_opts(opts: &Options) -> Options {
    Options {
        read_only: true,
        metadata: Vec::new(),
        ..opts.clone()
    }
}

fn create_dir_with_mode(dir: &Path, mode: u32) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt as _;
        fs::DirBuilder::new().recursive(true).mode(mode).create(dir)?;
    }
    #[cfg(not(unix))]
    {
        let _ = mode;
        fs::create_dir_all(dir)?;
    }
    Ok(())
}

fn existing_ordinals(dir: &Path, ext: &str) -> Result<Vec<u64>> {
    let mut ordinals = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if let Some(ordinal) = parse_chunk_file_name(name, ext) {
            ordinals.push(ordinal);
        }
    }
    ordinals.sort_unstable();
    Ok(ordinals)
}

impl MultiInner {
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

    fn logical_end(&self) -> Result<u64> {
        Ok(self.head_ordinal * self.file_size + self.head.size()?)
    }

    /// Seal the head file and start the next one.
    fn roll(&mut self) -> Result<()> {
        debug_assert_eq!(self.head.size()?, self.file_size);
        self.head.close()?;

        let next = self.head_ordinal + 1;
        let mut file_opts = self.opts.clone();
        file_opts.metadata = encode_stream_meta(self.file_size, &self.metadata);
        let head = AppendFile::open(chunk_file_path(&self.dir, next, &self.opts.file_ext), file_opts)?;
        debug!("multi-appendable {}: rolled to file {next}", self.dir.display());

        self.head = head;
        self.head_ordinal = next;
        Ok(())
    }

    fn append(&mut self, bytes: &[u8]) -> Result<(u64, usize)> {
        self.check_writable()?;
        if bytes.is_empty() {
            return Err(Error::IllegalArguments("bytes"));
        }

        let off = self.logical_end()?;
        let mut rest = bytes;
        while !rest.is_empty() {
            let room = self.file_size - self.head.size()?;
            if room == 0 {
                self.roll()?;
                continue;
            }
            let take = rest.len().min(room as usize);
            self.head.append(&rest[..take])?;
            rest = &rest[take..];
        }
        Ok((off, bytes.len()))
    }

    /// Fetch a read handle for a completed chunk file, caching it.
    fn reader(&mut self, ordinal: u64) -> Result<&AppendFile> {
        if !self.cache.contains(&ordinal) {
            let app = AppendFile::open(
                chunk_file_path(&self.dir, ordinal, &self.opts.file_ext),
                read_only_opts(&self.opts),
            )?;
            if let Some((evicted, handle)) = self.cache.push(ordinal, app) {
                debug_assert_ne!(evicted, ordinal);
                if let Err(e) = handle.close() {
                    warn!("failed to close evicted chunk file {evicted}: {e}");
                }
            }
        }
        Ok(self.cache.get(&ordinal).unwrap())
    }

    fn read_at(&mut self, dst: &mut [u8], off: u64) -> Result<usize> {
        self.check_open()?;
        let end = self.logical_end()?;
        if off >= end {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "read past end of multi-appendable",
            )));
        }

        let n = dst.len().min((end - off) as usize);
        let mut filled = 0usize;
        while filled < n {
            let pos = off + filled as u64;
            let ordinal = pos / self.file_size;
            let inner_off = pos % self.file_size;
            let take = (n - filled).min((self.file_size - inner_off) as usize);

            let dst = &mut dst[filled..filled + take];
            if ordinal == self.head_ordinal {
                crate::read_exact_at(&self.head, dst, inner_off)?;
            } else {
                let reader = self.reader(ordinal)?;
                let mut read = 0;
                while read < dst.len() {
                    let m = reader.read_at(&mut dst[read..], inner_off + read as u64)?;
                    read += m;
                }
            }
            filled += take;
        }
        Ok(n)
    }

    fn set_offset(&mut self, off: u64) -> Result<()> {
        self.check_writable()?;
        let end = self.logical_end()?;
        if off > end {
            return Err(Error::IllegalArguments("offset"));
        }
        if off == end {
            return Ok(());
        }

        let target = off / self.file_size;
        let inner_off = off % self.file_size;

        // Stale read handles at or past the target, and whole files past it.
        let stale: Vec<u64> = self
            .cache
            .iter()
            .map(|(ord, _)| *ord)
            .filter(|ord| *ord >= target)
            .collect();
        for ordinal in stale {
            self.cache.pop(&ordinal);
        }
        for ordinal in (target + 1)..=self.head_ordinal {
            let path = chunk_file_path(&self.dir, ordinal, &self.opts.file_ext);
            warn!("multi-appendable {}: removing file {ordinal}", self.dir.display());
            fs::remove_file(path)?;
        }

        if self.head_ordinal != target {
            let mut file_opts = self.opts.clone();
            file_opts.metadata = encode_stream_meta(self.file_size, &self.metadata);
            self.head = AppendFile::open(chunk_file_path(&self.dir, target, &self.opts.file_ext), file_opts)?;
            self.head_ordinal = target;
        }
        self.head.set_offset(inner_off)
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Err(Error::AlreadyClosed);
        }
        while let Some((ordinal, handle)) = self.cache.pop_lru() {
            if let Err(e) = handle.close() {
                warn!("failed to close chunk file {ordinal}: {e}");
            }
        }
        self.head.close()?;
        self.closed = true;
        Ok(())
    }
}

impl Appendable for MultiAppend {
    fn metadata(&self) -> Result<Vec<u8>> {
        let inner = self.inner.lock();
        inner.check_open()?;
        Ok(inner.metadata.clone())
    }

    fn size(&self) -> Result<u64> {
        let inner = self.inner.lock();
        inner.check_open()?;
        inner.logical_end()
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
        let mut inner = self.inner.lock();
        inner.check_writable()?;
        inner.head.flush()
    }

    fn sync(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.check_writable()?;
        inner.head.sync()
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
    use proptest::prelude::*;
    use tempfile::tempdir;

    use super::*;
    use crate::read_exact_at;

    fn small_opts() -> Options {
        Options {
            file_size: 64,
            buffer_size: 16,
            max_opened_files: 2,
            file_ext: "val".to_owned(),
            ..Options::default()
        }
    }

    #[test]
    fn appends_stripe_over_files() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("val_0");
        let app = MultiAppend::open(&root, small_opts()).unwrap();

        let payload: Vec<u8> = (0..200u8).collect();
        let (off, n) = app.append(&payload).unwrap();
        assert_eq!((off, n), (0, 200));
        assert_eq!(app.size().unwrap(), 200);

        // 64-byte files: ordinals 0..=2 complete, 3 is the head.
        for ordinal in 0..=3u64 {
            assert!(root.join(crate::chunk_file_name(ordinal, "val")).exists());
        }

        let mut dst = vec![0u8; 200];
        read_exact_at(&app, &mut dst, 0).unwrap();
        assert_eq!(dst, payload);

        // A read spanning a file boundary.
        let mut dst = [0u8; 20];
        read_exact_at(&app, &mut dst, 60).unwrap();
        assert_eq!(&dst[..], &payload[60..80]);
    }

    #[test]
    fn reopen_restores_size_and_metadata() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("tx");
        let opts = Options {
            metadata: b"stream-meta".to_vec(),
            ..small_opts()
        };

        let app = MultiAppend::open(&root, opts.clone()).unwrap();
        app.append(&[3u8; 150]).unwrap();
        app.close().unwrap();

        let app = MultiAppend::open(&root, opts).unwrap();
        assert_eq!(app.size().unwrap(), 150);
        assert_eq!(app.metadata().unwrap(), b"stream-meta");

        let (off, _) = app.append(&[4u8; 10]).unwrap();
        assert_eq!(off, 150);
        let mut dst = [0u8; 160];
        read_exact_at(&app, &mut dst, 0).unwrap();
        assert_eq!(&dst[..150], &[3u8; 150][..]);
        assert_eq!(&dst[150..], &[4u8; 10][..]);
    }

    #[test]
    fn lru_keeps_reads_working_past_the_handle_cap() {
        let dir = tempdir().unwrap();
        let app = MultiAppend::open(dir.path().join("val_0"), small_opts()).unwrap();

        // 6 files of 64 bytes, max_opened_files = 2.
        let payload: Vec<u8> = (0..384u16).map(|i| (i % 251) as u8).collect();
        app.append(&payload).unwrap();

        // Jump around so handles get evicted and reopened.
        for &(off, len) in &[(0u64, 64usize), (320, 30), (64, 64), (200, 100), (10, 300)] {
            let mut dst = vec![0u8; len];
            read_exact_at(&app, &mut dst, off).unwrap();
            assert_eq!(&dst[..], &payload[off as usize..off as usize + len]);
        }
    }

    #[test]
    fn set_offset_drops_whole_files() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("val_0");
        let app = MultiAppend::open(&root, small_opts()).unwrap();

        app.append(&[1u8; 200]).unwrap();
        Appendable::set_offset(&app, 70).unwrap();
        assert_eq!(app.size().unwrap(), 70);
        assert!(!root.join(crate::chunk_file_name(2, "val")).exists());
        assert!(!root.join(crate::chunk_file_name(3, "val")).exists());

        let (off, _) = app.append(&[2u8; 4]).unwrap();
        assert_eq!(off, 70);
        let mut dst = [0u8; 74];
        read_exact_at(&app, &mut dst, 0).unwrap();
        assert_eq!(&dst[..70], &[1u8; 70][..]);
        assert_eq!(&dst[70..], &[2u8; 4][..]);
    }

    #[test]
    fn non_directory_path_is_rejected() {
        let dir = tempdir().unwrap();
        let file_path = dir.path().join("plain");
        std::fs::write(&file_path, b"not a dir").unwrap();

        match MultiAppend::open(&file_path, small_opts()) {
            Err(Error::PathIsNotADirectory(p)) => assert_eq!(p, file_path),
            other => panic!("expected PathIsNotADirectory, got {other:?}"),
        }
    }

    proptest! {
        #[test]
        fn random_appends_match_in_memory_model(
            chunks in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 1..100), 1..40),
            reads in proptest::collection::vec((any::<u16>(), 1..200usize), 1..20),
        ) {
            let dir = tempdir().unwrap();
            let app = MultiAppend::open(dir.path().join("val_0"), small_opts()).unwrap();

            let mut model = Vec::new();
            for chunk in &chunks {
                let (off, n) = app.append(chunk).unwrap();
                prop_assert_eq!((off, n), (model.len() as u64, chunk.len()));
                model.extend_from_slice(chunk);
            }

            for (off, len) in reads {
                let off = off as u64 % model.len() as u64;
                let mut dst = vec![0u8; len];
                let n = app.read_at(&mut dst, off).unwrap();
                prop_assert_eq!(&dst[..n], &model[off as usize..off as usize + n]);
            }
        }
    }
}
