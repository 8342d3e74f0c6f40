//! Byte suppliers.
//!
//! A [`Source`] is a seekable byte supply with deferred seeks: `seek` only
//! records the position, and the effect happens on the next `consume` or
//! `store`. `consume` returns the available prefix when the supply ends
//! before `n` bytes; the loader turns that into a `ShortRead` annotation on
//! the consuming region rather than a fatal error.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::rc::Rc;

use log::trace;

use std::cell::RefCell;

use crate::err::{Error, Result};

/// Shared handle to a source. A single region tree is single-threaded, so
/// `Rc<RefCell<_>>` is the ownership model throughout.
pub type SharedSource = Rc<RefCell<dyn Source>>;

pub trait Source {
    /// Records the position for the next read or write. Always legal, even
    /// past the end of a bounded source.
    fn seek(&mut self, offset: u64);

    /// Reads up to `n` bytes at the current position, advancing it by the
    /// number returned. Fewer than `n` bytes come back only at the end of
    /// the supply; OS-level failures surface as `Error::Read`.
    fn consume(&mut self, n: usize) -> Result<Vec<u8>>;

    /// Writes `data` at the current position. Read-only sources fail with
    /// `Error::ReadOnlySource`.
    fn store(&mut self, data: &[u8]) -> Result<usize>;

    /// Total size, when known. `None` for unbounded supplies (live streams,
    /// process memory).
    fn size(&self) -> Option<u64>;

    /// For windows over another source: the parent and this window's base
    /// offset within it. Lets file-offset pointers escape to the outermost
    /// supply.
    fn outer(&self) -> Option<(SharedSource, u64)> {
        None
    }
}

/// Seeks then reads; the workhorse of the loader.
pub fn read_at(source: &SharedSource, offset: u64, n: usize) -> Result<Vec<u8>> {
    let mut src = source.borrow_mut();
    src.seek(offset);
    src.consume(n)
}

/// Like [`read_at`] but a short result is an error, for callers that cannot
/// make progress on a prefix.
pub fn read_exact_at(source: &SharedSource, offset: u64, n: usize) -> Result<Vec<u8>> {
    let bytes = read_at(source, offset, n)?;
    if bytes.len() < n {
        return Err(Error::ShortRead {
            offset,
            wanted: n as u64,
            got: bytes.len() as u64,
        });
    }
    Ok(bytes)
}

/// Seeks then writes.
pub fn store_at(source: &SharedSource, offset: u64, data: &[u8]) -> Result<usize> {
    let mut src = source.borrow_mut();
    src.seek(offset);
    src.store(data)
}

/// Walks the window chain down to the outermost source.
pub fn outermost(source: &SharedSource) -> SharedSource {
    let mut cur = Rc::clone(source);
    loop {
        let next = cur.borrow().outer().map(|(parent, _)| parent);
        match next {
            Some(parent) => cur = parent,
            None => return cur,
        }
    }
}

/// In-memory buffer, writable by default. The common backing for parsed
/// byte strings, clones and decoded codec output.
pub struct MemSource {
    data: Vec<u8>,
    pos: u64,
    writable: bool,
}

impl MemSource {
    pub fn new(data: impl Into<Vec<u8>>) -> MemSource {
        MemSource {
            data: data.into(),
            pos: 0,
            writable: true,
        }
    }

    pub fn read_only(data: impl Into<Vec<u8>>) -> MemSource {
        MemSource {
            writable: false,
            ..MemSource::new(data)
        }
    }

    pub fn zeroed(len: usize) -> MemSource {
        MemSource::new(vec![0u8; len])
    }

    pub fn shared(data: impl Into<Vec<u8>>) -> SharedSource {
        Rc::new(RefCell::new(MemSource::new(data)))
    }

    pub fn into_shared(self) -> SharedSource {
        Rc::new(RefCell::new(self))
    }
}

impl Source for MemSource {
    fn seek(&mut self, offset: u64) {
        self.pos = offset;
    }

    fn consume(&mut self, n: usize) -> Result<Vec<u8>> {
        let start = (self.pos as usize).min(self.data.len());
        let end = start.saturating_add(n).min(self.data.len());
        self.pos = end as u64;
        Ok(self.data[start..end].to_vec())
    }

    fn store(&mut self, data: &[u8]) -> Result<usize> {
        if !self.writable {
            return Err(Error::ReadOnlySource);
        }
        let start = self.pos as usize;
        let end = start + data.len();
        if end > self.data.len() {
            self.data.resize(end, 0);
        }
        self.data[start..end].copy_from_slice(data);
        self.pos = end as u64;
        Ok(data.len())
    }

    fn size(&self) -> Option<u64> {
        Some(self.data.len() as u64)
    }
}

/// Local file. Bounded; writable when opened through [`FileSource::create`]
/// or [`FileSource::open_rw`].
pub struct FileSource {
    file: File,
    pos: u64,
    len: u64,
    writable: bool,
}

impl FileSource {
    pub fn open(path: impl AsRef<Path>) -> Result<FileSource> {
        let file = File::open(path).map_err(|e| Error::Read { offset: 0, source: e })?;
        Self::from_file(file, false)
    }

    pub fn open_rw(path: impl AsRef<Path>) -> Result<FileSource> {
        let file = File::options()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| Error::Read { offset: 0, source: e })?;
        Self::from_file(file, true)
    }

    pub fn create(path: impl AsRef<Path>) -> Result<FileSource> {
        let file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(|e| Error::Write { offset: 0, source: e })?;
        Self::from_file(file, true)
    }

    fn from_file(file: File, writable: bool) -> Result<FileSource> {
        let len = file
            .metadata()
            .map_err(|e| Error::Read { offset: 0, source: e })?
            .len();
        Ok(FileSource {
            file,
            pos: 0,
            len,
            writable,
        })
    }

    pub fn into_shared(self) -> SharedSource {
        Rc::new(RefCell::new(self))
    }
}

impl Source for FileSource {
    fn seek(&mut self, offset: u64) {
        self.pos = offset;
    }

    fn consume(&mut self, n: usize) -> Result<Vec<u8>> {
        let offset = self.pos;
        self.file
            .seek(SeekFrom::Start(offset))
            .map_err(|e| Error::Read { offset, source: e })?;

        let mut buf = Vec::with_capacity(n);
        let got = (&mut self.file)
            .take(n as u64)
            .read_to_end(&mut buf)
            .map_err(|e| Error::Read { offset, source: e })?;
        trace!("file read at 0x{offset:x}: wanted {n}, got {got}");
        self.pos += got as u64;
        Ok(buf)
    }

    fn store(&mut self, data: &[u8]) -> Result<usize> {
        if !self.writable {
            return Err(Error::ReadOnlySource);
        }
        let offset = self.pos;
        self.file
            .seek(SeekFrom::Start(offset))
            .map_err(|e| Error::Write { offset, source: e })?;
        self.file
            .write_all(data)
            .map_err(|e| Error::Write { offset, source: e })?;
        self.pos += data.len() as u64;
        self.len = self.len.max(self.pos);
        Ok(data.len())
    }

    fn size(&self) -> Option<u64> {
        Some(self.len)
    }
}

/// Bounded window `[base, base + cap)` over a parent source. Reads and
/// writes clamp at the cap.
pub struct WindowSource {
    parent: SharedSource,
    base: u64,
    cap: u64,
    pos: u64,
}

impl WindowSource {
    pub fn new(parent: SharedSource, base: u64, cap: u64) -> WindowSource {
        WindowSource {
            parent,
            base,
            cap,
            pos: 0,
        }
    }

    pub fn shared(parent: SharedSource, base: u64, cap: u64) -> SharedSource {
        Rc::new(RefCell::new(WindowSource::new(parent, base, cap)))
    }
}

impl Source for WindowSource {
    fn seek(&mut self, offset: u64) {
        self.pos = offset;
    }

    fn consume(&mut self, n: usize) -> Result<Vec<u8>> {
        let remaining = self.cap.saturating_sub(self.pos);
        let take = (n as u64).min(remaining) as usize;
        let bytes = read_at(&self.parent, self.base + self.pos, take)?;
        self.pos += bytes.len() as u64;
        Ok(bytes)
    }

    fn store(&mut self, data: &[u8]) -> Result<usize> {
        let remaining = self.cap.saturating_sub(self.pos);
        if (data.len() as u64) > remaining {
            return Err(Error::Write {
                offset: self.pos,
                source: std::io::Error::new(
                    std::io::ErrorKind::WriteZero,
                    "write extends past window cap",
                ),
            });
        }
        let written = store_at(&self.parent, self.base + self.pos, data)?;
        self.pos += written as u64;
        Ok(written)
    }

    fn size(&self) -> Option<u64> {
        match self.parent.borrow().size() {
            Some(parent_len) => Some(self.cap.min(parent_len.saturating_sub(self.base))),
            None => Some(self.cap),
        }
    }

    fn outer(&self) -> Option<(SharedSource, u64)> {
        Some((Rc::clone(&self.parent), self.base))
    }
}

/// Wraps a chunk-yielding producer, caching consumed bytes so earlier
/// offsets stay seekable. Unbounded until the producer runs dry.
pub struct IterSource {
    chunks: Box<dyn Iterator<Item = Vec<u8>>>,
    cache: Vec<u8>,
    pos: u64,
    exhausted: bool,
}

impl IterSource {
    pub fn new(chunks: impl Iterator<Item = Vec<u8>> + 'static) -> IterSource {
        IterSource {
            chunks: Box::new(chunks),
            cache: Vec::new(),
            pos: 0,
            exhausted: false,
        }
    }

    pub fn into_shared(self) -> SharedSource {
        Rc::new(RefCell::new(self))
    }

    fn fill_to(&mut self, end: u64) {
        while !self.exhausted && (self.cache.len() as u64) < end {
            match self.chunks.next() {
                Some(chunk) => self.cache.extend_from_slice(&chunk),
                None => self.exhausted = true,
            }
        }
    }
}

impl Source for IterSource {
    fn seek(&mut self, offset: u64) {
        self.pos = offset;
    }

    fn consume(&mut self, n: usize) -> Result<Vec<u8>> {
        self.fill_to(self.pos + n as u64);
        let start = (self.pos as usize).min(self.cache.len());
        let end = start.saturating_add(n).min(self.cache.len());
        self.pos = end as u64;
        Ok(self.cache[start..end].to_vec())
    }

    fn store(&mut self, _data: &[u8]) -> Result<usize> {
        Err(Error::ReadOnlySource)
    }

    fn size(&self) -> Option<u64> {
        if self.exhausted {
            Some(self.cache.len() as u64)
        } else {
            None
        }
    }
}

/// Live process memory through `/proc/<pid>/mem`. Unbounded and sparse:
/// reads of unmapped pages fail with `Error::Read`.
#[cfg(target_os = "linux")]
pub struct ProcSource {
    mem: File,
    pos: u64,
}

#[cfg(target_os = "linux")]
impl ProcSource {
    pub fn attach(pid: u32) -> Result<ProcSource> {
        let mem = File::open(format!("/proc/{pid}/mem"))
            .map_err(|e| Error::Read { offset: 0, source: e })?;
        Ok(ProcSource { mem, pos: 0 })
    }

    pub fn into_shared(self) -> SharedSource {
        Rc::new(RefCell::new(self))
    }
}

#[cfg(target_os = "linux")]
impl Source for ProcSource {
    fn seek(&mut self, offset: u64) {
        self.pos = offset;
    }

    fn consume(&mut self, n: usize) -> Result<Vec<u8>> {
        let offset = self.pos;
        self.mem
            .seek(SeekFrom::Start(offset))
            .map_err(|e| Error::Read { offset, source: e })?;
        let mut buf = vec![0u8; n];
        self.mem
            .read_exact(&mut buf)
            .map_err(|e| Error::Read { offset, source: e })?;
        self.pos += n as u64;
        Ok(buf)
    }

    fn store(&mut self, _data: &[u8]) -> Result<usize> {
        Err(Error::ReadOnlySource)
    }

    fn size(&self) -> Option<u64> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_mem_source_short_read_at_end() {
        let src = MemSource::shared(vec![1, 2, 3, 4]);
        assert_eq!(read_at(&src, 2, 4).unwrap(), vec![3, 4]);
        assert_eq!(read_at(&src, 6, 4).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn test_mem_source_store_extends() {
        let src = MemSource::shared(vec![0; 2]);
        store_at(&src, 1, &[0xaa, 0xbb]).unwrap();
        assert_eq!(read_at(&src, 0, 4).unwrap(), vec![0, 0xaa, 0xbb]);
    }

    #[test]
    fn test_read_only_mem_source_rejects_store() {
        let src = MemSource::read_only(vec![0; 4]).into_shared();
        assert!(matches!(
            store_at(&src, 0, &[1]),
            Err(Error::ReadOnlySource)
        ));
    }

    #[test]
    fn test_window_clamps_at_cap() {
        let parent = MemSource::shared((0u8..16).collect::<Vec<_>>());
        let win = WindowSource::shared(Rc::clone(&parent), 4, 4);

        assert_eq!(read_at(&win, 0, 8).unwrap(), vec![4, 5, 6, 7]);
        assert_eq!(read_at(&win, 4, 1).unwrap(), Vec::<u8>::new());
        assert_eq!(win.borrow().size(), Some(4));
    }

    #[test]
    fn test_window_outer_chain() {
        let parent = MemSource::shared(vec![0; 32]);
        let mid = WindowSource::shared(Rc::clone(&parent), 8, 16);
        let leaf = WindowSource::shared(Rc::clone(&mid), 4, 4);

        let out = outermost(&leaf);
        assert!(Rc::ptr_eq(&out, &parent));
    }

    #[test]
    fn test_iter_source_caches_for_seeks() {
        let chunks = vec![vec![1u8, 2], vec![3, 4, 5]].into_iter();
        let src = IterSource::new(chunks).into_shared();

        assert_eq!(src.borrow().size(), None);
        assert_eq!(read_at(&src, 3, 2).unwrap(), vec![4, 5]);
        // Seek backwards into cached bytes.
        assert_eq!(read_at(&src, 0, 3).unwrap(), vec![1, 2, 3]);
        // Reading past the end exhausts the producer and bounds the source.
        assert_eq!(read_at(&src, 5, 1).unwrap(), Vec::<u8>::new());
        assert_eq!(src.borrow().size(), Some(5));
    }

    #[test]
    fn test_read_exact_at_errors_on_short() {
        let src = MemSource::shared(vec![1, 2]);
        let err = read_exact_at(&src, 0, 4).unwrap_err();
        assert!(matches!(
            err,
            Error::ShortRead {
                offset: 0,
                wanted: 4,
                got: 2
            }
        ));
    }
}
