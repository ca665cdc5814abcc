// Copyright 2025 Crrow
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Chunk types: the nodes a [`ChunkQueue`](crate::ChunkQueue) is made of.
//!
//! A [`Chunk`] is either an in-memory buffer or a byte range of a file. Both
//! carry an `offset` counting the bytes already consumed from the chunk's
//! logical start:
//!
//! ```text
//!   Mem:   [ consumed | remaining ]            size = buf.len()
//!   File:  start ──► [ consumed | remaining ]  size = length
//! ```
//!
//! A chunk with `offset == size` is finished and only waits for compaction.

use std::{
    fs::File,
    io,
    path::{Path, PathBuf},
    sync::Arc,
};

use bytes::{Buf, BytesMut};
use snafu::{ResultExt, ensure};
use tempfile::TempPath;
use tracing::debug;

use crate::{
    Result,
    error::{FileTooShortSnafu, OpenFileSnafu, ReadFileSnafu},
    window::{MmapWindow, WindowPolicy, to_index, write_all_at},
};

/// Memory buffers with a larger allocation are freed instead of recycled.
pub const MAX_RECYCLED_CAPACITY: usize = 16 * 1024;

/// The file a file chunk reads from.
///
/// Shared by every chunk that references the same file. A temporary file is
/// removed from disk when the last reference goes away.
#[derive(Debug)]
pub enum FileSource {
    /// A file owned by someone else; never deleted by the queue.
    Named(PathBuf),
    /// A spill file owned by the queue.
    Temp(TempPath),
}

impl FileSource {
    #[must_use]
    pub fn path(&self) -> &Path {
        match self {
            Self::Named(path) => path.as_path(),
            Self::Temp(path) => &**path,
        }
    }

    #[must_use]
    pub fn is_temp(&self) -> bool { matches!(self, Self::Temp(_)) }
}

impl Drop for FileSource {
    fn drop(&mut self) {
        if let Self::Temp(path) = self {
            debug!(path = ?path.to_path_buf(), "Removing spill file");
        }
    }
}

/// A byte range `[start, start + length)` of a file.
#[derive(Debug)]
pub struct FileChunk {
    source:      Arc<FileSource>,
    start:       u64,
    length:      u64,
    /// Opened on first access.
    file:        Option<File>,
    /// File size observed at open time, kept current by spill appends.
    file_size:   u64,
    window:      Option<MmapWindow>,
    /// Set once mapping failed so later windows go straight to reads.
    mmap_failed: bool,
    windows:     u32,
    /// Spill file still accepting appends at `start + length`.
    appendable:  bool,
}

impl FileChunk {
    pub(crate) fn new(source: Arc<FileSource>, start: u64, length: u64) -> Self {
        Self {
            source,
            start,
            length,
            file: None,
            file_size: 0,
            window: None,
            mmap_failed: false,
            windows: 0,
            appendable: false,
        }
    }

    /// Wraps a freshly written spill file holding `length` bytes.
    pub(crate) fn spill(file: File, path: TempPath, length: u64) -> Self {
        Self {
            file: Some(file),
            file_size: length,
            appendable: true,
            ..Self::new(Arc::new(FileSource::Temp(path)), 0, length)
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path { self.source.path() }

    #[must_use]
    pub fn source(&self) -> &Arc<FileSource> { &self.source }

    /// First byte of the range, relative to the start of the file.
    #[must_use]
    pub fn start(&self) -> u64 { self.start }

    #[must_use]
    pub fn length(&self) -> u64 { self.length }

    #[must_use]
    pub fn is_temp(&self) -> bool { self.source.is_temp() }

    /// Number of windows (mapped or read-ahead) established so far.
    #[must_use]
    pub fn windows_mapped(&self) -> u32 { self.windows }

    /// The current window, if one is established.
    #[must_use]
    pub fn window(&self) -> Option<&MmapWindow> { self.window.as_ref() }

    /// Opens the file if needed and returns its descriptor, for senders that
    /// hand the range to the kernel directly.
    pub fn file(&mut self) -> Result<&File> {
        if self.file.is_none() {
            self.open_checked()?;
        }
        match &self.file {
            Some(file) => Ok(file),
            None => unreachable!("file opened above"),
        }
    }

    fn open_checked(&mut self) -> Result<()> {
        let path = self.source.path();
        let file = File::open(path).context(OpenFileSnafu { path })?;
        let file_size = file.metadata().context(OpenFileSnafu { path })?.len();
        // A range that overflows u64 ends past any file.
        let needed = self.start.checked_add(self.length).unwrap_or(u64::MAX);
        ensure!(
            needed <= file_size,
            FileTooShortSnafu {
                path,
                needed,
                actual: file_size,
            }
        );
        debug!(path = ?path, file_size, "Opened file chunk");
        self.file = Some(file);
        self.file_size = file_size;
        Ok(())
    }

    /// Readable bytes at chunk offset `offset`, up to the end of the current
    /// window.
    fn data(&mut self, offset: u64, policy: WindowPolicy) -> Result<&[u8]> {
        if self.file.is_none() {
            self.open_checked()?;
        }
        // The range was checked against the file size when opened.
        let pos = self.start + offset;
        let end = self.start + self.length;
        if pos >= end {
            return Ok(&[]);
        }
        if !self.window.as_ref().is_some_and(|w| w.contains(pos)) {
            let window = self.establish_window(pos, end, policy)?;
            self.window = Some(window);
        }
        Ok(self.window.as_ref().map_or(&[][..], |w| w.slice(pos, end)))
    }

    fn establish_window(&mut self, pos: u64, end: u64, policy: WindowPolicy) -> Result<MmapWindow> {
        // Release the old mapping before creating the next one.
        let previous = self.window.take();
        if self.file.is_none() {
            self.open_checked()?;
        }
        let Some(file) = self.file.as_ref() else {
            unreachable!("file opened above")
        };
        let path = self.source.path();
        ensure!(
            end <= self.file_size,
            FileTooShortSnafu {
                path,
                needed: end,
                actual: self.file_size,
            }
        );

        let len = to_index(policy.span(pos, end));
        if policy.use_mmap && !self.mmap_failed {
            match MmapWindow::map(file, pos, len) {
                Ok(window) => {
                    self.windows += 1;
                    debug!(path = ?path, offset = pos, len, "Mapped file window");
                    return Ok(window);
                }
                Err(e) => {
                    debug!(path = ?path, error = %e, "Mmap failed, falling back to reads");
                    self.mmap_failed = true;
                }
            }
        }

        let buf = previous.map(MmapWindow::into_buffer).unwrap_or_default();
        let window = MmapWindow::read_ahead(file, pos, len, buf)
            .context(ReadFileSnafu { path, offset: pos })?;
        self.windows += 1;
        Ok(window)
    }

    /// Whether `data` can still be appended at the end of this spill file.
    pub(crate) fn accepts_append(&self, max_size: u64) -> bool {
        self.appendable && self.file.is_some() && self.start + self.length < max_size
    }

    /// Appends to the spill file and grows the range to cover the new bytes.
    pub(crate) fn append(&mut self, data: &[u8]) -> io::Result<()> {
        let Some(file) = self.file.as_ref() else {
            return Err(io::Error::new(io::ErrorKind::NotFound, "spill file is closed"));
        };
        let end = self.start + self.length;
        write_all_at(file, data, end)?;
        self.length += data.len() as u64;
        self.file_size = self.start + self.length;
        Ok(())
    }

    /// Stops further appends, e.g. after a failed write.
    pub(crate) fn seal(&mut self) { self.appendable = false; }

    /// Detaches the first `len` bytes into a new chunk over the same file.
    fn split_front(&mut self, len: u64) -> Self {
        let front = Self::new(Arc::clone(&self.source), self.start, len);
        self.start = self.start.saturating_add(len);
        self.length -= len;
        front
    }
}

/// Storage of a chunk.
#[derive(Debug)]
pub enum ChunkKind {
    Mem(BytesMut),
    File(FileChunk),
}

/// A node of a chunk queue.
#[derive(Debug)]
pub struct Chunk {
    pub(crate) kind:   ChunkKind,
    /// Bytes already consumed, relative to the chunk's logical start.
    pub(crate) offset: u64,
}

impl Chunk {
    /// An empty memory chunk, the state every recycled node starts in.
    pub(crate) fn empty() -> Self { Self::mem(BytesMut::new()) }

    pub(crate) fn mem(buf: BytesMut) -> Self {
        Self {
            kind:   ChunkKind::Mem(buf),
            offset: 0,
        }
    }

    pub(crate) fn file(file: FileChunk) -> Self {
        Self {
            kind:   ChunkKind::File(file),
            offset: 0,
        }
    }

    #[must_use]
    pub fn kind(&self) -> &ChunkKind { &self.kind }

    #[must_use]
    pub fn offset(&self) -> u64 { self.offset }

    #[must_use]
    pub fn is_mem(&self) -> bool { matches!(self.kind, ChunkKind::Mem(_)) }

    #[must_use]
    pub fn is_file(&self) -> bool { matches!(self.kind, ChunkKind::File(_)) }

    #[must_use]
    pub fn as_file(&self) -> Option<&FileChunk> {
        match &self.kind {
            ChunkKind::File(file) => Some(file),
            ChunkKind::Mem(_) => None,
        }
    }

    pub fn as_file_mut(&mut self) -> Option<&mut FileChunk> {
        match &mut self.kind {
            ChunkKind::File(file) => Some(file),
            ChunkKind::Mem(_) => None,
        }
    }

    /// Logical size of the chunk, consumed bytes included.
    #[must_use]
    pub fn size(&self) -> u64 {
        match &self.kind {
            ChunkKind::Mem(buf) => buf.len() as u64,
            ChunkKind::File(file) => file.length,
        }
    }

    /// Bytes not consumed yet.
    #[must_use]
    pub fn remaining(&self) -> u64 { self.size() - self.offset }

    #[must_use]
    pub fn is_finished(&self) -> bool { self.offset == self.size() }

    /// File-absolute position of the next unconsumed byte of a file chunk
    /// and the number of bytes left, for senders that pass the range to
    /// `sendfile`-style calls together with [`FileChunk::file`].
    #[must_use]
    pub fn file_range(&self) -> Option<(u64, u64)> {
        self.as_file()
            .map(|file| (file.start.saturating_add(self.offset), self.remaining()))
    }

    /// Marks `n` more bytes as consumed.
    ///
    /// # Panics
    ///
    /// Panics if `n` exceeds [`remaining`](Self::remaining).
    pub fn advance(&mut self, n: u64) {
        assert!(
            n <= self.remaining(),
            "advance by {n} past end of chunk ({} remaining)",
            self.remaining()
        );
        self.offset += n;
    }

    /// Unconsumed bytes of a memory chunk.
    #[must_use]
    pub fn mem_data(&self) -> Option<&[u8]> {
        match &self.kind {
            ChunkKind::Mem(buf) => Some(&buf[to_index(self.offset)..]),
            ChunkKind::File(_) => None,
        }
    }

    /// Contiguous readable bytes at the current offset.
    ///
    /// For a memory chunk this is everything left. For a file chunk it is the
    /// part of the current window from the offset on; the window is moved
    /// when the offset has left it.
    pub fn data(&mut self, policy: WindowPolicy) -> Result<&[u8]> {
        let offset = self.offset;
        match &mut self.kind {
            ChunkKind::Mem(buf) => Ok(&buf[to_index(offset)..]),
            ChunkKind::File(file) => file.data(offset, policy),
        }
    }

    /// Drops the consumed prefix so that `offset` becomes 0. Returns the
    /// number of bytes dropped.
    pub(crate) fn trim_consumed(&mut self) -> u64 {
        let consumed = self.offset;
        if consumed == 0 {
            return 0;
        }
        match &mut self.kind {
            ChunkKind::Mem(buf) => buf.advance(to_index(consumed)),
            ChunkKind::File(file) => {
                file.start = file.start.saturating_add(consumed);
                file.length -= consumed;
            }
        }
        self.offset = 0;
        consumed
    }

    /// Splits off the first `len` unconsumed bytes into a new chunk.
    ///
    /// Memory is split without copying, file chunks share their source. The
    /// consumed prefix must have been trimmed.
    pub(crate) fn split_front(&mut self, len: u64) -> Self {
        debug_assert_eq!(self.offset, 0, "split_front on untrimmed chunk");
        debug_assert!(len < self.size(), "split_front must leave a remainder");
        match &mut self.kind {
            ChunkKind::Mem(buf) => Self::mem(buf.split_to(to_index(len))),
            ChunkKind::File(file) => Self::file(file.split_front(len)),
        }
    }

    /// Releases the chunk's resources and turns it into an empty memory
    /// chunk. A memory buffer keeps its allocation only up to
    /// [`MAX_RECYCLED_CAPACITY`].
    pub(crate) fn reset(&mut self) {
        match &mut self.kind {
            ChunkKind::Mem(buf) => {
                buf.clear();
                // `try_reclaim` also sees the allocation in front of an
                // advanced buffer. A buffer with no reclaimable room is
                // dropped as well.
                if !buf.try_reclaim(1) || buf.try_reclaim(MAX_RECYCLED_CAPACITY + 1) {
                    *buf = BytesMut::new();
                }
            }
            ChunkKind::File(_) => self.kind = ChunkKind::Mem(BytesMut::new()),
        }
        self.offset = 0;
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn numbered_file(len: usize) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        file.write_all(&data).unwrap();
        file.flush().unwrap();
        file
    }

    fn file_chunk(path: &Path, start: u64, length: u64) -> Chunk {
        let source = Arc::new(FileSource::Named(path.to_path_buf()));
        Chunk::file(FileChunk::new(source, start, length))
    }

    fn read_all(chunk: &mut Chunk, policy: WindowPolicy) -> Vec<u8> {
        let mut out = Vec::new();
        while !chunk.is_finished() {
            let data = chunk.data(policy).unwrap().to_vec();
            assert!(!data.is_empty());
            chunk.advance(data.len() as u64);
            out.extend_from_slice(&data);
        }
        out
    }

    #[test]
    fn test_mem_chunk_size_and_advance() {
        let mut chunk = Chunk::mem(BytesMut::from(&b"abcdefghij"[..]));
        assert_eq!(chunk.size(), 10);
        chunk.advance(4);
        assert_eq!(chunk.remaining(), 6);
        assert_eq!(chunk.mem_data(), Some(&b"efghij"[..]));
        chunk.advance(6);
        assert!(chunk.is_finished());
    }

    #[test]
    #[should_panic(expected = "past end of chunk")]
    fn test_advance_past_end_panics() {
        let mut chunk = Chunk::mem(BytesMut::from(&b"abc"[..]));
        chunk.advance(4);
    }

    #[test]
    fn test_trim_and_split_mem() {
        let mut chunk = Chunk::mem(BytesMut::from(&b"abcdefghij"[..]));
        chunk.advance(2);
        assert_eq!(chunk.trim_consumed(), 2);
        assert_eq!(chunk.offset(), 0);

        let front = chunk.split_front(3);
        assert_eq!(front.mem_data(), Some(&b"cde"[..]));
        assert_eq!(chunk.mem_data(), Some(&b"fghij"[..]));
    }

    #[test]
    fn test_file_chunk_windows_follow_offset() {
        let file = numbered_file(1000);
        let mut chunk = file_chunk(file.path(), 100, 50);
        let policy = WindowPolicy {
            max_window: 20,
            use_mmap:   true,
        };

        let data = read_all(&mut chunk, policy);

        let expected: Vec<u8> = (100..150).map(|i| (i % 251) as u8).collect();
        assert_eq!(data, expected);
        assert_eq!(chunk.as_file().unwrap().windows_mapped(), 3);
    }

    #[test]
    fn test_file_chunk_window_reused_within_range() {
        let file = numbered_file(1000);
        let mut chunk = file_chunk(file.path(), 0, 100);
        let policy = WindowPolicy {
            max_window: 64,
            use_mmap:   true,
        };

        assert_eq!(chunk.data(policy).unwrap().len(), 64);
        chunk.advance(10);
        assert_eq!(chunk.data(policy).unwrap().len(), 54);
        assert_eq!(chunk.as_file().unwrap().windows_mapped(), 1);
    }

    #[test]
    fn test_file_chunk_read_fallback() {
        let file = numbered_file(1000);
        let mut chunk = file_chunk(file.path(), 7, 300);
        let policy = WindowPolicy {
            max_window: 128,
            use_mmap:   false,
        };

        let data = read_all(&mut chunk, policy);

        let expected: Vec<u8> = (7..307).map(|i| (i % 251) as u8).collect();
        assert_eq!(data, expected);
        assert!(!chunk.as_file().unwrap().window().unwrap().is_mapped());
    }

    #[test]
    fn test_missing_file_reports_open_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut chunk = file_chunk(&dir.path().join("missing"), 0, 10);

        let err = chunk.data(WindowPolicy::default()).unwrap_err();
        assert_eq!(err.io_kind(), Some(io::ErrorKind::NotFound));
    }

    #[test]
    fn test_range_past_eof_rejected() {
        let file = numbered_file(100);
        let mut chunk = file_chunk(file.path(), 90, 20);

        let err = chunk.data(WindowPolicy::default()).unwrap_err();
        assert!(matches!(
            err,
            crate::ChunkQueueError::FileTooShort {
                needed: 110,
                actual: 100,
                ..
            }
        ));
    }

    #[test]
    fn test_overflowing_range_rejected() {
        let file = numbered_file(100);
        let mut chunk = file_chunk(file.path(), u64::MAX - 5, 10);

        let err = chunk.data(WindowPolicy::default()).unwrap_err();
        assert!(matches!(
            err,
            crate::ChunkQueueError::FileTooShort {
                needed: u64::MAX,
                actual: 100,
                ..
            }
        ));

        chunk.advance(8);
        assert_eq!(chunk.trim_consumed(), 8);
        assert!(chunk.data(WindowPolicy::default()).is_err());
    }

    #[test]
    fn test_file_range_follows_consumption() {
        let file = numbered_file(1000);
        let mut chunk = file_chunk(file.path(), 100, 50);
        assert_eq!(chunk.file_range(), Some((100, 50)));

        let fd = chunk.as_file_mut().unwrap().file().unwrap();
        assert_eq!(fd.metadata().unwrap().len(), 1000);

        chunk.advance(10);
        assert_eq!(chunk.file_range(), Some((110, 40)));
        chunk.trim_consumed();
        assert_eq!(chunk.file_range(), Some((110, 40)));
        assert_eq!(chunk.offset(), 0);

        let mut buf = [0u8; 4];
        let fd = chunk.as_file_mut().unwrap().file().unwrap();
        crate::window::read_exact_at(fd, &mut buf, 110).unwrap();
        assert_eq!(buf, [110, 111, 112, 113]);

        assert_eq!(Chunk::mem(BytesMut::from(&b"abc"[..])).file_range(), None);
    }

    #[test]
    fn test_file_accessor_reports_short_file() {
        let file = numbered_file(10);
        let mut chunk = file_chunk(file.path(), 5, 10);
        assert!(chunk.as_file_mut().unwrap().file().is_err());
    }

    #[test]
    fn test_reset_frees_large_mem_buffer() {
        let mut chunk = Chunk::mem(BytesMut::from(&vec![7u8; 1024 * 1024][..]));
        chunk.advance(1024 * 1024);
        chunk.trim_consumed();

        chunk.reset();

        let ChunkKind::Mem(buf) = &mut chunk.kind else {
            panic!("reset leaves a memory chunk");
        };
        assert!(!buf.try_reclaim(MAX_RECYCLED_CAPACITY + 1));
    }

    #[test]
    fn test_reset_keeps_small_mem_buffer() {
        let mut buf = BytesMut::with_capacity(1024);
        buf.extend_from_slice(b"small");
        let mut chunk = Chunk::mem(buf);

        chunk.reset();

        let ChunkKind::Mem(buf) = &chunk.kind else {
            panic!("reset leaves a memory chunk");
        };
        assert!(buf.is_empty());
        assert!(buf.capacity() >= 1024);
    }

    #[test]
    fn test_split_file_chunk_shares_source() {
        let file = numbered_file(1000);
        let mut chunk = file_chunk(file.path(), 100, 50);
        let front = chunk.split_front(20);

        let front_file = front.as_file().unwrap();
        let rest_file = chunk.as_file().unwrap();
        assert_eq!((front_file.start(), front_file.length()), (100, 20));
        assert_eq!((rest_file.start(), rest_file.length()), (120, 30));
        assert!(Arc::ptr_eq(front_file.source(), rest_file.source()));
    }

    #[test]
    fn test_reset_file_chunk_deletes_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let (file, path) = tempfile::NamedTempFile::new_in(dir.path())
            .unwrap()
            .into_parts();
        write_all_at(&file, b"spilled", 0).unwrap();
        let spill_path = path.to_path_buf();

        let mut chunk = Chunk::file(FileChunk::spill(file, path, 7));
        assert!(chunk.as_file().unwrap().is_temp());
        assert!(spill_path.exists());

        chunk.reset();
        assert!(chunk.is_mem());
        assert!(!spill_path.exists());
    }

    #[test]
    fn test_spill_append_extends_range() {
        let dir = tempfile::tempdir().unwrap();
        let (file, path) = tempfile::NamedTempFile::new_in(dir.path())
            .unwrap()
            .into_parts();
        write_all_at(&file, b"hello ", 0).unwrap();

        let mut chunk = Chunk::file(FileChunk::spill(file, path, 6));
        let spill = chunk.as_file_mut().unwrap();
        assert!(spill.accepts_append(1024));
        spill.append(b"world").unwrap();
        assert_eq!(spill.length(), 11);
        assert!(!spill.accepts_append(11));

        let data = read_all(&mut chunk, WindowPolicy::default());
        assert_eq!(data, b"hello world");
    }
}
