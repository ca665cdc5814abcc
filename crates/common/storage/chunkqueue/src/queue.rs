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

//! The chunk queue and its producer/consumer operations.
//!
//! ## Usage
//!
//! ```ignore
//! let mut cq = ChunkQueue::new();
//!
//! // Producers
//! cq.append_mem(b"HTTP/1.1 200 OK\r\n\r\n");
//! cq.append_file("/srv/www/index.html", 0, 1024);
//!
//! // Consumer: write what the socket accepts, resume later
//! let written = cq.write_to(&mut socket, 64 * 1024)?;
//! ```
//!
//! Bytes accounting: `bytes_in` grows with every byte appended, `bytes_out`
//! with every byte that left the queue through compaction or a steal. After
//! [`remove_finished_chunks`](ChunkQueue::remove_finished_chunks),
//! `bytes_in - bytes_out == length()`.

use std::{
    collections::{VecDeque, vec_deque},
    io::{self, Write},
    path::{Path, PathBuf},
    sync::Arc,
};

use bytes::BytesMut;
use snafu::ResultExt;
use tracing::trace;

use crate::{
    ChunkQueueConfig, Result,
    chunk::{Chunk, ChunkKind, FileChunk, FileSource},
    error::WriteSinkSnafu,
    window::WindowPolicy,
};

/// An ordered queue of memory and file chunks.
///
/// Not internally synchronized: a queue belongs to one connection at a time.
#[derive(Debug)]
pub struct ChunkQueue {
    /// Live chunks; the front is `first`, the back is `last`.
    pub(crate) chunks: VecDeque<Chunk>,
    /// Retired nodes kept for reuse, at most `max_unused_chunks`.
    unused:            Vec<Chunk>,
    /// Candidate directories for spill files, shared and read-only.
    tempdirs:          Arc<[PathBuf]>,
    config:            Arc<ChunkQueueConfig>,
    pub(crate) bytes_in:  u64,
    pub(crate) bytes_out: u64,
}

impl Default for ChunkQueue {
    fn default() -> Self { Self::new() }
}

impl ChunkQueue {
    /// Creates an empty queue with the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::from_parts(Arc::new(ChunkQueueConfig::default()))
    }

    /// Creates an empty queue sharing `config` with other queues.
    pub fn with_config(config: Arc<ChunkQueueConfig>) -> Result<Self> {
        config.validate()?;
        Ok(Self::from_parts(config))
    }

    fn from_parts(config: Arc<ChunkQueueConfig>) -> Self {
        Self {
            chunks: VecDeque::new(),
            unused: Vec::new(),
            tempdirs: Arc::new([]),
            config,
            bytes_in: 0,
            bytes_out: 0,
        }
    }

    /// Sets the directories spill files may be created in, tried in order.
    pub fn set_tempdirs(&mut self, tempdirs: Arc<[PathBuf]>) { self.tempdirs = tempdirs; }

    #[must_use]
    pub fn tempdirs(&self) -> &Arc<[PathBuf]> { &self.tempdirs }

    #[must_use]
    pub fn config(&self) -> &Arc<ChunkQueueConfig> { &self.config }

    pub(crate) fn window_policy(&self) -> WindowPolicy { WindowPolicy::from_config(&self.config) }

    // ------------------------------------------------------------------
    // Node recycling
    // ------------------------------------------------------------------

    /// Takes a node from the free list, or allocates one.
    pub(crate) fn acquire_chunk(&mut self) -> Chunk { self.unused.pop().unwrap_or_else(Chunk::empty) }

    /// Releases a node's resources and keeps it for reuse if the free list
    /// has room.
    pub(crate) fn release_chunk(&mut self, mut chunk: Chunk) {
        chunk.reset();
        if self.unused.len() < self.config.max_unused_chunks {
            self.unused.push(chunk);
        } else {
            trace!("Free list full, dropping chunk");
        }
    }

    // ------------------------------------------------------------------
    // Producers
    // ------------------------------------------------------------------

    /// Copies `data` to the end of the queue.
    ///
    /// The bytes go into the last chunk when it is a memory chunk with enough
    /// spare capacity.
    pub fn append_mem(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        self.bytes_in += data.len() as u64;

        if let Some(Chunk {
            kind: ChunkKind::Mem(buf),
            ..
        }) = self.chunks.back_mut()
            && buf.capacity() - buf.len() >= data.len()
        {
            buf.extend_from_slice(data);
            return;
        }

        let mut chunk = self.acquire_chunk();
        if let ChunkKind::Mem(buf) = &mut chunk.kind {
            buf.extend_from_slice(data);
        }
        self.chunks.push_back(chunk);
    }

    /// Adopts `buf` as a new last chunk without copying. `buf` is left empty.
    pub fn append_buffer(&mut self, buf: &mut BytesMut) {
        if let Some(chunk) = self.adopt(buf) {
            self.chunks.push_back(chunk);
        }
    }

    /// Adopts `buf` as a new first chunk, e.g. to give back bytes a writer
    /// pulled off but could not send. `buf` is left empty.
    pub fn prepend_buffer(&mut self, buf: &mut BytesMut) {
        if let Some(chunk) = self.adopt(buf) {
            self.chunks.push_front(chunk);
        }
    }

    fn adopt(&mut self, buf: &mut BytesMut) -> Option<Chunk> {
        if buf.is_empty() {
            return None;
        }
        self.bytes_in += buf.len() as u64;
        // The caller gets the recycled node's empty buffer in exchange.
        let mut chunk = self.acquire_chunk();
        match &mut chunk.kind {
            ChunkKind::Mem(mem) => std::mem::swap(mem, buf),
            ChunkKind::File(_) => chunk.kind = ChunkKind::Mem(std::mem::take(buf)),
        }
        Some(chunk)
    }

    /// Appends a reference to `length` bytes of the file at `path`, starting
    /// at `start`. The file is not touched until the bytes are read.
    pub fn append_file(&mut self, path: impl AsRef<Path>, start: u64, length: u64) {
        let source = Arc::new(FileSource::Named(path.as_ref().to_path_buf()));
        self.append_file_source(source, start, length);
    }

    /// Appends a range of a file that is already shared with other chunks.
    pub fn append_file_source(&mut self, source: Arc<FileSource>, start: u64, length: u64) {
        if length == 0 {
            return;
        }
        self.bytes_in += length;
        let mut chunk = self.acquire_chunk();
        chunk.kind = ChunkKind::File(FileChunk::new(source, start, length));
        self.chunks.push_back(chunk);
    }

    // ------------------------------------------------------------------
    // Consumers
    // ------------------------------------------------------------------

    /// Drops finished chunks from the front of the queue.
    pub fn remove_finished_chunks(&mut self) {
        while self.chunks.front().is_some_and(Chunk::is_finished) {
            if let Some(chunk) = self.chunks.pop_front() {
                self.bytes_out += chunk.size();
                self.release_chunk(chunk);
            }
        }
    }

    /// Marks the next `len` bytes as consumed without removing any chunk.
    ///
    /// # Panics
    ///
    /// Panics if `len` exceeds [`length`](Self::length).
    pub fn mark_written(&mut self, mut len: u64) {
        let available = self.length();
        assert!(
            len <= available,
            "mark_written({len}) with only {available} bytes queued"
        );
        for chunk in &mut self.chunks {
            if len == 0 {
                break;
            }
            let n = chunk.remaining().min(len);
            chunk.advance(n);
            len -= n;
        }
    }

    /// Contiguous readable bytes at the head of the queue, or `None` when
    /// every chunk is consumed.
    pub fn peek(&mut self) -> Result<Option<&[u8]>> {
        let policy = self.window_policy();
        match self.chunks.iter_mut().find(|c| !c.is_finished()) {
            Some(chunk) => chunk.data(policy).map(Some),
            None => Ok(None),
        }
    }

    /// Writes up to `max_bytes` into `writer`, advancing offsets by what the
    /// writer accepted, then compacts.
    ///
    /// Stops early on `WouldBlock` or a short write so the caller can resume
    /// once the sink is ready again. Returns the number of bytes written.
    pub fn write_to<W: Write>(&mut self, writer: &mut W, max_bytes: u64) -> Result<u64> {
        let policy = self.window_policy();
        let mut written = 0u64;

        while written < max_bytes {
            let Some(chunk) = self.chunks.iter_mut().find(|c| !c.is_finished()) else {
                break;
            };
            let data = chunk.data(policy)?;
            let want = data.len().min(usize::try_from(max_bytes - written).unwrap_or(usize::MAX));

            match writer.write(&data[..want]) {
                Ok(0) => break,
                Ok(n) => {
                    chunk.advance(n as u64);
                    written += n as u64;
                    if n < want {
                        break;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    self.remove_finished_chunks();
                    return Err(e).context(WriteSinkSnafu { written });
                }
            }
        }

        self.remove_finished_chunks();
        Ok(written)
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    /// Bytes not consumed yet, summed over all chunks.
    #[must_use]
    pub fn length(&self) -> u64 { self.chunks.iter().map(Chunk::remaining).sum() }

    /// Unconsumed bytes held in memory chunks.
    #[must_use]
    pub fn memory_len(&self) -> u64 {
        self.chunks
            .iter()
            .filter(|c| c.is_mem())
            .map(Chunk::remaining)
            .sum()
    }

    /// Whether the queue holds no chunks at all. A queue whose chunks are all
    /// consumed is not empty until it is compacted.
    #[must_use]
    pub fn is_empty(&self) -> bool { self.chunks.is_empty() }

    #[must_use]
    pub fn first(&self) -> Option<&Chunk> { self.chunks.front() }

    pub fn first_mut(&mut self) -> Option<&mut Chunk> { self.chunks.front_mut() }

    #[must_use]
    pub fn last(&self) -> Option<&Chunk> { self.chunks.back() }

    pub fn iter(&self) -> vec_deque::Iter<'_, Chunk> { self.chunks.iter() }

    /// Number of live chunks.
    #[must_use]
    pub fn len_chunks(&self) -> usize { self.chunks.len() }

    /// Number of recycled nodes waiting for reuse.
    #[must_use]
    pub fn unused_chunks(&self) -> usize { self.unused.len() }

    #[must_use]
    pub fn bytes_in(&self) -> u64 { self.bytes_in }

    #[must_use]
    pub fn bytes_out(&self) -> u64 { self.bytes_out }

    // ------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------

    /// Releases every chunk and zeroes the counters. The queue stays usable.
    pub fn reset(&mut self) {
        while let Some(chunk) = self.chunks.pop_front() {
            self.release_chunk(chunk);
        }
        self.bytes_in = 0;
        self.bytes_out = 0;
    }
}

impl<'a> IntoIterator for &'a ChunkQueue {
    type IntoIter = vec_deque::Iter<'a, Chunk>;
    type Item = &'a Chunk;

    fn into_iter(self) -> Self::IntoIter { self.iter() }
}
