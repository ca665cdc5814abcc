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

//! Two-phase fill protocol: reserve writable space at the tail, then commit
//! what was actually written.
//!
//! ```ignore
//! let mut space = cq.get_memory(0, 0);
//! let n = socket.read(&mut space)?;
//! space.use_memory(n);
//! ```
//!
//! The [`MemoryReservation`] guard holds the queue's mutable borrow, so no
//! other mutation can happen between the two phases. Dropping the guard
//! without committing commits nothing.

use std::ops::{Deref, DerefMut};

use bytes::BytesMut;

use crate::{
    ChunkQueue,
    chunk::{Chunk, ChunkKind},
    config::{DEFAULT_ALLOC_SIZE, DEFAULT_MIN_READ_SIZE},
};

/// Tail buffers up to this capacity are grown in place instead of starting a
/// new chunk.
const REALLOC_MAX_SIZE: usize = 256;

impl ChunkQueue {
    /// Reserves at least `min_size` writable bytes at the end of the queue.
    ///
    /// Space comes from the last memory chunk when it has enough room;
    /// otherwise a new memory chunk of `alloc_size` bytes is appended. Zero
    /// selects the defaults (1024 and 4096 bytes). The reservation never
    /// exceeds `max(min_size, alloc_size)`, even when the tail has more spare
    /// capacity.
    pub fn get_memory(&mut self, min_size: usize, alloc_size: usize) -> MemoryReservation<'_> {
        let min_size = if min_size == 0 { DEFAULT_MIN_READ_SIZE } else { min_size };
        let alloc_size = if alloc_size == 0 { DEFAULT_ALLOC_SIZE } else { alloc_size }.max(min_size);

        let tail_fits = match self.chunks.back_mut() {
            Some(Chunk {
                kind: ChunkKind::Mem(buf),
                ..
            }) => {
                if buf.is_empty() {
                    buf.reserve(alloc_size);
                } else if spare(buf) < min_size && buf.capacity() <= REALLOC_MAX_SIZE {
                    let grow_to = (buf.len() + min_size).max(alloc_size);
                    buf.reserve(grow_to - buf.len());
                }
                spare(buf) >= min_size
            }
            _ => false,
        };

        if !tail_fits {
            let mut chunk = self.acquire_chunk();
            if let ChunkKind::Mem(buf) = &mut chunk.kind {
                buf.reserve(alloc_size);
            }
            self.chunks.push_back(chunk);
        }

        MemoryReservation::new(self, alloc_size)
    }
}

fn spare(buf: &BytesMut) -> usize { buf.capacity() - buf.len() }

/// Writable space at the end of the queue's last memory chunk.
///
/// Dereferences to the reserved bytes. Commit with
/// [`use_memory`](Self::use_memory).
#[must_use = "reserved space is discarded unless committed with use_memory"]
pub struct MemoryReservation<'a> {
    queue:     &'a mut ChunkQueue,
    /// Committed length of the tail buffer when the reservation was made.
    start:     usize,
    len:       usize,
    committed: bool,
}

impl<'a> MemoryReservation<'a> {
    fn new(queue: &'a mut ChunkQueue, limit: usize) -> Self {
        let buf = tail_buffer_mut(queue);
        let start = buf.len();
        let len = spare(buf).min(limit);
        buf.resize(start + len, 0);
        Self {
            queue,
            start,
            len,
            committed: false,
        }
    }

    /// Number of bytes reserved.
    #[must_use]
    pub fn len(&self) -> usize { self.len }

    #[must_use]
    pub fn is_empty(&self) -> bool { self.len == 0 }

    /// Commits the first `len` reserved bytes as queue content. Zero is
    /// valid and means nothing was read.
    ///
    /// # Panics
    ///
    /// Panics if `len` is larger than the reservation.
    pub fn use_memory(mut self, len: usize) {
        assert!(
            len <= self.len,
            "use_memory({len}) exceeds reserved {} bytes",
            self.len
        );
        let start = self.start;
        tail_buffer_mut(&mut *self.queue).truncate(start + len);
        self.queue.bytes_in += len as u64;
        self.committed = true;
    }
}

impl Deref for MemoryReservation<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        let buf = tail_buffer(&*self.queue);
        &buf[self.start..self.start + self.len]
    }
}

impl DerefMut for MemoryReservation<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        let (start, len) = (self.start, self.len);
        let buf = tail_buffer_mut(&mut *self.queue);
        &mut buf[start..start + len]
    }
}

impl Drop for MemoryReservation<'_> {
    fn drop(&mut self) {
        if !self.committed {
            let start = self.start;
            tail_buffer_mut(&mut *self.queue).truncate(start);
        }
    }
}

fn tail_buffer(queue: &ChunkQueue) -> &BytesMut {
    match queue.chunks.back() {
        Some(Chunk {
            kind: ChunkKind::Mem(buf),
            ..
        }) => buf,
        _ => unreachable!("reservation always targets a memory tail chunk"),
    }
}

fn tail_buffer_mut(queue: &mut ChunkQueue) -> &mut BytesMut {
    match queue.chunks.back_mut() {
        Some(Chunk {
            kind: ChunkKind::Mem(buf),
            ..
        }) => buf,
        _ => unreachable!("reservation always targets a memory tail chunk"),
    }
}
