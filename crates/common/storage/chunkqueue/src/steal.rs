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

//! Moving byte ranges between queues.
//!
//! ```text
//!   src:  [ A (3) | B (10)        | C ]      steal(dest, src, 8)
//!   dest: [ ... | A (3) | B' (5) ]
//!   src:  [ B'' (5) | C ]
//! ```
//!
//! Whole chunks are relinked. A chunk crossing the boundary is split without
//! copying: memory buffers are split in place and file chunks share their
//! [`FileSource`](crate::FileSource).

use tracing::debug;

use crate::{ChunkQueue, Result, chunk::Chunk};

impl ChunkQueue {
    /// Moves up to `len` bytes from the front of `src` to the end of `self`.
    pub fn steal(&mut self, src: &mut Self, mut len: u64) {
        while len > 0 {
            let Some(chunk) = src.take_front(len) else {
                break;
            };
            let n = chunk.size();
            self.bytes_in += n;
            self.chunks.push_back(chunk);
            len -= n;
        }
    }

    /// Like [`steal`](Self::steal), but memory data is written to temp files
    /// when this queue would otherwise hold more than `spill_threshold` bytes
    /// in memory.
    ///
    /// On error the bytes moved so far stay here and the failing segment
    /// stays in `src`; both queues remain consistent.
    pub fn steal_with_tempfiles(&mut self, src: &mut Self, mut len: u64) -> Result<()> {
        let incoming = src.memory_prefix_len(len);
        let threshold = self.config().spill_threshold;
        if incoming == 0 || self.memory_len().saturating_add(incoming) <= threshold {
            self.steal(src, len);
            return Ok(());
        }
        debug!(len, incoming, "Spilling stolen memory data to temp files");

        while len > 0 {
            src.remove_finished_chunks();
            let Some(front) = src.chunks.front_mut() else {
                break;
            };

            let Some(data) = front.mem_data() else {
                let Some(chunk) = src.take_front(len) else {
                    break;
                };
                let n = chunk.size();
                self.bytes_in += n;
                self.chunks.push_back(chunk);
                len -= n;
                continue;
            };

            let n = data.len().min(usize::try_from(len).unwrap_or(usize::MAX));
            self.append_to_tempfile(&data[..n])?;
            self.bytes_in += n as u64;
            len -= n as u64;

            front.advance(n as u64);
            src.bytes_out += front.trim_consumed();
        }

        src.remove_finished_chunks();
        Ok(())
    }

    /// Detaches a chunk of at most `len` unconsumed bytes from the front,
    /// with `offset == 0`. Finished chunks on the way are recycled.
    fn take_front(&mut self, len: u64) -> Option<Chunk> {
        self.remove_finished_chunks();
        let front = self.chunks.front_mut()?;
        self.bytes_out += front.trim_consumed();

        let chunk = if front.size() <= len {
            self.chunks.pop_front()?
        } else {
            front.split_front(len)
        };
        self.bytes_out += chunk.size();
        Some(chunk)
    }

    /// Unconsumed memory bytes among the first `len` bytes of the queue.
    fn memory_prefix_len(&self, mut len: u64) -> u64 {
        let mut total = 0;
        for chunk in &self.chunks {
            if len == 0 {
                break;
            }
            let n = chunk.remaining().min(len);
            if chunk.is_mem() {
                total += n;
            }
            len -= n;
        }
        total
    }
}
