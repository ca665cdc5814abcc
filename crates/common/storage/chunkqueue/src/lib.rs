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

//! Ordered queue of byte segments staged for output.
//!
//! A [`ChunkQueue`] holds memory buffers and file ranges in FIFO order. File
//! ranges are read lazily through bounded memory-mapped windows, consumed
//! chunks are recycled through a small free list, and ranges can be moved
//! between queues without copying.

pub mod chunk;
pub mod config;
pub mod error;
pub mod queue;
pub mod reservation;
mod spill;
mod steal;
pub mod window;

pub use chunk::{Chunk, ChunkKind, FileChunk, FileSource};
pub use config::ChunkQueueConfig;
pub use error::{ChunkQueueError, Result};
pub use queue::ChunkQueue;
pub use reservation::MemoryReservation;
pub use window::{MmapWindow, WindowPolicy};
