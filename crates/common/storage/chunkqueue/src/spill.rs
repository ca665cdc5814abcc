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

//! Temp file spillover for [`ChunkQueue::steal_with_tempfiles`].
//!
//! Spilled bytes are appended to the queue's last chunk while it is an open
//! spill file below `tempfile_max_size`. Otherwise a new file is created in
//! the first configured temp directory that accepts it. Spill files are
//! unlinked when the last chunk referencing them is dropped.

use std::{
    env, io,
    path::{Path, PathBuf},
};

use snafu::ResultExt;
use tracing::{debug, warn};

use crate::{
    ChunkQueue, Result,
    chunk::{Chunk, ChunkKind, FileChunk},
    error::TempFileSnafu,
    window::write_all_at,
};

impl ChunkQueue {
    /// Writes `data` to a spill file at the end of the queue.
    pub(crate) fn append_to_tempfile(&mut self, data: &[u8]) -> Result<()> {
        let max_size = self.config().tempfile_max_size;
        if let Some(Chunk {
            kind: ChunkKind::File(tail),
            ..
        }) = self.chunks.back_mut()
            && tail.accepts_append(max_size)
        {
            match tail.append(data) {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(path = ?tail.path(), error = %e, "Spill append failed, starting a new file");
                    tail.seal();
                }
            }
        }

        let chunk = self.create_spill_chunk(data)?;
        self.chunks.push_back(chunk);
        Ok(())
    }

    /// Creates a spill file holding `data`, trying each temp directory in
    /// order.
    fn create_spill_chunk(&self, data: &[u8]) -> Result<Chunk> {
        let dirs: Vec<PathBuf> = if self.tempdirs().is_empty() {
            vec![env::temp_dir()]
        } else {
            self.tempdirs().to_vec()
        };

        let mut last_err = io::Error::new(io::ErrorKind::NotFound, "no temp directory");
        for dir in &dirs {
            match self.write_spill_file(dir, data) {
                Ok(file) => {
                    debug!(path = ?file.path(), len = data.len(), "Created spill file");
                    return Ok(Chunk::file(file));
                }
                Err(e) => {
                    warn!(dir = ?dir, error = %e, "Failed to create spill file");
                    last_err = e;
                }
            }
        }

        Err(last_err).context(TempFileSnafu { attempts: dirs.len() })
    }

    fn write_spill_file(&self, dir: &Path, data: &[u8]) -> io::Result<FileChunk> {
        let (file, path) = tempfile::Builder::new()
            .prefix(&self.config().tempfile_prefix)
            .tempfile_in(dir)?
            .into_parts();
        // `path` unlinks the file if the write below fails.
        write_all_at(&file, data, 0)?;
        Ok(FileChunk::spill(file, path, data.len() as u64))
    }
}
