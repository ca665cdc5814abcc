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

use std::{io, path::PathBuf};

use snafu::Snafu;

/// Chunk queue operation errors.
///
/// Mapping failures never surface here: a chunk that cannot be mapped falls
/// back to positioned reads.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ChunkQueueError {
    /// The file behind a file chunk could not be opened or stat'ed.
    #[snafu(display("Failed to open {}", path.display()))]
    OpenFile {
        path:   PathBuf,
        source: io::Error,
        #[snafu(implicit)]
        loc:    snafu::Location,
    },

    /// A positioned read of a file chunk failed.
    #[snafu(display("Failed to read {} at offset {offset}", path.display()))]
    ReadFile {
        path:   PathBuf,
        offset: u64,
        source: io::Error,
        #[snafu(implicit)]
        loc:    snafu::Location,
    },

    /// The byte range described by a file chunk ends past the end of the file.
    #[snafu(display("File {} is {actual} bytes, range needs {needed}", path.display()))]
    FileTooShort {
        path:   PathBuf,
        needed: u64,
        actual: u64,
        #[snafu(implicit)]
        loc:    snafu::Location,
    },

    /// No temp directory accepted a spill file.
    #[snafu(display("Failed to create spill file after {attempts} temp dir(s)"))]
    TempFile {
        attempts: usize,
        source:   io::Error,
        #[snafu(implicit)]
        loc:      snafu::Location,
    },

    /// The sink passed to `write_to` failed.
    #[snafu(display("Failed to write queued data after {written} bytes"))]
    WriteSink {
        written: u64,
        source:  io::Error,
        #[snafu(implicit)]
        loc:     snafu::Location,
    },

    /// Configuration rejected by validation.
    #[snafu(display("Invalid chunk queue config: {message}"))]
    InvalidConfig {
        message: String,
        #[snafu(implicit)]
        loc:     snafu::Location,
    },
}

impl ChunkQueueError {
    /// Returns the underlying I/O error kind, if any.
    #[must_use]
    pub fn io_kind(&self) -> Option<io::ErrorKind> {
        match self {
            Self::OpenFile { source, .. }
            | Self::ReadFile { source, .. }
            | Self::TempFile { source, .. }
            | Self::WriteSink { source, .. } => Some(source.kind()),
            Self::FileTooShort { .. } => Some(io::ErrorKind::UnexpectedEof),
            Self::InvalidConfig { .. } => None,
        }
    }
}

/// Result type for chunk queue operations.
pub type Result<T> = std::result::Result<T, ChunkQueueError>;
