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

use serde::{Deserialize, Serialize};
use smart_default::SmartDefault;
use snafu::ensure;

use crate::{Result, error::InvalidConfigSnafu};

/// Default size handed out by `get_memory` when the caller passes 0.
pub const DEFAULT_MIN_READ_SIZE: usize = 1024;

/// Default allocation for a new fill buffer when the caller passes 0.
pub const DEFAULT_ALLOC_SIZE: usize = 4096;

/// Tuning knobs shared by every queue of a server.
///
/// Usually wrapped in an `Arc` and handed to
/// [`ChunkQueue::with_config`](crate::ChunkQueue::with_config).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, SmartDefault, bon::Builder)]
#[serde(default)]
pub struct ChunkQueueConfig {
    /// Number of retired chunk nodes kept for reuse. Nodes beyond this are
    /// freed.
    #[default = 4]
    #[builder(default = 4)]
    pub max_unused_chunks: usize,

    /// Upper bound of a single mapped window (or read-ahead block) of a file
    /// chunk.
    #[default(512 * 1024)]
    #[builder(default = 512 * 1024)]
    pub mmap_window_size: u64,

    /// Map file windows. When false every file read goes through positioned
    /// reads.
    #[default = true]
    #[builder(default = true)]
    pub use_mmap: bool,

    /// In-memory bytes a destination may hold before `steal_with_tempfiles`
    /// writes incoming memory data to temp files.
    #[default(1024 * 1024)]
    #[builder(default = 1024 * 1024)]
    pub spill_threshold: u64,

    /// A spill file stops receiving appends once it reaches this size.
    #[default(1024 * 1024)]
    #[builder(default = 1024 * 1024)]
    pub tempfile_max_size: u64,

    /// File name prefix for spill files.
    #[default("chunkqueue-upload-".to_string())]
    #[builder(default = "chunkqueue-upload-".to_string(), into)]
    pub tempfile_prefix: String,
}

impl ChunkQueueConfig {
    /// Checks that the configuration is usable.
    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.mmap_window_size > 0,
            InvalidConfigSnafu {
                message: "mmap_window_size must be greater than 0",
            }
        );
        ensure!(
            self.tempfile_max_size > 0,
            InvalidConfigSnafu {
                message: "tempfile_max_size must be greater than 0",
            }
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ChunkQueueConfig::default();
        assert_eq!(config.max_unused_chunks, 4);
        assert_eq!(config.mmap_window_size, 512 * 1024);
        assert!(config.use_mmap);
        assert_eq!(config.spill_threshold, 1024 * 1024);
        assert_eq!(config.tempfile_prefix, "chunkqueue-upload-");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder_matches_default() {
        assert_eq!(ChunkQueueConfig::builder().build(), ChunkQueueConfig::default());
    }

    #[test]
    fn test_builder_custom_config() {
        let config = ChunkQueueConfig::builder()
            .max_unused_chunks(16)
            .mmap_window_size(20)
            .use_mmap(false)
            .spill_threshold(64)
            .tempfile_prefix("spill-")
            .build();

        assert_eq!(config.max_unused_chunks, 16);
        assert_eq!(config.mmap_window_size, 20);
        assert!(!config.use_mmap);
        assert_eq!(config.spill_threshold, 64);
        assert_eq!(config.tempfile_prefix, "spill-");
    }

    #[test]
    fn test_zero_window_rejected() {
        let config = ChunkQueueConfig::builder().mmap_window_size(0).build();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_deserialize_partial() {
        let config: ChunkQueueConfig =
            serde_json::from_str(r#"{"mmap_window_size": 4096, "use_mmap": false}"#).unwrap();
        assert_eq!(config.mmap_window_size, 4096);
        assert!(!config.use_mmap);
        assert_eq!(config.max_unused_chunks, 4);
    }
}
