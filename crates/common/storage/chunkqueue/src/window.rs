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

//! Read windows over file chunks.
//!
//! A file chunk never maps its whole range at once. Reads go through a
//! [`MmapWindow`] covering `[offset, offset + len)` of the file (absolute
//! positions). A read at a position outside the window drops it and
//! establishes a new one starting at that position, sized by
//! [`WindowPolicy`].
//!
//! When mapping is disabled or fails, the window is filled with a positioned
//! read instead, so callers see the same contiguous slice either way.

use std::fs::File;
use std::io;

use memmap2::{Mmap, MmapOptions};

use crate::ChunkQueueConfig;

/// Sizing rules for file chunk windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowPolicy {
    /// Largest window established in one go.
    pub max_window: u64,
    /// Whether to try `mmap` before falling back to positioned reads.
    pub use_mmap:   bool,
}

impl WindowPolicy {
    #[must_use]
    pub fn from_config(config: &ChunkQueueConfig) -> Self {
        Self {
            max_window: config.mmap_window_size,
            use_mmap:   config.use_mmap,
        }
    }

    /// Length of the window to establish at `pos` for a range ending at `end`.
    #[must_use]
    pub fn span(&self, pos: u64, end: u64) -> u64 {
        end.saturating_sub(pos).min(self.max_window.max(1))
    }
}

impl Default for WindowPolicy {
    fn default() -> Self { Self::from_config(&ChunkQueueConfig::default()) }
}

#[derive(Debug)]
enum Backing {
    Mapped(Mmap),
    ReadAhead(Vec<u8>),
}

/// A contiguous, readable view of part of a file.
#[derive(Debug)]
pub struct MmapWindow {
    backing: Backing,
    /// File-absolute position of the first byte of the window.
    offset:  u64,
}

impl MmapWindow {
    /// Maps `len` bytes of `file` starting at `offset`.
    ///
    /// The caller must have checked that the range lies within the file.
    #[allow(unsafe_code)]
    pub(crate) fn map(file: &File, offset: u64, len: usize) -> io::Result<Self> {
        // SAFETY: the mapping is read-only and covers bytes that exist in the
        // file. Queued files are not truncated while referenced, and spill
        // files only ever grow.
        let map = unsafe { MmapOptions::new().offset(offset).len(len).map(file)? };
        Ok(Self {
            backing: Backing::Mapped(map),
            offset,
        })
    }

    /// Fills a read-ahead buffer with `len` bytes of `file` at `offset`.
    ///
    /// `buf` is reused when large enough.
    pub(crate) fn read_ahead(
        file: &File,
        offset: u64,
        len: usize,
        mut buf: Vec<u8>,
    ) -> io::Result<Self> {
        buf.clear();
        buf.resize(len, 0);
        read_exact_at(file, &mut buf, offset)?;
        Ok(Self {
            backing: Backing::ReadAhead(buf),
            offset,
        })
    }

    /// File-absolute position where the window begins.
    #[must_use]
    pub fn offset(&self) -> u64 { self.offset }

    #[must_use]
    pub fn len(&self) -> u64 { self.bytes().len() as u64 }

    #[must_use]
    pub fn is_empty(&self) -> bool { self.bytes().is_empty() }

    #[must_use]
    pub fn is_mapped(&self) -> bool { matches!(self.backing, Backing::Mapped(_)) }

    /// Whether the byte at file position `pos` is inside the window.
    #[must_use]
    pub fn contains(&self, pos: u64) -> bool {
        pos >= self.offset && pos - self.offset < self.len()
    }

    /// Bytes from `pos` up to the end of the window, clipped to `end`.
    #[must_use]
    pub fn slice(&self, pos: u64, end: u64) -> &[u8] {
        if !self.contains(pos) {
            return &[];
        }
        let bytes = self.bytes();
        let from = to_index(pos - self.offset);
        let to = to_index(end.saturating_sub(self.offset)).min(bytes.len());
        if from >= to { &[] } else { &bytes[from..to] }
    }

    /// Gives back the read-ahead allocation, if any, for reuse.
    pub(crate) fn into_buffer(self) -> Vec<u8> {
        match self.backing {
            Backing::Mapped(_) => Vec::new(),
            Backing::ReadAhead(buf) => buf,
        }
    }

    fn bytes(&self) -> &[u8] {
        match &self.backing {
            Backing::Mapped(map) => &map[..],
            Backing::ReadAhead(buf) => buf.as_slice(),
        }
    }
}

/// Converts a window-relative distance into a slice index.
///
/// Windows are bounded by `max_window`, which fits in memory by construction.
pub(crate) fn to_index(n: u64) -> usize { usize::try_from(n).unwrap_or(usize::MAX) }

#[cfg(unix)]
pub(crate) fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)
}

#[cfg(not(unix))]
pub(crate) fn read_exact_at(mut file: &File, buf: &mut [u8], offset: u64) -> io::Result<()> {
    use std::io::{Read, Seek, SeekFrom};
    file.seek(SeekFrom::Start(offset))?;
    file.read_exact(buf)
}

#[cfg(unix)]
pub(crate) fn write_all_at(file: &File, buf: &[u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(buf, offset)
}

#[cfg(not(unix))]
pub(crate) fn write_all_at(mut file: &File, buf: &[u8], offset: u64) -> io::Result<()> {
    use std::io::{Seek, SeekFrom, Write};
    file.seek(SeekFrom::Start(offset))?;
    file.write_all(buf)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use test_case::test_case;

    use super::*;

    fn numbered_file(len: usize) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        file.write_all(&data).unwrap();
        file.flush().unwrap();
        file
    }

    #[test_case(0, 100, 20, 20 ; "full window")]
    #[test_case(90, 100, 20, 10 ; "clipped by range end")]
    #[test_case(100, 100, 20, 0 ; "nothing left")]
    #[test_case(0, 100, 0, 1 ; "zero window still makes progress")]
    fn test_policy_span(pos: u64, end: u64, max_window: u64, expected: u64) {
        let policy = WindowPolicy {
            max_window,
            use_mmap: true,
        };
        assert_eq!(policy.span(pos, end), expected);
    }

    #[test]
    fn test_mapped_window_unaligned_offset() {
        let file = numbered_file(10_000);
        let window = MmapWindow::map(file.as_file(), 4099, 64).unwrap();

        assert!(window.is_mapped());
        assert_eq!(window.offset(), 4099);
        assert_eq!(window.len(), 64);
        assert_eq!(window.slice(4099, 4099 + 64)[0], (4099 % 251) as u8);
    }

    #[test]
    fn test_read_ahead_matches_mapping() {
        let file = numbered_file(1000);
        let mapped = MmapWindow::map(file.as_file(), 100, 50).unwrap();
        let buffered = MmapWindow::read_ahead(file.as_file(), 100, 50, Vec::new()).unwrap();

        assert!(!buffered.is_mapped());
        assert_eq!(mapped.slice(100, 150), buffered.slice(100, 150));
    }

    #[test]
    fn test_contains_and_slice_bounds() {
        let file = numbered_file(1000);
        let window = MmapWindow::read_ahead(file.as_file(), 100, 20, Vec::new()).unwrap();

        assert!(!window.contains(99));
        assert!(window.contains(100));
        assert!(window.contains(119));
        assert!(!window.contains(120));

        assert_eq!(window.slice(110, 1000).len(), 10);
        assert_eq!(window.slice(110, 115).len(), 5);
        assert!(window.slice(120, 1000).is_empty());
    }

    #[test]
    fn test_read_ahead_past_eof_fails() {
        let file = numbered_file(10);
        let err = MmapWindow::read_ahead(file.as_file(), 5, 10, Vec::new()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}
