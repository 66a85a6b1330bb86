//! Write-Ahead Log Module
//!
//! Append-only, segmented log of page mutations and checkpoint markers.
//! Sealed segments move from the work directory into the archive directory.

pub mod codec;
pub mod record;
mod reader;
mod segment;
mod writer;

pub use reader::{segment_infos, ReadPolicy, SegmentInfo, WalIterator};
pub use record::{RecordPayload, RecordType, WalRecord};
pub use segment::{list_segments, read_frame, Frame, Segment};
pub use writer::WalWriter;

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Location of a record in the log
///
/// Ordering follows log order: segment first, then offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct WalPointer {
    /// Segment index
    pub segment: u64,
    /// Byte offset of the frame inside the segment
    pub offset: u64,
    /// Frame length in bytes
    pub len: u32,
}

impl WalPointer {
    pub const fn new(segment: u64, offset: u64, len: u32) -> Self {
        Self {
            segment,
            offset,
            len,
        }
    }
}

impl std::fmt::Display for WalPointer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}+{}", self.segment, self.offset, self.len)
    }
}

/// WAL directory structure
#[derive(Debug, Clone)]
pub struct WalPaths {
    /// Directory holding the active segment
    pub work_dir: PathBuf,
    /// Directory holding sealed segments
    pub archive_dir: PathBuf,
}

impl WalPaths {
    pub fn new(work_dir: PathBuf, archive_dir: PathBuf) -> Self {
        Self {
            work_dir,
            archive_dir,
        }
    }

    /// Paths derived from a configuration
    pub fn from_config(config: &crate::config::WolfPageConfig) -> Self {
        Self::new(config.wal_dir(), config.archive_dir())
    }

    /// File name for a segment index
    pub fn segment_file_name(index: u64) -> String {
        format!("{:016}.wal", index)
    }

    /// Get path for a segment in the work directory
    pub fn work_segment_path(&self, index: u64) -> PathBuf {
        self.work_dir.join(Self::segment_file_name(index))
    }

    /// Get path for a segment in the archive directory
    pub fn archive_segment_path(&self, index: u64) -> PathBuf {
        self.archive_dir.join(Self::segment_file_name(index))
    }

    /// Ensure WAL directories exist
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.work_dir)?;
        std::fs::create_dir_all(&self.archive_dir)
    }
}

/// Parse the segment index out of a segment file name
pub fn parse_segment_index(path: &Path) -> Option<u64> {
    if path.extension().map_or(true, |ext| ext != "wal") {
        return None;
    }
    path.file_stem()?.to_str()?.parse().ok()
}
