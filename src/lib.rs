//! WolfPage - Durable Page Store WAL and Checkpoint Engine
//!
//! A page store that logs every page mutation to a segmented write-ahead log
//! and periodically checkpoints dirty pages into per-group page files.
//!
//! # Architecture
//!
//! Page updates are applied to in-memory pages and appended to the WAL.
//! A checkpoint captures the dirty pages, sorts them in parallel into
//! batches and persists the batches on a bounded worker pool. On restart the
//! log is replayed from the last completed checkpoint.
//!
//! # Features
//!
//! - Segmented WAL with CRC-checked, optionally LZ4-compressed frames
//! - Versioned record codec readable across format versions
//! - Parallel page sort and batched page writes with a single completion
//! - Crash recovery from the last checkpoint with an end marker
//! - Versioned type metadata with explicit field changes

pub mod checkpoint;
pub mod config;
pub mod engine;
pub mod error;
pub mod metadata;
pub mod recovery;
pub mod storage;
pub mod tuning;
pub mod util;
pub mod wal;

pub use config::WolfPageConfig;
pub use engine::Engine;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::checkpoint::{AsyncCheckpointer, CheckpointStats, FullPageId};
    pub use crate::config::WolfPageConfig;
    pub use crate::engine::Engine;
    pub use crate::error::{Error, Result};
    pub use crate::metadata::{FieldMeta, FieldState, TypeMetadata};
    pub use crate::storage::{FilePageStore, PageMemory, PageStore};
    pub use crate::wal::{RecordPayload, RecordType, WalIterator, WalPointer, WalRecord, WalWriter};
}
