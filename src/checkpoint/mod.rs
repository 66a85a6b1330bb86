//! Checkpoint Module
//!
//! Moves dirty pages from page memory into the page store. The dirty set is
//! captured at checkpoint begin, sorted into batches by a fork/join sort and
//! written by a bounded pool of blocking workers.

mod checkpointer;
mod coordinator;
mod countdown;
mod page_id;
mod scope;
pub mod sort;

pub use checkpointer::{CheckpointStats, Checkpointer};
pub use coordinator::AsyncCheckpointer;
pub use countdown::{Completion, CountDown};
pub use page_id::FullPageId;
pub use scope::CheckpointScope;
pub use sort::{batch_channel, BatchMessage, SortHandle};
