//! Page Storage Module
//!
//! The in-memory page cache that checkpoints drain, and the durable page
//! files they drain into.

mod page_memory;
mod page_store;

pub use page_memory::PageMemory;
pub use page_store::{FilePageStore, PageStore};
