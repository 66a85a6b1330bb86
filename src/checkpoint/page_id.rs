//! Full page identifiers
//!
//! A page is addressed by the group (cache) that owns it and its index
//! inside that group's page file.

use serde::{Deserialize, Serialize};

/// Unique address of one fixed-size page across the whole store
///
/// The derived ordering compares `group_id` first and `page_idx` second,
/// which is the order checkpoints write pages in so that writes into each
/// group file are sequential.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FullPageId {
    /// Owning group (cache) identifier
    pub group_id: i32,
    /// Page index inside the group's page file
    pub page_idx: u32,
}

impl FullPageId {
    /// Create a new page identifier
    pub const fn new(group_id: i32, page_idx: u32) -> Self {
        Self { group_id, page_idx }
    }
}

impl std::fmt::Display for FullPageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.group_id, self.page_idx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequential_order() {
        let mut ids = vec![
            FullPageId::new(2, 1),
            FullPageId::new(1, 9),
            FullPageId::new(-3, 100),
            FullPageId::new(1, 2),
        ];
        ids.sort();
        assert_eq!(
            ids,
            vec![
                FullPageId::new(-3, 100),
                FullPageId::new(1, 2),
                FullPageId::new(1, 9),
                FullPageId::new(2, 1),
            ]
        );
    }

    #[test]
    fn test_display() {
        assert_eq!(FullPageId::new(7, 42).to_string(), "7:42");
    }
}
