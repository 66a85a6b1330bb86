//! Checkpoint scope
//!
//! The dirty pages captured when a checkpoint starts, kept per group. The
//! scope is owned by one checkpoint and never changes after capture; pages
//! dirtied later belong to the next checkpoint.

use std::collections::BTreeMap;

use super::FullPageId;

/// Dirty page snapshot of one checkpoint
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckpointScope {
    groups: BTreeMap<i32, Vec<u32>>,
    total: usize,
}

impl CheckpointScope {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add the dirty pages of one group
    pub fn add_group(&mut self, group_id: i32, pages: impl IntoIterator<Item = u32>) {
        let entry = self.groups.entry(group_id).or_default();
        let before = entry.len();
        entry.extend(pages);
        self.total += entry.len() - before;
        if entry.is_empty() {
            self.groups.remove(&group_id);
        }
    }

    /// Pages across all groups
    pub fn total_pages(&self) -> usize {
        self.total
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    /// Groups with their page indexes, in group order
    pub fn groups(&self) -> impl Iterator<Item = (i32, &[u32])> {
        self.groups.iter().map(|(group, pages)| (*group, pages.as_slice()))
    }

    /// Every page id in the scope
    pub fn iter(&self) -> impl Iterator<Item = FullPageId> + '_ {
        self.groups
            .iter()
            .flat_map(|(group, pages)| pages.iter().map(|idx| FullPageId::new(*group, *idx)))
    }

    /// Flatten into one array, ready for sorting
    pub fn to_vec(&self) -> Vec<FullPageId> {
        let mut pages = Vec::with_capacity(self.total);
        pages.extend(self.iter());
        pages
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_running_total() {
        let mut scope = CheckpointScope::new();
        assert!(scope.is_empty());

        scope.add_group(5, [9, 1, 4]);
        scope.add_group(-1, [7]);
        scope.add_group(5, [2]);
        scope.add_group(3, []);

        assert_eq!(scope.total_pages(), 5);
        assert_eq!(scope.groups().count(), 2);
        assert_eq!(scope.to_vec().len(), 5);
        assert!(scope.iter().any(|p| p == FullPageId::new(-1, 7)));
    }
}
