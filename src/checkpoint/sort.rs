//! Page sort and batch splitting
//!
//! Dirty pages are flattened into one array and sorted by (group, page index)
//! with a recursive fork/join split. Every leaf of at most `batch_pages` ids
//! is sorted and pushed to the batch queue as soon as it is ready, so writers
//! can start before the whole array is ordered.

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use super::FullPageId;
use crate::error::{Error, Result};

/// Message on the batch queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchMessage {
    /// Sorted pages to persist
    Batch(Vec<FullPageId>),
    /// No more batches will follow
    EndOfBatches,
}

pub type BatchSender = mpsc::UnboundedSender<BatchMessage>;
pub type BatchReceiver = mpsc::UnboundedReceiver<BatchMessage>;

/// Create a batch queue
pub fn batch_channel() -> (BatchSender, BatchReceiver) {
    mpsc::unbounded_channel()
}

/// Result of a running sort: the number of batches it produced
pub struct SortHandle {
    rx: oneshot::Receiver<Result<usize>>,
}

impl SortHandle {
    pub(crate) fn new(rx: oneshot::Receiver<Result<usize>>) -> Self {
        Self { rx }
    }

    /// Handle for batches that were produced without a sort
    pub fn completed(batches: usize) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(Ok(batches));
        Self { rx }
    }

    /// Wait for the sort to finish
    pub async fn wait(self) -> Result<usize> {
        self.rx
            .await
            .map_err(|_| Error::Internal("Page sort task dropped without a result".into()))?
    }
}

/// Sort `pages` in place and push its batches
///
/// Must run inside the sort pool so the recursive joins spread across its
/// threads. Does not push `EndOfBatches`; the caller does that on success.
pub fn split_and_sort(
    pages: &mut [FullPageId],
    batch_pages: usize,
    cancel: &CancellationToken,
    queue: &BatchSender,
) -> Result<usize> {
    let batch_pages = batch_pages.max(1);

    if cancel.is_cancelled() {
        return Err(Error::Interrupted);
    }

    if pages.len() <= batch_pages {
        if pages.is_empty() {
            return Ok(0);
        }
        pages.sort_unstable();
        queue
            .send(BatchMessage::Batch(pages.to_vec()))
            .map_err(|_| Error::Interrupted)?;
        return Ok(1);
    }

    let mid = pages.len() / 2;
    pages.select_nth_unstable(mid);
    let (left, right) = pages.split_at_mut(mid);

    let (l, r) = rayon::join(
        || split_and_sort(left, batch_pages, cancel, queue),
        || split_and_sort(right, batch_pages, cancel, queue),
    );

    Ok(l? + r?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::seq::SliceRandom;
    use std::collections::HashSet;

    fn shuffled_pages(groups: i32, per_group: u32) -> Vec<FullPageId> {
        let mut pages: Vec<FullPageId> = (0..groups)
            .flat_map(|g| (0..per_group).map(move |p| FullPageId::new(g - 2, p)))
            .collect();
        pages.shuffle(&mut rand::thread_rng());
        pages
    }

    fn drain(rx: &mut BatchReceiver) -> Vec<Vec<FullPageId>> {
        let mut batches = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            match msg {
                BatchMessage::Batch(b) => batches.push(b),
                BatchMessage::EndOfBatches => break,
            }
        }
        batches
    }

    #[test]
    fn test_batches_cover_scope_exactly() {
        let mut pages = shuffled_pages(5, 1000);
        let expected: HashSet<FullPageId> = pages.iter().copied().collect();

        let (tx, mut rx) = batch_channel();
        let cancel = CancellationToken::new();
        let count = split_and_sort(&mut pages, 128, &cancel, &tx).unwrap();

        let batches = drain(&mut rx);
        assert_eq!(batches.len(), count);

        let mut seen = HashSet::new();
        for batch in &batches {
            assert!(batch.len() <= 128);
            assert!(batch.windows(2).all(|w| w[0] < w[1]));
            for page in batch {
                assert!(seen.insert(*page), "duplicate page {}", page);
            }
        }
        assert_eq!(seen, expected);

        // The whole array ends up sorted too
        assert!(pages.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_small_scope_is_one_batch() {
        let mut pages = shuffled_pages(2, 10);
        let (tx, mut rx) = batch_channel();
        let count = split_and_sort(&mut pages, 512, &CancellationToken::new(), &tx).unwrap();
        assert_eq!(count, 1);
        assert_eq!(drain(&mut rx)[0].len(), 20);
    }

    #[test]
    fn test_empty_scope_has_no_batches() {
        let (tx, mut rx) = batch_channel();
        let count = split_and_sort(&mut [], 16, &CancellationToken::new(), &tx).unwrap();
        assert_eq!(count, 0);
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_cancelled_sort_is_interrupted() {
        let mut pages = shuffled_pages(3, 100);
        let (tx, _rx) = batch_channel();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = split_and_sort(&mut pages, 16, &cancel, &tx).unwrap_err();
        assert!(matches!(err, Error::Interrupted));
    }

    #[tokio::test]
    async fn test_completed_handle() {
        assert_eq!(SortHandle::completed(3).wait().await.unwrap(), 3);
    }
}
