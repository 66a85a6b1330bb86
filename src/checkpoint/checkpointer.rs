//! Full checkpoint
//!
//! A checkpoint logs a begin marker and captures the dirty pages under the
//! checkpoint write lock, persists them through the coordinator, syncs the
//! page store and finally logs an end marker pointing back at the begin
//! marker. Recovery only trusts checkpoints whose end marker made it to disk.
//!
//! Pages are written as they were at capture time. Every change in those
//! images was appended to the log before the capture, and the log is synced
//! before the first page write.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::sort::batch_channel;
use super::{AsyncCheckpointer, CheckpointScope, FullPageId};
use crate::error::{Error, Result};
use crate::storage::PageMemory;
use crate::wal::{WalPointer, WalRecord, WalWriter};

/// Outcome of one checkpoint
#[derive(Debug, Clone, Serialize)]
pub struct CheckpointStats {
    pub checkpoint_id: Uuid,
    /// What triggered the checkpoint
    pub reason: String,
    /// Pages written
    pub pages: usize,
    /// Batches the pages were split into
    pub batches: usize,
    pub begin: WalPointer,
    pub end: WalPointer,
    pub duration_ms: u64,
}

/// Runs checkpoints, one at a time
pub struct Checkpointer {
    memory: Arc<PageMemory>,
    wal: WalWriter,
    coordinator: Arc<AsyncCheckpointer>,
    running: tokio::sync::Mutex<()>,
    completed: AtomicU64,
    last: parking_lot::Mutex<Option<CheckpointStats>>,
}

impl Checkpointer {
    pub fn new(memory: Arc<PageMemory>, wal: WalWriter, coordinator: Arc<AsyncCheckpointer>) -> Self {
        Self {
            memory,
            wal,
            coordinator,
            running: tokio::sync::Mutex::new(()),
            completed: AtomicU64::new(0),
            last: parking_lot::Mutex::new(None),
        }
    }

    pub fn coordinator(&self) -> &Arc<AsyncCheckpointer> {
        &self.coordinator
    }

    /// Checkpoints finished since start
    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Acquire)
    }

    /// Stats of the most recent successful checkpoint
    pub fn last_checkpoint(&self) -> Option<CheckpointStats> {
        self.last.lock().clone()
    }

    /// Run a checkpoint now
    ///
    /// Waits for a checkpoint already in progress. On failure the captured
    /// pages are marked dirty again so the next checkpoint retries them.
    pub async fn checkpoint(&self, reason: &str) -> Result<CheckpointStats> {
        let _running = self.running.lock().await;

        if self.coordinator.is_shut_down() {
            return Err(Error::ShuttingDown);
        }

        let started = Instant::now();
        let checkpoint_id = Uuid::new_v4();

        let (begin, scope) = {
            let _guard = self.memory.checkpoint_write_lock().await;
            let begin = self.wal.append(WalRecord::checkpoint_begin(checkpoint_id)).await?;
            (begin, self.memory.begin_checkpoint())
        };

        tracing::info!(
            checkpoint = %checkpoint_id,
            reason = reason,
            pages = scope.total_pages(),
            begin = %begin,
            "Checkpoint started"
        );

        let persisted = self.persist(&scope).await;
        self.memory.end_checkpoint();

        let batches = match persisted {
            Ok(batches) => batches,
            Err(e) => {
                self.memory.mark_dirty(&scope);
                tracing::error!(
                    checkpoint = %checkpoint_id,
                    pages = scope.total_pages(),
                    error = %e,
                    "Checkpoint failed, pages stay dirty"
                );
                return Err(e);
            }
        };

        let pages = scope.total_pages();
        let end = self
            .wal
            .append(WalRecord::checkpoint_end(checkpoint_id, begin, pages as u32))
            .await?;
        self.wal.flush().await?;

        let stats = CheckpointStats {
            checkpoint_id,
            reason: reason.to_string(),
            pages,
            batches,
            begin,
            end,
            duration_ms: started.elapsed().as_millis() as u64,
        };

        tracing::info!(
            checkpoint = %checkpoint_id,
            pages = pages,
            batches = batches,
            duration_ms = stats.duration_ms,
            "Checkpoint finished"
        );

        self.completed.fetch_add(1, Ordering::AcqRel);
        *self.last.lock() = Some(stats.clone());

        // Archived segments before the begin marker are no longer replayed
        match self.wal.release_archive(begin.segment).await {
            Ok(0) => {}
            Ok(removed) => {
                tracing::info!(removed = removed, before = begin.segment, "Removed archived WAL segments");
            }
            Err(e) => tracing::warn!(error = %e, "Failed to remove archived WAL segments"),
        }

        Ok(stats)
    }

    /// Log, write and sync the pages of `scope`, returning the batch count
    async fn persist(&self, scope: &CheckpointScope) -> Result<usize> {
        // Page images must not reach the store ahead of their log records
        self.wal.flush().await?;

        if scope.is_empty() {
            return Ok(0);
        }

        let (tx, rx) = batch_channel();
        let sort = self.coordinator.split_and_sort(scope, tx)?;

        let batches = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&batches);
        let memory = Arc::clone(&self.memory);

        self.coordinator
            .submit_batches(sort, rx, move |pages| {
                counter.fetch_add(1, Ordering::AcqRel);
                let memory = Arc::clone(&memory);
                move || write_batch(&memory, &pages)
            })
            .await?;

        let store = Arc::clone(self.memory.store());
        tokio::task::spawn_blocking(move || store.sync())
            .await
            .map_err(|e| Error::Internal(format!("Page store sync task failed: {}", e)))??;

        Ok(batches.load(Ordering::Acquire))
    }

    /// Run checkpoints every `frequency` until `cancel` fires
    ///
    /// Ticks with nothing dirty are skipped.
    pub fn spawn_periodic(self: Arc<Self>, frequency: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(frequency);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // First tick fires immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                if self.memory.dirty_count() == 0 {
                    continue;
                }

                match self.checkpoint("timeout").await {
                    Ok(_) => {}
                    Err(Error::ShuttingDown) | Err(Error::Interrupted) => break,
                    Err(e) if e.is_retryable() => {
                        tracing::warn!(error = %e, "Periodic checkpoint failed, will retry");
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Periodic checkpoint failed");
                    }
                }
            }

            tracing::debug!("Periodic checkpoints stopped");
        })
    }
}

/// Persist the capture-time image of every page in a batch
fn write_batch(memory: &PageMemory, pages: &[FullPageId]) -> Result<()> {
    for page in pages {
        if !memory.checkpoint_page(*page)? {
            tracing::debug!(page = %page, "Dirty page no longer resident, skipped");
        }
    }
    Ok(())
}
