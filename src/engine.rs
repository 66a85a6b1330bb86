//! Page store engine
//!
//! Wires the pieces together: recovery on open, the WAL writer, page memory,
//! the checkpointer and its periodic trigger, and the type metadata store.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::checkpoint::{AsyncCheckpointer, CheckpointStats, Checkpointer, FullPageId};
use crate::config::WolfPageConfig;
use crate::error::{Error, Result};
use crate::metadata::MetadataStore;
use crate::recovery::{self, RecoveryStats};
use crate::storage::{FilePageStore, PageMemory, PageStore};
use crate::wal::{segment_infos, ReadPolicy, SegmentInfo, WalPaths, WalPointer, WalRecord, WalWriter};

/// Locks keeping log order and apply order of one page the same
const PAGE_LOCK_STRIPES: usize = 64;

pub struct Engine {
    config: WolfPageConfig,
    paths: WalPaths,
    memory: Arc<PageMemory>,
    wal: WalWriter,
    checkpointer: Arc<Checkpointer>,
    metadata: MetadataStore,
    recovery: RecoveryStats,
    cancel: CancellationToken,
    periodic: parking_lot::Mutex<Option<JoinHandle<()>>>,
    page_locks: Box<[tokio::sync::Mutex<()>]>,
    shut_down: AtomicBool,
}

impl Engine {
    /// Open the store, replaying the log
    pub async fn open(config: WolfPageConfig) -> Result<Self> {
        Self::open_with(config, |_, _| Ok(())).await
    }

    /// Open the store, handing logical records seen during replay to `on_logical`
    pub async fn open_with<F>(config: WolfPageConfig, on_logical: F) -> Result<Self>
    where
        F: FnMut(WalPointer, &WalRecord) -> Result<()> + Send + 'static,
    {
        config.validate()?;

        let paths = WalPaths::from_config(&config);
        paths.ensure_dirs()?;

        let store: Arc<dyn PageStore> =
            Arc::new(FilePageStore::open(config.pages_dir(), config.storage.page_size)?);
        let memory = Arc::new(PageMemory::new(store));
        let metadata = MetadataStore::open(config.meta_dir())?;

        let recovery = {
            let paths = paths.clone();
            let memory = Arc::clone(&memory);
            tokio::task::spawn_blocking(move || {
                recovery::recover(&paths, &memory, ReadPolicy::Default, on_logical)
            })
            .await
            .map_err(|e| Error::Internal(format!("Recovery task failed: {}", e)))??
        };

        let wal = WalWriter::new(paths.clone(), config.wal.clone()).await?;
        let coordinator = Arc::new(AsyncCheckpointer::new(&config.checkpoint)?);
        let checkpointer = Arc::new(Checkpointer::new(Arc::clone(&memory), wal.clone(), coordinator));

        wal.append(WalRecord::memory_recovery()).await?;

        let cancel = CancellationToken::new();
        let periodic = config
            .checkpoint
            .frequency()
            .map(|frequency| Arc::clone(&checkpointer).spawn_periodic(frequency, cancel.clone()));

        tracing::info!(
            data_dir = %config.data_dir().display(),
            page_size = config.storage.page_size,
            recovered_pages = memory.dirty_count(),
            types = metadata.types().len(),
            "Page store opened"
        );

        Ok(Self {
            config,
            paths,
            memory,
            wal,
            checkpointer,
            metadata,
            recovery,
            cancel,
            periodic: parking_lot::Mutex::new(periodic),
            page_locks: (0..PAGE_LOCK_STRIPES).map(|_| tokio::sync::Mutex::new(())).collect(),
            shut_down: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &WolfPageConfig {
        &self.config
    }

    pub fn memory(&self) -> &Arc<PageMemory> {
        &self.memory
    }

    pub fn wal(&self) -> &WalWriter {
        &self.wal
    }

    pub fn metadata(&self) -> &MetadataStore {
        &self.metadata
    }

    /// What recovery found when the store was opened
    pub fn recovery_stats(&self) -> &RecoveryStats {
        &self.recovery
    }

    /// Stats of the last successful checkpoint
    pub fn last_checkpoint(&self) -> Option<CheckpointStats> {
        self.checkpointer.last_checkpoint()
    }

    /// Segments on disk
    pub fn segments(&self) -> Result<Vec<SegmentInfo>> {
        segment_infos(&self.paths)
    }

    /// Log a record, then apply it to page memory if it is physical
    ///
    /// Records that do not fit their page are rejected before anything is
    /// logged. A failed append leaves page memory untouched.
    pub async fn log(&self, record: WalRecord) -> Result<WalPointer> {
        self.ensure_running()?;

        let _guard = self.memory.checkpoint_read_lock().await;
        let Some(page) = record.page() else {
            return self.wal.append(record).await;
        };

        let _page_guard = self.page_lock(page).lock().await;
        self.memory.prepare(&record)?;
        let pointer = self.wal.append(record.clone()).await?;
        self.memory.apply(&record)?;
        Ok(pointer)
    }

    /// Write `bytes` at `offset` inside a page
    pub async fn update_page(&self, page: FullPageId, offset: u16, bytes: Vec<u8>) -> Result<WalPointer> {
        self.log(WalRecord::page_delta(page, offset, bytes)).await
    }

    /// Replace a whole page
    pub async fn put_page(&self, page: FullPageId, data: Vec<u8>) -> Result<WalPointer> {
        self.log(WalRecord::page_snapshot(page, data)).await
    }

    pub fn read_page(&self, page: FullPageId) -> Result<Option<Vec<u8>>> {
        self.memory.read_page(page)
    }

    /// Run a checkpoint now
    pub async fn checkpoint(&self, reason: &str) -> Result<CheckpointStats> {
        self.ensure_running()?;
        self.checkpointer.checkpoint(reason).await
    }

    /// Stop the periodic trigger, checkpoint what is dirty and close the log
    ///
    /// Calling it again is a no-op.
    pub async fn shutdown(&self) -> Result<()> {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        tracing::info!("Shutting down page store");

        self.cancel.cancel();
        let periodic = self.periodic.lock().take();
        if let Some(handle) = periodic {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Periodic checkpoint task ended abnormally");
            }
        }

        let mut result = Ok(());
        if self.memory.dirty_count() > 0 {
            if let Err(e) = self.checkpointer.checkpoint("shutdown").await {
                tracing::error!(error = %e, "Final checkpoint failed, log replay will cover it");
                result = Err(e);
            }
        }

        self.checkpointer.coordinator().shutdown().await;
        self.wal.shutdown().await?;

        tracing::info!("Page store stopped");
        result
    }

    fn page_lock(&self, page: FullPageId) -> &tokio::sync::Mutex<()> {
        let slot = (page.group_id as u32 as usize)
            .wrapping_mul(31)
            .wrapping_add(page.page_idx as usize);
        &self.page_locks[slot % PAGE_LOCK_STRIPES]
    }

    fn ensure_running(&self) -> Result<()> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(Error::ShuttingDown);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{FieldMeta, TypeMetadata};
    use crate::wal::record::{TxRecord, TxState};
    use crate::wal::RecordPayload;
    use tempfile::TempDir;
    use uuid::Uuid;

    fn test_config(dir: &TempDir) -> WolfPageConfig {
        let mut config = WolfPageConfig::with_data_dir(dir.path().to_path_buf());
        config.storage.page_size = 512;
        config.wal.flush_interval_ms = 5;
        config.checkpoint.threads = 2;
        config.checkpoint.sort_threads = 2;
        config.checkpoint.batch_pages = 4;
        config.checkpoint.frequency_ms = 0;
        config
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_pages_survive_clean_restart() {
        let dir = TempDir::new().unwrap();
        {
            let engine = Engine::open(test_config(&dir)).await.unwrap();
            for i in 0..10u32 {
                engine.update_page(FullPageId::new(1, i), 0, vec![i as u8; 8]).await.unwrap();
            }
            engine.shutdown().await.unwrap();
            engine.shutdown().await.unwrap();
            assert_eq!(engine.last_checkpoint().unwrap().pages, 10);
            assert!(matches!(
                engine.update_page(FullPageId::new(1, 0), 0, vec![1]).await,
                Err(Error::ShuttingDown)
            ));
        }

        let engine = Engine::open(test_config(&dir)).await.unwrap();
        assert!(engine.recovery_stats().last_checkpoint.is_some());
        assert_eq!(engine.recovery_stats().pages_applied, 0);

        let page = engine.read_page(FullPageId::new(1, 7)).unwrap().unwrap();
        assert_eq!(&page[..8], &[7; 8]);
        engine.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_unchecked_updates_are_replayed() {
        let dir = TempDir::new().unwrap();
        let xid = Uuid::new_v4();
        {
            let engine = Engine::open(test_config(&dir)).await.unwrap();
            engine.update_page(FullPageId::new(2, 0), 4, b"before".to_vec()).await.unwrap();
            engine.checkpoint("test").await.unwrap();
            engine.update_page(FullPageId::new(2, 0), 4, b"after!".to_vec()).await.unwrap();
            engine
                .log(WalRecord::from_payload(RecordPayload::Tx(TxRecord {
                    state: TxState::Committed,
                    xid,
                    participating_nodes: None,
                    timestamp: 1,
                })))
                .await
                .unwrap();

            // Crash: the log is closed without a final checkpoint
            engine.wal().shutdown().await.unwrap();
            engine.checkpointer.coordinator().shutdown().await;
        }

        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let engine = Engine::open_with(test_config(&dir), move |_, record| {
            sink.lock().push(record.clone());
            Ok(())
        })
        .await
        .unwrap();

        assert_eq!(engine.recovery_stats().pages_applied, 1);
        assert_eq!(seen.lock().len(), 1);
        let page = engine.read_page(FullPageId::new(2, 0)).unwrap().unwrap();
        assert_eq!(&page[4..10], b"after!");
        assert!(engine.memory().is_dirty(FullPageId::new(2, 0)));
        engine.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_out_of_page_update_is_not_logged() {
        let dir = TempDir::new().unwrap();
        let engine = Engine::open(test_config(&dir)).await.unwrap();
        let before = engine.wal().records_written().await;

        let err = engine.update_page(FullPageId::new(0, 0), 510, vec![1, 2, 3]).await.unwrap_err();
        assert!(matches!(err, Error::PageStore(_)));
        assert_eq!(engine.wal().records_written().await, before);
        engine.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_failed_append_leaves_page_untouched() {
        let dir = TempDir::new().unwrap();
        let mut config = test_config(&dir);
        config.storage.page_size = 2 * 1024 * 1024;
        config.wal.segment_size_mb = 1;
        config.wal.compression = false;
        let page = FullPageId::new(3, 0);

        {
            let engine = Engine::open(config.clone()).await.unwrap();
            let err = engine.put_page(page, vec![7; 2 * 1024 * 1024]).await.unwrap_err();
            assert!(matches!(err, Error::Wal(_)));
            assert!(engine.read_page(page).unwrap().is_none());
            assert!(!engine.memory().is_dirty(page));
            engine.shutdown().await.unwrap();
        }

        let engine = Engine::open(config).await.unwrap();
        assert!(engine.read_page(page).unwrap().is_none());
        engine.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_read_back_record_is_not_logged_again() {
        let dir = TempDir::new().unwrap();
        let page = FullPageId::new(4, 1);
        {
            let engine = Engine::open(test_config(&dir)).await.unwrap();
            engine.update_page(page, 0, b"once".to_vec()).await.unwrap();
            engine.wal().flush().await.unwrap();

            let paths = WalPaths::from_config(engine.config());
            let (_, logged) = crate::wal::WalIterator::open(&paths, ReadPolicy::Fail)
                .unwrap()
                .map(|item| item.unwrap())
                .find(|(_, record)| record.page() == Some(page))
                .unwrap();

            assert!(matches!(engine.log(logged).await, Err(Error::Wal(_))));
            engine.wal().shutdown().await.unwrap();
            engine.checkpointer.coordinator().shutdown().await;
        }

        let engine = Engine::open(test_config(&dir)).await.unwrap();
        assert_eq!(engine.recovery_stats().pages_applied, 1);
        engine.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_metadata_is_reloaded() {
        let dir = TempDir::new().unwrap();
        {
            let engine = Engine::open(test_config(&dir)).await.unwrap();
            let fields = [("id".to_string(), FieldMeta::named("id", 4))].into_iter().collect();
            engine
                .metadata()
                .save(&TypeMetadata::new(10, "Order").with_fields(fields).explicit())
                .unwrap();
            engine.shutdown().await.unwrap();
        }

        let engine = Engine::open(test_config(&dir)).await.unwrap();
        assert_eq!(engine.metadata().get(10).unwrap().type_name, "Order");
        engine.shutdown().await.unwrap();
    }
}
