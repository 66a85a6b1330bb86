//! WAL Writer
//!
//! Batched writer for the Write-Ahead Log. A single task owns the active
//! segment, so appends are serialized in submission order no matter which
//! task or thread produced them.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot, RwLock};

use super::codec::FORMAT_VERSION;
use super::record::WalRecord;
use super::segment::{list_segments, read_segment_header, Segment, FRAME_OVERHEAD};
use super::{WalPaths, WalPointer};
use crate::config::WalConfig;
use crate::error::{Error, Result};

/// Commands sent to the writer task
enum WriterCommand {
    Append {
        record: WalRecord,
        response: oneshot::Sender<Result<WalPointer>>,
    },
    Flush {
        response: oneshot::Sender<Result<()>>,
    },
    ReleaseArchive {
        before: u64,
        response: oneshot::Sender<Result<usize>>,
    },
    Shutdown {
        response: oneshot::Sender<Result<()>>,
    },
}

/// WAL Writer handle
///
/// This is a cloneable handle to the underlying writer task.
#[derive(Clone)]
pub struct WalWriter {
    /// Channel to send commands
    sender: mpsc::Sender<WriterCommand>,
    /// Shared state for reading the log position
    state: Arc<RwLock<WriterState>>,
}

/// Shared writer state
#[derive(Debug, Default)]
struct WriterState {
    /// Index of the active segment
    segment: u64,
    /// Pointer of the last durable record
    last_pointer: Option<WalPointer>,
    /// Records written since the writer started
    records_written: u64,
}

/// Internal writer that manages segments
struct WriterInner {
    /// WAL paths
    paths: WalPaths,
    /// Configuration
    config: WalConfig,
    /// Current active segment
    current: Segment,
    /// Write buffer for batching
    buffer: VecDeque<(WalRecord, oneshot::Sender<Result<WalPointer>>)>,
    /// Last flush time
    last_flush: Instant,
    /// Shared state
    state: Arc<RwLock<WriterState>>,
}

impl WalWriter {
    /// Create a new WAL writer
    ///
    /// Resumes the newest unsealed work segment, or starts a fresh one after
    /// the highest index found in either directory.
    pub async fn new(paths: WalPaths, config: WalConfig) -> Result<Self> {
        paths.ensure_dirs()?;

        let current = Self::open_active_segment(&paths, &config)?;

        let state = Arc::new(RwLock::new(WriterState {
            segment: current.index,
            ..Default::default()
        }));

        tracing::info!(
            segment = current.index,
            offset = current.write_pos(),
            dir = %paths.work_dir.display(),
            "WAL writer started"
        );

        let (sender, receiver) = mpsc::channel(10000);

        let inner = WriterInner {
            paths,
            config,
            current,
            buffer: VecDeque::new(),
            last_flush: Instant::now(),
            state: Arc::clone(&state),
        };

        // Spawn writer task
        tokio::spawn(Self::writer_task(inner, receiver));

        Ok(Self { sender, state })
    }

    /// Pick up where the previous process left off
    fn open_active_segment(paths: &WalPaths, config: &WalConfig) -> Result<Segment> {
        let max_size = config.segment_size_bytes();
        let work = list_segments(&paths.work_dir)?;
        let archived = list_segments(&paths.archive_dir)?;

        if let Some((index, path)) = work.last() {
            let header = read_segment_header(path)?;
            if !header.sealed {
                return Segment::open(path.clone(), max_size);
            }

            // Sealed right before a crash, never moved
            if config.archive {
                std::fs::rename(path, paths.archive_segment_path(*index))?;
                tracing::info!(segment = index, "Archived sealed WAL segment left in work dir");
            }
        }

        let next = work
            .iter()
            .chain(archived.iter())
            .map(|(idx, _)| idx + 1)
            .max()
            .unwrap_or(0);

        Self::start_segment(paths, next, max_size)
    }

    /// Create segment `index` and write its header record
    fn start_segment(paths: &WalPaths, index: u64, max_size: u64) -> Result<Segment> {
        let mut segment = Segment::create(paths.work_segment_path(index), index, max_size)?;
        let mut header = WalRecord::header(index, FORMAT_VERSION);
        segment
            .try_append(&mut header, false, 0)?
            .ok_or_else(|| Error::Wal("Segment too small for its header record".into()))?;
        Ok(segment)
    }

    /// Append a record to the WAL
    ///
    /// Resolves once the record's batch has been written (and synced when
    /// `fsync` is on).
    pub async fn append(&self, record: WalRecord) -> Result<WalPointer> {
        let (tx, rx) = oneshot::channel();

        self.sender
            .send(WriterCommand::Append {
                record,
                response: tx,
            })
            .await
            .map_err(|_| Error::Wal("Writer task terminated".into()))?;

        rx.await.map_err(|_| Error::Wal("Write cancelled".into()))?
    }

    /// Append multiple records in order
    pub async fn append_batch(&self, records: Vec<WalRecord>) -> Result<Vec<WalPointer>> {
        let mut pointers = Vec::with_capacity(records.len());
        for record in records {
            pointers.push(self.append(record).await?);
        }
        Ok(pointers)
    }

    /// Force flush the buffer and sync the active segment
    pub async fn flush(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(WriterCommand::Flush { response: tx })
            .await
            .map_err(|_| Error::Wal("Writer task terminated".into()))?;

        rx.await.map_err(|_| Error::Wal("Flush cancelled".into()))?
    }

    /// Delete archived segments older than segment `before`
    ///
    /// The newest `keep_archived_segments` of them stay. Returns how many
    /// files were removed.
    pub async fn release_archive(&self, before: u64) -> Result<usize> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(WriterCommand::ReleaseArchive { before, response: tx })
            .await
            .map_err(|_| Error::Wal("Writer task terminated".into()))?;

        rx.await.map_err(|_| Error::Wal("Archive release cancelled".into()))?
    }

    /// Flush, sync and stop the writer task
    ///
    /// Appends through any clone of this handle fail afterwards.
    pub async fn shutdown(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        if self
            .sender
            .send(WriterCommand::Shutdown { response: tx })
            .await
            .is_err()
        {
            // Already stopped
            return Ok(());
        }
        // A dropped response means the task stopped on an earlier shutdown
        rx.await.unwrap_or(Ok(()))
    }

    /// Index of the active segment
    pub async fn current_segment(&self) -> u64 {
        self.state.read().await.segment
    }

    /// Pointer of the last written record
    pub async fn last_pointer(&self) -> Option<WalPointer> {
        self.state.read().await.last_pointer
    }

    /// Records written by this writer
    pub async fn records_written(&self) -> u64 {
        self.state.read().await.records_written
    }

    /// Writer task that processes commands
    async fn writer_task(mut inner: WriterInner, mut receiver: mpsc::Receiver<WriterCommand>) {
        let flush_interval = inner.config.flush_interval();
        let batch_size = inner.config.batch_size;

        loop {
            // Wait for next command or flush timeout
            let timeout = flush_interval.saturating_sub(inner.last_flush.elapsed());

            tokio::select! {
                command = receiver.recv() => match command {
                    Some(WriterCommand::Append { record, response }) => {
                        inner.buffer.push_back((record, response));

                        // Flush if batch is full
                        if inner.buffer.len() >= batch_size {
                            if let Err(e) = inner.flush_buffer().await {
                                tracing::error!(error = %e, "WAL flush failed");
                            }
                        }
                    }
                    Some(WriterCommand::Flush { response }) => {
                        let result = inner.flush_and_sync().await;
                        let _ = response.send(result);
                    }
                    Some(WriterCommand::ReleaseArchive { before, response }) => {
                        let _ = response.send(inner.release_archive(before));
                    }
                    Some(WriterCommand::Shutdown { response }) => {
                        let result = inner.flush_and_sync().await;
                        tracing::info!(segment = inner.current.index, "WAL writer stopped");
                        let _ = response.send(result);
                        break;
                    }
                    None => {
                        // Every handle dropped
                        if let Err(e) = inner.flush_and_sync().await {
                            tracing::error!(error = %e, "Final WAL flush failed");
                        }
                        break;
                    }
                },
                _ = tokio::time::sleep(timeout), if !inner.buffer.is_empty() => {
                    // Flush on timeout
                    if let Err(e) = inner.flush_buffer().await {
                        tracing::error!(error = %e, "WAL flush failed");
                    }
                }
            }
        }
    }
}

impl WriterInner {
    /// Flush the write buffer to disk
    async fn flush_buffer(&mut self) -> Result<()> {
        if self.buffer.is_empty() {
            self.last_flush = Instant::now();
            return Ok(());
        }

        let mut responses = Vec::with_capacity(self.buffer.len());
        let mut failure = None;

        while let Some((mut record, response)) = self.buffer.pop_front() {
            if let Some(e) = &failure {
                responses.push((response, Err(Error::Wal(format!("Earlier append failed: {}", e)))));
                continue;
            }

            match self.append_one(&mut record) {
                Ok(pointer) => responses.push((response, Ok(pointer))),
                Err(e) => {
                    failure = Some(e.to_string());
                    responses.push((response, Err(e)));
                }
            }
        }

        // Sync if configured
        let synced = if self.config.fsync {
            self.current.sync()
        } else {
            Ok(())
        };

        {
            let mut state = self.state.write().await;
            state.segment = self.current.index;
            for (_, result) in &responses {
                if let Ok(pointer) = result {
                    state.last_pointer = Some(*pointer);
                    state.records_written += 1;
                }
            }
        }

        match synced {
            Ok(()) => {
                for (response, result) in responses {
                    let _ = response.send(result);
                }
            }
            Err(e) => {
                let reason = e.to_string();
                for (response, _) in responses {
                    let _ = response.send(Err(Error::Wal(format!("WAL sync failed: {}", reason))));
                }
                self.last_flush = Instant::now();
                return Err(e);
            }
        }

        self.last_flush = Instant::now();

        match failure {
            Some(reason) => Err(Error::Wal(reason)),
            None => Ok(()),
        }
    }

    async fn flush_and_sync(&mut self) -> Result<()> {
        self.flush_buffer().await?;
        self.current.sync()
    }

    /// Append one record, rotating first if it does not fit
    fn append_one(&mut self, record: &mut WalRecord) -> Result<WalPointer> {
        let reserve = FRAME_OVERHEAD as u64;
        let compress = self.config.compression;

        if let Some(pointer) = self.current.try_append(record, compress, reserve)? {
            return Ok(pointer);
        }

        self.rotate()?;

        self.current
            .try_append(record, compress, reserve)?
            .ok_or_else(|| {
                Error::Wal(format!(
                    "{} record does not fit in an empty segment of {} bytes",
                    record.record_type(),
                    self.config.segment_size_bytes()
                ))
            })
    }

    fn release_archive(&self, before: u64) -> Result<usize> {
        let old: Vec<_> = list_segments(&self.paths.archive_dir)?
            .into_iter()
            .filter(|(index, _)| *index < before)
            .collect();
        let keep = usize::try_from(self.config.keep_archived_segments).unwrap_or(usize::MAX);
        let excess = old.len().saturating_sub(keep);

        for (index, path) in &old[..excess] {
            std::fs::remove_file(path)?;
            tracing::debug!(segment = index, "Removed archived WAL segment");
        }
        Ok(excess)
    }

    /// Close the active segment and start the next one
    fn rotate(&mut self) -> Result<()> {
        let index = self.current.index;

        let mut switch = WalRecord::switch_segment();
        self.current
            .try_append(&mut switch, false, 0)?
            .ok_or_else(|| Error::Wal(format!("No room for switch record in segment {}", index)))?;
        self.current.seal()?;

        if self.config.archive {
            std::fs::rename(&self.current.path, self.paths.archive_segment_path(index))?;
        }

        self.current = WalWriter::start_segment(
            &self.paths,
            index + 1,
            self.config.segment_size_bytes(),
        )?;

        tracing::info!(
            from = index,
            to = index + 1,
            archived = self.config.archive,
            "Rotated WAL segment"
        );

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::FullPageId;
    use crate::wal::segment::list_segments;
    use tempfile::tempdir;

    fn test_config() -> WalConfig {
        WalConfig {
            batch_size: 10,
            flush_interval_ms: 5,
            compression: false,
            segment_size_mb: 1,
            fsync: false,
            archive: true,
            keep_archived_segments: 8,
        }
    }

    fn test_paths(dir: &std::path::Path) -> WalPaths {
        WalPaths::new(dir.join("wal"), dir.join("wal").join("archive"))
    }

    #[tokio::test]
    async fn test_writer_basic() {
        let dir = tempdir().unwrap();
        let writer = WalWriter::new(test_paths(dir.path()), test_config())
            .await
            .unwrap();

        let record = WalRecord::page_delta(FullPageId::new(1, 1), 0, vec![1, 2, 3]);
        let ptr = writer.append(record).await.unwrap();
        assert_eq!(ptr.segment, 0);

        assert_eq!(writer.last_pointer().await, Some(ptr));
        assert_eq!(writer.records_written().await, 1);
    }

    #[tokio::test]
    async fn test_appends_are_ordered() {
        let dir = tempdir().unwrap();
        let writer = WalWriter::new(test_paths(dir.path()), test_config())
            .await
            .unwrap();

        let mut last = None;
        for i in 0..100u32 {
            let record = WalRecord::page_delta(FullPageId::new(1, i), 0, vec![i as u8; 16]);
            let ptr = writer.append(record).await.unwrap();
            if let Some(prev) = last {
                assert!(ptr > prev);
            }
            last = Some(ptr);
        }

        writer.flush().await.unwrap();
    }

    #[tokio::test]
    async fn test_rotation_archives_sealed_segments() {
        let dir = tempdir().unwrap();
        let paths = test_paths(dir.path());
        let writer = WalWriter::new(paths.clone(), test_config()).await.unwrap();

        // ~3 MB of deltas over 1 MB segments
        for i in 0..48u32 {
            let record = WalRecord::page_delta(FullPageId::new(2, i), 0, vec![7; 64 * 1024]);
            writer.append(record).await.unwrap();
        }
        writer.flush().await.unwrap();

        let current = writer.current_segment().await;
        assert!(current >= 2);

        let archived = list_segments(&paths.archive_dir).unwrap();
        assert_eq!(archived.len() as u64, current);
        let work = list_segments(&paths.work_dir).unwrap();
        assert_eq!(work.len(), 1);
        assert_eq!(work[0].0, current);
    }

    #[tokio::test]
    async fn test_release_archive_keeps_newest() {
        let dir = tempdir().unwrap();
        let paths = test_paths(dir.path());
        let config = WalConfig {
            keep_archived_segments: 1,
            ..test_config()
        };
        let writer = WalWriter::new(paths.clone(), config).await.unwrap();

        for i in 0..64u32 {
            let record = WalRecord::page_delta(FullPageId::new(3, i), 0, vec![1; 64 * 1024]);
            writer.append(record).await.unwrap();
        }
        writer.flush().await.unwrap();

        let current = writer.current_segment().await;
        assert!(current >= 3);
        assert_eq!(list_segments(&paths.archive_dir).unwrap().len() as u64, current);

        // Segments at or past `before` are never touched
        let removed = writer.release_archive(current - 1).await.unwrap();
        assert_eq!(removed as u64, current - 2);
        let left: Vec<u64> = list_segments(&paths.archive_dir)
            .unwrap()
            .into_iter()
            .map(|(idx, _)| idx)
            .collect();
        assert_eq!(left, vec![current - 2, current - 1]);

        assert_eq!(writer.release_archive(current - 1).await.unwrap(), 0);
        writer.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_restart_resumes_active_segment() {
        let dir = tempdir().unwrap();
        let paths = test_paths(dir.path());

        let first = {
            let writer = WalWriter::new(paths.clone(), test_config()).await.unwrap();
            let ptr = writer
                .append(WalRecord::page_delta(FullPageId::new(1, 1), 0, vec![1]))
                .await
                .unwrap();
            writer.shutdown().await.unwrap();
            ptr
        };

        let writer = WalWriter::new(paths, test_config()).await.unwrap();
        let second = writer
            .append(WalRecord::page_delta(FullPageId::new(1, 2), 0, vec![2]))
            .await
            .unwrap();

        assert_eq!(second.segment, first.segment);
        assert_eq!(second.offset, first.offset + first.len as u64);
    }

    #[tokio::test]
    async fn test_shutdown_is_final() {
        let dir = tempdir().unwrap();
        let writer = WalWriter::new(test_paths(dir.path()), test_config())
            .await
            .unwrap();

        writer.shutdown().await.unwrap();
        writer.shutdown().await.unwrap();

        let err = writer
            .append(WalRecord::switch_segment())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Wal(_)));
    }
}
