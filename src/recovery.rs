//! Crash recovery
//!
//! Two passes over the log. The first finds the last checkpoint whose end
//! marker is on disk; the second replays every record from that
//! checkpoint's begin marker. Physical records are applied to page memory,
//! logical records go to the caller and partition meta updates are folded
//! into [`RecoveryStats`].

use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use uuid::Uuid;

use crate::error::Result;
use crate::storage::PageMemory;
use crate::wal::record::PartitionState;
use crate::wal::{ReadPolicy, RecordPayload, WalIterator, WalPaths, WalPointer, WalRecord};

/// Latest known state of one partition
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PartitionMeta {
    pub group_id: i32,
    pub partition: u32,
    pub update_counter: u64,
    pub global_remove_id: u64,
    pub size: u32,
    pub state: Option<PartitionState>,
    pub destroyed: bool,
}

/// Summary of a recovery run
#[derive(Debug, Clone, Default, Serialize)]
pub struct RecoveryStats {
    /// Last checkpoint with an end marker
    pub last_checkpoint: Option<Uuid>,
    /// Where replay started, `None` for the start of the log
    pub replay_from: Option<WalPointer>,
    pub records_read: u64,
    pub pages_applied: u64,
    pub logical_records: u64,
    /// Frames of unknown type skipped by the reader
    pub skipped: u64,
    pub partitions: Vec<PartitionMeta>,
}

/// Where the last completed checkpoint begins
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointMark {
    pub checkpoint_id: Uuid,
    pub begin: Option<WalPointer>,
}

/// Find the last checkpoint with an end marker
pub fn find_last_checkpoint(paths: &WalPaths, policy: ReadPolicy) -> Result<Option<CheckpointMark>> {
    let mut begins: HashMap<Uuid, WalPointer> = HashMap::new();
    let mut last = None;

    for item in WalIterator::open(paths, policy)? {
        let (pointer, record) = item?;
        let RecordPayload::Checkpoint(marker) = record.payload() else {
            continue;
        };

        if !marker.end {
            begins.insert(marker.checkpoint_id, pointer);
            continue;
        }

        let begin = marker.mark.or_else(|| begins.get(&marker.checkpoint_id).copied());
        if begin.is_none() {
            tracing::warn!(
                checkpoint = %marker.checkpoint_id,
                "Checkpoint end marker without a begin marker"
            );
        }
        last = Some(CheckpointMark {
            checkpoint_id: marker.checkpoint_id,
            begin,
        });
    }

    Ok(last)
}

/// Replay the log into `memory`
///
/// `on_logical` sees every transaction and data record from the replay
/// start, in log order. An error from it stops recovery.
pub fn recover<F>(paths: &WalPaths, memory: &PageMemory, policy: ReadPolicy, mut on_logical: F) -> Result<RecoveryStats>
where
    F: FnMut(WalPointer, &WalRecord) -> Result<()>,
{
    let mark = find_last_checkpoint(paths, policy)?;
    let replay_from = mark.and_then(|m| m.begin);

    match &mark {
        Some(m) => tracing::info!(
            checkpoint = %m.checkpoint_id,
            replay_from = ?replay_from.map(|p| p.to_string()),
            "Recovering from last checkpoint"
        ),
        None => tracing::info!("No completed checkpoint, replaying whole log"),
    }

    let mut stats = RecoveryStats {
        last_checkpoint: mark.map(|m| m.checkpoint_id),
        replay_from,
        ..Default::default()
    };
    let mut partitions: BTreeMap<(i32, u32), PartitionMeta> = BTreeMap::new();

    let mut iter = WalIterator::open(paths, policy)?;
    for item in iter.by_ref() {
        let (pointer, record) = item?;
        if replay_from.map_or(false, |start| pointer < start) {
            continue;
        }
        stats.records_read += 1;

        if memory.apply(&record)? {
            stats.pages_applied += 1;
            continue;
        }

        if record.record_type().is_logical() {
            stats.logical_records += 1;
            on_logical(pointer, &record)?;
            continue;
        }

        match record.payload() {
            RecordPayload::PartitionCounters(r) => {
                let meta = partition(&mut partitions, r.group_id, r.partition);
                meta.update_counter = r.update_counter;
                meta.global_remove_id = r.global_remove_id;
                meta.size = r.size;
            }
            RecordPayload::PartitionState(r) => {
                let meta = partition(&mut partitions, r.group_id, r.partition);
                meta.state = Some(r.state);
                meta.update_counter = meta.update_counter.max(r.update_counter);
                meta.destroyed = false;
            }
            RecordPayload::PartitionDestroy(r) => {
                partition(&mut partitions, r.group_id, r.partition).destroyed = true;
            }
            _ => {}
        }
    }

    stats.skipped = iter.skipped();
    stats.partitions = partitions.into_values().collect();

    tracing::info!(
        records = stats.records_read,
        pages = stats.pages_applied,
        logical = stats.logical_records,
        partitions = stats.partitions.len(),
        "Recovery finished"
    );

    Ok(stats)
}

fn partition(map: &mut BTreeMap<(i32, u32), PartitionMeta>, group_id: i32, partition: u32) -> &mut PartitionMeta {
    map.entry((group_id, partition)).or_insert_with(|| PartitionMeta {
        group_id,
        partition,
        ..Default::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::FullPageId;
    use crate::config::WalConfig;
    use crate::storage::{FilePageStore, PageStore};
    use crate::wal::record::{
        DataEntry, DataOp, DataRecord, PartitionCounters, PartitionDestroy, StoreOpType, StoreOperation,
    };
    use crate::wal::RecordType;
    use crate::wal::{list_segments, WalWriter};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn setup(dir: &TempDir) -> (WalPaths, PageMemory) {
        let paths = WalPaths::new(dir.path().join("wal"), dir.path().join("wal/archive"));
        paths.ensure_dirs().unwrap();
        let store = FilePageStore::open(dir.path().join("pages"), 32).unwrap();
        (paths, PageMemory::new(Arc::new(store)))
    }

    async fn write_log(paths: &WalPaths, records: Vec<WalRecord>) -> Vec<WalPointer> {
        let wal = WalWriter::new(paths.clone(), WalConfig::default()).await.unwrap();
        let pointers = wal.append_batch(records).await.unwrap();
        wal.shutdown().await.unwrap();
        pointers
    }

    fn data_record(key: &[u8]) -> WalRecord {
        WalRecord::from_payload(RecordPayload::Data(DataRecord {
            entries: vec![DataEntry {
                group_id: 1,
                op: DataOp::Create,
                partition: 0,
                partition_counter: 1,
                key: key.to_vec(),
                value: Some(b"v".to_vec()),
            }],
        }))
    }

    #[tokio::test]
    async fn test_replay_whole_log_without_checkpoint() {
        let dir = TempDir::new().unwrap();
        let (paths, memory) = setup(&dir);
        let page = FullPageId::new(1, 0);

        write_log(
            &paths,
            vec![
                WalRecord::page_delta(page, 0, vec![1, 2, 3]),
                data_record(b"k1"),
                WalRecord::from_payload(RecordPayload::StoreOperation(StoreOperation {
                    op: StoreOpType::IndexPut,
                    group_id: 1,
                    link: 7,
                    index_id: 2,
                })),
                WalRecord::page_delta(page, 1, vec![9]),
            ],
        )
        .await;

        let mut seen = Vec::new();
        let stats = recover(&paths, &memory, ReadPolicy::Fail, |_, record| {
            seen.push(record.record_type());
            Ok(())
        })
        .unwrap();

        assert!(stats.last_checkpoint.is_none());
        assert!(stats.replay_from.is_none());
        assert_eq!(stats.pages_applied, 2);
        assert_eq!(stats.logical_records, 2);
        assert_eq!(seen, vec![RecordType::DataRecord, RecordType::StoreOperationRecord]);

        let data = memory.read_page(page).unwrap().unwrap();
        assert_eq!(&data[..3], &[1, 9, 3]);
        assert!(memory.is_dirty(page));
    }

    #[tokio::test]
    async fn test_replay_starts_at_last_completed_checkpoint() {
        let dir = TempDir::new().unwrap();
        let (paths, memory) = setup(&dir);
        let page = FullPageId::new(1, 0);
        let first = Uuid::new_v4();
        let unfinished = Uuid::new_v4();

        // The checkpointed image of the page
        memory.store().write_page(page, &[5; 32]).unwrap();

        let mut records = vec![WalRecord::page_delta(page, 0, vec![1]), WalRecord::checkpoint_begin(first)];
        records.push(WalRecord::page_delta(page, 1, vec![2]));
        let pointers = write_log(&paths, records).await;
        let begin = pointers[1];

        write_log(
            &paths,
            vec![
                WalRecord::checkpoint_end(first, begin, 1),
                WalRecord::checkpoint_begin(unfinished),
                WalRecord::page_delta(page, 2, vec![3]),
            ],
        )
        .await;

        let stats = recover(&paths, &memory, ReadPolicy::Fail, |_, _| Ok(())).unwrap();
        assert_eq!(stats.last_checkpoint, Some(first));
        assert_eq!(stats.replay_from, Some(begin));
        assert_eq!(stats.pages_applied, 2);

        // The delta before the begin marker is not replayed
        let data = memory.read_page(page).unwrap().unwrap();
        assert_eq!(&data[..4], &[5, 2, 3, 5]);
    }

    #[tokio::test]
    async fn test_partition_meta_is_collected() {
        let dir = TempDir::new().unwrap();
        let (paths, memory) = setup(&dir);

        write_log(
            &paths,
            vec![
                WalRecord::from_payload(RecordPayload::PartitionCounters(PartitionCounters {
                    group_id: 3,
                    partition: 7,
                    update_counter: 40,
                    global_remove_id: 2,
                    size: 11,
                })),
                WalRecord::from_payload(RecordPayload::PartitionDestroy(PartitionDestroy {
                    group_id: 3,
                    partition: 8,
                })),
            ],
        )
        .await;

        let stats = recover(&paths, &memory, ReadPolicy::Fail, |_, _| Ok(())).unwrap();
        assert_eq!(stats.partitions.len(), 2);
        assert_eq!(stats.partitions[0].update_counter, 40);
        assert_eq!(stats.partitions[0].size, 11);
        assert!(stats.partitions[1].destroyed);
    }

    #[tokio::test]
    async fn test_truncated_tail_is_tolerated() {
        let dir = TempDir::new().unwrap();
        let (paths, memory) = setup(&dir);
        let page = FullPageId::new(0, 0);

        write_log(
            &paths,
            vec![
                WalRecord::page_delta(page, 0, vec![1]),
                WalRecord::page_delta(page, 1, vec![2]),
            ],
        )
        .await;

        let (_, path) = list_segments(&paths.work_dir).unwrap().pop().unwrap();
        let len = std::fs::metadata(&path).unwrap().len();
        let file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(len - 3).unwrap();

        let stats = recover(&paths, &memory, ReadPolicy::Default, |_, _| Ok(())).unwrap();
        assert_eq!(stats.pages_applied, 1);
        let data = memory.read_page(page).unwrap().unwrap();
        assert_eq!(&data[..2], &[1, 0]);
    }

    #[tokio::test]
    async fn test_callback_error_stops_recovery() {
        let dir = TempDir::new().unwrap();
        let (paths, memory) = setup(&dir);
        write_log(&paths, vec![data_record(b"a"), data_record(b"b")]).await;

        let mut calls = 0;
        let err = recover(&paths, &memory, ReadPolicy::Fail, |_, _| {
            calls += 1;
            Err(crate::Error::Internal("apply failed".into()))
        })
        .unwrap_err();
        assert!(matches!(err, crate::Error::Internal(_)));
        assert_eq!(calls, 1);
    }
}
