//! WAL Record Types
//!
//! Defines the structure of every record that can appear in a WAL segment.
//! A record is a type tag plus a payload; the tag decides the payload layout
//! and is fixed at construction. The log pointer (segment, offset, size) is
//! assigned exactly once, when the writer appends the record.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::WalPointer;
use crate::checkpoint::FullPageId;
use crate::error::{Error, Result};

/// Record type tags
///
/// Ordinals are stable and written to disk. New kinds are only ever appended
/// at the end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum RecordType {
    TxRecord = 0,
    PageRecord = 1,
    DataRecord = 2,
    StoreOperationRecord = 3,
    CheckpointRecord = 4,
    HeaderRecord = 5,

    // Page deltas
    InitNewPage = 6,
    DataPageInsert = 7,
    DataPageInsertFragment = 8,
    DataPageRemove = 9,
    DataPageSetFreeListPage = 10,
    BtreeMetaPageInitRoot = 11,
    BtreeMetaPageAddRoot = 12,
    BtreeMetaPageCutRoot = 13,
    BtreeInitNewRoot = 14,
    BtreePageRecycle = 15,
    BtreePageInsert = 16,
    BtreeFixLeftmostChild = 17,
    BtreeFixCount = 18,
    BtreePageReplace = 19,
    BtreePageRemove = 20,
    BtreePageInnerReplace = 21,
    BtreeFixRemoveId = 22,
    BtreeForwardPageSplit = 23,
    BtreeExistingPageSplit = 24,
    BtreePageMerge = 25,
    PagesListSetNext = 26,
    PagesListSetPrevious = 27,
    PagesListInitNewPage = 28,
    PagesListAddPage = 29,
    PagesListRemovePage = 30,
    MetaPageInit = 31,
    PartitionMetaPageUpdateCounters = 32,
    MemoryRecovery = 33,
    TrackingPageDelta = 34,
    MetaPageUpdateLastSuccessfulSnapshotId = 35,
    MetaPageUpdateLastSuccessfulFullSnapshotId = 36,
    MetaPageUpdateNextSnapshotId = 37,
    MetaPageUpdateLastAllocatedIndex = 38,
    PartMetaUpdateState = 39,
    PageListMetaResetCount = 40,
    SwitchSegment = 41,
    DataPageUpdate = 42,
    BtreeMetaPageInitRoot2 = 43,
    PartitionDestroy = 44,
    Exchange = 45,
}

impl RecordType {
    /// Every record type, indexed by ordinal
    pub const ALL: [RecordType; 46] = [
        RecordType::TxRecord,
        RecordType::PageRecord,
        RecordType::DataRecord,
        RecordType::StoreOperationRecord,
        RecordType::CheckpointRecord,
        RecordType::HeaderRecord,
        RecordType::InitNewPage,
        RecordType::DataPageInsert,
        RecordType::DataPageInsertFragment,
        RecordType::DataPageRemove,
        RecordType::DataPageSetFreeListPage,
        RecordType::BtreeMetaPageInitRoot,
        RecordType::BtreeMetaPageAddRoot,
        RecordType::BtreeMetaPageCutRoot,
        RecordType::BtreeInitNewRoot,
        RecordType::BtreePageRecycle,
        RecordType::BtreePageInsert,
        RecordType::BtreeFixLeftmostChild,
        RecordType::BtreeFixCount,
        RecordType::BtreePageReplace,
        RecordType::BtreePageRemove,
        RecordType::BtreePageInnerReplace,
        RecordType::BtreeFixRemoveId,
        RecordType::BtreeForwardPageSplit,
        RecordType::BtreeExistingPageSplit,
        RecordType::BtreePageMerge,
        RecordType::PagesListSetNext,
        RecordType::PagesListSetPrevious,
        RecordType::PagesListInitNewPage,
        RecordType::PagesListAddPage,
        RecordType::PagesListRemovePage,
        RecordType::MetaPageInit,
        RecordType::PartitionMetaPageUpdateCounters,
        RecordType::MemoryRecovery,
        RecordType::TrackingPageDelta,
        RecordType::MetaPageUpdateLastSuccessfulSnapshotId,
        RecordType::MetaPageUpdateLastSuccessfulFullSnapshotId,
        RecordType::MetaPageUpdateNextSnapshotId,
        RecordType::MetaPageUpdateLastAllocatedIndex,
        RecordType::PartMetaUpdateState,
        RecordType::PageListMetaResetCount,
        RecordType::SwitchSegment,
        RecordType::DataPageUpdate,
        RecordType::BtreeMetaPageInitRoot2,
        RecordType::PartitionDestroy,
        RecordType::Exchange,
    ];

    /// Look up a record type by ordinal; `None` for ordinals written by a
    /// newer format this build does not know
    pub fn from_ordinal(ordinal: u8) -> Option<RecordType> {
        Self::ALL.get(ordinal as usize).copied()
    }

    /// Stable on-disk ordinal
    pub fn ordinal(self) -> u8 {
        self as u8
    }

    /// Types whose payload is a physical write at an offset inside one page
    pub fn is_page_delta(self) -> bool {
        use RecordType::*;
        matches!(
            self,
            DataPageInsert
                | DataPageInsertFragment
                | DataPageSetFreeListPage
                | BtreeMetaPageInitRoot
                | BtreeMetaPageAddRoot
                | BtreeMetaPageCutRoot
                | BtreeInitNewRoot
                | BtreePageRecycle
                | BtreePageInsert
                | BtreeFixLeftmostChild
                | BtreeFixCount
                | BtreePageReplace
                | BtreePageRemove
                | BtreePageInnerReplace
                | BtreeFixRemoveId
                | BtreeForwardPageSplit
                | BtreeExistingPageSplit
                | BtreePageMerge
                | PagesListSetNext
                | PagesListSetPrevious
                | PagesListAddPage
                | PagesListRemovePage
                | TrackingPageDelta
                | MetaPageUpdateLastSuccessfulSnapshotId
                | MetaPageUpdateLastSuccessfulFullSnapshotId
                | MetaPageUpdateNextSnapshotId
                | MetaPageUpdateLastAllocatedIndex
                | PageListMetaResetCount
                | DataPageUpdate
                | BtreeMetaPageInitRoot2
        )
    }

    /// Types that (re)initialize a page
    pub fn is_page_init(self) -> bool {
        matches!(
            self,
            RecordType::InitNewPage | RecordType::PagesListInitNewPage | RecordType::MetaPageInit
        )
    }

    /// Logical records are replayed by the owner of the data, not applied to pages
    pub fn is_logical(self) -> bool {
        matches!(
            self,
            RecordType::TxRecord | RecordType::DataRecord | RecordType::StoreOperationRecord
        )
    }
}

impl std::fmt::Display for RecordType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Kind of exchange event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum ExchangeType {
    Join = 0,
    Left = 1,
}

impl ExchangeType {
    pub fn from_ordinal(ordinal: u8) -> Option<ExchangeType> {
        match ordinal {
            0 => Some(ExchangeType::Join),
            1 => Some(ExchangeType::Left),
            _ => None,
        }
    }
}

/// Transaction state recorded at a transaction boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum TxState {
    Prepared = 0,
    Committed = 1,
    RolledBack = 2,
}

impl TxState {
    pub fn from_ordinal(ordinal: u8) -> Option<TxState> {
        match ordinal {
            0 => Some(TxState::Prepared),
            1 => Some(TxState::Committed),
            2 => Some(TxState::RolledBack),
            _ => None,
        }
    }
}

/// Row operation carried by a data record entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum DataOp {
    Create = 0,
    Update = 1,
    Delete = 2,
}

impl DataOp {
    pub fn from_ordinal(ordinal: u8) -> Option<DataOp> {
        match ordinal {
            0 => Some(DataOp::Create),
            1 => Some(DataOp::Update),
            2 => Some(DataOp::Delete),
            _ => None,
        }
    }
}

/// Row store or index change carried by a store operation record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum StoreOpType {
    EntryCreate = 0,
    IndexPut = 1,
    IndexRemove = 2,
}

impl StoreOpType {
    pub fn from_ordinal(ordinal: u8) -> Option<StoreOpType> {
        match ordinal {
            0 => Some(StoreOpType::EntryCreate),
            1 => Some(StoreOpType::IndexPut),
            2 => Some(StoreOpType::IndexRemove),
            _ => None,
        }
    }
}

/// Partition lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum PartitionState {
    Moving = 0,
    Owning = 1,
    Renting = 2,
    Evicted = 3,
    Lost = 4,
}

impl PartitionState {
    pub fn from_ordinal(ordinal: u8) -> Option<PartitionState> {
        match ordinal {
            0 => Some(PartitionState::Moving),
            1 => Some(PartitionState::Owning),
            2 => Some(PartitionState::Renting),
            3 => Some(PartitionState::Evicted),
            4 => Some(PartitionState::Lost),
            _ => None,
        }
    }
}

/// Transaction boundary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxRecord {
    pub state: TxState,
    pub xid: Uuid,
    /// Nodes taking part in the transaction, `None` when not tracked
    pub participating_nodes: Option<Vec<String>>,
    pub timestamp: i64,
}

/// Full image of one page
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageSnapshot {
    pub page: FullPageId,
    pub data: Vec<u8>,
}

/// One row change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataEntry {
    pub group_id: i32,
    pub op: DataOp,
    pub partition: u32,
    pub partition_counter: u64,
    pub key: Vec<u8>,
    /// `None` for deletes
    pub value: Option<Vec<u8>>,
}

/// Logical row changes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataRecord {
    pub entries: Vec<DataEntry>,
}

/// Row link added to or removed from a group's store or one of its indexes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreOperation {
    pub op: StoreOpType,
    pub group_id: i32,
    /// Row link, page id and item index packed together
    pub link: i64,
    /// `-1` for the row store itself
    pub index_id: i32,
}

/// Checkpoint begin or end marker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointMarker {
    pub checkpoint_id: Uuid,
    /// For end markers, the pointer of the matching begin marker
    pub mark: Option<WalPointer>,
    pub end: bool,
    /// Pages written by the checkpoint (format version 2)
    pub page_count: u32,
}

/// First record of every segment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderRecord {
    pub segment: u64,
    pub format_version: u8,
}

/// Page (re)initialization
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitNewPage {
    pub page: FullPageId,
    pub io_type: u16,
    pub io_version: u16,
}

/// Physical write of `payload` at `offset` inside a page
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageDelta {
    pub page: FullPageId,
    pub offset: u16,
    pub payload: Vec<u8>,
}

/// Zeroes `len` bytes at `offset` inside a page
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageErase {
    pub page: FullPageId,
    pub offset: u16,
    pub len: u16,
}

/// Partition meta page counters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionCounters {
    pub group_id: i32,
    pub partition: u32,
    pub update_counter: u64,
    pub global_remove_id: u64,
    pub size: u32,
}

/// Partition state change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionStateUpdate {
    pub group_id: i32,
    pub partition: u32,
    pub state: PartitionState,
    pub update_counter: u64,
}

/// Partition removal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionDestroy {
    pub group_id: i32,
    pub partition: u32,
}

/// Marker written once recovery has finished and the node accepts updates
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryRecovery {
    pub timestamp: i64,
}

/// Node join/leave event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeRecord {
    pub kind: ExchangeType,
    pub const_id: Option<String>,
    /// Event time in millis (format version 2)
    pub timestamp: i64,
}

/// Record payloads
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordPayload {
    Tx(TxRecord),
    PageSnapshot(PageSnapshot),
    Data(DataRecord),
    StoreOperation(StoreOperation),
    Checkpoint(CheckpointMarker),
    Header(HeaderRecord),
    InitNewPage(InitNewPage),
    PageDelta(PageDelta),
    PageErase(PageErase),
    PartitionCounters(PartitionCounters),
    PartitionState(PartitionStateUpdate),
    PartitionDestroy(PartitionDestroy),
    MemoryRecovery(MemoryRecovery),
    Exchange(ExchangeRecord),
    SwitchSegment,
}

impl RecordPayload {
    /// Whether this payload can be carried under `record_type`
    pub fn accepts(&self, record_type: RecordType) -> bool {
        match self {
            RecordPayload::Tx(_) => record_type == RecordType::TxRecord,
            RecordPayload::PageSnapshot(_) => record_type == RecordType::PageRecord,
            RecordPayload::Data(_) => record_type == RecordType::DataRecord,
            RecordPayload::StoreOperation(_) => record_type == RecordType::StoreOperationRecord,
            RecordPayload::Checkpoint(_) => record_type == RecordType::CheckpointRecord,
            RecordPayload::Header(_) => record_type == RecordType::HeaderRecord,
            RecordPayload::InitNewPage(_) => record_type.is_page_init(),
            RecordPayload::PageDelta(_) => record_type.is_page_delta(),
            RecordPayload::PageErase(_) => record_type == RecordType::DataPageRemove,
            RecordPayload::PartitionCounters(_) => {
                record_type == RecordType::PartitionMetaPageUpdateCounters
            }
            RecordPayload::PartitionState(_) => record_type == RecordType::PartMetaUpdateState,
            RecordPayload::PartitionDestroy(_) => record_type == RecordType::PartitionDestroy,
            RecordPayload::MemoryRecovery(_) => record_type == RecordType::MemoryRecovery,
            RecordPayload::Exchange(_) => record_type == RecordType::Exchange,
            RecordPayload::SwitchSegment => record_type == RecordType::SwitchSegment,
        }
    }

    /// Default record type for this payload
    pub fn default_type(&self) -> RecordType {
        match self {
            RecordPayload::Tx(_) => RecordType::TxRecord,
            RecordPayload::PageSnapshot(_) => RecordType::PageRecord,
            RecordPayload::Data(_) => RecordType::DataRecord,
            RecordPayload::StoreOperation(_) => RecordType::StoreOperationRecord,
            RecordPayload::Checkpoint(_) => RecordType::CheckpointRecord,
            RecordPayload::Header(_) => RecordType::HeaderRecord,
            RecordPayload::InitNewPage(_) => RecordType::InitNewPage,
            RecordPayload::PageDelta(_) => RecordType::DataPageUpdate,
            RecordPayload::PageErase(_) => RecordType::DataPageRemove,
            RecordPayload::PartitionCounters(_) => RecordType::PartitionMetaPageUpdateCounters,
            RecordPayload::PartitionState(_) => RecordType::PartMetaUpdateState,
            RecordPayload::PartitionDestroy(_) => RecordType::PartitionDestroy,
            RecordPayload::MemoryRecovery(_) => RecordType::MemoryRecovery,
            RecordPayload::Exchange(_) => RecordType::Exchange,
            RecordPayload::SwitchSegment => RecordType::SwitchSegment,
        }
    }
}

/// A WAL record: type tag, payload and (once appended) its log pointer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalRecord {
    record_type: RecordType,
    payload: RecordPayload,
    pointer: Option<WalPointer>,
}

impl WalRecord {
    /// Create a record with an explicit type tag
    pub fn new(record_type: RecordType, payload: RecordPayload) -> Result<Self> {
        if !payload.accepts(record_type) {
            return Err(Error::Wal(format!(
                "Record type {} cannot carry a {:?} payload",
                record_type,
                payload.default_type()
            )));
        }

        Ok(Self {
            record_type,
            payload,
            pointer: None,
        })
    }

    /// Create a record tagged with the payload's default type
    pub fn from_payload(payload: RecordPayload) -> Self {
        Self {
            record_type: payload.default_type(),
            payload,
            pointer: None,
        }
    }

    /// Checkpoint begin marker
    pub fn checkpoint_begin(checkpoint_id: Uuid) -> Self {
        Self::from_payload(RecordPayload::Checkpoint(CheckpointMarker {
            checkpoint_id,
            mark: None,
            end: false,
            page_count: 0,
        }))
    }

    /// Checkpoint end marker referencing its begin marker
    pub fn checkpoint_end(checkpoint_id: Uuid, begin: WalPointer, page_count: u32) -> Self {
        Self::from_payload(RecordPayload::Checkpoint(CheckpointMarker {
            checkpoint_id,
            mark: Some(begin),
            end: true,
            page_count,
        }))
    }

    /// Full page image
    pub fn page_snapshot(page: FullPageId, data: Vec<u8>) -> Self {
        Self::from_payload(RecordPayload::PageSnapshot(PageSnapshot { page, data }))
    }

    /// Physical page write
    pub fn page_delta(page: FullPageId, offset: u16, payload: Vec<u8>) -> Self {
        Self::from_payload(RecordPayload::PageDelta(PageDelta {
            page,
            offset,
            payload,
        }))
    }

    /// Segment header
    pub fn header(segment: u64, format_version: u8) -> Self {
        Self::from_payload(RecordPayload::Header(HeaderRecord {
            segment,
            format_version,
        }))
    }

    /// Segment switch marker
    pub fn switch_segment() -> Self {
        Self::from_payload(RecordPayload::SwitchSegment)
    }

    /// Recovery-finished marker stamped with the current time
    pub fn memory_recovery() -> Self {
        Self::from_payload(RecordPayload::MemoryRecovery(MemoryRecovery {
            timestamp: chrono::Utc::now().timestamp_millis(),
        }))
    }

    pub fn record_type(&self) -> RecordType {
        self.record_type
    }

    pub fn payload(&self) -> &RecordPayload {
        &self.payload
    }

    pub fn into_payload(self) -> RecordPayload {
        self.payload
    }

    /// Log pointer, `None` until appended
    pub fn pointer(&self) -> Option<WalPointer> {
        self.pointer
    }

    /// Byte offset in the segment, `None` until appended
    pub fn position(&self) -> Option<u64> {
        self.pointer.map(|p| p.offset)
    }

    /// Serialized frame size, `None` until appended
    pub fn size(&self) -> Option<u32> {
        self.pointer.map(|p| p.len)
    }

    /// Attach the log pointer; a record is appended at most once
    pub fn assign_pointer(&mut self, pointer: WalPointer) -> Result<()> {
        if let Some(existing) = self.pointer {
            return Err(Error::Wal(format!(
                "Record {} already appended at {}",
                self.record_type, existing
            )));
        }
        self.pointer = Some(pointer);
        Ok(())
    }

    /// Page touched by a physical record
    pub fn page(&self) -> Option<FullPageId> {
        match &self.payload {
            RecordPayload::PageSnapshot(r) => Some(r.page),
            RecordPayload::InitNewPage(r) => Some(r.page),
            RecordPayload::PageDelta(r) => Some(r.page),
            RecordPayload::PageErase(r) => Some(r.page),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ordinals_are_stable() {
        for (idx, ty) in RecordType::ALL.iter().enumerate() {
            assert_eq!(ty.ordinal() as usize, idx);
            assert_eq!(RecordType::from_ordinal(idx as u8), Some(*ty));
        }
        assert_eq!(RecordType::from_ordinal(4), Some(RecordType::CheckpointRecord));
        assert_eq!(RecordType::from_ordinal(41), Some(RecordType::SwitchSegment));
    }

    #[test]
    fn test_unknown_ordinals_are_none() {
        assert_eq!(RecordType::from_ordinal(46), None);
        assert_eq!(RecordType::from_ordinal(255), None);
        assert_eq!(ExchangeType::from_ordinal(2), None);
        assert_eq!(ExchangeType::from_ordinal(1), Some(ExchangeType::Left));
    }

    #[test]
    fn test_payload_rejects_foreign_type() {
        let payload = RecordPayload::SwitchSegment;
        assert!(WalRecord::new(RecordType::CheckpointRecord, payload).is_err());

        let delta = RecordPayload::PageDelta(PageDelta {
            page: FullPageId::new(1, 2),
            offset: 8,
            payload: vec![1, 2, 3],
        });
        let record = WalRecord::new(RecordType::BtreePageInsert, delta).unwrap();
        assert_eq!(record.record_type(), RecordType::BtreePageInsert);
        assert_eq!(record.page(), Some(FullPageId::new(1, 2)));
    }

    #[test]
    fn test_pointer_assigned_once() {
        let mut record = WalRecord::checkpoint_begin(Uuid::new_v4());
        assert_eq!(record.position(), None);

        let ptr = WalPointer::new(3, 64, 40);
        record.assign_pointer(ptr).unwrap();
        assert_eq!(record.position(), Some(64));
        assert_eq!(record.size(), Some(40));

        assert!(record.assign_pointer(WalPointer::new(3, 128, 40)).is_err());
        assert_eq!(record.pointer(), Some(ptr));
    }

    #[test]
    fn test_every_type_has_at_most_one_family() {
        let delta_or_init = RecordType::ALL
            .iter()
            .filter(|t| t.is_page_delta() && t.is_page_init())
            .count();
        assert_eq!(delta_or_init, 0);
    }
}
