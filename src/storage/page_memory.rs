//! In-memory page cache with dirty tracking
//!
//! Pages are fixed-size buffers keyed by [`FullPageId`], loaded from the page
//! store on first touch. Every modification marks the page dirty in a
//! per-group [`IntSet`]; a checkpoint takes those sets wholesale so writers
//! keep dirtying a fresh generation while the captured one is persisted.
//!
//! While a checkpoint runs, the first change to a captured page saves the
//! page's capture-time image, and the checkpoint writes that image instead of
//! the live one. Bytes applied after the capture never reach the page store
//! ahead of the next checkpoint.

use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use super::PageStore;
use crate::checkpoint::{CheckpointScope, FullPageId};
use crate::error::{Error, Result};
use crate::util::IntSet;
use crate::wal::{RecordPayload, WalRecord};

pub struct PageMemory {
    page_size: usize,
    store: Arc<dyn PageStore>,
    pages: RwLock<HashMap<FullPageId, Box<[u8]>>>,
    dirty: Mutex<BTreeMap<i32, IntSet>>,
    checkpoint: Mutex<Option<CheckpointBuffer>>,
    checkpoint_lock: tokio::sync::RwLock<()>,
}

/// Pages captured by the running checkpoint and not yet written
#[derive(Default)]
struct CheckpointBuffer {
    captured: BTreeMap<i32, IntSet>,
    /// Capture-time images of captured pages changed since
    saved: HashMap<FullPageId, Box<[u8]>>,
}

impl CheckpointBuffer {
    fn holds(&self, page: FullPageId) -> bool {
        self.captured
            .get(&page.group_id)
            .map_or(false, |set| set.contains(page.page_idx))
    }

    fn release(&mut self, page: FullPageId) {
        if let Some(set) = self.captured.get_mut(&page.group_id) {
            set.remove(page.page_idx);
        }
        self.saved.remove(&page);
    }
}

impl PageMemory {
    pub fn new(store: Arc<dyn PageStore>) -> Self {
        Self {
            page_size: store.page_size(),
            store,
            pages: RwLock::new(HashMap::new()),
            dirty: Mutex::new(BTreeMap::new()),
            checkpoint: Mutex::new(None),
            checkpoint_lock: tokio::sync::RwLock::new(()),
        }
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Backing page store
    pub fn store(&self) -> &Arc<dyn PageStore> {
        &self.store
    }

    /// Write `bytes` at `offset` inside a page
    pub fn write(&self, page: FullPageId, offset: usize, bytes: &[u8]) -> Result<()> {
        self.check_range(page, offset, bytes.len())?;
        self.modify(page, |buf| buf[offset..offset + bytes.len()].copy_from_slice(bytes))
    }

    /// Zero `len` bytes at `offset` inside a page
    pub fn erase(&self, page: FullPageId, offset: usize, len: usize) -> Result<()> {
        self.check_range(page, offset, len)?;
        self.modify(page, |buf| buf[offset..offset + len].fill(0))
    }

    /// Reset a page and stamp its io type and version
    pub fn init_page(&self, page: FullPageId, io_type: u16, io_version: u16) -> Result<()> {
        self.check_range(page, 0, 4)?;
        self.modify(page, |buf| {
            buf.fill(0);
            buf[0..2].copy_from_slice(&io_type.to_be_bytes());
            buf[2..4].copy_from_slice(&io_version.to_be_bytes());
        })
    }

    /// Replace a whole page
    ///
    /// Shorter images are zero padded.
    pub fn put_page(&self, page: FullPageId, data: &[u8]) -> Result<()> {
        self.check_image(page, data.len())?;

        let mut image = vec![0u8; self.page_size].into_boxed_slice();
        image[..data.len()].copy_from_slice(data);
        {
            let mut pages = self.pages.write();
            if let Some(old) = pages.get(&page) {
                self.save_capture_image(page, &old[..]);
            }
            pages.insert(page, image);
        }
        self.mark_page_dirty(page);
        Ok(())
    }

    /// Copy of a page, from memory or else from the store
    pub fn read_page(&self, page: FullPageId) -> Result<Option<Vec<u8>>> {
        if let Some(buf) = self.pages.read().get(&page) {
            return Ok(Some(buf.to_vec()));
        }

        let mut buf = vec![0u8; self.page_size];
        if self.store.read_page(page, &mut buf)? {
            Ok(Some(buf))
        } else {
            Ok(None)
        }
    }

    /// Persist a page as the running checkpoint captured it
    ///
    /// Outside a checkpoint this is the current image. Returns false if the
    /// page is not in memory.
    pub fn checkpoint_page(&self, page: FullPageId) -> Result<bool> {
        let image = {
            let pages = self.pages.read();
            let checkpoint = self.checkpoint.lock();
            match checkpoint.as_ref().and_then(|buffer| buffer.saved.get(&page)) {
                Some(saved) => saved.to_vec(),
                None => match pages.get(&page) {
                    Some(buf) => buf.to_vec(),
                    None => return Ok(false),
                },
            }
        };

        self.store.write_page(page, &image)?;

        if let Some(buffer) = self.checkpoint.lock().as_mut() {
            buffer.release(page);
        }
        Ok(true)
    }

    pub fn is_dirty(&self, page: FullPageId) -> bool {
        self.dirty
            .lock()
            .get(&page.group_id)
            .map_or(false, |set| set.contains(page.page_idx))
    }

    /// Dirty pages across all groups
    pub fn dirty_count(&self) -> usize {
        self.dirty.lock().values().map(IntSet::len).sum()
    }

    /// Pages held in memory
    pub fn resident_pages(&self) -> usize {
        self.pages.read().len()
    }

    /// Take the current dirty sets as a checkpoint scope
    ///
    /// Pages dirtied afterwards go into a new generation. Callers hold the
    /// checkpoint write lock so the capture lines up with the begin marker.
    pub fn begin_checkpoint(&self) -> CheckpointScope {
        let dirty = std::mem::take(&mut *self.dirty.lock());

        let mut scope = CheckpointScope::new();
        for (group, set) in &dirty {
            scope.add_group(*group, set.iter());
        }

        *self.checkpoint.lock() = Some(CheckpointBuffer {
            captured: dirty,
            saved: HashMap::new(),
        });
        scope
    }

    /// Drop the capture-time images of the finished checkpoint
    pub fn end_checkpoint(&self) {
        if let Some(buffer) = self.checkpoint.lock().take() {
            if !buffer.saved.is_empty() {
                tracing::debug!(pages = buffer.saved.len(), "Released checkpoint page copies");
            }
        }
    }

    /// Capture-time copies held for the running checkpoint
    pub fn saved_pages(&self) -> usize {
        self.checkpoint
            .lock()
            .as_ref()
            .map_or(0, |buffer| buffer.saved.len())
    }

    /// Mark every page of `scope` dirty again after a failed checkpoint
    pub fn mark_dirty(&self, scope: &CheckpointScope) {
        let mut dirty = self.dirty.lock();
        for (group, pages) in scope.groups() {
            dirty.entry(group).or_default().extend(pages.iter().copied());
        }
    }

    /// Shared side of the checkpoint lock, held by page updates
    pub async fn checkpoint_read_lock(&self) -> tokio::sync::RwLockReadGuard<'_, ()> {
        self.checkpoint_lock.read().await
    }

    /// Exclusive side of the checkpoint lock, held while a checkpoint begins
    pub async fn checkpoint_write_lock(&self) -> tokio::sync::RwLockWriteGuard<'_, ()> {
        self.checkpoint_lock.write().await
    }

    /// Check that a physical record fits its page and load the page
    ///
    /// Once this succeeds, `apply` of the same record does no I/O and cannot
    /// fail. Other records pass unchecked.
    pub fn prepare(&self, record: &WalRecord) -> Result<()> {
        let (page, offset, len) = match record.payload() {
            RecordPayload::PageSnapshot(snapshot) => {
                return self.check_image(snapshot.page, snapshot.data.len());
            }
            RecordPayload::PageDelta(delta) => (delta.page, delta.offset as usize, delta.payload.len()),
            RecordPayload::PageErase(erase) => (erase.page, erase.offset as usize, erase.len as usize),
            RecordPayload::InitNewPage(init) => (init.page, 0, 4),
            _ => return Ok(()),
        };

        self.check_range(page, offset, len)?;
        self.load(&mut self.pages.write(), page)
    }

    /// Replay a physical record
    ///
    /// Returns false for records that do not touch pages.
    pub fn apply(&self, record: &WalRecord) -> Result<bool> {
        match record.payload() {
            RecordPayload::PageSnapshot(snapshot) => {
                self.put_page(snapshot.page, &snapshot.data)?;
            }
            RecordPayload::PageDelta(delta) => {
                self.write(delta.page, delta.offset as usize, &delta.payload)?;
            }
            RecordPayload::PageErase(erase) => {
                self.erase(erase.page, erase.offset as usize, erase.len as usize)?;
            }
            RecordPayload::InitNewPage(init) => {
                self.init_page(init.page, init.io_type, init.io_version)?;
            }
            _ => return Ok(false),
        }
        Ok(true)
    }

    fn check_range(&self, page: FullPageId, offset: usize, len: usize) -> Result<()> {
        if offset.checked_add(len).map_or(true, |end| end > self.page_size) {
            return Err(Error::PageStore(format!(
                "range {}+{} is outside page {} of {} bytes",
                offset, len, page, self.page_size
            )));
        }
        Ok(())
    }

    fn check_image(&self, page: FullPageId, len: usize) -> Result<()> {
        if len > self.page_size {
            return Err(Error::PageStore(format!(
                "image of page {} has {} bytes, page size is {}",
                page, len, self.page_size
            )));
        }
        Ok(())
    }

    fn load(&self, pages: &mut HashMap<FullPageId, Box<[u8]>>, page: FullPageId) -> Result<()> {
        if !pages.contains_key(&page) {
            let mut buf = vec![0u8; self.page_size].into_boxed_slice();
            self.store.read_page(page, &mut buf)?;
            pages.insert(page, buf);
        }
        Ok(())
    }

    fn modify(&self, page: FullPageId, f: impl FnOnce(&mut [u8])) -> Result<()> {
        {
            let mut pages = self.pages.write();
            self.load(&mut pages, page)?;
            if let Some(buf) = pages.get_mut(&page) {
                self.save_capture_image(page, &buf[..]);
                f(&mut buf[..]);
            }
        }
        self.mark_page_dirty(page);
        Ok(())
    }

    /// Keep the capture-time image of a page about to change
    ///
    /// Called with the page map locked, so a checkpoint write of the same page
    /// sees either the saved copy or the untouched live image.
    fn save_capture_image(&self, page: FullPageId, current: &[u8]) {
        let mut checkpoint = self.checkpoint.lock();
        if let Some(buffer) = checkpoint.as_mut() {
            if buffer.holds(page) && !buffer.saved.contains_key(&page) {
                buffer.saved.insert(page, Box::from(current));
            }
        }
    }

    fn mark_page_dirty(&self, page: FullPageId) {
        self.dirty
            .lock()
            .entry(page.group_id)
            .or_default()
            .insert(page.page_idx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::FilePageStore;
    use tempfile::TempDir;

    fn memory(dir: &TempDir) -> PageMemory {
        let store = FilePageStore::open(dir.path(), 32).unwrap();
        PageMemory::new(Arc::new(store))
    }

    #[test]
    fn test_write_marks_dirty() {
        let dir = TempDir::new().unwrap();
        let mem = memory(&dir);
        let page = FullPageId::new(1, 5);

        mem.write(page, 4, b"abcd").unwrap();
        assert!(mem.is_dirty(page));
        assert_eq!(mem.dirty_count(), 1);

        let data = mem.read_page(page).unwrap().unwrap();
        assert_eq!(&data[4..8], b"abcd");
        assert_eq!(data.len(), 32);
    }

    #[test]
    fn test_out_of_page_write_is_rejected() {
        let dir = TempDir::new().unwrap();
        let mem = memory(&dir);
        let err = mem.write(FullPageId::new(0, 0), 30, b"xyz").unwrap_err();
        assert!(matches!(err, Error::PageStore(_)));
        assert_eq!(mem.dirty_count(), 0);
    }

    #[test]
    fn test_begin_checkpoint_swaps_generations() {
        let dir = TempDir::new().unwrap();
        let mem = memory(&dir);
        for i in 0..10 {
            mem.write(FullPageId::new(i % 2, i as u32), 0, &[1]).unwrap();
        }

        let scope = mem.begin_checkpoint();
        assert_eq!(scope.total_pages(), 10);
        assert_eq!(mem.dirty_count(), 0);

        mem.write(FullPageId::new(0, 100), 0, &[2]).unwrap();
        assert_eq!(mem.dirty_count(), 1);

        mem.mark_dirty(&scope);
        assert_eq!(mem.dirty_count(), 11);
    }

    #[test]
    fn test_pages_load_from_store_on_first_touch() {
        let dir = TempDir::new().unwrap();
        let mem = memory(&dir);
        let page = FullPageId::new(3, 0);
        mem.store().write_page(page, &[7; 32]).unwrap();

        mem.write(page, 0, &[1, 2]).unwrap();
        let data = mem.read_page(page).unwrap().unwrap();
        assert_eq!(&data[..4], &[1, 2, 7, 7]);
    }

    #[test]
    fn test_checkpoint_page_persists_image() {
        let dir = TempDir::new().unwrap();
        let mem = memory(&dir);
        let page = FullPageId::new(0, 2);

        assert!(!mem.checkpoint_page(page).unwrap());
        mem.put_page(page, &[5; 16]).unwrap();
        assert!(mem.checkpoint_page(page).unwrap());

        let mut buf = vec![0u8; 32];
        assert!(mem.store().read_page(page, &mut buf).unwrap());
        assert_eq!(&buf[..16], &[5; 16]);
        assert_eq!(&buf[16..], &[0; 16]);
    }

    #[test]
    fn test_checkpoint_writes_capture_time_image() {
        let dir = TempDir::new().unwrap();
        let mem = memory(&dir);
        let captured = FullPageId::new(1, 0);
        let untouched = FullPageId::new(1, 1);
        let replaced = FullPageId::new(1, 2);
        mem.write(captured, 0, b"OLD").unwrap();
        mem.write(untouched, 0, b"ONE").unwrap();
        mem.write(replaced, 0, b"TWO").unwrap();

        let scope = mem.begin_checkpoint();
        assert_eq!(scope.total_pages(), 3);

        // Changes after the capture belong to the next checkpoint
        mem.write(captured, 0, b"NEW").unwrap();
        mem.put_page(replaced, &[9; 32]).unwrap();
        mem.write(FullPageId::new(1, 3), 0, b"LATE").unwrap();
        assert_eq!(mem.saved_pages(), 2);

        for page in scope.iter() {
            assert!(mem.checkpoint_page(page).unwrap());
        }
        assert_eq!(mem.saved_pages(), 0);

        let mut buf = vec![0u8; 32];
        mem.store().read_page(captured, &mut buf).unwrap();
        assert_eq!(&buf[..3], b"OLD");
        mem.store().read_page(untouched, &mut buf).unwrap();
        assert_eq!(&buf[..3], b"ONE");
        mem.store().read_page(replaced, &mut buf).unwrap();
        assert_eq!(&buf[..3], b"TWO");
        assert!(!mem.store().read_page(FullPageId::new(1, 3), &mut buf).unwrap());

        // Live images keep the newer bytes and stay dirty
        assert_eq!(&mem.read_page(captured).unwrap().unwrap()[..3], b"NEW");
        assert!(mem.is_dirty(captured));
        assert!(!mem.is_dirty(untouched));

        // A written page is no longer copied on change
        mem.write(captured, 0, b"AGN").unwrap();
        assert_eq!(mem.saved_pages(), 0);
        mem.end_checkpoint();
    }

    #[test]
    fn test_prepare_checks_without_dirtying() {
        let dir = TempDir::new().unwrap();
        let mem = memory(&dir);
        let page = FullPageId::new(2, 4);
        mem.store().write_page(page, &[3; 32]).unwrap();

        assert!(mem.prepare(&WalRecord::page_delta(page, 30, vec![1, 2, 3])).is_err());
        assert!(mem.prepare(&WalRecord::page_snapshot(page, vec![0; 33])).is_err());
        assert_eq!(mem.resident_pages(), 0);

        mem.prepare(&WalRecord::page_delta(page, 0, vec![1])).unwrap();
        assert_eq!(mem.resident_pages(), 1);
        assert_eq!(mem.dirty_count(), 0);
        assert_eq!(mem.read_page(page).unwrap().unwrap(), vec![3; 32]);
    }

    #[test]
    fn test_apply_physical_records() {
        let dir = TempDir::new().unwrap();
        let mem = memory(&dir);
        let page = FullPageId::new(4, 1);

        let init = WalRecord::from_payload(RecordPayload::InitNewPage(crate::wal::record::InitNewPage {
            page,
            io_type: 0x0102,
            io_version: 3,
        }));
        assert!(mem.apply(&init).unwrap());
        assert!(mem.apply(&WalRecord::page_delta(page, 8, vec![9, 9, 9])).unwrap());

        let erase = WalRecord::from_payload(RecordPayload::PageErase(crate::wal::record::PageErase {
            page,
            offset: 9,
            len: 1,
        }));
        assert!(mem.apply(&erase).unwrap());
        assert!(!mem.apply(&WalRecord::memory_recovery()).unwrap());

        let data = mem.read_page(page).unwrap().unwrap();
        assert_eq!(&data[..4], &[1, 2, 0, 3]);
        assert_eq!(&data[8..11], &[9, 0, 9]);
    }

    #[tokio::test]
    async fn test_write_lock_excludes_readers() {
        let dir = TempDir::new().unwrap();
        let mem = memory(&dir);

        let write = mem.checkpoint_write_lock().await;
        assert!(mem.checkpoint_lock.try_read().is_err());
        drop(write);
        let _read = mem.checkpoint_read_lock().await;
        assert!(mem.checkpoint_lock.try_write().is_err());
    }
}
