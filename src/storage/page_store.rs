//! Durable page files
//!
//! One file per cache group under the pages directory; page `i` of a group
//! lives at byte offset `i * page_size`.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::checkpoint::FullPageId;
use crate::error::{Error, Result};

/// Destination of checkpointed pages
pub trait PageStore: Send + Sync {
    /// Size of every page in bytes
    fn page_size(&self) -> usize;

    /// Persist one full page image
    fn write_page(&self, page: FullPageId, data: &[u8]) -> Result<()>;

    /// Read a page into `buf`, returning false if it was never written
    fn read_page(&self, page: FullPageId, buf: &mut [u8]) -> Result<bool>;

    /// Make every write so far durable
    fn sync(&self) -> Result<()>;
}

/// Page store backed by one file per group
pub struct FilePageStore {
    dir: PathBuf,
    page_size: usize,
    files: Mutex<HashMap<i32, Arc<Mutex<File>>>>,
}

impl FilePageStore {
    /// Open (or create) a page directory
    pub fn open(dir: impl Into<PathBuf>, page_size: usize) -> Result<Self> {
        let dir = dir.into();
        if page_size == 0 {
            return Err(Error::Config("page_size must be greater than 0".into()));
        }
        std::fs::create_dir_all(&dir)?;

        tracing::debug!(dir = %dir.display(), page_size = page_size, "Opened page store");

        Ok(Self {
            dir,
            page_size,
            files: Mutex::new(HashMap::new()),
        })
    }

    /// File holding the pages of a group
    pub fn group_path(&self, group_id: i32) -> PathBuf {
        self.dir.join(format!("group_{:08x}.pages", group_id as u32))
    }

    /// Groups with a page file on disk
    pub fn groups(&self) -> Result<Vec<i32>> {
        let mut groups = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            if let Some(group) = parse_group(&entry?.path()) {
                groups.push(group);
            }
        }
        groups.sort_unstable();
        Ok(groups)
    }

    /// Pages currently allocated in a group's file
    pub fn page_count(&self, group_id: i32) -> Result<u64> {
        match std::fs::metadata(self.group_path(group_id)) {
            Ok(meta) => Ok(meta.len() / self.page_size as u64),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    fn file(&self, group_id: i32) -> Result<Arc<Mutex<File>>> {
        let mut files = self.files.lock();
        if let Some(file) = files.get(&group_id) {
            return Ok(Arc::clone(file));
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(self.group_path(group_id))?;
        let file = Arc::new(Mutex::new(file));
        files.insert(group_id, Arc::clone(&file));
        Ok(file)
    }

    fn offset(&self, page: FullPageId) -> u64 {
        page.page_idx as u64 * self.page_size as u64
    }
}

impl PageStore for FilePageStore {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn write_page(&self, page: FullPageId, data: &[u8]) -> Result<()> {
        if data.len() != self.page_size {
            return Err(Error::PageStore(format!(
                "page {} has {} bytes, expected {}",
                page,
                data.len(),
                self.page_size
            )));
        }

        let file = self.file(page.group_id)?;
        let mut file = file.lock();
        file.seek(SeekFrom::Start(self.offset(page)))?;
        file.write_all(data)?;
        Ok(())
    }

    fn read_page(&self, page: FullPageId, buf: &mut [u8]) -> Result<bool> {
        if buf.len() != self.page_size {
            return Err(Error::PageStore(format!(
                "read buffer for page {} has {} bytes, expected {}",
                page,
                buf.len(),
                self.page_size
            )));
        }

        if !self.group_path(page.group_id).exists() {
            return Ok(false);
        }

        let file = self.file(page.group_id)?;
        let mut file = file.lock();
        let offset = self.offset(page);
        if file.metadata()?.len() < offset + self.page_size as u64 {
            return Ok(false);
        }

        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(buf)?;
        Ok(true)
    }

    fn sync(&self) -> Result<()> {
        let files: Vec<_> = self.files.lock().values().cloned().collect();
        for file in files {
            file.lock().sync_data()?;
        }
        Ok(())
    }
}

fn parse_group(path: &Path) -> Option<i32> {
    if path.extension().map_or(true, |ext| ext != "pages") {
        return None;
    }
    let stem = path.file_stem()?.to_str()?;
    let hex = stem.strip_prefix("group_")?;
    u32::from_str_radix(hex, 16).ok().map(|g| g as i32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_write_and_read_back() {
        let dir = TempDir::new().unwrap();
        let store = FilePageStore::open(dir.path(), 64).unwrap();

        let page = FullPageId::new(-7, 3);
        store.write_page(page, &[0xAB; 64]).unwrap();
        store.sync().unwrap();

        let mut buf = vec![0u8; 64];
        assert!(store.read_page(page, &mut buf).unwrap());
        assert_eq!(buf, vec![0xAB; 64]);

        // Hole before page 3 reads as zeroes, past the end as missing
        assert!(store.read_page(FullPageId::new(-7, 1), &mut buf).unwrap());
        assert_eq!(buf, vec![0u8; 64]);
        assert!(!store.read_page(FullPageId::new(-7, 4), &mut buf).unwrap());
        assert!(!store.read_page(FullPageId::new(1, 0), &mut buf).unwrap());

        assert_eq!(store.page_count(-7).unwrap(), 4);
        assert_eq!(store.groups().unwrap(), vec![-7]);
    }

    #[test]
    fn test_wrong_size_is_rejected() {
        let dir = TempDir::new().unwrap();
        let store = FilePageStore::open(dir.path(), 64).unwrap();
        let err = store.write_page(FullPageId::new(0, 0), &[1; 10]).unwrap_err();
        assert!(matches!(err, Error::PageStore(_)));
    }

    #[test]
    fn test_pages_survive_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let store = FilePageStore::open(dir.path(), 32).unwrap();
            store.write_page(FullPageId::new(2, 0), &[9; 32]).unwrap();
            store.sync().unwrap();
        }

        let store = FilePageStore::open(dir.path(), 32).unwrap();
        let mut buf = vec![0u8; 32];
        assert!(store.read_page(FullPageId::new(2, 0), &mut buf).unwrap());
        assert_eq!(buf, vec![9; 32]);
    }
}
