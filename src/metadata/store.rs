//! Type metadata persistence
//!
//! One file per type under the metadata directory, named after the type id.
//! Files are written to a temporary name, synced and renamed into place so a
//! crash never leaves a half-written type behind.

use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use super::TypeMetadata;
use crate::error::{Error, Result};

const EXTENSION: &str = "bin";

/// Registered types, cached in memory and mirrored on disk
pub struct MetadataStore {
    dir: PathBuf,
    types: RwLock<BTreeMap<i32, TypeMetadata>>,
}

impl MetadataStore {
    /// Open the metadata directory and load every type in it
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;

        let store = Self {
            dir,
            types: RwLock::new(BTreeMap::new()),
        };

        let loaded = store.load_all()?;
        tracing::debug!(types = loaded.len(), dir = %store.dir.display(), "Loaded type metadata");
        *store.types.write() = loaded.into_iter().map(|meta| (meta.type_id, meta)).collect();

        Ok(store)
    }

    /// File holding a type
    pub fn type_path(&self, type_id: i32) -> PathBuf {
        self.dir.join(format!("{:08x}.{}", type_id as u32, EXTENSION))
    }

    /// Read every type file from disk
    pub fn load_all(&self) -> Result<Vec<TypeMetadata>> {
        let mut types = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().map_or(true, |ext| ext != EXTENSION) {
                continue;
            }
            types.push(read_type(&path)?);
        }
        types.sort_by_key(|meta| meta.type_id);
        Ok(types)
    }

    /// Read one type from disk
    pub fn load(&self, type_id: i32) -> Result<Option<TypeMetadata>> {
        let path = self.type_path(type_id);
        if !path.exists() {
            return Ok(None);
        }
        read_type(&path).map(Some)
    }

    /// Persist a type and cache it
    pub fn save(&self, meta: &TypeMetadata) -> Result<()> {
        let bytes = meta.encode()?;
        let path = self.type_path(meta.type_id);
        let tmp = path.with_extension("tmp");

        {
            let mut file = File::create(&tmp)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp, &path)?;

        self.types.write().insert(meta.type_id, meta.clone());
        tracing::debug!(type_id = meta.type_id, type_name = %meta.type_name, "Saved type metadata");
        Ok(())
    }

    /// Cached type
    pub fn get(&self, type_id: i32) -> Option<TypeMetadata> {
        self.types.read().get(&type_id).cloned()
    }

    /// Apply `f` to a cached type and persist the result
    ///
    /// Nothing is saved if `f` fails.
    pub fn update<F, T>(&self, type_id: i32, f: F) -> Result<T>
    where
        F: FnOnce(&mut TypeMetadata) -> Result<T>,
    {
        let mut meta = self
            .get(type_id)
            .ok_or_else(|| Error::SchemaMisuse(format!("Unknown type id {}", type_id)))?;
        let result = f(&mut meta)?;
        self.save(&meta)?;
        Ok(result)
    }

    /// Delete a type, returning whether it existed
    pub fn remove(&self, type_id: i32) -> Result<bool> {
        let existed = self.types.write().remove(&type_id).is_some();
        match std::fs::remove_file(self.type_path(type_id)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(existed),
            Err(e) => Err(e.into()),
        }
    }

    /// Cached types in type id order
    pub fn types(&self) -> Vec<TypeMetadata> {
        self.types.read().values().cloned().collect()
    }
}

fn read_type(path: &Path) -> Result<TypeMetadata> {
    let bytes = std::fs::read(path)?;
    TypeMetadata::decode(&bytes)
        .map_err(|e| Error::Codec(format!("{}: {}", path.display(), e)))
}
