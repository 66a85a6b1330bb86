//! Versioned type metadata
//!
//! A type carries its base field map and, once fields are added or removed
//! explicitly, a [`SchemaVersions`] history: one immutable field map per
//! version plus the schema derived from it. Readers holding an object
//! written under an older schema ask [`TypeMetadata::field_states`] which
//! fields they may still read.
//!
//! Versioned schemas are keyed by `schema_id ^ version`. This is a cheap
//! tag, not a hash: different (schema, version) pairs can collide.

use byteorder::{BigEndian, WriteBytesExt};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{Error, Result};
use crate::wal::codec::{write_len, write_string, BodyReader};

/// Current metadata encoding version
pub const METADATA_VERSION: u8 = 2;

/// Oldest encoding version still readable
pub const MIN_METADATA_VERSION: u8 = 1;

const ABSENT: i32 = -1;
const FNV1_OFFSET_BASIS: u32 = 0x811C_9DC5;
const FNV1_PRIME: u32 = 0x0100_0193;

/// Identifier of a field name: hash code of its lowercase form
pub fn field_id(name: &str) -> i32 {
    name.to_lowercase()
        .encode_utf16()
        .fold(0i32, |h, c| h.wrapping_mul(31).wrapping_add(c as i32))
}

/// Type and identifier of one field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldMeta {
    pub type_id: i32,
    pub field_id: i32,
}

impl FieldMeta {
    /// Field metadata with the id derived from the field name
    pub fn named(name: &str, type_id: i32) -> Self {
        Self {
            type_id,
            field_id: field_id(name),
        }
    }
}

/// Ordered set of field ids and the id derived from them
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    pub schema_id: i32,
    pub field_ids: Vec<i32>,
}

impl Schema {
    pub fn new(field_ids: Vec<i32>) -> Self {
        let mut id = FNV1_OFFSET_BASIS;
        for field in &field_ids {
            for byte in field.to_le_bytes() {
                id ^= byte as u32;
                id = id.wrapping_mul(FNV1_PRIME);
            }
        }
        Self {
            schema_id: id as i32,
            field_ids,
        }
    }

    /// Schema of a field map, in field name order
    pub fn of_fields(fields: &BTreeMap<String, FieldMeta>) -> Self {
        Self::new(fields.values().map(|f| f.field_id).collect())
    }

    fn write(&self, out: &mut Vec<u8>) -> Result<()> {
        out.write_i32::<BigEndian>(self.schema_id)?;
        write_len(out, self.field_ids.len())?;
        for id in &self.field_ids {
            out.write_i32::<BigEndian>(*id)?;
        }
        Ok(())
    }

    fn read(r: &mut BodyReader<'_>) -> Result<Self> {
        let schema_id = r.i32()?;
        let count = r.len()?.unwrap_or(0);
        let mut field_ids = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            field_ids.push(r.i32()?);
        }
        Ok(Self {
            schema_id,
            field_ids,
        })
    }
}

/// Whether a field written under an older schema can still be read
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldState {
    Ok,
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionInfo {
    pub version: i32,
    pub schema: Schema,
}

/// Field map history of an explicitly versioned type
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaVersions {
    version: i32,
    version_schemas: BTreeMap<i32, VersionInfo>,
    field_maps: BTreeMap<i32, BTreeMap<String, FieldMeta>>,
}

impl SchemaVersions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current version, 0 before the first change
    pub fn version(&self) -> i32 {
        self.version
    }

    /// Record `fields` as the next version, returning its versioned schema id
    pub fn add_version(&mut self, fields: BTreeMap<String, FieldMeta>) -> i32 {
        self.version += 1;
        let schema = Schema::of_fields(&fields);
        let key = schema.schema_id ^ self.version;

        self.field_maps.insert(self.version, fields);
        self.version_schemas.insert(
            key,
            VersionInfo {
                version: self.version,
                schema,
            },
        );
        key
    }

    /// Versioned id of a wire schema id: identity at version 0
    pub fn map_schema_version(&self, schema_id: i32) -> i32 {
        if self.version == 0 {
            schema_id
        } else {
            self.version ^ schema_id
        }
    }

    /// Versioned schema id of `version`, if it was recorded
    pub fn version_schema_id(&self, version: i32) -> Option<i32> {
        self.version_schemas
            .iter()
            .find(|(_, info)| info.version == version)
            .map(|(key, _)| *key)
    }

    /// Version a versioned schema id belongs to; unknown ids map to 0
    pub fn version_of(&self, schema_id: i32) -> i32 {
        self.version_schemas.get(&schema_id).map_or(0, |info| info.version)
    }

    /// Field map at `version`; version 0 is the type's base map
    pub fn fields_at<'a>(
        &'a self,
        version: i32,
        base: &'a BTreeMap<String, FieldMeta>,
    ) -> Option<&'a BTreeMap<String, FieldMeta>> {
        if version == 0 {
            Some(base)
        } else {
            self.field_maps.get(&version)
        }
    }

    /// Field states for an object written under `schema_id`
    ///
    /// Fields present at the target version are `Ok`. Fields that appear at
    /// a later version but not at the target are `Deleted`.
    pub fn field_states(
        &self,
        schema_id: i32,
        base: &BTreeMap<String, FieldMeta>,
    ) -> BTreeMap<String, FieldState> {
        let target = self.version_of(schema_id);
        let target_fields = self.fields_at(target, base);

        let mut states = BTreeMap::new();
        for name in target_fields.into_iter().flat_map(|f| f.keys()) {
            states.insert(name.clone(), FieldState::Ok);
        }

        for version in (target + 1..=self.version).rev() {
            let Some(fields) = self.fields_at(version, base) else {
                continue;
            };
            for name in fields.keys() {
                states.entry(name.clone()).or_insert(FieldState::Deleted);
            }
        }

        states
    }

    fn write(&self, out: &mut Vec<u8>) -> Result<()> {
        out.write_i32::<BigEndian>(self.version)?;

        write_len(out, self.version_schemas.len())?;
        for (key, info) in &self.version_schemas {
            out.write_i32::<BigEndian>(*key)?;
            out.write_i32::<BigEndian>(info.version)?;
            info.schema.write(out)?;
        }

        write_len(out, self.field_maps.len())?;
        for (version, fields) in &self.field_maps {
            out.write_i32::<BigEndian>(*version)?;
            write_fields(out, Some(fields))?;
        }
        Ok(())
    }

    fn read(r: &mut BodyReader<'_>) -> Result<Self> {
        let version = r.i32()?;

        let mut version_schemas = BTreeMap::new();
        for _ in 0..r.len()?.unwrap_or(0) {
            let key = r.i32()?;
            let version = r.i32()?;
            let schema = Schema::read(r)?;
            version_schemas.insert(key, VersionInfo { version, schema });
        }

        let mut field_maps = BTreeMap::new();
        for _ in 0..r.len()?.unwrap_or(0) {
            let version = r.i32()?;
            field_maps.insert(version, read_fields(r)?.unwrap_or_default());
        }

        Ok(Self {
            version,
            version_schemas,
            field_maps,
        })
    }
}

/// Metadata of one binary type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeMetadata {
    pub type_id: i32,
    pub type_name: String,
    /// Base field map, `None` when unknown
    pub fields: Option<BTreeMap<String, FieldMeta>>,
    pub affinity_key: Option<String>,
    pub schemas: Option<Vec<Schema>>,
    pub is_enum: bool,
    pub enum_map: Option<BTreeMap<String, i32>>,
    /// Fields are added and removed through explicit calls
    pub explicit: bool,
    changes: Option<SchemaVersions>,
}

impl TypeMetadata {
    pub fn new(type_id: i32, type_name: impl Into<String>) -> Self {
        Self {
            type_id,
            type_name: type_name.into(),
            fields: None,
            affinity_key: None,
            schemas: None,
            is_enum: false,
            enum_map: None,
            explicit: false,
            changes: None,
        }
    }

    /// Set the base field map and its schema
    pub fn with_fields(mut self, fields: BTreeMap<String, FieldMeta>) -> Self {
        self.schemas = Some(vec![Schema::of_fields(&fields)]);
        self.fields = Some(fields);
        self
    }

    /// Allow explicit field changes
    pub fn explicit(mut self) -> Self {
        self.explicit = true;
        self
    }

    /// Version history, once any explicit change was made
    pub fn changes(&self) -> Option<&SchemaVersions> {
        self.changes.as_ref()
    }

    /// Current schema version, 0 before any explicit change
    pub fn version(&self) -> i32 {
        self.changes.as_ref().map_or(0, SchemaVersions::version)
    }

    /// Field map at the current version
    pub fn current_fields(&self) -> BTreeMap<String, FieldMeta> {
        let base = self.fields.clone().unwrap_or_default();
        match &self.changes {
            Some(changes) => changes
                .fields_at(changes.version(), &base)
                .cloned()
                .unwrap_or_default(),
            None => base,
        }
    }

    /// Add a field as a new version, returning the versioned schema id
    pub fn add_field(&mut self, name: &str, meta: FieldMeta) -> Result<i32> {
        self.require_explicit("add", name)?;

        let mut fields = self.current_fields();
        if fields.insert(name.to_string(), meta).is_some() {
            return Err(Error::SchemaMisuse(format!(
                "Field already exists [type={}, field={}]",
                self.type_name, name
            )));
        }

        let key = self.changes.get_or_insert_with(SchemaVersions::new).add_version(fields);
        tracing::debug!(type_name = %self.type_name, field = name, version = self.version(), "Added field");
        Ok(key)
    }

    /// Remove a field as a new version, returning the versioned schema id
    pub fn remove_field(&mut self, name: &str) -> Result<i32> {
        self.require_explicit("remove", name)?;

        let mut fields = self.current_fields();
        if fields.remove(name).is_none() {
            return Err(Error::SchemaMisuse(format!(
                "Cannot find field to remove [type={}, field={}]",
                self.type_name, name
            )));
        }

        let key = self.changes.get_or_insert_with(SchemaVersions::new).add_version(fields);
        tracing::debug!(type_name = %self.type_name, field = name, version = self.version(), "Removed field");
        Ok(key)
    }

    fn require_explicit(&self, action: &str, name: &str) -> Result<()> {
        if self.explicit {
            return Ok(());
        }
        Err(Error::SchemaMisuse(format!(
            "Cannot {} field {} of type {} without explicit schema changes",
            action, name, self.type_name
        )))
    }

    /// Versioned id of a wire schema id
    pub fn map_schema_version(&self, schema_id: i32) -> i32 {
        match &self.changes {
            Some(changes) => changes.map_schema_version(schema_id),
            None => schema_id,
        }
    }

    /// Versioned schema id recorded for `version`
    ///
    /// Version 0 is the base schema, which has no versioned entry.
    pub fn version_schema_id(&self, version: i32) -> Option<i32> {
        if version == 0 {
            return self.fields.as_ref().map(|f| Schema::of_fields(f).schema_id);
        }
        self.changes.as_ref()?.version_schema_id(version)
    }

    /// Field states for an object written under a versioned schema id
    pub fn field_states(&self, schema_id: i32) -> BTreeMap<String, FieldState> {
        let base = self.fields.clone().unwrap_or_default();
        match &self.changes {
            Some(changes) => changes.field_states(schema_id, &base),
            None => base.into_keys().map(|name| (name, FieldState::Ok)).collect(),
        }
    }

    /// Serialize at the current encoding version
    pub fn encode(&self) -> Result<Vec<u8>> {
        self.encode_version(METADATA_VERSION)
    }

    /// Serialize at an explicit encoding version
    ///
    /// Version 1 has no explicit flag and no version history.
    pub fn encode_version(&self, version: u8) -> Result<Vec<u8>> {
        if !(MIN_METADATA_VERSION..=METADATA_VERSION).contains(&version) {
            return Err(Error::Codec(format!("Unsupported metadata version {}", version)));
        }

        let mut out = Vec::with_capacity(64);
        out.write_u8(version)?;
        out.write_i32::<BigEndian>(self.type_id)?;
        write_string(&mut out, Some(&self.type_name))?;
        write_fields(&mut out, self.fields.as_ref())?;
        write_string(&mut out, self.affinity_key.as_deref())?;

        match &self.schemas {
            Some(schemas) => {
                write_len(&mut out, schemas.len())?;
                for schema in schemas {
                    schema.write(&mut out)?;
                }
            }
            None => out.write_i32::<BigEndian>(ABSENT)?,
        }

        out.write_u8(self.is_enum as u8)?;
        match &self.enum_map {
            Some(map) => {
                write_len(&mut out, map.len())?;
                for (name, ordinal) in map {
                    write_string(&mut out, Some(name))?;
                    out.write_i32::<BigEndian>(*ordinal)?;
                }
            }
            None => out.write_i32::<BigEndian>(ABSENT)?,
        }

        if version >= 2 {
            out.write_u8(self.explicit as u8)?;
            if self.explicit {
                out.write_u8(self.changes.is_some() as u8)?;
                if let Some(changes) = &self.changes {
                    changes.write(&mut out)?;
                }
            }
        }

        Ok(out)
    }

    /// Deserialize any supported encoding version
    ///
    /// Bytes after the fields known to this build are ignored.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut r = BodyReader::new(buf);
        let version = r.u8()?;
        if version < MIN_METADATA_VERSION {
            return Err(Error::Codec(format!("Unsupported metadata version {}", version)));
        }

        let type_id = r.i32()?;
        let type_name = r
            .string()?
            .ok_or_else(|| Error::Codec("Type metadata without a type name".into()))?;
        let fields = read_fields(&mut r)?;
        let affinity_key = r.string()?;

        let schemas = match r.len()? {
            Some(count) => {
                let mut schemas = Vec::with_capacity(count.min(1024));
                for _ in 0..count {
                    schemas.push(Schema::read(&mut r)?);
                }
                Some(schemas)
            }
            None => None,
        };

        let is_enum = r.bool()?;
        let enum_map = match r.len()? {
            Some(count) => {
                let mut map = BTreeMap::new();
                for _ in 0..count {
                    let name = r
                        .string()?
                        .ok_or_else(|| Error::Codec("Absent enum constant name".into()))?;
                    map.insert(name, r.i32()?);
                }
                Some(map)
            }
            None => None,
        };

        let mut explicit = false;
        let mut changes = None;
        if version >= 2 {
            explicit = r.bool()?;
            if explicit && r.bool()? {
                changes = Some(SchemaVersions::read(&mut r)?);
            }
        }

        Ok(Self {
            type_id,
            type_name,
            fields,
            affinity_key,
            schemas,
            is_enum,
            enum_map,
            explicit,
            changes,
        })
    }
}

fn write_fields(out: &mut Vec<u8>, fields: Option<&BTreeMap<String, FieldMeta>>) -> Result<()> {
    let Some(fields) = fields else {
        out.write_i32::<BigEndian>(ABSENT)?;
        return Ok(());
    };
    write_len(out, fields.len())?;
    for (name, meta) in fields {
        write_string(out, Some(name))?;
        out.write_i32::<BigEndian>(meta.type_id)?;
        out.write_i32::<BigEndian>(meta.field_id)?;
    }
    Ok(())
}

fn read_fields(r: &mut BodyReader<'_>) -> Result<Option<BTreeMap<String, FieldMeta>>> {
    let Some(count) = r.len()? else {
        return Ok(None);
    };
    let mut fields = BTreeMap::new();
    for _ in 0..count {
        let name = r
            .string()?
            .ok_or_else(|| Error::Codec("Absent field name".into()))?;
        let type_id = r.i32()?;
        let field_id = r.i32()?;
        fields.insert(name, FieldMeta { type_id, field_id });
    }
    Ok(Some(fields))
}
