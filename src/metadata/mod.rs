//! Type Metadata Module
//!
//! Binary type descriptions with explicit, versioned field changes.

mod schema;
mod store;

pub use schema::{
    field_id, FieldMeta, FieldState, Schema, SchemaVersions, TypeMetadata, VersionInfo,
    METADATA_VERSION, MIN_METADATA_VERSION,
};
pub use store::MetadataStore;
