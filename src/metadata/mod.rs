//! Control-plane contract.
//!
//! Store topology and schemas come from a metadata service reachable
//! through [`MetadataClient`]. Lookups are assumed cheap enough to repeat;
//! the consumer layers its own caches on top where the values are immutable
//! (schemas never change once returned, store topology does).

use thiserror::Error;

/// How the values of one store version are compressed on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionMode {
    None,
    Gzip,
    /// Zstandard with a per-version dictionary published in the version
    /// topic's start-of-push control message.
    ZstdWithDict,
}

/// One materialized version of a store.
#[derive(Debug, Clone)]
pub struct VersionInfo {
    pub version: i32,
    pub compression: CompressionMode,
}

/// Store topology as reported by the control plane.
#[derive(Debug, Clone)]
pub struct StoreInfo {
    pub name: String,
    /// The version currently serving reads.
    pub current_version: i32,
    pub partition_count: i32,
    pub versions: Vec<VersionInfo>,
}

impl StoreInfo {
    /// Look up a version by number.
    pub fn version(&self, version: i32) -> Option<&VersionInfo> {
        self.versions.iter().find(|v| v.version == version)
    }
}

/// An immutable, registered schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schema {
    pub id: i32,
    /// Schema text in the registry's definition language.
    pub definition: String,
}

impl Schema {
    pub fn new(id: i32, definition: impl Into<String>) -> Self {
        Self {
            id,
            definition: definition.into(),
        }
    }
}

/// Errors surfaced by a metadata client.
#[derive(Error, Debug)]
pub enum MetadataError {
    #[error("Store not found: {store}")]
    StoreNotFound { store: String },

    #[error("Schema {id} not found for store {store}")]
    SchemaNotFound { store: String, id: i32 },

    #[error("Version {version} not found for store {store}")]
    VersionNotFound { store: String, version: i32 },

    #[error("Metadata service unreachable: {message}")]
    Unreachable { message: String },
}

impl MetadataError {
    pub fn store_not_found(store: impl Into<String>) -> Self {
        MetadataError::StoreNotFound {
            store: store.into(),
        }
    }

    pub fn schema_not_found(store: impl Into<String>, id: i32) -> Self {
        MetadataError::SchemaNotFound {
            store: store.into(),
            id,
        }
    }

    pub fn version_not_found(store: impl Into<String>, version: i32) -> Self {
        MetadataError::VersionNotFound {
            store: store.into(),
            version,
        }
    }

    pub fn unreachable(message: impl Into<String>) -> Self {
        MetadataError::Unreachable {
            message: message.into(),
        }
    }
}

/// Control-plane client.
///
/// Implementations are shared across threads; every method takes `&self`.
pub trait MetadataClient: Send + Sync {
    fn get_store(&self, store: &str) -> Result<StoreInfo, MetadataError>;

    /// The key schema, fixed for the store's lifetime.
    fn key_schema(&self, store: &str) -> Result<Schema, MetadataError>;

    fn value_schema(&self, store: &str, id: i32) -> Result<Schema, MetadataError>;

    fn latest_value_schema_id(&self, store: &str) -> Result<i32, MetadataError>;

    /// Schema for the replication-metadata payload at the given version.
    fn replication_metadata_schema(
        &self,
        store: &str,
        rmd_version_id: i32,
    ) -> Result<Schema, MetadataError>;
}
