//! Changelog consumer error types.
//!
//! One enum covers the whole consumer surface. Variants are grouped by
//! origin: control-plane lookups, broker operations, per-partition decode
//! pipeline, and caller mistakes. Broker and metadata failures keep their
//! source error; decode failures carry enough position context to reseek.

use thiserror::Error;

use crate::metadata::MetadataError;
use crate::pubsub::PubSubError;

/// Errors produced by the changelog consumer.
#[derive(Error, Debug)]
pub enum ChangelogError {
    // ===== Control plane =====
    /// A store or schema lookup failed. Fatal to the originating call.
    #[error("Metadata lookup failed for store {store}: {source}")]
    Metadata {
        store: String,
        #[source]
        source: MetadataError,
    },

    // ===== Broker =====
    /// The broker adapter failed; the caller decides whether to retry.
    #[error("Broker operation failed: {0}")]
    Broker(#[from] PubSubError),

    // ===== Decode pipeline =====
    /// The compression dictionary for a version topic could not be read.
    /// The affected partition cannot be consumed.
    #[error("Cannot read compression dictionary from {topic}: {message}")]
    DictionaryUnreadable { topic: String, message: String },

    /// A fixed-layout payload (replication metadata, chunk manifest,
    /// change-record envelope) did not parse.
    #[error("Corrupt payload: {message}")]
    CorruptPayload { message: String },

    /// A value failed to decode against its schema. The partition is left
    /// positioned at the failing offset.
    #[error("Deserialization failed at {topic}-{partition} offset {offset}: {message}")]
    Deserialization {
        topic: String,
        partition: i32,
        offset: i64,
        message: String,
    },

    /// Chunk assembly protocol violation (orphan manifest, duplicate
    /// fragment, size mismatch). Fatal for the partition; reseek to
    /// recover.
    #[error("Chunk assembly failed on partition {partition}: {message}")]
    ChunkProtocol { partition: i32, message: String },

    // ===== Caller errors =====
    /// The partition is not part of the current assignment.
    #[error("Partition {partition} is not subscribed")]
    NotSubscribed { partition: i32 },

    /// Invalid configuration value.
    #[error("Invalid configuration '{field}': {message}")]
    InvalidConfig {
        field: &'static str,
        message: String,
    },

    // ===== Internal =====
    /// Catch-all for worker failures (prefer specific variants).
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ChangelogError {
    pub fn metadata(store: impl Into<String>, source: MetadataError) -> Self {
        ChangelogError::Metadata {
            store: store.into(),
            source,
        }
    }

    pub fn dictionary_unreadable(topic: impl Into<String>, message: impl Into<String>) -> Self {
        ChangelogError::DictionaryUnreadable {
            topic: topic.into(),
            message: message.into(),
        }
    }

    pub fn corrupt_payload(message: impl Into<String>) -> Self {
        ChangelogError::CorruptPayload {
            message: message.into(),
        }
    }

    pub fn deserialization(
        topic: impl Into<String>,
        partition: i32,
        offset: i64,
        message: impl Into<String>,
    ) -> Self {
        ChangelogError::Deserialization {
            topic: topic.into(),
            partition,
            offset,
            message: message.into(),
        }
    }

    pub fn chunk_protocol(partition: i32, message: impl Into<String>) -> Self {
        ChangelogError::ChunkProtocol {
            partition,
            message: message.into(),
        }
    }

    pub fn invalid_config(field: &'static str, message: impl Into<String>) -> Self {
        ChangelogError::InvalidConfig {
            field,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        ChangelogError::Internal(message.into())
    }

    /// True when retrying the same call may succeed (broker transients).
    pub fn is_transient(&self) -> bool {
        matches!(self, ChangelogError::Broker(PubSubError::Broker { .. }))
    }
}

/// Result type alias for changelog operations.
pub type Result<T> = std::result::Result<T, ChangelogError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_includes_context() {
        let err = ChangelogError::deserialization("orders_v3", 2, 41, "bad value bytes");
        let msg = err.to_string();
        assert!(msg.contains("orders_v3-2"));
        assert!(msg.contains("41"));
        assert!(msg.contains("bad value bytes"));
    }

    #[test]
    fn test_broker_error_conversion() {
        let err: ChangelogError = PubSubError::broker("poll failed").into();
        assert!(err.is_transient());
        assert!(err.to_string().contains("poll failed"));
    }

    #[test]
    fn test_non_broker_errors_are_not_transient() {
        let err = ChangelogError::chunk_protocol(0, "orphan manifest");
        assert!(!err.is_transient());

        let err = ChangelogError::NotSubscribed { partition: 5 };
        assert!(!err.is_transient());
        assert!(err.to_string().contains('5'));
    }

    #[test]
    fn test_metadata_error_preserves_source() {
        let err = ChangelogError::metadata("orders", MetadataError::store_not_found("orders"));
        let msg = err.to_string();
        assert!(msg.contains("orders"));
        assert!(std::error::Error::source(&err).is_some());
    }
}
