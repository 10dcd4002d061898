//! Protocol constants for the changelog consumer.
//!
//! Reserved schema ids and topic-name components shared between the store's
//! writers and every consumer. These must match the ingestion side exactly.

/// Schema id carried by a chunk fragment of an oversized record.
pub const CHUNK_SCHEMA_ID: i32 = -10;

/// Schema id carried by the manifest terminating a chunked record.
pub const CHUNK_MANIFEST_SCHEMA_ID: i32 = -20;

/// Separator between a store name and its version number in topic names.
pub const VERSION_TOPIC_SEPARATOR: &str = "_v";

/// Suffix appended to a version topic name to form its change-capture
/// topic.
pub const CHANGE_CAPTURE_TOPIC_SUFFIX: &str = "_cc";

/// How long the dictionary fetch may scan a version topic before giving up
/// (milliseconds).
pub const DEFAULT_DICTIONARY_FETCH_TIMEOUT_MS: u64 = 30_000;

/// Poll granularity used while scanning for the start-of-push dictionary
/// (milliseconds).
pub const DICTIONARY_POLL_INTERVAL_MS: u64 = 250;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_ids_are_reserved_negatives() {
        // Positive ids belong to registered value schemas; the chunking
        // layer must never collide with them.
        assert!(CHUNK_SCHEMA_ID < 0);
        assert!(CHUNK_MANIFEST_SCHEMA_ID < 0);
        assert_ne!(CHUNK_SCHEMA_ID, CHUNK_MANIFEST_SCHEMA_ID);
    }

    #[test]
    fn test_change_capture_suffix_composes() {
        let topic = format!("orders{}3{}", VERSION_TOPIC_SEPARATOR, CHANGE_CAPTURE_TOPIC_SUFFIX);
        assert_eq!(topic, "orders_v3_cc");
    }
}
