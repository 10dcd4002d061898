// Changelog consumer implementation.
//
// This module contains the consumer core:
// - Reserved ids and topic-name composition
// - Per-version decompression with lazy dictionary fetch
// - Schema caching and the value-decoder seam
// - Chunked-record reassembly
// - High-watermark tracking for stale-record filtering
// - Subscription/seek management and the poll loop itself
//
// Architecture Overview:
// =====================
//
// The poll loop drives everything. Each broker poll returns per-partition
// batches of typed envelopes; control messages mutate subscription and
// watermark state, data messages run the decode pipeline:
//
//   envelope -> chunk assembler -> decompressor -> deserializer
//            -> stale-record filter -> ChangeMessage
//
// Version boundaries arrive as control messages (end-of-push, version
// swap). Handling one cuts the partition over to its next topic and drops
// the remainder of that partition's batch, so no event from the old topic
// is ever emitted after the cutover.

pub mod chunking;
pub mod compression;
pub mod constants;
pub mod consumer;
pub mod coordinate;
pub mod error;
pub mod event;
pub mod schemas;
pub mod subscription;
pub mod topics;
pub mod watermark;

// Re-export commonly used types for convenience
pub use constants::*;
pub use consumer::{ChangelogConsumer, GenericChangelogConsumer};
pub use coordinate::ChangeCoordinate;
pub use error::{ChangelogError, Result};
pub use event::{ChangeEvent, ChangeMessage, RecordChangeEvent, ValuePayload};
pub use schemas::{GenericDecoder, SpecificDecoder, ValueDecoder};
