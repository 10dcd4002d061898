//! Pub/sub broker contract.
//!
//! The consumer core never talks to a broker directly; it drives a
//! [`PubSubConsumer`] implementation supplied by the embedding application.
//! Adapters hand back [`Envelope`]s with the message body already decoded
//! from the wire, so everything in this module is plain typed data.
//!
//! # Offset semantics
//!
//! A subscription offset is a *resume point*: subscribing at offset `n`
//! means "deliver records after `n`". The [`EARLIEST_OFFSET`] sentinel
//! means "start from the first available record". Callers that want to
//! re-deliver the record at offset `n` subscribe at `n - 1`.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;

/// Sentinel subscription offset: start from the first available record.
pub const EARLIEST_OFFSET: i64 = -1;

/// A topic name paired with a partition number.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TopicPartition {
    pub topic: String,
    pub partition: i32,
}

impl TopicPartition {
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

impl std::fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.topic, self.partition)
    }
}

/// One log record as delivered by the broker adapter.
#[derive(Debug, Clone)]
pub struct Envelope {
    /// Raw key bytes. For chunk fragments this is the fragment key, not the
    /// logical record key.
    pub key: Bytes,
    /// Decoded message body.
    pub body: MessageBody,
    /// Offset of this record within its topic partition.
    pub offset: i64,
    /// Broker-assigned timestamp, milliseconds since the epoch.
    pub timestamp_ms: i64,
    /// Serialized size of the record on the wire, in bytes.
    pub payload_size: usize,
}

/// The payload union of an [`Envelope`].
#[derive(Debug, Clone)]
pub enum MessageBody {
    Put(Put),
    Delete(Delete),
    Control(ControlMessage),
}

/// An upsert record.
#[derive(Debug, Clone)]
pub struct Put {
    /// Writer schema id of the value, or one of the reserved chunking ids.
    pub schema_id: i32,
    pub value: Bytes,
    /// Replication-metadata schema version; `<= 0` means no metadata.
    pub replication_metadata_version_id: i32,
    pub replication_metadata_payload: Bytes,
}

/// A tombstone record.
#[derive(Debug, Clone)]
pub struct Delete {
    /// Replication-metadata schema version; `<= 0` means no metadata.
    pub replication_metadata_version_id: i32,
    pub replication_metadata_payload: Bytes,
}

/// Control messages interleaved with data on every topic.
#[derive(Debug, Clone)]
pub enum ControlMessage {
    /// Opens a batch push. Carries the compression dictionary when the
    /// version was pushed with dictionary compression.
    StartOfPush {
        compression_dictionary: Option<Bytes>,
    },
    /// Closes a batch push; post-push mutations continue on the
    /// change-capture topic.
    EndOfPush,
    StartOfSegment,
    EndOfSegment,
    /// Promotes a new store version to serving.
    VersionSwap {
        new_serving_version_topic: String,
        /// Per-region replication high watermarks at the swap point.
        local_high_watermarks: Vec<i64>,
    },
}

impl ControlMessage {
    /// Stable name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            ControlMessage::StartOfPush { .. } => "START_OF_PUSH",
            ControlMessage::EndOfPush => "END_OF_PUSH",
            ControlMessage::StartOfSegment => "START_OF_SEGMENT",
            ControlMessage::EndOfSegment => "END_OF_SEGMENT",
            ControlMessage::VersionSwap { .. } => "VERSION_SWAP",
        }
    }
}

/// Errors surfaced by a broker adapter.
#[derive(Error, Debug)]
pub enum PubSubError {
    /// The topic or partition does not exist on the broker.
    #[error("Unknown topic partition: {topic}-{partition}")]
    UnknownTopicPartition { topic: String, partition: i32 },

    /// Transient broker failure; the caller decides whether to retry.
    #[error("Broker error: {message}")]
    Broker { message: String },

    /// The adapter has been closed.
    #[error("Consumer is closed")]
    Closed,
}

impl PubSubError {
    pub fn broker(message: impl Into<String>) -> Self {
        PubSubError::Broker {
            message: message.into(),
        }
    }

    pub fn unknown_topic_partition(topic: impl Into<String>, partition: i32) -> Self {
        PubSubError::UnknownTopicPartition {
            topic: topic.into(),
            partition,
        }
    }
}

/// Broker adapter driven by the changelog consumer.
///
/// All methods are synchronous; the consumer serializes every call on a
/// single lock, so implementations do not need internal synchronization.
pub trait PubSubConsumer: Send {
    /// Subscribe to a topic partition. `from_offset` follows the resume
    /// semantics described in the module docs.
    fn subscribe(&mut self, tp: &TopicPartition, from_offset: i64) -> Result<(), PubSubError>;

    fn unsubscribe(&mut self, tp: &TopicPartition) -> Result<(), PubSubError>;

    fn batch_unsubscribe(&mut self, tps: &HashSet<TopicPartition>) -> Result<(), PubSubError>;

    /// Stop delivering records for the partition without dropping it from
    /// the assignment.
    fn pause(&mut self, tp: &TopicPartition) -> Result<(), PubSubError>;

    fn resume(&mut self, tp: &TopicPartition) -> Result<(), PubSubError>;

    /// Current assignment set.
    fn assignment(&self) -> HashSet<TopicPartition>;

    /// Block up to `timeout` and return the records accumulated per
    /// assigned partition. Paused partitions return nothing.
    fn poll(
        &mut self,
        timeout: Duration,
    ) -> Result<HashMap<TopicPartition, Vec<Envelope>>, PubSubError>;

    /// Offset one past the last record of the partition.
    fn end_offset(&mut self, tp: &TopicPartition) -> Result<i64, PubSubError>;

    /// Offset of the first record at or after `timestamp_ms`, or `None`
    /// when no such record exists.
    fn offset_for_time(
        &mut self,
        tp: &TopicPartition,
        timestamp_ms: i64,
    ) -> Result<Option<i64>, PubSubError>;

    fn close(&mut self);
}
