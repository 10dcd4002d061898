//! Change events and the fixed payload layouts that carry them.
//!
//! Two small binary layouts are parsed here with explicit bounds checks:
//!
//! Replication checkpoint vector (the body of a replication-metadata
//! payload):
//!
//! ```text
//! entry_count: i32
//! entries: [i64] (big-endian, one per upstream region)
//! ```
//!
//! `RecordChangeEvent` (the value layout on change-capture topics):
//!
//! ```text
//! before: ValuePayload
//! after: ValuePayload
//! checkpoint_vector: entry_count i32 + [i64]
//!
//! ValuePayload:
//!   schema_id: i32 (<= 0 means absent, no further bytes)
//!   value_length: i32
//!   value_bytes: [u8]
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::coordinate::ChangeCoordinate;
use super::error::{ChangelogError, Result};

/// Before/after images of one key.
///
/// Both sides absent means the key was deleted. `before` is only populated
/// for events read from change-capture topics; batch-push records carry the
/// after image alone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent<V> {
    pub before: Option<V>,
    pub after: Option<V>,
}

impl<V> ChangeEvent<V> {
    pub fn new(before: Option<V>, after: Option<V>) -> Self {
        Self { before, after }
    }

    /// True when the key no longer exists downstream.
    pub fn is_delete(&self) -> bool {
        self.before.is_none() && self.after.is_none()
    }
}

/// One decoded record from the change stream.
#[derive(Debug, Clone)]
pub struct ChangeMessage<K, V> {
    pub key: K,
    pub event: ChangeEvent<V>,
    /// Physical topic the record was read from.
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub timestamp_ms: i64,
    pub payload_size: usize,
}

impl<K, V> ChangeMessage<K, V> {
    /// The resume coordinate of this record.
    pub fn coordinate(&self) -> ChangeCoordinate {
        ChangeCoordinate::new(self.topic.clone(), self.partition, self.offset)
    }
}

/// A schema-tagged value fragment inside a [`RecordChangeEvent`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValuePayload {
    pub schema_id: i32,
    pub value: Bytes,
}

/// The record layout written to change-capture topics.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RecordChangeEvent {
    pub before: Option<ValuePayload>,
    pub after: Option<ValuePayload>,
    /// Per-region replication offsets at the time of the mutation.
    pub replication_checkpoint_vector: Vec<i64>,
}

impl RecordChangeEvent {
    /// Parse from raw value bytes.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let mut buf = bytes;
        let before = parse_value_payload(&mut buf, "before")?;
        let after = parse_value_payload(&mut buf, "after")?;
        let replication_checkpoint_vector = parse_vector_body(&mut buf)?;
        Ok(Self {
            before,
            after,
            replication_checkpoint_vector,
        })
    }

    /// Encode to the wire layout. Used by producers and test fixtures.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(64);
        encode_value_payload(&mut buf, self.before.as_ref());
        encode_value_payload(&mut buf, self.after.as_ref());
        encode_vector_body(&mut buf, &self.replication_checkpoint_vector);
        buf.freeze()
    }
}

fn parse_value_payload(buf: &mut &[u8], field: &str) -> Result<Option<ValuePayload>> {
    if buf.remaining() < 4 {
        return Err(ChangelogError::corrupt_payload(format!(
            "change record truncated reading {field} schema id"
        )));
    }
    let schema_id = buf.get_i32();
    if schema_id <= 0 {
        return Ok(None);
    }
    if buf.remaining() < 4 {
        return Err(ChangelogError::corrupt_payload(format!(
            "change record truncated reading {field} length"
        )));
    }
    let len = buf.get_i32();
    if len < 0 || buf.remaining() < len as usize {
        return Err(ChangelogError::corrupt_payload(format!(
            "change record {field} length {len} exceeds remaining {}",
            buf.remaining()
        )));
    }
    let value = Bytes::copy_from_slice(&buf[..len as usize]);
    buf.advance(len as usize);
    Ok(Some(ValuePayload { schema_id, value }))
}

fn encode_value_payload(buf: &mut BytesMut, payload: Option<&ValuePayload>) {
    match payload {
        Some(p) => {
            buf.put_i32(p.schema_id);
            buf.put_i32(p.value.len() as i32);
            buf.put_slice(&p.value);
        }
        None => buf.put_i32(-1),
    }
}

fn parse_vector_body(buf: &mut &[u8]) -> Result<Vec<i64>> {
    if buf.remaining() < 4 {
        return Err(ChangelogError::corrupt_payload(
            "checkpoint vector truncated reading entry count",
        ));
    }
    let count = buf.get_i32();
    if count < 0 {
        return Err(ChangelogError::corrupt_payload(format!(
            "invalid checkpoint vector entry count: {count}"
        )));
    }
    if buf.remaining() < count as usize * 8 {
        return Err(ChangelogError::corrupt_payload(format!(
            "checkpoint vector claims {count} entries but only {} bytes remain",
            buf.remaining()
        )));
    }
    let mut vector = Vec::with_capacity(count as usize);
    for _ in 0..count {
        vector.push(buf.get_i64());
    }
    Ok(vector)
}

fn encode_vector_body(buf: &mut BytesMut, vector: &[i64]) {
    buf.put_i32(vector.len() as i32);
    for entry in vector {
        buf.put_i64(*entry);
    }
}

/// Parse a replication-metadata payload into its checkpoint vector.
///
/// A non-positive `rmd_version_id` means the record carries no replication
/// metadata; the empty vector is returned.
pub fn parse_checkpoint_vector(rmd_version_id: i32, payload: &[u8]) -> Result<Vec<i64>> {
    if rmd_version_id <= 0 || payload.is_empty() {
        return Ok(Vec::new());
    }
    let mut buf = payload;
    let vector = parse_vector_body(&mut buf)?;
    if buf.remaining() > 0 {
        return Err(ChangelogError::corrupt_payload(format!(
            "{} trailing bytes after checkpoint vector",
            buf.remaining()
        )));
    }
    Ok(vector)
}

/// Encode a checkpoint vector as a replication-metadata payload.
pub fn encode_checkpoint_vector(vector: &[i64]) -> Bytes {
    let mut buf = BytesMut::with_capacity(4 + vector.len() * 8);
    encode_vector_body(&mut buf, vector);
    buf.freeze()
}
