//! Reassembly of records chunked across multiple log messages.
//!
//! Oversized values are written as a run of fragment messages followed by a
//! manifest under the logical record key. Each fragment travels under its
//! own fragment key; the manifest lists those keys in assembly order.
//!
//! Manifest wire layout:
//!
//! ```text
//! schema_id: i32 (value schema of the assembled record)
//! fragment_count: i32
//! fragments: fragment_count * (key_length i32 + key_bytes)
//! total_size: i32 (byte length of the assembled, still-compressed value)
//! ```

use std::collections::HashMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::compression::Compressor;
use super::constants::{CHUNK_MANIFEST_SCHEMA_ID, CHUNK_SCHEMA_ID};
use super::error::{ChangelogError, Result};

/// The manifest terminating a chunked record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkManifest {
    /// Value schema id of the assembled record.
    pub schema_id: i32,
    /// Fragment keys in assembly order.
    pub fragment_keys: Vec<Bytes>,
    /// Expected byte length of the concatenated fragments.
    pub total_size: i32,
}

impl ChunkManifest {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let mut buf = bytes;
        if buf.remaining() < 8 {
            return Err(ChangelogError::corrupt_payload(
                "chunk manifest too short for header",
            ));
        }
        let schema_id = buf.get_i32();
        let fragment_count = buf.get_i32();
        if fragment_count < 0 {
            return Err(ChangelogError::corrupt_payload(format!(
                "invalid chunk manifest fragment count: {fragment_count}"
            )));
        }

        let mut fragment_keys = Vec::with_capacity(fragment_count as usize);
        for _ in 0..fragment_count {
            if buf.remaining() < 4 {
                return Err(ChangelogError::corrupt_payload(
                    "chunk manifest truncated reading fragment key length",
                ));
            }
            let len = buf.get_i32();
            if len < 0 || buf.remaining() < len as usize {
                return Err(ChangelogError::corrupt_payload(format!(
                    "chunk manifest fragment key length {len} exceeds remaining {}",
                    buf.remaining()
                )));
            }
            fragment_keys.push(Bytes::copy_from_slice(&buf[..len as usize]));
            buf.advance(len as usize);
        }

        if buf.remaining() < 4 {
            return Err(ChangelogError::corrupt_payload(
                "chunk manifest truncated reading total size",
            ));
        }
        let total_size = buf.get_i32();
        if total_size < 0 {
            return Err(ChangelogError::corrupt_payload(format!(
                "invalid chunk manifest total size: {total_size}"
            )));
        }
        Ok(Self {
            schema_id,
            fragment_keys,
            total_size,
        })
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(16 + self.fragment_keys.len() * 16);
        buf.put_i32(self.schema_id);
        buf.put_i32(self.fragment_keys.len() as i32);
        for key in &self.fragment_keys {
            buf.put_i32(key.len() as i32);
            buf.put_slice(key);
        }
        buf.put_i32(self.total_size);
        buf.freeze()
    }
}

/// Buffers chunk fragments per partition until their manifest arrives.
///
/// Buffers are dropped when assembly completes, when the partition cuts
/// over to another topic, or on a full reset.
#[derive(Debug, Default)]
pub struct ChunkAssembler {
    // partition -> fragment key -> fragment bytes
    buffers: HashMap<i32, HashMap<Bytes, Bytes>>,
}

impl ChunkAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one value payload through the assembler.
    ///
    /// Fragments are buffered and return `None`. A manifest assembles its
    /// fragments, decompresses the whole, decodes it with `decode` (which
    /// receives the manifest's schema id), and returns the value.
    /// Non-chunked payloads decompress and decode immediately.
    pub fn buffer_and_assemble<T>(
        &mut self,
        partition: i32,
        key: &[u8],
        schema_id: i32,
        value: &[u8],
        compressor: &Compressor,
        decode: impl FnOnce(i32, &[u8]) -> Result<T>,
    ) -> Result<Option<T>> {
        match schema_id {
            CHUNK_SCHEMA_ID => {
                self.buffer_fragment(partition, key, value)?;
                Ok(None)
            }
            CHUNK_MANIFEST_SCHEMA_ID => {
                let manifest = ChunkManifest::parse(value)?;
                let assembled = self.assemble(partition, &manifest)?;
                let plain = compressor.decompress(&assembled)?;
                decode(manifest.schema_id, &plain).map(Some)
            }
            _ => {
                let plain = compressor.decompress(value)?;
                decode(schema_id, &plain).map(Some)
            }
        }
    }

    fn buffer_fragment(&mut self, partition: i32, key: &[u8], value: &[u8]) -> Result<()> {
        let buffer = self.buffers.entry(partition).or_default();
        let fragment_key = Bytes::copy_from_slice(key);
        if buffer.contains_key(&fragment_key) {
            return Err(ChangelogError::chunk_protocol(
                partition,
                format!("duplicate fragment key ({} bytes)", key.len()),
            ));
        }
        buffer.insert(fragment_key, Bytes::copy_from_slice(value));
        Ok(())
    }

    fn assemble(&mut self, partition: i32, manifest: &ChunkManifest) -> Result<Vec<u8>> {
        let buffer = self.buffers.get_mut(&partition).ok_or_else(|| {
            ChangelogError::chunk_protocol(partition, "manifest with no buffered fragments")
        })?;

        let mut assembled = Vec::with_capacity(manifest.total_size as usize);
        for fragment_key in &manifest.fragment_keys {
            let fragment = buffer.remove(fragment_key).ok_or_else(|| {
                ChangelogError::chunk_protocol(
                    partition,
                    format!("manifest references missing fragment ({} bytes)", fragment_key.len()),
                )
            })?;
            assembled.extend_from_slice(&fragment);
        }
        if buffer.is_empty() {
            self.buffers.remove(&partition);
        }

        if assembled.len() != manifest.total_size as usize {
            return Err(ChangelogError::chunk_protocol(
                partition,
                format!(
                    "assembled {} bytes but manifest claims {}",
                    assembled.len(),
                    manifest.total_size
                ),
            ));
        }
        Ok(assembled)
    }

    /// Drop all buffers for one partition. Called on version cutover.
    pub fn clear_partition(&mut self, partition: i32) {
        self.buffers.remove(&partition);
    }

    /// Drop every buffer.
    pub fn clear(&mut self) {
        self.buffers.clear();
    }

    /// Number of fragments currently buffered for a partition.
    pub fn buffered_fragments(&self, partition: i32) -> usize {
        self.buffers.get(&partition).map_or(0, HashMap::len)
    }
}
