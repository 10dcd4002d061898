// Test helpers for the changelog consumer integration tests.
//
// Provides an in-memory broker whose topic-partition logs tests script
// directly, plus a static metadata service and envelope builders. The
// broker hands out any number of consumer views over the same logs, which
// also makes it usable as the dictionary-reader factory.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;

use changestream::changelog::compression::PubSubReaderFactory;
use changestream::changelog::event::{encode_checkpoint_vector, RecordChangeEvent, ValuePayload};
use changestream::metadata::{
    CompressionMode, MetadataClient, MetadataError, Schema, StoreInfo, VersionInfo,
};
use changestream::pubsub::{
    ControlMessage, Delete, Envelope, MessageBody, PubSubConsumer, PubSubError, TopicPartition,
    EARLIEST_OFFSET,
};

// ===== In-memory broker =====

#[derive(Default)]
struct BrokerState {
    logs: HashMap<TopicPartition, Vec<Envelope>>,
}

/// Shared in-memory log store. Clone handles freely; all views observe the
/// same logs.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a record and return its offset.
    pub fn push(&self, topic: &str, partition: i32, key: Bytes, body: MessageBody) -> i64 {
        self.push_at(topic, partition, key, body, 0)
    }

    /// Append a record with an explicit timestamp.
    pub fn push_at(
        &self,
        topic: &str,
        partition: i32,
        key: Bytes,
        body: MessageBody,
        timestamp_ms: i64,
    ) -> i64 {
        let mut state = self.state.lock().unwrap();
        let log = state
            .logs
            .entry(TopicPartition::new(topic, partition))
            .or_default();
        let offset = log.len() as i64;
        let payload_size = key.len() + body_size(&body);
        log.push(Envelope {
            key,
            body,
            offset,
            timestamp_ms,
            payload_size,
        });
        offset
    }

    /// A fresh consumer view with its own cursors.
    pub fn consumer(&self) -> InMemoryPubSub {
        InMemoryPubSub {
            state: Arc::clone(&self.state),
            cursors: HashMap::new(),
            paused: HashSet::new(),
        }
    }

    /// Factory handing out short-lived readers over the same logs.
    pub fn reader_factory(&self) -> PubSubReaderFactory {
        let broker = self.clone();
        Arc::new(move || {
            Ok(Box::new(broker.consumer()) as Box<dyn PubSubConsumer>)
        })
    }
}

fn body_size(body: &MessageBody) -> usize {
    match body {
        MessageBody::Put(put) => {
            put.value.len() + put.replication_metadata_payload.len()
        }
        MessageBody::Delete(delete) => delete.replication_metadata_payload.len(),
        MessageBody::Control(_) => 1,
    }
}

/// One consumer view over the broker's logs.
pub struct InMemoryPubSub {
    state: Arc<Mutex<BrokerState>>,
    // next index to deliver per assigned pair
    cursors: HashMap<TopicPartition, usize>,
    paused: HashSet<TopicPartition>,
}

impl PubSubConsumer for InMemoryPubSub {
    fn subscribe(&mut self, tp: &TopicPartition, from_offset: i64) -> Result<(), PubSubError> {
        let cursor = if from_offset == EARLIEST_OFFSET {
            0
        } else {
            (from_offset + 1).max(0) as usize
        };
        self.cursors.insert(tp.clone(), cursor);
        self.paused.remove(tp);
        Ok(())
    }

    fn unsubscribe(&mut self, tp: &TopicPartition) -> Result<(), PubSubError> {
        self.cursors.remove(tp);
        self.paused.remove(tp);
        Ok(())
    }

    fn batch_unsubscribe(&mut self, tps: &HashSet<TopicPartition>) -> Result<(), PubSubError> {
        for tp in tps {
            self.unsubscribe(tp)?;
        }
        Ok(())
    }

    fn pause(&mut self, tp: &TopicPartition) -> Result<(), PubSubError> {
        if !self.cursors.contains_key(tp) {
            return Err(PubSubError::unknown_topic_partition(
                tp.topic.clone(),
                tp.partition,
            ));
        }
        self.paused.insert(tp.clone());
        Ok(())
    }

    fn resume(&mut self, tp: &TopicPartition) -> Result<(), PubSubError> {
        self.paused.remove(tp);
        Ok(())
    }

    fn assignment(&self) -> HashSet<TopicPartition> {
        self.cursors.keys().cloned().collect()
    }

    fn poll(
        &mut self,
        _timeout: Duration,
    ) -> Result<HashMap<TopicPartition, Vec<Envelope>>, PubSubError> {
        let state = self.state.lock().unwrap();
        let mut out = HashMap::new();
        for (tp, cursor) in self.cursors.iter_mut() {
            if self.paused.contains(tp) {
                continue;
            }
            if let Some(log) = state.logs.get(tp) {
                if *cursor < log.len() {
                    out.insert(tp.clone(), log[*cursor..].to_vec());
                    *cursor = log.len();
                }
            }
        }
        Ok(out)
    }

    fn end_offset(&mut self, tp: &TopicPartition) -> Result<i64, PubSubError> {
        let state = self.state.lock().unwrap();
        Ok(state.logs.get(tp).map_or(0, |log| log.len() as i64))
    }

    fn offset_for_time(
        &mut self,
        tp: &TopicPartition,
        timestamp_ms: i64,
    ) -> Result<Option<i64>, PubSubError> {
        let state = self.state.lock().unwrap();
        Ok(state.logs.get(tp).and_then(|log| {
            log.iter()
                .find(|env| env.timestamp_ms >= timestamp_ms)
                .map(|env| env.offset)
        }))
    }

    fn close(&mut self) {
        self.cursors.clear();
        self.paused.clear();
    }
}

// ===== Static metadata =====

/// Control-plane stub with a mutable store record, so tests can bump the
/// serving version mid-flight.
pub struct StaticMetadata {
    store: Mutex<StoreInfo>,
    latest_value_schema_id: i32,
}

impl StaticMetadata {
    pub fn new(store: StoreInfo) -> Self {
        Self {
            store: Mutex::new(store),
            latest_value_schema_id: 7,
        }
    }

    /// Uncompressed store with versions `1..=current_version`.
    pub fn uncompressed(name: &str, current_version: i32, partition_count: i32) -> Self {
        Self::new(StoreInfo {
            name: name.to_string(),
            current_version,
            partition_count,
            versions: (1..=current_version)
                .map(|version| VersionInfo {
                    version,
                    compression: CompressionMode::None,
                })
                .collect(),
        })
    }

    pub fn set_version_compression(&self, version: i32, compression: CompressionMode) {
        let mut store = self.store.lock().unwrap();
        if let Some(v) = store.versions.iter_mut().find(|v| v.version == version) {
            v.compression = compression;
        }
    }

    pub fn promote_version(&self, version: i32, compression: CompressionMode) {
        let mut store = self.store.lock().unwrap();
        store.versions.push(VersionInfo {
            version,
            compression,
        });
        store.current_version = version;
    }
}

impl MetadataClient for StaticMetadata {
    fn get_store(&self, store: &str) -> Result<StoreInfo, MetadataError> {
        let info = self.store.lock().unwrap();
        if info.name == store {
            Ok(info.clone())
        } else {
            Err(MetadataError::store_not_found(store))
        }
    }

    fn key_schema(&self, _store: &str) -> Result<Schema, MetadataError> {
        Ok(Schema::new(1, r#""string""#))
    }

    fn value_schema(&self, store: &str, id: i32) -> Result<Schema, MetadataError> {
        if id > 0 {
            Ok(Schema::new(id, r#"{"type":"record"}"#))
        } else {
            Err(MetadataError::schema_not_found(store, id))
        }
    }

    fn latest_value_schema_id(&self, _store: &str) -> Result<i32, MetadataError> {
        Ok(self.latest_value_schema_id)
    }

    fn replication_metadata_schema(
        &self,
        store: &str,
        rmd_version_id: i32,
    ) -> Result<Schema, MetadataError> {
        if rmd_version_id > 0 {
            Ok(Schema::new(rmd_version_id, r#"{"type":"rmd"}"#))
        } else {
            Err(MetadataError::schema_not_found(store, rmd_version_id))
        }
    }
}

// ===== Envelope builders =====

pub fn json_key(key: &str) -> Bytes {
    Bytes::from(serde_json::to_vec(key).unwrap())
}

pub fn json_value<T: Serialize>(value: &T) -> Bytes {
    Bytes::from(serde_json::to_vec(value).unwrap())
}

/// Data put without replication metadata.
pub fn put(schema_id: i32, value: Bytes) -> MessageBody {
    MessageBody::Put(changestream::pubsub::Put {
        schema_id,
        value,
        replication_metadata_version_id: 0,
        replication_metadata_payload: Bytes::new(),
    })
}

/// Data put carrying a checkpoint vector in its replication metadata.
pub fn put_with_vector(schema_id: i32, value: Bytes, vector: &[i64]) -> MessageBody {
    MessageBody::Put(changestream::pubsub::Put {
        schema_id,
        value,
        replication_metadata_version_id: 1,
        replication_metadata_payload: encode_checkpoint_vector(vector),
    })
}

pub fn delete() -> MessageBody {
    MessageBody::Delete(Delete {
        replication_metadata_version_id: 0,
        replication_metadata_payload: Bytes::new(),
    })
}

pub fn delete_with_vector(vector: &[i64]) -> MessageBody {
    MessageBody::Delete(Delete {
        replication_metadata_version_id: 1,
        replication_metadata_payload: encode_checkpoint_vector(vector),
    })
}

pub fn end_of_push() -> MessageBody {
    MessageBody::Control(ControlMessage::EndOfPush)
}

pub fn start_of_push(dictionary: Option<Bytes>) -> MessageBody {
    MessageBody::Control(ControlMessage::StartOfPush {
        compression_dictionary: dictionary,
    })
}

pub fn version_swap(new_serving_version_topic: &str, watermarks: &[i64]) -> MessageBody {
    MessageBody::Control(ControlMessage::VersionSwap {
        new_serving_version_topic: new_serving_version_topic.to_string(),
        local_high_watermarks: watermarks.to_vec(),
    })
}

/// Change-capture record with optional before/after JSON values.
pub fn change_record<T: Serialize>(
    before: Option<&T>,
    after: Option<&T>,
    vector: &[i64],
) -> MessageBody {
    let record = RecordChangeEvent {
        before: before.map(|v| ValuePayload {
            schema_id: 7,
            value: json_value(v),
        }),
        after: after.map(|v| ValuePayload {
            schema_id: 7,
            value: json_value(v),
        }),
        replication_checkpoint_vector: vector.to_vec(),
    };
    put(1, record.encode())
}
