//! The changelog consumer: poll loop and version-switch machine.
//!
//! One consumer tracks one store. Per partition it reads exactly one
//! physical topic at a time (the serving version topic during a bootstrap,
//! its change-capture topic afterwards) and cuts over when control
//! messages announce a push boundary or a version swap. Records decode
//! through the chunk assembler, the version compressor and the schema
//! registry, then pass the stale-record filter before they are emitted.
//!
//! Threading: the broker adapter and subscription state live behind a
//! single mutex. `poll` is cheap to call from one thread; subscribe and
//! seek are `async` and run their synchronous bodies on a blocking worker,
//! completing when the broker work is done. Dropping one of those futures
//! abandons the wait, not necessarily the work.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use crate::config::ChangelogClientConfig;
use crate::metadata::MetadataClient;
use crate::pubsub::{
    ControlMessage, Delete, Envelope, MessageBody, PubSubConsumer, Put, TopicPartition,
};

use super::chunking::ChunkAssembler;
use super::compression::{Compressor, CompressorRegistry};
use super::constants::CHANGE_CAPTURE_TOPIC_SUFFIX;
use super::coordinate::ChangeCoordinate;
use super::error::{ChangelogError, Result};
use super::event::{ChangeEvent, ChangeMessage, RecordChangeEvent, ValuePayload};
use super::schemas::{
    CachedDeserializer, DeserializerCache, GenericDecoder, SchemaRegistry, SpecificDecoder,
    ValueDecoder,
};
use super::subscription::TopicPartitionManager;
use super::topics;
use super::watermark::CoordinateTracker;

/// Changelog consumer for one store.
///
/// `K` and `V` are the decoded key and value types. Cloning is cheap and
/// shares the underlying consumer.
pub struct ChangelogConsumer<K, V> {
    inner: Arc<ConsumerInner<K, V>>,
}

impl<K, V> Clone for ChangelogConsumer<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Consumer variant producing dynamic JSON values.
pub type GenericChangelogConsumer =
    ChangelogConsumer<serde_json::Value, serde_json::Value>;

struct ConsumerInner<K, V> {
    store: String,
    partition_count: i32,
    metadata: Arc<dyn MetadataClient>,
    broker: Mutex<TopicPartitionManager>,
    schemas: Arc<SchemaRegistry>,
    compressors: Arc<CompressorRegistry>,
    key_deserializer: CachedDeserializer<K>,
    value_deserializers: DeserializerCache<V>,
    assembler: Mutex<ChunkAssembler>,
    watermarks: Mutex<CoordinateTracker>,
    // Last observed after-image size per partition, from change-capture
    // events.
    value_payload_sizes: Mutex<Vec<usize>>,
}

impl<K, V> ChangelogConsumer<K, V>
where
    K: DeserializeOwned + Send + Sync + 'static,
    V: DeserializeOwned + Send + Sync + 'static,
{
    /// Build a consumer decoding keys and values into the caller's types.
    pub fn new(
        config: ChangelogClientConfig,
        pubsub: Box<dyn PubSubConsumer>,
        metadata: Arc<dyn MetadataClient>,
    ) -> Result<Self> {
        Self::with_decoders(
            config,
            pubsub,
            metadata,
            Arc::new(SpecificDecoder::new()),
            Arc::new(SpecificDecoder::new()),
        )
    }
}

impl GenericChangelogConsumer {
    /// Build a consumer producing dynamic values, for callers without a
    /// compiled-in value type.
    pub fn new_generic(
        config: ChangelogClientConfig,
        pubsub: Box<dyn PubSubConsumer>,
        metadata: Arc<dyn MetadataClient>,
    ) -> Result<Self> {
        Self::with_decoders(
            config,
            pubsub,
            metadata,
            Arc::new(GenericDecoder),
            Arc::new(GenericDecoder),
        )
    }
}

impl<K, V> ChangelogConsumer<K, V>
where
    K: Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    /// Build a consumer with explicit key and value decoders. The decoder
    /// choice is fixed for the consumer's lifetime.
    pub fn with_decoders(
        config: ChangelogClientConfig,
        pubsub: Box<dyn PubSubConsumer>,
        metadata: Arc<dyn MetadataClient>,
        key_decoder: Arc<dyn ValueDecoder<K>>,
        value_decoder: Arc<dyn ValueDecoder<V>>,
    ) -> Result<Self> {
        config.validate()?;
        let store = config.store_name.clone();

        let info = metadata
            .get_store(&store)
            .map_err(|e| ChangelogError::metadata(&store, e))?;
        let partition_count = info.partition_count;

        let compressors = Arc::new(CompressorRegistry::new(
            config.dictionary_reader_factory.clone(),
            config.dictionary_fetch_timeout,
        ));
        let schemas = Arc::new(SchemaRegistry::new(store.clone(), Arc::clone(&metadata)));

        let key_schema = schemas.key_schema()?;
        let key_deserializer =
            CachedDeserializer::new(key_schema.clone(), key_schema, key_decoder);
        let value_deserializers =
            DeserializerCache::new(Arc::clone(&schemas), value_decoder);

        let broker = TopicPartitionManager::new(
            store.clone(),
            pubsub,
            Arc::clone(&metadata),
            Arc::clone(&compressors),
        );

        info!(store = %store, partition_count, "starting changelog consumer");

        Ok(Self {
            inner: Arc::new(ConsumerInner {
                store,
                partition_count,
                metadata,
                broker: Mutex::new(broker),
                schemas,
                compressors,
                key_deserializer,
                value_deserializers,
                assembler: Mutex::new(ChunkAssembler::new()),
                watermarks: Mutex::new(CoordinateTracker::new()),
                value_payload_sizes: Mutex::new(vec![0; partition_count.max(0) as usize]),
            }),
        })
    }

    /// Subscribe partitions to the current serving version topic.
    pub async fn subscribe(&self, partitions: BTreeSet<i32>) -> Result<()> {
        self.run_blocking(move |inner| inner.subscribe_sync(&partitions, None))
            .await
    }

    /// Subscribe every partition of the store.
    pub async fn subscribe_all(&self) -> Result<()> {
        let partitions = self.inner.all_partitions();
        self.subscribe(partitions).await
    }

    /// Remove partitions from the assignment.
    pub fn unsubscribe(&self, partitions: &BTreeSet<i32>) -> Result<()> {
        self.inner.unsubscribe_sync(partitions)
    }

    /// Remove every partition from the assignment.
    pub fn unsubscribe_all(&self) -> Result<()> {
        let partitions = self.inner.all_partitions();
        self.inner.unsubscribe_sync(&partitions)
    }

    /// Rewind partitions to the start of the current version's batch push.
    pub async fn seek_to_beginning_of_push(&self, partitions: BTreeSet<i32>) -> Result<()> {
        self.run_blocking(move |inner| {
            inner.reset_partitions(&partitions)?;
            inner.broker()?.seek_to_beginning_of_push(&partitions)
        })
        .await
    }

    /// [`seek_to_beginning_of_push`](Self::seek_to_beginning_of_push) over
    /// the whole current assignment.
    pub async fn seek_to_beginning_of_push_all(&self) -> Result<()> {
        self.run_blocking(move |inner| {
            let mut broker = inner.broker()?;
            let partitions = assignment_partitions(&broker);
            inner.reset_partitions(&partitions)?;
            broker.seek_to_beginning_of_push(&partitions)
        })
        .await
    }

    /// Position partitions at the start of the current version's
    /// change-capture topic.
    pub async fn seek_to_end_of_push(&self, partitions: BTreeSet<i32>) -> Result<()> {
        self.run_blocking(move |inner| {
            inner.reset_partitions(&partitions)?;
            inner.broker()?.seek_to_end_of_push(&partitions)
        })
        .await
    }

    /// [`seek_to_end_of_push`](Self::seek_to_end_of_push) over the whole
    /// current assignment.
    pub async fn seek_to_end_of_push_all(&self) -> Result<()> {
        self.run_blocking(move |inner| {
            let mut broker = inner.broker()?;
            let partitions = assignment_partitions(&broker);
            inner.reset_partitions(&partitions)?;
            broker.seek_to_end_of_push(&partitions)
        })
        .await
    }

    /// Position partitions after the last record of the change-capture
    /// topic, so only new mutations are delivered.
    pub async fn seek_to_tail(&self, partitions: BTreeSet<i32>) -> Result<()> {
        self.run_blocking(move |inner| {
            inner.reset_partitions(&partitions)?;
            inner.broker()?.seek_to_tail(&partitions)
        })
        .await
    }

    /// [`seek_to_tail`](Self::seek_to_tail) over the whole current
    /// assignment.
    pub async fn seek_to_tail_all(&self) -> Result<()> {
        self.run_blocking(move |inner| {
            let mut broker = inner.broker()?;
            let partitions = assignment_partitions(&broker);
            inner.reset_partitions(&partitions)?;
            broker.seek_to_tail(&partitions)
        })
        .await
    }

    /// Apply one timestamp to every currently assigned partition.
    pub async fn seek_to_timestamp(&self, timestamp_ms: i64) -> Result<()> {
        self.run_blocking(move |inner| {
            let mut broker = inner.broker()?;
            let timestamps: BTreeMap<i32, i64> = broker
                .assignment()
                .into_iter()
                .map(|tp| (tp.partition, timestamp_ms))
                .collect();
            let partitions: BTreeSet<i32> = timestamps.keys().copied().collect();
            inner.reset_partitions(&partitions)?;
            broker.seek_to_timestamps(&timestamps)
        })
        .await
    }

    /// Per partition, position at the first change-capture record at or
    /// after the timestamp (or at the end when none exists).
    pub async fn seek_to_timestamps(&self, timestamps: BTreeMap<i32, i64>) -> Result<()> {
        self.run_blocking(move |inner| {
            let partitions: BTreeSet<i32> = timestamps.keys().copied().collect();
            inner.reset_partitions(&partitions)?;
            inner.broker()?.seek_to_timestamps(&timestamps)
        })
        .await
    }

    /// Resume from persisted coordinates. The record at each coordinate's
    /// offset is the first one re-delivered.
    pub async fn seek_to_checkpoint(&self, coordinates: BTreeSet<ChangeCoordinate>) -> Result<()> {
        self.run_blocking(move |inner| {
            let partitions: BTreeSet<i32> =
                coordinates.iter().map(|c| c.partition).collect();
            inner.reset_partitions(&partitions)?;
            inner.broker()?.seek_to_checkpoint(&coordinates)
        })
        .await
    }

    /// Stop delivery for the partitions without unsubscribing them.
    pub fn pause(&self, partitions: &BTreeSet<i32>) -> Result<()> {
        self.inner.broker()?.pause(partitions)
    }

    /// Pause the whole assignment.
    pub fn pause_all(&self) -> Result<()> {
        let mut broker = self.inner.broker()?;
        let partitions = assignment_partitions(&broker);
        broker.pause(&partitions)
    }

    pub fn resume(&self, partitions: &BTreeSet<i32>) -> Result<()> {
        self.inner.broker()?.resume(partitions)
    }

    pub fn resume_all(&self) -> Result<()> {
        let mut broker = self.inner.broker()?;
        let partitions = assignment_partitions(&broker);
        broker.resume(&partitions)
    }

    /// Poll for decoded change events, blocking up to `timeout` on the
    /// broker. Per partition, events come back in offset order; there is no
    /// ordering across partitions.
    pub fn poll(&self, timeout: Duration) -> Result<Vec<ChangeMessage<K, V>>> {
        self.inner.poll_sync(timeout)
    }

    /// Number of partitions in the store.
    pub fn partition_count(&self) -> i32 {
        self.inner.partition_count
    }

    /// The store this consumer reads.
    pub fn store_name(&self) -> &str {
        &self.inner.store
    }

    /// Coordinate of the last existing record on the partition's currently
    /// assigned topic. Errors when the partition is not subscribed.
    pub fn latest_coordinate(&self, partition: i32) -> Result<ChangeCoordinate> {
        self.inner.latest_coordinate_sync(partition)
    }

    /// Last observed after-image size for the partition, in bytes.
    pub fn current_value_payload_size(&self, partition: i32) -> Result<usize> {
        let sizes = self.inner.value_payload_sizes()?;
        sizes
            .get(partition as usize)
            .copied()
            .ok_or(ChangelogError::NotSubscribed { partition })
    }

    /// Unsubscribe everything and close the broker adapter.
    pub fn close(&self) {
        if let Ok(mut broker) = self.inner.broker.lock() {
            broker.close();
        }
    }

    async fn run_blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&ConsumerInner<K, V>) -> Result<T> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || f(&inner))
            .await
            .map_err(|e| ChangelogError::internal(format!("worker task failed: {e}")))?
    }
}

fn assignment_partitions(broker: &TopicPartitionManager) -> BTreeSet<i32> {
    broker
        .assignment()
        .into_iter()
        .map(|tp| tp.partition)
        .collect()
}

impl<K, V> ConsumerInner<K, V> {
    fn broker(&self) -> Result<MutexGuard<'_, TopicPartitionManager>> {
        self.broker
            .lock()
            .map_err(|_| ChangelogError::internal("broker lock poisoned"))
    }

    fn assembler(&self) -> Result<MutexGuard<'_, ChunkAssembler>> {
        self.assembler
            .lock()
            .map_err(|_| ChangelogError::internal("assembler lock poisoned"))
    }

    fn watermarks(&self) -> Result<MutexGuard<'_, CoordinateTracker>> {
        self.watermarks
            .lock()
            .map_err(|_| ChangelogError::internal("watermark lock poisoned"))
    }

    fn value_payload_sizes(&self) -> Result<MutexGuard<'_, Vec<usize>>> {
        self.value_payload_sizes
            .lock()
            .map_err(|_| ChangelogError::internal("payload size lock poisoned"))
    }

    fn all_partitions(&self) -> BTreeSet<i32> {
        (0..self.partition_count).collect()
    }

    fn subscribe_sync(&self, partitions: &BTreeSet<i32>, topic: Option<&str>) -> Result<()> {
        self.broker()?.subscribe(partitions, topic)
    }

    fn unsubscribe_sync(&self, partitions: &BTreeSet<i32>) -> Result<()> {
        self.reset_partitions(partitions)?;
        self.broker()?.unsubscribe(partitions)
    }

    /// Forget watermark and chunk state for partitions that are being
    /// repositioned or dropped.
    fn reset_partitions(&self, partitions: &BTreeSet<i32>) -> Result<()> {
        let mut watermarks = self.watermarks()?;
        let mut assembler = self.assembler()?;
        for &partition in partitions {
            watermarks.reset(partition);
            assembler.clear_partition(partition);
        }
        Ok(())
    }

    fn poll_sync(&self, timeout: Duration) -> Result<Vec<ChangeMessage<K, V>>> {
        let batches = self.broker()?.poll(timeout)?;
        let mut out = Vec::new();
        for (tp, envelopes) in batches {
            for envelope in envelopes {
                let Envelope {
                    key,
                    body,
                    offset,
                    timestamp_ms,
                    payload_size,
                } = envelope;
                match body {
                    MessageBody::Control(control) => {
                        if self.handle_control(&tp, control)? {
                            // The rest of this batch belongs to the topic
                            // we just left.
                            break;
                        }
                    }
                    MessageBody::Put(put) => {
                        if let Some(message) =
                            self.decode_put(&tp, key, put, offset, timestamp_ms, payload_size)?
                        {
                            out.push(message);
                        }
                    }
                    MessageBody::Delete(delete) => {
                        if let Some(message) = self
                            .decode_delete(&tp, key, delete, offset, timestamp_ms, payload_size)?
                        {
                            out.push(message);
                        }
                    }
                }
            }
        }
        Ok(out)
    }

    /// Dispatch one control message. Returns true when the partition
    /// switched topics and the rest of its batch must be dropped.
    fn handle_control(&self, tp: &TopicPartition, control: ControlMessage) -> Result<bool> {
        match control {
            ControlMessage::EndOfPush => {
                info!(
                    store = %self.store,
                    topic = %tp.topic,
                    partition = tp.partition,
                    "end of push, switching to change capture"
                );
                let target = format!(
                    "{}{}",
                    topics::strip_change_capture_suffix(&tp.topic),
                    CHANGE_CAPTURE_TOPIC_SUFFIX
                );
                let switched = self.broker()?.switch_to_topic(tp.partition, &target)?;
                if switched {
                    self.assembler()?.clear_partition(tp.partition);
                }
                Ok(switched)
            }
            ControlMessage::VersionSwap {
                new_serving_version_topic,
                local_high_watermarks,
            } => {
                info!(
                    store = %self.store,
                    partition = tp.partition,
                    new_topic = %new_serving_version_topic,
                    watermarks = ?local_high_watermarks,
                    "version swap"
                );
                self.watermarks()?
                    .update_on_version_swap(tp.partition, &local_high_watermarks);
                let target =
                    format!("{new_serving_version_topic}{CHANGE_CAPTURE_TOPIC_SUFFIX}");
                let switched = self.broker()?.switch_to_topic(tp.partition, &target)?;
                if switched {
                    self.assembler()?.clear_partition(tp.partition);
                }
                Ok(switched)
            }
            other => {
                debug!(
                    kind = other.kind(),
                    topic = %tp.topic,
                    partition = tp.partition,
                    "ignoring control message"
                );
                Ok(false)
            }
        }
    }

    fn decode_delete(
        &self,
        tp: &TopicPartition,
        key: Bytes,
        delete: Delete,
        offset: i64,
        timestamp_ms: i64,
        payload_size: usize,
    ) -> Result<Option<ChangeMessage<K, V>>> {
        let vector = self.schemas.extract_offset_vector(
            delete.replication_metadata_version_id,
            &delete.replication_metadata_payload,
        )?;
        if self.watermarks()?.should_filter(tp.partition, &vector) {
            debug!(topic = %tp.topic, partition = tp.partition, offset, "filtered stale delete");
            return Ok(None);
        }
        let key = self.decode_key(tp, &key, offset)?;
        Ok(Some(ChangeMessage {
            key,
            event: ChangeEvent::new(None, None),
            topic: tp.topic.clone(),
            partition: tp.partition,
            offset,
            timestamp_ms,
            payload_size,
        }))
    }

    fn decode_put(
        &self,
        tp: &TopicPartition,
        key: Bytes,
        put: Put,
        offset: i64,
        timestamp_ms: i64,
        payload_size: usize,
    ) -> Result<Option<ChangeMessage<K, V>>> {
        if topics::is_change_capture_topic(&tp.topic) {
            self.decode_change_capture_put(tp, key, put, offset, timestamp_ms, payload_size)
        } else {
            self.decode_version_topic_put(tp, key, put, offset, timestamp_ms, payload_size)
        }
    }

    /// Batch-push records: after image only, compressed with the version's
    /// compressor, checkpoint vector in the replication metadata.
    fn decode_version_topic_put(
        &self,
        tp: &TopicPartition,
        key: Bytes,
        put: Put,
        offset: i64,
        timestamp_ms: i64,
        payload_size: usize,
    ) -> Result<Option<ChangeMessage<K, V>>> {
        let compressor = self.compressor_for(tp)?;
        let assembled = self.assembler()?.buffer_and_assemble(
            tp.partition,
            &key,
            put.schema_id,
            &put.value,
            &compressor,
            |schema_id, bytes| {
                let deserializer = self.value_deserializers.deserializer(schema_id, schema_id)?;
                deserializer
                    .deserialize(bytes)
                    .map_err(|e| self.decode_error(tp, offset, e))
            },
        )?;
        let Some(after) = assembled else {
            // Waiting on more fragments.
            return Ok(None);
        };

        let vector = self.schemas.extract_offset_vector(
            put.replication_metadata_version_id,
            &put.replication_metadata_payload,
        )?;
        if self.watermarks()?.should_filter(tp.partition, &vector) {
            debug!(topic = %tp.topic, partition = tp.partition, offset, "filtered stale record");
            return Ok(None);
        }

        let key = self.decode_key(tp, &key, offset)?;
        Ok(Some(ChangeMessage {
            key,
            event: ChangeEvent::new(None, Some(after)),
            topic: tp.topic.clone(),
            partition: tp.partition,
            offset,
            timestamp_ms,
            payload_size,
        }))
    }

    /// Change-capture records: uncompressed change-record envelope carrying
    /// both images and its own checkpoint vector.
    fn decode_change_capture_put(
        &self,
        tp: &TopicPartition,
        key: Bytes,
        put: Put,
        offset: i64,
        timestamp_ms: i64,
        payload_size: usize,
    ) -> Result<Option<ChangeMessage<K, V>>> {
        let compressor = Compressor::noop();
        let assembled = self.assembler()?.buffer_and_assemble(
            tp.partition,
            &key,
            put.schema_id,
            &put.value,
            &compressor,
            |_schema_id, bytes| RecordChangeEvent::parse(bytes),
        )?;
        let Some(record) = assembled else {
            return Ok(None);
        };

        if self
            .watermarks()?
            .should_filter(tp.partition, &record.replication_checkpoint_vector)
        {
            debug!(topic = %tp.topic, partition = tp.partition, offset, "filtered stale record");
            return Ok(None);
        }

        if let Some(after) = &record.after {
            let mut sizes = self.value_payload_sizes()?;
            if let Some(slot) = sizes.get_mut(tp.partition as usize) {
                *slot = after.value.len();
            }
        }

        let before = self.decode_payload(tp, offset, record.before)?;
        let after = self.decode_payload(tp, offset, record.after)?;
        let key = self.decode_key(tp, &key, offset)?;
        Ok(Some(ChangeMessage {
            key,
            event: ChangeEvent::new(before, after),
            topic: tp.topic.clone(),
            partition: tp.partition,
            offset,
            timestamp_ms,
            payload_size,
        }))
    }

    fn decode_payload(
        &self,
        tp: &TopicPartition,
        offset: i64,
        payload: Option<ValuePayload>,
    ) -> Result<Option<V>> {
        let Some(payload) = payload else {
            return Ok(None);
        };
        let deserializer = self
            .value_deserializers
            .deserializer(payload.schema_id, payload.schema_id)?;
        deserializer
            .deserialize(&payload.value)
            .map(Some)
            .map_err(|e| self.decode_error(tp, offset, e))
    }

    fn decode_key(&self, tp: &TopicPartition, key: &[u8], offset: i64) -> Result<K> {
        self.key_deserializer
            .deserialize(key)
            .map_err(|e| self.decode_error(tp, offset, e))
    }

    fn decode_error(&self, tp: &TopicPartition, offset: i64, err: ChangelogError) -> ChangelogError {
        match err {
            ChangelogError::CorruptPayload { message } => {
                ChangelogError::deserialization(&tp.topic, tp.partition, offset, message)
            }
            other => other,
        }
    }

    /// The compressor for a version-topic partition. Seeks keep the cache
    /// warm; the fallback resolves the version's compression mode and
    /// builds the compressor on the spot.
    fn compressor_for(&self, tp: &TopicPartition) -> Result<Arc<Compressor>> {
        if let Some(compressor) = self.compressors.cached(tp.partition, &tp.topic) {
            return Ok(compressor);
        }
        let version = topics::parse_version(&tp.topic).ok_or_else(|| {
            ChangelogError::internal(format!("cannot parse version from topic {}", tp.topic))
        })?;
        let info = self
            .metadata
            .get_store(&self.store)
            .map_err(|e| ChangelogError::metadata(&self.store, e))?;
        let mode = info.version(version).map(|v| v.compression).ok_or_else(|| {
            ChangelogError::metadata(
                &self.store,
                crate::metadata::MetadataError::version_not_found(&self.store, version),
            )
        })?;
        self.compressors.get(tp.partition, &tp.topic, mode)
    }

    fn latest_coordinate_sync(&self, partition: i32) -> Result<ChangeCoordinate> {
        let mut broker = self.broker()?;
        let tp = broker
            .assigned_topic(partition)
            .ok_or(ChangelogError::NotSubscribed { partition })?;
        let end = broker.end_offset(&tp)?;
        Ok(ChangeCoordinate::new(tp.topic, partition, end - 1))
    }
}
