//! Subscription set and seek primitives.
//!
//! The manager owns the broker adapter and is the only code that touches
//! it. Callers hold it behind one mutex, so every method takes `&mut self`
//! and can assume it has the broker to itself. Each partition number maps
//! to at most one `(topic, partition)` pair in the assignment: subscribing
//! a partition to a new topic always unsubscribes the pair it replaces.
//!
//! Every seek that lands on a version topic pre-populates the compressor
//! cache so the poll path never blocks on a dictionary fetch.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::metadata::{CompressionMode, MetadataClient, MetadataError};
use crate::pubsub::{Envelope, PubSubConsumer, TopicPartition, EARLIEST_OFFSET};

use super::compression::CompressorRegistry;
use super::coordinate::ChangeCoordinate;
use super::error::{ChangelogError, Result};
use super::topics;

pub struct TopicPartitionManager {
    store: String,
    consumer: Box<dyn PubSubConsumer>,
    metadata: Arc<dyn MetadataClient>,
    compressors: Arc<CompressorRegistry>,
}

impl TopicPartitionManager {
    pub fn new(
        store: impl Into<String>,
        consumer: Box<dyn PubSubConsumer>,
        metadata: Arc<dyn MetadataClient>,
        compressors: Arc<CompressorRegistry>,
    ) -> Self {
        Self {
            store: store.into(),
            consumer,
            metadata,
            compressors,
        }
    }

    /// Subscribe partitions to `topic`, or to the current serving version
    /// topic when `topic` is `None`. Replaced pairs are unsubscribed first;
    /// new pairs start at the earliest offset.
    pub fn subscribe(&mut self, partitions: &BTreeSet<i32>, topic: Option<&str>) -> Result<()> {
        let topic = match topic {
            Some(t) => t.to_string(),
            None => self.current_serving_version_topic()?,
        };
        self.drop_assignments(partitions)?;
        for &partition in partitions {
            self.prepare_compressor(partition, &topic)?;
        }
        for &partition in partitions {
            let tp = TopicPartition::new(topic.clone(), partition);
            self.consumer.subscribe(&tp, EARLIEST_OFFSET)?;
        }
        info!(store = %self.store, topic = %topic, count = partitions.len(), "subscribed partitions");
        Ok(())
    }

    /// Remove the partitions from the assignment.
    pub fn unsubscribe(&mut self, partitions: &BTreeSet<i32>) -> Result<()> {
        let to_remove: HashSet<TopicPartition> = self
            .consumer
            .assignment()
            .into_iter()
            .filter(|tp| partitions.contains(&tp.partition))
            .collect();
        if !to_remove.is_empty() {
            self.consumer.batch_unsubscribe(&to_remove)?;
        }
        Ok(())
    }

    pub fn pause(&mut self, partitions: &BTreeSet<i32>) -> Result<()> {
        for tp in self.assigned(partitions) {
            self.consumer.pause(&tp)?;
        }
        Ok(())
    }

    pub fn resume(&mut self, partitions: &BTreeSet<i32>) -> Result<()> {
        for tp in self.assigned(partitions) {
            self.consumer.resume(&tp)?;
        }
        Ok(())
    }

    /// Re-subscribe at the start of the current version topic.
    pub fn seek_to_beginning_of_push(&mut self, partitions: &BTreeSet<i32>) -> Result<()> {
        let topic = self.current_serving_version_topic()?;
        self.seek_with(partitions, &topic, |consumer, tp| {
            consumer.subscribe(tp, EARLIEST_OFFSET).map_err(Into::into)
        })
    }

    /// Switch to the current version's change-capture topic at its start.
    pub fn seek_to_end_of_push(&mut self, partitions: &BTreeSet<i32>) -> Result<()> {
        let topic = self.current_change_capture_topic()?;
        self.seek_with(partitions, &topic, |consumer, tp| {
            consumer.subscribe(tp, EARLIEST_OFFSET).map_err(Into::into)
        })
    }

    /// Switch to the change-capture topic positioned after its last record.
    pub fn seek_to_tail(&mut self, partitions: &BTreeSet<i32>) -> Result<()> {
        let topic = self.current_change_capture_topic()?;
        self.seek_with(partitions, &topic, |consumer, tp| {
            let end = consumer.end_offset(tp)?;
            subscribe_resuming(consumer, tp, end)
        })
    }

    /// Per partition, position on the change-capture topic at the first
    /// record at or after the given timestamp; partitions with no such
    /// record land at the end.
    pub fn seek_to_timestamps(&mut self, timestamps: &BTreeMap<i32, i64>) -> Result<()> {
        let topic = self.current_change_capture_topic()?;
        let partitions: BTreeSet<i32> = timestamps.keys().copied().collect();
        self.seek_with(&partitions, &topic, |consumer, tp| {
            let ts = timestamps[&tp.partition];
            let offset = match consumer.offset_for_time(tp, ts)? {
                Some(offset) => offset,
                None => consumer.end_offset(tp)?,
            };
            subscribe_resuming(consumer, tp, offset)
        })
    }

    /// Resume each coordinate so that the record at its offset is the first
    /// one re-delivered.
    pub fn seek_to_checkpoint(&mut self, coordinates: &BTreeSet<ChangeCoordinate>) -> Result<()> {
        for coordinate in coordinates {
            let partitions = BTreeSet::from([coordinate.partition]);
            self.seek_with(&partitions, &coordinate.topic, |consumer, tp| {
                subscribe_resuming(consumer, tp, coordinate.offset)
            })?;
        }
        Ok(())
    }

    /// Cut one partition over to `target_topic` at the earliest offset.
    ///
    /// No-op (returns `false`) when the partition is already consuming the
    /// target, which makes replayed swap messages idempotent.
    pub fn switch_to_topic(&mut self, partition: i32, target_topic: &str) -> Result<bool> {
        for tp in self.consumer.assignment() {
            if tp.partition == partition && tp.topic == target_topic {
                debug!(topic = %target_topic, partition, "already on target topic");
                return Ok(false);
            }
        }
        let partitions = BTreeSet::from([partition]);
        self.drop_assignments(&partitions)?;
        self.prepare_compressor(partition, target_topic)?;
        self.consumer
            .subscribe(&TopicPartition::new(target_topic, partition), EARLIEST_OFFSET)?;
        info!(topic = %target_topic, partition, "switched partition to new topic");
        Ok(true)
    }

    pub fn poll(&mut self, timeout: Duration) -> Result<HashMap<TopicPartition, Vec<Envelope>>> {
        self.consumer.poll(timeout).map_err(Into::into)
    }

    pub fn assignment(&self) -> HashSet<TopicPartition> {
        self.consumer.assignment()
    }

    /// The assigned pair for a partition number, if any.
    pub fn assigned_topic(&self, partition: i32) -> Option<TopicPartition> {
        self.consumer
            .assignment()
            .into_iter()
            .find(|tp| tp.partition == partition)
    }

    pub fn end_offset(&mut self, tp: &TopicPartition) -> Result<i64> {
        self.consumer.end_offset(tp).map_err(Into::into)
    }

    /// Unsubscribe everything and close the broker adapter.
    pub fn close(&mut self) {
        let assignment = self.consumer.assignment();
        if !assignment.is_empty() {
            if let Err(e) = self.consumer.batch_unsubscribe(&assignment) {
                debug!(error = %e, "unsubscribe during close failed");
            }
        }
        self.consumer.close();
    }

    pub fn current_serving_version_topic(&self) -> Result<String> {
        let info = self
            .metadata
            .get_store(&self.store)
            .map_err(|e| ChangelogError::metadata(&self.store, e))?;
        Ok(topics::version_topic(&self.store, info.current_version))
    }

    fn current_change_capture_topic(&self) -> Result<String> {
        let info = self
            .metadata
            .get_store(&self.store)
            .map_err(|e| ChangelogError::metadata(&self.store, e))?;
        Ok(topics::change_capture_topic(&self.store, info.current_version))
    }

    /// Unsubscribe whatever pairs currently serve these partition numbers.
    fn drop_assignments(&mut self, partitions: &BTreeSet<i32>) -> Result<()> {
        for tp in self.consumer.assignment() {
            if partitions.contains(&tp.partition) {
                self.consumer.unsubscribe(&tp)?;
            }
        }
        Ok(())
    }

    /// Common seek shape: replace the partitions' assignments on `topic`,
    /// warming the compressor cache, then position each pair with `seek`.
    fn seek_with(
        &mut self,
        partitions: &BTreeSet<i32>,
        topic: &str,
        mut seek: impl FnMut(&mut dyn PubSubConsumer, &TopicPartition) -> Result<()>,
    ) -> Result<()> {
        self.drop_assignments(partitions)?;
        for &partition in partitions {
            self.prepare_compressor(partition, topic)?;
            let tp = TopicPartition::new(topic, partition);
            seek(self.consumer.as_mut(), &tp)?;
        }
        Ok(())
    }

    /// Warm the compressor cache for a version topic; change-capture
    /// topics carry uncompressed values and need nothing.
    fn prepare_compressor(&mut self, partition: i32, topic: &str) -> Result<()> {
        if topics::is_change_capture_topic(topic) {
            return Ok(());
        }
        let mode = self.compression_mode(topic)?;
        self.compressors.get(partition, topic, mode)?;
        Ok(())
    }

    fn compression_mode(&self, topic: &str) -> Result<CompressionMode> {
        let version = topics::parse_version(topic).ok_or_else(|| {
            ChangelogError::internal(format!("cannot parse version from topic {topic}"))
        })?;
        let info = self
            .metadata
            .get_store(&self.store)
            .map_err(|e| ChangelogError::metadata(&self.store, e))?;
        info.version(version)
            .map(|v| v.compression)
            .ok_or_else(|| {
                ChangelogError::metadata(
                    &self.store,
                    MetadataError::version_not_found(&self.store, version),
                )
            })
    }

    fn assigned(&self, partitions: &BTreeSet<i32>) -> Vec<TopicPartition> {
        self.consumer
            .assignment()
            .into_iter()
            .filter(|tp| partitions.contains(&tp.partition))
            .collect()
    }
}

/// Subscribe honoring the resume-after convention: a caller-visible offset
/// `n` subscribes at `n - 1` so the record at `n` is re-delivered. The
/// earliest sentinel passes through untouched.
fn subscribe_resuming(
    consumer: &mut dyn PubSubConsumer,
    tp: &TopicPartition,
    offset: i64,
) -> Result<()> {
    if offset == EARLIEST_OFFSET {
        consumer.subscribe(tp, EARLIEST_OFFSET)?;
    } else {
        consumer.subscribe(tp, offset - 1)?;
    }
    Ok(())
}
