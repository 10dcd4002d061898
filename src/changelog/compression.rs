//! Value decompression for version topics.
//!
//! Compression is a property of a store version: every record in one
//! version topic shares the version's compression mode, and dictionary
//! compression publishes its dictionary in the start-of-push control
//! message at the head of that topic. Change-capture topics are never
//! compressed.
//!
//! The registry caches one compressor per partition, rebuilt whenever the
//! partition moves to a topic with a different name. Dictionary fetch runs
//! on a dedicated short-lived reader so the scan cannot disturb the main
//! consumer's assignment.

use std::io::Read;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::DashMap;
use flate2::read::GzDecoder;
use once_cell::sync::Lazy;
use tracing::{debug, info};

use crate::metadata::CompressionMode;
use crate::pubsub::{
    ControlMessage, MessageBody, PubSubConsumer, PubSubError, TopicPartition, EARLIEST_OFFSET,
};

use super::constants::DICTIONARY_POLL_INTERVAL_MS;
use super::error::{ChangelogError, Result};

/// Factory producing short-lived broker readers for dictionary fetches.
pub type PubSubReaderFactory =
    Arc<dyn Fn() -> std::result::Result<Box<dyn PubSubConsumer>, PubSubError> + Send + Sync>;

static NOOP: Lazy<Arc<Compressor>> = Lazy::new(|| Arc::new(Compressor::Noop));
static GZIP: Lazy<Arc<Compressor>> = Lazy::new(|| Arc::new(Compressor::Gzip));

/// A decompressor bound to one store version's compression mode.
#[derive(Debug)]
pub enum Compressor {
    Noop,
    Gzip,
    ZstdDict { dictionary: Vec<u8> },
}

impl Compressor {
    /// Shared no-op instance, used for change-capture topics.
    pub fn noop() -> Arc<Compressor> {
        Arc::clone(&NOOP)
    }

    /// Decompress one value payload.
    pub fn decompress(&self, bytes: &[u8]) -> Result<Vec<u8>> {
        match self {
            Compressor::Noop => Ok(bytes.to_vec()),
            Compressor::Gzip => {
                let mut out = Vec::with_capacity(bytes.len() * 2);
                GzDecoder::new(bytes)
                    .read_to_end(&mut out)
                    .map_err(|e| {
                        ChangelogError::corrupt_payload(format!("gzip decompression failed: {e}"))
                    })?;
                Ok(out)
            }
            Compressor::ZstdDict { dictionary } => {
                let mut out = Vec::with_capacity(bytes.len() * 2);
                zstd::stream::read::Decoder::with_dictionary(bytes, dictionary)
                    .and_then(|mut decoder| decoder.read_to_end(&mut out))
                    .map_err(|e| {
                        ChangelogError::corrupt_payload(format!("zstd decompression failed: {e}"))
                    })?;
                Ok(out)
            }
        }
    }
}

struct CacheEntry {
    topic: String,
    compressor: Arc<Compressor>,
}

/// Per-partition compressor cache with lazy dictionary fetch.
///
/// Reads race with seek-driven writes, so the cache is a concurrent map;
/// readers always observe either the previous or the new entry, never a
/// torn one.
pub struct CompressorRegistry {
    cache: DashMap<i32, CacheEntry>,
    reader_factory: Option<PubSubReaderFactory>,
    dictionary_fetch_timeout: Duration,
}

impl CompressorRegistry {
    pub fn new(
        reader_factory: Option<PubSubReaderFactory>,
        dictionary_fetch_timeout: Duration,
    ) -> Self {
        Self {
            cache: DashMap::new(),
            reader_factory,
            dictionary_fetch_timeout,
        }
    }

    /// Return the compressor for `partition` on `version_topic`, building
    /// and caching it on miss or topic change.
    ///
    /// Dictionary modes fetch the dictionary from the topic head; failure
    /// to read it is fatal for the partition.
    pub fn get(
        &self,
        partition: i32,
        version_topic: &str,
        mode: CompressionMode,
    ) -> Result<Arc<Compressor>> {
        if let Some(entry) = self.cache.get(&partition) {
            if entry.topic == version_topic {
                return Ok(Arc::clone(&entry.compressor));
            }
        }

        let compressor = match mode {
            CompressionMode::None => Arc::clone(&NOOP),
            CompressionMode::Gzip => Arc::clone(&GZIP),
            CompressionMode::ZstdWithDict => {
                let dictionary = self.fetch_dictionary(version_topic, partition)?;
                info!(
                    topic = version_topic,
                    partition,
                    dictionary_bytes = dictionary.len(),
                    "fetched compression dictionary"
                );
                Arc::new(Compressor::ZstdDict {
                    dictionary: dictionary.to_vec(),
                })
            }
        };

        self.cache.insert(
            partition,
            CacheEntry {
                topic: version_topic.to_string(),
                compressor: Arc::clone(&compressor),
            },
        );
        Ok(compressor)
    }

    /// The cached compressor for `partition`, if it was built for `topic`.
    /// The poll path uses this to avoid re-resolving compression modes for
    /// every record; seeks keep the cache warm.
    pub fn cached(&self, partition: i32, topic: &str) -> Option<Arc<Compressor>> {
        self.cache
            .get(&partition)
            .filter(|entry| entry.topic == topic)
            .map(|entry| Arc::clone(&entry.compressor))
    }

    /// Drop the cached compressor for a partition.
    pub fn evict(&self, partition: i32) {
        self.cache.remove(&partition);
    }

    /// Scan the head of the version topic for the start-of-push dictionary.
    ///
    /// The dictionary precedes all data, so the scan is bounded: the first
    /// non-start-of-push message proves there is no dictionary to find.
    fn fetch_dictionary(&self, version_topic: &str, partition: i32) -> Result<Bytes> {
        let factory = self.reader_factory.as_ref().ok_or_else(|| {
            ChangelogError::dictionary_unreadable(
                version_topic,
                "no dictionary reader factory configured",
            )
        })?;
        let mut reader = factory().map_err(|e| {
            ChangelogError::dictionary_unreadable(
                version_topic,
                format!("failed to open dictionary reader: {e}"),
            )
        })?;

        let tp = TopicPartition::new(version_topic, partition);
        let result = self.scan_for_dictionary(reader.as_mut(), &tp);
        reader.close();
        result
    }

    fn scan_for_dictionary(
        &self,
        reader: &mut dyn PubSubConsumer,
        tp: &TopicPartition,
    ) -> Result<Bytes> {
        reader.subscribe(tp, EARLIEST_OFFSET).map_err(|e| {
            ChangelogError::dictionary_unreadable(&tp.topic, format!("subscribe failed: {e}"))
        })?;

        let deadline = Instant::now() + self.dictionary_fetch_timeout;
        let poll_interval = Duration::from_millis(DICTIONARY_POLL_INTERVAL_MS);
        while Instant::now() < deadline {
            let batches = reader.poll(poll_interval).map_err(|e| {
                ChangelogError::dictionary_unreadable(&tp.topic, format!("poll failed: {e}"))
            })?;
            for envelope in batches.into_iter().flat_map(|(_, list)| list) {
                match envelope.body {
                    MessageBody::Control(ControlMessage::StartOfPush {
                        compression_dictionary,
                    }) => {
                        return compression_dictionary.ok_or_else(|| {
                            ChangelogError::dictionary_unreadable(
                                &tp.topic,
                                "start-of-push carries no dictionary",
                            )
                        });
                    }
                    MessageBody::Control(_) => {
                        debug!(topic = %tp.topic, "skipping control message before start of push");
                    }
                    _ => {
                        return Err(ChangelogError::dictionary_unreadable(
                            &tp.topic,
                            "data message precedes start of push",
                        ));
                    }
                }
            }
        }
        Err(ChangelogError::dictionary_unreadable(
            &tp.topic,
            "timed out scanning for start of push",
        ))
    }
}
