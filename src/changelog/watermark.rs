//! Stale-record filtering across version cutovers.
//!
//! Every version-swap control message carries the per-region replication
//! offsets the new version had already ingested at the swap point. Records
//! read after the cutover re-deliver history the consumer has already
//! emitted from the previous version; the tracker suppresses them by
//! comparing each record's checkpoint vector against the stored
//! high-watermark vector.

use std::collections::HashMap;

use tracing::debug;

/// True iff `candidate` has advanced past `current` in at least one
/// component. Vectors of different lengths compare as if zero-padded.
pub fn has_vector_advanced(current: &[i64], candidate: &[i64]) -> bool {
    let len = current.len().max(candidate.len());
    for i in 0..len {
        let old = current.get(i).copied().unwrap_or(0);
        let new = candidate.get(i).copied().unwrap_or(0);
        if new > old {
            return true;
        }
    }
    false
}

/// Per-partition high-watermark vectors.
#[derive(Debug, Default)]
pub struct CoordinateTracker {
    high_watermarks: HashMap<i32, Vec<i64>>,
}

impl CoordinateTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// True when a high watermark is recorded for `partition` and the
    /// record's vector has not advanced past it. Partitions that have not
    /// observed a version swap filter nothing.
    pub fn should_filter(&self, partition: i32, record_vector: &[i64]) -> bool {
        match self.high_watermarks.get(&partition) {
            Some(watermark) => !has_vector_advanced(watermark, record_vector),
            None => false,
        }
    }

    /// Adopt the swap's watermark vector iff it advances past the current
    /// one. Repushes can transmit regressed watermarks; those must never
    /// overwrite. Returns whether the vector was adopted.
    pub fn update_on_version_swap(&mut self, partition: i32, vector: &[i64]) -> bool {
        let current = self
            .high_watermarks
            .get(&partition)
            .map(Vec::as_slice)
            .unwrap_or(&[]);
        if has_vector_advanced(current, vector) {
            self.high_watermarks.insert(partition, vector.to_vec());
            true
        } else {
            debug!(
                partition,
                ?vector,
                "version swap watermark has not advanced, keeping current"
            );
            false
        }
    }

    /// Forget the partition's watermark. Called on seek and unsubscribe.
    pub fn reset(&mut self, partition: i32) {
        self.high_watermarks.remove(&partition);
    }

    /// The recorded watermark, if any.
    pub fn high_watermark(&self, partition: i32) -> Option<&[i64]> {
        self.high_watermarks.get(&partition).map(Vec::as_slice)
    }
}
