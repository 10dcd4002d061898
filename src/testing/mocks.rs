//! Mock implementations of the collaborator traits.
//!
//! These mocks let unit tests drive the subscription manager and the
//! consumer without a broker or a control plane.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use mockall::mock;

use crate::metadata::{
    CompressionMode, MetadataClient, MetadataError, Schema, StoreInfo, VersionInfo,
};
use crate::pubsub::{Envelope, PubSubConsumer, PubSubError, TopicPartition};

// MockPubSub: auto-generated mock for the PubSubConsumer trait. Tests set
// expectations on broker operations without any broker running.
mock! {
    pub PubSub {}

    impl PubSubConsumer for PubSub {
        fn subscribe(&mut self, tp: &TopicPartition, from_offset: i64) -> Result<(), PubSubError>;
        fn unsubscribe(&mut self, tp: &TopicPartition) -> Result<(), PubSubError>;
        fn batch_unsubscribe(&mut self, tps: &HashSet<TopicPartition>) -> Result<(), PubSubError>;
        fn pause(&mut self, tp: &TopicPartition) -> Result<(), PubSubError>;
        fn resume(&mut self, tp: &TopicPartition) -> Result<(), PubSubError>;
        fn assignment(&self) -> HashSet<TopicPartition>;
        fn poll(
            &mut self,
            timeout: Duration,
        ) -> Result<HashMap<TopicPartition, Vec<Envelope>>, PubSubError>;
        fn end_offset(&mut self, tp: &TopicPartition) -> Result<i64, PubSubError>;
        fn offset_for_time(
            &mut self,
            tp: &TopicPartition,
            timestamp_ms: i64,
        ) -> Result<Option<i64>, PubSubError>;
        fn close(&mut self);
    }
}

// MockMetadata: auto-generated mock for the MetadataClient trait.
mock! {
    pub Metadata {}

    impl MetadataClient for Metadata {
        fn get_store(&self, store: &str) -> Result<StoreInfo, MetadataError>;
        fn key_schema(&self, store: &str) -> Result<Schema, MetadataError>;
        fn value_schema(&self, store: &str, id: i32) -> Result<Schema, MetadataError>;
        fn latest_value_schema_id(&self, store: &str) -> Result<i32, MetadataError>;
        fn replication_metadata_schema(
            &self,
            store: &str,
            rmd_version_id: i32,
        ) -> Result<Schema, MetadataError>;
    }
}

/// A store whose versions `1..=current_version` all use no compression.
pub fn store_fixture(name: &str, current_version: i32, partition_count: i32) -> StoreInfo {
    StoreInfo {
        name: name.to_string(),
        current_version,
        partition_count,
        versions: (1..=current_version)
            .map(|version| VersionInfo {
                version,
                compression: CompressionMode::None,
            })
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_fixture_covers_all_versions() {
        let store = store_fixture("orders", 3, 8);
        assert_eq!(store.versions.len(), 3);
        assert_eq!(store.partition_count, 8);
        assert!(store.version(3).is_some());
    }

    #[test]
    fn test_mock_pubsub_expectations() {
        let mut mock = MockPubSub::new();
        mock.expect_end_offset().returning(|_| Ok(10));

        let end = mock
            .end_offset(&TopicPartition::new("orders_v1", 0))
            .unwrap();
        assert_eq!(end, 10);
    }
}
