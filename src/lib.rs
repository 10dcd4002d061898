//! changestream: changelog consumer for a partitioned, versioned
//! key-value store.
//!
//! The store publishes every version as an append-only log: a batch push
//! writes the version topic `<store>_v<n>`, and post-push mutations flow
//! into the change-capture topic `<store>_v<n>_cc`. This crate exposes a
//! consumer that follows a store's logical change stream across those
//! physical topics, decoding each record into `(key, before, after)` and
//! cutting partitions over on push boundaries and version swaps without
//! emitting stale or duplicate events.
//!
//! The broker and the control plane stay behind the [`pubsub::PubSubConsumer`]
//! and [`metadata::MetadataClient`] traits; applications plug in their own
//! adapters.
//!
//! ```no_run
//! use std::collections::BTreeSet;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use changestream::changelog::GenericChangelogConsumer;
//! use changestream::config::ChangelogClientConfig;
//!
//! # fn adapters() -> (Box<dyn changestream::pubsub::PubSubConsumer>, Arc<dyn changestream::metadata::MetadataClient>) { unimplemented!() }
//! # async fn run() -> changestream::changelog::Result<()> {
//! let (pubsub, metadata) = adapters();
//! let consumer =
//!     GenericChangelogConsumer::new_generic(ChangelogClientConfig::new("orders"), pubsub, metadata)?;
//! consumer.subscribe(BTreeSet::from([0, 1])).await?;
//! loop {
//!     for message in consumer.poll(Duration::from_millis(500))? {
//!         println!("{:?} -> {:?}", message.event.before, message.event.after);
//!     }
//! }
//! # }
//! ```

pub mod changelog; // Consumer core (assembler, watermarks, poll loop)
pub mod config; // Client configuration
pub mod metadata; // Control-plane collaborator contract
pub mod pubsub; // Broker collaborator contract

// Test utilities (only compiled in test builds)
#[cfg(test)]
pub mod testing;

pub use changelog::{ChangeCoordinate, ChangeEvent, ChangeMessage, ChangelogConsumer, ChangelogError};
pub use config::ChangelogClientConfig;
