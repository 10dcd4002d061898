// Client configuration for the changelog consumer.
//
// Kept deliberately small: the store name identifies everything else
// (topics, schemas, partitioning) through the control plane. The optional
// dictionary reader factory exists because dictionary-compressed versions
// require a second, short-lived broker connection to read the dictionary
// without disturbing the main consumer's assignment.

use std::fmt;
use std::time::Duration;

use crate::changelog::compression::PubSubReaderFactory;
use crate::changelog::constants::DEFAULT_DICTIONARY_FETCH_TIMEOUT_MS;
use crate::changelog::error::{ChangelogError, Result};

/// Configuration for one [`ChangelogConsumer`](crate::changelog::ChangelogConsumer).
#[derive(Clone)]
pub struct ChangelogClientConfig {
    /// Logical store whose change stream is consumed.
    pub store_name: String,
    /// Upper bound on the start-of-push scan when fetching a compression
    /// dictionary.
    pub dictionary_fetch_timeout: Duration,
    /// Factory for the short-lived readers used to fetch compression
    /// dictionaries. Required only when the store uses dictionary
    /// compression.
    pub dictionary_reader_factory: Option<PubSubReaderFactory>,
}

impl ChangelogClientConfig {
    pub fn new(store_name: impl Into<String>) -> Self {
        Self {
            store_name: store_name.into(),
            dictionary_fetch_timeout: Duration::from_millis(DEFAULT_DICTIONARY_FETCH_TIMEOUT_MS),
            dictionary_reader_factory: None,
        }
    }

    pub fn dictionary_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.dictionary_fetch_timeout = timeout;
        self
    }

    pub fn dictionary_reader_factory(mut self, factory: PubSubReaderFactory) -> Self {
        self.dictionary_reader_factory = Some(factory);
        self
    }

    /// Check the configuration before constructing a consumer.
    pub fn validate(&self) -> Result<()> {
        if self.store_name.is_empty() {
            return Err(ChangelogError::invalid_config(
                "store_name",
                "must not be empty",
            ));
        }
        if self.dictionary_fetch_timeout.is_zero() {
            return Err(ChangelogError::invalid_config(
                "dictionary_fetch_timeout",
                "must be positive",
            ));
        }
        Ok(())
    }
}

impl fmt::Debug for ChangelogClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChangelogClientConfig")
            .field("store_name", &self.store_name)
            .field("dictionary_fetch_timeout", &self.dictionary_fetch_timeout)
            .field(
                "dictionary_reader_factory",
                &self.dictionary_reader_factory.as_ref().map(|_| "<factory>"),
            )
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ChangelogClientConfig::new("orders");
        assert_eq!(config.store_name, "orders");
        assert_eq!(
            config.dictionary_fetch_timeout,
            Duration::from_millis(DEFAULT_DICTIONARY_FETCH_TIMEOUT_MS)
        );
        assert!(config.dictionary_reader_factory.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_store_name_rejected() {
        let config = ChangelogClientConfig::new("");
        assert!(matches!(
            config.validate(),
            Err(ChangelogError::InvalidConfig {
                field: "store_name",
                ..
            })
        ));
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let config = ChangelogClientConfig::new("orders").dictionary_fetch_timeout(Duration::ZERO);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_debug_does_not_require_factory_debug() {
        let config = ChangelogClientConfig::new("orders");
        let rendered = format!("{config:?}");
        assert!(rendered.contains("orders"));
    }
}
