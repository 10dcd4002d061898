//! Schema caching and value decoding.
//!
//! Schemas are immutable once the control plane returns them, so every
//! lookup is read-through cached for the consumer's lifetime. The decode
//! seam is [`ValueDecoder`]: the consumer is constructed with either the
//! specific decoder (caller-supplied concrete type) or the generic decoder
//! (dynamic JSON values) and never switches afterwards.

use std::marker::PhantomData;
use std::sync::Arc;

use dashmap::DashMap;
use once_cell::sync::OnceCell;
use serde::de::DeserializeOwned;

use crate::metadata::{MetadataClient, Schema};

use super::error::{ChangelogError, Result};
use super::event::parse_checkpoint_vector;

/// Decodes value bytes written under `writer` into a value readable at
/// `reader`.
pub trait ValueDecoder<T>: Send + Sync {
    fn decode(&self, bytes: &[u8], writer: &Schema, reader: &Schema) -> Result<T>;
}

/// Decoder for a caller-supplied concrete value type.
pub struct SpecificDecoder<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> SpecificDecoder<T> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for SpecificDecoder<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: DeserializeOwned> ValueDecoder<T> for SpecificDecoder<T> {
    fn decode(&self, bytes: &[u8], writer: &Schema, _reader: &Schema) -> Result<T> {
        serde_json::from_slice(bytes).map_err(|e| {
            ChangelogError::corrupt_payload(format!(
                "value does not match schema {}: {e}",
                writer.id
            ))
        })
    }
}

/// Decoder producing dynamic values, for callers without a compiled-in
/// value type.
pub struct GenericDecoder;

impl ValueDecoder<serde_json::Value> for GenericDecoder {
    fn decode(&self, bytes: &[u8], writer: &Schema, _reader: &Schema) -> Result<serde_json::Value> {
        serde_json::from_slice(bytes).map_err(|e| {
            ChangelogError::corrupt_payload(format!(
                "value does not match schema {}: {e}",
                writer.id
            ))
        })
    }
}

/// Read-through schema cache for one store.
pub struct SchemaRegistry {
    store: String,
    metadata: Arc<dyn MetadataClient>,
    key_schema: OnceCell<Schema>,
    latest_value_schema_id: OnceCell<i32>,
    value_schemas: DashMap<i32, Schema>,
    rmd_schemas: DashMap<i32, Schema>,
}

impl SchemaRegistry {
    pub fn new(store: impl Into<String>, metadata: Arc<dyn MetadataClient>) -> Self {
        Self {
            store: store.into(),
            metadata,
            key_schema: OnceCell::new(),
            latest_value_schema_id: OnceCell::new(),
            value_schemas: DashMap::new(),
            rmd_schemas: DashMap::new(),
        }
    }

    /// The store's key schema, fetched once.
    pub fn key_schema(&self) -> Result<Schema> {
        self.key_schema
            .get_or_try_init(|| {
                self.metadata
                    .key_schema(&self.store)
                    .map_err(|e| ChangelogError::metadata(&self.store, e))
            })
            .cloned()
    }

    pub fn value_schema(&self, id: i32) -> Result<Schema> {
        if let Some(schema) = self.value_schemas.get(&id) {
            return Ok(schema.value().clone());
        }
        let schema = self
            .metadata
            .value_schema(&self.store, id)
            .map_err(|e| ChangelogError::metadata(&self.store, e))?;
        self.value_schemas.insert(id, schema.clone());
        Ok(schema)
    }

    pub fn latest_value_schema_id(&self) -> Result<i32> {
        self.latest_value_schema_id
            .get_or_try_init(|| {
                self.metadata
                    .latest_value_schema_id(&self.store)
                    .map_err(|e| ChangelogError::metadata(&self.store, e))
            })
            .copied()
    }

    pub fn replication_metadata_schema(&self, rmd_version_id: i32) -> Result<Schema> {
        if let Some(schema) = self.rmd_schemas.get(&rmd_version_id) {
            return Ok(schema.value().clone());
        }
        let schema = self
            .metadata
            .replication_metadata_schema(&self.store, rmd_version_id)
            .map_err(|e| ChangelogError::metadata(&self.store, e))?;
        self.rmd_schemas.insert(rmd_version_id, schema.clone());
        Ok(schema)
    }

    /// Decode a record's replication-metadata payload into its checkpoint
    /// vector, resolving the metadata schema first.
    pub fn extract_offset_vector(&self, rmd_version_id: i32, payload: &[u8]) -> Result<Vec<i64>> {
        if rmd_version_id <= 0 || payload.is_empty() {
            return Ok(Vec::new());
        }
        // The schema lookup validates that the metadata version is known
        // before the payload is trusted.
        self.replication_metadata_schema(rmd_version_id)?;
        parse_checkpoint_vector(rmd_version_id, payload)
    }

    pub fn store(&self) -> &str {
        &self.store
    }
}

/// A resolved `(writer, reader)` schema pair bound to a decoder.
pub struct CachedDeserializer<T> {
    writer: Schema,
    reader: Schema,
    decoder: Arc<dyn ValueDecoder<T>>,
}

impl<T> CachedDeserializer<T> {
    pub(crate) fn new(writer: Schema, reader: Schema, decoder: Arc<dyn ValueDecoder<T>>) -> Self {
        Self {
            writer,
            reader,
            decoder,
        }
    }

    pub fn deserialize(&self, bytes: &[u8]) -> Result<T> {
        self.decoder.decode(bytes, &self.writer, &self.reader)
    }
}

/// Caches deserializers by `(writer_schema_id, reader_schema_id)`.
pub struct DeserializerCache<T> {
    schemas: Arc<SchemaRegistry>,
    decoder: Arc<dyn ValueDecoder<T>>,
    cache: DashMap<(i32, i32), Arc<CachedDeserializer<T>>>,
}

impl<T> DeserializerCache<T> {
    pub fn new(schemas: Arc<SchemaRegistry>, decoder: Arc<dyn ValueDecoder<T>>) -> Self {
        Self {
            schemas,
            decoder,
            cache: DashMap::new(),
        }
    }

    /// Resolve the deserializer for the given schema pair, caching it.
    pub fn deserializer(
        &self,
        writer_schema_id: i32,
        reader_schema_id: i32,
    ) -> Result<Arc<CachedDeserializer<T>>> {
        let key = (writer_schema_id, reader_schema_id);
        if let Some(deserializer) = self.cache.get(&key) {
            return Ok(Arc::clone(deserializer.value()));
        }
        let writer = self.schemas.value_schema(writer_schema_id)?;
        let reader = if reader_schema_id == writer_schema_id {
            writer.clone()
        } else {
            self.schemas.value_schema(reader_schema_id)?
        };
        let deserializer = Arc::new(CachedDeserializer {
            writer,
            reader,
            decoder: Arc::clone(&self.decoder),
        });
        self.cache.insert(key, Arc::clone(&deserializer));
        Ok(deserializer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{MetadataError, StoreInfo};
    use serde::Deserialize;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Metadata stub that counts lookups, to assert read-through caching.
    struct CountingMetadata {
        value_schema_calls: AtomicUsize,
    }

    impl CountingMetadata {
        fn new() -> Self {
            Self {
                value_schema_calls: AtomicUsize::new(0),
            }
        }
    }

    impl MetadataClient for CountingMetadata {
        fn get_store(&self, store: &str) -> std::result::Result<StoreInfo, MetadataError> {
            Err(MetadataError::store_not_found(store))
        }

        fn key_schema(&self, _store: &str) -> std::result::Result<Schema, MetadataError> {
            Ok(Schema::new(1, r#"{"type":"string"}"#))
        }

        fn value_schema(
            &self,
            _store: &str,
            id: i32,
        ) -> std::result::Result<Schema, MetadataError> {
            self.value_schema_calls.fetch_add(1, Ordering::SeqCst);
            Ok(Schema::new(id, r#"{"type":"record"}"#))
        }

        fn latest_value_schema_id(&self, _store: &str) -> std::result::Result<i32, MetadataError> {
            Ok(7)
        }

        fn replication_metadata_schema(
            &self,
            store: &str,
            rmd_version_id: i32,
        ) -> std::result::Result<Schema, MetadataError> {
            if rmd_version_id == 1 {
                Ok(Schema::new(1, r#"{"type":"rmd"}"#))
            } else {
                Err(MetadataError::schema_not_found(store, rmd_version_id))
            }
        }
    }

    fn registry() -> Arc<SchemaRegistry> {
        Arc::new(SchemaRegistry::new(
            "orders",
            Arc::new(CountingMetadata::new()),
        ))
    }

    #[test]
    fn test_value_schema_is_cached() {
        let metadata = Arc::new(CountingMetadata::new());
        let registry = SchemaRegistry::new("orders", metadata.clone());

        registry.value_schema(7).unwrap();
        registry.value_schema(7).unwrap();
        registry.value_schema(8).unwrap();

        assert_eq!(metadata.value_schema_calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_key_schema_fetched_once() {
        let registry = registry();
        let a = registry.key_schema().unwrap();
        let b = registry.key_schema().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_extract_offset_vector_requires_known_schema() {
        let registry = registry();
        let payload = crate::changelog::event::encode_checkpoint_vector(&[4, 2]);

        assert_eq!(registry.extract_offset_vector(1, &payload).unwrap(), vec![4, 2]);
        assert!(registry.extract_offset_vector(9, &payload).is_err());
        assert!(registry.extract_offset_vector(0, &payload).unwrap().is_empty());
    }

    #[test]
    fn test_deserializer_cache_reuses_entries() {
        let metadata = Arc::new(CountingMetadata::new());
        let schemas = Arc::new(SchemaRegistry::new("orders", metadata.clone()));
        let cache: DeserializerCache<serde_json::Value> =
            DeserializerCache::new(schemas, Arc::new(GenericDecoder));

        let a = cache.deserializer(7, 7).unwrap();
        let b = cache.deserializer(7, 7).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        // writer == reader resolves the schema a single time
        assert_eq!(metadata.value_schema_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_specific_decoder_decodes_typed_values() {
        #[derive(Debug, Deserialize, PartialEq)]
        struct Order {
            id: u64,
            sku: String,
        }

        let decoder: SpecificDecoder<Order> = SpecificDecoder::new();
        let schema = Schema::new(7, r#"{"type":"record"}"#);
        let decoded = decoder
            .decode(br#"{"id":9,"sku":"ab-1"}"#, &schema, &schema)
            .unwrap();
        assert_eq!(
            decoded,
            Order {
                id: 9,
                sku: "ab-1".to_string()
            }
        );
    }

    #[test]
    fn test_specific_decoder_surfaces_mismatch() {
        #[derive(Debug, Deserialize)]
        struct Order {
            #[allow(dead_code)]
            id: u64,
        }

        let decoder: SpecificDecoder<Order> = SpecificDecoder::new();
        let schema = Schema::new(7, r#"{"type":"record"}"#);
        assert!(decoder.decode(b"not json", &schema, &schema).is_err());
    }

    #[test]
    fn test_generic_decoder_produces_dynamic_values() {
        let schema = Schema::new(7, r#"{"type":"record"}"#);
        let value = GenericDecoder
            .decode(br#"{"any":"shape"}"#, &schema, &schema)
            .unwrap();
        assert_eq!(value["any"], "shape");
    }
}
