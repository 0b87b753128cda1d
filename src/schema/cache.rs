//! Per-subscription schema cache.

use std::collections::HashMap;
use std::sync::Arc;

use apache_avro::Schema;
use tracing::{info, warn};

use super::{SchemaRef, SchemaResolver};

/// Schemas seen by one subscription, keyed by schema id.
///
/// The topic schema is resolved once at setup. Events written with another
/// schema id are resolved on first sight; a failed lookup is remembered so
/// the resolver is asked at most once per id for the stream's lifetime.
/// Such events decode schema-less until their own schema is known.
pub struct SchemaCache {
    resolver: Option<Arc<dyn SchemaResolver>>,
    topic_schema: Option<SchemaRef>,
    by_id: HashMap<String, Option<Arc<Schema>>>,
}

impl SchemaCache {
    pub fn new(resolver: Option<Arc<dyn SchemaResolver>>) -> Self {
        Self {
            resolver,
            topic_schema: None,
            by_id: HashMap::new(),
        }
    }

    /// Seed the cache with a known schema (e.g. supplied by the caller).
    pub fn with_schema(mut self, schema: SchemaRef) -> Self {
        self.by_id
            .insert(schema.schema_id.clone(), schema.definition.clone());
        if self.topic_schema.is_none() {
            self.topic_schema = Some(schema);
        }
        self
    }

    /// Resolve the topic's current schema. Non-fatal on failure.
    pub async fn load_topic(&mut self, topic: &str) {
        let Some(resolver) = self.resolver.clone() else {
            return;
        };

        match resolver.resolve_topic(topic).await {
            Ok(schema) => {
                info!(
                    topic = %topic,
                    schema_id = %schema.schema_id,
                    has_definition = schema.definition.is_some(),
                    "Resolved topic schema"
                );
                self.by_id
                    .insert(schema.schema_id.clone(), schema.definition.clone());
                self.topic_schema = Some(schema);
            }
            Err(e) => {
                warn!(
                    topic = %topic,
                    error = %e,
                    "Topic schema unavailable, decoding schema-less"
                );
            }
        }
    }

    /// The topic schema, if one was resolved.
    pub fn topic_schema(&self) -> Option<&SchemaRef> {
        self.topic_schema.as_ref()
    }

    /// Schema to decode an event written with `schema_id`.
    ///
    /// Empty ids, and the topic schema's own id, use the topic schema. Any
    /// other id must resolve to its own definition; `None` means decode
    /// schema-less, never against a different schema.
    pub async fn schema_for(&mut self, schema_id: &str) -> Option<Arc<Schema>> {
        if schema_id.is_empty() || self.is_topic_schema(schema_id) {
            return self.topic_definition();
        }

        if let Some(cached) = self.by_id.get(schema_id) {
            return cached.clone();
        }

        let resolver = self.resolver.clone()?;
        let definition = match resolver.schema_definition(schema_id).await {
            Ok(schema) => {
                info!(schema_id = %schema_id, "Resolved event schema");
                schema.definition
            }
            Err(e) => {
                warn!(
                    schema_id = %schema_id,
                    error = %e,
                    "Event schema unavailable, decoding schema-less"
                );
                None
            }
        };
        self.by_id.insert(schema_id.to_string(), definition.clone());
        definition
    }

    fn is_topic_schema(&self, schema_id: &str) -> bool {
        self.topic_schema
            .as_ref()
            .is_some_and(|s| s.schema_id == schema_id)
    }

    fn topic_definition(&self) -> Option<Arc<Schema>> {
        self.topic_schema
            .as_ref()
            .and_then(|s| s.definition.clone())
    }
}
