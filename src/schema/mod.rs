//! Topic and schema lookup.
//!
//! Schema resolution is best-effort: every failure here is logged and the
//! affected events fall back to schema-less decoding.

mod cache;

pub use cache::SchemaCache;

use std::collections::HashMap;
use std::sync::Arc;

use apache_avro::Schema;
use async_trait::async_trait;
use tonic::Status;
use tracing::debug;

use crate::proto::pub_sub_client::PubSubClient;
use crate::proto::{SchemaRequest, TopicRequest};
use crate::transport::BusChannel;

/// Result type for schema lookups.
pub type Result<T> = std::result::Result<T, SchemaError>;

/// Errors that can occur during schema lookups.
#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    #[error("gRPC error: {0}")]
    Grpc(Box<Status>),

    #[error("topic '{topic}' has no schema id")]
    MissingSchemaId { topic: String },

    #[error("schema '{schema_id}' not found")]
    NotFound { schema_id: String },

    #[error("schema '{schema_id}' is not a valid Avro schema: {message}")]
    InvalidSchema { schema_id: String, message: String },
}

impl From<Status> for SchemaError {
    fn from(status: Status) -> Self {
        SchemaError::Grpc(Box::new(status))
    }
}

/// A schema identifier and, when known, its parsed definition.
///
/// A missing definition forces schema-less decoding.
#[derive(Debug, Clone)]
pub struct SchemaRef {
    pub schema_id: String,
    pub definition: Option<Arc<Schema>>,
}

impl SchemaRef {
    /// Parse an Avro schema document. An empty document yields no definition.
    pub fn parse(schema_id: impl Into<String>, schema_json: &str) -> Result<Self> {
        let schema_id = schema_id.into();
        if schema_json.trim().is_empty() {
            return Ok(Self {
                schema_id,
                definition: None,
            });
        }
        let schema = Schema::parse_str(schema_json).map_err(|e| SchemaError::InvalidSchema {
            schema_id: schema_id.clone(),
            message: e.to_string(),
        })?;
        Ok(Self {
            schema_id,
            definition: Some(Arc::new(schema)),
        })
    }
}

/// Topic metadata and schema definitions, served by the bus.
#[async_trait]
pub trait SchemaResolver: Send + Sync {
    /// Schema identifier currently attached to `topic`.
    async fn topic_schema_id(&self, topic: &str) -> Result<String>;

    /// Schema definition for `schema_id`.
    async fn schema_definition(&self, schema_id: &str) -> Result<SchemaRef>;

    /// Topic metadata lookup followed by schema lookup.
    async fn resolve_topic(&self, topic: &str) -> Result<SchemaRef> {
        let schema_id = self.topic_schema_id(topic).await?;
        self.schema_definition(&schema_id).await
    }
}

/// Resolver backed by the bus `GetTopic` / `GetSchema` calls.
#[derive(Clone)]
pub struct GrpcSchemaResolver {
    client: PubSubClient<BusChannel>,
}

impl GrpcSchemaResolver {
    pub fn new(channel: BusChannel) -> Self {
        Self {
            client: PubSubClient::new(channel),
        }
    }
}

#[async_trait]
impl SchemaResolver for GrpcSchemaResolver {
    async fn topic_schema_id(&self, topic: &str) -> Result<String> {
        let info = self
            .client
            .clone()
            .get_topic(TopicRequest {
                topic_name: topic.to_string(),
            })
            .await?
            .into_inner();

        debug!(
            topic = %topic,
            schema_id = %info.schema_id,
            rpc_id = %info.rpc_id,
            can_subscribe = info.can_subscribe,
            "Fetched topic info"
        );

        if info.schema_id.is_empty() {
            return Err(SchemaError::MissingSchemaId {
                topic: topic.to_string(),
            });
        }
        Ok(info.schema_id)
    }

    async fn schema_definition(&self, schema_id: &str) -> Result<SchemaRef> {
        let info = self
            .client
            .clone()
            .get_schema(SchemaRequest {
                schema_id: schema_id.to_string(),
            })
            .await
            .map_err(|status| match status.code() {
                tonic::Code::NotFound => SchemaError::NotFound {
                    schema_id: schema_id.to_string(),
                },
                _ => SchemaError::from(status),
            })?
            .into_inner();

        debug!(schema_id = %schema_id, rpc_id = %info.rpc_id, "Fetched schema");
        SchemaRef::parse(schema_id, &info.schema_json)
    }
}

/// Resolver over schemas registered up front (no network).
#[derive(Debug, Clone, Default)]
pub struct StaticSchemaResolver {
    topics: HashMap<String, String>,
    schemas: HashMap<String, String>,
}

impl StaticSchemaResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an Avro schema document and bind it to `topic`.
    pub fn with_topic(
        mut self,
        topic: impl Into<String>,
        schema_id: impl Into<String>,
        schema_json: impl Into<String>,
    ) -> Self {
        let schema_id = schema_id.into();
        self.topics.insert(topic.into(), schema_id.clone());
        self.schemas.insert(schema_id, schema_json.into());
        self
    }

    /// Register an Avro schema document not bound to any topic.
    pub fn with_schema(
        mut self,
        schema_id: impl Into<String>,
        schema_json: impl Into<String>,
    ) -> Self {
        self.schemas.insert(schema_id.into(), schema_json.into());
        self
    }
}

#[async_trait]
impl SchemaResolver for StaticSchemaResolver {
    async fn topic_schema_id(&self, topic: &str) -> Result<String> {
        self.topics
            .get(topic)
            .cloned()
            .ok_or_else(|| SchemaError::MissingSchemaId {
                topic: topic.to_string(),
            })
    }

    async fn schema_definition(&self, schema_id: &str) -> Result<SchemaRef> {
        let json = self
            .schemas
            .get(schema_id)
            .ok_or_else(|| SchemaError::NotFound {
                schema_id: schema_id.to_string(),
            })?;
        SchemaRef::parse(schema_id, json)
    }
}
