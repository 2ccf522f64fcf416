//! Vector store capability.
//!
//! The orchestrator only ever talks to the store through
//! [`StoreConnection`]: existence checks, object CRUD, semantic search,
//! aggregation and cross-references. The HTTP adapter lives in
//! `store::http`; tests use an in-memory implementation.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;
use crate::events::JsonObject;

/// Prefix of the per-collection metadata collections written by the
/// offline preprocessing job.
pub const METADATA_COLLECTION_PREFIX: &str = "ARBOR_METADATA_";

/// Suffix of the per-collection metadata collections.
pub const METADATA_COLLECTION_SUFFIX: &str = "__";

/// An object as stored, with its store-assigned id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredObject {
    pub uuid: String,
    pub properties: JsonObject,
}

/// A filter over object properties.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Filter {
    Equal { property: String, value: Value },
    ContainsAny { property: String, values: Vec<Value> },
    AllOf { filters: Vec<Filter> },
}

impl Filter {
    /// Evaluate the filter against one object's properties.
    pub fn matches(&self, properties: &JsonObject) -> bool {
        match self {
            Filter::Equal { property, value } => properties.get(property) == Some(value),
            Filter::ContainsAny { property, values } => match properties.get(property) {
                Some(Value::Array(items)) => values.iter().any(|v| items.contains(v)),
                Some(single) => values.iter().any(|v| v == single),
                None => false,
            },
            Filter::AllOf { filters } => filters.iter().all(|f| f.matches(properties)),
        }
    }
}

/// A semantic search request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NearTextQuery {
    pub collection: String,
    pub query: String,
    pub limit: usize,
    /// Minimum similarity certainty in `[0, 1]`.
    pub certainty: Option<f64>,
    pub filters: Option<Filter>,
}

/// An aggregation request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregateRequest {
    pub collection: String,
    pub group_by: Option<String>,
    pub filters: Option<Filter>,
}

/// Aggregation output: a total count and optional per-group rows.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AggregateResult {
    pub total_count: u64,
    pub groups: Vec<JsonObject>,
}

/// Preprocessed metadata describing one collection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CollectionMetadata {
    pub name: String,
    /// Natural-language summary written by the preprocessing job.
    #[serde(default)]
    pub summary: String,
    /// Per-field statistics and type information.
    #[serde(default)]
    pub fields: JsonObject,
    /// Catalog of frontend mappings: return type -> (frontend key -> field).
    #[serde(default)]
    pub mappings: BTreeMap<String, BTreeMap<String, String>>,
    #[serde(default)]
    pub named_vectors: Vec<String>,
    #[serde(default)]
    pub vectorizer: Option<String>,
    /// Index flags (filterable/searchable properties and similar).
    #[serde(default)]
    pub index_properties: JsonObject,
}

impl CollectionMetadata {
    /// The metadata without the mapping catalog, as shown to the LM.
    pub fn schema_json(&self) -> Value {
        let mut value = serde_json::to_value(self).unwrap_or_default();
        if let Some(map) = value.as_object_mut() {
            map.remove("mappings");
        }
        value
    }
}

/// Outcome of resolving one collection name.
#[derive(Debug, Clone)]
pub enum MetadataLookup {
    Found(Box<CollectionMetadata>),
    /// The collection exists but was never preprocessed.
    Unpreprocessed,
    /// No such collection in the store.
    Nonexistent,
}

/// A capability handle to the vector store.
#[async_trait]
pub trait StoreConnection: Send + Sync {
    /// Cheap liveness/auth probe.
    async fn ready(&self) -> Result<()>;

    async fn collection_exists(&self, name: &str) -> Result<bool>;

    /// Names of all user collections (internal bookkeeping collections
    /// are excluded).
    async fn list_collections(&self) -> Result<Vec<String>>;

    /// Create a collection with text properties.
    async fn create_collection(&self, name: &str, properties: &[&str]) -> Result<()>;

    async fn fetch_objects(&self, collection: &str, limit: usize) -> Result<Vec<StoredObject>>;

    async fn fetch_object(&self, collection: &str, id: &str) -> Result<Option<StoredObject>>;

    async fn insert(&self, collection: &str, id: &str, properties: &JsonObject) -> Result<()>;

    async fn update(&self, collection: &str, id: &str, properties: &JsonObject) -> Result<()>;

    async fn delete(&self, collection: &str, id: &str) -> Result<()>;

    /// Add a cross-reference between two objects.
    async fn add_reference(
        &self,
        collection: &str,
        from_id: &str,
        property: &str,
        to_collection: &str,
        to_id: &str,
    ) -> Result<()>;

    /// Semantic search. Fails with `StoreQuery` on non-vectorised collections.
    async fn near_text(&self, query: &NearTextQuery) -> Result<Vec<StoredObject>>;

    async fn aggregate(&self, request: &AggregateRequest) -> Result<AggregateResult>;
}

/// The name of the metadata collection backing `collection`.
pub fn metadata_collection_name(collection: &str) -> String {
    format!(
        "{}{}{}",
        METADATA_COLLECTION_PREFIX,
        collection.to_lowercase(),
        METADATA_COLLECTION_SUFFIX
    )
}

/// Resolve one collection's preprocessed metadata.
pub async fn fetch_collection_metadata(
    conn: &dyn StoreConnection,
    collection: &str,
) -> Result<MetadataLookup> {
    if !conn.collection_exists(&collection.to_lowercase()).await? {
        return Ok(MetadataLookup::Nonexistent);
    }
    let metadata_name = metadata_collection_name(collection);
    if !conn.collection_exists(&metadata_name).await? {
        return Ok(MetadataLookup::Unpreprocessed);
    }
    let objects = conn.fetch_objects(&metadata_name, 1).await?;
    let Some(object) = objects.into_iter().next() else {
        return Ok(MetadataLookup::Unpreprocessed);
    };
    let mut metadata: CollectionMetadata =
        serde_json::from_value(Value::Object(object.properties))?;
    if metadata.name.is_empty() {
        metadata.name = collection.to_string();
    }
    Ok(MetadataLookup::Found(Box::new(metadata)))
}
