//! Shared test doubles: a scripted LM and an in-memory store.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::config::Settings;
use crate::core::lm::{CompletionRequest, FieldKind, LmClient, LmHandle, LmUsage, StructuredOutput};
use crate::core::store::{
    AggregateRequest, AggregateResult, NearTextQuery, StoreConnection, StoredObject,
};
use crate::error::Result;
use crate::events::JsonObject;
use crate::tools::ToolContext;
use crate::tree::data::{Persona, TreeData};

// ---------------------------------------------------------------------------
// Scripted LM
// ---------------------------------------------------------------------------

/// One scripted model output. Declared output fields absent from the
/// script are filled with defaults for their kind, so tests only state
/// what they care about.
#[derive(Debug, Clone)]
pub struct ScriptedOutput(pub Map<String, Value>);

impl ScriptedOutput {
    pub fn new(pairs: &[(&str, Value)]) -> Self {
        ScriptedOutput(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
        )
    }
}

pub struct ScriptedLm {
    outputs: Mutex<VecDeque<Map<String, Value>>>,
}

impl ScriptedLm {
    pub fn new(outputs: Vec<ScriptedOutput>) -> Self {
        ScriptedLm {
            outputs: Mutex::new(outputs.into_iter().map(|o| o.0).collect()),
        }
    }
}

#[async_trait]
impl LmClient for ScriptedLm {
    fn model(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<(StructuredOutput, LmUsage)> {
        let mut fields = self
            .outputs
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_default();
        for spec in &request.outputs {
            fields.entry(spec.name.clone()).or_insert(match spec.kind {
                FieldKind::Text => Value::String(String::new()),
                FieldKind::Bool => Value::Bool(false),
                FieldKind::Json => Value::Object(Map::new()),
            });
        }
        Ok((StructuredOutput(fields), LmUsage::new("scripted", 10, 5)))
    }
}

/// An [`LmHandle`] over a scripted model.
pub fn scripted_lm(outputs: Vec<ScriptedOutput>) -> LmHandle {
    LmHandle::new(Arc::new(ScriptedLm::new(outputs)))
}

/// A tool context with default tree data and a scripted base LM.
pub fn scripted_context(outputs: Vec<ScriptedOutput>) -> ToolContext {
    ToolContext {
        tree_data: TreeData::new(Persona::default(), Settings::default()),
        base_lm: scripted_lm(outputs),
        complex_lm: scripted_lm(vec![]),
        pool: None,
    }
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MemoryStoreInner {
    // collection -> (id, properties) in insertion order
    collections: BTreeMap<String, Vec<(String, JsonObject)>>,
}

/// In-memory [`StoreConnection`] with just enough behaviour for tests:
/// CRUD, filter-aware search (similarity is ignored) and counting.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemoryStoreInner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_raw_collection(&self, name: &str) {
        self.inner
            .lock()
            .unwrap()
            .collections
            .entry(name.to_string())
            .or_default();
    }

    pub fn insert_raw(&self, collection: &str, id: &str, properties: Value) {
        let properties = properties.as_object().cloned().unwrap_or_default();
        let mut inner = self.inner.lock().unwrap();
        let objects = inner.collections.entry(collection.to_string()).or_default();
        objects.push((id.to_string(), properties));
    }

    /// Create a collection plus the preprocessed metadata record the
    /// engine looks for.
    pub fn seed_preprocessed(&self, name: &str, summary: &str) {
        self.create_raw_collection(&name.to_lowercase());
        let metadata_collection = crate::core::store::metadata_collection_name(name);
        self.insert_raw(
            &metadata_collection,
            "metadata",
            serde_json::json!({
                "name": name,
                "summary": summary,
                "fields": {},
                "mappings": {"table": {"column": "field"}},
            }),
        );
    }
}

#[async_trait]
impl StoreConnection for MemoryStore {
    async fn ready(&self) -> Result<()> {
        Ok(())
    }

    async fn collection_exists(&self, name: &str) -> Result<bool> {
        Ok(self.inner.lock().unwrap().collections.contains_key(name))
    }

    async fn list_collections(&self) -> Result<Vec<String>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .collections
            .keys()
            .filter(|name| !name.starts_with("ARBOR_"))
            .cloned()
            .collect())
    }

    async fn create_collection(&self, name: &str, _properties: &[&str]) -> Result<()> {
        self.create_raw_collection(name);
        Ok(())
    }

    async fn fetch_objects(&self, collection: &str, limit: usize) -> Result<Vec<StoredObject>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .collections
            .get(collection)
            .map(|objects| {
                objects
                    .iter()
                    .take(limit)
                    .map(|(id, properties)| StoredObject {
                        uuid: id.clone(),
                        properties: properties.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn fetch_object(&self, collection: &str, id: &str) -> Result<Option<StoredObject>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .collections
            .get(collection)
            .and_then(|objects| objects.iter().find(|(oid, _)| oid == id))
            .map(|(oid, properties)| StoredObject {
                uuid: oid.clone(),
                properties: properties.clone(),
            }))
    }

    async fn insert(&self, collection: &str, id: &str, properties: &JsonObject) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let objects = inner.collections.entry(collection.to_string()).or_default();
        objects.push((id.to_string(), properties.clone()));
        Ok(())
    }

    async fn update(&self, collection: &str, id: &str, properties: &JsonObject) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let objects = inner.collections.entry(collection.to_string()).or_default();
        match objects.iter_mut().find(|(oid, _)| oid == id) {
            Some((_, existing)) => *existing = properties.clone(),
            None => objects.push((id.to_string(), properties.clone())),
        }
        Ok(())
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<()> {
        if let Some(objects) = self.inner.lock().unwrap().collections.get_mut(collection) {
            objects.retain(|(oid, _)| oid != id);
        }
        Ok(())
    }

    async fn add_reference(
        &self,
        _collection: &str,
        _from_id: &str,
        _property: &str,
        _to_collection: &str,
        _to_id: &str,
    ) -> Result<()> {
        Ok(())
    }

    async fn near_text(&self, query: &NearTextQuery) -> Result<Vec<StoredObject>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .collections
            .get(&query.collection)
            .map(|objects| {
                objects
                    .iter()
                    .filter(|(_, properties)| {
                        query
                            .filters
                            .as_ref()
                            .map(|f| f.matches(properties))
                            .unwrap_or(true)
                    })
                    .take(query.limit)
                    .map(|(id, properties)| StoredObject {
                        uuid: id.clone(),
                        properties: properties.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn aggregate(&self, request: &AggregateRequest) -> Result<AggregateResult> {
        let inner = self.inner.lock().unwrap();
        let objects = inner
            .collections
            .get(&request.collection)
            .cloned()
            .unwrap_or_default();
        let matching: Vec<_> = objects
            .iter()
            .filter(|(_, properties)| {
                request
                    .filters
                    .as_ref()
                    .map(|f| f.matches(properties))
                    .unwrap_or(true)
            })
            .collect();

        let mut result = AggregateResult {
            total_count: matching.len() as u64,
            groups: Vec::new(),
        };
        if let Some(group_by) = &request.group_by {
            let mut counts: BTreeMap<String, u64> = BTreeMap::new();
            for (_, properties) in &matching {
                let key = properties
                    .get(group_by)
                    .map(|v| v.to_string())
                    .unwrap_or_default();
                *counts.entry(key).or_default() += 1;
            }
            for (value, count) in counts {
                let mut group = Map::new();
                group.insert("value".into(), Value::String(value));
                group.insert("count".into(), serde_json::json!(count));
                result.groups.push(group);
            }
        }
        Ok(result)
    }
}
