//! The environment: cross-turn memory of tool outputs.
//!
//! Outputs are keyed `tool name -> result name -> ordered blocks`. Every
//! stored object carries a stable `_REF_ID` of the form
//! `{tool}_{name}_{block}_{index}` so later prompts and citations can
//! point back at it. Duplicate objects are stored as placeholders naming
//! the original ref id instead of repeating the payload.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::events::{JsonObject, ResultEvent, REF_ID_KEY};

/// Reserved tool slot holding the static self-description.
pub const SELF_INFO_TOOL: &str = "SelfInfo";

/// Reserved result name under [`SELF_INFO_TOOL`].
pub const SELF_INFO_NAME: &str = "generic";

const SELF_INFO_PURPOSE: &str = "Arbor is an agentic retrieval augmented generation (RAG) \
service. Users ask questions in natural language and the assistant retrieves the most \
relevant information from preprocessed collections in a vector store, via semantic search, \
keyword search, filtering, sorting and aggregation, then answers with summaries and textual \
responses. Retrieved objects are displayed dynamically in the frontend. Arbor works via a \
tree-based approach: decision nodes choose the next action through a decision agent, and each \
leaf of the tree is a tool that performs a specific task such as retrieval, aggregation or \
text generation. The decision agent sees the conversation history, previously retrieved \
objects, the user's original question and its own prior reasoning at every step.";

/// One appended result: its metadata and its stored objects in order.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ResultBlock {
    pub metadata: JsonObject,
    pub objects: Vec<JsonObject>,
}

/// Opaque inter-tool handoff storage, never shown to the LM.
///
/// Shared between the tree and in-flight tool invocations, so tools can
/// leave work for each other (e.g. items queued for summarisation).
#[derive(Debug, Clone, Default)]
pub struct HiddenEnvironment(Arc<Mutex<BTreeMap<String, Value>>>);

impl HiddenEnvironment {
    pub fn insert(&self, key: impl Into<String>, value: Value) {
        self.0
            .lock()
            .expect("hidden environment lock poisoned")
            .insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.0
            .lock()
            .expect("hidden environment lock poisoned")
            .get(key)
            .cloned()
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        self.0
            .lock()
            .expect("hidden environment lock poisoned")
            .remove(key)
    }

    pub fn snapshot(&self) -> BTreeMap<String, Value> {
        self.0
            .lock()
            .expect("hidden environment lock poisoned")
            .clone()
    }
}

impl Serialize for HiddenEnvironment {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.snapshot().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for HiddenEnvironment {
    fn deserialize<D: Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Self, D::Error> {
        let map = BTreeMap::<String, Value>::deserialize(deserializer)?;
        Ok(HiddenEnvironment(Arc::new(Mutex::new(map))))
    }
}

/// Accumulator of tool outputs, keyed for later prompting and citation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Environment {
    store: BTreeMap<String, BTreeMap<String, Vec<ResultBlock>>>,
    #[serde(default)]
    pub hidden: HiddenEnvironment,
}

impl Default for Environment {
    fn default() -> Self {
        Self::new()
    }
}

impl Environment {
    /// An environment with the self-info slot preloaded.
    pub fn new() -> Self {
        let mut env = Environment {
            store: BTreeMap::new(),
            hidden: HiddenEnvironment::default(),
        };
        let mut info = Map::new();
        info.insert("name".into(), Value::String("Arbor".into()));
        info.insert(
            "description".into(),
            Value::String("An agentic RAG service over a vector store.".into()),
        );
        info.insert("purpose".into(), Value::String(SELF_INFO_PURPOSE.into()));
        env.store.entry(SELF_INFO_TOOL.into()).or_default().insert(
            SELF_INFO_NAME.into(),
            vec![ResultBlock {
                metadata: Map::new(),
                objects: vec![info],
            }],
        );
        env
    }

    /// Assign `_REF_ID`s to objects that do not carry one yet, as if they
    /// were about to be appended as the next block under `(tool, name)`.
    pub fn assign_ref_ids(&self, tool: &str, name: &str, objects: &mut [JsonObject]) {
        let block_index = self
            .store
            .get(tool)
            .and_then(|names| names.get(name))
            .map(Vec::len)
            .unwrap_or(0);
        for (i, obj) in objects.iter_mut().enumerate() {
            if !obj.contains_key(REF_ID_KEY) {
                obj.insert(
                    REF_ID_KEY.into(),
                    Value::String(ref_id(tool, name, block_index, i)),
                );
            }
        }
    }

    /// Append a result under its tool. Results with zero objects are a
    /// no-op. A duplicate of an already-stored object (compared with the
    /// ref id excluded) becomes a placeholder naming the original ref id.
    pub fn add(&mut self, tool: &str, result: &ResultEvent) {
        if result.objects.is_empty() {
            return;
        }

        let mut objects = result.objects.clone();
        self.assign_ref_ids(tool, &result.name, &mut objects);

        let blocks = self
            .store
            .entry(tool.to_string())
            .or_default()
            .entry(result.name.clone())
            .or_default();

        let mut block = ResultBlock {
            metadata: result.metadata.clone(),
            objects: Vec::with_capacity(objects.len()),
        };

        for obj in objects {
            let existing_ref = blocks
                .iter()
                .chain(std::iter::once(&block))
                .flat_map(|b| b.objects.iter())
                .find(|stored| objects_equal_ignoring_ref(stored, &obj))
                .and_then(|stored| stored.get(REF_ID_KEY))
                .and_then(Value::as_str)
                .map(str::to_string);

            match existing_ref {
                Some(ref_id) => {
                    let mut placeholder = Map::new();
                    placeholder.insert(
                        "object_info".into(),
                        Value::String(format!(
                            "This object is a repeat of {}, so properties are omitted.",
                            ref_id
                        )),
                    );
                    block.objects.push(placeholder);
                }
                None => block.objects.push(obj),
            }
        }

        blocks.push(block);
    }

    /// All blocks stored under `(tool, name)`.
    pub fn find(&self, tool: &str, name: &str) -> Option<&Vec<ResultBlock>> {
        self.store.get(tool).and_then(|names| names.get(name))
    }

    /// One block stored under `(tool, name)`.
    pub fn find_at(&self, tool: &str, name: &str, index: usize) -> Option<&ResultBlock> {
        self.find(tool, name).and_then(|blocks| blocks.get(index))
    }

    /// Overwrite a block's object list, re-assigning ref ids from the
    /// block's position. Targets the last block when `index` is `None`.
    pub fn replace(
        &mut self,
        tool: &str,
        name: &str,
        mut objects: Vec<JsonObject>,
        index: Option<usize>,
    ) -> bool {
        let Some(blocks) = self.store.get_mut(tool).and_then(|n| n.get_mut(name)) else {
            return false;
        };
        let block_index = match index {
            Some(i) => i,
            None => match blocks.len().checked_sub(1) {
                Some(i) => i,
                None => return false,
            },
        };
        let Some(block) = blocks.get_mut(block_index) else {
            return false;
        };
        for (i, obj) in objects.iter_mut().enumerate() {
            obj.insert(
                REF_ID_KEY.into(),
                Value::String(ref_id(tool, name, block_index, i)),
            );
        }
        block.objects = objects;
        true
    }

    /// Remove one block, or every block under `(tool, name)`.
    pub fn remove(&mut self, tool: &str, name: &str, index: Option<usize>) -> bool {
        let Some(names) = self.store.get_mut(tool) else {
            return false;
        };
        let removed = match index {
            Some(i) => match names.get_mut(name) {
                Some(blocks) if i < blocks.len() => {
                    blocks.remove(i);
                    true
                }
                _ => false,
            },
            None => names.remove(name).is_some(),
        };
        if names.get(name).map(Vec::is_empty).unwrap_or(false) {
            names.remove(name);
        }
        if names.is_empty() {
            self.store.remove(tool);
        }
        removed
    }

    /// True iff no user-tool entries exist (the self-info slot is ignored).
    pub fn is_empty(&self) -> bool {
        self.store.keys().all(|tool| tool == SELF_INFO_TOOL)
    }

    /// The full environment as shown to the LM.
    pub fn to_json(&self) -> Value {
        serde_json::to_value(&self.store).unwrap_or_default()
    }
}

fn ref_id(tool: &str, name: &str, block: usize, index: usize) -> String {
    format!("{}_{}_{}_{}", tool, name, block, index)
}

fn objects_equal_ignoring_ref(a: &JsonObject, b: &JsonObject) -> bool {
    let strip = |obj: &JsonObject| {
        obj.iter()
            .filter(|(k, _)| k.as_str() != REF_ID_KEY)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect::<BTreeMap<_, _>>()
    };
    strip(a) == strip(b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(pairs: &[(&str, Value)]) -> JsonObject {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn result(name: &str, objects: Vec<JsonObject>) -> ResultEvent {
        ResultEvent::new(objects).with_name(name)
    }

    #[test]
    fn test_new_environment_is_empty_but_has_self_info() {
        let env = Environment::new();
        assert!(env.is_empty());
        let blocks = env.find(SELF_INFO_TOOL, SELF_INFO_NAME).unwrap();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].objects[0]["name"], json!("Arbor"));
    }

    #[test]
    fn test_add_assigns_sequential_ref_ids() {
        let mut env = Environment::new();
        env.add(
            "query",
            &result("products", vec![obj(&[("a", json!(1))]), obj(&[("b", json!(2))])]),
        );
        env.add("query", &result("products", vec![obj(&[("c", json!(3))])]));

        let blocks = env.find("query", "products").unwrap();
        assert_eq!(blocks[0].objects[0][REF_ID_KEY], json!("query_products_0_0"));
        assert_eq!(blocks[0].objects[1][REF_ID_KEY], json!("query_products_0_1"));
        assert_eq!(blocks[1].objects[0][REF_ID_KEY], json!("query_products_1_0"));
        assert!(!env.is_empty());
    }

    #[test]
    fn test_ref_ids_are_unique_across_lifetime() {
        let mut env = Environment::new();
        for i in 0..5 {
            env.add("query", &result("items", vec![obj(&[("n", json!(i))])]));
        }
        let mut seen = std::collections::HashSet::new();
        for block in env.find("query", "items").unwrap() {
            for object in &block.objects {
                let ref_id = object[REF_ID_KEY].as_str().unwrap().to_string();
                assert!(seen.insert(ref_id));
            }
        }
        assert_eq!(seen.len(), 5);
    }

    #[test]
    fn test_empty_result_is_a_no_op() {
        let mut env = Environment::new();
        env.add("query", &result("products", vec![]));
        assert!(env.find("query", "products").is_none());
        assert!(env.is_empty());
    }

    #[test]
    fn test_duplicate_object_becomes_placeholder() {
        let mut env = Environment::new();
        let payload = obj(&[("title", json!("hello")), ("body", json!("world"))]);
        env.add("query", &result("docs", vec![payload.clone()]));
        env.add("query", &result("docs", vec![payload]));

        let blocks = env.find("query", "docs").unwrap();
        assert_eq!(blocks.len(), 2);
        assert!(blocks[0].objects[0].contains_key("title"));
        let placeholder = &blocks[1].objects[0];
        assert!(!placeholder.contains_key("title"));
        assert!(placeholder["object_info"]
            .as_str()
            .unwrap()
            .contains("query_docs_0_0"));
    }

    #[test]
    fn test_duplicate_within_one_result_also_dedupes() {
        let mut env = Environment::new();
        let payload = obj(&[("k", json!("v"))]);
        env.add("query", &result("docs", vec![payload.clone(), payload]));
        let block = env.find_at("query", "docs", 0).unwrap();
        assert!(block.objects[0].contains_key("k"));
        assert!(block.objects[1].contains_key("object_info"));
    }

    #[test]
    fn test_replace_reassigns_refs() {
        let mut env = Environment::new();
        env.add("query", &result("docs", vec![obj(&[("a", json!(1))])]));
        assert!(env.replace(
            "query",
            "docs",
            vec![obj(&[("b", json!(2))]), obj(&[("c", json!(3))])],
            Some(0),
        ));
        let block = env.find_at("query", "docs", 0).unwrap();
        assert_eq!(block.objects[0][REF_ID_KEY], json!("query_docs_0_0"));
        assert_eq!(block.objects[1][REF_ID_KEY], json!("query_docs_0_1"));
        assert_eq!(block.objects[0]["b"], json!(2));
    }

    #[test]
    fn test_remove_block_and_name() {
        let mut env = Environment::new();
        env.add("query", &result("docs", vec![obj(&[("a", json!(1))])]));
        env.add("query", &result("docs", vec![obj(&[("b", json!(2))])]));
        assert!(env.remove("query", "docs", Some(0)));
        assert_eq!(env.find("query", "docs").unwrap().len(), 1);
        assert!(env.remove("query", "docs", None));
        assert!(env.find("query", "docs").is_none());
        assert!(env.is_empty());
    }

    #[test]
    fn test_hidden_environment_is_shared_across_clones() {
        let env = Environment::new();
        let cloned = env.clone();
        cloned.hidden.insert("items_to_summarise", json!(["a", "b"]));
        assert_eq!(env.hidden.get("items_to_summarise"), Some(json!(["a", "b"])));
    }

    #[test]
    fn test_environment_round_trips_through_json() {
        let mut env = Environment::new();
        env.add("query", &result("docs", vec![obj(&[("a", json!(1))])]));
        env.hidden.insert("Example Entry", json!("This is an example!"));

        let serialized = serde_json::to_string(&env).unwrap();
        let restored: Environment = serde_json::from_str(&serialized).unwrap();

        assert_eq!(
            restored.find("query", "docs"),
            env.find("query", "docs")
        );
        assert_eq!(
            restored.hidden.get("Example Entry"),
            Some(json!("This is an example!"))
        );
    }
}
