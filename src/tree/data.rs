//! Per-invocation tree state.
//!
//! `TreeData` is the single source of truth for prompt-level state and is
//! given (as a snapshot) to every decision and tool call, so each agent
//! sees the same picture of what has happened so far.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::warn;

use crate::config::Settings;
use crate::core::store::{
    fetch_collection_metadata, CollectionMetadata, MetadataLookup, StoreConnection,
};
use crate::error::Result;
use crate::events::JsonObject;
use crate::tree::environment::Environment;

/// Default number of root-to-leaf traversals allowed per prompt.
pub const DEFAULT_RECURSION_LIMIT: u32 = 5;

/// Speaker of a conversation entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One conversation entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

/// Persona guidance shown to the LM at every decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Persona {
    /// Writing style of the agent.
    pub style: String,
    pub agent_description: String,
    pub end_goal: String,
}

impl Default for Persona {
    fn default() -> Self {
        Persona {
            style: "No style provided.".into(),
            agent_description: "No description provided.".into(),
            end_goal: "No end goal provided.".into(),
        }
    }
}

impl Persona {
    pub fn to_json(&self) -> Value {
        json!({
            "style": self.style,
            "agent_description": self.agent_description,
            "end_goal": self.end_goal,
        })
    }
}

// ---------------------------------------------------------------------------
// Collection metadata cache
// ---------------------------------------------------------------------------

/// How a batch of collection names resolved against the store.
#[derive(Debug, Clone, Default)]
pub struct CollectionResolution {
    pub found: Vec<String>,
    /// Collections that exist but were never preprocessed.
    pub unpreprocessed: Vec<String>,
    /// Names with no matching collection in the store.
    pub nonexistent: Vec<String>,
}

/// Cached per-collection metadata used by the decision prompts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CollectionData {
    /// Names currently in play for this prompt.
    active: Vec<String>,
    /// Metadata cache, kept across prompts.
    metadata: BTreeMap<String, CollectionMetadata>,
}

impl CollectionData {
    pub fn active_names(&self) -> &[String] {
        &self.active
    }

    pub fn metadata_for(&self, name: &str) -> Option<&CollectionMetadata> {
        self.metadata.get(name)
    }

    /// Resolve a batch of names: look up metadata for anything not cached,
    /// partition into found / unpreprocessed / nonexistent, and retain
    /// only the found names in the active list.
    ///
    /// Names are canonicalised at this boundary: trimmed, first casing
    /// wins when the same name is passed in two casings.
    pub async fn resolve(
        &mut self,
        names: &[String],
        conn: &dyn StoreConnection,
    ) -> Result<CollectionResolution> {
        let mut canonical: Vec<String> = Vec::new();
        for name in names {
            let trimmed = name.trim();
            if trimmed.is_empty() {
                continue;
            }
            if !canonical
                .iter()
                .any(|c| c.eq_ignore_ascii_case(trimmed))
            {
                canonical.push(trimmed.to_string());
            }
        }

        let mut resolution = CollectionResolution::default();
        for name in &canonical {
            if self.metadata.contains_key(name) {
                resolution.found.push(name.clone());
                continue;
            }
            match fetch_collection_metadata(conn, name).await? {
                MetadataLookup::Found(metadata) => {
                    self.metadata.insert(name.clone(), *metadata);
                    resolution.found.push(name.clone());
                }
                MetadataLookup::Unpreprocessed => resolution.unpreprocessed.push(name.clone()),
                MetadataLookup::Nonexistent => resolution.nonexistent.push(name.clone()),
            }
        }

        if !resolution.unpreprocessed.is_empty() {
            warn!(
                collections = ?resolution.unpreprocessed,
                "Collections have not been preprocessed; ignoring them for now"
            );
        }
        if !resolution.nonexistent.is_empty() {
            warn!(
                collections = ?resolution.nonexistent,
                "Collections cannot be found in the store; check the names"
            );
        }

        self.active = resolution.found.clone();
        Ok(resolution)
    }

    /// Schemas for the active (or given) collections, as shown to the LM.
    pub fn schemas_json(&self, names: Option<&[String]>, with_mappings: bool) -> Value {
        let names = names.unwrap_or(&self.active);
        let mut out = Map::new();
        for name in names {
            if let Some(metadata) = self.metadata.get(name) {
                let value = if with_mappings {
                    serde_json::to_value(metadata).unwrap_or_default()
                } else {
                    metadata.schema_json()
                };
                out.insert(name.clone(), value);
            }
        }
        Value::Object(out)
    }

    /// Natural-language summaries of the active collections.
    pub fn summaries_json(&self) -> Value {
        let mut out = Map::new();
        for name in &self.active {
            if let Some(metadata) = self.metadata.get(name) {
                out.insert(name.clone(), Value::String(metadata.summary.clone()));
            }
        }
        Value::Object(out)
    }

    /// The available frontend mapping names per active collection.
    pub fn mapping_lists(&self) -> BTreeMap<String, Vec<String>> {
        self.active
            .iter()
            .filter_map(|name| {
                self.metadata
                    .get(name)
                    .map(|m| (name.clone(), m.mappings.keys().cloned().collect()))
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Tasks-completed log
// ---------------------------------------------------------------------------

/// One decision or action taken during an iteration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskEntry {
    pub task: String,
    pub iteration: u32,
    /// Reasoning, inputs, parsed info, action/error flags and anything
    /// else a tool attaches.
    #[serde(flatten)]
    pub extras: JsonObject,
}

/// The tasks recorded for one prompt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptTasks {
    pub prompt: String,
    pub tasks: Vec<TaskEntry>,
}

/// Log of what has been done, grouped by prompt, rendered into every
/// decision prompt as a stream of consciousness.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskLog(pub Vec<PromptTasks>);

impl TaskLog {
    /// Record work under `(prompt, task, iteration)`. An existing entry
    /// with the same key has the extras merged field-wise: strings
    /// concatenate on a newline, numbers add, lists extend, maps merge,
    /// booleans replace.
    pub fn update(&mut self, prompt: &str, task: &str, iteration: u32, extras: JsonObject) {
        let group_index = match self.0.iter().position(|g| g.prompt == prompt) {
            Some(i) => i,
            None => {
                self.0.push(PromptTasks {
                    prompt: prompt.to_string(),
                    tasks: Vec::new(),
                });
                self.0.len() - 1
            }
        };
        let group = &mut self.0[group_index];

        match group
            .tasks
            .iter()
            .position(|t| t.task == task && t.iteration == iteration)
        {
            Some(i) => {
                for (key, value) in extras {
                    merge_extra(&mut group.tasks[i].extras, key, value);
                }
            }
            None => group.tasks.push(TaskEntry {
                task: task.to_string(),
                iteration,
                extras,
            }),
        }
    }

    /// Deterministic textual rendering for LM prompting, ordered by
    /// prompt then by task.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for (j, group) in self.0.iter().enumerate() {
            out.push_str(&format!("<prompt_{}>\n", j + 1));
            out.push_str(&format!("Prompt: {}\n", group.prompt));
            for (i, entry) in group.tasks.iter().enumerate() {
                out.push_str(&format!("<task_{}>\n", i + 1));
                let acted = entry
                    .extras
                    .get("action")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                if acted {
                    out.push_str(&format!("Completed action: {}\n", entry.task));
                } else {
                    out.push_str(&format!("Chosen subcategory: {}\n", entry.task));
                }
                out.push_str(&format!("Iteration: {}\n", entry.iteration));
                for (key, value) in &entry.extras {
                    if key == "action" {
                        continue;
                    }
                    let rendered = match value {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    out.push_str(&format!("{}: {}\n", capitalize(key), rendered));
                }
                out.push_str(&format!("</task_{}>\n", i + 1));
            }
            out.push_str(&format!("</prompt_{}>\n", j + 1));
        }
        out
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

fn merge_extra(extras: &mut JsonObject, key: String, value: Value) {
    if value.is_null() {
        return;
    }
    if !extras.contains_key(&key) {
        extras.insert(key, value);
        return;
    }
    let existing = extras.get_mut(&key).expect("checked above");
    match (existing, value) {
        (Value::String(old), Value::String(new)) => {
            old.push('\n');
            old.push_str(&new);
        }
        (existing @ Value::Number(_), Value::Number(new)) => {
            let sum = existing.as_f64().unwrap_or(0.0) + new.as_f64().unwrap_or(0.0);
            if sum.fract() == 0.0 && sum.abs() < i64::MAX as f64 {
                *existing = json!(sum as i64);
            } else {
                *existing = json!(sum);
            }
        }
        (Value::Array(old), Value::Array(new)) => old.extend(new),
        (Value::Object(old), Value::Object(new)) => {
            for (k, v) in new {
                old.insert(k, v);
            }
        }
        (existing, new) => *existing = new,
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

// ---------------------------------------------------------------------------
// TreeData
// ---------------------------------------------------------------------------

/// Prompt-level state carried across iterations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreeData {
    pub user_prompt: String,
    pub conversation_history: Vec<ChatMessage>,
    pub environment: Environment,
    pub tasks_completed: TaskLog,
    /// Per-tool error strings shown to the next decision.
    pub errors: BTreeMap<String, Vec<String>>,
    pub collection_data: CollectionData,
    pub persona: Persona,
    /// The assistant message being built up this prompt.
    pub current_message: String,
    /// Reasoning from earlier modules this prompt, keyed by module.
    pub previous_reasoning: BTreeMap<String, String>,
    /// Completed root-to-leaf traversals for the current prompt.
    pub iterations_completed: u32,
    pub recursion_limit: u32,
    /// Snapshot of model names, providers, keys and feature flags.
    /// Persisted separately from the rest of the tree data.
    #[serde(skip)]
    pub settings: Settings,
}

impl TreeData {
    pub fn new(persona: Persona, settings: Settings) -> Self {
        TreeData {
            user_prompt: String::new(),
            conversation_history: Vec::new(),
            environment: Environment::new(),
            tasks_completed: TaskLog::default(),
            errors: BTreeMap::new(),
            collection_data: CollectionData::default(),
            persona,
            current_message: String::new(),
            previous_reasoning: BTreeMap::new(),
            iterations_completed: 0,
            recursion_limit: DEFAULT_RECURSION_LIMIT,
            settings,
        }
    }

    /// Append to the conversation with the role-merge rule: adjacent
    /// entries from the same role are space-joined rather than duplicated.
    pub fn append_conversation(&mut self, role: Role, message: &str) {
        if message.is_empty() {
            return;
        }
        match self.conversation_history.last_mut() {
            Some(last) if last.role == role => {
                if !last.content.ends_with(' ') {
                    last.content.push(' ');
                }
                last.content.push_str(message);
            }
            _ => self.conversation_history.push(ChatMessage {
                role,
                content: message.to_string(),
            }),
        }
    }

    /// Record work for the current prompt; see [`TaskLog::update`].
    pub fn update_tasks_completed(&mut self, task: &str, extras: JsonObject) {
        let prompt = self.user_prompt.clone();
        self.tasks_completed
            .update(&prompt, task, self.iterations_completed, extras);
    }

    pub fn tasks_completed_string(&self) -> String {
        self.tasks_completed.render()
    }

    /// `"{i+1}/N"` plus escalating warnings near and past the limit.
    pub fn tree_count_string(&self) -> String {
        let mut out = format!(
            "{}/{}",
            self.iterations_completed + 1,
            self.recursion_limit
        );
        if self.iterations_completed + 1 == self.recursion_limit {
            out.push_str(" (this is the last decision you can make before being cut off)");
        }
        if self.iterations_completed >= self.recursion_limit {
            out.push_str(
                " (recursion limit reached, write your full chat response accordingly - \
                 the decision process has been cut short, and it is likely the user's \
                 question has not been fully answered)",
            );
        }
        out
    }

    /// Clear only the transient per-prompt fields.
    pub fn soft_reset(&mut self) {
        self.previous_reasoning.clear();
        self.current_message.clear();
    }

    pub fn add_error(&mut self, tool: &str, message: String) {
        self.errors.entry(tool.to_string()).or_default().push(message);
    }

    /// Forget a tool's errors after it succeeds.
    pub fn clear_errors(&mut self, tool: &str) {
        self.errors.remove(tool);
    }

    /// Resolve collection names through the metadata cache; see
    /// [`CollectionData::resolve`].
    pub async fn set_collection_names(
        &mut self,
        names: &[String],
        conn: &dyn StoreConnection,
    ) -> Result<CollectionResolution> {
        self.collection_data.resolve(names, conn).await
    }

    /// The prompt-facing snapshot used in training records.
    pub fn to_json(&self) -> Value {
        json!({
            "user_prompt": self.user_prompt,
            "conversation_history": self.conversation_history,
            "environment": self.environment.to_json(),
            "tasks_completed": self.tasks_completed,
            "current_message": self.current_message,
            "iterations_completed": self.iterations_completed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::MemoryStore;
    use serde_json::json;

    fn tree_data() -> TreeData {
        TreeData::new(Persona::default(), Settings::default())
    }

    fn extras(pairs: &[(&str, Value)]) -> JsonObject {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_conversation_merge_rule() {
        let mut data = tree_data();
        data.append_conversation(Role::User, "Hello");
        data.append_conversation(Role::Assistant, "Hi there.");
        data.append_conversation(Role::Assistant, "More detail.");
        data.append_conversation(Role::User, "Thanks");

        assert_eq!(data.conversation_history.len(), 3);
        assert_eq!(data.conversation_history[1].content, "Hi there. More detail.");
        for pair in data.conversation_history.windows(2) {
            assert_ne!(pair[0].role, pair[1].role);
        }
    }

    #[test]
    fn test_conversation_ignores_empty_messages() {
        let mut data = tree_data();
        data.append_conversation(Role::User, "");
        assert!(data.conversation_history.is_empty());
    }

    #[test]
    fn test_task_log_merges_same_task_and_iteration() {
        let mut log = TaskLog::default();
        log.update(
            "p",
            "query",
            0,
            extras(&[("reasoning", json!("first")), ("count", json!(1))]),
        );
        log.update(
            "p",
            "query",
            0,
            extras(&[("reasoning", json!("second")), ("count", json!(2))]),
        );
        let entry = &log.0[0].tasks[0];
        assert_eq!(entry.extras["reasoning"], json!("first\nsecond"));
        assert_eq!(entry.extras["count"], json!(3));
    }

    #[test]
    fn test_task_log_new_iteration_gets_new_entry() {
        let mut log = TaskLog::default();
        log.update("p", "query", 0, extras(&[]));
        log.update("p", "query", 1, extras(&[]));
        assert_eq!(log.0[0].tasks.len(), 2);
    }

    #[test]
    fn test_task_log_merge_lists_and_bools() {
        let mut log = TaskLog::default();
        log.update(
            "p",
            "t",
            0,
            extras(&[("items", json!(["a"])), ("flag", json!(false))]),
        );
        log.update(
            "p",
            "t",
            0,
            extras(&[("items", json!(["b"])), ("flag", json!(true))]),
        );
        let entry = &log.0[0].tasks[0];
        assert_eq!(entry.extras["items"], json!(["a", "b"]));
        assert_eq!(entry.extras["flag"], json!(true));
    }

    #[test]
    fn test_task_log_render_marks_actions() {
        let mut log = TaskLog::default();
        log.update("find things", "search", 0, extras(&[]));
        log.update(
            "find things",
            "query",
            0,
            extras(&[("action", json!(true)), ("reasoning", json!("needed data"))]),
        );
        let rendered = log.render();
        assert!(rendered.contains("Chosen subcategory: search"));
        assert!(rendered.contains("Completed action: query"));
        assert!(rendered.contains("Reasoning: needed data"));
        assert!(rendered.contains("<prompt_1>"));
    }

    #[test]
    fn test_tree_count_string_warnings() {
        let mut data = tree_data();
        data.recursion_limit = 3;
        assert_eq!(data.tree_count_string(), "1/3");
        data.iterations_completed = 2;
        assert!(data.tree_count_string().starts_with("3/3 (this is the last decision"));
        data.iterations_completed = 3;
        assert!(data.tree_count_string().contains("recursion limit reached"));
    }

    #[test]
    fn test_soft_reset_clears_only_transients() {
        let mut data = tree_data();
        data.current_message = "partial".into();
        data.previous_reasoning.insert("decision".into(), "why".into());
        data.append_conversation(Role::User, "hello");
        data.environment.add(
            "query",
            &crate::events::ResultEvent::new(vec![extras(&[("a", json!(1))])]).with_name("docs"),
        );

        data.soft_reset();

        assert!(data.current_message.is_empty());
        assert!(data.previous_reasoning.is_empty());
        assert_eq!(data.conversation_history.len(), 1);
        assert!(!data.environment.is_empty());
    }

    #[test]
    fn test_error_bookkeeping() {
        let mut data = tree_data();
        data.add_error("query", "Avoidable error: bad filter".into());
        assert_eq!(data.errors["query"].len(), 1);
        data.clear_errors("query");
        assert!(data.errors.get("query").is_none());
    }

    #[tokio::test]
    async fn test_collection_resolution_partitions() {
        let store = MemoryStore::new();
        store.seed_preprocessed("products", "A product catalog");
        store.create_raw_collection("raw_logs");

        let mut data = tree_data();
        let resolution = data
            .set_collection_names(
                &[
                    "products".to_string(),
                    "raw_logs".to_string(),
                    "missing".to_string(),
                ],
                &store,
            )
            .await
            .unwrap();

        assert_eq!(resolution.found, vec!["products"]);
        assert_eq!(resolution.unpreprocessed, vec!["raw_logs"]);
        assert_eq!(resolution.nonexistent, vec!["missing"]);
        assert_eq!(data.collection_data.active_names(), ["products"]);
        assert!(data
            .collection_data
            .metadata_for("products")
            .is_some());
    }

    #[tokio::test]
    async fn test_collection_resolution_dedupes_casing() {
        let store = MemoryStore::new();
        store.seed_preprocessed("Products", "A product catalog");

        let mut data = tree_data();
        let resolution = data
            .set_collection_names(
                &["Products".to_string(), "products".to_string()],
                &store,
            )
            .await
            .unwrap();
        assert_eq!(resolution.found, vec!["Products"]);
        assert_eq!(data.collection_data.active_names().len(), 1);
    }

    #[test]
    fn test_schemas_json_strips_mappings_by_default() {
        let mut data = tree_data();
        let mut metadata = crate::core::store::CollectionMetadata {
            name: "products".into(),
            summary: "catalog".into(),
            ..Default::default()
        };
        metadata.mappings.insert(
            "table".into(),
            std::collections::BTreeMap::from([("col".to_string(), "field".to_string())]),
        );
        data.collection_data
            .metadata
            .insert("products".into(), metadata);
        data.collection_data.active = vec!["products".into()];

        let schemas = data.collection_data.schemas_json(None, false);
        assert!(schemas["products"].get("mappings").is_none());
        let with = data.collection_data.schemas_json(None, true);
        assert!(with["products"].get("mappings").is_some());

        let lists = data.collection_data.mapping_lists();
        assert_eq!(lists["products"], vec!["table"]);
    }
}
