//! The tool contract.
//!
//! A tool is polymorphic over `{schema, is_available, auto_run, invoke}`.
//! Metadata is immutable and set at construction (never reflected from
//! source). `invoke` returns a lazy event stream: the engine pulls events
//! in order and integrates each into tree state before resuming the
//! producer, which is also where cancellation propagates.

use std::collections::BTreeMap;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::lm::LmHandle;
use crate::error::Result;
use crate::events::{JsonObject, ToolEvent};
use crate::store::pool::ClientPool;
use crate::tree::data::TreeData;

/// Lazy sequence of events produced by one tool invocation.
pub type ToolEventStream = BoxStream<'static, Result<ToolEvent>>;

/// Resolved inputs for one invocation.
pub type ToolInputs = JsonObject;

/// Declared schema of one tool input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputSpec {
    /// Semantic type tag ("string", "integer", "number", "boolean",
    /// "array", "object").
    #[serde(rename = "type")]
    pub kind: String,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default)]
    pub required: bool,
}

impl InputSpec {
    pub fn new(kind: impl Into<String>, description: impl Into<String>) -> Self {
        InputSpec {
            kind: kind.into(),
            description: description.into(),
            default: None,
            required: false,
        }
    }

    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }
}

/// Immutable tool metadata, extracted at registration time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    /// Detailed description shown to the decision agent.
    pub description: String,
    /// Status line displayed while the tool runs.
    pub status: String,
    pub inputs: BTreeMap<String, InputSpec>,
    /// Whether choosing this tool may end the conversation.
    pub ends_conversation: bool,
}

impl ToolSchema {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        let name = name.into();
        let status = format!("Running {}...", name);
        ToolSchema {
            name,
            description: description.into(),
            status,
            inputs: BTreeMap::new(),
            ends_conversation: false,
        }
    }

    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = status.into();
        self
    }

    pub fn with_input(mut self, name: impl Into<String>, spec: InputSpec) -> Self {
        self.inputs.insert(name.into(), spec);
        self
    }

    pub fn ends_conversation(mut self) -> Self {
        self.ends_conversation = true;
        self
    }

    /// Declared defaults for every input.
    pub fn default_inputs(&self) -> ToolInputs {
        self.inputs
            .iter()
            .map(|(name, spec)| {
                (
                    name.clone(),
                    spec.default.clone().unwrap_or(Value::Null),
                )
            })
            .collect()
    }

    /// Whether any input must be supplied by the caller.
    pub fn has_required_inputs(&self) -> bool {
        self.inputs.values().any(|spec| spec.required)
    }

    /// Resolve LM-supplied inputs against this schema:
    /// - inputs absent from the schema are dropped;
    /// - missing inputs receive their declared default;
    /// - values wrapped in the `{description, type, default, value}` shape
    ///   are unwrapped to their `value`.
    pub fn resolve_inputs(&self, provided: ToolInputs) -> ToolInputs {
        let mut resolved = Map::new();
        for (name, spec) in &self.inputs {
            let value = match provided.get(name) {
                Some(value) => unwrap_value_shape(value.clone()),
                None => spec.default.clone().unwrap_or(Value::Null),
            };
            resolved.insert(name.clone(), value);
        }
        resolved
    }
}

fn unwrap_value_shape(value: Value) -> Value {
    match value {
        Value::Object(map) if map.contains_key("value") => {
            map.get("value").cloned().unwrap_or(Value::Null)
        }
        other => other,
    }
}

/// Everything a tool may consult while running.
///
/// `tree_data` is a snapshot taken at invocation time; the authoritative
/// copy is updated by the engine as events are integrated. The hidden
/// environment inside the snapshot is shared, so tools can hand work to
/// each other.
#[derive(Clone)]
pub struct ToolContext {
    pub tree_data: TreeData,
    pub base_lm: LmHandle,
    pub complex_lm: LmHandle,
    pub pool: Option<ClientPool>,
}

/// A tool callable from a decision node.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Immutable metadata.
    fn schema(&self) -> &ToolSchema;

    /// Whether the tool can currently be chosen. Unavailable tools are
    /// omitted from the decision catalog.
    async fn is_available(&self, _ctx: &ToolContext) -> bool {
        true
    }

    /// Human-readable reason shown to the LM when the tool is unavailable.
    fn availability_note(&self) -> String {
        String::new()
    }

    /// Rule check: `Some(inputs)` runs the tool unconditionally at the
    /// start of every decision node that contains it, before the LM
    /// decides. Empty inputs mean "use the declared defaults".
    async fn auto_run(&self, _ctx: &ToolContext) -> Option<ToolInputs> {
        None
    }

    /// Run the tool. The only required behaviour.
    fn invoke(&self, ctx: ToolContext, inputs: ToolInputs) -> ToolEventStream;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema() -> ToolSchema {
        ToolSchema::new("query", "Query the knowledge base")
            .with_input(
                "search_term",
                InputSpec::new("string", "What to search for").required(),
            )
            .with_input(
                "limit",
                InputSpec::new("integer", "How many objects").with_default(json!(10)),
            )
    }

    #[test]
    fn test_default_status() {
        assert_eq!(schema().status, "Running query...");
    }

    #[test]
    fn test_resolve_inputs_fills_defaults_and_drops_unknown() {
        let provided = Map::from_iter([
            ("search_term".to_string(), json!("widgets")),
            ("bogus".to_string(), json!(true)),
        ]);
        let resolved = schema().resolve_inputs(provided);
        assert_eq!(resolved["search_term"], json!("widgets"));
        assert_eq!(resolved["limit"], json!(10));
        assert!(resolved.get("bogus").is_none());
    }

    #[test]
    fn test_resolve_inputs_unwraps_value_shape() {
        let provided = Map::from_iter([(
            "search_term".to_string(),
            json!({"description": "", "type": "string", "default": null, "value": "widgets"}),
        )]);
        let resolved = schema().resolve_inputs(provided);
        assert_eq!(resolved["search_term"], json!("widgets"));
    }

    #[test]
    fn test_required_detection() {
        assert!(schema().has_required_inputs());
        let bare = ToolSchema::new("noop", "");
        assert!(!bare.has_required_inputs());
    }
}
