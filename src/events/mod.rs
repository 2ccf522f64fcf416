//! Event taxonomy yielded by tools and the decision loop.
//!
//! Events come in three families:
//! - [`ResultEvent`]: displayable data payloads that enter the environment
//!   (retrieval results, aggregations, anything produced by code).
//! - [`TextEvent`]: assistant-visible text, optionally cited.
//! - [`UpdateEvent`]: non-displayable signals for the frontend or the
//!   engine (status, warnings, errors, tree updates, training records).
//!
//! Every event knows how to render its frontend payload; the envelope
//! around the payload is added by the event sink.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// A JSON object record, as stored in the environment and sent on the wire.
pub type JsonObject = Map<String, Value>;

/// Reserved key carrying the stable citation reference id on every stored object.
pub const REF_ID_KEY: &str = "_REF_ID";

/// An event yielded by a tool invocation or by the decision step.
#[derive(Debug, Clone)]
pub enum ToolEvent {
    /// Displayable data payload, integrated into the environment.
    Result(ResultEvent),
    /// Assistant text, appended to the conversation history.
    Text(TextEvent),
    /// Non-displayable signal.
    Update(UpdateEvent),
}

impl ToolEvent {
    /// Shorthand for a status update.
    pub fn status(text: impl Into<String>) -> Self {
        ToolEvent::Update(UpdateEvent::Status { text: text.into() })
    }

    /// Shorthand for a warning.
    pub fn warning(text: impl Into<String>) -> Self {
        ToolEvent::Update(UpdateEvent::Warning { text: text.into() })
    }

    /// Shorthand for a plain assistant response.
    pub fn response(text: impl Into<String>) -> Self {
        ToolEvent::Text(TextEvent::response(text))
    }
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// Distinguishes plain results from store retrievals, which narrate
/// themselves differently to the LM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultKind {
    Generic,
    Retrieval,
}

/// A displayable data payload produced by a tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultEvent {
    /// Indexes the result in the environment (e.g. the collection queried).
    pub name: String,
    /// Frontend identifier for the payload shape (e.g. "table", "ticket").
    pub payload_type: String,
    /// The records attached to this result, in emission order.
    pub objects: Vec<JsonObject>,
    /// Query used, time taken, any information not inside the objects.
    pub metadata: JsonObject,
    /// Maps frontend keys to object keys when the frontend expects a
    /// specific shape. `None` sends objects as-is.
    pub mapping: Option<BTreeMap<String, String>>,
    /// Template shown to the LM in place of the default narration.
    /// Placeholders: `{payload_type}`, `{name}`, `{num_objects}` and any
    /// metadata key.
    pub llm_message: Option<String>,
    /// Keys copied through even when a mapping is applied.
    pub unmapped_keys: Vec<String>,
    /// Whether to forward this result to the frontend.
    pub display: bool,
    pub kind: ResultKind,
}

impl ResultEvent {
    pub fn new(objects: Vec<JsonObject>) -> Self {
        ResultEvent {
            name: "default".into(),
            payload_type: "default".into(),
            objects,
            metadata: Map::new(),
            mapping: None,
            llm_message: None,
            unmapped_keys: vec![REF_ID_KEY.into()],
            display: true,
            kind: ResultKind::Generic,
        }
    }

    /// A retrieval result. The name defaults to the queried collection
    /// when the metadata carries `collection_name`.
    pub fn retrieval(objects: Vec<JsonObject>, metadata: JsonObject) -> Self {
        let name = metadata
            .get("collection_name")
            .and_then(Value::as_str)
            .unwrap_or("default")
            .to_string();
        ResultEvent {
            name,
            payload_type: "default".into(),
            objects,
            metadata,
            mapping: None,
            llm_message: None,
            unmapped_keys: vec!["uuid".into(), "collection_name".into(), REF_ID_KEY.into()],
            display: true,
            kind: ResultKind::Retrieval,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_payload_type(mut self, payload_type: impl Into<String>) -> Self {
        self.payload_type = payload_type.into();
        self
    }

    pub fn with_metadata(mut self, metadata: JsonObject) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_mapping(mut self, mapping: BTreeMap<String, String>) -> Self {
        self.mapping = Some(mapping);
        self
    }

    pub fn with_llm_message(mut self, message: impl Into<String>) -> Self {
        self.llm_message = Some(message.into());
        self
    }

    pub fn hidden(mut self) -> Self {
        self.display = false;
        self
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Apply the frontend mapping, carrying unmapped keys through.
    pub fn mapped_objects(&self) -> Vec<JsonObject> {
        let Some(mapping) = &self.mapping else {
            return self.objects.clone();
        };
        self.objects
            .iter()
            .map(|obj| {
                let mut out = Map::new();
                for (front_key, obj_key) in mapping {
                    if obj_key.is_empty() {
                        continue;
                    }
                    if let Some(value) = obj.get(obj_key) {
                        out.insert(front_key.clone(), value.clone());
                    }
                }
                for key in &self.unmapped_keys {
                    if let Some(value) = obj.get(key) {
                        out.insert(key.clone(), value.clone());
                    }
                }
                out
            })
            .collect()
    }

    /// Render the frontend payload, or `None` when there is nothing to show.
    ///
    /// Empty results never reach the frontend.
    pub fn to_wire_payload(&self) -> Option<Value> {
        if !self.display {
            return None;
        }
        let objects = self.mapped_objects();
        if objects.is_empty() {
            return None;
        }
        let mut payload = json!({
            "type": self.payload_type,
            "objects": objects,
            "metadata": self.metadata,
        });
        if let Some(code) = self.metadata.get("code") {
            payload["code"] = code.clone();
        }
        Some(payload)
    }

    fn format_llm_message(&self) -> String {
        let template = match &self.llm_message {
            Some(t) => t.clone(),
            None => return String::new(),
        };
        let mut out = template
            .replace("{payload_type}", &self.payload_type)
            .replace("{name}", &self.name)
            .replace("{num_objects}", &self.objects.len().to_string());
        for (key, value) in &self.metadata {
            let rendered = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            out = out.replace(&format!("{{{}}}", key), &rendered);
        }
        out
    }

    /// How this result is described to the LM in the tasks-completed log.
    pub fn llm_parse(&self) -> String {
        if self.llm_message.is_some() {
            return self.format_llm_message();
        }
        match self.kind {
            ResultKind::Generic => format!(
                "Displayed: A {} object with {} objects.",
                self.payload_type,
                self.objects.len()
            ),
            ResultKind::Retrieval => self.retrieval_parse(),
        }
    }

    fn retrieval_parse(&self) -> String {
        let mut out = String::new();
        let count = self.objects.len();
        if let Some(collection) = self.metadata.get("collection_name").and_then(Value::as_str) {
            if count != 0 {
                out.push_str(&format!(
                    "\nQueried collection: '{}' and returned {} objects, ",
                    collection, count
                ));
            } else {
                out.push_str(&format!(
                    "\nQueried collection: '{}' but no objects were returned. \
                     Judge the query that was created and evaluate whether it was appropriate \
                     for the collection, the user prompt, and the data available. \
                     If it seemed inappropriate, you can choose to try again.",
                    collection
                ));
            }
        }
        if let Some(query_text) = self.metadata.get("query_text").and_then(Value::as_str) {
            out.push_str(&format!("\nSearch terms: '{}'", query_text));
        }
        if let Some(query_type) = self.metadata.get("query_type").and_then(Value::as_str) {
            out.push_str(&format!("\nType of query: '{}'", query_type));
        }
        if let Some(impossible) = self.metadata.get("impossible") {
            out.push_str(&format!("\nImpossible prompt: '{}'", impossible));
            if let Some(reason) = self.metadata.get("impossible_reason").and_then(Value::as_str) {
                out.push_str(&format!("\nReasoning for impossibility: {}", reason));
            }
        }
        if let Some(query_output) = self.metadata.get("query_output") {
            out.push_str(&format!("\nThe query used was:\n{}", query_output));
        }
        out
    }
}

// ---------------------------------------------------------------------------
// Text
// ---------------------------------------------------------------------------

/// Assistant text shown to the user, with optional citations per segment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextEvent {
    /// Backend identifier ("response", "text_with_title", ...).
    pub payload_type: String,
    /// Segments of the form `{"text": ..., "ref_ids": [...]?}`.
    pub objects: Vec<JsonObject>,
    /// Optional `title` and similar presentation hints.
    pub metadata: JsonObject,
    pub display: bool,
}

impl TextEvent {
    pub fn response(text: impl Into<String>) -> Self {
        let mut obj = Map::new();
        obj.insert("text".into(), Value::String(text.into()));
        TextEvent {
            payload_type: "response".into(),
            objects: vec![obj],
            metadata: Map::new(),
            display: true,
        }
    }

    pub fn with_title(text: impl Into<String>, title: impl Into<String>) -> Self {
        let mut event = TextEvent::response(text);
        event.payload_type = "text_with_title".into();
        event
            .metadata
            .insert("title".into(), Value::String(title.into()));
        event
    }

    /// Text built from cited segments: each segment carries the ref ids
    /// backing it.
    pub fn cited(segments: Vec<(String, Vec<String>)>) -> Self {
        let objects = segments
            .into_iter()
            .map(|(text, ref_ids)| {
                let mut obj = Map::new();
                obj.insert("text".into(), Value::String(text));
                obj.insert("ref_ids".into(), json!(ref_ids));
                obj
            })
            .collect();
        TextEvent {
            payload_type: "text_with_citations".into(),
            objects,
            metadata: Map::new(),
            display: true,
        }
    }

    /// Concatenate the segment texts for the conversation history.
    ///
    /// Segments are space-joined, bullet segments start on a new line, and
    /// stray ref-id markers are stripped.
    pub fn text(&self) -> String {
        let mut out = String::new();
        let len = self.objects.len();
        for (i, obj) in self.objects.iter().enumerate() {
            let Some(text) = obj.get("text").and_then(Value::as_str) else {
                continue;
            };
            out.push_str(text);
            if i != len - 1 {
                let next_is_bullet = self.objects[i + 1]
                    .get("text")
                    .and_then(Value::as_str)
                    .map(|t| t.starts_with("* "))
                    .unwrap_or(false);
                if next_is_bullet && !text.ends_with('\n') {
                    out.push('\n');
                } else if !text.ends_with(' ') && !text.ends_with('\n') {
                    out.push(' ');
                }
            }
        }
        out = out.replace(REF_ID_KEY, "").replace("REF_ID", "");
        while out.contains("  ") {
            out = out.replace("  ", " ");
        }
        out
    }

    pub fn to_wire_payload(&self) -> Option<Value> {
        if !self.display {
            return None;
        }
        Some(json!({
            "type": self.payload_type,
            "objects": self.objects,
            "metadata": self.metadata,
        }))
    }
}

// ---------------------------------------------------------------------------
// Updates
// ---------------------------------------------------------------------------

/// Non-displayable signals: forwarded to the frontend (status, warnings,
/// errors, tree updates) or consumed by the engine (training records).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UpdateEvent {
    Status { text: String },
    Warning { text: String },
    Completed,
    Error(ErrorEvent),
    TreeUpdate(TreeUpdate),
    Training(TrainingUpdate),
    FewShotExamples { uuids: Vec<String> },
}

/// An error surfaced to the decision agent so it can retry or re-route.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEvent {
    /// Actionable feedback for the decision agent.
    pub feedback: String,
    /// Raw error message.
    pub error_message: String,
}

/// Feedback text standing in when an error carries no actionable advice.
pub const UNKNOWN_ERROR_FEEDBACK: &str = "An unknown issue occurred.";

impl ErrorEvent {
    /// An error with actionable feedback for the next decision.
    pub fn with_feedback(feedback: impl Into<String>, error_message: impl Into<String>) -> Self {
        let feedback = feedback.into();
        ErrorEvent {
            feedback: if feedback.is_empty() {
                UNKNOWN_ERROR_FEEDBACK.into()
            } else {
                feedback
            },
            error_message: error_message.into(),
        }
    }

    /// An error with no advice attached.
    pub fn unknown(error_message: impl Into<String>) -> Self {
        ErrorEvent {
            feedback: UNKNOWN_ERROR_FEEDBACK.into(),
            error_message: error_message.into(),
        }
    }

    /// Whether the feedback gives the decision agent something to act on.
    pub fn is_avoidable(&self) -> bool {
        self.feedback != UNKNOWN_ERROR_FEEDBACK
    }
}

/// Tells the frontend which edge of the tree was just walked.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreeUpdate {
    pub from_node: String,
    pub to_node: String,
    pub reasoning: String,
    /// Whether the frontend should clear its tree view for the next turn.
    pub reset_tree: bool,
}

impl TreeUpdate {
    pub fn to_wire_payload(&self, tree_index: i64) -> Value {
        json!({
            "node": self.from_node,
            "decision": self.to_node,
            "reasoning": self.reasoning,
            "tree_index": tree_index,
            "reset": self.reset_tree,
        })
    }
}

/// A recorded training example: the inputs and outputs of one module call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingUpdate {
    pub module_name: String,
    pub inputs: Value,
    pub outputs: Value,
}

impl UpdateEvent {
    /// The wire `type` for this update, or `None` for engine-internal ones.
    pub fn wire_kind(&self) -> Option<&'static str> {
        match self {
            UpdateEvent::Status { .. } => Some("status"),
            UpdateEvent::Warning { .. } => Some("warning"),
            UpdateEvent::Completed => Some("completed"),
            UpdateEvent::Error(_) => Some("self_healing_error"),
            UpdateEvent::TreeUpdate(_) => Some("tree_update"),
            UpdateEvent::Training(_) => None,
            UpdateEvent::FewShotExamples { .. } => Some("fewshot_examples"),
        }
    }

    /// Render the wire payload. Tree updates are rendered by the sink,
    /// which owns the tree index.
    pub fn to_wire_payload(&self) -> Option<Value> {
        match self {
            UpdateEvent::Status { text } => Some(json!({ "text": text })),
            UpdateEvent::Warning { text } => Some(json!({ "text": text })),
            UpdateEvent::Completed => Some(json!({})),
            UpdateEvent::Error(err) => Some(json!({
                "feedback": err.feedback,
                "error_message": err.error_message,
            })),
            UpdateEvent::FewShotExamples { uuids } => Some(json!({ "uuids": uuids })),
            UpdateEvent::TreeUpdate(_) | UpdateEvent::Training(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obj(pairs: &[(&str, Value)]) -> JsonObject {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_empty_result_produces_no_payload() {
        let result = ResultEvent::new(vec![]);
        assert!(result.to_wire_payload().is_none());
    }

    #[test]
    fn test_hidden_result_produces_no_payload() {
        let result = ResultEvent::new(vec![obj(&[("a", json!(1))])]).hidden();
        assert!(result.to_wire_payload().is_none());
    }

    #[test]
    fn test_result_mapping_carries_unmapped_keys() {
        let mut result = ResultEvent::new(vec![obj(&[
            ("title", json!("hello")),
            (REF_ID_KEY, json!("t_n_0_0")),
            ("ignored", json!("x")),
        ])]);
        result.mapping = Some(BTreeMap::from([("header".to_string(), "title".to_string())]));
        let mapped = result.mapped_objects();
        assert_eq!(mapped[0]["header"], json!("hello"));
        assert_eq!(mapped[0][REF_ID_KEY], json!("t_n_0_0"));
        assert!(mapped[0].get("ignored").is_none());
    }

    #[test]
    fn test_llm_message_placeholders() {
        let result = ResultEvent::new(vec![obj(&[("a", json!(1))])])
            .with_name("products")
            .with_metadata(obj(&[("query_time", json!("12ms"))]))
            .with_llm_message("Fetched {num_objects} from {name} in {query_time}");
        assert_eq!(result.llm_parse(), "Fetched 1 from products in 12ms");
    }

    #[test]
    fn test_retrieval_parse_mentions_collection() {
        let result = ResultEvent::retrieval(
            vec![obj(&[("a", json!(1))])],
            obj(&[("collection_name", json!("tickets"))]),
        );
        assert_eq!(result.name, "tickets");
        let parsed = result.llm_parse();
        assert!(parsed.contains("'tickets'"));
        assert!(parsed.contains("1 objects"));
    }

    #[test]
    fn test_text_concatenation_spacing() {
        let event = TextEvent {
            payload_type: "response".into(),
            objects: vec![
                obj(&[("text", json!("First part."))]),
                obj(&[("text", json!("* bullet"))]),
            ],
            metadata: Map::new(),
            display: true,
        };
        assert_eq!(event.text(), "First part.\n* bullet");
    }

    #[test]
    fn test_text_strips_ref_markers() {
        let event = TextEvent::response("see query_default_0_0 _REF_ID for details");
        assert!(!event.text().contains(REF_ID_KEY));
    }

    #[test]
    fn test_error_event_defaults_to_unknown() {
        let err = ErrorEvent::with_feedback("", "boom");
        assert!(!err.is_avoidable());
        let err = ErrorEvent::with_feedback("use a smaller limit", "boom");
        assert!(err.is_avoidable());
    }

    #[test]
    fn test_update_wire_kinds() {
        assert_eq!(
            UpdateEvent::Status { text: "x".into() }.wire_kind(),
            Some("status")
        );
        assert_eq!(
            UpdateEvent::Training(TrainingUpdate {
                module_name: "decision".into(),
                inputs: json!({}),
                outputs: json!({}),
            })
            .wire_kind(),
            None
        );
    }
}
