//! Streaming event sink.
//!
//! Serialises every emitted event into the frontend wire format
//! `{type, id, user_id, conversation_id, query_id, payload}` and retains
//! the full transcript so a frontend can be rebuilt after a restore.

use serde_json::{json, Value};
use uuid::Uuid;

use crate::events::{ToolEvent, UpdateEvent};

/// Renders events to the wire and keeps the transcript.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct EventSink {
    pub user_id: String,
    pub conversation_id: String,
    /// Counts user prompts; carried on tree updates so the frontend can
    /// tell turns apart.
    tree_index: i64,
    /// Every wire message sent so far.
    pub store: Vec<Value>,
}

impl EventSink {
    pub fn new(user_id: impl Into<String>, conversation_id: impl Into<String>) -> Self {
        EventSink {
            user_id: user_id.into(),
            conversation_id: conversation_id.into(),
            tree_index: -1,
            store: Vec::new(),
        }
    }

    pub fn set_tree_index(&mut self, tree_index: i64) {
        self.tree_index = tree_index;
    }

    pub fn tree_index(&self) -> i64 {
        self.tree_index
    }

    pub fn clear(&mut self) {
        self.store.clear();
    }

    fn envelope(&self, kind: &str, query_id: &str, payload: Value) -> Value {
        json!({
            "type": kind,
            "id": Uuid::new_v4().to_string(),
            "user_id": self.user_id,
            "conversation_id": self.conversation_id,
            "query_id": query_id,
            "payload": payload,
        })
    }

    /// Record the incoming user prompt on the transcript.
    pub fn add_prompt(&mut self, prompt: &str, query_id: &str) -> Value {
        let message = self.envelope("user_prompt", query_id, json!({ "prompt": prompt }));
        self.store.push(message.clone());
        message
    }

    /// Map one event to its wire message, if it has one, and append it to
    /// the transcript. Non-displayable results and engine-internal
    /// updates return `None`.
    pub fn render(&mut self, event: &ToolEvent, query_id: &str) -> Option<Value> {
        let (kind, payload) = match event {
            ToolEvent::Result(result) => ("result", result.to_wire_payload()?),
            ToolEvent::Text(text) => ("text", text.to_wire_payload()?),
            ToolEvent::Update(UpdateEvent::TreeUpdate(update)) => {
                ("tree_update", update.to_wire_payload(self.tree_index))
            }
            ToolEvent::Update(update) => (update.wire_kind()?, update.to_wire_payload()?),
        };
        let message = self.envelope(kind, query_id, payload);
        self.store.push(message.clone());
        Some(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{ResultEvent, TrainingUpdate, TreeUpdate};
    use serde_json::json;

    fn sink() -> EventSink {
        EventSink::new("user-1", "conv-1")
    }

    #[test]
    fn test_envelope_fields() {
        let mut sink = sink();
        let message = sink.render(&ToolEvent::status("Thinking..."), "q-1").unwrap();
        assert_eq!(message["type"], json!("status"));
        assert_eq!(message["user_id"], json!("user-1"));
        assert_eq!(message["conversation_id"], json!("conv-1"));
        assert_eq!(message["query_id"], json!("q-1"));
        assert_eq!(message["payload"]["text"], json!("Thinking..."));
        assert!(!message["id"].as_str().unwrap().is_empty());
        assert_eq!(sink.store.len(), 1);
    }

    #[test]
    fn test_tree_update_carries_tree_index() {
        let mut sink = sink();
        sink.set_tree_index(4);
        let message = sink
            .render(
                &ToolEvent::Update(UpdateEvent::TreeUpdate(TreeUpdate {
                    from_node: "base".into(),
                    to_node: "query".into(),
                    reasoning: "because".into(),
                    reset_tree: true,
                })),
                "q-1",
            )
            .unwrap();
        assert_eq!(message["payload"]["tree_index"], json!(4));
        assert_eq!(message["payload"]["reset"], json!(true));
        assert_eq!(message["payload"]["node"], json!("base"));
        assert_eq!(message["payload"]["decision"], json!("query"));
    }

    #[test]
    fn test_empty_result_is_not_rendered() {
        let mut sink = sink();
        let event = ToolEvent::Result(ResultEvent::new(vec![]));
        assert!(sink.render(&event, "q-1").is_none());
        assert!(sink.store.is_empty());
    }

    #[test]
    fn test_training_updates_stay_internal() {
        let mut sink = sink();
        let event = ToolEvent::Update(UpdateEvent::Training(TrainingUpdate {
            module_name: "decision".into(),
            inputs: json!({}),
            outputs: json!({}),
        }));
        assert!(sink.render(&event, "q-1").is_none());
    }

    #[test]
    fn test_prompt_record() {
        let mut sink = sink();
        let message = sink.add_prompt("What products do we have?", "q-1");
        assert_eq!(message["type"], json!("user_prompt"));
        assert_eq!(
            message["payload"]["prompt"],
            json!("What products do we have?")
        );
    }
}
