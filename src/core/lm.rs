//! Language model capability.
//!
//! The engine is provider-agnostic: it hands an [`LmClient`] a declarative
//! [`CompletionRequest`] (named input fields with values, named output
//! fields with type tags) and receives a [`StructuredOutput`] containing
//! every declared output field. The LM is the sole nondeterministic oracle
//! in the system.
//!
//! [`LmHandle`] wraps a client with a shared call history so trackers can
//! snapshot usage by index difference; LM objects may be shared across
//! trees.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};

/// Type tag for a declared output field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    Text,
    Bool,
    Json,
}

/// An input field: name, guidance for the model, and the value to show.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputField {
    pub name: String,
    pub description: String,
    pub value: Value,
}

impl InputField {
    pub fn new(name: impl Into<String>, description: impl Into<String>, value: Value) -> Self {
        InputField {
            name: name.into(),
            description: description.into(),
            value,
        }
    }
}

/// An output field the model must produce.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputField {
    pub name: String,
    pub description: String,
    pub kind: FieldKind,
}

impl OutputField {
    pub fn new(name: impl Into<String>, description: impl Into<String>, kind: FieldKind) -> Self {
        OutputField {
            name: name.into(),
            description: description.into(),
            kind,
        }
    }
}

/// A few-shot example attached to a request for in-context learning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FewShotExample {
    pub inputs: Value,
    pub outputs: Value,
}

/// A declarative completion request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRequest {
    /// Module name, used for feedback retrieval and training records.
    pub module: String,
    pub inputs: Vec<InputField>,
    pub outputs: Vec<OutputField>,
    #[serde(default)]
    pub examples: Vec<FewShotExample>,
}

impl CompletionRequest {
    pub fn new(module: impl Into<String>) -> Self {
        CompletionRequest {
            module: module.into(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            examples: Vec::new(),
        }
    }

    pub fn input(
        mut self,
        name: impl Into<String>,
        description: impl Into<String>,
        value: Value,
    ) -> Self {
        self.inputs.push(InputField::new(name, description, value));
        self
    }

    pub fn output(
        mut self,
        name: impl Into<String>,
        description: impl Into<String>,
        kind: FieldKind,
    ) -> Self {
        self.outputs.push(OutputField::new(name, description, kind));
        self
    }

    /// The inputs as one JSON object, for training records.
    pub fn inputs_json(&self) -> Value {
        let mut map = Map::new();
        for field in &self.inputs {
            map.insert(field.name.clone(), field.value.clone());
        }
        Value::Object(map)
    }
}

/// The model's structured output: one value per declared output field.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StructuredOutput(pub Map<String, Value>);

impl StructuredOutput {
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    pub fn get_str(&self, field: &str) -> String {
        self.0
            .get(field)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    }

    pub fn get_bool(&self, field: &str) -> bool {
        self.0.get(field).and_then(Value::as_bool).unwrap_or(false)
    }

    pub fn get_object(&self, field: &str) -> Map<String, Value> {
        self.0
            .get(field)
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default()
    }

    /// Check that every declared output field is present.
    pub fn validate_against(&self, request: &CompletionRequest) -> Result<()> {
        for field in &request.outputs {
            if !self.0.contains_key(&field.name) {
                return Err(Error::Lm(format!(
                    "Model output for module '{}' is missing field '{}'",
                    request.module, field.name
                )));
            }
        }
        Ok(())
    }

    pub fn to_json(&self) -> Value {
        Value::Object(self.0.clone())
    }
}

/// Token and cost accounting for one completed call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LmUsage {
    pub model: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    /// Dollar cost when the provider reports one.
    pub cost: f64,
    pub timestamp: DateTime<Utc>,
}

impl LmUsage {
    pub fn new(model: impl Into<String>, prompt_tokens: u64, completion_tokens: u64) -> Self {
        LmUsage {
            model: model.into(),
            prompt_tokens,
            completion_tokens,
            cost: 0.0,
            timestamp: Utc::now(),
        }
    }
}

/// An opaque structured-completion endpoint.
#[async_trait]
pub trait LmClient: Send + Sync {
    /// The model identifier, for logging and usage accounting.
    fn model(&self) -> &str;

    /// Complete the request, returning every declared output field.
    async fn complete(&self, request: &CompletionRequest) -> Result<(StructuredOutput, LmUsage)>;
}

/// A shareable LM handle with an observable call history.
///
/// Usage is appended per call; observers snapshot by index difference,
/// never by subscription, so sharing a handle across trees is safe.
#[derive(Clone)]
pub struct LmHandle {
    client: Arc<dyn LmClient>,
    history: Arc<Mutex<Vec<LmUsage>>>,
}

impl LmHandle {
    pub fn new(client: Arc<dyn LmClient>) -> Self {
        LmHandle {
            client,
            history: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn model(&self) -> String {
        self.client.model().to_string()
    }

    pub async fn complete(&self, request: &CompletionRequest) -> Result<StructuredOutput> {
        let (output, usage) = self.client.complete(request).await?;
        output.validate_against(request)?;
        self.history
            .lock()
            .expect("lm history lock poisoned")
            .push(usage);
        Ok(output)
    }

    /// Number of calls made through this handle so far.
    pub fn history_len(&self) -> usize {
        self.history.lock().expect("lm history lock poisoned").len()
    }

    /// Usage records appended since the given index.
    pub fn history_since(&self, index: usize) -> Vec<LmUsage> {
        let history = self.history.lock().expect("lm history lock poisoned");
        history.get(index..).unwrap_or_default().to_vec()
    }
}

impl std::fmt::Debug for LmHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LmHandle")
            .field("model", &self.client.model())
            .field("calls", &self.history_len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct EchoLm;

    #[async_trait]
    impl LmClient for EchoLm {
        fn model(&self) -> &str {
            "echo"
        }

        async fn complete(
            &self,
            request: &CompletionRequest,
        ) -> Result<(StructuredOutput, LmUsage)> {
            let mut map = Map::new();
            for field in &request.outputs {
                map.insert(field.name.clone(), json!("ok"));
            }
            Ok((StructuredOutput(map), LmUsage::new("echo", 10, 5)))
        }
    }

    #[tokio::test]
    async fn test_handle_records_history() {
        let handle = LmHandle::new(Arc::new(EchoLm));
        let request = CompletionRequest::new("test").output("answer", "", FieldKind::Text);
        assert_eq!(handle.history_len(), 0);
        let output = handle.complete(&request).await.unwrap();
        assert_eq!(output.get_str("answer"), "ok");
        assert_eq!(handle.history_len(), 1);
        let delta = handle.history_since(0);
        assert_eq!(delta.len(), 1);
        assert_eq!(delta[0].prompt_tokens, 10);
    }

    #[tokio::test]
    async fn test_shared_handles_observe_by_index() {
        let handle = LmHandle::new(Arc::new(EchoLm));
        let other = handle.clone();
        let request = CompletionRequest::new("test").output("answer", "", FieldKind::Text);
        handle.complete(&request).await.unwrap();
        let mark = other.history_len();
        handle.complete(&request).await.unwrap();
        assert_eq!(other.history_since(mark).len(), 1);
    }

    #[test]
    fn test_structured_output_accessors() {
        let mut map = Map::new();
        map.insert("flag".into(), json!(true));
        map.insert("name".into(), json!("x"));
        let output = StructuredOutput(map);
        assert!(output.get_bool("flag"));
        assert_eq!(output.get_str("name"), "x");
        assert_eq!(output.get_str("missing"), "");
        assert!(output.get_object("missing").is_empty());
    }

    #[test]
    fn test_validate_against_missing_field() {
        let request = CompletionRequest::new("m").output("needed", "", FieldKind::Text);
        let output = StructuredOutput::default();
        assert!(output.validate_against(&request).is_err());
    }
}
