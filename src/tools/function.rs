//! Function-to-tool factory.
//!
//! Wraps a plain async function into a [`Tool`] with an explicit,
//! declarative input schema. The builder refuses functions whose
//! parameters cannot be described: every input needs a type tag and a
//! description, and a handler must be supplied.
//!
//! Raw return values are mapped into events by type: strings become
//! assistant text, objects and lists become results carrying the tool
//! name and inputs used in their metadata, scalars are wrapped under a
//! `tool_result` key.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_stream::try_stream;
use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::events::{JsonObject, ResultEvent, ToolEvent};

use super::traits::{InputSpec, Tool, ToolContext, ToolEventStream, ToolInputs, ToolSchema};

type Handler =
    dyn Fn(ToolContext, ToolInputs) -> BoxFuture<'static, Result<Value>> + Send + Sync;

/// A tool backed by a plain async function.
pub struct FnTool {
    schema: ToolSchema,
    handler: Arc<Handler>,
}

#[async_trait]
impl Tool for FnTool {
    fn schema(&self) -> &ToolSchema {
        &self.schema
    }

    fn invoke(&self, ctx: ToolContext, inputs: ToolInputs) -> ToolEventStream {
        let handler = Arc::clone(&self.handler);
        let tool_name = self.schema.name.clone();
        Box::pin(try_stream! {
            let value = handler(ctx, inputs.clone()).await?;
            if let Some(event) = value_to_event(&tool_name, &inputs, value) {
                yield event;
            }
        })
    }
}

/// Builder for [`FnTool`].
pub struct FnToolBuilder {
    name: String,
    description: String,
    status: Option<String>,
    ends_conversation: bool,
    inputs: BTreeMap<String, InputSpec>,
    handler: Option<Arc<Handler>>,
}

impl FnToolBuilder {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        FnToolBuilder {
            name: name.into(),
            description: description.into(),
            status: None,
            ends_conversation: false,
            inputs: BTreeMap::new(),
            handler: None,
        }
    }

    pub fn status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }

    pub fn ends_conversation(mut self) -> Self {
        self.ends_conversation = true;
        self
    }

    pub fn input(mut self, name: impl Into<String>, spec: InputSpec) -> Self {
        self.inputs.insert(name.into(), spec);
        self
    }

    pub fn handler<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(ToolContext, ToolInputs) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Value>> + Send + 'static,
    {
        self.handler = Some(Arc::new(move |ctx, inputs| Box::pin(f(ctx, inputs))));
        self
    }

    pub fn build(self) -> Result<FnTool> {
        if self.name.is_empty() {
            return Err(Error::InvalidInput("Tool name must not be empty".into()));
        }
        let handler = self
            .handler
            .ok_or_else(|| Error::InvalidInput(format!("Tool '{}' has no handler", self.name)))?;
        for (name, spec) in &self.inputs {
            if name == "inputs" {
                return Err(Error::InvalidInput(format!(
                    "The input name 'inputs' is reserved (tool '{}')",
                    self.name
                )));
            }
            if spec.kind.is_empty() || spec.description.is_empty() {
                return Err(Error::InvalidInput(format!(
                    "Input '{}' of tool '{}' cannot be described by the schema: \
                     a type tag and a description are required",
                    name, self.name
                )));
            }
        }

        let mut schema = ToolSchema::new(self.name, self.description);
        if let Some(status) = self.status {
            schema = schema.with_status(status);
        }
        if self.ends_conversation {
            schema = schema.ends_conversation();
        }
        for (name, spec) in self.inputs {
            schema = schema.with_input(name, spec);
        }

        Ok(FnTool { schema, handler })
    }
}

fn value_to_event(tool_name: &str, inputs: &ToolInputs, value: Value) -> Option<ToolEvent> {
    let metadata = || {
        let mut metadata = Map::new();
        metadata.insert("tool_name".into(), Value::String(tool_name.into()));
        metadata.insert("inputs_used".into(), Value::Object(inputs.clone()));
        metadata
    };
    match value {
        Value::Null => None,
        Value::String(text) => Some(ToolEvent::response(text)),
        Value::Object(object) => Some(ToolEvent::Result(
            ResultEvent::new(vec![object]).with_metadata(metadata()),
        )),
        Value::Array(items) => {
            let objects = items.into_iter().map(wrap_scalar).collect();
            Some(ToolEvent::Result(
                ResultEvent::new(objects).with_metadata(metadata()),
            ))
        }
        scalar => Some(ToolEvent::Result(
            ResultEvent::new(vec![wrap_scalar(scalar)]).with_metadata(metadata()),
        )),
    }
}

fn wrap_scalar(value: Value) -> JsonObject {
    match value {
        Value::Object(object) => object,
        other => {
            let mut wrapped = Map::new();
            wrapped.insert("tool_result".into(), other);
            wrapped
        }
    }
}
