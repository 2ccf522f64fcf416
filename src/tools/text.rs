//! Text response tools.
//!
//! `text_response` is the ordinary conversation-ending tool: the decision
//! agent supplies the text to display. The forced variant generates a
//! closing message itself and is invoked by the engine when a run stops
//! at a node that was not declared an end.

use async_stream::try_stream;
use async_trait::async_trait;
use serde_json::Value;

use crate::agent::chain::ChainOfThought;
use crate::core::lm::{FieldKind, OutputField};
use crate::events::ToolEvent;

use super::traits::{InputSpec, Tool, ToolContext, ToolEventStream, ToolInputs, ToolSchema};

/// Name of the ordinary conversation-ending tool.
pub const TEXT_RESPONSE: &str = "text_response";

/// Name of the synthetic closing-response tool.
pub const FORCED_TEXT_RESPONSE: &str = "final_text_response";

const TEXT_RESPONSE_DESCRIPTION: &str = "End the conversation. This should be used when the \
user has finished their query, or you have nothing more to do except reply. Use this to answer \
conversational questions not related to other tools, but do not use it as a source of \
information: all information should come from the environment when answering a complex \
question. If there is an error and you could not complete a task, use this tool to suggest a \
brief reason why, with a fix when the user can apply one.";

const TEXT_INPUT_DESCRIPTION: &str = "The text to display to the user. Speak directly to them. \
If you have achieved the goal, give a satisfying answer to their original prompt; if not, \
explain any shortcomings and useful follow-ups. Be polite, professional, apologetic if \
necessary but above all helpful. The text in this field is the DIRECT response shown to the \
user, ending the conversation afterwards.";

const RESPONSE_FIELD_DESCRIPTION: &str = "The direct response to the user, based on everything \
gathered so far. If the process was cut short, say so and summarise what was achieved.";

/// The LM-facing conversation-ending tool.
pub struct TextResponse {
    schema: ToolSchema,
}

impl Default for TextResponse {
    fn default() -> Self {
        Self::new()
    }
}

impl TextResponse {
    pub fn new() -> Self {
        TextResponse {
            schema: ToolSchema::new(TEXT_RESPONSE, TEXT_RESPONSE_DESCRIPTION)
                .with_status("Writing response...")
                .with_input(
                    "text",
                    InputSpec::new("string", TEXT_INPUT_DESCRIPTION)
                        .with_default(Value::String(String::new())),
                )
                .ends_conversation(),
        }
    }
}

#[async_trait]
impl Tool for TextResponse {
    fn schema(&self) -> &ToolSchema {
        &self.schema
    }

    fn invoke(&self, _ctx: ToolContext, inputs: ToolInputs) -> ToolEventStream {
        Box::pin(try_stream! {
            let text = inputs
                .get("text")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            yield ToolEvent::response(text);
        })
    }
}

/// Synthesises a closing assistant message from the environment and the
/// tasks-completed log. Invoked by the engine, never offered to the LM.
pub struct ForcedTextResponse {
    schema: ToolSchema,
}

impl Default for ForcedTextResponse {
    fn default() -> Self {
        Self::new()
    }
}

impl ForcedTextResponse {
    pub fn new() -> Self {
        ForcedTextResponse {
            schema: ToolSchema::new(FORCED_TEXT_RESPONSE, "")
                .with_status("Writing response...")
                .ends_conversation(),
        }
    }
}

#[async_trait]
impl Tool for ForcedTextResponse {
    fn schema(&self) -> &ToolSchema {
        &self.schema
    }

    fn invoke(&self, ctx: ToolContext, _inputs: ToolInputs) -> ToolEventStream {
        Box::pin(try_stream! {
            let chain = ChainOfThought::new(TEXT_RESPONSE)
                .with_environment()
                .with_tasks_completed()
                .reasoning(ctx.tree_data.settings.base_use_reasoning);
            let output = chain
                .forward(
                    &ctx.base_lm,
                    &ctx.tree_data,
                    vec![],
                    vec![OutputField::new(
                        "response",
                        RESPONSE_FIELD_DESCRIPTION,
                        FieldKind::Text,
                    )],
                    vec![],
                )
                .await?;
            yield ToolEvent::response(output.get_str("response"));
        })
    }
}
