//! Chain-of-thought request builder.
//!
//! Wraps a module's own fields with the inputs every agent needs (user
//! prompt, conversation history, persona, and optionally the environment,
//! collection schemas and tasks-completed log) and the outputs every
//! agent produces (leading `reasoning` when enabled, trailing
//! `impossible`, optional `message_update`).

use serde_json::Value;

use crate::core::lm::{
    CompletionRequest, FewShotExample, FieldKind, InputField, LmHandle, OutputField,
    StructuredOutput,
};
use crate::error::Result;
use crate::tree::data::TreeData;

const USER_PROMPT_DESC: &str = "The user's original question/prompt that needs to be answered. \
This, possibly combined with the conversation history, will be used to determine your current action.";

const CONVERSATION_DESC: &str = "Previous messages between user and assistant in chronological \
order: [{'role': 'user'|'assistant', 'content': str}]. Use this to maintain conversation context \
and avoid repetition.";

const PERSONA_DESC: &str =
    "Your guide to how you should proceed as an agent in this task. This is pre-defined by the user.";

const REASONING_DESC: &str = "Reasoning: repeat relevant parts of any context within your \
environment, use this to think step by step in order to answer the query.";

const IMPOSSIBLE_DESC: &str = "Given the actions you have available, and the \
environment/information: is the task impossible to complete? I.e., do you wish that you had a \
different task to perform/choose from and hence should return to the base of the decision tree?";

const ENVIRONMENT_DESC: &str = "Information gathered from completed tasks. Empty if no data has \
been retrieved yet. Use to determine if more information is needed, and as a reference for what \
has already been done, to avoid repeating actions. All items here are already shown to the user, \
so do not repeat information from these fields unless summarising or providing extra information.";

const COLLECTION_SCHEMAS_DESC: &str = "Metadata about available collections and their schemas: \
{ name: { summary, fields: { ... } } }. Use to determine whether the user's request is possible, \
or for information if your task needs it.";

const TASKS_COMPLETED_DESC: &str = "Which tasks have been completed in order, separated by \
prompts. Includes reasoning for each task, to continue a decision logic across tasks. Use this \
to determine whether further work for this prompt is necessary. It is IMPORTANT that you \
separate what actions have been completed for which prompt.";

const MESSAGE_UPDATE_DESC: &str = "Continue your current message to the user (latest assistant \
entry in the conversation history) with ONE concise sentence that describes NEW technical \
details about your latest action. Avoid repeating anything from the conversation history and \
speak directly to them. Just provide the new sentence, not the full message.";

/// Builds completion requests with the shared agent fields attached.
#[derive(Debug, Clone)]
pub struct ChainOfThought {
    pub module: String,
    /// Include the environment JSON as an input.
    pub environment: bool,
    /// Include the active collections' schemas as an input.
    pub collection_schemas: bool,
    /// Include the rendered tasks-completed log as an input.
    pub tasks_completed: bool,
    /// Ask for a brief user-facing update sentence.
    pub message_update: bool,
    /// Emit the leading `reasoning` output field.
    pub use_reasoning: bool,
    /// Restrict the schema input to these collections (empty = all active).
    pub collection_names: Vec<String>,
}

impl ChainOfThought {
    pub fn new(module: impl Into<String>) -> Self {
        ChainOfThought {
            module: module.into(),
            environment: false,
            collection_schemas: false,
            tasks_completed: false,
            message_update: false,
            use_reasoning: true,
            collection_names: Vec::new(),
        }
    }

    pub fn with_environment(mut self) -> Self {
        self.environment = true;
        self
    }

    pub fn with_collection_schemas(mut self) -> Self {
        self.collection_schemas = true;
        self
    }

    pub fn with_tasks_completed(mut self) -> Self {
        self.tasks_completed = true;
        self
    }

    pub fn with_message_update(mut self) -> Self {
        self.message_update = true;
        self
    }

    pub fn reasoning(mut self, enabled: bool) -> Self {
        self.use_reasoning = enabled;
        self
    }

    /// Assemble the full request around the module's own fields.
    pub fn build_request(
        &self,
        tree_data: &TreeData,
        extra_inputs: Vec<InputField>,
        extra_outputs: Vec<OutputField>,
    ) -> CompletionRequest {
        let mut request = CompletionRequest::new(self.module.clone());

        request.inputs.push(InputField::new(
            "user_prompt",
            USER_PROMPT_DESC,
            Value::String(tree_data.user_prompt.clone()),
        ));
        request.inputs.extend(extra_inputs);
        request.inputs.push(InputField::new(
            "conversation_history",
            CONVERSATION_DESC,
            serde_json::to_value(&tree_data.conversation_history).unwrap_or_default(),
        ));
        request.inputs.push(InputField::new(
            "persona",
            PERSONA_DESC,
            tree_data.persona.to_json(),
        ));

        if self.environment {
            request.inputs.push(InputField::new(
                "environment",
                ENVIRONMENT_DESC,
                tree_data.environment.to_json(),
            ));
        }
        if self.collection_schemas {
            let names = if self.collection_names.is_empty() {
                None
            } else {
                Some(self.collection_names.as_slice())
            };
            request.inputs.push(InputField::new(
                "collection_schemas",
                COLLECTION_SCHEMAS_DESC,
                tree_data.collection_data.schemas_json(names, false),
            ));
        }
        if self.tasks_completed {
            request.inputs.push(InputField::new(
                "tasks_completed",
                TASKS_COMPLETED_DESC,
                Value::String(tree_data.tasks_completed_string()),
            ));
        }

        if self.use_reasoning {
            request
                .outputs
                .push(OutputField::new("reasoning", REASONING_DESC, FieldKind::Text));
        }
        request.outputs.extend(extra_outputs);
        request.outputs.push(OutputField::new(
            "impossible",
            IMPOSSIBLE_DESC,
            FieldKind::Bool,
        ));
        if self.message_update {
            request.outputs.push(OutputField::new(
                "message_update",
                MESSAGE_UPDATE_DESC,
                FieldKind::Text,
            ));
        }

        request
    }

    /// Build and run in one step.
    pub async fn forward(
        &self,
        lm: &LmHandle,
        tree_data: &TreeData,
        extra_inputs: Vec<InputField>,
        extra_outputs: Vec<OutputField>,
        examples: Vec<FewShotExample>,
    ) -> Result<StructuredOutput> {
        let mut request = self.build_request(tree_data, extra_inputs, extra_outputs);
        request.examples = examples;
        lm.complete(&request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::tree::data::{Persona, Role, TreeData};
    use serde_json::json;

    fn tree_data() -> TreeData {
        let mut data = TreeData::new(Persona::default(), Settings::default());
        data.user_prompt = "What products do we have?".into();
        data.append_conversation(Role::User, "What products do we have?");
        data
    }

    #[test]
    fn test_base_fields_always_present() {
        let request = ChainOfThought::new("decision").build_request(&tree_data(), vec![], vec![]);
        let input_names: Vec<_> = request.inputs.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(
            input_names,
            vec!["user_prompt", "conversation_history", "persona"]
        );
        let output_names: Vec<_> = request.outputs.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(output_names, vec!["reasoning", "impossible"]);
    }

    #[test]
    fn test_reasoning_leads_and_impossible_trails() {
        let chain = ChainOfThought::new("decision").with_message_update();
        let request = chain.build_request(
            &tree_data(),
            vec![],
            vec![OutputField::new("function_name", "", FieldKind::Text)],
        );
        let names: Vec<_> = request.outputs.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["reasoning", "function_name", "impossible", "message_update"]
        );
    }

    #[test]
    fn test_reasoning_can_be_disabled() {
        let request = ChainOfThought::new("decision")
            .reasoning(false)
            .build_request(&tree_data(), vec![], vec![]);
        assert!(request.outputs.iter().all(|f| f.name != "reasoning"));
    }

    #[test]
    fn test_optional_inputs_follow_flags() {
        let chain = ChainOfThought::new("decision")
            .with_environment()
            .with_tasks_completed();
        let request = chain.build_request(&tree_data(), vec![], vec![]);
        let names: Vec<_> = request.inputs.iter().map(|f| f.name.as_str()).collect();
        assert!(names.contains(&"environment"));
        assert!(names.contains(&"tasks_completed"));
        assert!(!names.contains(&"collection_schemas"));
    }

    #[test]
    fn test_extra_inputs_sit_after_user_prompt() {
        let request = ChainOfThought::new("decision").build_request(
            &tree_data(),
            vec![InputField::new("instruction", "", json!("choose"))],
            vec![],
        );
        assert_eq!(request.inputs[0].name, "user_prompt");
        assert_eq!(request.inputs[1].name, "instruction");
    }
}
