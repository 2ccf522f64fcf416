//! Decision nodes and the per-node decision protocol.
//!
//! A node offers labelled options: tools, or sub-branches leading to
//! further nodes. Nodes reference each other by id (the tree owns the
//! id-keyed node map), so the graph carries no owning cycles.

use serde_json::{json, Map, Value};
use tracing::debug;

use crate::agent::chain::ChainOfThought;
use crate::agent::feedback;
use crate::core::lm::{FieldKind, InputField, LmHandle, OutputField};
use crate::error::{Error, Result};
use crate::events::{JsonObject, ToolEvent, TrainingUpdate, TreeUpdate, UpdateEvent};
use crate::store::pool::ClientPool;
use crate::tools::{InputSpec, TEXT_RESPONSE};
use crate::tree::data::TreeData;

use std::collections::BTreeMap;

const DECISION_MODULE: &str = "decision";
const FEEDBACK_EXAMPLES: usize = 3;

const INSTRUCTION_DESC: &str =
    "The task for this decision: what kind of actions are being decided here.";
const TREE_COUNT_DESC: &str = "How many decision iterations have been used, out of the maximum \
allowed. Plan the remaining actions accordingly.";
const AVAILABLE_DESC: &str = "The functions available to choose from, with their descriptions \
and input schemas.";
const UNAVAILABLE_DESC: &str = "Functions that exist but cannot be chosen right now, with the \
reason each one is unavailable.";
const SUCCESSIVE_DESC: &str = "For each option, the tree of actions that become available after \
choosing it. Use this to plan ahead.";
const FUNCTION_NAME_DESC: &str =
    "The name of the function to call next. Must be one of the available functions.";
const FUNCTION_INPUTS_DESC: &str = "Inputs for the chosen function as an object matching its \
declared input schema. Use {} when the function needs no inputs.";
const END_ACTIONS_DESC: &str = "Whether all actions for the user's prompt will be complete \
after this function finishes, so the conversation can end.";

/// The LM-produced structured choice for one node.
#[derive(Debug, Clone)]
pub struct Decision {
    pub function_name: String,
    pub function_inputs: JsonObject,
    pub reasoning: String,
    pub impossible: bool,
    pub end_actions: bool,
}

/// One labelled option on a decision node.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct NodeOption {
    pub id: String,
    pub description: String,
    pub inputs: BTreeMap<String, InputSpec>,
    /// Whether choosing this option invokes a tool (as opposed to
    /// descending into a sub-branch). Both this and `next` are set only
    /// for stemmed tools.
    pub is_tool: bool,
    pub ends_conversation: bool,
    pub status: String,
    /// Id of the node to descend into after this option, if any.
    pub next: Option<String>,
}

/// A choice point in the tree.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct DecisionNode {
    pub id: String,
    pub instruction: String,
    pub is_root: bool,
    pub options: Vec<NodeOption>,
}

/// Borrowed context for one decision.
pub struct DecideParams<'a> {
    pub tree_data: &'a TreeData,
    pub base_lm: &'a LmHandle,
    pub available: &'a [String],
    pub unavailable: &'a [(String, String)],
    pub successive_actions: Value,
    pub pool: Option<&'a ClientPool>,
    pub use_collection_schemas: bool,
}

impl DecisionNode {
    pub fn new(id: impl Into<String>, instruction: impl Into<String>, is_root: bool) -> Self {
        DecisionNode {
            id: id.into(),
            instruction: instruction.into(),
            is_root,
            options: Vec::new(),
        }
    }

    /// Add or replace an option, keeping declaration order for new ones.
    pub fn add_option(&mut self, option: NodeOption) {
        match self.options.iter().position(|o| o.id == option.id) {
            Some(i) => self.options[i] = option,
            None => self.options.push(option),
        }
    }

    pub fn remove_option(&mut self, id: &str) -> bool {
        let before = self.options.len();
        self.options.retain(|o| o.id != id);
        self.options.len() != before
    }

    pub fn option(&self, id: &str) -> Option<&NodeOption> {
        self.options.iter().find(|o| o.id == id)
    }

    pub fn option_mut(&mut self, id: &str) -> Option<&mut NodeOption> {
        self.options.iter_mut().find(|o| o.id == id)
    }

    pub fn option_ids(&self) -> Vec<&str> {
        self.options.iter().map(|o| o.id.as_str()).collect()
    }

    /// The catalog shown to the LM for the available options.
    fn options_catalog(&self, available: &[String]) -> Value {
        let mut out = Map::new();
        for option in &self.options {
            if !available.iter().any(|a| a == &option.id) {
                continue;
            }
            let inputs = if option.inputs.is_empty() {
                Value::String("No inputs are needed for this function.".into())
            } else {
                serde_json::to_value(&option.inputs).unwrap_or_default()
            };
            out.insert(
                option.id.clone(),
                json!({
                    "function_name": option.id,
                    "description": option.description,
                    "inputs": inputs,
                }),
            );
        }
        Value::Object(out)
    }

    /// The catalog of currently unavailable options, with reasons.
    fn unavailable_catalog(unavailable: &[(String, String)]) -> Value {
        let mut out = Map::new();
        for (id, reason) in unavailable {
            let reason = if reason.is_empty() {
                "No reason provided."
            } else {
                reason.as_str()
            };
            out.insert(
                id.clone(),
                json!({
                    "function_name": id,
                    "available_at": reason,
                }),
            );
        }
        Value::Object(out)
    }

    /// Training mode: pick the next id from the head of a preset route,
    /// bypassing the LM.
    pub fn decide_from_route(&self, route: &mut Vec<String>) -> Result<Decision> {
        let next = route
            .first()
            .cloned()
            .ok_or_else(|| Error::InvalidInput("Training route is empty".into()))?;
        if self.option(&next).is_none() {
            return Err(Error::InvalidInput(format!(
                "Next node in training route ('{}') is not an option of '{}' \
                 (available: {:?})",
                next,
                self.id,
                self.option_ids()
            )));
        }
        route.remove(0);
        Ok(Decision {
            function_name: next.clone(),
            function_inputs: Map::new(),
            reasoning: format!("Decided to run {} from the training route", next),
            impossible: false,
            end_actions: route.is_empty(),
        })
    }

    /// Run the decision protocol for this node.
    ///
    /// With exactly one available option that needs no inputs the LM is
    /// skipped; otherwise the LM chooses from the option catalog.
    pub async fn decide(&self, params: DecideParams<'_>) -> Result<(Decision, Vec<ToolEvent>)> {
        if params.available.is_empty() {
            return Err(Error::NoToolsAvailable(self.id.clone()));
        }
        debug!(node = %self.id, available = ?params.available, "Deciding");

        let one_choice = params.available.len() == 1
            && self
                .option(&params.available[0])
                .map(|o| o.inputs.is_empty())
                .unwrap_or(false);

        if one_choice {
            let option = self
                .option(&params.available[0])
                .expect("option checked above");
            let decision = Decision {
                function_name: option.id.clone(),
                function_inputs: Map::new(),
                reasoning: format!(
                    "Only one option available: {} (and no function inputs are needed).",
                    option.id
                ),
                impossible: false,
                end_actions: option.ends_conversation && option.next.is_none(),
            };
            let events = vec![
                ToolEvent::Update(UpdateEvent::TreeUpdate(TreeUpdate {
                    from_node: self.id.clone(),
                    to_node: option.id.clone(),
                    reasoning: decision.reasoning.clone(),
                    reset_tree: false,
                })),
                ToolEvent::status(option.status.clone()),
            ];
            return Ok((decision, events));
        }

        let settings = &params.tree_data.settings;

        let mut examples = Vec::new();
        let mut example_uuids = Vec::new();
        if settings.use_feedback {
            if let Some(pool) = params.pool {
                let lease = pool.lease().await?;
                let (fetched, uuids) = feedback::fetch_similar(
                    &*lease,
                    &params.tree_data.user_prompt,
                    DECISION_MODULE,
                    FEEDBACK_EXAMPLES,
                )
                .await?;
                examples = fetched;
                example_uuids = uuids;
            }
        }

        let mut chain = ChainOfThought::new(DECISION_MODULE)
            .with_environment()
            .with_tasks_completed()
            .with_message_update()
            .reasoning(settings.base_use_reasoning);
        if params.use_collection_schemas {
            chain = chain.with_collection_schemas();
        }

        let extra_inputs = vec![
            InputField::new(
                "instruction",
                INSTRUCTION_DESC,
                Value::String(self.instruction.clone()),
            ),
            InputField::new(
                "tree_count",
                TREE_COUNT_DESC,
                Value::String(params.tree_data.tree_count_string()),
            ),
            InputField::new(
                "available_actions",
                AVAILABLE_DESC,
                self.options_catalog(params.available),
            ),
            InputField::new(
                "unavailable_actions",
                UNAVAILABLE_DESC,
                Self::unavailable_catalog(params.unavailable),
            ),
            InputField::new(
                "successive_actions",
                SUCCESSIVE_DESC,
                params.successive_actions.clone(),
            ),
        ];
        let extra_outputs = vec![
            OutputField::new("function_name", FUNCTION_NAME_DESC, FieldKind::Text),
            OutputField::new("function_inputs", FUNCTION_INPUTS_DESC, FieldKind::Json),
            OutputField::new("end_actions", END_ACTIONS_DESC, FieldKind::Bool),
        ];

        let mut request = chain.build_request(params.tree_data, extra_inputs, extra_outputs);
        request.examples = examples;
        let request_inputs = request.inputs_json();
        let output = params.base_lm.complete(&request).await?;

        let function_name = output.get_str("function_name");
        if !params.available.iter().any(|a| a == &function_name) {
            return Err(Error::Lm(format!(
                "Model chose '{}', which is not an available option of node '{}'",
                function_name, self.id
            )));
        }
        let option = self
            .option(&function_name)
            .ok_or_else(|| Error::Internal(format!("Option '{}' vanished", function_name)))?;

        let decision = Decision {
            function_name: function_name.clone(),
            function_inputs: output.get_object("function_inputs"),
            reasoning: output.get_str("reasoning"),
            impossible: output.get_bool("impossible"),
            end_actions: output.get_bool("end_actions"),
        };

        let mut events = vec![
            ToolEvent::Update(UpdateEvent::Training(TrainingUpdate {
                module_name: DECISION_MODULE.into(),
                inputs: request_inputs,
                outputs: output.to_json(),
            })),
            ToolEvent::Update(UpdateEvent::TreeUpdate(TreeUpdate {
                from_node: self.id.clone(),
                to_node: function_name.clone(),
                reasoning: decision.reasoning.clone(),
                reset_tree: false,
            })),
            ToolEvent::status(option.status.clone()),
        ];

        if function_name != TEXT_RESPONSE {
            let message_update = output.get_str("message_update");
            if !message_update.is_empty() {
                events.push(ToolEvent::response(message_update));
            }
        }
        if settings.use_feedback && !example_uuids.is_empty() {
            events.push(ToolEvent::Update(UpdateEvent::FewShotExamples {
                uuids: example_uuids,
            }));
        }

        Ok((decision, events))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::test_support::{scripted_lm, ScriptedOutput};
    use crate::tree::data::Persona;

    fn tool_option(id: &str, end: bool) -> NodeOption {
        NodeOption {
            id: id.into(),
            description: format!("The {} tool", id),
            inputs: BTreeMap::new(),
            is_tool: true,
            ends_conversation: end,
            status: format!("Running {}...", id),
            next: None,
        }
    }

    fn tree_data() -> TreeData {
        let mut data = TreeData::new(Persona::default(), Settings::default());
        data.user_prompt = "hello".into();
        data
    }

    fn node_with(options: Vec<NodeOption>) -> DecisionNode {
        let mut node = DecisionNode::new("base", "Choose a task.", true);
        for option in options {
            node.add_option(option);
        }
        node
    }

    #[tokio::test]
    async fn test_no_available_tools_fails_fast() {
        let node = node_with(vec![tool_option("query", false)]);
        let lm = scripted_lm(vec![]);
        let data = tree_data();
        let result = node
            .decide(DecideParams {
                tree_data: &data,
                base_lm: &lm,
                available: &[],
                unavailable: &[("query".into(), "offline".into())],
                successive_actions: json!({}),
                pool: None,
                use_collection_schemas: false,
            })
            .await;
        assert!(matches!(result, Err(Error::NoToolsAvailable(_))));
    }

    #[tokio::test]
    async fn test_single_inputless_option_skips_lm() {
        let node = node_with(vec![tool_option("text_response", true)]);
        let lm = scripted_lm(vec![]);
        let data = tree_data();
        let (decision, events) = node
            .decide(DecideParams {
                tree_data: &data,
                base_lm: &lm,
                available: &["text_response".to_string()],
                unavailable: &[],
                successive_actions: json!({}),
                pool: None,
                use_collection_schemas: false,
            })
            .await
            .unwrap();

        assert_eq!(decision.function_name, "text_response");
        assert!(decision.end_actions);
        assert!(decision.reasoning.contains("Only one option"));
        assert_eq!(lm.history_len(), 0);
        assert_eq!(events.len(), 2);
        assert!(matches!(
            events[0],
            ToolEvent::Update(UpdateEvent::TreeUpdate(_))
        ));
        assert!(matches!(events[1], ToolEvent::Update(UpdateEvent::Status { .. })));
    }

    #[tokio::test]
    async fn test_lm_decision_emits_ordered_events() {
        let node = node_with(vec![tool_option("query", false), tool_option("text_response", true)]);
        let lm = scripted_lm(vec![ScriptedOutput::new(&[
            ("function_name", json!("query")),
            ("reasoning", json!("need data")),
            ("message_update", json!("Searching the catalog now.")),
        ])]);
        let data = tree_data();
        let (decision, events) = node
            .decide(DecideParams {
                tree_data: &data,
                base_lm: &lm,
                available: &["query".to_string(), "text_response".to_string()],
                unavailable: &[],
                successive_actions: json!({}),
                pool: None,
                use_collection_schemas: false,
            })
            .await
            .unwrap();

        assert_eq!(decision.function_name, "query");
        assert!(!decision.end_actions);
        assert!(matches!(
            events[0],
            ToolEvent::Update(UpdateEvent::Training(_))
        ));
        assert!(matches!(
            events[1],
            ToolEvent::Update(UpdateEvent::TreeUpdate(_))
        ));
        assert!(matches!(events[2], ToolEvent::Update(UpdateEvent::Status { .. })));
        assert!(matches!(events[3], ToolEvent::Text(_)));
    }

    #[tokio::test]
    async fn test_text_response_suppresses_message_update() {
        let node = node_with(vec![tool_option("query", false), tool_option("text_response", true)]);
        let lm = scripted_lm(vec![ScriptedOutput::new(&[
            ("function_name", json!("text_response")),
            ("message_update", json!("should not appear")),
        ])]);
        let data = tree_data();
        let (_, events) = node
            .decide(DecideParams {
                tree_data: &data,
                base_lm: &lm,
                available: &["query".to_string(), "text_response".to_string()],
                unavailable: &[],
                successive_actions: json!({}),
                pool: None,
                use_collection_schemas: false,
            })
            .await
            .unwrap();
        assert!(!events.iter().any(|e| matches!(e, ToolEvent::Text(_))));
    }

    #[tokio::test]
    async fn test_unavailable_choice_is_rejected() {
        let node = node_with(vec![tool_option("query", false), tool_option("text_response", true)]);
        let lm = scripted_lm(vec![ScriptedOutput::new(&[(
            "function_name",
            json!("query"),
        )])]);
        let data = tree_data();
        // "query" is registered but currently unavailable.
        let result = node
            .decide(DecideParams {
                tree_data: &data,
                base_lm: &lm,
                available: &["text_response".to_string(), "other".to_string()],
                unavailable: &[("query".into(), "gated".into())],
                successive_actions: json!({}),
                pool: None,
                use_collection_schemas: false,
            })
            .await;
        assert!(matches!(result, Err(Error::Lm(_))));
    }

    #[test]
    fn test_decide_from_route() {
        let node = node_with(vec![tool_option("query", false)]);
        let mut route = vec!["query".to_string(), "text_response".to_string()];
        let decision = node.decide_from_route(&mut route).unwrap();
        assert_eq!(decision.function_name, "query");
        assert!(!decision.end_actions);
        assert_eq!(route, vec!["text_response".to_string()]);

        let mut bad_route = vec!["missing".to_string()];
        assert!(node.decide_from_route(&mut bad_route).is_err());
    }

    #[test]
    fn test_catalog_marks_inputless_functions() {
        let mut with_inputs = tool_option("query", false);
        with_inputs.inputs.insert(
            "term".into(),
            InputSpec::new("string", "search term").required(),
        );
        let node = node_with(vec![with_inputs, tool_option("text_response", true)]);
        let catalog = node.options_catalog(&[
            "query".to_string(),
            "text_response".to_string(),
        ]);
        assert!(catalog["query"]["inputs"].is_object());
        assert_eq!(
            catalog["text_response"]["inputs"],
            json!("No inputs are needed for this function.")
        );
    }
}
