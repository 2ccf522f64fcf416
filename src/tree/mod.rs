//! The decision tree: graph ownership, mutation, the main loop and
//! persistence.
//!
//! A `Tree` owns an id-keyed map of decision nodes (options reference
//! nodes by id, so there are no owning cycles), the tool registry, the
//! per-prompt [`TreeData`] and the streaming [`EventSink`]. `run`
//! walks the tree from the root, asking the LM which option to take at
//! each node, invoking tools and integrating their events, until the
//! goal is judged complete or the recursion budget is exhausted.

pub mod data;
pub mod environment;
pub mod node;
pub mod sink;

use std::collections::BTreeMap;
use std::pin::pin;
use std::sync::Arc;
use std::time::Instant;

use async_stream::try_stream;
use futures::{Stream, StreamExt};
use serde_json::{json, Map, Value};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::agent::client::{load_base_lm, load_complex_lm};
use crate::core::lm::{CompletionRequest, FieldKind, LmHandle};
use crate::error::{Error, Result};
use crate::events::{
    ErrorEvent, JsonObject, ToolEvent, TrainingUpdate, TreeUpdate, UpdateEvent,
};
use crate::store::persist;
use crate::store::pool::ClientPool;
use crate::tools::{ForcedTextResponse, TextResponse, Tool, ToolContext, TEXT_RESPONSE};
use crate::tracker::Tracker;
use crate::config::Settings;

use data::{Persona, Role, TreeData};
use node::{DecideParams, Decision, DecisionNode, NodeOption};
use sink::EventSink;

const DECISION_TRACKER: &str = "decision_node";

const DEFAULT_ROOT_INSTRUCTION: &str = "Choose a base-level task based on the user's prompt and \
available information. Decide based on the tools you have available as well as their \
descriptions. Read them thoroughly and match the actions to the user prompt.";

const STEM_INSTRUCTION: &str =
    "Choose one of the actions based on their descriptions and the user prompt.";

const SUGGESTIONS_CONTEXT: &str = "You are an agentic RAG service querying or aggregating \
information from collections in a vector store. Create questions that are natural follow-ups \
to the user's prompt, which they may find interesting or which create relevant insights into \
the already retrieved data, or questions which span other collections but are still relevant.";

/// Which branches a new tree starts with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BranchInit {
    /// A root branch with the text-response tool attached.
    Default,
    /// A bare root branch; the caller adds every tool.
    Empty,
}

impl Default for BranchInit {
    fn default() -> Self {
        BranchInit::Default
    }
}

/// Construction options for [`Tree::new`].
#[derive(Debug, Clone, Default)]
pub struct TreeOptions {
    pub branch_init: BranchInit,
    pub persona: Persona,
    pub user_id: Option<String>,
    pub conversation_id: Option<String>,
    /// Include preprocessed collection schemas in decision prompts.
    pub use_collection_schemas: bool,
    pub settings: Option<Settings>,
}

impl TreeOptions {
    pub fn with_collections() -> Self {
        TreeOptions {
            use_collection_schemas: true,
            ..Default::default()
        }
    }
}

/// Where a new branch attaches.
#[derive(Debug, Clone, Default)]
pub struct BranchConfig {
    pub id: String,
    /// Guidance shown to the decision agent once this branch is reached.
    pub instruction: String,
    /// How the decision agent knows whether to choose this branch.
    /// Required for non-root branches.
    pub description: String,
    pub is_root: bool,
    pub from_branch_id: Option<String>,
    /// Tool ids preceding this branch under `from_branch_id` (stemming).
    pub from_tool_ids: Vec<String>,
    pub status: String,
}

impl BranchConfig {
    pub fn root(id: impl Into<String>, instruction: impl Into<String>) -> Self {
        BranchConfig {
            id: id.into(),
            instruction: instruction.into(),
            is_root: true,
            ..Default::default()
        }
    }

    pub fn branching_from(
        id: impl Into<String>,
        instruction: impl Into<String>,
        description: impl Into<String>,
        from_branch_id: impl Into<String>,
    ) -> Self {
        BranchConfig {
            id: id.into(),
            instruction: instruction.into(),
            description: description.into(),
            from_branch_id: Some(from_branch_id.into()),
            ..Default::default()
        }
    }
}

/// Options for one [`Tree::run`] call.
#[derive(Default)]
pub struct RunOptions {
    pub collection_names: Vec<String>,
    pub pool: Option<ClientPool>,
    /// Preset `/`-separated path of option ids (training mode).
    pub training_route: Option<String>,
    pub query_id: Option<String>,
    /// Close the pool once the run completes. Defaults to false so an
    /// externally managed pool survives the run.
    pub close_pool_after: bool,
}

/// Collected output of a run: the final assistant text and the objects
/// retrieved along the way.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub text: String,
    pub objects: Vec<Value>,
}

/// The decision-tree orchestrator.
pub struct Tree {
    pub user_id: String,
    pub conversation_id: String,
    conversation_title: Option<String>,
    settings: Settings,
    branch_init: BranchInit,
    use_collection_schemas: bool,

    nodes: BTreeMap<String, DecisionNode>,
    root: Option<String>,
    tools: BTreeMap<String, Arc<dyn Tool>>,
    forced_text: Arc<dyn Tool>,

    tree_data: TreeData,
    tracker: Tracker,
    sink: EventSink,
    shape: Value,

    tree_index: i64,
    decision_history: Vec<Vec<String>>,
    action_information: Vec<Value>,
    training_updates: Vec<TrainingUpdate>,
    history: BTreeMap<String, Value>,
    query_id_to_prompt: BTreeMap<String, String>,
    prompt_to_query_id: BTreeMap<String, String>,
    retrieved_objects: Vec<Value>,
    store_retrieved_objects: bool,
    suggestions: Vec<String>,

    base_lm: Option<LmHandle>,
    complex_lm: Option<LmHandle>,
    start_time: Option<Instant>,
}

impl Tree {
    pub fn new(options: TreeOptions) -> Self {
        let user_id = options
            .user_id
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let conversation_id = options
            .conversation_id
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let settings = options.settings.unwrap_or_default();

        let mut tree = Tree {
            user_id: user_id.clone(),
            conversation_id: conversation_id.clone(),
            conversation_title: None,
            settings: settings.clone(),
            branch_init: options.branch_init,
            use_collection_schemas: options.use_collection_schemas,
            nodes: BTreeMap::new(),
            root: None,
            tools: BTreeMap::new(),
            forced_text: Arc::new(ForcedTextResponse::new()),
            tree_data: TreeData::new(options.persona, settings),
            tracker: Tracker::new(&[DECISION_TRACKER]),
            sink: EventSink::new(user_id, conversation_id),
            shape: Value::Object(Map::new()),
            tree_index: -1,
            decision_history: vec![vec![]],
            action_information: Vec::new(),
            training_updates: Vec::new(),
            history: BTreeMap::new(),
            query_id_to_prompt: BTreeMap::new(),
            prompt_to_query_id: BTreeMap::new(),
            retrieved_objects: Vec::new(),
            store_retrieved_objects: false,
            suggestions: Vec::new(),
            base_lm: None,
            complex_lm: None,
            start_time: None,
        };
        tree.apply_branch_init();
        tree
    }

    fn apply_branch_init(&mut self) {
        self.nodes.clear();
        self.root = None;
        self.tools.clear();
        self.add_branch(BranchConfig::root("base", DEFAULT_ROOT_INSTRUCTION))
            .expect("root branch init cannot fail");
        if self.branch_init == BranchInit::Default {
            self.add_tool(Arc::new(TextResponse::new()), None, &[])
                .expect("preset tool registration cannot fail");
        }
    }

    // -- accessors ----------------------------------------------------------

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Replace the settings snapshot (the tree never consults global
    /// state, so this is the only way to reconfigure it).
    pub fn configure(&mut self, options: BTreeMap<String, Value>) {
        self.settings.configure(options);
        self.tree_data.settings = self.settings.clone();
        self.base_lm = None;
        self.complex_lm = None;
    }

    pub fn tree_data(&self) -> &TreeData {
        &self.tree_data
    }

    pub fn environment(&self) -> &environment::Environment {
        &self.tree_data.environment
    }

    pub fn environment_mut(&mut self) -> &mut environment::Environment {
        &mut self.tree_data.environment
    }

    pub fn conversation_history(&self) -> &[data::ChatMessage] {
        &self.tree_data.conversation_history
    }

    pub fn conversation_title(&self) -> Option<&str> {
        self.conversation_title.as_deref()
    }

    /// The read-only JSON shape of the graph.
    pub fn shape(&self) -> &Value {
        &self.shape
    }

    /// The wire transcript accumulated so far.
    pub fn transcript(&self) -> &[Value] {
        &self.sink.store
    }

    /// Flattened decision history across iterations of the last prompt.
    pub fn decision_history(&self) -> Vec<String> {
        self.decision_history.iter().flatten().cloned().collect()
    }

    pub fn tracker(&self) -> &Tracker {
        &self.tracker
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }

    pub fn set_recursion_limit(&mut self, limit: u32) {
        self.tree_data.recursion_limit = limit;
    }

    pub fn set_style(&mut self, style: impl Into<String>) {
        self.tree_data.persona.style = style.into();
    }

    pub fn set_agent_description(&mut self, description: impl Into<String>) {
        self.tree_data.persona.agent_description = description.into();
    }

    pub fn set_end_goal(&mut self, end_goal: impl Into<String>) {
        self.tree_data.persona.end_goal = end_goal.into();
    }

    pub fn set_user_id(&mut self, user_id: impl Into<String>) {
        self.user_id = user_id.into();
        self.sink.user_id = self.user_id.clone();
    }

    pub fn set_conversation_id(&mut self, conversation_id: impl Into<String>) {
        self.conversation_id = conversation_id.into();
        self.sink.conversation_id = self.conversation_id.clone();
    }

    /// Inject LM handles directly (otherwise they are built from the
    /// settings on first use).
    pub fn set_lms(&mut self, base: LmHandle, complex: LmHandle) {
        self.base_lm = Some(base);
        self.complex_lm = Some(complex);
    }

    fn ensure_lms(&mut self) -> Result<()> {
        if self.base_lm.is_none() {
            self.base_lm = Some(load_base_lm(&self.settings)?);
        }
        if self.complex_lm.is_none() {
            self.complex_lm = Some(load_complex_lm(&self.settings)?);
        }
        Ok(())
    }

    fn tool_context(&self, pool: Option<&ClientPool>) -> Result<ToolContext> {
        Ok(ToolContext {
            tree_data: self.tree_data.clone(),
            base_lm: self
                .base_lm
                .clone()
                .ok_or_else(|| Error::Config("No base model configured".into()))?,
            complex_lm: self
                .complex_lm
                .clone()
                .ok_or_else(|| Error::Config("No complex model configured".into()))?,
            pool: pool.cloned(),
        })
    }

    // -- mutation -----------------------------------------------------------

    /// Add a branch. Non-root branches must carry a description and name
    /// the branch (and optionally the tool path) they stem from.
    /// Declaring a new root replaces the old one.
    pub fn add_branch(&mut self, config: BranchConfig) -> Result<()> {
        if !config.is_root && config.description.is_empty() {
            return Err(Error::InvalidInput(
                "Description is required for non-root branches".into(),
            ));
        }
        if !config.is_root && config.from_branch_id.is_none() {
            return Err(Error::InvalidInput(
                "from_branch_id is required for non-root branches; \
                 set is_root to create a root branch"
                    .into(),
            ));
        }

        let node = DecisionNode::new(&config.id, &config.instruction, config.is_root);

        if config.is_root {
            let old_root = self.root.clone();
            self.nodes.insert(config.id.clone(), node);
            self.root = Some(config.id.clone());
            if let Some(old) = old_root {
                if old != config.id {
                    debug!(old = %old, new = %config.id, "Replacing root branch");
                    self.remove_branch(&old)?;
                }
            }
            self.rebuild_shape();
            return Ok(());
        }

        let status = if config.status.is_empty() {
            format!("Running {}...", config.id)
        } else {
            config.status.clone()
        };
        let from_branch = config.from_branch_id.clone().expect("checked above");
        let attach_node_id =
            self.resolve_stem_node(&from_branch, &config.from_tool_ids)?;
        self.nodes.insert(config.id.clone(), node);
        let attach = self
            .nodes
            .get_mut(&attach_node_id)
            .ok_or_else(|| Error::NotFound(format!("Branch '{}' not found", attach_node_id)))?;
        attach.add_option(NodeOption {
            id: config.id.clone(),
            description: config.description.clone(),
            inputs: BTreeMap::new(),
            is_tool: false,
            ends_conversation: false,
            status,
            next: Some(config.id.clone()),
        });

        self.rebuild_shape();
        Ok(())
    }

    /// Remove a branch and every option referencing it. The root is
    /// spared (with an error) when it is the only root.
    pub fn remove_branch(&mut self, branch_id: &str) -> Result<()> {
        if !self.nodes.contains_key(branch_id) {
            warn!(branch = branch_id, "Branch not found, nothing to remove");
            return Ok(());
        }
        if self.root.as_deref() == Some(branch_id) {
            error!("Cannot remove the root branch while it is the only root");
            return Err(Error::InvalidInput(
                "Cannot remove the root branch when there is only one root branch. \
                 Create a new root via add_branch first."
                    .into(),
            ));
        }
        for node in self.nodes.values_mut() {
            node.remove_option(branch_id);
        }
        self.nodes.remove(branch_id);
        self.rebuild_shape();
        Ok(())
    }

    /// Add a tool to a branch. A non-empty `from_tool_ids` stems the
    /// tool: a synthetic decision node named `{branch}.{id1}...{idN}` is
    /// created if absent and the tool becomes one of its options.
    pub fn add_tool(
        &mut self,
        tool: Arc<dyn Tool>,
        branch_id: Option<&str>,
        from_tool_ids: &[String],
    ) -> Result<()> {
        let schema = tool.schema().clone();
        if self.tools.contains_key(&schema.name) {
            return Err(Error::InvalidInput(format!(
                "A tool named '{}' is already registered",
                schema.name
            )));
        }
        let branch_id = match branch_id {
            Some(id) => id.to_string(),
            None => self
                .root
                .clone()
                .ok_or_else(|| Error::InvalidInput("No root branch to add the tool to".into()))?,
        };
        if !self.nodes.contains_key(&branch_id) {
            return Err(Error::NotFound(format!(
                "Branch '{}' not found. Use add_branch before adding a tool",
                branch_id
            )));
        }

        let target_node_id = self.resolve_stem_node(&branch_id, from_tool_ids)?;

        self.tools.insert(schema.name.clone(), tool);
        let node = self
            .nodes
            .get_mut(&target_node_id)
            .expect("stem node resolved above");
        node.add_option(NodeOption {
            id: schema.name.clone(),
            description: schema.description.clone(),
            inputs: schema.inputs.clone(),
            is_tool: true,
            ends_conversation: schema.ends_conversation,
            status: schema.status.clone(),
            next: None,
        });

        self.tracker.add_tracker(&schema.name);
        self.rebuild_shape();
        Ok(())
    }

    /// Walk (and create, for the last hop) the synthetic stem node for a
    /// tool path under `branch_id`. Returns the node the caller should
    /// attach to.
    fn resolve_stem_node(&mut self, branch_id: &str, from_tool_ids: &[String]) -> Result<String> {
        if from_tool_ids.is_empty() {
            return Ok(branch_id.to_string());
        }

        // Validate the path: each hop must be an option of the node at
        // that depth.
        let mut node_id = branch_id.to_string();
        for (depth, from_tool) in from_tool_ids.iter().enumerate() {
            let node = self.nodes.get(&node_id).ok_or_else(|| {
                Error::NotFound(format!("Branch '{}' not found", node_id))
            })?;
            if node.option(from_tool).is_none() {
                return Err(Error::NotFound(format!(
                    "Tool '{}' not found in branch '{}'. Available options are: {:?}",
                    from_tool,
                    node_id,
                    node.option_ids()
                )));
            }
            let stem_id = stem_node_id(branch_id, &from_tool_ids[..=depth]);
            if depth + 1 < from_tool_ids.len() && !self.nodes.contains_key(&stem_id) {
                return Err(Error::NotFound(format!(
                    "No decision node stems from '{}' yet; add a tool after it first",
                    stem_id
                )));
            }
            node_id = stem_id;
        }

        let stem_id = stem_node_id(branch_id, from_tool_ids);
        if !self.nodes.contains_key(&stem_id) {
            self.nodes.insert(
                stem_id.clone(),
                DecisionNode::new(&stem_id, STEM_INSTRUCTION, false),
            );
            let parent_id = if from_tool_ids.len() == 1 {
                branch_id.to_string()
            } else {
                stem_node_id(branch_id, &from_tool_ids[..from_tool_ids.len() - 1])
            };
            let last_tool = from_tool_ids.last().expect("non-empty");
            if let Some(option) = self
                .nodes
                .get_mut(&parent_id)
                .and_then(|n| n.option_mut(last_tool))
            {
                option.next = Some(stem_id.clone());
            }
        }
        Ok(stem_id)
    }

    /// Remove a tool. Removing a stem tool cascades: its stemmed
    /// sub-tree is removed and a warning lists the collaterally removed
    /// tools.
    pub fn remove_tool(
        &mut self,
        tool_name: &str,
        branch_id: Option<&str>,
        from_tool_ids: &[String],
    ) -> Result<()> {
        let branch_id = match branch_id {
            Some(id) => id.to_string(),
            None => self
                .root
                .clone()
                .ok_or_else(|| Error::InvalidInput("No root branch".into()))?,
        };
        if !self.nodes.contains_key(&branch_id) {
            return Err(Error::NotFound(format!("Branch '{}' not found", branch_id)));
        }

        // Validate the stem path without creating anything.
        let holder_id = if from_tool_ids.is_empty() {
            branch_id.clone()
        } else {
            let mut node_id = branch_id.clone();
            for (depth, from_tool) in from_tool_ids.iter().enumerate() {
                let node = self
                    .nodes
                    .get(&node_id)
                    .ok_or_else(|| Error::NotFound(format!("Branch '{}' not found", node_id)))?;
                if node.option(from_tool).is_none() {
                    return Err(Error::NotFound(format!(
                        "Tool '{}' not found in branch '{}'. Available options are: {:?}",
                        from_tool,
                        node_id,
                        node.option_ids()
                    )));
                }
                node_id = stem_node_id(&branch_id, &from_tool_ids[..=depth]);
            }
            node_id
        };

        let removed = self
            .nodes
            .get_mut(&holder_id)
            .map(|n| n.remove_option(tool_name))
            .unwrap_or(false);
        if !removed {
            return Err(Error::NotFound(format!(
                "Tool '{}' not found in branch '{}'",
                tool_name, holder_id
            )));
        }

        // Cascade: drop the sub-tree stemming from the removed tool.
        let tool_stem_prefix = format!("{}.{}", holder_id, tool_name);
        let doomed: Vec<String> = self
            .nodes
            .keys()
            .filter(|id| {
                id.as_str() == tool_stem_prefix
                    || id.starts_with(&format!("{}.", tool_stem_prefix))
            })
            .cloned()
            .collect();
        for node_id in &doomed {
            if let Some(node) = self.nodes.remove(node_id) {
                for option in &node.options {
                    if option.is_tool {
                        warn!(
                            tool = %option.id,
                            stem = %node_id,
                            "Tool stemmed from the removed tool has also been removed"
                        );
                        self.tools.remove(&option.id);
                        self.tracker.remove_tracker(&option.id);
                    }
                }
            }
        }

        // A stem node left with no options disappears and its parent
        // option is unlinked.
        if holder_id != branch_id {
            let empty = self
                .nodes
                .get(&holder_id)
                .map(|n| n.options.is_empty())
                .unwrap_or(false);
            if empty {
                self.nodes.remove(&holder_id);
                for node in self.nodes.values_mut() {
                    for option in &mut node.options {
                        if option.next.as_deref() == Some(holder_id.as_str()) {
                            option.next = None;
                        }
                    }
                }
            }
        }

        self.tools.remove(tool_name);
        self.tracker.remove_tracker(tool_name);
        self.rebuild_shape();
        Ok(())
    }

    /// Detach branches whose option map is empty. The root is spared
    /// with an error when it would be the only node left.
    fn purge_empty_branches(&mut self) -> Vec<String> {
        let empty: Vec<String> = self
            .nodes
            .iter()
            .filter(|(id, node)| node.options.is_empty() && Some(id.as_str()) != self.root.as_deref())
            .map(|(id, _)| id.clone())
            .collect();

        for empty_id in &empty {
            for node in self.nodes.values_mut() {
                node.remove_option(empty_id);
            }
            self.nodes.remove(empty_id);
            warn!(
                branch = %empty_id,
                "Removing empty branch: no tools are attached to it"
            );
        }
        if let Some(root) = &self.root {
            if self
                .nodes
                .get(root)
                .map(|n| n.options.is_empty())
                .unwrap_or(false)
            {
                error!("Root branch has no options; the next run will fail");
            }
        }
        if !empty.is_empty() {
            self.rebuild_shape();
        }
        empty
    }

    // -- shape --------------------------------------------------------------

    fn rebuild_shape(&mut self) {
        self.shape = match &self.root {
            Some(root) => self.shape_entry(root, Some("")),
            None => Value::Object(Map::new()),
        };
    }

    fn shape_entry(&self, node_id: &str, description: Option<&str>) -> Value {
        let Some(node) = self.nodes.get(node_id) else {
            return Value::Object(Map::new());
        };
        let mut options = Map::new();
        for option in &node.options {
            let child = match option.next.as_deref() {
                Some(next_id) if !option.is_tool => {
                    self.shape_entry(next_id, Some(&option.description))
                }
                Some(next_id) => {
                    // Stemmed tool: a leaf carrying the stem node's options.
                    let stem = self.shape_entry(next_id, Some(&option.description));
                    let mut leaf = leaf_entry(option);
                    leaf["options"] = stem
                        .get("options")
                        .cloned()
                        .unwrap_or_else(|| Value::Object(Map::new()));
                    leaf
                }
                None => leaf_entry(option),
            };
            options.insert(option.id.clone(), child);
        }

        let mut entry = Map::new();
        entry.insert("name".into(), Value::String(display_name(node_id)));
        entry.insert("id".into(), Value::String(node_id.to_string()));
        if let Some(description) = description {
            entry.insert(
                "description".into(),
                Value::String(collapse_whitespace(description)),
            );
        }
        entry.insert(
            "instruction".into(),
            Value::String(collapse_whitespace(&node.instruction)),
        );
        entry.insert("reasoning".into(), Value::String(String::new()));
        entry.insert("branch".into(), Value::Bool(true));
        entry.insert("options".into(), Value::Object(options));
        Value::Object(entry)
    }

    /// For each option of the shape, the tree of actions reachable after
    /// choosing it.
    fn successive_actions(options: &Value) -> Value {
        let mut out = Map::new();
        if let Some(options) = options.as_object() {
            for (id, child) in options {
                let nested = child
                    .get("options")
                    .map(Self::successive_actions)
                    .unwrap_or_else(|| Value::Object(Map::new()));
                out.insert(id.clone(), nested);
            }
        }
        Value::Object(out)
    }

    /// Hierarchical text rendering of the current shape.
    pub fn render(&self) -> String {
        let mut out = String::new();
        render_entry(&self.shape, "", "", &mut out);
        out
    }

    // -- the main loop ------------------------------------------------------

    /// Run the tree for one prompt, streaming wire messages.
    ///
    /// The sync-style wrappers [`Tree::run`] and [`Tree::run_blocking`]
    /// collect the stream and return the final text with the retrieved
    /// objects.
    pub fn events<'a>(
        &'a mut self,
        user_prompt: &str,
        options: RunOptions,
    ) -> impl Stream<Item = Result<Value>> + 'a {
        let user_prompt = user_prompt.to_string();
        try_stream! {
            let RunOptions {
                collection_names,
                pool,
                training_route,
                query_id,
                close_pool_after,
            } = options;

            let query_id = query_id.unwrap_or_else(|| Uuid::new_v4().to_string());
            let mut route: Vec<String> = training_route
                .as_deref()
                .map(|r| r.split('/').map(str::to_string).collect())
                .unwrap_or_default();

            // Prompt-level setup.
            self.ensure_lms()?;
            self.soft_reset();
            self.start_time = Some(Instant::now());
            self.query_id_to_prompt.insert(query_id.clone(), user_prompt.clone());
            self.prompt_to_query_id.insert(user_prompt.clone(), query_id.clone());
            self.tree_data.user_prompt = user_prompt.clone();
            self.tree_data.append_conversation(Role::User, &user_prompt);
            yield self.sink.add_prompt(&user_prompt, &query_id);

            if let Some(pool) = &pool {
                pool.restart_if_idle().await?;
                pool.start().await?;
                if self.use_collection_schemas {
                    let lease = pool.lease().await?;
                    let names = if collection_names.is_empty() {
                        lease.list_collections().await?
                    } else {
                        collection_names.clone()
                    };
                    self.tree_data.set_collection_names(&names, &*lease).await?;
                }
            }

            self.purge_empty_branches();
            info!(prompt = %user_prompt, query_id = %query_id, "Starting tree run");

            let mut completed;
            'iterations: loop {
                let mut node_id = self
                    .root
                    .clone()
                    .ok_or_else(|| Error::Config("No root decision node found".into()))?;
                let mut last_decision: Decision;
                let mut last_option: NodeOption;
                let mut force_text: bool;

                'walk: loop {
                    let node = self
                        .nodes
                        .get(&node_id)
                        .cloned()
                        .ok_or_else(|| Error::Internal(format!("Node '{}' vanished", node_id)))?;

                    let ctx = self.tool_context(pool.as_ref())?;
                    let (available, unavailable) = self.available_tools(&node, &ctx).await;
                    ensure_tools_available(&node.id, &available)?;

                    // Rule tools run unconditionally, before the decision.
                    for (rule_name, rule_inputs) in self.check_rules(&node, &ctx).await {
                        let rule_decision = Decision {
                            function_name: rule_name.clone(),
                            function_inputs: rule_inputs.clone(),
                            reasoning: String::new(),
                            impossible: false,
                            end_actions: false,
                        };
                        let tool = self.tools.get(&rule_name).cloned();
                        if let Some(tool) = tool {
                            let rule_ctx = self.tool_context(pool.as_ref())?;
                            let mut stream = tool.invoke(rule_ctx, rule_inputs);
                            while let Some(item) = stream.next().await {
                                match item {
                                    Ok(event) => {
                                        let (wire, _) =
                                            self.integrate(event, &rule_decision, &query_id);
                                        if let Some(wire) = wire {
                                            yield wire;
                                        }
                                    }
                                    Err(err) => {
                                        let (wire, _) = self.integrate(
                                            ToolEvent::Update(UpdateEvent::Error(
                                                ErrorEvent::unknown(err.to_string()),
                                            )),
                                            &rule_decision,
                                            &query_id,
                                        );
                                        if let Some(wire) = wire {
                                            yield wire;
                                        }
                                        break;
                                    }
                                }
                            }
                        }
                    }

                    // Decide.
                    let decision = if !route.is_empty() {
                        let decision = node.decide_from_route(&mut route)?;
                        force_text = decision.function_name == TEXT_RESPONSE;
                        decision
                    } else {
                        self.tracker.start_tracking(DECISION_TRACKER);
                        let successive = Self::successive_actions(
                            self.shape.get("options").unwrap_or(&Value::Null),
                        );
                        let result = node
                            .decide(DecideParams {
                                tree_data: &self.tree_data,
                                base_lm: &ctx.base_lm,
                                available: &available,
                                unavailable: &unavailable,
                                successive_actions: successive,
                                pool: pool.as_ref(),
                                use_collection_schemas: self.use_collection_schemas,
                            })
                            .await;
                        let (decision, events) = result?;
                        for event in events {
                            let (wire, _) = self.integrate(event, &decision, &query_id);
                            if let Some(wire) = wire {
                                yield wire;
                            }
                        }
                        let (base, complex) = (self.base_lm.clone(), self.complex_lm.clone());
                        self.tracker.end_tracking(
                            DECISION_TRACKER,
                            Some("Decision Node"),
                            base.as_ref(),
                            complex.as_ref(),
                        );
                        force_text = !node
                            .option(&decision.function_name)
                            .map(|o| o.ends_conversation)
                            .unwrap_or(false)
                            && decision.end_actions;
                        decision
                    };

                    let option = node
                        .option(&decision.function_name)
                        .cloned()
                        .ok_or_else(|| {
                            Error::Internal(format!(
                                "Chosen option '{}' not on node '{}'",
                                decision.function_name, node.id
                            ))
                        })?;

                    // Resolve inputs against the tool schema.
                    let mut decision = decision;
                    if let Some(tool) = self.tools.get(&decision.function_name) {
                        decision.function_inputs = tool
                            .schema()
                            .resolve_inputs(std::mem::take(&mut decision.function_inputs));
                    }

                    self.tree_data
                        .previous_reasoning
                        .insert(node.id.clone(), decision.reasoning.clone());
                    self.decision_history
                        .last_mut()
                        .expect("decision history never empty")
                        .push(decision.function_name.clone());

                    let mut extras = Map::new();
                    extras.insert("reasoning".into(), Value::String(decision.reasoning.clone()));
                    extras.insert("action".into(), Value::Bool(option.is_tool));
                    self.tree_data
                        .update_tasks_completed(&decision.function_name, extras);

                    completed = decision.function_name == TEXT_RESPONSE
                        || decision.end_actions
                        || decision.impossible
                        || self.tree_data.iterations_completed
                            >= self.tree_data.recursion_limit;

                    // Invoke the chosen tool.
                    if option.is_tool {
                        let tool = self
                            .tools
                            .get(&decision.function_name)
                            .cloned()
                            .ok_or_else(|| {
                                Error::Internal(format!(
                                    "Tool '{}' is not registered",
                                    decision.function_name
                                ))
                            })?;
                        self.tracker.start_tracking(&decision.function_name);
                        let mut successful = true;
                        let tool_ctx = self.tool_context(pool.as_ref())?;
                        let mut stream =
                            tool.invoke(tool_ctx, decision.function_inputs.clone());
                        while let Some(item) = stream.next().await {
                            match item {
                                Ok(event) => {
                                    let (wire, had_error) =
                                        self.integrate(event, &decision, &query_id);
                                    successful = successful && !had_error;
                                    if let Some(wire) = wire {
                                        yield wire;
                                    }
                                }
                                Err(err) => {
                                    warn!(
                                        tool = %decision.function_name,
                                        "Tool invocation failed: {}", err
                                    );
                                    let (wire, _) = self.integrate(
                                        ToolEvent::Update(UpdateEvent::Error(
                                            ErrorEvent::unknown(err.to_string()),
                                        )),
                                        &decision,
                                        &query_id,
                                    );
                                    successful = false;
                                    if let Some(wire) = wire {
                                        yield wire;
                                    }
                                    break;
                                }
                            }
                        }
                        drop(stream);
                        if successful {
                            self.tree_data.clear_errors(&decision.function_name);
                        } else {
                            // A failed tool never grants completion on
                            // end_actions alone.
                            completed = self.tree_data.iterations_completed
                                >= self.tree_data.recursion_limit;
                        }
                        let (base, complex) = (self.base_lm.clone(), self.complex_lm.clone());
                        self.tracker.end_tracking(
                            &decision.function_name,
                            None,
                            base.as_ref(),
                            complex.as_ref(),
                        );
                    }

                    // Close the node on the wire.
                    let reset = option.next.is_none() && !completed;
                    let closing = ToolEvent::Update(UpdateEvent::TreeUpdate(TreeUpdate {
                        from_node: node.id.clone(),
                        to_node: decision.function_name.clone(),
                        reasoning: if self.settings.base_use_reasoning {
                            decision.reasoning.clone()
                        } else {
                            String::new()
                        },
                        reset_tree: reset,
                    }));
                    let (wire, _) = self.integrate(closing, &decision, &query_id);
                    if let Some(wire) = wire {
                        yield wire;
                    }

                    last_decision = decision;
                    last_option = option;
                    match (&last_option.next, completed) {
                        (Some(next), false) => node_id = next.clone(),
                        _ => break 'walk,
                    }
                }

                self.tree_data.iterations_completed += 1;

                if completed {
                    // A run that stops anywhere but a declared end gets a
                    // synthesised closing message. This does not count
                    // toward the recursion budget.
                    if !last_option.ends_conversation || force_text {
                        let ctx = self.tool_context(pool.as_ref())?;
                        let mut stream = self.forced_text.invoke(ctx, Map::new());
                        while let Some(item) = stream.next().await {
                            match item {
                                Ok(event) => {
                                    let (wire, _) =
                                        self.integrate(event, &last_decision, &query_id);
                                    if let Some(wire) = wire {
                                        yield wire;
                                    }
                                }
                                Err(err) => {
                                    warn!("Forced text response failed: {}", err);
                                    break;
                                }
                            }
                        }
                    }

                    let elapsed = self
                        .start_time
                        .map(|t| t.elapsed().as_secs_f64())
                        .unwrap_or(0.0);
                    self.save_history(&query_id, elapsed);

                    let (wire, _) = self.integrate(
                        ToolEvent::Update(UpdateEvent::Completed),
                        &last_decision,
                        &query_id,
                    );
                    if let Some(wire) = wire {
                        yield wire;
                    }

                    info!(
                        iterations = self.tree_data.iterations_completed,
                        elapsed_s = elapsed,
                        "Tree run completed"
                    );
                    self.tracker.log_usage();

                    if close_pool_after {
                        if let Some(pool) = &pool {
                            pool.close().await;
                        }
                    }
                    break 'iterations;
                }

                debug!(
                    iteration = self.tree_data.iterations_completed + 1,
                    limit = self.tree_data.recursion_limit,
                    "Goal not complete, restarting at the root"
                );
                self.decision_history.push(Vec::new());
            }
        }
    }

    /// Run and collect: returns the final assistant text and the objects
    /// retrieved during the run.
    pub async fn run(&mut self, user_prompt: &str, options: RunOptions) -> Result<RunOutcome> {
        self.store_retrieved_objects = true;
        {
            let mut stream = pin!(self.events(user_prompt, options));
            while let Some(item) = stream.next().await {
                item?;
            }
        }
        let text = self
            .tree_data
            .conversation_history
            .iter()
            .rev()
            .find(|m| m.role == Role::Assistant)
            .map(|m| m.content.clone())
            .unwrap_or_default();
        Ok(RunOutcome {
            text,
            objects: std::mem::take(&mut self.retrieved_objects),
        })
    }

    /// Blocking wrapper around [`Tree::run`] for non-async callers.
    pub fn run_blocking(&mut self, user_prompt: &str, options: RunOptions) -> Result<RunOutcome> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        runtime.block_on(self.run(user_prompt, options))
    }

    fn soft_reset(&mut self) {
        self.tree_data.iterations_completed = 0;
        self.decision_history = vec![vec![]];
        self.training_updates.clear();
        self.action_information.clear();
        self.retrieved_objects.clear();
        self.tree_data.soft_reset();
        self.tree_index += 1;
        self.sink.set_tree_index(self.tree_index);
    }

    async fn available_tools(
        &self,
        node: &DecisionNode,
        ctx: &ToolContext,
    ) -> (Vec<String>, Vec<(String, String)>) {
        let mut available = Vec::new();
        let mut unavailable = Vec::new();
        for option in &node.options {
            if !option.is_tool {
                available.push(option.id.clone());
                continue;
            }
            match self.tools.get(&option.id) {
                Some(tool) => {
                    if tool.is_available(ctx).await {
                        available.push(option.id.clone());
                    } else {
                        unavailable.push((option.id.clone(), tool.availability_note()));
                    }
                }
                None => unavailable.push((option.id.clone(), "Not registered.".into())),
            }
        }
        (available, unavailable)
    }

    /// Rule tools whose auto-run condition is met, with their inputs.
    /// Runs over every option, gated or not.
    async fn check_rules(&self, node: &DecisionNode, ctx: &ToolContext) -> Vec<(String, JsonObject)> {
        let mut met = Vec::new();
        for option in &node.options {
            let Some(tool) = self.tools.get(&option.id) else {
                continue;
            };
            if let Some(inputs) = tool.auto_run(ctx).await {
                let inputs = if inputs.is_empty() {
                    tool.schema().default_inputs()
                } else {
                    tool.schema().resolve_inputs(inputs)
                };
                met.push((option.id.clone(), inputs));
            }
        }
        met
    }

    /// Fold one event into tree state and render its wire message.
    /// Returns the wire message (if any) and whether the event was an
    /// error.
    fn integrate(
        &mut self,
        mut event: ToolEvent,
        decision: &Decision,
        query_id: &str,
    ) -> (Option<Value>, bool) {
        let mut had_error = false;
        match &mut event {
            ToolEvent::Result(result) => {
                self.tree_data.environment.assign_ref_ids(
                    &decision.function_name,
                    &result.name,
                    &mut result.objects,
                );
                self.tree_data
                    .environment
                    .add(&decision.function_name, result);

                if self.store_retrieved_objects {
                    self.retrieved_objects
                        .push(serde_json::to_value(&result.objects).unwrap_or_default());
                }

                let mut action_info = Map::new();
                action_info.insert(
                    "action_name".into(),
                    Value::String(decision.function_name.clone()),
                );
                for (key, value) in &result.metadata {
                    action_info.insert(key.clone(), value.clone());
                }
                self.action_information.push(Value::Object(action_info));

                let mut extras = Map::new();
                extras.insert("parsed_info".into(), Value::String(result.llm_parse()));
                extras.insert(
                    "inputs".into(),
                    Value::Object(decision.function_inputs.clone()),
                );
                extras.insert("action".into(), Value::Bool(true));
                self.tree_data
                    .update_tasks_completed(&decision.function_name, extras);
            }
            ToolEvent::Text(text) => {
                let rendered = text.text();
                self.tree_data
                    .append_conversation(Role::Assistant, &rendered);
                if !rendered.is_empty() {
                    if !self.tree_data.current_message.is_empty() {
                        self.tree_data.current_message.push(' ');
                    }
                    self.tree_data.current_message.push_str(&rendered);
                }
            }
            ToolEvent::Update(UpdateEvent::Training(update)) => {
                self.training_updates.push(update.clone());
            }
            ToolEvent::Update(UpdateEvent::Error(error_event)) => {
                had_error = true;
                let message = if error_event.is_avoidable() {
                    format!(
                        "Avoidable error: {} (this error is likely to be solved by \
                         incorporating the feedback in a future tool call)",
                        error_event.feedback
                    )
                } else {
                    format!(
                        "Unknown error: {} (judge the error message; if it seems fixable, \
                         call this tool again, otherwise try something else or inform the \
                         user of the issue)",
                        error_event.error_message
                    )
                };
                self.tree_data
                    .add_error(&decision.function_name, message);
                let mut extras = Map::new();
                extras.insert("error".into(), Value::Bool(true));
                self.tree_data
                    .update_tasks_completed(&decision.function_name, extras);
            }
            ToolEvent::Update(_) => {}
        }
        (self.sink.render(&event, query_id), had_error)
    }

    /// Snapshot what this run did, keyed by query id.
    fn save_history(&mut self, query_id: &str, time_taken_seconds: f64) {
        let record = json!({
            "num_iterations": self.tree_data.iterations_completed,
            "tree_data": self.tree_data.to_json(),
            "action_information": self.action_information,
            "decision_history": self.decision_history(),
            "base_lm_used": self.settings.base_model,
            "complex_lm_used": self.settings.complex_model,
            "time_taken_seconds": time_taken_seconds,
            "training_updates": self.training_updates,
            "branch_init": self.branch_init,
        });
        self.history.insert(query_id.to_string(), record);
        self.training_updates.clear();
    }

    pub fn history(&self) -> &BTreeMap<String, Value> {
        &self.history
    }

    pub fn prompt_for_query(&self, query_id: &str) -> Option<&str> {
        self.query_id_to_prompt.get(query_id).map(String::as_str)
    }

    pub fn query_for_prompt(&self, prompt: &str) -> Option<&str> {
        self.prompt_to_query_id.get(prompt).map(String::as_str)
    }

    // -- titles and suggestions ---------------------------------------------

    /// Create (and cache) a conversation title from the history.
    pub async fn create_title(&mut self) -> Result<String> {
        self.ensure_lms()?;
        let request = CompletionRequest::new("title")
            .input(
                "conversation_history",
                "The conversation so far.",
                serde_json::to_value(&self.tree_data.conversation_history)?,
            )
            .output(
                "title",
                "A title for this conversation, a few words long.",
                FieldKind::Text,
            );
        let base_lm = self.base_lm.as_ref().expect("ensured above");
        let output = base_lm.complete(&request).await?;
        let title = output.get_str("title");
        self.conversation_title = Some(title.clone());
        Ok(title)
    }

    /// Suggest follow-up prompts given everything retrieved so far.
    pub async fn follow_up_suggestions(
        &mut self,
        context: Option<&str>,
        num_suggestions: usize,
    ) -> Result<Vec<String>> {
        self.ensure_lms()?;
        let request = CompletionRequest::new("follow_up_suggestions")
            .input(
                "user_prompt",
                "The user's latest prompt.",
                Value::String(self.tree_data.user_prompt.clone()),
            )
            .input(
                "conversation_history",
                "The conversation so far.",
                serde_json::to_value(&self.tree_data.conversation_history)?,
            )
            .input(
                "environment",
                "Data retrieved so far.",
                self.tree_data.environment.to_json(),
            )
            .input(
                "data_information",
                "Schemas of the available collections.",
                self.tree_data.collection_data.schemas_json(None, false),
            )
            .input(
                "old_suggestions",
                "Suggestions already made; do not repeat them.",
                serde_json::to_value(&self.suggestions)?,
            )
            .input(
                "context",
                "What kind of follow-up questions to suggest.",
                Value::String(context.unwrap_or(SUGGESTIONS_CONTEXT).to_string()),
            )
            .input(
                "num_suggestions",
                "How many suggestions to produce.",
                json!(num_suggestions),
            )
            .output(
                "suggestions",
                "An object with a 'suggestions' key holding an array of suggestion strings.",
                FieldKind::Json,
            );
        let base_lm = self.base_lm.as_ref().expect("ensured above");
        let output = base_lm.complete(&request).await?;
        let suggestions: Vec<String> = output
            .get("suggestions")
            .and_then(|v| v.get("suggestions").or(Some(v)))
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        self.suggestions.extend(suggestions.clone());
        Ok(suggestions)
    }

    // -- persistence --------------------------------------------------------

    /// Serialise the tree to a single JSON blob.
    pub fn export_json(&self) -> Value {
        json!({
            "user_id": self.user_id,
            "conversation_id": self.conversation_id,
            "title": self.conversation_title,
            "branch_init": self.branch_init,
            "use_collection_schemas": self.use_collection_schemas,
            "tree_index": self.tree_index,
            "tree_data": self.tree_data,
            "settings": self.settings,
            "tool_names": self.tool_names(),
            "frontend_rebuild": self.sink.store,
        })
    }

    /// Rehydrate a tree exported by [`Tree::export_json`]. Tools beyond
    /// the branch preset are not restored; each missing one is logged.
    pub fn import_json(value: &Value) -> Result<Tree> {
        let settings: Settings = serde_json::from_value(
            value.get("settings").cloned().unwrap_or(Value::Null),
        )?;
        let mut tree_data: TreeData = serde_json::from_value(
            value.get("tree_data").cloned().unwrap_or(Value::Null),
        )?;
        tree_data.settings = settings.clone();
        let branch_init: BranchInit = serde_json::from_value(
            value.get("branch_init").cloned().unwrap_or(Value::Null),
        )
        .unwrap_or_default();

        let mut tree = Tree::new(TreeOptions {
            branch_init,
            persona: tree_data.persona.clone(),
            user_id: value
                .get("user_id")
                .and_then(Value::as_str)
                .map(str::to_string),
            conversation_id: value
                .get("conversation_id")
                .and_then(Value::as_str)
                .map(str::to_string),
            use_collection_schemas: value
                .get("use_collection_schemas")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            settings: Some(settings),
        });

        tree.tree_data = tree_data;
        tree.conversation_title = value
            .get("title")
            .and_then(Value::as_str)
            .map(str::to_string);
        tree.tree_index = value
            .get("tree_index")
            .and_then(Value::as_i64)
            .unwrap_or(-1);
        tree.sink.set_tree_index(tree.tree_index);
        tree.sink.store = value
            .get("frontend_rebuild")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        if let Some(names) = value.get("tool_names").and_then(Value::as_array) {
            for name in names.iter().filter_map(Value::as_str) {
                if !tree.tools.contains_key(name) {
                    warn!(
                        tool = name,
                        "Saved tree used a custom tool that is not registered; \
                         add it to the tree manually"
                    );
                }
            }
        }

        Ok(tree)
    }

    /// Persist this tree into a store collection.
    pub async fn export_to_store(&self, pool: &ClientPool, collection: &str) -> Result<()> {
        let lease = pool.lease().await?;
        persist::save_tree(
            &*lease,
            collection,
            &self.user_id,
            &self.conversation_id,
            self.conversation_title.as_deref(),
            &self.export_json(),
        )
        .await
    }

    /// Restore a tree previously saved with [`Tree::export_to_store`].
    pub async fn import_from_store(
        pool: &ClientPool,
        collection: &str,
        conversation_id: &str,
    ) -> Result<Tree> {
        let lease = pool.lease().await?;
        let blob = persist::load_tree(&*lease, collection, conversation_id).await?;
        Tree::import_json(&blob)
    }
}

fn ensure_tools_available(node_id: &str, available: &[String]) -> Result<()> {
    if available.is_empty() {
        error!(node = node_id, "No tools available to use");
        return Err(Error::NoToolsAvailable(node_id.to_string()));
    }
    Ok(())
}

fn stem_node_id(branch_id: &str, from_tool_ids: &[String]) -> String {
    let mut id = branch_id.to_string();
    for from_tool in from_tool_ids {
        id.push('.');
        id.push_str(from_tool);
    }
    id
}

fn display_name(id: &str) -> String {
    let spaced = id.replace('_', " ");
    let mut chars = spaced.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn leaf_entry(option: &NodeOption) -> Value {
    let mut entry = Map::new();
    entry.insert("name".into(), Value::String(display_name(&option.id)));
    entry.insert("id".into(), Value::String(option.id.clone()));
    entry.insert(
        "description".into(),
        Value::String(collapse_whitespace(&option.description)),
    );
    entry.insert("instruction".into(), Value::String(String::new()));
    entry.insert("reasoning".into(), Value::String(String::new()));
    entry.insert("branch".into(), Value::Bool(!option.is_tool));
    entry.insert("options".into(), Value::Object(Map::new()));
    Value::Object(entry)
}


fn render_entry(entry: &Value, indent: &str, prefix: &str, out: &mut String) {
    let name = entry.get("name").and_then(Value::as_str).unwrap_or("?");
    let is_branch = entry
        .get("branch")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let description = entry
        .get("description")
        .and_then(Value::as_str)
        .unwrap_or("");

    out.push_str(indent);
    out.push_str(prefix);
    out.push_str(name);
    if is_branch {
        out.push('/');
    }
    if !description.is_empty() {
        let short: String = description.chars().take(72).collect();
        out.push_str(": ");
        out.push_str(&short);
        if description.chars().count() > 72 {
            out.push_str("...");
        }
    }
    out.push('\n');

    if let Some(options) = entry.get("options").and_then(Value::as_object) {
        let child_indent = format!("{}{}", indent, if prefix.is_empty() { "" } else { "    " });
        let count = options.len();
        for (i, (_, child)) in options.iter().enumerate() {
            let child_prefix = if i + 1 == count { "└── " } else { "├── " };
            render_entry(child, &child_indent, child_prefix, out);
        }
    }
}
