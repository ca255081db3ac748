//! The conversation graph engine.
//!
//! A [`Conversation`] is a persistent, multi-rooted-looking but in fact
//! single-rooted DAG of messages: every retry of an assistant reply creates a
//! sibling under the same user turn on a freshly labelled branch, and the
//! *active leaf* marks the tip where the next turn attaches.  Messages point
//! at each other by id — an arena-style map, never physical back-pointers —
//! so serialization and duplication stay cycle-free.
//!
//! All mutation goes through the operations defined here (`add_user`,
//! `add_assistant`, `retry`, `navigate`, `complete_assistant`); external code
//! never edits nodes in place.  Every mutator stamps `updated_at`.
//!
//! # Example
//!
//! ```rust
//! use loomllm::conversation::Conversation;
//!
//! let mut conversation = Conversation::new("Demo", Some("You are helpful."));
//! conversation.add_user("Hi", Vec::new()).unwrap();
//! let chain = conversation.chain(None).unwrap();
//! assert_eq!(chain.len(), 2); // system root + user turn
//! ```

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::loomllm::driver::{Attachment, GenParams, Role, TokenUsage};
use crate::loomllm::error::Error;

/// Branch label every conversation starts on.
pub const MAIN_BRANCH: &str = "main";

fn now_ts() -> DateTime<Utc> {
    Utc::now()
}

fn new_id() -> String {
    Uuid::new_v4().to_string()
}

/// Fresh branch label allocated by [`Conversation::retry`].
fn new_branch_id() -> String {
    let hex = Uuid::new_v4().simple().to_string();
    format!("branch-{}", &hex[..8])
}

/// A single immutable-after-creation node in the conversation graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub parent_id: Option<String>,
    pub branch_id: String,
    #[serde(default)]
    pub children: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "GenParams::is_empty")]
    pub params: GenParams,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_usage: Option<TokenUsage>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_id: Option<String>,
    /// Set when the content is a partial reply cut short by an error or a
    /// cancellation mid-stream.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub truncated: bool,
}

impl Message {
    fn new(role: Role, content: String, parent_id: Option<String>, branch_id: String) -> Self {
        Message {
            id: new_id(),
            role,
            content,
            timestamp: now_ts(),
            parent_id,
            branch_id,
            children: Vec::new(),
            model: None,
            params: GenParams::default(),
            token_usage: None,
            attachments: Vec::new(),
            response_id: None,
            truncated: false,
        }
    }
}

/// Bookkeeping for one branch label.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BranchInfo {
    #[serde(default = "now_ts")]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub last_message: Option<String>,
    /// Live count of messages carrying this branch id.
    #[serde(default)]
    pub message_count: usize,
}

/// Conversation-level metadata, persisted verbatim.
///
/// Unknown keys round-trip through `extra`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metadata {
    pub title: String,
    #[serde(default = "now_ts")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "now_ts")]
    pub updated_at: DateTime<Utc>,
    #[serde(default = "default_branch")]
    pub active_branch: String,
    #[serde(default)]
    pub active_leaf: Option<String>,
    #[serde(default)]
    pub model: String,
    #[serde(default, skip_serializing_if = "GenParams::is_empty")]
    pub params: GenParams,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub streaming_preference: Option<bool>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

fn default_branch() -> String {
    MAIN_BRANCH.to_string()
}

/// A persistent, branching conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    #[serde(rename = "conversation_id")]
    pub id: String,
    pub metadata: Metadata,
    #[serde(default)]
    pub messages: HashMap<String, Message>,
    #[serde(default)]
    pub branches: HashMap<String, BranchInfo>,
    /// Unknown top-level keys, preserved on round-trip.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// Sibling listing for a node, used by cyclic navigation.
#[derive(Debug, Clone, Serialize)]
pub struct Siblings {
    pub list: Vec<String>,
    /// Position of the queried node in `list`, if present.
    pub index: Option<usize>,
    pub parent_id: Option<String>,
}

impl Siblings {
    pub fn total(&self) -> usize {
        self.list.len()
    }
}

/// Direction for sibling navigation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NavDirection {
    Prev,
    Next,
    /// Activate the addressed node without rotating.
    None,
}

/// One row of the flattened active-chain projection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub id: String,
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
}

/// Whole-graph projection for tree renderers.
#[derive(Debug, Clone, Serialize)]
pub struct TreeView {
    pub nodes: Vec<TreeNode>,
    pub edges: Vec<TreeEdge>,
    pub metadata: Metadata,
}

#[derive(Debug, Clone, Serialize)]
pub struct TreeNode {
    pub id: String,
    pub role: Role,
    pub content_preview: String,
    pub timestamp: DateTime<Utc>,
    pub branch_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub is_active_leaf: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct TreeEdge {
    pub from: String,
    pub to: String,
}

fn preview(content: &str) -> String {
    let mut truncated: String = content.chars().take(50).collect();
    if content.chars().count() > 50 {
        truncated.push_str("...");
    }
    truncated
}

impl Conversation {
    /// Create a conversation with a system root message on the `main` branch.
    pub fn new(title: impl Into<String>, system_instruction: Option<&str>) -> Self {
        let system_text = system_instruction.unwrap_or("").to_string();
        let root = Message::new(Role::System, system_text, None, MAIN_BRANCH.to_string());
        let root_id = root.id.clone();
        let created = now_ts();

        let mut messages = HashMap::new();
        messages.insert(root_id.clone(), root);

        let mut branches = HashMap::new();
        branches.insert(
            MAIN_BRANCH.to_string(),
            BranchInfo {
                created_at: created,
                last_message: Some(root_id.clone()),
                message_count: 1,
            },
        );

        Conversation {
            id: new_id(),
            metadata: Metadata {
                title: title.into(),
                created_at: created,
                updated_at: created,
                active_branch: MAIN_BRANCH.to_string(),
                active_leaf: Some(root_id),
                model: String::new(),
                params: GenParams::default(),
                system_instruction: system_instruction
                    .filter(|s| !s.is_empty())
                    .map(str::to_string),
                streaming_preference: None,
                extra: serde_json::Map::new(),
            },
            messages,
            branches,
            extra: serde_json::Map::new(),
        }
    }

    /// Deserialize from a JSON value, accepting both the current layout and
    /// the legacy flat-history layout.
    pub fn from_value(value: Value) -> Result<Conversation, Error> {
        if Self::is_legacy_value(&value) {
            return Self::from_legacy_value(&value);
        }
        let conversation: Conversation = serde_json::from_value(value)
            .map_err(|e| Error::ConversationCorrupt(e.to_string()))?;
        Ok(conversation)
    }

    /// Whether a JSON document uses the legacy `history` layout.
    pub fn is_legacy_value(value: &Value) -> bool {
        value.get("history").is_some() && value.get("messages").is_none()
    }

    /// Convert a legacy `{"conversation_id", "history": […]}` document.
    ///
    /// The flat list becomes a single main-branch chain under a synthesized
    /// system root, with role aliases normalized.  The conversion is
    /// idempotent and purely in-memory; the source file is only rewritten by
    /// the next save.
    pub fn from_legacy_value(value: &Value) -> Result<Conversation, Error> {
        let history = value
            .get("history")
            .and_then(Value::as_array)
            .ok_or_else(|| Error::ConversationCorrupt("legacy history is not a list".into()))?;

        let mut title = "Converted Conversation".to_string();
        let mut model = String::new();
        let mut params = GenParams::default();
        for item in history {
            if item.get("type").and_then(Value::as_str) == Some("metadata") {
                let content = item.get("content").cloned().unwrap_or(Value::Null);
                if let Some(t) = content.get("title").and_then(Value::as_str) {
                    title = t.to_string();
                }
                if let Some(m) = content.get("model").and_then(Value::as_str) {
                    model = m.to_string();
                }
                if let Some(p) = content.get("params") {
                    params = serde_json::from_value(p.clone()).unwrap_or_default();
                }
                break;
            }
        }

        let mut conversation = Conversation::new(title, None);
        if let Some(id) = value.get("conversation_id").and_then(Value::as_str) {
            conversation.id = id.to_string();
        }
        conversation.metadata.model = model.clone();
        conversation.metadata.params = params.clone();

        let root_id = conversation
            .root_id()
            .ok_or_else(|| Error::InvariantViolation("fresh conversation has no root".into()))?;
        let mut previous = root_id;
        for item in history {
            if item.get("type").and_then(Value::as_str) != Some("message") {
                continue;
            }
            let content = item.get("content").cloned().unwrap_or(Value::Null);
            let text = content
                .get("text")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string();
            let role = match content.get("role").and_then(Value::as_str) {
                Some(raw) => match serde_json::from_value::<Role>(Value::String(raw.to_string()))
                {
                    Ok(role) => role,
                    Err(_) => {
                        log::warn!("legacy conversion: unknown role '{}', skipping", raw);
                        continue;
                    }
                },
                None => continue,
            };
            match role {
                Role::System => {
                    // Fold stray system text into the synthesized root.
                    if let Some(root) = conversation.messages.get_mut(&previous) {
                        if root.role == Role::System && root.content.is_empty() {
                            root.content = text;
                        }
                    }
                }
                Role::User | Role::Assistant => {
                    let mut message = Message::new(
                        role,
                        text,
                        Some(previous.clone()),
                        MAIN_BRANCH.to_string(),
                    );
                    if role == Role::Assistant {
                        message.model = Some(model.clone()).filter(|m| !m.is_empty());
                        message.params = params.clone();
                    }
                    let id = message.id.clone();
                    conversation.insert_message(message)?;
                    previous = id;
                }
            }
        }
        conversation.metadata.active_leaf = Some(previous);
        conversation.metadata.active_branch = MAIN_BRANCH.to_string();
        Ok(conversation)
    }

    /// Id of the single root (parent-less) message.
    pub fn root_id(&self) -> Option<String> {
        self.messages
            .values()
            .find(|m| m.parent_id.is_none())
            .map(|m| m.id.clone())
    }

    pub fn title(&self) -> &str {
        &self.metadata.title
    }

    pub fn active_leaf(&self) -> Option<&str> {
        self.metadata.active_leaf.as_deref()
    }

    pub fn active_branch(&self) -> &str {
        &self.metadata.active_branch
    }

    fn touch(&mut self) {
        self.metadata.updated_at = now_ts();
    }

    /// The node new turns attach to: the active leaf, falling back to the
    /// active branch tip, falling back to the root.
    fn attach_point(&self) -> Option<String> {
        if let Some(leaf) = &self.metadata.active_leaf {
            if self.messages.contains_key(leaf) {
                return Some(leaf.clone());
            }
        }
        if let Some(branch) = self.branches.get(&self.metadata.active_branch) {
            if let Some(last) = &branch.last_message {
                if self.messages.contains_key(last) {
                    return Some(last.clone());
                }
            }
        }
        self.root_id()
    }

    /// Insert a prepared message, wiring parent children and branch
    /// bookkeeping.
    fn insert_message(&mut self, message: Message) -> Result<(), Error> {
        let id = message.id.clone();
        let branch = message.branch_id.clone();

        if let Some(parent_id) = &message.parent_id {
            let parent = self
                .messages
                .get_mut(parent_id)
                .ok_or_else(|| Error::NotFound(format!("parent message {}", parent_id)))?;
            if !parent.children.contains(&id) {
                parent.children.push(id.clone());
            }
        }
        self.messages.insert(id.clone(), message);

        let entry = self.branches.entry(branch.clone()).or_insert(BranchInfo {
            created_at: now_ts(),
            last_message: None,
            message_count: 0,
        });
        entry.last_message = Some(id);
        entry.message_count = self
            .messages
            .values()
            .filter(|m| m.branch_id == branch)
            .count();
        self.touch();
        Ok(())
    }

    /// Append a user turn at the active leaf on the active branch.
    pub fn add_user(
        &mut self,
        content: impl Into<String>,
        attachments: Vec<Attachment>,
    ) -> Result<&Message, Error> {
        let parent = self.attach_point();
        let branch = self.metadata.active_branch.clone();
        let mut message = Message::new(Role::User, content.into(), parent, branch);
        message.attachments = attachments;
        let id = message.id.clone();
        self.insert_message(message)?;
        self.metadata.active_leaf = Some(id.clone());
        self.messages
            .get(&id)
            .ok_or_else(|| Error::InvariantViolation("freshly inserted message missing".into()))
    }

    /// Append an assistant turn.
    ///
    /// `parent_id` defaults to the active leaf and `branch_id` to the active
    /// branch.  The new node becomes the active leaf; when `branch_id` names
    /// a different branch, that branch also becomes active.
    #[allow(clippy::too_many_arguments)]
    pub fn add_assistant(
        &mut self,
        content: impl Into<String>,
        model: impl Into<String>,
        params: GenParams,
        usage: Option<TokenUsage>,
        response_id: Option<String>,
        parent_id: Option<&str>,
        branch_id: Option<&str>,
    ) -> Result<&Message, Error> {
        let parent = match parent_id {
            Some(id) => {
                if !self.messages.contains_key(id) {
                    return Err(Error::NotFound(format!("parent message {}", id)));
                }
                Some(id.to_string())
            }
            None => self.attach_point(),
        };
        let branch = branch_id
            .map(str::to_string)
            .unwrap_or_else(|| self.metadata.active_branch.clone());

        let mut message = Message::new(Role::Assistant, content.into(), parent, branch.clone());
        message.model = Some(model.into()).filter(|m| !m.is_empty());
        message.params = params;
        message.token_usage = usage;
        message.response_id = response_id;
        let id = message.id.clone();
        self.insert_message(message)?;

        self.metadata.active_leaf = Some(id.clone());
        if self.metadata.active_branch != branch {
            self.metadata.active_branch = branch;
        }
        self.messages
            .get(&id)
            .ok_or_else(|| Error::InvariantViolation("freshly inserted message missing".into()))
    }

    /// Start a retry of an assistant reply.
    ///
    /// Allocates a fresh branch, creates a new (initially empty) assistant
    /// sibling under the same user parent, and activates both.  The caller —
    /// normally the orchestrator — fills the node in via
    /// [`complete_assistant`](Conversation::complete_assistant) once the
    /// provider reply is known.
    pub fn retry(&mut self, assistant_node_id: &str) -> Result<&Message, Error> {
        let node = self
            .messages
            .get(assistant_node_id)
            .ok_or_else(|| Error::NotFound(format!("message {}", assistant_node_id)))?;
        if node.role != Role::Assistant {
            return Err(Error::InvariantViolation(
                "retry target must be an assistant message".into(),
            ));
        }
        let parent_id = node.parent_id.clone().ok_or_else(|| {
            Error::InvariantViolation("retry target has no parent".into())
        })?;
        let parent = self
            .messages
            .get(&parent_id)
            .ok_or_else(|| Error::NotFound(format!("parent message {}", parent_id)))?;
        if parent.role != Role::User {
            return Err(Error::InvariantViolation(
                "retry target's parent is not a user message".into(),
            ));
        }

        let branch = new_branch_id();
        let message = Message::new(
            Role::Assistant,
            String::new(),
            Some(parent_id),
            branch.clone(),
        );
        let id = message.id.clone();
        self.insert_message(message)?;
        self.metadata.active_branch = branch;
        self.metadata.active_leaf = Some(id.clone());
        self.messages
            .get(&id)
            .ok_or_else(|| Error::InvariantViolation("freshly inserted message missing".into()))
    }

    /// Fill in an assistant node once its provider reply is known.
    ///
    /// Used by the orchestrator to finalise nodes created by
    /// [`retry`](Conversation::retry); also records partial replies
    /// (`truncated = true`) and error text.
    #[allow(clippy::too_many_arguments)]
    pub fn complete_assistant(
        &mut self,
        node_id: &str,
        content: impl Into<String>,
        model: impl Into<String>,
        params: GenParams,
        usage: Option<TokenUsage>,
        response_id: Option<String>,
        truncated: bool,
    ) -> Result<(), Error> {
        let node = self
            .messages
            .get_mut(node_id)
            .ok_or_else(|| Error::NotFound(format!("message {}", node_id)))?;
        if node.role != Role::Assistant {
            return Err(Error::InvariantViolation(
                "only assistant messages can be completed".into(),
            ));
        }
        node.content = content.into();
        node.model = Some(model.into()).filter(|m| !m.is_empty());
        node.params = params;
        node.token_usage = usage;
        node.response_id = response_id;
        node.truncated = truncated;
        self.touch();
        Ok(())
    }

    /// Sibling listing for cyclic navigation.
    ///
    /// For an assistant node the siblings are its user parent's children;
    /// for a user (or system) node, its own children — the assistant
    /// alternatives below it.
    pub fn siblings(&self, node_id: &str) -> Result<Siblings, Error> {
        let node = self
            .messages
            .get(node_id)
            .ok_or_else(|| Error::NotFound(format!("message {}", node_id)))?;

        if node.role == Role::Assistant {
            if let Some(parent_id) = &node.parent_id {
                if let Some(parent) = self.messages.get(parent_id) {
                    let list = parent.children.clone();
                    let index = list.iter().position(|id| id == node_id);
                    return Ok(Siblings {
                        list,
                        index,
                        parent_id: Some(parent_id.clone()),
                    });
                }
            }
            // Orphan assistant: it is its own sibling set.
            return Ok(Siblings {
                list: vec![node_id.to_string()],
                index: Some(0),
                parent_id: None,
            });
        }

        Ok(Siblings {
            list: node.children.clone(),
            index: None,
            parent_id: None,
        })
    }

    fn activate(&mut self, node_id: &str) -> Result<&Message, Error> {
        let branch = self
            .messages
            .get(node_id)
            .ok_or_else(|| Error::NotFound(format!("message {}", node_id)))?
            .branch_id
            .clone();
        self.metadata.active_branch = branch;
        self.metadata.active_leaf = Some(node_id.to_string());
        self.touch();
        self.messages
            .get(node_id)
            .ok_or_else(|| Error::NotFound(format!("message {}", node_id)))
    }

    /// Navigate between sibling replies.
    ///
    /// `None` activates the addressed node.  `Prev`/`Next` rotate cyclically
    /// through the sibling list (insertion order breaks ties) and activate
    /// the chosen sibling; with one or zero siblings the original node is
    /// activated unchanged.
    pub fn navigate(&mut self, node_id: &str, direction: NavDirection) -> Result<&Message, Error> {
        if !self.messages.contains_key(node_id) {
            return Err(Error::NotFound(format!("message {}", node_id)));
        }
        let target = match direction {
            NavDirection::None => node_id.to_string(),
            NavDirection::Prev | NavDirection::Next => {
                let siblings = self.siblings(node_id)?;
                match siblings.index {
                    Some(index) if siblings.total() > 1 => {
                        let len = siblings.total();
                        let next = match direction {
                            NavDirection::Prev => (index + len - 1) % len,
                            _ => (index + 1) % len,
                        };
                        siblings.list[next].clone()
                    }
                    _ => node_id.to_string(),
                }
            }
        };
        self.activate(&target)
    }

    /// Linear chain from the root to a branch tip (default: the active
    /// leaf), in conversation order.  This is what an LLM receives.
    pub fn chain(&self, branch_id: Option<&str>) -> Result<Vec<&Message>, Error> {
        let start = match branch_id {
            Some(branch) => self
                .branches
                .get(branch)
                .ok_or_else(|| Error::NotFound(format!("branch {}", branch)))?
                .last_message
                .clone(),
            None => self.metadata.active_leaf.clone(),
        };
        match start {
            Some(id) => self.chain_to(&id),
            None => Ok(Vec::new()),
        }
    }

    /// Linear chain from the root to an explicit message.
    pub fn chain_to(&self, message_id: &str) -> Result<Vec<&Message>, Error> {
        let mut chain = Vec::new();
        let mut visited = HashSet::new();
        let mut cursor = Some(message_id.to_string());
        while let Some(id) = cursor {
            if !visited.insert(id.clone()) {
                return Err(Error::InvariantViolation(format!(
                    "parent cycle at message {}",
                    id
                )));
            }
            if visited.len() > self.messages.len() {
                return Err(Error::InvariantViolation("parent walk exceeds graph".into()));
            }
            let message = self
                .messages
                .get(&id)
                .ok_or_else(|| Error::NotFound(format!("message {}", id)))?;
            chain.push(message);
            cursor = message.parent_id.clone();
        }
        chain.reverse();
        Ok(chain)
    }

    /// Flat role/content projection of the active chain, for UI layers and
    /// `NavChanged` snapshots.  System turns are omitted.
    pub fn history(&self) -> Vec<HistoryEntry> {
        match self.chain(None) {
            Ok(chain) => chain
                .into_iter()
                .filter(|m| m.role != Role::System)
                .map(|m| HistoryEntry {
                    id: m.id.clone(),
                    role: m.role,
                    content: m.content.clone(),
                    model: m.model.clone(),
                    timestamp: m.timestamp,
                    parent_id: m.parent_id.clone(),
                })
                .collect(),
            Err(err) => {
                log::warn!("history projection failed: {}", err);
                Vec::new()
            }
        }
    }

    /// Whole-graph projection for tree renderers.  Nodes are ordered by
    /// timestamp (id breaks ties) so output is deterministic.
    pub fn tree(&self) -> TreeView {
        let mut nodes: Vec<&Message> = self.messages.values().collect();
        nodes.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.id.cmp(&b.id)));

        let active_leaf = self.metadata.active_leaf.as_deref();
        let mut edges = Vec::new();
        let tree_nodes = nodes
            .iter()
            .map(|m| {
                for child in &m.children {
                    if self.messages.contains_key(child) {
                        edges.push(TreeEdge {
                            from: m.id.clone(),
                            to: child.clone(),
                        });
                    } else {
                        log::warn!("child {} of {} not in message map", child, m.id);
                    }
                }
                TreeNode {
                    id: m.id.clone(),
                    role: m.role,
                    content_preview: preview(&m.content),
                    timestamp: m.timestamp,
                    branch_id: m.branch_id.clone(),
                    model: m.model.clone(),
                    is_active_leaf: active_leaf == Some(m.id.as_str()),
                }
            })
            .collect();

        TreeView {
            nodes: tree_nodes,
            edges,
            metadata: self.metadata.clone(),
        }
    }

    /// Verify the structural invariants.  Cheap enough to run after every
    /// mutation in tests; load paths run it to detect corrupt files.
    pub fn check_invariants(&self) -> Result<(), Error> {
        let roots: Vec<&Message> = self
            .messages
            .values()
            .filter(|m| m.parent_id.is_none())
            .collect();
        if roots.len() != 1 {
            return Err(Error::InvariantViolation(format!(
                "expected exactly one root, found {}",
                roots.len()
            )));
        }
        if roots[0].role != Role::System {
            return Err(Error::InvariantViolation("root is not a system message".into()));
        }

        for message in self.messages.values() {
            if let Some(parent_id) = &message.parent_id {
                let parent = self.messages.get(parent_id).ok_or_else(|| {
                    Error::InvariantViolation(format!(
                        "message {} has missing parent {}",
                        message.id, parent_id
                    ))
                })?;
                if !parent.children.contains(&message.id) {
                    return Err(Error::InvariantViolation(format!(
                        "message {} not registered in parent {}'s children",
                        message.id, parent_id
                    )));
                }
            }
            let mut seen = HashSet::new();
            for child in &message.children {
                if !seen.insert(child) {
                    return Err(Error::InvariantViolation(format!(
                        "duplicate child {} under {}",
                        child, message.id
                    )));
                }
                if !self.messages.contains_key(child) {
                    return Err(Error::InvariantViolation(format!(
                        "dangling child {} under {}",
                        child, message.id
                    )));
                }
            }
        }

        for (branch, info) in &self.branches {
            let count = self
                .messages
                .values()
                .filter(|m| &m.branch_id == branch)
                .count();
            if count != info.message_count {
                return Err(Error::InvariantViolation(format!(
                    "branch {} message_count {} != live count {}",
                    branch, info.message_count, count
                )));
            }
        }

        if !self.branches.contains_key(&self.metadata.active_branch) {
            return Err(Error::InvariantViolation(format!(
                "active branch {} has no branch entry",
                self.metadata.active_branch
            )));
        }
        match &self.metadata.active_leaf {
            Some(leaf) => {
                if !self.messages.contains_key(leaf) {
                    return Err(Error::InvariantViolation(format!(
                        "active leaf {} does not resolve",
                        leaf
                    )));
                }
                // The walk both terminates and touches each id at most once.
                self.chain_to(leaf)?;
            }
            None => {
                return Err(Error::InvariantViolation("no active leaf".into()));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn previews_truncate_at_fifty_chars() {
        let short = "hello";
        let long = "x".repeat(60);
        assert_eq!(preview(short), "hello");
        let truncated = preview(&long);
        assert_eq!(truncated.chars().count(), 53);
        assert!(truncated.ends_with("..."));
    }

    #[test]
    fn retry_branch_ids_have_the_expected_shape() {
        let id = new_branch_id();
        assert!(id.starts_with("branch-"));
        assert_eq!(id.len(), "branch-".len() + 8);
    }
}
