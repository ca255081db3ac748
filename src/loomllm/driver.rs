//! Shared primitives for provider-agnostic LLM drivers.
//!
//! Applications rarely call a driver directly — the
//! [`Orchestrator`](crate::orchestrator::Orchestrator) does — but the trait
//! and the lightweight data types defined here are the seam every provider
//! integration plugs into.  The trait abstracts over concrete vendor APIs
//! while the supporting structs describe chat turns, generation parameters,
//! streaming events, and token accounting in one uniform shape.
//!
//! # Normalization
//!
//! All drivers share the same normalization pass before translating a chain
//! into their wire format:
//!
//! * role aliases collapse (`human` → user; `ai`/`model` → assistant;
//!   `developer` → system),
//! * the leading system message is lifted out of the turn list so drivers
//!   whose APIs carry system text in a side channel can use it,
//! * empty-content messages are dropped, except a trailing user message,
//! * attachments are inlined into their owning user turn under a stable
//!   `# ATTACHED FILES` delimiter.
//!
//! The pass is deterministic given its inputs; see [`normalize_chain`].
//!
//! # Example
//!
//! ```rust
//! use loomllm::driver::{normalize_chain, ChatTurn, Role};
//!
//! let chain = vec![
//!     ChatTurn::new(Role::System, "You are helpful."),
//!     ChatTurn::new(Role::User, "Hi"),
//! ];
//! let normalized = normalize_chain(&chain, None);
//! assert_eq!(normalized.system.as_deref(), Some("You are helpful."));
//! assert_eq!(normalized.turns.len(), 1);
//! ```

use std::pin::Pin;

use async_trait::async_trait;
use futures_util::stream::Stream;
use serde::{Deserialize, Serialize};

use crate::loomllm::error::Error;

/// Role carried by a message or chat turn.
///
/// The wire spellings `developer`, `human`, `ai` and `model` are accepted as
/// input aliases and normalized on deserialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[serde(alias = "developer")]
    System,
    #[serde(alias = "human")]
    User,
    #[serde(alias = "ai", alias = "model")]
    Assistant,
}

impl Role {
    /// The canonical lowercase spelling.
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// An opaque file attachment carried by a user message.
///
/// The core never interprets attachment bodies; preprocessing (tokenisation,
/// previews) happens upstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub file_name: String,
    pub mime_type: String,
    pub content: String,
    #[serde(default)]
    pub token_count: usize,
}

/// One turn of the linear chain handed to a driver.
///
/// This is the snapshot shape the orchestrator derives from
/// [`Conversation::chain`](crate::conversation::Conversation::chain); drivers
/// never see graph nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
}

impl ChatTurn {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            attachments: Vec::new(),
        }
    }

    pub fn with_attachments(mut self, attachments: Vec<Attachment>) -> Self {
        self.attachments = attachments;
        self
    }
}

/// Uniform token accounting.
///
/// Drivers rename provider-native fields (`input_tokens`/`output_tokens`,
/// `promptTokenCount`/`candidatesTokenCount`, …) into this shape.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    pub total_tokens: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_tokens: Option<usize>,
}

/// Canonical generation parameters.
///
/// Each driver maintains a whitelist of the keys it forwards and a
/// translation table into its wire names; canonical keys outside a driver's
/// whitelist are dropped silently, as are unknown keys on deserialization.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_sequences: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_format: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_effort: Option<String>,
}

impl GenParams {
    pub fn is_empty(&self) -> bool {
        *self == GenParams::default()
    }

    /// Field-wise overlay: values set on `self` win over `defaults`.
    pub fn merged_over(&self, defaults: &GenParams) -> GenParams {
        GenParams {
            temperature: self.temperature.or(defaults.temperature),
            top_p: self.top_p.or(defaults.top_p),
            top_k: self.top_k.or(defaults.top_k),
            max_output_tokens: self.max_output_tokens.or(defaults.max_output_tokens),
            frequency_penalty: self.frequency_penalty.or(defaults.frequency_penalty),
            presence_penalty: self.presence_penalty.or(defaults.presence_penalty),
            stop_sequences: self
                .stop_sequences
                .clone()
                .or_else(|| defaults.stop_sequences.clone()),
            seed: self.seed.or(defaults.seed),
            response_format: self
                .response_format
                .clone()
                .or_else(|| defaults.response_format.clone()),
            reasoning_effort: self
                .reasoning_effort
                .clone()
                .or_else(|| defaults.reasoning_effort.clone()),
        }
    }
}

/// Description of a model advertised by a provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: String,
    pub display_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_limit: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_limit: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub capabilities: Vec<String>,
}

/// Result of a non-streaming generation.
#[derive(Debug, Clone)]
pub struct Completion {
    pub text: String,
    pub usage: Option<TokenUsage>,
    pub response_id: Option<String>,
}

/// Everything a driver needs for one generation call, snapshotted at
/// submission time so workers never read session state after start.
#[derive(Debug, Clone)]
pub struct GenerateRequest {
    pub model: String,
    pub chain: Vec<ChatTurn>,
    pub system_instruction: Option<String>,
    pub params: GenParams,
}

/// Ordered events produced by a streaming generation.
///
/// A well-behaved stream yields any number of `Chunk`/`Usage`/`Thinking`
/// events and terminates with exactly one `Done` or `Error`; a driver must
/// never emit `Chunk` after `Done`.
#[derive(Debug)]
pub enum StreamEvent {
    /// Incremental text delta, in provider order.
    Chunk { text: String },
    /// Token accounting, possibly emitted before the terminal event.
    Usage(TokenUsage),
    /// Intermediate reasoning step exposed by thinking-capable models.
    Thinking { name: String, content: String },
    /// Terminal success.  `full_text` is the concatenation of all chunks.
    Done {
        full_text: String,
        usage: Option<TokenUsage>,
        response_id: Option<String>,
    },
    /// Terminal failure.  Any text already streamed remains valid.
    Error(Error),
}

/// Boxed event stream compatible with `Send` executors.
pub type ProviderEventStream = Pin<Box<dyn Stream<Item = StreamEvent> + Send>>;

/// Trait-driven abstraction over a concrete provider.
///
/// A driver translates gateway requests into the provider-specific wire
/// format and returns replies in the uniform shapes above.  The abstraction
/// deliberately excludes conversation bookkeeping — for that see
/// [`Conversation`](crate::conversation::Conversation) and the orchestrator.
///
/// All implementations must be thread-safe (`Send + Sync`) so they can be
/// shared between async tasks.  Drivers map failures into the [`Error`]
/// taxonomy and never retry; retry policy lives upstream.
#[async_trait]
pub trait ProviderDriver: Send + Sync + std::fmt::Debug {
    /// Registry name of this provider (e.g. `"gemini"`).
    fn provider_name(&self) -> &'static str;

    /// Model used when a request does not name one.
    fn default_model(&self) -> &str;

    /// Verify the credential and connectivity.
    ///
    /// Fails with `AuthFailed` for missing/rejected credentials and
    /// `Network` for transport problems.
    async fn initialize(&self) -> Result<(), Error>;

    /// Models advertised by the provider.
    ///
    /// Implementations recover locally: when the remote listing fails the
    /// error is logged and a synthesized fallback list is returned.
    async fn list_models(&self) -> Vec<ModelInfo>;

    /// Provider-appropriate default generation parameters.
    fn default_params(&self) -> GenParams;

    /// Whether `model_id` plausibly belongs to this provider.
    fn validate_model(&self, model_id: &str) -> bool;

    /// Single request/response generation.
    async fn generate(&self, request: &GenerateRequest) -> Result<Completion, Error>;

    /// Streaming generation.
    ///
    /// The returned stream honours the [`StreamEvent`] contract.  On a
    /// network error mid-stream the driver emits a terminal
    /// [`StreamEvent::Error`] and closes; the orchestrator decides what to
    /// do with the partial text.
    async fn generate_stream(&self, request: &GenerateRequest)
        -> Result<ProviderEventStream, Error>;
}

/// A chain after the universal normalization pass.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedChain {
    /// Effective system text, lifted out of the turn list.
    pub system: Option<String>,
    /// Remaining user/assistant turns with attachments inlined.
    pub turns: Vec<WireTurn>,
}

/// A normalized turn ready for wire translation.
#[derive(Debug, Clone, PartialEq)]
pub struct WireTurn {
    pub role: Role,
    pub content: String,
}

/// Inline a turn's attachments into its content.
///
/// Attachment bodies are concatenated in attachment order under the stable
/// delimiter, one `### FILE:` section per file:
///
/// ```text
/// <content>
///
/// # ATTACHED FILES
///
/// ### FILE: notes.txt
/// <attachment body>
/// ```
pub fn flatten_attachments(content: &str, attachments: &[Attachment]) -> String {
    if attachments.is_empty() {
        return content.to_string();
    }
    let mut combined = String::with_capacity(content.len() + 64);
    combined.push_str(content);
    combined.push_str("\n\n# ATTACHED FILES\n");
    for attachment in attachments {
        combined.push_str(&format!(
            "\n### FILE: {}\n{}\n",
            attachment.file_name, attachment.content
        ));
    }
    combined
}

/// The universal normalization pass shared by every driver.
///
/// `system_instruction` (usually the conversation's metadata override) wins
/// over a lifted leading system message when both are present.  Each driver
/// decides whether the resulting system text goes back inline as a leading
/// `system` turn (OpenAI, DeepSeek) or into a side channel (Gemini's
/// `systemInstruction`, Anthropic's top-level `system`).
pub fn normalize_chain(chain: &[ChatTurn], system_instruction: Option<&str>) -> NormalizedChain {
    let mut lifted_system: Option<String> = None;
    let mut turns: Vec<WireTurn> = Vec::with_capacity(chain.len());

    for (index, turn) in chain.iter().enumerate() {
        if index == 0 && turn.role == Role::System {
            if !turn.content.trim().is_empty() {
                lifted_system = Some(turn.content.clone());
            }
            continue;
        }
        let content = flatten_attachments(&turn.content, &turn.attachments);
        let is_trailing_user = index == chain.len() - 1 && turn.role == Role::User;
        if content.trim().is_empty() && !is_trailing_user {
            continue;
        }
        // A stray non-leading system message has no slot in provider turn
        // lists; fold it into the system channel like the leading one.
        if turn.role == Role::System {
            if lifted_system.is_none() && !content.trim().is_empty() {
                lifted_system = Some(content);
            }
            continue;
        }
        turns.push(WireTurn {
            role: turn.role,
            content,
        });
    }

    let system = system_instruction
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .or(lifted_system);

    NormalizedChain { system, turns }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_aliases_collapse_on_deserialization() {
        let human: Role = serde_json::from_str("\"human\"").unwrap();
        let ai: Role = serde_json::from_str("\"ai\"").unwrap();
        let model: Role = serde_json::from_str("\"model\"").unwrap();
        let developer: Role = serde_json::from_str("\"developer\"").unwrap();
        assert_eq!(human, Role::User);
        assert_eq!(ai, Role::Assistant);
        assert_eq!(model, Role::Assistant);
        assert_eq!(developer, Role::System);
    }

    #[test]
    fn merged_params_prefer_explicit_values() {
        let defaults = GenParams {
            temperature: Some(0.7),
            top_p: Some(0.95),
            ..GenParams::default()
        };
        let explicit = GenParams {
            temperature: Some(0.1),
            ..GenParams::default()
        };
        let merged = explicit.merged_over(&defaults);
        assert_eq!(merged.temperature, Some(0.1));
        assert_eq!(merged.top_p, Some(0.95));
    }

    #[test]
    fn trailing_empty_user_turn_survives_normalization() {
        let chain = vec![
            ChatTurn::new(Role::System, "sys"),
            ChatTurn::new(Role::Assistant, ""),
            ChatTurn::new(Role::User, ""),
        ];
        let normalized = normalize_chain(&chain, None);
        assert_eq!(normalized.turns.len(), 1);
        assert_eq!(normalized.turns[0].role, Role::User);
    }
}
