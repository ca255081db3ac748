//! Anthropic Claude driver speaking the native Messages API.
//!
//! Claude's API differs from the OpenAI-compatible shape in three ways this
//! driver smooths over: authentication uses `x-api-key` plus an
//! `anthropic-version` header, the system text is a top-level `system` field
//! rather than a message, and `max_tokens` is mandatory — when the caller
//! sets no budget the driver fills in its default.  Replies carry
//! `content[]` blocks and `input_tokens`/`output_tokens`, both renamed into
//! the uniform shapes.
//!
//! Streaming uses the typed Anthropic event frames
//! (`message_start`/`content_block_delta`/`message_delta`/`message_stop`);
//! thinking deltas from extended-thinking models surface as `Thinking`
//! events.

use async_trait::async_trait;
use serde_json::Value;

use crate::loomllm::driver::{
    normalize_chain, Completion, GenParams, GenerateRequest, ModelInfo, NormalizedChain,
    ProviderDriver, ProviderEventStream, TokenUsage,
};
use crate::loomllm::error::Error;
use crate::loomllm::providers::common::{get_json, open_sse, post_json, WireDialect};

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com/v1";
const API_VERSION: &str = "2023-06-01";

/// Output budget used when the caller sets none; the API requires one.
const DEFAULT_MAX_TOKENS: u32 = 800;

/// (id, input limit, output limit)
const MODEL_SPECS: &[(&str, u32, u32)] = &[
    ("claude-opus-4-1", 200_000, 32_000),
    ("claude-opus-4-0", 200_000, 32_000),
    ("claude-sonnet-4-0", 200_000, 64_000),
    ("claude-3-7-sonnet-latest", 200_000, 64_000),
    ("claude-3-5-haiku-latest", 200_000, 8_192),
];

/// Client for Anthropic's Messages API.
#[derive(Debug)]
pub struct AnthropicDriver {
    api_key: String,
    model: String,
    base_url: String,
}

impl AnthropicDriver {
    pub fn new_with_model_str(secret_key: &str, model_name: &str) -> Self {
        Self::new_with_base_url(secret_key, model_name, DEFAULT_BASE_URL)
    }

    pub fn new_with_base_url(secret_key: &str, model_name: &str, base_url: &str) -> Self {
        AnthropicDriver {
            api_key: secret_key.to_string(),
            model: model_name.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn headers(&self) -> Vec<(&'static str, String)> {
        vec![
            ("x-api-key", self.api_key.clone()),
            ("anthropic-version", API_VERSION.to_string()),
        ]
    }

    fn output_limit(model: &str) -> Option<u32> {
        MODEL_SPECS
            .iter()
            .find(|(id, _, _)| *id == model)
            .map(|(_, _, output)| *output)
    }

    fn request_body(
        &self,
        normalized: &NormalizedChain,
        model: &str,
        params: &GenParams,
        stream: bool,
    ) -> Value {
        let merged = params.merged_over(&self.default_params());
        let messages: Vec<Value> = normalized
            .turns
            .iter()
            .map(|turn| {
                serde_json::json!({
                    "role": turn.role.as_str(),
                    "content": turn.content,
                })
            })
            .collect();

        let mut max_tokens = merged.max_output_tokens.unwrap_or(DEFAULT_MAX_TOKENS);
        if let Some(limit) = Self::output_limit(model) {
            if max_tokens > limit {
                log::warn!(
                    "anthropic: clamping max_output_tokens {} to model {} limit {}",
                    max_tokens,
                    model,
                    limit
                );
                max_tokens = limit;
            }
        }

        let mut body = serde_json::Map::new();
        body.insert("model".to_string(), model.into());
        body.insert("max_tokens".to_string(), max_tokens.into());
        body.insert("messages".to_string(), Value::Array(messages));
        if let Some(system) = &normalized.system {
            body.insert("system".to_string(), system.as_str().into());
        }
        if let Some(temperature) = merged.temperature {
            body.insert("temperature".to_string(), temperature.into());
        }
        if let Some(top_p) = merged.top_p {
            body.insert("top_p".to_string(), top_p.into());
        }
        if let Some(top_k) = merged.top_k {
            body.insert("top_k".to_string(), top_k.into());
        }
        if let Some(stop) = &merged.stop_sequences {
            if !stop.is_empty() {
                body.insert("stop_sequences".to_string(), serde_json::json!(stop));
            }
        }
        if stream {
            body.insert("stream".to_string(), Value::Bool(true));
        }
        Value::Object(body)
    }

    fn parse_message(value: &Value) -> Result<Completion, Error> {
        let blocks = value
            .get("content")
            .and_then(Value::as_array)
            .ok_or_else(|| Error::Network("no content blocks in Claude reply".to_string()))?;
        let mut text = String::new();
        for block in blocks {
            if block.get("type").and_then(Value::as_str) == Some("text") {
                if let Some(fragment) = block.get("text").and_then(Value::as_str) {
                    text.push_str(fragment);
                }
            }
        }
        let usage = value.get("usage").map(|usage| {
            let prompt = usage
                .get("input_tokens")
                .and_then(Value::as_u64)
                .unwrap_or(0) as usize;
            let completion = usage
                .get("output_tokens")
                .and_then(Value::as_u64)
                .unwrap_or(0) as usize;
            TokenUsage {
                prompt_tokens: prompt,
                completion_tokens: completion,
                total_tokens: prompt + completion,
                reasoning_tokens: None,
            }
        });
        let response_id = value
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_string);
        Ok(Completion {
            text,
            usage,
            response_id,
        })
    }

    fn fallback_models(&self) -> Vec<ModelInfo> {
        MODEL_SPECS
            .iter()
            .map(|(id, input, output)| ModelInfo {
                id: id.to_string(),
                display_name: id.to_string(),
                input_limit: Some(*input),
                output_limit: Some(*output),
                capabilities: vec!["chat".to_string()],
            })
            .collect()
    }
}

#[async_trait]
impl ProviderDriver for AnthropicDriver {
    fn provider_name(&self) -> &'static str {
        "anthropic"
    }

    fn default_model(&self) -> &str {
        &self.model
    }

    async fn initialize(&self) -> Result<(), Error> {
        if self.api_key.is_empty() {
            return Err(Error::AuthFailed("Anthropic API key is empty".to_string()));
        }
        let url = format!("{}/models", self.base_url);
        get_json(&url, &self.headers()).await.map(|_| ())
    }

    async fn list_models(&self) -> Vec<ModelInfo> {
        let url = format!("{}/models", self.base_url);
        let listed = match get_json(&url, &self.headers()).await {
            Ok(value) => value,
            Err(err) => {
                log::warn!(
                    "anthropic: model listing failed ({}), using fallback list",
                    err
                );
                return self.fallback_models();
            }
        };
        let mut models = self.fallback_models();
        if let Some(data) = listed.get("data").and_then(Value::as_array) {
            for entry in data {
                let Some(id) = entry.get("id").and_then(Value::as_str) else {
                    continue;
                };
                if !models.iter().any(|m| m.id == id) {
                    models.push(ModelInfo {
                        id: id.to_string(),
                        display_name: entry
                            .get("display_name")
                            .and_then(Value::as_str)
                            .unwrap_or(id)
                            .to_string(),
                        input_limit: Some(200_000),
                        output_limit: None,
                        capabilities: vec!["chat".to_string()],
                    });
                }
            }
        }
        models
    }

    fn default_params(&self) -> GenParams {
        GenParams {
            temperature: Some(0.7),
            top_p: Some(0.95),
            top_k: Some(40),
            max_output_tokens: Some(DEFAULT_MAX_TOKENS),
            ..GenParams::default()
        }
    }

    fn validate_model(&self, model_id: &str) -> bool {
        model_id.starts_with("claude")
    }

    async fn generate(&self, request: &GenerateRequest) -> Result<Completion, Error> {
        let normalized = normalize_chain(&request.chain, request.system_instruction.as_deref());
        let body = self.request_body(&normalized, &request.model, &request.params, false);
        let url = format!("{}/messages", self.base_url);
        let reply = post_json(&url, &self.headers(), &body).await?;
        Self::parse_message(&reply)
    }

    async fn generate_stream(
        &self,
        request: &GenerateRequest,
    ) -> Result<ProviderEventStream, Error> {
        let normalized = normalize_chain(&request.chain, request.system_instruction.as_deref());
        let body = self.request_body(&normalized, &request.model, &request.params, true);
        let url = format!("{}/messages", self.base_url);
        open_sse(&url, &self.headers(), &body, WireDialect::Anthropic).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loomllm::driver::{ChatTurn, Role};

    #[test]
    fn system_is_a_top_level_field_and_max_tokens_is_always_set() {
        let driver = AnthropicDriver::new_with_model_str("k", "claude-sonnet-4-0");
        let chain = vec![
            ChatTurn::new(Role::System, "Be brief."),
            ChatTurn::new(Role::User, "Hi"),
        ];
        let normalized = normalize_chain(&chain, None);
        let body = driver.request_body(&normalized, "claude-sonnet-4-0", &GenParams::default(), false);
        assert_eq!(body["system"], "Be brief.");
        assert_eq!(body["max_tokens"], 800);
        assert_eq!(body["messages"].as_array().map(Vec::len), Some(1));
    }

    #[test]
    fn wire_usage_fields_are_renamed() {
        let reply = serde_json::json!({
            "id": "msg_x",
            "content": [{"type": "text", "text": "Hello!"}],
            "usage": {"input_tokens": 5, "output_tokens": 2}
        });
        let completion = AnthropicDriver::parse_message(&reply).expect("parse");
        let usage = completion.usage.expect("usage");
        assert_eq!(usage.prompt_tokens, 5);
        assert_eq!(usage.completion_tokens, 2);
        assert_eq!(usage.total_tokens, 7);
        assert_eq!(completion.response_id.as_deref(), Some("msg_x"));
    }
}
