//! OpenAI driver speaking the Chat Completions API.
//!
//! Translates normalized chains into `POST {base}/chat/completions` requests
//! with Bearer authentication, maps the canonical parameter names onto the
//! OpenAI wire names, and adapts both the blocking and the SSE streaming
//! reply shapes into the uniform driver contract.
//!
//! Reasoning-tier models (`o1`, `o3`, …) reject sampling parameters and use
//! `max_completion_tokens` instead of `max_tokens`; the driver applies that
//! translation automatically and forwards `reasoning_effort` only to them.
//!
//! # Example
//!
//! ```rust,no_run
//! use loomllm::driver::{ChatTurn, GenerateRequest, GenParams, ProviderDriver, Role};
//! use loomllm::providers::openai::OpenAiDriver;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), loomllm::Error> {
//!     let key = std::env::var("OPENAI_API_KEY").expect("OPENAI_API_KEY not set");
//!     let driver = OpenAiDriver::new_with_model_str(&key, "gpt-4o-mini");
//!     let reply = driver
//!         .generate(&GenerateRequest {
//!             model: "gpt-4o-mini".to_string(),
//!             chain: vec![ChatTurn::new(Role::User, "Who are you?")],
//!             system_instruction: None,
//!             params: GenParams::default(),
//!         })
//!         .await?;
//!     println!("{}", reply.text);
//!     Ok(())
//! }
//! ```

use async_trait::async_trait;
use serde_json::Value;

use crate::loomllm::driver::{
    normalize_chain, Completion, GenParams, GenerateRequest, ModelInfo, ProviderDriver,
    ProviderEventStream,
};
use crate::loomllm::error::Error;
use crate::loomllm::providers::common::{
    chat_body, get_json, open_sse, parse_chat_completion, post_json, WireDialect,
};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Known model specifications: (id, input limit, output limit).
const MODEL_SPECS: &[(&str, u32, u32)] = &[
    ("gpt-4.1", 1_047_576, 32_768),
    ("gpt-4.1-mini", 1_047_576, 32_768),
    ("gpt-4.1-nano", 1_047_576, 32_768),
    ("gpt-4o", 128_000, 16_384),
    ("gpt-4o-mini", 128_000, 16_384),
    ("o1", 200_000, 100_000),
    ("o3-mini", 200_000, 100_000),
];

/// Client for OpenAI's Chat Completions surface.
#[derive(Debug)]
pub struct OpenAiDriver {
    api_key: String,
    model: String,
    base_url: String,
}

impl OpenAiDriver {
    /// Create a driver from an API key and explicit model string.
    pub fn new_with_model_str(secret_key: &str, model_name: &str) -> Self {
        Self::new_with_base_url(secret_key, model_name, DEFAULT_BASE_URL)
    }

    /// Create a driver pointing at a custom OpenAI-compatible base URL.
    pub fn new_with_base_url(secret_key: &str, model_name: &str, base_url: &str) -> Self {
        OpenAiDriver {
            api_key: secret_key.to_string(),
            model: model_name.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn auth_headers(&self) -> Vec<(&'static str, String)> {
        vec![("Authorization", format!("Bearer {}", self.api_key))]
    }

    /// Whether `model` belongs to the reasoning tier with its parameter
    /// restrictions.
    fn is_reasoning_model(model: &str) -> bool {
        model.starts_with("o1") || model.starts_with("o3") || model.starts_with("o4")
    }

    fn output_limit(model: &str) -> Option<u32> {
        // Exact ids win over dated variants like `gpt-4o-2024-11-20`.
        MODEL_SPECS
            .iter()
            .find(|(id, _, _)| model == *id)
            .or_else(|| {
                MODEL_SPECS
                    .iter()
                    .find(|(id, _, _)| model.starts_with(&format!("{}-", id)))
            })
            .map(|(_, _, output)| *output)
    }

    /// Translate canonical parameters into the OpenAI wire names.
    ///
    /// `top_k` has no OpenAI equivalent and is dropped silently; sampling
    /// parameters are dropped for reasoning models.
    fn wire_params(&self, model: &str, params: &GenParams) -> serde_json::Map<String, Value> {
        let merged = params.merged_over(&self.default_params());
        let mut map = serde_json::Map::new();

        let mut max_tokens = merged.max_output_tokens;
        if let (Some(requested), Some(limit)) = (max_tokens, Self::output_limit(model)) {
            if requested > limit {
                log::warn!(
                    "openai: clamping max_output_tokens {} to model {} limit {}",
                    requested,
                    model,
                    limit
                );
                max_tokens = Some(limit);
            }
        }

        if Self::is_reasoning_model(model) {
            if let Some(max) = max_tokens {
                map.insert("max_completion_tokens".to_string(), max.into());
            }
            if let Some(effort) = &merged.reasoning_effort {
                map.insert("reasoning_effort".to_string(), effort.as_str().into());
            }
        } else {
            if let Some(temperature) = merged.temperature {
                map.insert("temperature".to_string(), temperature.into());
            }
            if let Some(top_p) = merged.top_p {
                map.insert("top_p".to_string(), top_p.into());
            }
            if let Some(frequency) = merged.frequency_penalty {
                map.insert("frequency_penalty".to_string(), frequency.into());
            }
            if let Some(presence) = merged.presence_penalty {
                map.insert("presence_penalty".to_string(), presence.into());
            }
            if let Some(max) = max_tokens {
                map.insert("max_tokens".to_string(), max.into());
            }
            if let Some(seed) = merged.seed {
                map.insert("seed".to_string(), seed.into());
            }
        }
        if let Some(stop) = &merged.stop_sequences {
            if !stop.is_empty() {
                map.insert("stop".to_string(), serde_json::json!(stop));
            }
        }
        if let Some(format) = &merged.response_format {
            map.insert(
                "response_format".to_string(),
                serde_json::json!({"type": format}),
            );
        }
        map
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
impl ProviderDriver for OpenAiDriver {
    fn provider_name(&self) -> &'static str {
        "openai"
    }

    fn default_model(&self) -> &str {
        &self.model
    }

    async fn initialize(&self) -> Result<(), Error> {
        if self.api_key.is_empty() {
            return Err(Error::AuthFailed("OpenAI API key is empty".to_string()));
        }
        let url = format!("{}/models", self.base_url);
        get_json(&url, &self.auth_headers()).await.map(|_| ())
    }

    async fn list_models(&self) -> Vec<ModelInfo> {
        let url = format!("{}/models", self.base_url);
        let listed = match get_json(&url, &self.auth_headers()).await {
            Ok(value) => value,
            Err(err) => {
                log::warn!("openai: model listing failed ({}), using fallback list", err);
                return self.fallback_models();
            }
        };
        let mut models = self.fallback_models();
        if let Some(data) = listed.get("data").and_then(Value::as_array) {
            for entry in data {
                let Some(id) = entry.get("id").and_then(Value::as_str) else {
                    continue;
                };
                if !self.validate_model(id) {
                    continue;
                }
                if !models.iter().any(|m| m.id == id) {
                    models.push(ModelInfo {
                        id: id.to_string(),
                        display_name: id.to_string(),
                        input_limit: None,
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
            max_output_tokens: Some(800),
            frequency_penalty: Some(0.0),
            presence_penalty: Some(0.0),
            ..GenParams::default()
        }
    }

    fn validate_model(&self, model_id: &str) -> bool {
        model_id.starts_with("gpt")
            || model_id.starts_with("chatgpt")
            || Self::is_reasoning_model(model_id)
    }

    async fn generate(&self, request: &GenerateRequest) -> Result<Completion, Error> {
        let normalized = normalize_chain(&request.chain, request.system_instruction.as_deref());
        let body = chat_body(
            &request.model,
            &normalized,
            &self.wire_params(&request.model, &request.params),
            false,
        );
        let url = format!("{}/chat/completions", self.base_url);
        let reply = post_json(&url, &self.auth_headers(), &body).await?;
        parse_chat_completion(&reply)
    }

    async fn generate_stream(
        &self,
        request: &GenerateRequest,
    ) -> Result<ProviderEventStream, Error> {
        let normalized = normalize_chain(&request.chain, request.system_instruction.as_deref());
        let body = chat_body(
            &request.model,
            &normalized,
            &self.wire_params(&request.model, &request.params),
            true,
        );
        let url = format!("{}/chat/completions", self.base_url);
        open_sse(&url, &self.auth_headers(), &body, WireDialect::OpenAiCompatible).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reasoning_models_drop_sampling_params() {
        let driver = OpenAiDriver::new_with_model_str("k", "o1");
        let params = GenParams {
            temperature: Some(0.2),
            max_output_tokens: Some(1000),
            reasoning_effort: Some("high".to_string()),
            ..GenParams::default()
        };
        let wire = driver.wire_params("o1", &params);
        assert!(wire.get("temperature").is_none());
        assert_eq!(wire.get("max_completion_tokens"), Some(&1000.into()));
        assert_eq!(
            wire.get("reasoning_effort").and_then(|v| v.as_str()),
            Some("high")
        );
    }

    #[test]
    fn max_output_tokens_is_clamped_to_the_model_limit() {
        let driver = OpenAiDriver::new_with_model_str("k", "gpt-4o-mini");
        let params = GenParams {
            max_output_tokens: Some(1_000_000),
            ..GenParams::default()
        };
        let wire = driver.wire_params("gpt-4o-mini", &params);
        assert_eq!(wire.get("max_tokens"), Some(&16_384.into()));
    }
}
