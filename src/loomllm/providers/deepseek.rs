//! DeepSeek driver.
//!
//! DeepSeek exposes an OpenAI-compatible surface at `api.deepseek.com`, so
//! the wire handling delegates to the shared chat-completions codec; what is
//! DeepSeek-specific lives here: the model specification table (64K context,
//! per-model output caps), the provider defaults, and the `deepseek-reasoner`
//! output budget.  Reasoner streams surface their intermediate
//! `reasoning_content` deltas as `Thinking` events through the shared SSE
//! adapter.

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

const DEFAULT_BASE_URL: &str = "https://api.deepseek.com/v1";

/// (id, context window, default output, max output)
const MODEL_SPECS: &[(&str, u32, u32, u32)] = &[
    ("deepseek-chat", 64_000, 4_096, 8_192),
    ("deepseek-reasoner", 64_000, 32_768, 65_536),
];

/// Client for DeepSeek's OpenAI-compatible chat surface.
#[derive(Debug)]
pub struct DeepSeekDriver {
    api_key: String,
    model: String,
    base_url: String,
}

impl DeepSeekDriver {
    pub fn new_with_model_str(secret_key: &str, model_name: &str) -> Self {
        Self::new_with_base_url(secret_key, model_name, DEFAULT_BASE_URL)
    }

    pub fn new_with_base_url(secret_key: &str, model_name: &str, base_url: &str) -> Self {
        DeepSeekDriver {
            api_key: secret_key.to_string(),
            model: model_name.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn auth_headers(&self) -> Vec<(&'static str, String)> {
        vec![("Authorization", format!("Bearer {}", self.api_key))]
    }

    fn spec(model: &str) -> &'static (&'static str, u32, u32, u32) {
        MODEL_SPECS
            .iter()
            .find(|(id, _, _, _)| *id == model)
            .unwrap_or(&MODEL_SPECS[0])
    }

    fn wire_params(&self, model: &str, params: &GenParams) -> serde_json::Map<String, Value> {
        let merged = params.merged_over(&self.default_params());
        let spec = Self::spec(model);
        let mut map = serde_json::Map::new();

        let mut max_tokens = merged.max_output_tokens.unwrap_or(spec.2);
        if max_tokens > spec.3 {
            log::warn!(
                "deepseek: clamping max_output_tokens {} to model {} limit {}",
                max_tokens,
                model,
                spec.3
            );
            max_tokens = spec.3;
        }
        map.insert("max_tokens".to_string(), max_tokens.into());
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
            .map(|(id, input, _, output)| ModelInfo {
                id: id.to_string(),
                display_name: id.replace('-', " "),
                input_limit: Some(*input),
                output_limit: Some(*output),
                capabilities: vec!["chat".to_string()],
            })
            .collect()
    }
}

#[async_trait]
impl ProviderDriver for DeepSeekDriver {
    fn provider_name(&self) -> &'static str {
        "deepseek"
    }

    fn default_model(&self) -> &str {
        &self.model
    }

    async fn initialize(&self) -> Result<(), Error> {
        if self.api_key.is_empty() {
            return Err(Error::AuthFailed("DeepSeek API key is empty".to_string()));
        }
        let url = format!("{}/models", self.base_url);
        get_json(&url, &self.auth_headers()).await.map(|_| ())
    }

    async fn list_models(&self) -> Vec<ModelInfo> {
        let url = format!("{}/models", self.base_url);
        let listed = match get_json(&url, &self.auth_headers()).await {
            Ok(value) => value,
            Err(err) => {
                log::warn!(
                    "deepseek: model listing failed ({}), using fallback list",
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
                        display_name: id.replace('-', " "),
                        input_limit: Some(64_000),
                        output_limit: Some(8_192),
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
            top_p: Some(1.0),
            frequency_penalty: Some(0.0),
            presence_penalty: Some(0.0),
            max_output_tokens: Some(Self::spec(&self.model).2),
            ..GenParams::default()
        }
    }

    fn validate_model(&self, model_id: &str) -> bool {
        model_id.starts_with("deepseek")
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
    fn reasoner_gets_its_own_output_budget() {
        let driver = DeepSeekDriver::new_with_model_str("k", "deepseek-reasoner");
        let wire = driver.wire_params("deepseek-reasoner", &GenParams::default());
        assert_eq!(wire.get("max_tokens"), Some(&32_768.into()));
    }

    #[test]
    fn output_clamp_logs_and_caps() {
        let driver = DeepSeekDriver::new_with_model_str("k", "deepseek-chat");
        let params = GenParams {
            max_output_tokens: Some(100_000),
            ..GenParams::default()
        };
        let wire = driver.wire_params("deepseek-chat", &params);
        assert_eq!(wire.get("max_tokens"), Some(&8_192.into()));
    }
}
