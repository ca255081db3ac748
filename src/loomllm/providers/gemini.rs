//! Google Gemini driver speaking the Generative Language API.
//!
//! Gemini does not offer an OpenAI-compatible chat surface for generation
//! with system side channels, so this driver builds the native wire format:
//! turns become `contents[]` entries with roles `user`/`model`, the system
//! text travels in the `systemInstruction` field, and generation parameters
//! are camelCased into `generationConfig`.  Authentication is key-in-query
//! rather than a Bearer header.
//!
//! Streaming uses `:streamGenerateContent?alt=sse`, whose chunks carry the
//! same candidate shape as the blocking reply; the shared SSE adapter
//! handles reassembly and renames `usageMetadata` into the uniform token
//! accounting.

use async_trait::async_trait;
use serde_json::Value;

use crate::loomllm::driver::{
    normalize_chain, Completion, GenParams, GenerateRequest, ModelInfo, NormalizedChain,
    ProviderDriver, ProviderEventStream, Role,
};
use crate::loomllm::error::Error;
use crate::loomllm::providers::common::{get_json, open_sse, post_json, WireDialect};

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

/// (id, input limit, output limit) — the fallback table merged under live
/// listings.  Preview models advertise no limits.
const MODEL_SPECS: &[(&str, Option<u32>, Option<u32>)] = &[
    ("gemini-2.0-flash", Some(32_768), Some(8_192)),
    ("gemini-2.0-pro", Some(32_768), Some(8_192)),
    ("gemini-2.5-flash-preview-05-20", None, None),
    ("gemini-2.5-pro-preview-05-06", None, None),
];

/// Client for Google's Generative Language (Gemini) endpoints.
#[derive(Debug)]
pub struct GeminiDriver {
    api_key: String,
    model: String,
    base_url: String,
}

impl GeminiDriver {
    pub fn new_with_model_str(secret_key: &str, model_name: &str) -> Self {
        Self::new_with_base_url(secret_key, model_name, DEFAULT_BASE_URL)
    }

    pub fn new_with_base_url(secret_key: &str, model_name: &str, base_url: &str) -> Self {
        GeminiDriver {
            api_key: secret_key.to_string(),
            model: model_name.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    /// The API accepts both `gemini-2.0-flash` and `models/gemini-2.0-flash`;
    /// URLs want exactly one `models/` segment.
    fn normalize_model_name(model: &str) -> &str {
        model.strip_prefix("models/").unwrap_or(model)
    }

    fn output_limit(model: &str) -> Option<u32> {
        let model = Self::normalize_model_name(model);
        MODEL_SPECS
            .iter()
            .find(|(id, _, _)| *id == model)
            .and_then(|(_, _, output)| *output)
    }

    fn generation_config(&self, model: &str, params: &GenParams) -> Value {
        let merged = params.merged_over(&self.default_params());
        let mut config = serde_json::Map::new();
        if let Some(temperature) = merged.temperature {
            config.insert("temperature".to_string(), temperature.into());
        }
        if let Some(top_p) = merged.top_p {
            config.insert("topP".to_string(), top_p.into());
        }
        if let Some(top_k) = merged.top_k {
            config.insert("topK".to_string(), top_k.into());
        }
        if let Some(mut max) = merged.max_output_tokens {
            if let Some(limit) = Self::output_limit(model) {
                if max > limit {
                    log::warn!(
                        "gemini: clamping max_output_tokens {} to model {} limit {}",
                        max,
                        model,
                        limit
                    );
                    max = limit;
                }
            }
            config.insert("maxOutputTokens".to_string(), max.into());
        }
        if let Some(stop) = &merged.stop_sequences {
            if !stop.is_empty() {
                config.insert("stopSequences".to_string(), serde_json::json!(stop));
            }
        }
        if let Some(seed) = merged.seed {
            config.insert("seed".to_string(), seed.into());
        }
        if matches!(merged.response_format.as_deref(), Some("json" | "json_object")) {
            config.insert(
                "responseMimeType".to_string(),
                "application/json".into(),
            );
        }
        Value::Object(config)
    }

    fn request_body(&self, normalized: &NormalizedChain, model: &str, params: &GenParams) -> Value {
        let contents: Vec<Value> = normalized
            .turns
            .iter()
            .map(|turn| {
                let role = match turn.role {
                    Role::Assistant => "model",
                    _ => "user",
                };
                serde_json::json!({
                    "role": role,
                    "parts": [{"text": turn.content}],
                })
            })
            .collect();

        let mut body = serde_json::Map::new();
        body.insert("contents".to_string(), Value::Array(contents));
        if let Some(system) = &normalized.system {
            body.insert(
                "systemInstruction".to_string(),
                serde_json::json!({"parts": [{"text": system}]}),
            );
        }
        body.insert(
            "generationConfig".to_string(),
            self.generation_config(model, params),
        );
        Value::Object(body)
    }

    fn parse_generate_content(value: &Value) -> Result<Completion, Error> {
        let parts = value
            .get("candidates")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("content"))
            .and_then(|c| c.get("parts"))
            .and_then(Value::as_array)
            .ok_or_else(|| Error::Network("no candidates in Gemini reply".to_string()))?;
        let mut text = String::new();
        for part in parts {
            if let Some(fragment) = part.get("text").and_then(Value::as_str) {
                text.push_str(fragment);
            }
        }
        let usage = value.get("usageMetadata").map(|meta| {
            let prompt = meta
                .get("promptTokenCount")
                .and_then(Value::as_u64)
                .unwrap_or(0) as usize;
            let completion = meta
                .get("candidatesTokenCount")
                .and_then(Value::as_u64)
                .unwrap_or(0) as usize;
            let total = meta
                .get("totalTokenCount")
                .and_then(Value::as_u64)
                .unwrap_or((prompt + completion) as u64) as usize;
            crate::loomllm::driver::TokenUsage {
                prompt_tokens: prompt,
                completion_tokens: completion,
                total_tokens: total,
                reasoning_tokens: meta
                    .get("thoughtsTokenCount")
                    .and_then(Value::as_u64)
                    .map(|n| n as usize),
            }
        });
        let response_id = value
            .get("responseId")
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
                input_limit: *input,
                output_limit: *output,
                capabilities: vec!["generateContent".to_string()],
            })
            .collect()
    }
}

#[async_trait]
impl ProviderDriver for GeminiDriver {
    fn provider_name(&self) -> &'static str {
        "gemini"
    }

    fn default_model(&self) -> &str {
        &self.model
    }

    async fn initialize(&self) -> Result<(), Error> {
        if self.api_key.is_empty() {
            return Err(Error::AuthFailed("Gemini API key is empty".to_string()));
        }
        let url = format!("{}/models?key={}", self.base_url, self.api_key);
        get_json(&url, &[]).await.map(|_| ())
    }

    async fn list_models(&self) -> Vec<ModelInfo> {
        let url = format!("{}/models?key={}", self.base_url, self.api_key);
        let listed = match get_json(&url, &[]).await {
            Ok(value) => value,
            Err(err) => {
                log::warn!("gemini: model listing failed ({}), using fallback list", err);
                return self.fallback_models();
            }
        };
        // Fallback entries first; live listings override them by id.
        let mut models = self.fallback_models();
        if let Some(entries) = listed.get("models").and_then(Value::as_array) {
            for entry in entries {
                let supports_generate = entry
                    .get("supportedGenerationMethods")
                    .and_then(Value::as_array)
                    .map(|methods| {
                        methods
                            .iter()
                            .any(|m| m.as_str() == Some("generateContent"))
                    })
                    .unwrap_or(false);
                if !supports_generate {
                    continue;
                }
                let Some(name) = entry.get("name").and_then(Value::as_str) else {
                    continue;
                };
                let id = Self::normalize_model_name(name).to_string();
                let info = ModelInfo {
                    display_name: entry
                        .get("displayName")
                        .and_then(Value::as_str)
                        .unwrap_or(&id)
                        .to_string(),
                    input_limit: entry
                        .get("inputTokenLimit")
                        .and_then(Value::as_u64)
                        .map(|n| n as u32),
                    output_limit: entry
                        .get("outputTokenLimit")
                        .and_then(Value::as_u64)
                        .map(|n| n as u32),
                    capabilities: vec!["generateContent".to_string()],
                    id: id.clone(),
                };
                if let Some(existing) = models.iter_mut().find(|m| m.id == id) {
                    *existing = info;
                } else {
                    models.push(info);
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
            max_output_tokens: Some(800),
            ..GenParams::default()
        }
    }

    fn validate_model(&self, model_id: &str) -> bool {
        model_id.to_ascii_lowercase().contains("gemini")
    }

    async fn generate(&self, request: &GenerateRequest) -> Result<Completion, Error> {
        let normalized = normalize_chain(&request.chain, request.system_instruction.as_deref());
        let model = Self::normalize_model_name(&request.model);
        let body = self.request_body(&normalized, model, &request.params);
        let url = format!(
            "{}/models/{}:generateContent?key={}",
            self.base_url, model, self.api_key
        );
        let reply = post_json(&url, &[], &body).await?;
        Self::parse_generate_content(&reply)
    }

    async fn generate_stream(
        &self,
        request: &GenerateRequest,
    ) -> Result<ProviderEventStream, Error> {
        let normalized = normalize_chain(&request.chain, request.system_instruction.as_deref());
        let model = Self::normalize_model_name(&request.model);
        let body = self.request_body(&normalized, model, &request.params);
        let url = format!(
            "{}/models/{}:streamGenerateContent?alt=sse&key={}",
            self.base_url, model, self.api_key
        );
        open_sse(&url, &[], &body, WireDialect::Gemini).await
    }
}
