//! Configuration for the gateway core.
//!
//! Provides the [`GatewayConfig`] struct consumed by
//! [`Session::from_config`](crate::session::Session::from_config).  Users
//! construct it manually or deserialize it from whatever key/value store the
//! embedding application uses — no config-file parsing dependencies are
//! introduced here.
//!
//! # Example
//!
//! ```rust
//! use loomllm::GatewayConfig;
//! use std::path::PathBuf;
//!
//! let config = GatewayConfig {
//!     provider: "gemini".to_string(),
//!     credential: "API_KEY".to_string(),
//!     conversations_dir: PathBuf::from("/var/data/conversations"),
//!     ..GatewayConfig::default()
//! };
//! assert!(config.use_streaming);
//! ```

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::loomllm::driver::GenParams;

/// Recognized gateway options.
///
/// Every field has a documented effect:
///
/// * `provider` — which driver the registry instantiates (`"gemini"`,
///   `"openai"`, `"deepseek"`, `"anthropic"`, plus the `"google"`/`"claude"`
///   aliases).
/// * `model` — model identifier; when `None` the driver's default is used.
/// * `credential` — API key handed to the driver.  Acquisition is the
///   embedder's concern.
/// * `generation_params` — default generation parameters keyed by the
///   canonical names; unknown keys are dropped silently on deserialization.
/// * `use_streaming` — whether sends stream by default.
/// * `conversations_dir` — filesystem root of the conversation store.
/// * `default_system_instruction` — system text seeded into new
///   conversations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub provider: String,
    pub model: Option<String>,
    pub credential: String,
    pub generation_params: GenParams,
    pub use_streaming: bool,
    pub conversations_dir: PathBuf,
    pub default_system_instruction: Option<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            provider: "gemini".to_string(),
            model: None,
            credential: String::new(),
            generation_params: GenParams::default(),
            use_streaming: true,
            conversations_dir: PathBuf::from("conversations"),
            default_system_instruction: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_keys_are_dropped_silently() {
        let config: GatewayConfig = serde_json::from_str(
            r#"{
                "provider": "openai",
                "credential": "k",
                "generation_params": {"temperature": 0.5, "mystery_knob": 9},
                "not_an_option": true
            }"#,
        )
        .expect("config should parse");
        assert_eq!(config.provider, "openai");
        assert_eq!(config.generation_params.temperature, Some(0.5));
    }
}
