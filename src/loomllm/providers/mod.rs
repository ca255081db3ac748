//! Provider drivers and the closed registry that constructs them.
//!
//! The registry maps provider names to driver factories; there is no runtime
//! plugin loading.  Aliases accepted on input: `google` for Gemini and
//! `claude` for Anthropic.
//!
//! # Example
//!
//! ```rust
//! use loomllm::driver::ProviderDriver;
//! use loomllm::providers;
//!
//! let driver = providers::create("gemini", "API_KEY", None).unwrap();
//! assert_eq!(driver.provider_name(), "gemini");
//! assert_eq!(driver.default_model(), "gemini-2.0-flash");
//!
//! assert!(providers::create("skynet", "API_KEY", None).is_err());
//! ```

pub mod anthropic;
pub mod common;
pub mod deepseek;
pub mod gemini;
pub mod openai;

use std::sync::Arc;

use crate::loomllm::driver::ProviderDriver;
use crate::loomllm::error::Error;

use anthropic::AnthropicDriver;
use deepseek::DeepSeekDriver;
use gemini::GeminiDriver;
use openai::OpenAiDriver;

/// Optional construction overrides.
#[derive(Debug, Clone, Default)]
pub struct DriverOverrides {
    /// Custom API endpoint (e.g. a proxy or an Azure-style deployment).
    pub base_url: Option<String>,
    /// Model to use instead of the provider default.
    pub model: Option<String>,
}

/// Default model per provider when the caller names none.
pub fn default_model(provider: &str) -> Option<&'static str> {
    match provider {
        "openai" => Some("gpt-4o-mini"),
        "deepseek" => Some("deepseek-chat"),
        "gemini" | "google" => Some("gemini-2.0-flash"),
        "anthropic" | "claude" => Some("claude-sonnet-4-0"),
        _ => None,
    }
}

/// Instantiate a driver by provider name.
///
/// Unknown names fail with [`Error::ConfigInvalid`].  The returned driver is
/// not yet initialized; call
/// [`ProviderDriver::initialize`](crate::driver::ProviderDriver::initialize)
/// to verify the credential.
pub fn create(
    provider: &str,
    credential: &str,
    overrides: Option<DriverOverrides>,
) -> Result<Arc<dyn ProviderDriver>, Error> {
    let name = provider.trim().to_ascii_lowercase();
    let overrides = overrides.unwrap_or_default();
    let model = overrides
        .model
        .as_deref()
        .or_else(|| default_model(&name))
        .ok_or_else(|| Error::ConfigInvalid(format!("unknown provider '{}'", provider)))?;

    let driver: Arc<dyn ProviderDriver> = match name.as_str() {
        "openai" => match &overrides.base_url {
            Some(base) => Arc::new(OpenAiDriver::new_with_base_url(credential, model, base)),
            None => Arc::new(OpenAiDriver::new_with_model_str(credential, model)),
        },
        "deepseek" => match &overrides.base_url {
            Some(base) => Arc::new(DeepSeekDriver::new_with_base_url(credential, model, base)),
            None => Arc::new(DeepSeekDriver::new_with_model_str(credential, model)),
        },
        "gemini" | "google" => match &overrides.base_url {
            Some(base) => Arc::new(GeminiDriver::new_with_base_url(credential, model, base)),
            None => Arc::new(GeminiDriver::new_with_model_str(credential, model)),
        },
        "anthropic" | "claude" => match &overrides.base_url {
            Some(base) => Arc::new(AnthropicDriver::new_with_base_url(credential, model, base)),
            None => Arc::new(AnthropicDriver::new_with_model_str(credential, model)),
        },
        _ => {
            return Err(Error::ConfigInvalid(format!(
                "unknown provider '{}'",
                provider
            )))
        }
    };
    Ok(driver)
}
