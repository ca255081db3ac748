// src/lib.rs

// Import the top-level `loomllm` module.
pub mod loomllm;

// Re-exporting key items for easier external access.
pub use loomllm::config::GatewayConfig;
pub use loomllm::conversation::{self, Conversation};
pub use loomllm::driver::{self, ProviderDriver};
pub use loomllm::error::Error;
pub use loomllm::event::{self, Event};
pub use loomllm::orchestrator::{self, Orchestrator};
pub use loomllm::providers;
pub use loomllm::session::{self, Session};
pub use loomllm::store::{self, ConversationStore};

/// Initialise `env_logger` once for examples and tests.
///
/// Safe to call repeatedly; later calls are no-ops.
pub fn init_logger() {
    let _ = env_logger::Builder::from_default_env().try_init();
}
