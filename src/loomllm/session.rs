//! Process-scoped session state.
//!
//! A [`Session`] bundles the current driver handle, model, default
//! generation parameters, streaming preference, system instruction, the
//! active conversation, and a store reference.  It is mutable only through
//! explicit setters: setting a new model, parameters, or system instruction
//! also mirrors the value into the active conversation's metadata and
//! quietly saves it, and switching conversations saves the previous one
//! first.
//!
//! Transport layers hold one session per process; tests instantiate fresh
//! sessions.
//!
//! # Example
//!
//! ```rust,no_run
//! use loomllm::{GatewayConfig, Session};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), loomllm::Error> {
//!     let config = GatewayConfig {
//!         provider: "gemini".to_string(),
//!         credential: std::env::var("GEMINI_API_KEY").expect("GEMINI_API_KEY not set"),
//!         ..GatewayConfig::default()
//!     };
//!     let mut session = Session::from_config(&config)?;
//!     session.new_conversation("First chat").await?;
//!     Ok(())
//! }
//! ```

use std::sync::Arc;

use tokio::sync::Mutex as AsyncMutex;

use crate::loomllm::config::GatewayConfig;
use crate::loomllm::conversation::Conversation;
use crate::loomllm::driver::{GenParams, ProviderDriver};
use crate::loomllm::error::Error;
use crate::loomllm::providers::{self, DriverOverrides};
use crate::loomllm::store::ConversationStore;

/// Handle to the conversation a session currently operates on.
///
/// The conversation itself lives behind a mutex so workers can finalise
/// replies while the session stays borrowable.
#[derive(Clone)]
pub struct ActiveConversation {
    pub id: String,
    pub conversation: Arc<AsyncMutex<Conversation>>,
}

/// Process-wide mutable gateway state.
pub struct Session {
    driver: Arc<dyn ProviderDriver>,
    model: String,
    params: GenParams,
    use_streaming: bool,
    system_instruction: Option<String>,
    store: Arc<ConversationStore>,
    active: Option<ActiveConversation>,
}

impl Session {
    /// Build a session around an existing driver and store.
    pub fn new(driver: Arc<dyn ProviderDriver>, store: Arc<ConversationStore>) -> Self {
        let model = driver.default_model().to_string();
        let params = driver.default_params();
        Session {
            driver,
            model,
            params,
            use_streaming: true,
            system_instruction: None,
            store,
            active: None,
        }
    }

    /// Build a session from a [`GatewayConfig`]: instantiate the driver via
    /// the registry, open the store, and overlay the configured defaults.
    pub fn from_config(config: &GatewayConfig) -> Result<Self, Error> {
        let driver = providers::create(
            &config.provider,
            &config.credential,
            Some(DriverOverrides {
                base_url: None,
                model: config.model.clone(),
            }),
        )?;
        let store = Arc::new(ConversationStore::new(&config.conversations_dir)?);
        let mut session = Session::new(driver, store);
        session.params = config
            .generation_params
            .merged_over(&session.driver.default_params());
        session.use_streaming = config.use_streaming;
        session.system_instruction = config.default_system_instruction.clone();
        Ok(session)
    }

    pub fn driver(&self) -> Arc<dyn ProviderDriver> {
        self.driver.clone()
    }

    pub fn store(&self) -> Arc<ConversationStore> {
        self.store.clone()
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn params(&self) -> &GenParams {
        &self.params
    }

    pub fn use_streaming(&self) -> bool {
        self.use_streaming
    }

    pub fn system_instruction(&self) -> Option<&str> {
        self.system_instruction.as_deref()
    }

    pub fn active(&self) -> Option<&ActiveConversation> {
        self.active.as_ref()
    }

    pub fn active_id(&self) -> Option<&str> {
        self.active.as_ref().map(|a| a.id.as_str())
    }

    /// Create, persist and activate a fresh conversation seeded with the
    /// session's system instruction, model and parameters.  The previously
    /// active conversation is saved first.
    pub async fn new_conversation(&mut self, title: &str) -> Result<String, Error> {
        self.save_active().await?;
        let mut conversation = Conversation::new(title, self.system_instruction.as_deref());
        conversation.metadata.model = self.model.clone();
        conversation.metadata.params = self.params.clone();
        self.store.save(&mut conversation).await?;
        let id = conversation.id.clone();
        self.active = Some(ActiveConversation {
            id: id.clone(),
            conversation: Arc::new(AsyncMutex::new(conversation)),
        });
        Ok(id)
    }

    /// Load and activate a stored conversation, adopting its model and
    /// parameters as the session defaults (as the on-disk metadata is the
    /// source of truth for an ongoing conversation).  The previously active
    /// conversation is saved first.
    pub async fn open_conversation(&mut self, identifier: &str) -> Result<String, Error> {
        self.save_active().await?;
        let conversation = self.store.load(identifier).await?;
        if !conversation.metadata.model.is_empty() {
            self.model = conversation.metadata.model.clone();
        }
        if !conversation.metadata.params.is_empty() {
            self.params = conversation.metadata.params.clone();
        }
        if let Some(streaming) = conversation.metadata.streaming_preference {
            self.use_streaming = streaming;
        }
        let id = conversation.id.clone();
        self.active = Some(ActiveConversation {
            id: id.clone(),
            conversation: Arc::new(AsyncMutex::new(conversation)),
        });
        Ok(id)
    }

    /// The active conversation, creating a default one when none is active.
    pub async fn ensure_active(&mut self) -> Result<ActiveConversation, Error> {
        if self.active.is_none() {
            self.new_conversation("New Conversation").await?;
        }
        self.active
            .clone()
            .ok_or_else(|| Error::InvariantViolation("no active conversation after create".into()))
    }

    /// Mirror session defaults into the active conversation's metadata and
    /// persist it.  No-op without an active conversation.
    pub async fn save_active(&mut self) -> Result<(), Error> {
        let Some(active) = &self.active else {
            return Ok(());
        };
        let mut conversation = active.conversation.lock().await;
        conversation.metadata.model = self.model.clone();
        conversation.metadata.params = self.params.clone();
        self.store.save(&mut conversation).await?;
        Ok(())
    }

    /// Drop the active conversation, saving it first.
    pub async fn close_active(&mut self) -> Result<(), Error> {
        self.save_active().await?;
        self.active = None;
        Ok(())
    }

    /// Select a new model.  Mirrors into the active conversation and saves
    /// quietly.  A model the driver does not recognise is accepted with a
    /// warning (listings can be stale).
    pub async fn set_model(&mut self, model: &str) -> Result<(), Error> {
        if !self.driver.validate_model(model) {
            log::warn!(
                "model '{}' does not look like a {} model",
                model,
                self.driver.provider_name()
            );
        }
        self.model = model.to_string();
        self.save_active().await
    }

    /// Replace the default generation parameters.  Mirrors into the active
    /// conversation and saves quietly.
    pub async fn set_params(&mut self, params: GenParams) -> Result<(), Error> {
        self.params = params;
        self.save_active().await
    }

    /// Flip the default streaming preference.  Mirrors into the active
    /// conversation's metadata and saves quietly.
    pub async fn set_streaming(&mut self, streaming: bool) -> Result<(), Error> {
        self.use_streaming = streaming;
        if let Some(active) = &self.active {
            let mut conversation = active.conversation.lock().await;
            conversation.metadata.streaming_preference = Some(streaming);
            self.store.save(&mut conversation).await?;
        }
        Ok(())
    }

    /// Replace the default system instruction.  Mirrors into the active
    /// conversation's metadata and saves quietly.
    pub async fn set_system_instruction(&mut self, text: Option<String>) -> Result<(), Error> {
        self.system_instruction = text.clone();
        if let Some(active) = &self.active {
            let mut conversation = active.conversation.lock().await;
            conversation.metadata.system_instruction = text;
            self.store.save(&mut conversation).await?;
        }
        Ok(())
    }
}
