//! Session tests: metadata mirroring, quiet saves, conversation switching.

mod common;

use std::sync::Arc;

use common::ScriptedDriver;
use loomllm::driver::{GenParams, Role};
use loomllm::session::Session;
use loomllm::store::ConversationStore;

fn session_with(driver: Arc<ScriptedDriver>) -> (Session, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(ConversationStore::new(dir.path()).unwrap());
    (Session::new(driver, store), dir)
}

#[tokio::test]
async fn new_sessions_adopt_driver_defaults() {
    let (session, _dir) = session_with(ScriptedDriver::new());
    assert_eq!(session.model(), "scripted-model");
    assert!(session.use_streaming());
    assert!(session.active().is_none());
}

#[tokio::test]
async fn set_model_mirrors_into_the_active_conversation_and_disk() {
    let (mut session, _dir) = session_with(ScriptedDriver::new());
    session.new_conversation("Mirrored").await.unwrap();
    session.set_model("scripted-xl").await.unwrap();

    let active = session.active().unwrap().clone();
    {
        let conversation = active.conversation.lock().await;
        assert_eq!(conversation.metadata.model, "scripted-xl");
    }
    let loaded = session.store().load(&active.id).await.unwrap();
    assert_eq!(loaded.metadata.model, "scripted-xl");
}

#[tokio::test]
async fn set_params_mirrors_into_metadata() {
    let (mut session, _dir) = session_with(ScriptedDriver::new());
    session.new_conversation("Tuned").await.unwrap();
    session
        .set_params(GenParams {
            temperature: Some(0.2),
            max_output_tokens: Some(512),
            ..GenParams::default()
        })
        .await
        .unwrap();

    let active = session.active().unwrap().clone();
    let loaded = session.store().load(&active.id).await.unwrap();
    assert_eq!(loaded.metadata.params.temperature, Some(0.2));
    assert_eq!(loaded.metadata.params.max_output_tokens, Some(512));
}

#[tokio::test]
async fn streaming_preference_is_persisted_per_conversation() {
    let (mut session, _dir) = session_with(ScriptedDriver::new());
    session.new_conversation("Quiet").await.unwrap();
    session.set_streaming(false).await.unwrap();
    assert!(!session.use_streaming());

    let active = session.active().unwrap().clone();
    let loaded = session.store().load(&active.id).await.unwrap();
    assert_eq!(loaded.metadata.streaming_preference, Some(false));
}

#[tokio::test]
async fn system_instruction_seeds_new_conversations_and_mirrors() {
    let (mut session, _dir) = session_with(ScriptedDriver::new());
    session
        .set_system_instruction(Some("Answer in haiku.".to_string()))
        .await
        .unwrap();
    session.new_conversation("Poetic").await.unwrap();

    let active = session.active().unwrap().clone();
    {
        let conversation = active.conversation.lock().await;
        let root_id = conversation.root_id().unwrap();
        let root = &conversation.messages[&root_id];
        assert_eq!(root.role, Role::System);
        assert_eq!(root.content, "Answer in haiku.");
        assert_eq!(
            conversation.metadata.system_instruction.as_deref(),
            Some("Answer in haiku.")
        );
    }

    session
        .set_system_instruction(Some("Answer in prose.".to_string()))
        .await
        .unwrap();
    let loaded = session.store().load(&active.id).await.unwrap();
    assert_eq!(
        loaded.metadata.system_instruction.as_deref(),
        Some("Answer in prose.")
    );
}

#[tokio::test]
async fn switching_conversations_saves_the_previous_one() {
    let (mut session, _dir) = session_with(ScriptedDriver::new());
    let first = session.new_conversation("First").await.unwrap();
    session.set_model("first-model").await.unwrap();

    let second = session.new_conversation("Second").await.unwrap();
    assert_ne!(first, second);
    assert_eq!(session.active_id(), Some(second.as_str()));

    // The first conversation went to disk with the model it had.
    let loaded = session.store().load(&first).await.unwrap();
    assert_eq!(loaded.metadata.model, "first-model");
}

#[tokio::test]
async fn opening_a_conversation_adopts_its_metadata() {
    let (mut session, dir) = session_with(ScriptedDriver::new());
    let id = session.new_conversation("Keeper").await.unwrap();
    session.set_model("adopted-model").await.unwrap();
    session
        .set_params(GenParams {
            temperature: Some(0.1),
            ..GenParams::default()
        })
        .await
        .unwrap();
    session.close_active().await.unwrap();

    // A fresh session starts from driver defaults...
    let store = Arc::new(ConversationStore::new(dir.path()).unwrap());
    let mut fresh = Session::new(ScriptedDriver::new(), store);
    assert_eq!(fresh.model(), "scripted-model");

    // ...and adopts the stored conversation's settings on open.
    fresh.open_conversation(&id).await.unwrap();
    assert_eq!(fresh.model(), "adopted-model");
    assert_eq!(fresh.params().temperature, Some(0.1));
    assert_eq!(fresh.active_id(), Some(id.as_str()));
}

#[tokio::test]
async fn ensure_active_creates_a_default_conversation() {
    let (mut session, _dir) = session_with(ScriptedDriver::new());
    let active = session.ensure_active().await.unwrap();
    {
        let conversation = active.conversation.lock().await;
        assert_eq!(conversation.title(), "New Conversation");
    }
    // Idempotent: the same conversation stays active.
    let again = session.ensure_active().await.unwrap();
    assert_eq!(active.id, again.id);
}
