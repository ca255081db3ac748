//! Store tests: round-trips, identifier resolution, duplication, legacy files.

use std::collections::HashMap;

use loomllm::conversation::Conversation;
use loomllm::driver::{Attachment, GenParams, TokenUsage};
use loomllm::store::{format_filename, ConversationStore};

fn sample_conversation(title: &str) -> Conversation {
    let mut conversation = Conversation::new(title, Some("You are helpful."));
    conversation
        .add_user(
            "Hi",
            vec![Attachment {
                file_name: "notes.txt".to_string(),
                mime_type: "text/plain".to_string(),
                content: "remember the milk".to_string(),
                token_count: 4,
            }],
        )
        .unwrap();
    conversation
        .add_assistant(
            "Hello!",
            "test-model",
            GenParams {
                temperature: Some(0.3),
                ..GenParams::default()
            },
            Some(TokenUsage {
                prompt_tokens: 5,
                completion_tokens: 2,
                total_tokens: 7,
                reasoning_tokens: None,
            }),
            Some("resp-1".to_string()),
            None,
            None,
        )
        .unwrap();
    conversation
}

#[tokio::test]
async fn save_then_load_is_identity_up_to_updated_at() {
    let dir = tempfile::tempdir().unwrap();
    let store = ConversationStore::new(dir.path()).unwrap();

    let mut conversation = sample_conversation("Round Trip");
    let path = store.save(&mut conversation).await.unwrap();
    assert!(path.exists());
    assert_eq!(
        path.file_name().unwrap().to_str().unwrap(),
        format_filename("Round Trip", &conversation.id)
    );

    let loaded = store.load(&conversation.id).await.unwrap();
    loaded.check_invariants().unwrap();
    assert_eq!(loaded.id, conversation.id);
    assert_eq!(loaded.title(), "Round Trip");
    assert_eq!(loaded.active_branch(), conversation.active_branch());
    assert_eq!(loaded.active_leaf(), conversation.active_leaf());
    assert_eq!(loaded.messages.len(), conversation.messages.len());
    for (id, message) in &conversation.messages {
        let copy = &loaded.messages[id];
        assert_eq!(copy.content, message.content);
        assert_eq!(copy.role, message.role);
        assert_eq!(copy.parent_id, message.parent_id);
        assert_eq!(copy.children, message.children);
        assert_eq!(copy.attachments, message.attachments);
        assert_eq!(copy.token_usage, message.token_usage);
    }
}

#[tokio::test]
async fn identifiers_resolve_in_documented_order() {
    let dir = tempfile::tempdir().unwrap();
    let store = ConversationStore::new(dir.path()).unwrap();

    let mut conversation = sample_conversation("Lookup Me");
    store.save(&mut conversation).await.unwrap();
    let filename = format_filename("Lookup Me", &conversation.id);
    let stem = filename.trim_end_matches(".json").to_string();

    // (a) conversation id
    assert_eq!(store.load(&conversation.id).await.unwrap().id, conversation.id);
    // (b) exact filename
    assert_eq!(store.load(&filename).await.unwrap().id, conversation.id);
    // (c) filename with .json appended
    assert_eq!(store.load(&stem).await.unwrap().id, conversation.id);
    // (d) case-insensitive title
    assert_eq!(store.load("lookup me").await.unwrap().id, conversation.id);
    assert_eq!(store.load("LOOKUP ME").await.unwrap().id, conversation.id);
    // (e) numeric index into the last listing (1-based)
    let listing = store.list().await.unwrap();
    assert_eq!(listing.len(), 1);
    assert_eq!(store.load("1").await.unwrap().id, conversation.id);

    let missing = store.load("nope").await;
    assert!(matches!(missing, Err(ref e) if e.kind() == "NotFound"));
}

#[tokio::test]
async fn listing_skips_unparsable_files() {
    let dir = tempfile::tempdir().unwrap();
    let store = ConversationStore::new(dir.path()).unwrap();

    let mut a = sample_conversation("Alpha");
    let mut b = sample_conversation("Beta");
    store.save(&mut a).await.unwrap();
    store.save(&mut b).await.unwrap();
    std::fs::write(dir.path().join("broken.json"), "{ not json").unwrap();
    std::fs::write(dir.path().join("ignored.txt"), "not a conversation").unwrap();

    let listing = store.list().await.unwrap();
    assert_eq!(listing.len(), 2);
    let titles: Vec<&str> = listing.iter().map(|s| s.title.as_str()).collect();
    assert!(titles.contains(&"Alpha"));
    assert!(titles.contains(&"Beta"));
    let alpha = listing.iter().find(|s| s.title == "Alpha").unwrap();
    assert_eq!(alpha.message_count, 3);
    assert_eq!(alpha.model.as_deref(), None);
}

#[tokio::test]
async fn legacy_files_load_and_resave_in_the_new_layout() {
    let dir = tempfile::tempdir().unwrap();
    let store = ConversationStore::new(dir.path()).unwrap();

    let legacy = serde_json::json!({
        "conversation_id": "X",
        "history": [
            {"type": "metadata", "content": {"title": "Old"}},
            {"type": "message", "content": {"role": "user", "text": "A"}},
            {"type": "message", "content": {"role": "ai", "text": "B"}}
        ]
    });
    let legacy_path = dir.path().join("old_X.json");
    std::fs::write(&legacy_path, serde_json::to_string_pretty(&legacy).unwrap()).unwrap();

    // Loading converts in memory and leaves the file untouched.
    let mut loaded = store.load("X").await.unwrap();
    assert_eq!(loaded.title(), "Old");
    assert_eq!(loaded.messages.len(), 3);
    assert!(loaded.messages.values().all(|m| m.branch_id == "main"));
    let on_disk: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&legacy_path).unwrap()).unwrap();
    assert!(Conversation::is_legacy_value(&on_disk));

    // The next save writes the new layout.
    let new_path = store.save(&mut loaded).await.unwrap();
    let rewritten: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&new_path).unwrap()).unwrap();
    assert!(rewritten.get("messages").is_some());
    assert!(!Conversation::is_legacy_value(&rewritten));

    // The listing understands both layouts.
    let listing = store.list().await.unwrap();
    let legacy_row = listing.iter().find(|s| s.filename == "old_X.json").unwrap();
    assert_eq!(legacy_row.title, "Old");
    assert_eq!(legacy_row.message_count, 2);
}

#[tokio::test]
async fn rename_updates_metadata_and_filename() {
    let dir = tempfile::tempdir().unwrap();
    let store = ConversationStore::new(dir.path()).unwrap();

    let mut conversation = sample_conversation("Before");
    store.save(&mut conversation).await.unwrap();
    let old_path = dir.path().join(format_filename("Before", &conversation.id));
    assert!(old_path.exists());

    let renamed = store.rename(&conversation.id, "After Rename").await.unwrap();
    assert_eq!(renamed.title(), "After Rename");
    assert!(!old_path.exists());
    let new_path = dir
        .path()
        .join(format_filename("After Rename", &conversation.id));
    assert!(new_path.exists());

    let loaded = store.load(&conversation.id).await.unwrap();
    assert_eq!(loaded.title(), "After Rename");
}

#[tokio::test]
async fn duplicate_is_isomorphic_under_fresh_ids() {
    let dir = tempfile::tempdir().unwrap();
    let store = ConversationStore::new(dir.path()).unwrap();

    let mut source = sample_conversation("Original");
    store.save(&mut source).await.unwrap();

    let copy = store.duplicate(&source.id, Some("Copied")).await.unwrap();
    copy.check_invariants().unwrap();
    assert_ne!(copy.id, source.id);
    assert_eq!(copy.title(), "Copied");
    assert_eq!(copy.messages.len(), source.messages.len());

    // No id survives the copy.
    for id in copy.messages.keys() {
        assert!(!source.messages.contains_key(id));
    }

    // Same shape: contents pair off 1:1 with identical child counts and the
    // same parent contents.
    let by_content = |c: &Conversation| -> HashMap<String, (usize, Option<String>)> {
        c.messages
            .values()
            .map(|m| {
                let parent_content = m
                    .parent_id
                    .as_ref()
                    .map(|p| c.messages[p].content.clone());
                (m.content.clone(), (m.children.len(), parent_content))
            })
            .collect()
    };
    assert_eq!(by_content(&copy), by_content(&source));

    // The mapped active leaf points at the copy of the source's leaf.
    let source_leaf = &source.messages[source.active_leaf().unwrap()];
    let copy_leaf = &copy.messages[copy.active_leaf().unwrap()];
    assert_eq!(source_leaf.content, copy_leaf.content);

    // The copy round-trips through its own file.
    let reloaded = store.load(&copy.id).await.unwrap();
    assert_eq!(reloaded.messages.len(), source.messages.len());
    assert_eq!(reloaded.title(), "Copied");

    // Default title appends " (Copy)".
    let defaulted = store.duplicate(&source.id, None).await.unwrap();
    assert_eq!(defaulted.title(), "Original (Copy)");
}

#[tokio::test]
async fn delete_removes_the_file() {
    let dir = tempfile::tempdir().unwrap();
    let store = ConversationStore::new(dir.path()).unwrap();

    let mut conversation = sample_conversation("Doomed");
    let path = store.save(&mut conversation).await.unwrap();
    assert!(path.exists());

    store.delete(&conversation.id).await.unwrap();
    assert!(!path.exists());
    let gone = store.load(&conversation.id).await;
    assert!(matches!(gone, Err(ref e) if e.kind() == "NotFound"));
}

#[tokio::test]
async fn unknown_top_level_keys_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let store = ConversationStore::new(dir.path()).unwrap();

    let mut conversation = sample_conversation("Extras");
    store.save(&mut conversation).await.unwrap();
    let path = dir.path().join(format_filename("Extras", &conversation.id));

    // A foreign writer adds a key this version does not know about.
    let mut value: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    value["x_labels"] = serde_json::json!(["starred", "archived"]);
    std::fs::write(&path, serde_json::to_string_pretty(&value).unwrap()).unwrap();

    let mut reloaded = store.load(&conversation.id).await.unwrap();
    store.save(&mut reloaded).await.unwrap();

    let rewritten: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(rewritten["x_labels"], serde_json::json!(["starred", "archived"]));
}

#[tokio::test]
async fn corrupt_graphs_surface_on_explicit_load() {
    let dir = tempfile::tempdir().unwrap();
    let store = ConversationStore::new(dir.path()).unwrap();

    // A message pointing at a parent that does not exist.
    let corrupt = serde_json::json!({
        "conversation_id": "bad",
        "metadata": {"title": "Bad", "active_branch": "main", "active_leaf": "m1"},
        "messages": {
            "m1": {"id": "m1", "role": "user", "content": "A",
                    "timestamp": "2025-01-01T00:00:00Z",
                    "parent_id": "ghost", "branch_id": "main", "children": []}
        },
        "branches": {"main": {"created_at": "2025-01-01T00:00:00Z", "last_message": "m1", "message_count": 1}}
    });
    std::fs::write(
        dir.path().join("bad_bad.json"),
        serde_json::to_string_pretty(&corrupt).unwrap(),
    )
    .unwrap();

    let result = store.load("bad").await;
    assert!(matches!(result, Err(ref e) if e.kind() == "ConversationCorrupt"));

    // ...but the listing only warns and keeps going.
    let listing = store.list().await.unwrap();
    assert_eq!(listing.len(), 1);
}
