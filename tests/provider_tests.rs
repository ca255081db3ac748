//! Driver-layer tests: normalization, parameter translation, the registry,
//! and the shared wire codec.

use loomllm::driver::{
    flatten_attachments, normalize_chain, Attachment, ChatTurn, ProviderDriver, Role,
};
use loomllm::event::Event;
use loomllm::providers::common::{chat_body, parse_chat_completion, SseLineBuffer};
use loomllm::providers::{self, DriverOverrides};

fn turn(role: Role, content: &str) -> ChatTurn {
    ChatTurn::new(role, content)
}

#[test]
fn attachments_inline_under_the_stable_delimiter() {
    let attachments = vec![
        Attachment {
            file_name: "notes.txt".to_string(),
            mime_type: "text/plain".to_string(),
            content: "remember the milk".to_string(),
            token_count: 4,
        },
        Attachment {
            file_name: "todo.md".to_string(),
            mime_type: "text/markdown".to_string(),
            content: "- ship it".to_string(),
            token_count: 3,
        },
    ];
    let combined = flatten_attachments("Please summarise.", &attachments);
    assert!(combined.starts_with("Please summarise."));
    assert!(combined.contains("\n\n# ATTACHED FILES\n"));
    assert!(combined.contains("\n### FILE: notes.txt\nremember the milk\n"));
    assert!(combined.contains("\n### FILE: todo.md\n- ship it\n"));
    // Attachment order is preserved.
    let first = combined.find("notes.txt").unwrap();
    let second = combined.find("todo.md").unwrap();
    assert!(first < second);

    // Deterministic given the same inputs.
    assert_eq!(combined, flatten_attachments("Please summarise.", &attachments));
}

#[test]
fn normalization_lifts_system_and_drops_empty_turns() {
    let chain = vec![
        turn(Role::System, "Be helpful."),
        turn(Role::User, "Hi"),
        turn(Role::Assistant, ""),
        turn(Role::User, "Still there?"),
    ];
    let normalized = normalize_chain(&chain, None);
    assert_eq!(normalized.system.as_deref(), Some("Be helpful."));
    assert_eq!(normalized.turns.len(), 2);
    assert!(normalized.turns.iter().all(|t| t.role == Role::User));
}

#[test]
fn metadata_system_instruction_overrides_the_root() {
    let chain = vec![turn(Role::System, "Root text."), turn(Role::User, "Hi")];
    let normalized = normalize_chain(&chain, Some("Override wins."));
    assert_eq!(normalized.system.as_deref(), Some("Override wins."));
}

#[test]
fn attachments_ride_along_inside_the_owning_turn() {
    let chain = vec![ChatTurn::new(Role::User, "See attached.").with_attachments(vec![
        Attachment {
            file_name: "a.txt".to_string(),
            mime_type: "text/plain".to_string(),
            content: "alpha".to_string(),
            token_count: 1,
        },
    ])];
    let normalized = normalize_chain(&chain, None);
    assert!(normalized.turns[0].content.contains("### FILE: a.txt"));
}

#[test]
fn registry_builds_every_known_provider_and_alias() {
    for (name, expected) in [
        ("openai", "openai"),
        ("deepseek", "deepseek"),
        ("gemini", "gemini"),
        ("google", "gemini"),
        ("anthropic", "anthropic"),
        ("claude", "anthropic"),
        ("  OpenAI  ", "openai"),
    ] {
        let driver = providers::create(name, "key", None).unwrap();
        assert_eq!(driver.provider_name(), expected, "for input {:?}", name);
    }

    let err = providers::create("skynet", "key", None).unwrap_err();
    assert_eq!(err.kind(), "ConfigInvalid");
}

#[test]
fn registry_overrides_pick_the_model() {
    let driver = providers::create(
        "anthropic",
        "key",
        Some(DriverOverrides {
            base_url: None,
            model: Some("claude-3-5-haiku-latest".to_string()),
        }),
    )
    .unwrap();
    assert_eq!(driver.default_model(), "claude-3-5-haiku-latest");
}

#[test]
fn drivers_validate_their_own_model_families() {
    let openai = providers::create("openai", "key", None).unwrap();
    assert!(openai.validate_model("gpt-4o"));
    assert!(openai.validate_model("o3-mini"));
    assert!(!openai.validate_model("claude-sonnet-4-0"));

    let gemini = providers::create("gemini", "key", None).unwrap();
    assert!(gemini.validate_model("models/gemini-2.0-flash"));
    assert!(!gemini.validate_model("deepseek-chat"));

    let anthropic = providers::create("anthropic", "key", None).unwrap();
    assert!(anthropic.validate_model("claude-opus-4-1"));
    assert!(!anthropic.validate_model("gpt-4o"));

    let deepseek = providers::create("deepseek", "key", None).unwrap();
    assert!(deepseek.validate_model("deepseek-reasoner"));
    assert!(!deepseek.validate_model("gemini-2.0-flash"));
}

#[test]
fn driver_defaults_look_like_their_provider() {
    let gemini = providers::create("gemini", "key", None).unwrap();
    let defaults = gemini.default_params();
    assert_eq!(defaults.temperature, Some(0.7));
    assert_eq!(defaults.top_k, Some(40));

    let deepseek = providers::create("deepseek", "key", None).unwrap();
    assert_eq!(deepseek.default_params().top_p, Some(1.0));
}

#[test]
fn chat_body_reinserts_system_and_flags_streaming() {
    let chain = vec![turn(Role::System, "Sys."), turn(Role::User, "Hi")];
    let normalized = normalize_chain(&chain, None);
    let params = serde_json::Map::new();

    let body = chat_body("gpt-4o-mini", &normalized, &params, true);
    let messages = body["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0]["role"], "system");
    assert_eq!(messages[0]["content"], "Sys.");
    assert_eq!(messages[1]["role"], "user");
    assert_eq!(body["stream"], true);
    assert_eq!(body["stream_options"]["include_usage"], true);

    let blocking = chat_body("gpt-4o-mini", &normalized, &params, false);
    assert!(blocking.get("stream").is_none());
}

#[test]
fn chat_completions_parse_into_uniform_shapes() {
    let reply = serde_json::json!({
        "id": "chatcmpl-9",
        "choices": [{"message": {"role": "assistant", "content": "Hello!"}}],
        "usage": {
            "prompt_tokens": 5,
            "completion_tokens": 2,
            "total_tokens": 7,
            "completion_tokens_details": {"reasoning_tokens": 1}
        }
    });
    let completion = parse_chat_completion(&reply).unwrap();
    assert_eq!(completion.text, "Hello!");
    assert_eq!(completion.response_id.as_deref(), Some("chatcmpl-9"));
    let usage = completion.usage.unwrap();
    assert_eq!(usage.prompt_tokens, 5);
    assert_eq!(usage.completion_tokens, 2);
    assert_eq!(usage.total_tokens, 7);
    assert_eq!(usage.reasoning_tokens, Some(1));

    let empty = serde_json::json!({"choices": []});
    assert!(parse_chat_completion(&empty).is_err());
}

#[test]
fn sse_buffer_handles_arbitrary_chunk_boundaries() {
    let mut buffer = SseLineBuffer::new();
    let frames = [
        "data: {\"choices\":[{\"del",
        "ta\":{\"content\":\"Hel\"}}]}\n\nda",
        "ta: [DONE]\n\n",
    ];
    let mut payloads = Vec::new();
    for frame in frames {
        payloads.extend(buffer.push(frame.as_bytes()));
    }
    assert_eq!(payloads.len(), 2);
    assert!(payloads[0].contains("\"Hel\""));
    assert_eq!(payloads[1], "[DONE]");
}

#[test]
fn events_encode_to_sse_frames() {
    let done = Event::Done {
        full_text: "Hello there".to_string(),
        message_id: "m1".to_string(),
        parent_id: Some("u1".to_string()),
        model: "test-model".to_string(),
        token_usage: None,
        response_id: None,
    };
    let frame = done.to_sse();
    assert!(frame.starts_with("data: {"));
    assert!(frame.ends_with("\n\n"));
    assert!(frame.contains("\"event\":\"done\""));
    assert!(frame.contains("\"full_text\":\"Hello there\""));

    // Round-trips through the wire encoding.
    let json = frame.trim_start_matches("data: ").trim();
    let decoded: Event = serde_json::from_str(json).unwrap();
    assert!(matches!(decoded, Event::Done { ref full_text, .. } if full_text == "Hello there"));
}
