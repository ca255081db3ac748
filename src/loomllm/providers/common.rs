//! Shared transport utilities used across provider drivers.
//!
//! The helpers in this module are useful when implementing additional
//! providers: a tuned shared [`reqwest`] client, JSON request helpers with
//! uniform error mapping, an OpenAI-compatible chat-completions codec, and a
//! server-sent-events adapter that turns a streaming HTTP body into the
//! [`StreamEvent`] sequence drivers must produce.
//!
//! The SSE adapter reassembles `data:` lines across chunk boundaries with a
//! leftover buffer, understands the three wire dialects spoken by the bundled
//! drivers (OpenAI-compatible, Gemini, Anthropic), and guarantees the
//! streaming contract: chunks arrive in provider order and exactly one
//! terminal `Done` or `Error` event closes the stream.

use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use futures_util::stream::{Stream, StreamExt};
use lazy_static::lazy_static;
use serde_json::Value;

use crate::loomllm::driver::{
    Completion, NormalizedChain, ProviderEventStream, StreamEvent, TokenUsage,
};
use crate::loomllm::error::Error;

lazy_static! {
    /// Shared HTTP client with persistent connection pooling.
    ///
    /// A single client instance keeps TLS sessions and DNS lookups warm,
    /// which significantly reduces latency when many concurrent requests are
    /// issued to upstream providers.
    static ref SHARED_HTTP_CLIENT: reqwest::Client = {
        reqwest::ClientBuilder::new()
            .pool_idle_timeout(Some(Duration::from_secs(90)))
            .pool_max_idle_per_host(10)
            .tcp_keepalive(Some(Duration::from_secs(60)))
            .timeout(Duration::from_secs(300))
            .connect_timeout(Duration::from_secs(30))
            .build()
            .expect("Failed to build shared HTTP client")
    };
}

/// Borrow the lazily initialised shared [`reqwest::Client`].
pub fn get_shared_http_client() -> &'static reqwest::Client {
    &SHARED_HTTP_CLIENT
}

/// `POST` a JSON body and parse the JSON reply, mapping failures into the
/// [`Error`] taxonomy.
pub async fn post_json(
    url: &str,
    headers: &[(&'static str, String)],
    body: &Value,
) -> Result<Value, Error> {
    let mut request = get_shared_http_client().post(url).json(body);
    for (name, value) in headers {
        request = request.header(*name, value);
    }
    let response = request.send().await.map_err(Error::from)?;
    let status = response.status();
    let text = response.text().await.map_err(Error::from)?;
    if !status.is_success() {
        if log::log_enabled!(log::Level::Error) {
            log::error!("post_json: HTTP {} from {}: {}", status, url, text);
        }
        return Err(Error::from_status(status.as_u16(), &text));
    }
    serde_json::from_str(&text).map_err(|e| Error::Network(format!("malformed reply: {}", e)))
}

/// `GET` a JSON document, mapping failures into the [`Error`] taxonomy.
pub async fn get_json(url: &str, headers: &[(&'static str, String)]) -> Result<Value, Error> {
    let mut request = get_shared_http_client().get(url);
    for (name, value) in headers {
        request = request.header(*name, value);
    }
    let response = request.send().await.map_err(Error::from)?;
    let status = response.status();
    let text = response.text().await.map_err(Error::from)?;
    if !status.is_success() {
        return Err(Error::from_status(status.as_u16(), &text));
    }
    serde_json::from_str(&text).map_err(|e| Error::Network(format!("malformed reply: {}", e)))
}

// ── OpenAI-compatible chat-completions codec ─────────────────────────────

/// Build an OpenAI-compatible `chat/completions` request body.
///
/// The normalized system text is reinserted as a leading `system` message;
/// `wire_params` carries the driver's already-translated parameter map.
pub fn chat_body(
    model: &str,
    normalized: &NormalizedChain,
    wire_params: &serde_json::Map<String, Value>,
    stream: bool,
) -> Value {
    let mut messages: Vec<Value> = Vec::with_capacity(normalized.turns.len() + 1);
    if let Some(system) = &normalized.system {
        messages.push(serde_json::json!({"role": "system", "content": system}));
    }
    for turn in &normalized.turns {
        messages.push(serde_json::json!({
            "role": turn.role.as_str(),
            "content": turn.content,
        }));
    }

    let mut body = serde_json::Map::new();
    body.insert("model".to_string(), Value::String(model.to_string()));
    body.insert("messages".to_string(), Value::Array(messages));
    for (key, value) in wire_params {
        body.insert(key.clone(), value.clone());
    }
    if stream {
        body.insert("stream".to_string(), Value::Bool(true));
        // Ask for the final usage-bearing chunk where the API supports it.
        body.insert(
            "stream_options".to_string(),
            serde_json::json!({"include_usage": true}),
        );
    }
    Value::Object(body)
}

/// Parse a non-streaming `chat/completions` reply into a [`Completion`].
pub fn parse_chat_completion(value: &Value) -> Result<Completion, Error> {
    let text = value
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str())
        .ok_or_else(|| Error::Network("no choices in chat completion".to_string()))?
        .to_string();
    let usage = value.get("usage").and_then(parse_openai_usage);
    let response_id = value
        .get("id")
        .and_then(|v| v.as_str())
        .map(str::to_string);
    Ok(Completion {
        text,
        usage,
        response_id,
    })
}

fn parse_openai_usage(usage: &Value) -> Option<TokenUsage> {
    if usage.is_null() {
        return None;
    }
    let prompt = usage.get("prompt_tokens").and_then(Value::as_u64)? as usize;
    let completion = usage
        .get("completion_tokens")
        .and_then(Value::as_u64)
        .unwrap_or(0) as usize;
    let total = usage
        .get("total_tokens")
        .and_then(Value::as_u64)
        .unwrap_or((prompt + completion) as u64) as usize;
    let reasoning = usage
        .get("completion_tokens_details")
        .and_then(|d| d.get("reasoning_tokens"))
        .and_then(Value::as_u64)
        .map(|n| n as usize);
    Some(TokenUsage {
        prompt_tokens: prompt,
        completion_tokens: completion,
        total_tokens: total,
        reasoning_tokens: reasoning,
    })
}

// ── Server-sent events ───────────────────────────────────────────────────

/// Reassembles SSE `data:` payloads from raw body chunks.
///
/// Chunk boundaries rarely align with line boundaries, so the trailing
/// incomplete line is buffered until the next chunk arrives.  `event:` lines
/// and comments are skipped; all bundled dialects carry their discriminator
/// inside the JSON payload.
#[derive(Debug, Default)]
pub struct SseLineBuffer {
    leftover: String,
}

impl SseLineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one body chunk, returning every completed `data:` payload.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.leftover.push_str(&String::from_utf8_lossy(chunk));
        let mut payloads = Vec::new();
        while let Some(newline) = self.leftover.find('\n') {
            let line: String = self.leftover.drain(..=newline).collect();
            let line = line.trim();
            if let Some(data) = line.strip_prefix("data:") {
                let data = data.trim();
                if !data.is_empty() {
                    payloads.push(data.to_string());
                }
            }
        }
        payloads
    }
}

/// Which SSE payload shape the upstream endpoint speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireDialect {
    /// `chat/completions` deltas with a `[DONE]` sentinel (OpenAI, DeepSeek).
    OpenAiCompatible,
    /// `streamGenerateContent?alt=sse` candidates (Gemini).
    Gemini,
    /// Typed `message_start`/`content_block_delta`/… events (Anthropic).
    Anthropic,
}

#[derive(Debug, Default)]
struct StreamState {
    accumulated: String,
    response_id: Option<String>,
    usage: Option<TokenUsage>,
    prompt_tokens: Option<usize>,
    completion_tokens: Option<usize>,
    reasoning_tokens: Option<usize>,
    terminal_queued: bool,
}

impl StreamState {
    fn effective_usage(&self) -> Option<TokenUsage> {
        if let Some(usage) = &self.usage {
            return Some(usage.clone());
        }
        match (self.prompt_tokens, self.completion_tokens) {
            (None, None) => None,
            (prompt, completion) => {
                let prompt = prompt.unwrap_or(0);
                let completion = completion.unwrap_or(0);
                Some(TokenUsage {
                    prompt_tokens: prompt,
                    completion_tokens: completion,
                    total_tokens: prompt + completion,
                    reasoning_tokens: self.reasoning_tokens,
                })
            }
        }
    }

    fn queue_done(&mut self, events: &mut VecDeque<StreamEvent>) {
        if self.terminal_queued {
            return;
        }
        self.terminal_queued = true;
        events.push_back(StreamEvent::Done {
            full_text: self.accumulated.clone(),
            usage: self.effective_usage(),
            response_id: self.response_id.clone(),
        });
    }

    fn queue_error(&mut self, error: Error, events: &mut VecDeque<StreamEvent>) {
        if self.terminal_queued {
            return;
        }
        self.terminal_queued = true;
        events.push_back(StreamEvent::Error(error));
    }
}

type BodyStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>, reqwest::Error>> + Send>>;

/// Adapter turning a streaming HTTP body into driver [`StreamEvent`]s.
pub struct SseEventStream {
    body: BodyStream,
    dialect: WireDialect,
    buffer: SseLineBuffer,
    pending: VecDeque<StreamEvent>,
    state: StreamState,
    closed: bool,
}

impl SseEventStream {
    fn new(body: BodyStream, dialect: WireDialect) -> Self {
        Self {
            body,
            dialect,
            buffer: SseLineBuffer::new(),
            pending: VecDeque::new(),
            state: StreamState::default(),
            closed: false,
        }
    }

    fn parse_data(&mut self, data: &str) {
        if self.state.terminal_queued {
            return;
        }
        match self.dialect {
            WireDialect::OpenAiCompatible => {
                parse_openai_data(data, &mut self.state, &mut self.pending)
            }
            WireDialect::Gemini => parse_gemini_data(data, &mut self.state, &mut self.pending),
            WireDialect::Anthropic => {
                parse_anthropic_data(data, &mut self.state, &mut self.pending)
            }
        }
    }
}

impl Stream for SseEventStream {
    type Item = StreamEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<StreamEvent>> {
        let this = self.get_mut();
        loop {
            if let Some(event) = this.pending.pop_front() {
                return Poll::Ready(Some(event));
            }
            if this.closed {
                return Poll::Ready(None);
            }
            match this.body.as_mut().poll_next(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(None) => {
                    this.closed = true;
                    // Gemini (and a prematurely closed compatible stream)
                    // terminates by ending the body rather than a sentinel.
                    this.state.queue_done(&mut this.pending);
                }
                Poll::Ready(Some(Err(err))) => {
                    this.closed = true;
                    this.state.queue_error(Error::from(err), &mut this.pending);
                }
                Poll::Ready(Some(Ok(chunk))) => {
                    for data in this.buffer.push(&chunk) {
                        this.parse_data(&data);
                        if this.state.terminal_queued {
                            this.closed = true;
                            break;
                        }
                    }
                }
            }
        }
    }
}

fn malformed(data: &str) {
    if log::log_enabled!(log::Level::Debug) {
        let preview: String = data.chars().take(100).collect();
        log::debug!("Malformed SSE chunk: {}", preview);
    }
}

fn parse_openai_data(data: &str, state: &mut StreamState, events: &mut VecDeque<StreamEvent>) {
    if data == "[DONE]" {
        state.queue_done(events);
        return;
    }
    let value: Value = match serde_json::from_str(data) {
        Ok(value) => value,
        Err(_) => {
            malformed(data);
            return;
        }
    };
    if state.response_id.is_none() {
        state.response_id = value
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_string);
    }
    if let Some(usage) = value.get("usage").and_then(parse_openai_usage) {
        state.usage = Some(usage.clone());
        events.push_back(StreamEvent::Usage(usage));
    }
    let delta = value
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("delta"));
    if let Some(delta) = delta {
        // DeepSeek's reasoner surfaces intermediate reasoning here.
        if let Some(text) = delta.get("reasoning_content").and_then(Value::as_str) {
            if !text.is_empty() {
                events.push_back(StreamEvent::Thinking {
                    name: "reasoning".to_string(),
                    content: text.to_string(),
                });
            }
        }
        if let Some(text) = delta.get("content").and_then(Value::as_str) {
            if !text.is_empty() {
                state.accumulated.push_str(text);
                events.push_back(StreamEvent::Chunk {
                    text: text.to_string(),
                });
            }
        }
    }
}

fn parse_gemini_data(data: &str, state: &mut StreamState, events: &mut VecDeque<StreamEvent>) {
    let value: Value = match serde_json::from_str(data) {
        Ok(value) => value,
        Err(_) => {
            malformed(data);
            return;
        }
    };
    if state.response_id.is_none() {
        state.response_id = value
            .get("responseId")
            .and_then(Value::as_str)
            .map(str::to_string);
    }
    if let Some(meta) = value.get("usageMetadata") {
        if let Some(prompt) = meta.get("promptTokenCount").and_then(Value::as_u64) {
            state.prompt_tokens = Some(prompt as usize);
        }
        if let Some(completion) = meta.get("candidatesTokenCount").and_then(Value::as_u64) {
            state.completion_tokens = Some(completion as usize);
        }
        if let Some(thoughts) = meta.get("thoughtsTokenCount").and_then(Value::as_u64) {
            state.reasoning_tokens = Some(thoughts as usize);
        }
    }
    let parts = value
        .get("candidates")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("content"))
        .and_then(|c| c.get("parts"))
        .and_then(Value::as_array);
    if let Some(parts) = parts {
        for part in parts {
            if let Some(text) = part.get("text").and_then(Value::as_str) {
                if !text.is_empty() {
                    state.accumulated.push_str(text);
                    events.push_back(StreamEvent::Chunk {
                        text: text.to_string(),
                    });
                }
            }
        }
    }
}

fn parse_anthropic_data(data: &str, state: &mut StreamState, events: &mut VecDeque<StreamEvent>) {
    let value: Value = match serde_json::from_str(data) {
        Ok(value) => value,
        Err(_) => {
            malformed(data);
            return;
        }
    };
    match value.get("type").and_then(Value::as_str) {
        Some("message_start") => {
            let message = value.get("message");
            state.response_id = message
                .and_then(|m| m.get("id"))
                .and_then(Value::as_str)
                .map(str::to_string);
            if let Some(input) = message
                .and_then(|m| m.get("usage"))
                .and_then(|u| u.get("input_tokens"))
                .and_then(Value::as_u64)
            {
                state.prompt_tokens = Some(input as usize);
            }
        }
        Some("content_block_delta") => {
            let delta = value.get("delta");
            match delta.and_then(|d| d.get("type")).and_then(Value::as_str) {
                Some("text_delta") => {
                    if let Some(text) = delta.and_then(|d| d.get("text")).and_then(Value::as_str) {
                        if !text.is_empty() {
                            state.accumulated.push_str(text);
                            events.push_back(StreamEvent::Chunk {
                                text: text.to_string(),
                            });
                        }
                    }
                }
                Some("thinking_delta") => {
                    if let Some(text) =
                        delta.and_then(|d| d.get("thinking")).and_then(Value::as_str)
                    {
                        if !text.is_empty() {
                            events.push_back(StreamEvent::Thinking {
                                name: "thinking".to_string(),
                                content: text.to_string(),
                            });
                        }
                    }
                }
                _ => {}
            }
        }
        Some("message_delta") => {
            if let Some(output) = value
                .get("usage")
                .and_then(|u| u.get("output_tokens"))
                .and_then(Value::as_u64)
            {
                state.completion_tokens = Some(output as usize);
            }
        }
        Some("message_stop") => {
            if let Some(usage) = state.effective_usage() {
                events.push_back(StreamEvent::Usage(usage));
            }
            state.queue_done(events);
        }
        Some("error") => {
            let message = value
                .get("error")
                .and_then(|e| e.get("message"))
                .and_then(Value::as_str)
                .unwrap_or("provider stream error")
                .to_string();
            state.queue_error(Error::ServerError(message), events);
        }
        // ping, content_block_start, content_block_stop
        _ => {}
    }
}

/// Open a streaming request and adapt its body into a driver event stream.
pub async fn open_sse(
    url: &str,
    headers: &[(&'static str, String)],
    body: &Value,
    dialect: WireDialect,
) -> Result<ProviderEventStream, Error> {
    let mut request = get_shared_http_client()
        .post(url)
        .header("Accept", "text/event-stream")
        .json(body);
    for (name, value) in headers {
        request = request.header(*name, value);
    }
    let response = request.send().await.map_err(Error::from)?;
    let status = response.status();
    if !status.is_success() {
        let text = response.text().await.unwrap_or_default();
        if log::log_enabled!(log::Level::Error) {
            log::error!("open_sse: HTTP {} from {}: {}", status, url, text);
        }
        return Err(Error::from_status(status.as_u16(), &text));
    }
    let body_stream: BodyStream =
        Box::pin(response.bytes_stream().map(|result| result.map(|b| b.to_vec())));
    Ok(Box::pin(SseEventStream::new(body_stream, dialect)))
}
