//! Shared fixtures: a scripted provider driver and event-collection helpers.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream;
use futures_util::StreamExt;
use tokio::sync::mpsc;

use loomllm::driver::{
    Completion, GenParams, GenerateRequest, ModelInfo, ProviderDriver, ProviderEventStream,
    StreamEvent, TokenUsage,
};
use loomllm::event::Event;
use loomllm::Error;

/// What the scripted driver should do for one generation call.
#[derive(Debug)]
pub enum Behavior {
    /// `generate` returns this completion.
    Reply(Completion),
    /// `generate` / `generate_stream` fails up front.
    Fail(Error),
    /// `generate_stream` yields these events, then ends.
    Stream(Vec<StreamEvent>),
    /// `generate_stream` yields these events, then hangs until cancelled.
    StreamThenHang(Vec<StreamEvent>),
}

/// Driver double that replays scripted behaviors in submission order.
#[derive(Debug)]
pub struct ScriptedDriver {
    behaviors: Mutex<VecDeque<Behavior>>,
}

impl ScriptedDriver {
    pub fn new() -> Arc<Self> {
        Arc::new(ScriptedDriver {
            behaviors: Mutex::new(VecDeque::new()),
        })
    }

    pub fn push(&self, behavior: Behavior) {
        self.behaviors
            .lock()
            .expect("behavior queue poisoned")
            .push_back(behavior);
    }

    fn next_behavior(&self) -> Behavior {
        self.behaviors
            .lock()
            .expect("behavior queue poisoned")
            .pop_front()
            .expect("scripted driver ran out of behaviors")
    }
}

#[async_trait]
impl ProviderDriver for ScriptedDriver {
    fn provider_name(&self) -> &'static str {
        "scripted"
    }

    fn default_model(&self) -> &str {
        "scripted-model"
    }

    async fn initialize(&self) -> Result<(), Error> {
        Ok(())
    }

    async fn list_models(&self) -> Vec<ModelInfo> {
        vec![ModelInfo {
            id: "scripted-model".to_string(),
            display_name: "Scripted Model".to_string(),
            input_limit: Some(32_768),
            output_limit: Some(8_192),
            capabilities: vec!["chat".to_string()],
        }]
    }

    fn default_params(&self) -> GenParams {
        GenParams::default()
    }

    fn validate_model(&self, _model_id: &str) -> bool {
        true
    }

    async fn generate(&self, _request: &GenerateRequest) -> Result<Completion, Error> {
        match self.next_behavior() {
            Behavior::Reply(completion) => Ok(completion),
            Behavior::Fail(err) => Err(err),
            Behavior::Stream(_) | Behavior::StreamThenHang(_) => {
                panic!("non-streaming call got a streaming behavior")
            }
        }
    }

    async fn generate_stream(
        &self,
        _request: &GenerateRequest,
    ) -> Result<ProviderEventStream, Error> {
        match self.next_behavior() {
            Behavior::Stream(events) => Ok(Box::pin(stream::iter(events))),
            Behavior::StreamThenHang(events) => {
                Ok(Box::pin(stream::iter(events).chain(stream::pending())))
            }
            Behavior::Fail(err) => Err(err),
            Behavior::Reply(_) => panic!("streaming call got a non-streaming behavior"),
        }
    }
}

pub fn usage(prompt: usize, completion: usize) -> TokenUsage {
    TokenUsage {
        prompt_tokens: prompt,
        completion_tokens: completion,
        total_tokens: prompt + completion,
        reasoning_tokens: None,
    }
}

/// Drain a worker's event stream until its terminal event (bounded wait).
pub async fn collect_events(mut rx: mpsc::Receiver<Event>) -> Vec<Event> {
    let mut events = Vec::new();
    loop {
        let next = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("worker produced no event within 5s");
        match next {
            Some(event) => {
                let terminal = event.is_terminal();
                events.push(event);
                if terminal {
                    return events;
                }
            }
            None => return events,
        }
    }
}

/// Receive exactly one event (bounded wait).
pub async fn next_event(rx: &mut mpsc::Receiver<Event>) -> Event {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("worker produced no event within 5s")
        .expect("event stream closed unexpectedly")
}
