//! The request orchestrator.
//!
//! Turns a user intent — send, retry, navigate — into background work
//! against a provider, and narrates that work to a single subscriber as an
//! ordered [`Event`] sequence.  One worker runs per intent; per
//! conversation at most one worker is in flight, and submitting a new intent
//! cancels and fully finalises the old worker before the new one emits
//! anything beyond `Started`.
//!
//! Workers move through `Pending → Running → (Streaming)? → Finalising →
//! Done | Errored | Cancelled`.  Cancellation is cooperative: a shared
//! [`CancelHandle`] is polled at every suspension point, already-buffered
//! chunks drain to the subscriber, and any accumulated partial text is kept
//! as a truncated assistant node.  Event delivery uses a bounded channel;
//! a subscriber that stalls past the per-event deadline ends the worker
//! with a `Timeout` error.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::{mpsc, Mutex as AsyncMutex, Notify};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::loomllm::conversation::{Conversation, Message, NavDirection};
use crate::loomllm::driver::{
    Attachment, ChatTurn, GenerateRequest, ProviderDriver, StreamEvent, TokenUsage,
};
use crate::loomllm::error::Error;
use crate::loomllm::event::Event;
use crate::loomllm::session::Session;
use crate::loomllm::store::ConversationStore;

/// Depth of the per-worker event queue; senders feel backpressure past it.
pub const EVENT_QUEUE_CAPACITY: usize = 64;

/// Wall-clock budget for one non-streaming provider call.
const NON_STREAMING_TIMEOUT: Duration = Duration::from_secs(60);

/// How long a single event may wait on a stalled subscriber.
const SUBSCRIBER_TIMEOUT: Duration = Duration::from_secs(90);

/// Cooperative cancellation flag shared between the orchestrator and a
/// worker.  Workers poll it at suspension points and also park on the
/// notifier inside `select!`s around long awaits.
#[derive(Debug, Default)]
pub struct CancelHandle {
    flag: AtomicBool,
    notify: Notify,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    async fn cancelled(&self) {
        loop {
            if self.is_cancelled() {
                return;
            }
            let notified = self.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WorkerState {
    Pending,
    Running,
    Streaming,
    Finalising,
    Done,
    Errored,
    Cancelled,
}

/// How a worker attaches its result to the graph.
#[derive(Debug, Clone)]
enum FinalizeTarget {
    /// Send intent: append a new assistant node under this user turn.
    Append { parent_id: String },
    /// Retry intent: fill the placeholder node `retry` created.
    Complete { node_id: String },
}

struct WorkerContext {
    conversation_id: String,
    conversation: Arc<AsyncMutex<Conversation>>,
    store: Arc<ConversationStore>,
    driver: Arc<dyn ProviderDriver>,
    request: GenerateRequest,
    streaming: bool,
    finalize: FinalizeTarget,
}

struct ActiveWorker {
    worker_id: String,
    cancel: Arc<CancelHandle>,
    handle: JoinHandle<()>,
}

/// Owns the lifetime of background provider calls.
#[derive(Default)]
pub struct Orchestrator {
    workers: AsyncMutex<HashMap<String, ActiveWorker>>,
}

impl Orchestrator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Send a user turn on the session's active conversation (creating one
    /// if none is active) and run a provider call for the reply.
    ///
    /// Returns the subscriber end of the worker's event stream.
    pub async fn send(
        &self,
        session: &mut Session,
        content: &str,
        attachments: Vec<Attachment>,
    ) -> Result<mpsc::Receiver<Event>, Error> {
        let active = session.ensure_active().await?;
        let store = session.store();
        let driver = session.driver();

        // Cancel-replace before touching the graph, so a superseded worker
        // finalises its partial reply below the old leaf first.
        self.cancel_and_wait(&active.id).await;

        let (request, streaming, parent_id);
        {
            let mut conversation = active.conversation.lock().await;
            let user = conversation.add_user(content, attachments)?;
            parent_id = user.id.clone();
            let chain = snapshot_chain(conversation.chain(None)?);
            request = build_request(session, &conversation, chain);
            streaming = conversation
                .metadata
                .streaming_preference
                .unwrap_or(session.use_streaming());
        }

        self.spawn(WorkerContext {
            conversation_id: active.id.clone(),
            conversation: active.conversation.clone(),
            store,
            driver,
            request,
            streaming,
            finalize: FinalizeTarget::Append { parent_id },
        })
        .await
    }

    /// Retry an assistant reply: allocate a fresh branch sibling and re-send
    /// the parent user turn.  No duplicate user node is created.
    pub async fn retry(
        &self,
        session: &mut Session,
        assistant_node_id: &str,
    ) -> Result<mpsc::Receiver<Event>, Error> {
        let active = session
            .active()
            .cloned()
            .ok_or_else(|| Error::NotFound("no active conversation".to_string()))?;
        let store = session.store();
        let driver = session.driver();

        self.cancel_and_wait(&active.id).await;

        let (request, streaming, node_id);
        {
            let mut conversation = active.conversation.lock().await;
            let placeholder = conversation.retry(assistant_node_id)?;
            node_id = placeholder.id.clone();
            let parent_id = placeholder.parent_id.clone().ok_or_else(|| {
                Error::InvariantViolation("retry placeholder has no parent".to_string())
            })?;
            let chain = snapshot_chain(conversation.chain_to(&parent_id)?);
            request = build_request(session, &conversation, chain);
            streaming = conversation
                .metadata
                .streaming_preference
                .unwrap_or(session.use_streaming());
        }

        self.spawn(WorkerContext {
            conversation_id: active.id.clone(),
            conversation: active.conversation.clone(),
            store,
            driver,
            request,
            streaming,
            finalize: FinalizeTarget::Complete { node_id },
        })
        .await
    }

    /// Navigate between sibling replies.  Persists the changed active chain
    /// and returns a synchronous `NavChanged`; no provider call is made.
    pub async fn navigate(
        &self,
        session: &mut Session,
        node_id: &str,
        direction: NavDirection,
    ) -> Result<Event, Error> {
        let active = session
            .active()
            .cloned()
            .ok_or_else(|| Error::NotFound("no active conversation".to_string()))?;
        let store = session.store();

        let mut conversation = active.conversation.lock().await;
        conversation.navigate(node_id, direction)?;
        let event = Event::NavChanged {
            active_leaf: conversation
                .active_leaf()
                .map(str::to_string)
                .unwrap_or_default(),
            active_branch: conversation.active_branch().to_string(),
            history_snapshot: conversation.history(),
        };
        store.save(&mut conversation).await?;
        Ok(event)
    }

    /// Request cancellation of the conversation's in-flight worker, if any.
    ///
    /// Advisory: the worker drains already-buffered chunks, keeps any
    /// partial text, and emits `Cancelled` as its terminal event.
    pub async fn cancel(&self, conversation_id: &str) -> bool {
        let workers = self.workers.lock().await;
        match workers.get(conversation_id) {
            Some(worker) => {
                worker.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel the conversation's in-flight worker and wait for it to
    /// finalise.
    pub async fn cancel_and_wait(&self, conversation_id: &str) -> bool {
        let worker = self.workers.lock().await.remove(conversation_id);
        match worker {
            Some(worker) => {
                worker.cancel.cancel();
                if let Err(err) = worker.handle.await {
                    log::warn!("worker {} join failed: {}", worker.worker_id, err);
                }
                true
            }
            None => false,
        }
    }

    async fn spawn(&self, ctx: WorkerContext) -> Result<mpsc::Receiver<Event>, Error> {
        // At-most-one per conversation: the previous worker is fully
        // finalised before the new one starts.
        self.cancel_and_wait(&ctx.conversation_id).await;

        let conversation_id = ctx.conversation_id.clone();
        let worker_id = Uuid::new_v4().to_string();
        let cancel = Arc::new(CancelHandle::default());
        let (tx, rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);

        let handle = tokio::spawn(run_worker(ctx, worker_id.clone(), tx, cancel.clone()));
        self.workers.lock().await.insert(
            conversation_id,
            ActiveWorker {
                worker_id,
                cancel,
                handle,
            },
        );
        Ok(rx)
    }
}

fn snapshot_chain(chain: Vec<&Message>) -> Vec<ChatTurn> {
    chain
        .iter()
        .map(|m| ChatTurn {
            role: m.role,
            content: m.content.clone(),
            attachments: m.attachments.clone(),
        })
        .collect()
}

fn build_request(
    session: &Session,
    conversation: &Conversation,
    chain: Vec<ChatTurn>,
) -> GenerateRequest {
    let model = if conversation.metadata.model.is_empty() {
        session.model().to_string()
    } else {
        conversation.metadata.model.clone()
    };
    let params = if conversation.metadata.params.is_empty() {
        session.params().clone()
    } else {
        conversation.metadata.params.clone()
    };
    let system_instruction = conversation
        .metadata
        .system_instruction
        .clone()
        .or_else(|| session.system_instruction().map(str::to_string));
    GenerateRequest {
        model,
        chain,
        system_instruction,
        params,
    }
}

enum EmitFailure {
    Closed,
    Timeout,
}

async fn emit(tx: &mpsc::Sender<Event>, event: Event) -> Result<(), EmitFailure> {
    match tokio::time::timeout(SUBSCRIBER_TIMEOUT, tx.send(event)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(_)) => Err(EmitFailure::Closed),
        Err(_) => Err(EmitFailure::Timeout),
    }
}

enum Outcome {
    Done {
        text: String,
        usage: Option<TokenUsage>,
        response_id: Option<String>,
    },
    Failed(Error),
    Cancelled,
}

async fn run_worker(
    ctx: WorkerContext,
    worker_id: String,
    tx: mpsc::Sender<Event>,
    cancel: Arc<CancelHandle>,
) {
    let mut state = WorkerState::Pending;
    let mut transition = |next: WorkerState| {
        log::debug!("worker {}: {:?} -> {:?}", worker_id, state, next);
        state = next;
    };

    transition(WorkerState::Running);
    if emit(
        &tx,
        Event::Started {
            conversation_id: ctx.conversation_id.clone(),
            worker_id: worker_id.clone(),
            model: ctx.request.model.clone(),
        },
    )
    .await
    .is_err()
    {
        log::warn!("worker {}: subscriber gone before start", worker_id);
        return;
    }
    if cancel.is_cancelled() {
        transition(WorkerState::Finalising);
        finalize_cancelled(&ctx, String::new(), &tx).await;
        transition(WorkerState::Cancelled);
        return;
    }

    let mut accumulated = String::new();
    let outcome = if ctx.streaming {
        let opened = tokio::select! {
            opened = ctx.driver.generate_stream(&ctx.request) => opened,
            _ = cancel.cancelled() => Err(Error::Cancelled("cancelled before stream opened".into())),
        };
        match opened {
            Err(Error::Cancelled(_)) => Outcome::Cancelled,
            Err(err) => Outcome::Failed(err),
            Ok(mut stream) => {
                transition(WorkerState::Streaming);
                let mut usage: Option<TokenUsage> = None;
                loop {
                    let item = tokio::select! {
                        item = stream.next() => item,
                        _ = cancel.cancelled() => break Outcome::Cancelled,
                    };
                    match item {
                        // Stream closed without a terminal event: treat the
                        // accumulated text as the reply.
                        None => {
                            break Outcome::Done {
                                text: accumulated.clone(),
                                usage: usage.clone(),
                                response_id: None,
                            }
                        }
                        Some(StreamEvent::Chunk { text }) => {
                            accumulated.push_str(&text);
                            match emit(&tx, Event::Chunk { text }).await {
                                Ok(()) => {}
                                Err(EmitFailure::Closed) => break Outcome::Cancelled,
                                Err(EmitFailure::Timeout) => {
                                    break Outcome::Failed(Error::Timeout(
                                        "subscriber queue stalled".into(),
                                    ))
                                }
                            }
                            if cancel.is_cancelled() {
                                break Outcome::Cancelled;
                            }
                        }
                        Some(StreamEvent::Usage(u)) => {
                            usage = Some(u.clone());
                            if emit(&tx, Event::Usage { usage: u }).await.is_err() {
                                break Outcome::Cancelled;
                            }
                        }
                        Some(StreamEvent::Thinking { name, content }) => {
                            if emit(&tx, Event::ThinkingStep { name, content })
                                .await
                                .is_err()
                            {
                                break Outcome::Cancelled;
                            }
                        }
                        Some(StreamEvent::Done {
                            full_text,
                            usage: done_usage,
                            response_id,
                        }) => {
                            let text = if full_text.is_empty() {
                                accumulated.clone()
                            } else {
                                full_text
                            };
                            break Outcome::Done {
                                text,
                                usage: done_usage.or(usage.clone()),
                                response_id,
                            };
                        }
                        Some(StreamEvent::Error(err)) => break Outcome::Failed(err),
                    }
                }
            }
        }
    } else {
        let result = tokio::select! {
            result = tokio::time::timeout(NON_STREAMING_TIMEOUT, ctx.driver.generate(&ctx.request)) => {
                match result {
                    Ok(inner) => inner,
                    Err(_) => Err(Error::Timeout(format!(
                        "provider call exceeded {}s",
                        NON_STREAMING_TIMEOUT.as_secs()
                    ))),
                }
            }
            _ = cancel.cancelled() => Err(Error::Cancelled("cancelled during provider call".into())),
        };
        match result {
            Ok(completion) => Outcome::Done {
                text: completion.text,
                usage: completion.usage,
                response_id: completion.response_id,
            },
            Err(Error::Cancelled(_)) => Outcome::Cancelled,
            Err(err) => Outcome::Failed(err),
        }
    };

    transition(WorkerState::Finalising);
    match outcome {
        Outcome::Done {
            text,
            usage,
            response_id,
        } => {
            finalize_success(&ctx, text, usage, response_id, &tx).await;
            transition(WorkerState::Done);
        }
        Outcome::Failed(err) => {
            finalize_error(&ctx, accumulated, err, &tx).await;
            transition(WorkerState::Errored);
        }
        Outcome::Cancelled => {
            finalize_cancelled(&ctx, accumulated, &tx).await;
            transition(WorkerState::Cancelled);
        }
    }
}

/// Attach a worker result to the graph and persist.
async fn attach_reply(
    ctx: &WorkerContext,
    content: &str,
    usage: Option<TokenUsage>,
    response_id: Option<String>,
    truncated: bool,
) -> Result<(String, Option<String>), Error> {
    let mut conversation = ctx.conversation.lock().await;
    let (message_id, parent_id) = match &ctx.finalize {
        FinalizeTarget::Append { parent_id } => {
            let (id, parent) = {
                let message = conversation.add_assistant(
                    content,
                    ctx.request.model.clone(),
                    ctx.request.params.clone(),
                    usage,
                    response_id,
                    Some(parent_id.as_str()),
                    None,
                )?;
                (message.id.clone(), message.parent_id.clone())
            };
            if truncated {
                conversation.complete_assistant(
                    &id,
                    content,
                    ctx.request.model.clone(),
                    ctx.request.params.clone(),
                    None,
                    None,
                    true,
                )?;
            }
            (id, parent)
        }
        FinalizeTarget::Complete { node_id } => {
            conversation.complete_assistant(
                node_id,
                content,
                ctx.request.model.clone(),
                ctx.request.params.clone(),
                usage,
                response_id,
                truncated,
            )?;
            let parent = conversation
                .messages
                .get(node_id)
                .and_then(|m| m.parent_id.clone());
            (node_id.clone(), parent)
        }
    };
    ctx.store.save(&mut conversation).await?;
    Ok((message_id, parent_id))
}

async fn finalize_success(
    ctx: &WorkerContext,
    text: String,
    usage: Option<TokenUsage>,
    response_id: Option<String>,
    tx: &mpsc::Sender<Event>,
) {
    match attach_reply(ctx, &text, usage.clone(), response_id.clone(), false).await {
        Ok((message_id, parent_id)) => {
            let _ = emit(
                tx,
                Event::Done {
                    full_text: text,
                    message_id,
                    parent_id,
                    model: ctx.request.model.clone(),
                    token_usage: usage,
                    response_id,
                },
            )
            .await;
        }
        Err(err) => {
            log::error!("finalisation failed for {}: {}", ctx.conversation_id, err);
            let _ = emit(
                tx,
                Event::Error {
                    kind: err.kind().to_string(),
                    message: err.detail().to_string(),
                },
            )
            .await;
        }
    }
}

async fn finalize_error(
    ctx: &WorkerContext,
    partial: String,
    err: Error,
    tx: &mpsc::Sender<Event>,
) {
    // A mid-stream failure keeps the partial text as a truncated node; a
    // failure before any text surfaces as a user-visible error turn.
    let attach = if partial.is_empty() {
        attach_reply(ctx, &err.user_message(), None, None, false).await
    } else {
        attach_reply(ctx, &partial, None, None, true).await
    };
    if let Err(attach_err) = attach {
        log::error!(
            "error finalisation failed for {}: {}",
            ctx.conversation_id,
            attach_err
        );
    }
    let _ = emit(
        tx,
        Event::Error {
            kind: err.kind().to_string(),
            message: err.detail().to_string(),
        },
    )
    .await;
}

async fn finalize_cancelled(ctx: &WorkerContext, partial: String, tx: &mpsc::Sender<Event>) {
    let reason = if partial.is_empty() {
        // Nothing streamed: a send leaves no assistant node behind, but a
        // retry's placeholder still needs persisting.
        if let FinalizeTarget::Complete { .. } = &ctx.finalize {
            if let Err(err) = attach_reply(ctx, "", None, None, true).await {
                log::warn!("cancel finalisation failed: {}", err);
            }
        } else {
            let mut conversation = ctx.conversation.lock().await;
            if let Err(err) = ctx.store.save(&mut conversation).await {
                log::warn!("cancel save failed: {}", err);
            }
        }
        None
    } else {
        if let Err(err) = attach_reply(ctx, &partial, None, None, true).await {
            log::warn!("cancel finalisation failed: {}", err);
        }
        Some(format!("kept {} streamed characters", partial.chars().count()))
    };
    let _ = emit(tx, Event::Cancelled { reason }).await;
}
