//! Chat session: request lifecycle for one conversation.
//!
//! [`ChatSession`] owns at most one in-flight turn. A turn appends the user
//! message and an assistant placeholder, sends the request on one of three
//! paths (event stream, JSON, multipart upload), and always ends by handing
//! the placeholder back to the [`MessageReconciler`] in a final state:
//!
//! - completed: the full answer, with tools and duration attached;
//! - cancelled or broken mid-stream: whatever text had arrived;
//! - cancelled before any text: the placeholder is removed;
//! - failed before any text: an error-flagged message.
//!
//! Errors never escape the session; callers observe the message list and
//! the [`TurnStatus`] watch channel.

pub mod fallback;
pub mod reconciler;

pub use fallback::Fallback;
pub use reconciler::{MessageReconciler, MessagesChangeFn};

use std::ops::ControlFlow;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use bon::bon;
use futures::StreamExt;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ChatConfig;
use crate::error::{ChatError, ErrorCategory};
use crate::playback::{
    FrameClock, IntervalClock, PlaybackScheduler, RevealSink, RevealTick, StreamState,
};
use crate::sse::SseDecoder;
use crate::transport::{ByteStream, ChatTransport, HttpChatTransport};
use crate::types::{
    Attachment, ChatMessage, ChatRequest, ResponseFormat, SessionIdentity, Settings,
    StreamEvent, StreamEventType,
};
use crate::util::with_timeout;

/// Observable state of the session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TurnStatus {
    pub is_loading: bool,
    /// Tool the server is currently running, between `tool_start` and `tool_end`.
    pub active_tool: Option<String>,
    pub last_outcome: Option<TurnOutcome>,
}

/// How a turn ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnOutcome {
    /// The full answer was revealed and stored.
    Completed,
    /// The stream carried no tokens but a JSON body had the answer.
    Recovered,
    /// The server answered with nothing; the placeholder text was stored.
    Empty,
    /// Cancelled or broken part-way; the partial answer was kept.
    Truncated { reason: ErrorCategory },
    /// Cancelled before any text arrived; the placeholder was removed.
    Discarded,
    /// Failed before any text arrived; an error message was stored.
    Failed { category: ErrorCategory, message: String },
}

struct ActiveTurn {
    id: u64,
    cancel: CancellationToken,
}

/// State shared between the session handle and its turn tasks.
struct Core {
    transport: Arc<dyn ChatTransport>,
    config: ChatConfig,
    clock: Arc<dyn FrameClock>,
    reconciler: MessageReconciler,
    status: watch::Sender<TurnStatus>,
    active: Mutex<Option<ActiveTurn>>,
}

struct SessionInner {
    core: Arc<Core>,
    identity: SessionIdentity,
    settings: RwLock<Settings>,
    next_turn: AtomicU64,
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        if let Some(turn) = self.core.lock_active().take() {
            debug!(turn = turn.id, "Session dropped; cancelling in-flight turn");
            turn.cancel.cancel();
        }
    }
}

/// One conversation's streaming chat pipeline.
///
/// Cloning yields another handle to the same session. When the last handle
/// is dropped, an in-flight turn is cancelled.
///
/// # Example
///
/// ```ignore
/// let session = ChatSession::builder()
///     .transport(Arc::new(HttpChatTransport::new(config.clone())?))
///     .identity(SessionIdentity::new("user-1", "session-1"))
///     .config(config)
///     .build()?;
/// session.send_message("Hello", Vec::new());
/// session.wait_for_idle().await;
/// ```
#[derive(Clone)]
pub struct ChatSession {
    inner: Arc<SessionInner>,
}

#[bon]
impl ChatSession {
    #[builder]
    pub fn new(
        transport: Arc<dyn ChatTransport>,
        identity: SessionIdentity,
        #[builder(default)] config: ChatConfig,
        #[builder(default)] settings: Settings,
        // Messages restored by the surrounding store.
        #[builder(default)]
        history: Vec<ChatMessage>,
        clock: Option<Arc<dyn FrameClock>>,
        on_messages_change: Option<MessagesChangeFn>,
    ) -> Result<Self, ChatError> {
        config.validate()?;
        let clock = clock.unwrap_or_else(|| {
            Arc::new(IntervalClock::new(config.frame_interval())) as Arc<dyn FrameClock>
        });
        let (status, _) = watch::channel(TurnStatus::default());
        let core = Core {
            transport,
            config,
            clock,
            reconciler: MessageReconciler::new(history, on_messages_change),
            status,
            active: Mutex::new(None),
        };
        Ok(Self {
            inner: Arc::new(SessionInner {
                core: Arc::new(core),
                identity,
                settings: RwLock::new(settings),
                next_turn: AtomicU64::new(1),
            }),
        })
    }
}

impl ChatSession {
    /// Session over HTTP using `config`.
    pub fn connect(config: ChatConfig, identity: SessionIdentity) -> Result<Self, ChatError> {
        let transport = HttpChatTransport::new(config.clone())?;
        Self::builder()
            .transport(Arc::new(transport))
            .identity(identity)
            .config(config)
            .build()
    }

    pub fn identity(&self) -> &SessionIdentity {
        &self.inner.identity
    }

    pub fn messages(&self) -> Vec<ChatMessage> {
        self.inner.core.reconciler.messages()
    }

    pub fn status(&self) -> TurnStatus {
        self.inner.core.status.borrow().clone()
    }

    /// Subscribe to status changes via a [`watch::Receiver`].
    pub fn watch_status(&self) -> watch::Receiver<TurnStatus> {
        self.inner.core.status.subscribe()
    }

    pub fn is_loading(&self) -> bool {
        self.inner.core.status.borrow().is_loading
    }

    pub fn active_tool(&self) -> Option<String> {
        self.inner.core.status.borrow().active_tool.clone()
    }

    pub fn settings(&self) -> Settings {
        self.inner
            .settings
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Replace the settings used by the next send.
    pub fn set_settings(&self, settings: Settings) {
        *self
            .inner
            .settings
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = settings;
    }

    /// Start a turn. Returns `false` (and does nothing) if a turn is already
    /// in flight or there is nothing to send.
    pub fn send_message(&self, text: impl Into<String>, attachments: Vec<Attachment>) -> bool {
        let text = text.into();
        if text.trim().is_empty() && attachments.is_empty() {
            debug!("Ignoring empty message");
            return false;
        }

        let core = &self.inner.core;
        let mut active = core.lock_active();
        if active.is_some() {
            debug!(session_id = %self.inner.identity.session_id, "Turn already in flight; ignoring send");
            return false;
        }

        let turn = self.inner.next_turn.fetch_add(1, Ordering::Relaxed);
        let started_at = Instant::now();
        let cancel = CancellationToken::new();
        let request = ChatRequest::new(text.as_str(), &self.inner.identity, &self.settings());

        *active = Some(ActiveTurn {
            id: turn,
            cancel: cancel.clone(),
        });
        core.status.send_modify(|s| {
            s.is_loading = true;
            s.active_tool = None;
        });
        // The store callback runs inside `begin_turn` and may call back in.
        drop(active);
        core.reconciler.begin_turn(&text);

        info!(
            session_id = %self.inner.identity.session_id,
            turn,
            format = %request.response_format,
            attachments = attachments.len(),
            "Starting chat turn"
        );

        let core = core.clone();
        tokio::spawn(async move {
            core.run_turn(turn, request, attachments, cancel, started_at)
                .await;
        });
        true
    }

    /// Cancel the in-flight turn. Returns `false` if there is none.
    pub fn stop_generation(&self) -> bool {
        match self.inner.core.lock_active().as_ref() {
            Some(turn) => {
                debug!(turn = turn.id, "Stopping generation");
                turn.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Remove the last user/assistant pair and send the same text again.
    pub fn retry_last_message(&self) -> bool {
        if self.is_loading() {
            return false;
        }
        match self.inner.core.reconciler.remove_last_turn() {
            Some(text) => self.send_message(text, Vec::new()),
            None => false,
        }
    }

    /// Wait until no turn is in flight.
    pub async fn wait_for_idle(&self) {
        let mut rx = self.inner.core.status.subscribe();
        let _ = rx.wait_for(|s| !s.is_loading).await;
    }
}

/// Largest raw body kept for the empty-stream fallback.
const MAX_FALLBACK_BODY: usize = 64 * 1024;

/// Per-turn bookkeeping for the event-stream path.
#[derive(Default)]
struct StreamReader {
    decoder: SseDecoder,
    /// Raw body, kept only until the first token arrives and while it fits
    /// in `MAX_FALLBACK_BODY`.
    raw_body: Vec<u8>,
    raw_overflowed: bool,
    saw_token: bool,
    done_payload: Option<String>,
}

impl StreamReader {
    fn push(&mut self, chunk: &[u8]) -> Vec<StreamEvent> {
        if !self.saw_token && !self.raw_overflowed {
            if self.raw_body.len() + chunk.len() > MAX_FALLBACK_BODY {
                debug!(limit = MAX_FALLBACK_BODY, "Body too large for the JSON fallback; dropping it");
                self.raw_overflowed = true;
                self.raw_body = Vec::new();
            } else {
                self.raw_body.extend_from_slice(chunk);
            }
        }
        self.decoder.push(chunk)
    }

    fn saw_token(&mut self) {
        if !self.saw_token {
            self.saw_token = true;
            self.raw_body = Vec::new();
        }
    }
}

impl Core {
    fn lock_active(&self) -> MutexGuard<'_, Option<ActiveTurn>> {
        self.active
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn run_turn(
        self: Arc<Self>,
        turn: u64,
        request: ChatRequest,
        attachments: Vec<Attachment>,
        cancel: CancellationToken,
        started_at: Instant,
    ) {
        let outcome = if !attachments.is_empty() {
            self.run_unary(&request, Some(&attachments), &cancel, started_at)
                .await
        } else if request.response_format == ResponseFormat::Json {
            self.run_unary(&request, None, &cancel, started_at).await
        } else {
            self.run_streaming(&request, &cancel, started_at).await
        };

        debug!(turn, ?outcome, elapsed_ms = started_at.elapsed().as_millis() as u64, "Turn finished");

        let mut active = self.lock_active();
        if active.as_ref().is_some_and(|a| a.id == turn) {
            *active = None;
        }
        self.status.send_modify(|s| {
            s.is_loading = false;
            s.active_tool = None;
            s.last_outcome = Some(outcome);
        });
    }

    async fn run_unary(
        &self,
        request: &ChatRequest,
        attachments: Option<&[Attachment]>,
        cancel: &CancellationToken,
        started_at: Instant,
    ) -> TurnOutcome {
        let call = async {
            match attachments {
                Some(files) => self.transport.upload(request, files).await,
                None => self.transport.complete(request).await,
            }
        };
        let result = tokio::select! {
            _ = cancel.cancelled() => Err(ChatError::Cancelled),
            result = with_timeout(self.config.response_timeout(), call) => result,
        };
        let elapsed = started_at.elapsed();

        match result {
            Ok(reply) => match (reply.content.filter(|c| !c.is_empty()), reply.error) {
                (Some(content), _) => {
                    self.reconciler.finalize(&content, &[], elapsed);
                    TurnOutcome::Completed
                }
                (None, Some(error)) => self.fail(ChatError::Validation(error), elapsed),
                (None, None) => {
                    self.reconciler
                        .finalize(&self.config.no_response_text, &[], elapsed);
                    TurnOutcome::Empty
                }
            },
            Err(ChatError::Cancelled) => {
                debug!("Request cancelled before a reply arrived");
                self.reconciler.discard();
                TurnOutcome::Discarded
            }
            Err(e) => {
                warn!(error = %e, "Chat request failed");
                self.fail(e, elapsed)
            }
        }
    }

    async fn run_streaming(
        &self,
        request: &ChatRequest,
        cancel: &CancellationToken,
        started_at: Instant,
    ) -> TurnOutcome {
        let reconciler = self.reconciler.clone();
        let sink: RevealSink = Arc::new(move |tick: RevealTick| reconciler.apply_reveal(&tick));
        let scheduler = PlaybackScheduler::new(
            StreamState::started_at(started_at),
            self.config.frames_target,
            self.clock.clone(),
            sink,
        );

        let opened = tokio::select! {
            _ = cancel.cancelled() => Err(ChatError::Cancelled),
            result = with_timeout(self.config.connect_timeout(), self.transport.open_stream(request)) => result,
        };
        let stream = match opened {
            Ok(stream) => stream,
            Err(ChatError::Cancelled) => {
                debug!("Cancelled before the stream opened");
                self.reconciler.discard();
                return TurnOutcome::Discarded;
            }
            Err(e) => {
                warn!(error = %e, "Chat stream failed to open");
                return self.fail(e, started_at.elapsed());
            }
        };

        let mut reader = StreamReader::default();
        let read = self
            .read_stream(stream, &scheduler, &mut reader, cancel)
            .await;

        match read {
            Ok(()) => {
                scheduler.mark_done();
                tokio::select! {
                    _ = scheduler.wait_until_settled() => {}
                    _ = cancel.cancelled() => {
                        debug!("Cancelled during playback; keeping everything received");
                        scheduler.stop();
                    }
                }
                let state = scheduler.snapshot();
                self.settle(&state, &reader, started_at.elapsed())
            }
            Err(e) => {
                scheduler.stop();
                let state = scheduler.snapshot();
                let elapsed = started_at.elapsed();
                if e.is_cancellation() {
                    debug!(received = state.target_len(), "Stream cancelled");
                } else {
                    warn!(error = %e, received = state.target_len(), "Chat stream failed mid-response");
                }

                if !state.target_text().is_empty() {
                    self.reconciler
                        .finalize(state.target_text(), state.tools_used(), elapsed);
                    TurnOutcome::Truncated {
                        reason: e.category(),
                    }
                } else if e.is_cancellation() {
                    self.reconciler.discard();
                    TurnOutcome::Discarded
                } else {
                    self.fail(e, elapsed)
                }
            }
        }
    }

    /// Read chunks until `done`, end of body, cancellation or failure.
    async fn read_stream(
        &self,
        mut stream: ByteStream,
        scheduler: &PlaybackScheduler,
        reader: &mut StreamReader,
        cancel: &CancellationToken,
    ) -> Result<(), ChatError> {
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ChatError::Cancelled),
                next = stream.next() => next,
            };

            let (events, at_end) = match next {
                Some(Ok(chunk)) => (reader.push(&chunk), false),
                Some(Err(e @ ChatError::Stream(_))) => return Err(e),
                Some(Err(e)) => return Err(ChatError::Stream(e.to_string())),
                None => (reader.decoder.finish(), true),
            };

            for event in events {
                if self.apply_event(event, scheduler, reader)?.is_break() {
                    return Ok(());
                }
            }
            if at_end {
                debug!("Stream closed without a done event");
                return Ok(());
            }
        }
    }

    fn apply_event(
        &self,
        event: StreamEvent,
        scheduler: &PlaybackScheduler,
        reader: &mut StreamReader,
    ) -> Result<ControlFlow<()>, ChatError> {
        match event.event_type {
            StreamEventType::Token => {
                if !event.data.is_empty() {
                    reader.saw_token();
                    scheduler.push_token(&event.data);
                }
            }
            StreamEventType::ToolStart => {
                let name = event.data.trim();
                if !name.is_empty() {
                    if scheduler.record_tool(name) {
                        debug!(tool = name, "Tool started");
                    }
                    self.status
                        .send_modify(|s| s.active_tool = Some(name.to_string()));
                }
            }
            StreamEventType::ToolEnd => {
                debug!(tool = event.data.trim(), "Tool finished");
                self.status.send_modify(|s| s.active_tool = None);
            }
            StreamEventType::Done => {
                reader.done_payload = Some(event.data);
                return Ok(ControlFlow::Break(()));
            }
            StreamEventType::Error => {
                let message = if event.data.trim().is_empty() {
                    "server reported an error".to_string()
                } else {
                    event.data
                };
                return Err(ChatError::Stream(message));
            }
        }
        Ok(ControlFlow::Continue(()))
    }

    fn settle(&self, state: &StreamState, reader: &StreamReader, elapsed: Duration) -> TurnOutcome {
        if !state.target_text().is_empty() {
            self.reconciler
                .finalize(state.target_text(), state.tools_used(), elapsed);
            return TurnOutcome::Completed;
        }

        match fallback::resolve(reader.done_payload.as_deref(), &reader.raw_body) {
            Fallback::Recovered(content) => {
                self.reconciler
                    .finalize(&content, state.tools_used(), elapsed);
                TurnOutcome::Recovered
            }
            Fallback::Rejected(error) => self.fail(ChatError::Validation(error), elapsed),
            Fallback::Empty => {
                self.reconciler
                    .finalize(&self.config.no_response_text, state.tools_used(), elapsed);
                TurnOutcome::Empty
            }
        }
    }

    fn fail(&self, error: ChatError, elapsed: Duration) -> TurnOutcome {
        let message = error.to_string();
        self.reconciler.fail(&message, elapsed);
        TurnOutcome::Failed {
            category: error.category(),
            message,
        }
    }
}
