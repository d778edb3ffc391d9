//! Shared test helpers and a scripted transport.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;

use chatstream::error::ChatError;
use chatstream::session::ChatSession;
use chatstream::transport::{ByteStream, ChatTransport};
use chatstream::types::*;

/// One step of a scripted response body.
#[derive(Debug, Clone)]
pub enum Step {
    /// Deliver these bytes as one chunk.
    Chunk(Bytes),
    /// Wait before the next step.
    Delay(Duration),
    /// Fail the read with a stream error and end the body.
    Fail(String),
    /// Never deliver anything again.
    Hang,
}

/// A request the transport was asked to send.
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Stream(ChatRequest),
    Complete(ChatRequest),
    Upload(ChatRequest, Vec<String>),
}

/// A transport that replays queued bodies and replies in order.
#[derive(Default)]
pub struct ScriptedTransport {
    streams: Mutex<VecDeque<Result<Vec<Step>, ChatError>>>,
    replies: Mutex<VecDeque<Result<ChatReply, ChatError>>>,
    calls: Mutex<Vec<Call>>,
}

impl ScriptedTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queue the body of the next `open_stream` call.
    pub fn queue_stream(&self, steps: Vec<Step>) {
        self.streams.lock().unwrap().push_back(Ok(steps));
    }

    /// Make the next `open_stream` call fail before any body.
    pub fn queue_open_error(&self, error: ChatError) {
        self.streams.lock().unwrap().push_back(Err(error));
    }

    /// Queue the result of the next `complete` or `upload` call.
    pub fn queue_reply(&self, reply: Result<ChatReply, ChatError>) {
        self.replies.lock().unwrap().push_back(reply);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    fn next_reply(&self) -> Result<ChatReply, ChatError> {
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(ChatError::InvalidState("no scripted reply".into())))
    }
}

#[async_trait]
impl ChatTransport for ScriptedTransport {
    async fn open_stream(&self, request: &ChatRequest) -> Result<ByteStream, ChatError> {
        self.calls.lock().unwrap().push(Call::Stream(request.clone()));
        let steps = self
            .streams
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(ChatError::InvalidState("no scripted stream".into())))?;

        let body = async_stream::stream! {
            for step in steps {
                match step {
                    Step::Chunk(bytes) => yield Ok(bytes),
                    Step::Delay(d) => tokio::time::sleep(d).await,
                    Step::Fail(message) => {
                        yield Err(ChatError::Stream(message));
                        return;
                    }
                    Step::Hang => futures::future::pending::<()>().await,
                }
            }
        };
        Ok(body.boxed())
    }

    async fn complete(&self, request: &ChatRequest) -> Result<ChatReply, ChatError> {
        self.calls.lock().unwrap().push(Call::Complete(request.clone()));
        self.next_reply()
    }

    async fn upload(
        &self,
        request: &ChatRequest,
        attachments: &[Attachment],
    ) -> Result<ChatReply, ChatError> {
        let names = attachments.iter().map(|a| a.file_name.clone()).collect();
        self.calls
            .lock()
            .unwrap()
            .push(Call::Upload(request.clone(), names));
        self.next_reply()
    }
}

/// One SSE block.
pub fn sse(event: &str, data: &str) -> String {
    format!("event: {event}\ndata: {data}\n\n")
}

/// One SSE block as a single chunk.
pub fn chunk(event: &str, data: &str) -> Step {
    Step::Chunk(Bytes::from(sse(event, data)))
}

pub fn raw(text: &str) -> Step {
    Step::Chunk(Bytes::from(text.to_string()))
}

pub fn identity() -> SessionIdentity {
    SessionIdentity::new("user-1", "session-1")
}

/// Session over `transport` with default config and settings.
pub fn session_with(transport: Arc<ScriptedTransport>) -> ChatSession {
    ChatSession::builder()
        .transport(transport)
        .identity(identity())
        .build()
        .unwrap()
}

/// Session over `transport` with the given settings.
pub fn session_with_settings(transport: Arc<ScriptedTransport>, settings: Settings) -> ChatSession {
    ChatSession::builder()
        .transport(transport)
        .identity(identity())
        .settings(settings)
        .build()
        .unwrap()
}
