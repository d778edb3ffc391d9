//! Network transports for the chat endpoints.

pub mod http;

pub use http::HttpChatTransport;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;

use crate::error::ChatError;
use crate::types::{Attachment, ChatReply, ChatRequest};

/// Raw response body of the streaming endpoint.
pub type ByteStream = BoxStream<'static, Result<Bytes, ChatError>>;

/// The three ways a turn can reach the server.
///
/// Implementations return `Err` from `open_stream` when the request could not
/// be sent or the status was not 2xx; errors yielded by the returned stream
/// are mid-stream read failures.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// Open the event-stream endpoint.
    async fn open_stream(&self, request: &ChatRequest) -> Result<ByteStream, ChatError>;

    /// Send to the non-streaming JSON endpoint.
    async fn complete(&self, request: &ChatRequest) -> Result<ChatReply, ChatError>;

    /// Send a multipart request carrying attachments.
    async fn upload(
        &self,
        request: &ChatRequest,
        attachments: &[Attachment],
    ) -> Result<ChatReply, ChatError>;
}
