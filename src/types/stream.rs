//! Streaming protocol event types.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Type of a decoded stream event.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum StreamEventType {
    /// Incremental answer text. SSE's default `message` event maps here.
    #[strum(to_string = "token", serialize = "message")]
    Token,
    /// The server started running a tool; data is the tool name.
    ToolStart,
    /// The server finished running a tool; data is the tool name.
    ToolEnd,
    /// End of the answer.
    Done,
    /// Server-side failure reported inside the stream.
    Error,
}

/// One discrete event decoded from the response stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamEvent {
    #[serde(rename = "type")]
    pub event_type: StreamEventType,
    pub data: String,
}

impl StreamEvent {
    pub fn new(event_type: StreamEventType, data: impl Into<String>) -> Self {
        Self {
            event_type,
            data: data.into(),
        }
    }

    pub fn token(text: impl Into<String>) -> Self {
        Self::new(StreamEventType::Token, text)
    }

    pub fn done() -> Self {
        Self::new(StreamEventType::Done, "")
    }
}
