//! Convenience re-exports for common use.

pub use crate::config::ChatConfig;
pub use crate::error::{ChatError, ErrorCategory, Result};
pub use crate::playback::{FrameClock, IntervalClock, PlaybackScheduler, RevealTick, StreamState};
pub use crate::session::{ChatSession, MessagesChangeFn, TurnOutcome, TurnStatus};
pub use crate::sse::{event_stream, SseDecoder};
pub use crate::transport::{ChatTransport, HttpChatTransport};
pub use crate::types::{
    Attachment, ChatMessage, PromptSelection, ResponseFormat, Role, SessionIdentity, Settings,
    StreamEvent, StreamEventType,
};
