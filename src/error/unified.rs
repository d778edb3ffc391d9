//! Error classification and recovery.

use serde::{Deserialize, Serialize};

/// Broad error category for routing recovery logic.
///
/// The first four variants mirror how a turn can end badly: the user stopped
/// it, the connection never produced a stream, the stream broke part-way, or
/// the server rejected the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    UserCancelled,
    Connection,
    StreamRead,
    Validation,
    Authentication,
    Timeout,
    Server,
    Configuration,
    Serialization,
    Unknown,
}

/// Suggested recovery action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoverySuggestion {
    /// Nothing to do; the outcome was requested.
    None,
    /// Resend the last message once the cause has cleared.
    Resend,
    CheckCredentials,
    CheckConfiguration,
    /// The request itself was rejected and must change before resending.
    FixRequest,
    IncreaseTimeout,
    ContactSupport,
}
