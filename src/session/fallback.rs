//! Recovery for streams that ended without any token.

use tracing::{info, warn};

use crate::types::ChatReply;

/// What to show when a stream ended with no text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fallback {
    /// The server sent the answer as plain JSON instead of events.
    Recovered(String),
    /// The JSON body carried an error instead of content.
    Rejected(String),
    /// Nothing usable came back.
    Empty,
}

/// Look for a JSON reply in the `done` payload, then in the raw body.
pub fn resolve(done_payload: Option<&str>, raw_body: &[u8]) -> Fallback {
    let candidates = done_payload
        .map(|p| p.as_bytes())
        .into_iter()
        .chain(std::iter::once(raw_body));

    for candidate in candidates {
        let Ok(reply) = serde_json::from_slice::<ChatReply>(trim_ascii(candidate)) else {
            continue;
        };
        if let Some(content) = reply.content.filter(|c| !c.is_empty()) {
            warn!(
                chars = content.chars().count(),
                "Stream carried no tokens; recovered content from a JSON body"
            );
            return Fallback::Recovered(content);
        }
        if let Some(error) = reply.error {
            warn!(%error, "Stream carried no tokens; JSON body reported an error");
            return Fallback::Rejected(error);
        }
    }

    info!("Server returned an empty response");
    Fallback::Empty
}

fn trim_ascii(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    let end = bytes
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(start, |i| i + 1);
    &bytes[start..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn done_payload_is_tried_first() {
        let got = resolve(Some(r#"{"content":"from done"}"#), br#"{"content":"from body"}"#);
        assert_eq!(got, Fallback::Recovered("from done".into()));
    }

    #[test]
    fn raw_json_body_is_recovered() {
        let got = resolve(Some(""), b"  {\"content\":\"fallback\"}\n");
        assert_eq!(got, Fallback::Recovered("fallback".into()));
    }

    #[test]
    fn error_body_is_rejected() {
        let got = resolve(None, br#"{"error":"message too long"}"#);
        assert_eq!(got, Fallback::Rejected("message too long".into()));
    }

    #[test]
    fn event_framed_body_is_empty() {
        assert_eq!(resolve(Some(""), b"event: done\n\n"), Fallback::Empty);
        assert_eq!(resolve(None, b""), Fallback::Empty);
    }
}
