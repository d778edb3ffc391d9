//! Incremental server-sent-event decoding.
//!
//! Bytes arrive in arbitrary chunks: a chunk may end inside an event block,
//! inside a line, inside the blank-line separator, or inside a multi-byte
//! UTF-8 sequence. [`SseDecoder`] keeps the undecoded byte tail and the
//! unterminated block between calls, so the events it yields do not depend on
//! where the chunk boundaries fell.

use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use tracing::debug;

use crate::error::ChatError;
use crate::types::{StreamEvent, StreamEventType};

const BLOCK_SEPARATOR: &str = "\n\n";

/// Stateful decoder turning raw response bytes into [`StreamEvent`]s.
#[derive(Debug, Default)]
pub struct SseDecoder {
    utf8: Utf8Decoder,
    buffer: String,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk and return every event completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<StreamEvent> {
        let text = self.utf8.decode(chunk);

        // The retained buffer holds no separator, but its last byte may
        // start one that the new text completes.
        let mut search_from = self
            .buffer
            .len()
            .saturating_sub(BLOCK_SEPARATOR.len() - 1);
        while !self.buffer.is_char_boundary(search_from) {
            search_from -= 1;
        }
        self.buffer.push_str(&text);

        let mut events = Vec::new();
        let mut consumed = 0;
        while let Some(pos) = self.buffer[search_from..].find(BLOCK_SEPARATOR) {
            let end = search_from + pos;
            if let Some(event) = parse_block(&self.buffer[consumed..end]) {
                events.push(event);
            }
            consumed = end + BLOCK_SEPARATOR.len();
            search_from = consumed;
        }
        self.buffer.drain(..consumed);
        events
    }

    /// Flush at end of stream: the undecodable byte tail is replaced
    /// lossily and a final block without a terminating blank line is parsed.
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        let tail = self.utf8.finish();
        self.buffer.push_str(&tail);
        let mut events = Vec::new();
        let rest = std::mem::take(&mut self.buffer);
        for block in rest.split(BLOCK_SEPARATOR) {
            if let Some(event) = parse_block(block) {
                events.push(event);
            }
        }
        events
    }

    /// Text received after the last complete block.
    pub fn pending(&self) -> &str {
        &self.buffer
    }
}

/// Parse one blank-line-delimited block.
///
/// Returns `None` for blocks that carry neither an `event:` nor a `data:`
/// line (keep-alive comments, stray text) and for unknown event names.
pub fn parse_block(block: &str) -> Option<StreamEvent> {
    let mut event_name: Option<&str> = None;
    let mut data: Vec<&str> = Vec::new();

    for line in block.split('\n') {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        if let Some(value) = field_value(line, "event") {
            event_name = Some(value.trim());
        } else if let Some(value) = field_value(line, "data") {
            data.push(value);
        }
    }

    if event_name.is_none() && data.is_empty() {
        return None;
    }

    let event_type = match event_name {
        None | Some("") => StreamEventType::Token,
        Some(name) => match name.parse::<StreamEventType>() {
            Ok(t) => t,
            Err(_) => {
                debug!(event = name, "Skipping unknown SSE event");
                return None;
            }
        },
    };

    Some(StreamEvent::new(event_type, data.join("\n")))
}

fn field_value<'a>(line: &'a str, field: &str) -> Option<&'a str> {
    let value = line.strip_prefix(field)?.strip_prefix(':')?;
    Some(value.strip_prefix(' ').unwrap_or(value))
}

/// Adapt a byte stream into a lazy stream of events.
///
/// A read error is yielded once and ends the stream.
pub fn event_stream<S, B, E>(bytes: S) -> BoxStream<'static, Result<StreamEvent, ChatError>>
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Into<ChatError> + Send + 'static,
{
    let stream = async_stream::stream! {
        let mut decoder = SseDecoder::new();
        futures::pin_mut!(bytes);

        while let Some(chunk) = bytes.next().await {
            match chunk {
                Ok(chunk) => {
                    for event in decoder.push(chunk.as_ref()) {
                        yield Ok(event);
                    }
                }
                Err(e) => {
                    yield Err(e.into());
                    return;
                }
            }
        }

        for event in decoder.finish() {
            yield Ok(event);
        }
    };
    Box::pin(stream)
}

/// Incremental UTF-8 decoder that carries split code points across chunks.
#[derive(Debug, Default)]
struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    fn decode(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);
        let mut out = String::new();

        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(text) => {
                    out.push_str(text);
                    self.pending.clear();
                    return out;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    if let Ok(text) = std::str::from_utf8(&self.pending[..valid]) {
                        out.push_str(text);
                    }
                    match e.error_len() {
                        // Invalid sequence mid-buffer: replace it and keep going.
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + bad);
                        }
                        // Incomplete sequence at the end: wait for more bytes.
                        None => {
                            self.pending.drain(..valid);
                            return out;
                        }
                    }
                }
            }
        }
    }

    fn finish(&mut self) -> String {
        let tail = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        tail
    }
}
