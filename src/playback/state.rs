//! Per-turn stream state.

use std::time::Duration;

use tokio::time::Instant;

/// Ephemeral state of one in-flight turn.
///
/// `target_text` only grows; the revealed prefix never shrinks and never
/// runs past the target. Lengths are counted in characters so a reveal step
/// never splits a code point.
#[derive(Debug, Clone)]
pub struct StreamState {
    target_text: String,
    target_chars: usize,
    revealed_bytes: usize,
    revealed_chars: usize,
    tools_used: Vec<String>,
    stream_ended: bool,
    started_at: Instant,
}

impl Default for StreamState {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamState {
    pub fn new() -> Self {
        Self::started_at(Instant::now())
    }

    pub fn started_at(started_at: Instant) -> Self {
        Self {
            target_text: String::new(),
            target_chars: 0,
            revealed_bytes: 0,
            revealed_chars: 0,
            tools_used: Vec::new(),
            stream_ended: false,
            started_at,
        }
    }

    pub fn target_text(&self) -> &str {
        &self.target_text
    }

    pub fn target_len(&self) -> usize {
        self.target_chars
    }

    pub fn revealed_text(&self) -> &str {
        &self.target_text[..self.revealed_bytes]
    }

    pub fn revealed_len(&self) -> usize {
        self.revealed_chars
    }

    pub fn tools_used(&self) -> &[String] {
        &self.tools_used
    }

    pub fn is_ended(&self) -> bool {
        self.stream_ended
    }

    pub fn is_caught_up(&self) -> bool {
        self.revealed_chars == self.target_chars
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn push_text(&mut self, text: &str) {
        if self.stream_ended {
            return;
        }
        self.target_text.push_str(text);
        self.target_chars += text.chars().count();
    }

    pub fn record_tool(&mut self, name: &str) -> bool {
        if self.tools_used.iter().any(|t| t == name) {
            return false;
        }
        self.tools_used.push(name.to_string());
        true
    }

    pub fn end(&mut self) {
        self.stream_ended = true;
    }

    /// Characters revealed per frame for the current target.
    pub fn step(&self, frames_target: usize) -> usize {
        self.target_chars.div_ceil(frames_target.max(1)).max(1)
    }

    /// Reveal one frame's worth of text. Returns the new revealed length.
    pub fn advance(&mut self, frames_target: usize) -> usize {
        let step = self.step(frames_target);
        let rest = &self.target_text[self.revealed_bytes..];
        let (bytes, chars) = match rest.char_indices().nth(step) {
            Some((offset, _)) => (offset, step),
            None => (rest.len(), rest.chars().count()),
        };
        self.revealed_bytes += bytes;
        self.revealed_chars += chars;
        self.revealed_chars
    }

    pub fn reveal_all(&mut self) {
        self.revealed_bytes = self.target_text.len();
        self.revealed_chars = self.target_chars;
    }
}
