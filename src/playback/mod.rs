//! Paced reveal of streamed text.
//!
//! Tokens arrive in bursts decided by the network; the text the user sees
//! grows on a frame clock. [`PlaybackScheduler`] keeps the accumulated target
//! text in a [`StreamState`] and, once per frame, reveals
//! `ceil(target_len / frames_target)` more characters (at least one), so
//! short answers appear within a frame and long ones still finish in a
//! bounded number of frames.
//!
//! Phases: `Idle -> Animating -> Settled`. The scheduler drops back to
//! `Idle` when it has caught up with a stream that has not ended, and
//! settles when it catches up after the end was signalled. `Stopped` is
//! terminal and is entered on cancellation.

pub mod state;

pub use state::StreamState;

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub const DEFAULT_FRAMES_TARGET: usize = 40;
pub const DEFAULT_FRAME_INTERVAL: Duration = Duration::from_millis(16);

/// Scheduler lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackPhase {
    Idle,
    Animating,
    Settled,
    Stopped,
}

/// One reveal step delivered to the message reconciler.
#[derive(Debug, Clone, PartialEq)]
pub struct RevealTick {
    /// Revealed prefix of the target text.
    pub content: String,
    /// Revealed length in characters.
    pub revealed_len: usize,
    /// Tools seen so far, in first-use order.
    pub tools_used: Vec<String>,
    /// Set only on the settling tick, which covers the whole target.
    pub is_final: bool,
    /// Time since the turn started; only on the settling tick.
    pub elapsed: Option<Duration>,
}

/// Receives reveal ticks.
pub type RevealSink = Arc<dyn Fn(RevealTick) + Send + Sync>;

/// Host rendering clock: resolves once per frame.
#[async_trait]
pub trait FrameClock: Send + Sync {
    async fn next_frame(&self);
}

/// Frame clock backed by `tokio::time::sleep`.
#[derive(Debug, Clone, Copy)]
pub struct IntervalClock {
    period: Duration,
}

impl IntervalClock {
    pub fn new(period: Duration) -> Self {
        Self { period }
    }
}

impl Default for IntervalClock {
    fn default() -> Self {
        Self::new(DEFAULT_FRAME_INTERVAL)
    }
}

#[async_trait]
impl FrameClock for IntervalClock {
    async fn next_frame(&self) {
        tokio::time::sleep(self.period).await;
    }
}

struct Inner {
    stream: StreamState,
    phase: PlaybackPhase,
}

struct Shared {
    inner: Mutex<Inner>,
    sink: RevealSink,
    frames_target: usize,
    settled_tx: watch::Sender<bool>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Decouples token arrival from on-screen reveal.
///
/// Owned by a single turn; dropping it aborts the tick task.
pub struct PlaybackScheduler {
    shared: Arc<Shared>,
    clock: Arc<dyn FrameClock>,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl PlaybackScheduler {
    pub fn new(
        stream: StreamState,
        frames_target: usize,
        clock: Arc<dyn FrameClock>,
        sink: RevealSink,
    ) -> Self {
        let (settled_tx, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    stream,
                    phase: PlaybackPhase::Idle,
                }),
                sink,
                frames_target: frames_target.max(1),
                settled_tx,
            }),
            clock,
            ticker: Mutex::new(None),
        }
    }

    pub fn phase(&self) -> PlaybackPhase {
        self.shared.lock().phase
    }

    pub fn is_settled(&self) -> bool {
        self.phase() == PlaybackPhase::Settled
    }

    /// Copy of the current stream state.
    pub fn snapshot(&self) -> StreamState {
        self.shared.lock().stream.clone()
    }

    /// Append token text to the target and make sure a tick is pending.
    pub fn push_token(&self, text: &str) {
        if text.is_empty() {
            return;
        }
        let mut inner = self.shared.lock();
        match inner.phase {
            PlaybackPhase::Settled | PlaybackPhase::Stopped => {
                warn!(phase = ?inner.phase, "Dropping token received after playback finished");
            }
            PlaybackPhase::Idle | PlaybackPhase::Animating => {
                inner.stream.push_text(text);
                self.ensure_ticking(&mut inner);
            }
        }
    }

    /// Record a tool in the ordered tool set. Returns `false` if already seen.
    pub fn record_tool(&self, name: &str) -> bool {
        self.shared.lock().stream.record_tool(name)
    }

    /// Signal the end of the stream; playback settles once it catches up.
    pub fn mark_done(&self) {
        let mut inner = self.shared.lock();
        if inner.stream.is_ended() {
            return;
        }
        inner.stream.end();
        if inner.phase == PlaybackPhase::Idle {
            self.ensure_ticking(&mut inner);
        }
    }

    /// Resolve once playback has settled; immediately if it already has.
    pub async fn wait_until_settled(&self) {
        let mut rx = self.shared.settled_tx.subscribe();
        let _ = rx.wait_for(|settled| *settled).await;
    }

    /// Stop ticking for good. No tick is delivered after this returns.
    pub fn stop(&self) {
        {
            let mut inner = self.shared.lock();
            if inner.phase != PlaybackPhase::Settled {
                inner.phase = PlaybackPhase::Stopped;
            }
        }
        if let Some(handle) = self.take_ticker() {
            handle.abort();
        }
    }

    fn ensure_ticking(&self, inner: &mut Inner) {
        if inner.phase == PlaybackPhase::Animating {
            return;
        }
        inner.phase = PlaybackPhase::Animating;

        let shared = self.shared.clone();
        let clock = self.clock.clone();
        let handle = tokio::spawn(run_ticker(shared, clock));

        let mut ticker = self
            .ticker
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        // A ticker that already dropped to Idle may still be unwinding.
        if let Some(previous) = ticker.replace(handle) {
            previous.abort();
        }
    }

    fn take_ticker(&self) -> Option<JoinHandle<()>> {
        self.ticker
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }
}

impl Drop for PlaybackScheduler {
    fn drop(&mut self) {
        if let Some(handle) = self.take_ticker() {
            handle.abort();
        }
    }
}

async fn run_ticker(shared: Arc<Shared>, clock: Arc<dyn FrameClock>) {
    loop {
        clock.next_frame().await;

        let mut inner = shared.lock();
        if inner.phase != PlaybackPhase::Animating {
            return;
        }

        let advanced = if inner.stream.is_caught_up() {
            false
        } else {
            inner.stream.advance(shared.frames_target);
            true
        };

        if inner.stream.is_caught_up() && inner.stream.is_ended() {
            inner.stream.reveal_all();
            inner.phase = PlaybackPhase::Settled;
            let tick = reveal_tick(&inner.stream, true);
            debug!(revealed = tick.revealed_len, "Playback settled");
            // Delivered under the lock so `stop()` cannot interleave.
            (shared.sink)(tick);
            drop(inner);
            // `send` would drop the value when nobody is subscribed yet.
            shared.settled_tx.send_replace(true);
            return;
        }

        if advanced {
            (shared.sink)(reveal_tick(&inner.stream, false));
        }

        if inner.stream.is_caught_up() {
            inner.phase = PlaybackPhase::Idle;
            return;
        }
    }
}

fn reveal_tick(stream: &StreamState, is_final: bool) -> RevealTick {
    RevealTick {
        content: stream.revealed_text().to_string(),
        revealed_len: stream.revealed_len(),
        tools_used: stream.tools_used().to_vec(),
        is_final,
        elapsed: is_final.then(|| stream.elapsed()),
    }
}
