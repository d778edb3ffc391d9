//! chatstream: streaming chat response pipeline.
//!
//! Consumes a server-sent-event token stream, reveals the text at a paced
//! rate independent of network burstiness, supports mid-stream cancellation,
//! and reconciles partial and final state into a session's message list.
//!
//! # Quick Start
//!
//! ```no_run
//! use chatstream::prelude::*;
//!
//! # async fn example() -> chatstream::error::Result<()> {
//! let config = ChatConfig::discover()?;
//! let session = ChatSession::connect(config, SessionIdentity::new("user-1", "session-1"))?;
//! session.send_message("Hello!", Vec::new());
//! session.wait_for_idle().await;
//! println!("{:?}", session.messages().last());
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod playback;
pub mod prelude;
pub mod session;
pub mod sse;
pub mod transport;
pub mod types;
pub mod util;

#[cfg(feature = "cli")]
pub mod cli;
