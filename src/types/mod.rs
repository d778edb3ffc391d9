//! Core types for chatstream.

pub mod message;
pub mod request;
pub mod settings;
pub mod stream;

pub use message::*;
pub use request::*;
pub use settings::*;
pub use stream::*;
