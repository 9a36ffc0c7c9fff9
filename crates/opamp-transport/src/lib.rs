//! Transports for the agent management protocol client.
//!
//! Provides:
//! - Wire codec (JSON + optional gzip)
//! - HTTP polling sender
//! - In-process duplex transport

pub mod channel;
pub mod codec;
pub mod http;

pub use channel::{ChannelListener, ChannelNetwork, ChannelTransport, ServerConnection};
pub use http::HttpSender;
