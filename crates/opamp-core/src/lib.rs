//! Core abstractions for the agent management protocol client.
//!
//! This crate provides the fundamental building blocks:
//! - `AgentToServer` / `ServerToAgent` - Wire messages
//! - `Sequencer` - Report sequence numbers
//! - `Callbacks` - Agent-supplied instruction handlers
//! - `PollingTransport` / `StreamingTransport` - Transport capabilities
//! - `StartSettings` - Session configuration

pub mod callbacks;
pub mod error;
pub mod hash;
pub mod protocol;
pub mod sequencer;
pub mod settings;
pub mod traits;

pub use callbacks::{Callbacks, NoopCallbacks, RemoteConfigOutcome};
pub use error::{CallbackError, ClientError, ConfigError, TransportError};
pub use protocol::{AgentToServer, ServerToAgent};
pub use sequencer::Sequencer;
pub use settings::{DEFAULT_POLLING_INTERVAL, StartSettings, TlsSettings};
pub use traits::{PackagesSyncer, PollingTransport, StreamingTransport, Transport};
