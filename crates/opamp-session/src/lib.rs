//! Client session engine for the agent management protocol.
//!
//! Provides:
//! - `SessionEngine` - Start/stop lifecycle and the exchange loop
//! - Report assembly with contiguous sequence numbers
//! - Callback dispatch with single-flight, latest-wins coalescing

mod dispatcher;
pub mod engine;
mod slot;
mod state;
mod syncer;
mod worker;

pub use engine::{SessionEngine, SessionPhase};
