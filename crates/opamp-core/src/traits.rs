//! Capability traits at the session boundary.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::{
    error::TransportError,
    protocol::{AgentToServer, ConnectionSettings, PackageStatus, ServerToAgent},
    settings::StartSettings,
};

/// Request/response transport: one report out, at most one instruction back.
#[async_trait]
pub trait PollingTransport: Send + Sync {
    /// Apply the start settings (endpoint, headers, TLS, compression).
    ///
    /// # Errors
    /// Returns error if any setting is unusable.
    fn configure(&self, settings: &StartSettings) -> Result<(), TransportError>;

    /// Deliver one report and return the server's instruction, if any.
    ///
    /// An empty response is `Ok(None)`, not an error.
    ///
    /// # Errors
    /// Returns error on network, status or codec failure.
    async fn exchange(
        &self,
        report: &AgentToServer,
        cancel: &CancellationToken,
    ) -> Result<Option<ServerToAgent>, TransportError>;

    /// Switch to new connection settings, returning the ones they replace.
    ///
    /// # Errors
    /// Returns error if the settings are unusable; nothing changes then.
    fn apply_settings(
        &self,
        settings: &ConnectionSettings,
    ) -> Result<ConnectionSettings, TransportError>;

    /// Current wait between exchanges.
    fn polling_interval(&self) -> Duration;

    /// Change the wait between exchanges.
    fn set_polling_interval(&self, interval: Duration);
}

/// Persistent duplex transport.
///
/// Reports are pushed with `send`; instructions arrive on `receive`.
#[async_trait]
pub trait StreamingTransport: Send + Sync {
    /// Apply the start settings.
    ///
    /// # Errors
    /// Returns error if any setting is unusable.
    fn configure(&self, settings: &StartSettings) -> Result<(), TransportError>;

    /// Open (or re-open) the stream.
    ///
    /// # Errors
    /// Returns error if the stream cannot be established.
    async fn connect(&self, cancel: &CancellationToken) -> Result<(), TransportError>;

    /// Push a report over the open stream.
    ///
    /// # Errors
    /// Returns error if the stream is broken; the report was not delivered.
    async fn send(
        &self,
        report: &AgentToServer,
        cancel: &CancellationToken,
    ) -> Result<(), TransportError>;

    /// Wait for the next instruction. `Ok(None)` means the stream ended.
    ///
    /// Must be cancel-safe: dropping the future loses no instruction.
    ///
    /// # Errors
    /// Returns error if the stream broke.
    async fn receive(&self) -> Result<Option<ServerToAgent>, TransportError>;

    /// Switch to new connection settings, returning the ones they replace.
    /// Takes effect on the next `connect`.
    ///
    /// # Errors
    /// Returns error if the settings are unusable.
    fn apply_settings(
        &self,
        settings: &ConnectionSettings,
    ) -> Result<ConnectionSettings, TransportError>;

    /// Delay between reconnect attempts.
    fn retry_interval(&self) -> Duration;
}

/// The transport a session runs on.
#[derive(Clone)]
pub enum Transport {
    Polling(Arc<dyn PollingTransport>),
    Streaming(Arc<dyn StreamingTransport>),
}

impl Transport {
    /// Apply the start settings to whichever transport this is.
    ///
    /// # Errors
    /// Returns error if any setting is unusable.
    pub fn configure(&self, settings: &StartSettings) -> Result<(), TransportError> {
        match self {
            Self::Polling(t) => t.configure(settings),
            Self::Streaming(t) => t.configure(settings),
        }
    }

    /// Switch connection settings on whichever transport this is.
    ///
    /// # Errors
    /// Returns error if the settings are unusable.
    pub fn apply_settings(
        &self,
        settings: &ConnectionSettings,
    ) -> Result<ConnectionSettings, TransportError> {
        match self {
            Self::Polling(t) => t.apply_settings(settings),
            Self::Streaming(t) => t.apply_settings(settings),
        }
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Polling(_) => f.write_str("Transport::Polling"),
            Self::Streaming(_) => f.write_str("Transport::Streaming"),
        }
    }
}

/// Handle for reporting package sync progress outside the report cycle.
pub trait PackagesSyncer: Send + Sync {
    /// Record the status of one package and schedule a report.
    fn report_status(&self, status: PackageStatus);

    /// The offered packages are in place; acknowledge the offer so the same
    /// descriptor is not delivered again.
    fn done(&self);

    /// Syncing failed as a whole. The offer stays unacknowledged.
    fn fail(&self, error_message: String);
}
