//! Agent-supplied handlers for server instructions.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::{
    error::{CallbackError, TransportError},
    protocol::{
        AgentIdentification, AgentRemoteConfig, ConnectionKind, ConnectionSettings,
        EffectiveConfig, OwnTelemetryKind, PackagesAvailable, RemoteConfigStatus,
        ServerErrorResponse, ServerToAgentCommand,
    },
    traits::PackagesSyncer,
};

/// Result of a successful `on_remote_config` call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteConfigOutcome {
    /// Effective config after applying the remote config. Its hash is
    /// recomputed by the session.
    pub effective_config: Option<EffectiveConfig>,
    /// Whether applying the remote config changed the effective config.
    pub config_changed: bool,
}

impl RemoteConfigOutcome {
    /// Applied without changing the effective config.
    #[must_use]
    pub fn unchanged() -> Self {
        Self::default()
    }

    /// Applied, producing a new effective config.
    #[must_use]
    pub fn changed(effective_config: EffectiveConfig) -> Self {
        Self {
            effective_config: Some(effective_config),
            config_changed: true,
        }
    }
}

/// Handlers the session invokes on behalf of the agent.
///
/// Every method has a default: notifications do nothing, offers are
/// accepted, and `get_effective_config` returns an empty config. Implement
/// only what the agent supports.
///
/// Methods that take a [`CancellationToken`] may be cancelled when the
/// session stops; implementations should observe it and return promptly,
/// typically with [`CallbackError::Cancelled`].
///
/// Calls of `on_remote_config` never overlap. The same holds per channel for
/// the connection settings handlers. Remote configs that arrive while a call
/// is running are coalesced: only the newest one is delivered afterwards.
#[async_trait]
pub trait Callbacks: Send + Sync {
    /// The first exchange succeeded, or the connection was re-established.
    fn on_connect(&self) {}

    /// An exchange failed. Retrying is handled by the session.
    fn on_connect_failed(&self, _error: &TransportError) {}

    /// The server reported a non-transient error. For observability only.
    fn on_error(&self, _error: &ServerErrorResponse) {}

    /// Apply a remote config.
    ///
    /// Success is reported as applied, an error as failed with the error
    /// message. Either way the resulting status is passed to
    /// [`Callbacks::save_remote_config_status`].
    async fn on_remote_config(
        &self,
        _cancel: &CancellationToken,
        _config: &AgentRemoteConfig,
    ) -> Result<RemoteConfigOutcome, CallbackError> {
        Ok(RemoteConfigOutcome::unchanged())
    }

    /// Persist the remote config status so it can be supplied to the next
    /// session's start settings.
    async fn save_remote_config_status(
        &self,
        _cancel: &CancellationToken,
        _status: &RemoteConfigStatus,
    ) {
    }

    /// Current effective config. Calls never overlap.
    async fn get_effective_config(
        &self,
        _cancel: &CancellationToken,
    ) -> Result<EffectiveConfig, CallbackError> {
        Ok(EffectiveConfig::default())
    }

    /// Settings for the management channel itself. Returning `Ok` lets the
    /// session try to reconnect with them; they are accepted only if that
    /// reconnect succeeds.
    async fn on_opamp_connection_settings(
        &self,
        _cancel: &CancellationToken,
        _settings: &ConnectionSettings,
    ) -> Result<(), CallbackError> {
        Ok(())
    }

    /// Settings for reporting the agent's own telemetry.
    async fn on_own_telemetry_connection_settings(
        &self,
        _cancel: &CancellationToken,
        _kind: OwnTelemetryKind,
        _settings: &ConnectionSettings,
    ) -> Result<(), CallbackError> {
        Ok(())
    }

    /// Settings for any other named destination.
    async fn on_other_connection_settings(
        &self,
        _cancel: &CancellationToken,
        _name: &str,
        _settings: &ConnectionSettings,
    ) -> Result<(), CallbackError> {
        Ok(())
    }

    /// Settings were verified and are now in use. Previous settings for the
    /// same channel should be forgotten.
    fn on_connection_settings_accepted(&self, _kind: &ConnectionKind, _settings: &ConnectionSettings) {
    }

    /// The server offers packages that differ from what the agent last
    /// acknowledged. Use `syncer` to report progress.
    async fn on_packages_available(
        &self,
        _cancel: &CancellationToken,
        _packages: &PackagesAvailable,
        _syncer: Arc<dyn PackagesSyncer>,
    ) -> Result<(), CallbackError> {
        Ok(())
    }

    /// The server assigned a new identity.
    async fn on_agent_identification(
        &self,
        _cancel: &CancellationToken,
        _identification: &AgentIdentification,
    ) -> Result<(), CallbackError> {
        Ok(())
    }

    /// Ad-hoc command. The result is only logged.
    async fn on_command(&self, _command: &ServerToAgentCommand) -> Result<(), CallbackError> {
        Ok(())
    }
}

/// Callbacks that keep every default.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCallbacks;

impl Callbacks for NoopCallbacks {}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_defaults_are_well_formed() {
        let callbacks = NoopCallbacks;
        let cancel = CancellationToken::new();

        let effective = callbacks.get_effective_config(&cancel).await.unwrap();
        assert_eq!(effective, EffectiveConfig::default());
        assert_eq!(effective.hash.len(), 32);

        let outcome = callbacks
            .on_remote_config(&cancel, &AgentRemoteConfig::default())
            .await
            .unwrap();
        assert_eq!(outcome, RemoteConfigOutcome::unchanged());

        tokio_test::assert_ok!(
            callbacks
                .on_opamp_connection_settings(&cancel, &ConnectionSettings::default())
                .await
        );
    }
}
