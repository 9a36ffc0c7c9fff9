//! Minimal agent supervisor driving one management session.
//!
//! Run with: OPAMP_SERVER_URL=http://localhost:4320/v1/opamp cargo run -p opamp-supervisor-demo
//!
//! Remote configs are logged and taken as the new effective config. Press
//! Ctrl-C to stop.

use std::{
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use async_trait::async_trait;
use opamp_core::{
    CallbackError, Callbacks, PackagesSyncer, RemoteConfigOutcome, StartSettings, TransportError,
    protocol::{
        AgentDescription, AgentIdentification, AgentRemoteConfig, ComponentHealth, ConnectionKind,
        ConnectionSettings, EffectiveConfig, KeyValue, PackageState, PackageStatus,
        PackagesAvailable, RemoteConfigStatus, ServerErrorResponse, ServerToAgentCommand,
    },
};
use opamp_session::SessionEngine;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Callbacks that log everything and keep the last remote config as the
/// effective config.
#[derive(Default)]
struct LoggingCallbacks {
    effective: Mutex<EffectiveConfig>,
}

#[async_trait]
impl Callbacks for LoggingCallbacks {
    fn on_connect(&self) {
        tracing::info!("connected to management server");
    }

    fn on_connect_failed(&self, error: &TransportError) {
        tracing::warn!(%error, "connection failed");
    }

    fn on_error(&self, error: &ServerErrorResponse) {
        tracing::error!(error_type = ?error.error_type, message = %error.error_message, "server error");
    }

    async fn on_remote_config(
        &self,
        _cancel: &CancellationToken,
        config: &AgentRemoteConfig,
    ) -> Result<RemoteConfigOutcome, CallbackError> {
        for (name, file) in &config.config.config_map {
            tracing::info!(
                file = %name,
                content_type = %file.content_type,
                bytes = file.body.len(),
                "remote config file"
            );
        }
        let effective = EffectiveConfig::new(config.config.clone());
        if *self.effective.lock() == effective {
            return Ok(RemoteConfigOutcome::unchanged());
        }
        *self.effective.lock() = effective.clone();
        Ok(RemoteConfigOutcome::changed(effective))
    }

    async fn save_remote_config_status(
        &self,
        _cancel: &CancellationToken,
        status: &RemoteConfigStatus,
    ) {
        tracing::info!(status = ?status.status, "remote config status");
    }

    async fn get_effective_config(
        &self,
        _cancel: &CancellationToken,
    ) -> Result<EffectiveConfig, CallbackError> {
        Ok(self.effective.lock().clone())
    }

    fn on_connection_settings_accepted(&self, kind: &ConnectionKind, settings: &ConnectionSettings) {
        tracing::info!(%kind, endpoint = %settings.destination_endpoint, "connection settings in use");
    }

    async fn on_packages_available(
        &self,
        _cancel: &CancellationToken,
        packages: &PackagesAvailable,
        syncer: Arc<dyn PackagesSyncer>,
    ) -> Result<(), CallbackError> {
        for (name, package) in &packages.packages {
            tracing::info!(package = %name, version = %package.version, "package offered, not installing");
            syncer.report_status(PackageStatus {
                name: name.clone(),
                server_offered_version: package.version.clone(),
                server_offered_hash: package.hash.clone(),
                status: PackageState::InstallFailed,
                error_message: "package installation is not supported".into(),
                ..Default::default()
            });
        }
        syncer.done();
        Ok(())
    }

    async fn on_agent_identification(
        &self,
        _cancel: &CancellationToken,
        identification: &AgentIdentification,
    ) -> Result<(), CallbackError> {
        tracing::info!(instance_uid = %identification.new_instance_uid, "server assigned identity");
        Ok(())
    }

    async fn on_command(&self, command: &ServerToAgentCommand) -> Result<(), CallbackError> {
        tracing::warn!(command = ?command.command_type, "command received, restart is up to the operator");
        Err(CallbackError::Unsupported(format!("{:?}", command.command_type)))
    }
}

fn description() -> AgentDescription {
    AgentDescription {
        identifying_attributes: vec![
            KeyValue::string("service.name", "opamp-supervisor-demo"),
            KeyValue::string("service.version", env!("CARGO_PKG_VERSION")),
        ],
        non_identifying_attributes: vec![KeyValue::string("os.type", std::env::consts::OS)],
    }
}

fn unix_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let settings = StartSettings::from_env()?
        .with_agent_description(description())
        .with_callbacks(Arc::new(LoggingCallbacks::default()));

    let engine = SessionEngine::http();
    engine.start(settings)?;
    engine.set_health(ComponentHealth {
        healthy: true,
        start_time_unix_nano: unix_nanos(),
        status: "running".into(),
        ..Default::default()
    })?;
    tracing::info!(instance_uid = ?engine.instance_uid(), "supervisor running, press Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;

    let cancel = CancellationToken::new();
    let deadline = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(STOP_TIMEOUT).await;
        deadline.cancel();
    });
    engine.stop(&cancel).await?;
    tracing::info!("supervisor stopped");
    Ok(())
}
