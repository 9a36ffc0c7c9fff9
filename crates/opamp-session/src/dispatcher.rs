//! Routes server instructions to the agent's callbacks.

use std::{collections::HashMap, sync::Arc};

use opamp_core::{
    CallbackError, Callbacks, PackagesSyncer, ServerToAgent, TransportError,
    protocol::{
        AgentIdentification, AgentRemoteConfig, ConnectionKind, ConnectionSettings,
        ConnectionSettingsStatus, ConnectionStatus, PackagesAvailable, RemoteConfigStatus,
        RemoteConfigStatuses, ServerToAgentCommand,
    },
};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crate::{
    slot::SingleFlight,
    state::{SessionState, SyncOutcome},
    syncer::SessionPackagesSyncer,
};

/// Requests from callback workers to the exchange loop.
#[derive(Debug)]
pub(crate) enum EngineCommand {
    /// Switch the primary channel to `settings` and prove them with an
    /// exchange. The previous settings are restored on failure.
    Reconnect {
        settings: ConnectionSettings,
        reply: oneshot::Sender<Result<(), TransportError>>,
    },
}

pub(crate) struct Dispatcher {
    callbacks: Arc<dyn Callbacks>,
    state: Arc<SessionState>,
    tracker: TaskTracker,
    /// Stop was requested: no further handler runs start.
    stopping: CancellationToken,
    /// Handed to every callback; fires when the stop deadline passes.
    abort: CancellationToken,
    commands: mpsc::Sender<EngineCommand>,
    remote_config: SingleFlight<AgentRemoteConfig>,
    connection_slots: Mutex<HashMap<ConnectionKind, Arc<SingleFlight<ConnectionSettings>>>>,
    effective_config_gate: tokio::sync::Mutex<()>,
}

impl Dispatcher {
    pub(crate) fn new(
        callbacks: Arc<dyn Callbacks>,
        state: Arc<SessionState>,
        tracker: TaskTracker,
        stopping: CancellationToken,
        abort: CancellationToken,
        commands: mpsc::Sender<EngineCommand>,
    ) -> Self {
        Self {
            callbacks,
            state,
            tracker,
            stopping,
            abort,
            commands,
            remote_config: SingleFlight::new(),
            connection_slots: Mutex::new(HashMap::new()),
            effective_config_gate: tokio::sync::Mutex::new(()),
        }
    }

    pub(crate) fn callbacks(&self) -> &Arc<dyn Callbacks> {
        &self.callbacks
    }

    /// Route every populated part of an instruction.
    ///
    /// Only agent identification runs inline; every other handler runs on
    /// its own task.
    pub(crate) async fn dispatch(self: &Arc<Self>, instruction: ServerToAgent) {
        let ServerToAgent {
            remote_config,
            connection_settings,
            packages_available,
            report_full_state,
            agent_identification,
            command,
            ..
        } = instruction;

        // Sent with the next scheduled report.
        if report_full_state {
            tracing::debug!("server requested full state");
            self.state.request_full_state();
        }
        if let Some(identification) = agent_identification {
            self.identify(identification).await;
        }
        if let Some(config) = remote_config {
            self.dispatch_remote_config(config);
        }
        if let Some(offers) = connection_settings {
            for (kind, settings) in offers.into_offers() {
                self.dispatch_connection_settings(kind, settings);
            }
        }
        if let Some(packages) = packages_available {
            self.dispatch_packages_available(packages);
        }
        if let Some(command) = command {
            self.dispatch_command(command);
        }
    }

    async fn identify(&self, identification: AgentIdentification) {
        if identification.new_instance_uid.is_empty() {
            tracing::warn!("ignoring agent identification with an empty instance uid");
            return;
        }
        if identification.new_instance_uid == self.state.instance_uid() {
            return;
        }
        match self
            .callbacks
            .on_agent_identification(&self.abort, &identification)
            .await
        {
            Ok(()) => {
                tracing::info!(
                    instance_uid = %identification.new_instance_uid,
                    "adopted new instance uid"
                );
                self.state.set_instance_uid(identification.new_instance_uid);
            }
            Err(err) => {
                tracing::warn!(error = %err, "agent identification failed, keeping instance uid");
            }
        }
    }

    fn dispatch_remote_config(self: &Arc<Self>, config: AgentRemoteConfig) {
        let config = if config.config_hash.is_empty() {
            AgentRemoteConfig::new(config.config)
        } else {
            config
        };

        if self.remote_config_handled(&config) {
            tracing::trace!("remote config unchanged");
            return;
        }

        let Some(first) = self.remote_config.offer(config) else {
            tracing::debug!("remote config handler busy, newest config queued");
            return;
        };

        let this = Arc::clone(self);
        self.tracker.spawn(async move {
            let mut next = Some(first);
            while let Some(config) = next {
                if !this.remote_config_handled(&config) {
                    this.apply_remote_config(config).await;
                }
                if this.stopping.is_cancelled() {
                    break;
                }
                next = this.remote_config.finish();
            }
        });
    }

    fn remote_config_handled(&self, config: &AgentRemoteConfig) -> bool {
        self.state.remote_config_status().is_some_and(|status| {
            status.status != RemoteConfigStatuses::Unset
                && status.last_remote_config_hash == config.config_hash
        })
    }

    async fn apply_remote_config(&self, config: AgentRemoteConfig) {
        let hash = hex::encode(&config.config_hash);
        tracing::info!(config_hash = %hash, "applying remote config");

        let status = match self.callbacks.on_remote_config(&self.abort, &config).await {
            Ok(outcome) => {
                if outcome.config_changed {
                    match outcome.effective_config {
                        Some(effective) => {
                            self.state.set_effective_config(effective);
                        }
                        None => {
                            if let Err(err) = self.refresh_effective_config(&self.abort).await {
                                tracing::warn!(error = %err, "failed to read effective config");
                            }
                        }
                    }
                }
                RemoteConfigStatus {
                    last_remote_config_hash: config.config_hash,
                    status: RemoteConfigStatuses::Applied,
                    error_message: String::new(),
                }
            }
            Err(CallbackError::Cancelled) => {
                tracing::debug!(config_hash = %hash, "remote config handler cancelled");
                return;
            }
            Err(err) => {
                tracing::warn!(config_hash = %hash, error = %err, "remote config rejected");
                RemoteConfigStatus {
                    last_remote_config_hash: config.config_hash,
                    status: RemoteConfigStatuses::Failed,
                    error_message: err.to_string(),
                }
            }
        };

        self.callbacks
            .save_remote_config_status(&self.abort, &status)
            .await;
        self.state.set_remote_config_status(status);
        self.state.notify_urgent();
    }

    fn dispatch_connection_settings(
        self: &Arc<Self>,
        kind: ConnectionKind,
        mut settings: ConnectionSettings,
    ) {
        let current = self.state.connection(&kind);
        let inherit = settings.destination_endpoint.is_empty();
        if let Some(current) = current.as_ref().filter(|_| inherit) {
            settings
                .destination_endpoint
                .clone_from(&current.destination_endpoint);
        }
        if self.state.is_settled_offer(&kind, &settings) {
            tracing::trace!(%kind, "connection settings offer already settled");
            return;
        }

        let slot = Arc::clone(
            self.connection_slots
                .lock()
                .entry(kind.clone())
                .or_insert_with(|| Arc::new(SingleFlight::new())),
        );
        let Some(first) = slot.offer(settings) else {
            tracing::debug!(%kind, "connection settings handler busy, newest offer queued");
            return;
        };

        let this = Arc::clone(self);
        self.tracker.spawn(async move {
            let mut next = Some(first);
            while let Some(settings) = next {
                if !this.state.is_settled_offer(&kind, &settings) {
                    this.resolve_connection_settings(&kind, settings).await;
                }
                if this.stopping.is_cancelled() {
                    break;
                }
                next = slot.finish();
            }
        });
    }

    async fn resolve_connection_settings(&self, kind: &ConnectionKind, settings: ConnectionSettings) {
        let status = match self.try_connection_settings(kind, &settings).await {
            Ok(()) => {
                tracing::info!(%kind, endpoint = %settings.destination_endpoint, "connection settings accepted");
                self.state.set_connection(kind.clone(), settings.clone());
                self.state.offer_resolved(kind.clone(), settings.clone());
                self.callbacks
                    .on_connection_settings_accepted(kind, &settings);
                ConnectionSettingsStatus {
                    kind: kind.clone(),
                    status: ConnectionStatus::Accepted,
                    error_message: String::new(),
                }
            }
            Err(None) => {
                tracing::debug!(%kind, "connection settings handler cancelled");
                return;
            }
            Err(Some(reason)) => {
                tracing::warn!(%kind, error = %reason, "connection settings rejected");
                self.state.offer_resolved(kind.clone(), settings);
                ConnectionSettingsStatus {
                    kind: kind.clone(),
                    status: ConnectionStatus::Rejected,
                    error_message: reason,
                }
            }
        };
        self.state.record_connection_status(status);
        self.state.notify_urgent();
    }

    /// Run the handler and, for the primary channel, the reconnect.
    /// `Err(None)` means the attempt was cancelled and has no outcome.
    async fn try_connection_settings(
        &self,
        kind: &ConnectionKind,
        settings: &ConnectionSettings,
    ) -> Result<(), Option<String>> {
        let handled = match kind {
            ConnectionKind::Opamp => {
                self.callbacks
                    .on_opamp_connection_settings(&self.abort, settings)
                    .await
            }
            ConnectionKind::OwnTelemetry(telemetry) => {
                self.callbacks
                    .on_own_telemetry_connection_settings(&self.abort, *telemetry, settings)
                    .await
            }
            ConnectionKind::Other(name) => {
                self.callbacks
                    .on_other_connection_settings(&self.abort, name, settings)
                    .await
            }
        };
        match handled {
            Ok(()) => {}
            Err(CallbackError::Cancelled) => return Err(None),
            Err(err) => return Err(Some(err.to_string())),
        }

        if *kind == ConnectionKind::Opamp {
            match self.reconnect(settings.clone()).await {
                Ok(()) => {}
                Err(TransportError::Cancelled) => return Err(None),
                Err(err) => return Err(Some(format!("reconnect failed: {err}"))),
            }
        }
        Ok(())
    }

    async fn reconnect(&self, settings: ConnectionSettings) -> Result<(), TransportError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(EngineCommand::Reconnect { settings, reply })
            .await
            .map_err(|_| TransportError::Closed)?;
        response.await.map_err(|_| TransportError::Closed)?
    }

    fn dispatch_packages_available(&self, packages: PackagesAvailable) {
        let hash = packages.all_packages_hash.clone();
        if !self.state.begin_package_sync(&hash) {
            tracing::trace!(all_packages_hash = %hex::encode(&hash), "packages already synced");
            return;
        }
        tracing::info!(
            all_packages_hash = %hex::encode(&hash),
            count = packages.packages.len(),
            "packages available"
        );

        let syncer = Arc::new(SessionPackagesSyncer::new(Arc::clone(&self.state), hash.clone()));
        let callbacks = Arc::clone(&self.callbacks);
        let state = Arc::clone(&self.state);
        let abort = self.abort.clone();
        self.tracker.spawn(async move {
            let result = callbacks
                .on_packages_available(&abort, &packages, Arc::clone(&syncer) as _)
                .await;
            match result {
                Ok(()) => {}
                Err(CallbackError::Cancelled) => state.end_package_sync(&hash, SyncOutcome::Cancelled),
                Err(err) => syncer.fail(err.to_string()),
            }
        });
    }

    fn dispatch_command(&self, command: ServerToAgentCommand) {
        let callbacks = Arc::clone(&self.callbacks);
        tokio::spawn(async move {
            match callbacks.on_command(&command).await {
                Ok(()) => tracing::info!(command = ?command.command_type, "command handled"),
                Err(err) => {
                    tracing::warn!(command = ?command.command_type, error = %err, "command failed");
                }
            }
        });
    }

    /// Ask the agent for its effective config and record it. Calls are
    /// serialized; a second caller waits for the first.
    ///
    /// Returns whether the config hash changed.
    pub(crate) async fn refresh_effective_config(
        &self,
        cancel: &CancellationToken,
    ) -> Result<bool, CallbackError> {
        let _gate = self.effective_config_gate.lock().await;
        let config = self.callbacks.get_effective_config(cancel).await?;
        Ok(self.state.set_effective_config(config))
    }
}
