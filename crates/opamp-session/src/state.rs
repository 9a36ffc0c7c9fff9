//! Per-session state and report assembly.
//!
//! Each concern sits behind its own lock and no method holds two of them at
//! once.

use std::collections::HashMap;

use opamp_core::{
    AgentToServer, Sequencer, StartSettings,
    protocol::{
        AgentDescription, ComponentHealth, ConnectionKind, ConnectionSettings,
        ConnectionSettingsStatus, EffectiveConfig, PackageStatus, PackageStatuses,
        RemoteConfigStatus, capabilities,
    },
};
use parking_lot::Mutex;
use tokio::sync::Notify;

/// Which parts of the report changed since the last one was assembled.
#[derive(Debug, Default)]
struct Dirty {
    description: bool,
    health: bool,
    effective_config: bool,
    remote_config_status: bool,
    package_statuses: bool,
}

impl Dirty {
    fn any(&self) -> bool {
        self.description
            || self.health
            || self.effective_config
            || self.remote_config_status
            || self.package_statuses
    }
}

#[derive(Debug, Default)]
struct ReportState {
    description: Option<AgentDescription>,
    health: Option<ComponentHealth>,
    effective_config: Option<EffectiveConfig>,
    remote_config_status: Option<RemoteConfigStatus>,
    package_statuses: Option<PackageStatuses>,
    dirty: Dirty,
    connection_statuses: Vec<ConnectionSettingsStatus>,
    full_state: bool,
    /// Last assembled report, kept until the server has it.
    unacked: Option<AgentToServer>,
}

#[derive(Debug, Default)]
struct PackagesState {
    acknowledged: Option<Vec<u8>>,
    syncing: Option<Vec<u8>>,
    /// Offer whose sync failed. Not retried until the server offers another.
    failed: Option<Vec<u8>>,
}

/// How a package sync ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SyncOutcome {
    Done,
    Failed,
    /// Stopped before reaching an outcome; the offer may be synced again.
    Cancelled,
}

#[derive(Debug, Default)]
struct ConnectionsState {
    current: HashMap<ConnectionKind, ConnectionSettings>,
    /// Last offer per kind that reached an outcome, accepted or rejected.
    resolved: HashMap<ConnectionKind, ConnectionSettings>,
}

/// State owned by one session.
pub(crate) struct SessionState {
    sequencer: Sequencer,
    instance_uid: Mutex<String>,
    report: Mutex<ReportState>,
    connections: Mutex<ConnectionsState>,
    packages: Mutex<PackagesState>,
    urgent: Notify,
}

impl SessionState {
    pub(crate) fn new(settings: &StartSettings) -> Self {
        let report = ReportState {
            description: settings.agent_description.clone(),
            remote_config_status: settings.remote_config_status.clone(),
            full_state: true,
            ..ReportState::default()
        };

        let mut connections = HashMap::new();
        connections.insert(
            ConnectionKind::Opamp,
            ConnectionSettings {
                destination_endpoint: settings.server_url.clone(),
                headers: settings.headers.clone(),
                certificate: None,
            },
        );

        Self {
            sequencer: Sequencer::new(),
            instance_uid: Mutex::new(settings.resolved_instance_uid()),
            report: Mutex::new(report),
            connections: Mutex::new(ConnectionsState {
                current: connections,
                resolved: HashMap::new(),
            }),
            packages: Mutex::new(PackagesState {
                acknowledged: settings.last_packages_hash.clone(),
                ..PackagesState::default()
            }),
            urgent: Notify::new(),
        }
    }

    /// Wakes the exchange loop for an immediate report. A wake-up with no
    /// waiter is stored and skips the next wait once.
    pub(crate) fn urgent(&self) -> &Notify {
        &self.urgent
    }

    pub(crate) fn notify_urgent(&self) {
        self.urgent.notify_one();
    }

    pub(crate) fn instance_uid(&self) -> String {
        self.instance_uid.lock().clone()
    }

    pub(crate) fn set_instance_uid(&self, uid: String) {
        *self.instance_uid.lock() = uid;
    }

    /// Assemble the next report.
    ///
    /// A report that was never delivered is reused with its sequence number,
    /// newer changes merged in. Otherwise a fresh sequence number is taken.
    pub(crate) fn next_report(&self) -> AgentToServer {
        let instance_uid = self.instance_uid();
        let mut state = self.report.lock();

        let mut report = state.unacked.take().unwrap_or_else(|| AgentToServer {
            sequence_num: self.sequencer.next(),
            ..AgentToServer::default()
        });
        report.instance_uid = instance_uid;
        report.capabilities = capabilities::ALL;

        let full = std::mem::take(&mut state.full_state);
        let dirty = std::mem::take(&mut state.dirty);
        if full || dirty.description {
            report.agent_description.clone_from(&state.description);
        }
        if full || dirty.health {
            report.health.clone_from(&state.health);
        }
        if full || dirty.effective_config {
            report.effective_config.clone_from(&state.effective_config);
        }
        if full || dirty.remote_config_status {
            report
                .remote_config_status
                .clone_from(&state.remote_config_status);
        }
        if full || dirty.package_statuses {
            report.package_statuses.clone_from(&state.package_statuses);
        }
        let resolved = std::mem::take(&mut state.connection_statuses);
        report.connection_statuses.extend(resolved);

        state.unacked = Some(report.clone());
        report
    }

    /// The server received the report with this sequence number.
    pub(crate) fn delivered(&self, sequence_num: u64) {
        let mut state = self.report.lock();
        if state
            .unacked
            .as_ref()
            .is_some_and(|r| r.sequence_num == sequence_num)
        {
            state.unacked = None;
        }
    }

    /// Whether a report would carry anything new.
    pub(crate) fn has_pending_changes(&self) -> bool {
        let state = self.report.lock();
        state.full_state
            || state.dirty.any()
            || !state.connection_statuses.is_empty()
            || state.unacked.is_some()
    }

    pub(crate) fn request_full_state(&self) {
        self.report.lock().full_state = true;
    }

    pub(crate) fn set_agent_description(&self, description: AgentDescription) {
        let mut state = self.report.lock();
        state.description = Some(description);
        state.dirty.description = true;
    }

    pub(crate) fn set_health(&self, health: ComponentHealth) {
        let mut state = self.report.lock();
        state.health = Some(health);
        state.dirty.health = true;
    }

    /// Record the effective config, deriving its hash. Returns whether the
    /// hash differs from the previous config.
    pub(crate) fn set_effective_config(&self, mut config: EffectiveConfig) -> bool {
        config.rehash();
        let mut state = self.report.lock();
        if state
            .effective_config
            .as_ref()
            .is_some_and(|current| current.hash == config.hash)
        {
            return false;
        }
        state.effective_config = Some(config);
        state.dirty.effective_config = true;
        true
    }

    pub(crate) fn remote_config_status(&self) -> Option<RemoteConfigStatus> {
        self.report.lock().remote_config_status.clone()
    }

    pub(crate) fn set_remote_config_status(&self, status: RemoteConfigStatus) {
        let mut state = self.report.lock();
        state.remote_config_status = Some(status);
        state.dirty.remote_config_status = true;
    }

    pub(crate) fn record_connection_status(&self, status: ConnectionSettingsStatus) {
        self.report.lock().connection_statuses.push(status);
    }

    pub(crate) fn connection(&self, kind: &ConnectionKind) -> Option<ConnectionSettings> {
        self.connections.lock().current.get(kind).cloned()
    }

    pub(crate) fn set_connection(&self, kind: ConnectionKind, settings: ConnectionSettings) {
        self.connections.lock().current.insert(kind, settings);
    }

    /// Whether `settings` are already in use for `kind` or were the last
    /// offer for it to be accepted or rejected.
    pub(crate) fn is_settled_offer(&self, kind: &ConnectionKind, settings: &ConnectionSettings) -> bool {
        let connections = self.connections.lock();
        connections.current.get(kind) == Some(settings)
            || connections.resolved.get(kind) == Some(settings)
    }

    pub(crate) fn offer_resolved(&self, kind: ConnectionKind, settings: ConnectionSettings) {
        self.connections.lock().resolved.insert(kind, settings);
    }

    pub(crate) fn set_package_status(&self, status: PackageStatus) {
        let mut state = self.report.lock();
        let statuses = state.package_statuses.get_or_insert_with(PackageStatuses::default);
        statuses.packages.insert(status.name.clone(), status);
        state.dirty.package_statuses = true;
    }

    pub(crate) fn set_packages_error(&self, error_message: String) {
        let mut state = self.report.lock();
        state
            .package_statuses
            .get_or_insert_with(PackageStatuses::default)
            .error_message = error_message;
        state.dirty.package_statuses = true;
    }

    /// Claim a package offer for syncing. Returns `false` if this offer was
    /// already acknowledged, is being synced, or failed.
    pub(crate) fn begin_package_sync(&self, all_packages_hash: &[u8]) -> bool {
        let mut packages = self.packages.lock();
        let seen = |h: &Option<Vec<u8>>| h.as_deref() == Some(all_packages_hash);
        if seen(&packages.acknowledged) || seen(&packages.syncing) || seen(&packages.failed) {
            return false;
        }
        packages.syncing = Some(all_packages_hash.to_vec());
        true
    }

    /// Finish syncing an offer, acknowledging it when done.
    pub(crate) fn end_package_sync(&self, all_packages_hash: &[u8], outcome: SyncOutcome) {
        {
            let mut packages = self.packages.lock();
            if packages.syncing.as_deref() == Some(all_packages_hash) {
                packages.syncing = None;
            }
            match outcome {
                SyncOutcome::Done => {
                    packages.acknowledged = Some(all_packages_hash.to_vec());
                    packages.failed = None;
                }
                SyncOutcome::Failed => packages.failed = Some(all_packages_hash.to_vec()),
                SyncOutcome::Cancelled => {}
            }
        }
        if outcome == SyncOutcome::Done {
            let mut state = self.report.lock();
            let statuses = state.package_statuses.get_or_insert_with(PackageStatuses::default);
            statuses.server_provided_all_packages_hash = all_packages_hash.to_vec();
            statuses.error_message.clear();
            state.dirty.package_statuses = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use opamp_core::protocol::{AgentConfigMap, ConnectionStatus, KeyValue, RemoteConfigStatuses};

    use super::*;

    fn state() -> SessionState {
        let description = AgentDescription {
            identifying_attributes: vec![KeyValue::string("service.name", "collector")],
            non_identifying_attributes: vec![],
        };
        SessionState::new(
            &StartSettings::new("http://127.0.0.1:4320/v1/opamp")
                .with_instance_uid("agent-1")
                .with_agent_description(description),
        )
    }

    #[test]
    fn test_first_report_carries_full_state() {
        let state = state();
        let first = state.next_report();
        assert_eq!(first.sequence_num, 0);
        assert_eq!(first.instance_uid, "agent-1");
        assert!(first.agent_description.is_some());
        assert_eq!(first.capabilities, capabilities::ALL);
        state.delivered(0);

        let second = state.next_report();
        assert_eq!(second.sequence_num, 1);
        assert!(second.agent_description.is_none());
    }

    #[test]
    fn test_undelivered_report_keeps_sequence_and_merges() {
        let state = state();
        let first = state.next_report();
        state.set_health(ComponentHealth {
            healthy: true,
            ..Default::default()
        });

        let retry = state.next_report();
        assert_eq!(retry.sequence_num, first.sequence_num);
        assert!(retry.agent_description.is_some());
        assert!(retry.health.is_some());

        state.delivered(retry.sequence_num);
        assert_eq!(state.next_report().sequence_num, 1);
    }

    #[test]
    fn test_stale_delivery_is_ignored() {
        let state = state();
        let _ = state.next_report();
        state.delivered(0);
        let pending = state.next_report();
        state.delivered(0);
        assert!(state.has_pending_changes());
        assert_eq!(state.next_report().sequence_num, pending.sequence_num);
    }

    #[test]
    fn test_effective_config_change_detection() {
        let state = state();
        let cfg = EffectiveConfig {
            config_map: AgentConfigMap::single("main.yaml", "text/yaml", "a: 1"),
            hash: vec![9, 9, 9],
        };
        assert!(state.set_effective_config(cfg.clone()));
        assert!(!state.set_effective_config(cfg));

        let report = state.next_report();
        let sent = report.effective_config.unwrap();
        assert_eq!(sent.hash.len(), 32);
    }

    #[test]
    fn test_connection_statuses_reported_once() {
        let state = state();
        state.delivered(state.next_report().sequence_num);

        state.record_connection_status(ConnectionSettingsStatus {
            kind: ConnectionKind::Opamp,
            status: ConnectionStatus::Rejected,
            error_message: "bad cert".into(),
        });
        let report = state.next_report();
        assert_eq!(report.connection_statuses.len(), 1);
        state.delivered(report.sequence_num);

        assert!(state.next_report().connection_statuses.is_empty());
    }

    #[test]
    fn test_full_state_request() {
        let state = state();
        state.set_remote_config_status(RemoteConfigStatus {
            last_remote_config_hash: vec![1],
            status: RemoteConfigStatuses::Applied,
            error_message: String::new(),
        });
        state.delivered(state.next_report().sequence_num);

        state.request_full_state();
        let report = state.next_report();
        assert!(report.agent_description.is_some());
        assert!(report.remote_config_status.is_some());
    }

    #[test]
    fn test_package_offer_claimed_once() {
        let state = state();
        assert!(state.begin_package_sync(&[1]));
        assert!(!state.begin_package_sync(&[1]));

        state.end_package_sync(&[1], SyncOutcome::Cancelled);
        assert!(state.begin_package_sync(&[1]));

        state.end_package_sync(&[1], SyncOutcome::Done);
        assert!(!state.begin_package_sync(&[1]));
        assert!(state.begin_package_sync(&[2]));

        let statuses = state.next_report().package_statuses.unwrap();
        assert_eq!(statuses.server_provided_all_packages_hash, vec![1]);
    }

    #[test]
    fn test_failed_package_offer_waits_for_a_new_one() {
        let state = state();
        assert!(state.begin_package_sync(&[1]));
        state.end_package_sync(&[1], SyncOutcome::Failed);
        assert!(!state.begin_package_sync(&[1]));

        assert!(state.begin_package_sync(&[2]));
        state.end_package_sync(&[2], SyncOutcome::Done);
        assert!(state.begin_package_sync(&[1]));
    }

    #[test]
    fn test_settled_connection_offers() {
        let state = state();
        let current = state.connection(&ConnectionKind::Opamp).unwrap();
        assert!(state.is_settled_offer(&ConnectionKind::Opamp, &current));

        let offered = ConnectionSettings {
            destination_endpoint: "http://127.0.0.1:1/v1/opamp".into(),
            ..Default::default()
        };
        assert!(!state.is_settled_offer(&ConnectionKind::Opamp, &offered));
        state.offer_resolved(ConnectionKind::Opamp, offered.clone());
        assert!(state.is_settled_offer(&ConnectionKind::Opamp, &offered));
        assert_eq!(state.connection(&ConnectionKind::Opamp), Some(current));

        let other = ConnectionKind::Other("backup".into());
        assert!(!state.is_settled_offer(&other, &offered));
    }

    #[test]
    fn test_resumed_packages_hash() {
        let state = SessionState::new(
            &StartSettings::new("http://x").with_last_packages_hash(vec![7]),
        );
        assert!(!state.begin_package_sync(&[7]));
    }
}
