//! Wire messages exchanged between the agent and the management server.
//!
//! `AgentToServer` is the agent report, `ServerToAgent` the server
//! instruction. Both are exchanged verbatim as JSON documents; every optional
//! part is omitted from the wire when absent.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Typed attribute value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum AnyValue {
    String(String),
    Int(i64),
    Double(f64),
    Bool(bool),
    Bytes(Vec<u8>),
}

/// Named attribute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyValue {
    pub key: String,
    pub value: AnyValue,
}

impl KeyValue {
    /// Create a string-valued attribute.
    #[must_use]
    pub fn string(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: AnyValue::String(value.into()),
        }
    }
}

/// Attributes describing the agent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentDescription {
    /// Attributes that identify the agent (e.g. `service.name`, `host.name`).
    #[serde(default)]
    pub identifying_attributes: Vec<KeyValue>,
    /// Informational attributes.
    #[serde(default)]
    pub non_identifying_attributes: Vec<KeyValue>,
}

impl AgentDescription {
    /// Whether the description carries no attributes at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.identifying_attributes.is_empty() && self.non_identifying_attributes.is_empty()
    }
}

/// A single named configuration file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentConfigFile {
    #[serde(default)]
    pub body: Vec<u8>,
    #[serde(default)]
    pub content_type: String,
}

/// Configuration files keyed by name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentConfigMap {
    #[serde(default)]
    pub config_map: BTreeMap<String, AgentConfigFile>,
}

impl AgentConfigMap {
    /// Build a map holding one file.
    #[must_use]
    pub fn single(
        name: impl Into<String>,
        content_type: impl Into<String>,
        body: impl Into<Vec<u8>>,
    ) -> Self {
        let mut config_map = BTreeMap::new();
        config_map.insert(
            name.into(),
            AgentConfigFile {
                body: body.into(),
                content_type: content_type.into(),
            },
        );
        Self { config_map }
    }
}

/// The configuration actually in force on the agent.
///
/// The hash is derived from `config_map`; see [`EffectiveConfig::new`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EffectiveConfig {
    #[serde(default)]
    pub config_map: AgentConfigMap,
    #[serde(default)]
    pub hash: Vec<u8>,
}

impl Default for EffectiveConfig {
    fn default() -> Self {
        Self::new(AgentConfigMap::default())
    }
}

/// Remote configuration offered by the server.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentRemoteConfig {
    #[serde(default)]
    pub config: AgentConfigMap,
    #[serde(default)]
    pub config_hash: Vec<u8>,
}

/// Outcome of applying a remote config.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteConfigStatuses {
    #[default]
    Unset,
    Applied,
    Applying,
    Failed,
}

/// Status of the most recently received remote config.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteConfigStatus {
    #[serde(default)]
    pub last_remote_config_hash: Vec<u8>,
    #[serde(default)]
    pub status: RemoteConfigStatuses,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error_message: String,
}

/// Agent health.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub healthy: bool,
    #[serde(default)]
    pub start_time_unix_nano: u64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub last_error: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub status: String,
}

/// TLS material delivered with a connection settings offer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsCertificate {
    #[serde(default)]
    pub public_key: Vec<u8>,
    #[serde(default)]
    pub private_key: Vec<u8>,
    #[serde(default)]
    pub ca_public_key: Vec<u8>,
}

/// Where and how to connect for one channel.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionSettings {
    #[serde(default)]
    pub destination_endpoint: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate: Option<TlsCertificate>,
}

/// Connection settings offered by the server, per channel.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionSettingsOffers {
    #[serde(default)]
    pub hash: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opamp: Option<ConnectionSettings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub own_metrics: Option<ConnectionSettings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub own_traces: Option<ConnectionSettings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub own_logs: Option<ConnectionSettings>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub other_connections: BTreeMap<String, ConnectionSettings>,
}

impl ConnectionSettingsOffers {
    /// Flatten the offers into `(kind, settings)` pairs, primary channel first.
    #[must_use]
    pub fn into_offers(self) -> Vec<(ConnectionKind, ConnectionSettings)> {
        let mut offers = Vec::new();
        if let Some(settings) = self.opamp {
            offers.push((ConnectionKind::Opamp, settings));
        }
        let own = [
            (OwnTelemetryKind::Metrics, self.own_metrics),
            (OwnTelemetryKind::Traces, self.own_traces),
            (OwnTelemetryKind::Logs, self.own_logs),
        ];
        for (kind, settings) in own {
            if let Some(settings) = settings {
                offers.push((ConnectionKind::OwnTelemetry(kind), settings));
            }
        }
        offers.extend(
            self.other_connections
                .into_iter()
                .map(|(name, settings)| (ConnectionKind::Other(name), settings)),
        );
        offers
    }
}

/// Kind of the agent's own telemetry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OwnTelemetryKind {
    Metrics,
    Traces,
    Logs,
}

/// Channel a connection settings offer applies to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "name", rename_all = "snake_case")]
pub enum ConnectionKind {
    /// The management channel itself.
    Opamp,
    /// Destination for the agent's own telemetry.
    OwnTelemetry(OwnTelemetryKind),
    /// Any other named destination.
    Other(String),
}

impl std::fmt::Display for ConnectionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Opamp => f.write_str("opamp"),
            Self::OwnTelemetry(OwnTelemetryKind::Metrics) => f.write_str("own_metrics"),
            Self::OwnTelemetry(OwnTelemetryKind::Traces) => f.write_str("own_traces"),
            Self::OwnTelemetry(OwnTelemetryKind::Logs) => f.write_str("own_logs"),
            Self::Other(name) => write!(f, "other:{name}"),
        }
    }
}

/// Resolution of a connection settings offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Accepted,
    Rejected,
}

/// Acknowledgement of one connection settings offer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionSettingsStatus {
    pub kind: ConnectionKind,
    pub status: ConnectionStatus,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error_message: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PackageType {
    #[default]
    TopLevel,
    Addon,
}

/// Downloadable package artifact.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadableFile {
    pub download_url: String,
    #[serde(default)]
    pub content_hash: Vec<u8>,
    #[serde(default)]
    pub signature: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageAvailable {
    #[serde(default)]
    pub package_type: PackageType,
    #[serde(default)]
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<DownloadableFile>,
    #[serde(default)]
    pub hash: Vec<u8>,
}

/// Packages the server has available for the agent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackagesAvailable {
    #[serde(default)]
    pub packages: BTreeMap<String, PackageAvailable>,
    #[serde(default)]
    pub all_packages_hash: Vec<u8>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PackageState {
    #[default]
    InstallPending,
    Installing,
    Installed,
    InstallFailed,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageStatus {
    pub name: String,
    #[serde(default)]
    pub agent_has_version: String,
    #[serde(default)]
    pub agent_has_hash: Vec<u8>,
    #[serde(default)]
    pub server_offered_version: String,
    #[serde(default)]
    pub server_offered_hash: Vec<u8>,
    #[serde(default)]
    pub status: PackageState,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error_message: String,
}

/// Package sync state reported to the server.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageStatuses {
    #[serde(default)]
    pub packages: BTreeMap<String, PackageStatus>,
    #[serde(default)]
    pub server_provided_all_packages_hash: Vec<u8>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error_message: String,
}

/// New identity assigned by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentIdentification {
    pub new_instance_uid: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandType {
    Restart,
}

/// Ad-hoc command for the agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerToAgentCommand {
    pub command_type: CommandType,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorResponseType {
    #[default]
    Unknown,
    BadRequest,
    /// Server is temporarily unable to process the report; retry later.
    Unavailable,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryInfo {
    pub retry_after_nanoseconds: u64,
}

/// Error reported by the server in response to a report.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerErrorResponse {
    #[serde(default)]
    pub error_type: ErrorResponseType,
    #[serde(default)]
    pub error_message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_info: Option<RetryInfo>,
}

/// Capability bits advertised in every report.
pub mod capabilities {
    pub const REPORTS_STATUS: u64 = 0x1;
    pub const ACCEPTS_REMOTE_CONFIG: u64 = 0x2;
    pub const REPORTS_EFFECTIVE_CONFIG: u64 = 0x4;
    pub const ACCEPTS_PACKAGES: u64 = 0x8;
    pub const REPORTS_PACKAGE_STATUSES: u64 = 0x10;
    pub const ACCEPTS_OPAMP_CONNECTION_SETTINGS: u64 = 0x100;
    pub const ACCEPTS_OTHER_CONNECTION_SETTINGS: u64 = 0x200;
    pub const ACCEPTS_RESTART_COMMAND: u64 = 0x400;
    pub const REPORTS_HEALTH: u64 = 0x800;

    /// Everything this client knows how to handle.
    pub const ALL: u64 = REPORTS_STATUS
        | ACCEPTS_REMOTE_CONFIG
        | REPORTS_EFFECTIVE_CONFIG
        | ACCEPTS_PACKAGES
        | REPORTS_PACKAGE_STATUSES
        | ACCEPTS_OPAMP_CONNECTION_SETTINGS
        | ACCEPTS_OTHER_CONNECTION_SETTINGS
        | ACCEPTS_RESTART_COMMAND
        | REPORTS_HEALTH;
}

/// Agent report.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentToServer {
    pub instance_uid: String,
    pub sequence_num: u64,
    #[serde(default)]
    pub capabilities: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_description: Option<AgentDescription>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health: Option<ComponentHealth>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub effective_config: Option<EffectiveConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_config_status: Option<RemoteConfigStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package_statuses: Option<PackageStatuses>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub connection_statuses: Vec<ConnectionSettingsStatus>,
}

/// Server instruction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerToAgent {
    #[serde(default)]
    pub instance_uid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_response: Option<ServerErrorResponse>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_config: Option<AgentRemoteConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_settings: Option<ConnectionSettingsOffers>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub packages_available: Option<PackagesAvailable>,
    /// Ask the agent to include its full state in the next report.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub report_full_state: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_identification: Option<AgentIdentification>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<ServerToAgentCommand>,
}
