//! Session start settings.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    callbacks::Callbacks,
    error::{ClientError, ConfigError},
    protocol::{AgentDescription, RemoteConfigStatus},
};

/// Default wait between polling exchanges.
pub const DEFAULT_POLLING_INTERVAL: Duration = Duration::from_secs(30);

/// TLS material for the management channel. Opaque to the session; only the
/// transport interprets it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TlsSettings {
    /// Extra PEM-encoded root certificate to trust.
    #[serde(default)]
    pub ca_pem: Option<String>,
    /// Skip server certificate verification (testing only).
    #[serde(default)]
    pub insecure_skip_verify: bool,
}

/// Everything a session needs to start.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct StartSettings {
    /// Management server endpoint.
    pub server_url: String,

    /// Gzip-compress outbound reports.
    #[serde(default)]
    pub enable_compression: bool,

    /// Agent identity. A fresh UUID is used when unset.
    #[serde(default)]
    pub instance_uid: Option<String>,

    #[serde(default)]
    pub agent_description: Option<AgentDescription>,

    /// Status saved by a previous session, to resume after restart.
    #[serde(default)]
    pub remote_config_status: Option<RemoteConfigStatus>,

    /// Last packages hash the agent acknowledged in a previous session.
    #[serde(default)]
    pub last_packages_hash: Option<Vec<u8>>,

    /// Extra headers for every request.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,

    #[serde(default)]
    pub tls: TlsSettings,

    /// Overrides the transport's default polling interval.
    #[serde(default)]
    pub polling_interval: Option<Duration>,

    #[serde(skip)]
    pub callbacks: Option<Arc<dyn Callbacks>>,
}

impl std::fmt::Debug for StartSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StartSettings")
            .field("server_url", &self.server_url)
            .field("enable_compression", &self.enable_compression)
            .field("instance_uid", &self.instance_uid)
            .field("agent_description", &self.agent_description)
            .field("remote_config_status", &self.remote_config_status)
            .field("headers", &self.headers.keys().collect::<Vec<_>>())
            .field("tls", &self.tls)
            .field("polling_interval", &self.polling_interval)
            .field("callbacks", &self.callbacks.is_some())
            .finish_non_exhaustive()
    }
}

impl StartSettings {
    /// Settings for the given server.
    #[must_use]
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_callbacks(mut self, callbacks: Arc<dyn Callbacks>) -> Self {
        self.callbacks = Some(callbacks);
        self
    }

    #[must_use]
    pub fn with_compression(mut self, enabled: bool) -> Self {
        self.enable_compression = enabled;
        self
    }

    #[must_use]
    pub fn with_instance_uid(mut self, instance_uid: impl Into<String>) -> Self {
        self.instance_uid = Some(instance_uid.into());
        self
    }

    #[must_use]
    pub fn with_agent_description(mut self, description: AgentDescription) -> Self {
        self.agent_description = Some(description);
        self
    }

    #[must_use]
    pub fn with_remote_config_status(mut self, status: RemoteConfigStatus) -> Self {
        self.remote_config_status = Some(status);
        self
    }

    #[must_use]
    pub fn with_last_packages_hash(mut self, hash: Vec<u8>) -> Self {
        self.last_packages_hash = Some(hash);
        self
    }

    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_tls(mut self, tls: TlsSettings) -> Self {
        self.tls = tls;
        self
    }

    #[must_use]
    pub fn with_polling_interval(mut self, interval: Duration) -> Self {
        self.polling_interval = Some(interval);
        self
    }

    /// Check the settings a session cannot start without.
    ///
    /// # Errors
    /// Returns error if the server address or the callbacks are missing.
    pub fn validate(&self) -> Result<(), ClientError> {
        if self.server_url.trim().is_empty() {
            return Err(ClientError::MissingServerAddress);
        }
        if self.callbacks.is_none() {
            return Err(ClientError::MissingCallbacks);
        }
        Ok(())
    }

    /// The configured identity, or a fresh one.
    #[must_use]
    pub fn resolved_instance_uid(&self) -> String {
        self.instance_uid
            .clone()
            .filter(|uid| !uid.is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string())
    }

    /// Load settings from environment variables.
    ///
    /// Environment variables:
    /// - `OPAMP_SERVER_URL` (required): management server endpoint
    /// - `OPAMP_ENABLE_COMPRESSION` (optional): "true" to gzip reports
    /// - `OPAMP_INSTANCE_UID` (optional): agent identity
    /// - `OPAMP_POLLING_INTERVAL_MS` (optional): polling interval in milliseconds
    /// - `OPAMP_INSECURE_TLS` (optional): "true" to skip certificate verification
    ///
    /// Callbacks are not part of the environment and must be set afterwards.
    ///
    /// # Errors
    /// Returns error if the server URL is missing or a value does not parse.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let server_url = lookup("OPAMP_SERVER_URL")
            .ok_or_else(|| ConfigError::MissingEnvVar("OPAMP_SERVER_URL".to_string()))?;

        let mut settings = Self::new(server_url);

        settings.enable_compression = lookup("OPAMP_ENABLE_COMPRESSION")
            .is_some_and(|v| v.eq_ignore_ascii_case("true"));

        settings.instance_uid = lookup("OPAMP_INSTANCE_UID");

        if let Some(raw) = lookup("OPAMP_POLLING_INTERVAL_MS") {
            let millis: u64 = raw.parse().map_err(|_| ConfigError::InvalidValue {
                name: "OPAMP_POLLING_INTERVAL_MS".to_string(),
                value: raw.clone(),
            })?;
            settings.polling_interval = Some(Duration::from_millis(millis));
        }

        settings.tls.insecure_skip_verify =
            lookup("OPAMP_INSECURE_TLS").is_some_and(|v| v.eq_ignore_ascii_case("true"));

        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::callbacks::NoopCallbacks;

    fn lookup_from(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_validate_requires_address_and_callbacks() {
        let missing_url = StartSettings::default().with_callbacks(Arc::new(NoopCallbacks));
        assert!(matches!(
            missing_url.validate(),
            Err(ClientError::MissingServerAddress)
        ));

        let missing_callbacks = StartSettings::new("http://localhost:4320/v1/opamp");
        assert!(matches!(
            missing_callbacks.validate(),
            Err(ClientError::MissingCallbacks)
        ));

        let ok = missing_callbacks.with_callbacks(Arc::new(NoopCallbacks));
        assert!(ok.validate().is_ok());
    }

    #[test]
    fn test_resolved_instance_uid() {
        let fixed = StartSettings::new("http://x").with_instance_uid("agent-7");
        assert_eq!(fixed.resolved_instance_uid(), "agent-7");

        let generated = StartSettings::new("http://x");
        let a = generated.resolved_instance_uid();
        let b = generated.resolved_instance_uid();
        assert_ne!(a, b);
        assert!(Uuid::parse_str(&a).is_ok());
    }

    #[test]
    fn test_from_lookup() {
        let settings = StartSettings::from_lookup(lookup_from(&[
            ("OPAMP_SERVER_URL", "http://127.0.0.1:4320/v1/opamp"),
            ("OPAMP_ENABLE_COMPRESSION", "TRUE"),
            ("OPAMP_POLLING_INTERVAL_MS", "250"),
        ]))
        .unwrap();

        assert_eq!(settings.server_url, "http://127.0.0.1:4320/v1/opamp");
        assert!(settings.enable_compression);
        assert_eq!(settings.polling_interval, Some(Duration::from_millis(250)));
        assert!(!settings.tls.insecure_skip_verify);
        assert!(settings.callbacks.is_none());
    }

    #[test]
    fn test_from_lookup_errors() {
        assert!(matches!(
            StartSettings::from_lookup(lookup_from(&[])),
            Err(ConfigError::MissingEnvVar(_))
        ));
        assert!(matches!(
            StartSettings::from_lookup(lookup_from(&[
                ("OPAMP_SERVER_URL", "http://x"),
                ("OPAMP_POLLING_INTERVAL_MS", "soon"),
            ])),
            Err(ConfigError::InvalidValue { .. })
        ));
    }
}
