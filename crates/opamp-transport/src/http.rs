//! Polling transport over HTTP.
//!
//! Each exchange is one `POST` carrying a serialized report; the response
//! body, when non-empty, is the server's instruction. The session decides
//! when to exchange; this type only performs the request and keeps the
//! polling interval.

use std::time::Duration;

use async_trait::async_trait;
use opamp_core::{
    AgentToServer, DEFAULT_POLLING_INTERVAL, PollingTransport, ServerToAgent, StartSettings,
    TlsSettings, TransportError,
    protocol::{ConnectionSettings, TlsCertificate},
};
use parking_lot::{Mutex, RwLock};
use reqwest::{
    Client, StatusCode, Url,
    header::{CONTENT_ENCODING, CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue, RETRY_AFTER},
};
use tokio_util::sync::CancellationToken;

use crate::codec::{self, GZIP_ENCODING};

/// Per-request timeout.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Where and how requests are sent. Replaced wholesale on reconfiguration.
#[derive(Clone)]
struct Endpoint {
    url: Url,
    client: Client,
    settings: ConnectionSettings,
}

/// HTTP polling sender.
pub struct HttpSender {
    endpoint: RwLock<Option<Endpoint>>,
    tls: RwLock<TlsSettings>,
    compress: RwLock<bool>,
    polling_interval: Mutex<Duration>,
}

impl Default for HttpSender {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpSender {
    /// Create an unconfigured sender.
    #[must_use]
    pub fn new() -> Self {
        Self {
            endpoint: RwLock::new(None),
            tls: RwLock::new(TlsSettings::default()),
            compress: RwLock::new(false),
            polling_interval: Mutex::new(DEFAULT_POLLING_INTERVAL),
        }
    }

    /// Settings currently used for requests.
    #[must_use]
    pub fn current_settings(&self) -> Option<ConnectionSettings> {
        self.endpoint.read().as_ref().map(|e| e.settings.clone())
    }

    fn build_endpoint(
        settings: &ConnectionSettings,
        tls: &TlsSettings,
    ) -> Result<Endpoint, TransportError> {
        let url = parse_url(&settings.destination_endpoint)?;

        let mut builder = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .default_headers(header_map(settings)?)
            .danger_accept_invalid_certs(tls.insecure_skip_verify);

        if let Some(pem) = &tls.ca_pem {
            let cert = reqwest::Certificate::from_pem(pem.as_bytes())
                .map_err(|e| TransportError::InvalidTls(e.to_string()))?;
            builder = builder.add_root_certificate(cert);
        }
        if let Some(cert) = &settings.certificate {
            if !cert.ca_public_key.is_empty() {
                let ca = reqwest::Certificate::from_pem(&cert.ca_public_key)
                    .map_err(|e| TransportError::InvalidTls(e.to_string()))?;
                builder = builder.add_root_certificate(ca);
            }
            if let Some(identity) = client_identity(cert)? {
                builder = builder.identity(identity);
            }
        }

        let client = builder
            .build()
            .map_err(|e| TransportError::InvalidTls(format!("Failed to create HTTP client: {e}")))?;

        Ok(Endpoint {
            url,
            client,
            settings: settings.clone(),
        })
    }

    fn snapshot(&self) -> Result<(Endpoint, bool), TransportError> {
        let endpoint = self
            .endpoint
            .read()
            .clone()
            .ok_or_else(|| TransportError::InvalidEndpoint("sender is not configured".into()))?;
        Ok((endpoint, *self.compress.read()))
    }
}

#[async_trait]
impl PollingTransport for HttpSender {
    fn configure(&self, settings: &StartSettings) -> Result<(), TransportError> {
        let connection = ConnectionSettings {
            destination_endpoint: settings.server_url.clone(),
            headers: settings.headers.clone(),
            certificate: None,
        };
        let endpoint = Self::build_endpoint(&connection, &settings.tls)?;

        *self.endpoint.write() = Some(endpoint);
        *self.tls.write() = settings.tls.clone();
        *self.compress.write() = settings.enable_compression;
        if let Some(interval) = settings.polling_interval {
            self.set_polling_interval(interval);
        }
        tracing::debug!(
            endpoint = %settings.server_url,
            compression = settings.enable_compression,
            "HTTP sender configured"
        );
        Ok(())
    }

    async fn exchange(
        &self,
        report: &AgentToServer,
        cancel: &CancellationToken,
    ) -> Result<Option<ServerToAgent>, TransportError> {
        let (endpoint, compress) = self.snapshot()?;
        let body = codec::encode_report(report, compress)?;

        let mut request = endpoint
            .client
            .post(endpoint.url.clone())
            .header(CONTENT_TYPE, codec::CONTENT_TYPE)
            .body(body);
        if compress {
            request = request.header(CONTENT_ENCODING, GZIP_ENCODING);
        }

        let response = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(TransportError::Cancelled),
            res = request.send() => res.map_err(|e| TransportError::Connect(e.to_string()))?,
        };

        let status = response.status();
        if status == StatusCode::SERVICE_UNAVAILABLE || status == StatusCode::TOO_MANY_REQUESTS {
            return Err(TransportError::Unavailable {
                retry_after: retry_after(response.headers()),
            });
        }
        if !status.is_success() {
            return Err(TransportError::HttpStatus {
                status: status.as_u16(),
            });
        }

        let compressed = response
            .headers()
            .get(CONTENT_ENCODING)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.eq_ignore_ascii_case(GZIP_ENCODING));

        let bytes = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(TransportError::Cancelled),
            res = response.bytes() => res.map_err(|e| TransportError::Connect(e.to_string()))?,
        };

        codec::decode_instruction(&bytes, compressed)
    }

    fn apply_settings(
        &self,
        settings: &ConnectionSettings,
    ) -> Result<ConnectionSettings, TransportError> {
        let current = self
            .current_settings()
            .ok_or_else(|| TransportError::InvalidEndpoint("sender is not configured".into()))?;

        let mut merged = settings.clone();
        if merged.destination_endpoint.is_empty() {
            merged.destination_endpoint = current.destination_endpoint.clone();
        }
        let tls = self.tls.read().clone();
        let endpoint = Self::build_endpoint(&merged, &tls)?;

        let previous = self
            .endpoint
            .write()
            .replace(endpoint)
            .map_or(current, |e| e.settings);
        tracing::debug!(
            from = %previous.destination_endpoint,
            to = %merged.destination_endpoint,
            "HTTP sender switched connection settings"
        );
        Ok(previous)
    }

    fn polling_interval(&self) -> Duration {
        *self.polling_interval.lock()
    }

    fn set_polling_interval(&self, interval: Duration) {
        *self.polling_interval.lock() = interval;
    }
}

fn parse_url(raw: &str) -> Result<Url, TransportError> {
    let url = Url::parse(raw).map_err(|e| TransportError::InvalidEndpoint(format!("{raw}: {e}")))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(TransportError::InvalidEndpoint(format!(
            "{raw}: unsupported scheme {other}"
        ))),
    }
}

fn header_map(settings: &ConnectionSettings) -> Result<HeaderMap, TransportError> {
    let mut headers = HeaderMap::new();
    for (name, value) in &settings.headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| TransportError::InvalidHeader(format!("{name}: {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| TransportError::InvalidHeader(format!("{name}: {e}")))?;
        headers.insert(name, value);
    }
    Ok(headers)
}

/// Client certificate from an offered PEM key pair. Both halves or neither.
fn client_identity(cert: &TlsCertificate) -> Result<Option<reqwest::Identity>, TransportError> {
    match (cert.public_key.is_empty(), cert.private_key.is_empty()) {
        (true, true) => Ok(None),
        (false, false) => {
            let mut pem = cert.private_key.clone();
            pem.push(b'\n');
            pem.extend_from_slice(&cert.public_key);
            reqwest::Identity::from_pem(&pem)
                .map(Some)
                .map_err(|e| TransportError::InvalidTls(format!("client certificate: {e}")))
        }
        _ => Err(TransportError::InvalidTls(
            "client certificate needs both a public and a private key".into(),
        )),
    }
}

/// `Retry-After` in delta-seconds form. HTTP-date values are ignored.
fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}
