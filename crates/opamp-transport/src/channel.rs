//! In-process duplex transport.
//!
//! A [`ChannelNetwork`] maps endpoint names to listeners. A
//! [`ChannelTransport`] connects to the listener registered under its
//! configured endpoint and exchanges messages over bounded channels. Useful
//! for embedding a server in the same process and for tests.

use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use opamp_core::{
    AgentToServer, DEFAULT_POLLING_INTERVAL, ServerToAgent, StartSettings, StreamingTransport,
    TransportError, protocol::ConnectionSettings,
};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Buffered messages per direction.
const CHANNEL_CAPACITY: usize = 32;

/// Registry of listeners keyed by endpoint.
#[derive(Clone, Default)]
pub struct ChannelNetwork {
    listeners: Arc<Mutex<HashMap<String, mpsc::UnboundedSender<ServerConnection>>>>,
}

impl ChannelNetwork {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Start accepting connections on `endpoint`, replacing any previous
    /// listener there.
    pub fn listen(&self, endpoint: impl Into<String>) -> ChannelListener {
        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners.lock().insert(endpoint.into(), tx);
        ChannelListener { incoming: rx }
    }

    fn dial(&self, endpoint: &str, connection: ServerConnection) -> Result<(), TransportError> {
        let listeners = self.listeners.lock();
        let listener = listeners
            .get(endpoint)
            .ok_or_else(|| TransportError::Connect(format!("no listener at {endpoint}")))?;
        listener
            .send(connection)
            .map_err(|_| TransportError::Connect(format!("listener at {endpoint} is closed")))
    }
}

/// Server side: accepts connections.
pub struct ChannelListener {
    incoming: mpsc::UnboundedReceiver<ServerConnection>,
}

impl ChannelListener {
    /// Wait for the next client. `None` once the network is gone.
    pub async fn accept(&mut self) -> Option<ServerConnection> {
        self.incoming.recv().await
    }
}

/// Server side of one client connection.
pub struct ServerConnection {
    /// Settings the client connected with.
    pub settings: ConnectionSettings,
    reports: mpsc::Receiver<AgentToServer>,
    instructions: mpsc::Sender<ServerToAgent>,
}

impl ServerConnection {
    /// Next report from the client. `None` once the client disconnected.
    pub async fn next_report(&mut self) -> Option<AgentToServer> {
        self.reports.recv().await
    }

    /// Push an instruction to the client.
    ///
    /// # Errors
    /// Returns error if the client disconnected.
    pub async fn send(&self, instruction: ServerToAgent) -> Result<(), TransportError> {
        self.instructions
            .send(instruction)
            .await
            .map_err(|_| TransportError::Closed)
    }
}

/// Client side of an open connection.
struct Link {
    reports: mpsc::Sender<AgentToServer>,
}

/// Client transport over a [`ChannelNetwork`].
pub struct ChannelTransport {
    network: ChannelNetwork,
    settings: Mutex<ConnectionSettings>,
    link: Mutex<Option<Link>>,
    instructions: tokio::sync::Mutex<Option<mpsc::Receiver<ServerToAgent>>>,
    retry_interval: Mutex<Duration>,
}

impl ChannelTransport {
    #[must_use]
    pub fn new(network: ChannelNetwork) -> Self {
        Self {
            network,
            settings: Mutex::new(ConnectionSettings::default()),
            link: Mutex::new(None),
            instructions: tokio::sync::Mutex::new(None),
            retry_interval: Mutex::new(DEFAULT_POLLING_INTERVAL),
        }
    }

    /// Settings the next `connect` uses.
    #[must_use]
    pub fn current_settings(&self) -> ConnectionSettings {
        self.settings.lock().clone()
    }
}

#[async_trait]
impl StreamingTransport for ChannelTransport {
    fn configure(&self, settings: &StartSettings) -> Result<(), TransportError> {
        if settings.server_url.is_empty() {
            return Err(TransportError::InvalidEndpoint("empty endpoint".into()));
        }
        *self.settings.lock() = ConnectionSettings {
            destination_endpoint: settings.server_url.clone(),
            headers: settings.headers.clone(),
            certificate: None,
        };
        if let Some(interval) = settings.polling_interval {
            *self.retry_interval.lock() = interval;
        }
        Ok(())
    }

    async fn connect(&self, cancel: &CancellationToken) -> Result<(), TransportError> {
        if cancel.is_cancelled() {
            return Err(TransportError::Cancelled);
        }
        let settings = self.current_settings();
        let (report_tx, report_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (instruction_tx, instruction_rx) = mpsc::channel(CHANNEL_CAPACITY);

        self.network.dial(
            &settings.destination_endpoint,
            ServerConnection {
                settings: settings.clone(),
                reports: report_rx,
                instructions: instruction_tx,
            },
        )?;

        *self.link.lock() = Some(Link { reports: report_tx });
        *self.instructions.lock().await = Some(instruction_rx);
        tracing::debug!(endpoint = %settings.destination_endpoint, "channel transport connected");
        Ok(())
    }

    async fn send(
        &self,
        report: &AgentToServer,
        cancel: &CancellationToken,
    ) -> Result<(), TransportError> {
        let sender = self
            .link
            .lock()
            .as_ref()
            .map(|link| link.reports.clone())
            .ok_or(TransportError::Closed)?;

        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(TransportError::Cancelled),
            res = sender.send(report.clone()) => res.map_err(|_| TransportError::Closed),
        }
    }

    async fn receive(&self) -> Result<Option<ServerToAgent>, TransportError> {
        let mut guard = self.instructions.lock().await;
        let rx = guard.as_mut().ok_or(TransportError::Closed)?;
        Ok(rx.recv().await)
    }

    fn apply_settings(
        &self,
        settings: &ConnectionSettings,
    ) -> Result<ConnectionSettings, TransportError> {
        let mut current = self.settings.lock();
        let mut next = settings.clone();
        if next.destination_endpoint.is_empty() {
            next.destination_endpoint = current.destination_endpoint.clone();
        }
        Ok(std::mem::replace(&mut *current, next))
    }

    fn retry_interval(&self) -> Duration {
        *self.retry_interval.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_requires_listener() {
        let network = ChannelNetwork::new();
        let transport = ChannelTransport::new(network.clone());
        transport.configure(&StartSettings::new("mem://server")).unwrap();

        let err = transport.connect(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, TransportError::Connect(_)));

        let _listener = network.listen("mem://server");
        tokio_test::assert_ok!(transport.connect(&CancellationToken::new()).await);
    }

    #[tokio::test]
    async fn test_duplex_exchange() {
        let network = ChannelNetwork::new();
        let mut listener = network.listen("mem://server");
        let transport = ChannelTransport::new(network);
        transport.configure(&StartSettings::new("mem://server")).unwrap();
        transport.connect(&CancellationToken::new()).await.unwrap();

        let mut conn = listener.accept().await.unwrap();
        assert_eq!(conn.settings.destination_endpoint, "mem://server");

        let report = AgentToServer {
            instance_uid: "agent-1".into(),
            sequence_num: 0,
            ..Default::default()
        };
        transport.send(&report, &CancellationToken::new()).await.unwrap();
        assert_eq!(conn.next_report().await.unwrap(), report);

        conn.send(ServerToAgent {
            report_full_state: true,
            ..Default::default()
        })
        .await
        .unwrap();
        let got = transport.receive().await.unwrap().unwrap();
        assert!(got.report_full_state);

        drop(conn);
        assert!(transport.receive().await.unwrap().is_none());
        assert!(matches!(
            transport.send(&report, &CancellationToken::new()).await,
            Err(TransportError::Closed)
        ));
    }

    #[test]
    fn test_apply_settings_keeps_endpoint_when_unset() {
        let transport = ChannelTransport::new(ChannelNetwork::new());
        transport.configure(&StartSettings::new("mem://a")).unwrap();

        let previous = transport
            .apply_settings(&ConnectionSettings::default())
            .unwrap();
        assert_eq!(previous.destination_endpoint, "mem://a");
        assert_eq!(transport.current_settings().destination_endpoint, "mem://a");

        transport
            .apply_settings(&ConnectionSettings {
                destination_endpoint: "mem://b".into(),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(transport.current_settings().destination_endpoint, "mem://b");
    }
}
