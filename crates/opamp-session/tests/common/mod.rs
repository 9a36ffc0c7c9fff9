//! Mock management server and recording callbacks shared by the session
//! tests.

#![allow(dead_code)]

use std::{
    collections::VecDeque,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use async_trait::async_trait;
use axum::{
    Router,
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
};
use opamp_core::{
    AgentToServer, CallbackError, Callbacks, PackagesSyncer, RemoteConfigOutcome, ServerToAgent,
    TransportError,
    protocol::{
        AgentIdentification, AgentRemoteConfig, ConnectionKind, ConnectionSettings,
        EffectiveConfig, PackageState, PackageStatus, PackagesAvailable, RemoteConfigStatus,
        ServerErrorResponse, ServerToAgentCommand,
    },
};
use opamp_transport::codec;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct Received {
    pub report: AgentToServer,
    pub at: Instant,
    pub compressed: bool,
}

pub enum Reply {
    Instruction(ServerToAgent),
    Status(StatusCode),
}

/// Records every report and answers from a script, falling back to a fixed
/// instruction (or an empty body) once the script runs out.
#[derive(Default)]
pub struct MockServer {
    received: Mutex<Vec<Received>>,
    script: Mutex<VecDeque<Reply>>,
    fallback: Mutex<Option<ServerToAgent>>,
}

impl MockServer {
    pub fn script(&self, reply: Reply) {
        self.script.lock().push_back(reply);
    }

    pub fn respond_always(&self, instruction: ServerToAgent) {
        *self.fallback.lock() = Some(instruction);
    }

    pub fn received(&self) -> Vec<Received> {
        self.received.lock().clone()
    }

    pub fn reports(&self) -> Vec<AgentToServer> {
        self.received.lock().iter().map(|r| r.report.clone()).collect()
    }

    pub fn count(&self) -> usize {
        self.received.lock().len()
    }

    pub fn sequence_nums(&self) -> Vec<u64> {
        self.received
            .lock()
            .iter()
            .map(|r| r.report.sequence_num)
            .collect()
    }
}

async fn handle(State(server): State<Arc<MockServer>>, headers: HeaderMap, body: Bytes) -> Response {
    let compressed = headers
        .get("content-encoding")
        .is_some_and(|v| v == codec::GZIP_ENCODING);
    let Ok(report) = codec::decode_report(&body, compressed) else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    server.received.lock().push(Received {
        report,
        at: Instant::now(),
        compressed,
    });

    let scripted = server.script.lock().pop_front();
    let instruction = match scripted {
        Some(Reply::Status(status)) => return status.into_response(),
        Some(Reply::Instruction(instruction)) => Some(instruction),
        None => server.fallback.lock().clone(),
    };
    match instruction {
        Some(instruction) => match codec::encode_instruction(&instruction, false) {
            Ok(body) => body.into_response(),
            Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
        },
        None => StatusCode::OK.into_response(),
    }
}

/// Serve a mock on an ephemeral port. Returns its endpoint URL.
pub async fn serve() -> (String, Arc<MockServer>) {
    let server = Arc::new(MockServer::default());
    let app = Router::new()
        .route("/v1/opamp", post(handle))
        .with_state(Arc::clone(&server));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}/v1/opamp"), server)
}

/// Poll `check` until it holds, panicking after five seconds.
pub async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Callbacks that record every call.
#[derive(Default)]
pub struct Recorder {
    pub remote_config_delay: Duration,
    pub reject_opamp_settings: bool,
    pub reject_identification: bool,
    pub fail_packages: bool,

    pub connects: AtomicUsize,
    pub connect_failures: AtomicUsize,
    pub errors: Mutex<Vec<ServerErrorResponse>>,
    pub remote_configs: Mutex<Vec<AgentRemoteConfig>>,
    pub remote_configs_cancelled: AtomicUsize,
    pub saved_statuses: Mutex<Vec<RemoteConfigStatus>>,
    pub effective_config: Mutex<EffectiveConfig>,
    pub opamp_offers: AtomicUsize,
    pub accepted: Mutex<Vec<(ConnectionKind, ConnectionSettings)>>,
    pub packages_offered: Mutex<Vec<PackagesAvailable>>,
    pub identifications: Mutex<Vec<String>>,
    pub commands: Mutex<Vec<ServerToAgentCommand>>,
}

impl Recorder {
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn connect_failures(&self) -> usize {
        self.connect_failures.load(Ordering::SeqCst)
    }

    pub fn opamp_offers(&self) -> usize {
        self.opamp_offers.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Callbacks for Recorder {
    fn on_connect(&self) {
        self.connects.fetch_add(1, Ordering::SeqCst);
    }

    fn on_connect_failed(&self, _error: &TransportError) {
        self.connect_failures.fetch_add(1, Ordering::SeqCst);
    }

    fn on_error(&self, error: &ServerErrorResponse) {
        self.errors.lock().push(error.clone());
    }

    async fn on_remote_config(
        &self,
        cancel: &CancellationToken,
        config: &AgentRemoteConfig,
    ) -> Result<RemoteConfigOutcome, CallbackError> {
        self.remote_configs.lock().push(config.clone());
        tokio::select! {
            () = cancel.cancelled() => {
                self.remote_configs_cancelled.fetch_add(1, Ordering::SeqCst);
                return Err(CallbackError::Cancelled);
            }
            () = tokio::time::sleep(self.remote_config_delay) => {}
        }
        let effective = EffectiveConfig::new(config.config.clone());
        *self.effective_config.lock() = effective.clone();
        Ok(RemoteConfigOutcome::changed(effective))
    }

    async fn save_remote_config_status(
        &self,
        _cancel: &CancellationToken,
        status: &RemoteConfigStatus,
    ) {
        self.saved_statuses.lock().push(status.clone());
    }

    async fn get_effective_config(
        &self,
        _cancel: &CancellationToken,
    ) -> Result<EffectiveConfig, CallbackError> {
        Ok(self.effective_config.lock().clone())
    }

    async fn on_opamp_connection_settings(
        &self,
        _cancel: &CancellationToken,
        _settings: &ConnectionSettings,
    ) -> Result<(), CallbackError> {
        self.opamp_offers.fetch_add(1, Ordering::SeqCst);
        if self.reject_opamp_settings {
            return Err(CallbackError::rejected("certificate not trusted"));
        }
        Ok(())
    }

    fn on_connection_settings_accepted(&self, kind: &ConnectionKind, settings: &ConnectionSettings) {
        self.accepted.lock().push((kind.clone(), settings.clone()));
    }

    async fn on_packages_available(
        &self,
        _cancel: &CancellationToken,
        packages: &PackagesAvailable,
        syncer: Arc<dyn PackagesSyncer>,
    ) -> Result<(), CallbackError> {
        self.packages_offered.lock().push(packages.clone());
        if self.fail_packages {
            syncer.fail("no space left on device".into());
            return Ok(());
        }
        for (name, offered) in &packages.packages {
            syncer.report_status(PackageStatus {
                name: name.clone(),
                agent_has_version: offered.version.clone(),
                server_offered_version: offered.version.clone(),
                status: PackageState::Installed,
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
        if self.reject_identification {
            return Err(CallbackError::rejected("instance uid is pinned"));
        }
        self.identifications
            .lock()
            .push(identification.new_instance_uid.clone());
        Ok(())
    }

    async fn on_command(&self, command: &ServerToAgentCommand) -> Result<(), CallbackError> {
        self.commands.lock().push(command.clone());
        Ok(())
    }
}
