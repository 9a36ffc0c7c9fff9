//! Session lifecycle.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU8, Ordering},
    },
    time::Duration,
};

use opamp_core::{
    ClientError, StartSettings, Transport,
    protocol::{
        AgentDescription, ComponentHealth, ConnectionKind, ConnectionSettings, RemoteConfigStatus,
    },
};
use opamp_transport::HttpSender;
use parking_lot::Mutex;
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::Instrument;

use crate::{dispatcher::Dispatcher, state::SessionState, worker::Worker};

/// Pending reconnect requests. Each connection slot has at most one.
const COMMAND_CAPACITY: usize = 8;

/// Where a session is in its lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionPhase {
    /// Constructed, not started.
    Idle,
    /// Started; no exchange has succeeded yet, or the connection was lost.
    Connecting,
    /// At least one exchange succeeded.
    Connected,
    /// Stop requested, draining.
    Stopping,
    /// Terminal.
    Stopped,
}

impl SessionPhase {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Idle,
            1 => Self::Connecting,
            2 => Self::Connected,
            3 => Self::Stopping,
            _ => Self::Stopped,
        }
    }
}

/// Lock-free phase shared with the exchange loop.
#[derive(Debug)]
pub(crate) struct PhaseCell(AtomicU8);

impl PhaseCell {
    fn new() -> Self {
        Self(AtomicU8::new(SessionPhase::Idle as u8))
    }

    pub(crate) fn get(&self) -> SessionPhase {
        SessionPhase::from_u8(self.0.load(Ordering::Acquire))
    }

    fn set(&self, phase: SessionPhase) {
        self.0.store(phase as u8, Ordering::Release);
    }

    /// Move `from -> to`. Returns `false` if the phase was not `from`.
    pub(crate) fn transition(&self, from: SessionPhase, to: SessionPhase) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

#[derive(Clone)]
struct Session {
    state: Arc<SessionState>,
    dispatcher: Arc<Dispatcher>,
}

struct Tasks {
    worker: JoinHandle<()>,
    tracker: TaskTracker,
    stop: CancellationToken,
    abort: CancellationToken,
}

/// Handed to stops that arrive while another stop drains the session.
#[derive(Clone)]
struct Draining {
    /// Cancelled once the session is stopped.
    done: CancellationToken,
    abort: CancellationToken,
}

enum StopRole {
    Drain(Session, Tasks, Draining),
    Wait(Draining),
}

enum Lifecycle {
    Idle,
    Running(Session, Tasks),
    Stopping(Session, Draining),
    Stopped(Session),
}

/// Client side of one management session.
///
/// A session is started once and stopped once; create a new engine for the
/// next session. Several engines in one process do not share any state.
pub struct SessionEngine {
    transport: Transport,
    lifecycle: Mutex<Lifecycle>,
    phase: Arc<PhaseCell>,
}

impl std::fmt::Debug for SessionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionEngine")
            .field("transport", &self.transport)
            .field("phase", &self.phase())
            .finish_non_exhaustive()
    }
}

impl SessionEngine {
    #[must_use]
    pub fn new(transport: Transport) -> Self {
        Self {
            transport,
            lifecycle: Mutex::new(Lifecycle::Idle),
            phase: Arc::new(PhaseCell::new()),
        }
    }

    /// Engine polling over HTTP.
    #[must_use]
    pub fn http() -> Self {
        Self::new(Transport::Polling(Arc::new(HttpSender::new())))
    }

    /// Start the session and return immediately; exchanges run in the
    /// background on the current Tokio runtime.
    ///
    /// # Errors
    /// Returns error if the session was started before, if `settings` lack a
    /// server address or callbacks, or if the transport rejects them. No
    /// background work is started then.
    pub fn start(&self, settings: StartSettings) -> Result<(), ClientError> {
        let mut lifecycle = self.lifecycle.lock();
        if !matches!(*lifecycle, Lifecycle::Idle) {
            return Err(ClientError::AlreadyStarted);
        }
        settings.validate()?;
        let callbacks = settings
            .callbacks
            .clone()
            .ok_or(ClientError::MissingCallbacks)?;
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            ClientError::InvalidArgument("start must be called within a Tokio runtime".into())
        })?;
        self.transport.configure(&settings)?;

        let state = Arc::new(SessionState::new(&settings));
        let tracker = TaskTracker::new();
        let stop = CancellationToken::new();
        let abort = CancellationToken::new();
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_CAPACITY);
        let dispatcher = Arc::new(Dispatcher::new(
            callbacks,
            Arc::clone(&state),
            tracker.clone(),
            stop.clone(),
            abort.clone(),
            commands_tx,
        ));

        let span = tracing::info_span!("opamp_session", instance_uid = %state.instance_uid());
        tracing::info!(parent: &span, server = %settings.server_url, transport = ?self.transport, "starting session");
        self.phase.set(SessionPhase::Connecting);
        let worker = Worker {
            transport: self.transport.clone(),
            state: Arc::clone(&state),
            dispatcher: Arc::clone(&dispatcher),
            phase: Arc::clone(&self.phase),
            commands: commands_rx,
            stop: stop.clone(),
            abort: abort.clone(),
        };
        let worker = runtime.spawn(worker.run().instrument(span));

        *lifecycle = Lifecycle::Running(
            Session { state, dispatcher },
            Tasks {
                worker,
                tracker,
                stop,
                abort,
            },
        );
        Ok(())
    }

    /// Stop the session.
    ///
    /// No new exchanges are scheduled; the exchange in flight and every
    /// callback already running are awaited. If `cancel` fires first they
    /// are cancelled instead and `ClientError::Cancelled` is returned. The
    /// session ends stopped either way. Stopping a stopped session succeeds;
    /// a stop issued while another drains waits for that one to finish.
    ///
    /// # Errors
    /// Returns error if the session was never started, or on cancellation.
    pub async fn stop(&self, cancel: &CancellationToken) -> Result<(), ClientError> {
        let role = {
            let mut lifecycle = self.lifecycle.lock();
            match std::mem::replace(&mut *lifecycle, Lifecycle::Idle) {
                Lifecycle::Idle => return Err(ClientError::NotStarted),
                Lifecycle::Running(session, tasks) => {
                    let draining = Draining {
                        done: CancellationToken::new(),
                        abort: tasks.abort.clone(),
                    };
                    *lifecycle = Lifecycle::Stopping(session.clone(), draining.clone());
                    StopRole::Drain(session, tasks, draining)
                }
                Lifecycle::Stopping(session, draining) => {
                    *lifecycle = Lifecycle::Stopping(session, draining.clone());
                    StopRole::Wait(draining)
                }
                stopped @ Lifecycle::Stopped(_) => {
                    *lifecycle = stopped;
                    return Ok(());
                }
            }
        };
        let (session, tasks, draining) = match role {
            StopRole::Drain(session, tasks, draining) => (session, tasks, draining),
            StopRole::Wait(draining) => return Self::await_stopped(draining, cancel).await,
        };
        self.phase.set(SessionPhase::Stopping);
        tracing::info!("stopping session");

        let Tasks {
            worker,
            tracker,
            stop,
            abort,
        } = tasks;
        stop.cancel();
        tracker.close();
        let drain = async {
            if let Err(err) = worker.await {
                tracing::error!(error = %err, "exchange loop panicked");
            }
            tracker.wait().await;
        };

        let result = tokio::select! {
            biased;
            () = drain => Ok(()),
            () = cancel.cancelled() => {
                tracing::warn!("stop cancelled, abandoning in-flight work");
                abort.cancel();
                Err(ClientError::Cancelled)
            }
        };

        *self.lifecycle.lock() = Lifecycle::Stopped(session);
        self.phase.set(SessionPhase::Stopped);
        draining.done.cancel();
        tracing::info!("session stopped");
        result
    }

    async fn await_stopped(draining: Draining, cancel: &CancellationToken) -> Result<(), ClientError> {
        tokio::select! {
            biased;
            () = draining.done.cancelled() => Ok(()),
            () = cancel.cancelled() => {
                tracing::warn!("stop cancelled, abandoning in-flight work");
                draining.abort.cancel();
                Err(ClientError::Cancelled)
            }
        }
    }

    #[must_use]
    pub fn phase(&self) -> SessionPhase {
        self.phase.get()
    }

    /// Instance uid the session reports under. `None` before start.
    #[must_use]
    pub fn instance_uid(&self) -> Option<String> {
        self.session().map(|s| s.state.instance_uid())
    }

    /// Settings currently in use for `kind`.
    #[must_use]
    pub fn connection_settings(&self, kind: &ConnectionKind) -> Option<ConnectionSettings> {
        self.session().and_then(|s| s.state.connection(kind))
    }

    /// Last remote config status, to persist for the next session.
    #[must_use]
    pub fn remote_config_status(&self) -> Option<RemoteConfigStatus> {
        self.session().and_then(|s| s.state.remote_config_status())
    }

    /// Replace the agent description and report it right away.
    ///
    /// # Errors
    /// Returns error if the description has no attributes or the session is
    /// not running.
    pub fn set_agent_description(&self, description: AgentDescription) -> Result<(), ClientError> {
        if description.is_empty() {
            return Err(ClientError::InvalidArgument(
                "agent description must have attributes".into(),
            ));
        }
        let session = self.running()?;
        session.state.set_agent_description(description);
        session.state.notify_urgent();
        Ok(())
    }

    /// Record agent health and report it right away.
    ///
    /// # Errors
    /// Returns error if the session is not running.
    pub fn set_health(&self, health: ComponentHealth) -> Result<(), ClientError> {
        let session = self.running()?;
        session.state.set_health(health);
        session.state.notify_urgent();
        Ok(())
    }

    /// Re-read the effective config from the agent. A changed config is
    /// reported right away.
    ///
    /// # Errors
    /// Returns error if the session is not running or the callback fails.
    pub async fn update_effective_config(&self, cancel: &CancellationToken) -> Result<(), ClientError> {
        let session = self.running()?;
        if session.dispatcher.refresh_effective_config(cancel).await? {
            tracing::debug!("effective config changed");
            session.state.notify_urgent();
        }
        Ok(())
    }

    /// Change the wait between exchanges. Streaming transports ignore it.
    pub fn set_polling_interval(&self, interval: Duration) {
        if let Transport::Polling(transport) = &self.transport {
            transport.set_polling_interval(interval);
        }
    }

    fn session(&self) -> Option<Session> {
        match &*self.lifecycle.lock() {
            Lifecycle::Idle => None,
            Lifecycle::Running(session, _)
            | Lifecycle::Stopping(session, _)
            | Lifecycle::Stopped(session) => Some(session.clone()),
        }
    }

    fn running(&self) -> Result<Session, ClientError> {
        match &*self.lifecycle.lock() {
            Lifecycle::Running(session, _) => Ok(session.clone()),
            _ => Err(ClientError::NotStarted),
        }
    }
}
