//! The exchange loop: one task per session driving the transport.

use std::{sync::Arc, time::Duration};

use opamp_core::{
    AgentToServer, PollingTransport, ServerToAgent, StreamingTransport, Transport, TransportError,
    protocol::{ErrorResponseType, ServerErrorResponse},
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::{
    dispatcher::{Dispatcher, EngineCommand},
    engine::{PhaseCell, SessionPhase},
    state::SessionState,
};

pub(crate) struct Worker {
    pub(crate) transport: Transport,
    pub(crate) state: Arc<SessionState>,
    pub(crate) dispatcher: Arc<Dispatcher>,
    pub(crate) phase: Arc<PhaseCell>,
    pub(crate) commands: mpsc::Receiver<EngineCommand>,
    /// Stop scheduling new exchanges.
    pub(crate) stop: CancellationToken,
    /// Abandon the exchange in flight.
    pub(crate) abort: CancellationToken,
}

/// The server answered but could not process the report.
fn unavailable(instruction: &ServerToAgent) -> Option<&ServerErrorResponse> {
    instruction
        .error_response
        .as_ref()
        .filter(|error| error.error_type == ErrorResponseType::Unavailable)
}

fn retry_delay(error: &ServerErrorResponse) -> Option<Duration> {
    error
        .retry_info
        .map(|info| Duration::from_nanos(info.retry_after_nanoseconds))
}

impl Worker {
    pub(crate) async fn run(mut self) {
        tokio::select! {
            biased;
            () = self.stop.cancelled() => return,
            res = self.dispatcher.refresh_effective_config(&self.abort) => {
                if let Err(err) = res {
                    tracing::warn!(error = %err, "failed to read initial effective config");
                }
            }
        }

        match self.transport.clone() {
            Transport::Polling(transport) => self.run_polling(transport.as_ref()).await,
            Transport::Streaming(transport) => self.run_streaming(transport.as_ref()).await,
        }
        tracing::debug!("exchange loop stopped");
    }

    async fn run_polling(&mut self, transport: &dyn PollingTransport) {
        let mut wait = Duration::ZERO;
        loop {
            let sleep = tokio::time::sleep(wait);
            tokio::pin!(sleep);
            loop {
                tokio::select! {
                    biased;
                    () = self.stop.cancelled() => return,
                    Some(command) = self.commands.recv() => {
                        self.handle_polling_command(transport, command).await;
                    }
                    () = self.state.urgent().notified() => break,
                    () = &mut sleep => break,
                }
            }

            let retry_after = self.poll_once(transport).await;
            let interval = transport.polling_interval();
            wait = retry_after.map_or(interval, |delay| delay.max(interval));
        }
    }

    async fn poll_once(&self, transport: &dyn PollingTransport) -> Option<Duration> {
        let report = self.state.next_report();
        self.exchange(transport, report).await
    }

    /// One exchange. Returns the delay the server asked for before the next.
    #[instrument(skip_all, fields(sequence_num = report.sequence_num))]
    async fn exchange(
        &self,
        transport: &dyn PollingTransport,
        report: AgentToServer,
    ) -> Option<Duration> {
        tracing::trace!("sending report");
        let result = transport.exchange(&report, &self.abort).await;
        self.complete_exchange(report.sequence_num, result).await
    }

    async fn complete_exchange(
        &self,
        sequence_num: u64,
        result: Result<Option<ServerToAgent>, TransportError>,
    ) -> Option<Duration> {
        let instruction = match result {
            Ok(instruction) => instruction,
            Err(TransportError::Cancelled) => return None,
            Err(err) => {
                self.exchange_failed(&err);
                return err.retry_after();
            }
        };

        if let Some(error) = instruction.as_ref().and_then(unavailable) {
            let delay = retry_delay(error);
            tracing::debug!(?delay, "server unavailable, report kept for retry");
            return delay;
        }

        self.state.delivered(sequence_num);
        self.mark_connected();
        if let Some(instruction) = instruction {
            self.process(instruction).await;
        }
        None
    }

    async fn handle_polling_command(&self, transport: &dyn PollingTransport, command: EngineCommand) {
        let EngineCommand::Reconnect { settings, reply } = command;
        let previous = match transport.apply_settings(&settings) {
            Ok(previous) => previous,
            Err(err) => {
                let _ = reply.send(Err(err));
                return;
            }
        };
        tracing::info!(endpoint = %settings.destination_endpoint, "verifying new connection settings");

        let report = self.state.next_report();
        let sequence_num = report.sequence_num;
        let verified = transport
            .exchange(&report, &self.abort)
            .await
            .and_then(|instruction| match instruction.as_ref().and_then(unavailable) {
                Some(error) => Err(TransportError::Unavailable {
                    retry_after: retry_delay(error),
                }),
                None => Ok(instruction),
            });
        match verified {
            Ok(instruction) => {
                let _ = reply.send(Ok(()));
                self.complete_exchange(sequence_num, Ok(instruction)).await;
            }
            Err(err) => {
                tracing::warn!(error = %err, "new connection settings failed, restoring previous");
                if let Err(restore) = transport.apply_settings(&previous) {
                    tracing::error!(error = %restore, "failed to restore connection settings");
                }
                let _ = reply.send(Err(err));
            }
        }
    }

    async fn run_streaming(&mut self, transport: &dyn StreamingTransport) {
        let mut wait = Duration::ZERO;
        loop {
            if !wait.is_zero() {
                tokio::select! {
                    biased;
                    () = self.stop.cancelled() => return,
                    () = tokio::time::sleep(wait) => {}
                }
            }
            wait = transport.retry_interval();

            let connected = tokio::select! {
                biased;
                () = self.stop.cancelled() => return,
                res = transport.connect(&self.abort) => res,
            };
            match connected {
                Ok(()) => {}
                Err(TransportError::Cancelled) => return,
                Err(err) => {
                    self.exchange_failed(&err);
                    continue;
                }
            }
            tracing::debug!("stream connected");
            self.state.request_full_state();

            match self.stream(transport).await {
                StreamEnd::Stopped => return,
                StreamEnd::Lost(err) => self.exchange_failed(&err),
                StreamEnd::Reconnect => wait = Duration::ZERO,
            }
        }
    }

    async fn stream(&mut self, transport: &dyn StreamingTransport) -> StreamEnd {
        loop {
            if self.state.has_pending_changes() {
                let report = self.state.next_report();
                let sequence_num = report.sequence_num;
                match transport.send(&report, &self.abort).await {
                    Ok(()) => {
                        tracing::trace!(sequence_num, "report sent");
                        self.state.delivered(sequence_num);
                        self.mark_connected();
                    }
                    Err(TransportError::Cancelled) => return StreamEnd::Stopped,
                    Err(err) => return StreamEnd::Lost(err),
                }
            }

            tokio::select! {
                biased;
                () = self.stop.cancelled() => return StreamEnd::Stopped,
                Some(command) = self.commands.recv() => {
                    if let Some(end) = self.handle_streaming_command(transport, command).await {
                        return end;
                    }
                }
                () = self.state.urgent().notified() => {}
                received = transport.receive() => match received {
                    Ok(Some(instruction)) => {
                        if let Some(error) = unavailable(&instruction) {
                            let delay = retry_delay(error).unwrap_or_else(|| transport.retry_interval());
                            tracing::debug!(?delay, "server unavailable, resending full state later");
                            tokio::select! {
                                biased;
                                () = self.stop.cancelled() => return StreamEnd::Stopped,
                                () = tokio::time::sleep(delay) => {}
                            }
                            self.state.request_full_state();
                        } else {
                            self.mark_connected();
                            self.process(instruction).await;
                        }
                    }
                    Ok(None) => return StreamEnd::Lost(TransportError::Closed),
                    Err(err) => return StreamEnd::Lost(err),
                },
            }
        }
    }

    /// Returns how the current stream ends, or `None` to keep it.
    async fn handle_streaming_command(
        &self,
        transport: &dyn StreamingTransport,
        command: EngineCommand,
    ) -> Option<StreamEnd> {
        let EngineCommand::Reconnect { settings, reply } = command;
        let previous = match transport.apply_settings(&settings) {
            Ok(previous) => previous,
            Err(err) => {
                let _ = reply.send(Err(err));
                return None;
            }
        };
        tracing::info!(endpoint = %settings.destination_endpoint, "reconnecting with new connection settings");

        match transport.connect(&self.abort).await {
            Ok(()) => {
                let _ = reply.send(Ok(()));
                self.state.request_full_state();
                None
            }
            Err(err) => {
                tracing::warn!(error = %err, "new connection settings failed, restoring previous");
                if let Err(restore) = transport.apply_settings(&previous) {
                    tracing::error!(error = %restore, "failed to restore connection settings");
                }
                let _ = reply.send(Err(err));
                Some(StreamEnd::Reconnect)
            }
        }
    }

    async fn process(&self, instruction: ServerToAgent) {
        if let Some(error) = &instruction.error_response {
            tracing::warn!(
                error_type = ?error.error_type,
                error = %error.error_message,
                "server reported an error"
            );
            self.dispatcher.callbacks().on_error(error);
        }
        self.dispatcher.dispatch(instruction).await;
    }

    fn exchange_failed(&self, err: &TransportError) {
        if let TransportError::Unavailable { retry_after } = err {
            tracing::debug!(?retry_after, "server unavailable");
            return;
        }
        tracing::warn!(error = %err, "exchange failed");
        self.phase
            .transition(SessionPhase::Connected, SessionPhase::Connecting);
        self.dispatcher.callbacks().on_connect_failed(err);
    }

    fn mark_connected(&self) {
        if self
            .phase
            .transition(SessionPhase::Connecting, SessionPhase::Connected)
        {
            tracing::info!(instance_uid = %self.state.instance_uid(), "connected");
            self.dispatcher.callbacks().on_connect();
        }
    }
}

enum StreamEnd {
    Stopped,
    Lost(TransportError),
    /// Reconnect right away with the current settings.
    Reconnect,
}
