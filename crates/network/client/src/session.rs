//! Sitzungsfassade: verbindet Receiver, Zustand, Reaper und Health-Reporting.
//!
//! Eine [`Session`] besitzt alles, was an einer Verbindung hängt. Die
//! einbettende Schleife ruft [`Session::tick`] einmal pro Frame auf; jede
//! Zustandsänderung passiert dort, auf dem Thread des Aufrufers.
//! Hintergrund-Tasks füllen nur die Merge-Puffer.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use futures::StreamExt;
use network_shared::{
    ClientSyncConfig, ControlMessage, FrameUpdate, InboundStream, StateUpdate,
    prelude::{MessageSink, SessionToken, Transport, TransportResult, keys},
    protocol::ClientMessage,
};
use tokio::runtime::Handle;
use tracing::{debug, error, info, warn};

use crate::{
    LOG_TARGET,
    commands::CommandClient,
    error::{SessionError, SessionResult},
    health::{ConnectionHealth, HealthReporter},
    state::{GhostReaper, SharedStateStore},
    stream::{ReceiverError, StreamReceiver},
    trajectory::{TrajectoryError, TrajectorySession},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Closed,
    Open,
    /// A receiver failed; [`Session::close`] still cleans up.
    Disconnected,
}

/// What one [`Session::tick`] did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub frame_applied: bool,
    pub frame_rejected: bool,
    pub state_applied: bool,
    pub control_messages: usize,
    pub flushed: bool,
    pub reaped: Vec<String>,
}

/// Outbound half handed to the store and the command client.
struct TransportSink(Arc<dyn Transport>);

impl MessageSink for TransportSink {
    fn send(&self, message: ClientMessage) -> TransportResult<()> {
        self.0.send(message)
    }
}

#[allow(clippy::ptr_arg)]
fn concat_control(dest: &mut Vec<ControlMessage>, incoming: &Vec<ControlMessage>) {
    dest.extend(incoming.iter().cloned());
}

pub struct Session {
    config: ClientSyncConfig,
    handle: Handle,
    status: SessionStatus,
    transport: Option<Arc<dyn Transport>>,
    commands: Option<CommandClient>,
    trajectory: TrajectorySession,
    store: SharedStateStore,
    state_rx: StreamReceiver<StateUpdate>,
    control_rx: StreamReceiver<Vec<ControlMessage>>,
    reaper: GhostReaper,
    health: HealthReporter,
    next_flush: Instant,
    next_sweep: Instant,
}

impl Session {
    pub fn new(config: ClientSyncConfig, handle: Handle) -> Self {
        let window = config.health.window();
        let now = Instant::now();
        Self {
            trajectory: TrajectorySession::new(window),
            store: SharedStateStore::new(),
            state_rx: StreamReceiver::new("state", window),
            control_rx: StreamReceiver::new("control", window),
            reaper: GhostReaper::new(&config.reaper),
            health: HealthReporter::new(&config.health),
            status: SessionStatus::Closed,
            transport: None,
            commands: None,
            next_flush: now,
            next_sweep: now,
            config,
            handle,
        }
    }

    /// Connects to `transport` under a fresh token and starts all receivers.
    pub fn open(&mut self, transport: Arc<dyn Transport>, now: Instant) -> SessionResult<SessionToken> {
        if self.transport.is_some() {
            return Err(SessionError::AlreadyOpen);
        }
        let frames = transport.subscribe_frames()?;
        let state = transport.subscribe_state()?;
        let control = transport
            .subscribe_control()?
            .map(|message| message.map(|message| vec![message]))
            .boxed();

        let token = SessionToken::generate();
        let sink: Arc<dyn MessageSink> = Arc::new(TransportSink(Arc::clone(&transport)));
        let commands = CommandClient::new(Arc::clone(&sink));
        if let Err(err) = self.start_receivers(frames, state, control, commands.clone()) {
            self.trajectory.close();
            self.state_rx.close();
            self.control_rx.close();
            return Err(err);
        }

        self.store.connect(token.clone(), sink);
        self.reaper = GhostReaper::new(&self.config.reaper);
        self.reaper.set_own_token(Some(token.as_str()));
        self.health = HealthReporter::new(&self.config.health);
        self.next_flush = now + self.config.state.publish_interval();
        self.next_sweep = now + self.config.reaper.sweep_interval();
        self.commands = Some(commands);
        self.transport = Some(transport);
        self.status = SessionStatus::Open;

        info!(target: LOG_TARGET, %token, "session opened");
        Ok(token)
    }

    fn start_receivers(
        &mut self,
        frames: InboundStream<FrameUpdate>,
        state: InboundStream<StateUpdate>,
        control: InboundStream<Vec<ControlMessage>>,
        commands: CommandClient,
    ) -> SessionResult<()> {
        let window = self.config.health.window();
        self.trajectory
            .open(&self.handle, frames, commands)
            .map_err(|source| SessionError::Receiver { stream: "frames", source })?;

        self.state_rx = StreamReceiver::new("state", window);
        self.state_rx
            .start(&self.handle, state, StateUpdate::merge_from)
            .map_err(|source| SessionError::Receiver { stream: "state", source })?;

        self.control_rx = StreamReceiver::new("control", window);
        self.control_rx
            .start(&self.handle, control, concat_control)
            .map_err(|source| SessionError::Receiver { stream: "control", source })
    }

    /// Runs one cooperative step. Never waits for network data.
    pub fn tick(&mut self, now: Instant) -> SessionResult<TickReport> {
        match self.status {
            SessionStatus::Open => {}
            SessionStatus::Disconnected => return Ok(TickReport::default()),
            SessionStatus::Closed => return Err(SessionError::NotOpen),
        }
        let mut report = TickReport::default();

        match self.state_rx.poll(now) {
            Ok(Some(update)) => {
                self.reaper.observe_update(&update, now);
                if let Some(suggestion) = update.updates.get(keys::SUGGEST_HEALTH_REPORT) {
                    self.health.suggest(suggestion);
                }
                self.store.apply_remote(update, now);
                report.state_applied = true;
            }
            Ok(None) => {}
            Err(source) => return Err(self.fail("state", source)),
        }

        match self.control_rx.poll(now) {
            Ok(Some(messages)) => {
                report.control_messages = messages.len();
                for message in messages {
                    self.handle_control(message);
                }
            }
            Ok(None) => {}
            Err(source) => return Err(self.fail("control", source)),
        }

        match self.trajectory.tick(now) {
            Ok(applied) => report.frame_applied = applied,
            Err(TrajectoryError::Receiver(source)) => return Err(self.fail("frames", source)),
            Err(TrajectoryError::Decode(_)) => report.frame_rejected = true,
            Err(other) => return Err(other.into()),
        }

        if now >= self.next_flush {
            self.next_flush = next_deadline(self.next_flush, self.config.state.publish_interval(), now);
            report.flushed = self.flush(now);
        }

        if now >= self.next_sweep {
            self.next_sweep = next_deadline(self.next_sweep, self.config.reaper.sweep_interval(), now);
            report.reaped = self.reaper.sweep(&mut self.store, now);
        }

        Ok(report)
    }

    fn handle_control(&mut self, message: ControlMessage) {
        match message {
            ControlMessage::LockResult { request_id, rejected } => {
                self.store.handle_lock_result(request_id, &rejected);
            }
            ControlMessage::CommandResult(response) => match &self.commands {
                Some(commands) => commands.resolve(response),
                None => debug!(target: LOG_TARGET, id = response.id, "command reply after close"),
            },
        }
    }

    fn flush(&mut self, now: Instant) -> bool {
        if let Some(token) = self.store.token().cloned() {
            let health = self.health_at(now);
            if let Some((key, value)) = self.health.report(&token, &health) {
                self.store.set_local(key, value);
            }
        }

        let idle_for = self
            .store
            .last_flush()
            .map_or(Duration::MAX, |last| now.saturating_duration_since(last));
        if !self.store.has_pending() && idle_for >= self.config.state.keepalive_interval() {
            self.store.heartbeat(now);
        }

        // Failures are logged by the store; the batch is not retried.
        self.store.flush_tick(now).unwrap_or(false)
    }

    fn fail(&mut self, stream: &'static str, source: ReceiverError) -> SessionError {
        error!(target: LOG_TARGET, stream, error = %source, "session lost its connection");
        self.status = SessionStatus::Disconnected;
        self.trajectory.close();
        self.state_rx.close();
        self.control_rx.close();
        SessionError::Receiver { stream, source }
    }

    /// Leaves the session: removal notifications for every replicated key,
    /// own keys removed and locks released in a final flush, then the
    /// transport is closed whether or not that flush made it out in time.
    pub async fn close(&mut self) -> SessionResult<()> {
        let Some(transport) = self.transport.take() else {
            return Err(SessionError::NotOpen);
        };
        let token = self.store.token().cloned();

        self.trajectory.close();
        self.state_rx.close();
        self.control_rx.close();
        if let Err(err) = self.store.disconnect(Instant::now()) {
            warn!(target: LOG_TARGET, error = %err, "final state flush failed");
        }

        let timeout = self.config.state.close_flush_timeout();
        match tokio::time::timeout(timeout, transport.flush()).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(target: LOG_TARGET, error = %err, "transport flush failed on close"),
            Err(_) => warn!(target: LOG_TARGET, timeout_ms = timeout.as_millis() as u64, "transport flush timed out on close"),
        }
        transport.close();

        if let Some(commands) = self.commands.take() {
            commands.abandon_all();
        }
        self.reaper.set_own_token(None);
        self.status = SessionStatus::Closed;
        match token {
            Some(token) => info!(target: LOG_TARGET, %token, "session closed"),
            None => info!(target: LOG_TARGET, "session closed"),
        }
        Ok(())
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn token(&self) -> Option<&SessionToken> {
        self.store.token()
    }

    pub fn config(&self) -> &ClientSyncConfig {
        &self.config
    }

    pub fn store(&self) -> &SharedStateStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut SharedStateStore {
        &mut self.store
    }

    pub fn trajectory(&self) -> &TrajectorySession {
        &self.trajectory
    }

    pub fn trajectory_mut(&mut self) -> &mut TrajectorySession {
        &mut self.trajectory
    }

    pub fn commands(&self) -> Option<&CommandClient> {
        self.commands.as_ref()
    }

    pub fn reaper(&self) -> &GhostReaper {
        &self.reaper
    }

    pub fn health_reporting(&self) -> bool {
        self.health.is_enabled()
    }

    /// Receive counts over the health window plus index round-trip state.
    pub fn health_at(&mut self, now: Instant) -> ConnectionHealth {
        ConnectionHealth {
            frames: self.trajectory.frames_in_window(now),
            state: self.state_rx.received_in_window(now),
            last_rtt: self.store.last_rtt(),
            awaiting_index: self.store.awaiting_index(),
            time_since_index: self.store.time_since_index(now),
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("status", &self.status)
            .field("token", &self.store.token())
            .finish_non_exhaustive()
    }
}

/// Advances a periodic deadline past `now` without bursting after a stall.
fn next_deadline(previous: Instant, period: Duration, now: Instant) -> Instant {
    let next = previous + period;
    if next > now { next } else { now + period }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deadlines_skip_missed_periods() {
        let start = Instant::now();
        let period = Duration::from_millis(33);
        assert_eq!(next_deadline(start, period, start), start + period);
        assert_eq!(
            next_deadline(start, period, start + Duration::from_millis(500)),
            start + Duration::from_millis(533)
        );
    }

    #[test]
    fn control_replies_are_concatenated() {
        let mut buffered = vec![ControlMessage::LockResult {
            request_id: 1,
            rejected: Default::default(),
        }];
        concat_control(
            &mut buffered,
            &vec![ControlMessage::LockResult {
                request_id: 2,
                rejected: Default::default(),
            }],
        );
        assert_eq!(buffered.len(), 2);
    }
}
