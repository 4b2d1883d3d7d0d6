//! Loopback transport for in-memory client-server communication.
//!
//! Keeps clients and a small reference server in the same process without
//! touching the network stack. Used by the demo binary and by tests.
//!
//! The [`LoopbackServer`] owns the authoritative dictionary, echoes every
//! accepted state update to all subscribers (the sender included), arbitrates
//! advisory locks and answers registered commands. Every call is handled
//! synchronously on the caller's thread; inbound topics are unbounded tokio
//! channels exposed as streams.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    fmt,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
};

use futures::{
    FutureExt, StreamExt,
    future::{self, BoxFuture},
    stream,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::{
    LOG_TARGET, SessionToken, Value,
    protocol::{
        ClientMessage, CommandRequest, CommandResponse, ControlMessage, FrameUpdate, StateUpdate,
    },
};

use super::{InboundStream, MessageSink, Transport, TransportError, TransportResult};

/// Server-side handler for one named command.
pub type CommandHandler =
    Arc<dyn Fn(&BTreeMap<String, Value>) -> BTreeMap<String, Value> + Send + Sync>;

type Outbox<T> = mpsc::UnboundedSender<TransportResult<T>>;

fn inbound<T: Send + 'static>(rx: mpsc::UnboundedReceiver<TransportResult<T>>) -> InboundStream<T> {
    stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) }).boxed()
}

fn broadcast<T: Clone>(outboxes: &mut Vec<Outbox<T>>, item: &T) {
    outboxes.retain(|tx| tx.send(Ok(item.clone())).is_ok());
}

fn fail_all<T>(outboxes: &mut Vec<Outbox<T>>, reason: &str) {
    for tx in outboxes.drain(..) {
        let _ = tx.send(Err(TransportError::Other(reason.to_owned())));
    }
}

#[derive(Default)]
struct Connection {
    token: Option<SessionToken>,
    frames: Vec<Outbox<FrameUpdate>>,
    state: Vec<Outbox<StateUpdate>>,
    control: Vec<Outbox<ControlMessage>>,
}

impl Connection {
    fn reply(&mut self, message: ControlMessage) {
        broadcast(&mut self.control, &message);
    }
}

#[derive(Default)]
struct ServerState {
    values: BTreeMap<String, Value>,
    locks: BTreeMap<String, SessionToken>,
    connections: BTreeMap<u64, Connection>,
    commands: HashMap<String, CommandHandler>,
    received: Vec<ClientMessage>,
    next_connection: u64,
}

impl ServerState {
    fn publish_state(&mut self, update: &StateUpdate) {
        for conn in self.connections.values_mut() {
            broadcast(&mut conn.state, update);
        }
    }

    fn apply_state(&mut self, connection: u64, token: SessionToken, update: StateUpdate) {
        let blocked = update
            .updates
            .keys()
            .chain(update.removals.iter())
            .find(|key| matches!(self.locks.get(*key), Some(holder) if *holder != token));
        if let Some(key) = blocked {
            warn!(
                target: LOG_TARGET,
                %token,
                key = key.as_str(),
                "loopback server rejected update touching a key locked by another session"
            );
            return;
        }

        if let Some(conn) = self.connections.get_mut(&connection) {
            conn.token = Some(token);
        }
        for key in &update.removals {
            self.values.remove(key);
        }
        for (key, value) in &update.updates {
            self.values.insert(key.clone(), value.clone());
        }
        self.publish_state(&update);
    }

    fn apply_locks(
        &mut self,
        connection: u64,
        request_id: u64,
        token: SessionToken,
        acquire: BTreeMap<String, f32>,
        release: BTreeSet<String>,
    ) {
        let rejected: BTreeSet<String> = acquire
            .iter()
            .filter(|(_, weight)| **weight > 0.0)
            .filter(|(key, _)| matches!(self.locks.get(*key), Some(holder) if *holder != token))
            .map(|(key, _)| key.clone())
            .collect();

        if rejected.is_empty() {
            for key in release.iter().chain(
                acquire
                    .iter()
                    .filter(|(_, weight)| **weight <= 0.0)
                    .map(|(key, _)| key),
            ) {
                if self.locks.get(key) == Some(&token) {
                    self.locks.remove(key);
                }
            }
            for (key, weight) in &acquire {
                if *weight > 0.0 {
                    self.locks.insert(key.clone(), token.clone());
                }
            }
        } else {
            debug!(target: LOG_TARGET, %token, ?rejected, "loopback server rejected lock request");
        }

        if let Some(conn) = self.connections.get_mut(&connection) {
            conn.token = Some(token);
            conn.reply(ControlMessage::LockResult {
                request_id,
                rejected,
            });
        }
    }

    fn run_command(&mut self, connection: u64, request: CommandRequest) {
        let result = match self.commands.get(&request.name) {
            Some(handler) => handler(&request.arguments),
            None => {
                warn!(target: LOG_TARGET, name = %request.name, "loopback server got unknown command");
                BTreeMap::from([(
                    "error".to_owned(),
                    Value::from(format!("unknown command {}", request.name)),
                )])
            }
        };
        if let Some(conn) = self.connections.get_mut(&connection) {
            conn.reply(ControlMessage::CommandResult(CommandResponse {
                id: request.id,
                result,
            }));
        }
    }

    fn drop_connection(&mut self, connection: u64) -> Option<Connection> {
        let conn = self.connections.remove(&connection)?;
        if let Some(token) = &conn.token {
            let still_connected = self
                .connections
                .values()
                .any(|other| other.token.as_ref() == Some(token));
            if !still_connected {
                self.locks.retain(|_, holder| holder != token);
            }
        }
        Some(conn)
    }
}

/// Shared handle to the in-process reference server.
#[derive(Clone, Default)]
pub struct LoopbackServer {
    state: Arc<Mutex<ServerState>>,
}

impl LoopbackServer {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, ServerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Opens a new client connection.
    pub fn connect(&self) -> LoopbackTransport {
        let id = {
            let mut state = self.lock();
            state.next_connection += 1;
            let id = state.next_connection;
            state.connections.insert(id, Connection::default());
            id
        };
        debug!(target: LOG_TARGET, connection = id, "loopback connection opened");
        LoopbackTransport {
            id,
            server: self.clone(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn register_command<F>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn(&BTreeMap<String, Value>) -> BTreeMap<String, Value> + Send + Sync + 'static,
    {
        self.lock().commands.insert(name.into(), Arc::new(handler));
    }

    /// Pushes a frame to every frame subscriber.
    pub fn publish_frame(&self, update: FrameUpdate) {
        let mut state = self.lock();
        for conn in state.connections.values_mut() {
            broadcast(&mut conn.frames, &update);
        }
    }

    /// Server-side write, as if made by a peer that is not connected through loopback.
    pub fn set_value(&self, key: impl Into<String>, value: impl Into<Value>) {
        let update = StateUpdate::default().with_update(key, value);
        let mut state = self.lock();
        for (key, value) in &update.updates {
            state.values.insert(key.clone(), value.clone());
        }
        state.publish_state(&update);
    }

    pub fn remove_value(&self, key: impl Into<String>) {
        let update = StateUpdate::default().with_removal(key);
        let mut state = self.lock();
        for key in &update.removals {
            state.values.remove(key);
        }
        state.publish_state(&update);
    }

    pub fn value(&self, key: &str) -> Option<Value> {
        self.lock().values.get(key).cloned()
    }

    pub fn values(&self) -> BTreeMap<String, Value> {
        self.lock().values.clone()
    }

    pub fn lock_holder(&self, key: &str) -> Option<SessionToken> {
        self.lock().locks.get(key).cloned()
    }

    /// Drains the log of every message clients sent so far.
    pub fn take_received(&self) -> Vec<ClientMessage> {
        std::mem::take(&mut self.lock().received)
    }

    pub fn connection_count(&self) -> usize {
        self.lock().connections.len()
    }

    /// Cuts a connection as a network failure would: every inbound stream
    /// yields an error and ends, further sends fail.
    pub fn sever(&self, connection: u64) -> bool {
        let Some(mut conn) = self.lock().drop_connection(connection) else {
            return false;
        };
        info!(target: LOG_TARGET, connection, "loopback connection severed");
        let reason = "loopback connection severed";
        fail_all(&mut conn.frames, reason);
        fail_all(&mut conn.state, reason);
        fail_all(&mut conn.control, reason);
        true
    }
}

impl fmt::Debug for LoopbackServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("LoopbackServer")
            .field("connections", &state.connections.len())
            .field("values", &state.values.len())
            .field("locks", &state.locks.len())
            .finish()
    }
}

/// Client-side half of a loopback connection.
pub struct LoopbackTransport {
    id: u64,
    server: LoopbackServer,
    closed: AtomicBool,
}

impl LoopbackTransport {
    pub fn connection_id(&self) -> u64 {
        self.id
    }

    fn ensure_open(&self) -> TransportResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(TransportError::Closed)
        } else {
            Ok(())
        }
    }

    fn subscribe<T, F>(&self, register: F) -> TransportResult<InboundStream<T>>
    where
        T: Send + 'static,
        F: FnOnce(&mut ServerState, Outbox<T>) -> bool,
    {
        self.ensure_open()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.server.lock();
        if !state.connections.contains_key(&self.id) {
            return Err(TransportError::NotConnected);
        }
        register(&mut state, tx);
        Ok(inbound(rx))
    }
}

impl fmt::Debug for LoopbackTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopbackTransport")
            .field("connection", &self.id)
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish()
    }
}

impl MessageSink for LoopbackTransport {
    fn send(&self, message: ClientMessage) -> TransportResult<()> {
        self.ensure_open()?;
        let mut state = self.server.lock();
        if !state.connections.contains_key(&self.id) {
            return Err(TransportError::NotConnected);
        }
        state.received.push(message.clone());

        match message {
            ClientMessage::UpdateState { token, update } => {
                state.apply_state(self.id, token, update)
            }
            ClientMessage::UpdateLocks {
                request_id,
                token,
                acquire,
                release,
            } => state.apply_locks(self.id, request_id, token, acquire, release),
            ClientMessage::Command(request) => state.run_command(self.id, request),
        }
        Ok(())
    }
}

impl Transport for LoopbackTransport {
    fn subscribe_frames(&self) -> TransportResult<InboundStream<FrameUpdate>> {
        let id = self.id;
        self.subscribe(|state, tx| {
            state
                .connections
                .get_mut(&id)
                .map(|conn| conn.frames.push(tx))
                .is_some()
        })
    }

    fn subscribe_state(&self) -> TransportResult<InboundStream<StateUpdate>> {
        let id = self.id;
        self.subscribe(|state, tx| {
            if !state.values.is_empty() {
                let snapshot = StateUpdate {
                    updates: state.values.clone(),
                    removals: BTreeSet::new(),
                };
                let _ = tx.send(Ok(snapshot));
            }
            state
                .connections
                .get_mut(&id)
                .map(|conn| conn.state.push(tx))
                .is_some()
        })
    }

    fn subscribe_control(&self) -> TransportResult<InboundStream<ControlMessage>> {
        let id = self.id;
        self.subscribe(|state, tx| {
            state
                .connections
                .get_mut(&id)
                .map(|conn| conn.control.push(tx))
                .is_some()
        })
    }

    fn flush(&self) -> BoxFuture<'_, TransportResult<()>> {
        let result = self.ensure_open().and_then(|()| {
            if self.server.lock().connections.contains_key(&self.id) {
                Ok(())
            } else {
                Err(TransportError::NotConnected)
            }
        });
        future::ready(result).boxed()
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if self.server.lock().drop_connection(self.id).is_some() {
            debug!(target: LOG_TARGET, connection = self.id, "loopback connection closed");
        }
    }
}

impl Drop for LoopbackTransport {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn token(s: &str) -> SessionToken {
        s.parse().unwrap()
    }

    fn update_state(transport: &LoopbackTransport, who: &str, update: StateUpdate) {
        transport
            .send(ClientMessage::UpdateState {
                token: token(who),
                update,
            })
            .unwrap();
    }

    fn request_lock(transport: &LoopbackTransport, who: &str, id: u64, key: &str, weight: f32) {
        transport
            .send(ClientMessage::UpdateLocks {
                request_id: id,
                token: token(who),
                acquire: BTreeMap::from([(key.to_owned(), weight)]),
                release: BTreeSet::new(),
            })
            .unwrap();
    }

    #[tokio::test]
    async fn state_updates_are_echoed_to_every_subscriber() {
        let server = LoopbackServer::new();
        let a = server.connect();
        let b = server.connect();
        let mut a_state = a.subscribe_state().unwrap();
        let mut b_state = b.subscribe_state().unwrap();

        let update = StateUpdate::default().with_update("update.index.a", 0);
        update_state(&a, "a", update.clone());

        assert_eq!(a_state.next().await.unwrap().unwrap(), update);
        assert_eq!(b_state.next().await.unwrap().unwrap(), update);
        assert_eq!(server.value("update.index.a"), Some(Value::from(0)));
    }

    #[tokio::test]
    async fn late_subscriber_gets_snapshot_first() {
        let server = LoopbackServer::new();
        server.set_value("scene", Value::number_list([1.0, 2.0]));

        let client = server.connect();
        let mut state = client.subscribe_state().unwrap();
        let first = state.next().await.unwrap().unwrap();
        assert_eq!(first.updates.len(), 1);
        assert!(first.updates.contains_key("scene"));
    }

    #[tokio::test]
    async fn locks_are_held_by_one_session() {
        let server = LoopbackServer::new();
        let a = server.connect();
        let b = server.connect();
        let mut a_ctl = a.subscribe_control().unwrap();
        let mut b_ctl = b.subscribe_control().unwrap();

        request_lock(&a, "a", 1, "scene", 1.0);
        assert_eq!(
            a_ctl.next().await.unwrap().unwrap(),
            ControlMessage::LockResult {
                request_id: 1,
                rejected: BTreeSet::new()
            }
        );

        request_lock(&b, "b", 2, "scene", 1.0);
        assert_eq!(
            b_ctl.next().await.unwrap().unwrap(),
            ControlMessage::LockResult {
                request_id: 2,
                rejected: BTreeSet::from(["scene".to_owned()])
            }
        );
        assert_eq!(server.lock_holder("scene"), Some(token("a")));

        // b cannot write through a's lock.
        update_state(&b, "b", StateUpdate::default().with_update("scene", 1));
        assert_eq!(server.value("scene"), None);

        a.close();
        assert_eq!(server.lock_holder("scene"), None);
        request_lock(&b, "b", 3, "scene", 1.0);
        assert!(matches!(
            b_ctl.next().await.unwrap().unwrap(),
            ControlMessage::LockResult { request_id: 3, rejected } if rejected.is_empty()
        ));
    }

    #[tokio::test]
    async fn registered_commands_answer() {
        let server = LoopbackServer::new();
        server.register_command("playback/list", |_| {
            BTreeMap::from([("simulations".to_owned(), Value::List(vec!["a".into()]))])
        });
        let client = server.connect();
        let mut control = client.subscribe_control().unwrap();

        client
            .send(ClientMessage::Command(CommandRequest {
                id: 9,
                name: "playback/list".into(),
                arguments: BTreeMap::new(),
            }))
            .unwrap();

        let ControlMessage::CommandResult(response) = control.next().await.unwrap().unwrap()
        else {
            panic!("expected a command result");
        };
        assert_eq!(response.id, 9);
        assert!(response.result.contains_key("simulations"));
    }

    #[tokio::test]
    async fn severed_connection_fails_streams_and_sends() {
        let server = LoopbackServer::new();
        let client = server.connect();
        let mut frames = client.subscribe_frames().unwrap();

        assert!(server.sever(client.connection_id()));

        assert!(frames.next().await.unwrap().is_err());
        assert!(frames.next().await.is_none());
        assert!(matches!(
            client.send(ClientMessage::UpdateState {
                token: token("a"),
                update: StateUpdate::default(),
            }),
            Err(TransportError::NotConnected)
        ));
        assert!(client.flush().await.is_err());
    }

    #[tokio::test]
    async fn closed_transport_rejects_sends() {
        let server = LoopbackServer::new();
        let client = server.connect();
        client.close();
        client.close();

        assert_eq!(server.connection_count(), 0);
        assert!(matches!(
            client.subscribe_frames(),
            Err(TransportError::Closed)
        ));
    }
}
