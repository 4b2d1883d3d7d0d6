//! Client replica of the shared dictionary.
//!
//! Local writes land in a pending batch which the periodic flush hands to the
//! transport as one message. Reads only see the replica, i.e. what the server
//! has echoed. Every flush carries an increasing update index under
//! `update.index.<token>`; its echo yields the acknowledged index and the
//! round-trip time.

use std::{
    collections::{BTreeMap, BTreeSet},
    mem,
    sync::Arc,
    time::{Duration, Instant},
};

use network_shared::{
    StateUpdate, Value,
    prelude::{MessageSink, SessionToken, TransportError, keys},
    protocol::ClientMessage,
};
use tracing::{debug, info, trace, warn};

use super::{
    StateEvent,
    lock::{Acquire, LockOutcome, LockTable, LockTicket},
};
use crate::{
    LOG_TARGET,
    listeners::{ListenerId, Listeners},
};

struct Connection {
    token: SessionToken,
    index_key: String,
    sink: Arc<dyn MessageSink>,
}

#[derive(Debug, Default)]
pub struct SharedStateStore {
    connection: Option<Connection>,
    pending_values: BTreeMap<String, Value>,
    pending_removals: BTreeSet<String>,
    replica: BTreeMap<String, Value>,
    next_index: u64,
    last_sent_index: Option<u64>,
    last_ack_index: Option<u64>,
    last_ack_at: Option<Instant>,
    send_times: BTreeMap<u64, Instant>,
    last_rtt: Option<Duration>,
    last_flush: Option<Instant>,
    locks: LockTable,
    listeners: Listeners<StateEvent>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("token", &self.token)
            .finish_non_exhaustive()
    }
}

impl SharedStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attaches the store to a connection. Index counters restart at zero.
    pub fn connect(&mut self, token: SessionToken, sink: Arc<dyn MessageSink>) {
        if let Some(previous) = &self.connection {
            warn!(target: LOG_TARGET, token = %previous.token, "store reconnected without disconnect");
        }
        self.reset_indices();
        self.next_index = 0;
        let index_key = keys::update_index(&token);
        info!(target: LOG_TARGET, %token, "shared state attached");
        self.connection = Some(Connection {
            token,
            index_key,
            sink,
        });
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    pub fn token(&self) -> Option<&SessionToken> {
        self.connection.as_ref().map(|connection| &connection.token)
    }

    /// `update.index.<token>` of the attached session.
    pub fn index_key(&self) -> Option<&str> {
        self.connection
            .as_ref()
            .map(|connection| connection.index_key.as_str())
    }

    pub fn set_local(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        let key = key.into();
        self.pending_removals.remove(&key);
        self.pending_values.insert(key, value.into());
    }

    pub fn remove_local(&mut self, key: impl Into<String>) {
        let key = key.into();
        self.pending_values.remove(&key);
        self.pending_removals.insert(key);
    }

    /// Replicated value of `key`. Unflushed local writes are not visible.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.replica.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.replica.contains_key(key)
    }

    pub fn replica(&self) -> &BTreeMap<String, Value> {
        &self.replica
    }

    pub fn pending_values(&self) -> &BTreeMap<String, Value> {
        &self.pending_values
    }

    pub fn pending_removals(&self) -> &BTreeSet<String> {
        &self.pending_removals
    }

    pub fn has_pending(&self) -> bool {
        !self.pending_values.is_empty() || !self.pending_removals.is_empty()
    }

    /// Stamps the next update index into the pending batch and remembers when
    /// it left. Skipped while the index key itself is pending removal.
    pub fn heartbeat(&mut self, now: Instant) -> bool {
        let Some(index_key) = self.index_key().map(str::to_owned) else {
            return false;
        };
        if self.pending_removals.contains(&index_key) {
            return false;
        }
        let index = self.next_index;
        self.pending_values.insert(index_key, Value::from(index));
        self.last_sent_index = Some(index);
        self.send_times.insert(index, now);
        true
    }

    /// Sends everything pending as one update.
    ///
    /// Returns whether a message was handed to the transport. The pending
    /// batch is gone afterwards even if sending failed; the next flush only
    /// carries what was written since.
    pub fn flush_tick(&mut self, now: Instant) -> Result<bool, TransportError> {
        if !self.has_pending() {
            return Ok(false);
        }
        let Some((token, sink)) = self
            .connection
            .as_ref()
            .map(|connection| (connection.token.clone(), Arc::clone(&connection.sink)))
        else {
            return Ok(false);
        };

        let stamped = self.heartbeat(now);
        let update = StateUpdate {
            updates: mem::take(&mut self.pending_values),
            removals: mem::take(&mut self.pending_removals),
        };
        if stamped {
            trace!(target: LOG_TARGET, index = self.next_index, keys = update.updates.len(), "flushing state");
        }
        self.next_index += 1;
        self.last_flush = Some(now);

        sink.send(ClientMessage::UpdateState { token, update })
            .inspect_err(|err| {
                warn!(target: LOG_TARGET, error = %err, "state flush dropped");
            })?;
        Ok(true)
    }

    pub fn last_flush(&self) -> Option<Instant> {
        self.last_flush
    }

    /// Applies a merged remote batch: the own index echo first, then
    /// removals, then updates. Listeners hear about every other key.
    pub fn apply_remote(&mut self, update: StateUpdate, now: Instant) {
        let own_index = self.index_key().map(str::to_owned);
        if let Some(echo) = own_index.as_ref().and_then(|key| update.updates.get(key)) {
            self.acknowledge(echo, now);
        }

        for key in update.removals {
            if own_index.as_ref() == Some(&key) {
                continue;
            }
            self.replica.remove(&key);
            self.listeners.emit(&StateEvent::Removed { key });
        }
        for (key, value) in update.updates {
            if own_index.as_ref() == Some(&key) {
                continue;
            }
            self.replica.insert(key.clone(), value.clone());
            self.listeners.emit(&StateEvent::Updated { key, value });
        }
    }

    fn acknowledge(&mut self, echo: &Value, now: Instant) {
        let Some(echoed) = echo.as_i64().and_then(|index| u64::try_from(index).ok()) else {
            warn!(target: LOG_TARGET, kind = echo.kind(), "malformed update index echo");
            return;
        };
        if self.last_sent_index.map_or(true, |sent| echoed > sent) {
            warn!(target: LOG_TARGET, echoed, "echo of an index that was never sent");
            return;
        }

        self.last_ack_index = Some(self.last_ack_index.map_or(echoed, |ack| ack.max(echoed)));
        self.last_ack_at = Some(now);
        if let Some(sent_at) = self.send_times.get(&echoed) {
            let rtt = now.saturating_duration_since(*sent_at);
            trace!(target: LOG_TARGET, index = echoed, rtt_ms = rtt.as_millis() as u64, "index acknowledged");
            self.last_rtt = Some(rtt);
        }
        self.send_times.retain(|index, _| *index > echoed);
    }

    pub fn last_sent_index(&self) -> Option<u64> {
        self.last_sent_index
    }

    pub fn last_acknowledged_index(&self) -> Option<u64> {
        self.last_ack_index
    }

    pub fn tracked_indices(&self) -> impl Iterator<Item = u64> + '_ {
        self.send_times.keys().copied()
    }

    pub fn last_rtt(&self) -> Option<Duration> {
        self.last_rtt
    }

    /// True while a sent index is newer than the last acknowledged one.
    pub fn awaiting_index(&self) -> bool {
        match (self.last_ack_index, self.last_sent_index) {
            (Some(ack), Some(sent)) => ack < sent,
            _ => false,
        }
    }

    pub fn time_since_index(&self, now: Instant) -> Duration {
        match self.last_ack_at {
            Some(at) if self.awaiting_index() => now.saturating_duration_since(at),
            _ => Duration::ZERO,
        }
    }

    /// Requests the advisory lock on `key`.
    ///
    /// A held lock resolves immediately; a second request for a key already
    /// in flight shares the first request's reply.
    pub fn acquire_lock(&mut self, key: &str) -> Result<LockTicket, TransportError> {
        let Some(connection) = &self.connection else {
            return Err(TransportError::NotConnected);
        };
        match self.locks.begin_acquire(key) {
            Acquire::Known(ticket) => Ok(ticket),
            Acquire::Send { request_id, ticket } => {
                let message = ClientMessage::UpdateLocks {
                    request_id,
                    token: connection.token.clone(),
                    acquire: BTreeMap::from([(key.to_owned(), 1.0)]),
                    release: BTreeSet::new(),
                };
                if let Err(err) = connection.sink.send(message) {
                    self.locks.abort(request_id);
                    return Err(err);
                }
                debug!(target: LOG_TARGET, key, request_id, "lock requested");
                Ok(ticket)
            }
        }
    }

    /// Releases `key`. Releasing a lock that is not held only sends the
    /// release request.
    pub fn release_lock(&mut self, key: &str) -> Result<(), TransportError> {
        let request_id = self.locks.release(key);
        let Some(connection) = &self.connection else {
            return Ok(());
        };
        debug!(target: LOG_TARGET, key, request_id, "lock released");
        connection.sink.send(ClientMessage::UpdateLocks {
            request_id,
            token: connection.token.clone(),
            acquire: BTreeMap::new(),
            release: BTreeSet::from([key.to_owned()]),
        })
    }

    pub fn holds_lock(&self, key: &str) -> bool {
        self.locks.is_held(key)
    }

    pub fn lock_pending(&self, key: &str) -> bool {
        self.locks.is_pending(key)
    }

    /// Settles a lock request from the server's reply.
    pub fn handle_lock_result(&mut self, request_id: u64, rejected: &BTreeSet<String>) {
        let Some((key, outcome)) = self.locks.resolve(request_id, rejected) else {
            trace!(target: LOG_TARGET, request_id, "lock reply without pending request");
            return;
        };
        let event = match outcome {
            LockOutcome::Granted => {
                debug!(target: LOG_TARGET, key = %key, "lock granted");
                StateEvent::LockGranted { key }
            }
            LockOutcome::Rejected => {
                info!(target: LOG_TARGET, key = %key, "lock rejected");
                StateEvent::LockRejected { key }
            }
        };
        self.listeners.emit(&event);
    }

    /// Tears the store down.
    ///
    /// Every replicated key is reported as removed. Held locks and the
    /// session's own keys are released in one last flush before the
    /// connection is dropped.
    pub fn disconnect(&mut self, now: Instant) -> Result<(), TransportError> {
        self.pending_values.clear();
        self.pending_removals.clear();
        for key in mem::take(&mut self.replica).into_keys() {
            self.listeners.emit(&StateEvent::Removed { key });
        }
        self.reset_indices();

        let released = self.locks.drain();
        let Some(connection) = self.connection.take() else {
            return Ok(());
        };

        let mut result = Ok(());
        if !released.is_empty() {
            let request_id = self.locks.next_request_id();
            result = connection.sink.send(ClientMessage::UpdateLocks {
                request_id,
                token: connection.token.clone(),
                acquire: BTreeMap::new(),
                release: released,
            });
        }

        let token = connection.token.clone();
        self.remove_local(keys::update_index(&token));
        self.remove_local(keys::avatar(&token));
        self.remove_local(keys::play_area(&token));
        self.remove_local(keys::play_origin(&token));
        self.remove_local(keys::health_report(&token));

        self.connection = Some(connection);
        let flushed = self.flush_tick(now);
        self.connection = None;
        self.next_index = 0;
        self.send_times.clear();
        info!(target: LOG_TARGET, %token, "shared state detached");

        result.and(flushed.map(drop))
    }

    fn reset_indices(&mut self) {
        self.last_sent_index = None;
        self.last_ack_index = None;
        self.last_ack_at = None;
        self.last_rtt = None;
        self.last_flush = None;
        self.send_times.clear();
    }

    pub fn subscribe<F>(&mut self, callback: F) -> ListenerId
    where
        F: FnMut(&StateEvent) + Send + 'static,
    {
        self.listeners.subscribe(callback)
    }

    pub fn unsubscribe(&mut self, id: ListenerId) -> bool {
        self.listeners.unsubscribe(id)
    }
}
