//! Advisory lock bookkeeping on the client side.
//!
//! A lock request is granted when the server's reply does not list the key
//! as rejected. The table remembers which keys this session holds and which
//! requests are still in flight.

use std::collections::{BTreeMap, BTreeSet};

use tokio::sync::oneshot::{self, error::TryRecvError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOutcome {
    Granted,
    Rejected,
}

#[derive(Debug)]
enum TicketState {
    Ready(LockOutcome),
    Waiting(oneshot::Receiver<LockOutcome>),
}

/// Handle for the outcome of one lock acquisition.
///
/// A request that is cancelled by a release or a disconnect reads as rejected.
#[derive(Debug)]
pub struct LockTicket {
    key: String,
    state: TicketState,
}

impl LockTicket {
    fn ready(key: &str, outcome: LockOutcome) -> Self {
        Self {
            key: key.to_owned(),
            state: TicketState::Ready(outcome),
        }
    }

    fn waiting(key: &str, rx: oneshot::Receiver<LockOutcome>) -> Self {
        Self {
            key: key.to_owned(),
            state: TicketState::Waiting(rx),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Non-blocking; `None` while the reply is outstanding.
    pub fn try_outcome(&mut self) -> Option<LockOutcome> {
        let outcome = match &mut self.state {
            TicketState::Ready(outcome) => return Some(*outcome),
            TicketState::Waiting(rx) => match rx.try_recv() {
                Ok(outcome) => outcome,
                Err(TryRecvError::Empty) => return None,
                Err(TryRecvError::Closed) => LockOutcome::Rejected,
            },
        };
        self.state = TicketState::Ready(outcome);
        Some(outcome)
    }

    pub async fn outcome(self) -> LockOutcome {
        match self.state {
            TicketState::Ready(outcome) => outcome,
            TicketState::Waiting(rx) => rx.await.unwrap_or(LockOutcome::Rejected),
        }
    }
}

#[derive(Debug)]
struct PendingRequest {
    key: String,
    waiters: Vec<oneshot::Sender<LockOutcome>>,
}

/// Result of starting an acquisition.
#[derive(Debug)]
pub(crate) enum Acquire {
    /// Already held or already requested; nothing to send.
    Known(LockTicket),
    /// A new request must go out under `request_id`.
    Send { request_id: u64, ticket: LockTicket },
}

#[derive(Debug, Default)]
pub(crate) struct LockTable {
    next_request: u64,
    held: BTreeSet<String>,
    pending: BTreeMap<u64, PendingRequest>,
}

impl LockTable {
    pub fn next_request_id(&mut self) -> u64 {
        self.next_request += 1;
        self.next_request
    }

    pub fn is_held(&self, key: &str) -> bool {
        self.held.contains(key)
    }

    pub fn is_pending(&self, key: &str) -> bool {
        self.pending.values().any(|request| request.key == key)
    }

    pub fn held(&self) -> impl Iterator<Item = &str> {
        self.held.iter().map(String::as_str)
    }

    pub fn begin_acquire(&mut self, key: &str) -> Acquire {
        if self.held.contains(key) {
            return Acquire::Known(LockTicket::ready(key, LockOutcome::Granted));
        }
        let (tx, rx) = oneshot::channel();
        if let Some(request) = self.pending.values_mut().find(|request| request.key == key) {
            request.waiters.push(tx);
            return Acquire::Known(LockTicket::waiting(key, rx));
        }

        let request_id = self.next_request_id();
        self.pending.insert(
            request_id,
            PendingRequest {
                key: key.to_owned(),
                waiters: vec![tx],
            },
        );
        Acquire::Send {
            request_id,
            ticket: LockTicket::waiting(key, rx),
        }
    }

    /// Forgets a request whose message never left.
    pub fn abort(&mut self, request_id: u64) {
        self.pending.remove(&request_id);
    }

    /// Settles a request. Unknown ids (releases, cancelled requests) yield `None`.
    pub fn resolve(
        &mut self,
        request_id: u64,
        rejected: &BTreeSet<String>,
    ) -> Option<(String, LockOutcome)> {
        let request = self.pending.remove(&request_id)?;
        let outcome = if rejected.contains(&request.key) {
            LockOutcome::Rejected
        } else {
            self.held.insert(request.key.clone());
            LockOutcome::Granted
        };
        for waiter in request.waiters {
            let _ = waiter.send(outcome);
        }
        Some((request.key, outcome))
    }

    /// Drops any claim on `key` and returns the id for the release message.
    pub fn release(&mut self, key: &str) -> u64 {
        self.held.remove(key);
        self.pending.retain(|_, request| request.key != key);
        self.next_request_id()
    }

    /// Clears the table, returning every key that was held or requested.
    pub fn drain(&mut self) -> BTreeSet<String> {
        let mut keys = std::mem::take(&mut self.held);
        keys.extend(
            std::mem::take(&mut self.pending)
                .into_values()
                .map(|request| request.key),
        );
        keys
    }
}
