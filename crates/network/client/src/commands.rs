//! Request/response correlation for server commands.
//!
//! Replies arrive on the control stream and are resolved from the tick
//! thread; callers either await a [`PendingCommand`] or poll it.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
};

use network_shared::{
    CommandRequest, CommandResponse, Value,
    prelude::{MessageSink, TransportError},
    protocol::ClientMessage,
};
use thiserror::Error;
use tokio::sync::oneshot::{self, error::TryRecvError};
use tracing::{debug, warn};

use crate::LOG_TARGET;

pub type CommandArguments = BTreeMap<String, Value>;
pub type CommandResult = BTreeMap<String, Value>;

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("command could not be sent: {0}")]
    Transport(#[from] TransportError),
    #[error("command {0} was abandoned before a reply arrived")]
    Abandoned(String),
}

type Waiters = HashMap<u64, (String, oneshot::Sender<CommandResult>)>;

/// Cheap-to-clone handle sending commands over one connection.
#[derive(Clone)]
pub struct CommandClient {
    sink: Arc<dyn MessageSink>,
    next_id: Arc<AtomicU64>,
    pending: Arc<Mutex<Waiters>>,
}

impl CommandClient {
    pub fn new(sink: Arc<dyn MessageSink>) -> Self {
        Self {
            sink,
            next_id: Arc::new(AtomicU64::new(1)),
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn pending(&self) -> MutexGuard<'_, Waiters> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sends `name` with `arguments` and returns a handle for the reply.
    pub fn run(
        &self,
        name: &str,
        arguments: CommandArguments,
    ) -> Result<PendingCommand, CommandError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending().insert(id, (name.to_owned(), tx));

        let request = CommandRequest {
            id,
            name: name.to_owned(),
            arguments,
        };
        if let Err(err) = self.sink.send(ClientMessage::Command(request)) {
            self.pending().remove(&id);
            warn!(target: LOG_TARGET, command = name, error = %err, "command send failed");
            return Err(err.into());
        }
        debug!(target: LOG_TARGET, command = name, id, "command sent");
        Ok(PendingCommand {
            name: name.to_owned(),
            reply: rx,
        })
    }

    /// Hands a reply to whoever waits for it. Unknown ids are ignored.
    pub fn resolve(&self, response: CommandResponse) {
        match self.pending().remove(&response.id) {
            Some((_, tx)) => {
                let _ = tx.send(response.result);
            }
            None => debug!(target: LOG_TARGET, id = response.id, "reply for unknown command"),
        }
    }

    /// Drops every waiter; their handles report [`CommandError::Abandoned`].
    pub fn abandon_all(&self) {
        let abandoned = std::mem::take(&mut *self.pending());
        if !abandoned.is_empty() {
            debug!(target: LOG_TARGET, count = abandoned.len(), "abandoning pending commands");
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending().len()
    }
}

impl std::fmt::Debug for CommandClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandClient")
            .field("pending", &self.pending_count())
            .finish()
    }
}

/// Reply handle of one command.
#[derive(Debug)]
pub struct PendingCommand {
    name: String,
    reply: oneshot::Receiver<CommandResult>,
}

impl PendingCommand {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Non-blocking check for the reply.
    pub fn try_result(&mut self) -> Option<Result<CommandResult, CommandError>> {
        match self.reply.try_recv() {
            Ok(result) => Some(Ok(result)),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Closed) => Some(Err(CommandError::Abandoned(self.name.clone()))),
        }
    }

    pub async fn wait(self) -> Result<CommandResult, CommandError> {
        self.reply
            .await
            .map_err(|_| CommandError::Abandoned(self.name))
    }
}
