//! Trajectory frames and playback commands of one session.

use std::{
    collections::BTreeMap,
    sync::Arc,
    time::{Duration, Instant},
};

use network_shared::{
    FrameUpdate, Value,
    prelude::keys::commands,
    transport::InboundStream,
};
use thiserror::Error;
use tokio::runtime::Handle;
use tracing::{trace, warn};

use crate::{
    LOG_TARGET,
    commands::{CommandArguments, CommandClient, CommandError, PendingCommand},
    frame::{DecodeError, Frame, FrameAssembler, FrameChanges},
    listeners::{ListenerId, Listeners},
    stream::{ReceiverError, StreamReceiver},
};

#[derive(Debug, Error)]
pub enum TrajectoryError {
    #[error(transparent)]
    Receiver(#[from] ReceiverError),
    #[error("frame rejected: {0}")]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error("trajectory is not open")]
    NotOpen,
}

/// Published after every applied frame update.
#[derive(Debug, Clone)]
pub struct FrameChanged {
    pub frame: Arc<Frame>,
    pub changes: FrameChanges,
    pub frame_index: u64,
}

/// Coalesces a buffered frame update with a newer one.
///
/// A reset in `incoming` throws away what was buffered. The buffered index
/// is kept while it still announces a reset, so the merged update keeps
/// clearing the frame.
pub fn merge_frame_updates(dest: &mut FrameUpdate, incoming: &FrameUpdate) {
    if incoming.is_reset() {
        dest.values.clear();
        dest.reset = true;
        dest.frame_index = incoming.frame_index;
    } else if !dest.is_reset() {
        dest.frame_index = incoming.frame_index;
    }
    dest.values.extend(
        incoming
            .values
            .iter()
            .map(|(key, value)| (key.clone(), value.clone())),
    );
}

pub struct TrajectorySession {
    window: Duration,
    receiver: StreamReceiver<FrameUpdate>,
    assembler: FrameAssembler,
    current: Option<Arc<Frame>>,
    changes: FrameChanges,
    frame_index: Option<u64>,
    listeners: Listeners<FrameChanged>,
    commands: Option<CommandClient>,
}

impl TrajectorySession {
    pub fn new(window: Duration) -> Self {
        Self::with_assembler(window, FrameAssembler::default())
    }

    pub fn with_assembler(window: Duration, assembler: FrameAssembler) -> Self {
        Self {
            window,
            receiver: StreamReceiver::new("frames", window),
            assembler,
            current: None,
            changes: FrameChanges::default(),
            frame_index: None,
            listeners: Listeners::new(),
            commands: None,
        }
    }

    pub fn assembler_mut(&mut self) -> &mut FrameAssembler {
        &mut self.assembler
    }

    /// Starts receiving frames. The previous frame, if any, is dropped.
    pub fn open(
        &mut self,
        handle: &Handle,
        frames: InboundStream<FrameUpdate>,
        commands: CommandClient,
    ) -> Result<(), ReceiverError> {
        self.receiver.close();
        self.receiver = StreamReceiver::new("frames", self.window);
        self.receiver.start(handle, frames, merge_frame_updates)?;
        self.current = None;
        self.changes = FrameChanges::default();
        self.frame_index = None;
        self.commands = Some(commands);
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.commands.is_some()
    }

    /// Applies the merged frame update of this tick, if one arrived.
    pub fn tick(&mut self, now: Instant) -> Result<bool, TrajectoryError> {
        match self.receiver.poll(now)? {
            Some(update) => {
                self.apply(&update)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Builds the next frame from `update` and notifies subscribers. A
    /// rejected update leaves the current frame in place.
    pub fn apply(&mut self, update: &FrameUpdate) -> Result<(), DecodeError> {
        let (frame, changes) = self
            .assembler
            .apply(self.current.as_deref(), update)
            .inspect_err(|err| {
                warn!(target: LOG_TARGET, index = update.frame_index, error = %err, "frame update rejected");
            })?;

        let frame = Arc::new(frame);
        trace!(target: LOG_TARGET, index = update.frame_index, fields = changes.fields.len(), "frame applied");
        self.current = Some(Arc::clone(&frame));
        self.changes = changes.clone();
        self.frame_index = Some(update.frame_index);
        self.listeners.emit(&FrameChanged {
            frame,
            changes,
            frame_index: update.frame_index,
        });
        Ok(())
    }

    pub fn current_frame(&self) -> Option<Arc<Frame>> {
        self.current.clone()
    }

    pub fn current_changes(&self) -> &FrameChanges {
        &self.changes
    }

    pub fn current_frame_index(&self) -> Option<u64> {
        self.frame_index
    }

    pub fn frames_in_window(&mut self, now: Instant) -> usize {
        self.receiver.received_in_window(now)
    }

    pub fn subscribe<F>(&mut self, callback: F) -> ListenerId
    where
        F: FnMut(&FrameChanged) + Send + 'static,
    {
        self.listeners.subscribe(callback)
    }

    pub fn unsubscribe(&mut self, id: ListenerId) -> bool {
        self.listeners.unsubscribe(id)
    }

    /// Stops the frame receiver and forgets the current frame.
    pub fn close(&mut self) {
        self.receiver.close();
        self.commands = None;
        self.current = None;
        self.changes = FrameChanges::default();
        self.frame_index = None;
    }

    fn run(&self, name: &str, arguments: CommandArguments) -> Result<PendingCommand, TrajectoryError> {
        let commands = self.commands.as_ref().ok_or(TrajectoryError::NotOpen)?;
        Ok(commands.run(name, arguments)?)
    }

    pub fn play(&self) -> Result<PendingCommand, TrajectoryError> {
        self.run(commands::PLAY, CommandArguments::new())
    }

    pub fn pause(&self) -> Result<PendingCommand, TrajectoryError> {
        self.run(commands::PAUSE, CommandArguments::new())
    }

    pub fn reset(&self) -> Result<PendingCommand, TrajectoryError> {
        self.run(commands::RESET, CommandArguments::new())
    }

    pub fn step(&self) -> Result<PendingCommand, TrajectoryError> {
        self.run(commands::STEP, CommandArguments::new())
    }

    pub fn step_backward(&self) -> Result<PendingCommand, TrajectoryError> {
        self.run(commands::STEP_BACKWARD, CommandArguments::new())
    }

    pub fn list_simulations(&self) -> Result<PendingCommand, TrajectoryError> {
        self.run(commands::LIST_SIMULATIONS, CommandArguments::new())
    }

    pub fn set_simulation_index(&self, index: u32) -> Result<PendingCommand, TrajectoryError> {
        self.run(
            commands::SET_SIMULATION_INDEX,
            BTreeMap::from([("index".to_owned(), Value::from(index))]),
        )
    }

    pub fn list_commands(&self) -> Result<PendingCommand, TrajectoryError> {
        self.run(commands::LIST_COMMANDS, CommandArguments::new())
    }
}

impl std::fmt::Debug for TrajectorySession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrajectorySession")
            .field("frame_index", &self.frame_index)
            .field("open", &self.is_open())
            .finish_non_exhaustive()
    }
}
