//! Typed, lock-guarded view of a single shared key.

use network_shared::{Value, prelude::TransportError};
use tracing::debug;

use super::{LockOutcome, LockTicket, SharedStateStore};
use crate::LOG_TARGET;

/// Converts between a typed value and its protocol representation.
pub trait ValueCodec {
    type Item: Clone;

    fn encode(&self, item: &Self::Item) -> Value;

    /// `None` for values of the wrong shape.
    fn decode(&self, value: &Value) -> Option<Self::Item>;
}

/// Position, rotation (quaternion x, y, z, w) and scale.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pose {
    pub position: [f32; 3],
    pub rotation: [f32; 4],
    pub scale: [f32; 3],
}

impl Pose {
    pub const IDENTITY: Pose = Pose {
        position: [0.0; 3],
        rotation: [0.0, 0.0, 0.0, 1.0],
        scale: [1.0; 3],
    };
}

impl Default for Pose {
    fn default() -> Self {
        Self::IDENTITY
    }
}

/// Ten numbers: position, rotation, scale. A null value is the identity.
#[derive(Debug, Clone, Copy, Default)]
pub struct PoseCodec;

impl ValueCodec for PoseCodec {
    type Item = Pose;

    fn encode(&self, pose: &Pose) -> Value {
        Value::number_list(
            pose.position
                .iter()
                .chain(&pose.rotation)
                .chain(&pose.scale)
                .copied(),
        )
    }

    fn decode(&self, value: &Value) -> Option<Pose> {
        if value.is_null() {
            return Some(Pose::IDENTITY);
        }
        let numbers = value
            .as_list()?
            .iter()
            .map(|n| n.as_f64().map(|n| n as f32))
            .collect::<Option<Vec<f32>>>()?;
        let [px, py, pz, rx, ry, rz, rw, sx, sy, sz] = <[f32; 10]>::try_from(numbers).ok()?;
        Some(Pose {
            position: [px, py, pz],
            rotation: [rx, ry, rz, rw],
            scale: [sx, sy, sz],
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    Unlocked,
    Pending,
    Locked,
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceEvent {
    LockGranted,
    LockRejected,
}

/// One key of the shared state, written only while its lock is held.
#[derive(Debug)]
pub struct SharedResource<C: ValueCodec> {
    key: String,
    codec: C,
    local: Option<C::Item>,
    state: LockState,
    ticket: Option<LockTicket>,
}

impl<C> SharedResource<C>
where
    C: ValueCodec,
{
    pub fn new(key: impl Into<String>, codec: C) -> Self {
        Self {
            key: key.into(),
            codec,
            local: None,
            state: LockState::Unlocked,
            ticket: None,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn lock_state(&self) -> LockState {
        self.state
    }

    pub fn has_local_value(&self) -> bool {
        self.local.is_some()
    }

    /// The local value while the lock is held or requested, otherwise the
    /// replicated one.
    pub fn value(&self, store: &SharedStateStore) -> Option<C::Item> {
        if matches!(self.state, LockState::Pending | LockState::Locked) {
            if let Some(local) = &self.local {
                return Some(local.clone());
            }
        }
        store.get(&self.key).and_then(|value| self.codec.decode(value))
    }

    /// Stores `item` locally and publishes it once the lock is held.
    pub fn update_value_with_lock(
        &mut self,
        store: &mut SharedStateStore,
        item: C::Item,
    ) -> Result<(), TransportError> {
        self.local = Some(item);
        if self.state == LockState::Locked && !store.holds_lock(&self.key) {
            debug!(target: LOG_TARGET, key = %self.key, "resource lock lost, requesting again");
            self.state = LockState::Unlocked;
        }
        match self.state {
            LockState::Locked => self.publish(store),
            LockState::Pending => {}
            LockState::Unlocked | LockState::Rejected => {
                self.ticket = Some(store.acquire_lock(&self.key)?);
                self.state = LockState::Pending;
                self.poll_lock(store);
            }
        }
        Ok(())
    }

    /// Advances a pending lock request. Called once per tick.
    pub fn poll_lock(&mut self, store: &mut SharedStateStore) -> Option<ResourceEvent> {
        if self.state != LockState::Pending {
            return None;
        }
        let outcome = self.ticket.as_mut()?.try_outcome()?;
        self.ticket = None;
        match outcome {
            LockOutcome::Granted => {
                self.state = LockState::Locked;
                self.publish(store);
                Some(ResourceEvent::LockGranted)
            }
            LockOutcome::Rejected => {
                debug!(target: LOG_TARGET, key = %self.key, "resource lock rejected, local value dropped");
                self.state = LockState::Rejected;
                self.local = None;
                Some(ResourceEvent::LockRejected)
            }
        }
    }

    /// Drops the local value and gives the lock back.
    pub fn release_lock(&mut self, store: &mut SharedStateStore) -> Result<(), TransportError> {
        self.local = None;
        self.ticket = None;
        self.state = LockState::Unlocked;
        store.release_lock(&self.key)
    }

    fn publish(&self, store: &mut SharedStateStore) {
        if let Some(item) = &self.local {
            store.set_local(self.key.clone(), self.codec.encode(item));
        }
    }
}
