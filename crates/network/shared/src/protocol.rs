//! Messages exchanged between the sync client and a trajectory/multiplayer server.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::{SessionToken, Value};

pub const PROTOCOL_VERSION: u16 = 1;

/// Well-known keys of the shared state and the frame schema.
pub mod keys {
    use crate::SessionToken;

    /// Prefix of the per-session update index (`update.index.<token>`).
    pub const UPDATE_INDEX_PREFIX: &str = "update.index";
    pub const AVATAR_PREFIX: &str = "avatar";
    pub const PLAY_AREA_PREFIX: &str = "playarea";
    pub const PLAY_ORIGIN_PREFIX: &str = "playorigin";
    pub const HEALTH_REPORT_PREFIX: &str = "report.connection.health";

    /// Transformation of the simulation box.
    pub const SIMULATION_POSE: &str = "scene";
    /// Boolean toggling connection-health reporting for every client.
    pub const SUGGEST_HEALTH_REPORT: &str = "suggested.report.connection.health";

    pub fn update_index(token: &SessionToken) -> String {
        token.key(UPDATE_INDEX_PREFIX)
    }

    pub fn avatar(token: &SessionToken) -> String {
        token.key(AVATAR_PREFIX)
    }

    pub fn play_area(token: &SessionToken) -> String {
        token.key(PLAY_AREA_PREFIX)
    }

    pub fn play_origin(token: &SessionToken) -> String {
        token.key(PLAY_ORIGIN_PREFIX)
    }

    pub fn health_report(token: &SessionToken) -> String {
        token.key(HEALTH_REPORT_PREFIX)
    }

    /// Returns the token part of an `update.index.<token>` key.
    pub fn update_index_owner(key: &str) -> Option<&str> {
        key.strip_prefix(UPDATE_INDEX_PREFIX)
            .and_then(|rest| rest.strip_prefix('.'))
            .filter(|token| !token.is_empty())
    }

    /// Field identifiers of the standard frame schema.
    pub mod frame {
        pub const PARTICLE_COUNT: &str = "particle.count";
        pub const RESIDUE_COUNT: &str = "residue.count";
        pub const CHAIN_COUNT: &str = "chain.count";
        pub const PARTICLE_POSITIONS: &str = "particle.positions";
        pub const PARTICLE_ELEMENTS: &str = "particle.elements";
        pub const PARTICLE_RESIDUES: &str = "particle.residues";
        pub const PARTICLE_NAMES: &str = "particle.names";
        pub const RESIDUE_NAMES: &str = "residue.names";
        pub const RESIDUE_CHAINS: &str = "residue.chains";
        pub const CHAIN_NAMES: &str = "chain.names";
        pub const BOND_PAIRS: &str = "bond.pairs";
        pub const BOND_ORDERS: &str = "bond.orders";
        pub const BOX_VECTORS: &str = "system.box.vectors";
    }

    /// Names of the standard trajectory commands.
    pub mod commands {
        pub const PLAY: &str = "playback/play";
        pub const PAUSE: &str = "playback/pause";
        pub const RESET: &str = "playback/reset";
        pub const STEP: &str = "playback/step";
        pub const STEP_BACKWARD: &str = "playback/step_back";
        pub const LIST_SIMULATIONS: &str = "playback/list";
        pub const SET_SIMULATION_INDEX: &str = "playback/load";
        pub const LIST_COMMANDS: &str = "commands/list";
    }
}

/// A sparse frame update as delivered by the trajectory stream.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FrameUpdate {
    pub frame_index: u64,
    /// Explicit "full frame" flag. Index zero carries the same meaning.
    pub reset: bool,
    pub values: BTreeMap<String, Value>,
}

impl FrameUpdate {
    pub fn new(frame_index: u64) -> Self {
        Self {
            frame_index,
            ..Self::default()
        }
    }

    pub fn with_value(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }

    pub fn with_reset(mut self) -> Self {
        self.reset = true;
        self
    }

    /// Does this update discard everything that came before it?
    pub fn is_reset(&self) -> bool {
        self.reset || self.frame_index == 0
    }
}

/// A batch of shared-state changes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateUpdate {
    pub updates: BTreeMap<String, Value>,
    pub removals: BTreeSet<String>,
}

impl StateUpdate {
    pub fn is_empty(&self) -> bool {
        self.updates.is_empty() && self.removals.is_empty()
    }

    pub fn with_update(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        let key = key.into();
        self.removals.remove(&key);
        self.updates.insert(key, value.into());
        self
    }

    pub fn with_removal(mut self, key: impl Into<String>) -> Self {
        let key = key.into();
        self.updates.remove(&key);
        self.removals.insert(key);
        self
    }

    /// Folds a later batch into this one. Later values win; a later removal
    /// cancels an earlier update of the same key and vice versa.
    pub fn merge_from(&mut self, later: &StateUpdate) {
        for key in &later.removals {
            self.updates.remove(key);
            self.removals.insert(key.clone());
        }
        for (key, value) in &later.updates {
            self.removals.remove(key);
            self.updates.insert(key.clone(), value.clone());
        }
    }
}

/// A trajectory or server command invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandRequest {
    pub id: u64,
    pub name: String,
    pub arguments: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResponse {
    pub id: u64,
    pub result: BTreeMap<String, Value>,
}

/// Client → server messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClientMessage {
    UpdateState {
        token: SessionToken,
        update: StateUpdate,
    },
    /// Weighted lock request. A weight greater than zero acquires; keys in
    /// `release` are freed.
    UpdateLocks {
        request_id: u64,
        token: SessionToken,
        acquire: BTreeMap<String, f32>,
        release: BTreeSet<String>,
    },
    Command(CommandRequest),
}

/// Server → client replies that must never be coalesced, only concatenated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ControlMessage {
    /// Outcome of an `UpdateLocks` request. An empty `rejected` set means granted.
    LockResult {
        request_id: u64,
        rejected: BTreeSet<String>,
    },
    CommandResult(CommandResponse),
}

/// Everything a server may push over a single duplex connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ServerMessage {
    Frame(FrameUpdate),
    State(StateUpdate),
    Control(ControlMessage),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_index_means_reset() {
        assert!(FrameUpdate::new(0).is_reset());
        assert!(!FrameUpdate::new(7).is_reset());
        assert!(FrameUpdate::new(7).with_reset().is_reset());
    }

    #[test]
    fn update_index_owner_parses_token() {
        assert_eq!(keys::update_index_owner("update.index.p1"), Some("p1"));
        assert_eq!(keys::update_index_owner("update.index."), None);
        assert_eq!(keys::update_index_owner("update.indexp1"), None);
        assert_eq!(keys::update_index_owner("avatar.p1"), None);
    }

    #[test]
    fn merge_from_keeps_key_in_one_collection() {
        let mut first = StateUpdate::default()
            .with_update("a", 1)
            .with_removal("b");
        let later = StateUpdate::default()
            .with_removal("a")
            .with_update("b", 2);
        first.merge_from(&later);

        assert!(first.removals.contains("a"));
        assert!(!first.updates.contains_key("a"));
        assert_eq!(first.updates.get("b"), Some(&Value::from(2)));
        assert!(!first.removals.contains("b"));
    }
}
