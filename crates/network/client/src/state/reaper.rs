//! Entfernt Zustand von Peers, deren Heartbeat ausbleibt.
//!
//! Jeder Flush eines Peers enthält `update.index.<token>`; sieht der Reaper
//! diesen Schlüssel, gilt der Peer als lebendig. Bleibt ein Peer länger als
//! das Timeout stumm, werden alle Schlüssel unter seinen Präfixen entfernt.

use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use network_shared::{StateUpdate, config::ReaperConfig, prelude::keys};
use tracing::{debug, info};

use super::SharedStateStore;
use crate::LOG_TARGET;

#[derive(Debug, Clone)]
pub struct GhostReaper {
    prefixes: Vec<String>,
    timeout: Duration,
    own_token: Option<String>,
    last_seen: HashMap<String, Instant>,
}

impl GhostReaper {
    pub fn new(config: &ReaperConfig) -> Self {
        Self::with_settings(config.prefixes.clone(), config.timeout())
    }

    pub fn with_settings(prefixes: Vec<String>, timeout: Duration) -> Self {
        Self {
            prefixes,
            timeout,
            own_token: None,
            last_seen: HashMap::new(),
        }
    }

    /// The local session is never reaped.
    pub fn set_own_token(&mut self, token: Option<&str>) {
        self.own_token = token.map(str::to_owned);
        if let Some(token) = &self.own_token {
            self.last_seen.remove(token);
        }
    }

    /// Refreshes peers whose index key is updated and forgets peers whose
    /// index key was removed.
    pub fn observe_update(&mut self, update: &StateUpdate, now: Instant) {
        for key in &update.removals {
            if let Some(peer) = keys::update_index_owner(key) {
                self.forget(peer);
            }
        }
        for key in update.updates.keys() {
            let Some(peer) = keys::update_index_owner(key) else {
                continue;
            };
            if self.own_token.as_deref() == Some(peer) {
                continue;
            }
            if self.last_seen.insert(peer.to_owned(), now).is_none() {
                debug!(target: LOG_TARGET, peer, "tracking peer heartbeat");
            }
        }
    }

    pub fn forget(&mut self, peer: &str) -> bool {
        self.last_seen.remove(peer).is_some()
    }

    pub fn is_tracked(&self, peer: &str) -> bool {
        self.last_seen.contains_key(peer)
    }

    pub fn tracked_peers(&self) -> impl Iterator<Item = &str> {
        self.last_seen.keys().map(String::as_str)
    }

    /// Keys owned by `peer`, one per configured prefix.
    pub fn keys_of(&self, peer: &str) -> Vec<String> {
        self.prefixes
            .iter()
            .map(|prefix| format!("{prefix}.{peer}"))
            .collect()
    }

    /// Peers silent for longer than the timeout; they stop being tracked.
    pub fn expired(&mut self, now: Instant) -> Vec<String> {
        let timeout = self.timeout;
        let mut expired: Vec<String> = self
            .last_seen
            .iter()
            .filter(|(_, seen)| now.saturating_duration_since(**seen) > timeout)
            .map(|(peer, _)| peer.clone())
            .collect();
        expired.sort();
        for peer in &expired {
            self.last_seen.remove(peer);
        }
        expired
    }

    /// Queues removal of every key owned by an expired peer.
    pub fn sweep(&mut self, store: &mut SharedStateStore, now: Instant) -> Vec<String> {
        let expired = self.expired(now);
        for peer in &expired {
            info!(target: LOG_TARGET, peer = %peer, "removing state of silent peer");
            for key in self.keys_of(peer) {
                store.remove_local(key);
            }
        }
        expired
    }
}

impl Default for GhostReaper {
    fn default() -> Self {
        Self::new(&ReaperConfig::default())
    }
}
