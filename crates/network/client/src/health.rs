//! Connection health: receive rates and index round-trip time.

use std::{
    collections::{BTreeMap, VecDeque},
    time::{Duration, Instant},
};

use network_shared::{
    Value,
    config::HealthConfig,
    prelude::{SessionToken, keys},
};

/// Receive timestamps within a sliding window.
#[derive(Debug, Clone)]
pub struct ThroughputWindow {
    window: Duration,
    stamps: VecDeque<Instant>,
}

impl ThroughputWindow {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            stamps: VecDeque::new(),
        }
    }

    pub fn record(&mut self, now: Instant) {
        self.stamps.push_back(now);
        self.expire(now);
    }

    /// Number of receipts younger than the window at `now`.
    pub fn count(&mut self, now: Instant) -> usize {
        self.expire(now);
        self.stamps.len()
    }

    pub fn last(&self) -> Option<Instant> {
        self.stamps.back().copied()
    }

    fn expire(&mut self, now: Instant) {
        while let Some(oldest) = self.stamps.front() {
            if now.saturating_duration_since(*oldest) >= self.window {
                self.stamps.pop_front();
            } else {
                break;
            }
        }
    }
}

impl Default for ThroughputWindow {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

/// Point-in-time view for diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionHealth {
    /// Merged frame updates delivered within the window.
    pub frames: usize,
    /// Merged state updates delivered within the window.
    pub state: usize,
    pub last_rtt: Option<Duration>,
    pub awaiting_index: bool,
    pub time_since_index: Duration,
}

impl ConnectionHealth {
    pub fn rtt_ms(&self) -> i64 {
        self.last_rtt.map_or(-1, |rtt| rtt.as_millis() as i64)
    }

    /// Shape written under `report.connection.health.<token>`.
    pub fn to_value(&self) -> Value {
        Value::Map(BTreeMap::from([
            ("frame".to_owned(), Value::from(self.frames as u64)),
            ("state".to_owned(), Value::from(self.state as u64)),
            ("rtt".to_owned(), Value::from(self.rtt_ms())),
        ]))
    }
}

/// Decides whether this client publishes its health into the shared state.
///
/// The local setting is the starting point; a boolean under
/// `suggested.report.connection.health` overrides it for every client.
#[derive(Debug, Clone)]
pub struct HealthReporter {
    enabled: bool,
}

impl HealthReporter {
    pub fn new(config: &HealthConfig) -> Self {
        Self {
            enabled: config.report_to_state,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Applies a remote suggestion. Non-boolean values are ignored.
    pub fn suggest(&mut self, value: &Value) {
        if let Some(report) = value.as_bool() {
            self.enabled = report;
        }
    }

    /// Key and value to publish, if reporting is on.
    pub fn report(&self, token: &SessionToken, health: &ConnectionHealth) -> Option<(String, Value)> {
        self.enabled
            .then(|| (keys::health_report(token), health.to_value()))
    }
}
