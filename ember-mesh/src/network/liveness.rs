//! Liveness
//!
//! Ping cadence, round-trip measurement and traffic counters. Silent-link
//! detection itself lives in the negotiator, which owns the links.

use std::collections::BTreeMap;
use std::time::Duration;

use tokio::time::Instant;

use crate::core::ids::PeerId;

/// Snapshot of network health for the UI.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct NetworkStats {
    /// Most recent round trip to any peer.
    pub latency: Option<Duration>,
    /// Most recent round trip per peer.
    pub per_peer: BTreeMap<PeerId, Duration>,
    /// Open links.
    pub peers: usize,
    /// Channel messages sent (one per link).
    pub messages_sent: u64,
    /// Channel messages received.
    pub messages_received: u64,
}

/// Tracks pings and counters.
#[derive(Debug)]
pub struct Liveness {
    interval: Duration,
    epoch: Instant,
    last_round: Option<Instant>,
    rtt: BTreeMap<PeerId, Duration>,
    latest: Option<Duration>,
    sent: u64,
    received: u64,
}

impl Liveness {
    /// Ping every `interval`.
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            epoch: Instant::now(),
            last_round: None,
            rtt: BTreeMap::new(),
            latest: None,
            sent: 0,
            received: 0,
        }
    }

    /// If a ping round is due, start it and return the timestamp to send.
    pub fn due(&mut self, now: Instant) -> Option<u64> {
        if let Some(last) = self.last_round {
            if now.saturating_duration_since(last) < self.interval {
                return None;
            }
        }
        self.last_round = Some(now);
        Some(self.stamp(now))
    }

    /// Milliseconds since this tracker was created.
    pub fn stamp(&self, now: Instant) -> u64 {
        now.saturating_duration_since(self.epoch).as_millis() as u64
    }

    /// Record an echoed ping. Timestamps from the future are ignored.
    pub fn record_pong(&mut self, peer: &PeerId, timestamp: u64, now: Instant) -> Option<Duration> {
        let elapsed = self.stamp(now).checked_sub(timestamp)?;
        let rtt = Duration::from_millis(elapsed);
        self.rtt.insert(peer.clone(), rtt);
        self.latest = Some(rtt);
        Some(rtt)
    }

    /// Count outbound messages.
    pub fn record_sent(&mut self, count: usize) {
        self.sent += count as u64;
    }

    /// Count one inbound message.
    pub fn record_received(&mut self) {
        self.received += 1;
    }

    /// Drop a peer's measurement.
    pub fn forget(&mut self, peer: &PeerId) {
        self.rtt.remove(peer);
    }

    /// Drop every measurement and counter.
    pub fn reset(&mut self) {
        self.rtt.clear();
        self.latest = None;
        self.last_round = None;
        self.sent = 0;
        self.received = 0;
    }

    /// Current figures.
    pub fn stats(&self, peers: usize) -> NetworkStats {
        NetworkStats {
            latency: self.latest,
            per_peer: self.rtt.clone(),
            peers,
            messages_sent: self.sent,
            messages_received: self.received,
        }
    }
}
