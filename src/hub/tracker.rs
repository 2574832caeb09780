//! Correlation of in-flight requests with their eventual responses.
//!
//! Entries are short-lived: removed on response delivery or reclaimed by
//! the TTL sweeper. The router consults the tracker when a RESPONSE
//! arrives with no explicit `to`.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;

/// How long an unanswered request entry is retained.
pub const REQUEST_TTL: Duration = Duration::from_secs(5 * 60);

/// Sweep cadence for expired entries.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Clone, Debug)]
pub struct PendingRequest {
    pub requester: String,
    pub worker: String,
    pub capability: String,
    pub expires_at: Instant,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize)]
pub struct TrackerStats {
    pub pending: usize,
}

pub struct RequestTracker {
    pending: DashMap<String, PendingRequest>,
    ttl: Duration,
}

impl RequestTracker {
    pub fn new() -> Self {
        Self::with_ttl(REQUEST_TTL)
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            pending: DashMap::new(),
            ttl,
        }
    }

    pub fn track(
        &self,
        request_id: &str,
        requester: &str,
        worker: &str,
        capability: &str,
    ) {
        self.pending.insert(
            request_id.to_owned(),
            PendingRequest {
                requester: requester.to_owned(),
                worker: worker.to_owned(),
                capability: capability.to_owned(),
                expires_at: Instant::now() + self.ttl,
            },
        );
    }

    /// The client that issued `request_id`, if still tracked.
    pub fn requester_of(&self, request_id: &str) -> Option<String> {
        self.pending
            .get(request_id)
            .map(|entry| entry.requester.clone())
    }

    /// Remove and return the entry once its response has been delivered.
    pub fn complete(&self, request_id: &str) -> Option<PendingRequest> {
        self.pending.remove(request_id).map(|(_, entry)| entry)
    }

    pub fn stats(&self) -> TrackerStats {
        TrackerStats {
            pending: self.pending.len(),
        }
    }

    /// Drop expired entries; returns how many were reclaimed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let before = self.pending.len();
        self.pending.retain(|_, entry| entry.expires_at > now);
        before - self.pending.len()
    }

    /// Background task reclaiming expired entries once a minute.
    pub fn spawn_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let tracker = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);
            interval.set_missed_tick_behavior(
                tokio::time::MissedTickBehavior::Delay,
            );
            loop {
                interval.tick().await;
                let reclaimed = tracker.sweep();
                if reclaimed > 0 {
                    tracing::debug!(reclaimed, "Reclaimed expired requests");
                }
            }
        })
    }
}

impl Default for RequestTracker {
    fn default() -> Self {
        Self::new()
    }
}
