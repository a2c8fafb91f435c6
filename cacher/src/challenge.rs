//! Per-IP challenge code cache.
//!
//! Codes prove that a querying client can receive traffic at its claimed
//! source address. Each IP holds at most one live code; presenting a code
//! consumes it whatever the outcome, and a background sweeper drops codes
//! that outlive their TTL.

use dashmap::DashMap;
use log::debug;
use rand::Rng;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;

#[derive(Debug, Clone)]
struct ChallengeEntry {
    code: [u8; 4],
    expires_at: Instant,
}

impl ChallengeEntry {
    fn new(ttl: Duration) -> Self {
        Self {
            code: generate_code(),
            expires_at: Instant::now() + ttl,
        }
    }

    fn is_expired(&self) -> bool {
        Instant::now() > self.expires_at
    }
}

/// Outcome of presenting a challenge code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Validation {
    /// Stored code matched the presented one.
    Valid,
    /// A live code was stored for this address but did not match.
    Mismatch { expected: [u8; 4] },
    /// No code was stored for this address.
    Unknown,
    /// The stored code had outlived its TTL.
    Expired,
}

/// Sharded map of live challenge codes, keyed by client IP address only:
/// clients behind the same NAT share a code window.
pub struct ChallengeCache {
    entries: DashMap<IpAddr, ChallengeEntry>,
    ttl: Duration,
}

impl ChallengeCache {
    /// `capacity` pre-sizes the map for the expected worst-case code count;
    /// `concurrency` is rounded up to the next power of two shards.
    pub fn new(ttl: Duration, capacity: usize, concurrency: usize) -> Self {
        let shards = concurrency.max(2).next_power_of_two();
        Self {
            entries: DashMap::with_capacity_and_shard_amount(capacity, shards),
            ttl,
        }
    }

    /// Returns the live code for this address, generating a fresh one if
    /// none is stored or the stored one has expired. Repeated calls within
    /// the TTL return the same code.
    pub fn issue(&self, ip: IpAddr) -> [u8; 4] {
        let mut entry = self
            .entries
            .entry(ip)
            .or_insert_with(|| ChallengeEntry::new(self.ttl));
        if entry.is_expired() {
            *entry = ChallengeEntry::new(self.ttl);
        }
        entry.code
    }

    /// Removes the stored code for this address and compares it against the
    /// presented one. Codes are single use: valid, mismatched and expired
    /// codes are all consumed.
    pub fn take_and_validate(&self, ip: IpAddr, presented: [u8; 4]) -> Validation {
        match self.entries.remove(&ip) {
            Some((_, entry)) => {
                if entry.is_expired() {
                    Validation::Expired
                } else if entry.code == presented {
                    Validation::Valid
                } else {
                    Validation::Mismatch {
                        expected: entry.code,
                    }
                }
            }
            None => Validation::Unknown,
        }
    }

    /// Drops every expired code, returning how many were removed.
    pub fn sweep(&self) -> usize {
        let mut removed = 0;
        self.entries.retain(|_, entry| {
            if entry.is_expired() {
                removed += 1;
                false
            } else {
                true
            }
        });
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Never returns either on-wire challenge-request placeholder value, so an
/// issued code can always be told apart from a challenge request.
fn generate_code() -> [u8; 4] {
    let mut rng = rand::thread_rng();
    loop {
        let code: [u8; 4] = rng.gen();
        if code != a2s::CHALLENGE_REQUEST_FF && code != a2s::CHALLENGE_REQUEST_ZERO {
            return code;
        }
    }
}

/// Drops expired codes on a fixed interval until shutdown is signalled.
/// Reads never wait for the sweeper; expired entries are also rejected at
/// validation time.
pub async fn run_sweeper(
    cache: Arc<ChallengeCache>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut timer = tokio::time::interval(interval);
    // Skip the first tick since it fires immediately
    timer.tick().await;

    loop {
        tokio::select! {
            _ = timer.tick() => {
                let removed = cache.sweep();
                if removed > 0 {
                    debug!("Challenge sweep removed {} expired codes", removed);
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}
