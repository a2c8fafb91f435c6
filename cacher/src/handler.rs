//! Per-datagram dispatch tying the challenge and response caches together.

use crate::challenge::{ChallengeCache, Validation};
use crate::response::ResponseCache;
use crate::stats::Stats;
use a2s::{QueryKind, Request};
use log::{debug, error, trace};
use std::net::SocketAddr;
use std::sync::Arc;

/// A reply datagram: a freshly built challenge, or a shared cached payload
/// sent without copying.
#[derive(Debug)]
pub enum Reply {
    Challenge([u8; 9]),
    Cached(Arc<Vec<u8>>),
}

impl Reply {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Reply::Challenge(packet) => packet,
            Reply::Cached(payload) => payload,
        }
    }
}

/// Stateless dispatcher shared by all receiver tasks. Challenge requests
/// are answered from the challenge cache, validated queries from the
/// response cache; everything else is dropped without a reply. Nothing here
/// ever errors out: a bad datagram costs a log line at most.
pub struct Handler {
    challenges: Arc<ChallengeCache>,
    responses: Arc<ResponseCache>,
    stats: Arc<Stats>,
}

impl Handler {
    pub fn new(
        challenges: Arc<ChallengeCache>,
        responses: Arc<ResponseCache>,
        stats: Arc<Stats>,
    ) -> Self {
        Self {
            challenges,
            responses,
            stats,
        }
    }

    /// Produces the single reply datagram for `payload`, or None to drop it.
    pub fn handle(&self, peer: SocketAddr, payload: &[u8]) -> Option<Reply> {
        self.stats.record(payload.len());

        // Until every kind has been fetched once there is nothing safe to
        // serve, not even a challenge.
        if !self.responses.all_ready() {
            error!(
                "Dropping query from {} because the cache is not ready. A2S_INFO: {}, A2S_PLAYER: {}, A2S_RULES: {}",
                peer,
                self.responses.is_ready(QueryKind::Info),
                self.responses.is_ready(QueryKind::Player),
                self.responses.is_ready(QueryKind::Rules)
            );
            return None;
        }

        match a2s::classify(payload) {
            Some(Request::Challenge { .. }) => {
                let code = self.challenges.issue(peer.ip());
                Some(Reply::Challenge(a2s::challenge_response(code)))
            }
            Some(Request::Query { kind, code }) => self.serve_cached(peer, kind, code),
            None => {
                trace!(
                    "Dropping packet of length {} bytes from {}",
                    payload.len(),
                    peer
                );
                None
            }
        }
    }

    fn serve_cached(&self, peer: SocketAddr, kind: QueryKind, code: [u8; 4]) -> Option<Reply> {
        match self.challenges.take_and_validate(peer.ip(), code) {
            Validation::Valid => {
                debug!(
                    "Valid challenge code {:08X} from {} [{}]",
                    u32::from_be_bytes(code),
                    peer,
                    kind.name()
                );
                self.responses.load(kind).map(Reply::Cached)
            }
            Validation::Mismatch { expected } => {
                debug!(
                    "Invalid challenge code {:08X} from {}, expected {:08X} [{}]",
                    u32::from_be_bytes(code),
                    peer,
                    u32::from_be_bytes(expected),
                    kind.name()
                );
                None
            }
            Validation::Unknown | Validation::Expired => {
                // Frequent hits here usually mean the challenge TTL is too low
                debug!(
                    "Unknown or stale challenge code {:08X} from {} [{}]",
                    u32::from_be_bytes(code),
                    peer,
                    kind.name()
                );
                None
            }
        }
    }
}
