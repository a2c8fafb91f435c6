//! Cached upstream replies, one slot per query kind.

use a2s::QueryKind;
use arc_swap::ArcSwapOption;
use std::sync::Arc;

/// Latest verbatim reply payload for each query kind.
///
/// Readers take a lock-free snapshot of the current payload; the kind's
/// poller replaces the whole payload on every refresh and never mutates it
/// in place. A slot stays empty until the first successful refresh, which
/// doubles as the readiness flag.
#[derive(Debug)]
pub struct ResponseCache {
    info: ArcSwapOption<Vec<u8>>,
    player: ArcSwapOption<Vec<u8>>,
    rules: ArcSwapOption<Vec<u8>>,
}

impl ResponseCache {
    pub fn new() -> Self {
        Self {
            info: ArcSwapOption::empty(),
            player: ArcSwapOption::empty(),
            rules: ArcSwapOption::empty(),
        }
    }

    fn slot(&self, kind: QueryKind) -> &ArcSwapOption<Vec<u8>> {
        match kind {
            QueryKind::Info => &self.info,
            QueryKind::Player => &self.player,
            QueryKind::Rules => &self.rules,
        }
    }

    /// Atomically replaces the payload for `kind`.
    pub fn store(&self, kind: QueryKind, payload: Vec<u8>) {
        self.slot(kind).store(Some(Arc::new(payload)));
    }

    /// Current payload for `kind`, or None before the first refresh.
    pub fn load(&self, kind: QueryKind) -> Option<Arc<Vec<u8>>> {
        self.slot(kind).load_full()
    }

    pub fn is_ready(&self, kind: QueryKind) -> bool {
        self.slot(kind).load().is_some()
    }

    pub fn all_ready(&self) -> bool {
        QueryKind::ALL.iter().all(|kind| self.is_ready(*kind))
    }
}

impl Default for ResponseCache {
    fn default() -> Self {
        Self::new()
    }
}
