//! Per-provider health counters and candidate ordering.

use crate::meta::ProviderAddrs;
use ahash::AHashMap;
use parking_lot::Mutex;
use std::sync::Arc;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ProviderStats {
    pub attempts: u64,
    pub fails: u64,
    pub success: u64,
}

/// A retrieval candidate with its addresses resolved.
#[derive(Debug, Clone)]
pub struct ResolvedCandidate {
    pub provider: u64,
    pub verified: bool,
    pub fast: bool,
    pub addrs: Arc<ProviderAddrs>,
}

impl ResolvedCandidate {
    /// Lower ranks first on fail-ratio ties: HTTP beats bitswap beats
    /// graphsync.
    fn transport_rank(&self) -> u8 {
        if !self.addrs.http.is_empty() {
            0
        } else if !self.addrs.bitswap.is_empty() {
            1
        } else {
            2
        }
    }
}

#[derive(Default)]
pub struct StatsBook {
    inner: Mutex<AHashMap<u64, ProviderStats>>,
}

impl StatsBook {
    pub fn new() -> StatsBook {
        StatsBook::default()
    }

    pub fn record_attempt(&self, provider: u64) {
        self.inner.lock().entry(provider).or_default().attempts += 1;
    }

    pub fn record_fail(&self, provider: u64) {
        self.inner.lock().entry(provider).or_default().fails += 1;
    }

    pub fn record_success(&self, provider: u64) {
        self.inner.lock().entry(provider).or_default().success += 1;
    }

    pub fn get(&self, provider: u64) -> ProviderStats {
        self.inner
            .lock()
            .get(&provider)
            .copied()
            .unwrap_or_default()
    }

    fn fail_ratio(&self, provider: u64) -> f64 {
        let stats = self.get(provider);
        stats.fails as f64 / (stats.attempts + 1) as f64
    }

    /// Sort candidates by ascending fail ratio, preferring the faster
    /// transport on ties.
    pub fn order(&self, candidates: &mut [ResolvedCandidate]) {
        candidates.sort_by(|a, b| {
            self.fail_ratio(a.provider)
                .total_cmp(&self.fail_ratio(b.provider))
                .then(a.transport_rank().cmp(&b.transport_rank()))
        });
    }
}
