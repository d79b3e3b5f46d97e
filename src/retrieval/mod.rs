//! Retrieval coordinator.
//!
//! [`BlockRetriever::fetch_blocks`] serves a hash set from, in order: the
//! local block cache, the HTTP gateways of the group's retrieval
//! candidates, and finally a graph-protocol client behind the
//! [`GraphFetcher`] seam. Every network path goes through a per-CID promise
//! so concurrent callers coalesce onto one fetch, and every untrusted body
//! is verified against the requested multihash before anyone sees it.

pub mod promise;
mod stats;

pub use stats::{ProviderStats, ResolvedCandidate};

use crate::blocklog::MAX_ENTRY_LEN;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::meta::{MetaDb, ProviderAddrs};
use crate::topcar::leaf_cid;
use crate::types::{verify_bytes, GroupId, Multihash};
use ahash::AHashMap;
use async_trait::async_trait;
use bytes::Bytes;
use cid::Cid;
use lru::LruCache;
use nonzero_ext::nonzero;
use parking_lot::Mutex;
use promise::{Claim, Outcome, PromiseMap};
use stats::StatsBook;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Graph-protocol retrieval client (block scope, depth 1). The wire
/// protocol is an external collaborator; the coordinator owns candidate
/// selection, coalescing, verification and timeouts.
#[async_trait]
pub trait GraphFetcher: Send + Sync {
    async fn fetch_block(
        &self,
        provider: u64,
        addrs: &ProviderAddrs,
        cid: Cid,
    ) -> anyhow::Result<Vec<u8>>;
}

pub struct BlockRetriever {
    meta: Arc<MetaDb>,
    config: Arc<Config>,
    http: reqwest::Client,
    graph: Arc<dyn GraphFetcher>,
    /// Active requests: multihash → source groups with refcounts. Lets the
    /// candidate callback map a bare CID back to the group it is served
    /// from.
    requests: Mutex<AHashMap<Vec<u8>, AHashMap<GroupId, usize>>>,
    /// Memoized provider addresses.
    addrs: Mutex<AHashMap<u64, Arc<ProviderAddrs>>>,
    stats: StatsBook,
    promises: PromiseMap,
    cache: Mutex<LruCache<Vec<u8>, Bytes>>,
    network_fetches: AtomicU64,
}

impl BlockRetriever {
    pub fn new(meta: Arc<MetaDb>, config: Arc<Config>, graph: Arc<dyn GraphFetcher>) -> Self {
        let entries =
            NonZeroUsize::new(config.cache_entries()).unwrap_or(nonzero!(1_usize));
        BlockRetriever {
            meta,
            config,
            http: reqwest::Client::new(),
            graph,
            requests: Mutex::new(AHashMap::new()),
            addrs: Mutex::new(AHashMap::new()),
            stats: StatsBook::new(),
            promises: PromiseMap::new(),
            cache: Mutex::new(LruCache::new(entries)),
            network_fetches: AtomicU64::new(0),
        }
    }

    /// Fetch blocks stored in `group` from remote providers. `cb` is
    /// invoked exactly once per hash, in no particular order, with bytes
    /// guaranteed to hash to the requested multihash.
    pub async fn fetch_blocks(
        &self,
        group: GroupId,
        hashes: &[Multihash],
        mut cb: impl FnMut(usize, &[u8]),
    ) -> Result<()> {
        let mut served = vec![false; hashes.len()];
        let mut remaining = hashes.len();

        // cache pass
        for (i, mh) in hashes.iter().enumerate() {
            let hit = self.cache.lock().get(&mh.to_bytes()).cloned();
            if let Some(data) = hit {
                cb(i, &data);
                served[i] = true;
                remaining -= 1;
            }
        }
        if remaining == 0 {
            return Ok(());
        }

        let _registration = RequestRegistration::new(self, group, hashes, &served);

        // HTTP gateway pass
        let candidates = self.candidates(group)?;
        'providers: for cand in &candidates {
            for base in &cand.addrs.http {
                for i in 0..hashes.len() {
                    if served[i] {
                        continue;
                    }
                    if self
                        .fetch_one_http(cand.provider, base, &hashes[i], i, &mut cb)
                        .await?
                    {
                        served[i] = true;
                        remaining -= 1;
                    }
                }
            }
            if remaining == 0 {
                break 'providers;
            }
        }

        // graph-protocol fallback
        for i in 0..hashes.len() {
            if remaining == 0 {
                break;
            }
            if served[i] {
                continue;
            }
            if self.fetch_one_graph(&hashes[i], i, &mut cb).await? {
                served[i] = true;
                remaining -= 1;
            }
        }

        if remaining > 0 {
            return Err(Error::NotFound(format!(
                "{remaining} of {} blocks unavailable from any source",
                hashes.len()
            )));
        }
        Ok(())
    }

    /// Underlying network fetches performed so far; lets tests observe
    /// coalescing.
    pub fn network_fetch_count(&self) -> u64 {
        self.network_fetches.load(Ordering::Relaxed)
    }

    pub fn provider_stats(&self, provider: u64) -> ProviderStats {
        self.stats.get(provider)
    }

    /// One hash through the promise and the HTTP gateway at `base`.
    /// `Ok(true)` means the slot was served; a cancelled promise owner
    /// propagates as [`Error::Cancelled`].
    async fn fetch_one_http(
        &self,
        provider: u64,
        base: &str,
        mh: &Multihash,
        idx: usize,
        cb: &mut impl FnMut(usize, &[u8]),
    ) -> Result<bool> {
        let cid = leaf_cid(mh);
        match self.promises.claim(cid) {
            Claim::Waiter(rx) => match promise::wait(rx).await {
                Outcome::Served(bytes) => {
                    cb(idx, &bytes);
                    Ok(true)
                }
                // the owner's source failed; a later pass may still serve us
                Outcome::Failed(_) => Ok(false),
                Outcome::Cancelled => Err(Error::Cancelled),
            },
            Claim::Owner(owner) => {
                self.stats.record_attempt(provider);
                self.network_fetches.fetch_add(1, Ordering::Relaxed);
                match self.http_fetch(base, cid, mh).await {
                    Ok(bytes) => {
                        self.stats.record_success(provider);
                        self.cache.lock().put(mh.to_bytes(), bytes.clone());
                        owner.resolve(Outcome::Served(bytes.clone()));
                        cb(idx, &bytes);
                        Ok(true)
                    }
                    Err(e) => {
                        self.stats.record_fail(provider);
                        debug!(%cid, provider, error = %e, "gateway fetch failed");
                        owner.resolve(Outcome::Failed(e.to_string()));
                        Ok(false)
                    }
                }
            }
        }
    }

    async fn http_fetch(&self, base: &str, cid: Cid, mh: &Multihash) -> Result<Bytes> {
        let url = format!("{}/ipfs/{}", base.trim_end_matches('/'), cid);
        let resp = self
            .http
            .get(&url)
            .header(reqwest::header::ACCEPT, "application/vnd.ipld.raw")
            .header(
                reqwest::header::USER_AGENT,
                concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")),
            )
            .timeout(self.config.http_timeout)
            .send()
            .await
            .map_err(|e| Error::Retrieval(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(Error::Retrieval(format!("{url}: status {}", resp.status())));
        }
        if resp.content_length().unwrap_or(0) > MAX_ENTRY_LEN {
            return Err(Error::Retrieval(format!("{url}: response too large")));
        }
        let body = resp
            .bytes()
            .await
            .map_err(|e| Error::Retrieval(e.to_string()))?;
        if body.len() as u64 > MAX_ENTRY_LEN {
            return Err(Error::Retrieval(format!("{url}: response too large")));
        }
        verify_bytes(mh, &body)?;
        Ok(body)
    }

    /// One hash through the promise and the graph-protocol client, cycling
    /// candidates until the attempt budget or the global timeout runs out.
    async fn fetch_one_graph(
        &self,
        mh: &Multihash,
        idx: usize,
        cb: &mut impl FnMut(usize, &[u8]),
    ) -> Result<bool> {
        let cid = leaf_cid(mh);
        match self.promises.claim(cid) {
            Claim::Waiter(rx) => match promise::wait(rx).await {
                Outcome::Served(bytes) => {
                    cb(idx, &bytes);
                    Ok(true)
                }
                Outcome::Failed(_) => Ok(false),
                Outcome::Cancelled => Err(Error::Cancelled),
            },
            Claim::Owner(owner) => match self.graph_fetch(cid, mh).await {
                Ok(bytes) => {
                    self.cache.lock().put(mh.to_bytes(), bytes.clone());
                    owner.resolve(Outcome::Served(bytes.clone()));
                    cb(idx, &bytes);
                    Ok(true)
                }
                Err(e) => {
                    debug!(%cid, error = %e, "graph fetch failed");
                    owner.resolve(Outcome::Failed(e.to_string()));
                    Ok(false)
                }
            },
        }
    }

    async fn graph_fetch(&self, cid: Cid, mh: &Multihash) -> Result<Bytes> {
        // resolve the source group through the live request map, the same
        // route the retrieval library's candidate callback takes
        let group = self
            .source_group(mh)
            .ok_or_else(|| Error::Retrieval(format!("no active request for {cid}")))?;
        let candidates = self.candidates(group)?;
        if candidates.is_empty() {
            return Err(Error::Retrieval(format!("no candidates for group {group}")));
        }

        let attempts_budget = self.config.graph_attempts;
        let fetch_loop = async {
            let mut attempts = 0;
            loop {
                for cand in &candidates {
                    if attempts == attempts_budget {
                        return Err(Error::Retrieval(format!(
                            "{cid}: no provider served the block in {attempts} attempts"
                        )));
                    }
                    attempts += 1;
                    self.stats.record_attempt(cand.provider);
                    self.network_fetches.fetch_add(1, Ordering::Relaxed);

                    let attempt = tokio::time::timeout(
                        self.config.graph_provider_timeout,
                        self.graph.fetch_block(cand.provider, &cand.addrs, cid),
                    );
                    match attempt.await {
                        Ok(Ok(bytes)) => {
                            if bytes.len() as u64 > MAX_ENTRY_LEN {
                                self.stats.record_fail(cand.provider);
                                continue;
                            }
                            if verify_bytes(mh, &bytes).is_err() {
                                warn!(%cid, provider = cand.provider, "provider returned mismatching bytes");
                                self.stats.record_fail(cand.provider);
                                continue;
                            }
                            self.stats.record_success(cand.provider);
                            return Ok(Bytes::from(bytes));
                        }
                        Ok(Err(e)) => {
                            debug!(%cid, provider = cand.provider, error = %e, "graph attempt failed");
                            self.stats.record_fail(cand.provider);
                        }
                        Err(_) => {
                            self.stats.record_fail(cand.provider);
                        }
                    }
                }
            }
        };

        match tokio::time::timeout(self.config.graph_global_timeout, fetch_loop).await {
            Ok(result) => result,
            Err(_) => Err(Error::Retrieval(format!("{cid}: graph fetch timed out"))),
        }
    }

    /// Candidates for a group, ordered by provider health, top K only.
    fn candidates(&self, group: GroupId) -> Result<Vec<ResolvedCandidate>> {
        let raw = self.meta.get_retrieval_candidates(group)?;
        let mut resolved = Vec::with_capacity(raw.len());
        for c in raw {
            match self.provider_addrs(c.provider)? {
                Some(addrs) => resolved.push(ResolvedCandidate {
                    provider: c.provider,
                    verified: c.verified,
                    fast: c.fast,
                    addrs,
                }),
                None => debug!(provider = c.provider, "candidate has no addresses"),
            }
        }
        self.stats.order(&mut resolved);
        resolved.truncate(self.config.candidate_limit);
        Ok(resolved)
    }

    fn provider_addrs(&self, provider: u64) -> Result<Option<Arc<ProviderAddrs>>> {
        if let Some(a) = self.addrs.lock().get(&provider) {
            return Ok(Some(a.clone()));
        }
        Ok(self.meta.get_provider_addrs(provider)?.map(|a| {
            let a = Arc::new(a);
            self.addrs.lock().insert(provider, a.clone());
            a
        }))
    }

    fn source_group(&self, mh: &Multihash) -> Option<GroupId> {
        let requests = self.requests.lock();
        requests
            .get(&mh.to_bytes())
            .and_then(|groups| groups.keys().next().copied())
    }
}

/// Scope guard keeping the request map accurate for the duration of one
/// `fetch_blocks` call.
struct RequestRegistration<'a> {
    retriever: &'a BlockRetriever,
    group: GroupId,
    keys: Vec<Vec<u8>>,
}

impl<'a> RequestRegistration<'a> {
    fn new(
        retriever: &'a BlockRetriever,
        group: GroupId,
        hashes: &[Multihash],
        served: &[bool],
    ) -> Self {
        let keys: Vec<Vec<u8>> = hashes
            .iter()
            .zip(served)
            .filter(|(_, s)| !**s)
            .map(|(mh, _)| mh.to_bytes())
            .collect();
        let mut requests = retriever.requests.lock();
        for key in &keys {
            *requests
                .entry(key.clone())
                .or_default()
                .entry(group)
                .or_insert(0) += 1;
        }
        RequestRegistration {
            retriever,
            group,
            keys,
        }
    }
}

impl Drop for RequestRegistration<'_> {
    fn drop(&mut self) {
        let mut requests = self.retriever.requests.lock();
        for key in &self.keys {
            if let Some(groups) = requests.get_mut(key) {
                if let Some(count) = groups.get_mut(&self.group) {
                    *count -= 1;
                    if *count == 0 {
                        groups.remove(&self.group);
                    }
                }
                if groups.is_empty() {
                    requests.remove(key);
                }
            }
        }
    }
}
