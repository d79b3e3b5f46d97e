//! Per-CID fetch promises.
//!
//! Exactly one fetch is outstanding per CID: the first caller claims
//! ownership and performs the fetch, everyone else subscribes and awaits
//! the outcome. The promise is removed from the map before the outcome is
//! published, so late subscribers race against the cache instead of a
//! resolved promise. An owner dropped without resolving was cancelled;
//! that publishes a dedicated cancellation outcome, which waiters surface
//! as [`crate::Error::Cancelled`] rather than as an ordinary fetch
//! failure.

use ahash::AHashMap;
use bytes::Bytes;
use cid::Cid;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::watch;

#[derive(Debug, Clone)]
pub enum Outcome {
    Served(Bytes),
    Failed(String),
    /// The owning fetch was dropped before it resolved.
    Cancelled,
}

type Registry = Arc<Mutex<AHashMap<Cid, watch::Sender<Option<Outcome>>>>>;

#[derive(Default)]
pub struct PromiseMap {
    inner: Registry,
}

pub enum Claim {
    /// This caller fetches; it must resolve (or drop) the owner.
    Owner(PromiseOwner),
    /// Another caller is already fetching; await its outcome.
    Waiter(watch::Receiver<Option<Outcome>>),
}

impl PromiseMap {
    pub fn new() -> PromiseMap {
        PromiseMap::default()
    }

    pub fn claim(&self, cid: Cid) -> Claim {
        let mut map = self.inner.lock();
        if let Some(tx) = map.get(&cid) {
            return Claim::Waiter(tx.subscribe());
        }
        let (tx, _) = watch::channel(None);
        map.insert(cid, tx);
        Claim::Owner(PromiseOwner {
            registry: self.inner.clone(),
            cid,
            done: false,
        })
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }
}

pub struct PromiseOwner {
    registry: Registry,
    cid: Cid,
    done: bool,
}

impl PromiseOwner {
    pub fn resolve(mut self, outcome: Outcome) {
        self.complete(outcome);
    }

    fn complete(&mut self, outcome: Outcome) {
        if self.done {
            return;
        }
        self.done = true;
        // remove before publishing
        let tx = self.registry.lock().remove(&self.cid);
        if let Some(tx) = tx {
            tx.send_replace(Some(outcome));
        }
    }
}

impl Drop for PromiseOwner {
    fn drop(&mut self) {
        if !self.done {
            self.complete(Outcome::Cancelled);
        }
    }
}

/// Await a promise another caller owns.
pub async fn wait(mut rx: watch::Receiver<Option<Outcome>>) -> Outcome {
    match rx.wait_for(|v| v.is_some()).await {
        Ok(guard) => guard
            .clone()
            .unwrap_or_else(|| Outcome::Failed("empty promise".into())),
        Err(_) => Outcome::Failed("fetch abandoned".into()),
    }
}
