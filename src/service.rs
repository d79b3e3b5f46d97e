//! Process-wide service: the catalog of open groups, writable-group
//! selection for batched puts, read routing through the top index, and the
//! background worker that seals full groups.

use crate::config::Config;
use crate::error::{Error, Result};
use crate::group::Group;
use crate::meta::MetaDb;
use crate::retrieval::{BlockRetriever, GraphFetcher};
use crate::topindex::TopIndex;
use crate::types::{Block, GroupId, GroupState, Multihash};
use ahash::AHashMap;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, error, info};

#[derive(Debug, Clone, Copy)]
enum Task {
    Finalize(GroupId),
    MakeVcar(GroupId),
}

#[derive(Default)]
pub struct OpenOptions {
    /// Test hook: when set, the worker takes one message off this channel
    /// before executing each task. Dropping the sender opens the gate for
    /// good.
    pub worker_gate: Option<flume::Receiver<()>>,
}

struct GroupMaps {
    /// All currently loaded groups, writable ones included.
    open: AHashMap<GroupId, Arc<Group>>,
    writable: AHashMap<GroupId, Arc<Group>>,
}

struct Shared {
    root: PathBuf,
    config: Arc<Config>,
    meta: Arc<MetaDb>,
    top: Arc<TopIndex>,
    groups: Mutex<GroupMaps>,
    tasks: flume::Sender<Task>,
}

/// The storage service. One per data root.
pub struct Carload {
    shared: Arc<Shared>,
    stop: flume::Sender<()>,
    worker: Option<JoinHandle<()>>,
}

impl Carload {
    pub fn open(root: impl AsRef<Path>) -> Result<Carload> {
        Carload::open_with(root, Config::default(), OpenOptions::default())
    }

    pub fn open_with(root: impl AsRef<Path>, config: Config, opts: OpenOptions) -> Result<Carload> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)?;

        let meta = Arc::new(MetaDb::open(&root)?);
        let top = Arc::new(TopIndex::new(meta.database())?);
        let (tasks_tx, tasks_rx) = flume::bounded(config.task_queue_len);
        let (stop_tx, stop_rx) = flume::bounded(1);

        let shared = Arc::new(Shared {
            root,
            config: Arc::new(config),
            meta,
            top,
            groups: Mutex::new(GroupMaps {
                open: AHashMap::new(),
                writable: AHashMap::new(),
            }),
            tasks: tasks_tx,
        });

        let worker = {
            let shared = shared.clone();
            let gate = opts.worker_gate;
            std::thread::Builder::new()
                .name("carload-worker".into())
                .spawn(move || worker_loop(shared, tasks_rx, stop_rx, gate))?
        };

        // re-enqueue seals interrupted by the previous shutdown; the state
        // machine itself records progress, so retry is just re-dispatch
        for (id, state) in shared.meta.list_groups()? {
            match state {
                GroupState::Full | GroupState::BsstExists => {
                    shared.enqueue(Task::Finalize(id));
                }
                GroupState::LevelIndexDropped => shared.enqueue(Task::MakeVcar(id)),
                _ => {}
            }
        }

        Ok(Carload {
            shared,
            stop: stop_tx,
            worker: Some(worker),
        })
    }

    /// Store a batch. Blocks spill across groups as capacity requires; on
    /// return every block is durable and indexed.
    pub fn put_blocks(&self, batch: &[Block]) -> Result<()> {
        for b in batch {
            if b.data.len() as u64 > self.shared.config.max_group_size {
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "block larger than the group size cap",
                )));
            }
        }

        let mut done = 0;
        let mut target: Option<GroupId> = None;
        while done < batch.len() {
            let (gid, wrote) = self
                .shared
                .with_writable_group(target, |g| g.put(&batch[done..]))?;
            done += wrote;
            target = Some(gid);
        }
        Ok(())
    }

    /// Read blocks by multihash, routed through the top index. `cb` is
    /// invoked exactly once per found hash with the position in `hashes`;
    /// a hash no group holds is an error.
    pub fn view(&self, hashes: &[Multihash], mut cb: impl FnMut(usize, &[u8])) -> Result<()> {
        let mut assigned = vec![false; hashes.len()];
        let mut by_group: AHashMap<GroupId, Vec<usize>> = AHashMap::new();
        let mut remaining = hashes.len();

        self.shared.top.get_groups(hashes, |base, batch| {
            for (j, groups) in batch.iter().enumerate() {
                let idx = base + j;
                if assigned[idx] {
                    continue;
                }
                // first group listed wins; the others hold the same bytes
                if let Some(g) = groups.first() {
                    by_group.entry(*g).or_default().push(idx);
                    assigned[idx] = true;
                    remaining -= 1;
                }
            }
            remaining > 0
        })?;

        if remaining > 0 {
            return Err(Error::NotFound(format!(
                "{remaining} of {} hashes not routed to any group",
                hashes.len()
            )));
        }

        for (gid, idxs) in by_group {
            let sub: Vec<Multihash> = idxs.iter().map(|&i| hashes[i]).collect();
            self.shared.with_readable_group(gid, |g| {
                g.view(&sub, |j, data| cb(idxs[j], data))
            })?;
        }
        Ok(())
    }

    /// Removal of individual blocks is not supported; the archival lifecycle
    /// of whole groups belongs to the deal workflow.
    pub fn unlink(&self, _hashes: &[Multihash]) -> Result<()> {
        Err(Error::State("unlink is not supported".into()))
    }

    /// Retrieval coordinator bound to this service's metadata, fetching
    /// through `graph` when the HTTP gateways fail.
    pub fn retriever(&self, graph: Arc<dyn GraphFetcher>) -> BlockRetriever {
        BlockRetriever::new(
            self.shared.meta.clone(),
            self.shared.config.clone(),
            graph,
        )
    }

    pub fn meta(&self) -> Arc<MetaDb> {
        self.shared.meta.clone()
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    /// Stop the background worker and release the store.
    pub fn close(mut self) -> Result<()> {
        self.shutdown();
        Ok(())
    }

    fn shutdown(&mut self) {
        let _ = self.stop.try_send(());
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for Carload {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Shared {
    /// Select a writable group and run `cb` on it under the registry lock:
    /// `prefer` if it is still writable, else any writable group, else the
    /// next writable candidate from the metadata store, else a fresh group.
    /// A group that stops being writable under `cb` is rotated out and its
    /// finalization queued.
    fn with_writable_group<T>(
        &self,
        prefer: Option<GroupId>,
        cb: impl FnOnce(&Group) -> Result<T>,
    ) -> Result<(GroupId, T)> {
        let mut maps = self.groups.lock();

        let group: Arc<Group> = if let Some(g) = prefer.and_then(|p| maps.writable.get(&p)) {
            g.clone()
        } else if let Some(g) = maps.writable.values().next() {
            g.clone()
        } else if let Some((id, row)) = self.meta.get_writable_group()? {
            debug!(group = id, "opening writable group");
            let g = Arc::new(Group::open(
                self.meta.clone(),
                self.top.clone(),
                self.config.clone(),
                &self.root,
                id,
                row,
                false,
            )?);
            maps.writable.insert(id, g.clone());
            maps.open.insert(id, g.clone());
            g
        } else {
            let id = self.meta.create_group()?;
            info!(group = id, "creating group");
            let row = self.meta.open_group(id)?;
            let g = Arc::new(Group::open(
                self.meta.clone(),
                self.top.clone(),
                self.config.clone(),
                &self.root,
                id,
                row,
                true,
            )?);
            maps.writable.insert(id, g.clone());
            maps.open.insert(id, g.clone());
            g
        };

        let result = cb(&group);
        let gid = group.id();
        let rotate = result.is_ok() && group.state() != GroupState::Writable;
        if rotate {
            maps.writable.remove(&gid);
        }
        drop(maps);
        if rotate {
            self.enqueue(Task::Finalize(gid));
        }
        result.map(|t| (gid, t))
    }

    /// Run `cb` on a group, lazily opening it from metadata. The registry
    /// lock covers only lookup and promotion; reads do not serialize behind
    /// it.
    fn with_readable_group<T>(
        &self,
        id: GroupId,
        cb: impl FnOnce(&Group) -> Result<T>,
    ) -> Result<T> {
        let group = {
            let mut maps = self.groups.lock();
            match maps.open.get(&id) {
                Some(g) => g.clone(),
                None => {
                    let row = self.meta.open_group(id)?;
                    let g = Arc::new(Group::open(
                        self.meta.clone(),
                        self.top.clone(),
                        self.config.clone(),
                        &self.root,
                        id,
                        row,
                        false,
                    )?);
                    maps.open.insert(id, g.clone());
                    if row.state == GroupState::Writable {
                        maps.writable.insert(id, g.clone());
                    }
                    g
                }
            }
        };
        cb(&group)
    }

    fn enqueue(&self, task: Task) {
        if self.tasks.send(task).is_err() {
            error!(?task, "task queue closed");
        }
    }
}

fn worker_loop(
    shared: Arc<Shared>,
    tasks: flume::Receiver<Task>,
    stop: flume::Receiver<()>,
    gate: Option<flume::Receiver<()>>,
) {
    loop {
        if let Some(g) = &gate {
            let proceed = flume::Selector::new()
                .recv(&stop, |_| false)
                .recv(g, |_| true)
                .wait();
            if !proceed {
                return;
            }
        }
        let task = flume::Selector::new()
            .recv(&stop, |_| None)
            .recv(&tasks, |t| t.ok())
            .wait();
        match task {
            None => return,
            Some(task) => exec_task(&shared, task),
        }
    }
}

/// A finalize falls through to top-CAR generation on the same group, so a
/// filled group normally seals end-to-end in one dispatch.
fn exec_task(shared: &Arc<Shared>, task: Task) {
    match task {
        Task::Finalize(id) => {
            if let Err(e) = shared.with_readable_group(id, |g| g.finalize()) {
                error!(group = id, error = %e, "finalizing group");
                return;
            }
            gen_top_car(shared, id);
        }
        Task::MakeVcar(id) => gen_top_car(shared, id),
    }
}

fn gen_top_car(shared: &Arc<Shared>, id: GroupId) {
    if let Err(e) = shared.with_readable_group(id, |g| g.gen_top_car()) {
        error!(group = id, error = %e, "generating top car");
    }
}
