//! A group: one bounded, write-once block container.
//!
//! A group owns an append log and an offset index and walks a forward-only
//! lifecycle: writable, full, statically indexed, mutable index dropped,
//! top CAR generated, handed to the deal workflow. The write protocol
//! orders durability so that any hash visible in an index is guaranteed
//! readable: log fsync first, then offset index, then top index, then the
//! metadata row. Crash recovery replays the log from the last persisted
//! head, which makes every step idempotent.

use crate::blocklog::BlockLog;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::index::{BsstIndex, GroupIndex, IndexRead as _, IndexWrite as _, MutableIndex};
use crate::meta::{GroupMeta, MetaDb};
use crate::topcar;
use crate::topindex::TopIndex;
use crate::types::{group_dir_name, Block, GroupId, GroupState, Multihash};
use cid::Cid;
use parking_lot::{Mutex, RwLock};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

const LOG_FILE: &str = "blk.jblog";
const MUTABLE_INDEX_FILE: &str = "blk.jbmeta";
const STATIC_INDEX_FILE: &str = "blk.bsst";

pub struct Group {
    meta: Arc<MetaDb>,
    top: Arc<TopIndex>,
    config: Arc<Config>,
    path: PathBuf,
    id: GroupId,
    /// Writers and sealing take this exclusive; readers share it.
    inner: RwLock<GroupInner>,
    /// Serializes writes to this group's metadata row. May be taken while
    /// `inner` is held, never the other way around.
    dblk: Mutex<()>,
}

struct GroupInner {
    state: GroupState,
    committed_blocks: u64,
    committed_bytes: u64,
    log: BlockLog,
    index: GroupIndex,
}

impl Group {
    pub fn open(
        meta: Arc<MetaDb>,
        top: Arc<TopIndex>,
        config: Arc<Config>,
        root: &Path,
        id: GroupId,
        row: GroupMeta,
        create: bool,
    ) -> Result<Group> {
        let path = root.join("grp").join(group_dir_name(id));
        std::fs::create_dir_all(&path)?;

        let log_path = path.join(LOG_FILE);
        let mut log = if create {
            BlockLog::create(&log_path)?
        } else {
            BlockLog::open(&log_path, row.head)?
        };

        let mut blocks = row.blocks;
        let mut bytes = row.bytes;

        let index = if row.state < GroupState::BsstExists {
            let mut mutable = MutableIndex::open(&path.join(MUTABLE_INDEX_FILE))?;
            if !create && row.state == GroupState::Writable {
                // adopt cleanly framed records past the persisted head:
                // reindex before accepting any writes, in write order
                // (offset index, top index, then the group row)
                let adopted = log.recover()?;
                if !adopted.is_empty() {
                    let pairs: Vec<(Multihash, u64)> =
                        adopted.iter().map(|(mh, off, _)| (*mh, *off)).collect();
                    mutable.put(&pairs)?;
                    mutable.sync()?;
                    let hashes: Vec<Multihash> = adopted.iter().map(|(mh, _, _)| *mh).collect();
                    top.add_group(&hashes, id)?;
                    let head = log.commit()?;
                    blocks += adopted.len() as u64;
                    bytes += adopted.iter().map(|(_, _, len)| *len).sum::<u64>();
                    meta.set_group_head(id, row.state, blocks, bytes, head)?;
                    info!(group = id, adopted = adopted.len(), head, "replayed log tail");
                } else {
                    log.commit()?;
                }
            }
            GroupIndex::Mutable(mutable)
        } else {
            GroupIndex::Static(BsstIndex::open_path(&path.join(STATIC_INDEX_FILE))?)
        };

        if row.state != GroupState::Writable {
            log.mark_read_only();
        }

        Ok(Group {
            meta,
            top,
            config,
            path,
            id,
            inner: RwLock::new(GroupInner {
                state: row.state,
                committed_blocks: blocks,
                committed_bytes: bytes,
                log,
                index,
            }),
            dblk: Mutex::new(()),
        })
    }

    pub fn id(&self) -> GroupId {
        self.id
    }

    pub fn state(&self) -> GroupState {
        self.inner.read().state
    }

    pub fn committed(&self) -> (u64, u64) {
        let inner = self.inner.read();
        (inner.committed_blocks, inner.committed_bytes)
    }

    /// Accept the largest batch prefix that fits the group's capacity and
    /// commit it durably. Returns the number of blocks accepted; zero when
    /// the group is not writable, so the caller can spill the batch to
    /// another group.
    pub fn put(&self, batch: &[Block]) -> Result<usize> {
        if batch.is_empty() {
            return Ok(0);
        }

        let mut guard = self.inner.write();
        let inner = &mut *guard;
        if inner.state != GroupState::Writable {
            return Ok(0);
        }

        let avail_bytes = self.config.max_group_size.saturating_sub(inner.committed_bytes);
        let avail_blocks = self
            .config
            .max_group_blocks
            .saturating_sub(inner.committed_blocks);

        let mut write_bytes = 0u64;
        let mut accepted = 0usize;
        for b in batch {
            let len = b.data.len() as u64;
            if accepted as u64 == avail_blocks || write_bytes + len > avail_bytes {
                break;
            }
            write_bytes += len;
            accepted += 1;
        }

        // the group seals when the batch spills over or the accepted prefix
        // lands exactly on a capacity limit
        let filled = accepted < batch.len()
            || write_bytes == avail_bytes
            || accepted as u64 == avail_blocks;

        let head = if accepted > 0 {
            let entries: Vec<(Multihash, &[u8])> = batch[..accepted]
                .iter()
                .map(|b| (*b.multihash(), b.data.as_slice()))
                .collect();

            let offsets = inner.log.append(&entries)?;
            let head = inner.log.commit()?;

            let pairs: Vec<(Multihash, u64)> = entries
                .iter()
                .zip(&offsets)
                .map(|((mh, _), off)| (*mh, *off))
                .collect();
            let mutable = inner
                .index
                .as_mutable()
                .ok_or_else(|| Error::State("writable group without mutable index".into()))?;
            mutable.put(&pairs)?;
            mutable.sync()?;

            let hashes: Vec<Multihash> = entries.iter().map(|(mh, _)| *mh).collect();
            self.top.add_group(&hashes, self.id)?;
            head
        } else {
            inner.log.head()
        };

        if filled {
            inner.log.mark_read_only();
            inner.state = GroupState::Full;
        }

        let new_blocks = inner.committed_blocks + accepted as u64;
        let new_bytes = inner.committed_bytes + write_bytes;
        {
            let _d = self.dblk.lock();
            self.meta
                .set_group_head(self.id, inner.state, new_blocks, new_bytes, head)?;
        }
        inner.committed_blocks = new_blocks;
        inner.committed_bytes = new_bytes;

        debug!(
            group = self.id,
            accepted,
            bytes = write_bytes,
            full = filled,
            "committed batch"
        );
        Ok(accepted)
    }

    /// Read blocks by multihash. Invokes `cb(batch_index, payload)` for each
    /// hash; a hash this group does not hold is an error.
    pub fn view(&self, hashes: &[Multihash], mut cb: impl FnMut(usize, &[u8])) -> Result<()> {
        let guard = self.inner.read();
        let inner = &*guard;
        let candidates = inner.index.get(hashes)?;
        for (i, offsets) in candidates.iter().enumerate() {
            let mut served = false;
            for off in offsets {
                // static lookups are by 64-bit summary; verify the stored
                // multihash before serving
                let (mh, data) = inner.log.read_at(*off)?;
                if mh == hashes[i] {
                    cb(i, &data);
                    served = true;
                    break;
                }
            }
            if !served {
                return Err(Error::NotFound(format!(
                    "hash {i} of {} not in group {}",
                    hashes.len(),
                    self.id
                )));
            }
        }
        Ok(())
    }

    /// In-order scan of all committed blocks.
    pub fn iterate(&self, mut cb: impl FnMut(&Multihash, &[u8]) -> Result<()>) -> Result<()> {
        let guard = self.inner.read();
        guard.log.iterate(0, |mh, _, data| cb(mh, data))
    }

    /// Seal a full group: settle the log, build the static index, drop the
    /// mutable one. Each step persists its own state advance, so a crash
    /// anywhere resumes cleanly.
    pub fn finalize(&self) -> Result<()> {
        let mut guard = self.inner.write();
        let inner = &mut *guard;
        match inner.state {
            GroupState::Full => {
                inner.log.mark_read_only();
                inner.log.finalize()?;
                BsstIndex::build_from_log(&self.path.join(STATIC_INDEX_FILE), &inner.log)?;
                self.advance_state(inner, GroupState::BsstExists)?;
                self.drop_mutable_index(inner)?;
            }
            // crash window between building the table and dropping the
            // mutable index: pick up from the drop
            GroupState::BsstExists => self.drop_mutable_index(inner)?,
            s => return Err(Error::State(format!("finalize in state {s}"))),
        }
        info!(group = self.id, "finalized");
        Ok(())
    }

    fn drop_mutable_index(&self, inner: &mut GroupInner) -> Result<()> {
        inner.index = GroupIndex::Static(BsstIndex::open_path(&self.path.join(STATIC_INDEX_FILE))?);
        let mutable_path = self.path.join(MUTABLE_INDEX_FILE);
        if mutable_path.exists() {
            MutableIndex::remove(&mutable_path)?;
        }
        self.advance_state(inner, GroupState::LevelIndexDropped)
    }

    /// Build the layered top CAR over the sealed group. The log is held in
    /// shared mode for the whole build; the state advance afterwards takes
    /// the exclusive lock briefly.
    pub fn gen_top_car(&self) -> Result<Cid> {
        let root = {
            let guard = self.inner.read();
            if guard.state != GroupState::LevelIndexDropped {
                return Err(Error::State(format!("generate top car in state {}", guard.state)));
            }
            topcar::build(&self.path, &guard.log, self.config.arity)?.0
        };

        let mut guard = self.inner.write();
        if guard.state == GroupState::LevelIndexDropped {
            self.advance_state(&mut guard, GroupState::VrcarDone)?;
        }
        info!(group = self.id, %root, "top car generated");
        Ok(root)
    }

    fn advance_state(&self, inner: &mut GroupInner, state: GroupState) -> Result<()> {
        let _d = self.dblk.lock();
        inner.state = state;
        self.meta.set_group_state(self.id, state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup(config: Config) -> (tempfile::TempDir, Arc<MetaDb>, Arc<TopIndex>, Arc<Config>) {
        let dir = tempfile::tempdir().unwrap();
        let meta = Arc::new(MetaDb::open(dir.path()).unwrap());
        let top = Arc::new(TopIndex::new(meta.database()).unwrap());
        (dir, meta, top, Arc::new(config))
    }

    fn new_group(
        meta: &Arc<MetaDb>,
        top: &Arc<TopIndex>,
        config: &Arc<Config>,
        root: &Path,
    ) -> Group {
        let id = meta.create_group().unwrap();
        let row = meta.open_group(id).unwrap();
        Group::open(
            meta.clone(),
            top.clone(),
            config.clone(),
            root,
            id,
            row,
            true,
        )
        .unwrap()
    }

    fn blocks(payloads: &[&[u8]]) -> Vec<Block> {
        payloads.iter().map(|p| Block::raw_sha256(p.to_vec())).collect()
    }

    #[test]
    fn put_then_view_roundtrip() {
        let (dir, meta, top, config) = setup(Config::default());
        let group = new_group(&meta, &top, &config, dir.path());

        let batch = blocks(&[b"hello", b"world", b"!"]);
        assert_eq!(group.put(&batch).unwrap(), 3);

        let mut got = vec![None, None];
        group
            .view(
                &[*batch[1].multihash(), *batch[0].multihash()],
                |i, data| got[i] = Some(data.to_vec()),
            )
            .unwrap();
        assert_eq!(got[0].as_deref(), Some(&b"world"[..]));
        assert_eq!(got[1].as_deref(), Some(&b"hello"[..]));

        let missing = Block::raw_sha256(b"missing".to_vec());
        assert!(matches!(
            group.view(&[*missing.multihash()], |_, _| {}),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn iterate_yields_blocks_in_acceptance_order() {
        let (dir, meta, top, config) = setup(Config::default());
        let group = new_group(&meta, &top, &config, dir.path());

        let batch: Vec<Block> = (0u32..20)
            .map(|i| Block::raw_sha256(format!("itm-{i}").into_bytes()))
            .collect();
        group.put(&batch).unwrap();

        let mut seen = Vec::new();
        group
            .iterate(|mh, data| {
                seen.push((*mh, data.to_vec()));
                Ok(())
            })
            .unwrap();
        assert_eq!(seen.len(), batch.len());
        for (b, (mh, data)) in batch.iter().zip(&seen) {
            assert_eq!(b.multihash(), mh);
            assert_eq!(&b.data, data);
        }
    }

    #[test]
    fn exact_fill_seals_the_group() {
        let config = Config {
            max_group_size: 10,
            ..Config::default()
        };
        let (dir, meta, top, config) = setup(config);
        let group = new_group(&meta, &top, &config, dir.path());

        let batch = blocks(&[b"aaaaa", b"bbbbb"]);
        assert_eq!(group.put(&batch).unwrap(), 2);
        assert_eq!(group.state(), GroupState::Full);
        assert_eq!(group.committed(), (2, 10));

        // sealed: further puts are declined without error
        assert_eq!(group.put(&blocks(&[b"c"])).unwrap(), 0);
    }

    #[test]
    fn overflowing_batch_is_cut_at_capacity() {
        let config = Config {
            max_group_size: 10,
            ..Config::default()
        };
        let (dir, meta, top, config) = setup(config);
        let group = new_group(&meta, &top, &config, dir.path());

        let batch = blocks(&[b"aaaaa", b"bbbbb", b"c"]);
        assert_eq!(group.put(&batch).unwrap(), 2);
        assert_eq!(group.state(), GroupState::Full);
    }

    #[test]
    fn block_count_cap_is_enforced() {
        let config = Config {
            max_group_blocks: 2,
            ..Config::default()
        };
        let (dir, meta, top, config) = setup(config);
        let group = new_group(&meta, &top, &config, dir.path());

        assert_eq!(group.put(&blocks(&[b"a", b"b", b"c"])).unwrap(), 2);
        assert_eq!(group.state(), GroupState::Full);
        assert_eq!(group.committed(), (2, 2));
    }

    #[test]
    fn finalize_walks_the_state_machine() {
        let config = Config {
            max_group_size: 10,
            arity: 4,
            ..Config::default()
        };
        let (dir, meta, top, config) = setup(config);
        let group = new_group(&meta, &top, &config, dir.path());

        // finalize before the group is full is a caller bug
        assert!(matches!(group.finalize(), Err(Error::State(_))));

        let batch = blocks(&[b"aaaaa", b"bbbbb"]);
        group.put(&batch).unwrap();
        assert_eq!(group.state(), GroupState::Full);

        group.finalize().unwrap();
        assert_eq!(group.state(), GroupState::LevelIndexDropped);
        assert!(!dir
            .path()
            .join("grp/0")
            .join(MUTABLE_INDEX_FILE)
            .exists());
        assert_eq!(
            meta.open_group(group.id()).unwrap().state,
            GroupState::LevelIndexDropped
        );

        // reads keep working through the static index
        let mut seen = 0;
        group
            .view(&[*batch[0].multihash()], |_, data| {
                assert_eq!(data, b"aaaaa");
                seen += 1;
            })
            .unwrap();
        assert_eq!(seen, 1);

        let root = group.gen_top_car().unwrap();
        assert_eq!(group.state(), GroupState::VrcarDone);
        assert!(dir.path().join("grp/0/vcar/layers").exists());

        // terminal-ish states reject repeated sealing
        assert!(matches!(group.finalize(), Err(Error::State(_))));
        assert!(matches!(group.gen_top_car(), Err(Error::State(_))));
        let _ = root;
    }

    #[test]
    fn sealed_group_reopens_on_static_index() {
        let config = Config {
            max_group_size: 10,
            ..Config::default()
        };
        let (dir, meta, top, config) = setup(config);
        let batch = blocks(&[b"aaaaa", b"bbbbb"]);
        let id = {
            let group = new_group(&meta, &top, &config, dir.path());
            group.put(&batch).unwrap();
            group.finalize().unwrap();
            group.id()
        };

        let row = meta.open_group(id).unwrap();
        assert_eq!(row.state, GroupState::LevelIndexDropped);
        let group = Group::open(
            meta.clone(),
            top.clone(),
            config.clone(),
            dir.path(),
            id,
            row,
            false,
        )
        .unwrap();

        let mut served = false;
        group
            .view(&[*batch[1].multihash()], |_, data| {
                assert_eq!(data, b"bbbbb");
                served = true;
            })
            .unwrap();
        assert!(served);
    }
}
