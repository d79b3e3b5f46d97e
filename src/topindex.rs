//! Top-level index routing reads: `multihash → set of group ids`.
//!
//! A hash can map to several groups after redelivery, so the table is a
//! multimap; re-inserting an existing pair is a no-op, which also makes
//! recovery replay idempotent.

use crate::error::Result;
use crate::types::{GroupId, Multihash};
use redb::{Database, MultimapTableDefinition, ReadableMultimapTable};
use std::sync::Arc;

const TOP: MultimapTableDefinition<&[u8], u64> = MultimapTableDefinition::new("top_index");

/// Rows handed to the [`TopIndex::get_groups`] callback per batch.
const QUERY_BATCH: usize = 1024;

pub struct TopIndex {
    db: Arc<Database>,
}

impl TopIndex {
    pub fn new(db: Arc<Database>) -> Result<TopIndex> {
        let wx = db.begin_write()?;
        wx.open_multimap_table(TOP)?;
        wx.commit()?;
        Ok(TopIndex { db })
    }

    /// Route all `hashes` to `group` in one transaction.
    pub fn add_group(&self, hashes: &[Multihash], group: GroupId) -> Result<()> {
        let wx = self.db.begin_write()?;
        {
            let mut table = wx.open_multimap_table(TOP)?;
            for mh in hashes {
                table.insert(mh.to_bytes().as_slice(), group)?;
            }
        }
        wx.commit()?;
        Ok(())
    }

    /// Look up the candidate groups for each hash. The callback receives
    /// batches as `(index of first hash in batch, groups per hash)` and may
    /// stop the iteration early by returning `false`. Hashes unknown to the
    /// index get an empty set.
    pub fn get_groups(
        &self,
        hashes: &[Multihash],
        mut cb: impl FnMut(usize, &[Vec<GroupId>]) -> bool,
    ) -> Result<()> {
        let rx = self.db.begin_read()?;
        let table = rx.open_multimap_table(TOP)?;
        for (chunk_idx, chunk) in hashes.chunks(QUERY_BATCH).enumerate() {
            let mut batch = Vec::with_capacity(chunk.len());
            for mh in chunk {
                let mut groups = Vec::new();
                for v in table.get(mh.to_bytes().as_slice())? {
                    groups.push(v?.value());
                }
                batch.push(groups);
            }
            if !cb(chunk_idx * QUERY_BATCH, &batch) {
                break;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::MetaDb;
    use crate::types::Block;

    fn mh(data: &[u8]) -> Multihash {
        *Block::raw_sha256(data.to_vec()).multihash()
    }

    #[test]
    fn routes_hashes_to_groups() {
        let dir = tempfile::tempdir().unwrap();
        let meta = MetaDb::open(dir.path()).unwrap();
        let index = TopIndex::new(meta.database()).unwrap();

        let (a, b, unknown) = (mh(b"a"), mh(b"b"), mh(b"zz"));
        index.add_group(&[a, b], 0).unwrap();
        index.add_group(&[b], 1).unwrap();
        // replay inserts the same pair again; the mapping must not grow
        index.add_group(&[b], 1).unwrap();

        let mut rows = Vec::new();
        index
            .get_groups(&[a, b, unknown], |base, batch| {
                assert_eq!(base, 0);
                rows.extend_from_slice(batch);
                true
            })
            .unwrap();

        assert_eq!(rows[0], vec![0]);
        assert_eq!(rows[1], vec![0, 1]);
        assert!(rows[2].is_empty());
    }

    #[test]
    fn callback_can_stop_early() {
        let dir = tempfile::tempdir().unwrap();
        let meta = MetaDb::open(dir.path()).unwrap();
        let index = TopIndex::new(meta.database()).unwrap();

        let hashes: Vec<_> = (0u32..3000).map(|i| mh(&i.to_le_bytes())).collect();
        index.add_group(&hashes, 0).unwrap();

        let mut calls = 0;
        index
            .get_groups(&hashes, |_, _| {
                calls += 1;
                false
            })
            .unwrap();
        assert_eq!(calls, 1);
    }
}
