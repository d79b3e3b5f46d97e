use super::{IndexRead, IndexWrite, Offsets};
use crate::error::Result;
use crate::types::Multihash;
use redb::{ReadableTable, TableDefinition};
use smallvec::smallvec;
use std::path::Path;

const OFFSETS: TableDefinition<&[u8], u64> = TableDefinition::new("offsets");

/// Mutable offset index over an embedded transactional store. One per
/// writable group, living at `blk.jbmeta` inside the group directory.
pub struct MutableIndex {
    db: redb::Database,
}

impl MutableIndex {
    pub fn open(path: &Path) -> Result<MutableIndex> {
        let db = redb::Database::create(path)?;
        // make sure the table exists so reads before the first put succeed
        let wx = db.begin_write()?;
        wx.open_table(OFFSETS)?;
        wx.commit()?;
        Ok(MutableIndex { db })
    }

    /// Delete the on-disk store. The instance must have been dropped first.
    pub fn remove(path: &Path) -> Result<()> {
        std::fs::remove_file(path)?;
        Ok(())
    }
}

impl IndexRead for MutableIndex {
    fn get(&self, hashes: &[Multihash]) -> Result<Vec<Offsets>> {
        let rx = self.db.begin_read()?;
        let table = rx.open_table(OFFSETS)?;
        let mut out = Vec::with_capacity(hashes.len());
        for mh in hashes {
            match table.get(mh.to_bytes().as_slice())? {
                Some(v) => out.push(smallvec![v.value()]),
                None => out.push(Offsets::new()),
            }
        }
        Ok(out)
    }

    fn has(&self, hashes: &[Multihash]) -> Result<Vec<bool>> {
        let rx = self.db.begin_read()?;
        let table = rx.open_table(OFFSETS)?;
        let mut out = Vec::with_capacity(hashes.len());
        for mh in hashes {
            out.push(table.get(mh.to_bytes().as_slice())?.is_some());
        }
        Ok(out)
    }
}

impl IndexWrite for MutableIndex {
    fn put(&mut self, entries: &[(Multihash, u64)]) -> Result<()> {
        let wx = self.db.begin_write()?;
        {
            let mut table = wx.open_table(OFFSETS)?;
            for (mh, offset) in entries {
                table.insert(mh.to_bytes().as_slice(), offset)?;
            }
        }
        wx.commit()?;
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        // every put commits a durable transaction
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Block;

    #[test]
    fn put_get_has() {
        let dir = tempfile::tempdir().unwrap();
        let mut idx = MutableIndex::open(&dir.path().join("blk.jbmeta")).unwrap();

        let a = Block::raw_sha256(b"a".to_vec());
        let b = Block::raw_sha256(b"b".to_vec());
        let missing = Block::raw_sha256(b"missing".to_vec());

        idx.put(&[(*a.multihash(), 0), (*b.multihash(), 77)]).unwrap();

        let got = idx
            .get(&[*b.multihash(), *missing.multihash(), *a.multihash()])
            .unwrap();
        assert_eq!(got[0].as_slice(), &[77]);
        assert!(got[1].is_empty());
        assert_eq!(got[2].as_slice(), &[0]);

        let has = idx.has(&[*a.multihash(), *missing.multihash()]).unwrap();
        assert_eq!(has, vec![true, false]);
    }

    #[test]
    fn reopen_sees_previous_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blk.jbmeta");
        let a = Block::raw_sha256(b"a".to_vec());
        {
            let mut idx = MutableIndex::open(&path).unwrap();
            idx.put(&[(*a.multihash(), 42)]).unwrap();
        }
        let idx = MutableIndex::open(&path).unwrap();
        assert_eq!(idx.get(&[*a.multihash()]).unwrap()[0].as_slice(), &[42]);
    }
}
