//! Static offset index (`blk.bsst`): a create-once sorted key table built
//! by scanning a sealed group's log.
//!
//! Every entry is a 64-bit fold of a block's multihash plus its log
//! offset, sorted by key, with a directory in front mapping key prefixes
//! to entry ranges. A lookup therefore costs two positioned reads — the
//! directory pair for the key's bucket, then that bucket's entry run —
//! without ever loading the table into memory.
//!
//! Folded keys are not unique: distinct multihashes can share one. A
//! lookup returns *candidate* offsets, and the reader of the log record at
//! each candidate must compare the stored multihash against the requested
//! one before serving bytes; sorting keeps all candidates for a key
//! adjacent, so they all surface in the one bucket read.

mod builder;
mod layout;

pub use builder::BsstBuilder;
pub use layout::key_summary;

use super::{IndexRead, Offsets};
use crate::blocklog::BlockLog;
use crate::error::{Error, Result};
use crate::types::Multihash;
use layout::{bucket_of, TableEntry, TableHeader};
use positioned_io::{Cursor as IoCursor, ReadAt};
use std::cmp::Ordering;
use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::Path;
use tracing::debug;

pub struct BsstIndex<R> {
    inner: R,
    header: TableHeader,
}

impl BsstIndex<File> {
    pub fn open_path(path: &Path) -> Result<BsstIndex<File>> {
        BsstIndex::open(File::open(path)?)
    }

    /// Scan the log and produce the static table at `path`. The file is
    /// fully written and synced before this returns, so a crash afterwards
    /// can rely on its presence.
    pub fn build_from_log(path: &Path, log: &BlockLog) -> Result<()> {
        let mut pairs = Vec::new();
        log.iterate(0, |mh, offset, _| {
            pairs.push((key_summary(mh), offset));
            Ok(())
        })?;
        debug!(entries = pairs.len(), "building static index");

        let builder = BsstBuilder::from_pairs(pairs);
        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);
        builder.write(&mut writer)?;
        writer.flush()?;
        writer.into_inner().map_err(|e| e.into_error())?.sync_all()?;
        Ok(())
    }
}

impl<R: ReadAt> BsstIndex<R> {
    pub fn open(inner: R) -> Result<BsstIndex<R>> {
        let mut header_bytes = [0; TableHeader::SIZE];
        IoCursor::new(&inner)
            .read_exact(&mut header_bytes)
            .map_err(|e| Error::Corruption(format!("static index header: {e}")))?;
        let header = TableHeader::from_le_bytes(header_bytes)
            .ok_or_else(|| Error::Corruption("not a static index file".into()))?;
        Ok(BsstIndex { inner, header })
    }

    /// Candidate log offsets for a multihash; empty when the key is
    /// certainly absent.
    pub fn lookup(&self, mh: &Multihash) -> Result<Offsets> {
        self.lookup_key(key_summary(mh))
    }

    fn lookup_key(&self, key: u64) -> Result<Offsets> {
        let mut found = Offsets::new();
        if self.header.entries == 0 {
            return Ok(found);
        }

        let bucket = bucket_of(key, self.header.bucket_bits);
        let mut range_bytes = [0u8; 16];
        IoCursor::new_pos(&self.inner, self.header.directory_pos(bucket))
            .read_exact(&mut range_bytes)?;
        let start = u64::from_le_bytes(range_bytes[0..8].try_into().expect("infallible"));
        let end = u64::from_le_bytes(range_bytes[8..16].try_into().expect("infallible"));
        if start > end || end > self.header.entries {
            return Err(Error::Corruption(format!(
                "directory range {start}..{end} out of bounds for bucket {bucket}"
            )));
        }
        if start == end {
            return Ok(found);
        }

        // one read pulls in the whole bucket; the run is sorted, so stop
        // at the first greater key
        let mut bucket_bytes = vec![0u8; (end - start) as usize * TableEntry::SIZE];
        IoCursor::new_pos(&self.inner, self.header.entry_pos(start))
            .read_exact(&mut bucket_bytes)?;
        for raw in bucket_bytes.chunks_exact(TableEntry::SIZE) {
            let entry = TableEntry::from_le_bytes(raw.try_into().expect("infallible"));
            match entry.key.cmp(&key) {
                Ordering::Less => continue,
                Ordering::Equal => found.push(entry.offset),
                Ordering::Greater => break,
            }
        }
        Ok(found)
    }
}

impl<R: ReadAt> IndexRead for BsstIndex<R> {
    fn get(&self, hashes: &[Multihash]) -> Result<Vec<Offsets>> {
        hashes.iter().map(|mh| self.lookup(mh)).collect()
    }

    /// Probabilistic: a key collision can answer `true` for an absent
    /// hash. Callers resolving reads verify at the log offset anyway.
    fn has(&self, hashes: &[Multihash]) -> Result<Vec<bool>> {
        Ok(self
            .get(hashes)?
            .into_iter()
            .map(|offsets| !offsets.is_empty())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck::TestResult;
    use quickcheck_macros::quickcheck;
    use std::collections::HashSet;

    fn build_bytes(pairs: &[(u64, u64)]) -> Vec<u8> {
        let mut out = Vec::new();
        BsstBuilder::from_pairs(pairs.iter().copied())
            .write(&mut out)
            .unwrap();
        out
    }

    fn open_mem(bytes: Vec<u8>) -> BsstIndex<Vec<u8>> {
        BsstIndex::open(bytes).unwrap()
    }

    #[quickcheck]
    fn every_inserted_pair_is_found(pairs: Vec<(u64, u64)>) -> TestResult {
        let index = open_mem(build_bytes(&pairs));
        for (key, offset) in &pairs {
            let found = index.lookup_key(*key).unwrap();
            if !found.contains(offset) {
                return TestResult::error(format!("{key:#x} -> {offset} not found"));
            }
        }
        TestResult::passed()
    }

    #[quickcheck]
    fn absent_keys_produce_no_offsets(keys: Vec<u64>, probe: u64) -> TestResult {
        let present: HashSet<u64> = keys.into_iter().collect();
        if present.contains(&probe) {
            return TestResult::discard();
        }
        let pairs: Vec<(u64, u64)> =
            present.iter().enumerate().map(|(i, k)| (*k, i as u64)).collect();
        let index = open_mem(build_bytes(&pairs));
        TestResult::from_bool(index.lookup_key(probe).unwrap().is_empty())
    }

    #[test]
    fn colliding_keys_return_all_candidates() {
        let shared = 0xfeed_beef_u64;
        let pairs = vec![(shared, 1), (shared, 2), (7, 3)];
        let index = open_mem(build_bytes(&pairs));
        let found: HashSet<u64> = index.lookup_key(shared).unwrap().into_iter().collect();
        assert_eq!(found, HashSet::from([1, 2]));
        assert_eq!(index.lookup_key(7).unwrap().as_slice(), &[3]);
    }

    #[test]
    fn neighbors_in_one_bucket_stay_separate() {
        // keys land in the same bucket for any narrow directory
        let pairs = vec![(0x1000, 1), (0x1001, 2), (0x1002, 3)];
        let index = open_mem(build_bytes(&pairs));
        assert_eq!(index.lookup_key(0x1001).unwrap().as_slice(), &[2]);
        assert!(index.lookup_key(0x1003).unwrap().is_empty());
    }

    #[test]
    fn empty_table_answers_empty() {
        let index = open_mem(build_bytes(&[]));
        assert!(index.lookup_key(9).unwrap().is_empty());
    }

    #[test]
    fn bad_magic_is_corruption() {
        let mut bytes = build_bytes(&[(1, 1)]);
        bytes[0] ^= 0xff;
        assert!(matches!(BsstIndex::open(bytes), Err(Error::Corruption(_))));
    }

    #[test]
    fn corrupt_directory_is_detected() {
        let mut bytes = build_bytes(&[(u64::MAX, 1)]);
        // overwrite the last directory element with an out-of-bounds index
        let header =
            TableHeader::from_le_bytes(bytes[..TableHeader::SIZE].try_into().unwrap()).unwrap();
        let at = header.directory_pos(header.buckets()) as usize;
        bytes[at..at + 8].copy_from_slice(&u64::MAX.to_le_bytes());
        let index = open_mem(bytes);
        assert!(matches!(
            index.lookup_key(u64::MAX),
            Err(Error::Corruption(_))
        ));
    }
}
