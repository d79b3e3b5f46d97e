//! Per-group offset indexes: `multihash → append-log offset`.
//!
//! Two variants share the read capability. The mutable one backs a group
//! while it is writable; once the group seals, a compact static table is
//! built from the log and the mutable store is dropped.

mod mutable;
pub mod bsst;

pub use bsst::BsstIndex;
pub use mutable::MutableIndex;

use crate::error::Result;
use crate::types::Multihash;
use smallvec::SmallVec;
use std::fs::File;

/// Candidate log offsets for one queried hash. Static lookups can return
/// more than one candidate when 64-bit key summaries collide; the caller
/// verifies the stored multihash at each offset.
pub type Offsets = SmallVec<[u64; 1]>;

pub trait IndexRead {
    fn get(&self, hashes: &[Multihash]) -> Result<Vec<Offsets>>;
    fn has(&self, hashes: &[Multihash]) -> Result<Vec<bool>>;
}

pub trait IndexWrite {
    fn put(&mut self, entries: &[(Multihash, u64)]) -> Result<()>;
    fn sync(&mut self) -> Result<()>;
}

/// The index variant a group currently routes reads through.
pub enum GroupIndex {
    Mutable(MutableIndex),
    Static(BsstIndex<File>),
}

impl GroupIndex {
    pub fn get(&self, hashes: &[Multihash]) -> Result<Vec<Offsets>> {
        match self {
            GroupIndex::Mutable(m) => m.get(hashes),
            GroupIndex::Static(s) => s.get(hashes),
        }
    }

    pub fn has(&self, hashes: &[Multihash]) -> Result<Vec<bool>> {
        match self {
            GroupIndex::Mutable(m) => m.has(hashes),
            GroupIndex::Static(s) => s.has(hashes),
        }
    }

    /// The mutable variant, while the group still accepts writes.
    pub fn as_mutable(&mut self) -> Option<&mut MutableIndex> {
        match self {
            GroupIndex::Mutable(m) => Some(m),
            GroupIndex::Static(_) => None,
        }
    }
}
