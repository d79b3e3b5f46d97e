use crate::error::{Error, Result};
use cid::Cid;
use multihash_codetable::{Code, MultihashDigest};
use strum::{Display, FromRepr};

/// Multihashes in this crate carry at most 64 digest bytes, same as the
/// widest entry in the code table.
pub type Multihash = cid::multihash::Multihash<64>;

/// Dense group identifier, assigned monotonically by the metadata store.
pub type GroupId = u64;

pub const IPLD_RAW: u64 = 0x55;
pub const DAG_CBOR: u64 = 0x71;

/// Lifecycle of a group. Transitions are forward-only; the numeric
/// representation is what the metadata store persists.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, FromRepr)]
#[repr(u8)]
pub enum GroupState {
    /// Accepting writes.
    Writable,
    /// Capacity reached; append log is read-only, finalization pending.
    Full,
    /// The static offset index has been built next to the log.
    BsstExists,
    /// The mutable offset index has been dropped; only the static one
    /// remains.
    LevelIndexDropped,
    /// The layered top CAR has been generated.
    VrcarDone,
    /// Handed over to the deal workflow.
    DealsInProgress,
}

impl GroupState {
    pub fn from_u8(v: u8) -> Result<Self> {
        GroupState::from_repr(v)
            .ok_or_else(|| Error::Corruption(format!("unknown group state {v}")))
    }
}

/// An IPLD block: opaque payload plus the CID the caller derived for it.
///
/// The store never recomputes the hash on write; [`Block::validate`] is for
/// bytes arriving from untrusted sources.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub cid: Cid,
    pub data: Vec<u8>,
}

impl Block {
    /// Convenience constructor wrapping `data` in a raw-codec CIDv1 over its
    /// sha2-256 digest.
    pub fn raw_sha256(data: Vec<u8>) -> Block {
        let cid = Cid::new_v1(IPLD_RAW, Code::Sha2_256.digest(&data));
        Block { cid, data }
    }

    pub fn multihash(&self) -> &Multihash {
        self.cid.hash()
    }

    pub fn validate(&self) -> Result<()> {
        verify_bytes(self.cid.hash(), &self.data)
    }
}

/// Check that `data` hashes to `mh` under the hash function `mh` names.
pub fn verify_bytes(mh: &Multihash, data: &[u8]) -> Result<()> {
    let code = Code::try_from(mh.code())
        .map_err(|_| Error::Corruption(format!("unsupported multihash code {:#x}", mh.code())))?;
    let actual = code.digest(data);
    if actual.digest() != mh.digest() {
        return Err(Error::Corruption(format!(
            "digest mismatch for {} bytes under code {:#x}",
            data.len(),
            mh.code()
        )));
    }
    Ok(())
}

/// Directory name for a group: the id rendered in lowercase base-32
/// (`0-9a-v`), no padding.
pub fn group_dir_name(id: GroupId) -> String {
    const ALPHABET: &[u8; 32] = b"0123456789abcdefghijklmnopqrstuv";
    if id == 0 {
        return "0".into();
    }
    let mut out = Vec::new();
    let mut v = id;
    while v > 0 {
        out.push(ALPHABET[(v % 32) as usize]);
        v /= 32;
    }
    out.reverse();
    String::from_utf8(out).expect("infallible")
}
