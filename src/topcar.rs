//! Layered top CAR: a Merkle index over a sealed group.
//!
//! Leaves are the group's block multihashes in log order, wrapped as
//! raw-codec CIDv1. Internal nodes are dag-cbor arrays of up to `arity`
//! child CIDs. One `layerN.cardata` file is emitted per level, each a
//! sequence of varint-framed `(cid, node bytes)` records; the build stops at
//! the level that produces a single node, whose CID identifies the whole
//! archive. A `layers` file records the level count.

use crate::blocklog::BlockLog;
use crate::error::{Error, Result};
use crate::types::{Multihash, DAG_CBOR, IPLD_RAW};
use cid::Cid;
use integer_encoding::VarInt;
use multihash_codetable::{Code, MultihashDigest};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use tracing::debug;

pub fn leaf_cid(mh: &Multihash) -> Cid {
    Cid::new_v1(IPLD_RAW, *mh)
}

fn link_node(links: &[Cid]) -> Result<(Cid, Vec<u8>)> {
    let data =
        serde_ipld_dagcbor::to_vec(&links).map_err(|e| Error::Encoding(e.to_string()))?;
    let cid = Cid::new_v1(DAG_CBOR, Code::Sha2_256.digest(&data));
    Ok((cid, data))
}

/// One `layerN.cardata` output file.
struct CarData {
    out: BufWriter<File>,
}

impl CarData {
    fn create(path: &Path) -> Result<CarData> {
        Ok(CarData {
            out: BufWriter::new(File::create(path)?),
        })
    }

    /// Varint frame holding the cid and the node bytes, standard CAR framing.
    fn write_block(&mut self, cid: &Cid, data: &[u8]) -> Result<()> {
        let frame_len = cid.encoded_len() + data.len();
        self.out.write_all(&frame_len.encode_var_vec())?;
        cid.write_bytes(&mut self.out)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        self.out.write_all(data)?;
        Ok(())
    }

    fn finish(self) -> Result<()> {
        self.out
            .into_inner()
            .map_err(|e| e.into_error())?
            .sync_all()?;
        Ok(())
    }
}

fn flush_node(out: &mut CarData, links: &mut Vec<Cid>, next_level: &mut Vec<Cid>) -> Result<()> {
    let (cid, data) = link_node(links)?;
    links.clear();
    out.write_block(&cid, &data)?;
    next_level.push(cid);
    Ok(())
}

/// Build the layered index under `<group dir>/vcar`. Returns the root CID
/// and the number of layers written.
pub fn build(group_path: &Path, log: &BlockLog, arity: usize) -> Result<(Cid, u32)> {
    let vcar = group_path.join("vcar");
    std::fs::create_dir_all(&vcar)?;

    let mut level = 1u32;
    let mut links: Vec<Cid> = Vec::with_capacity(arity);
    let mut next_level: Vec<Cid> = Vec::new();

    // level 1 streams straight off the log; leaves are never materialized
    let mut out = CarData::create(&vcar.join(format!("layer{level}.cardata")))?;
    log.iterate(0, |mh, _, _| {
        links.push(leaf_cid(mh));
        if links.len() == arity {
            flush_node(&mut out, &mut links, &mut next_level)?;
        }
        Ok(())
    })?;
    if !links.is_empty() {
        flush_node(&mut out, &mut links, &mut next_level)?;
    }
    out.finish()?;

    if next_level.is_empty() {
        return Err(Error::State("top car over empty group".into()));
    }

    while next_level.len() > 1 {
        level += 1;
        let prev = std::mem::take(&mut next_level);
        let mut out = CarData::create(&vcar.join(format!("layer{level}.cardata")))?;
        for link in prev {
            links.push(link);
            if links.len() == arity {
                flush_node(&mut out, &mut links, &mut next_level)?;
            }
        }
        if !links.is_empty() {
            flush_node(&mut out, &mut links, &mut next_level)?;
        }
        out.finish()?;
    }

    std::fs::write(vcar.join("layers"), level.to_string())?;
    let root = next_level[0];
    debug!(%root, layers = level, "built top car");
    Ok((root, level))
}
