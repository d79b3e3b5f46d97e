//! Append-only block log.
//!
//! The log is a flat file of varint frames. Each record is the concatenation
//! of the body length, the block's multihash and the payload:
//!
//! ```text
//!  ┌───────────┬─────────┬───────────┐
//!  │varint:    │multihash│payload    │
//!  │body length│         │           │
//!  └───────────┼─────────┴───────────┤
//!              │◄───── =body length ─►│
//! ```
//!
//! Appends land at an in-memory cursor and become durable on [`BlockLog::commit`],
//! which fsyncs and advances the head. Reads are bounds-checked against the
//! head, so a reader can never observe bytes that might still disappear in a
//! crash. Recovery parses forward from the last known head and truncates
//! anything that does not frame cleanly.

use crate::error::{Error, Result};
use crate::types::Multihash;
use integer_encoding::{VarInt, VarIntReader};
use positioned_io::{Cursor as IoCursor, ReadAt, WriteAt};
use std::fs::{File, OpenOptions};
use std::io::Read;
use std::path::Path;
use tracing::{debug, warn};

/// Upper bound on the body (multihash + payload) of a single record. Also
/// used by the retrieval coordinator to bound untrusted response bodies.
pub const MAX_ENTRY_LEN: u64 = 4 << 20;

pub struct BlockLog {
    file: File,
    /// Durable tail: everything below this offset survived an fsync.
    head: u64,
    /// Write cursor: head plus any appended-but-uncommitted bytes.
    pending: u64,
    read_only: bool,
}

impl BlockLog {
    pub fn create(path: &Path) -> Result<BlockLog> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Ok(BlockLog {
            file,
            head: 0,
            pending: 0,
            read_only: false,
        })
    }

    /// Open an existing log whose durable tail is `head` according to the
    /// metadata store. Bytes past `head` are suspect until [`BlockLog::recover`]
    /// has looked at them.
    pub fn open(path: &Path, head: u64) -> Result<BlockLog> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len();
        if len < head {
            return Err(Error::Corruption(format!(
                "log is {len} bytes but committed head is {head}"
            )));
        }
        Ok(BlockLog {
            file,
            head,
            pending: len,
            read_only: false,
        })
    }

    pub fn head(&self) -> u64 {
        self.head
    }

    /// Append records contiguously at the write cursor, returning the
    /// starting offset of each. Nothing is durable until [`BlockLog::commit`].
    pub fn append(&mut self, entries: &[(Multihash, &[u8])]) -> Result<Vec<u64>> {
        if self.read_only {
            return Err(Error::State("append to read-only log".into()));
        }

        let mut buf = Vec::new();
        let mut offsets = Vec::with_capacity(entries.len());
        for (mh, data) in entries {
            let mh_bytes = mh.to_bytes();
            let body_len = (mh_bytes.len() + data.len()) as u64;
            if body_len > MAX_ENTRY_LEN {
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("entry of {body_len} bytes exceeds max entry length"),
                )));
            }
            offsets.push(self.pending + buf.len() as u64);
            buf.extend_from_slice(&body_len.encode_var_vec());
            buf.extend_from_slice(&mh_bytes);
            buf.extend_from_slice(data);
        }

        self.file.write_all_at(self.pending, &buf)?;
        self.pending += buf.len() as u64;
        Ok(offsets)
    }

    /// Fsync appended bytes and advance the durable tail. Returns the new
    /// head offset.
    pub fn commit(&mut self) -> Result<u64> {
        self.file.sync_data()?;
        self.head = self.pending;
        Ok(self.head)
    }

    /// Random read of the record starting at `offset`. The record must lie
    /// entirely below the durable tail.
    pub fn read_at(&self, offset: u64) -> Result<(Multihash, Vec<u8>)> {
        if offset >= self.head {
            return Err(Error::Corruption(format!(
                "read at {offset} past durable tail {}",
                self.head
            )));
        }
        let (mh, data, _end) = read_record(&self.file, offset, self.head)?;
        Ok((mh, data))
    }

    /// In-order scan of all durable records from `from`, usually 0. The
    /// callback receives the multihash, the record's starting offset and the
    /// payload.
    pub fn iterate(
        &self,
        from: u64,
        mut cb: impl FnMut(&Multihash, u64, &[u8]) -> Result<()>,
    ) -> Result<()> {
        let mut pos = from;
        while pos < self.head {
            let (mh, data, end) = read_record(&self.file, pos, self.head)?;
            cb(&mh, pos, &data)?;
            pos = end;
        }
        Ok(())
    }

    /// Scan forward from the durable tail, adopting records that frame
    /// cleanly and truncating the rest. Returns `(multihash, offset,
    /// payload_len)` for each adopted record; the caller must reindex them
    /// and then [`BlockLog::commit`] before accepting writes.
    pub fn recover(&mut self) -> Result<Vec<(Multihash, u64, u64)>> {
        let len = self.file.metadata()?.len();
        let mut adopted = Vec::new();
        let mut pos = self.head;
        while pos < len {
            match read_record(&self.file, pos, len) {
                Ok((mh, data, end)) => {
                    adopted.push((mh, pos, data.len() as u64));
                    pos = end;
                }
                Err(_) => break,
            }
        }
        if pos < len {
            warn!(
                tail = len - pos,
                at = pos,
                "truncating torn record at log tail"
            );
        }
        if pos != len {
            self.file.set_len(pos)?;
            self.file.sync_data()?;
        }
        self.pending = pos;
        if !adopted.is_empty() {
            debug!(records = adopted.len(), "adopted records past head");
        }
        Ok(adopted)
    }

    /// Forbid future appends. Idempotent.
    pub fn mark_read_only(&mut self) {
        self.read_only = true;
    }

    /// Drop any uncommitted tail and settle the file at the durable head.
    /// Idempotent; requires the log to be read-only.
    pub fn finalize(&mut self) -> Result<()> {
        if !self.read_only {
            return Err(Error::State("finalize of writable log".into()));
        }
        if self.file.metadata()?.len() != self.head {
            self.file.set_len(self.head)?;
            self.file.sync_data()?;
        }
        self.pending = self.head;
        Ok(())
    }
}

fn read_record<R: ReadAt>(src: &R, start: u64, limit: u64) -> Result<(Multihash, Vec<u8>, u64)> {
    let mut cursor = IoCursor::new_pos(src, start);
    let body_len: u64 = cursor
        .read_varint()
        .map_err(|e| Error::Corruption(format!("record length at {start}: {e}")))?;
    if body_len > MAX_ENTRY_LEN {
        return Err(Error::Corruption(format!(
            "record of {body_len} bytes at {start} exceeds max entry length"
        )));
    }
    let end = start + body_len.required_space() as u64 + body_len;
    if end > limit {
        return Err(Error::Corruption(format!(
            "record at {start} runs to {end}, past limit {limit}"
        )));
    }

    let mh = Multihash::read(&mut cursor)
        .map_err(|e| Error::Corruption(format!("multihash at {start}: {e}")))?;
    let mh_len = mh.to_bytes().len() as u64;
    if mh_len > body_len {
        return Err(Error::Corruption(format!(
            "multihash overruns record body at {start}"
        )));
    }

    let mut data = vec![0; (body_len - mh_len) as usize];
    cursor
        .read_exact(&mut data)
        .map_err(|e| Error::Corruption(format!("record body at {start}: {e}")))?;
    Ok((mh, data, end))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Block;
    use std::io::Write;

    fn entries(blocks: &[Block]) -> Vec<(Multihash, &[u8])> {
        blocks
            .iter()
            .map(|b| (*b.multihash(), b.data.as_slice()))
            .collect()
    }

    #[test]
    fn append_commit_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blk.jblog");
        let mut log = BlockLog::create(&path).unwrap();

        let blocks: Vec<_> = [&b"hello"[..], b"world", b"!"]
            .iter()
            .map(|d| Block::raw_sha256(d.to_vec()))
            .collect();
        let offsets = log.append(&entries(&blocks)).unwrap();
        assert_eq!(offsets.len(), 3);
        assert_eq!(offsets[0], 0);

        // not yet committed: reads are rejected
        assert!(log.read_at(offsets[0]).is_err());

        log.commit().unwrap();
        for (off, b) in offsets.iter().zip(&blocks) {
            let (mh, data) = log.read_at(*off).unwrap();
            assert_eq!(&mh, b.multihash());
            assert_eq!(data, b.data);
        }
    }

    #[test]
    fn iterate_yields_insertion_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = BlockLog::create(&dir.path().join("blk.jblog")).unwrap();

        let blocks: Vec<_> = (0u32..50)
            .map(|i| Block::raw_sha256(i.to_le_bytes().to_vec()))
            .collect();
        log.append(&entries(&blocks)).unwrap();
        log.commit().unwrap();

        let mut seen = Vec::new();
        log.iterate(0, |mh, _, _| {
            seen.push(*mh);
            Ok(())
        })
        .unwrap();
        let expected: Vec<_> = blocks.iter().map(|b| *b.multihash()).collect();
        assert_eq!(seen, expected);
    }

    #[test]
    fn recover_adopts_clean_tail_and_truncates_torn_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blk.jblog");
        let mut log = BlockLog::create(&path).unwrap();

        let committed = Block::raw_sha256(b"committed".to_vec());
        log.append(&entries(std::slice::from_ref(&committed)))
            .unwrap();
        let head = log.commit().unwrap();

        // a clean record past the head, then garbage
        let adopted = Block::raw_sha256(b"adopted".to_vec());
        log.append(&entries(std::slice::from_ref(&adopted))).unwrap();
        drop(log);
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[0x05, 0xaa]).unwrap(); // truncated frame
        }

        let mut log = BlockLog::open(&path, head).unwrap();
        let recovered = log.recover().unwrap();
        assert_eq!(recovered.len(), 1);
        assert_eq!(&recovered[0].0, adopted.multihash());
        let tail = log.commit().unwrap();
        assert_eq!(tail, std::fs::metadata(&path).unwrap().len());

        let (mh, data) = log.read_at(recovered[0].1).unwrap();
        assert_eq!(&mh, adopted.multihash());
        assert_eq!(data, adopted.data);
    }

    #[test]
    fn read_only_rejects_appends() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = BlockLog::create(&dir.path().join("blk.jblog")).unwrap();
        log.mark_read_only();
        log.mark_read_only(); // idempotent
        let b = Block::raw_sha256(b"x".to_vec());
        assert!(matches!(
            log.append(&entries(std::slice::from_ref(&b))),
            Err(Error::State(_))
        ));
    }

    #[test]
    fn oversized_entry_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = BlockLog::create(&dir.path().join("blk.jblog")).unwrap();
        let b = Block::raw_sha256(vec![0; MAX_ENTRY_LEN as usize + 1]);
        assert!(log.append(&entries(std::slice::from_ref(&b))).is_err());
    }

    #[test]
    fn finalize_truncates_uncommitted_tail() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blk.jblog");
        let mut log = BlockLog::create(&path).unwrap();

        let keep = Block::raw_sha256(b"keep".to_vec());
        log.append(&entries(std::slice::from_ref(&keep))).unwrap();
        let head = log.commit().unwrap();
        let drop_me = Block::raw_sha256(b"drop".to_vec());
        log.append(&entries(std::slice::from_ref(&drop_me))).unwrap();

        log.mark_read_only();
        log.finalize().unwrap();
        log.finalize().unwrap(); // idempotent
        assert_eq!(std::fs::metadata(&path).unwrap().len(), head);
    }
}
