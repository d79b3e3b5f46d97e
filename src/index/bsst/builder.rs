use super::layout::{bucket_of, TableEntry, TableHeader, MAX_BUCKET_BITS};
use std::io::{Result, Write};

/// Builds the static table in one shot: collect the `(key, offset)` pairs,
/// sort them, size the directory, stream everything out in file order.
/// Construction is a plain sort, so the output is deterministic for a
/// given input set regardless of insertion order.
#[derive(Debug)]
pub struct BsstBuilder {
    entries: Vec<TableEntry>,
}

impl BsstBuilder {
    pub fn from_pairs(pairs: impl IntoIterator<Item = (u64, u64)>) -> BsstBuilder {
        let mut entries: Vec<TableEntry> = pairs
            .into_iter()
            .map(|(key, offset)| TableEntry { key, offset })
            .collect();
        entries.sort_unstable();
        entries.dedup();
        BsstBuilder { entries }
    }

    /// Directory width targeting a handful of entries per bucket, so a
    /// lookup settles in two reads: one directory pair, one small entry
    /// range.
    fn bucket_bits(&self) -> u32 {
        let buckets = (self.entries.len() / 8).max(1).next_power_of_two();
        buckets.trailing_zeros().min(MAX_BUCKET_BITS)
    }

    pub fn write(&self, mut writer: impl Write) -> Result<()> {
        let bits = self.bucket_bits();
        let header = TableHeader {
            entries: self.entries.len() as u64,
            bucket_bits: bits,
        };
        writer.write_all(&header.to_le_bytes())?;

        // directory[b] = index of the first entry whose bucket is >= b;
        // the sorted entries make this a single forward sweep
        let mut next = 0usize;
        for bucket in 0..=header.buckets() {
            while next < self.entries.len() && bucket_of(self.entries[next].key, bits) < bucket {
                next += 1;
            }
            writer.write_all(&(next as u64).to_le_bytes())?;
        }

        for entry in &self.entries {
            writer.write_all(&entry.to_le_bytes())?;
        }
        Ok(())
    }
}
