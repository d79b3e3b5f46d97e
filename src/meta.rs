//! Metadata store: the transactional source of truth for group rows and the
//! provider records the retrieval path consumes.
//!
//! Group rows are the commit point of the write path. A `Put` fsyncs the
//! append log and updates the indexes first, and only then moves the row
//! head; recovery replays the log from the last persisted head, so a row is
//! never ahead of durable data.

use crate::error::{Error, Result};
use crate::types::{GroupId, GroupState};
use redb::{
    Database, MultimapTableDefinition, ReadableMultimapTable, ReadableTable, TableDefinition,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

/// `group id → (state, committed blocks, committed bytes, head offset)`
const GROUPS: TableDefinition<u64, (u8, u64, u64, u64)> = TableDefinition::new("groups");
/// `group id → (provider, verified deal, fast retrieval)`
const CANDIDATES: MultimapTableDefinition<u64, (u64, bool, bool)> =
    MultimapTableDefinition::new("candidates");
/// `provider id → addresses`
const PROVIDERS: TableDefinition<u64, ProviderAddrs> = TableDefinition::new("providers");

pub const META_FILE: &str = "meta.redb";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupMeta {
    pub state: GroupState,
    pub blocks: u64,
    pub bytes: u64,
    pub head: u64,
}

/// A provider the deal workflow stored a replica with, as a retrieval
/// candidate for one group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetrievalCandidate {
    pub provider: u64,
    pub verified: bool,
    pub fast: bool,
}

/// Endpoints a provider is reachable at. Opaque strings: HTTP gateway base
/// URLs, plus peer addresses consumed by the graph-protocol client.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderAddrs {
    pub http: Vec<String>,
    pub libp2p: Vec<String>,
    pub bitswap: Vec<String>,
}

impl redb::Value for ProviderAddrs {
    type SelfType<'a> = Self;
    type AsBytes<'a>
        = Vec<u8>
    where
        Self: 'a;

    fn fixed_width() -> Option<usize> {
        None
    }

    fn from_bytes<'a>(data: &'a [u8]) -> Self
    where
        Self: 'a,
    {
        bincode::deserialize(data).unwrap()
    }

    fn as_bytes<'a, 'b: 'a>(value: &'a Self::SelfType<'b>) -> Self::AsBytes<'a>
    where
        Self: 'a,
        Self: 'b,
    {
        bincode::serialize(value).unwrap()
    }

    fn type_name() -> redb::TypeName {
        redb::TypeName::new("provideraddrs")
    }
}

pub struct MetaDb {
    db: Arc<Database>,
}

impl MetaDb {
    pub fn open(root: &Path) -> Result<MetaDb> {
        let db = Database::create(root.join(META_FILE))?;
        let wx = db.begin_write()?;
        wx.open_table(GROUPS)?;
        wx.open_multimap_table(CANDIDATES)?;
        wx.open_table(PROVIDERS)?;
        wx.commit()?;
        Ok(MetaDb { db: Arc::new(db) })
    }

    /// Shared handle for stores living in the same file, like the top index.
    pub fn database(&self) -> Arc<Database> {
        self.db.clone()
    }

    /// Any group still accepting writes, or `None`.
    pub fn get_writable_group(&self) -> Result<Option<(GroupId, GroupMeta)>> {
        let rx = self.db.begin_read()?;
        let table = rx.open_table(GROUPS)?;
        for row in table.iter()? {
            let (k, v) = row?;
            let meta = decode_row(v.value())?;
            if meta.state == GroupState::Writable {
                return Ok(Some((k.value(), meta)));
            }
        }
        Ok(None)
    }

    /// Allocate the next dense group id with an empty writable row.
    pub fn create_group(&self) -> Result<GroupId> {
        let wx = self.db.begin_write()?;
        let id;
        {
            let mut table = wx.open_table(GROUPS)?;
            id = match table.last()? {
                Some((k, _)) => k.value() + 1,
                None => 0,
            };
            table.insert(id, (GroupState::Writable as u8, 0u64, 0u64, 0u64))?;
        }
        wx.commit()?;
        Ok(id)
    }

    pub fn open_group(&self, id: GroupId) -> Result<GroupMeta> {
        let rx = self.db.begin_read()?;
        let table = rx.open_table(GROUPS)?;
        match table.get(id)? {
            Some(v) => decode_row(v.value()),
            None => Err(Error::NotFound(format!("group {id}"))),
        }
    }

    /// Atomically commit the head of a group after a write: state, counters
    /// and the new durable log tail, in one transaction.
    pub fn set_group_head(
        &self,
        id: GroupId,
        state: GroupState,
        blocks: u64,
        bytes: u64,
        head: u64,
    ) -> Result<()> {
        let wx = self.db.begin_write()?;
        {
            let mut table = wx.open_table(GROUPS)?;
            table.insert(id, (state as u8, blocks, bytes, head))?;
        }
        wx.commit()?;
        Ok(())
    }

    pub fn set_group_state(&self, id: GroupId, state: GroupState) -> Result<()> {
        let wx = self.db.begin_write()?;
        {
            let mut table = wx.open_table(GROUPS)?;
            let row = match table.get(id)? {
                Some(v) => v.value(),
                None => return Err(Error::NotFound(format!("group {id}"))),
            };
            table.insert(id, (state as u8, row.1, row.2, row.3))?;
        }
        wx.commit()?;
        Ok(())
    }

    /// All known groups, for restart-time task resumption.
    pub fn list_groups(&self) -> Result<Vec<(GroupId, GroupState)>> {
        let rx = self.db.begin_read()?;
        let table = rx.open_table(GROUPS)?;
        let mut out = Vec::new();
        for row in table.iter()? {
            let (k, v) = row?;
            out.push((k.value(), GroupState::from_u8(v.value().0)?));
        }
        Ok(out)
    }

    pub fn add_retrieval_candidate(&self, group: GroupId, cand: RetrievalCandidate) -> Result<()> {
        let wx = self.db.begin_write()?;
        {
            let mut table = wx.open_multimap_table(CANDIDATES)?;
            table.insert(group, (cand.provider, cand.verified, cand.fast))?;
        }
        wx.commit()?;
        Ok(())
    }

    pub fn get_retrieval_candidates(&self, group: GroupId) -> Result<Vec<RetrievalCandidate>> {
        let rx = self.db.begin_read()?;
        let table = rx.open_multimap_table(CANDIDATES)?;
        let mut out = Vec::new();
        for v in table.get(group)? {
            let (provider, verified, fast) = v?.value();
            out.push(RetrievalCandidate {
                provider,
                verified,
                fast,
            });
        }
        Ok(out)
    }

    pub fn set_provider_addrs(&self, provider: u64, addrs: &ProviderAddrs) -> Result<()> {
        let wx = self.db.begin_write()?;
        {
            let mut table = wx.open_table(PROVIDERS)?;
            table.insert(provider, addrs)?;
        }
        wx.commit()?;
        Ok(())
    }

    pub fn get_provider_addrs(&self, provider: u64) -> Result<Option<ProviderAddrs>> {
        let rx = self.db.begin_read()?;
        let table = rx.open_table(PROVIDERS)?;
        Ok(table.get(provider)?.map(|v| v.value()))
    }
}

fn decode_row(row: (u8, u64, u64, u64)) -> Result<GroupMeta> {
    Ok(GroupMeta {
        state: GroupState::from_u8(row.0)?,
        blocks: row.1,
        bytes: row.2,
        head: row.3,
    })
}
