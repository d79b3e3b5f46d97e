//! # carload
//!
//! Content-addressed block storage. Incoming IPLD blocks, keyed by their
//! multihash, accumulate into bounded append-only *groups*; a full group
//! seals, trades its mutable index for a compact static one, and grows a
//! layered CAR-style Merkle index whose root CID identifies the archive
//! handed to the deal workflow. Reads route through a global
//! multihash-to-group index; blocks that have left local storage come back
//! through the retrieval coordinator, which coalesces concurrent requests
//! and verifies every byte fetched from the outside.
//!
//! ```text
//!  Put ──▶ registry ──▶ group ──▶ append log ─ fsync
//!                         │           │
//!                         │           ├─▶ offset index (per group)
//!                         │           └─▶ top index    (global)
//!                         └─ full? ──▶ worker: seal, build static
//!                                      index, emit layered top CAR
//!
//!  View ──▶ top index ──▶ group ──▶ offset index ──▶ log read
//!  Fetch ──▶ cache ──▶ HTTP gateways ──▶ graph protocol
//! ```

pub mod blocklog;
pub mod config;
pub mod error;
pub mod group;
pub mod index;
pub mod meta;
pub mod retrieval;
pub mod service;
pub mod topcar;
pub mod topindex;
pub mod types;

pub use config::Config;
pub use error::{Error, Result};
pub use meta::{MetaDb, ProviderAddrs, RetrievalCandidate};
pub use retrieval::{BlockRetriever, GraphFetcher};
pub use service::{Carload, OpenOptions};
pub use types::{Block, GroupId, GroupState, Multihash};
