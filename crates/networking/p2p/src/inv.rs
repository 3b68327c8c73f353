//! Inventory keys and entries (spec §3), stored in [`crate::schedule::Schedule`]'s
//! arena rather than as a cyclic graph of maps (Design Note, spec §9): entries live
//! in a flat `Vec<Option<InvEntry>>`, addressed by [`InvIndex`], and every reverse
//! index (`orphan_prev`, `tx_prev`, `ref_block_index`) stores `InvIndex` values
//! instead of re-deriving keys. Unsubscribing a fork is then just dropping the
//! arena; there is nothing that can dangle.

use std::collections::HashSet;
use std::time::Instant;

use crate::types::{BlockHash, FromAddr, PeerId, TxId};

/// The kind of object an [`InvKey`] refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InvKind {
    Tx,
    Block,
}

/// `(kind, hash)` — the unit of scheduling, unique within one [`crate::schedule::Schedule`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InvKey {
    pub kind: InvKind,
    pub hash: ethereum_types::H256,
}

impl InvKey {
    pub fn tx(id: TxId) -> Self {
        Self {
            kind: InvKind::Tx,
            hash: id.0,
        }
    }

    pub fn block(hash: BlockHash) -> Self {
        Self {
            kind: InvKind::Block,
            hash: hash.0,
        }
    }

    pub fn as_tx_id(&self) -> TxId {
        TxId(self.hash)
    }

    pub fn as_block_hash(&self) -> BlockHash {
        BlockHash(self.hash)
    }
}

/// Lifecycle state of an [`InvEntry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvState {
    Announced,
    Requested,
    Received,
    Delayed,
    Verified,
}

/// Arena index into a [`crate::schedule::Schedule`]'s entry storage. Carries a
/// generation counter so a reused slot after removal never aliases a stale index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InvIndex {
    pub(crate) slot: u32,
    pub(crate) generation: u32,
}

/// Block- or tx-specific fields kept alongside the common [`InvEntry`] state.
#[derive(Debug, Default)]
pub struct BlockExtra<B> {
    pub prev_hash: Option<BlockHash>,
    pub orphan_children: HashSet<InvIndex>,
    pub payload: Option<B>,
}

#[derive(Debug, Default)]
pub struct TxExtra<Tx> {
    pub from_addr: Option<FromAddr>,
    pub nonce: Option<u64>,
    pub payload: Option<Tx>,
}

/// Payload-and-kind-specific data for one [`InvEntry`].
#[derive(Debug)]
pub enum InvPayload<B, Tx> {
    Block(BlockExtra<B>),
    Tx(TxExtra<Tx>),
}

impl<B, Tx> InvPayload<B, Tx> {
    pub fn as_block(&self) -> Option<&BlockExtra<B>> {
        match self {
            InvPayload::Block(b) => Some(b),
            InvPayload::Tx(_) => None,
        }
    }

    pub fn as_block_mut(&mut self) -> Option<&mut BlockExtra<B>> {
        match self {
            InvPayload::Block(b) => Some(b),
            InvPayload::Tx(_) => None,
        }
    }

    pub fn as_tx(&self) -> Option<&TxExtra<Tx>> {
        match self {
            InvPayload::Tx(t) => Some(t),
            InvPayload::Block(_) => None,
        }
    }

    pub fn as_tx_mut(&mut self) -> Option<&mut TxExtra<Tx>> {
        match self {
            InvPayload::Tx(t) => Some(t),
            InvPayload::Block(_) => None,
        }
    }

    pub fn has_payload(&self) -> bool {
        match self {
            InvPayload::Block(b) => b.payload.is_some(),
            InvPayload::Tx(t) => t.payload.is_some(),
        }
    }
}

/// One tracked inventory item within a [`crate::schedule::Schedule`].
#[derive(Debug)]
pub struct InvEntry<B, Tx> {
    pub key: InvKey,
    pub known_peers: HashSet<PeerId>,
    pub assigned_peer: Option<PeerId>,
    pub request_expiry: Option<Instant>,
    pub state: InvState,
    pub extra: InvPayload<B, Tx>,
}

impl<B, Tx> InvEntry<B, Tx> {
    pub fn new_block(key: InvKey) -> Self {
        Self {
            key,
            known_peers: HashSet::new(),
            assigned_peer: None,
            request_expiry: None,
            state: InvState::Announced,
            extra: InvPayload::Block(BlockExtra::default()),
        }
    }

    pub fn new_tx(key: InvKey) -> Self {
        Self {
            key,
            known_peers: HashSet::new(),
            assigned_peer: None,
            request_expiry: None,
            state: InvState::Announced,
            extra: InvPayload::Tx(TxExtra::default()),
        }
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        match self.request_expiry {
            Some(expiry) => now >= expiry,
            None => false,
        }
    }

    /// True when this entry can be (re)assigned: never requested, or a stale
    /// request whose deadline has passed (reclaimed lazily, spec §4.3/§5).
    pub fn is_assignable(&self, now: Instant) -> bool {
        matches!(self.state, InvState::Announced)
            || (matches!(self.state, InvState::Requested) && self.is_expired(now))
    }
}
