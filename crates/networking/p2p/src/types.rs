//! Narrow identifier types shared across the sync core.
//!
//! Block/tx *payloads* are left generic (see [`crate::contracts`]) since producing
//! and validating them is explicitly out of scope (consensus, EVM/WASM execution);
//! only their hashes are structural to scheduling.

use ethereum_types::H256;

/// Opaque peer identifier. The transport layer owns the real connection; the core
/// only ever holds this non-owning handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub H256);

/// Identifies a fork (chain-id / genesis-derived hash).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ForkHash(pub H256);

/// A block's content hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockHash(pub H256);

/// A transaction's content hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TxId(pub H256);

/// A sending address, used to chain missing-prev tx lookups (`tx_prev`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FromAddr(pub ethereum_types::H160);

/// Sentinel peer id for blocks the core submits on its own behalf — e.g. a
/// locally-mined block accepted via the `SubmitCachePowBlock` control surface —
/// rather than one received from a connection. Never assigned to a real peer.
pub const LOCAL_PEER: PeerId = PeerId(H256::zero());

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl std::fmt::Display for ForkHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl std::fmt::Display for BlockHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}
