//! External collaborators (spec §4.5) — the core's only view of consensus rules,
//! the mempool, block/tx application and the transport. None of these traits are
//! implemented in this crate; an embedding node supplies them, the way the teacher
//! crate is handed a `Blockchain`/`Store` handle rather than owning chain state
//! itself (`sync/full.rs` takes `Arc<Blockchain>` and `Store` as parameters).

use async_trait::async_trait;

use crate::events::OutboundEvent;
use crate::types::{BlockHash, ForkHash, FromAddr, PeerId, TxId};

/// Minimal structural facts about a block the scheduler needs to chain orphans and
/// detect subsidiary/vacant blocks. Deliberately narrow: anything about *validity*
/// (PoW, signatures, state transition) stays behind [`ChainEngine`]/[`Dispatcher`];
/// this is just the shape every block has, independent of the consensus rules that
/// produced it (execution/consensus itself remains a non-goal).
pub trait BlockMeta {
    fn hash(&self) -> BlockHash;
    fn prev_hash(&self) -> BlockHash;
    fn height(&self) -> u64;
    /// `None` for a primary-chain block; `Some(primary-chain hash)` for a
    /// subsidiary block anchored to that primary block.
    fn ref_block(&self) -> Option<BlockHash>;
    fn is_vacant(&self) -> bool;
    fn has_null_mint_dest(&self) -> bool;
    /// `(txid, sender, nonce)` for every transaction carried by the block (mint
    /// transaction included), in block order. Used only to chain
    /// `GetNextTx(from, nonce + 1)` lookups after the block applies; the core
    /// never interprets tx content beyond this triple.
    fn included_txs(&self) -> Vec<(TxId, FromAddr, u64)>;
}

/// Minimal structural facts about a transaction, analogous to [`BlockMeta`].
pub trait TxMeta {
    fn txid(&self) -> TxId;
    fn from_addr(&self) -> FromAddr;
    fn nonce(&self) -> u64;
    fn is_cert_tx(&self) -> bool;
    fn is_reward_tx(&self) -> bool;
}

/// Result of handing a block or tx to the [`Dispatcher`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Errno {
    Ok,
    ErrAlreadyHave,
    ErrMissingPrev,
    ErrConflictingInput,
    ErrTooManyCertTx,
    ErrInvalid,
    ErrOther,
}

/// Outcome of a consensus ballot lookup, used when filtering cached PoW blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Agreement {
    Undecided,
    Accepted,
    Rejected,
}

/// Read-only chain queries the schedule/channel need to make scheduling decisions.
/// Never mutates chain state; all mutation goes through [`Dispatcher`].
#[async_trait]
pub trait ChainEngine<B>: Send + Sync + 'static {
    async fn get_last_block_status(&self, fork: ForkHash) -> Option<(u64, BlockHash)>;
    async fn get_block_location(&self, hash: BlockHash) -> Option<ForkHash>;
    async fn exists(&self, fork: ForkHash, hash: BlockHash) -> bool;
    async fn get_block(&self, fork: ForkHash, hash: BlockHash) -> Option<B>;
    async fn get_block_inv(&self, fork: ForkHash, locator: &[ethereum_types::H256], max: usize) -> Option<Vec<BlockHash>>;
    async fn get_block_locator(&self, fork: ForkHash, depth: u64, max: usize) -> Option<Vec<ethereum_types::H256>>;
    async fn get_fork_storage_max_height(&self, fork: ForkHash) -> u64;
    async fn verify_pow_block(&self, fork: ForkHash, hash: BlockHash) -> bool;
    async fn verify_checkpoint(&self, fork: ForkHash, height: u64, hash: BlockHash) -> bool;
    async fn verify_repeat_block(&self, fork: ForkHash, hash: BlockHash) -> bool;
    async fn is_vacant_block_before_created_fork_height(&self, fork: ForkHash, height: u64) -> bool;
    async fn list_fork_context(&self) -> Vec<ForkHash>;
    async fn exists_tx(&self, txid: TxId) -> bool;
}

/// Mempool queries; insertion happens only through [`Dispatcher::add_new_tx`].
#[async_trait]
pub trait TxPool<Tx>: Send + Sync + 'static {
    async fn exists(&self, txid: TxId) -> bool;
    async fn get(&self, txid: TxId) -> Option<Tx>;
    async fn list_tx(&self, fork: ForkHash) -> Vec<TxId>;
    async fn check_tx_nonce(&self, from: FromAddr, nonce: u64) -> bool;
    async fn get_dest_next_tx_nonce(&self, from: FromAddr) -> Option<u64>;
    async fn pool_size(&self, fork: ForkHash) -> usize;
}

/// Applies accepted blocks/txs to chain/pool state.
#[async_trait]
pub trait Dispatcher<B, Tx>: Send + Sync + 'static {
    async fn add_new_block(&self, fork: ForkHash, block: B, peer: PeerId) -> Errno;
    async fn add_new_tx(&self, fork: ForkHash, tx: Tx, peer: PeerId) -> Errno;
}

/// Consensus progression signal for cached PoW blocks (spec §4.3).
#[async_trait]
pub trait ConsensusOracle: Send + Sync + 'static {
    async fn get_next_consensus(&self) -> Option<BlockHash>;
    async fn get_agreement(&self, height: u64) -> Agreement;
}

/// The wire boundary: dispatch outbound events, manage timers. Non-blocking —
/// implementations must enqueue rather than synchronously write to a socket.
#[async_trait]
pub trait PeerTransport<B, Tx>: Send + Sync + 'static {
    async fn dispatch_event(&self, event: OutboundEvent<B, Tx>);
}
