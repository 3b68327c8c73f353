//! Default tunables for the sync core.
//!
//! The excerpted original (`netchn.cpp`) only confirms `PUSHTX_TIMEOUT`,
//! `SYNTXINV_TIMEOUT` and `FORKUPDATE_TIMEOUT` numerically; the remaining caps are
//! referenced by name only and are ported here as defaults an embedder can override
//! through [`crate::config::NetChannelConfig`] / [`crate::config::ScheduleConfig`].

use std::time::Duration;

/// Max entries allowed in a single inbound `Inv` message.
pub const MAX_INV_COUNT: usize = 500;

/// Max hashes returned/accepted in a `GetBlocks` locator response.
pub const MAX_GETBLOCKS_COUNT: usize = 128;

/// Max simultaneous in-flight fetches per peer, per kind (tx or block).
pub const MAX_PEER_SCHED_COUNT: usize = 128;

/// Max announced-but-unresolved block invs tracked per peer.
pub const MAX_PEER_BLOCK_INV_COUNT: usize = 1024;

/// Max announced-but-unresolved tx invs tracked per peer.
pub const MAX_PEER_TX_INV_COUNT: usize = 4096;

/// Floor for `cache_syn_tx_count` used in [`crate::known_tx::PeerKnownTx`] eviction.
pub const KNOWNINV_MAXCOUNT: usize = 2048;

/// Soft-expire / hard-expire base window for known-tx eviction.
pub const EXPIRED_TIME: Duration = Duration::from_secs(600);

/// Window used by the "mostly idle" reclamation rule (rule 4 in §4.1).
pub const MIN_EXPIRED_TIME: Duration = Duration::from_secs(7200);

/// Below this size, rule 4 may still reclaim very old entries.
pub const MIN_EXPIRED_COUNT: usize = 64;

/// Debounce interval for `BroadcastTxInv` when there is outstanding work.
pub const PUSHTX_TIMEOUT: Duration = Duration::from_millis(1000);

/// Re-arm interval for the push-tx timer once caught up.
pub const SYNTXINV_TIMEOUT: Duration = Duration::from_millis(60_000);

/// Interval between fork-set reconciliation passes.
pub const FORKUPDATE_TIMEOUT: Duration = Duration::from_millis(120_000);

/// Time-to-live for a `Requested` assignment before it is reclaimable.
pub const REQ_TIMEOUT: Duration = Duration::from_millis(30_000);

/// Default re-probe interval for `DispatchGetBlocks` when not yet synchronized.
pub const GET_BLOCKS_INTERVAL_DEF_TIME: Duration = Duration::from_millis(5000);

/// Re-probe interval once the peer's locator head equals ours.
pub const GET_BLOCKS_INTERVAL_EQUAL_TIME: Duration = Duration::from_millis(30_000);

/// Delayed-clear window applied to subsidiary blocks parked for a missing ref-block.
pub const MAX_SUB_BLOCK_DELAYED_TIME: Duration = Duration::from_millis(10_000);

/// Delayed-clear window applied to cert txs that overran their quota.
pub const MAX_CERTTX_DELAYED_TIME: Duration = Duration::from_millis(10_000);

/// Delayed-clear window applied to reward/mint txs.
pub const MAX_MINTTX_DELAYED_TIME: Duration = Duration::from_millis(10_000);

/// Adaptive batch size bounds for `PeerForkState::single_syn_tx_inv_count`.
pub const MIN_TX_INV_BATCH: usize = 16;
pub const MAX_TX_INV_BATCH: usize = MAX_INV_COUNT;
