//! Runtime configuration for the sync core (component C6).
//!
//! Separated from logic the way the teacher crate keeps tunables out of its
//! handler code; unlike a full node this library has no CLI of its own, so there is
//! no `clap` surface here, only a plain struct an embedder fills in (from its own
//! CLI/env/file config loader).

use std::time::Duration;

use crate::constants::*;

/// Caps and timeouts that govern a single [`crate::schedule::Schedule`].
#[derive(Debug, Clone, Copy)]
pub struct ScheduleConfig {
    pub max_inv_count: usize,
    pub max_getblocks_count: usize,
    pub max_peer_sched_count: usize,
    pub max_peer_block_inv_count: usize,
    pub max_peer_tx_inv_count: usize,
    pub req_timeout: Duration,
    pub get_blocks_interval_def: Duration,
    pub get_blocks_interval_equal: Duration,
    pub sub_block_delayed_time: Duration,
    pub certtx_delayed_time: Duration,
    pub minttx_delayed_time: Duration,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            max_inv_count: MAX_INV_COUNT,
            max_getblocks_count: MAX_GETBLOCKS_COUNT,
            max_peer_sched_count: MAX_PEER_SCHED_COUNT,
            max_peer_block_inv_count: MAX_PEER_BLOCK_INV_COUNT,
            max_peer_tx_inv_count: MAX_PEER_TX_INV_COUNT,
            req_timeout: REQ_TIMEOUT,
            get_blocks_interval_def: GET_BLOCKS_INTERVAL_DEF_TIME,
            get_blocks_interval_equal: GET_BLOCKS_INTERVAL_EQUAL_TIME,
            sub_block_delayed_time: MAX_SUB_BLOCK_DELAYED_TIME,
            certtx_delayed_time: MAX_CERTTX_DELAYED_TIME,
            minttx_delayed_time: MAX_MINTTX_DELAYED_TIME,
        }
    }
}

/// Caps and timing for the known-tx cache (component C1).
#[derive(Debug, Clone, Copy)]
pub struct KnownTxConfig {
    pub knowninv_maxcount: usize,
    pub max_inv_count: usize,
    pub expired_time: Duration,
    pub min_expired_time: Duration,
    pub min_expired_count: usize,
}

impl Default for KnownTxConfig {
    fn default() -> Self {
        Self {
            knowninv_maxcount: KNOWNINV_MAXCOUNT,
            max_inv_count: MAX_INV_COUNT,
            expired_time: EXPIRED_TIME,
            min_expired_time: MIN_EXPIRED_TIME,
            min_expired_count: MIN_EXPIRED_COUNT,
        }
    }
}

/// Top-level configuration for a [`crate::channel::NetChannel`].
#[derive(Debug, Clone, Copy)]
pub struct NetChannelConfig {
    pub schedule: ScheduleConfig,
    pub known_tx: KnownTxConfig,
    pub pushtx_timeout: Duration,
    pub syntxinv_timeout: Duration,
    pub forkupdate_timeout: Duration,
    pub min_tx_inv_batch: usize,
    pub max_tx_inv_batch: usize,
    /// Whether checkpoint verification via [`crate::contracts::ChainEngine::verify_checkpoint`]
    /// is enforced. The original toggles this under `TESTNET_FLAG`; the concrete
    /// checkpoint hash set itself lives outside this crate (Open Question, §9).
    pub testnet: bool,
}

impl Default for NetChannelConfig {
    fn default() -> Self {
        Self {
            schedule: ScheduleConfig::default(),
            known_tx: KnownTxConfig::default(),
            pushtx_timeout: PUSHTX_TIMEOUT,
            syntxinv_timeout: SYNTXINV_TIMEOUT,
            forkupdate_timeout: FORKUPDATE_TIMEOUT,
            min_tx_inv_batch: MIN_TX_INV_BATCH,
            max_tx_inv_batch: MAX_TX_INV_BATCH,
            testnet: false,
        }
    }
}
