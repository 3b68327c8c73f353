//! Per-(peer, fork) outbound tx-inv cycle state machine (component C2, spec §4.2).

use std::time::{Duration, Instant};

use crate::known_tx::PeerKnownTx;
use crate::types::TxId;

/// The three states of the outbound tx-announcement cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxInvStatus {
    AllowSync,
    WaitPeerRecv,
    WaitPeerComplete,
}

/// Result of [`PeerForkState::check`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckResult {
    AllowSyn,
    WaitSyn,
    WaitTimeout,
}

/// Per-(peer, fork) state: subscription, known-tx cache, and the tx-inv FSM.
#[derive(Debug)]
pub struct PeerForkState {
    pub subscribed: bool,
    pub synchronized: bool,
    pub known_tx: PeerKnownTx,
    pub cache_syn_tx_count: u64,
    tx_inv_status: TxInvStatus,
    tx_inv_send_time: Option<Instant>,
    pub peer_get_data_time: Option<Instant>,
    single_syn_tx_inv_count: usize,
    min_batch: usize,
    max_batch: usize,
    timeout: Duration,
}

/// A batch of txids to announce, produced by [`PeerForkState::make_tx_inv`].
pub struct TxInvBatch {
    pub txids: Vec<TxId>,
}

impl PeerForkState {
    pub fn new(
        known_tx: PeerKnownTx,
        min_batch: usize,
        max_batch: usize,
        timeout: Duration,
    ) -> Self {
        Self {
            subscribed: false,
            synchronized: false,
            known_tx,
            cache_syn_tx_count: 0,
            tx_inv_status: TxInvStatus::AllowSync,
            tx_inv_send_time: None,
            peer_get_data_time: None,
            single_syn_tx_inv_count: min_batch.max(1),
            min_batch: min_batch.max(1),
            max_batch: max_batch.max(min_batch.max(1)),
            timeout,
        }
    }

    pub fn status(&self) -> TxInvStatus {
        self.tx_inv_status
    }

    /// Check() — spec §4.2.
    pub fn check(&self, now: Instant) -> CheckResult {
        match self.tx_inv_status {
            TxInvStatus::AllowSync => CheckResult::AllowSyn,
            TxInvStatus::WaitPeerRecv | TxInvStatus::WaitPeerComplete => {
                let send_time = self.tx_inv_send_time.unwrap_or(now);
                if now.saturating_duration_since(send_time) < self.timeout {
                    CheckResult::WaitSyn
                } else {
                    CheckResult::WaitTimeout
                }
            }
        }
    }

    /// MakeTxInv(pool) — spec §4.2. `pool` is the ordered set of candidate txids in
    /// the mempool for this fork; only entries not already in `known_tx` are sent.
    pub fn make_tx_inv(&mut self, pool: impl IntoIterator<Item = TxId>, now: Instant) -> Option<TxInvBatch> {
        if self.check(now) != CheckResult::AllowSyn {
            return None;
        }
        let mut batch = Vec::with_capacity(self.single_syn_tx_inv_count);
        for txid in pool {
            if batch.len() >= self.single_syn_tx_inv_count {
                break;
            }
            if !self.known_tx.contains(&txid) {
                batch.push(txid);
            }
        }
        if batch.is_empty() {
            return None;
        }
        self.tx_inv_status = TxInvStatus::WaitPeerRecv;
        self.tx_inv_send_time = Some(now);
        let pool_size = self.cache_syn_tx_count as usize;
        self.known_tx.add_known_tx(batch.iter().copied(), pool_size);
        Some(TxInvBatch { txids: batch })
    }

    /// ResetTxInvSynStatus(complete) — spec §4.2.
    pub fn reset_tx_inv_syn_status(&mut self, complete: bool) {
        self.tx_inv_status = if complete {
            TxInvStatus::AllowSync
        } else {
            TxInvStatus::WaitPeerComplete
        };
        if complete {
            self.single_syn_tx_inv_count =
                (self.single_syn_tx_inv_count / 2).max(self.min_batch);
        } else {
            self.single_syn_tx_inv_count =
                (self.single_syn_tx_inv_count * 2).min(self.max_batch);
        }
    }

    pub fn single_syn_tx_inv_count(&self) -> usize {
        self.single_syn_tx_inv_count
    }
}
