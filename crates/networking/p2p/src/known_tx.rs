//! Per-(peer, fork) bounded cache of transaction hashes already exchanged with a
//! peer (component C1, spec §4.1).
//!
//! Two indices over the same set: a `HashSet` for membership and a time-ordered
//! `VecDeque` for eviction, the same split the teacher's `Mempool` uses between
//! `transaction_pool` (membership) and `txs_order` (eviction order).

use std::collections::{HashSet, VecDeque};
use std::time::{Duration, Instant};

use crate::config::KnownTxConfig;
use crate::types::TxId;

#[derive(Debug)]
struct TimedTx {
    txid: TxId,
    time: Instant,
}

/// Bounded known-tx set for a single (peer, fork) pair.
#[derive(Debug)]
pub struct PeerKnownTx {
    config: KnownTxConfig,
    members: HashSet<TxId>,
    order: VecDeque<TimedTx>,
}

impl PeerKnownTx {
    pub fn new(config: KnownTxConfig) -> Self {
        Self {
            config,
            members: HashSet::new(),
            order: VecDeque::new(),
        }
    }

    pub fn contains(&self, txid: &TxId) -> bool {
        self.members.contains(txid)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Inserts `txs`, then applies the four eviction rules from spec §4.1.
    ///
    /// `total_pool_size` is the current mempool size for this fork, used to derive
    /// `cache_syn_tx_count`.
    pub fn add_known_tx(&mut self, txs: impl IntoIterator<Item = TxId>, total_pool_size: usize) {
        let now = Instant::now();
        for txid in txs {
            if self.members.insert(txid) {
                self.order.push_back(TimedTx { txid, time: now });
            }
        }
        self.evict(total_pool_size, now);
    }

    fn cache_syn_tx_count(&self, total_pool_size: usize) -> usize {
        total_pool_size.max(self.config.knowninv_maxcount)
    }

    fn control_capacity(&self, cache_syn_tx_count: usize) -> usize {
        cache_syn_tx_count + 2 * self.config.max_inv_count
    }

    fn max_capacity(&self, cache_syn_tx_count: usize, control_capacity: usize) -> usize {
        (2 * cache_syn_tx_count).max(control_capacity + self.config.max_inv_count)
    }

    fn evict(&mut self, total_pool_size: usize, now: Instant) {
        let cache_syn_tx_count = self.cache_syn_tx_count(total_pool_size);
        let control_capacity = self.control_capacity(cache_syn_tx_count);
        let max_capacity = self.max_capacity(cache_syn_tx_count, control_capacity);

        let soft_expire = checked_sub(now, self.config.expired_time);
        let hard_expire = checked_sub(now, self.config.expired_time * 3);
        let min_expire = checked_sub(now, self.config.min_expired_time);

        loop {
            let Some(oldest) = self.order.front() else {
                break;
            };
            let size = self.members.len();
            let should_evict = (size > control_capacity && oldest.time <= soft_expire)
                || oldest.time <= hard_expire
                || size > max_capacity
                || (size <= self.config.min_expired_count && oldest.time <= min_expire);
            if !should_evict {
                break;
            }
            let evicted = self.order.pop_front().expect("checked non-empty above");
            self.members.remove(&evicted.txid);
        }
    }

    /// Upper bound implied by invariant I1, given the current pool size. Exposed for
    /// tests that check the bound holds after arbitrary insert sequences.
    pub fn invariant_bound(&self, total_pool_size: usize) -> usize {
        let cache_syn_tx_count = self.cache_syn_tx_count(total_pool_size);
        let control_capacity = self.control_capacity(cache_syn_tx_count);
        (2 * cache_syn_tx_count).max(control_capacity + self.config.max_inv_count)
    }
}

/// `Instant` has no epoch before process start; saturate instead of underflowing
/// when a window is larger than the elapsed wall-clock time (common in tests).
fn checked_sub(now: Instant, window: Duration) -> Instant {
    now.checked_sub(window).unwrap_or(now)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn txid(n: u64) -> TxId {
        TxId(ethereum_types::H256::from_low_u64_be(n))
    }

    #[test]
    fn inserts_are_idempotent() {
        let mut known = PeerKnownTx::new(KnownTxConfig::default());
        known.add_known_tx([txid(1), txid(1), txid(2)], 10);
        assert_eq!(known.len(), 2);
    }

    #[test]
    fn max_capacity_rule_bounds_growth() {
        let config = KnownTxConfig {
            knowninv_maxcount: 4,
            max_inv_count: 2,
            ..KnownTxConfig::default()
        };
        let mut known = PeerKnownTx::new(config);
        // cache_syn_tx_count = max(total_pool_size=0, 4) = 4
        // control_capacity = 4 + 2*2 = 8, max_capacity = max(8, 8+2) = 10
        let many: Vec<TxId> = (0..50).map(txid).collect();
        known.add_known_tx(many, 0);
        assert!(known.len() <= known.invariant_bound(0));
    }

    #[test]
    fn empty_cache_has_no_oldest_to_evict() {
        let mut known = PeerKnownTx::new(KnownTxConfig::default());
        known.evict(0, Instant::now());
        assert!(known.is_empty());
    }
}
