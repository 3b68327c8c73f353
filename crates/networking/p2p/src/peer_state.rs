//! Per-peer state (spec §3): activation, subscribed forks, and one
//! [`PeerForkState`] per fork the peer is subscribed to. Held in
//! [`crate::channel::NetChannel`]'s `mapPeer`, behind a single `RwLock` (spec §5).

use std::collections::HashMap;
use std::time::Instant;

use crate::config::{KnownTxConfig, NetChannelConfig};
use crate::known_tx::PeerKnownTx;
use crate::peer_fork_state::PeerForkState;
use crate::types::ForkHash;

/// Everything the channel tracks about one connected peer.
#[derive(Debug)]
pub struct PeerState {
    pub node_network: bool,
    pub active_since: Instant,
    pub last_fork_update: Instant,
    pub forks: HashMap<ForkHash, PeerForkState>,
    known_tx_config: KnownTxConfig,
    min_tx_inv_batch: usize,
    max_tx_inv_batch: usize,
    syntxinv_timeout: std::time::Duration,
}

impl PeerState {
    pub fn new(config: &NetChannelConfig, node_network: bool, now: Instant) -> Self {
        Self {
            node_network,
            active_since: now,
            last_fork_update: now,
            forks: HashMap::new(),
            known_tx_config: config.known_tx,
            min_tx_inv_batch: config.min_tx_inv_batch,
            max_tx_inv_batch: config.max_tx_inv_batch,
            syntxinv_timeout: config.syntxinv_timeout,
        }
    }

    /// `PeerSubscribe(fork, childForks)` — creates fresh per-fork state for the
    /// parent fork and every declared child fork, idempotently.
    pub fn subscribe(&mut self, fork: ForkHash) -> &mut PeerForkState {
        self.forks.entry(fork).or_insert_with(|| {
            PeerForkState::new(
                PeerKnownTx::new(self.known_tx_config),
                self.min_tx_inv_batch,
                self.max_tx_inv_batch,
                self.syntxinv_timeout,
            )
        })
    }

    /// `PeerUnsubscribe(fork, childForks)` — drops fork state, including the
    /// arena-backed known-tx cache, simply by letting it go out of scope.
    pub fn unsubscribe(&mut self, fork: &ForkHash) {
        self.forks.remove(fork);
    }

    pub fn fork_state(&self, fork: &ForkHash) -> Option<&PeerForkState> {
        self.forks.get(fork)
    }

    pub fn fork_state_mut(&mut self, fork: &ForkHash) -> Option<&mut PeerForkState> {
        self.forks.get_mut(fork)
    }

    pub fn is_subscribed(&self, fork: &ForkHash) -> bool {
        self.forks.contains_key(fork)
    }

    pub fn subscribed_forks(&self) -> impl Iterator<Item = &ForkHash> {
        self.forks.keys()
    }
}
