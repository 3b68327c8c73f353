//! Per-fork inventory scheduler (component C3, spec §4.3).
//!
//! Owns one arena of [`InvEntry`] values plus the reverse indices (`orphan_prev`,
//! `tx_prev`, `ref_block_index`) needed to promote children once a parent resolves.
//! Exclusively owned by one [`crate::channel::NetChannel`]; never shared or made a
//! process-wide singleton (Design Note, spec §9).

use std::collections::{HashMap, HashSet};
use std::time::Instant;

use tracing::{debug, trace, warn};

use crate::config::ScheduleConfig;
use crate::contracts::Agreement;
use crate::inv::{InvEntry, InvIndex, InvKey, InvKind, InvState};
use crate::types::{BlockHash, ForkHash, FromAddr, PeerId};

/// Per-peer scheduling counters/cursors within one fork's schedule.
#[derive(Debug, Clone)]
pub struct PeerSchedState {
    pub in_flight_block: usize,
    pub in_flight_tx: usize,
    pub locator_depth: u64,
    pub locator_inv_block: Option<BlockHash>,
    pub next_getblocks_time: Instant,
}

impl PeerSchedState {
    fn new(now: Instant) -> Self {
        Self {
            in_flight_block: 0,
            in_flight_tx: 0,
            locator_depth: 0,
            locator_inv_block: None,
            next_getblocks_time: now,
        }
    }
}

/// Where a cached PoW block came from, for [`Schedule::get_submit_cache_pow_block`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOrigin {
    Remote,
    Local,
}

struct CachedPowBlock<B> {
    block: B,
    prev_hash: BlockHash,
    height: u64,
    wait_time: Instant,
    is_pow: bool,
    origin: CacheOrigin,
}

/// A block ready for application per [`Schedule::get_submit_cache_pow_block`].
pub struct SubmitCandidate<B> {
    pub hash: BlockHash,
    pub block: B,
    pub origin: CacheOrigin,
}

/// Filter for [`Schedule::get_submit_cache_pow_block`].
pub struct SubmitFilter {
    pub prev_hash: BlockHash,
    pub wait_until: Instant,
    pub is_pow: bool,
}

/// Result of [`Schedule::schedule_block_inv`] / [`Schedule::schedule_tx_inv`].
pub struct ScheduledInv {
    pub invs: Vec<InvKey>,
    /// Peer has announced blocks strictly ahead of our locator (blocks only).
    pub missing_prev: bool,
    /// Peer has no further scheduling work pending.
    pub empty_all: bool,
}

/// Per-fork inventory scheduler.
pub struct Schedule<B, Tx> {
    config: ScheduleConfig,
    is_primary: bool,

    arena: Vec<Option<InvEntry<B, Tx>>>,
    generations: Vec<u32>,
    free_slots: Vec<u32>,
    entries: HashMap<InvKey, InvIndex>,

    by_peer: HashMap<PeerId, PeerSchedState>,

    /// missing parent hash -> orphan blocks waiting on it
    orphan_prev: HashMap<BlockHash, Vec<InvIndex>>,
    /// (sender, nonce) -> txs waiting on that nonce's predecessor
    tx_prev: HashMap<(FromAddr, u64), Vec<InvIndex>>,

    pow_cache: HashMap<BlockHash, CachedPowBlock<B>>,
    local_pow_cache: HashMap<BlockHash, CachedPowBlock<B>>,

    delayed_clear: HashMap<InvKey, Instant>,

    /// primary-chain ref block -> subsidiary (fork, block) waiting on it
    ref_block_index: HashMap<BlockHash, Vec<(ForkHash, BlockHash)>>,

    /// contested parent hash -> first peer observed minting on top of it
    repeat_block: HashMap<BlockHash, PeerId>,
}

impl<B, Tx> Schedule<B, Tx> {
    pub fn new(config: ScheduleConfig, is_primary: bool) -> Self {
        Self {
            config,
            is_primary,
            arena: Vec::new(),
            generations: Vec::new(),
            free_slots: Vec::new(),
            entries: HashMap::new(),
            by_peer: HashMap::new(),
            orphan_prev: HashMap::new(),
            tx_prev: HashMap::new(),
            pow_cache: HashMap::new(),
            local_pow_cache: HashMap::new(),
            delayed_clear: HashMap::new(),
            ref_block_index: HashMap::new(),
            repeat_block: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    // ---- arena plumbing -------------------------------------------------

    fn alloc(&mut self, entry: InvEntry<B, Tx>) -> InvIndex {
        if let Some(slot) = self.free_slots.pop() {
            let generation = self.generations[slot as usize];
            self.arena[slot as usize] = Some(entry);
            InvIndex { slot, generation }
        } else {
            let slot = self.arena.len() as u32;
            self.arena.push(Some(entry));
            self.generations.push(0);
            InvIndex { slot, generation: 0 }
        }
    }

    fn get(&self, idx: InvIndex) -> Option<&InvEntry<B, Tx>> {
        if self.generations.get(idx.slot as usize).copied() != Some(idx.generation) {
            return None;
        }
        self.arena.get(idx.slot as usize)?.as_ref()
    }

    fn get_mut(&mut self, idx: InvIndex) -> Option<&mut InvEntry<B, Tx>> {
        if self.generations.get(idx.slot as usize).copied() != Some(idx.generation) {
            return None;
        }
        self.arena.get_mut(idx.slot as usize)?.as_mut()
    }

    fn free(&mut self, idx: InvIndex) -> Option<InvEntry<B, Tx>> {
        if self.generations.get(idx.slot as usize).copied() != Some(idx.generation) {
            return None;
        }
        let taken = self.arena.get_mut(idx.slot as usize)?.take();
        if taken.is_some() {
            self.generations[idx.slot as usize] = idx.generation.wrapping_add(1);
            self.free_slots.push(idx.slot);
        }
        taken
    }

    fn index_of(&self, key: &InvKey) -> Option<InvIndex> {
        self.entries.get(key).copied()
    }

    pub fn get_entry(&self, key: &InvKey) -> Option<&InvEntry<B, Tx>> {
        self.index_of(key).and_then(|idx| self.get(idx))
    }

    /// Takes the payload already received for `key` out of the arena, if any —
    /// e.g. an orphan child's block, parked in its `InvEntry` since the peer
    /// delivered it, before its parent had applied. Cheaper and more honest than
    /// re-querying [`crate::contracts::ChainEngine`] for a block it was never
    /// asked to store, since the entry is about to be removed anyway once the
    /// caller finishes applying it.
    pub fn take_block_payload(&mut self, key: &InvKey) -> Option<B> {
        let idx = self.index_of(key)?;
        let entry = self.get_mut(idx)?;
        entry.extra.as_block_mut()?.payload.take()
    }

    fn remove_entry(&mut self, key: &InvKey) -> Option<InvEntry<B, Tx>> {
        let idx = self.entries.remove(key)?;
        self.free(idx)
    }

    fn peer_sched(&mut self, peer: PeerId, now: Instant) -> &mut PeerSchedState {
        self.by_peer.entry(peer).or_insert_with(|| PeerSchedState::new(now))
    }

    // ---- §4.3 operations --------------------------------------------------

    /// `AddNewInv(inv, peer)` — registers `peer` as a holder of `inv`. Idempotent.
    pub fn add_new_inv(&mut self, key: InvKey, peer: PeerId) -> bool {
        let cap = match key.kind {
            InvKind::Block => self.config.max_peer_block_inv_count,
            InvKind::Tx => self.config.max_peer_tx_inv_count,
        };
        let per_peer_count = self
            .entries
            .keys()
            .filter(|k| k.kind == key.kind)
            .filter(|k| {
                self.get_entry(k)
                    .is_some_and(|e| e.known_peers.contains(&peer))
            })
            .count();
        if let Some(idx) = self.index_of(&key) {
            if let Some(entry) = self.get_mut(idx) {
                entry.known_peers.insert(peer);
            }
            return true;
        }
        if per_peer_count >= cap {
            warn!(%peer, kind = ?key.kind, "peer exceeded per-kind inv capacity, dropping announcement");
            return false;
        }
        trace!(%peer, kind = ?key.kind, hash = ?key.hash, "new inv registered");
        let entry = match key.kind {
            InvKind::Block => InvEntry::new_block(key),
            InvKind::Tx => InvEntry::new_tx(key),
        };
        let idx = self.alloc(entry);
        if let Some(entry) = self.get_mut(idx) {
            entry.known_peers.insert(peer);
        }
        self.entries.insert(key, idx);
        true
    }

    fn clear_expired(&mut self, now: Instant) {
        let expired: Vec<InvKey> = self
            .delayed_clear
            .iter()
            .filter(|(_, expiry)| **expiry <= now)
            .map(|(key, _)| *key)
            .collect();
        for key in expired {
            self.delayed_clear.remove(&key);
            if let Some(idx) = self.index_of(&key) {
                if let Some(entry) = self.get_mut(idx) {
                    if entry.state == InvState::Delayed {
                        entry.state = InvState::Announced;
                    }
                }
            }
        }
    }

    /// `ScheduleBlockInv(peer, budget)` — spec §4.3 peer-request-assignment
    /// algorithm, preferring non-orphan candidates.
    pub fn schedule_block_inv(&mut self, peer: PeerId, budget: usize, now: Instant) -> ScheduledInv {
        self.clear_expired(now);
        let req_timeout = self.config.req_timeout;
        let mut candidates: Vec<InvKey> = Vec::new();
        let mut missing_prev = false;
        let mut any_pending = false;

        let keys: Vec<InvKey> = self.entries.keys().copied().collect();
        // Prefer entries whose parent is already known locally (non-orphan) so we
        // do not inflate orphan chains; entries are otherwise visited in a stable
        // (insertion-independent) hash order, which is fine since this is a
        // best-effort scheduling pass, not a consensus-relevant ordering.
        let mut non_orphan = Vec::new();
        let mut orphan = Vec::new();
        for key in keys {
            if key.kind != InvKind::Block {
                continue;
            }
            let Some(idx) = self.index_of(&key) else {
                continue;
            };
            let Some(entry) = self.get(idx) else { continue };
            if !entry.known_peers.contains(&peer) {
                continue;
            }
            if entry.state == InvState::Delayed {
                any_pending = true;
                continue;
            }
            if !entry.is_assignable(now) {
                if entry.assigned_peer.is_some() {
                    any_pending = true;
                }
                continue;
            }
            any_pending = true;
            let is_orphan = entry
                .extra
                .as_block()
                .map(|b| b.prev_hash.is_some())
                .unwrap_or(false);
            if is_orphan {
                missing_prev = true;
                orphan.push(key);
            } else {
                non_orphan.push(key);
            }
        }
        non_orphan.extend(orphan);

        for key in non_orphan {
            if candidates.len() >= budget {
                break;
            }
            let Some(idx) = self.index_of(&key) else { continue };
            if let Some(entry) = self.get_mut(idx) {
                entry.state = InvState::Requested;
                entry.assigned_peer = Some(peer);
                entry.request_expiry = Some(now + req_timeout);
                candidates.push(key);
            }
        }

        let sched = self.peer_sched(peer, now);
        sched.in_flight_block += candidates.len();

        ScheduledInv {
            invs: candidates,
            missing_prev,
            empty_all: !any_pending,
        }
    }

    /// `ScheduleTxInv(peer, budget)` — analogous to [`Self::schedule_block_inv`] for
    /// transactions; `all_received` signals every tx this peer announced has a
    /// payload, used to drive `TXINV_COMPLETE`.
    pub fn schedule_tx_inv(&mut self, peer: PeerId, budget: usize, now: Instant) -> ScheduledInv {
        self.clear_expired(now);
        let req_timeout = self.config.req_timeout;
        let mut candidates = Vec::new();
        let mut all_received = true;
        let mut any_pending = false;

        let keys: Vec<InvKey> = self.entries.keys().copied().collect();
        for key in keys {
            if key.kind != InvKind::Tx {
                continue;
            }
            let Some(idx) = self.index_of(&key) else { continue };
            let Some(entry) = self.get(idx) else { continue };
            if !entry.known_peers.contains(&peer) {
                continue;
            }
            if entry.state != InvState::Received && entry.state != InvState::Verified {
                all_received = false;
            }
            if entry.state == InvState::Delayed {
                any_pending = true;
                continue;
            }
            if !entry.is_assignable(now) {
                if entry.assigned_peer.is_some() {
                    any_pending = true;
                }
                continue;
            }
            any_pending = true;
            if candidates.len() < budget {
                candidates.push(key);
            }
        }

        for key in &candidates {
            let Some(idx) = self.index_of(key) else { continue };
            if let Some(entry) = self.get_mut(idx) {
                entry.state = InvState::Requested;
                entry.assigned_peer = Some(peer);
                entry.request_expiry = Some(now + req_timeout);
            }
        }

        let sched = self.peer_sched(peer, now);
        sched.in_flight_tx += candidates.len();

        ScheduledInv {
            invs: candidates,
            missing_prev: false,
            empty_all: !any_pending,
        }
    }

    /// `ReceiveBlock(peer, hash, block)` — matches against a `Requested` entry. On
    /// success, returns the set of peers to notify for scheduling successors.
    pub fn receive_block(
        &mut self,
        peer: PeerId,
        hash: BlockHash,
        block: B,
    ) -> Option<HashSet<PeerId>> {
        let key = InvKey::block(hash);
        let idx = self.index_of(&key)?;
        let entry = self.get_mut(idx)?;
        if entry.state != InvState::Requested || entry.assigned_peer != Some(peer) {
            return None;
        }
        entry.state = InvState::Received;
        entry.assigned_peer = None;
        entry.request_expiry = None;
        if let Some(extra) = entry.extra.as_block_mut() {
            extra.payload = Some(block);
        }
        Some(entry.known_peers.clone())
    }

    /// `ReceiveTx(peer, txid, tx)` — analogous to [`Self::receive_block`].
    pub fn receive_tx(
        &mut self,
        peer: PeerId,
        txid: crate::types::TxId,
        tx: Tx,
    ) -> Option<HashSet<PeerId>> {
        let key = InvKey::tx(txid);
        let idx = self.index_of(&key)?;
        let entry = self.get_mut(idx)?;
        if entry.state != InvState::Requested || entry.assigned_peer != Some(peer) {
            return None;
        }
        entry.state = InvState::Received;
        entry.assigned_peer = None;
        entry.request_expiry = None;
        if let Some(extra) = entry.extra.as_tx_mut() {
            extra.payload = Some(tx);
        }
        Some(entry.known_peers.clone())
    }

    /// `CancelAssignedInv(peer, inv)` — on `GetFail`, free the assignment.
    pub fn cancel_assigned_inv(&mut self, peer: PeerId, key: InvKey) {
        if let Some(idx) = self.index_of(&key) {
            if let Some(entry) = self.get_mut(idx) {
                if entry.assigned_peer == Some(peer) {
                    entry.assigned_peer = None;
                    entry.request_expiry = None;
                    entry.state = InvState::Announced;
                }
            }
        }
        if let Some(sched) = self.by_peer.get_mut(&peer) {
            match key.kind {
                InvKind::Block => sched.in_flight_block = sched.in_flight_block.saturating_sub(1),
                InvKind::Tx => sched.in_flight_tx = sched.in_flight_tx.saturating_sub(1),
            }
        }
    }

    /// `RemovePeer(peer)` — drops all assignments/known_peers entries for `peer`;
    /// returns peers that had co-assignments to the same items (to reschedule).
    pub fn remove_peer(&mut self, peer: PeerId) -> HashSet<PeerId> {
        let mut reschedule = HashSet::new();
        let keys: Vec<InvKey> = self.entries.keys().copied().collect();
        for key in keys {
            let Some(idx) = self.index_of(&key) else { continue };
            let mut drop_entry = false;
            if let Some(entry) = self.get_mut(idx) {
                entry.known_peers.remove(&peer);
                if entry.assigned_peer == Some(peer) {
                    entry.assigned_peer = None;
                    entry.request_expiry = None;
                    entry.state = InvState::Announced;
                }
                reschedule.extend(entry.known_peers.iter().copied());
                drop_entry = entry.known_peers.is_empty() && !entry.extra.has_payload();
            }
            if drop_entry {
                self.remove_entry(&key);
            }
        }
        self.by_peer.remove(&peer);
        reschedule.remove(&peer);
        debug!(%peer, rescheduled = reschedule.len(), "peer removed from schedule");
        reschedule
    }

    /// `AddOrphanBlockPrev(child, missing_prev)`.
    pub fn add_orphan_block_prev(&mut self, child: InvKey, missing_prev: BlockHash) {
        if let Some(idx) = self.index_of(&child) {
            if let Some(entry) = self.get_mut(idx) {
                if let Some(extra) = entry.extra.as_block_mut() {
                    extra.prev_hash = Some(missing_prev);
                }
            }
            self.orphan_prev.entry(missing_prev).or_default().push(idx);
        }
    }

    /// `AddOrphanTxPrev(child, from, nonce)`.
    pub fn add_orphan_tx_prev(&mut self, child: InvKey, from: FromAddr, nonce: u64) {
        if let Some(idx) = self.index_of(&child) {
            if let Some(entry) = self.get_mut(idx) {
                if let Some(extra) = entry.extra.as_tx_mut() {
                    extra.from_addr = Some(from);
                    extra.nonce = Some(nonce);
                }
            }
            self.tx_prev.entry((from, nonce)).or_default().push(idx);
        }
    }

    /// `GetNextBlock(hash)` — promotes children once `hash` resolves.
    pub fn get_next_block(&mut self, hash: BlockHash) -> Vec<InvKey> {
        let Some(children) = self.orphan_prev.remove(&hash) else {
            return Vec::new();
        };
        children
            .into_iter()
            .filter_map(|idx| self.get(idx).map(|e| e.key))
            .collect()
    }

    /// `GetNextTx(from, nonce)` — promotes the tx chained on `(from, nonce)`.
    pub fn get_next_tx(&mut self, from: FromAddr, nonce: u64) -> Option<InvKey> {
        let children = self.tx_prev.remove(&(from, nonce))?;
        children.into_iter().find_map(|idx| self.get(idx).map(|e| e.key))
    }

    /// `SetDelayedClear(inv, expiry)` — holds an inv off the scheduler.
    pub fn set_delayed_clear(&mut self, key: InvKey, expiry: Instant) {
        if let Some(idx) = self.index_of(&key) {
            if let Some(entry) = self.get_mut(idx) {
                entry.state = InvState::Delayed;
            }
        }
        self.delayed_clear.insert(key, expiry);
    }

    /// Removes an inv entirely (e.g. already-have, or a hard validation error that
    /// should not keep retrying).
    pub fn remove_inv(&mut self, key: &InvKey) {
        self.remove_entry(key);
        self.delayed_clear.remove(key);
    }

    pub fn mark_verified(&mut self, key: &InvKey) {
        if let Some(idx) = self.index_of(key) {
            if let Some(entry) = self.get_mut(idx) {
                entry.state = InvState::Verified;
            }
        }
    }

    // ---- PoW cache (primary fork only) ------------------------------------

    /// Caches a verified remote PoW block pending consensus. Returns whether this
    /// is the first block cached at `height` — the caller only re-broadcasts the
    /// inv for the first one, per the original's `fFirst` out-param on
    /// `AddCacheLocalPowBlock`/`GetFirstCachePowBlock`.
    pub fn add_cache_remote_pow_block(
        &mut self,
        hash: BlockHash,
        block: B,
        prev_hash: BlockHash,
        height: u64,
        is_pow: bool,
        now: Instant,
    ) -> bool {
        debug_assert!(self.is_primary, "PoW cache is only meaningful on the primary fork");
        let is_first = !self.pow_cache.values().any(|c| c.height == height)
            && !self.local_pow_cache.values().any(|c| c.height == height);
        self.pow_cache.insert(
            hash,
            CachedPowBlock {
                block,
                prev_hash,
                height,
                wait_time: now,
                is_pow,
                origin: CacheOrigin::Remote,
            },
        );
        is_first
    }

    pub fn add_cache_local_pow_block(&mut self, hash: BlockHash, block: B, prev_hash: BlockHash, height: u64, now: Instant) {
        self.local_pow_cache.insert(
            hash,
            CachedPowBlock {
                block,
                prev_hash,
                height,
                wait_time: now,
                is_pow: true,
                origin: CacheOrigin::Local,
            },
        );
    }

    pub fn check_cache_local_pow_block(&self, height_hint: &BlockHash) -> bool {
        self.local_pow_cache.contains_key(height_hint)
    }

    /// Non-destructive lookup for serving a `GetData` request out of either cache,
    /// unlike [`Schedule::get_submit_cache_pow_block`] which drains entries as it
    /// hands them to the dispatcher.
    pub fn peek_cached_pow_block(&self, hash: &BlockHash) -> Option<&B> {
        self.local_pow_cache
            .get(hash)
            .or_else(|| self.pow_cache.get(hash))
            .map(|c| &c.block)
    }

    /// `GetSubmitCachePowBlock(consParam)` — filters cached blocks by
    /// `{prev_hash, wait_time, is_pow}` and returns those now eligible to apply.
    pub fn get_submit_cache_pow_block(&mut self, filter: &SubmitFilter, agreement: Agreement) -> Vec<SubmitCandidate<B>> {
        if agreement != Agreement::Accepted {
            return Vec::new();
        }
        let mut out = Vec::new();
        let remote: Vec<BlockHash> = self
            .pow_cache
            .iter()
            .filter(|(_, c)| {
                c.prev_hash == filter.prev_hash && c.wait_time <= filter.wait_until && c.is_pow == filter.is_pow
            })
            .map(|(hash, _)| *hash)
            .collect();
        for hash in remote {
            if let Some(cached) = self.pow_cache.remove(&hash) {
                out.push(SubmitCandidate {
                    hash,
                    block: cached.block,
                    origin: cached.origin,
                });
            }
        }
        let local: Vec<BlockHash> = self
            .local_pow_cache
            .iter()
            .filter(|(_, c)| c.prev_hash == filter.prev_hash && c.wait_time <= filter.wait_until)
            .map(|(hash, _)| *hash)
            .collect();
        for hash in local {
            if let Some(cached) = self.local_pow_cache.remove(&hash) {
                out.push(SubmitCandidate {
                    hash,
                    block: cached.block,
                    origin: cached.origin,
                });
            }
        }
        out
    }

    // ---- cross-fork ref-block dependency -----------------------------------

    /// `AddRefBlock(ref_hash, child_fork, child_block)`.
    pub fn add_ref_block(&mut self, ref_hash: BlockHash, child_fork: ForkHash, child_block: BlockHash) {
        self.ref_block_index
            .entry(ref_hash)
            .or_default()
            .push((child_fork, child_block));
    }

    /// `GetNextRefBlock(ref_hash)` — unlocks subsidiary children once the primary
    /// ref block arrives.
    pub fn get_next_ref_block(&mut self, ref_hash: BlockHash) -> Vec<(ForkHash, BlockHash)> {
        self.ref_block_index.remove(&ref_hash).unwrap_or_default()
    }

    // ---- repeat-mint conflict ----------------------------------------------

    /// `SetRepeatBlock(peer, prevHash)` — records the first peer observed minting on
    /// top of `prev_hash`; returns true iff `peer` is that first observer. Keyed by
    /// the contested *parent*, not the competing block's own hash, so that two
    /// distinct peers delivering two distinct blocks for the same slot still collide
    /// on the same key.
    pub fn set_repeat_block(&mut self, peer: PeerId, prev_hash: BlockHash) -> bool {
        match self.repeat_block.get(&prev_hash) {
            Some(first) if *first == peer => true,
            Some(_) => false,
            None => {
                self.repeat_block.insert(prev_hash, peer);
                true
            }
        }
    }

    /// Locator progression helper for `DispatchGetBlocks` (spec §4.3).
    pub fn advance_locator(&mut self, peer: PeerId, now: Instant) -> &mut PeerSchedState {
        self.peer_sched(peer, now)
    }

    pub fn peer_sched_state(&self, peer: PeerId) -> Option<&PeerSchedState> {
        self.by_peer.get(&peer)
    }
}

impl<B, Tx> Schedule<B, Tx> {
    /// Diagnostic helper used by tests to assert invariant I2/I3 hold.
    #[cfg(test)]
    pub fn assert_invariants(&self) {
        for (key, idx) in &self.entries {
            let Some(entry) = self.get(*idx) else {
                panic!("dangling index for {key:?}");
            };
            if let Some(assigned) = entry.assigned_peer {
                assert!(
                    entry.known_peers.contains(&assigned),
                    "I3 violated: assigned peer not in known_peers for {key:?}"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ScheduleConfig;
    use crate::types::BlockHash;
    use ethereum_types::H256;

    type TestSchedule = Schedule<u64, u64>;

    fn peer(n: u64) -> PeerId {
        PeerId(H256::from_low_u64_be(n))
    }

    fn block_hash(n: u64) -> BlockHash {
        BlockHash(H256::from_low_u64_be(n))
    }

    fn new_schedule() -> TestSchedule {
        Schedule::new(ScheduleConfig::default(), true)
    }

    #[test]
    fn add_new_inv_is_idempotent_per_peer() {
        let mut sched = new_schedule();
        let key = InvKey::block(block_hash(1));
        assert!(sched.add_new_inv(key, peer(1)));
        assert!(sched.add_new_inv(key, peer(1)));
        assert_eq!(sched.len(), 1);
        sched.assert_invariants();
    }

    #[test]
    fn schedule_block_inv_assigns_only_to_known_peer() {
        let mut sched = new_schedule();
        let key = InvKey::block(block_hash(1));
        sched.add_new_inv(key, peer(1));
        let now = Instant::now();

        let scheduled_other = sched.schedule_block_inv(peer(2), 10, now);
        assert!(scheduled_other.invs.is_empty());

        let scheduled = sched.schedule_block_inv(peer(1), 10, now);
        assert_eq!(scheduled.invs, vec![key]);
        sched.assert_invariants();
    }

    #[test]
    fn receive_block_requires_matching_assignment() {
        let mut sched = new_schedule();
        let key = InvKey::block(block_hash(1));
        sched.add_new_inv(key, peer(1));
        let now = Instant::now();
        sched.schedule_block_inv(peer(1), 10, now);

        // A different peer answering the same inv is rejected (I3: only the
        // assigned peer's response resolves a Requested entry).
        assert!(sched.receive_block(peer(2), block_hash(1), 42).is_none());

        let notify = sched.receive_block(peer(1), block_hash(1), 42).unwrap();
        assert!(notify.contains(&peer(1)));
        assert_eq!(
            sched.get_entry(&key).unwrap().extra.as_block().unwrap().payload,
            Some(42)
        );
    }

    #[test]
    fn expired_request_is_reassignable() {
        let mut sched = new_schedule();
        sched.config.req_timeout = Duration::from_millis(0);
        let key = InvKey::block(block_hash(1));
        sched.add_new_inv(key, peer(1));
        let now = Instant::now();
        let first = sched.schedule_block_inv(peer(1), 10, now);
        assert_eq!(first.invs, vec![key]);

        let later = now + Duration::from_millis(1);
        let second = sched.schedule_block_inv(peer(1), 10, later);
        assert_eq!(
            second.invs,
            vec![key],
            "I2: a timed-out Requested entry must become reassignable"
        );
    }

    #[test]
    fn remove_peer_frees_assignment_and_signals_reschedule() {
        let mut sched = new_schedule();
        let key = InvKey::block(block_hash(1));
        sched.add_new_inv(key, peer(1));
        sched.add_new_inv(key, peer(2));
        let now = Instant::now();
        sched.schedule_block_inv(peer(1), 10, now);

        let reschedule = sched.remove_peer(peer(1));
        assert!(reschedule.contains(&peer(2)));
        let entry = sched.get_entry(&key).unwrap();
        assert_eq!(entry.assigned_peer, None);
        assert_eq!(entry.state, InvState::Announced);
    }

    #[test]
    fn remove_peer_drops_payloadless_orphaned_entry() {
        let mut sched = new_schedule();
        let key = InvKey::block(block_hash(1));
        sched.add_new_inv(key, peer(1));
        sched.remove_peer(peer(1));
        assert!(sched.get_entry(&key).is_none());
    }

    #[test]
    fn orphan_prev_unlocks_child_once_parent_resolves() {
        let mut sched = new_schedule();
        let child = InvKey::block(block_hash(2));
        sched.add_new_inv(child, peer(1));
        sched.add_orphan_block_prev(child, block_hash(1));

        assert!(sched.get_next_block(block_hash(9)).is_empty());
        let unlocked = sched.get_next_block(block_hash(1));
        assert_eq!(unlocked, vec![child]);
        // Consumed: a second resolution of the same parent yields nothing new.
        assert!(sched.get_next_block(block_hash(1)).is_empty());
    }

    #[test]
    fn ref_block_index_unlocks_subsidiary_children() {
        let mut sched = new_schedule();
        let fork = ForkHash(H256::from_low_u64_be(7));
        let child_block = block_hash(2);
        sched.add_ref_block(block_hash(1), fork, child_block);

        assert!(sched.get_next_ref_block(block_hash(9)).is_empty());
        let unlocked = sched.get_next_ref_block(block_hash(1));
        assert_eq!(unlocked, vec![(fork, child_block)]);
    }

    #[test]
    fn repeat_block_only_credits_first_observer() {
        let mut sched = new_schedule();
        let hash = block_hash(1);
        assert!(sched.set_repeat_block(peer(1), hash));
        assert!(!sched.set_repeat_block(peer(2), hash));
        assert!(sched.set_repeat_block(peer(1), hash));
    }

    #[test]
    fn cancel_assigned_inv_returns_entry_to_announced() {
        let mut sched = new_schedule();
        let key = InvKey::block(block_hash(1));
        sched.add_new_inv(key, peer(1));
        let now = Instant::now();
        sched.schedule_block_inv(peer(1), 10, now);

        sched.cancel_assigned_inv(peer(1), key);
        let entry = sched.get_entry(&key).unwrap();
        assert_eq!(entry.state, InvState::Announced);
        assert_eq!(entry.assigned_peer, None);
    }
}
