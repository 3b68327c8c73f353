//! Integration scenarios driving a full [`NetChannel`] through its public
//! [`InboundEvent`]/control-surface API against in-memory mock collaborators.
//! Each mock is backed by one shared [`World`] so `ChainEngine`, `TxPool` and
//! `Dispatcher` observe a single consistent view, the way a real node's
//! `Blockchain`/`Store`/mempool would.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use async_trait::async_trait;
use ethereum_types::{H160, H256};

use netsync_p2p::{
    Agreement, BlockHash, BlockMeta, ChainEngine, CloseReason, ConsensusOracle, Dispatcher, Errno,
    ForkHash, FromAddr, InboundEvent, InvKey, MsgReqType, MsgRspResult, NetChannel,
    NetChannelConfig, OutboundEvent, PeerId, PeerTransport, TxId, TxMeta, TxPool,
};

// ---- identifier helpers -----------------------------------------------------

fn h256(n: u64) -> H256 {
    H256::from_low_u64_be(n)
}

fn fork(n: u64) -> ForkHash {
    ForkHash(h256(n))
}

fn peer(n: u64) -> PeerId {
    PeerId(h256(n))
}

fn block_hash(n: u64) -> BlockHash {
    BlockHash(h256(n))
}

fn tx_id(n: u64) -> TxId {
    TxId(h256(n))
}

fn from_addr(n: u64) -> FromAddr {
    FromAddr(H160::from_low_u64_be(n))
}

// ---- payload types -----------------------------------------------------------

#[derive(Debug, Clone)]
struct TestBlock {
    hash: BlockHash,
    prev_hash: BlockHash,
    height: u64,
    ref_block: Option<BlockHash>,
    is_vacant: bool,
    null_mint_dest: bool,
    included_txs: Vec<(TxId, FromAddr, u64)>,
}

impl TestBlock {
    fn chain(n: u64, prev: u64, height: u64) -> Self {
        Self {
            hash: block_hash(n),
            prev_hash: block_hash(prev),
            height,
            ref_block: None,
            is_vacant: false,
            null_mint_dest: true,
            included_txs: Vec::new(),
        }
    }
}

impl BlockMeta for TestBlock {
    fn hash(&self) -> BlockHash {
        self.hash
    }
    fn prev_hash(&self) -> BlockHash {
        self.prev_hash
    }
    fn height(&self) -> u64 {
        self.height
    }
    fn ref_block(&self) -> Option<BlockHash> {
        self.ref_block
    }
    fn is_vacant(&self) -> bool {
        self.is_vacant
    }
    fn has_null_mint_dest(&self) -> bool {
        self.null_mint_dest
    }
    fn included_txs(&self) -> Vec<(TxId, FromAddr, u64)> {
        self.included_txs.clone()
    }
}

#[derive(Debug, Clone)]
struct TestTx {
    txid: TxId,
    from: FromAddr,
    nonce: u64,
}

impl TxMeta for TestTx {
    fn txid(&self) -> TxId {
        self.txid
    }
    fn from_addr(&self) -> FromAddr {
        self.from
    }
    fn nonce(&self) -> u64 {
        self.nonce
    }
    fn is_cert_tx(&self) -> bool {
        false
    }
    fn is_reward_tx(&self) -> bool {
        false
    }
}

// ---- shared mock world --------------------------------------------------------

#[derive(Default)]
struct WorldState {
    applied_blocks: HashMap<(ForkHash, BlockHash), TestBlock>,
    apply_order: Vec<(ForkHash, BlockHash)>,
    heights: HashMap<ForkHash, u64>,
    applied_tx: HashMap<TxId, TestTx>,
    repeat_candidates: HashSet<(ForkHash, BlockHash)>,
    agreement: Option<Agreement>,
}

struct World {
    state: Mutex<WorldState>,
}

impl World {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(WorldState::default()),
        })
    }

    /// Seeds an existing tip at `block_hash(0)` for `fork`, so a block whose
    /// `prev_hash` is `block_hash(0)` is never treated as an orphan.
    fn seed_tip(&self, fork: ForkHash) {
        let mut st = self.state.lock().unwrap();
        st.applied_blocks.insert(
            (fork, block_hash(0)),
            TestBlock::chain(0, 0, 0),
        );
        st.heights.insert(fork, 0);
    }

    fn mark_repeat_candidate(&self, fork: ForkHash, hash: BlockHash) {
        self.state.lock().unwrap().repeat_candidates.insert((fork, hash));
    }

    fn applied(&self, fork: ForkHash, hash: BlockHash) -> bool {
        self.state.lock().unwrap().applied_blocks.contains_key(&(fork, hash))
    }

    fn apply_order(&self) -> Vec<(ForkHash, BlockHash)> {
        self.state.lock().unwrap().apply_order.clone()
    }

    fn applied_tx_count(&self) -> usize {
        self.state.lock().unwrap().applied_tx.len()
    }

    fn set_agreement(&self, agreement: Agreement) {
        self.state.lock().unwrap().agreement = Some(agreement);
    }
}

struct MockChain(Arc<World>);
struct MockPool(Arc<World>);
struct MockDispatcher(Arc<World>);
struct MockOracle(Arc<World>);

#[async_trait]
impl ChainEngine<TestBlock> for MockChain {
    async fn get_last_block_status(&self, _fork: ForkHash) -> Option<(u64, BlockHash)> {
        None
    }
    async fn get_block_location(&self, _hash: BlockHash) -> Option<ForkHash> {
        None
    }
    async fn exists(&self, fork: ForkHash, hash: BlockHash) -> bool {
        self.0.applied(fork, hash)
    }
    async fn get_block(&self, fork: ForkHash, hash: BlockHash) -> Option<TestBlock> {
        self.0.state.lock().unwrap().applied_blocks.get(&(fork, hash)).cloned()
    }
    async fn get_block_inv(&self, _fork: ForkHash, _locator: &[H256], _max: usize) -> Option<Vec<BlockHash>> {
        Some(Vec::new())
    }
    async fn get_block_locator(&self, _fork: ForkHash, _depth: u64, _max: usize) -> Option<Vec<H256>> {
        Some(Vec::new())
    }
    async fn get_fork_storage_max_height(&self, fork: ForkHash) -> u64 {
        *self.0.state.lock().unwrap().heights.get(&fork).unwrap_or(&0)
    }
    async fn verify_pow_block(&self, _fork: ForkHash, _hash: BlockHash) -> bool {
        true
    }
    async fn verify_checkpoint(&self, _fork: ForkHash, _height: u64, _hash: BlockHash) -> bool {
        true
    }
    async fn verify_repeat_block(&self, fork: ForkHash, hash: BlockHash) -> bool {
        self.0.state.lock().unwrap().repeat_candidates.contains(&(fork, hash))
    }
    async fn is_vacant_block_before_created_fork_height(&self, _fork: ForkHash, _height: u64) -> bool {
        false
    }
    async fn list_fork_context(&self) -> Vec<ForkHash> {
        self.0.state.lock().unwrap().heights.keys().copied().collect()
    }
    async fn exists_tx(&self, txid: TxId) -> bool {
        self.0.state.lock().unwrap().applied_tx.contains_key(&txid)
    }
}

#[async_trait]
impl TxPool<TestTx> for MockPool {
    async fn exists(&self, txid: TxId) -> bool {
        self.0.state.lock().unwrap().applied_tx.contains_key(&txid)
    }
    async fn get(&self, txid: TxId) -> Option<TestTx> {
        self.0.state.lock().unwrap().applied_tx.get(&txid).cloned()
    }
    async fn list_tx(&self, _fork: ForkHash) -> Vec<TxId> {
        self.0.state.lock().unwrap().applied_tx.keys().copied().collect()
    }
    async fn check_tx_nonce(&self, _from: FromAddr, _nonce: u64) -> bool {
        true
    }
    async fn get_dest_next_tx_nonce(&self, _from: FromAddr) -> Option<u64> {
        None
    }
    async fn pool_size(&self, _fork: ForkHash) -> usize {
        self.0.state.lock().unwrap().applied_tx.len()
    }
}

#[async_trait]
impl Dispatcher<TestBlock, TestTx> for MockDispatcher {
    async fn add_new_block(&self, fork: ForkHash, block: TestBlock, _peer: PeerId) -> Errno {
        let mut st = self.0.state.lock().unwrap();
        let key = (fork, block.hash);
        if st.applied_blocks.contains_key(&key) {
            return Errno::ErrAlreadyHave;
        }
        let height = block.height;
        st.apply_order.push(key);
        st.applied_blocks.insert(key, block);
        let entry = st.heights.entry(fork).or_insert(0);
        *entry = (*entry).max(height);
        Errno::Ok
    }
    async fn add_new_tx(&self, _fork: ForkHash, tx: TestTx, _peer: PeerId) -> Errno {
        let mut st = self.0.state.lock().unwrap();
        if st.applied_tx.contains_key(&tx.txid) {
            return Errno::ErrAlreadyHave;
        }
        st.applied_tx.insert(tx.txid, tx);
        Errno::Ok
    }
}

#[async_trait]
impl ConsensusOracle for MockOracle {
    async fn get_next_consensus(&self) -> Option<BlockHash> {
        None
    }
    async fn get_agreement(&self, _height: u64) -> Agreement {
        // Defaults to Accepted so scenarios that aren't exercising the PoW-cache
        // gating itself see ordinary straight-through block application.
        self.0.state.lock().unwrap().agreement.unwrap_or(Agreement::Accepted)
    }
}

struct MockTransport {
    log: Mutex<Vec<OutboundEvent<TestBlock, TestTx>>>,
}

impl MockTransport {
    fn new() -> Arc<Self> {
        Arc::new(Self { log: Mutex::new(Vec::new()) })
    }

    fn events(&self) -> Vec<OutboundEvent<TestBlock, TestTx>> {
        self.log.lock().unwrap().clone()
    }

    fn get_data_invs(&self, peer: PeerId) -> Vec<Vec<InvKey>> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                OutboundEvent::PeerGetData { peer: p, invs, .. } if p == peer => Some(invs),
                _ => None,
            })
            .collect()
    }

    fn close_count(&self, peer: PeerId, reason: CloseReason) -> usize {
        self.events()
            .into_iter()
            .filter(|e| matches!(e, OutboundEvent::PeerNetClose { peer: p, reason: r } if *p == peer && *r == reason))
            .count()
    }
}

#[async_trait]
impl PeerTransport<TestBlock, TestTx> for MockTransport {
    async fn dispatch_event(&self, event: OutboundEvent<TestBlock, TestTx>) {
        self.log.lock().unwrap().push(event);
    }
}

fn new_harness(genesis: ForkHash) -> (Arc<NetChannel<TestBlock, TestTx>>, Arc<World>, Arc<MockTransport>) {
    let world = World::new();
    let transport = MockTransport::new();
    let config = NetChannelConfig {
        testnet: true,
        ..NetChannelConfig::default()
    };
    let channel = NetChannel::new(
        config,
        genesis,
        Arc::new(MockChain(world.clone())),
        Arc::new(MockPool(world.clone())),
        Arc::new(MockDispatcher(world.clone())),
        Arc::new(MockOracle(world.clone())),
        transport.clone(),
    );
    (channel, world, transport)
}

// ---- S1: happy-path sequential sync -------------------------------------------

#[tokio::test]
async fn s1_sequential_blocks_apply_in_order_and_peer_settles_synchronized() {
    let genesis = fork(1);
    let (channel, world, _transport) = new_harness(genesis);
    world.seed_tip(genesis);

    let p = peer(1);
    channel
        .handle_inbound(InboundEvent::PeerActive { peer: p, node_network: true })
        .await
        .unwrap();

    for i in 1..=10u64 {
        let block = TestBlock::chain(i, i - 1, i);
        channel
            .handle_inbound(InboundEvent::PeerInv {
                peer: p,
                fork: genesis,
                invs: vec![InvKey::block(block.hash)],
            })
            .await
            .unwrap();
        channel
            .handle_inbound(InboundEvent::PeerBlock { peer: p, fork: genesis, block })
            .await
            .unwrap();
        assert!(world.applied(genesis, block_hash(i)), "block {i} did not apply in order");
    }

    let order: Vec<u64> = world
        .apply_order()
        .into_iter()
        .map(|(_, h)| {
            (1..=10)
                .find(|i| block_hash(*i) == h)
                .expect("applied block must be one of the ten seeded")
        })
        .collect();
    assert_eq!(order, (1..=10).collect::<Vec<_>>());

    channel
        .handle_inbound(InboundEvent::PeerMsgRsp {
            peer: p,
            fork: genesis,
            req_type: MsgReqType::GetBlocks,
            result: MsgRspResult::Empty,
        })
        .await
        .unwrap();
    assert!(channel.is_fork_synchronized(genesis).await);
}

// ---- S2: orphan reassembly ------------------------------------------------------

#[tokio::test]
async fn s2_orphan_child_applies_as_soon_as_its_parent_does() {
    let genesis = fork(1);
    let (channel, world, _transport) = new_harness(genesis);
    world.seed_tip(genesis);

    let peer_a = peer(1);
    let peer_b = peer(2);
    channel
        .handle_inbound(InboundEvent::PeerActive { peer: peer_a, node_network: true })
        .await
        .unwrap();
    channel
        .handle_inbound(InboundEvent::PeerActive { peer: peer_b, node_network: true })
        .await
        .unwrap();

    let b10 = TestBlock::chain(10, 9, 10);
    channel
        .handle_inbound(InboundEvent::PeerInv {
            peer: peer_a,
            fork: genesis,
            invs: vec![InvKey::block(b10.hash)],
        })
        .await
        .unwrap();
    channel
        .handle_inbound(InboundEvent::PeerBlock {
            peer: peer_a,
            fork: genesis,
            block: b10,
        })
        .await
        .unwrap();
    assert!(!world.applied(genesis, block_hash(10)), "B10 must stay parked without its parent");
    assert!(!world.applied(genesis, block_hash(9)));

    let b9 = TestBlock::chain(9, 0, 9);
    channel
        .handle_inbound(InboundEvent::PeerInv {
            peer: peer_b,
            fork: genesis,
            invs: vec![InvKey::block(b9.hash)],
        })
        .await
        .unwrap();
    channel
        .handle_inbound(InboundEvent::PeerBlock {
            peer: peer_b,
            fork: genesis,
            block: b9,
        })
        .await
        .unwrap();

    assert!(world.applied(genesis, block_hash(9)), "B9 should apply immediately, its parent is the known tip");
    assert!(world.applied(genesis, block_hash(10)), "B10 should unlock and apply in the same call that applied B9");

    let order = world.apply_order();
    let pos9 = order.iter().position(|(_, h)| *h == block_hash(9)).unwrap();
    let pos10 = order.iter().position(|(_, h)| *h == block_hash(10)).unwrap();
    assert!(pos9 < pos10, "B9 must apply before the child it unlocks");
}

// ---- S3: tx-inv backlog is request-budget gated, not announce-size gated ------

#[tokio::test]
async fn s3_tx_backlog_drains_in_request_budget_sized_rounds() {
    let genesis = fork(1);
    let (channel, world, transport) = new_harness(genesis);
    world.seed_tip(genesis);

    let p = peer(1);
    channel
        .handle_inbound(InboundEvent::PeerActive { peer: p, node_network: true })
        .await
        .unwrap();

    const TOTAL: u64 = 300;
    const BUDGET: usize = 128; // MAX_PEER_SCHED_COUNT default

    let all_keys: Vec<InvKey> = (1..=TOTAL).map(|i| InvKey::tx(tx_id(i))).collect();

    let mut delivered = 0usize;
    let mut round = 0;
    while delivered < TOTAL as usize {
        channel
            .handle_inbound(InboundEvent::PeerInv {
                peer: p,
                fork: genesis,
                invs: all_keys.clone(),
            })
            .await
            .unwrap();

        let requested = transport.get_data_invs(p).get(round).cloned().unwrap_or_default();
        let remaining = TOTAL as usize - delivered;
        assert_eq!(requested.len(), remaining.min(BUDGET), "round {round} did not respect the per-round request budget");

        for key in &requested {
            let txid = key.as_tx_id();
            let n = (1..=TOTAL).find(|i| tx_id(*i) == txid).unwrap();
            let tx = TestTx { txid, from: from_addr(n), nonce: 0 };
            channel
                .handle_inbound(InboundEvent::PeerTx { peer: p, fork: genesis, tx })
                .await
                .unwrap();
        }
        delivered += requested.len();
        round += 1;
    }

    assert_eq!(world.applied_tx_count(), TOTAL as usize);
    assert!(round >= 3, "300 txs at a budget of 128 must take at least three rounds to drain");
}

// ---- S4: oversized inv is rejected outright, nothing scheduled -----------------

#[tokio::test]
async fn s4_oversized_inv_is_rejected_before_any_scheduling() {
    let genesis = fork(1);
    let (channel, _world, transport) = new_harness(genesis);

    let p = peer(1);
    channel
        .handle_inbound(InboundEvent::PeerActive { peer: p, node_network: true })
        .await
        .unwrap();
    let before = transport.events().len();

    let max = NetChannelConfig::default().schedule.max_inv_count;
    let invs: Vec<InvKey> = (0..=max as u64).map(|i| InvKey::block(block_hash(1000 + i))).collect();
    let result = channel
        .handle_inbound(InboundEvent::PeerInv { peer: p, fork: genesis, invs })
        .await;

    assert!(result.is_err(), "an inv message larger than MAX_INV_COUNT must be rejected");
    assert_eq!(transport.events().len(), before, "rejection must happen before any scheduling side effect");
}

// ---- S5: repeat mint at the same parent is tolerated once, then penalized -----

#[tokio::test]
async fn s5_second_peer_minting_on_the_same_parent_is_closed() {
    let genesis = fork(1);
    let (channel, world, transport) = new_harness(genesis);
    world.seed_tip(genesis);

    let peer_a = peer(1);
    let peer_b = peer(2);
    channel
        .handle_inbound(InboundEvent::PeerActive { peer: peer_a, node_network: true })
        .await
        .unwrap();
    channel
        .handle_inbound(InboundEvent::PeerActive { peer: peer_b, node_network: true })
        .await
        .unwrap();

    let block_a = TestBlock::chain(1, 0, 1);
    let mut block_b = TestBlock::chain(2, 0, 1);
    block_b.null_mint_dest = false;
    let mut block_a = block_a;
    block_a.null_mint_dest = false;

    world.mark_repeat_candidate(genesis, block_a.hash);
    world.mark_repeat_candidate(genesis, block_b.hash);

    channel
        .handle_inbound(InboundEvent::PeerInv {
            peer: peer_a,
            fork: genesis,
            invs: vec![InvKey::block(block_a.hash)],
        })
        .await
        .unwrap();
    channel
        .handle_inbound(InboundEvent::PeerBlock {
            peer: peer_a,
            fork: genesis,
            block: block_a,
        })
        .await
        .unwrap();
    assert!(world.applied(genesis, block_hash(1)), "the first peer to mint on this parent is tolerated");

    channel
        .handle_inbound(InboundEvent::PeerInv {
            peer: peer_b,
            fork: genesis,
            invs: vec![InvKey::block(block_b.hash)],
        })
        .await
        .unwrap();
    channel
        .handle_inbound(InboundEvent::PeerBlock {
            peer: peer_b,
            fork: genesis,
            block: block_b,
        })
        .await
        .unwrap();

    assert!(!world.applied(genesis, block_hash(2)), "the second competing block at the same parent must not apply");
    assert_eq!(transport.close_count(peer_b, CloseReason::DdosAttack), 1);
    assert_eq!(transport.close_count(peer_a, CloseReason::DdosAttack), 0);
}

// ---- S6: subsidiary ref-block waits on its primary, then auto-applies --------

#[tokio::test]
async fn s6_subsidiary_block_auto_applies_once_its_primary_ref_block_lands() {
    let genesis = fork(1);
    let subsidiary = fork(2);
    let (channel, world, _transport) = new_harness(genesis);
    world.seed_tip(genesis);
    world.seed_tip(subsidiary);
    channel.subscribe_fork(subsidiary).await;

    let p = peer(1);

    let mut subsidiary_block = TestBlock::chain(200, 0, 1);
    subsidiary_block.ref_block = Some(block_hash(100));
    channel
        .handle_inbound(InboundEvent::PeerInv {
            peer: p,
            fork: subsidiary,
            invs: vec![InvKey::block(subsidiary_block.hash)],
        })
        .await
        .unwrap();
    channel
        .handle_inbound(InboundEvent::PeerBlock {
            peer: p,
            fork: subsidiary,
            block: subsidiary_block,
        })
        .await
        .unwrap();
    assert!(!world.applied(subsidiary, block_hash(200)), "subsidiary block must wait on its unreceived ref block");

    let primary_block = TestBlock::chain(100, 0, 1);
    channel
        .handle_inbound(InboundEvent::PeerInv {
            peer: p,
            fork: genesis,
            invs: vec![InvKey::block(primary_block.hash)],
        })
        .await
        .unwrap();
    channel
        .handle_inbound(InboundEvent::PeerBlock {
            peer: p,
            fork: genesis,
            block: primary_block,
        })
        .await
        .unwrap();

    assert!(world.applied(genesis, block_hash(100)), "primary ref block should apply");
    assert!(
        world.applied(subsidiary, block_hash(200)),
        "subsidiary block should auto-apply once its ref block lands, without re-announcement"
    );
}

// ---- S7: undecided PoW blocks are cached, not applied, until consensus settles --

#[tokio::test]
async fn s7_undecided_pow_blocks_are_cached_and_first_one_is_announced_once() {
    let genesis = fork(1);
    let (channel, world, transport) = new_harness(genesis);
    world.seed_tip(genesis);
    world.set_agreement(Agreement::Undecided);

    let peer_a = peer(1);
    let peer_b = peer(2);
    channel
        .handle_inbound(InboundEvent::PeerActive { peer: peer_a, node_network: true })
        .await
        .unwrap();
    channel
        .handle_inbound(InboundEvent::PeerActive { peer: peer_b, node_network: true })
        .await
        .unwrap();

    let block_a = TestBlock::chain(1, 0, 1);
    let block_b = TestBlock::chain(2, 0, 1);

    channel
        .handle_inbound(InboundEvent::PeerInv {
            peer: peer_a,
            fork: genesis,
            invs: vec![InvKey::block(block_a.hash)],
        })
        .await
        .unwrap();
    channel
        .handle_inbound(InboundEvent::PeerBlock { peer: peer_a, fork: genesis, block: block_a })
        .await
        .unwrap();
    assert!(!world.applied(genesis, block_hash(1)), "an undecided PoW block must not apply yet");

    let announces_after_first = transport
        .events()
        .into_iter()
        .filter(|e| matches!(e, OutboundEvent::PeerInv { peer: p, invs, .. } if *p == peer_b && invs == &[InvKey::block(block_hash(1))]))
        .count();
    assert_eq!(announces_after_first, 1, "the first block cached at a height is announced once");

    channel
        .handle_inbound(InboundEvent::PeerInv {
            peer: peer_b,
            fork: genesis,
            invs: vec![InvKey::block(block_b.hash)],
        })
        .await
        .unwrap();
    channel
        .handle_inbound(InboundEvent::PeerBlock { peer: peer_b, fork: genesis, block: block_b })
        .await
        .unwrap();
    assert!(!world.applied(genesis, block_hash(2)), "a second competing block at the same height also waits");

    let announces_for_second = transport
        .events()
        .into_iter()
        .filter(|e| matches!(e, OutboundEvent::PeerInv { invs, .. } if invs == &[InvKey::block(block_hash(2))]))
        .count();
    assert_eq!(announces_for_second, 0, "a later block cached at an already-seen height is not re-announced");

    world.set_agreement(Agreement::Accepted);
    let applied = channel.submit_cache_pow_block(genesis, 1, block_hash(0), Instant::now(), true).await;
    assert!(applied, "SubmitCachePowBlock must release the cached height once consensus accepts it");
    assert!(world.applied(genesis, block_hash(1)) || world.applied(genesis, block_hash(2)), "one of the cached candidates must apply");
}
