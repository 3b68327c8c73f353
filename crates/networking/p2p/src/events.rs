//! Typed peer events (spec §6). Modeled as tagged sums with one variant per event
//! kind and dispatched by a single `match`, per the "runtime-polymorphic events"
//! design note (§9) — the original's per-event C++ classes collapse into enums here
//! instead of trait-object dispatch.

use crate::inv::InvKey;
use crate::types::{ForkHash, PeerId};

/// Locator for `GetBlocks`: a descending list of block hashes the sender has.
#[derive(Debug, Clone)]
pub struct Locator {
    pub hashes: Vec<ethereum_types::H256>,
}

/// `MsgRsp` request/result kinds (spec §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgReqType {
    Inv,
    GetBlocks,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgRspResult {
    TxInvReceived,
    TxInvComplete,
    Empty,
    Equal,
}

/// An inbound event, always addressed to one peer and (except peer
/// activation/deactivation) one fork.
#[derive(Debug, Clone)]
pub enum InboundEvent<B, Tx> {
    PeerActive {
        peer: PeerId,
        node_network: bool,
    },
    PeerDeactive {
        peer: PeerId,
    },
    PeerSubscribe {
        peer: PeerId,
        fork: ForkHash,
        child_forks: Vec<ForkHash>,
    },
    PeerUnsubscribe {
        peer: PeerId,
        fork: ForkHash,
        child_forks: Vec<ForkHash>,
    },
    PeerInv {
        peer: PeerId,
        fork: ForkHash,
        invs: Vec<InvKey>,
    },
    PeerGetData {
        peer: PeerId,
        fork: ForkHash,
        invs: Vec<InvKey>,
    },
    PeerGetBlocks {
        peer: PeerId,
        fork: ForkHash,
        locator: Locator,
    },
    PeerTx {
        peer: PeerId,
        fork: ForkHash,
        tx: Tx,
    },
    PeerBlock {
        peer: PeerId,
        fork: ForkHash,
        block: B,
    },
    PeerGetFail {
        peer: PeerId,
        fork: ForkHash,
        invs: Vec<InvKey>,
    },
    PeerMsgRsp {
        peer: PeerId,
        fork: ForkHash,
        req_type: MsgReqType,
        result: MsgRspResult,
    },
}

/// An outbound event NetChannel asks the transport to deliver.
#[derive(Debug, Clone)]
pub enum OutboundEvent<B, Tx> {
    PeerSubscribe {
        peer: PeerId,
        fork: ForkHash,
        child_forks: Vec<ForkHash>,
    },
    PeerUnsubscribe {
        peer: PeerId,
        fork: ForkHash,
        child_forks: Vec<ForkHash>,
    },
    PeerInv {
        peer: PeerId,
        fork: ForkHash,
        invs: Vec<InvKey>,
    },
    PeerGetData {
        peer: PeerId,
        fork: ForkHash,
        invs: Vec<InvKey>,
    },
    PeerGetBlocks {
        peer: PeerId,
        fork: ForkHash,
        locator: Locator,
    },
    PeerTx {
        peer: PeerId,
        fork: ForkHash,
        tx: Tx,
    },
    PeerBlock {
        peer: PeerId,
        fork: ForkHash,
        block: B,
    },
    PeerGetFail {
        peer: PeerId,
        fork: ForkHash,
        invs: Vec<InvKey>,
    },
    PeerMsgRsp {
        peer: PeerId,
        fork: ForkHash,
        req_type: MsgReqType,
        result: MsgRspResult,
    },
    PeerNetReward {
        peer: PeerId,
    },
    PeerNetClose {
        peer: PeerId,
        reason: CloseReason,
    },
}

/// Why a peer is being closed/penalized (spec §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Protocol violation: oversized inv, malformed payload, bad subscription.
    DdosAttack,
    /// A tx-inv cycle or request timed out without a response.
    ResponseFailure,
}
