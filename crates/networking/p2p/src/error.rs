//! Error taxonomy (spec §7). Validation failures on peer-supplied data are never
//! panics; invariant violations inside the arena are `debug_assert!`ed in test
//! builds and otherwise logged and treated as a no-op, matching the teacher's
//! posture of logging unexpected states rather than crashing a long-running node.

use thiserror::Error;

use crate::types::{ForkHash, PeerId};

#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("peer {peer} exceeded its inventory capacity for this fork")]
    PeerCapacityExceeded { peer: PeerId },
    #[error("inventory entry not found")]
    UnknownInv,
    #[error("fork {0} has no schedule (already unsubscribed?)")]
    UnknownFork(ForkHash),
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error(transparent)]
    Schedule(#[from] ScheduleError),
    #[error("protocol violation by peer {peer}: {reason}")]
    ProtocolViolation { peer: PeerId, reason: &'static str },
    #[error("peer {peer} failed to respond in time: {reason}")]
    ResponseFailure { peer: PeerId, reason: &'static str },
    #[error("peer {0} is not known to the channel")]
    UnknownPeer(PeerId),
}
