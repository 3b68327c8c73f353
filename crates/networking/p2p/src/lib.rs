//! Fork-aware block/transaction synchronization core.
//!
//! Tracks what every peer has already announced or sent
//! ([`known_tx`]/[`peer_fork_state`]), schedules inventory requests across forks
//! without re-requesting the same item twice ([`schedule`]), and drives the
//! request/response state machine peer-by-peer ([`channel`]). Consensus rules,
//! PoW verification, execution, storage and the wire transport are all supplied
//! by the embedder through [`contracts`]; this crate owns none of them.

mod config;
mod constants;
mod contracts;
mod error;
mod events;
mod inv;
mod known_tx;
mod peer_fork_state;
mod peer_state;
mod schedule;
mod types;
mod worklist;

mod channel;

pub use config::{KnownTxConfig, NetChannelConfig, ScheduleConfig};
pub use contracts::{Agreement, BlockMeta, ChainEngine, ConsensusOracle, Dispatcher, Errno, PeerTransport, TxMeta, TxPool};
pub use error::{ChannelError, ScheduleError};
pub use events::{CloseReason, InboundEvent, Locator, MsgReqType, MsgRspResult, OutboundEvent};
pub use inv::{InvKey, InvKind};
pub use types::{BlockHash, ForkHash, FromAddr, PeerId, TxId, LOCAL_PEER};

pub use channel::NetChannel;
