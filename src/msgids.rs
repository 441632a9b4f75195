//! Message ids used by the engine on the local software bus.

use crate::wire::MsgId;

/// Ground commands (Noop, ResetCounters, GetPeerList, GetPeerStatus, ResetPeer).
pub const SBN_CMD_MID: MsgId = 0x1877;
/// Housekeeping request from the scheduler.
pub const SBN_SEND_HK_MID: MsgId = 0x1878;
/// Scheduler wakeup.
pub const SBN_WAKEUP_MID: MsgId = 0x1879;

pub const SBN_HK_TLM_MID: MsgId = 0x0877;
pub const SBN_GET_PEER_LIST_RSP_MID: MsgId = 0x0878;
pub const SBN_GET_PEER_STATUS_RSP_MID: MsgId = 0x0879;

/// Bus event messages. Never propagated to peers.
pub const EVS_EVENT_MSG_MID: MsgId = 0x0808;
/// Batch report of every subscription made before reporting was enabled.
pub const SB_ALLSUBS_TLM_MID: MsgId = 0x080D;
/// Report of a single subscribe or unsubscribe.
pub const SB_ONESUB_TLM_MID: MsgId = 0x080E;
