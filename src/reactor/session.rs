use crate::delivery::DeliveryTag;
use crate::handler::{LinkId, SessionId};
use indexmap::IndexMap;
use std::collections::HashMap;

/// Default session windows advertised in Begin. Session-level flow is
/// emitted for the peer's benefit but not enforced locally.
pub(crate) const SESSION_WINDOW: u32 = 2048;

/// Mapping lifecycle of a session within one connection generation.
///
/// `Unmapped` doubles as the replay state after a failover; `Ended` is
/// terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum SessionState {
    Unmapped,
    BeginSent,
    Mapped,
    EndSent,
    Ended,
}

/// An outgoing delivery awaiting settlement by the peer.
pub(crate) struct UnsettledSend {
    pub(crate) link: LinkId,
    pub(crate) tag: DeliveryTag,
}

pub(crate) struct Session {
    pub(crate) id: SessionId,
    pub(crate) state: SessionState,
    /// Channel our frames for this session travel on; per generation.
    pub(crate) local_channel: Option<u16>,
    /// Channel the peer's frames for this session arrive on; per generation.
    pub(crate) remote_channel: Option<u16>,
    pub(crate) next_outgoing_id: u32,
    pub(crate) next_incoming_id: u32,
    /// Links belonging to this session, in creation order. Retired links
    /// stay listed but are skipped on replay.
    pub(crate) links: Vec<LinkId>,
    pub(crate) next_handle: u32,
    /// Peer handle to link, rebuilt each generation from incoming attaches.
    pub(crate) remote_handles: HashMap<u32, LinkId>,
    /// Outgoing deliveries by delivery id, in send order so dispositions
    /// covering ranges settle in order.
    pub(crate) unsettled: IndexMap<u32, UnsettledSend>,
}

impl Session {
    pub(crate) fn new(id: SessionId) -> Session {
        Session {
            id,
            state: SessionState::Unmapped,
            local_channel: None,
            remote_channel: None,
            next_outgoing_id: 0,
            next_incoming_id: 0,
            links: Vec::new(),
            next_handle: 0,
            remote_handles: HashMap::new(),
            unsettled: IndexMap::new(),
        }
    }

    pub(crate) fn is_retired(&self) -> bool {
        self.state == SessionState::Ended
    }

    /// Reset per-generation state, keeping the link list so attaches can be
    /// replayed once the session maps again. The unsettled map must already
    /// have been drained (those deliveries settle as indeterminate).
    pub(crate) fn reset_for_replay(&mut self) {
        debug_assert!(self.unsettled.is_empty());
        self.local_channel = None;
        self.remote_channel = None;
        self.next_outgoing_id = 0;
        self.next_incoming_id = 0;
        self.next_handle = 0;
        self.remote_handles.clear();
        if self.state != SessionState::Ended {
            self.state = SessionState::Unmapped;
        }
    }
}
