use crate::handler::{LinkId, SessionId};
use crate::performative::{Flow, Role};

/// Attachment lifecycle of a link within one connection generation.
///
/// `Unattached` is both the initial state and the state a surviving link
/// returns to when its connection generation dies; the attach is replayed
/// from there. `Detached` is terminal and never replayed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum LinkState {
    Unattached,
    AttachSent,
    Attached,
    DetachSent,
    Detached,
}

pub(crate) struct Link {
    pub(crate) id: LinkId,
    pub(crate) session: SessionId,
    pub(crate) name: String,
    pub(crate) role: Role,
    pub(crate) address: String,
    pub(crate) state: LinkState,
    /// Our handle for this link; per generation.
    pub(crate) handle: Option<u32>,
    /// The peer's handle for this link; per generation.
    pub(crate) remote_handle: Option<u32>,
    /// Sender: transfers initiated. Receiver: transfers received.
    pub(crate) delivery_count: u32,
    /// Sender: credit remaining to spend. Receiver: credit outstanding at
    /// the peer.
    pub(crate) credit: u32,
    /// Receiver standing window; zero means credit is managed manually.
    pub(crate) credit_window: u32,
    pub(crate) auto_accept: bool,
    /// Sender: transfers go out pre-settled.
    pub(crate) auto_settle: bool,
    pub(crate) next_tag: u64,
    /// True while credit is nonzero; drives the zero-to-nonzero edge that
    /// fires `on_sendable`.
    pub(crate) was_sendable: bool,
}

impl Link {
    pub(crate) fn new(
        id: LinkId,
        session: SessionId,
        name: String,
        role: Role,
        address: String,
    ) -> Link {
        Link {
            id,
            session,
            name,
            role,
            address,
            state: LinkState::Unattached,
            handle: None,
            remote_handle: None,
            delivery_count: 0,
            credit: 0,
            credit_window: 0,
            auto_accept: true,
            auto_settle: false,
            next_tag: 0,
            was_sendable: false,
        }
    }

    pub(crate) fn is_retired(&self) -> bool {
        self.state == LinkState::Detached
    }

    /// Recompute sender credit from an incoming flow.
    ///
    /// The peer reports its view of our delivery count alongside the credit
    /// it granted at that point; transfers we sent since then have already
    /// spent part of that grant.
    pub(crate) fn apply_sender_flow(&mut self, flow: &Flow) {
        debug_assert_eq!(self.role, Role::Sender);
        let spent_since = self.delivery_count.wrapping_sub(flow.delivery_count);
        self.credit = flow.link_credit.saturating_sub(spent_since);
        if self.credit == 0 {
            // re-arm the edge so the next grant fires sendable again
            self.was_sendable = false;
        }
    }

    /// Reset per-generation state, keeping the recipe fields (name, role,
    /// address, options) so the attach can be replayed.
    pub(crate) fn reset_for_replay(&mut self) {
        self.handle = None;
        self.remote_handle = None;
        self.credit = 0;
        self.was_sendable = false;
        if self.state != LinkState::Detached {
            self.state = LinkState::Unattached;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sender() -> Link {
        Link::new(
            LinkId::for_tests(1),
            SessionId::for_tests(1),
            "test-link".to_string(),
            Role::Sender,
            "q".to_string(),
        )
    }

    fn flow(delivery_count: u32, link_credit: u32) -> Flow {
        Flow {
            handle: Some(0),
            delivery_count,
            link_credit,
            next_incoming_id: 0,
            incoming_window: 0,
            next_outgoing_id: 0,
            outgoing_window: 0,
        }
    }

    #[test]
    fn fresh_grant_is_taken_whole() {
        let mut link = sender();
        link.apply_sender_flow(&flow(0, 10));
        assert_eq!(link.credit, 10);
    }

    #[test]
    fn transfers_since_grant_are_deducted() {
        let mut link = sender();
        link.delivery_count = 7;
        // peer granted 10 when it had seen 4 of our transfers
        link.apply_sender_flow(&flow(4, 10));
        assert_eq!(link.credit, 7);
    }

    #[test]
    fn overspent_grant_clamps_to_zero() {
        let mut link = sender();
        link.delivery_count = 20;
        link.apply_sender_flow(&flow(4, 10));
        assert_eq!(link.credit, 0);
    }

    #[test]
    fn revoked_credit_rearms_the_sendable_edge() {
        let mut link = sender();
        link.apply_sender_flow(&flow(0, 1));
        link.was_sendable = true;

        link.apply_sender_flow(&flow(0, 0));
        assert_eq!(link.credit, 0);
        assert!(!link.was_sendable);
    }

    #[test]
    fn grant_survives_delivery_count_wraparound() {
        let mut link = sender();
        link.delivery_count = 2;
        // peer last saw us 3 transfers ago, just before the counter wrapped
        link.apply_sender_flow(&flow(u32::max_value(), 10));
        assert_eq!(link.credit, 7);
    }
}
