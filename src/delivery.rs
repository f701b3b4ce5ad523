use crate::handler::{LinkId, SessionId};
use crate::performative::Outcome;
use std::fmt;

/// Tag identifying an outgoing delivery, returned by
/// [`Context::send`](crate::Context::send) and echoed back in
/// [`Handler::on_delivery_settle`](crate::Handler::on_delivery_settle).
///
/// Tags are unique per link for the lifetime of the container.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DeliveryTag(pub(crate) u64);

impl DeliveryTag {
    /// The wire form of the tag.
    pub fn to_bytes(self) -> [u8; 8] {
        self.0.to_be_bytes()
    }
}

impl fmt::Display for DeliveryTag {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An incoming delivery, handed to
/// [`Handler::on_message`](crate::Handler::on_message).
///
/// A delivery may be settled either during the callback or later, from any
/// thread, by moving it into a work queue task and calling the settlement
/// methods on [`Context`](crate::Context). Each delivery is bound to the
/// connection generation it arrived on; settling it after a reconnection
/// fails with [`Error::StaleDelivery`](crate::Error::StaleDelivery) since
/// the broker has already requeued it.
#[derive(Debug)]
pub struct Delivery {
    pub(crate) link: LinkId,
    pub(crate) session: SessionId,
    pub(crate) delivery_id: u32,
    pub(crate) tag: Vec<u8>,
    pub(crate) payload: Vec<u8>,
    pub(crate) settled: bool,
    pub(crate) outcome: Option<Outcome>,
    pub(crate) generation: u64,
}

impl Delivery {
    /// The receiver link this delivery arrived on.
    pub fn link(&self) -> LinkId {
        self.link
    }

    /// The session owning the link.
    pub fn session(&self) -> SessionId {
        self.session
    }

    /// The sender's delivery tag.
    pub fn tag(&self) -> &[u8] {
        &self.tag
    }

    /// The message body.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Consume the delivery record, keeping only the body.
    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }

    /// True once a terminal outcome has been applied locally.
    pub fn is_settled(&self) -> bool {
        self.settled
    }

    /// The locally applied outcome, if settled.
    pub fn outcome(&self) -> Option<Outcome> {
        self.outcome
    }
}
