use crate::delivery::{Delivery, DeliveryTag};
use crate::errors::Result;
use crate::handler::{LinkId, SessionId};
use crate::options::{ReceiverOptions, SenderOptions};
use crate::performative::Outcome;
use crate::reactor::machine::{ConnectionState, Core};

/// Handle to the connection, passed to every [`Handler`](crate::Handler)
/// callback and every work queue task.
///
/// All operations take effect through the event loop: frames produced here
/// are flushed once the current callback or task returns. A `Context` never
/// blocks.
pub struct Context<'a> {
    core: &'a mut Core,
}

impl<'a> Context<'a> {
    pub(crate) fn new(core: &'a mut Core) -> Context<'a> {
        Context { core }
    }

    /// The container id this connection introduces itself with.
    pub fn container_id(&self) -> &str {
        &self.core.options().container_id
    }

    /// True once the connection is open end to end.
    pub fn is_open(&self) -> bool {
        self.core.state() == ConnectionState::Open
    }

    /// Open a session. If the connection is not yet (or currently not)
    /// open, the Begin is deferred and replayed automatically once it is.
    pub fn open_session(&mut self) -> Result<SessionId> {
        self.core.open_session()
    }

    /// Close a session and the links under it.
    pub fn close_session(&mut self, session: SessionId) -> Result<()> {
        self.core.close_session(session)
    }

    /// Open a sender link for `address`. Deferred and replayed like
    /// [`open_session`](Context::open_session).
    pub fn open_sender(
        &mut self,
        session: SessionId,
        address: &str,
        options: SenderOptions,
    ) -> Result<LinkId> {
        self.core.open_sender(session, address, options)
    }

    /// Open a receiver link for `address`. Deferred and replayed like
    /// [`open_session`](Context::open_session).
    pub fn open_receiver(
        &mut self,
        session: SessionId,
        address: &str,
        options: ReceiverOptions,
    ) -> Result<LinkId> {
        self.core.open_receiver(session, address, options)
    }

    pub fn close_link(&mut self, link: LinkId) -> Result<()> {
        self.core.close_link(link)
    }

    /// Send one message on a sender link, spending one unit of credit.
    ///
    /// Fails with [`Error::InsufficientCredit`](crate::Error::InsufficientCredit)
    /// when no credit is available; wait for
    /// [`on_sendable`](crate::Handler::on_sendable) and retry.
    pub fn send(&mut self, link: LinkId, payload: &[u8]) -> Result<DeliveryTag> {
        self.core.send(link, payload)
    }

    /// Credit currently available on a link.
    pub fn credit(&self, link: LinkId) -> Result<u32> {
        self.core.credit(link)
    }

    /// True while the session is mapped end to end.
    pub fn is_session_open(&self, session: SessionId) -> Result<bool> {
        self.core.session_is_open(session)
    }

    /// True while the link is attached end to end.
    pub fn is_link_open(&self, link: LinkId) -> Result<bool> {
        self.core.link_is_open(link)
    }

    /// The address a link was opened for.
    pub fn link_address(&self, link: LinkId) -> Result<&str> {
        self.core.link_address(link)
    }

    /// Grant the peer `n` additional units of credit on a receiver link.
    /// Only needed when the link's standing credit window is zero.
    pub fn add_credit(&mut self, link: LinkId, n: u32) -> Result<()> {
        self.core.add_credit(link, n)
    }

    /// Settle an incoming delivery as accepted.
    pub fn accept(&mut self, delivery: &mut Delivery) -> Result<()> {
        self.core.settle_delivery(delivery, Outcome::Accepted)
    }

    /// Settle an incoming delivery as rejected.
    pub fn reject(&mut self, delivery: &mut Delivery) -> Result<()> {
        self.core.settle_delivery(delivery, Outcome::Rejected)
    }

    /// Settle an incoming delivery as released back to the peer.
    pub fn release(&mut self, delivery: &mut Delivery) -> Result<()> {
        self.core.settle_delivery(delivery, Outcome::Released)
    }

    /// Settle an incoming delivery as modified.
    pub fn modify(&mut self, delivery: &mut Delivery, delivery_failed: bool) -> Result<()> {
        self.core
            .settle_delivery(delivery, Outcome::Modified { delivery_failed })
    }

    /// Request an orderly connection close.
    ///
    /// With the default options the wire Close is deferred until in-flight
    /// deliveries settle; see
    /// [`ConnectionOptions::close_waits_for_settlement`](crate::ConnectionOptions::close_waits_for_settlement).
    pub fn close(&mut self) -> Result<()> {
        self.core.request_close()
    }
}
