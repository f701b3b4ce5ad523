use crate::delivery::{Delivery, DeliveryTag};
use crate::errors::Error;
use crate::performative::{Condition, Outcome};
use crate::reactor::Context;
use std::fmt;

/// Stable identifier for a session, valid for the lifetime of the container.
///
/// Ids survive reconnection: after a failover the same `SessionId` refers to
/// the re-established session, even though its wire channel number may
/// differ.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub(crate) u32);

/// Stable identifier for a link, valid for the lifetime of the container.
///
/// Like [`SessionId`], link ids survive reconnection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkId(pub(crate) u32);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "link-{}", self.0)
    }
}

#[cfg(test)]
impl SessionId {
    pub(crate) fn for_tests(id: u32) -> SessionId {
        SessionId(id)
    }
}

#[cfg(test)]
impl LinkId {
    pub(crate) fn for_tests(id: u32) -> LinkId {
        LinkId(id)
    }
}

/// Application callbacks, invoked serially on the event loop thread.
///
/// All methods have empty default implementations; implement only what the
/// application cares about. Every callback receives a [`Context`] through
/// which it may open and close endpoints, send, grant credit, and settle
/// deliveries. Effects requested through the context are applied when the
/// callback returns.
///
/// A panic inside a callback is caught, logged, and treated as a no-op; it
/// never takes down the event loop.
pub trait Handler: Send + 'static {
    /// The connection is open: the peer's Open has arrived and links may be
    /// created. Also fires after each successful reconnection.
    fn on_connection_open(&mut self, ctx: &mut Context) {
        let _ = ctx;
    }

    /// The connection reached a terminal state. `error` is `None` for an
    /// orderly local or remote close.
    fn on_connection_close(&mut self, ctx: &mut Context, error: Option<&Error>) {
        let _ = (ctx, error);
    }

    fn on_session_open(&mut self, ctx: &mut Context, session: SessionId) {
        let _ = (ctx, session);
    }

    fn on_session_close(&mut self, ctx: &mut Context, session: SessionId, error: Option<&Condition>) {
        let _ = (ctx, session, error);
    }

    /// The link is attached at both ends and usable.
    fn on_link_open(&mut self, ctx: &mut Context, link: LinkId) {
        let _ = (ctx, link);
    }

    fn on_link_close(&mut self, ctx: &mut Context, link: LinkId, error: Option<&Condition>) {
        let _ = (ctx, link, error);
    }

    /// Credit on a sender link went from zero to nonzero. Fires once per
    /// such transition, not once per credit unit.
    fn on_sendable(&mut self, ctx: &mut Context, link: LinkId) {
        let _ = (ctx, link);
    }

    /// A delivery arrived on a receiver link. Unless the handler settles it
    /// (or the link disables auto-accept), it is accepted when this returns.
    fn on_message(&mut self, ctx: &mut Context, delivery: &mut Delivery) {
        let _ = (ctx, delivery);
    }

    /// The peer settled an outgoing delivery with the given outcome. After a
    /// failover, deliveries that were in flight settle locally as
    /// [`Outcome::Indeterminate`].
    fn on_delivery_settle(
        &mut self,
        ctx: &mut Context,
        link: LinkId,
        tag: DeliveryTag,
        outcome: Outcome,
    ) {
        let _ = (ctx, link, tag, outcome);
    }

    /// A transport-class failure occurred. If reconnection is configured the
    /// runtime will retry after this returns; otherwise the connection
    /// closes with this error.
    fn on_transport_error(&mut self, ctx: &mut Context, error: &Error) {
        let _ = (ctx, error);
    }
}
