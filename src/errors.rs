use crate::handler::{LinkId, SessionId};
use snafu::Snafu;
use std::io;
use std::result;
use std::sync::Arc;

/// A type alias for handling errors throughout quiver.
pub type Result<T> = result::Result<T, Error>;

/// An error that can occur from quiver.
///
/// Variants fall into five classes, which drive very different behavior
/// inside the event loop:
///
/// * transport errors (I/O, TLS, missed heartbeats) make the connection
///   eligible for reconnection;
/// * protocol errors are always terminal for the connection and are never
///   retried;
/// * capacity errors ([`InsufficientCredit`](Error::InsufficientCredit),
///   [`WorkQueueFull`](Error::WorkQueueFull)) are returned synchronously to
///   the caller and leave the connection untouched;
/// * usage errors (settling twice, sending on a receiver link) are returned
///   synchronously to the caller;
/// * configuration errors are reported by [`Container::new`](crate::Container::new)
///   before any I/O happens.
#[derive(Clone, Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    /// I/O error on the underlying transport.
    #[snafu(display("I/O error: {}", source))]
    Io {
        #[snafu(source(from(io::Error, Arc::new)))]
        source: Arc<io::Error>,
    },

    /// The transport closed without a Close performative.
    #[snafu(display("underlying socket closed unexpectedly"))]
    UnexpectedSocketClose,

    /// TLS handshake with the remote endpoint failed.
    #[cfg(feature = "native-tls")]
    #[snafu(display("TLS handshake failed: {}", source))]
    TlsHandshake {
        #[snafu(source(from(native_tls::Error, Arc::new)))]
        source: Arc<native_tls::Error>,
    },

    /// The transport could not be established within the configured timeout.
    #[snafu(display("timed out connecting to remote endpoint"))]
    ConnectTimeout,

    /// No traffic arrived from the remote peer within the negotiated idle
    /// timeout window.
    #[snafu(display("missed heartbeats from remote peer"))]
    MissedRemoteHeartbeats,

    /// Reconnection gave up after exhausting the configured attempt limit.
    #[snafu(display("gave up reconnecting after {} attempts: {}", attempts, source))]
    ReconnectExhausted {
        attempts: u32,
        #[snafu(source(from(Error, Box::new)))]
        source: Box<Error>,
    },

    /// The codec reported bytes that do not form a valid frame.
    #[snafu(display("received malformed data: {}", message))]
    ReceivedMalformed { message: String },

    /// The peer sent a performative that is illegal in the current state
    /// (e.g., Transfer on a link that is not attached).
    #[snafu(display("unexpected {} performative in state {}", performative, state))]
    UnexpectedPerformative {
        performative: &'static str,
        state: String,
    },

    /// The peer sent a frame for a channel with no mapped session.
    #[snafu(display("received frame for unknown channel {}", channel))]
    UnknownChannel { channel: u16 },

    /// The peer sent a frame for a link handle we never saw attached.
    #[snafu(display("received frame for unknown handle {} on channel {}", handle, channel))]
    UnknownLinkHandle { channel: u16, handle: u32 },

    /// The peer transferred a delivery without any outstanding credit.
    #[snafu(display("peer sent transfer on {} with no outstanding credit", link))]
    CreditViolation { link: LinkId },

    /// The peer closed the connection with an error condition.
    #[snafu(display("peer closed connection ({}: {})", condition, description))]
    RemoteClosedConnection {
        condition: String,
        description: String,
    },

    /// A send was attempted with no credit granted by the peer. Wait for
    /// `on_sendable` and retry.
    #[snafu(display("no credit available to send on {}", link))]
    InsufficientCredit { link: LinkId },

    /// The work queue is at its configured bound and the rejection policy is
    /// in effect.
    #[snafu(display("work queue is full"))]
    WorkQueueFull,

    /// A delivery was settled a second time.
    #[snafu(display("delivery has already been settled"))]
    AlreadySettled,

    /// A delivery from a previous connection generation was settled after a
    /// failover; its true fate at the broker is unknown.
    #[snafu(display("delivery belongs to a connection that no longer exists"))]
    StaleDelivery,

    /// An operation required an attached link.
    #[snafu(display("{} is not attached", link))]
    LinkNotAttached { link: LinkId },

    /// A sender operation was attempted on a receiver link or vice versa.
    #[snafu(display("operation not valid for the role of {}", link))]
    WrongRole { link: LinkId },

    /// An operation referenced a link id this container never created.
    #[snafu(display("unknown link {}", link))]
    UnknownLink { link: LinkId },

    /// An operation referenced a session id this container never created.
    #[snafu(display("unknown session {}", session))]
    UnknownSession { session: SessionId },

    /// An operation was attempted after the connection reached a terminal
    /// state.
    #[snafu(display("connection has been closed"))]
    ConnectionClosed,

    /// A connection URL could not be parsed.
    #[snafu(display("could not parse connection URL {:?}", url))]
    InvalidUrl { url: String },

    /// Connection options failed validation.
    #[snafu(display("invalid connection options: {}", reason))]
    InvalidOptions { reason: String },

    /// The endpoint set is empty.
    #[snafu(display("no endpoints configured"))]
    NoEndpoints,

    /// All session channel numbers are in use.
    #[snafu(display("no more session channels are available"))]
    ExhaustedChannels,

    /// The event loop thread is gone (no further information available).
    #[snafu(display("event loop thread died (no further information available)"))]
    EventLoopDropped,

    /// The event loop thread panicked.
    #[snafu(display("event loop thread died unexpectedly: {}", message))]
    IoThreadPanic { message: String },

    /// Spawning the event loop thread failed.
    #[snafu(display("could not spawn event loop thread"))]
    ForkFailed {
        #[snafu(source(from(io::Error, Arc::new)))]
        source: Arc<io::Error>,
    },
}

impl Error {
    /// True for transport-class errors, which are eligible for reconnection.
    /// Protocol violations are deliberately excluded: retrying against the
    /// same peer behavior cannot fix them.
    pub fn is_transport(&self) -> bool {
        match self {
            Error::Io { .. }
            | Error::UnexpectedSocketClose
            | Error::ConnectTimeout
            | Error::MissedRemoteHeartbeats => true,
            #[cfg(feature = "native-tls")]
            Error::TlsHandshake { .. } => true,
            _ => false,
        }
    }

    /// True for capacity-class errors, which are reported synchronously to
    /// the caller and never affect connection state.
    pub fn is_capacity(&self) -> bool {
        matches!(self, Error::InsufficientCredit { .. } | Error::WorkQueueFull)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::LinkId;

    #[test]
    fn transport_classification() {
        assert!(Error::UnexpectedSocketClose.is_transport());
        assert!(Error::ConnectTimeout.is_transport());
        assert!(!Error::WorkQueueFull.is_transport());
        assert!(!Error::RemoteClosedConnection {
            condition: "amqp:internal-error".to_string(),
            description: String::new(),
        }
        .is_transport());
    }

    #[test]
    fn capacity_classification() {
        assert!(Error::WorkQueueFull.is_capacity());
        assert!(Error::InsufficientCredit {
            link: LinkId::for_tests(7)
        }
        .is_capacity());
        assert!(!Error::AlreadySettled.is_capacity());
    }
}
