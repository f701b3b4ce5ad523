//! quiver is a reactive AMQP 1.0 client runtime.
//!
//! A [`Container`] owns one connection and a single-threaded event loop.
//! Applications implement [`Handler`] and react to callbacks; other threads
//! reach the connection through a [`ContainerHandle`]. Wire encoding is
//! pluggable via [`FrameCodec`], and transports (TCP, TLS) via [`Transport`].

#![allow(dead_code)]

mod codec;
mod container;
mod delivery;
mod endpoint;
mod errors;
mod frame_buffer;
mod handler;
mod heartbeats;
mod options;
mod performative;
mod reactor;
mod reconnect;
mod transport;

pub use codec::{Decoded, Frame, FrameCodec};
pub use container::{Container, ContainerHandle, ContainerThread};
pub use delivery::{Delivery, DeliveryTag};
pub use endpoint::Endpoint;
pub use errors::{Error, Result};
pub use handler::{Handler, LinkId, SessionId};
pub use options::{
    ConnectionOptions, ReceiverOptions, ReconnectOptions, SaslConfig, SenderOptions,
    WorkQueuePolicy,
};
pub use performative::{
    Attach, Begin, Close, Condition, Detach, Disposition, End, Flow, Open, Outcome, Performative,
    Role, Transfer,
};
pub use reactor::Context;
pub use transport::{IoStream, TcpTransport, Transport};

#[cfg(feature = "native-tls")]
pub use transport::{TlsConnector, TlsStream, TlsTransport};

#[allow(dead_code)]
mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}
