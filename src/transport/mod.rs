//! Pluggable transport adapters.
//!
//! The event loop drives any [`IoStream`]; a [`Transport`] knows how to
//! establish one against an [`Endpoint`]. Establishment is the one blocking
//! operation in the crate and happens on the event loop thread between
//! connection generations, never while a connection is live.

use crate::endpoint::Endpoint;
use crate::errors::*;
use crate::options::SaslConfig;
use mio::net::TcpStream;
use mio::Evented;
use snafu::ResultExt;
use std::io::{Read, Write};
use std::net::{self, ToSocketAddrs};
use std::time::Duration;

/// A nonblocking, pollable byte stream carrying AMQP frames.
pub trait IoStream: Read + Write + Evented + Send + 'static {}

impl IoStream for TcpStream {}

/// Establishes transports for the event loop.
///
/// `connect` is called once per connection attempt, with the endpoint the
/// failover cursor currently points at. The SASL configuration is passed
/// through for adapters that negotiate authentication during establishment;
/// the plain TCP adapter only enforces the cleartext-credentials guard.
pub trait Transport: Send + 'static {
    type Stream: IoStream;

    fn connect(
        &mut self,
        endpoint: &Endpoint,
        sasl: &SaslConfig,
        timeout: Option<Duration>,
    ) -> Result<Self::Stream>;
}

/// Plain TCP transport.
#[derive(Debug, Default)]
pub struct TcpTransport;

impl Transport for TcpTransport {
    type Stream = TcpStream;

    fn connect(
        &mut self,
        endpoint: &Endpoint,
        sasl: &SaslConfig,
        timeout: Option<Duration>,
    ) -> Result<Self::Stream> {
        check_cleartext_credentials(endpoint, sasl)?;
        open_tcp(endpoint, timeout)
    }
}

fn check_cleartext_credentials(endpoint: &Endpoint, sasl: &SaslConfig) -> Result<()> {
    if sasl.username.is_some() && !sasl.allow_insecure && !endpoint.tls {
        return InvalidOptionsSnafu {
            reason: "refusing to send credentials over a cleartext transport \
                     without allow_insecure",
        }
        .fail();
    }
    Ok(())
}

/// Open a TCP stream to `endpoint`, trying each resolved address in turn,
/// and hand it back in nonblocking mode ready for the poll loop.
fn open_tcp(endpoint: &Endpoint, timeout: Option<Duration>) -> Result<TcpStream> {
    let addrs = (endpoint.host.as_str(), endpoint.port)
        .to_socket_addrs()
        .context(IoSnafu)?;

    let mut last_err = None;
    for addr in addrs {
        let result = match timeout {
            Some(timeout) => net::TcpStream::connect_timeout(&addr, timeout).map_err(|err| {
                if err.kind() == std::io::ErrorKind::TimedOut {
                    ConnectTimeoutSnafu.build()
                } else {
                    io_error(err)
                }
            }),
            None => net::TcpStream::connect(&addr).map_err(io_error),
        };
        match result {
            Ok(stream) => {
                stream.set_nonblocking(true).context(IoSnafu)?;
                return TcpStream::from_stream(stream).context(IoSnafu);
            }
            Err(err) => last_err = Some(err),
        }
    }

    Err(last_err.unwrap_or_else(|| {
        io_error(std::io::Error::new(
            std::io::ErrorKind::AddrNotAvailable,
            format!("no addresses resolved for {}", endpoint),
        ))
    }))
}

fn io_error(err: std::io::Error) -> Error {
    Error::Io {
        source: std::sync::Arc::new(err),
    }
}

#[cfg(feature = "native-tls")]
mod native_tls;

#[cfg(feature = "native-tls")]
pub use self::native_tls::{TlsConnector, TlsStream, TlsTransport};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cleartext_credentials_refused_without_opt_in() {
        let endpoint = Endpoint::new("localhost", 5672);
        let sasl = SaslConfig::plain("user", "pass");
        match check_cleartext_credentials(&endpoint, &sasl).unwrap_err() {
            Error::InvalidOptions { .. } => (),
            err => panic!("unexpected error {}", err),
        }
    }

    #[test]
    fn cleartext_credentials_allowed_with_opt_in() {
        let endpoint = Endpoint::new("localhost", 5672);
        let sasl = SaslConfig::plain("user", "pass").allow_insecure(true);
        check_cleartext_credentials(&endpoint, &sasl).unwrap();
    }

    #[test]
    fn tls_endpoint_allows_credentials() {
        let endpoint = Endpoint::new("localhost", 5671).with_tls();
        let sasl = SaslConfig::plain("user", "pass");
        check_cleartext_credentials(&endpoint, &sasl).unwrap();
    }
}
