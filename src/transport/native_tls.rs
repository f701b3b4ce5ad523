use super::{open_tcp, IoStream, Transport};
use crate::endpoint::Endpoint;
use crate::errors::*;
use crate::options::SaslConfig;
use mio::{Evented, Events, Poll, PollOpt, Ready, Token};
use native_tls::{HandshakeError, MidHandshakeTlsStream};
use snafu::ResultExt;
use std::io::{self, Read, Write};
use std::time::{Duration, Instant};

/// Newtype wrapper around a `native_tls::TlsConnector` making it usable by
/// the event loop's transport machinery.
pub struct TlsConnector(native_tls::TlsConnector);

impl TlsConnector {
    fn begin<S>(&self, domain: &str, stream: S) -> Result<HandshakeProgress<S>>
    where
        S: Read + Write,
    {
        Ok(match self.0.connect(domain, stream) {
            Ok(s) => HandshakeProgress::Done(s),
            Err(HandshakeError::WouldBlock(s)) => HandshakeProgress::MidHandshake(s),
            Err(HandshakeError::Failure(err)) => return Err(err).context(TlsHandshakeSnafu),
        })
    }
}

impl From<native_tls::TlsConnector> for TlsConnector {
    fn from(inner: native_tls::TlsConnector) -> TlsConnector {
        TlsConnector(inner)
    }
}

enum HandshakeProgress<S> {
    MidHandshake(MidHandshakeTlsStream<S>),
    Done(native_tls::TlsStream<S>),
}

/// TLS transport over TCP.
///
/// The handshake is driven to completion inside `connect`, on a private
/// poll; the event loop only ever sees the finished stream.
pub struct TlsTransport {
    connector: TlsConnector,
    /// Domain presented for certificate validation. Defaults to the
    /// endpoint host.
    domain: Option<String>,
}

impl TlsTransport {
    pub fn new() -> Result<TlsTransport> {
        let connector = native_tls::TlsConnector::new().context(TlsHandshakeSnafu)?;
        Ok(TlsTransport {
            connector: connector.into(),
            domain: None,
        })
    }

    pub fn with_connector(connector: TlsConnector) -> TlsTransport {
        TlsTransport {
            connector,
            domain: None,
        }
    }

    pub fn domain<T: Into<String>>(mut self, domain: T) -> TlsTransport {
        self.domain = Some(domain.into());
        self
    }
}

impl Transport for TlsTransport {
    type Stream = TlsStream<mio::net::TcpStream>;

    fn connect(
        &mut self,
        endpoint: &Endpoint,
        _sasl: &SaslConfig,
        timeout: Option<Duration>,
    ) -> Result<Self::Stream> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let tcp = open_tcp(endpoint, timeout)?;
        let domain = self.domain.as_deref().unwrap_or(&endpoint.host);
        let progress = self.connector.begin(domain, tcp)?;
        drive_handshake(progress, deadline)
    }
}

/// Pump a mid-handshake TLS stream until it completes, waiting on a private
/// poll whenever the socket would block.
fn drive_handshake<S>(
    mut progress: HandshakeProgress<S>,
    deadline: Option<Instant>,
) -> Result<TlsStream<S>>
where
    S: Evented + Read + Write + Send + 'static,
{
    const HANDSHAKE: Token = Token(0);

    let poll = Poll::new().context(IoSnafu)?;
    let mut events = Events::with_capacity(4);
    let mut registered = false;

    loop {
        let mid = match progress {
            HandshakeProgress::Done(s) => return Ok(TlsStream(s)),
            HandshakeProgress::MidHandshake(mid) => mid,
        };

        if !registered {
            poll.register(
                mid.get_ref(),
                HANDSHAKE,
                Ready::readable() | Ready::writable(),
                PollOpt::edge(),
            )
            .context(IoSnafu)?;
            registered = true;
        }

        let wait = match deadline {
            Some(deadline) => Some(
                deadline
                    .checked_duration_since(Instant::now())
                    .ok_or_else(|| ConnectTimeoutSnafu.build())?,
            ),
            None => None,
        };
        poll.poll(&mut events, wait).context(IoSnafu)?;
        if events.is_empty() {
            return ConnectTimeoutSnafu.fail();
        }

        progress = match mid.handshake() {
            Ok(s) => HandshakeProgress::Done(s),
            Err(HandshakeError::WouldBlock(s)) => HandshakeProgress::MidHandshake(s),
            Err(HandshakeError::Failure(err)) => return Err(err).context(TlsHandshakeSnafu),
        };
    }
}

pub struct TlsStream<S>(native_tls::TlsStream<S>);

impl<S: Evented + Read + Write + Send + 'static> IoStream for TlsStream<S> {}

impl<S: Read + Write> Read for TlsStream<S> {
    #[inline]
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf)
    }
}

impl<S: Read + Write> Write for TlsStream<S> {
    #[inline]
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    #[inline]
    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}

impl<S: Evented + Read + Write> Evented for TlsStream<S> {
    #[inline]
    fn register(
        &self,
        poll: &Poll,
        token: Token,
        interest: Ready,
        opts: PollOpt,
    ) -> io::Result<()> {
        self.0.get_ref().register(poll, token, interest, opts)
    }

    #[inline]
    fn reregister(
        &self,
        poll: &Poll,
        token: Token,
        interest: Ready,
        opts: PollOpt,
    ) -> io::Result<()> {
        self.0.get_ref().reregister(poll, token, interest, opts)
    }

    #[inline]
    fn deregister(&self, poll: &Poll) -> io::Result<()> {
        self.0.get_ref().deregister(poll)
    }
}
