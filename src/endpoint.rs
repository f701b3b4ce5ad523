use crate::errors::*;
use std::fmt;

/// One remote address a connection may be established to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    /// True for `amqps://` endpoints; consumed by the transport adapter.
    pub tls: bool,
}

impl Endpoint {
    pub fn new<T: Into<String>>(host: T, port: u16) -> Endpoint {
        Endpoint {
            host: host.into(),
            port,
            tls: false,
        }
    }

    pub fn with_tls(mut self) -> Endpoint {
        self.tls = true;
        self
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// An ordered set of failover candidates with a designated primary.
///
/// Exactly one candidate is current at any time. The cursor only moves
/// between connection attempts (the event loop never switches endpoints
/// while a transport is live), wrapping round-robin back to the primary.
#[derive(Clone, Debug)]
pub struct EndpointSet {
    endpoints: Vec<Endpoint>,
    current: usize,
}

impl EndpointSet {
    /// Build a set from a primary and zero or more backups. Fails with
    /// [`Error::NoEndpoints`] only via [`EndpointSet::from_list`].
    pub fn new(primary: Endpoint, backups: Vec<Endpoint>) -> EndpointSet {
        let mut endpoints = vec![primary];
        endpoints.extend(backups);
        EndpointSet {
            endpoints,
            current: 0,
        }
    }

    pub fn from_list(endpoints: Vec<Endpoint>) -> Result<EndpointSet> {
        if endpoints.is_empty() {
            return NoEndpointsSnafu.fail();
        }
        Ok(EndpointSet {
            endpoints,
            current: 0,
        })
    }

    pub fn current(&self) -> &Endpoint {
        &self.endpoints[self.current]
    }

    /// Advance to the next candidate, wrapping to the primary.
    pub fn advance(&mut self) {
        self.current = (self.current + 1) % self.endpoints.len();
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_list_rejected() {
        match EndpointSet::from_list(Vec::new()).unwrap_err() {
            Error::NoEndpoints => (),
            err => panic!("unexpected error {}", err),
        }
    }

    #[test]
    fn round_robin_wraps_to_primary() {
        let mut set = EndpointSet::new(
            Endpoint::new("primary", 5672),
            vec![Endpoint::new("backup1", 5672), Endpoint::new("backup2", 5673)],
        );
        assert_eq!(set.current().host, "primary");
        set.advance();
        assert_eq!(set.current().host, "backup1");
        set.advance();
        assert_eq!(set.current().host, "backup2");
        set.advance();
        assert_eq!(set.current().host, "primary");
    }

    #[test]
    fn display_is_host_port() {
        assert_eq!(Endpoint::new("broker", 5671).to_string(), "broker:5671");
    }
}
