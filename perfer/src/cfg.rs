use core::{
    fmt::{self, Display, Formatter},
    num::NonZero,
    str::FromStr,
    time::Duration,
};
use std::{
    io,
    net::{SocketAddr, ToSocketAddrs},
};

use crate::{error::Error, request::RequestTemplate};

/// Maximum number of requests tracked per connection.
///
/// The backlog must stay strictly below this value.
pub const PIPELINE_SIZE: usize = 16;
/// Port used when the target address has none.
pub const DEFAULT_PORT: u16 = 80;
/// Default grace period for draining in-flight requests.
pub const DEFAULT_GRACE: Duration = Duration::from_secs(2);

/// Run configuration.
///
/// Immutable once built and shared by reference across all workers.
#[derive(Debug, Clone)]
pub struct Config {
    /// Target endpoint.
    pub target: Target,
    /// URL path, without the leading slash.
    ///
    /// Only used for reporting when the request was loaded from a file.
    pub path: String,
    /// Request to send.
    pub request: RequestTemplate,
    /// When to stop sending.
    pub limit: Limit,
    /// Number of worker threads.
    pub threads: NonZero<usize>,
    /// Number of connections per thread.
    pub connections: NonZero<usize>,
    /// Maximum number of in-flight requests per connection.
    pub backlog: usize,
    /// Whether connections are reused across requests.
    pub keep_alive: bool,
    /// Enable TCP_NODELAY socket option.
    pub tcp_no_delay: bool,
    /// How long in-flight requests are awaited once sending stops.
    pub grace: Duration,
}

/// How the request is obtained.
#[derive(Debug, Clone)]
pub enum RequestSource {
    /// Generate a `GET` request for this path with the given extra header
    /// lines.
    Path { path: String, headers: Vec<String> },
    /// Literal request bytes, sent as-is.
    Literal(RequestTemplate),
}

/// Run limit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Limit {
    /// Send requests for the given time.
    Duration(Duration),
    /// Send the given total number of requests, split across threads.
    Requests(NonZero<u64>),
}

impl Config {
    /// Validates the given settings and builds the configuration.
    ///
    /// The backlog is forced to 1 when keep-alive is disabled.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        target: Target,
        source: RequestSource,
        limit: Limit,
        threads: NonZero<usize>,
        connections: NonZero<usize>,
        backlog: usize,
        keep_alive: bool,
        tcp_no_delay: bool,
    ) -> Result<Self, Error> {
        if backlog == 0 || backlog >= PIPELINE_SIZE {
            return Err(Error::Config(format!(
                "'{backlog}' is not a valid backlog number, must be in [1; {}]",
                PIPELINE_SIZE - 1
            )));
        }

        match limit {
            Limit::Duration(d) if d.is_zero() => {
                return Err(Error::Config("duration must be positive".into()));
            }
            Limit::Requests(n) if n.get() < threads.get() as u64 => {
                return Err(Error::Config(format!(
                    "number of requests ({n}) must not be less than the number of threads ({threads})"
                )));
            }
            _ => {}
        }

        let (path, request) = match source {
            RequestSource::Path { path, headers } => {
                if let Some(h) = headers.iter().find(|h| h.contains(['\r', '\n'])) {
                    return Err(Error::Config(format!("header line {h:?} must not contain line breaks")));
                }

                let path = path.strip_prefix('/').unwrap_or(&path).to_string();
                let request = RequestTemplate::generate(&path, target.as_str(), keep_alive, &headers);

                (path, request)
            }
            RequestSource::Literal(request) => {
                if request.is_empty() {
                    return Err(Error::Config("request must not be empty".into()));
                }

                (String::new(), request)
            }
        };

        let backlog = if keep_alive { backlog } else { 1 };

        let m = Self {
            target,
            path,
            request,
            limit,
            threads,
            connections,
            backlog,
            keep_alive,
            tcp_no_delay,
            grace: DEFAULT_GRACE,
        };

        Ok(m)
    }

    #[inline]
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Returns the number of requests each worker must send, or zero in
    /// duration mode.
    ///
    /// The total is truncated to a multiple of the number of threads.
    #[inline]
    pub fn requests_per_worker(&self) -> u64 {
        match self.limit {
            Limit::Duration(..) => 0,
            Limit::Requests(n) => n.get() / self.threads.get() as u64,
        }
    }

    /// Returns the configured run duration, if any.
    #[inline]
    pub fn duration(&self) -> Option<Duration> {
        match self.limit {
            Limit::Duration(d) => Some(d),
            Limit::Requests(..) => None,
        }
    }
}

/// Target endpoint in the `host[:port]` form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    /// Address as given, also used as the `Host` header value.
    raw: String,
    host: String,
    port: u16,
}

impl Target {
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Resolves this target, returning the first address found.
    pub fn resolve(&self) -> Result<SocketAddr, Error> {
        let map_err = |err| Error::Resolve { addr: self.raw.clone(), err };

        (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(map_err)?
            .next()
            .ok_or_else(|| map_err(io::Error::new(io::ErrorKind::NotFound, "no addresses found")))
    }
}

impl FromStr for Target {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || Error::Config(format!("'{s}' is not a valid server address"));

        let (host, port) = if let Some(rest) = s.strip_prefix('[') {
            // Bracketed IPv6 literal, optionally followed by a port.
            let (host, rest) = rest.split_once(']').ok_or_else(invalid)?;
            match rest {
                "" => (host, None),
                rest => (host, Some(rest.strip_prefix(':').ok_or_else(invalid)?)),
            }
        } else {
            match s.split_once(':') {
                Some((host, port)) => (host, Some(port)),
                None => (s, None),
            }
        };

        if host.is_empty() {
            return Err(invalid());
        }
        let port = match port {
            Some(port) => port.parse().map_err(|_| invalid())?,
            None => DEFAULT_PORT,
        };

        let m = Self {
            raw: s.to_string(),
            host: host.to_string(),
            port,
        };

        Ok(m)
    }
}

impl Display for Target {
    fn fmt(&self, fmt: &mut Formatter) -> Result<(), fmt::Error> {
        fmt.write_str(&self.raw)
    }
}
