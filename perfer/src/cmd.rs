use core::{num::NonZero, time::Duration};
use std::{fs, path::PathBuf};

use clap::{ArgAction, Parser};

use crate::{
    cfg::{Config, Limit, RequestSource, Target, PIPELINE_SIZE},
    error::Error,
    request::RequestTemplate,
};

/// Saturate a web server with HTTP requests while tracking the number of
/// requests, latency, and throughput.
///
/// After the duration specified no more requests are sent and the
/// application terminates when all responses have been received or the grace
/// period expires, whichever is sooner.
#[derive(Debug, Clone, Parser)]
#[command(version, about)]
pub struct Cmd {
    /// Address of the server to send requests to, as host[:port].
    #[clap(required = true)]
    pub addr: String,
    /// Duration in seconds for the run.
    ///
    /// Positive decimal values are accepted.
    #[clap(short, long, conflicts_with = "number")]
    pub duration: Option<f64>,
    /// Number of requests to send.
    ///
    /// The value will be rounded down to a multiple of the number of threads.
    #[clap(short, long)]
    pub number: Option<NonZero<u64>>,
    /// Number of threads to use for sending requests.
    #[clap(short, long, default_value_t = NonZero::<usize>::MIN)]
    pub threads: NonZero<usize>,
    /// Number of connections to use for sending requests for each thread.
    #[clap(short, long, default_value_t = NonZero::<usize>::MIN)]
    pub connections: NonZero<usize>,
    /// Maximum backlog for pipeline on a connection.
    ///
    /// Ignored unless keep-alive is enabled.
    #[clap(short, long, default_value_t = PIPELINE_SIZE - 1)]
    pub backlog: usize,
    /// URL path of the HTTP request.
    #[clap(short, long, default_value = "index.html", conflicts_with = "request")]
    pub path: String,
    /// File with the full content of the HTTP request.
    ///
    /// Each "${sequence}" in it is replaced with a unique increasing number.
    /// The keep-alive option does not affect the request content then.
    #[clap(short, long, value_name = "FILE")]
    pub request: Option<PathBuf>,
    /// Keep connections alive instead of closing.
    #[clap(short, long)]
    pub keep_alive: bool,
    /// Add an HTTP header field with name and value, as "name: value".
    #[clap(short = 'a', long = "add", value_name = "HEADER")]
    pub headers: Vec<String>,
    /// Enable TCP_NODELAY socket option.
    #[clap(long)]
    pub tcp_no_delay: bool,
    /// Seconds to wait for in-flight requests after sending stops.
    #[clap(long, default_value_t = 2.0)]
    pub grace: f64,
    /// Print the results as JSON.
    #[clap(long)]
    pub json: bool,
    /// Be verbose in terms of logging.
    #[clap(short, action = ArgAction::Count)]
    pub verbose: u8,
}

impl TryFrom<Cmd> for Config {
    type Error = Error;

    fn try_from(cmd: Cmd) -> Result<Self, Self::Error> {
        let Cmd {
            addr,
            duration,
            number,
            threads,
            connections,
            backlog,
            path,
            request,
            keep_alive,
            headers,
            tcp_no_delay,
            grace,
            ..
        } = cmd;

        let target: Target = addr.parse()?;

        let limit = match (number, duration) {
            (Some(n), _) => Limit::Requests(n),
            (None, d) => Limit::Duration(seconds(d.unwrap_or(1.0), "duration")?),
        };

        let source = match request {
            Some(path) => {
                let data = fs::read(&path).map_err(|err| Error::RequestFile { path, err })?;
                RequestSource::Literal(RequestTemplate::literal(data))
            }
            None => RequestSource::Path { path, headers },
        };

        let grace = seconds(grace, "grace period")?;

        let cfg = Config::new(target, source, limit, threads, connections, backlog, keep_alive, tcp_no_delay)?
            .with_grace(grace);

        Ok(cfg)
    }
}

fn seconds(v: f64, name: &str) -> Result<Duration, Error> {
    Duration::try_from_secs_f64(v).map_err(|_| Error::Config(format!("'{v}' is not a valid {name}")))
}
