//! HTTP benchmarking engine.
//!
//! Saturates a server with requests from multiple worker threads, each
//! multiplexing several non-blocking connections with bounded pipelining,
//! and reports throughput, latency and failure counts.

pub mod cfg;
pub mod cmd;
pub mod context;
pub mod error;
mod histogram;
pub mod logging;
pub mod report;
pub mod request;
pub mod runtime;
pub mod signal;
mod stat;
mod worker;

pub use self::{
    cfg::Config,
    error::Error,
    report::Summary,
    runtime::{Outcome, Runtime},
};
