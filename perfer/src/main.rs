use anyhow::{Context, Error};
use clap::Parser;
use perfer::{cfg::Config, cmd::Cmd, runtime::Runtime, signal};
use tokio::runtime::Builder;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: jemallocator::Jemalloc = jemallocator::Jemalloc;

pub fn main() {
    let cmd = Cmd::parse();
    if let Err(err) = perfer::logging::init(cmd.verbose) {
        eprintln!("ERROR: failed to initialize logging: {err}");
        std::process::exit(1);
    }

    if let Err(err) = run(cmd) {
        eprintln!("ERROR: {err:#}");
        std::process::exit(1);
    }
}

fn run(cmd: Cmd) -> Result<(), Error> {
    let json = cmd.json;
    let cfg: Config = cmd.try_into().context("invalid configuration, see --help for usage")?;

    signal::ignore_sigpipe();

    let outcome = Builder::new_current_thread()
        .enable_io()
        .enable_time()
        .thread_name("runtime")
        .build()?
        .block_on(async {
            let runtime = Runtime::new(cfg);
            let signals = tokio::spawn(signal::stop_on_signal(runtime.context()));

            let outcome = runtime.run().await;
            signals.abort();

            outcome
        })?;

    if json {
        println!("{}", serde_json::to_string_pretty(&outcome.summary)?);
    } else {
        println!("{}", outcome.summary);
    }

    match outcome.error {
        Some(err) => Err(err).context("run aborted"),
        None => Ok(()),
    }
}
