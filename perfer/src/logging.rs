use log::{LevelFilter, SetLoggerError};
use simple_logger::SimpleLogger;

/// Initializes the global logger.
///
/// Log records go to stderr, leaving stdout to the report. Only records of
/// this crate pass, at a level raised by each `-v`.
pub fn init(verbosity: u8) -> Result<(), SetLoggerError> {
    let level = match verbosity {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };

    SimpleLogger::new()
        .with_level(LevelFilter::Off)
        .with_module_level("perfer", level)
        .with_utc_timestamps()
        .init()
}
