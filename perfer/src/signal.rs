//! Process-level signal handling.
//!
//! Signals never reach workers directly: the listener below only sets the
//! shared stop flag, exactly as the orchestrator itself does.

use std::{io, sync::Arc};

use crate::context::RunContext;

/// Ignores SIGPIPE, so that writing to a socket closed by the peer fails
/// with `EPIPE` instead of terminating the process.
pub fn ignore_sigpipe() {
    #[cfg(unix)]
    {
        // SAFETY: installing `SIG_IGN` has no preconditions and does not
        // race with any handler of ours.
        unsafe {
            libc::signal(libc::SIGPIPE, libc::SIG_IGN);
        }
    }
}

/// Waits for an interrupt or terminate request, then stops the run.
pub async fn stop_on_signal(ctx: Arc<RunContext>) -> io::Result<()> {
    let name = wait().await?;
    log::warn!("{name} received, stopping");
    ctx.stop();

    Ok(())
}

#[cfg(unix)]
async fn wait() -> io::Result<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut int = signal(SignalKind::interrupt())?;
    let mut term = signal(SignalKind::terminate())?;

    let name = tokio::select! {
        _ = int.recv() => "SIGINT",
        _ = term.recv() => "SIGTERM",
    };

    Ok(name)
}

#[cfg(not(unix))]
async fn wait() -> io::Result<&'static str> {
    tokio::signal::ctrl_c().await?;

    Ok("Ctrl-C")
}
