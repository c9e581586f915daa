// Copyright 2026 Hybrid Mount Developers
// SPDX-License-Identifier: GPL-3.0-or-later

use std::thread;

use anyhow::{Context, Result};
use nix::sys::signal::{SigSet, Signal};

pub fn termination_set() -> SigSet {
    let mut set = SigSet::empty();
    for signal in [
        Signal::SIGHUP,
        Signal::SIGINT,
        Signal::SIGTERM,
        Signal::SIGQUIT,
    ] {
        set.add(signal);
    }
    set
}

/// Blocks the termination set on the calling thread; threads spawned later
/// inherit the mask.
pub fn block_termination() -> Result<()> {
    termination_set()
        .thread_block()
        .context("Failed to block termination signals")
}

/// Runs `on_signal` then exits 0 on the first hangup/interrupt/terminate/quit.
///
/// Must be called before any other thread is spawned so the blocked mask is
/// inherited everywhere.
pub fn install<F>(on_signal: F) -> Result<()>
where
    F: FnOnce() + Send + 'static,
{
    let set = termination_set();
    set.thread_block()
        .context("Failed to block termination signals")?;

    thread::Builder::new()
        .name("signals".to_string())
        .spawn(move || match set.wait() {
            Ok(signal) => {
                tracing::info!(signal = %signal, "termination_signal");
                on_signal();
                std::process::exit(0);
            }
            Err(e) => tracing::error!(error = %e, "signal_wait_failed"),
        })
        .context("Failed to spawn signal thread")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn covers_termination_signals() {
        let set = termination_set();
        assert!(set.contains(Signal::SIGTERM));
        assert!(set.contains(Signal::SIGQUIT));
        assert!(set.contains(Signal::SIGHUP));
        assert!(set.contains(Signal::SIGINT));
        assert!(!set.contains(Signal::SIGUSR1));
    }
}
