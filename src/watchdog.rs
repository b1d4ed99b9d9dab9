//! The Sink Watchdog: a background thread that samples sink occupancy and
//! asks the Supervisor for a drain-and-restart before the hardware buffer
//! wraps.

use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;

use crate::log::{LogDebug, LogWarn};
use crate::session::Shared;

const POLL_INTERVAL: Duration = Duration::from_millis(5);

fn target_alive(pid: Pid) -> bool {
    match signal::kill(pid, None) {
        Ok(()) => true,
        Err(nix::Error::Sys(nix::errno::Errno::ESRCH)) => false,
        Err(_) => true,
    }
}

/// Runs until `pid` no longer exists. Intended to be spawned on its own
/// thread and joined by the Supervisor once the target is gone (one-shot
/// mode) or between runs (forkserver mode).
pub fn run(shared: Arc<Shared>, pid: Pid, threshold: f64) {
    while target_alive(pid) {
        let mut session = match shared.session.lock() {
            Ok(g) => g,
            Err(_) => {
                crate::fatal!("session mutex poisoned in watchdog");
            }
        };

        if !session.config().polling || !session.started() {
            drop(session);
            std::thread::sleep(POLL_INTERVAL);
            continue;
        }

        let base = session.udmabuf().phys_addr;
        let sink = match session.controller_mut().sink_state() {
            Ok(s) => s,
            Err(e) => {
                crate::log!(LogWarn, "sink_state failed in watchdog: {}", e);
                drop(session);
                std::thread::sleep(POLL_INTERVAL);
                continue;
            }
        };

        let remaining = base as f64 + sink.depth as f64 - sink.rwp as f64;
        let low_water = sink.depth as f64 * (1.0 - threshold);

        if sink.depth > 0 && remaining < low_water {
            crate::log!(
                LogDebug,
                "sink occupancy over threshold ({} remaining of {}), requesting drain",
                remaining as u64,
                sink.depth
            );
            if signal::kill(pid, Some(Signal::SIGSTOP)).is_err() {
                drop(session);
                continue;
            }
            let _ = shared
                .drained
                .wait_timeout(session, Duration::from_secs(5))
                .unwrap_or_else(|e| e.into_inner());
        } else {
            drop(session);
            std::thread::sleep(POLL_INTERVAL);
        }
    }
}
