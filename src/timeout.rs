//! Deadlines and a one-second ticker, replacing the original's
//! `SIGALRM` + `setjmp`/`longjmp` timeout model with something a Rust
//! event loop can poll cooperatively.
//!
//! This is the one place spec.md explicitly calls out as a redesign:
//! the teacher's own event loop (`cargo-rtic-scope/src/main.rs::run_loop`)
//! already favors a `crossbeam_channel::select!` over signal-driven
//! control flow, so the same shape is used here instead of `signal()`
//! + `longjmp`.
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError};

/// An absolute point in time a caller can poll against, replacing a
/// `setjmp`/`SIGALRM` pair. `Instant`-based rather than wall-clock, so
/// it's immune to clock adjustments.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    at: Instant,
}

impl Deadline {
    pub fn after(duration: Duration) -> Self {
        Deadline {
            at: Instant::now() + duration,
        }
    }

    /// A deadline that is always already expired, for call sites that
    /// want to poll a condition once with no actual wait budget.
    pub fn immediate() -> Self {
        Deadline { at: Instant::now() }
    }

    pub fn expired(&self) -> bool {
        Instant::now() >= self.at
    }

    pub fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }
}

/// The device-open alarm from `open_term` (`alarm(20)`): a single,
/// one-shot deadline covering the whole open attempt. Unrelated to
/// either script timeout below; it only ever bounds `Endpoint::open`.
pub const OPEN_ALARM: Duration = Duration::from_secs(20);

/// `DFL_GTIMEOUT`: the script global timeout before `timeout("gtime", …)`
/// narrows it, one hour.
pub const DEFAULT_GLOBAL_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// `DFL_ETIMEOUT`: the per-`expect()` timeout before `timeout("etime", …)`
/// narrows it, two minutes.
pub const DEFAULT_EXPECT_TIMEOUT: Duration = Duration::from_secs(120);

/// A background thread ticking once a second, used to drive
/// `timer_update`-equivalent work (status line refresh, online timer)
/// without the event loop having to compute its own sleep budget by
/// hand. Dropping the `Ticker` stops the thread on its next tick.
pub struct Ticker {
    rx: Receiver<()>,
    _stop: crossbeam_channel::Sender<()>,
}

impl Ticker {
    pub fn start(period: Duration) -> Self {
        let (tx, rx) = bounded(1);
        let (stop_tx, stop_rx) = bounded::<()>(0);
        std::thread::spawn(move || loop {
            match stop_rx.recv_timeout(period) {
                // A stop signal, or the stop sender being dropped along
                // with the Ticker, both mean: exit.
                Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
                Err(RecvTimeoutError::Timeout) => {
                    let _ = tx.try_send(());
                }
            }
        });
        Ticker { rx, _stop: stop_tx }
    }

    pub fn receiver(&self) -> &Receiver<()> {
        &self.rx
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn deadline_expires_after_duration() {
        let d = Deadline::after(Duration::from_millis(5));
        assert!(!d.expired());
        std::thread::sleep(Duration::from_millis(15));
        assert!(d.expired());
    }

    #[test]
    fn immediate_deadline_is_already_expired() {
        assert!(Deadline::immediate().expired());
    }

    #[test]
    fn ticker_fires() {
        let ticker = Ticker::start(Duration::from_millis(5));
        let got = ticker
            .receiver()
            .recv_timeout(Duration::from_millis(200))
            .is_ok();
        assert!(got);
    }
}
