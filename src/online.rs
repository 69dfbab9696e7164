//! Carrier/DCD tracking: is the line up, and for how long.
//!
//! Grounded on `original_source/src/main.c`'s `timer_update` and
//! `update_status_time`: a socket or a line with DCD support goes
//! online/offline on carrier state, anything else is driven by a
//! manually-toggled "bogus DCD" flag. A transition to offline while
//! `log_connections` is set emits a "Gone offline (H:MM:SS)" line,
//! matching the original's call-duration log entry.
use std::time::{Duration, Instant};

use tracing::info;

/// Outcome of a single `tick`: whether a transition happened this
/// tick, worth surfacing to the status line and the connection log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    None,
    WentOnline,
    WentOffline,
}

pub struct OnlineTracker {
    /// True for sockets, or serial lines with `has_dcd` set: real
    /// hardware carrier detection drives the state. Otherwise the
    /// state is whatever `set_bogus_dcd` last said.
    dcd_support: bool,
    dcd_drives_flow: bool,
    log_connections: bool,
    bogus_dcd: bool,
    since: Option<Instant>,
    last_duration: Option<Duration>,
}

impl OnlineTracker {
    pub fn new(dcd_support: bool, dcd_drives_flow: bool, log_connections: bool) -> Self {
        OnlineTracker {
            dcd_support,
            dcd_drives_flow,
            log_connections,
            bogus_dcd: false,
            since: None,
            last_duration: None,
        }
    }

    /// Manually flips the carrier flag on endpoints with no real DCD
    /// line (e.g. a plain socket endpoint with `has_dcd` left unset).
    pub fn set_bogus_dcd(&mut self, up: bool) {
        self.bogus_dcd = up;
    }

    pub fn is_online(&self) -> bool {
        self.since.is_some()
    }

    /// Elapsed online time, or the duration of the most recently
    /// completed call if currently offline (for the `%t` directive,
    /// which keeps showing the last call length while offline).
    pub fn elapsed(&self) -> Duration {
        match self.since {
            Some(start) => Instant::now().saturating_duration_since(start),
            None => self.last_duration.unwrap_or_default(),
        }
    }

    /// Advances the tracker with the current carrier reading
    /// (`dcd_high` is ignored unless `dcd_support` is set, in which
    /// case it stands in for `m_getdcd`). Returns whether a transition
    /// happened, logging the call duration on going offline.
    pub fn tick(&mut self, dcd_high: bool) -> Transition {
        let carrier_up = if self.dcd_support { dcd_high } else { self.bogus_dcd };

        if carrier_up {
            if self.since.is_none() {
                self.since = Some(Instant::now());
                return Transition::WentOnline;
            }
            Transition::None
        } else if let Some(start) = self.since.take() {
            let duration = Instant::now().saturating_duration_since(start);
            self.last_duration = Some(duration);
            if self.log_connections {
                let secs = duration.as_secs();
                info!(
                    "Gone offline ({}:{:02}:{:02})",
                    secs / 3600,
                    (secs / 60) % 60,
                    secs % 60
                );
            }
            Transition::WentOffline
        } else {
            Transition::None
        }
    }

    /// Whether hardware flow control should currently be asserted,
    /// for callers wiring DCD into RTS/CTS the way the original's
    /// `_DCDFLOW` branch did. Only meaningful when `dcd_drives_flow`
    /// was configured.
    pub fn flow_control_should_be_on(&self) -> bool {
        self.dcd_drives_flow && self.is_online()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn bogus_dcd_drives_state_without_hardware_support() {
        let mut tracker = OnlineTracker::new(false, false, false);
        assert!(!tracker.is_online());

        tracker.set_bogus_dcd(true);
        assert_eq!(tracker.tick(false), Transition::WentOnline);
        assert!(tracker.is_online());

        tracker.set_bogus_dcd(false);
        assert_eq!(tracker.tick(false), Transition::WentOffline);
        assert!(!tracker.is_online());
    }

    #[test]
    fn hardware_dcd_drives_state_when_supported() {
        let mut tracker = OnlineTracker::new(true, false, false);
        assert_eq!(tracker.tick(true), Transition::WentOnline);
        assert_eq!(tracker.tick(true), Transition::None);
        assert_eq!(tracker.tick(false), Transition::WentOffline);
    }

    #[test]
    fn elapsed_survives_into_offline_as_last_call_duration() {
        let mut tracker = OnlineTracker::new(true, false, false);
        tracker.tick(true);
        std::thread::sleep(Duration::from_millis(5));
        tracker.tick(false);
        assert!(tracker.elapsed() >= Duration::from_millis(5));
    }

    #[test]
    fn flow_control_tracks_online_state_only_when_configured() {
        let mut tracker = OnlineTracker::new(true, true, false);
        assert!(!tracker.flow_control_should_be_on());
        tracker.tick(true);
        assert!(tracker.flow_control_should_be_on());

        let mut unconfigured = OnlineTracker::new(true, false, false);
        unconfigured.tick(true);
        assert!(!unconfigured.flow_control_should_be_on());
    }
}
