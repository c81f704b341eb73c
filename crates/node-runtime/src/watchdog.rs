//! Board watchdog.
//!
//! The attached board is expected to raise the time-request line regularly.
//! If it stays silent for longer than the watchdog window while it is
//! enabled, it is considered hung and gets power-cycled.
//!
//! The window restarts whenever a request arrives, whenever the board is
//! found disabled, and after every trigger.

use std::time::Duration;
use tracing::warn;

/// Request-silence detector for the attached board.
#[derive(Debug, Clone, Copy)]
pub struct BoardWatchdog {
    /// Window length in ticks, 0 = disabled.
    window_ticks: u64,
    /// Start of the current window.
    reference_tick: u64,
}

impl BoardWatchdog {
    /// Create a watchdog whose first window starts at `now_tick`.
    #[must_use]
    pub fn new(window: Duration, tick_frequency_hz: u64, now_tick: u64) -> Self {
        let ticks = window.as_micros() * u128::from(tick_frequency_hz) / 1_000_000;
        Self {
            window_ticks: u64::try_from(ticks).unwrap_or(u64::MAX),
            reference_tick: now_tick,
        }
    }

    /// Returns true if the watchdog is active.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.window_ticks > 0
    }

    /// Evaluate the watchdog.
    ///
    /// Returns true if the board must be power-cycled now.
    pub fn check(
        &mut self,
        now_tick: u64,
        board_enabled: bool,
        last_request_tick: Option<u64>,
    ) -> bool {
        if !self.is_enabled() {
            return false;
        }
        if let Some(request) = last_request_tick {
            self.reference_tick = self.reference_tick.max(request);
        }
        if !board_enabled {
            self.reference_tick = now_tick;
            return false;
        }

        let silent = now_tick.saturating_sub(self.reference_tick);
        if silent <= self.window_ticks {
            return false;
        }

        warn!(
            silent_ticks = silent,
            window_ticks = self.window_ticks,
            "no time request from board within watchdog window"
        );
        self.reference_tick = now_tick;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HZ: u64 = 10;

    fn watchdog() -> BoardWatchdog {
        BoardWatchdog::new(Duration::from_secs(120), HZ, 0)
    }

    #[test]
    fn test_triggers_after_silent_window() {
        let mut wd = watchdog();
        assert!(!wd.check(1_200, true, None));
        assert!(wd.check(1_201, true, None));

        // Window restarted after the trigger
        assert!(!wd.check(1_300, true, None));
    }

    #[test]
    fn test_request_restarts_window() {
        let mut wd = watchdog();
        assert!(!wd.check(1_500, true, Some(1_000)));
        assert!(wd.check(2_201, true, Some(1_000)));
    }

    #[test]
    fn test_disabled_board_is_ignored() {
        let mut wd = watchdog();
        assert!(!wd.check(5_000, false, None));
        // Board just came up, the window starts now
        assert!(!wd.check(5_100, true, None));
    }

    #[test]
    fn test_zero_window_disables() {
        let mut wd = BoardWatchdog::new(Duration::ZERO, HZ, 0);
        assert!(!wd.is_enabled());
        assert!(!wd.check(u64::MAX, true, None));
    }
}
