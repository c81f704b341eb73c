//! Operating-mode state machine for node power management.
//!
//! Normal duty cycle:
//! RESET → ACTIVE → IDLE → LOW_POWER → WOKEN → ACTIVE → ...
//!
//! Any (mode, event) pair outside the transition table drops the node back
//! to RESET, from which the idle path re-initializes the hardware.

use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, warn};

/// Process-wide operating modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperatingMode {
    /// Power-on or fail-safe state; hardware must be re-initialized.
    #[default]
    Reset,
    /// Tasks are running.
    Active,
    /// All tasks finished their cycle; deep sleep may be entered.
    Idle,
    /// The MCU is in (or about to enter) a deep sleep level.
    LowPower,
    /// Woken from deep sleep, clocks and peripherals not yet restored.
    Woken,
}

/// Events driving operating-mode transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OpModeEvent {
    /// Initialization finished.
    Init,
    /// A timer or external wake source fired.
    Wakeup,
    /// The duty cycle completed.
    Done,
    /// Deep sleep entry sequence completed.
    Stopped,
    /// Clocks and peripherals restored after deep sleep.
    Restored,
}

impl fmt::Display for OperatingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reset => write!(f, "RESET"),
            Self::Active => write!(f, "ACTIVE"),
            Self::Idle => write!(f, "IDLE"),
            Self::LowPower => write!(f, "LOW_POWER"),
            Self::Woken => write!(f, "WOKEN"),
        }
    }
}

impl fmt::Display for OpModeEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Init => write!(f, "INIT"),
            Self::Wakeup => write!(f, "WAKEUP"),
            Self::Done => write!(f, "DONE"),
            Self::Stopped => write!(f, "STOPPED"),
            Self::Restored => write!(f, "RESTORED"),
        }
    }
}

impl OperatingMode {
    /// All modes, in table order.
    pub const ALL: [OperatingMode; 5] = [
        Self::Reset,
        Self::Active,
        Self::Idle,
        Self::LowPower,
        Self::Woken,
    ];

    /// Look up the successor of this mode for `event`.
    #[must_use]
    pub fn next(self, event: OpModeEvent) -> OperatingMode {
        use OpModeEvent::{Done, Init, Restored, Stopped, Wakeup};
        use OperatingMode::{Active, Idle, LowPower, Reset, Woken};

        match (self, event) {
            (Reset, Init) => Active,
            (Active | Idle, Wakeup) => Active,
            (Active | Idle, Done) => Idle,
            (Idle, Stopped) => LowPower,
            (LowPower | Woken, Wakeup) => Woken,
            (Woken, Restored) => Active,
            // Fail-safe: anything else forces the full reset path
            _ => Reset,
        }
    }

    /// Returns true if deep sleep may be entered from this mode.
    #[must_use]
    pub fn may_sleep(&self) -> bool {
        matches!(self, Self::Idle)
    }
}

impl OpModeEvent {
    /// All events, in table order.
    pub const ALL: [OpModeEvent; 5] = [
        Self::Init,
        Self::Wakeup,
        Self::Done,
        Self::Stopped,
        Self::Restored,
    ];
}

/// Mode holder with transition history tracking.
#[derive(Debug, Clone)]
pub struct ModeMachine {
    current: OperatingMode,
    previous: Option<OperatingMode>,
    transition_count: u64,
    fail_safe_count: u64,
}

impl Default for ModeMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl ModeMachine {
    /// Create a new machine starting in RESET.
    #[must_use]
    pub fn new() -> Self {
        Self {
            current: OperatingMode::Reset,
            previous: None,
            transition_count: 0,
            fail_safe_count: 0,
        }
    }

    /// Get the current mode.
    #[must_use]
    pub fn mode(&self) -> OperatingMode {
        self.current
    }

    /// Get the mode before the last event (if any event was applied).
    #[must_use]
    pub fn previous_mode(&self) -> Option<OperatingMode> {
        self.previous
    }

    /// Get the total number of applied events.
    #[must_use]
    pub fn transition_count(&self) -> u64 {
        self.transition_count
    }

    /// Number of times an unexpected event forced the machine to RESET.
    #[must_use]
    pub fn fail_safe_count(&self) -> u64 {
        self.fail_safe_count
    }

    /// Apply an event and return the new mode.
    pub fn apply(&mut self, event: OpModeEvent) -> OperatingMode {
        let from = self.current;
        let to = from.next(event);

        if to == OperatingMode::Reset && from != OperatingMode::Reset {
            self.fail_safe_count += 1;
            warn!(%from, %event, "unexpected event, falling back to RESET");
        } else if to != from {
            debug!(%from, %to, %event, "operating mode transition");
        }

        self.previous = Some(from);
        self.current = to;
        self.transition_count += 1;
        to
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use OpModeEvent::{Done, Init, Restored, Stopped, Wakeup};
    use OperatingMode::{Active, Idle, LowPower, Reset, Woken};

    #[test]
    fn test_full_transition_table() {
        // Rows: modes in ALL order, columns: events in ALL order
        let table = [
            [Active, Reset, Reset, Reset, Reset],
            [Reset, Active, Idle, Reset, Reset],
            [Reset, Active, Idle, LowPower, Reset],
            [Reset, Woken, Reset, Reset, Reset],
            [Reset, Woken, Reset, Reset, Active],
        ];

        for (row, mode) in OperatingMode::ALL.iter().enumerate() {
            for (col, event) in OpModeEvent::ALL.iter().enumerate() {
                assert_eq!(
                    mode.next(*event),
                    table[row][col],
                    "{mode} on {event}"
                );
            }
        }
    }

    #[test]
    fn test_duty_cycle_sequence() {
        let mut machine = ModeMachine::new();
        assert_eq!(machine.mode(), Reset);

        assert_eq!(machine.apply(Init), Active);
        assert_eq!(machine.apply(Done), Idle);
        assert_eq!(machine.apply(Stopped), LowPower);
        assert_eq!(machine.apply(Wakeup), Woken);
        assert_eq!(machine.apply(Restored), Active);
        assert_eq!(machine.transition_count(), 5);
        assert_eq!(machine.fail_safe_count(), 0);
    }

    #[test]
    fn test_unexpected_event_resets() {
        let mut machine = ModeMachine::new();
        machine.apply(Init);

        assert_eq!(machine.apply(Stopped), Reset);
        assert_eq!(machine.previous_mode(), Some(Active));
        assert_eq!(machine.fail_safe_count(), 1);

        // Re-initialization is possible from RESET
        assert_eq!(machine.apply(Init), Active);
    }

    #[test]
    fn test_wakeup_in_active_is_stable() {
        let mut machine = ModeMachine::new();
        machine.apply(Init);
        assert_eq!(machine.apply(Wakeup), Active);
        assert_eq!(machine.apply(Wakeup), Active);
    }

    #[test]
    fn test_only_idle_may_sleep() {
        for mode in OperatingMode::ALL {
            assert_eq!(mode.may_sleep(), mode == Idle);
        }
    }
}
