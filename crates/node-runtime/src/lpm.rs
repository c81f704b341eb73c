//! Low-power manager.
//!
//! Owns the operating-mode machine and drives the [`LowPowerDriver`] from
//! its transitions:
//!
//! - `Wakeup` always runs [`PowerManager::resume`], which is a no-op unless
//!   something is actually suspended, so it can be called from interrupt
//!   context at any time.
//! - Deep sleep is only entered from `Idle`. The radio is put to sleep first,
//!   then the tick is stopped and the driver enters the configured level, all
//!   inside one critical section.
//! - A clock that fails to lock on resume is fatal and resets the MCU.
//!
//! The manager also meters how much of the wall time the CPU spends awake.

use crate::hal::{HardwareError, LowPowerDriver, TickSource};
use critical_section::Mutex;
use node_common::config::LowPowerMode;
use node_common::state::{ModeMachine, OpModeEvent, OperatingMode};
use std::cell::RefCell;
use std::sync::Arc;
use tracing::{debug, error, trace};

/// What the idle path did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SleepEntry {
    /// The node is not idle; nothing was suspended.
    Skipped,
    /// Only the tick was suspended (light sleep).
    Light,
    /// The deep-sleep sequence ran and the mode is now `LowPower`.
    Deep(LowPowerMode),
}

/// Active / sleeping tick accounting.
#[derive(Debug, Clone, Copy, Default)]
struct DutyMeter {
    active_ticks: u64,
    sleep_ticks: u64,
    awake_since: u64,
    asleep_since: Option<u64>,
}

impl DutyMeter {
    fn pre_sleep(&mut self, now: u64) {
        if self.asleep_since.is_none() {
            self.active_ticks += now.saturating_sub(self.awake_since);
            self.asleep_since = Some(now);
        }
    }

    fn post_sleep(&mut self, now: u64) {
        if let Some(since) = self.asleep_since.take() {
            self.sleep_ticks += now.saturating_sub(since);
            self.awake_since = now;
        }
    }

    fn permyriad(&self) -> u16 {
        let total = self.active_ticks + self.sleep_ticks;
        if total == 0 {
            return 10_000;
        }
        let share = u128::from(self.active_ticks) * 10_000 / u128::from(total);
        u16::try_from(share).unwrap_or(10_000)
    }
}

#[derive(Debug)]
struct LpmState {
    machine: ModeMachine,
    tick_suspended: bool,
    meter: DutyMeter,
}

/// Operating-mode state machine bound to the low-power driver.
pub struct PowerManager {
    state: Mutex<RefCell<LpmState>>,
    driver: Mutex<RefCell<Box<dyn LowPowerDriver>>>,
    ticks: Arc<dyn TickSource>,
    low_power_mode: LowPowerMode,
}

impl std::fmt::Debug for PowerManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PowerManager")
            .field("mode", &self.current_mode())
            .field("low_power_mode", &self.low_power_mode)
            .finish_non_exhaustive()
    }
}

impl PowerManager {
    /// Create a manager in `Reset`.
    pub fn new(
        driver: Box<dyn LowPowerDriver>,
        ticks: Arc<dyn TickSource>,
        low_power_mode: LowPowerMode,
    ) -> Self {
        let awake_since = ticks.now_tick();
        Self {
            state: Mutex::new(RefCell::new(LpmState {
                machine: ModeMachine::new(),
                tick_suspended: false,
                meter: DutyMeter {
                    awake_since,
                    ..DutyMeter::default()
                },
            })),
            driver: Mutex::new(RefCell::new(driver)),
            ticks,
            low_power_mode,
        }
    }

    /// Configured sleep level.
    #[must_use]
    pub fn low_power_mode(&self) -> LowPowerMode {
        self.low_power_mode
    }

    /// Current operating mode.
    #[must_use]
    pub fn current_mode(&self) -> OperatingMode {
        critical_section::with(|cs| self.state.borrow_ref(cs).machine.mode())
    }

    /// Number of events that forced the machine back to `Reset`.
    #[must_use]
    pub fn fail_safe_count(&self) -> u64 {
        critical_section::with(|cs| self.state.borrow_ref(cs).machine.fail_safe_count())
    }

    /// Apply `event` and run its side effects. Returns the resulting mode.
    ///
    /// Safe to call from interrupt context.
    pub fn apply_event(&self, event: OpModeEvent) -> OperatingMode {
        critical_section::with(|cs| {
            self.state.borrow_ref_mut(cs).machine.apply(event);
        });
        if event == OpModeEvent::Wakeup {
            self.resume();
        }
        self.current_mode()
    }

    /// Undo every sleep side effect that is currently in place.
    ///
    /// After deep sleep the clock tree and peripherals are restored and the
    /// machine moves `Woken` → `Active` before the tick restarts, so no task
    /// observes `Active` on a half-restored system. Calling this while
    /// nothing is suspended does nothing.
    pub fn resume(&self) {
        let now = self.ticks.now_tick();
        let restored = critical_section::with(|cs| {
            let mut state = self.state.borrow_ref_mut(cs);
            let mut driver = self.driver.borrow_ref_mut(cs);

            if state.machine.mode() == OperatingMode::Woken {
                driver.resume_from_deep_sleep()?;
                state.machine.apply(OpModeEvent::Restored);
            }
            if state.tick_suspended {
                driver.resume_tick();
                state.tick_suspended = false;
                state.meter.post_sleep(now);
            }
            Ok::<(), HardwareError>(())
        });

        if let Err(e) = restored {
            error!(error = %e, "resume from deep sleep failed, resetting");
            critical_section::with(|cs| self.driver.borrow_ref_mut(cs).system_reset())
        }
    }

    /// Enter the configured sleep level if the node is idle.
    pub fn prepare_sleep(&self) -> SleepEntry {
        let now = self.ticks.now_tick();
        let entry = critical_section::with(|cs| {
            let mut state = self.state.borrow_ref_mut(cs);
            if !state.machine.mode().may_sleep() || state.tick_suspended {
                return SleepEntry::Skipped;
            }
            let mut driver = self.driver.borrow_ref_mut(cs);

            if !self.low_power_mode.is_deep() {
                driver.suspend_tick();
                state.tick_suspended = true;
                state.meter.pre_sleep(now);
                return SleepEntry::Light;
            }

            // The radio must be asleep before the MCU stops
            driver.radio_sleep();
            driver.suspend_tick();
            state.tick_suspended = true;
            state.meter.pre_sleep(now);
            driver.enter_deep_sleep(self.low_power_mode);
            state.machine.apply(OpModeEvent::Stopped);
            SleepEntry::Deep(self.low_power_mode)
        });

        match entry {
            SleepEntry::Skipped => trace!("not idle, sleep skipped"),
            SleepEntry::Light => trace!("light sleep"),
            SleepEntry::Deep(mode) => debug!(?mode, "entered deep sleep"),
        }
        entry
    }

    /// Idle path: reset the MCU if the machine fell back to `Reset`,
    /// otherwise try to sleep.
    pub fn idle_hook(&self) -> SleepEntry {
        if self.current_mode() == OperatingMode::Reset {
            error!("operating mode is RESET, resetting");
            critical_section::with(|cs| self.driver.borrow_ref_mut(cs).system_reset())
        }
        self.prepare_sleep()
    }

    /// Share of time spent awake since the last reset of the meter, in
    /// units of 1/10 000.
    #[must_use]
    pub fn duty_cycle_permyriad(&self) -> u16 {
        critical_section::with(|cs| self.state.borrow_ref(cs).meter.permyriad())
    }

    /// Restart the duty-cycle meter at the current tick.
    pub fn reset_duty_cycle(&self) {
        let now = self.ticks.now_tick();
        critical_section::with(|cs| {
            let mut state = self.state.borrow_ref_mut(cs);
            let asleep = state.meter.asleep_since.map(|_| now);
            state.meter = DutyMeter {
                awake_since: now,
                asleep_since: asleep,
                ..DutyMeter::default()
            };
        });
    }
}
