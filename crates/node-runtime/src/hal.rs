//! Interfaces to the hardware and platform collaborators.
//!
//! The runtime never touches registers or pins directly. Everything below
//! the control plane is reached through these traits, so the same task
//! bodies run against real drivers on the node and against
//! [`crate::sim`] on a host.

use crate::message::{FrameError, Message};
use node_common::config::LowPowerMode;
use node_common::nvcfg::NvBlock;
use std::time::Duration;
use thiserror::Error;

/// Failures reported while restoring the hardware after deep sleep.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HardwareError {
    /// An oscillator or PLL did not lock.
    #[error("clock did not lock: {0}")]
    ClockLock(&'static str),
}

/// Free-running local time base.
pub trait TickSource: Send + Sync {
    /// Current tick count. Monotonic, never wraps in practice.
    fn now_tick(&self) -> u64;
}

/// Low-power timer alarm and blocking delays for task context.
pub trait WakeTimer: Send + Sync {
    /// Arm the periodic wake alarm to fire at `at_tick`.
    fn arm_wakeup(&self, at_tick: u64);

    /// Block the calling task for `duration`.
    fn delay(&self, duration: Duration);
}

/// Register-level low-power driver.
pub trait LowPowerDriver: Send {
    /// Put the radio into its own sleep state.
    fn radio_sleep(&mut self);

    /// Stop the scheduler tick.
    fn suspend_tick(&mut self);

    /// Restart the scheduler tick.
    fn resume_tick(&mut self);

    /// Disable peripherals, switch to the wakeup clock and set the sleep
    /// bits for `mode`. Must be called with interrupts masked.
    fn enter_deep_sleep(&mut self, mode: LowPowerMode);

    /// Restore the core clock tree.
    ///
    /// # Errors
    ///
    /// Returns [`HardwareError::ClockLock`] if an oscillator fails to lock.
    fn restore_core_clock(&mut self) -> Result<(), HardwareError>;

    /// Re-enable peripheral clocks.
    fn restore_peripheral_clocks(&mut self);

    /// Re-enable the peripherals disabled on sleep entry.
    fn enable_peripherals(&mut self);

    /// Re-enable the interrupts disabled on sleep entry.
    fn enable_interrupts(&mut self);

    /// Undo every deep-sleep side effect, in dependency order: core clock,
    /// peripheral clocks, peripherals, interrupts.
    ///
    /// # Errors
    ///
    /// Propagates a core clock failure; later steps are not attempted.
    fn resume_from_deep_sleep(&mut self) -> Result<(), HardwareError> {
        self.restore_core_clock()?;
        self.restore_peripheral_clocks();
        self.enable_peripherals();
        self.enable_interrupts();
        Ok(())
    }

    /// Unconditional MCU reset.
    fn system_reset(&mut self) -> !;
}

/// Control lines of the attached board.
pub trait BoardControl: Send {
    /// Drive the board enable line.
    fn set_enabled(&mut self, enabled: bool);

    /// Current state of the enable line.
    fn is_enabled(&self) -> bool;

    /// Pulse the board wake line.
    fn wake(&mut self);

    /// Switch the external power rail.
    fn set_ext_power(&mut self, on: bool);

    /// Drive the activity indicator.
    fn set_indicator(&mut self, on: bool);

    /// Unconditional MCU reset.
    fn system_reset(&mut self) -> !;
}

/// Inter-processor message transport.
pub trait Transport: Send {
    /// Next inbound message, `None` when nothing is pending.
    fn receive(&mut self) -> Option<Result<Message, FrameError>>;

    /// Queue an outbound message. Returns false if the output buffer is full.
    fn send(&mut self, message: &Message) -> bool;
}

/// Non-volatile storage for the persisted node record.
pub trait ConfigStore: Send {
    /// Read the stored block, `None` if nothing valid is stored.
    fn load_config(&mut self) -> Option<NvBlock>;

    /// Write the block. Returns false on failure.
    fn save_config(&mut self, block: &NvBlock) -> bool;
}
