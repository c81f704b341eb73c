//! Persisted node record.
//!
//! The record is stored as one fixed-size block in non-volatile memory. Its
//! in-memory layout must match the storage block size exactly; a mismatch is
//! rejected at compile time.

use serde::{Deserialize, Serialize};
use static_assertions::const_assert_eq;
use tracing::debug;

/// Size of one block in the persistent store, in bytes.
pub const NV_BLOCK_SIZE: usize = 16;

/// Raw block as handed to the persistent store.
pub type NvBlock = [u8; NV_BLOCK_SIZE];

const_assert_eq!(std::mem::size_of::<PersistedConfig>(), NV_BLOCK_SIZE);

/// Recurring board enable schedule.
///
/// A `next_fire_time` of zero means the schedule is disabled.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PeriodicSchedule {
    /// Next absolute fire time in UNIX seconds (0 = disabled).
    pub next_fire_time: u32,
    /// Period in seconds.
    pub period_seconds: u32,
}

impl PeriodicSchedule {
    /// Create an active schedule.
    #[must_use]
    pub fn new(next_fire_time: u32, period_seconds: u32) -> Self {
        Self {
            next_fire_time,
            period_seconds,
        }
    }

    /// Returns true if the schedule is armed.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.next_fire_time > 0
    }

    /// Disarm the schedule.
    pub fn clear(&mut self) {
        self.next_fire_time = 0;
    }

    /// Evaluate the schedule at `now` (UNIX seconds).
    ///
    /// Returns true if the periodic action must fire. A due schedule fires
    /// exactly once, however many periods were missed, and is then advanced
    /// by whole periods until it lies strictly after `now`.
    pub fn poll(&mut self, now: u32) -> bool {
        if !self.is_enabled() || self.next_fire_time > now {
            return false;
        }
        if self.period_seconds > 0 {
            let behind = now - self.next_fire_time;
            let periods = behind / self.period_seconds + 1;
            self.next_fire_time = self
                .next_fire_time
                .saturating_add(periods.saturating_mul(self.period_seconds));
        } else {
            // Without a period the schedule is one-shot
            self.clear();
        }
        debug!(
            next_fire_time = self.next_fire_time,
            period = self.period_seconds,
            "periodic schedule fired"
        );
        true
    }
}

/// Non-volatile node configuration.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PersistedConfig {
    /// Node identifier.
    pub node_id: u16,
    /// Number of boots since the record was created.
    pub reset_count: u16,
    /// Periodic board enable schedule.
    pub periodic: PeriodicSchedule,
    /// Reserved for future use, always written as stored.
    pub reserved: u32,
}

impl PersistedConfig {
    /// Create a fresh record for `node_id`.
    #[must_use]
    pub fn new(node_id: u16) -> Self {
        Self {
            node_id,
            ..Default::default()
        }
    }

    /// Encode into a storage block (little endian).
    #[must_use]
    pub fn to_block(&self) -> NvBlock {
        let mut block = [0u8; NV_BLOCK_SIZE];
        block[0..2].copy_from_slice(&self.node_id.to_le_bytes());
        block[2..4].copy_from_slice(&self.reset_count.to_le_bytes());
        block[4..8].copy_from_slice(&self.periodic.next_fire_time.to_le_bytes());
        block[8..12].copy_from_slice(&self.periodic.period_seconds.to_le_bytes());
        block[12..16].copy_from_slice(&self.reserved.to_le_bytes());
        block
    }

    /// Decode from a storage block (little endian).
    #[must_use]
    pub fn from_block(block: &NvBlock) -> Self {
        let u16_at = |i: usize| u16::from_le_bytes([block[i], block[i + 1]]);
        let u32_at =
            |i: usize| u32::from_le_bytes([block[i], block[i + 1], block[i + 2], block[i + 3]]);
        Self {
            node_id: u16_at(0),
            reset_count: u16_at(2),
            periodic: PeriodicSchedule {
                next_fire_time: u32_at(4),
                period_seconds: u32_at(8),
            },
            reserved: u32_at(12),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_layout() {
        let config = PersistedConfig {
            node_id: 0x0102,
            reset_count: 3,
            periodic: PeriodicSchedule::new(0x1000_0000, 3600),
            reserved: 0,
        };
        let block = config.to_block();
        assert_eq!(&block[0..2], &[0x02, 0x01]);
        assert_eq!(&block[2..4], &[3, 0]);
        assert_eq!(PersistedConfig::from_block(&block), config);
    }

    #[test]
    fn test_periodic_fires_once_after_missed_periods() {
        let mut schedule = PeriodicSchedule::new(100, 60);

        assert!(schedule.poll(250));
        assert_eq!(schedule.next_fire_time, 280);

        // Nothing more until the next period boundary
        assert!(!schedule.poll(250));
        assert!(!schedule.poll(279));
        assert!(schedule.poll(280));
        assert_eq!(schedule.next_fire_time, 340);
    }

    #[test]
    fn test_periodic_not_due() {
        let mut schedule = PeriodicSchedule::new(500, 60);
        assert!(!schedule.poll(499));
        assert_eq!(schedule.next_fire_time, 500);
    }

    #[test]
    fn test_periodic_disabled() {
        let mut schedule = PeriodicSchedule::new(0, 60);
        assert!(!schedule.is_enabled());
        assert!(!schedule.poll(u32::MAX));
    }

    #[test]
    fn test_periodic_exact_boundary_advances_past_now() {
        let mut schedule = PeriodicSchedule::new(120, 60);
        assert!(schedule.poll(120));
        assert_eq!(schedule.next_fire_time, 180);
    }
}
