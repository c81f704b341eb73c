//! Fixed-capacity queue of time-scheduled board commands.
//!
//! Entries are kept sorted by ascending scheduled time; entries with equal
//! times stay in insertion order. The queue never allocates and never evicts:
//! inserting into a full queue fails and leaves it unchanged.

use heapless::Vec;
use node_common::config::QUEUE_CAPACITY;
use node_common::time::SECONDS_PER_DAY;
use std::fmt;
use tracing::{debug, warn};

/// Deferred board actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    /// Enable and wake the board; the argument is its wake-up mode.
    BoardEnable,
    /// Disable the board.
    BoardDisable,
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BoardEnable => write!(f, "board-enable"),
            Self::BoardDisable => write!(f, "board-disable"),
        }
    }
}

/// One queued command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduledCommand {
    /// What to do.
    pub kind: CommandKind,
    /// Command argument.
    pub arg: u16,
    /// Absolute UNIX time in seconds at which the command is due.
    pub scheduled_time: u32,
}

/// Time-ordered command queue.
#[derive(Debug, Clone, Default)]
pub struct CommandQueue<const N: usize = QUEUE_CAPACITY> {
    entries: Vec<ScheduledCommand, N>,
}

impl<const N: usize> CommandQueue<N> {
    /// Create an empty queue.
    #[must_use]
    pub const fn new() -> Self {
        Self { entries: Vec::new() }
    }

    /// Insert a command at absolute time `scheduled_time`.
    ///
    /// Returns false, without modifying the queue, if it is full.
    pub fn insert(&mut self, scheduled_time: u32, kind: CommandKind, arg: u16) -> bool {
        if self.entries.is_full() {
            return false;
        }
        let index = self
            .entries
            .iter()
            .position(|c| c.scheduled_time > scheduled_time)
            .unwrap_or(self.entries.len());
        let command = ScheduledCommand {
            kind,
            arg,
            scheduled_time,
        };
        self.entries.insert(index, command).is_ok()
    }

    /// Insert a command, treating `when` below one day as an offset from
    /// `now`.
    ///
    /// Absolute times already in the past are accepted and become due at the
    /// next check. Returns the resolved time, or `None` if the queue is full.
    pub fn schedule(&mut self, when: u32, kind: CommandKind, arg: u16, now: u32) -> Option<u32> {
        let scheduled_time = if when < SECONDS_PER_DAY {
            now.saturating_add(when)
        } else {
            if when <= now {
                warn!(
                    %kind,
                    scheduled_time = when,
                    now,
                    "scheduled time already passed"
                );
            }
            when
        };

        if self.insert(scheduled_time, kind, arg) {
            debug!(%kind, arg, scheduled_time, "command scheduled");
            Some(scheduled_time)
        } else {
            None
        }
    }

    /// Earliest entry if it is due at `now`.
    #[must_use]
    pub fn peek_due(&self, now: u32) -> Option<&ScheduledCommand> {
        self.entries.first().filter(|c| c.scheduled_time <= now)
    }

    /// Remove and return the earliest entry if it is due at `now`.
    pub fn pop_due(&mut self, now: u32) -> Option<ScheduledCommand> {
        self.peek_due(now)?;
        Some(self.entries.remove(0))
    }

    /// Remove every entry due at `now`, earliest first.
    pub fn drain_due(&mut self, now: u32) -> DrainDue<'_, N> {
        DrainDue { queue: self, now }
    }

    /// Earliest entry, due or not.
    #[must_use]
    pub fn peek(&self) -> Option<&ScheduledCommand> {
        self.entries.first()
    }

    /// Entries in execution order.
    pub fn iter(&self) -> impl Iterator<Item = &ScheduledCommand> {
        self.entries.iter()
    }

    /// Number of queued entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns true if no further entry fits.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.entries.is_full()
    }

    /// Maximum number of entries.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        N
    }
}

/// Iterator returned by [`CommandQueue::drain_due`].
///
/// Entries not consumed stay queued.
#[derive(Debug)]
pub struct DrainDue<'a, const N: usize> {
    queue: &'a mut CommandQueue<N>,
    now: u32,
}

impl<const N: usize> Iterator for DrainDue<'_, N> {
    type Item = ScheduledCommand;

    fn next(&mut self) -> Option<Self::Item> {
        self.queue.pop_due(self.now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use CommandKind::{BoardDisable, BoardEnable};

    #[test]
    fn test_drain_in_time_order() {
        let mut queue: CommandQueue = CommandQueue::new();
        for t in [500_000, 100_000, 300_000, 100_000, 200_000] {
            assert!(queue.insert(t, BoardEnable, 0));
        }

        let times: std::vec::Vec<u32> = queue.drain_due(u32::MAX).map(|c| c.scheduled_time).collect();
        assert_eq!(times, vec![100_000, 100_000, 200_000, 300_000, 500_000]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_ties_keep_insertion_order() {
        let mut queue: CommandQueue = CommandQueue::new();
        queue.insert(100_000, BoardEnable, 1);
        queue.insert(100_000, BoardDisable, 2);
        queue.insert(100_000, BoardEnable, 3);

        let args: std::vec::Vec<u16> = queue.drain_due(100_000).map(|c| c.arg).collect();
        assert_eq!(args, vec![1, 2, 3]);
    }

    #[test]
    fn test_full_queue_unchanged() {
        let mut queue: CommandQueue<3> = CommandQueue::new();
        assert!(queue.insert(300_000, BoardEnable, 0));
        assert!(queue.insert(100_000, BoardEnable, 0));
        assert!(queue.insert(200_000, BoardEnable, 0));
        assert!(queue.is_full());

        let before: std::vec::Vec<ScheduledCommand> = queue.iter().copied().collect();
        assert!(!queue.insert(50_000, BoardDisable, 9));
        let after: std::vec::Vec<ScheduledCommand> = queue.iter().copied().collect();
        assert_eq!(before, after);
    }

    #[test]
    fn test_default_capacity() {
        let queue: CommandQueue = CommandQueue::new();
        assert_eq!(queue.capacity(), QUEUE_CAPACITY);
    }

    #[test]
    fn test_relative_time() {
        let mut queue: CommandQueue = CommandQueue::new();
        assert_eq!(queue.schedule(30, BoardEnable, 0, 1000), Some(1030));
        assert_eq!(queue.peek().map(|c| c.scheduled_time), Some(1030));
    }

    #[test]
    fn test_past_absolute_time_is_due_immediately() {
        let mut queue: CommandQueue = CommandQueue::new();
        let now = 1_600_000_000;
        assert_eq!(
            queue.schedule(now - 3600, BoardDisable, 0, now),
            Some(now - 3600)
        );
        assert!(queue.pop_due(now).is_some());
    }

    #[test]
    fn test_pop_due_respects_time() {
        let mut queue: CommandQueue = CommandQueue::new();
        queue.insert(200_000, BoardEnable, 0);

        assert!(queue.peek_due(199_999).is_none());
        assert!(queue.pop_due(199_999).is_none());
        assert_eq!(queue.len(), 1);

        assert_eq!(
            queue.pop_due(200_000),
            Some(ScheduledCommand {
                kind: BoardEnable,
                arg: 0,
                scheduled_time: 200_000
            })
        );
    }

    #[test]
    fn test_partial_drain() {
        let mut queue: CommandQueue = CommandQueue::new();
        queue.insert(100_000, BoardEnable, 0);
        queue.insert(200_000, BoardDisable, 0);
        queue.insert(300_000, BoardEnable, 0);

        assert_eq!(queue.drain_due(250_000).count(), 2);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.peek().map(|c| c.scheduled_time), Some(300_000));
    }
}
