//! Process-wide node context.
//!
//! [`NodeContext`] holds every piece of mutable node state and the handles to
//! the hardware collaborators. Tasks and interrupt entry points receive it by
//! reference; nothing is reached through globals.
//!
//! Field ownership in steady state:
//!
//! | field | writer |
//! |---|---|
//! | operating mode | interrupts (`Wakeup`), duty task (`Done`), idle path |
//! | sync state | request-edge interrupt (capture), link task (accept), sync task (reconcile) |
//! | command queue | link task (insert), sync task (watchdog re-enable), duty task (drain) |
//! | persisted record | boot, link task (periodic command), duty task (periodic advance) |
//!
//! Shared fields live behind `critical_section::Mutex`, so concurrent writers
//! are always serialized.

use crate::hal::{BoardControl, ConfigStore, LowPowerDriver, TickSource, Transport, WakeTimer};
use crate::lpm::{PowerManager, SleepEntry};
use crate::notify::{task_notification, Notifier, TaskNotification};
use crate::queue::CommandQueue;
use crate::timesync::TimeSync;
use crate::watchdog::BoardWatchdog;
use critical_section::Mutex;
use node_common::config::NodeConfig;
use node_common::error::{NodeError, NodeResult};
use node_common::nvcfg::PersistedConfig;
use node_common::state::OpModeEvent;
use std::cell::{Cell, RefCell};
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, trace, warn};

/// Delay between boot and the first duty cycle.
pub const FIRST_CYCLE_DELAY: Duration = Duration::from_secs(1);

/// The hardware collaborators of one node.
pub struct Hardware {
    /// Free-running tick counter.
    pub ticks: Arc<dyn TickSource>,
    /// Wake alarm and task delays.
    pub timer: Arc<dyn WakeTimer>,
    /// Register-level low-power driver.
    pub power: Box<dyn LowPowerDriver>,
    /// Attached board control lines.
    pub board: Box<dyn BoardControl>,
    /// Message transport.
    pub transport: Box<dyn Transport>,
    /// Persistent record store.
    pub store: Box<dyn ConfigStore>,
}

/// Taking sides of the task notifications, one per task.
#[derive(Debug)]
pub struct TaskNotifications {
    /// Duty task.
    pub duty: TaskNotification,
    /// Time synchronization task.
    pub sync: TaskNotification,
    /// Inbound link task.
    pub link: TaskNotification,
}

#[derive(Debug, Clone)]
struct Notifiers {
    duty: Notifier,
    sync: Notifier,
    link: Notifier,
}

/// All node state plus the collaborators that act on it.
pub struct NodeContext {
    config: NodeConfig,
    ticks: Arc<dyn TickSource>,
    timer: Arc<dyn WakeTimer>,
    power: PowerManager,
    sync: TimeSync,
    queue: Mutex<RefCell<CommandQueue>>,
    persisted: Mutex<Cell<PersistedConfig>>,
    watchdog: Mutex<Cell<BoardWatchdog>>,
    board: Mutex<RefCell<Box<dyn BoardControl>>>,
    transport: Mutex<RefCell<Box<dyn Transport>>>,
    store: Mutex<RefCell<Box<dyn ConfigStore>>>,
    seq_no: AtomicU16,
    notifiers: Notifiers,
    shutdown: AtomicBool,
}

impl std::fmt::Debug for NodeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeContext")
            .field("node_id", &self.node_id())
            .field("power", &self.power)
            .field("sync", &self.sync)
            .finish_non_exhaustive()
    }
}

impl NodeContext {
    /// Assemble a node in `Reset`. Call [`NodeContext::boot`] before
    /// starting the tasks.
    #[must_use]
    pub fn new(config: NodeConfig, hw: Hardware) -> (Self, TaskNotifications) {
        let (duty_notifier, duty) = task_notification();
        let (sync_notifier, sync) = task_notification();
        let (link_notifier, link) = task_notification();

        let now = hw.ticks.now_tick();
        let watchdog = BoardWatchdog::new(config.board.watchdog, config.tick_frequency_hz, now);

        let node = Self {
            power: PowerManager::new(hw.power, Arc::clone(&hw.ticks), config.low_power_mode),
            sync: TimeSync::new(Arc::clone(&hw.ticks), &config),
            queue: Mutex::new(RefCell::new(CommandQueue::new())),
            persisted: Mutex::new(Cell::new(PersistedConfig::new(config.node_id))),
            watchdog: Mutex::new(Cell::new(watchdog)),
            board: Mutex::new(RefCell::new(hw.board)),
            transport: Mutex::new(RefCell::new(hw.transport)),
            store: Mutex::new(RefCell::new(hw.store)),
            seq_no: AtomicU16::new(0),
            notifiers: Notifiers {
                duty: duty_notifier,
                sync: sync_notifier,
                link: link_notifier,
            },
            shutdown: AtomicBool::new(false),
            ticks: hw.ticks,
            timer: hw.timer,
            config,
        };
        (node, TaskNotifications { duty, sync, link })
    }

    /// Boot sequence: load (or create) the persisted record, count the
    /// reset, store it, leave `Reset` and arm the first wake alarm.
    pub fn boot(&self) -> PersistedConfig {
        let loaded = critical_section::with(|cs| self.store.borrow_ref_mut(cs).load_config());
        let mut record = match loaded {
            Some(block) => PersistedConfig::from_block(&block),
            None => {
                info!(node_id = self.config.node_id, "no stored configuration, using defaults");
                PersistedConfig::new(self.config.node_id)
            }
        };
        record.reset_count = record.reset_count.wrapping_add(1);
        critical_section::with(|cs| self.persisted.borrow(cs).set(record));

        if let Err(e) = self.save_config() {
            error!(error = %e, "failed to store configuration at boot");
        }

        self.power.apply_event(OpModeEvent::Init);
        self.timer
            .arm_wakeup(self.ticks.now_tick().saturating_add(self.ticks_for(FIRST_CYCLE_DELAY)));

        info!(
            node_id = record.node_id,
            reset_count = record.reset_count,
            periodic_next = record.periodic.next_fire_time,
            periodic_period = record.periodic.period_seconds,
            "node booted"
        );
        record
    }

    /// Node configuration.
    #[must_use]
    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Addressing id from the persisted record.
    #[must_use]
    pub fn node_id(&self) -> u16 {
        self.persisted().node_id
    }

    /// Low-power manager.
    #[must_use]
    pub fn power(&self) -> &PowerManager {
        &self.power
    }

    /// Time synchronization engine.
    #[must_use]
    pub fn sync(&self) -> &TimeSync {
        &self.sync
    }

    /// Tick source.
    #[must_use]
    pub fn ticks(&self) -> &dyn TickSource {
        self.ticks.as_ref()
    }

    /// Wake timer.
    #[must_use]
    pub fn timer(&self) -> &dyn WakeTimer {
        self.timer.as_ref()
    }

    /// Number of ticks in `duration`.
    #[must_use]
    pub fn ticks_for(&self, duration: Duration) -> u64 {
        let ticks =
            duration.as_micros() * u128::from(self.config.tick_frequency_hz) / 1_000_000;
        u64::try_from(ticks).unwrap_or(u64::MAX)
    }

    /// Run `f` on the command queue inside a critical section.
    pub fn with_queue<R>(&self, f: impl FnOnce(&mut CommandQueue) -> R) -> R {
        critical_section::with(|cs| f(&mut self.queue.borrow_ref_mut(cs)))
    }

    /// Run `f` on the board control lines inside a critical section.
    pub fn with_board<R>(&self, f: impl FnOnce(&mut Box<dyn BoardControl>) -> R) -> R {
        critical_section::with(|cs| f(&mut self.board.borrow_ref_mut(cs)))
    }

    /// Run `f` on the transport inside a critical section.
    pub fn with_transport<R>(&self, f: impl FnOnce(&mut Box<dyn Transport>) -> R) -> R {
        critical_section::with(|cs| f(&mut self.transport.borrow_ref_mut(cs)))
    }

    /// Copy of the persisted record.
    #[must_use]
    pub fn persisted(&self) -> PersistedConfig {
        critical_section::with(|cs| self.persisted.borrow(cs).get())
    }

    /// Modify the in-memory persisted record. Does not write it to the store.
    pub fn update_persisted<R>(&self, f: impl FnOnce(&mut PersistedConfig) -> R) -> R {
        critical_section::with(|cs| {
            let cell = self.persisted.borrow(cs);
            let mut record = cell.get();
            let result = f(&mut record);
            cell.set(record);
            result
        })
    }

    /// Write the persisted record to the store.
    ///
    /// # Errors
    ///
    /// [`NodeError::Store`] if the store rejects the write.
    pub fn save_config(&self) -> NodeResult<()> {
        let block = self.persisted().to_block();
        let saved = critical_section::with(|cs| self.store.borrow_ref_mut(cs).save_config(&block));
        if saved {
            Ok(())
        } else {
            Err(NodeError::Store("configuration write rejected".into()))
        }
    }

    /// Evaluate the board watchdog at the current tick.
    pub fn watchdog_expired(&self) -> bool {
        let now = self.ticks.now_tick();
        let enabled = self.with_board(|board| board.is_enabled());
        let last_request = self.sync.last_request_tick();
        critical_section::with(|cs| {
            let cell = self.watchdog.borrow(cs);
            let mut watchdog = cell.get();
            let expired = watchdog.check(now, enabled, last_request);
            cell.set(watchdog);
            expired
        })
    }

    /// Next outbound sequence number.
    pub fn next_seq_no(&self) -> u16 {
        self.seq_no.fetch_add(1, Ordering::Relaxed)
    }

    /// Wake the duty task.
    pub fn notify_duty(&self) {
        self.notifiers.duty.notify();
    }

    /// Wake the time synchronization task.
    pub fn notify_sync(&self) {
        self.notifiers.sync.notify();
    }

    /// Wake the link task.
    pub fn notify_link(&self) {
        self.notifiers.link.notify();
    }

    /// Returns true while any task holds a notification it has not taken.
    #[must_use]
    pub fn has_pending_work(&self) -> bool {
        let n = &self.notifiers;
        n.duty.is_pending() || n.sync.is_pending() || n.link.is_pending()
    }

    /// Idle path of the scheduler. Runs [`PowerManager::idle_hook`] only
    /// when no task is runnable; a pending token means a task is about to
    /// run and the node must stay awake for it.
    pub fn idle_hook(&self) -> SleepEntry {
        if self.has_pending_work() {
            trace!("task notification pending, sleep skipped");
            return SleepEntry::Skipped;
        }
        self.power.idle_hook()
    }

    /// Ask every task loop to exit and wake them so they notice.
    pub fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            warn!("shutdown already requested");
            return;
        }
        info!("shutting down node tasks");
        self.notifiers.duty.notify();
        self.notifiers.sync.notify();
        self.notifiers.link.notify();
    }

    /// Returns true once [`NodeContext::shutdown`] was called.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{MemoryStore, SimHardware};
    use node_common::config::LowPowerMode;
    use node_common::nvcfg::PeriodicSchedule;
    use node_common::state::OperatingMode;

    #[test]
    fn test_boot_creates_record() {
        let sim = SimHardware::manual(32_768);
        let (node, _tasks) = NodeContext::new(NodeConfig::default(), sim.hardware());

        let record = node.boot();
        assert_eq!(record.node_id, 2);
        assert_eq!(record.reset_count, 1);
        assert_eq!(node.power().current_mode(), OperatingMode::Active);
        assert_eq!(
            sim.store.block().map(|b| PersistedConfig::from_block(&b)),
            Some(record)
        );
        assert_eq!(sim.timer.armed_tick(), Some(32_768));
    }

    #[test]
    fn test_boot_increments_stored_reset_count() {
        let stored = PersistedConfig {
            node_id: 9,
            reset_count: 41,
            periodic: PeriodicSchedule::new(1_700_000_000, 3600),
            reserved: 0,
        };
        let sim = SimHardware::manual(32_768).with_store(MemoryStore::with_block(stored.to_block()));
        let (node, _tasks) = NodeContext::new(NodeConfig::default(), sim.hardware());

        let record = node.boot();
        assert_eq!(record.node_id, 9);
        assert_eq!(record.reset_count, 42);
        assert_eq!(record.periodic, stored.periodic);
        assert_eq!(node.node_id(), 9);
    }

    #[test]
    fn test_boot_survives_store_failure() {
        let sim = SimHardware::manual(32_768);
        sim.store.fail_writes(true);
        let (node, _tasks) = NodeContext::new(NodeConfig::default(), sim.hardware());

        node.boot();
        assert_eq!(node.power().current_mode(), OperatingMode::Active);
        assert!(node.save_config().is_err());
    }

    #[test]
    fn test_shutdown_wakes_tasks() {
        let sim = SimHardware::manual(32_768);
        let (node, tasks) = NodeContext::new(NodeConfig::default(), sim.hardware());

        node.shutdown();
        assert!(node.is_shutdown());
        assert!(tasks.duty.try_take());
        assert!(tasks.sync.try_take());
        assert!(tasks.link.try_take());
    }

    #[test]
    fn test_idle_hook_waits_for_pending_tasks() {
        let sim = SimHardware::manual(32_768);
        let (node, tasks) = NodeContext::new(NodeConfig::default(), sim.hardware());
        node.boot();
        node.power().apply_event(OpModeEvent::Done);

        node.notify_link();
        assert!(node.has_pending_work());
        assert_eq!(node.idle_hook(), SleepEntry::Skipped);
        assert_eq!(node.power().current_mode(), OperatingMode::Idle);

        assert!(tasks.link.try_take());
        assert!(!node.has_pending_work());
        assert_eq!(node.idle_hook(), SleepEntry::Deep(LowPowerMode::Stop2));
    }
}
