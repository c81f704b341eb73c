//! Task bodies.
//!
//! Three tasks share the node: duty, time synchronization and link. Each
//! blocks on its notification and runs one cycle per token. The duty task is
//! woken by interrupts and wakes the other two after its own work, so their
//! processing for a wake cycle always follows the duty cycle.
//!
//! The `*_cycle` functions are single iterations and are what tests drive;
//! the `run_*_task` loops wrap them for a threaded or RTOS host.

use crate::dispatch::{DispatchError, Dispatcher};
use crate::message::FrameError;
use crate::node::NodeContext;
use crate::notify::TaskNotification;
use crate::queue::{CommandKind, ScheduledCommand};
use crate::timesync::ReconcileOutcome;
use node_common::config::QUEUE_CAPACITY;
use node_common::state::OpModeEvent;
use tracing::{debug, error, info, trace, warn};

/// What one duty cycle did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DutyReport {
    /// UNIX seconds used as "now" for the cycle.
    pub now: u32,
    /// Queue entries executed.
    pub executed: usize,
    /// Whether the periodic schedule fired.
    pub periodic_fired: bool,
}

/// One duty cycle: indicator pulse, due commands, periodic schedule, next
/// wake alarm, then hand over to the sync and link tasks and report `Done`.
pub fn duty_cycle(node: &NodeContext) -> DutyReport {
    let now = node.sync().now_secs();
    trace!(now, "duty cycle");

    let pulse = node.config().board.indicator_pulse;
    node.with_board(|board| board.set_indicator(true));
    node.timer().delay(pulse);
    node.with_board(|board| board.set_indicator(false));

    let executed = process_scheduled_commands(node, now);
    let periodic_fired = process_periodic(node, now);

    let next_wakeup = node
        .ticks()
        .now_tick()
        .saturating_add(node.ticks_for(node.config().wake_period));
    node.timer().arm_wakeup(next_wakeup);

    node.notify_link();
    node.notify_sync();
    node.power().apply_event(OpModeEvent::Done);

    DutyReport {
        now,
        executed,
        periodic_fired,
    }
}

/// Execute every queue entry due at `now`. Returns the number executed.
pub fn process_scheduled_commands(node: &NodeContext, now: u32) -> usize {
    let due: heapless::Vec<ScheduledCommand, QUEUE_CAPACITY> =
        node.with_queue(|queue| queue.drain_due(now).collect());

    let dispatcher = Dispatcher::new(node);
    for cmd in &due {
        debug!(kind = %cmd.kind, late_s = now - cmd.scheduled_time.min(now), "executing");
        dispatcher.execute(*cmd);
    }

    if let Some(next) = node.with_queue(|queue| queue.peek().copied()) {
        debug!(
            kind = %next.kind,
            scheduled_time = next.scheduled_time,
            in_s = next.scheduled_time.saturating_sub(now),
            "next scheduled command"
        );
    }
    due.len()
}

/// Fire the periodic board enable if due. Returns true if it fired.
pub fn process_periodic(node: &NodeContext, now: u32) -> bool {
    if !node.update_persisted(|record| record.periodic.poll(now)) {
        return false;
    }

    node.with_board(|board| {
        board.set_enabled(true);
        board.wake();
    });
    info!(
        next_fire_time = node.persisted().periodic.next_fire_time,
        "periodic board enable"
    );
    if let Err(e) = node.save_config() {
        error!(error = %e, "failed to store periodic schedule");
    }
    true
}

/// One time synchronization cycle: reconcile the clock, then evaluate the
/// board watchdog.
pub fn sync_cycle(node: &NodeContext) -> ReconcileOutcome {
    let outcome = node.sync().reconcile();
    if node.watchdog_expired() {
        power_cycle_board(node);
    }
    outcome
}

/// Disable the board and schedule its re-enable after the reset pulse.
///
/// If the queue cannot take the re-enable, the board is held low for the
/// fallback pulse and released synchronously. Returns the scheduled
/// re-enable time, `None` on the fallback path.
pub fn power_cycle_board(node: &NodeContext) -> Option<u32> {
    warn!("power-cycling board");
    node.with_board(|board| board.set_enabled(false));

    let board = &node.config().board;
    let pulse = u32::try_from(board.reset_pulse.as_secs()).unwrap_or(u32::MAX);
    let now = node.sync().now_secs();
    match node.with_queue(|queue| queue.schedule(pulse, CommandKind::BoardEnable, 0, now)) {
        Some(at) => {
            info!(scheduled_time = at, "board re-enable scheduled");
            Some(at)
        }
        None => {
            warn!("failed to schedule board re-enable, releasing synchronously");
            node.timer().delay(board.fallback_pulse);
            node.with_board(|board| board.set_enabled(true));
            None
        }
    }
}

/// Drain inbound messages, at most the configured budget per cycle.
///
/// Returns the number of messages taken from the transport.
pub fn link_cycle(node: &NodeContext) -> u32 {
    let dispatcher = Dispatcher::new(node);
    let budget = node.config().link.max_reads_per_cycle;

    let mut processed = 0;
    while processed < budget {
        let Some(received) = node.with_transport(|transport| transport.receive()) else {
            break;
        };
        processed += 1;

        match dispatcher.process_message(received) {
            Ok(outcome) => trace!(?outcome, "message handled"),
            Err(DispatchError::InvalidFrame(FrameError::ReadFailed)) => {
                error!("transport read failed, stopping batch");
                break;
            }
            Err(e) => warn!(error = %e, "message dropped"),
        }
    }

    if processed == budget {
        debug!(budget, "read budget exhausted");
    }
    processed
}

/// Duty task loop.
pub fn run_duty_task(node: &NodeContext, notification: &TaskNotification) {
    info!("duty task started");
    loop {
        notification.take();
        if node.is_shutdown() {
            break;
        }
        duty_cycle(node);
    }
    info!("duty task stopped");
}

/// Time synchronization task loop.
pub fn run_sync_task(node: &NodeContext, notification: &TaskNotification) {
    info!("sync task started");
    loop {
        notification.take();
        if node.is_shutdown() {
            break;
        }
        sync_cycle(node);
    }
    info!("sync task stopped");
}

/// Link task loop.
pub fn run_link_task(node: &NodeContext, notification: &TaskNotification) {
    info!("link task started");
    loop {
        notification.take();
        if node.is_shutdown() {
            break;
        }
        link_cycle(node);
    }
    info!("link task stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{opcodes, Command, Message, MessageHeader, Payload};
    use crate::node::TaskNotifications;
    use crate::sim::SimHardware;
    use node_common::config::NodeConfig;
    use node_common::nvcfg::{PeriodicSchedule, PersistedConfig};
    use node_common::state::OperatingMode;
    use std::time::Duration;

    const HZ: u64 = 1_000;
    const T0: u64 = 1_700_000_000;

    fn booted() -> (NodeContext, TaskNotifications, SimHardware) {
        let sim = SimHardware::manual(HZ);
        let config = NodeConfig {
            tick_frequency_hz: HZ,
            isr_latency_ticks: 0,
            ..NodeConfig::default()
        };
        let (node, tasks) = NodeContext::new(config, sim.hardware());
        node.boot();
        node.sync().capture_request_edge(0);
        node.sync().accept_sync(T0 * 1_000_000).unwrap();
        node.sync().reconcile();
        (node, tasks, sim)
    }

    fn command(cmd: Command) -> Message {
        Message {
            header: MessageHeader {
                device_id: 1,
                target_id: 2,
                seq_no: 0,
                generation_time_us: T0 * 1_000_000,
            },
            payload: Payload::Command(cmd),
        }
    }

    #[test]
    fn test_duty_cycle_executes_due_commands() {
        let (node, tasks, sim) = booted();
        let t0 = u32::try_from(T0).unwrap();
        node.with_queue(|queue| {
            queue.insert(t0 + 10, CommandKind::BoardDisable, 0);
            queue.insert(t0 + 5, CommandKind::BoardEnable, 1);
            queue.insert(t0 + 100, CommandKind::BoardEnable, 2);
        });

        sim.ticks.advance_by(Duration::from_secs(10));
        let report = duty_cycle(&node);

        assert_eq!(report.now, t0 + 10);
        assert_eq!(report.executed, 2);
        // Enabled, then disabled
        let board = sim.board.state();
        assert!(!board.enabled);
        assert_eq!(board.toggle_count, 2);
        assert_eq!(board.indicator_pulses, 1);
        assert!(!board.indicator);
        assert_eq!(node.with_queue(|queue| queue.len()), 1);

        // Wake alarm re-armed one period ahead, tasks handed over
        assert_eq!(sim.timer.armed_tick(), Some(10_000 + 60_000));
        assert!(tasks.sync.try_take());
        assert!(tasks.link.try_take());
        assert_eq!(node.power().current_mode(), OperatingMode::Idle);
    }

    #[test]
    fn test_periodic_fires_once_and_is_stored() {
        let (node, _tasks, sim) = booted();
        let t0 = u32::try_from(T0).unwrap();
        node.update_persisted(|record| record.periodic = PeriodicSchedule::new(t0 - 150, 60));

        assert!(process_periodic(&node, t0));
        assert!(!process_periodic(&node, t0));

        let board = sim.board.state();
        assert!(board.enabled);
        assert_eq!(board.wake_count, 1);
        let stored = PersistedConfig::from_block(&sim.store.block().unwrap());
        assert_eq!(stored.periodic.next_fire_time, t0 + 30);
    }

    #[test]
    fn test_watchdog_power_cycle_schedules_reenable() {
        let (node, _tasks, sim) = booted();
        node.with_board(|board| board.set_enabled(true));

        let at = power_cycle_board(&node);
        assert_eq!(at, Some(u32::try_from(T0).unwrap() + 2));
        assert!(!sim.board.state().enabled);
        assert!(sim.timer.delays().is_empty());
    }

    #[test]
    fn test_watchdog_power_cycle_fallback() {
        let (node, _tasks, sim) = booted();
        node.with_queue(|queue| {
            while queue.insert(u32::MAX, CommandKind::BoardDisable, 0) {}
        });
        node.with_board(|board| board.set_enabled(true));

        assert_eq!(power_cycle_board(&node), None);
        let board = sim.board.state();
        assert!(board.enabled);
        assert_eq!(board.toggle_count, 3);
        assert_eq!(sim.timer.delays(), vec![Duration::from_millis(60)]);
    }

    #[test]
    fn test_sync_cycle_triggers_watchdog() {
        let (node, _tasks, sim) = booted();
        node.with_board(|board| board.set_enabled(true));

        // Silent for longer than the 15 min window
        sim.ticks.advance_by(Duration::from_secs(15 * 60 + 1));
        sync_cycle(&node);
        assert!(!sim.board.state().enabled);
        assert_eq!(node.with_queue(|queue| queue.len()), 1);
    }

    #[test]
    fn test_link_cycle_budget_and_read_failure() {
        let (node, _tasks, sim) = booted();
        for _ in 0..3 {
            sim.link.push(command(Command::new(opcodes::BOARD_POWER_EXT).with_u8(0, 1)));
        }
        sim.link.push_error(FrameError::ReadFailed);
        sim.link.push(command(Command::new(opcodes::BOARD_POWER_EXT)));

        assert_eq!(link_cycle(&node), 4);
        assert!(sim.board.state().ext_power);
        // The message after the failure waits for the next cycle
        assert_eq!(sim.link.pending(), 1);
        assert_eq!(link_cycle(&node), 1);
        assert!(!sim.board.state().ext_power);
    }

    #[test]
    fn test_link_cycle_respects_budget() {
        let sim = SimHardware::manual(HZ);
        let mut config = NodeConfig::default();
        config.link.max_reads_per_cycle = 2;
        let (node, _tasks) = NodeContext::new(config, sim.hardware());
        node.boot();

        for _ in 0..5 {
            sim.link.push(command(Command::new(0x7777)));
        }
        assert_eq!(link_cycle(&node), 2);
        assert_eq!(sim.link.pending(), 3);
    }

    #[test]
    fn test_wake_alarm_saturates_at_tick_limit() {
        let (node, _tasks, sim) = booted();
        sim.ticks.set(u64::MAX - 10);
        duty_cycle(&node);
        assert_eq!(sim.timer.armed_tick(), Some(u64::MAX));
    }

    #[test]
    fn test_task_loop_exits_on_shutdown() {
        let (node, tasks, _sim) = booted();
        node.shutdown();
        run_duty_task(&node, &tasks.duty);
        run_sync_task(&node, &tasks.sync);
        run_link_task(&node, &tasks.link);
    }
}
