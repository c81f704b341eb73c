//! Inbound message and command dispatch.
//!
//! Turns protocol messages into node actions: board commands become queue
//! entries or immediate line changes, time values close a synchronization
//! round, and due queue entries become board actions.

use crate::message::{opcodes, Command, FrameError, Message, MessageHeader, Payload, BROADCAST_ID};
use crate::node::NodeContext;
use crate::queue::{CommandKind, ScheduledCommand};
use node_common::error::{NodeError, NodeResult};
use node_common::nvcfg::PeriodicSchedule;
use node_common::time::{micros_to_secs, next_time_at_daytime};
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Reasons an inbound message was dropped.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum DispatchError {
    /// The frame could not be decoded.
    #[error("invalid frame: {0}")]
    InvalidFrame(#[from] FrameError),

    /// The message is addressed to another node.
    #[error("message for node {target} ignored")]
    NotAddressed {
        /// Addressed node.
        target: u16,
    },

    /// Message type not handled by this node.
    #[error("unknown message type {0}")]
    UnknownMessageType(u8),

    /// Opcode outside the supported command set.
    #[error("unknown command 0x{0:04x}")]
    UnknownCommand(u16),

    /// Command argument out of range.
    #[error("invalid command argument: {0}")]
    InvalidArgument(&'static str),

    /// The command queue is full.
    #[error("command queue full, command for t={scheduled_time} dropped")]
    QueueFull {
        /// Requested execution time in UNIX seconds.
        scheduled_time: u32,
    },

    /// The time value could not be used.
    #[error(transparent)]
    Sync(#[from] NodeError),
}

/// Effect of a successfully handled message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandOutcome {
    /// Applied immediately.
    Applied,
    /// Queued for later execution.
    Scheduled {
        /// Execution time in UNIX seconds.
        at: u32,
    },
    /// The persisted record changed and must be stored.
    ConfigChanged,
    /// A sync point was accepted.
    TimeAccepted,
}

/// Command dispatcher bound to one node.
#[derive(Debug, Clone, Copy)]
pub struct Dispatcher<'a> {
    node: &'a NodeContext,
}

impl<'a> Dispatcher<'a> {
    /// Create a dispatcher for `node`.
    #[must_use]
    pub fn new(node: &'a NodeContext) -> Self {
        Self { node }
    }

    /// Route one inbound message.
    ///
    /// A changed persisted record is written to the store here; a failed
    /// write is logged and does not fail the message.
    ///
    /// # Errors
    ///
    /// Any [`DispatchError`]; the message is dropped and nothing changed.
    pub fn process_message(
        &self,
        received: Result<Message, FrameError>,
    ) -> Result<CommandOutcome, DispatchError> {
        let msg = received?;
        let node_id = self.node.node_id();
        if !msg.is_for(node_id) {
            return Err(DispatchError::NotAddressed {
                target: msg.header.target_id,
            });
        }

        let outcome = match msg.payload {
            Payload::Command(cmd) => self.handle_inbound_command(&cmd, &msg.header)?,
            Payload::TimeSync { unix_time_us } => {
                self.node.sync().accept_sync(unix_time_us)?;
                // Reconcile promptly instead of waiting for the next cycle
                self.node.notify_sync();
                CommandOutcome::TimeAccepted
            }
            Payload::Other { type_id } => return Err(DispatchError::UnknownMessageType(type_id)),
        };

        if outcome == CommandOutcome::ConfigChanged {
            if let Err(e) = self.node.save_config() {
                error!(error = %e, "failed to store updated configuration");
            }
        }
        Ok(outcome)
    }

    /// Validate and apply one command.
    ///
    /// # Errors
    ///
    /// [`DispatchError::UnknownCommand`], [`DispatchError::InvalidArgument`]
    /// or [`DispatchError::QueueFull`]; no state is modified in either case.
    pub fn handle_inbound_command(
        &self,
        cmd: &Command,
        header: &MessageHeader,
    ) -> Result<CommandOutcome, DispatchError> {
        debug!(
            opcode = cmd.opcode,
            src = header.device_id,
            seq_no = header.seq_no,
            "command received"
        );

        match cmd.opcode {
            opcodes::SYSTEM_RESET | opcodes::NODE_RESET => {
                warn!(src = header.device_id, "reset command received");
                self.node.with_board(|board| board.system_reset())
            }
            opcodes::BOARD_POWER_EXT => {
                let on = cmd.arg_u8(0) != 0;
                self.node.with_board(|board| board.set_ext_power(on));
                info!(on, "external power switched");
                Ok(CommandOutcome::Applied)
            }
            opcodes::BOARD_ENABLE | opcodes::BOARD_DISABLE => self.schedule_board(cmd, header),
            opcodes::BOARD_ENABLE_PERIODIC => self.set_periodic(cmd),
            other => Err(DispatchError::UnknownCommand(other)),
        }
    }

    fn schedule_board(
        &self,
        cmd: &Command,
        header: &MessageHeader,
    ) -> Result<CommandOutcome, DispatchError> {
        let (kind, arg) = if cmd.opcode == opcodes::BOARD_ENABLE {
            (CommandKind::BoardEnable, cmd.arg_u16(5))
        } else {
            (CommandKind::BoardDisable, 0)
        };

        let mut at = cmd.arg_u32(0);
        if cmd.arg_u8(4) & 1 != 0 {
            at = at.saturating_add(micros_to_secs(header.generation_time_us));
        }

        let now = self.node.sync().now_secs();
        if at <= now {
            warn!(%kind, scheduled_time = at, now, "scheduled time already passed");
        }

        if !self.node.with_queue(|queue| queue.insert(at, kind, arg)) {
            warn!(%kind, scheduled_time = at, "command queue full");
            return Err(DispatchError::QueueFull { scheduled_time: at });
        }
        info!(%kind, arg, scheduled_time = at, "board command scheduled");
        Ok(CommandOutcome::Scheduled { at })
    }

    fn set_periodic(&self, cmd: &Command) -> Result<CommandOutcome, DispatchError> {
        let hour = cmd.arg_u8(0);
        let minute = cmd.arg_u8(1);
        let period_minutes = cmd.arg_u16(2);

        if period_minutes == 0 {
            self.node.update_persisted(|record| record.periodic.clear());
            info!("periodic board enable disabled");
            return Ok(CommandOutcome::ConfigChanged);
        }

        let now = self.node.sync().now_secs();
        let next = next_time_at_daytime(now, hour, minute, 0)
            .ok_or(DispatchError::InvalidArgument("time of day out of range"))?;
        let schedule = PeriodicSchedule::new(next, u32::from(period_minutes) * 60);
        self.node.update_persisted(|record| record.periodic = schedule);
        info!(
            next_fire_time = next,
            period_seconds = schedule.period_seconds,
            "periodic board enable set"
        );
        Ok(CommandOutcome::ConfigChanged)
    }

    /// Carry out a due queue entry.
    pub fn execute(&self, cmd: ScheduledCommand) {
        match cmd.kind {
            CommandKind::BoardEnable => {
                self.node.with_board(|board| {
                    board.set_enabled(true);
                    board.wake();
                });
                info!(scheduled_time = cmd.scheduled_time, "board enabled");
                // The board reads its wake-up mode right after power-up
                if let Err(e) = self.send_command(opcodes::BOARD_WAKEUP_MODE, cmd.arg) {
                    warn!(error = %e, "wake-up mode not sent");
                }
            }
            CommandKind::BoardDisable => {
                self.node.with_board(|board| board.set_enabled(false));
                info!(scheduled_time = cmd.scheduled_time, "board disabled");
            }
        }
    }

    /// Send a command to the board.
    ///
    /// # Errors
    ///
    /// [`NodeError::TransportFull`] if the output buffer is full; the message
    /// is dropped.
    pub fn send_command(&self, opcode: u16, arg: u16) -> NodeResult<()> {
        let msg = Message {
            header: MessageHeader {
                device_id: self.node.node_id(),
                target_id: BROADCAST_ID,
                seq_no: self.node.next_seq_no(),
                generation_time_us: self.node.sync().now_us(),
            },
            payload: Payload::Command(Command::new(opcode).with_u16(0, arg)),
        };

        if self.node.with_transport(|transport| transport.send(&msg)) {
            debug!(opcode, arg, seq_no = msg.header.seq_no, "command sent");
            Ok(())
        } else {
            warn!(opcode, "outbound buffer full, message dropped");
            Err(NodeError::TransportFull)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::TaskNotifications;
    use crate::sim::SimHardware;
    use node_common::config::NodeConfig;
    use node_common::nvcfg::PersistedConfig;

    const HZ: u64 = 1_000;
    // 2021-01-01T00:00:00Z
    const NEW_YEAR_US: u64 = 1_609_459_200_000_000;

    fn booted_node() -> (NodeContext, TaskNotifications, SimHardware) {
        let sim = SimHardware::manual(HZ);
        let config = NodeConfig {
            tick_frequency_hz: HZ,
            isr_latency_ticks: 0,
            ..NodeConfig::default()
        };
        let (node, tasks) = NodeContext::new(config, sim.hardware());
        node.boot();
        // Sync the clock to NEW_YEAR at tick 0
        node.sync().capture_request_edge(0);
        node.sync().accept_sync(NEW_YEAR_US).unwrap();
        node.sync().reconcile();
        (node, tasks, sim)
    }

    fn command_to(target: u16, cmd: Command) -> Message {
        Message {
            header: MessageHeader {
                device_id: 1,
                target_id: target,
                seq_no: 7,
                generation_time_us: NEW_YEAR_US,
            },
            payload: Payload::Command(cmd),
        }
    }

    #[test]
    fn test_absolute_enable_is_queued() {
        let (node, _tasks, _sim) = booted_node();
        let at = 1_609_459_200 + 600;
        let cmd = Command::new(opcodes::BOARD_ENABLE).with_u32(0, at).with_u16(5, 3);

        let outcome = Dispatcher::new(&node).process_message(Ok(command_to(2, cmd)));
        assert_eq!(outcome, Ok(CommandOutcome::Scheduled { at }));
        node.with_queue(|queue| {
            let entry = queue.peek().copied().unwrap();
            assert_eq!(entry.kind, CommandKind::BoardEnable);
            assert_eq!(entry.arg, 3);
        });
    }

    #[test]
    fn test_relative_disable_uses_generation_time() {
        let (node, _tasks, _sim) = booted_node();
        let cmd = Command::new(opcodes::BOARD_DISABLE).with_u32(0, 90).with_u8(4, 1);

        let outcome = Dispatcher::new(&node).process_message(Ok(command_to(2, cmd)));
        assert_eq!(
            outcome,
            Ok(CommandOutcome::Scheduled {
                at: 1_609_459_200 + 90
            })
        );
    }

    #[test]
    fn test_external_power_is_immediate() {
        let (node, _tasks, sim) = booted_node();
        let cmd = Command::new(opcodes::BOARD_POWER_EXT).with_u8(0, 1);

        let outcome = Dispatcher::new(&node).process_message(Ok(command_to(BROADCAST_ID, cmd)));
        assert_eq!(outcome, Ok(CommandOutcome::Applied));
        assert!(sim.board.state().ext_power);
    }

    #[test]
    fn test_unknown_command_changes_nothing() {
        let (node, _tasks, sim) = booted_node();
        let before = node.persisted();

        let outcome =
            Dispatcher::new(&node).process_message(Ok(command_to(2, Command::new(0x7777))));
        assert_eq!(outcome, Err(DispatchError::UnknownCommand(0x7777)));
        assert!(node.with_queue(|queue| queue.is_empty()));
        assert_eq!(node.persisted(), before);
        assert_eq!(sim.board.state(), Default::default());
    }

    #[test]
    fn test_protocol_errors() {
        let (node, _tasks, _sim) = booted_node();
        let dispatcher = Dispatcher::new(&node);

        assert_eq!(
            dispatcher.process_message(Err(FrameError::Crc { device_id: 1, len: 12 })),
            Err(DispatchError::InvalidFrame(FrameError::Crc { device_id: 1, len: 12 }))
        );

        let other = command_to(5, Command::new(opcodes::BOARD_POWER_EXT));
        assert_eq!(
            dispatcher.process_message(Ok(other)),
            Err(DispatchError::NotAddressed { target: 5 })
        );

        let mut unknown = command_to(2, Command::new(0));
        unknown.payload = Payload::Other { type_id: 42 };
        assert_eq!(
            dispatcher.process_message(Ok(unknown)),
            Err(DispatchError::UnknownMessageType(42))
        );
    }

    #[test]
    fn test_queue_full_is_reported() {
        let (node, _tasks, _sim) = booted_node();
        let dispatcher = Dispatcher::new(&node);
        let cmd = Command::new(opcodes::BOARD_DISABLE).with_u32(0, 60).with_u8(4, 1);

        for _ in 0..node.with_queue(|queue| queue.capacity()) {
            assert!(dispatcher.process_message(Ok(command_to(2, cmd))).is_ok());
        }
        assert!(matches!(
            dispatcher.process_message(Ok(command_to(2, cmd))),
            Err(DispatchError::QueueFull { .. })
        ));
    }

    #[test]
    fn test_periodic_enable_is_persisted() {
        let (node, _tasks, sim) = booted_node();
        let cmd = Command::new(opcodes::BOARD_ENABLE_PERIODIC)
            .with_u8(0, 6)
            .with_u8(1, 30)
            .with_u16(2, 24 * 60);

        let outcome = Dispatcher::new(&node).process_message(Ok(command_to(2, cmd)));
        assert_eq!(outcome, Ok(CommandOutcome::ConfigChanged));

        let stored = PersistedConfig::from_block(&sim.store.block().unwrap());
        assert_eq!(stored.periodic.next_fire_time, 1_609_459_200 + 6 * 3600 + 1800);
        assert_eq!(stored.periodic.period_seconds, 86_400);
        assert_eq!(node.persisted(), stored);
    }

    #[test]
    fn test_periodic_zero_period_clears() {
        let (node, _tasks, _sim) = booted_node();
        node.update_persisted(|record| record.periodic = PeriodicSchedule::new(123, 60));
        let cmd = Command::new(opcodes::BOARD_ENABLE_PERIODIC).with_u8(0, 6);

        let outcome = Dispatcher::new(&node).process_message(Ok(command_to(2, cmd)));
        assert_eq!(outcome, Ok(CommandOutcome::ConfigChanged));
        assert!(!node.persisted().periodic.is_enabled());
    }

    #[test]
    fn test_periodic_invalid_time_of_day() {
        let (node, _tasks, _sim) = booted_node();
        let cmd = Command::new(opcodes::BOARD_ENABLE_PERIODIC)
            .with_u8(0, 25)
            .with_u16(2, 60);

        let outcome = Dispatcher::new(&node).process_message(Ok(command_to(2, cmd)));
        assert!(matches!(outcome, Err(DispatchError::InvalidArgument(_))));
        assert!(!node.persisted().periodic.is_enabled());
    }

    #[test]
    fn test_time_sync_without_request() {
        let (node, _tasks, _sim) = booted_node();
        let mut msg = command_to(BROADCAST_ID, Command::new(0));
        msg.payload = Payload::TimeSync { unix_time_us: 5 };

        assert_eq!(
            Dispatcher::new(&node).process_message(Ok(msg)),
            Err(DispatchError::Sync(NodeError::NoPendingRequest { unix_time_us: 5 }))
        );
    }

    #[test]
    fn test_execute_enable_sends_wakeup_mode() {
        let (node, _tasks, sim) = booted_node();
        Dispatcher::new(&node).execute(ScheduledCommand {
            kind: CommandKind::BoardEnable,
            arg: 2,
            scheduled_time: 0,
        });

        let board = sim.board.state();
        assert!(board.enabled);
        assert_eq!(board.wake_count, 1);

        let sent = sim.link.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].header.device_id, 2);
        assert_eq!(sent[0].header.generation_time_us, NEW_YEAR_US);
        match sent[0].payload {
            Payload::Command(cmd) => {
                assert_eq!(cmd.opcode, opcodes::BOARD_WAKEUP_MODE);
                assert_eq!(cmd.arg_u16(0), 2);
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    #[should_panic(expected = "system reset")]
    fn test_reset_command() {
        let (node, _tasks, _sim) = booted_node();
        let _ = Dispatcher::new(&node)
            .process_message(Ok(command_to(2, Command::new(opcodes::NODE_RESET))));
    }
}
