//! Protocol message model exchanged with the transport.
//!
//! Byte framing and CRC checks belong to the transport; messages arrive here
//! already decoded, or as a [`FrameError`] describing why decoding failed.

use thiserror::Error;

/// Target id addressing every node.
pub const BROADCAST_ID: u16 = 0xFFFF;

/// Number of argument bytes carried by a command.
pub const COMMAND_ARG_LEN: usize = 8;

/// Command opcodes understood by the node.
pub mod opcodes {
    /// Generic system reset.
    pub const SYSTEM_RESET: u16 = 0x0001;
    /// Node-specific reset.
    pub const NODE_RESET: u16 = 0x0100;
    /// Enable the attached board at a given time.
    pub const BOARD_ENABLE: u16 = 0x0101;
    /// Disable the attached board at a given time.
    pub const BOARD_DISABLE: u16 = 0x0102;
    /// Configure the periodic board enable.
    pub const BOARD_ENABLE_PERIODIC: u16 = 0x0103;
    /// Switch the external power rail immediately.
    pub const BOARD_POWER_EXT: u16 = 0x0104;
    /// Outbound: tell the board which wake-up mode to use.
    pub const BOARD_WAKEUP_MODE: u16 = 0x0201;
}

/// Header common to all messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MessageHeader {
    /// Originating device.
    pub device_id: u16,
    /// Addressed device ([`BROADCAST_ID`] for all).
    pub target_id: u16,
    /// Per-sender sequence number.
    pub seq_no: u16,
    /// UNIX time in microseconds at which the sender generated the message.
    pub generation_time_us: u64,
}

/// A protocol command with its raw argument bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Command {
    /// Opcode, see [`opcodes`].
    pub opcode: u16,
    /// Argument bytes; interpretation depends on the opcode.
    pub args: [u8; COMMAND_ARG_LEN],
}

impl Command {
    /// Create a command with zeroed arguments.
    #[must_use]
    pub fn new(opcode: u16) -> Self {
        Self {
            opcode,
            args: [0; COMMAND_ARG_LEN],
        }
    }

    /// Builder: set a byte argument.
    #[must_use]
    pub fn with_u8(mut self, index: usize, value: u8) -> Self {
        if let Some(b) = self.args.get_mut(index) {
            *b = value;
        }
        self
    }

    /// Builder: set a little-endian u16 argument at byte offset `offset`.
    #[must_use]
    pub fn with_u16(mut self, offset: usize, value: u16) -> Self {
        if let Some(dst) = self.args.get_mut(offset..offset + 2) {
            dst.copy_from_slice(&value.to_le_bytes());
        }
        self
    }

    /// Builder: set a little-endian u32 argument at byte offset `offset`.
    #[must_use]
    pub fn with_u32(mut self, offset: usize, value: u32) -> Self {
        if let Some(dst) = self.args.get_mut(offset..offset + 4) {
            dst.copy_from_slice(&value.to_le_bytes());
        }
        self
    }

    /// Byte argument at `index` (0 if out of range).
    #[must_use]
    pub fn arg_u8(&self, index: usize) -> u8 {
        self.args.get(index).copied().unwrap_or(0)
    }

    /// Little-endian u16 argument at byte offset `offset` (0 if out of range).
    #[must_use]
    pub fn arg_u16(&self, offset: usize) -> u16 {
        match self.args.get(offset..offset + 2) {
            Some(b) => u16::from_le_bytes([b[0], b[1]]),
            None => 0,
        }
    }

    /// Little-endian u32 argument at byte offset `offset` (0 if out of range).
    #[must_use]
    pub fn arg_u32(&self, offset: usize) -> u32 {
        match self.args.get(offset..offset + 4) {
            Some(b) => u32::from_le_bytes([b[0], b[1], b[2], b[3]]),
            None => 0,
        }
    }
}

/// Message body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Payload {
    /// A command for the node.
    Command(Command),
    /// Time value from the time master (UNIX microseconds).
    TimeSync {
        /// UNIX time in microseconds at the last time-request edge.
        unix_time_us: u64,
    },
    /// Any other message type, identified by its raw type id.
    Other {
        /// Raw message type id.
        type_id: u8,
    },
}

/// A decoded protocol message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Message {
    /// Message header.
    pub header: MessageHeader,
    /// Message body.
    pub payload: Payload,
}

impl Message {
    /// Returns true if the message is addressed to `node_id` or broadcast.
    #[must_use]
    pub fn is_for(&self, node_id: u16) -> bool {
        self.header.target_id == node_id || self.header.target_id == BROADCAST_ID
    }
}

/// Reasons an inbound frame could not be turned into a [`Message`].
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    /// CRC mismatch.
    #[error("CRC mismatch (src: {device_id}, len: {len}B)")]
    Crc {
        /// Claimed originating device.
        device_id: u16,
        /// Frame length in bytes.
        len: usize,
    },

    /// Frame too long or payload empty.
    #[error("invalid frame length {len}B")]
    Length {
        /// Frame length in bytes.
        len: usize,
    },

    /// The transport failed to read a frame.
    #[error("transport read failed")]
    ReadFailed,
}
