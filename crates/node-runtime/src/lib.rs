#![doc = "Runtime control plane for the battery-powered sensor node."]

pub mod dispatch;
pub mod hal;
pub mod interrupts;
pub mod lpm;
pub mod message;
pub mod node;
pub mod notify;
pub mod queue;
#[cfg(any(test, feature = "simulated"))]
pub mod sim;
pub mod tasks;
pub mod timesync;
pub mod watchdog;

pub use dispatch::*;
pub use hal::*;
pub use interrupts::*;
pub use lpm::*;
pub use message::{FrameError, Message, MessageHeader, Payload};
pub use node::*;
pub use notify::*;
pub use queue::*;
pub use tasks::*;
pub use timesync::*;
pub use watchdog::*;
