//! Interrupt entry points.
//!
//! Both handlers only latch state, apply `Wakeup` and give the duty task its
//! token; everything else happens in task context.

use crate::node::NodeContext;
use node_common::state::OpModeEvent;
use tracing::trace;

/// Rising edge on the time-request line.
pub fn on_time_request_edge(node: &NodeContext) {
    let tick = node.ticks().now_tick();
    let captured = node.sync().capture_request_edge(tick);
    node.power().apply_event(OpModeEvent::Wakeup);
    trace!(tick, captured, "time request edge");
    node.notify_duty();
}

/// Periodic wake alarm fired.
pub fn on_wake_timer(node: &NodeContext) {
    node.power().apply_event(OpModeEvent::Wakeup);
    node.notify_duty();
}
