//! Local tick to UNIX time mapping with drift tracking.
//!
//! A synchronization round has three steps:
//!
//! 1. [`TimeSync::capture_request_edge`] latches the local tick when the time
//!    master raises the request line (interrupt context).
//! 2. [`TimeSync::accept_sync`] pairs that tick with the UNIX time the master
//!    sends back (task context).
//! 3. [`TimeSync::reconcile`] compares the new sync point with the previous
//!    one, estimates the oscillator drift and folds it into a smoothed average
//!    (task context, once per duty cycle).
//!
//! Drift is in ppm, negative when the local oscillator runs slower than the
//! master. A sample at or beyond the configured maximum is rejected, but its
//! sync point still becomes the anchor for the next interval.

use crate::hal::TickSource;
use critical_section::Mutex;
use node_common::config::{NodeConfig, TimesyncConfig};
use node_common::error::{NodeError, NodeResult};
use node_common::time::micros_to_secs;
use std::cell::RefCell;
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

/// Parts per million, also microseconds per second.
const PPM: i128 = 1_000_000;

/// Result of one [`TimeSync::reconcile`] step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// No new sync point since the last step.
    Idle,
    /// First sync point; it only becomes the anchor.
    Anchored,
    /// Sample folded into the average.
    Accepted {
        /// Measured drift of this interval.
        drift_ppm: i32,
        /// Smoothed drift after folding the sample in.
        average_ppm: i32,
    },
    /// Sample out of bounds; the average is unchanged.
    Rejected {
        /// Measured drift of this interval.
        drift_ppm: i64,
    },
    /// Master time did not advance between the two sync points.
    Discarded,
}

#[derive(Debug, Clone, Copy, Default)]
struct SyncState {
    unix_time_at_sync: u64,
    local_tick_at_sync: u64,
    average_drift_ppm: Option<i32>,
    captured_tick: u64,
    sync_requested: bool,
    sync_updated: bool,
    /// The outstanding request already survived one reconcile.
    request_aged: bool,
    last_request_tick: Option<u64>,
    /// Previous sync point (tick, UNIX µs).
    anchor: Option<(u64, u64)>,
}

/// Time synchronization engine.
pub struct TimeSync {
    state: Mutex<RefCell<SyncState>>,
    ticks: Arc<dyn TickSource>,
    tick_frequency_hz: u64,
    isr_latency_ticks: u64,
    bounds: TimesyncConfig,
}

impl std::fmt::Debug for TimeSync {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeSync")
            .field("tick_frequency_hz", &self.tick_frequency_hz)
            .field("average_drift_ppm", &self.average_drift_ppm())
            .finish_non_exhaustive()
    }
}

impl TimeSync {
    /// Create an engine with no sync point. Until the first sync, `now`
    /// counts from tick zero.
    pub fn new(ticks: Arc<dyn TickSource>, config: &NodeConfig) -> Self {
        Self {
            state: Mutex::new(RefCell::new(SyncState::default())),
            ticks,
            tick_frequency_hz: config.tick_frequency_hz,
            isr_latency_ticks: config.isr_latency_ticks,
            bounds: config.timesync.clone(),
        }
    }

    /// Latch `now_tick` for a new time request.
    ///
    /// Called from the request-line interrupt. Returns false (and changes
    /// nothing but the watchdog reference) if a request is already
    /// outstanding.
    pub fn capture_request_edge(&self, now_tick: u64) -> bool {
        critical_section::with(|cs| {
            let mut st = self.state.borrow_ref_mut(cs);
            st.last_request_tick = Some(now_tick);
            if st.sync_requested {
                return false;
            }
            st.captured_tick = now_tick.saturating_sub(self.isr_latency_ticks);
            st.sync_requested = true;
            st.request_aged = false;
            true
        })
    }

    /// Pair the outstanding request with the master's UNIX time.
    ///
    /// # Errors
    ///
    /// [`NodeError::NoPendingRequest`] if no request is outstanding; the
    /// state is left untouched.
    pub fn accept_sync(&self, unix_time_us: u64) -> NodeResult<()> {
        let accepted = critical_section::with(|cs| {
            let mut st = self.state.borrow_ref_mut(cs);
            if !st.sync_requested {
                return None;
            }
            st.unix_time_at_sync = unix_time_us;
            st.local_tick_at_sync = st.captured_tick;
            st.sync_requested = false;
            st.request_aged = false;
            st.sync_updated = true;
            Some(st.captured_tick)
        });

        match accepted {
            Some(tick) => {
                debug!(unix_time_us, tick, "sync point accepted");
                Ok(())
            }
            None => {
                warn!(unix_time_us, "no time request pending, sync value dropped");
                Err(NodeError::NoPendingRequest { unix_time_us })
            }
        }
    }

    /// Fold the latest sync point into the drift estimate.
    pub fn reconcile(&self) -> ReconcileOutcome {
        let (outcome, expired) = critical_section::with(|cs| {
            let mut st = self.state.borrow_ref_mut(cs);

            let mut expired = false;
            if st.sync_requested {
                if st.request_aged {
                    st.sync_requested = false;
                    st.request_aged = false;
                    expired = true;
                } else {
                    st.request_aged = true;
                }
            }

            if !st.sync_updated {
                return (ReconcileOutcome::Idle, expired);
            }
            st.sync_updated = false;

            let current = (st.local_tick_at_sync, st.unix_time_at_sync);
            let Some(previous) = st.anchor.replace(current) else {
                return (ReconcileOutcome::Anchored, expired);
            };

            let outcome = match self.drift_ppm(previous, current) {
                None => ReconcileOutcome::Discarded,
                Some(drift) if drift.unsigned_abs() >= u64::from(self.bounds.max_drift_ppm.unsigned_abs()) => {
                    ReconcileOutcome::Rejected { drift_ppm: drift }
                }
                Some(drift) => {
                    // |drift| < max_drift_ppm, so it fits
                    let drift = i32::try_from(drift).unwrap_or(0);
                    let average = match st.average_drift_ppm {
                        Some(avg) => (avg + drift) / 2,
                        None => drift,
                    }
                    .clamp(-self.bounds.max_drift_ppm, self.bounds.max_drift_ppm);
                    st.average_drift_ppm = Some(average);
                    ReconcileOutcome::Accepted {
                        drift_ppm: drift,
                        average_ppm: average,
                    }
                }
            };
            (outcome, expired)
        });

        if expired {
            warn!("time request not answered within one cycle, dropped");
        }
        match outcome {
            ReconcileOutcome::Idle => trace!("no new sync point"),
            ReconcileOutcome::Anchored => info!("first sync point, clock anchored"),
            ReconcileOutcome::Accepted {
                drift_ppm,
                average_ppm,
            } => {
                if drift_ppm.abs() > self.bounds.typical_drift_ppm {
                    warn!(
                        drift_ppm,
                        typical = self.bounds.typical_drift_ppm,
                        "drift above typical value"
                    );
                }
                debug!(drift_ppm, average_ppm, "drift updated");
            }
            ReconcileOutcome::Rejected { drift_ppm } => warn!(
                drift_ppm,
                max = self.bounds.max_drift_ppm,
                "drift out of bounds, sample rejected"
            ),
            ReconcileOutcome::Discarded => {
                warn!("master time did not advance between sync points");
            }
        }
        outcome
    }

    /// Drift between two sync points, `None` if the master interval is not
    /// positive.
    fn drift_ppm(
        &self,
        (prev_tick, prev_unix): (u64, u64),
        (tick, unix): (u64, u64),
    ) -> Option<i64> {
        let local_elapsed_us =
            (i128::from(tick) - i128::from(prev_tick)) * PPM / i128::from(self.tick_frequency_hz);
        let master_elapsed_us = i128::from(unix) - i128::from(prev_unix);
        if master_elapsed_us <= 0 {
            return None;
        }
        // Rounded, not truncated: 99.6 ppm counts as 100 and hits the bound
        let drift = div_round(
            (local_elapsed_us - master_elapsed_us) * PPM,
            master_elapsed_us,
        );
        Some(i64::try_from(drift).unwrap_or(if drift < 0 { i64::MIN } else { i64::MAX }))
    }

    /// UNIX time in microseconds at `tick`.
    #[must_use]
    pub fn time_at(&self, tick: u64) -> u64 {
        let st = critical_section::with(|cs| *self.state.borrow_ref(cs));
        let rate = PPM - i128::from(st.average_drift_ppm.unwrap_or(0));
        let elapsed = i128::from(tick) - i128::from(st.local_tick_at_sync);
        let t = i128::from(st.unix_time_at_sync)
            + elapsed * rate / i128::from(self.tick_frequency_hz);
        u64::try_from(t.max(0)).unwrap_or(u64::MAX)
    }

    /// Current UNIX time in microseconds.
    #[must_use]
    pub fn now_us(&self) -> u64 {
        self.time_at(self.ticks.now_tick())
    }

    /// Current UNIX time in whole seconds.
    #[must_use]
    pub fn now_secs(&self) -> u32 {
        micros_to_secs(self.now_us())
    }

    /// Smoothed drift, 0 before the first accepted sample.
    #[must_use]
    pub fn average_drift_ppm(&self) -> i32 {
        critical_section::with(|cs| self.state.borrow_ref(cs).average_drift_ppm.unwrap_or(0))
    }

    /// Returns true while a captured request waits for its time value.
    #[must_use]
    pub fn is_request_pending(&self) -> bool {
        critical_section::with(|cs| self.state.borrow_ref(cs).sync_requested)
    }

    /// Returns true once a sync point has been reconciled.
    #[must_use]
    pub fn is_synchronized(&self) -> bool {
        critical_section::with(|cs| self.state.borrow_ref(cs).anchor.is_some())
    }

    /// Tick of the most recent request edge, outstanding or not.
    #[must_use]
    pub fn last_request_tick(&self) -> Option<u64> {
        critical_section::with(|cs| self.state.borrow_ref(cs).last_request_tick)
    }

    /// Local tick rate.
    #[must_use]
    pub fn tick_frequency_hz(&self) -> u64 {
        self.tick_frequency_hz
    }
}

/// Integer division rounding half away from zero. `d` must be positive.
fn div_round(n: i128, d: i128) -> i128 {
    if n >= 0 {
        (n + d / 2) / d
    } else {
        (n - d / 2) / d
    }
}
