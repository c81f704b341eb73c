//! Simulated hardware.
//!
//! Every collaborator behind [`crate::hal`] has a host implementation here.
//! The handles are cheap to clone and share their state, so a test keeps one
//! clone for inspection and hands the other to the node.
//!
//! `system_reset` panics with "system reset requested"; on a host there is
//! nothing to reset to.

use crate::hal::{
    BoardControl, ConfigStore, HardwareError, LowPowerDriver, TickSource, Transport, WakeTimer,
};
use crate::message::{FrameError, Message};
use crate::node::Hardware;
use node_common::config::LowPowerMode;
use heapless::HistoryBuffer;
use node_common::nvcfg::NvBlock;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Entries kept by the delay and power call logs; older ones are dropped.
pub const LOG_DEPTH: usize = 64;

type Log<T> = HistoryBuffer<T, LOG_DEPTH>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug)]
enum Clock {
    Manual(AtomicU64),
    Realtime(Instant),
}

/// Tick source driven by hand or by the host clock.
#[derive(Debug)]
pub struct SimTicks {
    clock: Clock,
    frequency_hz: u64,
    drift_ppm: i32,
}

impl SimTicks {
    /// Ticks that only move through [`SimTicks::advance`] and [`SimTicks::set`].
    #[must_use]
    pub fn manual(frequency_hz: u64) -> Self {
        Self {
            clock: Clock::Manual(AtomicU64::new(0)),
            frequency_hz,
            drift_ppm: 0,
        }
    }

    /// Ticks derived from the host clock, running `drift_ppm` fast
    /// (negative: slow).
    #[must_use]
    pub fn realtime(frequency_hz: u64, drift_ppm: i32) -> Self {
        Self {
            clock: Clock::Realtime(Instant::now()),
            frequency_hz,
            drift_ppm,
        }
    }

    /// Advance a manual clock. No effect on a realtime clock.
    pub fn advance(&self, ticks: u64) {
        if let Clock::Manual(now) = &self.clock {
            now.fetch_add(ticks, Ordering::AcqRel);
        }
    }

    /// Set a manual clock. No effect on a realtime clock.
    pub fn set(&self, tick: u64) {
        if let Clock::Manual(now) = &self.clock {
            now.store(tick, Ordering::Release);
        }
    }

    /// Advance a manual clock by `duration` worth of ticks.
    pub fn advance_by(&self, duration: Duration) {
        self.advance(self.ticks_for(duration));
    }

    /// Number of ticks in `duration`.
    #[must_use]
    pub fn ticks_for(&self, duration: Duration) -> u64 {
        let ticks = duration.as_nanos() * u128::from(self.frequency_hz) / 1_000_000_000;
        u64::try_from(ticks).unwrap_or(u64::MAX)
    }

    /// Nominal tick frequency.
    #[must_use]
    pub fn frequency_hz(&self) -> u64 {
        self.frequency_hz
    }
}

impl TickSource for SimTicks {
    fn now_tick(&self) -> u64 {
        match &self.clock {
            Clock::Manual(now) => now.load(Ordering::Acquire),
            Clock::Realtime(start) => {
                let rate = 1_000_000 + i128::from(self.drift_ppm);
                let ticks = i128::try_from(start.elapsed().as_nanos()).unwrap_or(i128::MAX)
                    / 1_000
                    * i128::from(self.frequency_hz)
                    * rate
                    / 1_000_000_000_000;
                u64::try_from(ticks.max(0)).unwrap_or(u64::MAX)
            }
        }
    }
}

/// Wake timer that records the armed alarm and the most recent delays.
#[derive(Debug)]
pub struct SimTimer {
    realtime: bool,
    armed: Mutex<Option<u64>>,
    delays: Mutex<Log<Duration>>,
}

impl SimTimer {
    /// Delays are recorded but return immediately.
    #[must_use]
    pub fn manual() -> Self {
        Self {
            realtime: false,
            armed: Mutex::new(None),
            delays: Mutex::new(HistoryBuffer::new()),
        }
    }

    /// Delays block the calling thread.
    #[must_use]
    pub fn realtime() -> Self {
        Self {
            realtime: true,
            ..Self::manual()
        }
    }

    /// Tick at which the wake alarm is armed.
    #[must_use]
    pub fn armed_tick(&self) -> Option<u64> {
        *lock(&self.armed)
    }

    /// Disarm and return the alarm tick.
    pub fn take_armed(&self) -> Option<u64> {
        lock(&self.armed).take()
    }

    /// The last [`LOG_DEPTH`] delays requested, oldest first.
    #[must_use]
    pub fn delays(&self) -> Vec<Duration> {
        lock(&self.delays).oldest_ordered().copied().collect()
    }
}

impl WakeTimer for SimTimer {
    fn arm_wakeup(&self, at_tick: u64) {
        *lock(&self.armed) = Some(at_tick);
    }

    fn delay(&self, duration: Duration) {
        lock(&self.delays).write(duration);
        if self.realtime {
            std::thread::sleep(duration);
        }
    }
}

/// Calls made on [`SimPower`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerCall {
    /// `radio_sleep`
    RadioSleep,
    /// `suspend_tick`
    SuspendTick,
    /// `resume_tick`
    ResumeTick,
    /// `enter_deep_sleep`
    EnterDeepSleep(LowPowerMode),
    /// `restore_core_clock`
    RestoreCoreClock,
    /// `restore_peripheral_clocks`
    RestorePeripheralClocks,
    /// `enable_peripherals`
    EnablePeripherals,
    /// `enable_interrupts`
    EnableInterrupts,
    /// `system_reset`
    SystemReset,
}

/// Low-power driver that logs its most recent calls.
#[derive(Debug, Clone, Default)]
pub struct SimPower {
    calls: Arc<Mutex<Log<PowerCall>>>,
    fail_clock_lock: Arc<AtomicBool>,
}

impl SimPower {
    /// Create a driver with an empty call log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The last [`LOG_DEPTH`] calls, oldest first.
    #[must_use]
    pub fn calls(&self) -> Vec<PowerCall> {
        lock(&self.calls).oldest_ordered().copied().collect()
    }

    /// Forget recorded calls.
    pub fn clear(&self) {
        lock(&self.calls).clear();
    }

    /// Make the next core clock restore fail.
    pub fn fail_clock_lock(&self, fail: bool) {
        self.fail_clock_lock.store(fail, Ordering::Release);
    }

    fn record(&self, call: PowerCall) {
        lock(&self.calls).write(call);
    }
}

impl LowPowerDriver for SimPower {
    fn radio_sleep(&mut self) {
        self.record(PowerCall::RadioSleep);
    }

    fn suspend_tick(&mut self) {
        self.record(PowerCall::SuspendTick);
    }

    fn resume_tick(&mut self) {
        self.record(PowerCall::ResumeTick);
    }

    fn enter_deep_sleep(&mut self, mode: LowPowerMode) {
        self.record(PowerCall::EnterDeepSleep(mode));
    }

    fn restore_core_clock(&mut self) -> Result<(), HardwareError> {
        self.record(PowerCall::RestoreCoreClock);
        if self.fail_clock_lock.load(Ordering::Acquire) {
            return Err(HardwareError::ClockLock("HSE"));
        }
        Ok(())
    }

    fn restore_peripheral_clocks(&mut self) {
        self.record(PowerCall::RestorePeripheralClocks);
    }

    fn enable_peripherals(&mut self) {
        self.record(PowerCall::EnablePeripherals);
    }

    fn enable_interrupts(&mut self) {
        self.record(PowerCall::EnableInterrupts);
    }

    fn system_reset(&mut self) -> ! {
        self.record(PowerCall::SystemReset);
        panic!("system reset requested by low-power driver");
    }
}

/// Observable state of [`SimBoard`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BoardState {
    /// Enable line.
    pub enabled: bool,
    /// External power rail.
    pub ext_power: bool,
    /// Indicator output.
    pub indicator: bool,
    /// Number of wake pulses.
    pub wake_count: u32,
    /// Number of enable-line transitions.
    pub toggle_count: u32,
    /// Number of indicator pulses (rising edges).
    pub indicator_pulses: u32,
}

/// Board control lines held in memory.
#[derive(Debug, Clone, Default)]
pub struct SimBoard {
    state: Arc<Mutex<BoardState>>,
}

impl SimBoard {
    /// Create a board that is disabled.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the control lines.
    #[must_use]
    pub fn state(&self) -> BoardState {
        *lock(&self.state)
    }
}

impl BoardControl for SimBoard {
    fn set_enabled(&mut self, enabled: bool) {
        let mut state = lock(&self.state);
        if state.enabled != enabled {
            state.toggle_count += 1;
        }
        state.enabled = enabled;
    }

    fn is_enabled(&self) -> bool {
        lock(&self.state).enabled
    }

    fn wake(&mut self) {
        lock(&self.state).wake_count += 1;
    }

    fn set_ext_power(&mut self, on: bool) {
        lock(&self.state).ext_power = on;
    }

    fn set_indicator(&mut self, on: bool) {
        let mut state = lock(&self.state);
        if on && !state.indicator {
            state.indicator_pulses += 1;
        }
        state.indicator = on;
    }

    fn system_reset(&mut self) -> ! {
        panic!("system reset requested by command");
    }
}

#[derive(Debug)]
struct LinkState {
    inbound: VecDeque<Result<Message, FrameError>>,
    outbound: Vec<Message>,
    capacity: usize,
}

/// In-memory message transport.
#[derive(Debug, Clone)]
pub struct SimLink {
    state: Arc<Mutex<LinkState>>,
}

impl Default for SimLink {
    fn default() -> Self {
        Self::with_capacity(64)
    }
}

impl SimLink {
    /// Create a link whose output buffer holds `capacity` messages.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(LinkState {
                inbound: VecDeque::new(),
                outbound: Vec::new(),
                capacity,
            })),
        }
    }

    /// Queue a decoded inbound message.
    pub fn push(&self, message: Message) {
        lock(&self.state).inbound.push_back(Ok(message));
    }

    /// Queue an inbound frame that failed to decode.
    pub fn push_error(&self, error: FrameError) {
        lock(&self.state).inbound.push_back(Err(error));
    }

    /// Number of inbound messages not yet received.
    #[must_use]
    pub fn pending(&self) -> usize {
        lock(&self.state).inbound.len()
    }

    /// Messages sent so far.
    #[must_use]
    pub fn sent(&self) -> Vec<Message> {
        lock(&self.state).outbound.clone()
    }

    /// Drain the output buffer.
    pub fn take_sent(&self) -> Vec<Message> {
        std::mem::take(&mut lock(&self.state).outbound)
    }
}

impl Transport for SimLink {
    fn receive(&mut self) -> Option<Result<Message, FrameError>> {
        lock(&self.state).inbound.pop_front()
    }

    fn send(&mut self, message: &Message) -> bool {
        let mut state = lock(&self.state);
        if state.outbound.len() >= state.capacity {
            return false;
        }
        state.outbound.push(*message);
        true
    }
}

#[derive(Debug, Default)]
struct StoreState {
    block: Option<NvBlock>,
    fail_writes: bool,
    writes: u32,
}

/// Persistent store kept in memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<StoreState>>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store that already holds `block`.
    #[must_use]
    pub fn with_block(block: NvBlock) -> Self {
        let store = Self::new();
        lock(&store.state).block = Some(block);
        store
    }

    /// Stored block.
    #[must_use]
    pub fn block(&self) -> Option<NvBlock> {
        lock(&self.state).block
    }

    /// Number of successful writes.
    #[must_use]
    pub fn writes(&self) -> u32 {
        lock(&self.state).writes
    }

    /// Make writes fail.
    pub fn fail_writes(&self, fail: bool) {
        lock(&self.state).fail_writes = fail;
    }
}

impl ConfigStore for MemoryStore {
    fn load_config(&mut self) -> Option<NvBlock> {
        lock(&self.state).block
    }

    fn save_config(&mut self, block: &NvBlock) -> bool {
        let mut state = lock(&self.state);
        if state.fail_writes {
            return false;
        }
        state.block = Some(*block);
        state.writes += 1;
        true
    }
}

/// A complete set of simulated collaborators.
#[derive(Debug, Clone)]
pub struct SimHardware {
    /// Tick source.
    pub ticks: Arc<SimTicks>,
    /// Wake timer.
    pub timer: Arc<SimTimer>,
    /// Low-power driver.
    pub power: SimPower,
    /// Board control.
    pub board: SimBoard,
    /// Message transport.
    pub link: SimLink,
    /// Persistent store.
    pub store: MemoryStore,
}

impl SimHardware {
    /// Hand-driven hardware for deterministic tests.
    #[must_use]
    pub fn manual(frequency_hz: u64) -> Self {
        Self {
            ticks: Arc::new(SimTicks::manual(frequency_hz)),
            timer: Arc::new(SimTimer::manual()),
            power: SimPower::new(),
            board: SimBoard::new(),
            link: SimLink::default(),
            store: MemoryStore::new(),
        }
    }

    /// Hardware running on the host clock.
    #[must_use]
    pub fn realtime(frequency_hz: u64, drift_ppm: i32) -> Self {
        Self {
            ticks: Arc::new(SimTicks::realtime(frequency_hz, drift_ppm)),
            timer: Arc::new(SimTimer::realtime()),
            ..Self::manual(frequency_hz)
        }
    }

    /// Replace the persistent store.
    #[must_use]
    pub fn with_store(mut self, store: MemoryStore) -> Self {
        self.store = store;
        self
    }

    /// Replace the transport.
    #[must_use]
    pub fn with_link(mut self, link: SimLink) -> Self {
        self.link = link;
        self
    }

    /// Collaborator bundle for [`crate::node::NodeContext::new`], sharing
    /// state with `self`.
    #[must_use]
    pub fn hardware(&self) -> Hardware {
        Hardware {
            ticks: self.ticks.clone(),
            timer: self.timer.clone(),
            power: Box::new(self.power.clone()),
            board: Box::new(self.board.clone()),
            transport: Box::new(self.link.clone()),
            store: Box::new(self.store.clone()),
        }
    }
}
