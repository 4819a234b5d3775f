//! Periodic hardware FIFO flushes.
//!
//! A batching step counter holds samples in a small hardware FIFO while the
//! host sleeps. If nobody drains it in time, the oldest samples are lost.
//! The scheduler derives a wake interval from the FIFO size and arranges a
//! repeating, jitter-tolerant trigger.

use crossbeam_channel::{bounded, select, tick, Sender};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tracing::{debug, info};

/// Shortest interval ever scheduled, for devices that report no FIFO.
pub const MIN_FLUSH_INTERVAL: Duration = Duration::from_secs(1);

/// Share of the FIFO we allow to fill before flushing, in percent.
const FIFO_HEADROOM_PERCENT: i64 = 90;

/// Called each time a periodic trigger fires.
pub type FlushCallback = Arc<dyn Fn() + Send + Sync>;

/// Wake interval that drains the FIFO before it overflows.
///
/// Only 90% of `fifo_capacity` is budgeted, then converted to whole seconds
/// at `sample_rate_hint` events per second. Non-positive rates count as 1.
pub fn compute_interval(fifo_capacity: i32, sample_rate_hint: i32) -> Duration {
    let max_events = i64::from(fifo_capacity.max(0)) * FIFO_HEADROOM_PERCENT / 100;
    let rate = i64::from(sample_rate_hint.max(1));
    let secs = (max_events / rate) as u64;
    Duration::from_secs(secs).max(MIN_FLUSH_INTERVAL)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerId(pub u64);

/// Host timer/alarm facility.
///
/// Triggers are inexact: they may fire late, and that is fine as long as
/// they fire at roughly the requested cadence.
pub trait TimerFacility: Send + Sync {
    fn set_repeating(&self, interval: Duration, callback: FlushCallback) -> TimerId;

    /// Cancelling an unknown or already cancelled timer does nothing.
    fn cancel(&self, id: TimerId);
}

/// A scheduled periodic flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleHandle {
    id: TimerId,
    interval: Duration,
}

impl ScheduleHandle {
    pub fn interval(&self) -> Duration {
        self.interval
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleState {
    Unscheduled,
    Scheduled,
}

/// Keeps at most one periodic flush registered with a [`TimerFacility`].
pub struct FlushScheduler {
    timer: Arc<dyn TimerFacility>,
    current: Option<ScheduleHandle>,
}

impl FlushScheduler {
    pub fn new(timer: Arc<dyn TimerFacility>) -> Self {
        Self {
            timer,
            current: None,
        }
    }

    /// Register a repeating trigger, replacing any previous one.
    pub fn schedule(&mut self, interval: Duration, on_fire: FlushCallback) -> ScheduleHandle {
        if let Some(previous) = self.current.take() {
            debug!(id = previous.id.0, "Cancelling previous flush schedule");
            self.timer.cancel(previous.id);
        }

        let id = self.timer.set_repeating(interval, on_fire);
        let handle = ScheduleHandle { id, interval };
        self.current = Some(handle);

        info!(
            id = id.0,
            interval_ms = interval.as_millis() as u64,
            "Scheduled periodic step counter flush"
        );
        handle
    }

    pub fn cancel(&mut self, handle: ScheduleHandle) {
        if self.current == Some(handle) {
            self.current = None;
            self.timer.cancel(handle.id);
            debug!(id = handle.id.0, "Flush schedule cancelled");
        }
    }

    /// Cancel whatever is scheduled.
    pub fn cancel_current(&mut self) {
        if let Some(handle) = self.current {
            self.cancel(handle);
        }
    }

    pub fn current(&self) -> Option<ScheduleHandle> {
        self.current
    }

    pub fn state(&self) -> ScheduleState {
        match self.current {
            Some(_) => ScheduleState::Scheduled,
            None => ScheduleState::Unscheduled,
        }
    }
}

impl Drop for FlushScheduler {
    fn drop(&mut self) {
        self.cancel_current();
    }
}

/// Timer facility backed by one background thread per trigger.
#[derive(Default)]
pub struct ThreadTimer {
    next_id: AtomicU64,
    timers: Mutex<HashMap<TimerId, Sender<()>>>,
}

impl ThreadTimer {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TimerFacility for ThreadTimer {
    fn set_repeating(&self, interval: Duration, callback: FlushCallback) -> TimerId {
        let id = TimerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let ticker = tick(interval.max(Duration::from_millis(1)));

        thread::spawn(move || loop {
            select! {
                recv(ticker) -> _ => callback(),
                // a message or a dropped sender both mean stop
                recv(stop_rx) -> _ => break,
            }
        });

        self.timers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, stop_tx);
        id
    }

    fn cancel(&self, id: TimerId) {
        self.timers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);
    }
}

impl Drop for ThreadTimer {
    fn drop(&mut self) {
        self.timers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}

/// Timer facility that only fires when told to.
///
/// For hosts that own their own alarm mechanism and forward its wakeups.
#[derive(Default)]
pub struct ManualTimer {
    next_id: AtomicU64,
    timers: Mutex<BTreeMap<TimerId, (Duration, FlushCallback)>>,
}

impl ManualTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire every registered trigger once. Returns how many fired.
    pub fn fire_all(&self) -> usize {
        let callbacks: Vec<FlushCallback> = self
            .timers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .map(|(_, callback)| callback.clone())
            .collect();

        for callback in &callbacks {
            callback();
        }
        callbacks.len()
    }

    /// Registered triggers and their intervals.
    pub fn active(&self) -> Vec<(TimerId, Duration)> {
        self.timers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(id, (interval, _))| (*id, *interval))
            .collect()
    }
}

impl TimerFacility for ManualTimer {
    fn set_repeating(&self, interval: Duration, callback: FlushCallback) -> TimerId {
        let id = TimerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.timers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, (interval, callback));
        id
    }

    fn cancel(&self, id: TimerId) {
        self.timers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);
    }
}
