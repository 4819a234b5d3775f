//! Simulated step counter.
//!
//! Behaves like a hardware step counter with a batching FIFO: the count is
//! absolute since "boot", samples are buffered up to the maximum report
//! latency, the oldest samples are lost when the FIFO overflows, and a
//! registration starts with a zero activation event.

use crate::sensor::types::{SensorDelay, StepSample};
use crate::sensor::{SampleSink, StepSensor};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const WALKER_TICK: Duration = Duration::from_millis(100);

/// Parameters of the simulated hardware.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationConfig {
    /// Steps per second produced by the background walker
    pub cadence_steps_per_sec: f64,
    /// Hardware FIFO size in events (0 disables batching)
    pub fifo_capacity: i32,
    /// Absolute step count already on the counter at startup
    pub boot_steps: i32,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            cadence_steps_per_sec: 1.8,
            fifo_capacity: 600,
            boot_steps: 4_000,
        }
    }
}

struct SimState {
    boot: Instant,
    total_steps: i32,
    capacity: usize,
    fifo: VecDeque<StepSample>,
    oldest_buffered: Option<Instant>,
    sink: Option<SampleSink>,
    max_report_latency: Duration,
    dropped: u64,
}

impl SimState {
    fn now_ns(&self) -> i64 {
        (self.boot.elapsed().as_nanos() as i64).max(1)
    }

    fn enqueue(&mut self, sample: StepSample) {
        if self.sink.is_none() {
            return;
        }

        self.fifo.push_back(sample);
        if self.oldest_buffered.is_none() {
            self.oldest_buffered = Some(Instant::now());
        }

        while self.fifo.len() > self.capacity.max(1) {
            self.fifo.pop_front();
            self.dropped += 1;
        }
    }

    fn batch_due(&self) -> bool {
        if self.capacity == 0 || self.max_report_latency.is_zero() {
            return true;
        }
        self.oldest_buffered
            .map(|t| t.elapsed() >= self.max_report_latency)
            .unwrap_or(false)
    }

    /// Hand everything buffered to the sink.
    ///
    /// Runs with the state locked so deliveries stay ordered and nothing
    /// is delivered once `unregister` has returned.
    fn drain(&mut self) {
        self.oldest_buffered = None;
        let samples: Vec<StepSample> = self.fifo.drain(..).collect();
        if let Some(sink) = self.sink.as_ref() {
            for sample in samples {
                sink(sample);
            }
        }
    }
}

/// Cloneable control surface for a [`SimulatedStepSensor`].
///
/// The sensor itself is usually moved into a counter; the handle keeps
/// driving it from the outside.
#[derive(Clone)]
pub struct SimulationHandle {
    state: Arc<Mutex<SimState>>,
}

impl SimulationHandle {
    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Take `steps` steps now.
    pub fn walk(&self, steps: i32) {
        let mut state = self.lock();
        state.total_steps += steps;
        let sample = StepSample::new(state.now_ns(), state.total_steps);
        state.enqueue(sample);
        if state.batch_due() {
            state.drain();
        }
    }

    /// Inject an exact raw reading into the FIFO.
    pub fn record(&self, sample: StepSample) {
        let mut state = self.lock();
        if !sample.is_spurious() {
            state.total_steps = sample.steps;
        }
        state.enqueue(sample);
        if state.batch_due() {
            state.drain();
        }
    }

    /// Deliver the batch if it has been held for the maximum report latency.
    pub fn deliver_due(&self) {
        let mut state = self.lock();
        if !state.fifo.is_empty() && state.batch_due() {
            state.drain();
        }
    }

    /// Number of samples waiting in the FIFO.
    pub fn buffered(&self) -> usize {
        self.lock().fifo.len()
    }

    /// Number of samples lost to FIFO overflow.
    pub fn dropped(&self) -> u64 {
        self.lock().dropped
    }

    /// Absolute step count since boot.
    pub fn total_steps(&self) -> i32 {
        self.lock().total_steps
    }

    pub fn is_registered(&self) -> bool {
        self.lock().sink.is_some()
    }
}

/// A software step counter implementing [`StepSensor`].
pub struct SimulatedStepSensor {
    config: SimulationConfig,
    handle: SimulationHandle,
    available: bool,
    accepts_registration: bool,
    running: Arc<AtomicBool>,
    thread_handle: Option<JoinHandle<()>>,
}

impl SimulatedStepSensor {
    pub fn new(config: SimulationConfig) -> Self {
        let state = SimState {
            boot: Instant::now(),
            total_steps: config.boot_steps,
            capacity: config.fifo_capacity.max(0) as usize,
            fifo: VecDeque::new(),
            oldest_buffered: None,
            sink: None,
            max_report_latency: Duration::ZERO,
            dropped: 0,
        };

        Self {
            config,
            handle: SimulationHandle {
                state: Arc::new(Mutex::new(state)),
            },
            available: true,
            accepts_registration: true,
            running: Arc::new(AtomicBool::new(false)),
            thread_handle: None,
        }
    }

    /// Pretend the platform has no step counter.
    pub fn unavailable(mut self) -> Self {
        self.available = false;
        self
    }

    /// Pretend the hardware refuses every listener registration.
    pub fn rejecting_registration(mut self) -> Self {
        self.accepts_registration = false;
        self
    }

    pub fn handle(&self) -> SimulationHandle {
        self.handle.clone()
    }

    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }

    /// Start a background thread that walks at the configured cadence.
    pub fn spawn_walker(&mut self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }

        let handle = self.handle.clone();
        let running = self.running.clone();
        let steps_per_tick = self.config.cadence_steps_per_sec * WALKER_TICK.as_secs_f64();

        let join = thread::spawn(move || {
            let mut carry = 0.0_f64;
            while running.load(Ordering::SeqCst) {
                thread::sleep(WALKER_TICK);

                carry += steps_per_tick;
                let whole = carry.floor();
                if whole >= 1.0 {
                    handle.walk(whole as i32);
                    carry -= whole;
                }
                handle.deliver_due();
            }
        });

        self.thread_handle = Some(join);
    }

    /// Stop the background walker, if any.
    pub fn stop_walker(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(join) = self.thread_handle.take() {
            let _ = join.join();
        }
    }
}

impl StepSensor for SimulatedStepSensor {
    fn is_available(&self) -> bool {
        self.available
    }

    fn fifo_max_event_count(&self) -> i32 {
        self.config.fifo_capacity
    }

    fn register(
        &mut self,
        _delay: SensorDelay,
        max_report_latency: Duration,
        sink: SampleSink,
    ) -> bool {
        if !self.available || !self.accepts_registration {
            return false;
        }

        let mut state = self.handle.lock();
        state.sink = Some(sink);
        state.max_report_latency = max_report_latency;
        state.fifo.clear();
        state.oldest_buffered = None;

        // activation event
        if let Some(sink) = state.sink.as_ref() {
            sink(StepSample::ZERO);
        }
        true
    }

    fn flush(&mut self) -> bool {
        let mut state = self.handle.lock();
        if state.sink.is_none() {
            return false;
        }
        state.drain();
        true
    }

    fn unregister(&mut self) {
        let mut state = self.handle.lock();
        state.sink = None;
        state.fifo.clear();
        state.oldest_buffered = None;
    }
}

impl Drop for SimulatedStepSensor {
    fn drop(&mut self) {
        self.stop_walker();
    }
}
