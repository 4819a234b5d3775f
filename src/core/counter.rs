//! Relative step counting.
//!
//! The hardware reports an absolute count since boot. The counter pins the
//! first valid reading of each session as an anchor and reports everything
//! relative to it, plus an offset that carries the count across restarts.

use crate::core::dispatcher::EventDispatcher;
use crate::sensor::types::{SensorDelay, StepSample};
use crate::sensor::{SampleSink, SensorError, StepSensor};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// The counting state machine, free of any hardware concerns.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterState {
    /// Raw sample all later samples are measured from
    pub anchor: Option<StepSample>,
    /// Most recent raw sample
    pub last_seen: Option<StepSample>,
    /// `last_seen - anchor`
    pub last_relative: StepSample,
    /// Persisted correction added when reporting
    pub offset: StepSample,
}

impl CounterState {
    pub fn with_offset(offset: StepSample) -> Self {
        Self {
            offset,
            ..Self::default()
        }
    }

    /// The value reported to observers.
    pub fn relative(&self) -> StepSample {
        self.last_relative + self.offset
    }

    /// Feed one raw reading. Returns the value to report, or `None` when the
    /// reading was discarded.
    pub fn accept(&mut self, sample: StepSample) -> Option<StepSample> {
        if sample.is_spurious() {
            return None;
        }

        let anchor = match self.anchor {
            Some(anchor) if sample.is_at_or_after(&anchor) => anchor,
            Some(anchor) => {
                // The counter restarted underneath us; keep what was counted
                // so far and start over from this reading.
                warn!(
                    ?anchor,
                    ?sample,
                    "Raw step counter went backwards, re-anchoring"
                );
                self.offset = self.relative();
                self.anchor = Some(sample);
                sample
            }
            None => {
                self.anchor = Some(sample);
                sample
            }
        };

        self.last_seen = Some(sample);
        self.last_relative = sample - anchor;
        Some(self.relative())
    }

    /// Re-anchor at the last seen sample and clear the offset.
    ///
    /// Returns `false` (and changes nothing) if no sample has been seen.
    pub fn reset(&mut self) -> bool {
        let Some(last_seen) = self.last_seen else {
            return false;
        };
        self.anchor = Some(last_seen);
        self.last_relative = StepSample::ZERO;
        self.offset = StepSample::ZERO;
        true
    }

    /// Start a new initialization epoch.
    ///
    /// Progress made in the previous epoch is folded into the offset so the
    /// reported value does not jump back.
    pub fn begin_epoch(&mut self) {
        self.offset = self.relative();
        self.anchor = None;
        self.last_seen = None;
        self.last_relative = StepSample::ZERO;
    }
}

struct Shared {
    state: CounterState,
    session: Option<Uuid>,
    dispatcher: Option<EventDispatcher>,
}

fn lock(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(|e| e.into_inner())
}

/// Lock shared by everything that publishes, so observers see events in the
/// order the state produced them. Always taken before the state lock.
type PublishLock = Mutex<()>;

fn lock_publish(publish: &PublishLock) -> MutexGuard<'_, ()> {
    publish.lock().unwrap_or_else(|e| e.into_inner())
}

/// Apply a raw reading and publish the result.
///
/// The state lock is released before listeners run; the publish lock is held
/// throughout, so a concurrent reset cannot slip between the two.
fn apply_sample(
    shared: &Mutex<Shared>,
    publish: &PublishLock,
    sample: StepSample,
    session: Option<Uuid>,
) {
    let _order = lock_publish(publish);
    let (event, dispatcher) = {
        let mut guard = lock(shared);
        if session.is_some() && guard.session != session {
            debug!(?sample, "Dropping sample from a detached session");
            return;
        }

        match guard.state.accept(sample) {
            Some(event) => {
                debug!(
                    timestamp = sample.timestamp,
                    steps = sample.steps,
                    "Step counter sample"
                );
                (event, guard.dispatcher.clone())
            }
            None => {
                debug!(?sample, "Ignoring spurious step counter sample");
                return;
            }
        }
    };

    if let Some(dispatcher) = dispatcher {
        dispatcher.publish(event);
    }
}

/// Wraps a [`StepSensor`] and turns its absolute readings into relative ones.
pub struct RelativeCounter {
    sensor: Box<dyn StepSensor>,
    shared: Arc<Mutex<Shared>>,
    publish: Arc<PublishLock>,
    registered: bool,
}

impl RelativeCounter {
    /// Create a counter that adds `offset` to everything it reports.
    pub fn new(sensor: Box<dyn StepSensor>, offset: StepSample) -> Self {
        Self {
            sensor,
            shared: Arc::new(Mutex::new(Shared {
                state: CounterState::with_offset(offset),
                session: None,
                dispatcher: None,
            })),
            publish: Arc::new(Mutex::new(())),
            registered: false,
        }
    }

    /// Acquire the step counter and start listening.
    ///
    /// Events go to `listener` until [`deinitialize`](Self::deinitialize).
    pub fn initialize(
        &mut self,
        sensor_delay: SensorDelay,
        max_report_latency: Duration,
        listener: EventDispatcher,
    ) -> Result<(), SensorError> {
        if self.registered {
            return Err(SensorError::AlreadyInitialized);
        }

        info!("Initializing step counter sensor");
        if !self.sensor.is_available() {
            return Err(SensorError::Unavailable);
        }

        let session = Uuid::new_v4();
        let previous = {
            let mut guard = lock(&self.shared);
            let previous = guard.state;
            guard.state.begin_epoch();
            guard.session = Some(session);
            guard.dispatcher = Some(listener);
            previous
        };

        let shared = self.shared.clone();
        let publish = self.publish.clone();
        let sink: SampleSink = Arc::new(move |sample: StepSample| {
            apply_sample(&shared, &publish, sample, Some(session))
        });

        if !self.sensor.register(sensor_delay, max_report_latency, sink) {
            let mut guard = lock(&self.shared);
            guard.state = previous;
            guard.session = None;
            guard.dispatcher = None;
            return Err(SensorError::RegistrationFailed {
                delay: sensor_delay,
                max_report_latency,
            });
        }

        self.registered = true;
        info!(
            %session,
            delay = %sensor_delay,
            max_report_latency_ms = max_report_latency.as_millis() as u64,
            "Step counter listening"
        );
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.registered
    }

    /// Identifier of the current initialization epoch.
    pub fn session_id(&self) -> Option<Uuid> {
        lock(&self.shared).session
    }

    /// Feed one raw reading, as the hardware callback does.
    pub fn on_raw_sample(&self, sample: StepSample) {
        apply_sample(&self.shared, &self.publish, sample, None);
    }

    /// Relative value since the anchor, plus the offset.
    pub fn last_seen_relative(&self) -> StepSample {
        lock(&self.shared).state.relative()
    }

    /// Copy of the full counting state.
    pub fn state(&self) -> CounterState {
        lock(&self.shared).state
    }

    /// Publish the current value to the session's listener.
    ///
    /// Ordered with sample deliveries, so it never overtakes an event
    /// computed before it. Returns the value, published or not.
    pub fn publish_current(&self) -> StepSample {
        let _order = lock_publish(&self.publish);
        let (current, dispatcher) = {
            let guard = lock(&self.shared);
            (guard.state.relative(), guard.dispatcher.clone())
        };
        if let Some(dispatcher) = dispatcher {
            dispatcher.publish(current);
        }
        current
    }

    /// Make the last seen sample the new anchor and clear the offset.
    ///
    /// Waits for any delivery that is being published.
    pub fn reset(&self) {
        let _order = lock_publish(&self.publish);
        let mut guard = lock(&self.shared);
        if guard.state.reset() {
            info!(anchor = ?guard.state.anchor, "Step counter re-anchored");
        } else {
            warn!("Reset requested before any step counter sample was seen");
        }
    }

    /// Ask the hardware to deliver its buffered samples.
    pub fn flush(&mut self) {
        if !self.registered {
            debug!("Flush ignored, step counter is not initialized");
            return;
        }
        if !self.sensor.flush() {
            warn!("Step counter rejected the flush request");
        }
    }

    /// Hardware FIFO size, used to pace periodic flushes.
    pub fn fifo_max_event_count(&self) -> i32 {
        self.sensor.fifo_max_event_count()
    }

    /// Stop listening and release the hardware. Counting state is kept.
    pub fn deinitialize(&mut self) {
        if self.registered {
            self.sensor.unregister();
            self.registered = false;
            info!("Step counter released");
        }

        let mut guard = lock(&self.shared);
        guard.session = None;
        guard.dispatcher = None;
    }
}

impl Drop for RelativeCounter {
    fn drop(&mut self) {
        self.deinitialize();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensor::{SimulatedStepSensor, SimulationConfig, SimulationHandle};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;

    fn counter_with(offset: StepSample) -> (RelativeCounter, SimulationHandle) {
        let sensor = SimulatedStepSensor::new(SimulationConfig::default());
        let handle = sensor.handle();
        (RelativeCounter::new(Box::new(sensor), offset), handle)
    }

    #[test]
    fn test_first_sample_anchors() {
        let mut state = CounterState::default();
        assert_eq!(state.accept(StepSample::new(100, 5)), Some(StepSample::ZERO));
        assert_eq!(state.anchor, Some(StepSample::new(100, 5)));
        assert_eq!(state.accept(StepSample::new(200, 12)), Some(StepSample::new(100, 7)));
    }

    #[test]
    fn test_relative_tracks_raw_minus_anchor() {
        let mut state = CounterState::default();
        let anchor = StepSample::new(1_000, 250);
        state.accept(anchor);

        let mut raw = anchor;
        for i in 1..50 {
            raw = StepSample::new(raw.timestamp + 10 * i, raw.steps + (i % 7) as i32);
            state.accept(raw);
            assert_eq!(state.relative(), raw - anchor);
        }
    }

    #[test]
    fn test_spurious_samples_do_not_mutate() {
        let mut state = CounterState::default();
        state.accept(StepSample::new(100, 5));
        let before = state;

        assert_eq!(state.accept(StepSample::new(0, 9)), None);
        assert_eq!(state.accept(StepSample::new(500, 0)), None);
        assert_eq!(state, before);
    }

    #[test]
    fn test_reset_clears_offset() {
        let mut state = CounterState::with_offset(StepSample::new(50, 3));
        state.accept(StepSample::new(100, 5));
        state.accept(StepSample::new(300, 20));

        assert!(state.reset());
        assert_eq!(state.relative(), StepSample::ZERO);
        assert_eq!(state.anchor, Some(StepSample::new(300, 20)));

        state.accept(StepSample::new(400, 26));
        assert_eq!(state.relative(), StepSample::new(100, 6));
    }

    #[test]
    fn test_reset_without_samples_is_noop() {
        let mut state = CounterState::with_offset(StepSample::new(50, 3));
        let before = state;
        assert!(!state.reset());
        assert_eq!(state, before);
    }

    #[test]
    fn test_counter_going_backwards_keeps_progress() {
        let mut state = CounterState::default();
        state.accept(StepSample::new(100, 500));
        state.accept(StepSample::new(200, 530));

        // raw counter restarted
        assert_eq!(state.accept(StepSample::new(50, 4)), Some(StepSample::new(100, 30)));
        assert_eq!(state.accept(StepSample::new(80, 10)), Some(StepSample::new(130, 36)));
        assert!(state.last_relative.steps >= 0 && state.last_relative.timestamp >= 0);
    }

    #[test]
    fn test_offset_near_limits_wraps() {
        let mut state = CounterState::with_offset(StepSample::new(0, i32::MAX));
        state.accept(StepSample::new(100, 5));
        assert_eq!(
            state.accept(StepSample::new(200, 6)),
            Some(StepSample::new(100, i32::MIN))
        );
    }

    #[test]
    fn test_new_epoch_folds_progress_into_offset() {
        let mut state = CounterState::with_offset(StepSample::new(10, 1));
        state.accept(StepSample::new(100, 5));
        state.accept(StepSample::new(150, 9));

        state.begin_epoch();
        assert_eq!(state.offset, StepSample::new(60, 5));
        assert_eq!(state.anchor, None);
        assert_eq!(state.relative(), StepSample::new(60, 5));
    }

    #[test]
    fn test_scenario_two_events_after_activation() {
        let (mut counter, handle) = counter_with(StepSample::ZERO);
        let dispatcher = EventDispatcher::default();
        let events = dispatcher.subscribe();

        counter
            .initialize(SensorDelay::Normal, Duration::ZERO, dispatcher)
            .unwrap();
        handle.record(StepSample::new(0, 0));
        handle.record(StepSample::new(100, 5));
        handle.record(StepSample::new(200, 12));

        let received: Vec<StepSample> = events.try_iter().collect();
        assert_eq!(received, vec![StepSample::ZERO, StepSample::new(100, 7)]);
    }

    #[test]
    fn test_scenario_loaded_offset_is_reported() {
        let (mut counter, handle) = counter_with(StepSample::new(50, 3));
        let dispatcher = EventDispatcher::default();
        let events = dispatcher.subscribe();

        counter
            .initialize(SensorDelay::Normal, Duration::ZERO, dispatcher)
            .unwrap();
        handle.record(StepSample::new(100, 5));

        assert_eq!(events.try_recv().unwrap(), StepSample::new(50, 3));
        assert_eq!(counter.last_seen_relative(), StepSample::new(50, 3));
    }

    #[test]
    fn test_reset_before_any_sample() {
        let (counter, _) = counter_with(StepSample::new(50, 3));
        let before = counter.state();
        counter.reset();
        assert_eq!(counter.state(), before);
    }

    #[test]
    fn test_flush_delivers_buffered_samples() {
        let (mut counter, handle) = counter_with(StepSample::ZERO);
        counter
            .initialize(
                SensorDelay::Normal,
                Duration::from_secs(3600),
                EventDispatcher::default(),
            )
            .unwrap();

        handle.walk(3);
        handle.walk(4);
        assert_eq!(counter.last_seen_relative(), StepSample::ZERO);

        counter.flush();
        assert_eq!(counter.last_seen_relative().steps, 4);

        // nothing buffered, nothing changes
        let before = counter.last_seen_relative();
        counter.flush();
        assert_eq!(counter.last_seen_relative(), before);
    }

    #[test]
    fn test_initialize_errors() {
        let sensor = SimulatedStepSensor::new(SimulationConfig::default()).unavailable();
        let mut counter = RelativeCounter::new(Box::new(sensor), StepSample::ZERO);
        let err = counter
            .initialize(SensorDelay::Normal, Duration::ZERO, EventDispatcher::default())
            .unwrap_err();
        assert!(matches!(err, SensorError::Unavailable));

        let sensor =
            SimulatedStepSensor::new(SimulationConfig::default()).rejecting_registration();
        let mut counter = RelativeCounter::new(Box::new(sensor), StepSample::ZERO);
        let err = counter
            .initialize(SensorDelay::Game, Duration::ZERO, EventDispatcher::default())
            .unwrap_err();
        assert!(matches!(err, SensorError::RegistrationFailed { .. }));
        assert!(!counter.is_initialized());
    }

    #[test]
    fn test_double_initialize_is_rejected() {
        let (mut counter, _) = counter_with(StepSample::ZERO);
        counter
            .initialize(SensorDelay::Normal, Duration::ZERO, EventDispatcher::default())
            .unwrap();
        let err = counter
            .initialize(SensorDelay::Normal, Duration::ZERO, EventDispatcher::default())
            .unwrap_err();
        assert!(matches!(err, SensorError::AlreadyInitialized));
    }

    #[test]
    fn test_deinitialize_is_idempotent_and_keeps_state() {
        let (mut counter, handle) = counter_with(StepSample::ZERO);
        counter
            .initialize(SensorDelay::Normal, Duration::ZERO, EventDispatcher::default())
            .unwrap();
        handle.record(StepSample::new(100, 5));
        handle.record(StepSample::new(200, 9));

        counter.deinitialize();
        counter.deinitialize();
        assert!(!counter.is_initialized());
        assert!(!handle.is_registered());
        assert_eq!(counter.last_seen_relative(), StepSample::new(100, 4));

        handle.record(StepSample::new(300, 20));
        assert_eq!(counter.last_seen_relative(), StepSample::new(100, 4));
    }

    /// Lets a test refuse registrations after the first one.
    struct SwitchableSensor {
        inner: SimulatedStepSensor,
        accepts: Arc<AtomicBool>,
    }

    impl StepSensor for SwitchableSensor {
        fn is_available(&self) -> bool {
            self.inner.is_available()
        }

        fn fifo_max_event_count(&self) -> i32 {
            self.inner.fifo_max_event_count()
        }

        fn register(
            &mut self,
            delay: SensorDelay,
            max_report_latency: Duration,
            sink: SampleSink,
        ) -> bool {
            self.accepts.load(Ordering::SeqCst)
                && self.inner.register(delay, max_report_latency, sink)
        }

        fn flush(&mut self) -> bool {
            self.inner.flush()
        }

        fn unregister(&mut self) {
            self.inner.unregister()
        }
    }

    #[test]
    fn test_failed_registration_keeps_previous_state() {
        let inner = SimulatedStepSensor::new(SimulationConfig::default());
        let handle = inner.handle();
        let accepts = Arc::new(AtomicBool::new(true));
        let sensor = SwitchableSensor {
            inner,
            accepts: accepts.clone(),
        };
        let mut counter = RelativeCounter::new(Box::new(sensor), StepSample::ZERO);

        counter
            .initialize(SensorDelay::Normal, Duration::ZERO, EventDispatcher::default())
            .unwrap();
        handle.record(StepSample::new(100, 5));
        handle.record(StepSample::new(200, 12));
        counter.deinitialize();
        let before = counter.state();

        accepts.store(false, Ordering::SeqCst);
        let err = counter
            .initialize(SensorDelay::Normal, Duration::ZERO, EventDispatcher::default())
            .unwrap_err();
        assert!(matches!(err, SensorError::RegistrationFailed { .. }));
        assert_eq!(counter.state(), before);
        assert_eq!(counter.session_id(), None);

        counter.reset();
        assert_eq!(counter.state().anchor, Some(StepSample::new(200, 12)));
        assert_eq!(counter.last_seen_relative(), StepSample::ZERO);
    }

    #[test]
    fn test_reset_waits_for_in_flight_event() {
        let (paused_tx, paused_rx) = crossbeam_channel::bounded::<()>(1);
        let dispatcher = EventDispatcher::with_listener(move |event: StepSample| {
            if event.steps == 7 {
                let _ = paused_tx.send(());
                thread::sleep(Duration::from_millis(100));
            }
        });
        let events = dispatcher.subscribe();

        let (mut counter, handle) = counter_with(StepSample::ZERO);
        counter
            .initialize(SensorDelay::Normal, Duration::ZERO, dispatcher)
            .unwrap();
        handle.record(StepSample::new(100, 5));

        let sim = handle.clone();
        let delivery = thread::spawn(move || sim.record(StepSample::new(200, 12)));
        paused_rx.recv_timeout(Duration::from_secs(2)).unwrap();

        // lands while the (100, 7) event is still being published
        counter.reset();
        let current = counter.publish_current();
        delivery.join().unwrap();

        let received: Vec<StepSample> = events.try_iter().collect();
        assert_eq!(
            received,
            vec![StepSample::ZERO, StepSample::new(100, 7), StepSample::ZERO]
        );
        assert_eq!(current, counter.last_seen_relative());
    }

    #[test]
    fn test_concurrent_samples_and_resets_stay_consistent() {
        let (mut counter, handle) = counter_with(StepSample::ZERO);
        let dispatcher = EventDispatcher::default();
        let events = dispatcher.subscribe();
        counter
            .initialize(SensorDelay::Normal, Duration::ZERO, dispatcher)
            .unwrap();

        let sim = handle.clone();
        let walker = thread::spawn(move || {
            for _ in 0..2_000 {
                sim.walk(1);
            }
        });

        for _ in 0..200 {
            counter.reset();
            let state = counter.state();
            assert!(state.last_relative.steps >= 0);
            assert!(state.last_relative.timestamp >= 0);
            thread::yield_now();
        }
        walker.join().unwrap();
        let current = counter.publish_current();

        let received: Vec<StepSample> = events.try_iter().collect();
        assert!(received.iter().all(|e| e.steps >= 0 && e.timestamp >= 0));
        assert_eq!(received.last(), Some(&current));
        assert_eq!(current, counter.last_seen_relative());
    }

    #[test]
    fn test_no_samples_accepted_after_deinitialize() {
        let (mut counter, handle) = counter_with(StepSample::ZERO);
        let dispatcher = EventDispatcher::default();
        let events = dispatcher.subscribe();
        counter
            .initialize(SensorDelay::Normal, Duration::ZERO, dispatcher)
            .unwrap();

        let running = Arc::new(AtomicBool::new(true));
        let flag = running.clone();
        let sim = handle.clone();
        let walker = thread::spawn(move || {
            while flag.load(Ordering::SeqCst) {
                sim.walk(1);
                thread::yield_now();
            }
        });

        thread::sleep(Duration::from_millis(20));
        counter.deinitialize();
        let frozen = counter.state();
        let delivered = events.try_iter().count();

        thread::sleep(Duration::from_millis(50));
        running.store(false, Ordering::SeqCst);
        walker.join().unwrap();

        assert!(delivered > 0);
        assert_eq!(counter.state(), frozen);
        assert_eq!(events.try_iter().count(), 0);
        let last_accepted = frozen.last_seen.map(|s| s.steps).unwrap_or_default();
        assert!(handle.total_steps() > last_accepted);
    }
}
