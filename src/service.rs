//! Long-lived host for the step counter.
//!
//! The service owns the counter, the flush schedule and the offset store,
//! and processes start, flush, reset and stop requests one at a time from a
//! single mailbox. Periodic flush triggers only post a request to that
//! mailbox, so every state change happens on the service's own thread.

use crate::config::Config;
use crate::core::{
    compute_interval, EventDispatcher, FlushCallback, FlushScheduler, RelativeCounter,
    StepListener, TimerFacility,
};
use crate::sensor::{SensorDelay, SensorError, StepSample, StepSensor};
use crate::store::OffsetStore;
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

const MAILBOX_POLL: Duration = Duration::from_millis(100);

/// Requests the host maps from its own triggers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceCommand {
    /// Start or resume; reports the current value
    Start,
    /// Drain the hardware FIFO and persist the current value
    Flush,
    /// Re-anchor the count at zero and persist it
    Reset,
    /// Release the hardware, cancel flushes, persist the current value
    Stop,
}

/// Sensor parameters used by the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceConfig {
    pub sensor_delay: SensorDelay,
    pub max_report_latency: Duration,
    pub sample_rate_hint: i32,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for ServiceConfig {
    fn from(config: &Config) -> Self {
        Self {
            sensor_delay: config.sensor_delay,
            max_report_latency: config.max_report_latency,
            sample_rate_hint: config.sample_rate_hint,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error(transparent)]
    Sensor(#[from] SensorError),

    #[error("step counter service has been stopped")]
    Stopped,
}

pub struct StepCounterService {
    config: ServiceConfig,
    counter: RelativeCounter,
    scheduler: FlushScheduler,
    store: Box<dyn OffsetStore>,
    dispatcher: EventDispatcher,
    commands_tx: Sender<ServiceCommand>,
    commands_rx: Receiver<ServiceCommand>,
    stopped: bool,
}

impl StepCounterService {
    /// Build the service, loading the persisted offset from `store`.
    pub fn new(
        config: ServiceConfig,
        sensor: Box<dyn StepSensor>,
        timer: Arc<dyn TimerFacility>,
        store: Box<dyn OffsetStore>,
        listener: Option<Arc<dyn StepListener>>,
    ) -> Self {
        let offset = match store.load() {
            Ok(offset) => {
                info!(
                    timestamp = offset.timestamp,
                    steps = offset.steps,
                    "Loaded step offset"
                );
                offset
            }
            Err(e) => {
                warn!(error = %e, "Could not load step offset, starting from zero");
                StepSample::ZERO
            }
        };

        let (commands_tx, commands_rx) = unbounded();

        Self {
            config,
            counter: RelativeCounter::new(sensor, offset),
            scheduler: FlushScheduler::new(timer),
            store,
            dispatcher: EventDispatcher::new(listener),
            commands_tx,
            commands_rx,
            stopped: false,
        }
    }

    /// Observe every relative step event this service produces.
    pub fn subscribe(&self) -> Receiver<StepSample> {
        self.dispatcher.subscribe()
    }

    /// Mailbox for requests from other threads.
    pub fn command_sender(&self) -> Sender<ServiceCommand> {
        self.commands_tx.clone()
    }

    pub fn counter(&self) -> &RelativeCounter {
        &self.counter
    }

    pub fn scheduler(&self) -> &FlushScheduler {
        &self.scheduler
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Process one request and return the value reported for it.
    ///
    /// A failure to acquire the sensor stops the service for good.
    pub fn handle(&mut self, command: ServiceCommand) -> Result<StepSample, ServiceError> {
        if command == ServiceCommand::Stop {
            self.shutdown();
            return Ok(self.counter.last_seen_relative());
        }
        if self.stopped {
            return Err(ServiceError::Stopped);
        }

        if let Err(e) = self.ensure_started() {
            error!(error = %e, "Step counter unavailable, stopping service");
            self.shutdown();
            return Err(e);
        }

        match command {
            ServiceCommand::Flush => {
                info!("Flushing step counter sensor data");
                self.counter.flush();
                self.persist();
            }
            ServiceCommand::Reset => {
                info!("Resetting step counter relative anchor");
                self.counter.reset();
                self.persist();
            }
            ServiceCommand::Start | ServiceCommand::Stop => {}
        }

        Ok(self.counter.publish_current())
    }

    /// Handle everything already in the mailbox without blocking.
    pub fn process_pending(&mut self) -> usize {
        let mut processed = 0;
        while let Ok(command) = self.commands_rx.try_recv() {
            if let Err(e) = self.handle(command) {
                warn!(?command, error = %e, "Request failed");
            }
            processed += 1;
        }
        processed
    }

    /// Start, then serve the mailbox until `running` clears or a stop
    /// request arrives.
    pub fn run(mut self, running: Arc<AtomicBool>) -> Result<(), ServiceError> {
        self.handle(ServiceCommand::Start)?;

        while running.load(Ordering::SeqCst) && !self.stopped {
            match self.commands_rx.recv_timeout(MAILBOX_POLL) {
                Ok(command) => self.handle(command).map(|_| ())?,
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        self.shutdown();
        Ok(())
    }

    /// Release the sensor, cancel flushes and persist the current value.
    pub fn shutdown(&mut self) {
        if self.stopped {
            return;
        }

        self.counter.deinitialize();
        self.scheduler.cancel_current();
        self.persist();
        self.stopped = true;
        info!("Step counter service stopped");
    }

    fn ensure_started(&mut self) -> Result<(), ServiceError> {
        if self.counter.is_initialized() {
            return Ok(());
        }

        self.counter.initialize(
            self.config.sensor_delay,
            self.config.max_report_latency,
            self.dispatcher.clone(),
        )?;

        let interval = compute_interval(
            self.counter.fifo_max_event_count(),
            self.config.sample_rate_hint,
        );
        let commands = self.commands_tx.clone();
        let on_fire: FlushCallback = Arc::new(move || {
            let _ = commands.send(ServiceCommand::Flush);
        });
        self.scheduler.schedule(interval, on_fire);
        Ok(())
    }

    fn persist(&self) {
        let current = self.counter.last_seen_relative();
        match self.store.save(current) {
            Ok(()) => info!(
                timestamp = current.timestamp,
                steps = current.steps,
                "Persisted step offset"
            ),
            Err(e) => warn!(error = %e, "Could not persist step offset"),
        }
    }
}

impl Drop for StepCounterService {
    fn drop(&mut self) {
        self.shutdown();
    }
}
