//! Hardware step counter abstraction.
//!
//! The counter never talks to a platform API directly. A host supplies a
//! [`StepSensor`] implementation; this crate ships a [`SimulatedStepSensor`]
//! for machines without step-counting hardware and for tests.

pub mod simulated;
pub mod types;

use std::sync::Arc;
use std::time::Duration;

pub use simulated::{SimulatedStepSensor, SimulationConfig, SimulationHandle};
pub use types::{SensorDelay, StepSample};

/// Callback through which a sensor delivers raw, absolute readings.
///
/// The closure carries its own reference to whatever state it updates.
pub type SampleSink = Arc<dyn Fn(StepSample) + Send + Sync>;

/// A hardware step counter with an event FIFO.
pub trait StepSensor: Send {
    /// Whether the platform exposes a step counter at all.
    fn is_available(&self) -> bool;

    /// Maximum number of events the hardware FIFO can hold before dropping.
    fn fifo_max_event_count(&self) -> i32;

    /// Attach `sink` at the requested sampling delay and batching latency.
    ///
    /// Returns `false` when the hardware rejects the registration.
    fn register(
        &mut self,
        delay: SensorDelay,
        max_report_latency: Duration,
        sink: SampleSink,
    ) -> bool;

    /// Ask the hardware to deliver everything it has buffered.
    fn flush(&mut self) -> bool;

    /// Detach the current sink. No delivery happens after this returns.
    fn unregister(&mut self);
}

/// Errors raised while acquiring the step counter.
#[derive(Debug, thiserror::Error)]
pub enum SensorError {
    #[error("no step counter is available on this device")]
    Unavailable,

    #[error("step counter rejected the listener (delay: {delay}, max latency: {max_report_latency:?})")]
    RegistrationFailed {
        delay: SensorDelay,
        max_report_latency: Duration,
    },

    #[error("step counter is already initialized")]
    AlreadyInitialized,
}
