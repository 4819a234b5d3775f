//! Core functionality for the step counter agent.
//!
//! This module contains:
//! - The relative counting state machine and its hardware session
//! - Flush interval estimation and periodic flush scheduling
//! - Fan-out of relative step events to listeners and observers

pub mod counter;
pub mod dispatcher;
pub mod scheduler;

// Re-export commonly used types
pub use counter::{CounterState, RelativeCounter};
pub use dispatcher::{EventDispatcher, StepListener, SUBSCRIBER_QUEUE_CAPACITY};
pub use scheduler::{
    compute_interval, FlushCallback, FlushScheduler, ManualTimer, ScheduleHandle, ScheduleState,
    ThreadTimer, TimerFacility, TimerId, MIN_FLUSH_INTERVAL,
};
