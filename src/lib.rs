//! Step Counter Agent - relative step counting on top of a hardware counter.
//!
//! Hardware step counters report an absolute count since boot and batch
//! their samples in a small FIFO while the host sleeps. This library turns
//! that stream into "steps since I started watching", keeps the count alive
//! across process restarts, and drains the FIFO before it overflows.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Step Counter Agent                      │
//! ├─────────────────────────────────────────────────────────────┤
//! │  ┌─────────────┐   ┌─────────────┐   ┌─────────────┐        │
//! │  │ StepSensor  │──▶│  Relative   │──▶│   Event     │──▶ UI  │
//! │  │ (hardware)  │   │  Counter    │   │ Dispatcher  │        │
//! │  └─────────────┘   └─────────────┘   └─────────────┘        │
//! │         ▲                 │                                 │
//! │         │ flush           ▼                                 │
//! │  ┌─────────────┐   ┌─────────────┐                          │
//! │  │   Flush     │   │   Offset    │                          │
//! │  │ Scheduler   │   │   Store     │                          │
//! │  └─────────────┘   └─────────────┘                          │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use step_counter_agent::{
//!     core::ThreadTimer,
//!     sensor::{SimulatedStepSensor, SimulationConfig},
//!     service::{ServiceCommand, ServiceConfig, StepCounterService},
//!     store::MemoryOffsetStore,
//! };
//!
//! let mut service = StepCounterService::new(
//!     ServiceConfig::default(),
//!     Box::new(SimulatedStepSensor::new(SimulationConfig::default())),
//!     Arc::new(ThreadTimer::new()),
//!     Box::new(MemoryOffsetStore::new()),
//!     None,
//! );
//!
//! let events = service.subscribe();
//! service.handle(ServiceCommand::Start).expect("step counter unavailable");
//! println!("{:?}", events.recv());
//! ```

pub mod config;
pub mod core;
pub mod sensor;
pub mod service;
pub mod store;

// Re-export key types at crate root for convenience
pub use config::{Config, ConfigError};
pub use crate::core::{
    compute_interval, CounterState, EventDispatcher, FlushScheduler, RelativeCounter,
    StepListener,
};
pub use sensor::{SensorDelay, SensorError, StepSample, StepSensor};
pub use service::{ServiceCommand, ServiceConfig, ServiceError, StepCounterService};
pub use store::{FileOffsetStore, MemoryOffsetStore, OffsetStore, StoreError};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
