//! Fan-out of relative step events.
//!
//! Every published value goes to at most one direct listener (fixed at
//! construction) and to any number of broadcast subscribers, which may come
//! and go at any time.

use crate::sensor::types::StepSample;
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use std::sync::{Arc, Mutex};

/// Events queued per broadcast subscriber before new ones are dropped.
pub const SUBSCRIBER_QUEUE_CAPACITY: usize = 10_000;

/// Receives relative step events synchronously.
///
/// Called while the counter holds its publish lock: reading the counter is
/// fine, resetting it from here is not.
pub trait StepListener: Send + Sync {
    fn on_step_count(&self, event: StepSample);
}

impl<F> StepListener for F
where
    F: Fn(StepSample) + Send + Sync,
{
    fn on_step_count(&self, event: StepSample) {
        self(event)
    }
}

/// Cheaply cloneable publisher; clones share listener and subscribers.
#[derive(Clone, Default)]
pub struct EventDispatcher {
    listener: Option<Arc<dyn StepListener>>,
    subscribers: Arc<Mutex<Vec<Sender<StepSample>>>>,
}

impl EventDispatcher {
    pub fn new(listener: Option<Arc<dyn StepListener>>) -> Self {
        Self {
            listener,
            subscribers: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// A dispatcher with a direct listener.
    pub fn with_listener<L: StepListener + 'static>(listener: L) -> Self {
        Self::new(Some(Arc::new(listener)))
    }

    /// Register a new broadcast observer.
    ///
    /// Dropping the receiver unsubscribes it on the next publish. A receiver
    /// that falls [`SUBSCRIBER_QUEUE_CAPACITY`] events behind misses the
    /// newer ones until it catches up.
    pub fn subscribe(&self) -> Receiver<StepSample> {
        let (sender, receiver) = bounded(SUBSCRIBER_QUEUE_CAPACITY);
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(sender);
        receiver
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn publish(&self, event: StepSample) {
        if let Some(listener) = &self.listener {
            listener.on_step_count(event);
        }

        let mut subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        subscribers.retain(|sender| match sender.try_send(event) {
            Ok(()) | Err(TrySendError::Full(_)) => true,
            Err(TrySendError::Disconnected(_)) => false,
        });
    }
}
