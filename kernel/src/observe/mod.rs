// State Broadcasting
//
// Fans state changes out to monitoring listeners. Logging, membership
// changes and dispatch all happen inside one exclusive region, so every
// listener observes events in the same total order in which
// `apply_new_info` was called.

use std::any::Any;
use std::cell::RefCell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::{Mutex, ReentrantMutex};

/// An event that can be described in the resource-keyed log.
pub trait StateChange: Send + Sync {
    fn description(&self) -> String;
}

/// Failure reported by a listener. It is logged and otherwise ignored.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("listener failed: {0}")]
pub struct ListenerError(pub String);

/// Receives every change broadcast after it was registered.
///
/// Listeners run inside the broadcaster's exclusive region and should
/// return quickly. They may add or remove listeners from within the
/// callback; such changes apply from the next event on.
pub trait StateListener<C>: Send + Sync {
    fn on_state_change(&self, resource_id: &str, change: &C) -> Result<(), ListenerError>;
}

/// Destination for `[resourceId] description` lines.
pub trait StateLog: Send + Sync {
    fn append(&self, line: &str);
}

/// Writes state lines through `tracing` under the `plan_state` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingStateLog;

impl StateLog for TracingStateLog {
    fn append(&self, line: &str) {
        tracing::info!(target: "plan_state", "{line}");
    }
}

/// Keeps every state line in memory.
#[derive(Debug, Default)]
pub struct MemoryStateLog {
    lines: Mutex<Vec<String>>,
}

impl MemoryStateLog {
    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().clone()
    }
}

impl StateLog for MemoryStateLog {
    fn append(&self, line: &str) {
        self.lines.lock().push(line.to_string());
    }
}

/// Handle returned by [`StateBroadcaster::add_listener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Outcome of one broadcast.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Delivery {
    pub delivered: usize,
    pub failed: usize,
}

struct Registry<C> {
    next_id: u64,
    listeners: Vec<(ListenerId, Arc<dyn StateListener<C>>)>,
}

pub struct StateBroadcaster<C> {
    region: ReentrantMutex<RefCell<Registry<C>>>,
    log: Arc<dyn StateLog>,
}

impl<C: StateChange> StateBroadcaster<C> {
    pub fn new(log: Arc<dyn StateLog>) -> Self {
        Self {
            region: ReentrantMutex::new(RefCell::new(Registry {
                next_id: 0,
                listeners: Vec::new(),
            })),
            log,
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn StateListener<C>>) -> ListenerId {
        let guard = self.region.lock();
        let mut registry = guard.borrow_mut();
        let id = ListenerId(registry.next_id);
        registry.next_id += 1;
        registry.listeners.push((id, listener));
        id
    }

    /// Returns `false` if the listener was not registered.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let guard = self.region.lock();
        let mut registry = guard.borrow_mut();
        let before = registry.listeners.len();
        registry.listeners.retain(|(existing, _)| *existing != id);
        registry.listeners.len() != before
    }

    pub fn listener_count(&self) -> usize {
        self.region.lock().borrow().listeners.len()
    }

    /// Log the change and deliver it to every registered listener.
    pub fn apply_new_info(&self, resource_id: &str, change: &C) -> Delivery {
        let guard = self.region.lock();

        self.log
            .append(&format!("[{resource_id}] {}", change.description()));

        // Listeners may re-enter and mutate membership, so iterate over
        // the set that was current when the event arrived.
        let listeners: Vec<_> = guard
            .borrow()
            .listeners
            .iter()
            .map(|(id, listener)| (*id, Arc::clone(listener)))
            .collect();

        let mut delivery = Delivery::default();
        for (id, listener) in listeners {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                listener.on_state_change(resource_id, change)
            }));
            match outcome {
                Ok(Ok(())) => delivery.delivered += 1,
                Ok(Err(err)) => {
                    delivery.failed += 1;
                    tracing::warn!(
                        listener = ?id,
                        resource = resource_id,
                        error = %err,
                        "state listener failed"
                    );
                }
                Err(payload) => {
                    delivery.failed += 1;
                    tracing::warn!(
                        listener = ?id,
                        resource = resource_id,
                        panic = %panic_message(payload.as_ref()),
                        "state listener panicked"
                    );
                }
            }
        }
        delivery
    }
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
