// Ordered multicast of lifecycle events and inbound ops to registered observers.
use arc_swap::ArcSwap;
use parking_lot::Mutex;
use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

// Returns false once the observer wants to be dropped from the registry.
type ObserverFn<T> = Box<dyn Fn(&T) -> bool + Send + Sync>;

/// Registry of observers for one kind of value.
///
/// Dispatch walks a snapshot in registration order. A panicking observer is
/// logged and skipped; the remaining observers still receive the value.
///
/// ```
/// use natter_client::Dispatcher;
/// use std::sync::{Arc, Mutex};
///
/// let dispatcher: Dispatcher<u32> = Dispatcher::new("numbers");
/// let seen = Arc::new(Mutex::new(Vec::new()));
/// let sink = Arc::clone(&seen);
/// let handle = dispatcher.subscribe(move |value| sink.lock().unwrap().push(*value));
/// dispatcher.dispatch(&7);
/// drop(handle);
/// dispatcher.dispatch(&8);
/// assert_eq!(*seen.lock().unwrap(), vec![7]);
/// ```
pub struct Dispatcher<T: 'static> {
    registry: Arc<Registry<T>>,
}

struct Registry<T> {
    name: &'static str,
    // Read by dispatch without taking the lock.
    snapshot: ArcSwap<Vec<Arc<Entry<T>>>>,
    // Mutated only on subscribe/unsubscribe paths.
    state: Mutex<RegistryState<T>>,
}

struct RegistryState<T> {
    next_id: u64,
    entries: Vec<Arc<Entry<T>>>,
}

struct Entry<T> {
    id: u64,
    active: AtomicBool,
    observer: ObserverFn<T>,
}

trait Detach: Send + Sync {
    fn detach(&self, id: u64);
}

/// Keeps an observer registered; dropping it unsubscribes.
#[must_use = "dropping the handle unsubscribes the observer"]
pub struct ObserverHandle {
    registry: Weak<dyn Detach>,
    id: u64,
}

impl ObserverHandle {
    pub fn unsubscribe(self) {}

    /// Whether the registry this observer belongs to still exists.
    pub fn is_attached(&self) -> bool {
        self.registry.strong_count() > 0
    }
}

impl Drop for ObserverHandle {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.detach(self.id);
        }
    }
}

impl<T: Send + Sync + 'static> Dispatcher<T> {
    pub fn new(name: &'static str) -> Self {
        Self {
            registry: Arc::new(Registry {
                name,
                snapshot: ArcSwap::from_pointee(Vec::new()),
                state: Mutex::new(RegistryState {
                    next_id: 0,
                    entries: Vec::new(),
                }),
            }),
        }
    }

    pub fn subscribe<F>(&self, observer: F) -> ObserverHandle
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = self.registry.insert(Box::new(move |value| {
            observer(value);
            true
        }));
        let registry: Weak<dyn Detach> = Arc::downgrade(&self.registry) as Weak<dyn Detach>;
        ObserverHandle { registry, id }
    }

    /// Adapts the registry to a bounded channel.
    ///
    /// A full channel drops the value for that receiver only; a closed one is
    /// unsubscribed on the next dispatch.
    pub fn subscribe_channel(&self, capacity: usize) -> mpsc::Receiver<T>
    where
        T: Clone,
    {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let name = self.registry.name;
        self.registry
            .insert(Box::new(move |value: &T| match tx.try_send(value.clone()) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    debug!(dispatcher = name, "channel observer full; value dropped");
                    true
                }
                Err(TrySendError::Closed(_)) => false,
            }));
        rx
    }

    pub fn dispatch(&self, value: &T) {
        let snapshot = self.registry.snapshot.load_full();
        for entry in snapshot.iter() {
            if !entry.active.load(Ordering::Acquire) {
                continue;
            }
            match catch_unwind(AssertUnwindSafe(|| (entry.observer)(value))) {
                Ok(true) => {}
                Ok(false) => self.registry.detach(entry.id),
                Err(payload) => warn!(
                    dispatcher = self.registry.name,
                    observer = entry.id,
                    panic = panic_message(payload.as_ref()),
                    "observer panicked"
                ),
            }
        }
    }

    /// Drops every observer.
    pub fn clear(&self) {
        let mut state = self.registry.state.lock();
        for entry in state.entries.drain(..) {
            entry.active.store(false, Ordering::Release);
        }
        self.registry.snapshot.store(Arc::new(Vec::new()));
    }

    pub fn len(&self) -> usize {
        self.registry.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: 'static> Clone for Dispatcher<T> {
    fn clone(&self) -> Self {
        Self {
            registry: Arc::clone(&self.registry),
        }
    }
}

impl<T> Registry<T> {
    fn insert(&self, observer: ObserverFn<T>) -> u64 {
        let mut state = self.state.lock();
        let id = state.next_id;
        state.next_id += 1;
        state.entries.push(Arc::new(Entry {
            id,
            active: AtomicBool::new(true),
            observer,
        }));
        self.snapshot.store(Arc::new(state.entries.clone()));
        id
    }
}

impl<T: 'static> Detach for Registry<T> {
    fn detach(&self, id: u64) {
        let mut state = self.state.lock();
        let Some(position) = state.entries.iter().position(|entry| entry.id == id) else {
            return;
        };
        let entry = state.entries.remove(position);
        entry.active.store(false, Ordering::Release);
        self.snapshot.store(Arc::new(state.entries.clone()));
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "non-string panic payload"
    }
}
