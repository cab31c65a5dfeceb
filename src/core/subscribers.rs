//! Record subscriber registry
//!
//! Handlers run synchronously on the channel task, in subscription order.
//! A handler that fails or panics is reported and skipped; the others still
//! see the record.

use parking_lot::Mutex;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use thiserror::Error;
use uuid::Uuid;

/// Error type handlers may return
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Record handler
pub type Handler<R> = Arc<dyn Fn(&R) -> Result<(), HandlerError> + Send + Sync>;

/// Per-subscription error callback
pub type ErrorCallback = Arc<dyn Fn(&SubscriberError) + Send + Sync>;

/// Handler failure
#[derive(Error, Debug)]
pub enum SubscriberError {
    /// Handler returned an error
    #[error("subscriber failed: {0}")]
    Failed(#[source] HandlerError),
    /// Handler panicked
    #[error("subscriber panicked: {0}")]
    Panicked(String),
}

/// One failed delivery
#[derive(Debug)]
pub struct SubscriberFailure {
    pub subscription: Uuid,
    pub error: SubscriberError,
}

struct Entry<R> {
    id: Uuid,
    handler: Handler<R>,
    on_error: Option<ErrorCallback>,
}

struct Slots<R>(Mutex<Vec<Arc<Entry<R>>>>);

trait Detach: Send + Sync {
    fn detach(&self, id: Uuid) -> bool;
}

impl<R> Detach for Slots<R> {
    fn detach(&self, id: Uuid) -> bool {
        let mut entries = self.0.lock();
        let before = entries.len();
        entries.retain(|e| e.id != id);
        entries.len() != before
    }
}

/// Handle returned by `subscribe`.
///
/// Dropping it leaves the handler registered; call [`Subscription::unsubscribe`].
pub struct Subscription {
    id: Uuid,
    slots: Weak<dyn Detach>,
}

impl Subscription {
    /// Subscription id, as reported in failure events
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Remove the handler. Returns `false` if it was already gone.
    pub fn unsubscribe(self) -> bool {
        self.slots.upgrade().is_some_and(|slots| slots.detach(self.id))
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

/// Ordered list of record handlers
pub struct SubscriberRegistry<R> {
    slots: Arc<Slots<R>>,
}

impl<R> Clone for SubscriberRegistry<R> {
    fn clone(&self) -> Self {
        Self {
            slots: Arc::clone(&self.slots),
        }
    }
}

impl<R: 'static> Default for SubscriberRegistry<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: 'static> SubscriberRegistry<R> {
    pub fn new() -> Self {
        Self {
            slots: Arc::new(Slots(Mutex::new(Vec::new()))),
        }
    }

    /// Register a handler
    pub fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&R) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.insert(Arc::new(handler), None)
    }

    /// Register a handler with its own error callback
    pub fn subscribe_with_errors<F, E>(&self, handler: F, on_error: E) -> Subscription
    where
        F: Fn(&R) -> Result<(), HandlerError> + Send + Sync + 'static,
        E: Fn(&SubscriberError) + Send + Sync + 'static,
    {
        self.insert(Arc::new(handler), Some(Arc::new(on_error)))
    }

    fn insert(&self, handler: Handler<R>, on_error: Option<ErrorCallback>) -> Subscription {
        let id = Uuid::new_v4();
        self.slots.0.lock().push(Arc::new(Entry {
            id,
            handler,
            on_error,
        }));

        let slots: Arc<dyn Detach> = self.slots.clone();
        Subscription {
            id,
            slots: Arc::downgrade(&slots),
        }
    }

    /// Number of registered handlers
    pub fn len(&self) -> usize {
        self.slots.0.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver `record` to every handler, returning the failures
    pub fn dispatch(&self, record: &R) -> Vec<SubscriberFailure> {
        // Handlers may (un)subscribe; never call them under the lock
        let snapshot: Vec<Arc<Entry<R>>> = self.slots.0.lock().clone();

        let mut failures = Vec::new();
        for entry in snapshot {
            let error = match panic::catch_unwind(AssertUnwindSafe(|| (entry.handler)(record))) {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => SubscriberError::Failed(e),
                Err(payload) => SubscriberError::Panicked(panic_message(payload.as_ref())),
            };

            if let Some(on_error) = &entry.on_error {
                let _ = panic::catch_unwind(AssertUnwindSafe(|| on_error(&error)));
            }
            failures.push(SubscriberFailure {
                subscription: entry.id,
                error,
            });
        }
        failures
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
