//! Listener registry for in-process events.
//! Handlers are invoked synchronously in subscription order. A handler that
//! returns an error or panics is logged and skipped; the rest still run.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::warn;

pub type ListenerError = Box<dyn std::error::Error + Send + Sync>;
type Handler<E> = Arc<dyn Fn(&E) -> Result<(), ListenerError> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

pub struct Listeners<E> {
    next_id: AtomicU64,
    handlers: RwLock<Vec<(ListenerId, Handler<E>)>>,
}

impl<E> Default for Listeners<E> {
    fn default() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            handlers: RwLock::new(Vec::new()),
        }
    }
}

impl<E> Listeners<E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, handler: F) -> ListenerId
    where
        F: Fn(&E) -> Result<(), ListenerError> + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers.write().push((id, Arc::new(handler)));
        id
    }

    /// Returns false when the id was not (or no longer) subscribed.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut handlers = self.handlers.write();
        let before = handlers.len();
        handlers.retain(|(h, _)| *h != id);
        handlers.len() != before
    }

    pub fn len(&self) -> usize {
        self.handlers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Dispatch to every handler. Returns how many failed.
    /// Handlers run outside the lock, so they may subscribe or unsubscribe.
    pub fn emit(&self, event: &E) -> usize {
        let snapshot: Vec<(ListenerId, Handler<E>)> = self.handlers.read().clone();
        let mut failed = 0;
        for (id, handler) in snapshot {
            match catch_unwind(AssertUnwindSafe(|| handler(event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    failed += 1;
                    warn!(listener = id.0, error = %e, "event listener failed");
                }
                Err(_) => {
                    failed += 1;
                    warn!(listener = id.0, "event listener panicked");
                }
            }
        }
        failed
    }
}
