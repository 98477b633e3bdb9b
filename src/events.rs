//! A small process-wide event broker: named signals with zero or more subscribers, two
//! delivery modes, and a per-signal "coalesce to last invocation" override.
//!
//! Modeled on the REDESIGN FLAGS note in the spec ("Model as a value-typed signal with a
//! sink abstraction... deferred delivery goes through a per-process queue drained by the
//! host's pump... the coalesce-to-last option lives on the signal, not the emitter") and,
//! structurally, on `quinn-proto::endpoint::Context`'s accumulate-then-drain event queue
//! (`ctx.events` / `Endpoint::poll`), generalized here from one queue per endpoint to one
//! queue shared by every signal in the process.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use lazy_static::lazy_static;

lazy_static! {
    static ref DEFERRED: Mutex<VecDeque<Box<dyn FnOnce() + Send>>> = Mutex::new(VecDeque::new());
}

/// Runs every deferred invocation queued since the last call, on the calling thread.
/// Hosts (a GUI event loop, a test harness) call this once per pump tick.
pub fn drain() {
    let jobs: Vec<Box<dyn FnOnce() + Send>> = {
        let mut q = DEFERRED.lock().unwrap();
        q.drain(..).collect()
    };
    for job in jobs {
        job();
    }
}

/// Drops every invocation queued since the last drain without running them. Exists for
/// tests that need a clean slate between scenarios that share the process-wide queue.
pub fn clear_deferred_for_test() {
    DEFERRED.lock().unwrap().clear();
}

fn push_deferred(job: Box<dyn FnOnce() + Send>) {
    DEFERRED.lock().unwrap().push_back(job);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Subscribers run synchronously on the emitter's thread.
    Immediate,
    /// Subscribers run the next time [`drain`] is called, on the draining thread.
    Deferred,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionId(u64);

struct Inner<Args> {
    subscribers: Mutex<Vec<(u64, Box<dyn Fn(Args) + Send>)>>,
    next_id: AtomicU64,
    coalesce: AtomicBool,
    generation: AtomicU64,
}

impl<Args: Clone + Send + 'static> Inner<Args> {
    fn invoke_all(&self, args: Args) {
        let subs = self.subscribers.lock().unwrap();
        for (_, callback) in subs.iter() {
            callback(args.clone());
        }
    }
}

/// A named signal with zero or more subscribers. `Args` is the tuple/value type passed to
/// subscribers; use `()` for a signal with no payload.
pub struct Signal<Args> {
    inner: Arc<Inner<Args>>,
}

impl<Args> Clone for Signal<Args> {
    fn clone(&self) -> Self {
        Signal {
            inner: self.inner.clone(),
        }
    }
}

impl<Args: Clone + Send + 'static> Default for Signal<Args> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Args: Clone + Send + 'static> Signal<Args> {
    pub fn new() -> Self {
        Signal {
            inner: Arc::new(Inner {
                subscribers: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(0),
                coalesce: AtomicBool::new(false),
                generation: AtomicU64::new(0),
            }),
        }
    }

    /// When enabled, multiple `Deferred` fires queued before the next [`drain`] collapse
    /// into a single delivery carrying the arguments of the last fire.
    pub fn set_coalesce(&self, enabled: bool) {
        self.inner.coalesce.store(enabled, Ordering::SeqCst);
    }

    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(Args) + Send + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        self.inner
            .subscribers
            .lock()
            .unwrap()
            .push((id, Box::new(callback)));
        SubscriptionId(id)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.inner
            .subscribers
            .lock()
            .unwrap()
            .retain(|(sid, _)| *sid != id.0);
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.lock().unwrap().len()
    }

    /// Invokes subscribers per `mode`. See [`Delivery`].
    pub fn fire(&self, args: Args, mode: Delivery) {
        match mode {
            Delivery::Immediate => self.inner.invoke_all(args),
            Delivery::Deferred => {
                if self.inner.coalesce.load(Ordering::SeqCst) {
                    let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
                    let inner = self.inner.clone();
                    push_deferred(Box::new(move || {
                        // A newer fire may have superseded this one before the drain ran;
                        // in that case this delivery is a silent no-op.
                        if inner.generation.load(Ordering::SeqCst) == generation {
                            inner.invoke_all(args);
                        }
                    }));
                } else {
                    let inner = self.inner.clone();
                    push_deferred(Box::new(move || inner.invoke_all(args)));
                }
            }
        }
    }
}
