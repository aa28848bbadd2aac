//! # Event Dispatcher
//!
//! Distributes each event to every registered listener.
//!
//! ## Design:
//!
//! 1.  **Shared Fan-out**: an event is wrapped in an `Arc` once; every listener
//!     receives a pointer to the same allocation.
//!
//! 2.  **Two listener flavours**: channel-backed [`Subscription`]s for async
//!     consumers, and callbacks that run inline on the dispatching task. The
//!     message router is a callback, so the cache is already updated by the
//!     time channel subscribers see the event.
//!
//! 3.  **Isolation**: a callback that panics is caught at the dispatch
//!     boundary and logged; the remaining listeners still receive the event.
//!     Channel listeners whose receiver is gone are pruned on the next
//!     broadcast.
//!
//! 4.  **RAII**: both handle types unregister themselves on drop, so a view
//!     that goes away cannot leak a handler.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio::sync::mpsc;

type Callback<E> = Arc<dyn Fn(&E) + Send + Sync>;

enum Sink<E> {
    Channel(mpsc::UnboundedSender<Arc<E>>),
    Callback(Callback<E>),
}

struct ListenerHandle<E> {
    id: u64,
    sink: Sink<E>,
}

struct Listeners<E> {
    next_id: u64,
    handles: Vec<ListenerHandle<E>>,
}

impl<E> Listeners<E> {
    fn register(&mut self, sink: Sink<E>) -> u64 {
        self.next_id += 1;
        let id = self.next_id;
        self.handles.push(ListenerHandle { id, sink });
        id
    }
}

fn lock<E>(listeners: &Mutex<Listeners<E>>) -> MutexGuard<'_, Listeners<E>> {
    listeners.lock().unwrap_or_else(PoisonError::into_inner)
}

fn unregister<E>(listeners: &Weak<Mutex<Listeners<E>>>, id: u64) {
    if let Some(listeners) = listeners.upgrade() {
        lock(&listeners).handles.retain(|h| h.id != id);
        tracing::trace!("Listener {} unregistered", id);
    }
}

/// Fan-out hub for events of type `E`.
pub struct Dispatcher<E> {
    listeners: Arc<Mutex<Listeners<E>>>,
}

impl<E> Clone for Dispatcher<E> {
    fn clone(&self) -> Self {
        Self {
            listeners: Arc::clone(&self.listeners),
        }
    }
}

impl<E> Default for Dispatcher<E> {
    fn default() -> Self {
        Self {
            listeners: Arc::new(Mutex::new(Listeners {
                next_id: 0,
                handles: Vec::new(),
            })),
        }
    }
}

impl<E> fmt::Debug for Dispatcher<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("listeners", &self.listener_count())
            .finish()
    }
}

impl<E> Dispatcher<E> {
    /// Creates a dispatcher with no listeners.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of currently registered listeners.
    pub fn listener_count(&self) -> usize {
        lock(&self.listeners).handles.len()
    }

    /// Registers a channel-backed listener.
    ///
    /// `initial` is queued on the new channel before the listener becomes
    /// visible to [`Dispatcher::broadcast`], so it is always received first.
    pub fn add_listener(&self, initial: Option<E>) -> Subscription<E> {
        self.add_listener_with(|| initial)
    }

    /// Like [`Dispatcher::add_listener`], with `initial` computed under the
    /// listener lock. Paired with [`Dispatcher::broadcast_with`] a listener
    /// sees either the initial event or the broadcast, never both.
    pub fn add_listener_with<F>(&self, initial: F) -> Subscription<E>
    where
        F: FnOnce() -> Option<E>,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = {
            let mut listeners = lock(&self.listeners);
            if let Some(event) = initial() {
                // The receiver is alive, this cannot fail.
                let _ = tx.send(Arc::new(event));
            }
            listeners.register(Sink::Channel(tx))
        };
        tracing::trace!("Channel listener {} registered", id);
        Subscription {
            id,
            rx,
            listeners: Arc::downgrade(&self.listeners),
        }
    }

    /// Registers a callback listener that runs inline on the dispatching task.
    ///
    /// When `initial` is given the callback is invoked with it right after
    /// registration.
    pub fn add_callback<F>(&self, initial: Option<E>, callback: F) -> ListenerGuard<E>
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        self.add_callback_with(|| initial, callback)
    }

    /// Like [`Dispatcher::add_callback`], with `initial` computed under the
    /// listener lock.
    pub fn add_callback_with<I, F>(&self, initial: I, callback: F) -> ListenerGuard<E>
    where
        I: FnOnce() -> Option<E>,
        F: Fn(&E) + Send + Sync + 'static,
    {
        let callback: Callback<E> = Arc::new(callback);
        let (id, initial) = {
            let mut listeners = lock(&self.listeners);
            let initial = initial();
            (listeners.register(Sink::Callback(Arc::clone(&callback))), initial)
        };
        tracing::trace!("Callback listener {} registered", id);
        if let Some(event) = initial {
            invoke(id, &callback, &event);
        }
        ListenerGuard {
            id,
            listeners: Arc::downgrade(&self.listeners),
        }
    }

    /// Delivers `event` to every listener. Callbacks run first, in registration
    /// order, then channel listeners. Returns the number of listeners reached.
    pub fn broadcast(&self, event: E) -> usize {
        self.broadcast_with(event, || ())
    }

    /// Runs `before` and takes the recipient list under one lock, then
    /// delivers `event` as [`Dispatcher::broadcast`] does. Listeners added
    /// after `before` ran are not recipients.
    pub fn broadcast_with<F>(&self, event: E, before: F) -> usize
    where
        F: FnOnce(),
    {
        let event = Arc::new(event);

        let (callbacks, channels) = {
            let listeners = lock(&self.listeners);
            before();
            let mut callbacks: Vec<(u64, Callback<E>)> = Vec::new();
            let mut channels: Vec<(u64, mpsc::UnboundedSender<Arc<E>>)> = Vec::new();
            for h in &listeners.handles {
                match &h.sink {
                    Sink::Callback(cb) => callbacks.push((h.id, Arc::clone(cb))),
                    Sink::Channel(tx) => channels.push((h.id, tx.clone())),
                }
            }
            (callbacks, channels)
        };

        // Invoked without holding the lock so callbacks may register or drop
        // listeners themselves.
        let mut delivered = 0;
        for (id, cb) in &callbacks {
            if invoke(*id, cb, &event) {
                delivered += 1;
            }
        }

        let mut gone = Vec::new();
        for (id, tx) in &channels {
            match tx.send(Arc::clone(&event)) {
                Ok(()) => delivered += 1,
                Err(_) => {
                    tracing::debug!("Listener {} is gone. Removing from dispatcher.", id);
                    gone.push(*id);
                }
            }
        }
        if !gone.is_empty() {
            lock(&self.listeners).handles.retain(|h| !gone.contains(&h.id));
        }

        delivered
    }
}

fn invoke<E>(id: u64, callback: &Callback<E>, event: &E) -> bool {
    match catch_unwind(AssertUnwindSafe(|| callback(event))) {
        Ok(()) => true,
        Err(_) => {
            tracing::error!("Listener {} panicked while handling an event; continuing with the others", id);
            false
        }
    }
}

/// Channel-backed listener. Dropping it unsubscribes.
pub struct Subscription<E> {
    id: u64,
    rx: mpsc::UnboundedReceiver<Arc<E>>,
    listeners: Weak<Mutex<Listeners<E>>>,
}

impl<E> Subscription<E> {
    /// Waits for the next event. Returns `None` once the dispatcher is gone.
    pub async fn recv(&mut self) -> Option<Arc<E>> {
        self.rx.recv().await
    }

    /// Returns the next queued event without waiting.
    pub fn try_recv(&mut self) -> Option<Arc<E>> {
        self.rx.try_recv().ok()
    }
}

impl<E> Drop for Subscription<E> {
    fn drop(&mut self) {
        unregister(&self.listeners, self.id);
    }
}

impl<E> fmt::Debug for Subscription<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

/// Handle of a callback listener. Dropping it unsubscribes.
#[must_use = "dropping the guard unregisters the callback"]
pub struct ListenerGuard<E> {
    id: u64,
    listeners: Weak<Mutex<Listeners<E>>>,
}

impl<E> Drop for ListenerGuard<E> {
    fn drop(&mut self) {
        unregister(&self.listeners, self.id);
    }
}

impl<E> fmt::Debug for ListenerGuard<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerGuard").field("id", &self.id).finish()
    }
}
