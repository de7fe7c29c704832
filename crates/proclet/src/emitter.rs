//! Ordering-preserving asynchronous pub/sub.
//!
//! [`EventEmitter::emit`] never runs listeners inline. It snapshots the
//! listener ids registered for the key and queues the delivery to a single
//! dispatcher task, so:
//!
//! - deliveries run in emission order, listeners in registration order;
//! - a listener registered during an emission sees the next emission only;
//! - a listener removed before its delivery runs is skipped.
//!
//! Listener panics are caught and logged; the remaining listeners still run.

use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio::sync::{mpsc, oneshot};

type Listener<E> = Arc<dyn Fn(E) + Send + Sync>;

/// Handle for one registration. Stands in for the listener's identity in `off`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct Registration<E> {
    id: ListenerId,
    once: bool,
    listener: Listener<E>,
}

enum Job<K, E> {
    Deliver {
        key: K,
        event: E,
        ids: Vec<ListenerId>,
    },
    Flush(oneshot::Sender<()>),
}

struct Shared<K, E> {
    listeners: Mutex<HashMap<K, Vec<Registration<E>>>>,
    next_id: AtomicU64,
    queue: mpsc::UnboundedSender<Job<K, E>>,
}

impl<K: Eq + Hash, E> Shared<K, E> {
    fn lock(&self) -> MutexGuard<'_, HashMap<K, Vec<Registration<E>>>> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn remove(&self, key: &K, id: ListenerId) -> bool {
        let mut listeners = self.lock();
        let Some(list) = listeners.get_mut(key) else {
            return false;
        };
        let before = list.len();
        list.retain(|r| r.id != id);
        let removed = list.len() != before;
        if list.is_empty() {
            listeners.remove(key);
        }
        removed
    }

    /// Take the listener for one scheduled delivery, if still registered.
    fn claim(&self, key: &K, id: ListenerId) -> Option<Listener<E>> {
        let mut listeners = self.lock();
        let list = listeners.get_mut(key)?;
        let pos = list.iter().position(|r| r.id == id)?;
        let listener = if list[pos].once {
            list.remove(pos).listener
        } else {
            Arc::clone(&list[pos].listener)
        };
        if list.is_empty() {
            listeners.remove(key);
        }
        Some(listener)
    }
}

pub struct EventEmitter<K, E> {
    shared: Arc<Shared<K, E>>,
}

impl<K, E> Clone for EventEmitter<K, E> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<K, E> EventEmitter<K, E>
where
    K: Eq + Hash + Clone + Debug + Send + 'static,
    E: Clone + Send + 'static,
{
    /// Create an emitter and spawn its dispatcher on the current runtime.
    ///
    /// The dispatcher exits when the last clone of the emitter is dropped.
    pub fn new() -> Self {
        let (queue, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            listeners: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            queue,
        });
        tokio::spawn(dispatch(Arc::downgrade(&shared), rx));
        Self { shared }
    }

    pub fn on<F>(&self, key: K, listener: F) -> ListenerId
    where
        F: Fn(E) + Send + Sync + 'static,
    {
        self.register(key, false, Arc::new(listener))
    }

    /// Remove one registration. Returns whether it was still registered.
    pub fn off(&self, key: &K, id: ListenerId) -> bool {
        self.shared.remove(key, id)
    }

    /// Register a listener that fires at most once and is removed when the
    /// returned guard drops.
    pub fn once<F>(&self, key: K, listener: F) -> ListenerGuard
    where
        F: Fn(E) + Send + Sync + 'static,
    {
        let id = self.register(key.clone(), true, Arc::new(listener));
        let shared = Arc::downgrade(&self.shared);
        ListenerGuard {
            id,
            detach: Some(Box::new(move || {
                if let Some(shared) = shared.upgrade() {
                    shared.remove(&key, id);
                }
            })),
        }
    }

    pub fn emit(&self, key: K, event: E) {
        let ids: Vec<ListenerId> = self
            .shared
            .lock()
            .get(&key)
            .map(|list| list.iter().map(|r| r.id).collect())
            .unwrap_or_default();
        if ids.is_empty() {
            tracing::trace!(?key, "No listeners for event");
            return;
        }
        let _ = self.shared.queue.send(Job::Deliver { key, event, ids });
    }

    /// Resolves once every delivery queued before this call has run.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.shared.queue.send(Job::Flush(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    pub fn listener_count(&self, key: &K) -> usize {
        self.shared.lock().get(key).map_or(0, Vec::len)
    }

    fn register(&self, key: K, once: bool, listener: Listener<E>) -> ListenerId {
        let id = ListenerId(self.shared.next_id.fetch_add(1, Ordering::Relaxed));
        self.shared
            .lock()
            .entry(key)
            .or_default()
            .push(Registration { id, once, listener });
        id
    }
}

impl<K, E> Default for EventEmitter<K, E>
where
    K: Eq + Hash + Clone + Debug + Send + 'static,
    E: Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

async fn dispatch<K, E>(shared: Weak<Shared<K, E>>, mut rx: mpsc::UnboundedReceiver<Job<K, E>>)
where
    K: Eq + Hash + Debug,
    E: Clone,
{
    while let Some(job) = rx.recv().await {
        let (key, event, ids) = match job {
            Job::Deliver { key, event, ids } => (key, event, ids),
            Job::Flush(done) => {
                let _ = done.send(());
                continue;
            }
        };
        let Some(shared) = shared.upgrade() else {
            break;
        };
        for id in ids {
            let Some(listener) = shared.claim(&key, id) else {
                continue;
            };
            let event = event.clone();
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| listener(event))) {
                let reason = crate::error::panic_envelope(payload).error.unwrap_or_default();
                tracing::error!(?key, %reason, "Event listener panicked");
            }
        }
    }
    tracing::trace!("Event dispatcher exiting");
}

/// Deregisters a [`EventEmitter::once`] listener on drop.
pub struct ListenerGuard {
    id: ListenerId,
    detach: Option<Box<dyn FnOnce() + Send>>,
}

impl ListenerGuard {
    pub fn id(&self) -> ListenerId {
        self.id
    }
}

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        if let Some(detach) = self.detach.take() {
            detach();
        }
    }
}

impl std::fmt::Debug for ListenerGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerGuard").field("id", &self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    type Log = Arc<Mutex<Vec<String>>>;

    fn recorder(log: &Log, tag: &'static str) -> impl Fn(u32) + Send + Sync + 'static {
        let log = Arc::clone(log);
        move |n| log.lock().unwrap().push(format!("{tag}:{n}"))
    }

    #[tokio::test]
    async fn emit_is_not_inline() {
        let emitter = EventEmitter::<&'static str, u32>::new();
        let log: Log = Arc::default();
        emitter.on("a", recorder(&log, "l"));

        emitter.emit("a", 1);
        assert!(log.lock().unwrap().is_empty());

        emitter.flush().await;
        assert_eq!(*log.lock().unwrap(), vec!["l:1"]);
    }

    #[tokio::test]
    async fn delivery_follows_emission_then_registration_order() {
        let emitter = EventEmitter::<&'static str, u32>::new();
        let log: Log = Arc::default();
        emitter.on("a", recorder(&log, "first"));
        emitter.on("a", recorder(&log, "second"));
        emitter.on("b", recorder(&log, "b"));

        emitter.emit("a", 1);
        emitter.emit("b", 2);
        emitter.emit("a", 3);
        emitter.flush().await;

        assert_eq!(
            *log.lock().unwrap(),
            vec!["first:1", "second:1", "b:2", "first:3", "second:3"]
        );
    }

    #[tokio::test]
    async fn removed_before_delivery_is_skipped() {
        let emitter = EventEmitter::<&'static str, u32>::new();
        let log: Log = Arc::default();
        let id = emitter.on("a", recorder(&log, "l"));

        emitter.emit("a", 1);
        assert!(emitter.off(&"a", id));
        emitter.flush().await;

        assert!(log.lock().unwrap().is_empty());
        assert!(!emitter.off(&"a", id));
    }

    #[tokio::test]
    async fn added_during_emission_sees_next_emission_only() {
        let emitter = EventEmitter::<&'static str, u32>::new();
        let log: Log = Arc::default();

        emitter.emit("a", 1);
        emitter.on("a", recorder(&log, "late"));
        emitter.emit("a", 2);
        emitter.flush().await;

        assert_eq!(*log.lock().unwrap(), vec!["late:2"]);
    }

    #[tokio::test]
    async fn panicking_listener_does_not_stop_others() {
        let emitter = EventEmitter::<&'static str, u32>::new();
        let log: Log = Arc::default();
        emitter.on("a", |_| panic!("listener failure"));
        emitter.on("a", recorder(&log, "after"));

        emitter.emit("a", 1);
        emitter.emit("a", 2);
        emitter.flush().await;

        assert_eq!(*log.lock().unwrap(), vec!["after:1", "after:2"]);
    }

    #[tokio::test]
    async fn once_fires_once_and_guard_detaches() {
        let emitter = EventEmitter::<&'static str, u32>::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let h = Arc::clone(&hits);
        let guard = emitter.once("a", move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        emitter.emit("a", 1);
        emitter.emit("a", 2);
        emitter.flush().await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(emitter.listener_count(&"a"), 0);
        drop(guard);

        let h = Arc::clone(&hits);
        let guard = emitter.once("a", move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(emitter.listener_count(&"a"), 1);
        drop(guard);
        assert_eq!(emitter.listener_count(&"a"), 0);

        emitter.emit("a", 3);
        emitter.flush().await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
