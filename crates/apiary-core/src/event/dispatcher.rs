//! Bounded asynchronous event fan-out.
//!
//! A [`Dispatcher`] owns a fixed-depth queue and a pool of worker tasks
//! that feed a user-supplied handler. Producers never block: when the
//! queue is full the oldest item is dropped and counted. With one worker
//! the handler observes events in dispatch order; with more, events are
//! load-balanced and only per-dispatch ordering of the queue is kept. The
//! hub runs a single worker so observers see causal order.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Callback invoked once per event by a worker task.
pub type Handler<E> = Arc<dyn Fn(E) -> BoxFuture<'static, ()> + Send + Sync>;

const STATE_IDLE: u8 = 0;
const STATE_RUNNING: u8 = 1;
const STATE_STOPPED: u8 = 2;

/// Counters exposed for observability; snapshots are not atomic across
/// fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DispatcherStats {
    pub dispatched: u64,
    /// Events evicted by the drop-oldest overflow policy.
    pub dropped: u64,
    pub handled: u64,
    /// Handler invocations that panicked.
    pub handler_errors: u64,
}

struct Shared<E> {
    queue: Mutex<VecDeque<E>>,
    capacity: usize,
    notify: Notify,
    handler: Handler<E>,
    state: AtomicU8,
    cancel: CancellationToken,
    dispatched: AtomicU64,
    dropped: AtomicU64,
    handled: AtomicU64,
    handler_errors: AtomicU64,
}

/// Single-consumer-by-default event pump.
pub struct Dispatcher<E> {
    shared: Arc<Shared<E>>,
    workers: usize,
    drain: Duration,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl<E: Send + 'static> Dispatcher<E> {
    /// Build a dispatcher with `workers` handler tasks and a queue of depth
    /// `capacity`. `drain` bounds how long [`Dispatcher::stop`] waits for
    /// in-flight events before aborting the workers.
    pub fn new(handler: Handler<E>, workers: usize, capacity: usize, drain: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                queue: Mutex::new(VecDeque::new()),
                capacity: capacity.max(1),
                notify: Notify::new(),
                handler,
                state: AtomicU8::new(STATE_IDLE),
                cancel: CancellationToken::new(),
                dispatched: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
                handled: AtomicU64::new(0),
                handler_errors: AtomicU64::new(0),
            }),
            workers: workers.max(1),
            drain,
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Dispatcher whose handler discards every event. For tests and as a
    /// stand-in sink before the hub is wired.
    pub fn noop() -> Self {
        Self::new(
            Arc::new(|_| async {}.boxed()),
            1,
            64,
            Duration::from_millis(100),
        )
    }

    /// Spawn the worker tasks. Idempotent; a stopped dispatcher stays
    /// stopped.
    pub fn start(&self) {
        if self
            .shared
            .state
            .compare_exchange(
                STATE_IDLE,
                STATE_RUNNING,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            return;
        }
        let mut handles = self.handles.lock().expect("dispatcher handles poisoned");
        for _ in 0..self.workers {
            let shared = Arc::clone(&self.shared);
            handles.push(tokio::spawn(worker_loop(shared)));
        }
    }

    /// Enqueue an event without blocking. A no-op once the dispatcher has
    /// been stopped. On overflow the oldest queued event is evicted.
    pub fn dispatch(&self, event: E) {
        if self.shared.state.load(Ordering::SeqCst) == STATE_STOPPED {
            return;
        }
        {
            let mut queue = self.shared.queue.lock().expect("dispatcher queue poisoned");
            if queue.len() >= self.shared.capacity {
                queue.pop_front();
                self.shared.dropped.fetch_add(1, Ordering::Relaxed);
            }
            queue.push_back(event);
        }
        self.shared.dispatched.fetch_add(1, Ordering::Relaxed);
        self.shared.notify.notify_one();
    }

    /// Stop the workers, draining queued events for at most the configured
    /// drain window. Idempotent. After `stop` returns, `dispatch` is a
    /// no-op.
    pub async fn stop(&self) {
        let prev = self.shared.state.swap(STATE_STOPPED, Ordering::SeqCst);
        if prev == STATE_STOPPED {
            return;
        }
        self.shared.cancel.cancel();
        self.shared.notify.notify_waiters();

        let mut handles = {
            let mut guard = self.handles.lock().expect("dispatcher handles poisoned");
            std::mem::take(&mut *guard)
        };
        if handles.is_empty() {
            return;
        }

        let drained = tokio::time::timeout(self.drain, futures::future::join_all(handles.iter_mut()));
        if drained.await.is_err() {
            tracing::warn!(
                remaining = self.queue_len(),
                "dispatcher drain window expired, aborting workers"
            );
            for handle in &handles {
                handle.abort();
            }
        }
    }

    pub fn stats(&self) -> DispatcherStats {
        DispatcherStats {
            dispatched: self.shared.dispatched.load(Ordering::Relaxed),
            dropped: self.shared.dropped.load(Ordering::Relaxed),
            handled: self.shared.handled.load(Ordering::Relaxed),
            handler_errors: self.shared.handler_errors.load(Ordering::Relaxed),
        }
    }

    pub fn queue_len(&self) -> usize {
        self.shared
            .queue
            .lock()
            .expect("dispatcher queue poisoned")
            .len()
    }
}

/// Pop-handle loop run by each worker. Exits when cancelled and the queue
/// is empty, so `stop` drains whatever was enqueued first.
async fn worker_loop<E: Send + 'static>(shared: Arc<Shared<E>>) {
    loop {
        let next = {
            let mut queue = shared.queue.lock().expect("dispatcher queue poisoned");
            queue.pop_front()
        };

        match next {
            Some(event) => {
                let fut = (shared.handler)(event);
                // A panicking handler must not take the worker down with it.
                if std::panic::AssertUnwindSafe(fut).catch_unwind().await.is_err() {
                    shared.handler_errors.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!("event handler panicked; event skipped");
                } else {
                    shared.handled.fetch_add(1, Ordering::Relaxed);
                }
            }
            None => {
                if shared.cancel.is_cancelled() {
                    break;
                }
                tokio::select! {
                    _ = shared.notify.notified() => {}
                    _ = shared.cancel.cancelled() => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    fn collecting_dispatcher(
        capacity: usize,
    ) -> (Dispatcher<u32>, Arc<StdMutex<Vec<u32>>>) {
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let handler: Handler<u32> = Arc::new(move |event| {
            let sink = Arc::clone(&sink);
            async move {
                sink.lock().unwrap().push(event);
            }
            .boxed()
        });
        (
            Dispatcher::new(handler, 1, capacity, Duration::from_secs(1)),
            seen,
        )
    }

    #[tokio::test]
    async fn single_worker_preserves_order() {
        let (dispatcher, seen) = collecting_dispatcher(64);
        dispatcher.start();
        for i in 0..20 {
            dispatcher.dispatch(i);
        }
        dispatcher.stop().await;
        assert_eq!(*seen.lock().unwrap(), (0..20).collect::<Vec<u32>>());
    }

    #[tokio::test]
    async fn overflow_drops_oldest() {
        let (dispatcher, seen) = collecting_dispatcher(3);
        // Not started: everything queues, so the eviction policy is
        // deterministic.
        for i in 0..5 {
            dispatcher.dispatch(i);
        }
        assert_eq!(dispatcher.stats().dropped, 2);
        dispatcher.start();
        dispatcher.stop().await;
        assert_eq!(*seen.lock().unwrap(), vec![2, 3, 4]);
    }

    #[tokio::test]
    async fn dispatch_after_stop_is_noop() {
        let (dispatcher, seen) = collecting_dispatcher(8);
        dispatcher.start();
        dispatcher.dispatch(1);
        dispatcher.stop().await;
        dispatcher.dispatch(2);
        assert_eq!(*seen.lock().unwrap(), vec![1]);
        assert_eq!(dispatcher.stats().dispatched, 1);
    }

    #[tokio::test]
    async fn start_and_stop_are_idempotent() {
        let (dispatcher, seen) = collecting_dispatcher(8);
        dispatcher.start();
        dispatcher.start();
        dispatcher.dispatch(7);
        dispatcher.stop().await;
        dispatcher.stop().await;
        assert_eq!(*seen.lock().unwrap(), vec![7]);
    }

    #[tokio::test]
    async fn panicking_handler_is_counted_and_survived() {
        let handler: Handler<u32> = Arc::new(|event| {
            async move {
                if event == 1 {
                    panic!("boom");
                }
            }
            .boxed()
        });
        let dispatcher = Dispatcher::new(handler, 1, 8, Duration::from_secs(1));
        dispatcher.start();
        dispatcher.dispatch(1);
        dispatcher.dispatch(2);
        dispatcher.stop().await;
        let stats = dispatcher.stats();
        assert_eq!(stats.handler_errors, 1);
        assert_eq!(stats.handled, 1);
    }
}
