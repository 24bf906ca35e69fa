//! Event dispatch (C8, ambient): the in-process bounded queue described in
//! spec.md §5/§9, fanning out to per-listener callbacks under a
//! `MaxParallelProcess` concurrency cap.
//!
//! The teacher's `EventSink::send_event` is the model for "one async call
//! per event"; here the sink is "every callback registered for this
//! listener" instead of an outbound HTTP/Hook0 transport.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, Semaphore};
use tracing::error;

use crate::model::DatabaseEvent;

pub type Callback = Arc<dyn Fn(crate::model::Event) + Send + Sync>;

/// Bounded channel capacity for the driver -> dispatcher hop. Chosen to
/// absorb a burst of a single transaction's changes without unbounded
/// growth; backpressure beyond this blocks the driver's single consumer
/// task, which is the intended suspension point per spec.md §5.
const CHANNEL_CAPACITY: usize = 1024;

pub fn channel() -> (mpsc::Sender<DatabaseEvent>, mpsc::Receiver<DatabaseEvent>) {
    mpsc::channel(CHANNEL_CAPACITY)
}

/// Per-listener callback registration plus concurrency cap, and the loop
/// that drains the event channel and dispatches to registered callbacks.
///
/// Registration is behind a [`Mutex`] (rather than `&mut self`) so a
/// [`Client`](crate::client::Client) can share one `Arc<Dispatcher>` between
/// the task running [`Dispatcher::run`] and the attach/detach calls that
/// mutate registrations concurrently with it.
pub struct Dispatcher {
    callbacks: Mutex<HashMap<String, Vec<Callback>>>,
    limits: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self {
            callbacks: Mutex::new(HashMap::new()),
            limits: Mutex::new(HashMap::new()),
        }
    }

    /// Registers a callback for `listener_uid`, with `max_parallel` distinct
    /// concurrent invocations permitted (`None` = unbounded, matching the
    /// original's `-1`).
    pub fn register(&self, listener_uid: &str, max_parallel: Option<usize>, callback: Callback) {
        self.callbacks
            .lock()
            .entry(listener_uid.to_string())
            .or_default()
            .push(callback);
        if let Some(n) = max_parallel {
            self.limits
                .lock()
                .entry(listener_uid.to_string())
                .or_insert_with(|| Arc::new(Semaphore::new(n.max(1))));
        }
    }

    pub fn unregister(&self, listener_uid: &str) {
        self.callbacks.lock().remove(listener_uid);
        self.limits.lock().remove(listener_uid);
    }

    /// Drains `rx` until the channel closes (driver shutdown), dispatching
    /// each event to the listener's registered callbacks. A callback panic
    /// is isolated so it doesn't halt delivery to others, per spec.md §7's
    /// propagation policy ("the dispatcher isolates [callback failures] so
    /// that one callback's failure does not halt delivery to others").
    ///
    /// Every invocation is spawned onto its own task rather than awaited
    /// inline, so `MaxParallelProcess` governs actual concurrency (up to the
    /// semaphore's permit count, or unbounded with no cap) instead of this
    /// loop serializing every callback behind the single task draining `rx`.
    /// Tokio's semaphore grants permits FIFO, so spawning bounded-listener
    /// tasks in receipt order still preserves that listener's delivery
    /// order even though the tasks race for permits.
    pub async fn run(&self, mut rx: mpsc::Receiver<DatabaseEvent>) {
        let mut in_flight = tokio::task::JoinSet::new();

        while let Some(database_event) = rx.recv().await {
            let Some(callbacks) = self.callbacks.lock().get(&database_event.listener_uid).cloned()
            else {
                continue;
            };
            let permit = self.limits.lock().get(&database_event.listener_uid).cloned();

            for callback in &callbacks {
                let callback = callback.clone();
                let event = database_event.event.clone();
                let permit = permit.clone();
                let listener_uid = database_event.listener_uid.clone();

                in_flight.spawn(async move {
                    let _permit = match &permit {
                        Some(sem) => Some(sem.clone().acquire_owned().await),
                        None => None,
                    };
                    if std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| callback(event))).is_err() {
                        error!(listener_uid, "callback panicked");
                    }
                });
            }
        }

        // Channel closed: let whatever callbacks are still running finish
        // before reporting the dispatcher itself as done.
        while in_flight.join_next().await.is_some() {}
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Event, EventData};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn dispatches_to_matching_listener_only() {
        let dispatcher = Dispatcher::new();
        let count_a = Arc::new(AtomicUsize::new(0));
        let count_b = Arc::new(AtomicUsize::new(0));

        let ca = count_a.clone();
        dispatcher.register(
            "A",
            Some(1),
            Arc::new(move |_event| {
                ca.fetch_add(1, Ordering::SeqCst);
            }),
        );
        let cb = count_b.clone();
        dispatcher.register(
            "B",
            Some(1),
            Arc::new(move |_event| {
                cb.fetch_add(1, Ordering::SeqCst);
            }),
        );

        let (tx, rx) = channel();
        tx.send(DatabaseEvent {
            listener_uid: "A".to_string(),
            event: Event::Insert { new: EventData::new() },
        })
        .await
        .unwrap();
        drop(tx);

        dispatcher.run(rx).await;

        assert_eq!(count_a.load(Ordering::SeqCst), 1);
        assert_eq!(count_b.load(Ordering::SeqCst), 0);
    }
}
