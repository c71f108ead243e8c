//! Pending-request table: the rendezvous between callers and the reader.
//!
//! Callers register a completion pair at send time; the reader loop
//! resolves it when the matching response arrives — responses come back in
//! whatever order the server pleases, so correlation by id is mandatory.
//! Each entry carries the dispatcher of the context that issued it, and
//! callbacks only ever run through that dispatcher.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use tokio::sync::Mutex;

use crate::dispatch::Dispatcher;
use crate::error::ClientError;
use crate::protocol::RequestId;

pub(crate) type SuccessFn = Box<dyn FnOnce(serde_json::Value) + Send>;
pub(crate) type FailureFn = Box<dyn FnOnce(ClientError) + Send>;

struct PendingRequest {
    on_success: SuccessFn,
    on_error: FailureFn,
    dispatcher: Arc<dyn Dispatcher>,
}

pub(crate) struct PendingTable {
    next_id: AtomicI64,
    entries: Mutex<HashMap<RequestId, PendingRequest>>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self {
            next_id: AtomicI64::new(1),
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Allocate a fresh id and store the completion pair.
    ///
    /// Ids are monotonically increasing and never reused for the lifetime
    /// of the connection.
    pub async fn register(
        &self,
        dispatcher: Arc<dyn Dispatcher>,
        on_success: SuccessFn,
        on_error: FailureFn,
    ) -> RequestId {
        let id = RequestId::Number(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.entries.lock().await.insert(
            id.clone(),
            PendingRequest {
                on_success,
                on_error,
                dispatcher,
            },
        );
        id
    }

    /// Complete the request with a result payload.
    ///
    /// An unknown id is expected (late response after cancellation) and is
    /// logged and discarded, never fatal.
    pub async fn resolve(&self, id: &RequestId, result: serde_json::Value) {
        let entry = self.entries.lock().await.remove(id);
        match entry {
            Some(pending) => {
                let on_success = pending.on_success;
                pending.dispatcher.dispatch(Box::new(move || on_success(result)));
            }
            None => tracing::warn!(%id, "response for unknown request id"),
        }
    }

    /// Complete the request with an error.
    pub async fn resolve_error(&self, id: &RequestId, error: ClientError) {
        let entry = self.entries.lock().await.remove(id);
        match entry {
            Some(pending) => {
                let on_error = pending.on_error;
                pending.dispatcher.dispatch(Box::new(move || on_error(error)));
            }
            None => tracing::warn!(%id, "error response for unknown request id"),
        }
    }

    /// Discard a registration whose request never reached the transport.
    pub async fn remove(&self, id: &RequestId) -> bool {
        self.entries.lock().await.remove(id).is_some()
    }

    /// Fail every outstanding request with `ConnectionClosed` and clear
    /// the table. No caller is left waiting forever.
    pub async fn cancel_all(&self) {
        let drained = std::mem::take(&mut *self.entries.lock().await);
        for (id, pending) in drained {
            tracing::debug!(%id, "cancelling outstanding request");
            let on_error = pending.on_error;
            pending
                .dispatcher
                .dispatch(Box::new(move || on_error(ClientError::ConnectionClosed)));
        }
    }

    pub async fn outstanding(&self) -> usize {
        self.entries.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::InlineDispatcher;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::AtomicUsize;

    fn inline() -> Arc<dyn Dispatcher> {
        Arc::new(InlineDispatcher)
    }

    fn noop_success() -> SuccessFn {
        Box::new(|_| {})
    }

    fn noop_failure() -> FailureFn {
        Box::new(|_| {})
    }

    #[tokio::test]
    async fn ids_are_monotonic_and_unique() {
        let table = Arc::new(PendingTable::new());
        let mut ids = Vec::new();
        for _ in 0..100 {
            ids.push(
                table
                    .register(inline(), noop_success(), noop_failure())
                    .await,
            );
        }
        let mut deduped = ids.clone();
        deduped.dedup();
        assert_eq!(deduped.len(), 100);
        for pair in ids.windows(2) {
            let (RequestId::Number(a), RequestId::Number(b)) = (&pair[0], &pair[1]) else {
                panic!("allocation must produce integer ids");
            };
            assert!(a < b);
        }
    }

    #[tokio::test]
    async fn ids_unique_across_concurrent_registration() {
        let table = Arc::new(PendingTable::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let table = table.clone();
            handles.push(tokio::spawn(async move {
                let mut local = Vec::new();
                for _ in 0..50 {
                    local.push(
                        table
                            .register(inline(), noop_success(), noop_failure())
                            .await,
                    );
                }
                local
            }));
        }
        let mut all = Vec::new();
        for handle in handles {
            all.extend(handle.await.unwrap());
        }
        let unique: std::collections::HashSet<_> = all.iter().cloned().collect();
        assert_eq!(unique.len(), all.len());
    }

    #[tokio::test]
    async fn resolve_delivers_to_the_registering_caller() {
        let table = PendingTable::new();
        let first = Arc::new(StdMutex::new(None));
        let second = Arc::new(StdMutex::new(None));

        let sink = first.clone();
        let id_a = table
            .register(
                inline(),
                Box::new(move |v| *sink.lock().unwrap() = Some(v)),
                noop_failure(),
            )
            .await;
        let sink = second.clone();
        let id_b = table
            .register(
                inline(),
                Box::new(move |v| *sink.lock().unwrap() = Some(v)),
                noop_failure(),
            )
            .await;

        // Resolve out of registration order.
        table.resolve(&id_b, serde_json::json!("for-b")).await;
        table.resolve(&id_a, serde_json::json!("for-a")).await;

        assert_eq!(
            first.lock().unwrap().clone(),
            Some(serde_json::json!("for-a"))
        );
        assert_eq!(
            second.lock().unwrap().clone(),
            Some(serde_json::json!("for-b"))
        );
    }

    #[tokio::test]
    async fn unknown_id_is_discarded() {
        let table = PendingTable::new();
        let id = table
            .register(inline(), noop_success(), noop_failure())
            .await;
        table
            .resolve(&RequestId::Number(999), serde_json::json!({}))
            .await;
        assert_eq!(table.outstanding().await, 1);
        table.resolve(&id, serde_json::json!({})).await;
        assert_eq!(table.outstanding().await, 0);
    }

    #[tokio::test]
    async fn cancel_all_fails_each_entry_exactly_once() {
        let table = PendingTable::new();
        let errors = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let errors = errors.clone();
            table
                .register(
                    inline(),
                    noop_success(),
                    Box::new(move |e| {
                        assert!(matches!(e, ClientError::ConnectionClosed));
                        errors.fetch_add(1, Ordering::SeqCst);
                    }),
                )
                .await;
        }
        table.cancel_all().await;
        assert_eq!(errors.load(Ordering::SeqCst), 3);
        assert_eq!(table.outstanding().await, 0);

        // Idempotent: nothing left to cancel.
        table.cancel_all().await;
        assert_eq!(errors.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn resolved_entry_is_not_cancelled_again() {
        let table = PendingTable::new();
        let successes = Arc::new(AtomicUsize::new(0));
        let failures = Arc::new(AtomicUsize::new(0));

        let s = successes.clone();
        let f = failures.clone();
        let id = table
            .register(
                inline(),
                Box::new(move |_| {
                    s.fetch_add(1, Ordering::SeqCst);
                }),
                Box::new(move |_| {
                    f.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .await;

        table.resolve(&id, serde_json::json!({})).await;
        table.cancel_all().await;

        assert_eq!(successes.load(Ordering::SeqCst), 1);
        assert_eq!(failures.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn callbacks_run_through_the_entry_dispatcher() {
        struct CountingDispatcher(AtomicUsize);
        impl Dispatcher for CountingDispatcher {
            fn dispatch(&self, task: Box<dyn FnOnce() + Send>) {
                self.0.fetch_add(1, Ordering::SeqCst);
                task();
            }
        }

        let table = PendingTable::new();
        let dispatcher = Arc::new(CountingDispatcher(AtomicUsize::new(0)));
        let id = table
            .register(dispatcher.clone(), noop_success(), noop_failure())
            .await;
        table.resolve(&id, serde_json::json!({})).await;
        assert_eq!(dispatcher.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn remove_discards_without_firing() {
        let table = PendingTable::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        let id = table
            .register(
                inline(),
                Box::new(move |_| {
                    f.fetch_add(1, Ordering::SeqCst);
                }),
                noop_failure(),
            )
            .await;
        assert!(table.remove(&id).await);
        assert!(!table.remove(&id).await);
        table.resolve(&id, serde_json::json!({})).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
