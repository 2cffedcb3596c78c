//! In-flight request registry for the edge tunnel.
//!
//! Every dispatched `request` runs on its own task, registered here under its
//! `requestId`. The handler releases its entry through [`Completion::finish`]
//! right before it queues the terminal message, so the peer may reuse the id
//! as soon as it sees that message. A handler that ends without finishing is
//! released when its task returns, and [`PendingRequests::fail_all`] clears
//! everything when the connection is lost.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::AbortHandle;

use crate::protocol::ProtocolError;

struct Entry {
    /// Distinguishes a reused id from the call that held it before.
    seq: u64,
    handle: AbortHandle,
}

#[derive(Default)]
struct Registry {
    next_seq: u64,
    entries: HashMap<String, Entry>,
}

#[derive(Default)]
pub struct PendingRequests {
    inner: Mutex<Registry>,
}

/// Handed to each handler; releases its `requestId`.
pub struct Completion {
    registry: Arc<PendingRequests>,
    request_id: String,
    seq: u64,
}

impl Completion {
    /// Drop the entry for this call. Later calls to `finish` or the task's
    /// own cleanup leave a newer call with the same id untouched.
    pub async fn finish(&self) -> bool {
        self.registry.release(&self.request_id, self.seq).await
    }
}

impl PendingRequests {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `work` as the handler for `request_id`.
    ///
    /// Fails without spawning when the id is already in flight.
    pub async fn spawn<F, Fut>(
        self: &Arc<Self>,
        request_id: String,
        work: F,
    ) -> Result<(), ProtocolError>
    where
        F: FnOnce(Completion) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut registry = self.inner.lock().await;
        if registry.entries.contains_key(&request_id) {
            return Err(ProtocolError::DuplicateRequestId(request_id));
        }
        let seq = registry.next_seq;
        registry.next_seq += 1;

        let completion = Completion {
            registry: Arc::clone(self),
            request_id: request_id.clone(),
            seq,
        };
        // The lock is held until the entry exists, so no release can run first.
        let task = work(completion);
        let this = Arc::clone(self);
        let key = request_id.clone();
        let handle = tokio::spawn(async move {
            task.await;
            this.release(&key, seq).await;
        });
        registry.entries.insert(
            request_id,
            Entry {
                seq,
                handle: handle.abort_handle(),
            },
        );
        Ok(())
    }

    async fn release(&self, request_id: &str, seq: u64) -> bool {
        let mut registry = self.inner.lock().await;
        match registry.entries.get(request_id) {
            Some(entry) if entry.seq == seq => {
                registry.entries.remove(request_id);
                true
            }
            _ => false,
        }
    }

    pub async fn contains(&self, request_id: &str) -> bool {
        self.inner.lock().await.entries.contains_key(request_id)
    }

    /// Abort every in-flight handler and clear the registry. Returns how many
    /// requests were failed.
    pub async fn fail_all(&self) -> usize {
        let mut registry = self.inner.lock().await;
        let count = registry.entries.len();
        for (_, entry) in registry.entries.drain() {
            entry.handle.abort();
        }
        count
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.entries.is_empty()
    }
}
