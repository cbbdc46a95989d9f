//! Pending-server table: GUID-correlated waits for a service's callback connection.
//! Each entry is removed exactly once, by fulfill, timeout or cancel, under one lock.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{oneshot, Mutex};
use tokio::task::AbortHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{Result, RouterError};
use crate::transport::Connection;

/// How long a client waits for the service to dial back.
pub const DEFAULT_PENDING_TIMEOUT: Duration = Duration::from_secs(4);

/// The router's table: callbacks resolve to the service's new connection.
pub type PendingServers = PendingTable<Connection>;

struct PendingEntry<T> {
    tx: oneshot::Sender<Result<T>>,
    timer: AbortHandle,
}

pub struct PendingTable<T> {
    entries: Arc<Mutex<HashMap<Uuid, PendingEntry<T>>>>,
    timeout: Duration,
}

impl<T> Clone for PendingTable<T> {
    fn clone(&self) -> Self {
        Self {
            entries: self.entries.clone(),
            timeout: self.timeout,
        }
    }
}

/// Awaitable side of one pending request.
pub struct PendingServer<T = Connection> {
    guid: Uuid,
    rx: oneshot::Receiver<Result<T>>,
}

impl<T> PendingServer<T> {
    pub fn guid(&self) -> Uuid {
        self.guid
    }

    /// Resolves on fulfill, fails on timeout, error fulfillment or cancel.
    pub async fn wait(self) -> Result<T> {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(RouterError::Cancelled(self.guid)),
        }
    }
}

impl<T: Send + 'static> PendingTable<T> {
    pub fn new(timeout: Duration) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Register a request under a fresh GUID.
    pub async fn create(&self) -> PendingServer<T> {
        let mut entries = self.entries.lock().await;
        let mut guid = Uuid::new_v4();
        while entries.contains_key(&guid) {
            guid = Uuid::new_v4();
        }
        self.insert_locked(&mut entries, guid)
    }

    /// Register a request under `guid`; a GUID is never reused while pending.
    pub async fn insert(&self, guid: Uuid) -> Result<PendingServer<T>> {
        let mut entries = self.entries.lock().await;
        if entries.contains_key(&guid) {
            return Err(RouterError::DuplicateRequest(guid));
        }
        Ok(self.insert_locked(&mut entries, guid))
    }

    fn insert_locked(
        &self,
        entries: &mut HashMap<Uuid, PendingEntry<T>>,
        guid: Uuid,
    ) -> PendingServer<T> {
        let (tx, rx) = oneshot::channel();
        let table = self.entries.clone();
        let timeout = self.timeout;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let expired = table.lock().await.remove(&guid);
            if let Some(entry) = expired {
                debug!(%guid, "pending server request timed out");
                let _ = entry.tx.send(Err(RouterError::Timeout { guid, timeout }));
            }
        })
        .abort_handle();
        entries.insert(guid, PendingEntry { tx, timer });
        PendingServer { guid, rx }
    }

    /// Resolve the request for `guid`. Returns false (and drops `result`) if it is
    /// no longer pending, e.g. it already timed out.
    pub async fn fulfill(&self, guid: Uuid, result: Result<T>) -> bool {
        let entry = self.entries.lock().await.remove(&guid);
        match entry {
            Some(entry) => {
                entry.timer.abort();
                if entry.tx.send(result).is_err() {
                    debug!(%guid, "waiter for pending server went away");
                }
                true
            }
            None => {
                warn!(%guid, "no pending server request; discarding callback");
                false
            }
        }
    }

    /// Drop the request without resolving it; the waiter sees `Cancelled`.
    pub async fn cancel(&self, guid: Uuid) -> bool {
        match self.entries.lock().await.remove(&guid) {
            Some(entry) => {
                entry.timer.abort();
                true
            }
            None => false,
        }
    }

    pub async fn pending_count(&self) -> usize {
        self.entries.lock().await.len()
    }
}
