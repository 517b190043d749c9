//! Outstanding RPC calls awaiting a reply.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::oneshot;
use tracing::debug;

use crate::envelope::RpcReply;

/// Correlation table for in-flight calls.
///
/// Each call registers a one-shot completion slot under a fresh correlation
/// id. The first reply for an id completes it; later replies and replies for
/// cancelled ids are dropped.
pub struct PendingCalls {
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, oneshot::Sender<RpcReply>>>,
}

impl PendingCalls {
    /// Empty table. Ids start at 1.
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Allocates a correlation id and its completion slot.
    pub fn register(&self) -> (u64, oneshot::Receiver<RpcReply>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);
        (id, rx)
    }

    /// Completes the call matching `reply`. Returns false if no call was
    /// waiting.
    pub fn complete(&self, reply: RpcReply) -> bool {
        let id = reply.correlation_id;
        let Some(tx) = self.pending.lock().remove(&id) else {
            debug!(correlation_id = id, service = %reply.service, "dropping late or duplicate reply");
            return false;
        };
        tx.send(reply).is_ok()
    }

    /// Forgets a call, typically after its deadline expired.
    pub fn cancel(&self, id: u64) -> bool {
        self.pending.lock().remove(&id).is_some()
    }

    /// Number of calls awaiting a reply.
    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    /// True if no call is waiting.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for PendingCalls {
    fn default() -> Self {
        Self::new()
    }
}
