//! The table of outstanding asynchronous requests.
//!
//! Every round-trip in the protocol registers a 32-bit request id here and
//! awaits its one-shot result. A request is tagged with the peer it targets
//! so a disconnect can fail everything still waiting on that peer. On
//! timeout the slot is relinquished: a late serve finds the receiver gone
//! and is ignored, rather than treated as a protocol error.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::oneshot;

use crate::ident::{NodeId, Version};
use crate::{Error, Result};

/// Result values of the request round-trips used by the object protocol.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum RequestValue {
    Ack,
    Bool(bool),
    Node(NodeId),
    MapReply {
        ok: bool,
        version: Version,
        used_cache: bool,
    },
    SyncReply {
        ok: bool,
        used_cache: bool,
    },
}

struct Pending {
    tx: oneshot::Sender<RequestValue>,
    peer: Option<NodeId>,
}

pub(crate) struct RequestTable {
    next: AtomicU32,
    pending: Mutex<HashMap<u32, Pending>>,
}

impl RequestTable {
    pub fn new() -> RequestTable {
        RequestTable {
            next: AtomicU32::new(1),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Register a new request, optionally tied to a peer node.
    pub fn register(&self, peer: Option<NodeId>) -> (u32, oneshot::Receiver<RequestValue>) {
        let id = self.next.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap()
            .insert(id, Pending { tx, peer });
        (id, rx)
    }

    /// Serve a request. Unknown or relinquished ids are ignored; replies
    /// may legitimately arrive after their waiter gave up.
    pub fn serve(&self, id: u32, value: RequestValue) {
        let pending = self.pending.lock().unwrap().remove(&id);
        if let Some(pending) = pending {
            let _ = pending.tx.send(value);
        }
    }

    /// Fail every request targeting `peer`, used on disconnect.
    pub fn fail_peer(&self, peer: NodeId) {
        let mut pending = self.pending.lock().unwrap();
        let failed: Vec<u32> = pending
            .iter()
            .filter(|(_, p)| p.peer == Some(peer))
            .map(|(id, _)| *id)
            .collect();
        for id in failed {
            // Dropping the sender resolves the waiter with an error.
            pending.remove(&id);
        }
    }

    /// Drop a request without serving it.
    pub fn relinquish(&self, id: u32) {
        self.pending.lock().unwrap().remove(&id);
    }
}

/// Await a request result with a timeout.
pub(crate) async fn wait(
    rx: oneshot::Receiver<RequestValue>,
    timeout: Duration,
) -> Result<RequestValue> {
    match tokio::time::timeout(timeout, rx).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(_)) => Err(Error::Closed),
        Err(_) => Err(Error::Timeout),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn serve_resolves_waiter() {
        let table = RequestTable::new();
        let (id, rx) = table.register(None);
        table.serve(id, RequestValue::Bool(true));
        assert_eq!(
            wait(rx, Duration::from_secs(1)).await.unwrap(),
            RequestValue::Bool(true)
        );
    }

    #[tokio::test]
    async fn late_serve_is_ignored() {
        let table = RequestTable::new();
        let (id, rx) = table.register(None);
        assert!(matches!(
            wait(rx, Duration::from_millis(10)).await,
            Err(Error::Timeout)
        ));
        table.relinquish(id);
        table.serve(id, RequestValue::Ack); // no panic, no effect
    }

    #[tokio::test]
    async fn disconnect_fails_peer_requests() {
        let table = RequestTable::new();
        let peer = NodeId::new_v4();
        let (_, rx) = table.register(Some(peer));
        table.fail_peer(peer);
        assert!(matches!(
            wait(rx, Duration::from_secs(1)).await,
            Err(Error::Closed)
        ));
    }
}
