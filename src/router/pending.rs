//! Request/response correlation
//!
//! Outbound requests are stamped with a monotonically increasing id; the
//! matching response is routed back to the waiting caller through a oneshot
//! channel. Used by the client connection, and available to any server-side
//! code that issues requests of its own.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use tokio::sync::oneshot;

use crate::message::Message;

/// Pending request map
pub struct PendingResponses {
    next_id: AtomicU32,
    waiting: Mutex<HashMap<u32, oneshot::Sender<Message>>>,
}

impl PendingResponses {
    pub fn new() -> Self {
        Self {
            // id 0 is reserved for fire-and-forget
            next_id: AtomicU32::new(1),
            waiting: Mutex::new(HashMap::new()),
        }
    }

    /// Allocate a request id and register a waiter for its response
    pub fn register(&self) -> (u32, oneshot::Receiver<Message>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.waiting.lock().unwrap().insert(id, tx);
        (id, rx)
    }

    /// Route a response to its waiter
    ///
    /// Responses with no pending waiter are discarded; the caller already
    /// gave up (timeout) or never asked.
    pub fn complete(&self, response: Message) {
        let waiter = self.waiting.lock().unwrap().remove(&response.request_id);
        match waiter {
            Some(tx) => {
                let _ = tx.send(response);
            }
            None => {
                tracing::debug!(
                    request_id = response.request_id,
                    "response with no pending request discarded"
                );
            }
        }
    }

    /// Drop a waiter (timeout or cancellation)
    pub fn cancel(&self, id: u32) {
        self.waiting.lock().unwrap().remove(&id);
    }

    /// Fail every waiter (connection lost); their receivers see closure
    pub fn fail_all(&self) {
        self.waiting.lock().unwrap().clear();
    }

    pub fn pending_count(&self) -> usize {
        self.waiting.lock().unwrap().len()
    }
}

impl Default for PendingResponses {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use crate::error::ErrorCode;

    use super::*;

    #[tokio::test]
    async fn test_correlation() {
        let pending = PendingResponses::new();
        let (id_a, rx_a) = pending.register();
        let (id_b, rx_b) = pending.register();
        assert_ne!(id_a, id_b);

        pending.complete(Message::response(id_b, ErrorCode::Success));
        pending.complete(Message::response(id_a, ErrorCode::NameInUse));

        assert_eq!(rx_a.await.unwrap().status(), ErrorCode::NameInUse);
        assert_eq!(rx_b.await.unwrap().status(), ErrorCode::Success);
        assert_eq!(pending.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_stale_response_discarded() {
        let pending = PendingResponses::new();
        pending.complete(Message::response(999, ErrorCode::Success));
        assert_eq!(pending.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_fail_all_closes_waiters() {
        let pending = PendingResponses::new();
        let (_, rx) = pending.register();
        pending.fail_all();
        assert!(rx.await.is_err());
    }
}
