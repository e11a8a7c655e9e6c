//! Per-subscriber outbound queue
//!
//! Every connected client has one bounded outbox. Responses and other
//! control traffic always enqueue; `Data` traffic competes for the byte
//! budget and overflows according to the owning stream's drop policy, which
//! drives the queue through `try_enqueue` / `enqueue_wait` / `evict_oldest`.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::Notify;

use crate::error::{Error, Result};
use crate::message::{codec, Message};

/// Default byte budget for queued `Data` payloads
pub const DEFAULT_OUTBOX_CAPACITY: usize = 4 * 1024 * 1024;

struct OutboxState {
    queue: VecDeque<Message>,
    total_bytes: usize,
    closed: bool,
}

/// Bounded outbound message queue
pub struct Outbox {
    state: Mutex<OutboxState>,
    capacity: usize,
    /// Signalled when a message is queued or the outbox closes
    readable: Notify,
    /// Signalled when bytes drain, waking `block`-policy writers
    writable: Notify,
}

impl Outbox {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(OutboxState {
                queue: VecDeque::with_capacity(64),
                total_bytes: 0,
                closed: false,
            }),
            capacity,
            readable: Notify::new(),
            writable: Notify::new(),
        }
    }

    /// Enqueue control traffic (responses, errors); never dropped
    ///
    /// Control messages bypass the byte budget: a peer that cannot drain its
    /// responses is torn down by the writer, not throttled here.
    pub fn enqueue_control(&self, msg: Message) {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return;
        }
        state.total_bytes += codec::body_len(&msg);
        state.queue.push_back(msg);
        drop(state);
        self.readable.notify_one();
    }

    /// Try to enqueue a `Data` message; fails when the budget is exhausted
    pub fn try_enqueue(&self, msg: Message) -> bool {
        let size = codec::body_len(&msg);
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return true; // nothing to deliver to; count as handled
        }
        if state.total_bytes.saturating_add(size) > self.capacity {
            return false;
        }
        state.total_bytes += size;
        state.queue.push_back(msg);
        drop(state);
        self.readable.notify_one();
        true
    }

    /// Enqueue, waiting for space up to `timeout` (the `block` drop policy)
    pub async fn enqueue_wait(&self, msg: Message, timeout: Duration) -> Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.try_enqueue(msg.clone()) {
                return Ok(());
            }
            let wait = self.writable.notified();
            if tokio::time::timeout_at(deadline, wait).await.is_err() {
                return Err(Error::Timeout);
            }
        }
    }

    /// Evict the oldest queued `Data` message (the `drop_oldest` policy)
    ///
    /// Control messages are never evicted. Returns whether anything was
    /// removed.
    pub fn evict_oldest(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        let index = state.queue.iter().position(|m| m.verb() == "Data");
        match index {
            Some(i) => {
                let removed = state.queue.remove(i).unwrap();
                state.total_bytes -= codec::body_len(&removed);
                drop(state);
                // notify_one stores a permit, so a writer that checks the
                // budget just before this drain still wakes
                self.writable.notify_one();
                true
            }
            None => false,
        }
    }

    /// Pop the next message for the writer task; `None` after close + drain
    pub async fn recv(&self) -> Option<Message> {
        loop {
            {
                let mut state = self.state.lock().unwrap();
                if let Some(msg) = state.queue.pop_front() {
                    state.total_bytes -= codec::body_len(&msg);
                    drop(state);
                    self.writable.notify_one();
                    return Some(msg);
                }
                if state.closed {
                    return None;
                }
            }
            self.readable.notified().await;
        }
    }

    /// Close the outbox; queued messages still drain
    pub fn close(&self) {
        let mut state = self.state.lock().unwrap();
        state.closed = true;
        drop(state);
        // wake registered waiters and leave permits for late arrivals
        self.readable.notify_waiters();
        self.readable.notify_one();
        self.writable.notify_waiters();
        self.writable.notify_one();
    }

    /// Queued payload bytes
    pub fn pending_bytes(&self) -> usize {
        self.state.lock().unwrap().total_bytes
    }

    /// Queued message count
    pub fn pending_messages(&self) -> usize {
        self.state.lock().unwrap().queue.len()
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;

    fn data(n: usize) -> Message {
        Message::data("1", Bytes::from(vec![0u8; n]), true)
    }

    #[test]
    fn test_budget_enforced() {
        let outbox = Outbox::new(256);
        assert!(outbox.try_enqueue(data(100)));
        assert!(outbox.try_enqueue(data(100)));
        assert!(!outbox.try_enqueue(data(100)));
        assert_eq!(outbox.pending_messages(), 2);
    }

    #[test]
    fn test_control_bypasses_budget() {
        let outbox = Outbox::new(64);
        assert!(outbox.try_enqueue(data(40)));
        assert!(!outbox.try_enqueue(data(40)));
        outbox.enqueue_control(Message::response(1, crate::error::ErrorCode::Success));
        assert_eq!(outbox.pending_messages(), 2);
    }

    #[test]
    fn test_evict_oldest_skips_control() {
        let outbox = Outbox::new(1024);
        outbox.enqueue_control(Message::response(1, crate::error::ErrorCode::Success));
        assert!(outbox.try_enqueue(data(10)));
        assert!(outbox.try_enqueue(data(20)));

        assert!(outbox.evict_oldest());
        assert_eq!(outbox.pending_messages(), 2);

        assert!(outbox.evict_oldest());
        // only the control message remains
        assert!(!outbox.evict_oldest());
        assert_eq!(outbox.pending_messages(), 1);
    }

    #[tokio::test]
    async fn test_recv_drains_in_order() {
        let outbox = Outbox::new(1024);
        assert!(outbox.try_enqueue(data(1)));
        assert!(outbox.try_enqueue(data(2)));
        outbox.close();

        assert_eq!(outbox.recv().await.unwrap().payload.len(), 1);
        assert_eq!(outbox.recv().await.unwrap().payload.len(), 2);
        assert!(outbox.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_enqueue_wait_times_out() {
        let outbox = Outbox::new(64);
        assert!(outbox.try_enqueue(data(40)));

        let result = outbox
            .enqueue_wait(data(40), Duration::from_millis(20))
            .await;
        assert!(matches!(result, Err(Error::Timeout)));
    }

    #[tokio::test]
    async fn test_enqueue_wait_wakes_on_drain() {
        use std::sync::Arc;

        let outbox = Arc::new(Outbox::new(64));
        assert!(outbox.try_enqueue(data(40)));

        let writer = Arc::clone(&outbox);
        let waiter = tokio::spawn(async move {
            writer
                .enqueue_wait(data(40), Duration::from_secs(5))
                .await
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(outbox.recv().await.is_some());

        waiter.await.unwrap().unwrap();
        assert_eq!(outbox.pending_messages(), 1);
    }
}
