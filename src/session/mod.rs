//! Client sessions
//!
//! One `ClientSession` per connected peer: its outbox, the sources it
//! opened, and the streams it subscribes to. Disconnect tears all of them
//! down.

pub mod outbox;

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

pub use outbox::{Outbox, DEFAULT_OUTBOX_CAPACITY};

/// Opaque client identifier, allocated per connection
pub type SessionId = u64;

/// Per-connection state
pub struct ClientSession {
    pub id: SessionId,
    pub peer_addr: SocketAddr,
    pub outbox: Arc<Outbox>,
    /// Names of client sources this session opened
    owned_sources: Mutex<HashSet<String>>,
    /// Ids of streams this session subscribes to
    streams: Mutex<HashSet<u32>>,
    /// Set once on disconnect; handlers observing it shortcut
    closing: AtomicBool,
}

impl ClientSession {
    pub fn new(id: SessionId, peer_addr: SocketAddr, outbox_capacity: usize) -> Self {
        Self {
            id,
            peer_addr,
            outbox: Arc::new(Outbox::new(outbox_capacity)),
            owned_sources: Mutex::new(HashSet::new()),
            streams: Mutex::new(HashSet::new()),
            closing: AtomicBool::new(false),
        }
    }

    pub fn add_source(&self, name: &str) {
        self.owned_sources.lock().unwrap().insert(name.to_string());
    }

    pub fn remove_source(&self, name: &str) {
        self.owned_sources.lock().unwrap().remove(name);
    }

    pub fn add_stream(&self, id: u32) {
        self.streams.lock().unwrap().insert(id);
    }

    pub fn remove_stream(&self, id: u32) {
        self.streams.lock().unwrap().remove(&id);
    }

    /// Drain the owned source names for disconnect cleanup
    pub fn take_sources(&self) -> Vec<String> {
        self.owned_sources.lock().unwrap().drain().collect()
    }

    /// Drain the subscribed stream ids for disconnect cleanup
    pub fn take_streams(&self) -> Vec<u32> {
        self.streams.lock().unwrap().drain().collect()
    }

    /// Mark the session as closing; returns whether this call flipped it
    pub fn begin_close(&self) -> bool {
        !self.closing.swap(true, Ordering::SeqCst)
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }
}
