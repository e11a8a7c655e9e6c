//! Client connection
//!
//! One TCP connection to a broker, shared by any number of source and
//! stream handles. A background reader task correlates responses and fans
//! inbound `Data` chunks out to the stream handles that registered for
//! them.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::codec::EncodingRegistry;
use crate::error::{Error, ErrorCode, Result};
use crate::message::{codec, Message};
use crate::router::PendingResponses;

/// One re-encoded payload chunk delivered to a stream handle
#[derive(Debug, Clone)]
pub struct StreamChunk {
    pub payload: Bytes,
    pub boundary: bool,
}

struct Shared {
    pending: PendingResponses,
    /// Stream id -> chunk channel for inbound `Data`
    routes: Mutex<HashMap<u32, mpsc::Sender<StreamChunk>>>,
    connected: AtomicBool,
    encodings: Arc<EncodingRegistry>,
    request_timeout: Duration,
}

/// Handle to a broker connection; cheap to clone
///
/// Dropping the last clone (and every handle built on it) closes the
/// outbound channel, which shuts the socket down and lets the broker tear
/// the session's sources and streams down.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,
    out_tx: mpsc::Sender<Message>,
}

impl Connection {
    /// Connect with the builtin codec registry and a 5 s request timeout
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        Self::connect_with(addr, Arc::new(EncodingRegistry::builtin()), Duration::from_secs(5))
            .await
    }

    /// Connect with a custom codec registry and request timeout
    pub async fn connect_with(
        addr: SocketAddr,
        encodings: Arc<EncodingRegistry>,
        request_timeout: Duration,
    ) -> Result<Self> {
        let socket = TcpStream::connect(addr).await?;
        socket.set_nodelay(true).ok();
        let (mut reader, mut writer) = socket.into_split();

        let (out_tx, mut out_rx) = mpsc::channel::<Message>(256);
        let shared = Arc::new(Shared {
            pending: PendingResponses::new(),
            routes: Mutex::new(HashMap::new()),
            connected: AtomicBool::new(true),
            encodings,
            request_timeout,
        });

        tokio::spawn(async move {
            let mut buf = BytesMut::new();
            while let Some(msg) = out_rx.recv().await {
                buf.clear();
                codec::encode(&msg, &mut buf);
                if writer.write_all(&buf).await.is_err() {
                    break;
                }
            }
            let _ = writer.shutdown().await;
        });

        let reader_shared = Arc::clone(&shared);
        tokio::spawn(async move {
            let mut inbuf = BytesMut::with_capacity(8 * 1024);
            'read: loop {
                loop {
                    match codec::decode(&mut inbuf) {
                        Ok(Some(msg)) => reader_shared.route(msg),
                        Ok(None) => break,
                        Err(e) => {
                            tracing::warn!(error = %e, "broker sent malformed data");
                            break 'read;
                        }
                    }
                }
                match reader.read_buf(&mut inbuf).await {
                    Ok(0) => break,
                    Ok(_) => {}
                    Err(_) => break,
                }
            }
            reader_shared.connected.store(false, Ordering::SeqCst);
            reader_shared.pending.fail_all();
            reader_shared.routes.lock().unwrap().clear();
            tracing::debug!("broker connection closed");
        });

        Ok(Self { shared, out_tx })
    }

    /// The codec registry this connection encodes with
    pub fn encodings(&self) -> &Arc<EncodingRegistry> {
        &self.shared.encodings
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    /// Send a request and wait for its response
    pub async fn request(&self, mut msg: Message) -> Result<Message> {
        if !self.is_connected() {
            return Err(Error::Disconnected);
        }
        let (id, rx) = self.shared.pending.register();
        msg.request_id = id;

        if self.out_tx.send(msg).await.is_err() {
            self.shared.pending.cancel(id);
            return Err(Error::Disconnected);
        }

        match tokio::time::timeout(self.shared.request_timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(Error::Disconnected),
            Err(_) => {
                self.shared.pending.cancel(id);
                Err(Error::Timeout)
            }
        }
    }

    /// Send a request and fail unless the broker answered `Success`
    pub async fn request_ok(&self, msg: Message) -> Result<Message> {
        let response = self.request(msg).await?;
        match response.status() {
            ErrorCode::Success => Ok(response),
            code => Err(Error::Status(code)),
        }
    }

    /// Fire-and-forget send (used for `Data`)
    pub async fn send(&self, msg: Message) -> Result<()> {
        self.out_tx.send(msg).await.map_err(|_| Error::Disconnected)
    }

    /// Register a stream handle's chunk channel
    pub(crate) fn register_stream(&self, id: u32, tx: mpsc::Sender<StreamChunk>) {
        self.shared.routes.lock().unwrap().insert(id, tx);
    }

    pub(crate) fn unregister_stream(&self, id: u32) {
        self.shared.routes.lock().unwrap().remove(&id);
    }
}

impl Shared {
    fn route(&self, msg: Message) {
        if msg.is_response {
            self.pending.complete(msg);
            return;
        }
        if msg.verb() != "Data" {
            tracing::debug!(verb = msg.verb(), "unexpected message from broker");
            return;
        }

        let Ok(id) = msg.component(1).parse::<u32>() else {
            tracing::debug!(component = msg.component(1), "data for unparseable stream id");
            return;
        };
        let sender = self.routes.lock().unwrap().get(&id).cloned();
        if let Some(tx) = sender {
            let chunk = StreamChunk {
                payload: msg.payload,
                boundary: msg.frame_boundary,
            };
            if tx.try_send(chunk).is_err() {
                tracing::debug!(stream = id, "local chunk buffer full, chunk dropped");
            }
        }
    }
}
