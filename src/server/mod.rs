//! Broker server
//!
//! Binds the listening socket, accepts connections, and runs one reader and
//! one writer task per connected client. The reader decodes messages
//! incrementally and hands them to the router; the writer drains the
//! session's outbox.

pub mod config;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::codec::EncodingRegistry;
use crate::error::Result;
use crate::message::codec;
use crate::reencode::NativeRecodeTable;
use crate::router::Router;
use crate::session::ClientSession;
use crate::source::SourceRegistry;
use crate::stream::StreamRegistry;

pub use config::BrokerConfig;

/// The video frame broker
pub struct BrokerServer {
    config: BrokerConfig,
    sources: Arc<SourceRegistry>,
    streams: Arc<StreamRegistry>,
    router: Arc<Router>,
    next_session_id: AtomicU64,
}

impl BrokerServer {
    /// Create a broker with the builtin codecs and native recodes
    pub fn new(config: BrokerConfig) -> Self {
        Self::with_registries(
            config,
            Arc::new(EncodingRegistry::builtin()),
            Arc::new(NativeRecodeTable::builtin()),
        )
    }

    /// Create a broker with custom codec and native-recode registries
    ///
    /// Registration happens before this call; nothing touches the network
    /// until `run`.
    pub fn with_registries(
        config: BrokerConfig,
        encodings: Arc<EncodingRegistry>,
        natives: Arc<NativeRecodeTable>,
    ) -> Self {
        let sources = Arc::new(SourceRegistry::new(config.payload_buffer_size));
        let streams = Arc::new(StreamRegistry::new());
        let router = Arc::new(Router::new(
            encodings,
            Arc::clone(&sources),
            Arc::clone(&streams),
            natives,
            config.request_timeout,
        ));

        Self {
            config,
            sources,
            streams,
            router,
            next_session_id: AtomicU64::new(1),
        }
    }

    /// The source registry, for server-side producers
    pub fn sources(&self) -> &Arc<SourceRegistry> {
        &self.sources
    }

    /// The stream registry
    pub fn streams(&self) -> &Arc<StreamRegistry> {
        &self.streams
    }

    /// The verb router
    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    /// Bind the configured address and serve forever
    pub async fn run(&self) -> Result<()> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        tracing::info!(addr = %self.config.bind_addr, "broker listening");
        self.serve_on(listener).await
    }

    /// Serve until `shutdown` resolves
    pub async fn run_until<F>(&self, shutdown: F) -> Result<()>
    where
        F: std::future::Future<Output = ()>,
    {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        tracing::info!(addr = %self.config.bind_addr, "broker listening");

        tokio::select! {
            _ = shutdown => {
                tracing::info!("shutdown signal received");
                Ok(())
            }
            result = self.serve_on_ref(&listener) => result,
        }
    }

    /// Accept loop over an already-bound listener
    ///
    /// Useful when the caller needs the ephemeral port before serving.
    pub async fn serve_on(&self, listener: TcpListener) -> Result<()> {
        self.serve_on_ref(&listener).await
    }

    async fn serve_on_ref(&self, listener: &TcpListener) -> Result<()> {
        loop {
            match listener.accept().await {
                Ok((socket, peer_addr)) => {
                    let session_id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(session = session_id, peer = %peer_addr, "new connection");

                    if self.config.tcp_nodelay {
                        if let Err(e) = socket.set_nodelay(true) {
                            tracing::debug!(error = %e, "failed to set TCP_NODELAY");
                        }
                    }

                    let session = Arc::new(ClientSession::new(
                        session_id,
                        peer_addr,
                        self.config.outbox_capacity,
                    ));
                    let router = Arc::clone(&self.router);

                    tokio::spawn(async move {
                        run_connection(router, session, socket).await;
                    });
                }
                Err(e) => {
                    tracing::error!(error = %e, "failed to accept connection");
                }
            }
        }
    }
}

/// Drive one client connection to completion
async fn run_connection(router: Arc<Router>, session: Arc<ClientSession>, socket: TcpStream) {
    let (mut reader, mut writer) = socket.into_split();
    let session_id = session.id;

    let outbox = Arc::clone(&session.outbox);
    let write_task = tokio::spawn(async move {
        let mut buf = BytesMut::new();
        while let Some(msg) = outbox.recv().await {
            buf.clear();
            codec::encode(&msg, &mut buf);
            if writer.write_all(&buf).await.is_err() {
                break;
            }
        }
        let _ = writer.shutdown().await;
    });

    let mut inbuf = BytesMut::with_capacity(8 * 1024);
    'read: loop {
        loop {
            match codec::decode(&mut inbuf) {
                Ok(Some(msg)) => router.dispatch(&session, msg).await,
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(session = session_id, error = %e, "protocol violation");
                    break 'read;
                }
            }
        }

        match reader.read_buf(&mut inbuf).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(session = session_id, error = %e, "read failed");
                break;
            }
        }
    }

    session.begin_close();
    router.session_closed(&session).await;
    let _ = write_task.await;
    tracing::debug!(session = session_id, "connection closed");
}
