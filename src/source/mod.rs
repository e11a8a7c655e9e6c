//! Sources: named frame ingress
//!
//! A source owns its encoding, its encoder, the pinned frame shape, and the
//! set of attached streams. Frames enter either uncompressed via
//! `send_frame` (server-side producers) or already encoded via
//! `send_encoded_chunk` (the `Data` fast path for client producers that
//! encode locally).

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, RwLock};

use crate::codec::{Codec, Encoder, EncodingRegistry};
use crate::error::{Error, ErrorCode, Result};
use crate::frame::{Frame, FrameProperties};
use crate::options::Options;
use crate::reencode::NativeRecodeTable;
use crate::session::SessionId;
use crate::stream::{EncodingSnapshot, Stream};

/// Default drain chunk size for the hot path
pub const DEFAULT_PAYLOAD_BUFFER_SIZE: usize = 4 * 1024;

/// Who feeds a source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    /// Opened and fed by a connected client
    Client,
    /// Opened by the process itself (captures, test patterns)
    Server,
}

impl SourceKind {
    /// Listing prefix (`c:` / `s:`)
    pub fn prefix(self) -> &'static str {
        match self {
            SourceKind::Client => "c:",
            SourceKind::Server => "s:",
        }
    }
}

struct SourceState {
    codec: Option<Arc<dyn Codec>>,
    options: Options,
    props: Option<FrameProperties>,
    encoder: Option<Box<dyn Encoder>>,
    /// Bumped on every encoding/shape change; streams rebuild reencoders
    /// lazily when the epoch they bound falls behind
    epoch: u64,
    snapshot: Option<Arc<EncodingSnapshot>>,
    /// Attached streams in ascending-id order (the delivery lock order)
    streams: BTreeMap<u32, Arc<Stream>>,
    closed: bool,
}

/// Named frame ingress
pub struct Source {
    pub name: String,
    pub kind: SourceKind,
    /// Owning session for client sources; `None` means the process
    pub owner: Option<SessionId>,
    payload_buffer_size: usize,
    state: Mutex<SourceState>,
}

impl std::fmt::Debug for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Source")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("owner", &self.owner)
            .finish()
    }
}

impl Source {
    pub fn new(
        name: String,
        kind: SourceKind,
        owner: Option<SessionId>,
        payload_buffer_size: usize,
    ) -> Self {
        Self {
            name,
            kind,
            owner,
            payload_buffer_size,
            state: Mutex::new(SourceState {
                codec: None,
                options: Options::default(),
                props: None,
                encoder: None,
                epoch: 0,
                snapshot: None,
                streams: BTreeMap::new(),
                closed: false,
            }),
        }
    }

    /// Replace the encoding from a parsed descriptor
    ///
    /// Any existing encoder is discarded; the next frame reconstructs it.
    /// Attached streams observe the epoch bump and rebuild their reencoders
    /// lazily.
    pub async fn set_encoding(&self, codec: Arc<dyn Codec>, options: Options) -> Result<()> {
        let mut st = self.state.lock().await;
        if st.closed {
            return Err(Error::Status(ErrorCode::InvalidState));
        }
        st.codec = Some(codec);
        st.options = options;
        st.encoder = None;
        st.epoch += 1;
        st.snapshot = None;
        tracing::debug!(source = %self.name, epoch = st.epoch, "encoding replaced");
        Ok(())
    }

    /// Install or replace the frame shape
    pub async fn set_frame_properties(&self, props: FrameProperties) -> Result<()> {
        let mut st = self.state.lock().await;
        if st.closed {
            return Err(Error::Status(ErrorCode::InvalidState));
        }
        if st.props == Some(props) {
            return Ok(());
        }
        st.props = Some(props);
        st.encoder = None;
        st.epoch += 1;
        st.snapshot = None;
        Ok(())
    }

    pub async fn frame_properties(&self) -> Option<FrameProperties> {
        self.state.lock().await.props
    }

    /// Encode one frame and fan the output out to attached streams
    ///
    /// The whole path runs under the source lock: shape check, lazy encoder
    /// construction, encode, chunked drain, delivery to each stream in
    /// ascending-id order with a boundary on the final chunk.
    pub async fn send_frame(
        &self,
        frame: &Frame,
        natives: &NativeRecodeTable,
        block_timeout: Duration,
    ) -> Result<()> {
        let mut st = self.state.lock().await;
        if st.closed {
            return Err(Error::Status(ErrorCode::InvalidState));
        }
        let codec = st.codec.clone().ok_or(Error::Status(ErrorCode::InvalidState))?;

        match st.props {
            None => {
                st.props = Some(frame.properties);
                st.epoch += 1;
                st.snapshot = None;
            }
            Some(props) if props != frame.properties => {
                tracing::warn!(
                    source = %self.name,
                    pinned = %props,
                    got = %frame.properties,
                    "frame shape changed"
                );
                return Err(Error::Status(ErrorCode::InvalidArgument));
            }
            Some(_) => {}
        }

        if st.encoder.is_none() {
            st.encoder = Some(codec.new_encoder(&frame.properties, &st.options)?);
        }

        let snapshot = ensure_snapshot(&mut st)?;

        let st = &mut *st;
        let Some(encoder) = st.encoder.as_mut() else {
            return Err(Error::Status(ErrorCode::Internal));
        };
        encoder.encode(frame)?;

        let mut buf = vec![0u8; self.payload_buffer_size];
        let mut stale = Vec::new();
        loop {
            let n = encoder.read_data(&mut buf);
            if n == 0 {
                break;
            }
            let boundary = encoder.data_ready() == 0 && encoder.frame_boundary_after_drain();
            for stream in st.streams.values() {
                if !stream
                    .deliver(&buf[..n], boundary, &snapshot, natives, block_timeout)
                    .await
                {
                    stale.push(stream.id);
                }
            }
        }

        for id in stale {
            st.streams.remove(&id);
        }
        Ok(())
    }

    /// Fan out an already-encoded chunk (ingress `Data` fast path)
    pub async fn send_encoded_chunk(
        &self,
        chunk: &[u8],
        boundary: bool,
        natives: &NativeRecodeTable,
        block_timeout: Duration,
    ) -> Result<()> {
        let mut st = self.state.lock().await;
        if st.closed {
            return Err(Error::Status(ErrorCode::InvalidState));
        }
        if st.codec.is_none() || st.props.is_none() {
            // encoding and shape must be declared before encoded data flows
            return Err(Error::Status(ErrorCode::InvalidState));
        }

        let snapshot = ensure_snapshot(&mut st)?;

        let st = &mut *st;
        let mut stale = Vec::new();
        for stream in st.streams.values() {
            if !stream
                .deliver(chunk, boundary, &snapshot, natives, block_timeout)
                .await
            {
                stale.push(stream.id);
            }
        }
        for id in stale {
            st.streams.remove(&id);
        }
        Ok(())
    }

    /// Attach a stream to the fan-out set
    pub async fn attach_stream(&self, stream: Arc<Stream>) -> Result<()> {
        let mut st = self.state.lock().await;
        if st.closed {
            return Err(Error::Status(ErrorCode::NoSuchSource));
        }
        st.streams.insert(stream.id, stream);
        Ok(())
    }

    pub async fn detach_stream(&self, stream_id: u32) {
        let mut st = self.state.lock().await;
        st.streams.remove(&stream_id);
    }

    pub async fn stream_count(&self) -> usize {
        self.state.lock().await.streams.len()
    }

    /// Close the source, orphaning all attached streams
    pub async fn close(&self) {
        let streams: Vec<Arc<Stream>> = {
            let mut st = self.state.lock().await;
            st.closed = true;
            st.encoder = None;
            st.codec = None;
            st.props = None;
            st.snapshot = None;
            std::mem::take(&mut st.streams).into_values().collect()
        };
        // source lock released; orphan each stream under its own lock
        for stream in streams {
            stream.orphan().await;
        }
        tracing::info!(source = %self.name, "source closed");
    }
}

fn ensure_snapshot(st: &mut SourceState) -> Result<Arc<EncodingSnapshot>> {
    if let Some(snapshot) = &st.snapshot {
        if snapshot.epoch == st.epoch {
            return Ok(Arc::clone(snapshot));
        }
    }
    let codec = st.codec.clone().ok_or(Error::Status(ErrorCode::InvalidState))?;
    let props = st.props.ok_or(Error::Status(ErrorCode::InvalidState))?;
    let snapshot = Arc::new(EncodingSnapshot {
        epoch: st.epoch,
        codec,
        options: st.options.clone(),
        props,
    });
    st.snapshot = Some(Arc::clone(&snapshot));
    Ok(snapshot)
}

/// Registry of live sources, keyed by name
pub struct SourceRegistry {
    sources: RwLock<HashMap<String, Arc<Source>>>,
    payload_buffer_size: usize,
}

impl SourceRegistry {
    pub fn new(payload_buffer_size: usize) -> Self {
        Self {
            sources: RwLock::new(HashMap::new()),
            payload_buffer_size,
        }
    }

    /// Register a new source
    pub async fn open(
        &self,
        name: &str,
        kind: SourceKind,
        owner: Option<SessionId>,
    ) -> Result<Arc<Source>> {
        if name.is_empty() {
            return Err(Error::Status(ErrorCode::InvalidArgument));
        }
        let mut sources = self.sources.write().await;
        if sources.contains_key(name) {
            return Err(Error::Status(ErrorCode::NameInUse));
        }
        let source = Arc::new(Source::new(
            name.to_string(),
            kind,
            owner,
            self.payload_buffer_size,
        ));
        sources.insert(name.to_string(), Arc::clone(&source));
        tracing::info!(source = %name, kind = ?kind, "source opened");
        Ok(source)
    }

    pub async fn get(&self, name: &str) -> Option<Arc<Source>> {
        self.sources.read().await.get(name).cloned()
    }

    /// Remove and close a source
    pub async fn close(&self, name: &str) -> Result<()> {
        let source = {
            let mut sources = self.sources.write().await;
            sources
                .remove(name)
                .ok_or(Error::Status(ErrorCode::NoSuchSource))?
        };
        source.close().await;
        Ok(())
    }

    /// Close every source owned by `session` (disconnect cleanup)
    pub async fn close_owned(&self, session: SessionId) {
        let owned: Vec<Arc<Source>> = {
            let mut sources = self.sources.write().await;
            let names: Vec<String> = sources
                .iter()
                .filter(|(_, s)| s.owner == Some(session))
                .map(|(n, _)| n.clone())
                .collect();
            names
                .iter()
                .filter_map(|n| sources.remove(n))
                .collect()
        };
        for source in owned {
            source.close().await;
        }
    }

    /// Source names with their `c:` / `s:` kind prefix
    pub async fn list(&self) -> Vec<String> {
        self.sources
            .read()
            .await
            .values()
            .map(|s| format!("{}{}", s.kind.prefix(), s.name))
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.sources.read().await.len()
    }
}

/// Parse an encoding descriptor and resolve its codec
///
/// Shared by the source and stream verb handlers.
pub fn resolve_encoding(
    encodings: &EncodingRegistry,
    descriptor: &str,
) -> Result<(Arc<dyn Codec>, Options)> {
    let options = match Options::parse(descriptor) {
        Ok(options) => options,
        Err(e) => {
            tracing::debug!(descriptor, position = e.position, "bad encoding descriptor");
            return Err(Error::Status(ErrorCode::ParseError));
        }
    };
    let codec = encodings
        .get(options.name())
        .ok_or(Error::Status(ErrorCode::NoSuchEncoding))?;
    Ok((codec, options))
}
