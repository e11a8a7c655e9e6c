//! Streams: per-subscriber egress
//!
//! A stream couples one subscriber to one source, converting the source's
//! encoded bytes into the subscriber's requested encoding and queueing the
//! result on the subscriber's outbox. Streams never own their source; they
//! are attached to it by id and orphaned when it closes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{Mutex, RwLock};

use crate::codec::Codec;
use crate::error::{Error, ErrorCode, Result};
use crate::frame::FrameProperties;
use crate::message::Message;
use crate::options::Options;
use crate::reencode::{NativeRecodeTable, Reencoder, ReencoderKind};
use crate::session::{Outbox, SessionId};

/// Stream delivery state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamPhase {
    /// Delivering
    Flowing,
    /// Dropping chunks (not buffering) until resumed
    Paused,
    /// Source closed; emits nothing until reattached or closed
    Orphaned,
    /// Torn down; skipped by the fan-out and pruned lazily
    Closed,
}

/// What to do when the subscriber's outbox has no space
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropPolicy {
    /// Suspend the source until space frees, up to the request timeout
    Block,
    /// Discard produced bytes up to the next frame boundary
    DropNewest,
    /// Evict the oldest queued bytes and force a resync boundary
    DropOldest,
}

impl DropPolicy {
    /// Read the `drop` option, defaulting to `drop_newest`
    pub fn from_options(opts: &Options) -> Result<Self> {
        match opts.get("drop") {
            None | Some("newest") => Ok(DropPolicy::DropNewest),
            Some("oldest") => Ok(DropPolicy::DropOldest),
            Some("block") => Ok(DropPolicy::Block),
            Some(_) => Err(Error::Status(ErrorCode::InvalidArgument)),
        }
    }
}

/// Snapshot of a source's output encoding, carried along each delivery
///
/// `epoch` increments whenever the source's encoding or frame properties
/// change; a stream whose reencoder was built against an older epoch
/// rebuilds it before converting the chunk.
#[derive(Clone)]
pub struct EncodingSnapshot {
    pub epoch: u64,
    pub codec: Arc<dyn Codec>,
    pub options: Options,
    pub props: FrameProperties,
}

struct StreamState {
    source_name: Option<String>,
    codec: Arc<dyn Codec>,
    options: Options,
    phase: StreamPhase,
    drop_policy: DropPolicy,
    reencoder: Option<Reencoder>,
    bound_epoch: u64,
    /// Discard input until the next boundary (set while paused and after
    /// a drop_newest discard, so partial frames never reach the reencoder)
    skip_to_boundary: bool,
    /// Next emitted chunk must carry a boundary so the subscriber resyncs
    /// (set after drop_oldest evictions)
    resync: bool,
    /// How many times the reencoder has been (re)built
    rebuilds: u64,
}

/// Per-subscriber egress object
pub struct Stream {
    pub id: u32,
    pub subscriber: SessionId,
    outbox: Arc<Outbox>,
    state: Mutex<StreamState>,
}

impl Stream {
    pub fn new(
        id: u32,
        subscriber: SessionId,
        outbox: Arc<Outbox>,
        source_name: String,
        codec: Arc<dyn Codec>,
        options: Options,
        drop_policy: DropPolicy,
    ) -> Self {
        Self {
            id,
            subscriber,
            outbox,
            state: Mutex::new(StreamState {
                source_name: Some(source_name),
                codec,
                options,
                phase: StreamPhase::Flowing,
                drop_policy,
                reencoder: None,
                bound_epoch: 0,
                skip_to_boundary: false,
                resync: false,
                rebuilds: 0,
            }),
        }
    }

    pub async fn phase(&self) -> StreamPhase {
        self.state.lock().await.phase
    }

    pub async fn source_name(&self) -> Option<String> {
        self.state.lock().await.source_name.clone()
    }

    /// Reencoder variant currently bound, for inspection
    pub async fn reencoder_kind(&self) -> Option<ReencoderKind> {
        self.state.lock().await.reencoder.as_ref().map(Reencoder::kind)
    }

    /// Times the reencoder has been built or rebuilt
    pub async fn reencoder_rebuilds(&self) -> u64 {
        self.state.lock().await.rebuilds
    }

    pub async fn pause(&self) -> Result<()> {
        let mut st = self.state.lock().await;
        match st.phase {
            StreamPhase::Flowing | StreamPhase::Paused => {
                st.phase = StreamPhase::Paused;
                Ok(())
            }
            StreamPhase::Orphaned | StreamPhase::Closed => {
                Err(Error::Status(ErrorCode::InvalidState))
            }
        }
    }

    pub async fn resume(&self) -> Result<()> {
        let mut st = self.state.lock().await;
        match st.phase {
            StreamPhase::Paused | StreamPhase::Flowing => {
                st.phase = StreamPhase::Flowing;
                Ok(())
            }
            StreamPhase::Orphaned | StreamPhase::Closed => {
                Err(Error::Status(ErrorCode::InvalidState))
            }
        }
    }

    /// Replace the requested encoding; the reencoder rebuilds lazily
    pub async fn set_encoding(&self, codec: Arc<dyn Codec>, options: Options) -> Result<()> {
        let mut st = self.state.lock().await;
        if st.phase == StreamPhase::Closed {
            return Err(Error::Status(ErrorCode::InvalidState));
        }
        st.codec = codec;
        st.options = options;
        st.reencoder = None;
        Ok(())
    }

    /// Source closed underneath us
    pub async fn orphan(&self) {
        let mut st = self.state.lock().await;
        if st.phase != StreamPhase::Closed {
            st.phase = StreamPhase::Orphaned;
            st.source_name = None;
            st.reencoder = None;
            tracing::debug!(stream = self.id, "stream orphaned");
        }
    }

    /// Attach to a (new) source; valid from flowing or orphaned
    pub async fn attach(&self, source_name: &str) -> Result<()> {
        let mut st = self.state.lock().await;
        match st.phase {
            StreamPhase::Closed => Err(Error::Status(ErrorCode::InvalidState)),
            _ => {
                st.source_name = Some(source_name.to_string());
                st.reencoder = None;
                if st.phase == StreamPhase::Orphaned {
                    st.phase = StreamPhase::Flowing;
                }
                Ok(())
            }
        }
    }

    /// Detach from the current source without closing
    pub async fn detach(&self) -> Result<()> {
        let mut st = self.state.lock().await;
        if st.phase == StreamPhase::Closed {
            return Err(Error::Status(ErrorCode::InvalidState));
        }
        st.source_name = None;
        st.reencoder = None;
        st.phase = StreamPhase::Orphaned;
        Ok(())
    }

    pub async fn close(&self) {
        let mut st = self.state.lock().await;
        st.phase = StreamPhase::Closed;
        st.source_name = None;
        st.reencoder = None;
    }

    /// Convert one source chunk and queue the result to the subscriber
    ///
    /// Called by the source with its own lock held, streams in ascending-id
    /// order. Returns `false` when the stream has closed and should be
    /// detached from the source's fan-out set.
    pub async fn deliver(
        &self,
        chunk: &[u8],
        boundary: bool,
        snapshot: &EncodingSnapshot,
        natives: &NativeRecodeTable,
        block_timeout: Duration,
    ) -> bool {
        let mut st = self.state.lock().await;

        match st.phase {
            StreamPhase::Flowing => {}
            StreamPhase::Paused => {
                // drop, never buffer; restart clean at the next boundary
                st.skip_to_boundary = !boundary;
                return true;
            }
            StreamPhase::Orphaned => return true,
            StreamPhase::Closed => return false,
        }

        if st.skip_to_boundary {
            if boundary {
                st.skip_to_boundary = false;
            }
            return true;
        }

        if st.reencoder.is_none() || st.bound_epoch != snapshot.epoch {
            match Reencoder::build(
                &snapshot.codec,
                &snapshot.options,
                &st.codec,
                &st.options,
                &snapshot.props,
                natives,
            ) {
                Ok(reencoder) => {
                    tracing::debug!(
                        stream = self.id,
                        kind = ?reencoder.kind(),
                        epoch = snapshot.epoch,
                        "reencoder bound"
                    );
                    st.reencoder = Some(reencoder);
                    st.bound_epoch = snapshot.epoch;
                    st.rebuilds += 1;
                }
                Err(e) => {
                    tracing::warn!(stream = self.id, error = %e, "reencoder build failed");
                    st.skip_to_boundary = !boundary;
                    return true;
                }
            }
        }

        let Some(reencoder) = st.reencoder.as_mut() else {
            return true;
        };
        let mut out = Vec::new();
        let out_boundary = match reencoder.reencode(chunk, boundary, &mut out) {
            Ok(b) => b,
            Err(e) => {
                tracing::warn!(stream = self.id, error = %e, "reencode failed, resyncing");
                st.skip_to_boundary = !boundary;
                return true;
            }
        };

        if out.is_empty() && !out_boundary && !st.resync {
            return true;
        }

        let force_boundary = std::mem::take(&mut st.resync);
        let msg = Message::data(
            self.id.to_string(),
            Bytes::from(out),
            out_boundary || force_boundary,
        );

        match st.drop_policy {
            DropPolicy::DropNewest => {
                if !self.outbox.try_enqueue(msg) {
                    tracing::debug!(stream = self.id, "outbox full, chunk dropped");
                    st.skip_to_boundary = !boundary;
                }
            }
            DropPolicy::DropOldest => {
                let mut evicted = false;
                loop {
                    if self.outbox.try_enqueue(msg.clone()) {
                        break;
                    }
                    if !self.outbox.evict_oldest() {
                        // nothing evictable and still no room
                        st.skip_to_boundary = !boundary;
                        break;
                    }
                    evicted = true;
                }
                if evicted {
                    tracing::debug!(stream = self.id, "outbox overflow, oldest evicted");
                    st.resync = true;
                }
            }
            DropPolicy::Block => {
                if let Err(e) = self.outbox.enqueue_wait(msg, block_timeout).await {
                    tracing::warn!(
                        stream = self.id,
                        subscriber = self.subscriber,
                        error = %e,
                        "subscriber stalled past timeout, closing stream"
                    );
                    st.phase = StreamPhase::Closed;
                    st.reencoder = None;
                    return false;
                }
            }
        }

        true
    }
}

/// Registry of open streams, keyed by their server-allocated id
///
/// Ids ascend globally; the fan-out path relies on that for its lock order.
pub struct StreamRegistry {
    streams: RwLock<HashMap<u32, Arc<Stream>>>,
    next_id: AtomicU32,
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self {
            streams: RwLock::new(HashMap::new()),
            next_id: AtomicU32::new(1),
        }
    }

    /// Allocate the next stream id
    pub fn allocate_id(&self) -> u32 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub async fn insert(&self, stream: Arc<Stream>) {
        self.streams.write().await.insert(stream.id, stream);
    }

    pub async fn get(&self, id: u32) -> Option<Arc<Stream>> {
        self.streams.read().await.get(&id).cloned()
    }

    pub async fn remove(&self, id: u32) -> Option<Arc<Stream>> {
        self.streams.write().await.remove(&id)
    }

    pub async fn len(&self) -> usize {
        self.streams.read().await.len()
    }
}

impl Default for StreamRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use crate::codec::EncodingRegistry;
    use crate::frame::PixelDepth;
    use crate::session::DEFAULT_OUTBOX_CAPACITY;

    use super::*;

    fn snapshot(epoch: u64) -> EncodingSnapshot {
        let registry = EncodingRegistry::builtin();
        EncodingSnapshot {
            epoch,
            codec: registry.get("raw").unwrap(),
            options: Options::parse("raw").unwrap(),
            props: FrameProperties::new(2, 2, PixelDepth::U8, 1),
        }
    }

    fn make_stream(policy: DropPolicy, capacity: usize) -> (Arc<Stream>, Arc<Outbox>) {
        let outbox = Arc::new(Outbox::new(capacity));
        let registry = EncodingRegistry::builtin();
        let stream = Arc::new(Stream::new(
            1,
            9,
            Arc::clone(&outbox),
            "cam".to_string(),
            registry.get("raw").unwrap(),
            Options::parse("raw").unwrap(),
            policy,
        ));
        (stream, outbox)
    }

    #[tokio::test]
    async fn test_delivery_direct_copy() {
        let (stream, outbox) = make_stream(DropPolicy::DropNewest, DEFAULT_OUTBOX_CAPACITY);
        let natives = NativeRecodeTable::builtin();

        assert!(
            stream
                .deliver(&[1, 2, 3, 4], true, &snapshot(1), &natives, Duration::ZERO)
                .await
        );

        assert_eq!(stream.reencoder_kind().await, Some(ReencoderKind::DirectCopy));
        let msg = outbox.recv().await.unwrap();
        assert_eq!(msg.verb(), "Data");
        assert_eq!(msg.component(1), "1");
        assert!(msg.frame_boundary);
        assert_eq!(&msg.payload[..], &[1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_paused_drops_without_buffering() {
        let (stream, outbox) = make_stream(DropPolicy::DropNewest, DEFAULT_OUTBOX_CAPACITY);
        let natives = NativeRecodeTable::builtin();

        stream.pause().await.unwrap();
        stream
            .deliver(&[1, 2], false, &snapshot(1), &natives, Duration::ZERO)
            .await;
        assert_eq!(outbox.pending_messages(), 0);

        // resume mid-frame: remainder of the split frame is skipped
        stream.resume().await.unwrap();
        stream
            .deliver(&[3, 4], true, &snapshot(1), &natives, Duration::ZERO)
            .await;
        assert_eq!(outbox.pending_messages(), 0);

        // the next complete frame flows
        stream
            .deliver(&[5, 6, 7, 8], true, &snapshot(1), &natives, Duration::ZERO)
            .await;
        assert_eq!(outbox.pending_messages(), 1);
    }

    #[tokio::test]
    async fn test_epoch_change_rebuilds_once() {
        let (stream, _outbox) = make_stream(DropPolicy::DropNewest, DEFAULT_OUTBOX_CAPACITY);
        let natives = NativeRecodeTable::builtin();

        stream
            .deliver(&[1, 2, 3, 4], true, &snapshot(1), &natives, Duration::ZERO)
            .await;
        stream
            .deliver(&[1, 2, 3, 4], true, &snapshot(1), &natives, Duration::ZERO)
            .await;
        assert_eq!(stream.reencoder_rebuilds().await, 1);

        stream
            .deliver(&[1, 2, 3, 4], true, &snapshot(2), &natives, Duration::ZERO)
            .await;
        stream
            .deliver(&[1, 2, 3, 4], true, &snapshot(2), &natives, Duration::ZERO)
            .await;
        assert_eq!(stream.reencoder_rebuilds().await, 2);
    }

    #[tokio::test]
    async fn test_block_policy_closes_on_timeout() {
        let (stream, outbox) = make_stream(DropPolicy::Block, 30);
        let natives = NativeRecodeTable::builtin();

        // first delivery fills the tiny outbox
        assert!(
            stream
                .deliver(
                    &[1, 2, 3, 4],
                    true,
                    &snapshot(1),
                    &natives,
                    Duration::from_millis(10),
                )
                .await
        );
        assert_eq!(outbox.pending_messages(), 1);

        // second cannot fit and the subscriber never drains
        let kept = stream
            .deliver(
                &[5, 6, 7, 8],
                true,
                &snapshot(1),
                &natives,
                Duration::from_millis(10),
            )
            .await;
        assert!(!kept);
        assert_eq!(stream.phase().await, StreamPhase::Closed);
    }

    #[tokio::test]
    async fn test_drop_oldest_evicts_and_resyncs() {
        let (stream, outbox) = make_stream(DropPolicy::DropOldest, 48);
        let natives = NativeRecodeTable::builtin();

        stream
            .deliver(&[1, 2, 3, 4], true, &snapshot(1), &natives, Duration::ZERO)
            .await;
        stream
            .deliver(&[5, 6, 7, 8], true, &snapshot(1), &natives, Duration::ZERO)
            .await;

        // the oldest was evicted to make room; only the newer chunk remains
        let msg = outbox.recv().await.unwrap();
        assert_eq!(&msg.payload[..], &[5, 6, 7, 8]);
        assert!(msg.frame_boundary);
        assert_eq!(outbox.pending_messages(), 0);
    }

    #[tokio::test]
    async fn test_orphaned_stream_emits_nothing() {
        let (stream, outbox) = make_stream(DropPolicy::DropNewest, DEFAULT_OUTBOX_CAPACITY);
        let natives = NativeRecodeTable::builtin();

        stream.orphan().await;
        assert_eq!(stream.phase().await, StreamPhase::Orphaned);
        assert!(
            stream
                .deliver(&[1, 2, 3, 4], true, &snapshot(1), &natives, Duration::ZERO)
                .await
        );
        assert_eq!(outbox.pending_messages(), 0);

        // reattach restores flow
        stream.attach("cam2").await.unwrap();
        assert_eq!(stream.phase().await, StreamPhase::Flowing);
    }

    #[tokio::test]
    async fn test_closed_stream_reports_detach() {
        let (stream, _outbox) = make_stream(DropPolicy::DropNewest, DEFAULT_OUTBOX_CAPACITY);
        let natives = NativeRecodeTable::builtin();

        stream.close().await;
        let kept = stream
            .deliver(&[1, 2, 3, 4], true, &snapshot(1), &natives, Duration::ZERO)
            .await;
        assert!(!kept);
        assert!(stream.pause().await.is_err());
    }
}
