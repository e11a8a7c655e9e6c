//! Message router
//!
//! Dispatches inbound messages by their leading component. Request verbs
//! are answered synchronously on the connection's reader task; `Data`
//! messages take the source fast path and never elicit a response.

pub mod pending;

use std::sync::Arc;
use std::time::Duration;

use crate::codec::EncodingRegistry;
use crate::error::{Error, ErrorCode, Result};
use crate::frame::FrameProperties;
use crate::message::Message;
use crate::reencode::NativeRecodeTable;
use crate::session::ClientSession;
use crate::source::{resolve_encoding, SourceKind, SourceRegistry};
use crate::stream::{DropPolicy, Stream, StreamRegistry};

pub use pending::PendingResponses;

/// Verb dispatcher shared by all connections
pub struct Router {
    encodings: Arc<EncodingRegistry>,
    sources: Arc<SourceRegistry>,
    streams: Arc<StreamRegistry>,
    natives: Arc<NativeRecodeTable>,
    /// Responses to requests the server itself issued
    pending: Arc<PendingResponses>,
    /// Budget for `block`-policy deliveries and response waits
    block_timeout: Duration,
}

impl Router {
    pub fn new(
        encodings: Arc<EncodingRegistry>,
        sources: Arc<SourceRegistry>,
        streams: Arc<StreamRegistry>,
        natives: Arc<NativeRecodeTable>,
        block_timeout: Duration,
    ) -> Self {
        Self {
            encodings,
            sources,
            streams,
            natives,
            pending: Arc::new(PendingResponses::new()),
            block_timeout,
        }
    }

    pub fn pending(&self) -> &Arc<PendingResponses> {
        &self.pending
    }

    /// Handle one inbound message, answering it if the peer asked
    pub async fn dispatch(&self, session: &Arc<ClientSession>, msg: Message) {
        if msg.is_response {
            self.pending.complete(msg);
            return;
        }

        let expects_response = msg.expects_response();
        let request_id = msg.request_id;

        let outcome = self.handle(session, &msg).await;

        if !expects_response {
            if let Err(e) = outcome {
                tracing::debug!(
                    session = session.id,
                    verb = msg.verb(),
                    error = %e,
                    "unanswered verb failed"
                );
            }
            return;
        }

        let response = match outcome {
            Ok(extra) => {
                let mut response = Message::response(request_id, ErrorCode::Success);
                response.components.extend(extra);
                response
            }
            Err(e) => Message::response(request_id, e.status()),
        };
        session.outbox.enqueue_control(response);
    }

    /// Run a verb handler; `Ok` carries the result components of a response
    async fn handle(&self, session: &Arc<ClientSession>, msg: &Message) -> Result<Vec<String>> {
        match msg.verb() {
            "Source.open" => self.source_open(session, msg).await,
            "Source.close" => self.source_close(session, msg).await,
            "Source.setEncoding" => self.source_set_encoding(session, msg).await,
            "Source.setFrameProperties" => self.source_set_properties(session, msg).await,
            "Source.getSourcesList" => Ok(self.sources.list().await),
            "Stream.open" => self.stream_open(session, msg).await,
            "Stream.close" => self.stream_close(session, msg).await,
            "Stream.setEncoding" => self.stream_set_encoding(session, msg).await,
            "Stream.pause" => {
                self.subscribed_stream(session, msg.component(1)).await?.pause().await?;
                Ok(Vec::new())
            }
            "Stream.resume" => {
                self.subscribed_stream(session, msg.component(1)).await?.resume().await?;
                Ok(Vec::new())
            }
            "Stream.attach" => self.stream_attach(session, msg).await,
            "Stream.detach" => self.stream_detach(session, msg).await,
            "Data" => self.data(session, msg).await,
            verb => {
                tracing::debug!(session = session.id, verb, "unknown verb");
                Err(Error::Status(ErrorCode::ParseError))
            }
        }
    }

    async fn source_open(
        &self,
        session: &Arc<ClientSession>,
        msg: &Message,
    ) -> Result<Vec<String>> {
        let kind = match msg.component(1) {
            "client" => SourceKind::Client,
            "server" => SourceKind::Server,
            _ => return Err(Error::Status(ErrorCode::ParseError)),
        };
        let name = msg.component(2);
        let owner = match kind {
            SourceKind::Client => Some(session.id),
            SourceKind::Server => None,
        };

        let source = self.sources.open(name, kind, owner).await?;

        // an optional descriptor sets the initial encoding atomically
        let descriptor = msg.component(3);
        if !descriptor.is_empty() {
            let resolved = resolve_encoding(&self.encodings, descriptor);
            match resolved {
                Ok((codec, options)) => source.set_encoding(codec, options).await?,
                Err(e) => {
                    self.sources.close(name).await.ok();
                    return Err(e);
                }
            }
        }

        if kind == SourceKind::Client {
            session.add_source(name);
        }
        Ok(Vec::new())
    }

    async fn source_close(
        &self,
        session: &Arc<ClientSession>,
        msg: &Message,
    ) -> Result<Vec<String>> {
        let name = msg.component(1);
        let source = self
            .sources
            .get(name)
            .await
            .ok_or(Error::Status(ErrorCode::NoSuchSource))?;
        self.check_source_owner(session, &source)?;

        self.sources.close(name).await?;
        session.remove_source(name);
        Ok(Vec::new())
    }

    async fn source_set_encoding(
        &self,
        session: &Arc<ClientSession>,
        msg: &Message,
    ) -> Result<Vec<String>> {
        let source = self
            .sources
            .get(msg.component(1))
            .await
            .ok_or(Error::Status(ErrorCode::NoSuchSource))?;
        self.check_source_owner(session, &source)?;

        let (codec, options) = resolve_encoding(&self.encodings, msg.component(2))?;
        source.set_encoding(codec, options).await?;
        Ok(Vec::new())
    }

    async fn source_set_properties(
        &self,
        session: &Arc<ClientSession>,
        msg: &Message,
    ) -> Result<Vec<String>> {
        let source = self
            .sources
            .get(msg.component(1))
            .await
            .ok_or(Error::Status(ErrorCode::NoSuchSource))?;
        self.check_source_owner(session, &source)?;

        let props = FrameProperties::from_wire(msg.component(2))?;
        source.set_frame_properties(props).await?;
        Ok(Vec::new())
    }

    async fn stream_open(
        &self,
        session: &Arc<ClientSession>,
        msg: &Message,
    ) -> Result<Vec<String>> {
        let source_name = msg.component(1);
        let descriptor = msg.component(2);

        let source = self
            .sources
            .get(source_name)
            .await
            .ok_or(Error::Status(ErrorCode::NoSuchSource))?;
        let (codec, options) = resolve_encoding(&self.encodings, descriptor)?;
        let drop_policy = DropPolicy::from_options(&options)?;

        let id = self.streams.allocate_id();
        let stream = Arc::new(Stream::new(
            id,
            session.id,
            Arc::clone(&session.outbox),
            source_name.to_string(),
            codec,
            options,
            drop_policy,
        ));

        self.streams.insert(Arc::clone(&stream)).await;
        source.attach_stream(Arc::clone(&stream)).await?;
        session.add_stream(id);

        tracing::info!(
            stream = id,
            session = session.id,
            source = %source_name,
            "stream opened"
        );
        Ok(vec![id.to_string()])
    }

    async fn stream_close(
        &self,
        session: &Arc<ClientSession>,
        msg: &Message,
    ) -> Result<Vec<String>> {
        let stream = self.subscribed_stream(session, msg.component(1)).await?;
        self.teardown_stream(&stream).await;
        session.remove_stream(stream.id);
        Ok(Vec::new())
    }

    /// Close a stream and detach it from its source
    pub async fn teardown_stream(&self, stream: &Arc<Stream>) {
        let source_name = stream.source_name().await;
        stream.close().await;
        if let Some(name) = source_name {
            if let Some(source) = self.sources.get(&name).await {
                source.detach_stream(stream.id).await;
            }
        }
        self.streams.remove(stream.id).await;
    }

    async fn stream_set_encoding(
        &self,
        session: &Arc<ClientSession>,
        msg: &Message,
    ) -> Result<Vec<String>> {
        let stream = self.subscribed_stream(session, msg.component(1)).await?;
        let (codec, options) = resolve_encoding(&self.encodings, msg.component(2))?;
        stream.set_encoding(codec, options).await?;
        Ok(Vec::new())
    }

    async fn stream_attach(
        &self,
        session: &Arc<ClientSession>,
        msg: &Message,
    ) -> Result<Vec<String>> {
        let stream = self.subscribed_stream(session, msg.component(1)).await?;
        let new_source = self
            .sources
            .get(msg.component(2))
            .await
            .ok_or(Error::Status(ErrorCode::NoSuchSource))?;

        // leave the old source's fan-out set first
        if let Some(old_name) = stream.source_name().await {
            if let Some(old) = self.sources.get(&old_name).await {
                old.detach_stream(stream.id).await;
            }
        }

        stream.attach(&new_source.name).await?;
        new_source.attach_stream(Arc::clone(&stream)).await?;
        Ok(Vec::new())
    }

    async fn stream_detach(
        &self,
        session: &Arc<ClientSession>,
        msg: &Message,
    ) -> Result<Vec<String>> {
        let stream = self.subscribed_stream(session, msg.component(1)).await?;
        if let Some(name) = stream.source_name().await {
            if let Some(source) = self.sources.get(&name).await {
                source.detach_stream(stream.id).await;
            }
        }
        stream.detach().await?;
        Ok(Vec::new())
    }

    async fn data(&self, session: &Arc<ClientSession>, msg: &Message) -> Result<Vec<String>> {
        let name = msg.component(1);
        let source = self
            .sources
            .get(name)
            .await
            .ok_or(Error::Status(ErrorCode::NoSuchSource))?;
        if source.owner != Some(session.id) {
            return Err(Error::Status(ErrorCode::Unauthorized));
        }

        source
            .send_encoded_chunk(
                &msg.payload,
                msg.frame_boundary,
                &self.natives,
                self.block_timeout,
            )
            .await?;
        Ok(Vec::new())
    }

    /// Look up a stream id string and require the session to subscribe it
    async fn subscribed_stream(
        &self,
        session: &Arc<ClientSession>,
        id: &str,
    ) -> Result<Arc<Stream>> {
        let id: u32 = id
            .parse()
            .map_err(|_| Error::Status(ErrorCode::ParseError))?;
        let stream = self
            .streams
            .get(id)
            .await
            .ok_or(Error::Status(ErrorCode::NoSuchStream))?;
        if stream.subscriber != session.id {
            return Err(Error::Status(ErrorCode::Unauthorized));
        }
        Ok(stream)
    }

    fn check_source_owner(
        &self,
        session: &Arc<ClientSession>,
        source: &Arc<crate::source::Source>,
    ) -> Result<()> {
        match source.owner {
            Some(owner) if owner != session.id => Err(Error::Status(ErrorCode::Unauthorized)),
            _ => Ok(()),
        }
    }

    /// Disconnect cleanup: tear down the session's streams, then its sources
    pub async fn session_closed(&self, session: &Arc<ClientSession>) {
        for id in session.take_streams() {
            if let Some(stream) = self.streams.get(id).await {
                self.teardown_stream(&stream).await;
            }
        }
        self.sources.close_owned(session.id).await;
        session.outbox.close();
        tracing::info!(session = session.id, "session cleaned up");
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};

    use bytes::Bytes;

    use crate::session::DEFAULT_OUTBOX_CAPACITY;
    use crate::source::DEFAULT_PAYLOAD_BUFFER_SIZE;
    use crate::stream::StreamPhase;

    use super::*;

    fn router() -> Router {
        Router::new(
            Arc::new(EncodingRegistry::builtin()),
            Arc::new(SourceRegistry::new(DEFAULT_PAYLOAD_BUFFER_SIZE)),
            Arc::new(StreamRegistry::new()),
            Arc::new(NativeRecodeTable::builtin()),
            Duration::from_millis(100),
        )
    }

    fn session(id: u64) -> Arc<ClientSession> {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 4000);
        Arc::new(ClientSession::new(id, addr, DEFAULT_OUTBOX_CAPACITY))
    }

    fn request(id: u32, components: &[&str]) -> Message {
        let mut msg = Message::request(components.iter().copied());
        msg.request_id = id;
        msg
    }

    async fn expect_response(session: &Arc<ClientSession>) -> Message {
        let msg = session.outbox.recv().await.expect("response queued");
        assert!(msg.is_response);
        msg
    }

    #[tokio::test]
    async fn test_open_set_encoding_and_list() {
        let router = router();
        let client = session(1);

        router
            .dispatch(&client, request(1, &["Source.open", "client", "cam"]))
            .await;
        assert_eq!(expect_response(&client).await.status(), ErrorCode::Success);

        router
            .dispatch(&client, request(2, &["Source.setEncoding", "cam", "jpeg:q=80"]))
            .await;
        assert_eq!(expect_response(&client).await.status(), ErrorCode::Success);

        router
            .dispatch(&client, request(3, &["Source.getSourcesList"]))
            .await;
        let list = expect_response(&client).await;
        assert_eq!(list.status(), ErrorCode::Success);
        assert_eq!(list.component(1), "c:cam");
    }

    #[tokio::test]
    async fn test_duplicate_open_reports_name_in_use() {
        let router = router();
        let client = session(1);

        router
            .dispatch(&client, request(1, &["Source.open", "client", "cam"]))
            .await;
        expect_response(&client).await;

        router
            .dispatch(&client, request(2, &["Source.open", "client", "cam"]))
            .await;
        assert_eq!(expect_response(&client).await.status(), ErrorCode::NameInUse);
    }

    #[tokio::test]
    async fn test_open_with_bad_descriptor_rolls_back() {
        let router = router();
        let client = session(1);

        router
            .dispatch(
                &client,
                request(1, &["Source.open", "client", "cam", "nosuch"]),
            )
            .await;
        assert_eq!(
            expect_response(&client).await.status(),
            ErrorCode::NoSuchEncoding
        );
        assert!(router.sources.get("cam").await.is_none());
    }

    #[tokio::test]
    async fn test_unknown_verb_is_parse_error() {
        let router = router();
        let client = session(1);

        router.dispatch(&client, request(1, &["Bogus.verb"])).await;
        assert_eq!(expect_response(&client).await.status(), ErrorCode::ParseError);
    }

    #[tokio::test]
    async fn test_foreign_source_is_unauthorized() {
        let router = router();
        let owner = session(1);
        let intruder = session(2);

        router
            .dispatch(&owner, request(1, &["Source.open", "client", "cam"]))
            .await;
        expect_response(&owner).await;

        router
            .dispatch(&intruder, request(1, &["Source.close", "cam"]))
            .await;
        assert_eq!(
            expect_response(&intruder).await.status(),
            ErrorCode::Unauthorized
        );
    }

    #[tokio::test]
    async fn test_stream_open_returns_id_and_close_detaches() {
        let router = router();
        let producer = session(1);
        let subscriber = session(2);

        router
            .dispatch(
                &producer,
                request(1, &["Source.open", "client", "cam", "raw"]),
            )
            .await;
        expect_response(&producer).await;

        router
            .dispatch(&subscriber, request(1, &["Stream.open", "cam", "raw"]))
            .await;
        let opened = expect_response(&subscriber).await;
        assert_eq!(opened.status(), ErrorCode::Success);
        let id = opened.component(1).to_string();

        let source = router.sources.get("cam").await.unwrap();
        assert_eq!(source.stream_count().await, 1);

        router
            .dispatch(&subscriber, request(2, &["Stream.close", &id]))
            .await;
        assert_eq!(expect_response(&subscriber).await.status(), ErrorCode::Success);
        assert_eq!(source.stream_count().await, 0);
        assert_eq!(router.streams.len().await, 0);
    }

    #[tokio::test]
    async fn test_data_fast_path_reaches_subscriber() {
        let router = router();
        let producer = session(1);
        let subscriber = session(2);

        router
            .dispatch(
                &producer,
                request(1, &["Source.open", "client", "cam", "raw"]),
            )
            .await;
        expect_response(&producer).await;
        router
            .dispatch(
                &producer,
                request(2, &["Source.setFrameProperties", "cam", "2,2,8,1"]),
            )
            .await;
        expect_response(&producer).await;

        router
            .dispatch(&subscriber, request(1, &["Stream.open", "cam", "raw"]))
            .await;
        expect_response(&subscriber).await;

        let data = Message::data("cam", Bytes::from_static(&[1, 2, 3, 4]), true);
        router.dispatch(&producer, data).await;

        let delivered = subscriber.outbox.recv().await.unwrap();
        assert_eq!(delivered.verb(), "Data");
        assert_eq!(&delivered.payload[..], &[1, 2, 3, 4]);
        assert!(delivered.frame_boundary);
    }

    #[tokio::test]
    async fn test_data_from_non_owner_is_dropped() {
        let router = router();
        let producer = session(1);
        let intruder = session(2);

        router
            .dispatch(
                &producer,
                request(1, &["Source.open", "client", "cam", "raw"]),
            )
            .await;
        expect_response(&producer).await;

        let data = Message::data("cam", Bytes::from_static(&[1]), true);
        router.dispatch(&intruder, data).await;
        // no response and no crash; the chunk went nowhere
        assert_eq!(intruder.outbox.pending_messages(), 0);
    }

    #[tokio::test]
    async fn test_session_cleanup_closes_everything() {
        let router = router();
        let producer = session(1);
        let subscriber = session(2);

        router
            .dispatch(
                &producer,
                request(1, &["Source.open", "client", "cam", "raw"]),
            )
            .await;
        expect_response(&producer).await;

        router
            .dispatch(&subscriber, request(1, &["Stream.open", "cam", "raw"]))
            .await;
        let id: u32 = expect_response(&subscriber)
            .await
            .component(1)
            .parse()
            .unwrap();
        let stream = router.streams.get(id).await.unwrap();

        // producer disconnects: its source closes and the stream orphans
        router.session_closed(&producer).await;
        assert!(router.sources.get("cam").await.is_none());
        assert_eq!(stream.phase().await, StreamPhase::Orphaned);

        // subscriber disconnects: stream unregisters; nothing leaks
        router.session_closed(&subscriber).await;
        assert_eq!(router.streams.len().await, 0);
        assert_eq!(router.sources.len().await, 0);
    }
}
