//! Client-side streams
//!
//! A `StreamHandle` is the subscribing half: it opens a stream on a source,
//! then reassembles the boundary-flagged `Data` chunks the broker delivers
//! into whole encoded frames.

use bytes::{Bytes, BytesMut};
use tokio::sync::mpsc;

use crate::error::{Error, ErrorCode, Result};
use crate::message::Message;

use super::connection::{Connection, StreamChunk};

/// Chunks buffered locally before the handle reads them
const CHUNK_CHANNEL_CAPACITY: usize = 256;

/// Subscribing handle to a stream
pub struct StreamHandle {
    conn: Connection,
    id: u32,
    rx: mpsc::Receiver<StreamChunk>,
    assembling: BytesMut,
}

impl StreamHandle {
    /// Open a stream on `source`, requesting the given encoding descriptor
    pub async fn open(conn: &Connection, source: &str, descriptor: &str) -> Result<Self> {
        let response = conn
            .request_ok(Message::request(["Stream.open", source, descriptor]))
            .await?;
        let id: u32 = response
            .component(1)
            .parse()
            .map_err(|_| Error::Status(ErrorCode::Internal))?;

        let (tx, rx) = mpsc::channel(CHUNK_CHANNEL_CAPACITY);
        conn.register_stream(id, tx);

        Ok(Self {
            conn: conn.clone(),
            id,
            rx,
            assembling: BytesMut::new(),
        })
    }

    /// The broker-allocated stream id
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Receive the next complete encoded frame
    ///
    /// Chunks accumulate until a boundary flag closes the frame. Returns
    /// `Disconnected` when the connection (or the stream) is gone.
    pub async fn recv_frame(&mut self) -> Result<Bytes> {
        loop {
            let chunk = self.rx.recv().await.ok_or(Error::Disconnected)?;
            self.assembling.extend_from_slice(&chunk.payload);
            if chunk.boundary {
                let frame = self.assembling.split().freeze();
                if frame.is_empty() {
                    // bare resync marker
                    continue;
                }
                return Ok(frame);
            }
        }
    }

    pub async fn pause(&self) -> Result<()> {
        self.simple_verb("Stream.pause").await
    }

    pub async fn resume(&self) -> Result<()> {
        self.simple_verb("Stream.resume").await
    }

    /// Change the requested encoding mid-stream
    pub async fn set_encoding(&self, descriptor: &str) -> Result<()> {
        let id = self.id.to_string();
        self.conn
            .request_ok(Message::request([
                "Stream.setEncoding",
                id.as_str(),
                descriptor,
            ]))
            .await?;
        Ok(())
    }

    /// Attach to a different source
    pub async fn attach(&self, source: &str) -> Result<()> {
        let id = self.id.to_string();
        self.conn
            .request_ok(Message::request(["Stream.attach", id.as_str(), source]))
            .await?;
        Ok(())
    }

    /// Close the stream on the broker
    pub async fn close(mut self) -> Result<()> {
        self.rx.close();
        self.conn.unregister_stream(self.id);
        let id = self.id.to_string();
        self.conn
            .request_ok(Message::request(["Stream.close", id.as_str()]))
            .await?;
        Ok(())
    }

    async fn simple_verb(&self, verb: &str) -> Result<()> {
        let id = self.id.to_string();
        self.conn
            .request_ok(Message::request([verb, id.as_str()]))
            .await?;
        Ok(())
    }
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        self.conn.unregister_stream(self.id);
    }
}
