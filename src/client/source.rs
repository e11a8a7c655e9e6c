//! Client-side sources
//!
//! A `SourceHandle` owns the producing half of a source: it declares the
//! encoding and frame shape to the broker, encodes frames locally, and
//! pushes the encoded bytes as chunked `Data` messages.

use std::sync::Arc;

use bytes::Bytes;

use crate::codec::{Codec, Encoder};
use crate::error::{Error, ErrorCode, Result};
use crate::frame::{Frame, FrameProperties};
use crate::message::Message;
use crate::options::Options;
use crate::source::DEFAULT_PAYLOAD_BUFFER_SIZE;

use super::connection::Connection;

/// Producing handle to a client source
pub struct SourceHandle {
    conn: Connection,
    name: String,
    codec: Option<Arc<dyn Codec>>,
    options: Options,
    encoder: Option<Box<dyn Encoder>>,
    props: Option<FrameProperties>,
    payload_buffer_size: usize,
}

impl SourceHandle {
    /// Open a new client source
    ///
    /// The encoding defaults to jpeg, falling back to raw when the broker
    /// does not know jpeg.
    pub async fn open(conn: &Connection, name: &str) -> Result<Self> {
        conn.request_ok(Message::request(["Source.open", "client", name]))
            .await?;

        let mut handle = Self {
            conn: conn.clone(),
            name: name.to_string(),
            codec: None,
            options: Options::default(),
            encoder: None,
            props: None,
            payload_buffer_size: DEFAULT_PAYLOAD_BUFFER_SIZE,
        };

        if handle.set_encoding("jpeg").await.is_err() {
            handle.set_encoding("raw").await?;
        }
        Ok(handle)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Replace the encoding from an option string
    pub async fn set_encoding(&mut self, descriptor: &str) -> Result<()> {
        let options = match Options::parse(descriptor) {
            Ok(options) => options,
            Err(e) => {
                tracing::debug!(
                    descriptor,
                    position = e.position,
                    "encoding descriptor rejected"
                );
                return Err(Error::Status(ErrorCode::ParseError));
            }
        };
        let codec = self
            .conn
            .encodings()
            .get(options.name())
            .ok_or(Error::Status(ErrorCode::NoSuchEncoding))?;

        self.conn
            .request_ok(Message::request([
                "Source.setEncoding",
                self.name.as_str(),
                descriptor,
            ]))
            .await?;

        self.codec = Some(codec);
        self.options = options;
        self.encoder = None;
        Ok(())
    }

    /// Pin the frame shape explicitly
    ///
    /// Without this, the shape is derived from the first frame sent.
    pub async fn set_frame_properties(&mut self, props: FrameProperties) -> Result<()> {
        let wire = props.to_wire();
        self.conn
            .request_ok(Message::request([
                "Source.setFrameProperties",
                self.name.as_str(),
                wire.as_str(),
            ]))
            .await?;

        self.props = Some(props);
        self.encoder = None;
        Ok(())
    }

    /// Encode one frame and push it to the broker
    pub async fn send_frame(&mut self, frame: &Frame) -> Result<()> {
        let codec = self.codec.clone().ok_or(Error::Status(ErrorCode::InvalidState))?;

        match self.props {
            None => self.set_frame_properties(frame.properties).await?,
            Some(props) if props != frame.properties => {
                tracing::warn!(source = %self.name, "frame shape changed");
                return Err(Error::Status(ErrorCode::InvalidArgument));
            }
            Some(_) => {}
        }

        if self.encoder.is_none() {
            self.encoder = Some(codec.new_encoder(&frame.properties, &self.options)?);
        }
        let Some(encoder) = self.encoder.as_mut() else {
            return Err(Error::Status(ErrorCode::Internal));
        };

        encoder.encode(frame)?;

        let mut buf = vec![0u8; self.payload_buffer_size];
        loop {
            let n = encoder.read_data(&mut buf);
            if n == 0 {
                break;
            }
            let boundary = encoder.data_ready() == 0 && encoder.frame_boundary_after_drain();
            let chunk = Bytes::copy_from_slice(&buf[..n]);
            self.conn
                .send(Message::data(self.name.clone(), chunk, boundary))
                .await?;
        }
        Ok(())
    }

    /// Close the source on the broker, orphaning its streams
    pub async fn close(self) -> Result<()> {
        self.conn
            .request_ok(Message::request(["Source.close", self.name.as_str()]))
            .await?;
        Ok(())
    }
}

/// Fetch the broker's source list (`c:`/`s:` prefixed names)
pub async fn list_sources(conn: &Connection) -> Result<Vec<String>> {
    let response = conn
        .request_ok(Message::request(["Source.getSourcesList"]))
        .await?;
    Ok(response.components[1..].to_vec())
}
