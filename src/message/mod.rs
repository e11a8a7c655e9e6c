//! Control/data messages
//!
//! Everything on the wire is a discrete message: an ordered sequence of
//! UTF-8 text components plus an optional opaque payload. Component 0 names
//! the verb on requests and carries the status integer on responses.

pub mod codec;

use bytes::Bytes;

use crate::error::ErrorCode;

pub use codec::{decode, encode, MAX_MESSAGE_SIZE};

/// Request id meaning "no response expected" (all `Data` traffic)
pub const NO_RESPONSE: u32 = 0;

/// A discrete wire message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Ordered UTF-8 text components; component 0 is the verb or status
    pub components: Vec<String>,
    /// Opaque payload (encoded frame bytes on `Data` messages)
    pub payload: Bytes,
    /// Correlates responses to requests; `NO_RESPONSE` for fire-and-forget
    pub request_id: u32,
    /// Set on responses, which echo the request id
    pub is_response: bool,
    /// Set on the last `Data` chunk of an encoded frame
    pub frame_boundary: bool,
}

impl Message {
    /// Build a request from components; the request id is stamped at send
    pub fn request<I, S>(components: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            components: components.into_iter().map(Into::into).collect(),
            payload: Bytes::new(),
            request_id: NO_RESPONSE,
            is_response: false,
            frame_boundary: false,
        }
    }

    /// Build a response echoing `request_id`, with the status in component 0
    pub fn response(request_id: u32, code: ErrorCode) -> Self {
        Self {
            components: vec![code.to_wire().to_string()],
            payload: Bytes::new(),
            request_id,
            is_response: true,
            frame_boundary: false,
        }
    }

    /// Append a result component to a response
    pub fn with_component(mut self, component: impl Into<String>) -> Self {
        self.components.push(component.into());
        self
    }

    /// Build a `Data` message carrying one payload chunk
    ///
    /// `target` is the source name on ingress and the decimal stream id on
    /// egress. `boundary` marks the last chunk of an encoded frame.
    pub fn data(target: impl Into<String>, payload: Bytes, boundary: bool) -> Self {
        Self {
            components: vec!["Data".to_string(), target.into()],
            payload,
            request_id: NO_RESPONSE,
            is_response: false,
            frame_boundary: boundary,
        }
    }

    /// The verb (component 0 of a request)
    pub fn verb(&self) -> &str {
        self.component(0)
    }

    /// Component by index, or `""` when absent
    pub fn component(&self, index: usize) -> &str {
        self.components.get(index).map(String::as_str).unwrap_or("")
    }

    /// Whether the sender expects a response
    pub fn expects_response(&self) -> bool {
        !self.is_response && self.request_id != NO_RESPONSE
    }

    /// Status code of a response (component 0)
    pub fn status(&self) -> ErrorCode {
        self.component(0)
            .parse::<i32>()
            .map(ErrorCode::from_wire)
            .unwrap_or(ErrorCode::Internal)
    }
}
