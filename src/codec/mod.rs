//! Codec registry and engine contracts
//!
//! An encoding is a named factory producing streaming encode/decode engines
//! bound to a fixed frame shape. Engines are push-in/pull-out and stateful;
//! they are owned by their source or stream and are never shared across
//! tasks.

pub mod jpeg;
pub mod raw;

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::Result;
use crate::frame::{Frame, FrameProperties};
use crate::options::Options;

pub use jpeg::JpegCodec;
pub use raw::RawCodec;

/// Capability flags advertised by a codec
///
/// The reencoder planner reads these instead of downcasting: `passthrough`
/// gates the byte-exact direct-copy path, `lossless` documents round-trip
/// exactness, `interframe` marks codecs whose frames depend on predecessors.
#[derive(Debug, Clone, Copy, Default)]
pub struct EncodingFlags {
    pub passthrough: bool,
    pub interframe: bool,
    pub lossless: bool,
}

/// A named encoding: factory for encoder/decoder engines
pub trait Codec: Send + Sync {
    fn name(&self) -> &'static str;

    fn flags(&self) -> EncodingFlags;

    /// Build an encoder bound to `props`, or fail with `InvalidArgument`
    /// when the shape or options are unsupported
    fn new_encoder(&self, props: &FrameProperties, opts: &Options) -> Result<Box<dyn Encoder>>;

    /// Build a decoder bound to `props`
    fn new_decoder(&self, props: &FrameProperties, opts: &Options) -> Result<Box<dyn Decoder>>;

    /// Whether two option sets produce byte-identical output
    ///
    /// The direct-copy reencode path is only taken when this holds.
    fn options_equivalent(&self, a: &Options, b: &Options) -> bool;
}

impl std::fmt::Debug for dyn Codec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Codec").field(&self.name()).finish()
    }
}

/// Streaming encoder: frames in, encoded bytes out
pub trait Encoder: Send {
    /// Push one uncompressed frame
    fn encode(&mut self, frame: &Frame) -> Result<()>;

    /// Encoded bytes currently available to read
    fn data_ready(&self) -> usize;

    /// Drain up to `buf.len()` encoded bytes; returns the count moved
    fn read_data(&mut self, buf: &mut [u8]) -> usize;

    /// Whether draining to zero after a push marks a frame boundary
    ///
    /// All builtin encoders emit one frame per push, so the default holds;
    /// an encoder with internal latency would return false and mark
    /// boundaries itself.
    fn frame_boundary_after_drain(&self) -> bool {
        true
    }
}

/// Streaming decoder: encoded bytes in, frames out
pub trait Decoder: Send {
    /// Feed encoded bytes
    fn write_data(&mut self, data: &[u8]) -> Result<()>;

    /// Whether a complete frame can be read
    fn frame_ready(&self) -> bool;

    /// Decode the next complete frame
    ///
    /// Only valid when `frame_ready()`. A decode failure consumes the bad
    /// input (the decoder resynchronizes itself at the next boundary) and
    /// returns the error.
    fn read_frame(&mut self) -> Result<Frame>;
}

/// Named codec lookup
///
/// Built once at startup, before any network I/O, then shared read-only
/// behind an `Arc`.
pub struct EncodingRegistry {
    codecs: HashMap<&'static str, Arc<dyn Codec>>,
}

impl EncodingRegistry {
    /// Registry with the builtin codecs (`raw`, `jpeg`)
    pub fn builtin() -> Self {
        let mut registry = Self {
            codecs: HashMap::new(),
        };
        registry.register(Arc::new(RawCodec));
        registry.register(Arc::new(JpegCodec));
        registry
    }

    /// Empty registry, for callers that want full control
    pub fn empty() -> Self {
        Self {
            codecs: HashMap::new(),
        }
    }

    /// Register a codec under its name; replaces any previous entry
    pub fn register(&mut self, codec: Arc<dyn Codec>) {
        self.codecs.insert(codec.name(), codec);
    }

    /// Look up a codec by name
    pub fn get(&self, name: &str) -> Option<Arc<dyn Codec>> {
        self.codecs.get(name).cloned()
    }

    /// Registered codec names
    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.codecs.keys().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_registry() {
        let registry = EncodingRegistry::builtin();
        assert!(registry.get("raw").is_some());
        assert!(registry.get("jpeg").is_some());
        assert!(registry.get("ffv1").is_none());
    }

    #[test]
    fn test_flags() {
        let registry = EncodingRegistry::builtin();
        let raw = registry.get("raw").unwrap();
        assert!(raw.flags().passthrough);
        assert!(raw.flags().lossless);

        let jpeg = registry.get("jpeg").unwrap();
        assert!(jpeg.flags().passthrough);
        assert!(!jpeg.flags().lossless);
    }
}
