//! Re-encoding pipeline
//!
//! A reencoder bridges a source's encoded byte stream to a stream's
//! requested encoding. Three variants, tried in order when one is built:
//! byte-exact direct copy, a codec-native recode registered for the
//! `(in, out)` encoding pair, and the general decode/encode path.

use std::collections::HashMap;
use std::sync::Arc;

use crate::codec::{Codec, Decoder, Encoder};
use crate::error::Result;
use crate::frame::FrameProperties;
use crate::options::Options;

/// A recode specialized for one `(in, out)` encoding pair
///
/// Converts encoded bytes without a full decode cycle (the builtin example
/// rewrites raw channel order in place).
pub trait NativeRecode: Send {
    fn recode(&mut self, input: &[u8], boundary: bool, out: &mut Vec<u8>) -> Result<()>;
}

/// Factory for a native recode; returns `None` when the option/shape
/// combination is not actually handled natively
pub type NativeRecodeFactory =
    fn(&Options, &Options, &FrameProperties) -> Option<Box<dyn NativeRecode>>;

/// Table of codec-native recodes keyed by `(in, out)` encoding names
pub struct NativeRecodeTable {
    entries: HashMap<(&'static str, &'static str), NativeRecodeFactory>,
}

impl NativeRecodeTable {
    /// Table with the builtin entries
    pub fn builtin() -> Self {
        let mut table = Self {
            entries: HashMap::new(),
        };
        table.register("raw", "raw", raw_order_swap);
        table
    }

    pub fn empty() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Register a factory for an encoding pair
    pub fn register(
        &mut self,
        input: &'static str,
        output: &'static str,
        factory: NativeRecodeFactory,
    ) {
        self.entries.insert((input, output), factory);
    }

    fn make(
        &self,
        input: &'static str,
        output: &'static str,
        in_opts: &Options,
        out_opts: &Options,
        props: &FrameProperties,
    ) -> Option<Box<dyn NativeRecode>> {
        let factory = self.entries.get(&(input, output))?;
        factory(in_opts, out_opts, props)
    }
}

/// Which variant a reencoder resolved to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReencoderKind {
    DirectCopy,
    CodecNative,
    DecodeEncode,
}

/// The adapter between a source's output and a stream's requested encoding
pub enum Reencoder {
    /// Source and stream share encoding and equivalent options
    DirectCopy,
    /// Registered `(in, out)` recode without a decode cycle
    CodecNative(Box<dyn NativeRecode>),
    /// Full decode then encode through an intermediate frame
    DecodeEncode {
        decoder: Box<dyn Decoder>,
        encoder: Box<dyn Encoder>,
    },
}

impl Reencoder {
    /// Build the best adapter for `(in, out, opts_in, opts_out, props)`
    ///
    /// Selection is deterministic: direct copy when the encodings match and
    /// options are equivalent, else a native recode when one is registered,
    /// else decode/encode.
    pub fn build(
        in_codec: &Arc<dyn Codec>,
        in_opts: &Options,
        out_codec: &Arc<dyn Codec>,
        out_opts: &Options,
        props: &FrameProperties,
        natives: &NativeRecodeTable,
    ) -> Result<Self> {
        if in_codec.name() == out_codec.name()
            && in_codec.flags().passthrough
            && in_codec.options_equivalent(in_opts, out_opts)
        {
            return Ok(Reencoder::DirectCopy);
        }

        if let Some(recode) =
            natives.make(in_codec.name(), out_codec.name(), in_opts, out_opts, props)
        {
            return Ok(Reencoder::CodecNative(recode));
        }

        Ok(Reencoder::DecodeEncode {
            decoder: in_codec.new_decoder(props, in_opts)?,
            encoder: out_codec.new_encoder(props, out_opts)?,
        })
    }

    pub fn kind(&self) -> ReencoderKind {
        match self {
            Reencoder::DirectCopy => ReencoderKind::DirectCopy,
            Reencoder::CodecNative(_) => ReencoderKind::CodecNative,
            Reencoder::DecodeEncode { .. } => ReencoderKind::DecodeEncode,
        }
    }

    /// Convert one input chunk, appending output bytes to `out`
    ///
    /// `boundary` marks the last chunk of an encoded source frame. Returns
    /// whether `out` now ends at a frame boundary in the output encoding.
    /// Codec-layer failures are local: bad input is discarded up to the next
    /// boundary and conversion continues with later chunks.
    pub fn reencode(&mut self, input: &[u8], boundary: bool, out: &mut Vec<u8>) -> Result<bool> {
        match self {
            Reencoder::DirectCopy => {
                out.extend_from_slice(input);
                Ok(boundary)
            }
            Reencoder::CodecNative(recode) => {
                recode.recode(input, boundary, out)?;
                Ok(boundary)
            }
            Reencoder::DecodeEncode { decoder, encoder } => {
                if let Err(e) = decoder.write_data(input) {
                    tracing::warn!(error = %e, "reencoder input rejected, awaiting boundary");
                    return Ok(false);
                }

                let mut encoded_frame = false;
                while decoder.frame_ready() {
                    match decoder.read_frame() {
                        Ok(frame) => {
                            encoder.encode(&frame)?;
                            encoded_frame = true;
                        }
                        Err(e) => {
                            // decoder has dropped the bad input itself
                            tracing::warn!(error = %e, "frame discarded during reencode");
                        }
                    }
                }

                let mut chunk = [0u8; 4096];
                loop {
                    let n = encoder.read_data(&mut chunk);
                    if n == 0 {
                        break;
                    }
                    out.extend_from_slice(&chunk[..n]);
                }

                Ok(encoded_frame && encoder.frame_boundary_after_drain())
            }
        }
    }
}

fn raw_order_swap(
    in_opts: &Options,
    out_opts: &Options,
    props: &FrameProperties,
) -> Option<Box<dyn NativeRecode>> {
    use crate::codec::raw::ChannelOrder;

    let from = ChannelOrder::from_options(in_opts).ok()?;
    let to = ChannelOrder::from_options(out_opts).ok()?;
    if from == to || props.channels != 3 {
        // equal orders are the direct-copy case; other shapes have no order
        return None;
    }
    Some(Box::new(RawOrderSwap {
        props: *props,
        carry: Vec::new(),
    }))
}

/// Raw-to-raw channel reorder, pixel-at-a-time, chunk-split safe
struct RawOrderSwap {
    props: FrameProperties,
    /// Bytes of a pixel split across chunk boundaries
    carry: Vec<u8>,
}

impl NativeRecode for RawOrderSwap {
    fn recode(&mut self, input: &[u8], boundary: bool, out: &mut Vec<u8>) -> Result<()> {
        let pixel = self.props.depth.byte_width() * self.props.channels as usize;

        self.carry.extend_from_slice(input);
        let whole = self.carry.len() - self.carry.len() % pixel;

        let start = out.len();
        out.extend_from_slice(&self.carry[..whole]);
        crate::codec::raw::swap_channels(&mut out[start..], &self.props);
        self.carry.drain(..whole);

        if boundary && !self.carry.is_empty() {
            tracing::warn!(
                left = self.carry.len(),
                "partial pixel at frame boundary, dropped"
            );
            self.carry.clear();
        }
        Ok(())
    }
}
