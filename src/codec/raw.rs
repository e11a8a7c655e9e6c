//! Raw (uncompressed) codec
//!
//! Frames pass through unmodified apart from optional channel reordering.
//! The `order` option selects `rgb` (canonical, default) or `bgr` for
//! 3-channel frames; other shapes ignore it.

use bytes::{Buf, BytesMut};

use crate::error::{Error, ErrorCode, Result};
use crate::frame::{Frame, FrameProperties};
use crate::options::Options;

use super::{Codec, Decoder, Encoder, EncodingFlags};

/// Channel order for 3-channel raw frames
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelOrder {
    Rgb,
    Bgr,
}

impl ChannelOrder {
    /// Read the `order` option, defaulting to `rgb`
    pub fn from_options(opts: &Options) -> Result<Self> {
        match opts.get("order") {
            None | Some("rgb") => Ok(ChannelOrder::Rgb),
            Some("bgr") => Ok(ChannelOrder::Bgr),
            Some(_) => Err(Error::Status(ErrorCode::InvalidArgument)),
        }
    }
}

/// Swap channels 0 and 2 of every pixel in place
///
/// Operates on whole samples, so it is depth-agnostic.
pub fn swap_channels(data: &mut [u8], props: &FrameProperties) {
    if props.channels != 3 {
        return;
    }
    let sample = props.depth.byte_width();
    let pixel = sample * 3;
    for px in data.chunks_exact_mut(pixel) {
        for i in 0..sample {
            px.swap(i, 2 * sample + i);
        }
    }
}

/// The `raw` encoding
pub struct RawCodec;

impl Codec for RawCodec {
    fn name(&self) -> &'static str {
        "raw"
    }

    fn flags(&self) -> EncodingFlags {
        EncodingFlags {
            passthrough: true,
            interframe: false,
            lossless: true,
        }
    }

    fn new_encoder(&self, props: &FrameProperties, opts: &Options) -> Result<Box<dyn Encoder>> {
        Ok(Box::new(RawEncoder {
            props: *props,
            order: ChannelOrder::from_options(opts)?,
            pending: BytesMut::new(),
        }))
    }

    fn new_decoder(&self, props: &FrameProperties, opts: &Options) -> Result<Box<dyn Decoder>> {
        Ok(Box::new(RawDecoder {
            props: *props,
            order: ChannelOrder::from_options(opts)?,
            pending: BytesMut::new(),
        }))
    }

    fn options_equivalent(&self, a: &Options, b: &Options) -> bool {
        match (ChannelOrder::from_options(a), ChannelOrder::from_options(b)) {
            (Ok(oa), Ok(ob)) => oa == ob,
            _ => false,
        }
    }
}

struct RawEncoder {
    props: FrameProperties,
    order: ChannelOrder,
    pending: BytesMut,
}

impl Encoder for RawEncoder {
    fn encode(&mut self, frame: &Frame) -> Result<()> {
        if frame.properties != self.props {
            return Err(Error::Status(ErrorCode::InvalidArgument));
        }
        match self.order {
            ChannelOrder::Rgb => self.pending.extend_from_slice(&frame.data),
            ChannelOrder::Bgr => {
                let start = self.pending.len();
                self.pending.extend_from_slice(&frame.data);
                swap_channels(&mut self.pending[start..], &self.props);
            }
        }
        Ok(())
    }

    fn data_ready(&self) -> usize {
        self.pending.len()
    }

    fn read_data(&mut self, buf: &mut [u8]) -> usize {
        let n = buf.len().min(self.pending.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.advance(n);
        n
    }
}

struct RawDecoder {
    props: FrameProperties,
    order: ChannelOrder,
    pending: BytesMut,
}

impl Decoder for RawDecoder {
    fn write_data(&mut self, data: &[u8]) -> Result<()> {
        self.pending.extend_from_slice(data);
        Ok(())
    }

    fn frame_ready(&self) -> bool {
        self.pending.len() >= self.props.frame_size()
    }

    fn read_frame(&mut self) -> Result<Frame> {
        let size = self.props.frame_size();
        if self.pending.len() < size {
            return Err(Error::Status(ErrorCode::InvalidState));
        }
        let mut data = self.pending.split_to(size);
        if self.order == ChannelOrder::Bgr {
            swap_channels(&mut data, &self.props);
        }
        Frame::new(self.props, data.freeze())
    }
}
