//! JPEG codec
//!
//! Backed by the `image` crate. Each pushed frame becomes one JFIF blob;
//! blobs are self-delimiting (SOI .. EOI), which is what the decoder uses to
//! split the byte stream back into frames. Only `U8` depth with 1 or 3
//! channels is representable.

use std::io::Cursor;

use bytes::{Buf, BytesMut};
use image::codecs::jpeg::{JpegDecoder as ImageJpegDecoder, JpegEncoder as ImageJpegEncoder};
use image::{ColorType, ExtendedColorType, ImageDecoder};

use crate::error::{Error, ErrorCode, Result};
use crate::frame::{Frame, FrameProperties, PixelDepth};
use crate::options::Options;

use super::{Codec, Decoder, Encoder, EncodingFlags};

const DEFAULT_QUALITY: u8 = 80;

const MARKER: u8 = 0xFF;
const EOI: u8 = 0xD9;

fn quality_from_options(opts: &Options) -> Result<u8> {
    match opts.get("q") {
        None => Ok(DEFAULT_QUALITY),
        Some(raw) => match raw.parse::<u8>() {
            Ok(q) if (1..=100).contains(&q) => Ok(q),
            _ => Err(Error::Status(ErrorCode::InvalidArgument)),
        },
    }
}

fn check_shape(props: &FrameProperties) -> Result<ExtendedColorType> {
    if props.depth != PixelDepth::U8 {
        return Err(Error::Status(ErrorCode::InvalidArgument));
    }
    match props.channels {
        1 => Ok(ExtendedColorType::L8),
        3 => Ok(ExtendedColorType::Rgb8),
        _ => Err(Error::Status(ErrorCode::InvalidArgument)),
    }
}

/// The `jpeg` encoding
pub struct JpegCodec;

impl Codec for JpegCodec {
    fn name(&self) -> &'static str {
        "jpeg"
    }

    fn flags(&self) -> EncodingFlags {
        EncodingFlags {
            passthrough: true,
            interframe: false,
            lossless: false,
        }
    }

    fn new_encoder(&self, props: &FrameProperties, opts: &Options) -> Result<Box<dyn Encoder>> {
        let color = check_shape(props)?;
        Ok(Box::new(JpegFrameEncoder {
            props: *props,
            color,
            quality: quality_from_options(opts)?,
            pending: BytesMut::new(),
        }))
    }

    fn new_decoder(&self, props: &FrameProperties, opts: &Options) -> Result<Box<dyn Decoder>> {
        check_shape(props)?;
        let _ = quality_from_options(opts)?;
        Ok(Box::new(JpegFrameDecoder {
            props: *props,
            pending: BytesMut::new(),
            scan_pos: 0,
            boundary: None,
        }))
    }

    fn options_equivalent(&self, a: &Options, b: &Options) -> bool {
        match (quality_from_options(a), quality_from_options(b)) {
            (Ok(qa), Ok(qb)) => qa == qb,
            _ => false,
        }
    }
}

struct JpegFrameEncoder {
    props: FrameProperties,
    color: ExtendedColorType,
    quality: u8,
    pending: BytesMut,
}

impl Encoder for JpegFrameEncoder {
    fn encode(&mut self, frame: &Frame) -> Result<()> {
        if frame.properties != self.props {
            return Err(Error::Status(ErrorCode::InvalidArgument));
        }

        let mut blob = Vec::new();
        ImageJpegEncoder::new_with_quality(&mut blob, self.quality)
            .encode(&frame.data, self.props.width, self.props.height, self.color)
            .map_err(|e| {
                tracing::warn!(error = %e, "jpeg encode failed");
                Error::Status(ErrorCode::Internal)
            })?;

        self.pending.extend_from_slice(&blob);
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

struct JpegFrameDecoder {
    props: FrameProperties,
    pending: BytesMut,
    /// Resume offset for the EOI scan, so repeated polls stay linear
    scan_pos: usize,
    /// End offset (exclusive) of the first complete blob, once found
    boundary: Option<usize>,
}

impl JpegFrameDecoder {
    fn locate_boundary(&mut self) {
        if self.boundary.is_some() {
            return;
        }
        let data = &self.pending[..];
        let mut i = self.scan_pos;
        while i + 1 < data.len() {
            if data[i] == MARKER && data[i + 1] == EOI {
                self.boundary = Some(i + 2);
                return;
            }
            i += 1;
        }
        self.scan_pos = data.len().saturating_sub(1);
    }

    fn decode_blob(&self, blob: &[u8]) -> Result<Frame> {
        let desync = |detail: &str| {
            tracing::warn!(
                shape = %self.props,
                detail,
                "jpeg decode desync, blob dropped"
            );
            Error::Status(ErrorCode::InvalidArgument)
        };

        let decoder =
            ImageJpegDecoder::new(Cursor::new(blob)).map_err(|_| desync("bad header"))?;

        let (width, height) = decoder.dimensions();
        let color = decoder.color_type();
        let expected_color = match self.props.channels {
            1 => ColorType::L8,
            _ => ColorType::Rgb8,
        };
        if width != self.props.width || height != self.props.height || color != expected_color {
            return Err(desync("shape mismatch"));
        }

        let mut pixels = vec![0u8; decoder.total_bytes() as usize];
        decoder
            .read_image(&mut pixels)
            .map_err(|_| desync("bad entropy data"))?;

        Frame::new(self.props, pixels.into())
    }
}

impl Decoder for JpegFrameDecoder {
    fn write_data(&mut self, data: &[u8]) -> Result<()> {
        self.pending.extend_from_slice(data);
        Ok(())
    }

    fn frame_ready(&self) -> bool {
        self.boundary.is_some() || {
            let data = &self.pending[..];
            let mut i = self.scan_pos;
            while i + 1 < data.len() {
                if data[i] == MARKER && data[i + 1] == EOI {
                    return true;
                }
                i += 1;
            }
            false
        }
    }

    fn read_frame(&mut self) -> Result<Frame> {
        self.locate_boundary();
        let end = self
            .boundary
            .take()
            .ok_or(Error::Status(ErrorCode::InvalidState))?;

        let blob = self.pending.split_to(end);
        self.scan_pos = 0;
        self.decode_blob(&blob)
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;

    fn props() -> FrameProperties {
        FrameProperties::new(16, 8, PixelDepth::U8, 3)
    }

    fn gradient_frame() -> Frame {
        let p = props();
        let mut data = Vec::with_capacity(p.frame_size());
        for y in 0..p.height {
            for x in 0..p.width {
                data.push((x * 16) as u8);
                data.push((y * 32) as u8);
                data.push(128);
            }
        }
        Frame::new(p, Bytes::from(data)).unwrap()
    }

    fn engines() -> (Box<dyn Encoder>, Box<dyn Decoder>) {
        let opts = Options::parse("jpeg:q=90").unwrap();
        let enc = JpegCodec.new_encoder(&props(), &opts).unwrap();
        let dec = JpegCodec.new_decoder(&props(), &opts).unwrap();
        (enc, dec)
    }

    #[test]
    fn test_encode_emits_jfif_blob() {
        let (mut enc, _) = engines();
        enc.encode(&gradient_frame()).unwrap();

        let mut blob = vec![0u8; enc.data_ready()];
        enc.read_data(&mut blob);
        assert_eq!(&blob[..2], &[0xFF, 0xD8]);
        assert_eq!(&blob[blob.len() - 2..], &[0xFF, 0xD9]);
        assert_eq!(enc.data_ready(), 0);
    }

    #[test]
    fn test_roundtrip_shape() {
        let (mut enc, mut dec) = engines();
        enc.encode(&gradient_frame()).unwrap();

        // feed the decoder in small chunks, as the wire would
        let mut chunk = [0u8; 64];
        loop {
            let n = enc.read_data(&mut chunk);
            if n == 0 {
                break;
            }
            dec.write_data(&chunk[..n]).unwrap();
        }

        assert!(dec.frame_ready());
        let decoded = dec.read_frame().unwrap();
        assert_eq!(decoded.properties, props());
        assert_eq!(decoded.data.len(), props().frame_size());
        assert!(!dec.frame_ready());
    }

    #[test]
    fn test_two_frames_split_at_eoi() {
        let (mut enc, mut dec) = engines();
        enc.encode(&gradient_frame()).unwrap();
        enc.encode(&gradient_frame()).unwrap();

        let mut all = vec![0u8; enc.data_ready()];
        enc.read_data(&mut all);
        dec.write_data(&all).unwrap();

        assert!(dec.frame_ready());
        dec.read_frame().unwrap();
        assert!(dec.frame_ready());
        dec.read_frame().unwrap();
        assert!(!dec.frame_ready());
    }

    #[test]
    fn test_bad_blob_is_dropped() {
        let (_, mut dec) = engines();
        // garbage ending in an EOI marker
        dec.write_data(&[0x00, 0x01, 0x02, 0xFF, 0xD9]).unwrap();
        assert!(dec.frame_ready());
        assert!(dec.read_frame().is_err());
        // the bad blob was consumed; the decoder is resynchronized
        assert!(!dec.frame_ready());
    }

    #[test]
    fn test_unsupported_shapes_rejected() {
        let opts = Options::parse("jpeg").unwrap();
        let u16_props = FrameProperties::new(4, 4, PixelDepth::U16, 3);
        assert!(JpegCodec.new_encoder(&u16_props, &opts).is_err());

        let four_chan = FrameProperties::new(4, 4, PixelDepth::U8, 4);
        assert!(JpegCodec.new_encoder(&four_chan, &opts).is_err());
    }

    #[test]
    fn test_quality_option() {
        let opts = Options::parse("jpeg:q=101").unwrap();
        assert!(JpegCodec.new_encoder(&props(), &opts).is_err());
        assert!(!JpegCodec.options_equivalent(
            &Options::parse("jpeg:q=80").unwrap(),
            &Options::parse("jpeg:q=90").unwrap()
        ));
        assert!(JpegCodec.options_equivalent(
            &Options::parse("jpeg").unwrap(),
            &Options::parse("jpeg:q=80").unwrap()
        ));
    }
}
