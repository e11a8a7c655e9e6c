//! Frames and frame properties
//!
//! A frame is an uncompressed image: a shape descriptor plus packed pixel
//! data. The shape is pinned on a source by the first frame (or an explicit
//! `Source.setFrameProperties`) and every later frame must match it.

use bytes::Bytes;

use crate::error::{Error, ErrorCode, Result};

/// Pixel sample depth
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelDepth {
    U8,
    U16,
    F32,
}

impl PixelDepth {
    /// Bytes per sample
    pub fn byte_width(self) -> usize {
        match self {
            PixelDepth::U8 => 1,
            PixelDepth::U16 => 2,
            PixelDepth::F32 => 4,
        }
    }

    /// Wire integer (bits per sample)
    pub fn to_wire(self) -> u32 {
        match self {
            PixelDepth::U8 => 8,
            PixelDepth::U16 => 16,
            PixelDepth::F32 => 32,
        }
    }

    /// Decode the wire integer
    pub fn from_wire(bits: u32) -> Option<Self> {
        match bits {
            8 => Some(PixelDepth::U8),
            16 => Some(PixelDepth::U16),
            32 => Some(PixelDepth::F32),
            _ => None,
        }
    }
}

/// Immutable frame shape descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameProperties {
    pub width: u32,
    pub height: u32,
    pub depth: PixelDepth,
    pub channels: u8,
}

impl FrameProperties {
    pub fn new(width: u32, height: u32, depth: PixelDepth, channels: u8) -> Self {
        Self {
            width,
            height,
            depth,
            channels,
        }
    }

    /// Packed byte size of one frame with this shape
    pub fn frame_size(&self) -> usize {
        self.width as usize
            * self.height as usize
            * self.channels as usize
            * self.depth.byte_width()
    }

    /// Wire form: `"w,h,depth,channels"` as ASCII decimals
    pub fn to_wire(&self) -> String {
        format!(
            "{},{},{},{}",
            self.width,
            self.height,
            self.depth.to_wire(),
            self.channels
        )
    }

    /// Parse the wire form
    pub fn from_wire(s: &str) -> Result<Self> {
        let mut parts = s.split(',');
        let mut next = || -> Result<u32> {
            parts
                .next()
                .and_then(|p| p.trim().parse().ok())
                .ok_or(Error::Status(ErrorCode::ParseError))
        };

        let width = next()?;
        let height = next()?;
        let depth_bits = next()?;
        let channels = next()?;
        if parts.next().is_some() {
            return Err(Error::Status(ErrorCode::ParseError));
        }

        let depth =
            PixelDepth::from_wire(depth_bits).ok_or(Error::Status(ErrorCode::ParseError))?;
        if channels == 0 || channels > 4 || width == 0 || height == 0 {
            return Err(Error::Status(ErrorCode::InvalidArgument));
        }

        Ok(Self {
            width,
            height,
            depth,
            channels: channels as u8,
        })
    }
}

impl std::fmt::Display for FrameProperties {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}x{}x{}@{}bit",
            self.width,
            self.height,
            self.channels,
            self.depth.to_wire()
        )
    }
}

/// One uncompressed frame
///
/// Cheap to clone: pixel data is reference-counted `Bytes`.
#[derive(Debug, Clone)]
pub struct Frame {
    pub properties: FrameProperties,
    pub data: Bytes,
}

impl Frame {
    /// Wrap pixel data, checking it matches the shape
    pub fn new(properties: FrameProperties, data: Bytes) -> Result<Self> {
        if data.len() != properties.frame_size() {
            return Err(Error::Status(ErrorCode::InvalidArgument));
        }
        Ok(Self { properties, data })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_size() {
        let props = FrameProperties::new(640, 480, PixelDepth::U8, 3);
        assert_eq!(props.frame_size(), 640 * 480 * 3);

        let props = FrameProperties::new(320, 240, PixelDepth::U16, 1);
        assert_eq!(props.frame_size(), 320 * 240 * 2);
    }

    #[test]
    fn test_wire_roundtrip() {
        let props = FrameProperties::new(640, 480, PixelDepth::U8, 3);
        assert_eq!(props.to_wire(), "640,480,8,3");
        assert_eq!(FrameProperties::from_wire("640,480,8,3").unwrap(), props);
    }

    #[test]
    fn test_wire_rejects_garbage() {
        assert!(FrameProperties::from_wire("640,480,8").is_err());
        assert!(FrameProperties::from_wire("640,480,12,3").is_err());
        assert!(FrameProperties::from_wire("640,480,8,3,9").is_err());
        assert!(FrameProperties::from_wire("0,480,8,3").is_err());
        assert!(FrameProperties::from_wire("a,b,c,d").is_err());
    }

    #[test]
    fn test_frame_shape_check() {
        let props = FrameProperties::new(2, 2, PixelDepth::U8, 1);
        assert!(Frame::new(props, Bytes::from_static(&[0; 4])).is_ok());
        assert!(Frame::new(props, Bytes::from_static(&[0; 5])).is_err());
    }
}
