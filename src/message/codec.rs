//! Wire codec
//!
//! Messages are TLV frames on a reliable byte stream, little-endian:
//!
//! ```text
//! u32 total_len      length of everything after this field
//! u16 n_components
//! u32 request_id
//! u8  flags          bit0 = is_response, bit1 = frame boundary
//! n_components x { u32 len, bytes }
//! u32 payload_len, payload bytes
//! ```
//!
//! A `total_len` above 16 MiB is a protocol violation; the connection is
//! closed.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};

use super::Message;

/// Hard cap on `total_len`; larger values close the connection
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

const FLAG_RESPONSE: u8 = 0x01;
const FLAG_BOUNDARY: u8 = 0x02;

/// Append the wire form of `msg` to `dst`
pub fn encode(msg: &Message, dst: &mut BytesMut) {
    let body_len = body_len(msg);
    debug_assert!(body_len <= MAX_MESSAGE_SIZE);

    dst.reserve(4 + body_len);
    dst.put_u32_le(body_len as u32);
    dst.put_u16_le(msg.components.len() as u16);
    dst.put_u32_le(msg.request_id);

    let mut flags = 0u8;
    if msg.is_response {
        flags |= FLAG_RESPONSE;
    }
    if msg.frame_boundary {
        flags |= FLAG_BOUNDARY;
    }
    dst.put_u8(flags);

    for component in &msg.components {
        dst.put_u32_le(component.len() as u32);
        dst.put_slice(component.as_bytes());
    }

    dst.put_u32_le(msg.payload.len() as u32);
    dst.put_slice(&msg.payload);
}

/// Wire size of a message body (everything after `total_len`)
pub fn body_len(msg: &Message) -> usize {
    let components: usize = msg.components.iter().map(|c| 4 + c.len()).sum();
    2 + 4 + 1 + components + 4 + msg.payload.len()
}

/// Try to decode one message from the front of `src`
///
/// Returns `Ok(None)` when `src` does not yet hold a complete message;
/// consumed bytes are removed from `src` only on a full decode. Errors are
/// fatal to the connection.
pub fn decode(src: &mut BytesMut) -> Result<Option<Message>> {
    if src.len() < 4 {
        return Ok(None);
    }

    let total_len = u32::from_le_bytes([src[0], src[1], src[2], src[3]]) as usize;
    if total_len > MAX_MESSAGE_SIZE {
        return Err(Error::Wire(format!("message of {} bytes exceeds cap", total_len)));
    }
    if src.len() < 4 + total_len {
        return Ok(None);
    }

    src.advance(4);
    let mut body = src.split_to(total_len);
    parse_body(&mut body).map(Some)
}

fn parse_body(body: &mut BytesMut) -> Result<Message> {
    if body.len() < 2 + 4 + 1 {
        return Err(Error::Wire("truncated header".into()));
    }
    let n_components = body.get_u16_le() as usize;
    let request_id = body.get_u32_le();
    let flags = body.get_u8();

    let mut components = Vec::with_capacity(n_components);
    for _ in 0..n_components {
        if body.len() < 4 {
            return Err(Error::Wire("truncated component length".into()));
        }
        let len = body.get_u32_le() as usize;
        if body.len() < len {
            return Err(Error::Wire("truncated component".into()));
        }
        let raw = body.split_to(len);
        let text = std::str::from_utf8(&raw)
            .map_err(|_| Error::Wire("component is not UTF-8".into()))?;
        components.push(text.to_string());
    }

    if body.len() < 4 {
        return Err(Error::Wire("truncated payload length".into()));
    }
    let payload_len = body.get_u32_le() as usize;
    if body.len() != payload_len {
        return Err(Error::Wire("payload length mismatch".into()));
    }
    let payload: Bytes = body.split_to(payload_len).freeze();

    Ok(Message {
        components,
        payload,
        request_id,
        is_response: flags & FLAG_RESPONSE != 0,
        frame_boundary: flags & FLAG_BOUNDARY != 0,
    })
}

#[cfg(test)]
mod tests {
    use crate::error::ErrorCode;

    use super::*;

    fn roundtrip(msg: &Message) -> Message {
        let mut buf = BytesMut::new();
        encode(msg, &mut buf);
        let decoded = decode(&mut buf).unwrap().unwrap();
        assert!(buf.is_empty());
        decoded
    }

    #[test]
    fn test_roundtrip_request() {
        let msg = Message::request(["Source.open", "client", "cam"]);
        assert_eq!(roundtrip(&msg), msg);
    }

    #[test]
    fn test_roundtrip_data_with_boundary() {
        let msg = Message::data("cam", Bytes::from_static(b"\x01\x02\x03"), true);
        let decoded = roundtrip(&msg);
        assert!(decoded.frame_boundary);
        assert_eq!(decoded.payload, Bytes::from_static(b"\x01\x02\x03"));
    }

    #[test]
    fn test_roundtrip_response() {
        let mut msg = Message::response(7, ErrorCode::Success).with_component("c:cam");
        msg.request_id = 7;
        let decoded = roundtrip(&msg);
        assert!(decoded.is_response);
        assert_eq!(decoded.request_id, 7);
    }

    #[test]
    fn test_partial_input_yields_none() {
        let msg = Message::request(["Source.getSourcesList"]);
        let mut buf = BytesMut::new();
        encode(&msg, &mut buf);

        let full = buf.clone();
        for cut in 0..full.len() {
            let mut partial = BytesMut::from(&full[..cut]);
            assert!(decode(&mut partial).unwrap().is_none(), "cut at {}", cut);
        }
    }

    #[test]
    fn test_two_messages_back_to_back() {
        let a = Message::request(["Stream.pause", "3"]);
        let b = Message::data("4", Bytes::from_static(b"zz"), false);
        let mut buf = BytesMut::new();
        encode(&a, &mut buf);
        encode(&b, &mut buf);

        assert_eq!(decode(&mut buf).unwrap().unwrap(), a);
        assert_eq!(decode(&mut buf).unwrap().unwrap(), b);
        assert!(decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_oversize_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32_le((MAX_MESSAGE_SIZE + 1) as u32);
        buf.put_slice(&[0; 16]);
        assert!(decode(&mut buf).is_err());
    }

    #[test]
    fn test_non_utf8_component_rejected() {
        let msg = Message::request(["Data", "cam"]);
        let mut buf = BytesMut::new();
        encode(&msg, &mut buf);
        // corrupt the first byte of the verb ("Data" starts at offset 4+7+4)
        buf[15] = 0xFF;
        assert!(decode(&mut buf).is_err());
    }
}
