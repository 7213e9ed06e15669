//! Binary frame formats for calls and responses.
//!
//! Call frame:
//!
//! ```text
//! +---------+-------------+-------------------------+------+-------+
//! | req-id  | body_len    | service '.' method      | \0   | param |
//! | varint  | i32 LE      | ...                     | 1    | ...   |
//! +---------+-------------+-------------------------+------+-------+
//! ```
//!
//! Response frame:
//!
//! ```text
//! +---------+--------+-------------+---------------------------------+
//! | req-id  | tag    | body_len    | body                            |
//! | varint  | u8     | i32 LE      | error message or result bytes   |
//! +---------+--------+-------------+---------------------------------+
//! ```
//!
//! `body_len` counts every byte after the length field and must be
//! positive.

use crate::error::ProtocolError;
use crate::message::{validate_method_name, validate_service_name, Call, Response};
use crate::varint::{decode_varint, put_varint, varint_len};
use crate::{MAX_PAYLOAD_SIZE, SIGNATURE_SEPARATOR};
use bytes::{Buf, BufMut, BytesMut};

/// Size of the body length field in bytes.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Discriminant byte of a response frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ResponseTag {
    Failure = 0,
    Success = 1,
}

impl TryFrom<u8> for ResponseTag {
    type Error = ProtocolError;

    fn try_from(byte: u8) -> Result<Self, ProtocolError> {
        match byte {
            0 => Ok(ResponseTag::Failure),
            1 => Ok(ResponseTag::Success),
            other => Err(ProtocolError::InvalidTag(other)),
        }
    }
}

/// A message with a binary frame representation.
pub trait Frame: Sized {
    /// Encodes the message into a complete frame.
    fn encode(&self) -> Result<BytesMut, ProtocolError>;

    /// Decodes one frame from the front of `buf`.
    ///
    /// Returns `Ok(Some(msg))` and consumes the frame if it is complete,
    /// `Ok(None)` without consuming anything if more data is needed, or
    /// `Err` on protocol errors.
    fn decode(buf: &mut BytesMut) -> Result<Option<Self>, ProtocolError>;
}

fn check_body_len(len: usize) -> Result<i32, ProtocolError> {
    if len > MAX_PAYLOAD_SIZE as usize {
        return Err(ProtocolError::FrameTooLarge {
            size: len,
            max: MAX_PAYLOAD_SIZE,
        });
    }
    Ok(len as i32)
}

/// Reads and validates the body length at the start of `buf`.
fn peek_body_len(buf: &[u8]) -> Result<Option<usize>, ProtocolError> {
    if buf.len() < LENGTH_PREFIX_SIZE {
        return Ok(None);
    }
    let len = i32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
    if len <= 0 {
        return Err(ProtocolError::NonPositiveLength(len));
    }
    if len as u32 > MAX_PAYLOAD_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            size: len as usize,
            max: MAX_PAYLOAD_SIZE,
        });
    }
    Ok(Some(len as usize))
}

impl Frame for Call {
    fn encode(&self) -> Result<BytesMut, ProtocolError> {
        validate_service_name(&self.service)?;
        validate_method_name(&self.method)?;

        let body_len = self.service.len() + 1 + self.method.len() + 1 + self.param.len();
        let len_field = check_body_len(body_len)?;

        let mut buf = BytesMut::with_capacity(varint_len(self.id) + LENGTH_PREFIX_SIZE + body_len);
        put_varint(&mut buf, self.id);
        buf.put_i32_le(len_field);
        buf.put_slice(self.service.as_bytes());
        buf.put_u8(SIGNATURE_SEPARATOR as u8);
        buf.put_slice(self.method.as_bytes());
        buf.put_u8(0);
        buf.put_slice(&self.param);

        Ok(buf)
    }

    fn decode(buf: &mut BytesMut) -> Result<Option<Self>, ProtocolError> {
        let Some((id, id_len)) = decode_varint(buf)? else {
            return Ok(None);
        };
        let Some(body_len) = peek_body_len(&buf[id_len..])? else {
            return Ok(None);
        };

        let header_len = id_len + LENGTH_PREFIX_SIZE;
        if buf.len() < header_len + body_len {
            return Ok(None);
        }

        buf.advance(header_len);
        let body = buf.split_to(body_len).freeze();

        let nul = body
            .iter()
            .position(|&b| b == 0)
            .ok_or(ProtocolError::MissingTerminator)?;
        let signature =
            std::str::from_utf8(&body[..nul]).map_err(|_| ProtocolError::InvalidUtf8)?;
        let (service, method) = crate::message::parse_signature(signature)?;

        Ok(Some(Call {
            id,
            service: service.to_string(),
            method: method.to_string(),
            param: body.slice(nul + 1..),
        }))
    }
}

impl Frame for Response {
    fn encode(&self) -> Result<BytesMut, ProtocolError> {
        let (tag, body): (ResponseTag, &[u8]) = match &self.outcome {
            Ok(result) => (ResponseTag::Success, &result[..]),
            Err(message) => (ResponseTag::Failure, message.as_bytes()),
        };
        if body.is_empty() {
            return Err(ProtocolError::EmptyBody);
        }
        let len_field = check_body_len(body.len())?;

        let mut buf = BytesMut::with_capacity(varint_len(self.id) + 1 + LENGTH_PREFIX_SIZE + body.len());
        put_varint(&mut buf, self.id);
        buf.put_u8(tag as u8);
        buf.put_i32_le(len_field);
        buf.put_slice(body);

        Ok(buf)
    }

    fn decode(buf: &mut BytesMut) -> Result<Option<Self>, ProtocolError> {
        let Some((id, id_len)) = decode_varint(buf)? else {
            return Ok(None);
        };
        let Some(&tag_byte) = buf.get(id_len) else {
            return Ok(None);
        };
        let tag = ResponseTag::try_from(tag_byte)?;
        let Some(body_len) = peek_body_len(&buf[id_len + 1..])? else {
            return Ok(None);
        };

        let header_len = id_len + 1 + LENGTH_PREFIX_SIZE;
        if buf.len() < header_len + body_len {
            return Ok(None);
        }

        buf.advance(header_len);
        let body = buf.split_to(body_len).freeze();

        let outcome = match tag {
            ResponseTag::Success => Ok(body),
            ResponseTag::Failure => Err(String::from_utf8(body.to_vec())
                .map_err(|_| ProtocolError::InvalidUtf8)?),
        };

        Ok(Some(Response { id, outcome }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use proptest::prelude::*;

    #[test]
    fn test_call_layout() {
        let call = Call::new(1, "a", "b", Bytes::from_static(b"xy")).unwrap();
        let encoded = call.encode().unwrap();
        // id 1 -> zig-zag 2, body "a.b\0xy" is 6 bytes.
        assert_eq!(&encoded[..], b"\x02\x06\x00\x00\x00a.b\x00xy");
    }

    #[test]
    fn test_response_layout() {
        let encoded = Response::success(-1, "ok").encode().unwrap();
        assert_eq!(&encoded[..], b"\x01\x01\x02\x00\x00\x00ok");

        let encoded = Response::failure(0, "no").encode().unwrap();
        assert_eq!(&encoded[..], b"\x00\x00\x02\x00\x00\x00no");
    }

    #[test]
    fn test_call_roundtrip() {
        let call = Call::new(1024, "a", "a", Bytes::from_static(b"111")).unwrap();
        let mut buf = call.encode().unwrap();
        let decoded = Call::decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, call);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_call_with_empty_param() {
        let call = Call::new(5, "svc", "ping", Bytes::new()).unwrap();
        let mut buf = call.encode().unwrap();
        let decoded = Call::decode(&mut buf).unwrap().unwrap();
        assert!(decoded.param.is_empty());
        assert_eq!(decoded.method, "ping");
    }

    #[test]
    fn test_call_method_keeps_extra_dots() {
        let call = Call::new(9, "svc", "v2.get", Bytes::from_static(b"p")).unwrap();
        let mut buf = call.encode().unwrap();
        let decoded = Call::decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.service, "svc");
        assert_eq!(decoded.method, "v2.get");
    }

    #[test]
    fn test_param_may_contain_nul() {
        let call = Call::new(2, "svc", "m", Bytes::from_static(b"\0a\0")).unwrap();
        let mut buf = call.encode().unwrap();
        let decoded = Call::decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.param, Bytes::from_static(b"\0a\0"));
    }

    #[test]
    fn test_incomplete_frames_consume_nothing() {
        let call = Call::new(77, "hello", "echo", Bytes::from_static(b"42")).unwrap();
        let encoded = call.encode().unwrap();
        for cut in 0..encoded.len() {
            let mut buf = BytesMut::from(&encoded[..cut]);
            assert!(Call::decode(&mut buf).unwrap().is_none(), "cut at {cut}");
            assert_eq!(buf.len(), cut);
        }

        let encoded = Response::failure(77, "nope").encode().unwrap();
        for cut in 0..encoded.len() {
            let mut buf = BytesMut::from(&encoded[..cut]);
            assert!(Response::decode(&mut buf).unwrap().is_none(), "cut at {cut}");
            assert_eq!(buf.len(), cut);
        }
    }

    #[test]
    fn test_non_positive_length_rejected() {
        let mut zero = BytesMut::from(&b"\x02\x00\x00\x00\x00"[..]);
        assert_eq!(
            Call::decode(&mut zero),
            Err(ProtocolError::NonPositiveLength(0))
        );

        let mut negative = BytesMut::from(&b"\x02\xff\xff\xff\xff"[..]);
        assert_eq!(
            Call::decode(&mut negative),
            Err(ProtocolError::NonPositiveLength(-1))
        );

        let mut response = BytesMut::from(&b"\x02\x01\x00\x00\x00\x00"[..]);
        assert_eq!(
            Response::decode(&mut response),
            Err(ProtocolError::NonPositiveLength(0))
        );
    }

    #[test]
    fn test_oversized_length_rejected() {
        let mut buf = BytesMut::new();
        put_varint(&mut buf, 1);
        buf.put_i32_le(MAX_PAYLOAD_SIZE as i32 + 1);
        assert!(matches!(
            Call::decode(&mut buf),
            Err(ProtocolError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn test_missing_terminator() {
        let mut buf = BytesMut::from(&b"\x02\x03\x00\x00\x00a.b"[..]);
        assert_eq!(Call::decode(&mut buf), Err(ProtocolError::MissingTerminator));
    }

    #[test]
    fn test_signature_without_separator() {
        let mut buf = BytesMut::from(&b"\x02\x04\x00\x00\x00abc\x00"[..]);
        assert!(matches!(
            Call::decode(&mut buf),
            Err(ProtocolError::InvalidSignature(_))
        ));
    }

    #[test]
    fn test_invalid_tag() {
        let mut buf = BytesMut::from(&b"\x02\x05\x01\x00\x00\x00x"[..]);
        assert_eq!(Response::decode(&mut buf), Err(ProtocolError::InvalidTag(5)));
    }

    #[test]
    fn test_error_body_must_be_utf8() {
        let mut buf = BytesMut::from(&b"\x02\x00\x01\x00\x00\x00\xff"[..]);
        assert_eq!(Response::decode(&mut buf), Err(ProtocolError::InvalidUtf8));
    }

    #[test]
    fn test_empty_response_body_not_encodable() {
        assert_eq!(
            Response::success(1, Bytes::new()).encode(),
            Err(ProtocolError::EmptyBody)
        );
        assert_eq!(
            Response::failure(1, "").encode(),
            Err(ProtocolError::EmptyBody)
        );
    }

    #[test]
    fn test_encode_rejects_invalid_names() {
        let call = Call {
            id: 1,
            service: "a.b".to_string(),
            method: "m".to_string(),
            param: Bytes::new(),
        };
        assert!(matches!(
            call.encode(),
            Err(ProtocolError::InvalidServiceName(_))
        ));
    }

    #[test]
    fn test_multiple_frames_in_buffer() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&Response::success(1, "one").encode().unwrap());
        buf.extend_from_slice(&Response::failure(2, "two").encode().unwrap());

        let first = Response::decode(&mut buf).unwrap().unwrap();
        assert_eq!(first, Response::success(1, "one"));
        let second = Response::decode(&mut buf).unwrap().unwrap();
        assert_eq!(second, Response::failure(2, "two"));
        assert!(Response::decode(&mut buf).unwrap().is_none());
    }

    proptest! {
        #[test]
        fn prop_call_roundtrip(
            id in any::<i64>(),
            service in "[a-zA-Z0-9_]{1,16}",
            method in "[a-zA-Z0-9_]{1,16}",
            param in proptest::collection::vec(any::<u8>(), 0..256),
        ) {
            let call = Call::new(id, service, method, param).unwrap();
            let mut buf = call.encode().unwrap();
            let decoded = Call::decode(&mut buf).unwrap().unwrap();
            prop_assert_eq!(decoded, call);
            prop_assert!(buf.is_empty());
        }

        #[test]
        fn prop_response_roundtrip(
            id in any::<i64>(),
            success in any::<bool>(),
            result in proptest::collection::vec(any::<u8>(), 1..256),
            message in "[a-zA-Z0-9 :_-]{1,64}",
        ) {
            let response = if success {
                Response::success(id, result)
            } else {
                Response::failure(id, message)
            };
            let mut buf = response.encode().unwrap();
            let decoded = Response::decode(&mut buf).unwrap().unwrap();
            prop_assert_eq!(decoded, response);
        }
    }
}
