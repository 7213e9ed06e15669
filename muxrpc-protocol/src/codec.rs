//! Encoder and decoder for muxrpc frames.

use crate::error::ProtocolError;
use crate::frame::Frame;
use crate::message::{Call, Response};
use bytes::{Bytes, BytesMut};

/// Encodes calls and responses into frames.
pub struct Encoder;

impl Encoder {
    /// Encodes a call into a frame.
    pub fn encode_call(call: &Call) -> Result<BytesMut, ProtocolError> {
        call.encode()
    }

    /// Encodes a response into a frame.
    pub fn encode_response(response: &Response) -> Result<BytesMut, ProtocolError> {
        response.encode()
    }
}

/// Incremental frame decoder.
///
/// Bytes read from any source are appended with [`Decoder::extend`];
/// complete frames are then pulled off the front of the buffer.
pub struct Decoder {
    buffer: BytesMut,
}

impl Decoder {
    pub fn new() -> Self {
        Self::with_capacity(8192)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(capacity),
        }
    }

    /// Appends data to the internal buffer.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Appends bytes to the internal buffer.
    pub fn extend_bytes(&mut self, data: Bytes) {
        self.buffer.extend_from_slice(&data);
    }

    /// Attempts to decode the next frame of type `T` from the buffer.
    pub fn decode<T: Frame>(&mut self) -> Result<Option<T>, ProtocolError> {
        T::decode(&mut self.buffer)
    }

    /// Attempts to decode the next call from the buffer.
    pub fn decode_call(&mut self) -> Result<Option<Call>, ProtocolError> {
        self.decode()
    }

    /// Attempts to decode the next response from the buffer.
    pub fn decode_response(&mut self) -> Result<Option<Response>, ProtocolError> {
        self.decode()
    }

    /// Returns the number of bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Returns whether a partial frame is sitting in the buffer.
    ///
    /// Only meaningful after decoding has returned `None`.
    pub fn has_partial_frame(&self) -> bool {
        !self.buffer.is_empty()
    }

    /// Clears the internal buffer.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}
