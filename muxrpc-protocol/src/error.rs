//! Protocol error types.

use thiserror::Error;

/// Protocol-level errors that can occur while encoding or decoding frames.
///
/// Any of these aborts the stream being decoded; the decoder makes no
/// attempt to resynchronize.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("non-positive frame length: {0}")]
    NonPositiveLength(i32),

    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: u32 },

    #[error("varint request id overflows 64 bits")]
    VarintOverflow,

    #[error("call frame is missing the signature terminator")]
    MissingTerminator,

    #[error("invalid call signature: {0:?}")]
    InvalidSignature(String),

    #[error("invalid service name: {0:?}")]
    InvalidServiceName(String),

    #[error("invalid method name: {0:?}")]
    InvalidMethodName(String),

    #[error("invalid response tag: {0}")]
    InvalidTag(u8),

    #[error("invalid UTF-8 in payload")]
    InvalidUtf8,

    #[error("response body must not be empty")]
    EmptyBody,
}
