//! # muxrpc-protocol
//!
//! Wire protocol implementation for muxrpc.
//!
//! This crate provides:
//! - Zig-zag varint encoding of request ids
//! - Call and Response frame encoding/decoding
//! - Incremental decoding over a growable byte buffer
//! - Signature (`service.method`) parsing and validation

pub mod codec;
pub mod error;
pub mod frame;
pub mod message;
pub mod varint;

pub use codec::{Decoder, Encoder};
pub use error::ProtocolError;
pub use frame::{Frame, ResponseTag, LENGTH_PREFIX_SIZE};
pub use message::{parse_signature, validate_method_name, validate_service_name, Call, Response};

/// Default port for a muxrpc server.
pub const DEFAULT_PORT: u16 = 7450;

/// Maximum frame body size (16 MiB).
pub const MAX_PAYLOAD_SIZE: u32 = 16 * 1024 * 1024;

/// Separator between service and method names in a call signature.
pub const SIGNATURE_SEPARATOR: char = '.';
