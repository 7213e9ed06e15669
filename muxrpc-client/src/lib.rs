//! # muxrpc-client
//!
//! Client library for muxrpc.
//!
//! This crate provides:
//! - One long-lived connection carrying many concurrent calls
//! - Request id allocation and response matching
//! - Bounded outbound queue with write batching
//! - Per-call timeouts, and cancellation by dropping the call future

pub mod client;
pub mod connection;
pub mod error;

pub use client::Client;
pub use connection::{Connection, ConnectionConfig};
pub use error::ClientError;
