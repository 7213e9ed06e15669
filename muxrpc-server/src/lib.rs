//! # muxrpc-server
//!
//! TCP server for muxrpc.
//!
//! This crate provides:
//! - A service registry that can be updated while connections are live
//! - Per-connection reader/dispatcher and writer tasks
//! - Concurrent, callback-driven handler execution with a per-connection
//!   in-flight bound
//! - YAML and environment configuration

pub mod config;
pub mod error;
pub mod handler;
pub mod registry;
pub mod server;

pub use config::{Config, ConfigError, DispatchConfig, NetworkConfig, OverloadPolicy};
pub use error::ServerError;
pub use handler::{Callback, Handler, DROPPED_CALLBACK_MESSAGE};
pub use registry::ServiceRegistry;
pub use server::{Server, ServerConfig, ServerStats, OVERLOADED_MESSAGE};
