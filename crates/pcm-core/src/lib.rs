//! PCM Core - stateful messaging services for PrivaChain.
//!
//! This crate implements:
//! - Local identity management and persistence
//! - The contact directory
//! - Append-only conversation logs with delivery status
//! - Outbound/inbound delivery coordination over a pluggable transport
//! - Configuration and the persistence abstraction

#![forbid(unsafe_code)]

// Services
pub mod keys;
pub mod contacts;
pub mod conversation;
pub mod delivery;
pub mod messenger;

// Infrastructure
pub mod store;
pub mod transport;
pub mod config;

// Supporting modules
pub mod errors;
pub mod types;
pub mod harness;

pub use errors::CoreError;
pub use messenger::Messenger;
