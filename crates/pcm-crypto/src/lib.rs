//! PCM Crypto - cryptographic building blocks for PrivaChain messaging.
//!
//! Everything in this crate is synchronous and free of I/O:
//! - Identity key pairs (X25519 for boxes, Ed25519 for signatures)
//! - The authenticated box primitive
//! - The double-layer message codec
//! - Hiding/binding commitments used as proofs of action
//! - The versioned JSON wire envelope
//! - Content sealing under a local master key
//! - Sequence counters and the replay window

#![forbid(unsafe_code)]

pub mod hash;
pub mod identity;
pub mod utils;

pub mod boxes;
pub mod codec;
pub mod commitment;
pub mod envelope;

pub mod content;
pub mod replay;

#[cfg(test)]
mod proptests;
