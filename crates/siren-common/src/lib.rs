//! Common types and utilities shared across the Siren protocol stack.
//!
//! This crate provides:
//! - Packet/payload serialization and stream framing ([`wire`])
//! - Sealed-box and Ed25519 cryptographic helpers ([`crypto`])
//! - User identifier parsing ([`uid`])
//! - Protocol type definitions and constants ([`types`])

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod crypto;
pub mod types;
pub mod uid;
pub mod wire;

pub use types::{AckCondition, ConnectionType, Pubkey};
pub use uid::Uid;
