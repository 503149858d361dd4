//! Interactive Siren test client library.
#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Client keypair persistence.
pub mod keys;
/// Client-side connection session.
pub mod session;
