use siren_common::wire::WireError;
use thiserror::Error;

/// Errors that can occur during server operation.
#[derive(Error, Debug)]
pub enum SirendError {
    /// Underlying socket I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Packet decoding failed; the peer was sent a terminating ack.
    #[error("wire error: {0}")]
    Wire(#[from] WireError),
    /// The connection was terminated, by the peer's goodbye or by local
    /// policy (federation refused, self-connect).
    #[error("connection closed")]
    ConnectionClosed,
    /// The server is at its configured connection capacity.
    #[error("connection limit reached")]
    ConnectionLimit,
}
