//! Core type definitions and protocol constants for Siren.

/// A 32-byte Curve25519 public key identifying a node or device.
pub type Pubkey = [u8; 32];

/// Wire protocol version carried in every packet envelope.
pub const PROTOCOL_VERSION: u32 = 1;

/// Default TCP port for Siren servers.
pub const DEFAULT_PORT: u16 = 9989;

/// DNS SRV service label used to locate a domain's Siren server
/// (`_siren._tcp.<domain>`).
pub const SRV_SERVICE: &str = "_siren._tcp";

/// Declared role of a connecting peer, carried in `HelloIAm`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionType {
    /// An end-user client talking to its home server.
    ClientToServer = 0,
    /// A peer server opening a federation link.
    ServerToServer = 1,
}

impl ConnectionType {
    /// Decodes a wire byte into a connection type.
    #[must_use]
    pub const fn from_wire(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Self::ClientToServer),
            1 => Some(Self::ServerToServer),
            _ => None,
        }
    }
}

/// Outcome condition carried in `Ack` payloads.
///
/// The numeric values are wire-visible and must not be reordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AckCondition {
    /// No error.
    Ok = 0,
    /// The sender is about to close the connection.
    Terminate = 1,
    /// The last payload was unrecognised or malformed.
    InvalidPacket = 2,
    /// The last payload type may only be sent encrypted.
    RequiresEncryption = 3,
}

impl AckCondition {
    /// Decodes a wire byte into an ack condition.
    #[must_use]
    pub const fn from_wire(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Self::Ok),
            1 => Some(Self::Terminate),
            2 => Some(Self::InvalidPacket),
            3 => Some(Self::RequiresEncryption),
            _ => None,
        }
    }
}

/// Formats a public key as lowercase hex for logging.
#[must_use]
pub fn fmt_key(key: &Pubkey) -> String {
    use std::fmt::Write;
    let mut out = String::with_capacity(64);
    for byte in key {
        let _ = write!(out, "{byte:02x}");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ack_conditions_keep_wire_order() {
        assert_eq!(AckCondition::Ok as u8, 0);
        assert_eq!(AckCondition::Terminate as u8, 1);
        assert_eq!(AckCondition::InvalidPacket as u8, 2);
        assert_eq!(AckCondition::RequiresEncryption as u8, 3);
    }

    #[test]
    fn ack_condition_round_trips_through_wire_byte() {
        for cond in [
            AckCondition::Ok,
            AckCondition::Terminate,
            AckCondition::InvalidPacket,
            AckCondition::RequiresEncryption,
        ] {
            assert_eq!(AckCondition::from_wire(cond as u8), Some(cond));
        }
        assert_eq!(AckCondition::from_wire(200), None);
    }

    #[test]
    fn connection_type_round_trips_through_wire_byte() {
        assert_eq!(
            ConnectionType::from_wire(0),
            Some(ConnectionType::ClientToServer)
        );
        assert_eq!(
            ConnectionType::from_wire(1),
            Some(ConnectionType::ServerToServer)
        );
        assert_eq!(ConnectionType::from_wire(7), None);
    }

    #[test]
    fn fmt_key_is_lowercase_hex() {
        let mut key = [0u8; 32];
        key[0] = 0xAB;
        key[31] = 0x01;
        let s = fmt_key(&key);
        assert_eq!(s.len(), 64);
        assert!(s.starts_with("ab"));
        assert!(s.ends_with("01"));
    }
}
