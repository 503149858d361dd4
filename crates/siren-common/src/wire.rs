//! Siren binary packet serialization, parsing, and stream framing.
//!
//! Every frame on the wire is a `Packet` envelope carrying either a plaintext
//! `Payload` or an opaque encrypted payload (`nonce ‖ ciphertext` of an
//! encoded `Payload`). On TCP, each encoded packet is preceded by a 4-byte
//! big-endian length prefix.

use crate::types::{AckCondition, ConnectionType, Pubkey, PROTOCOL_VERSION};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Envelope body type: plaintext payload follows.
pub const BODY_PLAIN: u8 = 0x01;
/// Envelope body type: encrypted payload follows.
pub const BODY_ENCRYPTED: u8 = 0x02;

/// HELLO-I-AM payload tag: handshake introduction.
pub const TAG_HELLO_I_AM: u8 = 0x01;
/// PING payload tag: keepalive request.
pub const TAG_PING: u8 = 0x02;
/// PONG payload tag: keepalive response.
pub const TAG_PONG: u8 = 0x03;
/// ACK payload tag: condition notification.
pub const TAG_ACK: u8 = 0x04;
/// DIRECTORY-REQUEST payload tag: user key lookup.
pub const TAG_DIRECTORY_REQUEST: u8 = 0x05;
/// DIRECTORY-RESPONSE payload tag: user key lookup answer.
pub const TAG_DIRECTORY_RESPONSE: u8 = 0x06;

/// A decoded Siren protocol payload.
///
/// Variants map 1:1 to wire payload tags defined by the `TAG_*` constants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// Handshake introduction carrying the sender's role and public key.
    HelloIAm {
        /// Declared connection role.
        conn_type: ConnectionType,
        /// Sender's long-lived Curve25519 public key.
        public_key: Pubkey,
    },
    /// Keepalive request.
    Ping {
        /// Monotonic ping sequence number.
        seq: i64,
    },
    /// Keepalive response echoing the ping sequence.
    Pong {
        /// Sequence number of the ping being answered.
        seq: i64,
    },
    /// Condition notification.
    Ack {
        /// Outcome condition.
        condition: AckCondition,
        /// Human-readable detail.
        text: String,
    },
    /// User key lookup for a `local@domain` identifier.
    DirectoryRequest {
        /// Identifier being looked up.
        uid: String,
    },
    /// Answer to a directory request.
    DirectoryResponse {
        /// Identifier the answer refers to.
        uid: String,
        /// User signing key, empty when unknown.
        user_signing_key: Vec<u8>,
        /// Device encryption keys, empty when unknown.
        device_encryption_keys: Vec<Vec<u8>>,
    },
}

/// A decoded packet envelope body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PacketBody {
    /// Plaintext payload.
    Plain(Payload),
    /// Sealed payload: 24-byte nonce followed by the ciphertext of an
    /// encoded [`Payload`].
    Encrypted(Vec<u8>),
}

/// The framed envelope exchanged on every Siren connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Protocol version, currently always [`PROTOCOL_VERSION`].
    pub version: u32,
    /// Plain or encrypted body.
    pub body: PacketBody,
}

/// Errors that can occur during packet encoding or decoding.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    /// The input byte slice was empty.
    #[error("packet is empty")]
    Empty,
    /// The input is too short for the declared shape.
    #[error("packet too short: expected at least {expected} bytes, got {actual}")]
    TooShort {
        /// Minimum expected byte count.
        expected: usize,
        /// Actual byte count received.
        actual: usize,
    },
    /// The envelope version is not one this node speaks.
    #[error("unsupported protocol version {0}")]
    UnknownVersion(u32),
    /// The envelope carried neither a plaintext nor an encrypted body.
    #[error("unknown payload type {0:#04x}")]
    UnknownBody(u8),
    /// The payload tag is not one this node recognises.
    #[error("unknown payload tag {0:#04x}")]
    UnknownTag(u8),
    /// A connection-type byte was out of range.
    #[error("invalid connection type {0}")]
    BadConnectionType(u8),
    /// An ack-condition byte was out of range.
    #[error("invalid ack condition {0}")]
    BadAckCondition(u8),
    /// A string field did not contain valid UTF-8.
    #[error("string field is not valid UTF-8")]
    InvalidUtf8,
    /// A variable-length field exceeds its 16-bit length prefix.
    #[error("field '{0}' too long to encode")]
    FieldTooLong(&'static str),
    /// Bytes were left over after the payload was fully decoded.
    #[error("trailing bytes after payload")]
    TrailingBytes,
}

impl Payload {
    /// Creates a `HelloIAm` payload.
    #[must_use]
    pub const fn hello(conn_type: ConnectionType, public_key: Pubkey) -> Self {
        Self::HelloIAm {
            conn_type,
            public_key,
        }
    }

    /// Creates a `Ping` payload.
    #[must_use]
    pub const fn ping(seq: i64) -> Self {
        Self::Ping { seq }
    }

    /// Creates a `Pong` payload.
    #[must_use]
    pub const fn pong(seq: i64) -> Self {
        Self::Pong { seq }
    }

    /// Creates an `Ack` payload.
    #[must_use]
    pub fn ack(condition: AckCondition, text: impl Into<String>) -> Self {
        Self::Ack {
            condition,
            text: text.into(),
        }
    }

    /// Creates a `DirectoryRequest` payload.
    #[must_use]
    pub fn directory_request(uid: impl Into<String>) -> Self {
        Self::DirectoryRequest { uid: uid.into() }
    }

    /// Creates a `DirectoryResponse` payload.
    #[must_use]
    pub fn directory_response(
        uid: impl Into<String>,
        user_signing_key: Vec<u8>,
        device_encryption_keys: Vec<Vec<u8>>,
    ) -> Self {
        Self::DirectoryResponse {
            uid: uid.into(),
            user_signing_key,
            device_encryption_keys,
        }
    }

    /// Returns the wire tag byte for this payload.
    #[must_use]
    pub const fn tag(&self) -> u8 {
        match self {
            Self::HelloIAm { .. } => TAG_HELLO_I_AM,
            Self::Ping { .. } => TAG_PING,
            Self::Pong { .. } => TAG_PONG,
            Self::Ack { .. } => TAG_ACK,
            Self::DirectoryRequest { .. } => TAG_DIRECTORY_REQUEST,
            Self::DirectoryResponse { .. } => TAG_DIRECTORY_RESPONSE,
        }
    }

    /// Returns the payload variant name, as used in REQUIRES_ENCRYPTION acks.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::HelloIAm { .. } => "HelloIAm",
            Self::Ping { .. } => "Ping",
            Self::Pong { .. } => "Pong",
            Self::Ack { .. } => "Ack",
            Self::DirectoryRequest { .. } => "DirectoryRequest",
            Self::DirectoryResponse { .. } => "DirectoryResponse",
        }
    }
}

impl Packet {
    /// Wraps a plaintext payload in a current-version envelope.
    #[must_use]
    pub const fn plain(payload: Payload) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            body: PacketBody::Plain(payload),
        }
    }

    /// Wraps sealed payload bytes in a current-version envelope.
    #[must_use]
    pub const fn encrypted(sealed: Vec<u8>) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            body: PacketBody::Encrypted(sealed),
        }
    }
}

fn put_bytes(out: &mut Vec<u8>, field: &'static str, bytes: &[u8]) -> Result<(), WireError> {
    let len = u16::try_from(bytes.len()).map_err(|_| WireError::FieldTooLong(field))?;
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(bytes);
    Ok(())
}

/// Encodes a payload into its tagged binary form.
///
/// # Errors
///
/// Returns [`WireError::FieldTooLong`] if a variable-length field exceeds
/// 65535 bytes.
pub fn encode_payload(payload: &Payload) -> Result<Vec<u8>, WireError> {
    let mut out = Vec::with_capacity(64);
    out.push(payload.tag());
    match payload {
        Payload::HelloIAm {
            conn_type,
            public_key,
        } => {
            out.push(*conn_type as u8);
            out.extend_from_slice(public_key);
        }
        Payload::Ping { seq } | Payload::Pong { seq } => {
            out.extend_from_slice(&seq.to_be_bytes());
        }
        Payload::Ack { condition, text } => {
            out.push(*condition as u8);
            put_bytes(&mut out, "ack.text", text.as_bytes())?;
        }
        Payload::DirectoryRequest { uid } => {
            put_bytes(&mut out, "uid", uid.as_bytes())?;
        }
        Payload::DirectoryResponse {
            uid,
            user_signing_key,
            device_encryption_keys,
        } => {
            put_bytes(&mut out, "uid", uid.as_bytes())?;
            put_bytes(&mut out, "user_signing_key", user_signing_key)?;
            let count = u16::try_from(device_encryption_keys.len())
                .map_err(|_| WireError::FieldTooLong("device_encryption_keys"))?;
            out.extend_from_slice(&count.to_be_bytes());
            for key in device_encryption_keys {
                put_bytes(&mut out, "device_encryption_keys", key)?;
            }
        }
    }
    Ok(out)
}

/// Encodes a packet envelope into its wire form (without length prefix).
///
/// # Errors
///
/// Returns [`WireError::FieldTooLong`] if an inner field exceeds its length
/// prefix.
pub fn encode_packet(packet: &Packet) -> Result<Vec<u8>, WireError> {
    let mut out = Vec::with_capacity(64);
    out.extend_from_slice(&packet.version.to_be_bytes());
    match &packet.body {
        PacketBody::Plain(payload) => {
            out.push(BODY_PLAIN);
            out.extend_from_slice(&encode_payload(payload)?);
        }
        PacketBody::Encrypted(sealed) => {
            out.push(BODY_ENCRYPTED);
            out.extend_from_slice(sealed);
        }
    }
    Ok(out)
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        let end = self.pos.checked_add(n).ok_or(WireError::TooShort {
            expected: usize::MAX,
            actual: self.data.len(),
        })?;
        if end > self.data.len() {
            return Err(WireError::TooShort {
                expected: end,
                actual: self.data.len(),
            });
        }
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, WireError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, WireError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn i64(&mut self) -> Result<i64, WireError> {
        let b = self.take(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(b);
        Ok(i64::from_be_bytes(arr))
    }

    fn bytes(&mut self) -> Result<Vec<u8>, WireError> {
        let len = self.u16()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    fn string(&mut self) -> Result<String, WireError> {
        String::from_utf8(self.bytes()?).map_err(|_| WireError::InvalidUtf8)
    }

    fn rest(&mut self) -> &'a [u8] {
        let slice = &self.data[self.pos..];
        self.pos = self.data.len();
        slice
    }

    fn finish(&self) -> Result<(), WireError> {
        if self.pos == self.data.len() {
            Ok(())
        } else {
            Err(WireError::TrailingBytes)
        }
    }
}

/// Parses a tagged binary payload.
///
/// # Errors
///
/// Returns [`WireError`] if the data is empty, truncated, carries an
/// unknown tag, or has malformed fields.
pub fn decode_payload(data: &[u8]) -> Result<Payload, WireError> {
    if data.is_empty() {
        return Err(WireError::Empty);
    }
    let mut r = Reader { data, pos: 1 };
    let payload = match data[0] {
        TAG_HELLO_I_AM => {
            let type_byte = r.u8()?;
            let conn_type = ConnectionType::from_wire(type_byte)
                .ok_or(WireError::BadConnectionType(type_byte))?;
            let mut public_key = [0u8; 32];
            public_key.copy_from_slice(r.take(32)?);
            Payload::HelloIAm {
                conn_type,
                public_key,
            }
        }
        TAG_PING => Payload::Ping { seq: r.i64()? },
        TAG_PONG => Payload::Pong { seq: r.i64()? },
        TAG_ACK => {
            let cond_byte = r.u8()?;
            let condition =
                AckCondition::from_wire(cond_byte).ok_or(WireError::BadAckCondition(cond_byte))?;
            Payload::Ack {
                condition,
                text: r.string()?,
            }
        }
        TAG_DIRECTORY_REQUEST => Payload::DirectoryRequest { uid: r.string()? },
        TAG_DIRECTORY_RESPONSE => {
            let uid = r.string()?;
            let user_signing_key = r.bytes()?;
            let count = r.u16()? as usize;
            let mut device_encryption_keys = Vec::with_capacity(count.min(64));
            for _ in 0..count {
                device_encryption_keys.push(r.bytes()?);
            }
            Payload::DirectoryResponse {
                uid,
                user_signing_key,
                device_encryption_keys,
            }
        }
        t => return Err(WireError::UnknownTag(t)),
    };
    r.finish()?;
    Ok(payload)
}

/// Parses a packet envelope (without length prefix).
///
/// # Errors
///
/// Returns [`WireError`] if the data is empty or truncated, the version is
/// unsupported, or the body type byte is unknown.
pub fn decode_packet(data: &[u8]) -> Result<Packet, WireError> {
    if data.is_empty() {
        return Err(WireError::Empty);
    }
    let mut r = Reader { data, pos: 0 };
    let version_bytes = r.take(4)?;
    let mut arr = [0u8; 4];
    arr.copy_from_slice(version_bytes);
    let version = u32::from_be_bytes(arr);
    if version != PROTOCOL_VERSION {
        return Err(WireError::UnknownVersion(version));
    }
    let body = match r.u8()? {
        BODY_PLAIN => PacketBody::Plain(decode_payload(r.rest())?),
        BODY_ENCRYPTED => PacketBody::Encrypted(r.rest().to_vec()),
        t => return Err(WireError::UnknownBody(t)),
    };
    Ok(Packet { version, body })
}

/// Writes one length-prefixed frame: a 4-byte big-endian length followed by
/// the encoded packet bytes.
///
/// # Errors
///
/// Returns an I/O error if the write fails, or `InvalidData` if the frame
/// exceeds `max_len`.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    data: &[u8],
    max_len: usize,
) -> std::io::Result<()> {
    if data.len() > max_len {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame of {} bytes exceeds maximum {max_len}", data.len()),
        ));
    }
    let len = u32::try_from(data.len())
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidData, "frame too large"))?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(data).await?;
    writer.flush().await
}

/// Reads one length-prefixed frame, returning `Ok(None)` on a clean EOF
/// before the length prefix.
///
/// # Errors
///
/// Returns an I/O error on read failure, truncated frames, or frames larger
/// than `max_len`.
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    max_len: usize,
) -> std::io::Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max_len {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame of {len} bytes exceeds maximum {max_len}"),
        ));
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(Some(buf))
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    fn arb_pubkey() -> impl Strategy<Value = Pubkey> {
        prop::array::uniform32(any::<u8>())
    }

    fn arb_key_bytes() -> impl Strategy<Value = Vec<u8>> {
        prop::collection::vec(any::<u8>(), 0..64)
    }

    fn arb_text() -> impl Strategy<Value = String> {
        "[ -~]{0,128}"
    }

    fn arb_payload() -> impl Strategy<Value = Payload> {
        prop_oneof![
            (any::<bool>(), arb_pubkey()).prop_map(|(s2s, pk)| {
                let conn_type = if s2s {
                    ConnectionType::ServerToServer
                } else {
                    ConnectionType::ClientToServer
                };
                Payload::hello(conn_type, pk)
            }),
            any::<i64>().prop_map(Payload::ping),
            any::<i64>().prop_map(Payload::pong),
            (0u8..4, arb_text()).prop_map(|(c, text)| {
                Payload::ack(AckCondition::from_wire(c).unwrap(), text)
            }),
            arb_text().prop_map(Payload::directory_request),
            (
                arb_text(),
                arb_key_bytes(),
                prop::collection::vec(arb_key_bytes(), 0..8)
            )
                .prop_map(|(uid, usk, deks)| Payload::directory_response(uid, usk, deks)),
        ]
    }

    proptest! {
        #[test]
        fn payload_encode_decode_roundtrip(payload in arb_payload()) {
            let bytes = encode_payload(&payload).unwrap();
            prop_assert_eq!(decode_payload(&bytes).unwrap(), payload);
        }

        #[test]
        fn packet_encode_decode_roundtrip(payload in arb_payload()) {
            let packet = Packet::plain(payload);
            let bytes = encode_packet(&packet).unwrap();
            prop_assert_eq!(decode_packet(&bytes).unwrap(), packet);
        }

        #[test]
        fn decode_never_panics(data in prop::collection::vec(any::<u8>(), 0..256)) {
            let _ = decode_packet(&data);
        }
    }
}
