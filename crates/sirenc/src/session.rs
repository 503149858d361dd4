//! Client-side connection session.
//!
//! Dials a Siren server, introduces itself with a plaintext `HelloIAm`, and
//! then runs a reader and a writer task. The reader answers keepalive pings
//! (the exchange that completes the handshake) and surfaces everything else
//! as [`SessionEvent`]s; the writer sends queued commands, sealing them once
//! the session has authenticated.

use siren_common::crypto;
use siren_common::types::{AckCondition, ConnectionType, Pubkey};
use siren_common::wire::{self, Packet, PacketBody, Payload};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

const WRITE_QUEUE_CAPACITY: usize = 10;
const EVENT_QUEUE_CAPACITY: usize = 32;

/// Something the server said, surfaced for display.
#[derive(Debug)]
pub enum SessionEvent {
    /// The server introduced itself with its public key.
    ServerHello(Pubkey),
    /// The first sealed frame from the server was opened; commands are now
    /// sent sealed.
    Authenticated,
    /// A keepalive ping arrived (a pong is sent automatically).
    Ping {
        /// Ping sequence number.
        seq: i64,
    },
    /// A pong answered one of our pings.
    Pong {
        /// Sequence number of the ping being answered.
        seq: i64,
    },
    /// A directory lookup answer.
    DirectoryResponse {
        /// Identifier the answer refers to.
        uid: String,
        /// User signing key bytes, empty when unknown.
        user_signing_key: Vec<u8>,
        /// Device encryption keys, empty when unknown.
        device_encryption_keys: Vec<Vec<u8>>,
    },
    /// A condition notification from the server.
    Ack {
        /// Outcome condition.
        condition: AckCondition,
        /// Human-readable detail.
        text: String,
    },
    /// The connection closed.
    Closed,
}

struct Shared {
    authenticated: AtomicBool,
    server_key: OnceLock<Pubkey>,
}

/// A live client session.
pub struct Session {
    /// Our long-lived public key.
    pub public_key: Pubkey,
    command_tx: mpsc::Sender<Payload>,
    event_rx: mpsc::Receiver<SessionEvent>,
}

impl Session {
    /// Dials `addr` and starts the session tasks. The writer's first frame
    /// is our plaintext hello.
    ///
    /// # Errors
    ///
    /// Returns an error if the dial fails.
    pub async fn connect(
        addr: &str,
        public_key: Pubkey,
        secret_key: [u8; 32],
        max_message_size: usize,
    ) -> anyhow::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        let (read_half, write_half) = stream.into_split();

        let shared = Arc::new(Shared {
            authenticated: AtomicBool::new(false),
            server_key: OnceLock::new(),
        });
        let (command_tx, command_rx) = mpsc::channel(WRITE_QUEUE_CAPACITY);
        let (pong_tx, pong_rx) = mpsc::channel(WRITE_QUEUE_CAPACITY);
        let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let (terminate_tx, terminate_rx) = oneshot::channel();

        tokio::spawn(writer_task(
            shared.clone(),
            write_half,
            public_key,
            secret_key,
            command_rx,
            pong_rx,
            terminate_rx,
            max_message_size,
        ));
        tokio::spawn(reader_task(
            shared,
            read_half,
            secret_key,
            pong_tx,
            event_tx,
            terminate_tx,
            max_message_size,
        ));

        Ok(Self {
            public_key,
            command_tx,
            event_rx,
        })
    }

    /// Queues a command payload for sending.
    ///
    /// # Errors
    ///
    /// Returns an error if the session has closed.
    pub async fn send(&self, payload: Payload) -> anyhow::Result<()> {
        self.command_tx
            .send(payload)
            .await
            .map_err(|_| anyhow::anyhow!("session closed"))
    }

    /// Waits for the next session event; `None` after the session closes.
    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        self.event_rx.recv().await
    }
}

#[allow(clippy::too_many_arguments)]
async fn writer_task(
    shared: Arc<Shared>,
    mut writer: OwnedWriteHalf,
    public_key: Pubkey,
    secret_key: [u8; 32],
    mut command_rx: mpsc::Receiver<Payload>,
    mut pong_rx: mpsc::Receiver<Payload>,
    mut terminate_rx: oneshot::Receiver<()>,
    max: usize,
) {
    let hello = Payload::hello(ConnectionType::ClientToServer, public_key);
    if send_payload(&shared, &mut writer, &secret_key, &hello, max)
        .await
        .is_err()
    {
        return;
    }

    loop {
        tokio::select! {
            biased;
            payload = pong_rx.recv() => {
                let Some(payload) = payload else { break };
                if send_payload(&shared, &mut writer, &secret_key, &payload, max).await.is_err() {
                    break;
                }
            }
            payload = command_rx.recv() => {
                let Some(payload) = payload else { break };
                if send_payload(&shared, &mut writer, &secret_key, &payload, max).await.is_err() {
                    break;
                }
            }
            _ = &mut terminate_rx => break,
        }
    }
}

/// Sends a payload, sealed once the session has authenticated and the
/// server's key is known, plaintext before that (mirroring the handshake
/// rules: the server answers early plaintext with REQUIRES_ENCRYPTION acks,
/// which is surfaced rather than fatal).
async fn send_payload(
    shared: &Shared,
    writer: &mut OwnedWriteHalf,
    secret_key: &[u8; 32],
    payload: &Payload,
    max: usize,
) -> std::io::Result<()> {
    let sealed_to = if shared.authenticated.load(Ordering::Acquire) {
        shared.server_key.get()
    } else {
        None
    };
    let packet = match sealed_to {
        Some(server_key) => {
            let plaintext = match wire::encode_payload(payload) {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!("failed to encode payload: {e}");
                    return Ok(());
                }
            };
            match crypto::seal(server_key, secret_key, &plaintext) {
                Ok(sealed) => Packet::encrypted(sealed),
                Err(e) => {
                    warn!("failed to seal payload: {e}");
                    return Ok(());
                }
            }
        }
        None => Packet::plain(payload.clone()),
    };
    let bytes = match wire::encode_packet(&packet) {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!("failed to encode packet: {e}");
            return Ok(());
        }
    };
    wire::write_frame(writer, &bytes, max).await
}

async fn reader_task(
    shared: Arc<Shared>,
    mut reader: OwnedReadHalf,
    secret_key: [u8; 32],
    pong_tx: mpsc::Sender<Payload>,
    event_tx: mpsc::Sender<SessionEvent>,
    terminate_tx: oneshot::Sender<()>,
    max: usize,
) {
    loop {
        let frame = match wire::read_frame(&mut reader, max).await {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(e) => {
                debug!("socket read failed: {e}");
                break;
            }
        };
        let packet = match wire::decode_packet(&frame) {
            Ok(packet) => packet,
            Err(e) => {
                debug!("invalid packet received from server: {e}");
                continue;
            }
        };

        let (payload, was_sealed) = match packet.body {
            PacketBody::Plain(payload) => (payload, false),
            PacketBody::Encrypted(sealed) => {
                let Some(server_key) = shared.server_key.get() else {
                    debug!("sealed frame before the server introduced itself");
                    continue;
                };
                let plaintext = match crypto::open(server_key, &secret_key, &sealed) {
                    Ok(plaintext) => plaintext,
                    Err(e) => {
                        debug!("failed to open sealed payload: {e}");
                        continue;
                    }
                };
                match wire::decode_payload(&plaintext) {
                    Ok(payload) => (payload, true),
                    Err(e) => {
                        debug!("sealed frame held an undecodable payload: {e}");
                        continue;
                    }
                }
            }
        };

        if was_sealed && !shared.authenticated.swap(true, Ordering::AcqRel) {
            let _ = event_tx.send(SessionEvent::Authenticated).await;
        }

        match payload {
            Payload::HelloIAm { public_key, .. } => {
                if shared.server_key.set(public_key).is_ok() {
                    let _ = event_tx.send(SessionEvent::ServerHello(public_key)).await;
                }
            }
            Payload::Ping { seq } => {
                let _ = pong_tx.send(Payload::pong(seq)).await;
                let _ = event_tx.send(SessionEvent::Ping { seq }).await;
            }
            Payload::Pong { seq } => {
                let _ = event_tx.send(SessionEvent::Pong { seq }).await;
            }
            Payload::DirectoryResponse {
                uid,
                user_signing_key,
                device_encryption_keys,
            } => {
                let _ = event_tx
                    .send(SessionEvent::DirectoryResponse {
                        uid,
                        user_signing_key,
                        device_encryption_keys,
                    })
                    .await;
            }
            Payload::Ack { condition, text } => {
                let closing = condition == AckCondition::Terminate;
                let _ = event_tx.send(SessionEvent::Ack { condition, text }).await;
                if closing {
                    break;
                }
            }
            Payload::DirectoryRequest { .. } => {
                debug!("ignoring directory request sent to a client");
            }
        }
    }

    let _ = terminate_tx.send(());
    let _ = event_tx.send(SessionEvent::Closed).await;
}
