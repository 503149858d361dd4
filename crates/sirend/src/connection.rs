//! Per-connection protocol state machine.
//!
//! Each TCP socket runs two cooperating tasks. The **reader** pulls framed
//! packets off the socket and dispatches decoded payloads; the **writer**
//! serialises outbound frames from two bounded queues (one for payloads that
//! are sealed before sending, one for plaintext payloads) and drives the
//! keepalive ticker. The reader hands the writer a one-shot terminate signal
//! on its way out.
//!
//! Plaintext traffic is confined to the handshake: the only payloads ever
//! written unsealed are `HelloIAm` and `Ack{REQUIRES_ENCRYPTION}`.

use crate::directory;
use crate::error::SirendError;
use crate::metrics::{counters, gauges};
use crate::server::ServerState;
use siren_common::crypto;
use siren_common::types::{AckCondition, ConnectionType, Pubkey};
use siren_common::uid::Uid;
use siren_common::wire::{self, Packet, PacketBody, Payload, WireError};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Instant;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::time::{interval_at, Duration, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Capacity of each per-connection write queue.
pub const WRITE_QUEUE_CAPACITY: usize = 10;

/// Keepalive cadence while the session is unauthenticated.
const KEEPALIVE_FAST: Duration = Duration::from_secs(1);
/// Keepalive cadence once the session is authenticated, or after the
/// handshake ping limit is reached.
const KEEPALIVE_SLOW: Duration = Duration::from_secs(60);
/// Pings sent at the fast cadence before giving up on a quick handshake.
const HANDSHAKE_PING_LIMIT: i64 = 30;

/// Session authentication state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ConnState {
    /// No handshake traffic seen yet.
    Initial = 0,
    /// The peer's public key is known; no sealed frame verified yet.
    Authenticating = 1,
    /// At least one sealed frame from the peer has been opened.
    Authenticated = 2,
}

impl ConnState {
    fn from_u8(value: u8) -> Self {
        match value {
            2 => Self::Authenticated,
            1 => Self::Authenticating,
            _ => Self::Initial,
        }
    }
}

/// State shared between a connection's reader and writer tasks.
pub struct ConnShared {
    /// Connection id within the router's live table.
    pub id: u64,
    /// Remote socket address, for logging.
    pub peer_addr: SocketAddr,
    /// The federation domain this connection was dialed for, if outbound.
    pub federation_domain: Option<String>,
    state: AtomicU8,
    // Written exactly once, during the transition out of INITIAL.
    remote_public_key: OnceLock<Pubkey>,
    conn_type: OnceLock<ConnectionType>,
    last_pong: Mutex<Option<Instant>>,
    auth_notify: Notify,
}

impl ConnShared {
    fn new(id: u64, peer_addr: SocketAddr, federation_domain: Option<String>) -> Self {
        Self {
            id,
            peer_addr,
            federation_domain,
            state: AtomicU8::new(ConnState::Initial as u8),
            remote_public_key: OnceLock::new(),
            conn_type: OnceLock::new(),
            last_pong: Mutex::new(None),
            auth_notify: Notify::new(),
        }
    }

    /// Current session state.
    #[must_use]
    pub fn state(&self) -> ConnState {
        ConnState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// The peer's public key, once the handshake has recorded it.
    #[must_use]
    pub fn remote_public_key(&self) -> Option<Pubkey> {
        self.remote_public_key.get().copied()
    }

    /// The peer's declared connection type, once recorded.
    #[must_use]
    pub fn conn_type(&self) -> Option<ConnectionType> {
        self.conn_type.get().copied()
    }

    /// Timestamp of the most recent pong from the peer.
    #[must_use]
    pub fn last_pong(&self) -> Option<Instant> {
        *self.last_pong.lock().expect("pong lock poisoned")
    }

    fn record_pong(&self) {
        *self.last_pong.lock().expect("pong lock poisoned") = Some(Instant::now());
    }

    /// Moves INITIAL → AUTHENTICATING without recording a peer key; used by
    /// the initiating side, which sends its hello before hearing one.
    fn begin_authenticating(&self) {
        let _ = self.state.compare_exchange(
            ConnState::Initial as u8,
            ConnState::Authenticating as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Records the peer's key and declared type from its hello. The first
    /// recording wins; later hellos cannot rewrite the key.
    fn record_peer(&self, public_key: Pubkey, conn_type: ConnectionType) {
        let _ = self.remote_public_key.set(public_key);
        let _ = self.conn_type.set(conn_type);
        self.begin_authenticating();
    }

    /// Marks the session authenticated. Returns `true` on the first call.
    fn mark_authenticated(&self) -> bool {
        let first = self.state.swap(ConnState::Authenticated as u8, Ordering::AcqRel)
            != ConnState::Authenticated as u8;
        if first {
            self.auth_notify.notify_waiters();
        }
        first
    }

    /// Completes once the session has authenticated.
    pub async fn wait_authenticated(&self) {
        loop {
            let notified = self.auth_notify.notified();
            if self.state() == ConnState::Authenticated {
                return;
            }
            notified.await;
        }
    }
}

/// Handle to a live connection: shared state plus its write queues.
#[derive(Clone)]
pub struct ConnHandle {
    /// State shared with the connection's tasks.
    pub shared: Arc<ConnShared>,
    /// Queue of payloads to seal and send.
    pub encrypted_tx: mpsc::Sender<Payload>,
    /// Queue of payloads to send as-is.
    pub plain_tx: mpsc::Sender<Payload>,
}

impl ConnHandle {
    /// Connection id within the router's live table.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    #[cfg(test)]
    pub(crate) fn for_tests(
        id: u64,
        federation_domain: Option<String>,
        encrypted_tx: mpsc::Sender<Payload>,
        plain_tx: mpsc::Sender<Payload>,
    ) -> Self {
        Self {
            shared: Arc::new(ConnShared::new(
                id,
                "0.0.0.0:0".parse().expect("static addr"),
                federation_domain,
            )),
            encrypted_tx,
            plain_tx,
        }
    }
}

/// Creates a connection record for `stream`, registers it with the router,
/// and spawns its reader and writer tasks.
pub fn spawn(
    state: Arc<ServerState>,
    stream: TcpStream,
    initiator: bool,
    federation_domain: Option<String>,
) -> ConnHandle {
    let id = state.router.next_id();
    let peer_addr = stream
        .peer_addr()
        .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 0)));
    let (read_half, write_half) = stream.into_split();

    let (encrypted_tx, encrypted_rx) = mpsc::channel(WRITE_QUEUE_CAPACITY);
    let (plain_tx, plain_rx) = mpsc::channel(WRITE_QUEUE_CAPACITY);
    let (terminate_tx, terminate_rx) = oneshot::channel();

    let shared = Arc::new(ConnShared::new(id, peer_addr, federation_domain));
    let handle = ConnHandle {
        shared: shared.clone(),
        encrypted_tx,
        plain_tx,
    };

    state.router.register(handle.clone());
    gauges::inc_connections_active();

    tokio::spawn(writer_task(
        state.clone(),
        shared.clone(),
        write_half,
        encrypted_rx,
        plain_rx,
        terminate_rx,
        initiator,
    ));
    tokio::spawn(reader_task(state, handle.clone(), read_half, terminate_tx, initiator));

    handle
}

fn keepalive_ticker(period: Duration) -> Interval {
    let mut ticker = interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

/// Serialises outbound frames: queue items, keepalive pings, and the final
/// drain when the reader signals termination.
async fn writer_task(
    state: Arc<ServerState>,
    shared: Arc<ConnShared>,
    writer: OwnedWriteHalf,
    encrypted_rx: mpsc::Receiver<Payload>,
    plain_rx: mpsc::Receiver<Payload>,
    terminate_rx: oneshot::Receiver<()>,
    initiator: bool,
) {
    if let Err(e) = run_writer(
        &state,
        &shared,
        writer,
        encrypted_rx,
        plain_rx,
        terminate_rx,
        initiator,
    )
    .await
    {
        debug!(peer = %shared.peer_addr, "write path closed: {e}");
    }
    finish_writer(&state, &shared).await;
}

async fn run_writer(
    state: &Arc<ServerState>,
    shared: &Arc<ConnShared>,
    mut writer: OwnedWriteHalf,
    mut encrypted_rx: mpsc::Receiver<Payload>,
    mut plain_rx: mpsc::Receiver<Payload>,
    mut terminate_rx: oneshot::Receiver<()>,
    initiator: bool,
) -> Result<(), SirendError> {
    let max = state.config.max_message_size;
    let mut ticker = keepalive_ticker(KEEPALIVE_FAST);
    let mut slow_cadence = false;
    let mut ping_seq: i64 = 0;

    // The initiator introduces itself before anything else: a plaintext
    // hello carrying our public key, requesting a federation session.
    if initiator {
        shared.begin_authenticating();
        let hello = Payload::hello(ConnectionType::ServerToServer, state.public_key);
        send_plain(&mut writer, &hello, max).await?;
    }

    loop {
        tokio::select! {
            biased;
            payload = encrypted_rx.recv() => {
                let Some(payload) = payload else { return Ok(()) };
                send_encrypted(state, shared, &mut writer, &payload, max).await?;
            }
            payload = plain_rx.recv() => {
                let Some(payload) = payload else { return Ok(()) };
                send_plain(&mut writer, &payload, max).await?;
            }
            _ = ticker.tick() => {
                if !slow_cadence && shared.state() == ConnState::Authenticated {
                    slow_cadence = true;
                    ticker = keepalive_ticker(KEEPALIVE_SLOW);
                }
                let ping = Payload::ping(ping_seq);
                ping_seq += 1;
                send_encrypted(state, shared, &mut writer, &ping, max).await?;
                if ping_seq == HANDSHAKE_PING_LIMIT
                    && !slow_cadence
                    && shared.state() < ConnState::Authenticated
                {
                    warn!(peer = %shared.peer_addr,
                        "remote side has not authenticated after {HANDSHAKE_PING_LIMIT} pings");
                    slow_cadence = true;
                    ticker = keepalive_ticker(KEEPALIVE_SLOW);
                }
            }
            _ = &mut terminate_rx => {
                // Drain whatever the reader enqueued before it broke, most
                // importantly terminating acks.
                while let Ok(payload) = encrypted_rx.try_recv() {
                    send_encrypted(state, shared, &mut writer, &payload, max).await?;
                }
                while let Ok(payload) = plain_rx.try_recv() {
                    send_plain(&mut writer, &payload, max).await?;
                }
                return Ok(());
            }
        }
    }
}

async fn finish_writer(state: &Arc<ServerState>, shared: &Arc<ConnShared>) {
    state
        .router
        .remove(shared.id, shared.federation_domain.as_deref())
        .await;
    gauges::dec_connections_active();
}

/// Seals and writes one payload from the encrypted queue.
///
/// Before the session authenticates only handshake traffic may pass: pings
/// (a successful ping-pong exchange is part of the handshake) and
/// terminating acks (the handshake's teardown). Everything else is dropped.
async fn send_encrypted(
    state: &Arc<ServerState>,
    shared: &Arc<ConnShared>,
    writer: &mut OwnedWriteHalf,
    payload: &Payload,
    max: usize,
) -> Result<(), SirendError> {
    if shared.state() < ConnState::Authenticated {
        let handshake_traffic = matches!(
            payload,
            Payload::Ping { .. }
                | Payload::Ack {
                    condition: AckCondition::Terminate,
                    ..
                }
        );
        if !handshake_traffic {
            counters::payloads_dropped_total("unauthenticated");
            return Ok(());
        }
    }

    let Some(peer_key) = shared.remote_public_key() else {
        debug!(peer = %shared.peer_addr,
            "dropping {} payload: peer public key not yet known", payload.name());
        counters::payloads_dropped_total("no_peer_key");
        return Ok(());
    };

    let plaintext = match wire::encode_payload(payload) {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!("failed to encode payload: {e}");
            counters::payloads_dropped_total("encode");
            return Ok(());
        }
    };
    let sealed = match crypto::seal(&peer_key, &state.secret_key, &plaintext) {
        Ok(sealed) => sealed,
        Err(e) => {
            warn!("failed to seal payload: {e}");
            counters::payloads_dropped_total("seal");
            return Ok(());
        }
    };
    write_packet(writer, &Packet::encrypted(sealed), max).await
}

/// Writes one payload from the plaintext queue.
async fn send_plain(
    writer: &mut OwnedWriteHalf,
    payload: &Payload,
    max: usize,
) -> Result<(), SirendError> {
    write_packet(writer, &Packet::plain(payload.clone()), max).await
}

async fn write_packet(
    writer: &mut OwnedWriteHalf,
    packet: &Packet,
    max: usize,
) -> Result<(), SirendError> {
    let bytes = match wire::encode_packet(packet) {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!("failed to encode packet: {e}");
            counters::payloads_dropped_total("encode");
            return Ok(());
        }
    };
    wire::write_frame(writer, &bytes, max).await?;
    counters::packets_total("out");
    Ok(())
}

/// Pulls framed packets off the socket and dispatches decoded payloads until
/// the socket fails, the peer says goodbye, or a decode failure forces a
/// terminating ack.
async fn reader_task(
    state: Arc<ServerState>,
    handle: ConnHandle,
    reader: OwnedReadHalf,
    terminate_tx: oneshot::Sender<()>,
    initiator: bool,
) {
    let shared = handle.shared.clone();
    info!(peer = %shared.peer_addr, "opened connection");
    if let Err(e) = run_reader(&state, &handle, reader, initiator).await {
        debug!(peer = %shared.peer_addr, "connection closed: {e}");
    }
    let _ = terminate_tx.send(());
    info!(peer = %shared.peer_addr, "closed connection");
}

async fn run_reader(
    state: &Arc<ServerState>,
    handle: &ConnHandle,
    mut reader: OwnedReadHalf,
    initiator: bool,
) -> Result<(), SirendError> {
    let shared = &handle.shared;
    let max = state.config.max_message_size;

    loop {
        let Some(frame) = wire::read_frame(&mut reader, max).await? else {
            return Ok(());
        };
        counters::packets_total("in");

        let packet = match wire::decode_packet(&frame) {
            Ok(packet) => packet,
            Err(WireError::UnknownBody(_)) => {
                enqueue(
                    &handle.encrypted_tx,
                    Payload::ack(AckCondition::InvalidPacket, "Unknown payload type"),
                )
                .await;
                continue;
            }
            Err(e) => {
                warn!(peer = %shared.peer_addr, "could not decode packet: {e}");
                enqueue(
                    &handle.encrypted_tx,
                    Payload::ack(AckCondition::Terminate, "Failed to decode packet"),
                )
                .await;
                return Err(SirendError::Wire(e));
            }
        };

        match packet.body {
            PacketBody::Plain(payload) => {
                handle_plaintext(state, handle, payload, initiator).await?;
            }
            PacketBody::Encrypted(sealed) => handle_sealed(state, handle, &sealed).await?,
        }
    }
}

/// Handles a plaintext payload. Only `HelloIAm` is meaningful unencrypted;
/// anything else draws a REQUIRES_ENCRYPTION ack on the plain queue.
async fn handle_plaintext(
    state: &Arc<ServerState>,
    handle: &ConnHandle,
    payload: Payload,
    initiator: bool,
) -> Result<(), SirendError> {
    let shared = &handle.shared;
    match payload {
        Payload::HelloIAm {
            conn_type,
            public_key,
        } => {
            // Federation connections are only accepted when enabled. The
            // peer's key is recorded first so the goodbye can be sealed.
            if conn_type == ConnectionType::ServerToServer && !state.config.federation_enabled {
                shared.record_peer(public_key, conn_type);
                enqueue(
                    &handle.encrypted_tx,
                    Payload::ack(
                        AckCondition::Terminate,
                        "This server does not accept federation",
                    ),
                )
                .await;
                return Err(SirendError::ConnectionClosed);
            }

            // A hello carrying our own key means we've somehow dialed
            // ourselves. This shouldn't ever really happen, but stranger
            // things happen at sea.
            if public_key == state.public_key {
                warn!(peer = %shared.peer_addr, "rejecting connection from same public key");
                shared.record_peer(public_key, conn_type);
                enqueue(
                    &handle.encrypted_tx,
                    Payload::ack(
                        AckCondition::Terminate,
                        "Rejecting connection from same public key",
                    ),
                )
                .await;
                return Err(SirendError::ConnectionClosed);
            }

            if shared.state() < ConnState::Authenticated {
                shared.record_peer(public_key, conn_type);
            }

            // The initiator already introduced itself on startup; only the
            // accepting side sends a hello in response.
            if !initiator {
                enqueue(
                    &handle.plain_tx,
                    Payload::hello(conn_type, state.public_key),
                )
                .await;
            }
            Ok(())
        }
        other => {
            enqueue(
                &handle.plain_tx,
                Payload::ack(AckCondition::RequiresEncryption, other.name()),
            )
            .await;
            Ok(())
        }
    }
}

/// Opens a sealed payload and dispatches it. The first successful open
/// authenticates the session. Frames that fail to open are dropped, not
/// fatal.
async fn handle_sealed(
    state: &Arc<ServerState>,
    handle: &ConnHandle,
    sealed: &[u8],
) -> Result<(), SirendError> {
    let shared = &handle.shared;
    let Some(peer_key) = shared.remote_public_key() else {
        debug!(peer = %shared.peer_addr, "dropping sealed frame received before handshake");
        return Ok(());
    };

    let plaintext = match crypto::open(&peer_key, &state.secret_key, sealed) {
        Ok(plaintext) => plaintext,
        Err(e) => {
            debug!(peer = %shared.peer_addr, "failed to open sealed payload: {e}");
            counters::payloads_dropped_total("open");
            return Ok(());
        }
    };
    let payload = match wire::decode_payload(&plaintext) {
        Ok(payload) => payload,
        Err(e) => {
            debug!(peer = %shared.peer_addr, "sealed frame held an undecodable payload: {e}");
            counters::payloads_dropped_total("open");
            return Ok(());
        }
    };

    if shared.mark_authenticated() {
        info!(peer = %shared.peer_addr, "connection authenticated");
    }

    dispatch_authenticated(state, handle, payload).await
}

/// Dispatches a successfully opened payload.
async fn dispatch_authenticated(
    state: &Arc<ServerState>,
    handle: &ConnHandle,
    payload: Payload,
) -> Result<(), SirendError> {
    let shared = &handle.shared;
    match payload {
        Payload::Ping { seq } => {
            debug!(peer = %shared.peer_addr, seq, "received ping");
            enqueue(&handle.encrypted_tx, Payload::pong(seq)).await;
            Ok(())
        }
        Payload::Pong { seq } => {
            shared.record_pong();
            debug!(peer = %shared.peer_addr, seq, "received pong");
            Ok(())
        }
        Payload::DirectoryRequest { uid } => {
            debug!(peer = %shared.peer_addr, uid = %uid, "directory request");
            match uid.parse::<Uid>() {
                Ok(uid) => {
                    let response = directory::lookup(state, &uid).await;
                    enqueue(&handle.encrypted_tx, response).await;
                }
                Err(e) => {
                    debug!(peer = %shared.peer_addr, "invalid uid in directory request: {e}");
                    enqueue(
                        &handle.encrypted_tx,
                        Payload::ack(AckCondition::InvalidPacket, "Invalid user identifier"),
                    )
                    .await;
                }
            }
            Ok(())
        }
        Payload::DirectoryResponse {
            uid,
            user_signing_key,
            device_encryption_keys,
        } => {
            debug!(peer = %shared.peer_addr, uid = %uid, "directory response");
            state
                .external_directory
                .complete(&uid, user_signing_key, device_encryption_keys);
            Ok(())
        }
        Payload::Ack {
            condition: AckCondition::Terminate,
            text,
        } => {
            info!(peer = %shared.peer_addr, "peer terminated connection: {text}");
            Err(SirendError::ConnectionClosed)
        }
        Payload::Ack { condition, text } => {
            debug!(peer = %shared.peer_addr, ?condition, text, "received ack");
            Ok(())
        }
        other @ Payload::HelloIAm { .. } => {
            debug!(peer = %shared.peer_addr, "unexpected sealed {} payload", other.name());
            enqueue(
                &handle.encrypted_tx,
                Payload::ack(AckCondition::InvalidPacket, "Unknown packet type"),
            )
            .await;
            Ok(())
        }
    }
}

/// Enqueues a payload, blocking while the queue is full. A closed queue
/// means the writer already exited; the payload is discarded.
async fn enqueue(tx: &mpsc::Sender<Payload>, payload: Payload) {
    if tx.send(payload).await.is_err() {
        debug!("write queue closed, payload discarded");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shared() -> ConnShared {
        ConnShared::new(0, "127.0.0.1:9989".parse().unwrap(), None)
    }

    #[test]
    fn new_connection_starts_initial() {
        let conn = shared();
        assert_eq!(conn.state(), ConnState::Initial);
        assert!(conn.remote_public_key().is_none());
        assert!(conn.last_pong().is_none());
    }

    #[test]
    fn recording_peer_moves_to_authenticating() {
        let conn = shared();
        conn.record_peer([5; 32], ConnectionType::ClientToServer);
        assert_eq!(conn.state(), ConnState::Authenticating);
        assert_eq!(conn.remote_public_key(), Some([5; 32]));
        assert_eq!(conn.conn_type(), Some(ConnectionType::ClientToServer));
    }

    #[test]
    fn peer_key_is_recorded_exactly_once() {
        let conn = shared();
        conn.record_peer([5; 32], ConnectionType::ClientToServer);
        conn.record_peer([9; 32], ConnectionType::ServerToServer);
        assert_eq!(conn.remote_public_key(), Some([5; 32]));
        assert_eq!(conn.conn_type(), Some(ConnectionType::ClientToServer));
    }

    #[test]
    fn mark_authenticated_fires_once() {
        let conn = shared();
        conn.record_peer([5; 32], ConnectionType::ClientToServer);
        assert!(conn.mark_authenticated());
        assert!(!conn.mark_authenticated());
        assert_eq!(conn.state(), ConnState::Authenticated);
    }

    #[test]
    fn authenticating_does_not_regress_authenticated() {
        let conn = shared();
        conn.record_peer([5; 32], ConnectionType::ClientToServer);
        assert!(conn.mark_authenticated());
        // A late hello must not demote the session.
        conn.begin_authenticating();
        assert_eq!(conn.state(), ConnState::Authenticated);
    }

    #[test]
    fn record_pong_updates_timestamp() {
        let conn = shared();
        conn.record_pong();
        assert!(conn.last_pong().is_some());
    }

    #[test]
    fn state_ordering_matches_lifecycle() {
        assert!(ConnState::Initial < ConnState::Authenticating);
        assert!(ConnState::Authenticating < ConnState::Authenticated);
    }
}
