use siren_common::crypto;
use siren_common::types::{ConnectionType, Pubkey};
use siren_common::wire::{self, Packet, PacketBody, Payload};
use sirend::config::ServerConfig;
use sirend::resolver::{SrvResolver, StaticResolver};
use sirend::server::ServerState;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};

pub const TEST_MAX_MESSAGE_SIZE: usize = 4096;
pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);

pub fn test_config(listen: SocketAddr) -> ServerConfig {
    ServerConfig {
        listen,
        metrics_addr: "127.0.0.1:0".parse().unwrap(),
        max_message_size: TEST_MAX_MESSAGE_SIZE,
        max_connections: 4096,
        federation_enabled: true,
        local_domains: vec!["test.com".to_string()],
    }
}

fn make_state(config: ServerConfig, resolver: Box<dyn SrvResolver>) -> Arc<ServerState> {
    let (_, secret_key) = crypto::generate_keypair();
    Arc::new(ServerState::new(config, secret_key, resolver))
}

async fn spawn_server(state: Arc<ServerState>, listener: TcpListener) {
    let state_clone = state.clone();
    tokio::spawn(async move {
        if let Err(e) = sirend::run(listener, state_clone).await {
            eprintln!("server error in test: {e}");
        }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
}

pub async fn start_server() -> (SocketAddr, Arc<ServerState>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let state = make_state(test_config(addr), Box::new(StaticResolver::new()));
    spawn_server(state.clone(), listener).await;
    (addr, state)
}

pub async fn start_server_with_config(
    mutate: impl FnOnce(&mut ServerConfig),
) -> (SocketAddr, Arc<ServerState>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let mut config = test_config(addr);
    mutate(&mut config);
    let state = make_state(config, Box::new(StaticResolver::new()));
    spawn_server(state.clone(), listener).await;
    (addr, state)
}

pub async fn start_server_with_resolver(
    mutate: impl FnOnce(&mut ServerConfig),
    resolver: StaticResolver,
) -> (SocketAddr, Arc<ServerState>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let mut config = test_config(addr);
    mutate(&mut config);
    let state = make_state(config, Box::new(resolver));
    spawn_server(state.clone(), listener).await;
    (addr, state)
}

/// A raw protocol client for driving a server through handshakes and
/// directory lookups.
pub struct TestClient {
    pub stream: TcpStream,
    pub public_key: Pubkey,
    pub secret_key: [u8; 32],
    /// Learned from the server's hello reply.
    pub server_key: Option<Pubkey>,
}

impl TestClient {
    pub async fn connect(addr: &SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (public_key, secret_key) = crypto::generate_keypair();
        Self {
            stream,
            public_key,
            secret_key,
            server_key: None,
        }
    }

    pub async fn send_plain(&mut self, payload: Payload) {
        let bytes = wire::encode_packet(&Packet::plain(payload)).unwrap();
        wire::write_frame(&mut self.stream, &bytes, TEST_MAX_MESSAGE_SIZE)
            .await
            .unwrap();
    }

    pub async fn send_sealed(&mut self, payload: Payload) {
        let server_key = self.server_key.expect("server key not learned yet");
        let plaintext = wire::encode_payload(&payload).unwrap();
        let sealed = crypto::seal(&server_key, &self.secret_key, &plaintext).unwrap();
        let bytes = wire::encode_packet(&Packet::encrypted(sealed)).unwrap();
        wire::write_frame(&mut self.stream, &bytes, TEST_MAX_MESSAGE_SIZE)
            .await
            .unwrap();
    }

    /// Sends a raw pre-framed byte string (for malformed-input tests).
    pub async fn send_raw(&mut self, data: &[u8]) {
        wire::write_frame(&mut self.stream, data, TEST_MAX_MESSAGE_SIZE)
            .await
            .unwrap();
    }

    /// Receives the next packet, or `None` on EOF.
    pub async fn recv_packet(&mut self) -> Option<Packet> {
        let frame = tokio::time::timeout(
            RECV_TIMEOUT,
            wire::read_frame(&mut self.stream, TEST_MAX_MESSAGE_SIZE),
        )
        .await
        .expect("timeout waiting for packet")
        .unwrap()?;
        Some(wire::decode_packet(&frame).unwrap())
    }

    /// Receives the next payload, opening sealed bodies with the learned
    /// server key. Returns the payload and whether it arrived sealed.
    pub async fn recv_payload(&mut self) -> Option<(Payload, bool)> {
        let packet = self.recv_packet().await?;
        match packet.body {
            PacketBody::Plain(payload) => Some((payload, false)),
            PacketBody::Encrypted(sealed) => {
                let server_key = self.server_key.expect("server key not learned yet");
                let plaintext = crypto::open(&server_key, &self.secret_key, &sealed).unwrap();
                Some((wire::decode_payload(&plaintext).unwrap(), true))
            }
        }
    }

    /// Sends our hello and waits for the server's hello reply, learning its
    /// public key.
    pub async fn hello(&mut self) {
        self.send_plain(Payload::hello(ConnectionType::ClientToServer, self.public_key))
            .await;
        loop {
            match self.recv_packet().await.expect("connection closed during hello") {
                Packet {
                    body: PacketBody::Plain(Payload::HelloIAm { public_key, .. }),
                    ..
                } => {
                    self.server_key = Some(public_key);
                    return;
                }
                // Sealed pings may already be in flight; skip them.
                _ => {}
            }
        }
    }

    /// Full handshake: hello exchange, then prove key possession with a
    /// sealed ping and wait for the pong.
    pub async fn authenticate(&mut self) {
        self.hello().await;
        self.send_sealed(Payload::ping(0)).await;
        loop {
            match self.recv_payload().await.expect("connection closed during auth") {
                (Payload::Pong { .. }, true) => return,
                _ => {}
            }
        }
    }
}
