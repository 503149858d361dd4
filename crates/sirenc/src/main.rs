#![forbid(unsafe_code)]

use clap::Parser;
use siren_common::crypto;
use siren_common::types::{fmt_key, AckCondition};
use siren_common::uid::Uid;
use siren_common::wire::Payload;
use sirenc::keys::load_or_generate_keypair;
use sirenc::session::{Session, SessionEvent};
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Interactive Siren test client.
#[derive(Parser, Debug)]
#[command(name = "sirenc")]
#[command(about = "Interactive Siren test client")]
#[command(version)]
struct Cli {
    /// Server address to connect to.
    #[arg(long, default_value = "127.0.0.1:9989", env = "SIRENC_SERVER")]
    server: String,
    /// Path to the 32-byte Curve25519 private key file. Ephemeral when
    /// omitted.
    #[arg(long, env = "SIRENC_KEY")]
    key: Option<PathBuf>,
    /// Maximum encoded packet size in bytes.
    #[arg(long, default_value = "4096", env = "SIRENC_MAX_MESSAGE_SIZE")]
    max_message_size: usize,
    /// Increase log verbosity (-v: debug, -vv: trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn init_tracing(cli: &Cli) {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let directive = match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        };
        EnvFilter::new(directive)
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli);

    let (public_key, secret_key) = match &cli.key {
        Some(path) => load_or_generate_keypair(path)?,
        None => crypto::generate_keypair(),
    };
    info!("client public key: {}", fmt_key(&public_key));

    let mut session =
        Session::connect(&cli.server, public_key, secret_key, cli.max_message_size).await?;
    println!("connected to {}", cli.server);
    println!("commands: lookup <uid> | ping [seq] | exit");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            event = session.next_event() => {
                let Some(event) = event else { break };
                if print_event(event) {
                    break;
                }
            }
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                match parse_command(&line) {
                    Ok(Some(payload)) => session.send(payload).await?,
                    Ok(None) => {
                        println!("exiting");
                        break;
                    }
                    Err(message) if !message.is_empty() => println!("{message}"),
                    Err(_) => {}
                }
            }
        }
    }

    Ok(())
}

/// Prints an event; returns `true` when the session is over.
fn print_event(event: SessionEvent) -> bool {
    match event {
        SessionEvent::ServerHello(key) => {
            println!("server public key: {}", fmt_key(&key));
        }
        SessionEvent::Authenticated => {
            println!("session authenticated");
        }
        SessionEvent::Ping { seq } => {
            println!("server->client: ping {seq}");
        }
        SessionEvent::Pong { seq } => {
            println!("server->client: pong {seq}");
        }
        SessionEvent::DirectoryResponse {
            uid,
            user_signing_key,
            device_encryption_keys,
        } => {
            println!("directory response for {uid}:");
            if user_signing_key.is_empty() {
                println!("  user signing key: (none)");
            } else {
                println!("  user signing key: {}", hex(&user_signing_key));
            }
            if device_encryption_keys.is_empty() {
                println!("  device encryption keys: (none)");
            }
            for (i, key) in device_encryption_keys.iter().enumerate() {
                println!("  device encryption key {i}: {}", hex(key));
            }
        }
        SessionEvent::Ack { condition, text } => {
            println!("server ack: {condition:?} {text}");
            if condition == AckCondition::Terminate {
                return true;
            }
        }
        SessionEvent::Closed => {
            println!("connection closed");
            return true;
        }
    }
    false
}

/// Parses one command line. `Ok(None)` means exit.
fn parse_command(line: &str) -> Result<Option<Payload>, String> {
    let mut tokens = line.trim().split_whitespace();
    match tokens.next() {
        None => Err(String::new()),
        Some("lookup") => {
            let uid = tokens
                .next()
                .ok_or_else(|| "usage: lookup <uid>".to_string())?;
            // Validate locally so a typo doesn't burn a round trip.
            uid.parse::<Uid>().map_err(|e| e.to_string())?;
            Ok(Some(Payload::directory_request(uid)))
        }
        Some("ping") => {
            let seq = match tokens.next() {
                Some(raw) => raw
                    .parse::<i64>()
                    .map_err(|_| "usage: ping [seq]".to_string())?,
                None => 0,
            };
            Ok(Some(Payload::ping(seq)))
        }
        Some("exit") => Ok(None),
        Some(other) => Err(format!("unknown command {other:?}")),
    }
}

fn hex(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        let _ = write!(out, "{byte:02x}");
    }
    out
}
