//! PeerLink terminal chat entry point.
//!
//! A minimal front end for the link core: it issues the manager commands a
//! richer UI would issue and renders the notifications the core emits.
//!
//! ```text
//! main()
//!  └─ load_config() + tracing init
//!  └─ ConnectionManager::new()
//!  └─ start() or connect_to(addr), per the CLI mode
//!  └─ dispatch loop
//!       ├─ Notification::StateChanged    -> status line (re-arm listen mode)
//!       ├─ Notification::PeerIdentified  -> "connected to <peer>"
//!       ├─ Notification::BytesReceived   -> "<peer>: <text>"
//!       ├─ Notification::TransientError  -> warning line
//!       ├─ stdin line                    -> write() after a state check
//!       └─ Ctrl-C                        -> stop() and exit
//! ```
//!
//! Usage:
//!
//! ```text
//! peerlink-chat listen
//! peerlink-chat connect <host:port>
//! ```

use anyhow::{bail, Context};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use peerlink_core::{
    load_config, ConnectionManager, ConnectionState, Notification, PeerAddress,
};

/// How the link is brought up on launch.
enum Mode {
    /// Wait for one inbound peer on the configured port.
    Listen,
    /// Dial out to the given peer address.
    Connect(PeerAddress),
}

fn parse_args(mut args: impl Iterator<Item = String>) -> anyhow::Result<Mode> {
    match args.next().as_deref() {
        Some("listen") => Ok(Mode::Listen),
        Some("connect") => {
            let addr = args
                .next()
                .context("usage: peerlink-chat connect <host:port>")?;
            Ok(Mode::Connect(PeerAddress::new(addr)))
        }
        _ => bail!("usage: peerlink-chat <listen | connect <host:port>>"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = load_config().context("failed to load configuration")?;

    // Initialise structured logging; RUST_LOG overrides the config level.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone())),
        )
        .init();

    let mode = parse_args(std::env::args().skip(1))?;
    let listen_mode = matches!(mode, Mode::Listen);

    let (manager, mut notifications) = ConnectionManager::new(config);

    match mode {
        Mode::Listen => {
            info!("waiting for a peer; press Ctrl-C to quit");
            manager.start().await;
        }
        Mode::Connect(addr) => {
            info!(%addr, "dialling peer; press Ctrl-C to quit");
            manager.connect_to(addr).await;
        }
    }

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown signal received");
                manager.stop().await;
                break;
            }

            note = notifications.recv() => {
                let Some(note) = note else { break };
                match note {
                    Notification::StateChanged(state) => {
                        println!("[link {state}]");
                        // In listen mode the accept is single-shot, so
                        // re-arm whenever the link falls back to rest.
                        if state == ConnectionState::Idle && listen_mode {
                            manager.start().await;
                        }
                    }
                    Notification::PeerIdentified(peer) => {
                        println!("[connected to {peer}]");
                    }
                    Notification::BytesReceived(bytes) => {
                        println!("peer: {}", String::from_utf8_lossy(&bytes));
                    }
                    Notification::BytesSent(bytes) => {
                        debug!(len = bytes.len(), "payload delivered");
                    }
                    Notification::TransientError(msg) => {
                        warn!("{msg}");
                    }
                }
            }

            line = stdin.next_line() => {
                match line {
                    Ok(Some(text)) => {
                        // The core's contract: check the state before writing.
                        if manager.state() != ConnectionState::Connected {
                            println!("[not connected — message not sent]");
                            continue;
                        }
                        manager.write(text.into_bytes()).await;
                    }
                    Ok(None) => {
                        // stdin closed (EOF): wind the link down.
                        manager.stop().await;
                        break;
                    }
                    Err(e) => {
                        warn!("stdin read failed: {e}");
                        break;
                    }
                }
            }
        }
    }

    info!("peerlink-chat stopped");
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
