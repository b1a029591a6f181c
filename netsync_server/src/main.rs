//! Standalone server binary.
//!
//! Usage:
//!   cargo run -p netsync_server -- [--addr 127.0.0.1:40100] [--tick-hz 60]
//!       [--update-ms 100] [--channel netsync] [--player] [--config netsync.json]
//!
//! The server listens for client connections, handshakes them, sends the
//! initial state and broadcasts differential updates of the demo scene.
//!
//! Console commands:
//!   status                          - Show connected clients
//!   spawn <prefab> [owner]          - Spawn a prefab (lamp, crate, player)
//!   despawn <entity>                - Queue a despawn
//!   say <text>                      - Custom message to every client
//!   sendfile <client> <path> [dest] - Send a file to one client
//!   quit                            - Shutdown server

use std::env;
use std::io::{BufRead, Write};

use anyhow::Context;
use netsync_server::ReplicationServer;
use netsync_shared::{
    config::NetConfig,
    demo::{demo_prefabs, demo_scene},
    net::TcpServerTransport,
};
use tokio::sync::{mpsc, watch};
use tracing::info;

fn parse_args() -> anyhow::Result<NetConfig> {
    let args: Vec<String> = env::args().collect();
    let mut cfg = match args.iter().position(|a| a == "--config") {
        Some(i) if i + 1 < args.len() => NetConfig::load(&args[i + 1])?,
        _ => NetConfig::default(),
    };
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--addr" if i + 1 < args.len() => {
                cfg.server_addr = args[i + 1].clone();
                i += 2;
            }
            "--tick-hz" if i + 1 < args.len() => {
                cfg.tick_hz = args[i + 1].parse().unwrap_or(60);
                i += 2;
            }
            "--update-ms" if i + 1 < args.len() => {
                cfg.update_interval_ms = args[i + 1].parse().unwrap_or(100);
                i += 2;
            }
            "--channel" if i + 1 < args.len() => {
                cfg.channel = args[i + 1].clone();
                i += 2;
            }
            "--player" => {
                cfg.server_is_player = true;
                i += 1;
            }
            _ => i += 1,
        }
    }
    Ok(cfg)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = parse_args()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| cfg.log_filter.as_str().into()),
        )
        .init();

    info!(addr = %cfg.server_addr, tick_hz = cfg.tick_hz, channel = %cfg.channel, "Starting server");

    let addr = cfg.server_addr.parse().context("parse server_addr")?;
    let transport = TcpServerTransport::bind(addr).await?;
    info!(local = %transport.local_addr(), "Server listening");

    let mut server =
        ReplicationServer::new(cfg, Box::new(transport), demo_prefabs(), demo_scene())
            .context("create server")?;

    // Set up console input channel.
    let (console_tx, console_rx) = mpsc::channel::<String>(32);
    server.set_console_input(console_rx);

    // Spawn stdin reader thread.
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        let mut stdout = std::io::stdout();
        loop {
            print!("] ");
            let _ = stdout.flush();
            let mut line = String::new();
            match stdin.lock().read_line(&mut line) {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
            let line = line.trim().to_string();
            if !line.is_empty() && console_tx.blocking_send(line).is_err() {
                break;
            }
        }
    });

    println!("Server ready. Type 'status' for info, 'spawn lamp' to spawn, 'quit' to exit.");
    println!();

    // Kept alive for the lifetime of the run; `quit` ends the loop instead.
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    server.run(shutdown_rx).await
}
