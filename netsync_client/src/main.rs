//! Standalone client binary.
//!
//! Usage:
//!   cargo run -p netsync_client -- [--addr 127.0.0.1:40100] [--kind vr]
//!       [--keep-local] [--channel netsync] [--wander] [--config netsync.json]
//!
//! The client connects to the server, joins the session, mirrors the demo
//! scene and pushes its own player's movement. With `--wander` the player
//! takes a random step every second.
//!
//! Console commands:
//!   status                  - Show client status
//!   spawn <prefab> [owned]  - Ask the server to spawn a prefab
//!   destroy <entity>        - Ask the server to destroy an entity
//!   rpc <entity> <method>   - Call a parameterless server rpc
//!   say <text>              - Custom message to the server
//!   sendfile <path> [dest]  - Send a file to the server
//!   quit                    - Disconnect and exit

use std::env;
use std::io::{BufRead, Write};
use std::time::{Duration, Instant};

use anyhow::Context;
use netsync_client::{ClientState, ReplicationClient};
use netsync_shared::{
    config::{ClientKind, NetConfig},
    demo::{demo_prefabs, demo_scene},
    event::{CustomMessage, FileReceived},
    math::Vec3,
    net::TcpClientTransport,
};
use rand::Rng;
use tokio::sync::mpsc;
use tracing::{info, warn};

struct Args {
    cfg: NetConfig,
    wander: bool,
}

fn parse_args() -> anyhow::Result<Args> {
    let args: Vec<String> = env::args().collect();
    let mut cfg = match args.iter().position(|a| a == "--config") {
        Some(i) if i + 1 < args.len() => NetConfig::load(&args[i + 1])?,
        _ => NetConfig::default(),
    };
    let mut wander = false;
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--addr" if i + 1 < args.len() => {
                cfg.server_addr = args[i + 1].clone();
                i += 2;
            }
            "--kind" if i + 1 < args.len() => {
                cfg.client_kind = args[i + 1]
                    .parse::<ClientKind>()
                    .context("parse --kind")?;
                i += 2;
            }
            "--channel" if i + 1 < args.len() => {
                cfg.channel = args[i + 1].clone();
                i += 2;
            }
            "--keep-local" => {
                cfg.ignore_server_spawn_data = true;
                i += 1;
            }
            "--wander" => {
                wander = true;
                i += 1;
            }
            _ => i += 1,
        }
    }
    Ok(Args { cfg, wander })
}

/// Moves the local player by a random step on the ground plane.
fn wander_step(client: &mut ReplicationClient, rng: &mut impl Rng) {
    let Some(node) = client.local_player() else {
        return;
    };
    let step = Vec3::new(rng.gen_range(-0.5..=0.5), 0.0, rng.gen_range(-0.5..=0.5));
    if let Some(n) = client.world_mut().node_mut(node) {
        n.local.position = n.local.position + step;
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let Args { cfg, wander } = parse_args()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| cfg.log_filter.as_str().into()),
        )
        .init();

    info!(server = %cfg.server_addr, kind = ?cfg.client_kind, "Starting client");

    let addr = cfg.server_addr.parse().context("parse server_addr")?;
    let transport = TcpClientTransport::connect(addr).await.context("connect")?;
    let tick_interval = cfg.tick_interval();
    let mut client =
        ReplicationClient::new(cfg, Box::new(transport), demo_prefabs(), demo_scene())
            .context("create client")?;

    // Set up console input channel.
    let (console_tx, mut console_rx) = mpsc::channel::<String>(32);

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

    println!("Client started. Type 'status' for info, 'quit' to exit.");
    println!();

    let mut rng = rand::thread_rng();
    let mut last_frame = Instant::now();
    let mut last_step = Instant::now();

    loop {
        // Process console commands.
        while let Ok(line) = console_rx.try_recv() {
            for out in client.exec_console(&line) {
                println!("{out}");
            }
        }

        client.poll();

        for msg in client.events().drain::<CustomMessage>() {
            println!("[server] {}", String::from_utf8_lossy(&msg.payload));
        }
        for file in client.events().drain::<FileReceived>() {
            info!(path = %file.path.display(), hash = %file.hash, "File received");
        }

        if client.state() == ClientState::Disconnected {
            println!("Disconnected from server.");
            break;
        }

        if wander && client.is_ready() && last_step.elapsed() >= Duration::from_secs(1) {
            wander_step(&mut client, &mut rng);
            last_step = Instant::now();
        }

        let now = Instant::now();
        client.update(now.duration_since(last_frame).as_secs_f32());
        last_frame = now;

        if client.queued_file_chunks() > 1000 {
            warn!(chunks = client.queued_file_chunks(), "File queue is backing up");
        }

        tokio::time::sleep(tick_interval).await;
    }

    Ok(())
}
