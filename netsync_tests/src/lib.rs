//! Test harness: an authority and any number of peers wired together over
//! an in-memory loopback hub, driven step by step.

use std::path::PathBuf;

use netsync_client::ReplicationClient;
use netsync_server::ReplicationServer;
use netsync_shared::{
    config::{ClientKind, NetConfig},
    demo::{demo_prefabs, demo_scene},
    loopback::LoopbackHub,
};

/// Poll rounds per `pump`. One round moves a message one hop.
const PUMP_ROUNDS: usize = 4;

/// Installs the test log subscriber once.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("info")
        .with_test_writer()
        .try_init();
}

/// Fresh directory below the system temp dir.
pub fn scratch_dir(tag: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("netsync-it-{tag}-{}", std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    dir
}

/// Authority plus peers on the demo scene.
pub struct Session {
    pub hub: LoopbackHub,
    pub server: ReplicationServer,
    pub clients: Vec<ReplicationClient>,
    client_cfg: NetConfig,
}

impl Session {
    pub fn new(server_cfg: NetConfig, client_cfg: NetConfig) -> anyhow::Result<Self> {
        init_tracing();
        let hub = LoopbackHub::new();
        let server =
            ReplicationServer::new(server_cfg, Box::new(hub.host()), demo_prefabs(), demo_scene())?;
        Ok(Self {
            hub,
            server,
            clients: Vec::new(),
            client_cfg,
        })
    }

    /// Session with default configs on both sides.
    pub fn demo() -> anyhow::Result<Self> {
        Self::new(NetConfig::default(), NetConfig::default())
    }

    /// Connects a peer of `kind` and drives it through the join. Returns
    /// its index in `clients`.
    pub fn join(&mut self, kind: ClientKind) -> anyhow::Result<usize> {
        let cfg = NetConfig {
            client_kind: kind,
            ..self.client_cfg.clone()
        };
        let client =
            ReplicationClient::new(cfg, Box::new(self.hub.connect()), demo_prefabs(), demo_scene())?;
        self.clients.push(client);
        self.pump();
        Ok(self.clients.len() - 1)
    }

    /// Lets every queued message travel: polls the authority and every
    /// peer a few times.
    pub fn pump(&mut self) {
        for _ in 0..PUMP_ROUNDS {
            self.server.poll();
            for c in &mut self.clients {
                c.poll();
            }
        }
    }

    /// Runs one peer frame on every client, then lets the traffic settle.
    pub fn frame(&mut self, dt: f32) {
        for c in &mut self.clients {
            c.update(dt);
        }
        self.pump();
    }

    /// One authority broadcast, delivered.
    pub fn broadcast(&mut self) {
        self.pump();
        self.server.broadcast_now();
        self.pump();
    }

    pub fn client(&mut self, index: usize) -> &mut ReplicationClient {
        &mut self.clients[index]
    }
}
