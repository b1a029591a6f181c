//! Replication server.
//!
//! The authority side of a session. It supports:
//! - Handshake (assign connection id, receive client category, spawn player)
//! - Initial state for late joiners
//! - Differential broadcasts on a fixed interval
//! - Spawn / destroy / change requests behind the ownership gate
//! - Entity RPCs, custom messages and paced file transfer
//!
//! Everything runs on the caller's task: transport events are only handled
//! inside `poll`, and nothing here blocks.

use std::{
    collections::{BTreeMap, BTreeSet},
    path::PathBuf,
    time::Instant,
};

use anyhow::Context;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use netsync_shared::{
    behaviour::{OutgoingRpc, Role, RpcTarget},
    codec::{deserialize, serialize},
    config::{ClientKind, NetConfig},
    event::{CustomMessage, EventBus, FileReceived, PeerConnected, PeerDisconnected, PlayerSpawned},
    file_transfer::{split_file, FileAssembler, FileChunk, FilePump},
    message::{MessageRouter, MsgType, RouterRegistry, RouterSender, TransportKey},
    net::{ConnectionId, EntityId, Transport, TransportError, TransportEvent},
    rpc::{BehaviourCall, RpcError, RpcParams},
    spawn::{ChangeRequest, DestroyRequest, Handshake, PrefabRegistry, SpawnError, SpawnRequest},
    world::{NodeBuilder, World},
};
use tokio::{
    sync::{mpsc, watch},
    time::MissedTickBehavior,
};
use tracing::{debug, error, info, warn};

use crate::spawner::AuthoritySpawner;

/// A peer that completed the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub kind: ClientKind,
    pub connected_at: DateTime<Utc>,
    pub player: Option<EntityId>,
}

/// State reachable from router listeners.
struct ServerCore {
    cfg: NetConfig,
    transport: Box<dyn Transport>,
    sender: RouterSender,
    spawner: AuthoritySpawner,
    /// Transport-level connections still owing a handshake reply.
    pending: BTreeSet<ConnectionId>,
    peers: BTreeMap<ConnectionId, PeerInfo>,
    events: EventBus,
    files_out: FilePump<ConnectionId>,
    files_in: FileAssembler,
}

impl ServerCore {
    fn send(
        &mut self,
        to: ConnectionId,
        msg_type: MsgType,
        target: u64,
        payload: Bytes,
    ) -> Result<(), TransportError> {
        self.sender
            .send(self.transport.as_mut(), to, msg_type, target, payload)
            .inspect_err(|e| warn!(client_id = %to, ?msg_type, error = %e, "Send failed"))
    }

    fn peer_ids(&self) -> Vec<ConnectionId> {
        self.peers.keys().copied().collect()
    }

    fn is_peer(&self, from: ConnectionId, what: &str) -> bool {
        if self.peers.contains_key(&from) {
            return true;
        }
        error!(client_id = %from, what, "Message from a connection without handshake dropped");
        false
    }

    fn on_connect(&mut self, id: ConnectionId) {
        info!(client_id = %id, "Client connected, sending handshake");
        self.pending.insert(id);
        self.events.push(PeerConnected(id));
        let hs = Handshake {
            connection_id: id,
            ..Default::default()
        };
        match serialize(&hs, false) {
            Ok(bytes) => {
                let _ = self.send(id, MsgType::Handshake, 0, bytes);
            }
            Err(e) => error!(client_id = %id, error = %e, "Handshake encoding failed"),
        }
    }

    fn on_disconnect(&mut self, id: ConnectionId) {
        self.pending.remove(&id);
        let was_peer = self.peers.remove(&id).is_some();
        let player = self.spawner.despawn_client_player(id);
        let dropped = self.files_out.drop_target(&id);
        self.events.push(PeerDisconnected(id));
        info!(client_id = %id, was_peer, player = ?player, dropped_chunks = dropped, "Client disconnected");
    }

    fn on_handshake(&mut self, from: ConnectionId, payload: Bytes) {
        let hs: Handshake = match deserialize(&payload) {
            Ok(hs) => hs,
            Err(e) => {
                error!(client_id = %from, error = %e, "Malformed handshake dropped");
                return;
            }
        };
        if !self.pending.remove(&from) {
            if self.peers.contains_key(&from) {
                warn!(client_id = %from, "Repeated handshake ignored");
            } else {
                error!(client_id = %from, "Handshake from unknown connection dropped");
            }
            return;
        }

        let player = match self.spawner.spawn_client_player(from, hs.client_kind) {
            Ok(id) => Some(id),
            Err(e) => {
                error!(client_id = %from, kind = ?hs.client_kind, error = %e, "No player for client");
                None
            }
        };
        if let Some(entity) = player {
            if hs.init_data.is_empty() {
                self.events.push(PlayerSpawned {
                    connection: from,
                    entity,
                    kind: hs.client_kind,
                });
            } else if let Err(e) = self.spawner.apply_player_init(entity, &hs.init_data) {
                error!(client_id = %from, error = %e, "Player init data rejected");
            }
        }

        self.send_initial_state(&[from]);
        self.peers.insert(
            from,
            PeerInfo {
                kind: hs.client_kind,
                connected_at: Utc::now(),
                player,
            },
        );
        info!(client_id = %from, kind = ?hs.client_kind, player = ?player, "Client joined");
    }

    fn on_spawn_request(&mut self, from: ConnectionId, payload: Bytes) {
        if !self.is_peer(from, "spawn request") {
            return;
        }
        let req: SpawnRequest = match deserialize(&payload) {
            Ok(r) => r,
            Err(e) => {
                error!(client_id = %from, error = %e, "Malformed spawn request dropped");
                return;
            }
        };
        let owner = req.owned.then_some(from);
        match self.spawner.spawn_prefab(&req.prefab_key, owner) {
            Ok(id) => info!(client_id = %from, entity = %id, prefab = %req.prefab_key, "Spawned on request"),
            Err(e) => error!(client_id = %from, prefab = %req.prefab_key, error = %e, "Spawn request refused"),
        }
    }

    fn on_destroy_request(&mut self, from: ConnectionId, payload: Bytes) {
        if !self.is_peer(from, "destroy request") {
            return;
        }
        let req: DestroyRequest = match deserialize(&payload) {
            Ok(r) => r,
            Err(e) => {
                error!(client_id = %from, error = %e, "Malformed destroy request dropped");
                return;
            }
        };
        match self.spawner.may_destroy(req.id, from) {
            Ok(true) => {
                if let Err(e) = self.spawner.despawn(req.id) {
                    error!(client_id = %from, entity = %req.id, error = %e, "Destroy failed");
                }
            }
            Ok(false) => {
                error!(client_id = %from, entity = %req.id, "Destroy refused: requester does not own the entity")
            }
            Err(e) => error!(client_id = %from, entity = %req.id, error = %e, "Destroy request refused"),
        }
    }

    fn on_change_request(&mut self, from: ConnectionId, payload: Bytes) {
        if !self.is_peer(from, "change request") {
            return;
        }
        let req: ChangeRequest = match deserialize(&payload) {
            Ok(r) => r,
            Err(e) => {
                error!(client_id = %from, error = %e, "Malformed change request dropped");
                return;
            }
        };
        match self.spawner.apply_change(req.id, from, &req.state) {
            Ok(accepted) => debug!(client_id = %from, entity = %req.id, accepted, "Change request"),
            Err(e) => error!(client_id = %from, entity = %req.id, error = %e, "Change request dropped"),
        }
    }

    fn on_rpc(&mut self, entity: EntityId, from: ConnectionId, payload: Bytes) {
        let call = match BehaviourCall::decode(&payload) {
            Ok(c) => c,
            Err(e) => {
                error!(client_id = %from, %entity, error = %e, "Malformed rpc dropped");
                return;
            }
        };
        match self
            .spawner
            .world_mut()
            .dispatch_rpc(entity, Role::Authority, from, &call)
        {
            Ok(out) => self.flush_rpcs(out),
            Err(e) => error!(client_id = %from, %entity, error = %e, "Rpc refused"),
        }
    }

    fn on_custom(&mut self, from: ConnectionId, payload: Bytes) {
        debug!(client_id = %from, bytes = payload.len(), "Custom message");
        self.events.push(CustomMessage {
            sender: from,
            payload,
        });
    }

    fn on_file_chunk(&mut self, from: ConnectionId, payload: Bytes) {
        let chunk: FileChunk = match deserialize(&payload) {
            Ok(c) => c,
            Err(e) => {
                error!(client_id = %from, error = %e, "Malformed file chunk dropped");
                return;
            }
        };
        let hash = chunk.hash.clone();
        match self.files_in.accept(chunk) {
            Ok(Some(path)) => self.events.push(FileReceived {
                sender: from,
                hash,
                path,
            }),
            Ok(None) => {}
            Err(e) => error!(client_id = %from, %hash, error = %e, "File chunk rejected"),
        }
    }

    /// Sends calls queued by behaviours.
    fn flush_rpcs(&mut self, out: Vec<OutgoingRpc>) {
        for rpc in out {
            let payload = BehaviourCall {
                behaviour: rpc.behaviour,
                call: rpc.call,
            }
            .encode();
            let receivers = match rpc.target {
                RpcTarget::Peer(c) => vec![c],
                RpcTarget::AllPeers => self.peer_ids(),
                RpcTarget::Authority => {
                    error!(entity = %rpc.entity, "Authority cannot call itself, dropped");
                    continue;
                }
            };
            for to in receivers {
                let _ = self.send(to, MsgType::Rpc, rpc.entity.0, payload.clone());
            }
        }
    }

    fn send_initial_state(&mut self, receivers: &[ConnectionId]) {
        for to in receivers {
            let state = self.spawner.build_initial_state(*to);
            let records = state.records.len();
            match serialize(&state, false) {
                Ok(bytes) => {
                    if self.send(*to, MsgType::InitialState, 0, bytes).is_ok() {
                        debug!(client_id = %to, records, "Initial state sent");
                    }
                }
                Err(e) => error!(client_id = %to, error = %e, "Initial state encoding failed"),
            }
        }
    }

    fn broadcast_update(&mut self, receivers: &[ConnectionId]) {
        let (update, outbox) = self.spawner.build_update(!receivers.is_empty());
        if !update.is_empty() && !receivers.is_empty() {
            match serialize(&update, false) {
                Ok(bytes) => {
                    for to in receivers {
                        let _ = self.send(*to, MsgType::StateUpdate, 0, bytes.clone());
                    }
                    debug!(
                        receivers = receivers.len(),
                        spawns = update.spawns.len(),
                        destroys = update.destroys.len(),
                        deltas = update.deltas.len(),
                        "Update broadcast"
                    );
                }
                Err(e) => error!(error = %e, "Update encoding failed"),
            }
        }
        self.flush_rpcs(outbox);
    }

    fn pump_files(&mut self, now: Instant) {
        let Some((to, chunk)) = self.files_out.next_due(now) else {
            return;
        };
        match serialize(&chunk, false) {
            Ok(bytes) => {
                let _ = self.send(to, MsgType::FileChunk, 0, bytes);
            }
            Err(e) => error!(client_id = %to, error = %e, "File chunk encoding failed"),
        }
    }
}

/// Authoritative replication server.
pub struct ReplicationServer {
    router: MessageRouter<ServerCore>,
    core: ServerCore,
    rpc_targets: BTreeSet<EntityId>,
    running: bool,
    quit_requested: bool,
    /// Channel for console commands from stdin.
    console_rx: Option<mpsc::Receiver<String>>,
}

impl ReplicationServer {
    /// Creates a server on its own router registry.
    pub fn new(
        cfg: NetConfig,
        transport: Box<dyn Transport>,
        prefabs: PrefabRegistry,
        scene: Vec<NodeBuilder>,
    ) -> anyhow::Result<Self> {
        let registry = RouterRegistry::new();
        let key = registry.register_transport();
        Self::with_registry(cfg, transport, prefabs, scene, &registry, key)
    }

    /// Creates a server whose router is bound to `channel` on a transport
    /// shared with other routers of the same session.
    pub fn with_registry(
        cfg: NetConfig,
        transport: Box<dyn Transport>,
        prefabs: PrefabRegistry,
        scene: Vec<NodeBuilder>,
        registry: &RouterRegistry,
        key: TransportKey,
    ) -> anyhow::Result<Self> {
        cfg.validate().context("validate config")?;
        let router =
            MessageRouter::bind(registry, key, &cfg.channel).context("bind server router")?;

        let mut spawner = AuthoritySpawner::new(prefabs);
        let outbox = spawner
            .initialize_scene(scene)
            .context("initialise scene")?;
        if cfg.server_is_player {
            spawner
                .spawn_server_player(cfg.client_kind)
                .context("spawn server player")?;
        }

        let core = ServerCore {
            sender: router.sender(),
            files_out: FilePump::new(cfg.file_send_interval()),
            files_in: FileAssembler::new(PathBuf::from(&cfg.file_dir)),
            cfg,
            transport,
            spawner,
            pending: BTreeSet::new(),
            peers: BTreeMap::new(),
            events: EventBus::default(),
        };
        let mut server = Self {
            router,
            core,
            rpc_targets: BTreeSet::new(),
            running: true,
            quit_requested: false,
            console_rx: None,
        };
        server.register_listeners();
        server.sync_rpc_listeners();
        server.core.flush_rpcs(outbox);
        info!(channel = %server.core.cfg.channel, "Replication server ready");
        Ok(server)
    }

    fn register_listeners(&mut self) {
        self.router
            .add_listener(MsgType::Handshake, 0, ServerCore::on_handshake);
        self.router
            .add_listener(MsgType::SpawnRequest, 0, ServerCore::on_spawn_request);
        self.router
            .add_listener(MsgType::DestroyRequest, 0, ServerCore::on_destroy_request);
        self.router
            .add_listener(MsgType::ChangeRequest, 0, ServerCore::on_change_request);
        self.router
            .add_listener(MsgType::Custom, 0, ServerCore::on_custom);
        self.router
            .add_listener(MsgType::FileChunk, 0, ServerCore::on_file_chunk);
    }

    /// Keeps one RPC listener per live entity, keyed by its id.
    fn sync_rpc_listeners(&mut self) {
        let live: BTreeSet<EntityId> = self
            .core
            .spawner
            .world()
            .entity_ids()
            .into_iter()
            .collect();
        for gone in self.rpc_targets.difference(&live) {
            self.router.remove_listeners(MsgType::Rpc, gone.0);
        }
        for added in live.difference(&self.rpc_targets) {
            let id = *added;
            self.router
                .add_listener(MsgType::Rpc, id.0, move |core: &mut ServerCore, from, payload| {
                    core.on_rpc(id, from, payload)
                });
        }
        self.rpc_targets = live;
    }

    pub fn config(&self) -> &NetConfig {
        &self.core.cfg
    }

    pub fn world(&self) -> &World {
        self.core.spawner.world()
    }

    pub fn world_mut(&mut self) -> &mut World {
        self.core.spawner.world_mut()
    }

    pub fn spawner(&self) -> &AuthoritySpawner {
        &self.core.spawner
    }

    pub fn spawner_mut(&mut self) -> &mut AuthoritySpawner {
        &mut self.core.spawner
    }

    /// Session notifications, drained by the host application.
    pub fn events(&mut self) -> &mut EventBus {
        &mut self.core.events
    }

    pub fn peers(&self) -> impl Iterator<Item = (ConnectionId, &PeerInfo)> {
        self.core.peers.iter().map(|(c, p)| (*c, p))
    }

    pub fn peer_ids(&self) -> Vec<ConnectionId> {
        self.core.peer_ids()
    }

    pub fn pending_handshakes(&self) -> usize {
        self.core.pending.len()
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Sets the console input receiver.
    pub fn set_console_input(&mut self, rx: mpsc::Receiver<String>) {
        self.console_rx = Some(rx);
    }

    /// Handles every transport event that arrived since the last call.
    pub fn poll(&mut self) {
        if !self.running {
            return;
        }
        self.sync_rpc_listeners();
        for event in self.core.transport.poll() {
            match event {
                TransportEvent::Connect(id) => self.core.on_connect(id),
                TransportEvent::Disconnect(id) => self.core.on_disconnect(id),
                TransportEvent::Data(id, raw) => {
                    self.router.handle_data(&mut self.core, id, &raw);
                }
            }
        }
        self.sync_rpc_listeners();
    }

    /// Broadcasts to every peer that completed the handshake.
    pub fn broadcast_now(&mut self) {
        let receivers = self.core.peer_ids();
        self.broadcast_update(&receivers);
    }

    pub fn broadcast_update(&mut self, receivers: &[ConnectionId]) {
        if !self.running {
            return;
        }
        self.core.broadcast_update(receivers);
        self.sync_rpc_listeners();
    }

    pub fn send_initial_state(&mut self, receivers: &[ConnectionId]) {
        self.core.send_initial_state(receivers);
    }

    pub fn spawn(
        &mut self,
        tree: NodeBuilder,
        owner: Option<ConnectionId>,
    ) -> Result<EntityId, SpawnError> {
        let id = self.core.spawner.spawn(tree, owner)?;
        self.sync_rpc_listeners();
        Ok(id)
    }

    pub fn spawn_prefab(
        &mut self,
        key: &str,
        owner: Option<ConnectionId>,
    ) -> Result<EntityId, SpawnError> {
        let id = self.core.spawner.spawn_prefab(key, owner)?;
        self.sync_rpc_listeners();
        Ok(id)
    }

    pub fn despawn(&mut self, id: EntityId) -> Result<(), SpawnError> {
        self.core.spawner.despawn(id).inspect_err(|e| {
            error!(entity = %id, error = %e, "Despawn refused");
        })?;
        self.sync_rpc_listeners();
        Ok(())
    }

    /// Calls a method on one peer's copy of a behaviour.
    pub fn invoke_client_rpc<A: RpcParams>(
        &mut self,
        entity: EntityId,
        behaviour: usize,
        receiver: ConnectionId,
        name: &str,
        args: A,
    ) -> Result<(), RpcError> {
        let out = self.core.spawner.world_mut().with_context(
            entity,
            behaviour,
            Role::Authority,
            |ctx| ctx.invoke_client_rpc(receiver, name, args),
        )?;
        self.core.flush_rpcs(out);
        Ok(())
    }

    /// Calls a method on every peer's copy of a behaviour.
    pub fn invoke_client_rpc_on_all<A: RpcParams>(
        &mut self,
        entity: EntityId,
        behaviour: usize,
        name: &str,
        args: A,
    ) -> Result<(), RpcError> {
        let out = self.core.spawner.world_mut().with_context(
            entity,
            behaviour,
            Role::Authority,
            |ctx| ctx.invoke_client_rpc_on_all(name, args),
        )?;
        self.core.flush_rpcs(out);
        Ok(())
    }

    pub fn send_custom(
        &mut self,
        receiver: ConnectionId,
        payload: Bytes,
    ) -> Result<(), TransportError> {
        self.core.send(receiver, MsgType::Custom, 0, payload)
    }

    /// Sends to every peer; returns how many sends succeeded.
    pub fn send_custom_to_all(&mut self, payload: Bytes) -> usize {
        self.core
            .peer_ids()
            .into_iter()
            .filter(|to| self.core.send(*to, MsgType::Custom, 0, payload.clone()).is_ok())
            .count()
    }

    /// Queues a file for `receiver`. Chunks go out one per send interval.
    pub fn send_file(&mut self, receiver: ConnectionId, data: &[u8], dest_path: &str) -> usize {
        let chunks = split_file(data, dest_path, self.core.cfg.file_chunk_size);
        let count = chunks.len();
        self.core.files_out.enqueue(receiver, chunks);
        info!(client_id = %receiver, dest = dest_path, chunks = count, "File queued");
        count
    }

    /// Sends the next file chunk if one is due.
    pub fn pump_files(&mut self, now: Instant) {
        self.core.pump_files(now);
    }

    /// Stops the session: no further polling or broadcasting, every queue
    /// and table cleared.
    pub fn stop(&mut self) {
        if !self.running {
            return;
        }
        self.running = false;
        self.core.spawner.clear();
        self.core.pending.clear();
        self.core.peers.clear();
        self.core.files_out.clear();
        self.core.events.clear();
        self.sync_rpc_listeners();
        info!("Replication server stopped");
    }

    fn process_console_commands(&mut self) {
        let lines: Vec<String> = if let Some(ref mut rx) = self.console_rx {
            let mut collected = Vec::new();
            while let Ok(line) = rx.try_recv() {
                collected.push(line);
            }
            collected
        } else {
            Vec::new()
        };

        for line in lines {
            for out in self.exec_console(&line) {
                info!("{out}");
            }
        }
    }

    /// Executes a console command.
    pub fn exec_console(&mut self, line: &str) -> Vec<String> {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.is_empty() {
            return Vec::new();
        }

        match tokens[0] {
            "status" => {
                let now = Utc::now();
                let mut out = vec![
                    format!("Entities: {}", self.world().entity_ids().len()),
                    format!("Pending handshakes: {}", self.pending_handshakes()),
                    format!("Clients: {}", self.core.peers.len()),
                ];
                for (id, peer) in &self.core.peers {
                    out.push(format!(
                        "  {id}: kind={:?} player={:?} connected {}s",
                        peer.kind,
                        peer.player,
                        (now - peer.connected_at).num_seconds()
                    ));
                }
                out
            }
            "spawn" => {
                let Some(key) = tokens.get(1) else {
                    return vec!["Usage: spawn <prefab> [owner]".to_string()];
                };
                let owner = tokens
                    .get(2)
                    .and_then(|o| o.parse().ok())
                    .map(ConnectionId);
                match self.spawn_prefab(key, owner) {
                    Ok(id) => vec![format!("Spawned {key} as {id}")],
                    Err(e) => vec![format!("Spawn failed: {e}")],
                }
            }
            "despawn" => {
                let Some(id) = tokens.get(1).and_then(|t| t.parse().ok()).map(EntityId) else {
                    return vec!["Usage: despawn <entity>".to_string()];
                };
                match self.despawn(id) {
                    Ok(()) => vec![format!("Despawn of {id} queued")],
                    Err(e) => vec![format!("Despawn failed: {e}")],
                }
            }
            "say" => {
                let text = tokens[1..].join(" ");
                let sent = self.send_custom_to_all(Bytes::from(text.into_bytes()));
                vec![format!("Sent to {sent} client(s)")]
            }
            "sendfile" => {
                let (Some(to), Some(path)) = (
                    tokens.get(1).and_then(|t| t.parse().ok()).map(ConnectionId),
                    tokens.get(2),
                ) else {
                    return vec!["Usage: sendfile <client> <path> [dest]".to_string()];
                };
                let dest = tokens.get(3).copied().unwrap_or(*path);
                match std::fs::read(path) {
                    Ok(data) => {
                        let chunks = self.send_file(to, &data, dest);
                        vec![format!("Queued {chunks} chunk(s) for {to}")]
                    }
                    Err(e) => vec![format!("Cannot read {path}: {e}")],
                }
            }
            "quit" | "exit" => {
                info!("Server shutting down");
                self.quit_requested = true;
                Vec::new()
            }
            other => vec![format!("Unknown command: {other}")],
        }
    }

    /// Drives the session until `shutdown` flips to true or `quit` is typed:
    /// transport polling at `tick_hz`, broadcasts every `update_interval_ms`.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let mut poll = tokio::time::interval(self.core.cfg.tick_interval());
        poll.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut broadcast = tokio::time::interval(self.core.cfg.update_interval());
        broadcast.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            tick_hz = self.core.cfg.tick_hz,
            update_ms = self.core.cfg.update_interval_ms,
            "Replication server running"
        );
        while self.running && !self.quit_requested {
            tokio::select! {
                _ = poll.tick() => {
                    self.process_console_commands();
                    self.poll();
                    self.pump_files(Instant::now());
                }
                _ = broadcast.tick() => self.broadcast_now(),
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        self.stop();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use netsync_shared::{
        demo::{demo_prefabs, demo_scene, Lamp, LAMP_PREFAB},
        loopback::{LoopbackHub, LoopbackPeer},
        message::Envelope,
        spawn::{InitialState, StateUpdate},
    };

    fn server(hub: &LoopbackHub, cfg: NetConfig) -> ReplicationServer {
        ReplicationServer::new(cfg, Box::new(hub.host()), demo_prefabs(), demo_scene()).unwrap()
    }

    fn frames(peer: &mut LoopbackPeer) -> Vec<Envelope> {
        peer.poll()
            .into_iter()
            .filter_map(|ev| match ev {
                TransportEvent::Data(_, raw) => Some(Envelope::decode(&raw).unwrap()),
                _ => None,
            })
            .collect()
    }

    fn reply(peer: &mut LoopbackPeer, msg_type: MsgType, target: u64, payload: Bytes) {
        let env = Envelope {
            channel: "netsync".into(),
            msg_type: msg_type as u8,
            target,
            payload,
        };
        peer.send(env.encode(), ConnectionId::AUTHORITY).unwrap();
    }

    fn join(server: &mut ReplicationServer, peer: &mut LoopbackPeer) -> InitialState {
        server.poll();
        let hs = frames(peer);
        assert_eq!(hs[0].msg_type, MsgType::Handshake as u8);
        let assigned: Handshake = deserialize(&hs[0].payload).unwrap();
        assert_eq!(assigned.connection_id, peer.id());

        let answer = Handshake {
            connection_id: assigned.connection_id,
            client_kind: ClientKind::Vr,
            init_data: Vec::new(),
        };
        reply(peer, MsgType::Handshake, 0, serialize(&answer, false).unwrap());
        server.poll();
        let init = frames(peer);
        assert_eq!(init[0].msg_type, MsgType::InitialState as u8);
        deserialize(&init[0].payload).unwrap()
    }

    #[test]
    fn handshake_then_initial_state() {
        let hub = LoopbackHub::new();
        let mut server = server(&hub, NetConfig::default());
        let mut peer = hub.connect();

        let state = join(&mut server, &mut peer);
        assert_eq!(server.peer_ids(), [peer.id()]);
        assert_eq!(server.pending_handshakes(), 0);
        // Own player plus two scene objects.
        assert_eq!(state.records.len(), 3);

        let spawned = server.events().drain::<PlayerSpawned>();
        assert_eq!(spawned.len(), 1);
        assert_eq!(spawned[0].kind, ClientKind::Vr);
    }

    #[test]
    fn requests_before_handshake_are_dropped() {
        let hub = LoopbackHub::new();
        let mut server = server(&hub, NetConfig::default());
        let mut peer = hub.connect();
        server.poll();
        frames(&mut peer);

        let req = SpawnRequest {
            prefab_key: LAMP_PREFAB.into(),
            owned: true,
        };
        reply(&mut peer, MsgType::SpawnRequest, 0, serialize(&req, false).unwrap());
        server.poll();
        assert_eq!(server.world().entity_ids().len(), 2);
    }

    #[test]
    fn spawn_request_goes_out_with_next_broadcast() {
        let hub = LoopbackHub::new();
        let mut server = server(&hub, NetConfig::default());
        let mut peer = hub.connect();
        join(&mut server, &mut peer);

        let req = SpawnRequest {
            prefab_key: LAMP_PREFAB.into(),
            owned: true,
        };
        reply(&mut peer, MsgType::SpawnRequest, 0, serialize(&req, false).unwrap());
        server.poll();
        server.broadcast_now();

        let update: StateUpdate = frames(&mut peer)
            .into_iter()
            .find(|e| e.msg_type == MsgType::StateUpdate as u8)
            .map(|e| deserialize(&e.payload).unwrap())
            .unwrap();
        // The peer's own player and the requested lamp.
        assert_eq!(update.spawns.len(), 2);
        let lamp = &update.spawns[1];
        assert_eq!(lamp.prefab_key, LAMP_PREFAB);
        assert_eq!(server.world().get(lamp.id).unwrap().owner, peer.id());
    }

    #[test]
    fn rpc_from_peer_runs_on_authority_and_answers_everyone() {
        let hub = LoopbackHub::new();
        let mut server = server(&hub, NetConfig::default());
        let mut peer = hub.connect();
        join(&mut server, &mut peer);

        let door = EntityId(1);
        let toggle = BehaviourCall {
            behaviour: 0,
            call: netsync_shared::rpc::RpcCall {
                hash: netsync_shared::rpc::signature_hash("toggle", &[]),
                args: Vec::new(),
            },
        };
        reply(&mut peer, MsgType::Rpc, door.0, toggle.encode());
        server.poll();

        assert!(*server.world().get(door).unwrap().behaviour::<Lamp>().unwrap().on.get());
        let flashes: Vec<_> = frames(&mut peer)
            .into_iter()
            .filter(|e| e.msg_type == MsgType::Rpc as u8 && e.target == door.0)
            .collect();
        assert_eq!(flashes.len(), 1);
    }

    #[test]
    fn disconnect_despawns_player() {
        let hub = LoopbackHub::new();
        let mut server = server(&hub, NetConfig::default());
        let mut peer = hub.connect();
        join(&mut server, &mut peer);
        server.broadcast_now();
        let player = server.spawner().player_of(peer.id()).unwrap();

        drop(peer);
        server.poll();
        assert!(server.peer_ids().is_empty());
        assert_eq!(server.spawner().pending_destroys().last(), Some(&player));
        assert_eq!(server.events().drain::<PeerDisconnected>().len(), 1);
    }

    #[test]
    fn server_player_is_spawned_up_front() {
        let hub = LoopbackHub::new();
        let cfg = NetConfig {
            server_is_player: true,
            ..Default::default()
        };
        let server = server(&hub, cfg);
        let id = server.spawner().server_player().unwrap();
        assert_eq!(id, EntityId(3));
        assert_eq!(server.world().get(id).unwrap().owner, ConnectionId::AUTHORITY);
    }

    #[test]
    fn stop_clears_everything() {
        let hub = LoopbackHub::new();
        let mut server = server(&hub, NetConfig::default());
        let mut peer = hub.connect();
        join(&mut server, &mut peer);
        server.stop();
        assert!(!server.is_running());
        assert!(server.world().is_empty());
        assert!(server.peer_ids().is_empty());
    }

    #[test]
    fn console_spawn_and_status() {
        let hub = LoopbackHub::new();
        let mut server = server(&hub, NetConfig::default());
        let out = server.exec_console("spawn lamp");
        assert_eq!(out, ["Spawned lamp as #3"]);
        assert!(server.exec_console("status")[0].starts_with("Entities:"));
        assert!(server.exec_console("despawn 99")[0].starts_with("Despawn failed"));
    }
}
