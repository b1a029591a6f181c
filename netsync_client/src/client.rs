//! Replication client.
//!
//! The peer side of a session:
//! - answers the authority's handshake with its category (and optionally
//!   its own player state),
//! - applies the initial state once, then every differential update,
//! - interpolates remote entities that ask for it,
//! - pushes changes of its own player as change requests,
//! - sends spawn / destroy requests, entity RPCs, custom messages and files.
//!
//! Like the server, nothing here blocks: transport events are handled in
//! `poll`, time-based work in `update`.

use std::{collections::BTreeSet, path::PathBuf, time::Instant};

use anyhow::Context;
use bytes::Bytes;
use netsync_shared::{
    behaviour::{OutgoingRpc, Role, RpcTarget},
    codec::{deserialize, serialize},
    config::NetConfig,
    event::{
        CustomMessage, EventBus, FileReceived, InitialStateApplied, PeerConnected,
        PeerDisconnected,
    },
    file_transfer::{split_file, FileAssembler, FileChunk, FilePump},
    message::{MessageRouter, MsgType, RouterRegistry, RouterSender, TransportKey},
    net::{ConnectionId, EntityId, Transport, TransportError, TransportEvent},
    rpc::{BehaviourCall, RpcError, RpcParams},
    spawn::{
        ChangeRequest, DestroyRequest, Handshake, InitialState, PrefabRegistry, SpawnRequest,
        StateUpdate,
    },
    world::{NodeBuilder, NodeId, World},
};
use tracing::{debug, error, info, warn};

use crate::{
    interp::{lerp_parts, Interpolator},
    spawner::{Applied, PeerSpawner},
};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// Transport up, waiting for the authority's handshake.
    Connecting,
    /// Handshake answered, waiting for the initial state.
    Joining,
    /// Initial state applied; updates are live.
    Ready,
    /// Authority gone or session stopped.
    Disconnected,
}

/// State reachable from router listeners.
struct ClientCore {
    cfg: NetConfig,
    transport: Box<dyn Transport>,
    sender: RouterSender,
    state: ClientState,
    connection_id: Option<ConnectionId>,
    spawner: PeerSpawner,
    interp: Interpolator,
    events: EventBus,
    files_out: FilePump<ConnectionId>,
    files_in: FileAssembler,
}

impl ClientCore {
    fn send(&mut self, msg_type: MsgType, target: u64, payload: Bytes) -> Result<(), TransportError> {
        self.sender
            .send(
                self.transport.as_mut(),
                ConnectionId::AUTHORITY,
                msg_type,
                target,
                payload,
            )
            .inspect_err(|e| warn!(?msg_type, error = %e, "Send failed"))
    }

    fn on_handshake(&mut self, from: ConnectionId, payload: Bytes) {
        if !from.is_authority() {
            error!(sender = %from, "Handshake from a non-authority sender dropped");
            return;
        }
        let hs: Handshake = match deserialize(&payload) {
            Ok(hs) => hs,
            Err(e) => {
                error!(error = %e, "Malformed handshake dropped");
                return;
            }
        };
        if self.state != ClientState::Connecting {
            warn!(state = ?self.state, "Handshake while already running, ignored");
            return;
        }

        let init_data = if self.cfg.ignore_server_spawn_data {
            match self.spawner.player_init_data() {
                Ok(data) => data,
                Err(e) => {
                    error!(error = %e, "Player state serialization failed");
                    Vec::new()
                }
            }
        } else {
            Vec::new()
        };
        let answer = Handshake {
            connection_id: hs.connection_id,
            client_kind: self.cfg.client_kind,
            init_data,
        };
        match serialize(&answer, false) {
            Ok(bytes) => {
                if self.send(MsgType::Handshake, 0, bytes).is_ok() {
                    self.connection_id = Some(hs.connection_id);
                    self.state = ClientState::Joining;
                    info!(client_id = %hs.connection_id, kind = ?self.cfg.client_kind, "Handshake answered");
                }
            }
            Err(e) => error!(error = %e, "Handshake encoding failed"),
        }
    }

    fn on_initial_state(&mut self, _from: ConnectionId, payload: Bytes) {
        if self.state == ClientState::Ready {
            warn!("Initial state while already running, ignored");
            return;
        }
        let state: InitialState = match deserialize(&payload) {
            Ok(s) => s,
            Err(e) => {
                error!(error = %e, "Malformed initial state dropped");
                return;
            }
        };
        let applied = self.spawner.apply_initial_state(&state);
        self.absorb(applied);
        self.state = ClientState::Ready;
        self.events.push(InitialStateApplied {
            connection: self.connection_id.unwrap_or(ConnectionId::AUTHORITY),
        });
    }

    fn on_state_update(&mut self, _from: ConnectionId, payload: Bytes) {
        let update: StateUpdate = match deserialize(&payload) {
            Ok(u) => u,
            Err(e) => {
                error!(error = %e, "Malformed update dropped");
                return;
            }
        };
        let applied = self.spawner.apply_update(&update);
        self.absorb(applied);
    }

    fn on_rpc(&mut self, entity: EntityId, from: ConnectionId, payload: Bytes) {
        let call = match BehaviourCall::decode(&payload) {
            Ok(c) => c,
            Err(e) => {
                error!(%entity, error = %e, "Malformed rpc dropped");
                return;
            }
        };
        match self
            .spawner
            .world_mut()
            .dispatch_rpc(entity, Role::Peer, from, &call)
        {
            Ok(out) => self.flush_rpcs(out),
            Err(e) => error!(%entity, error = %e, "Rpc refused"),
        }
    }

    fn on_custom(&mut self, from: ConnectionId, payload: Bytes) {
        debug!(bytes = payload.len(), "Custom message");
        self.events.push(CustomMessage {
            sender: from,
            payload,
        });
    }

    fn on_file_chunk(&mut self, from: ConnectionId, payload: Bytes) {
        let chunk: FileChunk = match deserialize(&payload) {
            Ok(c) => c,
            Err(e) => {
                error!(error = %e, "Malformed file chunk dropped");
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
            Err(e) => error!(%hash, error = %e, "File chunk rejected"),
        }
    }

    fn on_disconnect(&mut self) {
        if self.state == ClientState::Disconnected {
            return;
        }
        self.state = ClientState::Disconnected;
        self.files_out.clear();
        self.events.push(PeerDisconnected(ConnectionId::AUTHORITY));
        info!("Disconnected from authority");
    }

    /// Hands start-hook calls to the wire and lerp targets to the tracks.
    fn absorb(&mut self, applied: Applied) {
        for id in &applied.destroyed {
            self.interp.remove(*id);
        }
        for (id, target) in applied.lerp_targets {
            let world = self.spawner.world();
            let Some(node) = world.find(id) else {
                continue;
            };
            let Some(e) = world.entity(node) else {
                continue;
            };
            let (parts, delay) = (lerp_parts(e.sync), e.lerp_delay);
            let rendered = world.synced_pose(node);
            self.interp.set_target(id, rendered, target, delay, parts);
        }
        self.flush_rpcs(applied.rpcs);
    }

    fn flush_rpcs(&mut self, out: Vec<OutgoingRpc>) {
        for rpc in out {
            if rpc.target != RpcTarget::Authority {
                error!(entity = %rpc.entity, target = ?rpc.target, "Peers can only call the authority, dropped");
                continue;
            }
            let payload = BehaviourCall {
                behaviour: rpc.behaviour,
                call: rpc.call,
            }
            .encode();
            let _ = self.send(MsgType::Rpc, rpc.entity.0, payload);
        }
    }

    fn interpolate(&mut self, dt: f32) {
        for (id, pose, parts) in self.interp.advance(dt) {
            match self.spawner.world().find(id) {
                Some(node) => self.spawner.world_mut().apply_synced_pose(node, pose, parts),
                None => self.interp.remove(id),
            }
        }
    }

    fn push_player_changes(&mut self) {
        for (id, state) in self.spawner.take_player_changes() {
            let req = ChangeRequest {
                id,
                state: state.to_vec(),
            };
            match serialize(&req, false) {
                Ok(bytes) => {
                    let _ = self.send(MsgType::ChangeRequest, 0, bytes);
                }
                Err(e) => error!(entity = %id, error = %e, "Change request encoding failed"),
            }
        }
    }

    fn pump_files(&mut self, now: Instant) {
        let Some((_, chunk)) = self.files_out.next_due(now) else {
            return;
        };
        match serialize(&chunk, false) {
            Ok(bytes) => {
                let _ = self.send(MsgType::FileChunk, 0, bytes);
            }
            Err(e) => error!(error = %e, "File chunk encoding failed"),
        }
    }
}

/// Peer of a replication session.
pub struct ReplicationClient {
    router: MessageRouter<ClientCore>,
    core: ClientCore,
    rpc_targets: BTreeSet<EntityId>,
}

impl ReplicationClient {
    /// Creates a client on its own router registry.
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

    /// Creates a client whose router is bound to `channel` on a transport
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
            MessageRouter::bind(registry, key, &cfg.channel).context("bind client router")?;

        let mut spawner = PeerSpawner::new(prefabs, cfg.ignore_server_spawn_data);
        spawner
            .initialize_scene(scene)
            .context("initialise scene")?;
        if let Err(e) = spawner.create_local_player(cfg.client_kind) {
            warn!(kind = ?cfg.client_kind, error = %e, "No local player");
        }

        let core = ClientCore {
            sender: router.sender(),
            files_out: FilePump::new(cfg.file_send_interval()),
            files_in: FileAssembler::new(PathBuf::from(&cfg.file_dir)),
            cfg,
            transport,
            state: ClientState::Connecting,
            connection_id: None,
            spawner,
            interp: Interpolator::new(),
            events: EventBus::default(),
        };
        let mut client = Self {
            router,
            core,
            rpc_targets: BTreeSet::new(),
        };
        client.register_listeners();
        client.sync_rpc_listeners();
        Ok(client)
    }

    fn register_listeners(&mut self) {
        self.router
            .add_listener(MsgType::Handshake, 0, ClientCore::on_handshake);
        self.router
            .add_listener(MsgType::InitialState, 0, ClientCore::on_initial_state);
        self.router
            .add_listener(MsgType::StateUpdate, 0, ClientCore::on_state_update);
        self.router
            .add_listener(MsgType::Custom, 0, ClientCore::on_custom);
        self.router
            .add_listener(MsgType::FileChunk, 0, ClientCore::on_file_chunk);
    }

    /// Keeps one RPC listener per known entity, keyed by its id.
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
                .add_listener(MsgType::Rpc, id.0, move |core: &mut ClientCore, from, payload| {
                    core.on_rpc(id, from, payload)
                });
        }
        self.rpc_targets = live;
    }

    pub fn state(&self) -> ClientState {
        self.core.state
    }

    pub fn is_ready(&self) -> bool {
        self.core.state == ClientState::Ready
    }

    pub fn connection_id(&self) -> Option<ConnectionId> {
        self.core.connection_id
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

    pub fn spawner(&self) -> &PeerSpawner {
        &self.core.spawner
    }

    /// Node of the local player, if one was created.
    pub fn local_player(&self) -> Option<NodeId> {
        self.core.spawner.local_player()
    }

    /// Id of the local player, once the authority bound it.
    pub fn own_player(&self) -> Option<EntityId> {
        self.core.spawner.own_player()
    }

    pub fn interpolator(&self) -> &Interpolator {
        &self.core.interp
    }

    /// Session notifications, drained by the host application.
    pub fn events(&mut self) -> &mut EventBus {
        &mut self.core.events
    }

    /// Handles every transport event that arrived since the last call.
    pub fn poll(&mut self) {
        if self.core.state == ClientState::Disconnected {
            return;
        }
        for event in self.core.transport.poll() {
            match event {
                TransportEvent::Connect(id) => {
                    debug!(host = %id, "Transport connected");
                    self.core.events.push(PeerConnected(id));
                }
                TransportEvent::Disconnect(_) => self.core.on_disconnect(),
                TransportEvent::Data(id, raw) => {
                    self.router.handle_data(&mut self.core, id, &raw);
                    // Records may have added entities that the next frame
                    // already calls into.
                    self.sync_rpc_listeners();
                }
            }
        }
        self.sync_rpc_listeners();
    }

    /// Per-frame work: interpolation, own player sync and file pacing.
    pub fn update(&mut self, dt: f32) {
        if self.core.state == ClientState::Disconnected {
            return;
        }
        self.core.interpolate(dt);
        if self.core.state == ClientState::Ready {
            self.core.push_player_changes();
        }
        self.core.pump_files(Instant::now());
    }

    /// Asks the authority to spawn a prefab, optionally owned by us.
    pub fn request_spawn(&mut self, prefab_key: &str, owned: bool) -> anyhow::Result<()> {
        let req = SpawnRequest {
            prefab_key: prefab_key.to_string(),
            owned,
        };
        let bytes = serialize(&req, false).context("encode spawn request")?;
        self.core
            .send(MsgType::SpawnRequest, 0, bytes)
            .context("send spawn request")?;
        Ok(())
    }

    pub fn request_destroy(&mut self, id: EntityId) -> anyhow::Result<()> {
        let bytes = serialize(&DestroyRequest { id }, false).context("encode destroy request")?;
        self.core
            .send(MsgType::DestroyRequest, 0, bytes)
            .context("send destroy request")?;
        Ok(())
    }

    /// Sends the current local state of `id` as a change request. The
    /// authority answers with its resulting state on the next broadcast.
    pub fn request_change(&mut self, id: EntityId) -> anyhow::Result<()> {
        let state = self.core.spawner.state_of(id).context("read entity state")?;
        let bytes = serialize(
            &ChangeRequest {
                id,
                state: state.to_vec(),
            },
            false,
        )
        .context("encode change request")?;
        self.core
            .send(MsgType::ChangeRequest, 0, bytes)
            .context("send change request")?;
        Ok(())
    }

    /// Calls a method on the authority's copy of a behaviour.
    pub fn invoke_server_rpc<A: RpcParams>(
        &mut self,
        entity: EntityId,
        behaviour: usize,
        name: &str,
        args: A,
    ) -> Result<(), RpcError> {
        let out = self.core.spawner.world_mut().with_context(
            entity,
            behaviour,
            Role::Peer,
            |ctx| ctx.invoke_server_rpc(name, args),
        )?;
        self.core.flush_rpcs(out);
        Ok(())
    }

    pub fn send_custom(&mut self, payload: Bytes) -> Result<(), TransportError> {
        self.core.send(MsgType::Custom, 0, payload)
    }

    /// Queues a file for the authority. Chunks go out one per send interval.
    pub fn send_file(&mut self, data: &[u8], dest_path: &str) -> usize {
        let chunks = split_file(data, dest_path, self.core.cfg.file_chunk_size);
        let count = chunks.len();
        self.core.files_out.enqueue(ConnectionId::AUTHORITY, chunks);
        info!(dest = dest_path, chunks = count, "File queued");
        count
    }

    /// Chunks still waiting to be sent.
    pub fn queued_file_chunks(&self) -> usize {
        self.core.files_out.len()
    }

    /// Leaves the session and drops every table.
    pub fn stop(&mut self) {
        self.core.on_disconnect();
        self.core.spawner.clear();
        self.core.interp.clear();
        self.core.connection_id = None;
        self.sync_rpc_listeners();
        info!("Replication client stopped");
    }

    /// Executes a console command.
    pub fn exec_console(&mut self, line: &str) -> Vec<String> {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.is_empty() {
            return Vec::new();
        }

        match tokens[0] {
            "status" => vec![
                format!("State: {:?}", self.state()),
                format!("Connection: {:?}", self.connection_id()),
                format!("Player: {:?}", self.own_player()),
                format!("Entities: {}", self.world().entity_ids().len()),
                format!("Interpolating: {}", self.core.interp.len()),
            ],
            "spawn" => {
                let Some(key) = tokens.get(1) else {
                    return vec!["Usage: spawn <prefab> [owned]".to_string()];
                };
                let owned = tokens.get(2).is_some_and(|t| *t == "owned");
                match self.request_spawn(key, owned) {
                    Ok(()) => vec![format!("Requested {key}")],
                    Err(e) => vec![format!("Spawn request failed: {e}")],
                }
            }
            "destroy" => {
                let Some(id) = tokens.get(1).and_then(|t| t.parse().ok()).map(EntityId) else {
                    return vec!["Usage: destroy <entity>".to_string()];
                };
                match self.request_destroy(id) {
                    Ok(()) => vec![format!("Requested destroy of {id}")],
                    Err(e) => vec![format!("Destroy request failed: {e}")],
                }
            }
            "rpc" => {
                let (Some(id), Some(name)) = (
                    tokens.get(1).and_then(|t| t.parse().ok()).map(EntityId),
                    tokens.get(2),
                ) else {
                    return vec!["Usage: rpc <entity> <method>".to_string()];
                };
                match self.invoke_server_rpc(id, 0, name, ()) {
                    Ok(()) => vec![format!("Called {name} on {id}")],
                    Err(e) => vec![format!("Rpc failed: {e}")],
                }
            }
            "say" => {
                let text = tokens[1..].join(" ");
                match self.send_custom(Bytes::from(text.into_bytes())) {
                    Ok(()) => vec!["Sent".to_string()],
                    Err(e) => vec![format!("Send failed: {e}")],
                }
            }
            "sendfile" => {
                let Some(path) = tokens.get(1) else {
                    return vec!["Usage: sendfile <path> [dest]".to_string()];
                };
                let dest = tokens.get(2).copied().unwrap_or(*path);
                match std::fs::read(path) {
                    Ok(data) => {
                        let chunks = self.send_file(&data, dest);
                        vec![format!("Queued {chunks} chunk(s)")]
                    }
                    Err(e) => vec![format!("Cannot read {path}: {e}")],
                }
            }
            "disconnect" | "quit" | "exit" => {
                self.stop();
                vec!["Disconnected".to_string()]
            }
            other => vec![format!("Unknown command: {other}")],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use netsync_shared::{
        config::ClientKind,
        demo::{demo_prefabs, demo_scene, Lamp},
        loopback::{LoopbackHost, LoopbackHub},
        message::Envelope,
        rpc::{signature_hash, RpcCall, RpcParams},
        spawn::{SpawnKind, SpawnRecord},
    };

    fn client(hub: &LoopbackHub, cfg: NetConfig) -> ReplicationClient {
        ReplicationClient::new(cfg, Box::new(hub.connect()), demo_prefabs(), demo_scene())
            .unwrap()
    }

    fn push(host: &mut LoopbackHost, to: ConnectionId, msg_type: MsgType, target: u64, payload: Bytes) {
        let env = Envelope {
            channel: "netsync".into(),
            msg_type: msg_type as u8,
            target,
            payload,
        };
        host.send(env.encode(), to).unwrap();
    }

    fn sent(host: &mut LoopbackHost) -> Vec<Envelope> {
        host.poll()
            .into_iter()
            .filter_map(|ev| match ev {
                TransportEvent::Data(_, raw) => Some(Envelope::decode(&raw).unwrap()),
                _ => None,
            })
            .collect()
    }

    fn greet(host: &mut LoopbackHost, c: &mut ReplicationClient, id: ConnectionId) -> Handshake {
        let hs = Handshake {
            connection_id: id,
            ..Default::default()
        };
        push(host, id, MsgType::Handshake, 0, serialize(&hs, false).unwrap());
        c.poll();
        let out = sent(host);
        assert_eq!(out[0].msg_type, MsgType::Handshake as u8);
        deserialize(&out[0].payload).unwrap()
    }

    fn door_record() -> SpawnRecord {
        let mut world = World::new();
        for tree in demo_scene() {
            world.insert(tree, None);
        }
        let door = world.scene_nodes()[0];
        world.assign_id(door, EntityId(1)).unwrap();
        SpawnRecord {
            kind: SpawnKind::SceneObject,
            id: EntityId(1),
            prefab_key: String::new(),
            parent: EntityId::NONE,
            spawn_data: vec![world.serialize_on_spawn(door).unwrap()],
            init_data: vec![world.serialize_state(door).unwrap()],
        }
    }

    #[test]
    fn handshake_reply_carries_category() {
        let hub = LoopbackHub::new();
        let mut host = hub.host();
        let cfg = NetConfig {
            client_kind: ClientKind::Ar,
            ..Default::default()
        };
        let mut c = client(&hub, cfg);
        let id = ConnectionId(1);
        let reply = greet(&mut host, &mut c, id);
        assert_eq!(reply.connection_id, id);
        assert_eq!(reply.client_kind, ClientKind::Ar);
        assert!(reply.init_data.is_empty());
        assert_eq!(c.state(), ClientState::Joining);
        assert_eq!(c.connection_id(), Some(id));

        // A second handshake is ignored.
        push(&mut host, id, MsgType::Handshake, 0, serialize(&reply, false).unwrap());
        c.poll();
        assert!(sent(&mut host).is_empty());
    }

    #[test]
    fn handshake_ships_player_state_when_keeping_local_spawn_data() {
        let hub = LoopbackHub::new();
        let mut host = hub.host();
        let cfg = NetConfig {
            ignore_server_spawn_data: true,
            ..Default::default()
        };
        let mut c = client(&hub, cfg);
        let reply = greet(&mut host, &mut c, ConnectionId(1));
        // Player root and hand.
        assert_eq!(reply.init_data.len(), 2);
    }

    #[test]
    fn initial_state_makes_client_ready() {
        let hub = LoopbackHub::new();
        let mut host = hub.host();
        let mut c = client(&hub, NetConfig::default());
        greet(&mut host, &mut c, ConnectionId(1));

        let state = InitialState {
            records: vec![door_record()],
        };
        push(&mut host, ConnectionId(1), MsgType::InitialState, 0, serialize(&state, false).unwrap());
        c.poll();
        assert!(c.is_ready());
        assert!(c.world().get(EntityId(1)).unwrap().is_active());
        assert_eq!(c.events().drain::<InitialStateApplied>().len(), 1);
    }

    #[test]
    fn client_rpc_reaches_behaviour_and_server_rpc_goes_out() {
        let hub = LoopbackHub::new();
        let mut host = hub.host();
        let mut c = client(&hub, NetConfig::default());
        let me = ConnectionId(1);
        greet(&mut host, &mut c, me);
        let state = InitialState {
            records: vec![door_record()],
        };
        push(&mut host, me, MsgType::InitialState, 0, serialize(&state, false).unwrap());
        c.poll();

        let flash = BehaviourCall {
            behaviour: 0,
            call: RpcCall {
                hash: signature_hash("flash", &<(u32,)>::type_names()),
                args: (7u32,).encode_args().unwrap(),
            },
        };
        push(&mut host, me, MsgType::Rpc, 1, flash.encode());
        c.poll();
        let lamp = c.world().get(EntityId(1)).unwrap().behaviour::<Lamp>().unwrap();
        assert_eq!(lamp.flashes, [7]);

        c.invoke_server_rpc(EntityId(1), 0, "toggle", ()).unwrap();
        let out = sent(&mut host);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].msg_type, MsgType::Rpc as u8);
        assert_eq!(out[0].target, 1);

        // Peers may not call other peers.
        assert!(c.invoke_server_rpc(EntityId(1), 0, "flash", (1u32,)).is_err());
    }

    #[test]
    fn authority_loss_disconnects() {
        let hub = LoopbackHub::new();
        let host = hub.host();
        let mut c = client(&hub, NetConfig::default());
        c.poll();
        drop(host);
        c.poll();
        assert_eq!(c.state(), ClientState::Disconnected);
        assert_eq!(c.events().drain::<PeerDisconnected>().len(), 1);
    }

    #[test]
    fn console_reports_status() {
        let hub = LoopbackHub::new();
        let _host = hub.host();
        let mut c = client(&hub, NetConfig::default());
        let out = c.exec_console("status");
        assert_eq!(out[0], "State: Connecting");
        assert!(c.exec_console("destroy")[0].starts_with("Usage"));
        c.exec_console("quit");
        assert_eq!(c.state(), ClientState::Disconnected);
        assert!(c.world().is_empty());
    }
}
