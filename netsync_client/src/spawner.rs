//! Peer-side entity table.
//!
//! Mirrors the authority's world from the records it sends:
//! - scene objects are numbered `1..=n` exactly like the authority does,
//!   and stay inactive until their record arrives,
//! - prefab records are instantiated from the local prefab table,
//! - the player record binds the locally created player instead of
//!   instantiating a copy.
//!
//! Ids inside an instantiated tree follow the authority's allocation: the
//! record id for the root, then consecutive ids in pre-order.

use std::collections::BTreeMap;

use bytes::Bytes;
use netsync_shared::{
    behaviour::{OutgoingRpc, Role},
    codec::CodecError,
    config::ClientKind,
    math::Pose,
    net::EntityId,
    spawn::{InitialState, PrefabRegistry, SpawnError, SpawnKind, SpawnRecord, StateUpdate},
    world::{NodeBuilder, NodeId, World},
};
use tracing::{debug, error, info, warn};

/// What applying one record batch produced.
#[derive(Debug, Default)]
pub struct Applied {
    /// Calls queued by start hooks.
    pub rpcs: Vec<OutgoingRpc>,
    /// Interpolating entities and their new target pose.
    pub lerp_targets: Vec<(EntityId, Pose)>,
    pub destroyed: Vec<EntityId>,
}

/// Peer entity table.
pub struct PeerSpawner {
    world: World,
    prefabs: PrefabRegistry,
    /// Scene objects by id, waiting for or bound to their record.
    scene: BTreeMap<EntityId, NodeId>,
    local_player: Option<NodeId>,
    own_player: Option<EntityId>,
    ignore_server_spawn_data: bool,
    initialized: bool,
}

impl PeerSpawner {
    pub fn new(prefabs: PrefabRegistry, ignore_server_spawn_data: bool) -> Self {
        Self {
            world: World::new(),
            prefabs,
            scene: BTreeMap::new(),
            local_player: None,
            own_player: None,
            ignore_server_spawn_data,
            initialized: false,
        }
    }

    pub fn world(&self) -> &World {
        &self.world
    }

    pub fn world_mut(&mut self) -> &mut World {
        &mut self.world
    }

    /// Has the initial state been applied?
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn local_player(&self) -> Option<NodeId> {
        self.local_player
    }

    /// Id the authority gave our player, once bound.
    pub fn own_player(&self) -> Option<EntityId> {
        self.own_player
    }

    /// Inserts the local copy of the scene and numbers it. Scene objects
    /// stay inactive until the initial state activates them.
    pub fn initialize_scene(&mut self, scene: Vec<NodeBuilder>) -> Result<(), SpawnError> {
        for tree in scene {
            self.world.insert(tree, None);
        }
        for (i, node) in self.world.scene_nodes().into_iter().enumerate() {
            let id = EntityId(i as u64 + 1);
            self.world.assign_id(node, id)?;
            if let Some(n) = self.world.node_mut(node) {
                n.active = false;
            }
            self.scene.insert(id, node);
        }
        debug!(objects = self.scene.len(), "Local scene numbered");
        Ok(())
    }

    /// Builds the local player from the player prefab of `kind`. It stays
    /// unnumbered until the authority's player record binds it.
    pub fn create_local_player(&mut self, kind: ClientKind) -> Result<NodeId, SpawnError> {
        let key = self
            .prefabs
            .player_prefab(kind)
            .ok_or(SpawnError::NoPlayerPrefab(kind))?
            .to_string();
        let tree = self.prefabs.build(&key)?;
        let root = self.world.insert(tree, None);
        self.local_player = Some(root);
        info!(prefab = %key, "Local player created");
        Ok(root)
    }

    /// State blobs of the local player tree, in pre-order.
    pub fn player_init_data(&self) -> Result<Vec<Vec<u8>>, CodecError> {
        let Some(root) = self.local_player else {
            return Ok(Vec::new());
        };
        self.replicated_pre_order(root)
            .into_iter()
            .map(|n| self.world.serialize_state(n).map(|b| b.to_vec()))
            .collect()
    }

    /// True for nodes of the local player tree.
    pub fn is_own(&self, node: NodeId) -> bool {
        let Some(player) = self.local_player else {
            return false;
        };
        let mut cur = Some(node);
        while let Some(n) = cur {
            if n == player {
                return true;
            }
            cur = self.world.node(n).and_then(|n| n.parent());
        }
        false
    }

    fn replicated_pre_order(&self, root: NodeId) -> Vec<NodeId> {
        self.world
            .pre_order(root)
            .into_iter()
            .filter(|n| self.world.entity(*n).is_some())
            .collect()
    }

    /// Applies the snapshot sent on join. A second snapshot is ignored.
    pub fn apply_initial_state(&mut self, state: &InitialState) -> Applied {
        let mut applied = Applied::default();
        if self.initialized {
            warn!("Initial state already applied, ignored");
            return applied;
        }
        for record in &state.records {
            let res = match record.kind {
                SpawnKind::SceneObject => self.activate_scene_object(record),
                SpawnKind::PrefabObject => self.instantiate(record),
                SpawnKind::PlayerObject => self.bind_local_player(record),
            };
            match res {
                Ok(out) => applied.rpcs.extend(out),
                Err(e) => error!(entity = %record.id, kind = ?record.kind, error = %e, "Spawn record failed"),
            }
        }
        self.initialized = true;
        info!(records = state.records.len(), "Initial state applied");
        applied
    }

    /// Applies a broadcast: spawns, then destroys, then deltas. Updates that
    /// arrive before the initial state are dropped.
    pub fn apply_update(&mut self, update: &StateUpdate) -> Applied {
        let mut applied = Applied::default();
        if !self.initialized {
            warn!(
                spawns = update.spawns.len(),
                destroys = update.destroys.len(),
                deltas = update.deltas.len(),
                "Update before initial state, dropped"
            );
            return applied;
        }

        for record in &update.spawns {
            match self.instantiate(record) {
                Ok(out) => applied.rpcs.extend(out),
                Err(e) => error!(entity = %record.id, prefab = %record.prefab_key, error = %e, "Spawn failed"),
            }
        }

        for id in &update.destroys {
            match self.world.find(*id) {
                Some(node) => {
                    if Some(node) == self.local_player {
                        warn!(entity = %id, "Own player destroyed by the authority");
                        self.local_player = None;
                        self.own_player = None;
                    }
                    let removed = self.world.remove(node);
                    for gone in &removed {
                        self.scene.remove(gone);
                    }
                    applied.destroyed.extend(removed);
                }
                None => error!(entity = %id, "Destroy for unknown entity"),
            }
        }

        for (id, blob) in &update.deltas {
            let Some(node) = self.world.find(*id) else {
                error!(entity = %id, "Delta for unknown entity");
                continue;
            };
            if self.is_own(node) {
                continue;
            }
            match self.world.deserialize_state(node, blob) {
                Ok(Some(target)) => applied.lerp_targets.push((*id, target)),
                Ok(None) => {}
                Err(e) => error!(entity = %id, error = %e, "Delta rejected"),
            }
            self.world.reset_dirty(node);
        }
        applied
    }

    fn activate_scene_object(&mut self, record: &SpawnRecord) -> Result<Vec<OutgoingRpc>, SpawnError> {
        let node = *self
            .scene
            .get(&record.id)
            .ok_or(SpawnError::UnknownEntity(record.id))?;
        self.apply_blobs(&[node], record, true)?;
        self.world.set_active(node, true);
        Ok(self.start(&[node]))
    }

    fn instantiate(&mut self, record: &SpawnRecord) -> Result<Vec<OutgoingRpc>, SpawnError> {
        if self.own_player.is_some() && self.own_player == Some(record.id) {
            let Some(root) = self.local_player else {
                return Ok(Vec::new());
            };
            if !self.ignore_server_spawn_data {
                let nodes = self.replicated_pre_order(root);
                for (node, blob) in nodes.iter().zip(&record.init_data) {
                    self.world.apply_state(*node, blob)?;
                }
            }
            debug!(entity = %record.id, "Own player record merged");
            return Ok(Vec::new());
        }
        if self.world.find(record.id).is_some() {
            return Err(SpawnError::DuplicateId(record.id));
        }

        let tree = self.prefabs.build(&record.prefab_key)?;
        let parent = if record.parent == EntityId::NONE {
            None
        } else {
            let found = self.world.find(record.parent);
            if found.is_none() {
                warn!(entity = %record.id, parent = %record.parent, "Unknown parent, spawned unparented");
            }
            found
        };
        let root = self.world.insert(tree, parent);
        let nodes = self.replicated_pre_order(root);
        if nodes.len() != record.spawn_data.len() {
            self.world.remove(root);
            return Err(SpawnError::TopologyMismatch {
                id: record.id,
                local: nodes.len(),
                remote: record.spawn_data.len(),
            });
        }
        for (i, node) in nodes.iter().enumerate() {
            self.world.assign_id(*node, EntityId(record.id.0 + i as u64))?;
        }
        self.apply_blobs(&nodes, record, true)?;
        debug!(entity = %record.id, prefab = %record.prefab_key, nodes = nodes.len(), "Spawned from record");
        Ok(self.start(&nodes))
    }

    fn bind_local_player(&mut self, record: &SpawnRecord) -> Result<Vec<OutgoingRpc>, SpawnError> {
        let root = match self.local_player {
            Some(root) => root,
            None => {
                warn!(entity = %record.id, "No local player, building one from the record");
                let tree = self.prefabs.build(&record.prefab_key)?;
                let root = self.world.insert(tree, None);
                self.local_player = Some(root);
                root
            }
        };
        let nodes = self.replicated_pre_order(root);
        if nodes.len() != record.spawn_data.len() {
            return Err(SpawnError::TopologyMismatch {
                id: record.id,
                local: nodes.len(),
                remote: record.spawn_data.len(),
            });
        }
        for (i, node) in nodes.iter().enumerate() {
            self.world.assign_id(*node, EntityId(record.id.0 + i as u64))?;
        }
        let keep_local = self.ignore_server_spawn_data;
        self.apply_blobs(&nodes, record, !keep_local)?;
        self.own_player = Some(record.id);
        info!(entity = %record.id, kept_local_state = keep_local, "Local player bound");
        let out = self.start(&nodes);
        for node in &nodes {
            self.world.reset_dirty(*node);
        }
        Ok(out)
    }

    /// Applies spawn blobs (and init blobs when `with_init`) to `nodes`.
    /// Without init data the local pose survives the spawn blob.
    fn apply_blobs(
        &mut self,
        nodes: &[NodeId],
        record: &SpawnRecord,
        with_init: bool,
    ) -> Result<(), SpawnError> {
        let empty = Bytes::new();
        for (i, node) in nodes.iter().enumerate() {
            let local = self.world.node(*node).map(|n| n.local);
            if let Some(blob) = record.spawn_data.get(i) {
                self.world.deserialize_on_spawn(*node, blob)?;
            }
            if with_init {
                let blob = record.init_data.get(i).unwrap_or(&empty);
                if !blob.is_empty() {
                    self.world.apply_state(*node, blob)?;
                }
            } else if let (Some(pose), Some(n)) = (local, self.world.node_mut(*node)) {
                n.local = pose;
            }
        }
        Ok(())
    }

    fn start(&mut self, nodes: &[NodeId]) -> Vec<OutgoingRpc> {
        let mut out = Vec::new();
        for node in nodes {
            out.extend(self.world.start_entity(*node, Role::Peer));
            self.world.reset_dirty(*node);
        }
        out
    }

    /// Dirty nodes of the local player tree with their state, dirty flags
    /// reset. Empty until the player is bound.
    pub fn take_player_changes(&mut self) -> Vec<(EntityId, Bytes)> {
        let Some(root) = self.local_player else {
            return Vec::new();
        };
        if self.own_player.is_none() {
            return Vec::new();
        }
        let mut out = Vec::new();
        for node in self.replicated_pre_order(root) {
            if !self.world.is_dirty(node) {
                continue;
            }
            let Some(id) = self.world.entity(node).map(|e| e.id) else {
                continue;
            };
            match self.world.serialize_state(node) {
                Ok(blob) => {
                    out.push((id, blob));
                    self.world.reset_dirty(node);
                }
                Err(e) => error!(entity = %id, error = %e, "Player state serialization failed"),
            }
        }
        out
    }

    /// Current state of one entity, for a manual change request.
    pub fn state_of(&self, id: EntityId) -> Result<Bytes, SpawnError> {
        let node = self.world.find(id).ok_or(SpawnError::UnknownEntity(id))?;
        Ok(self.world.serialize_state(node)?)
    }

    /// Drops every table and the world.
    pub fn clear(&mut self) {
        self.world = World::new();
        self.scene.clear();
        self.local_player = None;
        self.own_player = None;
        self.initialized = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use netsync_shared::{
        demo::{demo_prefabs, demo_scene, Avatar, Lamp, LAMP_PREFAB, PLAYER_PREFAB},
        math::Vec3,
        net::ConnectionId,
    };

    /// Authority-side view of the demo session, built by hand.
    fn authority_world() -> (World, Vec<NodeId>) {
        let mut world = World::new();
        for tree in demo_scene() {
            world.insert(tree, None);
        }
        let nodes = world.scene_nodes();
        for (i, node) in nodes.iter().enumerate() {
            world.assign_id(*node, EntityId(i as u64 + 1)).unwrap();
            world.start_entity(*node, Role::Authority);
        }
        (world, nodes)
    }

    fn record_of(world: &World, kind: SpawnKind, root: NodeId, key: &str) -> SpawnRecord {
        let nodes: Vec<NodeId> = world
            .pre_order(root)
            .into_iter()
            .filter(|n| world.entity(*n).is_some())
            .collect();
        SpawnRecord {
            kind,
            id: world.entity(root).unwrap().id,
            prefab_key: key.to_string(),
            parent: world.replicated_parent(root),
            spawn_data: nodes.iter().map(|n| world.serialize_on_spawn(*n).unwrap()).collect(),
            init_data: nodes.iter().map(|n| world.serialize_state(*n).unwrap()).collect(),
        }
    }

    fn peer() -> PeerSpawner {
        let mut p = PeerSpawner::new(demo_prefabs(), false);
        p.initialize_scene(demo_scene()).unwrap();
        p.create_local_player(ClientKind::Vr).unwrap();
        p
    }

    fn spawn_lamp(world: &mut World, first_id: u64) -> NodeId {
        let root = world.insert(demo_prefabs().build(LAMP_PREFAB).unwrap(), None);
        let nodes: Vec<NodeId> = world
            .pre_order(root)
            .into_iter()
            .filter(|n| world.entity(*n).is_some())
            .collect();
        for (i, n) in nodes.iter().enumerate() {
            world.assign_id(*n, EntityId(first_id + i as u64)).unwrap();
            world.start_entity(*n, Role::Authority);
        }
        root
    }

    #[test]
    fn scene_waits_for_initial_state() {
        let p = peer();
        let door = p.world().find(EntityId(1)).unwrap();
        assert!(!p.world().node(door).unwrap().active);
        assert!(!p.world().entity(door).unwrap().is_active());
        assert!(p.world().find(EntityId(2)).is_some());
    }

    #[test]
    fn initial_state_activates_scene_and_binds_player() {
        let (mut auth, scene) = authority_world();
        auth.get_mut(EntityId(1))
            .unwrap()
            .behaviour_mut::<Lamp>()
            .unwrap()
            .on
            .set(true);
        let player_root = auth.insert(demo_prefabs().build(PLAYER_PREFAB).unwrap(), None);
        for (i, n) in auth.pre_order(player_root).into_iter().filter(|n| auth.entity(*n).is_some()).collect::<Vec<_>>().into_iter().enumerate() {
            auth.assign_id(n, EntityId(3 + i as u64)).unwrap();
            auth.entity_mut(n).unwrap().set_owner(Some(ConnectionId(1)));
        }

        let state = InitialState {
            records: vec![
                record_of(&auth, SpawnKind::PlayerObject, player_root, PLAYER_PREFAB),
                record_of(&auth, SpawnKind::SceneObject, scene[0], ""),
            ],
        };
        let mut p = peer();
        p.apply_initial_state(&state);

        assert!(p.is_initialized());
        assert_eq!(p.own_player(), Some(EntityId(3)));
        let door = p.world().get(EntityId(1)).unwrap();
        assert!(door.is_active());
        assert!(*door.behaviour::<Lamp>().unwrap().on.get());
        let me = p.world().get(EntityId(3)).unwrap();
        assert!(me.is_owned);
        assert_eq!(me.owner, ConnectionId(1));
        assert!(p.world().find(EntityId(4)).is_some());
        // The cup had no record yet.
        assert!(!p.world().get(EntityId(2)).unwrap().is_active());

        // A second snapshot changes nothing.
        let again = InitialState {
            records: vec![record_of(&auth, SpawnKind::SceneObject, scene[1], "")],
        };
        p.apply_initial_state(&again);
        assert!(!p.world().get(EntityId(2)).unwrap().is_active());
    }

    #[test]
    fn update_before_initial_state_is_dropped() {
        let (mut auth, _) = authority_world();
        let lamp = spawn_lamp(&mut auth, 10);
        let update = StateUpdate {
            spawns: vec![record_of(&auth, SpawnKind::PrefabObject, lamp, LAMP_PREFAB)],
            ..Default::default()
        };
        let mut p = peer();
        p.apply_update(&update);
        assert!(p.world().find(EntityId(10)).is_none());
    }

    #[test]
    fn update_spawns_destroys_then_applies_deltas() {
        let (mut auth, _) = authority_world();
        let lamp = spawn_lamp(&mut auth, 10);
        let mut p = peer();
        p.apply_initial_state(&InitialState::default());

        let spawn = StateUpdate {
            spawns: vec![record_of(&auth, SpawnKind::PrefabObject, lamp, LAMP_PREFAB)],
            ..Default::default()
        };
        p.apply_update(&spawn);
        let bulb = p.world().find(EntityId(11)).unwrap();
        assert_eq!(p.world().replicated_parent(bulb), EntityId(10));
        assert!(p.world().get(EntityId(10)).unwrap().is_active());

        auth.get_mut(EntityId(10))
            .unwrap()
            .behaviour_mut::<Lamp>()
            .unwrap()
            .color
            .set(0xff0000);
        let delta = auth.serialize_state(lamp).unwrap();
        let update = StateUpdate {
            deltas: vec![(EntityId(10), delta), (EntityId(77), Bytes::new())],
            destroys: vec![EntityId(11), EntityId(99)],
            ..Default::default()
        };
        let applied = p.apply_update(&update);
        assert_eq!(applied.destroyed, [EntityId(11)]);
        assert!(p.world().find(EntityId(11)).is_none());
        assert_eq!(
            *p.world().get(EntityId(10)).unwrap().behaviour::<Lamp>().unwrap().color.get(),
            0xff0000
        );
    }

    #[test]
    fn unknown_parent_spawns_unparented() {
        let (mut auth, _) = authority_world();
        let lamp = spawn_lamp(&mut auth, 10);
        let mut record = record_of(&auth, SpawnKind::PrefabObject, lamp, LAMP_PREFAB);
        record.parent = EntityId(55);
        let mut p = peer();
        p.apply_initial_state(&InitialState::default());
        p.apply_update(&StateUpdate {
            spawns: vec![record],
            ..Default::default()
        });
        let node = p.world().find(EntityId(10)).unwrap();
        assert_eq!(p.world().node(node).unwrap().parent(), None);
    }

    #[test]
    fn player_changes_only_after_binding() {
        let mut p = PeerSpawner::new(demo_prefabs(), true);
        p.initialize_scene(demo_scene()).unwrap();
        let root = p.create_local_player(ClientKind::Desktop).unwrap();
        p.world_mut()
            .entity_mut(root)
            .unwrap()
            .behaviour_mut::<Avatar>()
            .unwrap()
            .name
            .set("ada".to_string());
        assert_eq!(p.player_init_data().unwrap().len(), 2);
        assert!(p.take_player_changes().is_empty());

        let (mut auth, _) = authority_world();
        let remote = auth.insert(demo_prefabs().build(PLAYER_PREFAB).unwrap(), None);
        for (i, n) in auth.pre_order(remote).into_iter().filter(|n| auth.entity(*n).is_some()).collect::<Vec<_>>().into_iter().enumerate() {
            auth.assign_id(n, EntityId(3 + i as u64)).unwrap();
        }
        let record = record_of(&auth, SpawnKind::PlayerObject, remote, PLAYER_PREFAB);
        p.apply_initial_state(&InitialState {
            records: vec![record],
        });
        // Local customisation survives the binding.
        let me = p.world().get(EntityId(3)).unwrap();
        assert_eq!(me.behaviour::<Avatar>().unwrap().name.get(), "ada");

        p.world_mut().node_mut(root).unwrap().local.position = Vec3::new(1.0, 0.0, 0.0);
        let changes = p.take_player_changes();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].0, EntityId(3));
        assert!(p.take_player_changes().is_empty());
    }

    #[test]
    fn deltas_for_own_player_are_ignored() {
        let (mut auth, _) = authority_world();
        let remote = auth.insert(demo_prefabs().build(PLAYER_PREFAB).unwrap(), None);
        for (i, n) in auth.pre_order(remote).into_iter().filter(|n| auth.entity(*n).is_some()).collect::<Vec<_>>().into_iter().enumerate() {
            auth.assign_id(n, EntityId(3 + i as u64)).unwrap();
        }
        let mut p = peer();
        p.apply_initial_state(&InitialState {
            records: vec![record_of(&auth, SpawnKind::PlayerObject, remote, PLAYER_PREFAB)],
        });

        auth.node_mut(remote).unwrap().local.position = Vec3::new(5.0, 0.0, 0.0);
        let blob = auth.serialize_state(remote).unwrap();
        let applied = p.apply_update(&StateUpdate {
            deltas: vec![(EntityId(3), blob)],
            ..Default::default()
        });
        assert!(applied.lerp_targets.is_empty());
        let me = p.local_player().unwrap();
        assert_eq!(p.world().node(me).unwrap().local.position, Vec3::ZERO);
    }
}
