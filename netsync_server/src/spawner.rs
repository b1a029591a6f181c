//! Authority-side entity table.
//!
//! Owns the world and decides what every broadcast carries:
//! - scene objects get ids `1..=n` in scene order, the same ids a peer
//!   derives from its own copy of the scene,
//! - dynamic spawns get fresh ids from a monotonically increasing counter,
//!   one per replicated node in pre-order,
//! - spawns and destroys are queued and take effect on the next broadcast.
//!
//! A "spawn unit" is the tree announced by one spawn record: the spawned
//! root and its replicated descendants, minus nested trees that were
//! spawned on their own.

use std::collections::{BTreeMap, BTreeSet};

use netsync_shared::{
    behaviour::{OutgoingRpc, Role},
    config::ClientKind,
    entity::Lifecycle,
    net::{ConnectionId, EntityId},
    spawn::{InitialState, PrefabRegistry, SpawnError, SpawnKind, SpawnRecord, StateUpdate},
    world::{NodeBuilder, NodeId, World},
};
use tracing::{debug, error, info, warn};

/// Authoritative entity table.
pub struct AuthoritySpawner {
    world: World,
    prefabs: PrefabRegistry,
    next_id: u64,
    /// Scene objects, in scene order.
    scene: Vec<EntityId>,
    /// Roots of dynamic spawn units that peers know about.
    spawned: BTreeSet<EntityId>,
    pending_spawn: Vec<EntityId>,
    /// Ids in post-order, deduplicated.
    pending_destroy: Vec<EntityId>,
    players: BTreeMap<ConnectionId, EntityId>,
    server_player: Option<EntityId>,
}

impl AuthoritySpawner {
    pub fn new(prefabs: PrefabRegistry) -> Self {
        Self {
            world: World::new(),
            prefabs,
            next_id: 1,
            scene: Vec::new(),
            spawned: BTreeSet::new(),
            pending_spawn: Vec::new(),
            pending_destroy: Vec::new(),
            players: BTreeMap::new(),
            server_player: None,
        }
    }

    pub fn world(&self) -> &World {
        &self.world
    }

    pub fn world_mut(&mut self) -> &mut World {
        &mut self.world
    }

    pub fn prefabs(&self) -> &PrefabRegistry {
        &self.prefabs
    }

    pub fn scene(&self) -> &[EntityId] {
        &self.scene
    }

    pub fn player_of(&self, conn: ConnectionId) -> Option<EntityId> {
        self.players.get(&conn).copied()
    }

    pub fn players(&self) -> impl Iterator<Item = (ConnectionId, EntityId)> + '_ {
        self.players.iter().map(|(c, e)| (*c, *e))
    }

    pub fn server_player(&self) -> Option<EntityId> {
        self.server_player
    }

    pub fn is_pending_spawn(&self, id: EntityId) -> bool {
        self.pending_spawn.contains(&id)
    }

    pub fn pending_destroys(&self) -> &[EntityId] {
        &self.pending_destroy
    }

    pub fn is_spawned(&self, id: EntityId) -> bool {
        self.spawned.contains(&id)
    }

    fn alloc_id(&mut self) -> EntityId {
        let id = EntityId(self.next_id);
        self.next_id += 1;
        id
    }

    /// Inserts the pre-placed scene, numbers its replicated nodes and makes
    /// them live. Returns calls queued by start hooks.
    pub fn initialize_scene(
        &mut self,
        scene: Vec<NodeBuilder>,
    ) -> Result<Vec<OutgoingRpc>, SpawnError> {
        for tree in scene {
            self.world.insert(tree, None);
        }
        let nodes = self.world.scene_nodes();
        for (i, node) in nodes.iter().enumerate() {
            let id = EntityId(i as u64 + 1);
            self.world.assign_id(*node, id)?;
            self.scene.push(id);
        }
        self.next_id = self.next_id.max(nodes.len() as u64 + 1);

        let mut outbox = Vec::new();
        for node in nodes {
            outbox.extend(self.world.start_entity(node, Role::Authority));
            self.world.reset_dirty(node);
        }
        info!(objects = self.scene.len(), "Scene initialised");
        Ok(outbox)
    }

    /// Adds a tree to the table. Ids are assigned now; peers learn about it
    /// on the next broadcast.
    pub fn spawn(
        &mut self,
        tree: NodeBuilder,
        owner: Option<ConnectionId>,
    ) -> Result<EntityId, SpawnError> {
        self.spawn_under(tree, None, owner)
    }

    /// Like `spawn`, parented below an existing entity.
    pub fn spawn_with_parent(
        &mut self,
        tree: NodeBuilder,
        parent: EntityId,
        owner: Option<ConnectionId>,
    ) -> Result<EntityId, SpawnError> {
        self.spawn_under(tree, Some(parent), owner)
    }

    pub fn spawn_prefab(
        &mut self,
        key: &str,
        owner: Option<ConnectionId>,
    ) -> Result<EntityId, SpawnError> {
        let tree = self.prefabs.build(key)?;
        self.spawn(tree, owner)
    }

    fn spawn_under(
        &mut self,
        tree: NodeBuilder,
        parent: Option<EntityId>,
        owner: Option<ConnectionId>,
    ) -> Result<EntityId, SpawnError> {
        let parent_node = match parent {
            Some(p) => Some(self.world.find(p).ok_or(SpawnError::UnknownEntity(p))?),
            None => None,
        };
        let root = self.world.insert(tree, parent_node);
        if self.world.entity(root).is_none() {
            self.world.remove(root);
            return Err(SpawnError::NotReplicated);
        }

        for node in self.world.pre_order(root) {
            let id = self.alloc_id();
            self.world.assign_id(node, id)?;
            if let Some(e) = self.world.entity_mut(node) {
                e.set_owner(owner);
                e.lifecycle = Lifecycle::Spawned;
            }
        }
        let id = self
            .world
            .entity(root)
            .map(|e| e.id)
            .ok_or(SpawnError::NotReplicated)?;
        self.pending_spawn.push(id);
        debug!(entity = %id, owner = ?owner, "Spawn queued");
        Ok(id)
    }

    /// Spawns the player prefab of `kind`, owned by `conn`.
    pub fn spawn_client_player(
        &mut self,
        conn: ConnectionId,
        kind: ClientKind,
    ) -> Result<EntityId, SpawnError> {
        let key = self
            .prefabs
            .player_prefab(kind)
            .ok_or(SpawnError::NoPlayerPrefab(kind))?
            .to_string();
        let id = self.spawn_prefab(&key, Some(conn))?;
        if let Some(old) = self.players.insert(conn, id) {
            warn!(client_id = %conn, old = %old, "Connection already had a player, replaced");
        }
        info!(client_id = %conn, entity = %id, prefab = %key, "Player spawned");
        Ok(id)
    }

    /// Spawns the host's own player, advertised under the player prefab key
    /// of `kind`.
    pub fn spawn_server_player(&mut self, kind: ClientKind) -> Result<EntityId, SpawnError> {
        let key = self
            .prefabs
            .player_prefab(kind)
            .ok_or(SpawnError::NoPlayerPrefab(kind))?
            .to_string();
        let id = self.spawn_prefab(&key, Some(ConnectionId::AUTHORITY))?;
        self.server_player = Some(id);
        info!(entity = %id, prefab = %key, "Server player spawned");
        Ok(id)
    }

    /// Overrides a fresh player tree with state blobs shipped by its peer,
    /// one per replicated node in pre-order.
    pub fn apply_player_init(&mut self, id: EntityId, blobs: &[Vec<u8>]) -> Result<(), SpawnError> {
        let root = self.world.find(id).ok_or(SpawnError::UnknownEntity(id))?;
        let nodes = self.unit_nodes(root);
        if nodes.len() != blobs.len() {
            error!(
                entity = %id,
                local = nodes.len(),
                remote = blobs.len(),
                "Player init data does not match the prefab topology"
            );
        }
        for (node, blob) in nodes.into_iter().zip(blobs) {
            self.world.apply_state(node, blob)?;
        }
        Ok(())
    }

    /// Queues the entity and everything below it for destruction and freezes
    /// it locally. A tree still waiting for its spawn keeps that spawn, so
    /// the next broadcast carries the spawn followed by the destroy.
    pub fn despawn(&mut self, id: EntityId) -> Result<(), SpawnError> {
        let node = self.world.find(id).ok_or(SpawnError::UnknownEntity(id))?;
        let lifecycle = self
            .world
            .entity(node)
            .map(|e| e.lifecycle)
            .ok_or(SpawnError::NotReplicated)?;
        if matches!(lifecycle, Lifecycle::Despawning | Lifecycle::Destroyed) {
            return Ok(());
        }

        for n in self.world.post_order(node) {
            let Some(e) = self.world.entity_mut(n) else {
                continue;
            };
            let eid = e.id;
            match e.lifecycle {
                Lifecycle::Active | Lifecycle::Spawned | Lifecycle::Uninitialized => {
                    e.lifecycle = Lifecycle::Despawning;
                    if !self.pending_destroy.contains(&eid) {
                        self.pending_destroy.push(eid);
                    }
                }
                Lifecycle::Despawning | Lifecycle::Destroyed => {}
            }
        }
        debug!(entity = %id, queued = self.pending_destroy.len(), "Despawn queued");
        Ok(())
    }

    /// Despawns the player of a connection that went away.
    pub fn despawn_client_player(&mut self, conn: ConnectionId) -> Option<EntityId> {
        let id = self.players.remove(&conn)?;
        if let Err(e) = self.despawn(id) {
            warn!(client_id = %conn, entity = %id, error = %e, "Player despawn failed");
        }
        Some(id)
    }

    /// Applies a peer's state change if the peer may change the entity.
    /// Either way the entity is marked dirty, so the resulting authoritative
    /// state goes out with the next broadcast. Returns whether the change
    /// was accepted.
    pub fn apply_change(
        &mut self,
        id: EntityId,
        requester: ConnectionId,
        state: &[u8],
    ) -> Result<bool, SpawnError> {
        let node = self.world.find(id).ok_or(SpawnError::UnknownEntity(id))?;
        let e = self.world.entity(node).ok_or(SpawnError::NotReplicated)?;
        if !e.may_be_changed_by(requester) {
            error!(
                entity = %id,
                requester = %requester,
                owner = %e.owner,
                "Change refused: requester does not own the entity"
            );
            self.world.mark_dirty(node);
            return Ok(false);
        }
        self.world.apply_state(node, state)?;
        self.world.mark_dirty(node);
        Ok(true)
    }

    /// May `requester` destroy `id`?
    pub fn may_destroy(&self, id: EntityId, requester: ConnectionId) -> Result<bool, SpawnError> {
        let e = self.world.get(id).ok_or(SpawnError::UnknownEntity(id))?;
        Ok(e.may_be_changed_by(requester))
    }

    fn is_unit_root(&self, id: EntityId) -> bool {
        self.spawned.contains(&id) || self.pending_spawn.contains(&id) || self.scene.contains(&id)
    }

    /// Replicated nodes announced by the record of `root`, in pre-order.
    fn unit_nodes(&self, root: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack = vec![root];
        while let Some(n) = stack.pop() {
            let Some(node) = self.world.node(n) else {
                continue;
            };
            if let Some(e) = node.entity() {
                if n != root && self.is_unit_root(e.id) {
                    continue;
                }
                out.push(n);
            }
            stack.extend(node.children().iter().rev().copied());
        }
        out
    }

    fn record(
        &self,
        kind: SpawnKind,
        root: NodeId,
        nodes: &[NodeId],
    ) -> Result<SpawnRecord, SpawnError> {
        let entity = self.world.entity(root).ok_or(SpawnError::NotReplicated)?;
        let mut spawn_data = Vec::with_capacity(nodes.len());
        let mut init_data = Vec::with_capacity(nodes.len());
        for node in nodes {
            spawn_data.push(self.world.serialize_on_spawn(*node)?);
            init_data.push(self.world.serialize_state(*node)?);
        }
        Ok(SpawnRecord {
            kind,
            id: entity.id,
            prefab_key: entity.prefab_key.clone().unwrap_or_default(),
            parent: self.world.replicated_parent(root),
            spawn_data,
            init_data,
        })
    }

    fn forget(&mut self, removed: &[EntityId]) {
        for id in removed {
            self.spawned.remove(id);
            self.pending_spawn.retain(|p| p != id);
            self.scene.retain(|s| s != id);
            self.players.retain(|_, p| p != id);
            if self.server_player == Some(*id) {
                self.server_player = None;
            }
        }
    }

    /// Builds the next broadcast: queued spawns go live (start hooks run,
    /// dirty cleared, full record included), queued destroys are removed,
    /// and every remaining dirty entity contributes a delta and is reset.
    ///
    /// With `collect_deltas == false` (nobody to send to) the steady-state
    /// dirty flags are left alone.
    pub fn build_update(&mut self, collect_deltas: bool) -> (StateUpdate, Vec<OutgoingRpc>) {
        let mut update = StateUpdate::default();
        let mut outbox = Vec::new();

        let pending = self.pending_spawn.clone();
        for id in &pending {
            let Some(root) = self.world.find(*id) else {
                continue;
            };
            let nodes = self.unit_nodes(root);
            for node in &nodes {
                // Doomed before it went out: announced, never started.
                let doomed = self
                    .world
                    .entity(*node)
                    .is_some_and(|e| e.lifecycle == Lifecycle::Despawning);
                if !doomed {
                    outbox.extend(self.world.start_entity(*node, Role::Authority));
                }
                self.world.reset_dirty(*node);
            }
            match self.record(SpawnKind::PrefabObject, root, &nodes) {
                Ok(record) => update.spawns.push(record),
                Err(e) => error!(entity = %id, error = %e, "Spawn record failed"),
            }
            self.spawned.insert(*id);
        }
        self.pending_spawn.retain(|p| !pending.contains(p));

        for id in std::mem::take(&mut self.pending_destroy) {
            match self.world.find(id) {
                Some(node) => {
                    let removed = self.world.remove(node);
                    self.forget(&removed);
                }
                None => self.forget(&[id]),
            }
            update.destroys.push(id);
        }

        if collect_deltas {
            for id in self.world.entity_ids() {
                let Some(node) = self.world.find(id) else {
                    continue;
                };
                if !self.world.is_dirty(node) {
                    continue;
                }
                match self.world.serialize_state(node) {
                    Ok(blob) => {
                        update.deltas.push((id, blob));
                        self.world.reset_dirty(node);
                    }
                    Err(e) => error!(entity = %id, error = %e, "State serialization failed"),
                }
            }
        }
        (update, outbox)
    }

    /// Snapshot for a newly accepted peer: its own player (bound, not
    /// instantiated), every scene object, and every announced dynamic tree
    /// except that player.
    pub fn build_initial_state(&self, receiver: ConnectionId) -> InitialState {
        let mut records = Vec::new();
        let own = self.players.get(&receiver).copied();

        if let Some(node) = own.and_then(|id| self.world.find(id)) {
            let nodes = self.unit_nodes(node);
            match self.record(SpawnKind::PlayerObject, node, &nodes) {
                Ok(r) => records.push(r),
                Err(e) => error!(client_id = %receiver, error = %e, "Player record failed"),
            }
        }
        for id in &self.scene {
            let Some(node) = self.world.find(*id) else {
                continue;
            };
            match self.record(SpawnKind::SceneObject, node, &[node]) {
                Ok(r) => records.push(r),
                Err(e) => error!(entity = %id, error = %e, "Scene record failed"),
            }
        }
        for id in &self.spawned {
            if Some(*id) == own {
                continue;
            }
            let Some(node) = self.world.find(*id) else {
                continue;
            };
            let nodes = self.unit_nodes(node);
            match self.record(SpawnKind::PrefabObject, node, &nodes) {
                Ok(r) => records.push(r),
                Err(e) => error!(entity = %id, error = %e, "Spawn record failed"),
            }
        }
        InitialState { records }
    }

    /// Drops every table and the world.
    pub fn clear(&mut self) {
        self.world = World::new();
        self.next_id = 1;
        self.scene.clear();
        self.spawned.clear();
        self.pending_spawn.clear();
        self.pending_destroy.clear();
        self.players.clear();
        self.server_player = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use netsync_shared::{
        demo::{demo_prefabs, demo_scene, Lamp, CRATE_PREFAB, LAMP_PREFAB},
        math::Vec3,
    };

    fn spawner() -> AuthoritySpawner {
        let mut s = AuthoritySpawner::new(demo_prefabs());
        s.initialize_scene(demo_scene()).unwrap();
        s
    }

    #[test]
    fn scene_ids_follow_scene_order() {
        let s = spawner();
        assert_eq!(s.scene(), [EntityId(1), EntityId(2)]);
        let door = s.world().get(EntityId(1)).unwrap();
        assert!(door.is_active());
        assert!(door.behaviour::<Lamp>().is_some());
    }

    #[test]
    fn spawn_assigns_fresh_ids_in_pre_order() {
        let mut s = spawner();
        let lamp = s.spawn_prefab(LAMP_PREFAB, None).unwrap();
        assert_eq!(lamp, EntityId(3));
        // Bulb below a plain shade node.
        let bulb = s.world().find(EntityId(4)).unwrap();
        assert_eq!(s.world().replicated_parent(bulb), lamp);
        assert!(s.is_pending_spawn(lamp));

        let (update, _) = s.build_update(true);
        assert_eq!(update.spawns.len(), 1);
        assert_eq!(update.spawns[0].spawn_data.len(), 2);
        assert_eq!(update.spawns[0].prefab_key, LAMP_PREFAB);
        assert!(s.is_spawned(lamp));
        assert!(s.world().get(lamp).unwrap().is_active());
        // Freshly spawned entities do not show up as deltas.
        assert!(update.deltas.is_empty());
    }

    #[test]
    fn despawn_is_post_order_and_deferred() {
        let mut s = spawner();
        let lamp = s.spawn_prefab(LAMP_PREFAB, None).unwrap();
        s.build_update(true);

        s.despawn(lamp).unwrap();
        s.despawn(lamp).unwrap();
        assert_eq!(s.pending_destroys(), [EntityId(4), lamp]);
        assert!(s.world().get(lamp).is_some());

        let (update, _) = s.build_update(true);
        assert_eq!(update.destroys, [EntityId(4), lamp]);
        assert!(s.world().get(lamp).is_none());
        assert!(matches!(
            s.despawn(lamp),
            Err(SpawnError::UnknownEntity(_))
        ));
    }

    #[test]
    fn spawn_then_despawn_in_one_tick_sends_both() {
        let mut s = spawner();
        let id = s.spawn_prefab(CRATE_PREFAB, None).unwrap();
        s.despawn(id).unwrap();
        assert!(s.is_pending_spawn(id));
        assert_eq!(s.pending_destroys(), [id]);

        let (update, outbox) = s.build_update(true);
        assert_eq!(update.spawns.len(), 1);
        assert_eq!(update.spawns[0].id, id);
        assert_eq!(update.destroys, [id]);
        assert!(outbox.is_empty());
        assert!(s.world().find(id).is_none());
        assert!(!s.is_spawned(id));
    }

    #[test]
    fn despawning_a_parent_also_destroys_its_queued_nested_spawn() {
        let mut s = spawner();
        let lamp = s.spawn_prefab(LAMP_PREFAB, None).unwrap();
        s.build_update(true);
        let tree = s.prefabs().build(CRATE_PREFAB).unwrap();
        let crate_id = s.spawn_with_parent(tree, lamp, None).unwrap();

        s.despawn(lamp).unwrap();
        let (update, _) = s.build_update(true);
        assert_eq!(update.spawns.len(), 1);
        assert_eq!(update.spawns[0].id, crate_id);
        assert!(update.destroys.contains(&crate_id));
        assert_eq!(update.destroys.last(), Some(&lamp));
        assert!(s.world().find(crate_id).is_none());
    }

    #[test]
    fn empty_receiver_list_keeps_dirty_flags() {
        let mut s = spawner();
        let door = s.world().find(EntityId(1)).unwrap();
        s.world_mut().node_mut(door).unwrap().local.position = Vec3::new(9.0, 0.0, 0.0);

        let (update, _) = s.build_update(false);
        assert!(update.deltas.is_empty());
        assert!(s.world().is_dirty(door));

        let (update, _) = s.build_update(true);
        assert_eq!(update.deltas.len(), 1);
        assert!(!s.world().is_dirty(door));
    }

    #[test]
    fn ownership_gate_on_changes() {
        let mut s = spawner();
        let id = s.spawn_prefab(CRATE_PREFAB, Some(ConnectionId(7))).unwrap();
        s.build_update(true);
        let node = s.world().find(id).unwrap();
        let original = s.world().serialize_state(node).unwrap();

        s.world_mut().node_mut(node).unwrap().local.position = Vec3::new(1.0, 1.0, 1.0);
        let moved = s.world().serialize_state(node).unwrap();
        s.world_mut().node_mut(node).unwrap().local.position = Vec3::ZERO;
        s.world_mut().reset_dirty(node);

        assert!(!s.apply_change(id, ConnectionId(3), &moved).unwrap());
        assert!(s.world().is_dirty(node));
        assert_eq!(s.world().serialize_state(node).unwrap(), original);

        s.world_mut().reset_dirty(node);
        assert!(s.apply_change(id, ConnectionId(7), &moved).unwrap());
        assert_eq!(s.world().world_pose(node).position, Vec3::new(1.0, 1.0, 1.0));
        assert!(s.world().is_dirty(node));
    }

    #[test]
    fn initial_state_binds_own_player_and_skips_pending() {
        let mut s = spawner();
        let p1 = s.spawn_client_player(ConnectionId(1), ClientKind::Vr).unwrap();
        s.build_update(true);
        let p2 = s.spawn_client_player(ConnectionId(2), ClientKind::Ar).unwrap();
        let _pending = s.spawn_prefab(CRATE_PREFAB, None).unwrap();

        let state = s.build_initial_state(ConnectionId(2));
        let kinds: Vec<_> = state.records.iter().map(|r| (r.kind, r.id)).collect();
        assert_eq!(
            kinds,
            [
                (SpawnKind::PlayerObject, p2),
                (SpawnKind::SceneObject, EntityId(1)),
                (SpawnKind::SceneObject, EntityId(2)),
                (SpawnKind::PrefabObject, p1),
            ]
        );
    }

    #[test]
    fn disconnect_despawns_player() {
        let mut s = spawner();
        let p = s.spawn_client_player(ConnectionId(5), ClientKind::Desktop).unwrap();
        s.build_update(true);
        assert_eq!(s.despawn_client_player(ConnectionId(5)), Some(p));
        let (update, _) = s.build_update(true);
        assert!(update.destroys.contains(&p));
        assert_eq!(s.player_of(ConnectionId(5)), None);
    }

    #[test]
    fn nested_spawn_is_its_own_unit() {
        let mut s = spawner();
        let lamp = s.spawn_prefab(LAMP_PREFAB, None).unwrap();
        s.build_update(true);
        let tree = s.prefabs().build(CRATE_PREFAB).unwrap();
        let crate_id = s.spawn_with_parent(tree, lamp, None).unwrap();

        let state = s.build_initial_state(ConnectionId(9));
        let lamp_record = state.records.iter().find(|r| r.id == lamp).unwrap();
        assert_eq!(lamp_record.spawn_data.len(), 2);

        let (update, _) = s.build_update(true);
        assert_eq!(update.spawns[0].id, crate_id);
        assert_eq!(update.spawns[0].parent, lamp);
    }
}
