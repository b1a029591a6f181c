//! Entity arena.
//!
//! Nodes live in a flat map keyed by `NodeId` and reference each other by id
//! (parent and ordered children). A node may carry a `ReplicatedEntity`;
//! plain nodes exist for structure and as named anchors.
//!
//! Subtree walks only visit replicated nodes:
//! - pre-order assigns ids and builds spawn records,
//! - post-order queues destroys (children before parents).

use std::collections::{BTreeMap, HashMap};

use bytes::Bytes;
use tracing::error;

use crate::{
    behaviour::{NetContext, OutgoingRpc, Role},
    codec::{deserialize, serialize, CodecError},
    entity::{EntityState, Lifecycle, PositionSync, ReplicatedEntity, SpawnState, SyncFlags},
    math::{Pose, Quat, Vec3},
    net::{ConnectionId, EntityId},
    rpc::{BehaviourCall, RpcError},
    spawn::SpawnError,
};

/// Arena handle. Stable for the node's lifetime, never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u64);

/// One node of the arena.
#[derive(Debug)]
pub struct Node {
    pub name: String,
    pub local: Pose,
    pub active: bool,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    entity: Option<ReplicatedEntity>,
}

impl Node {
    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub fn children(&self) -> &[NodeId] {
        &self.children
    }

    pub fn entity(&self) -> Option<&ReplicatedEntity> {
        self.entity.as_ref()
    }

    pub fn entity_mut(&mut self) -> Option<&mut ReplicatedEntity> {
        self.entity.as_mut()
    }
}

/// Description of a node tree, used for scene setup and prefab factories.
#[derive(Debug)]
pub struct NodeBuilder {
    name: String,
    local: Pose,
    active: bool,
    entity: Option<ReplicatedEntity>,
    children: Vec<NodeBuilder>,
}

impl NodeBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            local: Pose::IDENTITY,
            active: true,
            entity: None,
            children: Vec::new(),
        }
    }

    pub fn at(mut self, position: Vec3) -> Self {
        self.local.position = position;
        self
    }

    pub fn rotated(mut self, rotation: Quat) -> Self {
        self.local.rotation = rotation;
        self
    }

    pub fn replicated(mut self, entity: ReplicatedEntity) -> Self {
        self.entity = Some(entity);
        self
    }

    pub fn child(mut self, child: NodeBuilder) -> Self {
        self.children.push(child);
        self
    }

    pub fn inactive(mut self) -> Self {
        self.active = false;
        self
    }

    pub fn entity_mut(&mut self) -> Option<&mut ReplicatedEntity> {
        self.entity.as_mut()
    }
}

/// Node arena with an `EntityId` index.
#[derive(Default)]
pub struct World {
    next_node: u64,
    nodes: BTreeMap<NodeId, Node>,
    by_entity: HashMap<EntityId, NodeId>,
}

impl World {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a node tree under `parent` and returns the root.
    pub fn insert(&mut self, builder: NodeBuilder, parent: Option<NodeId>) -> NodeId {
        let parent = parent.filter(|p| self.nodes.contains_key(p));
        let id = NodeId(self.next_node);
        self.next_node += 1;

        let NodeBuilder {
            name,
            local,
            active,
            entity,
            children,
        } = builder;
        self.nodes.insert(
            id,
            Node {
                name,
                local,
                active,
                parent,
                children: Vec::new(),
                entity,
            },
        );
        if let Some(p) = parent.and_then(|p| self.nodes.get_mut(&p)) {
            p.children.push(id);
        }
        for child in children {
            self.insert(child, Some(id));
        }
        id
    }

    /// Removes `root` and everything under it. Returns the entity ids that
    /// were indexed in the subtree.
    pub fn remove(&mut self, root: NodeId) -> Vec<EntityId> {
        let Some(parent) = self.nodes.get(&root).map(|n| n.parent) else {
            return Vec::new();
        };
        if let Some(p) = parent.and_then(|p| self.nodes.get_mut(&p)) {
            p.children.retain(|c| *c != root);
        }

        let mut removed = Vec::new();
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            if let Some(node) = self.nodes.remove(&id) {
                stack.extend(node.children.iter().copied());
                if let Some(e) = node.entity {
                    if self.by_entity.get(&e.id) == Some(&id) {
                        self.by_entity.remove(&e.id);
                        removed.push(e.id);
                    }
                }
            }
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(&id)
    }

    pub fn node_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.nodes.get_mut(&id)
    }

    pub fn entity(&self, node: NodeId) -> Option<&ReplicatedEntity> {
        self.nodes.get(&node).and_then(|n| n.entity.as_ref())
    }

    pub fn entity_mut(&mut self, node: NodeId) -> Option<&mut ReplicatedEntity> {
        self.nodes.get_mut(&node).and_then(|n| n.entity.as_mut())
    }

    /// Node indexed under `id`.
    pub fn find(&self, id: EntityId) -> Option<NodeId> {
        self.by_entity.get(&id).copied()
    }

    pub fn get(&self, id: EntityId) -> Option<&ReplicatedEntity> {
        self.find(id).and_then(|n| self.entity(n))
    }

    pub fn get_mut(&mut self, id: EntityId) -> Option<&mut ReplicatedEntity> {
        let node = self.find(id)?;
        self.entity_mut(node)
    }

    /// Ids of every indexed entity, ascending.
    pub fn entity_ids(&self) -> Vec<EntityId> {
        let mut ids: Vec<EntityId> = self.by_entity.keys().copied().collect();
        ids.sort();
        ids
    }

    /// Indexes the entity on `node` under `id`.
    pub fn assign_id(&mut self, node: NodeId, id: EntityId) -> Result<(), SpawnError> {
        if let Some(existing) = self.by_entity.get(&id) {
            if *existing != node {
                return Err(SpawnError::DuplicateId(id));
            }
        }
        let entity = self.entity_mut(node).ok_or(SpawnError::NotReplicated)?;
        let old = std::mem::replace(&mut entity.id, id);
        if old != EntityId::NONE && old != id {
            self.by_entity.remove(&old);
        }
        self.by_entity.insert(id, node);
        Ok(())
    }

    /// Drops the id index of `node` and resets its entity id.
    pub fn clear_id(&mut self, node: NodeId) {
        if let Some(entity) = self.entity_mut(node) {
            let old = std::mem::replace(&mut entity.id, EntityId::NONE);
            self.by_entity.remove(&old);
        }
    }

    /// Replicated nodes of the subtree, parents before children.
    pub fn pre_order(&self, root: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            let Some(node) = self.nodes.get(&id) else {
                continue;
            };
            if node.entity.is_some() {
                out.push(id);
            }
            stack.extend(node.children.iter().rev().copied());
        }
        out
    }

    /// Replicated nodes of the subtree, children before parents.
    pub fn post_order(&self, root: NodeId) -> Vec<NodeId> {
        fn walk(world: &World, id: NodeId, out: &mut Vec<NodeId>) {
            let Some(node) = world.nodes.get(&id) else {
                return;
            };
            for child in &node.children {
                walk(world, *child, out);
            }
            if node.entity.is_some() {
                out.push(id);
            }
        }
        let mut out = Vec::new();
        walk(self, root, &mut out);
        out
    }

    /// Closest replicated ancestor's id, or `EntityId::NONE`.
    pub fn replicated_parent(&self, node: NodeId) -> EntityId {
        let mut cur = self.nodes.get(&node).and_then(|n| n.parent);
        while let Some(id) = cur {
            let Some(n) = self.nodes.get(&id) else {
                break;
            };
            if let Some(e) = &n.entity {
                return e.id;
            }
            cur = n.parent;
        }
        EntityId::NONE
    }

    /// True if the node or one of its ancestors is a player entity.
    pub fn in_player_subtree(&self, node: NodeId) -> bool {
        self.any_ancestor(node, |e| e.is_player)
    }

    /// True if the node belongs to a tree built from a prefab.
    pub fn in_prefab_subtree(&self, node: NodeId) -> bool {
        self.any_ancestor(node, |e| e.prefab_key.is_some())
    }

    fn any_ancestor(&self, node: NodeId, pred: impl Fn(&ReplicatedEntity) -> bool) -> bool {
        let mut cur = Some(node);
        while let Some(id) = cur {
            let Some(n) = self.nodes.get(&id) else {
                return false;
            };
            if n.entity.as_ref().is_some_and(&pred) {
                return true;
            }
            cur = n.parent;
        }
        false
    }

    /// First node with this name, in insertion order.
    pub fn find_by_name(&self, name: &str) -> Option<NodeId> {
        self.nodes
            .iter()
            .find(|(_, n)| n.name == name)
            .map(|(id, _)| *id)
    }

    /// Pre-placed replicated nodes in scene order, skipping player and
    /// prefab subtrees.
    pub fn scene_nodes(&self) -> Vec<NodeId> {
        let mut scene: Vec<(u32, NodeId)> = self
            .nodes
            .iter()
            .filter_map(|(id, n)| {
                let e = n.entity.as_ref()?;
                (!self.in_prefab_subtree(*id) && !self.in_player_subtree(*id))
                    .then_some((e.scene_index, *id))
            })
            .collect();
        scene.sort();
        scene.into_iter().map(|(_, id)| id).collect()
    }

    /// Sets the active flag of the whole subtree.
    pub fn set_active(&mut self, root: NodeId, active: bool) {
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            if let Some(node) = self.nodes.get_mut(&id) {
                node.active = active;
                stack.extend(node.children.iter().copied());
            }
        }
    }

    // ─── Spatial state ───

    pub fn world_pose(&self, node: NodeId) -> Pose {
        let mut chain = Vec::new();
        let mut cur = Some(node);
        while let Some(id) = cur {
            let Some(n) = self.nodes.get(&id) else {
                break;
            };
            chain.push(n.local);
            cur = n.parent;
        }
        chain
            .into_iter()
            .rev()
            .fold(Pose::IDENTITY, |acc, local| acc.compose(local))
    }

    pub fn set_world_pose(&mut self, node: NodeId, pose: Pose) {
        let parent_pose = self
            .nodes
            .get(&node)
            .and_then(|n| n.parent)
            .map_or(Pose::IDENTITY, |p| self.world_pose(p));
        if let Some(n) = self.nodes.get_mut(&node) {
            n.local = parent_pose.relative(pose);
        }
    }

    fn anchor_position(&self, entity: EntityId, anchor: &str) -> Vec3 {
        match self.find_by_name(anchor) {
            Some(a) => self.world_pose(a).position,
            None => {
                error!(%entity, anchor, "Anchor not found, using zero offset");
                Vec3::ZERO
            }
        }
    }

    /// Pose in the entity's sync frame.
    pub fn synced_pose(&self, node: NodeId) -> Pose {
        let Some(n) = self.nodes.get(&node) else {
            return Pose::IDENTITY;
        };
        let Some(e) = &n.entity else {
            return n.local;
        };
        match &e.position_sync {
            PositionSync::Local => n.local,
            PositionSync::Global => self.world_pose(node),
            PositionSync::Relative(anchor) => {
                let global = self.world_pose(node);
                Pose::new(
                    global.position - self.anchor_position(e.id, anchor),
                    global.rotation,
                )
            }
        }
    }

    /// Writes the position and/or rotation of `pose`, expressed in the
    /// entity's sync frame. `parts` selects `POSITION` and `ROTATION`.
    pub fn apply_synced_pose(&mut self, node: NodeId, pose: Pose, parts: SyncFlags) {
        let Some(n) = self.nodes.get(&node) else {
            return;
        };
        let write_pos = parts.contains(SyncFlags::POSITION);
        let write_rot = parts.contains(SyncFlags::ROTATION);
        let mode = n.entity.as_ref().map(|e| (e.id, e.position_sync.clone()));

        match mode {
            None | Some((_, PositionSync::Local)) => {
                if let Some(n) = self.nodes.get_mut(&node) {
                    if write_pos {
                        n.local.position = pose.position;
                    }
                    if write_rot {
                        n.local.rotation = pose.rotation;
                    }
                }
            }
            Some((id, sync)) => {
                let offset = match &sync {
                    PositionSync::Relative(anchor) => self.anchor_position(id, anchor),
                    _ => Vec3::ZERO,
                };
                let mut global = self.world_pose(node);
                if write_pos {
                    global.position = pose.position + offset;
                }
                if write_rot {
                    global.rotation = pose.rotation;
                }
                self.set_world_pose(node, global);
            }
        }
    }

    // ─── Dirty tracking ───

    /// Spatial change since the last reset, any dirty behaviour, or an
    /// explicit mark. Entities that are not active are never dirty.
    pub fn is_dirty(&self, node: NodeId) -> bool {
        let Some(e) = self.entity(node) else {
            return false;
        };
        if !e.is_active() {
            return false;
        }
        if e.marked_dirty || e.behaviours_dirty() {
            return true;
        }
        let pose = self.synced_pose(node);
        (e.sync.contains(SyncFlags::POSITION) && pose.position != e.last_synced.position)
            || (e.sync.contains(SyncFlags::ROTATION) && pose.rotation != e.last_synced.rotation)
    }

    pub fn reset_dirty(&mut self, node: NodeId) {
        let pose = self.synced_pose(node);
        if let Some(e) = self.entity_mut(node) {
            e.marked_dirty = false;
            e.last_synced = pose;
            e.reset_behaviours();
        }
    }

    pub fn mark_dirty(&mut self, node: NodeId) {
        if let Some(e) = self.entity_mut(node) {
            e.mark_dirty();
        }
    }

    // ─── Serialization ───

    /// One-time spawn blob of the entity on `node`.
    pub fn serialize_on_spawn(&self, node: NodeId) -> Result<Bytes, CodecError> {
        let e = self.entity(node).ok_or(CodecError::Invalid(
            "node carries no replicated entity".into(),
        ))?;
        serialize(&e.spawn_state(self.synced_pose(node)), false)
    }

    /// Applies a spawn blob and places the node at the start pose.
    pub fn deserialize_on_spawn(&mut self, node: NodeId, data: &[u8]) -> Result<(), CodecError> {
        let state: SpawnState = deserialize(data)?;
        let e = self.entity_mut(node).ok_or(CodecError::Invalid(
            "node carries no replicated entity".into(),
        ))?;
        let start = e.apply_spawn_state(&state);
        e.last_synced = start;
        self.apply_synced_pose(node, start, SyncFlags::POSITION | SyncFlags::ROTATION);
        Ok(())
    }

    /// Regular state blob: synced pose plus every behaviour's fields.
    pub fn serialize_state(&self, node: NodeId) -> Result<Bytes, CodecError> {
        let e = self.entity(node).ok_or(CodecError::Invalid(
            "node carries no replicated entity".into(),
        ))?;
        let pose = self.synced_pose(node);
        let behaviours = if e.sync.contains(SyncFlags::VARS) {
            e.serialize_behaviours()?
        } else {
            Vec::new()
        };
        serialize(
            &EntityState {
                position: pose.position,
                rotation: pose.rotation,
                behaviours,
            },
            false,
        )
    }

    /// Applies a state blob. Pose parts without interpolation are written
    /// immediately; if the entity interpolates anything, the incoming pose is
    /// returned as the new interpolation target.
    pub fn deserialize_state(
        &mut self,
        node: NodeId,
        data: &[u8],
    ) -> Result<Option<Pose>, CodecError> {
        let state: EntityState = deserialize(data)?;
        let e = self.entity_mut(node).ok_or(CodecError::Invalid(
            "node carries no replicated entity".into(),
        ))?;
        let sync = e.sync;
        if sync.contains(SyncFlags::VARS) {
            e.deserialize_behaviours(&state.behaviours)?;
        }

        let target = Pose::new(state.position, state.rotation);
        let mut immediate = SyncFlags::empty();
        if sync.contains(SyncFlags::POSITION) && !sync.contains(SyncFlags::LERP_POSITION) {
            immediate |= SyncFlags::POSITION;
        }
        if sync.contains(SyncFlags::ROTATION) && !sync.contains(SyncFlags::LERP_ROTATION) {
            immediate |= SyncFlags::ROTATION;
        }
        if !immediate.is_empty() {
            self.apply_synced_pose(node, target, immediate);
        }

        let lerped = (sync.contains(SyncFlags::POSITION) && sync.contains(SyncFlags::LERP_POSITION))
            || (sync.contains(SyncFlags::ROTATION) && sync.contains(SyncFlags::LERP_ROTATION));
        Ok(lerped.then_some(target))
    }

    /// Applies a state blob with every synced pose part written at once.
    /// Used for authoritative copies and for freshly spawned nodes.
    pub fn apply_state(&mut self, node: NodeId, data: &[u8]) -> Result<(), CodecError> {
        if let Some(target) = self.deserialize_state(node, data)? {
            let parts = self.entity(node).map_or(SyncFlags::empty(), |e| {
                e.sync & (SyncFlags::POSITION | SyncFlags::ROTATION)
            });
            self.apply_synced_pose(node, target, parts);
        }
        Ok(())
    }

    // ─── Hooks and calls ───

    /// Marks the entity live and runs every behaviour's start hook once.
    pub fn start_entity(&mut self, node: NodeId, role: Role) -> Vec<OutgoingRpc> {
        let Some(e) = self.entity_mut(node) else {
            return Vec::new();
        };
        e.lifecycle = Lifecycle::Active;
        if e.started {
            return Vec::new();
        }
        e.started = true;

        let id = e.id;
        let mut out = Vec::new();
        for (index, slot) in e.behaviours_mut().iter_mut().enumerate() {
            let mut ctx = NetContext::new(id, index, role, None, slot.methods());
            slot.on_network_start(&mut ctx);
            out.extend(ctx.take_outbox());
        }
        out
    }

    /// Runs an inbound call on one behaviour of `entity`.
    pub fn dispatch_rpc(
        &mut self,
        entity: EntityId,
        role: Role,
        sender: ConnectionId,
        call: &BehaviourCall,
    ) -> Result<Vec<OutgoingRpc>, RpcError> {
        let e = self
            .get_mut(entity)
            .ok_or(RpcError::UnknownEntity(entity))?;
        let index = call.behaviour as usize;
        let slot = e
            .behaviours_mut()
            .get_mut(index)
            .ok_or(RpcError::UnknownBehaviour { entity, index })?;
        let mut ctx = NetContext::new(entity, index, role, Some(sender), slot.methods());
        slot.dispatch(&mut ctx, &call.call)?;
        Ok(ctx.take_outbox())
    }

    /// Gives `f` a call context for one behaviour of `entity`, for invoking
    /// RPCs from outside a hook.
    pub fn with_context<F>(
        &mut self,
        entity: EntityId,
        behaviour: usize,
        role: Role,
        f: F,
    ) -> Result<Vec<OutgoingRpc>, RpcError>
    where
        F: FnOnce(&mut NetContext) -> Result<(), RpcError>,
    {
        let e = self.get(entity).ok_or(RpcError::UnknownEntity(entity))?;
        let slot = e.behaviours().get(behaviour).ok_or(RpcError::UnknownBehaviour {
            entity,
            index: behaviour,
        })?;
        let mut ctx = NetContext::new(entity, behaviour, role, None, slot.methods());
        f(&mut ctx)?;
        Ok(ctx.take_outbox())
    }
}
