//! Replicated entities.
//!
//! A `ReplicatedEntity` is the network-facing part of a node in the `World`
//! arena: identity, ownership, sync options and the ordered behaviour list.
//! Spatial state lives on the node; see `World` for the operations that
//! combine both.

use bitflags::bitflags;
use bytes::{BufMut, Bytes, BytesMut};
use tracing::error;

use crate::{
    behaviour::{Behaviour, BehaviourSlot},
    binary_codec,
    codec::{
        put_blob, put_quat, put_str, put_vec3, take_blob, take_bool, take_f32, take_quat,
        take_str, take_u32, take_u64, take_u8, take_vec3, BinarySerializable, CodecError,
    },
    math::{Pose, Quat, Vec3},
    net::{ConnectionId, EntityId},
};

bitflags! {
    /// What an entity replicates and how peers present it.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SyncFlags: u8 {
        const POSITION = 1 << 0;
        const ROTATION = 1 << 1;
        const VARS = 1 << 2;
        const LERP_POSITION = 1 << 3;
        const LERP_ROTATION = 1 << 4;
    }
}

impl Default for SyncFlags {
    fn default() -> Self {
        SyncFlags::POSITION | SyncFlags::ROTATION | SyncFlags::VARS
    }
}

impl SyncFlags {
    pub fn interpolates(self) -> bool {
        self.intersects(SyncFlags::LERP_POSITION | SyncFlags::LERP_ROTATION)
    }
}

/// Frame the synced position is expressed in.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum PositionSync {
    /// Relative to the parent node.
    #[default]
    Local,
    /// World space.
    Global,
    /// World-space offset from the named anchor node.
    Relative(String),
}

impl PositionSync {
    fn tag(&self) -> u8 {
        match self {
            PositionSync::Local => 0,
            PositionSync::Global => 1,
            PositionSync::Relative(_) => 2,
        }
    }

    fn anchor(&self) -> &str {
        match self {
            PositionSync::Relative(name) => name,
            _ => "",
        }
    }

    fn from_parts(tag: u8, anchor: String) -> Result<Self, CodecError> {
        match tag {
            0 => Ok(PositionSync::Local),
            1 => Ok(PositionSync::Global),
            2 => Ok(PositionSync::Relative(anchor)),
            other => Err(CodecError::Invalid(format!("position sync mode {other}"))),
        }
    }
}

/// Lifecycle of an entity on one side of the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Lifecycle {
    /// Built, no id yet.
    #[default]
    Uninitialized,
    /// Id assigned, waiting for the next broadcast.
    Spawned,
    /// Live and replicating.
    Active,
    /// Destroy queued, frozen locally.
    Despawning,
    /// Removed from every table.
    Destroyed,
}

/// Network-facing state of a node.
#[derive(Debug)]
pub struct ReplicatedEntity {
    pub id: EntityId,
    pub owner: ConnectionId,
    pub is_owned: bool,
    /// `None` for objects pre-placed in the scene.
    pub prefab_key: Option<String>,
    /// Stable ordering key among scene objects.
    pub scene_index: u32,
    pub is_player: bool,
    pub lifecycle: Lifecycle,
    pub sync: SyncFlags,
    pub position_sync: PositionSync,
    /// Peer interpolation delay in seconds.
    pub lerp_delay: f32,
    pub(crate) marked_dirty: bool,
    pub(crate) last_synced: Pose,
    pub(crate) started: bool,
    behaviours: Vec<BehaviourSlot>,
}

impl Default for ReplicatedEntity {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplicatedEntity {
    pub fn new() -> Self {
        Self {
            id: EntityId::NONE,
            owner: ConnectionId::AUTHORITY,
            is_owned: false,
            prefab_key: None,
            scene_index: 0,
            is_player: false,
            lifecycle: Lifecycle::Uninitialized,
            sync: SyncFlags::default(),
            position_sync: PositionSync::Local,
            lerp_delay: 0.1,
            marked_dirty: false,
            last_synced: Pose::IDENTITY,
            started: false,
            behaviours: Vec::new(),
        }
    }

    /// Player entities are additionally keyed by their owner connection.
    pub fn player() -> Self {
        Self {
            is_player: true,
            ..Self::new()
        }
    }

    pub fn with_behaviour<B: Behaviour>(mut self, behaviour: B) -> Self {
        self.behaviours.push(BehaviourSlot::new(behaviour));
        self
    }

    pub fn with_sync(mut self, sync: SyncFlags) -> Self {
        self.sync = sync;
        self
    }

    pub fn with_position_sync(mut self, mode: PositionSync) -> Self {
        self.position_sync = mode;
        self
    }

    pub fn with_scene_index(mut self, index: u32) -> Self {
        self.scene_index = index;
        self
    }

    pub fn with_lerp_delay(mut self, seconds: f32) -> Self {
        self.lerp_delay = seconds.max(0.0);
        self
    }

    /// Sets ownership. `None` clears it; an unowned entity always reports
    /// owner 0.
    pub fn set_owner(&mut self, owner: Option<ConnectionId>) {
        match owner {
            Some(conn) => {
                self.is_owned = true;
                self.owner = conn;
            }
            None => {
                self.is_owned = false;
                self.owner = ConnectionId::AUTHORITY;
            }
        }
    }

    /// Ownership gate for peer-originated mutations.
    pub fn may_be_changed_by(&self, requester: ConnectionId) -> bool {
        !self.is_owned || self.owner == requester
    }

    pub fn behaviours(&self) -> &[BehaviourSlot] {
        &self.behaviours
    }

    pub fn behaviours_mut(&mut self) -> &mut [BehaviourSlot] {
        &mut self.behaviours
    }

    pub fn behaviour<B: Behaviour>(&self) -> Option<&B> {
        self.behaviours.iter().find_map(|s| s.get::<B>())
    }

    pub fn behaviour_mut<B: Behaviour>(&mut self) -> Option<&mut B> {
        self.behaviours.iter_mut().find_map(|s| s.get_mut::<B>())
    }

    pub fn mark_dirty(&mut self) {
        self.marked_dirty = true;
    }

    pub fn is_marked_dirty(&self) -> bool {
        self.marked_dirty
    }

    /// Any behaviour field dirty (only counts when fields are synced).
    pub fn behaviours_dirty(&self) -> bool {
        self.sync.contains(SyncFlags::VARS) && self.behaviours.iter().any(|b| b.is_dirty())
    }

    pub fn is_active(&self) -> bool {
        self.lifecycle == Lifecycle::Active
    }

    pub(crate) fn reset_behaviours(&mut self) {
        for b in &mut self.behaviours {
            b.reset_dirty();
        }
    }

    /// Behaviour blobs keyed by index, for a state record.
    pub fn serialize_behaviours(&self) -> Result<Vec<(u32, Bytes)>, CodecError> {
        self.behaviours
            .iter()
            .enumerate()
            .map(|(i, b)| Ok((i as u32, b.serialize()?)))
            .collect()
    }

    /// Applies behaviour blobs. Out-of-range indices are reported and skipped.
    pub fn deserialize_behaviours(&mut self, data: &[(u32, Bytes)]) -> Result<(), CodecError> {
        for (index, blob) in data {
            match self.behaviours.get_mut(*index as usize) {
                Some(slot) => slot.deserialize(blob)?,
                None => error!(
                    entity = %self.id,
                    index,
                    count = self.behaviours.len(),
                    "State for unknown behaviour index"
                ),
            }
        }
        Ok(())
    }

    /// One-time construction parameters.
    pub fn spawn_state(&self, start: Pose) -> SpawnState {
        SpawnState {
            position_sync: self.position_sync.clone(),
            is_owned: self.is_owned,
            owner: self.owner,
            lerp_delay: self.lerp_delay,
            behaviour_count: self.behaviours.len() as u32,
            start,
        }
    }

    /// Applies construction parameters and returns the start pose. A
    /// behaviour count that differs from the local one is a topology error;
    /// it is reported and the rest is applied anyway.
    pub fn apply_spawn_state(&mut self, state: &SpawnState) -> Pose {
        if state.behaviour_count as usize != self.behaviours.len() {
            error!(
                entity = %self.id,
                remote = state.behaviour_count,
                local = self.behaviours.len(),
                "Behaviour count mismatch between authority and peer"
            );
        }
        self.position_sync = state.position_sync.clone();
        self.is_owned = state.is_owned;
        self.owner = if state.is_owned {
            state.owner
        } else {
            ConnectionId::AUTHORITY
        };
        self.lerp_delay = state.lerp_delay;
        state.start
    }
}

/// Spawn-time record of one entity.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SpawnState {
    pub position_sync: PositionSync,
    pub is_owned: bool,
    pub owner: ConnectionId,
    pub lerp_delay: f32,
    pub behaviour_count: u32,
    /// Synced pose at spawn time.
    pub start: Pose,
}

impl BinarySerializable for SpawnState {
    fn write_to(&self, buf: &mut BytesMut) {
        buf.put_u8(self.position_sync.tag());
        put_str(buf, self.position_sync.anchor());
        buf.put_u8(self.is_owned as u8);
        buf.put_u64_le(self.owner.0);
        buf.put_f32_le(self.lerp_delay);
        buf.put_u32_le(self.behaviour_count);
        put_vec3(buf, self.start.position);
        put_quat(buf, self.start.rotation);
    }

    fn read_from(&mut self, buf: &mut Bytes) -> Result<(), CodecError> {
        let tag = take_u8(buf)?;
        let anchor = take_str(buf)?;
        self.position_sync = PositionSync::from_parts(tag, anchor)?;
        self.is_owned = take_bool(buf)?;
        self.owner = ConnectionId(take_u64(buf)?);
        self.lerp_delay = take_f32(buf)?;
        self.behaviour_count = take_u32(buf)?;
        self.start = Pose::new(take_vec3(buf)?, take_quat(buf)?);
        Ok(())
    }
}

/// Regular state record: synced pose plus behaviour blobs keyed by index.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityState {
    pub position: Vec3,
    pub rotation: Quat,
    pub behaviours: Vec<(u32, Bytes)>,
}

impl Default for EntityState {
    fn default() -> Self {
        Self {
            position: Vec3::ZERO,
            rotation: Quat::IDENTITY,
            behaviours: Vec::new(),
        }
    }
}

impl BinarySerializable for EntityState {
    fn write_to(&self, buf: &mut BytesMut) {
        put_vec3(buf, self.position);
        put_quat(buf, self.rotation);
        buf.put_u32_le(self.behaviours.len() as u32);
        for (index, blob) in &self.behaviours {
            buf.put_u32_le(*index);
            put_blob(buf, blob);
        }
    }

    fn read_from(&mut self, buf: &mut Bytes) -> Result<(), CodecError> {
        self.position = take_vec3(buf)?;
        self.rotation = take_quat(buf)?;
        let count = take_u32(buf)?;
        self.behaviours.clear();
        for _ in 0..count {
            let index = take_u32(buf)?;
            self.behaviours.push((index, take_blob(buf)?));
        }
        Ok(())
    }
}

binary_codec!(SpawnState, EntityState);
