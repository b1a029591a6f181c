//! Spawn protocol records and the prefab table.
//!
//! Spawn, initial-state and update records are self-describing (they write
//! their own layout). Requests and the handshake go through the generic
//! serde path.

use std::{collections::HashMap, fmt, sync::Arc};

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    binary_codec,
    codec::{
        put_blob, put_str, take_blob, take_str, take_u32, take_u64, take_u8, BinarySerializable,
        CodecError,
    },
    config::ClientKind,
    generic_codec,
    net::{ConnectionId, EntityId},
    world::NodeBuilder,
};

#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("unknown entity {0}")]
    UnknownEntity(EntityId),
    #[error("unknown prefab `{0}`")]
    UnknownPrefab(String),
    #[error("entity id {0} is already in use")]
    DuplicateId(EntityId),
    #[error("node carries no replicated entity")]
    NotReplicated,
    #[error("no player prefab registered for {0:?}")]
    NoPlayerPrefab(ClientKind),
    #[error("entity {id}: record carries {remote} nodes, local tree has {local}")]
    TopologyMismatch {
        id: EntityId,
        local: usize,
        remote: usize,
    },
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// How a peer materialises a spawn record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SpawnKind {
    /// Pre-placed in the scene; activated by id.
    SceneObject = 0,
    /// Instantiated from the prefab table.
    PrefabObject = 1,
    /// Bound to the peer's own local player.
    PlayerObject = 2,
}

impl SpawnKind {
    fn from_u8(v: u8) -> Result<Self, CodecError> {
        match v {
            0 => Ok(SpawnKind::SceneObject),
            1 => Ok(SpawnKind::PrefabObject),
            2 => Ok(SpawnKind::PlayerObject),
            other => Err(CodecError::Invalid(format!("spawn kind {other}"))),
        }
    }
}

/// Everything a peer needs to materialise one entity tree. `spawn_data` and
/// `init_data` hold one blob per replicated node, in pre-order.
#[derive(Debug, Clone, PartialEq)]
pub struct SpawnRecord {
    pub kind: SpawnKind,
    pub id: EntityId,
    pub prefab_key: String,
    pub parent: EntityId,
    pub spawn_data: Vec<Bytes>,
    pub init_data: Vec<Bytes>,
}

impl Default for SpawnRecord {
    fn default() -> Self {
        Self {
            kind: SpawnKind::SceneObject,
            id: EntityId::NONE,
            prefab_key: String::new(),
            parent: EntityId::NONE,
            spawn_data: Vec::new(),
            init_data: Vec::new(),
        }
    }
}

fn put_blobs(buf: &mut BytesMut, blobs: &[Bytes]) {
    buf.put_u32_le(blobs.len() as u32);
    for b in blobs {
        put_blob(buf, b);
    }
}

fn take_blobs(buf: &mut Bytes) -> Result<Vec<Bytes>, CodecError> {
    let n = take_u32(buf)?;
    (0..n).map(|_| take_blob(buf)).collect()
}

impl BinarySerializable for SpawnRecord {
    fn write_to(&self, buf: &mut BytesMut) {
        buf.put_u8(self.kind as u8);
        buf.put_u64_le(self.id.0);
        put_str(buf, &self.prefab_key);
        buf.put_u64_le(self.parent.0);
        put_blobs(buf, &self.spawn_data);
        put_blobs(buf, &self.init_data);
    }

    fn read_from(&mut self, buf: &mut Bytes) -> Result<(), CodecError> {
        self.kind = SpawnKind::from_u8(take_u8(buf)?)?;
        self.id = EntityId(take_u64(buf)?);
        self.prefab_key = take_str(buf)?;
        self.parent = EntityId(take_u64(buf)?);
        self.spawn_data = take_blobs(buf)?;
        self.init_data = take_blobs(buf)?;
        Ok(())
    }
}

/// Full snapshot sent once to a newly accepted peer.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct InitialState {
    pub records: Vec<SpawnRecord>,
}

impl BinarySerializable for InitialState {
    fn write_to(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.records.len() as u32);
        for r in &self.records {
            r.write_to(buf);
        }
    }

    fn read_from(&mut self, buf: &mut Bytes) -> Result<(), CodecError> {
        let n = take_u32(buf)?;
        self.records.clear();
        for _ in 0..n {
            let mut r = SpawnRecord::default();
            r.read_from(buf)?;
            self.records.push(r);
        }
        Ok(())
    }
}

/// Differential broadcast. Peers apply spawns, then destroys, then deltas.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StateUpdate {
    pub deltas: Vec<(EntityId, Bytes)>,
    pub spawns: Vec<SpawnRecord>,
    pub destroys: Vec<EntityId>,
}

impl StateUpdate {
    pub fn is_empty(&self) -> bool {
        self.deltas.is_empty() && self.spawns.is_empty() && self.destroys.is_empty()
    }
}

impl BinarySerializable for StateUpdate {
    fn write_to(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.deltas.len() as u32);
        for (id, blob) in &self.deltas {
            buf.put_u64_le(id.0);
            put_blob(buf, blob);
        }
        buf.put_u32_le(self.spawns.len() as u32);
        for r in &self.spawns {
            r.write_to(buf);
        }
        buf.put_u32_le(self.destroys.len() as u32);
        for id in &self.destroys {
            buf.put_u64_le(id.0);
        }
    }

    fn read_from(&mut self, buf: &mut Bytes) -> Result<(), CodecError> {
        self.deltas.clear();
        self.spawns.clear();
        self.destroys.clear();
        for _ in 0..take_u32(buf)? {
            let id = EntityId(take_u64(buf)?);
            self.deltas.push((id, take_blob(buf)?));
        }
        for _ in 0..take_u32(buf)? {
            let mut r = SpawnRecord::default();
            r.read_from(buf)?;
            self.spawns.push(r);
        }
        for _ in 0..take_u32(buf)? {
            self.destroys.push(EntityId(take_u64(buf)?));
        }
        Ok(())
    }
}

binary_codec!(SpawnRecord, InitialState, StateUpdate);

/// Sent by the host on connect (carrying the assigned connection id) and
/// echoed back by the peer (carrying its category and optional player state).
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Handshake {
    pub connection_id: ConnectionId,
    pub client_kind: ClientKind,
    /// Pre-order state blobs of the peer's own player tree.
    pub init_data: Vec<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpawnRequest {
    pub prefab_key: String,
    pub owned: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DestroyRequest {
    pub id: EntityId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRequest {
    pub id: EntityId,
    pub state: Vec<u8>,
}

generic_codec!(Handshake, SpawnRequest, DestroyRequest, ChangeRequest);

/// Builds a fresh node tree for a prefab.
pub type PrefabFactory = Arc<dyn Fn() -> NodeBuilder + Send + Sync>;

/// Prefab table shared by the host and its peers. Both sides must register
/// the same keys with the same tree topology.
#[derive(Clone, Default)]
pub struct PrefabRegistry {
    factories: HashMap<String, PrefabFactory>,
    players: HashMap<ClientKind, String>,
}

impl PrefabRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, key: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn() -> NodeBuilder + Send + Sync + 'static,
    {
        self.factories.insert(key.into(), Arc::new(factory));
        self
    }

    /// Prefab used as the player of peers of this category.
    pub fn set_player_prefab(&mut self, kind: ClientKind, key: impl Into<String>) -> &mut Self {
        self.players.insert(kind, key.into());
        self
    }

    pub fn player_prefab(&self, kind: ClientKind) -> Option<&str> {
        self.players.get(&kind).map(String::as_str)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.factories.contains_key(key)
    }

    /// Builds the tree and tags its root with the prefab key.
    pub fn build(&self, key: &str) -> Result<NodeBuilder, SpawnError> {
        let factory = self
            .factories
            .get(key)
            .ok_or_else(|| SpawnError::UnknownPrefab(key.to_string()))?;
        let mut tree = factory();
        if let Some(e) = tree.entity_mut() {
            e.prefab_key = Some(key.to_string());
        }
        Ok(tree)
    }
}

impl fmt::Debug for PrefabRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<&String> = self.factories.keys().collect();
        keys.sort();
        f.debug_struct("PrefabRegistry")
            .field("prefabs", &keys)
            .field("players", &self.players)
            .finish()
    }
}
