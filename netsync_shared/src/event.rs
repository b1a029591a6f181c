//! Session event queue.
//!
//! Coordinators push notifications here while handling inbound traffic; the
//! host application drains them between ticks. Events are typed, so each
//! consumer only drains what it cares about.

use std::{
    any::{Any, TypeId},
    collections::HashMap,
    path::PathBuf,
};

use bytes::Bytes;

use crate::{
    config::ClientKind,
    net::{ConnectionId, EntityId},
};

/// Session notifications, one FIFO per event type.
///
/// The server queues connects, joins and player spawns; both sides queue
/// custom messages and reassembled files. Nothing is dropped until the host
/// drains that type.
#[derive(Default)]
pub struct EventBus {
    pending: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl EventBus {
    fn queue_mut<E: 'static + Send + Sync>(&mut self) -> Option<&mut Vec<E>> {
        self.pending
            .entry(TypeId::of::<E>())
            .or_insert_with(|| Box::new(Vec::<E>::new()))
            .downcast_mut::<Vec<E>>()
    }

    /// Queues `event` behind earlier events of its type.
    pub fn push<E: 'static + Send + Sync>(&mut self, event: E) {
        if let Some(queue) = self.queue_mut::<E>() {
            queue.push(event);
        }
    }

    /// Takes every queued `E` in arrival order. Other types stay queued.
    pub fn drain<E: 'static + Send + Sync>(&mut self) -> Vec<E> {
        self.pending
            .get_mut(&TypeId::of::<E>())
            .and_then(|queue| queue.downcast_mut::<Vec<E>>())
            .map(std::mem::take)
            .unwrap_or_default()
    }

    pub fn len<E: 'static + Send + Sync>(&self) -> usize {
        self.pending
            .get(&TypeId::of::<E>())
            .and_then(|queue| queue.downcast_ref::<Vec<E>>())
            .map_or(0, Vec::len)
    }

    /// Forgets everything queued, e.g. when a session stops.
    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

/// A transport-level peer appeared (host side) or the host answered (peer side).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerConnected(pub ConnectionId);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerDisconnected(pub ConnectionId);

/// Host spawned a player for a peer that did not ship its own player state.
/// The host may customise the entity before the next broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlayerSpawned {
    pub connection: ConnectionId,
    pub entity: EntityId,
    pub kind: ClientKind,
}

/// Peer received its initial state and is now in sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InitialStateApplied {
    pub connection: ConnectionId,
}

/// Opaque application message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustomMessage {
    pub sender: ConnectionId,
    pub payload: Bytes,
}

/// A transferred file was reassembled and written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileReceived {
    pub sender: ConnectionId,
    pub hash: String,
    pub path: PathBuf,
}
