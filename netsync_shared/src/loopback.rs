//! In-process transport.
//!
//! A `LoopbackHub` connects one host transport with any number of peer
//! transports through shared queues. Delivery is ordered and lossless, and
//! nothing moves until the receiving side calls `poll()`. Used by tests and
//! by single-process hosting.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard},
};

use bytes::Bytes;
use tracing::debug;

use crate::net::{ConnectionId, Transport, TransportError, TransportEvent};

#[derive(Default)]
struct HubState {
    next_id: u64,
    host_open: bool,
    host_inbox: VecDeque<TransportEvent>,
    peers: HashMap<ConnectionId, VecDeque<TransportEvent>>,
}

/// Shared switchboard between a host and its peers.
#[derive(Clone)]
pub struct LoopbackHub {
    state: Arc<Mutex<HubState>>,
}

impl Default for LoopbackHub {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackHub {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(HubState {
                next_id: 1,
                host_open: true,
                ..Default::default()
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HubState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Host side of the hub.
    pub fn host(&self) -> LoopbackHost {
        LoopbackHost { hub: self.clone() }
    }

    /// Connects a new peer. The host sees `Connect(id)` on its next poll.
    pub fn connect(&self) -> LoopbackPeer {
        let mut st = self.lock();
        let id = ConnectionId(st.next_id);
        st.next_id += 1;
        let mut inbox = VecDeque::new();
        inbox.push_back(TransportEvent::Connect(ConnectionId::AUTHORITY));
        st.peers.insert(id, inbox);
        st.host_inbox.push_back(TransportEvent::Connect(id));
        debug!(conn = %id, "Loopback peer connected");
        LoopbackPeer {
            hub: self.clone(),
            id,
        }
    }

    pub fn peer_count(&self) -> usize {
        self.lock().peers.len()
    }
}

/// Host transport of a `LoopbackHub`.
pub struct LoopbackHost {
    hub: LoopbackHub,
}

impl LoopbackHost {
    /// Drops a peer from the host side.
    pub fn disconnect(&mut self, id: ConnectionId) {
        let mut st = self.hub.lock();
        if st.peers.remove(&id).is_some() {
            st.host_inbox.push_back(TransportEvent::Disconnect(id));
        }
    }
}

impl Transport for LoopbackHost {
    fn poll(&mut self) -> Vec<TransportEvent> {
        self.hub.lock().host_inbox.drain(..).collect()
    }

    fn send(&mut self, data: Bytes, id: ConnectionId) -> Result<(), TransportError> {
        let mut st = self.hub.lock();
        if !st.host_open {
            return Err(TransportError::Inactive);
        }
        let inbox = st
            .peers
            .get_mut(&id)
            .ok_or(TransportError::InvalidConnectionId(id))?;
        inbox.push_back(TransportEvent::Data(ConnectionId::AUTHORITY, data));
        Ok(())
    }

    fn is_active(&self) -> bool {
        self.hub.lock().host_open
    }
}

impl Drop for LoopbackHost {
    fn drop(&mut self) {
        let mut st = self.hub.lock();
        st.host_open = false;
        for inbox in st.peers.values_mut() {
            inbox.push_back(TransportEvent::Disconnect(ConnectionId::AUTHORITY));
        }
    }
}

/// Peer transport of a `LoopbackHub`.
pub struct LoopbackPeer {
    hub: LoopbackHub,
    id: ConnectionId,
}

impl LoopbackPeer {
    /// Connection id the host knows this peer by.
    pub fn id(&self) -> ConnectionId {
        self.id
    }
}

impl Transport for LoopbackPeer {
    fn poll(&mut self) -> Vec<TransportEvent> {
        let mut st = self.hub.lock();
        match st.peers.get_mut(&self.id) {
            Some(inbox) => inbox.drain(..).collect(),
            None => Vec::new(),
        }
    }

    fn send(&mut self, data: Bytes, id: ConnectionId) -> Result<(), TransportError> {
        if !id.is_authority() {
            return Err(TransportError::InvalidConnectionId(id));
        }
        let mut st = self.hub.lock();
        if !st.host_open || !st.peers.contains_key(&self.id) {
            return Err(TransportError::Inactive);
        }
        st.host_inbox.push_back(TransportEvent::Data(self.id, data));
        Ok(())
    }

    fn is_active(&self) -> bool {
        let st = self.hub.lock();
        st.host_open && st.peers.contains_key(&self.id)
    }
}

impl Drop for LoopbackPeer {
    fn drop(&mut self) {
        let mut st = self.hub.lock();
        if st.peers.remove(&self.id).is_some() {
            st.host_inbox.push_back(TransportEvent::Disconnect(self.id));
        }
    }
}
