//! `netsync_client`
//!
//! Peer-side systems:
//! - Handshake and join (category, optional local player state)
//! - Entity table mirrored from spawn records and updates
//! - Interpolation for entities that ask for it
//! - Own player sync through change requests
//! - Requests, RPCs, custom messages and file transfer to the authority

pub mod client;
pub mod interp;
pub mod spawner;

pub use client::{ClientState, ReplicationClient};
pub use spawner::PeerSpawner;
