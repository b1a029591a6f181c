//! `netsync_server`
//!
//! Authority side of a replication session:
//! - Assigns entity ids and owns the authoritative entity table
//! - Handshakes peers and sends them the initial state
//! - Broadcasts spawns, destroys and dirty deltas on a fixed interval
//! - Gates peer-originated changes on ownership
//!
//! Transport model:
//! - Any `Transport` (TCP for the binary, loopback for tests)
//! - One router channel per transport

pub mod server;
pub mod spawner;

pub use server::{PeerInfo, ReplicationServer};
pub use spawner::AuthoritySpawner;
