//! `netsync_shared`
//!
//! Replication core used by both the authority and its peers.
//!
//! Design goals:
//! - One authoritative entity table; peers mirror it through spawn records,
//!   differential updates and an initial snapshot for late joiners.
//! - Clear separation of concerns (transport, routing, codec, entities, calls).
//! - Traits at the seams: `Transport`, `Behaviour`, `BinarySerializable`.
//! - Single-threaded, poll-driven coordinators. No `unsafe`.

pub mod behaviour;
pub mod codec;
pub mod config;
pub mod demo;
pub mod entity;
pub mod event;
pub mod file_transfer;
pub mod loopback;
pub mod math;
pub mod message;
pub mod net;
pub mod netvar;
pub mod rpc;
pub mod spawn;
pub mod world;

pub mod prelude {
    //! Commonly used exports.

    pub use crate::behaviour::{Behaviour, NetContext, OutgoingRpc, Role, RpcTarget};
    pub use crate::codec::{deserialize, serialize, BinarySerializable, Codec, CodecError};
    pub use crate::config::*;
    pub use crate::entity::*;
    pub use crate::event::*;
    pub use crate::file_transfer::{FileAssembler, FileChunk, FileError, FilePump};
    pub use crate::loopback::*;
    pub use crate::math::*;
    pub use crate::message::{MessageRouter, MsgType, RouterRegistry, RouterSender, TransportKey};
    pub use crate::net::*;
    pub use crate::netvar::NetVar;
    pub use crate::rpc::{RpcError, RpcTable};
    pub use crate::spawn::*;
    pub use crate::world::{NodeBuilder, NodeId, World};
    pub use crate::{binary_codec, generic_codec, sync_fields};
}
