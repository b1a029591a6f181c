//! Entity behaviours.
//!
//! A behaviour is a unit of per-entity logic. It exposes its dirty-tracked
//! fields by name and registers its remotely callable methods once per type.
//! Behaviours never talk to the transport directly: RPCs issued from a hook
//! or handler are collected in the `NetContext` and flushed by the owning
//! coordinator afterwards.

use std::{any::Any, sync::Arc};

use bytes::{BufMut, Bytes, BytesMut};
use tracing::{error, warn};

use crate::{
    codec::{put_blob, put_str, take_blob, take_str, take_u32, CodecError},
    net::{ConnectionId, EntityId},
    netvar::SyncField,
    rpc::{build_call, RpcCall, RpcDirection, RpcError, RpcMethods, RpcParams, RpcTable},
};

/// Upcast helper so trait objects can be downcast to their concrete type.
pub trait AsAny: Any {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: Any> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Per-entity logic with synced fields and remotely callable methods.
///
/// ```ignore
/// impl Behaviour for Lamp {
///     fn register_rpcs(table: &mut RpcTable<Self>) {
///         table.server_rpc("toggle", |lamp: &mut Lamp, _ctx, (): ()| {
///             let on = !*lamp.on.get();
///             lamp.on.set(on);
///         });
///     }
///
///     sync_fields!(on, color);
/// }
/// ```
pub trait Behaviour: AsAny + Send {
    /// Fills the method table of this type.
    fn register_rpcs(_table: &mut RpcTable<Self>)
    where
        Self: Sized,
    {
    }

    /// Synced fields in a stable order.
    fn fields(&self) -> Vec<(&'static str, &dyn SyncField)> {
        Vec::new()
    }

    fn fields_mut(&mut self) -> Vec<(&'static str, &mut dyn SyncField)> {
        Vec::new()
    }

    /// Runs once when the owning entity goes live on this side.
    fn on_network_start(&mut self, _ctx: &mut NetContext) {}
}

/// Implements `Behaviour::fields` and `Behaviour::fields_mut` from a list of
/// `NetVar` field names.
#[macro_export]
macro_rules! sync_fields {
    ($($field:ident),* $(,)?) => {
        fn fields(&self) -> Vec<(&'static str, &dyn $crate::netvar::SyncField)> {
            vec![$((stringify!($field), &self.$field as &dyn $crate::netvar::SyncField)),*]
        }

        fn fields_mut(&mut self) -> Vec<(&'static str, &mut dyn $crate::netvar::SyncField)> {
            vec![$((stringify!($field), &mut self.$field as &mut dyn $crate::netvar::SyncField)),*]
        }
    };
}

/// Which side of the session code runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Authority,
    Peer,
}

/// Destination of an outgoing call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcTarget {
    Authority,
    Peer(ConnectionId),
    AllPeers,
}

/// A validated call waiting to be sent by the coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingRpc {
    pub entity: EntityId,
    pub behaviour: u32,
    pub call: RpcCall,
    pub target: RpcTarget,
}

/// What a behaviour sees while one of its hooks or handlers runs.
pub struct NetContext {
    entity: EntityId,
    behaviour: usize,
    role: Role,
    sender: Option<ConnectionId>,
    methods: Arc<dyn RpcMethods>,
    outbox: Vec<OutgoingRpc>,
}

impl NetContext {
    pub fn new(
        entity: EntityId,
        behaviour: usize,
        role: Role,
        sender: Option<ConnectionId>,
        methods: Arc<dyn RpcMethods>,
    ) -> Self {
        Self {
            entity,
            behaviour,
            role,
            sender,
            methods,
            outbox: Vec::new(),
        }
    }

    pub fn entity(&self) -> EntityId {
        self.entity
    }

    pub fn behaviour_index(&self) -> usize {
        self.behaviour
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_authority(&self) -> bool {
        self.role == Role::Authority
    }

    /// Connection that sent the call being handled, if any.
    pub fn sender(&self) -> Option<ConnectionId> {
        self.sender
    }

    /// Calls a method on the authority's copy of this behaviour. Peers only.
    pub fn invoke_server_rpc<A: RpcParams>(&mut self, name: &str, args: A) -> Result<(), RpcError> {
        self.queue(RpcDirection::ToAuthority, RpcTarget::Authority, name, args)
    }

    /// Calls a method on one peer's copy of this behaviour. Authority only.
    pub fn invoke_client_rpc<A: RpcParams>(
        &mut self,
        receiver: ConnectionId,
        name: &str,
        args: A,
    ) -> Result<(), RpcError> {
        self.queue(RpcDirection::ToPeer, RpcTarget::Peer(receiver), name, args)
    }

    /// Calls a method on every connected peer. Authority only.
    pub fn invoke_client_rpc_on_all<A: RpcParams>(
        &mut self,
        name: &str,
        args: A,
    ) -> Result<(), RpcError> {
        self.queue(RpcDirection::ToPeer, RpcTarget::AllPeers, name, args)
    }

    fn queue<A: RpcParams>(
        &mut self,
        direction: RpcDirection,
        target: RpcTarget,
        name: &str,
        args: A,
    ) -> Result<(), RpcError> {
        let call = build_call(self.methods.as_ref(), self.role, direction, name, &args)
            .inspect_err(|e| {
                error!(
                    entity = %self.entity,
                    behaviour = self.methods.behaviour_name(),
                    method = name,
                    error = %e,
                    "Rpc invocation refused"
                );
            })?;
        self.outbox.push(OutgoingRpc {
            entity: self.entity,
            behaviour: self.behaviour as u32,
            call,
            target,
        });
        Ok(())
    }

    /// Calls queued so far.
    pub fn take_outbox(&mut self) -> Vec<OutgoingRpc> {
        std::mem::take(&mut self.outbox)
    }
}

/// A behaviour attached to an entity together with its method table.
pub struct BehaviourSlot {
    behaviour: Box<dyn Behaviour>,
    methods: Arc<dyn RpcMethods>,
    field_names: Vec<&'static str>,
}

impl BehaviourSlot {
    pub fn new<B: Behaviour>(behaviour: B) -> Self {
        let mut table = RpcTable::<B>::default();
        B::register_rpcs(&mut table);

        let mut field_names: Vec<&'static str> = Vec::new();
        for (name, _) in behaviour.fields() {
            if field_names.contains(&name) {
                error!(
                    behaviour = std::any::type_name::<B>(),
                    field = name,
                    "Duplicate synced field name, skipped"
                );
                continue;
            }
            field_names.push(name);
        }

        Self {
            behaviour: Box::new(behaviour),
            methods: Arc::new(table),
            field_names,
        }
    }

    pub fn type_name(&self) -> &'static str {
        self.methods.behaviour_name()
    }

    pub fn methods(&self) -> Arc<dyn RpcMethods> {
        self.methods.clone()
    }

    pub fn field_names(&self) -> &[&'static str] {
        &self.field_names
    }

    pub fn get<B: Behaviour>(&self) -> Option<&B> {
        self.behaviour.as_ref().as_any().downcast_ref::<B>()
    }

    pub fn get_mut<B: Behaviour>(&mut self) -> Option<&mut B> {
        self.behaviour.as_mut().as_any_mut().downcast_mut::<B>()
    }

    pub fn is_dirty(&self) -> bool {
        self.behaviour.fields().iter().any(|(_, f)| f.is_dirty())
    }

    pub fn reset_dirty(&mut self) {
        for (_, field) in self.behaviour.fields_mut() {
            field.reset_dirty();
        }
    }

    /// State blob: `[count: u32]([name][value])*` over every field.
    pub fn serialize(&self) -> Result<Bytes, CodecError> {
        let fields = self.behaviour.fields();
        let mut buf = BytesMut::new();
        buf.put_u32_le(self.field_names.len() as u32);
        for name in &self.field_names {
            if let Some((_, field)) = fields.iter().find(|(n, _)| n == name) {
                put_str(&mut buf, name);
                put_blob(&mut buf, &field.read()?);
            }
        }
        Ok(buf.freeze())
    }

    /// Applies a state blob. Unknown field names are skipped.
    pub fn deserialize(&mut self, data: &[u8]) -> Result<(), CodecError> {
        let mut buf = Bytes::copy_from_slice(data);
        let count = take_u32(&mut buf)?;
        let mut fields = self.behaviour.fields_mut();
        for _ in 0..count {
            let name = take_str(&mut buf)?;
            let value = take_blob(&mut buf)?;
            match fields.iter_mut().find(|(n, _)| *n == name) {
                Some((_, field)) => field.write(&value)?,
                None => warn!(
                    behaviour = self.methods.behaviour_name(),
                    field = %name,
                    "Unknown synced field, skipped"
                ),
            }
        }
        Ok(())
    }

    /// Runs an inbound call.
    pub fn dispatch(&mut self, ctx: &mut NetContext, call: &RpcCall) -> Result<(), RpcError> {
        self.methods.dispatch(self.behaviour.as_mut(), ctx, call)
    }

    pub fn on_network_start(&mut self, ctx: &mut NetContext) {
        self.behaviour.on_network_start(ctx);
    }
}

impl std::fmt::Debug for BehaviourSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BehaviourSlot")
            .field("type", &self.type_name())
            .field("fields", &self.field_names)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{netvar::NetVar, rpc::signature_hash};

    #[derive(Default)]
    struct Counter {
        count: NetVar<u32>,
        label: NetVar<String>,
        pings: Vec<u32>,
    }

    impl Behaviour for Counter {
        fn register_rpcs(table: &mut RpcTable<Self>) {
            table
                .server_rpc("add", |c: &mut Counter, _ctx: &mut NetContext, (n,): (u32,)| {
                    let next = *c.count.get() + n;
                    c.count.set(next);
                })
                .client_rpc("ping", |c: &mut Counter, _ctx: &mut NetContext, (n,): (u32,)| {
                    c.pings.push(n);
                })
                // Same signature as `add`: rejected.
                .client_rpc("add", |_c: &mut Counter, _ctx: &mut NetContext, (_n,): (u32,)| {});
        }

        sync_fields!(count, label);
    }

    struct Other;

    impl Behaviour for Other {
        fn register_rpcs(table: &mut RpcTable<Self>) {
            table.server_rpc("only_here", |_o: &mut Other, _ctx: &mut NetContext, (): ()| {});
        }
    }

    fn ctx_for(slot: &BehaviourSlot, role: Role) -> NetContext {
        NetContext::new(EntityId(4), 0, role, None, slot.methods())
    }

    #[test]
    fn dirty_tracks_any_field() {
        let mut slot = BehaviourSlot::new(Counter::default());
        assert!(!slot.is_dirty());
        slot.get_mut::<Counter>().unwrap().label.set("a".into());
        assert!(slot.is_dirty());
        slot.reset_dirty();
        assert!(!slot.is_dirty());
    }

    #[test]
    fn state_blob_roundtrip_by_name() {
        let mut src = BehaviourSlot::new(Counter::default());
        {
            let c = src.get_mut::<Counter>().unwrap();
            c.count.set(12);
            c.label.set("door".into());
        }
        let blob = src.serialize().unwrap();

        let mut dst = BehaviourSlot::new(Counter::default());
        dst.deserialize(&blob).unwrap();
        let c = dst.get::<Counter>().unwrap();
        assert_eq!(*c.count.get(), 12);
        assert_eq!(c.label.get(), "door");
        assert!(!dst.is_dirty());
    }

    #[test]
    fn collision_is_skipped_and_first_registration_kept() {
        let slot = BehaviourSlot::new(Counter::default());
        let hash = signature_hash("add", &["u32"]);
        assert_eq!(
            slot.methods().lookup(hash),
            Some(("add", RpcDirection::ToAuthority))
        );
    }

    #[test]
    fn invocation_direction_rules() {
        let slot = BehaviourSlot::new(Counter::default());

        let mut peer = ctx_for(&slot, Role::Peer);
        assert!(peer.invoke_server_rpc("add", (1u32,)).is_ok());
        assert!(matches!(
            peer.invoke_client_rpc_on_all("ping", (1u32,)),
            Err(RpcError::WrongRole { .. })
        ));
        // Declared, but tagged the other way.
        assert!(matches!(
            peer.invoke_server_rpc("ping", (1u32,)),
            Err(RpcError::WrongDirection { .. })
        ));
        // Declared only on another behaviour type.
        assert!(matches!(
            peer.invoke_server_rpc("only_here", ()),
            Err(RpcError::NotDeclared { .. })
        ));
        // Wrong parameter list hashes to an undeclared method.
        assert!(matches!(
            peer.invoke_server_rpc("add", (1u64,)),
            Err(RpcError::NotDeclared { .. })
        ));
        assert_eq!(peer.take_outbox().len(), 1);

        let mut host = ctx_for(&slot, Role::Authority);
        assert!(matches!(
            host.invoke_server_rpc("add", (1u32,)),
            Err(RpcError::WrongRole { .. })
        ));
        host.invoke_client_rpc(ConnectionId(2), "ping", (5u32,)).unwrap();
        host.invoke_client_rpc_on_all("ping", (6u32,)).unwrap();
        let out = host.take_outbox();
        assert_eq!(out[0].target, RpcTarget::Peer(ConnectionId(2)));
        assert_eq!(out[1].target, RpcTarget::AllPeers);
    }

    #[test]
    fn dispatch_runs_handler_for_executing_role() {
        let mut slot = BehaviourSlot::new(Counter::default());
        let mut peer = ctx_for(&slot, Role::Peer);
        peer.invoke_server_rpc("add", (3u32,)).unwrap();
        let call = peer.take_outbox().remove(0).call;

        let mut host = ctx_for(&slot, Role::Authority);
        slot.dispatch(&mut host, &call).unwrap();
        slot.dispatch(&mut host, &call).unwrap();
        assert_eq!(*slot.get::<Counter>().unwrap().count.get(), 6);

        // A peer refuses to execute an authority-bound method.
        let mut peer = ctx_for(&slot, Role::Peer);
        assert!(matches!(
            slot.dispatch(&mut peer, &call),
            Err(RpcError::WrongDirection { .. })
        ));
    }
}
