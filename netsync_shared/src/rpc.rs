//! Remote procedure calls.
//!
//! Goals:
//! - Each behaviour type registers its remotely callable methods once, into a
//!   `hash -> closure` table.
//! - Method identity is a 32-bit FNV-1 hash of the method name followed by
//!   `" " + type name` for every parameter, so overloads hash differently.
//! - A call names a method by hash and carries each argument as its own
//!   codec blob.
//!
//! Wire layout of a call: `[hash: u32][count: i32]([len: u32][bytes])*`.

use std::{any::type_name, collections::HashMap, fmt};

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;
use tracing::error;

use crate::{
    behaviour::{Behaviour, NetContext, Role},
    codec::{put_blob, take_blob, take_i32, take_u32, Codec, CodecError},
    net::EntityId,
};

const FNV_OFFSET_BASIS: u32 = 2_166_136_261;
const FNV_PRIME: u32 = 16_777_619;

/// Upper bound on RPC parameters.
pub const MAX_RPC_PARAMS: usize = 5;

/// FNV-1 hash of a method signature. The signature is hashed as UTF-16 code
/// units: multiply by the prime, then xor the unit in.
pub fn signature_hash(name: &str, param_types: &[&str]) -> u32 {
    let mut sig = String::from(name);
    for ty in param_types {
        sig.push(' ');
        sig.push_str(ty);
    }
    sig.encode_utf16().fold(FNV_OFFSET_BASIS, |hash, unit| {
        hash.wrapping_mul(FNV_PRIME) ^ u32::from(unit)
    })
}

/// Which way a method may travel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcDirection {
    /// Invoked on a peer, executed on the authority.
    ToAuthority,
    /// Invoked on the authority, executed on peers.
    ToPeer,
}

impl RpcDirection {
    /// Role allowed to invoke a method of this direction.
    pub fn caller(self) -> Role {
        match self {
            RpcDirection::ToAuthority => Role::Peer,
            RpcDirection::ToPeer => Role::Authority,
        }
    }

    /// Role that executes a method of this direction.
    pub fn executor(self) -> Role {
        match self {
            RpcDirection::ToAuthority => Role::Authority,
            RpcDirection::ToPeer => Role::Peer,
        }
    }
}

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("`{method}` cannot be invoked by the {role:?}")]
    WrongRole { method: String, role: Role },
    #[error("`{method}` is not declared on `{behaviour}`")]
    NotDeclared { method: String, behaviour: &'static str },
    #[error("method {hash:#010x} is not declared on `{behaviour}`")]
    UnknownHash { hash: u32, behaviour: &'static str },
    #[error("`{method}` is tagged {declared:?}")]
    WrongDirection {
        method: String,
        declared: RpcDirection,
    },
    #[error("expected {expected} arguments, got {found}")]
    ArgCount { expected: usize, found: usize },
    #[error("unknown entity {0}")]
    UnknownEntity(EntityId),
    #[error("entity {entity} has no behaviour at index {index}")]
    UnknownBehaviour { entity: EntityId, index: usize },
    #[error("behaviour type does not match its rpc table")]
    BehaviourType,
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// One method invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcCall {
    pub hash: u32,
    pub args: Vec<Bytes>,
}

impl RpcCall {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u32_le(self.hash);
        buf.put_i32_le(self.args.len() as i32);
        for arg in &self.args {
            put_blob(&mut buf, arg);
        }
        buf.freeze()
    }

    pub fn decode(raw: &[u8]) -> Result<Self, CodecError> {
        let mut buf = Bytes::copy_from_slice(raw);
        let hash = take_u32(&mut buf)?;
        let count = take_i32(&mut buf)?;
        if !(0..=MAX_RPC_PARAMS as i32).contains(&count) {
            return Err(CodecError::Invalid(format!("rpc argument count {count}")));
        }
        let args = (0..count)
            .map(|_| take_blob(&mut buf))
            .collect::<Result<_, _>>()?;
        Ok(Self { hash, args })
    }
}

/// A call addressed to one behaviour of an entity. The entity id travels as
/// the envelope target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BehaviourCall {
    pub behaviour: u32,
    pub call: RpcCall,
}

impl BehaviourCall {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u32_le(self.behaviour);
        put_blob(&mut buf, &self.call.encode());
        buf.freeze()
    }

    pub fn decode(raw: &[u8]) -> Result<Self, CodecError> {
        let mut buf = Bytes::copy_from_slice(raw);
        let behaviour = take_u32(&mut buf)?;
        let call = RpcCall::decode(&take_blob(&mut buf)?)?;
        Ok(Self { behaviour, call })
    }
}

/// Argument tuple of an RPC (arity 0 to 5).
pub trait RpcParams: Sized + Send + 'static {
    /// Fully qualified parameter type names, in order.
    fn type_names() -> Vec<&'static str>;
    fn encode_args(&self) -> Result<Vec<Bytes>, CodecError>;
    fn decode_args(args: &[Bytes]) -> Result<Self, RpcError>;
}

macro_rules! impl_rpc_params {
    ($($name:ident : $idx:tt),*) => {
        impl<$($name: Codec + Send + 'static),*> RpcParams for ($($name,)*) {
            fn type_names() -> Vec<&'static str> {
                vec![$(type_name::<$name>()),*]
            }

            #[allow(unused_variables)]
            fn encode_args(&self) -> Result<Vec<Bytes>, CodecError> {
                Ok(vec![$(self.$idx.encode(false)?),*])
            }

            fn decode_args(args: &[Bytes]) -> Result<Self, RpcError> {
                let expected = Self::type_names().len();
                if args.len() != expected {
                    return Err(RpcError::ArgCount {
                        expected,
                        found: args.len(),
                    });
                }
                Ok(($($name::decode(&args[$idx])?,)*))
            }
        }
    };
}

impl_rpc_params!();
impl_rpc_params!(A: 0);
impl_rpc_params!(A: 0, B: 1);
impl_rpc_params!(A: 0, B: 1, C: 2);
impl_rpc_params!(A: 0, B: 1, C: 2, D: 3);
impl_rpc_params!(A: 0, B: 1, C: 2, D: 3, E: 4);

type Handler<B> =
    Box<dyn Fn(&mut B, &mut NetContext, &[Bytes]) -> Result<(), RpcError> + Send + Sync>;

struct RpcEntry<B> {
    name: &'static str,
    direction: RpcDirection,
    handler: Handler<B>,
}

/// Per-type method table, filled by `Behaviour::register_rpcs`.
pub struct RpcTable<B> {
    entries: HashMap<u32, RpcEntry<B>>,
}

impl<B> Default for RpcTable<B> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }
}

impl<B: Behaviour> RpcTable<B> {
    /// Registers a method peers may call on the authority.
    pub fn server_rpc<A, F>(&mut self, name: &'static str, handler: F) -> &mut Self
    where
        A: RpcParams,
        F: Fn(&mut B, &mut NetContext, A) + Send + Sync + 'static,
    {
        self.insert::<A, F>(name, RpcDirection::ToAuthority, handler)
    }

    /// Registers a method the authority may call on peers.
    pub fn client_rpc<A, F>(&mut self, name: &'static str, handler: F) -> &mut Self
    where
        A: RpcParams,
        F: Fn(&mut B, &mut NetContext, A) + Send + Sync + 'static,
    {
        self.insert::<A, F>(name, RpcDirection::ToPeer, handler)
    }

    fn insert<A, F>(&mut self, name: &'static str, direction: RpcDirection, handler: F) -> &mut Self
    where
        A: RpcParams,
        F: Fn(&mut B, &mut NetContext, A) + Send + Sync + 'static,
    {
        let params = A::type_names();
        if params.len() > MAX_RPC_PARAMS {
            error!(behaviour = type_name::<B>(), method = name, "Too many rpc parameters, skipped");
            return self;
        }
        let hash = signature_hash(name, &params);
        if let Some(existing) = self.entries.get(&hash) {
            error!(
                behaviour = type_name::<B>(),
                method = name,
                existing = existing.name,
                hash,
                "Rpc signature hash collision, method skipped"
            );
            return self;
        }
        let handler: Handler<B> = Box::new(move |b, ctx, raw| {
            let args = A::decode_args(raw)?;
            handler(b, ctx, args);
            Ok(())
        });
        self.entries.insert(
            hash,
            RpcEntry {
                name,
                direction,
                handler,
            },
        );
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Type-erased method table of one behaviour type.
pub trait RpcMethods: Send + Sync {
    fn behaviour_name(&self) -> &'static str;

    /// Name and direction of the method with this hash.
    fn lookup(&self, hash: u32) -> Option<(&'static str, RpcDirection)>;

    /// Runs the method on `behaviour`, which must be of the table's type.
    fn dispatch(
        &self,
        behaviour: &mut dyn Behaviour,
        ctx: &mut NetContext,
        call: &RpcCall,
    ) -> Result<(), RpcError>;
}

impl<B: Behaviour> RpcMethods for RpcTable<B> {
    fn behaviour_name(&self) -> &'static str {
        type_name::<B>()
    }

    fn lookup(&self, hash: u32) -> Option<(&'static str, RpcDirection)> {
        self.entries.get(&hash).map(|e| (e.name, e.direction))
    }

    fn dispatch(
        &self,
        behaviour: &mut dyn Behaviour,
        ctx: &mut NetContext,
        call: &RpcCall,
    ) -> Result<(), RpcError> {
        let entry = self
            .entries
            .get(&call.hash)
            .ok_or(RpcError::UnknownHash {
                hash: call.hash,
                behaviour: type_name::<B>(),
            })?;
        if entry.direction.executor() != ctx.role() {
            return Err(RpcError::WrongDirection {
                method: entry.name.to_string(),
                declared: entry.direction,
            });
        }
        let behaviour = behaviour
            .as_any_mut()
            .downcast_mut::<B>()
            .ok_or(RpcError::BehaviourType)?;
        (entry.handler)(behaviour, ctx, &call.args)
    }
}

impl fmt::Debug for dyn RpcMethods {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcMethods")
            .field("behaviour", &self.behaviour_name())
            .finish()
    }
}

/// Validates an outgoing invocation against the invoking behaviour's table
/// and encodes it.
pub fn build_call<A: RpcParams>(
    methods: &dyn RpcMethods,
    role: Role,
    direction: RpcDirection,
    name: &str,
    args: &A,
) -> Result<RpcCall, RpcError> {
    if direction.caller() != role {
        return Err(RpcError::WrongRole {
            method: name.to_string(),
            role,
        });
    }
    let hash = signature_hash(name, &A::type_names());
    let (_, declared) = methods.lookup(hash).ok_or_else(|| RpcError::NotDeclared {
        method: name.to_string(),
        behaviour: methods.behaviour_name(),
    })?;
    if declared != direction {
        return Err(RpcError::WrongDirection {
            method: name.to_string(),
            declared,
        });
    }
    Ok(RpcCall {
        hash,
        args: args.encode_args()?,
    })
}
