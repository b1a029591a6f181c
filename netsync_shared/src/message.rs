//! Message router.
//!
//! Multiplexes logical channels and message types over one transport.
//!
//! Wire envelope:
//! `[channel: u32 len + utf8][type: u8][target: u64][payload: u32 len + bytes]`
//!
//! A router owns exactly one channel. Channel bindings are tracked per
//! transport in a `RouterRegistry` that is created once per session and
//! handed to every coordinator built on that session.

use std::{
    collections::{HashMap, HashSet},
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
};

use bytes::{BufMut, Bytes, BytesMut};
use tracing::{debug, error, trace};

use crate::{
    codec::{put_blob, put_str, take_blob, take_str, take_u64, take_u8, CodecError},
    config::ConfigError,
    net::{ConnectionId, Transport, TransportError},
};

/// Protocol message kinds. The discriminants are the wire values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum MsgType {
    StateUpdate = 0,
    InitialState = 1,
    SpawnRequest = 2,
    DestroyRequest = 3,
    ChangeRequest = 4,
    Handshake = 5,
    Custom = 6,
    Rpc = 7,
    FileChunk = 8,
}

impl MsgType {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0 => MsgType::StateUpdate,
            1 => MsgType::InitialState,
            2 => MsgType::SpawnRequest,
            3 => MsgType::DestroyRequest,
            4 => MsgType::ChangeRequest,
            5 => MsgType::Handshake,
            6 => MsgType::Custom,
            7 => MsgType::Rpc,
            8 => MsgType::FileChunk,
            _ => return None,
        })
    }
}

/// One framed router message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub channel: String,
    pub msg_type: u8,
    pub target: u64,
    pub payload: Bytes,
}

impl Envelope {
    pub fn encode(&self) -> Bytes {
        let mut buf =
            BytesMut::with_capacity(4 + self.channel.len() + 1 + 8 + 4 + self.payload.len());
        put_str(&mut buf, &self.channel);
        buf.put_u8(self.msg_type);
        buf.put_u64_le(self.target);
        put_blob(&mut buf, &self.payload);
        buf.freeze()
    }

    pub fn decode(raw: &[u8]) -> Result<Self, CodecError> {
        let mut buf = Bytes::copy_from_slice(raw);
        Ok(Self {
            channel: take_str(&mut buf)?,
            msg_type: take_u8(&mut buf)?,
            target: take_u64(&mut buf)?,
            payload: take_blob(&mut buf)?,
        })
    }
}

/// Identifies one transport inside a `RouterRegistry`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransportKey(u64);

impl fmt::Display for TransportKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "transport#{}", self.0)
    }
}

/// Session-scoped set of `(transport, channel)` bindings.
#[derive(Clone, Default)]
pub struct RouterRegistry {
    next_key: Arc<AtomicU64>,
    bound: Arc<Mutex<HashSet<(TransportKey, String)>>>,
}

impl RouterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Issues a key for a transport that routers will be bound to.
    pub fn register_transport(&self) -> TransportKey {
        TransportKey(self.next_key.fetch_add(1, Ordering::Relaxed))
    }

    /// Claims `channel` on `transport`. The claim is released when the
    /// returned binding is dropped.
    pub fn bind(
        &self,
        transport: TransportKey,
        channel: &str,
    ) -> Result<ChannelBinding, ConfigError> {
        let mut bound = self.bound.lock().unwrap_or_else(|e| e.into_inner());
        if !bound.insert((transport, channel.to_string())) {
            return Err(ConfigError::ChannelInUse(channel.to_string()));
        }
        Ok(ChannelBinding {
            registry: self.bound.clone(),
            transport,
            channel: channel.to_string(),
        })
    }

    pub fn is_bound(&self, transport: TransportKey, channel: &str) -> bool {
        let bound = self.bound.lock().unwrap_or_else(|e| e.into_inner());
        bound.contains(&(transport, channel.to_string()))
    }
}

/// A live `(transport, channel)` claim.
pub struct ChannelBinding {
    registry: Arc<Mutex<HashSet<(TransportKey, String)>>>,
    transport: TransportKey,
    channel: String,
}

impl ChannelBinding {
    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn transport(&self) -> TransportKey {
        self.transport
    }
}

impl Drop for ChannelBinding {
    fn drop(&mut self) {
        let mut bound = self.registry.lock().unwrap_or_else(|e| e.into_inner());
        bound.remove(&(self.transport, std::mem::take(&mut self.channel)));
    }
}

/// Inbound message handler. `C` is the state the owning coordinator exposes.
pub type Listener<C> = Box<dyn FnMut(&mut C, ConnectionId, Bytes) + Send>;

/// Send half of a router. Cheap to clone, so state driven by router
/// listeners can reply without borrowing the router itself.
#[derive(Debug, Clone)]
pub struct RouterSender {
    channel: Arc<str>,
}

impl RouterSender {
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Wraps `payload` in an envelope for this channel and hands it to the transport.
    pub fn send(
        &self,
        transport: &mut dyn Transport,
        receiver: ConnectionId,
        msg_type: MsgType,
        target: u64,
        payload: Bytes,
    ) -> Result<(), TransportError> {
        let env = Envelope {
            channel: self.channel.to_string(),
            msg_type: msg_type as u8,
            target,
            payload,
        };
        trace!(to = %receiver, ?msg_type, target, "Sending");
        transport.send(env.encode(), receiver)
    }
}

/// Channel router with per-`(type, target)` listener lists.
pub struct MessageRouter<C> {
    binding: ChannelBinding,
    sender: RouterSender,
    listeners: HashMap<(MsgType, u64), Vec<Listener<C>>>,
}

impl<C> MessageRouter<C> {
    /// Binds a router to `channel` on `transport`. Fails if that pair is
    /// already bound in this registry.
    pub fn bind(
        registry: &RouterRegistry,
        transport: TransportKey,
        channel: &str,
    ) -> Result<Self, ConfigError> {
        let binding = registry.bind(transport, channel)?;
        debug!(%transport, channel, "Router bound");
        Ok(Self {
            binding,
            sender: RouterSender {
                channel: Arc::from(channel),
            },
            listeners: HashMap::new(),
        })
    }

    pub fn channel(&self) -> &str {
        self.binding.channel()
    }

    pub fn sender(&self) -> RouterSender {
        self.sender.clone()
    }

    pub fn send(
        &self,
        transport: &mut dyn Transport,
        receiver: ConnectionId,
        msg_type: MsgType,
        target: u64,
        payload: Bytes,
    ) -> Result<(), TransportError> {
        self.sender
            .send(transport, receiver, msg_type, target, payload)
    }

    /// Appends a handler. Handlers for one key fire in registration order.
    pub fn add_listener<F>(&mut self, msg_type: MsgType, target: u64, handler: F)
    where
        F: FnMut(&mut C, ConnectionId, Bytes) + Send + 'static,
    {
        self.listeners
            .entry((msg_type, target))
            .or_default()
            .push(Box::new(handler));
    }

    /// Drops every handler registered for the key.
    pub fn remove_listeners(&mut self, msg_type: MsgType, target: u64) -> usize {
        self.listeners
            .remove(&(msg_type, target))
            .map_or(0, |l| l.len())
    }

    pub fn has_listener(&self, msg_type: MsgType, target: u64) -> bool {
        self.listeners.contains_key(&(msg_type, target))
    }

    /// Decodes one inbound frame and runs its handlers.
    ///
    /// Frames for another channel are ignored and frames without a handler
    /// are dropped. Returns the number of handlers run.
    pub fn handle_data(&mut self, ctx: &mut C, sender: ConnectionId, raw: &[u8]) -> usize {
        let env = match Envelope::decode(raw) {
            Ok(env) => env,
            Err(e) => {
                error!(from = %sender, error = %e, "Malformed envelope dropped");
                return 0;
            }
        };
        if env.channel != self.binding.channel() {
            return 0;
        }
        let Some(msg_type) = MsgType::from_u8(env.msg_type) else {
            error!(from = %sender, msg_type = env.msg_type, "Unknown message type dropped");
            return 0;
        };
        let Some(handlers) = self.listeners.get_mut(&(msg_type, env.target)) else {
            debug!(from = %sender, ?msg_type, target = env.target, "No listener, dropped");
            return 0;
        };
        for handler in handlers.iter_mut() {
            handler(ctx, sender, env.payload.clone());
        }
        handlers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::TransportEvent;

    #[derive(Default)]
    struct Sink {
        sent: Vec<(ConnectionId, Bytes)>,
    }

    impl Transport for Sink {
        fn poll(&mut self) -> Vec<TransportEvent> {
            Vec::new()
        }

        fn send(&mut self, data: Bytes, id: ConnectionId) -> Result<(), TransportError> {
            self.sent.push((id, data));
            Ok(())
        }

        fn is_active(&self) -> bool {
            true
        }
    }

    #[derive(Default)]
    struct Log(Vec<String>);

    #[test]
    fn envelope_layout() {
        let env = Envelope {
            channel: "ab".into(),
            msg_type: MsgType::Rpc as u8,
            target: 9,
            payload: Bytes::from_static(&[1, 2, 3]),
        };
        let raw = env.encode();
        assert_eq!(&raw[..6], &[2, 0, 0, 0, b'a', b'b']);
        assert_eq!(raw[6], 7);
        assert_eq!(&raw[7..15], &9u64.to_le_bytes());
        assert_eq!(&raw[15..19], &3u32.to_le_bytes());
        assert_eq!(Envelope::decode(&raw).unwrap(), env);
    }

    #[test]
    fn duplicate_channel_binding_is_rejected() {
        let registry = RouterRegistry::new();
        let t = registry.register_transport();
        let first = MessageRouter::<Log>::bind(&registry, t, "netsync").unwrap();
        assert!(matches!(
            MessageRouter::<Log>::bind(&registry, t, "netsync"),
            Err(ConfigError::ChannelInUse(_))
        ));

        // Other channel or other transport is fine.
        let other = registry.register_transport();
        assert!(MessageRouter::<Log>::bind(&registry, t, "voice").is_ok());
        assert!(MessageRouter::<Log>::bind(&registry, other, "netsync").is_ok());

        drop(first);
        assert!(!registry.is_bound(t, "netsync"));
        assert!(MessageRouter::<Log>::bind(&registry, t, "netsync").is_ok());
    }

    #[test]
    fn all_listeners_fire_in_order() {
        let registry = RouterRegistry::new();
        let t = registry.register_transport();
        let mut router = MessageRouter::<Log>::bind(&registry, t, "netsync").unwrap();
        router.add_listener(MsgType::Custom, 0, |log, _, p| log.0.push(format!("a{}", p.len())));
        router.add_listener(MsgType::Custom, 0, |log, _, p| log.0.push(format!("b{}", p.len())));
        router.add_listener(MsgType::Custom, 5, |log, _, _| log.0.push("other".into()));

        let mut sink = Sink::default();
        router
            .send(&mut sink, ConnectionId(1), MsgType::Custom, 0, Bytes::from_static(b"xy"))
            .unwrap();
        let (_, raw) = sink.sent.pop().unwrap();

        let mut log = Log::default();
        assert_eq!(router.handle_data(&mut log, ConnectionId(1), &raw), 2);
        assert_eq!(log.0, vec!["a2".to_string(), "b2".to_string()]);
    }

    #[test]
    fn foreign_channel_and_unknown_key_are_dropped() {
        let registry = RouterRegistry::new();
        let t = registry.register_transport();
        let mut router = MessageRouter::<Log>::bind(&registry, t, "netsync").unwrap();
        router.add_listener(MsgType::Custom, 0, |log, _, _| log.0.push("hit".into()));

        let foreign = Envelope {
            channel: "other".into(),
            msg_type: MsgType::Custom as u8,
            target: 0,
            payload: Bytes::new(),
        }
        .encode();
        let unmatched = Envelope {
            channel: "netsync".into(),
            msg_type: MsgType::Rpc as u8,
            target: 3,
            payload: Bytes::new(),
        }
        .encode();

        let mut log = Log::default();
        assert_eq!(router.handle_data(&mut log, ConnectionId(1), &foreign), 0);
        assert_eq!(router.handle_data(&mut log, ConnectionId(1), &unmatched), 0);
        assert_eq!(router.handle_data(&mut log, ConnectionId(1), &[0xff]), 0);
        assert!(log.0.is_empty());

        assert_eq!(router.remove_listeners(MsgType::Custom, 0), 1);
        assert!(!router.has_listener(MsgType::Custom, 0));
    }
}
