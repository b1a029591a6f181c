//! Demo content shared by the binaries and the integration tests: a few
//! behaviours, the prefab table and a small pre-placed scene.

use crate::{
    behaviour::{Behaviour, NetContext},
    config::ClientKind,
    entity::{PositionSync, ReplicatedEntity, SyncFlags},
    math::{Quat, Vec3},
    netvar::NetVar,
    rpc::RpcTable,
    spawn::PrefabRegistry,
    sync_fields,
    world::NodeBuilder,
};

pub const PLAYER_PREFAB: &str = "player";
pub const LAMP_PREFAB: &str = "lamp";
pub const CRATE_PREFAB: &str = "crate";

/// A switchable light. Peers toggle it on the authority; the authority
/// flashes every peer in response.
#[derive(Default)]
pub struct Lamp {
    pub on: NetVar<bool>,
    pub color: NetVar<u32>,
    /// Colours received through `flash`, peer side only.
    pub flashes: Vec<u32>,
}

impl Behaviour for Lamp {
    fn register_rpcs(table: &mut RpcTable<Self>) {
        table
            .server_rpc("toggle", |lamp: &mut Lamp, ctx: &mut NetContext, (): ()| {
                let on = !*lamp.on.get();
                lamp.on.set(on);
                let color = *lamp.color.get();
                let _ = ctx.invoke_client_rpc_on_all("flash", (color,));
            })
            .server_rpc(
                "set_color",
                |lamp: &mut Lamp, _ctx: &mut NetContext, (color,): (u32,)| {
                    lamp.color.set(color);
                },
            )
            .client_rpc("flash", |lamp: &mut Lamp, _ctx: &mut NetContext, (color,): (u32,)| {
                lamp.flashes.push(color);
            });
    }

    sync_fields!(on, color);
}

/// Per-player state.
#[derive(Default)]
pub struct Avatar {
    pub name: NetVar<String>,
    pub score: NetVar<i32>,
    /// Messages received through `announce`.
    pub announcements: Vec<String>,
}

impl Behaviour for Avatar {
    fn register_rpcs(table: &mut RpcTable<Self>) {
        table
            .server_rpc(
                "add_score",
                |avatar: &mut Avatar, ctx: &mut NetContext, (points,): (i32,)| {
                    avatar.score.modify(|s| *s += points);
                    if let Some(sender) = ctx.sender() {
                        let msg = format!("{} scored {points}", avatar.name.get());
                        let _ = ctx.invoke_client_rpc(sender, "announce", (msg,));
                    }
                },
            )
            .client_rpc(
                "announce",
                |avatar: &mut Avatar, _ctx: &mut NetContext, (msg,): (String,)| {
                    avatar.announcements.push(msg);
                },
            );
    }

    sync_fields!(name, score);
}

/// Spin rate of a pickup, in radians per second.
#[derive(Default)]
pub struct Spinner {
    pub rate: NetVar<f32>,
}

impl Behaviour for Spinner {
    sync_fields!(rate);
}

/// Player tree: the avatar root with a replicated hand.
pub fn player_prefab() -> NodeBuilder {
    NodeBuilder::new(PLAYER_PREFAB)
        .replicated(
            ReplicatedEntity::player()
                .with_behaviour(Avatar::default())
                .with_sync(SyncFlags::default() | SyncFlags::LERP_POSITION | SyncFlags::LERP_ROTATION),
        )
        .child(
            NodeBuilder::new("hand")
                .at(Vec3::new(0.3, 1.2, 0.2))
                .replicated(ReplicatedEntity::new()),
        )
}

pub fn lamp_prefab() -> NodeBuilder {
    NodeBuilder::new(LAMP_PREFAB)
        .replicated(ReplicatedEntity::new().with_behaviour(Lamp::default()))
        .child(
            NodeBuilder::new("shade").child(
                NodeBuilder::new("bulb")
                    .at(Vec3::new(0.0, 0.4, 0.0))
                    .replicated(ReplicatedEntity::new().with_sync(SyncFlags::VARS)),
            ),
        )
}

pub fn crate_prefab() -> NodeBuilder {
    NodeBuilder::new(CRATE_PREFAB).replicated(
        ReplicatedEntity::new()
            .with_behaviour(Spinner::default())
            .with_position_sync(PositionSync::Global),
    )
}

/// Prefab table with one player prefab for every client category.
pub fn demo_prefabs() -> PrefabRegistry {
    let mut prefabs = PrefabRegistry::new();
    prefabs
        .register(PLAYER_PREFAB, player_prefab)
        .register(LAMP_PREFAB, lamp_prefab)
        .register(CRATE_PREFAB, crate_prefab)
        .set_player_prefab(ClientKind::Ar, PLAYER_PREFAB)
        .set_player_prefab(ClientKind::Vr, PLAYER_PREFAB)
        .set_player_prefab(ClientKind::Desktop, PLAYER_PREFAB);
    prefabs
}

/// Pre-placed scene: a table anchor, a door lamp and a cup synced relative
/// to the table.
pub fn demo_scene() -> Vec<NodeBuilder> {
    vec![
        NodeBuilder::new("table").at(Vec3::new(2.0, 0.0, -1.0)),
        NodeBuilder::new("door")
            .at(Vec3::new(0.0, 0.0, 4.0))
            .rotated(Quat::from_axis_angle(Vec3::new(0.0, 1.0, 0.0), 1.5))
            .replicated(
                ReplicatedEntity::new()
                    .with_scene_index(0)
                    .with_behaviour(Lamp::default()),
            ),
        NodeBuilder::new("cup")
            .at(Vec3::new(2.2, 0.8, -1.1))
            .replicated(
                ReplicatedEntity::new()
                    .with_scene_index(1)
                    .with_position_sync(PositionSync::Relative("table".into())),
            ),
    ]
}
