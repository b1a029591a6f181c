//! End-to-end sessions over the loopback hub: one authority, one or more
//! peers, driven tick by tick.

use bytes::Bytes;
use netsync_client::ClientState;
use netsync_shared::{
    codec::serialize,
    config::{ClientKind, NetConfig},
    demo::{Avatar, Lamp, CRATE_PREFAB, LAMP_PREFAB},
    event::{CustomMessage, FileReceived, PlayerSpawned},
    loopback::LoopbackHub,
    math::Vec3,
    message::{Envelope, MsgType},
    net::{ConnectionId, EntityId, Transport},
    spawn::{Handshake, InitialState, StateUpdate},
};
use netsync_tests::{scratch_dir, Session};

#[test]
fn peers_share_the_authority_ids() -> anyhow::Result<()> {
    let mut s = Session::demo()?;
    let a = s.join(ClientKind::Vr)?;
    assert_eq!(s.client(a).state(), ClientState::Ready);
    assert_eq!(s.client(a).own_player(), Some(EntityId(3)));

    s.broadcast();
    let b = s.join(ClientKind::Ar)?;
    assert_eq!(s.client(b).own_player(), Some(EntityId(5)));
    s.broadcast();

    let mut server_ids = s.server.world().entity_ids();
    server_ids.sort();
    for i in [a, b] {
        let mut ids = s.client(i).world().entity_ids();
        ids.sort();
        assert_eq!(ids, server_ids);
    }
    // Scene objects came to life on the peers.
    assert!(s.client(b).world().get(EntityId(1)).unwrap().is_active());
    assert!(s.client(b).world().get(EntityId(2)).unwrap().is_active());
    assert_eq!(s.server.events().drain::<PlayerSpawned>().len(), 2);
    Ok(())
}

#[test]
fn despawn_reaches_peers_with_the_next_broadcast() -> anyhow::Result<()> {
    let mut s = Session::demo()?;
    let a = s.join(ClientKind::Desktop)?;
    let lamp = s.server.spawn_prefab(LAMP_PREFAB, None)?;
    s.broadcast();
    let bulb = EntityId(lamp.0 + 1);
    assert!(s.client(a).world().find(lamp).is_some());
    assert!(s.client(a).world().find(bulb).is_some());

    s.server.despawn(lamp)?;
    s.pump();
    assert!(s.client(a).world().find(lamp).is_some());

    s.broadcast();
    assert!(s.client(a).world().find(lamp).is_none());
    assert!(s.client(a).world().find(bulb).is_none());
    assert!(s.server.world().find(lamp).is_none());
    Ok(())
}

#[test]
fn only_the_owner_may_change_an_entity() -> anyhow::Result<()> {
    let mut s = Session::demo()?;
    let a = s.join(ClientKind::Vr)?;
    s.broadcast();
    let b = s.join(ClientKind::Vr)?;
    s.broadcast();

    s.client(a).request_spawn(CRATE_PREFAB, true)?;
    s.broadcast();
    let crate_id = EntityId(7);
    let owner = s.client(a).connection_id().unwrap();
    assert_eq!(s.server.world().get(crate_id).unwrap().owner, owner);
    assert!(s.client(b).world().get(crate_id).unwrap().is_owned);

    // Not the owner: refused, and the authority re-sends its own state.
    let node = s.client(b).world().find(crate_id).unwrap();
    s.client(b).world_mut().node_mut(node).unwrap().local.position = Vec3::new(9.0, 0.0, 0.0);
    s.client(b).request_change(crate_id)?;
    s.broadcast();
    let server_node = s.server.world().find(crate_id).unwrap();
    assert_eq!(s.server.world().world_pose(server_node).position, Vec3::ZERO);
    assert_eq!(s.client(b).world().world_pose(node).position, Vec3::ZERO);

    // The owner: accepted and forwarded.
    let node_a = s.client(a).world().find(crate_id).unwrap();
    s.client(a).world_mut().node_mut(node_a).unwrap().local.position = Vec3::new(1.0, 2.0, 3.0);
    s.client(a).request_change(crate_id)?;
    s.broadcast();
    assert_eq!(
        s.server.world().world_pose(server_node).position,
        Vec3::new(1.0, 2.0, 3.0)
    );
    assert_eq!(s.client(b).world().world_pose(node).position, Vec3::new(1.0, 2.0, 3.0));

    // Destroy follows the same gate.
    s.client(b).request_destroy(crate_id)?;
    s.broadcast();
    assert!(s.server.world().find(crate_id).is_some());
    s.client(a).request_destroy(crate_id)?;
    s.broadcast();
    assert!(s.client(b).world().find(crate_id).is_none());
    Ok(())
}

#[test]
fn rpcs_travel_both_ways() -> anyhow::Result<()> {
    let mut s = Session::demo()?;
    let a = s.join(ClientKind::Vr)?;
    s.broadcast();
    let b = s.join(ClientKind::Desktop)?;
    s.broadcast();

    let door = EntityId(1);
    s.client(a).invoke_server_rpc(door, 0, "toggle", ())?;
    s.pump();
    assert!(*s.server.world().get(door).unwrap().behaviour::<Lamp>().unwrap().on.get());
    for i in [a, b] {
        let lamp = s.client(i).world().get(door).unwrap().behaviour::<Lamp>().unwrap();
        assert_eq!(lamp.flashes.len(), 1);
    }

    s.broadcast();
    for i in [a, b] {
        let lamp = s.client(i).world().get(door).unwrap().behaviour::<Lamp>().unwrap();
        assert!(*lamp.on.get());
    }

    // Answers go to the caller only.
    let me = s.client(a).own_player().unwrap();
    s.client(a).invoke_server_rpc(me, 0, "add_score", (5i32,))?;
    s.pump();
    let mine = s.client(a).world().get(me).unwrap().behaviour::<Avatar>().unwrap();
    assert_eq!(mine.announcements.len(), 1);
    let theirs = s.client(b).world().get(me).unwrap().behaviour::<Avatar>().unwrap();
    assert!(theirs.announcements.is_empty());

    s.broadcast();
    let theirs = s.client(b).world().get(me).unwrap().behaviour::<Avatar>().unwrap();
    assert_eq!(*theirs.score.get(), 5);
    Ok(())
}

#[test]
fn own_player_movement_is_pushed_and_interpolated_elsewhere() -> anyhow::Result<()> {
    let mut s = Session::demo()?;
    let a = s.join(ClientKind::Vr)?;
    s.broadcast();
    let b = s.join(ClientKind::Vr)?;
    s.broadcast();

    let me = s.client(a).own_player().unwrap();
    let root = s.client(a).local_player().unwrap();
    s.client(a).world_mut().node_mut(root).unwrap().local.position = Vec3::new(4.0, 0.0, 0.0);
    s.frame(0.0);
    let server_node = s.server.world().find(me).unwrap();
    assert_eq!(s.server.world().world_pose(server_node).position, Vec3::new(4.0, 0.0, 0.0));

    s.broadcast();
    let remote = s.client(b).world().find(me).unwrap();
    // Still at the start of the blend.
    assert_eq!(s.client(b).world().world_pose(remote).position, Vec3::ZERO);
    assert_eq!(s.client(b).interpolator().len(), 1);
    s.frame(1.0);
    assert_eq!(
        s.client(b).world().world_pose(remote).position,
        Vec3::new(4.0, 0.0, 0.0)
    );
    // The owner's copy never moved back.
    assert_eq!(s.client(a).world().world_pose(root).position, Vec3::new(4.0, 0.0, 0.0));
    Ok(())
}

#[test]
fn disconnect_removes_the_player_everywhere() -> anyhow::Result<()> {
    let mut s = Session::demo()?;
    let a = s.join(ClientKind::Vr)?;
    s.broadcast();
    let b = s.join(ClientKind::Vr)?;
    s.broadcast();
    let gone = s.client(b).own_player().unwrap();
    assert!(s.client(a).world().find(gone).is_some());

    s.clients.remove(b);
    s.broadcast();
    assert!(s.server.world().find(gone).is_none());
    assert!(s.client(a).world().find(gone).is_none());
    assert_eq!(s.server.peer_ids().len(), 1);
    Ok(())
}

#[test]
fn custom_messages_and_files_both_ways() -> anyhow::Result<()> {
    let server_dir = scratch_dir("server-files");
    let client_dir = scratch_dir("client-files");
    let server_cfg = NetConfig {
        file_dir: server_dir.display().to_string(),
        file_chunk_size: 64,
        file_send_interval_ms: 0,
        ..Default::default()
    };
    let client_cfg = NetConfig {
        file_dir: client_dir.display().to_string(),
        file_chunk_size: 64,
        file_send_interval_ms: 0,
        ..Default::default()
    };
    let mut s = Session::new(server_cfg, client_cfg)?;
    let a = s.join(ClientKind::Desktop)?;
    let conn = s.client(a).connection_id().unwrap();

    s.server.send_custom(conn, Bytes::from_static(b"hello"))?;
    s.client(a).send_custom(Bytes::from_static(b"hi"))?;
    s.pump();
    let got = s.client(a).events().drain::<CustomMessage>();
    assert_eq!(got[0].payload, Bytes::from_static(b"hello"));
    let got = s.server.events().drain::<CustomMessage>();
    assert_eq!(got[0].sender, conn);

    let upload: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
    let chunks = s.client(a).send_file(&upload, "up/data.bin");
    assert_eq!(chunks, 16);
    for _ in 0..chunks {
        s.frame(0.0);
    }
    let received = s.server.events().drain::<FileReceived>();
    assert_eq!(received.len(), 1);
    assert_eq!(std::fs::read(&received[0].path)?, upload);

    let download = b"scene notes".to_vec();
    s.server.send_file(conn, &download, "notes.txt");
    s.server.pump_files(std::time::Instant::now());
    s.pump();
    let received = s.client(a).events().drain::<FileReceived>();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].sender, ConnectionId::AUTHORITY);
    assert_eq!(std::fs::read(&received[0].path)?, download);

    let _ = std::fs::remove_dir_all(server_dir);
    let _ = std::fs::remove_dir_all(client_dir);
    Ok(())
}

#[test]
fn update_before_initial_state_is_dropped() -> anyhow::Result<()> {
    netsync_tests::init_tracing();
    let hub = LoopbackHub::new();
    let mut host = hub.host();
    let mut client = netsync_client::ReplicationClient::new(
        NetConfig::default(),
        Box::new(hub.connect()),
        netsync_shared::demo::demo_prefabs(),
        netsync_shared::demo::demo_scene(),
    )?;
    let me = ConnectionId(1);
    let mut frame = |msg_type: MsgType, payload: Bytes| {
        let env = Envelope {
            channel: "netsync".into(),
            msg_type: msg_type as u8,
            target: 0,
            payload,
        };
        host.send(env.encode(), me)
    };

    frame(
        MsgType::Handshake,
        serialize(
            &Handshake {
                connection_id: me,
                ..Default::default()
            },
            false,
        )?,
    )?;
    let early = StateUpdate {
        destroys: vec![EntityId(1)],
        ..Default::default()
    };
    frame(MsgType::StateUpdate, serialize(&early, false)?)?;
    client.poll();
    assert_eq!(client.state(), ClientState::Joining);
    assert!(client.world().find(EntityId(1)).is_some());

    frame(MsgType::InitialState, serialize(&InitialState::default(), false)?)?;
    frame(MsgType::StateUpdate, serialize(&early, false)?)?;
    client.poll();
    assert!(client.is_ready());
    assert!(client.world().find(EntityId(1)).is_none());
    Ok(())
}
