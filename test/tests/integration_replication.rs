//! Replication of the authoritative object graph into mocked mirrors:
//! static objects, dynamic instantiation, selective distribution and
//! activation sync.

use std::cell::RefCell;
use std::net::SocketAddr;
use std::rc::Rc;

use simnet_client::{MockPrefab, MockedObject, MockedObjectsRoot, MockedTransformSync};
use simnet_server::{
    DistributedObject, DistributedObjectsRoot, Prefab, TransformSync,
};
use simnet_shared::{
    now_ticks, ChannelNetwork, ChannelTransport, ConnectionManager, HostType, MessagesManager,
    NetworkSettings, NodeId, Pose, SceneGraph,
};
use simnet_test::addr;

fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn replication_settings() -> NetworkSettings {
    NetworkSettings {
        // cadence the broadcast every tick
        snapshots_per_second: 100_000,
        ..NetworkSettings::default()
    }
}

struct Authority {
    transport: ChannelTransport,
    messages: MessagesManager,
    root: Rc<RefCell<DistributedObjectsRoot>>,
}

impl Authority {
    fn spawn(network: &ChannelNetwork, port: u16, identifiers: &[&str]) -> Self {
        let mut transport = ChannelTransport::server(network.clone(), addr(port));
        for identifier in identifiers {
            transport
                .acceptable_identifiers()
                .push((*identifier).to_owned());
        }
        transport.start(port).unwrap();
        let mut messages = MessagesManager::new(HostType::Master);
        let scene = SceneGraph::new_shared();
        let root_node = scene.borrow().root();
        let root = DistributedObjectsRoot::new_shared(scene, root_node, replication_settings());
        DistributedObjectsRoot::initialize(&root, &mut messages).unwrap();
        Self {
            transport,
            messages,
            root,
        }
    }

    fn tick(&mut self) {
        self.messages.pool_events(&mut self.transport);
        DistributedObjectsRoot::tick(&self.root, now_ticks(), &mut self.messages);
    }

    fn set_pose(&self, node: NodeId, pose: Pose) {
        self.root
            .borrow()
            .scene()
            .borrow_mut()
            .set_pose(node, pose)
            .unwrap();
    }
}

struct Mirror {
    transport: ChannelTransport,
    messages: MessagesManager,
    root: Rc<RefCell<MockedObjectsRoot>>,
}

impl Mirror {
    fn spawn(network: &ChannelNetwork, port: u16) -> Self {
        let mut transport = ChannelTransport::client(network.clone(), addr(port));
        transport.start(port).unwrap();
        let mut messages = MessagesManager::new(HostType::Client);
        let scene = SceneGraph::new_shared();
        let root_node = scene.borrow().root();
        let root = MockedObjectsRoot::new_shared(scene, root_node, replication_settings());
        MockedObjectsRoot::initialize(&root, &mut messages).unwrap();
        Self {
            transport,
            messages,
            root,
        }
    }

    fn connect(&mut self, master: SocketAddr, identifier: &str) {
        self.transport.connect(master, identifier).unwrap();
    }

    fn tick(&mut self) {
        self.messages.pool_events(&mut self.transport);
    }

    fn find_node(&self, path: &[&str]) -> Option<NodeId> {
        let root = self.root.borrow();
        let scene = root.scene();
        let scene = scene.borrow();
        let mut current = root.root_node();
        for name in path {
            current = scene.find_child(current, name)?;
        }
        Some(current)
    }

    fn pose(&self, node: NodeId) -> Pose {
        self.root.borrow().scene().borrow().pose(node).unwrap()
    }
}

fn tick_rounds(authority: &mut Authority, mirrors: &mut [&mut Mirror], rounds: usize) {
    for _ in 0..rounds {
        authority.tick();
        for mirror in mirrors.iter_mut() {
            mirror.tick();
        }
        std::thread::sleep(std::time::Duration::from_millis(1));
    }
}

fn moved_pose() -> Pose {
    Pose {
        position: [12.5, 0.5, -3.0],
        rotation: [0.0, 0.7071, 0.0, 0.7071],
    }
}

#[test]
fn static_object_replicates_its_transform() {
    init_logs();
    let network = ChannelNetwork::new();
    let mut authority = Authority::spawn(&network, 9300, &["mirror-1"]);
    let mut mirror = Mirror::spawn(&network, 9301);

    let object = DistributedObjectsRoot::create_object(
        &authority.root,
        "Vehicles/",
        "Ego",
        &mut authority.messages,
    )
    .unwrap();
    let node = object.borrow().node();
    authority.set_pose(node, moved_pose());
    DistributedObject::attach_component(
        &object,
        TransformSync::snapshot_source(),
        &mut authority.messages,
    )
    .unwrap();

    let mocked = MockedObjectsRoot::create_object(
        &mirror.root,
        "Vehicles/",
        "Ego",
        &mut mirror.messages,
    )
    .unwrap();
    let mocked_node = mocked.borrow().node();
    MockedObject::attach_component(
        &mocked,
        MockedTransformSync::snapshot_sink(),
        &mut mirror.messages,
    )
    .unwrap();

    mirror.connect(addr(9300), "mirror-1");
    tick_rounds(&mut authority, &mut [&mut mirror], 4);

    // the replayed initial snapshot carried the authority pose
    assert_eq!(mirror.pose(mocked_node), moved_pose());

    // subsequent movement arrives through the cadenced snapshots
    let next = Pose {
        position: [20.0, 1.0, 4.0],
        ..moved_pose()
    };
    authority.set_pose(node, next);
    tick_rounds(&mut authority, &mut [&mut mirror], 4);
    assert_eq!(mirror.pose(mocked_node), next);
}

#[test]
fn delta_capable_transform_replicates_field_changes() {
    init_logs();
    let network = ChannelNetwork::new();
    let mut authority = Authority::spawn(&network, 9310, &["mirror-1"]);
    let mut mirror = Mirror::spawn(&network, 9311);

    let object = DistributedObjectsRoot::create_object(
        &authority.root,
        "",
        "Npc",
        &mut authority.messages,
    )
    .unwrap();
    let node = object.borrow().node();
    DistributedObject::attach_component(
        &object,
        TransformSync::delta_source(),
        &mut authority.messages,
    )
    .unwrap();

    let mocked =
        MockedObjectsRoot::create_object(&mirror.root, "", "Npc", &mut mirror.messages).unwrap();
    let mocked_node = mocked.borrow().node();
    MockedObject::attach_component(
        &mocked,
        MockedTransformSync::delta_sink(),
        &mut mirror.messages,
    )
    .unwrap();

    mirror.connect(addr(9310), "mirror-1");
    tick_rounds(&mut authority, &mut [&mut mirror], 4);
    assert_eq!(mirror.pose(mocked_node), Pose::default());

    // only the position changes; the delta carries just that field
    let moved = Pose {
        position: [3.0, 0.0, 9.0],
        ..Pose::default()
    };
    authority.set_pose(node, moved);
    tick_rounds(&mut authority, &mut [&mut mirror], 4);
    assert_eq!(mirror.pose(mocked_node), moved);
}

#[test]
fn broadcast_instantiation_spawns_the_mirror_object() {
    init_logs();
    let network = ChannelNetwork::new();
    let mut authority = Authority::spawn(&network, 9320, &["mirror-1"]);
    let mut mirror = Mirror::spawn(&network, 9321);
    let prefab_id = authority.root.borrow_mut().register_prefab(Prefab {
        name: "Npc".to_owned(),
        components: vec![Box::new(TransformSync::delta_source)],
    });
    let mirror_prefab_id = mirror.root.borrow_mut().register_prefab(MockPrefab {
        name: "Npc".to_owned(),
        components: vec![Box::new(MockedTransformSync::delta_sink)],
    });
    assert_eq!(prefab_id, mirror_prefab_id);

    mirror.connect(addr(9320), "mirror-1");
    tick_rounds(&mut authority, &mut [&mut mirror], 3);

    let object = DistributedObjectsRoot::instantiate_prefab_and_broadcast(
        &authority.root,
        prefab_id,
        "Agents/",
        &mut authority.messages,
    )
    .unwrap();
    tick_rounds(&mut authority, &mut [&mut mirror], 4);

    let mocked_node = mirror
        .find_node(&["Agents", "Npc"])
        .expect("the mirror must spawn the instantiated object");

    // the spawned pair stays in sync
    let moved = moved_pose();
    authority.set_pose(object.borrow().node(), moved);
    tick_rounds(&mut authority, &mut [&mut mirror], 4);
    assert_eq!(mirror.pose(mocked_node), moved);
}

#[test]
fn late_joining_mirror_receives_the_instantiation_replay() {
    init_logs();
    let network = ChannelNetwork::new();
    let mut authority = Authority::spawn(&network, 9330, &["mirror-1"]);
    let prefab_id = authority.root.borrow_mut().register_prefab(Prefab {
        name: "Npc".to_owned(),
        components: vec![Box::new(TransformSync::delta_source)],
    });
    DistributedObjectsRoot::instantiate_prefab_and_broadcast(
        &authority.root,
        prefab_id,
        "Agents/",
        &mut authority.messages,
    )
    .unwrap();

    // the mirror joins only after the object already exists
    let mut mirror = Mirror::spawn(&network, 9331);
    mirror.root.borrow_mut().register_prefab(MockPrefab {
        name: "Npc".to_owned(),
        components: vec![Box::new(MockedTransformSync::delta_sink)],
    });
    mirror.connect(addr(9330), "mirror-1");
    tick_rounds(&mut authority, &mut [&mut mirror], 4);

    assert!(mirror.find_node(&["Agents", "Npc"]).is_some());
}

#[test]
fn selective_instantiation_reaches_only_the_addressed_mirror() {
    init_logs();
    let network = ChannelNetwork::new();
    let mut authority = Authority::spawn(&network, 9340, &["mirror-1", "mirror-2", "mirror-3"]);
    let prefab_id = authority.root.borrow_mut().register_prefab(Prefab {
        name: "LidarContent".to_owned(),
        components: vec![Box::new(TransformSync::delta_source)],
    });
    let mut selected = Mirror::spawn(&network, 9341);
    selected.root.borrow_mut().register_prefab(MockPrefab {
        name: "LidarContent".to_owned(),
        components: vec![Box::new(MockedTransformSync::delta_sink)],
    });
    let mut excluded = Mirror::spawn(&network, 9342);
    excluded.root.borrow_mut().register_prefab(MockPrefab {
        name: "LidarContent".to_owned(),
        components: vec![Box::new(MockedTransformSync::delta_sink)],
    });
    selected.connect(addr(9340), "mirror-1");
    excluded.connect(addr(9340), "mirror-2");
    tick_rounds(&mut authority, &mut [&mut selected, &mut excluded], 3);

    DistributedObjectsRoot::instantiate_prefab_selectively(
        &authority.root,
        prefab_id,
        "Sensors/",
        &[addr(9341)],
        &mut authority.messages,
    )
    .unwrap();
    tick_rounds(&mut authority, &mut [&mut selected, &mut excluded], 4);

    assert!(selected.find_node(&["Sensors", "LidarContent"]).is_some());
    assert!(excluded.find_node(&["Sensors", "LidarContent"]).is_none());

    // the late-join replay honors the selection too
    let mut late = Mirror::spawn(&network, 9343);
    late.root.borrow_mut().register_prefab(MockPrefab {
        name: "LidarContent".to_owned(),
        components: vec![Box::new(MockedTransformSync::delta_sink)],
    });
    late.connect(addr(9340), "mirror-3");
    tick_rounds(&mut authority, &mut [&mut late], 4);
    assert!(late.find_node(&["Sensors", "LidarContent"]).is_none());
}

#[test]
fn activation_changes_replicate_to_the_mirror() {
    init_logs();
    let network = ChannelNetwork::new();
    let mut authority = Authority::spawn(&network, 9350, &["mirror-1"]);
    let mut mirror = Mirror::spawn(&network, 9351);

    let object = DistributedObjectsRoot::create_object(
        &authority.root,
        "",
        "Traffic",
        &mut authority.messages,
    )
    .unwrap();
    let mocked =
        MockedObjectsRoot::create_object(&mirror.root, "", "Traffic", &mut mirror.messages)
            .unwrap();
    let mocked_node = mocked.borrow().node();

    mirror.connect(addr(9350), "mirror-1");
    tick_rounds(&mut authority, &mut [&mut mirror], 3);

    object
        .borrow_mut()
        .set_active(false, &mut authority.messages);
    tick_rounds(&mut authority, &mut [&mut mirror], 4);
    assert!(!mirror
        .root
        .borrow()
        .scene()
        .borrow()
        .is_active(mocked_node)
        .unwrap());

    object.borrow_mut().set_active(true, &mut authority.messages);
    tick_rounds(&mut authority, &mut [&mut mirror], 4);
    assert!(mirror
        .root
        .borrow()
        .scene()
        .borrow()
        .is_active(mocked_node)
        .unwrap());
}
