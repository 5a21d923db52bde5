//! Recovery of a mirror that loses its connection mid-session: identifiers
//! are revoked, the objects survive and re-bind by key on reconnect.

use std::cell::RefCell;
use std::rc::Rc;

use simnet_client::{MockedObject, MockedObjectsRoot, MockedTransformSync};
use simnet_server::{DistributedObject, DistributedObjectsRoot, TransformSync};
use simnet_shared::{
    now_ticks, ChannelNetwork, ChannelTransport, ConnectionManager, HostType, MessagesManager,
    NetworkSettings, Pose, SceneGraph,
};
use simnet_test::addr;

fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn settings() -> NetworkSettings {
    NetworkSettings {
        snapshots_per_second: 100_000,
        ..NetworkSettings::default()
    }
}

struct Pair {
    master_transport: ChannelTransport,
    master_messages: MessagesManager,
    master_root: Rc<RefCell<DistributedObjectsRoot>>,
    mirror_transport: ChannelTransport,
    mirror_messages: MessagesManager,
    mirror_root: Rc<RefCell<MockedObjectsRoot>>,
}

impl Pair {
    fn spawn(network: &ChannelNetwork, master_port: u16, mirror_port: u16) -> Self {
        let mut master_transport = ChannelTransport::server(network.clone(), addr(master_port));
        master_transport
            .acceptable_identifiers()
            .push("mirror-1".to_owned());
        master_transport.start(master_port).unwrap();
        let mut master_messages = MessagesManager::new(HostType::Master);
        let master_scene = SceneGraph::new_shared();
        let master_root_node = master_scene.borrow().root();
        let master_root =
            DistributedObjectsRoot::new_shared(master_scene, master_root_node, settings());
        DistributedObjectsRoot::initialize(&master_root, &mut master_messages).unwrap();

        let mut mirror_transport = ChannelTransport::client(network.clone(), addr(mirror_port));
        mirror_transport.start(mirror_port).unwrap();
        let mut mirror_messages = MessagesManager::new(HostType::Client);
        let mirror_scene = SceneGraph::new_shared();
        let mirror_root_node = mirror_scene.borrow().root();
        let mirror_root =
            MockedObjectsRoot::new_shared(mirror_scene, mirror_root_node, settings());
        MockedObjectsRoot::initialize(&mirror_root, &mut mirror_messages).unwrap();

        Self {
            master_transport,
            master_messages,
            master_root,
            mirror_transport,
            mirror_messages,
            mirror_root,
        }
    }

    fn tick_rounds(&mut self, rounds: usize) {
        for _ in 0..rounds {
            self.master_messages.pool_events(&mut self.master_transport);
            DistributedObjectsRoot::tick(&self.master_root, now_ticks(), &mut self.master_messages);
            self.mirror_messages.pool_events(&mut self.mirror_transport);
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
    }
}

#[test]
fn reconnecting_mirror_rebinds_the_same_keys_without_new_identifiers() {
    init_logs();
    let network = ChannelNetwork::new();
    let mut pair = Pair::spawn(&network, 9400, 9401);

    let object = DistributedObjectsRoot::create_object(
        &pair.master_root,
        "Vehicles/",
        "Ego",
        &mut pair.master_messages,
    )
    .unwrap();
    let node = object.borrow().node();
    DistributedObject::attach_component(
        &object,
        TransformSync::snapshot_source(),
        &mut pair.master_messages,
    )
    .unwrap();

    let mocked = MockedObjectsRoot::create_object(
        &pair.mirror_root,
        "Vehicles/",
        "Ego",
        &mut pair.mirror_messages,
    )
    .unwrap();
    let mocked_node = mocked.borrow().node();
    MockedObject::attach_component(
        &mocked,
        MockedTransformSync::snapshot_sink(),
        &mut pair.mirror_messages,
    )
    .unwrap();

    pair.mirror_transport.connect(addr(9400), "mirror-1").unwrap();
    pair.tick_rounds(4);

    let object_id = pair.mirror_messages.resolve_id("Vehicles/Ego/").unwrap();
    let component_id = pair
        .mirror_messages
        .resolve_id("Vehicles/Ego/TransformSync")
        .unwrap();

    // the connection drops mid-session: all bindings are demoted, the
    // mirrored objects stay alive
    pair.mirror_transport.disconnect(addr(9400));
    pair.mirror_messages.revoke_identifiers();
    pair.tick_rounds(2);
    assert!(pair.mirror_messages.resolve_id("Vehicles/Ego/").is_none());

    // reconnect under the same identifier: the authority replays its
    // bindings and the old keys resolve to the same identifiers
    pair.mirror_transport.connect(addr(9400), "mirror-1").unwrap();
    pair.tick_rounds(4);
    assert_eq!(
        pair.mirror_messages.resolve_id("Vehicles/Ego/"),
        Some(object_id)
    );
    assert_eq!(
        pair.mirror_messages.resolve_id("Vehicles/Ego/TransformSync"),
        Some(component_id)
    );

    // replication keeps working against the re-bound keys
    let moved = Pose {
        position: [5.0, 1.0, 2.0],
        rotation: [0.0, 0.0, 0.0, 1.0],
    };
    pair.master_root
        .borrow()
        .scene()
        .borrow_mut()
        .set_pose(node, moved)
        .unwrap();
    pair.tick_rounds(4);
    assert_eq!(
        pair.mirror_root
            .borrow()
            .scene()
            .borrow()
            .pose(mocked_node)
            .unwrap(),
        moved
    );
}
