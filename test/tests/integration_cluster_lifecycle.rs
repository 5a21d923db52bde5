//! Cluster lifecycle of a 1-master/2-client session: connect → info → load
//! → ready → run, with the failure paths.

use simnet_shared::{ChannelNetwork, EnvironmentState, SimulationState};
use simnet_test::{
    addr, spawn_client, spawn_master, spawn_noop_client, tick_cluster, test_descriptor,
    CountingLoader, FailingLoader,
};

fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[test]
fn happy_path_reaches_running_with_exactly_one_load_and_run() {
    init_logs();
    let network = ChannelNetwork::new();
    let mut master = spawn_master(
        &network,
        9200,
        test_descriptor(vec![addr(9201), addr(9202)]),
        &["client-1", "client-2"],
    );
    let (first_loader, first_loads) = CountingLoader::new();
    let (second_loader, second_loads) = CountingLoader::new();
    let mut clients = vec![
        spawn_client(&network, 9201, "client-1", Box::new(first_loader)),
        spawn_client(&network, 9202, "client-2", Box::new(second_loader)),
    ];
    clients[0].try_connect_to_master(vec![addr(9200)]);
    clients[1].try_connect_to_master(vec![addr(9200)]);

    tick_cluster(&mut master, &mut clients, 10);

    assert_eq!(master.state(), SimulationState::Running);
    assert_eq!(master.clients().len(), 2);
    assert!(master
        .clients()
        .iter()
        .all(|client| client.state == SimulationState::Running));

    // exactly one load command reached each client
    assert_eq!(*first_loads.borrow(), 1);
    assert_eq!(*second_loads.borrow(), 1);

    // the run command moved the clients into the implicit loading phase
    for client in &mut clients {
        assert_eq!(client.state(), SimulationState::Loading);
        client.notify_simulation_running();
        assert_eq!(client.state(), SimulationState::Running);
    }
}

#[test]
fn no_load_is_broadcast_before_every_client_reported_info() {
    init_logs();
    let network = ChannelNetwork::new();
    let mut master = spawn_master(
        &network,
        9210,
        test_descriptor(vec![addr(9211), addr(9212)]),
        &["client-1", "client-2"],
    );
    let (loader, loads) = CountingLoader::new();
    let mut clients = vec![spawn_client(&network, 9211, "client-1", Box::new(loader))];
    clients[0].try_connect_to_master(vec![addr(9210)]);

    tick_cluster(&mut master, &mut clients, 10);

    // one of two expected clients is connected: still no load
    assert_eq!(master.state(), SimulationState::Connecting);
    assert_eq!(*loads.borrow(), 0);
    assert_eq!(clients[0].state(), SimulationState::Connected);
}

#[test]
fn load_failure_aborts_the_whole_cluster() {
    init_logs();
    let network = ChannelNetwork::new();
    let mut master = spawn_master(
        &network,
        9220,
        test_descriptor(vec![addr(9221), addr(9222)]),
        &["client-1", "client-2"],
    );
    let (loader, _loads) = CountingLoader::new();
    let mut clients = vec![
        spawn_client(&network, 9221, "client-1", Box::new(loader)),
        spawn_client(
            &network,
            9222,
            "client-2",
            Box::new(FailingLoader {
                message: "asset bundle is corrupted".to_owned(),
            }),
        ),
    ];
    clients[0].try_connect_to_master(vec![addr(9220)]);
    clients[1].try_connect_to_master(vec![addr(9220)]);

    tick_cluster(&mut master, &mut clients, 10);

    // no partial-cluster recovery: reset state, cleared client list
    assert_eq!(master.state(), SimulationState::Initial);
    assert!(master.clients().is_empty());
    assert_ne!(clients[0].state(), SimulationState::Running);
    assert_ne!(clients[1].state(), SimulationState::Running);
}

#[test]
fn clients_knowing_the_simulation_skip_loading() {
    init_logs();
    let network = ChannelNetwork::new();
    let mut master = spawn_master(
        &network,
        9230,
        test_descriptor(vec![addr(9231)]),
        &["client-1"],
    );
    let (loader, loads) = CountingLoader::new();
    let mut clients = vec![spawn_client(&network, 9231, "client-1", Box::new(loader))];
    clients[0].set_simulation_known(true);
    clients[0].try_connect_to_master(vec![addr(9230)]);

    tick_cluster(&mut master, &mut clients, 10);

    assert_eq!(master.state(), SimulationState::Running);
    assert_eq!(*loads.borrow(), 0);
}

#[test]
fn ping_pong_updates_latency_bookkeeping_only() {
    init_logs();
    let network = ChannelNetwork::new();
    let mut master = spawn_master(
        &network,
        9240,
        test_descriptor(vec![addr(9241)]),
        &["client-1"],
    );
    let mut clients = vec![spawn_noop_client(&network, 9241, "client-1")];
    clients[0].try_connect_to_master(vec![addr(9240)]);
    tick_cluster(&mut master, &mut clients, 10);
    let state_before = master.state();

    master.send_ping();
    tick_cluster(&mut master, &mut clients, 4);

    assert!(master.received_all_pongs());
    // the heartbeat never drives the state machine
    assert_eq!(master.state(), state_before);
}

#[test]
fn environment_state_reaches_every_client() {
    init_logs();
    let network = ChannelNetwork::new();
    let mut master = spawn_master(
        &network,
        9250,
        test_descriptor(vec![addr(9251)]),
        &["client-1"],
    );
    let mut clients = vec![spawn_noop_client(&network, 9251, "client-1")];
    clients[0].try_connect_to_master(vec![addr(9250)]);
    tick_cluster(&mut master, &mut clients, 10);

    master.send_environment_state(EnvironmentState {
        fog: 0.4,
        rain: 0.1,
        wet: 0.2,
        cloud: 0.6,
        damage: 0.0,
        time_of_day: 13.5,
    });
    tick_cluster(&mut master, &mut clients, 4);

    let environment = clients[0]
        .environment_state()
        .expect("the environment state must arrive");
    assert_eq!(environment.fog, 0.4);
    assert_eq!(environment.time_of_day, 13.5);
}

#[test]
fn stop_command_is_idempotent_and_resets_the_cluster() {
    init_logs();
    let network = ChannelNetwork::new();
    let mut master = spawn_master(
        &network,
        9260,
        test_descriptor(vec![addr(9261)]),
        &["client-1"],
    );
    let (loader, _loads) = CountingLoader::new();
    let mut clients = vec![spawn_client(&network, 9261, "client-1", Box::new(loader))];
    clients[0].try_connect_to_master(vec![addr(9260)]);
    tick_cluster(&mut master, &mut clients, 10);
    assert_eq!(master.state(), SimulationState::Running);

    master.broadcast_stop_command();
    tick_cluster(&mut master, &mut clients, 4);
    assert_eq!(master.state(), SimulationState::Initial);
    assert_eq!(clients[0].state(), SimulationState::Initial);

    // stopping an already stopped cluster is a no-op
    master.broadcast_stop_command();
    assert_eq!(master.state(), SimulationState::Initial);
}
