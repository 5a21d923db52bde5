//! Helpers wiring full master/client clusters over the in-process channel
//! transport for the integration tests.

use std::cell::RefCell;
use std::net::SocketAddr;
use std::rc::Rc;

use simnet_client::{ClientManager, NoopSimulationLoader, SimulationLoader};
use simnet_server::{MasterManager, SimulationDescriptor};
use simnet_shared::{
    now_ticks, ChannelNetwork, ChannelTransport, Load, NetworkSettings, NoopSimulationHooks,
};

pub fn addr(port: u16) -> SocketAddr {
    format!("127.0.0.1:{port}")
        .parse()
        .expect("loopback address must parse")
}

pub fn test_settings() -> NetworkSettings {
    NetworkSettings {
        connection_port: 0,
        timeout_ms: 5_000,
        maximum_connection_retries: 3,
        retry_interval_ms: 10,
        snapshots_per_second: 1_000,
        max_packet_size: 64 * 1024,
    }
}

pub fn test_descriptor(client_addresses: Vec<SocketAddr>) -> SimulationDescriptor {
    SimulationDescriptor {
        simulation_id: "simulation-1".to_owned(),
        name: "cluster-run".to_owned(),
        map_name: "BorregasAve".to_owned(),
        map_url: "https://assets.example/maps/borregas".to_owned(),
        agents: Vec::new(),
        cluster_client_addresses: client_addresses,
        time_of_day: "2020-05-01T12:00:00".to_owned(),
        rain: 0.0,
        fog: 0.0,
        wetness: 0.0,
        cloudiness: 0.0,
        use_traffic: false,
        use_pedestrians: false,
    }
}

/// Loader counting every load command it handled.
pub struct CountingLoader {
    pub loads: Rc<RefCell<usize>>,
}

impl CountingLoader {
    pub fn new() -> (Self, Rc<RefCell<usize>>) {
        let loads = Rc::new(RefCell::new(0));
        (
            Self {
                loads: loads.clone(),
            },
            loads,
        )
    }
}

impl SimulationLoader for CountingLoader {
    fn load(&mut self, _load: &Load) -> Result<(), String> {
        *self.loads.borrow_mut() += 1;
        Ok(())
    }
}

/// Loader failing with a fixed error message.
pub struct FailingLoader {
    pub message: String,
}

impl SimulationLoader for FailingLoader {
    fn load(&mut self, _load: &Load) -> Result<(), String> {
        Err(self.message.clone())
    }
}

pub fn spawn_master(
    network: &ChannelNetwork,
    port: u16,
    descriptor: SimulationDescriptor,
    acceptable_identifiers: &[&str],
) -> MasterManager {
    let mut settings = test_settings();
    settings.connection_port = port;
    let transport = ChannelTransport::server(network.clone(), addr(port));
    let mut master = MasterManager::new(
        settings,
        Box::new(transport),
        Box::new(NoopSimulationHooks),
    );
    master.set_simulation(descriptor);
    master
        .start_connection(
            acceptable_identifiers
                .iter()
                .map(|identifier| (*identifier).to_owned())
                .collect(),
        )
        .expect("master must start");
    master
}

pub fn spawn_client(
    network: &ChannelNetwork,
    port: u16,
    identifier: &str,
    loader: Box<dyn SimulationLoader>,
) -> ClientManager {
    let mut settings = test_settings();
    settings.connection_port = port;
    let transport = ChannelTransport::client(network.clone(), addr(port));
    let mut client = ClientManager::new(
        settings,
        Box::new(transport),
        identifier,
        loader,
        Box::new(NoopSimulationHooks),
    );
    client.start_connection().expect("client must start");
    client
}

pub fn spawn_noop_client(network: &ChannelNetwork, port: u16, identifier: &str) -> ClientManager {
    spawn_client(network, port, identifier, Box::new(NoopSimulationLoader))
}

/// Runs the given number of tick rounds over the whole cluster.
pub fn tick_cluster(master: &mut MasterManager, clients: &mut [ClientManager], rounds: usize) {
    for _ in 0..rounds {
        let now = now_ticks();
        master.tick(now);
        for client in clients.iter_mut() {
            client.tick(now);
        }
    }
}
