use std::cell::RefCell;
use std::net::SocketAddr;
use std::rc::Rc;

use log::{error, info, warn};

use simnet_shared::{
    Command, CommandInbox, ConnectionManager, EnvironmentState, HostType, Info, Load, LoadAgent,
    LoadResult, MessagesManager, NetworkSettings, PeerEvent, PeerInfo, Ping, Pong, SceneGraph,
    SharedReceiver, SimulationHooks, SimulationState, Stop, TimeTicks, SIMULATION_MANAGER_KEY,
};

use crate::master::load_balancer::NetworkLoadBalancer;
use crate::world::objects_root::DistributedObjectsRoot;
use crate::MasterError;

/// Identifier the master presents when dialing its clients.
pub const MASTER_IDENTIFIER: &str = "master";

/// Everything the master needs to describe one cluster simulation run.
#[derive(Clone, Debug)]
pub struct SimulationDescriptor {
    pub simulation_id: String,
    pub name: String,
    pub map_name: String,
    pub map_url: String,
    pub agents: Vec<LoadAgent>,
    /// Addresses of every client node in the cluster.
    pub cluster_client_addresses: Vec<SocketAddr>,
    pub time_of_day: String,
    pub rain: f32,
    pub fog: f32,
    pub wetness: f32,
    pub cloudiness: f32,
    pub use_traffic: bool,
    pub use_pedestrians: bool,
}

impl SimulationDescriptor {
    fn to_load(&self) -> Load {
        Load {
            name: self.name.clone(),
            map_name: self.map_name.clone(),
            map_url: self.map_url.clone(),
            agents: self.agents.clone(),
            time_of_day: self.time_of_day.clone(),
            rain: self.rain,
            fog: self.fog,
            wetness: self.wetness,
            cloudiness: self.cloudiness,
            use_traffic: self.use_traffic,
            use_pedestrians: self.use_pedestrians,
        }
    }
}

/// Connection data of a single tracked client.
pub struct ClientConnection {
    pub peer: PeerInfo,
    pub state: SimulationState,
}

/// Simulation network master manager.
///
/// Owns the cluster session on the authority side: the transport, the
/// messages manager, the distributed objects root and the per-client state
/// machine driving connect → load → ready → run → stop.
pub struct MasterManager {
    settings: NetworkSettings,
    state: SimulationState,
    connection: Box<dyn ConnectionManager>,
    messages: MessagesManager,
    inbox: Rc<RefCell<CommandInbox>>,
    clients: Vec<ClientConnection>,
    objects_root: Option<Rc<RefCell<DistributedObjectsRoot>>>,
    load_balancer: NetworkLoadBalancer,
    simulation: Option<SimulationDescriptor>,
    hooks: Box<dyn SimulationHooks>,
    ping_id: i32,
    received_pongs: usize,
}

impl MasterManager {
    pub fn new(
        settings: NetworkSettings,
        connection: Box<dyn ConnectionManager>,
        hooks: Box<dyn SimulationHooks>,
    ) -> Self {
        Self {
            settings,
            state: SimulationState::Initial,
            connection,
            messages: MessagesManager::new(HostType::Master),
            inbox: CommandInbox::new_shared(),
            clients: Vec::new(),
            objects_root: None,
            load_balancer: NetworkLoadBalancer::new(),
            simulation: None,
            hooks,
            ping_id: 0,
            received_pongs: 0,
        }
    }

    pub fn state(&self) -> SimulationState {
        self.state
    }

    pub fn clients(&self) -> &[ClientConnection] {
        &self.clients
    }

    pub fn messages(&mut self) -> &mut MessagesManager {
        &mut self.messages
    }

    pub fn load_balancer(&mut self) -> &mut NetworkLoadBalancer {
        &mut self.load_balancer
    }

    pub fn objects_root(&self) -> Option<Rc<RefCell<DistributedObjectsRoot>>> {
        self.objects_root.clone()
    }

    pub fn set_simulation(&mut self, simulation: SimulationDescriptor) {
        self.simulation = Some(simulation);
    }

    fn set_state(&mut self, state: SimulationState) {
        if self.state == state {
            return;
        }
        self.state = state;
    }

    /// Starts listening for incoming packets, accepting connections from
    /// the given cluster client identifiers.
    pub fn start_connection(
        &mut self,
        acceptable_identifiers: Vec<String>,
    ) -> Result<(), MasterError> {
        let inbox: SharedReceiver = self.inbox.clone();
        self.messages.register_object(inbox)?;
        self.connection
            .acceptable_identifiers()
            .extend(acceptable_identifiers);
        self.connection.start(self.settings.connection_port)?;
        self.set_state(SimulationState::Connecting);
        info!("MasterManager started the connection manager.");
        Ok(())
    }

    /// Stops the connection and resets the session.
    pub fn stop_connection(&mut self) {
        self.disconnect_from_clients();
        self.inbox.borrow_mut().drain();
        self.set_state(SimulationState::Initial);
        self.connection.stop();
        self.connection.acceptable_identifiers().clear();
        self.messages.unregister_object(SIMULATION_MANAGER_KEY);
        info!("MasterManager stopped the connection manager.");
    }

    /// Dials every client address in the simulation's cluster descriptor.
    pub fn connect_to_clients(&mut self) -> Result<(), MasterError> {
        let addresses = self
            .simulation
            .as_ref()
            .ok_or(MasterError::SimulationMissing)?
            .cluster_client_addresses
            .clone();
        for address in addresses {
            if let Err(error) = self.connection.connect(address, MASTER_IDENTIFIER) {
                warn!("MasterManager could not dial the client at '{address}': {error}");
            }
        }
        self.set_state(SimulationState::Connecting);
        Ok(())
    }

    /// Creates the authoritative objects root for the loaded scene.
    pub fn initialize_simulation_scene(
        &mut self,
    ) -> Result<Rc<RefCell<DistributedObjectsRoot>>, MasterError> {
        if self.objects_root.is_some() {
            warn!("Setting new master objects root, but previous one is still available on the scene.");
        }
        let scene = SceneGraph::new_shared();
        let root_node = scene.borrow().root();
        let root = DistributedObjectsRoot::new_shared(scene, root_node, self.settings.clone());
        DistributedObjectsRoot::initialize(&root, &mut self.messages)?;
        self.objects_root = Some(root.clone());
        info!("MasterManager was initialized and waits for all the clients.");
        Ok(root)
    }

    pub fn is_connected_to_client(&self, endpoint: SocketAddr) -> bool {
        self.connection.connected_peer(endpoint).is_some()
    }

    /// Pumps the transport, handles lifecycle commands and drives the
    /// replication broadcast. Must run once per simulation tick.
    pub fn tick(&mut self, now: TimeTicks) {
        let peer_events = self.messages.pool_events(self.connection.as_mut());
        for event in peer_events {
            match event {
                PeerEvent::Connected(peer) => self.on_client_connected(peer),
                PeerEvent::Disconnected(peer) => self.on_client_disconnected(peer),
            }
        }
        let commands = self.inbox.borrow_mut().drain();
        for (sender, command) in commands {
            self.handle_command(sender, command);
        }
        // lifecycle transitions are evaluated over the whole command batch,
        // so an info and a ready arriving together count once
        self.try_broadcast_load();
        self.try_start_simulation();
        if let Some(root) = self.objects_root.clone() {
            DistributedObjectsRoot::tick(&root, now, &mut self.messages);
        }
    }

    fn on_client_connected(&mut self, peer: PeerInfo) {
        info!("Client connected: {}", peer.endpoint);
        self.load_balancer.client_connected(peer.id);
        self.clients.push(ClientConnection {
            peer,
            state: SimulationState::Connecting,
        });
    }

    fn on_client_disconnected(&mut self, peer: PeerInfo) {
        info!(
            "MasterManager disconnected from the client with address '{}'.",
            peer.endpoint
        );
        self.load_balancer.client_disconnected(peer.id);
        self.clients
            .retain(|client| client.peer.id != peer.id);
        if self.state != SimulationState::Initial && self.state != SimulationState::Stopping {
            error!("Stopping current cluster simulation as one connection with client has been lost.");
            self.abort_cluster();
        }
    }

    fn handle_command(&mut self, sender: PeerInfo, command: Command) {
        match command {
            Command::Info(info) => self.on_info_command(sender, info),
            Command::LoadResult(result) => self.on_load_result_command(sender, result),
            Command::Ready => self.on_ready_command(sender),
            Command::Pong(pong) => self.on_pong_command(pong),
            other => warn!("MasterManager ignores an unexpected command: {other:?}"),
        }
    }

    fn expected_clients(&self) -> usize {
        self.simulation
            .as_ref()
            .map(|simulation| simulation.cluster_client_addresses.len())
            .unwrap_or(0)
    }

    fn client_mut(&mut self, peer: &PeerInfo) -> Option<&mut ClientConnection> {
        self.clients
            .iter_mut()
            .find(|client| client.peer.id == peer.id)
    }

    fn on_info_command(&mut self, sender: PeerInfo, info: Info) {
        let Some(client) = self.client_mut(&sender) else {
            warn!("Received the info command from an unconnected client.");
            return;
        };
        client.state = SimulationState::Connected;
        info!("Client connected from {}", sender.endpoint);
        info!("Client version = {}", info.version);
        info!("Client platform version = {}", info.platform_version);
        info!("Client OS = {}", info.operating_system);
    }

    /// Once every expected client reported in, the whole cluster moves to
    /// `Loading` behind exactly one load command.
    fn try_broadcast_load(&mut self) {
        let expected = self.expected_clients();
        if expected == 0
            || self.clients.len() != expected
            || !self
                .clients
                .iter()
                .all(|client| client.state == SimulationState::Connected)
        {
            return;
        }
        let Some(load) = self.simulation.as_ref().map(SimulationDescriptor::to_load) else {
            return;
        };
        self.broadcast_command(&Command::Load(Box::new(load)));
        for client in &mut self.clients {
            client.state = SimulationState::Loading;
        }
        self.set_state(SimulationState::Loading);
    }

    fn on_load_result_command(&mut self, sender: PeerInfo, result: LoadResult) {
        if !result.success {
            // the remote error is reported verbatim
            error!("Client failed to load: {}", result.error_message);
            error!(
                "Failed to start '{}' simulation",
                self.simulation
                    .as_ref()
                    .map(|simulation| simulation.name.as_str())
                    .unwrap_or("unknown")
            );
            self.abort_cluster();
            return;
        }
        info!("Client loaded");
        let Some(client) = self.client_mut(&sender) else {
            warn!("Received the load result command from an unconnected client.");
            return;
        };
        client.state = SimulationState::Ready;
    }

    fn on_ready_command(&mut self, sender: PeerInfo) {
        let Some(client) = self.client_mut(&sender) else {
            warn!("Received the ready command from an unconnected client.");
            return;
        };
        client.state = SimulationState::Ready;
    }

    fn on_pong_command(&mut self, pong: Pong) {
        if pong.id == self.ping_id {
            self.received_pongs += 1;
        }
    }

    /// Runs the simulation once every expected client is ready.
    fn try_start_simulation(&mut self) {
        let expected = self.expected_clients();
        if expected == 0
            || self.clients.len() != expected
            || !self
                .clients
                .iter()
                .all(|client| client.state == SimulationState::Ready)
        {
            return;
        }
        self.run_simulation();
    }

    /// Broadcasts the run command to all clients' simulations and runs the
    /// local one.
    fn run_simulation(&mut self) {
        info!("MasterManager runs the prepared simulation and broadcasts run command.");
        self.broadcast_command(&Command::Run);
        for client in &mut self.clients {
            client.state = SimulationState::Running;
        }
        self.hooks.simulation_started();
        self.set_state(SimulationState::Running);
    }

    /// Broadcasts the stop command and reverts the engine changes before
    /// tearing the connections down. A no-op while no simulation is active.
    pub fn broadcast_stop_command(&mut self) {
        if self.state == SimulationState::Initial || self.state == SimulationState::Stopping {
            return;
        }
        self.set_state(SimulationState::Stopping);
        info!("MasterManager broadcasts the simulation stop command.");
        let simulation_id = self
            .simulation
            .as_ref()
            .map(|simulation| simulation.simulation_id.clone())
            .unwrap_or_default();
        self.broadcast_command(&Command::Stop(Stop { simulation_id }));
        self.messages.flush(self.connection.as_mut());
        self.hooks.revert_engine_changes();
        self.teardown_session();
    }

    /// Resets the whole cluster after a fatal lifecycle error; no
    /// partial-cluster recovery is attempted.
    fn abort_cluster(&mut self) {
        self.set_state(SimulationState::Stopping);
        self.hooks.revert_engine_changes();
        self.teardown_session();
    }

    fn teardown_session(&mut self) {
        if let Some(root) = self.objects_root.take() {
            DistributedObjectsRoot::deinitialize(&root, &mut self.messages);
        }
        self.disconnect_from_clients();
        self.hooks.simulation_stopped();
        self.set_state(SimulationState::Initial);
    }

    /// Disconnects from all the clients.
    pub fn disconnect_from_clients(&mut self) {
        if self.clients.is_empty() {
            return;
        }
        for client in std::mem::take(&mut self.clients) {
            self.connection.disconnect(client.peer.endpoint);
        }
        self.load_balancer.reset();
        self.set_state(SimulationState::Initial);
        info!("MasterManager disconnected from all the clients.");
    }

    /// Sends a ping command to all the connected clients.
    pub fn send_ping(&mut self) {
        self.received_pongs = 0;
        self.ping_id = self.ping_id.wrapping_add(1);
        self.broadcast_command(&Command::Ping(Ping { id: self.ping_id }));
    }

    /// True once every client answered the latest ping.
    pub fn received_all_pongs(&self) -> bool {
        self.received_pongs == self.clients.len()
    }

    /// Pushes the current environment state to every client.
    pub fn send_environment_state(&mut self, state: EnvironmentState) {
        self.broadcast_command(&Command::EnvironmentState(state));
    }

    fn broadcast_command(&mut self, command: &Command) {
        let message = match command.to_message(self.messages.pool()) {
            Ok(message) => message,
            Err(error) => {
                error!("Could not encode a lifecycle command: {error}");
                return;
            }
        };
        if let Err(error) = self.messages.broadcast_message(message) {
            error!("Could not broadcast a lifecycle command: {error}");
        }
    }
}
