use std::cell::RefCell;
use std::net::SocketAddr;
use std::rc::Rc;

use log::{error, info, warn};

use simnet_shared::{
    now_ticks, Command, CommandInbox, ConnectionManager, EnvironmentState, HostType, Info, Load,
    LoadResult, MessagesManager, NetworkSettings, PeerEvent, PeerInfo, Pong, SceneGraph,
    SharedReceiver, SimulationHooks, SimulationState, Stop, TimeTicks, SIMULATION_MANAGER_KEY,
};

use crate::manager::connect_routine::{ConnectRoutine, RoutineOutcome};
use crate::world::mocked_objects_root::MockedObjectsRoot;
use crate::ClientError;

/// Prepares the simulation content announced by a load command.
pub trait SimulationLoader {
    /// Downloads and loads everything the simulation needs. The error
    /// string is reported to the master verbatim.
    fn load(&mut self, load: &Load) -> Result<(), String>;

    /// Drops whatever a previous load prepared.
    fn reset(&mut self) {}
}

/// Loader for clients without simulation content.
#[derive(Default)]
pub struct NoopSimulationLoader;

impl SimulationLoader for NoopSimulationLoader {
    fn load(&mut self, _load: &Load) -> Result<(), String> {
        Ok(())
    }
}

/// Simulation network client manager.
///
/// Owns the cluster session on a mirror node: the transport, the messages
/// manager, the mocked objects root and the client side of the lifecycle
/// state machine.
pub struct ClientManager {
    settings: NetworkSettings,
    state: SimulationState,
    connection: Box<dyn ConnectionManager>,
    messages: MessagesManager,
    inbox: Rc<RefCell<CommandInbox>>,
    identifier: String,
    master_peer: Option<PeerInfo>,
    objects_root: Option<Rc<RefCell<MockedObjectsRoot>>>,
    connect_routine: Option<ConnectRoutine>,
    loader: Box<dyn SimulationLoader>,
    hooks: Box<dyn SimulationHooks>,
    environment: Option<EnvironmentState>,
    /// The simulation to run is already known locally; loading is skipped.
    simulation_known: bool,
}

impl ClientManager {
    pub fn new(
        settings: NetworkSettings,
        connection: Box<dyn ConnectionManager>,
        identifier: impl Into<String>,
        loader: Box<dyn SimulationLoader>,
        hooks: Box<dyn SimulationHooks>,
    ) -> Self {
        Self {
            settings,
            state: SimulationState::Initial,
            connection,
            messages: MessagesManager::new(HostType::Client),
            inbox: CommandInbox::new_shared(),
            identifier: identifier.into(),
            master_peer: None,
            objects_root: None,
            connect_routine: None,
            loader,
            hooks,
            environment: None,
            simulation_known: false,
        }
    }

    pub fn state(&self) -> SimulationState {
        self.state
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn master_peer(&self) -> Option<&PeerInfo> {
        self.master_peer.as_ref()
    }

    /// Round-trip latency to the master, for display only.
    pub fn latency_ms(&self) -> u32 {
        self.master_peer
            .as_ref()
            .map(|peer| peer.latency_ms)
            .unwrap_or(0)
    }

    pub fn environment_state(&self) -> Option<&EnvironmentState> {
        self.environment.as_ref()
    }

    pub fn messages(&mut self) -> &mut MessagesManager {
        &mut self.messages
    }

    pub fn objects_root(&self) -> Option<Rc<RefCell<MockedObjectsRoot>>> {
        self.objects_root.clone()
    }

    pub fn set_simulation_known(&mut self, known: bool) {
        self.simulation_known = known;
    }

    /// Starts the connection listening for incoming packets.
    pub fn start_connection(&mut self) -> Result<(), ClientError> {
        let inbox: SharedReceiver = self.inbox.clone();
        self.messages.register_object(inbox)?;
        self.connection.start(self.settings.connection_port)?;
        info!("ClientManager started the connection manager.");
        Ok(())
    }

    /// Stops the connection, cancelling the retry routine at whatever tick
    /// it was on.
    pub fn stop_connection(&mut self) {
        self.connect_routine = None;
        self.inbox.borrow_mut().drain();
        self.set_state(SimulationState::Initial);
        self.connection.stop();
        self.messages.unregister_object(SIMULATION_MANAGER_KEY);
        info!("ClientManager stopped the connection manager.");
    }

    /// Spawns the retry loop over all known master endpoints.
    pub fn try_connect_to_master(&mut self, master_endpoints: Vec<SocketAddr>) {
        self.connect_routine = Some(ConnectRoutine::new(
            master_endpoints,
            &self.settings,
            now_ticks(),
        ));
        self.set_state(SimulationState::Connecting);
    }

    fn set_state(&mut self, state: SimulationState) {
        if self.state == state {
            return;
        }
        self.state = state;
    }

    /// Pumps the transport, the retry routine and the lifecycle commands.
    /// Must run once per simulation tick.
    pub fn tick(&mut self, now: TimeTicks) {
        let timed_out = match self.connect_routine.as_mut() {
            Some(routine) if self.master_peer.is_none() => {
                routine.tick(now, self.connection.as_mut(), &self.identifier)
                    == RoutineOutcome::TimedOut
            }
            _ => false,
        };
        if timed_out {
            self.on_connection_timeout();
        }
        let peer_events = self.messages.pool_events(self.connection.as_mut());
        for event in peer_events {
            match event {
                PeerEvent::Connected(peer) => self.on_peer_connected(peer),
                PeerEvent::Disconnected(peer) => self.on_peer_disconnected(peer),
            }
        }
        let commands = self.inbox.borrow_mut().drain();
        for (sender, command) in commands {
            self.handle_command(sender, command);
        }
    }

    /// No master was reachable within the timeout. Fatal for this session:
    /// the simulation is stopped, nothing reconnects automatically.
    fn on_connection_timeout(&mut self) {
        let attempted: Vec<SocketAddr> = self
            .connect_routine
            .take()
            .map(|routine| routine.endpoints().to_vec())
            .unwrap_or_default();
        error!(
            "ClientManager could not connect to any master. Local address: '{}', attempted master addresses: {:?}, current UTC ticks: {}.",
            self.connection
                .local_endpoint()
                .map(|endpoint| endpoint.to_string())
                .unwrap_or_else(|| "unbound".to_owned()),
            attempted,
            now_ticks()
        );
        self.stop_simulation();
    }

    fn on_peer_connected(&mut self, peer: PeerInfo) {
        if self.master_peer.is_some() {
            warn!("ClientManager ignores an additional peer at '{}'.", peer.endpoint);
            return;
        }
        info!("Master {} connected.", peer.endpoint);
        self.connect_routine = None;
        self.master_peer = Some(peer);
        self.set_state(SimulationState::Connected);
        let info = Info {
            version: env!("CARGO_PKG_VERSION").to_owned(),
            platform_version: format!("simnet {}", env!("CARGO_PKG_VERSION")),
            operating_system: std::env::consts::OS.to_owned(),
        };
        self.send_command_to_master(&Command::Info(info));
        if self.simulation_known {
            self.set_state(SimulationState::Ready);
            self.send_command_to_master(&Command::Ready);
        }
    }

    /// A disconnection outside of an explicit stop. The active simulation
    /// stops, bound identifiers are revoked so a reconnect under the same
    /// identifier can re-bind the mirrored objects by key.
    fn on_peer_disconnected(&mut self, peer: PeerInfo) {
        let is_master = self
            .master_peer
            .as_ref()
            .is_some_and(|master| master.id == peer.id);
        if !is_master {
            return;
        }
        self.master_peer = None;
        if self.state != SimulationState::Initial {
            error!("Connection with the master at '{}' has been lost.", peer.endpoint);
        }
        self.stop_simulation();
        self.messages.revoke_identifiers();
        info!("Peer {} disconnected.", peer.endpoint);
    }

    fn handle_command(&mut self, sender: PeerInfo, command: Command) {
        let from_master = self
            .master_peer
            .as_ref()
            .is_some_and(|master| master.id == sender.id);
        if !from_master {
            warn!("ClientManager ignores a command from the unknown peer at '{}'.", sender.endpoint);
            return;
        }
        match command {
            Command::Load(load) => self.on_load_command(&load),
            Command::Run => self.on_run_command(),
            Command::Stop(stop) => self.on_stop_command(&stop),
            Command::EnvironmentState(state) => self.environment = Some(state),
            Command::Ping(ping) => {
                self.send_command_to_master(&Command::Pong(Pong { id: ping.id }))
            }
            other => warn!("ClientManager ignores an unexpected command: {other:?}"),
        }
    }

    fn on_load_command(&mut self, load: &Load) {
        if self.state != SimulationState::Connected {
            warn!(
                "Received the load command in the {} state.",
                self.state
            );
        }
        self.set_state(SimulationState::Loading);
        info!("Preparing simulation");
        match self.loader.load(load) {
            Ok(()) => {
                if let Err(error) = self.initialize_simulation_scene() {
                    self.report_load_failure(error.to_string());
                }
            }
            Err(message) => self.report_load_failure(message),
        }
    }

    fn report_load_failure(&mut self, message: String) {
        error!("Simulation load failed: {message}");
        self.send_command_to_master(&Command::LoadResult(LoadResult {
            success: false,
            error_message: message,
        }));
        self.loader.reset();
        self.set_state(SimulationState::Connected);
    }

    /// Creates (or reuses) the mocked objects root, reports the successful
    /// load and moves to `Ready`.
    pub fn initialize_simulation_scene(
        &mut self,
    ) -> Result<Rc<RefCell<MockedObjectsRoot>>, ClientError> {
        if self.master_peer.is_none() {
            return Err(ClientError::NotConnected);
        }
        let root = match self.objects_root.clone() {
            Some(root) => root,
            None => {
                let scene = SceneGraph::new_shared();
                let root_node = scene.borrow().root();
                let root =
                    MockedObjectsRoot::new_shared(scene, root_node, self.settings.clone());
                MockedObjectsRoot::initialize(&root, &mut self.messages)?;
                self.objects_root = Some(root.clone());
                root
            }
        };
        info!("Client ready to start");
        self.send_command_to_master(&Command::LoadResult(LoadResult {
            success: true,
            error_message: String::new(),
        }));
        self.set_state(SimulationState::Ready);
        Ok(root)
    }

    /// The run command starts the local simulation; `Running` is reached
    /// when the simulation reports itself live.
    fn on_run_command(&mut self) {
        if self.state != SimulationState::Ready && self.state != SimulationState::Connected {
            warn!("Received the run command in the {} state.", self.state);
            return;
        }
        self.set_state(SimulationState::Loading);
        self.hooks.simulation_started();
    }

    /// Marks the local simulation as live.
    pub fn notify_simulation_running(&mut self) {
        if self.state == SimulationState::Loading {
            self.set_state(SimulationState::Running);
        }
    }

    fn on_stop_command(&mut self, _stop: &Stop) {
        if self.state == SimulationState::Initial {
            return;
        }
        self.stop_simulation();
    }

    fn stop_simulation(&mut self) {
        self.loader.reset();
        self.hooks.revert_engine_changes();
        self.hooks.simulation_stopped();
        self.set_state(SimulationState::Initial);
    }

    fn send_command_to_master(&mut self, command: &Command) {
        let Some(endpoint) = self.master_peer.as_ref().map(|peer| peer.endpoint) else {
            warn!("ClientManager cannot send a command without a connected master.");
            return;
        };
        let message = match command.to_message(self.messages.pool()) {
            Ok(message) => message,
            Err(error) => {
                error!("Could not encode a lifecycle command: {error}");
                return;
            }
        };
        if let Err(error) = self.messages.unicast_message(endpoint, message) {
            error!("Could not send a lifecycle command to the master: {error}");
        }
    }
}
