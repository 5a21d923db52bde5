//! Application-level command set of the cluster lifecycle, carried inside
//! distributed messages addressed to the simulation manager key.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use log::warn;
use serde::{Deserialize, Serialize};

use crate::messaging::error::MessagingError;
use crate::messaging::message::{DeliveryGuarantee, DistributedMessage, MessagesPool};
use crate::messaging::messages_manager::MessagesManager;
use crate::messaging::receiver::MessageReceiver;
use crate::transport::PeerInfo;

/// Address key under which both lifecycle managers exchange commands.
pub const SIMULATION_MANAGER_KEY: &str = "SimulationManager";

/// Capability and version handshake a client reports after connecting.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Info {
    pub version: String,
    pub platform_version: String,
    pub operating_system: String,
}

/// One simulated agent of the load command.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LoadAgent {
    pub name: String,
    pub url: String,
    pub bridge: String,
    pub connection: String,
    pub sensors: String,
}

/// Scene, agent and environment parameters of the simulation to prepare.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Load {
    pub name: String,
    pub map_name: String,
    pub map_url: String,
    pub agents: Vec<LoadAgent>,
    pub time_of_day: String,
    pub rain: f32,
    pub fog: f32,
    pub wetness: f32,
    pub cloudiness: f32,
    pub use_traffic: bool,
    pub use_pedestrians: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LoadResult {
    pub success: bool,
    pub error_message: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Stop {
    pub simulation_id: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Ping {
    pub id: i32,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Pong {
    pub id: i32,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentState {
    pub fog: f32,
    pub rain: f32,
    pub wet: f32,
    pub cloud: f32,
    pub damage: f32,
    pub time_of_day: f32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Command {
    Info(Info),
    Load(Box<Load>),
    LoadResult(LoadResult),
    Ready,
    Run,
    Stop(Stop),
    Ping(Ping),
    Pong(Pong),
    EnvironmentState(EnvironmentState),
}

impl Command {
    /// Heartbeat commands are fire-and-forget; everything else drives the
    /// state machine and must arrive in order.
    pub fn delivery(&self) -> DeliveryGuarantee {
        match self {
            Command::Ping(_) | Command::Pong(_) => DeliveryGuarantee::Unreliable,
            _ => DeliveryGuarantee::ReliableOrdered,
        }
    }

    pub fn to_message(&self, pool: &mut MessagesPool) -> Result<DistributedMessage, MessagingError> {
        let bytes = bincode::serialize(self).map_err(|error| MessagingError::CommandEncode {
            reason: error.to_string(),
        })?;
        let mut message = pool.get_message(bytes.len(), SIMULATION_MANAGER_KEY, self.delivery());
        message.content.push_bytes(&bytes);
        Ok(message)
    }

    pub fn from_message(message: &DistributedMessage) -> Result<Command, MessagingError> {
        bincode::deserialize(message.content.raw_data()).map_err(|error| {
            MessagingError::CommandDecode {
                reason: error.to_string(),
            }
        })
    }
}

/// Queue of decoded commands, registered as the simulation manager
/// endpoint. The lifecycle managers drain it once per tick after the
/// messages manager dispatched the transport events.
#[derive(Default)]
pub struct CommandInbox {
    pending: VecDeque<(PeerInfo, Command)>,
}

impl CommandInbox {
    pub fn new_shared() -> Rc<RefCell<Self>> {
        Rc::new(RefCell::new(Self::default()))
    }

    pub fn drain(&mut self) -> Vec<(PeerInfo, Command)> {
        self.pending.drain(..).collect()
    }
}

impl MessageReceiver for CommandInbox {
    fn key(&self) -> &str {
        SIMULATION_MANAGER_KEY
    }

    fn receive_message(
        &mut self,
        sender: &PeerInfo,
        message: &mut DistributedMessage,
        _messages: &mut MessagesManager,
    ) {
        match Command::from_message(message) {
            Ok(command) => self.pending.push_back((sender.clone(), command)),
            Err(error) => warn!("Dropping malformed simulation command: {error}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commands_round_trip_through_a_message() {
        let mut pool = MessagesPool::new();
        let command = Command::Load(Box::new(Load {
            name: "cluster-run".to_owned(),
            map_name: "BorregasAve".to_owned(),
            map_url: "https://assets.example/maps/borregas".to_owned(),
            agents: vec![LoadAgent {
                name: "Jaguar2015XE".to_owned(),
                url: "https://assets.example/vehicles/jaguar".to_owned(),
                bridge: String::new(),
                connection: String::new(),
                sensors: "[]".to_owned(),
            }],
            time_of_day: "2020-05-01T12:00:00".to_owned(),
            rain: 0.0,
            fog: 0.25,
            wetness: 0.0,
            cloudiness: 0.5,
            use_traffic: true,
            use_pedestrians: false,
        }));

        let message = command.to_message(&mut pool).unwrap();
        assert_eq!(message.address_key, SIMULATION_MANAGER_KEY);
        assert_eq!(message.delivery, DeliveryGuarantee::ReliableOrdered);
        assert_eq!(Command::from_message(&message).unwrap(), command);
    }

    #[test]
    fn heartbeat_commands_travel_unreliable() {
        assert_eq!(
            Command::Ping(Ping { id: 1 }).delivery(),
            DeliveryGuarantee::Unreliable
        );
        assert_eq!(
            Command::Pong(Pong { id: 1 }).delivery(),
            DeliveryGuarantee::Unreliable
        );
        assert_eq!(Command::Ready.delivery(), DeliveryGuarantee::ReliableOrdered);
    }
}
