//! # Simnet Shared
//! Common functionality shared between the simnet-server & simnet-client
//! crates: the transport contract, the message envelope and routing layer,
//! the identifier register, the scene arena and the cluster command set.

#![deny(trivial_numeric_casts, unstable_features, unused_import_braces)]

pub mod commands;
pub mod messaging;
pub mod replication;
pub mod scene;
pub mod settings;
pub mod simulation_state;
pub mod transport;
pub mod types;

pub use commands::{
    Command, CommandInbox, EnvironmentState, Info, Load, LoadAgent, LoadResult, Ping, Pong, Stop,
    SIMULATION_MANAGER_KEY,
};
pub use messaging::{
    bytes_stack::{BytesStack, BytesStackError},
    error::MessagingError,
    id_manager::IdManager,
    ids_register::{
        BindEvent, IdsRegister, RegisterOutcome, UnregisterOutcome, IDS_REGISTER_KEY,
    },
    message::{DeliveryGuarantee, DistributedMessage, MessagesPool},
    messages_manager::{MessageAddressing, MessagesManager, PeerEvent},
    receiver::{MessageReceiver, SharedReceiver},
    time_manager::TimeManager,
};
pub use replication::{
    pop_pose, pop_quat, pop_vec3, push_pose, push_quat, push_vec3, ComponentError,
    DistributedObjectCommand, DistributedRootCommand, StateMessageKind, BYTES_PER_COMMAND_TYPE,
    DISTRIBUTED_OBJECTS_ROOT_KEY, TRANSFORM_FLAG_POSITION, TRANSFORM_FLAG_ROTATION,
    TRANSFORM_SYNC_KEY,
};
pub use scene::{NodeId, Pose, SceneError, SceneGraph, SceneRef, RELATIVE_PATH_SEPARATOR};
pub use settings::NetworkSettings;
pub use simulation_state::{NoopSimulationHooks, SimulationHooks, SimulationState};
pub use transport::{
    channel::{ChannelNetwork, ChannelTransport, LinkConditionerConfig, APPLICATION_KEY},
    error::TransportError,
    ConnectionEvent, ConnectionManager, PeerId, PeerInfo, PeerState,
};
pub use types::{
    now_ticks, HostType, Identifier, TimeTicks, BYTES_PER_ID, BYTES_PER_TIMESTAMP,
};
