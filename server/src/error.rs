use thiserror::Error;

use simnet_shared::{MessagingError, TransportError};

use crate::world::ReplicationError;

/// Errors of the master side of a cluster session.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum MasterError {
    /// The cluster cannot start without a simulation descriptor.
    #[error("Set the simulation descriptor before connecting to the clients")]
    SimulationMissing,

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Messaging(#[from] MessagingError),

    #[error(transparent)]
    Replication(#[from] ReplicationError),
}
