use thiserror::Error;

use simnet_shared::{MessagingError, TransportError};

use crate::world::MockingError;

/// Errors of the client side of a cluster session.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ClientError {
    /// The operation needs a connected master peer.
    #[error("The client is not connected to a master")]
    NotConnected,

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Messaging(#[from] MessagingError),

    #[error(transparent)]
    Mocking(#[from] MockingError),
}
