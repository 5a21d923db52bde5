use std::net::SocketAddr;

use thiserror::Error;

/// Errors that can occur during transport operations.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The connection manager was used before a successful start.
    #[error("The connection manager has not been started")]
    NotStarted,

    /// Local address is already taken inside the network.
    #[error("Address '{endpoint}' is already registered in the network")]
    AddressInUse { endpoint: SocketAddr },

    /// Target endpoint is not reachable inside the network.
    #[error("No node is listening at '{endpoint}'")]
    Unreachable { endpoint: SocketAddr },

    /// Target endpoint is not in the connected peer set.
    #[error("Peer '{endpoint}' is not connected")]
    UnknownPeer { endpoint: SocketAddr },

    /// Payload exceeds the largest packet the transport accepts. The send
    /// fails locally without corrupting the stream.
    #[error("Too large message to be sent: {size} bytes (limit {limit})")]
    MessageTooLarge { size: usize, limit: usize },

    /// A connection attempt to the same endpoint is already active.
    #[error("A connection to '{endpoint}' is already active")]
    AlreadyConnecting { endpoint: SocketAddr },
}
