pub mod channel;
pub mod error;

use std::net::SocketAddr;
use std::time::Duration;

use crate::messaging::message::{DeliveryGuarantee, DistributedMessage};
use error::TransportError;

/// Stable handle of a peer within one connection manager instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PeerId(pub u64);

/// Connection state of a peer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeerState {
    Connecting,
    Connected,
    Disconnected,
}

/// A remote participant reachable via the transport.
#[derive(Clone, Debug)]
pub struct PeerInfo {
    pub id: PeerId,
    pub endpoint: SocketAddr,
    /// Identifier string the peer presented while connecting, if any.
    pub identifier: Option<String>,
    pub state: PeerState,
    /// Measured round-trip latency, for display only.
    pub latency_ms: u32,
    /// Measured remote clock delta (`remote clock - local clock`) in ticks.
    pub remote_time_ticks_difference: i64,
}

/// Events pumped out of the transport once per tick.
#[derive(Debug)]
pub enum ConnectionEvent {
    PeerConnected(PeerInfo),
    PeerDisconnected(PeerInfo),
    MessageReceived {
        sender: PeerInfo,
        message: DistributedMessage,
    },
}

/// Contract of the connection manager the replication core runs on.
///
/// Implementations may buffer I/O on internal threads, but nothing reaches
/// user code outside of [`ConnectionManager::pool_events`], which must be
/// invoked once per simulation tick on the main thread.
pub trait ConnectionManager {
    /// True on the master side; the side that assigns identifiers.
    fn is_server(&self) -> bool;

    fn port(&self) -> u16;

    fn timeout(&self) -> Duration;

    fn connected_peers_count(&self) -> usize;

    /// Identifiers from which incoming connections are accepted.
    fn acceptable_identifiers(&mut self) -> &mut Vec<String>;

    /// Starts listening for incoming packets on the given port.
    fn start(&mut self, port: u16) -> Result<(), TransportError>;

    /// Stops the manager and disconnects every peer.
    fn stop(&mut self);

    /// Starts a connection to the given endpoint, presenting the identifier.
    fn connect(&mut self, endpoint: SocketAddr, identifier: &str) -> Result<PeerId, TransportError>;

    /// Pumps all buffered connection and receive events.
    fn pool_events(&mut self) -> Vec<ConnectionEvent>;

    /// Sends the payload to a single connected peer.
    fn unicast(
        &mut self,
        endpoint: SocketAddr,
        payload: &[u8],
        delivery: DeliveryGuarantee,
    ) -> Result<(), TransportError>;

    /// Sends the payload to all connected peers.
    fn broadcast(&mut self, payload: &[u8], delivery: DeliveryGuarantee)
        -> Result<(), TransportError>;

    /// Disconnects a single peer. No local event is emitted for a
    /// disconnection the local side initiated; the remote side observes a
    /// `PeerDisconnected` event.
    fn disconnect(&mut self, endpoint: SocketAddr);

    /// Peer manager of a connected peer, if any.
    fn connected_peer(&self, endpoint: SocketAddr) -> Option<&PeerInfo>;

    /// Local address the manager is bound to, once started.
    fn local_endpoint(&self) -> Option<SocketAddr>;
}
