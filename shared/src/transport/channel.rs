//! In-process transport over crossbeam channels.
//!
//! Stands in for the reliable-UDP library in tests and single-machine
//! clusters: every node registers its address at a shared [`ChannelNetwork`]
//! hub and exchanges frames through unbounded queues. A link conditioner can
//! degrade the traffic within the limits of each delivery guarantee.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};
use log::{error, info, warn};

use crate::messaging::message::{DeliveryGuarantee, DistributedMessage};
use crate::transport::error::TransportError;
use crate::transport::{ConnectionEvent, ConnectionManager, PeerId, PeerInfo, PeerState};
use crate::types::{now_ticks, TimeTicks};

/// Connection application key.
pub const APPLICATION_KEY: &str = "SIMNET";

#[derive(Debug)]
enum Frame {
    ConnectRequest {
        application_key: String,
        identifier: String,
        clock_sample: TimeTicks,
    },
    ConnectAccept {
        clock_sample: TimeTicks,
    },
    ConnectReject,
    Disconnect,
    Data {
        delivery: DeliveryGuarantee,
        payload: Box<[u8]>,
    },
}

#[derive(Debug)]
struct NetPacket {
    from: SocketAddr,
    frame: Frame,
}

/// Degrades outgoing traffic without ever violating a delivery guarantee:
/// only unreliable packets are dropped and only non-ordered packets are
/// reordered.
#[derive(Clone, Copy, Debug)]
pub struct LinkConditionerConfig {
    /// Chance in [0, 1] that an unreliable packet is dropped.
    pub unreliable_loss_chance: f32,
    /// Chance in [0, 1] that a non-ordered packet is delivered late.
    pub reorder_chance: f32,
    /// Seed of the conditioner random rolls.
    pub seed: u64,
}

struct LinkConditioner {
    config: LinkConditionerConfig,
    rng: fastrand::Rng,
    held: Option<(SocketAddr, DeliveryGuarantee, Box<[u8]>)>,
}

impl LinkConditioner {
    fn new(config: LinkConditionerConfig) -> Self {
        Self {
            config,
            rng: fastrand::Rng::with_seed(config.seed),
            held: None,
        }
    }

    /// Returns the packets to actually put on the wire, oldest first.
    fn condition(
        &mut self,
        target: SocketAddr,
        delivery: DeliveryGuarantee,
        payload: &[u8],
    ) -> Vec<(SocketAddr, DeliveryGuarantee, Box<[u8]>)> {
        let mut out = Vec::new();
        match delivery {
            DeliveryGuarantee::Unreliable => {
                if self.rng.f32() < self.config.unreliable_loss_chance {
                    return self.flush(out);
                }
            }
            DeliveryGuarantee::ReliableOrdered => {
                // ordered traffic passes through untouched
                out.push((target, delivery, payload.into()));
                return self.flush(out);
            }
            DeliveryGuarantee::ReliableUnordered => {}
        }
        if self.held.is_none() && self.rng.f32() < self.config.reorder_chance {
            self.held = Some((target, delivery, payload.into()));
            return out;
        }
        out.push((target, delivery, payload.into()));
        self.flush(out)
    }

    fn flush(
        &mut self,
        mut out: Vec<(SocketAddr, DeliveryGuarantee, Box<[u8]>)>,
    ) -> Vec<(SocketAddr, DeliveryGuarantee, Box<[u8]>)> {
        if let Some(held) = self.held.take() {
            out.push(held);
        }
        out
    }
}

type Registry = HashMap<SocketAddr, Sender<NetPacket>>;

/// Shared hub of an in-process network, cloned into every node.
#[derive(Clone, Default)]
pub struct ChannelNetwork {
    registry: Arc<Mutex<Registry>>,
}

impl ChannelNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Registry> {
        self.registry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn register(&self, endpoint: SocketAddr) -> Result<Receiver<NetPacket>, TransportError> {
        let mut registry = self.lock();
        if registry.contains_key(&endpoint) {
            return Err(TransportError::AddressInUse { endpoint });
        }
        let (sender, receiver) = unbounded();
        registry.insert(endpoint, sender);
        Ok(receiver)
    }

    fn deregister(&self, endpoint: SocketAddr) {
        self.lock().remove(&endpoint);
    }

    fn send_to(&self, target: SocketAddr, packet: NetPacket) -> Result<(), TransportError> {
        let registry = self.lock();
        let sender = registry
            .get(&target)
            .ok_or(TransportError::Unreachable { endpoint: target })?;
        sender
            .send(packet)
            .map_err(|_| TransportError::Unreachable { endpoint: target })
    }
}

/// Connection manager implementation over a [`ChannelNetwork`].
pub struct ChannelTransport {
    network: ChannelNetwork,
    local_endpoint: SocketAddr,
    is_server: bool,
    timeout: Duration,
    max_packet_size: usize,
    acceptable_identifiers: Vec<String>,
    inbox: Option<Receiver<NetPacket>>,
    peers: HashMap<SocketAddr, PeerInfo>,
    /// Peers dropped after a failed send, reported on the next event pump.
    pending_disconnects: Vec<PeerInfo>,
    next_peer_id: u64,
    conditioner: Option<LinkConditioner>,
    clock_offset: i64,
    latency_ms: u32,
}

impl ChannelTransport {
    fn new(network: ChannelNetwork, local_endpoint: SocketAddr, is_server: bool) -> Self {
        Self {
            network,
            local_endpoint,
            is_server,
            timeout: Duration::from_secs(30),
            max_packet_size: 64 * 1024,
            acceptable_identifiers: Vec::new(),
            inbox: None,
            peers: HashMap::new(),
            pending_disconnects: Vec::new(),
            next_peer_id: 0,
            conditioner: None,
            clock_offset: 0,
            latency_ms: 0,
        }
    }

    /// The master's connection manager.
    pub fn server(network: ChannelNetwork, local_endpoint: SocketAddr) -> Self {
        Self::new(network, local_endpoint, true)
    }

    /// A client's connection manager.
    pub fn client(network: ChannelNetwork, local_endpoint: SocketAddr) -> Self {
        Self::new(network, local_endpoint, false)
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    pub fn set_max_packet_size(&mut self, limit: usize) {
        self.max_packet_size = limit;
    }

    pub fn set_conditioner(&mut self, config: Option<LinkConditionerConfig>) {
        self.conditioner = config.map(LinkConditioner::new);
    }

    /// Shifts this node's virtual clock, ticks.
    pub fn set_clock_offset(&mut self, offset: i64) {
        self.clock_offset = offset;
    }

    /// Synthetic measured latency reported for every peer.
    pub fn set_latency(&mut self, latency_ms: u32) {
        self.latency_ms = latency_ms;
    }

    fn local_clock(&self) -> TimeTicks {
        now_ticks() + self.clock_offset
    }

    fn next_peer_id(&mut self) -> PeerId {
        let id = PeerId(self.next_peer_id);
        self.next_peer_id += 1;
        id
    }

    fn send_frame(&self, target: SocketAddr, frame: Frame) -> Result<(), TransportError> {
        self.network.send_to(
            target,
            NetPacket {
                from: self.local_endpoint,
                frame,
            },
        )
    }

    fn send_data(
        &mut self,
        target: SocketAddr,
        payload: &[u8],
        delivery: DeliveryGuarantee,
    ) -> Result<(), TransportError> {
        let wire = match &mut self.conditioner {
            Some(conditioner) => conditioner.condition(target, delivery, payload),
            None => vec![(target, delivery, payload.into())],
        };
        for (target, delivery, payload) in wire {
            self.send_frame(target, Frame::Data { delivery, payload })?;
        }
        Ok(())
    }

    /// A send into a dead link disconnects the affected peer; the layer
    /// itself never retries.
    fn drop_peer(&mut self, endpoint: SocketAddr) {
        if let Some(mut peer) = self.peers.remove(&endpoint) {
            error!("ChannelTransport lost the link to '{endpoint}', disconnecting the peer.");
            peer.state = PeerState::Disconnected;
            self.pending_disconnects.push(peer);
        }
    }

    fn check_size(&self, payload: &[u8]) -> Result<(), TransportError> {
        if payload.len() > self.max_packet_size {
            return Err(TransportError::MessageTooLarge {
                size: payload.len(),
                limit: self.max_packet_size,
            });
        }
        Ok(())
    }

    fn handle_connect_request(
        &mut self,
        from: SocketAddr,
        application_key: String,
        identifier: String,
        clock_sample: TimeTicks,
        events: &mut Vec<ConnectionEvent>,
    ) {
        if application_key != APPLICATION_KEY {
            warn!(
                "ChannelTransport rejected a connection request from address '{from}', invalid key was passed: {application_key}."
            );
            let _ = self.send_frame(from, Frame::ConnectReject);
            return;
        }
        if self.is_server {
            if self
                .peers
                .values()
                .any(|peer| peer.identifier.as_deref() == Some(identifier.as_str()))
            {
                // connection to the same peer is already established, probably a
                // request sent from another sub-network
                let _ = self.send_frame(from, Frame::ConnectReject);
                return;
            }
            if !self.acceptable_identifiers.iter().any(|id| *id == identifier) {
                warn!(
                    "ChannelTransport rejected a connection request from address '{from}', unacceptable identifier was passed: {identifier}."
                );
                let _ = self.send_frame(from, Frame::ConnectReject);
                return;
            }
        } else if self
            .peers
            .values()
            .any(|peer| peer.state == PeerState::Connected)
        {
            // a client follows a single master
            error!(
                "ChannelTransport received a connection request from address '{from}' but is already connected to its master."
            );
            let _ = self.send_frame(from, Frame::ConnectReject);
            return;
        }
        info!("ChannelTransport accepted a connection request from address '{from}'.");
        let peer = PeerInfo {
            id: self.next_peer_id(),
            endpoint: from,
            identifier: Some(identifier),
            state: PeerState::Connected,
            latency_ms: self.latency_ms,
            remote_time_ticks_difference: clock_sample - self.local_clock(),
        };
        let _ = self.send_frame(
            from,
            Frame::ConnectAccept {
                clock_sample: self.local_clock(),
            },
        );
        self.peers.insert(from, peer.clone());
        events.push(ConnectionEvent::PeerConnected(peer));
    }

    fn handle_packet(&mut self, packet: NetPacket, events: &mut Vec<ConnectionEvent>) {
        let from = packet.from;
        match packet.frame {
            Frame::ConnectRequest {
                application_key,
                identifier,
                clock_sample,
            } => self.handle_connect_request(from, application_key, identifier, clock_sample, events),
            Frame::ConnectAccept { clock_sample } => {
                let Some(peer) = self.peers.get_mut(&from) else {
                    return;
                };
                if peer.state != PeerState::Connecting {
                    return;
                }
                peer.state = PeerState::Connected;
                peer.remote_time_ticks_difference = clock_sample - (now_ticks() + self.clock_offset);
                peer.latency_ms = self.latency_ms;
                events.push(ConnectionEvent::PeerConnected(peer.clone()));
            }
            Frame::ConnectReject => {
                if self.peers.remove(&from).is_some() {
                    warn!("ChannelTransport connection to '{from}' was rejected.");
                }
            }
            Frame::Disconnect => {
                if let Some(mut peer) = self.peers.remove(&from) {
                    let was_connected = peer.state == PeerState::Connected;
                    peer.state = PeerState::Disconnected;
                    if was_connected {
                        events.push(ConnectionEvent::PeerDisconnected(peer));
                    }
                }
            }
            Frame::Data { delivery, payload } => {
                let Some(peer) = self.peers.get(&from) else {
                    return;
                };
                if peer.state != PeerState::Connected {
                    return;
                }
                let message = DistributedMessage::received(&payload, delivery, peer.id);
                events.push(ConnectionEvent::MessageReceived {
                    sender: peer.clone(),
                    message,
                });
            }
        }
    }
}

impl ConnectionManager for ChannelTransport {
    fn is_server(&self) -> bool {
        self.is_server
    }

    fn port(&self) -> u16 {
        self.local_endpoint.port()
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn connected_peers_count(&self) -> usize {
        self.peers
            .values()
            .filter(|peer| peer.state == PeerState::Connected)
            .count()
    }

    fn acceptable_identifiers(&mut self) -> &mut Vec<String> {
        &mut self.acceptable_identifiers
    }

    fn start(&mut self, port: u16) -> Result<(), TransportError> {
        if self.inbox.is_some() {
            return Ok(());
        }
        self.local_endpoint.set_port(port);
        let inbox = self.network.register(self.local_endpoint)?;
        self.inbox = Some(inbox);
        info!(
            "ChannelTransport started using the address '{}'.",
            self.local_endpoint
        );
        Ok(())
    }

    fn stop(&mut self) {
        let endpoints: Vec<SocketAddr> = self.peers.keys().copied().collect();
        for endpoint in endpoints {
            let _ = self.send_frame(endpoint, Frame::Disconnect);
        }
        self.peers.clear();
        if self.inbox.take().is_some() {
            self.network.deregister(self.local_endpoint);
        }
        info!("ChannelTransport was stopped.");
    }

    fn connect(&mut self, endpoint: SocketAddr, identifier: &str) -> Result<PeerId, TransportError> {
        if self.inbox.is_none() {
            return Err(TransportError::NotStarted);
        }
        if self.peers.contains_key(&endpoint) {
            return Err(TransportError::AlreadyConnecting { endpoint });
        }
        let id = self.next_peer_id();
        self.peers.insert(
            endpoint,
            PeerInfo {
                id,
                endpoint,
                identifier: Some(identifier.to_owned()),
                state: PeerState::Connecting,
                latency_ms: 0,
                remote_time_ticks_difference: 0,
            },
        );
        let request = Frame::ConnectRequest {
            application_key: APPLICATION_KEY.to_owned(),
            identifier: identifier.to_owned(),
            clock_sample: self.local_clock(),
        };
        if let Err(error) = self.send_frame(endpoint, request) {
            self.peers.remove(&endpoint);
            return Err(error);
        }
        info!("ChannelTransport starts the connection to a peer with address '{endpoint}'.");
        Ok(id)
    }

    fn pool_events(&mut self) -> Vec<ConnectionEvent> {
        let mut events: Vec<ConnectionEvent> = self
            .pending_disconnects
            .drain(..)
            .map(ConnectionEvent::PeerDisconnected)
            .collect();
        let Some(inbox) = &self.inbox else {
            return events;
        };
        let mut packets = Vec::new();
        while let Ok(packet) = inbox.try_recv() {
            packets.push(packet);
        }
        for packet in packets {
            self.handle_packet(packet, &mut events);
        }
        // a reordered packet must not outlive the tick that produced it
        let held = self
            .conditioner
            .as_mut()
            .map(|conditioner| conditioner.flush(Vec::new()))
            .unwrap_or_default();
        for (target, delivery, payload) in held {
            let _ = self.send_frame(target, Frame::Data { delivery, payload });
        }
        events
    }

    fn unicast(
        &mut self,
        endpoint: SocketAddr,
        payload: &[u8],
        delivery: DeliveryGuarantee,
    ) -> Result<(), TransportError> {
        self.check_size(payload)?;
        let connected = self
            .peers
            .get(&endpoint)
            .is_some_and(|peer| peer.state == PeerState::Connected);
        if !connected {
            return Err(TransportError::UnknownPeer { endpoint });
        }
        let result = self.send_data(endpoint, payload, delivery);
        if matches!(result, Err(TransportError::Unreachable { .. })) {
            self.drop_peer(endpoint);
        }
        result
    }

    fn broadcast(
        &mut self,
        payload: &[u8],
        delivery: DeliveryGuarantee,
    ) -> Result<(), TransportError> {
        self.check_size(payload)?;
        let endpoints: Vec<SocketAddr> = self
            .peers
            .values()
            .filter(|peer| peer.state == PeerState::Connected)
            .map(|peer| peer.endpoint)
            .collect();
        for endpoint in endpoints {
            if let Err(error) = self.send_data(endpoint, payload, delivery) {
                if matches!(error, TransportError::Unreachable { .. }) {
                    self.drop_peer(endpoint);
                }
            }
        }
        Ok(())
    }

    fn disconnect(&mut self, endpoint: SocketAddr) {
        if self.peers.remove(&endpoint).is_some() {
            let _ = self.send_frame(endpoint, Frame::Disconnect);
        }
    }

    fn connected_peer(&self, endpoint: SocketAddr) -> Option<&PeerInfo> {
        self.peers
            .get(&endpoint)
            .filter(|peer| peer.state == PeerState::Connected)
    }

    fn local_endpoint(&self) -> Option<SocketAddr> {
        self.inbox.as_ref().map(|_| self.local_endpoint)
    }
}

impl Drop for ChannelTransport {
    fn drop(&mut self) {
        if self.inbox.is_some() {
            self.network.deregister(self.local_endpoint);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    fn connected_pair() -> (ChannelTransport, ChannelTransport) {
        let network = ChannelNetwork::new();
        let mut server = ChannelTransport::server(network.clone(), addr(9000));
        let mut client = ChannelTransport::client(network, addr(9001));
        server.acceptable_identifiers().push("client-1".to_owned());
        server.start(9000).unwrap();
        client.start(9001).unwrap();
        client.connect(addr(9000), "client-1").unwrap();
        let server_events = server.pool_events();
        assert!(matches!(
            server_events.as_slice(),
            [ConnectionEvent::PeerConnected(_)]
        ));
        let client_events = client.pool_events();
        assert!(matches!(
            client_events.as_slice(),
            [ConnectionEvent::PeerConnected(_)]
        ));
        (server, client)
    }

    #[test]
    fn handshake_connects_both_sides() {
        let (server, client) = connected_pair();
        assert_eq!(server.connected_peers_count(), 1);
        assert_eq!(client.connected_peers_count(), 1);
        assert!(server.connected_peer(addr(9001)).is_some());
        assert!(client.connected_peer(addr(9000)).is_some());
    }

    #[test]
    fn unacceptable_identifier_is_rejected() {
        let network = ChannelNetwork::new();
        let mut server = ChannelTransport::server(network.clone(), addr(9000));
        let mut client = ChannelTransport::client(network, addr(9001));
        server.acceptable_identifiers().push("client-1".to_owned());
        server.start(9000).unwrap();
        client.start(9001).unwrap();
        client.connect(addr(9000), "intruder").unwrap();
        assert!(server.pool_events().is_empty());
        assert!(client.pool_events().is_empty());
        assert_eq!(client.connected_peers_count(), 0);
    }

    #[test]
    fn payload_and_delivery_survive_the_wire() {
        let (mut server, mut client) = connected_pair();
        client
            .unicast(addr(9000), &[1, 2, 3], DeliveryGuarantee::ReliableUnordered)
            .unwrap();
        let events = server.pool_events();
        match events.as_slice() {
            [ConnectionEvent::MessageReceived { message, .. }] => {
                assert_eq!(message.content.raw_data(), &[1, 2, 3]);
                assert_eq!(message.delivery, DeliveryGuarantee::ReliableUnordered);
            }
            other => panic!("unexpected events: {other:?}"),
        }
    }

    #[test]
    fn oversized_payload_fails_locally() {
        let (mut server, mut client) = connected_pair();
        client.set_max_packet_size(8);
        let result = client.unicast(addr(9000), &[0u8; 16], DeliveryGuarantee::ReliableOrdered);
        assert!(matches!(
            result,
            Err(TransportError::MessageTooLarge { size: 16, limit: 8 })
        ));
        assert!(server.pool_events().is_empty());
    }

    #[test]
    fn conditioner_never_touches_ordered_traffic() {
        let (mut server, mut client) = connected_pair();
        client.set_conditioner(Some(LinkConditionerConfig {
            unreliable_loss_chance: 1.0,
            reorder_chance: 1.0,
            seed: 7,
        }));
        for value in 0u8..32 {
            client
                .unicast(addr(9000), &[value], DeliveryGuarantee::ReliableOrdered)
                .unwrap();
        }
        let received: Vec<u8> = server
            .pool_events()
            .into_iter()
            .filter_map(|event| match event {
                ConnectionEvent::MessageReceived { message, .. } => {
                    Some(message.content.raw_data()[0])
                }
                _ => None,
            })
            .collect();
        assert_eq!(received, (0u8..32).collect::<Vec<u8>>());
    }

    #[test]
    fn conditioner_drops_unreliable_traffic_only() {
        let (mut server, mut client) = connected_pair();
        client.set_conditioner(Some(LinkConditionerConfig {
            unreliable_loss_chance: 1.0,
            reorder_chance: 0.0,
            seed: 7,
        }));
        client
            .unicast(addr(9000), &[1], DeliveryGuarantee::Unreliable)
            .unwrap();
        client
            .unicast(addr(9000), &[2], DeliveryGuarantee::ReliableUnordered)
            .unwrap();
        let received: Vec<u8> = server
            .pool_events()
            .into_iter()
            .filter_map(|event| match event {
                ConnectionEvent::MessageReceived { message, .. } => {
                    Some(message.content.raw_data()[0])
                }
                _ => None,
            })
            .collect();
        assert_eq!(received, vec![2]);
    }

    #[test]
    fn clock_offset_is_measured_as_remote_delta() {
        let network = ChannelNetwork::new();
        let mut server = ChannelTransport::server(network.clone(), addr(9000));
        let mut client = ChannelTransport::client(network, addr(9001));
        client.set_clock_offset(5_000);
        server.acceptable_identifiers().push("client-1".to_owned());
        server.start(9000).unwrap();
        client.start(9001).unwrap();
        client.connect(addr(9000), "client-1").unwrap();
        let events = server.pool_events();
        match events.as_slice() {
            [ConnectionEvent::PeerConnected(peer)] => {
                assert!((peer.remote_time_ticks_difference - 5_000).abs() < 100);
            }
            other => panic!("unexpected events: {other:?}"),
        }
    }
}
