use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use log::{error, warn};

use crate::messaging::error::MessagingError;
use crate::messaging::ids_register::{BindEvent, IdsRegister, RegisterOutcome, UnregisterOutcome, IDS_REGISTER_KEY};
use crate::messaging::message::{DistributedMessage, MessagesPool};
use crate::messaging::receiver::SharedReceiver;
use crate::messaging::time_manager::TimeManager;
use crate::transport::{ConnectionEvent, ConnectionManager, PeerInfo};
use crate::types::{HostType, Identifier};

/// Where an outgoing message is addressed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageAddressing {
    Unicast(SocketAddr),
    Broadcast,
}

/// Peer lifecycle notifications surfaced to the cluster lifecycle layer
/// after the manager handled its own side of them.
#[derive(Debug)]
pub enum PeerEvent {
    Connected(PeerInfo),
    Disconnected(PeerInfo),
}

struct AwaitingIncoming {
    sender: PeerInfo,
    message: DistributedMessage,
    received_at: Instant,
}

/// Routes incoming and outgoing messages between the transport and the
/// registered receivers.
///
/// Outbound messages resolve their address key to the compact identifier
/// before they reach the transport; messages whose key is not bound yet are
/// parked until the binding arrives, in both directions. All dispatch
/// happens inside [`MessagesManager::pool_events`], once per tick.
pub struct MessagesManager {
    ids_register: IdsRegister,
    time_manager: TimeManager,
    pool: MessagesPool,
    receivers: HashMap<String, SharedReceiver>,
    /// Registration-ordered endpoints, replayed to newly connected peers.
    senders: Vec<(String, SharedReceiver)>,
    /// Messages received before their receiver registered, by identifier.
    awaiting_incoming: HashMap<Identifier, Vec<AwaitingIncoming>>,
    /// Messages sent before their sender key got bound.
    awaiting_outgoing: HashMap<String, Vec<(MessageAddressing, DistributedMessage)>>,
    outgoing: Vec<(MessageAddressing, DistributedMessage)>,
    incoming_timeout: Duration,
}

impl MessagesManager {
    pub fn new(host_type: HostType) -> Self {
        let mut manager = Self {
            ids_register: IdsRegister::new(host_type.assigns_ids()),
            time_manager: TimeManager::new(),
            pool: MessagesPool::new(),
            receivers: HashMap::new(),
            senders: Vec::new(),
            awaiting_incoming: HashMap::new(),
            awaiting_outgoing: HashMap::new(),
            outgoing: Vec::new(),
            incoming_timeout: Duration::from_secs(30),
        };
        if let Some(id) = manager.ids_register.self_register() {
            let message = manager
                .ids_register
                .bind_message(&mut manager.pool, IDS_REGISTER_KEY, id);
            if let Err(error) = manager.route_outgoing(MessageAddressing::Broadcast, message) {
                error!("Could not broadcast the register self bind: {error}");
            }
        }
        manager
    }

    pub fn assigns_ids(&self) -> bool {
        self.ids_register.assign_ids()
    }

    pub fn time_manager(&self) -> &TimeManager {
        &self.time_manager
    }

    /// Content buffer pool shared by every sender on this node.
    pub fn pool(&mut self) -> &mut MessagesPool {
        &mut self.pool
    }

    pub fn is_key_bound(&self, key: &str) -> bool {
        self.ids_register.is_key_bound(key)
    }

    pub fn resolve_id(&self, key: &str) -> Option<Identifier> {
        self.ids_register.resolve_id(key)
    }

    /// Registers an endpoint under its address key. The key must be stable:
    /// the caller ensures the whole parent chain is resolved first.
    /// Registering an already registered key is a no-op.
    pub fn register_object(&mut self, object: SharedReceiver) -> Result<(), MessagingError> {
        let key = object.borrow().key().to_owned();
        if key.is_empty() {
            return Err(MessagingError::EmptyAddressKey);
        }
        if self.receivers.contains_key(&key) {
            return Ok(());
        }
        self.receivers.insert(key.clone(), object.clone());
        self.senders.push((key.clone(), object));
        match self.ids_register.register_key(&key) {
            RegisterOutcome::BoundByAuthority(event) => {
                let message = self
                    .ids_register
                    .bind_message(&mut self.pool, &event.key, event.id);
                self.route_outgoing(MessageAddressing::Broadcast, message)?;
                self.object_bound_to_id(event);
            }
            RegisterOutcome::BoundFromAwaiting(event) => self.object_bound_to_id(event),
            RegisterOutcome::AlreadyBound | RegisterOutcome::Parked => {}
        }
        Ok(())
    }

    /// Removes the endpoint from the routing table. Messages addressed to
    /// its former key are ignored from now on instead of reaching a
    /// dangling receiver.
    pub fn unregister_object(&mut self, key: &str) {
        self.receivers.remove(key);
        self.senders.retain(|(sender_key, _)| sender_key != key);
        if let UnregisterOutcome::Unbound { id } = self.ids_register.unregister_key(key) {
            if self.ids_register.assign_ids() {
                let message = self.ids_register.unbind_message(&mut self.pool, key, id);
                if let Err(error) = self.route_outgoing(MessageAddressing::Broadcast, message) {
                    error!("Could not broadcast unbind of key '{key}': {error}");
                }
            }
        }
    }

    /// Resets parked traffic and revokes the identifiers bound by the
    /// authority. Called by a client when its connection drops so a future
    /// reconnect can re-bind the same objects by key.
    pub fn revoke_identifiers(&mut self) {
        if self.ids_register.assign_ids() {
            return;
        }
        for (_, queue) in std::mem::take(&mut self.awaiting_incoming) {
            for awaiting in queue {
                self.pool.release(awaiting.message);
            }
        }
        for (_, queue) in std::mem::take(&mut self.awaiting_outgoing) {
            for (_, message) in queue {
                self.pool.release(message);
            }
        }
        self.ids_register.revoke_ids();
    }

    /// Queues a message to a single peer. Unbound keys park the message
    /// until the binding arrives.
    pub fn unicast_message(
        &mut self,
        endpoint: SocketAddr,
        message: DistributedMessage,
    ) -> Result<(), MessagingError> {
        self.route_outgoing(MessageAddressing::Unicast(endpoint), message)
    }

    /// Queues a message to all connected peers. Unbound keys park the
    /// message until the binding arrives.
    pub fn broadcast_message(&mut self, message: DistributedMessage) -> Result<(), MessagingError> {
        self.route_outgoing(MessageAddressing::Broadcast, message)
    }

    fn route_outgoing(
        &mut self,
        addressing: MessageAddressing,
        mut message: DistributedMessage,
    ) -> Result<(), MessagingError> {
        if message.address_key.is_empty() {
            return Err(MessagingError::EmptyAddressKey);
        }
        if self.ids_register.resolve_id(&message.address_key).is_some() {
            self.ids_register.push_id(&mut message)?;
            self.time_manager.push_time_difference(&mut message);
            self.outgoing.push((addressing, message));
            return Ok(());
        }
        self.awaiting_outgoing
            .entry(message.address_key.clone())
            .or_default()
            .push((addressing, message));
        Ok(())
    }

    /// Pumps the transport events, dispatches received messages to their
    /// bound receivers and flushes the outgoing queue. Must be invoked once
    /// per simulation tick on the main thread.
    pub fn pool_events(&mut self, connection: &mut dyn ConnectionManager) -> Vec<PeerEvent> {
        self.incoming_timeout = connection.timeout();
        let mut peer_events = Vec::new();
        for event in connection.pool_events() {
            match event {
                ConnectionEvent::PeerConnected(info) => {
                    self.unicast_initial_messages(info.endpoint);
                    peer_events.push(PeerEvent::Connected(info));
                }
                ConnectionEvent::PeerDisconnected(info) => {
                    peer_events.push(PeerEvent::Disconnected(info));
                }
                ConnectionEvent::MessageReceived { sender, message } => {
                    self.message_received(sender, message);
                }
            }
        }
        self.prune_awaiting_incoming();
        self.flush_outgoing(connection);
        peer_events
    }

    /// Pushes the queued outgoing traffic to the transport immediately
    /// instead of waiting for the next tick.
    pub fn flush(&mut self, connection: &mut dyn ConnectionManager) {
        self.flush_outgoing(connection);
    }

    fn message_received(&mut self, sender: PeerInfo, mut message: DistributedMessage) {
        if let Err(error) = self
            .time_manager
            .pop_time_difference(&mut message, sender.remote_time_ticks_difference)
        {
            warn!("Dropping message without a valid timestamp: {error}");
            self.pool.release(message);
            return;
        }
        let id = match self.ids_register.pop_id(&mut message.content) {
            Ok(id) => id,
            Err(error) => {
                warn!("Dropping message without a valid identifier: {error}");
                self.pool.release(message);
                return;
            }
        };

        if let Some(key) = self.ids_register.resolve_key(id).map(str::to_owned) {
            message.address_key = key.clone();
            if key == IDS_REGISTER_KEY {
                self.receive_register_command(&mut message);
                self.pool.release(message);
                return;
            }
            if let Some(receiver) = self.receivers.get(&key).cloned() {
                receiver
                    .borrow_mut()
                    .receive_message(&sender, &mut message, self);
            }
            self.pool.release(message);
            return;
        }

        // first decodable message after connecting binds the register itself
        if let Some(event) = self
            .ids_register
            .try_accept_initialization_message(&message, &self.time_manager)
        {
            self.pool.release(message);
            self.object_bound_to_id(event);
            return;
        }

        // ignore messages with outdated assigned identifiers
        if message.timestamp < self.ids_register.internal_id_bind_time() {
            self.pool.release(message);
            return;
        }

        // hold the message until the proper receiver registers
        self.awaiting_incoming
            .entry(id)
            .or_default()
            .push(AwaitingIncoming {
                sender,
                message,
                received_at: Instant::now(),
            });
    }

    fn receive_register_command(&mut self, message: &mut DistributedMessage) {
        match self.ids_register.receive_message(message) {
            Ok(events) => {
                for event in events {
                    self.object_bound_to_id(event);
                }
            }
            Err(error) => warn!("Dropping malformed register command: {error}"),
        }
    }

    /// Flushes traffic parked for a key that just got bound, in both
    /// directions.
    fn object_bound_to_id(&mut self, event: BindEvent) {
        if let Some(waiting) = self.awaiting_incoming.remove(&event.id) {
            let receiver = self.receivers.get(&event.key).cloned();
            for awaiting in waiting {
                // ignore messages sent under an outdated assignment of the id
                if awaiting.message.server_timestamp < event.registration_timestamp {
                    self.pool.release(awaiting.message);
                    continue;
                }
                let mut message = awaiting.message;
                message.address_key = event.key.clone();
                if event.key == IDS_REGISTER_KEY {
                    self.receive_register_command(&mut message);
                } else if let Some(receiver) = &receiver {
                    receiver
                        .borrow_mut()
                        .receive_message(&awaiting.sender, &mut message, self);
                }
                self.pool.release(message);
            }
        }
        if let Some(parked) = self.awaiting_outgoing.remove(&event.key) {
            for (addressing, message) in parked {
                if let Err(error) = self.route_outgoing(addressing, message) {
                    error!(
                        "Could not send message parked for key '{}': {error}",
                        event.key
                    );
                }
            }
        }
    }

    /// Replays the identifier bindings and every sender's initial state to
    /// a peer that just connected, in registration order.
    fn unicast_initial_messages(&mut self, endpoint: SocketAddr) {
        let initial = self
            .ids_register
            .initial_messages(&mut self.pool, &self.time_manager);
        for message in initial {
            if let Err(error) =
                self.route_outgoing(MessageAddressing::Unicast(endpoint), message)
            {
                error!("Could not replay identifier binding: {error}");
            }
        }
        let senders: Vec<SharedReceiver> =
            self.senders.iter().map(|(_, sender)| sender.clone()).collect();
        for sender in senders {
            sender.borrow_mut().unicast_initial_messages(endpoint, self);
        }
    }

    fn prune_awaiting_incoming(&mut self) {
        let timeout = self.incoming_timeout;
        let mut expired = Vec::new();
        for queue in self.awaiting_incoming.values_mut() {
            let mut index = 0;
            while index < queue.len() {
                if queue[index].received_at.elapsed() > timeout {
                    expired.push(queue.remove(index));
                } else {
                    index += 1;
                }
            }
        }
        self.awaiting_incoming.retain(|_, queue| !queue.is_empty());
        for awaiting in expired {
            self.pool.release(awaiting.message);
        }
    }

    fn flush_outgoing(&mut self, connection: &mut dyn ConnectionManager) {
        for (addressing, message) in std::mem::take(&mut self.outgoing) {
            let result = match addressing {
                MessageAddressing::Unicast(endpoint) => {
                    connection.unicast(endpoint, message.content.raw_data(), message.delivery)
                }
                MessageAddressing::Broadcast => {
                    connection.broadcast(message.content.raw_data(), message.delivery)
                }
            };
            if let Err(error) = result {
                error!(
                    "Failed to send message addressed to '{}': {error}",
                    message.address_key
                );
            }
            self.pool.release(message);
        }
    }
}
