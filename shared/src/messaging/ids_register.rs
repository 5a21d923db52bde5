use std::collections::HashMap;

use log::error;

use crate::messaging::bytes_stack::{BytesStack, BytesStackError};
use crate::messaging::error::MessagingError;
use crate::messaging::id_manager::IdManager;
use crate::messaging::message::{DeliveryGuarantee, DistributedMessage, MessagesPool};
use crate::messaging::time_manager::TimeManager;
use crate::types::{now_ticks, Identifier, TimeTicks, BYTES_PER_ID, BYTES_PER_TIMESTAMP};

/// Address key of the register itself.
pub const IDS_REGISTER_KEY: &str = "IdsRegister";

/// Bytes required for the register command tag.
const BYTES_PER_COMMAND_TYPE: usize = 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum IdsRegisterCommandType {
    BindIdAndKey = 0,
    UnbindIdAndKey = 1,
}

impl IdsRegisterCommandType {
    fn from_value(value: i32) -> Result<Self, MessagingError> {
        match value {
            0 => Ok(Self::BindIdAndKey),
            1 => Ok(Self::UnbindIdAndKey),
            value => Err(MessagingError::UnknownCommandType { value }),
        }
    }
}

/// Notification that a key got bound to an identifier.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BindEvent {
    pub key: String,
    pub id: Identifier,
    pub registration_timestamp: TimeTicks,
}

/// Result of registering a key with the register.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RegisterOutcome {
    /// Duplicate registration of an already bound key is a no-op.
    AlreadyBound,
    /// The authority allocated and bound a fresh identifier.
    BoundByAuthority(BindEvent),
    /// A bind pushed by the authority was already waiting for this key.
    BoundFromAwaiting(BindEvent),
    /// No binding for this key arrived yet; the key waits unbound.
    Parked,
}

/// Result of unregistering a key from the register.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UnregisterOutcome {
    /// The key was only in the unbound list, or not known at all.
    RemovedUnbound,
    /// The key was bound; its identifier was released.
    Unbound { id: Identifier },
}

/// Associates address keys with unique compact identifiers and synchronizes
/// the bindings across peers.
///
/// Exactly one register per cluster session assigns identifiers (the master
/// side); every other register only learns bindings pushed to it and
/// tolerates binds arriving before or after the matching key registers.
pub struct IdsRegister {
    /// Should this register assign ids, fixed at construction.
    assign_ids: bool,
    id_manager: IdManager,
    id_to_key: HashMap<Identifier, String>,
    key_to_id: HashMap<String, Identifier>,
    id_registration_timestamp: HashMap<Identifier, TimeTicks>,
    /// Registered keys that wait for a key-id binding.
    unbound_keys: Vec<String>,
    /// Key-id bindings that wait for the matching key to register.
    awaiting_key_id_binds: HashMap<String, Identifier>,
    internal_id_bound: bool,
    internal_id_bind_time: TimeTicks,
}

impl IdsRegister {
    pub fn new(assign_ids: bool) -> Self {
        Self {
            assign_ids,
            id_manager: IdManager::new(),
            id_to_key: HashMap::new(),
            key_to_id: HashMap::new(),
            id_registration_timestamp: HashMap::new(),
            unbound_keys: Vec::new(),
            awaiting_key_id_binds: HashMap::new(),
            internal_id_bound: false,
            internal_id_bind_time: 0,
        }
    }

    pub fn assign_ids(&self) -> bool {
        self.assign_ids
    }

    /// Timestamp of binding the register's own identifier.
    pub fn internal_id_bind_time(&self) -> TimeTicks {
        self.internal_id_bind_time
    }

    pub fn is_key_bound(&self, key: &str) -> bool {
        self.key_to_id.contains_key(key)
    }

    pub fn resolve_id(&self, key: &str) -> Option<Identifier> {
        self.key_to_id.get(key).copied()
    }

    pub fn resolve_key(&self, id: Identifier) -> Option<&str> {
        self.id_to_key.get(&id).map(String::as_str)
    }

    pub fn registration_timestamp(&self, id: Identifier) -> Option<TimeTicks> {
        self.id_registration_timestamp.get(&id).copied()
    }

    /// Binds the register's own identifier if this instance assigns ids.
    pub fn self_register(&mut self) -> Option<Identifier> {
        if !self.assign_ids {
            return None;
        }
        let id = self.id_manager.get_id();
        self.id_to_key.insert(id, IDS_REGISTER_KEY.to_owned());
        self.key_to_id.insert(IDS_REGISTER_KEY.to_owned(), id);
        self.internal_id_bound = true;
        self.internal_id_bind_time = now_ticks();
        self.id_registration_timestamp
            .insert(id, self.internal_id_bind_time);
        Some(id)
    }

    /// Registers a key. On the authority this allocates the next free
    /// identifier; elsewhere the key waits for a binding pushed by the
    /// authority, unless one already arrived.
    pub fn register_key(&mut self, key: &str) -> RegisterOutcome {
        if self.key_to_id.contains_key(key) {
            return RegisterOutcome::AlreadyBound;
        }

        if self.assign_ids {
            let id = self.id_manager.get_id();
            let registration_timestamp = now_ticks();
            self.id_to_key.insert(id, key.to_owned());
            self.key_to_id.insert(key.to_owned(), id);
            self.id_registration_timestamp
                .insert(id, registration_timestamp);
            return RegisterOutcome::BoundByAuthority(BindEvent {
                key: key.to_owned(),
                id,
                registration_timestamp,
            });
        }

        if !self.unbound_keys.iter().any(|unbound| unbound == key) {
            self.unbound_keys.push(key.to_owned());
        }
        match self.awaiting_key_id_binds.remove(key) {
            Some(id) => match self.try_bind_receiver(key.to_owned(), id) {
                Some(event) => RegisterOutcome::BoundFromAwaiting(event),
                None => RegisterOutcome::Parked,
            },
            None => RegisterOutcome::Parked,
        }
    }

    /// Unregisters a key, releasing its identifier when bound. An object
    /// never bound is silently removed from the unbound list only.
    pub fn unregister_key(&mut self, key: &str) -> UnregisterOutcome {
        let Some(id) = self.key_to_id.remove(key) else {
            self.unbound_keys.retain(|unbound| unbound != key);
            return UnregisterOutcome::RemovedUnbound;
        };
        self.id_registration_timestamp.remove(&id);
        self.id_to_key.remove(&id);
        self.id_manager.return_id(id);
        UnregisterOutcome::Unbound { id }
    }

    /// Demotes every bound key back to unbound so a future reconnect can
    /// re-bind by key without recreating the objects. Only meaningful on
    /// the side that does not assign ids.
    pub fn revoke_ids(&mut self) {
        if self.assign_ids {
            return;
        }
        for key in self.key_to_id.keys() {
            if key == IDS_REGISTER_KEY {
                continue;
            }
            if !self.unbound_keys.iter().any(|unbound| unbound == key) {
                self.unbound_keys.push(key.clone());
            }
        }
        self.id_to_key.clear();
        self.key_to_id.clear();
        self.awaiting_key_id_binds.clear();
        self.id_registration_timestamp.clear();
        self.internal_id_bound = false;
        self.internal_id_bind_time = 0;
    }

    /// Binds an unbound key with the pushed key-id pair, or remembers the
    /// binding until a matching key registers.
    fn try_bind_receiver(&mut self, key: String, id: Identifier) -> Option<BindEvent> {
        if let Some(position) = self.unbound_keys.iter().position(|unbound| *unbound == key) {
            self.unbound_keys.remove(position);
            self.id_to_key.insert(id, key.clone());
            self.key_to_id.insert(key.clone(), id);
            return Some(BindEvent {
                key,
                id,
                registration_timestamp: self.registration_timestamp(id).unwrap_or(0),
            });
        }
        self.awaiting_key_id_binds.insert(key, id);
        None
    }

    /// Handles an inbound `BindIdAndKey`/`UnbindIdAndKey` command. Only
    /// meaningful on the non-authority side; returns the bindings it caused.
    pub fn receive_message(
        &mut self,
        message: &mut DistributedMessage,
    ) -> Result<Vec<BindEvent>, MessagingError> {
        let command = IdsRegisterCommandType::from_value(
            message.content.pop_int(BYTES_PER_COMMAND_TYPE)?,
        )?;
        let key = message.content.pop_string()?;
        let id = message.content.pop_int(BYTES_PER_ID)?;

        if self.assign_ids {
            if key == IDS_REGISTER_KEY {
                // single fixed authority per session; a second claim is
                // rejected instead of silently replacing the register
                error!(
                    "Received an authority register claim from another peer; a session has exactly one id-assigning register."
                );
            }
            return Ok(Vec::new());
        }

        let mut events = Vec::new();
        match command {
            IdsRegisterCommandType::BindIdAndKey => {
                let bound_to_same_key = self
                    .id_to_key
                    .get(&id)
                    .is_some_and(|bound_key| *bound_key == key);
                let awaiting_same_bind =
                    self.awaiting_key_id_binds.get(&key).copied() == Some(id);
                if bound_to_same_key || awaiting_same_bind {
                    return Ok(events);
                }

                // a new bind for this id received before the unbind of the
                // previous key
                if let Some(old_key) = self.id_to_key.get(&id).cloned() {
                    self.key_to_id.remove(&old_key);
                    self.id_to_key.remove(&id);
                    self.id_registration_timestamp.remove(&id);
                }

                self.id_registration_timestamp
                    .insert(id, message.server_timestamp);
                if let Some(event) = self.try_bind_receiver(key, id) {
                    events.push(event);
                }
            }
            IdsRegisterCommandType::UnbindIdAndKey => {
                // prefer dropping a still waiting binding over unregistering
                if self.awaiting_key_id_binds.get(&key).copied() == Some(id) {
                    self.awaiting_key_id_binds.remove(&key);
                    self.id_registration_timestamp.remove(&id);
                    return Ok(events);
                }
                let Some(bound_key) = self.id_to_key.get(&id) else {
                    return Ok(events);
                };
                if *bound_key != key {
                    return Ok(events);
                }
                self.key_to_id.remove(&key);
                self.id_to_key.remove(&id);
                self.id_registration_timestamp.remove(&id);
            }
        }
        Ok(events)
    }

    /// Checks whether the unresolved message carries the register's own
    /// binding, and accepts it when it does. The first message a peer can
    /// decode after connecting.
    pub fn try_accept_initialization_message(
        &mut self,
        message: &DistributedMessage,
        time_manager: &TimeManager,
    ) -> Option<BindEvent> {
        if self.internal_id_bound {
            return None;
        }
        let command = message.content.peek_int(BYTES_PER_COMMAND_TYPE, 0).ok()?;
        if IdsRegisterCommandType::from_value(command).ok()?
            != IdsRegisterCommandType::BindIdAndKey
        {
            return None;
        }
        let mut offset = BYTES_PER_COMMAND_TYPE;
        let key = message.content.peek_string(offset).ok()?;
        if key != IDS_REGISTER_KEY {
            return None;
        }
        offset += 4 + key.len();
        let id = message.content.peek_int(BYTES_PER_ID, offset).ok()?;
        offset += BYTES_PER_ID;
        let time_difference = message
            .content
            .peek_long(BYTES_PER_TIMESTAMP, offset)
            .ok()?;

        self.internal_id_bound = true;
        self.internal_id_bind_time = time_manager.get_timestamp(time_difference);
        self.id_registration_timestamp
            .insert(id, self.internal_id_bind_time);
        self.id_to_key.insert(id, IDS_REGISTER_KEY.to_owned());
        self.key_to_id.insert(IDS_REGISTER_KEY.to_owned(), id);
        Some(BindEvent {
            key: IDS_REGISTER_KEY.to_owned(),
            id,
            registration_timestamp: self.internal_id_bind_time,
        })
    }

    /// Pushes the identifier bound to the message's address key on top of
    /// its content. Fails when the key is not bound yet: the caller
    /// registered too early.
    pub fn push_id(&self, message: &mut DistributedMessage) -> Result<(), MessagingError> {
        if message.address_key.is_empty() {
            return Err(MessagingError::EmptyAddressKey);
        }
        let id = self
            .resolve_id(&message.address_key)
            .ok_or_else(|| MessagingError::UnresolvedKey {
                key: message.address_key.clone(),
            })?;
        message.content.push_int(id, BYTES_PER_ID);
        Ok(())
    }

    /// Pops the identifier from the top of a received message content.
    pub fn pop_id(&self, content: &mut BytesStack) -> Result<Identifier, BytesStackError> {
        content.pop_int(BYTES_PER_ID)
    }

    /// Builds the bind command for one key-id pair.
    fn bind_command_message(
        &self,
        pool: &mut MessagesPool,
        command: IdsRegisterCommandType,
        key: &str,
        id: Identifier,
    ) -> DistributedMessage {
        let mut message = pool.get_message(
            BYTES_PER_ID + key.len() + 4 + BYTES_PER_COMMAND_TYPE,
            IDS_REGISTER_KEY,
            DeliveryGuarantee::ReliableOrdered,
        );
        message.content.push_int(id, BYTES_PER_ID);
        message.content.push_string(key);
        message.content.push_int(command as i32, BYTES_PER_COMMAND_TYPE);
        message
    }

    pub fn bind_message(
        &self,
        pool: &mut MessagesPool,
        key: &str,
        id: Identifier,
    ) -> DistributedMessage {
        self.bind_command_message(pool, IdsRegisterCommandType::BindIdAndKey, key, id)
    }

    pub fn unbind_message(
        &self,
        pool: &mut MessagesPool,
        key: &str,
        id: Identifier,
    ) -> DistributedMessage {
        self.bind_command_message(pool, IdsRegisterCommandType::UnbindIdAndKey, key, id)
    }

    /// Builds the initialization message carrying the register's own
    /// binding together with its bind timestamp.
    fn initialization_message(
        &self,
        pool: &mut MessagesPool,
        time_manager: &TimeManager,
    ) -> Result<DistributedMessage, MessagingError> {
        let id = self
            .resolve_id(IDS_REGISTER_KEY)
            .ok_or(MessagingError::UnresolvedKey {
                key: IDS_REGISTER_KEY.to_owned(),
            })?;
        let mut message = pool.get_message(
            BYTES_PER_TIMESTAMP + BYTES_PER_ID + IDS_REGISTER_KEY.len() + 4 + BYTES_PER_COMMAND_TYPE,
            IDS_REGISTER_KEY,
            DeliveryGuarantee::ReliableOrdered,
        );
        message.content.push_long(
            time_manager.get_time_difference(self.internal_id_bind_time),
            BYTES_PER_TIMESTAMP,
        );
        message.content.push_int(id, BYTES_PER_ID);
        message.content.push_string(IDS_REGISTER_KEY);
        message.content.push_int(
            IdsRegisterCommandType::BindIdAndKey as i32,
            BYTES_PER_COMMAND_TYPE,
        );
        Ok(message)
    }

    /// Replays every currently bound id as a bind command, plus the
    /// register's own initialization bind, so a newly joined peer reaches
    /// eventual consistency without history. Authority only.
    pub fn initial_messages(
        &self,
        pool: &mut MessagesPool,
        time_manager: &TimeManager,
    ) -> Vec<DistributedMessage> {
        if !self.assign_ids {
            return Vec::new();
        }
        let mut bindings: Vec<(Identifier, &String)> = self
            .id_to_key
            .iter()
            .map(|(id, key)| (*id, key))
            .collect();
        bindings.sort_by_key(|(id, _)| *id);

        let mut messages = Vec::with_capacity(bindings.len());
        for (id, key) in bindings {
            if key == IDS_REGISTER_KEY {
                match self.initialization_message(pool, time_manager) {
                    Ok(message) => messages.push(message),
                    Err(error) => error!("Could not build register initialization message: {error}"),
                }
            } else {
                messages.push(self.bind_message(pool, key, id));
            }
        }
        messages
    }
}
