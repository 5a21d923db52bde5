use std::cell::RefCell;
use std::net::SocketAddr;
use std::rc::Rc;

use log::{debug, error, warn};

use simnet_shared::{
    DeliveryGuarantee, DistributedMessage, DistributedObjectCommand, MessageReceiver,
    MessagesManager, NodeId, PeerInfo, SceneRef, SharedReceiver, TimeTicks,
    BYTES_PER_COMMAND_TYPE,
};

use crate::world::distributed_component::{DistributedComponent, SourceCapability};
use crate::world::ReplicationError;

/// Authoritative object synchronized with the mocked objects on the
/// connected clients.
///
/// Owns zero or more distributed components; each component registers for
/// messaging once this object is initialized. With selective distribution
/// enabled the object's traffic reaches only the addressed endpoints.
pub struct DistributedObject {
    scene: SceneRef,
    node: NodeId,
    key: String,
    selective_distribution: bool,
    addressed_end_points: Vec<SocketAddr>,
    is_initialized: bool,
    is_authoritative: bool,
    snapshot_interval: i64,
    components: Vec<(String, Rc<RefCell<DistributedComponent>>)>,
}

impl DistributedObject {
    pub(crate) fn new(
        scene: SceneRef,
        node: NodeId,
        key: String,
        is_authoritative: bool,
        snapshot_interval: i64,
    ) -> Self {
        Self {
            scene,
            node,
            key,
            selective_distribution: false,
            addressed_end_points: Vec::new(),
            is_initialized: false,
            is_authoritative,
            snapshot_interval,
            components: Vec::new(),
        }
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn object_key(&self) -> &str {
        &self.key
    }

    pub fn is_initialized(&self) -> bool {
        self.is_initialized
    }

    pub fn is_authoritative(&self) -> bool {
        self.is_authoritative
    }

    pub fn selective_distribution(&self) -> bool {
        self.selective_distribution
    }

    pub fn set_selective_distribution(&mut self, selective: bool) {
        self.selective_distribution = selective;
    }

    pub fn addressed_end_points(&self) -> &[SocketAddr] {
        &self.addressed_end_points
    }

    pub(crate) fn addressed_end_points_mut(&mut self) -> &mut Vec<SocketAddr> {
        &mut self.addressed_end_points
    }

    /// Registers this object and its already attached components with the
    /// messaging layer, then announces the current activation state.
    pub(crate) fn initialize(
        object: &Rc<RefCell<Self>>,
        messages: &mut MessagesManager,
    ) -> Result<(), ReplicationError> {
        if object.borrow().is_initialized {
            return Ok(());
        }
        let shared: SharedReceiver = object.clone();
        messages.register_object(shared)?;
        object.borrow_mut().is_initialized = true;

        let active = {
            let this = object.borrow();
            this.scene.borrow().is_active(this.node).unwrap_or(true)
        };
        object
            .borrow()
            .broadcast_activation_command(active, messages);

        let components: Vec<Rc<RefCell<DistributedComponent>>> = object
            .borrow()
            .components
            .iter()
            .map(|(_, component)| component.clone())
            .collect();
        for component in components {
            Self::register_component_now(object, &component, messages)?;
        }
        Ok(())
    }

    /// Unregisters every component and then the object itself, in that
    /// order, so no message can route to a dangling receiver.
    pub(crate) fn deinitialize(&mut self, messages: &mut MessagesManager) {
        if !self.is_initialized {
            return;
        }
        for (component_key, _) in self.components.iter().rev() {
            messages.unregister_object(component_key);
        }
        self.components.clear();
        messages.unregister_object(&self.key);
        self.is_initialized = false;
    }

    /// Attaches a new component at the object's own node.
    pub fn attach_component(
        object: &Rc<RefCell<Self>>,
        source: SourceCapability,
        messages: &mut MessagesManager,
    ) -> Result<Rc<RefCell<DistributedComponent>>, ReplicationError> {
        let node = object.borrow().node;
        Self::attach_component_at(object, node, source, messages)
    }

    /// Attaches a new component at a node inside the object's hierarchy.
    /// The component key is the object key concatenated with the node's
    /// relative path and the component type tag.
    pub fn attach_component_at(
        object: &Rc<RefCell<Self>>,
        node: NodeId,
        source: SourceCapability,
        messages: &mut MessagesManager,
    ) -> Result<Rc<RefCell<DistributedComponent>>, ReplicationError> {
        let component = {
            let this = object.borrow();
            let relative_path = this.scene.borrow().relative_path(this.node, node)?;
            let key = format!("{}{}{}", this.key, relative_path, source.component_key());
            Rc::new(RefCell::new(DistributedComponent::new(
                this.scene.clone(),
                node,
                key,
                Rc::downgrade(object),
                source,
                this.snapshot_interval,
            )))
        };
        let key = component.borrow().key().to_owned();
        object
            .borrow_mut()
            .components
            .push((key, component.clone()));
        if object.borrow().is_initialized {
            Self::register_component_now(object, &component, messages)?;
        }
        Ok(component)
    }

    /// Registers the component for messaging and immediately broadcasts a
    /// reliable full snapshot, so already connected mirrors receive a
    /// correct first state without waiting for the next update tick.
    fn register_component_now(
        object: &Rc<RefCell<Self>>,
        component: &Rc<RefCell<DistributedComponent>>,
        messages: &mut MessagesManager,
    ) -> Result<(), ReplicationError> {
        let shared: SharedReceiver = component.clone();
        messages.register_object(shared)?;
        let scene = object.borrow().scene.clone();
        let snapshot = component
            .borrow_mut()
            .build_snapshot_message(true, true, &scene.borrow(), messages.pool());
        match snapshot {
            Ok(message) => object.borrow().broadcast_message(message, messages),
            Err(error) => error!("Could not broadcast the first snapshot: {error}"),
        }
        Ok(())
    }

    pub fn unregister_component(&mut self, component_key: &str, messages: &mut MessagesManager) {
        let Some(position) = self
            .components
            .iter()
            .position(|(key, _)| key == component_key)
        else {
            return;
        };
        messages.unregister_object(component_key);
        self.components.remove(position);
    }

    /// Toggles the node activation and replicates the change.
    pub fn set_active(&mut self, active: bool, messages: &mut MessagesManager) {
        if let Err(error) = self.scene.borrow_mut().set_active(self.node, active) {
            error!("Could not change activation of '{}': {error}", self.key);
            return;
        }
        if !self.is_initialized {
            return;
        }
        self.broadcast_activation_command(active, messages);
    }

    fn broadcast_activation_command(&self, active: bool, messages: &mut MessagesManager) {
        let command = if active {
            DistributedObjectCommand::Enable
        } else {
            DistributedObjectCommand::Disable
        };
        let mut message = messages.pool().get_message(
            BYTES_PER_COMMAND_TYPE,
            self.key.clone(),
            DeliveryGuarantee::ReliableUnordered,
        );
        message
            .content
            .push_int(command as i32, BYTES_PER_COMMAND_TYPE);
        self.broadcast_message(message, messages);
    }

    /// Adds an endpoint to the selective distribution and replays the
    /// components' current state to it.
    pub fn add_end_point_to_selective_distribution(
        object: &Rc<RefCell<Self>>,
        endpoint: SocketAddr,
        messages: &mut MessagesManager,
    ) -> Result<(), ReplicationError> {
        if !object.borrow().selective_distribution {
            return Err(ReplicationError::SelectiveDistributionDisabled);
        }
        if object.borrow().addressed_end_points.contains(&endpoint) {
            return Ok(());
        }
        object.borrow_mut().addressed_end_points.push(endpoint);
        if !object.borrow().is_initialized {
            return Ok(());
        }
        let components: Vec<Rc<RefCell<DistributedComponent>>> = object
            .borrow()
            .components
            .iter()
            .map(|(_, component)| component.clone())
            .collect();
        for component in components {
            component
                .borrow_mut()
                .unicast_initial_messages(endpoint, messages);
        }
        Ok(())
    }

    pub fn remove_end_point_from_selective_distribution(
        &mut self,
        endpoint: SocketAddr,
    ) -> Result<(), ReplicationError> {
        if !self.selective_distribution {
            return Err(ReplicationError::SelectiveDistributionDisabled);
        }
        self.addressed_end_points.retain(|added| *added != endpoint);
        Ok(())
    }

    /// Sends to a single endpoint, respecting the selective distribution.
    pub fn unicast_message(
        &self,
        endpoint: SocketAddr,
        message: DistributedMessage,
        messages: &mut MessagesManager,
    ) {
        if !self.is_authoritative
            || (self.selective_distribution && !self.addressed_end_points.contains(&endpoint))
        {
            let pool = messages.pool();
            pool.release(message);
            return;
        }
        if let Err(error) = messages.unicast_message(endpoint, message) {
            error!("Could not unicast message of '{}': {error}", self.key);
        }
    }

    /// Broadcasts to every mirror, or to the addressed endpoints only when
    /// the object uses selective distribution.
    pub fn broadcast_message(&self, message: DistributedMessage, messages: &mut MessagesManager) {
        if !self.is_authoritative {
            messages.pool().release(message);
            return;
        }
        if self.selective_distribution {
            for endpoint in &self.addressed_end_points {
                if let Err(error) = messages.unicast_message(*endpoint, message.clone()) {
                    error!("Could not unicast message of '{}': {error}", self.key);
                }
            }
            messages.pool().release(message);
            return;
        }
        if let Err(error) = messages.broadcast_message(message) {
            error!("Could not broadcast message of '{}': {error}", self.key);
        }
    }

    /// Drives the cadenced component state broadcast.
    pub(crate) fn tick(&mut self, now: TimeTicks, messages: &mut MessagesManager) {
        if !self.is_initialized || !self.is_authoritative {
            return;
        }
        let components: Vec<Rc<RefCell<DistributedComponent>>> = self
            .components
            .iter()
            .map(|(_, component)| component.clone())
            .collect();
        let scene = self.scene.clone();
        for component in components {
            let state = component
                .borrow_mut()
                .poll_state(now, &scene.borrow(), messages.pool());
            if let Some(message) = state {
                self.broadcast_message(message, messages);
            }
        }
    }
}

impl MessageReceiver for DistributedObject {
    fn key(&self) -> &str {
        &self.key
    }

    fn receive_message(
        &mut self,
        _sender: &PeerInfo,
        message: &mut DistributedMessage,
        messages: &mut MessagesManager,
    ) {
        if self.is_authoritative {
            debug!("Ignoring inbound command for authoritative object '{}'.", self.key);
            return;
        }
        let command = message
            .content
            .pop_int(BYTES_PER_COMMAND_TYPE)
            .map_err(Into::into)
            .and_then(DistributedObjectCommand::from_value);
        match command {
            Ok(DistributedObjectCommand::Enable) => self.set_active(true, messages),
            Ok(DistributedObjectCommand::Disable) => self.set_active(false, messages),
            Err(error) => warn!("Dropping malformed object command: {error}"),
        }
    }
}
