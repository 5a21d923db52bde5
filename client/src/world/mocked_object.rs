use std::cell::RefCell;
use std::rc::Rc;

use log::{error, warn};

use simnet_shared::{
    DistributedMessage, DistributedObjectCommand, MessageReceiver, MessagesManager, NodeId,
    PeerInfo, SceneRef, SharedReceiver, BYTES_PER_COMMAND_TYPE,
};

use crate::world::mocked_component::{MockedComponent, SinkCapability};
use crate::world::MockingError;

/// Mirrored object driven by the authoritative object with the same key.
pub struct MockedObject {
    scene: SceneRef,
    node: NodeId,
    key: String,
    is_initialized: bool,
    components: Vec<(String, Rc<RefCell<MockedComponent>>)>,
}

impl MockedObject {
    pub(crate) fn new(scene: SceneRef, node: NodeId, key: String) -> Self {
        Self {
            scene,
            node,
            key,
            is_initialized: false,
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

    /// Registers this object and its attached components for messaging.
    pub(crate) fn initialize(
        object: &Rc<RefCell<Self>>,
        messages: &mut MessagesManager,
    ) -> Result<(), MockingError> {
        if object.borrow().is_initialized {
            return Ok(());
        }
        let shared: SharedReceiver = object.clone();
        messages.register_object(shared)?;
        object.borrow_mut().is_initialized = true;
        let components: Vec<Rc<RefCell<MockedComponent>>> = object
            .borrow()
            .components
            .iter()
            .map(|(_, component)| component.clone())
            .collect();
        for component in components {
            let shared: SharedReceiver = component.clone();
            messages.register_object(shared)?;
        }
        Ok(())
    }

    /// Unregisters every component and then the object itself, in that
    /// order.
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

    /// Attaches a mocked component at the object's own node.
    pub fn attach_component(
        object: &Rc<RefCell<Self>>,
        sink: SinkCapability,
        messages: &mut MessagesManager,
    ) -> Result<Rc<RefCell<MockedComponent>>, MockingError> {
        let node = object.borrow().node;
        Self::attach_component_at(object, node, sink, messages)
    }

    /// Attaches a mocked component at a node inside the object's
    /// hierarchy; its key mirrors the authoritative component key.
    pub fn attach_component_at(
        object: &Rc<RefCell<Self>>,
        node: NodeId,
        sink: SinkCapability,
        messages: &mut MessagesManager,
    ) -> Result<Rc<RefCell<MockedComponent>>, MockingError> {
        let component = {
            let this = object.borrow();
            let relative_path = this.scene.borrow().relative_path(this.node, node)?;
            let key = format!("{}{}{}", this.key, relative_path, sink.component_key());
            Rc::new(RefCell::new(MockedComponent::new(
                this.scene.clone(),
                node,
                key,
                sink,
            )))
        };
        let key = component.borrow().key().to_owned();
        object
            .borrow_mut()
            .components
            .push((key, component.clone()));
        if object.borrow().is_initialized {
            let shared: SharedReceiver = component.clone();
            messages.register_object(shared)?;
        }
        Ok(component)
    }
}

impl MessageReceiver for MockedObject {
    fn key(&self) -> &str {
        &self.key
    }

    fn receive_message(
        &mut self,
        _sender: &PeerInfo,
        message: &mut DistributedMessage,
        _messages: &mut MessagesManager,
    ) {
        let command = message
            .content
            .pop_int(BYTES_PER_COMMAND_TYPE)
            .map_err(Into::into)
            .and_then(DistributedObjectCommand::from_value);
        let active = match command {
            Ok(DistributedObjectCommand::Enable) => true,
            Ok(DistributedObjectCommand::Disable) => false,
            Err(error) => {
                warn!("Dropping malformed object command: {error}");
                return;
            }
        };
        if let Err(error) = self.scene.borrow_mut().set_active(self.node, active) {
            error!("Could not change activation of '{}': {error}", self.key);
        }
    }
}
