use std::cell::RefCell;
use std::rc::Rc;

use log::{error, warn};

use simnet_shared::{
    BytesStackError, DistributedMessage, DistributedRootCommand, MessageReceiver,
    MessagesManager, NetworkSettings, NodeId, PeerInfo, SceneRef, SharedReceiver,
    BYTES_PER_COMMAND_TYPE, DISTRIBUTED_OBJECTS_ROOT_KEY,
};

use crate::world::mocked_component::SinkCapability;
use crate::world::mocked_object::MockedObject;
use crate::world::MockingError;

/// Factory producing the mocking capability of one prefab component.
pub type SinkFactory = Box<dyn Fn() -> SinkCapability>;

/// Template of a dynamically instantiated mocked object. The prefab ids
/// must match the authoritative registration order.
pub struct MockPrefab {
    pub name: String,
    pub components: Vec<SinkFactory>,
}

struct InstantiatedObjectData {
    prefab_id: i32,
    object: Rc<RefCell<MockedObject>>,
}

/// The root of the mirrored object graph, bound to the authority's
/// distributed objects root by a shared key.
pub struct MockedObjectsRoot {
    scene: SceneRef,
    root_node: NodeId,
    #[allow(dead_code)]
    settings: NetworkSettings,
    is_initialized: bool,
    registered_objects: Vec<(String, Rc<RefCell<MockedObject>>)>,
    instantiated_objects: Vec<InstantiatedObjectData>,
    prefabs: Vec<MockPrefab>,
}

impl MockedObjectsRoot {
    pub fn new_shared(
        scene: SceneRef,
        root_node: NodeId,
        settings: NetworkSettings,
    ) -> Rc<RefCell<Self>> {
        Rc::new(RefCell::new(Self {
            scene,
            root_node,
            settings,
            is_initialized: false,
            registered_objects: Vec::new(),
            instantiated_objects: Vec::new(),
            prefabs: Vec::new(),
        }))
    }

    pub fn is_initialized(&self) -> bool {
        self.is_initialized
    }

    pub fn scene(&self) -> SceneRef {
        self.scene.clone()
    }

    pub fn root_node(&self) -> NodeId {
        self.root_node
    }

    pub fn register_prefab(&mut self, prefab: MockPrefab) -> i32 {
        self.prefabs.push(prefab);
        (self.prefabs.len() - 1) as i32
    }

    /// Registers the root endpoint binding this mirror to the authority's
    /// objects root.
    pub fn initialize(
        root: &Rc<RefCell<Self>>,
        messages: &mut MessagesManager,
    ) -> Result<(), MockingError> {
        if root.borrow().is_initialized {
            return Ok(());
        }
        let endpoint: SharedReceiver =
            Rc::new(RefCell::new(MockedRootEndpoint::new(root.clone())));
        messages.register_object(endpoint)?;
        root.borrow_mut().is_initialized = true;
        Ok(())
    }

    /// Deinitializes every still registered object first, then the root
    /// itself.
    pub fn deinitialize(root: &Rc<RefCell<Self>>, messages: &mut MessagesManager) {
        if !root.borrow().is_initialized {
            return;
        }
        let objects: Vec<Rc<RefCell<MockedObject>>> = root
            .borrow()
            .registered_objects
            .iter()
            .rev()
            .map(|(_, object)| object.clone())
            .collect();
        for object in objects {
            object.borrow_mut().deinitialize(messages);
        }
        {
            let mut this = root.borrow_mut();
            this.registered_objects.clear();
            this.instantiated_objects.clear();
            this.is_initialized = false;
        }
        messages.unregister_object(DISTRIBUTED_OBJECTS_ROOT_KEY);
    }

    /// Creates a mocked object mirroring a statically placed authoritative
    /// object; the path and name must match the authority side so the keys
    /// bind.
    pub fn create_object(
        root: &Rc<RefCell<Self>>,
        relative_path: &str,
        name: &str,
        messages: &mut MessagesManager,
    ) -> Result<Rc<RefCell<MockedObject>>, MockingError> {
        if !root.borrow().is_initialized {
            return Err(MockingError::RootNotInitialized);
        }
        let node = {
            let this = root.borrow();
            let mut scene = this.scene.borrow_mut();
            let parent = scene.get_or_create_child(this.root_node, relative_path)?;
            match scene.find_child(parent, name) {
                Some(existing) => existing,
                None => scene.create_child(parent, name)?,
            }
        };
        Self::adopt_node(root, node, messages)
    }

    /// Adopts an existing scene node as a mocked object.
    pub fn adopt_node(
        root: &Rc<RefCell<Self>>,
        node: NodeId,
        messages: &mut MessagesManager,
    ) -> Result<Rc<RefCell<MockedObject>>, MockingError> {
        let object = {
            let this = root.borrow();
            let key = this.scene.borrow().relative_path(this.root_node, node)?;
            Rc::new(RefCell::new(MockedObject::new(
                this.scene.clone(),
                node,
                key,
            )))
        };
        Self::register_object(root, object.clone(), messages)?;
        Ok(object)
    }

    pub fn register_object(
        root: &Rc<RefCell<Self>>,
        object: Rc<RefCell<MockedObject>>,
        messages: &mut MessagesManager,
    ) -> Result<(), MockingError> {
        let key = object.borrow().object_key().to_owned();
        if root
            .borrow()
            .registered_objects
            .iter()
            .any(|(registered, _)| *registered == key)
        {
            return Ok(());
        }
        root.borrow_mut()
            .registered_objects
            .push((key, object.clone()));
        MockedObject::initialize(&object, messages)?;
        Ok(())
    }

    pub fn unregister_object(
        root: &Rc<RefCell<Self>>,
        object_key: &str,
        messages: &mut MessagesManager,
    ) {
        let found = {
            let mut this = root.borrow_mut();
            match this
                .registered_objects
                .iter()
                .position(|(key, _)| key == object_key)
            {
                Some(position) => {
                    let (_, object) = this.registered_objects.remove(position);
                    this.instantiated_objects
                        .retain(|data| !Rc::ptr_eq(&data.object, &object));
                    Some(object)
                }
                None => None,
            }
        };
        if let Some(object) = found {
            object.borrow_mut().deinitialize(messages);
        }
    }

    /// Instantiates the mocked counterpart of a dynamically spawned
    /// distributed object.
    fn instantiate_prefab(
        root: &Rc<RefCell<Self>>,
        prefab_id: i32,
        relative_path: &str,
        object_name: &str,
        messages: &mut MessagesManager,
    ) -> Result<(), MockingError> {
        let sinks: Vec<SinkCapability> = {
            let this = root.borrow();
            let prefab = this
                .prefabs
                .get(usize::try_from(prefab_id).unwrap_or(usize::MAX))
                .ok_or(MockingError::UnknownPrefab { prefab_id })?;
            prefab.components.iter().map(|factory| factory()).collect()
        };
        let node = {
            let this = root.borrow();
            let mut scene = this.scene.borrow_mut();
            let parent = scene.get_or_create_child(this.root_node, relative_path)?;
            // the authority already made the name unique
            scene.create_child(parent, object_name)?
        };
        let object = Self::adopt_node(root, node, messages)?;
        for sink in sinks {
            MockedObject::attach_component(&object, sink, messages)?;
        }
        root.borrow_mut()
            .instantiated_objects
            .push(InstantiatedObjectData {
                prefab_id,
                object,
            });
        Ok(())
    }
}

/// Messaging endpoint of the mocked objects root. Instantiating a prefab
/// needs the shared root handle, so the endpoint wraps it instead of the
/// root implementing the receiver itself.
pub struct MockedRootEndpoint {
    root: Rc<RefCell<MockedObjectsRoot>>,
}

impl MockedRootEndpoint {
    pub fn new(root: Rc<RefCell<MockedObjectsRoot>>) -> Self {
        Self { root }
    }
}

impl MessageReceiver for MockedRootEndpoint {
    fn key(&self) -> &str {
        DISTRIBUTED_OBJECTS_ROOT_KEY
    }

    fn receive_message(
        &mut self,
        _sender: &PeerInfo,
        message: &mut DistributedMessage,
        messages: &mut MessagesManager,
    ) {
        let command = message
            .content
            .pop_int(BYTES_PER_COMMAND_TYPE)
            .map_err(Into::into)
            .and_then(DistributedRootCommand::from_value);
        match command {
            Ok(DistributedRootCommand::InstantiateDistributedObject) => {
                let fields = (|| -> Result<(i32, String, String), BytesStackError> {
                    let prefab_id = message.content.pop_int(4)?;
                    let relative_path = message.content.pop_string()?;
                    let object_name = message.content.pop_string()?;
                    Ok((prefab_id, relative_path, object_name))
                })();
                match fields {
                    Ok((prefab_id, relative_path, object_name)) => {
                        if let Err(mocking_error) = MockedObjectsRoot::instantiate_prefab(
                            &self.root,
                            prefab_id,
                            &relative_path,
                            &object_name,
                            messages,
                        ) {
                            error!("Could not instantiate mocked prefab {prefab_id}: {mocking_error}");
                        }
                    }
                    Err(error) => warn!("Dropping malformed instantiation command: {error}"),
                }
            }
            Err(error) => warn!("Dropping malformed root command: {error}"),
        }
    }
}
