use std::cell::RefCell;
use std::net::SocketAddr;
use std::rc::Rc;

use log::{error, warn};

use simnet_shared::{
    DeliveryGuarantee, DistributedMessage, DistributedRootCommand, MessageReceiver,
    MessagesManager, NetworkSettings, NodeId, PeerInfo, SceneRef, SharedReceiver, TimeTicks,
    BYTES_PER_COMMAND_TYPE, DISTRIBUTED_OBJECTS_ROOT_KEY,
};

use crate::world::distributed_component::SourceCapability;
use crate::world::distributed_object::DistributedObject;
use crate::world::ReplicationError;

/// Factory producing the distribution capability of one prefab component.
pub type ComponentFactory = Box<dyn Fn() -> SourceCapability>;

/// Template of a dynamically instantiated distributed object.
pub struct Prefab {
    pub name: String,
    pub components: Vec<ComponentFactory>,
}

struct InstantiatedObjectData {
    prefab_id: i32,
    object: Rc<RefCell<DistributedObject>>,
}

/// The root of the authoritative object graph.
///
/// Maintains the registry of live distributed objects by key and the log of
/// objects it instantiated itself, replayed to late joining mirrors.
pub struct DistributedObjectsRoot {
    scene: SceneRef,
    root_node: NodeId,
    settings: NetworkSettings,
    is_initialized: bool,
    registered_objects: Vec<(String, Rc<RefCell<DistributedObject>>)>,
    /// Objects created before the root initialized, registered on
    /// initialization.
    pending_objects: Vec<Rc<RefCell<DistributedObject>>>,
    instantiated_objects: Vec<InstantiatedObjectData>,
    prefabs: Vec<Prefab>,
}

impl DistributedObjectsRoot {
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
            pending_objects: Vec::new(),
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

    pub fn register_prefab(&mut self, prefab: Prefab) -> i32 {
        self.prefabs.push(prefab);
        (self.prefabs.len() - 1) as i32
    }

    fn snapshot_interval(&self) -> i64 {
        1000 / i64::from(self.settings.snapshots_per_second.max(1))
    }

    /// Registers the root for messaging and flushes every object that
    /// waited for it.
    pub fn initialize(
        root: &Rc<RefCell<Self>>,
        messages: &mut MessagesManager,
    ) -> Result<(), ReplicationError> {
        if root.borrow().is_initialized {
            return Ok(());
        }
        let shared: SharedReceiver = root.clone();
        messages.register_object(shared)?;
        root.borrow_mut().is_initialized = true;
        let pending = std::mem::take(&mut root.borrow_mut().pending_objects);
        for object in pending {
            Self::register_object(root, object, messages)?;
        }
        Ok(())
    }

    /// Deinitializes every still registered object first, then the root
    /// itself; a disappearing root must leave no routable receiver behind.
    pub fn deinitialize(root: &Rc<RefCell<Self>>, messages: &mut MessagesManager) {
        if !root.borrow().is_initialized {
            return;
        }
        let objects: Vec<Rc<RefCell<DistributedObject>>> = root
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

    /// Creates a distributed object on a fresh node under the given
    /// relative path. The node is renamed if its name is taken, keeping
    /// object keys unique under this root.
    pub fn create_object(
        root: &Rc<RefCell<Self>>,
        relative_path: &str,
        name: &str,
        messages: &mut MessagesManager,
    ) -> Result<Rc<RefCell<DistributedObject>>, ReplicationError> {
        let node = {
            let this = root.borrow();
            let mut scene = this.scene.borrow_mut();
            let parent = scene.get_or_create_child(this.root_node, relative_path)?;
            let node = scene.create_child(parent, name)?;
            scene.change_to_unique_name(node)?;
            node
        };
        Self::adopt_node(root, node, messages)
    }

    /// Adopts an existing scene node as a distributed object. Fails when
    /// the node is not inside the root's hierarchy; such objects stay
    /// local-only and are never replicated.
    pub fn adopt_node(
        root: &Rc<RefCell<Self>>,
        node: NodeId,
        messages: &mut MessagesManager,
    ) -> Result<Rc<RefCell<DistributedObject>>, ReplicationError> {
        let object = {
            let this = root.borrow();
            let key = this.scene.borrow().relative_path(this.root_node, node)?;
            Rc::new(RefCell::new(DistributedObject::new(
                this.scene.clone(),
                node,
                key,
                true,
                this.snapshot_interval(),
            )))
        };
        Self::register_object(root, object.clone(), messages)?;
        Ok(object)
    }

    /// Registers the object now, or parks it until the root initializes.
    pub fn register_object(
        root: &Rc<RefCell<Self>>,
        object: Rc<RefCell<DistributedObject>>,
        messages: &mut MessagesManager,
    ) -> Result<(), ReplicationError> {
        if !root.borrow().is_initialized {
            root.borrow_mut().pending_objects.push(object);
            return Ok(());
        }
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
        DistributedObject::initialize(&object, messages)?;
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

    fn prefab_components(
        root: &Rc<RefCell<Self>>,
        prefab_id: i32,
    ) -> Result<Vec<SourceCapability>, ReplicationError> {
        let this = root.borrow();
        let prefab = this
            .prefabs
            .get(usize::try_from(prefab_id).unwrap_or(usize::MAX))
            .ok_or(ReplicationError::UnknownPrefab { prefab_id })?;
        Ok(prefab.components.iter().map(|factory| factory()).collect())
    }

    fn instantiate_prefab(
        root: &Rc<RefCell<Self>>,
        prefab_id: i32,
        relative_path: &str,
        selective_end_points: Option<&[SocketAddr]>,
        messages: &mut MessagesManager,
    ) -> Result<Rc<RefCell<DistributedObject>>, ReplicationError> {
        if !root.borrow().is_initialized {
            return Err(ReplicationError::RootNotInitialized);
        }
        let prefab_name = {
            let this = root.borrow();
            this.prefabs
                .get(usize::try_from(prefab_id).unwrap_or(usize::MAX))
                .ok_or(ReplicationError::UnknownPrefab { prefab_id })?
                .name
                .clone()
        };
        let components = Self::prefab_components(root, prefab_id)?;

        let node = {
            let this = root.borrow();
            let mut scene = this.scene.borrow_mut();
            let parent = scene.get_or_create_child(this.root_node, relative_path)?;
            let node = scene.create_child(parent, &prefab_name)?;
            scene.change_to_unique_name(node)?;
            node
        };
        let object = {
            let this = root.borrow();
            let key = this.scene.borrow().relative_path(this.root_node, node)?;
            Rc::new(RefCell::new(DistributedObject::new(
                this.scene.clone(),
                node,
                key,
                true,
                this.snapshot_interval(),
            )))
        };
        if let Some(end_points) = selective_end_points {
            let mut this = object.borrow_mut();
            this.set_selective_distribution(true);
            for endpoint in end_points {
                this.addressed_end_points_mut().push(*endpoint);
            }
        }
        Self::register_object(root, object.clone(), messages)?;
        for source in components {
            DistributedObject::attach_component(&object, source, messages)?;
        }
        root.borrow_mut()
            .instantiated_objects
            .push(InstantiatedObjectData {
                prefab_id,
                object: object.clone(),
            });
        Ok(object)
    }

    fn instantiation_message(
        &self,
        prefab_id: i32,
        relative_path: &str,
        object_name: &str,
        messages: &mut MessagesManager,
    ) -> DistributedMessage {
        let mut message = messages.pool().get_message(
            object_name.len() + relative_path.len() + 8 + 4 + BYTES_PER_COMMAND_TYPE,
            DISTRIBUTED_OBJECTS_ROOT_KEY,
            DeliveryGuarantee::ReliableOrdered,
        );
        message.content.push_string(object_name);
        message.content.push_string(relative_path);
        message.content.push_int(prefab_id, 4);
        message.content.push_int(
            DistributedRootCommand::InstantiateDistributedObject as i32,
            BYTES_PER_COMMAND_TYPE,
        );
        message
    }

    /// Instantiates the prefab under a unique relative path and broadcasts
    /// the instantiation to every connected mirror.
    pub fn instantiate_prefab_and_broadcast(
        root: &Rc<RefCell<Self>>,
        prefab_id: i32,
        relative_path: &str,
        messages: &mut MessagesManager,
    ) -> Result<Rc<RefCell<DistributedObject>>, ReplicationError> {
        let object = Self::instantiate_prefab(root, prefab_id, relative_path, None, messages)?;
        let name = {
            let this = root.borrow();
            let node = object.borrow().node();
            this.scene.borrow().name(node)?.to_owned()
        };
        let message =
            root.borrow()
                .instantiation_message(prefab_id, relative_path, &name, messages);
        if let Err(error) = messages.broadcast_message(message) {
            error!("Could not broadcast the instantiation of prefab {prefab_id}: {error}");
        }
        Ok(object)
    }

    /// Instantiates the prefab for a subset of mirrors only; the object is
    /// marked for selective distribution and announced per endpoint.
    pub fn instantiate_prefab_selectively(
        root: &Rc<RefCell<Self>>,
        prefab_id: i32,
        relative_path: &str,
        end_points: &[SocketAddr],
        messages: &mut MessagesManager,
    ) -> Result<Rc<RefCell<DistributedObject>>, ReplicationError> {
        let object =
            Self::instantiate_prefab(root, prefab_id, relative_path, Some(end_points), messages)?;
        let name = {
            let this = root.borrow();
            let node = object.borrow().node();
            this.scene.borrow().name(node)?.to_owned()
        };
        for endpoint in end_points {
            let message =
                root.borrow()
                    .instantiation_message(prefab_id, relative_path, &name, messages);
            if let Err(error) = messages.unicast_message(*endpoint, message) {
                error!("Could not announce the instantiation of prefab {prefab_id}: {error}");
            }
        }
        Ok(object)
    }

    /// Drives the cadenced state broadcast of every registered object.
    pub fn tick(root: &Rc<RefCell<Self>>, now: TimeTicks, messages: &mut MessagesManager) {
        let objects: Vec<Rc<RefCell<DistributedObject>>> = root
            .borrow()
            .registered_objects
            .iter()
            .map(|(_, object)| object.clone())
            .collect();
        for object in objects {
            object.borrow_mut().tick(now, messages);
        }
    }
}

impl MessageReceiver for DistributedObjectsRoot {
    fn key(&self) -> &str {
        DISTRIBUTED_OBJECTS_ROOT_KEY
    }

    fn receive_message(
        &mut self,
        _sender: &PeerInfo,
        _message: &mut DistributedMessage,
        _messages: &mut MessagesManager,
    ) {
        // instantiation commands only flow from the authority to mirrors
        warn!("Ignoring inbound command addressed to the authoritative objects root.");
    }

    fn unicast_initial_messages(&mut self, endpoint: SocketAddr, messages: &mut MessagesManager) {
        // replay the instantiations a late joining mirror missed; selective
        // objects only reach their addressed endpoints
        let replay: Vec<(i32, Rc<RefCell<DistributedObject>>)> = self
            .instantiated_objects
            .iter()
            .map(|data| (data.prefab_id, data.object.clone()))
            .collect();
        for (prefab_id, object) in replay {
            let allowed = {
                let this = object.borrow();
                !this.selective_distribution() || this.addressed_end_points().contains(&endpoint)
            };
            if !allowed {
                continue;
            }
            let (relative_path, name) = {
                let this = object.borrow();
                let scene = self.scene.borrow();
                let node = this.node();
                let Ok(Some(parent)) = scene.parent(node) else {
                    continue;
                };
                let Ok(relative_path) = scene.relative_path(self.root_node, parent) else {
                    continue;
                };
                let Ok(name) = scene.name(node) else {
                    continue;
                };
                (relative_path, name.to_owned())
            };
            let message =
                self.instantiation_message(prefab_id, &relative_path, &name, messages);
            if let Err(error) = messages.unicast_message(endpoint, message) {
                error!("Could not replay an instantiation to '{endpoint}': {error}");
            }
        }
    }
}
