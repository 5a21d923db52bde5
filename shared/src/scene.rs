use std::cell::RefCell;
use std::rc::Rc;

use thiserror::Error;

/// Nodes separator in relative paths.
pub const RELATIVE_PATH_SEPARATOR: char = '/';

/// Shared handle to a scene graph, cloned by every root, object and
/// component that addresses nodes inside it.
pub type SceneRef = Rc<RefCell<SceneGraph>>;

/// Stable handle of a node inside a [`SceneGraph`] arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NodeId(u32);

impl NodeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Local pose of a scene node.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Pose {
    pub position: [f32; 3],
    pub rotation: [f32; 4],
}

impl Default for Pose {
    fn default() -> Self {
        Self {
            position: [0.0; 3],
            rotation: [0.0, 0.0, 0.0, 1.0],
        }
    }
}

struct Node {
    name: String,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    active: bool,
    pose: Pose,
}

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum SceneError {
    #[error("Scene node {0:?} does not exist")]
    UnknownNode(NodeId),
    #[error("Node '{child}' is not inside the hierarchy of '{ancestor}'")]
    NotDescendant { ancestor: String, child: String },
}

/// Arena of named simulation scene nodes.
///
/// Parent and child links are stored as indices; replication code resolves
/// them once at registration and caches the resulting paths instead of
/// re-walking the hierarchy per message.
pub struct SceneGraph {
    nodes: Vec<Option<Node>>,
    root: NodeId,
}

impl SceneGraph {
    pub fn new() -> Self {
        let root = Node {
            name: String::new(),
            parent: None,
            children: Vec::new(),
            active: true,
            pose: Pose::default(),
        };
        Self {
            nodes: vec![Some(root)],
            root: NodeId(0),
        }
    }

    /// Creates a scene graph behind a shared handle.
    pub fn new_shared() -> SceneRef {
        Rc::new(RefCell::new(Self::new()))
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    fn node(&self, id: NodeId) -> Result<&Node, SceneError> {
        self.nodes
            .get(id.index())
            .and_then(Option::as_ref)
            .ok_or(SceneError::UnknownNode(id))
    }

    fn node_mut(&mut self, id: NodeId) -> Result<&mut Node, SceneError> {
        self.nodes
            .get_mut(id.index())
            .and_then(Option::as_mut)
            .ok_or(SceneError::UnknownNode(id))
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.node(id).is_ok()
    }

    pub fn name(&self, id: NodeId) -> Result<&str, SceneError> {
        Ok(&self.node(id)?.name)
    }

    pub fn parent(&self, id: NodeId) -> Result<Option<NodeId>, SceneError> {
        Ok(self.node(id)?.parent)
    }

    pub fn is_active(&self, id: NodeId) -> Result<bool, SceneError> {
        Ok(self.node(id)?.active)
    }

    pub fn set_active(&mut self, id: NodeId, active: bool) -> Result<(), SceneError> {
        self.node_mut(id)?.active = active;
        Ok(())
    }

    pub fn pose(&self, id: NodeId) -> Result<Pose, SceneError> {
        Ok(self.node(id)?.pose)
    }

    pub fn set_pose(&mut self, id: NodeId, pose: Pose) -> Result<(), SceneError> {
        self.node_mut(id)?.pose = pose;
        Ok(())
    }

    pub fn create_child(&mut self, parent: NodeId, name: &str) -> Result<NodeId, SceneError> {
        self.node(parent)?;
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(Some(Node {
            name: name.to_owned(),
            parent: Some(parent),
            children: Vec::new(),
            active: true,
            pose: Pose::default(),
        }));
        self.node_mut(parent)?.children.push(id);
        Ok(id)
    }

    pub fn find_child(&self, parent: NodeId, name: &str) -> Option<NodeId> {
        let parent = self.node(parent).ok()?;
        parent
            .children
            .iter()
            .copied()
            .find(|child| self.node(*child).map(|node| node.name == name).unwrap_or(false))
    }

    /// Removes a node and its whole subtree.
    pub fn remove(&mut self, id: NodeId) -> Result<(), SceneError> {
        let node = self.node(id)?;
        let parent = node.parent;
        let children = node.children.clone();
        for child in children {
            self.remove(child)?;
        }
        if let Some(parent) = parent {
            self.node_mut(parent)?.children.retain(|child| *child != id);
        }
        self.nodes[id.index()] = None;
        Ok(())
    }

    /// Relative path in the hierarchy between an ancestor and its
    /// descendant, one `/`-terminated segment per node.
    pub fn relative_path(&self, ancestor: NodeId, node: NodeId) -> Result<String, SceneError> {
        if ancestor == node {
            return Ok(String::new());
        }
        let mut names = Vec::new();
        let mut current = node;
        while current != ancestor {
            let data = self.node(current)?;
            names.push(data.name.clone());
            current = match data.parent {
                Some(parent) => parent,
                None => {
                    return Err(SceneError::NotDescendant {
                        ancestor: self.name(ancestor)?.to_owned(),
                        child: self.name(node)?.to_owned(),
                    })
                }
            };
        }
        let mut path = String::new();
        for name in names.iter().rev() {
            path.push_str(name);
            path.push(RELATIVE_PATH_SEPARATOR);
        }
        Ok(path)
    }

    /// Walks the relative path from `parent`, creating missing nodes.
    pub fn get_or_create_child(
        &mut self,
        parent: NodeId,
        relative_path: &str,
    ) -> Result<NodeId, SceneError> {
        let mut current = parent;
        for name in relative_path
            .split(RELATIVE_PATH_SEPARATOR)
            .filter(|segment| !segment.is_empty())
        {
            current = match self.find_child(current, name) {
                Some(child) => child,
                None => self.create_child(current, name)?,
            };
        }
        Ok(current)
    }

    /// Renames the node so its name is unique among its siblings, appending
    /// the first free numeric suffix. Returns true if the name changed.
    pub fn change_to_unique_name(&mut self, id: NodeId) -> Result<bool, SceneError> {
        let node = self.node(id)?;
        let name = node.name.clone();
        let Some(parent) = node.parent else {
            return Ok(false);
        };
        let mut name_taken = false;
        let mut max_id = 0;
        for sibling in &self.node(parent)?.children {
            if *sibling == id {
                continue;
            }
            let sibling_name = &self.node(*sibling)?.name;
            if !sibling_name.starts_with(&name) {
                continue;
            }
            if sibling_name.len() == name.len() {
                name_taken = true;
            } else if let Ok(sibling_id) = sibling_name[name.len()..].parse::<u32>() {
                max_id = sibling_id + 1;
            }
        }
        if name_taken {
            self.node_mut(id)?.name = format!("{name}{max_id}");
        }
        Ok(name_taken)
    }
}

impl Default for SceneGraph {
    fn default() -> Self {
        Self::new()
    }
}
