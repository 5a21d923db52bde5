use simnet_shared::{
    pop_vec3, push_pose, push_quat, push_vec3, BytesStack, ComponentError, NodeId, Pose,
    SceneGraph, TRANSFORM_FLAG_POSITION as FLAG_POSITION,
    TRANSFORM_FLAG_ROTATION as FLAG_ROTATION, TRANSFORM_SYNC_KEY,
};

use crate::world::distributed_component::{DeltaSource, SnapshotSource, SourceCapability};

/// Replicates the pose of the owning scene node.
///
/// As a snapshot source it sends cadenced full poses and falls asleep while
/// the node does not move; as a delta source it sends only the changed pose
/// fields on the shared ordered channel.
#[derive(Default)]
pub struct TransformSync {
    last_sent: Option<Pose>,
}

impl TransformSync {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot-only distribution of this transform.
    pub fn snapshot_source() -> SourceCapability {
        SourceCapability::Snapshot(Box::new(Self::new()))
    }

    /// Snapshot plus delta distribution of this transform.
    pub fn delta_source() -> SourceCapability {
        SourceCapability::SnapshotDelta(Box::new(Self::new()))
    }
}

impl SnapshotSource for TransformSync {
    fn component_key(&self) -> &'static str {
        TRANSFORM_SYNC_KEY
    }

    fn has_changed(&self, scene: &SceneGraph, node: NodeId) -> bool {
        match (scene.pose(node), self.last_sent) {
            (Ok(pose), Some(last)) => pose != last,
            _ => true,
        }
    }

    fn push_snapshot(
        &self,
        scene: &SceneGraph,
        node: NodeId,
        content: &mut BytesStack,
    ) -> Result<(), ComponentError> {
        let pose = scene.pose(node)?;
        push_pose(content, &pose);
        Ok(())
    }

    fn mark_clean(&mut self, scene: &SceneGraph, node: NodeId) {
        if let Ok(pose) = scene.pose(node) {
            self.last_sent = Some(pose);
        }
    }
}

impl DeltaSource for TransformSync {
    fn push_delta(
        &mut self,
        scene: &SceneGraph,
        node: NodeId,
        content: &mut BytesStack,
    ) -> Result<bool, ComponentError> {
        let pose = scene.pose(node)?;
        // deltas are only valid against an already sent state
        let Some(last) = self.last_sent else {
            return Ok(false);
        };
        let mut flags = 0;
        if pose.position != last.position {
            flags |= FLAG_POSITION;
        }
        if pose.rotation != last.rotation {
            flags |= FLAG_ROTATION;
        }
        if flags == 0 {
            return Ok(false);
        }
        if flags & FLAG_ROTATION != 0 {
            push_quat(content, &pose.rotation);
        }
        if flags & FLAG_POSITION != 0 {
            push_vec3(content, &pose.position);
        }
        content.push_int(flags, 1);
        self.last_sent = Some(pose);
        Ok(true)
    }
}
