use simnet_shared::{
    pop_pose, pop_quat, pop_vec3, ComponentError, DistributedMessage, NodeId, SceneGraph,
    TRANSFORM_FLAG_POSITION, TRANSFORM_FLAG_ROTATION, TRANSFORM_SYNC_KEY,
};

use crate::world::mocked_component::{DeltaSink, SinkCapability, SnapshotSink};

/// Applies replicated poses to the owning scene node.
#[derive(Default)]
pub struct MockedTransformSync;

impl MockedTransformSync {
    pub fn new() -> Self {
        Self
    }

    /// Snapshot-only mocking of a transform.
    pub fn snapshot_sink() -> SinkCapability {
        SinkCapability::Snapshot(Box::new(Self::new()))
    }

    /// Snapshot plus delta mocking of a transform.
    pub fn delta_sink() -> SinkCapability {
        SinkCapability::SnapshotDelta(Box::new(Self::new()))
    }
}

impl SnapshotSink for MockedTransformSync {
    fn component_key(&self) -> &'static str {
        TRANSFORM_SYNC_KEY
    }

    fn apply_snapshot(
        &mut self,
        scene: &mut SceneGraph,
        node: NodeId,
        message: &mut DistributedMessage,
    ) -> Result<(), ComponentError> {
        let pose = pop_pose(&mut message.content)?;
        scene.set_pose(node, pose)?;
        Ok(())
    }
}

impl DeltaSink for MockedTransformSync {
    fn apply_delta(
        &mut self,
        scene: &mut SceneGraph,
        node: NodeId,
        message: &mut DistributedMessage,
    ) -> Result<(), ComponentError> {
        let flags = message.content.pop_int(1)?;
        let mut pose = scene.pose(node)?;
        if flags & TRANSFORM_FLAG_POSITION != 0 {
            pose.position = pop_vec3(&mut message.content)?;
        }
        if flags & TRANSFORM_FLAG_ROTATION != 0 {
            pose.rotation = pop_quat(&mut message.content)?;
        }
        scene.set_pose(node, pose)?;
        Ok(())
    }
}
