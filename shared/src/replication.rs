//! Wire vocabulary shared by the authoritative and the mirrored sides of
//! the replication layer.

use thiserror::Error;

use crate::messaging::bytes_stack::{BytesStack, BytesStackError};
use crate::messaging::error::MessagingError;
use crate::scene::{Pose, SceneError};

/// Errors raised while coding or applying component state.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ComponentError {
    #[error("Component state does not match the expected layout: {0}")]
    Stack(#[from] BytesStackError),
    #[error("Component scene access failed: {0}")]
    Scene(#[from] SceneError),
    #[error("Unknown component state kind: {0}")]
    UnknownStateKind(i32),
}

/// Sender key binding the distributed objects root with the mocked objects
/// roots on the clients.
pub const DISTRIBUTED_OBJECTS_ROOT_KEY: &str = "DistributedObjectsRoot";

/// Component type tag of the transform synchronization pair.
pub const TRANSFORM_SYNC_KEY: &str = "TransformSync";

/// Transform delta field flags.
pub const TRANSFORM_FLAG_POSITION: i32 = 1;
pub const TRANSFORM_FLAG_ROTATION: i32 = 2;

/// Bytes required for any replication command tag.
pub const BYTES_PER_COMMAND_TYPE: usize = 1;

/// Discriminates the state envelope of delta-capable components. Popped
/// from the content before dispatch; snapshot-only components carry no tag.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StateMessageKind {
    Snapshot = 0,
    Delta = 1,
}

impl StateMessageKind {
    pub fn from_value(value: i32) -> Result<Self, MessagingError> {
        match value {
            0 => Ok(Self::Snapshot),
            1 => Ok(Self::Delta),
            value => Err(MessagingError::UnknownCommandType { value }),
        }
    }
}

/// Object-level replication commands.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DistributedObjectCommand {
    Enable = 0,
    Disable = 1,
}

impl DistributedObjectCommand {
    pub fn from_value(value: i32) -> Result<Self, MessagingError> {
        match value {
            0 => Ok(Self::Enable),
            1 => Ok(Self::Disable),
            value => Err(MessagingError::UnknownCommandType { value }),
        }
    }
}

/// Root-level replication commands.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DistributedRootCommand {
    InstantiateDistributedObject = 0,
}

impl DistributedRootCommand {
    pub fn from_value(value: i32) -> Result<Self, MessagingError> {
        match value {
            0 => Ok(Self::InstantiateDistributedObject),
            value => Err(MessagingError::UnknownCommandType { value }),
        }
    }
}

pub fn push_vec3(content: &mut BytesStack, value: &[f32; 3]) {
    content.push_float(value[2]);
    content.push_float(value[1]);
    content.push_float(value[0]);
}

pub fn pop_vec3(content: &mut BytesStack) -> Result<[f32; 3], BytesStackError> {
    Ok([content.pop_float()?, content.pop_float()?, content.pop_float()?])
}

pub fn push_quat(content: &mut BytesStack, value: &[f32; 4]) {
    content.push_float(value[3]);
    content.push_float(value[2]);
    content.push_float(value[1]);
    content.push_float(value[0]);
}

pub fn pop_quat(content: &mut BytesStack) -> Result<[f32; 4], BytesStackError> {
    Ok([
        content.pop_float()?,
        content.pop_float()?,
        content.pop_float()?,
        content.pop_float()?,
    ])
}

/// Pushes a full pose so the receiver pops the position first.
pub fn push_pose(content: &mut BytesStack, pose: &Pose) {
    push_quat(content, &pose.rotation);
    push_vec3(content, &pose.position);
}

pub fn pop_pose(content: &mut BytesStack) -> Result<Pose, BytesStackError> {
    Ok(Pose {
        position: pop_vec3(content)?,
        rotation: pop_quat(content)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pose_round_trips() {
        let pose = Pose {
            position: [1.0, -2.5, 3.75],
            rotation: [0.0, 0.7071, 0.0, 0.7071],
        };
        let mut content = BytesStack::new();
        push_pose(&mut content, &pose);
        assert_eq!(pop_pose(&mut content).unwrap(), pose);
        assert!(content.is_empty());
    }
}
