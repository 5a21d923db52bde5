pub mod distributed_component;
pub mod distributed_object;
pub mod objects_root;
pub mod transform_sync;

use thiserror::Error;

use simnet_shared::{ComponentError, MessagingError, SceneError};

/// Errors of the authoritative replication layer.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ReplicationError {
    #[error("Selective distribution is disabled on the object")]
    SelectiveDistributionDisabled,

    #[error("Prefab of distributed object with id {prefab_id} is not registered in the root")]
    UnknownPrefab { prefab_id: i32 },

    #[error("The distributed objects root is not initialized")]
    RootNotInitialized,

    #[error(transparent)]
    Scene(#[from] SceneError),

    #[error(transparent)]
    Messaging(#[from] MessagingError),

    #[error(transparent)]
    Component(#[from] ComponentError),
}
