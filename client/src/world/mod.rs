pub mod mocked_component;
pub mod mocked_object;
pub mod mocked_objects_root;
pub mod mocked_transform;

use thiserror::Error;

use simnet_shared::{ComponentError, MessagingError, SceneError};

/// Errors of the mirrored replication layer.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum MockingError {
    #[error("Prefab of mocked object with id {prefab_id} is not registered in the root")]
    UnknownPrefab { prefab_id: i32 },

    #[error("The mocked objects root is not initialized")]
    RootNotInitialized,

    #[error(transparent)]
    Scene(#[from] SceneError),

    #[error(transparent)]
    Messaging(#[from] MessagingError),

    #[error(transparent)]
    Component(#[from] ComponentError),
}
