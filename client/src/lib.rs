//! # Simnet Client
//! A client node of a simnet cluster: mirrors a subset of the master's
//! simulation state through mocked objects and follows the cluster
//! lifecycle commands.

#![deny(trivial_numeric_casts, unstable_features, unused_import_braces)]

pub mod error;
pub mod manager;
pub mod world;

pub use error::ClientError;
pub use manager::client_manager::{ClientManager, NoopSimulationLoader, SimulationLoader};
pub use world::{
    mocked_component::{DeltaSink, MockedComponent, SinkCapability, SnapshotSink},
    mocked_object::MockedObject,
    mocked_objects_root::{MockPrefab, MockedObjectsRoot, MockedRootEndpoint, SinkFactory},
    mocked_transform::MockedTransformSync,
    MockingError,
};
