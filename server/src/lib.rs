//! # Simnet Server
//! The master node of a simnet cluster: owns simulation truth, assigns
//! identifiers, replicates distributed objects to connected clients and
//! drives the cluster lifecycle state machine.

#![deny(trivial_numeric_casts, unstable_features, unused_import_braces)]

pub mod error;
pub mod master;
pub mod world;

pub use error::MasterError;
pub use master::{
    load_balancer::NetworkLoadBalancer,
    master_manager::{
        ClientConnection, MasterManager, SimulationDescriptor, MASTER_IDENTIFIER,
    },
};
pub use world::{
    distributed_component::{
        DeltaSource, DistributedComponent, SnapshotSource, SourceCapability,
    },
    distributed_object::DistributedObject,
    objects_root::{ComponentFactory, DistributedObjectsRoot, Prefab},
    transform_sync::TransformSync,
    ReplicationError,
};
