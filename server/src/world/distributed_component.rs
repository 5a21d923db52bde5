use std::cell::RefCell;
use std::net::SocketAddr;
use std::rc::{Rc, Weak};

use log::{debug, error};

use simnet_shared::{
    BytesStack, ComponentError, DeliveryGuarantee, DistributedMessage, MessageReceiver,
    MessagesManager, MessagesPool, NodeId, PeerInfo, SceneGraph, SceneRef, StateMessageKind,
    TimeTicks, BYTES_PER_COMMAND_TYPE,
};

use crate::world::distributed_object::DistributedObject;

/// State provider of a snapshot-only component.
pub trait SnapshotSource {
    /// Component type tag, part of the component's address key.
    fn component_key(&self) -> &'static str;

    /// Lets the cadenced broadcast skip ticks when nothing changed.
    fn has_changed(&self, _scene: &SceneGraph, _node: NodeId) -> bool {
        true
    }

    /// Pushes a full state sufficient to reconstruct the component from
    /// nothing. Must not change any baseline bookkeeping: replays to late
    /// joining peers use this without marking the state as sent.
    fn push_snapshot(
        &self,
        scene: &SceneGraph,
        node: NodeId,
        content: &mut BytesStack,
    ) -> Result<(), ComponentError>;

    /// Marks the current state as sent to every mirror; the baseline for
    /// change detection and deltas.
    fn mark_clean(&mut self, _scene: &SceneGraph, _node: NodeId) {}
}

/// State provider of a component that can additionally emit incremental
/// state valid only after a prior snapshot.
pub trait DeltaSource: SnapshotSource {
    /// Pushes the changes since the last pushed state. Returns false when
    /// there is nothing to send.
    fn push_delta(
        &mut self,
        scene: &SceneGraph,
        node: NodeId,
        content: &mut BytesStack,
    ) -> Result<bool, ComponentError>;
}

/// Distribution capability of a component, resolved once at registration.
pub enum SourceCapability {
    Snapshot(Box<dyn SnapshotSource>),
    SnapshotDelta(Box<dyn DeltaSource>),
}

impl SourceCapability {
    pub fn component_key(&self) -> &'static str {
        match self {
            SourceCapability::Snapshot(source) => source.component_key(),
            SourceCapability::SnapshotDelta(source) => source.component_key(),
        }
    }
}

/// Authoritative component synchronized with the mocked components on the
/// connected clients.
pub struct DistributedComponent {
    scene: SceneRef,
    node: NodeId,
    key: String,
    parent: Weak<RefCell<DistributedObject>>,
    source: SourceCapability,
    /// Suppresses cadenced broadcasts while the state is unchanged; one
    /// reliable keyframe is sent on falling asleep.
    is_sleeping: bool,
    last_snapshot_time: TimeTicks,
    snapshot_interval: i64,
}

impl DistributedComponent {
    pub(crate) fn new(
        scene: SceneRef,
        node: NodeId,
        key: String,
        parent: Weak<RefCell<DistributedObject>>,
        source: SourceCapability,
        snapshot_interval: i64,
    ) -> Self {
        Self {
            scene,
            node,
            key,
            parent,
            source,
            is_sleeping: false,
            last_snapshot_time: TimeTicks::MIN,
            snapshot_interval,
        }
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    /// Builds the full state message of this component. When the snapshot
    /// goes to every mirror the state is additionally marked as the new
    /// change-detection baseline; a replay to a single late joiner is not.
    pub(crate) fn build_snapshot_message(
        &mut self,
        reliable: bool,
        mark_clean: bool,
        scene: &SceneGraph,
        pool: &mut MessagesPool,
    ) -> Result<DistributedMessage, ComponentError> {
        let (delivery, tagged) = match &self.source {
            SourceCapability::Snapshot(_) => (
                if reliable {
                    DeliveryGuarantee::ReliableUnordered
                } else {
                    DeliveryGuarantee::Unreliable
                },
                false,
            ),
            // delta-capable state shares one ordered channel so a delta can
            // never overtake the snapshot it depends on
            SourceCapability::SnapshotDelta(_) => (DeliveryGuarantee::ReliableOrdered, true),
        };
        let mut message = pool.get_message(64, self.key.clone(), delivery);
        match &self.source {
            SourceCapability::Snapshot(source) => {
                source.push_snapshot(scene, self.node, &mut message.content)?
            }
            SourceCapability::SnapshotDelta(source) => {
                source.push_snapshot(scene, self.node, &mut message.content)?
            }
        }
        if mark_clean {
            match &mut self.source {
                SourceCapability::Snapshot(source) => source.mark_clean(scene, self.node),
                SourceCapability::SnapshotDelta(source) => source.mark_clean(scene, self.node),
            }
        }
        if tagged {
            message
                .content
                .push_int(StateMessageKind::Snapshot as i32, BYTES_PER_COMMAND_TYPE);
        }
        Ok(message)
    }

    /// Produces the next cadenced state message, if this tick has one.
    pub(crate) fn poll_state(
        &mut self,
        now: TimeTicks,
        scene: &SceneGraph,
        pool: &mut MessagesPool,
    ) -> Option<DistributedMessage> {
        match &mut self.source {
            SourceCapability::Snapshot(source) => {
                if now < self.last_snapshot_time.saturating_add(self.snapshot_interval) {
                    return None;
                }
                if !source.has_changed(scene, self.node) {
                    if self.is_sleeping {
                        return None;
                    }
                    // one reliable keyframe when the state settles
                    self.is_sleeping = true;
                } else {
                    self.is_sleeping = false;
                }
                let reliable = self.is_sleeping;
                self.last_snapshot_time = now;
                match self.build_snapshot_message(reliable, true, scene, pool) {
                    Ok(message) => Some(message),
                    Err(error) => {
                        error!("Could not push a snapshot of '{}': {error}", self.key);
                        None
                    }
                }
            }
            SourceCapability::SnapshotDelta(source) => {
                let mut message = pool.get_message(
                    64,
                    self.key.clone(),
                    DeliveryGuarantee::ReliableOrdered,
                );
                match source.push_delta(scene, self.node, &mut message.content) {
                    Ok(true) => {
                        message
                            .content
                            .push_int(StateMessageKind::Delta as i32, BYTES_PER_COMMAND_TYPE);
                        Some(message)
                    }
                    Ok(false) => {
                        pool.release(message);
                        None
                    }
                    Err(error) => {
                        error!("Could not push a delta of '{}': {error}", self.key);
                        pool.release(message);
                        None
                    }
                }
            }
        }
    }
}

impl MessageReceiver for DistributedComponent {
    fn key(&self) -> &str {
        &self.key
    }

    fn receive_message(
        &mut self,
        _sender: &PeerInfo,
        _message: &mut DistributedMessage,
        _messages: &mut MessagesManager,
    ) {
        // the authority never applies inbound component state
        debug!("Ignoring inbound state for authoritative component '{}'.", self.key);
    }

    fn unicast_initial_messages(&mut self, endpoint: SocketAddr, messages: &mut MessagesManager) {
        let Some(parent) = self.parent.upgrade() else {
            return;
        };
        let scene = self.scene.clone();
        let snapshot = self.build_snapshot_message(true, false, &scene.borrow(), messages.pool());
        match snapshot {
            Ok(message) => parent.borrow().unicast_message(endpoint, message, messages),
            Err(error) => error!(
                "Could not replay the initial snapshot of '{}': {error}",
                self.key
            ),
        }
    }
}
