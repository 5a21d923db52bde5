use log::warn;

use simnet_shared::{
    ComponentError, DistributedMessage, MessageReceiver, MessagesManager, NodeId, PeerInfo,
    SceneGraph, SceneRef, StateMessageKind, TimeTicks, BYTES_PER_COMMAND_TYPE,
};

/// State consumer of a snapshot-only mocked component.
pub trait SnapshotSink {
    /// Component type tag, part of the component's address key. Must match
    /// the authoritative counterpart.
    fn component_key(&self) -> &'static str;

    fn apply_snapshot(
        &mut self,
        scene: &mut SceneGraph,
        node: NodeId,
        message: &mut DistributedMessage,
    ) -> Result<(), ComponentError>;
}

/// State consumer that additionally understands incremental state.
pub trait DeltaSink: SnapshotSink {
    fn apply_delta(
        &mut self,
        scene: &mut SceneGraph,
        node: NodeId,
        message: &mut DistributedMessage,
    ) -> Result<(), ComponentError>;
}

/// Mocking capability of a component, resolved once at registration.
pub enum SinkCapability {
    Snapshot(Box<dyn SnapshotSink>),
    SnapshotDelta(Box<dyn DeltaSink>),
}

impl SinkCapability {
    pub fn component_key(&self) -> &'static str {
        match self {
            SinkCapability::Snapshot(sink) => sink.component_key(),
            SinkCapability::SnapshotDelta(sink) => sink.component_key(),
        }
    }
}

/// Mirrored component applying the state received from its authoritative
/// counterpart. Never originates state itself.
pub struct MockedComponent {
    scene: SceneRef,
    node: NodeId,
    key: String,
    sink: SinkCapability,
    newest_server_timestamp: TimeTicks,
}

impl MockedComponent {
    pub(crate) fn new(scene: SceneRef, node: NodeId, key: String, sink: SinkCapability) -> Self {
        Self {
            scene,
            node,
            key,
            sink,
            newest_server_timestamp: TimeTicks::MIN,
        }
    }

    pub fn node(&self) -> NodeId {
        self.node
    }
}

impl MessageReceiver for MockedComponent {
    fn key(&self) -> &str {
        &self.key
    }

    fn receive_message(
        &mut self,
        _sender: &PeerInfo,
        message: &mut DistributedMessage,
        _messages: &mut MessagesManager,
    ) {
        let scene = self.scene.clone();
        let mut scene = scene.borrow_mut();
        let result = match &mut self.sink {
            SinkCapability::Snapshot(sink) => {
                // a late snapshot must not override a newer applied state
                if message.server_timestamp <= self.newest_server_timestamp {
                    return;
                }
                self.newest_server_timestamp = message.server_timestamp;
                sink.apply_snapshot(&mut scene, self.node, message)
            }
            SinkCapability::SnapshotDelta(sink) => {
                let kind = message
                    .content
                    .pop_int(BYTES_PER_COMMAND_TYPE)
                    .map_err(ComponentError::from)
                    .and_then(|value| {
                        StateMessageKind::from_value(value)
                            .map_err(|_| ComponentError::UnknownStateKind(value))
                    });
                match kind {
                    Ok(StateMessageKind::Snapshot) => {
                        self.newest_server_timestamp = message.server_timestamp;
                        sink.apply_snapshot(&mut scene, self.node, message)
                    }
                    Ok(StateMessageKind::Delta) => {
                        self.newest_server_timestamp = message.server_timestamp;
                        sink.apply_delta(&mut scene, self.node, message)
                    }
                    Err(error) => Err(error),
                }
            }
        };
        if let Err(error) = result {
            warn!("Dropping state the mocked component '{}' could not apply: {error}", self.key);
        }
    }
}
