use crate::messaging::bytes_stack::BytesStack;
use crate::transport::PeerId;
use crate::types::TimeTicks;

/// Delivery guarantee of a single message, mapped 1:1 onto the transport
/// channels.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DeliveryGuarantee {
    /// Fire and forget. May be dropped, arrival order not guaranteed.
    Unreliable,
    /// Guaranteed delivery, arrival order not guaranteed.
    ReliableUnordered,
    /// Guaranteed delivery, FIFO per sender.
    ReliableOrdered,
}

/// A message distributed between the cluster peers.
///
/// The address key routes the message to the bound receiver; on the wire the
/// key travels as its compact numeric identifier pushed on top of the
/// content. Timestamps are reconstructed on receive from the pushed time
/// difference and the sending peer's measured clock delta.
#[derive(Clone, Debug)]
pub struct DistributedMessage {
    pub address_key: String,
    pub content: BytesStack,
    pub delivery: DeliveryGuarantee,
    /// Send time in the sender's clock.
    pub timestamp: TimeTicks,
    /// Send time mapped into the local clock domain.
    pub server_timestamp: TimeTicks,
    pub sender: Option<PeerId>,
}

impl DistributedMessage {
    pub fn new(address_key: impl Into<String>, content: BytesStack, delivery: DeliveryGuarantee) -> Self {
        Self {
            address_key: address_key.into(),
            content,
            delivery,
            timestamp: 0,
            server_timestamp: 0,
            sender: None,
        }
    }

    /// Builds a received message from raw transport payload bytes.
    pub fn received(payload: &[u8], delivery: DeliveryGuarantee, sender: PeerId) -> Self {
        Self {
            address_key: String::new(),
            content: BytesStack::from_bytes(payload),
            delivery,
            timestamp: 0,
            server_timestamp: 0,
            sender: Some(sender),
        }
    }
}

/// Pool of message content buffers.
///
/// A message is released back into the pool right after its bytes were
/// handed to the transport; releasing consumes the message, so a released
/// buffer can never be observed by the sender again.
#[derive(Default)]
pub struct MessagesPool {
    free: Vec<BytesStack>,
}

/// Buffers kept around between messages.
const POOL_LIMIT: usize = 64;

impl MessagesPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_message(
        &mut self,
        capacity: usize,
        address_key: impl Into<String>,
        delivery: DeliveryGuarantee,
    ) -> DistributedMessage {
        let mut content = self.free.pop().unwrap_or_default();
        content.reset();
        content.reserve(capacity);
        DistributedMessage::new(address_key, content, delivery)
    }

    pub fn release(&mut self, message: DistributedMessage) {
        if self.free.len() < POOL_LIMIT {
            self.free.push(message.content);
        }
    }
}
