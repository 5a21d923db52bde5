use std::cell::RefCell;
use std::net::SocketAddr;
use std::rc::Rc;

use crate::messaging::message::DistributedMessage;
use crate::messaging::messages_manager::MessagesManager;
use crate::transport::PeerInfo;

/// An addressable endpoint of the replication graph.
///
/// Implementors receive every message routed to their address key and may
/// send or register further objects from inside the callback; the manager
/// guarantees its registry is not borrowed during dispatch. Endpoints that
/// replay state to newly connected peers override
/// [`MessageReceiver::unicast_initial_messages`].
pub trait MessageReceiver {
    /// Address key, stable for the lifetime of the registration.
    fn key(&self) -> &str;

    fn receive_message(
        &mut self,
        sender: &PeerInfo,
        message: &mut DistributedMessage,
        messages: &mut MessagesManager,
    );

    /// Replays the state a newly connected peer needs, in registration
    /// order relative to the other endpoints.
    fn unicast_initial_messages(&mut self, _endpoint: SocketAddr, _messages: &mut MessagesManager) {
    }
}

/// Shared handle under which endpoints are registered.
pub type SharedReceiver = Rc<RefCell<dyn MessageReceiver>>;
