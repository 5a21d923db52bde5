use thiserror::Error;

use crate::messaging::bytes_stack::BytesStackError;

/// Errors that can occur while routing and coding distributed messages.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum MessagingError {
    /// A message cannot be routed without an address key.
    #[error("Cannot send message with empty address key")]
    EmptyAddressKey,

    /// The key was used before it was bound to an identifier. This is a
    /// caller contract violation: the sender registered too early.
    #[error("Cannot resolve identifier for address key '{key}'. Check if the key is bound to an identifier before calling this method")]
    UnresolvedKey { key: String },

    /// Message content does not match the expected wire layout. The message
    /// is dropped, the connection is preserved.
    #[error("Malformed message content: {0}")]
    Malformed(#[from] BytesStackError),

    /// Unknown protocol command tag in the message content.
    #[error("Unknown command type {value} in message content")]
    UnknownCommandType { value: i32 },

    /// Application command payload could not be decoded.
    #[error("Failed to decode command payload: {reason}")]
    CommandDecode { reason: String },

    /// Application command payload could not be encoded.
    #[error("Failed to encode command payload: {reason}")]
    CommandEncode { reason: String },
}
