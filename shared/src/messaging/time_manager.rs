use crate::messaging::bytes_stack::BytesStackError;
use crate::messaging::message::DistributedMessage;
use crate::types::{now_ticks, TimeTicks, BYTES_PER_TIMESTAMP};

/// Codes and decodes the wall-clock timestamps of distributed messages.
///
/// The sender pushes its current time as ticks since the fixed epoch; the
/// receiver pops it and additionally maps it into the local clock domain
/// using the sending peer's measured clock delta
/// (`remote clock - local clock`).
#[derive(Default)]
pub struct TimeManager;

impl TimeManager {
    pub fn new() -> Self {
        Self
    }

    /// Ticks of the given timestamp since the fixed epoch.
    pub fn get_time_difference(&self, timestamp: TimeTicks) -> i64 {
        timestamp
    }

    /// Timestamp reconstructed from a received time difference.
    pub fn get_timestamp(&self, time_difference: i64) -> TimeTicks {
        time_difference
    }

    /// Pushes the current send time on top of the message content.
    pub fn push_time_difference(&self, message: &mut DistributedMessage) {
        message
            .content
            .push_long(self.get_time_difference(now_ticks()), BYTES_PER_TIMESTAMP);
    }

    /// Pops the send time from the message content and fills in both
    /// timestamp views.
    pub fn pop_time_difference(
        &self,
        message: &mut DistributedMessage,
        remote_time_ticks_difference: i64,
    ) -> Result<(), BytesStackError> {
        let difference = message.content.pop_long(BYTES_PER_TIMESTAMP)?;
        message.timestamp = self.get_timestamp(difference);
        message.server_timestamp = message.timestamp - remote_time_ticks_difference;
        Ok(())
    }
}
