use std::time::{SystemTime, UNIX_EPOCH};

/// Compact numeric alias for an address key, valid for the lifetime of one
/// identifier register instance.
pub type Identifier = i32;

/// Wall-clock ticks in milliseconds since the Unix epoch.
pub type TimeTicks = i64;

/// Bytes used to encode an [`Identifier`] on the wire.
pub const BYTES_PER_ID: usize = 4;

/// Bytes used to encode a message timestamp on the wire.
pub const BYTES_PER_TIMESTAMP: usize = 8;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HostType {
    Master,
    Client,
}

impl HostType {
    pub fn assigns_ids(self) -> bool {
        match self {
            HostType::Master => true,
            HostType::Client => false,
        }
    }
}

/// Current wall-clock time in [`TimeTicks`].
pub fn now_ticks() -> TimeTicks {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis() as TimeTicks)
        .unwrap_or(0)
}
