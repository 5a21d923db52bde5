use std::net::SocketAddr;

use log::{debug, warn};

use simnet_shared::{ConnectionManager, NetworkSettings, TimeTicks, TransportError};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum RoutineOutcome {
    InProgress,
    TimedOut,
}

/// Tick-driven retry loop over all known master endpoints.
///
/// Checks once per tick and never blocks; safe to drop at any tick when the
/// connection is stopped externally. Loopback addresses are skipped when
/// the endpoint set also names other machines.
pub(crate) struct ConnectRoutine {
    endpoints: Vec<SocketAddr>,
    attempts: Vec<u32>,
    next_index: usize,
    max_retries: u32,
    retry_interval: i64,
    next_attempt_at: TimeTicks,
    deadline: TimeTicks,
    allow_loopback: bool,
}

impl ConnectRoutine {
    pub fn new(endpoints: Vec<SocketAddr>, settings: &NetworkSettings, now: TimeTicks) -> Self {
        let allow_loopback = endpoints.iter().all(|endpoint| endpoint.ip().is_loopback());
        Self {
            attempts: vec![0; endpoints.len()],
            endpoints,
            next_index: 0,
            max_retries: settings.maximum_connection_retries.max(1),
            retry_interval: settings.retry_interval_ms.max(1),
            next_attempt_at: now,
            deadline: now + settings.timeout_ms,
            allow_loopback,
        }
    }

    pub fn endpoints(&self) -> &[SocketAddr] {
        &self.endpoints
    }

    pub fn tick(
        &mut self,
        now: TimeTicks,
        connection: &mut dyn ConnectionManager,
        identifier: &str,
    ) -> RoutineOutcome {
        if now >= self.deadline {
            return RoutineOutcome::TimedOut;
        }
        if now < self.next_attempt_at {
            return RoutineOutcome::InProgress;
        }
        for _ in 0..self.endpoints.len() {
            let index = self.next_index % self.endpoints.len();
            self.next_index = self.next_index.wrapping_add(1);
            let endpoint = self.endpoints[index];
            if endpoint.ip().is_loopback() && !self.allow_loopback {
                continue;
            }
            if self.attempts[index] >= self.max_retries {
                continue;
            }
            self.attempts[index] += 1;
            self.next_attempt_at = now + self.retry_interval;
            match connection.connect(endpoint, identifier) {
                Ok(_) => {}
                Err(TransportError::AlreadyConnecting { .. }) => {}
                Err(error) => {
                    debug!("Connection attempt to the master at '{endpoint}' failed: {error}");
                }
            }
            return RoutineOutcome::InProgress;
        }
        if self.endpoints.is_empty() {
            warn!("Connection routine has no master endpoints to try.");
        }
        // every endpoint exhausted its retries; the deadline decides
        RoutineOutcome::InProgress
    }
}
