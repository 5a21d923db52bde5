use log::error;

use simnet_shared::PeerId;

/// Initial master machine load.
const INITIAL_MASTER_LOAD: f32 = 0.15;

/// Greedy load balancer distributing computational tasks between the
/// cluster machines.
///
/// Always appends to the currently lowest loaded registered peer, ties
/// broken by registration order. Advisory only: it does not guarantee an
/// even final distribution.
pub struct NetworkLoadBalancer {
    master_load: f32,
    client_loads: Vec<(PeerId, f32)>,
}

impl NetworkLoadBalancer {
    pub fn new() -> Self {
        Self {
            master_load: INITIAL_MASTER_LOAD,
            client_loads: Vec::new(),
        }
    }

    pub fn master_load(&self) -> f32 {
        self.master_load
    }

    pub fn client_load(&self, peer: PeerId) -> Option<f32> {
        self.client_loads
            .iter()
            .find(|(registered, _)| *registered == peer)
            .map(|(_, load)| *load)
    }

    pub fn client_connected(&mut self, peer: PeerId) {
        if self.client_loads.iter().any(|(registered, _)| *registered == peer) {
            error!("Client {peer:?} is already registered in the load balancer.");
            return;
        }
        self.client_loads.push((peer, 0.0));
    }

    pub fn client_disconnected(&mut self, peer: PeerId) {
        self.client_loads.retain(|(registered, _)| *registered != peer);
    }

    pub fn reset(&mut self) {
        self.master_load = INITIAL_MASTER_LOAD;
        self.client_loads.clear();
    }

    /// Appends the load to the machine with the lowest current load.
    /// Returns the peer that received it, or `None` when the master did.
    pub fn append_load(&mut self, load: f32, include_master: bool) -> Option<PeerId> {
        let lowest = self
            .client_loads
            .iter()
            .enumerate()
            .min_by(|(_, (_, first)), (_, (_, second))| first.total_cmp(second))
            .map(|(index, (peer, current))| (index, *peer, *current));

        if include_master && lowest.map_or(true, |(_, _, current)| self.master_load < current) {
            self.master_load += load;
            return None;
        }

        let Some((index, peer, _)) = lowest else {
            error!(
                "NetworkLoadBalancer does not have any client registered. Load appended to the master machine."
            );
            self.master_load += load;
            return None;
        };
        self.client_loads[index].1 += load;
        Some(peer)
    }

    /// Appends the load directly to the master machine.
    pub fn append_master_load(&mut self, load: f32) {
        self.master_load += load;
    }

    /// Releases load previously appended to the given peer, or to the
    /// master when `None`.
    pub fn release_load(&mut self, peer: Option<PeerId>, load: f32) {
        match peer {
            None => self.master_load -= load,
            Some(peer) => {
                if let Some((_, current)) = self
                    .client_loads
                    .iter_mut()
                    .find(|(registered, _)| *registered == peer)
                {
                    *current -= load;
                }
            }
        }
    }
}

impl Default for NetworkLoadBalancer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_goes_to_the_lowest_loaded_peer_with_ties_broken_by_order() {
        let mut balancer = NetworkLoadBalancer::new();
        balancer.client_connected(PeerId(1));
        balancer.client_connected(PeerId(2));

        // tie: first registered wins
        assert_eq!(balancer.append_load(0.5, false), Some(PeerId(1)));
        assert_eq!(balancer.append_load(0.2, false), Some(PeerId(2)));
        assert_eq!(balancer.append_load(0.1, false), Some(PeerId(2)));
        assert_eq!(balancer.client_load(PeerId(1)), Some(0.5));
        assert_eq!(balancer.client_load(PeerId(2)), Some(0.3));
    }

    #[test]
    fn master_receives_load_only_when_included_and_lowest() {
        let mut balancer = NetworkLoadBalancer::new();
        balancer.client_connected(PeerId(1));

        // client at 0.0 is below the initial master load
        assert_eq!(balancer.append_load(0.4, true), Some(PeerId(1)));
        // now the master (0.15) is the lowest
        assert_eq!(balancer.append_load(0.1, true), None);
        assert!((balancer.master_load() - 0.25).abs() < f32::EPSILON);
    }

    #[test]
    fn load_falls_back_to_the_master_without_clients() {
        let mut balancer = NetworkLoadBalancer::new();
        assert_eq!(balancer.append_load(0.3, false), None);
        assert!((balancer.master_load() - (INITIAL_MASTER_LOAD + 0.3)).abs() < f32::EPSILON);
    }

    #[test]
    fn released_load_returns_to_the_owner() {
        let mut balancer = NetworkLoadBalancer::new();
        balancer.client_connected(PeerId(1));
        assert_eq!(balancer.append_load(0.6, false), Some(PeerId(1)));
        balancer.release_load(Some(PeerId(1)), 0.6);
        assert_eq!(balancer.client_load(PeerId(1)), Some(0.0));

        balancer.append_master_load(0.2);
        balancer.release_load(None, 0.2);
        assert!((balancer.master_load() - INITIAL_MASTER_LOAD).abs() < f32::EPSILON);
    }

    #[test]
    fn disconnected_client_no_longer_receives_load() {
        let mut balancer = NetworkLoadBalancer::new();
        balancer.client_connected(PeerId(1));
        balancer.client_disconnected(PeerId(1));
        assert_eq!(balancer.append_load(0.1, false), None);
    }
}
