//! Simulated frame transport with fault injection.

use framecast_env::{
    EnvError, FrameEnvelope, FrameTransport, LinkState, Liveness, NetworkController, NodeId,
    PeerLink, TransportBackend,
};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

/// Envelopes a node may have waiting before sends to it report backpressure.
pub const DEFAULT_INBOX_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouterStats {
    pub delivered: u64,
    /// Refused by a partition or failed link
    pub dropped: u64,
    pub backpressured: u64,
    pub corrupted: u64,
}

struct Endpoint {
    inbox: VecDeque<(NodeId, FrameEnvelope)>,
    /// For a secondary: its link to the primary, seen from both ends
    liveness: Liveness,
}

#[derive(Default)]
struct RouterState {
    primary: Option<NodeId>,
    endpoints: BTreeMap<NodeId, Endpoint>,
    partitions: Vec<(Vec<NodeId>, Vec<NodeId>)>,
    failed_links: BTreeSet<(NodeId, NodeId)>,
    corrupt_next: BTreeSet<NodeId>,
    stats: RouterStats,
}

impl RouterState {
    fn can_communicate(&self, from: NodeId, to: NodeId) -> bool {
        for (group_a, group_b) in &self.partitions {
            let from_in_a = group_a.contains(&from);
            let from_in_b = group_b.contains(&from);
            let to_in_a = group_a.contains(&to);
            let to_in_b = group_b.contains(&to);

            if (from_in_a && to_in_b) || (from_in_b && to_in_a) {
                return false;
            }
        }
        true
    }
}

/// In-memory network shared by every node of a cluster.
///
/// Delivery is immediate and ordered; iteration is over ordered maps, so a
/// run is fully determined by the order of calls.
#[derive(Clone)]
pub struct SimRouter {
    state: Arc<Mutex<RouterState>>,
    inbox_capacity: usize,
}

impl SimRouter {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(RouterState::default())),
            inbox_capacity: DEFAULT_INBOX_CAPACITY,
        }
    }

    pub fn with_inbox_capacity(mut self, capacity: usize) -> Self {
        self.inbox_capacity = capacity.max(1);
        self
    }

    fn lock(&self) -> MutexGuard<'_, RouterState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn can_communicate(&self, from: NodeId, to: NodeId) -> bool {
        self.lock().can_communicate(from, to)
    }

    /// Garbles the next envelope delivered to `target`.
    pub fn corrupt_next_delivery(&self, target: NodeId) {
        self.lock().corrupt_next.insert(target);
    }

    pub fn stats(&self) -> RouterStats {
        self.lock().stats
    }

    /// Liveness of a secondary's link, if the node is known.
    pub fn link_state(&self, node: NodeId) -> Option<LinkState> {
        self.lock().endpoints.get(&node).map(|e| e.liveness.get())
    }

    fn register(&self, id: NodeId, primary: bool) -> Arc<dyn FrameTransport> {
        let mut state = self.lock();
        let initial = if primary || state.primary.is_some() {
            LinkState::Connected
        } else {
            LinkState::Connecting
        };
        state.endpoints.insert(
            id,
            Endpoint {
                inbox: VecDeque::new(),
                liveness: Liveness::new(initial),
            },
        );

        if primary {
            state.primary = Some(id);
            // Secondaries that were waiting come up now
            for endpoint in state.endpoints.values() {
                if endpoint.liveness.get() == LinkState::Connecting {
                    endpoint.liveness.set(LinkState::Connected);
                }
            }
        }

        Arc::new(SimNetwork {
            local_id: id,
            router: self.clone(),
        })
    }
}

impl Default for SimRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl TransportBackend for SimRouter {
    fn listen(&self, local_id: NodeId, port: u16) -> Result<Arc<dyn FrameTransport>, EnvError> {
        if let Some(existing) = self.lock().primary {
            if existing != local_id {
                return Err(EnvError::BindError {
                    addr: format!("sim:{}", port),
                    reason: format!("already bound by {}", existing),
                });
            }
        }
        Ok(self.register(local_id, true))
    }

    fn connect(
        &self,
        local_id: NodeId,
        _host: &str,
        _port: u16,
    ) -> Result<Arc<dyn FrameTransport>, EnvError> {
        Ok(self.register(local_id, false))
    }
}

impl NetworkController for SimRouter {
    fn partition(&self, group_a: &[NodeId], group_b: &[NodeId]) {
        self.lock()
            .partitions
            .push((group_a.to_vec(), group_b.to_vec()));
    }

    /// Heals everything; dropped secondary links reconnect immediately.
    fn heal_all(&self) {
        let mut state = self.lock();
        state.partitions.clear();
        state.failed_links.clear();
        if state.primary.is_some() {
            for endpoint in state.endpoints.values() {
                if endpoint.liveness.get() != LinkState::Connected {
                    endpoint.liveness.set(LinkState::Connected);
                }
            }
        }
    }

    fn fail_link(&self, from: NodeId, to: NodeId) {
        self.lock().failed_links.insert((from, to));
    }
}

/// One node's view of the router.
pub struct SimNetwork {
    local_id: NodeId,
    router: SimRouter,
}

impl FrameTransport for SimNetwork {
    fn local_id(&self) -> NodeId {
        self.local_id
    }

    fn peers(&self) -> Vec<PeerLink> {
        let state = self.router.lock();
        match state.primary {
            Some(primary) if primary == self.local_id => state
                .endpoints
                .iter()
                .filter(|(id, _)| **id != self.local_id)
                .map(|(id, endpoint)| PeerLink {
                    id: *id,
                    address: format!("sim://{}", id),
                    liveness: endpoint.liveness.clone(),
                })
                .collect(),
            Some(primary) => state
                .endpoints
                .get(&self.local_id)
                .map(|endpoint| PeerLink {
                    id: primary,
                    address: format!("sim://{}", primary),
                    liveness: endpoint.liveness.clone(),
                })
                .into_iter()
                .collect(),
            None => Vec::new(),
        }
    }

    fn send(&self, target: NodeId, mut envelope: FrameEnvelope) -> Result<(), EnvError> {
        let mut guard = self.router.lock();
        let state = &mut *guard;
        let from = self.local_id;

        if state.failed_links.contains(&(from, target)) {
            state.stats.dropped += 1;
            return Err(EnvError::closed(target));
        }
        if !state.can_communicate(from, target) {
            state.stats.dropped += 1;
            return Err(EnvError::unreachable(target));
        }

        let corrupt = state.corrupt_next.remove(&target);
        let capacity = self.router.inbox_capacity;
        let Some(endpoint) = state.endpoints.get_mut(&target) else {
            return Err(EnvError::unreachable(target));
        };
        if endpoint.inbox.len() >= capacity {
            state.stats.backpressured += 1;
            return Err(EnvError::Backpressure(target.to_string()));
        }

        if corrupt {
            for byte in envelope.payload.iter_mut().take(8) {
                *byte ^= 0xA5;
            }
            debug!("Corrupted frame {} on its way to {}", envelope.frame, target);
        }
        endpoint.inbox.push_back((from, envelope));

        if corrupt {
            state.stats.corrupted += 1;
        }
        state.stats.delivered += 1;
        Ok(())
    }

    fn try_recv(&self) -> Option<(NodeId, FrameEnvelope)> {
        self.router
            .lock()
            .endpoints
            .get_mut(&self.local_id)?
            .inbox
            .pop_front()
    }
}
