//! In-process loopback transport for unit tests.

use framecast_env::{
    EnvError, FrameEnvelope, FrameTransport, LinkState, Liveness, NodeId, PeerLink,
    TransportBackend,
};
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct HubState {
    primary: Option<NodeId>,
    endpoints: BTreeMap<NodeId, Endpoint>,
    failing: HashSet<NodeId>,
    refuse_listen: bool,
}

struct Endpoint {
    inbox: VecDeque<(NodeId, FrameEnvelope)>,
    liveness: Liveness,
}

/// Every transport opened through one hub can reach every other.
#[derive(Clone, Default)]
pub struct LoopbackHub {
    state: Arc<Mutex<HubState>>,
}

impl LoopbackHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn refuse_listen(&self, refuse: bool) {
        self.state.lock().unwrap().refuse_listen = refuse;
    }

    /// Sends to `peer` fail fatally from now on.
    pub fn fail_sends_to(&self, peer: NodeId) {
        self.state.lock().unwrap().failing.insert(peer);
    }

    /// Queues raw bytes for `target` as if `from` had sent them.
    pub fn inject(&self, from: NodeId, target: NodeId, envelope: FrameEnvelope) {
        if let Some(endpoint) = self.state.lock().unwrap().endpoints.get_mut(&target) {
            endpoint.inbox.push_back((from, envelope));
        }
    }

    fn register(&self, id: NodeId) -> Arc<dyn FrameTransport> {
        self.state.lock().unwrap().endpoints.insert(
            id,
            Endpoint {
                inbox: VecDeque::new(),
                liveness: Liveness::new(LinkState::Connected),
            },
        );
        Arc::new(LoopbackTransport {
            id,
            hub: self.clone(),
        })
    }
}

impl TransportBackend for LoopbackHub {
    fn listen(&self, local_id: NodeId, port: u16) -> Result<Arc<dyn FrameTransport>, EnvError> {
        if self.state.lock().unwrap().refuse_listen {
            return Err(EnvError::BindError {
                addr: format!("loopback:{}", port),
                reason: "refused".to_string(),
            });
        }
        self.state.lock().unwrap().primary = Some(local_id);
        Ok(self.register(local_id))
    }

    fn connect(
        &self,
        local_id: NodeId,
        _host: &str,
        _port: u16,
    ) -> Result<Arc<dyn FrameTransport>, EnvError> {
        Ok(self.register(local_id))
    }
}

struct LoopbackTransport {
    id: NodeId,
    hub: LoopbackHub,
}

impl FrameTransport for LoopbackTransport {
    fn local_id(&self) -> NodeId {
        self.id
    }

    fn peers(&self) -> Vec<PeerLink> {
        let state = self.hub.state.lock().unwrap();
        let is_primary = state.primary == Some(self.id);
        state
            .endpoints
            .iter()
            .filter(|(id, _)| **id != self.id)
            .filter(|(id, _)| is_primary || state.primary == Some(**id))
            .map(|(id, endpoint)| PeerLink {
                id: *id,
                address: "loopback".to_string(),
                liveness: endpoint.liveness.clone(),
            })
            .collect()
    }

    fn send(&self, target: NodeId, envelope: FrameEnvelope) -> Result<(), EnvError> {
        let mut state = self.hub.state.lock().unwrap();
        if state.failing.contains(&target) {
            return Err(EnvError::closed(target));
        }
        let from = self.id;
        match state.endpoints.get_mut(&target) {
            Some(endpoint) => {
                endpoint.inbox.push_back((from, envelope));
                Ok(())
            }
            None => Err(EnvError::unreachable(target)),
        }
    }

    fn try_recv(&self) -> Option<(NodeId, FrameEnvelope)> {
        self.hub
            .state
            .lock()
            .unwrap()
            .endpoints
            .get_mut(&self.id)?
            .inbox
            .pop_front()
    }
}
