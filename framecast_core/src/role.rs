//! Role negotiation and per-role session state.
//!
//! A process is either the primary (authoritative, owns the clock and the
//! command server) or a secondary (follows the primary's frame deltas). The
//! role is read from configuration once per session, before any socket is
//! opened, and never changes until the next session.

use crate::command::{CommandQueue, CommandServer};
use crate::error::EngineError;
use crate::frame_data::ActorIdMap;
use crate::settings::EngineConfig;
use framecast_env::{FrameTransport, LinkState, Liveness, NodeId, TransportBackend};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, OnceLock};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeRole {
    Primary,
    Secondary,
}

impl NodeRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeRole::Primary => "primary",
            NodeRole::Secondary => "secondary",
        }
    }
}

/// A configured primary address makes this process a secondary.
pub fn resolve_role(config: &EngineConfig) -> NodeRole {
    if config.has_primary() {
        NodeRole::Secondary
    } else {
        NodeRole::Primary
    }
}

/// Resolves the role at most once per session.
///
/// Later calls, from any thread, observe the first answer even if the
/// configuration they pass has changed since.
#[derive(Debug, Default)]
pub struct RoleNegotiator {
    resolved: OnceLock<NodeRole>,
}

impl RoleNegotiator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn resolve(&self, config: &EngineConfig) -> NodeRole {
        *self.resolved.get_or_init(|| resolve_role(config))
    }

    pub fn role(&self) -> Option<NodeRole> {
        self.resolved.get().copied()
    }
}

/// One remote node as seen from the tick thread.
#[derive(Debug, Clone)]
pub struct Connection {
    pub peer: NodeId,
    pub address: String,
    liveness: Liveness,

    /// Peer's mirror can't be trusted; send it full state next
    needs_keyframe: bool,
}

impl Connection {
    /// A new connection starts out needing a keyframe.
    pub fn new(peer: NodeId, address: impl Into<String>, liveness: Liveness) -> Self {
        Self {
            peer,
            address: address.into(),
            liveness,
            needs_keyframe: true,
        }
    }

    pub fn needs_keyframe(&self) -> bool {
        self.needs_keyframe
    }

    /// The peer missed a frame or lost its link.
    pub fn request_keyframe(&mut self) {
        self.needs_keyframe = true;
    }

    pub fn keyframe_delivered(&mut self) {
        self.needs_keyframe = false;
    }

    pub fn state(&self) -> LinkState {
        self.liveness.get()
    }

    pub fn is_connected(&self) -> bool {
        self.liveness.is_connected()
    }

    /// Shared with the transport, so the I/O side sees it too.
    pub fn mark_disconnected(&self) {
        self.liveness.set(LinkState::Disconnected);
    }
}

/// Connections ordered by peer id, so fan-out order is stable.
#[derive(Debug, Clone, Default)]
pub struct ConnectionTable {
    connections: Vec<Connection>,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refreshes the table from the transport's current peer list.
    ///
    /// A reconnected peer brings a fresh liveness cell, which replaces the
    /// stale one and asks for a keyframe. Peers the transport no longer
    /// lists are dropped.
    pub fn sync(&mut self, transport: &dyn FrameTransport) {
        let links = transport.peers();

        let before = self.connections.len();
        self.connections
            .retain(|c| links.iter().any(|link| link.id == c.peer));
        if self.connections.len() < before {
            debug!("Dropped {} departed connections", before - self.connections.len());
        }

        for link in links {
            match self
                .connections
                .binary_search_by(|c| c.peer.cmp(&link.id))
            {
                Ok(idx) => {
                    let existing = &mut self.connections[idx];
                    if !existing.liveness.same_cell(&link.liveness) {
                        info!("Connection {} re-established ({})", link.id, link.address);
                        existing.liveness = link.liveness;
                        existing.request_keyframe();
                    }
                    existing.address = link.address;
                }
                Err(idx) => {
                    info!("New connection {} ({})", link.id, link.address);
                    self.connections
                        .insert(idx, Connection::new(link.id, link.address, link.liveness));
                }
            }
        }
    }

    pub fn insert(&mut self, connection: Connection) {
        match self
            .connections
            .binary_search_by(|c| c.peer.cmp(&connection.peer))
        {
            Ok(idx) => self.connections[idx] = connection,
            Err(idx) => self.connections.insert(idx, connection),
        }
    }

    pub fn get(&self, peer: NodeId) -> Option<&Connection> {
        self.connections
            .binary_search_by(|c| c.peer.cmp(&peer))
            .ok()
            .map(|idx| &self.connections[idx])
    }

    pub fn iter(&self) -> impl Iterator<Item = &Connection> {
        self.connections.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Connection> {
        self.connections.iter_mut()
    }

    /// True if a live peer is waiting for full state.
    pub fn wants_keyframe(&self) -> bool {
        self.connections
            .iter()
            .any(|c| c.is_connected() && c.needs_keyframe())
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn connected_count(&self) -> usize {
        self.connections.iter().filter(|c| c.is_connected()).count()
    }
}

pub struct PrimaryState {
    pub transport: Arc<dyn FrameTransport>,
    pub connections: ConnectionTable,
    pub commands: CommandServer,
}

pub struct SecondaryState {
    pub transport: Arc<dyn FrameTransport>,

    /// Holds the single link to the primary
    pub primary: ConnectionTable,

    /// Primary actor id -> local actor id
    pub actor_ids: ActorIdMap,
}

/// Role-specific session state; only the active role's fields exist.
pub enum RoleState {
    Primary(PrimaryState),
    Secondary(SecondaryState),
}

impl RoleState {
    /// Opens the role's network endpoint.
    ///
    /// A primary binds its secondary listener and fails if that is not
    /// possible. A secondary only starts a background connection attempt.
    pub fn establish(
        role: NodeRole,
        config: &EngineConfig,
        local_id: NodeId,
        backend: &dyn TransportBackend,
        queue: &CommandQueue,
    ) -> Result<Self, EngineError> {
        match role {
            NodeRole::Primary => {
                let transport = backend.listen(local_id, config.secondary_port)?;
                info!(
                    "Primary {} listening for secondaries on port {}",
                    local_id, config.secondary_port
                );
                Ok(RoleState::Primary(PrimaryState {
                    transport,
                    connections: ConnectionTable::new(),
                    commands: CommandServer::attach(queue, config.max_commands_per_drain),
                }))
            }
            NodeRole::Secondary => {
                let host = config.primary_address.trim();
                let transport = backend.connect(local_id, host, config.primary_port)?;
                info!(
                    "Secondary {} following primary at {}:{}",
                    local_id, host, config.primary_port
                );
                Ok(RoleState::Secondary(SecondaryState {
                    transport,
                    primary: ConnectionTable::new(),
                    actor_ids: ActorIdMap::new(),
                }))
            }
        }
    }

    pub fn role(&self) -> NodeRole {
        match self {
            RoleState::Primary(_) => NodeRole::Primary,
            RoleState::Secondary(_) => NodeRole::Secondary,
        }
    }

    pub fn transport(&self) -> &Arc<dyn FrameTransport> {
        match self {
            RoleState::Primary(state) => &state.transport,
            RoleState::Secondary(state) => &state.transport,
        }
    }

    pub fn connections(&self) -> &ConnectionTable {
        match self {
            RoleState::Primary(state) => &state.connections,
            RoleState::Secondary(state) => &state.primary,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secondary_config() -> EngineConfig {
        EngineConfig {
            primary_address: "10.0.0.4".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_resolve_role_from_primary_address() {
        assert_eq!(resolve_role(&EngineConfig::default()), NodeRole::Primary);
        assert_eq!(resolve_role(&secondary_config()), NodeRole::Secondary);

        let blank = EngineConfig {
            primary_address: "   ".to_string(),
            ..Default::default()
        };
        assert_eq!(resolve_role(&blank), NodeRole::Primary);
    }

    #[test]
    fn test_negotiator_keeps_first_answer() {
        let negotiator = RoleNegotiator::new();
        assert_eq!(negotiator.role(), None);
        assert_eq!(negotiator.resolve(&EngineConfig::default()), NodeRole::Primary);
        assert_eq!(negotiator.resolve(&secondary_config()), NodeRole::Primary);
    }

    #[test]
    fn test_negotiator_race_yields_one_role() {
        let negotiator = RoleNegotiator::new();
        let primary = EngineConfig::default();
        let secondary = secondary_config();

        let roles: Vec<NodeRole> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|i| {
                    let config = if i % 2 == 0 { &primary } else { &secondary };
                    let negotiator = &negotiator;
                    scope.spawn(move || negotiator.resolve(config))
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let first = roles[0];
        assert!(roles.iter().all(|r| *r == first));
        assert_eq!(negotiator.role(), Some(first));
    }

    #[test]
    fn test_connection_table_sorted_and_shared_liveness() {
        let mut table = ConnectionTable::new();
        let a = NodeId::from_seed(3);
        let b = NodeId::from_seed(1);
        let liveness = Liveness::new(LinkState::Connected);
        table.insert(Connection::new(a, "a", liveness.clone()));
        table.insert(Connection::new(b, "b", Liveness::new(LinkState::Connecting)));

        let order: Vec<NodeId> = table.iter().map(|c| c.peer).collect();
        let mut sorted = order.clone();
        sorted.sort();
        assert_eq!(order, sorted);

        assert_eq!(table.connected_count(), 1);
        table.get(a).unwrap().mark_disconnected();
        assert_eq!(liveness.get(), LinkState::Disconnected);
    }

    /// Fixed peer list, swapped out by the test.
    struct Peers(std::sync::Mutex<Vec<framecast_env::PeerLink>>);

    impl FrameTransport for Peers {
        fn local_id(&self) -> NodeId {
            NodeId::from_seed(0)
        }

        fn peers(&self) -> Vec<framecast_env::PeerLink> {
            self.0.lock().unwrap().clone()
        }

        fn send(
            &self,
            _target: NodeId,
            _envelope: framecast_env::FrameEnvelope,
        ) -> Result<(), framecast_env::EnvError> {
            Ok(())
        }

        fn try_recv(&self) -> Option<(NodeId, framecast_env::FrameEnvelope)> {
            None
        }
    }

    fn link(seed: u64, liveness: &Liveness) -> framecast_env::PeerLink {
        framecast_env::PeerLink {
            id: NodeId::from_seed(seed),
            address: format!("peer-{}", seed),
            liveness: liveness.clone(),
        }
    }

    #[test]
    fn test_sync_prunes_departed_peers() {
        let first = Liveness::new(LinkState::Connected);
        let second = Liveness::new(LinkState::Connected);
        let transport = Peers(std::sync::Mutex::new(vec![link(1, &first), link(2, &second)]));

        let mut table = ConnectionTable::new();
        table.sync(&transport);
        assert_eq!(table.len(), 2);

        *transport.0.lock().unwrap() = vec![link(2, &second)];
        table.sync(&transport);
        assert_eq!(table.len(), 1);
        assert!(table.get(NodeId::from_seed(1)).is_none());
    }

    #[test]
    fn test_sync_requests_keyframe_for_new_and_reconnected_peers() {
        let original = Liveness::new(LinkState::Connected);
        let transport = Peers(std::sync::Mutex::new(vec![link(1, &original)]));
        let peer = NodeId::from_seed(1);

        let mut table = ConnectionTable::new();
        table.sync(&transport);
        assert!(table.wants_keyframe());

        table.iter_mut().for_each(Connection::keyframe_delivered);
        table.sync(&transport);
        assert!(!table.get(peer).unwrap().needs_keyframe());

        *transport.0.lock().unwrap() = vec![link(1, &Liveness::new(LinkState::Connected))];
        table.sync(&transport);
        assert!(table.get(peer).unwrap().needs_keyframe());
        assert!(!table.get(peer).unwrap().liveness.same_cell(&original));
    }

    #[test]
    fn test_disconnected_peer_does_not_want_keyframe_yet() {
        let mut table = ConnectionTable::new();
        table.insert(Connection::new(
            NodeId::from_seed(1),
            "a",
            Liveness::new(LinkState::Disconnected),
        ));
        assert!(table.get(NodeId::from_seed(1)).unwrap().needs_keyframe());
        assert!(!table.wants_keyframe());
    }
}
