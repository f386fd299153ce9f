//! Common types for the framecast environment abstraction.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// Unique identifier for a framecast node (primary or secondary).
///
/// Uses UUID v4 for global uniqueness without coordination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub Uuid);

impl NodeId {
    /// Creates a new random NodeId.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates a deterministic NodeId from a seed (for simulation).
    pub fn from_seed(seed: u64) -> Self {
        let mut bytes = [0u8; 16];
        bytes[0..8].copy_from_slice(&seed.to_le_bytes());
        bytes[8..16].copy_from_slice(&seed.wrapping_mul(0x517cc1b727220a95).to_le_bytes());
        Self(Uuid::from_bytes(bytes))
    }

    /// Rebuilds a NodeId from the 16 handshake bytes.
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    /// Returns the raw bytes sent during the transport handshake.
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Show first 8 chars for readability
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// Envelope carrying one serialized frame delta between nodes.
///
/// The payload is opaque to the transport; only the frame engine knows how
/// to decode it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameEnvelope {
    /// Frame number the payload was captured on (primary clock)
    pub frame: u64,

    /// Serialized frame delta bytes
    pub payload: Vec<u8>,

    /// Sender's monotonic clock when the envelope was created
    pub sent_at_ms: u64,
}

impl FrameEnvelope {
    pub fn new(frame: u64, payload: Vec<u8>, sent_at_ms: u64) -> Self {
        Self {
            frame,
            payload,
            sent_at_ms,
        }
    }

    /// Returns the payload size in bytes.
    pub fn size(&self) -> usize {
        self.payload.len()
    }
}

/// Liveness of a link between two nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LinkState {
    Connecting,
    Connected,
    Disconnected,
}

impl LinkState {
    fn to_u8(self) -> u8 {
        match self {
            LinkState::Connecting => 0,
            LinkState::Connected => 1,
            LinkState::Disconnected => 2,
        }
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => LinkState::Connecting,
            1 => LinkState::Connected,
            _ => LinkState::Disconnected,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LinkState::Connecting => "connecting",
            LinkState::Connected => "connected",
            LinkState::Disconnected => "disconnected",
        }
    }
}

/// Shared, lock-free liveness cell.
///
/// Written by network I/O tasks and read by the tick thread every frame, so
/// every access goes through an atomic.
#[derive(Debug, Clone)]
pub struct Liveness(Arc<AtomicU8>);

impl Liveness {
    pub fn new(state: LinkState) -> Self {
        Self(Arc::new(AtomicU8::new(state.to_u8())))
    }

    pub fn get(&self) -> LinkState {
        LinkState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn set(&self, state: LinkState) {
        self.0.store(state.to_u8(), Ordering::Release);
    }

    pub fn is_connected(&self) -> bool {
        self.get() == LinkState::Connected
    }

    /// True if both handles point at the same cell, i.e. the same link.
    pub fn same_cell(&self, other: &Liveness) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Default for Liveness {
    fn default() -> Self {
        Self::new(LinkState::Connecting)
    }
}

/// A transport-level view of one remote node.
#[derive(Debug, Clone)]
pub struct PeerLink {
    pub id: NodeId,

    /// Remote address as the transport knows it (socket address or sim name)
    pub address: String,

    pub liveness: Liveness,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_id_from_seed_is_stable() {
        assert_eq!(NodeId::from_seed(7), NodeId::from_seed(7));
        assert_ne!(NodeId::from_seed(7), NodeId::from_seed(8));
    }

    #[test]
    fn test_node_id_handshake_bytes() {
        let id = NodeId::from_seed(99);
        assert_eq!(NodeId::from_bytes(*id.as_bytes()), id);
    }

    #[test]
    fn test_liveness_is_shared_between_clones() {
        let a = Liveness::new(LinkState::Connecting);
        let b = a.clone();

        b.set(LinkState::Connected);
        assert!(a.is_connected());

        a.set(LinkState::Disconnected);
        assert_eq!(b.get(), LinkState::Disconnected);
        assert!(a.same_cell(&b));
        assert!(!a.same_cell(&Liveness::new(LinkState::Disconnected)));
    }
}
