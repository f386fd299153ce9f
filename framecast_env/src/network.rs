//! Frame transport abstraction between primary and secondary nodes.

use crate::error::EnvError;
use crate::types::{FrameEnvelope, NodeId, PeerLink};
use std::sync::Arc;

/// Abstraction for frame I/O between framecast nodes.
///
/// Every method is non-blocking: the tick thread calls `send` and
/// `try_recv` once per frame and must never wait on the network. Backends
/// hand the bytes to background tasks and report failures through the
/// peer's [`Liveness`](crate::Liveness).
///
/// # Implementations
///
/// - **Production**: TCP with length-prefixed envelopes (`TcpBackend`)
/// - **Simulation**: in-memory router with fault injection
///
/// # Packet Flow
///
/// ```text
/// Primary                    Network                 Secondary
///   |                           |                          |
///   |-- send(S, envelope) ----->|                          |
///   |                           |-- [I/O task] ----------->|
///   |                           |                          |-- try_recv() -> envelope
/// ```
pub trait FrameTransport: Send + Sync + 'static {
    /// Returns this node's ID.
    fn local_id(&self) -> NodeId;

    /// Returns every remote node the transport currently knows about,
    /// including ones that have since disconnected.
    fn peers(&self) -> Vec<PeerLink>;

    /// Queues an envelope for delivery to `target`.
    ///
    /// # Returns
    /// * `Ok(())` - Envelope accepted by the transport
    /// * `Err(_)` - Immediate failure; see [`EnvError::status`]
    ///
    /// # Note
    /// Success does not guarantee delivery; asynchronous write failures flip
    /// the peer's liveness to `Disconnected` instead.
    fn send(&self, target: NodeId, envelope: FrameEnvelope) -> Result<(), EnvError>;

    /// Non-blocking poll for the next inbound envelope.
    fn try_recv(&self) -> Option<(NodeId, FrameEnvelope)>;
}

/// Opens transports for the two node roles.
pub trait TransportBackend: Send + Sync {
    /// Opens the listening endpoint secondaries connect to.
    ///
    /// Fails synchronously if the endpoint cannot be opened.
    fn listen(&self, local_id: NodeId, port: u16) -> Result<Arc<dyn FrameTransport>, EnvError>;

    /// Starts connecting to a primary.
    ///
    /// Must return immediately; the connection is established (and
    /// re-established) in the background. The returned transport reports
    /// the primary as its single peer.
    fn connect(
        &self,
        local_id: NodeId,
        host: &str,
        port: u16,
    ) -> Result<Arc<dyn FrameTransport>, EnvError>;
}

/// Fault injection for simulated networks.
pub trait NetworkController: Send + Sync {
    /// Creates a network partition between two node sets.
    fn partition(&self, group_a: &[NodeId], group_b: &[NodeId]);

    /// Heals all partitions and link failures.
    fn heal_all(&self);

    /// Makes every send from `from` to `to` fail until healed.
    fn fail_link(&self, from: NodeId, to: NodeId);
}
