//! framecast Environment Abstraction Layer
//!
//! This crate provides the "Sans-IO" seam between the frame engine and the
//! outside world, so the same engine runs over real sockets (**Production**,
//! tokio) and over an in-memory router (**Simulation**).
//!
//! # Core Concept
//!
//! The engine's tick loop is synchronous and single-threaded. Everything that
//! may block lives behind this crate:
//! - Time (`now()`, `sleep()`) for envelope timestamps and reconnect backoff
//! - Frame transport (`send()`, `try_recv()`), both non-blocking
//! - Link liveness, shared atomically between I/O tasks and the tick thread
//!
//! # Example
//!
//! ```ignore
//! use framecast_env::{FrameTransport, TransportBackend, NodeId};
//!
//! let transport = backend.listen(NodeId::new(), 2002)?;
//! for peer in transport.peers() {
//!     if peer.liveness.is_connected() {
//!         transport.send(peer.id, envelope.clone())?;
//!     }
//! }
//! ```

mod context;
mod error;
mod network;
mod tcp;
mod tokio_impl;
mod types;

pub use context::NodeContext;
pub use error::{io_status, status_of, EnvError, TransportStatus};
pub use network::{FrameTransport, NetworkController, TransportBackend};
pub use tcp::{decode_envelope, encode_envelope, TcpBackend, TcpPrimary, MAX_FRAME_BYTES};
pub use tokio_impl::TokioContext;
pub use types::{FrameEnvelope, LinkState, Liveness, NodeId, PeerLink};
