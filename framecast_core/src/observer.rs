//! World observer: per-frame snapshot broadcast to external clients.

use crate::episode::{Session, SessionId};
use crate::role::NodeRole;
use crate::world::{ActorId, Transform};
use nalgebra::Vector3;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::trace;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActorSnapshot {
    pub id: ActorId,
    pub type_id: String,
    pub transform: Transform,
    pub velocity: Vector3<f64>,
}

/// Read-only copy of a session's state at the end of a frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorldSnapshot {
    pub session: SessionId,
    pub role: NodeRole,
    pub frame: u64,
    pub elapsed_seconds: f64,
    pub actors: Vec<ActorSnapshot>,
}

impl WorldSnapshot {
    pub fn capture(session: &Session) -> Self {
        Self {
            session: session.id(),
            role: session.role(),
            frame: session.frame(),
            elapsed_seconds: session.clock().elapsed_seconds(),
            actors: session
                .world()
                .actors()
                .map(|actor| ActorSnapshot {
                    id: actor.id,
                    type_id: actor.type_id.clone(),
                    transform: actor.transform,
                    velocity: actor.velocity,
                })
                .collect(),
        }
    }
}

/// What every external client receives once per frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BroadcastEnvelope {
    pub snapshot: WorldSnapshot,
    pub delta_seconds: f64,
    /// Map or streaming topology changed since the last broadcast
    pub topology_changed: bool,
    /// Lighting or other visual state awaits an update
    pub pending_visual_update: bool,
}

/// Fire-and-forget consumer of broadcasts.
pub trait BroadcastSink: Send {
    fn deliver(&mut self, envelope: &BroadcastEnvelope);
}

/// Fans broadcasts out over a tokio broadcast channel.
///
/// Slow subscribers lag and skip frames; the tick never waits on them.
pub struct BroadcastChannelSink {
    sender: broadcast::Sender<Arc<BroadcastEnvelope>>,
}

impl BroadcastChannelSink {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<BroadcastEnvelope>> {
        self.sender.subscribe()
    }

    pub fn sender(&self) -> broadcast::Sender<Arc<BroadcastEnvelope>> {
        self.sender.clone()
    }
}

impl BroadcastSink for BroadcastChannelSink {
    fn deliver(&mut self, envelope: &BroadcastEnvelope) {
        if self.sender.send(Arc::new(envelope.clone())).is_err() {
            trace!("Frame {}: no subscribers", envelope.snapshot.frame);
        }
    }
}

#[derive(Default)]
pub struct WorldObserver {
    sinks: Vec<Box<dyn BroadcastSink>>,
    broadcasts: u64,
}

impl WorldObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_sink(&mut self, sink: Box<dyn BroadcastSink>) {
        self.sinks.push(sink);
    }

    pub fn broadcasts(&self) -> u64 {
        self.broadcasts
    }

    /// Pushes the session's snapshot to every sink. Never mutates the session.
    pub fn broadcast_tick(
        &mut self,
        session: &Session,
        delta_seconds: f64,
        topology_changed: bool,
        pending_visual_update: bool,
    ) {
        self.broadcasts += 1;
        if self.sinks.is_empty() {
            return;
        }

        let envelope = BroadcastEnvelope {
            snapshot: WorldSnapshot::capture(session),
            delta_seconds,
            topology_changed,
            pending_visual_update,
        };
        for sink in &mut self.sinks {
            sink.deliver(&envelope);
        }
    }
}
