//! Frame data channel: capturing, shipping and applying per-frame deltas.
//!
//! # Stream format
//!
//! ```text
//! +--------+-------------+--------------+----------------+
//! | "FCFD" | version u16 | body len u32 | CBOR FrameDelta |
//! +--------+-------------+--------------+----------------+
//! ```
//!
//! Integers are big-endian. The header lets a reader reject foreign or
//! future-version data before touching the body.

use crate::episode::SessionId;
use crate::error::CodecError;
use crate::role::ConnectionTable;
use crate::world::{ActorId, Transform, World, WorldChange};
use framecast_env::{status_of, FrameEnvelope, FrameTransport, NodeId, TransportStatus};
use nalgebra::Vector3;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::io::{Cursor, Read, Write};
use tracing::{debug, error, info, warn};

pub const FRAME_DELTA_MAGIC: [u8; 4] = *b"FCFD";
pub const FRAME_DELTA_VERSION: u16 = 1;

/// Largest body a reader will allocate for.
pub const MAX_DELTA_BYTES: usize = 64 * 1024 * 1024;

const HEADER_LEN: usize = 4 + 2 + 4;

/// One authoritative change, keyed by the primary's actor ids.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FrameEvent {
    Spawn {
        actor: ActorId,
        type_id: String,
        transform: Transform,
    },
    Destroy {
        actor: ActorId,
    },
    /// Final kinematic state for the frame
    Transform {
        actor: ActorId,
        transform: Transform,
        velocity: Vector3<f64>,
    },
    Control {
        actor: ActorId,
        payload: Vec<u8>,
    },
}

/// Everything a secondary needs to reproduce one primary frame.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FrameDelta {
    /// Primary session that produced the frame
    pub session: SessionId,

    pub frame: u64,

    /// Full world state instead of the frame's changes
    pub keyframe: bool,

    pub events: Vec<FrameEvent>,
}

impl FrameDelta {
    /// Builds the delta from the world's journal.
    ///
    /// Structural changes come first, in the order they happened; kinematic
    /// and control state follow in actor id order and reflect the actor's
    /// final state for the frame.
    pub fn capture(session: SessionId, world: &World, frame: u64) -> Self {
        let mut events = Vec::with_capacity(world.changes().len());

        for change in world.changes() {
            events.push(match change {
                WorldChange::Spawned {
                    id,
                    type_id,
                    transform,
                } => FrameEvent::Spawn {
                    actor: *id,
                    type_id: type_id.clone(),
                    transform: *transform,
                },
                WorldChange::Destroyed { id } => FrameEvent::Destroy { actor: *id },
            });
        }

        for id in world.moved() {
            if let Some(actor) = world.actor(id) {
                events.push(FrameEvent::Transform {
                    actor: id,
                    transform: actor.transform,
                    velocity: actor.velocity,
                });
            }
        }

        for (id, payload) in world.controlled() {
            events.push(FrameEvent::Control {
                actor: id,
                payload: payload.clone(),
            });
        }

        Self {
            session,
            frame,
            keyframe: false,
            events,
        }
    }

    /// Builds a keyframe: every live actor, as it stands at the end of the
    /// frame. Spawns come first, then kinematic state, then controls.
    pub fn keyframe(session: SessionId, world: &World, frame: u64) -> Self {
        let mut events = Vec::with_capacity(world.len() * 2);

        events.extend(world.actors().map(|actor| FrameEvent::Spawn {
            actor: actor.id,
            type_id: actor.type_id.clone(),
            transform: actor.transform,
        }));
        events.extend(world.actors().map(|actor| FrameEvent::Transform {
            actor: actor.id,
            transform: actor.transform,
            velocity: actor.velocity,
        }));
        events.extend(world.actors().filter_map(|actor| {
            actor.control.as_ref().map(|payload| FrameEvent::Control {
                actor: actor.id,
                payload: payload.clone(),
            })
        }));

        Self {
            session,
            frame,
            keyframe: true,
            events,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn write<W: Write>(&self, writer: &mut W) -> Result<(), CodecError> {
        let body = serde_cbor::to_vec(self).map_err(|e| CodecError::Malformed(e.to_string()))?;
        if body.len() > MAX_DELTA_BYTES {
            return Err(CodecError::TooLarge(body.len()));
        }

        writer.write_all(&FRAME_DELTA_MAGIC)?;
        writer.write_all(&FRAME_DELTA_VERSION.to_be_bytes())?;
        writer.write_all(&(body.len() as u32).to_be_bytes())?;
        writer.write_all(&body)?;
        Ok(())
    }

    pub fn read<R: Read>(reader: &mut R) -> Result<Self, CodecError> {
        let mut header = [0u8; HEADER_LEN];
        reader.read_exact(&mut header)?;

        let mut magic = [0u8; 4];
        magic.copy_from_slice(&header[0..4]);
        if magic != FRAME_DELTA_MAGIC {
            return Err(CodecError::BadMagic(magic));
        }

        let version = u16::from_be_bytes([header[4], header[5]]);
        if version != FRAME_DELTA_VERSION {
            return Err(CodecError::UnsupportedVersion(version));
        }

        let len = u32::from_be_bytes([header[6], header[7], header[8], header[9]]) as usize;
        if len > MAX_DELTA_BYTES {
            return Err(CodecError::TooLarge(len));
        }

        let mut body = vec![0u8; len];
        reader.read_exact(&mut body)?;
        serde_cbor::from_slice(&body).map_err(|e| CodecError::Malformed(e.to_string()))
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, CodecError> {
        let mut out = Vec::new();
        self.write(&mut out)?;
        Ok(out)
    }

    /// Decodes exactly one delta; trailing bytes are an error.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CodecError> {
        let mut cursor = Cursor::new(bytes);
        let delta = Self::read(&mut cursor)?;
        if cursor.position() as usize != bytes.len() {
            return Err(CodecError::Malformed(format!(
                "{} trailing bytes",
                bytes.len() - cursor.position() as usize
            )));
        }
        Ok(delta)
    }
}

/// Primary actor id -> local actor id, kept by secondaries.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ActorIdMap {
    ids: BTreeMap<ActorId, ActorId>,
}

impl ActorIdMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, remote: ActorId, local: ActorId) {
        self.ids.insert(remote, local);
    }

    pub fn local(&self, remote: ActorId) -> Option<ActorId> {
        self.ids.get(&remote).copied()
    }

    pub fn remove(&mut self, remote: ActorId) -> Option<ActorId> {
        self.ids.remove(&remote)
    }

    /// (remote, local) pairs in remote id order.
    pub fn iter(&self) -> impl Iterator<Item = (ActorId, ActorId)> + '_ {
        self.ids.iter().map(|(remote, local)| (*remote, *local))
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn clear(&mut self) {
        self.ids.clear();
    }
}

/// Outcome of one fan-out.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FanOutReport {
    pub delivered: Vec<NodeId>,
    pub failed: Vec<NodeId>,
    /// Not connected at send time
    pub skipped: Vec<NodeId>,
    /// Delivered peers that received full state
    pub keyframes: Vec<NodeId>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyReport {
    pub frame: u64,
    pub applied: usize,
    /// Events naming actors this node does not know
    pub skipped: usize,
    pub keyframe: bool,
    /// The primary's session changed and the mirror was rebuilt
    pub resynced: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelStats {
    pub captured: u64,
    pub sent: u64,
    pub send_failures: u64,
    pub keyframes_sent: u64,
    pub received: u64,
    pub rejected: u64,
    pub applied: u64,
    pub resyncs: u64,
}

/// Per-session channel state.
///
/// Holds at most one captured delta (plus a keyframe when a peer needs
/// one) and their encodings; all are dropped by [`FrameDataChannel::clear`]
/// before the next frame begins.
#[derive(Debug, Default)]
pub struct FrameDataChannel {
    /// Stamped on every captured delta
    session: SessionId,
    pending: Option<FrameDelta>,
    pending_keyframe: Option<FrameDelta>,
    encoded: Vec<u8>,
    encoded_keyframe: Vec<u8>,

    /// Primary session the local mirror follows
    source: Option<SessionId>,
    last_applied: Option<u64>,
    stats: ChannelStats,
}

impl FrameDataChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_session(session: SessionId) -> Self {
        Self {
            session,
            ..Default::default()
        }
    }

    pub fn stats(&self) -> ChannelStats {
        self.stats
    }

    pub fn pending(&self) -> Option<&FrameDelta> {
        self.pending.as_ref()
    }

    pub fn last_applied(&self) -> Option<u64> {
        self.last_applied
    }

    pub fn source(&self) -> Option<SessionId> {
        self.source
    }

    /// Captures the frame's delta. Call after every actor has ticked.
    pub fn capture_frame(&mut self, world: &World, frame: u64) -> &FrameDelta {
        self.stats.captured += 1;
        self.pending
            .insert(FrameDelta::capture(self.session, world, frame))
    }

    /// Captures full state for peers whose mirror can't be trusted.
    pub fn capture_keyframe(&mut self, world: &World, frame: u64) -> &FrameDelta {
        self.pending_keyframe
            .insert(FrameDelta::keyframe(self.session, world, frame))
    }

    /// Best-effort fan-out of the captured delta.
    ///
    /// A failing connection never stops delivery to the others. Fatal
    /// failures mark the connection disconnected; retryable ones leave the
    /// link alone. Either way the peer missed a frame, so it gets the
    /// keyframe the next time one is captured, as does any peer that is
    /// skipped or asked for one.
    pub fn send_frame(
        &mut self,
        connections: &mut ConnectionTable,
        transport: &dyn FrameTransport,
        sent_at_ms: u64,
    ) -> FanOutReport {
        let mut report = FanOutReport::default();
        let Some(delta) = self.pending.as_ref() else {
            return report;
        };

        self.encoded.clear();
        if let Err(e) = delta.write(&mut self.encoded) {
            error!("Failed to encode frame {}: {}", delta.frame, e);
            for connection in connections.iter_mut() {
                connection.request_keyframe();
                report.failed.push(connection.peer);
            }
            self.stats.send_failures += report.failed.len() as u64;
            return report;
        }

        self.encoded_keyframe.clear();
        let have_keyframe = match self.pending_keyframe.as_ref() {
            Some(keyframe) => match keyframe.write(&mut self.encoded_keyframe) {
                Ok(()) => true,
                Err(e) => {
                    error!("Failed to encode keyframe {}: {}", keyframe.frame, e);
                    false
                }
            },
            None => false,
        };

        for connection in connections.iter_mut() {
            if !connection.is_connected() {
                connection.request_keyframe();
                report.skipped.push(connection.peer);
                continue;
            }

            let full = have_keyframe && connection.needs_keyframe();
            let payload = if full {
                self.encoded_keyframe.clone()
            } else {
                self.encoded.clone()
            };
            let envelope = FrameEnvelope::new(delta.frame, payload, sent_at_ms);
            let result = transport.send(connection.peer, envelope);
            match status_of(&result) {
                TransportStatus::Ok => {
                    report.delivered.push(connection.peer);
                    if full {
                        connection.keyframe_delivered();
                        report.keyframes.push(connection.peer);
                    }
                }
                TransportStatus::Retryable => {
                    warn!(
                        "Frame {} to {} dropped (retryable): {:?}",
                        delta.frame,
                        connection.peer,
                        result.err()
                    );
                    connection.request_keyframe();
                    report.failed.push(connection.peer);
                }
                TransportStatus::Fatal => {
                    warn!(
                        "Frame {} to {} failed, disconnecting: {:?}",
                        delta.frame,
                        connection.peer,
                        result.err()
                    );
                    connection.mark_disconnected();
                    connection.request_keyframe();
                    report.failed.push(connection.peer);
                }
            }
        }

        self.stats.sent += report.delivered.len() as u64;
        self.stats.keyframes_sent += report.keyframes.len() as u64;
        self.stats.send_failures += report.failed.len() as u64;
        debug!(
            "Frame {} fan-out: {} delivered ({} keyframes), {} failed, {} skipped",
            delta.frame,
            report.delivered.len(),
            report.keyframes.len(),
            report.failed.len(),
            report.skipped.len()
        );
        report
    }

    /// Non-blocking poll for the next usable delta.
    ///
    /// Corrupt, mislabeled and stale deltas are logged and dropped; the
    /// poll moves on to the next envelope. Staleness is judged within one
    /// primary session; a delta from a new session is always accepted.
    pub fn receive_frame(&mut self, transport: &dyn FrameTransport) -> Option<FrameDelta> {
        while let Some((from, envelope)) = transport.try_recv() {
            self.stats.received += 1;

            let delta = match FrameDelta::from_bytes(&envelope.payload) {
                Ok(delta) => delta,
                Err(e) => {
                    warn!(
                        "Rejected corrupt delta for frame {} from {}: {}",
                        envelope.frame, from, e
                    );
                    self.stats.rejected += 1;
                    continue;
                }
            };

            if delta.frame != envelope.frame {
                warn!(
                    "Rejected delta from {}: envelope says frame {}, body says {}",
                    from, envelope.frame, delta.frame
                );
                self.stats.rejected += 1;
                continue;
            }

            if self.source == Some(delta.session) {
                if let Some(last) = self.last_applied {
                    if delta.frame <= last {
                        warn!(
                            "Rejected stale delta for frame {} from {} (last applied {})",
                            delta.frame, from, last
                        );
                        self.stats.rejected += 1;
                        continue;
                    }
                }
            }

            return Some(delta);
        }
        None
    }

    /// Applies a delta to the local world.
    ///
    /// Deterministic: the same delta on the same prior world and id map
    /// always yields the same posterior state. A delta from a primary
    /// session other than the one being followed first empties the mirror.
    /// A keyframe removes mirrored actors it does not list and updates the
    /// ones it does in place.
    pub fn apply_frame(
        &mut self,
        delta: &FrameDelta,
        world: &mut World,
        ids: &mut ActorIdMap,
    ) -> ApplyReport {
        let mut report = ApplyReport {
            frame: delta.frame,
            keyframe: delta.keyframe,
            ..Default::default()
        };

        if self.source != Some(delta.session) {
            if let Some(previous) = self.source {
                info!(
                    "Primary session changed ({} -> {}), rebuilding mirror of {} actors",
                    previous,
                    delta.session,
                    world.len()
                );
                self.stats.resyncs += 1;
                report.resynced = true;
            }
            for id in world.actor_ids() {
                world.destroy(id);
            }
            ids.clear();
            self.source = Some(delta.session);
            self.last_applied = None;
        }

        if delta.keyframe {
            let listed: BTreeSet<ActorId> = delta
                .events
                .iter()
                .filter_map(|event| match event {
                    FrameEvent::Spawn { actor, .. } => Some(*actor),
                    _ => None,
                })
                .collect();
            let departed: Vec<(ActorId, ActorId)> =
                ids.iter().filter(|(remote, _)| !listed.contains(remote)).collect();
            for (remote, local) in departed {
                debug!("Keyframe {}: dropping stale actor {}", delta.frame, remote);
                ids.remove(remote);
                world.destroy(local);
            }
        }

        for event in &delta.events {
            let ok = match event {
                FrameEvent::Spawn {
                    actor,
                    type_id,
                    transform,
                } => match ids.local(*actor) {
                    None => spawn_mapped(world, ids, *actor, type_id, *transform),
                    Some(local) if delta.keyframe => {
                        let same_type = world
                            .actor(local)
                            .is_some_and(|existing| &existing.type_id == type_id);
                        if same_type {
                            world.set_transform(local, *transform)
                        } else {
                            ids.remove(*actor);
                            world.destroy(local);
                            spawn_mapped(world, ids, *actor, type_id, *transform)
                        }
                    }
                    Some(_) => false,
                },
                FrameEvent::Destroy { actor } => match ids.remove(*actor) {
                    Some(local) => world.destroy(local),
                    None => false,
                },
                FrameEvent::Transform {
                    actor,
                    transform,
                    velocity,
                } => match ids.local(*actor) {
                    Some(local) => {
                        world.set_transform(local, *transform) && world.set_velocity(local, *velocity)
                    }
                    None => false,
                },
                FrameEvent::Control { actor, payload } => match ids.local(*actor) {
                    Some(local) => world.apply_control(local, payload.clone()),
                    None => false,
                },
            };

            if ok {
                report.applied += 1;
            } else {
                warn!("Frame {}: skipped {:?} for unknown actor", delta.frame, event_kind(event));
                report.skipped += 1;
            }
        }

        self.last_applied = Some(delta.frame);
        self.stats.applied += 1;
        report
    }

    /// Drops the captured deltas and their encodings.
    pub fn clear(&mut self) {
        self.pending = None;
        self.pending_keyframe = None;
        self.encoded.clear();
        self.encoded_keyframe.clear();
    }

    /// Forgets what was followed and applied; used when a new session starts.
    pub fn reset(&mut self) {
        self.clear();
        self.source = None;
        self.last_applied = None;
        self.stats = ChannelStats::default();
    }
}

fn spawn_mapped(
    world: &mut World,
    ids: &mut ActorIdMap,
    remote: ActorId,
    type_id: &str,
    transform: Transform,
) -> bool {
    match world.spawn(type_id, transform) {
        Some(local) => {
            ids.insert(remote, local);
            true
        }
        None => false,
    }
}

fn event_kind(event: &FrameEvent) -> &'static str {
    match event {
        FrameEvent::Spawn { .. } => "spawn",
        FrameEvent::Destroy { .. } => "destroy",
        FrameEvent::Transform { .. } => "transform",
        FrameEvent::Control { .. } => "control",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::role::Connection;
    use approx::assert_relative_eq;
    use framecast_env::{EnvError, LinkState, Liveness, PeerLink};
    use proptest::prelude::*;
    use std::collections::{HashSet, VecDeque};
    use std::sync::Mutex;

    /// Records sends; fails for chosen peers, replays queued envelopes.
    #[derive(Default)]
    struct ScriptedTransport {
        failing: HashSet<NodeId>,
        retryable: HashSet<NodeId>,
        sent: Mutex<Vec<(NodeId, FrameEnvelope)>>,
        inbound: Mutex<VecDeque<(NodeId, FrameEnvelope)>>,
    }

    impl FrameTransport for ScriptedTransport {
        fn local_id(&self) -> NodeId {
            NodeId::from_seed(0)
        }

        fn peers(&self) -> Vec<PeerLink> {
            Vec::new()
        }

        fn send(&self, target: NodeId, envelope: FrameEnvelope) -> Result<(), EnvError> {
            if self.failing.contains(&target) {
                return Err(EnvError::closed(target));
            }
            if self.retryable.contains(&target) {
                return Err(EnvError::Backpressure(target.to_string()));
            }
            self.sent.lock().unwrap().push((target, envelope));
            Ok(())
        }

        fn try_recv(&self) -> Option<(NodeId, FrameEnvelope)> {
            self.inbound.lock().unwrap().pop_front()
        }
    }

    fn connected(seed: u64) -> (NodeId, Liveness) {
        (NodeId::from_seed(seed), Liveness::new(LinkState::Connected))
    }

    fn table(links: &[(NodeId, Liveness)]) -> ConnectionTable {
        let mut table = ConnectionTable::new();
        for (id, liveness) in links {
            table.insert(Connection::new(*id, id.to_string(), liveness.clone()));
        }
        table
    }

    fn moved_world() -> (World, ActorId) {
        let mut world = World::new();
        let id = world.spawn("vehicle.sedan", Transform::at(0.0, 0.0, 0.0)).unwrap();
        world.clear_journal();
        world.set_transform(id, Transform::at(12.5, -3.0, 0.2));
        world.set_velocity(id, Vector3::new(2.5, 0.0, 0.0));
        (world, id)
    }

    #[test]
    fn test_capture_orders_structure_before_state() {
        let mut world = World::new();
        let a = world.spawn("vehicle.sedan", Transform::default()).unwrap();
        world.set_velocity(a, Vector3::new(1.0, 0.0, 0.0));
        world.apply_control(a, vec![1, 2]);
        let b = world.spawn("walker.adult", Transform::default()).unwrap();
        world.destroy(b);

        let delta = FrameDelta::capture(SessionId::new(), &world, 9);
        assert!(!delta.keyframe);
        let kinds: Vec<&str> = delta.events.iter().map(event_kind).collect();
        assert_eq!(kinds, vec!["spawn", "spawn", "destroy", "transform", "control"]);
    }

    #[test]
    fn test_read_rejects_bad_header() {
        let delta = FrameDelta {
            frame: 1,
            ..Default::default()
        };
        let mut bytes = delta.to_bytes().unwrap();

        let mut bad_magic = bytes.clone();
        bad_magic[0] = b'X';
        assert!(matches!(
            FrameDelta::from_bytes(&bad_magic),
            Err(CodecError::BadMagic(_))
        ));

        bytes[5] = 9;
        assert!(matches!(
            FrameDelta::from_bytes(&bytes),
            Err(CodecError::UnsupportedVersion(9))
        ));

        assert!(matches!(
            FrameDelta::from_bytes(&[b'F', b'C']),
            Err(CodecError::Io(_))
        ));
    }

    #[test]
    fn test_read_rejects_trailing_bytes() {
        let mut bytes = FrameDelta::default().to_bytes().unwrap();
        bytes.push(0);
        assert!(matches!(
            FrameDelta::from_bytes(&bytes),
            Err(CodecError::Malformed(_))
        ));
    }

    #[test]
    fn test_disconnection_isolation() {
        let (a, la) = connected(1);
        let (b, lb) = connected(2);
        let (c, lc) = connected(3);
        let mut connections = table(&[(a, la.clone()), (b, lb.clone()), (c, lc.clone())]);

        let transport = ScriptedTransport {
            failing: [b].into_iter().collect(),
            ..Default::default()
        };

        let (world, _) = moved_world();
        let mut channel = FrameDataChannel::new();
        channel.capture_frame(&world, 1);
        let report = channel.send_frame(&mut connections, &transport, 0);

        assert_eq!(report.failed, vec![b]);
        assert!(report.delivered.contains(&a));
        assert!(report.delivered.contains(&c));
        assert_eq!(lb.get(), LinkState::Disconnected);
        assert!(la.is_connected() && lc.is_connected());
    }

    #[test]
    fn test_retryable_failure_keeps_link() {
        let (a, la) = connected(1);
        let mut connections = table(&[(a, la.clone())]);
        connections.iter_mut().for_each(Connection::keyframe_delivered);
        let transport = ScriptedTransport {
            retryable: [a].into_iter().collect(),
            ..Default::default()
        };

        let mut channel = FrameDataChannel::new();
        channel.capture_frame(&World::new(), 1);
        let report = channel.send_frame(&mut connections, &transport, 0);

        assert_eq!(report.failed, vec![a]);
        assert!(la.is_connected());
        assert!(connections.get(a).unwrap().needs_keyframe());
    }

    #[test]
    fn test_disconnected_connection_skipped() {
        let (a, _) = connected(1);
        let dead = Liveness::new(LinkState::Disconnected);
        let mut connections = table(&[(a, dead)]);
        let transport = ScriptedTransport::default();

        let mut channel = FrameDataChannel::new();
        channel.capture_frame(&World::new(), 1);
        let report = channel.send_frame(&mut connections, &transport, 0);

        assert_eq!(report.skipped, vec![a]);
        assert!(transport.sent.lock().unwrap().is_empty());
    }

    #[test]
    fn test_two_secondaries_reproduce_primary_state() {
        let mut primary = World::new();
        let id = primary.spawn("vehicle.sedan", Transform::at(0.0, 0.0, 0.0)).unwrap();
        primary.set_velocity(id, Vector3::new(10.0, 0.0, 0.0));
        primary.set_transform(id, Transform::at(5.0, 1.0, 0.0));
        let expected = primary.actor(id).unwrap().transform;

        let delta = FrameDelta::capture(SessionId::new(), &primary, 5);
        let bytes = delta.to_bytes().unwrap();

        let mut results = Vec::new();
        for _ in 0..2 {
            let mut world = World::new();
            let mut ids = ActorIdMap::new();
            let mut channel = FrameDataChannel::new();
            let decoded = FrameDelta::from_bytes(&bytes).unwrap();
            let report = channel.apply_frame(&decoded, &mut world, &mut ids);
            assert_eq!(report.skipped, 0);

            let local = ids.local(id).unwrap();
            results.push(world.actor(local).unwrap().transform);
        }

        for transform in results {
            assert_relative_eq!(transform.location.x, expected.location.x);
            assert_relative_eq!(transform.location.y, expected.location.y);
            assert_eq!(transform, expected);
        }
    }

    #[test]
    fn test_receive_rejects_corrupt_and_stale() {
        let transport = ScriptedTransport::default();
        let primary = NodeId::from_seed(1);
        let good = FrameDelta {
            frame: 3,
            ..Default::default()
        };
        {
            let mut inbound = transport.inbound.lock().unwrap();
            inbound.push_back((primary, FrameEnvelope::new(2, vec![0xde, 0xad], 0)));
            inbound.push_back((primary, FrameEnvelope::new(3, good.to_bytes().unwrap(), 0)));
        }

        let mut channel = FrameDataChannel::new();
        let delta = channel.receive_frame(&transport).unwrap();
        assert_eq!(delta.frame, 3);
        channel.apply_frame(&delta, &mut World::new(), &mut ActorIdMap::new());

        transport
            .inbound
            .lock()
            .unwrap()
            .push_back((primary, FrameEnvelope::new(3, good.to_bytes().unwrap(), 0)));
        assert!(channel.receive_frame(&transport).is_none());
        assert_eq!(channel.stats().rejected, 2);
    }

    #[test]
    fn test_unknown_actor_events_skipped() {
        let delta = FrameDelta {
            frame: 1,
            events: vec![
                FrameEvent::Destroy { actor: 77 },
                FrameEvent::Control {
                    actor: 77,
                    payload: vec![1],
                },
            ],
            ..Default::default()
        };
        let mut world = World::new();
        let mut channel = FrameDataChannel::new();
        let report = channel.apply_frame(&delta, &mut world, &mut ActorIdMap::new());
        assert_eq!(report.skipped, 2);
        assert!(world.is_empty());
    }

    #[test]
    fn test_clear_drops_pending() {
        let mut channel = FrameDataChannel::new();
        channel.capture_frame(&World::new(), 1);
        channel.capture_keyframe(&World::new(), 1);
        assert!(channel.pending().is_some());
        channel.clear();
        assert!(channel.pending().is_none());
        assert!(channel.pending_keyframe.is_none());
    }

    fn mirror_of(delta: &FrameDelta) -> (World, ActorIdMap, FrameDataChannel) {
        let mut world = World::new();
        let mut ids = ActorIdMap::new();
        let mut channel = FrameDataChannel::new();
        channel.apply_frame(delta, &mut world, &mut ids);
        (world, ids, channel)
    }

    fn same_actors(a: &World, b: &World) -> bool {
        let key = |actor: &crate::world::Actor| {
            (actor.type_id.clone(), actor.transform, actor.velocity, actor.control.clone())
        };
        a.actors().map(key).eq(b.actors().map(key))
    }

    #[test]
    fn test_late_peer_gets_keyframe_others_get_delta() {
        let (synced, ls) = connected(1);
        let (late, ll) = connected(2);
        let mut connections = table(&[(synced, ls), (late, ll)]);
        connections
            .iter_mut()
            .filter(|c| c.peer == synced)
            .for_each(Connection::keyframe_delivered);
        assert!(connections.wants_keyframe());

        // Spawned on an earlier frame; only its motion is in this frame's journal.
        let (mut world, id) = moved_world();
        world.apply_control(id, vec![4, 2]);
        let session = SessionId::new();
        let mut channel = FrameDataChannel::for_session(session);
        channel.capture_frame(&world, 7);
        channel.capture_keyframe(&world, 7);

        let transport = ScriptedTransport::default();
        let report = channel.send_frame(&mut connections, &transport, 0);
        assert_eq!(report.delivered.len(), 2);
        assert_eq!(report.keyframes, vec![late]);
        assert!(!connections.wants_keyframe());
        assert_eq!(channel.stats().keyframes_sent, 1);

        let sent = transport.sent.lock().unwrap();
        for (peer, envelope) in sent.iter() {
            let delta = FrameDelta::from_bytes(&envelope.payload).unwrap();
            assert_eq!(delta.session, session);
            assert_eq!(delta.frame, 7);
            assert_eq!(delta.keyframe, *peer == late);

            let (mirror, _, _) = mirror_of(&delta);
            if *peer == late {
                assert!(same_actors(&mirror, &world));
            } else {
                assert!(mirror.is_empty());
            }
        }
    }

    #[test]
    fn test_keyframe_reconciles_diverged_mirror() {
        let session = SessionId::new();
        let mut primary = World::new();
        let kept = primary.spawn("vehicle.sedan", Transform::at(1.0, 0.0, 0.0)).unwrap();
        let gone = primary.spawn("walker.adult", Transform::at(2.0, 0.0, 0.0)).unwrap();
        let first = FrameDelta::capture(session, &primary, 1);
        let (mut mirror, mut ids, mut channel) = mirror_of(&first);
        primary.clear_journal();

        // Frame 2 never reaches the secondary.
        primary.destroy(gone);
        primary.set_transform(kept, Transform::at(9.0, 0.0, 0.0));
        primary
            .spawn("prop.cone", Transform::at(3.0, 3.0, 0.0))
            .unwrap();
        primary.clear_journal();

        let keyframe = FrameDelta::keyframe(session, &primary, 3);
        let report = channel.apply_frame(&keyframe, &mut mirror, &mut ids);

        assert!(report.keyframe);
        assert!(!report.resynced);
        assert_eq!(report.skipped, 0);
        assert!(same_actors(&mirror, &primary));
        assert_eq!(ids.len(), 2);
        assert!(ids.local(gone).is_none());
    }

    #[test]
    fn test_new_primary_session_resets_guard_and_mirror() {
        let old = SessionId::new();
        let mut primary = World::new();
        primary.spawn("vehicle.sedan", Transform::default()).unwrap();
        let (mut mirror, mut ids, mut channel) = mirror_of(&FrameDelta::capture(old, &primary, 10));
        assert_eq!(channel.last_applied(), Some(10));

        let restarted = SessionId::new();
        let mut fresh = World::new();
        fresh.spawn("walker.adult", Transform::at(0.0, 5.0, 0.0)).unwrap();
        let delta = FrameDelta::capture(restarted, &fresh, 1);

        let transport = ScriptedTransport::default();
        transport.inbound.lock().unwrap().push_back((
            NodeId::from_seed(1),
            FrameEnvelope::new(1, delta.to_bytes().unwrap(), 0),
        ));
        let received = channel.receive_frame(&transport).unwrap();
        let report = channel.apply_frame(&received, &mut mirror, &mut ids);

        assert!(report.resynced);
        assert_eq!(report.skipped, 0);
        assert_eq!(channel.source(), Some(restarted));
        assert_eq!(channel.last_applied(), Some(1));
        assert_eq!(channel.stats().resyncs, 1);
        assert_eq!(channel.stats().rejected, 0);
        assert!(same_actors(&mirror, &fresh));
        assert_eq!(ids.len(), 1);
    }

    fn arb_transform() -> impl Strategy<Value = Transform> {
        (
            prop::array::uniform3(-1e4f64..1e4),
            prop::array::uniform3(-180f64..180.0),
        )
            .prop_map(|(l, r)| {
                Transform::new(Vector3::new(l[0], l[1], l[2]), Vector3::new(r[0], r[1], r[2]))
            })
    }

    fn arb_event() -> impl Strategy<Value = FrameEvent> {
        prop_oneof![
            (any::<u32>(), "[a-z]{1,8}\\.[a-z]{1,8}", arb_transform()).prop_map(
                |(actor, type_id, transform)| FrameEvent::Spawn {
                    actor,
                    type_id,
                    transform
                }
            ),
            any::<u32>().prop_map(|actor| FrameEvent::Destroy { actor }),
            (any::<u32>(), arb_transform(), prop::array::uniform3(-50f64..50.0)).prop_map(
                |(actor, transform, v)| FrameEvent::Transform {
                    actor,
                    transform,
                    velocity: Vector3::new(v[0], v[1], v[2]),
                }
            ),
            (any::<u32>(), prop::collection::vec(any::<u8>(), 0..32))
                .prop_map(|(actor, payload)| FrameEvent::Control { actor, payload }),
        ]
    }

    proptest! {
        #[test]
        fn prop_write_then_read_reproduces_delta(
            frame in any::<u64>(),
            keyframe in any::<bool>(),
            events in prop::collection::vec(arb_event(), 0..24),
        ) {
            let delta = FrameDelta { frame, keyframe, events, ..Default::default() };
            let mut stream = Vec::new();
            delta.write(&mut stream).unwrap();
            let decoded = FrameDelta::read(&mut stream.as_slice()).unwrap();
            prop_assert_eq!(decoded, delta);
        }
    }
}
