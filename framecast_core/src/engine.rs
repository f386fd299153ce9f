//! The tick entry point.
//!
//! The host owns the frame loop and calls [`Engine::tick`] once per frame.
//! One tick runs, in order:
//!
//! 1. drain commands (primary) and ask the clock to advance
//! 2. primary: step the simulation, capture and fan out the frame delta
//!    secondary: apply the primary's deltas
//! 3. local render hook, recorder notification
//! 4. snapshot broadcast, topology flag reset
//!
//! Nothing from one tick overlaps the next.

use crate::clock::TickOutcome;
use crate::command::{CommandHandle, CommandQueue};
use crate::episode::{EpisodeManager, NullRecorder, Recorder, SessionId};
use crate::error::EngineError;
use crate::frame_data::{ApplyReport, FanOutReport};
use crate::observer::{BroadcastSink, WorldObserver};
use crate::role::NodeRole;
use crate::settings::{EngineConfig, EpisodeSettings};
use crate::world::World;
use framecast_env::{NodeContext, NodeId, TransportBackend};
use std::sync::Arc;
use tracing::{debug, warn};

/// Physics/rendering collaborator.
pub trait Simulation: Send {
    /// Advances actor state. Only called on the primary.
    fn step(&mut self, world: &mut World, delta_seconds: f64);

    /// Local per-frame work on the final state, on either role.
    fn render(&mut self, _world: &World, _delta_seconds: f64) {}

    fn apply_settings(&mut self, _settings: &EpisodeSettings) {}

    /// Queried once per completed tick; true reports a pending visual
    /// refresh with that tick's broadcast.
    fn take_pending_visual_update(&mut self) -> bool {
        false
    }
}

#[derive(Debug, Default)]
pub struct NoopSimulation;

impl Simulation for NoopSimulation {
    fn step(&mut self, _world: &mut World, _delta_seconds: f64) {}
}

#[derive(Debug, Clone, PartialEq)]
pub struct FrameSummary {
    pub frame: u64,
    pub delta_seconds: f64,
    pub role: NodeRole,
    /// Primary only
    pub fan_out: Option<FanOutReport>,
    /// Secondary only; empty when nothing arrived
    pub applied: Vec<ApplyReport>,
    pub topology_changed: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TickReport {
    /// No active session
    Idle,
    /// Waiting for a tick-cue
    Blocked { frame: u64 },
    Completed(FrameSummary),
}

pub struct Engine<C: NodeContext> {
    config: EngineConfig,
    local_id: NodeId,
    context: Arc<C>,
    backend: Arc<dyn TransportBackend>,
    queue: CommandQueue,
    episodes: EpisodeManager,
    observer: WorldObserver,
    simulation: Box<dyn Simulation>,
}

impl<C: NodeContext> Engine<C> {
    pub fn new(
        config: EngineConfig,
        local_id: NodeId,
        context: Arc<C>,
        backend: Arc<dyn TransportBackend>,
    ) -> Self {
        let queue = CommandQueue::bounded(config.command_queue_capacity);
        Self {
            config,
            local_id,
            context,
            backend,
            queue,
            episodes: EpisodeManager::new(Box::new(NullRecorder)),
            observer: WorldObserver::new(),
            simulation: Box::new(NoopSimulation),
        }
    }

    pub fn with_simulation(mut self, simulation: Box<dyn Simulation>) -> Self {
        self.simulation = simulation;
        self
    }

    pub fn with_recorder(mut self, recorder: Box<dyn Recorder>) -> Self {
        self.episodes.set_recorder(recorder);
        self
    }

    pub fn add_sink(&mut self, sink: Box<dyn BroadcastSink>) {
        self.observer.add_sink(sink);
    }

    pub fn local_id(&self) -> NodeId {
        self.local_id
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Takes effect at the next session start.
    pub fn set_config(&mut self, config: EngineConfig) {
        self.config = config;
    }

    pub fn command_handle(&self) -> CommandHandle {
        self.queue.handle()
    }

    pub fn episodes(&self) -> &EpisodeManager {
        &self.episodes
    }

    pub fn episodes_mut(&mut self) -> &mut EpisodeManager {
        &mut self.episodes
    }

    pub fn observer(&self) -> &WorldObserver {
        &self.observer
    }

    pub fn start_session(&mut self) -> Result<SessionId, EngineError> {
        let id = self.episodes.start_session(
            &self.config,
            self.local_id,
            self.backend.as_ref(),
            &self.queue,
        )?;
        if let Some(session) = self.episodes.session_mut() {
            if session.take_settings_changed() {
                self.simulation.apply_settings(session.settings());
            }
        }
        Ok(id)
    }

    pub fn end_session(&mut self) -> Result<SessionId, EngineError> {
        self.episodes.end_session(&self.queue)
    }

    /// Map or streaming topology changed; reported with the next broadcast.
    pub fn notify_topology_changed(&mut self) {
        if let Some(session) = self.episodes.session_mut() {
            session.mark_topology_changed();
        }
    }

    /// Runs one host frame.
    pub fn tick(&mut self, host_delta: f64) -> TickReport {
        let Some(session) = self.episodes.session_mut() else {
            let dropped = self.queue.discard();
            if dropped > 0 {
                warn!("Discarded {} commands received with no active session", dropped);
            }
            return TickReport::Idle;
        };

        let role = session.role();
        if role == NodeRole::Secondary {
            let dropped = self.queue.discard();
            if dropped > 0 {
                warn!("Discarded {} commands sent to a secondary", dropped);
            }
        }

        if let TickOutcome::Blocked = session.advance_if_ready(host_delta) {
            return TickReport::Blocked {
                frame: session.frame(),
            };
        }

        if session.take_settings_changed() {
            self.simulation.apply_settings(session.settings());
        }

        let frame = session.frame();
        let delta_seconds = session.clock().last_delta();
        let mut fan_out = None;
        let mut applied = Vec::new();

        match role {
            NodeRole::Primary => {
                self.simulation.step(session.world_mut(), delta_seconds);
                fan_out = session.publish_frame(self.context.now_ms());
            }
            NodeRole::Secondary => {
                applied = session.follow_primary();
            }
        }
        self.simulation.render(session.world(), delta_seconds);

        self.episodes.notify_ticking(delta_seconds);

        let pending_visual_update = self.simulation.take_pending_visual_update();
        let mut topology_changed = false;
        if let Some(session) = self.episodes.session_mut() {
            topology_changed = session.topology_changed();
            self.observer.broadcast_tick(
                session,
                delta_seconds,
                topology_changed,
                pending_visual_update,
            );
            session.reset_topology_changed();
        }

        debug!("Frame {} complete ({})", frame, role.as_str());
        TickReport::Completed(FrameSummary {
            frame,
            delta_seconds,
            role,
            fan_out,
            applied,
            topology_changed,
        })
    }
}
