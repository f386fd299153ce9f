//! Sessions (episodes) and their lifecycle.

use crate::clock::{ExecutionMode, FrameClock, TickOutcome};
use crate::command::{Command, CommandQueue, TickCue};
use crate::error::EngineError;
use crate::frame_data::{ApplyReport, FanOutReport, FrameDataChannel};
use crate::role::{ConnectionTable, NodeRole, RoleNegotiator, RoleState};
use crate::settings::{EngineConfig, EpisodeSettings};
use crate::world::World;
use framecast_env::{NodeId, TransportBackend};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Upper bound on deltas a secondary applies in one tick while catching up.
pub const MAX_DELTAS_PER_TICK: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    NoSession,
    Starting,
    Active,
    Ending,
}

/// One simulation run.
///
/// Owns everything that used to be process-wide: the frame clock, the
/// world, the topology flag and the role-specific network state.
pub struct Session {
    id: SessionId,
    local_id: NodeId,
    settings: EpisodeSettings,
    clock: FrameClock,
    world: World,
    channel: FrameDataChannel,
    role: RoleState,
    negotiator: RoleNegotiator,
    topology_changed: bool,
    settings_changed: bool,
}

impl Session {
    fn new(
        local_id: NodeId,
        config: &EngineConfig,
        negotiator: RoleNegotiator,
        role: RoleState,
    ) -> Self {
        let settings = config.episode.clone();
        // Secondaries follow the primary's pace, never a client cue.
        let mode = match role.role() {
            NodeRole::Primary => ExecutionMode::from_synchronous(settings.synchronous_mode),
            NodeRole::Secondary => ExecutionMode::Asynchronous,
        };
        let clock = FrameClock::new(config.base_frame, mode, settings.fixed_delta_seconds);
        let id = SessionId::new();

        Self {
            id,
            local_id,
            settings,
            clock,
            world: World::new(),
            channel: FrameDataChannel::for_session(id),
            role,
            negotiator,
            topology_changed: true,
            settings_changed: true,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn local_id(&self) -> NodeId {
        self.local_id
    }

    pub fn role(&self) -> NodeRole {
        self.role.role()
    }

    /// Re-resolving within a session always returns the session's role.
    pub fn resolve_role(&self, config: &EngineConfig) -> NodeRole {
        self.negotiator.resolve(config)
    }

    pub fn frame(&self) -> u64 {
        self.clock.frame()
    }

    pub fn clock(&self) -> &FrameClock {
        &self.clock
    }

    pub fn settings(&self) -> &EpisodeSettings {
        &self.settings
    }

    pub fn world(&self) -> &World {
        &self.world
    }

    pub fn world_mut(&mut self) -> &mut World {
        &mut self.world
    }

    pub fn channel(&self) -> &FrameDataChannel {
        &self.channel
    }

    pub fn connections(&self) -> &ConnectionTable {
        self.role.connections()
    }

    pub fn topology_changed(&self) -> bool {
        self.topology_changed
    }

    pub fn mark_topology_changed(&mut self) {
        self.topology_changed = true;
    }

    pub fn reset_topology_changed(&mut self) {
        self.topology_changed = false;
    }

    /// Returns true once after settings changed.
    pub fn take_settings_changed(&mut self) -> bool {
        std::mem::take(&mut self.settings_changed)
    }

    /// Drains commands, then asks the clock to advance.
    ///
    /// A primary drains at most its configured batch per call, whether or
    /// not the clock ends up blocked, so commands keep flowing while a
    /// synchronous session waits for its cue.
    pub fn advance_if_ready(&mut self, host_delta: f64) -> TickOutcome {
        let Session {
            clock,
            world,
            role,
            settings,
            settings_changed,
            ..
        } = self;

        match role {
            RoleState::Primary(state) => {
                let max = state.commands.max_commands();
                state.commands.run_some(max, |command| {
                    apply_command(command, clock, world, settings, settings_changed)
                });
                clock.advance_if_ready(host_delta, state.commands.tick_cue_mut())
            }
            RoleState::Secondary(_) => clock.advance_if_ready(host_delta, &mut TickCue::default()),
        }
    }

    /// Primary: capture the frame's delta, fan it out, clear.
    ///
    /// Peers that just connected, reconnected or missed a frame get a
    /// keyframe of the whole world instead of the delta.
    pub fn publish_frame(&mut self, sent_at_ms: u64) -> Option<FanOutReport> {
        let RoleState::Primary(state) = &mut self.role else {
            return None;
        };

        state.connections.sync(state.transport.as_ref());
        let frame = self.clock.frame();
        self.channel.capture_frame(&self.world, frame);
        if state.connections.wants_keyframe() {
            self.channel.capture_keyframe(&self.world, frame);
        }
        let report = self.channel.send_frame(
            &mut state.connections,
            state.transport.as_ref(),
            sent_at_ms,
        );

        self.channel.clear();
        self.world.clear_journal();
        Some(report)
    }

    /// Secondary: apply whatever deltas have arrived, oldest first.
    ///
    /// With nothing to apply the local world is left as it was. Following a
    /// restarted primary rebuilds the world, which counts as a topology
    /// change.
    pub fn follow_primary(&mut self) -> Vec<ApplyReport> {
        let RoleState::Secondary(state) = &mut self.role else {
            return Vec::new();
        };

        state.primary.sync(state.transport.as_ref());
        let mut reports = Vec::new();
        while reports.len() < MAX_DELTAS_PER_TICK {
            let Some(delta) = self.channel.receive_frame(state.transport.as_ref()) else {
                break;
            };
            reports.push(
                self.channel
                    .apply_frame(&delta, &mut self.world, &mut state.actor_ids),
            );
            self.channel.clear();
        }

        if reports.is_empty() {
            debug!("Frame {}: no delta from primary", self.clock.frame());
        }
        if reports.iter().any(|r| r.resynced) {
            self.topology_changed = true;
        }
        self.world.clear_journal();
        reports
    }

    /// Drops queued commands and any pending tick-cue.
    fn discard_commands(&mut self, queue: &CommandQueue) -> usize {
        match &mut self.role {
            RoleState::Primary(state) => state.commands.discard_pending(),
            RoleState::Secondary(_) => queue.discard(),
        }
    }
}

fn apply_command(
    command: Command,
    clock: &mut FrameClock,
    world: &mut World,
    settings: &mut EpisodeSettings,
    settings_changed: &mut bool,
) {
    let name = command.name();
    match command {
        Command::Tick => {}
        Command::ApplySettings { settings: new } => {
            if let Err(e) = new.validate() {
                warn!("Discarded {}: {}", name, e);
                return;
            }
            clock.set_mode(ExecutionMode::from_synchronous(new.synchronous_mode));
            clock.set_fixed_delta(new.fixed_delta_seconds);
            *settings = new;
            *settings_changed = true;
        }
        Command::SetSynchronousMode { enabled } => {
            settings.synchronous_mode = enabled;
            clock.set_mode(ExecutionMode::from_synchronous(enabled));
            *settings_changed = true;
        }
        Command::SetFixedDeltaSeconds { seconds } => {
            if let Some(dt) = seconds {
                if !dt.is_finite() || dt <= 0.0 {
                    warn!("Discarded {}: invalid step {}", name, dt);
                    return;
                }
            }
            settings.fixed_delta_seconds = seconds;
            clock.set_fixed_delta(seconds);
            *settings_changed = true;
        }
        Command::SpawnActor { type_id, transform } => match world.spawn(type_id, transform) {
            Some(id) => debug!("Spawned actor {}", id),
            None => warn!("Discarded {}: actor ids exhausted", name),
        },
        Command::DestroyActor { actor } => {
            if !world.destroy(actor) {
                warn!("Discarded {}: unknown actor {}", name, actor);
            }
        }
        Command::SetActorTransform { actor, transform } => {
            if !world.set_transform(actor, transform) {
                warn!("Discarded {}: unknown actor {}", name, actor);
            }
        }
        Command::SetActorVelocity { actor, velocity } => {
            if !world.set_velocity(actor, velocity) {
                warn!("Discarded {}: unknown actor {}", name, actor);
            }
        }
        Command::ApplyControl { actor, payload } => {
            if !world.apply_control(actor, payload) {
                warn!("Discarded {}: unknown actor {}", name, actor);
            }
        }
    }
}

/// Recording/replay collaborator.
pub trait Recorder: Send {
    /// Called once the new session is built and its clock reset.
    fn set_session(&mut self, session: &Session);

    fn ticking(&mut self, delta_seconds: f64);

    /// Called right after `set_session`, so a pending replay can resume.
    fn check_resume_after_load(&mut self);

    fn session_ended(&mut self, _session: SessionId) {}
}

#[derive(Debug, Default)]
pub struct NullRecorder;

impl Recorder for NullRecorder {
    fn set_session(&mut self, _session: &Session) {}
    fn ticking(&mut self, _delta_seconds: f64) {}
    fn check_resume_after_load(&mut self) {}
}

/// Creates and tears down sessions; at most one is active.
pub struct EpisodeManager {
    state: LifecycleState,
    session: Option<Session>,
    recorder: Box<dyn Recorder>,
}

impl EpisodeManager {
    pub fn new(recorder: Box<dyn Recorder>) -> Self {
        Self {
            state: LifecycleState::NoSession,
            session: None,
            recorder,
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub fn session_mut(&mut self) -> Option<&mut Session> {
        self.session.as_mut()
    }

    pub fn set_recorder(&mut self, recorder: Box<dyn Recorder>) {
        self.recorder = recorder;
    }

    /// Builds a session from `config`.
    ///
    /// Configuration and endpoint errors leave the manager in `NoSession`.
    /// The recorder hears about the session only after it is fully built.
    pub fn start_session(
        &mut self,
        config: &EngineConfig,
        local_id: NodeId,
        backend: &dyn TransportBackend,
        queue: &CommandQueue,
    ) -> Result<SessionId, EngineError> {
        if let Some(session) = &self.session {
            return Err(EngineError::AlreadyActive(session.id()));
        }

        self.state = LifecycleState::Starting;
        let session = match Self::build_session(config, local_id, backend, queue) {
            Ok(session) => session,
            Err(e) => {
                self.state = LifecycleState::NoSession;
                warn!("Session start failed: {}", e);
                return Err(e);
            }
        };

        let stale = queue.discard();
        if stale > 0 {
            debug!("Dropped {} commands queued before session start", stale);
        }

        let id = session.id();
        info!(
            "Session {} started as {} at frame {} ({:?})",
            id,
            session.role().as_str(),
            session.frame(),
            session.clock().mode()
        );

        let session = self.session.insert(session);
        self.state = LifecycleState::Active;
        self.recorder.set_session(session);
        self.recorder.check_resume_after_load();
        Ok(id)
    }

    fn build_session(
        config: &EngineConfig,
        local_id: NodeId,
        backend: &dyn TransportBackend,
        queue: &CommandQueue,
    ) -> Result<Session, EngineError> {
        config.validate()?;

        let negotiator = RoleNegotiator::new();
        let role = negotiator.resolve(config);
        let role_state = RoleState::establish(role, config, local_id, backend, queue)?;

        let mut session = Session::new(local_id, config, negotiator, role_state);
        session.clock.reset();
        session.channel.reset();
        Ok(session)
    }

    /// Tears the session down after discarding every queued command.
    pub fn end_session(&mut self, queue: &CommandQueue) -> Result<SessionId, EngineError> {
        let Some(session) = self.session.as_mut() else {
            return Err(EngineError::NoSession);
        };

        self.state = LifecycleState::Ending;
        let id = session.id();
        let discarded = session.discard_commands(queue);
        if discarded > 0 {
            info!("Discarded {} queued commands on session end", discarded);
        }

        self.recorder.session_ended(id);
        if let Some(session) = self.session.take() {
            info!("Session {} ended at frame {}", id, session.frame());
        }
        self.state = LifecycleState::NoSession;
        Ok(id)
    }

    pub fn notify_ticking(&mut self, delta_seconds: f64) {
        if self.session.is_some() {
            self.recorder.ticking(delta_seconds);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::LoopbackHub;
    use crate::world::Transform;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct EventLog(Arc<Mutex<Vec<String>>>);

    impl EventLog {
        fn events(&self) -> Vec<String> {
            self.0.lock().unwrap().clone()
        }
    }

    impl Recorder for EventLog {
        fn set_session(&mut self, session: &Session) {
            self.0
                .lock()
                .unwrap()
                .push(format!("set_session@{}", session.frame()));
        }
        fn ticking(&mut self, _delta_seconds: f64) {
            self.0.lock().unwrap().push("ticking".to_string());
        }
        fn check_resume_after_load(&mut self) {
            self.0.lock().unwrap().push("check_resume".to_string());
        }
        fn session_ended(&mut self, _session: SessionId) {
            self.0.lock().unwrap().push("ended".to_string());
        }
    }

    fn sync_config() -> EngineConfig {
        let mut config = EngineConfig::default();
        config.episode.synchronous_mode = true;
        config
    }

    #[test]
    fn test_start_twice_is_already_active() {
        let hub = LoopbackHub::new();
        let queue = CommandQueue::bounded(16);
        let mut manager = EpisodeManager::new(Box::new(NullRecorder));

        let id = manager
            .start_session(&EngineConfig::default(), NodeId::from_seed(1), &hub, &queue)
            .unwrap();
        let err = manager
            .start_session(&EngineConfig::default(), NodeId::from_seed(1), &hub, &queue)
            .unwrap_err();
        assert!(matches!(err, EngineError::AlreadyActive(active) if active == id));
    }

    #[test]
    fn test_config_error_leaves_no_session() {
        let hub = LoopbackHub::new();
        let queue = CommandQueue::bounded(16);
        let mut manager = EpisodeManager::new(Box::new(NullRecorder));
        let config = EngineConfig {
            primary_address: "not a host".to_string(),
            ..Default::default()
        };

        let err = manager
            .start_session(&config, NodeId::from_seed(1), &hub, &queue)
            .unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
        assert_eq!(manager.state(), LifecycleState::NoSession);
        assert!(manager.session().is_none());
    }

    #[test]
    fn test_listen_failure_leaves_no_session() {
        let hub = LoopbackHub::new();
        hub.refuse_listen(true);
        let queue = CommandQueue::bounded(16);
        let mut manager = EpisodeManager::new(Box::new(NullRecorder));

        let err = manager
            .start_session(&EngineConfig::default(), NodeId::from_seed(1), &hub, &queue)
            .unwrap_err();
        assert!(matches!(err, EngineError::Transport(_)));
        assert_eq!(manager.state(), LifecycleState::NoSession);
    }

    #[test]
    fn test_recorder_notified_after_clock_reset() {
        let hub = LoopbackHub::new();
        let queue = CommandQueue::bounded(16);
        let log = EventLog::default();
        let mut manager = EpisodeManager::new(Box::new(log.clone()));
        let config = EngineConfig {
            base_frame: 500,
            ..Default::default()
        };

        manager
            .start_session(&config, NodeId::from_seed(1), &hub, &queue)
            .unwrap();
        manager.notify_ticking(0.05);
        manager.end_session(&queue).unwrap();

        assert_eq!(
            log.events(),
            vec!["set_session@500", "check_resume", "ticking", "ended"]
        );
    }

    #[test]
    fn test_sync_session_blocks_until_cue() {
        let hub = LoopbackHub::new();
        let queue = CommandQueue::bounded(16);
        let mut manager = EpisodeManager::new(Box::new(NullRecorder));
        manager
            .start_session(&sync_config(), NodeId::from_seed(1), &hub, &queue)
            .unwrap();
        let session = manager.session_mut().unwrap();

        for _ in 0..3 {
            assert_eq!(session.advance_if_ready(0.05), TickOutcome::Blocked);
        }
        assert_eq!(session.frame(), 0);

        queue.handle().submit(Command::Tick).unwrap();
        assert_eq!(
            session.advance_if_ready(0.05),
            TickOutcome::Advanced { frame: 1 }
        );
    }

    #[test]
    fn test_commands_keep_draining_while_blocked() {
        let hub = LoopbackHub::new();
        let queue = CommandQueue::bounded(64);
        let mut manager = EpisodeManager::new(Box::new(NullRecorder));
        let mut config = sync_config();
        config.max_commands_per_drain = 2;
        manager
            .start_session(&config, NodeId::from_seed(1), &hub, &queue)
            .unwrap();

        let handle = queue.handle();
        for _ in 0..4 {
            handle
                .submit(Command::SpawnActor {
                    type_id: "vehicle.sedan".to_string(),
                    transform: Transform::default(),
                })
                .unwrap();
        }

        let session = manager.session_mut().unwrap();
        assert!(session.advance_if_ready(0.05).is_blocked());
        assert_eq!(session.world().len(), 2);
        assert!(session.advance_if_ready(0.05).is_blocked());
        assert_eq!(session.world().len(), 4);
        assert_eq!(session.frame(), 0);
    }

    #[test]
    fn test_settings_command_switches_mode() {
        let hub = LoopbackHub::new();
        let queue = CommandQueue::bounded(16);
        let mut manager = EpisodeManager::new(Box::new(NullRecorder));
        manager
            .start_session(&EngineConfig::default(), NodeId::from_seed(1), &hub, &queue)
            .unwrap();

        queue
            .handle()
            .submit(Command::SetSynchronousMode { enabled: true })
            .unwrap();
        let session = manager.session_mut().unwrap();
        assert!(session.advance_if_ready(0.05).is_blocked());
        assert!(session.settings().synchronous_mode);
    }

    #[test]
    fn test_invalid_settings_command_discarded() {
        let hub = LoopbackHub::new();
        let queue = CommandQueue::bounded(16);
        let mut manager = EpisodeManager::new(Box::new(NullRecorder));
        manager
            .start_session(&EngineConfig::default(), NodeId::from_seed(1), &hub, &queue)
            .unwrap();

        queue
            .handle()
            .submit(Command::SetFixedDeltaSeconds {
                seconds: Some(-1.0),
            })
            .unwrap();
        let session = manager.session_mut().unwrap();
        session.advance_if_ready(0.05);
        assert_eq!(session.clock().fixed_delta(), None);
    }

    #[test]
    fn test_end_session_discards_queue_and_restart_resets_frame() {
        let hub = LoopbackHub::new();
        let queue = CommandQueue::bounded(16);
        let mut manager = EpisodeManager::new(Box::new(NullRecorder));
        let config = EngineConfig::default();

        manager
            .start_session(&config, NodeId::from_seed(1), &hub, &queue)
            .unwrap();
        {
            let session = manager.session_mut().unwrap();
            for _ in 0..5 {
                session.advance_if_ready(0.05);
            }
            assert_eq!(session.frame(), 5);
        }

        let handle = queue.handle();
        for _ in 0..3 {
            handle
                .submit(Command::SpawnActor {
                    type_id: "vehicle.sedan".to_string(),
                    transform: Transform::default(),
                })
                .unwrap();
        }

        manager.end_session(&queue).unwrap();
        assert!(queue.is_empty());
        assert_eq!(manager.state(), LifecycleState::NoSession);

        manager
            .start_session(&config, NodeId::from_seed(1), &hub, &queue)
            .unwrap();
        let session = manager.session_mut().unwrap();
        assert_eq!(session.frame(), config.base_frame);
        session.advance_if_ready(0.05);
        assert!(session.world().is_empty());
    }

    #[test]
    fn test_end_without_session() {
        let queue = CommandQueue::bounded(4);
        let mut manager = EpisodeManager::new(Box::new(NullRecorder));
        assert!(matches!(
            manager.end_session(&queue),
            Err(EngineError::NoSession)
        ));
    }

    #[test]
    fn test_role_stable_within_session() {
        let hub = LoopbackHub::new();
        let queue = CommandQueue::bounded(4);
        let mut manager = EpisodeManager::new(Box::new(NullRecorder));
        manager
            .start_session(&EngineConfig::default(), NodeId::from_seed(1), &hub, &queue)
            .unwrap();

        let session = manager.session().unwrap();
        let flipped = EngineConfig {
            primary_address: "127.0.0.1".to_string(),
            ..Default::default()
        };
        assert_eq!(session.resolve_role(&flipped), NodeRole::Primary);
        assert_eq!(session.resolve_role(&flipped), session.role());
    }

    #[test]
    fn test_secondary_forced_asynchronous() {
        let hub = LoopbackHub::new();
        let queue = CommandQueue::bounded(4);
        let mut manager = EpisodeManager::new(Box::new(NullRecorder));
        let mut config = sync_config();
        config.primary_address = "127.0.0.1".to_string();

        manager
            .start_session(&config, NodeId::from_seed(2), &hub, &queue)
            .unwrap();
        let session = manager.session_mut().unwrap();
        assert_eq!(session.role(), NodeRole::Secondary);
        assert_eq!(
            session.advance_if_ready(0.05),
            TickOutcome::Advanced { frame: 1 }
        );
    }
}
