//! SimCluster - one primary and N secondaries on a shared virtual network.

use crate::context::SimContext;
use crate::exporter::{NodeFrame, RecordingSink, SimFrame};
use crate::kinematics::KinematicSimulation;
use crate::network::SimRouter;

use framecast_core::{
    Actor, ActorId, Command, CommandHandle, Engine, EngineConfig, EngineError, FrameDataChannel,
    Recorder, Session, SessionId, SubmitError, TickReport, Transform, World,
};
use framecast_env::NodeId;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Configuration for a simulated cluster.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Master seed for determinism
    pub seed: u64,

    pub secondaries: usize,

    pub synchronous: bool,

    pub fixed_delta_seconds: Option<f64>,

    pub max_commands_per_drain: usize,

    pub base_frame: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            secondaries: 3,
            synchronous: false,
            fixed_delta_seconds: None,
            max_commands_per_drain: framecast_core::settings::DEFAULT_MAX_COMMANDS_PER_DRAIN,
            base_frame: 0,
        }
    }
}

/// Counts recorder notifications.
#[derive(Clone, Default)]
pub struct TickLedger {
    sessions: Arc<AtomicU64>,
    ticks: Arc<AtomicU64>,
    ended: Arc<AtomicU64>,
}

impl TickLedger {
    pub fn sessions(&self) -> u64 {
        self.sessions.load(Ordering::Acquire)
    }

    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Acquire)
    }

    pub fn ended(&self) -> u64 {
        self.ended.load(Ordering::Acquire)
    }
}

impl Recorder for TickLedger {
    fn set_session(&mut self, _session: &Session) {
        self.sessions.fetch_add(1, Ordering::AcqRel);
    }

    fn ticking(&mut self, _delta_seconds: f64) {
        self.ticks.fetch_add(1, Ordering::AcqRel);
    }

    fn check_resume_after_load(&mut self) {}

    fn session_ended(&mut self, _session: SessionId) {
        self.ended.fetch_add(1, Ordering::AcqRel);
    }
}

pub struct SimNode {
    pub id: NodeId,
    pub engine: Engine<SimContext>,
    pub broadcasts: RecordingSink,
    pub ledger: TickLedger,
}

impl SimNode {
    fn new(
        id: NodeId,
        config: EngineConfig,
        context: Arc<SimContext>,
        router: &SimRouter,
        physics_seed: u64,
    ) -> Self {
        let broadcasts = RecordingSink::new();
        let ledger = TickLedger::default();
        let mut engine = Engine::new(config, id, context, Arc::new(router.clone()))
            .with_simulation(Box::new(KinematicSimulation::new(physics_seed)))
            .with_recorder(Box::new(ledger.clone()));
        engine.add_sink(Box::new(broadcasts.clone()));

        Self {
            id,
            engine,
            broadcasts,
            ledger,
        }
    }

    pub fn session(&self) -> Option<&Session> {
        self.engine.episodes().session()
    }

    pub fn frame(&self) -> Option<u64> {
        self.session().map(|s| s.frame())
    }

    pub fn world(&self) -> Option<&World> {
        self.session().map(|s| s.world())
    }

    pub fn channel(&self) -> Option<&FrameDataChannel> {
        self.session().map(|s| s.channel())
    }
}

#[derive(Debug, Clone)]
pub struct ClusterTick {
    pub primary: TickReport,
    pub secondaries: Vec<TickReport>,
}

/// The cluster container.
pub struct SimCluster {
    pub config: ClusterConfig,

    /// Shared virtual clock
    pub context: Arc<SimContext>,

    pub router: SimRouter,

    pub primary: SimNode,

    pub secondaries: Vec<SimNode>,

    /// Traffic source, seeded like the primary's physics
    traffic: KinematicSimulation,

    /// First id not yet promised to queued spawns
    reserved_id: ActorId,

    tick_count: u64,
}

impl SimCluster {
    pub fn new(config: ClusterConfig) -> Self {
        let context = SimContext::shared(config.seed);
        let router = SimRouter::new();
        let physics_seed = context.derive_seed(0x5157);

        let mut primary_config = EngineConfig {
            max_commands_per_drain: config.max_commands_per_drain,
            base_frame: config.base_frame,
            ..Default::default()
        };
        primary_config.episode.synchronous_mode = config.synchronous;
        primary_config.episode.fixed_delta_seconds = config.fixed_delta_seconds;

        let primary = SimNode::new(
            NodeId::from_seed(context.derive_seed(0)),
            primary_config,
            context.clone(),
            &router,
            physics_seed,
        );

        let secondaries = (0..config.secondaries)
            .map(|i| Self::secondary_node(i, &context, &router, physics_seed))
            .collect();

        Self {
            config,
            context,
            router,
            primary,
            secondaries,
            traffic: KinematicSimulation::new(physics_seed),
            reserved_id: 1,
            tick_count: 0,
        }
    }

    fn secondary_node(
        index: usize,
        context: &Arc<SimContext>,
        router: &SimRouter,
        physics_seed: u64,
    ) -> SimNode {
        let config = EngineConfig {
            primary_address: "sim-primary".to_string(),
            ..Default::default()
        };
        SimNode::new(
            NodeId::from_seed(context.derive_seed(index as u64 + 1)),
            config,
            context.clone(),
            router,
            physics_seed,
        )
    }

    /// Starts the primary, then every secondary.
    pub fn start(&mut self) -> Result<(), EngineError> {
        self.primary.engine.start_session()?;
        for node in &mut self.secondaries {
            node.engine.start_session()?;
        }
        Ok(())
    }

    /// Ends every session and starts fresh ones, primary first.
    pub fn restart(&mut self) -> Result<(), EngineError> {
        for node in &mut self.secondaries {
            node.engine.end_session()?;
        }
        self.primary.engine.end_session()?;
        self.reserved_id = 1;
        self.start()
    }

    /// Ends and restarts only the primary; secondaries keep their sessions.
    pub fn restart_primary(&mut self) -> Result<(), EngineError> {
        self.primary.engine.end_session()?;
        self.reserved_id = 1;
        self.primary.engine.start_session()?;
        Ok(())
    }

    /// Adds a secondary to a running cluster and starts its session.
    pub fn join_secondary(&mut self) -> Result<NodeId, EngineError> {
        let physics_seed = self.context.derive_seed(0x5157);
        let mut node = Self::secondary_node(
            self.secondaries.len(),
            &self.context,
            &self.router,
            physics_seed,
        );
        node.engine.start_session()?;
        let id = node.id;
        self.secondaries.push(node);
        Ok(id)
    }

    pub fn command_handle(&self) -> CommandHandle {
        self.primary.engine.command_handle()
    }

    /// Ids the next `count` queued spawns will get on the primary.
    fn reserve_ids(&mut self, count: usize) -> ActorId {
        let next = self.primary.world().and_then(World::next_id).unwrap_or(1);
        let first_id = next.max(self.reserved_id);
        self.reserved_id = first_id + count as ActorId;
        first_id
    }

    /// Queues one actor that never moves; returns its primary id.
    pub fn spawn_static(
        &mut self,
        type_id: &str,
        transform: Transform,
    ) -> Result<ActorId, SubmitError> {
        let id = self.reserve_ids(1);
        self.command_handle().submit(Command::SpawnActor {
            type_id: type_id.to_string(),
            transform,
        })?;
        Ok(id)
    }

    /// Queues `count` moving actors on the primary; returns commands sent.
    pub fn spawn_traffic(&mut self, count: usize) -> Result<usize, SubmitError> {
        let first_id = self.reserve_ids(count);

        let handle = self.command_handle();
        let commands = self.traffic.traffic(count, first_id);
        let sent = commands.len();
        for command in commands {
            handle.submit(command)?;
        }
        Ok(sent)
    }

    /// Commands waiting on the primary.
    pub fn pending_commands(&self) -> usize {
        self.primary.engine.command_handle().pending()
    }

    pub fn secondary_ids(&self) -> Vec<NodeId> {
        self.secondaries.iter().map(|n| n.id).collect()
    }

    pub fn tick_count(&self) -> u64 {
        self.tick_count
    }

    /// One host frame on every node: the primary first, then secondaries.
    pub fn tick(&mut self, delta_seconds: f64) -> ClusterTick {
        self.context
            .advance_time(Duration::from_secs_f64(delta_seconds));
        self.tick_count += 1;

        let primary = self.primary.engine.tick(delta_seconds);
        let secondaries = self
            .secondaries
            .iter_mut()
            .map(|node| node.engine.tick(delta_seconds))
            .collect();

        ClusterTick {
            primary,
            secondaries,
        }
    }

    /// True when secondary `index` holds the same actors as the primary.
    pub fn secondary_matches_primary(&self, index: usize) -> bool {
        let (Some(primary), Some(secondary)) = (
            self.primary.world(),
            self.secondaries.get(index).and_then(|n| n.world()),
        ) else {
            return false;
        };
        worlds_equivalent(primary, secondary)
    }

    /// Samples every node's last broadcast.
    pub fn sample(&self) -> SimFrame {
        let nodes = std::iter::once(&self.primary)
            .chain(self.secondaries.iter())
            .filter_map(|node| {
                node.broadcasts
                    .last()
                    .map(|envelope| NodeFrame::from_envelope(node.id.to_string(), &envelope))
            })
            .collect();

        SimFrame {
            tick: self.tick_count,
            time_sec: self.context.time_ns() as f64 / 1e9,
            nodes,
            events: Vec::new(),
        }
    }
}

/// Same actors, compared in id order, ignoring local ids.
pub fn worlds_equivalent(a: &World, b: &World) -> bool {
    fn key(actor: &Actor) -> (&str, framecast_core::Transform, nalgebra::Vector3<f64>) {
        (actor.type_id.as_str(), actor.transform, actor.velocity)
    }

    a.len() == b.len() && a.actors().map(key).eq(b.actors().map(key))
}
