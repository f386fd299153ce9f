//! Scenario runner - drives a SimCluster through fault-injection scenarios.

use crate::exporter::SimExport;
use crate::scenarios::ScenarioId;
use crate::world::{ClusterConfig, ClusterTick, SimCluster};

use framecast_core::{Command, TickReport, Transform};
use framecast_env::NetworkController;
use tracing::{debug, info, warn};

/// Results from running a scenario.
#[derive(Debug, Clone)]
pub struct ScenarioResult {
    pub scenario: ScenarioId,

    pub seed: u64,

    /// Whether scenario passed all assertions
    pub passed: bool,

    /// Host ticks executed
    pub total_ticks: u64,

    /// Final virtual time in seconds
    pub final_time_secs: f64,

    /// Primary frame number at the end
    pub final_frame: u64,

    /// Actors in the primary's world at the end
    pub final_actor_count: usize,

    pub failure_reason: Option<String>,

    pub metrics: ScenarioMetrics,
}

/// Metrics collected during scenario execution.
#[derive(Debug, Clone, Default)]
pub struct ScenarioMetrics {
    pub frames_published: u64,

    /// Primary ticks spent waiting for a tick-cue
    pub blocked_ticks: u64,

    /// Deliveries that failed (retryable or fatal)
    pub send_failures: u64,

    /// Deliveries skipped because the link was down
    pub sends_skipped: u64,

    /// Full-state frames sent to new, reconnected or lagging secondaries
    pub keyframes_sent: u64,

    pub deltas_applied: u64,

    /// Deltas secondaries refused (corrupt, stale or mismatched)
    pub deltas_rejected: u64,

    /// Mirrors rebuilt because the primary started a new session
    pub resyncs: u64,

    /// Envelopes the network refused
    pub packets_dropped: u64,

    pub packets_corrupted: u64,
}

/// Cluster plus bookkeeping for one run.
struct Harness {
    cluster: SimCluster,
    dt: f64,
    metrics: ScenarioMetrics,
    export: Option<SimExport>,
    export_interval: u64,
    failures: Vec<String>,
}

impl Harness {
    fn step(&mut self) -> ClusterTick {
        let tick = self.cluster.tick(self.dt);

        match &tick.primary {
            TickReport::Completed(summary) => {
                self.metrics.frames_published += 1;
                if let Some(fan_out) = &summary.fan_out {
                    self.metrics.send_failures += fan_out.failed.len() as u64;
                    self.metrics.sends_skipped += fan_out.skipped.len() as u64;
                    self.metrics.keyframes_sent += fan_out.keyframes.len() as u64;
                }
            }
            TickReport::Blocked { .. } => self.metrics.blocked_ticks += 1,
            TickReport::Idle => {}
        }
        for report in &tick.secondaries {
            if let TickReport::Completed(summary) = report {
                self.metrics.deltas_applied += summary.applied.len() as u64;
            }
        }

        let count = self.cluster.tick_count();
        if let Some(export) = &mut self.export {
            if count % self.export_interval == 0 {
                export.add_frame(self.cluster.sample());
            }
        }
        if count % 20 == 0 {
            debug!(
                "  t={:.2}s | frame={:?}",
                self.cluster.context.time_ns() as f64 / 1e9,
                self.cluster.primary.frame()
            );
        }
        tick
    }

    fn run_ticks(&mut self, ticks: u64) {
        for _ in 0..ticks {
            self.step();
        }
    }

    /// Steps until the primary's queue is empty, at most `max_ticks`.
    fn drain(&mut self, max_ticks: u64) -> u64 {
        let mut ticks = 0;
        while ticks < max_ticks && self.cluster.pending_commands() > 0 {
            self.step();
            ticks += 1;
        }
        ticks
    }

    fn event(&mut self, message: &str) {
        info!("  {}", message);
        if let Some(export) = &mut self.export {
            export.add_event(message, Some("info"));
        }
    }

    fn check(&mut self, condition: bool, failure: impl FnOnce() -> String) {
        if !condition {
            let reason = failure();
            warn!("  check failed: {}", reason);
            self.failures.push(reason);
        }
    }

    fn check_converged(&mut self, what: &str) {
        for index in 0..self.cluster.secondaries.len() {
            let matches = self.cluster.secondary_matches_primary(index);
            self.check(matches, || format!("secondary {} diverged {}", index, what));
        }
    }

    fn harvest_channel_stats(&mut self) {
        for node in &self.cluster.secondaries {
            if let Some(channel) = node.channel() {
                let stats = channel.stats();
                self.metrics.deltas_rejected += stats.rejected;
                self.metrics.resyncs += stats.resyncs;
            }
        }
    }

    fn finish(mut self, scenario: ScenarioId, seed: u64) -> (ScenarioResult, Option<SimExport>) {
        self.harvest_channel_stats();
        let router = self.cluster.router.stats();
        self.metrics.packets_dropped = router.dropped;
        self.metrics.packets_corrupted = router.corrupted;

        let passed = self.failures.is_empty();
        let failure_reason = (!passed).then(|| self.failures.join("; "));
        if let Some(export) = &mut self.export {
            export.finalize(passed, failure_reason.clone());
        }

        let result = ScenarioResult {
            scenario,
            seed,
            passed,
            total_ticks: self.cluster.tick_count(),
            final_time_secs: self.cluster.context.time_ns() as f64 / 1e9,
            final_frame: self.cluster.primary.frame().unwrap_or(0),
            final_actor_count: self.cluster.primary.world().map_or(0, |w| w.len()),
            failure_reason,
            metrics: self.metrics,
        };
        (result, self.export)
    }
}

/// Runs fault-injection scenarios.
pub struct ScenarioRunner {
    seed: u64,

    secondaries: usize,

    /// Host frame rate in Hz
    tick_rate_hz: u32,

    max_duration_secs: f64,

    /// Export a sample every N ticks
    export_interval: u64,
}

impl ScenarioRunner {
    pub fn new(seed: u64, secondaries: usize) -> Self {
        Self {
            seed,
            secondaries,
            tick_rate_hz: 20,
            max_duration_secs: 10.0,
            export_interval: 10,
        }
    }

    pub fn with_tick_rate(mut self, hz: u32) -> Self {
        self.tick_rate_hz = hz.max(1);
        self
    }

    pub fn with_duration(mut self, secs: f64) -> Self {
        self.max_duration_secs = secs;
        self
    }

    pub fn with_export_interval(mut self, ticks: u64) -> Self {
        self.export_interval = ticks.max(1);
        self
    }

    fn target_ticks(&self) -> u64 {
        ((self.max_duration_secs * self.tick_rate_hz as f64) as u64).max(10)
    }

    /// Runs a scenario and returns the result.
    pub fn run(&self, scenario: ScenarioId) -> ScenarioResult {
        self.execute(scenario, false).0
    }

    /// Runs a scenario and also returns its frame-by-frame export.
    pub fn run_recorded(&self, scenario: ScenarioId) -> (ScenarioResult, SimExport) {
        let (result, export) = self.execute(scenario, true);
        let export = export.unwrap_or_else(|| SimExport::new(scenario.name(), self.seed));
        (result, export)
    }

    fn execute(&self, scenario: ScenarioId, record: bool) -> (ScenarioResult, Option<SimExport>) {
        info!("Starting scenario: {} (seed={})", scenario.name(), self.seed);

        let config = match scenario {
            ScenarioId::LockStep => ClusterConfig {
                synchronous: true,
                fixed_delta_seconds: Some(1.0 / self.tick_rate_hz as f64),
                ..self.cluster_config()
            },
            ScenarioId::FanOut => ClusterConfig {
                secondaries: self.secondaries.max(8),
                ..self.cluster_config()
            },
            ScenarioId::PartitionIsolation => ClusterConfig {
                secondaries: self.secondaries.max(2),
                ..self.cluster_config()
            },
            _ => self.cluster_config(),
        };

        let mut harness = Harness {
            cluster: SimCluster::new(config),
            dt: 1.0 / self.tick_rate_hz as f64,
            metrics: ScenarioMetrics::default(),
            export: record.then(|| SimExport::new(scenario.name(), self.seed)),
            export_interval: self.export_interval,
            failures: Vec::new(),
        };

        if let Err(e) = harness.cluster.start() {
            harness.failures.push(format!("cluster failed to start: {}", e));
            return harness.finish(scenario, self.seed);
        }

        match scenario {
            ScenarioId::FreeRun => self.run_free_run(&mut harness),
            ScenarioId::LockStep => self.run_lock_step(&mut harness),
            ScenarioId::FanOut => self.run_fan_out(&mut harness),
            ScenarioId::EpisodeReset => self.run_episode_reset(&mut harness),
            ScenarioId::PartitionIsolation => self.run_partition_isolation(&mut harness),
            ScenarioId::CorruptDelta => self.run_corrupt_delta(&mut harness),
        }

        let (result, export) = harness.finish(scenario, self.seed);
        if result.passed {
            info!("✓ {} complete at frame {}", scenario.name(), result.final_frame);
        }
        (result, export)
    }

    fn cluster_config(&self) -> ClusterConfig {
        ClusterConfig {
            seed: self.seed,
            secondaries: self.secondaries,
            ..Default::default()
        }
    }

    fn queue_traffic(&self, harness: &mut Harness, count: usize) {
        match harness.cluster.spawn_traffic(count) {
            Ok(sent) => harness.event(&format!("queued {} traffic commands", sent)),
            Err(e) => harness.failures.push(format!("traffic rejected: {}", e)),
        }
    }

    /// FC-001: the primary free-runs one frame per host tick.
    fn run_free_run(&self, harness: &mut Harness) {
        info!("FC-001: FreeRun - asynchronous primary");
        self.queue_traffic(harness, 16);

        let ticks = self.target_ticks();
        harness.run_ticks(ticks);

        let frame = harness.cluster.primary.frame().unwrap_or(0);
        harness.check(frame == ticks, || {
            format!("primary at frame {} after {} ticks", frame, ticks)
        });
        for (index, node) in harness.cluster.secondaries.iter().enumerate() {
            let last = node.channel().and_then(|c| c.last_applied());
            if last != Some(frame) {
                harness
                    .failures
                    .push(format!("secondary {} last applied {:?}, expected {}", index, last, frame));
            }
        }
        harness.check_converged("after free run");
    }

    /// FC-002: frames only advance on tick-cues.
    fn run_lock_step(&self, harness: &mut Harness) {
        info!("FC-002: LockStep - synchronous mode");
        self.queue_traffic(harness, 4);

        let handle = harness.cluster.command_handle();
        let ticks = self.target_ticks();
        let mut cues = 0u64;
        for tick in 0..ticks {
            if tick % 4 == 0 && handle.submit(Command::Tick).is_ok() {
                cues += 1;
            }
            harness.step();
        }

        let frame = harness.cluster.primary.frame().unwrap_or(0);
        harness.check(frame == cues, || {
            format!("{} tick-cues produced frame {}", cues, frame)
        });
        let blocked = harness.metrics.blocked_ticks;
        harness.check(blocked == ticks - cues, || {
            format!("expected {} blocked ticks, saw {}", ticks - cues, blocked)
        });
        harness.check_converged("in lock-step");
    }

    /// FC-003: heavy fan-out to many secondaries.
    fn run_fan_out(&self, harness: &mut Harness) {
        let secondaries = harness.cluster.secondaries.len();
        info!("FC-003: FanOut - {} secondaries", secondaries);
        self.queue_traffic(harness, 64);

        let drained = harness.drain(self.target_ticks());
        harness.event(&format!("traffic drained in {} ticks", drained));

        let mut last_delivered = 0;
        for _ in 0..self.target_ticks() {
            if let TickReport::Completed(summary) = harness.step().primary {
                last_delivered = summary.fan_out.map_or(0, |f| f.delivered.len());
            }
        }

        harness.check(last_delivered == secondaries, || {
            format!("last frame reached {}/{} secondaries", last_delivered, secondaries)
        });
        let failures = harness.metrics.send_failures;
        harness.check(failures == 0, || format!("{} sends failed", failures));
        let actors = harness.cluster.primary.world().map_or(0, |w| w.len());
        harness.check(actors == 64, || format!("primary holds {} actors", actors));
        harness.check_converged("under fan-out");
    }

    /// FC-004: restart the primary's episode halfway through.
    ///
    /// Secondaries keep their sessions and have to notice the new primary
    /// session on their own.
    fn run_episode_reset(&self, harness: &mut Harness) {
        info!("FC-004: EpisodeReset - restart mid-run");
        self.queue_traffic(harness, 8);

        let half = self.target_ticks() / 2;
        harness.run_ticks(half);
        harness.check_converged("before restart");

        if let Err(e) = harness.cluster.restart_primary() {
            harness.failures.push(format!("restart failed: {}", e));
            return;
        }
        harness.event("primary episode restarted");

        let empty = harness.cluster.primary.world().is_some_and(|w| w.is_empty());
        harness.check(empty, || "primary world survived the restart".to_string());

        self.queue_traffic(harness, 3);
        harness.run_ticks(half);

        let frame = harness.cluster.primary.frame().unwrap_or(0);
        harness.check(frame == half, || {
            format!("frame {} after restart, expected {}", frame, half)
        });
        let ledger = &harness.cluster.primary.ledger;
        let (sessions, ended) = (ledger.sessions(), ledger.ended());
        harness.check(sessions == 2 && ended == 1, || {
            format!("recorder saw {} sessions, {} ended", sessions, ended)
        });
        let actors = harness.cluster.primary.world().map_or(0, |w| w.len());
        harness.check(actors == 3, || format!("{} actors after restart", actors));

        for index in 0..harness.cluster.secondaries.len() {
            let stats = harness.cluster.secondaries[index]
                .channel()
                .map(|c| c.stats())
                .unwrap_or_default();
            harness.check(stats.resyncs == 1 && stats.rejected == 0, || {
                format!(
                    "secondary {} saw {} resyncs and rejected {} deltas",
                    index, stats.resyncs, stats.rejected
                )
            });
        }
        harness.check_converged("after restart");
    }

    /// FC-005: a partitioned secondary misses frames without affecting the rest.
    fn run_partition_isolation(&self, harness: &mut Harness) {
        info!("FC-005: PartitionIsolation - one secondary cut off");
        self.queue_traffic(harness, 8);
        harness.drain(self.target_ticks());
        harness.run_ticks(5);

        let primary = harness.cluster.primary.id;
        let isolated = harness.cluster.secondaries[0].id;
        harness.cluster.router.partition(&[primary], &[isolated]);
        harness.event(&format!("partitioned {}", isolated));

        // Never moves, so only a keyframe can bring it to the isolated node.
        if let Err(e) = harness
            .cluster
            .spawn_static("prop.barrier", Transform::at(-20.0, 0.0, 0.0))
        {
            harness.failures.push(format!("static spawn rejected: {}", e));
        }

        let window = (self.target_ticks() / 3).max(5);
        harness.run_ticks(window);

        let cut_off = !harness.cluster.secondary_matches_primary(0);
        harness.check(cut_off, || "isolated secondary still tracked the primary".to_string());
        for index in 1..harness.cluster.secondaries.len() {
            let matches = harness.cluster.secondary_matches_primary(index);
            harness.check(matches, || format!("secondary {} hurt by the partition", index));
        }
        let skipped = harness.metrics.sends_skipped;
        harness.check(skipped >= window - 1, || {
            format!("dead link skipped only {} times", skipped)
        });

        harness.cluster.router.heal_all();
        harness.event("partition healed");
        let keyframes_before = harness.metrics.keyframes_sent;
        harness.run_ticks(5);
        let resent = harness.metrics.keyframes_sent - keyframes_before;
        harness.check(resent == 1, || {
            format!("{} keyframes after heal, expected 1", resent)
        });
        harness.check_converged("after heal");
    }

    /// FC-006: a garbled delta is rejected and the stream carries on.
    fn run_corrupt_delta(&self, harness: &mut Harness) {
        info!("FC-006: CorruptDelta - garbled frame");
        self.queue_traffic(harness, 6);
        harness.drain(self.target_ticks());
        harness.run_ticks(5);

        let target = harness.cluster.secondaries[0].id;
        harness.cluster.router.corrupt_next_delivery(target);
        harness.event(&format!("corrupting next delta to {}", target));
        harness.step();

        let rejected = harness.cluster.secondaries[0]
            .channel()
            .map_or(0, |c| c.stats().rejected);
        harness.check(rejected == 1, || format!("{} deltas rejected, expected 1", rejected));

        harness.run_ticks(5);
        harness.check_converged("after corrupt delta");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runner() -> ScenarioRunner {
        ScenarioRunner::new(42, 3).with_duration(2.0)
    }

    #[test]
    fn test_free_run_passes() {
        let result = runner().run(ScenarioId::FreeRun);
        assert!(result.passed, "{:?}", result.failure_reason);
        assert_eq!(result.final_frame, 40);
        assert_eq!(result.final_actor_count, 16);
        assert_eq!(result.metrics.deltas_applied, 3 * 40);
    }

    #[test]
    fn test_lock_step_passes() {
        let result = runner().run(ScenarioId::LockStep);
        assert!(result.passed, "{:?}", result.failure_reason);
        assert_eq!(result.final_frame, 10);
        assert_eq!(result.metrics.blocked_ticks, 30);
    }

    #[test]
    fn test_fault_scenarios_pass() {
        for scenario in [
            ScenarioId::FanOut,
            ScenarioId::EpisodeReset,
            ScenarioId::PartitionIsolation,
            ScenarioId::CorruptDelta,
        ] {
            let result = runner().run(scenario);
            assert!(result.passed, "{}: {:?}", scenario, result.failure_reason);
        }
    }

    #[test]
    fn test_partition_counts_drops() {
        let result = runner().run(ScenarioId::PartitionIsolation);
        assert!(result.metrics.packets_dropped >= 1);
        assert!(result.metrics.send_failures >= 1);
        // One per secondary at start, one more for the healed node.
        assert_eq!(result.metrics.keyframes_sent, 3 + 1);
    }

    #[test]
    fn test_episode_reset_resyncs_every_secondary() {
        let result = runner().run(ScenarioId::EpisodeReset);
        assert!(result.passed, "{:?}", result.failure_reason);
        assert_eq!(result.metrics.resyncs, 3);
        assert_eq!(result.metrics.deltas_rejected, 0);
    }

    #[test]
    fn test_same_seed_same_world() {
        let a = runner().run(ScenarioId::FreeRun);
        let b = runner().run(ScenarioId::FreeRun);
        assert_eq!(a.final_frame, b.final_frame);
        assert_eq!(a.metrics.deltas_applied, b.metrics.deltas_applied);
    }

    #[test]
    fn test_recorded_run_samples_frames() {
        let (result, export) = runner()
            .with_export_interval(5)
            .run_recorded(ScenarioId::CorruptDelta);
        assert!(result.passed);
        assert!(export.passed);
        assert!(!export.frames.is_empty());
        assert!(export
            .frames
            .iter()
            .all(|f| f.nodes.len() == 4));
    }
}
