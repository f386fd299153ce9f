//! Kinematic stand-in for the physics/rendering collaborator.
//!
//! Actors move at constant velocity. Traffic (spawn positions and speeds) is
//! drawn from a seeded ChaCha8 stream, so a scenario replays identically for
//! the same seed.

use framecast_core::{ActorId, Command, EpisodeSettings, Simulation, Transform, World};
use nalgebra::Vector3;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing::debug;

pub struct KinematicSimulation {
    /// Separate from the network seed so topology changes don't alter traffic
    physics_rng: ChaCha8Rng,

    substepping: bool,
    max_substep_delta_time: f64,
    max_substeps: u32,
    no_rendering_mode: bool,

    /// Lighting refresh owed to clients after a rendering toggle
    visual_update_pending: bool,

    steps: u64,
}

impl KinematicSimulation {
    pub fn new(physics_seed: u64) -> Self {
        let defaults = EpisodeSettings::default();
        Self {
            physics_rng: ChaCha8Rng::seed_from_u64(physics_seed),
            substepping: defaults.substepping,
            max_substep_delta_time: defaults.max_substep_delta_time,
            max_substeps: defaults.max_substeps,
            no_rendering_mode: defaults.no_rendering_mode,
            visual_update_pending: false,
            steps: 0,
        }
    }

    pub fn steps(&self) -> u64 {
        self.steps
    }

    /// Number of integration steps for one frame.
    pub fn substeps_for(&self, delta_seconds: f64) -> u32 {
        if !self.substepping || delta_seconds <= self.max_substep_delta_time {
            return 1;
        }
        let wanted = (delta_seconds / self.max_substep_delta_time).ceil() as u32;
        wanted.clamp(1, self.max_substeps.max(1))
    }

    /// Commands that spawn `count` moving actors.
    ///
    /// Ids are assigned in spawn order, so `first_id` must be the id the
    /// primary's world will hand out next.
    pub fn traffic(&mut self, count: usize, first_id: ActorId) -> Vec<Command> {
        let mut commands = Vec::with_capacity(count * 2);
        for i in 0..count {
            let lane = self.physics_rng.gen_range(0..4) as f64;
            let transform = Transform::new(
                Vector3::new(i as f64 * 15.0, lane * 3.5, 0.0),
                Vector3::new(0.0, self.physics_rng.gen_range(-10.0..10.0), 0.0),
            );
            let speed = self.physics_rng.gen_range(2.0..14.0);

            commands.push(Command::SpawnActor {
                type_id: "vehicle.sedan".to_string(),
                transform,
            });
            commands.push(Command::SetActorVelocity {
                actor: first_id + i as ActorId,
                velocity: Vector3::new(speed, 0.0, 0.0),
            });
        }
        commands
    }
}

impl Simulation for KinematicSimulation {
    fn step(&mut self, world: &mut World, delta_seconds: f64) {
        let substeps = self.substeps_for(delta_seconds);
        let dt = delta_seconds / substeps as f64;

        for id in world.actor_ids() {
            let Some(actor) = world.actor(id) else {
                continue;
            };
            if actor.velocity == Vector3::zeros() {
                continue;
            }

            let mut transform = actor.transform;
            let velocity = actor.velocity;
            for _ in 0..substeps {
                transform.location += velocity * dt;
            }
            world.set_transform(id, transform);
        }
        self.steps += 1;
    }

    fn apply_settings(&mut self, settings: &EpisodeSettings) {
        if settings.no_rendering_mode != self.no_rendering_mode {
            self.visual_update_pending = true;
        }
        self.no_rendering_mode = settings.no_rendering_mode;
        self.substepping = settings.substepping;
        self.max_substep_delta_time = settings.max_substep_delta_time;
        self.max_substeps = settings.max_substeps;
        debug!(
            "Physics settings: substepping={} max_dt={} max_substeps={}",
            self.substepping, self.max_substep_delta_time, self.max_substeps
        );
    }

    fn take_pending_visual_update(&mut self) -> bool {
        std::mem::take(&mut self.visual_update_pending)
    }
}
