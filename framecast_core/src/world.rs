//! Session-local world state.
//!
//! The world only holds what the frame engine has to move between nodes:
//! actor identity, kinematic state and the last control payload. Physics and
//! rendering live in the [`Simulation`](crate::engine::Simulation)
//! collaborator, which mutates the world through the methods below.
//!
//! Every mutation is journaled so the primary can capture exactly what changed
//! during a frame. The journal is cleared after each capture.

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

pub type ActorId = u32;

/// Location in meters, rotation as (pitch, yaw, roll) in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Transform {
    pub location: Vector3<f64>,
    pub rotation: Vector3<f64>,
}

impl Transform {
    pub fn new(location: Vector3<f64>, rotation: Vector3<f64>) -> Self {
        Self { location, rotation }
    }

    pub fn at(x: f64, y: f64, z: f64) -> Self {
        Self {
            location: Vector3::new(x, y, z),
            rotation: Vector3::zeros(),
        }
    }
}

impl Default for Transform {
    fn default() -> Self {
        Self::at(0.0, 0.0, 0.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Actor {
    pub id: ActorId,

    /// Blueprint-style type tag, e.g. `vehicle.sedan`
    pub type_id: String,

    pub transform: Transform,

    /// Linear velocity in m/s
    pub velocity: Vector3<f64>,

    /// Last control payload applied; opaque to the engine
    pub control: Option<Vec<u8>>,
}

/// Structural changes recorded in order.
#[derive(Debug, Clone, PartialEq)]
pub enum WorldChange {
    Spawned {
        id: ActorId,
        type_id: String,
        transform: Transform,
    },
    Destroyed {
        id: ActorId,
    },
}

#[derive(Debug, Clone)]
pub struct World {
    actors: BTreeMap<ActorId, Actor>,

    /// None once the id space is used up
    next_id: Option<ActorId>,

    changes: Vec<WorldChange>,
    moved: BTreeSet<ActorId>,
    controlled: BTreeMap<ActorId, Vec<u8>>,
}

impl Default for World {
    fn default() -> Self {
        Self {
            actors: BTreeMap::new(),
            next_id: Some(1),
            changes: Vec::new(),
            moved: BTreeSet::new(),
            controlled: BTreeMap::new(),
        }
    }
}

impl World {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ids are never reused; returns None once they run out.
    pub fn spawn(&mut self, type_id: impl Into<String>, transform: Transform) -> Option<ActorId> {
        let id = self.next_id?;
        self.next_id = id.checked_add(1);

        let type_id = type_id.into();
        self.actors.insert(
            id,
            Actor {
                id,
                type_id: type_id.clone(),
                transform,
                velocity: Vector3::zeros(),
                control: None,
            },
        );
        self.changes.push(WorldChange::Spawned {
            id,
            type_id,
            transform,
        });
        Some(id)
    }

    /// Returns false if the actor does not exist.
    pub fn destroy(&mut self, id: ActorId) -> bool {
        if self.actors.remove(&id).is_none() {
            return false;
        }
        self.moved.remove(&id);
        self.controlled.remove(&id);
        self.changes.push(WorldChange::Destroyed { id });
        true
    }

    pub fn set_transform(&mut self, id: ActorId, transform: Transform) -> bool {
        match self.actors.get_mut(&id) {
            Some(actor) => {
                actor.transform = transform;
                self.moved.insert(id);
                true
            }
            None => false,
        }
    }

    pub fn set_velocity(&mut self, id: ActorId, velocity: Vector3<f64>) -> bool {
        match self.actors.get_mut(&id) {
            Some(actor) => {
                actor.velocity = velocity;
                self.moved.insert(id);
                true
            }
            None => false,
        }
    }

    /// Stores the payload as the actor's current control.
    pub fn apply_control(&mut self, id: ActorId, payload: Vec<u8>) -> bool {
        match self.actors.get_mut(&id) {
            Some(actor) => {
                actor.control = Some(payload.clone());
                self.controlled.insert(id, payload);
                true
            }
            None => false,
        }
    }

    pub fn actor(&self, id: ActorId) -> Option<&Actor> {
        self.actors.get(&id)
    }

    /// Actors in id order.
    pub fn actors(&self) -> impl Iterator<Item = &Actor> {
        self.actors.values()
    }

    pub fn actor_ids(&self) -> Vec<ActorId> {
        self.actors.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.actors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actors.is_empty()
    }

    /// Id the next spawn will receive.
    pub fn next_id(&self) -> Option<ActorId> {
        self.next_id
    }

    pub fn changes(&self) -> &[WorldChange] {
        &self.changes
    }

    /// Actors whose transform or velocity changed since the last clear.
    pub fn moved(&self) -> impl Iterator<Item = ActorId> + '_ {
        self.moved.iter().copied()
    }

    pub fn controlled(&self) -> impl Iterator<Item = (ActorId, &Vec<u8>)> + '_ {
        self.controlled.iter().map(|(id, payload)| (*id, payload))
    }

    pub fn journal_is_empty(&self) -> bool {
        self.changes.is_empty() && self.moved.is_empty() && self.controlled.is_empty()
    }

    pub fn clear_journal(&mut self) {
        self.changes.clear();
        self.moved.clear();
        self.controlled.clear();
    }
}
