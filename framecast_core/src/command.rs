//! Command server: the hand-off between RPC workers and the tick thread.
//!
//! RPC workers deserialize remote calls into [`Command`]s and push them into
//! a bounded queue through a cloneable [`CommandHandle`]. The tick thread is
//! the queue's only consumer. It drains at most `max_commands` per call to
//! [`CommandServer::run_some`], so one chatty client cannot stall a frame.
//!
//! A `Tick` command never reaches the caller of `run_some`; it only raises
//! the [`TickCue`] that gates synchronous mode.

use crate::settings::EpisodeSettings;
use crate::world::{ActorId, Transform};
use crossbeam::channel::{self, Receiver, Sender, TryRecvError, TrySendError};
use nalgebra::Vector3;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

/// A remote call, as queued for the tick thread.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum Command {
    /// Tick-cue for synchronous mode
    Tick,

    ApplySettings {
        settings: EpisodeSettings,
    },

    SetSynchronousMode {
        enabled: bool,
    },

    /// `None` clears the fixed step
    SetFixedDeltaSeconds {
        seconds: Option<f64>,
    },

    SpawnActor {
        type_id: String,
        #[serde(default)]
        transform: Transform,
    },

    DestroyActor {
        actor: ActorId,
    },

    SetActorTransform {
        actor: ActorId,
        transform: Transform,
    },

    SetActorVelocity {
        actor: ActorId,
        velocity: Vector3<f64>,
    },

    /// Opaque per-actor control payload
    ApplyControl {
        actor: ActorId,
        payload: Vec<u8>,
    },
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Tick => "tick",
            Command::ApplySettings { .. } => "apply_settings",
            Command::SetSynchronousMode { .. } => "set_synchronous_mode",
            Command::SetFixedDeltaSeconds { .. } => "set_fixed_delta_seconds",
            Command::SpawnActor { .. } => "spawn_actor",
            Command::DestroyActor { .. } => "destroy_actor",
            Command::SetActorTransform { .. } => "set_actor_transform",
            Command::SetActorVelocity { .. } => "set_actor_velocity",
            Command::ApplyControl { .. } => "apply_control",
        }
    }
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SubmitError {
    #[error("command queue is full")]
    QueueFull,

    #[error("command queue is closed")]
    Closed,
}

/// Bounded multi-producer, single-consumer command queue.
pub struct CommandQueue {
    sender: Sender<Command>,
    receiver: Receiver<Command>,
}

impl CommandQueue {
    pub fn bounded(capacity: usize) -> Self {
        let (sender, receiver) = channel::bounded(capacity.max(1));
        Self { sender, receiver }
    }

    /// Producer handle for RPC workers.
    pub fn handle(&self) -> CommandHandle {
        CommandHandle {
            sender: self.sender.clone(),
        }
    }

    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }

    /// Drops every queued command and returns how many were dropped.
    pub fn discard(&self) -> usize {
        self.receiver.try_iter().count()
    }

    pub(crate) fn receiver(&self) -> Receiver<Command> {
        self.receiver.clone()
    }
}

/// Cloneable producer side of the command queue.
#[derive(Clone)]
pub struct CommandHandle {
    sender: Sender<Command>,
}

impl CommandHandle {
    /// Never blocks: a full queue is reported back to the remote client.
    pub fn submit(&self, command: Command) -> Result<(), SubmitError> {
        self.sender.try_send(command).map_err(|e| match e {
            TrySendError::Full(_) => SubmitError::QueueFull,
            TrySendError::Disconnected(_) => SubmitError::Closed,
        })
    }

    /// Commands queued and not yet drained.
    pub fn pending(&self) -> usize {
        self.sender.len()
    }
}

/// At most one pending tick-cue.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickCue {
    pending: bool,
}

impl TickCue {
    /// Idempotent: repeated cues before consumption collapse to one.
    pub fn signal(&mut self) {
        self.pending = true;
    }

    pub fn is_pending(&self) -> bool {
        self.pending
    }

    /// Consumes the pending cue, if any.
    pub fn take(&mut self) -> bool {
        std::mem::take(&mut self.pending)
    }

    pub fn clear(&mut self) {
        self.pending = false;
    }
}

/// Tick-thread side of the command queue, owned by a primary session.
pub struct CommandServer {
    receiver: Receiver<Command>,
    max_commands: usize,
    cue: TickCue,
}

impl CommandServer {
    pub fn attach(queue: &CommandQueue, max_commands: usize) -> Self {
        Self {
            receiver: queue.receiver(),
            max_commands: max_commands.max(1),
            cue: TickCue::default(),
        }
    }

    pub fn max_commands(&self) -> usize {
        self.max_commands
    }

    /// Drains up to `max_commands` queued commands without blocking.
    ///
    /// `Tick` raises the cue; everything else goes to `apply`. Returns the
    /// number of commands taken off the queue.
    pub fn run_some<F>(&mut self, max_commands: usize, mut apply: F) -> usize
    where
        F: FnMut(Command),
    {
        let mut drained = 0;
        while drained < max_commands {
            match self.receiver.try_recv() {
                Ok(Command::Tick) => {
                    drained += 1;
                    self.cue.signal();
                }
                Ok(command) => {
                    drained += 1;
                    apply(command);
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    warn!("Command queue disconnected");
                    break;
                }
            }
        }
        if drained > 0 {
            debug!("Drained {} commands", drained);
        }
        drained
    }

    /// `run_some` bounded by the configured drain size.
    pub fn run_configured<F>(&mut self, apply: F) -> usize
    where
        F: FnMut(Command),
    {
        self.run_some(self.max_commands, apply)
    }

    pub fn tick_cue_received(&self) -> bool {
        self.cue.is_pending()
    }

    pub fn tick_cue_mut(&mut self) -> &mut TickCue {
        &mut self.cue
    }

    /// Discards everything still queued, including pending cues.
    pub fn discard_pending(&mut self) -> usize {
        self.cue.clear();
        self.receiver.try_iter().count()
    }
}
