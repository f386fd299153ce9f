//! framecast core - tick orchestration and multi-node frame distribution
//!
//! Decides when a frame happens, who owns authoritative state and how that
//! state moves between nodes:
//! 1. **Frame clock**: free-running or lock-step on client tick-cues
//! 2. **Roles**: one primary drives the clock, secondaries follow its deltas
//! 3. **Frame data channel**: versioned per-frame deltas, best-effort fan-out
//!
//! Everything runs from [`Engine::tick`], called once per host frame.

pub mod clock;
pub mod command;
pub mod engine;
pub mod episode;
pub mod error;
pub mod frame_data;
pub mod observer;
pub mod role;
pub mod rpc;
pub mod settings;
pub mod world;

#[cfg(test)]
mod testing;

// Re-export key types for convenience
pub use clock::{ExecutionMode, FrameClock, TickOutcome};
pub use command::{Command, CommandHandle, CommandQueue, CommandServer, SubmitError, TickCue};
pub use engine::{Engine, FrameSummary, NoopSimulation, Simulation, TickReport};
pub use episode::{EpisodeManager, LifecycleState, NullRecorder, Recorder, Session, SessionId};
pub use error::{CodecError, ConfigError, EngineError};
pub use frame_data::{
    ActorIdMap, ApplyReport, FanOutReport, FrameDataChannel, FrameDelta, FrameEvent,
};
pub use observer::{
    BroadcastChannelSink, BroadcastEnvelope, BroadcastSink, WorldObserver, WorldSnapshot,
};
pub use role::{resolve_role, Connection, ConnectionTable, NodeRole, RoleNegotiator, RoleState};
pub use rpc::{RpcResponse, RpcServer};
pub use settings::{EngineConfig, EpisodeSettings};
pub use world::{Actor, ActorId, Transform, World};
