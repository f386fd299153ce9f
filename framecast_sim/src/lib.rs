//! framecast Deterministic Simulation Harness
//!
//! Runs one primary and any number of secondaries in a single process, over
//! an in-memory network with fault injection, so the whole frame pipeline
//! can be exercised reproducibly.
//!
//! # Core Principle
//!
//! All sources of non-determinism are controlled:
//! - **Time**: a shared virtual clock, advanced once per host frame
//! - **Network**: ordered in-memory delivery with partitions, failed links
//!   and payload corruption on demand
//! - **Traffic**: spawn positions and speeds drawn from one seeded stream
//!
//! # Usage
//!
//! ```ignore
//! use framecast_sim::{ScenarioRunner, scenarios::ScenarioId};
//!
//! let result = ScenarioRunner::new(42, 3).run(ScenarioId::PartitionIsolation);
//! assert!(result.passed);
//! ```

mod context;
mod exporter;
mod kinematics;
mod network;
mod runner;
pub mod scenarios;
mod world;

pub use context::SimContext;
pub use exporter::{ActorPosition, NodeFrame, RecordingSink, SimEvent, SimExport, SimFrame};
pub use kinematics::KinematicSimulation;
pub use network::{RouterStats, SimNetwork, SimRouter};
pub use runner::{ScenarioMetrics, ScenarioResult, ScenarioRunner};
pub use world::{worlds_equivalent, ClusterConfig, ClusterTick, SimCluster, SimNode, TickLedger};
