//! Core environment context trait for framecast nodes.

use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;

/// The central interface for environment interaction.
///
/// Abstracts time and task spawning so the transport layer can run against
/// real tokio timers in production and a virtual clock in the simulation
/// harness.
///
/// # Implementations
///
/// - **Production**: `TokioContext` - wraps `tokio::time`
/// - **Simulation**: `SimContext` - manually advanced virtual clock
#[async_trait]
pub trait NodeContext: Send + Sync + 'static {
    /// Returns the current monotonic time since context creation.
    ///
    /// Used to timestamp outgoing frame envelopes.
    fn now(&self) -> Duration;

    /// Suspends execution for the given duration.
    ///
    /// Reconnect backoff goes through here so a simulated context can
    /// compress it.
    async fn sleep(&self, duration: Duration);

    /// Spawns a background task.
    fn spawn<F>(&self, name: &str, future: F)
    where
        F: Future<Output = ()> + Send + 'static;

    /// Returns `now()` in whole milliseconds.
    fn now_ms(&self) -> u64 {
        self.now().as_millis() as u64
    }
}
