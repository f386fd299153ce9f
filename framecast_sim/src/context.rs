//! Simulation context implementing NodeContext with a virtual clock.

use async_trait::async_trait;
use framecast_env::NodeContext;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Simulation context backed by a manually advanced clock.
///
/// Every node in a cluster shares one context, so envelope timestamps line
/// up across nodes and a run is reproducible from its seed.
pub struct SimContext {
    /// Master seed for this simulation
    seed: u64,

    /// Current virtual time (nanoseconds since simulation start)
    virtual_time_ns: Arc<AtomicU64>,
}

impl SimContext {
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            virtual_time_ns: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Creates an Arc-wrapped context for sharing.
    pub fn shared(seed: u64) -> Arc<Self> {
        Arc::new(Self::new(seed))
    }

    pub fn advance_time(&self, duration: Duration) {
        self.virtual_time_ns
            .fetch_add(duration.as_nanos() as u64, Ordering::AcqRel);
    }

    pub fn time_ns(&self) -> u64 {
        self.virtual_time_ns.load(Ordering::Acquire)
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Derives an independent sub-seed (physics, node ids, ...).
    pub fn derive_seed(&self, stream: u64) -> u64 {
        self.seed.wrapping_mul(0x9e3779b97f4a7c15) ^ stream
    }
}

impl Clone for SimContext {
    fn clone(&self) -> Self {
        Self {
            seed: self.seed,
            virtual_time_ns: Arc::clone(&self.virtual_time_ns),
        }
    }
}

#[async_trait]
impl NodeContext for SimContext {
    fn now(&self) -> Duration {
        Duration::from_nanos(self.time_ns())
    }

    async fn sleep(&self, duration: Duration) {
        // Sleeping just moves virtual time forward
        self.advance_time(duration);
    }

    fn spawn<F>(&self, name: &str, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(future);
            }
            Err(_) => warn!("No runtime for sim task '{}'; dropped", name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sim_context_time() {
        let ctx = SimContext::new(42);
        assert_eq!(ctx.now(), Duration::ZERO);

        ctx.advance_time(Duration::from_secs(1));
        assert_eq!(ctx.now(), Duration::from_secs(1));

        ctx.advance_time(Duration::from_millis(500));
        assert_eq!(ctx.now_ms(), 1500);
    }

    #[test]
    fn test_sim_context_clone_shares_time() {
        let ctx1 = SimContext::new(42);
        let ctx2 = ctx1.clone();

        ctx1.advance_time(Duration::from_secs(5));
        assert_eq!(ctx1.now(), ctx2.now());
    }

    #[test]
    fn test_derived_seeds_differ_per_stream() {
        let ctx = SimContext::new(7);
        assert_eq!(ctx.derive_seed(1), SimContext::new(7).derive_seed(1));
        assert_ne!(ctx.derive_seed(1), ctx.derive_seed(2));
    }

    #[tokio::test]
    async fn test_sleep_advances_virtual_time() {
        let ctx = SimContext::new(1);
        ctx.sleep(Duration::from_millis(250)).await;
        assert_eq!(ctx.now_ms(), 250);
    }
}
