//! Production implementation of NodeContext using Tokio.

use crate::NodeContext;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Production context backed by Tokio timers and the system clock.
pub struct TokioContext {
    /// Start time for monotonic duration calculations
    start: Instant,

    /// Runtime the context spawns onto
    handle: tokio::runtime::Handle,
}

impl TokioContext {
    /// Creates a new TokioContext bound to the given runtime.
    pub fn new(handle: tokio::runtime::Handle) -> Self {
        Self {
            start: Instant::now(),
            handle,
        }
    }

    /// Creates a context bound to the runtime of the calling task.
    ///
    /// # Panics
    /// When called outside a tokio runtime.
    pub fn current() -> Self {
        Self::new(tokio::runtime::Handle::current())
    }

    /// Creates an Arc-wrapped context for sharing across tasks.
    pub fn shared(handle: tokio::runtime::Handle) -> Arc<Self> {
        Arc::new(Self::new(handle))
    }

    /// Returns the runtime handle backing this context.
    pub fn handle(&self) -> &tokio::runtime::Handle {
        &self.handle
    }
}

#[async_trait]
impl NodeContext for TokioContext {
    fn now(&self) -> Duration {
        self.start.elapsed()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }

    fn spawn<F>(&self, name: &str, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let name = name.to_string();
        self.handle.spawn(async move {
            tracing::trace!(task = %name, "task started");
            future.await;
            tracing::trace!(task = %name, "task finished");
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_tokio_context_time() {
        let ctx = TokioContext::current();
        let t1 = ctx.now();
        ctx.sleep(Duration::from_millis(10)).await;
        let t2 = ctx.now();

        assert!(t2 > t1);
        assert!(t2 - t1 >= Duration::from_millis(10));
    }

    #[tokio::test]
    async fn test_tokio_context_spawn() {
        let ctx = TokioContext::current();
        let (tx, rx) = tokio::sync::oneshot::channel();

        ctx.spawn("answer", async move {
            let _ = tx.send(42u32);
        });

        assert_eq!(rx.await.unwrap(), 42);
    }
}
