//! The copy-engine boundary: a batch submission contract that a device DMA
//! engine, a io_uring-backed host engine, or (as implemented here) a
//! simulation engine can all satisfy identically from the executor's point
//! of view.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bcache_model::{Error, Result};
use rand::Rng;

/// One unit of work submitted to a copy engine: move `bytes` belonging to
/// `op_id` (an index into the caller's own op list — the engine does not
/// interpret it).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopyOp {
    pub op_id: u64,
    pub bytes: u64,
}

/// Reported once per submitted [`CopyOp`], possibly from a different thread
/// than the one that called `submit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopyCompletion {
    pub op_id: u64,
    pub bytes: u64,
    pub ok: bool,
}

pub type CompletionCallback = Arc<dyn Fn(CopyCompletion) + Send + Sync>;

/// A batch copy backend. `submit` must guarantee at-most-once completion per
/// `op_id` — callers (the node executor) additionally guard against a buggy
/// engine double-firing, but engines should not rely on that.
#[async_trait]
pub trait CopyEngine: Send + Sync {
    async fn submit(&self, ops: Vec<CopyOp>, completion: CompletionCallback) -> Result<()>;

    /// Optionally hands back a pinned host buffer for `nbytes`. Engines that
    /// don't support pinned memory return `None`, and callers fall back to a
    /// plain heap-allocated read.
    fn acquire_host_buffer(&self, _nbytes: usize) -> Option<Vec<u8>> {
        None
    }
}

/// A software engine that completes every op after a small random jitter,
/// used by the CLI simulation driver and by tests in place of a real DMA
/// backend.
#[derive(Debug, Default)]
pub struct SimCopyEngine {
    pub base_jitter: Duration,
}

impl SimCopyEngine {
    pub fn new() -> Self {
        SimCopyEngine {
            base_jitter: Duration::from_micros(50),
        }
    }
}

#[async_trait]
impl CopyEngine for SimCopyEngine {
    async fn submit(&self, ops: Vec<CopyOp>, completion: CompletionCallback) -> Result<()> {
        for op in ops {
            let jitter = {
                let mut rng = rand::thread_rng();
                self.base_jitter + Duration::from_micros(rng.gen_range(0..20))
            };
            let completion = completion.clone();
            tokio::spawn(async move {
                tokio::time::sleep(jitter).await;
                completion(CopyCompletion {
                    op_id: op.op_id,
                    bytes: op.bytes,
                    ok: true,
                });
            });
        }
        Ok(())
    }

    fn acquire_host_buffer(&self, nbytes: usize) -> Option<Vec<u8>> {
        Some(vec![0u8; nbytes])
    }
}

/// A copy engine stub that always fails submission, used to exercise the
/// executor's engine-failure fallback path in tests.
#[derive(Debug, Default)]
pub struct AlwaysFailingEngine;

#[async_trait]
impl CopyEngine for AlwaysFailingEngine {
    async fn submit(&self, _ops: Vec<CopyOp>, _completion: CompletionCallback) -> Result<()> {
        Err(Error::Engine("simulated engine outage".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn sim_engine_completes_every_submitted_op() {
        let engine = SimCopyEngine::new();
        let completed = Arc::new(AtomicUsize::new(0));
        let completed2 = completed.clone();
        let cb: CompletionCallback = Arc::new(move |_c| {
            completed2.fetch_add(1, Ordering::SeqCst);
        });
        engine
            .submit(
                vec![
                    CopyOp { op_id: 0, bytes: 4096 },
                    CopyOp { op_id: 1, bytes: 8192 },
                ],
                cb,
            )
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(completed.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failing_engine_reports_an_error_without_panicking() {
        let engine = AlwaysFailingEngine;
        let cb: CompletionCallback = Arc::new(|_| {});
        let err = engine
            .submit(vec![CopyOp { op_id: 0, bytes: 1 }], cb)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Engine(_)));
    }
}
