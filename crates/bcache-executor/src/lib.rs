//! Drives a plan's [`PlanOp`] list against a [`SegmentStore`] and an
//! optional [`CopyEngine`], reporting one `on_ready` event per op with an
//! at-most-once guarantee even if the engine double-fires a completion.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bcache_engine::{CopyEngine, CopyOp as EngineOp};
use bcache_model::{PlanOp, Result};
use bcache_store::SegmentStore;

/// Emitted once per [`PlanOp`] when its data has landed in the destination
/// tier (either via the copy engine or a direct fallback read).
#[derive(Debug, Clone, PartialEq)]
pub struct ReadyEvent {
    pub node: String,
    pub layer: u32,
    pub page_start: u64,
    pub page_end: u64,
    pub bytes: u64,
    pub finish_rel_ms: f64,
    pub on_time: bool,
}

pub type OnReady = Arc<dyn Fn(ReadyEvent) + Send + Sync>;

pub struct NodeExecutor {
    store: SegmentStore,
    engine: Option<Arc<dyn CopyEngine>>,
}

impl NodeExecutor {
    pub fn new(store: SegmentStore, engine: Option<Arc<dyn CopyEngine>>) -> Self {
        NodeExecutor { store, engine }
    }

    /// Runs every op in `ops` against the store (and engine, if present),
    /// invoking `on_ready` once per op regardless of which path completed
    /// it. Callback panics are caught and logged, never propagated.
    pub async fn execute(
        &self,
        model_id: &str,
        model_version: &str,
        ops: &[PlanOp],
        on_ready: OnReady,
    ) -> Result<()> {
        let window_start = Instant::now();
        let mut guards = Vec::with_capacity(ops.len());
        for _ in ops {
            guards.push(Arc::new(AtomicBool::new(false)));
        }

        for (idx, op) in ops.iter().enumerate() {
            let guard = guards[idx].clone();
            let nbytes = op.bytes as usize;

            let used_engine = if let Some(engine) = &self.engine {
                match engine.acquire_host_buffer(nbytes) {
                    Some(mut buf) => {
                        match self
                            .store
                            .read_range_into(model_id, model_version, op.layer, op.page_start, op.page_end, &mut buf)
                            .await
                        {
                            Ok(()) => {
                                let op_clone = op.clone();
                                let on_ready = on_ready.clone();
                                let start = window_start;
                                let guard2 = guard.clone();
                                let completion: bcache_engine::CompletionCallback = Arc::new(move |_c| {
                                    fire_once(&guard2, &op_clone, start, &on_ready);
                                });
                                match engine.submit(vec![EngineOp { op_id: idx as u64, bytes: op.bytes }], completion).await {
                                    Ok(()) => true,
                                    Err(e) => {
                                        tracing::warn!(error = %e, node = %op.node, layer = op.layer, "copy engine submit failed, falling back to plain read");
                                        false
                                    }
                                }
                            }
                            Err(e) => {
                                tracing::warn!(error = %e, node = %op.node, layer = op.layer, page_start = op.page_start, "storage read failed, skipping row");
                                continue;
                            }
                        }
                    }
                    None => false,
                }
            } else {
                false
            };

            if !used_engine {
                match self
                    .store
                    .read_range(model_id, model_version, op.layer, op.page_start, op.page_end)
                    .await
                {
                    Ok(_) => fire_once(&guard, op, window_start, &on_ready),
                    Err(e) => {
                        tracing::warn!(error = %e, node = %op.node, layer = op.layer, page_start = op.page_start, "storage read failed, skipping row");
                        continue;
                    }
                }
            }
        }

        Ok(())
    }
}

fn fire_once(guard: &AtomicBool, op: &PlanOp, window_start: Instant, on_ready: &OnReady) {
    if guard.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst).is_err() {
        tracing::warn!(node = %op.node, layer = op.layer, "duplicate completion suppressed");
        return;
    }
    let finish_rel_ms = window_start.elapsed().as_secs_f64() * 1000.0;
    let event = ReadyEvent {
        node: op.node.clone(),
        layer: op.layer,
        page_start: op.page_start,
        page_end: op.page_end,
        bytes: op.bytes,
        finish_rel_ms,
        on_time: finish_rel_ms <= op.deadline_ms,
    };
    let result = std::panic::catch_unwind(AssertUnwindSafe(|| on_ready(event)));
    if result.is_err() {
        tracing::error!(node = %op.node, layer = op.layer, "on_ready callback panicked; suppressed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bcache_engine::SimCopyEngine;
    use bcache_model::Tier;
    use camino::Utf8PathBuf;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    fn op(node: &str, layer: u32, start: u64, end: u64, bytes: u64) -> PlanOp {
        PlanOp {
            node: node.into(),
            layer,
            tier_src: Tier::Storage,
            tier_dst: Tier::Host,
            pcluster: 0,
            page_start: start,
            page_end: end,
            bytes,
            deadline_ms: 1000.0,
            priority: 0,
            overlap_depth: 0,
        }
    }

    async fn seeded_store(dir: &tempfile::TempDir, page_bytes: u64) -> SegmentStore {
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        let store = SegmentStore::new(root, page_bytes);
        for p in 0..4u64 {
            store.write_page("m", "v1", 0, p, &vec![7u8; page_bytes as usize]).await.unwrap();
        }
        store
    }

    #[tokio::test]
    async fn plain_fallback_path_fires_on_ready_without_an_engine() {
        let dir = tempfile::tempdir().unwrap();
        let store = seeded_store(&dir, 16).await;
        let executor = NodeExecutor::new(store, None);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        let cb: OnReady = Arc::new(move |ev| seen2.lock().unwrap().push(ev));

        executor
            .execute("m", "v1", &[op("n1", 0, 0, 1, 32)], cb)
            .await
            .unwrap();

        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn engine_path_completes_exactly_once_per_op() {
        let dir = tempfile::tempdir().unwrap();
        let store = seeded_store(&dir, 16).await;
        let engine: Arc<dyn CopyEngine> = Arc::new(SimCopyEngine::new());
        let executor = NodeExecutor::new(store, Some(engine));
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        let cb: OnReady = Arc::new(move |_ev| {
            count2.fetch_add(1, Ordering::SeqCst);
        });

        executor
            .execute("m", "v1", &[op("n1", 0, 0, 1, 32)], cb)
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn a_storage_error_on_one_op_does_not_abort_the_rest_of_the_window() {
        let dir = tempfile::tempdir().unwrap();
        let store = seeded_store(&dir, 16).await;
        let executor = NodeExecutor::new(store, None);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        let cb: OnReady = Arc::new(move |ev| seen2.lock().unwrap().push(ev));

        // Page 99 was never written, so this op's read fails; the second op
        // (pages 0..=1, seeded) must still complete.
        let ops = vec![op("n1", 0, 99, 99, 16), op("n1", 0, 0, 1, 32)];
        let result = executor.execute("m", "v1", &ops, cb).await;

        assert!(result.is_ok());
        assert_eq!(seen.lock().unwrap().len(), 1);
    }
}
