//! Per-window counters accumulated from the planner's drop reasons and the
//! executor's completion events, for the CLI summary and the HTTP service's
//! `/report` endpoint.

use bcache_executor::ReadyEvent;
use bcache_planner::PipelineStats;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct WindowCounters {
    pub dropped_degenerate: u64,
    pub dropped_by_tenant_cap: u64,
    pub dropped_by_tier_cap: u64,
    pub dropped_by_op_cap: u64,
    pub dropped_by_min_io: u64,
    pub ops_completed: u64,
    pub bytes_completed: u64,
    pub on_time_count: u64,
    pub late_count: u64,
}

impl WindowCounters {
    pub fn add_pipeline_stats(&mut self, stats: &PipelineStats) {
        self.dropped_degenerate += stats.dropped_degenerate;
        self.dropped_by_tenant_cap += stats.dropped_by_tenant_cap;
        self.dropped_by_tier_cap += stats.dropped_by_tier_cap;
        self.dropped_by_op_cap += stats.dropped_by_op_cap;
        self.dropped_by_min_io += stats.dropped_by_min_io;
    }

    pub fn record_ready(&mut self, event: &ReadyEvent) {
        self.ops_completed += 1;
        self.bytes_completed += event.bytes;
        if event.on_time {
            self.on_time_count += 1;
        } else {
            self.late_count += 1;
        }
        tracing::debug!(
            node = %event.node,
            layer = event.layer,
            bytes = event.bytes,
            finish_rel_ms = event.finish_rel_ms,
            on_time = event.on_time,
            "op completed"
        );
    }

    pub fn total_dropped(&self) -> u64 {
        self.dropped_degenerate
            + self.dropped_by_tenant_cap
            + self.dropped_by_tier_cap
            + self.dropped_by_op_cap
            + self.dropped_by_min_io
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bcache_model::Tier;

    #[test]
    fn record_ready_splits_on_time_and_late() {
        let mut counters = WindowCounters::default();
        counters.record_ready(&ReadyEvent {
            node: "n1".into(),
            layer: 0,
            page_start: 0,
            page_end: 1,
            bytes: 4096,
            finish_rel_ms: 1.0,
            on_time: true,
        });
        counters.record_ready(&ReadyEvent {
            node: "n1".into(),
            layer: 0,
            page_start: 2,
            page_end: 2,
            bytes: 4096,
            finish_rel_ms: 50.0,
            on_time: false,
        });
        let _ = Tier::Host;
        assert_eq!(counters.ops_completed, 2);
        assert_eq!(counters.on_time_count, 1);
        assert_eq!(counters.late_count, 1);
        assert_eq!(counters.bytes_completed, 8192);
    }
}
