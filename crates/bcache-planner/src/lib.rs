//! The planning pipeline (§4.C) and the admission/eviction side-decisions
//! that share its input (§4.D).

pub mod admission;
pub mod pipeline;

pub use admission::{admission_core, eviction_core};
pub use pipeline::{
    annotate, apply_caps, apply_tenant_caps, assign_prefix_clusters, coalesce_intervals, plan_window,
    score_and_filter, shard_for_rank, PipelineStats,
};
