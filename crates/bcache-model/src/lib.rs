//! Shared data model for the KV-cache prefetch planner and executor.
//!
//! These types are the row shapes that flow through every stage described in
//! the planner pipeline: demands come in as [`KVRequest`] rows, heat comes in
//! as [`HeatRow`] rows, capacity constraints are [`TierCap`]/[`TenantCap`]/
//! [`LayerLat`], and the pipeline's output is a list of [`PlanOp`].

use std::fmt;

use serde::{Deserialize, Serialize};

/// Storage tier a page currently lives in, or is being moved to.
///
/// Encoded on the wire as the integers `0`/`1`/`2` (see `encode`/`TryFrom<u8>`),
/// matching the external interface's numeric tier ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Tier {
    Storage = 0,
    Host = 1,
    Device = 2,
}

impl Tier {
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Tier::Storage => "storage",
            Tier::Host => "host",
            Tier::Device => "device",
        };
        f.write_str(name)
    }
}

impl TryFrom<u8> for Tier {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Tier::Storage),
            1 => Ok(Tier::Host),
            2 => Ok(Tier::Device),
            other => Err(Error::InvalidInput(format!("unknown tier id {other}"))),
        }
    }
}

impl Serialize for Tier {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_u8(self.as_u8())
    }
}

impl<'de> Deserialize<'de> for Tier {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = u8::deserialize(deserializer)?;
        Tier::try_from(raw).map_err(serde::de::Error::custom)
    }
}

/// Identifies a single KV page: the model/layer/page coordinates that make a
/// page unique across the whole deployment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PageKey {
    pub model_id: String,
    pub model_version: String,
    pub dtype: String,
    pub n_kv_heads: u32,
    pub d_head: u32,
    pub layer: u32,
    pub page_id: u64,
}

impl PageKey {
    /// The canonical string encoding used in segment file naming and logs:
    /// `"{model_id}:{model_version}:{dtype}:{n_kv_heads}:{d_head}:{layer}:{page_id}"`.
    pub fn encode(&self) -> String {
        format!(
            "{}:{}:{}:{}:{}:{}:{}",
            self.model_id,
            self.model_version,
            self.dtype,
            self.n_kv_heads,
            self.d_head,
            self.layer,
            self.page_id
        )
    }

    /// Bytes occupied by one page of this key's dtype, given a fixed page
    /// size in tokens. Callers that already know the page byte size (the
    /// common case, since storage allocates fixed-size pages) should prefer
    /// that value directly; this helper exists for synthetic/test data.
    pub fn dtype_bytes(&self) -> u32 {
        match self.dtype.as_str() {
            "fp16" | "bf16" => 2,
            "fp32" => 4,
            _ => 2,
        }
    }
}

/// A single demand for a contiguous range of pages, inclusive on both ends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KVRequest {
    pub request_id: u64,
    pub node: String,
    pub tenant: String,
    pub layer: u32,
    pub page_start: u64,
    pub page_end: u64,
    pub tier_src: Tier,
    pub tier_dst: Tier,
    pub deadline_ms: f64,
    /// Estimated time, in ms, to fill this request once admitted — the
    /// denominator of the stage-1 urgency score (`spec.md` §4.C).
    #[serde(default = "default_est_fill_ms")]
    pub est_fill_ms: f64,
    /// Prefix-cluster id assigned by the cluster assigner (component B)
    /// before the planner groups requests for coalescing. `-1` means "not
    /// yet assigned"; `plan_window` always assigns one before stage 3 runs.
    #[serde(default = "default_pcluster")]
    pub pcluster: i64,
    /// Free-form hint describing what generated the request (e.g. the
    /// attention kernel that will consume the range). Left uninterpreted by
    /// the planner; see the Open Questions resolution in DESIGN.md.
    #[serde(default)]
    pub route_hint: Option<String>,
}

fn default_est_fill_ms() -> f64 {
    1.0
}

fn default_pcluster() -> i64 {
    -1
}

impl KVRequest {
    pub fn page_count(&self) -> u64 {
        self.page_end.saturating_sub(self.page_start) + 1
    }
}

/// A popularity observation for one page, read from the external heat table.
///
/// Keyed by `page_start` only (not the full range a request touched), per the
/// heat-table scope decision recorded in DESIGN.md.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeatRow {
    pub layer: u32,
    pub page_start: u64,
    pub decay_hits: f64,
    #[serde(default = "default_tenant_weight")]
    pub tenant_weight: f64,
    #[serde(default)]
    pub size_bytes: Option<u64>,
}

fn default_tenant_weight() -> f64 {
    1.0
}

/// Default page size used when a [`HeatRow`] does not carry `size_bytes`.
pub const DEFAULT_PAGE_BYTES: u64 = 256 * 1024;

/// Per-(node, tier) capacity for one planning window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierCap {
    pub node: String,
    pub tier: Tier,
    pub free_bytes: u64,
    pub bw_bytes_per_window: u64,
    pub max_ops: u32,
    /// Desired free-bytes floor for this (node, tier); eviction closes the
    /// deficit against `free_bytes` when set. `None` means no eviction
    /// target is configured for this row.
    #[serde(default)]
    pub target_free_bytes: Option<u64>,
}

/// Per-(node, tier_dst, tenant) byte credit for one planning window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TenantCap {
    pub node: String,
    pub tier_dst: Tier,
    pub tenant: String,
    pub credit_bytes: u64,
}

/// Per-layer estimated completion latency, used to annotate priority and
/// overlap depth on the resulting plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerLat {
    pub layer: u32,
    pub lat_ms: f64,
}

/// One coalesced tier-to-tier copy operation emitted by the planner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanOp {
    pub node: String,
    pub layer: u32,
    pub tier_src: Tier,
    pub tier_dst: Tier,
    /// Prefix-cluster id of the run this op was coalesced from — part of
    /// the coalescing group key per `spec.md` §4.C stage 3.
    pub pcluster: i64,
    pub page_start: u64,
    pub page_end: u64,
    pub bytes: u64,
    pub deadline_ms: f64,
    pub priority: u32,
    pub overlap_depth: u32,
}

impl PlanOp {
    pub fn page_count(&self) -> u64 {
        self.page_end.saturating_sub(self.page_start) + 1
    }
}

/// An admission decision: promote a cold page into storage tier so it is
/// eligible for future prefetch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdmissionEntry {
    pub layer: u32,
    pub page_id: u64,
    pub tier_dst: Tier,
}

/// An eviction decision: the coldest pages to reclaim for one (node, tier).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvictionVictim {
    pub node: String,
    pub tier: Tier,
    pub layer: u32,
    pub page_id: u64,
    pub size_bytes: u64,
}

/// Tunable knobs shared by the planner, admission/eviction, and the HTTP
/// service's defaulting logic. Field defaults match the external interface's
/// documented defaults exactly (`spec.md` §6).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Knobs {
    pub reuse_threshold: f64,
    pub min_io_bytes: u64,
    pub num_hashes: u32,
    pub bands: u32,
    pub k_shingle: u32,
    pub page_bytes: u64,
    /// Stage-1 score floor: keep a row if `pop > pmin`.
    pub pmin: f64,
    /// Stage-1 score floor: keep a row if `urgency > umin`.
    pub umin: f64,
    /// Stage-1 `pop` weight on `decay_hits`.
    pub alpha: f64,
    /// Stage-1 `pop` weight on `tenant_weight`.
    pub beta: f64,
    /// Per-`(node, tier_dst)` cap on admitted plan rows (stage 4).
    pub max_ops_per_tier: u32,
    /// Decode window length in ms, used by stage 5's `est_copy_ms` formula.
    pub window_ms: f64,
    pub enable_admission: bool,
    pub enable_eviction: bool,
    /// Stage 4: whether per-`(node, tier_src, tier_dst)` bandwidth/free-bytes
    /// caps are enforced at all (the op-count cap always applies).
    pub enforce_tier_caps: bool,
}

impl Default for Knobs {
    fn default() -> Self {
        Knobs {
            reuse_threshold: 10.0,
            min_io_bytes: 524_288,
            num_hashes: 32,
            bands: 8,
            k_shingle: 5,
            page_bytes: DEFAULT_PAGE_BYTES,
            pmin: 1.0,
            umin: 0.0,
            alpha: 1.0,
            beta: 0.0,
            max_ops_per_tier: 64,
            window_ms: 20.0,
            enable_admission: true,
            enable_eviction: true,
            enforce_tier_caps: true,
        }
    }
}

/// Pipeline-level toggles that are not part of the flat `knobs` wire object
/// but gate whole stages of `plan_window` (`spec.md` §6 `ab_flags`).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineFlags {
    pub enable_prefix_fanout: bool,
    pub enable_tenant_credits: bool,
    pub enable_overlap: bool,
}

impl Default for PipelineFlags {
    fn default() -> Self {
        PipelineFlags {
            enable_prefix_fanout: true,
            enable_tenant_credits: true,
            enable_overlap: true,
        }
    }
}

/// Errors surfaced across crate boundaries, per the error-handling design:
/// malformed input, short/undersized segment reads, and copy-engine failures.
/// Capacity drops are *not* modeled as errors — they are advisory and counted
/// by `bcache-telemetry` instead.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("storage segment too short: {0}")]
    StorageShort(String),

    #[error("copy engine failure: {0}")]
    Engine(String),
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_key_encodes_in_colon_separated_order() {
        let key = PageKey {
            model_id: "llama3-8b".into(),
            model_version: "v1".into(),
            dtype: "fp16".into(),
            n_kv_heads: 8,
            d_head: 128,
            layer: 3,
            page_id: 42,
        };
        assert_eq!(key.encode(), "llama3-8b:v1:fp16:8:128:3:42");
    }

    #[test]
    fn tier_round_trips_through_json_as_an_integer() {
        let json = serde_json::to_string(&Tier::Host).unwrap();
        assert_eq!(json, "1");
        let back: Tier = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Tier::Host);
    }

    #[test]
    fn tier_rejects_out_of_range_ids() {
        assert!(Tier::try_from(7).is_err());
    }

    #[test]
    fn knobs_defaults_match_documented_values() {
        let knobs = Knobs::default();
        assert_eq!(knobs.reuse_threshold, 10.0);
        assert_eq!(knobs.num_hashes, 32);
        assert_eq!(knobs.bands, 8);
        assert_eq!(knobs.num_hashes % knobs.bands, 0);
        assert_eq!(knobs.min_io_bytes, 524_288);
        assert_eq!(knobs.pmin, 1.0);
        assert_eq!(knobs.umin, 0.0);
        assert_eq!(knobs.alpha, 1.0);
        assert_eq!(knobs.beta, 0.0);
        assert_eq!(knobs.max_ops_per_tier, 64);
        assert_eq!(knobs.window_ms, 20.0);
        assert!(knobs.enable_admission);
        assert!(knobs.enable_eviction);
        assert!(knobs.enforce_tier_caps);
    }

    #[test]
    fn pipeline_flags_default_to_the_full_pipeline_enabled() {
        let flags = PipelineFlags::default();
        assert!(flags.enable_prefix_fanout);
        assert!(flags.enable_tenant_credits);
        assert!(flags.enable_overlap);
    }
}
