//! YAML configuration loading, layered staged→runtime promotion, and the
//! typed [`RuntimeConfig`] the planner/executor/CLI read their knobs from.

use std::collections::HashMap;
use std::fs;

use bcache_model::Knobs;
use camino::Utf8Path;
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
}

pub type Result<T> = std::result::Result<T, ConfigError>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Thresholds {
    pub reuse_threshold: f64,
    pub min_io_bytes: u64,
    /// Stage-1 score floor: keep a row if `pop > pmin`.
    pub pmin: f64,
    /// Stage-1 score floor: keep a row if `urgency > umin`.
    pub umin: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        let knobs = Knobs::default();
        Thresholds {
            reuse_threshold: knobs.reuse_threshold,
            min_io_bytes: knobs.min_io_bytes,
            pmin: knobs.pmin,
            umin: knobs.umin,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Popularity {
    pub decay_lambda: f64,
    /// Stage-1 `pop` weight on `decay_hits`.
    pub alpha: f64,
    /// Stage-1 `pop` weight on `tenant_weight`.
    pub beta: f64,
}

impl Default for Popularity {
    fn default() -> Self {
        let knobs = Knobs::default();
        Popularity {
            decay_lambda: 0.01,
            alpha: knobs.alpha,
            beta: knobs.beta,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AbFlags {
    pub use_minhash_clustering: bool,
    pub enable_admission: bool,
    pub enable_eviction: bool,
    /// Stage 4: whether per-`(node, tier_src, tier_dst)` bandwidth/free-bytes
    /// caps are enforced (the op-count cap always applies regardless).
    pub enforce_tier_caps: bool,
    /// Stage 3: whether `pcluster` participates in the coalescing group key.
    /// Disabling this collapses prefix fan-out back to grouping by
    /// `(node, tier_src, tier_dst, layer)` only.
    pub enable_prefix_fanout: bool,
    /// Stage 2: whether the tenant credit gate runs at all.
    pub enable_tenant_credits: bool,
    /// Stage 5: whether overlap depth is computed from the `est_copy_ms`
    /// formula, or left at a neutral `1` for every row.
    pub enable_overlap: bool,
    /// Forces the single canonical planning path. Kept for compatibility
    /// with external tooling that still sets the reference-mode knob; the
    /// workspace has only one pipeline implementation, so this flag is
    /// accepted but does not change behavior.
    pub pure_reference_mode: bool,
}

impl Default for AbFlags {
    fn default() -> Self {
        AbFlags {
            use_minhash_clustering: true,
            enable_admission: true,
            enable_eviction: true,
            enforce_tier_caps: true,
            enable_prefix_fanout: true,
            enable_tenant_credits: true,
            enable_overlap: true,
            pure_reference_mode: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct RuntimeConfig {
    pub knobs: Knobs,
    pub thresholds: Thresholds,
    pub popularity: Popularity,
    pub tenant_credits_bytes: HashMap<String, u64>,
    pub ab_flags: AbFlags,
}

impl RuntimeConfig {
    /// Folds `thresholds`/`popularity`/`ab_flags` into a single flat
    /// [`Knobs`] the way the HTTP wire's `knobs` object expects, so callers
    /// only need to thread one struct into `plan_window`.
    pub fn effective_knobs(&self) -> Knobs {
        let mut knobs = self.knobs.clone();
        knobs.reuse_threshold = self.thresholds.reuse_threshold;
        knobs.min_io_bytes = self.thresholds.min_io_bytes;
        knobs.pmin = self.thresholds.pmin;
        knobs.umin = self.thresholds.umin;
        knobs.alpha = self.popularity.alpha;
        knobs.beta = self.popularity.beta;
        knobs.enable_admission = self.ab_flags.enable_admission;
        knobs.enable_eviction = self.ab_flags.enable_eviction;
        knobs.enforce_tier_caps = self.ab_flags.enforce_tier_caps;
        knobs
    }

    /// Projects the pipeline-level toggles out of `ab_flags`.
    pub fn pipeline_flags(&self) -> bcache_model::PipelineFlags {
        bcache_model::PipelineFlags {
            enable_prefix_fanout: self.ab_flags.enable_prefix_fanout,
            enable_tenant_credits: self.ab_flags.enable_tenant_credits,
            enable_overlap: self.ab_flags.enable_overlap,
        }
    }
}

/// Environment variable that, when set to a truthy value, forces
/// `ab_flags.pure_reference_mode` regardless of what the config files say —
/// preserved for compatibility with existing automation.
pub const PURE_REFERENCE_ENV_VAR: &str = "BODOCACHE_PURE_PY";

fn truthy(value: &str) -> bool {
    matches!(value.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

fn read_yaml_value(path: &Utf8Path) -> Result<serde_yaml::Value> {
    let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_string(),
        source,
    })?;
    serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
        path: path.to_string(),
        source,
    })
}

/// Deep-merges `overlay` into `base`: mapping keys present in both are
/// merged recursively, any other value in `overlay` replaces `base`'s value
/// outright. Mirrors the staged-config-over-defaults-over-runtime layering.
fn merge_value(base: serde_yaml::Value, overlay: serde_yaml::Value) -> serde_yaml::Value {
    use serde_yaml::Value;
    match (base, overlay) {
        (Value::Mapping(mut base_map), Value::Mapping(overlay_map)) => {
            for (key, overlay_val) in overlay_map {
                let existing = base_map.get(&key).cloned();
                let merged = match existing {
                    Some(base_val) => merge_value(base_val, overlay_val),
                    None => overlay_val,
                };
                base_map.insert(key, merged);
            }
            Value::Mapping(base_map)
        }
        (_, overlay) => overlay,
    }
}

/// Loads the layered configuration: compiled-in defaults, then an optional
/// staged file, then an optional runtime file, each overlaid on the last.
pub fn load_config(staged_path: Option<&Utf8Path>, runtime_path: Option<&Utf8Path>) -> Result<RuntimeConfig> {
    let default_value = serde_yaml::to_value(RuntimeConfig::default()).expect("default config always serializes");
    let mut merged = default_value;

    if let Some(path) = staged_path {
        if path.exists() {
            merged = merge_value(merged, read_yaml_value(path)?);
        }
    }
    if let Some(path) = runtime_path {
        if path.exists() {
            merged = merge_value(merged, read_yaml_value(path)?);
        }
    }

    let mut config: RuntimeConfig = serde_yaml::from_value(merged).map_err(|source| ConfigError::Parse {
        path: runtime_path.or(staged_path).map(|p| p.to_string()).unwrap_or_default(),
        source,
    })?;

    if let Ok(raw) = std::env::var(PURE_REFERENCE_ENV_VAR) {
        if truthy(&raw) {
            config.ab_flags.pure_reference_mode = true;
        }
    }

    Ok(config)
}

/// Promotes a staged config file to the runtime path by copying it,
/// preserving file metadata the way `shutil.copy2` does.
pub fn promote_config(staged_path: &Utf8Path, runtime_path: &Utf8Path) -> Result<()> {
    fs::copy(staged_path, runtime_path).map_err(|source| ConfigError::Read {
        path: staged_path.to_string(),
        source,
    })?;
    tracing::info!(%staged_path, %runtime_path, "promoted staged config to runtime");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino::Utf8PathBuf;

    #[test]
    fn defaults_match_documented_values() {
        let config = RuntimeConfig::default();
        assert_eq!(config.thresholds.reuse_threshold, 10.0);
        assert_eq!(config.popularity.decay_lambda, 0.01);
        assert!(config.ab_flags.use_minhash_clustering);
    }

    #[test]
    fn staged_file_overrides_defaults_and_runtime_overrides_staged() {
        let dir = tempfile::tempdir().unwrap();
        let staged = Utf8PathBuf::from_path_buf(dir.path().join("staged.yaml")).unwrap();
        let runtime = Utf8PathBuf::from_path_buf(dir.path().join("runtime.yaml")).unwrap();
        fs::write(&staged, "thresholds:\n  reuse_threshold: 5.0\n").unwrap();
        fs::write(&runtime, "thresholds:\n  reuse_threshold: 7.0\n").unwrap();

        let config = load_config(Some(&staged), Some(&runtime)).unwrap();
        assert_eq!(config.thresholds.reuse_threshold, 7.0);
        // Untouched nested fields keep their default.
        assert_eq!(config.popularity.decay_lambda, 0.01);
    }

    #[test]
    fn promote_copies_staged_onto_runtime() {
        let dir = tempfile::tempdir().unwrap();
        let staged = Utf8PathBuf::from_path_buf(dir.path().join("staged.yaml")).unwrap();
        let runtime = Utf8PathBuf::from_path_buf(dir.path().join("runtime.yaml")).unwrap();
        fs::write(&staged, "thresholds:\n  reuse_threshold: 5.0\n").unwrap();

        promote_config(&staged, &runtime).unwrap();
        let config = load_config(None, Some(&runtime)).unwrap();
        assert_eq!(config.thresholds.reuse_threshold, 5.0);
    }

    #[test]
    fn truthy_env_values_are_recognized() {
        assert!(truthy("true"));
        assert!(truthy("1"));
        assert!(truthy("YES"));
        assert!(!truthy("0"));
        assert!(!truthy(""));
    }
}
