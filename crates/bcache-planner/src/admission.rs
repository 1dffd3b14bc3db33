//! Admission and eviction: advisory side-decisions computed from the same
//! heat table the planner reads, but never applied by this crate — callers
//! (the node executor or an external tier manager) are responsible for
//! acting on the returned entries.

use std::collections::HashSet;

use bcache_model::{AdmissionEntry, EvictionVictim, HeatRow, Tier, DEFAULT_PAGE_BYTES};

/// Promotes distinct `(layer, page_id)` pairs whose decayed hit count has
/// crossed `reuse_threshold` into the storage tier, so they become eligible
/// for a future prefetch.
pub fn admission_core(heat_rows: &[HeatRow], reuse_threshold: f64) -> Vec<AdmissionEntry> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for row in heat_rows {
        if row.decay_hits < reuse_threshold {
            continue;
        }
        let key = (row.layer, row.page_start);
        if seen.insert(key) {
            out.push(AdmissionEntry {
                layer: row.layer,
                page_id: row.page_start,
                tier_dst: Tier::Storage,
            });
        }
    }
    out
}

/// Selects the coldest pages in `(node, tier)` to reclaim enough bytes to
/// close the deficit between `free_bytes` and `target_free_bytes`. Pages
/// without an explicit `size_bytes` are assumed to occupy one default page.
pub fn eviction_core(
    node: &str,
    tier: Tier,
    heat_rows: &[HeatRow],
    free_bytes: u64,
    target_free_bytes: u64,
) -> Vec<EvictionVictim> {
    let deficit = target_free_bytes.saturating_sub(free_bytes);
    if deficit == 0 {
        return Vec::new();
    }

    let mut candidates: Vec<&HeatRow> = heat_rows.iter().collect();
    candidates.sort_by(|a, b| a.decay_hits.partial_cmp(&b.decay_hits).unwrap());

    let mut reclaimed = 0u64;
    let mut victims = Vec::new();
    for row in candidates {
        if reclaimed >= deficit {
            break;
        }
        let size = row.size_bytes.unwrap_or(DEFAULT_PAGE_BYTES);
        victims.push(EvictionVictim {
            node: node.to_string(),
            tier,
            layer: row.layer,
            page_id: row.page_start,
            size_bytes: size,
        });
        reclaimed += size;
    }
    victims
}

#[cfg(test)]
mod tests {
    use super::*;

    fn heat(layer: u32, page_start: u64, decay_hits: f64) -> HeatRow {
        HeatRow {
            layer,
            page_start,
            decay_hits,
            tenant_weight: 1.0,
            size_bytes: None,
        }
    }

    #[test]
    fn admission_only_promotes_rows_at_or_above_threshold() {
        let rows = vec![heat(0, 1, 12.0), heat(0, 2, 4.0), heat(0, 1, 12.0)];
        let entries = admission_core(&rows, 10.0);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].page_id, 1);
    }

    #[test]
    fn eviction_selects_coldest_pages_until_deficit_closed() {
        let rows = vec![heat(0, 1, 50.0), heat(0, 2, 1.0), heat(0, 3, 5.0)];
        let victims = eviction_core("n1", Tier::Host, &rows, 0, DEFAULT_PAGE_BYTES * 2);
        assert_eq!(victims.len(), 2);
        assert_eq!(victims[0].page_id, 2);
        assert_eq!(victims[1].page_id, 3);
    }

    #[test]
    fn eviction_is_a_no_op_when_already_above_target() {
        let rows = vec![heat(0, 1, 1.0)];
        let victims = eviction_core("n1", Tier::Host, &rows, DEFAULT_PAGE_BYTES, DEFAULT_PAGE_BYTES);
        assert!(victims.is_empty());
    }
}
