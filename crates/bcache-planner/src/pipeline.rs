//! The five-stage planning pipeline: score & filter, tenant credit gate,
//! coalesce, cap, annotate. Every stage is a pure function over row slices —
//! no stage mutates shared state, and the whole pipeline can be re-run on
//! the same input for the same output (see `plan_window` purity test).

use std::collections::HashMap;

use bcache_model::{HeatRow, KVRequest, Knobs, LayerLat, PipelineFlags, PlanOp, Result, TenantCap, TierCap, Tier};

/// Counts of candidates dropped by each stage, for telemetry. None of these
/// represent an `Error` — capacity and credit exhaustion are expected,
/// advisory outcomes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PipelineStats {
    pub dropped_degenerate: u64,
    pub dropped_by_tenant_cap: u64,
    pub dropped_by_tier_cap: u64,
    pub dropped_by_op_cap: u64,
    pub dropped_by_min_io: u64,
}

/// Stage 0: context-parallel sharding (`spec.md` §8 invariant 6 / scenario
/// S5). Splits each request into its individual pages and keeps only pages
/// satisfying `page mod world_size == rank`, so coalescing downstream only
/// ever sees this rank's share of the window. A no-op when `world_size <= 1`.
pub fn shard_for_rank(requests: &[KVRequest], world_size: u32, rank: u32) -> Vec<KVRequest> {
    if world_size <= 1 {
        return requests.to_vec();
    }
    let world_size = world_size as u64;
    let rank = rank as u64;
    let mut out = Vec::new();
    for req in requests {
        for page in req.page_start..=req.page_end {
            if page % world_size == rank {
                let mut shard = req.clone();
                shard.page_start = page;
                shard.page_end = page;
                out.push(shard);
            }
        }
    }
    out
}

/// Stage 0.5 (component B → C handoff): assigns a `pcluster` id to every
/// request that doesn't already carry one, using the MinHash+banding
/// assigner over each request's `route_hint` (falling back to
/// `tenant:layer:page_start` when absent). This is what actually feeds
/// component B's output into the coalescing group key in stage 3, rather
/// than leaving it a cosmetic annotation.
pub fn assign_prefix_clusters(requests: &mut [KVRequest], knobs: &Knobs) -> Result<()> {
    let to_assign: Vec<usize> = requests
        .iter()
        .enumerate()
        .filter(|(_, r)| r.pcluster < 0)
        .map(|(i, _)| i)
        .collect();
    if to_assign.is_empty() {
        return Ok(());
    }
    let keys: Vec<String> = to_assign
        .iter()
        .map(|&i| {
            requests[i]
                .route_hint
                .clone()
                .unwrap_or_else(|| format!("{}:{}:{}", requests[i].tenant, requests[i].layer, requests[i].page_start))
        })
        .collect();
    let ids = bcache_cluster::assign_pclusters_minhash(&keys, knobs.num_hashes, knobs.bands, knobs.k_shingle)?;
    for (&idx, id) in to_assign.iter().zip(ids) {
        requests[idx].pcluster = id;
    }
    Ok(())
}

/// Stage 1: joins heat onto requests by `(layer, page_start)` (missing rows
/// treated as `decay_hits=0, tenant_weight=1`), scores `pop`/`urgency`, and
/// keeps rows where `pop > pmin OR urgency > umin`. Also drops degenerate
/// requests (no-op moves, inverted ranges).
pub fn score_and_filter(
    requests: &[KVRequest],
    heat: &[HeatRow],
    knobs: &Knobs,
    now_ms: f64,
    stats: &mut PipelineStats,
) -> Vec<KVRequest> {
    let heat_by_key: HashMap<(u32, u64), &HeatRow> =
        heat.iter().map(|h| ((h.layer, h.page_start), h)).collect();

    let mut kept: Vec<KVRequest> = requests
        .iter()
        .filter(|r| {
            let degenerate = r.tier_src == r.tier_dst || r.page_end < r.page_start;
            if degenerate {
                stats.dropped_degenerate += 1;
                return false;
            }
            let (decay_hits, tenant_weight) = heat_by_key
                .get(&(r.layer, r.page_start))
                .map(|h| (h.decay_hits, h.tenant_weight))
                .unwrap_or((0.0, 1.0));
            let pop = knobs.alpha * decay_hits + knobs.beta * tenant_weight;
            let urgency = (r.deadline_ms - now_ms) / r.est_fill_ms.max(1.0);
            pop > knobs.pmin || urgency > knobs.umin
        })
        .cloned()
        .collect();

    kept.sort_by(|a, b| {
        (&a.node, a.tier_src, a.tier_dst, a.pcluster, a.layer, a.page_start).cmp(&(
            &b.node,
            b.tier_src,
            b.tier_dst,
            b.pcluster,
            b.layer,
            b.page_start,
        ))
    });
    kept
}

/// Stage 2: gates requests against each tenant's per-window byte credit for
/// its `(node, tier_dst)` destination, processing in deadline-ascending
/// order so the most urgent requests consume credit first. A no-op pass
/// through when `enable_tenant_credits` is off.
pub fn apply_tenant_caps(
    requests: &[KVRequest],
    tenant_caps: &[TenantCap],
    page_bytes: u64,
    enabled: bool,
    stats: &mut PipelineStats,
) -> Vec<KVRequest> {
    if !enabled {
        return requests.to_vec();
    }

    let mut credit: HashMap<(String, Tier, String), u64> = tenant_caps
        .iter()
        .map(|c| {
            (
                (c.node.clone(), c.tier_dst, c.tenant.clone()),
                c.credit_bytes,
            )
        })
        .collect();

    let mut ordered = requests.to_vec();
    ordered.sort_by(|a, b| a.deadline_ms.partial_cmp(&b.deadline_ms).unwrap());

    let mut kept = Vec::with_capacity(ordered.len());
    for req in ordered {
        let key = (req.node.clone(), req.tier_dst, req.tenant.clone());
        let needed = req.page_count() * page_bytes;
        match credit.get_mut(&key) {
            Some(remaining) if *remaining >= needed => {
                *remaining -= needed;
                kept.push(req);
            }
            Some(_) => stats.dropped_by_tenant_cap += 1,
            // No explicit cap row means the tenant is unmetered for this
            // destination, matching the default-allow behavior when the
            // caller hasn't configured a credit for this key.
            None => kept.push(req),
        }
    }
    kept
}

/// Stage 3: coalesces adjacent/overlapping page ranges within each
/// `(node, tier_src, tier_dst, pcluster, layer)` group into a minimal set of
/// larger ranges, the same run-detection shape used for vectored blob reads.
/// Drops runs below `min_io_bytes`. When `prefix_fanout` is disabled,
/// `pcluster` is left out of the group key, collapsing fan-out.
pub fn coalesce_intervals(
    requests: &[KVRequest],
    page_bytes: u64,
    min_io_bytes: u64,
    prefix_fanout: bool,
    stats: &mut PipelineStats,
) -> Vec<PlanOp> {
    let fanout_key = |r: &KVRequest| if prefix_fanout { r.pcluster } else { 0 };

    let mut groups: HashMap<(String, Tier, Tier, i64, u32), Vec<&KVRequest>> = HashMap::new();
    for req in requests {
        groups
            .entry((req.node.clone(), req.tier_src, req.tier_dst, fanout_key(req), req.layer))
            .or_default()
            .push(req);
    }

    let mut ops = Vec::new();
    for ((node, tier_src, tier_dst, pcluster, layer), mut rows) in groups {
        rows.sort_by_key(|r| (r.page_start, r.page_end));

        let mut run_start = rows[0].page_start;
        let mut run_end = rows[0].page_end;
        let mut run_deadline = rows[0].deadline_ms;

        for row in rows.into_iter().skip(1) {
            if row.page_start > run_end + 1 {
                push_coalesced_op(
                    &mut ops, &node, layer, tier_src, tier_dst, pcluster, run_start, run_end, run_deadline,
                    page_bytes, min_io_bytes, stats,
                );
                run_start = row.page_start;
                run_end = row.page_end;
                run_deadline = row.deadline_ms;
            } else {
                run_end = run_end.max(row.page_end);
                run_deadline = run_deadline.min(row.deadline_ms);
            }
        }
        push_coalesced_op(
            &mut ops, &node, layer, tier_src, tier_dst, pcluster, run_start, run_end, run_deadline, page_bytes,
            min_io_bytes, stats,
        );
    }

    ops
}

#[allow(clippy::too_many_arguments)]
fn push_coalesced_op(
    ops: &mut Vec<PlanOp>,
    node: &str,
    layer: u32,
    tier_src: Tier,
    tier_dst: Tier,
    pcluster: i64,
    page_start: u64,
    page_end: u64,
    deadline_ms: f64,
    page_bytes: u64,
    min_io_bytes: u64,
    stats: &mut PipelineStats,
) {
    let bytes = (page_end - page_start + 1) * page_bytes;
    if bytes < min_io_bytes {
        stats.dropped_by_min_io += 1;
        return;
    }
    ops.push(PlanOp {
        node: node.to_string(),
        layer,
        tier_src,
        tier_dst,
        pcluster,
        page_start,
        page_end,
        bytes,
        deadline_ms,
        priority: 0,
        overlap_depth: 0,
    });
}

/// Stage 4: caps coalesced ops. Bandwidth/free-bytes caps (when
/// `enforce_tier_caps`) are enforced per `(node, tier_src, tier_dst)` in
/// deadline-ascending order; the per-`(node, tier_dst)` op-count cap always
/// applies, regardless of `enforce_tier_caps`.
pub fn apply_caps(
    ops: &[PlanOp],
    tier_caps: &[TierCap],
    max_ops_per_tier: u32,
    enforce_tier_caps: bool,
    stats: &mut PipelineStats,
) -> Vec<PlanOp> {
    let caps: HashMap<(String, Tier), &TierCap> = tier_caps
        .iter()
        .map(|c| ((c.node.clone(), c.tier), c))
        .collect();

    // Bandwidth/free-bytes cap, grouped by (node, tier_src, tier_dst).
    let mut bw_groups: HashMap<(String, Tier, Tier), Vec<&PlanOp>> = HashMap::new();
    for op in ops {
        bw_groups.entry((op.node.clone(), op.tier_src, op.tier_dst)).or_default().push(op);
    }

    let mut after_bw_cap = Vec::new();
    for ((node, _tier_src, tier_dst), mut rows) in bw_groups {
        rows.sort_by(|a, b| a.deadline_ms.partial_cmp(&b.deadline_ms).unwrap());

        if !enforce_tier_caps {
            after_bw_cap.extend(rows.into_iter().cloned());
            continue;
        }

        let Some(cap) = caps.get(&(node.clone(), tier_dst)) else {
            after_bw_cap.extend(rows.into_iter().cloned());
            continue;
        };

        let budget = cap.free_bytes.min(cap.bw_bytes_per_window);
        let mut cum_bytes = 0u64;
        for op in rows {
            cum_bytes += op.bytes;
            if cum_bytes > budget {
                stats.dropped_by_tier_cap += 1;
                continue;
            }
            after_bw_cap.push(op.clone());
        }
    }

    // Op-count cap, grouped by (node, tier_dst) only, rank order by deadline.
    let mut op_groups: HashMap<(String, Tier), Vec<PlanOp>> = HashMap::new();
    for op in after_bw_cap {
        op_groups.entry((op.node.clone(), op.tier_dst)).or_default().push(op);
    }

    let mut kept = Vec::new();
    for (_key, mut rows) in op_groups {
        rows.sort_by(|a, b| a.deadline_ms.partial_cmp(&b.deadline_ms).unwrap());
        for (rank, op) in rows.into_iter().enumerate() {
            if (rank as u32) >= max_ops_per_tier {
                stats.dropped_by_op_cap += 1;
                continue;
            }
            kept.push(op);
        }
    }

    kept
}

/// Stage 5: annotates each op with a deadline-rank priority (0 = most
/// urgent within its node) and, per `spec.md` §4.C stage 5, an overlap depth
/// derived from `est_copy_ms = (bytes / max(bandwidth_caps,1)) × window_ms`
/// against the destination layer's latency: `overlap = min(3, 1 +
/// [est_copy_ms>lat_ms] + [est_copy_ms>2·lat_ms])`. When `enable_overlap` is
/// off, every op gets a neutral `overlap_depth=1`.
pub fn annotate(ops: &[PlanOp], layer_lat: &[LayerLat], tier_caps: &[TierCap], window_ms: f64, enable_overlap: bool) -> Vec<PlanOp> {
    let lat_by_layer: HashMap<u32, f64> = layer_lat.iter().map(|l| (l.layer, l.lat_ms)).collect();
    let bw_by_dst: HashMap<(String, Tier), u64> =
        tier_caps.iter().map(|c| ((c.node.clone(), c.tier), c.bw_bytes_per_window)).collect();

    let mut by_node: HashMap<String, Vec<usize>> = HashMap::new();
    for (idx, op) in ops.iter().enumerate() {
        by_node.entry(op.node.clone()).or_default().push(idx);
    }

    let mut out = ops.to_vec();
    for indices in by_node.values() {
        let mut ranked = indices.clone();
        ranked.sort_by(|&a, &b| ops[a].deadline_ms.partial_cmp(&ops[b].deadline_ms).unwrap());

        for (rank, &idx) in ranked.iter().enumerate() {
            out[idx].priority = rank as u32;

            if !enable_overlap {
                out[idx].overlap_depth = 1;
                continue;
            }

            let lat_ms = lat_by_layer.get(&ops[idx].layer).copied().unwrap_or(1.0);
            let bandwidth_caps = bw_by_dst
                .get(&(ops[idx].node.clone(), ops[idx].tier_dst))
                .copied()
                .unwrap_or(u64::MAX)
                .max(1);
            let est_copy_ms = (ops[idx].bytes as f64 / bandwidth_caps as f64) * window_ms;
            let over_1x = if est_copy_ms > lat_ms { 1 } else { 0 };
            let over_2x = if est_copy_ms > 2.0 * lat_ms { 1 } else { 0 };
            out[idx].overlap_depth = (1 + over_1x + over_2x).min(3);
        }
    }
    out
}

/// Runs the full pipeline for one decode window: context-parallel sharding,
/// prefix-cluster assignment, score & filter, tenant credit gate, coalesce,
/// cap, annotate, and a final deadline-ascending sort within each
/// `(node, tier_src, tier_dst)` group for the executor's dispatch order
/// (`spec.md` §5).
#[allow(clippy::too_many_arguments)]
pub fn plan_window(
    requests: &[KVRequest],
    heat: &[HeatRow],
    tenant_caps: &[TenantCap],
    tier_caps: &[TierCap],
    layer_lat: &[LayerLat],
    knobs: &Knobs,
    flags: &PipelineFlags,
    now_ms: f64,
    world_size: u32,
    rank: u32,
) -> Result<(Vec<PlanOp>, PipelineStats)> {
    let mut stats = PipelineStats::default();

    let sharded = shard_for_rank(requests, world_size, rank);

    let mut clustered = sharded;
    assign_prefix_clusters(&mut clustered, knobs)?;

    let filtered = score_and_filter(&clustered, heat, knobs, now_ms, &mut stats);
    let gated = apply_tenant_caps(&filtered, tenant_caps, knobs.page_bytes, flags.enable_tenant_credits, &mut stats);
    let coalesced = coalesce_intervals(&gated, knobs.page_bytes, knobs.min_io_bytes, flags.enable_prefix_fanout, &mut stats);
    let capped = apply_caps(&coalesced, tier_caps, knobs.max_ops_per_tier, knobs.enforce_tier_caps, &mut stats);
    let mut annotated = annotate(&capped, layer_lat, tier_caps, knobs.window_ms, flags.enable_overlap);

    annotated.sort_by(|a, b| {
        (&a.node, a.tier_src, a.tier_dst)
            .cmp(&(&b.node, b.tier_src, b.tier_dst))
            .then(a.deadline_ms.partial_cmp(&b.deadline_ms).unwrap())
    });

    Ok((annotated, stats))
}
