//! Simulation driver: generates a synthetic decode window, runs it through
//! the planning pipeline and the node executor against a local segment
//! store, and prints a plan + completion summary. Also hosts the config
//! promotion workflow and the HTTP plan service as subcommands.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Context;
use bcache_config::{load_config, promote_config, RuntimeConfig};
use bcache_engine::{CopyEngine, SimCopyEngine};
use bcache_executor::{NodeExecutor, ReadyEvent};
use bcache_model::{HeatRow, KVRequest, LayerLat, TenantCap, TierCap, Tier};
use bcache_planner::{admission_core, eviction_core, plan_window};
use bcache_store::SegmentStore;
use bcache_telemetry::{init_tracing, WindowCounters};
use camino::Utf8PathBuf;
use clap::{Parser, Subcommand};
use rand::Rng;

#[derive(Parser)]
#[command(name = "bcache", about = "KV-cache prefetch planner simulation driver")]
struct Cli {
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Generate a synthetic window, plan it, and execute it against a local
    /// segment store.
    Simulate(SimulateArgs),
    /// Copy a staged config file onto the runtime config path.
    PromoteConfig(PromoteArgs),
    /// Run the HTTP plan service.
    Serve(ServeArgs),
}

#[derive(Parser)]
struct SimulateArgs {
    #[arg(long, default_value = "./bcache-data")]
    root: Utf8PathBuf,

    #[arg(long)]
    staged_config: Option<Utf8PathBuf>,

    #[arg(long)]
    runtime_config: Option<Utf8PathBuf>,

    #[arg(long, default_value_t = 200)]
    num_requests: u64,

    #[arg(long, default_value_t = 4)]
    num_tenants: u32,

    #[arg(long, default_value_t = 8)]
    num_layers: u32,

    #[arg(long, default_value_t = 1024)]
    pages_per_layer: u64,

    /// Disable the copy engine and always use the plain fallback read path.
    #[arg(long)]
    no_engine: bool,

    /// Total number of context-parallel ranks sharing this window.
    #[arg(long, default_value_t = 1)]
    world_size: u32,

    /// This process's rank within `world_size`.
    #[arg(long, default_value_t = 0)]
    rank: u32,
}

#[derive(Parser)]
struct PromoteArgs {
    #[arg(long)]
    staged: Utf8PathBuf,

    #[arg(long)]
    runtime: Utf8PathBuf,
}

#[derive(Parser)]
struct ServeArgs {
    #[arg(long, default_value = "127.0.0.1:8080")]
    addr: SocketAddr,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    match cli.command {
        Command::Simulate(args) => run_simulate(args).await,
        Command::PromoteConfig(args) => {
            promote_config(&args.staged, &args.runtime).context("promoting config")
        }
        Command::Serve(args) => bcache_service::serve(args.addr).await.context("http service"),
    }
}

fn synthetic_requests(args: &SimulateArgs) -> Vec<KVRequest> {
    let mut rng = rand::thread_rng();
    (0..args.num_requests)
        .map(|i| {
            let layer = rng.gen_range(0..args.num_layers);
            let tenant = format!("tenant-{}", rng.gen_range(0..args.num_tenants));
            let page_start = rng.gen_range(0..args.pages_per_layer.saturating_sub(8).max(1));
            let span = rng.gen_range(0..8);
            KVRequest {
                request_id: i,
                node: "node-0".into(),
                tenant,
                layer,
                page_start,
                page_end: page_start + span,
                tier_src: Tier::Storage,
                tier_dst: Tier::Host,
                deadline_ms: rng.gen_range(1.0..40.0),
                est_fill_ms: rng.gen_range(0.5..5.0),
                pcluster: -1,
                route_hint: None,
            }
        })
        .collect()
}

async fn run_simulate(args: SimulateArgs) -> anyhow::Result<()> {
    let config: RuntimeConfig = load_config(args.staged_config.as_deref(), args.runtime_config.as_deref())
        .context("loading runtime config")?;

    let mut requests = synthetic_requests(&args);
    annotate_route_hints(&mut requests, &config)?;

    let tier_caps = vec![TierCap {
        node: "node-0".into(),
        tier: Tier::Host,
        free_bytes: u64::MAX,
        bw_bytes_per_window: 512 * 1024 * 1024,
        max_ops: 256,
        target_free_bytes: Some(64 * 1024 * 1024),
    }];
    let tenant_caps: Vec<TenantCap> = config
        .tenant_credits_bytes
        .iter()
        .map(|(tenant, bytes)| TenantCap {
            node: "node-0".into(),
            tier_dst: Tier::Host,
            tenant: tenant.clone(),
            credit_bytes: *bytes,
        })
        .collect();
    let layer_lat: Vec<LayerLat> = (0..args.num_layers)
        .map(|layer| LayerLat { layer, lat_ms: 2.0 })
        .collect();
    let heat: Vec<HeatRow> = Vec::new();

    let knobs = config.effective_knobs();
    let flags = config.pipeline_flags();

    let (ops, stats) = plan_window(
        &requests,
        &heat,
        &tenant_caps,
        &tier_caps,
        &layer_lat,
        &knobs,
        &flags,
        0.0,
        args.world_size,
        args.rank,
    )
    .context("planning window")?;

    println!(
        "planned {} ops from {} requests (dropped: degenerate={}, tenant_cap={}, tier_cap={}, op_cap={}, min_io={})",
        ops.len(),
        requests.len(),
        stats.dropped_degenerate,
        stats.dropped_by_tenant_cap,
        stats.dropped_by_tier_cap,
        stats.dropped_by_op_cap,
        stats.dropped_by_min_io
    );

    if knobs.enable_admission {
        let admitted = admission_core(&heat, knobs.reuse_threshold);
        println!("admission: {} pages", admitted.len());
    }
    if knobs.enable_eviction {
        let victims: Vec<_> = tier_caps
            .iter()
            .filter_map(|cap| {
                cap.target_free_bytes
                    .map(|target| eviction_core(&cap.node, cap.tier, &heat, cap.free_bytes, target))
            })
            .flatten()
            .collect();
        println!("eviction: {} victims", victims.len());
    }

    let store = SegmentStore::new(args.root.clone(), config.knobs.page_bytes);
    seed_synthetic_segments(&store, &args, args.pages_per_layer).await?;

    let engine: Option<Arc<dyn CopyEngine>> = if args.no_engine {
        None
    } else {
        Some(Arc::new(SimCopyEngine::new()))
    };
    let executor = NodeExecutor::new(store, engine);

    let counters = Arc::new(Mutex::new(WindowCounters::default()));
    counters.lock().unwrap().add_pipeline_stats(&stats);
    let completed = Arc::new(AtomicU64::new(0));
    let counters_cb = counters.clone();
    let completed_cb = completed.clone();
    let on_ready: bcache_executor::OnReady = Arc::new(move |event: ReadyEvent| {
        counters_cb.lock().unwrap().record_ready(&event);
        completed_cb.fetch_add(1, Ordering::SeqCst);
    });

    executor.execute("bcache-sim", "v1", &ops, on_ready).await?;

    // Give any in-flight engine completions a moment to land before
    // printing the final summary.
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;

    let final_counters = counters.lock().unwrap().clone();
    println!(
        "executed {} ops, {} bytes, on_time={} late={}",
        final_counters.ops_completed,
        final_counters.bytes_completed,
        final_counters.on_time_count,
        final_counters.late_count
    );

    Ok(())
}

/// Tags each synthetic request with a `route_hint` carrying a prefix-cluster
/// id, logged here for visibility. `plan_window` assigns the authoritative
/// `pcluster` itself (falling back to this same `route_hint` as its
/// clustering key), so this is an early look at the same grouping the
/// pipeline will use, not a separate decision.
fn annotate_route_hints(requests: &mut [KVRequest], config: &RuntimeConfig) -> anyhow::Result<()> {
    let keys: Vec<String> = requests
        .iter()
        .map(|r| format!("{}:{}", r.tenant, r.layer))
        .collect();

    let ids = if config.ab_flags.use_minhash_clustering {
        bcache_cluster::assign_pclusters_minhash(
            &keys,
            config.knobs.num_hashes,
            config.knobs.bands,
            config.knobs.k_shingle,
        )?
    } else {
        bcache_cluster::assign_pclusters(&keys, 64)
    };

    let distinct = ids.iter().collect::<std::collections::HashSet<_>>().len();
    tracing::debug!(distinct_clusters = distinct, "assigned prefix clusters");

    for (req, id) in requests.iter_mut().zip(ids) {
        req.route_hint = Some(format!("pcluster:{id}"));
    }
    Ok(())
}

async fn seed_synthetic_segments(
    store: &SegmentStore,
    args: &SimulateArgs,
    pages_per_layer: u64,
) -> anyhow::Result<()> {
    let page_bytes = store.page_bytes() as usize;
    let filler = vec![0xABu8; page_bytes];
    for layer in 0..args.num_layers {
        for page in 0..pages_per_layer {
            store
                .write_page("bcache-sim", "v1", layer, page, &filler)
                .await
                .with_context(|| format!("seeding layer {layer} page {page}"))?;
        }
    }
    Ok(())
}
