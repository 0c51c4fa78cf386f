use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use ferry_apply::comparer_for;
use ferry_core::config::Settings;
use ferry_events::EventStream;
use ferry_kubehub::watch::spawn_watchers;
use ferry_kubehub::{KubeClusterApi, LeaderElectionState, LeaseElector};
use ferry_reconcile::{ClusterDefaults, ClusterIdState, HandlerContext, ReactionHelper, KINDS};
use ferry_store::{spawn_ingest, StateContainer, DEFAULT_FLUSH_EVERY};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const DELTA_CHANNEL_CAP: usize = 4096;

#[derive(Parser, Debug)]
#[command(name = "ferryd", version, about = "Projects cluster-wide templates into per-namespace resources")]
struct Args {
    /// Operator namespace; templates are only read from here
    #[arg(long = "namespace")]
    namespace: Option<String>,

    /// Act as leader unconditionally
    #[arg(long = "no-leader-election", action = ArgAction::SetTrue)]
    no_leader_election: bool,

    /// Run a single reconciliation pass after the initial sync, then exit
    #[arg(long = "once", action = ArgAction::SetTrue)]
    once: bool,
}

fn init_tracing() {
    let env = std::env::var("FERRY_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("FERRY_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid FERRY_METRICS_ADDR; expected host:port");
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let args = Args::parse();

    let mut settings = Settings::from_env().context("loading configuration")?;
    if let Some(ns) = args.namespace {
        settings.telemetry.cluster_id_namespace = ns.clone();
        settings.tls_storage.secret_namespace = ns.clone();
        settings.operator.namespace = ns;
    }
    if args.no_leader_election {
        settings.operator.leader_election = false;
    }
    let opts = settings.operator.clone();
    info!(
        namespace = %opts.namespace,
        comparer = ?opts.comparer,
        queue_size = opts.event_queue_size,
        queue_mode = ?opts.event_queue_full_mode,
        merge_window_s = opts.event_queue_merge_window.as_secs(),
        settle_s = opts.settle_duration.as_secs(),
        leader_election = opts.leader_election,
        registry = %settings.images.default_registry,
        cluster_id = %settings.telemetry.cluster_id_name,
        early_chaining = settings.injector.enable_early_chaining,
        "starting ferryd"
    );

    let api = KubeClusterApi::try_default().await.context("connecting to cluster")?;
    let client = api.client();
    let cancel = CancellationToken::new();

    let state = Arc::new(StateContainer::new());
    let events = Arc::new(EventStream::from_options(&opts));
    let leader = Arc::new(LeaderElectionState::new(args.once || !opts.leader_election));
    let settle = if args.once { Duration::ZERO } else { opts.settle_duration };
    let gate = Arc::new(ReactionHelper::new(Arc::clone(&leader), settle));

    let ctx = HandlerContext {
        state: Arc::clone(&state),
        classifier: Arc::new(ClusterDefaults::new(Arc::clone(&state), opts.excluded_namespaces.clone())),
        comparer: comparer_for(opts.comparer),
        client: Arc::new(api),
        gate: gate.clone(),
        operator_namespace: opts.namespace.clone(),
        cluster_id: Arc::new(ClusterIdState::new(settings.telemetry.cluster_id_name.clone())),
    };

    let mut tasks = Vec::new();
    let mut first_sync = None;
    if args.once {
        first_sync = Some(events.subscribe());
    } else {
        for kind in KINDS {
            tasks.push((kind.spawn)(ctx.clone(), events.subscribe(), cancel.clone()));
        }
        tasks.push(gate.spawn_wakeups(Arc::clone(&state), Arc::clone(&events), cancel.clone()));
    }
    tasks.push(events.start(cancel.clone()));

    let (tx, ingest) = spawn_ingest(Arc::clone(&state), Arc::clone(&events), DELTA_CHANNEL_CAP, DEFAULT_FLUSH_EVERY, cancel.clone());
    tasks.push(ingest);
    tasks.extend(spawn_watchers(client.clone(), tx, cancel.clone()));

    if opts.leader_election && !args.once {
        let elector = LeaseElector::new(client, &opts.namespace, Arc::clone(&leader));
        tasks.push(tokio::spawn(elector.run(cancel.clone())));
    }

    if let Some(mut rx) = first_sync {
        let t0 = Instant::now();
        tokio::select! {
            _ = rx.recv() => {}
            _ = signal::ctrl_c() => warn!("interrupted before initial sync"),
        }
        info!(entries = state.len(), took_ms = t0.elapsed().as_millis() as u64, "initial sync observed");
        for kind in KINDS {
            let report = (kind.run_once)(ctx.clone(), cancel.clone()).await;
            info!(entity = kind.entity, report = ?report, "one-shot pass done");
        }
        if let Some(id) = ctx.cluster_id.get() {
            info!(guid = %id.guid, created_on = %id.created_on, "cluster id");
        }
    } else {
        signal::ctrl_c().await.context("waiting for shutdown signal")?;
        info!("shutdown requested");
    }

    cancel.cancel();
    for t in tasks {
        if let Err(e) = t.await {
            warn!(error = %e, "task ended abnormally");
        }
    }
    info!(epoch = state.epoch(), dirty = state.dirty_count(), "ferryd stopped");
    Ok(())
}
