use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use meshd::config::NodeArgs;
use meshd::dataplane::{Dataplane, Device, PipelineContext, TunDevice, UdpTransport};
use meshd::kv;
use meshd::mapping::NodeKeys;
use meshd::metric::{self, Aggregator, MetricsLog};
use meshd::payload::MTU;
use meshd::router::Router;
use meshd::store::MappingStore;

#[tokio::main]
async fn main() {
    let args = NodeArgs::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if let Err(e) = run(args).await {
        error!("meshd failed: {e:#}");
        std::process::exit(1);
    }
}

async fn run(args: NodeArgs) -> anyhow::Result<()> {
    let settings = args.store_settings()?;
    let machine_id = settings.machine_id.clone();

    let kv = kv::open(&args.datastore_kind())
        .await
        .context("failed to open datastore")?;
    let store = Arc::new(MappingStore::new(kv, settings, NodeKeys::generate()));

    info!(machine_id = %machine_id, "joining overlay network");
    store.init().await.context("failed to join overlay network")?;
    store.start()?;

    let result = serve(&args, &store).await;

    store.stop().await;
    match store.deregister().await {
        Ok(()) => info!(machine_id = %machine_id, "node record removed"),
        Err(e) => warn!(error = %e, "failed to remove node record, it expires with its lease"),
    }

    let log = result?.stop();
    log_stats(&log);
    info!("shutdown complete");
    Ok(())
}

/// Run the data plane until SIGINT/SIGTERM. Returns the aggregator for a
/// final report once everything else is down.
async fn serve(args: &NodeArgs, store: &Arc<MappingStore>) -> anyhow::Result<Aggregator> {
    let local = store.local().context("local mapping missing")?;
    let network = store.network().context("network config missing")?;
    let settings = args.dataplane_settings();

    let device = TunDevice::open(&args.device, settings.workers).context(
        "failed to open TUN device, do you have root privileges? Try running with 'sudo'",
    )?;
    device
        .configure(local.private_ip, network.network.prefix_len(), MTU)
        .context("failed to configure TUN device")?;
    for ip in &args.floating_ips {
        device
            .add_address(*ip, 32)
            .with_context(|| format!("failed to add floating ip {ip}"))?;
    }
    let queues = device.queues();
    let device = Arc::new(device);

    let socket = Arc::new(
        UdpTransport::bind(args.listen_addr(), queues)
            .with_context(|| format!("failed to bind {}", args.listen_addr()))?,
    );

    let (metrics, rx) = metric::channel();
    let aggregator = Aggregator::spawn(rx, queues, args.stats_interval())
        .context("failed to start metrics thread")?;

    let ctx = PipelineContext {
        device,
        socket,
        router: Router::new(network.network, store.clone()),
        plugins: Arc::new(args.plugin_chain()),
        local_ip: local.private_ip,
        metrics,
    };
    let dataplane = Dataplane::start(&settings, ctx).context("failed to start workers")?;

    info!(
        private_ip = %local.private_ip,
        network = %network.network,
        endpoint = %local.endpoint(),
        plugins = ?local.supported_plugins,
        "meshd running"
    );

    let mut sigint = signal(SignalKind::interrupt()).context("failed to set up SIGINT handler")?;
    let mut sigterm =
        signal(SignalKind::terminate()).context("failed to set up SIGTERM handler")?;
    tokio::select! {
        _ = sigint.recv() => info!("received SIGINT, shutting down"),
        _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
    }

    tokio::task::spawn_blocking(move || dataplane.stop())
        .await
        .context("data plane shutdown panicked")?;
    Ok(aggregator)
}

fn log_stats(log: &MetricsLog) {
    match serde_json::to_string(log) {
        Ok(json) => info!(stats = %json, "final traffic stats"),
        Err(e) => warn!(error = %e, "failed to encode stats"),
    }
}
