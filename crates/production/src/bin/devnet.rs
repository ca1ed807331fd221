//! Blockmania Devnet
//!
//! Runs a whole committee in one process, connected by an in-memory hub,
//! and optionally drives it with synthetic transactions.
//!
//! # Usage
//!
//! ```bash
//! # Four nodes with default settings until Ctrl+C
//! blockmania-devnet
//!
//! # From a configuration file, for one minute
//! blockmania-devnet --config devnet.toml --duration-secs 60
//!
//! # Seven nodes, one of them cut off after ten seconds
//! blockmania-devnet --nodes 7 --isolate 6 --isolate-after-secs 10
//! ```
//!
//! Every node's committed prefix is compared against the others as entries
//! arrive; a divergence is logged as an error and fails the process.

use anyhow::{bail, Context, Result};
use blockmania_production::network::{InMemoryHub, RetryPolicy};
use blockmania_production::{
    init_telemetry, DevnetConfig, NodeOutput, ProductionRunner, TransactionSubmitter,
};
use blockmania_types::{BatchRef, Ed25519Keyring, NodeId, StaticTopology};
use clap::Parser;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio::signal;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Blockmania Devnet
#[derive(Parser, Debug)]
#[command(name = "blockmania-devnet")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Committee size (overrides config)
    #[arg(long)]
    nodes: Option<u64>,

    /// Synthetic submissions per second (overrides config)
    #[arg(long)]
    tps: Option<u32>,

    /// Metrics port; enables the endpoint (overrides config)
    #[arg(long)]
    metrics_port: Option<u16>,

    /// Stop after this many seconds instead of waiting for Ctrl+C
    #[arg(long)]
    duration_secs: Option<u64>,

    /// Node to cut off from the hub
    #[arg(long)]
    isolate: Option<u64>,

    /// Seconds after start at which `--isolate` takes effect
    #[arg(long, default_value_t = 10)]
    isolate_after_secs: u64,
}

impl Cli {
    fn apply_overrides(&self, config: &mut DevnetConfig) {
        if let Some(nodes) = self.nodes {
            config.committee.size = nodes;
        }
        if let Some(tps) = self.tps {
            config.load.transactions_per_second = tps;
        }
        if let Some(port) = self.metrics_port {
            config.metrics.enabled = true;
            config.metrics.port = port;
        }
    }
}

/// Tracks every node's prefix and checks they agree position by position.
#[derive(Default)]
struct PrefixMonitor {
    /// Reference ordering: first entry seen at each position.
    canonical: Vec<BatchRef>,
    /// Prefix length per node.
    lengths: BTreeMap<NodeId, usize>,
    diverged: bool,
}

impl PrefixMonitor {
    fn observe(&mut self, node: NodeId, entries: &[blockmania_types::CommittedEntry]) {
        for entry in entries {
            let position = entry.position as usize;
            let batch_ref = entry.batch_ref();
            match self.canonical.get(position) {
                Some(existing) if *existing != batch_ref => {
                    error!(
                        %node,
                        position,
                        expected = %existing,
                        got = %batch_ref,
                        "Committed prefixes diverged"
                    );
                    self.diverged = true;
                }
                Some(_) => {}
                None => self.canonical.push(batch_ref),
            }
            self.lengths.insert(node, position + 1);
        }
    }

    fn summary(&self) -> String {
        self.lengths
            .iter()
            .map(|(node, len)| format!("{node}:{len}"))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Submit synthetic payloads round-robin across the committee until
/// cancelled. Returns how many were handed to a runner.
async fn run_load(
    submitters: Vec<TransactionSubmitter>,
    per_second: u32,
    payload_bytes: usize,
    cancel: CancellationToken,
) -> u64 {
    if per_second == 0 || submitters.is_empty() {
        return 0;
    }
    let mut tick = tokio::time::interval(Duration::from_secs(1) / per_second);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let mut submitted: u64 = 0;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tick.tick() => {}
        }
        let target = &submitters[(submitted % submitters.len() as u64) as usize];
        let mut payload = submitted.to_le_bytes().to_vec();
        payload.resize(payload_bytes.max(8), 0);
        if target.submit(payload).await.is_err() {
            break;
        }
        submitted += 1;
    }
    submitted
}

async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => DevnetConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => DevnetConfig::default(),
    };
    cli.apply_overrides(&mut config);
    config.validate().context("Invalid configuration")?;

    let telemetry = init_telemetry(&config.telemetry_config())?;

    let members: Vec<NodeId> = (0..config.committee.size).map(NodeId).collect();
    let hub = InMemoryHub::new();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<(NodeId, NodeOutput)>();

    // Child tokens: the load generator and the runners stop independently.
    let cancel = CancellationToken::new();
    let retry = RetryPolicy::default();
    let mut submitters = Vec::new();
    let mut tasks = Vec::new();

    for id in &members {
        let topology = StaticTopology::new(*id, members.clone())?.into_arc();
        let crypto = Ed25519Keyring::deterministic(*id, &members, config.committee.key_seed)
            .into_arc();

        // Tag each node's outputs with its id for the monitor.
        let (node_tx, mut node_rx) = mpsc::unbounded_channel();
        let forward = out_tx.clone();
        let node = *id;
        tokio::spawn(async move {
            while let Some(output) = node_rx.recv().await {
                if forward.send((node, output)).is_err() {
                    break;
                }
            }
        });

        let runner = ProductionRunner::builder()
            .topology(topology)
            .crypto(crypto)
            .bft_config(config.bft_config())
            .mempool_config(config.mempool_config())
            .channel_capacity(config.committee.channel_capacity)
            .hub(hub.clone())
            .outputs(node_tx)
            .cancellation(cancel.child_token())
            .connect(&retry)
            .await
            .with_context(|| format!("Failed to start runner for node {id}"))?;

        submitters.push(runner.submitter());
        tasks.push(tokio::spawn(runner.run()));
    }
    drop(out_tx);

    info!(
        nodes = members.len(),
        tps = config.load.transactions_per_second,
        "Devnet started, press Ctrl+C to stop"
    );
    telemetry.set_ready(true);

    let load_cancel = cancel.child_token();
    let load = tokio::spawn(run_load(
        submitters,
        config.load.transactions_per_second,
        config.load.payload_bytes,
        load_cancel.clone(),
    ));

    if let Some(node) = cli.isolate {
        let hub = hub.clone();
        let delay = Duration::from_secs(cli.isolate_after_secs);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            warn!(node, "Isolating node from the hub");
            hub.set_online(NodeId(node), false);
        });
    }

    let stop = async {
        match cli.duration_secs {
            Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
            None => wait_for_signal().await,
        }
    };
    tokio::pin!(stop);

    let mut monitor = PrefixMonitor::default();
    let mut report = tokio::time::interval(Duration::from_secs(5));
    loop {
        tokio::select! {
            _ = &mut stop => break,
            Some((node, output)) = out_rx.recv() => match output {
                NodeOutput::Committed(entries) => monitor.observe(node, &entries),
                NodeOutput::Consensus(event) => {
                    info!(%node, event = event.type_name(), details = ?event, "Consensus event");
                }
                NodeOutput::Admission { .. } => {}
            },
            _ = report.tick() => {
                info!(prefixes = %monitor.summary(), "Committed prefix lengths");
            }
        }
    }

    info!("Shutting down devnet");
    load_cancel.cancel();
    match load.await {
        Ok(submitted) => info!(submitted, "Load generator stopped"),
        Err(e) => error!(error = %e, "Load generator panicked"),
    }
    cancel.cancel();
    for task in tasks {
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %e, "Runner failed"),
            Err(e) => error!(error = %e, "Runner task panicked"),
        }
    }
    telemetry.shutdown();

    info!(prefixes = %monitor.summary(), "Devnet stopped");
    if monitor.diverged {
        bail!("committed prefixes diverged");
    }
    Ok(())
}
