//! swapx-broker — the OTC atomic-swap broker daemon.
//!
//! Startup sequence:
//!   1. Load configuration from the environment
//!   2. Open (or initialise) the broker database
//!   3. Build one chain adapter per configured chain
//!   4. Start the JSON-RPC 2.0 server
//!   5. Run the two periodic drivers: the deal tick (stage evaluation) and
//!      the queue tick (outbound dispatch)

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use swapx_chain::rpc::RpcChainAdapter;
use swapx_chain::{AdapterRegistry, EscrowDeriver};
use swapx_core::config::BrokerConfig;
use swapx_core::types::DealId;
use swapx_engine::DealEngine;
use swapx_ledger::Ledger;
use swapx_queue::QueueWorker;
use swapx_rpc::{RpcServer, RpcServerState};

#[derive(Parser, Debug)]
#[command(
    name = "swapx-broker",
    version,
    about = "SwapX broker — escrowed OTC swaps across chains"
)]
struct Args {
    /// Directory for the persistent broker database.
    #[arg(long, default_value = "~/.swapx/data")]
    data_dir: PathBuf,

    /// JSON-RPC listen address.
    #[arg(long, default_value = "127.0.0.1:8844")]
    rpc_addr: SocketAddr,

    /// Lease owner identity; defaults to a per-process id.
    #[arg(long)]
    owner_id: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,swapx=debug".parse().unwrap()),
        )
        .init();

    let args = Args::parse();
    info!("SwapX broker starting");

    // ── Configuration ─────────────────────────────────────────────────────────
    let config = Arc::new(BrokerConfig::from_env().context("loading configuration")?);
    if config.chains.is_empty() {
        anyhow::bail!("no chains configured; set <CHAIN>_RPC or <CHAIN>_ELECTRUM");
    }
    if config.production_mode && config.hot_wallet_seed.is_none() {
        anyhow::bail!("PRODUCTION_MODE requires HOT_WALLET_SEED");
    }
    info!(chains = ?config.chains.keys().collect::<Vec<_>>(), "configuration loaded");

    // ── Broker database ───────────────────────────────────────────────────────
    let data_dir = expand_tilde(&args.data_dir);
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("creating data dir {}", data_dir.display()))?;
    let ledger = Arc::new(Ledger::open(&data_dir).context("opening broker database")?);

    // ── Chain adapters ────────────────────────────────────────────────────────
    let seed = match &config.hot_wallet_seed {
        Some(seed) => seed.clone(),
        None => {
            warn!("No HOT_WALLET_SEED provided. Generating an ephemeral seed — DO NOT USE IN PRODUCTION.");
            Zeroizing::new(hex::encode(rand::random::<[u8; 32]>()))
        }
    };
    let deriver = Arc::new(EscrowDeriver::new(seed));
    let mut registry = AdapterRegistry::new();
    for profile in config.chains.values() {
        registry.insert(Arc::new(RpcChainAdapter::new(profile, Arc::clone(&deriver))));
        info!(chain = %profile.chain_id, endpoint = %profile.endpoint, "chain adapter ready");
    }

    // ── Engine and worker ─────────────────────────────────────────────────────
    let owner_id = args
        .owner_id
        .unwrap_or_else(|| format!("swapx-{}", std::process::id()));
    let engine = Arc::new(DealEngine::new(
        Arc::clone(&ledger),
        registry.clone(),
        Arc::clone(&config),
        owner_id.clone(),
    ));
    let worker = Arc::new(QueueWorker::new(
        Arc::clone(&ledger),
        registry,
        Arc::clone(&config),
    ));

    // ── On-demand tick trigger (RPC mutations ping the deal driver) ───────────
    let (tick_tx, mut tick_rx) = tokio::sync::mpsc::channel::<DealId>(64);

    // ── RPC server ────────────────────────────────────────────────────────────
    let rpc_state = Arc::new(RpcServerState {
        ledger: Arc::clone(&ledger),
        engine: Arc::clone(&engine),
        config: Arc::clone(&config),
        tick_tx: Some(tick_tx),
    });
    let _rpc_handle = RpcServer::new(rpc_state)
        .start(args.rpc_addr)
        .await
        .context("starting RPC server")?;

    // ── Deal-tick driver ──────────────────────────────────────────────────────
    let deal_engine = Arc::clone(&engine);
    let deal_ledger = Arc::clone(&ledger);
    let deal_tick_secs = config.deal_tick_secs;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(deal_tick_secs));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    run_deal_tick(&deal_engine, &deal_ledger).await;
                }
                Some(deal_id) = tick_rx.recv() => {
                    let now = chrono::Utc::now().timestamp();
                    if let Err(e) = deal_engine.tick_deal(&deal_id, now).await {
                        warn!(deal_id = %deal_id, error = %e, "triggered tick failed");
                    }
                }
            }
        }
    });

    // ── Queue-tick driver ─────────────────────────────────────────────────────
    let queue_ledger = Arc::clone(&ledger);
    let queue_tick_secs = config.queue_tick_secs;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(queue_tick_secs));
        loop {
            ticker.tick().await;
            let now = chrono::Utc::now().timestamp();
            if let Err(e) = worker.tick(now).await {
                warn!(error = %e, "queue tick failed");
            }
            if let Err(e) = queue_ledger.flush() {
                warn!(error = %e, "ledger flush failed");
            }
        }
    });

    info!(owner_id = %owner_id, "broker ready");
    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("shutting down");
    ledger.flush().context("final flush")?;
    Ok(())
}

/// One pass of the deal tick: every deal, in parallel, with one `now`.
async fn run_deal_tick(engine: &Arc<DealEngine>, ledger: &Arc<Ledger>) {
    let now = chrono::Utc::now().timestamp();
    let deals = match ledger.iter_all_deals() {
        Ok(deals) => deals,
        Err(e) => {
            warn!(error = %e, "deal scan failed; retrying next tick");
            return;
        }
    };
    let ticks: Vec<_> = deals
        .iter()
        .map(|deal| {
            let engine = Arc::clone(engine);
            let deal_id = deal.id.clone();
            async move { (deal_id.clone(), engine.tick_deal(&deal_id, now).await) }
        })
        .collect();
    for (deal_id, result) in futures::future::join_all(ticks).await {
        if let Err(e) = result {
            if e.is_transient() {
                debug!(deal_id = %deal_id, error = %e, "deal tick transient failure");
            } else {
                warn!(deal_id = %deal_id, error = %e, "deal tick failed");
            }
        }
    }
    if let Err(e) = ledger.flush() {
        warn!(error = %e, "ledger flush failed");
    }
}

/// Expand a leading `~` to the user's home directory. Paths without a tilde,
/// or environments with no home directory set, pass through untouched.
fn expand_tilde(path: &Path) -> PathBuf {
    let Ok(rest) = path.strip_prefix("~") else {
        return path.to_path_buf();
    };
    match ["HOME", "USERPROFILE"].iter().find_map(|var| std::env::var_os(var)) {
        Some(home) => Path::new(&home).join(rest),
        None => path.to_path_buf(),
    }
}
