//! btcpoold - Stratum V1 Mining-Pool Session Engine
//!
//! Entry point: parses configuration, wires the external-collaborator
//! stores and the `PoolOrchestrator`, and runs the accept loop, the
//! upstream template poller, and the idle-session watchdog concurrently
//! until a shutdown signal arrives.

use std::net::SocketAddr;
use std::process;
use std::sync::Arc;

use bitcoin::Network;
use clap::Parser;
use log::{error, info};

use btcpool_server::{
    HttpBitcoinRpc, HttpTemplatePoller, MemoryAddressSettingsStore, MemoryBlockStore, MemoryClientStore,
    MemoryStatisticsStore, OrchestratorConfig, PoolOrchestrator, RejectingBitcoinRpc, StaticTemplatePoller,
};

/// Command line arguments for the btcpoold Stratum server.
#[derive(Parser)]
#[clap(name = "btcpoold")]
#[clap(about = "Stratum V1 mining-pool session engine")]
struct Cli {
    /// Bitcoin network this pool serves shares against.
    #[clap(long, value_enum, default_value = "mainnet", env = "BTCPOOL_NETWORK")]
    network: NetworkArg,

    /// Stratum server bind address.
    #[clap(long, default_value = "0.0.0.0:3333", env = "BTCPOOL_STRATUM_BIND")]
    stratum_bind: SocketAddr,

    /// Maximum number of concurrent miner sessions.
    #[clap(long, default_value = "10000", env = "BTCPOOL_MAX_SESSIONS")]
    max_sessions: usize,

    /// Seconds of inactivity (no accepted share) before a session is closed.
    /// Pass 0 to disable the watchdog.
    #[clap(long, default_value = "3600", env = "BTCPOOL_IDLE_TIMEOUT_SECS")]
    idle_timeout_secs: u32,

    /// Address receiving the development fee split on qualifying sessions.
    /// Unset or empty disables the dev fee entirely (spec.md §6 payout policy).
    #[clap(long, env = "BTCPOOL_DEV_FEE_ADDRESS")]
    dev_fee_address: Option<String>,

    /// Bitcoin node JSON-RPC URL, e.g. http://127.0.0.1:8332. When unset,
    /// the pool runs with a stub RPC that rejects every submitted block and
    /// a static, never-updating template — useful for protocol-level
    /// testing without a node.
    #[clap(long, env = "BTCPOOL_RPC_URL")]
    rpc_url: Option<String>,

    /// Bitcoin node RPC username.
    #[clap(long, default_value = "", env = "BTCPOOL_RPC_USER")]
    rpc_user: String,

    /// Bitcoin node RPC password.
    #[clap(long, default_value = "", env = "BTCPOOL_RPC_PASSWORD")]
    rpc_password: String,

    /// Verbosity level (0=error .. 4=trace).
    #[clap(short, long, default_value = "2")]
    verbosity: u8,
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
enum NetworkArg {
    Mainnet,
    Testnet,
}

impl From<NetworkArg> for Network {
    fn from(value: NetworkArg) -> Self {
        match value {
            NetworkArg::Mainnet => Network::Bitcoin,
            NetworkArg::Testnet => Network::Testnet,
        }
    }
}

/// Initializes `env_logger` at the verbosity the operator chose.
fn init_logging(verbosity: u8) {
    let log_level = match verbosity {
        0 => log::LevelFilter::Error,
        1 => log::LevelFilter::Warn,
        2 => log::LevelFilter::Info,
        3 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };

    env_logger::Builder::new().filter_level(log_level).format_timestamp_millis().init();
}

/// A template with no transactions and an obviously-placeholder prev-hash,
/// served exactly once by [`StaticTemplatePoller`] so a pool started without
/// a configured Bitcoin node still completes handshakes and pushes one job.
fn placeholder_template() -> btcpool_bitcoin::Template {
    btcpool_bitcoin::Template {
        id: 0,
        prev_hash: [0u8; 32],
        version: 0x2000_0000,
        nbits: 0x1d00_ffff,
        height: 0,
        transactions: vec![],
        is_new_tip: true,
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbosity);

    info!("starting btcpoold");
    info!(
        "vardiff constants: K={} target_rate={:.3}Hz snap=power-of-two",
        btcpool_stratum::vardiff::K,
        btcpool_stratum::vardiff::TARGET_RATE_HZ
    );

    let network: Network = cli.network.into();
    let idle_timeout_secs = if cli.idle_timeout_secs == 0 { None } else { Some(cli.idle_timeout_secs) };

    let client_store = Arc::new(MemoryClientStore::new());
    let statistics_store = Arc::new(MemoryStatisticsStore::new());
    let block_store = Arc::new(MemoryBlockStore::new());
    let address_settings_store = Arc::new(MemoryAddressSettingsStore::new());

    let bitcoin_rpc: Arc<dyn btcpool_stratum::collaborators::BitcoinRpc> = match &cli.rpc_url {
        Some(url) => Arc::new(HttpBitcoinRpc::new(url.clone(), cli.rpc_user.clone(), cli.rpc_password.clone())),
        None => {
            info!("no --rpc-url configured, submitted blocks will always be rejected");
            Arc::new(RejectingBitcoinRpc)
        }
    };

    let template_poller: Arc<dyn btcpool_stratum::collaborators::TemplatePoller> = match &cli.rpc_url {
        Some(url) => Arc::new(HttpTemplatePoller::new(url.clone(), cli.rpc_user.clone(), cli.rpc_password.clone())),
        None => {
            info!("no --rpc-url configured, serving a single placeholder template");
            Arc::new(StaticTemplatePoller::new(placeholder_template()))
        }
    };

    let config = OrchestratorConfig {
        bind_addr: cli.stratum_bind,
        network,
        dev_fee_address: cli.dev_fee_address.filter(|a| !a.is_empty()),
        max_sessions: cli.max_sessions,
        idle_timeout_secs,
    };

    let orchestrator = PoolOrchestrator::new(
        config,
        client_store,
        statistics_store,
        block_store,
        address_settings_store,
        bitcoin_rpc,
        template_poller,
    );

    tokio::spawn(orchestrator.clone().run_template_poller());
    tokio::spawn(orchestrator.clone().run_idle_watchdog());

    let run_handle = tokio::spawn(orchestrator.clone().run());

    tokio::select! {
        result = run_handle => {
            if let Ok(Err(e)) = result {
                error!("accept loop failed: {}", e);
                process::exit(1);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("received shutdown signal");
            orchestrator.shutdown().await;
        }
    }

    info!("btcpoold stopped");
}
