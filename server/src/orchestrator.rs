//! Accepts TCP connections, instantiates a [`SessionFSM`] per connection,
//! and wires the shared [`JobRegistry`] and external collaborators
//! together. Grounded on the teacher's `mining/src/stratum.rs::StratumServer`
//! (accept loop, reader/writer task split, periodic session cleanup),
//! generalized with a `Semaphore` session bound and a `CancellationToken`
//! for the cooperative shutdown spec.md §5 requires.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bitcoin::Network;
use futures::StreamExt;
use log::{debug, error, info, warn};
use rand::RngCore;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex as AsyncMutex, Semaphore};
use tokio_util::codec::{FramedRead, LinesCodec};
use tokio_util::sync::CancellationToken;

use btcpool_stratum::collaborators::{
    AddressSettingsStore, BitcoinRpc, BlockStore, ClientStore, StatisticsStore, TemplatePoller,
};
use btcpool_stratum::{JobRegistry, SessionDeps, SessionFSM};

const MAX_LINE_LENGTH: usize = 64 * 1024;
const TEMPLATE_POLL_INTERVAL: Duration = Duration::from_secs(5);
const IDLE_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const DEFAULT_IDLE_TIMEOUT_SECS: u32 = 3600;

/// Binding, network, and policy configuration for a running pool.
pub struct OrchestratorConfig {
    pub bind_addr: SocketAddr,
    pub network: Network,
    pub dev_fee_address: Option<String>,
    pub max_sessions: usize,
    /// Idle sessions (no accepted share for this long) are closed by the
    /// watchdog sweep; `None` disables the watchdog (spec.md §5: optional).
    pub idle_timeout_secs: Option<u32>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:3333".parse().unwrap(),
            network: Network::Bitcoin,
            dev_fee_address: None,
            max_sessions: 10_000,
            idle_timeout_secs: Some(DEFAULT_IDLE_TIMEOUT_SECS),
        }
    }
}

/// Owns the [`JobRegistry`], the live-session set, and handles to every
/// external collaborator. The only component in this workspace that runs a
/// TCP accept loop — spec.md §1 names the listener an external interface in
/// the abstract, but nothing else in this system would provide one, so the
/// concrete loop lives here (spec.md §4.9).
pub struct PoolOrchestrator {
    config: OrchestratorConfig,
    job_registry: Arc<JobRegistry>,
    client_store: Arc<dyn ClientStore>,
    statistics_store: Arc<dyn StatisticsStore>,
    block_store: Arc<dyn BlockStore>,
    address_settings_store: Arc<dyn AddressSettingsStore>,
    bitcoin_rpc: Arc<dyn BitcoinRpc>,
    template_poller: Arc<dyn TemplatePoller>,
    sessions: Arc<Semaphore>,
    live: AsyncMutex<HashMap<String, Arc<SessionFSM>>>,
    cancellation: CancellationToken,
    next_session_id: AtomicU64,
}

impl PoolOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: OrchestratorConfig,
        client_store: Arc<dyn ClientStore>,
        statistics_store: Arc<dyn StatisticsStore>,
        block_store: Arc<dyn BlockStore>,
        address_settings_store: Arc<dyn AddressSettingsStore>,
        bitcoin_rpc: Arc<dyn BitcoinRpc>,
        template_poller: Arc<dyn TemplatePoller>,
    ) -> Arc<Self> {
        Arc::new(Self {
            sessions: Arc::new(Semaphore::new(config.max_sessions)),
            config,
            job_registry: Arc::new(JobRegistry::new()),
            client_store,
            statistics_store,
            block_store,
            address_settings_store,
            bitcoin_rpc,
            template_poller,
            live: AsyncMutex::new(HashMap::new()),
            cancellation: CancellationToken::new(),
            next_session_id: AtomicU64::new(1),
        })
    }

    pub fn job_registry(&self) -> &Arc<JobRegistry> {
        &self.job_registry
    }

    pub async fn session_count(&self) -> usize {
        self.live.lock().await.len()
    }

    /// Signals every session to drain and close (spec.md §4.9), then waits
    /// for the live-session set to empty. The orchestrator never aborts one
    /// session because of another's failure, so this only ever waits on
    /// sessions draining on their own terms (socket close, cancellation).
    pub async fn shutdown(&self) {
        info!("orchestrator shutdown requested, draining {} sessions", self.session_count().await);
        self.cancellation.cancel();
        for _ in 0..100 {
            if self.session_count().await == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        warn!("orchestrator shutdown timed out with {} sessions still live", self.session_count().await);
    }

    /// Polls the upstream template source on an interval, feeding every
    /// template it returns into the job registry. This is the *only*
    /// coupling between the template source and sessions (spec.md §4.5).
    pub async fn run_template_poller(self: Arc<Self>) {
        let mut interval = tokio::time::interval(TEMPLATE_POLL_INTERVAL);
        loop {
            tokio::select! {
                _ = self.cancellation.cancelled() => return,
                _ = interval.tick() => {}
            }
            match self.template_poller.poll_template().await {
                Ok(Some(template)) => {
                    let entry = self.job_registry.on_new_template(template);
                    info!("published job {} (clean_jobs={})", entry.job_id, entry.clean_jobs);
                }
                Ok(None) => {}
                Err(e) => warn!("template poll failed: {}", e),
            }
        }
    }

    /// Closes any session whose last accepted share is older than the
    /// configured idle timeout. No-op if `idle_timeout_secs` is `None`.
    pub async fn run_idle_watchdog(self: Arc<Self>) {
        let Some(timeout) = self.config.idle_timeout_secs else { return };
        let mut interval = tokio::time::interval(IDLE_SWEEP_INTERVAL);
        loop {
            tokio::select! {
                _ = self.cancellation.cancelled() => return,
                _ = interval.tick() => {}
            }
            let live = self.live.lock().await;
            for (id, session) in live.iter() {
                if session.idle_seconds() > timeout {
                    debug!("closing idle session {}", id);
                    session.close();
                }
            }
        }
    }

    /// Binds `config.bind_addr`. Split out from [`Self::serve`] so callers
    /// (tests, in particular) can bind to an ephemeral port and learn the
    /// assigned address before the accept loop starts.
    pub async fn bind(&self) -> std::io::Result<TcpListener> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        info!("stratum server listening on {}", listener.local_addr()?);
        Ok(listener)
    }

    /// Accepts connections on `listener` until `shutdown()` is called.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> std::io::Result<()> {
        loop {
            tokio::select! {
                _ = self.cancellation.cancelled() => {
                    info!("accept loop stopping");
                    return Ok(());
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((socket, addr)) => self.clone().spawn_session(socket, addr),
                        Err(e) => error!("accept error: {}", e),
                    }
                }
            }
        }
    }

    /// Convenience: binds `config.bind_addr` and serves until `shutdown()`.
    pub async fn run(self: Arc<Self>) -> std::io::Result<()> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    fn spawn_session(self: Arc<Self>, socket: TcpStream, addr: SocketAddr) {
        let permit = match self.sessions.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                warn!("rejecting connection from {}: session limit reached", addr);
                return;
            }
        };

        let session_id = format!("s{}", self.next_session_id.fetch_add(1, Ordering::Relaxed));
        let mut extranonce1 = [0u8; 4];
        rand::thread_rng().fill_bytes(&mut extranonce1);

        let (writer_tx, mut writer_rx) = mpsc::channel::<String>(256);
        let deps = SessionDeps {
            job_registry: self.job_registry.clone(),
            client_store: self.client_store.clone(),
            statistics_store: self.statistics_store.clone(),
            block_store: self.block_store.clone(),
            address_settings_store: self.address_settings_store.clone(),
            bitcoin_rpc: self.bitcoin_rpc.clone(),
            network: self.config.network,
            dev_fee_address: self.config.dev_fee_address.clone(),
        };
        let session = Arc::new(SessionFSM::new(session_id.clone(), extranonce1, writer_tx, deps));
        info!("session {} ({}) connected, extranonce1={}", session_id, addr, hex::encode(extranonce1));

        let orchestrator = self.clone();
        let registered_session = session.clone();
        let registered_id = session_id.clone();
        tokio::spawn(async move {
            orchestrator.live.lock().await.insert(registered_id, registered_session);
        });

        let (read_half, mut write_half) = socket.into_split();

        tokio::spawn(async move {
            while let Some(line) = writer_rx.recv().await {
                if write_half.write_all(line.as_bytes()).await.is_err()
                    || write_half.write_all(b"\n").await.is_err()
                    || write_half.flush().await.is_err()
                {
                    break;
                }
            }
        });

        tokio::spawn(session.clone().run_job_feed(self.job_registry.subscribe()));
        tokio::spawn(session.clone().run_vardiff_tick());

        let reader_session = session.clone();
        let reader_cancellation = self.cancellation.clone();
        let cleanup_orchestrator = self.clone();
        let cleanup_id = session_id.clone();
        tokio::spawn(async move {
            let mut lines = FramedRead::new(read_half, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));
            loop {
                tokio::select! {
                    _ = reader_cancellation.cancelled() => break,
                    line = lines.next() => match line {
                        Some(Ok(line)) => {
                            if let Err(e) = reader_session.handle_line(&line).await {
                                warn!("session {} ({}): closing after error: {}", cleanup_id, addr, e);
                                break;
                            }
                        }
                        Some(Err(e)) => {
                            warn!("session {} ({}): transport error: {}", cleanup_id, addr, e);
                            break;
                        }
                        None => break,
                    },
                }
            }
            reader_session.close();
            cleanup_orchestrator.client_store.remove(&cleanup_id).await;
            cleanup_orchestrator.live.lock().await.remove(&cleanup_id);
            drop(permit);
            info!("session {} ({}) closed", cleanup_id, addr);
        });
    }
}
