//! Per-connection Stratum V1 state machine.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use btcpool_bitcoin::coinbase::subsidy_at_height;
use btcpool_bitcoin::{resolve_payout_script, MiningJob};
use log::{debug, info, warn};
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc};

use crate::collaborators::{
    AddressSettingsStore, BitcoinRpc, BlockStore, ClientRecord, ClientStore, FoundBlock, ShareSubmission,
    StatisticsStore,
};
use crate::error::error_codes;
use crate::job_registry::{JobEntry, JobRegistry};
use crate::messages::{Notification, Request, Response};
use crate::share_accounting::{Outcome, ShareAccounting, SubmissionKey};
use crate::vardiff::Vardiff;
use crate::Error;

const DEFAULT_SESSION_DIFFICULTY: f64 = 16384.0;
const CPUMINER_DIFFICULTY: f64 = 0.1;
const DEV_FEE_HASHRATE_THRESHOLD_HS: f64 = 50_000_000_000_000.0; // 50 TH/s
// Basis points (parts per 10,000, see btcpool_bitcoin::coinbase::BPS_TOTAL)
// so spec.md §6's 1.5% / 98.5% dev-fee split is representable exactly.
const DEV_FEE_BPS: u32 = 150;
const MINER_BPS: u32 = 9_850;
const FULL_BPS: u32 = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Greeting,
    Handshaking,
    Active,
    Closed,
}

#[derive(Debug, Clone)]
struct Handshake {
    subscribed: bool,
    user_agent: Option<String>,
    authorized: bool,
    address: Option<String>,
    worker: Option<String>,
    version_rolling_mask: u32,
    suggested_difficulty: Option<f64>,
    used_suggested_difficulty: bool,
}

impl Default for Handshake {
    fn default() -> Self {
        Self {
            subscribed: false,
            user_agent: None,
            authorized: false,
            address: None,
            worker: None,
            version_rolling_mask: 0,
            suggested_difficulty: None,
            used_suggested_difficulty: false,
        }
    }
}

struct Mutable {
    state: State,
    handshake: Handshake,
    session_difficulty: f64,
}

/// Dependencies a session needs beyond its own state: the shared job
/// registry and every external collaborator.
pub struct SessionDeps {
    pub job_registry: Arc<JobRegistry>,
    pub client_store: Arc<dyn ClientStore>,
    pub statistics_store: Arc<dyn StatisticsStore>,
    pub block_store: Arc<dyn BlockStore>,
    pub address_settings_store: Arc<dyn AddressSettingsStore>,
    pub bitcoin_rpc: Arc<dyn BitcoinRpc>,
    pub network: bitcoin::Network,
    pub dev_fee_address: Option<String>,
}

pub struct SessionFSM {
    pub session_id: String,
    pub extranonce1: [u8; 4],
    started_at: u32,
    mutable: Mutex<Mutable>,
    vardiff: Vardiff,
    share_accounting: ShareAccounting,
    jobs: Mutex<std::collections::HashMap<u64, MiningJob>>,
    writer: mpsc::Sender<String>,
    deps: SessionDeps,
    closed: AtomicU32,
    last_share_at: AtomicU32,
}

impl SessionFSM {
    pub fn new(session_id: String, extranonce1: [u8; 4], writer: mpsc::Sender<String>, deps: SessionDeps) -> Self {
        let started_at = btcpool_util::now_secs();
        Self {
            session_id,
            extranonce1,
            started_at,
            mutable: Mutex::new(Mutable {
                state: State::Greeting,
                handshake: Handshake::default(),
                session_difficulty: DEFAULT_SESSION_DIFFICULTY,
            }),
            vardiff: Vardiff::new(),
            share_accounting: ShareAccounting::new(),
            jobs: Mutex::new(std::collections::HashMap::new()),
            writer,
            deps,
            closed: AtomicU32::new(0),
            last_share_at: AtomicU32::new(started_at),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed) != 0
    }

    /// Seconds since the last accepted share (or since session start if none
    /// yet), for an orchestrator-level inactivity watchdog (§5).
    pub fn idle_seconds(&self) -> u32 {
        btcpool_util::now_secs().saturating_sub(self.last_share_at.load(Ordering::Relaxed))
    }

    fn mark_closed(&self) {
        self.closed.store(1, Ordering::Relaxed);
    }

    /// Closes the session: cancels its job-broadcast subscription and
    /// vardiff tick (both poll `is_closed()`) and stops further writes.
    /// Called by the orchestrator on socket EOF/error or on shutdown.
    pub fn close(&self) {
        self.mark_closed();
    }

    async fn write_line(&self, line: String) -> bool {
        self.writer.send(line).await.is_ok()
    }

    /// Handles one inbound line. Transport/parse failures are terminal for
    /// the caller to act on (it should close the socket); everything else
    /// is handled here without closing.
    pub async fn handle_line(&self, line: &str) -> Result<(), Error> {
        let request: Request = match serde_json::from_str(line) {
            Ok(r) => r,
            Err(e) => {
                warn!("session {}: malformed line, closing: {}", self.session_id, e);
                self.mark_closed();
                return Err(Error::Json(e));
            }
        };

        let id = request.id.clone().unwrap_or(Value::Null);
        match request.method.as_str() {
            "mining.configure" => self.handle_configure(id, request.params).await,
            "mining.subscribe" => self.handle_subscribe(id, request.params).await,
            "mining.authorize" => self.handle_authorize(id, request.params).await,
            "mining.suggest_difficulty" => self.handle_suggest_difficulty(id, request.params).await,
            "mining.submit" => self.handle_submit(id, request.params).await,
            other => {
                debug!("session {}: ignoring unknown method {}", self.session_id, other);
                Ok(())
            }
        }
    }

    async fn respond(&self, response: Response) -> Result<(), Error> {
        let line = response.to_line()?;
        if !self.write_line(line).await {
            self.mark_closed();
        }
        Ok(())
    }

    async fn handle_configure(&self, id: Value, params: Vec<Value>) -> Result<(), Error> {
        let mut mask = 0u32;
        if let Some(extensions) = params.get(1).and_then(|v| v.as_object()) {
            if let Some(mask_hex) = extensions.get("version-rolling.mask").and_then(|v| v.as_str()) {
                mask = u32::from_str_radix(mask_hex, 16).unwrap_or(0);
            }
        }
        {
            let mut m = self.mutable.lock().unwrap();
            m.handshake.version_rolling_mask = mask;
        }
        let result = json!({
            "version-rolling": true,
            "version-rolling.mask": format!("{:08x}", mask),
        });
        self.respond(Response::ok(id, result)).await
    }

    async fn handle_subscribe(&self, id: Value, params: Vec<Value>) -> Result<(), Error> {
        let user_agent = params.first().and_then(|v| v.as_str()).unwrap_or("unknown").to_string();
        {
            let mut m = self.mutable.lock().unwrap();
            m.handshake.subscribed = true;
            m.handshake.user_agent = Some(user_agent);
        }

        let extranonce1_hex = hex::encode(self.extranonce1);
        let result = json!([
            [["mining.set_difficulty", self.session_id], ["mining.notify", self.session_id]],
            extranonce1_hex,
            4,
        ]);
        self.respond(Response::ok(id, result)).await?;
        self.maybe_complete_handshake().await
    }

    async fn handle_authorize(&self, id: Value, params: Vec<Value>) -> Result<(), Error> {
        let username = match params.first().and_then(|v| v.as_str()) {
            Some(u) if !u.is_empty() => u,
            _ => {
                return self
                    .respond(Response::err(id, error_codes::OTHER_UNKNOWN, "missing worker.address"))
                    .await;
            }
        };
        let (address, worker) = match username.split_once('.') {
            Some((addr, worker)) => (addr.to_string(), worker.to_string()),
            None => (username.to_string(), "default".to_string()),
        };
        {
            let mut m = self.mutable.lock().unwrap();
            m.handshake.authorized = true;
            m.handshake.address = Some(address);
            m.handshake.worker = Some(worker);
        }
        self.respond(Response::ok(id, Value::Bool(true))).await?;
        self.maybe_complete_handshake().await
    }

    async fn handle_suggest_difficulty(&self, id: Value, params: Vec<Value>) -> Result<(), Error> {
        let already_used = self.mutable.lock().unwrap().handshake.used_suggested_difficulty;
        if already_used {
            // P6: one-shot latch, later calls are silently ignored (but we
            // must still answer the request).
            return self.respond(Response::ok(id, Value::Bool(true))).await;
        }
        let difficulty = params.first().and_then(|v| v.as_f64()).unwrap_or(DEFAULT_SESSION_DIFFICULTY);
        {
            let mut m = self.mutable.lock().unwrap();
            m.handshake.suggested_difficulty = Some(difficulty);
            m.handshake.used_suggested_difficulty = true;
            m.session_difficulty = difficulty;
        }
        self.respond(Response::ok(id, Value::Bool(true))).await?;
        self.push_set_difficulty(difficulty).await
    }

    /// Handshake completion rule (§4.8): once both subscription and
    /// authorization are present and the session isn't already active.
    async fn maybe_complete_handshake(&self) -> Result<(), Error> {
        let should_activate = {
            let m = self.mutable.lock().unwrap();
            m.state != State::Active && m.handshake.subscribed && m.handshake.authorized
        };
        if !should_activate {
            return Ok(());
        }

        let (user_agent, already_suggested, current_difficulty) = {
            let m = self.mutable.lock().unwrap();
            (
                m.handshake.user_agent.clone().unwrap_or_default(),
                m.handshake.used_suggested_difficulty,
                m.session_difficulty,
            )
        };

        let mut difficulty = current_difficulty;
        if user_agent == "cpuminer" {
            difficulty = CPUMINER_DIFFICULTY;
            let mut m = self.mutable.lock().unwrap();
            m.session_difficulty = difficulty;
        }

        if !already_suggested {
            self.push_set_difficulty(difficulty).await?;
        }

        let (address, worker) = {
            let m = self.mutable.lock().unwrap();
            (m.handshake.address.clone().unwrap_or_default(), m.handshake.worker.clone().unwrap_or_default())
        };
        self.deps
            .client_store
            .insert(ClientRecord {
                session_id: self.session_id.clone(),
                extranonce1: hex::encode(self.extranonce1),
                worker,
                address,
                user_agent,
                started_at: self.started_at,
            })
            .await;

        {
            let mut m = self.mutable.lock().unwrap();
            m.state = State::Active;
        }
        info!("session {}: handshake complete, now active", self.session_id);
        Ok(())
    }

    async fn push_set_difficulty(&self, difficulty: f64) -> Result<(), Error> {
        let line = Notification::set_difficulty(difficulty).to_line()?;
        if !self.write_line(line).await {
            self.mark_closed();
        }
        Ok(())
    }

    /// Submission processing (§4.8).
    async fn handle_submit(&self, id: Value, params: Vec<Value>) -> Result<(), Error> {
        if self.mutable.lock().unwrap().state != State::Active {
            return self.respond(Response::err(id, error_codes::NOT_SUBSCRIBED, "session not active")).await;
        }

        let job_id: u64 = match params.get(1).and_then(|v| v.as_str()).and_then(|s| s.parse().ok()) {
            Some(v) => v,
            None => {
                return self.respond(Response::err(id, error_codes::OTHER_UNKNOWN, "bad job id")).await;
            }
        };
        let extranonce2 = match params.get(2).and_then(|v| v.as_str()).and_then(|s| hex::decode(s).ok()) {
            Some(v) => v,
            None => {
                return self.respond(Response::err(id, error_codes::OTHER_UNKNOWN, "bad extranonce2")).await;
            }
        };
        let ntime = match params.get(3).and_then(|v| v.as_str()).and_then(|s| u32::from_str_radix(s, 16).ok()) {
            Some(v) => v,
            None => return self.respond(Response::err(id, error_codes::OTHER_UNKNOWN, "bad ntime")).await,
        };
        let nonce = match params.get(4).and_then(|v| v.as_str()).and_then(|s| u32::from_str_radix(s, 16).ok()) {
            Some(v) => v,
            None => return self.respond(Response::err(id, error_codes::OTHER_UNKNOWN, "bad nonce")).await,
        };
        let submitted_version_bits = params
            .get(5)
            .and_then(|v| v.as_str())
            .and_then(|s| u32::from_str_radix(s, 16).ok())
            .unwrap_or(0);

        let job = {
            let jobs = self.jobs.lock().unwrap();
            jobs.get(&job_id).cloned()
        };
        let job = match job {
            Some(j) => j,
            None => {
                return self.respond(Response::err(id, error_codes::JOB_NOT_FOUND, "unknown or stale job")).await;
            }
        };
        let registry_entry = self.deps.job_registry.get_job(job_id);

        let version_mask = self.mutable.lock().unwrap().handshake.version_rolling_mask;
        let (header, hash) =
            job.rebuild_header(version_mask, submitted_version_bits, &self.extranonce1, &extranonce2, ntime, nonce);
        let diff = btcpool_bitcoin::difficulty_from_hash(&hash);

        let session_difficulty = self.mutable.lock().unwrap().session_difficulty;
        if diff < session_difficulty {
            return self
                .respond(Response::err(id, error_codes::LOW_DIFFICULTY_SHARE, "share below session difficulty"))
                .await;
        }

        let key = SubmissionKey { job_id, extranonce2: extranonce2.clone(), ntime, nonce };
        if self.share_accounting.submit(key, diff) == Outcome::Duplicate {
            return self.respond(Response::err(id, error_codes::DUPLICATE_SHARE, "duplicate share")).await;
        }

        let (address, worker) = {
            let m = self.mutable.lock().unwrap();
            (m.handshake.address.clone().unwrap_or_default(), m.handshake.worker.clone().unwrap_or_default())
        };
        self.deps
            .statistics_store
            .add_submission(ShareSubmission {
                address: address.clone(),
                worker,
                session_id: self.session_id.clone(),
                hash,
                session_difficulty,
                timestamp: ntime,
            })
            .await;
        let now = btcpool_util::now_secs();
        self.vardiff.record_share(now);
        self.last_share_at.store(now, Ordering::Relaxed);

        if let Some(entry) = &registry_entry {
            // §4.1/§9: the block-found decision must be integer-exact
            // against the compact target, never the reportable f64 `diff`.
            if entry.template.hash_meets_target(&hash) {
                self.submit_found_block(entry, &header, &job, &self.extranonce1, &extranonce2).await;
            }
        }

        self.deps.client_store.update_best_difficulty(&self.session_id, self.share_accounting.best_difficulty()).await;
        self.deps.address_settings_store.update_best_difficulty(&address, self.share_accounting.best_difficulty()).await;

        self.respond(Response::ok(id, Value::Bool(true))).await
    }

    async fn submit_found_block(
        &self,
        entry: &Arc<JobEntry>,
        header: &[u8; 80],
        job: &MiningJob,
        extranonce1: &[u8],
        extranonce2: &[u8],
    ) {
        let coinbase = btcpool_bitcoin::coinbase::assemble(&job.coinb1, extranonce1, extranonce2, &job.coinb2);
        let mut block = Vec::with_capacity(header.len() + 64);
        block.extend_from_slice(header);
        compact_size(&mut block, entry.template.transactions.len() as u64 + 1);
        block.extend_from_slice(&coinbase);
        for tx in &entry.template.transactions {
            if let Ok(bytes) = hex::decode(&tx.hex) {
                block.extend_from_slice(&bytes);
            }
        }
        let block_hex = hex::encode(&block);

        match self.deps.bitcoin_rpc.submit_block(&block_hex).await {
            Ok(None) => {
                info!("session {}: block accepted at height {}", self.session_id, entry.template.height);
                let address = self.mutable.lock().unwrap().handshake.address.clone().unwrap_or_default();
                self.deps
                    .block_store
                    .save(FoundBlock {
                        height: entry.template.height,
                        hash: btcpool_bitcoin::sha256d(header),
                        address: address.clone(),
                        found_at: btcpool_util::now_secs(),
                    })
                    .await;
                self.deps.address_settings_store.reset_best_difficulty_and_shares(&address).await;
            }
            Ok(Some(reason)) => {
                warn!("session {}: block submission rejected: {}", self.session_id, reason);
            }
            Err(e) => {
                warn!("session {}: block submission error: {}", self.session_id, e);
            }
        }
    }

    /// Computes the payout split for the current submission and builds this
    /// session's own coinbase for `entry`, caching the resulting job for
    /// later header reconstruction.
    pub async fn adopt_job(&self, entry: Arc<JobEntry>) -> Result<(), Error> {
        let (address_str, _worker) = {
            let m = self.mutable.lock().unwrap();
            (m.handshake.address.clone(), m.handshake.worker.clone())
        };
        let Some(address_str) = address_str else {
            return Ok(()); // not authorized yet, nothing to push
        };

        let miner_script = resolve_payout_script(&address_str, self.deps.network)?;
        let hashrate = self.deps.statistics_store.hash_rate(&address_str).await;

        let payouts = match &self.deps.dev_fee_address {
            Some(dev_addr) if hashrate >= DEV_FEE_HASHRATE_THRESHOLD_HS && !dev_addr.is_empty() => {
                let dev_script = resolve_payout_script(dev_addr, self.deps.network)?;
                vec![(dev_script, DEV_FEE_BPS), (miner_script, MINER_BPS)]
            }
            _ => vec![(miner_script, FULL_BPS)],
        };

        let total_reward = subsidy_at_height(entry.template.height) + entry.template.total_fees();
        let job = MiningJob::from_template(entry.job_id, &entry.template, &payouts, total_reward, btcpool_util::now_secs())?;

        {
            let mut jobs = self.jobs.lock().unwrap();
            if entry.clean_jobs {
                jobs.clear();
            }
            jobs.insert(entry.job_id, job.clone());
        }

        let line = Notification::notify(&job.notify_params()).to_line()?;
        if !self.write_line(line).await {
            self.mark_closed();
        }
        Ok(())
    }

    /// Drives the subscription to the job registry for this session's
    /// lifetime; exits when the socket is closed or the channel lags out.
    pub async fn run_job_feed(self: Arc<Self>, mut rx: broadcast::Receiver<Arc<JobEntry>>) {
        loop {
            if self.is_closed() {
                return;
            }
            match rx.recv().await {
                Ok(entry) => {
                    if let Err(e) = self.adopt_job(entry).await {
                        warn!("session {}: failed to adopt job: {}", self.session_id, e);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!("session {}: job feed lagged, skipped {} updates", self.session_id, skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    }

    /// Background vardiff tick (every 60s): recompute the suggestion; on
    /// change, push `set_difficulty` then a `clean_jobs=true` notify so the
    /// miner adopts the new difficulty before submitting against stale jobs.
    pub async fn run_vardiff_tick(self: Arc<Self>) {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(60));
        loop {
            interval.tick().await;
            if self.is_closed() {
                return;
            }
            let (current, floor) = {
                let m = self.mutable.lock().unwrap();
                (m.session_difficulty, m.handshake.suggested_difficulty.unwrap_or(1.0))
            };
            if let Some(suggestion) = self.vardiff.suggest(current, floor) {
                if (suggestion - current).abs() > f64::EPSILON {
                    {
                        let mut m = self.mutable.lock().unwrap();
                        m.session_difficulty = suggestion;
                    }
                    if self.push_set_difficulty(suggestion).await.is_err() {
                        return;
                    }
                    if let Some(current) = self.deps.job_registry.current_entry() {
                        let forced =
                            Arc::new(JobEntry { job_id: current.job_id, template: current.template.clone(), clean_jobs: true });
                        if let Err(e) = self.adopt_job(forced).await {
                            warn!("session {}: failed to force clean job after vardiff change: {}", self.session_id, e);
                        }
                    }
                }
            }
        }
    }
}

fn compact_size(out: &mut Vec<u8>, n: u64) {
    if n < 0xfd {
        out.push(n as u8);
    } else if n <= 0xffff {
        out.push(0xfd);
        out.extend_from_slice(&(n as u16).to_le_bytes());
    } else if n <= 0xffff_ffff {
        out.push(0xfe);
        out.extend_from_slice(&(n as u32).to_le_bytes());
    } else {
        out.push(0xff);
        out.extend_from_slice(&n.to_le_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::AddressSettings;
    use async_trait::async_trait;
    use bitcoin::Network;
    use btcpool_bitcoin::Template;
    use std::collections::HashMap as StdHashMap;
    use tokio::sync::Mutex as AsyncMutex;

    #[derive(Default)]
    struct MockClientStore {
        inserted: AsyncMutex<Vec<String>>,
    }
    #[async_trait]
    impl ClientStore for MockClientStore {
        async fn insert(&self, client: ClientRecord) {
            self.inserted.lock().await.push(client.session_id);
        }
        async fn update_best_difficulty(&self, _session_id: &str, _difficulty: f64) {}
        async fn remove(&self, _session_id: &str) {}
    }

    #[derive(Default)]
    struct MockStatisticsStore {
        submissions: AsyncMutex<Vec<ShareSubmission>>,
    }
    #[async_trait]
    impl StatisticsStore for MockStatisticsStore {
        async fn add_submission(&self, submission: ShareSubmission) {
            self.submissions.lock().await.push(submission);
        }
        async fn hash_rate(&self, _address: &str) -> f64 {
            0.0
        }
    }

    #[derive(Default)]
    struct MockBlockStore {
        saved: AsyncMutex<Vec<FoundBlock>>,
    }
    #[async_trait]
    impl BlockStore for MockBlockStore {
        async fn save(&self, block: FoundBlock) {
            self.saved.lock().await.push(block);
        }
    }

    #[derive(Default)]
    struct MockAddressSettingsStore {
        settings: AsyncMutex<StdHashMap<String, AddressSettings>>,
    }
    #[async_trait]
    impl AddressSettingsStore for MockAddressSettingsStore {
        async fn get_settings(&self, address: &str) -> AddressSettings {
            self.settings.lock().await.get(address).cloned().unwrap_or_default()
        }
        async fn update_best_difficulty(&self, address: &str, difficulty: f64) {
            let mut settings = self.settings.lock().await;
            let entry = settings.entry(address.to_string()).or_default();
            if difficulty > entry.best_difficulty {
                entry.best_difficulty = difficulty;
            }
        }
        async fn reset_best_difficulty_and_shares(&self, address: &str) {
            self.settings.lock().await.remove(address);
        }
    }

    #[derive(Default)]
    struct MockBitcoinRpc {
        submitted: AsyncMutex<Vec<String>>,
    }
    #[async_trait]
    impl BitcoinRpc for MockBitcoinRpc {
        async fn submit_block(&self, block_hex: &str) -> Result<Option<String>, Error> {
            self.submitted.lock().await.push(block_hex.to_string());
            Ok(None)
        }
    }

    const TEST_WORKER_ADDRESS: &str = "1BvBMSEYstWetqTFn5Au4m4GFg7xJaNVN2";

    fn template_with_nbits(nbits: u32) -> Template {
        Template {
            id: 1,
            prev_hash: [0x42; 32],
            version: 0x2000_0000,
            nbits,
            height: 700_000,
            transactions: vec![],
            is_new_tip: true,
        }
    }

    struct Harness {
        session: Arc<SessionFSM>,
        rx: mpsc::Receiver<String>,
        registry: Arc<JobRegistry>,
        rpc: Arc<MockBitcoinRpc>,
        block_store: Arc<MockBlockStore>,
        job_id: u64,
    }

    /// Completes a handshake (subscribe + authorize) and adopts one job
    /// built from a template carrying `nbits`, returning everything a test
    /// needs to drive `mining.submit` and inspect the mock collaborators.
    async fn handshake(nbits: u32) -> Harness {
        let registry = Arc::new(JobRegistry::new());
        let rpc = Arc::new(MockBitcoinRpc::default());
        let block_store = Arc::new(MockBlockStore::default());
        let deps = SessionDeps {
            job_registry: registry.clone(),
            client_store: Arc::new(MockClientStore::default()),
            statistics_store: Arc::new(MockStatisticsStore::default()),
            block_store: block_store.clone(),
            address_settings_store: Arc::new(MockAddressSettingsStore::default()),
            bitcoin_rpc: rpc.clone(),
            network: Network::Bitcoin,
            dev_fee_address: None,
        };
        let (tx, rx) = mpsc::channel(256);
        let session = Arc::new(SessionFSM::new("s1".into(), [0xAA; 4], tx, deps));

        session.handle_line(r#"{"id":1,"method":"mining.subscribe","params":["test-miner"]}"#).await.unwrap();
        let authorize = format!(
            r#"{{"id":2,"method":"mining.authorize","params":["{}.worker1",""]}}"#,
            TEST_WORKER_ADDRESS
        );
        session.handle_line(&authorize).await.unwrap();

        let entry = registry.on_new_template(template_with_nbits(nbits));
        let job_id = entry.job_id;
        session.adopt_job(entry).await.unwrap();

        Harness { session, rx, registry, rpc, block_store, job_id }
    }

    /// Drains queued outbound lines until the JSON-RPC response to `id` is
    /// found (handshake/job-push notifications are skipped over).
    async fn await_response(rx: &mut mpsc::Receiver<String>, id: i64) -> Value {
        loop {
            let line = rx.recv().await.expect("session closed before responding");
            let value: Value = serde_json::from_str(&line).unwrap();
            if value.get("id").and_then(Value::as_i64) == Some(id) {
                return value;
            }
        }
    }

    fn submit_line(id: i64, job_id: u64, extranonce2_hex: &str, ntime: u32, nonce: u32) -> String {
        format!(
            r#"{{"id":{},"method":"mining.submit","params":["worker1","{}","{}","{:08x}","{:08x}"]}}"#,
            id, job_id, extranonce2_hex, ntime, nonce
        )
    }

    /// Searches a small nonce range for one whose header hash clears the
    /// template's compact target (the same integer-exact check production
    /// code uses). With the near-maximal target used by the block-found
    /// test below, roughly half of all nonces qualify, so exhausting this
    /// range without a hit is not a realistic outcome.
    fn find_qualifying_nonce(job: &MiningJob, extranonce1: &[u8; 4], template: &Template) -> u32 {
        for nonce in 0..256u32 {
            let (_, hash) = job.rebuild_header(0, 0, extranonce1, &[0u8; 4], job.ntime, nonce);
            if template.hash_meets_target(&hash) {
                return nonce;
            }
        }
        panic!("no qualifying nonce found in range; network target may be too strict for this test");
    }

    #[tokio::test]
    async fn low_difficulty_share_is_rejected() {
        // Scenario 3: default session_difficulty (16384) is unreachable by
        // any single nonce against the real genesis-era network target.
        let mut harness = handshake(0x1d00ffff).await;
        let submit = submit_line(10, harness.job_id, "00000000", 0, 0);
        harness.session.handle_line(&submit).await.unwrap();

        let response = await_response(&mut harness.rx, 10).await;
        assert_eq!(response["error"][0], error_codes::LOW_DIFFICULTY_SHARE);
        assert_eq!(response["error"][0], 23);
    }

    #[tokio::test]
    async fn stale_job_id_is_reported_as_job_not_found() {
        // Scenario 6: a job id the session never adopted (e.g. evicted by a
        // clean_jobs push) is rejected without closing the session.
        let mut harness = handshake(0x1d00ffff).await;
        let submit = submit_line(11, harness.job_id + 999, "00000000", 0, 0);
        harness.session.handle_line(&submit).await.unwrap();

        let response = await_response(&mut harness.rx, 11).await;
        assert_eq!(response["error"][0], error_codes::JOB_NOT_FOUND);
        assert!(!harness.session.is_closed());
    }

    #[tokio::test]
    async fn accepted_share_below_network_difficulty_is_not_a_block() {
        // Scenario 4: a session difficulty floor below every possible
        // hash's difficulty (DIFF1 / (2^256 - 1), the mathematical minimum)
        // guarantees acceptance regardless of which nonce lands; the real
        // genesis-era network target (difficulty 1) makes a same-nonce block
        // hit astronomically unlikely, so this is a deterministic "accepted,
        // not a block" test rather than a probabilistic one.
        let mut harness = handshake(0x1d00ffff).await;
        harness
            .session
            .handle_line(r#"{"id":5,"method":"mining.suggest_difficulty","params":[0.00000000001]}"#)
            .await
            .unwrap();
        let _ = await_response(&mut harness.rx, 5).await;

        let submit = submit_line(12, harness.job_id, "00000000", 0, 7);
        harness.session.handle_line(&submit).await.unwrap();

        let response = await_response(&mut harness.rx, 12).await;
        assert_eq!(response["result"], Value::Bool(true));
        assert!(harness.rpc.submitted.lock().await.is_empty());
        assert!(harness.block_store.saved.lock().await.is_empty());
    }

    #[tokio::test]
    async fn duplicate_submission_of_the_same_tuple_is_rejected() {
        // P4: the exact (job_id, extranonce2, ntime, nonce) tuple accepted
        // once is rejected as a duplicate on a second submission.
        let mut harness = handshake(0x1d00ffff).await;
        harness
            .session
            .handle_line(r#"{"id":5,"method":"mining.suggest_difficulty","params":[0.00000000001]}"#)
            .await
            .unwrap();
        let _ = await_response(&mut harness.rx, 5).await;

        let submit = submit_line(13, harness.job_id, "00000000", 0, 7);
        harness.session.handle_line(&submit).await.unwrap();
        let first = await_response(&mut harness.rx, 13).await;
        assert_eq!(first["result"], Value::Bool(true));

        harness.session.handle_line(&submit).await.unwrap();
        let second = await_response(&mut harness.rx, 13).await;
        assert_eq!(second["error"][0], error_codes::DUPLICATE_SHARE);
    }

    #[tokio::test]
    async fn one_shot_suggest_difficulty_ignores_later_calls() {
        // P6: only the first mining.suggest_difficulty mutates state.
        let mut harness = handshake(0x1d00ffff).await;
        harness
            .session
            .handle_line(r#"{"id":5,"method":"mining.suggest_difficulty","params":[2048.0]}"#)
            .await
            .unwrap();
        let first = await_response(&mut harness.rx, 5).await;
        assert_eq!(first["result"], Value::Bool(true));

        harness
            .session
            .handle_line(r#"{"id":6,"method":"mining.suggest_difficulty","params":[512.0]}"#)
            .await
            .unwrap();
        let second = await_response(&mut harness.rx, 6).await;
        assert_eq!(second["result"], Value::Bool(true));

        // The later call is acknowledged but does not change the session
        // difficulty: a share that clears 2048 but not 512 would prove
        // the first value stuck, but we only have the handshake field
        // to check directly here since difficulty isn't otherwise exposed.
        assert_eq!(harness.session.mutable.lock().unwrap().session_difficulty, 2048.0);
    }

    #[tokio::test]
    async fn block_found_submits_to_rpc_and_persists() {
        // Scenario 5: a network target wide enough that roughly half of all
        // nonces qualify (the widest target representable in the compact
        // encoding without overflowing the 256-bit container) lets the test
        // find a genuine winning nonce by brute force rather than asserting
        // on a value computed outside the real hash pipeline.
        let wide_target_nbits = (0x20u32 << 24) | 0x7f_ffff;
        let mut harness = handshake(wide_target_nbits).await;
        harness
            .session
            .handle_line(r#"{"id":5,"method":"mining.suggest_difficulty","params":[0.00000000001]}"#)
            .await
            .unwrap();
        let _ = await_response(&mut harness.rx, 5).await;

        let template = harness.registry.current_template().unwrap();
        let job = harness.session.jobs.lock().unwrap().get(&harness.job_id).cloned().unwrap();
        let nonce = find_qualifying_nonce(&job, &harness.session.extranonce1, &template);

        let submit = submit_line(14, harness.job_id, "00000000", job.ntime, nonce);
        harness.session.handle_line(&submit).await.unwrap();

        let response = await_response(&mut harness.rx, 14).await;
        assert_eq!(response["result"], Value::Bool(true));
        assert_eq!(harness.rpc.submitted.lock().await.len(), 1);
        let saved = harness.block_store.saved.lock().await;
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].height, 700_000);
    }
}
