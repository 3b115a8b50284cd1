//! External collaborator interfaces. The engine depends only on these
//! traits; concrete persistence, RPC transport, and notification fan-out are
//! injected by the orchestrator.

use async_trait::async_trait;

/// A registered client (session) record.
#[derive(Debug, Clone)]
pub struct ClientRecord {
    pub session_id: String,
    pub extranonce1: String,
    pub worker: String,
    pub address: String,
    pub user_agent: String,
    pub started_at: u32,
}

#[async_trait]
pub trait ClientStore: Send + Sync {
    async fn insert(&self, client: ClientRecord);
    async fn update_best_difficulty(&self, session_id: &str, difficulty: f64);
    async fn remove(&self, session_id: &str);
}

/// One accepted share, as forwarded to statistics tracking.
#[derive(Debug, Clone)]
pub struct ShareSubmission {
    pub address: String,
    pub worker: String,
    pub session_id: String,
    pub hash: [u8; 32],
    pub session_difficulty: f64,
    pub timestamp: u32,
}

#[async_trait]
pub trait StatisticsStore: Send + Sync {
    async fn add_submission(&self, submission: ShareSubmission);
    async fn hash_rate(&self, address: &str) -> f64;
}

/// A block this pool found, as persisted after acceptance by the node.
#[derive(Debug, Clone)]
pub struct FoundBlock {
    pub height: u64,
    pub hash: [u8; 32],
    pub address: String,
    pub found_at: u32,
}

#[async_trait]
pub trait BlockStore: Send + Sync {
    async fn save(&self, block: FoundBlock);
}

#[derive(Debug, Clone, Default)]
pub struct AddressSettings {
    pub best_difficulty: f64,
    pub share_count: u64,
}

#[async_trait]
pub trait AddressSettingsStore: Send + Sync {
    async fn get_settings(&self, address: &str) -> AddressSettings;
    async fn update_best_difficulty(&self, address: &str, difficulty: f64);
    async fn reset_best_difficulty_and_shares(&self, address: &str);
}

/// Outbound adapter to a Bitcoin node's JSON-RPC interface.
#[async_trait]
pub trait BitcoinRpc: Send + Sync {
    /// Submits a fully-assembled block. `Ok(None)` means the node accepted
    /// it; `Ok(Some(reason))` is a node-reported rejection.
    async fn submit_block(&self, block_hex: &str) -> Result<Option<String>, crate::Error>;
}

/// Upstream source of candidate block templates. The orchestrator polls this
/// on an interval and feeds whatever comes back into `JobRegistry::on_new_template`;
/// the engine itself never calls a node directly for template data.
#[async_trait]
pub trait TemplatePoller: Send + Sync {
    /// Fetches the current candidate template. `Ok(None)` means "unchanged
    /// since the last poll, nothing to publish" — the poller is responsible
    /// for deciding `is_new_tip` on the `Template` it does return.
    async fn poll_template(&self) -> Result<Option<btcpool_bitcoin::Template>, crate::Error>;
}
