//! In-memory reference implementations of the engine's external collaborator
//! traits. Suitable for standalone operation and tests; a production
//! deployment wires in durable stores instead.

use std::collections::HashMap;

use async_trait::async_trait;
use btcpool_stratum::collaborators::{
    AddressSettings, AddressSettingsStore, BitcoinRpc, BlockStore, ClientRecord, ClientStore, FoundBlock,
    ShareSubmission, StatisticsStore,
};
use btcpool_stratum::Error;
use tokio::sync::RwLock;

#[derive(Default)]
pub struct MemoryClientStore {
    clients: RwLock<HashMap<String, ClientRecord>>,
    best_difficulty: RwLock<HashMap<String, f64>>,
}

impl MemoryClientStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ClientStore for MemoryClientStore {
    async fn insert(&self, client: ClientRecord) {
        self.clients.write().await.insert(client.session_id.clone(), client);
    }

    async fn update_best_difficulty(&self, session_id: &str, difficulty: f64) {
        self.best_difficulty.write().await.insert(session_id.to_string(), difficulty);
    }

    async fn remove(&self, session_id: &str) {
        self.clients.write().await.remove(session_id);
        self.best_difficulty.write().await.remove(session_id);
    }
}

#[derive(Default)]
pub struct MemoryStatisticsStore {
    submissions: RwLock<Vec<ShareSubmission>>,
    hash_rate_by_address: RwLock<HashMap<String, f64>>,
}

impl MemoryStatisticsStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds a reported hash rate for `address`, used by the payout-split
    /// decision at job-push time. A real deployment derives this from
    /// recent share cadence instead of setting it directly.
    pub async fn set_hash_rate(&self, address: &str, hash_rate: f64) {
        self.hash_rate_by_address.write().await.insert(address.to_string(), hash_rate);
    }
}

#[async_trait]
impl StatisticsStore for MemoryStatisticsStore {
    async fn add_submission(&self, submission: ShareSubmission) {
        self.submissions.write().await.push(submission);
    }

    async fn hash_rate(&self, address: &str) -> f64 {
        *self.hash_rate_by_address.read().await.get(address).unwrap_or(&0.0)
    }
}

#[derive(Default)]
pub struct MemoryBlockStore {
    blocks: RwLock<Vec<FoundBlock>>,
}

impl MemoryBlockStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn all(&self) -> Vec<FoundBlock> {
        self.blocks.read().await.clone()
    }
}

#[async_trait]
impl BlockStore for MemoryBlockStore {
    async fn save(&self, block: FoundBlock) {
        self.blocks.write().await.push(block);
    }
}

#[derive(Default)]
pub struct MemoryAddressSettingsStore {
    settings: RwLock<HashMap<String, AddressSettings>>,
}

impl MemoryAddressSettingsStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AddressSettingsStore for MemoryAddressSettingsStore {
    async fn get_settings(&self, address: &str) -> AddressSettings {
        self.settings.read().await.get(address).cloned().unwrap_or_default()
    }

    async fn update_best_difficulty(&self, address: &str, difficulty: f64) {
        let mut settings = self.settings.write().await;
        let entry = settings.entry(address.to_string()).or_default();
        if difficulty > entry.best_difficulty {
            entry.best_difficulty = difficulty;
        }
        entry.share_count += 1;
    }

    async fn reset_best_difficulty_and_shares(&self, address: &str) {
        self.settings.write().await.insert(address.to_string(), AddressSettings::default());
    }
}

/// A `BitcoinRpc` that never finds a block — useful for standalone
/// operation without a configured node, and for tests that don't exercise
/// the submit-block path.
#[derive(Default)]
pub struct RejectingBitcoinRpc;

#[async_trait]
impl BitcoinRpc for RejectingBitcoinRpc {
    async fn submit_block(&self, _block_hex: &str) -> Result<Option<String>, Error> {
        Ok(Some("no bitcoin node configured".to_string()))
    }
}

/// `BitcoinRpc` backed by a real node's JSON-RPC `submitblock` method.
pub struct HttpBitcoinRpc {
    client: reqwest::Client,
    url: String,
    user: String,
    password: String,
}

impl HttpBitcoinRpc {
    pub fn new(url: String, user: String, password: String) -> Self {
        Self { client: reqwest::Client::new(), url, user, password }
    }
}

#[async_trait]
impl BitcoinRpc for HttpBitcoinRpc {
    async fn submit_block(&self, block_hex: &str) -> Result<Option<String>, Error> {
        let body = serde_json::json!({
            "jsonrpc": "1.0",
            "id": "btcpool",
            "method": "submitblock",
            "params": [block_hex],
        });
        let response = self
            .client
            .post(&self.url)
            .basic_auth(&self.user, Some(&self.password))
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::MalformedRequest(e.to_string()))?;
        let value: serde_json::Value =
            response.json().await.map_err(|e| Error::MalformedRequest(e.to_string()))?;
        Ok(value.get("result").and_then(|r| r.as_str()).map(|s| s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn client_store_tracks_best_difficulty() {
        let store = MemoryClientStore::new();
        store
            .insert(ClientRecord {
                session_id: "s1".into(),
                extranonce1: "aabbccdd".into(),
                worker: "w1".into(),
                address: "addr1".into(),
                user_agent: "cgminer".into(),
                started_at: 0,
            })
            .await;
        store.update_best_difficulty("s1", 2048.0).await;
        store.remove("s1").await;
    }

    #[tokio::test]
    async fn address_settings_reset_clears_state() {
        let store = MemoryAddressSettingsStore::new();
        store.update_best_difficulty("addr1", 1000.0).await;
        assert_eq!(store.get_settings("addr1").await.best_difficulty, 1000.0);
        store.reset_best_difficulty_and_shares("addr1").await;
        assert_eq!(store.get_settings("addr1").await.best_difficulty, 0.0);
    }

    #[tokio::test]
    async fn rejecting_rpc_always_declines() {
        let rpc = RejectingBitcoinRpc;
        let result = rpc.submit_block("00").await.unwrap();
        assert!(result.is_some());
    }
}
