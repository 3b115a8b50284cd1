//! Concrete `TemplatePoller` implementations.
//!
//! The engine never calls a Bitcoin node for template data directly — the
//! orchestrator polls a `TemplatePoller` on an interval and feeds whatever
//! comes back into the `JobRegistry`. This keeps the node round-trip (and
//! its retry/timeout policy) entirely outside the session state machine.

use std::sync::Mutex;

use async_trait::async_trait;
use btcpool_bitcoin::job::TxEntry;
use btcpool_bitcoin::Template;
use btcpool_stratum::collaborators::TemplatePoller;
use btcpool_stratum::Error;

/// Polls a Bitcoin node's `getblocktemplate` over JSON-RPC, the same
/// transport `HttpBitcoinRpc` uses for `submitblock`.
pub struct HttpTemplatePoller {
    client: reqwest::Client,
    url: String,
    user: String,
    password: String,
    last_prev_hash: Mutex<Option<[u8; 32]>>,
}

impl HttpTemplatePoller {
    pub fn new(url: String, user: String, password: String) -> Self {
        Self { client: reqwest::Client::new(), url, user, password, last_prev_hash: Mutex::new(None) }
    }

    fn parse_hex32(s: &str) -> Option<[u8; 32]> {
        let bytes = hex::decode(s).ok()?;
        bytes.try_into().ok()
    }
}

#[async_trait]
impl TemplatePoller for HttpTemplatePoller {
    async fn poll_template(&self) -> Result<Option<Template>, Error> {
        let body = serde_json::json!({
            "jsonrpc": "1.0",
            "id": "btcpool",
            "method": "getblocktemplate",
            "params": [{"rules": ["segwit"]}],
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
        let result = value
            .get("result")
            .ok_or_else(|| Error::MalformedRequest("getblocktemplate response missing result".into()))?;

        let prev_hash_hex = result
            .get("previousblockhash")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::MalformedRequest("missing previousblockhash".into()))?;
        let prev_hash = Self::parse_hex32(prev_hash_hex)
            .ok_or_else(|| Error::MalformedRequest("malformed previousblockhash".into()))?;

        let version = result.get("version").and_then(|v| v.as_i64()).unwrap_or(0) as i32;
        let nbits_hex = result.get("bits").and_then(|v| v.as_str()).unwrap_or("0");
        let nbits = u32::from_str_radix(nbits_hex, 16).unwrap_or(0);
        let height = result.get("height").and_then(|v| v.as_u64()).unwrap_or(0);

        let transactions = result
            .get("transactions")
            .and_then(|v| v.as_array())
            .map(|txs| {
                txs.iter()
                    .filter_map(|tx| {
                        let txid = tx.get("txid").and_then(|v| v.as_str()).and_then(Self::parse_hex32)?;
                        let wtxid = tx
                            .get("hash")
                            .and_then(|v| v.as_str())
                            .and_then(Self::parse_hex32)
                            .unwrap_or(txid);
                        let fee = tx.get("fee").and_then(|v| v.as_u64()).unwrap_or(0);
                        let weight = tx.get("weight").and_then(|v| v.as_u64()).unwrap_or(0);
                        let hex = tx.get("data").and_then(|v| v.as_str())?.to_string();
                        Some(TxEntry { txid, wtxid, fee, weight, hex })
                    })
                    .collect()
            })
            .unwrap_or_default();

        let is_new_tip = {
            let mut last = self.last_prev_hash.lock().unwrap();
            let changed = *last != Some(prev_hash);
            *last = Some(prev_hash);
            changed
        };

        Ok(Some(Template { id: height, prev_hash, version, nbits, height, transactions, is_new_tip }))
    }
}

/// A fixed, never-changing template — for standalone operation without a
/// configured Bitcoin node and for integration tests that exercise the
/// session/job-push path without real network data.
pub struct StaticTemplatePoller {
    template: Template,
    served: Mutex<bool>,
}

impl StaticTemplatePoller {
    pub fn new(template: Template) -> Self {
        Self { template, served: Mutex::new(false) }
    }
}

#[async_trait]
impl TemplatePoller for StaticTemplatePoller {
    async fn poll_template(&self) -> Result<Option<Template>, Error> {
        let mut served = self.served.lock().unwrap();
        if *served {
            return Ok(None);
        }
        *served = true;
        Ok(Some(self.template.clone()))
    }
}
