//! Wire-level Stratum V1 JSON-RPC shapes: one object per line, `\n`
//! terminated.

use btcpool_bitcoin::NotifyParams;
use serde::ser::SerializeSeq;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;

#[derive(Debug, Clone, Deserialize)]
pub struct Request {
    pub id: Option<Value>,
    pub method: String,
    #[serde(default)]
    pub params: Vec<Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Response {
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<StratumError>,
}

impl Response {
    pub fn ok(id: Value, result: Value) -> Self {
        Self { id, result: Some(result), error: None }
    }

    pub fn err(id: Value, code: i32, message: impl Into<String>) -> Self {
        Self {
            id,
            result: None,
            error: Some(StratumError { code, message: message.into(), data: None }),
        }
    }

    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Stratum encodes `error` as a 2- or 3-element array `[code, message, data?]`
/// rather than an object.
#[derive(Debug, Clone)]
pub struct StratumError {
    pub code: i32,
    pub message: String,
    pub data: Option<Value>,
}

impl Serialize for StratumError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let len = if self.data.is_some() { 3 } else { 2 };
        let mut seq = serializer.serialize_seq(Some(len))?;
        seq.serialize_element(&self.code)?;
        seq.serialize_element(&self.message)?;
        if let Some(data) = &self.data {
            seq.serialize_element(data)?;
        }
        seq.end()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    pub id: Option<Value>,
    pub method: String,
    pub params: Value,
}

impl Notification {
    pub fn set_difficulty(difficulty: f64) -> Self {
        Self {
            id: None,
            method: "mining.set_difficulty".into(),
            params: serde_json::json!([difficulty]),
        }
    }

    pub fn notify(params: &NotifyParams) -> Self {
        Self {
            id: None,
            method: "mining.notify".into(),
            params: serde_json::json!([
                params.job_id.to_string(),
                params.prev_hash_hex,
                params.coinb1_hex,
                params.coinb2_hex,
                params.merkle_branch_hex,
                params.version_hex,
                params.nbits_hex,
                params.ntime_hex,
                params.clean_jobs,
            ]),
        }
    }

    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
