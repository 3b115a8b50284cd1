use thiserror::Error;

/// Stratum V1 error codes used in JSON-RPC error responses (§6).
pub mod error_codes {
    pub const OTHER_UNKNOWN: i32 = 20;
    pub const JOB_NOT_FOUND: i32 = 21;
    pub const DUPLICATE_SHARE: i32 = 22;
    pub const LOW_DIFFICULTY_SHARE: i32 = 23;
    pub const UNAUTHORIZED: i32 = 24;
    pub const NOT_SUBSCRIBED: i32 = 25;
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed request: {0}")]
    MalformedRequest(String),

    #[error("bitcoin construction error: {0}")]
    Bitcoin(#[from] btcpool_bitcoin::Error),
}
