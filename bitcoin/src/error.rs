use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid payouts: {0}")]
    InvalidPayouts(String),

    #[error("invalid address for configured network: {0}")]
    InvalidAddress(String),

    #[error("malformed coinbase bytes: {0}")]
    MalformedCoinbase(String),
}
