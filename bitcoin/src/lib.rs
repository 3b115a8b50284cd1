//! Bit-exact Bitcoin block construction and difficulty accounting.
//!
//! Covers hashing and 256-bit target arithmetic ([`hashcodec`]), merkle
//! branch computation ([`merkle`]), coinbase transaction assembly
//! ([`coinbase`]), and job/template state with 80-byte header reconstruction
//! ([`job`]).

pub mod coinbase;
mod error;
pub mod hashcodec;
pub mod job;
pub mod merkle;

pub use error::Error;
pub use hashcodec::{
    compact_target_to_u256, difficulty_from_hash, hash_meets_target, le256, network_difficulty, sha256d,
    u256_to_f64, DIFF1, U256,
};
pub use job::{MiningJob, NotifyParams, Template, TxEntry};

use bitcoin::{Address, Network, ScriptBuf};
use std::str::FromStr;

/// Resolves a payout address string into its `scriptPubKey`, validated
/// against `network`. Accepts any standard address type the `bitcoin` crate
/// recognizes (P2PKH, P2SH, P2WPKH, P2WSH, P2TR) — the Open Question left by
/// the original hand-built coinbase script is resolved by deferring entirely
/// to `bitcoin::Address`'s parsing and network check.
pub fn resolve_payout_script(address: &str, network: Network) -> Result<ScriptBuf, Error> {
    let unchecked = Address::from_str(address).map_err(|e| Error::InvalidAddress(e.to_string()))?;
    let checked = unchecked
        .require_network(network)
        .map_err(|e| Error::InvalidAddress(e.to_string()))?;
    Ok(checked.script_pubkey())
}
