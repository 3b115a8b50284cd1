//! Template ingestion and immutable per-job state, including 80-byte header
//! reconstruction from a miner's submission.

use crate::coinbase::{self, CoinbaseParts};
use crate::hashcodec::{self, network_difficulty, sha256d};
use crate::merkle::merkle_branch;
use crate::Error;
use bitcoin::ScriptBuf;

/// One transaction from an upstream block template.
#[derive(Debug, Clone)]
pub struct TxEntry {
    pub txid: [u8; 32],
    pub wtxid: [u8; 32],
    pub fee: u64,
    pub weight: u64,
    pub hex: String,
}

/// A candidate block template as published by the upstream node.
#[derive(Debug, Clone)]
pub struct Template {
    pub id: u64,
    pub prev_hash: [u8; 32],
    pub version: i32,
    pub nbits: u32,
    pub height: u64,
    pub transactions: Vec<TxEntry>,
    /// True when this template represents a new chain tip — jobs built from
    /// it carry `clean_jobs = true`.
    pub is_new_tip: bool,
}

impl Template {
    pub fn network_difficulty(&self) -> f64 {
        network_difficulty(self.nbits)
    }

    /// Integer-exact block-found check (§4.1/§9): whether `hash` clears
    /// this template's compact target. The only comparison allowed to
    /// decide whether a share is a block; `network_difficulty` above is
    /// reporting-only.
    pub fn hash_meets_target(&self, hash: &[u8; 32]) -> bool {
        hashcodec::hash_meets_target(hash, self.nbits)
    }

    /// Transaction ids in order, including a zero placeholder at index 0 for
    /// the coinbase (whose real txid is only known after extranonces are
    /// filled in at share time).
    fn txids_with_coinbase_placeholder(&self) -> Vec<[u8; 32]> {
        let mut txids = Vec::with_capacity(self.transactions.len() + 1);
        txids.push([0u8; 32]);
        txids.extend(self.transactions.iter().map(|t| t.txid));
        txids
    }

    /// Merkle branch from the coinbase leaf to the root. Depends only on the
    /// non-coinbase transactions, so it can be computed once per template
    /// and shared across every session's independently-built coinbase.
    pub fn merkle_branch(&self) -> Vec<[u8; 32]> {
        merkle_branch(&self.txids_with_coinbase_placeholder())
    }

    /// Total transaction fees available to the coinbase, in satoshis.
    pub fn total_fees(&self) -> u64 {
        self.transactions.iter().map(|t| t.fee).sum()
    }
}

/// Immutable per-job state. Constructed once from a [`Template`]; the header
/// is rebuilt fresh on every submission.
#[derive(Debug, Clone)]
pub struct MiningJob {
    pub job_id: u64,
    pub prev_hash: [u8; 32],
    pub coinb1: Vec<u8>,
    pub coinb2: Vec<u8>,
    pub merkle_branch: Vec<[u8; 32]>,
    pub version: u32,
    pub nbits: u32,
    pub ntime: u32,
    pub clean_jobs: bool,
    pub template_id: u64,
}

impl MiningJob {
    /// Builds a job from `template`, paying `payouts` split over
    /// `total_reward_satoshis` (subsidy + fees), with `ntime` fixed to the
    /// current time at construction.
    pub fn from_template(
        job_id: u64,
        template: &Template,
        payouts: &[(ScriptBuf, u32)],
        total_reward_satoshis: u64,
        ntime: u32,
    ) -> Result<Self, Error> {
        let CoinbaseParts { coinb1, coinb2 } =
            coinbase::build_coinbase(payouts, template.height, total_reward_satoshis)?;
        let merkle_branch = template.merkle_branch();

        Ok(Self {
            job_id,
            prev_hash: template.prev_hash,
            coinb1,
            coinb2,
            merkle_branch,
            version: template.version as u32,
            nbits: template.nbits,
            ntime,
            clean_jobs: template.is_new_tip,
            template_id: template.id,
        })
    }

    /// Rebuilds the 80-byte block header for a submission and returns it
    /// alongside its double-SHA256 hash, per §4.4:
    /// 1. `version' = (job.version & !mask) | (submitted_version_bits & mask)`
    /// 2. `coinbase = coinb1 ‖ extranonce1 ‖ extranonce2 ‖ coinb2`
    /// 3. `root = fold(sha256d(coinbase), merkle_branch)`
    /// 4. `header = version'(4 LE) ‖ prev_hash(32) ‖ root(32) ‖ ntime(4 LE) ‖ nbits(4 LE) ‖ nonce(4 LE)`
    pub fn rebuild_header(
        &self,
        version_rolling_mask: u32,
        submitted_version_bits: u32,
        extranonce1: &[u8],
        extranonce2: &[u8],
        ntime: u32,
        nonce: u32,
    ) -> ([u8; 80], [u8; 32]) {
        let version = (self.version & !version_rolling_mask) | (submitted_version_bits & version_rolling_mask);
        let coinbase = coinbase::assemble(&self.coinb1, extranonce1, extranonce2, &self.coinb2);
        let coinbase_txid = sha256d(&coinbase);
        let root = crate::merkle::fold_branch(coinbase_txid, &self.merkle_branch);

        let mut header = [0u8; 80];
        header[0..4].copy_from_slice(&version.to_le_bytes());
        header[4..36].copy_from_slice(&self.prev_hash);
        header[36..68].copy_from_slice(&root);
        header[68..72].copy_from_slice(&ntime.to_le_bytes());
        header[72..76].copy_from_slice(&self.nbits.to_le_bytes());
        header[76..80].copy_from_slice(&nonce.to_le_bytes());

        let hash = sha256d(&header);
        (header, hash)
    }

    /// The `mining.notify` parameter list: `[job_id, prev_hash_hex,
    /// coinb1_hex, coinb2_hex, merkle_branch_hex[], version_hex, nbits_hex,
    /// ntime_hex, clean_jobs]`.
    pub fn notify_params(&self) -> NotifyParams {
        NotifyParams {
            job_id: self.job_id,
            prev_hash_hex: hex::encode(self.prev_hash),
            coinb1_hex: hex::encode(&self.coinb1),
            coinb2_hex: hex::encode(&self.coinb2),
            merkle_branch_hex: self.merkle_branch.iter().map(hex::encode).collect(),
            version_hex: format!("{:08x}", self.version),
            nbits_hex: format!("{:08x}", self.nbits),
            ntime_hex: format!("{:08x}", self.ntime),
            clean_jobs: self.clean_jobs,
        }
    }
}

/// Wire-ready form of [`MiningJob::notify_params`].
#[derive(Debug, Clone, serde::Serialize)]
pub struct NotifyParams {
    pub job_id: u64,
    pub prev_hash_hex: String,
    pub coinb1_hex: String,
    pub coinb2_hex: String,
    pub merkle_branch_hex: Vec<String>,
    pub version_hex: String,
    pub nbits_hex: String,
    pub ntime_hex: String,
    pub clean_jobs: bool,
}
