//! Coinbase transaction construction, split around the extranonce region.

use bitcoin::ScriptBuf;

use crate::Error;

/// Bytes that sit between `coinb1` and `coinb2`: `extranonce1 ‖ extranonce2`.
pub const EXTRANONCE_WIDTH: usize = 8;

const COINBASE_TAG: &[u8] = b"/btcpool/";

/// The two halves of a coinbase transaction that sandwich the extranonce
/// region. `coinb1 ‖ extranonce1 ‖ extranonce2 ‖ coinb2` is a complete,
/// deserializable transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoinbaseParts {
    pub coinb1: Vec<u8>,
    pub coinb2: Vec<u8>,
}

/// Block subsidy at `height`, halving every 210,000 blocks.
pub fn subsidy_at_height(height: u64) -> u64 {
    let halvings = height / 210_000;
    if halvings >= 64 {
        0
    } else {
        5_000_000_000u64 >> halvings
    }
}

/// Encodes `n` as a Bitcoin script number: minimal-length little-endian
/// magnitude bytes, with a sign/terminator byte appended if the high bit of
/// the last magnitude byte would otherwise be mistaken for a sign bit. This
/// is the encoding BIP34 requires for the coinbase height push, and must not
/// be replaced by `OP_1..OP_16` short-opcode pushes (those aren't decodable
/// as a BIP34 height push).
fn script_num_bytes(n: u64) -> Vec<u8> {
    if n == 0 {
        return Vec::new();
    }
    let mut value = n;
    let mut out = Vec::new();
    while value != 0 {
        out.push((value & 0xff) as u8);
        value >>= 8;
    }
    if out.last().copied().unwrap_or(0) & 0x80 != 0 {
        out.push(0);
    }
    out
}

fn push_data(out: &mut Vec<u8>, data: &[u8]) {
    assert!(data.len() < 0x4c, "coinbase script pushes stay single-byte");
    out.push(data.len() as u8);
    out.extend_from_slice(data);
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

/// Basis points per whole (1 bp = 0.01%), the precision `split_reward`'s
/// percentages are expressed in — fine enough to represent spec.md §6's
/// 1.5% / 98.5% dev-fee split exactly, unlike whole-percent `u8`.
pub const BPS_TOTAL: u32 = 10_000;

/// Splits `total` into per-payout satoshi amounts by `bps` (basis points out
/// of [`BPS_TOTAL`]), floor division with the rounding residue absorbed by
/// the last payout (P7).
pub fn split_reward(total: u64, payouts: &[(ScriptBuf, u32)]) -> Result<Vec<(ScriptBuf, u64)>, Error> {
    if payouts.is_empty() {
        return Err(Error::InvalidPayouts("no payouts given".into()));
    }
    let bps_sum: u32 = payouts.iter().map(|(_, bps)| *bps).sum();
    if bps_sum != BPS_TOTAL {
        return Err(Error::InvalidPayouts(format!(
            "payout basis points sum to {bps_sum}, expected {BPS_TOTAL}"
        )));
    }

    let mut amounts = Vec::with_capacity(payouts.len());
    let mut distributed = 0u64;
    for (script, bps) in payouts {
        let amount = total * (*bps as u64) / BPS_TOTAL as u64;
        distributed += amount;
        amounts.push((script.clone(), amount));
    }
    if let Some(last) = amounts.last_mut() {
        last.1 += total - distributed;
    }
    Ok(amounts)
}

/// Builds a coinbase transaction for `height` paying `total_reward_satoshis`
/// (subsidy + fees) to `payouts`, split so that exactly [`EXTRANONCE_WIDTH`]
/// bytes of placeholder sit between the returned halves.
///
/// Produces `version=1`, a single null-previous-output input with
/// `sequence=0xffffffff`, `locktime=0`, and one output per payout using
/// whatever script each `ScriptBuf` carries (P2PKH / P2WPKH / P2TR, as
/// resolved by the caller from the configured address).
pub fn build_coinbase(
    payouts: &[(ScriptBuf, u32)],
    height: u64,
    total_reward_satoshis: u64,
) -> Result<CoinbaseParts, Error> {
    let outputs = split_reward(total_reward_satoshis, payouts)?;

    let mut coinb1 = Vec::new();
    // version
    coinb1.extend_from_slice(&1i32.to_le_bytes());
    // input count
    coinb1.push(1);
    // previous output: null txid + index 0xffffffff
    coinb1.extend_from_slice(&[0u8; 32]);
    coinb1.extend_from_slice(&0xffff_ffffu32.to_le_bytes());

    let height_push = script_num_bytes(height);
    let mut script_sig_prefix = Vec::new();
    push_data(&mut script_sig_prefix, &height_push);
    script_sig_prefix.extend_from_slice(COINBASE_TAG);

    let script_sig_len = script_sig_prefix.len() + EXTRANONCE_WIDTH;
    compact_size(&mut coinb1, script_sig_len as u64);
    coinb1.extend_from_slice(&script_sig_prefix);
    // coinb1 ends here; extranonce1 ‖ extranonce2 (EXTRANONCE_WIDTH bytes) follow on the wire.

    let mut coinb2 = Vec::new();
    // sequence
    coinb2.extend_from_slice(&0xffff_ffffu32.to_le_bytes());
    // output count
    compact_size(&mut coinb2, outputs.len() as u64);
    for (script, amount) in &outputs {
        coinb2.extend_from_slice(&amount.to_le_bytes());
        compact_size(&mut coinb2, script.len() as u64);
        coinb2.extend_from_slice(script.as_bytes());
    }
    // locktime
    coinb2.extend_from_slice(&0u32.to_le_bytes());

    Ok(CoinbaseParts { coinb1, coinb2 })
}

/// Assembles the full coinbase transaction bytes from the two halves and the
/// extranonce region, for txid computation and block serialization.
pub fn assemble(coinb1: &[u8], extranonce1: &[u8], extranonce2: &[u8], coinb2: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(coinb1.len() + extranonce1.len() + extranonce2.len() + coinb2.len());
    out.extend_from_slice(coinb1);
    out.extend_from_slice(extranonce1);
    out.extend_from_slice(extranonce2);
    out.extend_from_slice(coinb2);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::absolute::LockTime;
    use bitcoin::consensus::Decodable;
    use bitcoin::Transaction;

    fn dummy_script(tag: u8) -> ScriptBuf {
        ScriptBuf::from_bytes(vec![0x76, 0xa9, 0x14, tag, tag, tag, tag, 0x88, 0xac])
    }

    #[test]
    fn subsidy_schedule_matches_contract() {
        assert_eq!(subsidy_at_height(0), 50_0000_0000);
        assert_eq!(subsidy_at_height(209_999), 50_0000_0000);
        assert_eq!(subsidy_at_height(210_000), 25_0000_0000);
        assert_eq!(subsidy_at_height(420_000), 12_5000_0000);
        assert_eq!(subsidy_at_height(13_440_000), 0);
    }

    #[test]
    fn split_reward_residue_goes_to_last_output() {
        let payouts = vec![(dummy_script(1), 5_000u32), (dummy_script(2), 5_000u32)];
        let outs = split_reward(10, &payouts).unwrap();
        assert_eq!(outs[0].1 + outs[1].1, 10);
    }

    #[test]
    fn split_reward_rejects_bad_percentages() {
        let payouts = vec![(dummy_script(1), 5_000u32), (dummy_script(2), 4_000u32)];
        assert!(split_reward(10, &payouts).is_err());
    }

    #[test]
    fn split_reward_represents_the_dev_fee_split_exactly() {
        // spec.md §6: 1.5% dev fee / 98.5% miner — representable exactly in
        // basis points, unlike whole-percent `u8` (which could only round
        // to 2%/98%).
        let payouts = vec![(dummy_script(1), 150u32), (dummy_script(2), 9_850u32)];
        let outs = split_reward(1_000_000_000, &payouts).unwrap();
        assert_eq!(outs[0].1, 15_000_000);
        assert_eq!(outs[1].1, 985_000_000);
        assert_eq!(outs[0].1 + outs[1].1, 1_000_000_000);
    }

    #[test]
    fn coinbase_round_trips_as_valid_transaction() {
        let payouts = vec![(dummy_script(7), 10_000u32)];
        let parts = build_coinbase(&payouts, 700_000, 5_000_000_000).unwrap();
        let extranonce1 = [0xAAu8; 4];
        let extranonce2 = [0u8; 4];
        let full = assemble(&parts.coinb1, &extranonce1, &extranonce2, &parts.coinb2);

        let tx = Transaction::consensus_decode(&mut full.as_slice()).expect("valid transaction");
        assert_eq!(tx.input.len(), 1);
        assert_eq!(tx.output.len(), 1);
        assert_eq!(tx.lock_time, LockTime::ZERO);
        assert_eq!(tx.output[0].value.to_sat(), 5_000_000_000);
    }

    #[test]
    fn coinb1_ends_exactly_before_extranonce_region() {
        let payouts = vec![(dummy_script(3), 10_000u32)];
        let parts = build_coinbase(&payouts, 1, 0).unwrap();
        let extranonce1 = [0x11u8; 4];
        let extranonce2 = [0x22u8; 4];
        let full = assemble(&parts.coinb1, &extranonce1, &extranonce2, &parts.coinb2);
        assert_eq!(&full[parts.coinb1.len()..parts.coinb1.len() + 4], &extranonce1);
        assert_eq!(
            &full[parts.coinb1.len() + 4..parts.coinb1.len() + 8],
            &extranonce2
        );
        assert_eq!(&full[parts.coinb1.len() + 8..], &parts.coinb2[..]);
    }

    #[test]
    fn height_below_128_gets_terminator_byte_when_needed() {
        // Heights whose minimal-length byte has the high bit set need an
        // extra zero byte, matching Bitcoin Core's CScriptNum encoding.
        assert_eq!(script_num_bytes(128), vec![0x80, 0x00]);
        assert_eq!(script_num_bytes(127), vec![0x7f]);
    }
}
