//! Merkle branch computation and folding, Bitcoin convention (duplicate the
//! last element of an odd-length level before pairing).

use crate::hashcodec::sha256d;

fn concat_hash(a: &[u8; 32], b: &[u8; 32]) -> [u8; 32] {
    let mut buf = [0u8; 64];
    buf[..32].copy_from_slice(a);
    buf[32..].copy_from_slice(b);
    sha256d(&buf)
}

/// Computes the merkle branch for the transaction at index 0 (the coinbase)
/// against the given ordered list of txids. Returns the sibling hash at each
/// level, bottom to top; length is `ceil(log2(txids.len()))`.
pub fn merkle_branch(txids: &[[u8; 32]]) -> Vec<[u8; 32]> {
    let mut branch = Vec::new();
    if txids.len() <= 1 {
        return branch;
    }

    let mut level = txids.to_vec();
    let mut index = 0usize;
    while level.len() > 1 {
        if level.len() % 2 == 1 {
            let last = *level.last().unwrap();
            level.push(last);
        }
        let sibling = if index % 2 == 0 { index + 1 } else { index - 1 };
        branch.push(level[sibling]);

        let mut next = Vec::with_capacity(level.len() / 2);
        for pair in level.chunks_exact(2) {
            next.push(concat_hash(&pair[0], &pair[1]));
        }
        level = next;
        index /= 2;
    }
    branch
}

/// Folds a merkle branch onto a leaf (the coinbase txid) to recover the
/// merkle root, per Stratum's `mining.notify` convention.
pub fn fold_branch(leaf: [u8; 32], branch: &[[u8; 32]]) -> [u8; 32] {
    branch.iter().fold(leaf, |acc, sibling| concat_hash(&acc, sibling))
}
