//! Content hashing for KV blocks.
//!
//! Block `i` of a token sequence is identified by a hash chained over
//! its parent: `h(i) = blake3(h(i-1) || tokens[i*bs .. (i+1)*bs])`.
//! Chaining means a block hash identifies the entire prefix up to and
//! including that block, which is what makes prefix sharing sound: two
//! requests agree on block `i` iff they agree on every token before it.

use blis_core::TokenId;

/// 64-bit content hash of one full block (first 8 bytes of blake3).
pub type BlockHash = u64;

const ROOT_PARENT: u64 = 0;

fn block_hash(parent: BlockHash, tokens: &[TokenId]) -> BlockHash {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&parent.to_le_bytes());
    for t in tokens {
        hasher.update(&t.to_le_bytes());
    }
    let digest = hasher.finalize();
    u64::from_le_bytes(digest.as_bytes()[..8].try_into().unwrap())
}

/// Hashes of every *full* block of `tokens`. A trailing partial block
/// has no stable identity and is never shared.
pub fn chain_hashes(tokens: &[TokenId], block_size: u32) -> Vec<BlockHash> {
    assert!(block_size > 0, "kv block size must be positive");
    let bs = block_size as usize;
    let full_blocks = tokens.len() / bs;
    let mut hashes = Vec::with_capacity(full_blocks);
    let mut parent = ROOT_PARENT;
    for i in 0..full_blocks {
        let h = block_hash(parent, &tokens[i * bs..(i + 1) * bs]);
        hashes.push(h);
        parent = h;
    }
    hashes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_prefix_shares_hashes() {
        let a = [1, 2, 3, 4, 5, 6, 7, 8];
        let b = [1, 2, 3, 4, 9, 9, 9, 9];
        let ha = chain_hashes(&a, 4);
        let hb = chain_hashes(&b, 4);
        assert_eq!(ha.len(), 2);
        assert_eq!(ha[0], hb[0]);
        assert_ne!(ha[1], hb[1]);
    }

    #[test]
    fn chaining_separates_equal_blocks_at_different_depths() {
        // Same token content in block 0 and block 1 must not collide.
        let tokens = [5, 5, 5, 5, 5, 5, 5, 5];
        let h = chain_hashes(&tokens, 4);
        assert_ne!(h[0], h[1]);
    }

    #[test]
    fn partial_tail_is_excluded() {
        let tokens = [1, 2, 3, 4, 5, 6];
        assert_eq!(chain_hashes(&tokens, 4).len(), 1);
        assert_eq!(chain_hashes(&tokens[..3], 4).len(), 0);
    }

    #[test]
    fn deterministic() {
        let tokens: Vec<u32> = (0..64).collect();
        assert_eq!(chain_hashes(&tokens, 8), chain_hashes(&tokens, 8));
    }
}
