//! Invertible PRF used as the per-block hint assignment oracle.
//!
//! `Iprf` maps a hint index in `[0, n)` to an offset in `[0, m)` and can list
//! every hint that lands on a given offset. It is the composition of
//!
//! 1. a small-domain PRP over `[0, n)` (balanced Feistel network with an
//!    AES-128 round function, cycle-walked back into the domain), and
//! 2. a pseudorandom multinomial sampler: balls `[0, n)` are dropped into a
//!    binary tree over bins `[0, m)`, and every internal node splits its balls
//!    with a derandomized binomial draw keyed on the node.
//!
//! Inverting the sampler only needs the walk down to one bin, which yields a
//! contiguous range of permuted balls; the PRP is then inverted per ball.

use crate::binomial::binomial_sample;
use aes::cipher::{generic_array::GenericArray, BlockEncrypt, KeyInit};
use aes::Aes128;
use sha2::{Digest, Sha256};

pub type PrfKey128 = [u8; 16];

const BLOCK_KEY_LABEL: &[u8] = b"hintpir_block_key";
const TAG_NODE: u8 = 0x01;
const TAG_FEISTEL: u8 = 0x02;
const FEISTEL_ROUNDS: u32 = 6;

/// Keyed per-block hint assignment: `forward(hint) -> offset` and
/// `inverse(offset) -> hints`. Implementations must be consistent:
/// `h ∈ inverse(o)` exactly when `forward(h) == o`.
pub trait HintOracle: Send + Sync {
    fn new(key: PrfKey128, hint_count: u64, block_size: u64) -> Self
    where
        Self: Sized;

    fn forward(&self, hint: u64) -> u64;

    /// All hints assigned to `offset`, in ascending order.
    fn inverse(&self, offset: u64) -> Vec<u64>;
}

/// Derive one oracle key per block from an epoch seed.
pub fn derive_block_keys(master_seed: &[u8; 32], num_blocks: usize) -> Vec<PrfKey128> {
    (0..num_blocks)
        .map(|block| {
            let mut hasher = Sha256::new();
            hasher.update(master_seed);
            hasher.update(BLOCK_KEY_LABEL);
            hasher.update((block as u64).to_le_bytes());
            let hash = hasher.finalize();
            let mut key = [0u8; 16];
            key.copy_from_slice(&hash[0..16]);
            key
        })
        .collect()
}

pub struct Iprf {
    cipher: Aes128,
    domain: u64,
    range: u64,
    half_bits: u32,
}

impl Iprf {
    pub fn domain(&self) -> u64 {
        self.domain
    }

    pub fn range(&self) -> u64 {
        self.range
    }

    /// AES of `(tag, a, b)` truncated to 64 bits.
    fn prf(&self, tag: u8, a: u32, b: u64) -> u64 {
        let mut input = [0u8; 16];
        input[0] = tag;
        input[4..8].copy_from_slice(&a.to_be_bytes());
        input[8..16].copy_from_slice(&b.to_be_bytes());
        let mut block = GenericArray::from(input);
        self.cipher.encrypt_block(&mut block);
        let mut out = [0u8; 8];
        out.copy_from_slice(&block[0..8]);
        u64::from_be_bytes(out)
    }

    fn feistel_encrypt(&self, x: u64) -> u64 {
        let mask = (1u64 << self.half_bits) - 1;
        let (mut left, mut right) = (x >> self.half_bits, x & mask);
        for round in 0..FEISTEL_ROUNDS {
            let f = self.prf(TAG_FEISTEL, round, right) & mask;
            (left, right) = (right, left ^ f);
        }
        (left << self.half_bits) | right
    }

    fn feistel_decrypt(&self, y: u64) -> u64 {
        let mask = (1u64 << self.half_bits) - 1;
        let (mut left, mut right) = (y >> self.half_bits, y & mask);
        for round in (0..FEISTEL_ROUNDS).rev() {
            let f = self.prf(TAG_FEISTEL, round, left) & mask;
            (left, right) = (right ^ f, left);
        }
        (left << self.half_bits) | right
    }

    /// PRP over `[0, domain)` by cycle walking the Feistel permutation.
    fn permute(&self, x: u64) -> u64 {
        if self.domain <= 1 {
            return x;
        }
        let mut y = self.feistel_encrypt(x);
        while y >= self.domain {
            y = self.feistel_encrypt(y);
        }
        y
    }

    fn unpermute(&self, y: u64) -> u64 {
        if self.domain <= 1 {
            return y;
        }
        let mut x = self.feistel_decrypt(y);
        while x >= self.domain {
            x = self.feistel_decrypt(x);
        }
        x
    }

    /// Balls sent left at the node covering bins `[low, high]`.
    fn left_count(&self, low: u64, high: u64, balls: u64) -> u64 {
        let mid = (low + high) / 2;
        let left_bins = mid - low + 1;
        let total_bins = high - low + 1;
        let coin = self.prf(TAG_NODE, low as u32, high);
        binomial_sample(balls, left_bins, total_bins, coin)
    }

    /// Follow one permuted ball down to its bin.
    fn trace_ball(&self, ball: u64) -> u64 {
        let (mut low, mut high) = (0u64, self.range - 1);
        let (mut start, mut count) = (0u64, self.domain);
        while low < high {
            let mid = (low + high) / 2;
            let left = self.left_count(low, high, count);
            if ball < start + left {
                high = mid;
                count = left;
            } else {
                low = mid + 1;
                start += left;
                count -= left;
            }
        }
        low
    }

    /// Follow one bin down the tree; returns the permuted ball range
    /// `[start, start + count)` that lands in it.
    fn trace_bin(&self, bin: u64) -> (u64, u64) {
        let (mut low, mut high) = (0u64, self.range - 1);
        let (mut start, mut count) = (0u64, self.domain);
        while low < high {
            let mid = (low + high) / 2;
            let left = self.left_count(low, high, count);
            if bin <= mid {
                high = mid;
                count = left;
            } else {
                low = mid + 1;
                start += left;
                count -= left;
            }
        }
        (start, count)
    }
}

impl HintOracle for Iprf {
    fn new(key: PrfKey128, hint_count: u64, block_size: u64) -> Self {
        let bits = if hint_count <= 1 {
            1
        } else {
            64 - (hint_count - 1).leading_zeros()
        };
        Self {
            cipher: Aes128::new(&GenericArray::from(key)),
            domain: hint_count,
            range: block_size.max(1),
            half_bits: bits.div_ceil(2).max(1),
        }
    }

    fn forward(&self, hint: u64) -> u64 {
        if hint >= self.domain {
            return 0;
        }
        self.trace_ball(self.permute(hint))
    }

    fn inverse(&self, offset: u64) -> Vec<u64> {
        if offset >= self.range {
            return Vec::new();
        }
        let (start, count) = self.trace_bin(offset);
        let mut hints: Vec<u64> = (start..start + count).map(|b| self.unpermute(b)).collect();
        hints.sort_unstable();
        hints
    }
}
