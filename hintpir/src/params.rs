//! Block partition and hint-count derivation.
//!
//! Every value here is a pure function of the database size `N` (plus an
//! optional caller-chosen query budget). Client and server must derive them
//! from identical inputs; nothing on the wire checks that they agree.

use crate::error::{PirError, Result};
use serde::Serialize;

/// Statistical multiplier: primary hints per block offset.
pub const KAPPA: usize = 40;

/// Offsets travel as `u16`, so a block may hold at most this many records.
pub const MAX_BLOCK_SIZE: usize = 1 << 16;

/// Entries per block: `max(2, ceil(sqrt(N)))`.
pub fn block_size(num_entries: usize) -> usize {
    ceil_sqrt(num_entries as u64).max(2) as usize
}

/// Number of blocks: `max(2, ceil(N / w))`.
pub fn block_count(num_entries: usize) -> usize {
    num_entries.div_ceil(block_size(num_entries)).max(2)
}

/// Primary hints: `KAPPA * w`.
pub fn primary_hint_count(num_entries: usize) -> usize {
    KAPPA * block_size(num_entries)
}

/// Real queries served per epoch before a refresh.
///
/// Defaults to `ceil(sqrt(N) * ln N)` (`ceil(sqrt(N))` at `N = 1`). A caller
/// budget `q` only takes effect when it is smaller than the default.
pub fn query_budget(num_entries: usize, q: Option<usize>) -> usize {
    let default = default_query_budget(num_entries);
    match q {
        Some(q) if q < default => q,
        _ => default,
    }
}

/// Backup hints: `3 * Q`, or `KAPPA * q` when the caller lowered the budget.
pub fn backup_hint_count(num_entries: usize, q: Option<usize>) -> usize {
    backup_hints_with_kappa(num_entries, q, KAPPA)
}

fn backup_hints_with_kappa(num_entries: usize, q: Option<usize>, kappa: usize) -> usize {
    let default = default_query_budget(num_entries);
    match q {
        Some(q) if q < default => kappa * q,
        _ => 3 * default,
    }
}

fn default_query_budget(num_entries: usize) -> usize {
    if num_entries <= 1 {
        return ceil_sqrt(num_entries as u64).max(1) as usize;
    }
    let n = num_entries as f64;
    (n.sqrt() * n.ln()).ceil() as usize
}

/// Derived per-session parameters, identical on client and server.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Params {
    /// Real records `N`.
    pub num_entries: usize,
    /// Record length `L` in bytes.
    pub entry_size: usize,
    /// Entries per block `w`.
    pub block_size: usize,
    /// Blocks `m̄`.
    pub num_blocks: usize,
    pub kappa: usize,
    /// `m1`, hints `[0, m1)` of the pool.
    pub num_primary_hints: usize,
    /// `m2`, hints `[m1, m1 + m2)` of the pool.
    pub num_backup_hints: usize,
    /// `Q`, real queries per epoch.
    pub query_budget: usize,
    #[serde(skip)]
    requested_budget: Option<usize>,
}

impl Params {
    /// Derive parameters for `num_entries` records of `entry_size` bytes.
    pub fn new(num_entries: usize, entry_size: usize, q: Option<usize>) -> Result<Self> {
        Self::build(num_entries, entry_size, q, KAPPA)
    }

    /// Re-derive with a different statistical multiplier. Useful for small
    /// pools in tests and demos; both sides must use the same value.
    pub fn with_kappa(self, kappa: usize) -> Result<Self> {
        Self::build(
            self.num_entries,
            self.entry_size,
            self.requested_budget,
            kappa,
        )
    }

    fn build(num_entries: usize, entry_size: usize, q: Option<usize>, kappa: usize) -> Result<Self> {
        if num_entries == 0 {
            return Err(PirError::InvalidParams("num_entries must be > 0"));
        }
        if num_entries as u64 > u32::MAX as u64 {
            return Err(PirError::InvalidParams("num_entries must fit in u32"));
        }
        if entry_size == 0 {
            return Err(PirError::InvalidParams("entry_size must be > 0"));
        }
        if kappa == 0 {
            return Err(PirError::InvalidParams("kappa must be > 0"));
        }
        if q == Some(0) {
            return Err(PirError::InvalidParams("query budget must be > 0"));
        }

        let block_size = block_size(num_entries);
        if block_size > MAX_BLOCK_SIZE {
            return Err(PirError::InvalidParams("block_size exceeds u16 offsets"));
        }

        let num_primary_hints = kappa
            .checked_mul(block_size)
            .ok_or(PirError::InvalidParams("kappa * block_size overflow"))?;

        Ok(Self {
            num_entries,
            entry_size,
            block_size,
            num_blocks: block_count(num_entries),
            kappa,
            num_primary_hints,
            num_backup_hints: backup_hints_with_kappa(num_entries, q, kappa),
            query_budget: query_budget(num_entries, q),
            requested_budget: q,
        })
    }

    #[inline]
    pub fn num_total_hints(&self) -> usize {
        self.num_primary_hints + self.num_backup_hints
    }

    /// `w * m̄`, the database length after padding.
    #[inline]
    pub fn padded_entries(&self) -> usize {
        self.block_size * self.num_blocks
    }

    #[inline]
    pub fn block_of(&self, index: usize) -> usize {
        index / self.block_size
    }

    #[inline]
    pub fn offset_in_block(&self, index: usize) -> usize {
        index % self.block_size
    }

    #[inline]
    pub fn index_of(&self, block: usize, offset: usize) -> usize {
        block * self.block_size + offset
    }

    /// Bytes in one streamed preprocessing block.
    #[inline]
    pub fn block_bytes(&self) -> usize {
        self.block_size * self.entry_size
    }

    /// Bytes in a non-empty query: `m̄ - 1` little-endian `u16` offsets.
    #[inline]
    pub fn query_bytes(&self) -> usize {
        2 * (self.num_blocks - 1)
    }

    /// Bytes in a non-empty answer: `m̄` candidate parities.
    #[inline]
    pub fn answer_bytes(&self) -> usize {
        self.num_blocks * self.entry_size
    }

    /// Largest payload any message of this session carries.
    pub fn max_message_bytes(&self) -> usize {
        self.block_bytes()
            .max(self.answer_bytes())
            .max(self.query_bytes())
            .max(4 + self.entry_size)
    }

    pub fn check_index(&self, index: usize) -> Result<()> {
        if index >= self.num_entries {
            return Err(PirError::InvalidIndex {
                index,
                num_entries: self.num_entries,
            });
        }
        Ok(())
    }

    pub fn check_entry(&self, entry: &[u8]) -> Result<()> {
        if entry.len() != self.entry_size {
            return Err(PirError::InvalidEntry {
                expected: self.entry_size,
                got: entry.len(),
            });
        }
        Ok(())
    }
}

/// `ceil(sqrt(n))` in integer arithmetic.
fn ceil_sqrt(n: u64) -> u64 {
    let s = isqrt(n);
    if s * s < n {
        s + 1
    } else {
        s
    }
}

/// Integer square root: returns floor(sqrt(n)).
fn isqrt(n: u64) -> u64 {
    if n <= 1 {
        return n;
    }
    // Newton from above; 2^ceil(bits/2) >= sqrt(n).
    let bits = 64 - n.leading_zeros();
    let mut x = 1u64 << bits.div_ceil(2);
    loop {
        let y = (x + n / x) / 2;
        if y >= x {
            return x;
        }
        x = y;
    }
}
