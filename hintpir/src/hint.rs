//! Client-side hint pool.
//!
//! The pool holds `m1` primary hints followed by `m2` backup hints. Each hint
//! is the XOR parity of one record per block, at the offset the block's
//! oracle assigns to that hint. Backup hints are spread round-robin over the
//! blocks: backup ordinal `k` (hint `m1 + k`) has home block `k mod m̄` and
//! never accumulates that block. When a query in block `α` spends a hint,
//! the next backup homed at `α` is promoted: its parity already covers every
//! other block, and the queried index becomes its entry for block `α`.

use crate::error::{PirError, Result};
use crate::iprf::HintOracle;
use crate::messages::xor_into;
use crate::params::Params;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Hint {
    Primary {
        parity: Vec<u8>,
    },
    Backup {
        parity: Vec<u8>,
    },
    /// A backup bound to `extra`, the index it now covers in its home block.
    /// Until `amended`, `parity` leaves out the record at `extra`.
    Promoted {
        parity: Vec<u8>,
        extra: usize,
        amended: bool,
    },
    Spent,
}

impl Hint {
    /// Primary and promoted hints can answer a query.
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Primary { .. } | Self::Promoted { .. })
    }

    fn parity_mut(&mut self) -> Option<&mut Vec<u8>> {
        match self {
            Self::Primary { parity } | Self::Backup { parity } | Self::Promoted { parity, .. } => {
                Some(parity)
            }
            Self::Spent => None,
        }
    }
}

/// What a query needs from the hint it spent.
#[derive(Debug)]
pub struct SpentHint {
    pub hint: usize,
    pub parity: Vec<u8>,
    /// Extra index whose record still has to be XORed in.
    pub unamended_extra: Option<usize>,
}

pub struct HintPool {
    hints: Vec<Hint>,
    num_primary: usize,
    num_blocks: usize,
    /// Per home block, the next backup ordinal to promote.
    next_backup: Vec<usize>,
}

impl HintPool {
    pub fn new(params: &Params) -> Self {
        let zero = vec![0u8; params.entry_size];
        let mut hints = Vec::with_capacity(params.num_total_hints());
        hints.extend((0..params.num_primary_hints).map(|_| Hint::Primary {
            parity: zero.clone(),
        }));
        hints.extend((0..params.num_backup_hints).map(|_| Hint::Backup {
            parity: zero.clone(),
        }));
        Self {
            hints,
            num_primary: params.num_primary_hints,
            num_blocks: params.num_blocks,
            next_backup: (0..params.num_blocks).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.hints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hints.is_empty()
    }

    pub fn get(&self, hint: usize) -> Option<&Hint> {
        self.hints.get(hint)
    }

    #[inline]
    pub fn is_primary(&self, hint: usize) -> bool {
        hint < self.num_primary
    }

    /// Home block of a backup or promoted hint; `None` for primaries.
    ///
    /// Derived from the backup ordinal `hint - m1`, not from `hint` itself:
    /// `m1` is generally not a multiple of `m̄`.
    pub fn home_block(&self, hint: usize) -> Option<usize> {
        let ordinal = hint.checked_sub(self.num_primary)?;
        (hint < self.hints.len()).then_some(ordinal % self.num_blocks)
    }

    /// Whether the hint's parity includes the record at its oracle-assigned
    /// offset in `block`. Backups and promoted hints skip their home block;
    /// a promoted hint covers its extra index there instead.
    pub fn covers(&self, hint: usize, block: usize) -> bool {
        match self.hints.get(hint) {
            Some(Hint::Primary { .. }) => true,
            Some(Hint::Backup { .. } | Hint::Promoted { .. }) => {
                self.home_block(hint) != Some(block)
            }
            Some(Hint::Spent) | None => false,
        }
    }

    /// XOR `record` into `hint` if it covers `block`. Returns whether it did.
    pub fn fold(&mut self, hint: usize, block: usize, record: &[u8]) -> bool {
        if !self.covers(hint, block) {
            return false;
        }
        match self.hints[hint].parity_mut() {
            Some(parity) => {
                xor_into(parity, record);
                true
            }
            None => false,
        }
    }

    /// First live candidate that covers `block`.
    pub fn select(&self, candidates: &[u64], block: usize) -> Option<usize> {
        candidates
            .iter()
            .map(|&h| h as usize)
            .find(|&h| self.hints.get(h).is_some_and(Hint::is_live) && self.covers(h, block))
    }

    /// Offset the hint punctures in `block`.
    pub fn offset_in<O: HintOracle>(
        &self,
        hint: usize,
        block: usize,
        oracle: &O,
        params: &Params,
    ) -> usize {
        if let Some(Hint::Promoted { extra, .. }) = self.hints.get(hint) {
            if self.home_block(hint) == Some(block) {
                return params.offset_in_block(*extra);
            }
        }
        oracle.forward(hint as u64) as usize
    }

    /// Take a live hint out of the pool, leaving `Spent` behind.
    pub fn spend(&mut self, hint: usize) -> Option<SpentHint> {
        let slot = self.hints.get_mut(hint)?;
        if !slot.is_live() {
            return None;
        }
        match std::mem::replace(slot, Hint::Spent) {
            Hint::Primary { parity } => Some(SpentHint {
                hint,
                parity,
                unamended_extra: None,
            }),
            Hint::Promoted {
                parity,
                extra,
                amended,
            } => Some(SpentHint {
                hint,
                parity,
                unamended_extra: (!amended).then_some(extra),
            }),
            Hint::Backup { .. } | Hint::Spent => None,
        }
    }

    /// Promote the next unused backup homed at `block`, binding it to `extra`.
    pub fn promote(&mut self, block: usize, extra: usize) -> Result<usize> {
        let ordinal = self.next_backup[block];
        let hint = self.num_primary + ordinal;
        if hint >= self.hints.len() {
            return Err(PirError::abort(format!("no backup hint left for block {block}")));
        }
        let parity = match std::mem::replace(&mut self.hints[hint], Hint::Spent) {
            Hint::Backup { parity } => parity,
            other => {
                self.hints[hint] = other;
                return Err(PirError::abort(format!("hint {hint} is not an unused backup")));
            }
        };
        self.hints[hint] = Hint::Promoted {
            parity,
            extra,
            amended: false,
        };
        self.next_backup[block] += self.num_blocks;
        Ok(hint)
    }

    /// Fold a write to `extra` into the promoted hint bound to it.
    ///
    /// An unamended hint first absorbs `previous` (the value the client held
    /// for `extra` before the write), after which the delta applies as usual.
    pub fn apply_extra_delta(
        &mut self,
        hint: usize,
        extra: usize,
        previous: &[u8],
        delta: &[u8],
    ) -> bool {
        let Some(Hint::Promoted {
            parity,
            extra: bound,
            amended,
        }) = self.hints.get_mut(hint)
        else {
            return false;
        };
        if *bound != extra {
            return false;
        }
        if !*amended {
            xor_into(parity, previous);
            *amended = true;
        }
        xor_into(parity, delta);
        true
    }

    pub fn remaining_backups(&self) -> usize {
        self.hints[self.num_primary..]
            .iter()
            .filter(|h| matches!(h, Hint::Backup { .. }))
            .count()
    }

    pub fn live_hints(&self) -> usize {
        self.hints.iter().filter(|h| h.is_live()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 16 entries: w = 4, m̄ = 4, m1 = 5 * 4 = 20, m2 = 5 * 2 = 10.
    fn params() -> Params {
        Params::new(16, 4, Some(2))
            .and_then(|p| p.with_kappa(5))
            .unwrap()
    }

    #[test]
    fn layout_primary_then_backup() {
        let p = params();
        let pool = HintPool::new(&p);
        assert_eq!(pool.len(), p.num_total_hints());
        assert!(matches!(pool.get(0), Some(Hint::Primary { .. })));
        assert!(matches!(pool.get(p.num_primary_hints), Some(Hint::Backup { .. })));
        assert_eq!(pool.remaining_backups(), p.num_backup_hints);
        assert_eq!(pool.live_hints(), p.num_primary_hints);
    }

    #[test]
    fn backup_home_block_uses_backup_ordinal() {
        // m1 = 22 is not a multiple of m̄ = 4, so hint % m̄ would be off by two.
        let p = Params::new(16, 4, Some(3))
            .and_then(|p| p.with_kappa(5))
            .map(|mut p| {
                p.num_primary_hints = 22;
                p
            })
            .unwrap();
        let pool = HintPool::new(&p);
        assert_eq!(pool.home_block(0), None);
        assert_eq!(pool.home_block(21), None);
        for k in 0..p.num_backup_hints {
            let hint = p.num_primary_hints + k;
            assert_eq!(pool.home_block(hint), Some(k % p.num_blocks));
        }
        assert_ne!(pool.home_block(22), Some(22 % p.num_blocks));
        assert_eq!(pool.home_block(p.num_total_hints()), None);
    }

    #[test]
    fn backups_never_fold_their_home_block() {
        let p = params();
        let mut pool = HintPool::new(&p);
        let record = [0xffu8; 4];
        for hint in p.num_primary_hints..p.num_total_hints() {
            let home = pool.home_block(hint).unwrap();
            for block in 0..p.num_blocks {
                let folded = pool.fold(hint, block, &record);
                assert_eq!(folded, block != home, "hint {hint} block {block}");
            }
            let Some(Hint::Backup { parity }) = pool.get(hint) else {
                panic!("hint {hint} should still be a backup");
            };
            // Folded m̄ - 1 times; m̄ = 4 so the XOR count is odd.
            assert_eq!(parity, &vec![0xffu8; 4]);
        }
        // Primaries take every block.
        for block in 0..p.num_blocks {
            assert!(pool.fold(0, block, &record));
        }
    }

    #[test]
    fn spend_takes_only_live_hints() {
        let p = params();
        let mut pool = HintPool::new(&p);
        pool.fold(3, 0, &[1, 2, 3, 4]);
        let spent = pool.spend(3).unwrap();
        assert_eq!(spent.hint, 3);
        assert_eq!(spent.parity, vec![1, 2, 3, 4]);
        assert!(spent.unamended_extra.is_none());
        assert!(pool.spend(3).is_none());
        assert!(pool.spend(p.num_primary_hints).is_none(), "backups are not live");
        assert!(!pool.covers(3, 0));
        assert!(!pool.fold(3, 0, &[1, 1, 1, 1]));
    }

    #[test]
    fn select_skips_spent_backup_and_promoted_home() {
        let p = params();
        let mut pool = HintPool::new(&p);
        let backup = p.num_primary_hints + 1; // home block 1
        let candidates = [2u64, backup as u64];
        pool.spend(2);
        assert_eq!(pool.select(&candidates, 0), None, "backup is not live");

        let promoted = pool.promote(1, 5).unwrap();
        assert_eq!(promoted, backup);
        assert_eq!(pool.select(&candidates, 0), Some(backup));
        assert_eq!(pool.select(&candidates, 1), None, "promoted skips home block");
    }

    #[test]
    fn promotion_walks_backups_of_one_block() {
        let p = params();
        let mut pool = HintPool::new(&p);
        let per_block = p.num_backup_hints / p.num_blocks;
        for round in 0..per_block {
            let hint = pool.promote(2, 100 + round).unwrap();
            assert_eq!(hint, p.num_primary_hints + 2 + round * p.num_blocks);
            assert_eq!(pool.home_block(hint), Some(2));
            assert!(matches!(
                pool.get(hint),
                Some(Hint::Promoted { extra, amended: false, .. }) if *extra == 100 + round
            ));
        }
        assert!(matches!(pool.promote(2, 0), Err(PirError::Abort(_))));
        assert!(pool.promote(3, 0).is_ok(), "other blocks keep their backups");
    }

    #[test]
    fn promoted_offset_in_home_block_is_extra() {
        struct Fixed;
        impl HintOracle for Fixed {
            fn new(_: crate::iprf::PrfKey128, _: u64, _: u64) -> Self {
                Fixed
            }
            fn forward(&self, _: u64) -> u64 {
                3
            }
            fn inverse(&self, _: u64) -> Vec<u64> {
                Vec::new()
            }
        }
        let p = params();
        let mut pool = HintPool::new(&p);
        let hint = pool.promote(1, 6).unwrap(); // index 6 = block 1, offset 2
        assert_eq!(pool.offset_in(hint, 1, &Fixed, &p), 2);
        assert_eq!(pool.offset_in(hint, 0, &Fixed, &p), 3);
        assert_eq!(pool.offset_in(0, 1, &Fixed, &p), 3);
    }

    #[test]
    fn amend_flag_only_moves_forward() {
        let p = params();
        let mut pool = HintPool::new(&p);
        let hint = pool.promote(0, 1).unwrap();
        assert!(!pool.apply_extra_delta(hint, 2, &[0; 4], &[0; 4]), "wrong extra");
        assert!(pool.apply_extra_delta(hint, 1, &[0x10; 4], &[0x01; 4]));
        assert!(matches!(
            pool.get(hint),
            Some(Hint::Promoted { parity, amended: true, .. }) if parity == &vec![0x11u8; 4]
        ));
        // Already amended: only the delta is applied.
        assert!(pool.apply_extra_delta(hint, 1, &[0x10; 4], &[0x01; 4]));
        assert!(matches!(
            pool.get(hint),
            Some(Hint::Promoted { parity, amended: true, .. }) if parity == &vec![0x10u8; 4]
        ));
        let spent = pool.spend(hint).unwrap();
        assert!(spent.unamended_extra.is_none());
    }
}
