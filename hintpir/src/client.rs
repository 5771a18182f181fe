//! Client side of a session.
//!
//! A `Client` owns one `EpochState` at a time: the per-block oracles, the hint
//! pool and the local cache, all built together by one preprocessing pass and
//! replaced together at the next. Queries run in two phases per index:
//! `resolve` spends a hint and reconstructs the record, then `replenish`
//! promotes a backup into the spent hint's place and caches the record.

use crate::channel::{Channel, Tag};
use crate::error::{PirError, Result};
use crate::hint::HintPool;
use crate::iprf::{derive_block_keys, HintOracle, Iprf};
use crate::messages::{decode_update, encode_offsets, encode_refresh, xor_into};
use crate::params::Params;
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;
use rayon::prelude::*;
use std::collections::HashMap;
use tracing::{debug, info};

#[derive(Clone, Debug)]
struct CacheEntry {
    value: Vec<u8>,
    /// Promoted hint whose extra index is this entry's index.
    promoted: Option<usize>,
}

struct EpochState<O> {
    oracles: Vec<O>,
    pool: HintPool,
    cache: HashMap<usize, CacheEntry>,
}

impl<O: HintOracle> EpochState<O> {
    /// Fold one streamed block into the pool. Offsets no primary hint covers
    /// are cached verbatim.
    fn fold_block(&mut self, params: &Params, block: usize, payload: &[u8]) {
        let oracle = &self.oracles[block];
        // Covering sets of distinct offsets are disjoint, so only the
        // inversions need the thread pool.
        let covering: Vec<Vec<u64>> = (0..params.block_size)
            .into_par_iter()
            .map(|offset| oracle.inverse(offset as u64))
            .collect();

        for (offset, hints) in covering.iter().enumerate() {
            let record = &payload[offset * params.entry_size..(offset + 1) * params.entry_size];
            let mut covered = false;
            for &hint in hints {
                let hint = hint as usize;
                if self.pool.fold(hint, block, record) && self.pool.is_primary(hint) {
                    covered = true;
                }
            }
            let index = params.index_of(block, offset);
            if !covered && index < params.num_entries {
                self.cache.insert(
                    index,
                    CacheEntry {
                        value: record.to_vec(),
                        promoted: None,
                    },
                );
            }
        }
    }

    /// Spend a hint on `index`, exchange the punctured query, and recover
    /// the record.
    fn resolve<C: Channel>(&mut self, params: &Params, chan: &mut C, index: usize) -> Result<Vec<u8>> {
        let block = params.block_of(index);
        let offset = params.offset_in_block(index);

        let candidates = self.oracles[block].inverse(offset as u64);
        let hint = self
            .pool
            .select(&candidates, block)
            .ok_or_else(|| PirError::abort(format!("no live hint covers index {index}")))?;

        let offsets: Vec<usize> = (0..params.num_blocks)
            .filter(|&k| k != block)
            .map(|k| self.pool.offset_in(hint, k, &self.oracles[k], params))
            .collect();
        let spent = self
            .pool
            .spend(hint)
            .ok_or_else(|| PirError::abort(format!("hint {hint} vanished before spending")))?;

        chan.send(Tag::Query, encode_offsets(&offsets))?;
        let answer = chan.receive(Tag::Answer)?;
        if answer.len() != params.answer_bytes() {
            return Err(PirError::abort(format!(
                "answer length {} != {}",
                answer.len(),
                params.answer_bytes()
            )));
        }

        let start = block * params.entry_size;
        let mut value = answer[start..start + params.entry_size].to_vec();
        xor_into(&mut value, &spent.parity);
        if let Some(extra) = spent.unamended_extra {
            let entry = self.cache.get(&extra).ok_or_else(|| {
                PirError::abort(format!("extra index {extra} of hint {hint} is not cached"))
            })?;
            xor_into(&mut value, &entry.value);
        }
        Ok(value)
    }

    /// Refill the pool after `resolve`: promote the next backup homed at the
    /// queried block and cache the recovered record.
    fn replenish(&mut self, params: &Params, index: usize, value: &[u8]) -> Result<()> {
        let hint = self.pool.promote(params.block_of(index), index)?;
        self.cache.insert(
            index,
            CacheEntry {
                value: value.to_vec(),
                promoted: Some(hint),
            },
        );
        Ok(())
    }

    fn apply_update(&mut self, params: &Params, index: usize, delta: &[u8]) {
        let block = params.block_of(index);
        let offset = params.offset_in_block(index);
        for hint in self.oracles[block].inverse(offset as u64) {
            self.pool.fold(hint as usize, block, delta);
        }
        if let Some(entry) = self.cache.get_mut(&index) {
            if let Some(hint) = entry.promoted {
                self.pool.apply_extra_delta(hint, index, &entry.value, delta);
            }
            xor_into(&mut entry.value, delta);
        }
    }
}

pub struct Client<O = Iprf> {
    params: Params,
    rng: ChaCha20Rng,
    state: Option<EpochState<O>>,
    queries_in_epoch: usize,
    epoch: u64,
}

impl Client {
    /// Client using the AES-based `Iprf` oracle. `seed` drives the per-epoch
    /// oracle keys.
    pub fn new(params: Params, seed: [u8; 32]) -> Self {
        Self::with_oracle(params, seed)
    }
}

impl<O: HintOracle> Client<O> {
    pub fn with_oracle(params: Params, seed: [u8; 32]) -> Self {
        Self {
            params,
            rng: ChaCha20Rng::from_seed(seed),
            state: None,
            queries_in_epoch: 0,
            epoch: 0,
        }
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    /// Completed preprocessing passes.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Real (non-cached) queries since the last preprocessing pass.
    pub fn queries_in_epoch(&self) -> usize {
        self.queries_in_epoch
    }

    pub fn num_cached_entries(&self) -> usize {
        self.state.as_ref().map_or(0, |s| s.cache.len())
    }

    pub fn remaining_backup_hints(&self) -> usize {
        self.state.as_ref().map_or(0, |s| s.pool.remaining_backups())
    }

    pub fn cached(&self, index: usize) -> Option<&[u8]> {
        self.state
            .as_ref()
            .and_then(|s| s.cache.get(&index))
            .map(|e| e.value.as_slice())
    }

    /// Receive the streamed database and build a fresh epoch. The previous
    /// pool and cache stay in place until the last block has been folded.
    pub fn preprocess<C: Channel>(&mut self, chan: &mut C) -> Result<()> {
        let params = &self.params;
        let mut epoch_seed = [0u8; 32];
        self.rng.fill_bytes(&mut epoch_seed);

        let oracles: Vec<O> = derive_block_keys(&epoch_seed, params.num_blocks)
            .into_iter()
            .map(|key| {
                O::new(
                    key,
                    params.num_total_hints() as u64,
                    params.block_size as u64,
                )
            })
            .collect();
        let mut next = EpochState {
            oracles,
            pool: HintPool::new(params),
            cache: HashMap::new(),
        };

        for block in 0..params.num_blocks {
            let payload = chan.receive(Tag::Block)?;
            if payload.len() != params.block_bytes() {
                return Err(PirError::abort(format!(
                    "block {block} has {} bytes, expected {}",
                    payload.len(),
                    params.block_bytes()
                )));
            }
            next.fold_block(params, block, &payload);
            chan.send(Tag::Ack, Vec::new())?;
        }

        let cached = next.cache.len();
        self.state = Some(next);
        self.queries_in_epoch = 0;
        self.epoch += 1;
        info!(epoch = self.epoch, cached, "preprocessing complete");
        Ok(())
    }

    /// Read a batch of indices. Every item puts exactly one message on the
    /// wire: offsets for a real query, empty for a cache hit. If the batch
    /// pushes the epoch past its budget, the client asks the server for a new
    /// stream and preprocesses again before returning.
    pub fn query<C: Channel>(&mut self, chan: &mut C, indices: &[usize]) -> Result<Vec<Vec<u8>>> {
        for &index in indices {
            self.params.check_index(index)?;
        }
        let params = &self.params;
        let state = self.state.as_mut().ok_or(PirError::NotPreprocessed)?;

        let mut values = Vec::with_capacity(indices.len());
        let mut real = 0usize;
        for &index in indices {
            let hit = state.cache.get(&index).map(|e| e.value.clone());
            let value = match hit {
                Some(value) => {
                    chan.send(Tag::Query, Vec::new())?;
                    if !chan.receive(Tag::Answer)?.is_empty() {
                        return Err(PirError::abort("non-empty answer to a no-op query"));
                    }
                    value
                }
                None => {
                    let value = state.resolve(params, chan, index)?;
                    state.replenish(params, index, &value)?;
                    real += 1;
                    value
                }
            };
            values.push(value);
        }

        self.queries_in_epoch += real;
        let refresh = self.queries_in_epoch > self.params.query_budget;
        chan.send(Tag::Refresh, encode_refresh(refresh))?;
        debug!(
            batch = indices.len(),
            real,
            spent = self.queries_in_epoch,
            "batch resolved"
        );
        if refresh {
            info!(
                epoch = self.epoch,
                budget = self.params.query_budget,
                "query budget exhausted, refreshing"
            );
            self.preprocess(chan)?;
        }
        Ok(values)
    }

    /// Block until the server pushes one update, then apply it.
    pub fn sync_update<C: Channel>(&mut self, chan: &mut C) -> Result<usize> {
        let payload = chan.receive(Tag::Update)?;
        let (index, delta) = decode_update(&self.params, &payload)?;
        self.apply_update(index, &delta)?;
        Ok(index)
    }

    /// Fold `delta = old ^ new` for `index` into every hint and cache entry
    /// that holds the record.
    pub fn apply_update(&mut self, index: usize, delta: &[u8]) -> Result<()> {
        self.params.check_index(index)?;
        self.params.check_entry(delta)?;
        let state = self.state.as_mut().ok_or(PirError::NotPreprocessed)?;
        state.apply_update(&self.params, index, delta);
        debug!(index, "update applied");
        Ok(())
    }
}
