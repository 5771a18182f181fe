//! Server side of a session: streams the database for preprocessing, answers
//! punctured queries, and pushes write deltas to the client.
//!
//! The server keeps no epoch state of its own. It learns about refreshes from
//! the control byte the client sends after every batch.

use crate::channel::{Channel, Tag};
use crate::error::{PirError, Result};
use crate::messages::{decode_offsets, decode_refresh, encode_update, xor_into};
use crate::params::Params;
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;
use tracing::{debug, info};

pub struct Server {
    params: Params,
    /// `w * m̄` records, flat; positions `>= N` hold random filler.
    database: Vec<u8>,
}

impl Server {
    /// `records` is the flat `N * L` byte database. `filler_seed` keys the
    /// uniform padding records.
    pub fn new(params: Params, records: &[u8], filler_seed: [u8; 32]) -> Result<Self> {
        if records.len() != params.num_entries * params.entry_size {
            return Err(PirError::InvalidParams(
                "records length must equal num_entries * entry_size",
            ));
        }
        let mut database = records.to_vec();
        database.resize(params.padded_entries() * params.entry_size, 0);
        let mut rng = ChaCha20Rng::from_seed(filler_seed);
        rng.fill_bytes(&mut database[records.len()..]);
        Ok(Self { params, database })
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    /// Current value of a real record.
    pub fn record(&self, index: usize) -> Option<&[u8]> {
        (index < self.params.num_entries).then(|| self.entry_at(index))
    }

    #[inline]
    pub(crate) fn entry_at(&self, index: usize) -> &[u8] {
        let start = index * self.params.entry_size;
        &self.database[start..start + self.params.entry_size]
    }

    #[inline]
    fn entry(&self, block: usize, offset: usize) -> &[u8] {
        self.entry_at(self.params.index_of(block, offset))
    }

    /// Stream the padded database one block at a time, waiting for an empty
    /// acknowledgement after each.
    pub fn preprocess<C: Channel>(&self, chan: &mut C) -> Result<()> {
        let block_bytes = self.params.block_bytes();
        for (block, chunk) in self.database.chunks_exact(block_bytes).enumerate() {
            chan.send(Tag::Block, chunk.to_vec())?;
            let ack = chan.receive(Tag::Ack)?;
            if !ack.is_empty() {
                return Err(PirError::abort(format!(
                    "non-empty acknowledgement for block {block}"
                )));
            }
        }
        info!(
            blocks = self.params.num_blocks,
            block_size = self.params.block_size,
            "database streamed"
        );
        Ok(())
    }

    /// All `m̄` candidate parities for a punctured offset vector, concatenated.
    ///
    /// Candidate `j` assumes block `j` is the missing one: blocks before `j`
    /// take `offsets[k]`, blocks after take `offsets[k - 1]`. One running
    /// accumulator slides the hypothesis, so the cost is `2 * m̄` XORs.
    pub fn answer(&self, offsets: &[usize]) -> Vec<u8> {
        let blocks = self.params.num_blocks;
        debug_assert_eq!(offsets.len(), blocks - 1);

        let mut out = Vec::with_capacity(self.params.answer_bytes());
        let mut acc = vec![0u8; self.params.entry_size];
        for block in 1..blocks {
            xor_into(&mut acc, self.entry(block, offsets[block - 1]));
        }
        out.extend_from_slice(&acc);
        for j in 0..blocks - 1 {
            xor_into(&mut acc, self.entry(j, offsets[j]));
            xor_into(&mut acc, self.entry(j + 1, offsets[j]));
            out.extend_from_slice(&acc);
        }
        out
    }

    /// Answer one batch item. Empty requests get an empty reply.
    pub fn respond<C: Channel>(&self, chan: &mut C) -> Result<()> {
        let request = chan.receive(Tag::Query)?;
        if request.is_empty() {
            return chan.send(Tag::Answer, Vec::new());
        }
        let offsets = decode_offsets(&self.params, &request)?;
        chan.send(Tag::Answer, self.answer(&offsets))
    }

    /// Serve `batch_len` items, then read the client's control byte and
    /// re-stream the database if it asks for a refresh. Returns whether a
    /// refresh ran.
    pub fn respond_batch<C: Channel>(&self, chan: &mut C, batch_len: usize) -> Result<bool> {
        for _ in 0..batch_len {
            self.respond(chan)?;
        }
        let refresh = decode_refresh(&chan.receive(Tag::Refresh)?)?;
        debug!(batch_len, refresh, "batch served");
        if refresh {
            self.preprocess(chan)?;
        }
        Ok(refresh)
    }

    /// Overwrite `index` with `value` and push `(index, old ^ value)` to the
    /// client. Returns the delta.
    pub fn update<C: Channel>(
        &mut self,
        chan: &mut C,
        index: usize,
        value: &[u8],
    ) -> Result<Vec<u8>> {
        self.params.check_index(index)?;
        self.params.check_entry(value)?;

        let start = index * self.params.entry_size;
        let slot = &mut self.database[start..start + self.params.entry_size];
        let mut delta = slot.to_vec();
        xor_into(&mut delta, value);
        slot.copy_from_slice(value);

        chan.send(Tag::Update, encode_update(index, &delta))?;
        debug!(index, "update pushed");
        Ok(delta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::MemoryChannel;
    use crate::messages::encode_offsets;

    fn db(params: &Params) -> Vec<u8> {
        (0..params.num_entries * params.entry_size)
            .map(|i| (i * 7 + 3) as u8)
            .collect()
    }

    fn server(n: usize) -> Server {
        let params = Params::new(n, 4, None).unwrap();
        let records = db(&params);
        Server::new(params, &records, [1u8; 32]).unwrap()
    }

    /// Parity over all blocks except `missing`, straight from the definition.
    fn naive_candidate(server: &Server, offsets: &[usize], missing: usize) -> Vec<u8> {
        let mut acc = vec![0u8; server.params.entry_size];
        let mut next = offsets.iter();
        for block in 0..server.params.num_blocks {
            if block == missing {
                continue;
            }
            xor_into(&mut acc, server.entry(block, *next.next().unwrap()));
        }
        acc
    }

    #[test]
    fn incremental_candidates_match_definition() {
        let server = server(90);
        let p = server.params().clone();
        let offsets: Vec<usize> = (0..p.num_blocks - 1).map(|k| (k * 5 + 1) % p.block_size).collect();
        let answer = server.answer(&offsets);
        assert_eq!(answer.len(), p.answer_bytes());
        for (missing, chunk) in answer.chunks_exact(p.entry_size).enumerate() {
            assert_eq!(chunk, naive_candidate(&server, &offsets, missing), "candidate {missing}");
        }
    }

    #[test]
    fn padding_is_filled_and_hidden() {
        let server = server(85);
        let p = server.params();
        assert_eq!(p.padded_entries(), 90);
        assert!(server.record(84).is_some());
        assert!(server.record(85).is_none());
        let tail = &server.database[85 * 4..];
        assert_eq!(tail.len(), 5 * 4);
        assert!(tail.iter().any(|&b| b != 0), "filler should be random");
    }

    #[test]
    fn rejects_wrong_database_length() {
        let params = Params::new(10, 4, None).unwrap();
        assert!(matches!(
            Server::new(params, &[0u8; 39], [0u8; 32]),
            Err(PirError::InvalidParams(_))
        ));
    }

    #[test]
    fn respond_handles_noop_and_malformed() {
        let server = server(50);
        let p = server.params().clone();
        let (mut client, mut srv) = MemoryChannel::pair();

        client.send(Tag::Query, Vec::new()).unwrap();
        server.respond(&mut srv).unwrap();
        assert!(client.receive(Tag::Answer).unwrap().is_empty());

        client.send(Tag::Query, encode_offsets(&vec![0; p.num_blocks - 1])).unwrap();
        server.respond(&mut srv).unwrap();
        assert_eq!(client.receive(Tag::Answer).unwrap().len(), p.answer_bytes());

        client.send(Tag::Query, vec![0u8; 3]).unwrap();
        assert!(matches!(server.respond(&mut srv), Err(PirError::Abort(_))));
    }

    #[test]
    fn update_sends_xor_delta() {
        let mut server = server(20);
        let (mut client, mut srv) = MemoryChannel::pair();
        let old = server.record(7).unwrap().to_vec();
        let new = vec![0xab; 4];
        let delta = server.update(&mut srv, 7, &new).unwrap();
        assert_eq!(server.record(7).unwrap(), &new[..]);
        let expected: Vec<u8> = old.iter().zip(&new).map(|(a, b)| a ^ b).collect();
        assert_eq!(delta, expected);
        assert_eq!(client.receive(Tag::Update).unwrap(), encode_update(7, &expected));
        assert!(server.update(&mut srv, 20, &new).is_err());
        assert!(server.update(&mut srv, 0, &[1, 2]).is_err());
    }
}
